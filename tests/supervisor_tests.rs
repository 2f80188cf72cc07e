/// Supervisor loop driven through a manual interrupt source
use nsbox::executor::{Launcher, StreamPolicy};
use nsbox::signals::ManualInterrupt;
use nsbox::supervisor::{Supervisor, SupervisorState};
use nsbox::types::{IsolationSet, LaunchRequest, NsboxError, SupervisorConfig, WatchMode};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn quiet() -> Launcher {
    Launcher::new().with_streams(StreamPolicy::Null)
}

fn sh(script: &str) -> LaunchRequest {
    LaunchRequest::new("sh")
        .with_args(["-c", script])
        .with_isolation(IsolationSet::empty())
}

fn watch(interval: Duration) -> SupervisorConfig {
    SupervisorConfig {
        mode: WatchMode::Watch,
        interval,
    }
}

#[test]
fn test_single_mode_success() {
    let source = ManualInterrupt::new();
    let mut supervisor = Supervisor::new(quiet(), source.clone(), SupervisorConfig::default());
    supervisor.run(&sh("exit 0")).expect("exit 0 is success");

    let stats = supervisor.stats();
    assert_eq!(stats.launches, 1);
    assert_eq!(stats.armed, 1);
    assert_eq!(stats.torn_down, 1);
    assert_eq!(source.subscribers(), 0);
}

#[test]
fn test_single_mode_failure_carries_code() {
    let mut supervisor = Supervisor::new(quiet(), ManualInterrupt::new(), SupervisorConfig::default());
    let err = supervisor.run(&sh("exit 42")).unwrap_err();
    assert!(matches!(err, NsboxError::ChildNonZeroExit { code: 42 }));
    assert_eq!(err.exit_code(), 42);
}

#[test]
fn test_single_mode_launch_failure() {
    let mut supervisor = Supervisor::new(quiet(), ManualInterrupt::new(), SupervisorConfig::default());
    let err = supervisor.run(&LaunchRequest::new("")).unwrap_err();
    assert!(matches!(err, NsboxError::Launch(_)));
    assert_eq!(err.exit_code(), 1);
    assert_eq!(supervisor.stats().torn_down, 1);
}

#[test]
fn test_watch_stops_when_interrupted_during_second_sleep() {
    let source = ManualInterrupt::new();
    let trigger = source.clone();
    let mut sleeps = 0;

    let mut supervisor = Supervisor::new(quiet(), source.clone(), watch(Duration::from_millis(200)))
        .with_observer(move |state| {
            if state == SupervisorState::Sleeping {
                sleeps += 1;
                if sleeps == 2 {
                    trigger.interrupt();
                }
            }
        });
    supervisor.run(&sh("exit 0")).expect("watch ends cleanly on interrupt");

    let stats = supervisor.stats();
    assert_eq!(stats.launches, 2);
    assert_eq!(stats.armed, 2);
    assert_eq!(stats.torn_down, stats.armed);
    assert_eq!(source.subscribers(), 0);
}

#[test]
fn test_watch_keeps_going_after_failed_launch() {
    let source = ManualInterrupt::new();
    let trigger = source.clone();
    let mut completed = 0;

    let mut supervisor = Supervisor::new(quiet(), source.clone(), watch(Duration::from_millis(10)))
        .with_observer(move |state| {
            if state == SupervisorState::Completed {
                completed += 1;
                if completed == 2 {
                    trigger.interrupt();
                }
            }
        });
    supervisor
        .run(&LaunchRequest::new("/nonexistent/nsbox-test-binary").with_isolation(IsolationSet::empty()))
        .expect("failures do not end the watch loop");

    assert_eq!(supervisor.stats().launches, 2);
    assert_eq!(supervisor.stats().torn_down, 2);
}

#[test]
fn test_interrupt_does_not_kill_running_child() {
    let source = ManualInterrupt::new();
    let trigger = source.clone();
    let states = Arc::new(Mutex::new(Vec::new()));
    let seen = states.clone();

    let mut supervisor = Supervisor::new(quiet(), source, SupervisorConfig::default())
        .with_observer(move |state| {
            seen.lock().unwrap().push(state);
            if state == SupervisorState::Running {
                trigger.interrupt();
            }
        });
    let err = supervisor.run(&sh("sleep 0.3; exit 7")).unwrap_err();

    // The child ran to its own exit despite the interrupt
    assert!(matches!(err, NsboxError::ChildNonZeroExit { code: 7 }));
    assert_eq!(states.lock().unwrap().last(), Some(&SupervisorState::Interrupted));
}

#[test]
fn test_interrupt_during_watch_launch_skips_sleep() {
    let source = ManualInterrupt::new();
    let trigger = source.clone();
    let states = Arc::new(Mutex::new(Vec::new()));
    let seen = states.clone();

    let mut supervisor = Supervisor::new(quiet(), source, watch(Duration::from_secs(30)))
        .with_observer(move |state| {
            seen.lock().unwrap().push(state);
            if state == SupervisorState::Running {
                trigger.interrupt();
            }
        });
    supervisor.run(&sh("sleep 0.2")).expect("interrupt ends the watch");

    assert_eq!(supervisor.stats().launches, 1);
    let states = states.lock().unwrap();
    assert!(!states.contains(&SupervisorState::Sleeping));
    assert_eq!(states.last(), Some(&SupervisorState::Interrupted));
}
