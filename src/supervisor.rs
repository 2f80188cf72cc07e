/// Launch supervision: cancellation lifecycle and the watch loop
use crate::cancel::CancellationToken;
use crate::executor::Launch;
use crate::signals::{InterruptSource, Subscription};
use crate::types::{LaunchRequest, Result, SupervisorConfig, WatchMode};
use crossbeam_channel::select;
use log::{debug, error, info};
use std::thread::{self, JoinHandle};

/// Where the supervisor is in one iteration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    /// Between iterations, nothing armed
    Idle,
    /// Cancellation token created and interrupt listener running
    Armed,
    /// Launch in progress
    Running,
    /// Launch returned without an interrupt
    Completed,
    /// Waiting out the watch interval
    Sleeping,
    /// An interrupt was observed; no further iteration follows
    Interrupted,
}

/// Counters over the supervisor's lifetime
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub armed: u64,
    pub torn_down: u64,
    pub launches: u64,
}

type Observer = Box<dyn FnMut(SupervisorState) + Send>;

/// One armed iteration. Dropping it tears it down.
struct Armed {
    token: CancellationToken,
    listener: Option<JoinHandle<bool>>,
}

impl Armed {
    /// Cancel the token and join the listener; true if it saw an interrupt
    fn release(&mut self) -> bool {
        self.token.cancel();
        match self.listener.take() {
            Some(handle) => handle.join().unwrap_or(false),
            None => false,
        }
    }
}

impl Drop for Armed {
    fn drop(&mut self) {
        self.release();
    }
}

/// Wait for an interrupt or for the token; cancels the token on interrupt.
/// Returns true if an interrupt was received before teardown finished.
fn listen(subscription: Subscription, token: CancellationToken) -> bool {
    let done = token.done();
    select! {
        recv(subscription.receiver()) -> _ => {
            token.cancel();
            true
        }
        recv(done) -> _ => subscription.receiver().try_recv().is_ok(),
    }
}

/// Runs launch requests under a cancellation context
pub struct Supervisor<L, S> {
    launcher: L,
    interrupts: S,
    config: SupervisorConfig,
    stats: SupervisorStats,
    observer: Option<Observer>,
}

impl<L: Launch, S: InterruptSource> Supervisor<L, S> {
    pub fn new(launcher: L, interrupts: S, config: SupervisorConfig) -> Self {
        Self {
            launcher,
            interrupts,
            config,
            stats: SupervisorStats::default(),
            observer: None,
        }
    }

    /// Call `observer` on every state transition
    pub fn with_observer(mut self, observer: impl FnMut(SupervisorState) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats
    }

    fn transition(&mut self, state: SupervisorState) {
        debug!("supervisor state: {:?}", state);
        if let Some(observer) = self.observer.as_mut() {
            observer(state);
        }
    }

    /// Idle -> Armed. The subscription exists before this returns, so no
    /// interrupt delivered afterwards can be missed. An interrupt that came
    /// in between iterations cancels the new token before it is returned.
    fn arm(&mut self) -> Result<Armed> {
        let subscription = self.interrupts.subscribe()?;
        let token = CancellationToken::new();

        let listener = if subscription.receiver().try_recv().is_ok() {
            debug!("interrupt arrived between iterations");
            token.cancel();
            None
        } else {
            let listener_token = token.clone();
            Some(
                thread::Builder::new()
                    .name("nsbox-listener".to_string())
                    .spawn(move || listen(subscription, listener_token))?,
            )
        };

        self.stats.armed += 1;
        self.transition(SupervisorState::Armed);
        Ok(Armed { token, listener })
    }

    fn teardown(&mut self, mut armed: Armed) -> bool {
        let interrupted = armed.release();
        self.stats.torn_down += 1;
        interrupted
    }

    /// Run `request` once (single mode) or until interrupted (watch mode)
    pub fn run(&mut self, request: &LaunchRequest) -> Result<()> {
        loop {
            self.transition(SupervisorState::Idle);
            let armed = self.arm()?;

            if armed.token.is_cancelled() {
                self.transition(SupervisorState::Interrupted);
                self.teardown(armed);
                info!(
                    "interrupted after {} launch(es), stopping",
                    self.stats.launches
                );
                return Ok(());
            }

            self.transition(SupervisorState::Running);
            let outcome = self.launcher.launch(request);
            self.stats.launches += 1;

            let cancelled = armed.token.is_cancelled();
            if cancelled {
                self.transition(SupervisorState::Interrupted);
            } else {
                self.transition(SupervisorState::Completed);
            }
            let result = outcome.into_result();

            if self.config.mode == WatchMode::Single {
                self.teardown(armed);
                return result;
            }

            if let Err(e) = &result {
                error!("launch of `{}` failed: {}", request.program, e);
            }

            let mut interrupted = cancelled;
            if !cancelled {
                self.transition(SupervisorState::Sleeping);
                if armed.token.wait_timeout(self.config.interval) {
                    interrupted = true;
                    self.transition(SupervisorState::Interrupted);
                }
            }

            interrupted |= self.teardown(armed);
            if interrupted {
                info!(
                    "interrupted after {} launch(es), stopping watch",
                    self.stats.launches
                );
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::ManualInterrupt;
    use crate::types::{LaunchFailure, LaunchOutcome, NsboxError};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Replays scripted exit codes
    struct Scripted {
        codes: Vec<i32>,
        calls: Arc<AtomicU64>,
    }

    impl Launch for Scripted {
        fn launch(&self, _request: &LaunchRequest) -> LaunchOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.codes.get(call) {
                Some(code) => LaunchOutcome::Exited(*code),
                None => LaunchOutcome::Failed(LaunchFailure::InvalidRequest("script exhausted".into())),
            }
        }
    }

    fn scripted(codes: &[i32]) -> (Scripted, Arc<AtomicU64>) {
        let calls = Arc::new(AtomicU64::new(0));
        (
            Scripted {
                codes: codes.to_vec(),
                calls: calls.clone(),
            },
            calls,
        )
    }

    fn watch(interval: Duration) -> SupervisorConfig {
        SupervisorConfig {
            mode: WatchMode::Watch,
            interval,
        }
    }

    #[test]
    fn test_single_mode_transitions() {
        let (launcher, _) = scripted(&[0]);
        let source = ManualInterrupt::new();
        let states = Arc::new(Mutex::new(Vec::new()));
        let seen = states.clone();

        let mut supervisor = Supervisor::new(launcher, source.clone(), SupervisorConfig::default())
            .with_observer(move |state| seen.lock().unwrap().push(state));
        supervisor.run(&LaunchRequest::new("true")).unwrap();

        assert_eq!(
            *states.lock().unwrap(),
            vec![
                SupervisorState::Idle,
                SupervisorState::Armed,
                SupervisorState::Running,
                SupervisorState::Completed,
            ]
        );
        let stats = supervisor.stats();
        assert_eq!((stats.armed, stats.torn_down, stats.launches), (1, 1, 1));
        assert_eq!(source.subscribers(), 0);
    }

    #[test]
    fn test_single_mode_reports_exit_code() {
        let (launcher, _) = scripted(&[3]);
        let mut supervisor = Supervisor::new(launcher, ManualInterrupt::new(), SupervisorConfig::default());
        let err = supervisor.run(&LaunchRequest::new("false")).unwrap_err();
        assert!(matches!(err, NsboxError::ChildNonZeroExit { code: 3 }));
    }

    #[test]
    fn test_watch_mode_continues_after_failure() {
        let (launcher, calls) = scripted(&[1, 0, 0]);
        let source = ManualInterrupt::new();
        let trigger = source.clone();
        let mut completed = 0;

        let mut supervisor = Supervisor::new(launcher, source.clone(), watch(Duration::from_millis(10)))
            .with_observer(move |state| {
                if state == SupervisorState::Completed {
                    completed += 1;
                    if completed == 3 {
                        trigger.interrupt();
                    }
                }
            });
        supervisor.run(&LaunchRequest::new("flaky")).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stats = supervisor.stats();
        assert_eq!(stats.armed, stats.torn_down);
        assert_eq!(source.subscribers(), 0);
    }

    #[test]
    fn test_interrupt_during_sleep_stops_the_loop() {
        let (launcher, calls) = scripted(&[0, 0, 0, 0]);
        let source = ManualInterrupt::new();
        let trigger = source.clone();
        let mut sleeps = 0;

        // A long interval: the test only finishes quickly if the sleep is
        // cut short by the interrupt
        let mut supervisor = Supervisor::new(launcher, source.clone(), watch(Duration::from_secs(30)))
            .with_observer(move |state| {
                if state == SupervisorState::Sleeping {
                    sleeps += 1;
                    if sleeps == 1 {
                        trigger.interrupt();
                    }
                }
            });
        supervisor.run(&LaunchRequest::new("true")).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.stats().torn_down, 1);
    }

    #[test]
    fn test_interrupt_between_iterations_prevents_next_launch() {
        let (launcher, calls) = scripted(&[0, 0, 0]);
        let source = ManualInterrupt::new();
        let trigger = source.clone();
        let states = Arc::new(Mutex::new(Vec::new()));
        let seen = states.clone();
        let mut idles = 0;

        let mut supervisor = Supervisor::new(launcher, source.clone(), watch(Duration::from_millis(10)))
            .with_observer(move |state| {
                seen.lock().unwrap().push(state);
                if state == SupervisorState::Idle {
                    idles += 1;
                    if idles == 2 {
                        // Nobody is subscribed while idle
                        assert_eq!(trigger.interrupt(), 0);
                    }
                }
            });
        supervisor.run(&LaunchRequest::new("true")).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = supervisor.stats();
        assert_eq!((stats.armed, stats.torn_down, stats.launches), (2, 2, 1));
        assert_eq!(source.subscribers(), 0);

        let states = states.lock().unwrap();
        assert_eq!(states.iter().filter(|s| **s == SupervisorState::Sleeping).count(), 1);
        assert_eq!(
            &states[states.len() - 3..],
            &[
                SupervisorState::Idle,
                SupervisorState::Armed,
                SupervisorState::Interrupted,
            ]
        );
    }
}
