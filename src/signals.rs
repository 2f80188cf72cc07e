/// Interrupt delivery for the supervisor
///
/// The platform mechanism (SIGINT) is only known to this module. The
/// supervisor sees interrupts as messages on a subscription channel.
use crate::types::Result;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};
use nix::sys::signal::{SigSet, Signal};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

/// Something that can deliver interrupt notifications
pub trait InterruptSource {
    /// Register a listener. Interrupts delivered after this returns are
    /// buffered in the subscription until received.
    fn subscribe(&self) -> Result<Subscription>;
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<u64, Sender<()>>,
    /// An interrupt arrived while nobody was listening
    pending: bool,
}

#[derive(Clone, Default)]
struct Subscribers(Arc<Mutex<Registry>>);

impl Subscribers {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn subscribe(&self) -> Subscription {
        let (sender, receiver) = bounded(1);
        let mut registry = self.lock();
        if registry.pending {
            registry.pending = false;
            let _ = sender.try_send(());
        }
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.insert(id, sender);

        Subscription {
            id,
            receiver,
            subscribers: self.clone(),
        }
    }

    /// Notify every listener; returns how many were registered
    fn broadcast(&self) -> usize {
        let mut registry = self.lock();
        if registry.listeners.is_empty() {
            registry.pending = true;
            return 0;
        }
        for sender in registry.listeners.values() {
            // A full channel already holds an undelivered interrupt
            let _ = sender.try_send(());
        }
        registry.listeners.len()
    }

    /// An interrupt still queued for a departing listener is kept for the
    /// next one
    fn unsubscribe(&self, id: u64, receiver: &Receiver<()>) {
        let mut registry = self.lock();
        registry.listeners.remove(&id);
        if receiver.try_recv().is_ok() {
            registry.pending = true;
        }
    }

    fn len(&self) -> usize {
        self.lock().listeners.len()
    }
}

/// A registered interrupt listener; unregisters itself on drop
pub struct Subscription {
    id: u64,
    receiver: Receiver<()>,
    subscribers: Subscribers,
}

impl Subscription {
    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.unsubscribe(self.id, &self.receiver);
    }
}

/// SIGINT delivered through a dedicated `sigwait` thread
#[derive(Clone)]
pub struct SigintSource {
    subscribers: Subscribers,
}

impl SigintSource {
    /// Block SIGINT and start the thread that waits for it.
    ///
    /// Must run before any other thread is spawned: threads inherit the
    /// signal mask, and a thread with SIGINT unblocked would receive the
    /// default action instead. Spawned children get an empty mask from the
    /// standard library, so Ctrl+C still reaches them.
    pub fn install() -> Result<Self> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.thread_block()?;

        let subscribers = Subscribers::default();
        let pump = subscribers.clone();
        thread::Builder::new()
            .name("nsbox-sigint".to_string())
            .spawn(move || loop {
                match mask.wait() {
                    Ok(signal) => {
                        let notified = pump.broadcast();
                        debug!("received {}, notified {} listener(s)", signal.as_str(), notified);
                    }
                    Err(e) => {
                        warn!("sigwait failed, interrupts will be ignored: {}", e);
                        break;
                    }
                }
            })?;

        Ok(Self { subscribers })
    }
}

impl InterruptSource for SigintSource {
    fn subscribe(&self) -> Result<Subscription> {
        Ok(self.subscribers.subscribe())
    }
}

/// In-process interrupt source, triggered by calling `interrupt`
#[derive(Clone, Default)]
pub struct ManualInterrupt {
    subscribers: Subscribers,
}

impl ManualInterrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one interrupt; returns the number of listeners notified
    pub fn interrupt(&self) -> usize {
        self.subscribers.broadcast()
    }

    /// Number of live subscriptions
    pub fn subscribers(&self) -> usize {
        self.subscribers.len()
    }
}

impl InterruptSource for ManualInterrupt {
    fn subscribe(&self) -> Result<Subscription> {
        Ok(self.subscribers.subscribe())
    }
}
