//! Outbound notification surface
//!
//! Connections report state changes, connect failures and timeouts,
//! request results that have no callback attached, and peripheral-initiated
//! value changes to an `EventSink`. Request callbacks are run according to
//! the `Dispatch` mode chosen when they were registered.

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};

use crate::ble::gatt::CharacteristicId;
use crate::connection::request::{RequestFailure, RequestSuccess};
use crate::connection::{ConnectionState, Device};

/// Why a connection gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectFailReason {
    /// The address was not a valid `XX:XX:XX:XX:XX:XX` string.
    UnspecifiedAddress,
    /// Reconnect attempts exhausted.
    MaximumReconnection,
}

/// Which stage a connect attempt was stuck in when it timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutKind {
    /// Still scanning for the peripheral.
    DeviceNotFound,
    /// Link never came up.
    LinkNotEstablished,
    /// Link is up but discovery never finished.
    ServicesNotDiscovered,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged {
        device: Device,
        state: ConnectionState,
    },
    ConnectFailed {
        device: Option<Device>,
        reason: ConnectFailReason,
    },
    ConnectTimeout {
        device: Device,
        kind: TimeoutKind,
    },
    RequestSucceeded {
        device: Device,
        request_id: String,
        success: RequestSuccess,
    },
    RequestFailed {
        device: Device,
        failure: RequestFailure,
    },
    CharacteristicChanged {
        device: Device,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
}

/// Receives connection notifications. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ConnectionEvent);
}

/// Fans events out to any number of broadcast subscribers.
pub struct BroadcastSink {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl EventSink for mpsc::UnboundedSender<ConnectionEvent> {
    fn emit(&self, event: ConnectionEvent) {
        let _ = self.send(event);
    }
}

/// Where a request callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// On the connection's own task, before the next request starts.
    #[default]
    Immediate,
    /// On tokio's blocking pool.
    Background,
    /// Queued to the application's `MainContext`.
    MainContext,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A queue of callbacks the application drains from a thread of its
/// choosing, typically its UI or event loop.
pub struct MainContext {
    tx: mpsc::UnboundedSender<Job>,
    rx: mpsc::UnboundedReceiver<Job>,
}

impl Default for MainContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MainContext {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn handle(&self) -> MainContextHandle {
        MainContextHandle {
            tx: self.tx.clone(),
        }
    }

    /// Run every callback queued so far. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Wait for the next callback and run it.
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct MainContextHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl MainContextHandle {
    fn post(&self, job: Job) -> Result<(), Job> {
        self.tx.send(job).map_err(|e| e.0)
    }
}

/// Runs callbacks according to their `Dispatch` mode.
///
/// Background callbacks go to the blocking pool of the runtime the
/// dispatcher was created on, so `run` is safe to call from threads that
/// are not part of any runtime.
#[derive(Clone, Default)]
pub(crate) struct Dispatcher {
    main: Option<MainContextHandle>,
    runtime: Option<Handle>,
}

impl Dispatcher {
    pub(crate) fn new(main: Option<MainContextHandle>) -> Self {
        Self {
            main,
            runtime: Handle::try_current().ok(),
        }
    }

    pub(crate) fn run(&self, dispatch: Dispatch, job: impl FnOnce() + Send + 'static) {
        match dispatch {
            Dispatch::Immediate => job(),
            Dispatch::Background => {
                match self.runtime.clone().or_else(|| Handle::try_current().ok()) {
                    Some(runtime) => {
                        runtime.spawn_blocking(job);
                    }
                    None => {
                        log::warn!("no runtime for background callback, running it immediately");
                        job();
                    }
                }
            }
            Dispatch::MainContext => match &self.main {
                Some(main) => {
                    if let Err(job) = main.post(Box::new(job)) {
                        log::warn!("main context is gone, running callback immediately");
                        job();
                    }
                }
                None => {
                    log::warn!("no main context registered, running callback immediately");
                    job();
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_main_context_defers_until_drained() {
        let mut main = MainContext::new();
        let dispatcher = Dispatcher::new(Some(main.handle()));
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            dispatcher.run(Dispatch::MainContext, move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(main.run_pending(), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_missing_main_context_runs_immediately() {
        let dispatcher = Dispatcher::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        dispatcher.run(Dispatch::MainContext, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_background_without_runtime_runs_inline() {
        let dispatcher = Dispatcher::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        dispatcher.run(Dispatch::Background, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_background_from_foreign_thread_uses_owning_runtime() {
        let dispatcher = Dispatcher::new(None);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let caller = std::thread::spawn(move || {
            dispatcher.run(Dispatch::Background, move || {
                let _ = tx.send(std::thread::current().id());
            });
            std::thread::current().id()
        })
        .join()
        .unwrap();
        let worker = rx.await.unwrap();
        assert_ne!(worker, caller);
    }

    #[tokio::test]
    async fn test_background_dispatch() {
        let dispatcher = Dispatcher::default();
        let (tx, rx) = tokio::sync::oneshot::channel();
        dispatcher.run(Dispatch::Background, move || {
            let _ = tx.send(std::thread::current().id());
        });
        let worker = rx.await.unwrap();
        assert_ne!(worker, std::thread::current().id());
    }
}
