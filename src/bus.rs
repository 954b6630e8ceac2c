//! In-process publish-subscribe hub local to one interactive [`crate::job::Job`].
//!
//! Topics: `stdout`, `stderr`, `stage`, `exit` (published by the Job) and
//! `stdin`, `signal` (published by whatever transport is attached, consumed
//! by the Job). Delivery is synchronous within a single consumer; a
//! subscriber added after an event was published simply never sees it.
//! `tokio::sync::broadcast` gives us exactly that for free.

use nix::sys::signal::Signal;
use tokio::sync::broadcast;

/// Which phase an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Compile,
    Run,
}

/// A message flowing over the bus, in either direction.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Published by the Job at phase entry.
    Stage(Stage),
    /// Published by the Job as it drains the phase's stdout.
    Stdout(Vec<u8>),
    /// Published by the Job as it drains the phase's stderr.
    Stderr(Vec<u8>),
    /// Published by the Job when a phase completes.
    Exit {
        stage: Stage,
        exit_code: Option<i64>,
        signal: Option<String>,
    },
    /// Published by the transport adapter; consumed by the Job as run-phase
    /// stdin.
    Stdin(Vec<u8>),
    /// Published by the transport adapter; forwarded by the Job to the
    /// Supervisor of the currently-running phase.
    Signal(Signal),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> EventBus {
        // Small bounded history: a slow subscriber that falls behind by more
        // than this many events starts missing them (`RecvError::Lagged`),
        // which is an acceptable trade-off for a single in-process hub.
        let (sender, _) = broadcast::channel(256);
        EventBus { sender }
    }

    pub fn publish(&self, event: BusEvent) {
        // No subscribers is not an error: a batch-mode Job never subscribes.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}
