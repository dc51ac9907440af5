//! Event feed: user commands and clock ticks merged into one channel.
//!
//! Commands and ticks arrive in the order they were sent. Nothing is
//! dropped or coalesced; the runtime sees every event.

use crate::event::{EventKind, RuntimeEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct EventFeed {
    sender: Sender<RuntimeEvent>,
    receiver: Receiver<RuntimeEvent>,
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl EventFeed {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver }
    }

    /// Handle for submitting commands
    pub fn sender(&self) -> Sender<RuntimeEvent> {
        self.sender.clone()
    }

    /// Start a ticker feeding this channel
    pub fn start_ticker(&self, interval: Duration) -> Ticker {
        Ticker::spawn(self.sender(), interval)
    }

    /// Receiving end; closes once every sender is gone
    pub fn into_receiver(self) -> Receiver<RuntimeEvent> {
        self.receiver
    }
}

/// Background thread emitting a Tick every interval
pub struct Ticker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn spawn(sender: Sender<RuntimeEvent>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            tracing::debug!("Ticker started ({:?})", interval);
            loop {
                thread::sleep(interval);
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                if sender.send(RuntimeEvent::now(EventKind::Tick)).is_err() {
                    // Receiver gone
                    break;
                }
            }
            tracing::debug!("Ticker stopped");
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop ticking and wait for the thread to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Ticker thread panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
