//! Background watcher for destination surface resizes
//!
//! The watcher thread polls the surface extent and compares it with the
//! extent of the live swapchain. On a mismatch it sends an
//! [`ExtentRequest`] to the frame loop and blocks until the loop has
//! rebuilt the swapchain and acknowledged the request.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::geometry::Extent;

/// Extent of the current swapchain, shared with the watcher
#[derive(Debug, Clone, Default)]
pub struct SharedExtent(Arc<Mutex<Extent>>);

impl SharedExtent {
    pub fn new(extent: Extent) -> Self {
        Self(Arc::new(Mutex::new(extent)))
    }

    pub fn get(&self) -> Extent {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, extent: Extent) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = extent;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandshakeState {
    #[default]
    Idle,
    /// A request arrived and the loop was invalidated
    Requested,
    /// The swapchain was rebuilt, acknowledgement pending
    Applied,
}

#[derive(Debug)]
pub struct ExtentRequest {
    extent: Extent,
    ack: SyncSender<Extent>,
}

impl ExtentRequest {
    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Release the watcher with the extent that is now in use
    pub fn acknowledge(self, applied: Extent) {
        // The watcher may already be gone
        let _ = self.ack.send(applied);
    }
}

/// Loop-side bookkeeping of one request at a time
#[derive(Debug, Default)]
pub struct Handshake {
    state: HandshakeState,
    pending: Option<ExtentRequest>,
}

impl Handshake {
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn begin(&mut self, request: ExtentRequest) {
        if let Some(previous) = self.pending.take() {
            let extent = previous.extent;
            previous.acknowledge(extent);
        }
        log::debug!(
            "surface resized to {}x{}, rebuild requested",
            request.extent.width,
            request.extent.height
        );
        self.pending = Some(request);
        self.state = HandshakeState::Requested;
    }

    /// Drop the pending request unanswered, releasing a watcher blocked on
    /// its ack. Used on teardown.
    pub fn cancel(&mut self) {
        if self.pending.take().is_some() {
            log::debug!("dropping unacknowledged extent request");
        }
        self.state = HandshakeState::Idle;
    }

    /// Called after every successful rebuild
    pub fn mark_applied(&mut self) {
        if self.state == HandshakeState::Requested {
            self.state = HandshakeState::Applied;
        }
    }

    /// Acknowledge an applied request. Returns false if none was applied.
    pub fn finish(&mut self, applied: Extent) -> bool {
        if self.state != HandshakeState::Applied {
            return false;
        }
        if let Some(request) = self.pending.take() {
            request.acknowledge(applied);
        }
        self.state = HandshakeState::Idle;
        true
    }
}

pub struct ExtentWatcher {
    requests: Option<Receiver<ExtentRequest>>,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ExtentWatcher {
    /// Start polling `probe` every `interval`. A probe returning `None`
    /// means the surface has no fixed extent right now.
    pub fn spawn<P>(interval: Duration, shared: SharedExtent, mut probe: P) -> Self
    where
        P: FnMut() -> Option<Extent> + Send + 'static,
    {
        let (request_tx, request_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break,
            }

            let Some(extent) = probe() else { continue };
            if extent.is_empty() || extent == shared.get() {
                continue;
            }

            let (ack_tx, ack_rx) = mpsc::sync_channel(1);
            let request = ExtentRequest {
                extent,
                ack: ack_tx,
            };
            if request_tx.send(request).is_err() {
                break;
            }
            match ack_rx.recv() {
                Ok(applied) => log::debug!(
                    "extent {}x{} acknowledged",
                    applied.width,
                    applied.height
                ),
                // Request dropped without an answer, the loop is shutting down
                Err(_) => break,
            }
        });

        Self {
            requests: Some(request_rx),
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Pending request, if any. Never blocks.
    pub fn poll(&self) -> Option<ExtentRequest> {
        self.requests.as_ref()?.try_recv().ok()
    }

    pub fn stop(&mut self) {
        self.stop.take();
        // Dropping queued requests releases a watcher blocked on an ack
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("extent watcher thread panicked");
            }
        }
    }
}

impl Drop for ExtentWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
