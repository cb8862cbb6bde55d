//! Session events
//!
//! Asynchronous device notifications surface as a closed set of typed
//! events, produced on the manager's internal thread and delivered in
//! arrival order to the subscriber, marshaled through the external
//! context when one is configured.

use crate::types::ReturnCode;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Handle to a manager-owned in-memory data block produced by a native
/// transfer. The subscriber is responsible for interpreting and
/// releasing it according to the manager's memory contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeMemory {
    pub handle: usize,
}

/// What a completed transfer produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferredData {
    /// An in-memory data handle.
    Memory(NativeMemory),
    /// A file written at the configured path.
    File(PathBuf),
}

/// Raised when the source announces a pending transfer, before any
/// data moves. Subscribers may cancel; the decision is observed
/// before the first leaf transfer call.
#[derive(Debug, Clone)]
pub struct TransferReadyEvent {
    cancel: Arc<AtomicBool>,
}

impl TransferReadyEvent {
    pub(crate) fn new() -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests that the pending transfers be discarded and the
    /// source disabled instead of transferring.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// The closed set of session events.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The source left the enabled state.
    SourceDisabled,
    /// The source asked to be closed (its UI was dismissed, or a
    /// settings-only session finished).
    SourceCloseRequest,
    /// A transfer is pending; cancelable.
    TransferReady(TransferReadyEvent),
    /// One transfer completed.
    DataTransferred(TransferredData),
    /// The source reported a hardware event.
    DeviceEvent,
    /// A transfer-loop operation returned a non-success code.
    TransferError(ReturnCode),
}

/// Subscriber surface for session events.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

impl<F> EventSink for F
where
    F: Fn(SessionEvent) + Send + Sync,
{
    fn on_event(&self, event: SessionEvent) {
        self(event)
    }
}
