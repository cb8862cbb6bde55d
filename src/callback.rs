//! Callback registration and notification routing
//!
//! After a source opens, the session registers a fixed-signature
//! native callback with the manager: the modern record first, then the
//! legacy record exactly once if the manager rejects the modern one.
//! The manager invokes the callback on its internal thread whenever
//! the device raises an event; the router translates each notification
//! into a state transition or a typed session event, in arrival order,
//! and forwards it through the threading bridge.

use crate::entry::{TwCallback, TwCallback2};
use crate::errors::TwainError;
use crate::events::{NativeMemory, SessionEvent, TransferReadyEvent, TransferredData};
use crate::session::SessionInner;
use crate::triplet::Triplet;
use crate::types::{
    Dat, DataGroup, FileFormat, Msg, ReturnCode, State, TwIdentity, TwSetupFileXfer, TwStr255,
};
use std::ffi::c_void;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

/// Routes manager notifications back into the owning session.
///
/// Boxed inside the session so its address is stable; that address is
/// the `ref_con` the manager hands back on every callback invocation.
pub(crate) struct CallbackRouter {
    session: Weak<SessionInner>,
}

impl CallbackRouter {
    pub(crate) fn new(session: Weak<SessionInner>) -> Self {
        Self { session }
    }

    fn handle(&self, raw_msg: u16) -> u16 {
        let inner = match self.session.upgrade() {
            Some(inner) => inner,
            None => return ReturnCode::Failure as u16,
        };
        let msg = match Msg::from_notification(raw_msg) {
            Some(msg) => msg,
            None => {
                log::debug!("ignoring unknown notification 0x{raw_msg:04X}");
                return ReturnCode::Failure as u16;
            }
        };

        match msg {
            Msg::XferReady => {
                inner.set_state(State::TransferReady);
                run_transfer_loop(&inner);
            }
            Msg::CloseDsReq | Msg::CloseDsOk => {
                log::debug!("source requested close ({msg:?})");
                inner.raise_event(SessionEvent::SourceCloseRequest);
                if inner.state() >= State::SourceEnabled {
                    if let Err(e) = inner.disable_current_source() {
                        log::warn!("disable after close request failed: {e}");
                    }
                }
            }
            Msg::DeviceEvent => inner.raise_event(SessionEvent::DeviceEvent),
            Msg::Null => {}
            _ => {}
        }
        ReturnCode::Success as u16
    }
}

/// The registered native entry point. Always invoked by the manager on
/// its internal thread.
pub(crate) extern "C" fn notification_proc(
    ref_con: usize,
    _origin: *const TwIdentity,
    _dg: u32,
    _dat: u16,
    msg: u16,
    _data: *mut c_void,
) -> u16 {
    if ref_con == 0 {
        return ReturnCode::Failure as u16;
    }
    // SAFETY: ref_con is the address of the CallbackRouter boxed in
    // the session; the box outlives every registration because the
    // manager is closed before the session drops.
    let router = unsafe { &*(ref_con as *const CallbackRouter) };
    router.handle(msg)
}

/// Registers the session's callback with the manager for the freshly
/// opened source. Tries the modern record; if the manager reports
/// non-success, queries status and registers the legacy record exactly
/// once. The legacy attempt's result is the registration result.
pub(crate) fn register_callback(inner: &Arc<SessionInner>, source: TwIdentity) -> ReturnCode {
    let ref_con = inner.router_ref_con();

    let record = TwCallback2 {
        callback_proc: notification_proc,
        ref_con,
        message: 0,
    };
    let rc = match inner.call_on_internal(
        Some(source),
        Triplet::control(Dat::Callback2, Msg::RegisterCallback),
        record,
    ) {
        Ok((rc, _)) => rc,
        Err(e) => {
            log::warn!("modern callback registration did not run: {e}");
            ReturnCode::Failure
        }
    };
    if rc == ReturnCode::Success {
        log::debug!("registered modern callback record");
        return rc;
    }

    let condition = inner.status_of(Some(source)).condition();
    log::debug!(
        "modern callback registration failed ({rc:?}, condition {condition:?}); trying legacy record"
    );

    let record = TwCallback {
        callback_proc: notification_proc,
        ref_con,
        message: 0,
    };
    let rc = match inner.call_on_internal(
        Some(source),
        Triplet::control(Dat::Callback, Msg::RegisterCallback),
        record,
    ) {
        Ok((rc, _)) => rc,
        Err(e) => {
            log::warn!("legacy callback registration did not run: {e}");
            ReturnCode::Failure
        }
    };
    match rc {
        ReturnCode::Success => log::debug!("registered legacy callback record"),
        rc => {
            let condition = inner.status_of(Some(source)).condition();
            log::warn!("legacy callback registration failed ({rc:?}, condition {condition:?})");
        }
    }
    rc
}

/// Drives the transfer loop after a transfer-ready notification.
///
/// Each round raises a cancelable `TransferReady` event through the
/// blocking bridge path, performs one leaf transfer (native memory or
/// file, per the session's transfer setup), raises `DataTransferred`,
/// and ends the transfer. Cancellation, the session's stop flag, and
/// failures all discard the remaining transfers and ask the device to
/// disable itself.
fn run_transfer_loop(inner: &Arc<SessionInner>) {
    let source = match inner.current_source() {
        Some(source) => source.identity(),
        None => {
            log::warn!("transfer ready with no open source; ignoring");
            return;
        }
    };

    loop {
        let ready = TransferReadyEvent::new();
        if let Err(e) = inner.raise_event_blocking(SessionEvent::TransferReady(ready.clone())) {
            log::warn!("transfer-ready delivery failed: {e}");
        }
        if ready.is_cancel_requested() || inner.stop_requested() {
            log::debug!("transfer canceled; discarding pending transfers");
            abort_transfers(inner);
            return;
        }

        inner.set_state(State::Transferring);
        let outcome = match inner.file_transfer_setup() {
            Some((path, format)) => transfer_file(inner, source, path, format),
            None => transfer_native(inner, source),
        };
        let data = match outcome {
            Ok(data) => data,
            Err(rc) => {
                inner.raise_event(SessionEvent::TransferError(rc));
                inner.set_state(State::TransferReady);
                abort_transfers(inner);
                return;
            }
        };
        inner.raise_event(SessionEvent::DataTransferred(data));

        let (rc, remaining) = match inner.end_transfer() {
            Ok(result) => result,
            Err(e) => {
                log::warn!("ending transfer failed: {e}");
                return;
            }
        };
        if rc != ReturnCode::Success {
            inner.raise_event(SessionEvent::TransferError(rc));
            abort_transfers(inner);
            return;
        }
        if remaining == 0 {
            // end_transfer already stepped to SourceEnabled.
            if let Err(e) = inner.disable_current_source() {
                log::warn!("disable after final transfer failed: {e}");
            }
            return;
        }
        log::debug!("{remaining} transfers still pending");
    }
}

/// One native in-memory transfer.
fn transfer_native(
    inner: &Arc<SessionInner>,
    source: TwIdentity,
) -> std::result::Result<TransferredData, ReturnCode> {
    let (rc, handle) = inner
        .call_on_internal(
            Some(source),
            Triplet::new(DataGroup::Image, Dat::ImageNativeXfer, Msg::Get),
            0usize,
        )
        .map_err(|e: TwainError| {
            log::warn!("native transfer did not run: {e}");
            ReturnCode::Failure
        })?;
    if rc == ReturnCode::XferDone {
        Ok(TransferredData::Memory(NativeMemory { handle }))
    } else {
        Err(rc)
    }
}

/// One file transfer: point the source at the path, then transfer.
fn transfer_file(
    inner: &Arc<SessionInner>,
    source: TwIdentity,
    path: PathBuf,
    format: FileFormat,
) -> std::result::Result<TransferredData, ReturnCode> {
    let setup = TwSetupFileXfer {
        file_name: TwStr255::new(&path.to_string_lossy()),
        format: format as u16,
        vol_ref_num: 0,
    };
    let (rc, _) = inner
        .call_on_internal(
            Some(source),
            Triplet::control(Dat::SetupFileXfer, Msg::Set),
            setup,
        )
        .map_err(|e: TwainError| {
            log::warn!("file transfer setup did not run: {e}");
            ReturnCode::Failure
        })?;
    if rc != ReturnCode::Success {
        return Err(rc);
    }

    let rc = inner
        .call_empty_on_internal(
            Some(source),
            Triplet::new(DataGroup::Image, Dat::ImageFileXfer, Msg::Get),
        )
        .map_err(|e: TwainError| {
            log::warn!("file transfer did not run: {e}");
            ReturnCode::Failure
        })?;
    if rc == ReturnCode::XferDone {
        Ok(TransferredData::File(path))
    } else {
        Err(rc)
    }
}

/// Discards pending transfers and asks the device to disable itself.
/// The stop flag is consumed: the next enable starts clean.
fn abort_transfers(inner: &Arc<SessionInner>) {
    inner.clear_stop_request();
    match inner.reset_pending() {
        Ok(ReturnCode::Success) => {}
        Ok(rc) => log::warn!("pending-transfer reset returned {rc:?}"),
        Err(e) => log::warn!("pending-transfer reset failed: {e}"),
    }
    if inner.state() == State::SourceEnabled {
        if let Err(e) = inner.disable_current_source() {
            log::warn!("disable after abort failed: {e}");
        }
    }
}
