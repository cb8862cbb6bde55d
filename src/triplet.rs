//! Triplet dispatch
//!
//! Every cross-boundary operation is a (DataGroup, Dat, Msg) address
//! plus a payload. The dispatcher marshals the payload to the native
//! call convention, invokes the single entry point, and hands back the
//! result code. It never retries and never inspects what an operation
//! means; policy lives with the callers.

use crate::entry::NativeEntry;
use crate::errors::TwainError;
use crate::types::{Dat, DataGroup, Msg, ReturnCode, TwIdentity, TwStatus};
use std::ffi::c_void;
use std::fmt;
use std::ptr;
use std::sync::{Arc, Mutex};

/// The address of one protocol operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Triplet {
    pub dg: DataGroup,
    pub dat: Dat,
    pub msg: Msg,
}

impl Triplet {
    pub const fn new(dg: DataGroup, dat: Dat, msg: Msg) -> Self {
        Self { dg, dat, msg }
    }

    /// Shorthand for the control group most operations live in.
    pub const fn control(dat: Dat, msg: Msg) -> Self {
        Self::new(DataGroup::Control, dat, msg)
    }
}

impl fmt::Display for Triplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}/{:?}", self.dg, self.dat, self.msg)
    }
}

/// Marshals triplets onto the native entry point.
///
/// Holds the application identity the manager knows this session by;
/// the manager writes the assigned numeric id back through the origin
/// pointer during the open call, so every dispatch copies the identity
/// out, calls, and stores it back.
pub(crate) struct Dispatcher {
    entry: Arc<dyn NativeEntry>,
    app_identity: Mutex<TwIdentity>,
}

impl Dispatcher {
    pub fn new(entry: Arc<dyn NativeEntry>, app_identity: TwIdentity) -> Self {
        Self {
            entry,
            app_identity: Mutex::new(app_identity),
        }
    }

    pub fn app_identity(&self) -> TwIdentity {
        *self.app_identity.lock().expect("lock poisoned")
    }

    /// Dispatches with a typed payload.
    pub fn dispatch<T>(
        &self,
        dest: Option<&mut TwIdentity>,
        triplet: Triplet,
        payload: &mut T,
    ) -> ReturnCode {
        self.dispatch_ptr(dest, triplet, payload as *mut T as *mut c_void)
    }

    /// Dispatches with no payload (operations taking a null data
    /// pointer).
    pub fn dispatch_empty(&self, dest: Option<&mut TwIdentity>, triplet: Triplet) -> ReturnCode {
        self.dispatch_ptr(dest, triplet, ptr::null_mut())
    }

    /// Core dispatch. The identity lock is held only around the
    /// copy-in/copy-out, not across the native call, so notification
    /// handlers arriving on the manager thread can dispatch freely.
    pub fn dispatch_ptr(
        &self,
        dest: Option<&mut TwIdentity>,
        triplet: Triplet,
        data: *mut c_void,
    ) -> ReturnCode {
        let mut origin = self.app_identity();
        let dest_ptr = dest
            .map(|d| d as *mut TwIdentity)
            .unwrap_or(ptr::null_mut());

        log::trace!("dispatch {triplet}");
        let rc = self.entry.dsm_entry(
            &mut origin,
            dest_ptr,
            triplet.dg as u32,
            triplet.dat as u16,
            triplet.msg as u16,
            data,
        );
        if rc != ReturnCode::Success {
            log::debug!("dispatch {triplet} returned {rc:?}");
        }

        *self.app_identity.lock().expect("lock poisoned") = origin;
        rc
    }

    /// Queries the manager (or a source, when `dest` is given) for the
    /// condition code behind the last non-success return.
    pub fn get_status(&self, dest: Option<&mut TwIdentity>) -> TwStatus {
        let mut status = TwStatus::default();
        let rc = self.dispatch(dest, Triplet::control(Dat::Status, Msg::Get), &mut status);
        if rc != ReturnCode::Success {
            log::debug!("status query itself returned {rc:?}");
        }
        status
    }

    /// Folds a non-success code plus its queried condition into a
    /// protocol error, for operations that must produce a value.
    pub fn protocol_error(&self, rc: ReturnCode, dest: Option<&mut TwIdentity>) -> TwainError {
        let status = self.get_status(dest);
        TwainError::protocol(rc, status.condition())
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("app_identity", &self.app_identity())
            .finish_non_exhaustive()
    }
}
