//! Scriptable in-process manager for offline testing
//!
//! [`MockManager`] implements [`NativeEntry`] without any device or
//! native library: sources, capabilities, and failures are scripted by
//! the test, every dispatched triplet is recorded, and notifications
//! can be raised on demand. Tests assert against the call log to prove
//! an operation generated (or, for guard rejections, did not generate)
//! native traffic.

use crate::caps::{
    self, CapId, CapSupport, CapValue, Container, ContainerKind, TwCapability,
};
use crate::entry::{CallbackProc, NativeEntry, TwCallback, TwCallback2};
use crate::types::{
    ConditionCode, Dat, DataGroup, Msg, ReturnCode, TwIdentity, TwMemory, TwPendingXfers,
    TwSetupFileXfer, TwStatus, TwStr32,
};
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;
use std::sync::Mutex;

const DG_CONTROL: u32 = DataGroup::Control as u32;
const DG_IMAGE: u32 = DataGroup::Image as u32;

/// One dispatched triplet, as seen at the native boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedCall {
    pub dg: u32,
    pub dat: u16,
    pub msg: u16,
}

impl RecordedCall {
    pub fn is(&self, dat: Dat, msg: Msg) -> bool {
        self.dat == dat as u16 && self.msg == msg as u16
    }
}

struct MockCap {
    container: Container,
    initial: Container,
    support: CapSupport,
}

struct MockState {
    open: bool,
    sources: Vec<TwIdentity>,
    cursor: usize,
    default_index: usize,
    open_source: Option<TwIdentity>,
    enabled: bool,
    caps: HashMap<u16, MockCap>,
    registered: Option<(CallbackProc, usize)>,
    reject_modern_callback: bool,
    failures: HashMap<(u16, u16), (ReturnCode, ConditionCode)>,
    condition: ConditionCode,
    pending: u16,
    file_path: Option<String>,
    icc_profile: Vec<u8>,
    selector_cancels: bool,
    next_id: u32,
}

/// A scriptable stand-in for the native data source manager.
pub struct MockManager {
    state: Mutex<MockState>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl Default for MockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MockManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                open: false,
                sources: Vec::new(),
                cursor: 0,
                default_index: 0,
                open_source: None,
                enabled: false,
                caps: HashMap::new(),
                registered: None,
                reject_modern_callback: false,
                failures: HashMap::new(),
                condition: ConditionCode::Success,
                pending: 0,
                file_path: None,
                icc_profile: vec![0u8; 8],
                selector_cancels: false,
                next_id: 1,
            }),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Adds a source the manager will enumerate, returning its
    /// identity.
    pub fn add_source(&self, product_name: &str, manufacturer: &str) -> TwIdentity {
        let mut state = self.state.lock().expect("lock poisoned");
        let identity = TwIdentity {
            id: state.next_id,
            protocol_major: 2,
            protocol_minor: 4,
            supported_groups: DG_CONTROL | DG_IMAGE,
            manufacturer: TwStr32::new(manufacturer),
            product_family: TwStr32::new("Mock Devices"),
            product_name: TwStr32::new(product_name),
            ..TwIdentity::default()
        };
        state.next_id += 1;
        state.sources.push(identity);
        identity
    }

    /// Declares a capability with its container and supported
    /// operations.
    pub fn set_cap(&self, cap: CapId, container: Container, support: CapSupport) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.caps.insert(
            cap.0,
            MockCap {
                initial: container.clone(),
                container,
                support,
            },
        );
    }

    /// Makes the modern callback registration fail, forcing the
    /// legacy fallback.
    pub fn reject_modern_callback(&self) {
        self.state
            .lock()
            .expect("lock poisoned")
            .reject_modern_callback = true;
    }

    /// Scripts `(dat, msg)` to fail with the given code and condition
    /// until cleared.
    pub fn fail_op(&self, dat: Dat, msg: Msg, rc: ReturnCode, condition: ConditionCode) {
        self.state
            .lock()
            .expect("lock poisoned")
            .failures
            .insert((dat as u16, msg as u16), (rc, condition));
    }

    pub fn clear_failure(&self, dat: Dat, msg: Msg) {
        self.state
            .lock()
            .expect("lock poisoned")
            .failures
            .remove(&(dat as u16, msg as u16));
    }

    /// Makes the built-in source selector report cancellation.
    pub fn cancel_selector(&self) {
        self.state.lock().expect("lock poisoned").selector_cancels = true;
    }

    pub fn set_icc_profile(&self, bytes: Vec<u8>) {
        self.state.lock().expect("lock poisoned").icc_profile = bytes;
    }

    pub fn has_registered_callback(&self) -> bool {
        self.state.lock().expect("lock poisoned").registered.is_some()
    }

    /// Raises a transfer-ready notification through the registered
    /// callback, with `count` transfers pending. Returns the
    /// callback's result code, or `Failure` when none is registered.
    pub fn raise_xfer_ready(&self, count: u16) -> ReturnCode {
        self.raise(Msg::XferReady, Some(count))
    }

    /// Raises a close-request notification through the registered
    /// callback.
    pub fn raise_close_request(&self) -> ReturnCode {
        self.raise(Msg::CloseDsReq, None)
    }

    fn raise(&self, msg: Msg, pending: Option<u16>) -> ReturnCode {
        // Copy out and drop the lock: the handler re-enters dsm_entry.
        let (proc_, ref_con, origin) = {
            let mut state = self.state.lock().expect("lock poisoned");
            if let Some(count) = pending {
                state.pending = count;
            }
            let origin = match state.open_source {
                Some(identity) => identity,
                None => return ReturnCode::Failure,
            };
            match state.registered {
                Some((proc_, ref_con)) => (proc_, ref_con, origin),
                None => return ReturnCode::Failure,
            }
        };
        let raw = proc_(
            ref_con,
            &origin,
            DG_CONTROL,
            Dat::Null as u16,
            msg as u16,
            ptr::null_mut(),
        );
        ReturnCode::from_u16(raw)
    }

    /// Every call dispatched so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("lock poisoned").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("lock poisoned").len()
    }

    pub fn count_of(&self, dat: Dat, msg: Msg) -> usize {
        self.calls
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|call| call.is(dat, msg))
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().expect("lock poisoned").clear();
    }
}

impl NativeEntry for MockManager {
    fn dsm_entry(
        &self,
        origin: *mut TwIdentity,
        _dest: *mut TwIdentity,
        dg: u32,
        dat: u16,
        msg: u16,
        data: *mut c_void,
    ) -> ReturnCode {
        self.calls
            .lock()
            .expect("lock poisoned")
            .push(RecordedCall { dg, dat, msg });

        let mut state = self.state.lock().expect("lock poisoned");

        if let Some(&(rc, condition)) = state.failures.get(&(dat, msg)) {
            state.condition = condition;
            return rc;
        }

        const DAT_CAPABILITY: u16 = Dat::Capability as u16;
        const DAT_IDENTITY: u16 = Dat::Identity as u16;
        const DAT_PARENT: u16 = Dat::Parent as u16;
        const DAT_PENDING: u16 = Dat::PendingXfers as u16;
        const DAT_SETUP_FILE: u16 = Dat::SetupFileXfer as u16;
        const DAT_STATUS: u16 = Dat::Status as u16;
        const DAT_UI: u16 = Dat::UserInterface as u16;
        const DAT_CALLBACK: u16 = Dat::Callback as u16;
        const DAT_CALLBACK2: u16 = Dat::Callback2 as u16;
        const DAT_NATIVE_XFER: u16 = Dat::ImageNativeXfer as u16;
        const DAT_FILE_XFER: u16 = Dat::ImageFileXfer as u16;
        const DAT_ICC: u16 = Dat::IccProfile as u16;
        const MSG_GET: u16 = Msg::Get as u16;
        const MSG_GET_CURRENT: u16 = Msg::GetCurrent as u16;
        const MSG_GET_DEFAULT: u16 = Msg::GetDefault as u16;
        const MSG_GET_FIRST: u16 = Msg::GetFirst as u16;
        const MSG_GET_NEXT: u16 = Msg::GetNext as u16;
        const MSG_SET: u16 = Msg::Set as u16;
        const MSG_RESET: u16 = Msg::Reset as u16;
        const MSG_QUERY: u16 = Msg::QuerySupport as u16;
        const MSG_OPEN_DSM: u16 = Msg::OpenDsm as u16;
        const MSG_CLOSE_DSM: u16 = Msg::CloseDsm as u16;
        const MSG_OPEN_DS: u16 = Msg::OpenDs as u16;
        const MSG_CLOSE_DS: u16 = Msg::CloseDs as u16;
        const MSG_USER_SELECT: u16 = Msg::UserSelect as u16;
        const MSG_DISABLE: u16 = Msg::DisableDs as u16;
        const MSG_ENABLE: u16 = Msg::EnableDs as u16;
        const MSG_ENABLE_UI_ONLY: u16 = Msg::EnableDsUiOnly as u16;
        const MSG_END_XFER: u16 = Msg::EndXfer as u16;
        const MSG_REGISTER: u16 = Msg::RegisterCallback as u16;

        match (dg, dat, msg) {
            (DG_CONTROL, DAT_PARENT, MSG_OPEN_DSM) => {
                state.open = true;
                if !origin.is_null() {
                    // The manager assigns the application id at open.
                    unsafe { (*origin).id = 1 };
                }
                ReturnCode::Success
            }
            (DG_CONTROL, DAT_PARENT, MSG_CLOSE_DSM) => {
                state.open = false;
                ReturnCode::Success
            }

            (DG_CONTROL, DAT_IDENTITY, MSG_GET_FIRST) => {
                if !state.open {
                    state.condition = ConditionCode::SeqError;
                    return ReturnCode::Failure;
                }
                state.cursor = 0;
                write_next_identity(&mut state, data)
            }
            (DG_CONTROL, DAT_IDENTITY, MSG_GET_NEXT) => write_next_identity(&mut state, data),
            (DG_CONTROL, DAT_IDENTITY, MSG_GET_DEFAULT) => {
                match state.sources.get(state.default_index).copied() {
                    Some(identity) => {
                        write_identity(data, identity);
                        ReturnCode::Success
                    }
                    None => {
                        state.condition = ConditionCode::NoDs;
                        ReturnCode::Failure
                    }
                }
            }
            (DG_CONTROL, DAT_IDENTITY, MSG_SET) => {
                let requested = match read_identity(data) {
                    Some(identity) => identity,
                    None => return bad_value(&mut state),
                };
                match state
                    .sources
                    .iter()
                    .position(|s| s.product_name == requested.product_name)
                {
                    Some(index) => {
                        state.default_index = index;
                        ReturnCode::Success
                    }
                    None => bad_value(&mut state),
                }
            }
            (DG_CONTROL, DAT_IDENTITY, MSG_USER_SELECT) => {
                if state.selector_cancels {
                    return ReturnCode::Cancel;
                }
                match state.sources.get(state.default_index).copied() {
                    Some(identity) => {
                        write_identity(data, identity);
                        ReturnCode::Success
                    }
                    None => {
                        state.condition = ConditionCode::NoDs;
                        ReturnCode::Failure
                    }
                }
            }
            (DG_CONTROL, DAT_IDENTITY, MSG_OPEN_DS) => {
                if !state.open || state.open_source.is_some() {
                    state.condition = ConditionCode::SeqError;
                    return ReturnCode::Failure;
                }
                let requested = match read_identity(data) {
                    Some(identity) => identity,
                    None => return bad_value(&mut state),
                };
                match state
                    .sources
                    .iter()
                    .find(|s| s.product_name == requested.product_name)
                    .copied()
                {
                    Some(identity) => {
                        state.open_source = Some(identity);
                        write_identity(data, identity);
                        ReturnCode::Success
                    }
                    None => {
                        state.condition = ConditionCode::NoDs;
                        ReturnCode::Failure
                    }
                }
            }
            (DG_CONTROL, DAT_IDENTITY, MSG_CLOSE_DS) => {
                state.open_source = None;
                state.enabled = false;
                state.registered = None;
                ReturnCode::Success
            }

            (DG_CONTROL, DAT_UI, MSG_ENABLE) | (DG_CONTROL, DAT_UI, MSG_ENABLE_UI_ONLY) => {
                if state.open_source.is_none() {
                    state.condition = ConditionCode::SeqError;
                    return ReturnCode::Failure;
                }
                state.enabled = true;
                ReturnCode::Success
            }
            (DG_CONTROL, DAT_UI, MSG_DISABLE) => {
                state.enabled = false;
                ReturnCode::Success
            }

            (DG_CONTROL, DAT_CALLBACK2, MSG_REGISTER) => {
                if state.reject_modern_callback {
                    state.condition = ConditionCode::BadProtocol;
                    return ReturnCode::Failure;
                }
                if data.is_null() {
                    return bad_value(&mut state);
                }
                let record = unsafe { *(data as *const TwCallback2) };
                state.registered = Some((record.callback_proc, record.ref_con));
                ReturnCode::Success
            }
            (DG_CONTROL, DAT_CALLBACK, MSG_REGISTER) => {
                if data.is_null() {
                    return bad_value(&mut state);
                }
                let record = unsafe { *(data as *const TwCallback) };
                state.registered = Some((record.callback_proc, record.ref_con));
                ReturnCode::Success
            }

            (DG_CONTROL, DAT_STATUS, MSG_GET) => {
                if data.is_null() {
                    return ReturnCode::Failure;
                }
                unsafe {
                    *(data as *mut TwStatus) = TwStatus {
                        condition_code: state.condition as u16,
                        data: 0,
                    };
                }
                ReturnCode::Success
            }

            (DG_CONTROL, DAT_CAPABILITY, MSG_GET)
            | (DG_CONTROL, DAT_CAPABILITY, MSG_GET_CURRENT)
            | (DG_CONTROL, DAT_CAPABILITY, MSG_GET_DEFAULT)
            | (DG_CONTROL, DAT_CAPABILITY, MSG_RESET) => cap_fetch(&mut state, data, msg),
            (DG_CONTROL, DAT_CAPABILITY, MSG_SET) => cap_set(&mut state, data),
            (DG_CONTROL, DAT_CAPABILITY, MSG_QUERY) => cap_query(&mut state, data),

            (DG_CONTROL, DAT_PENDING, MSG_END_XFER) => {
                state.pending = state.pending.saturating_sub(1);
                write_pending(data, state.pending);
                ReturnCode::Success
            }
            (DG_CONTROL, DAT_PENDING, MSG_RESET) => {
                state.pending = 0;
                write_pending(data, 0);
                ReturnCode::Success
            }

            (DG_CONTROL, DAT_SETUP_FILE, MSG_SET) => {
                if data.is_null() {
                    return bad_value(&mut state);
                }
                let setup = unsafe { &*(data as *const TwSetupFileXfer) };
                state.file_path = Some(setup.file_name.as_str().to_string());
                ReturnCode::Success
            }

            (DG_IMAGE, DAT_NATIVE_XFER, MSG_GET) => {
                if !state.enabled || state.pending == 0 {
                    state.condition = ConditionCode::SeqError;
                    return ReturnCode::Failure;
                }
                if data.is_null() {
                    return bad_value(&mut state);
                }
                let handle = caps::alloc_container_block(vec![0x42; 64]);
                unsafe { *(data as *mut usize) = handle };
                ReturnCode::XferDone
            }
            (DG_IMAGE, DAT_FILE_XFER, MSG_GET) => {
                let path = match state.file_path.clone() {
                    Some(path) => path,
                    None => {
                        state.condition = ConditionCode::SeqError;
                        return ReturnCode::Failure;
                    }
                };
                match std::fs::write(&path, [0x42u8; 64]) {
                    Ok(()) => ReturnCode::XferDone,
                    Err(_) => {
                        state.condition = ConditionCode::FileWriteError;
                        ReturnCode::Failure
                    }
                }
            }
            (DG_IMAGE, DAT_ICC, MSG_GET) => {
                if data.is_null() {
                    return bad_value(&mut state);
                }
                let bytes = state.icc_profile.clone();
                let length = bytes.len() as u32;
                let handle = caps::alloc_container_block(bytes);
                unsafe {
                    *(data as *mut TwMemory) = TwMemory {
                        flags: 0,
                        length,
                        mem: handle,
                    };
                }
                ReturnCode::Success
            }

            _ => {
                state.condition = ConditionCode::BadProtocol;
                ReturnCode::Failure
            }
        }
    }
}

fn bad_value(state: &mut MockState) -> ReturnCode {
    state.condition = ConditionCode::BadValue;
    ReturnCode::Failure
}

fn write_identity(data: *mut c_void, identity: TwIdentity) {
    if !data.is_null() {
        unsafe { *(data as *mut TwIdentity) = identity };
    }
}

fn read_identity(data: *mut c_void) -> Option<TwIdentity> {
    if data.is_null() {
        None
    } else {
        Some(unsafe { *(data as *const TwIdentity) })
    }
}

fn write_pending(data: *mut c_void, count: u16) {
    if !data.is_null() {
        unsafe {
            *(data as *mut TwPendingXfers) = TwPendingXfers { count, event_id: 0 };
        }
    }
}

fn write_next_identity(state: &mut MockState, data: *mut c_void) -> ReturnCode {
    match state.sources.get(state.cursor).copied() {
        Some(identity) => {
            state.cursor += 1;
            write_identity(data, identity);
            ReturnCode::Success
        }
        None => ReturnCode::EndOfList,
    }
}

fn cap_fetch(state: &mut MockState, data: *mut c_void, msg: u16) -> ReturnCode {
    if data.is_null() {
        return bad_value(state);
    }
    let request = unsafe { &mut *(data as *mut TwCapability) };

    let container = match state.caps.get_mut(&request.cap) {
        Some(entry) => {
            if msg == Msg::Reset as u16 {
                entry.container = entry.initial.clone();
            }
            if msg == Msg::GetCurrent as u16 {
                match entry.container.current_value() {
                    Some(value) => Container::one(value.clone()),
                    None => entry.container.clone(),
                }
            } else if msg == Msg::GetDefault as u16 {
                match entry.container.default_value() {
                    Some(value) => Container::one(value.clone()),
                    None => entry.container.clone(),
                }
            } else {
                entry.container.clone()
            }
        }
        None => {
            state.condition = ConditionCode::CapUnsupported;
            return ReturnCode::Failure;
        }
    };

    match container.encode() {
        Ok(bytes) => {
            request.con_type = container.kind() as u16;
            request.container = caps::alloc_container_block(bytes);
            ReturnCode::Success
        }
        Err(_) => bad_value(state),
    }
}

enum SetOutcome {
    Applied,
    BadValue,
    Unsupported,
    BadOperation,
}

fn cap_set(state: &mut MockState, data: *mut c_void) -> ReturnCode {
    if data.is_null() {
        return bad_value(state);
    }
    let request = unsafe { &*(data as *const TwCapability) };
    if request.container == 0 {
        return bad_value(state);
    }
    // The application keeps ownership of SET containers; peek only.
    let bytes = unsafe { caps::read_container_block(request.container) };
    let incoming = match Container::decode(&bytes) {
        Ok(container) => container,
        Err(_) => return bad_value(state),
    };

    let outcome = match state.caps.get_mut(&request.cap) {
        None => SetOutcome::Unsupported,
        Some(entry) if !entry.support.supports_set() => SetOutcome::BadOperation,
        Some(entry) => apply_set(&mut entry.container, incoming),
    };
    match outcome {
        SetOutcome::Applied => ReturnCode::Success,
        SetOutcome::BadValue => bad_value(state),
        SetOutcome::Unsupported => {
            state.condition = ConditionCode::CapUnsupported;
            ReturnCode::Failure
        }
        SetOutcome::BadOperation => {
            state.condition = ConditionCode::CapBadOperation;
            ReturnCode::Failure
        }
    }
}

fn apply_set(slot: &mut Container, incoming: Container) -> SetOutcome {
    match (slot, incoming) {
        (Container::One { value }, Container::One { value: new }) => {
            if value.item_type() != new.item_type() {
                return SetOutcome::BadValue;
            }
            *value = new;
            SetOutcome::Applied
        }
        (
            Container::Enumeration {
                current_index,
                items,
                ..
            },
            Container::One { value: new },
        ) => match items.iter().position(|item| *item == new) {
            Some(index) => {
                *current_index = index as u32;
                SetOutcome::Applied
            }
            None => SetOutcome::BadValue,
        },
        (
            Container::Range {
                current, item_type, ..
            },
            Container::One { value: new },
        ) => {
            if *item_type != new.item_type() {
                return SetOutcome::BadValue;
            }
            *current = new;
            SetOutcome::Applied
        }
        (slot @ Container::Array { .. }, incoming @ Container::Array { .. }) => {
            *slot = incoming;
            SetOutcome::Applied
        }
        _ => SetOutcome::BadValue,
    }
}

fn cap_query(state: &mut MockState, data: *mut c_void) -> ReturnCode {
    if data.is_null() {
        return bad_value(state);
    }
    let request = unsafe { &mut *(data as *mut TwCapability) };
    let support = match state.caps.get(&request.cap) {
        Some(entry) => entry.support,
        None => {
            state.condition = ConditionCode::CapUnsupported;
            return ReturnCode::Failure;
        }
    };

    let container = Container::one(CapValue::U32(support.0 as u32));
    match container.encode() {
        Ok(bytes) => {
            request.con_type = ContainerKind::One as u16;
            request.container = caps::alloc_container_block(bytes);
            ReturnCode::Success
        }
        Err(_) => bad_value(state),
    }
}
