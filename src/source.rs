//! Data source handles
//!
//! A [`DataSource`] represents one physical or virtual acquisition
//! device. Handles are created by the session's registry, live for the
//! session's lifetime, and hold only a weak reference back to it.
//! Capability negotiation happens here, on the open source, within the
//! `[SourceOpened, TransferReady]` state window.

use crate::callback;
use crate::caps::{
    self, CapId, CapSupport, CapValue, Container, TwCapability,
};
use crate::errors::{Result, TwainError};
use crate::session::SessionInner;
use crate::triplet::Triplet;
use crate::types::{
    Dat, DataGroup, Msg, ReturnCode, SourceEnableMode, State, TwIdentity, TwMemory,
    TwUserInterface, WindowHandle,
};
use std::sync::{Arc, Mutex, Weak};

/// One acquisition device, scoped to its owning session.
pub struct DataSource {
    session: Weak<SessionInner>,
    identity: Mutex<TwIdentity>,
    supported: Mutex<Option<Arc<Vec<CapId>>>>,
}

impl DataSource {
    pub(crate) fn new(session: Weak<SessionInner>, identity: TwIdentity) -> Self {
        Self {
            session,
            identity: Mutex::new(identity),
            supported: Mutex::new(None),
        }
    }

    fn session(&self) -> Result<Arc<SessionInner>> {
        self.session.upgrade().ok_or(TwainError::Disposed)
    }

    pub(crate) fn belongs_to(&self, inner: &Arc<SessionInner>) -> bool {
        self.session
            .upgrade()
            .is_some_and(|session| Arc::ptr_eq(&session, inner))
    }

    pub fn identity(&self) -> TwIdentity {
        *self.identity.lock().expect("lock poisoned")
    }

    pub fn name(&self) -> String {
        self.identity().product_name.as_str().to_string()
    }

    pub fn manufacturer(&self) -> String {
        self.identity().manufacturer.as_str().to_string()
    }

    /// True while this handle is the session's open source.
    pub fn is_open(&self) -> bool {
        match self.session.upgrade() {
            Some(inner) => inner
                .current_source()
                .is_some_and(|current| std::ptr::eq(current.as_ref(), self)),
            None => false,
        }
    }

    /// True while this handle is open and the session is at or above
    /// the enabled state.
    pub fn is_enabled(&self) -> bool {
        self.is_open()
            && self
                .session
                .upgrade()
                .is_some_and(|inner| inner.state() >= State::SourceEnabled)
    }

    /// Opens this source, making it the session's current source.
    /// Legal only at `DsmOpened` (one open source at a time). On
    /// success the notification callback is registered with the
    /// manager.
    pub fn open(self: &Arc<Self>) -> Result<ReturnCode> {
        let inner = self.session()?;
        inner.verify_state(State::DsmOpened, State::DsmOpened)?;

        let (rc, returned) = inner.call_on_internal(
            None,
            Triplet::control(Dat::Identity, Msg::OpenDs),
            self.identity(),
        )?;
        if rc == ReturnCode::Success {
            // The manager assigns the numeric id at open.
            *self.identity.lock().expect("lock poisoned") = returned;
            inner.set_current(Some(Arc::clone(self)));
            inner.set_state(State::SourceOpened);

            let cb_rc = callback::register_callback(&inner, returned);
            if cb_rc != ReturnCode::Success {
                log::warn!(
                    "callback registration failed for {} ({cb_rc:?}); device notifications will not arrive",
                    self.name()
                );
            }
        }
        Ok(rc)
    }

    /// Closes this source. Legal only at `SourceOpened` and only for
    /// the open source.
    pub fn close(self: &Arc<Self>) -> Result<ReturnCode> {
        let inner = self.session()?;
        inner.verify_state(State::SourceOpened, State::SourceOpened)?;
        if !self.is_open() {
            return Err(TwainError::config("source is not the open source"));
        }
        inner.close_current_source()
    }

    /// Enables this source for acquisition (or settings-only UI with
    /// [`SourceEnableMode::ShowUiOnly`]). `parent` falls back to the
    /// window handle the manager was opened with.
    pub fn enable(
        self: &Arc<Self>,
        mode: SourceEnableMode,
        modal: bool,
        parent: WindowHandle,
    ) -> Result<ReturnCode> {
        let inner = self.session()?;
        inner.verify_state(State::SourceOpened, State::SourceOpened)?;
        if !self.is_open() {
            return Err(TwainError::config("source is not the open source"));
        }

        let ui = TwUserInterface {
            show_ui: (mode != SourceEnableMode::NoUi) as u16,
            modal_ui: modal as u16,
            parent: if parent != 0 {
                parent
            } else {
                inner.default_parent()
            },
        };
        let msg = match mode {
            SourceEnableMode::ShowUiOnly => Msg::EnableDsUiOnly,
            _ => Msg::EnableDs,
        };

        let (rc, ui) = inner.call_on_internal(
            Some(self.identity()),
            Triplet::control(Dat::UserInterface, msg),
            ui,
        )?;
        // CheckStatus means the source forced its UI on; still enabled.
        if rc == ReturnCode::Success || rc == ReturnCode::CheckStatus {
            inner.store_last_ui(ui);
            inner.set_state(State::SourceEnabled);
        }
        Ok(rc)
    }

    /// Fetches a capability's full container.
    pub fn cap_get(&self, cap: CapId) -> Result<Container> {
        self.cap_fetch(cap, Msg::Get)
    }

    /// Fetches a capability's current value as a one-value container.
    pub fn cap_get_current(&self, cap: CapId) -> Result<Container> {
        self.cap_fetch(cap, Msg::GetCurrent)
    }

    /// Fetches a capability's factory default as a one-value
    /// container.
    pub fn cap_get_default(&self, cap: CapId) -> Result<Container> {
        self.cap_fetch(cap, Msg::GetDefault)
    }

    /// Restores a capability to its factory default and returns the
    /// restored container.
    pub fn cap_reset(&self, cap: CapId) -> Result<Container> {
        self.cap_fetch(cap, Msg::Reset)
    }

    /// Applies a container to a capability. The container must match
    /// the capability's declared kind; mismatches surface as marshal
    /// errors before anything is dispatched.
    pub fn cap_set(&self, cap: CapId, container: &Container) -> Result<ReturnCode> {
        let inner = self.session()?;
        self.verify_negotiable(&inner)?;

        let payload = TwCapability::with_container(cap, container)?;
        let (rc, payload) = inner.call_on_internal(
            Some(self.identity()),
            Triplet::control(Dat::Capability, Msg::Set),
            payload,
        )?;
        // We allocated the request container; we free it.
        // SAFETY: the handle came from with_container above and the
        // manager side only reads SET payloads.
        unsafe {
            caps::take_container_block(payload.container);
        }
        Ok(rc)
    }

    /// Applies a single value to a capability.
    pub fn cap_set_value(&self, cap: CapId, value: CapValue) -> Result<ReturnCode> {
        self.cap_set(cap, &Container::one(value))
    }

    /// Asks, without side effects, which operations the source
    /// supports for a capability. A capability the source does not
    /// know yields an empty support set, not an error, and no get or
    /// set traffic is generated.
    pub fn cap_query_support(&self, cap: CapId) -> Result<CapSupport> {
        let inner = self.session()?;
        self.verify_negotiable(&inner)?;

        let payload = TwCapability::request(cap);
        let (rc, payload) = inner.call_on_internal(
            Some(self.identity()),
            Triplet::control(Dat::Capability, Msg::QuerySupport),
            payload,
        )?;

        match rc {
            ReturnCode::Success if payload.container != 0 => {
                // SAFETY: handle allocated by the manager side for us.
                let bytes = unsafe { caps::take_container_block(payload.container) };
                let container = Container::decode(&bytes)?;
                let bits = container
                    .current_value()
                    .and_then(CapValue::as_u32)
                    .ok_or_else(|| {
                        TwainError::marshal("support query returned a non-numeric container")
                    })?;
                Ok(CapSupport(bits as u16))
            }
            ReturnCode::Success => Ok(CapSupport::empty()),
            rc => {
                let condition = inner.status_of(Some(self.identity())).condition();
                match condition {
                    crate::types::ConditionCode::CapUnsupported
                    | crate::types::ConditionCode::BadCap => Ok(CapSupport::empty()),
                    condition => Err(TwainError::protocol(rc, condition)),
                }
            }
        }
    }

    /// The capabilities the source reports supporting, fetched once
    /// and cached on the handle.
    pub fn supported_caps(&self) -> Result<Arc<Vec<CapId>>> {
        if let Some(cached) = self.supported.lock().expect("lock poisoned").clone() {
            return Ok(cached);
        }

        let container = self.cap_get(CapId::SUPPORTED_CAPS)?;
        let items = match container {
            Container::Array { items, .. } => items,
            Container::Enumeration { items, .. } => items,
            Container::One { value } => vec![value],
            Container::Range { .. } => {
                return Err(TwainError::marshal(
                    "supported-capability list arrived as a range",
                ))
            }
        };
        let ids: Vec<CapId> = items
            .iter()
            .filter_map(CapValue::as_u32)
            .map(|raw| CapId(raw as u16))
            .collect();

        let ids = Arc::new(ids);
        *self.supported.lock().expect("lock poisoned") = Some(Arc::clone(&ids));
        Ok(ids)
    }

    /// Retrieves the color profile for the image about to transfer or
    /// in transfer. A leaf GET operation: same dispatcher, no extra
    /// protocol logic.
    pub fn icc_profile(&self) -> Result<TwMemory> {
        let inner = self.session()?;
        inner.verify_state(State::TransferReady, State::Transferring)?;
        if !self.is_open() {
            return Err(TwainError::config("source is not the open source"));
        }

        let (rc, memory) = inner.call_on_internal(
            Some(self.identity()),
            Triplet::new(DataGroup::Image, Dat::IccProfile, Msg::Get),
            TwMemory::default(),
        )?;
        if rc != ReturnCode::Success {
            return Err(inner.protocol_error_of(rc, Some(self.identity())));
        }
        Ok(memory)
    }

    fn cap_fetch(&self, cap: CapId, msg: Msg) -> Result<Container> {
        let inner = self.session()?;
        self.verify_negotiable(&inner)?;

        let payload = TwCapability::request(cap);
        let (rc, payload) = inner.call_on_internal(
            Some(self.identity()),
            Triplet::control(Dat::Capability, msg),
            payload,
        )?;
        if rc != ReturnCode::Success {
            return Err(inner.protocol_error_of(rc, Some(self.identity())));
        }
        if payload.container == 0 {
            return Err(TwainError::marshal("source returned no container"));
        }
        // SAFETY: on GET-family success the manager side allocated the
        // block for us to consume.
        let bytes = unsafe { caps::take_container_block(payload.container) };
        Container::decode(&bytes)
    }

    fn verify_negotiable(&self, inner: &Arc<SessionInner>) -> Result<()> {
        inner.verify_state(State::SourceOpened, State::TransferReady)?;
        if !self.is_open() {
            return Err(TwainError::config("source is not the open source"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let identity = self.identity();
        f.debug_struct("DataSource")
            .field("id", &identity.id)
            .field("name", &identity.product_name.as_str())
            .field("manufacturer", &identity.manufacturer.as_str())
            .field("open", &self.is_open())
            .finish()
    }
}
