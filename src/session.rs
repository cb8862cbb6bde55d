//! TWAIN session: the protocol state machine and aggregate root
//!
//! A session owns every device handle it hands out, tracks the state
//! ladder, and gates every operation on its legal state range before
//! anything reaches the native manager. Orderly shutdown walks the
//! ladder one closing operation at a time; forced shutdown resets the
//! bookkeeping no matter what the device does.

use crate::callback;
use crate::entry::NativeEntry;
use crate::errors::{Result, TwainError};
use crate::events::{EventSink, SessionEvent};
use crate::source::DataSource;
use crate::threading::{DispatcherLoop, ThreadContext};
use crate::triplet::{Dispatcher, Triplet};
use crate::types::{
    Dat, FileFormat, Msg, ReturnCode, SessionConfig, SourceKey, State, TwIdentity,
    TwPendingXfers, TwStatus, TwUserInterface, WindowHandle,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Manages one TWAIN session.
///
/// Protocol outcomes are returned as [`ReturnCode`] values; `Err` is
/// reserved for caller mistakes (wrong state, bad configuration, use
/// after disposal). Callers must not issue concurrent operations on
/// the same session: the protocol allows one outstanding manager call
/// at a time.
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    pub(crate) dispatcher: Dispatcher,
    state: Mutex<State>,
    sources: Mutex<HashMap<SourceKey, Arc<DataSource>>>,
    current: Mutex<Option<Arc<DataSource>>>,
    internal: DispatcherLoop,
    external: Mutex<Option<Arc<dyn ThreadContext>>>,
    sink: Mutex<Option<Arc<dyn EventSink>>>,
    stop_requested: AtomicBool,
    last_ui: Mutex<Option<TwUserInterface>>,
    parent_window: Mutex<WindowHandle>,
    file_transfer: Mutex<Option<(PathBuf, FileFormat)>>,
    router: Mutex<Option<Box<callback::CallbackRouter>>>,
}

impl Session {
    /// Constructs a session for the given application identity against
    /// a loaded manager. The manager handle is shared: clone the same
    /// `Arc` into every session and the library stays loaded until the
    /// last one is gone.
    pub fn new(config: SessionConfig, entry: Arc<dyn NativeEntry>) -> Result<Self> {
        if config.product_name.trim().is_empty() {
            return Err(TwainError::config("product name must not be empty"));
        }
        if config.manufacturer.trim().is_empty() {
            return Err(TwainError::config("manufacturer must not be empty"));
        }

        Ok(Self {
            inner: Arc::new(SessionInner {
                dispatcher: Dispatcher::new(entry, config.to_identity()),
                state: Mutex::new(State::DsmUnloaded),
                sources: Mutex::new(HashMap::new()),
                current: Mutex::new(None),
                internal: DispatcherLoop::new("crabscan-manager-loop"),
                external: Mutex::new(None),
                sink: Mutex::new(None),
                stop_requested: AtomicBool::new(false),
                last_ui: Mutex::new(None),
                parent_window: Mutex::new(0),
                file_transfer: Mutex::new(None),
                router: Mutex::new(None),
            }),
        })
    }

    pub fn state(&self) -> State {
        self.inner.state()
    }

    /// Sets the optional external execution context. Events are
    /// marshaled onto it before subscriber delivery; with none set,
    /// events fire on the manager's internal thread.
    pub fn set_external_context(&self, context: Option<Arc<dyn ThreadContext>>) {
        *self.inner.external.lock().expect("lock poisoned") = context;
    }

    /// Installs the event subscriber. One sink at a time.
    pub fn set_event_sink(&self, sink: Option<Arc<dyn EventSink>>) {
        *self.inner.sink.lock().expect("lock poisoned") = sink;
    }

    /// Routes subsequent transfers to files at the given path and
    /// format instead of native in-memory transfers.
    pub fn set_file_transfer(&self, setup: Option<(PathBuf, FileFormat)>) {
        *self.inner.file_transfer.lock().expect("lock poisoned") = setup;
    }

    /// Requests cooperative cancellation: the transfer-ready handler
    /// observes the flag and asks the device to disable itself. No
    /// in-flight native call is interrupted.
    pub fn stop_transfer(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Opens the manager. Legal from `DsmUnloaded` and `DsmLoaded`;
    /// starts the internal loop and moves to `DsmOpened` on success.
    pub fn open(&self, parent: WindowHandle) -> Result<ReturnCode> {
        self.inner.verify_state(State::DsmUnloaded, State::DsmLoaded)?;

        *self.inner.parent_window.lock().expect("lock poisoned") = parent;
        self.inner.stop_requested.store(false, Ordering::SeqCst);
        self.inner.internal.start()?;

        let (rc, _) = self.inner.call_on_internal(
            None,
            Triplet::control(Dat::Parent, Msg::OpenDsm),
            parent,
        )?;
        if rc == ReturnCode::Success {
            self.inner.set_state(State::DsmOpened);
        } else {
            self.inner.internal.stop();
        }
        Ok(rc)
    }

    /// Closes the manager. Legal only from `DsmOpened` (close sources
    /// first); stops the internal loop and returns to `DsmUnloaded`.
    /// Already-issued handles remain but are semantically invalid.
    pub fn close(&self) -> Result<ReturnCode> {
        self.inner.verify_state(State::DsmOpened, State::DsmOpened)?;

        let parent = *self.inner.parent_window.lock().expect("lock poisoned");
        let (rc, _) = self.inner.call_on_internal(
            None,
            Triplet::control(Dat::Parent, Msg::CloseDsm),
            parent,
        )?;
        if rc == ReturnCode::Success {
            self.inner.internal.stop();
            self.inner.set_state(State::DsmUnloaded);
        }
        Ok(rc)
    }

    /// Steps the session down to `target`, applying the single legal
    /// closing operation for each state along the way. Stops at the
    /// first failure and returns its code; the session state then
    /// reflects the last successful step. States with no closing
    /// operation short-circuit to success.
    pub fn step_down(&self, target: State) -> Result<ReturnCode> {
        let mut rc = ReturnCode::Success;
        while self.inner.state() > target {
            rc = match self.inner.state() {
                State::Invalid | State::DsmUnloaded | State::DsmLoaded => {
                    return Ok(ReturnCode::Success)
                }
                State::DsmOpened => self.close()?,
                State::SourceOpened => self.inner.close_current_source()?,
                State::SourceEnabled => self.inner.disable_current_source()?,
                State::TransferReady => self.inner.reset_pending()?,
                State::Transferring => self.inner.end_transfer()?.0,
            };
            if rc != ReturnCode::Success {
                return Ok(rc);
            }
        }
        Ok(rc)
    }

    /// Unconditional teardown to `target` for when orderly shutdown is
    /// not possible. Closing operations are still attempted, but every
    /// failure is logged and ignored, and the bookkeeping ends at
    /// `target` regardless. Whether the device actually released its
    /// resources after an ignored failure is not knowable here; the
    /// warnings are the audit trail.
    pub fn force_step_down(&self, target: State) {
        while self.inner.state() > target {
            let current = self.inner.state();
            let result = match current {
                State::Invalid | State::DsmUnloaded | State::DsmLoaded => break,
                State::DsmOpened => self.close(),
                State::SourceOpened => self.inner.close_current_source(),
                State::SourceEnabled => self.inner.disable_current_source(),
                State::TransferReady => self.inner.reset_pending(),
                State::Transferring => self.inner.end_transfer().map(|(rc, _)| rc),
            };
            match result {
                Ok(ReturnCode::Success) => {}
                Ok(rc) => log::warn!("ignoring {rc:?} from forced close at {current:?}"),
                Err(e) => log::warn!("ignoring error during forced close at {current:?}: {e}"),
            }
            if self.inner.state() >= current {
                self.inner.set_state(state_below(current));
            }
        }
        self.inner.finish_forced(target);
    }

    /// Enumerates the sources the manager knows about. Each structural
    /// identity resolves to the session's one handle instance for it.
    pub fn get_sources(&self) -> Result<Vec<Arc<DataSource>>> {
        self.inner
            .verify_state(State::DsmOpened, State::Transferring)?;

        let mut found = Vec::new();
        let (mut rc, mut identity) = self.inner.call_on_internal(
            None,
            Triplet::control(Dat::Identity, Msg::GetFirst),
            TwIdentity::default(),
        )?;
        while rc == ReturnCode::Success {
            found.push(self.inner.source_singleton(&identity));
            let next = self.inner.call_on_internal(
                None,
                Triplet::control(Dat::Identity, Msg::GetNext),
                TwIdentity::default(),
            )?;
            rc = next.0;
            identity = next.1;
        }
        if rc != ReturnCode::EndOfList {
            log::debug!("source enumeration ended with {rc:?}");
        }
        log::debug!("enumerated {} sources", found.len());
        Ok(found)
    }

    /// The manager's default source, if it reports one.
    pub fn default_source(&self) -> Result<Option<Arc<DataSource>>> {
        self.inner
            .verify_state(State::DsmOpened, State::Transferring)?;

        let (rc, identity) = self.inner.call_on_internal(
            None,
            Triplet::control(Dat::Identity, Msg::GetDefault),
            TwIdentity::default(),
        )?;
        if rc == ReturnCode::Success {
            Ok(Some(self.inner.source_singleton(&identity)))
        } else {
            Ok(None)
        }
    }

    /// Makes `source` the manager's default.
    pub fn set_default_source(&self, source: &Arc<DataSource>) -> Result<ReturnCode> {
        self.inner
            .verify_state(State::DsmOpened, State::Transferring)?;
        if !source.belongs_to(&self.inner) {
            return Err(TwainError::config("source belongs to another session"));
        }

        let (rc, _) = self.inner.call_on_internal(
            None,
            Triplet::control(Dat::Identity, Msg::Set),
            source.identity(),
        )?;
        Ok(rc)
    }

    /// Shows the manager's built-in source selector and returns the
    /// picked source; `None` when the user cancels.
    pub fn show_source_selector(&self) -> Result<Option<Arc<DataSource>>> {
        self.inner.verify_state(State::DsmOpened, State::DsmOpened)?;

        let (rc, identity) = self.inner.call_on_internal(
            None,
            Triplet::control(Dat::Identity, Msg::UserSelect),
            TwIdentity::default(),
        )?;
        match rc {
            ReturnCode::Success => Ok(Some(self.inner.source_singleton(&identity))),
            ReturnCode::Cancel => Ok(None),
            other => {
                log::debug!("source selector returned {other:?}");
                Ok(None)
            }
        }
    }

    /// The currently open source, if any.
    pub fn current_source(&self) -> Option<Arc<DataSource>> {
        self.inner.current_source()
    }

    /// Queries the manager's status; useful after a non-success code.
    pub fn get_status(&self) -> Result<TwStatus> {
        self.inner
            .verify_state(State::DsmOpened, State::Transferring)?;
        Ok(self.inner.status_of(None))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.inner.state() > State::DsmUnloaded {
            log::warn!(
                "session dropped at {:?}; forcing teardown",
                self.inner.state()
            );
            self.force_step_down(State::DsmUnloaded);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

/// The next rung down the ladder, used when a forced close fails to
/// move the session.
fn state_below(state: State) -> State {
    match state {
        State::Transferring => State::TransferReady,
        State::TransferReady => State::SourceEnabled,
        State::SourceEnabled => State::SourceOpened,
        State::SourceOpened => State::DsmOpened,
        State::DsmOpened | State::DsmLoaded => State::DsmUnloaded,
        other => other,
    }
}

impl SessionInner {
    pub(crate) fn state(&self) -> State {
        *self.state.lock().expect("lock poisoned")
    }

    pub(crate) fn set_state(&self, new: State) {
        let mut state = self.state.lock().expect("lock poisoned");
        if *state != new {
            log::debug!("session state {:?} -> {new:?}", *state);
            *state = new;
        }
    }

    /// The pre-call guard every operation runs first. Rejects the
    /// operation before any native call when the current state is
    /// outside `[min, max]`.
    pub(crate) fn verify_state(&self, min: State, max: State) -> Result<()> {
        let current = self.state();
        if current < min || current > max {
            return Err(TwainError::State { current, min, max });
        }
        Ok(())
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_stop_request(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
    }

    pub(crate) fn current_source(&self) -> Option<Arc<DataSource>> {
        self.current.lock().expect("lock poisoned").clone()
    }

    pub(crate) fn set_current(&self, source: Option<Arc<DataSource>>) {
        *self.current.lock().expect("lock poisoned") = source;
    }

    pub(crate) fn store_last_ui(&self, ui: TwUserInterface) {
        *self.last_ui.lock().expect("lock poisoned") = Some(ui);
    }

    pub(crate) fn default_parent(&self) -> WindowHandle {
        *self.parent_window.lock().expect("lock poisoned")
    }

    pub(crate) fn file_transfer_setup(&self) -> Option<(PathBuf, FileFormat)> {
        self.file_transfer.lock().expect("lock poisoned").clone()
    }

    /// Address of the session's callback router, creating it on first
    /// use. The box gives the router a stable address for the
    /// registration record's `ref_con`; it lives until the session is
    /// dropped.
    pub(crate) fn router_ref_con(self: &Arc<Self>) -> usize {
        let mut router = self.router.lock().expect("lock poisoned");
        let boxed = router
            .get_or_insert_with(|| Box::new(callback::CallbackRouter::new(Arc::downgrade(self))));
        &**boxed as *const callback::CallbackRouter as usize
    }

    /// Runs `f` on the internal loop thread and hands back its result.
    /// With the loop not running (manager closed), runs inline.
    pub(crate) fn invoke_internal<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if !self.internal.is_running() {
            return Ok(f());
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.internal.invoke(Box::new(move || {
            let _ = tx.send(f());
        }))?;
        rx.try_recv()
            .map_err(|_| TwainError::threading("internal action produced no result"))
    }

    /// Dispatches one triplet on the internal thread, returning the
    /// code and the payload as the native side left it.
    pub(crate) fn call_on_internal<P>(
        self: &Arc<Self>,
        dest: Option<TwIdentity>,
        triplet: Triplet,
        payload: P,
    ) -> Result<(ReturnCode, P)>
    where
        P: Send + 'static,
    {
        let inner = Arc::clone(self);
        self.invoke_internal(move || {
            let mut payload = payload;
            let mut dest = dest;
            let rc = inner.dispatcher.dispatch(dest.as_mut(), triplet, &mut payload);
            (rc, payload)
        })
    }

    /// Dispatches a payload-less triplet on the internal thread.
    pub(crate) fn call_empty_on_internal(
        self: &Arc<Self>,
        dest: Option<TwIdentity>,
        triplet: Triplet,
    ) -> Result<ReturnCode> {
        let inner = Arc::clone(self);
        self.invoke_internal(move || {
            let mut dest = dest;
            inner.dispatcher.dispatch_empty(dest.as_mut(), triplet)
        })
    }

    pub(crate) fn status_of(self: &Arc<Self>, dest: Option<TwIdentity>) -> TwStatus {
        let inner = Arc::clone(self);
        self.invoke_internal(move || {
            let mut dest = dest;
            inner.dispatcher.get_status(dest.as_mut())
        })
        .unwrap_or_default()
    }

    pub(crate) fn protocol_error_of(
        self: &Arc<Self>,
        rc: ReturnCode,
        dest: Option<TwIdentity>,
    ) -> TwainError {
        TwainError::protocol(rc, self.status_of(dest).condition())
    }

    /// Get-or-create the handle for a structural identity. The same
    /// identity always yields the same instance for this session's
    /// lifetime, so subscribers can rely on pointer identity.
    pub(crate) fn source_singleton(self: &Arc<Self>, identity: &TwIdentity) -> Arc<DataSource> {
        let key = identity.source_key();
        let mut sources = self.sources.lock().expect("lock poisoned");
        sources
            .entry(key)
            .or_insert_with(|| Arc::new(DataSource::new(Arc::downgrade(self), *identity)))
            .clone()
    }

    /// Closes the open source: the legal closing operation for
    /// `SourceOpened`.
    pub(crate) fn close_current_source(self: &Arc<Self>) -> Result<ReturnCode> {
        let source = match self.current_source() {
            Some(source) => source,
            None => {
                log::warn!("no open source tracked at {:?}; healing state", self.state());
                self.set_state(State::DsmOpened);
                return Ok(ReturnCode::Success);
            }
        };

        let (rc, _) = self.call_on_internal(
            None,
            Triplet::control(Dat::Identity, Msg::CloseDs),
            source.identity(),
        )?;
        if rc == ReturnCode::Success {
            self.set_current(None);
            self.set_state(State::DsmOpened);
        }
        Ok(rc)
    }

    /// Disables the open source: the legal closing operation for
    /// `SourceEnabled`. Raises `SourceDisabled` on success.
    pub(crate) fn disable_current_source(self: &Arc<Self>) -> Result<ReturnCode> {
        let dest = self.current_source().map(|source| source.identity());
        let ui = self
            .last_ui
            .lock()
            .expect("lock poisoned")
            .unwrap_or_default();

        let (rc, _) = self.call_on_internal(
            dest,
            Triplet::control(Dat::UserInterface, Msg::DisableDs),
            ui,
        )?;
        if rc == ReturnCode::Success {
            *self.last_ui.lock().expect("lock poisoned") = None;
            self.set_state(State::SourceOpened);
            self.raise_event(SessionEvent::SourceDisabled);
        }
        Ok(rc)
    }

    /// Discards pending transfers: the legal closing operation for
    /// `TransferReady`.
    pub(crate) fn reset_pending(self: &Arc<Self>) -> Result<ReturnCode> {
        let dest = self.current_source().map(|source| source.identity());
        let (rc, _) = self.call_on_internal(
            dest,
            Triplet::control(Dat::PendingXfers, Msg::Reset),
            TwPendingXfers::default(),
        )?;
        if rc == ReturnCode::Success {
            self.set_state(State::SourceEnabled);
        }
        Ok(rc)
    }

    /// Ends the in-flight transfer: the legal closing operation for
    /// `Transferring`. Lands at `TransferReady` when more transfers
    /// are pending, `SourceEnabled` otherwise.
    pub(crate) fn end_transfer(self: &Arc<Self>) -> Result<(ReturnCode, u16)> {
        let dest = self.current_source().map(|source| source.identity());
        let (rc, pending) = self.call_on_internal(
            dest,
            Triplet::control(Dat::PendingXfers, Msg::EndXfer),
            TwPendingXfers::default(),
        )?;
        if rc == ReturnCode::Success {
            self.set_state(if pending.count > 0 {
                State::TransferReady
            } else {
                State::SourceEnabled
            });
        }
        Ok((rc, pending.count))
    }

    /// Delivers an event without waiting: marshaled via the external
    /// context when present, inline on the producing thread otherwise.
    pub(crate) fn raise_event(&self, event: SessionEvent) {
        let sink = match self.sink.lock().expect("lock poisoned").clone() {
            Some(sink) => sink,
            None => return,
        };
        let external = self.external.lock().expect("lock poisoned").clone();
        match external {
            Some(context) => context.begin_invoke(Box::new(move || sink.on_event(event))),
            None => sink.on_event(event),
        }
    }

    /// Delivers an event and waits for the subscriber to return, so a
    /// decision it makes (like canceling a transfer) is visible to the
    /// caller.
    pub(crate) fn raise_event_blocking(&self, event: SessionEvent) -> Result<()> {
        let sink = match self.sink.lock().expect("lock poisoned").clone() {
            Some(sink) => sink,
            None => return Ok(()),
        };
        let external = self.external.lock().expect("lock poisoned").clone();
        match external {
            Some(context) => context.invoke(Box::new(move || sink.on_event(event))),
            None => {
                sink.on_event(event);
                Ok(())
            }
        }
    }

    /// Final bookkeeping for forced teardown.
    fn finish_forced(&self, target: State) {
        self.set_state(target);
        if target < State::SourceOpened {
            self.set_current(None);
            *self.last_ui.lock().expect("lock poisoned") = None;
        }
        if target < State::DsmOpened {
            self.internal.stop();
        }
        self.stop_requested.store(false, Ordering::SeqCst);
    }
}
