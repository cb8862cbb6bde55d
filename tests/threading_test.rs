//! Tests for event marshaling across execution contexts
//!
//! The internal manager thread produces events; these tests pin down
//! which thread the subscriber actually runs on when an external
//! context is (or is not) configured.

use crabscan::testing::MockManager;
use crabscan::{
    DispatcherLoop, EventSink, InlineContext, Session, SessionConfig, SessionEvent,
    SourceEnableMode, ThreadContext,
};
use std::sync::{Arc, Mutex};
use std::thread;

struct ThreadRecorder {
    names: Mutex<Vec<Option<String>>>,
}

impl ThreadRecorder {
    fn new() -> Self {
        Self {
            names: Mutex::new(Vec::new()),
        }
    }
}

impl EventSink for ThreadRecorder {
    fn on_event(&self, _event: SessionEvent) {
        self.names
            .lock()
            .unwrap()
            .push(thread::current().name().map(str::to_string));
    }
}

fn scan_once(session: &Session, mock: &Arc<MockManager>) {
    session.open(0).unwrap();
    let source = session.get_sources().unwrap().remove(0);
    source.open().unwrap();
    source.enable(SourceEnableMode::NoUi, false, 0).unwrap();
    mock.raise_xfer_ready(1);
}

#[test]
fn events_are_marshaled_onto_the_external_context() {
    let mock = Arc::new(MockManager::new());
    mock.add_source("Scanner 9000", "Crab Devices");
    let session = Session::new(SessionConfig::new("Test App", "Crab"), mock.clone()).unwrap();

    let external = Arc::new(DispatcherLoop::new("app-ui-loop"));
    external.start().unwrap();
    session.set_external_context(Some(external.clone()));

    let recorder = Arc::new(ThreadRecorder::new());
    session.set_event_sink(Some(recorder.clone()));

    scan_once(&session, &mock);
    // Flush anything still queued behind begin_invoke deliveries.
    external.invoke(Box::new(|| {})).unwrap();

    let names = recorder.names.lock().unwrap().clone();
    assert!(!names.is_empty());
    for name in names {
        assert_eq!(name.as_deref(), Some("app-ui-loop"));
    }
    external.stop();
}

#[test]
fn cancellation_decided_on_the_external_context_is_observed() {
    let mock = Arc::new(MockManager::new());
    mock.add_source("Scanner 9000", "Crab Devices");
    let session = Session::new(SessionConfig::new("Test App", "Crab"), mock.clone()).unwrap();

    let external = Arc::new(DispatcherLoop::new("app-cancel-loop"));
    external.start().unwrap();
    session.set_external_context(Some(external.clone()));

    let transferred = Arc::new(Mutex::new(false));
    let transferred_sink = transferred.clone();
    session.set_event_sink(Some(Arc::new(move |event: SessionEvent| {
        match event {
            SessionEvent::TransferReady(ready) => ready.cancel(),
            SessionEvent::DataTransferred(_) => {
                *transferred_sink.lock().unwrap() = true;
            }
            _ => {}
        }
    })));

    scan_once(&session, &mock);
    external.invoke(Box::new(|| {})).unwrap();

    // The cancel decision was made on the external thread, yet the
    // transfer loop saw it before moving any data.
    assert!(!*transferred.lock().unwrap());
    external.stop();
}

#[test]
fn without_an_external_context_events_fire_on_the_producing_thread() {
    let mock = Arc::new(MockManager::new());
    mock.add_source("Scanner 9000", "Crab Devices");
    let session = Session::new(SessionConfig::new("Test App", "Crab"), mock.clone()).unwrap();

    let recorder = Arc::new(ThreadRecorder::new());
    session.set_event_sink(Some(recorder.clone()));

    let producer = thread::Builder::new()
        .name("fake-manager-thread".to_string())
        .spawn({
            let session_mock = mock.clone();
            let session = session;
            move || {
                scan_once(&session, &session_mock);
            }
        })
        .unwrap();
    producer.join().unwrap();

    let names = recorder.names.lock().unwrap().clone();
    assert!(!names.is_empty());
    for name in names {
        assert_eq!(name.as_deref(), Some("fake-manager-thread"));
    }
}

#[test]
fn inline_context_behaves_like_no_context() {
    let mock = Arc::new(MockManager::new());
    mock.add_source("Scanner 9000", "Crab Devices");
    let session = Session::new(SessionConfig::new("Test App", "Crab"), mock.clone()).unwrap();
    session.set_external_context(Some(Arc::new(InlineContext)));

    let recorder = Arc::new(ThreadRecorder::new());
    session.set_event_sink(Some(recorder.clone()));

    scan_once(&session, &mock);
    assert_eq!(recorder.names.lock().unwrap().len(), 3);
}
