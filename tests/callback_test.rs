//! Tests for callback registration, notification routing, and the
//! transfer loop
//!
//! Notifications are raised through the mock manager's registered
//! callback, exactly as the native manager would, and the resulting
//! state transitions and event sequences are asserted in order.

use crabscan::testing::MockManager;
use crabscan::{
    ConditionCode, Dat, DataSource, EventSink, FileFormat, Msg, ReturnCode, Session,
    SessionConfig, SessionEvent, SourceEnableMode, State, TransferredData,
};
use std::sync::{Arc, Mutex};

/// Collects events in delivery order.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<SessionEvent>>,
}

impl Recorder {
    fn kinds(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| match event {
                SessionEvent::SourceDisabled => "source-disabled",
                SessionEvent::SourceCloseRequest => "close-request",
                SessionEvent::TransferReady(_) => "transfer-ready",
                SessionEvent::DataTransferred(_) => "data-transferred",
                SessionEvent::DeviceEvent => "device-event",
                SessionEvent::TransferError(_) => "transfer-error",
            })
            .collect()
    }

    fn transferred(&self) -> Vec<TransferredData> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                SessionEvent::DataTransferred(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for Recorder {
    fn on_event(&self, event: SessionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn enabled_source() -> (Session, Arc<DataSource>, Arc<MockManager>, Arc<Recorder>) {
    let mock = Arc::new(MockManager::new());
    mock.add_source("Scanner 9000", "Crab Devices");
    let session = Session::new(SessionConfig::new("Test App", "Crab"), mock.clone()).unwrap();
    session.open(0).unwrap();
    let source = session.get_sources().unwrap().remove(0);
    source.open().unwrap();

    let recorder = Arc::new(Recorder::default());
    session.set_event_sink(Some(recorder.clone()));
    source.enable(SourceEnableMode::NoUi, false, 0).unwrap();
    (session, source, mock, recorder)
}

mod registration {
    use super::*;

    #[test]
    fn modern_record_registers_on_source_open() {
        let mock = Arc::new(MockManager::new());
        mock.add_source("Scanner 9000", "Crab Devices");
        let session =
            Session::new(SessionConfig::new("Test App", "Crab"), mock.clone()).unwrap();
        session.open(0).unwrap();
        session.get_sources().unwrap().remove(0).open().unwrap();

        assert!(mock.has_registered_callback());
        assert_eq!(mock.count_of(Dat::Callback2, Msg::RegisterCallback), 1);
        assert_eq!(mock.count_of(Dat::Callback, Msg::RegisterCallback), 0);
    }

    #[test]
    fn legacy_record_is_tried_exactly_once_when_modern_fails() {
        let mock = Arc::new(MockManager::new());
        mock.add_source("Scanner 9000", "Crab Devices");
        mock.reject_modern_callback();
        let session =
            Session::new(SessionConfig::new("Test App", "Crab"), mock.clone()).unwrap();
        session.open(0).unwrap();
        session.get_sources().unwrap().remove(0).open().unwrap();

        assert!(mock.has_registered_callback());
        assert_eq!(mock.count_of(Dat::Callback2, Msg::RegisterCallback), 1);
        assert_eq!(mock.count_of(Dat::Callback, Msg::RegisterCallback), 1);
    }

    #[test]
    fn legacy_result_is_decisive_when_both_fail() {
        let mock = Arc::new(MockManager::new());
        mock.add_source("Scanner 9000", "Crab Devices");
        mock.reject_modern_callback();
        mock.fail_op(
            Dat::Callback,
            Msg::RegisterCallback,
            ReturnCode::Failure,
            ConditionCode::BadProtocol,
        );
        let session =
            Session::new(SessionConfig::new("Test App", "Crab"), mock.clone()).unwrap();
        session.open(0).unwrap();
        let source = session.get_sources().unwrap().remove(0);

        // The source still opens; only notification delivery is lost.
        assert_eq!(source.open().unwrap(), ReturnCode::Success);
        assert!(!mock.has_registered_callback());
        assert_eq!(mock.count_of(Dat::Callback, Msg::RegisterCallback), 1);
    }
}

mod transfers {
    use super::*;

    #[test]
    fn single_native_transfer_produces_the_event_sequence_in_order() {
        let (session, _source, mock, recorder) = enabled_source();

        assert_eq!(mock.raise_xfer_ready(1), ReturnCode::Success);
        assert_eq!(
            recorder.kinds(),
            vec!["transfer-ready", "data-transferred", "source-disabled"]
        );
        assert!(matches!(
            recorder.transferred()[0],
            TransferredData::Memory(_)
        ));
        assert_eq!(session.state(), State::SourceOpened);
    }

    #[test]
    fn every_pending_transfer_is_collected() {
        let (_session, _source, mock, recorder) = enabled_source();

        mock.raise_xfer_ready(3);
        assert_eq!(
            recorder.kinds(),
            vec![
                "transfer-ready",
                "data-transferred",
                "transfer-ready",
                "data-transferred",
                "transfer-ready",
                "data-transferred",
                "source-disabled",
            ]
        );
    }

    #[test]
    fn cancel_from_the_sink_discards_pending_transfers() {
        let mock = Arc::new(MockManager::new());
        mock.add_source("Scanner 9000", "Crab Devices");
        let session =
            Session::new(SessionConfig::new("Test App", "Crab"), mock.clone()).unwrap();
        session.open(0).unwrap();
        let source = session.get_sources().unwrap().remove(0);
        source.open().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_sink = seen.clone();
        session.set_event_sink(Some(Arc::new(move |event: SessionEvent| {
            if let SessionEvent::TransferReady(ready) = &event {
                ready.cancel();
            }
            seen_sink.lock().unwrap().push(matches!(
                event,
                SessionEvent::DataTransferred(_)
            ));
        })));
        source.enable(SourceEnableMode::NoUi, false, 0).unwrap();

        mock.raise_xfer_ready(2);
        assert!(!seen.lock().unwrap().iter().any(|&transferred| transferred));
        assert_eq!(mock.count_of(Dat::PendingXfers, Msg::Reset), 1);
        assert_eq!(session.state(), State::SourceOpened);
    }

    #[test]
    fn stop_request_is_observed_by_the_transfer_handler() {
        let (session, _source, mock, recorder) = enabled_source();

        session.stop_transfer();
        mock.raise_xfer_ready(2);

        assert_eq!(recorder.kinds(), vec!["transfer-ready", "source-disabled"]);
        assert_eq!(mock.count_of(Dat::PendingXfers, Msg::Reset), 1);
        assert_eq!(session.state(), State::SourceOpened);
    }

    #[test]
    fn file_transfer_reports_the_written_path() {
        let (session, _source, mock, recorder) = enabled_source();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.bmp");
        session.set_file_transfer(Some((path.clone(), FileFormat::Bmp)));

        mock.raise_xfer_ready(1);
        assert_eq!(
            recorder.transferred(),
            vec![TransferredData::File(path.clone())]
        );
        assert!(path.exists());
    }

    #[test]
    fn transfer_failure_raises_a_transfer_error_and_aborts() {
        let (session, _source, mock, recorder) = enabled_source();
        mock.fail_op(
            Dat::ImageNativeXfer,
            Msg::Get,
            ReturnCode::Failure,
            ConditionCode::OperationError,
        );

        mock.raise_xfer_ready(2);
        assert_eq!(
            recorder.kinds(),
            vec!["transfer-ready", "transfer-error", "source-disabled"]
        );
        assert_eq!(session.state(), State::SourceOpened);
    }
}

mod notifications {
    use super::*;

    #[test]
    fn close_request_disables_the_source() {
        let (session, _source, mock, recorder) = enabled_source();

        assert_eq!(mock.raise_close_request(), ReturnCode::Success);
        assert_eq!(recorder.kinds(), vec!["close-request", "source-disabled"]);
        assert_eq!(session.state(), State::SourceOpened);
    }

    #[test]
    fn icc_profile_is_available_while_transfer_ready() {
        let mock = Arc::new(MockManager::new());
        mock.add_source("Scanner 9000", "Crab Devices");
        mock.set_icc_profile(vec![9, 9, 9]);
        let session =
            Session::new(SessionConfig::new("Test App", "Crab"), mock.clone()).unwrap();
        session.open(0).unwrap();
        let source = session.get_sources().unwrap().remove(0);
        source.open().unwrap();

        // Query the profile from inside the transfer-ready window.
        let profile_len = Arc::new(Mutex::new(None));
        let probe = profile_len.clone();
        let probe_source = source.clone();
        session.set_event_sink(Some(Arc::new(move |event: SessionEvent| {
            if let SessionEvent::TransferReady(ready) = &event {
                let memory = probe_source.icc_profile().unwrap();
                *probe.lock().unwrap() = Some(memory.length);
                ready.cancel();
            }
        })));
        source.enable(SourceEnableMode::NoUi, false, 0).unwrap();

        mock.raise_xfer_ready(1);
        assert_eq!(*profile_len.lock().unwrap(), Some(3));
    }

    #[test]
    fn icc_profile_outside_transfer_states_is_rejected() {
        let mock = Arc::new(MockManager::new());
        mock.add_source("Scanner 9000", "Crab Devices");
        let session =
            Session::new(SessionConfig::new("Test App", "Crab"), mock.clone()).unwrap();
        session.open(0).unwrap();
        let source = session.get_sources().unwrap().remove(0);
        source.open().unwrap();

        mock.clear_calls();
        assert!(source.icc_profile().unwrap_err().is_state_error());
        assert_eq!(mock.call_count(), 0);
    }
}
