//! Tests for capability negotiation over the mock manager
//!
//! Covers container fetch/apply round trips, the side-effect-free
//! support query, reset semantics, and marshal failures that must be
//! caught before anything is dispatched.

use crabscan::testing::MockManager;
use crabscan::{
    CapId, CapSupport, CapValue, ConditionCode, Container, Dat, DataSource, Fix32, ItemType, Msg,
    ReturnCode, Session, SessionConfig, TwainError,
};
use std::sync::Arc;

fn open_source() -> (Session, Arc<DataSource>, Arc<MockManager>) {
    let mock = Arc::new(MockManager::new());
    mock.add_source("Scanner 9000", "Crab Devices");
    let session = Session::new(SessionConfig::new("Test App", "Crab"), mock.clone()).unwrap();
    session.open(0).unwrap();
    let source = session.get_sources().unwrap().remove(0);
    source.open().unwrap();
    (session, source, mock)
}

fn rw_support() -> CapSupport {
    CapSupport(CapSupport::GET.0 | CapSupport::SET.0 | CapSupport::RESET.0)
}

#[test]
fn enumerated_capability_round_trips_every_possible_value() {
    let (_session, source, mock) = open_source();
    let possible = [0u16, 1, 2];
    mock.set_cap(
        CapId::PIXEL_TYPE,
        Container::Enumeration {
            item_type: ItemType::U16,
            current_index: 0,
            default_index: 0,
            items: possible.iter().map(|&v| CapValue::U16(v)).collect(),
        },
        rw_support(),
    );

    for &value in &possible {
        assert_eq!(
            source
                .cap_set_value(CapId::PIXEL_TYPE, CapValue::U16(value))
                .unwrap(),
            ReturnCode::Success
        );
        let current = source.cap_get_current(CapId::PIXEL_TYPE).unwrap();
        assert_eq!(current, Container::one(CapValue::U16(value)));
    }
}

#[test]
fn full_get_returns_the_declared_container() {
    let (_session, source, mock) = open_source();
    let container = Container::Enumeration {
        item_type: ItemType::U16,
        current_index: 1,
        default_index: 0,
        items: vec![CapValue::U16(1), CapValue::U16(4), CapValue::U16(8)],
    };
    mock.set_cap(CapId::BIT_DEPTH, container.clone(), rw_support());

    assert_eq!(source.cap_get(CapId::BIT_DEPTH).unwrap(), container);
}

#[test]
fn range_capability_tracks_its_current_value() {
    let (_session, source, mock) = open_source();
    mock.set_cap(
        CapId::X_RESOLUTION,
        Container::Range {
            item_type: ItemType::Fix32,
            min: CapValue::Fix32(Fix32::from_f32(75.0)),
            max: CapValue::Fix32(Fix32::from_f32(600.0)),
            step: CapValue::Fix32(Fix32::from_f32(75.0)),
            default: CapValue::Fix32(Fix32::from_f32(300.0)),
            current: CapValue::Fix32(Fix32::from_f32(300.0)),
        },
        rw_support(),
    );

    source
        .cap_set_value(CapId::X_RESOLUTION, CapValue::Fix32(Fix32::from_f32(150.0)))
        .unwrap();
    let fetched = source.cap_get(CapId::X_RESOLUTION).unwrap();
    match fetched {
        Container::Range { current, .. } => {
            assert_eq!(current, CapValue::Fix32(Fix32::from_f32(150.0)));
        }
        other => panic!("expected a range, got {other:?}"),
    }
}

#[test]
fn reset_restores_the_factory_default() {
    let (_session, source, mock) = open_source();
    mock.set_cap(
        CapId::XFER_COUNT,
        Container::one(CapValue::I16(-1)),
        rw_support(),
    );

    source
        .cap_set_value(CapId::XFER_COUNT, CapValue::I16(5))
        .unwrap();
    assert_eq!(
        source.cap_get_current(CapId::XFER_COUNT).unwrap(),
        Container::one(CapValue::I16(5))
    );

    let restored = source.cap_reset(CapId::XFER_COUNT).unwrap();
    assert_eq!(restored, Container::one(CapValue::I16(-1)));
}

#[test]
fn query_support_reports_the_declared_operations() {
    let (_session, source, mock) = open_source();
    mock.set_cap(
        CapId::DUPLEX_ENABLED,
        Container::one(CapValue::Bool(false)),
        rw_support(),
    );

    let support = source.cap_query_support(CapId::DUPLEX_ENABLED).unwrap();
    assert!(support.supports_get());
    assert!(support.supports_set());
    assert!(support.supports_reset());
}

#[test]
fn query_support_on_unknown_capability_is_empty_without_error_or_traffic() {
    let (_session, source, mock) = open_source();
    mock.clear_calls();

    let support = source.cap_query_support(CapId::SUPPORTED_SIZES).unwrap();
    assert!(support.is_empty());
    assert_eq!(mock.count_of(Dat::Capability, Msg::Get), 0);
    assert_eq!(mock.count_of(Dat::Capability, Msg::Set), 0);
}

#[test]
fn set_with_mismatched_items_fails_before_dispatch() {
    let (_session, source, mock) = open_source();
    mock.set_cap(
        CapId::SUPPORTED_SIZES,
        Container::Array {
            item_type: ItemType::U16,
            items: vec![CapValue::U16(1)],
        },
        rw_support(),
    );
    mock.clear_calls();

    let bad = Container::Array {
        item_type: ItemType::U16,
        items: vec![CapValue::U16(1), CapValue::Bool(true)],
    };
    let err = source.cap_set(CapId::SUPPORTED_SIZES, &bad).unwrap_err();
    assert!(matches!(err, TwainError::Marshal(_)));
    assert_eq!(mock.count_of(Dat::Capability, Msg::Set), 0);
}

#[test]
fn set_of_a_value_outside_the_enumeration_is_a_protocol_code() {
    let (_session, source, mock) = open_source();
    mock.set_cap(
        CapId::PIXEL_TYPE,
        Container::Enumeration {
            item_type: ItemType::U16,
            current_index: 0,
            default_index: 0,
            items: vec![CapValue::U16(0), CapValue::U16(2)],
        },
        rw_support(),
    );

    // Not in the possible-value set: the device rejects it with a
    // code, not an error.
    assert_eq!(
        source
            .cap_set_value(CapId::PIXEL_TYPE, CapValue::U16(7))
            .unwrap(),
        ReturnCode::Failure
    );
}

#[test]
fn failed_get_folds_the_condition_code_into_the_error() {
    let (_session, source, mock) = open_source();
    mock.fail_op(
        Dat::Capability,
        Msg::Get,
        ReturnCode::Failure,
        ConditionCode::SeqError,
    );

    let err = source.cap_get(CapId::PIXEL_TYPE).unwrap_err();
    assert_eq!(
        err,
        TwainError::Protocol {
            rc: ReturnCode::Failure,
            condition: ConditionCode::SeqError,
        }
    );
}

#[test]
fn supported_caps_are_fetched_once_and_cached() {
    let (_session, source, mock) = open_source();
    mock.set_cap(
        CapId::SUPPORTED_CAPS,
        Container::Array {
            item_type: ItemType::U16,
            items: vec![
                CapValue::U16(CapId::PIXEL_TYPE.0),
                CapValue::U16(CapId::X_RESOLUTION.0),
            ],
        },
        CapSupport::GET,
    );
    mock.clear_calls();

    let first = source.supported_caps().unwrap();
    let second = source.supported_caps().unwrap();
    assert_eq!(*first, vec![CapId::PIXEL_TYPE, CapId::X_RESOLUTION]);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(mock.count_of(Dat::Capability, Msg::Get), 1);
}
