//! Integration tests for transfer classification
//!
//! Tests the status classifier and the result constructor, including:
//! - Totality over every status (including arbitrary platform codes)
//! - Purity (same input, same output)
//! - JSON shape of results as printed by the command-line tool

use proptest::prelude::*;
use protocol::{Status, TransferResult, TransferState, classify};

fn any_status() -> impl Strategy<Value = Status> {
    prop_oneof![
        Just(Status::Success),
        Just(Status::Aborted),
        Just(Status::Timeout),
        Just(Status::TransactionTimeout),
        Just(Status::Stalled),
        Just(Status::NoDevice),
        Just(Status::Busy),
        Just(Status::NotFound),
        Just(Status::Access),
        Just(Status::Overflow),
        Just(Status::InvalidParam),
        Just(Status::NotSupported),
        Just(Status::Io),
        any::<i32>().prop_map(Status::Other),
    ]
}

fn expected_state(status: Status) -> TransferState {
    match status {
        Status::Success | Status::Aborted | Status::Timeout | Status::TransactionTimeout => {
            TransferState::Ok
        }
        Status::Stalled => TransferState::Stall,
        _ => TransferState::Error,
    }
}

proptest! {
    #[test]
    fn prop_classify_is_total_and_matches_policy(status in any_status()) {
        prop_assert_eq!(classify(status), expected_state(status));
    }

    #[test]
    fn prop_classify_is_pure(status in any_status()) {
        let first = classify(status);
        for _ in 0..8 {
            prop_assert_eq!(classify(status), first);
        }
    }

    #[test]
    fn prop_from_status_keeps_length(status in any_status(), length in 0u32..u32::MAX) {
        let result = TransferResult::from_status(status, length);
        prop_assert_eq!(result.length, length);
        prop_assert_eq!(result.state, classify(status));
        prop_assert!(!result.is_dispatch_failure());
    }
}

#[test]
fn test_result_json_shape() {
    let result = TransferResult::from_status(Status::Success, 18);
    let json = serde_json::to_value(result).unwrap();
    assert_eq!(json["state"], "Ok");
    assert_eq!(json["length"], 18);

    let json = serde_json::to_value(TransferResult::DISPATCH_FAILED).unwrap();
    assert_eq!(json["state"], "Error");
    assert_eq!(json["length"], u32::MAX);
}
