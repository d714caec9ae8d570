//! Property-based tests for VEIL
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Replay Protection Properties
// ============================================================================

mod timestamp_properties {
    use super::*;
    use veil_core::TimestampTracker;
    use veil_crypto::PublicKey;

    proptest! {
        /// A timestamp is accepted exactly when it exceeds every timestamp
        /// accepted before it from the same source
        #[test]
        fn accepted_iff_strictly_increasing(timestamps in prop::collection::vec(0u64..64, 1..64)) {
            let tracker = TimestampTracker::new();
            let src = PublicKey::from_bytes([7; 32]);
            let mut high: Option<u64> = None;

            for ts in timestamps {
                let accepted = tracker.check_and_update(&src, ts).is_ok();
                let expected = high.is_none_or(|h| ts > h);
                prop_assert_eq!(accepted, expected);
                if accepted {
                    high = Some(ts);
                }
                prop_assert_eq!(tracker.last(&src), high);
            }
        }

        /// Sources never affect each other's ordering
        #[test]
        fn sources_are_independent(
            events in prop::collection::vec((0u8..4, 0u64..32), 1..96),
        ) {
            let tracker = TimestampTracker::new();
            let mut high = [None::<u64>; 4];

            for (src, ts) in events {
                let pk = PublicKey::from_bytes([src + 1; 32]);
                let accepted = tracker.check_and_update(&pk, ts).is_ok();
                let slot = &mut high[usize::from(src)];
                prop_assert_eq!(accepted, slot.is_none_or(|h| ts > h));
                if accepted {
                    *slot = Some(ts);
                }
            }
        }
    }
}

// ============================================================================
// Error Table Properties
// ============================================================================

mod error_code_properties {
    use super::*;
    use std::collections::HashSet;
    use veil_core::ErrorCode;

    #[test]
    fn codes_are_unique() {
        let codes: HashSet<u16> = ErrorCode::ALL.iter().map(|c| c.code()).collect();
        assert_eq!(codes.len(), ErrorCode::ALL.len());
    }

    #[test]
    fn messages_are_unique() {
        let messages: HashSet<&str> = ErrorCode::ALL.iter().map(|c| c.message()).collect();
        assert_eq!(messages.len(), ErrorCode::ALL.len());
    }

    proptest! {
        /// Any wire value either maps back to itself or is unknown
        #[test]
        fn from_code_is_consistent(value in any::<u16>()) {
            match ErrorCode::from_code(value) {
                Some(code) => prop_assert_eq!(code.code(), value),
                None => prop_assert!(ErrorCode::ALL.iter().all(|c| c.code() != value)),
            }
        }
    }
}

// ============================================================================
// Wire Decoding Robustness
// ============================================================================

mod decode_properties {
    use super::*;
    use veil_core::frame::{FRAME_HEADER_SIZE, Frame, MAX_FRAME_PAYLOAD};
    use veil_core::{SignedObject, StreamRequest};

    proptest! {
        /// Arbitrary bytes never panic the frame decoder, and anything it
        /// accepts has a consistent length
        #[test]
        fn frame_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
            if let Ok(frame) = Frame::decode(&data) {
                prop_assert!(frame.payload.len() <= MAX_FRAME_PAYLOAD);
                prop_assert_eq!(FRAME_HEADER_SIZE + frame.payload.len(), data.len());
            }
        }

        /// Arbitrary bytes never decode to a verified request
        #[test]
        fn garbage_is_never_a_valid_request(data in prop::collection::vec(any::<u8>(), 0..512)) {
            if let Ok(obj) = SignedObject::from_bytes(data) {
                prop_assert!(StreamRequest::open(&obj).is_err());
            }
        }
    }
}

// ============================================================================
// Retry Policy Properties
// ============================================================================

mod retry_properties {
    use super::*;
    use std::time::Duration;
    use veil_core::RetryConfig;

    proptest! {
        /// Backoff never exceeds the cap plus jitter
        #[test]
        fn backoff_is_bounded(
            attempt in 0u32..64,
            initial in 1u64..1_000,
            max in 1_000u64..60_000,
        ) {
            let config = RetryConfig {
                initial_backoff_ms: initial,
                max_backoff_ms: max,
                ..RetryConfig::default()
            };
            let delay = config.backoff_duration(attempt);
            prop_assert!(delay <= Duration::from_millis(max + max / 4));
        }

        /// Without jitter, backoff never decreases between attempts
        #[test]
        fn backoff_is_monotonic_without_jitter(attempt in 0u32..32) {
            let config = RetryConfig {
                jitter: false,
                ..RetryConfig::default()
            };
            prop_assert!(config.backoff_duration(attempt) <= config.backoff_duration(attempt + 1));
        }
    }
}
