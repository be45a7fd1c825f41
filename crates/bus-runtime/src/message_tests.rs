//! Tests for message types and identifiers.

use super::*;
use chrono::Duration as ChronoDuration;
use std::time::Duration;

// ============================================================================
// QueueAddress Tests
// ============================================================================

mod queue_address_tests {
    use super::*;

    #[test]
    fn test_bare_name_and_url_resolve_to_same_address() {
        let bare = QueueAddress::new("orders").unwrap();
        let url = QueueAddress::new("memory://broker/orders").unwrap();
        let https = QueueAddress::new("https://ns.example.net/Orders/").unwrap();

        assert_eq!(bare, url);
        assert_eq!(bare, https);
        assert_eq!(bare.as_str(), "orders");
    }

    #[test]
    fn test_url_without_path_uses_host() {
        let address = QueueAddress::new("memory://billing").unwrap();
        assert_eq!(address.as_str(), "billing");
    }

    #[test]
    fn test_address_is_case_insensitive() {
        assert_eq!(
            QueueAddress::new("Input-Queue").unwrap(),
            QueueAddress::new("input-queue").unwrap()
        );
    }

    #[test]
    fn test_invalid_addresses_are_rejected() {
        assert!(QueueAddress::new("").is_err());
        assert!(QueueAddress::new("-leading").is_err());
        assert!(QueueAddress::new("trailing-").is_err());
        assert!(QueueAddress::new("double--hyphen").is_err());
        assert!(QueueAddress::new("special@chars").is_err());
        assert!(QueueAddress::new("a".repeat(261)).is_err());
        assert!(QueueAddress::new("not a url://x").is_err());
    }

    #[test]
    fn test_address_deserialization_normalizes() {
        let address: QueueAddress = serde_json::from_str("\"memory://host/Payments\"").unwrap();
        assert_eq!(address.as_str(), "payments");

        let invalid: Result<QueueAddress, _> = serde_json::from_str("\"bad name\"");
        assert!(invalid.is_err());
    }
}

// ============================================================================
// TransportMessage Tests
// ============================================================================

mod transport_message_tests {
    use super::*;

    #[test]
    fn test_from_body_stamps_id_and_sent_time() {
        let message = TransportMessage::from_body("payload");

        assert!(message.message_id().is_some());
        assert!(message.header(headers::SENT_TIME).is_some());
        assert_eq!(message.body().as_ref(), b"payload");
    }

    #[test]
    fn test_with_header_replaces_existing_value() {
        let message = TransportMessage::new(Headers::new(), "x")
            .with_header("k", "v1")
            .with_header("k", "v2");

        assert_eq!(message.header("k"), Some("v2"));
        assert_eq!(message.headers().len(), 1);
    }

    #[test]
    fn test_without_header_removes_key() {
        let message = TransportMessage::from_body("x").without_header(headers::MESSAGE_ID);
        assert!(message.message_id().is_none());
    }

    #[test]
    fn test_message_without_ttl_never_expires() {
        let message = TransportMessage::from_body("x");
        assert!(message.expires_at().is_none());
        assert!(!message.is_expired_at(Utc::now() + ChronoDuration::days(365)));
    }

    #[test]
    fn test_expiry_is_sent_time_plus_ttl() {
        let sent = Utc::now();
        let message = TransportMessage::new(Headers::new(), "x")
            .with_header(headers::SENT_TIME, format_timestamp(sent))
            .with_time_to_live(Duration::from_secs(10));

        let expires = message.expires_at().unwrap();
        assert_eq!(expires, parse_timestamp(&format_timestamp(sent)).unwrap() + ChronoDuration::seconds(10));
        assert!(!message.is_expired_at(sent + ChronoDuration::seconds(5)));
        assert!(message.is_expired_at(sent + ChronoDuration::seconds(11)));
    }

    #[test]
    fn test_out_of_range_ttl_never_expires() {
        let sent = Utc::now();
        for ttl in [i64::MAX, i64::MIN] {
            let message = TransportMessage::from_body("x")
                .with_header(headers::SENT_TIME, format_timestamp(sent))
                .with_header(headers::TIME_TO_BE_RECEIVED, ttl.to_string());

            assert!(message.expires_at().is_none(), "ttl {}", ttl);
            assert!(!message.is_expired_at(sent + ChronoDuration::days(365)));
        }
    }

    #[test]
    fn test_unparsable_time_headers_are_ignored() {
        let message = TransportMessage::new(Headers::new(), "x")
            .with_header(headers::SENT_TIME, "yesterday")
            .with_header(headers::TIME_TO_BE_RECEIVED, "1000")
            .with_header(headers::DEFERRED_UNTIL, "later");

        assert!(message.expires_at().is_none());
        assert!(message.deferred_until().is_none());
    }

    #[test]
    fn test_deferred_until_round_trips_through_header() {
        let due = Utc::now() + ChronoDuration::minutes(5);
        let message = TransportMessage::from_body("x").with_deferred_until(due);

        let parsed = message.deferred_until().unwrap();
        assert!((parsed - due).num_milliseconds().abs() < 1);
    }
}

#[test]
fn test_message_id_generation() {
    let id1 = MessageId::new();
    let id2 = MessageId::new();
    assert_ne!(id1, id2);
    assert!(!id1.as_str().is_empty());
    assert!("".parse::<MessageId>().is_err());
}

#[test]
fn test_generated_bus_ids_are_unique() {
    assert_ne!(BusId::generate(), BusId::generate());
    assert_eq!(BusId::new("orders-bus").as_str(), "orders-bus");
}
