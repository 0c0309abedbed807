//! Tests for broker error classification.

use super::*;

#[test]
fn test_transient_errors_are_retryable() {
    let timeout = BrokerError::Timeout {
        duration: Duration::from_secs(5),
    };
    assert!(timeout.is_transient());
    assert!(timeout.should_retry());

    let unavailable = BrokerError::Unavailable {
        message: "connection reset".to_string(),
    };
    assert!(unavailable.is_transient());
}

#[test]
fn test_permanent_errors_are_not_retryable() {
    let not_found = BrokerError::EntityNotFound {
        entity: "orders".to_string(),
    };
    assert!(!not_found.is_transient());

    let missing = BrokerError::MessageNotFound {
        entity: "orders".to_string(),
        sequence_number: 42,
    };
    assert!(!missing.should_retry());

    let auth = BrokerError::AuthenticationFailed {
        message: "bad key".to_string(),
    };
    assert!(!auth.is_transient());
}

#[test]
fn test_error_display_includes_context() {
    let err = BrokerError::MessageNotFound {
        entity: "billing/subscriptions/audit".to_string(),
        sequence_number: 7,
    };
    let text = err.to_string();
    assert!(text.contains("billing/subscriptions/audit"));
    assert!(text.contains('7'));
    assert_eq!(err.code(), "message_not_found");
}
