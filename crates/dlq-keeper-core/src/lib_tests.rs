//! Tests for shared identifier, time and error types.

use super::*;

mod identifier_tests {
    use super::*;

    /// Verify that ULID identifiers round-trip through their string form
    #[test]
    fn test_rule_id_parses_own_display() {
        let id = RuleId::new();
        let parsed: RuleId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    /// Verify that malformed identifiers are rejected with a parse error
    #[test]
    fn test_message_id_rejects_garbage() {
        let result = "not-a-ulid".parse::<DlqMessageId>();
        assert!(matches!(result, Err(ParseError::InvalidFormat { .. })));
    }

    /// Verify namespace identifier validation rules
    #[test]
    fn test_namespace_id_validation() {
        assert!(NamespaceId::new("ns-prod").is_ok());
        assert!(matches!(
            NamespaceId::new(""),
            Err(ValidationError::Required { .. })
        ));
        assert!(matches!(
            NamespaceId::new("has space"),
            Err(ValidationError::InvalidCharacters { .. })
        ));
        assert!(matches!(
            NamespaceId::new("n".repeat(129)),
            Err(ValidationError::TooLong { .. })
        ));
    }

    /// Verify that namespace identifiers are validated during deserialization
    #[test]
    fn test_namespace_id_deserialization_validates() {
        let ok: NamespaceId = serde_json::from_str("\"ns-a\"").unwrap();
        assert_eq!(ok.as_str(), "ns-a");

        let err = serde_json::from_str::<NamespaceId>("\"\"");
        assert!(err.is_err());
    }
}

mod timestamp_tests {
    use super::*;

    /// Verify duration arithmetic on timestamps
    #[test]
    fn test_add_and_subtract_duration() {
        let base = Timestamp::from_rfc3339("2026-01-01T12:00:00Z").unwrap();
        let later = base.add_duration(Duration::from_secs(90));
        let earlier = base.subtract_duration(Duration::from_secs(3600));

        assert_eq!(later.duration_since(base), Duration::from_secs(90));
        assert_eq!(base.duration_since(earlier), Duration::from_secs(3600));
        assert_eq!(earlier.duration_since(base), Duration::ZERO);
    }

    /// Verify ordering follows wall-clock time
    #[test]
    fn test_ordering() {
        let a = Timestamp::from_rfc3339("2026-01-01T00:00:00Z").unwrap();
        let b = Timestamp::from_rfc3339("2026-01-02T00:00:00Z").unwrap();
        assert!(a < b);
        assert_eq!(b.date().to_string(), "2026-01-02");
    }
}

mod error_tests {
    use super::*;

    /// Verify validation errors are permanent
    #[test]
    fn test_validation_error_category() {
        let error = DlqKeeperError::from(ValidationError::Required {
            field: "name".to_string(),
        });
        assert!(!error.is_transient());
        assert_eq!(error.error_category(), ErrorCategory::Permanent);
    }

    /// Verify business rule violations are categorised separately
    #[test]
    fn test_business_rule_category() {
        let error = DlqKeeperError::BusinessRule {
            message: "rule disabled".to_string(),
        };
        assert_eq!(error.error_category(), ErrorCategory::BusinessRule);

        let executor = DlqKeeperError::from(ExecutorError::AlreadyReplayed {
            message_id: DlqMessageId::new(),
        });
        assert_eq!(executor.error_category(), ErrorCategory::BusinessRule);
    }

    /// Verify transient broker failures are categorised as transient
    #[test]
    fn test_broker_error_category() {
        let error = DlqKeeperError::from(dlq_broker::BrokerError::Unavailable {
            message: "down".to_string(),
        });
        assert!(error.is_transient());
        assert_eq!(error.error_category(), ErrorCategory::Transient);
    }
}
