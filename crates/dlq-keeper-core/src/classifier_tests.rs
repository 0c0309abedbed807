//! Tests for the failure classifier.

use super::*;

mod exact_match_tests {
    use super::*;

    /// Verify well-known broker reasons classify with high confidence
    #[test]
    fn test_known_reasons() {
        let classifier = FailureClassifier::default();

        let cases = [
            ("MaxDeliveryCountExceeded", FailureCategory::MaxDeliveryExceeded),
            ("TTLExpiredException", FailureCategory::Expired),
            ("MessageLockLost", FailureCategory::Transient),
            ("messagelocklost", FailureCategory::Transient),
        ];

        for (reason, expected) in cases {
            let result = classifier.classify(Some(reason), None, 1);
            assert_eq!(result.category, expected, "reason {}", reason);
            assert!(result.confidence >= 0.9);
        }
    }
}

mod keyword_tests {
    use super::*;

    /// Verify keyword matches in the description use keyword confidence
    #[test]
    fn test_description_keywords() {
        let classifier = FailureClassifier::default();

        let result = classifier.classify(
            Some("ProcessingFailed"),
            Some("Request timed out after 30s"),
            1,
        );

        assert_eq!(result.category, FailureCategory::Transient);
        assert_eq!(result.confidence, KEYWORD_CONFIDENCE);
    }

    /// Verify poison payloads are recognised before generic failures
    #[test]
    fn test_poison_before_generic_error() {
        let classifier = FailureClassifier::default();

        let result = classifier.classify(
            Some("HandlerException"),
            Some("Failed to deserialize payload: unexpected token"),
            3,
        );

        assert_eq!(result.category, FailureCategory::Poison);
    }

    /// Verify generic error wording falls back to a processing error
    #[test]
    fn test_generic_processing_error() {
        let classifier = FailureClassifier::default();

        let result = classifier.classify(Some("HandlerException"), None, 1);

        assert_eq!(result.category, FailureCategory::ProcessingError);
        assert_eq!(result.confidence, KEYWORD_CONFIDENCE);
    }
}

mod delivery_count_tests {
    use super::*;

    /// Verify high delivery counts infer exhausted retries at lower confidence
    #[test]
    fn test_delivery_count_inference() {
        let classifier = FailureClassifier::new(10);

        let result = classifier.classify(None, None, 10);

        assert_eq!(result.category, FailureCategory::MaxDeliveryExceeded);
        assert_eq!(result.confidence, DELIVERY_COUNT_CONFIDENCE);
    }

    /// Verify unmatched messages default to Unknown with zero confidence
    #[test]
    fn test_unknown_default() {
        let classifier = FailureClassifier::new(10);

        let result = classifier.classify(Some("  "), None, 2);

        assert_eq!(result, Classification::unknown());
    }
}
