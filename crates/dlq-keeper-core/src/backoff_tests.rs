//! Tests for backoff policies

use super::*;

#[test]
fn test_exponential_delay_doubles_until_cap() {
    let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(16));

    assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    assert_eq!(policy.delay_for(4), Duration::from_secs(16));
    assert_eq!(policy.delay_for(5), Duration::from_secs(16));
}

/// Verify large attempt numbers do not overflow
#[test]
fn test_exponential_delay_saturates() {
    let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(30));

    assert_eq!(policy.delay_for(64), Duration::from_secs(30));
    assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
}

#[test]
fn test_fixed_delay_is_constant() {
    let policy = BackoffPolicy::fixed(Duration::from_millis(250));

    assert_eq!(policy.delay_for(0), Duration::from_millis(250));
    assert_eq!(policy.delay_for(7), Duration::from_millis(250));
}

/// Verify the rule action selects the backoff mode
#[test]
fn test_policy_for_action() {
    let base = Duration::from_millis(100);
    let max = Duration::from_secs(5);

    let mut action = RuleAction::default();
    assert!(BackoffPolicy::for_action(&action, base, max).exponential);

    action.exponential_backoff = false;
    let policy = BackoffPolicy::for_action(&action, base, max);
    assert!(!policy.exponential);
    assert_eq!(policy.delay_for(3), base);
}
