//! Property-Based Tests for Privacy Transforms and Budgets
//!
//! **Property 1: Budget monotonicity**
//! **Property 2: Deterministic hashing and pseudonyms**
//! **Property 3: Rule order independence**
//! **Property 4: Detected PII never survives suggested rules**

use std::sync::Arc;

use proptest::prelude::*;
use tessera_core::{DataRecord, PrivacyError};
use tessera_privacy::{
    AnonymizationRule, Anonymizer, NoiseConfig, NoiseInjector, PiiDetector, PrivacyBudgetLedger,
};
use tessera_test_utils::assertions::assert_within_budget;
use tessera_test_utils::fixtures::{privacy_engine, student_record};
use tessera_test_utils::generators::{arb_email, arb_epsilon, arb_student_record};
use tessera_test_utils::RecordingMetricsSink;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn anonymizer() -> Anonymizer {
    Anonymizer::new("[REDACTED]", b"property-secret")
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// **Property 1: Budget monotonicity**
    ///
    /// For any sequence of requests, consumption never decreases, never
    /// exceeds the limit, and a rejected request changes nothing.
    #[test]
    fn prop_budget_is_monotonic_and_bounded(
        limit in arb_epsilon(),
        requests in prop::collection::vec(arb_epsilon(), 1..40),
    ) {
        let ledger = PrivacyBudgetLedger::new();
        ledger.register_purpose("analytics", limit).unwrap();

        let mut previous = 0.0;
        for epsilon in requests {
            let before = ledger.consumed("analytics").unwrap();
            match ledger.check_and_consume("analytics", epsilon) {
                Ok(grant) => {
                    prop_assert!(grant.consumed >= previous);
                    prop_assert!(grant.consumed <= limit);
                    previous = grant.consumed;
                }
                Err(PrivacyError::BudgetExceeded { consumed, .. }) => {
                    prop_assert_eq!(consumed, before);
                    prop_assert_eq!(ledger.consumed("analytics").unwrap(), before);
                }
                Err(other) => prop_assert!(false, "unexpected error {:?}", other),
            }
        }
        assert_within_budget(&ledger, "analytics");
    }

    /// **Property 2: Deterministic hashing and pseudonyms**
    ///
    /// The same input always maps to the same output; different inputs
    /// map to different outputs.
    #[test]
    fn prop_hash_and_pseudonym_are_deterministic(a in arb_email(), b in arb_email()) {
        let anonymizer = anonymizer();
        let rules = [
            AnonymizationRule::hash("email"),
            AnonymizationRule::pseudonymize("alias"),
        ];
        let record = |email: &str| DataRecord::new().with("email", email).with("alias", email);

        let first = anonymizer.apply(&record(&a), &rules).unwrap();
        let again = anonymizer.apply(&record(&a), &rules).unwrap();
        prop_assert_eq!(&first, &again);
        prop_assert_ne!(first.get("email"), first.get("alias"));

        let other = anonymizer.apply(&record(&b), &rules).unwrap();
        if a != b {
            prop_assert_ne!(first.get("email"), other.get("email"));
            prop_assert_ne!(first.get("alias"), other.get("alias"));
        }
    }

    /// **Property 3: Rule order independence**
    ///
    /// Rules target distinct fields, so their order does not matter.
    #[test]
    fn prop_rule_order_is_irrelevant(record in arb_student_record()) {
        let anonymizer = anonymizer();
        let rules = vec![
            AnonymizationRule::hash("email"),
            AnonymizationRule::generalize("age").with_param("bucket", 5),
            AnonymizationRule::redact("student_id"),
            AnonymizationRule::suppress("score"),
        ];
        let mut reversed = rules.clone();
        reversed.reverse();

        let forward = anonymizer.apply(&record, &rules).unwrap();
        let backward = anonymizer.apply(&record, &reversed).unwrap();
        prop_assert_eq!(&forward, &backward);
        prop_assert!(!forward.contains("score"));
        prop_assert_eq!(forward.get("student_id"), Some(&serde_json::json!("[REDACTED]")));
    }

    /// **Property 4: Detected PII never survives suggested rules**
    #[test]
    fn prop_suggested_rules_cover_detected_fields(record in arb_student_record()) {
        let detector = PiiDetector::default();
        let report = detector.detect(&record);
        prop_assert!(report.fields().contains(&"email".to_string()));

        let cleaned = anonymizer().apply(&record, &report.suggested_rules()).unwrap();
        for field in report.fields() {
            prop_assert_ne!(cleaned.get(&field), record.get(&field), "{} unchanged", field);
        }
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn test_budget_rejects_overdraw_without_side_effects() {
    let sink = RecordingMetricsSink::shared();
    let ledger = PrivacyBudgetLedger::new().with_metrics(sink.clone());
    ledger.register_purpose("analytics", 5.0).unwrap();

    assert!(ledger.check_budget("analytics", 4.5));
    assert!(!ledger.check_budget("analytics", 0.6));
    assert!((ledger.consumed("analytics").unwrap() - 4.5).abs() < 1e-9);
    assert_eq!(
        sink.counter_total("tessera_privacy_budget_rejections_total"),
        1
    );

    // Exactly reaching the limit is allowed.
    assert!(ledger.check_budget("analytics", 0.5));
    assert!(ledger.remaining("analytics").unwrap() < 1e-9);
}

#[test]
fn test_unknown_purpose_is_rejected() {
    let ledger = PrivacyBudgetLedger::new();
    assert!(matches!(
        ledger.check_and_consume("marketing", 0.1),
        Err(PrivacyError::UnknownPurpose { .. })
    ));
    assert!(!ledger.check_budget("marketing", 0.1));
}

#[test]
fn test_concurrent_releases_respect_limit() {
    let ledger = Arc::new(PrivacyBudgetLedger::new());
    ledger.register_purpose("research", 1.0).unwrap();
    let injector = NoiseInjector::new(Arc::clone(&ledger));
    let config = NoiseConfig::laplace(0.1, 1.0);

    let granted: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let injector = injector.clone();
                scope.spawn(move || {
                    (0..5)
                        .filter(|_| injector.release("research", 100.0, &config).is_ok())
                        .count()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    assert_eq!(granted, 10);
    assert_within_budget(&ledger, "research");
}

#[test]
fn test_engine_from_config_registers_budgets() {
    let engine = privacy_engine();
    assert_eq!(engine.ledger().remaining("analytics"), Some(5.0));
    assert_eq!(engine.ledger().remaining("research"), Some(1.0));

    let report = engine.detect(&student_record());
    assert_eq!(report.fields(), vec!["email".to_string()]);

    let anonymized = engine
        .apply(&student_record(), &report.suggested_rules())
        .unwrap();
    assert_ne!(anonymized.get("email"), student_record().get("email"));
    assert_eq!(anonymized.get("student_id"), student_record().get("student_id"));
}
