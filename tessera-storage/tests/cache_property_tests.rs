//! Property-Based Tests for the Tiered Cache
//!
//! **Property 1: Read-through promotion**
//! **Property 2: Tag invalidation completeness**
//! **Property 3: Level failures degrade to misses**

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use tessera_core::{CacheConfig, HealthStatus};
use tessera_storage::{CacheCoordinator, GetOptions, InMemoryKeyValueBackend, SetOptions};
use tessera_test_utils::fixtures::{cache_config, coordinator, coordinator_with};
use tessera_test_utils::generators::{arb_cache_key, arb_tags, arb_value};
use tessera_test_utils::{FailingBackend, FlakyBackend, RecordingMetricsSink, SlowBackend};
use tokio::runtime::Runtime;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

async fn level_holds(coordinator: &CacheCoordinator, level: &str, key: &str) -> bool {
    match coordinator.level(level) {
        Some(level) => matches!(level.get(key).await, Ok(Some(_))),
        None => false,
    }
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// **Property 1: Read-through promotion**
    ///
    /// For any key held only by the slowest level, a read returns the value
    /// and afterwards every faster level holds it too.
    #[test]
    fn prop_hit_promotes_into_faster_levels(key in arb_cache_key(), value in arb_value()) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let cache = coordinator();
            let outcome = cache
                .set(&key, value.clone(), &SetOptions::default().levels(["durable"]))
                .await;
            prop_assert_eq!(outcome.written, vec!["durable".to_string()]);
            prop_assert!(!level_holds(&cache, "memory", &key).await);

            let read = cache.get(&key, &GetOptions::default()).await;
            prop_assert_eq!(read, Some(value));
            prop_assert!(level_holds(&cache, "memory", &key).await);
            prop_assert!(level_holds(&cache, "remote", &key).await);
            Ok(())
        })?;
    }

    /// **Property 2: Tag invalidation completeness**
    ///
    /// After invalidating a tag, no key written under it is readable from
    /// any level, and keys without the tag are untouched.
    #[test]
    fn prop_invalidation_removes_every_tagged_key(
        entries in prop::collection::btree_map(arb_cache_key(), arb_tags(3), 1..20),
        value in arb_value(),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let cache = coordinator();
            for (key, tags) in &entries {
                let options = SetOptions { tags: tags.clone(), ..SetOptions::default() };
                cache.set(key, value.clone(), &options).await;
            }

            let Some(victim) = entries.values().flatten().next().cloned() else {
                return Ok(());
            };
            let expected = entries.values().filter(|tags| tags.contains(&victim)).count();
            let invalidated = cache.invalidate_by_tags(&[victim.clone()]).await;
            prop_assert_eq!(invalidated, expected);
            prop_assert!(cache.keys_for_tag(&victim).is_empty());

            for (key, tags) in &entries {
                let read = cache.get(key, &GetOptions::default()).await;
                if tags.contains(&victim) {
                    prop_assert_eq!(read, None, "{} survived invalidation", key);
                } else {
                    prop_assert_eq!(read, Some(value.clone()));
                }
            }
            Ok(())
        })?;
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

/// A 100ms entry is served at 50ms and gone at 150ms.
#[tokio::test(start_paused = true)]
async fn test_ttl_expiry_across_levels() {
    let cache = coordinator_with(
        &cache_config(Duration::from_secs(300)),
        Arc::new(InMemoryKeyValueBackend::new()),
        Arc::new(InMemoryKeyValueBackend::new()),
    );
    let options = SetOptions::default()
        .ttl(Duration::from_millis(100))
        .tag("cohort-A");
    let outcome = cache.set("student:42", b"grades".to_vec(), &options).await;
    assert!(outcome.is_complete());
    assert_eq!(outcome.written.len(), 3);

    tokio::time::advance(Duration::from_millis(50)).await;
    assert_eq!(
        cache.get("student:42", &GetOptions::default()).await,
        Some(b"grades".to_vec())
    );

    tokio::time::advance(Duration::from_millis(100)).await;
    assert_eq!(cache.get("student:42", &GetOptions::default()).await, None);
}

/// Promoted copies never outlive the source entry.
#[tokio::test(start_paused = true)]
async fn test_promotion_keeps_remaining_ttl() {
    let cache = coordinator();
    cache
        .set(
            "course:7",
            b"syllabus".to_vec(),
            &SetOptions::default()
                .ttl(Duration::from_millis(200))
                .levels(["durable"]),
        )
        .await;

    tokio::time::advance(Duration::from_millis(150)).await;
    assert!(cache.get("course:7", &GetOptions::default()).await.is_some());
    assert!(level_holds(&cache, "memory", "course:7").await);

    tokio::time::advance(Duration::from_millis(60)).await;
    assert!(!level_holds(&cache, "memory", "course:7").await);
    assert_eq!(cache.get("course:7", &GetOptions::default()).await, None);
}

/// **Property 3: Level failures degrade to misses**
#[tokio::test]
async fn test_unreachable_level_is_a_miss() {
    let failing = Arc::new(FailingBackend::new());
    let sink = RecordingMetricsSink::shared();
    let cache = coordinator_with(
        &CacheConfig::default(),
        failing.clone(),
        Arc::new(InMemoryKeyValueBackend::new()),
    )
    .with_metrics(sink.clone());

    let outcome = cache
        .set("student:1", b"v".to_vec(), &SetOptions::default())
        .await;
    assert_eq!(outcome.failed, vec!["remote".to_string()]);
    assert_eq!(outcome.written, vec!["memory".to_string(), "durable".to_string()]);

    let read = cache
        .get("student:1", &GetOptions::default().skip("memory"))
        .await;
    assert_eq!(read, Some(b"v".to_vec()));
    assert!(failing.calls() >= 2);
    assert!(sink.counter_total("tessera_cache_level_failures_total") >= 2);

    let health = cache.health().await;
    let remote = health
        .levels
        .iter()
        .find(|check| check.component == "remote")
        .expect("remote level reported");
    assert_eq!(remote.status, HealthStatus::Unhealthy);
    assert_ne!(health.status, HealthStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_slow_level_times_out() {
    let cache = coordinator_with(
        &CacheConfig::default(),
        Arc::new(SlowBackend::new(Duration::from_secs(5))),
        Arc::new(InMemoryKeyValueBackend::new()),
    );

    let outcome = cache
        .set("student:9", b"slow".to_vec(), &SetOptions::default())
        .await;
    assert_eq!(outcome.failed, vec!["remote".to_string()]);

    let started = tokio::time::Instant::now();
    let read = cache
        .get("student:9", &GetOptions::default().skip("memory"))
        .await;
    assert_eq!(read, Some(b"slow".to_vec()));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_recovered_level_serves_again() {
    let flaky = Arc::new(FlakyBackend::new());
    let cache = coordinator_with(
        &CacheConfig::default(),
        flaky.clone(),
        Arc::new(InMemoryKeyValueBackend::new()),
    );

    flaky.set_down(true);
    let outcome = cache
        .set("cohort:A", b"roster".to_vec(), &SetOptions::default())
        .await;
    assert!(!outcome.is_complete());

    flaky.set_down(false);
    let outcome = cache
        .set("cohort:A", b"roster".to_vec(), &SetOptions::default())
        .await;
    assert!(outcome.is_complete());
    assert_eq!(
        cache
            .get("cohort:A", &GetOptions::default().skip("memory"))
            .await,
        Some(b"roster".to_vec())
    );
}

#[tokio::test]
async fn test_failed_invalidation_is_retried_after_recovery() {
    let flaky = Arc::new(FlakyBackend::new());
    let cache = coordinator_with(
        &CacheConfig::default(),
        flaky.clone(),
        Arc::new(InMemoryKeyValueBackend::new()),
    );
    cache
        .set(
            "student:1",
            b"old".to_vec(),
            &SetOptions::default().tag("cohort-A").levels(["remote"]),
        )
        .await;

    flaky.set_down(true);
    assert_eq!(cache.invalidate_by_tags(&["cohort-A".to_string()]).await, 0);
    assert_eq!(cache.keys_for_tag("cohort-A"), vec!["student:1".to_string()]);

    flaky.set_down(false);
    assert_eq!(cache.invalidate_by_tags(&["cohort-A".to_string()]).await, 1);
    assert!(cache.keys_for_tag("cohort-A").is_empty());
    assert_eq!(cache.get("student:1", &GetOptions::default()).await, None);
}

#[tokio::test]
async fn test_failed_delete_keeps_key_indexed() {
    let flaky = Arc::new(FlakyBackend::new());
    let cache = coordinator_with(
        &CacheConfig::default(),
        flaky.clone(),
        Arc::new(InMemoryKeyValueBackend::new()),
    );
    cache
        .set("student:2", b"old".to_vec(), &SetOptions::default().tag("cohort-B"))
        .await;

    flaky.set_down(true);
    cache.delete("student:2").await;
    assert_eq!(cache.keys_for_tag("cohort-B"), vec!["student:2".to_string()]);

    // The remote level still knows the tag, so its own sweep can finish the job.
    flaky.set_down(false);
    let remote = cache.level("remote").unwrap();
    assert_eq!(remote.delete_by_tag("cohort-B").await.unwrap(), 1);
    assert_eq!(
        cache
            .get("student:2", &GetOptions::default().skip("memory").skip("durable"))
            .await,
        None
    );
}
