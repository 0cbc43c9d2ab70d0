//! Chaos test: failing shards, random replica drops, slow replicas and
//! budget pressure.

use std::collections::BTreeSet;
use std::time::Duration;

use reef_integration_tests::{
    ChaosConfig, ClusterConfig, IntegrationCluster, collection_query, doc,
};
use reef_query::{BudgetLimits, BudgetResource};
use reef_types::ItemId;

/// One of three sets failing: the response is partial, names the failed
/// set, and still carries the other two sets' items.
#[tokio::test]
#[ntest::timeout(20000)]
async fn test_one_failed_set_is_partial() {
    let c = IntegrationCluster::new(ClusterConfig {
        nodes: 1,
        replication_factor: 1,
        write_quorum: 1,
        shard_size: 2,
        ..Default::default()
    })
    .await;
    c.load_docs(0..6).await;
    assert_eq!(c.coord().registry().primaries(None).len(), 3);

    let failed = c.fail_set_of(&doc(2)).await;
    let response = c.execute(collection_query(10)).await.unwrap();

    assert!(response.partial);
    assert_eq!(response.failed_shards, vec![failed]);
    assert_eq!(response.stats.shards_queried, 3);
    assert_eq!(response.stats.shards_failed, 1);
    let found: BTreeSet<ItemId> = response.results.iter().map(|r| r.item_id.clone()).collect();
    assert_eq!(found, BTreeSet::from([doc(0), doc(1), doc(4), doc(5)]));

    c.chaos().heal_shards().await;
    let healed = c.execute(collection_query(10)).await.unwrap();
    assert!(!healed.partial);
    assert_eq!(healed.results.len(), 6);
}

/// Seeded random drops never surface as errors, and `partial` tracks the
/// failed set list exactly.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_random_drops_degrade_gracefully() {
    let c = IntegrationCluster::new(ClusterConfig {
        nodes: 4,
        shard_size: 4,
        chaos: ChaosConfig {
            failure_rate: 0.3,
            seed: 42,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    c.load_docs(0..30).await;
    c.link_chain(0..29);

    let mut complete = 0;
    for _ in 0..20 {
        let response = c.execute(collection_query(10)).await.unwrap();
        assert_eq!(response.partial, !response.failed_shards.is_empty());
        assert!(response.results.len() <= 10);
        if !response.partial {
            complete += 1;
            assert_eq!(response.results.len(), 10);
        }
    }
    // Three replicas per set make a full miss rare at a 30% drop rate.
    assert!(complete > 0);
    assert!(c.chaos().stats().dropped > 0);
}

/// Replicas slower than the query deadline are abandoned, not awaited.
#[tokio::test]
#[ntest::timeout(10000)]
async fn test_slow_replicas_time_out() {
    let c = IntegrationCluster::new(ClusterConfig {
        chaos: ChaosConfig {
            latency_ms: (500, 500),
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    c.load_docs(0..5).await;

    let started = std::time::Instant::now();
    let response = c
        .execute(collection_query(5).with_limits(BudgetLimits {
            time_limit: Duration::from_millis(100),
            ..Default::default()
        }))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(450));
    assert!(response.partial);
    assert!(response.results.is_empty());
    assert_eq!(response.failed_shards.len(), response.stats.shards_queried);
}

/// A node budget far below the collection size caps the work done and
/// marks the response partial.
#[tokio::test]
#[ntest::timeout(20000)]
async fn test_node_budget_caps_work() {
    let c = IntegrationCluster::new(ClusterConfig::default()).await;
    c.load_docs(0..20).await;
    c.link_chain(0..19);

    let response = c
        .execute(collection_query(10).with_limits(BudgetLimits {
            max_nodes_visited: 5,
            ..Default::default()
        }))
        .await
        .unwrap();

    assert!(response.stats.nodes_visited <= 5);
    assert!(response.results.len() <= 5);
    assert!(response.partial);
    assert_eq!(
        response.stats.budget_exhausted,
        Some(BudgetResource::NodesVisited)
    );
}
