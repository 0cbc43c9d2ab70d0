//! Integration test: node departures, dead replicas and failed writes.

use std::collections::BTreeSet;

use reef_coord::CoordError;
use reef_integration_tests::{
    ClusterConfig, IntegrationCluster, collection_query, doc, node_name,
};
use reef_types::{NodeId, QueryScope};

fn four_nodes() -> ClusterConfig {
    ClusterConfig {
        nodes: 4,
        write_quorum: 2,
        ..Default::default()
    }
}

/// A departed node's sets are promoted, re-replicated by repair, and every
/// item stays queryable.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_remove_node_then_repair() {
    let c = IntegrationCluster::new(four_nodes()).await;
    c.load_docs(0..12).await;
    c.link_chain(0..11);

    let gone = node_name(0);
    c.remove_node(&gone).await.unwrap();
    assert_eq!(c.node_ids().await.len(), 3);

    let degraded = c.coord().get_stats().await;
    assert!(degraded.degraded_shards > 0);
    assert!(degraded.repair_queue_len > 0);

    let report = c.coord().repair().await;
    assert!(report.failed.is_empty(), "repair failures: {:?}", report.failed);
    assert!(!report.removed.is_empty());

    let stats = c.coord().get_stats().await;
    assert_eq!(stats.degraded_shards, 0);
    assert_eq!(stats.repair_queue_len, 0);
    assert!(!stats.nodes.contains_key(&gone));
    for shard in &stats.shards {
        assert_ne!(shard.node_id, gone);
        assert_eq!(shard.replicas.len(), 3);
    }

    for i in 0..12 {
        let set = c.coord().locate(&doc(i)).unwrap();
        assert_eq!(set.len(), 3, "doc-{i}");
    }

    let response = c.execute(collection_query(20)).await.unwrap();
    assert!(!response.partial, "failed shards: {:?}", response.failed_shards);
    assert_eq!(response.results.len(), 12);
}

/// A dead first replica is failed over within the set; the response is
/// complete.
#[tokio::test]
#[ntest::timeout(20000)]
async fn test_dead_replica_fails_over() {
    let c = IntegrationCluster::new(ClusterConfig::default()).await;
    c.load_docs(0..9).await;

    let target = c
        .coord()
        .query_targets(&QueryScope::Item(doc(0)))
        .unwrap()
        .remove(0);
    let first = target.replicas[0].node_id.clone();
    c.chaos().kill_node(&first).await;

    let response = c.execute(collection_query(20)).await.unwrap();
    assert!(!response.partial, "failed shards: {:?}", response.failed_shards);
    assert_eq!(response.results.len(), 9);
    assert!(response.stats.replica_failures > 0);
    assert!(c.chaos().stats().blocked > 0);

    c.chaos().revive_node(&first).await;
    let healed = c.execute(collection_query(20)).await.unwrap();
    assert_eq!(healed.stats.replica_failures, 0);
    assert_eq!(healed.results, response.results);
}

/// Every replica down: the set is reported failed, not silently dropped.
#[tokio::test]
#[ntest::timeout(20000)]
async fn test_all_replicas_down_is_partial() {
    let c = IntegrationCluster::new(ClusterConfig::default()).await;
    c.load_docs(0..3).await;

    for node in c.node_ids().await {
        c.chaos().kill_node(&node).await;
    }
    let response = c.execute(collection_query(10)).await.unwrap();
    assert!(response.partial);
    assert!(response.results.is_empty());
    assert_eq!(response.failed_shards.len(), response.stats.shards_queried);
}

/// With two of three stores refusing writes, W=2 cannot be met: the
/// assignment fails and leaves no trace in the registry.
#[tokio::test]
#[ntest::timeout(20000)]
async fn test_write_quorum_failure_leaves_registry_unchanged() {
    let c = IntegrationCluster::new(ClusterConfig {
        write_quorum: 2,
        ..Default::default()
    })
    .await;
    c.load_docs(0..4).await;
    let before = c.coord().get_stats().await;

    c.store(&NodeId::from("A")).set_fail_writes(true);
    c.store(&NodeId::from("B")).set_fail_writes(true);

    let err = c.assign_doc(99).await.unwrap_err();
    assert!(
        matches!(err, CoordError::QuorumNotReached { acked: 1, required: 2, .. }),
        "unexpected error: {err}"
    );
    assert!(c.coord().find_shard(&doc(99)).is_err());

    let after = c.coord().get_stats().await;
    assert_eq!(after.total_items, before.total_items);
    let ids = |s: &reef_coord::ClusterStats| {
        s.shards
            .iter()
            .map(|s| (s.shard_id.clone(), s.item_count))
            .collect::<BTreeSet<_>>()
    };
    assert_eq!(ids(&after), ids(&before));

    c.store(&NodeId::from("A")).set_fail_writes(false);
    c.store(&NodeId::from("B")).set_fail_writes(false);
    let set = c.assign_doc(99).await.unwrap();
    assert_eq!(c.coord().locate(&doc(99)).unwrap(), set);
    assert_eq!(c.coord().get_stats().await.total_items, before.total_items + 1);
}

/// One store missing a write under W=2 leaves its record unhealthy until
/// repair re-copies it.
#[tokio::test]
#[ntest::timeout(20000)]
async fn test_missed_write_is_repaired() {
    let c = IntegrationCluster::new(ClusterConfig {
        write_quorum: 2,
        ..Default::default()
    })
    .await;
    c.load_docs(0..2).await;

    let lagging = NodeId::from("C");
    c.store(&lagging).set_fail_writes(true);
    c.load_docs(2..4).await;
    assert!(c.coord().get_stats().await.degraded_shards > 0);

    c.store(&lagging).set_fail_writes(false);
    let report = c.coord().repair().await;
    assert!(report.failed.is_empty(), "repair failures: {:?}", report.failed);
    assert!(!report.restored.is_empty());

    let stats = c.coord().get_stats().await;
    assert_eq!(stats.degraded_shards, 0);
    assert!(stats.shards.iter().all(|s| s.healthy));
}
