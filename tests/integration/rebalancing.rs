//! Integration test: split and merge passes, and growing the ring.

use std::collections::BTreeSet;

use reef_integration_tests::{ClusterConfig, IntegrationCluster, collection_query, doc};
use reef_types::{ClusterEvent, RebalanceState};

fn single_node(shard_size: u64) -> ClusterConfig {
    ClusterConfig {
        nodes: 1,
        replication_factor: 1,
        write_quorum: 1,
        shard_size,
        ..Default::default()
    }
}

/// 40 items in one set; shrinking shard_size to 10 splits it in two and
/// every item stays reachable.
#[tokio::test]
#[ntest::timeout(20000)]
async fn test_oversized_set_splits() {
    let c = IntegrationCluster::new(single_node(100)).await;
    c.load_docs(0..40).await;
    assert_eq!(c.coord().registry().primaries(None).len(), 1);

    let c = c.reconfigured(10).await;
    let mut events = c.coord().subscribe();
    let report = c.coord().rebalance().await;
    assert_eq!(report.splits.len(), 1, "report: {report:?}");
    assert!(report.aborted.is_empty());

    let (source, created) = report.splits[0].clone();
    assert_eq!(
        events.recv().await.unwrap(),
        ClusterEvent::ShardSplit {
            source: source.clone(),
            created: created.clone(),
        }
    );

    let primaries = c.coord().registry().primaries(None);
    assert_eq!(primaries.len(), 2);
    assert_eq!(primaries.iter().map(|p| p.item_count).sum::<u64>(), 40);

    let mut homes = BTreeSet::new();
    for i in 0..40 {
        homes.insert(c.coord().find_shard(&doc(i)).unwrap());
    }
    assert_eq!(homes, BTreeSet::from([source, created]));

    let stats = c.coord().get_stats().await;
    assert!(
        stats
            .shards
            .iter()
            .all(|s| s.rebalance == RebalanceState::Balanced)
    );

    let response = c.execute(collection_query(50)).await.unwrap();
    assert!(!response.partial);
    assert_eq!(response.results.len(), 40);
    assert_eq!(response.stats.shards_queried, 2);
}

/// Three two-item sets; raising shard_size to 100 folds a sibling pair and
/// nothing is lost.
#[tokio::test]
#[ntest::timeout(20000)]
async fn test_undersized_sets_merge() {
    let c = IntegrationCluster::new(single_node(2)).await;
    c.load_docs(0..6).await;
    assert_eq!(c.coord().registry().primaries(None).len(), 3);

    let c = c.reconfigured(100).await;
    let report = c.coord().rebalance().await;
    assert_eq!(report.merges.len(), 1, "report: {report:?}");
    assert!(report.aborted.is_empty());

    let (source, target) = report.merges[0].clone();
    assert!(c.coord().registry().get(&source).is_err());
    assert_eq!(c.coord().registry().get(&target).unwrap().item_count, 4);

    let primaries = c.coord().registry().primaries(None);
    assert_eq!(primaries.len(), 2);
    for i in 0..6 {
        let home = c.coord().find_shard(&doc(i)).unwrap();
        assert_ne!(home, source, "doc-{i} still points at the merged set");
    }

    let response = c.execute(collection_query(10)).await.unwrap();
    assert!(!response.partial);
    assert_eq!(response.results.len(), 6);
}

/// Writes after a split land in the set that now owns the item.
#[tokio::test]
#[ntest::timeout(20000)]
async fn test_writes_after_split() {
    let c = IntegrationCluster::new(single_node(100)).await;
    c.load_docs(0..40).await;
    let c = c.reconfigured(10).await;
    c.coord().rebalance().await;

    let before = c.coord().locate(&doc(39)).unwrap();
    let after = c.assign_doc(39).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(c.coord().get_stats().await.total_items, 40);

    // A second pass keeps splitting sets still above 15 items.
    let report = c.coord().rebalance().await;
    assert_eq!(report.splits.len(), 2);
    assert_eq!(c.coord().registry().primaries(None).len(), 4);
}

/// Sets created while the ring was short of nodes gain replicas once a
/// node joins and repair runs.
#[tokio::test]
#[ntest::timeout(20000)]
async fn test_joined_node_completes_short_sets() {
    let c = IntegrationCluster::new(ClusterConfig {
        nodes: 2,
        write_quorum: 2,
        ..Default::default()
    })
    .await;
    c.load_docs(0..8).await;
    assert!(c.coord().get_stats().await.degraded_shards > 0);

    let joined = c.add_node().await;
    let report = c.coord().repair().await;
    assert!(report.failed.is_empty(), "repair failures: {:?}", report.failed);
    assert!(!report.repaired.is_empty());

    let stats = c.coord().get_stats().await;
    assert_eq!(stats.degraded_shards, 0);
    assert!(stats.nodes[&joined].replica_shards + stats.nodes[&joined].primary_shards > 0);
    for i in 0..8 {
        assert_eq!(c.coord().locate(&doc(i)).unwrap().len(), 3, "doc-{i}");
    }

    let response = c.execute(collection_query(10)).await.unwrap();
    assert!(!response.partial);
    assert_eq!(response.results.len(), 8);
}
