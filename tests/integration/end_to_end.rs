//! Integration test: placement and queries across a healthy cluster.

use std::collections::BTreeSet;
use std::time::Duration;

use reef_integration_tests::{
    ChaosConfig, ClusterConfig, IntegrationCluster, collection_query, doc,
};
use reef_query::BudgetLimits;
use reef_types::{Cid, ItemId, NodeId};

/// Ring {A,B,C}, rf 3: doc-42 lands on all three nodes in a stable order,
/// and a budgeted query over ten items completes within its limits.
#[tokio::test]
#[ntest::timeout(20000)]
async fn test_three_node_doc_42() {
    let c = IntegrationCluster::new(ClusterConfig::default()).await;

    let id = ItemId::from("doc-42");
    let cid = Cid::from_data(b"doc-42");
    let set = c
        .coord()
        .assign_shards(&reef_integration_tests::collection(), &id, cid)
        .await
        .unwrap();
    let owners: Vec<NodeId> = set
        .iter()
        .map(|s| c.coord().registry().get(s).unwrap().node_id)
        .collect();
    assert_eq!(
        owners.iter().cloned().collect::<BTreeSet<_>>(),
        BTreeSet::from([NodeId::from("A"), NodeId::from("B"), NodeId::from("C")])
    );
    for _ in 0..5 {
        assert_eq!(c.coord().locate(&id).unwrap(), set);
    }

    c.load_docs(0..10).await;
    c.link_chain(0..9);

    let response = c
        .execute(collection_query(5).with_limits(BudgetLimits {
            max_hops: 1,
            max_nodes_visited: 50,
            max_results: 100,
            time_limit: Duration::from_secs(2),
        }))
        .await
        .unwrap();

    assert!(response.results.len() <= 5);
    assert!(!response.results.is_empty());
    assert!(!response.partial, "failed shards: {:?}", response.failed_shards);
    assert!(response.stats.nodes_visited <= 50);
    assert!(response.stats.hops_used <= response.stats.shards_queried as u32);
}

/// Every assignment spans exactly rf distinct nodes while the ring has
/// enough of them.
#[tokio::test]
#[ntest::timeout(20000)]
async fn test_replication_invariant() {
    let c = IntegrationCluster::new(ClusterConfig {
        nodes: 6,
        ..Default::default()
    })
    .await;

    for i in 0..100 {
        let set = c.assign_doc(i).await.unwrap();
        assert_eq!(set.len(), 3, "doc-{i} set {set:?}");
        let nodes: BTreeSet<NodeId> = set
            .iter()
            .map(|s| c.coord().registry().get(s).unwrap().node_id)
            .collect();
        assert_eq!(nodes.len(), 3, "doc-{i} reused a node");
    }

    let stats = c.coord().get_stats().await;
    assert_eq!(stats.total_items, 100);
    assert_eq!(stats.degraded_shards, 0);
    let items: u64 = stats.nodes.values().map(|n| n.items).sum();
    assert_eq!(items, 300);
}

/// Fewer nodes than rf: sets shrink to the ring size and stay degraded.
#[tokio::test]
#[ntest::timeout(20000)]
async fn test_short_ring_uses_every_node() {
    let c = IntegrationCluster::new(ClusterConfig {
        nodes: 2,
        write_quorum: 2,
        ..Default::default()
    })
    .await;

    let set = c.assign_doc(1).await.unwrap();
    assert_eq!(set.len(), 2);
    let stats = c.coord().get_stats().await;
    assert!(stats.degraded_shards > 0);
    assert_eq!(stats.repair_queue_len, 1);
}

/// Jittered replica latency reorders arrivals but never the ranking.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_merge_order_independent_of_arrival() {
    let c = IntegrationCluster::new(ClusterConfig {
        nodes: 4,
        shard_size: 3,
        chaos: ChaosConfig {
            latency_ms: (0, 15),
            seed: 7,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    c.load_docs(0..24).await;
    c.link_chain(0..23);

    let baseline = c.execute(collection_query(10)).await.unwrap();
    assert!(!baseline.partial);
    assert_eq!(baseline.results.len(), 10);
    for _ in 0..8 {
        let again = c.execute(collection_query(10)).await.unwrap();
        assert_eq!(again.results, baseline.results);
    }
    assert!(c.chaos().stats().delivered > 0);
}

/// Queries scoped to one item only reach its set.
#[tokio::test]
#[ntest::timeout(20000)]
async fn test_item_scope_reaches_one_set() {
    let c = IntegrationCluster::new(ClusterConfig {
        nodes: 5,
        ..Default::default()
    })
    .await;
    c.load_docs(0..20).await;
    c.link_chain(0..19);

    let request = reef_query::QueryRequest::new(
        reef_query::QueryInput::Embedding(vec![1.0, 0.0]),
        reef_types::QueryScope::Item(doc(5)),
        10,
    )
    .with_limits(BudgetLimits {
        max_hops: 2,
        ..Default::default()
    });
    let response = c.execute(request).await.unwrap();

    assert_eq!(response.stats.shards_queried, 1);
    assert!(!response.partial);
    let found: BTreeSet<ItemId> = response.results.iter().map(|r| r.item_id.clone()).collect();
    // The seed and its two-hop chain.
    assert_eq!(found, BTreeSet::from([doc(5), doc(6), doc(7)]));
}
