//! Tests of cluster-wide reductions over an in-process cluster.
//!
//! These tests verify:
//! - Complete results on a stable cluster, from every node
//! - Retry of segments that move while being read
//! - Retry of shares whose target stopped or left
//! - Propagation of other remote failures

#[cfg(test)]
mod tests {
    use crate::command::CommandKind;
    use crate::config::PublisherConfig;
    use crate::error::Error;
    use crate::reducers::{add, collect, concat_vecs, count, to_vec};
    use crate::request::PublisherRequest;
    use crate::testing::{numbered_entries, wait_for_result, HookPoint, TestCluster};
    use crate::types::{CacheEntry, DeliveryGuarantee, SegmentSet};
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::time::Duration;

    const ENTRIES: u64 = 300;

    /// Segments 0 and 1 on node 1, segments 2 and 3 on node 2, nothing on
    /// node 3.
    fn fixed_cluster(entries: u64) -> TestCluster<u64, u64> {
        let cluster = TestCluster::with_owners(
            PublisherConfig::new(4),
            vec![1, 2, 3],
            vec![vec![1], vec![1], vec![2], vec![2]],
        )
        .unwrap();
        cluster.populate(numbered_entries(entries));
        cluster
    }

    fn sorted(mut keys: Vec<u64>) -> Vec<u64> {
        keys.sort_unstable();
        keys
    }

    #[tokio::test]
    async fn test_stable_cluster_counts_everything() {
        let cluster = TestCluster::new(PublisherConfig::new(16), 3, 2).unwrap();
        cluster.populate(numbered_entries(ENTRIES));

        for node in cluster.node_ids() {
            let manager = cluster.manager(node).unwrap();
            assert_eq!(manager.size(None, false).await.unwrap(), ENTRIES);

            for guarantee in [DeliveryGuarantee::AtMostOnce, DeliveryGuarantee::AtLeastOnce] {
                for parallel in [false, true] {
                    let request = PublisherRequest::new(guarantee).with_parallel(parallel);
                    let total = manager.key_reduction(request, count(), add()).await.unwrap();
                    assert_eq!(total, ENTRIES, "node {node} {guarantee}");
                }
            }
        }
        assert_eq!(cluster.network().count(CommandKind::InitialPublisher), 0);
    }

    #[tokio::test]
    async fn test_segment_subset_and_keys() {
        let cluster = fixed_cluster(ENTRIES);
        let manager = cluster.manager(3).unwrap();
        let partitioner = cluster.partitioner().clone();

        let segments = SegmentSet::from([1, 2]);
        let expected = (0..ENTRIES)
            .filter(|key| segments.contains(&partitioner.segment_of(key)))
            .count() as u64;
        assert_eq!(manager.size(Some(segments), false).await.unwrap(), expected);

        let keys: HashSet<u64> = [1, 2, 3, 50, 99_999].into();
        let request = PublisherRequest::new(DeliveryGuarantee::ExactlyOnce)
            .with_keys(keys)
            .with_parallel(true);
        let found = manager.key_reduction(request, to_vec(), concat_vecs()).await.unwrap();
        assert_eq!(sorted(found), vec![1, 2, 3, 50]);
    }

    #[tokio::test]
    async fn test_entry_reduction() {
        let cluster = fixed_cluster(ENTRIES);
        let manager = cluster.manager(1).unwrap();

        let request = PublisherRequest::new(DeliveryGuarantee::ExactlyOnce).with_parallel(true);
        let values = manager
            .entry_reduction(
                request,
                collect(Vec::new, |values: &mut Vec<u64>, entry: CacheEntry<u64, u64>| values.push(entry.value)),
                concat_vecs(),
            )
            .await
            .unwrap();
        assert_eq!(sorted(values), (0..ENTRIES).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_segment_moved_during_at_least_once_reduction() {
        let cluster = fixed_cluster(ENTRIES);
        assert!(cluster.move_on_read(2, 2, HookPoint::BeforeRead, vec![3]));

        let manager = cluster.manager(1).unwrap();
        let request = PublisherRequest::new(DeliveryGuarantee::AtLeastOnce).with_parallel(false);
        let total = manager.key_reduction(request, count(), add()).await.unwrap();

        assert_eq!(total, ENTRIES);
        let to_node3 = cluster.network().records_to(3, CommandKind::Reduction);
        assert_eq!(to_node3.len(), 1);
        assert_eq!(to_node3[0].segments, Some(SegmentSet::from([2])));
        assert_eq!(manager.metrics().retries.get(), 1);
        assert_eq!(manager.metrics().suspected_segments.get(), 1);
    }

    #[tokio::test]
    async fn test_exactly_once_discards_moved_segment() {
        for point in [HookPoint::BeforeRead, HookPoint::AfterRead] {
            let cluster = fixed_cluster(ENTRIES);
            cluster.move_on_read(2, 3, point, vec![3]);

            let manager = cluster.manager(1).unwrap();
            let request = PublisherRequest::new(DeliveryGuarantee::ExactlyOnce);
            let keys = manager.key_reduction(request, to_vec(), concat_vecs()).await.unwrap();

            assert_eq!(sorted(keys), (0..ENTRIES).collect::<Vec<_>>(), "{point:?}");
            assert_eq!(cluster.topology().primary(3), Some(3));
        }
    }

    #[tokio::test]
    async fn test_local_segment_moved() {
        let cluster = fixed_cluster(ENTRIES);
        cluster.move_on_read(1, 0, HookPoint::AfterRead, vec![2]);

        let manager = cluster.manager(1).unwrap();
        let request = PublisherRequest::new(DeliveryGuarantee::ExactlyOnce).with_parallel(true);
        let keys = manager.key_reduction(request, to_vec(), concat_vecs()).await.unwrap();

        assert_eq!(sorted(keys), (0..ENTRIES).collect::<Vec<_>>());
        let to_node2 = cluster.network().records_to(2, CommandKind::Reduction);
        assert!(to_node2
            .iter()
            .any(|record| record.segments == Some(SegmentSet::from([0]))));
    }

    #[tokio::test]
    async fn test_stopped_target_retried_after_it_leaves() {
        let cluster = fixed_cluster(ENTRIES);
        cluster.stop_node(2);

        let manager = cluster.manager(1).unwrap();
        let reduction = tokio::spawn(async move { manager.size(None, false).await });

        let network = cluster.network().clone();
        let attempted = wait_for_result(
            || {
                let network = network.clone();
                async move { network.records_to(2, CommandKind::Reduction).len() }
            },
            |attempts| *attempts > 0,
            Duration::from_secs(5),
        )
        .await;
        assert!(attempted.is_some());

        cluster.remove_node(2);
        let total = tokio::time::timeout(Duration::from_secs(5), reduction)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(total, ENTRIES);
        assert!(cluster.manager(1).unwrap().metrics().retries.get() >= 1);
    }

    #[tokio::test]
    async fn test_remote_failure_propagates() {
        let cluster = fixed_cluster(ENTRIES);
        cluster
            .network()
            .fail_commands(2, CommandKind::Reduction, "collator exploded");

        let manager = cluster.manager(1).unwrap();
        let err = manager.size(None, false).await.unwrap_err();

        assert!(matches!(err, Error::Remote(message) if message == "collator exploded"));
        assert_eq!(manager.metrics().reductions_failed.get(), 1);
    }

    #[tokio::test]
    async fn test_nothing_to_read_yields_identity() {
        let cluster = fixed_cluster(ENTRIES);
        let manager = cluster.manager(1).unwrap();

        assert_eq!(manager.size(Some(SegmentSet::new()), false).await.unwrap(), 0);

        let request = PublisherRequest::new(DeliveryGuarantee::ExactlyOnce).with_keys(HashSet::new());
        let keys = manager.key_reduction(request, to_vec(), concat_vecs()).await.unwrap();
        assert!(keys.is_empty());
        assert_eq!(manager.metrics().remote_commands.get(), 0);
    }

    #[tokio::test]
    async fn test_stopped_manager() {
        let cluster = fixed_cluster(ENTRIES);
        let manager = cluster.manager(1).unwrap();
        manager.stop();

        let err = manager.size(None, false).await.unwrap_err();
        assert!(matches!(err, Error::LifecycleStopped));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_exactly_once_under_single_move(
            segment in 0u32..4,
            after_read in any::<bool>(),
            parallel in any::<bool>(),
            entries in 1u64..120,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let keys = runtime.block_on(async {
                let cluster = fixed_cluster(entries);
                let owner = cluster.topology().primary(segment).unwrap();
                let point = if after_read { HookPoint::AfterRead } else { HookPoint::BeforeRead };
                cluster.move_on_read(owner, segment, point, vec![3]);

                let request = PublisherRequest::new(DeliveryGuarantee::ExactlyOnce).with_parallel(parallel);
                cluster
                    .manager(1)
                    .unwrap()
                    .key_reduction(request, to_vec(), concat_vecs())
                    .await
                    .unwrap()
            });

            prop_assert_eq!(sorted(keys), (0..entries).collect::<Vec<_>>());
        }
    }
}
