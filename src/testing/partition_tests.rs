//! Tests of the partition-aware publisher manager.

#[cfg(test)]
mod tests {
    use crate::cluster::{AvailabilityMode, PartitionAwareClusterPublisherManager};
    use crate::command::CommandKind;
    use crate::config::PublisherConfig;
    use crate::error::Error;
    use crate::functions::Transformer;
    use crate::reducers::{add, count};
    use crate::request::PublisherRequest;
    use crate::testing::{
        collect_within, numbered_entries, wait_for_result, MemoryTransport, NodeFault, TestCluster,
    };
    use crate::types::DeliveryGuarantee;
    use std::sync::Arc;
    use std::time::Duration;

    type Guarded = PartitionAwareClusterPublisherManager<u64, u64, MemoryTransport<u64, u64>>;

    fn cluster() -> TestCluster<u64, u64> {
        let cluster = TestCluster::with_owners(
            PublisherConfig::new(4),
            vec![1, 2, 3],
            vec![vec![1], vec![2], vec![3], vec![1]],
        )
        .unwrap();
        cluster.populate(numbered_entries(100));
        cluster
    }

    fn guarded(cluster: &TestCluster<u64, u64>, node: u64) -> Arc<Guarded> {
        Arc::new(PartitionAwareClusterPublisherManager::new(cluster.manager(node).unwrap()))
    }

    #[tokio::test]
    async fn test_available_passes_through() {
        let cluster = cluster();
        let manager = guarded(&cluster, 1);
        assert_eq!(manager.availability(), AvailabilityMode::Available);

        assert_eq!(manager.size(None, false).await.unwrap(), 100);
        let request = PublisherRequest::new(DeliveryGuarantee::AtLeastOnce);
        let keys = collect_within(manager.key_publisher(request, 10, Transformer::identity()).values(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(keys.len(), 100);
    }

    #[tokio::test]
    async fn test_degraded_fails_fast() {
        let cluster = cluster();
        let manager = guarded(&cluster, 1);
        manager.set_availability(AvailabilityMode::Degraded);

        let err = manager.size(None, false).await.unwrap_err();
        assert!(matches!(err, Error::PartitionDegraded));

        let request = PublisherRequest::new(DeliveryGuarantee::ExactlyOnce);
        let err = manager
            .key_reduction(request.clone(), count(), add())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PartitionDegraded));

        let err = collect_within(manager.key_publisher(request, 10, Transformer::identity()).values(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PartitionDegraded));

        assert_eq!(manager.inner().metrics().remote_commands.get(), 0);
        assert!(cluster.network().records().is_empty());

        manager.set_availability(AvailabilityMode::Available);
        assert_eq!(manager.size(None, false).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_degrading_aborts_operation_in_flight() {
        let cluster = cluster();
        // node 2 cannot answer and no newer topology arrives, so the
        // reduction keeps waiting to retry
        cluster.network().set_fault(2, NodeFault::Suspected);
        let manager = guarded(&cluster, 1);

        let running = manager.clone();
        let reduction = tokio::spawn(async move { running.size(None, false).await });

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

        manager.set_availability(AvailabilityMode::Degraded);
        let err = tokio::time::timeout(Duration::from_secs(5), reduction)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::PartitionDegraded));
    }

    #[tokio::test]
    async fn test_degrading_ends_stream_in_flight() {
        let cluster = cluster();
        cluster.network().set_fault(2, NodeFault::Suspected);
        let manager = guarded(&cluster, 1);

        let request = PublisherRequest::new(DeliveryGuarantee::ExactlyOnce);
        let stream = tokio::spawn(collect_within(
            manager.key_publisher(request, 4, Transformer::identity()).values(),
            Duration::from_secs(5),
        ));

        let network = cluster.network().clone();
        let attempted = wait_for_result(
            || {
                let network = network.clone();
                async move { network.records_to(2, CommandKind::InitialPublisher).len() }
            },
            |attempts| *attempts > 0,
            Duration::from_secs(5),
        )
        .await;
        assert!(attempted.is_some());

        manager.set_availability(AvailabilityMode::Degraded);
        let err = stream.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::PartitionDegraded));
    }
}
