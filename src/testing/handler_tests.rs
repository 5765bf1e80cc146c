//! Tests of the server side of the batched pull protocol.
//!
//! These tests verify:
//! - Batches are handed over with the completions that follow them
//! - Values of one key never straddle two batches in key tracking mode
//! - Lost segments with and without key tracking
//! - Session lifecycle: duplicates, cancellation and departed origins

#[cfg(test)]
mod tests {
    use crate::command::{InitialPublisherCommand, Transformation};
    use crate::config::PublisherConfig;
    use crate::error::Error;
    use crate::functions::Transformer;
    use crate::handler::PublisherHandler;
    use crate::local::LocalPublisherManager;
    use crate::metrics::PublisherMetrics;
    use crate::partitioning::{HashPartitioner, KeyPartitioner};
    use crate::request::PublisherRequest;
    use crate::testing::{ClusterTopology, HookPoint, MemoryStore};
    use crate::topology::CacheTopology;
    use crate::types::{DeliveryGuarantee, RequestId, SegmentSet};
    use std::sync::Arc;

    type Handler = PublisherHandler<String, String>;

    struct Harness {
        handler: Handler,
        local: Arc<LocalPublisherManager<String, String>>,
        store: MemoryStore<String, String>,
        _topology: ClusterTopology,
    }

    /// One node, one segment, holding `keys`.
    fn harness(keys: &[&str]) -> Harness {
        let partitioner: Arc<dyn KeyPartitioner<String>> = Arc::new(HashPartitioner::new(1));
        let store = MemoryStore::new(partitioner.clone());
        for key in keys {
            store.insert(key.to_string(), key.to_uppercase());
        }
        let topology = ClusterTopology::new(CacheTopology::new(1, vec![1], vec![vec![1]]));
        let local = Arc::new(LocalPublisherManager::new(
            PublisherConfig::new(1),
            Arc::new(store.clone()),
            Arc::new(topology.view(1)),
            partitioner,
            Arc::new(PublisherMetrics::new()),
        ));
        Harness {
            handler: PublisherHandler::new(local.clone()),
            local,
            store,
            _topology: topology,
        }
    }

    fn initial(
        sequence: u64,
        batch_size: usize,
        track_keys: bool,
        transformer: Transformer<String, String>,
    ) -> InitialPublisherCommand<String, String, String> {
        InitialPublisherCommand {
            request_id: RequestId::new(7, sequence),
            request: PublisherRequest::new(DeliveryGuarantee::ExactlyOnce),
            batch_size,
            track_keys,
            transformation: Transformation::Keys(transformer),
        }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[tokio::test]
    async fn test_batches_in_order() {
        let harness = harness(&["a", "b", "c", "d", "e"]);
        let command = initial(1, 3, false, Transformer::identity());
        let request_id = command.request_id.clone();

        let first = harness.handler.register(Some(7), command).await.unwrap();
        assert_eq!(first.values, strings(&["a", "b", "c"]));
        assert!(!first.complete);
        assert!(first.completed_segments.is_empty());
        assert_eq!(harness.handler.open_publishers(), vec![request_id.clone()]);

        let second = harness.handler.get_next::<String>(&request_id).await.unwrap();
        assert_eq!(second.values, strings(&["d", "e"]));
        assert!(second.complete);
        assert_eq!(second.completed_segments, SegmentSet::from([0]));
        assert!(harness.handler.open_publishers().is_empty());
    }

    #[tokio::test]
    async fn test_exact_batch_completes_in_one_response() {
        let harness = harness(&["a", "b", "c"]);

        let response = harness
            .handler
            .register(None, initial(1, 3, false, Transformer::identity()))
            .await
            .unwrap();

        assert_eq!(response.values, strings(&["a", "b", "c"]));
        assert!(response.complete);
        assert_eq!(response.completed_segments, SegmentSet::from([0]));
        assert_eq!(response.into_tagged_values().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_empty_publisher() {
        let harness = harness(&[]);

        let response = harness
            .handler
            .register(None, initial(1, 3, false, Transformer::identity()))
            .await
            .unwrap();

        assert!(response.is_empty());
        assert!(response.complete);
        assert_eq!(response.completed_segments, SegmentSet::from([0]));
    }

    #[tokio::test]
    async fn test_key_values_stay_together() {
        let harness = harness(&["a", "b", "c"]);
        let twice = Transformer::flat_map(|key: String| [format!("{key}:1"), format!("{key}:2")]);
        let command = initial(1, 3, true, twice);
        let request_id = command.request_id.clone();

        let first = harness.handler.register(Some(7), command).await.unwrap();
        assert_eq!(first.values, strings(&["a:1", "a:2", "b:1"]));
        assert_eq!(first.extra_values, strings(&["b:2"]));
        assert_eq!(first.keys, strings(&["a", "b"]));
        assert!(!first.complete);

        let second = harness.handler.get_next::<String>(&request_id).await.unwrap();
        assert_eq!(second.values, strings(&["c:1", "c:2"]));
        assert!(second.complete);
        assert!(second.keys.is_empty());
        assert_eq!(second.completed_segments, SegmentSet::from([0]));
    }

    #[tokio::test]
    async fn test_key_tracking_with_mapped_value_type() {
        let harness = harness(&["a", "bb", "ccc"]);
        let command = InitialPublisherCommand {
            request_id: RequestId::new(7, 1),
            request: PublisherRequest::new(DeliveryGuarantee::ExactlyOnce),
            batch_size: 2,
            track_keys: true,
            transformation: Transformation::Keys(Transformer::map(|key: String| key.len())),
        };
        let request_id = command.request_id.clone();

        let first = harness.handler.register(Some(7), command).await.unwrap();
        assert_eq!(first.values, vec![1, 2]);
        assert!(first.extra_values.is_empty());
        assert_eq!(first.keys, strings(&["a", "bb"]));
        assert!(!first.complete);

        let second = harness.handler.get_next::<usize>(&request_id).await.unwrap();
        assert_eq!(second.values, vec![3]);
        assert!(second.keys.is_empty());
        assert_eq!(second.completed_segments, SegmentSet::from([0]));
        assert!(second.complete);
    }

    #[tokio::test]
    async fn test_lost_segment_drops_its_values() {
        let harness = harness(&["a", "b", "c"]);
        let local = harness.local.clone();
        harness.store.on_read(0, HookPoint::AfterRead, move |segment| {
            local.segments_lost(&SegmentSet::from([segment]));
        });

        let response = harness
            .handler
            .register(None, initial(1, 10, false, Transformer::identity()))
            .await
            .unwrap();

        assert!(response.values.is_empty());
        assert!(response.segment_results.is_empty());
        assert_eq!(response.lost_segments, SegmentSet::from([0]));
        assert!(response.completed_segments.is_empty());
        assert!(response.complete);
    }

    #[tokio::test]
    async fn test_lost_segment_keeps_tracked_keys() {
        let harness = harness(&["a", "b", "c"]);
        let local = harness.local.clone();
        harness.store.on_read(0, HookPoint::AfterRead, move |segment| {
            local.segments_lost(&SegmentSet::from([segment]));
        });

        let response = harness
            .handler
            .register(None, initial(1, 10, true, Transformer::identity()))
            .await
            .unwrap();

        assert_eq!(response.values, strings(&["a", "b", "c"]));
        assert_eq!(response.keys, strings(&["a", "b", "c"]));
        assert_eq!(response.lost_segments, SegmentSet::from([0]));
        assert!(response.complete);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let harness = harness(&["a", "b", "c"]);
        let request_id = RequestId::new(7, 1);

        let first = harness
            .handler
            .register(Some(7), initial(1, 1, false, Transformer::identity()))
            .await
            .unwrap();
        assert!(!first.complete);

        let err = harness
            .handler
            .register(Some(7), initial(1, 1, false, Transformer::identity()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));

        let err = harness.handler.get_next::<String>(&request_id).await.unwrap_err();
        assert!(matches!(err, Error::PublisherNotFound(id) if id == request_id));
    }

    #[tokio::test]
    async fn test_racing_registrations_leave_no_session() {
        let harness = harness(&["a", "b", "c"]);
        let request_id = RequestId::new(7, 1);

        let (first, second) = tokio::join!(
            harness.handler.register(Some(7), initial(1, 1, false, Transformer::identity())),
            harness.handler.register(Some(7), initial(1, 1, false, Transformer::identity())),
        );
        assert!(matches!(second, Err(Error::IllegalState(_))));
        assert!(!matches!(first, Ok(ref response) if response.complete));

        assert!(harness.handler.open_publishers().is_empty());
        assert_eq!(harness.local.metrics().open_sessions.get(), 0);
        let err = harness.handler.get_next::<String>(&request_id).await.unwrap_err();
        assert!(matches!(err, Error::PublisherNotFound(_)));
    }

    #[tokio::test]
    async fn test_completed_registration_replaced() {
        let harness = harness(&["a"]);

        for _ in 0..2 {
            let response = harness
                .handler
                .register(Some(7), initial(1, 5, false, Transformer::identity()))
                .await
                .unwrap();
            assert!(response.complete);
        }
        assert!(harness.handler.open_publishers().is_empty());
        assert_eq!(harness.local.metrics().open_sessions.get(), 0);
    }

    #[tokio::test]
    async fn test_close_publisher() {
        let harness = harness(&["a", "b", "c"]);
        let command = initial(1, 1, false, Transformer::identity());
        let request_id = command.request_id.clone();
        harness.handler.register(Some(7), command).await.unwrap();

        assert_eq!(harness.local.metrics().open_sessions.get(), 1);
        assert!(harness.handler.close_publisher(&request_id));
        assert!(!harness.handler.close_publisher(&request_id));
        assert_eq!(harness.local.metrics().open_sessions.get(), 0);

        let err = harness.handler.get_next::<String>(&request_id).await.unwrap_err();
        assert!(matches!(err, Error::PublisherNotFound(_)));
    }

    #[tokio::test]
    async fn test_sessions_of_departed_origins_dropped() {
        let harness = harness(&["a", "b", "c"]);

        let mut remote = initial(1, 1, false, Transformer::identity());
        remote.request_id = RequestId::new(5, 1);
        harness.handler.register(Some(5), remote).await.unwrap();
        let local = initial(2, 1, false, Transformer::identity());
        let local_id = local.request_id.clone();
        harness.handler.register(None, local).await.unwrap();
        assert_eq!(harness.handler.open_publishers().len(), 2);

        harness.handler.on_view_changed(&[1, 7]);

        assert_eq!(harness.handler.open_publishers(), vec![local_id.clone()]);
        let err = harness
            .handler
            .get_next::<String>(&RequestId::new(5, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PublisherNotFound(_)));

        let next = harness.handler.get_next::<String>(&local_id).await.unwrap();
        assert_eq!(next.values, strings(&["b"]));
    }

    #[tokio::test]
    async fn test_unknown_publisher() {
        let harness = harness(&["a"]);
        let err = harness
            .handler
            .get_next::<String>(&RequestId::new(9, 9))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PublisherNotFound(_)));
    }

    #[tokio::test]
    async fn test_stopped_node_rejects_registration() {
        let harness = harness(&["a"]);
        harness.local.stop();

        let err = harness
            .handler
            .register(None, initial(1, 1, false, Transformer::identity()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LifecycleStopped));
    }
}
