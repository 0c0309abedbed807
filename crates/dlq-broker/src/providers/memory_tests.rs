//! Tests for the in-memory broker provider.

use super::*;

const NS: &str = "ns-test";

fn seeded_broker(entity: &EntityRef, count: usize) -> (InMemoryBroker, Vec<i64>) {
    let broker = InMemoryBroker::new();
    broker.create_entity(NS, entity).unwrap();
    let sequences = (0..count)
        .map(|i| {
            broker
                .seed_dead_letter(
                    NS,
                    entity,
                    OutgoingMessage::new(format!("body-{}", i)),
                    Some("MaxDeliveryCountExceeded"),
                    None,
                    10,
                )
                .unwrap()
        })
        .collect();
    (broker, sequences)
}

mod listing_tests {
    use super::*;

    /// Verify that registered entities are listed in path order
    #[tokio::test]
    async fn test_list_entities_returns_registered_entities() {
        let broker = InMemoryBroker::new();
        broker.create_entity(NS, &EntityRef::queue("orders")).unwrap();
        broker
            .create_entity(NS, &EntityRef::subscription("billing", "audit"))
            .unwrap();

        let entities = broker.list_entities(NS).await.unwrap();

        assert_eq!(
            entities,
            vec![
                EntityRef::subscription("billing", "audit"),
                EntityRef::queue("orders")
            ]
        );
    }

    /// Verify that unknown namespaces are reported as not found
    #[tokio::test]
    async fn test_list_entities_unknown_namespace() {
        let broker = InMemoryBroker::new();

        let result = broker.list_entities("missing").await;

        assert!(matches!(result, Err(BrokerError::NamespaceNotFound { .. })));
    }

    /// Verify that injected listing failures are transient
    #[tokio::test]
    async fn test_injected_listing_failure() {
        let broker = InMemoryBroker::new();
        broker.create_namespace(NS).unwrap();
        broker.fail_listing(NS).unwrap();

        let err = broker.list_entities(NS).await.unwrap_err();

        assert!(err.is_transient());
    }
}

mod peek_tests {
    use super::*;

    /// Verify that dead-letter peeks return messages in sequence order
    #[tokio::test]
    async fn test_peek_dead_letter_in_sequence_order() {
        let entity = EntityRef::queue("orders");
        let (broker, sequences) = seeded_broker(&entity, 3);

        let messages = broker.peek(NS, &entity, true, 10).await.unwrap();

        let peeked: Vec<i64> = messages.iter().map(|m| m.sequence_number).collect();
        assert_eq!(peeked, sequences);
        assert_eq!(
            messages[0].dead_letter_reason.as_deref(),
            Some("MaxDeliveryCountExceeded")
        );
        assert_eq!(messages[0].delivery_count, 10);
        assert!(messages[0].dead_letter_time_utc.is_some());
    }

    /// Verify that peek honours the batch limit and does not remove messages
    #[tokio::test]
    async fn test_peek_respects_max_count() {
        let entity = EntityRef::queue("orders");
        let (broker, _) = seeded_broker(&entity, 5);

        let first = broker.peek(NS, &entity, true, 2).await.unwrap();
        let second = broker.peek(NS, &entity, true, 2).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(broker.dead_letter_count(NS, &entity).unwrap(), 5);
    }

    /// Verify that the active queue and dead-letter sub-queue are separate
    #[tokio::test]
    async fn test_peek_active_queue_separate_from_dead_letter() {
        let entity = EntityRef::queue("orders");
        let (broker, _) = seeded_broker(&entity, 2);
        broker
            .send(NS, &entity, OutgoingMessage::new("live"))
            .await
            .unwrap();

        let active = broker.peek(NS, &entity, false, 10).await.unwrap();

        assert_eq!(active.len(), 1);
        assert_eq!(active[0].body, Bytes::from("live"));
    }

    /// Verify that injected peek failures only affect the targeted entity
    #[tokio::test]
    async fn test_injected_peek_failure_is_scoped() {
        let failing = EntityRef::queue("orders");
        let healthy = EntityRef::queue("payments");
        let (broker, _) = seeded_broker(&failing, 1);
        broker.create_entity(NS, &healthy).unwrap();
        broker.fail_peeks(NS, &failing).unwrap();

        assert!(broker.peek(NS, &failing, true, 10).await.is_err());
        assert!(broker.peek(NS, &healthy, true, 10).await.is_ok());
        assert_eq!(broker.peek_calls(), 2);
    }
}

mod replay_tests {
    use super::*;

    /// Verify that replay moves the message to the target's active queue
    #[tokio::test]
    async fn test_replay_moves_message_to_target() {
        let entity = EntityRef::queue("orders");
        let (broker, sequences) = seeded_broker(&entity, 2);

        broker
            .replay(NS, &entity, sequences[0], &entity)
            .await
            .unwrap();

        assert_eq!(broker.dead_letter_count(NS, &entity).unwrap(), 1);
        let active = broker.active_messages(NS, &entity).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].body, Bytes::from("body-0"));
        assert_eq!(active[0].delivery_count, 0);
        assert!(active[0].dead_letter_reason.is_none());
        assert_ne!(active[0].sequence_number, sequences[0]);
    }

    /// Verify that replaying a missing sequence number fails permanently
    #[tokio::test]
    async fn test_replay_missing_message() {
        let entity = EntityRef::queue("orders");
        let (broker, _) = seeded_broker(&entity, 1);

        let err = broker.replay(NS, &entity, 999, &entity).await.unwrap_err();

        assert!(matches!(err, BrokerError::MessageNotFound { .. }));
        assert!(!err.is_transient());
    }

    /// Verify that an unknown target leaves the dead-lettered message in place
    #[tokio::test]
    async fn test_replay_unknown_target_keeps_message() {
        let entity = EntityRef::queue("orders");
        let (broker, sequences) = seeded_broker(&entity, 1);

        let err = broker
            .replay(NS, &entity, sequences[0], &EntityRef::queue("missing"))
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::EntityNotFound { .. }));
        assert_eq!(broker.dead_letter_count(NS, &entity).unwrap(), 1);
    }

    /// Verify that injected replay failures are consumed one per call
    #[tokio::test]
    async fn test_injected_replay_failures_are_consumed() {
        let entity = EntityRef::queue("orders");
        let (broker, sequences) = seeded_broker(&entity, 1);
        broker.fail_replays(NS, &entity, 2).unwrap();

        assert!(broker.replay(NS, &entity, sequences[0], &entity).await.is_err());
        assert!(broker.replay(NS, &entity, sequences[0], &entity).await.is_err());
        assert!(broker.replay(NS, &entity, sequences[0], &entity).await.is_ok());
        assert_eq!(broker.replay_calls(), 3);
    }

    /// Verify that permanent replay failures never run out
    #[tokio::test]
    async fn test_permanent_replay_failure() {
        let entity = EntityRef::queue("orders");
        let (broker, sequences) = seeded_broker(&entity, 1);
        broker.fail_replays(NS, &entity, u32::MAX).unwrap();

        for _ in 0..5 {
            let err = broker
                .replay(NS, &entity, sequences[0], &entity)
                .await
                .unwrap_err();
            assert!(err.is_transient());
        }

        broker.clear_faults().unwrap();
        assert!(broker.replay(NS, &entity, sequences[0], &entity).await.is_ok());
    }
}

mod maintenance_tests {
    use super::*;

    /// Verify that purge clears only the selected sub-queue
    #[tokio::test]
    async fn test_purge_dead_letter_only() {
        let entity = EntityRef::queue("orders");
        let (broker, _) = seeded_broker(&entity, 3);
        broker
            .send(NS, &entity, OutgoingMessage::new("live"))
            .await
            .unwrap();

        let removed = broker.purge(NS, &entity, true).await.unwrap();

        assert_eq!(removed, 3);
        assert_eq!(broker.dead_letter_count(NS, &entity).unwrap(), 0);
        assert_eq!(broker.active_messages(NS, &entity).unwrap().len(), 1);
    }

    /// Verify that dead_letter moves an active message into the sub-queue
    #[tokio::test]
    async fn test_dead_letter_active_message() {
        let entity = EntityRef::queue("orders");
        let broker = InMemoryBroker::new();
        broker.create_entity(NS, &entity).unwrap();
        let sequence = broker
            .send(NS, &entity, OutgoingMessage::new("poison"))
            .await
            .unwrap();

        broker
            .dead_letter(NS, &entity, sequence, "ValidationFailed", Some("schema mismatch"))
            .await
            .unwrap();

        let dead = broker.peek(NS, &entity, true, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].dead_letter_reason.as_deref(), Some("ValidationFailed"));
        assert_eq!(
            dead[0].dead_letter_error_description.as_deref(),
            Some("schema mismatch")
        );
        assert!(broker.active_messages(NS, &entity).unwrap().is_empty());
    }
}

mod snapshot_tests {
    use super::*;

    /// Verify that a JSON snapshot seeds namespaces, entities and dead letters
    #[tokio::test]
    async fn test_from_snapshot_seeds_dead_letters() {
        let json = r#"{
            "namespaces": [{
                "id": "ns-prod",
                "entities": [
                    {
                        "name": "orders",
                        "dead_letters": [
                            {"body": "{\"id\":1}", "dead_letter_reason": "TTLExpiredException"},
                            {"body": "{\"id\":2}", "delivery_count": 10}
                        ]
                    },
                    {"name": "billing", "subscription": "audit"}
                ]
            }]
        }"#;
        let snapshot: BrokerSnapshot = serde_json::from_str(json).unwrap();

        let broker = InMemoryBroker::from_snapshot(&snapshot).unwrap();

        let entities = broker.list_entities("ns-prod").await.unwrap();
        assert_eq!(entities.len(), 2);
        let dead = broker
            .peek("ns-prod", &EntityRef::queue("orders"), true, 10)
            .await
            .unwrap();
        assert_eq!(dead.len(), 2);
        assert_eq!(dead[0].dead_letter_reason.as_deref(), Some("TTLExpiredException"));
        assert_eq!(dead[0].delivery_count, 1);
        assert_eq!(dead[1].delivery_count, 10);
    }
}
