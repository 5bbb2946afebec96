//! Storage-queue transport: provisioning, metadata fan-out, routing and the
//! poison policy.

use std::collections::BTreeMap;

use courier::transport::storage_queue::{
    InMemoryQueueClient, QueueClient, StorageQueueOptions, StorageQueueTransport,
};
use courier::transport::ReceiveOutcome;
use courier::{
    BusError, Envelope, MessageTransport, MessageTypeRegistry, PublishOptions, ReceiveOptions,
    SendRoutes, MESSAGE_TYPE_KEY,
};

use crate::support::{
    all_fruit, executor, init_tracing, Apple, Banana, Cherry, Ledger, RottenApple,
};

fn endpoint(
    client: &InMemoryQueueClient,
    queue: &str,
    registry: MessageTypeRegistry,
) -> StorageQueueTransport<InMemoryQueueClient> {
    StorageQueueTransport::new(
        client.clone(),
        registry,
        StorageQueueOptions::default()
            .with_receive(ReceiveOptions::default().with_queue_name(queue)),
    )
}

fn publisher(
    client: &InMemoryQueueClient,
    queues: &[&str],
    publish: PublishOptions,
) -> StorageQueueTransport<InMemoryQueueClient> {
    StorageQueueTransport::new(
        client.clone(),
        MessageTypeRegistry::new(),
        StorageQueueOptions::default()
            .with_publish(publish)
            .with_publishing_queues(queues.iter().copied()),
    )
}

fn wrap<M: courier::Message>(message: &M) -> Envelope {
    Envelope::wrap(message, Default::default()).unwrap()
}

#[tokio::test]
async fn initialization_is_idempotent() {
    init_tracing();
    let client = InMemoryQueueClient::new();
    let transport = endpoint(&client, "Orders", all_fruit());

    transport.initialize_receiving_endpoint().await.unwrap();
    transport.initialize_receiving_endpoint().await.unwrap();

    assert_eq!(
        client.queue_names(),
        vec!["orders".to_string(), "orders-poison".to_string()]
    );
    let metadata = client.fetch_metadata("orders").await.unwrap();
    assert_eq!(
        metadata.get(MESSAGE_TYPE_KEY).map(String::as_str),
        Some("Banana,Cherry,RottenApple,Stall")
    );
}

#[tokio::test]
async fn blank_queue_name_is_publish_and_send_only() {
    let client = InMemoryQueueClient::new();
    let transport = endpoint(&client, "   ", all_fruit());

    assert!(transport.is_publish_and_send_only());
    transport.initialize_receiving_endpoint().await.unwrap();
    assert!(client.queue_names().is_empty());
}

#[tokio::test]
async fn publish_fans_out_by_advertised_types() {
    let client = InMemoryQueueClient::new();
    endpoint(&client, "orders", MessageTypeRegistry::new().accept::<Banana>())
        .initialize_receiving_endpoint()
        .await
        .unwrap();
    endpoint(&client, "billing", MessageTypeRegistry::new().accept::<RottenApple>().accept::<Banana>())
        .initialize_receiving_endpoint()
        .await
        .unwrap();
    endpoint(&client, "audit", MessageTypeRegistry::new().accept::<RottenApple>())
        .initialize_receiving_endpoint()
        .await
        .unwrap();

    let transport = publisher(&client, &["orders", "billing", "audit", "ghost"], PublishOptions::default());
    transport.publish(wrap(&Banana { ripeness: 3 })).await.unwrap();

    assert_eq!(client.len("orders"), 1);
    assert_eq!(client.len("billing"), 1);
    assert_eq!(client.len("audit"), 0);
    assert!(!client.queue_names().contains(&"ghost".to_string()));

    let delivered = &client.envelopes("orders")[0];
    assert_eq!(delivered.message_type(), Some("Banana"));
    assert_eq!(delivered.decode::<Banana>().unwrap(), Banana { ripeness: 3 });
}

#[tokio::test]
async fn endpoint_without_events_receives_no_publishes() {
    let client = InMemoryQueueClient::new();
    endpoint(&client, "commands-only", MessageTypeRegistry::new().accept::<Apple>())
        .initialize_receiving_endpoint()
        .await
        .unwrap();

    let metadata = client.fetch_metadata("commands-only").await.unwrap();
    assert_eq!(metadata.get(MESSAGE_TYPE_KEY).map(String::as_str), Some(""));

    let transport = publisher(&client, &["commands-only"], PublishOptions::default());
    transport.publish(wrap(&Banana { ripeness: 1 })).await.unwrap();
    transport.publish(wrap(&Cherry)).await.unwrap();

    assert_eq!(client.len("commands-only"), 0);
}

#[tokio::test]
async fn endpoint_without_events_ignores_empty_type_name() {
    let client = InMemoryQueueClient::new();
    endpoint(&client, "commands-only", MessageTypeRegistry::new().accept::<Apple>())
        .initialize_receiving_endpoint()
        .await
        .unwrap();

    let transport = publisher(&client, &["commands-only"], PublishOptions::default());
    transport
        .publish(Envelope::new("", b"{}".to_vec()))
        .await
        .unwrap();

    assert_eq!(client.len("commands-only"), 0);
}

#[tokio::test]
async fn metadata_is_read_fresh_on_every_publish() {
    let client = InMemoryQueueClient::new();
    client.create_if_not_exists("orders").await.unwrap();
    let transport = publisher(&client, &["orders"], PublishOptions::default());

    transport.publish(wrap(&Banana { ripeness: 1 })).await.unwrap();
    assert_eq!(client.len("orders"), 0);

    client
        .set_metadata(
            "orders",
            BTreeMap::from([(MESSAGE_TYPE_KEY.to_string(), "Cherry, Banana".to_string())]),
        )
        .await
        .unwrap();
    transport.publish(wrap(&Banana { ripeness: 2 })).await.unwrap();
    assert_eq!(client.len("orders"), 1);
}

#[tokio::test]
async fn debug_queue_mirrors_publishes_and_sends() {
    let client = InMemoryQueueClient::new();
    endpoint(&client, "billing", all_fruit())
        .initialize_receiving_endpoint()
        .await
        .unwrap();
    let transport = publisher(
        &client,
        &["billing"],
        PublishOptions::default()
            .with_debug_queue(true)
            .with_send_routes(SendRoutes::new().route::<Apple>("Billing")),
    );
    transport.initialize_publishing_endpoint().await.unwrap();

    transport.publish(wrap(&Cherry)).await.unwrap();
    transport.send(wrap(&Apple { variety: "gala".into() })).await.unwrap();

    let mirrored: Vec<_> = client
        .envelopes("debug")
        .iter()
        .map(|e| e.message_type().unwrap_or_default().to_string())
        .collect();
    assert_eq!(mirrored, vec!["Cherry".to_string(), "Apple".to_string()]);
}

#[tokio::test]
async fn debug_mirror_failure_does_not_fail_publish() {
    let client = InMemoryQueueClient::new();
    endpoint(&client, "orders", all_fruit())
        .initialize_receiving_endpoint()
        .await
        .unwrap();
    let transport = publisher(&client, &["orders"], PublishOptions::default().with_debug_queue(true));
    transport.initialize_publishing_endpoint().await.unwrap();
    client.fail_next_adds("debug", 1);

    transport.publish(wrap(&Banana { ripeness: 4 })).await.unwrap();

    assert_eq!(client.len("orders"), 1);
    assert_eq!(client.len("debug"), 0);
}

#[tokio::test]
async fn send_goes_to_the_routed_queue_only() {
    let client = InMemoryQueueClient::new();
    for queue in ["orders", "billing"] {
        endpoint(&client, queue, all_fruit())
            .initialize_receiving_endpoint()
            .await
            .unwrap();
    }
    let transport = publisher(
        &client,
        &[],
        PublishOptions::default().with_send_routes(SendRoutes::new().route::<Apple>("BILLING")),
    );

    transport.send(wrap(&Apple { variety: "fuji".into() })).await.unwrap();

    assert_eq!(client.len("orders"), 0);
    let sent = client.envelopes("billing");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].destination(), Some("billing"));
}

#[tokio::test]
async fn explicit_destination_overrides_route() {
    let client = InMemoryQueueClient::new();
    client.create_if_not_exists("orders").await.unwrap();
    client.create_if_not_exists("billing").await.unwrap();
    let transport = publisher(
        &client,
        &[],
        PublishOptions::default().with_send_routes(SendRoutes::new().route::<Apple>("billing")),
    );

    transport
        .send(wrap(&Apple { variety: "gala".into() }).with_destination("orders"))
        .await
        .unwrap();

    assert_eq!(client.len("orders"), 1);
    assert_eq!(client.len("billing"), 0);
}

#[tokio::test]
async fn send_without_route_is_an_error() {
    let client = InMemoryQueueClient::new();
    let transport = publisher(&client, &[], PublishOptions::default());

    let result = transport.send(wrap(&Apple { variety: "fuji".into() })).await;

    assert!(matches!(result, Err(BusError::NoSendRoute(name)) if name == "Apple"));
}

#[tokio::test]
async fn send_to_unprovisioned_queue_is_skipped() {
    let client = InMemoryQueueClient::new();
    let transport = publisher(
        &client,
        &[],
        PublishOptions::default().with_send_routes(SendRoutes::new().route::<Apple>("nowhere")),
    );

    transport.send(wrap(&Apple { variety: "fuji".into() })).await.unwrap();

    assert!(client.queue_names().is_empty());
}

#[tokio::test]
async fn handled_message_is_removed() {
    let client = InMemoryQueueClient::new();
    let ledger = Ledger::default();
    let (executor, _) = executor(&ledger);
    let transport = endpoint(&client, "orders", all_fruit());
    transport.initialize_receiving_endpoint().await.unwrap();
    client
        .add_message("orders", wrap(&Banana { ripeness: 9 }).to_wire().unwrap())
        .await
        .unwrap();

    assert_eq!(transport.receive_once(&executor).await, Some(ReceiveOutcome::Completed));
    assert_eq!(transport.receive_once(&executor).await, Some(ReceiveOutcome::Idle));

    assert_eq!(ledger.entries(), vec!["banana:9".to_string()]);
    assert_eq!(client.len("orders"), 0);
    assert_eq!(client.len("orders-poison"), 0);
}

#[tokio::test]
async fn failing_message_is_redelivered_then_poisoned_once() {
    init_tracing();
    let client = InMemoryQueueClient::new();
    let (executor, failures) = executor(&Ledger::default());
    let transport = StorageQueueTransport::new(
        client.clone(),
        all_fruit(),
        StorageQueueOptions::default().with_receive(
            ReceiveOptions::default()
                .with_queue_name("orders")
                .with_max_dequeue_count(3),
        ),
    );
    transport.initialize_receiving_endpoint().await.unwrap();
    client
        .add_message("orders", wrap(&RottenApple { days_old: 30 }).to_wire().unwrap())
        .await
        .unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..4 {
        outcomes.push(transport.receive_once(&executor).await.unwrap());
    }

    assert_eq!(
        outcomes,
        vec![
            ReceiveOutcome::Released { delivery_count: 1 },
            ReceiveOutcome::Released { delivery_count: 2 },
            ReceiveOutcome::Quarantined,
            ReceiveOutcome::Idle,
        ]
    );
    assert_eq!(failures.len(), 3);
    assert_eq!(client.len("orders"), 0);
    let poisoned = client.envelopes("orders-poison");
    assert_eq!(poisoned.len(), 1);
    assert_eq!(poisoned[0].message_type(), Some("RottenApple"));

    let stats = transport.receive_stats().unwrap();
    assert_eq!(stats.released, 2);
    assert_eq!(stats.quarantined, 1);
}

#[tokio::test]
async fn unrecognized_and_corrupt_messages_are_poisoned_without_retry() {
    let client = InMemoryQueueClient::new();
    let (executor, failures) = executor(&Ledger::default());
    let transport = endpoint(&client, "orders", MessageTypeRegistry::new().accept::<Banana>());
    transport.initialize_receiving_endpoint().await.unwrap();

    client
        .add_message("orders", wrap(&Cherry).to_wire().unwrap())
        .await
        .unwrap();
    client
        .add_message("orders", "not an envelope".to_string())
        .await
        .unwrap();

    assert_eq!(transport.receive_once(&executor).await, Some(ReceiveOutcome::Quarantined));
    assert_eq!(transport.receive_once(&executor).await, Some(ReceiveOutcome::Quarantined));

    assert_eq!(failures.len(), 0);
    assert_eq!(client.len("orders"), 0);
    assert_eq!(
        client.contents("orders-poison")[1],
        "not an envelope".to_string()
    );
}

#[tokio::test]
async fn accepted_type_without_handler_is_poisoned() {
    let client = InMemoryQueueClient::new();
    let (executor, _) = executor(&Ledger::default());
    let transport = endpoint(&client, "orders", all_fruit());
    transport.initialize_receiving_endpoint().await.unwrap();
    client
        .add_message("orders", wrap(&Cherry).to_wire().unwrap())
        .await
        .unwrap();

    assert_eq!(transport.receive_once(&executor).await, Some(ReceiveOutcome::Quarantined));
    assert_eq!(client.dequeue_counts("orders-poison"), vec![0]);
}
