//! The bus facade driving real receive loops over in-memory infrastructure.

use std::time::Duration;

use courier::transport::storage_queue::{
    InMemoryQueueClient, QueueClient, StorageQueueOptions, StorageQueueTransport,
};
use courier::transport::ReceiveOutcome;
use courier::{
    Bus, BusError, Envelope, MessageHandlerExecutor, MessageKind, MessageTransport,
    MessageTypeRegistry, PayloadCodec, PublishOptions, ReceiveOptions, SendRoutes,
};

use crate::support::{
    all_fruit, executor, handlers, init_tracing, Apple, Banana, Ledger, RottenApple, Stall,
};

type StorageBus = Bus<StorageQueueTransport<InMemoryQueueClient>>;

fn service(
    client: &InMemoryQueueClient,
    queue: &str,
    registry: MessageTypeRegistry,
    publish: PublishOptions,
    ledger: &Ledger,
) -> StorageBus {
    let options = StorageQueueOptions::default()
        .with_receive(
            ReceiveOptions::default()
                .with_queue_name(queue)
                .with_poll_interval(Duration::from_secs(1)),
        )
        .with_publish(publish)
        .with_publishing_queues(["orders", "billing"]);
    let (executor, _) = executor(ledger);
    Bus::new(
        StorageQueueTransport::new(client.clone(), registry, options),
        executor,
    )
}

#[tokio::test(start_paused = true)]
async fn services_exchange_events_and_commands() {
    init_tracing();
    let client = InMemoryQueueClient::new();
    let ledger = Ledger::default();

    let billing = service(
        &client,
        "billing",
        MessageTypeRegistry::new().accept::<Apple>().accept::<Banana>(),
        PublishOptions::default(),
        &ledger,
    );
    let orders = service(
        &client,
        "orders",
        all_fruit(),
        PublishOptions::default().with_send_routes(SendRoutes::new().route::<Apple>("billing")),
        &ledger,
    );
    billing.start().await.unwrap();
    orders.start().await.unwrap();

    orders.publish(&Banana { ripeness: 6 }).await.unwrap();
    orders.send(&Apple { variety: "fuji".into() }).await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;

    let mut entries = ledger.entries();
    entries.sort();
    assert_eq!(
        entries,
        vec![
            "apple:fuji".to_string(),
            "banana:6".to_string(),
            "banana:6".to_string(),
        ]
    );
    assert_eq!(client.len("orders"), 0);
    assert_eq!(client.len("billing"), 0);
    assert_eq!(billing.transport().receive_stats().unwrap().completed, 2);

    orders.stop();
    billing.stop();
}

#[tokio::test(start_paused = true)]
async fn second_start_is_rejected_until_stopped() {
    let client = InMemoryQueueClient::new();
    let bus = service(&client, "orders", all_fruit(), PublishOptions::default(), &Ledger::default());

    bus.start().await.unwrap();
    assert!(matches!(bus.start().await, Err(BusError::AlreadyReceiving)));

    bus.stop();
    bus.stop();
    bus.start().await.unwrap();
    bus.stop();
}

#[tokio::test]
async fn send_only_bus_provisions_nothing() {
    let client = InMemoryQueueClient::new();
    let bus = service(&client, "", all_fruit(), PublishOptions::default(), &Ledger::default());

    bus.start().await.unwrap();

    assert!(bus.transport().is_publish_and_send_only());
    assert!(client.queue_names().is_empty());
    bus.stop();
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_in_flight_handling_and_releases_the_message() {
    let client = InMemoryQueueClient::new();
    let bus = service(&client, "orders", all_fruit(), PublishOptions::default(), &Ledger::default());
    bus.transport().initialize_receiving_endpoint().await.unwrap();
    client
        .add_message(
            "orders",
            Envelope::wrap(&Stall, PayloadCodec::Json).unwrap().to_wire().unwrap(),
        )
        .await
        .unwrap();

    bus.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.visible_len("orders"), 0);

    bus.stop();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(client.visible_len("orders"), 1);
    assert_eq!(client.dequeue_counts("orders"), vec![1]);
    assert_eq!(bus.transport().receive_stats().unwrap().cancelled, 1);
}

#[tokio::test(start_paused = true)]
async fn panicking_exception_hook_does_not_stop_the_loop() {
    let client = InMemoryQueueClient::new();
    let ledger = Ledger::default();
    let executor = MessageHandlerExecutor::new(handlers(&ledger)).with_exception_hook(|_| async {
        panic!("hook failed");
    });
    let options = StorageQueueOptions::default().with_receive(
        ReceiveOptions::default()
            .with_queue_name("orders")
            .with_max_dequeue_count(2)
            .with_poll_interval(Duration::from_secs(1)),
    );
    let bus = Bus::new(
        StorageQueueTransport::new(client.clone(), all_fruit(), options),
        executor,
    );
    bus.transport().initialize_receiving_endpoint().await.unwrap();
    for envelope in [
        Envelope::wrap(&RottenApple { days_old: 9 }, PayloadCodec::Json).unwrap(),
        Envelope::wrap(&Banana { ripeness: 4 }, PayloadCodec::Json).unwrap(),
    ] {
        client.add_message("orders", envelope.to_wire().unwrap()).await.unwrap();
    }

    bus.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    bus.stop();

    assert_eq!(ledger.entries(), vec!["banana:4".to_string()]);
    assert_eq!(client.len("orders"), 0);
    assert_eq!(client.len("orders-poison"), 1);
    let stats = bus.transport().receive_stats().unwrap();
    assert_eq!(stats.released, 1);
    assert_eq!(stats.quarantined, 1);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn bitcode_payloads_are_handled() {
    let client = InMemoryQueueClient::new();
    let ledger = Ledger::default();
    let bus = service(&client, "orders", all_fruit(), PublishOptions::default(), &ledger)
        .with_codec(PayloadCodec::Bitcode);
    bus.transport().initialize_receiving_endpoint().await.unwrap();

    bus.publish(&Banana { ripeness: 8 }).await.unwrap();
    let outcome = bus.transport().receive_once(bus.executor()).await;

    assert_eq!(outcome, Some(ReceiveOutcome::Completed));
    assert_eq!(ledger.entries(), vec!["banana:8".to_string()]);
}

#[tokio::test]
async fn commands_cannot_be_published_nor_events_sent() {
    let client = InMemoryQueueClient::new();
    let bus = service(
        &client,
        "orders",
        all_fruit(),
        PublishOptions::default().with_send_routes(SendRoutes::new().route::<Banana>("billing")),
        &Ledger::default(),
    );
    bus.start().await.unwrap();
    client.create_if_not_exists("billing").await.unwrap();

    let published = bus.publish(&Apple { variety: "gala".into() }).await.unwrap_err();
    assert!(matches!(
        published,
        BusError::WrongMessageKind { message_type: "Apple", expected: MessageKind::Event }
    ));
    let sent = bus.send(&Banana { ripeness: 3 }).await.unwrap_err();
    assert!(matches!(
        sent,
        BusError::WrongMessageKind { message_type: "Banana", expected: MessageKind::Command }
    ));
    assert!(sent.is_configuration());

    assert_eq!(client.len("orders"), 0);
    assert_eq!(client.len("billing"), 0);
    bus.stop();
}
