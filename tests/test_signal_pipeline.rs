//! Market event delivery through the client

use binary_options_engine::monitoring::metrics;
use binary_options_engine::{
    Client, Credentials, Direction, EngineConfig, EventPayload, MarketEvent, MockBroker,
    PipelineError, TradeSignal,
};
use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn connect(broker: &MockBroker, config: EngineConfig) -> Client {
    Client::connect(
        Credentials::demo("abcdefghijklmnopqrstuvwxyz"),
        config,
        Arc::new(broker.connector()),
    )
    .await
    .unwrap()
}

fn price(asset: &str, price: &str) -> serde_json::Value {
    json!({"type": "price", "asset": asset, "price": price})
}

#[tokio::test(start_paused = true)]
async fn test_per_asset_order_is_preserved() {
    let broker = MockBroker::new();
    let client = connect(&broker, EngineConfig::default()).await;
    let mut events = client.subscribe().await;

    for i in 1..=5 {
        broker.push_json(price("EURUSD", &format!("1.0{}", i)));
        broker.push_json(price("GBPUSD", &format!("1.2{}", i)));
    }

    let mut received: Vec<MarketEvent> = Vec::new();
    while received.len() < 10 {
        received.push(events.next().await.unwrap());
    }

    let sequences: Vec<u64> = received.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (1..=10).collect::<Vec<_>>());

    let eurusd: Vec<String> = received
        .iter()
        .filter(|e| e.asset.as_ref().map(|a| a.as_str()) == Some("EURUSD"))
        .map(|e| e.price().unwrap().to_string())
        .collect();
    assert_eq!(eurusd, vec!["1.01", "1.02", "1.03", "1.04", "1.05"]);

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_do_not_stop_the_stream() {
    let broker = MockBroker::new();
    let client = connect(&broker, EngineConfig::default()).await;
    let mut events = client.subscribe().await;

    broker.push_text("{not json");
    broker.push_json(json!({"type": "price", "asset": "EURUSD", "price": "-1"}));
    broker.push_json(json!(["an", "array"]));
    broker.push_json(price("EURUSD", "1.1"));

    let event = events.next().await.unwrap();
    assert_eq!(event.sequence, 1);
    assert_eq!(event.price().unwrap().to_string(), "1.1");
    assert_eq!(client.metrics().counter(metrics::FRAMES_MALFORMED).await, 3);

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_broker_and_published_signals_share_the_stream() {
    let broker = MockBroker::new();
    let client = connect(&broker, EngineConfig::default()).await;
    let mut events = client.subscribe().await;

    broker.push_json(json!({
        "type": "signal",
        "asset": "EURUSD_otc",
        "direction": "put",
        "strength": 0.7,
        "source": "broker"
    }));
    let first = events.next().await.unwrap();
    assert!(first.is_signal());

    client
        .publish_signal(
            TradeSignal::new("EURUSD_otc", Direction::Call)
                .with_strength(0.9)
                .with_source("ema-cross"),
        )
        .await
        .unwrap();
    let second = events.next().await.unwrap();
    match second.payload {
        EventPayload::Signal(signal) => {
            assert_eq!(signal.direction, Direction::Call);
            assert_eq!(signal.source.as_deref(), Some("ema-cross"));
        }
        other => panic!("expected a signal, got {:?}", other),
    }
    assert!(second.sequence > first.sequence);

    let invalid = client
        .publish_signal(TradeSignal::new("EURUSD_otc", Direction::Put).with_strength(3.0))
        .await;
    assert!(matches!(invalid, Err(PipelineError::InvalidSignal(_))));

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_frames_are_forwarded() {
    let broker = MockBroker::new();
    let client = connect(&broker, EngineConfig::default()).await;
    let mut events = client.subscribe().await;

    broker.push_json(json!({"type": "asset_closed", "asset": "AUDCAD_otc", "timestamp": 1700000000000u64}));

    let event = events.next().await.unwrap();
    assert_eq!(event.timestamp, 1_700_000_000_000);
    assert_eq!(event.asset.unwrap().as_str(), "AUDCAD_otc");
    match event.payload {
        EventPayload::Unknown { kind, raw } => {
            assert_eq!(kind, "asset_closed");
            assert_eq!(raw["asset"], "AUDCAD_otc");
        }
        other => panic!("expected an unknown event, got {:?}", other),
    }

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_subscriber_loses_oldest_events() {
    let broker = MockBroker::new();
    let config = EngineConfig {
        subscriber_buffer_size: 5,
        ..EngineConfig::default()
    };
    let client = connect(&broker, config).await;
    let mut slow = client.subscribe().await;
    let mut fast = client.subscribe().await;

    for i in 1..=20 {
        broker.push_json(price("EURUSD", &format!("1.{}", i)));
        fast.next().await.unwrap();
    }

    let mut sequences = Vec::new();
    while sequences.len() < 5 {
        sequences.push(slow.next().await.unwrap().sequence);
    }
    assert_eq!(sequences, (16..=20).collect::<Vec<u64>>());
    assert_eq!(slow.dropped(), 15);
    assert_eq!(fast.dropped(), 0);
    assert_eq!(client.metrics().counter(metrics::EVENTS_DROPPED).await, 15);

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stream_ends_after_shutdown() {
    let broker = MockBroker::new();
    let client = connect(&broker, EngineConfig::default()).await;
    let events = client.subscribe().await.into_stream();

    broker.push_json(price("EURUSD", "1.1"));
    broker.push_json(price("EURUSD", "1.2"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.shutdown().await;

    let collected: Vec<MarketEvent> = events.collect().await;
    assert_eq!(collected.len(), 2);
    assert!(client.subscribe().await.is_terminated());
}
