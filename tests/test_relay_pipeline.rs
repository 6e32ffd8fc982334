//! Integration tests for the receive/relay/publish pipeline
//!
//! Runs the work-item pool against the mock broker:
//! - every inbound message yields exactly one relay publish, payload unchanged
//! - per-work-item order is preserved
//! - at most `parallel` messages are in flight
//! - send failures are fatal unless a retry policy is configured

use mqtt_async_relay::config::{ClientConfig, RELAY_TOPIC};
use mqtt_async_relay::relay::{RelaySettings, SendPolicy, WorkerPool};
use mqtt_async_relay::testing::{MockBroker, MockContext};
use mqtt_async_relay::transport::mqtt::ReconnectConfig;
use mqtt_async_relay::RelayError;
use proptest::prelude::*;
use std::time::Duration;

fn pool(broker: &MockBroker, parallel: usize, settings: &RelaySettings) -> WorkerPool<MockContext> {
    WorkerPool::new((0..parallel).map(|_| broker.open_context()), settings)
}

#[tokio::test]
async fn test_every_message_relayed_once() {
    let broker = MockBroker::new();
    for n in 0..100u32 {
        let topic = if n % 2 == 0 {
            "/nanomq/msg/1"
        } else {
            "/nanomq/msg/2"
        };
        broker.inject_publish(topic, n.to_string().as_bytes());
    }
    broker.close();

    pool(&broker, 8, &RelaySettings::default())
        .run()
        .await
        .expect("pool should finish once the inbox closes");

    let published = broker.get_published_messages().await;
    assert_eq!(published.len(), 100);
    assert!(published.iter().all(|(topic, _)| topic == RELAY_TOPIC));

    let mut payloads: Vec<u32> = published
        .iter()
        .map(|(_, p)| String::from_utf8_lossy(p).parse().unwrap())
        .collect();
    payloads.sort_unstable();
    assert_eq!(payloads, (0..100).collect::<Vec<u32>>());
}

#[tokio::test]
async fn test_parallel_bound_holds_under_slow_sends() {
    let broker = MockBroker::new().with_send_delay(Duration::from_millis(5));
    for n in 0..30u8 {
        broker.inject_publish("/nanomq/msg/1", &[n]);
    }
    broker.close();

    pool(&broker, 3, &RelaySettings::default())
        .run()
        .await
        .unwrap();

    assert!(
        broker.max_in_flight() <= 3,
        "in flight {} exceeds parallel 3",
        broker.max_in_flight()
    );
    assert_eq!(broker.overlapping_receives(), 0);
}

#[tokio::test]
async fn test_receive_errors_do_not_stop_relay() {
    let broker = MockBroker::new();
    broker.inject_error();
    broker.inject_publish("/nanomq/msg/1", b"a");
    broker.inject_error();
    broker.inject_error();
    broker.inject_publish("/nanomq/msg/2", b"b");
    broker.close();

    pool(&broker, 2, &RelaySettings::default())
        .run()
        .await
        .unwrap();

    assert_eq!(broker.get_published_messages().await.len(), 2);
}

#[tokio::test]
async fn test_send_failure_is_fatal_by_default() {
    let broker = MockBroker::new();
    broker.fail_all_sends();
    broker.inject_publish("/nanomq/msg/1", b"lost");

    let settings = RelaySettings::from_config(&ClientConfig::default());
    assert_eq!(settings.send_policy, SendPolicy::Fatal);

    let err = pool(&broker, 4, &settings).run().await.unwrap_err();
    assert!(matches!(err, RelayError::SendFailed { attempts: 1, .. }));
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn test_retry_policy_survives_transient_failures() {
    let broker = MockBroker::new();
    broker.fail_next_sends(3);
    for n in 0..5u8 {
        broker.inject_publish("/nanomq/msg/1", &[n]);
    }
    broker.close();

    let settings = RelaySettings {
        send_policy: SendPolicy::Retry {
            max_retries: 5,
            backoff: ReconnectConfig {
                max_attempts: None,
                backoff_pattern: vec![1, 2],
                sustained_delay: 2,
            },
        },
        ..RelaySettings::default()
    };
    pool(&broker, 1, &settings).run().await.unwrap();

    let payloads: Vec<u8> = broker
        .get_published_messages()
        .await
        .iter()
        .map(|(_, p)| p[0])
        .collect();
    assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
    assert_eq!(broker.send_attempts(), 8);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_single_work_item_relays_in_order(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..20),
        topic in "/[a-z]{1,8}/[a-z0-9]{1,8}",
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        let published = runtime.block_on(async {
            let broker = MockBroker::new();
            for payload in &payloads {
                broker.inject_publish(&topic, payload);
            }
            broker.close();
            pool(&broker, 1, &RelaySettings::default()).run().await.unwrap();
            broker.get_published_messages().await
        });

        prop_assert_eq!(published.len(), payloads.len());
        for ((out_topic, out_payload), payload) in published.iter().zip(&payloads) {
            prop_assert_eq!(out_topic.as_str(), RELAY_TOPIC);
            prop_assert_eq!(out_payload, payload);
        }
    }
}
