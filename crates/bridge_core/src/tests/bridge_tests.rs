use serde_json::json;
use shared::protocol::{
    RpcResponse, CONNECTION_STATUS_TOPIC, CONNECT_TOPIC, RPC_TOPICS, RUN_TERMINAL_FUNCTION_TOPIC,
};
use terminal_integration::memory::InMemoryTerminal;

use super::*;
use crate::bus::{LocalBus, MessageBus, Responder};

async fn start(terminal: &Arc<InMemoryTerminal>, bus: &Arc<LocalBus>) -> Arc<Bridge> {
    Bridge::start(
        terminal.clone(),
        bus.clone(),
        ConnectionSettings::default(),
        BridgeOptions::default(),
    )
    .await
    .expect("bridge starts")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

struct Echo;

#[async_trait::async_trait]
impl Responder for Echo {
    async fn respond(&self, body: serde_json::Value) -> RpcResponse {
        RpcResponse::ok().with_field("echo", body)
    }
}

#[tokio::test(start_paused = true)]
async fn start_registers_every_topic_and_logs_in() {
    let terminal = Arc::new(InMemoryTerminal::with_sample_data().await);
    let bus = LocalBus::new();
    let mut published = bus.subscribe();
    let bridge = start(&terminal, &bus).await;
    settle().await;

    let mut expected: Vec<_> = RPC_TOPICS.iter().map(|topic| topic.to_string()).collect();
    expected.sort();
    assert_eq!(bus.responder_topics().await, expected);

    assert!(bridge.state().await.registered);
    let message = published.try_recv().expect("status published");
    assert_eq!(message.topic, CONNECTION_STATUS_TOPIC);

    let response = bus
        .request(RUN_TERMINAL_FUNCTION_TOPIC, json!({ "function": "GetAllGroups" }))
        .await
        .expect("responder present");
    assert!(response.status);
    assert_eq!(response.payload["groups"].as_array().unwrap().len(), 4);

    bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_registration_rolls_back_earlier_topics() {
    let terminal = Arc::new(InMemoryTerminal::new());
    let bus = LocalBus::new();
    bus.register_responder(RUN_TERMINAL_FUNCTION_TOPIC, Arc::new(Echo))
        .await
        .unwrap();

    let result = Bridge::start(
        terminal.clone(),
        bus.clone(),
        ConnectionSettings::default(),
        BridgeOptions::default(),
    )
    .await;
    let err = result.err().expect("duplicate topic rejected");
    assert!(format!("{err:#}").contains(RUN_TERMINAL_FUNCTION_TOPIC));
    assert_eq!(
        bus.responder_topics().await,
        vec![RUN_TERMINAL_FUNCTION_TOPIC.to_string()]
    );
}

/// Forwards to a `LocalBus` but refuses every deregistration.
struct StickyBus {
    inner: Arc<LocalBus>,
}

#[async_trait::async_trait]
impl MessageBus for StickyBus {
    async fn register_responder(
        &self,
        topic: &str,
        responder: Arc<dyn Responder>,
    ) -> anyhow::Result<()> {
        self.inner.register_responder(topic, responder).await
    }

    async fn unregister_responder(&self, topic: &str) -> anyhow::Result<()> {
        anyhow::bail!("bus refused to drop {topic}")
    }

    async fn publish(&self, topic: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        self.inner.publish(topic, payload).await
    }
}

#[tokio::test(start_paused = true)]
async fn failed_rollback_still_reports_the_registration_error() {
    let inner = LocalBus::new();
    inner
        .register_responder(RUN_TERMINAL_FUNCTION_TOPIC, Arc::new(Echo))
        .await
        .unwrap();
    let bus = Arc::new(StickyBus {
        inner: inner.clone(),
    });

    let err = Bridge::start(
        Arc::new(InMemoryTerminal::new()),
        bus,
        ConnectionSettings::default(),
        BridgeOptions::default(),
    )
    .await
    .err()
    .expect("duplicate topic rejected");
    let message = format!("{err:#}");
    assert!(message.contains("failed to register responder for run_terminal_function"));
    assert!(!message.contains("refused"));
    assert_eq!(inner.responder_topics().await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn shutdown_deregisters_and_disposes_even_when_disposal_fails() {
    let terminal = Arc::new(InMemoryTerminal::with_sample_data().await);
    let bus = LocalBus::new();
    let bridge = start(&terminal, &bus).await;
    settle().await;
    assert!(bridge.hub().lookup().await.is_some());

    terminal.fail_lookup_dispose(Some("dispose threw")).await;
    bridge.shutdown().await;

    assert!(bus.responder_topics().await.is_empty());
    assert!(bridge.hub().lookup().await.is_none());
    assert_eq!(terminal.calls().await.lookups_disposed, 1);
    assert!(bus
        .request(CONNECT_TOPIC, json!({ "connect": true }))
        .await
        .is_none());

    let probes = terminal.calls().await.probes;
    tokio::time::sleep(POLL_INTERVAL * 3).await;
    assert_eq!(terminal.calls().await.probes, probes);

    bridge.shutdown().await;
    assert_eq!(terminal.calls().await.lookups_disposed, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drops_a_pending_context_write() {
    let terminal = Arc::new(InMemoryTerminal::with_sample_data().await);
    let bus = LocalBus::new();
    let bridge = start(&terminal, &bus).await;
    settle().await;

    for value in ["IBM US Equity", "AAPL US Equity"] {
        let response = bus
            .request(
                RUN_TERMINAL_FUNCTION_TOPIC,
                json!({ "function": "SetGroupContext", "name": "Group-B", "value": value }),
            )
            .await
            .expect("responder present");
        assert!(response.status);
    }
    bridge.shutdown().await;
    tokio::time::sleep(CONTEXT_THROTTLE_WINDOW * 2).await;

    assert_eq!(terminal.calls().await.context_writes.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn settings_changes_move_the_session() {
    let terminal = Arc::new(InMemoryTerminal::with_sample_data().await);
    let bus = LocalBus::new();
    let bridge = start(&terminal, &bus).await;
    let (updates, receiver) = watch::channel(ConnectionSettings::default());
    bridge.watch_settings(receiver).await;
    settle().await;
    assert_eq!(bridge.state().await.connected_to().as_deref(), Some("localhost"));

    updates
        .send(ConnectionSettings {
            enabled: true,
            remote: true,
            remote_address: "10.0.0.9".into(),
        })
        .expect("watcher alive");
    settle().await;

    let state = bridge.state().await;
    assert!(state.registered);
    assert_eq!(state.connected_to().as_deref(), Some("10.0.0.9"));
    assert!(bridge.hub().lookup().await.is_none());

    updates
        .send(ConnectionSettings {
            enabled: false,
            ..ConnectionSettings::default()
        })
        .expect("watcher alive");
    settle().await;
    assert!(!bridge.state().await.registered);

    bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn poke_runs_a_cycle_immediately() {
    let terminal = Arc::new(InMemoryTerminal::new());
    terminal.set_accept_registration(false).await;
    let bus = LocalBus::new();
    let bridge = start(&terminal, &bus).await;
    settle().await;
    assert!(!bridge.state().await.registered);

    terminal.set_accept_registration(true).await;
    bridge.poke();
    settle().await;
    assert!(bridge.state().await.registered);

    bridge.shutdown().await;
}

#[test]
fn blank_remote_address_falls_back_to_local() {
    let settings = ConnectionSettings {
        enabled: true,
        remote: true,
        remote_address: "  ".into(),
    };
    assert_eq!(settings.mode(), ConnectionMode::Local);
}
