use std::{collections::HashMap, sync::Arc};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use shared::protocol::{BridgeEvent, BusMessage, RpcResponse};
use tokio::sync::{broadcast, RwLock};

/// Answers requests arriving on one bus topic.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, body: Value) -> RpcResponse;
}

/// The desktop integration bus as the bridge sees it.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn register_responder(&self, topic: &str, responder: Arc<dyn Responder>) -> Result<()>;
    async fn unregister_responder(&self, topic: &str) -> Result<()>;
    async fn publish(&self, topic: &str, payload: Value) -> Result<()>;
}

pub async fn publish_event(bus: &dyn MessageBus, event: &BridgeEvent) -> Result<()> {
    let payload = event.payload()?;
    bus.publish(event.topic(), payload).await
}

/// In-process bus: a responder table plus a broadcast fan-out of
/// published messages.
pub struct LocalBus {
    responders: RwLock<HashMap<String, Arc<dyn Responder>>>,
    events: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            responders: RwLock::new(HashMap::new()),
            events,
        })
    }

    /// Routes a request to the responder for `topic`, if one is registered.
    pub async fn request(&self, topic: &str, body: Value) -> Option<RpcResponse> {
        let responder = self.responders.read().await.get(topic).cloned()?;
        Some(responder.respond(body).await)
    }

    pub async fn responder_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.responders.read().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.events.subscribe()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn register_responder(&self, topic: &str, responder: Arc<dyn Responder>) -> Result<()> {
        let mut guard = self.responders.write().await;
        if guard.contains_key(topic) {
            bail!("a responder is already registered for topic {topic}");
        }
        guard.insert(topic.to_string(), responder);
        Ok(())
    }

    async fn unregister_responder(&self, topic: &str) -> Result<()> {
        if self.responders.write().await.remove(topic).is_none() {
            bail!("no responder registered for topic {topic}");
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        // No subscribers is not an error for fire-and-forget events.
        let _ = self.events.send(BusMessage::new(topic, payload));
        Ok(())
    }
}
