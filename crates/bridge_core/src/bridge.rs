use std::{sync::Arc, time::Duration};

use anyhow::Context;
use shared::domain::{ConnectionMode, ConnectionState};
use terminal_integration::TerminalSession;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    bus::MessageBus,
    dispatch::{CommandDispatcher, Endpoint, EndpointResponder},
    monitor::{dispose_lookup, ConnectionMonitor, POLL_INTERVAL},
    state::ConnectionHub,
    throttle::{ContextThrottle, CONTEXT_THROTTLE_WINDOW},
};

/// Connection settings that may change while the bridge runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub enabled: bool,
    pub remote: bool,
    pub remote_address: String,
}

impl ConnectionSettings {
    pub fn mode(&self) -> ConnectionMode {
        ConnectionMode::from_settings(self.remote, &self.remote_address)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            remote: false,
            remote_address: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeOptions {
    pub poll_interval: Duration,
    pub throttle_window: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            throttle_window: CONTEXT_THROTTLE_WINDOW,
        }
    }
}

/// A running bridge: responders registered on the bus plus the monitor
/// and terminal-event tasks.
pub struct Bridge {
    hub: Arc<ConnectionHub>,
    bus: Arc<dyn MessageBus>,
    monitor: Arc<ConnectionMonitor>,
    dispatcher: Arc<CommandDispatcher>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge {
    pub async fn start(
        terminal: Arc<dyn TerminalSession>,
        bus: Arc<dyn MessageBus>,
        settings: ConnectionSettings,
        options: BridgeOptions,
    ) -> anyhow::Result<Arc<Self>> {
        let hub = Arc::new(ConnectionHub::new(settings.enabled, settings.mode()));
        let monitor = Arc::new(ConnectionMonitor::new(
            Arc::clone(&hub),
            Arc::clone(&terminal),
            Arc::clone(&bus),
            options.poll_interval,
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&hub),
            Arc::clone(&terminal),
            ContextThrottle::new(Arc::clone(&terminal), options.throttle_window),
            monitor.wake_handle(),
        ));

        let mut registered = Vec::new();
        for endpoint in Endpoint::ALL {
            let responder = Arc::new(EndpointResponder::new(Arc::clone(&dispatcher), endpoint));
            let result = bus
                .register_responder(endpoint.topic(), responder)
                .await
                .with_context(|| format!("failed to register responder for {}", endpoint.topic()));
            if let Err(err) = result {
                for topic in registered {
                    if let Err(rollback) = bus.unregister_responder(topic).await {
                        warn!(topic, err = %rollback, "bridge: failed to roll back responder");
                    }
                }
                return Err(err);
            }
            registered.push(endpoint.topic());
        }

        let shutdown = CancellationToken::new();
        let events = terminal.subscribe_events();
        let tasks = vec![
            tokio::spawn(Arc::clone(&monitor).run(shutdown.clone())),
            tokio::spawn(Arc::clone(&monitor).listen(events, shutdown.clone())),
        ];
        info!(
            enabled = settings.enabled,
            host = settings.mode().host(),
            "bridge: started"
        );

        Ok(Arc::new(Self {
            hub,
            bus,
            monitor,
            dispatcher,
            shutdown,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub async fn state(&self) -> ConnectionState {
        self.hub.snapshot().await
    }

    /// Applies live configuration changes until shutdown.
    pub async fn watch_settings(&self, mut updates: watch::Receiver<ConnectionSettings>) {
        let hub = Arc::clone(&self.hub);
        let wake = self.monitor.wake_handle();
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let settings = updates.borrow_and_update().clone();
                        info!(
                            enabled = settings.enabled,
                            host = settings.mode().host(),
                            "bridge: connection settings updated"
                        );
                        hub.apply_settings(settings.enabled, settings.mode()).await;
                        wake.notify_one();
                    }
                }
            }
        });
        self.tasks.lock().await.push(task);
    }

    /// Wakes the monitor so the next cycle runs now.
    pub fn poke(&self) {
        self.monitor.wake_handle().notify_one();
    }

    /// Stops background work, deregisters every responder and releases the
    /// lookup. Each step runs even if an earlier one failed.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        for endpoint in Endpoint::ALL {
            if let Err(err) = self.bus.unregister_responder(endpoint.topic()).await {
                warn!(topic = endpoint.topic(), %err, "bridge: failed to deregister responder");
            }
        }
        self.dispatcher.throttle().cancel_pending().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(err) = task.await {
                warn!(%err, "bridge: background task ended abnormally");
            }
        }

        let released = self.hub.lock().await.lookup.take();
        if let Some(lookup) = released {
            dispose_lookup(lookup).await;
        }
        info!("bridge: stopped");
    }
}

#[cfg(test)]
#[path = "tests/bridge_tests.rs"]
mod tests;
