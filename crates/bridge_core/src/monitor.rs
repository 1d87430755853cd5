use std::{sync::Arc, time::Duration};

use shared::{
    domain::{ConnectionMode, ConnectionState},
    protocol::BridgeEvent,
};
use terminal_integration::{TerminalEvent, TerminalSession};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bus::{publish_event, MessageBus},
    lookup::LookupGuard,
    render::render_group_event,
    state::{transition, ConnectionHub, HubInner, Observation, Transition},
};

/// Fixed period between registration probes.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Watches the terminal session and keeps [`ConnectionHub`] in step with it.
pub struct ConnectionMonitor {
    hub: Arc<ConnectionHub>,
    terminal: Arc<dyn TerminalSession>,
    bus: Arc<dyn MessageBus>,
    poll_interval: Duration,
    wake: Arc<Notify>,
    /// Endpoint of the last confirmed registration. A stale value only
    /// costs one extra registration attempt.
    endpoint: Mutex<Option<ConnectionMode>>,
}

impl ConnectionMonitor {
    pub fn new(
        hub: Arc<ConnectionHub>,
        terminal: Arc<dyn TerminalSession>,
        bus: Arc<dyn MessageBus>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            hub,
            terminal,
            bus,
            poll_interval,
            wake: Arc::new(Notify::new()),
            endpoint: Mutex::new(None),
        }
    }

    /// Notifying this cuts the current sleep short.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval_ms = self.poll_interval.as_millis() as u64,
            "monitor: polling terminal registration"
        );
        while !shutdown.is_cancelled() {
            self.poll_once().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.wake.notified() => debug!("monitor: woken before next cycle"),
            }
        }
        info!("monitor: stopped");
    }

    /// One probe/register/compare cycle. Returns the state after the cycle.
    pub async fn poll_once(&self) -> ConnectionState {
        let (enabled, mode) = self.hub.desired().await;
        let registered = if enabled {
            self.probe_and_register(&mode).await
        } else {
            false
        };
        self.apply_observation(Observation { registered, mode })
            .await
    }

    async fn probe_and_register(&self, mode: &ConnectionMode) -> bool {
        let mut endpoint = self.endpoint.lock().await;
        if self.probe().await {
            match endpoint.as_ref() {
                Some(current) if current != mode => {
                    info!(
                        from = current.host(),
                        to = mode.host(),
                        "monitor: endpoint changed, registering against new host"
                    );
                }
                Some(_) => return true,
                None => {
                    *endpoint = Some(mode.clone());
                    return true;
                }
            }
        }

        let attempt = match mode {
            ConnectionMode::Remote(address) => self.terminal.register_remote(address).await,
            ConnectionMode::Local => self.terminal.register().await,
        };
        if let Err(err) = attempt {
            debug!(host = mode.host(), %err, "monitor: registration attempt failed");
            return false;
        }
        let confirmed = self.probe().await;
        if confirmed {
            *endpoint = Some(mode.clone());
        }
        confirmed
    }

    async fn probe(&self) -> bool {
        match self.terminal.is_registered().await {
            Ok(registered) => registered,
            Err(err) => {
                warn!(%err, "monitor: registration probe failed; treating as unregistered");
                false
            }
        }
    }

    pub(crate) async fn apply_observation(&self, observed: Observation) -> ConnectionState {
        let mut released = Vec::new();
        let state = self.apply_locked(observed, &mut released).await;
        for lookup in released {
            dispose_lookup(lookup).await;
        }
        state
    }

    /// Lookups that must be disposed are pushed to `released` and disposed
    /// by the caller once the hub lock is gone.
    async fn apply_locked(
        &self,
        mut observed: Observation,
        released: &mut Vec<Arc<LookupGuard>>,
    ) -> ConnectionState {
        let mut guard = self.hub.lock().await;
        let change = transition(&guard.state, &observed);
        if change == Transition::Unchanged {
            return guard.state.clone();
        }

        if change.needs_teardown() {
            released.extend(guard.lookup.take());
        }
        if change.needs_setup() {
            if let Err(err) = self.post_login_setup(&mut guard, &observed.mode).await {
                warn!(%err, "monitor: post-login setup failed; reporting unregistered");
                released.extend(guard.lookup.take());
                observed.registered = false;
            }
        }

        let next = ConnectionState {
            enabled: guard.state.enabled,
            registered: observed.registered,
            mode: observed.mode,
        };
        if next == guard.state {
            return next;
        }
        guard.state = next.clone();
        info!(
            enabled = next.enabled,
            registered = next.registered,
            host = next.mode.host(),
            transition = ?change,
            "monitor: connection state changed"
        );
        self.publish(BridgeEvent::ConnectionStatus(next.status()))
            .await;
        next
    }

    async fn post_login_setup(
        &self,
        guard: &mut HubInner,
        mode: &ConnectionMode,
    ) -> anyhow::Result<()> {
        self.terminal.enable_group_events().await?;
        if mode.is_remote() {
            debug!("monitor: remote session, security lookup left uninitialized");
            return Ok(());
        }
        let session = self.terminal.open_security_lookup().await?;
        guard.lookup = Some(Arc::new(LookupGuard::new(session)));
        info!("monitor: security lookup initialized");
        Ok(())
    }

    /// Consumes pushed terminal notifications until shutdown.
    pub async fn listen(
        self: Arc<Self>,
        mut events: broadcast::Receiver<TerminalEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "monitor: terminal event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("monitor: terminal event stream closed");
                        break;
                    }
                },
            }
        }
    }

    pub async fn handle_event(&self, event: TerminalEvent) {
        match event {
            TerminalEvent::Disconnected => self.handle_disconnect().await,
            TerminalEvent::GroupContextChanged {
                group,
                groups,
                cookie,
                external_source,
            } => {
                let rendered = render_group_event(
                    group.as_ref(),
                    groups.as_deref(),
                    cookie.as_deref(),
                    external_source,
                );
                debug!(
                    group = rendered.group.as_ref().map(|g| g.name.as_str()),
                    external_source, "monitor: forwarding group context change"
                );
                self.publish(BridgeEvent::GroupContext(rendered)).await;
            }
        }
    }

    /// Out-of-band logout; does not wait for the next poll.
    async fn handle_disconnect(&self) {
        let released = {
            let mut guard = self.hub.lock().await;
            if !guard.state.registered {
                debug!("monitor: disconnect while already unregistered");
                return;
            }
            let released = guard.lookup.take();
            guard.state.registered = false;
            warn!(host = guard.state.mode.host(), "monitor: terminal disconnected");
            let status = guard.state.status();
            self.publish(BridgeEvent::ConnectionStatus(status)).await;
            released
        };
        if let Some(lookup) = released {
            dispose_lookup(lookup).await;
        }
    }

    async fn publish(&self, event: BridgeEvent) {
        if let Err(err) = publish_event(self.bus.as_ref(), &event).await {
            warn!(topic = event.topic(), %err, "monitor: failed to publish event");
        }
    }
}

/// Disposal errors are logged, never returned. Call without the hub lock
/// held: disposal waits for any in-flight query.
pub(crate) async fn dispose_lookup(lookup: Arc<LookupGuard>) {
    match lookup.dispose().await {
        Ok(()) => info!("monitor: security lookup disposed"),
        Err(err) => warn!(%err, "monitor: failed to dispose security lookup"),
    }
}

#[cfg(test)]
#[path = "tests/monitor_tests.rs"]
mod tests;
