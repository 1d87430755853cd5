//! In-process terminal simulator. Backs `simulate_terminal` in the server
//! and doubles as the test terminal for the bridge.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::{
    ContextWrite, FunctionCall, SecurityLookup, TerminalEvent, TerminalGroup, TerminalSecurity,
    TerminalSession, TerminalWorksheet,
};

/// Everything the simulator has been asked to do, in call order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminalCalls {
    pub probes: u32,
    pub local_registrations: u32,
    pub remote_registrations: Vec<String>,
    pub functions: Vec<FunctionCall>,
    pub context_writes: Vec<ContextWrite>,
    pub group_event_subscriptions: u32,
    pub lookups_opened: u32,
    pub lookups_disposed: u32,
    pub lookup_queries: Vec<String>,
    pub max_concurrent_queries: u32,
}

struct SimulatorState {
    registered: bool,
    accept_registration: bool,
    group_events_enabled: bool,
    probe_failure: Option<String>,
    group_events_failure: Option<String>,
    lookup_open_failure: Option<String>,
    lookup_dispose_failure: Option<String>,
    lookup_results: Vec<String>,
    query_delay: Option<Duration>,
    queries_in_flight: u32,
    worksheets: Vec<TerminalWorksheet>,
    groups: Vec<TerminalGroup>,
    next_worksheet_id: u64,
    calls: TerminalCalls,
}

pub struct InMemoryTerminal {
    state: Arc<Mutex<SimulatorState>>,
    events: broadcast::Sender<TerminalEvent>,
}

impl InMemoryTerminal {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Arc::new(Mutex::new(SimulatorState {
                registered: false,
                accept_registration: true,
                group_events_enabled: false,
                probe_failure: None,
                group_events_failure: None,
                lookup_open_failure: None,
                lookup_dispose_failure: None,
                lookup_results: Vec::new(),
                query_delay: None,
                queries_in_flight: 0,
                worksheets: Vec::new(),
                groups: Vec::new(),
                next_worksheet_id: 1,
                calls: TerminalCalls::default(),
            })),
            events,
        }
    }

    /// A terminal with the four standard launchpad groups and one worksheet.
    pub async fn with_sample_data() -> Self {
        let terminal = Self::new();
        for name in ["Group-A", "Group-B", "Group-C", "Group-D"] {
            terminal.add_group(name, "security", None).await;
        }
        terminal
            .add_worksheet("Watchlist", &["IBM US Equity", "AAPL US Equity"])
            .await;
        terminal
            .set_lookup_results(&[
                "IBM US<equity>",
                "IBM 4.7 02/19/46 Corp<corp>",
                "IBMINT Index<index>",
            ])
            .await;
        terminal
    }

    pub async fn calls(&self) -> TerminalCalls {
        self.state.lock().await.calls.clone()
    }

    pub async fn set_registered(&self, registered: bool) {
        self.state.lock().await.registered = registered;
    }

    pub async fn set_accept_registration(&self, accept: bool) {
        self.state.lock().await.accept_registration = accept;
    }

    pub async fn fail_probe(&self, error: Option<&str>) {
        self.state.lock().await.probe_failure = error.map(str::to_string);
    }

    pub async fn fail_group_events(&self, error: Option<&str>) {
        self.state.lock().await.group_events_failure = error.map(str::to_string);
    }

    pub async fn fail_lookup_open(&self, error: Option<&str>) {
        self.state.lock().await.lookup_open_failure = error.map(str::to_string);
    }

    pub async fn fail_lookup_dispose(&self, error: Option<&str>) {
        self.state.lock().await.lookup_dispose_failure = error.map(str::to_string);
    }

    pub async fn set_lookup_results(&self, results: &[&str]) {
        self.state.lock().await.lookup_results = results.iter().map(|r| r.to_string()).collect();
    }

    pub async fn set_query_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.query_delay = delay;
    }

    pub async fn add_worksheet(&self, name: &str, tickers: &[&str]) -> TerminalWorksheet {
        let mut guard = self.state.lock().await;
        let worksheet = TerminalWorksheet {
            id: format!("ws-{}", guard.next_worksheet_id),
            name: name.to_string(),
            is_active: guard.worksheets.is_empty(),
            securities: tickers.iter().map(|t| TerminalSecurity::new(*t)).collect(),
        };
        guard.next_worksheet_id += 1;
        guard.worksheets.push(worksheet.clone());
        worksheet
    }

    pub async fn add_group(&self, name: &str, group_type: &str, value: Option<&str>) {
        self.state.lock().await.groups.push(TerminalGroup {
            name: name.to_string(),
            group_type: group_type.to_string(),
            value: value.map(str::to_string),
        });
    }

    /// Simulates an abrupt loss of the terminal session.
    pub async fn disconnect(&self) {
        {
            let mut guard = self.state.lock().await;
            guard.registered = false;
            guard.group_events_enabled = false;
        }
        let _ = self.events.send(TerminalEvent::Disconnected);
    }

    /// Simulates a user changing a group's value inside the terminal.
    pub async fn push_group_change(&self, name: &str, value: &str, cookie: Option<&str>) {
        let group = {
            let mut guard = self.state.lock().await;
            let Some(group) = guard.groups.iter_mut().find(|g| g.name == name) else {
                return;
            };
            group.value = Some(value.to_string());
            group.clone()
        };
        let _ = self.events.send(TerminalEvent::GroupContextChanged {
            group: Some(group),
            groups: None,
            cookie: cookie.map(str::to_string),
            external_source: true,
        });
    }

    fn update_worksheet(
        guard: &mut SimulatorState,
        worksheet_id: &str,
        securities: &[String],
        replace: bool,
    ) -> anyhow::Result<TerminalWorksheet> {
        let worksheet = guard
            .worksheets
            .iter_mut()
            .find(|w| w.id == worksheet_id)
            .ok_or_else(|| anyhow!("no worksheet with id {worksheet_id}"))?;
        if replace {
            worksheet.securities.clear();
        }
        worksheet
            .securities
            .extend(securities.iter().map(TerminalSecurity::new));
        Ok(worksheet.clone())
    }
}

impl Default for InMemoryTerminal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TerminalSession for InMemoryTerminal {
    async fn is_registered(&self) -> anyhow::Result<bool> {
        let mut guard = self.state.lock().await;
        guard.calls.probes += 1;
        if let Some(err) = &guard.probe_failure {
            bail!(err.clone());
        }
        Ok(guard.registered)
    }

    async fn register(&self) -> anyhow::Result<()> {
        let mut guard = self.state.lock().await;
        guard.calls.local_registrations += 1;
        if !guard.accept_registration {
            bail!("terminal refused local registration");
        }
        guard.registered = true;
        debug!("simulator: registered locally");
        Ok(())
    }

    async fn register_remote(&self, address: &str) -> anyhow::Result<()> {
        let mut guard = self.state.lock().await;
        guard.calls.remote_registrations.push(address.to_string());
        if !guard.accept_registration {
            bail!("terminal at {address} refused registration");
        }
        guard.registered = true;
        debug!(%address, "simulator: registered remotely");
        Ok(())
    }

    async fn run_function(&self, call: FunctionCall) -> anyhow::Result<()> {
        let mut guard = self.state.lock().await;
        if !guard.registered {
            bail!("terminal session is not registered");
        }
        guard.calls.functions.push(call);
        Ok(())
    }

    async fn worksheets(&self) -> anyhow::Result<Vec<TerminalWorksheet>> {
        Ok(self.state.lock().await.worksheets.clone())
    }

    async fn create_worksheet(
        &self,
        name: &str,
        securities: &[String],
    ) -> anyhow::Result<TerminalWorksheet> {
        let tickers: Vec<&str> = securities.iter().map(String::as_str).collect();
        Ok(self.add_worksheet(name, &tickers).await)
    }

    async fn replace_worksheet_securities(
        &self,
        worksheet_id: &str,
        securities: &[String],
    ) -> anyhow::Result<TerminalWorksheet> {
        let mut guard = self.state.lock().await;
        Self::update_worksheet(&mut guard, worksheet_id, securities, true)
    }

    async fn append_worksheet_securities(
        &self,
        worksheet_id: &str,
        securities: &[String],
    ) -> anyhow::Result<TerminalWorksheet> {
        let mut guard = self.state.lock().await;
        Self::update_worksheet(&mut guard, worksheet_id, securities, false)
    }

    async fn groups(&self) -> anyhow::Result<Vec<TerminalGroup>> {
        Ok(self.state.lock().await.groups.clone())
    }

    async fn group(&self, name: &str) -> anyhow::Result<Option<TerminalGroup>> {
        Ok(self
            .state
            .lock()
            .await
            .groups
            .iter()
            .find(|g| g.name == name)
            .cloned())
    }

    async fn set_group_context(&self, write: &ContextWrite) -> anyhow::Result<()> {
        let (group, notify) = {
            let mut guard = self.state.lock().await;
            guard.calls.context_writes.push(write.clone());
            let notify = guard.group_events_enabled;
            let group = guard
                .groups
                .iter_mut()
                .find(|g| g.name == write.group)
                .ok_or_else(|| anyhow!("no group named {}", write.group))?;
            group.value = Some(write.value.clone());
            (group.clone(), notify)
        };
        if notify {
            let _ = self.events.send(TerminalEvent::GroupContextChanged {
                group: Some(group),
                groups: None,
                cookie: write.cookie.clone(),
                external_source: false,
            });
        }
        Ok(())
    }

    async fn enable_group_events(&self) -> anyhow::Result<()> {
        let mut guard = self.state.lock().await;
        guard.calls.group_event_subscriptions += 1;
        if let Some(err) = &guard.group_events_failure {
            bail!(err.clone());
        }
        guard.group_events_enabled = true;
        Ok(())
    }

    async fn open_security_lookup(&self) -> anyhow::Result<Arc<dyn SecurityLookup>> {
        let mut guard = self.state.lock().await;
        if let Some(err) = &guard.lookup_open_failure {
            bail!(err.clone());
        }
        guard.calls.lookups_opened += 1;
        Ok(Arc::new(InMemoryLookup {
            state: Arc::clone(&self.state),
        }))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TerminalEvent> {
        self.events.subscribe()
    }
}

struct InMemoryLookup {
    state: Arc<Mutex<SimulatorState>>,
}

#[async_trait]
impl SecurityLookup for InMemoryLookup {
    async fn query(&self, text: &str, max_results: usize) -> anyhow::Result<Vec<String>> {
        let delay = {
            let mut guard = self.state.lock().await;
            guard.calls.lookup_queries.push(text.to_string());
            guard.queries_in_flight += 1;
            guard.calls.max_concurrent_queries = guard
                .calls
                .max_concurrent_queries
                .max(guard.queries_in_flight);
            guard.query_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut guard = self.state.lock().await;
        guard.queries_in_flight -= 1;
        Ok(guard
            .lookup_results
            .iter()
            .take(max_results)
            .cloned()
            .collect())
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        let mut guard = self.state.lock().await;
        guard.calls.lookups_disposed += 1;
        if let Some(err) = &guard.lookup_dispose_failure {
            bail!(err.clone());
        }
        Ok(())
    }
}
