use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::broadcast;

pub mod memory;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalSecurity {
    pub ticker: String,
}

impl TerminalSecurity {
    pub fn new(ticker: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalWorksheet {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub securities: Vec<TerminalSecurity>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalGroup {
    pub name: String,
    pub group_type: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub mnemonic: String,
    /// 1-based launchpad panel.
    pub panel: u8,
    pub securities: Vec<String>,
    pub tail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextWrite {
    pub group: String,
    pub value: String,
    pub cookie: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    GroupContextChanged {
        group: Option<TerminalGroup>,
        groups: Option<Vec<TerminalGroup>>,
        cookie: Option<String>,
        external_source: bool,
    },
    Disconnected,
}

/// Stateful cursor over the terminal's security search. Not safe for
/// overlapping queries; callers serialize access.
#[async_trait]
pub trait SecurityLookup: Send + Sync {
    async fn query(&self, text: &str, max_results: usize) -> anyhow::Result<Vec<String>>;
    async fn dispose(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait TerminalSession: Send + Sync {
    async fn is_registered(&self) -> anyhow::Result<bool>;
    async fn register(&self) -> anyhow::Result<()>;
    async fn register_remote(&self, address: &str) -> anyhow::Result<()>;

    async fn run_function(&self, call: FunctionCall) -> anyhow::Result<()>;

    async fn worksheets(&self) -> anyhow::Result<Vec<TerminalWorksheet>>;
    async fn create_worksheet(
        &self,
        name: &str,
        securities: &[String],
    ) -> anyhow::Result<TerminalWorksheet>;
    async fn replace_worksheet_securities(
        &self,
        worksheet_id: &str,
        securities: &[String],
    ) -> anyhow::Result<TerminalWorksheet>;
    async fn append_worksheet_securities(
        &self,
        worksheet_id: &str,
        securities: &[String],
    ) -> anyhow::Result<TerminalWorksheet>;

    async fn groups(&self) -> anyhow::Result<Vec<TerminalGroup>>;
    async fn group(&self, name: &str) -> anyhow::Result<Option<TerminalGroup>>;
    async fn set_group_context(&self, write: &ContextWrite) -> anyhow::Result<()>;

    /// Ask the terminal to start pushing group/context changes.
    async fn enable_group_events(&self) -> anyhow::Result<()>;
    async fn open_security_lookup(&self) -> anyhow::Result<Arc<dyn SecurityLookup>>;

    fn subscribe_events(&self) -> broadcast::Receiver<TerminalEvent>;
}

/// Stand-in used when no terminal SDK is linked; it never registers.
pub struct UnavailableTerminal {
    events: broadcast::Sender<TerminalEvent>,
}

impl UnavailableTerminal {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

impl Default for UnavailableTerminal {
    fn default() -> Self {
        Self::new()
    }
}

fn unavailable<T>() -> anyhow::Result<T> {
    Err(anyhow!("terminal SDK is unavailable"))
}

#[async_trait]
impl TerminalSession for UnavailableTerminal {
    async fn is_registered(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn register(&self) -> anyhow::Result<()> {
        unavailable()
    }

    async fn register_remote(&self, _address: &str) -> anyhow::Result<()> {
        unavailable()
    }

    async fn run_function(&self, _call: FunctionCall) -> anyhow::Result<()> {
        unavailable()
    }

    async fn worksheets(&self) -> anyhow::Result<Vec<TerminalWorksheet>> {
        unavailable()
    }

    async fn create_worksheet(
        &self,
        _name: &str,
        _securities: &[String],
    ) -> anyhow::Result<TerminalWorksheet> {
        unavailable()
    }

    async fn replace_worksheet_securities(
        &self,
        _worksheet_id: &str,
        _securities: &[String],
    ) -> anyhow::Result<TerminalWorksheet> {
        unavailable()
    }

    async fn append_worksheet_securities(
        &self,
        _worksheet_id: &str,
        _securities: &[String],
    ) -> anyhow::Result<TerminalWorksheet> {
        unavailable()
    }

    async fn groups(&self) -> anyhow::Result<Vec<TerminalGroup>> {
        unavailable()
    }

    async fn group(&self, _name: &str) -> anyhow::Result<Option<TerminalGroup>> {
        unavailable()
    }

    async fn set_group_context(&self, _write: &ContextWrite) -> anyhow::Result<()> {
        unavailable()
    }

    async fn enable_group_events(&self) -> anyhow::Result<()> {
        unavailable()
    }

    async fn open_security_lookup(&self) -> anyhow::Result<Arc<dyn SecurityLookup>> {
        unavailable()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TerminalEvent> {
        self.events.subscribe()
    }
}
