use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{RpcResponse, CONNECTION_STATUS_TOPIC, CONNECT_TOPIC, RUN_TERMINAL_FUNCTION_TOPIC},
};
use terminal_integration::{ContextWrite, FunctionCall, TerminalSession, TerminalWorksheet};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    bus::Responder,
    render::{render_group, render_groups, render_worksheet},
    state::ConnectionHub,
    throttle::{ContextThrottle, ThrottleOutcome},
    validation::{
        identifier_arg, is_present, optional_string_arg, panel_arg, securities_arg, string_arg,
        validate, TerminalFunction, ValidationError,
    },
};

pub const NO_FUNCTION_MESSAGE: &str = "No function specified";
pub const NOT_REGISTERED_MESSAGE: &str = "Terminal is not registered";
pub const REMOTE_LOOKUP_MESSAGE: &str = "Security lookup is not supported in remote mode";
pub const LOOKUP_UNAVAILABLE_MESSAGE: &str = "Security lookup is not initialized";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    NotReady(String),
    #[error("{0}")]
    Unsupported(String),
    #[error(transparent)]
    Terminal(#[from] anyhow::Error),
}

impl DispatchError {
    fn into_api_error(self, function: TerminalFunction) -> ApiError {
        match self {
            Self::Invalid(err) => ApiError::validation(err.to_string()),
            Self::NotFound(message) => ApiError::not_found(message),
            Self::NotReady(message) => ApiError::new(ErrorCode::NotRegistered, message),
            Self::Unsupported(message) => ApiError::new(ErrorCode::Unsupported, message),
            Self::Terminal(err) => ApiError::new(
                ErrorCode::Internal,
                format!("Error running {}: {err:#}", function.name()),
            ),
        }
    }
}

type Payload = Map<String, Value>;

fn payload(key: &str, value: impl Serialize) -> Result<Payload, DispatchError> {
    let value = serde_json::to_value(value).map_err(anyhow::Error::from)?;
    let mut payload = Payload::new();
    payload.insert(key.to_string(), value);
    Ok(payload)
}

/// Linear, case-exact scan; the first match wins.
pub fn find_worksheet_by_name(
    worksheets: Vec<TerminalWorksheet>,
    name: &str,
) -> Option<TerminalWorksheet> {
    worksheets.into_iter().find(|worksheet| worksheet.name == name)
}

pub struct CommandDispatcher {
    hub: Arc<ConnectionHub>,
    terminal: Arc<dyn TerminalSession>,
    throttle: ContextThrottle,
    wake_monitor: Arc<Notify>,
}

impl CommandDispatcher {
    pub fn new(
        hub: Arc<ConnectionHub>,
        terminal: Arc<dyn TerminalSession>,
        throttle: ContextThrottle,
        wake_monitor: Arc<Notify>,
    ) -> Self {
        Self {
            hub,
            terminal,
            throttle,
            wake_monitor,
        }
    }

    pub fn throttle(&self) -> &ContextThrottle {
        &self.throttle
    }

    /// `connect` topic: `{connect: bool}` toggles connectivity.
    pub async fn connect(&self, body: &Value) -> RpcResponse {
        let enabled = match body.get("connect") {
            Some(Value::Bool(enabled)) => *enabled,
            None | Some(Value::Null) => {
                return RpcResponse::failure(ValidationError::MissingField("connect").to_string())
            }
            Some(_) => {
                return RpcResponse::failure(
                    ValidationError::InvalidField {
                        field: "connect",
                        reason: "expected a boolean".into(),
                    }
                    .to_string(),
                )
            }
        };
        self.hub.set_enabled(enabled).await;
        self.wake_monitor.notify_one();
        info!(enabled, "dispatch: connectivity toggled");
        RpcResponse::ok_message(if enabled {
            "Connection enabled"
        } else {
            "Connection disabled"
        })
    }

    /// `connection_status` topic.
    pub async fn connection_status(&self) -> RpcResponse {
        let status = self.hub.snapshot().await.status();
        match serde_json::to_value(status) {
            Ok(Value::Object(fields)) => RpcResponse::ok_with(fields),
            Ok(_) | Err(_) => RpcResponse::failure("Failed to render connection status"),
        }
    }

    /// `run_terminal_function` topic: `{function, ...args}`.
    pub async fn run_terminal_function(&self, body: &Value) -> RpcResponse {
        let request_id = Uuid::new_v4();
        let empty = Payload::new();
        let args = body.as_object().unwrap_or(&empty);

        let name = match args.get("function") {
            None | Some(Value::Null) => "",
            Some(Value::String(name)) => name.trim(),
            Some(_) => {
                return RpcResponse::failure(
                    ValidationError::InvalidField {
                        field: "function",
                        reason: "expected a string".into(),
                    }
                    .to_string(),
                )
            }
        };
        if name.is_empty() {
            debug!(%request_id, "dispatch: request without function");
            return RpcResponse::failure(NO_FUNCTION_MESSAGE);
        }
        let Some(function) = TerminalFunction::from_name(name) else {
            debug!(%request_id, function = name, "dispatch: unknown function");
            return RpcResponse::failure(format!("Unknown function: {name}"));
        };

        if !self.hub.snapshot().await.registered {
            debug!(%request_id, function = name, "dispatch: rejected while unregistered");
            return RpcResponse::failure(NOT_REGISTERED_MESSAGE);
        }

        if let Some(err) = validate(function, args).into_iter().next() {
            debug!(%request_id, function = name, %err, "dispatch: validation failed");
            return RpcResponse::failure(err.to_string());
        }

        match self.execute(function, args).await {
            Ok(payload) => {
                debug!(%request_id, function = name, "dispatch: completed");
                RpcResponse::ok_with(payload)
            }
            Err(err) => {
                let error = err.into_api_error(function);
                warn!(
                    %request_id,
                    function = name,
                    code = error.code.as_str(),
                    message = %error.message,
                    "dispatch: function failed"
                );
                RpcResponse::from(error)
            }
        }
    }

    async fn execute(
        &self,
        function: TerminalFunction,
        args: &Payload,
    ) -> Result<Payload, DispatchError> {
        match function {
            TerminalFunction::RunFunction => {
                let securities = if is_present(args, "securities") {
                    securities_arg(args, "securities")?
                } else {
                    Vec::new()
                };
                let call = FunctionCall {
                    mnemonic: string_arg(args, "mnemonic")?.to_string(),
                    panel: panel_arg(args, "panel")?,
                    securities,
                    tail: optional_string_arg(args, "tail")?.map(str::to_string),
                };
                self.terminal.run_function(call).await?;
                Ok(Payload::new())
            }
            TerminalFunction::CreateWorksheet => {
                let name = string_arg(args, "name")?;
                let securities = securities_arg(args, "securities")?;
                let worksheet = self.terminal.create_worksheet(name, &securities).await?;
                payload("worksheet", render_worksheet(&worksheet))
            }
            TerminalFunction::GetWorksheet => {
                let worksheet = self.resolve_worksheet(args).await?;
                payload("worksheet", render_worksheet(&worksheet))
            }
            TerminalFunction::ReplaceWorksheet => {
                let securities = securities_arg(args, "securities")?;
                let target = self.resolve_worksheet(args).await?;
                let worksheet = self
                    .terminal
                    .replace_worksheet_securities(&target.id, &securities)
                    .await?;
                payload("worksheet", render_worksheet(&worksheet))
            }
            TerminalFunction::AppendToWorksheet => {
                let securities = securities_arg(args, "securities")?;
                let target = self.resolve_worksheet(args).await?;
                let worksheet = self
                    .terminal
                    .append_worksheet_securities(&target.id, &securities)
                    .await?;
                payload("worksheet", render_worksheet(&worksheet))
            }
            TerminalFunction::GetAllWorksheets => {
                let worksheets = self.terminal.worksheets().await?;
                let rendered: Vec<_> = worksheets.iter().map(render_worksheet).collect();
                payload("worksheets", rendered)
            }
            TerminalFunction::GetAllGroups => {
                let groups = self.terminal.groups().await?;
                payload("groups", render_groups(&groups))
            }
            TerminalFunction::GetGroupContext => {
                let name = string_arg(args, "name")?;
                let group = self
                    .terminal
                    .group(name)
                    .await?
                    .ok_or_else(|| DispatchError::NotFound(format!("Group not found: {name}")))?;
                payload("group", render_group(&group))
            }
            TerminalFunction::SetGroupContext => {
                let write = ContextWrite {
                    group: string_arg(args, "name")?.to_string(),
                    value: string_arg(args, "value")?.to_string(),
                    cookie: optional_string_arg(args, "cookie")?.map(str::to_string),
                };
                let group = write.group.clone();
                match self.throttle.submit(write).await? {
                    ThrottleOutcome::Applied => debug!(%group, "dispatch: group context applied"),
                    ThrottleOutcome::Deferred { delay } => debug!(
                        %group,
                        delay_ms = delay.as_millis() as u64,
                        "dispatch: group context deferred"
                    ),
                }
                Ok(Payload::new())
            }
            TerminalFunction::SecurityLookup => {
                let query = string_arg(args, "security")?;
                if self.hub.snapshot().await.mode.is_remote() {
                    return Err(DispatchError::Unsupported(REMOTE_LOOKUP_MESSAGE.into()));
                }
                let lookup = self
                    .hub
                    .lookup()
                    .await
                    .ok_or_else(|| DispatchError::NotReady(LOOKUP_UNAVAILABLE_MESSAGE.into()))?;
                let results = lookup.search(query).await?;
                payload("results", results)
            }
        }
    }

    /// `id` wins over `name` when both are supplied.
    async fn resolve_worksheet(&self, args: &Payload) -> Result<TerminalWorksheet, DispatchError> {
        let worksheets = self.terminal.worksheets().await?;
        if let Some(id) = identifier_arg(args, "id")? {
            return worksheets
                .into_iter()
                .find(|worksheet| worksheet.id == id)
                .ok_or_else(|| DispatchError::NotFound(format!("Worksheet not found: {id}")));
        }
        let name = string_arg(args, "name")?;
        find_worksheet_by_name(worksheets, name)
            .ok_or_else(|| DispatchError::NotFound(format!("Worksheet not found: {name}")))
    }
}

/// The three RPC surfaces the bridge answers on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Connect,
    ConnectionStatus,
    RunTerminalFunction,
}

impl Endpoint {
    pub const ALL: [Self; 3] = [
        Self::Connect,
        Self::ConnectionStatus,
        Self::RunTerminalFunction,
    ];

    pub fn topic(self) -> &'static str {
        match self {
            Self::Connect => CONNECT_TOPIC,
            Self::ConnectionStatus => CONNECTION_STATUS_TOPIC,
            Self::RunTerminalFunction => RUN_TERMINAL_FUNCTION_TOPIC,
        }
    }
}

pub struct EndpointResponder {
    dispatcher: Arc<CommandDispatcher>,
    endpoint: Endpoint,
}

impl EndpointResponder {
    pub fn new(dispatcher: Arc<CommandDispatcher>, endpoint: Endpoint) -> Self {
        Self {
            dispatcher,
            endpoint,
        }
    }
}

#[async_trait]
impl Responder for EndpointResponder {
    async fn respond(&self, body: Value) -> RpcResponse {
        match self.endpoint {
            Endpoint::Connect => self.dispatcher.connect(&body).await,
            Endpoint::ConnectionStatus => self.dispatcher.connection_status().await,
            Endpoint::RunTerminalFunction => self.dispatcher.run_terminal_function(&body).await,
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
