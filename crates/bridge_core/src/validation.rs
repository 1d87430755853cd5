use serde_json::{Map, Value};
use thiserror::Error;

/// Terminal functions reachable through `run_terminal_function`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalFunction {
    RunFunction,
    CreateWorksheet,
    GetWorksheet,
    ReplaceWorksheet,
    AppendToWorksheet,
    GetAllWorksheets,
    GetAllGroups,
    GetGroupContext,
    SetGroupContext,
    SecurityLookup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionSchema {
    /// Every one of these must be present.
    pub required: &'static [&'static str],
    /// At least one of these must be present, when non-empty.
    pub any_of: &'static [&'static str],
}

const WORKSHEET_SELECTOR: &[&str] = &["name", "id"];

impl TerminalFunction {
    pub const ALL: [Self; 10] = [
        Self::RunFunction,
        Self::CreateWorksheet,
        Self::GetWorksheet,
        Self::ReplaceWorksheet,
        Self::AppendToWorksheet,
        Self::GetAllWorksheets,
        Self::GetAllGroups,
        Self::GetGroupContext,
        Self::SetGroupContext,
        Self::SecurityLookup,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::RunFunction => "RunFunction",
            Self::CreateWorksheet => "CreateWorksheet",
            Self::GetWorksheet => "GetWorksheet",
            Self::ReplaceWorksheet => "ReplaceWorksheet",
            Self::AppendToWorksheet => "AppendToWorksheet",
            Self::GetAllWorksheets => "GetAllWorksheets",
            Self::GetAllGroups => "GetAllGroups",
            Self::GetGroupContext => "GetGroupContext",
            Self::SetGroupContext => "SetGroupContext",
            Self::SecurityLookup => "SecurityLookup",
        }
    }

    /// Case-exact match on the wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|function| function.name() == name)
    }

    pub fn schema(self) -> FunctionSchema {
        let (required, any_of): (&'static [&'static str], &'static [&'static str]) = match self {
            Self::RunFunction => (&["mnemonic", "panel"], &[]),
            Self::CreateWorksheet => (&["securities", "name"], &[]),
            Self::GetWorksheet => (&[], WORKSHEET_SELECTOR),
            Self::ReplaceWorksheet | Self::AppendToWorksheet => (&["securities"], WORKSHEET_SELECTOR),
            Self::GetAllWorksheets | Self::GetAllGroups => (&[], &[]),
            Self::GetGroupContext => (&["name"], &[]),
            Self::SetGroupContext => (&["name", "value"], &[]),
            Self::SecurityLookup => (&["security"], &[]),
        };
        FunctionSchema { required, any_of }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("At least one of the following fields is required: {}", .0.join(", "))]
    MissingAnyOf(&'static [&'static str]),
    #[error("Invalid value for field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ValidationError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Absent, null and empty-string fields all count as missing.
pub fn is_present(args: &Map<String, Value>, field: &str) -> bool {
    match args.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Checks `args` against the function's schema. Errors come back in
/// schema order: required fields first, then the any-of set.
pub fn validate(function: TerminalFunction, args: &Map<String, Value>) -> Vec<ValidationError> {
    let schema = function.schema();
    let mut errors: Vec<ValidationError> = schema
        .required
        .iter()
        .filter(|field| !is_present(args, field))
        .map(|field| ValidationError::MissingField(*field))
        .collect();
    if !schema.any_of.is_empty() && !schema.any_of.iter().any(|field| is_present(args, field)) {
        errors.push(ValidationError::MissingAnyOf(schema.any_of));
    }
    errors
}

pub fn string_arg<'a>(
    args: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ValidationError> {
    match args.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.as_str()),
        Some(Value::String(_)) | Some(Value::Null) | None => {
            Err(ValidationError::MissingField(field))
        }
        Some(_) => Err(ValidationError::invalid(field, "expected a string")),
    }
}

pub fn optional_string_arg<'a>(
    args: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a str>, ValidationError> {
    if !is_present(args, field) {
        return Ok(None);
    }
    string_arg(args, field).map(Some)
}

/// Worksheet ids arrive as strings or bare numbers.
pub fn identifier_arg(
    args: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, ValidationError> {
    match args.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::String(_)) | Some(Value::Null) | None => Ok(None),
        Some(_) => Err(ValidationError::invalid(field, "expected a string or number")),
    }
}

pub fn securities_arg(
    args: &Map<String, Value>,
    field: &'static str,
) -> Result<Vec<String>, ValidationError> {
    let Some(Value::Array(items)) = args.get(field) else {
        return match args.get(field) {
            None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
            Some(_) => Err(ValidationError::invalid(field, "expected an array of strings")),
        };
    };
    items
        .iter()
        .map(|item| match item {
            Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            _ => Err(ValidationError::invalid(
                field,
                "expected an array of non-empty strings",
            )),
        })
        .collect()
}

pub const PANEL_COUNT: u8 = 4;

/// Launchpad panel number, 1 to [`PANEL_COUNT`].
pub fn panel_arg(args: &Map<String, Value>, field: &'static str) -> Result<u8, ValidationError> {
    let parsed = match args.get(field) {
        None | Some(Value::Null) => return Err(ValidationError::MissingField(field)),
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(_) => None,
    };
    parsed
        .filter(|panel| (1..=u64::from(PANEL_COUNT)).contains(panel))
        .map(|panel| panel as u8)
        .ok_or_else(|| {
            ValidationError::invalid(field, format!("expected a panel number 1-{PANEL_COUNT}"))
        })
}
