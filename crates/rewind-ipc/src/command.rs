//! The closed set of actions a recorder accepts.
//!
//! On the wire an action is a `tool` name plus an optional `args` object.
//! [`Command::parse`] turns that pair into a typed command, separating an
//! unknown tool from known-tool-with-bad-arguments.

use std::path::PathBuf;

use rewind_common::ErrorKind;
use rewind_log::Locator;
use rewind_log::TabId;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPolicy {
    #[default]
    Load,
    DomContentLoaded,
    NetworkIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayOutput {
    #[default]
    Html,
    Image,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigateArgs {
    pub url: String,
    #[serde(default)]
    pub wait: WaitPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorArgs {
    pub selector: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeArgs {
    pub selector: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectArgs {
    pub selector: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadArgs {
    pub selector: String,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateArgs {
    pub expression: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitForArgs {
    pub selector: String,
    #[serde(default)]
    pub state: ElementState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeArgs {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotArgs {
    pub path: PathBuf,
    #[serde(default)]
    pub full_page: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveArgs {
    pub locator: Locator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<TabId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayArgs {
    pub locator: Locator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<TabId>,
    #[serde(default)]
    pub output: ReplayOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Navigate(NavigateArgs),
    Click(SelectorArgs),
    Type(TypeArgs),
    Hover(SelectorArgs),
    Select(SelectArgs),
    Upload(UploadArgs),
    Evaluate(EvaluateArgs),
    WaitFor(WaitForArgs),
    Resize(ResizeArgs),
    Screenshot(ScreenshotArgs),
    SnapshotHtml,
    Close,
    Status,
    Tabs,
    Resolve(ResolveArgs),
    Replay(ReplayArgs),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown tool '{0}'")]
    Unknown(String),

    #[error("Invalid arguments for '{tool}': {message}")]
    InvalidArgs { tool: &'static str, message: String },
}

impl CommandError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommandError::Unknown(_) => ErrorKind::UnknownCommand,
            CommandError::InvalidArgs { .. } => ErrorKind::ProtocolError,
        }
    }
}

impl Command {
    pub const TOOLS: &'static [&'static str] = &[
        "navigate",
        "click",
        "type",
        "hover",
        "select",
        "upload",
        "evaluate",
        "wait_for",
        "resize",
        "screenshot",
        "snapshot_html",
        "close",
        "status",
        "tabs",
        "resolve",
        "replay",
    ];

    pub fn parse(tool: &str, args: Option<Value>) -> Result<Self, CommandError> {
        let command = match tool {
            "navigate" => Command::Navigate(args_as("navigate", args)?),
            "click" => Command::Click(args_as("click", args)?),
            "type" => Command::Type(args_as("type", args)?),
            "hover" => Command::Hover(args_as("hover", args)?),
            "select" => Command::Select(args_as("select", args)?),
            "upload" => Command::Upload(args_as("upload", args)?),
            "evaluate" => Command::Evaluate(args_as("evaluate", args)?),
            "wait_for" => Command::WaitFor(args_as("wait_for", args)?),
            "resize" => Command::Resize(args_as("resize", args)?),
            "screenshot" => Command::Screenshot(args_as("screenshot", args)?),
            "snapshot_html" => Command::SnapshotHtml,
            "close" => Command::Close,
            "status" => Command::Status,
            "tabs" => Command::Tabs,
            "resolve" => Command::Resolve(args_as("resolve", args)?),
            "replay" => Command::Replay(args_as("replay", args)?),
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(command)
    }

    pub fn tool(&self) -> &'static str {
        match self {
            Command::Navigate(_) => "navigate",
            Command::Click(_) => "click",
            Command::Type(_) => "type",
            Command::Hover(_) => "hover",
            Command::Select(_) => "select",
            Command::Upload(_) => "upload",
            Command::Evaluate(_) => "evaluate",
            Command::WaitFor(_) => "wait_for",
            Command::Resize(_) => "resize",
            Command::Screenshot(_) => "screenshot",
            Command::SnapshotHtml => "snapshot_html",
            Command::Close => "close",
            Command::Status => "status",
            Command::Tabs => "tabs",
            Command::Resolve(_) => "resolve",
            Command::Replay(_) => "replay",
        }
    }

    pub fn args(&self) -> Option<Value> {
        let encoded = match self {
            Command::Navigate(a) => serde_json::to_value(a),
            Command::Click(a) | Command::Hover(a) => serde_json::to_value(a),
            Command::Type(a) => serde_json::to_value(a),
            Command::Select(a) => serde_json::to_value(a),
            Command::Upload(a) => serde_json::to_value(a),
            Command::Evaluate(a) => serde_json::to_value(a),
            Command::WaitFor(a) => serde_json::to_value(a),
            Command::Resize(a) => serde_json::to_value(a),
            Command::Screenshot(a) => serde_json::to_value(a),
            Command::Resolve(a) => serde_json::to_value(a),
            Command::Replay(a) => serde_json::to_value(a),
            Command::SnapshotHtml | Command::Close | Command::Status | Command::Tabs => {
                return None
            }
        };
        encoded.ok()
    }

    /// Whether the command is executed by the browser capability rather
    /// than answered from the recording.
    pub fn is_browser_action(&self) -> bool {
        !matches!(
            self,
            Command::Status | Command::Tabs | Command::Resolve(_) | Command::Replay(_)
        )
    }
}

fn args_as<T: DeserializeOwned>(tool: &'static str, args: Option<Value>) -> Result<T, CommandError> {
    let args = match args {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(args) => args,
    };
    serde_json::from_value(args).map_err(|e| CommandError::InvalidArgs {
        tool,
        message: e.to_string(),
    })
}
