//! IPC protocol types and validation for hero-watch-daemon.
//!
//! Shared by the daemon and `hero-watch-ctl` so the control surface cannot
//! drift. The daemon stays the authority on validation; clients reuse the
//! same types to build valid requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;
pub const SOCKET_NAME: &str = "watch.sock";
pub const MAX_DRIVER_ID_LEN: usize = 256;
pub const ERROR_TOO_MANY_CONNECTIONS: &str = "too_many_connections";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    /// Re-enter Started on a live instance, as a duplicate platform start does.
    Start,
    SetSessionIdentifier,
    Silence,
    VolumeKey,
    SetForeground,
    TaskRemoved,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Why a relaunch of the resident process was requested.
///
/// Every reason is handled identically by the receiver; the value is kept
/// for logging and for keying platform alarms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    Boot,
    Reboot,
    PackageReplaced,
    RestartService,
    BackupRestart,
    ImmediateRestart,
    AggressiveRestart,
}

impl RestartReason {
    pub const ALL: [RestartReason; 7] = [
        RestartReason::Boot,
        RestartReason::Reboot,
        RestartReason::PackageReplaced,
        RestartReason::RestartService,
        RestartReason::BackupRestart,
        RestartReason::ImmediateRestart,
        RestartReason::AggressiveRestart,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RestartReason::Boot => "boot",
            RestartReason::Reboot => "reboot",
            RestartReason::PackageReplaced => "package_replaced",
            RestartReason::RestartService => "restart_service",
            RestartReason::BackupRestart => "backup_restart",
            RestartReason::ImmediateRestart => "immediate_restart",
            RestartReason::AggressiveRestart => "aggressive_restart",
        }
    }
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestartReason {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        RestartReason::ALL
            .into_iter()
            .find(|reason| reason.as_str() == normalized)
            .ok_or_else(|| format!("unknown restart reason: {}", value))
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SessionIdentifierParams {
    pub driver_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ForegroundParams {
    pub foreground: bool,
}

pub fn parse_session_identifier(params: Value) -> Result<SessionIdentifierParams, ErrorInfo> {
    let parsed: SessionIdentifierParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("session identifier payload is invalid: {}", err),
        )
    })?;

    let trimmed = parsed.driver_id.trim();
    if trimmed.is_empty() {
        return Err(ErrorInfo::new("missing_field", "driver_id is required"));
    }
    if trimmed.len() > MAX_DRIVER_ID_LEN {
        return Err(ErrorInfo::new(
            "invalid_driver_id",
            format!("driver_id must be {} characters or fewer", MAX_DRIVER_ID_LEN),
        ));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(ErrorInfo::new(
            "invalid_driver_id",
            "driver_id must not contain control characters",
        ));
    }

    Ok(SessionIdentifierParams {
        driver_id: trimmed.to_string(),
    })
}

pub fn parse_foreground(params: Value) -> Result<ForegroundParams, ErrorInfo> {
    serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("foreground payload is invalid: {}", err),
        )
    })
}
