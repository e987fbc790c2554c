//! Canonical data model shared by the backends, the facade and both clients.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::WifiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Security {
    #[serde(alias = "open", alias = "OPEN")]
    Open,
    #[serde(rename = "WPA", alias = "wpa")]
    Wpa,
    #[serde(rename = "WPA2", alias = "wpa2", alias = "WPA/WPA2")]
    Wpa2,
    #[serde(rename = "WPA3", alias = "wpa3")]
    Wpa3,
    #[default]
    #[serde(alias = "unknown")]
    Unknown,
}

impl Security {
    pub fn is_open(self) -> bool {
        self == Security::Open
    }

    pub fn is_known(self) -> bool {
        self != Security::Unknown
    }
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Security::Open => "Open",
            Security::Wpa => "WPA",
            Security::Wpa2 => "WPA2",
            Security::Wpa3 => "WPA3",
            Security::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for Security {
    type Err = WifiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" | "none" | "--" => Ok(Security::Open),
            "wpa" | "wpa1" => Ok(Security::Wpa),
            "wpa2" | "wpa/wpa2" => Ok(Security::Wpa2),
            "wpa3" | "sae" => Ok(Security::Wpa3),
            "unknown" => Ok(Security::Unknown),
            other => Err(WifiError::InvalidArgument(format!(
                "unknown security type '{other}' (expected Open, WPA, WPA2 or WPA3)"
            ))),
        }
    }
}

/// One network seen by a scan. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkObservation {
    pub ssid: String,
    /// Percentage 0-100; serialized as `"unknown"` when the backend gave none.
    #[serde(serialize_with = "signal_or_unknown")]
    pub signal_strength: Option<u8>,
    pub security: Security,
    pub in_use: bool,
    /// Whether a saved profile exists; filled in by the manager, not the backends.
    pub saved: bool,
}

fn signal_or_unknown<S: Serializer>(signal: &Option<u8>, serializer: S) -> Result<S::Ok, S::Error> {
    match signal {
        Some(value) => serializer.serialize_u8(*value),
        None => serializer.serialize_str("unknown"),
    }
}

/// Metadata for a network the backend can reconnect to. Never holds the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedNetwork {
    pub ssid: String,
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub has_stored_secret: bool,
    /// Friendly name kept only in the local store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl SavedNetwork {
    pub fn new(ssid: impl Into<String>, security: Security, has_stored_secret: bool) -> Self {
        Self {
            ssid: ssid.into(),
            security,
            has_stored_secret,
            label: None,
        }
    }
}

/// Live association state; `ssid == None` means not connected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CurrentConnection {
    pub ssid: Option<String>,
    pub ip_address: Option<String>,
    pub signal_strength: Option<u8>,
}

impl CurrentConnection {
    pub fn is_connected(&self) -> bool {
        self.ssid.is_some()
    }

    pub fn is_connected_to(&self, ssid: &str) -> bool {
        self.ssid.as_deref() == Some(ssid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingStats {
    pub sent: u32,
    pub received: u32,
    pub min_ms: Option<f64>,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingResult {
    pub success: bool,
    #[serde(rename = "output")]
    pub raw_output: String,
    pub parsed_stats: Option<PingStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsResult {
    pub connectivity: bool,
    pub dns_resolution: bool,
    pub ping_stats: Option<PingStats>,
}

/// Outcome of a whole diagnostics pass as handed to the clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsReport {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<DiagnosticsResult>,
}

/// Why a connect attempt did not end up associated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    AuthFailure,
    NetworkNotFound,
    Timeout,
    Unknown,
}

impl FailureReason {
    pub fn message(self, ssid: &str) -> String {
        match self {
            FailureReason::AuthFailure => format!("Incorrect password for '{ssid}'"),
            FailureReason::NetworkNotFound => format!("Network '{ssid}' is not in range"),
            FailureReason::Timeout => format!("Timed out connecting to '{ssid}'"),
            FailureReason::Unknown => format!("Failed to connect to '{ssid}'"),
        }
    }

    /// The error a caller that wants `Result` semantics should surface.
    pub fn into_error(self, ssid: &str) -> WifiError {
        match self {
            FailureReason::AuthFailure => WifiError::AuthFailure(ssid.to_string()),
            FailureReason::NetworkNotFound => WifiError::NetworkNotFound(ssid.to_string()),
            FailureReason::Timeout | FailureReason::Unknown => WifiError::Backend(self.message(ssid)),
        }
    }
}

/// What a backend reports right after being asked to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Association was requested; the caller confirms it by polling.
    Initiated,
    AlreadyConnected,
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectReport {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<CurrentConnection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationReport {
    pub success: bool,
    pub message: String,
}

impl OperationReport {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting { ssid: String },
    Connected { ssid: String },
    ConnectionFailed { ssid: String, reason: FailureReason },
}

#[derive(Debug, Clone, Copy)]
pub enum StateEvent<'a> {
    ConnectRequested(&'a str),
    Associated(&'a str),
    Failed(&'a str, FailureReason),
    Forgot(&'a str),
    /// A live `current()` query saw this association (or none).
    Observed(Option<&'a str>),
}

impl ConnectionState {
    /// Returns the state reached from `self` on `event`.
    pub fn on(&self, event: StateEvent<'_>) -> ConnectionState {
        use ConnectionState as S;
        use StateEvent as E;

        match (self, event) {
            (_, E::ConnectRequested(ssid)) => S::Connecting { ssid: ssid.to_string() },
            (S::Connecting { ssid }, E::Associated(s)) if ssid == s => {
                S::Connected { ssid: s.to_string() }
            }
            (S::Connecting { ssid }, E::Failed(s, reason)) if ssid == s => S::ConnectionFailed {
                ssid: s.to_string(),
                reason,
            },
            (S::Connected { ssid }, E::Forgot(s)) if ssid == s => S::Disconnected,
            // The pending connect decides the outcome.
            (S::Connecting { .. }, E::Observed(_)) => self.clone(),
            (S::Connected { .. }, E::Observed(None)) => S::Disconnected,
            (S::Connected { ssid }, E::Observed(Some(s))) if ssid != s => {
                S::Connected { ssid: s.to_string() }
            }
            (S::Disconnected | S::ConnectionFailed { .. }, E::Observed(Some(s))) => {
                S::Connected { ssid: s.to_string() }
            }
            _ => self.clone(),
        }
    }
}
