//! Wi-Fi management for a single embedded host.
//!
//! Scans for networks, connects and forgets them, keeps a durable record of
//! saved networks and runs connectivity diagnostics. NetworkManager (`nmcli`)
//! is used when its service is running; otherwise the crate falls back to
//! editing `wpa_supplicant.conf` and driving `wpa_cli`.
//!
//! # Modules
//!
//! - [`backend`] - The `NetworkBackend` trait, its two implementations and startup selection
//! - [`config`] - Settings loaded from TOML
//! - [`diagnostics`] - Connectivity, DNS and ping checks with bounded timeouts
//! - [`display`] - Terminal tables for the CLI
//! - [`error`] - Error taxonomy for the library
//! - [`exec`] - The single choke point for running external tools
//! - [`interface`] - Wireless interface discovery
//! - [`manager`] - The facade both clients call, including the connection state machine
//! - [`models`] - Canonical data model
//! - [`parser`] - Pure parsers for `nmcli`, `wpa_cli` and `ping` output
//! - [`server`] - JSON web API
//! - [`store`] - Saved-network metadata with atomic on-disk updates
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use wifi_manager::{CredentialStore, Security, Settings, SystemExecutor, WifiManager};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let settings = Settings::load(None)?;
//! let store = CredentialStore::open(settings.store_path()?)?;
//! let manager = WifiManager::start(Arc::new(SystemExecutor), store, settings).await;
//!
//! for network in manager.scan().await? {
//!     println!("{} {:?}", network.ssid, network.signal_strength);
//! }
//!
//! let report = manager.connect("Harbor-Net", Some("correct horse"), Security::Wpa2).await?;
//! println!("{}", report.message);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod diagnostics;
pub mod display;
pub mod error;
pub mod exec;
pub mod interface;
pub mod manager;
pub mod models;
pub mod parser;
pub mod server;
pub mod store;

pub use backend::{BackendKind, NetworkBackend};
pub use config::Settings;
pub use error::{Result, WifiError};
pub use exec::{CommandExecutor, CommandOutput, SystemExecutor};
pub use manager::WifiManager;
pub use models::{
    ConnectOutcome, ConnectReport, ConnectionState, CurrentConnection, DiagnosticsReport,
    DiagnosticsResult, FailureReason, NetworkObservation, OperationReport, PingResult, PingStats,
    SavedNetwork, Security,
};
pub use store::CredentialStore;
