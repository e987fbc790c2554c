#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use wifi_manager::{
    BackendKind, CommandExecutor, CommandOutput, ConnectOutcome, CredentialStore,
    CurrentConnection, FailureReason, NetworkBackend, NetworkObservation, Result, SavedNetwork,
    Security, Settings, WifiError, WifiManager,
};

/// In-memory backend standing in for NetworkManager.
#[derive(Default)]
pub struct FakeBackend {
    pub visible: Mutex<Vec<NetworkObservation>>,
    pub saved: Mutex<Vec<SavedNetwork>>,
    pub connected: Mutex<Option<String>>,
    /// When set, every connect attempt fails this way after creating a profile.
    pub fail_with: Mutex<Option<FailureReason>>,
    /// When true, connects are accepted but never associate.
    pub never_associates: Mutex<bool>,
    /// What the backend says about a connect that never associated.
    pub explains_failure: Mutex<Option<FailureReason>>,
    /// Pauses the next `list_saved` after it has read the profiles:
    /// `.0` is notified once paused, `.1` releases it.
    pub hold_next_list: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_visible(self, networks: Vec<NetworkObservation>) -> Self {
        *self.visible.lock().unwrap() = networks;
        self
    }

    pub fn with_saved(self, networks: Vec<SavedNetwork>) -> Self {
        *self.saved.lock().unwrap() = networks;
        self
    }

    pub fn failing(self, reason: FailureReason) -> Self {
        *self.fail_with.lock().unwrap() = Some(reason);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    pub fn has_profile(&self, ssid: &str) -> bool {
        self.saved.lock().unwrap().iter().any(|n| n.ssid == ssid)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn upsert_profile(&self, entry: SavedNetwork) {
        let mut saved = self.saved.lock().unwrap();
        saved.retain(|n| n.ssid != entry.ssid);
        saved.push(entry);
    }
}

#[async_trait]
impl NetworkBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::NetworkManager
    }

    async fn scan(&self) -> Result<Vec<NetworkObservation>> {
        self.record("scan".into());
        Ok(self.visible.lock().unwrap().clone())
    }

    async fn list_saved(&self) -> Result<Vec<SavedNetwork>> {
        let snapshot = self.saved.lock().unwrap().clone();
        let hold = self.hold_next_list.lock().unwrap().take();
        if let Some((paused, release)) = hold {
            paused.notify_one();
            release.notified().await;
        }
        Ok(snapshot)
    }

    async fn current(&self) -> Result<CurrentConnection> {
        let ssid = self.connected.lock().unwrap().clone();
        let connected = ssid.is_some();
        Ok(CurrentConnection {
            ssid,
            ip_address: connected.then(|| "192.168.4.20".to_string()),
            signal_strength: connected.then_some(70),
        })
    }

    async fn connect(
        &self,
        ssid: &str,
        secret: Option<&str>,
        security: Security,
    ) -> Result<ConnectOutcome> {
        self.record(format!("connect {ssid}"));
        if secret.is_none() && !security.is_open() {
            return Err(WifiError::SecretRequired(ssid.to_string()));
        }
        if self.connected.lock().unwrap().as_deref() == Some(ssid) {
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        self.upsert_profile(SavedNetwork::new(ssid, security, secret.is_some()));

        if let Some(reason) = *self.fail_with.lock().unwrap() {
            return Ok(ConnectOutcome::Failed(reason));
        }
        if !*self.never_associates.lock().unwrap() {
            *self.connected.lock().unwrap() = Some(ssid.to_string());
        }
        Ok(ConnectOutcome::Initiated)
    }

    async fn activate_saved(&self, ssid: &str) -> Result<ConnectOutcome> {
        self.record(format!("activate {ssid}"));
        if !self.has_profile(ssid) {
            return Ok(ConnectOutcome::Failed(FailureReason::NetworkNotFound));
        }
        *self.connected.lock().unwrap() = Some(ssid.to_string());
        Ok(ConnectOutcome::Initiated)
    }

    async fn save(&self, ssid: &str, secret: Option<&str>, security: Security) -> Result<bool> {
        self.record(format!("save {ssid}"));
        if secret.is_none() && !security.is_open() {
            return Err(WifiError::SecretRequired(ssid.to_string()));
        }
        let added = !self.has_profile(ssid);
        self.upsert_profile(SavedNetwork::new(
            ssid,
            security,
            secret.is_some() && !security.is_open(),
        ));
        Ok(added)
    }

    async fn failure_reason(&self, _ssid: &str) -> Option<FailureReason> {
        *self.explains_failure.lock().unwrap()
    }

    async fn forget(&self, ssid: &str) -> Result<bool> {
        self.record(format!("forget {ssid}"));
        let mut saved = self.saved.lock().unwrap();
        let before = saved.len();
        saved.retain(|n| n.ssid != ssid);
        Ok(saved.len() != before)
    }

    async fn disconnect(&self) -> Result<()> {
        self.record("disconnect".into());
        *self.connected.lock().unwrap() = None;
        Ok(())
    }
}

/// Executor for a host with no networking tools installed.
pub struct NoTools;

#[async_trait]
impl CommandExecutor for NoTools {
    async fn run(&self, program: &str, _args: &[&str], _timeout: Duration) -> Result<CommandOutput> {
        Err(WifiError::ExecutableNotFound(program.to_string()))
    }
}

pub fn observation(ssid: &str, signal: u8, security: Security) -> NetworkObservation {
    NetworkObservation {
        ssid: ssid.to_string(),
        signal_strength: Some(signal),
        security,
        in_use: false,
        saved: false,
    }
}

pub fn test_settings(dir: &TempDir) -> Settings {
    Settings {
        interface: Some("wlan0".into()),
        store_path: Some(dir.path().join("networks.toml")),
        connect_poll_attempts: 3,
        connect_poll_interval_ms: 1,
        ..Settings::default()
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub backend: Arc<FakeBackend>,
    pub manager: Arc<WifiManager>,
}

impl Harness {
    pub fn new(backend: FakeBackend) -> Self {
        Self::with_settings(backend, |_| {})
    }

    pub fn with_settings(backend: FakeBackend, adjust: impl FnOnce(&mut Settings)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(&dir);
        adjust(&mut settings);

        let backend = Arc::new(backend);
        let store = CredentialStore::open(settings.store_path().unwrap()).unwrap();
        let manager = WifiManager::new(
            Arc::new(NoTools),
            Some(backend.clone() as Arc<dyn NetworkBackend>),
            store,
            settings,
        );

        Self {
            dir,
            backend,
            manager: Arc::new(manager),
        }
    }

    /// A manager whose backend probe always fails.
    pub fn unavailable() -> (TempDir, Arc<WifiManager>) {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(&dir);
        let store = CredentialStore::open(settings.store_path().unwrap()).unwrap();
        let manager = WifiManager::new(Arc::new(NoTools), None, store, settings);
        (dir, Arc::new(manager))
    }

    pub fn store_path(&self) -> std::path::PathBuf {
        self.dir.path().join("networks.toml")
    }
}
