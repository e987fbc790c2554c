//! The Wi-Fi manager facade both clients talk to.
//!
//! [`WifiManager`] owns the selected backend, the credential store and the
//! connection state machine. Mutating operations (connect, save, forget,
//! label, diagnostics) are serialized on one lock; reads run concurrently.
//! Syncing the store against the backend's saved list holds a second lock
//! that store writes from mutations also take, so neither overwrites the other.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock as AsyncRwLock};

use crate::backend::{self, BackendKind, NetworkBackend};
use crate::config::Settings;
use crate::diagnostics::Diagnostics;
use crate::error::{Result, WifiError};
use crate::exec::CommandExecutor;
use crate::models::{
    ConnectOutcome, ConnectReport, ConnectionState, CurrentConnection, DiagnosticsReport,
    FailureReason, NetworkObservation, OperationReport, PingResult, SavedNetwork, Security,
    StateEvent,
};
use crate::store::{self, CredentialStore};

pub struct WifiManager {
    exec: Arc<dyn CommandExecutor>,
    settings: Settings,
    backend: AsyncRwLock<Option<Arc<dyn NetworkBackend>>>,
    store: CredentialStore,
    diagnostics: Diagnostics,
    op_lock: Arc<Mutex<()>>,
    sync_lock: Mutex<()>,
    state: RwLock<ConnectionState>,
}

/// Settles the state machine when a connect is abandoned midway.
///
/// Dropping the `connect` future (a closed HTTP request, a caller's timeout)
/// would otherwise leave the state in `Connecting` with nothing to move it on.
struct PendingConnect<'a> {
    manager: &'a WifiManager,
    backend: Arc<dyn NetworkBackend>,
    ssid: String,
    /// The backend had no profile for `ssid` before this attempt.
    new_network: bool,
    op: Option<OwnedMutexGuard<()>>,
    settled: bool,
}

impl PendingConnect<'_> {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        tracing::warn!(ssid = %self.ssid, "Connect abandoned before it finished");
        self.manager
            .transition(StateEvent::Failed(&self.ssid, FailureReason::Timeout));

        if !self.new_network {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let backend = self.backend.clone();
        let ssid = std::mem::take(&mut self.ssid);
        let op = self.op.take();
        runtime.spawn(async move {
            // Other mutations wait until the leftover profile is gone.
            let _op = op;
            if let Err(e) = backend.forget(&ssid).await {
                tracing::debug!(error = %e, "Could not remove profile from abandoned attempt");
            }
        });
    }
}

impl WifiManager {
    /// Builds a manager around an already chosen backend (or none yet).
    pub fn new(
        exec: Arc<dyn CommandExecutor>,
        backend: Option<Arc<dyn NetworkBackend>>,
        store: CredentialStore,
        settings: Settings,
    ) -> Self {
        let diagnostics = Diagnostics::new(exec.clone(), settings.diagnostics.clone());
        Self {
            exec,
            settings,
            backend: AsyncRwLock::new(backend),
            store,
            diagnostics,
            op_lock: Arc::new(Mutex::new(())),
            sync_lock: Mutex::new(()),
            state: RwLock::new(ConnectionState::default()),
        }
    }

    /// Probes for a backend once and reconciles the store against it.
    ///
    /// A host with no running network service still yields a manager; every
    /// operation then fails with [`WifiError::BackendUnavailable`] and
    /// re-probes until the service comes back.
    pub async fn start(
        exec: Arc<dyn CommandExecutor>,
        store: CredentialStore,
        settings: Settings,
    ) -> Self {
        let backend = match backend::select_backend(exec.clone(), &settings).await {
            Ok(backend) => Some(backend),
            Err(e) => {
                tracing::error!(error = %e, "Starting without a network backend");
                None
            }
        };

        let manager = Self::new(exec, backend, store, settings);
        if manager.backend.read().await.is_some() {
            if let Err(e) = manager.list_saved().await {
                tracing::warn!(error = %e, "Initial saved-network sync failed");
            }
        }
        manager
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub async fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.read().await.as_ref().map(|b| b.kind())
    }

    /// The selected backend; re-probes while none is available.
    async fn backend(&self) -> Result<Arc<dyn NetworkBackend>> {
        if let Some(backend) = self.backend.read().await.as_ref() {
            return Ok(backend.clone());
        }

        let mut slot = self.backend.write().await;
        if let Some(backend) = slot.as_ref() {
            return Ok(backend.clone());
        }
        let backend = backend::select_backend(self.exec.clone(), &self.settings).await?;
        tracing::info!(backend = %backend.kind(), "Network backend became available");
        *slot = Some(backend.clone());
        Ok(backend)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transition(&self, event: StateEvent<'_>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let next = state.on(event);
        if next != *state {
            tracing::debug!(from = ?*state, to = ?next, "Connection state changed");
            *state = next;
        }
    }

    fn restore_state(&self, previous: ConnectionState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = previous;
    }

    /// Whether connecting to `ssid` needs a passphrase from the user.
    pub fn needs_secret(&self, ssid: &str, security: Security) -> bool {
        !security.is_open() && !self.store.get(ssid).is_some_and(|n| n.has_stored_secret)
    }

    /// Scans, then lets known scan security overwrite stale saved metadata.
    ///
    /// Each result is marked `saved` when the backend has a profile for it.
    pub async fn scan(&self) -> Result<Vec<NetworkObservation>> {
        let backend = self.backend().await?;
        let mut networks = backend.scan().await?;

        if let Err(e) = self
            .store
            .update_with(|saved| store::refresh_security(saved, &networks))
        {
            tracing::warn!(error = %e, "Could not record refreshed security");
        }

        let known: Vec<String> = match backend.list_saved().await {
            Ok(saved) => saved.into_iter().map(|n| n.ssid).collect(),
            Err(e) => {
                tracing::debug!(error = %e, "Saved list unavailable, marking from the store");
                self.store.load().into_iter().map(|n| n.ssid).collect()
            }
        };
        for network in &mut networks {
            network.saved = known.contains(&network.ssid);
        }
        Ok(networks)
    }

    /// Saved networks as the backend knows them, merged with local metadata.
    pub async fn list_saved(&self) -> Result<Vec<SavedNetwork>> {
        let backend = self.backend().await?;

        let _sync = self.sync_lock.lock().await;
        let remote = backend.list_saved().await?;
        match self.store.update_with(|local| store::reconcile(local, &remote)) {
            Ok(merged) => Ok(merged),
            Err(e) => {
                tracing::warn!(error = %e, "Could not persist reconciled networks");
                Ok(store::reconcile(&self.store.load(), &remote))
            }
        }
    }

    /// Writes `entry` to the store without racing a saved-list sync.
    async fn record(&self, entry: SavedNetwork) -> Result<()> {
        let _sync = self.sync_lock.lock().await;
        self.store.save(entry)
    }

    pub async fn current(&self) -> Result<CurrentConnection> {
        let current = self.backend().await?.current().await?;
        self.transition(StateEvent::Observed(current.ssid.as_deref()));
        Ok(current)
    }

    /// Connects to `ssid` and waits for the association to show up.
    ///
    /// Without a secret, a non-open target is only attempted when the backend
    /// already stores one for it; otherwise this fails with
    /// [`WifiError::SecretRequired`] and nothing changes.
    pub async fn connect(
        &self,
        ssid: &str,
        secret: Option<&str>,
        security: Security,
    ) -> Result<ConnectReport> {
        if ssid.trim().is_empty() {
            return Err(WifiError::InvalidArgument("SSID must not be empty".into()));
        }
        let secret = secret.filter(|s| !s.is_empty());

        let op = self.op_lock.clone().lock_owned().await;
        let backend = self.backend().await?;

        let known = backend.list_saved().await?;
        let known_entry = known.iter().find(|n| n.ssid == ssid);
        let use_saved = secret.is_none() && !security.is_open();
        if use_saved && !known_entry.is_some_and(|n| n.has_stored_secret) {
            return Err(WifiError::SecretRequired(ssid.to_string()));
        }
        // Open networks ignore any passphrase they are given.
        let applies_secret = secret.is_some() && !security.is_open();

        let previous = self.state();
        self.transition(StateEvent::ConnectRequested(ssid));
        let mut pending = PendingConnect {
            manager: self,
            backend: backend.clone(),
            ssid: ssid.to_string(),
            new_network: known_entry.is_none(),
            op: Some(op),
            settled: false,
        };
        tracing::info!(ssid = %ssid, %security, reuse_saved = use_saved, "Connecting");

        let outcome = if use_saved {
            backend.activate_saved(ssid).await
        } else {
            backend.connect(ssid, secret, security).await
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e @ (WifiError::InvalidArgument(_) | WifiError::SecretRequired(_))) => {
                pending.settle();
                self.restore_state(previous);
                return Err(e);
            }
            Err(e) => {
                pending.settle();
                self.transition(StateEvent::Failed(ssid, FailureReason::Unknown));
                return Err(e);
            }
        };

        let already_connected = outcome == ConnectOutcome::AlreadyConnected;
        let result = match outcome {
            ConnectOutcome::AlreadyConnected => Ok(backend.current().await.unwrap_or_else(|_| {
                CurrentConnection {
                    ssid: Some(ssid.to_string()),
                    ..CurrentConnection::default()
                }
            })),
            ConnectOutcome::Initiated => self.await_association(backend.as_ref(), ssid).await,
            ConnectOutcome::Failed(reason) => Err(reason),
        };

        match result {
            Ok(connection) => {
                self.transition(StateEvent::Associated(ssid));
                pending.settle();
                // Nothing new was applied when the backend was already on this network.
                if applies_secret && !already_connected {
                    self.record(SavedNetwork::new(ssid, security, true)).await?;
                }
                tracing::info!(ssid = %ssid, ip = ?connection.ip_address, "Connected");
                Ok(ConnectReport {
                    success: true,
                    message: format!("Connected to '{ssid}'"),
                    reason: None,
                    connection: Some(connection),
                })
            }
            Err(reason) => {
                self.transition(StateEvent::Failed(ssid, reason));
                tracing::warn!(ssid = %ssid, ?reason, "Connection failed");

                if known_entry.is_none() {
                    // The attempt may have left a profile behind for a network we never had.
                    if let Err(e) = backend.forget(ssid).await {
                        tracing::debug!(error = %e, "Could not remove profile from failed attempt");
                    }
                }
                pending.settle();

                Ok(ConnectReport {
                    success: false,
                    message: reason.message(ssid),
                    reason: Some(reason),
                    connection: None,
                })
            }
        }
    }

    /// Polls `current()` with a growing delay until `ssid` is associated.
    async fn await_association(
        &self,
        backend: &dyn NetworkBackend,
        ssid: &str,
    ) -> std::result::Result<CurrentConnection, FailureReason> {
        let attempts = self.settings.connect_poll_attempts.max(1);
        let interval = self.settings.connect_poll_interval();

        for attempt in 1..=attempts {
            match backend.current().await {
                Ok(current) if current.is_connected_to(ssid) => return Ok(current),
                Ok(_) => {}
                Err(e) => tracing::debug!(attempt, error = %e, "Association poll failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(interval * attempt).await;
            }
        }
        Err(backend
            .failure_reason(ssid)
            .await
            .unwrap_or(FailureReason::Timeout))
    }

    /// Stores a network in the backend for later use without connecting to it.
    pub async fn save_network(
        &self,
        ssid: &str,
        secret: Option<&str>,
        security: Security,
    ) -> Result<OperationReport> {
        if ssid.trim().is_empty() {
            return Err(WifiError::InvalidArgument("SSID must not be empty".into()));
        }
        let secret = secret.filter(|s| !s.is_empty());

        let _op = self.op_lock.lock().await;
        let backend = self.backend().await?;
        let added = backend.save(ssid, secret, security).await?;
        let has_secret = secret.is_some() && !security.is_open();
        self.record(SavedNetwork::new(ssid, security, has_secret)).await?;

        if added {
            tracing::info!(ssid = %ssid, "Saved network");
            Ok(OperationReport::ok(format!("Saved network '{ssid}'")))
        } else {
            tracing::info!(ssid = %ssid, "Updated saved network");
            Ok(OperationReport::ok(format!("Updated saved network '{ssid}'")))
        }
    }

    /// Removes `ssid` from the backend and the store, disconnecting first if it is live.
    pub async fn forget(&self, ssid: &str) -> Result<OperationReport> {
        if ssid.trim().is_empty() {
            return Err(WifiError::InvalidArgument("SSID must not be empty".into()));
        }

        let _op = self.op_lock.lock().await;
        let backend = self.backend().await?;

        if backend.current().await?.is_connected_to(ssid) {
            tracing::info!(ssid = %ssid, "Disconnecting before forgetting");
            backend.disconnect().await?;
        }

        let removed_remote = backend.forget(ssid).await?;
        let removed_local = {
            let _sync = self.sync_lock.lock().await;
            self.store.remove(ssid)?
        };
        self.transition(StateEvent::Forgot(ssid));

        if removed_remote || removed_local {
            tracing::info!(ssid = %ssid, "Forgot network");
            Ok(OperationReport::ok(format!("Forgot network '{ssid}'")))
        } else {
            Ok(OperationReport::failed(format!("Network '{ssid}' is not saved")))
        }
    }

    /// Sets or clears the local friendly name of a saved network.
    pub async fn set_label(&self, ssid: &str, label: Option<String>) -> Result<OperationReport> {
        let label = label
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty());

        let _op = self.op_lock.lock().await;
        let mut found = self.store.set_label(ssid, label.clone())?;
        if !found {
            // The backend may know the network even though the store has not caught up yet.
            self.list_saved().await?;
            found = self.store.set_label(ssid, label)?;
        }

        if found {
            Ok(OperationReport::ok(format!("Updated label for '{ssid}'")))
        } else {
            Ok(OperationReport::failed(format!("Network '{ssid}' is not saved")))
        }
    }

    /// Runs a diagnostics pass if there is an association to diagnose.
    pub async fn diagnostics(&self) -> DiagnosticsReport {
        let _op = self.op_lock.lock().await;

        let current = match self.backend().await {
            Ok(backend) => backend.current().await,
            Err(e) => Err(e),
        };
        let current = match current {
            Ok(current) => current,
            Err(e) => {
                return DiagnosticsReport {
                    success: false,
                    message: e.to_string(),
                    results: None,
                };
            }
        };

        if !current.is_connected() {
            return DiagnosticsReport {
                success: false,
                message: "Not connected to any network".to_string(),
                results: None,
            };
        }

        let results = self.diagnostics.run().await;
        DiagnosticsReport {
            success: true,
            message: "Diagnostics completed".to_string(),
            results: Some(results),
        }
    }

    /// Pings `target` (or the configured default) `count` times.
    pub async fn ping(&self, target: Option<&str>, count: Option<u32>) -> Result<PingResult> {
        let defaults = self.diagnostics.settings();
        let target = target
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(defaults.ping_target.as_str());
        let count = count.unwrap_or(defaults.ping_count);
        self.diagnostics.ping(target, count).await
    }
}
