//! Connection Manager
//!
//! Owns one adapter connection: opening the transport, running the driver
//! handshake, tracking the diagnostic state machine and reconnecting with
//! a bounded backoff. Operations never reconnect implicitly.

use crate::error::ConnectionError;
use crate::state::{Activity, DiagnosticState, StateTransition};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use obd_protocol::{
    ClientConfig, DriverMetrics, MetricsHandle, ObdClient, ObdError, ObdProtocol, Transport, TransportConfig,
    TransportError, TransportKind,
};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default bound on transport open plus handshake
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// How to reach the adapter and what to tell it
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub transport: TransportConfig,
    pub vehicle_make: Option<String>,
    pub model: Option<String>,
    /// Bound on transport open plus handshake
    pub timeout: Duration,
    pub client: ClientConfig,
    /// Reconnect even when already ready
    pub force: bool,
}

impl ConnectOptions {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            vehicle_make: None,
            model: None,
            timeout: DEFAULT_CONNECT_TIMEOUT,
            client: ClientConfig::default(),
            force: false,
        }
    }

    pub fn with_vehicle(mut self, make: impl Into<String>, model: Option<String>) -> Self {
        self.vehicle_make = Some(make.into());
        self.model = model;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_client(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    pub fn with_can_fd(mut self, enabled: bool) -> Self {
        self.client.can_fd_enabled = enabled;
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Bounded exponential backoff for [`ConnectionManager::reconnect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl ReconnectPolicy {
    /// Delay after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Immutable view of a connection at one point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    pub state: DiagnosticState,
    pub transport: Option<TransportKind>,
    pub identity: Option<String>,
    pub bluetooth_name: Option<String>,
    pub protocol: Option<ObdProtocol>,
    pub can_fd_enabled: bool,
    pub vehicle_make: Option<String>,
    pub model: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub metrics: Option<DriverMetrics>,
}

struct Inner {
    state: DiagnosticState,
    options: Option<ConnectOptions>,
    transport: Option<TransportKind>,
    identity: Option<String>,
    bluetooth_name: Option<String>,
    protocol: Option<ObdProtocol>,
    last_connected_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    reconnect_attempts: u32,
    metrics: Option<MetricsHandle>,
    subscribers: Vec<mpsc::UnboundedSender<StateTransition>>,
}

impl Inner {
    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            transport: self.transport,
            identity: self.identity.clone(),
            bluetooth_name: self.bluetooth_name.clone(),
            protocol: self.protocol,
            can_fd_enabled: self.options.as_ref().is_some_and(|o| o.client.can_fd_enabled),
            vehicle_make: self.options.as_ref().and_then(|o| o.vehicle_make.clone()),
            model: self.options.as_ref().and_then(|o| o.model.clone()),
            last_connected_at: self.last_connected_at,
            last_error: self.last_error.clone(),
            reconnect_attempts: self.reconnect_attempts,
            metrics: self
                .metrics
                .as_ref()
                .map(|m| m.read().unwrap_or_else(|e| e.into_inner()).clone()),
        }
    }

    fn transition(&mut self, to: DiagnosticState, reason: &str) {
        let from = self.state;
        if from == to {
            return;
        }
        if !from.can_transition(to) {
            warn!("Ignoring invalid state transition {} -> {} ({})", from, to, reason);
            return;
        }
        info!("Adapter state {} -> {} ({})", from, to, reason);
        self.state = to;
        let event = StateTransition {
            from,
            to,
            reason: reason.to_string(),
            reconnect_attempts: self.reconnect_attempts,
            at: Utc::now(),
        };
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Lifecycle owner of one adapter connection
pub struct ConnectionManager {
    inner: Mutex<Inner>,
    driver: tokio::sync::Mutex<Option<ObdClient>>,
    policy: ReconnectPolicy,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: DiagnosticState::Disconnected,
                options: None,
                transport: None,
                identity: None,
                bluetooth_name: None,
                protocol: None,
                last_connected_at: None,
                last_error: None,
                reconnect_attempts: 0,
                metrics: None,
                subscribers: Vec::new(),
            }),
            driver: tokio::sync::Mutex::new(None),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the transport and run the handshake.
    ///
    /// Returns the current snapshot without touching the adapter when already
    /// ready, unless `options.force` is set.
    pub async fn connect(&self, options: ConnectOptions) -> Result<ConnectionSnapshot, ConnectionError> {
        self.establish(options, true).await
    }

    async fn establish(&self, options: ConnectOptions, fresh: bool) -> Result<ConnectionSnapshot, ConnectionError> {
        let reason = if fresh { "connect" } else { "reconnect" };
        {
            let mut inner = self.lock();
            if inner.state.is_connecting() || inner.state.is_busy() {
                return Err(ConnectionError::InvalidState {
                    state: inner.state,
                    action: reason,
                });
            }
            if fresh && inner.state == DiagnosticState::Ready && !options.force {
                debug!("Already connected, skipping handshake");
                return Ok(inner.snapshot());
            }
            if fresh {
                inner.reconnect_attempts = 0;
            }
            inner.options = Some(options.clone());
            inner.transition(DiagnosticState::Connecting, reason);
        }

        let mut driver = self.driver.lock().await;
        if let Some(mut old) = driver.take() {
            old.disconnect().await;
        }

        match self.handshake(&options).await {
            Ok(client) => {
                let snapshot = {
                    let mut inner = self.lock();
                    inner.transport = Some(client.transport_kind());
                    inner.identity = client.identity().map(str::to_string);
                    inner.bluetooth_name = client.device_name();
                    inner.protocol = client.protocol();
                    inner.last_connected_at = Some(Utc::now());
                    inner.metrics = Some(client.metrics_handle());
                    inner.transition(DiagnosticState::Ready, "handshake complete");
                    inner.snapshot()
                };
                *driver = Some(client);
                Ok(snapshot)
            }
            Err(e) => {
                warn!("Adapter {} failed: {}", reason, e);
                let mut inner = self.lock();
                inner.last_error = Some(e.to_string());
                inner.transition(DiagnosticState::Error, &e.to_string());
                Err(ConnectionError::Connect(e))
            }
        }
    }

    async fn handshake(&self, options: &ConnectOptions) -> Result<ObdClient, ObdError> {
        let transport = Transport::from_config(&options.transport)?;
        let mut client = ObdClient::new(transport, options.client.clone());

        let result = tokio::time::timeout(options.timeout, async {
            client.open().await?;
            self.lock()
                .transition(DiagnosticState::Authenticating, "transport open");
            client.initialize().await
        })
        .await;

        match result {
            Ok(Ok(_)) => Ok(client),
            Ok(Err(e)) => {
                client.disconnect().await;
                Err(e)
            }
            Err(_) => {
                client.disconnect().await;
                Err(TransportError::ConnectTimeout(options.timeout.as_millis() as u64).into())
            }
        }
    }

    /// Tear down the link. The adapter identity goes with it; the last
    /// error and connect options are kept.
    pub async fn disconnect(&self) {
        let mut driver = self.driver.lock().await;
        if let Some(mut client) = driver.take() {
            client.disconnect().await;
        }
        let mut inner = self.lock();
        inner.transport = None;
        inner.identity = None;
        inner.bluetooth_name = None;
        inner.protocol = None;
        inner.metrics = None;
        inner.transition(DiagnosticState::Disconnected, "disconnect");
    }

    /// Reconnect with the last used options, backing off between attempts
    pub async fn reconnect(&self) -> Result<ConnectionSnapshot, ConnectionError> {
        let options = {
            let inner = self.lock();
            if inner.state.is_connecting() || inner.state.is_busy() {
                return Err(ConnectionError::InvalidState {
                    state: inner.state,
                    action: "reconnect",
                });
            }
            inner.options.clone().ok_or(ConnectionError::InvalidState {
                state: inner.state,
                action: "reconnect before any connect",
            })?
        };

        let mut last = String::new();
        for attempt in 1..=self.policy.max_attempts {
            self.lock().reconnect_attempts += 1;
            info!("Reconnect attempt {}/{}", attempt, self.policy.max_attempts);
            match self.establish(options.clone(), false).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => last = e.to_string(),
            }
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.delay_for(attempt)).await;
            }
        }
        Err(ConnectionError::ReconnectExhausted {
            attempts: self.policy.max_attempts,
            last,
        })
    }

    /// Run `f` against the driver. Fails fast unless a driver is attached;
    /// a transport failure moves the state to `error`.
    pub async fn with_driver<T, F>(&self, f: F) -> Result<T, ConnectionError>
    where
        F: for<'c> FnOnce(&'c mut ObdClient) -> BoxFuture<'c, Result<T, ObdError>>,
    {
        let state = self.state();
        if !state.has_driver() {
            return Err(ConnectionError::NotConnected { state });
        }

        let mut guard = self.driver.lock().await;
        let Some(client) = guard.as_mut() else {
            return Err(ConnectionError::NotConnected { state: self.state() });
        };
        let result = f(client).await;
        let link_lost = client.link_lost();
        drop(guard);

        result.map_err(|e| {
            if e.is_transport() || link_lost {
                self.mark_lost(&e);
            }
            ConnectionError::Driver(e)
        })
    }

    fn mark_lost(&self, err: &ObdError) {
        let mut inner = self.lock();
        inner.last_error = Some(err.to_string());
        if inner.state.has_driver() {
            inner.transition(DiagnosticState::Error, &format!("adapter lost: {}", err));
        }
    }

    /// Move from `ready` into the operation's state
    pub fn begin_operation(&self, activity: Activity, reason: &str) -> Result<(), ConnectionError> {
        let mut inner = self.lock();
        match inner.state {
            DiagnosticState::Ready => {
                inner.transition(activity.state(), reason);
                Ok(())
            }
            state if state.is_busy() => Err(ConnectionError::InvalidState {
                state,
                action: "start an operation",
            }),
            state => Err(ConnectionError::NotConnected { state }),
        }
    }

    /// Return to `ready` unless the operation lost the adapter
    pub fn end_operation(&self, reason: &str) {
        let mut inner = self.lock();
        if inner.state.is_busy() {
            inner.transition(DiagnosticState::Ready, reason);
        }
    }

    /// Record a failure without changing state
    pub fn record_error(&self, message: impl Into<String>) {
        self.lock().last_error = Some(message.into());
    }

    /// Clear the current error pointer, returning what it held
    pub fn acknowledge_error(&self) -> Option<String> {
        self.lock().last_error.take()
    }

    pub fn state(&self) -> DiagnosticState {
        self.lock().state
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.lock().snapshot()
    }

    /// Receive every state transition from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StateTransition> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use obd_protocol::{SimulatedAdapter, SimulatedVehicle};

    fn options(adapter: &SimulatedAdapter) -> ConnectOptions {
        ConnectOptions::new(TransportConfig::Simulated(adapter.clone()))
            .with_vehicle("Honda", Some("Accord".to_string()))
            .with_client(ClientConfig {
                command_timeout: Duration::from_millis(100),
                ..Default::default()
            })
    }

    #[tokio::test]
    async fn test_connect_reaches_ready() {
        let adapter = SimulatedAdapter::default();
        let manager = ConnectionManager::default();
        let mut rx = manager.subscribe();

        let snapshot = manager.connect(options(&adapter)).await.unwrap();
        assert_eq!(snapshot.state, DiagnosticState::Ready);
        assert_eq!(snapshot.transport, Some(TransportKind::Simulated));
        assert_eq!(snapshot.identity.as_deref(), Some("ELM327 v1.5"));
        assert_eq!(snapshot.vehicle_make.as_deref(), Some("Honda"));
        assert!(snapshot.last_connected_at.is_some());
        assert!(snapshot.metrics.unwrap().commands_attempted > 0);

        let mut path = Vec::new();
        while let Ok(t) = rx.try_recv() {
            path.push(t.to);
        }
        assert_eq!(
            path,
            vec![
                DiagnosticState::Connecting,
                DiagnosticState::Authenticating,
                DiagnosticState::Ready
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_unless_forced() {
        let adapter = SimulatedAdapter::default();
        let manager = ConnectionManager::default();
        manager.connect(options(&adapter)).await.unwrap();
        manager.connect(options(&adapter)).await.unwrap();
        assert_eq!(adapter.open_count(), 1);

        manager.connect(options(&adapter).forced()).await.unwrap();
        assert_eq!(adapter.open_count(), 2);
        assert_eq!(manager.state(), DiagnosticState::Ready);
    }

    #[tokio::test]
    async fn test_connect_failure_sets_error() {
        let adapter = SimulatedAdapter::default();
        adapter.fail_open(TransportError::DeviceNotFound("/dev/ttyUSB9".into()));
        let manager = ConnectionManager::default();

        let err = manager.connect(options(&adapter)).await.unwrap_err();
        assert!(err.is_link_failure());
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.state, DiagnosticState::Error);
        assert!(snapshot.last_error.unwrap().contains("/dev/ttyUSB9"));

        // acknowledging clears only the pointer
        assert!(manager.acknowledge_error().is_some());
        assert_eq!(manager.snapshot().last_error, None);
        assert_eq!(manager.state(), DiagnosticState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let adapter = SimulatedAdapter::default();
        adapter.silence("ATZ");
        let manager = ConnectionManager::default();
        let opts = options(&adapter).with_timeout(Duration::from_millis(50));

        let err = manager.connect(opts).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Connect(ObdError::Transport(TransportError::ConnectTimeout(50)))
        ));
        assert_eq!(manager.state(), DiagnosticState::Error);
    }

    #[tokio::test]
    async fn test_with_driver_requires_connection() {
        let manager = ConnectionManager::default();
        let err = manager
            .with_driver(|d| d.read_dtc().boxed())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::NotConnected {
                state: DiagnosticState::Disconnected
            }
        ));
    }

    #[tokio::test]
    async fn test_with_driver_runs_reads() {
        let adapter = SimulatedAdapter::new(SimulatedVehicle::with_dtcs(["P0420"]));
        let manager = ConnectionManager::default();
        manager.connect(options(&adapter)).await.unwrap();

        let codes = manager.with_driver(|d| d.read_dtc().boxed()).await.unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].code, "P0420");
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_then_reconnect() {
        let adapter = SimulatedAdapter::default();
        let manager = ConnectionManager::default();
        manager.connect(options(&adapter)).await.unwrap();

        adapter.drop_link_after(0);
        let err = manager.with_driver(|d| d.read_status().boxed()).await.unwrap_err();
        assert!(err.is_link_failure());
        assert_eq!(manager.state(), DiagnosticState::Error);

        adapter.clear_faults();
        let snapshot = manager.reconnect().await.unwrap();
        assert_eq!(snapshot.state, DiagnosticState::Ready);
        assert_eq!(snapshot.reconnect_attempts, 1);
        assert_eq!(adapter.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_policy() {
        let adapter = SimulatedAdapter::default();
        let manager = ConnectionManager::default();
        manager.connect(options(&adapter)).await.unwrap();
        manager.disconnect().await;

        adapter.fail_open(TransportError::ConnectFailed("radio off".into()));
        let started = tokio::time::Instant::now();
        let err = manager.reconnect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::ReconnectExhausted { attempts: 3, .. }));
        // 500ms + 1000ms between the three attempts
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
        assert_eq!(manager.snapshot().reconnect_attempts, 3);
    }

    #[tokio::test]
    async fn test_reconnect_needs_prior_connect() {
        let manager = ConnectionManager::default();
        assert!(matches!(
            manager.reconnect().await,
            Err(ConnectionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_one_operation_at_a_time() {
        let adapter = SimulatedAdapter::default();
        let manager = ConnectionManager::default();
        manager.connect(options(&adapter)).await.unwrap();

        manager.begin_operation(Activity::Reading, "read_dtc").unwrap();
        assert_eq!(manager.state(), DiagnosticState::Reading);
        assert!(matches!(
            manager.begin_operation(Activity::Clearing, "clear_dtc"),
            Err(ConnectionError::InvalidState { .. })
        ));
        manager.end_operation("read_dtc done");
        assert_eq!(manager.state(), DiagnosticState::Ready);
    }

    #[tokio::test]
    async fn test_disconnect_drops_identity() {
        let adapter = SimulatedAdapter::default();
        let manager = ConnectionManager::default();
        manager.connect(options(&adapter)).await.unwrap();
        manager.disconnect().await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.state, DiagnosticState::Disconnected);
        assert_eq!(snapshot.identity, None);
        assert!(snapshot.last_connected_at.is_some());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(4), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(4));
    }
}
