//! Diagnostic service facade
//!
//! One owned instance per kiosk, wiring a connection manager, a session,
//! a polling scheduler and (optionally) a connection pool together. The
//! outer API layer holds this and calls nothing else.

use crate::config::{AdapterMode, DiagConfig};
use crate::error::ServiceError;
use obd_connection::{ConnectOptions, ConnectionManager, ConnectionPool, ConnectionSnapshot, PooledConnection};
use obd_protocol::{Dtc, LiveData, LiveReading, ObdProtocol, Pid, SelfCheckReport, SimulatedAdapter, TransportKind, VehicleStatus};
use obd_scheduler::{PidStats, PollingScheduler};
use obd_session::{
    EventSink, HistoryStatus, InMemoryEventSink, Insights, MetricsSnapshot, OperationKind, OperationOptions,
    SessionError, SessionManager, TimelineEvent, TimelineQuery,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Parameters of a connect call; unset fields fall back to configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectRequest {
    pub vehicle_make: Option<String>,
    pub model: Option<String>,
    pub mode: Option<AdapterMode>,
    pub device_name: Option<String>,
    pub timeout_ms: Option<u64>,
    pub can_fd_enabled: Option<bool>,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectResult {
    pub success: bool,
    /// Adapter identity string
    pub adapter: Option<String>,
    pub protocol: Option<ObdProtocol>,
    pub transport: Option<TransportKind>,
    pub error: Option<String>,
}

/// Success with data, or failure with a message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

impl<T> From<Result<T, SessionError>> for OperationResponse<T> {
    fn from(result: Result<T, SessionError>) -> Self {
        match result {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                message: None,
            },
            Err(e) => Self {
                success: false,
                data: None,
                message: Some(e.to_string()),
            },
        }
    }
}

pub struct DiagnosticService {
    config: DiagConfig,
    simulator: SimulatedAdapter,
    connection: Arc<ConnectionManager>,
    session: SessionManager,
    scheduler: PollingScheduler,
    pool: Option<ConnectionPool>,
    sink: Option<Arc<dyn EventSink>>,
    /// One session per pool slot, created on first use
    pooled: Mutex<HashMap<usize, Arc<SessionManager>>>,
}

impl DiagnosticService {
    pub fn new(config: DiagConfig) -> Result<Self, ServiceError> {
        Self::with_simulator(config, SimulatedAdapter::default())
    }

    /// Service whose simulated links talk to `simulator`
    pub fn with_simulator(config: DiagConfig, simulator: SimulatedAdapter) -> Result<Self, ServiceError> {
        config.validate()?;
        let connection = Arc::new(ConnectionManager::new(config.reconnect_policy()));

        let sink: Option<Arc<dyn EventSink>> = match config.operations.history_records {
            0 => None,
            records => Some(Arc::new(InMemoryEventSink::new(records)) as Arc<dyn EventSink>),
        };
        let session = SessionManager::new(Arc::clone(&connection), config.session(), sink.clone());

        let scheduler = PollingScheduler::new(Arc::clone(&connection), config.scheduler())?;
        for target in config.poll_targets()? {
            scheduler.add_target(target);
        }

        let pool = config.pool.enabled.then(|| {
            let options = ConnectOptions::new(config.adapter.transport(config.adapter.mode, None, &simulator))
                .with_client(config.adapter.client())
                .with_timeout(Duration::from_millis(config.adapter.connect_timeout_ms));
            let pool = ConnectionPool::with_options(config.pool_config(), options);
            pool.start_health_check();
            pool
        });

        info!(
            "Diagnostic service ready (adapter: {:?}, pool: {})",
            config.adapter.mode,
            if pool.is_some() { "enabled" } else { "disabled" }
        );
        Ok(Self {
            config,
            simulator,
            connection,
            session,
            scheduler,
            pool,
            sink,
            pooled: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &DiagConfig {
        &self.config
    }

    pub fn simulator(&self) -> &SimulatedAdapter {
        &self.simulator
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn pool(&self) -> Option<&ConnectionPool> {
        self.pool.as_ref()
    }

    pub async fn connect(&self, request: ConnectRequest) -> ConnectResult {
        let adapter = &self.config.adapter;
        let mode = request.mode.unwrap_or(adapter.mode);
        let transport = adapter.transport(mode, request.device_name.as_deref(), &self.simulator);
        let timeout = Duration::from_millis(request.timeout_ms.unwrap_or(adapter.connect_timeout_ms));

        let mut options = ConnectOptions::new(transport)
            .with_client(adapter.client())
            .with_timeout(timeout)
            .with_can_fd(request.can_fd_enabled.unwrap_or(adapter.can_fd_enabled));
        if let Some(make) = request.vehicle_make {
            options = options.with_vehicle(make, request.model);
        }
        if request.force {
            options = options.forced();
        }

        match self.connection.connect(options).await {
            Ok(snapshot) => ConnectResult {
                success: true,
                adapter: snapshot.identity,
                protocol: snapshot.protocol,
                transport: snapshot.transport,
                error: None,
            },
            Err(e) => ConnectResult {
                success: false,
                adapter: None,
                protocol: None,
                transport: Some(mode_kind(mode)),
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn disconnect(&self) {
        self.scheduler.stop().await;
        self.connection.disconnect().await;
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.connection.snapshot()
    }

    pub async fn read_status(&self) -> OperationResponse<VehicleStatus> {
        self.session.read_status().await.into()
    }

    pub async fn read_dtc(&self) -> OperationResponse<Vec<Dtc>> {
        self.session.read_dtc().await.into()
    }

    /// Live data for `pids`, or the default set
    pub async fn read_live_data(&self, pids: Option<&[Pid]>) -> OperationResponse<LiveData> {
        let pids = pids.unwrap_or(&Pid::LIVE_DEFAULT);
        self.session.read_live_data(pids).await.into()
    }

    pub async fn clear_dtc(&self) -> OperationResponse<bool> {
        self.session.clear_dtc().await.into()
    }

    pub async fn self_check(&self) -> OperationResponse<SelfCheckReport> {
        self.session.self_check().await.into()
    }

    /// Retried, timelined execution of any caller task
    pub async fn run_operation<T, F, Fut>(
        &self,
        kind: OperationKind,
        options: OperationOptions<T>,
        task: F,
    ) -> Result<T, SessionError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.session.run_operation(kind, options, task).await
    }

    pub fn timeline(&self, query: &TimelineQuery) -> Vec<TimelineEvent> {
        self.session.get_timeline(query)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.session.get_metrics_snapshot()
    }

    pub fn insights(&self, window: Option<usize>) -> Insights {
        self.session.get_insights(window)
    }

    pub fn historical_summary(&self) -> HistoryStatus {
        self.session.get_historical_summary()
    }

    pub fn acknowledge_error(&self) -> Option<String> {
        self.session.acknowledge_error()
    }

    pub fn start_polling(&self) -> bool {
        self.scheduler.start()
    }

    pub async fn stop_polling(&self) -> bool {
        self.scheduler.stop().await
    }

    pub fn subscribe_readings(&self) -> broadcast::Receiver<LiveReading> {
        self.scheduler.subscribe()
    }

    pub fn polling_stats(&self) -> BTreeMap<Pid, PidStats> {
        self.scheduler.stats()
    }

    fn pooled_session(&self, lease: &PooledConnection) -> Arc<SessionManager> {
        let mut sessions = self.pooled.lock().unwrap_or_else(|e| e.into_inner());
        let session = sessions.entry(lease.slot()).or_insert_with(|| {
            Arc::new(SessionManager::new(lease.manager(), self.config.session(), self.sink.clone()))
        });
        Arc::clone(session)
    }

    /// Read stored codes for `vehicle` on a pooled adapter. The read runs
    /// through the slot's session; its failed commands are charged to the
    /// slot on release.
    pub async fn read_dtc_for_vehicle(&self, vehicle: &str) -> Result<Vec<Dtc>, ServiceError> {
        let pool = self.pool.as_ref().ok_or(ServiceError::PoolDisabled)?;
        let lease = pool.acquire_connection(vehicle, None).await?;
        let session = self.pooled_session(&lease);
        let result = session.read_dtc().await;
        lease.release();
        Ok(result?)
    }

    /// Timeline of the session bound to pool slot `slot`
    pub fn pooled_timeline(&self, slot: usize, query: &TimelineQuery) -> Vec<TimelineEvent> {
        let session = self
            .pooled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&slot)
            .cloned();
        session.map(|s| s.get_timeline(query)).unwrap_or_default()
    }

    /// Stop polling, drain the pool and drop the adapter
    pub async fn shutdown(&self) {
        info!("Shutting down diagnostic service");
        self.scheduler.stop().await;
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
        self.connection.disconnect().await;
        if let Some(error) = self.session.last_error() {
            warn!("Shutting down with unacknowledged error: {}", error);
        }
    }
}

fn mode_kind(mode: AdapterMode) -> TransportKind {
    match mode {
        AdapterMode::Serial => TransportKind::Serial,
        AdapterMode::Ble => TransportKind::Ble,
        AdapterMode::Simulated => TransportKind::Simulated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_connection::DiagnosticState;
    use obd_protocol::SimulatedVehicle;

    fn simulated() -> DiagConfig {
        let mut config = DiagConfig::default();
        config.adapter.mode = AdapterMode::Simulated;
        config.adapter.command_timeout_ms = 100;
        config
    }

    #[tokio::test]
    async fn test_connect_reports_adapter() {
        let service = DiagnosticService::new(simulated()).unwrap();
        let result = service
            .connect(ConnectRequest {
                vehicle_make: Some("Honda".into()),
                ..Default::default()
            })
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.adapter.as_deref(), Some("ELM327 v1.5"));
        assert_eq!(result.protocol, Some(ObdProtocol::Iso15765_4Can11bit500));

        let snapshot = service.snapshot();
        assert_eq!(snapshot.state, DiagnosticState::Ready);
        assert_eq!(snapshot.vehicle_make.as_deref(), Some("Honda"));
    }

    #[tokio::test]
    async fn test_operations_fail_with_message_when_disconnected() {
        let service = DiagnosticService::new(simulated()).unwrap();
        let response = service.read_status().await;
        assert!(!response.success);
        assert!(response.data.is_none());
        assert!(response.message.is_some());
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let service = DiagnosticService::new(simulated()).unwrap();
        service
            .simulator()
            .fail_open(obd_protocol::TransportError::DeviceNotFound("no adapter".into()));
        let result = service.connect(ConnectRequest::default()).await;
        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(service.snapshot().state, DiagnosticState::Error);
    }

    #[tokio::test]
    async fn test_pooled_read() {
        let mut config = simulated();
        config.pool.enabled = true;
        config.pool.max_connections = 2;
        let simulator = SimulatedAdapter::new(SimulatedVehicle::with_dtcs(["P0171"]));
        let service = DiagnosticService::with_simulator(config, simulator).unwrap();

        let codes = service.read_dtc_for_vehicle("VIN-1").await.unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].code, "P0171");
        assert_eq!(service.pool().map(|p| p.stats().active), Some(0));

        let timeline = service.pooled_timeline(0, &TimelineQuery::default());
        let ops: Vec<_> = timeline.iter().filter_map(TimelineEvent::operation).collect();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::ReadDtc);
        // the single-connection session is untouched
        assert!(service.timeline(&TimelineQuery::default()).is_empty());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_disabled() {
        let service = DiagnosticService::new(simulated()).unwrap();
        assert!(matches!(
            service.read_dtc_for_vehicle("VIN-1").await,
            Err(ServiceError::PoolDisabled)
        ));
    }
}
