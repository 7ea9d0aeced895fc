//! Connection Pool
//!
//! Shares a bounded set of adapters between vehicles. Slots are created
//! lazily up to `max_connections`; when all are busy, requests wait in a
//! FIFO queue and are handed the next released slot. Bookkeeping lives
//! behind one mutex that is never held across I/O.

use crate::error::PoolError;
use crate::manager::{ConnectOptions, ConnectionManager, ReconnectPolicy};
use crate::state::DiagnosticState;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Builds the connect options for a slot, by slot index
pub type SlotOptions = Arc<dyn Fn(usize) -> ConnectOptions + Send + Sync>;

/// Pool settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    /// Failures an idle slot may accumulate before the health check evicts it
    pub max_failures: u32,
    pub health_check_interval: Duration,
    /// Wait bound for callers that do not pass one
    pub acquire_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            max_failures: 3,
            health_check_interval: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Something that happened in the pool
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    SlotCreated { slot: usize },
    Acquired { slot: usize, vehicle: String, waited_ms: u64 },
    Released { slot: usize, vehicle: String },
    ConnectFailed { slot: usize, vehicle: String, error: String },
    SlotEvicted { slot: usize, failures: u32 },
    Shutdown,
}

/// Derived pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    /// Free slots with a live adapter
    pub idle: usize,
    pub waiting: usize,
    pub total_acquired: u64,
    pub average_wait_ms: f64,
}

/// One slot as seen from outside the pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotInfo {
    pub slot: usize,
    pub vehicle: Option<String>,
    pub state: DiagnosticState,
    pub failures: u32,
    pub held_ms: Option<u64>,
    pub idle_ms: Option<u64>,
}

struct Slot {
    id: usize,
    manager: Arc<ConnectionManager>,
    vehicle: Option<String>,
    lease: u64,
    failures: u32,
    /// Driver `commands_failed` already charged to `failures`
    charged: u64,
    evicting: bool,
    acquired_at: Option<Instant>,
    last_used: Instant,
}

impl Slot {
    fn is_free(&self) -> bool {
        self.vehicle.is_none() && !self.evicting
    }
}

struct Grant {
    slot: usize,
    lease: u64,
    manager: Arc<ConnectionManager>,
}

struct Waiter {
    id: u64,
    vehicle: String,
    enqueued_at: Instant,
    tx: oneshot::Sender<Result<Grant, PoolError>>,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    queue: VecDeque<Waiter>,
    next_lease: u64,
    next_waiter: u64,
    total_acquired: u64,
    total_wait: Duration,
    shutting_down: bool,
}

impl PoolState {
    fn holds(&self, vehicle: &str) -> bool {
        self.slots.iter().any(|s| s.vehicle.as_deref() == Some(vehicle))
            || self.queue.iter().any(|w| w.vehicle == vehicle)
    }

    fn assign(&mut self, index: usize, vehicle: &str, waited: Duration) -> Grant {
        self.next_lease += 1;
        self.total_acquired += 1;
        self.total_wait += waited;
        let slot = &mut self.slots[index];
        slot.vehicle = Some(vehicle.to_string());
        slot.lease = self.next_lease;
        slot.acquired_at = Some(Instant::now());
        Grant {
            slot: slot.id,
            lease: slot.lease,
            manager: Arc::clone(&slot.manager),
        }
    }

    /// Hand free slots to queued requests, head first
    fn dispatch(&mut self, events: &broadcast::Sender<PoolEvent>) {
        while let Some(index) = self.slots.iter().position(Slot::is_free) {
            let Some(waiter) = self.queue.pop_front() else {
                return;
            };
            let waited = waiter.enqueued_at.elapsed();
            let grant = self.assign(index, &waiter.vehicle, waited);
            let slot = grant.slot;
            if waiter.tx.send(Ok(grant)).is_err() {
                // requester went away; undo and try the next one
                self.total_acquired -= 1;
                self.total_wait -= waited;
                let slot = &mut self.slots[index];
                slot.vehicle = None;
                slot.lease = 0;
                slot.acquired_at = None;
                continue;
            }
            record_acquired(events, slot, &waiter.vehicle, waited);
        }
    }
}

fn record_acquired(events: &broadcast::Sender<PoolEvent>, slot: usize, vehicle: &str, waited: Duration) {
    metrics::counter!("obd_pool_acquisitions_total").increment(1);
    metrics::histogram!("obd_pool_wait_ms").record(waited.as_secs_f64() * 1000.0);
    debug!("Slot {} acquired by {} after {:?}", slot, vehicle, waited);
    let _ = events.send(PoolEvent::Acquired {
        slot,
        vehicle: vehicle.to_string(),
        waited_ms: waited.as_millis() as u64,
    });
}

struct Shared {
    config: PoolConfig,
    slot_options: SlotOptions,
    state: Mutex<PoolState>,
    events: broadcast::Sender<PoolEvent>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return a leased slot; stale leases are ignored. Commands that failed
    /// during the lease are charged to the slot.
    fn release_lease(&self, slot_id: usize, lease: u64) -> Option<String> {
        let mut state = self.lock();
        let slot = state.slots.iter_mut().find(|s| s.id == slot_id && s.lease == lease)?;
        let vehicle = slot.vehicle.take()?;
        slot.lease = 0;
        let failed = failed_commands(&slot.manager);
        // a reconnect starts a fresh driver with its own count
        let new = if failed >= slot.charged { failed - slot.charged } else { failed };
        slot.failures = slot.failures.saturating_add(u32::try_from(new).unwrap_or(u32::MAX));
        slot.charged = failed;
        slot.acquired_at = None;
        slot.last_used = Instant::now();
        debug!("Slot {} released by {} (failures: {})", slot_id, vehicle, slot.failures);
        let _ = self.events.send(PoolEvent::Released {
            slot: slot_id,
            vehicle: vehicle.clone(),
        });
        state.dispatch(&self.events);
        Some(vehicle)
    }
}

/// A slot held by one vehicle. Dropping it returns the slot to the pool.
pub struct PooledConnection {
    shared: Arc<Shared>,
    slot: usize,
    lease: u64,
    vehicle: String,
    manager: Arc<ConnectionManager>,
}

impl PooledConnection {
    pub fn manager(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.manager)
    }

    pub fn vehicle(&self) -> &str {
        &self.vehicle
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Return the slot now
    pub fn release(self) {}
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.shared.release_lease(self.slot, self.lease);
    }
}

fn failed_commands(manager: &ConnectionManager) -> u64 {
    manager.snapshot().metrics.map(|m| m.commands_failed).unwrap_or(0)
}

/// Bounded, fair pool of adapter connections
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, slot_options: SlotOptions) -> Self {
        info!("Creating connection pool with up to {} adapters", config.max_connections);
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                config,
                slot_options,
                state: Mutex::new(PoolState::default()),
                events,
                health_task: Mutex::new(None),
            }),
        }
    }

    /// Pool whose slots all use the same options
    pub fn with_options(config: PoolConfig, options: ConnectOptions) -> Self {
        Self::new(config, Arc::new(move |_| options.clone()))
    }

    /// Acquire a connection for `vehicle`.
    ///
    /// Fails at once if the vehicle already holds (or waits for) one. Reuses
    /// a free slot, creates one below capacity, or queues behind earlier
    /// requests until `timeout` (the configured default when `None`).
    pub async fn acquire_connection(
        &self,
        vehicle: &str,
        timeout: Option<Duration>,
    ) -> Result<PooledConnection, PoolError> {
        let timeout = timeout.unwrap_or(self.shared.config.acquire_timeout);
        let started = Instant::now();

        enum Plan {
            Ready(Grant),
            Wait(u64, oneshot::Receiver<Result<Grant, PoolError>>),
        }

        let plan = {
            let mut state = self.shared.lock();
            if state.shutting_down {
                return Err(PoolError::ShuttingDown);
            }
            if state.holds(vehicle) {
                return Err(PoolError::AlreadyConnected(vehicle.to_string()));
            }

            // prefer a free slot that is still connected
            let free = state
                .slots
                .iter()
                .position(|s| s.is_free() && s.manager.state() == DiagnosticState::Ready)
                .or_else(|| state.slots.iter().position(Slot::is_free));

            if let Some(index) = free {
                Plan::Ready(state.assign(index, vehicle, Duration::ZERO))
            } else if state.slots.len() < self.shared.config.max_connections {
                let id = state.slots.len();
                state.slots.push(Slot {
                    id,
                    manager: Arc::new(ConnectionManager::new(self.shared.config.reconnect)),
                    vehicle: None,
                    lease: 0,
                    failures: 0,
                    charged: 0,
                    evicting: false,
                    acquired_at: None,
                    last_used: Instant::now(),
                });
                info!("Created pool slot {}", id);
                let _ = self.shared.events.send(PoolEvent::SlotCreated { slot: id });
                Plan::Ready(state.assign(id, vehicle, Duration::ZERO))
            } else {
                state.next_waiter += 1;
                let id = state.next_waiter;
                let (tx, rx) = oneshot::channel();
                state.queue.push_back(Waiter {
                    id,
                    vehicle: vehicle.to_string(),
                    enqueued_at: started,
                    tx,
                });
                debug!("{} queued for a connection ({} waiting)", vehicle, state.queue.len());
                Plan::Wait(id, rx)
            }
        };

        let grant = match plan {
            Plan::Ready(grant) => {
                record_acquired(&self.shared.events, grant.slot, vehicle, Duration::ZERO);
                grant
            }
            Plan::Wait(id, mut rx) => match tokio::time::timeout(timeout, &mut rx).await {
                Ok(Ok(result)) => result?,
                Ok(Err(_)) => return Err(PoolError::ShuttingDown),
                Err(_) => return Err(self.abandon_wait(id, vehicle, rx, started)),
            },
        };

        let conn = PooledConnection {
            shared: Arc::clone(&self.shared),
            slot: grant.slot,
            lease: grant.lease,
            vehicle: vehicle.to_string(),
            manager: grant.manager,
        };
        self.ensure_connected(conn).await
    }

    /// Remove a timed-out request; a grant that raced the timeout goes back
    fn abandon_wait(
        &self,
        id: u64,
        vehicle: &str,
        mut rx: oneshot::Receiver<Result<Grant, PoolError>>,
        started: Instant,
    ) -> PoolError {
        let mut state = self.shared.lock();
        let before = state.queue.len();
        state.queue.retain(|w| w.id != id);
        let removed = state.queue.len() < before;
        drop(state);

        if !removed {
            if let Ok(Ok(grant)) = rx.try_recv() {
                self.shared.release_lease(grant.slot, grant.lease);
            }
        }
        warn!("{} gave up waiting for a connection", vehicle);
        PoolError::AcquireTimeout {
            vehicle: vehicle.to_string(),
            waited_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn ensure_connected(&self, conn: PooledConnection) -> Result<PooledConnection, PoolError> {
        if conn.manager.state() != DiagnosticState::Ready {
            let options = (self.shared.slot_options)(conn.slot);
            if let Err(e) = conn.manager.connect(options.forced()).await {
                warn!("Pool slot {} failed to connect: {}", conn.slot, e);
                {
                    let mut state = self.shared.lock();
                    if let Some(slot) = state.slots.iter_mut().find(|s| s.id == conn.slot) {
                        slot.failures += 1;
                    }
                }
                let _ = self.shared.events.send(PoolEvent::ConnectFailed {
                    slot: conn.slot,
                    vehicle: conn.vehicle.clone(),
                    error: e.to_string(),
                });
                return Err(PoolError::Connect {
                    slot: conn.slot,
                    source: e,
                });
            }
            // failed handshake commands of a fresh driver are not charged to the lease
            let failed = failed_commands(&conn.manager);
            let mut state = self.shared.lock();
            if let Some(slot) = state.slots.iter_mut().find(|s| s.id == conn.slot && s.lease == conn.lease) {
                slot.charged = failed;
            }
        }

        let shutting_down = self.shared.lock().shutting_down;
        if shutting_down {
            conn.manager.disconnect().await;
            return Err(PoolError::ShuttingDown);
        }
        Ok(conn)
    }

    /// Release the slot held by `vehicle` and hand it to the head of the queue
    pub fn release_connection(&self, vehicle: &str) -> Result<(), PoolError> {
        let (slot, lease) = {
            let state = self.shared.lock();
            let slot = state
                .slots
                .iter()
                .find(|s| s.vehicle.as_deref() == Some(vehicle))
                .ok_or_else(|| PoolError::SlotNotFound(vehicle.to_string()))?;
            (slot.id, slot.lease)
        };
        self.shared
            .release_lease(slot, lease)
            .map(|_| ())
            .ok_or_else(|| PoolError::SlotNotFound(vehicle.to_string()))
    }

    /// Charge a failure to the slot held by `vehicle`
    pub fn report_failure(&self, vehicle: &str) -> Result<u32, PoolError> {
        let mut state = self.shared.lock();
        let slot = state
            .slots
            .iter_mut()
            .find(|s| s.vehicle.as_deref() == Some(vehicle))
            .ok_or_else(|| PoolError::SlotNotFound(vehicle.to_string()))?;
        slot.failures += 1;
        Ok(slot.failures)
    }

    /// Disconnect idle slots whose failures exceed `max_failures`. They
    /// reconnect on their next acquisition. Returns how many were evicted.
    pub async fn run_health_check(&self) -> usize {
        let max_failures = self.shared.config.max_failures;
        let victims: Vec<(usize, u32, Arc<ConnectionManager>)> = {
            let mut state = self.shared.lock();
            if state.shutting_down {
                return 0;
            }
            state
                .slots
                .iter_mut()
                .filter(|s| s.is_free() && s.failures > max_failures)
                .map(|s| {
                    s.evicting = true;
                    (s.id, s.failures, Arc::clone(&s.manager))
                })
                .collect()
        };

        for (id, failures, manager) in &victims {
            warn!("Evicting pool slot {} after {} failures", id, failures);
            manager.disconnect().await;
            metrics::counter!("obd_pool_evictions_total").increment(1);
            let _ = self.shared.events.send(PoolEvent::SlotEvicted {
                slot: *id,
                failures: *failures,
            });
        }

        if !victims.is_empty() {
            let mut state = self.shared.lock();
            for slot in state.slots.iter_mut() {
                if victims.iter().any(|(id, _, _)| *id == slot.id) {
                    slot.evicting = false;
                    slot.failures = 0;
                }
            }
            state.dispatch(&self.shared.events);
        }
        victims.len()
    }

    /// Run the health check on the configured interval until shutdown.
    /// Calling it again while running does nothing.
    pub fn start_health_check(&self) {
        let mut task = self
            .shared
            .health_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let period = self.shared.config.health_check_interval;
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let pool = ConnectionPool { shared };
                let evicted = pool.run_health_check().await;
                if evicted > 0 {
                    info!("Health check evicted {} slot(s)", evicted);
                }
            }
        }));
        info!("Pool health check every {:?}", period);
    }

    /// Reject waiting requests, stop the health check and disconnect every
    /// slot. Safe to call more than once and with acquisitions in flight.
    pub async fn shutdown(&self) {
        let managers: Vec<Arc<ConnectionManager>> = {
            let mut state = self.shared.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            for waiter in state.queue.drain(..) {
                let _ = waiter.tx.send(Err(PoolError::ShuttingDown));
            }
            state.slots.iter().map(|s| Arc::clone(&s.manager)).collect()
        };
        info!("Shutting down connection pool ({} slots)", managers.len());

        if let Some(task) = self
            .shared
            .health_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        for manager in managers {
            manager.disconnect().await;
        }
        let _ = self.shared.events.send(PoolEvent::Shutdown);
    }

    /// Statistics derived from the live slot and queue state
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        let active = state.slots.iter().filter(|s| s.vehicle.is_some()).count();
        let idle = state
            .slots
            .iter()
            .filter(|s| s.is_free() && s.manager.state() == DiagnosticState::Ready)
            .count();
        let average_wait_ms = if state.total_acquired == 0 {
            0.0
        } else {
            state.total_wait.as_secs_f64() * 1000.0 / state.total_acquired as f64
        };
        PoolStats {
            total: state.slots.len(),
            active,
            idle,
            waiting: state.queue.len(),
            total_acquired: state.total_acquired,
            average_wait_ms,
        }
    }

    /// Per-slot view for diagnostics
    pub fn slots(&self) -> Vec<SlotInfo> {
        self.shared
            .lock()
            .slots
            .iter()
            .map(|s| SlotInfo {
                slot: s.id,
                vehicle: s.vehicle.clone(),
                state: s.manager.state(),
                failures: s.failures,
                held_ms: s.acquired_at.map(|t| t.elapsed().as_millis() as u64),
                idle_ms: s.vehicle.is_none().then(|| s.last_used.elapsed().as_millis() as u64),
            })
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use futures_util::FutureExt;
    use obd_protocol::{ClientConfig, SimulatedAdapter, TransportConfig};
    use std::sync::Mutex as StdMutex;

    fn pool(max: usize, adapter: &SimulatedAdapter) -> ConnectionPool {
        let options = ConnectOptions::new(TransportConfig::Simulated(adapter.clone())).with_client(ClientConfig {
            command_timeout: Duration::from_millis(100),
            ..Default::default()
        });
        ConnectionPool::with_options(
            PoolConfig {
                max_connections: max,
                max_failures: 2,
                health_check_interval: Duration::from_secs(5),
                acquire_timeout: Duration::from_secs(5),
                reconnect: ReconnectPolicy::default(),
            },
            options,
        )
    }

    async fn wait_for_queue(pool: &ConnectionPool, len: usize) {
        while pool.stats().waiting < len {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_idle_slot_is_reused() {
        let adapter = SimulatedAdapter::default();
        let pool = pool(2, &adapter);

        let conn = pool.acquire_connection("VIN-A", None).await.unwrap();
        assert_eq!(conn.manager().state(), DiagnosticState::Ready);
        pool.release_connection("VIN-A").unwrap();

        let conn = pool.acquire_connection("VIN-B", None).await.unwrap();
        assert_eq!(conn.slot(), 0);
        assert_eq!(adapter.open_count(), 1);
        let stats = pool.stats();
        assert_eq!((stats.total, stats.active, stats.idle), (1, 1, 0));
        assert_eq!(stats.total_acquired, 2);
    }

    #[tokio::test]
    async fn test_same_vehicle_gets_one_connection() {
        let adapter = SimulatedAdapter::default();
        let pool = pool(3, &adapter);

        let results = join_all((0..5).map(|_| pool.acquire_connection("VIN-A", None))).await;
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let dup = results
            .iter()
            .filter(|r| matches!(r, Err(PoolError::AlreadyConnected(_))))
            .count();
        assert_eq!((ok, dup), (1, 4));
        assert_eq!(pool.stats().active, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_are_served_in_order() {
        let adapter = SimulatedAdapter::default();
        let pool = pool(1, &adapter);
        let _held = pool.acquire_connection("VIN-0", None).await.unwrap();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for (i, vehicle) in ["VIN-1", "VIN-2", "VIN-3"].into_iter().enumerate() {
            let waiting = pool.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let conn = waiting.acquire_connection(vehicle, None).await.unwrap();
                order.lock().unwrap().push(conn.vehicle().to_string());
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(conn);
            }));
            wait_for_queue(&pool, i + 1).await;
        }

        pool.release_connection("VIN-0").unwrap();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["VIN-1", "VIN-2", "VIN-3"]);
        assert!(pool.stats().average_wait_ms > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_request_times_out() {
        let adapter = SimulatedAdapter::default();
        let pool = pool(1, &adapter);
        let _held = pool.acquire_connection("VIN-A", None).await.unwrap();

        let err = pool
            .acquire_connection("VIN-B", Some(Duration::from_millis(50)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::AcquireTimeout { waited_ms: 50, .. }));
        assert_eq!(pool.stats().waiting, 0);

        // the slot is not handed to the expired request
        pool.release_connection("VIN-A").unwrap();
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_release_unknown_vehicle() {
        let adapter = SimulatedAdapter::default();
        let pool = pool(1, &adapter);
        assert!(matches!(
            pool.release_connection("VIN-X"),
            Err(PoolError::SlotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_guard_drop_releases_once() {
        let adapter = SimulatedAdapter::default();
        let pool = pool(1, &adapter);
        let conn = pool.acquire_connection("VIN-A", None).await.unwrap();
        pool.release_connection("VIN-A").unwrap();
        let other = pool.acquire_connection("VIN-B", None).await.unwrap();

        // stale guard must not free VIN-B's lease
        drop(conn);
        assert_eq!(pool.stats().active, 1);
        other.release();
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn test_health_check_evicts_failing_idle_slot() {
        let adapter = SimulatedAdapter::default();
        let pool = pool(1, &adapter);
        let mut events = pool.subscribe();

        let _conn = pool.acquire_connection("VIN-A", None).await.unwrap();
        for _ in 0..3 {
            pool.report_failure("VIN-A").unwrap();
        }
        // in-use slots are skipped
        assert_eq!(pool.run_health_check().await, 0);

        pool.release_connection("VIN-A").unwrap();
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.run_health_check().await, 1);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.slots()[0].failures, 0);

        let conn = pool.acquire_connection("VIN-B", None).await.unwrap();
        assert_eq!(conn.manager().state(), DiagnosticState::Ready);
        assert_eq!(adapter.open_count(), 2);
        drop(conn);
        assert_eq!(pool.stats().idle, 1);

        let mut saw_eviction = false;
        while let Ok(event) = events.try_recv() {
            saw_eviction |= matches!(event, PoolEvent::SlotEvicted { slot: 0, failures: 3 });
        }
        assert!(saw_eviction);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_charged_once() {
        let adapter = SimulatedAdapter::default();
        let pool = pool(1, &adapter);

        adapter.silence("03");
        let conn = pool.acquire_connection("VIN-A", None).await.unwrap();
        for _ in 0..2 {
            assert!(conn.manager().with_driver(|d| d.read_dtc().boxed()).await.is_err());
        }
        drop(conn);
        assert_eq!(pool.slots()[0].failures, 2);

        // later leases that send nothing add nothing
        for vehicle in ["VIN-B", "VIN-C", "VIN-D"] {
            pool.acquire_connection(vehicle, None).await.unwrap().release();
        }
        assert_eq!(pool.slots()[0].failures, 2);
        assert_eq!(pool.run_health_check().await, 0);

        // a further failure crosses max_failures
        adapter.clear_faults();
        adapter.silence("03");
        let conn = pool.acquire_connection("VIN-E", None).await.unwrap();
        assert!(conn.manager().with_driver(|d| d.read_dtc().boxed()).await.is_err());
        drop(conn);
        assert_eq!(pool.slots()[0].failures, 3);
        assert_eq!(pool.run_health_check().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_waiters() {
        let adapter = SimulatedAdapter::default();
        let pool = pool(1, &adapter);
        let held = pool.acquire_connection("VIN-A", None).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire_connection("VIN-B", None).await.err() })
        };
        wait_for_queue(&pool, 1).await;

        pool.shutdown().await;
        assert!(matches!(waiter.await.unwrap(), Some(PoolError::ShuttingDown)));
        assert_eq!(held.manager().state(), DiagnosticState::Disconnected);
        assert!(matches!(
            pool.acquire_connection("VIN-C", None).await,
            Err(PoolError::ShuttingDown)
        ));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_failure_frees_slot() {
        let adapter = SimulatedAdapter::default();
        adapter.fail_open(obd_protocol::TransportError::DeviceNotFound("sim".into()));
        let pool = pool(1, &adapter);

        let err = pool.acquire_connection("VIN-A", None).await.err().unwrap();
        assert!(matches!(err, PoolError::Connect { slot: 0, .. }));
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.slots()[0].failures, 1);

        adapter.clear_faults();
        assert!(pool.acquire_connection("VIN-A", None).await.is_ok());
    }
}
