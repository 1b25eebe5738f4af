//! Sync supervisor
//!
//! Wraps a [`SyncService`] (normally a [`SyncTransport`](crate::SyncTransport))
//! with a watchdog task that restarts the poll loop after it stopped on its
//! own, warns when cycles stall, and stops gracefully by letting queued writes
//! drain first.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::config::SupervisorConfig;
use crate::error::ModbusResult;
use crate::transport::{CycleStats, SyncService};
use crate::utils::format::{format_duration, format_metrics};

/// Point-in-time view of a supervised service
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorReport {
    pub name: String,
    pub running: bool,
    pub restarts: u64,
    pub stalls: u64,
    pub pending_writes: usize,
    pub uptime: Option<Duration>,
    pub stats: CycleStats,
}

impl fmt::Display for SupervisorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "[{}] {} | uptime {} | restarts {} | stalls {} | pending writes {}",
            self.name,
            if self.running { "running" } else { "stopped" },
            self.uptime.map_or("-".to_string(), format_duration),
            self.restarts,
            self.stalls,
            self.pending_writes
        )?;
        writeln!(
            f,
            "reads {} ({} failed) | writes {} ({} failed) | reinitializations {}",
            self.stats.reads_issued,
            self.stats.read_failures,
            self.stats.writes_executed,
            self.stats.write_failures,
            self.stats.reinitializations
        )?;
        write!(f, "{}", format_metrics(&self.stats.cycles))
    }
}

#[derive(Default)]
struct SupervisorState {
    active: AtomicBool,
    restarts: AtomicU64,
    stalls: AtomicU64,
    started_at: Mutex<Option<Instant>>,
}

impl SupervisorState {
    fn started_at(&self) -> Option<Instant> {
        *self.started_at.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_started_at(&self, at: Option<Instant>) {
        *self.started_at.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = at;
    }
}

/// Watchdog around one sync service
pub struct SyncSupervisor<S: SyncService + 'static> {
    service: Arc<S>,
    config: SupervisorConfig,
    state: Arc<SupervisorState>,
    shutdown_tx: broadcast::Sender<()>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl<S: SyncService + 'static> SyncSupervisor<S> {
    pub fn new(service: Arc<S>, config: SupervisorConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            service,
            config,
            state: Arc::new(SupervisorState::default()),
            shutdown_tx,
            watchdog: Mutex::new(None),
        }
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    /// Start the service and the watchdog; no-op when already supervising
    pub async fn start(&self) -> ModbusResult<()> {
        if self.state.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.service.start().await {
            self.state.active.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.state.restarts.store(0, Ordering::SeqCst);
        self.state.stalls.store(0, Ordering::SeqCst);
        self.state.set_started_at(Some(Instant::now()));

        let handle = tokio::spawn(watch(
            self.service.clone(),
            self.config.clone(),
            self.state.clone(),
            self.shutdown_tx.subscribe(),
        ));
        let previous = self
            .watchdog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }

        info!("Supervising '{}'", self.service.name());
        Ok(())
    }

    /// Stop the watchdog, wait for queued writes to drain, then stop the service
    ///
    /// Writes still queued after `drain_timeout_ms` are discarded.
    pub async fn stop(&self) -> ModbusResult<()> {
        self.halt_watchdog().await;

        let deadline = Instant::now() + self.config.drain_timeout();
        while self.service.is_running() && self.service.pending_writes() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    "'{}': {} writes still queued after {}ms, discarding",
                    self.service.name(),
                    self.service.pending_writes(),
                    self.config.drain_timeout_ms
                );
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }

        self.service.stop().await
    }

    /// Stop immediately, discarding queued writes
    pub async fn stop_now(&self) -> ModbusResult<()> {
        self.halt_watchdog().await;
        self.service.stop().await
    }

    async fn halt_watchdog(&self) {
        if !self.state.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        let handle = self
            .watchdog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Watchdog for '{}' panicked: {}", self.service.name(), e);
                }
            }
        }
        self.state.set_started_at(None);
    }

    pub fn is_supervising(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> u64 {
        self.state.restarts.load(Ordering::SeqCst)
    }

    pub fn report(&self) -> SupervisorReport {
        SupervisorReport {
            name: self.service.name().to_string(),
            running: self.service.is_running(),
            restarts: self.restarts(),
            stalls: self.state.stalls.load(Ordering::SeqCst),
            pending_writes: self.service.pending_writes(),
            uptime: self.state.started_at().map(|at| at.elapsed()),
            stats: self.service.stats(),
        }
    }
}

async fn watch<S: SyncService + 'static>(
    service: Arc<S>,
    config: SupervisorConfig,
    state: Arc<SupervisorState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = interval(config.watch_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stalled = false;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Watchdog for '{}' shutting down", service.name());
                break;
            }
            _ = ticker.tick() => {}
        }

        if !service.is_running() {
            if !config.auto_restart {
                warn!("'{}' stopped and auto restart is off", service.name());
                break;
            }

            warn!("'{}' stopped unexpectedly, restarting in {}ms", service.name(), config.restart_delay_ms);
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = sleep(config.restart_delay()) => {}
            }
            if !state.active.load(Ordering::SeqCst) {
                break;
            }

            match service.start().await {
                Ok(()) => {
                    let restarts = state.restarts.fetch_add(1, Ordering::SeqCst) + 1;
                    info!("'{}' restarted ({} restarts)", service.name(), restarts);
                }
                Err(e) => error!("Restarting '{}' failed: {}", service.name(), e),
            }
            stalled = false;
            continue;
        }

        // a cycle can legitimately take long while reading a large topology
        let reference = service.stats().last_completed.or_else(|| state.started_at());
        let is_stalled = reference.map_or(false, |at| at.elapsed() > config.stall_timeout());
        if is_stalled && !stalled {
            state.stalls.fetch_add(1, Ordering::SeqCst);
            warn!(
                "'{}': no poll cycle completed for over {}ms",
                service.name(),
                config.stall_timeout_ms
            );
        }
        stalled = is_stalled;
    }
}

/// Prometheus gauges for one supervised service
#[cfg(feature = "prometheus")]
pub struct SupervisorMetrics {
    running: prometheus::IntGauge,
    restarts: prometheus::IntGauge,
    cycles: prometheus::IntGauge,
    failed_cycles: prometheus::IntGauge,
    pending_writes: prometheus::IntGauge,
    last_cycle_seconds: prometheus::Gauge,
}

#[cfg(feature = "prometheus")]
impl SupervisorMetrics {
    /// Create the gauges and register them with `registry`
    pub fn register(registry: &prometheus::Registry, name: &str) -> ModbusResult<Self> {
        use crate::error::ModbusError;

        let labels = |help: &str, metric: &str| {
            prometheus::Opts::new(metric, help).const_label("transport", name)
        };
        let int_gauge = |metric: &str, help: &str| -> ModbusResult<prometheus::IntGauge> {
            let gauge = prometheus::IntGauge::with_opts(labels(help, metric))
                .map_err(|e| ModbusError::internal(e.to_string()))?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(|e| ModbusError::internal(e.to_string()))?;
            Ok(gauge)
        };

        let last_cycle_seconds = prometheus::Gauge::with_opts(labels(
            "Duration of the latest poll cycle",
            "modbus_sync_last_cycle_seconds",
        ))
        .map_err(|e| ModbusError::internal(e.to_string()))?;
        registry
            .register(Box::new(last_cycle_seconds.clone()))
            .map_err(|e| ModbusError::internal(e.to_string()))?;

        Ok(Self {
            running: int_gauge("modbus_sync_running", "1 while the poll loop runs")?,
            restarts: int_gauge("modbus_sync_restarts", "Watchdog restarts")?,
            cycles: int_gauge("modbus_sync_cycles", "Poll cycles since start")?,
            failed_cycles: int_gauge("modbus_sync_failed_cycles", "Poll cycles that hit an error")?,
            pending_writes: int_gauge("modbus_sync_pending_writes", "Queued write commands")?,
            last_cycle_seconds,
        })
    }

    /// Copy a report into the gauges
    pub fn update(&self, report: &SupervisorReport) {
        self.running.set(report.running as i64);
        self.restarts.set(report.restarts as i64);
        self.cycles.set(report.stats.cycle_count() as i64);
        self.failed_cycles.set(report.stats.failed_cycles() as i64);
        self.pending_writes.set(report.pending_writes as i64);
        self.last_cycle_seconds
            .set(report.stats.last_cycle.map_or(0.0, |d| d.as_secs_f64()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::WriteCommand;
    use crate::config::TransportConfig;
    use crate::device::Device;
    use crate::protocol::RegisterType;
    use crate::register::Register;
    use crate::simulator::SimulatedMaster;
    use crate::transport::SyncTransport;

    fn fast_supervisor() -> SupervisorConfig {
        SupervisorConfig {
            watch_interval_ms: 10,
            restart_delay_ms: 10,
            auto_restart: true,
            drain_timeout_ms: 2000,
            stall_timeout_ms: 5000,
        }
    }

    fn setup() -> (Arc<SyncTransport<SimulatedMaster>>, SimulatedMaster) {
        let master = SimulatedMaster::new();
        master.add_slave(1).unwrap();
        let config = TransportConfig {
            error_backoff_ms: 1,
            cycle_pause_ms: 1,
            ..TransportConfig::named("supervised")
        };
        let transport = SyncTransport::new(master.clone(), config);
        transport
            .add_device(Device::with_registers(1, vec![Register::coil(0), Register::coil(1)]))
            .unwrap();
        (Arc::new(transport), master)
    }

    async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_restarts_after_disconnect() {
        let (transport, master) = setup();
        let supervisor = SyncSupervisor::new(transport.clone(), fast_supervisor());
        supervisor.start().await.unwrap();
        wait_until("first cycle", || transport.stats().cycle_count() > 0).await;

        master.disconnect();
        wait_until("poll loop exit", || !transport.is_running()).await;

        master.reconnect();
        wait_until("restart", || supervisor.restarts() > 0 && transport.is_running()).await;
        wait_until("cycle after restart", || transport.stats().cycle_count() > 0).await;

        supervisor.stop_now().await.unwrap();
        assert!(!transport.is_running());
        assert!(!supervisor.is_supervising());
    }

    #[tokio::test]
    async fn test_graceful_stop_drains_queue() {
        let (transport, master) = setup();
        let supervisor = SyncSupervisor::new(transport.clone(), fast_supervisor());
        supervisor.start().await.unwrap();
        wait_until("first cycle", || transport.stats().cycle_count() > 0).await;

        transport.enqueue(WriteCommand::Sleep { duration: Duration::from_millis(20) });
        transport.enqueue(WriteCommand::WriteSingleCoil { slave: 1, address: 0, value: true });
        transport.enqueue(WriteCommand::WriteSingleCoil { slave: 1, address: 1, value: true });
        supervisor.stop().await.unwrap();

        assert_eq!(transport.pending_writes(), 0);
        let bank = master.bank(1).unwrap();
        assert_eq!(bank.read_bits(RegisterType::CoilsStatus, 0, 2).unwrap(), vec![true, true]);
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn test_report() {
        let (transport, _master) = setup();
        let supervisor = SyncSupervisor::new(transport.clone(), fast_supervisor());
        assert!(supervisor.report().uptime.is_none());

        supervisor.start().await.unwrap();
        supervisor.start().await.unwrap();
        wait_until("first cycle", || transport.stats().cycle_count() > 0).await;

        let report = supervisor.report();
        assert_eq!(report.name, "supervised");
        assert!(report.running);
        assert_eq!(report.restarts, 0);
        assert!(report.uptime.is_some());
        assert!(report.to_string().contains("[supervised] running"));

        supervisor.stop().await.unwrap();
        assert!(!supervisor.report().running);
    }
}
