//! # Sync Transport
//!
//! A [`SyncTransport`] owns one master connection and the devices reachable
//! through it, and keeps their mirror in sync with two background tasks:
//!
//! - **Poll loop**: re-initializes devices when the topology changes, then for
//!   every device reads its input-side ranges (discrete inputs, input
//!   registers) and executes at most one queued [`WriteCommand`]. Transient bus
//!   errors are logged and followed by a fixed backoff; the loop only exits on
//!   `stop` or when the master reports the connection closed.
//! - **Change tick**: every `change_interval_ms` recomposes every register from
//!   the raw caches and publishes a [`SyncEvent`] for each changed register
//!   with change events enabled.
//!
//! Both tasks share each device through its own mutex, which is never held
//! across bus I/O. Only the poll loop talks to the master.
//!
//! ## Example
//!
//! ```rust,no_run
//! use voltage_modbus_sync::{Device, Register, SimulatedMaster, SyncTransport, TransportConfig};
//!
//! #[tokio::main]
//! async fn main() -> voltage_modbus_sync::ModbusResult<()> {
//!     let master = SimulatedMaster::new();
//!     master.add_slave(1)?;
//!
//!     let transport = SyncTransport::new(master, TransportConfig::named("line-1"));
//!     transport.add_device(Device::with_registers(1, vec![Register::input(0, 2, false)]))?;
//!
//!     let mut events = transport.subscribe();
//!     transport.start().await?;
//!     if let Ok(event) = events.recv().await {
//!         println!("{:?} -> {}", event.kind, event.value());
//!     }
//!     transport.stop().await
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::ModbusMaster;
use crate::coalesce::split_range;
use crate::codec;
use crate::command::{WriteCommand, WriteQueue};
use crate::config::TransportConfig;
use crate::device::{Device, SharedDevice};
use crate::error::{ModbusError, ModbusResult};
use crate::events::SyncEvent;
use crate::logging::CallbackLogger;
use crate::protocol::{ModbusFunction, RegisterType, SlaveId};
use crate::utils::validation;
use crate::utils::{OperationTimer, PerformanceMetrics};

/// Tables refreshed on every poll cycle
const INPUT_TABLES: [RegisterType; 2] = [RegisterType::DiscreteInput, RegisterType::InputRegister];

/// Poll loop statistics since the last start
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleStats {
    /// Cycle durations; failed requests count cycles that hit an error
    pub cycles: PerformanceMetrics,
    /// Duration of the latest full pass over all devices
    pub last_cycle: Option<Duration>,
    pub reads_issued: u64,
    pub read_failures: u64,
    pub writes_executed: u64,
    pub write_failures: u64,
    pub reinitializations: u64,
    #[serde(skip)]
    pub last_completed: Option<Instant>,
}

impl CycleStats {
    pub fn cycle_count(&self) -> u64 {
        self.cycles.total
    }

    pub fn failed_cycles(&self) -> u64 {
        self.cycles.with_errors
    }
}

/// Lifecycle surface shared by anything that runs a sync loop
#[async_trait]
pub trait SyncService: Send + Sync {
    /// Start the background tasks; no-op when already running
    async fn start(&self) -> ModbusResult<()>;

    /// Stop the background tasks and discard pending writes; idempotent
    async fn stop(&self) -> ModbusResult<()>;

    /// Check if the poll loop is running
    fn is_running(&self) -> bool;

    /// Statistics since the last start
    fn stats(&self) -> CycleStats;

    /// Name used in logs and reports
    fn name(&self) -> &str;

    /// Commands queued but not yet executed
    fn pending_writes(&self) -> usize;
}

struct TaskHandles {
    poll: JoinHandle<()>,
    tick: JoinHandle<()>,
}

fn lock_device(device: &SharedDevice) -> ModbusResult<MutexGuard<'_, Device>> {
    device
        .lock()
        .map_err(|_| ModbusError::internal("Device lock poisoned"))
}

/// State shared by the handle and both background tasks
struct Shared<M> {
    config: TransportConfig,
    master: tokio::sync::Mutex<M>,
    devices: RwLock<Vec<SharedDevice>>,
    /// Bumped on every add/remove
    topology: AtomicU64,
    /// Topology generation the poll loop last initialized for
    synced_topology: AtomicU64,
    queue: WriteQueue,
    running: AtomicBool,
    stats: Mutex<CycleStats>,
    events: broadcast::Sender<SyncEvent>,
    logger: CallbackLogger,
}

impl<M: ModbusMaster + 'static> Shared<M> {
    fn device_list(&self) -> Vec<SharedDevice> {
        match self.devices.read() {
            Ok(devices) => devices.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn find_device(&self, slave: SlaveId) -> Option<SharedDevice> {
        self.device_list()
            .into_iter()
            .find(|d| d.lock().map(|d| d.slave() == slave).unwrap_or(false))
    }

    fn update_stats(&self, f: impl FnOnce(&mut CycleStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut stats);
    }

    fn cancelled(&self, cancellable: bool) -> bool {
        cancellable && !self.running.load(Ordering::SeqCst)
    }

    /// Log a failed bus call and back off; fatal errors are handed back
    async fn recover(&self, error: ModbusError, context: &str) -> ModbusResult<()> {
        if error.is_fatal() {
            return Err(error);
        }
        if error.is_recoverable() {
            warn!("[SYNC-{}] {} failed: {}, backing off {}ms",
                  self.config.name, context, error, self.config.error_backoff_ms);
        } else {
            error!("[SYNC-{}] {} failed and will keep failing: {}, backing off {}ms",
                   self.config.name, context, error, self.config.error_backoff_ms);
        }
        self.logger.warn(&format!("{} failed: {}", context, error));
        sleep(self.config.error_backoff()).await;
        Ok(())
    }

    /// Run one bus call under the configured request timeout
    async fn bounded<T>(
        &self,
        function: ModbusFunction,
        slave: SlaveId,
        call: impl Future<Output = ModbusResult<T>>,
    ) -> ModbusResult<T> {
        match timeout(self.config.request_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(ModbusError::timeout(
                format!("{} on slave {}", function, slave),
                self.config.request_timeout_ms,
            )),
        }
    }

    /// One pass over every device
    ///
    /// Devices that have not been fully read since their last initialization
    /// get every table read; the others only their input tables. Returns an
    /// error only when the connection is gone for good.
    async fn cycle(&self, cancellable: bool) -> ModbusResult<()> {
        if !self.master.lock().await.is_connected() {
            return Err(ModbusError::connection_closed("master reports disconnected"));
        }

        let started = Instant::now();
        let mut clean = true;

        let generation = self.topology.load(Ordering::SeqCst);
        if self.synced_topology.swap(generation, Ordering::SeqCst) != generation {
            self.reinitialize()?;
        }

        let devices = self.device_list();
        if devices.is_empty() {
            sleep(self.config.idle_delay()).await;
            return Ok(());
        }

        for device in &devices {
            if self.cancelled(cancellable) {
                return Ok(());
            }

            let (slave, full_read) = {
                let device = lock_device(device)?;
                (device.slave(), !device.is_synced())
            };
            let tables: &[RegisterType] = if full_read { &RegisterType::ALL } else { &INPUT_TABLES };
            let timer = full_read.then(|| OperationTimer::start(&format!("{} full read of slave {}", self.config.name, slave)));

            let mut complete = true;
            for &register_type in tables {
                match self.sync_table(device, slave, register_type, cancellable).await {
                    Ok(true) => {}
                    Ok(false) => return Ok(()),
                    Err(e) => {
                        self.recover(e, &format!("Reading slave {} {}s", slave, register_type)).await?;
                        complete = false;
                        break;
                    }
                }
            }
            clean &= complete;
            if let Some(timer) = timer {
                if complete {
                    lock_device(device)?.mark_synced();
                }
                timer.stop_and_log(complete);
            }

            if self.cancelled(cancellable) {
                return Ok(());
            }
            if let Err(e) = self.execute_next().await {
                self.recover(e, "Write command").await?;
                clean = false;
            }
        }

        let elapsed = started.elapsed();
        self.update_stats(|stats| {
            if clean {
                stats.cycles.record_success(elapsed);
            } else {
                stats.cycles.record_failure(elapsed);
            }
            stats.last_cycle = Some(elapsed);
            stats.last_completed = Some(Instant::now());
        });
        Ok(())
    }

    /// Rebuild every device mirror and drop queued writes
    ///
    /// Every device needs a full read afterwards; until it lands the change
    /// tick skips the device.
    fn reinitialize(&self) -> ModbusResult<()> {
        let devices = self.device_list();
        let dropped = self.queue.clear();
        if dropped > 0 {
            warn!("[SYNC-{}] Topology changed, {} queued writes discarded", self.config.name, dropped);
        }

        for device in &devices {
            let mut device = lock_device(device)?;
            device.initialize();
            device.mark_stale();
        }
        self.update_stats(|stats| stats.reinitializations += 1);
        info!("[SYNC-{}] Initialized {} devices", self.config.name, devices.len());
        Ok(())
    }

    /// Read every coalesced range of one table into the device cache
    ///
    /// The first failed read aborts the remaining ranges. Returns `Ok(false)`
    /// when a stop was observed before one of the reads.
    async fn sync_table(
        &self,
        device: &SharedDevice,
        slave: SlaveId,
        register_type: RegisterType,
        cancellable: bool,
    ) -> ModbusResult<bool> {
        let requests: Vec<(u16, u16)> = {
            let device = lock_device(device)?;
            device
                .ranges(register_type)
                .iter()
                .flat_map(|(&start, &count)| split_range(start, count, register_type.max_read_quantity()))
                .collect()
        };

        let function = register_type.read_function();
        for (start, quantity) in requests {
            if self.cancelled(cancellable) {
                return Ok(false);
            }
            self.update_stats(|stats| stats.reads_issued += 1);
            self.logger.log_read(slave, register_type, start, quantity);

            let result = if register_type.is_bit() {
                self.bounded(function, slave, async {
                    self.master.lock().await.read_bits(register_type, slave, start, quantity).await
                })
                .await
                .and_then(|bits| lock_device(device).map(|mut d| d.merge_bits(register_type, start, &bits)))
            } else {
                self.bounded(function, slave, async {
                    self.master.lock().await.read_words(register_type, slave, start, quantity).await
                })
                .await
                .and_then(|words| lock_device(device).map(|mut d| d.merge_words(register_type, start, &words)))
            };

            if let Err(e) = result {
                self.update_stats(|stats| stats.read_failures += 1);
                return Err(e);
            }
        }
        Ok(true)
    }

    /// Pop and run at most one queued command
    async fn execute_next(&self) -> ModbusResult<()> {
        let Some(command) = self.queue.pop() else {
            return Ok(());
        };

        match command {
            WriteCommand::Sleep { duration } => {
                debug!("[SYNC-{}] Sleeping {:?}", self.config.name, duration);
                sleep(duration).await;
                Ok(())
            }
            WriteCommand::ToggleEnableSync { slave, register_type, address, enabled } => {
                match self.find_device(slave) {
                    Some(device) => {
                        lock_device(&device)?.set_change_events(register_type, address, enabled, None);
                    }
                    None => debug!("[SYNC-{}] No device {} for queued toggle", self.config.name, slave),
                }
                Ok(())
            }
            command => self.execute_write(command).await,
        }
    }

    async fn execute_write(&self, command: WriteCommand) -> ModbusResult<()> {
        let (Some(slave), Some(function)) = (command.slave(), command.function()) else {
            return Ok(());
        };
        let Some(device) = self.find_device(slave) else {
            debug!("[SYNC-{}] No device {}, dropping: {}", self.config.name, slave, command);
            return Ok(());
        };

        let result = self.bounded(function, slave, async {
            let mut master = self.master.lock().await;
            match &command {
                WriteCommand::WriteSingleCoil { address, value, .. } => {
                    master.write_single_coil(slave, *address, *value).await
                }
                WriteCommand::WriteMultipleCoils { address, values, .. } => {
                    master.write_multiple_coils(slave, *address, values).await
                }
                WriteCommand::WriteSingleRegister { address, value, .. } => {
                    master.write_single_register(slave, *address, *value).await
                }
                WriteCommand::WriteMultipleRegisters { address, values, .. } => {
                    master.write_multiple_registers(slave, *address, values).await
                }
                WriteCommand::Sleep { .. } | WriteCommand::ToggleEnableSync { .. } => Ok(()),
            }
        })
        .await;

        if let Err(e) = result {
            self.update_stats(|stats| stats.write_failures += 1);
            self.logger.log_command(&command, false);
            return Err(e);
        }

        {
            let mut device = lock_device(&device)?;
            match &command {
                WriteCommand::WriteSingleCoil { address, value, .. } => {
                    device.merge_bits(RegisterType::CoilsStatus, *address, &[*value])
                }
                WriteCommand::WriteMultipleCoils { address, values, .. } => {
                    device.merge_bits(RegisterType::CoilsStatus, *address, values)
                }
                WriteCommand::WriteSingleRegister { address, value, .. } => {
                    device.merge_words(RegisterType::HoldingRegister, *address, &[*value])
                }
                WriteCommand::WriteMultipleRegisters { address, values, .. } => {
                    device.merge_words(RegisterType::HoldingRegister, *address, values)
                }
                WriteCommand::Sleep { .. } | WriteCommand::ToggleEnableSync { .. } => {}
            }
        }

        self.update_stats(|stats| stats.writes_executed += 1);
        self.logger.log_command(&command, true);
        debug!("[SYNC-{}] Executed: {}", self.config.name, command);
        Ok(())
    }

    /// One change-detection pass; returns the number of events raised
    fn detect_changes(&self) -> usize {
        let now = Instant::now();
        let mut raised = 0;

        for device in self.device_list() {
            let (slave, changed) = match device.lock() {
                Ok(mut device) if device.is_synced() => (device.slave(), device.detect_changes(now)),
                Ok(_) => continue,
                Err(_) => {
                    error!("[SYNC-{}] Device lock poisoned, skipping change detection", self.config.name);
                    continue;
                }
            };

            for register in changed {
                let event = SyncEvent::new(self.config.name.clone(), slave, register);
                self.logger.log_change(&event);
                // no subscribers is not an error
                let _ = self.events.send(event);
                raised += 1;
            }
        }
        raised
    }
}

async fn poll_loop<M: ModbusMaster + 'static>(shared: Arc<Shared<M>>) {
    info!("[SYNC-{}] Poll loop started", shared.config.name);

    while shared.running.load(Ordering::SeqCst) {
        if let Err(e) = shared.cycle(true).await {
            error!("[SYNC-{}] Poll loop stopping: {}", shared.config.name, e);
            shared.logger.error(&format!("Poll loop stopped: {}", e));
            break;
        }

        let pause = shared.config.cycle_pause();
        if pause.is_zero() {
            tokio::task::yield_now().await;
        } else {
            sleep(pause).await;
        }
    }

    shared.running.store(false, Ordering::SeqCst);
    info!("[SYNC-{}] Poll loop exited", shared.config.name);
}

async fn change_loop<M: ModbusMaster + 'static>(shared: Arc<Shared<M>>) {
    let mut ticker = interval(shared.config.change_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        shared.detect_changes();
    }
    debug!("[SYNC-{}] Change tick exited", shared.config.name);
}

/// Register mirror of every device behind one master connection
pub struct SyncTransport<M: ModbusMaster + 'static> {
    shared: Arc<Shared<M>>,
    tasks: Mutex<Option<TaskHandles>>,
}

impl<M: ModbusMaster + 'static> SyncTransport<M> {
    pub fn new(master: M, config: TransportConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let queue = match config.write_queue_capacity {
            Some(capacity) => WriteQueue::bounded(capacity),
            None => WriteQueue::new(),
        };
        Self {
            shared: Arc::new(Shared {
                config,
                master: tokio::sync::Mutex::new(master),
                devices: RwLock::new(Vec::new()),
                topology: AtomicU64::new(0),
                synced_topology: AtomicU64::new(u64::MAX),
                queue,
                running: AtomicBool::new(false),
                stats: Mutex::new(CycleStats::default()),
                events,
                logger: CallbackLogger::disabled(),
            }),
            tasks: Mutex::new(None),
        }
    }

    /// Attach a traffic logger; must be called before the transport is shared
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        let name = self.shared.config.name.clone();
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.logger = logger,
            None => warn!("[SYNC-{}] Transport already shared, logger ignored", name),
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Attach a device; picked up by the poll loop on its next cycle
    pub fn add_device(&self, device: Device) -> ModbusResult<SharedDevice> {
        let slave = device.slave();
        validation::validate_slave_id(slave)?;

        let device = device.into_shared();
        {
            let mut devices = self
                .shared
                .devices
                .write()
                .map_err(|_| ModbusError::internal("Device list lock poisoned"))?;
            if devices.iter().any(|d| d.lock().map(|d| d.slave() == slave).unwrap_or(false)) {
                return Err(ModbusError::configuration(format!("Device {} already attached", slave)));
            }
            devices.push(device.clone());
        }
        self.shared.topology.fetch_add(1, Ordering::SeqCst);
        info!("[SYNC-{}] Device {} added", self.name(), slave);
        Ok(device)
    }

    /// Detach a device; returns false if it was not attached
    pub fn remove_device(&self, slave: SlaveId) -> bool {
        let removed = match self.shared.devices.write() {
            Ok(mut devices) => {
                let before = devices.len();
                devices.retain(|d| d.lock().map(|d| d.slave() != slave).unwrap_or(true));
                devices.len() != before
            }
            Err(_) => false,
        };
        if removed {
            self.shared.topology.fetch_add(1, Ordering::SeqCst);
            info!("[SYNC-{}] Device {} removed", self.name(), slave);
        }
        removed
    }

    /// Slave ids in polling order
    pub fn slaves(&self) -> Vec<SlaveId> {
        self.shared
            .device_list()
            .iter()
            .filter_map(|d| d.lock().ok().map(|d| d.slave()))
            .collect()
    }

    pub async fn start(&self) -> ModbusResult<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            debug!("[SYNC-{}] Already running", self.name());
            return Ok(());
        }

        self.shared.update_stats(|stats| *stats = CycleStats::default());
        self.shared.queue.clear();
        // force a full read pass on the first cycle
        self.shared.synced_topology.store(u64::MAX, Ordering::SeqCst);

        let poll = tokio::spawn(poll_loop(self.shared.clone()));
        let tick = tokio::spawn(change_loop(self.shared.clone()));

        let previous = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            tasks.replace(TaskHandles { poll, tick })
        };
        if let Some(previous) = previous {
            previous.tick.abort();
            previous.poll.abort();
        }

        info!("[SYNC-{}] Started", self.name());
        Ok(())
    }

    pub async fn stop(&self) -> ModbusResult<()> {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        let dropped = self.shared.queue.clear();

        let tasks = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            tasks.take()
        };
        if let Some(TaskHandles { mut poll, tick }) = tasks {
            tick.abort();
            if timeout(self.shared.config.stop_timeout(), &mut poll).await.is_err() {
                warn!("[SYNC-{}] Poll loop did not exit within {}ms, aborting",
                      self.name(), self.shared.config.stop_timeout_ms);
                poll.abort();
            }
        }

        if was_running {
            info!("[SYNC-{}] Stopped, {} pending writes discarded", self.name(), dropped);
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Run a single poll cycle on the caller's task
    ///
    /// Meant for stepping a transport that is not started. Fails only when the
    /// connection is closed.
    pub async fn poll_once(&self) -> ModbusResult<()> {
        self.shared.cycle(false).await
    }

    /// Run a single change-detection pass; returns the number of events raised
    pub fn detect_changes(&self) -> usize {
        self.shared.detect_changes()
    }

    /// Receive change events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    /// Queue a command for the poll loop; false if the queue dropped it
    pub fn enqueue(&self, command: WriteCommand) -> bool {
        self.shared.queue.enqueue(command)
    }

    pub fn pending_writes(&self) -> usize {
        self.shared.queue.len()
    }

    /// Queue a write of the inverted cached state of one coil
    pub fn turn_single_coil(&self, slave: SlaveId, address: u16) -> bool {
        let current = self.cached_bits(slave, address, 1).and_then(|bits| bits.first().copied());
        match current {
            Some(value) => self.enqueue(WriteCommand::WriteSingleCoil { slave, address, value: !value }),
            None => {
                debug!("[SYNC-{}] Toggle of unknown coil {} @ slave {} ignored", self.name(), address, slave);
                false
            }
        }
    }

    /// Queue a write of the inverted cached state of `count` consecutive coils
    ///
    /// Coils missing from the cache count as off.
    pub fn turn_multiple_coils(&self, slave: SlaveId, address: u16, count: u16) -> bool {
        if validation::validate_address_range(address, count).is_err() {
            debug!("[SYNC-{}] Toggle of coils {}..+{} ignored", self.name(), address, count);
            return false;
        }
        match self.cached_bits(slave, address, count) {
            Some(bits) => {
                let values = bits.into_iter().map(|b| !b).collect();
                self.enqueue(WriteCommand::WriteMultipleCoils { slave, address, values })
            }
            None => false,
        }
    }

    /// Cached coil states; `None` when the device or the first coil is unknown
    fn cached_bits(&self, slave: SlaveId, address: u16, count: u16) -> Option<Vec<bool>> {
        let device = self.shared.find_device(slave)?;
        let device = device.lock().ok()?;
        device.bit(RegisterType::CoilsStatus, address)?;
        Some(
            (0..count)
                .map(|i| device.bit(RegisterType::CoilsStatus, address + i).unwrap_or(false))
                .collect(),
        )
    }

    /// Queue a write of a composed value to a coil or holding register
    ///
    /// Width and endianness come from the register configured at `address`;
    /// without one a single coil or word is written.
    pub fn write_value(&self, slave: SlaveId, register_type: RegisterType, address: u16, value: u64) -> bool {
        if !register_type.is_writable() {
            debug!("[SYNC-{}] {} @ {} is read-only, write ignored", self.name(), register_type, address);
            return false;
        }
        let Some(device) = self.shared.find_device(slave) else {
            debug!("[SYNC-{}] No device {}, write ignored", self.name(), slave);
            return false;
        };
        let (count, little_endian) = match device.lock() {
            Ok(device) => device
                .register(register_type, address)
                .map_or((1, false), |r| (r.count(), r.little_endian())),
            Err(_) => return false,
        };

        let command = match (register_type, count) {
            (RegisterType::CoilsStatus, 1) => WriteCommand::WriteSingleCoil { slave, address, value: value & 1 == 1 },
            (RegisterType::CoilsStatus, _) => WriteCommand::WriteMultipleCoils {
                slave,
                address,
                values: codec::decompose_bits(value, count, little_endian),
            },
            (_, 1) => WriteCommand::WriteSingleRegister { slave, address, value: value as u16 },
            _ => WriteCommand::WriteMultipleRegisters {
                slave,
                address,
                values: codec::decompose(value, count, little_endian),
            },
        };
        self.enqueue(command)
    }

    /// Stop raising change events for one register (`Some(address)`) or a
    /// whole table (`None`)
    ///
    /// With a `timeout` the change tick re-enables them once it has elapsed.
    /// Returns the number of registers affected.
    pub fn disable_io_event_sync(
        &self,
        slave: SlaveId,
        register_type: RegisterType,
        address: Option<u16>,
        timeout: Option<Duration>,
    ) -> usize {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.set_event_sync(slave, register_type, address, false, deadline)
    }

    /// Resume change events, cancelling any timed re-enable
    pub fn enable_io_event_sync(&self, slave: SlaveId, register_type: RegisterType, address: Option<u16>) -> usize {
        self.set_event_sync(slave, register_type, address, true, None)
    }

    fn set_event_sync(
        &self,
        slave: SlaveId,
        register_type: RegisterType,
        address: Option<u16>,
        enabled: bool,
        deadline: Option<Instant>,
    ) -> usize {
        let touched = self
            .shared
            .find_device(slave)
            .and_then(|device| {
                device
                    .lock()
                    .ok()
                    .map(|mut d| d.set_change_events(register_type, address, enabled, deadline))
            })
            .unwrap_or(0);
        if touched == 0 {
            debug!("[SYNC-{}] No {} registers matched on slave {}", self.name(), register_type, slave);
        }
        touched
    }

    /// Copy of a device's mirror
    pub fn device_snapshot(&self, slave: SlaveId) -> Option<Device> {
        let device = self.shared.find_device(slave)?;
        let snapshot = device.lock().ok()?.clone();
        Some(snapshot)
    }

    /// Latest composed value of one register
    pub fn register_value(&self, slave: SlaveId, register_type: RegisterType, address: u16) -> Option<u64> {
        let device = self.shared.find_device(slave)?;
        let device = device.lock().ok()?;
        device.register(register_type, address).map(|r| r.value())
    }

    pub fn stats(&self) -> CycleStats {
        self.shared
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Stop and close the master connection
    pub async fn close(&self) -> ModbusResult<()> {
        self.stop().await?;
        self.shared.master.lock().await.close().await
    }
}

#[async_trait]
impl<M: ModbusMaster + 'static> SyncService for SyncTransport<M> {
    async fn start(&self) -> ModbusResult<()> {
        SyncTransport::start(self).await
    }

    async fn stop(&self) -> ModbusResult<()> {
        SyncTransport::stop(self).await
    }

    fn is_running(&self) -> bool {
        SyncTransport::is_running(self)
    }

    fn stats(&self) -> CycleStats {
        SyncTransport::stats(self)
    }

    fn name(&self) -> &str {
        SyncTransport::name(self)
    }

    fn pending_writes(&self) -> usize {
        SyncTransport::pending_writes(self)
    }
}

impl<M: ModbusMaster + 'static> Drop for SyncTransport<M> {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(tasks) = tasks.take() {
                tasks.tick.abort();
                tasks.poll.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{Register, UNSET_VALUE};
    use crate::simulator::SimulatedMaster;

    fn fast_config() -> TransportConfig {
        TransportConfig {
            error_backoff_ms: 1,
            idle_delay_ms: 1,
            ..TransportConfig::named("test")
        }
    }

    fn transport_with(registers: Vec<Register>) -> (SyncTransport<SimulatedMaster>, SimulatedMaster) {
        let master = SimulatedMaster::new();
        master.add_slave(1).unwrap();
        let transport = SyncTransport::new(master.clone(), fast_config());
        transport.add_device(Device::with_registers(1, registers)).unwrap();
        (transport, master)
    }

    #[tokio::test]
    async fn test_first_cycle_reads_every_table_then_inputs_only() {
        let (transport, master) = transport_with(vec![
            Register::input(1, 3, false),
            Register::input(7, 2, false),
            Register::holding(100, 2, false),
            Register::coil(5),
            Register::discrete_input(0),
        ]);

        transport.poll_once().await.unwrap();
        let first: Vec<_> = master.journal().iter().map(|r| r.function).collect();
        assert!(first.contains(&ModbusFunction::ReadCoils));
        assert!(first.contains(&ModbusFunction::ReadHoldingRegisters));

        master.clear_journal();
        transport.poll_once().await.unwrap();
        let second: Vec<_> = master.journal().iter().map(|r| (r.function, r.address, r.quantity)).collect();
        assert_eq!(second, vec![
            (ModbusFunction::ReadDiscreteInputs, 0, 1),
            (ModbusFunction::ReadInputRegisters, 1, 3),
            (ModbusFunction::ReadInputRegisters, 7, 2),
        ]);
        assert_eq!(transport.stats().reinitializations, 1);
    }

    #[tokio::test]
    async fn test_long_runs_are_split_per_request() {
        let registers = (0..70u16).map(|i| Register::input(i * 4, 4, false)).collect();
        let (transport, master) = transport_with(registers);
        transport.poll_once().await.unwrap();

        let reads: Vec<_> = master.journal().iter()
            .filter(|r| r.function == ModbusFunction::ReadInputRegisters)
            .map(|r| (r.address, r.quantity))
            .collect();
        assert_eq!(reads, vec![(0, 125), (125, 125), (250, 30)]);
    }

    #[tokio::test]
    async fn test_write_updates_cache_after_success() {
        let (transport, master) = transport_with(vec![Register::holding(10, 2, true)]);
        transport.poll_once().await.unwrap();

        assert!(transport.write_value(1, RegisterType::HoldingRegister, 10, 0x0002_0001));
        transport.poll_once().await.unwrap();

        let device = transport.device_snapshot(1).unwrap();
        assert_eq!(device.word(RegisterType::HoldingRegister, 10), Some(0x0001));
        assert_eq!(device.word(RegisterType::HoldingRegister, 11), Some(0x0002));
        let bank = master.bank(1).unwrap();
        assert_eq!(bank.read_words(RegisterType::HoldingRegister, 10, 2).unwrap(), vec![1, 2]);

        master.fail_next(1);
        assert!(transport.enqueue(WriteCommand::WriteSingleRegister { slave: 1, address: 10, value: 9 }));
        transport.poll_once().await.unwrap();
        let device = transport.device_snapshot(1).unwrap();
        assert_eq!(device.word(RegisterType::HoldingRegister, 10), Some(0x0001));
        assert_eq!(transport.stats().write_failures + transport.stats().read_failures, 1);
    }

    #[tokio::test]
    async fn test_toggle_reads_cache() {
        let (transport, master) = transport_with(vec![Register::coil(3), Register::coil(4)]);
        master.bank(1).unwrap().set_coil(4, true).unwrap();
        transport.poll_once().await.unwrap();

        assert!(transport.turn_multiple_coils(1, 3, 2));
        assert!(!transport.turn_single_coil(1, 99));
        assert!(!transport.turn_single_coil(2, 3));
        transport.poll_once().await.unwrap();

        let bank = master.bank(1).unwrap();
        assert_eq!(bank.read_bits(RegisterType::CoilsStatus, 3, 2).unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_unknown_slave_write_is_dropped() {
        let (transport, master) = transport_with(vec![Register::coil(0)]);
        transport.poll_once().await.unwrap();
        master.clear_journal();

        transport.enqueue(WriteCommand::WriteSingleCoil { slave: 9, address: 0, value: true });
        transport.poll_once().await.unwrap();
        assert_eq!(transport.pending_writes(), 0);
        assert!(master.journal().iter().all(|r| r.slave_id == 1));
        assert_eq!(transport.stats().write_failures, 0);
    }

    #[tokio::test]
    async fn test_change_events_skip_uninitialized_devices() {
        let (transport, _master) = transport_with(vec![Register::input(0, 1, false)]);
        let mut events = transport.subscribe();
        assert_eq!(transport.detect_changes(), 0);

        transport.poll_once().await.unwrap();
        assert_eq!(transport.detect_changes(), 1);
        let event = events.try_recv().unwrap();
        assert_eq!(event.transport, "test");
        assert_eq!(event.value(), 0);
        assert_eq!(transport.detect_changes(), 0);
    }

    #[tokio::test]
    async fn test_no_events_until_full_read_lands() {
        let (transport, master) = transport_with(vec![Register::input(0, 1, false)]);
        master.bank(1).unwrap().set_input_register(0, 5).unwrap();
        let mut events = transport.subscribe();

        master.fail_next(1);
        transport.poll_once().await.unwrap();
        assert!(!transport.device_snapshot(1).unwrap().is_synced());
        assert_eq!(transport.detect_changes(), 0);

        transport.poll_once().await.unwrap();
        assert_eq!(transport.detect_changes(), 1);
        let event = events.try_recv().unwrap();
        assert_eq!((event.last_value(), event.value()), (UNSET_VALUE, 5));
    }

    #[tokio::test]
    async fn test_slow_calls_time_out() {
        let master = SimulatedMaster::new().with_latency(Duration::from_millis(200));
        master.add_slave(1).unwrap();
        let config = TransportConfig { request_timeout_ms: 20, ..fast_config() };
        let transport = SyncTransport::new(master, config);
        transport.add_device(Device::with_registers(1, vec![Register::input(0, 1, false)])).unwrap();

        let started = Instant::now();
        transport.poll_once().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));

        let stats = transport.stats();
        assert_eq!(stats.read_failures, 1);
        assert_eq!(stats.failed_cycles(), 1);
        assert!(!transport.device_snapshot(1).unwrap().is_synced());
    }

    #[tokio::test]
    async fn test_bounded_write_queue() {
        let master = SimulatedMaster::new();
        let config = TransportConfig { write_queue_capacity: Some(2), ..fast_config() };
        let transport = SyncTransport::new(master, config);

        let write = |value| WriteCommand::WriteSingleCoil { slave: 1, address: 0, value };
        assert!(transport.enqueue(write(true)));
        assert!(transport.enqueue(write(false)));
        assert!(!transport.enqueue(write(true)));
        assert_eq!(transport.pending_writes(), 2);
    }

    #[test]
    fn test_concurrent_adds_of_one_slave() {
        let transport = Arc::new(SyncTransport::new(SimulatedMaster::new(), fast_config()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let transport = transport.clone();
                std::thread::spawn(move || transport.add_device(Device::new(5)).is_ok())
            })
            .collect();
        let added = handles.into_iter().filter_map(|h| h.join().ok()).filter(|&ok| ok).count();
        assert_eq!(added, 1);
        assert_eq!(transport.slaves(), vec![5]);
    }

    #[tokio::test]
    async fn test_disconnect_is_fatal() {
        let (transport, master) = transport_with(vec![Register::coil(0)]);
        master.disconnect();
        let err = transport.poll_once().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_devices_rejected() {
        let (transport, _master) = transport_with(vec![]);
        assert!(transport.add_device(Device::new(1)).is_err());
        assert!(transport.add_device(Device::new(0)).is_err());
        assert!(transport.add_device(Device::new(2)).is_ok());
        assert_eq!(transport.slaves(), vec![1, 2]);
        assert!(transport.remove_device(1));
        assert!(!transport.remove_device(1));
        assert_eq!(transport.slaves(), vec![2]);
    }
}
