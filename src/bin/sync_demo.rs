/// Voltage Modbus Sync Demo
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
/// Mirrors a simulated bus: random input values drive change events, an event
/// handler echoes every discrete input onto a coil, and the supervisor report
/// is printed at the end.
///
/// Usage: `sync_demo [config.yaml|config.json]`

use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;
use voltage_modbus_sync::{
    spawn_dispatcher, EventHandler, ModbusMaster, RegisterType, SimulatedMaster,
    SyncConfig, SyncEvent, SyncSupervisor, SyncTransport, WriteCommand,
};

const DEFAULT_CONFIG: &str = r#"
transport:
  name: demo-bus
  cycle_pause_ms: 20
supervisor:
  drain_timeout_ms: 1000
devices:
  - slave: 1
    registers:
      - { address: 0, register_type: discrete_input }
      - { address: 1, register_type: discrete_input }
      - { address: 100, register_type: coils_status }
      - { address: 101, register_type: coils_status }
      - { address: 0, register_type: input_register, count: 2, little_endian: true }
      - { address: 2, register_type: input_register }
  - slave: 2
    registers:
      - { address: 40, register_type: holding_register, count: 2 }
      - { address: 10, register_type: input_register, count: 4 }
"#;

/// Echo discrete input N of slave 1 onto coil 100 + N
struct EchoHandler<M: ModbusMaster + 'static> {
    transport: Arc<SyncTransport<M>>,
}

#[async_trait]
impl<M: ModbusMaster + 'static> EventHandler for EchoHandler<M> {
    async fn on_input_change(&self, event: SyncEvent) {
        let register = &event.register;
        if event.slave == 1 && register.register_type() == RegisterType::DiscreteInput {
            self.transport.enqueue(WriteCommand::WriteSingleCoil {
                slave: 1,
                address: 100 + register.address(),
                value: event.value() == 1,
            });
        }
    }

    async fn on_output_change(&self, event: SyncEvent) {
        info!("Output slave {} {} @ {} = {}",
              event.slave, event.register.register_type(), event.register.address(), event.value());
    }
}

fn load_config() -> anyhow::Result<SyncConfig> {
    match std::env::args().nth(1) {
        Some(path) => SyncConfig::from_file(&path).with_context(|| format!("loading {}", path)),
        None => SyncConfig::from_yaml_str(DEFAULT_CONFIG).context("parsing built-in config"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("🚀 {}", voltage_modbus_sync::info());
    println!("==========================================");

    let config = load_config()?;

    let master = SimulatedMaster::new().with_latency(Duration::from_millis(2));
    for device in &config.devices {
        master.add_slave(device.slave)?;
    }

    let transport = SyncTransport::new(master.clone(), config.transport.clone())
        .with_logger(voltage_modbus_sync::console_logger!());
    for device in config.build_devices() {
        transport.add_device(device)?;
    }
    let transport = Arc::new(transport);

    let dispatcher = spawn_dispatcher(
        transport.subscribe(),
        Arc::new(EchoHandler { transport: transport.clone() }),
    );

    let supervisor = SyncSupervisor::new(transport.clone(), config.supervisor.clone());
    supervisor.start().await?;
    println!("✅ Supervisor started for {} devices", transport.slaves().len());

    let mut rng = rand::thread_rng();
    for round in 0..10 {
        if let Some(bank) = master.bank(1) {
            bank.set_discrete_input(rng.gen_range(0..2), rng.gen_bool(0.5))?;
            bank.set_input_register(rng.gen_range(0..3), rng.gen())?;
        }
        if round == 5 {
            transport.write_value(2, RegisterType::HoldingRegister, 40, 0xDEAD_BEEF);
            transport.disable_io_event_sync(1, RegisterType::InputRegister, None, Some(Duration::from_millis(300)));
        }
        sleep(Duration::from_millis(150)).await;
    }

    if let Some(value) = transport.register_value(2, RegisterType::HoldingRegister, 40) {
        println!("📈 Slave 2 holding 40 = 0x{:08X}", value);
    }
    for slave in transport.slaves() {
        if let Some(stats) = master.bank(slave).map(|bank| bank.get_stats()).transpose()? {
            println!("🗄️  Slave {} bank: {:?}", slave, stats);
        }
    }

    supervisor.stop().await?;
    println!("\n📊 {}", supervisor.report());

    // the handler holds the transport, so the channel never closes on its own
    dispatcher.abort();
    println!("👋 Done");
    Ok(())
}
