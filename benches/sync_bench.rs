//! Sync engine benchmarks
//!
//! Coalescing, value composition, change detection and full poll cycles over
//! the simulated master.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::seq::SliceRandom;
use tokio::runtime::Runtime;
use voltage_modbus_sync::coalesce::coalesce;
use voltage_modbus_sync::codec;
use voltage_modbus_sync::{Device, Register, SimulatedMaster, SyncTransport, TransportConfig};

/// Addresses in runs of 8 separated by gaps, shuffled
fn scattered_addresses(count: usize) -> Vec<u16> {
    let mut addresses: Vec<u16> = (0..count as u16).map(|i| (i / 8) * 10 + i % 8).collect();
    addresses.shuffle(&mut rand::thread_rng());
    addresses
}

fn bench_coalesce(c: &mut Criterion) {
    let mut group = c.benchmark_group("coalesce");
    for size in [16usize, 256, 4096] {
        let addresses = scattered_addresses(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &addresses, |b, addresses| {
            b.iter(|| coalesce(black_box(addresses.iter().copied())));
        });
    }
    group.finish();
}

fn bench_compose(c: &mut Criterion) {
    let cache: BTreeMap<u16, u16> = (0..64u16).map(|a| (a, a.wrapping_mul(0x1111))).collect();
    let bits: BTreeMap<u16, bool> = (0..64u16).map(|a| (a, a % 3 == 0)).collect();

    let mut group = c.benchmark_group("compose");
    group.bench_function("words_4_le", |b| {
        b.iter(|| codec::compose_registers(black_box(&cache), 10, 4, true))
    });
    group.bench_function("words_4_be", |b| {
        b.iter(|| codec::compose_registers(black_box(&cache), 10, 4, false))
    });
    group.bench_function("bits_64", |b| {
        b.iter(|| codec::compose_bits(black_box(&bits), 0, 64, true))
    });
    group.finish();
}

fn bench_detect_changes(c: &mut Criterion) {
    let registers = (0..200u16).map(|i| Register::input(i * 2, 2, i % 2 == 0)).collect();
    let mut device = Device::with_registers(1, registers);
    device.initialize();

    c.bench_function("detect_changes_200_registers", |b| {
        let mut tick = 0u16;
        b.iter(|| {
            tick = tick.wrapping_add(1);
            device.merge_words(voltage_modbus_sync::RegisterType::InputRegister, 0, &[tick; 8]);
            black_box(device.detect_changes(Instant::now()))
        })
    });
}

fn bench_poll_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let master = SimulatedMaster::new();
    let transport = SyncTransport::new(master.clone(), TransportConfig::named("bench"));
    for slave in 1..=4u8 {
        master.add_slave(slave).unwrap();
        let registers = (0..50u16)
            .map(|i| Register::input(i * 3, 2, false))
            .chain((0..32u16).map(Register::discrete_input))
            .collect();
        transport.add_device(Device::with_registers(slave, registers)).unwrap();
    }
    rt.block_on(transport.poll_once()).unwrap();

    let mut group = c.benchmark_group("poll_cycle");
    group.measurement_time(Duration::from_secs(5));
    group.bench_function("4_devices_simulated", |b| {
        b.iter(|| rt.block_on(transport.poll_once()).unwrap());
    });
    group.finish();
}

criterion_group!(benches, bench_coalesce, bench_compose, bench_detect_changes, bench_poll_cycle);
criterion_main!(benches);
