/// Utility functions and helpers
///
/// Cycle-time metrics, validation helpers and formatting used by the
/// transport and supervisor.

use std::time::{Duration, Instant};
use log::{info, warn};
use serde::Serialize;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{SlaveId, MAX_SLAVE_ID};

/// Duration metrics for repeated passes (poll cycles)
///
/// A pass is "clean" when it finished without any recovered error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceMetrics {
    pub total: u64,
    pub clean: u64,
    pub with_errors: u64,
    pub busy_time: Duration,
    pub fastest: Option<Duration>,
    pub slowest: Option<Duration>,
    pub mean: Duration,
}

impl PerformanceMetrics {
    /// Create new empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, elapsed: Duration) {
        self.total += 1;
        self.busy_time += elapsed;
        self.fastest = Some(self.fastest.map_or(elapsed, |fastest| fastest.min(elapsed)));
        self.slowest = Some(self.slowest.map_or(elapsed, |slowest| slowest.max(elapsed)));

        // Duration / u32 would overflow after 4 billion samples
        let nanos = self.busy_time.as_nanos() / u128::from(self.total);
        self.mean = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
    }

    /// Record a pass that finished without errors
    pub fn record_success(&mut self, elapsed: Duration) {
        self.clean += 1;
        self.record(elapsed);
    }

    /// Record a pass that hit at least one recovered error
    pub fn record_failure(&mut self, elapsed: Duration) {
        self.with_errors += 1;
        self.record(elapsed);
    }

    /// Share of clean passes, in percent
    pub fn success_rate(&self) -> f64 {
        match self.total {
            0 => 0.0,
            total => self.clean as f64 * 100.0 / total as f64,
        }
    }

    /// Reset all metrics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Wall-clock timer for one labelled pass
pub struct OperationTimer {
    started: Instant,
    label: String,
}

impl OperationTimer {
    pub fn start(label: &str) -> Self {
        Self {
            started: Instant::now(),
            label: label.to_owned(),
        }
    }

    /// Stop and log how long the pass took, at `warn` if it was not clean
    pub fn stop_and_log(self, clean: bool) -> Duration {
        let elapsed = self.started.elapsed();
        let took = format::format_duration(elapsed);
        if clean {
            info!("✅ {} done in {}", self.label, took);
        } else {
            warn!("❌ {} finished with errors after {}", self.label, took);
        }
        elapsed
    }
}

/// Data validation utilities
pub mod validation {
    use super::*;

    /// Validate slave ID (1-247)
    pub fn validate_slave_id(slave_id: SlaveId) -> ModbusResult<()> {
        if slave_id == 0 || slave_id > MAX_SLAVE_ID {
            return Err(ModbusError::configuration(
                format!("Invalid slave ID: {} (must be 1-{})", slave_id, MAX_SLAVE_ID)
            ));
        }
        Ok(())
    }

    /// Validate that `count` addresses starting at `start` fit the address space
    pub fn validate_address_range(start: u16, count: u16) -> ModbusResult<()> {
        if count == 0 || (start as u32 + count as u32) > 65536 {
            return Err(ModbusError::invalid_address(start, count));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Space-separated 4-digit hex words
    pub fn registers_to_hex(words: &[u16]) -> String {
        let hex: Vec<String> = words.iter().map(|word| format!("{:04X}", word)).collect();
        hex.join(" ")
    }

    /// Format bits as a 0/1 string, lowest address first
    pub fn bits_to_string(bits: &[bool]) -> String {
        bits.iter().map(|&b| if b { '1' } else { '0' }).collect()
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let micros = duration.as_micros();
        if micros < 1000 {
            format!("{}µs", micros)
        } else if micros < 1_000_000 {
            format!("{:.1}ms", duration.as_secs_f64() * 1000.0)
        } else if micros < 60_000_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = micros / 60_000_000;
            let secs = (micros % 60_000_000) as f64 / 1_000_000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }

    /// Format cycle metrics as a table
    pub fn format_metrics(metrics: &PerformanceMetrics) -> String {
        format!(
            "Cycle Metrics:\n\
             ├─ Total Cycles: {}\n\
             ├─ Clean: {} ({:.1}%)\n\
             ├─ With Errors: {}\n\
             ├─ Mean: {}\n\
             ├─ Fastest: {}\n\
             └─ Slowest: {}",
            metrics.total,
            metrics.clean,
            metrics.success_rate(),
            metrics.with_errors,
            format_duration(metrics.mean),
            metrics.fastest.map_or_else(|| "-".to_string(), format_duration),
            metrics.slowest.map_or_else(|| "-".to_string(), format_duration),
        )
    }
}

/// Logging utilities
pub mod logging {
    /// Route `log` output through the test harness; safe to call repeatedly
    pub fn init_test_logger() {
        let _ = env_logger::Builder::from_default_env()
            .filter_module("voltage_modbus_sync", log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}
