//! Callback logging for application-visible bus traffic
//!
//! Library diagnostics go through `log`/`tracing`. A [`CallbackLogger`]
//! attached to a transport additionally receives one human-readable line per
//! executed write command, batched read and raised change event, so a host
//! application can show bus activity without installing a subscriber.

use std::sync::Arc;

use crate::command::WriteCommand;
use crate::events::SyncEvent;
use crate::protocol::{RegisterType, SlaveId};
use crate::register::UNSET_VALUE;

/// Severity of a traffic line; lower is more severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Sink for traffic lines
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Forwards bus traffic lines at or above `min_level` to an application sink
///
/// Clones share the same sink.
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
}

impl std::fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("enabled", &self.callback.is_some())
            .field("min_level", &self.min_level)
            .finish()
    }
}

impl CallbackLogger {
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
        }
    }

    /// Timestamped lines on stdout, errors and warnings on stderr
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let now = chrono::Local::now().format("%H:%M:%S%.3f");
            if level <= LogLevel::Warn {
                eprintln!("{} {:<5} {}", now, level.as_str(), message);
            } else {
                println!("{} {:<5} {}", now, level.as_str(), message);
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        match &self.callback {
            Some(callback) if level <= self.min_level => callback(level, message),
            _ => {}
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    /// Lets callers skip formatting lines nobody will receive
    pub fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level <= self.min_level
    }

    /// Log an executed (or failed) write command
    pub fn log_command(&self, command: &WriteCommand, success: bool) {
        if success {
            self.info(&format!("Write -> {}", command));
        } else {
            self.warn(&format!("Write failed -> {}", command));
        }
    }

    /// Log one batched read
    pub fn log_read(&self, slave: SlaveId, register_type: RegisterType, start: u16, quantity: u16) {
        if !self.should_log(LogLevel::Debug) {
            return;
        }
        self.debug(&format!(
            "Read <- slave {} {} {}..+{}",
            slave, register_type, start, quantity
        ));
    }

    /// Log a change event
    pub fn log_change(&self, event: &SyncEvent) {
        if !self.should_log(LogLevel::Info) {
            return;
        }
        let previous = match event.last_value() {
            UNSET_VALUE => "unset".to_string(),
            value => format!("0x{:X}", value),
        };
        self.info(&format!(
            "[{}] {:?} change: slave {} {} @ {} {} -> 0x{:X}",
            event.transport,
            event.kind,
            event.slave,
            event.register.register_type(),
            event.register.address(),
            previous,
            event.value()
        ));
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

/// `CallbackLogger::console()`
#[macro_export]
macro_rules! console_logger {
    () => {
        $crate::logging::CallbackLogger::console()
    };
}

/// Wrap a [`LogCallback`] in a `CallbackLogger`, at `Info` unless a level is given
#[macro_export]
macro_rules! custom_logger {
    ($callback:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $crate::logging::LogLevel::Info)
    };
    ($callback:expr, $level:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $level)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::Register;
    use std::sync::Mutex;

    fn capture(level: LogLevel) -> (CallbackLogger, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Box::new(move |level, message| {
            sink.lock().unwrap().push(format!("{} {}", level.as_str(), message));
        });
        (CallbackLogger::new(Some(callback), level), lines)
    }

    #[test]
    fn test_level_filtering() {
        let (logger, lines) = capture(LogLevel::Warn);
        logger.error("e");
        logger.warn("w");
        logger.info("i");
        logger.debug("d");
        assert_eq!(*lines.lock().unwrap(), vec!["ERROR e", "WARN w"]);
    }

    #[test]
    fn test_custom_logger_macro() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Box::new(move |_, message| sink.lock().unwrap().push(message.to_string()));
        let logger = crate::custom_logger!(callback);

        logger.debug("hidden at the default level");
        logger.info("shown");
        assert_eq!(*lines.lock().unwrap(), vec!["shown"]);
        let quiet: LogCallback = Box::new(|_, _| {});
        assert!(!crate::custom_logger!(quiet, LogLevel::Warn).should_log(LogLevel::Info));
    }

    #[test]
    fn test_disabled_logs_nothing() {
        let logger = CallbackLogger::disabled();
        assert!(!logger.should_log(LogLevel::Error));
        logger.error("dropped");
    }

    #[test]
    fn test_traffic_lines() {
        let (logger, lines) = capture(LogLevel::Debug);
        logger.log_command(&WriteCommand::WriteSingleCoil { slave: 2, address: 7, value: true }, true);
        logger.log_read(2, RegisterType::InputRegister, 10, 3);
        logger.log_change(&SyncEvent::new("bus", 2, Register::coil(7)));

        let lines = lines.lock().unwrap();
        assert_eq!(lines[0], "INFO Write -> slave 2 coil 7 <- true");
        assert_eq!(lines[1], "DEBUG Read <- slave 2 input register 10..+3");
        assert!(lines[2].contains("Output change: slave 2 coil @ 7 unset"));
    }
}
