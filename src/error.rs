//! # Voltage Modbus Sync Error Handling
//!
//! Errors raised while mirroring remote device registers: failures reported by
//! the underlying master connection, configuration problems, and internal
//! state errors.
//!
//! ## Error Categories
//!
//! ### Transient I/O
//! - **I/O / Connection / Timeout**: a single bus call failed. The poll loop logs
//!   it, backs off and keeps running.
//! - **Exception**: the slave answered with a Modbus exception code.
//!
//! ### Fatal
//! - **ConnectionClosed**: the master handle reports it can no longer be used.
//!   The poll loop exits and the transport flips to stopped.
//!
//! ### Configuration
//! - **Configuration / InvalidAddress / InvalidData**: a bad topology or a
//!   value that does not fit a register.
//!
//! ## Usage
//!
//! ```rust
//! use voltage_modbus_sync::ModbusError;
//!
//! fn on_poll_error(error: &ModbusError) {
//!     if error.is_fatal() {
//!         println!("connection lost for good: {}", error);
//!     } else if error.is_recoverable() {
//!         println!("will retry after backoff: {}", error);
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for sync engine operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Error taxonomy for the sync engine
///
/// Each variant carries enough context to be logged on its own, because the
/// poll loop is the only place most of these errors are ever observed.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// A single bus call failed at the I/O level
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or maintenance problem that may heal
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The master connection is permanently unusable
    ///
    /// Returned by a master once it has been closed or torn down. The poll
    /// loop treats this as the signal to exit.
    #[error("Connection closed: {message}")]
    ConnectionClosed { message: String },

    /// No answer within the master's deadline
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The slave answered with an exception code; only 0x05 and 0x06 are
    /// worth retrying
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Address range leaves the 16-bit address space or is empty
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// A value that cannot be mapped onto a register or function code
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Bad topology: duplicate slave addresses, slave ids outside 1-247 or
    /// malformed YAML/JSON
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Poisoned device lock or failed task join
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Name of a standard Modbus exception code
fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

impl ModbusError {
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io { message: message.into() }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into() }
    }

    /// The returned error [`is_fatal`](Self::is_fatal)
    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::ConnectionClosed { message: message.into() }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), timeout_ms }
    }

    /// Exception response for `function`, named after the standard code table
    pub fn exception(function: u8, code: u8) -> Self {
        Self::Exception {
            function,
            code,
            message: exception_name(code).to_owned(),
        }
    }

    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData { message: message.into() }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether a retry after the backoff can succeed
    ///
    /// The poll loop backs off after every non-fatal error; the ones that are
    /// not recoverable (an illegal address, a bad value) are logged as errors
    /// because they will repeat every cycle until the topology is fixed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use voltage_modbus_sync::ModbusError;
    ///
    /// assert!(ModbusError::timeout("read coils", 1000).is_recoverable());
    /// assert!(!ModbusError::connection_closed("port removed").is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. } => true,
            // Acknowledge and Busy clear up on their own
            Self::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            _ => false,
        }
    }

    /// Whether the connection can never be used again
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. })
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = ModbusError::timeout("read input registers", 5000);
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());

        let err = ModbusError::connection_closed("serial port removed");
        assert!(!err.is_recoverable());
        assert!(err.is_fatal());

        assert!(!ModbusError::exception(0x03, 0x02).is_recoverable());
        assert!(ModbusError::exception(0x03, 0x06).is_recoverable());

        assert!(!ModbusError::invalid_data("value too wide").is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let msg = ModbusError::exception(0x04, 0x02).to_string();
        assert_eq!(msg, "Modbus exception: function=04, code=02 (Illegal Data Address)");

        let msg = ModbusError::timeout("FC04 read input register on slave 3", 250).to_string();
        assert_eq!(msg, "Timeout after 250ms: FC04 read input register on slave 3");
    }

    #[test]
    fn test_yaml_error_conversion() {
        let parsed: Result<Vec<u8>, _> = serde_yaml::from_str("{ not: [a list");
        let err: ModbusError = parsed.unwrap_err().into();
        assert!(matches!(err, ModbusError::Configuration { .. }));
    }
}
