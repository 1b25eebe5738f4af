//! Change events raised by the change-detection tick
//!
//! The transport publishes every detected change on a `tokio::sync::broadcast`
//! channel. Consumers either hold a receiver directly or hand an
//! [`EventHandler`] to [`spawn_dispatcher`].

use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::protocol::{RegisterType, SlaveId};
use crate::register::Register;

/// Which side of the device changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChangeKind {
    /// Read-only table (discrete input, input register)
    Input,
    /// Read-write table (coil, holding register)
    Output,
}

impl ChangeKind {
    pub fn for_register_type(register_type: RegisterType) -> Self {
        if register_type.is_writable() {
            ChangeKind::Output
        } else {
            ChangeKind::Input
        }
    }
}

/// A register whose composed value changed
#[derive(Debug, Clone, Serialize)]
pub struct SyncEvent {
    /// Name of the transport that detected the change
    pub transport: String,
    pub kind: ChangeKind,
    pub slave: SlaveId,
    /// Register state right after the change
    pub register: Register,
    pub timestamp: DateTime<Utc>,
}

impl SyncEvent {
    pub fn new(transport: impl Into<String>, slave: SlaveId, register: Register) -> Self {
        Self {
            transport: transport.into(),
            kind: ChangeKind::for_register_type(register.register_type()),
            slave,
            register,
            timestamp: Utc::now(),
        }
    }

    pub fn value(&self) -> u64 {
        self.register.value()
    }

    pub fn last_value(&self) -> u64 {
        self.register.last_value()
    }
}

/// Observer for change events
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// A read-only register changed
    async fn on_input_change(&self, event: SyncEvent);

    /// A read-write register changed
    async fn on_output_change(&self, event: SyncEvent);
}

/// Forward events from `receiver` to `handler` until the channel closes
///
/// Lagging receivers skip the overwritten events and keep going.
pub fn spawn_dispatcher<H: EventHandler>(
    mut receiver: broadcast::Receiver<SyncEvent>,
    handler: Arc<H>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => match event.kind {
                    ChangeKind::Input => handler.on_input_change(event).await,
                    ChangeKind::Output => handler.on_output_change(event).await,
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event dispatcher lagged, {} change events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(ChangeKind, u16)>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn on_input_change(&self, event: SyncEvent) {
            self.seen.lock().unwrap().push((ChangeKind::Input, event.register.address()));
        }

        async fn on_output_change(&self, event: SyncEvent) {
            self.seen.lock().unwrap().push((ChangeKind::Output, event.register.address()));
        }
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(ChangeKind::for_register_type(RegisterType::CoilsStatus), ChangeKind::Output);
        assert_eq!(ChangeKind::for_register_type(RegisterType::HoldingRegister), ChangeKind::Output);
        assert_eq!(ChangeKind::for_register_type(RegisterType::DiscreteInput), ChangeKind::Input);
        assert_eq!(ChangeKind::for_register_type(RegisterType::InputRegister), ChangeKind::Input);
    }

    #[tokio::test]
    async fn test_dispatcher_routes_by_kind() {
        let (tx, rx) = broadcast::channel(16);
        let recorder = Arc::new(Recorder::default());
        let task = spawn_dispatcher(rx, recorder.clone());

        tx.send(SyncEvent::new("bus", 1, Register::input(30, 1, false))).unwrap();
        tx.send(SyncEvent::new("bus", 1, Register::coil(4))).unwrap();
        drop(tx);
        task.await.unwrap();

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![(ChangeKind::Input, 30), (ChangeKind::Output, 4)]);
    }

    #[test]
    fn test_event_serializes() {
        let event = SyncEvent::new("line-1", 2, Register::holding(10, 2, true));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "Output");
        assert_eq!(json["slave"], 2);
        assert_eq!(json["register"]["address"], 10);
    }
}
