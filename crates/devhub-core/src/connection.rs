//! The per-context hub every device token routes its data through
//!
//! A [`Connection`] owns message-type identity and the delivery path. Sync
//! devices attach themselves here so the host tick can poll them; async
//! devices only use it to send.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::device_token::DeviceToken;
use crate::error::Result;
use crate::message_type::{MessageType, MessageTypeRegistry};

/// Default capacity of the broadcast channel listeners subscribe to
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// One timestamped payload emitted by a device
#[derive(Debug, Clone)]
pub struct DeviceMessage {
    /// Qualified name of the sending device (`plugin/device`)
    pub device: String,
    pub message_type: Arc<MessageType>,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
}

/// Receiver of dispatched device messages
///
/// Sinks are called on the sending device's thread: the host thread for
/// sync devices and the device's own loop thread for async devices.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, message: &DeviceMessage);
}

/// Message hub for one registration context
pub struct Connection {
    registry: MessageTypeRegistry,
    sinks: RwLock<Vec<Arc<dyn MessageSink>>>,
    events: broadcast::Sender<DeviceMessage>,
    devices: RwLock<Vec<Weak<DeviceToken>>>,
    messages_sent: AtomicU64,
}

impl Connection {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    /// Create a connection whose broadcast channel buffers `capacity` messages
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (events, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            registry: MessageTypeRegistry::new(),
            sinks: RwLock::new(Vec::new()),
            events,
            devices: RwLock::new(Vec::new()),
            messages_sent: AtomicU64::new(0),
        })
    }

    /// Register a message type name; existing names alias
    pub fn register_message_type(&self, name: &str) -> Result<Arc<MessageType>> {
        self.registry.register(name)
    }

    pub fn message_types(&self) -> &MessageTypeRegistry {
        &self.registry
    }

    /// Attach a sink that receives every message sent through this connection
    pub fn add_sink(&self, sink: Arc<dyn MessageSink>) {
        self.sinks.write().push(sink);
    }

    /// Subscribe to the broadcast stream of messages
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceMessage> {
        self.events.subscribe()
    }

    /// Route a message to every sink and broadcast subscriber
    pub fn send(&self, message: DeviceMessage) {
        trace!(
            device = %message.device,
            message_type = %message.message_type,
            len = message.payload.len(),
            "Dispatching device message"
        );

        // Sinks may add sinks or send again from deliver
        let sinks = self.sinks.read().clone();
        for sink in sinks.iter() {
            sink.deliver(&message);
        }
        self.messages_sent.fetch_add(1, Ordering::Relaxed);

        // No subscribers is fine
        let _ = self.events.send(message);
    }

    /// Total messages routed since creation
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn attach_device(&self, device: &Arc<DeviceToken>) {
        let mut devices = self.devices.write();
        devices.retain(|d| d.strong_count() > 0);
        devices.push(Arc::downgrade(device));
    }

    /// Every live device attached to this connection, in creation order
    ///
    /// Devices torn down by their plugin context are left out even while
    /// something still holds a reference to them.
    pub fn devices(&self) -> Vec<Arc<DeviceToken>> {
        self.devices
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|d| !d.is_released())
            .collect()
    }

    /// Qualified names of every live device attached to this connection
    pub fn device_names(&self) -> Vec<String> {
        self.devices()
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    /// Run one host tick: update every live synchronous device in order
    ///
    /// Returns the number of devices whose callback ran successfully. A
    /// failing device is logged and does not stop the tick.
    pub fn process_devices(&self) -> usize {
        let devices = self.devices();
        let mut updated = 0;
        for device in devices.iter() {
            let Some(sync) = device.as_sync() else {
                continue;
            };
            if device.is_released() {
                continue;
            }
            match sync.update() {
                Ok(()) => updated += 1,
                Err(e) => warn!(device = %device.name(), error = %e, "Device update failed"),
            }
        }

        drop(devices);

        // Upgraded tokens are dropped after the lock is released
        let mut upgraded = Vec::new();
        let mut tracked = self.devices.write();
        let before = tracked.len();
        tracked.retain(|d| match d.upgrade() {
            Some(token) => {
                let keep = !token.is_released();
                upgraded.push(token);
                keep
            }
            None => false,
        });
        let pruned = before - tracked.len();
        drop(tracked);
        drop(upgraded);
        if pruned > 0 {
            debug!(pruned, "Pruned released devices");
        }
        updated
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("message_types", &self.registry.len())
            .field("sinks", &self.sinks.read().len())
            .field("messages_sent", &self.messages_sent())
            .finish()
    }
}
