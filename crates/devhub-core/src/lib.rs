//! Devhub Core - device tokens, message types, and plugin ownership
//!
//! This crate provides the runtime pieces a host uses to accept devices
//! from plugins and route their data:
//! - Message type registry assigning stable ids to named data categories
//! - Connection hub fanning device messages out to sinks and subscribers
//! - Device tokens in synchronous (host-polled) and asynchronous (self-driven) variants
//! - Plugin contexts owning everything a plugin registers, torn down on unload

pub mod connection;
pub mod context;
pub mod device_token;
pub mod error;
pub mod message_type;

pub use connection::{Connection, DeviceMessage, MessageSink};
pub use context::{Deletable, HardwareDetectCallback, ObjectHandle, ObjectId, PluginContext, RegistrationContext};
pub use device_token::{
    AsyncDevice, AsyncState, DeviceKind, DeviceToken, ExecutionModel, LoopControl, SyncDevice,
    SyncState, UpdateCallback, WaitCallback,
};
pub use error::{DevhubError, Result};
pub use message_type::{MessageType, MessageTypeId, MessageTypeRegistry};
