//! Message type descriptors and the per-connection registry
//!
//! A message type is a named category of data a device may emit. The host
//! assigns each name a numeric id the first time it is registered; later
//! registrations of the same name alias the existing descriptor, so every
//! plugin that asks for `"tracker/pose"` ends up holding the same identity.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{DevhubError, Result};

/// Host-assigned numeric identifier of a message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageTypeId(pub u32);

impl std::fmt::Display for MessageTypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable descriptor for a category of device data
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageType {
    id: MessageTypeId,
    name: String,
}

impl MessageType {
    pub fn id(&self) -> MessageTypeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    by_name: HashMap<String, Arc<MessageType>>,
    /// Indexed by id; ids are dense and never reused
    by_id: Vec<Arc<MessageType>>,
}

/// Name-keyed store of message types, safe to read while plugins register
#[derive(Debug, Default)]
pub struct MessageTypeRegistry {
    inner: RwLock<RegistryInner>,
}

impl MessageTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a name, or return the descriptor already registered under it
    pub fn register(&self, name: &str) -> Result<Arc<MessageType>> {
        let name = validate_name(name)?;

        if let Some(existing) = self.get(name) {
            debug!(message_type = %existing, "Message type already registered, aliasing");
            return Ok(existing);
        }

        let mut inner = self.inner.write();
        // Another registrant may have won the race between the read and write locks
        if let Some(existing) = inner.by_name.get(name) {
            return Ok(existing.clone());
        }

        let id = u32::try_from(inner.by_id.len())
            .map(MessageTypeId)
            .map_err(|_| DevhubError::AllocationFailure("message type ids exhausted".into()))?;
        let msg = Arc::new(MessageType {
            id,
            name: name.to_string(),
        });
        inner.by_name.insert(name.to_string(), msg.clone());
        inner.by_id.push(msg.clone());

        debug!(message_type = %msg, "Registered message type");
        Ok(msg)
    }

    /// Look up a message type by name
    pub fn get(&self, name: &str) -> Option<Arc<MessageType>> {
        self.inner.read().by_name.get(name).cloned()
    }

    /// Look up a message type by its host-assigned id
    pub fn get_by_id(&self, id: MessageTypeId) -> Option<Arc<MessageType>> {
        self.inner.read().by_id.get(id.0 as usize).cloned()
    }

    /// Whether `msg` is the exact descriptor this registry handed out
    pub fn contains(&self, msg: &MessageType) -> bool {
        self.inner
            .read()
            .by_id
            .get(msg.id.0 as usize)
            .is_some_and(|known| std::ptr::eq(known.as_ref(), msg))
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All registered message types in id order
    pub fn list(&self) -> Vec<Arc<MessageType>> {
        self.inner.read().by_id.clone()
    }
}

fn validate_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.len() != name.len() || name.contains('\0') {
        return Err(DevhubError::InvalidName(name.to_string()));
    }
    Ok(name)
}
