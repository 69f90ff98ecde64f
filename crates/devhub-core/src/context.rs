//! Registration contexts and the per-plugin ownership arena
//!
//! A [`RegistrationContext`] is the host-wide scope: it owns the
//! [`Connection`] and one [`PluginContext`] per loaded plugin. Everything a
//! plugin creates (device tokens, message type handles) is moved into its
//! plugin context's arena, which alone decides when those objects are torn
//! down. Plugins keep [`ObjectHandle`]s, which stop resolving once the arena
//! has released the object.

use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::device_token::DeviceToken;
use crate::error::{panic_message, DevhubError, Result};
use crate::message_type::MessageType;

/// An object whose teardown is controlled by a plugin context
pub trait Deletable: Send + Sync + 'static {
    /// Release resources before the arena drops its reference.
    /// Called exactly once.
    fn teardown(&self) {}
}

impl Deletable for DeviceToken {
    fn teardown(&self) {
        self.release();
    }
}

impl Deletable for MessageType {}

/// Callback a plugin registers to probe for hardware on demand
pub type HardwareDetectCallback =
    Box<dyn FnMut(&Arc<PluginContext>) -> anyhow::Result<()> + Send + 'static>;

/// Arena slot identifier, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

struct Owned<T: Deletable> {
    object: Arc<T>,
}

impl<T: Deletable> Deletable for Owned<T> {
    fn teardown(&self) {
        self.object.teardown();
    }
}

/// Non-owning reference to an object held by a plugin context
pub struct ObjectHandle<T: Deletable> {
    id: ObjectId,
    slot: Weak<Owned<T>>,
}

impl<T: Deletable> ObjectHandle<T> {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Resolve the handle; `None` once the owning context released the object
    pub fn get(&self) -> Option<Arc<T>> {
        self.slot.upgrade().map(|owned| owned.object.clone())
    }

    pub fn is_alive(&self) -> bool {
        self.slot.strong_count() > 0
    }
}

impl<T: Deletable> Clone for ObjectHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            slot: self.slot.clone(),
        }
    }
}

impl<T: Deletable> std::fmt::Debug for ObjectHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[derive(Default)]
struct Arena {
    entries: Vec<(ObjectId, Arc<dyn Deletable>)>,
    closed: bool,
}

/// Per-plugin scope owning every object the plugin registered
pub struct PluginContext {
    name: String,
    parent: Weak<RegistrationContext>,
    arena: Mutex<Arena>,
    detect_callbacks: Mutex<Vec<HardwareDetectCallback>>,
}

impl PluginContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<Arc<RegistrationContext>> {
        self.parent.upgrade()
    }

    /// The connection of the parent registration context, if any
    pub fn retrieve_connection(&self) -> Option<Arc<Connection>> {
        self.parent().and_then(|p| p.retrieve_connection())
    }

    fn require_connection(&self) -> Result<Arc<Connection>> {
        self.retrieve_connection()
            .ok_or(DevhubError::UnavailableConnection)
    }

    /// Combine this plugin's name with a device name: `plugin/device`
    pub fn qualified_name(&self, device: &str) -> Result<String> {
        if device.trim().is_empty() || device.contains('\0') {
            return Err(DevhubError::InvalidName(device.to_string()));
        }
        Ok(format!("{}/{}", self.name, device))
    }

    pub fn is_closed(&self) -> bool {
        self.arena.lock().closed
    }

    /// Number of objects currently owned by this context
    pub fn object_count(&self) -> usize {
        self.arena.lock().entries.len()
    }

    /// Move `object` into the arena and return a handle to it
    ///
    /// On failure the object is dropped here, so the caller never ends up
    /// owning a half-registered value.
    pub fn register_for_deletion<T: Deletable>(&self, object: Arc<T>) -> Result<ObjectHandle<T>> {
        let owned = Arc::new(Owned { object });
        let id = ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed));
        let handle = ObjectHandle {
            id,
            slot: Arc::downgrade(&owned),
        };

        let mut arena = self.arena.lock();
        if arena.closed {
            drop(arena);
            owned.teardown();
            return Err(DevhubError::ContextClosed(self.name.clone()));
        }
        arena.entries.push((id, owned));
        debug!(plugin = %self.name, object = %id, "Registered object for deletion");
        Ok(handle)
    }

    /// Register a message type through the connection and keep a handle to it
    pub fn register_message_type(&self, name: &str) -> Result<ObjectHandle<MessageType>> {
        let conn = self.require_connection()?;
        let msg = conn.register_message_type(name)?;
        self.register_for_deletion(msg)
    }

    /// Create a host-polled device named `plugin/device`
    pub fn create_sync_device(&self, device: &str) -> Result<ObjectHandle<DeviceToken>> {
        let name = self.qualified_name(device)?;
        let conn = self.require_connection()?;
        self.register_for_deletion(DeviceToken::create_sync(name, conn)?)
    }

    /// Create a self-driven device named `plugin/device`
    pub fn create_async_device(&self, device: &str) -> Result<ObjectHandle<DeviceToken>> {
        let name = self.qualified_name(device)?;
        let conn = self.require_connection()?;
        self.register_for_deletion(DeviceToken::create_async(name, conn)?)
    }

    pub fn register_hardware_detect_callback(&self, callback: HardwareDetectCallback) -> Result<()> {
        let arena = self.arena.lock();
        if arena.closed {
            drop(arena);
            drop(callback);
            return Err(DevhubError::ContextClosed(self.name.clone()));
        }
        self.detect_callbacks.lock().push(callback);
        Ok(())
    }

    /// Run every hardware detect callback once
    ///
    /// All callbacks run even if one fails; the first failure is returned.
    pub fn trigger_hardware_detect(self: &Arc<Self>) -> Result<()> {
        // Callbacks may register devices or further callbacks, so run them unlocked
        let mut callbacks = std::mem::take(&mut *self.detect_callbacks.lock());
        let mut first_error = None;

        for callback in callbacks.iter_mut() {
            let failure = match catch_unwind(AssertUnwindSafe(|| callback(self))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            warn!(plugin = %self.name, error = %failure, "Hardware detect callback failed");
            first_error.get_or_insert(DevhubError::CallbackFailed(failure));
        }

        // Put the callbacks back only while the arena is still open
        let discarded = {
            let arena = self.arena.lock();
            if arena.closed {
                Some(callbacks)
            } else {
                let mut slot = self.detect_callbacks.lock();
                let added = std::mem::take(&mut *slot);
                *slot = callbacks;
                slot.extend(added);
                None
            }
        };
        drop(discarded);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tear down every owned object in reverse registration order
    ///
    /// Async devices are stopped and joined before the arena lets go of
    /// them. Calling this again is a no-op.
    pub fn teardown(&self) {
        let entries = {
            let mut arena = self.arena.lock();
            if arena.closed {
                return;
            }
            arena.closed = true;
            std::mem::take(&mut arena.entries)
        };
        self.detect_callbacks.lock().clear();

        let count = entries.len();
        for (id, object) in entries.into_iter().rev() {
            object.teardown();
            drop(object);
            debug!(plugin = %self.name, object = %id, "Released object");
        }
        info!(plugin = %self.name, objects = count, "Plugin context torn down");
    }
}

impl Drop for PluginContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("name", &self.name)
            .field("objects", &self.object_count())
            .finish()
    }
}

/// Host-wide scope: owns the connection and all plugin contexts
pub struct RegistrationContext {
    connection: RwLock<Option<Arc<Connection>>>,
    plugins: Mutex<Vec<Arc<PluginContext>>>,
}

impl RegistrationContext {
    /// Create a context with no connection attached
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connection: RwLock::new(None),
            plugins: Mutex::new(Vec::new()),
        })
    }

    /// Create a context with `connection` already attached
    pub fn with_connection(connection: Arc<Connection>) -> Arc<Self> {
        let ctx = Self::new();
        *ctx.connection.write() = Some(connection);
        ctx
    }

    /// Attach the connection; a context carries at most one
    pub fn attach_connection(&self, connection: Arc<Connection>) -> Result<()> {
        let mut slot = self.connection.write();
        if slot.is_some() {
            return Err(DevhubError::DuplicateRegistration("connection".into()));
        }
        *slot = Some(connection);
        Ok(())
    }

    /// The attached connection; `None` is a signal callers must check
    pub fn retrieve_connection(&self) -> Option<Arc<Connection>> {
        self.connection.read().clone()
    }

    /// Create the context for a newly loaded plugin
    pub fn add_plugin(self: &Arc<Self>, name: &str) -> Result<Arc<PluginContext>> {
        if name.trim().is_empty() || name.contains('/') || name.contains('\0') {
            return Err(DevhubError::InvalidName(name.to_string()));
        }
        let mut plugins = self.plugins.lock();
        if plugins.iter().any(|p| p.name == name) {
            return Err(DevhubError::DuplicateRegistration(format!("plugin {}", name)));
        }
        let plugin = Arc::new(PluginContext {
            name: name.to_string(),
            parent: Arc::downgrade(self),
            arena: Mutex::new(Arena::default()),
            detect_callbacks: Mutex::new(Vec::new()),
        });
        plugins.push(plugin.clone());
        info!(plugin = %name, "Added plugin context");
        Ok(plugin)
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<PluginContext>> {
        self.plugins.lock().iter().find(|p| p.name == name).cloned()
    }

    /// Loaded plugins in load order
    pub fn plugins(&self) -> Vec<Arc<PluginContext>> {
        self.plugins.lock().clone()
    }

    /// Remove a plugin and tear down everything it owns
    pub fn unload_plugin(&self, name: &str) -> Result<()> {
        let plugin = {
            let mut plugins = self.plugins.lock();
            let idx = plugins
                .iter()
                .position(|p| p.name == name)
                .ok_or_else(|| DevhubError::InvalidArgument(format!("no plugin named {}", name)))?;
            plugins.remove(idx)
        };
        plugin.teardown();
        info!(plugin = %name, "Unloaded plugin");
        Ok(())
    }

    /// Run the hardware detect callbacks of every plugin
    ///
    /// Returns the number of plugins whose callbacks all succeeded.
    pub fn trigger_hardware_detect(&self) -> usize {
        let plugins = self.plugins();
        plugins
            .iter()
            .filter(|p| p.trigger_hardware_detect().is_ok())
            .count()
    }

    /// One host tick over every synchronous device
    pub fn tick(&self) -> usize {
        self.retrieve_connection()
            .map(|conn| conn.process_devices())
            .unwrap_or(0)
    }

    /// Unload every plugin, most recently loaded first
    pub fn teardown(&self) {
        let plugins = std::mem::take(&mut *self.plugins.lock());
        for plugin in plugins.iter().rev() {
            plugin.teardown();
        }
    }
}

impl Drop for RegistrationContext {
    fn drop(&mut self) {
        self.teardown();
    }
}
