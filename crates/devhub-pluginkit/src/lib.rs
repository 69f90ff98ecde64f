//! Devhub PluginKit - the handle-based surface plugins register devices through
//!
//! Plugins never touch core types directly. They receive a
//! [`PluginRegContext`] and get back opaque handles from calls that report
//! [`ReturnCode::Success`] or [`ReturnCode::Failure`] and write their result
//! through an out-parameter. Missing handles, wrong device variants,
//! internal errors, and panics all come back as `Failure`; nothing unwinds
//! into the plugin.

pub mod plugin;

pub use plugin::{load_plugin, Plugin};

use devhub_core::{
    error::panic_message, Deletable, DevhubError, DeviceToken, LoopControl, MessageType,
    ObjectHandle, PluginContext,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// Status of every plugin-facing call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Success,
    Failure,
}

impl ReturnCode {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Handle to the registration scope of one plugin
#[derive(Clone)]
pub struct PluginRegContext {
    inner: Weak<PluginContext>,
}

impl PluginRegContext {
    pub fn new(context: &Arc<PluginContext>) -> Self {
        Self {
            inner: Arc::downgrade(context),
        }
    }

    /// Name of the plugin, if its context is still loaded
    pub fn plugin_name(&self) -> Option<String> {
        self.inner.upgrade().map(|ctx| ctx.name().to_string())
    }

    fn resolve(&self) -> devhub_core::Result<Arc<PluginContext>> {
        self.inner
            .upgrade()
            .ok_or_else(|| DevhubError::ContextClosed("unloaded plugin".into()))
    }
}

impl std::fmt::Debug for PluginRegContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PluginRegContext")
            .field(&self.plugin_name())
            .finish()
    }
}

/// Handle to a device token owned by a plugin context
#[derive(Debug, Clone)]
pub struct DeviceTokenHandle(ObjectHandle<DeviceToken>);

impl DeviceTokenHandle {
    fn resolve(&self) -> devhub_core::Result<Arc<DeviceToken>> {
        self.0
            .get()
            .ok_or_else(|| DevhubError::InvalidArgument("device token has been released".into()))
    }

    pub fn is_alive(&self) -> bool {
        self.0.is_alive()
    }
}

/// Handle to a registered message type
#[derive(Debug, Clone)]
pub struct MessageTypeHandle(ObjectHandle<MessageType>);

impl MessageTypeHandle {
    fn resolve(&self) -> devhub_core::Result<Arc<MessageType>> {
        self.0
            .get()
            .ok_or_else(|| DevhubError::InvalidArgument("message type has been released".into()))
    }

    /// Host-assigned id, while the handle is live
    pub fn id(&self) -> Option<devhub_core::MessageTypeId> {
        self.0.get().map(|m| m.id())
    }
}

fn require<'a, T>(what: &'static str, handle: Option<&'a T>) -> devhub_core::Result<&'a T> {
    handle.ok_or(DevhubError::NullHandle(what))
}

/// Run a boundary operation, folding errors and panics into `Failure`
fn guarded<F>(operation: &'static str, f: F) -> ReturnCode
where
    F: FnOnce() -> devhub_core::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => ReturnCode::Success,
        Ok(Err(e)) => {
            warn!(operation, error = %e, "Plugin call failed");
            ReturnCode::Failure
        }
        Err(payload) => {
            error!(
                operation,
                panic = %panic_message(payload.as_ref()),
                "Plugin call panicked"
            );
            ReturnCode::Failure
        }
    }
}

/// Send `bytes` as a message of type `msg` from device `dev`
pub fn device_send_data(
    dev: Option<&DeviceTokenHandle>,
    msg: Option<&MessageTypeHandle>,
    bytes: &[u8],
) -> ReturnCode {
    guarded("device_send_data", || {
        let dev = require("device_send_data device token", dev)?;
        let msg = require("device_send_data message type", msg)?;
        debug!(len = bytes.len(), "Sending device data");
        dev.resolve()?.send_data(&msg.resolve()?, bytes)
    })
}

/// Register a message type by name; an existing name yields the same identity
pub fn device_register_message_type(
    ctx: Option<&PluginRegContext>,
    name: &str,
    out: &mut Option<MessageTypeHandle>,
) -> ReturnCode {
    guarded("device_register_message_type", || {
        let ctx = require("device_register_message_type", ctx)?.resolve()?;
        debug!(plugin = %ctx.name(), message_type = %name, "Registering message type");
        *out = Some(MessageTypeHandle(ctx.register_message_type(name)?));
        Ok(())
    })
}

/// Create a synchronous device named `plugin/name`
pub fn device_sync_init(
    ctx: Option<&PluginRegContext>,
    name: &str,
    out: &mut Option<DeviceTokenHandle>,
) -> ReturnCode {
    guarded("device_sync_init", || {
        let ctx = require("device_sync_init", ctx)?.resolve()?;
        *out = Some(DeviceTokenHandle(ctx.create_sync_device(name)?));
        Ok(())
    })
}

/// Create an asynchronous device named `plugin/name`
pub fn device_async_init(
    ctx: Option<&PluginRegContext>,
    name: &str,
    out: &mut Option<DeviceTokenHandle>,
) -> ReturnCode {
    guarded("device_async_init", || {
        let ctx = require("device_async_init", ctx)?.resolve()?;
        *out = Some(DeviceTokenHandle(ctx.create_async_device(name)?));
        Ok(())
    })
}

/// Set the update callback of a synchronous device
///
/// The callback runs on the host thread once per tick. Returning `Failure`
/// is logged by the host; the device keeps being polled.
pub fn device_sync_register_update_callback<F>(dev: Option<&DeviceTokenHandle>, mut callback: F) -> ReturnCode
where
    F: FnMut() -> ReturnCode + Send + 'static,
{
    guarded("device_sync_register_update_callback", || {
        let token = require("device_sync_register_update_callback device token", dev)?.resolve()?;
        let sync = token.require_sync()?;
        sync.set_update_callback(Box::new(move || -> anyhow::Result<()> {
            match callback() {
                ReturnCode::Success => Ok(()),
                ReturnCode::Failure => anyhow::bail!("update callback reported failure"),
            }
        }));
        Ok(())
    })
}

/// Set the wait callback of an asynchronous device and start its loop
///
/// The callback runs repeatedly on the device's own thread. Returning
/// `Failure` ends the loop.
pub fn device_async_start_wait_loop<F>(dev: Option<&DeviceTokenHandle>, mut callback: F) -> ReturnCode
where
    F: FnMut() -> ReturnCode + Send + 'static,
{
    guarded("device_async_start_wait_loop", || {
        let token = require("device_async_start_wait_loop device token", dev)?.resolve()?;
        let asyncdev = token.require_async()?;
        asyncdev.set_wait_callback(Box::new(move || -> anyhow::Result<LoopControl> {
            Ok(match callback() {
                ReturnCode::Success => LoopControl::Continue,
                ReturnCode::Failure => LoopControl::Stop,
            })
        }))?;
        asyncdev.start_wait_loop()
    })
}

/// Register a callback the host runs when asked to look for new hardware
pub fn register_hardware_detect_callback<F>(ctx: Option<&PluginRegContext>, mut callback: F) -> ReturnCode
where
    F: FnMut(&PluginRegContext) -> ReturnCode + Send + 'static,
{
    guarded("register_hardware_detect_callback", || {
        let ctx = require("register_hardware_detect_callback", ctx)?.resolve()?;
        ctx.register_hardware_detect_callback(Box::new(move |plugin: &Arc<PluginContext>| -> anyhow::Result<()> {
            match callback(&PluginRegContext::new(plugin)) {
                ReturnCode::Success => Ok(()),
                ReturnCode::Failure => anyhow::bail!("hardware detect callback reported failure"),
            }
        }))
    })
}

/// Hand ownership of `object` to the plugin context
///
/// On `Failure` the object has already been released.
pub fn register_object_for_deletion<T: Deletable>(
    ctx: Option<&PluginRegContext>,
    object: T,
    out: &mut Option<ObjectHandle<T>>,
) -> ReturnCode {
    guarded("register_object_for_deletion", || {
        let ctx = require("register_object_for_deletion", ctx)?.resolve()?;
        *out = Some(ctx.register_for_deletion(Arc::new(object))?);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use devhub_core::{AsyncState, Connection, DeviceMessage, MessageSink, RegistrationContext};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Collect(Mutex<Vec<DeviceMessage>>);

    impl MessageSink for Collect {
        fn deliver(&self, message: &DeviceMessage) {
            self.0.lock().push(message.clone());
        }
    }

    fn host() -> (Arc<RegistrationContext>, Arc<Connection>, Arc<Collect>) {
        let conn = Connection::new();
        let sink = Arc::new(Collect::default());
        conn.add_sink(sink.clone());
        (RegistrationContext::with_connection(conn.clone()), conn, sink)
    }

    fn plugin_ctx(reg: &Arc<RegistrationContext>, name: &str) -> PluginRegContext {
        PluginRegContext::new(&reg.add_plugin(name).unwrap())
    }

    #[test]
    fn test_null_handles_fail_without_side_effects() {
        let (reg, conn, sink) = host();
        let ctx = plugin_ctx(&reg, "nulls");

        let mut msg_out = None;
        assert_eq!(device_register_message_type(None, "raw", &mut msg_out), ReturnCode::Failure);
        assert!(msg_out.is_none());
        assert!(conn.message_types().is_empty());

        let mut dev_out = None;
        assert_eq!(device_sync_init(None, "dev", &mut dev_out), ReturnCode::Failure);
        assert_eq!(device_async_init(None, "dev", &mut dev_out), ReturnCode::Failure);
        assert!(dev_out.is_none());
        assert!(conn.device_names().is_empty());

        assert_eq!(device_send_data(None, None, b"x"), ReturnCode::Failure);
        assert_eq!(
            device_sync_register_update_callback(None, || ReturnCode::Success),
            ReturnCode::Failure
        );
        assert_eq!(
            device_async_start_wait_loop(None, || ReturnCode::Success),
            ReturnCode::Failure
        );
        assert_eq!(
            register_hardware_detect_callback(None, |_: &PluginRegContext| ReturnCode::Success),
            ReturnCode::Failure
        );

        // A valid device with a null message type still sends nothing
        assert_eq!(device_sync_init(Some(&ctx), "dev", &mut dev_out), ReturnCode::Success);
        assert_eq!(device_send_data(dev_out.as_ref(), None, b"x"), ReturnCode::Failure);
        assert_eq!(conn.messages_sent(), 0);
        assert!(sink.0.lock().is_empty());
    }

    #[test]
    fn test_sync_device_round_trip() {
        let (reg, conn, sink) = host();
        let ctx = plugin_ctx(&reg, "vendor");

        let mut msg = None;
        assert!(device_register_message_type(Some(&ctx), "button", &mut msg).is_success());
        let mut dev = None;
        assert!(device_sync_init(Some(&ctx), "pad", &mut dev).is_success());

        let (dev, msg) = (dev.unwrap(), msg.unwrap());
        let (cb_dev, cb_msg) = (dev.clone(), msg.clone());
        assert!(device_sync_register_update_callback(Some(&dev), move || {
            device_send_data(Some(&cb_dev), Some(&cb_msg), &[1])
        })
        .is_success());

        assert_eq!(conn.process_devices(), 1);
        assert_eq!(conn.process_devices(), 1);
        let received = sink.0.lock();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].device, "vendor/pad");
        assert_eq!(received[0].message_type.name(), "button");
    }

    #[test]
    fn test_message_type_registration_aliases_across_calls() {
        let (reg, _, _) = host();
        let ctx = plugin_ctx(&reg, "alias");
        let (mut a, mut b) = (None, None);
        assert!(device_register_message_type(Some(&ctx), "pose", &mut a).is_success());
        assert!(device_register_message_type(Some(&ctx), "pose", &mut b).is_success());
        assert_eq!(a.unwrap().id(), b.unwrap().id());

        let mut bad = None;
        assert_eq!(device_register_message_type(Some(&ctx), "", &mut bad), ReturnCode::Failure);
        assert!(bad.is_none());
    }

    #[test]
    fn test_wrong_capability_is_failure() {
        let (reg, _, _) = host();
        let ctx = plugin_ctx(&reg, "mixed");
        let (mut sync, mut asyn) = (None, None);
        assert!(device_sync_init(Some(&ctx), "s", &mut sync).is_success());
        assert!(device_async_init(Some(&ctx), "a", &mut asyn).is_success());

        assert_eq!(
            device_async_start_wait_loop(sync.as_ref(), || ReturnCode::Failure),
            ReturnCode::Failure
        );
        assert_eq!(
            device_sync_register_update_callback(asyn.as_ref(), || ReturnCode::Success),
            ReturnCode::Failure
        );
    }

    #[test]
    fn test_async_loop_through_boundary() {
        let (reg, _, sink) = host();
        let ctx = plugin_ctx(&reg, "imu");
        let (mut dev, mut msg) = (None, None);
        assert!(device_register_message_type(Some(&ctx), "accel", &mut msg).is_success());
        assert!(device_async_init(Some(&ctx), "accel0", &mut dev).is_success());
        let (dev, msg) = (dev.unwrap(), msg.unwrap());

        let remaining = Arc::new(AtomicU32::new(3));
        let (cb_dev, cb_msg, left) = (dev.clone(), msg.clone(), remaining.clone());
        assert!(device_async_start_wait_loop(Some(&dev), move || {
            if left.fetch_sub(1, Ordering::SeqCst) == 0 {
                return ReturnCode::Failure;
            }
            std::thread::sleep(Duration::from_millis(1));
            device_send_data(Some(&cb_dev), Some(&cb_msg), b"xyz")
        })
        .is_success());

        // A second start is rejected
        assert_eq!(
            device_async_start_wait_loop(Some(&dev), || ReturnCode::Success),
            ReturnCode::Failure
        );

        while sink.0.lock().len() < 3 {
            std::thread::sleep(Duration::from_millis(1));
        }
        reg.unload_plugin("imu").unwrap();
        assert!(!dev.is_alive());
        assert_eq!(sink.0.lock().len(), 3);
        assert_eq!(device_send_data(Some(&dev), Some(&msg), b"late"), ReturnCode::Failure);
    }

    #[test]
    fn test_async_loop_stops_on_unload_while_running() {
        let (reg, _, _) = host();
        let plugin = reg.add_plugin("spin").unwrap();
        let ctx = PluginRegContext::new(&plugin);
        let mut dev = None;
        assert!(device_async_init(Some(&ctx), "spinner", &mut dev).is_success());
        let dev = dev.unwrap();
        let token = dev.resolve().unwrap();

        assert!(device_async_start_wait_loop(Some(&dev), || {
            std::thread::sleep(Duration::from_millis(1));
            ReturnCode::Success
        })
        .is_success());
        assert_eq!(token.as_async().unwrap().state(), AsyncState::Running);

        drop(plugin);
        reg.unload_plugin("spin").unwrap();
        assert_eq!(token.as_async().unwrap().state(), AsyncState::Stopped);
    }

    #[test]
    fn test_calls_on_unloaded_context_fail() {
        let (reg, _, _) = host();
        let ctx = plugin_ctx(&reg, "gone");
        reg.unload_plugin("gone").unwrap();

        let mut dev = None;
        assert_eq!(device_sync_init(Some(&ctx), "dev", &mut dev), ReturnCode::Failure);
        assert!(dev.is_none());
        assert!(ctx.plugin_name().is_none());
    }

    #[test]
    fn test_register_object_for_deletion() {
        struct Resource(Arc<AtomicU32>);
        impl Deletable for Resource {
            fn teardown(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (reg, _, _) = host();
        let ctx = plugin_ctx(&reg, "owner");
        let torn = Arc::new(AtomicU32::new(0));

        let mut out = None;
        assert_eq!(
            register_object_for_deletion(None, Resource(torn.clone()), &mut out),
            ReturnCode::Failure
        );
        assert!(out.is_none());

        assert!(register_object_for_deletion(Some(&ctx), Resource(torn.clone()), &mut out).is_success());
        let handle = out.unwrap();
        assert!(handle.is_alive());

        reg.teardown();
        assert_eq!(torn.load(Ordering::SeqCst), 1);
        assert!(handle.get().is_none());
    }

    #[test]
    fn test_hardware_detect_through_boundary() {
        let (reg, conn, _) = host();
        let ctx = plugin_ctx(&reg, "hotplug");
        let found = Arc::new(Mutex::new(Vec::new()));
        let store = found.clone();
        assert!(register_hardware_detect_callback(Some(&ctx), move |ctx: &PluginRegContext| {
            let mut dev = None;
            let code = device_sync_init(Some(ctx), "probe", &mut dev);
            store.lock().extend(dev);
            code
        })
        .is_success());

        assert_eq!(reg.trigger_hardware_detect(), 1);
        assert_eq!(found.lock().len(), 1);
        assert_eq!(conn.device_names(), vec!["hotplug/probe".to_string()]);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let (reg, conn, _) = host();
        let ctx = plugin_ctx(&reg, "panicky");
        let mut dev = None;
        assert!(device_sync_init(Some(&ctx), "bad", &mut dev).is_success());
        assert!(device_sync_register_update_callback(dev.as_ref(), || panic!("driver bug")).is_success());
        assert_eq!(conn.process_devices(), 0);
    }
}
