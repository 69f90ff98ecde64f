//! Plugin entry point and loading into a registration context
//!
//! How plugin code reaches the process (static linking, a loader) is up to
//! the host; this module only covers what happens once a [`Plugin`] value
//! is in hand.

use devhub_core::{error::panic_message, DevhubError, PluginContext, RegistrationContext, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{info, warn};

use crate::{PluginRegContext, ReturnCode};

/// A component contributing devices to the host
pub trait Plugin: Send + Sync {
    /// Plugin name, used as the prefix of every device it creates
    fn name(&self) -> &str;

    /// Create devices and message types; called once when the plugin loads
    fn register(&self, ctx: PluginRegContext) -> ReturnCode;
}

/// Create a plugin context for `plugin` and run its registration
///
/// If registration reports `Failure` or panics, everything the plugin
/// managed to create is torn down and the context is removed again.
pub fn load_plugin(host: &Arc<RegistrationContext>, plugin: &dyn Plugin) -> Result<Arc<PluginContext>> {
    let name = plugin.name().to_string();
    let context = host.add_plugin(&name)?;
    let handle = PluginRegContext::new(&context);

    let failure = match catch_unwind(AssertUnwindSafe(|| plugin.register(handle))) {
        Ok(ReturnCode::Success) => None,
        Ok(ReturnCode::Failure) => Some("registration reported failure".to_string()),
        Err(payload) => Some(format!("registration panicked: {}", panic_message(payload.as_ref()))),
    };

    if let Some(reason) = failure {
        warn!(plugin = %name, reason = %reason, "Plugin failed to load");
        host.unload_plugin(&name)?;
        return Err(DevhubError::CallbackFailed(format!("{}: {}", name, reason)));
    }

    info!(plugin = %name, objects = context.object_count(), "Plugin loaded");
    Ok(context)
}
