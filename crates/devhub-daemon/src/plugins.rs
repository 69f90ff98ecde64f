//! Built-in demo plugins
//!
//! These register through the plugin kit exactly as an external plugin
//! would, which makes them a useful smoke test of the whole host.

use devhub_pluginkit::{
    device_async_init, device_async_start_wait_loop, device_register_message_type,
    device_send_data, device_sync_init, device_sync_register_update_callback, register_hardware_detect_callback,
    Plugin, PluginRegContext, ReturnCode,
};
use std::time::Duration;
use tracing::debug;

use crate::config::{PluginConfig, PluginKind};

/// Number of samples in one period of the sampler waveform
const SAMPLES_PER_PERIOD: u64 = 40;

/// Instantiate the built-in plugin described by `config`
pub fn builtin(config: &PluginConfig) -> Box<dyn Plugin> {
    match config.kind {
        PluginKind::Heartbeat => Box::new(HeartbeatPlugin {
            config: config.clone(),
        }),
        PluginKind::Sampler => Box::new(SamplerPlugin {
            config: config.clone(),
        }),
    }
}

/// Synchronous device sending an incrementing counter every host tick
pub struct HeartbeatPlugin {
    config: PluginConfig,
}

impl Plugin for HeartbeatPlugin {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn register(&self, ctx: PluginRegContext) -> ReturnCode {
        let mut msg = None;
        if device_register_message_type(Some(&ctx), &self.config.message_type, &mut msg) == ReturnCode::Failure {
            return ReturnCode::Failure;
        }
        let mut dev = None;
        if device_sync_init(Some(&ctx), &self.config.device, &mut dev) == ReturnCode::Failure {
            return ReturnCode::Failure;
        }

        let (cb_dev, cb_msg) = (dev.clone(), msg);
        let mut beat: u64 = 0;
        let code = device_sync_register_update_callback(dev.as_ref(), move || {
            let code = device_send_data(cb_dev.as_ref(), cb_msg.as_ref(), &beat.to_le_bytes());
            beat += 1;
            code
        });
        if code == ReturnCode::Failure {
            return code;
        }

        // The pulse device is virtual, so detection only reports it
        let probe_dev = dev;
        register_hardware_detect_callback(Some(&ctx), move |ctx| {
            let alive = probe_dev.as_ref().is_some_and(|d| d.is_alive());
            debug!(plugin = %ctx.plugin_name().unwrap_or_default(), alive, "Heartbeat detect");
            if alive {
                ReturnCode::Success
            } else {
                ReturnCode::Failure
            }
        })
    }
}

/// Asynchronous device sampling a sine wave on its own thread
///
/// Each payload is the sample index (u64 LE) followed by the value (f32 LE).
pub struct SamplerPlugin {
    config: PluginConfig,
}

impl Plugin for SamplerPlugin {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn register(&self, ctx: PluginRegContext) -> ReturnCode {
        let mut msg = None;
        if device_register_message_type(Some(&ctx), &self.config.message_type, &mut msg) == ReturnCode::Failure {
            return ReturnCode::Failure;
        }
        let mut dev = None;
        if device_async_init(Some(&ctx), &self.config.device, &mut dev) == ReturnCode::Failure {
            return ReturnCode::Failure;
        }

        let interval = Duration::from_millis(self.config.interval_ms);
        let (cb_dev, cb_msg) = (dev.clone(), msg);
        let mut index: u64 = 0;
        device_async_start_wait_loop(dev.as_ref(), move || {
            // Stand-in for blocking on hardware
            std::thread::sleep(interval);
            let payload = encode_sample(index, sample_value(index));
            index += 1;
            let code = device_send_data(cb_dev.as_ref(), cb_msg.as_ref(), &payload);
            if code == ReturnCode::Failure {
                debug!("Sampler device released, ending wait loop");
            }
            code
        })
    }
}

fn sample_value(index: u64) -> f32 {
    let phase = (index % SAMPLES_PER_PERIOD) as f32 / SAMPLES_PER_PERIOD as f32;
    (phase * std::f32::consts::TAU).sin()
}

fn encode_sample(index: u64, value: f32) -> [u8; 12] {
    let mut payload = [0u8; 12];
    payload[..8].copy_from_slice(&index.to_le_bytes());
    payload[8..].copy_from_slice(&value.to_le_bytes());
    payload
}
