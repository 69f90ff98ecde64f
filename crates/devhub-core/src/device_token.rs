//! Device tokens: the capability a plugin holds for each device it creates
//!
//! A token is either synchronous (polled by the host tick through
//! [`SyncDevice::update`]) or asynchronous (driven by its own wait loop
//! thread, see [`AsyncDevice`]). The variant is fixed at construction and
//! the `as_sync` / `as_async` accessors return `None` on mismatch.

use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, DeviceMessage};
use crate::error::{panic_message, DevhubError, Result};
use crate::message_type::MessageType;

/// Host-invoked update callback of a synchronous device
pub type UpdateCallback = Box<dyn FnMut() -> anyhow::Result<()> + Send + 'static>;

/// Wait callback run repeatedly on an asynchronous device's loop thread
pub type WaitCallback = Box<dyn FnMut() -> anyhow::Result<LoopControl> + Send + 'static>;

/// What a wait callback asks the loop to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

/// How a device is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionModel {
    Synchronous,
    Asynchronous,
}

impl ExecutionModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synchronous => "synchronous",
            Self::Asynchronous => "asynchronous",
        }
    }
}

impl std::fmt::Display for ExecutionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two device variants
pub enum DeviceKind {
    Sync(SyncDevice),
    Async(AsyncDevice),
}

/// Identity and send path of one device instance
pub struct DeviceToken {
    name: String,
    connection: Arc<Connection>,
    kind: DeviceKind,
    released: AtomicBool,
}

impl DeviceToken {
    /// Create a host-polled device bound to `connection`
    pub fn create_sync(name: impl Into<String>, connection: Arc<Connection>) -> Result<Arc<Self>> {
        let name = name.into();
        let kind = DeviceKind::Sync(SyncDevice::new(name.clone()));
        Self::create(name, connection, kind)
    }

    /// Create a self-driven device bound to `connection`
    ///
    /// The wait loop does not start until [`AsyncDevice::start_wait_loop`].
    pub fn create_async(name: impl Into<String>, connection: Arc<Connection>) -> Result<Arc<Self>> {
        let name = name.into();
        let kind = DeviceKind::Async(AsyncDevice::new(name.clone()));
        Self::create(name, connection, kind)
    }

    fn create(name: String, connection: Arc<Connection>, kind: DeviceKind) -> Result<Arc<Self>> {
        if name.trim().is_empty() {
            return Err(DevhubError::InvalidName(name));
        }
        let token = Arc::new(Self {
            name,
            connection,
            kind,
            released: AtomicBool::new(false),
        });
        token.connection.attach_device(&token);
        info!(device = %token.name, model = %token.execution_model(), "Created device token");
        Ok(token)
    }

    /// Qualified `plugin/device` name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    pub fn execution_model(&self) -> ExecutionModel {
        match self.kind {
            DeviceKind::Sync(_) => ExecutionModel::Synchronous,
            DeviceKind::Async(_) => ExecutionModel::Asynchronous,
        }
    }

    pub fn as_sync(&self) -> Option<&SyncDevice> {
        match &self.kind {
            DeviceKind::Sync(dev) => Some(dev),
            DeviceKind::Async(_) => None,
        }
    }

    pub fn as_async(&self) -> Option<&AsyncDevice> {
        match &self.kind {
            DeviceKind::Async(dev) => Some(dev),
            DeviceKind::Sync(_) => None,
        }
    }

    /// Like [`as_sync`](Self::as_sync) but reports the mismatch as an error
    pub fn require_sync(&self) -> Result<&SyncDevice> {
        self.as_sync().ok_or(DevhubError::WrongCapability {
            expected: ExecutionModel::Synchronous.as_str(),
            actual: self.execution_model().as_str(),
        })
    }

    /// Like [`as_async`](Self::as_async) but reports the mismatch as an error
    pub fn require_async(&self) -> Result<&AsyncDevice> {
        self.as_async().ok_or(DevhubError::WrongCapability {
            expected: ExecutionModel::Asynchronous.as_str(),
            actual: self.execution_model().as_str(),
        })
    }

    /// Whether the owning context has torn this device down
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Detach the device from its plugin: drop the update callback or stop
    /// and join the wait loop. Later sends and ticks are refused.
    pub(crate) fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.kind {
            DeviceKind::Sync(dev) => dev.close(),
            DeviceKind::Async(dev) => dev.stop(),
        }
        debug!(device = %self.name, "Released device token");
    }

    /// Stamp `payload` with the current time and forward it to the connection
    ///
    /// `message_type` must have been registered on this token's connection.
    pub fn send_data(&self, message_type: &Arc<MessageType>, payload: &[u8]) -> Result<()> {
        if self.is_released() {
            return Err(DevhubError::InvalidArgument(format!(
                "device {} has been released",
                self.name
            )));
        }
        if !self.connection.message_types().contains(message_type) {
            return Err(DevhubError::InvalidArgument(format!(
                "message type {} is not registered on this connection",
                message_type
            )));
        }
        self.connection.send(DeviceMessage {
            device: self.name.clone(),
            message_type: message_type.clone(),
            timestamp: Utc::now(),
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

impl std::fmt::Debug for DeviceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceToken")
            .field("name", &self.name)
            .field("model", &self.execution_model())
            .finish()
    }
}

/// Update state of a synchronous device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Updating,
}

/// Host-polled device variant
pub struct SyncDevice {
    name: String,
    closed: AtomicBool,
    updating: AtomicBool,
    callback: Mutex<Option<UpdateCallback>>,
    updates: AtomicU64,
}

impl SyncDevice {
    fn new(name: String) -> Self {
        Self {
            name,
            closed: AtomicBool::new(false),
            updating: AtomicBool::new(false),
            callback: Mutex::new(None),
            updates: AtomicU64::new(0),
        }
    }

    /// Store the update callback; a later call replaces an earlier one
    ///
    /// Ignored once the device has been released.
    pub fn set_update_callback(&self, callback: UpdateCallback) {
        let mut slot = self.callback.lock();
        if self.closed.load(Ordering::Acquire) {
            drop(slot);
            warn!(device = %self.name, "Update callback set on released device, dropping it");
            return;
        }
        if slot.replace(callback).is_some() {
            debug!(device = %self.name, "Replaced update callback");
        }
    }

    fn close(&self) {
        let callback = {
            let mut slot = self.callback.lock();
            self.closed.store(true, Ordering::Release);
            slot.take()
        };
        drop(callback);
    }

    pub fn has_update_callback(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub fn state(&self) -> SyncState {
        if self.updating.load(Ordering::Acquire) {
            SyncState::Updating
        } else {
            SyncState::Idle
        }
    }

    /// Number of callback invocations that completed successfully
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// Invoke the update callback once; a no-op when none is set or the
    /// device has been released
    pub fn update(&self) -> Result<()> {
        if self
            .updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DevhubError::ReentrantUpdate(self.name.clone()));
        }

        // Take the callback out so it may replace itself without deadlocking
        let taken = self.callback.lock().take();
        let result = match taken {
            None => Ok(()),
            Some(mut callback) => {
                let outcome = catch_unwind(AssertUnwindSafe(|| callback()));
                let leftover = {
                    let mut slot = self.callback.lock();
                    if slot.is_none() && !self.closed.load(Ordering::Acquire) {
                        *slot = Some(callback);
                        None
                    } else {
                        Some(callback)
                    }
                };
                drop(leftover);
                match outcome {
                    Ok(Ok(())) => {
                        self.updates.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Ok(Err(e)) => Err(DevhubError::CallbackFailed(format!("{}: {:#}", self.name, e))),
                    Err(payload) => Err(DevhubError::CallbackFailed(format!(
                        "{} panicked: {}",
                        self.name,
                        panic_message(payload.as_ref())
                    ))),
                }
            }
        };

        self.updating.store(false, Ordering::Release);
        result
    }
}

/// Lifecycle of an asynchronous device's wait loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncState {
    Created,
    Running,
    StopRequested,
    Stopped,
}

impl AsyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::StopRequested => "stop requested",
            Self::Stopped => "stopped",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::StopRequested,
            _ => Self::Stopped,
        }
    }
}

struct LoopState {
    value: AtomicU8,
    owner: OnceLock<ThreadId>,
    lock: Mutex<()>,
    stopped: Condvar,
}

impl LoopState {
    fn new() -> Self {
        Self {
            value: AtomicU8::new(AsyncState::Created as u8),
            owner: OnceLock::new(),
            lock: Mutex::new(()),
            stopped: Condvar::new(),
        }
    }

    fn load(&self) -> AsyncState {
        AsyncState::from_u8(self.value.load(Ordering::Acquire))
    }

    fn store(&self, state: AsyncState) {
        self.value.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: AsyncState, to: AsyncState) -> bool {
        self.value
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish(&self) {
        let _guard = self.lock.lock();
        self.store(AsyncState::Stopped);
        self.stopped.notify_all();
    }

    fn wait_stopped(&self) {
        let mut guard = self.lock.lock();
        while self.load() != AsyncState::Stopped {
            self.stopped.wait(&mut guard);
        }
    }

    fn on_loop_thread(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }
}

/// Self-driven device variant owning a wait loop thread
pub struct AsyncDevice {
    name: String,
    state: Arc<LoopState>,
    callback: Mutex<Option<WaitCallback>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncDevice {
    fn new(name: String) -> Self {
        Self {
            name,
            state: Arc::new(LoopState::new()),
            callback: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> AsyncState {
        self.state.load()
    }

    /// Store the wait callback; allowed once, before the loop starts
    pub fn set_wait_callback(&self, callback: WaitCallback) -> Result<()> {
        let mut slot = self.callback.lock();
        let state = self.state();
        if state != AsyncState::Created {
            return Err(DevhubError::InvalidState {
                operation: "set wait callback",
                state: state.as_str(),
            });
        }
        if slot.is_some() {
            return Err(DevhubError::DuplicateRegistration(format!(
                "wait callback for {}",
                self.name
            )));
        }
        *slot = Some(callback);
        Ok(())
    }

    /// Spawn the wait loop thread: Created -> Running
    pub fn start_wait_loop(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        let mut slot = self.callback.lock();
        let state = self.state();
        if state != AsyncState::Created {
            return Err(DevhubError::InvalidState {
                operation: "start wait loop",
                state: state.as_str(),
            });
        }
        let Some(callback) = slot.take() else {
            return Err(DevhubError::InvalidState {
                operation: "start wait loop",
                state: "no wait callback set",
            });
        };
        self.state.store(AsyncState::Running);

        let name = self.name.clone();
        let state = self.state.clone();
        let spawned = thread::Builder::new()
            .name(format!("devhub-async-{}", self.name))
            .spawn(move || run_wait_loop(name, state, callback));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                info!(device = %self.name, "Started wait loop");
                Ok(())
            }
            Err(e) => {
                self.state.finish();
                Err(DevhubError::ThreadSpawn(e.to_string()))
            }
        }
    }

    /// Ask the loop to exit after the current callback invocation
    pub fn request_stop(&self) {
        if self.state.transition(AsyncState::Running, AsyncState::StopRequested) {
            debug!(device = %self.name, "Stop requested");
        } else if self.state.transition(AsyncState::Created, AsyncState::Stopped) {
            // Never started; drop the pending callback with it
            self.callback.lock().take();
            self.state.finish();
        }
    }

    /// Request a stop and wait for the loop thread to exit
    ///
    /// Every caller off the loop thread blocks until the loop has stopped.
    /// When called from the loop thread itself the wait is skipped and the
    /// join is left to the next external caller.
    pub fn stop(&self) {
        self.request_stop();
        if self.state.on_loop_thread() {
            debug!(device = %self.name, "Stop called from wait loop thread, not joining");
            return;
        }
        let handle = self.worker.lock().take();
        match handle {
            Some(handle) => {
                if handle.join().is_err() {
                    error!(device = %self.name, "Wait loop thread panicked");
                    self.state.finish();
                }
            }
            // Another caller owns the join
            None => self.state.wait_stopped(),
        }
    }
}

impl Drop for AsyncDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_wait_loop(name: String, state: Arc<LoopState>, mut callback: WaitCallback) {
    let _ = state.owner.set(thread::current().id());
    debug!(device = %name, "Wait loop running");
    while state.load() == AsyncState::Running {
        match catch_unwind(AssertUnwindSafe(|| callback())) {
            Ok(Ok(LoopControl::Continue)) => {}
            Ok(Ok(LoopControl::Stop)) => {
                debug!(device = %name, "Wait callback finished");
                break;
            }
            Ok(Err(e)) => {
                let error = format!("{:#}", e);
                warn!(device = %name, error = %error, "Wait callback failed, stopping loop");
                break;
            }
            Err(payload) => {
                error!(
                    device = %name,
                    panic = %panic_message(payload.as_ref()),
                    "Wait callback panicked, stopping loop"
                );
                break;
            }
        }
    }
    drop(callback);
    state.finish();
    info!(device = %name, "Wait loop stopped");
}
