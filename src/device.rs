// Device - one native device bound to its command queue

use crate::backend::{CompletionMode, HeadlessDevice, NativeDevice, VulkanDevice};
use crate::command_buffer::WaitMode;
use crate::command_queue::CommandQueue;
use crate::config::{BackendKind, Config};
use anyhow::{Context, Result};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-unique device identity; trash lists are shared across devices
/// and filtered by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u64);

impl DeviceId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device-{}", self.0)
    }
}

pub struct Device {
    id: DeviceId,
    native: Arc<dyn NativeDevice>,
    queue: CommandQueue,
    debug_enabled: bool,
}

impl Device {
    /// Wrap `native`. The calling thread becomes the queue's main thread.
    pub fn new(native: Arc<dyn NativeDevice>, config: &Config) -> Arc<Self> {
        let id = DeviceId::next();
        log::info!("Creating {} on {}", id, native.name());

        let queue = CommandQueue::new(native.clone(), config.queue.clone());
        Arc::new(Self {
            id,
            native,
            queue,
            debug_enabled: config.debug_enabled(),
        })
    }

    /// Build the native device the config asks for
    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        let native: Arc<dyn NativeDevice> = match config.backend_kind() {
            BackendKind::Vulkan => VulkanDevice::new(
                &config.device.app_name,
                config.debug.validation_layers,
            )
            .context("Failed to create Vulkan device")?,
            BackendKind::Headless => Arc::new(HeadlessDevice::new(CompletionMode::Immediate)),
        };
        Ok(Self::new(native, config))
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn native(&self) -> &Arc<dyn NativeDevice> {
        &self.native
    }

    pub fn command_queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Debug labels and markers are recorded
    pub fn debug_enabled(&self) -> bool {
        self.debug_enabled
    }

    /// Block until the GPU is idle, then reclaim every consumed buffer
    pub fn wait_for_idle(&self) {
        if let Err(e) = self.native.wait_idle() {
            log::error!("Device wait idle failed: {:#}", e);
        }
        if self.queue.is_main_thread() {
            self.queue.reset_consumed_command_buffers(WaitMode::NoWait);
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("native", &self.native.name())
            .finish()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::info!("Destroying {}", self.id);
        self.wait_for_idle();
    }
}
