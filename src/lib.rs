// =============================================================================
// HGI VULKAN - Command buffer lifecycle and deferred GPU garbage collection
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Hgi (frames, submission, create/destroy)                       │
// │    ├── BlitCmds (records into a lazily acquired command buffer) │
// │    ├── GarbageCollector (per-thread trash, stamped in-flight)   │
// │    └── Device                                                   │
// │          └── CommandQueue (per-thread pools, in-flight ids)     │
// │                └── NativeDevice (Vulkan or headless)            │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Threads acquire command buffers and record
// 2. Main thread submits (resource uploads first, ordered by semaphore)
// 3. End of frame: consumed buffers are reset, their ids released
// 4. Trashed objects whose stamp no longer overlaps the queue are freed
//
// =============================================================================

pub mod backend;
pub mod cmds;
pub mod command_buffer;
pub mod command_queue;
pub mod config;
pub mod device;
pub mod garbage_collector;
pub mod hgi;
pub mod inflight;
pub mod resources;

pub use backend::{CompletionMode, HeadlessDevice, NativeDevice, VulkanDevice};
pub use cmds::BlitCmds;
pub use command_buffer::{CommandBuffer, CommandBufferRef, CommandBufferState, WaitMode};
pub use command_queue::{CommandBufferPool, CommandQueue};
pub use config::{BackendKind, Config};
pub use device::{Device, DeviceId};
pub use garbage_collector::{GarbageCollector, ResourceType};
pub use hgi::Hgi;
pub use inflight::{InFlightId, InFlightRegistry, MAX_IN_FLIGHT};
pub use resources::{
    Buffer, ComputePipeline, GraphicsPipeline, ResourceBindings, Sampler, ShaderFunction,
    ShaderProgram, Texture,
};

/// Unwrap a native call the lifecycle cannot route around.
///
/// A failure here means the device is lost or a Vulkan invariant is already
/// broken, so it is logged and then the thread panics.
#[track_caller]
pub(crate) fn verify<T>(result: anyhow::Result<T>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            log::error!("{}: {:#}", what, e);
            panic!("{}: {:#}", what, e);
        }
    }
}
