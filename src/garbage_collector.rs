// Garbage collector - deferred destruction of GPU objects
//
// Destroying an object the GPU may still read is undefined behavior, so
// destroy requests only move the object into a trash list, stamped with the
// queue's in-flight bits at that moment. A later pass frees every object
// whose stamp no longer overlaps the live bits: each round that could have
// referenced it has been consumed. Testing for overlap rather than for zero
// keeps recycled ids of unrelated later rounds from pinning the object.
//
// One collector serves every device in the process; passes filter by
// device id. Each thread trashes into its own list so the hot path never
// contends with other trashing threads.

use crate::device::{Device, DeviceId};
use crate::resources::{
    Buffer, ComputePipeline, GraphicsPipeline, ResourceBindings, Sampler, ShaderFunction,
    ShaderProgram, Texture,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Sleep between checks while a trash call waits out a collection pass
const REENTRY_POLL_INTERVAL: Duration = Duration::from_micros(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Buffer,
    Texture,
    Sampler,
    ShaderFunction,
    ShaderProgram,
    ResourceBindings,
    GraphicsPipeline,
    ComputePipeline,
}

impl ResourceType {
    pub const ALL: [ResourceType; 8] = [
        ResourceType::Buffer,
        ResourceType::Texture,
        ResourceType::Sampler,
        ResourceType::ShaderFunction,
        ResourceType::ShaderProgram,
        ResourceType::ResourceBindings,
        ResourceType::GraphicsPipeline,
        ResourceType::ComputePipeline,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ResourceType::Buffer => "buffer",
            ResourceType::Texture => "texture",
            ResourceType::Sampler => "sampler",
            ResourceType::ShaderFunction => "shader function",
            ResourceType::ShaderProgram => "shader program",
            ResourceType::ResourceBindings => "resource bindings",
            ResourceType::GraphicsPipeline => "graphics pipeline",
            ResourceType::ComputePipeline => "compute pipeline",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A GPU object the collector can hold on to and free later
pub trait Collectable: Sized + Send + 'static {
    const TYPE: ResourceType;

    fn device(&self) -> &Arc<Device>;

    /// In-flight bits stamped when the object was trashed
    fn inflight_bits(&self) -> u64;

    fn set_inflight_bits(&mut self, bits: u64);

    /// The collector's list for this object type
    fn trash_list(collector: &GarbageCollector) -> &TrashList<Self>;
}

/// Every thread's trashed objects of one type
pub struct TrashList<T> {
    per_thread: RwLock<HashMap<ThreadId, Arc<Mutex<Vec<T>>>>>,
}

impl<T: Collectable> TrashList<T> {
    fn new() -> Self {
        Self {
            per_thread: RwLock::new(HashMap::new()),
        }
    }

    /// The calling thread's list, registered on first use
    fn thread_list(&self) -> Arc<Mutex<Vec<T>>> {
        let thread = thread::current().id();
        if let Some(list) = self.per_thread.read().get(&thread) {
            return list.clone();
        }
        self.per_thread
            .write()
            .entry(thread)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    fn push(&self, object: T) {
        self.thread_list().lock().push(object);
    }

    /// Free the objects of `device` matching `collectable`, returning how many
    fn collect(&self, device: DeviceId, collectable: impl Fn(&T) -> bool) -> usize {
        let lists: Vec<_> = self.per_thread.read().values().cloned().collect();

        let mut freed = 0;
        for list in lists {
            let mut doomed = Vec::new();
            {
                let mut objects = list.lock();
                let mut index = 0;
                while index < objects.len() {
                    let object = &objects[index];
                    if object.device().id() == device && collectable(object) {
                        doomed.push(objects.swap_remove(index));
                    } else {
                        index += 1;
                    }
                }
            }
            // Native destruction happens outside the list lock
            freed += doomed.len();
            drop(doomed);
        }
        freed
    }

    /// Trashed objects not yet freed, optionally only those of one device
    pub fn len_for(&self, device: Option<DeviceId>) -> usize {
        self.per_thread
            .read()
            .values()
            .map(|list| {
                list.lock()
                    .iter()
                    .filter(|object| device.map_or(true, |id| object.device().id() == id))
                    .count()
            })
            .sum()
    }

    pub fn len(&self) -> usize {
        self.len_for(None)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Threads that have trashed into this list
    pub fn thread_count(&self) -> usize {
        self.per_thread.read().len()
    }
}

/// Deferred-destruction registry shared by all devices that use it
pub struct GarbageCollector {
    pub(crate) buffers: TrashList<Buffer>,
    pub(crate) textures: TrashList<Texture>,
    pub(crate) samplers: TrashList<Sampler>,
    pub(crate) shader_functions: TrashList<ShaderFunction>,
    pub(crate) shader_programs: TrashList<ShaderProgram>,
    pub(crate) resource_bindings: TrashList<ResourceBindings>,
    pub(crate) graphics_pipelines: TrashList<GraphicsPipeline>,
    pub(crate) compute_pipelines: TrashList<ComputePipeline>,
    /// Set for the duration of a collection pass
    collecting: AtomicBool,
}

impl GarbageCollector {
    /// An isolated collector; most callers share `global()`
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            buffers: TrashList::new(),
            textures: TrashList::new(),
            samplers: TrashList::new(),
            shader_functions: TrashList::new(),
            shader_programs: TrashList::new(),
            resource_bindings: TrashList::new(),
            graphics_pipelines: TrashList::new(),
            compute_pipelines: TrashList::new(),
            collecting: AtomicBool::new(false),
        })
    }

    /// The process-wide collector, created on first access and kept until exit
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<GarbageCollector>> = OnceLock::new();
        GLOBAL.get_or_init(GarbageCollector::new).clone()
    }

    pub fn trash_list<T: Collectable>(&self) -> &TrashList<T> {
        T::trash_list(self)
    }

    /// Take ownership of `object` and free it once no command buffer that
    /// was in flight right now can still reference it.
    ///
    /// Must not race a collection pass; a trash call arriving during one is
    /// reported and waits for the pass to finish.
    pub fn trash<T: Collectable>(&self, mut object: T) {
        if self.collecting.load(Ordering::Acquire) {
            log::error!(
                "Trashing a {} during garbage collection, waiting for the pass to finish",
                T::TYPE
            );
            while self.collecting.load(Ordering::Acquire) {
                thread::sleep(REENTRY_POLL_INTERVAL);
            }
        }

        let bits = object.device().command_queue().inflight_bits();
        object.set_inflight_bits(bits);
        log::trace!("Trashed {} with in-flight bits {:#018x}", T::TYPE, bits);
        self.trash_list::<T>().push(object);
    }

    /// Free every trashed object of `device` whose stamp no longer
    /// intersects the device's in-flight bits. Returns the number freed.
    pub fn perform_garbage_collection(&self, device: &Device) -> usize {
        let queue_bits = device.command_queue().inflight_bits();
        let freed = self.sweep(device.id(), |stamp| stamp & queue_bits == 0);
        if freed > 0 {
            log::debug!(
                "Garbage collection on {} freed {} objects (in-flight {:#018x})",
                device.id(),
                freed,
                queue_bits
            );
        }
        freed
    }

    /// Free every trashed object of `device` regardless of its stamp.
    /// For teardown, once the device is idle.
    pub fn collect_all(&self, device: &Device) -> usize {
        let freed = self.sweep(device.id(), |_| true);
        log::debug!("Released all {} trashed objects of {}", freed, device.id());
        freed
    }

    fn sweep(&self, device: DeviceId, collectable: impl Fn(u64) -> bool) -> usize {
        if self
            .collecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::error!("Garbage collection is already running, skipping this pass");
            return 0;
        }

        let freed = self.buffers.collect(device, |o| collectable(o.inflight_bits()))
            + self.textures.collect(device, |o| collectable(o.inflight_bits()))
            + self.samplers.collect(device, |o| collectable(o.inflight_bits()))
            + self.shader_functions.collect(device, |o| collectable(o.inflight_bits()))
            + self.shader_programs.collect(device, |o| collectable(o.inflight_bits()))
            + self.resource_bindings.collect(device, |o| collectable(o.inflight_bits()))
            + self.graphics_pipelines.collect(device, |o| collectable(o.inflight_bits()))
            + self.compute_pipelines.collect(device, |o| collectable(o.inflight_bits()));

        self.collecting.store(false, Ordering::Release);
        freed
    }

    /// Trashed objects of `kind` not yet freed, across all devices
    pub fn pending(&self, kind: ResourceType) -> usize {
        self.pending_for(kind, None)
    }

    pub fn pending_for(&self, kind: ResourceType, device: Option<DeviceId>) -> usize {
        match kind {
            ResourceType::Buffer => self.buffers.len_for(device),
            ResourceType::Texture => self.textures.len_for(device),
            ResourceType::Sampler => self.samplers.len_for(device),
            ResourceType::ShaderFunction => self.shader_functions.len_for(device),
            ResourceType::ShaderProgram => self.shader_programs.len_for(device),
            ResourceType::ResourceBindings => self.resource_bindings.len_for(device),
            ResourceType::GraphicsPipeline => self.graphics_pipelines.len_for(device),
            ResourceType::ComputePipeline => self.compute_pipelines.len_for(device),
        }
    }

    /// All trashed objects of `device` not yet freed
    pub fn pending_total(&self, device: DeviceId) -> usize {
        ResourceType::ALL
            .iter()
            .map(|&kind| self.pending_for(kind, Some(device)))
            .sum()
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::Acquire)
    }
}
