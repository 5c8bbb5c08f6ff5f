//! The owning root of the submission core.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ember_core::{
    BufferDesc, CoreConfig, CpuDescriptorHandle, DescriptorHeapKind, Device, FenceValue, GpuResource, GpuResult,
    QueueType, ResourceDesc, TextureDesc,
};
use parking_lot::Mutex;

use crate::context::{CommandContext, ContextState};
use crate::context_pool::ContextPool;
use crate::descriptor_allocator::DescriptorAllocator;
use crate::dynamic_descriptor_heap::DescriptorHeapPool;
use crate::error::CoreError;
use crate::linear_allocator::{AllocatorKind, PageManager};
use crate::queue::{CommandQueue, CommandQueueManager};

/// Queues, pools and allocators shared by every recording context.
///
/// Created once per device. Contexts keep the core alive through an `Arc`;
/// [`GraphicsCore::shutdown`] (or the last drop) idles the GPU and destroys
/// every object the core created.
pub struct GraphicsCore {
    config: CoreConfig,
    device: Arc<dyn Device>,
    queues: Arc<CommandQueueManager>,
    gpu_pages: Arc<PageManager>,
    cpu_pages: Arc<PageManager>,
    view_heaps: Arc<DescriptorHeapPool>,
    sampler_heaps: Arc<DescriptorHeapPool>,
    descriptor_allocators: [Mutex<DescriptorAllocator>; 4],
    contexts: ContextPool,
    shut_down: AtomicBool,
}

impl GraphicsCore {
    pub fn new(device: Arc<dyn Device>, config: CoreConfig) -> Result<Arc<Self>, CoreError> {
        config.validate()?;
        let queues = Arc::new(CommandQueueManager::new(device.clone())?);

        let a = &config.allocator;
        let gpu_pages = Arc::new(PageManager::new(
            AllocatorKind::GpuExclusive,
            a.gpu_page_size,
            device.clone(),
            queues.clone(),
        ));
        let cpu_pages = Arc::new(PageManager::new(
            AllocatorKind::CpuWritable,
            a.cpu_page_size,
            device.clone(),
            queues.clone(),
        ));

        let d = &config.descriptors;
        let view_heaps = Arc::new(DescriptorHeapPool::new(
            DescriptorHeapKind::CbvSrvUav,
            d.descriptors_per_dynamic_heap,
            device.clone(),
            queues.clone(),
        ));
        let sampler_heaps = Arc::new(DescriptorHeapPool::new(
            DescriptorHeapKind::Sampler,
            d.descriptors_per_dynamic_heap,
            device.clone(),
            queues.clone(),
        ));
        let descriptor_allocators = DescriptorHeapKind::ALL
            .map(|kind| Mutex::new(DescriptorAllocator::new(device.clone(), kind, d.descriptors_per_cpu_heap)));

        tracing::info!("Graphics core initialized on {}", device.name());
        Ok(Arc::new(Self {
            config,
            device,
            queues,
            gpu_pages,
            cpu_pages,
            view_heaps,
            sampler_heaps,
            descriptor_allocators,
            contexts: ContextPool::new(),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn queues(&self) -> &Arc<CommandQueueManager> {
        &self.queues
    }

    pub fn queue(&self, queue_type: QueueType) -> &CommandQueue {
        self.queues.queue(queue_type)
    }

    pub fn context_pool(&self) -> &ContextPool {
        &self.contexts
    }

    pub(crate) fn gpu_pages(&self) -> &Arc<PageManager> {
        &self.gpu_pages
    }

    pub(crate) fn cpu_pages(&self) -> &Arc<PageManager> {
        &self.cpu_pages
    }

    pub(crate) fn view_heaps(&self) -> &Arc<DescriptorHeapPool> {
        &self.view_heaps
    }

    pub(crate) fn sampler_heaps(&self) -> &Arc<DescriptorHeapPool> {
        &self.sampler_heaps
    }

    pub fn page_manager(&self, kind: AllocatorKind) -> &PageManager {
        match kind {
            AllocatorKind::GpuExclusive => &self.gpu_pages,
            AllocatorKind::CpuWritable => &self.cpu_pages,
        }
    }

    /// Shader-visible heap pool of `kind` (views or samplers).
    pub fn descriptor_heap_pool(&self, kind: DescriptorHeapKind) -> &DescriptorHeapPool {
        match kind {
            DescriptorHeapKind::Sampler => &self.sampler_heaps,
            _ => &self.view_heaps,
        }
    }

    /// Leases a recording context for `queue_type`.
    pub fn begin(self: &Arc<Self>, queue_type: QueueType) -> GpuResult<CommandContext> {
        assert!(!self.is_shut_down(), "begin after shutdown");

        let state = match self.contexts.acquire(queue_type) {
            Some(mut state) => match state.reset() {
                Ok(()) => state,
                Err(e) => {
                    self.contexts.release(state);
                    return Err(e);
                }
            },
            None => {
                let state = ContextState::new(self, queue_type)?;
                let count = self.contexts.note_created(queue_type);
                tracing::debug!("Created {} context #{}", queue_type, count);
                state
            }
        };
        Ok(CommandContext::new(self.clone(), state))
    }

    pub fn is_fence_complete(&self, value: FenceValue) -> bool {
        self.queues.is_fence_complete(value)
    }

    /// Blocks until `value` completes.
    pub fn wait_for_fence(&self, value: FenceValue) {
        self.queues.wait_for_fence(value);
    }

    /// Makes `consumer` wait on the GPU for `value`.
    pub fn stall_for_fence(&self, consumer: QueueType, value: FenceValue) {
        self.queues.stall_for_fence(consumer, value);
    }

    /// Makes `consumer` wait on the GPU for everything `producer` has submitted.
    pub fn stall_for_producer(&self, consumer: QueueType, producer: QueueType) {
        self.queues.stall_for_producer(consumer, producer);
    }

    pub fn idle_gpu(&self) {
        self.queues.idle_gpu();
    }

    /// Allocates `count` consecutive CPU-only descriptors of `kind`.
    pub fn allocate_descriptor(&self, kind: DescriptorHeapKind, count: u32) -> GpuResult<CpuDescriptorHandle> {
        self.descriptor_allocators[kind.index()].lock().allocate(count)
    }

    pub fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<GpuResource> {
        let handle = self.device.create_buffer(desc)?;
        let address = self.device.gpu_address(handle);
        Ok(GpuResource::new(handle, ResourceDesc::Buffer(*desc), address))
    }

    pub fn create_texture(&self, desc: &TextureDesc) -> GpuResult<GpuResource> {
        let handle = self.device.create_texture(desc)?;
        let address = self.device.gpu_address(handle);
        Ok(GpuResource::new(handle, ResourceDesc::Texture(*desc), address))
    }

    /// Destroys `resource`. The GPU must be done with it.
    pub fn destroy_resource(&self, resource: GpuResource) {
        self.device.destroy_resource(resource.handle());
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Idles the GPU and destroys every pooled object. Idempotent.
    ///
    /// No context may be recording.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queues.idle_gpu();
        self.contexts.destroy_all();
        self.gpu_pages.destroy();
        self.cpu_pages.destroy();
        self.view_heaps.destroy_all();
        self.sampler_heaps.destroy_all();
        for allocator in &self.descriptor_allocators {
            allocator.lock().destroy_all();
        }
        self.queues.shutdown();
        tracing::info!("Graphics core shut down");
    }
}

impl Drop for GraphicsCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
