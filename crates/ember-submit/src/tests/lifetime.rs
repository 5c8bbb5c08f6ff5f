use std::sync::Arc;

use ember_core::{BufferDesc, BufferKind, CoreConfig, QueueType};
use ember_device::SoftwareDevice;

use super::{core_on, immediate};
use crate::AllocatorKind;

fn deferred() -> (Arc<SoftwareDevice>, Arc<crate::GraphicsCore>) {
    let device = Arc::new(SoftwareDevice::deferred());
    let core = core_on(&device, CoreConfig::default());
    (device, core)
}

#[test]
fn test_finished_context_is_reused() {
    let (_device, core) = immediate();
    core.begin(QueueType::Graphics).unwrap().finish(true);
    assert_eq!(core.context_pool().created(QueueType::Graphics), 1);
    assert_eq!(core.context_pool().available(QueueType::Graphics), 1);

    let context = core.begin(QueueType::Graphics).unwrap();
    assert_eq!(core.context_pool().created(QueueType::Graphics), 1);
    assert_eq!(core.context_pool().available(QueueType::Graphics), 0);
    context.finish(false);

    // Pools are per queue type.
    core.begin(QueueType::Copy).unwrap().finish(true);
    assert_eq!(core.context_pool().created(QueueType::Copy), 1);
    assert_eq!(core.context_pool().created(QueueType::Graphics), 1);
}

#[test]
fn test_command_buffer_waits_for_its_fence() {
    let (device, core) = deferred();

    let first = core.begin(QueueType::Graphics).unwrap();
    let first_buffer = first.command_buffer();
    let fence = first.finish(false);
    assert!(!core.is_fence_complete(fence));

    let second = core.begin(QueueType::Graphics).unwrap();
    assert_ne!(second.command_buffer(), first_buffer);
    second.finish(false);

    device.run_until_idle();
    assert!(core.is_fence_complete(fence));
    let third = core.begin(QueueType::Graphics).unwrap();
    assert_eq!(third.command_buffer(), first_buffer);
    third.finish(false);
    device.run_until_idle();
    assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
}

#[test]
fn test_upload_page_waits_for_its_fence() {
    let (device, core) = deferred();

    let mut first = core.begin(QueueType::Graphics).unwrap();
    let first_page = first.reserve_upload_memory(256).unwrap().resource();
    let fence = first.finish(false);

    let mut second = core.begin(QueueType::Graphics).unwrap();
    let second_page = second.reserve_upload_memory(256).unwrap().resource();
    assert_ne!(second_page, first_page);
    second.finish(false);
    assert_eq!(core.page_manager(AllocatorKind::CpuWritable).retired_count(), 2);

    device.run_until_idle();
    assert!(core.is_fence_complete(fence));
    let mut third = core.begin(QueueType::Graphics).unwrap();
    assert_eq!(third.reserve_upload_memory(256).unwrap().resource(), first_page);
    third.finish(false);
    device.run_until_idle();
    assert_eq!(core.page_manager(AllocatorKind::CpuWritable).page_count(), 2);
}

#[test]
fn test_oversize_allocation_is_freed_after_retirement() {
    let (device, core) = immediate();
    let page_size = core.config().allocator.cpu_page_size;

    let mut context = core.begin(QueueType::Graphics).unwrap();
    let large = context.reserve_upload_memory(page_size + 1).unwrap();
    assert_eq!(large.offset(), 0);
    assert!(large.size() > page_size);
    let large_page = large.resource();
    drop(large);
    context.finish(true);

    let pages = core.page_manager(AllocatorKind::CpuWritable);
    assert_eq!(pages.page_count(), 0);
    assert_eq!(pages.pending_deletion_count(), 1);
    assert!(device.is_resource_alive(large_page));

    // Queuing the next one-off page destroys the retired one.
    let mut context = core.begin(QueueType::Graphics).unwrap();
    context.reserve_upload_memory(page_size * 2).unwrap();
    context.finish(true);
    assert!(!device.is_resource_alive(large_page));
    assert_eq!(pages.pending_deletion_count(), 1);
}

#[test]
fn test_scratch_memory_is_gpu_only() {
    let (_device, core) = immediate();
    let mut context = core.begin(QueueType::Compute).unwrap();
    let scratch = context.reserve_scratch_memory(1000).unwrap();
    assert!(scratch.cpu_ptr().is_none());
    assert_eq!(scratch.size(), 1024);
    let upload = context.reserve_upload_memory(1000).unwrap();
    assert!(upload.cpu_ptr().is_some());
    context.finish(true);
}

#[test]
fn test_dropped_context_returns_its_buffer() {
    let (device, core) = immediate();
    let context = core.begin(QueueType::Compute).unwrap();
    let buffer = context.command_buffer();
    drop(context);

    assert_eq!(core.queue(QueueType::Compute).buffer_pool().ready_len(), 1);
    let next = core.begin(QueueType::Compute).unwrap();
    assert_eq!(next.command_buffer(), buffer);
    next.finish(true);
    assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
}

#[test]
fn test_stall_for_fence_orders_queues() {
    let (device, core) = deferred();
    let mut buffer = core.create_buffer(&BufferDesc::default_heap(64, BufferKind::Raw)).unwrap();

    let mut upload = core.begin(QueueType::Copy).unwrap();
    upload.write_buffer(&mut buffer, 0, &[1u8; 64]).unwrap();
    let copy_fence = upload.finish(false);

    core.stall_for_fence(QueueType::Graphics, copy_fence);
    let consumer = core.begin(QueueType::Graphics).unwrap();
    let graphics_fence = consumer.finish(false);

    let graphics = core.queue(QueueType::Graphics).handle();
    let copy = core.queue(QueueType::Copy).handle();
    assert!(!device.step(graphics));
    while device.step(copy) {}
    assert!(core.is_fence_complete(copy_fence));
    while device.step(graphics) {}
    assert!(core.is_fence_complete(graphics_fence));
}

#[test]
fn test_stall_for_producer_before_any_submission() {
    let (device, core) = deferred();
    core.stall_for_producer(QueueType::Compute, QueueType::Copy);
    let fence = core.begin(QueueType::Compute).unwrap().finish(false);
    device.run_until_idle();
    assert!(core.is_fence_complete(fence));
}

#[test]
fn test_fence_completion_is_monotonic() {
    let (device, core) = deferred();
    let fences: Vec<_> = (0..3)
        .map(|_| core.begin(QueueType::Graphics).unwrap().finish(false))
        .collect();

    let graphics = core.queue(QueueType::Graphics);
    // Execute and signal of the first two submissions.
    for _ in 0..4 {
        assert!(device.step(graphics.handle()));
    }
    assert!(core.is_fence_complete(fences[0]));
    assert!(core.is_fence_complete(fences[1]));
    assert!(!core.is_fence_complete(fences[2]));

    device.run_until_idle();
    graphics.wait_for(fences[2]);
    assert_eq!(graphics.last_completed_fence_value(), fences[2]);
}

#[test]
fn test_allocation_from_finished_context_cannot_write() {
    let (device, core) = immediate();

    let mut first = core.begin(QueueType::Graphics).unwrap();
    let stale = first.reserve_upload_memory(256).unwrap();
    first.finish(true);
    assert!(!stale.is_writable());

    let mut second = core.begin(QueueType::Graphics).unwrap();
    let live = second.reserve_upload_memory(256).unwrap();
    assert_eq!(live.resource(), stale.resource());
    assert_eq!(live.offset(), stale.offset());
    live.write_bytes(0, &[0xaa; 4]);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| stale.write_bytes(0, &[0x55; 4])));
    assert!(result.is_err());
    assert_eq!(device.read_resource(live.resource(), live.offset(), 4).unwrap(), [0xaa; 4]);
    second.finish(true);
}
