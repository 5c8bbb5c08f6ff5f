use std::collections::HashSet;
use std::sync::{Arc, Barrier};

use ember_core::{BindPoint, BufferDesc, BufferKind, CoreConfig, DescriptorHeapKind, QueueType};
use ember_device::SoftwareDevice;

use super::{core_on, descriptor, signature};
use crate::CommandContext;

const THREADS: usize = 4;
const ITERATIONS: u32 = 16;

#[test]
fn test_concurrent_recording_on_background_device() {
    let device = Arc::new(SoftwareDevice::background());
    let mut config = CoreConfig::default();
    // Small pages so threads keep cycling pages through the shared manager.
    config.allocator.cpu_page_size = 0x400;
    let core = core_on(&device, config);

    let mut buffers: Vec<_> = (0..THREADS)
        .map(|_| core.create_buffer(&BufferDesc::default_heap(256, BufferKind::Raw)).unwrap())
        .collect();

    let fences = std::thread::scope(|scope| {
        let handles: Vec<_> = buffers
            .iter_mut()
            .enumerate()
            .map(|(thread, buffer)| {
                let core = &core;
                scope.spawn(move || {
                    // Each buffer stays on one queue so its writes are ordered.
                    let queue = if thread % 2 == 0 {
                        QueueType::Graphics
                    } else {
                        QueueType::Compute
                    };
                    let mut fences = Vec::new();
                    for iteration in 0..ITERATIONS {
                        let mut context = core.begin(queue).unwrap();
                        let value = thread as u32 * 1000 + iteration;
                        context.write_buffer(buffer, 0, &[value; 64]).unwrap();
                        context.reserve_upload_memory(300).unwrap();
                        fences.push(context.finish(false));
                    }
                    fences
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });

    for fence in &fences {
        core.wait_for_fence(*fence);
        assert!(core.is_fence_complete(*fence));
    }

    for (thread, buffer) in buffers.iter_mut().enumerate() {
        let bytes = CommandContext::readback_buffer(&core, buffer, 0, 256).unwrap();
        let expected = (thread as u32 * 1000 + ITERATIONS - 1).to_le_bytes();
        assert!(bytes.chunks_exact(4).all(|word| word == expected));
    }

    let pool = core.context_pool();
    assert!(pool.created(QueueType::Graphics) <= THREADS);
    assert!(pool.created(QueueType::Compute) <= THREADS);
    assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
}

#[test]
fn test_simultaneous_contexts_are_distinct() {
    let device = Arc::new(SoftwareDevice::background());
    let core = core_on(&device, CoreConfig::default());
    let barrier = Barrier::new(THREADS);

    let buffers = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let core = &core;
                let barrier = &barrier;
                scope.spawn(move || {
                    let context = core.begin(QueueType::Graphics).unwrap();
                    let buffer = context.command_buffer();
                    // Hold every context at once before finishing.
                    barrier.wait();
                    context.finish(true);
                    buffer
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<HashSet<_>>()
    });

    assert_eq!(buffers.len(), THREADS);
    assert_eq!(core.context_pool().created(QueueType::Graphics), THREADS);
    assert_eq!(core.context_pool().available(QueueType::Graphics), THREADS);
}

#[test]
fn test_shared_descriptor_heaps_across_threads() {
    let device = Arc::new(SoftwareDevice::background());
    let mut config = CoreConfig::default();
    config.descriptors.descriptors_per_dynamic_heap = 8;
    let core = core_on(&device, config);
    let signature = signature(1, &[4], &[]);
    let handles: Vec<_> = (0..THREADS)
        .map(|thread| descriptor(&device, &core, DescriptorHeapKind::CbvSrvUav, 500 + thread as u64))
        .collect();

    std::thread::scope(|scope| {
        for handle in &handles {
            let core = &core;
            let signature = &signature;
            scope.spawn(move || {
                for _ in 0..ITERATIONS {
                    let mut context = core.begin(QueueType::Graphics).unwrap();
                    context.set_root_signature(BindPoint::Graphics, signature);
                    context.set_dynamic_descriptors(BindPoint::Graphics, 0, 3, &[*handle]);
                    for _ in 0..3 {
                        context.draw(3, 0).unwrap();
                    }
                    context.finish(false);
                }
            });
        }
    });
    core.idle_gpu();

    assert_eq!(device.stats().draws, (THREADS as u64) * ITERATIONS as u64 * 3);
    assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
}
