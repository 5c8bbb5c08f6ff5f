//! Ember demo entry point
//!
//! Records uploads and draws from several threads against a background
//! software device, then reports what the device saw.

use std::sync::Arc;

use ember_core::{
    BindPoint, BufferDesc, BufferKind, CoreConfig, CpuDescriptorHandle, DescriptorHeapKind, DescriptorRangeKind,
    FenceValue, QueueType, RootParameter, RootSignature, RootSignatureHandle,
};
use ember_device::SoftwareDevice;
use ember_submit::{CoreError, GraphicsCore};

const WORKERS: usize = 4;
const FRAMES: u32 = 32;

fn main() -> Result<(), CoreError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ember_demo=debug,ember_submit=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Ember demo");

    let config = match std::env::args().nth(1) {
        Some(path) => CoreConfig::load_or_default(path),
        None => CoreConfig::default(),
    };

    let device = Arc::new(SoftwareDevice::background());
    let core = GraphicsCore::new(device.clone(), config)?;

    let signature = RootSignature::new(
        RootSignatureHandle::from_raw(1),
        vec![
            RootParameter::descriptor_range(DescriptorRangeKind::ShaderResource, 0, 4),
            RootParameter::descriptor_range(DescriptorRangeKind::Sampler, 0, 1),
        ],
    );
    let view = core.allocate_descriptor(DescriptorHeapKind::CbvSrvUav, 1)?;
    let sampler = core.allocate_descriptor(DescriptorHeapKind::Sampler, 1)?;
    device.write_descriptor(view, 0x5eed);
    device.write_descriptor(sampler, 0x5a);

    let results = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let core = &core;
                let signature = &signature;
                scope.spawn(move || record_frames(core, signature, worker, view, sampler))
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect::<Vec<_>>()
    });

    for (worker, result) in results.into_iter().enumerate() {
        let fence = result?;
        tracing::debug!("Worker {} finished at {:?}", worker, fence);
    }

    core.idle_gpu();
    let stats = device.stats();
    tracing::info!(
        "Executed {} command buffers: {} draws, {} buffer copies, {} descriptors copied",
        stats.command_buffers_executed,
        stats.draws,
        stats.buffer_copies,
        stats.descriptors_copied
    );
    for queue_type in QueueType::ALL {
        tracing::info!(
            "{:?} contexts created: {}",
            queue_type,
            core.context_pool().created(queue_type)
        );
    }

    let errors = device.validation_errors();
    if !errors.is_empty() {
        tracing::warn!("Device reported {} validation errors", errors.len());
        for error in &errors {
            tracing::warn!("{}", error);
        }
    }

    core.shutdown();
    Ok(())
}

/// Uploads a frame's constants and draws with them, once per frame.
fn record_frames(
    core: &Arc<GraphicsCore>,
    signature: &RootSignature,
    worker: usize,
    view: CpuDescriptorHandle,
    sampler: CpuDescriptorHandle,
) -> Result<FenceValue, CoreError> {
    let mut constants = core.create_buffer(&BufferDesc::default_heap(256, BufferKind::Raw))?;
    let mut last = FenceValue::initial(QueueType::Graphics);

    for frame in 0..FRAMES {
        let mut context = core.begin(QueueType::Graphics)?;
        let data = [worker as u32, frame, 0, 0];
        context.write_buffer(&mut constants, 0, &data)?;
        context.set_root_signature(BindPoint::Graphics, signature);
        context.set_dynamic_descriptors(BindPoint::Graphics, 0, 0, &[view]);
        context.set_dynamic_samplers(BindPoint::Graphics, 1, 0, &[sampler]);
        context.draw(3, 0)?;
        last = context.finish(false);
    }

    core.wait_for_fence(last);
    core.destroy_resource(constants);
    Ok(last)
}
