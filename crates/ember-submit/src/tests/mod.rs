//! Scenarios that drive the whole core against the software device.

mod lifetime;
mod threads;

use std::sync::Arc;

use ember_core::{
    CoreConfig, CpuDescriptorHandle, DescriptorHeapKind, DescriptorRangeKind, RootParameter, RootSignature,
    RootSignatureHandle,
};
use ember_device::SoftwareDevice;

use crate::GraphicsCore;

fn core_on(device: &Arc<SoftwareDevice>, config: CoreConfig) -> Arc<GraphicsCore> {
    GraphicsCore::new(device.clone(), config).unwrap()
}

fn immediate() -> (Arc<SoftwareDevice>, Arc<GraphicsCore>) {
    let device = Arc::new(SoftwareDevice::immediate());
    let core = core_on(&device, CoreConfig::default());
    (device, core)
}

/// One view table per entry of `view_tables`, then one sampler table per
/// entry of `sampler_tables`.
fn signature(id: u64, view_tables: &[u32], sampler_tables: &[u32]) -> RootSignature {
    let views = view_tables
        .iter()
        .map(|&count| RootParameter::descriptor_range(DescriptorRangeKind::ShaderResource, 0, count));
    let samplers = sampler_tables
        .iter()
        .map(|&count| RootParameter::descriptor_range(DescriptorRangeKind::Sampler, 0, count));
    RootSignature::new(RootSignatureHandle::from_raw(id), views.chain(samplers).collect())
}

/// Allocates a CPU descriptor of `kind` and writes `payload` into it.
fn descriptor(
    device: &SoftwareDevice,
    core: &GraphicsCore,
    kind: DescriptorHeapKind,
    payload: u64,
) -> CpuDescriptorHandle {
    let handle = core.allocate_descriptor(kind, 1).unwrap();
    assert!(device.write_descriptor(handle, payload));
    handle
}
