//! Root signature layout.
//!
//! The signature object itself is built by an external collaborator; this
//! module only records which root parameters are descriptor tables, of which
//! kind, and how many descriptors each table spans.

use crate::bits::SetBits;
use crate::device::DescriptorHeapKind;
use crate::handles::RootSignatureHandle;

/// Maximum number of root parameters a layout may declare.
pub const MAX_ROOT_PARAMETERS: usize = 16;

/// Descriptor type of a table range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorRangeKind {
    ShaderResource,
    UnorderedAccess,
    ConstantBuffer,
    Sampler,
}

/// One contiguous range of a descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorRangeDesc {
    pub kind: DescriptorRangeKind,
    pub base_register: u32,
    pub count: u32,
}

/// A root parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootParameter {
    /// Inline 32-bit constants.
    Constants { register: u32, num_values: u32 },
    /// Root constant buffer view.
    ConstantBuffer { register: u32 },
    /// Root shader resource view.
    ShaderResource { register: u32 },
    /// Root unordered access view.
    UnorderedAccess { register: u32 },
    /// Table of descriptor ranges.
    DescriptorTable(Vec<DescriptorRangeDesc>),
}

impl RootParameter {
    /// A table with a single range.
    pub fn descriptor_range(kind: DescriptorRangeKind, base_register: u32, count: u32) -> Self {
        RootParameter::DescriptorTable(vec![DescriptorRangeDesc {
            kind,
            base_register,
            count,
        }])
    }
}

/// A finalized root signature with its table bookkeeping.
#[derive(Debug, Clone)]
pub struct RootSignature {
    handle: RootSignatureHandle,
    parameters: Vec<RootParameter>,
    view_table_mask: u32,
    sampler_table_mask: u32,
    table_sizes: [u32; MAX_ROOT_PARAMETERS],
}

impl RootSignature {
    /// Derives the table masks and sizes for `parameters`.
    ///
    /// Panics if there are more than [`MAX_ROOT_PARAMETERS`] parameters or a
    /// table has no ranges.
    pub fn new(handle: RootSignatureHandle, parameters: Vec<RootParameter>) -> Self {
        assert!(
            parameters.len() <= MAX_ROOT_PARAMETERS,
            "root signature has {} parameters, at most {MAX_ROOT_PARAMETERS} are supported",
            parameters.len()
        );

        let mut view_table_mask = 0u32;
        let mut sampler_table_mask = 0u32;
        let mut table_sizes = [0u32; MAX_ROOT_PARAMETERS];

        for (index, parameter) in parameters.iter().enumerate() {
            let RootParameter::DescriptorTable(ranges) = parameter else {
                continue;
            };
            assert!(!ranges.is_empty(), "descriptor table {index} has no ranges");

            // A table is a sampler table if its first range holds samplers.
            if ranges[0].kind == DescriptorRangeKind::Sampler {
                sampler_table_mask |= 1 << index;
            } else {
                view_table_mask |= 1 << index;
            }
            table_sizes[index] = ranges.iter().map(|r| r.count).sum();
        }

        Self {
            handle,
            parameters,
            view_table_mask,
            sampler_table_mask,
            table_sizes,
        }
    }

    pub fn handle(&self) -> RootSignatureHandle {
        self.handle
    }

    pub fn parameters(&self) -> &[RootParameter] {
        &self.parameters
    }

    /// Bitmap of root parameters that are tables of the given heap kind.
    pub fn table_mask(&self, kind: DescriptorHeapKind) -> u32 {
        match kind {
            DescriptorHeapKind::Sampler => self.sampler_table_mask,
            _ => self.view_table_mask,
        }
    }

    /// Number of descriptors spanned by the table at `root_index`.
    pub fn table_size(&self, root_index: u32) -> u32 {
        self.table_sizes[root_index as usize]
    }

    /// Iterates the root indices of all tables of `kind`.
    pub fn tables(&self, kind: DescriptorHeapKind) -> SetBits {
        SetBits::new(self.table_mask(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_signature() -> RootSignature {
        RootSignature::new(
            RootSignatureHandle::from_raw(1),
            vec![
                RootParameter::Constants {
                    register: 0,
                    num_values: 4,
                },
                RootParameter::DescriptorTable(vec![
                    DescriptorRangeDesc {
                        kind: DescriptorRangeKind::ShaderResource,
                        base_register: 0,
                        count: 3,
                    },
                    DescriptorRangeDesc {
                        kind: DescriptorRangeKind::UnorderedAccess,
                        base_register: 0,
                        count: 2,
                    },
                ]),
                RootParameter::descriptor_range(DescriptorRangeKind::Sampler, 0, 2),
                RootParameter::ConstantBuffer { register: 1 },
            ],
        )
    }

    #[test]
    fn test_table_masks() {
        let sig = sample_signature();
        assert_eq!(sig.table_mask(DescriptorHeapKind::CbvSrvUav), 0b0010);
        assert_eq!(sig.table_mask(DescriptorHeapKind::Sampler), 0b0100);
    }

    #[test]
    fn test_table_sizes_sum_ranges() {
        let sig = sample_signature();
        assert_eq!(sig.table_size(0), 0);
        assert_eq!(sig.table_size(1), 5);
        assert_eq!(sig.table_size(2), 2);
        let samplers: Vec<u32> = sig.tables(DescriptorHeapKind::Sampler).collect();
        assert_eq!(samplers, vec![2]);
    }

    #[test]
    #[should_panic(expected = "at most 16")]
    fn test_too_many_parameters_panics() {
        let params = vec![RootParameter::ConstantBuffer { register: 0 }; 17];
        RootSignature::new(RootSignatureHandle::from_raw(2), params);
    }
}
