/// Counters of everything the device has been asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub queues_created: u64,
    pub fences_created: u64,
    pub command_buffers_created: u64,
    pub command_buffer_resets: u64,
    pub command_buffers_executed: u64,
    pub resources_created: u64,
    pub resources_destroyed: u64,
    pub descriptor_heaps_created: u64,
    pub descriptor_heaps_destroyed: u64,
    pub transition_barriers: u64,
    pub uav_barriers: u64,
    pub barrier_batches: u64,
    pub copy_descriptor_calls: u64,
    pub descriptors_copied: u64,
    pub buffer_copies: u64,
    pub texture_copies: u64,
    pub draws: u64,
    pub dispatches: u64,
    pub signals: u64,
    pub queue_waits: u64,
}
