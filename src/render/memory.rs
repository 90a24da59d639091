//! Device memory type selection

use ash::vk;

use crate::error::{GpuError, GpuResult};

/// First memory type whose bit is set in `type_bits` and whose property
/// flags contain all of `required`.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> GpuResult<u32> {
    properties
        .memory_types
        .iter()
        .take(properties.memory_type_count as usize)
        .enumerate()
        .find(|(index, memory_type)| {
            type_bits & (1 << index) != 0 && memory_type.property_flags.contains(required)
        })
        .map(|(index, _)| index as u32)
        .ok_or(GpuError::NoCompatibleMemoryType {
            type_bits,
            flags: required,
        })
}
