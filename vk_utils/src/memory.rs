use ash::vk::{MemoryPropertyFlags, PhysicalDeviceMemoryProperties};

use crate::{Error, Result};

/// Index of the first memory type allowed by `type_bits` that has every flag in `flags`.
pub fn memory_type_index(
    type_bits: u32,
    properties: &PhysicalDeviceMemoryProperties,
    flags: MemoryPropertyFlags,
) -> Result<u32> {
    properties.memory_types[..properties.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            (1 << index) & type_bits != 0 && memory_type.property_flags.contains(flags)
        })
        .map(|(index, _)| index as u32)
        .ok_or(Error::NoMemoryType { type_bits, flags })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::MemoryType;

    fn properties(types: &[MemoryPropertyFlags]) -> PhysicalDeviceMemoryProperties {
        let mut properties = PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, flags) in types.iter().enumerate() {
            properties.memory_types[i] = MemoryType {
                property_flags: *flags,
                heap_index: 0,
            };
        }
        properties
    }

    #[test]
    fn picks_first_type_with_all_flags() {
        let props = properties(&[
            MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryPropertyFlags::HOST_VISIBLE,
            MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let flags = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(memory_type_index(0b111, &props, flags).unwrap(), 2);
        assert_eq!(
            memory_type_index(0b111, &props, MemoryPropertyFlags::HOST_VISIBLE).unwrap(),
            1
        );
    }

    #[test]
    fn respects_type_bits() {
        let props = properties(&[
            MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(
            memory_type_index(0b10, &props, MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            1
        );
    }

    #[test]
    fn reports_missing_type() {
        let props = properties(&[MemoryPropertyFlags::DEVICE_LOCAL]);
        let err = memory_type_index(0b1, &props, MemoryPropertyFlags::HOST_VISIBLE).unwrap_err();
        assert!(matches!(err, Error::NoMemoryType { type_bits: 1, .. }));
    }
}
