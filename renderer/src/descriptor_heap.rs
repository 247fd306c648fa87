use std::cell::Cell;
use std::rc::Rc;

use ash::vk::{
    DescriptorBindingFlags, DescriptorImageInfo, DescriptorPool, DescriptorPoolCreateInfo,
    DescriptorPoolSize, DescriptorSet, DescriptorSetAllocateInfo, DescriptorSetLayout,
    DescriptorSetLayoutBinding, DescriptorSetLayoutBindingFlagsCreateInfo,
    DescriptorSetLayoutCreateInfo, DescriptorType, ImageLayout, ImageView, ShaderStageFlags,
    WriteDescriptorSet,
};
use log::debug;
use vk_utils::device_context::DeviceContext;

use crate::{Error, Result};

/// Binding of the sampled image array inside the heap set.
pub const HEAP_TEXTURE_BINDING: u32 = 0;

/// Where a descriptor is written from the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuDescriptorHandle {
    pub set: DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
}

/// Index shaders use to reach the descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuDescriptorHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorHandles {
    pub cpu: CpuDescriptorHandle,
    pub gpu: GpuDescriptorHandle,
}

/// Hands out consecutive slots of a fixed capacity.
#[derive(Debug)]
pub struct BumpRange {
    capacity: u32,
    next: Cell<u32>,
}

impl BumpRange {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            next: Cell::new(0),
        }
    }

    pub fn allocate(&self) -> Result<u32> {
        let slot = self.next.get();
        if slot >= self.capacity {
            return Err(Error::DescriptorHeapExhausted {
                capacity: self.capacity,
            });
        }
        self.next.set(slot + 1);
        Ok(slot)
    }

    pub fn len(&self) -> u32 {
        self.next.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Shader-visible descriptor set holding a partially bound array of sampled images.
/// Slots are allocated in order and never freed.
pub struct DescriptorHeap {
    device: Rc<DeviceContext>,
    pool: DescriptorPool,
    layout: DescriptorSetLayout,
    set: DescriptorSet,
    range: BumpRange,
}

impl DescriptorHeap {
    pub fn new(device: Rc<DeviceContext>, capacity: u32) -> Result<Self> {
        let vk_device = device.vk_device();
        let bindings = [DescriptorSetLayoutBinding::builder()
            .binding(HEAP_TEXTURE_BINDING)
            .descriptor_type(DescriptorType::SAMPLED_IMAGE)
            .descriptor_count(capacity)
            .stage_flags(
                ShaderStageFlags::RAYGEN_KHR
                    | ShaderStageFlags::CLOSEST_HIT_KHR
                    | ShaderStageFlags::MISS_KHR,
            )
            .build()];
        let binding_flags = [DescriptorBindingFlags::PARTIALLY_BOUND];
        let mut flags_info =
            DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&binding_flags);
        let layout_info = DescriptorSetLayoutCreateInfo::builder()
            .bindings(&bindings)
            .push_next(&mut flags_info);

        let pool_sizes = [DescriptorPoolSize {
            ty: DescriptorType::SAMPLED_IMAGE,
            descriptor_count: capacity,
        }];
        let pool_info = DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(1);

        unsafe {
            let layout = vk_device.create_descriptor_set_layout(&layout_info, None)?;
            let pool = vk_device.create_descriptor_pool(&pool_info, None)?;
            let layouts = [layout];
            let allocate_info = DescriptorSetAllocateInfo::builder()
                .descriptor_pool(pool)
                .set_layouts(&layouts);
            let set = vk_device.allocate_descriptor_sets(&allocate_info)?[0];

            debug!("descriptor heap with {} slots", capacity);

            Ok(Self {
                device,
                pool,
                layout,
                set,
                range: BumpRange::new(capacity),
            })
        }
    }

    /// Next free slot as a host write location and shader index pair.
    pub fn allocate(&self) -> Result<DescriptorHandles> {
        let slot = self.range.allocate()?;
        Ok(DescriptorHandles {
            cpu: CpuDescriptorHandle {
                set: self.set,
                binding: HEAP_TEXTURE_BINDING,
                array_element: slot,
            },
            gpu: GpuDescriptorHandle(slot),
        })
    }

    pub fn write_sampled_image(
        &self,
        handle: CpuDescriptorHandle,
        view: ImageView,
        layout: ImageLayout,
    ) {
        let image_info = [DescriptorImageInfo::builder()
            .image_view(view)
            .image_layout(layout)
            .build()];
        let write = WriteDescriptorSet::builder()
            .dst_set(handle.set)
            .dst_binding(handle.binding)
            .dst_array_element(handle.array_element)
            .descriptor_type(DescriptorType::SAMPLED_IMAGE)
            .image_info(&image_info)
            .build();
        unsafe { self.device.vk_device().update_descriptor_sets(&[write], &[]) };
    }

    pub fn set(&self) -> DescriptorSet {
        self.set
    }

    pub fn layout(&self) -> DescriptorSetLayout {
        self.layout
    }

    pub fn capacity(&self) -> u32 {
        self.range.capacity()
    }

    pub fn len(&self) -> u32 {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

impl Drop for DescriptorHeap {
    fn drop(&mut self) {
        unsafe {
            self.device
                .vk_device()
                .destroy_descriptor_pool(self.pool, None);
            self.device
                .vk_device()
                .destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_come_out_in_order() {
        let range = BumpRange::new(3);
        assert!(range.is_empty());
        assert_eq!(range.allocate().unwrap(), 0);
        assert_eq!(range.allocate().unwrap(), 1);
        assert_eq!(range.allocate().unwrap(), 2);
        assert_eq!(range.len(), 3);
    }

    #[test]
    fn exhaustion_is_reported_and_sticky() {
        let range = BumpRange::new(1);
        range.allocate().unwrap();
        for _ in 0..2 {
            assert!(matches!(
                range.allocate(),
                Err(Error::DescriptorHeapExhausted { capacity: 1 })
            ));
        }
        assert_eq!(range.len(), 1);
    }

    #[test]
    fn zero_capacity_never_allocates() {
        assert!(BumpRange::new(0).allocate().is_err());
    }
}
