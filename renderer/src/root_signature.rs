use std::rc::Rc;

use ash::vk::{
    AccelerationStructureKHR, BorderColor, DescriptorBufferInfo, DescriptorImageInfo,
    DescriptorPool, DescriptorPoolCreateInfo, DescriptorPoolSize, DescriptorSet,
    DescriptorSetAllocateInfo, DescriptorSetLayout, DescriptorSetLayoutBinding,
    DescriptorSetLayoutCreateInfo, DescriptorType, Filter, ImageLayout, ImageView,
    PipelineBindPoint, PipelineLayout, PipelineLayoutCreateInfo, PushConstantRange, Sampler,
    SamplerAddressMode, SamplerCreateInfo, SamplerMipmapMode, ShaderStageFlags,
    WriteDescriptorSet, WriteDescriptorSetAccelerationStructureKHR, WHOLE_SIZE,
};
use bytemuck::{Pod, Zeroable};
use log::debug;
use vk_utils::buffer_resource::BufferResource;
use vk_utils::command_buffer::CommandList;
use vk_utils::device_context::DeviceContext;

use crate::descriptor_heap::DescriptorHeap;
use crate::Result;

pub const SCENE_LOCATION: (u32, u32) = (0, 0);
pub const FILM_LOCATION: (u32, u32) = (0, 1);
pub const SAMPLER_LOCATION: (u32, u32) = (0, 2);
pub const LIGHTS_LOCATION: (u32, u32) = (0, 3);
pub const HALTON_ENTRIES_LOCATION: (u32, u32) = (0, 4);
pub const HALTON_PERMUTATIONS_LOCATION: (u32, u32) = (0, 5);
pub const TEXTURE_HEAP_SET: u32 = 1;

const GLOBAL_STAGES: ShaderStageFlags = ShaderStageFlags::from_raw(
    ShaderStageFlags::RAYGEN_KHR.as_raw()
        | ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
        | ShaderStageFlags::MISS_KHR.as_raw()
        | ShaderStageFlags::INTERSECTION_KHR.as_raw(),
);

/// Per-dispatch 32-bit constants, pushed before every trace.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawConstants {
    pub sample_index: u32,
}

/// Arguments bound once per dispatch: the scene, the film, a sampler, the lights and the
/// sampling tables in set 0, the per-dispatch constants as push constants and the texture
/// heap as set 1.
pub struct GlobalRootSignature {
    device: Rc<DeviceContext>,
    set_layout: DescriptorSetLayout,
    pool: DescriptorPool,
    set: DescriptorSet,
    pipeline_layout: PipelineLayout,
    sampler: Sampler,
}

impl GlobalRootSignature {
    pub fn new(device: Rc<DeviceContext>, heap: &DescriptorHeap) -> Result<Self> {
        let bindings = [
            *DescriptorSetLayoutBinding::builder()
                .binding(SCENE_LOCATION.1)
                .descriptor_count(1)
                .descriptor_type(DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .stage_flags(ShaderStageFlags::RAYGEN_KHR | ShaderStageFlags::CLOSEST_HIT_KHR),
            *DescriptorSetLayoutBinding::builder()
                .binding(FILM_LOCATION.1)
                .descriptor_count(1)
                .descriptor_type(DescriptorType::STORAGE_IMAGE)
                .stage_flags(ShaderStageFlags::RAYGEN_KHR),
            *DescriptorSetLayoutBinding::builder()
                .binding(SAMPLER_LOCATION.1)
                .descriptor_count(1)
                .descriptor_type(DescriptorType::SAMPLER)
                .stage_flags(GLOBAL_STAGES),
            *DescriptorSetLayoutBinding::builder()
                .binding(LIGHTS_LOCATION.1)
                .descriptor_count(1)
                .descriptor_type(DescriptorType::STORAGE_BUFFER)
                .stage_flags(GLOBAL_STAGES),
            *DescriptorSetLayoutBinding::builder()
                .binding(HALTON_ENTRIES_LOCATION.1)
                .descriptor_count(1)
                .descriptor_type(DescriptorType::STORAGE_BUFFER)
                .stage_flags(GLOBAL_STAGES),
            *DescriptorSetLayoutBinding::builder()
                .binding(HALTON_PERMUTATIONS_LOCATION.1)
                .descriptor_count(1)
                .descriptor_type(DescriptorType::STORAGE_BUFFER)
                .stage_flags(GLOBAL_STAGES),
        ];

        let sizes = [
            DescriptorPoolSize {
                ty: DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: 1,
            },
            DescriptorPoolSize {
                ty: DescriptorType::STORAGE_IMAGE,
                descriptor_count: 1,
            },
            DescriptorPoolSize {
                ty: DescriptorType::SAMPLER,
                descriptor_count: 1,
            },
            // lights + halton entries + halton permutations
            DescriptorPoolSize {
                ty: DescriptorType::STORAGE_BUFFER,
                descriptor_count: 3,
            },
        ];

        let vk_device = device.vk_device();
        unsafe {
            let set_layout = vk_device.create_descriptor_set_layout(
                &DescriptorSetLayoutCreateInfo::builder().bindings(&bindings),
                None,
            )?;

            let set_layouts = [set_layout, heap.layout()];
            let constant_ranges = [*PushConstantRange::builder()
                .size(std::mem::size_of::<DrawConstants>() as u32)
                .stage_flags(GLOBAL_STAGES)];
            let pipeline_layout = vk_device.create_pipeline_layout(
                &PipelineLayoutCreateInfo::builder()
                    .set_layouts(&set_layouts)
                    .push_constant_ranges(&constant_ranges),
                None,
            )?;

            let pool = vk_device.create_descriptor_pool(
                &DescriptorPoolCreateInfo::builder()
                    .max_sets(1)
                    .pool_sizes(&sizes),
                None,
            )?;
            let layouts = [set_layout];
            let set = vk_device.allocate_descriptor_sets(
                &DescriptorSetAllocateInfo::builder()
                    .descriptor_pool(pool)
                    .set_layouts(&layouts),
            )?[0];

            let sampler = vk_device.create_sampler(
                &SamplerCreateInfo::builder()
                    .mag_filter(Filter::LINEAR)
                    .min_filter(Filter::LINEAR)
                    .mipmap_mode(SamplerMipmapMode::LINEAR)
                    .address_mode_u(SamplerAddressMode::REPEAT)
                    .address_mode_v(SamplerAddressMode::REPEAT)
                    .address_mode_w(SamplerAddressMode::REPEAT)
                    .border_color(BorderColor::FLOAT_OPAQUE_BLACK)
                    .max_lod(ash::vk::LOD_CLAMP_NONE),
                None,
            )?;

            let signature = Self {
                device: device.clone(),
                set_layout,
                pool,
                set,
                pipeline_layout,
                sampler,
            };
            signature.write_sampler();
            debug!("global root signature {:?}", pipeline_layout);
            Ok(signature)
        }
    }

    pub fn pipeline_layout(&self) -> PipelineLayout {
        self.pipeline_layout
    }

    pub fn set(&self) -> DescriptorSet {
        self.set
    }

    fn write_sampler(&self) {
        let image_info = [*DescriptorImageInfo::builder().sampler(self.sampler)];
        let writes = [*WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(SAMPLER_LOCATION.1)
            .descriptor_type(DescriptorType::SAMPLER)
            .image_info(&image_info)];
        unsafe { self.device.vk_device().update_descriptor_sets(&writes, &[]) };
    }

    pub fn write_scene(&self, top_level: AccelerationStructureKHR) {
        let structures = [top_level];
        let mut acceleration_write =
            *WriteDescriptorSetAccelerationStructureKHR::builder().acceleration_structures(&structures);
        let mut writes = [*WriteDescriptorSet::builder()
            .push_next(&mut acceleration_write)
            .dst_set(self.set)
            .dst_binding(SCENE_LOCATION.1)
            .descriptor_type(DescriptorType::ACCELERATION_STRUCTURE_KHR)];
        writes[0].descriptor_count = 1;
        unsafe { self.device.vk_device().update_descriptor_sets(&writes, &[]) };
    }

    /// Binds the film, which must be in `GENERAL` layout whenever rays are traced.
    pub fn write_film(&self, view: ImageView) {
        let image_info = [*DescriptorImageInfo::builder()
            .image_view(view)
            .image_layout(ImageLayout::GENERAL)];
        let writes = [*WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(FILM_LOCATION.1)
            .descriptor_type(DescriptorType::STORAGE_IMAGE)
            .image_info(&image_info)];
        unsafe { self.device.vk_device().update_descriptor_sets(&writes, &[]) };
    }

    fn write_storage_buffer(&self, binding: u32, buffer: &BufferResource) {
        let buffer_info = [*DescriptorBufferInfo::builder()
            .buffer(buffer.vk_buffer())
            .range(WHOLE_SIZE)];
        let writes = [*WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(binding)
            .descriptor_type(DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffer_info)];
        unsafe { self.device.vk_device().update_descriptor_sets(&writes, &[]) };
    }

    pub fn write_lights(&self, lights: &BufferResource) {
        self.write_storage_buffer(LIGHTS_LOCATION.1, lights)
    }

    pub fn write_sampling_tables(&self, entries: &BufferResource, permutations: &BufferResource) {
        self.write_storage_buffer(HALTON_ENTRIES_LOCATION.1, entries);
        self.write_storage_buffer(HALTON_PERMUTATIONS_LOCATION.1, permutations);
    }

    /// Binds set 0, the texture heap and the per-dispatch constants.
    pub fn bind(&self, list: &CommandList, heap: &DescriptorHeap, constants: &DrawConstants) {
        let sets = [self.set, heap.set()];
        unsafe {
            self.device.vk_device().cmd_bind_descriptor_sets(
                list.vk_command_buffer(),
                PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline_layout,
                0,
                &sets,
                &[],
            );
            self.device.vk_device().cmd_push_constants(
                list.vk_command_buffer(),
                self.pipeline_layout,
                GLOBAL_STAGES,
                0,
                bytemuck::bytes_of(constants),
            );
        }
    }
}

impl Drop for GlobalRootSignature {
    fn drop(&mut self) {
        let vk_device = self.device.vk_device();
        unsafe {
            vk_device.destroy_sampler(self.sampler, None);
            vk_device.destroy_descriptor_pool(self.pool, None);
            vk_device.destroy_pipeline_layout(self.pipeline_layout, None);
            vk_device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// One argument of a shader record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalParameter {
    /// Buffer device address.
    Address,
    /// Index into the texture heap.
    DescriptorIndex,
}

impl LocalParameter {
    pub fn size(&self) -> usize {
        match self {
            LocalParameter::Address => 8,
            LocalParameter::DescriptorIndex => 4,
        }
    }

    pub fn alignment(&self) -> usize {
        self.size()
    }
}

/// Declared argument list of the records of the hit groups it is associated with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalRootSignature {
    parameters: Vec<(&'static str, LocalParameter)>,
}

impl LocalRootSignature {
    pub fn new(parameters: Vec<(&'static str, LocalParameter)>) -> Self {
        Self { parameters }
    }

    /// Arguments of a geometry hit record, in declared order.
    pub fn hit_group() -> Self {
        Self::new(vec![
            ("ShaderConstants", LocalParameter::Address),
            ("Indices", LocalParameter::Address),
            ("Normals", LocalParameter::Address),
            ("UVs", LocalParameter::Address),
            ("GeometryConstants", LocalParameter::Address),
            ("Texture", LocalParameter::DescriptorIndex),
        ])
    }

    pub fn parameters(&self) -> &[(&'static str, LocalParameter)] {
        &self.parameters
    }

    /// Byte offset of every parameter after the shader identifier.
    pub fn offsets(&self) -> Vec<usize> {
        let mut offset = 0;
        self.parameters
            .iter()
            .map(|(_, parameter)| {
                offset = align_to(offset, parameter.alignment());
                let current = offset;
                offset += parameter.size();
                current
            })
            .collect()
    }

    /// Size of the argument block, padded to its largest alignment.
    pub fn record_size(&self) -> usize {
        let alignment = self
            .parameters
            .iter()
            .map(|(_, parameter)| parameter.alignment())
            .max()
            .unwrap_or(1);
        let end = self
            .parameters
            .last()
            .zip(self.offsets().last())
            .map_or(0, |((_, parameter), offset)| offset + parameter.size());
        align_to(end, alignment)
    }
}

fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

/// Arguments of a geometry hit record, laid out as `LocalRootSignature::hit_group` declares.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct HitGroupArguments {
    pub shader_constants: u64,
    pub indices: u64,
    pub normals: u64,
    pub uvs: u64,
    pub geometry_constants: u64,
    pub texture: u32,
    _pad: u32,
}

impl HitGroupArguments {
    pub fn new(
        shader_constants: u64,
        indices: u64,
        normals: u64,
        uvs: u64,
        geometry_constants: u64,
        texture: u32,
    ) -> Self {
        Self {
            shader_constants,
            indices,
            normals,
            uvs,
            geometry_constants,
            texture,
            _pad: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_group_record_matches_its_struct() {
        let signature = LocalRootSignature::hit_group();
        assert_eq!(signature.offsets(), vec![0, 8, 16, 24, 32, 40]);
        assert_eq!(signature.record_size(), 48);
        assert_eq!(
            signature.record_size(),
            std::mem::size_of::<HitGroupArguments>()
        );
    }

    #[test]
    fn texture_index_follows_the_addresses() {
        let arguments = HitGroupArguments::new(1, 2, 3, 4, 5, 7);
        let bytes = bytemuck::bytes_of(&arguments);
        assert_eq!(&bytes[32..40], &5u64.to_ne_bytes());
        assert_eq!(&bytes[40..44], &7u32.to_ne_bytes());
    }

    #[test]
    fn misaligned_parameters_are_padded() {
        let signature = LocalRootSignature::new(vec![
            ("Index", LocalParameter::DescriptorIndex),
            ("Address", LocalParameter::Address),
        ]);
        assert_eq!(signature.offsets(), vec![0, 8]);
        assert_eq!(signature.record_size(), 16);
    }

    #[test]
    fn empty_signature_has_no_arguments() {
        assert_eq!(LocalRootSignature::new(Vec::new()).record_size(), 0);
    }
}
