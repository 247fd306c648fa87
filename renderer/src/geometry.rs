use ash::vk::{
    AabbPositionsKHR, AccelerationStructureBuildGeometryInfoKHR,
    AccelerationStructureBuildRangeInfoKHR, AccelerationStructureBuildTypeKHR,
    AccelerationStructureCreateInfoKHR, AccelerationStructureDeviceAddressInfoKHR,
    AccelerationStructureGeometryAabbsDataKHR, AccelerationStructureGeometryDataKHR,
    AccelerationStructureGeometryInstancesDataKHR, AccelerationStructureGeometryKHR,
    AccelerationStructureGeometryTrianglesDataKHR, AccelerationStructureKHR,
    AccelerationStructureTypeKHR, AccessFlags, BufferUsageFlags,
    BuildAccelerationStructureFlagsKHR, BuildAccelerationStructureModeKHR, DeviceAddress,
    DeviceOrHostAddressConstKHR, DeviceOrHostAddressKHR, Format, GeometryFlagsKHR,
    GeometryInstanceFlagsKHR, GeometryTypeKHR, IndexType, PipelineStageFlags,
};
use bytemuck::{Pod, Zeroable};
use log::{debug, info};
use vk_utils::buffer_resource::BufferResource;

use crate::context::{Context, RtxContext};
use crate::resource_manager::ResourceManager;
use crate::Result;

/// Row-major 3x4 object-to-world transform as consumed by acceleration structure builds.
pub type Transform3x4 = [f32; 12];

pub const IDENTITY_TRANSFORM: Transform3x4 = [1., 0., 0., 0., 0., 1., 0., 0., 0., 0., 1., 0.];

pub const TRANSFORM_SIZE: u64 = std::mem::size_of::<Transform3x4>() as u64;

const POSITION_STRIDE: u64 = 12;

/// Usage required of buffers read by acceleration structure builds.
pub const BUILD_INPUT_USAGE: BufferUsageFlags =
    BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;

/// Instance record of a top-level build.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GeometryInstance {
    transform: Transform3x4,
    id_and_mask: u32,
    hit_group_offset_and_flags: u32,
    acceleration_structure_handle: u64,
}

impl GeometryInstance {
    pub fn new(
        transform: Transform3x4,
        instance_id: u32,
        mask: u8,
        hit_group_offset: u32,
        flags: GeometryInstanceFlagsKHR,
        acceleration_structure_handle: u64,
    ) -> Self {
        let id_and_mask = ((mask as u32) << 24) | (instance_id & 0x00ff_ffff);
        let hit_group_offset_and_flags =
            ((flags.as_raw() & 0xff) << 24) | (hit_group_offset & 0x00ff_ffff);
        Self {
            transform,
            id_and_mask,
            hit_group_offset_and_flags,
            acceleration_structure_handle,
        }
    }

    pub fn instance_id(&self) -> u32 {
        self.id_and_mask & 0x00ff_ffff
    }

    pub fn mask(&self) -> u8 {
        (self.id_and_mask >> 24) as u8
    }

    pub fn hit_group_offset(&self) -> u32 {
        self.hit_group_offset_and_flags & 0x00ff_ffff
    }

    pub fn flags(&self) -> GeometryInstanceFlagsKHR {
        GeometryInstanceFlagsKHR::from_raw(self.hit_group_offset_and_flags >> 24)
    }
}

/// Triangle geometry read from device buffers.
#[derive(Clone, Copy, Debug)]
pub struct TriangleGeometry {
    pub vertex_address: DeviceAddress,
    pub vertex_count: u32,
    pub index_address: DeviceAddress,
    pub index_count: u32,
    /// Address of a `Transform3x4`, or 0 for identity.
    pub transform_address: DeviceAddress,
}

/// One geometry of a bottom-level structure.
#[derive(Clone, Copy, Debug)]
pub enum GeometryDesc {
    Triangles(TriangleGeometry),
    /// Procedural primitives bounded by `count` boxes of `AabbPositionsKHR` at `address`.
    Aabbs {
        address: DeviceAddress,
        count: u32,
    },
}

impl GeometryDesc {
    pub fn primitive_count(&self) -> u32 {
        match self {
            GeometryDesc::Triangles(triangles) => triangles.index_count / 3,
            GeometryDesc::Aabbs { count, .. } => *count,
        }
    }

    fn vk_geometry(&self) -> AccelerationStructureGeometryKHR {
        match self {
            GeometryDesc::Triangles(triangles) => {
                let data = AccelerationStructureGeometryTrianglesDataKHR::builder()
                    .vertex_format(Format::R32G32B32_SFLOAT)
                    .vertex_data(DeviceOrHostAddressConstKHR {
                        device_address: triangles.vertex_address,
                    })
                    .vertex_stride(POSITION_STRIDE)
                    .max_vertex(triangles.vertex_count.saturating_sub(1))
                    .index_type(IndexType::UINT32)
                    .index_data(DeviceOrHostAddressConstKHR {
                        device_address: triangles.index_address,
                    })
                    .transform_data(DeviceOrHostAddressConstKHR {
                        device_address: triangles.transform_address,
                    })
                    .build();
                AccelerationStructureGeometryKHR::builder()
                    .geometry_type(GeometryTypeKHR::TRIANGLES)
                    .geometry(AccelerationStructureGeometryDataKHR { triangles: data })
                    .flags(GeometryFlagsKHR::OPAQUE)
                    .build()
            }
            GeometryDesc::Aabbs { address, .. } => {
                let data = AccelerationStructureGeometryAabbsDataKHR::builder()
                    .data(DeviceOrHostAddressConstKHR {
                        device_address: *address,
                    })
                    .stride(std::mem::size_of::<AabbPositionsKHR>() as u64)
                    .build();
                AccelerationStructureGeometryKHR::builder()
                    .geometry_type(GeometryTypeKHR::AABBS)
                    .geometry(AccelerationStructureGeometryDataKHR { aabbs: data })
                    .flags(GeometryFlagsKHR::OPAQUE)
                    .build()
            }
        }
    }
}

/// Geometry list of one bottom-level structure. Geometry `i` is hit-group `base + i`
/// of every instance referencing it.
#[derive(Clone, Debug, Default)]
pub struct BottomLevelDesc {
    pub geometries: Vec<GeometryDesc>,
}

impl BottomLevelDesc {
    pub fn triangles(geometries: impl IntoIterator<Item = TriangleGeometry>) -> Self {
        Self {
            geometries: geometries.into_iter().map(GeometryDesc::Triangles).collect(),
        }
    }

    pub fn procedural(address: DeviceAddress, count: u32) -> Self {
        Self {
            geometries: vec![GeometryDesc::Aabbs { address, count }],
        }
    }
}

/// Instance of a bottom-level structure, referenced by its index in the builder.
#[derive(Clone, Copy, Debug)]
pub struct InstanceDesc {
    pub bottom_level: usize,
    pub transform: Transform3x4,
    pub mask: u8,
    pub hit_group_base: u32,
}

pub struct AccelerationStructure {
    rtx: RtxContext,
    handle: AccelerationStructureKHR,
    address: DeviceAddress,
    _buffer: BufferResource,
}

impl AccelerationStructure {
    fn new(
        resources: &ResourceManager,
        rtx: &RtxContext,
        ty: AccelerationStructureTypeKHR,
        size: u64,
    ) -> Result<Self> {
        let buffer = resources.create_buffer(
            size,
            BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
        )?;
        let create_info = AccelerationStructureCreateInfoKHR::builder()
            .size(size)
            .ty(ty)
            .buffer(buffer.vk_buffer());
        unsafe {
            let handle = rtx
                .acceleration_structure_ext()
                .create_acceleration_structure(&create_info, None)?;
            let address_info =
                AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(handle);
            let address = rtx
                .acceleration_structure_ext()
                .get_acceleration_structure_device_address(&address_info);
            Ok(Self {
                rtx: rtx.clone(),
                handle,
                address,
                _buffer: buffer,
            })
        }
    }

    pub fn handle(&self) -> AccelerationStructureKHR {
        self.handle
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.rtx
                .acceleration_structure_ext()
                .destroy_acceleration_structure(self.handle, None)
        }
    }
}

/// Built structures. Never rebuilt or refitted.
pub struct AccelerationStructures {
    pub bottom_levels: Vec<AccelerationStructure>,
    pub top_level: AccelerationStructure,
    pub instances: Vec<GeometryInstance>,
    _instance_buffer: BufferResource,
}

fn build_sizes(
    rtx: &RtxContext,
    ty: AccelerationStructureTypeKHR,
    geometries: &[AccelerationStructureGeometryKHR],
    primitive_counts: &[u32],
) -> ash::vk::AccelerationStructureBuildSizesInfoKHR {
    let build_info = AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(ty)
        .flags(BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(BuildAccelerationStructureModeKHR::BUILD)
        .geometries(geometries);
    unsafe {
        rtx.acceleration_structure_ext()
            .get_acceleration_structure_build_sizes(
                AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                primitive_counts,
            )
    }
}

/// Scratch memory with its first aligned address.
struct Scratch {
    _buffer: BufferResource,
    address: DeviceAddress,
}

impl Scratch {
    fn new(resources: &ResourceManager, size: u64, alignment: u64) -> Result<Self> {
        let alignment = alignment.max(1);
        let buffer = resources.create_buffer(size + alignment, BufferUsageFlags::STORAGE_BUFFER)?;
        let address = (buffer.device_address() + alignment - 1) / alignment * alignment;
        Ok(Self {
            _buffer: buffer,
            address,
        })
    }
}

/// Collects bottom-level descriptions and instances, then builds everything in a single
/// submission with a barrier between the bottom-level builds and the top-level build.
pub struct AccelerationStructureBuilder<'a> {
    resources: &'a ResourceManager,
    rtx: &'a RtxContext,
    bottom_levels: Vec<BottomLevelDesc>,
    instances: Vec<InstanceDesc>,
}

impl<'a> AccelerationStructureBuilder<'a> {
    pub fn new(resources: &'a ResourceManager, rtx: &'a RtxContext) -> Self {
        Self {
            resources,
            rtx,
            bottom_levels: Vec::new(),
            instances: Vec::new(),
        }
    }

    /// Returns the index instances use to reference the structure.
    pub fn add_bottom_level(&mut self, desc: BottomLevelDesc) -> usize {
        self.bottom_levels.push(desc);
        self.bottom_levels.len() - 1
    }

    pub fn add_instance(&mut self, instance: InstanceDesc) {
        self.instances.push(instance);
    }

    pub fn build(self, context: &Context) -> Result<AccelerationStructures> {
        let scratch_alignment = self
            .rtx
            .acceleration_structure_properties()
            .min_acceleration_structure_scratch_offset_alignment as u64;

        let mut geometry_lists = Vec::with_capacity(self.bottom_levels.len());
        let mut range_lists = Vec::with_capacity(self.bottom_levels.len());
        let mut bottom_levels = Vec::with_capacity(self.bottom_levels.len());
        let mut scratches = Vec::with_capacity(self.bottom_levels.len() + 1);

        for desc in &self.bottom_levels {
            let geometries: Vec<AccelerationStructureGeometryKHR> =
                desc.geometries.iter().map(GeometryDesc::vk_geometry).collect();
            let primitive_counts: Vec<u32> =
                desc.geometries.iter().map(GeometryDesc::primitive_count).collect();
            let sizes = build_sizes(
                self.rtx,
                AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                &geometries,
                &primitive_counts,
            );
            bottom_levels.push(AccelerationStructure::new(
                self.resources,
                self.rtx,
                AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                sizes.acceleration_structure_size,
            )?);
            scratches.push(Scratch::new(
                self.resources,
                sizes.build_scratch_size,
                scratch_alignment,
            )?);
            range_lists.push(
                primitive_counts
                    .iter()
                    .map(|&count| {
                        AccelerationStructureBuildRangeInfoKHR::builder()
                            .primitive_count(count)
                            .build()
                    })
                    .collect::<Vec<_>>(),
            );
            geometry_lists.push(geometries);
        }

        let instances: Vec<GeometryInstance> = self
            .instances
            .iter()
            .map(|instance| {
                GeometryInstance::new(
                    instance.transform,
                    0,
                    instance.mask,
                    instance.hit_group_base,
                    GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
                    bottom_levels[instance.bottom_level].address(),
                )
            })
            .collect();

        let instance_stride = std::mem::size_of::<GeometryInstance>();
        let mut instance_buffer = self.resources.create_upload_buffer(
            (instances.len().max(1) * instance_stride) as u64,
            BUILD_INPUT_USAGE,
        )?;
        {
            let mut writer = instance_buffer.upload_iterator(instance_stride)?;
            for instance in &instances {
                writer.write(instance)?;
            }
        }

        let instance_geometry = [AccelerationStructureGeometryKHR::builder()
            .geometry_type(GeometryTypeKHR::INSTANCES)
            .geometry(AccelerationStructureGeometryDataKHR {
                instances: AccelerationStructureGeometryInstancesDataKHR::builder()
                    .array_of_pointers(false)
                    .data(DeviceOrHostAddressConstKHR {
                        device_address: instance_buffer.device_address(),
                    })
                    .build(),
            })
            .build()];
        let instance_count = [instances.len() as u32];
        let sizes = build_sizes(
            self.rtx,
            AccelerationStructureTypeKHR::TOP_LEVEL,
            &instance_geometry,
            &instance_count,
        );
        let top_level = AccelerationStructure::new(
            self.resources,
            self.rtx,
            AccelerationStructureTypeKHR::TOP_LEVEL,
            sizes.acceleration_structure_size,
        )?;
        let top_scratch = Scratch::new(self.resources, sizes.build_scratch_size, scratch_alignment)?;
        let top_ranges = [AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(instances.len() as u32)
            .build()];

        context.execute(|list| {
            let command_buffer = list.vk_command_buffer();
            for (i, blas) in bottom_levels.iter().enumerate() {
                let build_info = AccelerationStructureBuildGeometryInfoKHR::builder()
                    .ty(AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                    .flags(BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
                    .mode(BuildAccelerationStructureModeKHR::BUILD)
                    .dst_acceleration_structure(blas.handle())
                    .geometries(&geometry_lists[i])
                    .scratch_data(DeviceOrHostAddressKHR {
                        device_address: scratches[i].address,
                    })
                    .build();
                unsafe {
                    self.rtx
                        .acceleration_structure_ext()
                        .cmd_build_acceleration_structures(
                            command_buffer,
                            &[build_info],
                            &[&range_lists[i]],
                        );
                }
                list.memory_barrier(
                    PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                    PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                        | AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                );
            }

            let build_info = AccelerationStructureBuildGeometryInfoKHR::builder()
                .ty(AccelerationStructureTypeKHR::TOP_LEVEL)
                .flags(BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
                .mode(BuildAccelerationStructureModeKHR::BUILD)
                .dst_acceleration_structure(top_level.handle())
                .geometries(&instance_geometry)
                .scratch_data(DeviceOrHostAddressKHR {
                    device_address: top_scratch.address,
                })
                .build();
            unsafe {
                self.rtx
                    .acceleration_structure_ext()
                    .cmd_build_acceleration_structures(
                        command_buffer,
                        &[build_info],
                        &[&top_ranges],
                    );
            }
            list.memory_barrier(
                PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
            );
            Ok(())
        })?;

        debug!(
            "acceleration structures: {} bottom level, tlas at {:#x}",
            bottom_levels.len(),
            top_level.address()
        );
        info!(
            "built {} bottom-level structures and a top-level structure over {} instances",
            bottom_levels.len(),
            instances.len()
        );

        Ok(AccelerationStructures {
            bottom_levels,
            top_level,
            instances,
            _instance_buffer: instance_buffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_record_is_64_bytes() {
        assert_eq!(std::mem::size_of::<GeometryInstance>(), 64);
        assert_eq!(
            std::mem::size_of::<GeometryInstance>(),
            std::mem::size_of::<ash::vk::AccelerationStructureInstanceKHR>()
        );
    }

    #[test]
    fn instance_packs_mask_and_hit_group_base() {
        let instance = GeometryInstance::new(
            IDENTITY_TRANSFORM,
            5,
            0xff,
            3,
            GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            0xdead_beef,
        );
        assert_eq!(instance.instance_id(), 5);
        assert_eq!(instance.mask(), 0xff);
        assert_eq!(instance.hit_group_offset(), 3);
        assert_eq!(
            instance.flags(),
            GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE
        );
        let bytes = bytemuck::bytes_of(&instance);
        assert_eq!(&bytes[56..64], &0xdead_beefu64.to_ne_bytes());
    }

    #[test]
    fn triangle_primitive_count_comes_from_indices() {
        let geometry = GeometryDesc::Triangles(TriangleGeometry {
            vertex_address: 0,
            vertex_count: 100,
            index_address: 0,
            index_count: 150,
            transform_address: 0,
        });
        assert_eq!(geometry.primitive_count(), 50);
        assert_eq!(
            GeometryDesc::Aabbs {
                address: 0,
                count: 4
            }
            .primitive_count(),
            4
        );
    }

    #[test]
    fn bottom_level_keeps_geometry_order() {
        let make = |index_count| TriangleGeometry {
            vertex_address: 0,
            vertex_count: 3,
            index_address: 0,
            index_count,
            transform_address: 0,
        };
        let desc = BottomLevelDesc::triangles([make(3), make(6), make(9)]);
        let counts: Vec<u32> = desc.geometries.iter().map(|g| g.primitive_count()).collect();
        assert_eq!(counts, vec![1, 2, 3]);
    }
}
