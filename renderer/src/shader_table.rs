use ash::vk::{BufferUsageFlags, DeviceAddress, StridedDeviceAddressRegionKHR};
use log::debug;
use vk_utils::buffer_resource::BufferResource;

use crate::context::RtxContext;
use crate::pipeline::{exports, StateObject};
use crate::resource_manager::ResourceManager;
use crate::root_signature::HitGroupArguments;
use crate::scene::Scene;
use crate::scene_layout::{HitGroupSlot, SceneLayout};
use crate::Result;

pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) / alignment * alignment
}

/// Fixed-stride layout of a table: every record occupies `stride` bytes, however small.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderTableLayout {
    record_size: u64,
    stride: u64,
    count: u64,
}

impl ShaderTableLayout {
    /// `record_size` is the largest record of the table, identifier included.
    pub fn new(record_size: u64, count: u64, record_alignment: u64) -> Self {
        Self {
            record_size,
            stride: align_up(record_size, record_alignment),
            count,
        }
    }

    pub fn record_size(&self) -> u64 {
        self.record_size
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn size(&self) -> u64 {
        self.stride * self.count
    }
}

/// Identifier followed by the record's local arguments.
#[derive(Clone, Copy, Debug)]
pub struct ShaderRecord<'a> {
    pub identifier: &'a [u8],
    pub arguments: &'a [u8],
}

impl<'a> ShaderRecord<'a> {
    pub fn new(identifier: &'a [u8]) -> Self {
        Self {
            identifier,
            arguments: &[],
        }
    }

    pub fn with_arguments(identifier: &'a [u8], arguments: &'a [u8]) -> Self {
        Self {
            identifier,
            arguments,
        }
    }

    pub fn size(&self) -> u64 {
        (self.identifier.len() + self.arguments.len()) as u64
    }
}

pub struct ShaderTable {
    buffer: BufferResource,
    offset: u64,
    layout: ShaderTableLayout,
}

impl ShaderTable {
    /// Upload-heap table whose first record starts on `base_alignment`.
    pub fn new(
        resources: &ResourceManager,
        layout: ShaderTableLayout,
        base_alignment: u64,
    ) -> Result<Self> {
        let buffer = resources.create_upload_buffer(
            layout.size() + base_alignment,
            BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
        )?;
        let address = buffer.device_address();
        let offset = align_up(address, base_alignment) - address;
        Ok(Self {
            buffer,
            offset,
            layout,
        })
    }

    /// Writes `records` from the first slot on. Each record is zero padded to the stride.
    pub fn write(&mut self, records: &[ShaderRecord]) -> Result<()> {
        let stride = self.layout.stride() as usize;
        let mut writer = self.buffer.upload_iterator_at(self.offset, stride)?;
        for record in records {
            writer.write_parts(&[record.identifier, record.arguments])?;
        }
        Ok(())
    }

    pub fn layout(&self) -> &ShaderTableLayout {
        &self.layout
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.buffer.device_address() + self.offset
    }

    pub fn region(&self) -> StridedDeviceAddressRegionKHR {
        *StridedDeviceAddressRegionKHR::builder()
            .device_address(self.device_address())
            .stride(self.layout.stride())
            .size(self.layout.size())
    }
}

/// Effective shader group and arguments of one hit-group record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HitGroupRecord {
    pub group: &'static str,
    pub arguments: Option<HitGroupArguments>,
}

/// Hit-group records in `layout` order: geometry records carry `arguments[i]`, the light
/// record and the visibility records carry only their identifier.
pub fn build_hit_group_records(
    layout: &SceneLayout,
    arguments: &[HitGroupArguments],
) -> Vec<HitGroupRecord> {
    layout
        .slots()
        .map(|slot| match slot {
            HitGroupSlot::Geometry(i) => HitGroupRecord {
                group: exports::HIT_GROUP,
                arguments: arguments.get(i).copied(),
            },
            HitGroupSlot::Light => HitGroupRecord {
                group: exports::LIGHT_HIT_GROUP,
                arguments: None,
            },
            HitGroupSlot::Visibility(_) => HitGroupRecord {
                group: exports::VISIBILITY_HIT_GROUP,
                arguments: None,
            },
        })
        .collect()
}

pub fn geometry_arguments(scene: &Scene) -> Vec<HitGroupArguments> {
    let shader_constants = scene.shader_constants_address();
    scene
        .geometries()
        .iter()
        .map(|geometry| {
            HitGroupArguments::new(
                shader_constants,
                geometry.indices.device_address(),
                geometry.normals.device_address(),
                geometry.uvs.device_address(),
                geometry.constants_address,
                geometry.texture_index(),
            )
        })
        .collect()
}

/// Ray generation, hit-group and miss tables of a scene.
pub struct ShaderTables {
    pub ray_gen: ShaderTable,
    pub hit_group: ShaderTable,
    pub miss: ShaderTable,
}

impl ShaderTables {
    pub fn new(
        resources: &ResourceManager,
        rtx: &RtxContext,
        state_object: &StateObject,
        scene: &Scene,
    ) -> Result<Self> {
        let properties = rtx.pipeline_properties();
        let record_alignment = properties.shader_group_handle_alignment as u64;
        let base_alignment = properties.shader_group_base_alignment as u64;
        let identifier_size = state_object.identifier_size() as u64;

        let ray_gen_id = state_object.shader_identifier(exports::RAY_GEN)?;
        let mut ray_gen = ShaderTable::new(
            resources,
            ShaderTableLayout::new(identifier_size, 1, record_alignment),
            base_alignment,
        )?;
        ray_gen.write(&[ShaderRecord::new(ray_gen_id)])?;

        let miss_records = [
            ShaderRecord::new(state_object.shader_identifier(exports::MISS)?),
            ShaderRecord::new(state_object.shader_identifier(exports::VISIBILITY_MISS)?),
        ];
        let mut miss = ShaderTable::new(
            resources,
            ShaderTableLayout::new(identifier_size, miss_records.len() as u64, record_alignment),
            base_alignment,
        )?;
        miss.write(&miss_records)?;

        let arguments = geometry_arguments(scene);
        let records = build_hit_group_records(scene.layout(), &arguments);
        let mut hit_records = Vec::with_capacity(records.len());
        for record in &records {
            let identifier = state_object.shader_identifier(record.group)?;
            hit_records.push(match &record.arguments {
                Some(arguments) => {
                    ShaderRecord::with_arguments(identifier, bytemuck::bytes_of(arguments))
                }
                None => ShaderRecord::new(identifier),
            });
        }
        let largest = hit_records
            .iter()
            .map(ShaderRecord::size)
            .max()
            .unwrap_or(identifier_size);
        let mut hit_group = ShaderTable::new(
            resources,
            ShaderTableLayout::new(largest, hit_records.len() as u64, record_alignment),
            base_alignment,
        )?;
        hit_group.write(&hit_records)?;

        debug!(
            "shader tables: ray gen stride {}, hit group {} x {}, miss {} x {}",
            ray_gen.layout().stride(),
            hit_group.layout().count(),
            hit_group.layout().stride(),
            miss.layout().count(),
            miss.layout().stride()
        );

        Ok(Self {
            ray_gen,
            hit_group,
            miss,
        })
    }

    /// Regions in `cmd_trace_rays` order: ray gen, miss, hit group, callable.
    pub fn regions(&self) -> [StridedDeviceAddressRegionKHR; 4] {
        [
            self.ray_gen.region(),
            self.miss.region(),
            self.hit_group.region(),
            StridedDeviceAddressRegionKHR::default(),
        ]
    }
}
