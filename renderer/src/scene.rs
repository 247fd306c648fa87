use std::path::PathBuf;

use ash::vk::BufferUsageFlags;
use bytemuck::{Pod, Zeroable};
use log::{debug, info};
use nalgebra_glm as glm;
use vk_utils::buffer_resource::{BufferResource, MappedBuffer};
use vk_utils::image_resource::Image2DResource;

use crate::config::RendererConfig;
use crate::context::{Context, RtxContext};
use crate::descriptor_heap::{DescriptorHandles, DescriptorHeap};
use crate::geometry::{
    AccelerationStructureBuilder, AccelerationStructures, BottomLevelDesc, InstanceDesc,
    Transform3x4, TriangleGeometry, BUILD_INPUT_USAGE, IDENTITY_TRANSFORM, TRANSFORM_SIZE,
};
use crate::mesh::Mesh;
use crate::resource_manager::ResourceManager;
use crate::scene_layout::SceneLayout;
use crate::Result;

/// Sphere light as laid out in the light storage buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SphereLight {
    pub position: [f32; 3],
    pub radius: f32,
    /// Emitted radiance.
    pub l: [f32; 3],
    _pad: f32,
}

impl SphereLight {
    pub fn new(position: [f32; 3], radius: f32, l: [f32; 3]) -> Self {
        Self {
            position,
            radius,
            l,
            _pad: 0.0,
        }
    }

    /// Bounds as `AabbPositionsKHR` (min xyz, max xyz).
    pub fn aabb(&self) -> [f32; 6] {
        let [x, y, z] = self.position;
        let r = self.radius;
        [x - r, y - r, z - r, x + r, y + r, z + r]
    }
}

pub mod geometry_flags {
    pub const TEXTURED: u32 = 1;
    pub const HAS_NORMALS: u32 = 1 << 1;
    pub const HAS_UVS: u32 = 1 << 2;
}

/// Per-geometry shading constants, one record per geometry in a shared buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GeometryConstants {
    /// Rows of the inverse transpose of the upper 3x3 of the object-to-world transform.
    pub normal_matrix: [[f32; 4]; 3],
    pub flags: u32,
    _pad: [u32; 3],
}

impl GeometryConstants {
    pub fn new(transform: &glm::Mat4, flags: u32) -> Self {
        Self {
            normal_matrix: normal_matrix(transform),
            flags,
            _pad: [0; 3],
        }
    }

    pub fn is_textured(&self) -> bool {
        self.flags & geometry_flags::TEXTURED != 0
    }
}

/// Constants shared by every geometry hit record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct HitGroupShaderConstants {
    pub light_count: u32,
    pub light_hit_group_index: u32,
    pub visibility_hit_group_base: u32,
    pub max_samples: u32,
}

impl HitGroupShaderConstants {
    pub fn new(layout: &SceneLayout, max_samples: u32) -> Self {
        Self {
            light_count: layout.light_count() as u32,
            light_hit_group_index: layout.light_hit_group_index(),
            visibility_hit_group_base: layout.visibility_hit_group_base(),
            max_samples,
        }
    }
}

pub fn normal_matrix(transform: &glm::Mat4) -> [[f32; 4]; 3] {
    let upper = glm::mat4_to_mat3(transform);
    let inverse = upper.try_inverse().unwrap_or_else(glm::Mat3::identity);
    let normal = inverse.transpose();
    let mut rows = [[0.0; 4]; 3];
    for (r, row) in rows.iter_mut().enumerate() {
        for (c, value) in row.iter_mut().take(3).enumerate() {
            *value = normal[(r, c)];
        }
    }
    rows
}

pub fn row_major_3x4(transform: &glm::Mat4) -> Transform3x4 {
    let mut out = IDENTITY_TRANSFORM;
    for r in 0..3 {
        for c in 0..4 {
            out[r * 4 + c] = transform[(r, c)];
        }
    }
    out
}

pub struct SceneGeometry {
    pub mesh: Mesh,
    /// Image file, resolved against the asset root.
    pub texture: Option<PathBuf>,
    pub transform: glm::Mat4,
}

impl SceneGeometry {
    /// Reads a PLY mesh from the asset root.
    pub fn load(
        config: &RendererConfig,
        mesh: &str,
        texture: Option<&str>,
        transform: glm::Mat4,
    ) -> Result<Self> {
        let path = config.asset(mesh);
        let mesh = Mesh::load(&path)?;
        debug!(
            "{}: {} vertices, {} triangles",
            path.display(),
            mesh.vertex_count(),
            mesh.triangle_count()
        );
        Ok(Self {
            mesh,
            texture: texture.map(PathBuf::from),
            transform,
        })
    }
}

#[derive(Default)]
pub struct SceneDesc {
    pub geometries: Vec<SceneGeometry>,
    pub lights: Vec<SphereLight>,
}

/// Device copy of one scene geometry.
pub struct GeometryRecord {
    pub positions: BufferResource,
    pub normals: BufferResource,
    pub uvs: BufferResource,
    pub indices: BufferResource,
    pub vertex_count: u32,
    pub index_count: u32,
    /// Address of this geometry's row-major 3x4 transform in the scene transform buffer.
    pub transform_address: u64,
    pub texture: Option<Image2DResource>,
    pub texture_handles: Option<DescriptorHandles>,
    pub constants: GeometryConstants,
    /// Address of `constants` in the scene constants buffer.
    pub constants_address: u64,
}

impl GeometryRecord {
    pub fn triangles(&self) -> TriangleGeometry {
        TriangleGeometry {
            vertex_address: self.positions.device_address(),
            vertex_count: self.vertex_count,
            index_address: self.indices.device_address(),
            index_count: self.index_count,
            transform_address: self.transform_address,
        }
    }

    /// Shader-visible texture index, 0 when untextured.
    pub fn texture_index(&self) -> u32 {
        self.texture_handles.map_or(0, |handles| handles.gpu.0)
    }
}

/// Static scene: geometry in hit-group order plus lights. Immutable after `load`.
pub struct Scene {
    geometries: Vec<GeometryRecord>,
    lights: Vec<SphereLight>,
    layout: SceneLayout,
    _transforms: BufferResource,
    _geometry_constants: BufferResource,
    light_buffer: BufferResource,
    light_aabbs: Option<BufferResource>,
    shader_constants: MappedBuffer<HitGroupShaderConstants>,
}

impl Scene {
    pub fn load(
        desc: SceneDesc,
        resources: &ResourceManager,
        heap: &DescriptorHeap,
        config: &RendererConfig,
    ) -> Result<Self> {
        let layout = SceneLayout::new(desc.geometries.len(), desc.lights.len());
        let geometry_usage = BufferUsageFlags::STORAGE_BUFFER | BUILD_INPUT_USAGE;

        let transforms: Vec<Transform3x4> = desc
            .geometries
            .iter()
            .map(|geometry| row_major_3x4(&geometry.transform))
            .collect();
        let transform_buffer = resources.create_buffer_and_upload(&transforms, geometry_usage)?;

        let constants: Vec<GeometryConstants> = desc
            .geometries
            .iter()
            .map(|geometry| {
                let mut flags = 0;
                if geometry.texture.is_some() {
                    flags |= geometry_flags::TEXTURED;
                }
                if !geometry.mesh.normals.is_empty() {
                    flags |= geometry_flags::HAS_NORMALS;
                }
                if !geometry.mesh.uvs.is_empty() {
                    flags |= geometry_flags::HAS_UVS;
                }
                GeometryConstants::new(&geometry.transform, flags)
            })
            .collect();
        let constants_buffer = resources
            .create_buffer_and_upload(&constants, BufferUsageFlags::STORAGE_BUFFER)?;
        let constants_stride = std::mem::size_of::<GeometryConstants>() as u64;

        let mut geometries = Vec::with_capacity(desc.geometries.len());
        for (i, geometry) in desc.geometries.into_iter().enumerate() {
            geometry.mesh.validate()?;
            let mesh = &geometry.mesh;

            let (texture, texture_handles) = match &geometry.texture {
                Some(path) => {
                    let image = resources.load_image(&config.asset(path))?;
                    let handles = heap.allocate()?;
                    heap.write_sampled_image(handles.cpu, image.view(), image.layout());
                    (Some(image), Some(handles))
                }
                None => (None, None),
            };

            geometries.push(GeometryRecord {
                positions: resources.create_buffer_and_upload(&mesh.positions, geometry_usage)?,
                normals: resources.create_buffer_and_upload(&mesh.normals, geometry_usage)?,
                uvs: resources.create_buffer_and_upload(&mesh.uvs, geometry_usage)?,
                indices: resources.create_buffer_and_upload(&mesh.indices, geometry_usage)?,
                vertex_count: mesh.vertex_count() as u32,
                index_count: mesh.index_count() as u32,
                transform_address: transform_buffer.device_address() + i as u64 * TRANSFORM_SIZE,
                texture,
                texture_handles,
                constants: constants[i],
                constants_address: constants_buffer.device_address() + i as u64 * constants_stride,
            });
        }

        let light_buffer = if desc.lights.is_empty() {
            resources.create_buffer_and_upload(
                &[SphereLight::zeroed()],
                BufferUsageFlags::STORAGE_BUFFER,
            )?
        } else {
            resources.create_buffer_and_upload(&desc.lights, BufferUsageFlags::STORAGE_BUFFER)?
        };
        let light_aabbs = if desc.lights.is_empty() {
            None
        } else {
            let aabbs: Vec<[f32; 6]> = desc.lights.iter().map(SphereLight::aabb).collect();
            Some(resources.create_buffer_and_upload(&aabbs, BUILD_INPUT_USAGE)?)
        };

        let mut shader_constants = resources
            .create_upload_buffer_and_map::<HitGroupShaderConstants>(
                BufferUsageFlags::STORAGE_BUFFER,
            )?;
        shader_constants.write(&HitGroupShaderConstants::new(&layout, config.max_samples));

        info!(
            "scene loaded: {} geometries, {} lights, {} textures",
            geometries.len(),
            desc.lights.len(),
            heap.len()
        );

        Ok(Self {
            geometries,
            lights: desc.lights,
            layout,
            _transforms: transform_buffer,
            _geometry_constants: constants_buffer,
            light_buffer,
            light_aabbs,
            shader_constants,
        })
    }

    pub fn geometries(&self) -> &[GeometryRecord] {
        &self.geometries
    }

    pub fn lights(&self) -> &[SphereLight] {
        &self.lights
    }

    pub fn layout(&self) -> &SceneLayout {
        &self.layout
    }

    pub fn light_buffer(&self) -> &BufferResource {
        &self.light_buffer
    }

    pub fn shader_constants_address(&self) -> u64 {
        self.shader_constants.device_address()
    }

    pub fn shader_constants(&self) -> HitGroupShaderConstants {
        self.shader_constants.read()
    }

    /// All mesh geometry in one bottom-level structure, in hit-group order.
    pub fn mesh_bottom_level(&self) -> BottomLevelDesc {
        BottomLevelDesc::triangles(
            self.layout
                .geometries()
                .map(|i| self.geometries[i].triangles()),
        )
    }

    /// One procedural bottom-level structure bounding every sphere light.
    pub fn light_bottom_level(&self) -> Option<BottomLevelDesc> {
        self.light_aabbs
            .as_ref()
            .map(|aabbs| BottomLevelDesc::procedural(aabbs.device_address(), self.lights.len() as u32))
    }

    /// Builds the mesh and light bottom-level structures and a top-level structure holding
    /// the single mesh instance.
    pub fn build_acceleration_structures(
        &self,
        resources: &ResourceManager,
        rtx: &RtxContext,
        context: &Context,
    ) -> Result<AccelerationStructures> {
        let mut builder = AccelerationStructureBuilder::new(resources, rtx);
        let mesh = builder.add_bottom_level(self.mesh_bottom_level());
        if let Some(lights) = self.light_bottom_level() {
            builder.add_bottom_level(lights);
        }
        builder.add_instance(InstanceDesc {
            bottom_level: mesh,
            transform: IDENTITY_TRANSFORM,
            mask: 0xff,
            hit_group_base: self.layout.instance_hit_group_base(),
        });
        builder.build(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_records_have_std430_sizes() {
        assert_eq!(std::mem::size_of::<SphereLight>(), 32);
        assert_eq!(std::mem::size_of::<GeometryConstants>(), 64);
        assert_eq!(std::mem::size_of::<HitGroupShaderConstants>(), 16);
    }

    #[test]
    fn translation_lands_in_the_last_column() {
        let transform = glm::translate(&glm::Mat4::identity(), &glm::vec3(1.0, 2.0, 3.0));
        let rows = row_major_3x4(&transform);
        assert_eq!(
            rows,
            [1., 0., 0., 1., 0., 1., 0., 2., 0., 0., 1., 3.]
        );
    }

    #[test]
    fn normal_matrix_undoes_non_uniform_scale() {
        let transform = glm::scale(&glm::Mat4::identity(), &glm::vec3(2.0, 4.0, 1.0));
        let rows = normal_matrix(&transform);
        assert!((rows[0][0] - 0.5).abs() < 1e-6);
        assert!((rows[1][1] - 0.25).abs() < 1e-6);
        assert!((rows[2][2] - 1.0).abs() < 1e-6);
        assert_eq!(rows[0][3], 0.0);
    }

    #[test]
    fn normal_matrix_of_rotation_is_the_rotation() {
        let transform = glm::rotate(&glm::Mat4::identity(), 1.35, &glm::vec3(0.403, -0.755, -0.517));
        let rows = normal_matrix(&transform);
        for r in 0..3 {
            for c in 0..3 {
                assert!((rows[r][c] - transform[(r, c)]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn singular_transforms_fall_back_to_identity() {
        let transform = glm::scale(&glm::Mat4::identity(), &glm::vec3(0.0, 1.0, 1.0));
        assert_eq!(normal_matrix(&transform)[0], [1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn light_bounds_enclose_the_sphere() {
        let light = SphereLight::new([1.0, 2.0, 3.0], 0.5, [10.0; 3]);
        assert_eq!(light.aabb(), [0.5, 1.5, 2.5, 1.5, 2.5, 3.5]);
    }

    #[test]
    fn shader_constants_follow_the_layout() {
        let layout = SceneLayout::new(3, 2);
        let constants = HitGroupShaderConstants::new(&layout, 2048);
        assert_eq!(constants.light_count, 2);
        assert_eq!(constants.light_hit_group_index, 3);
        assert_eq!(constants.visibility_hit_group_base, 4);
        assert_eq!(constants.max_samples, 2048);
    }

    #[test]
    fn textured_flag() {
        let constants = GeometryConstants::new(&glm::Mat4::identity(), geometry_flags::TEXTURED);
        assert!(constants.is_textured());
        assert!(!GeometryConstants::new(&glm::Mat4::identity(), 0).is_textured());
    }
}
