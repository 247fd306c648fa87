use std::collections::HashMap;
use std::rc::Rc;

use ash::vk::{
    DeferredOperationKHR, Pipeline, PipelineBindPoint, PipelineCache,
    PipelineShaderStageCreateInfo, RayTracingPipelineCreateInfoKHR,
    RayTracingShaderGroupCreateInfoKHR, RayTracingShaderGroupTypeKHR, ShaderStageFlags,
    SHADER_UNUSED_KHR,
};
use log::{debug, info};
use vk_utils::command_buffer::CommandList;
use vk_utils::device_context::DeviceContext;
use vk_utils::shader_library::ShaderLibrary;

use crate::context::RtxContext;
use crate::root_signature::{GlobalRootSignature, LocalRootSignature};
use crate::{Error, Result};

/// Entry points and hit groups of the path tracing library.
pub mod exports {
    pub const RAY_GEN: &str = "RayGenShader";
    pub const CLOSEST_HIT: &str = "ClosestHitShader";
    pub const VISIBILITY_CLOSEST_HIT: &str = "VisibilityClosestHitShader";
    pub const SPHERE_INTERSECTION: &str = "SphereIntersectionShader";
    pub const LIGHT_CLOSEST_HIT: &str = "LightClosestHitShader";
    pub const MISS: &str = "MissShader";
    pub const VISIBILITY_MISS: &str = "VisibilityMissShader";

    pub const HIT_GROUP: &str = "HitGroup";
    pub const VISIBILITY_HIT_GROUP: &str = "VisibilityHitGroup";
    pub const LIGHT_HIT_GROUP: &str = "LightHitGroup";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HitGroupKind {
    Triangles,
    /// Custom primitives found by an intersection shader.
    Procedural,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HitGroupDesc {
    pub name: String,
    pub kind: HitGroupKind,
    pub closest_hit: Option<String>,
    pub any_hit: Option<String>,
    pub intersection: Option<String>,
}

impl HitGroupDesc {
    pub fn triangles(name: &str, closest_hit: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: HitGroupKind::Triangles,
            closest_hit: Some(closest_hit.to_string()),
            any_hit: None,
            intersection: None,
        }
    }

    pub fn procedural(name: &str, intersection: &str, closest_hit: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: HitGroupKind::Procedural,
            closest_hit: Some(closest_hit.to_string()),
            any_hit: None,
            intersection: Some(intersection.to_string()),
        }
    }
}

/// Piece of a ray tracing pipeline description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Subobject {
    GlobalRootSignature,
    /// Named entry points of the shader library.
    Library(Vec<(String, ShaderStageFlags)>),
    LocalRootSignature(LocalRootSignature),
    /// Associates the closest preceding local root signature with exports or hit groups.
    Association(Vec<String>),
    HitGroup(HitGroupDesc),
    ShaderConfig {
        max_payload_size: u32,
        max_attribute_size: u32,
    },
    PipelineConfig {
        max_recursion_depth: u32,
    },
}

impl Subobject {
    pub fn library(library: &ShaderLibrary) -> Self {
        Subobject::Library(
            library
                .exports()
                .iter()
                .map(|export| (export.name.clone(), export.stage))
                .collect(),
        )
    }
}

/// Largest hit attribute block a pipeline may declare.
pub const MAX_ATTRIBUTE_SIZE: u32 = 32;

/// One shader group of the pipeline, in group index order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolvedGroup {
    General {
        name: String,
        stage: usize,
    },
    Hit {
        name: String,
        kind: HitGroupKind,
        closest_hit: Option<usize>,
        any_hit: Option<usize>,
        intersection: Option<usize>,
    },
}

impl ResolvedGroup {
    pub fn name(&self) -> &str {
        match self {
            ResolvedGroup::General { name, .. } | ResolvedGroup::Hit { name, .. } => name,
        }
    }
}

/// Validated description: stages in library order, general groups for ray generation and
/// miss stages followed by hit groups in the order they were pushed.
#[derive(Clone, Debug)]
pub struct ResolvedStateObject {
    pub stages: Vec<(String, ShaderStageFlags)>,
    pub groups: Vec<ResolvedGroup>,
    pub local_signatures: HashMap<String, LocalRootSignature>,
    pub max_payload_size: u32,
    pub max_attribute_size: u32,
    pub max_recursion_depth: u32,
}

impl ResolvedStateObject {
    pub fn group_index(&self, name: &str) -> Option<usize> {
        self.groups.iter().position(|group| group.name() == name)
    }

    /// Local arguments carried by records of `name`, if any.
    pub fn local_signature(&self, name: &str) -> Option<&LocalRootSignature> {
        self.local_signatures.get(name)
    }
}

#[derive(Clone, Debug, Default)]
pub struct StateObjectDesc {
    subobjects: Vec<Subobject>,
}

fn state_error(message: impl Into<String>) -> Error {
    Error::StateObject(message.into())
}

impl StateObjectDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subobject: Subobject) -> &mut Self {
        self.subobjects.push(subobject);
        self
    }

    pub fn subobjects(&self) -> &[Subobject] {
        &self.subobjects
    }

    /// Checks the subobject graph and resolves every name to a stage or group index.
    pub fn validate(&self) -> Result<ResolvedStateObject> {
        let mut global_signatures = 0;
        let mut stages: Vec<(String, ShaderStageFlags)> = Vec::new();
        let mut hit_groups: Vec<&HitGroupDesc> = Vec::new();
        let mut shader_config = None;
        let mut pipeline_config = None;
        let mut current_local: Option<&LocalRootSignature> = None;
        let mut associations: Vec<(String, LocalRootSignature)> = Vec::new();

        for subobject in &self.subobjects {
            match subobject {
                Subobject::GlobalRootSignature => global_signatures += 1,
                Subobject::Library(exports) => {
                    for (name, stage) in exports {
                        if stages.iter().any(|(existing, _)| existing == name) {
                            return Err(state_error(format!("export {} declared twice", name)));
                        }
                        stages.push((name.clone(), *stage));
                    }
                }
                Subobject::LocalRootSignature(signature) => current_local = Some(signature),
                Subobject::Association(names) => {
                    let signature = current_local.ok_or_else(|| {
                        state_error("association without a preceding local root signature")
                    })?;
                    for name in names {
                        associations.push((name.clone(), signature.clone()));
                    }
                }
                Subobject::HitGroup(group) => hit_groups.push(group),
                Subobject::ShaderConfig {
                    max_payload_size,
                    max_attribute_size,
                } => {
                    if shader_config.is_some() {
                        return Err(state_error("more than one shader config"));
                    }
                    shader_config = Some((*max_payload_size, *max_attribute_size));
                }
                Subobject::PipelineConfig {
                    max_recursion_depth,
                } => {
                    if pipeline_config.is_some() {
                        return Err(state_error("more than one pipeline config"));
                    }
                    pipeline_config = Some(*max_recursion_depth);
                }
            }
        }

        if global_signatures != 1 {
            return Err(state_error(format!(
                "expected one global root signature, found {}",
                global_signatures
            )));
        }
        let (max_payload_size, max_attribute_size) =
            shader_config.ok_or_else(|| state_error("missing shader config"))?;
        if max_attribute_size > MAX_ATTRIBUTE_SIZE {
            return Err(state_error(format!(
                "attribute size {} exceeds {}",
                max_attribute_size, MAX_ATTRIBUTE_SIZE
            )));
        }
        let max_recursion_depth =
            pipeline_config.ok_or_else(|| state_error("missing pipeline config"))?;

        let stage_index = |name: &str, stage: ShaderStageFlags| -> Result<usize> {
            stages
                .iter()
                .position(|(export, export_stage)| export == name && *export_stage == stage)
                .ok_or_else(|| Error::ExportNotFound(name.to_string()))
        };

        let mut groups = Vec::new();
        for (i, (name, stage)) in stages.iter().enumerate() {
            if *stage == ShaderStageFlags::RAYGEN_KHR
                || *stage == ShaderStageFlags::MISS_KHR
                || *stage == ShaderStageFlags::CALLABLE_KHR
            {
                groups.push(ResolvedGroup::General {
                    name: name.clone(),
                    stage: i,
                });
            }
        }
        if !stages
            .iter()
            .any(|(_, stage)| *stage == ShaderStageFlags::RAYGEN_KHR)
        {
            return Err(state_error("no ray generation shader"));
        }

        for group in hit_groups {
            if groups.iter().any(|existing| existing.name() == group.name) {
                return Err(state_error(format!("duplicate name {}", group.name)));
            }
            let closest_hit = group
                .closest_hit
                .as_deref()
                .map(|name| stage_index(name, ShaderStageFlags::CLOSEST_HIT_KHR))
                .transpose()?;
            let any_hit = group
                .any_hit
                .as_deref()
                .map(|name| stage_index(name, ShaderStageFlags::ANY_HIT_KHR))
                .transpose()?;
            let intersection = group
                .intersection
                .as_deref()
                .map(|name| stage_index(name, ShaderStageFlags::INTERSECTION_KHR))
                .transpose()?;
            match (group.kind, intersection) {
                (HitGroupKind::Triangles, Some(_)) => {
                    return Err(state_error(format!(
                        "triangle hit group {} has an intersection shader",
                        group.name
                    )))
                }
                (HitGroupKind::Procedural, None) => {
                    return Err(state_error(format!(
                        "procedural hit group {} has no intersection shader",
                        group.name
                    )))
                }
                _ => {}
            }
            groups.push(ResolvedGroup::Hit {
                name: group.name.clone(),
                kind: group.kind,
                closest_hit,
                any_hit,
                intersection,
            });
        }

        let mut local_signatures = HashMap::new();
        for (name, signature) in associations {
            let known = groups.iter().any(|group| group.name() == name)
                || stages.iter().any(|(export, _)| *export == name);
            if !known {
                return Err(Error::ExportNotFound(name));
            }
            if local_signatures.insert(name.clone(), signature).is_some() {
                return Err(state_error(format!(
                    "{} is associated with more than one local root signature",
                    name
                )));
            }
        }

        Ok(ResolvedStateObject {
            stages,
            groups,
            local_signatures,
            max_payload_size,
            max_attribute_size,
            max_recursion_depth,
        })
    }
}

/// The description the renderer traces with: one library, the geometry, visibility and
/// light hit groups, and the hit-group local root signature on the geometry hit group.
pub fn path_tracer_desc(
    library: &ShaderLibrary,
    max_payload_size: u32,
    max_attribute_size: u32,
    max_recursion_depth: u32,
) -> StateObjectDesc {
    let mut desc = StateObjectDesc::new();
    desc.push(Subobject::GlobalRootSignature)
        .push(Subobject::library(library))
        .push(Subobject::LocalRootSignature(LocalRootSignature::hit_group()))
        .push(Subobject::Association(vec![exports::HIT_GROUP.to_string()]))
        .push(Subobject::HitGroup(HitGroupDesc::triangles(
            exports::HIT_GROUP,
            exports::CLOSEST_HIT,
        )))
        .push(Subobject::HitGroup(HitGroupDesc::triangles(
            exports::VISIBILITY_HIT_GROUP,
            exports::VISIBILITY_CLOSEST_HIT,
        )))
        .push(Subobject::HitGroup(HitGroupDesc::procedural(
            exports::LIGHT_HIT_GROUP,
            exports::SPHERE_INTERSECTION,
            exports::LIGHT_CLOSEST_HIT,
        )))
        .push(Subobject::ShaderConfig {
            max_payload_size,
            max_attribute_size,
        })
        .push(Subobject::PipelineConfig {
            max_recursion_depth,
        });
    desc
}

/// Registers every entry point of the path tracing library.
pub fn export_path_tracer_entry_points(library: &mut ShaderLibrary) {
    library.export(exports::RAY_GEN, ShaderStageFlags::RAYGEN_KHR);
    library.export(exports::CLOSEST_HIT, ShaderStageFlags::CLOSEST_HIT_KHR);
    library.export(
        exports::VISIBILITY_CLOSEST_HIT,
        ShaderStageFlags::CLOSEST_HIT_KHR,
    );
    library.export(
        exports::SPHERE_INTERSECTION,
        ShaderStageFlags::INTERSECTION_KHR,
    );
    library.export(exports::LIGHT_CLOSEST_HIT, ShaderStageFlags::CLOSEST_HIT_KHR);
    library.export(exports::MISS, ShaderStageFlags::MISS_KHR);
    library.export(exports::VISIBILITY_MISS, ShaderStageFlags::MISS_KHR);
}

/// Compiled ray tracing pipeline with the shader identifiers of all of its groups.
pub struct StateObject {
    device: Rc<DeviceContext>,
    pipeline: Pipeline,
    resolved: ResolvedStateObject,
    identifiers: Vec<u8>,
    identifier_size: usize,
}

impl StateObject {
    pub fn new(
        device: Rc<DeviceContext>,
        rtx: &RtxContext,
        global: &GlobalRootSignature,
        library: &ShaderLibrary,
        desc: &StateObjectDesc,
    ) -> Result<Self> {
        let resolved = desc.validate()?;
        let max_depth = rtx.pipeline_properties().max_ray_recursion_depth;
        if resolved.max_recursion_depth > max_depth {
            return Err(state_error(format!(
                "recursion depth {} exceeds the device limit {}",
                resolved.max_recursion_depth, max_depth
            )));
        }

        let mut stages = Vec::with_capacity(resolved.stages.len());
        for (name, stage) in &resolved.stages {
            let export = library
                .get(name)
                .ok_or_else(|| Error::ExportNotFound(name.clone()))?;
            stages.push(
                *PipelineShaderStageCreateInfo::builder()
                    .stage(*stage)
                    .module(library.module())
                    .name(&export.entry_point),
            );
        }

        let unused = |index: Option<usize>| index.map_or(SHADER_UNUSED_KHR, |i| i as u32);
        let groups: Vec<RayTracingShaderGroupCreateInfoKHR> = resolved
            .groups
            .iter()
            .map(|group| match group {
                ResolvedGroup::General { stage, .. } => {
                    *RayTracingShaderGroupCreateInfoKHR::builder()
                        .ty(RayTracingShaderGroupTypeKHR::GENERAL)
                        .general_shader(*stage as u32)
                        .closest_hit_shader(SHADER_UNUSED_KHR)
                        .any_hit_shader(SHADER_UNUSED_KHR)
                        .intersection_shader(SHADER_UNUSED_KHR)
                }
                ResolvedGroup::Hit {
                    kind,
                    closest_hit,
                    any_hit,
                    intersection,
                    ..
                } => *RayTracingShaderGroupCreateInfoKHR::builder()
                    .ty(match kind {
                        HitGroupKind::Triangles => RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
                        HitGroupKind::Procedural => {
                            RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
                        }
                    })
                    .general_shader(SHADER_UNUSED_KHR)
                    .closest_hit_shader(unused(*closest_hit))
                    .any_hit_shader(unused(*any_hit))
                    .intersection_shader(unused(*intersection)),
            })
            .collect();

        let infos = [*RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(resolved.max_recursion_depth)
            .layout(global.pipeline_layout())];

        let identifier_size = rtx.pipeline_properties().shader_group_handle_size as usize;
        unsafe {
            let pipeline = rtx.pipeline_ext().create_ray_tracing_pipelines(
                DeferredOperationKHR::null(),
                PipelineCache::null(),
                &infos,
                None,
            )?[0];
            let identifiers = match rtx.pipeline_ext().get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                groups.len() as u32,
                groups.len() * identifier_size,
            ) {
                Ok(identifiers) => identifiers,
                Err(e) => {
                    device.vk_device().destroy_pipeline(pipeline, None);
                    return Err(e.into());
                }
            };

            debug!(
                "state object: {} stages, groups {:?}",
                stages.len(),
                resolved.groups.iter().map(ResolvedGroup::name).collect::<Vec<_>>()
            );
            info!(
                "ray tracing pipeline created (payload {} bytes, attributes {} bytes, depth {})",
                resolved.max_payload_size, resolved.max_attribute_size, resolved.max_recursion_depth
            );

            Ok(Self {
                device,
                pipeline,
                resolved,
                identifiers,
                identifier_size,
            })
        }
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline
    }

    pub fn resolved(&self) -> &ResolvedStateObject {
        &self.resolved
    }

    pub fn identifier_size(&self) -> usize {
        self.identifier_size
    }

    /// Opaque identifier of a general group (ray generation, miss) or hit group.
    pub fn shader_identifier(&self, name: &str) -> Result<&[u8]> {
        let index = self
            .resolved
            .group_index(name)
            .ok_or_else(|| Error::ExportNotFound(name.to_string()))?;
        let start = index * self.identifier_size;
        Ok(&self.identifiers[start..start + self.identifier_size])
    }

    pub fn bind(&self, list: &CommandList) {
        unsafe {
            self.device.vk_device().cmd_bind_pipeline(
                list.vk_command_buffer(),
                PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline,
            )
        }
    }
}

impl Drop for StateObject {
    fn drop(&mut self) {
        unsafe { self.device.vk_device().destroy_pipeline(self.pipeline, None) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library_exports() -> Subobject {
        Subobject::Library(vec![
            (exports::RAY_GEN.to_string(), ShaderStageFlags::RAYGEN_KHR),
            (exports::CLOSEST_HIT.to_string(), ShaderStageFlags::CLOSEST_HIT_KHR),
            (
                exports::VISIBILITY_CLOSEST_HIT.to_string(),
                ShaderStageFlags::CLOSEST_HIT_KHR,
            ),
            (
                exports::SPHERE_INTERSECTION.to_string(),
                ShaderStageFlags::INTERSECTION_KHR,
            ),
            (
                exports::LIGHT_CLOSEST_HIT.to_string(),
                ShaderStageFlags::CLOSEST_HIT_KHR,
            ),
            (exports::MISS.to_string(), ShaderStageFlags::MISS_KHR),
            (exports::VISIBILITY_MISS.to_string(), ShaderStageFlags::MISS_KHR),
        ])
    }

    fn full_desc() -> StateObjectDesc {
        let mut desc = StateObjectDesc::new();
        desc.push(Subobject::GlobalRootSignature)
            .push(library_exports())
            .push(Subobject::LocalRootSignature(LocalRootSignature::hit_group()))
            .push(Subobject::Association(vec![exports::HIT_GROUP.to_string()]))
            .push(Subobject::HitGroup(HitGroupDesc::triangles(
                exports::HIT_GROUP,
                exports::CLOSEST_HIT,
            )))
            .push(Subobject::HitGroup(HitGroupDesc::triangles(
                exports::VISIBILITY_HIT_GROUP,
                exports::VISIBILITY_CLOSEST_HIT,
            )))
            .push(Subobject::HitGroup(HitGroupDesc::procedural(
                exports::LIGHT_HIT_GROUP,
                exports::SPHERE_INTERSECTION,
                exports::LIGHT_CLOSEST_HIT,
            )))
            .push(Subobject::ShaderConfig {
                max_payload_size: 16,
                max_attribute_size: 8,
            })
            .push(Subobject::PipelineConfig {
                max_recursion_depth: 2,
            });
        desc
    }

    #[test]
    fn general_groups_precede_hit_groups() {
        let resolved = full_desc().validate().unwrap();
        let names: Vec<&str> = resolved.groups.iter().map(ResolvedGroup::name).collect();
        assert_eq!(
            names,
            vec![
                exports::RAY_GEN,
                exports::MISS,
                exports::VISIBILITY_MISS,
                exports::HIT_GROUP,
                exports::VISIBILITY_HIT_GROUP,
                exports::LIGHT_HIT_GROUP
            ]
        );
        assert_eq!(resolved.max_recursion_depth, 2);
    }

    #[test]
    fn only_the_geometry_hit_group_carries_arguments() {
        let resolved = full_desc().validate().unwrap();
        assert_eq!(
            resolved.local_signature(exports::HIT_GROUP),
            Some(&LocalRootSignature::hit_group())
        );
        assert!(resolved.local_signature(exports::VISIBILITY_HIT_GROUP).is_none());
        assert!(resolved.local_signature(exports::LIGHT_HIT_GROUP).is_none());
    }

    #[test]
    fn procedural_group_resolves_its_intersection_stage() {
        let resolved = full_desc().validate().unwrap();
        let light = resolved
            .groups
            .iter()
            .find(|group| group.name() == exports::LIGHT_HIT_GROUP)
            .unwrap();
        match light {
            ResolvedGroup::Hit {
                kind,
                intersection,
                closest_hit,
                ..
            } => {
                assert_eq!(*kind, HitGroupKind::Procedural);
                assert_eq!(*intersection, Some(3));
                assert_eq!(*closest_hit, Some(4));
            }
            _ => panic!("light group is not a hit group"),
        }
    }

    #[test]
    fn missing_global_signature_is_rejected() {
        let mut desc = StateObjectDesc::new();
        desc.push(library_exports()).push(Subobject::ShaderConfig {
            max_payload_size: 16,
            max_attribute_size: 8,
        });
        assert!(matches!(desc.validate(), Err(Error::StateObject(_))));
    }

    #[test]
    fn unknown_closest_hit_is_rejected() {
        let mut desc = full_desc();
        desc.push(Subobject::HitGroup(HitGroupDesc::triangles(
            "Extra",
            "DoesNotExist",
        )));
        assert!(matches!(desc.validate(), Err(Error::ExportNotFound(name)) if name == "DoesNotExist"));
    }

    #[test]
    fn procedural_group_needs_an_intersection_shader() {
        let mut desc = full_desc();
        desc.push(Subobject::HitGroup(HitGroupDesc {
            name: "Broken".to_string(),
            kind: HitGroupKind::Procedural,
            closest_hit: Some(exports::LIGHT_CLOSEST_HIT.to_string()),
            any_hit: None,
            intersection: None,
        }));
        assert!(matches!(desc.validate(), Err(Error::StateObject(_))));
    }

    #[test]
    fn association_needs_a_local_signature() {
        let mut desc = StateObjectDesc::new();
        desc.push(Subobject::GlobalRootSignature)
            .push(library_exports())
            .push(Subobject::Association(vec![exports::RAY_GEN.to_string()]));
        assert!(matches!(desc.validate(), Err(Error::StateObject(_))));
    }

    #[test]
    fn oversized_attributes_are_rejected() {
        let mut desc = StateObjectDesc::new();
        desc.push(Subobject::GlobalRootSignature)
            .push(library_exports())
            .push(Subobject::ShaderConfig {
                max_payload_size: 16,
                max_attribute_size: 64,
            })
            .push(Subobject::PipelineConfig {
                max_recursion_depth: 1,
            });
        assert!(matches!(desc.validate(), Err(Error::StateObject(_))));
    }
}
