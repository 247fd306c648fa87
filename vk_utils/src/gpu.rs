use std::ffi::CStr;
use std::rc::Rc;

use ash::extensions::khr::{AccelerationStructure, RayTracingPipeline};
use ash::vk::{
    PhysicalDevice, PhysicalDeviceAccelerationStructurePropertiesKHR, PhysicalDeviceLimits,
    PhysicalDeviceMemoryProperties, PhysicalDeviceProperties,
    PhysicalDeviceRayTracingPipelinePropertiesKHR, PhysicalDeviceType, QueueFamilyProperties,
    QueueFlags,
};

use crate::vk_instance::Vulkan;

#[derive(Clone)]
pub struct Gpu {
    vulkan: Rc<Vulkan>,
    physical_device: PhysicalDevice,
    properties: PhysicalDeviceProperties,
    memory_properties: PhysicalDeviceMemoryProperties,
    queue_families: Vec<QueueFamilyProperties>,
}

impl Gpu {
    pub(crate) fn new(vulkan: &Rc<Vulkan>, physical_device: PhysicalDevice) -> Self {
        let instance = vulkan.vk_instance();
        unsafe {
            Self {
                vulkan: vulkan.clone(),
                physical_device,
                properties: instance.get_physical_device_properties(physical_device),
                memory_properties: instance.get_physical_device_memory_properties(physical_device),
                queue_families: instance
                    .get_physical_device_queue_family_properties(physical_device),
            }
        }
    }

    pub fn vulkan(&self) -> &Rc<Vulkan> {
        &self.vulkan
    }

    pub fn vk_physical_device(&self) -> PhysicalDevice {
        self.physical_device
    }

    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    pub fn vendor_id(&self) -> u32 {
        self.properties.vendor_id
    }

    pub fn device_id(&self) -> u32 {
        self.properties.device_id
    }

    pub fn is_discrete(&self) -> bool {
        self.properties.device_type == PhysicalDeviceType::DISCRETE_GPU
    }

    pub fn limits(&self) -> PhysicalDeviceLimits {
        self.properties.limits
    }

    pub fn memory_properties(&self) -> &PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// First queue family whose flags contain `flags`.
    pub fn family_type_index(&self, flags: QueueFlags) -> Option<u32> {
        self.queue_families
            .iter()
            .position(|family| family.queue_flags.contains(flags))
            .map(|index| index as u32)
    }

    /// A transfer-capable family without graphics or compute, when the device exposes one.
    pub fn dedicated_transfer_family(&self) -> Option<u32> {
        self.queue_families
            .iter()
            .position(|family| {
                family.queue_flags.contains(QueueFlags::TRANSFER)
                    && !family
                        .queue_flags
                        .intersects(QueueFlags::GRAPHICS | QueueFlags::COMPUTE)
            })
            .map(|index| index as u32)
    }

    pub fn supports_graphics(&self) -> bool {
        self.family_type_index(QueueFlags::GRAPHICS).is_some()
    }

    pub fn supports_extension(&self, name: &CStr) -> bool {
        unsafe {
            self.vulkan
                .vk_instance()
                .enumerate_device_extension_properties(self.physical_device)
        }
        .map(|extensions| {
            extensions
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
        })
        .unwrap_or(false)
    }

    pub fn supports_ray_tracing(&self) -> bool {
        self.supports_graphics()
            && self.supports_extension(AccelerationStructure::name())
            && self.supports_extension(RayTracingPipeline::name())
    }

    pub fn ray_tracing_pipeline_properties(&self) -> PhysicalDeviceRayTracingPipelinePropertiesKHR {
        unsafe {
            RayTracingPipeline::get_properties(self.vulkan.vk_instance(), self.physical_device)
        }
    }

    pub fn acceleration_structure_properties(
        &self,
    ) -> PhysicalDeviceAccelerationStructurePropertiesKHR {
        unsafe {
            AccelerationStructure::get_properties(self.vulkan.vk_instance(), self.physical_device)
        }
    }
}
