use std::cell::Cell;
use std::rc::Rc;

use ash::extensions::khr::{AccelerationStructure, RayTracingPipeline};
use ash::vk::{
    PhysicalDeviceAccelerationStructurePropertiesKHR,
    PhysicalDeviceRayTracingPipelinePropertiesKHR,
};
use log::trace;
use vk_utils::command_buffer::{CommandAllocator, CommandList};
use vk_utils::device_context::DeviceContext;
use vk_utils::fence::Fence;
use vk_utils::queue::{CommandQueue, QueueKind};

use crate::Result;

#[derive(Clone)]
pub struct RtxContext {
    acceleration_structure_ext: AccelerationStructure,
    ray_tracing_pipeline_ext: RayTracingPipeline,
    pipeline_properties: PhysicalDeviceRayTracingPipelinePropertiesKHR,
    acceleration_structure_properties: PhysicalDeviceAccelerationStructurePropertiesKHR,
}

impl RtxContext {
    pub fn new(device: &DeviceContext) -> Self {
        let instance = device.gpu().vulkan().vk_instance();
        Self {
            acceleration_structure_ext: AccelerationStructure::new(instance, device.vk_device()),
            ray_tracing_pipeline_ext: RayTracingPipeline::new(instance, device.vk_device()),
            pipeline_properties: device.gpu().ray_tracing_pipeline_properties(),
            acceleration_structure_properties: device.gpu().acceleration_structure_properties(),
        }
    }

    pub fn pipeline_ext(&self) -> &RayTracingPipeline {
        &self.ray_tracing_pipeline_ext
    }

    pub fn acceleration_structure_ext(&self) -> &AccelerationStructure {
        &self.acceleration_structure_ext
    }

    pub fn pipeline_properties(&self) -> &PhysicalDeviceRayTracingPipelinePropertiesKHR {
        &self.pipeline_properties
    }

    pub fn acceleration_structure_properties(
        &self,
    ) -> &PhysicalDeviceAccelerationStructurePropertiesKHR {
        &self.acceleration_structure_properties
    }
}

/// One queue, one allocator, one list and a fence: records a batch of commands, submits
/// it and blocks until the device has executed it.
pub struct Context {
    device: Rc<DeviceContext>,
    queue: CommandQueue,
    allocator: CommandAllocator,
    list: CommandList,
    fence: Fence,
    fence_value: Cell<u64>,
}

impl Context {
    pub fn new(device: Rc<DeviceContext>, kind: QueueKind) -> Result<Self> {
        let queue = CommandQueue::new(device.clone(), kind);
        let allocator = CommandAllocator::new(device.clone(), queue.family_type_index())?;
        let list = allocator.allocate_list()?;
        let fence = Fence::new(device.clone(), 0)?;
        Ok(Self {
            device,
            queue,
            allocator,
            list,
            fence,
            fence_value: Cell::new(0),
        })
    }

    pub fn device(&self) -> &Rc<DeviceContext> {
        &self.device
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Records `f` into the context's list, executes it and waits for completion.
    /// Returns the fence value that marked completion.
    pub fn execute<F>(&self, f: F) -> Result<u64>
    where
        F: FnOnce(&CommandList) -> Result<()>,
    {
        self.allocator.reset()?;
        self.list.begin()?;
        f(&self.list)?;
        self.list.end()?;
        self.queue.submit(&[&self.list], &[], &[])?;
        self.wait_for_gpu()
    }

    /// Signals the next fence value behind all submitted work and blocks until it is reached.
    pub fn wait_for_gpu(&self) -> Result<u64> {
        let value = self.fence_value.get() + 1;
        self.fence_value.set(value);
        self.queue.signal(&self.fence, value)?;
        self.fence.wait(value)?;
        trace!("queue family {} idle at {}", self.queue.family_type_index(), value);
        Ok(value)
    }

    pub fn completed_value(&self) -> Result<u64> {
        Ok(self.fence.completed_value()?)
    }
}
