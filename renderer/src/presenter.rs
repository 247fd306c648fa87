use std::rc::Rc;

use ash::vk::{PipelineStageFlags, Semaphore};
use log::{error, trace};
use vk_utils::command_buffer::{CommandAllocator, CommandList};
use vk_utils::device_context::DeviceContext;
use vk_utils::fence::Fence;
use vk_utils::image_resource::Image2DResource;
use vk_utils::queue::{CommandQueue, QueueKind};
use vk_utils::swapchain::Swapchain;

use crate::context::RtxContext;
use crate::descriptor_heap::DescriptorHeap;
use crate::frame::{FrameBackend, ResourceState};
use crate::pipeline::StateObject;
use crate::root_signature::{DrawConstants, GlobalRootSignature};
use crate::shader_table::ShaderTables;
use crate::Result;

/// Stage the acquire semaphore is waited on. The first back buffer barrier of a frame
/// uses it as its source stage.
pub const ACQUIRE_WAIT_STAGE: PipelineStageFlags = PipelineStageFlags::TRANSFER;

/// Everything a dispatch binds.
pub struct PipelineBindings {
    pub heap: DescriptorHeap,
    pub global: GlobalRootSignature,
    pub state_object: StateObject,
    pub tables: ShaderTables,
}

/// Frame backend that traces into the film and presents it through a swap chain. Owns one
/// command allocator and list per frame slot.
pub struct SwapchainBackend {
    device: Rc<DeviceContext>,
    rtx: RtxContext,
    queue: CommandQueue,
    allocators: Vec<CommandAllocator>,
    lists: Vec<CommandList>,
    current: usize,
    acquired: Semaphore,
    fence: Fence,
    film: Image2DResource,
    bindings: PipelineBindings,
    swapchain: Swapchain,
}

impl SwapchainBackend {
    /// `film` must already be in `GENERAL` layout.
    pub fn new(
        device: Rc<DeviceContext>,
        rtx: RtxContext,
        swapchain: Swapchain,
        film: Image2DResource,
        bindings: PipelineBindings,
        frame_count: usize,
    ) -> Result<Self> {
        let queue = CommandQueue::new(device.clone(), QueueKind::Graphics);
        let mut allocators = Vec::with_capacity(frame_count);
        let mut lists = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            let allocator = CommandAllocator::new(device.clone(), queue.family_type_index())?;
            lists.push(allocator.allocate_list()?);
            allocators.push(allocator);
        }
        let fence = Fence::new(device.clone(), 0)?;
        bindings.global.write_film(film.view());
        Ok(Self {
            device,
            rtx,
            queue,
            allocators,
            lists,
            current: 0,
            acquired: Semaphore::null(),
            fence,
            film,
            bindings,
            swapchain,
        })
    }

    fn list(&self) -> &CommandList {
        &self.lists[self.current]
    }

    pub fn film(&self) -> &Image2DResource {
        &self.film
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }
}

impl FrameBackend for SwapchainBackend {
    fn acquire(&mut self, slot: usize) -> Result<u32> {
        let (image, semaphore) = self.swapchain.acquire(slot)?;
        self.acquired = semaphore;
        Ok(image)
    }

    fn begin_frame(&mut self, slot: usize) -> Result<()> {
        self.current = slot % self.lists.len();
        self.allocators[self.current].reset()?;
        self.list().begin()?;
        Ok(())
    }

    fn bind_global_arguments(&mut self, sample_index: u32) {
        let list = &self.lists[self.current];
        self.bindings.state_object.bind(list);
        self.bindings
            .global
            .bind(list, &self.bindings.heap, &DrawConstants { sample_index });
    }

    fn dispatch_rays(&mut self, width: u32, height: u32) {
        let [ray_gen, miss, hit_group, callable] = self.bindings.tables.regions();
        unsafe {
            self.rtx.pipeline_ext().cmd_trace_rays(
                self.list().vk_command_buffer(),
                &ray_gen,
                &miss,
                &hit_group,
                &callable,
                width,
                height,
                1,
            );
        }
    }

    fn transition_film(&mut self, from: ResourceState, to: ResourceState) {
        self.list()
            .color_image_transition(self.film.vk_image(), from.layout(), to.layout());
        self.film.set_layout(to.layout());
    }

    /// Back buffers leave `Present` with undefined contents; the copy overwrites them.
    fn transition_back_buffer(&mut self, image: u32, from: ResourceState, to: ResourceState) {
        let vk_image = self.swapchain.image(image);
        match from {
            ResourceState::Present => {
                self.list()
                    .acquired_image_transition(vk_image, to.layout(), ACQUIRE_WAIT_STAGE)
            }
            state => self
                .list()
                .color_image_transition(vk_image, state.layout(), to.layout()),
        }
    }

    fn copy_film_to_back_buffer(&mut self, image: u32) {
        let extent = self.swapchain.extent();
        let width = self.film.width().min(extent.width);
        let height = self.film.height().min(extent.height);
        let dst = self.swapchain.image(image);
        if self.swapchain.format() == self.film.format() {
            self.list().copy_image(self.film.vk_image(), dst, width, height);
        } else {
            self.list().blit_image(self.film.vk_image(), dst, width, height);
        }
    }

    fn submit(&mut self, image: u32) -> Result<()> {
        let list = &self.lists[self.current];
        list.end()?;
        self.queue.submit(
            &[list],
            &[(self.acquired, ACQUIRE_WAIT_STAGE)],
            &[self.swapchain.render_semaphore(image)],
        )?;
        Ok(())
    }

    fn present(&mut self, image: u32) -> Result<()> {
        self.swapchain.present(self.queue.handle(), image)?;
        trace!("presented image {}", image);
        Ok(())
    }

    fn signal(&mut self, value: u64) -> Result<()> {
        Ok(self.queue.signal(&self.fence, value)?)
    }

    fn completed_fence_value(&self) -> Result<u64> {
        Ok(self.fence.completed_value()?)
    }

    fn wait_for_fence(&mut self, value: u64) -> Result<()> {
        Ok(self.fence.wait(value)?)
    }
}

impl Drop for SwapchainBackend {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait() {
            error!("device wait before teardown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk_utils::command_buffer::{acquired_image_scope, layout_access};

    #[test]
    fn back_buffer_copy_waits_on_the_acquire_stage() {
        let (src, dst, _) =
            acquired_image_scope(ACQUIRE_WAIT_STAGE, ResourceState::CopyDest.layout());
        assert_eq!(src, ACQUIRE_WAIT_STAGE);
        assert_eq!(dst, layout_access(ResourceState::CopyDest.layout()).1);
        assert!(ACQUIRE_WAIT_STAGE.contains(dst));
    }
}
