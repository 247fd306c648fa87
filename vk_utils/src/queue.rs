use std::rc::Rc;

use ash::vk::{self, PipelineStageFlags, Queue, Semaphore, SubmitInfo};

use crate::command_buffer::CommandList;
use crate::device_context::DeviceContext;
use crate::fence::Fence;
use crate::Result;

/// Which of the device's queues a `CommandQueue` submits to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Graphics,
    Copy,
}

#[derive(Clone)]
pub struct CommandQueue {
    device: Rc<DeviceContext>,
    handle: Queue,
    queue_family_index: u32,
}

impl CommandQueue {
    pub fn new(device: Rc<DeviceContext>, kind: QueueKind) -> Self {
        let (handle, queue_family_index) = match kind {
            QueueKind::Graphics => (device.graphics_queue(), device.graphics_family()),
            QueueKind::Copy => (device.copy_queue(), device.copy_family()),
        };
        Self {
            device,
            handle,
            queue_family_index,
        }
    }

    pub fn family_type_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn handle(&self) -> Queue {
        self.handle
    }

    pub fn device(&self) -> &Rc<DeviceContext> {
        &self.device
    }

    /// Executes closed command lists. `wait` semaphores block the given stages;
    /// `signal` semaphores are binary and fire once the lists complete.
    pub fn submit(
        &self,
        lists: &[&CommandList],
        wait: &[(Semaphore, PipelineStageFlags)],
        signal: &[Semaphore],
    ) -> Result<()> {
        let command_buffers: Vec<vk::CommandBuffer> =
            lists.iter().map(|list| list.vk_command_buffer()).collect();
        let wait_semaphores: Vec<Semaphore> = wait.iter().map(|(s, _)| *s).collect();
        let wait_stages: Vec<PipelineStageFlags> = wait.iter().map(|(_, stage)| *stage).collect();

        let submit = SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(signal)
            .build();

        unsafe {
            self.device
                .vk_device()
                .queue_submit(self.handle, &[submit], vk::Fence::null())?;
        }
        Ok(())
    }

    pub fn signal(&self, fence: &Fence, value: u64) -> Result<()> {
        fence.signal(self.handle, value)
    }
}
