use std::rc::Rc;

use ash::vk::{
    Queue, Semaphore, SemaphoreCreateInfo, SemaphoreType, SemaphoreTypeCreateInfo,
    SemaphoreWaitInfo, SubmitInfo, TimelineSemaphoreSubmitInfo,
};
use log::trace;

use crate::device_context::DeviceContext;
use crate::Result;

/// Monotonic GPU progress counter backed by a timeline semaphore.
pub struct Fence {
    device: Rc<DeviceContext>,
    semaphore: Semaphore,
}

impl Fence {
    pub fn new(device: Rc<DeviceContext>, initial_value: u64) -> Result<Self> {
        let mut type_info = SemaphoreTypeCreateInfo::builder()
            .semaphore_type(SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let info = SemaphoreCreateInfo::builder().push_next(&mut type_info);
        let semaphore = unsafe { device.vk_device().create_semaphore(&info, None)? };
        Ok(Self { device, semaphore })
    }

    pub fn vk_semaphore(&self) -> Semaphore {
        self.semaphore
    }

    /// Queues a signal of `value` behind all work already submitted to `queue`.
    pub fn signal(&self, queue: Queue, value: u64) -> Result<()> {
        let semaphores = [self.semaphore];
        let values = [value];
        let mut timeline_info =
            TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&values);
        let submit = SubmitInfo::builder()
            .push_next(&mut timeline_info)
            .signal_semaphores(&semaphores)
            .build();
        unsafe {
            self.device
                .vk_device()
                .queue_submit(queue, &[submit], ash::vk::Fence::null())?;
        }
        trace!("fence signal {} queued", value);
        Ok(())
    }

    pub fn completed_value(&self) -> Result<u64> {
        Ok(unsafe {
            self.device
                .vk_device()
                .get_semaphore_counter_value(self.semaphore)?
        })
    }

    /// Blocks the calling thread until the counter reaches `value`.
    pub fn wait(&self, value: u64) -> Result<()> {
        if self.completed_value()? >= value {
            return Ok(());
        }
        let semaphores = [self.semaphore];
        let values = [value];
        let info = SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.vk_device().wait_semaphores(&info, u64::MAX)? };
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { self.device.vk_device().destroy_semaphore(self.semaphore, None) }
    }
}
