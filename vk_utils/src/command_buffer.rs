use std::rc::Rc;

use ash::vk::{
    AccessFlags, Buffer, BufferCopy, BufferImageCopy, CommandBuffer, CommandBufferAllocateInfo,
    CommandBufferBeginInfo, CommandBufferLevel, CommandBufferUsageFlags, CommandPool,
    CommandPoolCreateFlags, CommandPoolCreateInfo, CommandPoolResetFlags, DependencyFlags,
    Extent3D, Filter, Image, ImageAspectFlags, ImageBlit, ImageCopy, ImageLayout,
    ImageMemoryBarrier, ImageSubresourceLayers, ImageSubresourceRange, MemoryBarrier, Offset3D,
    PipelineStageFlags,
};

use crate::device_context::DeviceContext;
use crate::Result;

/// Access mask and pipeline stage that touch an image while it sits in `layout`.
pub fn layout_access(layout: ImageLayout) -> (AccessFlags, PipelineStageFlags) {
    match layout {
        ImageLayout::UNDEFINED => (AccessFlags::empty(), PipelineStageFlags::TOP_OF_PIPE),
        ImageLayout::GENERAL => (
            AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
            PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
        ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (AccessFlags::TRANSFER_READ, PipelineStageFlags::TRANSFER)
        }
        ImageLayout::TRANSFER_DST_OPTIMAL => {
            (AccessFlags::TRANSFER_WRITE, PipelineStageFlags::TRANSFER)
        }
        ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            AccessFlags::SHADER_READ,
            PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
        ImageLayout::PRESENT_SRC_KHR => {
            (AccessFlags::empty(), PipelineStageFlags::BOTTOM_OF_PIPE)
        }
        _ => (
            AccessFlags::MEMORY_READ | AccessFlags::MEMORY_WRITE,
            PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

/// Stages and destination access of the first transition of a swap chain image. The source
/// stage is the stage the acquire semaphore is waited on, which chains the layout change after
/// the presentation engine releases the image.
pub fn acquired_image_scope(
    wait_stage: PipelineStageFlags,
    new_layout: ImageLayout,
) -> (PipelineStageFlags, PipelineStageFlags, AccessFlags) {
    let (dst_access, dst_stage) = layout_access(new_layout);
    (wait_stage, dst_stage, dst_access)
}

fn color_range() -> ImageSubresourceRange {
    ImageSubresourceRange::builder()
        .aspect_mask(ImageAspectFlags::COLOR)
        .layer_count(1)
        .level_count(1)
        .build()
}

fn color_layers() -> ImageSubresourceLayers {
    ImageSubresourceLayers::builder()
        .aspect_mask(ImageAspectFlags::COLOR)
        .layer_count(1)
        .build()
}

/// Command pool for one queue family. Resetting it recycles every list it handed out.
pub struct CommandAllocator {
    device: Rc<DeviceContext>,
    pool: CommandPool,
}

impl CommandAllocator {
    pub fn new(device: Rc<DeviceContext>, queue_family_index: u32) -> Result<Self> {
        let pool_info = CommandPoolCreateInfo::builder()
            .flags(CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(queue_family_index);
        let pool = unsafe { device.vk_device().create_command_pool(&pool_info, None)? };
        Ok(Self { device, pool })
    }

    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device
                .vk_device()
                .reset_command_pool(self.pool, CommandPoolResetFlags::empty())?
        };
        Ok(())
    }

    pub fn allocate_list(&self) -> Result<CommandList> {
        let allocate_info = CommandBufferAllocateInfo::builder()
            .command_buffer_count(1)
            .level(CommandBufferLevel::PRIMARY)
            .command_pool(self.pool);
        let command_buffers = unsafe {
            self.device
                .vk_device()
                .allocate_command_buffers(&allocate_info)?
        };
        Ok(CommandList {
            device: self.device.clone(),
            command_buffer: command_buffers[0],
        })
    }
}

impl Drop for CommandAllocator {
    fn drop(&mut self) {
        unsafe { self.device.vk_device().destroy_command_pool(self.pool, None) }
    }
}

/// Primary command buffer. Freed together with its allocator.
pub struct CommandList {
    device: Rc<DeviceContext>,
    command_buffer: CommandBuffer,
}

impl CommandList {
    pub fn vk_command_buffer(&self) -> CommandBuffer {
        self.command_buffer
    }

    pub fn begin(&self) -> Result<()> {
        let info =
            CommandBufferBeginInfo::builder().flags(CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .vk_device()
                .begin_command_buffer(self.command_buffer, &info)?
        };
        Ok(())
    }

    pub fn end(&self) -> Result<()> {
        unsafe { self.device.vk_device().end_command_buffer(self.command_buffer)? };
        Ok(())
    }

    pub fn color_image_transition(
        &self,
        image: Image,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) {
        self.color_image_transitions(&[(image, old_layout, new_layout)]);
    }

    /// Records every transition in a single barrier.
    pub fn color_image_transitions(&self, transitions: &[(Image, ImageLayout, ImageLayout)]) {
        let mut src_stage = PipelineStageFlags::empty();
        let mut dst_stage = PipelineStageFlags::empty();
        let barriers: Vec<ImageMemoryBarrier> = transitions
            .iter()
            .map(|&(image, old_layout, new_layout)| {
                let (src_access, src) = layout_access(old_layout);
                let (dst_access, dst) = layout_access(new_layout);
                src_stage |= src;
                dst_stage |= dst;
                ImageMemoryBarrier::builder()
                    .old_layout(old_layout)
                    .new_layout(new_layout)
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .image(image)
                    .src_queue_family_index(ash::vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(ash::vk::QUEUE_FAMILY_IGNORED)
                    .subresource_range(color_range())
                    .build()
            })
            .collect();

        unsafe {
            self.device.vk_device().cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            );
        }
    }

    /// Moves a freshly acquired swap chain image out of `UNDEFINED`. `wait_stage` must be the
    /// stage the acquire semaphore is waited on at submission.
    pub fn acquired_image_transition(
        &self,
        image: Image,
        new_layout: ImageLayout,
        wait_stage: PipelineStageFlags,
    ) {
        let (src_stage, dst_stage, dst_access) = acquired_image_scope(wait_stage, new_layout);
        let barrier = ImageMemoryBarrier::builder()
            .old_layout(ImageLayout::UNDEFINED)
            .new_layout(new_layout)
            .dst_access_mask(dst_access)
            .image(image)
            .src_queue_family_index(ash::vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(ash::vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(color_range())
            .build();
        unsafe {
            self.device.vk_device().cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    /// Transition whose consumer runs on another queue after a host-side wait. Only the
    /// source scope is recorded so the barrier is legal on transfer-only queues.
    pub fn color_image_handoff(&self, image: Image, old_layout: ImageLayout, new_layout: ImageLayout) {
        let (src_access, src_stage) = layout_access(old_layout);
        let barrier = ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_access_mask(src_access)
            .image(image)
            .src_queue_family_index(ash::vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(ash::vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(color_range())
            .build();
        unsafe {
            self.device.vk_device().cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                PipelineStageFlags::BOTTOM_OF_PIPE,
                DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    pub fn memory_barrier(
        &self,
        src_stage: PipelineStageFlags,
        src_access: AccessFlags,
        dst_stage: PipelineStageFlags,
        dst_access: AccessFlags,
    ) {
        let barrier = MemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .build();
        unsafe {
            self.device.vk_device().cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    pub fn copy_buffer(&self, src: Buffer, dst: Buffer, dst_offset: u64, size: u64) {
        let region = BufferCopy::builder()
            .src_offset(0)
            .dst_offset(dst_offset)
            .size(size)
            .build();
        unsafe {
            self.device
                .vk_device()
                .cmd_copy_buffer(self.command_buffer, src, dst, &[region])
        }
    }

    /// `row_length` is in texels; the image must be in `TRANSFER_DST_OPTIMAL`.
    pub fn copy_buffer_to_image(
        &self,
        src: Buffer,
        dst: Image,
        row_length: u32,
        width: u32,
        height: u32,
    ) {
        let region = BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(row_length)
            .buffer_image_height(height)
            .image_subresource(color_layers())
            .image_extent(Extent3D {
                width,
                height,
                depth: 1,
            })
            .build();
        unsafe {
            self.device.vk_device().cmd_copy_buffer_to_image(
                self.command_buffer,
                src,
                dst,
                ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            )
        }
    }

    /// Whole-image copy between images of identical format and extent.
    pub fn copy_image(&self, src: Image, dst: Image, width: u32, height: u32) {
        let region = ImageCopy::builder()
            .src_subresource(color_layers())
            .dst_subresource(color_layers())
            .extent(Extent3D {
                width,
                height,
                depth: 1,
            })
            .build();
        unsafe {
            self.device.vk_device().cmd_copy_image(
                self.command_buffer,
                src,
                ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            )
        }
    }

    /// Whole-image copy with format conversion.
    pub fn blit_image(&self, src: Image, dst: Image, width: u32, height: u32) {
        let corner = Offset3D {
            x: width as i32,
            y: height as i32,
            z: 1,
        };
        let region = ImageBlit::builder()
            .src_subresource(color_layers())
            .src_offsets([Offset3D::default(), corner])
            .dst_subresource(color_layers())
            .dst_offsets([Offset3D::default(), corner])
            .build();
        unsafe {
            self.device.vk_device().cmd_blit_image(
                self.command_buffer,
                src,
                ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                Filter::NEAREST,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn film_round_trip_layouts_carry_transfer_access() {
        let (access, stage) = layout_access(ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(access, AccessFlags::TRANSFER_READ);
        assert_eq!(stage, PipelineStageFlags::TRANSFER);

        let (access, stage) = layout_access(ImageLayout::GENERAL);
        assert!(access.contains(AccessFlags::SHADER_WRITE));
        assert_eq!(stage, PipelineStageFlags::RAY_TRACING_SHADER_KHR);
    }

    #[test]
    fn acquired_images_transition_after_the_semaphore_wait() {
        let (src, dst, access) = acquired_image_scope(
            PipelineStageFlags::TRANSFER,
            ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(src, PipelineStageFlags::TRANSFER);
        assert_ne!(src, layout_access(ImageLayout::UNDEFINED).1);
        assert_eq!(dst, PipelineStageFlags::TRANSFER);
        assert_eq!(access, AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn present_and_undefined_need_no_access() {
        assert!(layout_access(ImageLayout::PRESENT_SRC_KHR).0.is_empty());
        assert!(layout_access(ImageLayout::UNDEFINED).0.is_empty());
    }
}
