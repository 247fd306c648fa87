use std::path::Path;
use std::rc::Rc;

use ash::vk::{BufferUsageFlags, Format, ImageLayout, ImageUsageFlags, MemoryPropertyFlags};
use bytemuck::Pod;
use log::debug;
use vk_utils::buffer_resource::{BufferResource, MappedBuffer};
use vk_utils::device_context::DeviceContext;
use vk_utils::image_resource::Image2DResource;
use vk_utils::queue::QueueKind;

use crate::context::Context;
use crate::texture::{self, align_up, PackedTexture};
use crate::Result;

/// Placement alignment of small persistently mapped constant buffers.
pub const CONSTANT_BUFFER_ALIGNMENT: usize = 256;

/// Creates device buffers and textures and fills them through staging copies on the
/// copy queue. Every upload blocks until the copy has completed.
pub struct ResourceManager {
    device: Rc<DeviceContext>,
    copy: Context,
}

impl ResourceManager {
    pub fn new(device: Rc<DeviceContext>) -> Result<Self> {
        let copy = Context::new(device.clone(), QueueKind::Copy)?;
        Ok(Self { device, copy })
    }

    pub fn device(&self) -> &Rc<DeviceContext> {
        &self.device
    }

    /// Device-local buffer. Always usable as a copy source/destination and by address.
    pub fn create_buffer(&self, size: u64, usage: BufferUsageFlags) -> Result<BufferResource> {
        Ok(BufferResource::new(
            self.device.clone(),
            size,
            MemoryPropertyFlags::DEVICE_LOCAL,
            usage
                | BufferUsageFlags::TRANSFER_DST
                | BufferUsageFlags::TRANSFER_SRC
                | BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?)
    }

    /// Host-visible, coherent buffer.
    pub fn create_upload_buffer(&self, size: u64, usage: BufferUsageFlags) -> Result<BufferResource> {
        Ok(BufferResource::new(
            self.device.clone(),
            size,
            MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
            usage
                | BufferUsageFlags::TRANSFER_SRC
                | BufferUsageFlags::TRANSFER_DST
                | BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?)
    }

    /// Copies `data` into `dst` at `dst_offset` through a temporary staging buffer.
    pub fn upload_to_buffer(&self, dst: &BufferResource, dst_offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut staging = self.create_upload_buffer(data.len() as u64, BufferUsageFlags::empty())?;
        staging.copy_to(data)?;
        self.copy.execute(|list| {
            list.copy_buffer(
                staging.vk_buffer(),
                dst.vk_buffer(),
                dst_offset,
                data.len() as u64,
            );
            Ok(())
        })?;
        debug!("uploaded {} bytes to {:?}", data.len(), dst.vk_buffer());
        Ok(())
    }

    pub fn create_buffer_and_upload<T: Pod>(
        &self,
        data: &[T],
        usage: BufferUsageFlags,
    ) -> Result<BufferResource> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = self.create_buffer(bytes.len() as u64, usage)?;
        self.upload_to_buffer(&buffer, 0, bytes)?;
        Ok(buffer)
    }

    /// Upload buffer holding one `T`, mapped for the lifetime of the returned value.
    pub fn create_upload_buffer_and_map<T: Pod>(
        &self,
        usage: BufferUsageFlags,
    ) -> Result<MappedBuffer<T>> {
        let size = align_up(std::mem::size_of::<T>(), CONSTANT_BUFFER_ALIGNMENT);
        let buffer = self.create_upload_buffer(size as u64, usage)?;
        Ok(buffer.into_mapped()?)
    }

    /// Decodes an image file, flipped for a lower-left texture origin, and uploads it.
    pub fn load_image(&self, path: &Path) -> Result<Image2DResource> {
        let packed = texture::decode(path, true)?;
        debug!(
            "decoded {} ({}x{})",
            path.display(),
            packed.width,
            packed.height
        );
        self.upload_texture(&packed)
    }

    /// Copies packed RGBA8 rows into a new sampled texture left in `SHADER_READ_ONLY_OPTIMAL`.
    pub fn upload_texture(&self, packed: &PackedTexture) -> Result<Image2DResource> {
        let mut image = Image2DResource::new(
            self.device.clone(),
            packed.width,
            packed.height,
            Format::R8G8B8A8_UNORM,
            ImageUsageFlags::SAMPLED | ImageUsageFlags::TRANSFER_DST,
            MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let mut staging =
            self.create_upload_buffer(packed.data.len() as u64, BufferUsageFlags::empty())?;
        staging.copy_to(&packed.data)?;

        self.copy.execute(|list| {
            list.color_image_transition(
                image.vk_image(),
                ImageLayout::UNDEFINED,
                ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            list.copy_buffer_to_image(
                staging.vk_buffer(),
                image.vk_image(),
                packed.row_length(),
                packed.width,
                packed.height,
            );
            list.color_image_handoff(
                image.vk_image(),
                ImageLayout::TRANSFER_DST_OPTIMAL,
                ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
            Ok(())
        })?;
        image.set_layout(ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        Ok(image)
    }

    /// Copies `src` into a host-visible buffer and returns its contents.
    pub fn read_buffer(&self, src: &BufferResource) -> Result<Vec<u8>> {
        let readback = self.create_upload_buffer(src.size(), BufferUsageFlags::empty())?;
        self.copy.execute(|list| {
            list.copy_buffer(src.vk_buffer(), readback.vk_buffer(), 0, src.size());
            Ok(())
        })?;
        let mut bytes = readback.read_bytes()?;
        bytes.truncate(src.size() as usize);
        Ok(bytes)
    }

    /// Blocks until everything submitted to the copy queue has executed.
    pub fn wait_for_gpu(&self) -> Result<u64> {
        self.copy.wait_for_gpu()
    }

    pub fn completed_value(&self) -> Result<u64> {
        self.copy.completed_value()
    }
}
