use std::marker::PhantomData;
use std::rc::Rc;

use ash::vk::{
    Buffer, BufferCreateInfo, BufferDeviceAddressInfo, BufferUsageFlags, DeviceAddress,
    DeviceMemory, MemoryAllocateFlags, MemoryAllocateFlagsInfo, MemoryAllocateInfo, MemoryMapFlags,
    MemoryPropertyFlags, SharingMode,
};
use bytemuck::Pod;
use log::debug;

use crate::device_context::DeviceContext;
use crate::memory::memory_type_index;
use crate::upload_iterator::UploadIterator;
use crate::{Error, Result};

pub struct BufferResource {
    device: Rc<DeviceContext>,
    buffer: Buffer,
    memory: DeviceMemory,
    size: u64,
    property_flags: MemoryPropertyFlags,
    device_address: Option<DeviceAddress>,
}

impl BufferResource {
    /// Creates and binds a buffer. Buffers with `SHADER_DEVICE_ADDRESS` usage get their
    /// memory allocated with the device-address flag.
    pub fn new(
        device: Rc<DeviceContext>,
        size: u64,
        property_flags: MemoryPropertyFlags,
        usage: BufferUsageFlags,
    ) -> Result<Self> {
        let families = device.sharing_families();
        let buffer_info = BufferCreateInfo::builder().size(size.max(1)).usage(usage);
        let buffer_info = if families.len() > 1 {
            buffer_info
                .sharing_mode(SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            buffer_info.sharing_mode(SharingMode::EXCLUSIVE)
        };

        let vk_device = device.vk_device();
        unsafe {
            let buffer = vk_device.create_buffer(&buffer_info, None)?;
            let memory_requirements = vk_device.get_buffer_memory_requirements(buffer);
            let type_index = match memory_type_index(
                memory_requirements.memory_type_bits,
                device.gpu().memory_properties(),
                property_flags,
            ) {
                Ok(index) => index,
                Err(e) => {
                    vk_device.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };

            let addressable = usage.contains(BufferUsageFlags::SHADER_DEVICE_ADDRESS);
            let mut flags = MemoryAllocateFlagsInfo::builder()
                .flags(MemoryAllocateFlags::DEVICE_ADDRESS)
                .build();
            let mut allocation_info = MemoryAllocateInfo::builder()
                .memory_type_index(type_index)
                .allocation_size(memory_requirements.size);
            if addressable {
                allocation_info = allocation_info.push_next(&mut flags);
            }

            let memory = match vk_device.allocate_memory(&allocation_info, None) {
                Ok(memory) => memory,
                Err(e) => {
                    vk_device.destroy_buffer(buffer, None);
                    return Err(e.into());
                }
            };
            if let Err(e) = vk_device.bind_buffer_memory(buffer, memory, 0) {
                vk_device.destroy_buffer(buffer, None);
                vk_device.free_memory(memory, None);
                return Err(e.into());
            }

            let device_address = if addressable {
                let info = BufferDeviceAddressInfo::builder().buffer(buffer);
                Some(vk_device.get_buffer_device_address(&info))
            } else {
                None
            };

            debug!(
                "buffer {:?}: {} bytes, {:?}, {:?}",
                buffer, size, property_flags, usage
            );

            Ok(Self {
                device,
                buffer,
                memory,
                size,
                property_flags,
                device_address,
            })
        }
    }

    pub fn vk_buffer(&self) -> Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_host_visible(&self) -> bool {
        self.property_flags
            .contains(MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Device address of the first byte, or 0 for buffers created without
    /// `SHADER_DEVICE_ADDRESS` usage.
    pub fn device_address(&self) -> DeviceAddress {
        self.device_address.unwrap_or(0)
    }

    fn map(&self, offset: u64, size: u64) -> Result<*mut u8> {
        if !self.is_host_visible() {
            return Err(Error::NotHostVisible);
        }
        let ptr = unsafe {
            self.device
                .vk_device()
                .map_memory(self.memory, offset, size, MemoryMapFlags::empty())?
        };
        Ok(ptr as *mut u8)
    }

    fn unmap(&self) {
        unsafe { self.device.vk_device().unmap_memory(self.memory) }
    }

    pub fn copy_to<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let len = bytes.len().min(self.size as usize);
        let ptr = self.map(0, self.size)?;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, len) };
        self.unmap();
        Ok(())
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        let ptr = self.map(0, self.size)?;
        let bytes = unsafe { std::slice::from_raw_parts(ptr, self.size as usize) }.to_vec();
        self.unmap();
        Ok(bytes)
    }

    /// Maps the whole buffer for sequential records of `stride` bytes.
    pub fn upload_iterator(&mut self, stride: usize) -> Result<UploadIterator<'_>> {
        self.upload_iterator_at(0, stride)
    }

    /// Maps the buffer from `offset` to its end for sequential records of `stride` bytes.
    pub fn upload_iterator_at(&mut self, offset: u64, stride: usize) -> Result<UploadIterator<'_>> {
        let size = self.size.saturating_sub(offset);
        let ptr = self.map(offset, size)?;
        let base_address = self.device_address.map_or(0, |address| address + offset);
        Ok(unsafe {
            UploadIterator::new(
                &self.device,
                self.memory,
                ptr,
                size as usize,
                stride,
                base_address,
            )
        })
    }

    /// Maps the buffer for its whole lifetime as a single `T`.
    pub fn into_mapped<T: Pod>(self) -> Result<MappedBuffer<T>> {
        let ptr = self.map(0, self.size)?;
        if (self.size as usize) < std::mem::size_of::<T>() {
            self.unmap();
            return Err(Error::RecordTooLarge {
                size: std::mem::size_of::<T>(),
                stride: self.size as usize,
            });
        }
        Ok(MappedBuffer {
            buffer: self,
            ptr,
            _marker: PhantomData,
        })
    }
}

impl Drop for BufferResource {
    fn drop(&mut self) {
        unsafe {
            self.device.vk_device().destroy_buffer(self.buffer, None);
            self.device.vk_device().free_memory(self.memory, None);
        }
    }
}

/// Host-visible buffer that stays mapped. Writes are visible to the device without a flush.
pub struct MappedBuffer<T: Pod> {
    buffer: BufferResource,
    ptr: *mut u8,
    _marker: PhantomData<T>,
}

impl<T: Pod> MappedBuffer<T> {
    pub fn write(&mut self, value: &T) {
        let bytes = bytemuck::bytes_of(value);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr, bytes.len()) };
    }

    pub fn read(&self) -> T {
        let mut value: T = bytemuck::Zeroable::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut value);
        unsafe { std::ptr::copy_nonoverlapping(self.ptr, bytes.as_mut_ptr(), bytes.len()) };
        value
    }

    pub fn buffer(&self) -> &BufferResource {
        &self.buffer
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.buffer.device_address()
    }
}

impl<T: Pod> Drop for MappedBuffer<T> {
    fn drop(&mut self) {
        self.buffer.unmap();
    }
}
