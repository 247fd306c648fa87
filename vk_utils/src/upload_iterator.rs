use ash::vk::{DeviceAddress, DeviceMemory};
use bytemuck::Pod;

use crate::device_context::DeviceContext;
use crate::{Error, Result};

/// Writes fixed-stride records into a byte range. Every record starts at a multiple of
/// `stride` from the start of the range; the bytes between records are zeroed.
pub struct RecordWriter<'a> {
    bytes: &'a mut [u8],
    stride: usize,
    index: usize,
    base_address: DeviceAddress,
}

impl<'a> RecordWriter<'a> {
    pub fn new(bytes: &'a mut [u8], stride: usize, base_address: DeviceAddress) -> Self {
        Self {
            bytes,
            stride,
            index: 0,
            base_address,
        }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Records written so far.
    pub fn len(&self) -> usize {
        self.index
    }

    pub fn is_empty(&self) -> bool {
        self.index == 0
    }

    pub fn capacity(&self) -> usize {
        if self.stride == 0 {
            0
        } else {
            self.bytes.len() / self.stride
        }
    }

    /// Copies `record` into the next slot and advances by the stride. Returns the device
    /// address of the written record.
    pub fn write<T: Pod>(&mut self, record: &T) -> Result<DeviceAddress> {
        self.write_bytes(bytemuck::bytes_of(record))
    }

    /// Writes several byte slices back to back into one slot.
    pub fn write_parts(&mut self, parts: &[&[u8]]) -> Result<DeviceAddress> {
        let size: usize = parts.iter().map(|part| part.len()).sum();
        let slot = self.next_slot(size)?;
        let mut cursor = 0;
        for part in parts {
            slot[cursor..cursor + part.len()].copy_from_slice(part);
            cursor += part.len();
        }
        slot[cursor..].fill(0);
        Ok(self.advance())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<DeviceAddress> {
        self.write_parts(&[bytes])
    }

    fn next_slot(&mut self, size: usize) -> Result<&mut [u8]> {
        if size > self.stride {
            return Err(Error::RecordTooLarge {
                size,
                stride: self.stride,
            });
        }
        let start = self.index * self.stride;
        if start + self.stride > self.bytes.len() {
            return Err(Error::RecordOutOfRange {
                index: self.index,
                capacity: self.bytes.len(),
            });
        }
        Ok(&mut self.bytes[start..start + self.stride])
    }

    fn advance(&mut self) -> DeviceAddress {
        let address = self.base_address + (self.index * self.stride) as DeviceAddress;
        self.index += 1;
        address
    }
}

/// A `RecordWriter` over mapped device memory. The memory is unmapped when the iterator
/// goes out of scope.
pub struct UploadIterator<'a> {
    device: &'a DeviceContext,
    memory: DeviceMemory,
    writer: RecordWriter<'a>,
}

impl<'a> UploadIterator<'a> {
    /// # Safety
    /// `ptr` must be the start of a live mapping of `memory` spanning `size` bytes that
    /// nothing else accesses while the iterator exists.
    pub(crate) unsafe fn new(
        device: &'a DeviceContext,
        memory: DeviceMemory,
        ptr: *mut u8,
        size: usize,
        stride: usize,
        base_address: DeviceAddress,
    ) -> Self {
        let bytes = std::slice::from_raw_parts_mut(ptr, size);
        Self {
            device,
            memory,
            writer: RecordWriter::new(bytes, stride, base_address),
        }
    }
}

impl<'a> std::ops::Deref for UploadIterator<'a> {
    type Target = RecordWriter<'a>;

    fn deref(&self) -> &Self::Target {
        &self.writer
    }
}

impl<'a> std::ops::DerefMut for UploadIterator<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.writer
    }
}

impl Drop for UploadIterator<'_> {
    fn drop(&mut self) {
        unsafe { self.device.vk_device().unmap_memory(self.memory) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::{Pod, Zeroable};

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    struct Record {
        id: [u8; 8],
        address: u64,
    }

    #[test]
    fn records_land_on_stride_boundaries() {
        let mut bytes = vec![0xffu8; 96];
        let mut writer = RecordWriter::new(&mut bytes, 32, 0x1000);
        let first = writer
            .write(&Record {
                id: [1; 8],
                address: 7,
            })
            .unwrap();
        let second = writer
            .write(&Record {
                id: [2; 8],
                address: 9,
            })
            .unwrap();
        assert_eq!(first, 0x1000);
        assert_eq!(second, 0x1020);
        assert_eq!(writer.len(), 2);
        drop(writer);

        assert_eq!(&bytes[0..8], &[1; 8]);
        assert_eq!(u64::from_ne_bytes(bytes[8..16].try_into().unwrap()), 7);
        assert!(bytes[16..32].iter().all(|b| *b == 0));
        assert_eq!(&bytes[32..40], &[2; 8]);
        assert!(bytes[64..].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn oversized_record_is_rejected() {
        let mut bytes = vec![0u8; 64];
        let mut writer = RecordWriter::new(&mut bytes, 8, 0);
        let err = writer
            .write(&Record {
                id: [0; 8],
                address: 0,
            })
            .unwrap_err();
        assert!(matches!(err, Error::RecordTooLarge { size: 16, stride: 8 }));
        assert!(writer.is_empty());
    }

    #[test]
    fn writing_past_the_range_fails() {
        let mut bytes = vec![0u8; 40];
        let mut writer = RecordWriter::new(&mut bytes, 32, 0);
        writer.write_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(writer.capacity(), 1);
        assert!(matches!(
            writer.write_bytes(&[4]),
            Err(Error::RecordOutOfRange { index: 1, .. })
        ));
    }

    #[test]
    fn parts_are_concatenated() {
        let mut bytes = vec![0u8; 16];
        let mut writer = RecordWriter::new(&mut bytes, 16, 0);
        writer.write_parts(&[&[1, 2], &[3], &[4, 5, 6]]).unwrap();
        drop(writer);
        assert_eq!(&bytes[..7], &[1, 2, 3, 4, 5, 6, 0]);
    }
}
