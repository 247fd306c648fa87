use std::ffi::CStr;
use std::rc::Rc;

use ash::vk::{DeviceCreateInfo, DeviceQueueCreateInfo, PhysicalDeviceFeatures2, Queue, QueueFlags};
use ash::Device;
use log::info;

use crate::gpu::Gpu;
use crate::{Error, Result};

/// Logical device with one graphics queue and one copy queue. The copy queue uses a
/// dedicated transfer family when the device has one and aliases the graphics family otherwise.
pub struct DeviceContext {
    gpu: Gpu,
    device: Device,
    graphics_family: u32,
    graphics_queue: Queue,
    copy_family: u32,
    copy_queue: Queue,
}

impl DeviceContext {
    pub fn new(
        gpu: &Gpu,
        extensions: &[&'static CStr],
        features: &mut PhysicalDeviceFeatures2,
    ) -> Result<Rc<Self>> {
        let graphics_family = gpu
            .family_type_index(QueueFlags::GRAPHICS | QueueFlags::COMPUTE)
            .ok_or(Error::NoQueueFamily(QueueFlags::GRAPHICS | QueueFlags::COMPUTE))?;
        let copy_family = gpu.dedicated_transfer_family().unwrap_or(graphics_family);

        let priorities: [f32; 1] = [1.];
        let mut queue_infos = vec![DeviceQueueCreateInfo::builder()
            .queue_priorities(&priorities)
            .queue_family_index(graphics_family)
            .build()];
        if copy_family != graphics_family {
            queue_infos.push(
                DeviceQueueCreateInfo::builder()
                    .queue_priorities(&priorities)
                    .queue_family_index(copy_family)
                    .build(),
            );
        }

        let extension_names_raw: Vec<*const std::ffi::c_char> =
            extensions.iter().map(|name| name.as_ptr()).collect();

        let create_info = DeviceCreateInfo::builder()
            .push_next(features)
            .enabled_extension_names(&extension_names_raw)
            .queue_create_infos(&queue_infos);

        unsafe {
            let device = gpu.vulkan().vk_instance().create_device(
                gpu.vk_physical_device(),
                &create_info,
                None,
            )?;
            let graphics_queue = device.get_device_queue(graphics_family, 0);
            let copy_queue = device.get_device_queue(copy_family, 0);

            info!(
                "device created on {} (graphics family {}, copy family {})",
                gpu.name(),
                graphics_family,
                copy_family
            );

            Ok(Rc::new(Self {
                gpu: gpu.clone(),
                device,
                graphics_family,
                graphics_queue,
                copy_family,
                copy_queue,
            }))
        }
    }

    pub fn wait(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    pub fn vk_device(&self) -> &Device {
        &self.device
    }

    pub fn gpu(&self) -> &Gpu {
        &self.gpu
    }

    pub fn graphics_family(&self) -> u32 {
        self.graphics_family
    }

    pub fn graphics_queue(&self) -> Queue {
        self.graphics_queue
    }

    pub fn copy_family(&self) -> u32 {
        self.copy_family
    }

    pub fn copy_queue(&self) -> Queue {
        self.copy_queue
    }

    /// Families that must share resources written by one queue and read by the other.
    pub fn sharing_families(&self) -> Vec<u32> {
        if self.copy_family == self.graphics_family {
            vec![self.graphics_family]
        } else {
            vec![self.graphics_family, self.copy_family]
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}
