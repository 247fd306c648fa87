use std::ffi::c_char;
use std::rc::Rc;

use ash::extensions::khr::Surface;
use ash::vk::{
    CompositeAlphaFlagsKHR, Extent2D, Format, Image, ImageUsageFlags, PresentInfoKHR,
    PresentModeKHR, Queue, Semaphore, SemaphoreCreateInfo, SharingMode, SurfaceFormatKHR,
    SurfaceKHR, SurfaceTransformFlagsKHR, SwapchainCreateInfoKHR, SwapchainKHR,
};
use log::{debug, info};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::device_context::DeviceContext;
use crate::vk_instance::Vulkan;
use crate::{Error, Result};

/// Instance extensions needed to create a surface for `display_handle`.
pub fn required_surface_extensions(display_handle: RawDisplayHandle) -> Result<Vec<*const c_char>> {
    Ok(ash_window::enumerate_required_extensions(display_handle)?.to_vec())
}

pub fn create_surface(
    vulkan: &Vulkan,
    display_handle: RawDisplayHandle,
    window_handle: RawWindowHandle,
) -> Result<SurfaceKHR> {
    let surface = unsafe {
        ash_window::create_surface(
            vulkan.library(),
            vulkan.vk_instance(),
            display_handle,
            window_handle,
            None,
        )?
    };
    Ok(surface)
}

/// Prefers the 8-bit RGBA format the film uses so presentation can be a plain copy.
fn choose_format(formats: &[SurfaceFormatKHR]) -> Option<SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| f.format == Format::R8G8B8A8_UNORM)
        .or_else(|| formats.iter().find(|f| f.format == Format::B8G8R8A8_UNORM))
        .or_else(|| formats.first())
        .copied()
}

/// FIFO swap chain whose images are written by transfer commands only.
pub struct Swapchain {
    device: Rc<DeviceContext>,
    surface_loader: Surface,
    swapchain_loader: ash::extensions::khr::Swapchain,
    surface: SurfaceKHR,
    handle: SwapchainKHR,
    images: Vec<Image>,
    acquire_semaphores: Vec<Semaphore>,
    render_semaphores: Vec<Semaphore>,
    format: Format,
    extent: Extent2D,
}

impl Swapchain {
    /// Takes ownership of `surface`.
    pub fn new(
        device: Rc<DeviceContext>,
        surface: SurfaceKHR,
        width: u32,
        height: u32,
        frame_count: u32,
    ) -> Result<Self> {
        let vulkan = device.gpu().vulkan().clone();
        let surface_loader = Surface::new(vulkan.library(), vulkan.vk_instance());
        let swapchain_loader =
            ash::extensions::khr::Swapchain::new(vulkan.vk_instance(), device.vk_device());
        let gpu = device.gpu().vk_physical_device();
        let queue_index = device.graphics_family();

        unsafe {
            if !surface_loader.get_physical_device_surface_support(gpu, queue_index, surface)? {
                return Err(Error::PresentUnsupported(queue_index));
            }

            let formats = surface_loader.get_physical_device_surface_formats(gpu, surface)?;
            let format = choose_format(&formats).ok_or(Error::Vulkan(
                ash::vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
            ))?;
            let capabilities =
                surface_loader.get_physical_device_surface_capabilities(gpu, surface)?;

            let mut desired_image_count = frame_count.max(capabilities.min_image_count);
            if capabilities.max_image_count > 0 && desired_image_count > capabilities.max_image_count
            {
                desired_image_count = capabilities.max_image_count;
            }
            let extent = match capabilities.current_extent.width {
                u32::MAX => Extent2D { width, height },
                _ => capabilities.current_extent,
            };
            let pre_transform = if capabilities
                .supported_transforms
                .contains(SurfaceTransformFlagsKHR::IDENTITY)
            {
                SurfaceTransformFlagsKHR::IDENTITY
            } else {
                capabilities.current_transform
            };

            let swapchain_create_info = SwapchainCreateInfoKHR::builder()
                .surface(surface)
                .min_image_count(desired_image_count)
                .image_color_space(format.color_space)
                .image_format(format.format)
                .image_extent(extent)
                .image_usage(ImageUsageFlags::TRANSFER_DST)
                .image_sharing_mode(SharingMode::EXCLUSIVE)
                .pre_transform(pre_transform)
                .composite_alpha(CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(PresentModeKHR::FIFO)
                .clipped(true)
                .image_array_layers(1);

            let handle = swapchain_loader.create_swapchain(&swapchain_create_info, None)?;
            let images = swapchain_loader.get_swapchain_images(handle)?;

            let semaphore_create_info = SemaphoreCreateInfo::default();
            let mut acquire_semaphores = Vec::new();
            let mut render_semaphores = Vec::new();
            for _ in 0..images.len() {
                acquire_semaphores.push(
                    device
                        .vk_device()
                        .create_semaphore(&semaphore_create_info, None)?,
                );
                render_semaphores.push(
                    device
                        .vk_device()
                        .create_semaphore(&semaphore_create_info, None)?,
                );
            }

            info!(
                "swapchain {}x{} {:?}, {} images",
                extent.width,
                extent.height,
                format.format,
                images.len()
            );

            Ok(Self {
                device,
                surface_loader,
                swapchain_loader,
                surface,
                handle,
                images,
                acquire_semaphores,
                render_semaphores,
                format: format.format,
                extent,
            })
        }
    }

    /// Acquires the next image, signalling the acquire semaphore of `slot`.
    /// Returns the image index and the semaphore to wait on.
    pub fn acquire(&self, slot: usize) -> Result<(u32, Semaphore)> {
        let semaphore = self.acquire_semaphores[slot % self.acquire_semaphores.len()];
        let (index, suboptimal) = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.handle,
                u64::MAX,
                semaphore,
                ash::vk::Fence::null(),
            )?
        };
        if suboptimal {
            debug!("swapchain image {} acquired suboptimal", index);
        }
        Ok((index, semaphore))
    }

    /// Semaphore the submission writing image `index` signals and presentation waits on.
    pub fn render_semaphore(&self, index: u32) -> Semaphore {
        self.render_semaphores[index as usize]
    }

    pub fn present(&self, queue: Queue, index: u32) -> Result<()> {
        let wait = [self.render_semaphores[index as usize]];
        let swapchains = [self.handle];
        let indices = [index];
        let present_info = PresentInfoKHR::builder()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);
        unsafe { self.swapchain_loader.queue_present(queue, &present_info)? };
        Ok(())
    }

    pub fn image(&self, index: u32) -> Image {
        self.images[index as usize]
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.vk_device().device_wait_idle();
            for semaphore in self
                .acquire_semaphores
                .iter()
                .chain(self.render_semaphores.iter())
            {
                self.device.vk_device().destroy_semaphore(*semaphore, None);
            }
            self.swapchain_loader.destroy_swapchain(self.handle, None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}
