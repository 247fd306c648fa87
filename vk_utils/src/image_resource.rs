use std::rc::Rc;

use ash::vk::{
    ComponentMapping, DeviceMemory, Extent3D, Format, Image, ImageAspectFlags, ImageCreateInfo,
    ImageLayout, ImageSubresourceRange, ImageTiling, ImageType, ImageUsageFlags, ImageView,
    ImageViewCreateInfo, ImageViewType, MemoryAllocateInfo, MemoryPropertyFlags,
    SampleCountFlags, SharingMode,
};
use log::debug;

use crate::device_context::DeviceContext;
use crate::memory::memory_type_index;
use crate::Result;

/// Allocates and binds memory for `image`. Memory allocated here is freed again if binding
/// fails; the image itself stays with the caller.
unsafe fn bind_memory(
    device: &DeviceContext,
    image: Image,
    property_flags: MemoryPropertyFlags,
) -> Result<DeviceMemory> {
    let vk_device = device.vk_device();
    let memory_requirements = vk_device.get_image_memory_requirements(image);
    let type_index = memory_type_index(
        memory_requirements.memory_type_bits,
        device.gpu().memory_properties(),
        property_flags,
    )?;
    let allocation_info = MemoryAllocateInfo::builder()
        .memory_type_index(type_index)
        .allocation_size(memory_requirements.size);
    let memory = vk_device.allocate_memory(&allocation_info, None)?;
    if let Err(e) = vk_device.bind_image_memory(image, memory, 0) {
        vk_device.free_memory(memory, None);
        return Err(e.into());
    }
    Ok(memory)
}

/// Single-mip 2D colour image with a full view. Tracks the layout it was last
/// transitioned to by its owner.
pub struct Image2DResource {
    device: Rc<DeviceContext>,
    image: Image,
    view: ImageView,
    memory: DeviceMemory,
    format: Format,
    width: u32,
    height: u32,
    layout: ImageLayout,
}

impl Image2DResource {
    pub fn new(
        device: Rc<DeviceContext>,
        width: u32,
        height: u32,
        format: Format,
        usage: ImageUsageFlags,
        property_flags: MemoryPropertyFlags,
    ) -> Result<Self> {
        let families = device.sharing_families();
        let image_info = ImageCreateInfo::builder()
            .image_type(ImageType::TYPE_2D)
            .samples(SampleCountFlags::TYPE_1)
            .format(format)
            .extent(Extent3D {
                width,
                height,
                depth: 1,
            })
            .array_layers(1)
            .mip_levels(1)
            .tiling(ImageTiling::OPTIMAL)
            .initial_layout(ImageLayout::UNDEFINED)
            .usage(usage);
        let image_info = if families.len() > 1 {
            image_info
                .sharing_mode(SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            image_info.sharing_mode(SharingMode::EXCLUSIVE)
        };

        let vk_device = device.vk_device();
        unsafe {
            let image = vk_device.create_image(&image_info, None)?;
            let memory = match bind_memory(&device, image, property_flags) {
                Ok(memory) => memory,
                Err(e) => {
                    vk_device.destroy_image(image, None);
                    return Err(e);
                }
            };

            let view_info = ImageViewCreateInfo::builder()
                .view_type(ImageViewType::TYPE_2D)
                .format(format)
                .components(ComponentMapping::default())
                .subresource_range(
                    ImageSubresourceRange::builder()
                        .aspect_mask(ImageAspectFlags::COLOR)
                        .layer_count(1)
                        .level_count(1)
                        .build(),
                )
                .image(image);
            let view = match vk_device.create_image_view(&view_info, None) {
                Ok(view) => view,
                Err(e) => {
                    vk_device.destroy_image(image, None);
                    vk_device.free_memory(memory, None);
                    return Err(e.into());
                }
            };

            debug!("image {:?}: {}x{} {:?}", image, width, height, format);

            Ok(Self {
                device,
                image,
                view,
                memory,
                format,
                width,
                height,
                layout: ImageLayout::UNDEFINED,
            })
        }
    }

    pub fn vk_image(&self) -> Image {
        self.image
    }

    pub fn view(&self) -> ImageView {
        self.view
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    /// Records the layout a submitted barrier left the image in.
    pub fn set_layout(&mut self, layout: ImageLayout) {
        self.layout = layout;
    }
}

impl Drop for Image2DResource {
    fn drop(&mut self) {
        unsafe {
            self.device.vk_device().destroy_image_view(self.view, None);
            self.device.vk_device().destroy_image(self.image, None);
            self.device.vk_device().free_memory(self.memory, None);
        }
    }
}
