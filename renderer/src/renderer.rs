use std::rc::Rc;

use ash::extensions::khr::{
    AccelerationStructure, DeferredHostOperations, RayTracingPipeline, Swapchain as SwapchainExt,
};
use ash::vk::{
    BufferUsageFlags, Format, ImageLayout, ImageUsageFlags, MemoryPropertyFlags,
    PhysicalDeviceAccelerationStructureFeaturesKHR, PhysicalDeviceFeatures2,
    PhysicalDeviceRayTracingPipelineFeaturesKHR, PhysicalDeviceVulkan12Features, SurfaceKHR,
};
use log::info;
use vk_utils::buffer_resource::BufferResource;
use vk_utils::device_context::DeviceContext;
use vk_utils::gpu::Gpu;
use vk_utils::image_resource::Image2DResource;
use vk_utils::queue::QueueKind;
use vk_utils::shader_library::ShaderLibrary;
use vk_utils::swapchain::Swapchain;
use vk_utils::vk_instance::Vulkan;

use crate::config::RendererConfig;
use crate::context::{Context, RtxContext};
use crate::descriptor_heap::DescriptorHeap;
use crate::frame::FrameOrchestrator;
use crate::geometry::AccelerationStructures;
use crate::pipeline::{export_path_tracer_entry_points, path_tracer_desc, StateObject};
use crate::presenter::{PipelineBindings, SwapchainBackend};
use crate::resource_manager::ResourceManager;
use crate::root_signature::GlobalRootSignature;
use crate::sampling::HaltonTables;
use crate::scene::{Scene, SceneDesc};
use crate::shader_table::ShaderTables;
use crate::{Error, Result};

/// Film format. Matches the preferred swap chain format so presentation is a copy.
pub const FILM_FORMAT: Format = Format::R8G8B8A8_UNORM;

/// First device able to trace rays, discrete devices first.
pub fn pick_gpu(vulkan: &Rc<Vulkan>) -> Result<Gpu> {
    let gpu = vulkan
        .hardware_devices()?
        .into_iter()
        .find(Gpu::supports_ray_tracing)
        .ok_or(Error::UnsupportedDevice)?;
    info!("using {} ({:#x}:{:#x})", gpu.name(), gpu.vendor_id(), gpu.device_id());
    Ok(gpu)
}

/// Device with the ray tracing extensions and features enabled; `presentable` adds the
/// swap chain extension.
pub fn create_device(gpu: &Gpu, presentable: bool) -> Result<Rc<DeviceContext>> {
    let mut extensions = vec![
        RayTracingPipeline::name(),
        AccelerationStructure::name(),
        DeferredHostOperations::name(),
    ];
    if presentable {
        extensions.push(SwapchainExt::name());
    }

    let mut vulkan12_features = PhysicalDeviceVulkan12Features::builder()
        .buffer_device_address(true)
        .timeline_semaphore(true)
        .descriptor_indexing(true)
        .descriptor_binding_partially_bound(true)
        .runtime_descriptor_array(true)
        .shader_sampled_image_array_non_uniform_indexing(true);
    let mut rt_features =
        PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);
    let mut acc_features =
        PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
    let mut features = PhysicalDeviceFeatures2::builder()
        .push_next(&mut vulkan12_features)
        .push_next(&mut rt_features)
        .push_next(&mut acc_features);

    Ok(DeviceContext::new(gpu, &extensions, &mut features)?)
}

/// Storage buffers of the Halton sampling tables, permutations widened to 32 bits.
fn upload_sampling_tables(resources: &ResourceManager) -> Result<(BufferResource, BufferResource)> {
    let tables = HaltonTables::default();
    let entries =
        resources.create_buffer_and_upload(&tables.entries, BufferUsageFlags::STORAGE_BUFFER)?;
    let permutations: Vec<u32> = tables.permutations.iter().map(|&p| p as u32).collect();
    let permutations =
        resources.create_buffer_and_upload(&permutations, BufferUsageFlags::STORAGE_BUFFER)?;
    Ok((entries, permutations))
}

/// Persistent accumulation image, left in `GENERAL` layout.
fn create_film(context: &Context, width: u32, height: u32) -> Result<Image2DResource> {
    let mut film = Image2DResource::new(
        context.device().clone(),
        width,
        height,
        FILM_FORMAT,
        ImageUsageFlags::STORAGE | ImageUsageFlags::TRANSFER_SRC,
        MemoryPropertyFlags::DEVICE_LOCAL,
    )?;
    context.execute(|list| {
        list.color_image_transition(film.vk_image(), ImageLayout::UNDEFINED, ImageLayout::GENERAL);
        Ok(())
    })?;
    film.set_layout(ImageLayout::GENERAL);
    Ok(film)
}

/// Loads the scene, builds its acceleration structures, pipeline and shader tables, and
/// renders it progressively into a swap chain.
pub struct Renderer {
    frames: FrameOrchestrator<SwapchainBackend>,
    acceleration_structures: AccelerationStructures,
    scene: Scene,
    _sampling_tables: (BufferResource, BufferResource),
    graphics: Context,
    resources: ResourceManager,
    device: Rc<DeviceContext>,
}

impl Renderer {
    /// Takes ownership of `surface`.
    pub fn new(
        device: Rc<DeviceContext>,
        surface: SurfaceKHR,
        scene: SceneDesc,
        config: &RendererConfig,
    ) -> Result<Self> {
        let rtx = RtxContext::new(&device);
        let resources = ResourceManager::new(device.clone())?;
        let graphics = Context::new(device.clone(), QueueKind::Graphics)?;

        let heap = DescriptorHeap::new(device.clone(), config.descriptor_heap_capacity)?;
        let scene = Scene::load(scene, &resources, &heap, config)?;
        let acceleration_structures =
            scene.build_acceleration_structures(&resources, &rtx, &graphics)?;

        let global = GlobalRootSignature::new(device.clone(), &heap)?;
        global.write_scene(acceleration_structures.top_level.handle());
        global.write_lights(scene.light_buffer());
        let sampling_tables = upload_sampling_tables(&resources)?;
        global.write_sampling_tables(&sampling_tables.0, &sampling_tables.1);

        let mut library = ShaderLibrary::from_file(device.clone(), &config.shader_library_path())?;
        export_path_tracer_entry_points(&mut library);
        let desc = path_tracer_desc(
            &library,
            config.max_payload_size,
            config.max_attribute_size,
            config.max_recursion_depth,
        );
        let state_object = StateObject::new(device.clone(), &rtx, &global, &library, &desc)?;
        let tables = ShaderTables::new(&resources, &rtx, &state_object, &scene)?;

        let film = create_film(&graphics, config.width, config.height)?;
        let swapchain = Swapchain::new(
            device.clone(),
            surface,
            config.width,
            config.height,
            config.frame_count,
        )?;
        let backend = SwapchainBackend::new(
            device.clone(),
            rtx,
            swapchain,
            film,
            PipelineBindings {
                heap,
                global,
                state_object,
                tables,
            },
            config.frame_count as usize,
        )?;
        let frames = FrameOrchestrator::new(
            backend,
            config.frame_count as usize,
            config.width,
            config.height,
            config.max_samples,
        );

        info!(
            "renderer ready: {}x{}, {} samples max",
            config.width, config.height, config.max_samples
        );

        Ok(Self {
            frames,
            acceleration_structures,
            scene,
            _sampling_tables: sampling_tables,
            graphics,
            resources,
            device,
        })
    }

    /// Renders and presents one frame.
    pub fn render(&mut self) -> Result<()> {
        self.frames.render()?;
        Ok(())
    }

    /// Blocks until the device has executed everything submitted for rendering.
    pub fn wait_for_gpu(&mut self) -> Result<u64> {
        self.graphics.wait_for_gpu()?;
        self.resources.wait_for_gpu()?;
        self.frames.wait_for_gpu()
    }

    pub fn sample_index(&self) -> u32 {
        self.frames.sample_index()
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn acceleration_structures(&self) -> &AccelerationStructures {
        &self.acceleration_structures
    }

    pub fn device(&self) -> &Rc<DeviceContext> {
        &self.device
    }
}
