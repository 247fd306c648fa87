//! Tests that need a ray tracing capable device. Run with `cargo test -- --ignored` on a
//! machine that has one.

use std::rc::Rc;

use ash::vk::{BufferUsageFlags, Format, ImageUsageFlags, MemoryPropertyFlags};
use nalgebra_glm as glm;
use renderer::config::RendererConfig;
use renderer::context::{Context, RtxContext};
use renderer::descriptor_heap::DescriptorHeap;
use renderer::mesh::Mesh;
use renderer::renderer::{create_device, pick_gpu};
use renderer::resource_manager::ResourceManager;
use renderer::scene::{Scene, SceneDesc, SceneGeometry};
use vk_utils::device_context::DeviceContext;
use vk_utils::image_resource::Image2DResource;
use vk_utils::queue::QueueKind;
use vk_utils::vk_instance::Vulkan;

fn headless_device() -> Rc<DeviceContext> {
    let _ = env_logger::builder().is_test(true).try_init();
    let vulkan = Vulkan::new("pathtracer-tests", &[], false).expect("Vulkan loader");
    let gpu = pick_gpu(&vulkan).expect("ray tracing capable GPU");
    create_device(&gpu, false).expect("device creation")
}

#[test]
#[ignore = "needs a ray tracing capable GPU"]
fn staged_upload_reads_back_identical_bytes() {
    let device = headless_device();
    let resources = ResourceManager::new(device).unwrap();

    let bytes: Vec<u8> = (0..4099u32).map(|i| (i * 7 % 251) as u8).collect();
    let buffer = resources
        .create_buffer(bytes.len() as u64, BufferUsageFlags::STORAGE_BUFFER)
        .unwrap();
    resources.upload_to_buffer(&buffer, 0, &bytes).unwrap();
    assert_eq!(resources.read_buffer(&buffer).unwrap(), bytes);
}

#[test]
#[ignore = "needs a ray tracing capable GPU"]
fn upload_at_an_offset_leaves_the_prefix_alone() {
    let device = headless_device();
    let resources = ResourceManager::new(device).unwrap();

    let buffer = resources
        .create_buffer_and_upload(&[0u8; 64], BufferUsageFlags::STORAGE_BUFFER)
        .unwrap();
    resources.upload_to_buffer(&buffer, 32, &[9u8; 16]).unwrap();
    let contents = resources.read_buffer(&buffer).unwrap();
    assert!(contents[..32].iter().all(|&b| b == 0));
    assert!(contents[32..48].iter().all(|&b| b == 9));
    assert!(contents[48..].iter().all(|&b| b == 0));
}

#[test]
#[ignore = "needs a ray tracing capable GPU"]
fn fence_has_reached_every_value_waited_for() {
    let device = headless_device();
    let context = Context::new(device.clone(), QueueKind::Graphics).unwrap();
    let resources = ResourceManager::new(device).unwrap();

    let mut last = 0;
    for _ in 0..4 {
        let value = context.wait_for_gpu().unwrap();
        assert!(value > last);
        assert!(context.completed_value().unwrap() >= value);
        last = value;
    }
    let value = resources.wait_for_gpu().unwrap();
    assert!(resources.completed_value().unwrap() >= value);
}

#[test]
#[ignore = "needs a ray tracing capable GPU"]
fn mapped_constant_buffer_round_trips() {
    let device = headless_device();
    let resources = ResourceManager::new(device).unwrap();
    let mut mapped = resources
        .create_upload_buffer_and_map::<[u32; 4]>(BufferUsageFlags::STORAGE_BUFFER)
        .unwrap();
    mapped.write(&[1, 2, 3, 4]);
    assert_eq!(mapped.read(), [1, 2, 3, 4]);
    assert_ne!(mapped.device_address(), 0);
}

/// Strip of 49 quads over 100 vertices: 98 triangles, trimmed to 50.
fn strip_mesh() -> Mesh {
    let mut mesh = Mesh::default();
    for i in 0..50 {
        mesh.positions.push([i as f32, 0.0, 0.0]);
        mesh.positions.push([i as f32, 1.0, 0.0]);
        mesh.uvs.push([i as f32 / 49.0, 0.0]);
        mesh.uvs.push([i as f32 / 49.0, 1.0]);
    }
    for i in 0..25u32 {
        let a = 2 * i;
        mesh.indices.extend_from_slice(&[a, a + 2, a + 1, a + 1, a + 2, a + 3]);
    }
    mesh
}

#[test]
#[ignore = "needs a ray tracing capable GPU"]
fn single_textured_geometry_builds_a_top_level_structure() {
    let device = headless_device();
    let dir = tempfile::tempdir().unwrap();
    image::RgbaImage::from_pixel(4, 4, image::Rgba([255, 128, 0, 255]))
        .save(dir.path().join("orange.png"))
        .unwrap();
    let config = RendererConfig {
        asset_root: dir.path().to_path_buf(),
        ..Default::default()
    };

    let mesh = strip_mesh();
    assert_eq!(mesh.vertex_count(), 100);
    assert_eq!(mesh.triangle_count(), 50);

    let rtx = RtxContext::new(&device);
    let resources = ResourceManager::new(device.clone()).unwrap();
    let graphics = Context::new(device.clone(), QueueKind::Graphics).unwrap();
    let heap = DescriptorHeap::new(device, config.descriptor_heap_capacity).unwrap();
    let scene = Scene::load(
        SceneDesc {
            geometries: vec![SceneGeometry {
                mesh,
                texture: Some("orange.png".into()),
                transform: glm::Mat4::identity(),
            }],
            lights: Vec::new(),
        },
        &resources,
        &heap,
        &config,
    )
    .unwrap();

    assert_eq!(heap.len(), 1);
    assert!(scene.geometries()[0].constants.is_textured());
    assert_eq!(scene.layout().hit_group_record_count(), 3);
    assert!(scene.light_bottom_level().is_none());

    let structures = scene
        .build_acceleration_structures(&resources, &rtx, &graphics)
        .unwrap();
    assert_ne!(structures.top_level.address(), 0);
    assert_eq!(structures.bottom_levels.len(), 1);
    assert_eq!(structures.instances.len(), 1);
    assert_eq!(structures.instances[0].hit_group_offset(), 0);
}

#[test]
#[ignore = "needs a ray tracing capable GPU"]
fn failed_image_allocation_leaves_the_device_usable() {
    let device = headless_device();
    let impossible = MemoryPropertyFlags::PROTECTED | MemoryPropertyFlags::HOST_VISIBLE;
    let result = Image2DResource::new(
        device.clone(),
        8,
        8,
        Format::R8G8B8A8_UNORM,
        ImageUsageFlags::SAMPLED,
        impossible,
    );
    assert!(result.is_err());

    let image = Image2DResource::new(
        device.clone(),
        8,
        8,
        Format::R8G8B8A8_UNORM,
        ImageUsageFlags::SAMPLED,
        MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .unwrap();
    assert_eq!((image.width(), image.height()), (8, 8));
    device.wait().unwrap();
}
