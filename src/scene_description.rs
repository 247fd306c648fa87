use anyhow::Context as _;
use nalgebra_glm as glm;
use renderer::config::RendererConfig;
use renderer::scene::{SceneDesc, SceneGeometry, SphereLight};

const BOOK_MESH: &str = "scenes/pbrt-book/geometry/mesh_00003.ply";
const BOOK_TEXTURE: &str = "scenes/pbrt-book/texture/book_pbrt.png";

fn book_transform() -> glm::Mat4 {
    let translation = glm::translation(&glm::vec3(0.0, 2.2, 0.0));
    let rotation = glm::rotation(1.35, &glm::vec3(0.403, -0.755, -0.517));
    let scale = glm::scaling(&glm::vec3(0.5, 0.5, 0.5));
    translation * rotation * scale
}

/// The textured book lit by a key light and a dimmer fill light.
pub fn book_scene(config: &RendererConfig) -> anyhow::Result<SceneDesc> {
    let book = SceneGeometry::load(config, BOOK_MESH, Some(BOOK_TEXTURE), book_transform())
        .with_context(|| format!("loading {}", BOOK_MESH))?;

    Ok(SceneDesc {
        geometries: vec![book],
        lights: vec![
            SphereLight::new([2.0, 6.0, 3.0], 0.75, [40.0, 38.0, 34.0]),
            SphereLight::new([-4.0, 3.0, -2.0], 0.5, [6.0, 7.0, 9.0]),
        ],
    })
}
