use std::io::Write;

use renderer::config::RendererConfig;
use renderer::mesh::Mesh;
use renderer::scene::SceneGeometry;
use renderer::texture::{self, TEXTURE_PITCH_ALIGNMENT};
use renderer::Error;

/// Grid of `n` x `n` quads with normals and uvs.
fn grid_ply(n: u32) -> String {
    let side = n + 1;
    let mut ply = format!(
        "ply\nformat ascii 1.0\nelement vertex {}\nproperty float x\nproperty float y\n\
         property float z\nproperty float nx\nproperty float ny\nproperty float nz\n\
         property float u\nproperty float v\nelement face {}\n\
         property list uchar int vertex_indices\nend_header\n",
        side * side,
        n * n
    );
    for y in 0..side {
        for x in 0..side {
            let (u, v) = (x as f32 / n as f32, y as f32 / n as f32);
            ply.push_str(&format!("{} {} 0 0 0 1 {} {}\n", x, y, u, v));
        }
    }
    for y in 0..n {
        for x in 0..n {
            let a = y * side + x;
            ply.push_str(&format!("4 {} {} {} {}\n", a, a + 1, a + side + 1, a + side));
        }
    }
    ply
}

fn write_temp(contents: &[u8], suffix: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn quad_grid_loads_as_whole_triangles() {
    let file = write_temp(grid_ply(4).as_bytes(), ".ply");
    let mesh = Mesh::load(file.path()).unwrap();
    assert_eq!(mesh.vertex_count(), 25);
    assert_eq!(mesh.triangle_count(), 32);
    assert_eq!(mesh.index_count() % 3, 0);
    assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertex_count()));
    assert_eq!(mesh.normals.len(), mesh.vertex_count());
    assert_eq!(mesh.uvs[24], [1.0, 1.0]);
    mesh.validate().unwrap();
}

#[test]
fn scene_geometry_resolves_meshes_under_the_asset_root() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("grid.ply"), grid_ply(2)).unwrap();
    let config = RendererConfig {
        asset_root: dir.path().to_path_buf(),
        ..Default::default()
    };
    let geometry = SceneGeometry::load(
        &config,
        "grid.ply",
        Some("grid.png"),
        nalgebra_glm::Mat4::identity(),
    )
    .unwrap();
    assert_eq!(geometry.mesh.triangle_count(), 8);
    assert_eq!(
        config.asset(geometry.texture.unwrap()),
        dir.path().join("grid.png")
    );
}

#[test]
fn missing_mesh_reports_its_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.ply");
    match Mesh::load(&path) {
        Err(Error::Io { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("expected an I/O error, got {:?}", other.map(|m| m.vertex_count())),
    }
}

#[test]
fn hexagon_faces_are_rejected() {
    let ply = "ply\nformat ascii 1.0\nelement vertex 6\nproperty float x\nproperty float y\n\
               property float z\nelement face 1\nproperty list uchar int vertex_indices\n\
               end_header\n0 0 0\n1 0 0\n2 1 0\n1 2 0\n0 2 0\n-1 1 0\n6 0 1 2 3 4 5\n";
    let file = write_temp(ply.as_bytes(), ".ply");
    assert!(matches!(Mesh::load(file.path()), Err(Error::Ply(_))));
}

#[test]
fn png_textures_decode_flipped_and_pitch_aligned() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stripes.png");
    let image = image::RgbaImage::from_fn(3, 2, |_, y| image::Rgba([y as u8 * 200, 0, 0, 255]));
    image.save(&path).unwrap();

    let packed = texture::decode(&path, true).unwrap();
    assert_eq!((packed.width, packed.height), (3, 2));
    assert_eq!(packed.row_pitch % TEXTURE_PITCH_ALIGNMENT, 0);
    assert_eq!(packed.data[0], 200);
    assert_eq!(packed.data[packed.row_pitch], 0);

    let unflipped = texture::decode(&path, false).unwrap();
    assert_eq!(unflipped.data[0], 0);
}

#[test]
fn garbage_texture_is_a_decode_error() {
    let file = write_temp(b"definitely not a png", ".png");
    assert!(matches!(
        texture::decode(file.path(), true),
        Err(Error::Image { .. })
    ));
}
