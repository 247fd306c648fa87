use std::path::Path;

use crate::{Error, Result};

/// Row pitch alignment of buffer-to-texture copies.
pub const TEXTURE_PITCH_ALIGNMENT: usize = 256;

const BYTES_PER_PIXEL: usize = 4;

/// RGBA8 pixels packed for a buffer-to-image copy.
pub struct PackedTexture {
    pub width: u32,
    pub height: u32,
    /// Bytes between the starts of consecutive rows.
    pub row_pitch: usize,
    pub data: Vec<u8>,
}

impl PackedTexture {
    /// Row pitch in texels.
    pub fn row_length(&self) -> u32 {
        (self.row_pitch / BYTES_PER_PIXEL) as u32
    }
}

pub fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Copies tightly packed RGBA8 rows into rows of an aligned pitch. With `flip_y` the last
/// source row becomes the first, for shaders whose texture origin is the lower left corner.
pub fn pack_rows(pixels: &[u8], width: u32, height: u32, flip_y: bool) -> PackedTexture {
    let row_bytes = width as usize * BYTES_PER_PIXEL;
    let row_pitch = align_up(row_bytes, TEXTURE_PITCH_ALIGNMENT);
    let height_usize = height as usize;
    let mut data = vec![0u8; row_pitch * height_usize];

    for row in 0..height_usize {
        let src_row = if flip_y { height_usize - row - 1 } else { row };
        let src = &pixels[src_row * row_bytes..(src_row + 1) * row_bytes];
        data[row * row_pitch..row * row_pitch + row_bytes].copy_from_slice(src);
    }

    PackedTexture {
        width,
        height,
        row_pitch,
        data,
    }
}

/// Decodes an image file to RGBA8 and packs it for upload.
pub fn decode(path: &Path, flip_y: bool) -> Result<PackedTexture> {
    let image = image::open(path)
        .map_err(|source| match source {
            image::ImageError::IoError(source) => Error::io(path, source),
            source => Error::Image {
                path: path.to_path_buf(),
                source,
            },
        })?
        .into_rgba8();
    let (width, height) = image.dimensions();
    Ok(pack_rows(image.as_raw(), width, height, flip_y))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Vec<u8> {
        (0..height)
            .flat_map(|y| (0..width).flat_map(move |x| [x as u8, y as u8, 0, 255]))
            .collect()
    }

    #[test]
    fn rows_are_padded_to_the_pitch() {
        let packed = pack_rows(&gradient(3, 2), 3, 2, false);
        assert_eq!(packed.row_pitch, 256);
        assert_eq!(packed.row_length(), 64);
        assert_eq!(packed.data.len(), 512);
        assert_eq!(&packed.data[0..4], &[0, 0, 0, 255]);
        assert_eq!(&packed.data[8..12], &[2, 0, 0, 255]);
        assert!(packed.data[12..256].iter().all(|b| *b == 0));
        assert_eq!(&packed.data[256..260], &[0, 1, 0, 255]);
    }

    #[test]
    fn flip_reverses_row_order() {
        let packed = pack_rows(&gradient(2, 3), 2, 3, true);
        assert_eq!(packed.data[1], 2);
        assert_eq!(packed.data[256 + 1], 1);
        assert_eq!(packed.data[512 + 1], 0);
    }

    #[test]
    fn wide_rows_round_up_to_the_next_multiple() {
        let packed = pack_rows(&gradient(65, 1), 65, 1, false);
        assert_eq!(packed.row_pitch, 512);
    }

    #[test]
    fn decodes_png_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checker.png");
        let image = image::RgbaImage::from_fn(2, 2, |x, y| {
            image::Rgba([(x * 255) as u8, (y * 255) as u8, 7, 255])
        });
        image.save(&path).unwrap();

        let packed = decode(&path, true).unwrap();
        assert_eq!((packed.width, packed.height), (2, 2));
        assert_eq!(&packed.data[0..4], &[0, 255, 7, 255]);
        assert_eq!(&packed.data[256..260], &[0, 0, 7, 255]);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            decode(Path::new("no/such/texture.png"), false),
            Err(Error::Io { .. })
        ));
    }
}
