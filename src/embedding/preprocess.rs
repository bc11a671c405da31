//! Image preprocessing for the feature-vector network.
//!
//! Fixed pipeline:
//! 1. Decode to 3-channel RGB
//! 2. Resize to the model's input resolution (bilinear, aspect ratio not kept)
//! 3. Scale pixel values to [0, 1]
//! 4. Add a batch dimension of 1

use image::imageops::FilterType;
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use super::EmbeddingError;

/// Memory layout the model expects its input tensor in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[1, H, W, 3]`, the layout of TensorFlow exports.
    #[default]
    Nhwc,
    /// `[1, 3, H, W]`
    Nchw,
}

#[derive(Clone, Debug)]
pub struct Preprocessor {
    size: u32,
    layout: TensorLayout,
}

impl Preprocessor {
    pub fn new(size: u32, layout: TensorLayout) -> Self {
        Self { size, layout }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn shape(&self) -> (usize, usize, usize, usize) {
        let size = self.size as usize;
        match self.layout {
            TensorLayout::Nhwc => (1, size, size, 3),
            TensorLayout::Nchw => (1, 3, size, size),
        }
    }

    /// Zero-filled input, used to probe the model's output dimension.
    pub fn blank(&self) -> Array4<f32> {
        Array4::zeros(self.shape())
    }

    pub fn preprocess(&self, data: &[u8]) -> Result<Array4<f32>, EmbeddingError> {
        let decoded =
            image::load_from_memory(data).map_err(|e| EmbeddingError::Decode(e.to_string()))?;

        let rgb = decoded.to_rgb8();
        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 {
            return Err(EmbeddingError::Decode(format!(
                "image has no pixels ({width}x{height})"
            )));
        }

        let resized = image::imageops::resize(&rgb, self.size, self.size, FilterType::Triangle);

        let mut tensor = self.blank();
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for channel in 0..3 {
                let value = pixel[channel] as f32 / 255.0;
                match self.layout {
                    TensorLayout::Nhwc => tensor[[0, y, x, channel]] = value,
                    TensorLayout::Nchw => tensor[[0, channel, y, x]] = value,
                }
            }
        }

        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageFormat;

    fn encode(img: image::RgbaImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut cursor = std::io::Cursor::new(&mut buf);
        image::DynamicImage::ImageRgba8(img)
            .to_rgb8()
            .write_to(&mut cursor, format)
            .unwrap();
        buf
    }

    fn solid_png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([rgb[0], rgb[1], rgb[2], 255]));
        encode(img, ImageFormat::Png)
    }

    #[test]
    fn test_nhwc_shape_and_scaling() {
        let pre = Preprocessor::new(8, TensorLayout::Nhwc);
        let tensor = pre.preprocess(&solid_png(32, 16, [255, 0, 51])).unwrap();

        assert_eq!(tensor.shape(), &[1, 8, 8, 3]);
        assert!((tensor[[0, 3, 5, 0]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 3, 5, 1]].abs() < 1e-6);
        assert!((tensor[[0, 3, 5, 2]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_nchw_layout() {
        let pre = Preprocessor::new(4, TensorLayout::Nchw);
        let tensor = pre.preprocess(&solid_png(10, 10, [0, 255, 0])).unwrap();

        assert_eq!(tensor.shape(), &[1, 3, 4, 4]);
        assert!(tensor[[0, 0, 1, 1]].abs() < 1e-6);
        assert!((tensor[[0, 1, 1, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_values_stay_in_unit_range() {
        let img = image::RgbaImage::from_fn(40, 30, |x, y| {
            image::Rgba([(x * 6) as u8, (y * 8) as u8, 128, 255])
        });
        let pre = Preprocessor::new(16, TensorLayout::Nhwc);
        let tensor = pre.preprocess(&encode(img, ImageFormat::Png)).unwrap();
        assert!(tensor.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_jpeg_and_gif_decode() {
        let img = image::RgbaImage::from_pixel(12, 12, image::Rgba([10, 20, 30, 255]));
        let pre = Preprocessor::new(4, TensorLayout::Nhwc);
        assert!(pre.preprocess(&encode(img.clone(), ImageFormat::Jpeg)).is_ok());
        assert!(pre.preprocess(&encode(img, ImageFormat::Gif)).is_ok());
    }

    #[test]
    fn test_corrupt_bytes_fail_with_decode_error() {
        let pre = Preprocessor::new(4, TensorLayout::Nhwc);
        let err = pre.preprocess(b"definitely not an image").unwrap_err();
        assert!(matches!(err, EmbeddingError::Decode(_)));
    }
}
