//! Built-in extractors: AKAZE local features and a thumbnail global descriptor.

use akaze::Akaze;
use image::{imageops::FilterType, DynamicImage};
use log::*;

use crate::{CapabilityError, FeatureExtractor, GlobalExtractor, LocalFeatures, Preprocessing};

/// Detection noise assumed for AKAZE keypoints, in pixels.
const AKAZE_UNCERTAINTY: f32 = 1.0;

/// AKAZE keypoints with their binary descriptors unpacked to one float per bit.
#[derive(Debug, Clone)]
pub struct AkazeExtractor {
    akaze: Akaze,
    resize_max: Option<u32>,
}

impl AkazeExtractor {
    pub fn new(threshold: f64) -> Self {
        Self {
            akaze: Akaze::new(threshold),
            resize_max: None,
        }
    }

    pub fn with_resize_max(self, resize_max: Option<u32>) -> Self {
        Self { resize_max, ..self }
    }
}

impl FeatureExtractor for AkazeExtractor {
    fn preprocessing(&self) -> Preprocessing {
        Preprocessing {
            grayscale: true,
            resize_max: self.resize_max,
        }
    }

    fn extract_local(&self, image: &DynamicImage) -> Result<LocalFeatures, CapabilityError> {
        let (keypoints, descriptors) = self.akaze.extract(image);
        debug!("akaze found {} keypoints", keypoints.len());
        let rows: Vec<Vec<f32>> = descriptors
            .iter()
            .map(|descriptor| {
                descriptor
                    .bytes()
                    .iter()
                    .flat_map(|&byte| (0..8).map(move |bit| ((byte >> bit) & 1) as f32))
                    .collect()
            })
            .collect();
        LocalFeatures::from_rows(
            keypoints.iter().map(|kp| [kp.point.0, kp.point.1]).collect(),
            keypoints.iter().map(|kp| kp.size).collect(),
            AKAZE_UNCERTAINTY,
            &rows,
        )
    }
}

/// A global descriptor made of a mean-free, unit-norm grayscale thumbnail.
#[derive(Debug, Clone, Copy)]
pub struct TinyImage {
    side: u32,
}

impl TinyImage {
    pub fn new(side: u32) -> Self {
        Self { side: side.max(1) }
    }

    pub fn describe(&self, image: &DynamicImage) -> Vec<f32> {
        let thumbnail = image
            .resize_exact(self.side, self.side, FilterType::Triangle)
            .to_luma8();
        let values: Vec<f32> = thumbnail.pixels().map(|p| p.0[0] as f32).collect();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let centered: Vec<f32> = values.iter().map(|v| v - mean).collect();
        let norm = centered.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            centered.iter().map(|v| v / norm).collect()
        } else {
            vec![0.0; centered.len()]
        }
    }
}

impl GlobalExtractor for TinyImage {
    fn preprocessing(&self) -> Preprocessing {
        Preprocessing {
            grayscale: true,
            resize_max: None,
        }
    }

    fn extract_global(&self, image: &DynamicImage) -> Result<Vec<f32>, CapabilityError> {
        Ok(self.describe(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn gradient(width: u32, height: u32, flip: bool) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, _| {
            let v = (x * 255 / width.max(1)) as u8;
            Luma([if flip { 255 - v } else { v }])
        }))
    }

    #[test]
    fn tiny_image_is_unit_norm_and_discriminative() {
        let tiny = TinyImage::new(8);
        let a = tiny.describe(&gradient(64, 48, false));
        let b = tiny.describe(&gradient(128, 96, false));
        let c = tiny.describe(&gradient(64, 48, true));
        assert_eq!(a.len(), 64);
        let dot = |x: &[f32], y: &[f32]| x.iter().zip(y).map(|(p, q)| p * q).sum::<f32>();
        assert!((dot(&a, &a) - 1.0).abs() < 1e-4);
        assert!(dot(&a, &b) > 0.95);
        assert!(dot(&a, &c) < -0.9);
    }

    #[test]
    fn flat_image_gives_zero_descriptor() {
        let flat = DynamicImage::ImageLuma8(GrayImage::from_pixel(10, 10, Luma([7])));
        assert!(TinyImage::new(4).describe(&flat).iter().all(|&v| v == 0.0));
    }
}
