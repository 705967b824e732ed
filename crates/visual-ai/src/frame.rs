//! Decoded frames handed to providers and the grid detector.

use image::{DynamicImage, RgbImage};

use crate::types::{GridCell, VisionError, VisionResult};

/// A decoded RGB frame. Ordering inside a `&[Frame]` is time.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pixels: RgbImage,
}

impl Frame {
    pub fn new(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    pub fn from_image(img: &DynamicImage) -> Self {
        Self {
            pixels: img.to_rgb8(),
        }
    }

    /// A frame filled with a single colour. Mostly useful in tests.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self {
            pixels: RgbImage::from_pixel(width, height, image::Rgb(rgb)),
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn to_image(&self) -> DynamicImage {
        DynamicImage::ImageRgb8(self.pixels.clone())
    }

    /// Nearest-neighbour resample to exactly `width x height`.
    pub fn resized(&self, width: u32, height: u32) -> Frame {
        if self.dimensions() == (width, height) {
            return self.clone();
        }
        Frame::new(image::imageops::resize(
            &self.pixels,
            width,
            height,
            image::imageops::FilterType::Nearest,
        ))
    }

    /// Copy out the pixels under `cell`.
    pub fn crop(&self, cell: &GridCell) -> VisionResult<Frame> {
        let (w, h) = self.dimensions();
        let fits = cell.width > 0
            && cell.height > 0
            && cell.x.checked_add(cell.width).is_some_and(|r| r <= w)
            && cell.y.checked_add(cell.height).is_some_and(|b| b <= h);
        if !fits {
            return Err(VisionError::InvalidInput(format!(
                "Region {}x{}+{}+{} outside {w}x{h} frame",
                cell.width, cell.height, cell.x, cell.y
            )));
        }

        let view = image::imageops::crop_imm(&self.pixels, cell.x, cell.y, cell.width, cell.height);
        Ok(Frame::new(view.to_image()))
    }
}

/// Reject an empty frame list before any provider is touched.
pub fn require_frames<'a>(frames: &'a [Frame], what: &str) -> VisionResult<&'a Frame> {
    frames
        .last()
        .ok_or_else(|| VisionError::InvalidInput(format!("No {what} frames provided")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_within_bounds() {
        let frame = Frame::solid(10, 6, [1, 2, 3]);
        let cell = GridCell { x: 8, y: 4, width: 2, height: 2 };
        let cropped = frame.crop(&cell).unwrap();
        assert_eq!(cropped.dimensions(), (2, 2));
        assert_eq!(cropped.pixels().get_pixel(0, 0).0, [1, 2, 3]);
    }

    #[test]
    fn test_crop_out_of_bounds() {
        let frame = Frame::solid(10, 6, [0, 0, 0]);
        let cell = GridCell { x: 8, y: 4, width: 3, height: 2 };
        assert!(matches!(frame.crop(&cell), Err(VisionError::InvalidInput(_))));
        let empty = GridCell { x: 0, y: 0, width: 0, height: 2 };
        assert!(frame.crop(&empty).is_err());
    }

    #[test]
    fn test_resized_keeps_colour() {
        let frame = Frame::solid(20, 12, [9, 8, 7]);
        let small = frame.resized(16, 10);
        assert_eq!(small.dimensions(), (16, 10));
        assert_eq!(small.pixels().get_pixel(15, 9).0, [9, 8, 7]);
        assert_eq!(frame.resized(20, 12), frame);
    }

    #[test]
    fn test_require_frames() {
        assert!(require_frames(&[], "after").is_err());
        let frames = vec![Frame::solid(1, 1, [0, 0, 0]), Frame::solid(2, 2, [0, 0, 0])];
        assert_eq!(require_frames(&frames, "after").unwrap().width(), 2);
    }
}
