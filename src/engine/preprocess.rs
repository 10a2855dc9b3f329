//! Image <-> tensor conversion for the detector, the restoration network and
//! the background upsampler

use image::{DynamicImage, GenericImageView, ImageBuffer, Rgb, RgbImage};
use tract_onnx::prelude::tract_ndarray::{Array4, ArrayView4, ArrayViewMut3};

use crate::error::InputError;

/// Convert image to the detector's NCHW tensor, normalized to about [-1, 1].
pub fn image_to_detector_tensor(image: &RgbImage) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - 127.5) / 128.0;
        }
    }
    tensor
}

/// Write a face crop into one batch slot, RGB normalized to [-1, 1].
pub fn write_face_slot(mut slot: ArrayViewMut3<f32>, crop: &RgbImage) {
    for (x, y, pixel) in crop.enumerate_pixels() {
        for c in 0..3 {
            slot[[c, y as usize, x as usize]] = pixel[c] as f32 / 127.5 - 1.0;
        }
    }
}

/// Read one batch slot in [-1, 1] back into an 8-bit image.
pub fn face_slot_to_image(batch: &ArrayView4<f32>, slot: usize) -> RgbImage {
    let (_, _, height, width) = batch.dim();
    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        let mut px = [0u8; 3];
        for (c, v) in px.iter_mut().enumerate() {
            let value = batch[[slot, c, y as usize, x as usize]].clamp(-1.0, 1.0);
            *v = ((value + 1.0) * 127.5).round() as u8;
        }
        Rgb(px)
    })
}

/// Convert image to a [0, 1] NCHW tensor (background network input).
pub fn image_to_unit_tensor(image: &RgbImage) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}

/// Convert a [0, 1] NCHW tensor back to an 8-bit image.
pub fn unit_tensor_to_image(tensor: &ArrayView4<f32>) -> RgbImage {
    let (_, _, height, width) = tensor.dim();
    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        let mut px = [0u8; 3];
        for (c, v) in px.iter_mut().enumerate() {
            let value = tensor[[0, c, y as usize, x as usize]].clamp(0.0, 1.0);
            *v = (value * 255.0).round() as u8;
        }
        Rgb(px)
    })
}

/// Resize image with padding to maintain aspect ratio
pub fn letterbox(image: &RgbImage, target_w: u32, target_h: u32) -> (RgbImage, ResizeInfo) {
    let info = ResizeInfo::new(image.dimensions(), (target_w, target_h));
    let new_w = ((image.width() as f32 * info.scale) as u32).clamp(1, target_w);
    let new_h = ((image.height() as f32 * info.scale) as u32).clamp(1, target_h);

    let resized = image::imageops::resize(image, new_w, new_h, image::imageops::FilterType::Triangle);

    let mut padded = ImageBuffer::from_pixel(target_w, target_h, Rgb([0u8, 0, 0]));
    image::imageops::replace(&mut padded, &resized, info.offset_x as i64, info.offset_y as i64);

    (padded, info)
}

/// Decode image from bytes with EXIF orientation handling
pub fn decode_image(data: &[u8]) -> Result<RgbImage, InputError> {
    let image = image::load_from_memory(data).map_err(|e| InputError::Decode(e.to_string()))?;
    if image.width() == 0 || image.height() == 0 {
        return Err(InputError::ZeroDimensions);
    }
    Ok(apply_exif_orientation(data, image).to_rgb8())
}

/// Apply EXIF orientation to correct image rotation
fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    use std::io::Cursor;

    let orientation = match exif::Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif_data) => exif_data
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1) as u8,
        Err(_) => 1,
    };

    // See: https://exiftool.org/TagNames/EXIF.html (Orientation)
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Letterbox geometry for mapping detector coordinates back to the image
#[derive(Debug, Clone, Copy)]
pub struct ResizeInfo {
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub original_width: u32,
    pub original_height: u32,
}

impl ResizeInfo {
    pub fn new(original: (u32, u32), target: (u32, u32)) -> Self {
        let (orig_w, orig_h) = original;
        let (target_w, target_h) = target;

        let scale = f32::min(
            target_w as f32 / orig_w.max(1) as f32,
            target_h as f32 / orig_h.max(1) as f32,
        );

        let new_w = ((orig_w as f32 * scale) as u32).clamp(1, target_w);
        let new_h = ((orig_h as f32 * scale) as u32).clamp(1, target_h);

        Self {
            scale,
            offset_x: (target_w - new_w) / 2,
            offset_y: (target_h - new_h) / 2,
            original_width: orig_w,
            original_height: orig_h,
        }
    }

    /// Convert detection coordinates back to original image space
    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        let x = (x - self.offset_x as f32) / self.scale;
        let y = (y - self.offset_y as f32) / self.scale;
        (x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tract_onnx::prelude::tract_ndarray::{s, Array4};

    #[test]
    fn test_face_slot_round_trip_is_exact() {
        let crop = RgbImage::from_fn(5, 4, |x, y| Rgb([(x * 50) as u8, (y * 60) as u8, 255]));
        let mut batch = Array4::<f32>::zeros((2, 3, 4, 5));
        write_face_slot(batch.slice_mut(s![1, .., .., ..]), &crop);
        let back = face_slot_to_image(&batch.view(), 1);
        assert_eq!(back, crop);
    }

    #[test]
    fn test_face_slot_clamps_out_of_range() {
        let mut batch = Array4::<f32>::zeros((1, 3, 1, 1));
        batch[[0, 0, 0, 0]] = 3.0;
        batch[[0, 1, 0, 0]] = -3.0;
        let img = face_slot_to_image(&batch.view(), 0);
        assert_eq!(img.get_pixel(0, 0), &Rgb([255, 0, 128]));
    }

    #[test]
    fn test_resize_info_round_trip() {
        let info = ResizeInfo::new((1280, 640), (640, 640));
        assert_eq!(info.scale, 0.5);
        assert_eq!(info.offset_x, 0);
        assert_eq!(info.offset_y, 160);
        let (x, y) = info.to_original(320.0, 320.0);
        assert_eq!((x, y), (640.0, 320.0));
    }

    #[test]
    fn test_letterbox_dimensions() {
        let image = RgbImage::from_pixel(200, 100, Rgb([9, 9, 9]));
        let (padded, info) = letterbox(&image, 64, 64);
        assert_eq!(padded.dimensions(), (64, 64));
        assert_eq!(info.offset_y, 16);
        assert_eq!(padded.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(padded.get_pixel(32, 32), &Rgb([9, 9, 9]));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_image(b"not an image"), Err(InputError::Decode(_))));
    }
}
