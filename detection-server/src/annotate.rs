// 帧标注与传输编码
//
// 解码JPEG，叠加检测框，按带宽约束缩放后重新编码。
// 标注失败不致命：调用方回退为原始帧。

use common::{Detection, VehicleClass};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, DynamicImage, Rgb, RgbImage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnnotateError {
    #[error("Frame decode failed: {0}")]
    Decode(String),

    #[error("Frame encode failed: {0}")]
    Encode(String),
}

/// 各类别检测框颜色（与原仪表盘配色一致）
fn class_color(class: VehicleClass) -> Rgb<u8> {
    match class {
        VehicleClass::Car => Rgb([0, 255, 0]),
        VehicleClass::Motorcycle => Rgb([255, 165, 0]),
        VehicleClass::Bus => Rgb([0, 0, 255]),
        VehicleClass::Truck => Rgb([128, 0, 128]),
    }
}

/// 叠加检测框并重新编码为JPEG
///
/// `resize_width`为编码前的最大宽度，0表示不缩放。
pub fn annotate_jpeg(
    data: &[u8],
    detections: &[Detection],
    resize_width: u32,
    quality: u8,
) -> Result<Vec<u8>, AnnotateError> {
    let decoded = image::load_from_memory(data)
        .map_err(|e| AnnotateError::Decode(e.to_string()))?;
    let mut img = decoded.into_rgb8();

    for det in detections {
        draw_box(&mut img, det);
    }

    let img = maybe_resize(img, resize_width);

    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode_image(&DynamicImage::ImageRgb8(img))
        .map_err(|e| AnnotateError::Encode(e.to_string()))?;
    Ok(out)
}

/// 2像素描边矩形
fn draw_box(img: &mut RgbImage, det: &Detection) {
    let color = class_color(det.class);
    let (w, h) = (img.width() as i64, img.height() as i64);

    let x1 = (det.bbox.x1 as i64).clamp(0, w - 1);
    let y1 = (det.bbox.y1 as i64).clamp(0, h - 1);
    let x2 = (det.bbox.x2 as i64).clamp(0, w - 1);
    let y2 = (det.bbox.y2 as i64).clamp(0, h - 1);
    if x2 <= x1 || y2 <= y1 {
        return;
    }

    for t in 0..2i64 {
        for x in x1..=x2 {
            put(img, x, y1 + t, color);
            put(img, x, y2 - t, color);
        }
        for y in y1..=y2 {
            put(img, x1 + t, y, color);
            put(img, x2 - t, y, color);
        }
    }
}

fn put(img: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && x < img.width() as i64 && y < img.height() as i64 {
        img.put_pixel(x as u32, y as u32, color);
    }
}

fn maybe_resize(img: RgbImage, max_width: u32) -> RgbImage {
    if max_width == 0 || img.width() <= max_width {
        return img;
    }
    let scale = max_width as f64 / img.width() as f64;
    let new_height = (img.height() as f64 * scale).round().max(1.0) as u32;
    imageops::resize(&img, max_width, new_height, imageops::FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::BoundingBox;

    fn test_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([40, 40, 40]));
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 90)
            .encode_image(&DynamicImage::ImageRgb8(img))
            .unwrap();
        out
    }

    fn detection(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            class: VehicleClass::Car,
            confidence: 0.9,
            bbox: BoundingBox::new(x1, y1, x2, y2),
        }
    }

    #[test]
    fn test_annotate_produces_valid_jpeg() {
        let src = test_jpeg(64, 48);
        let out = annotate_jpeg(&src, &[detection(8.0, 8.0, 40.0, 32.0)], 0, 75).unwrap();
        let img = image::load_from_memory(&out).unwrap().into_rgb8();
        assert_eq!((img.width(), img.height()), (64, 48));
        // 框线落在图像上（JPEG有损，只验证绿色通道占优）
        let p = img.get_pixel(20, 8);
        assert!(p[1] > 150 && p[0] < 120 && p[2] < 120, "pixel was {p:?}");
    }

    #[test]
    fn test_resize_caps_width() {
        let src = test_jpeg(200, 100);
        let out = annotate_jpeg(&src, &[], 100, 75).unwrap();
        let img = image::load_from_memory(&out).unwrap();
        assert_eq!(img.width(), 100);
        assert_eq!(img.height(), 50);
    }

    #[test]
    fn test_out_of_bounds_box_is_clamped() {
        let src = test_jpeg(32, 32);
        // 不应panic
        annotate_jpeg(&src, &[detection(-10.0, -10.0, 100.0, 100.0)], 0, 75).unwrap();
    }

    #[test]
    fn test_garbage_input_fails_cleanly() {
        let err = annotate_jpeg(b"not a jpeg", &[], 0, 75).unwrap_err();
        assert!(matches!(err, AnnotateError::Decode(_)));
    }
}
