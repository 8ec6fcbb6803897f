use std::sync::Arc;

use clap::ValueEnum;
use image::imageops::{self, FilterType};
use image::RgbImage;
use imageproc::gradients::sobel_gradients;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::frame::Frame;
use crate::geometry::{Rect, Size, Viewport};

/// 预处理方式
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreprocessMode {
    /// 只按取景框裁剪
    #[default]
    Viewport,
    /// 按取景框裁剪后，再裁剪到最显著的区域
    Saliency,
}

/// 显著性检测器，返回图像中最显著区域的像素坐标
pub trait SaliencyDetector: Send + Sync {
    fn salient_region(&self, image: &RgbImage) -> Option<Rect>;
}

/// 基于 Sobel 梯度强度的显著性检测
///
/// 梯度强度不低于最大值 `threshold` 倍的像素的外接矩形即为显著区域。
#[derive(Debug, Clone)]
pub struct GradientSaliency {
    threshold: f32,
}

impl GradientSaliency {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Default for GradientSaliency {
    fn default() -> Self {
        Self::new(0.25)
    }
}

impl SaliencyDetector for GradientSaliency {
    fn salient_region(&self, image: &RgbImage) -> Option<Rect> {
        if image.width() < 3 || image.height() < 3 {
            return None;
        }
        let gradients = sobel_gradients(&imageops::grayscale(image));
        let max = gradients.pixels().map(|p| p[0]).max().unwrap_or(0);
        if max == 0 {
            return None;
        }
        let threshold = ((max as f32 * self.threshold) as u16).max(1);

        let (mut x0, mut y0, mut x1, mut y1) = (u32::MAX, u32::MAX, 0, 0);
        for (x, y, p) in gradients.enumerate_pixels() {
            if p[0] >= threshold {
                x0 = x0.min(x);
                y0 = y0.min(y);
                x1 = x1.max(x);
                y1 = y1.max(y);
            }
        }
        Some(Rect::new(x0 as f64, y0 as f64, (x1 - x0 + 1) as f64, (y1 - y0 + 1) as f64))
    }
}

/// 帧预处理：裁剪到取景框，可选显著性裁剪，最后等比缩放到固定大小的画布
///
/// 纯函数，不会失败；裁剪区域为空时直接使用未裁剪的图像。
#[derive(Clone)]
pub struct Preprocessor {
    canvas: u32,
    margin: f64,
    saliency: Arc<dyn SaliencyDetector>,
}

impl Preprocessor {
    /// # Arguments
    ///
    /// * `canvas` - 输出画布边长
    /// * `margin` - 显著区域向四周扩展的像素数
    pub fn new(canvas: u32, margin: f64) -> Self {
        Self { canvas, margin, saliency: Arc::new(GradientSaliency::default()) }
    }

    pub fn with_saliency_detector(mut self, detector: Arc<dyn SaliencyDetector>) -> Self {
        self.saliency = detector;
        self
    }

    pub fn canvas(&self) -> u32 {
        self.canvas
    }

    /// 归一化一帧画面
    pub fn normalize(&self, frame: &Frame, viewport: &Viewport, mode: PreprocessMode) -> RgbImage {
        let cropped = crop_viewport(&frame.image, viewport);
        self.finish(cropped, mode)
    }

    /// 归一化一张完整图片，不做取景框裁剪
    pub fn normalize_image(&self, image: &RgbImage, mode: PreprocessMode) -> RgbImage {
        self.finish(image.clone(), mode)
    }

    fn finish(&self, image: RgbImage, mode: PreprocessMode) -> RgbImage {
        let image = match mode {
            PreprocessMode::Viewport => image,
            PreprocessMode::Saliency => self.crop_salient(&image),
        };
        letterbox(&image, self.canvas)
    }

    /// 裁剪到显著区域，找不到时裁剪为居中的正方形
    pub(crate) fn crop_salient(&self, image: &RgbImage) -> RgbImage {
        let bounds = image.dimensions();
        match self.saliency.salient_region(image).map(|r| r.expand(self.margin).to_pixels(bounds)) {
            Some(Some((x, y, w, h))) => imageops::crop_imm(image, x, y, w, h).to_image(),
            _ => {
                debug!("未找到显著区域，使用居中裁剪");
                center_square(image)
            }
        }
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(100, 16.)
    }
}

/// 按取景框裁剪帧画面
pub fn crop_viewport(image: &RgbImage, viewport: &Viewport) -> RgbImage {
    let bounds = image.dimensions();
    let rect = viewport.to_frame_rect(Size::new(bounds.0 as f64, bounds.1 as f64));
    match rect.to_pixels(bounds) {
        Some((0, 0, w, h)) if (w, h) == bounds => image.clone(),
        Some((x, y, w, h)) => imageops::crop_imm(image, x, y, w, h).to_image(),
        None => {
            debug!("取景框裁剪区域为空，使用原图");
            image.clone()
        }
    }
}

/// 居中裁剪出边长为 `min(width, height)` 的正方形
pub fn center_square(image: &RgbImage) -> RgbImage {
    let (w, h) = image.dimensions();
    let side = w.min(h);
    if side == 0 || (w == side && h == side) {
        return image.clone();
    }
    imageops::crop_imm(image, (w - side) / 2, (h - side) / 2, side, side).to_image()
}

/// 等比缩放并居中放入 `side x side` 的黑色画布
pub fn letterbox(image: &RgbImage, side: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    if (w, h) == (side, side) {
        return image.clone();
    }
    let mut canvas = RgbImage::new(side, side);
    if w == 0 || h == 0 {
        return canvas;
    }

    let scale = (side as f64 / w as f64).min(side as f64 / h as f64);
    let nw = ((w as f64 * scale).round() as u32).clamp(1, side);
    let nh = ((h as f64 * scale).round() as u32).clamp(1, side);
    let resized = imageops::resize(image, nw, nh, FilterType::Triangle);
    imageops::overlay(&mut canvas, &resized, ((side - nw) / 2) as i64, ((side - nh) / 2) as i64);
    canvas
}
