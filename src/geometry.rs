use std::str::FromStr;

use anyhow::anyhow;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// 二维尺寸
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

impl FromStr for Size {
    type Err = anyhow::Error;

    /// 解析 `WIDTHxHEIGHT` 格式
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s.split_once('x').ok_or_else(|| anyhow!("无效的尺寸: {}", s))?;
        let size = Self::new(w.trim().parse()?, h.trim().parse()?);
        if size.width <= 0. || size.height <= 0. {
            return Err(anyhow!("尺寸必须为正数: {}", s));
        }
        Ok(size)
    }
}

/// 矩形区域，原点在左上角
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// 以原点为左上角、覆盖整个 `size` 的矩形
    pub fn from_size(size: Size) -> Self {
        Self::new(0., 0., size.width, size.height)
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn area(&self) -> f64 {
        if self.is_empty() { 0. } else { self.width * self.height }
    }

    /// 宽或高不大于 0（或非有限值）的矩形视为空
    pub fn is_empty(&self) -> bool {
        !(self.width > 0. && self.height > 0.) || !self.width.is_finite() || !self.height.is_finite()
    }

    /// 两个矩形的交集，不相交时返回空矩形
    pub fn intersect(&self, other: &Rect) -> Rect {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= x || bottom <= y {
            return Rect::default();
        }
        Rect::new(x, y, right - x, bottom - y)
    }

    /// 向四周各扩展 `margin`
    pub fn expand(&self, margin: f64) -> Rect {
        Rect::new(
            self.x - margin,
            self.y - margin,
            self.width + 2. * margin,
            self.height + 2. * margin,
        )
    }

    /// 转换为像素坐标 `(x, y, width, height)`，并裁剪到 `bounds` 范围内
    pub fn to_pixels(&self, bounds: (u32, u32)) -> Option<(u32, u32, u32, u32)> {
        let (bw, bh) = (bounds.0 as f64, bounds.1 as f64);
        let x0 = self.x.floor().clamp(0., bw);
        let y0 = self.y.floor().clamp(0., bh);
        let x1 = self.right().ceil().clamp(0., bw);
        let y1 = self.bottom().ceil().clamp(0., bh);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

impl FromStr for Rect {
    type Err = anyhow::Error;

    /// 解析 `x,y,width,height` 格式
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s.split(',').map(|p| p.trim().parse::<f64>()).collect::<Result<Vec<_>, _>>()?;
        match parts[..] {
            [x, y, width, height] => Ok(Rect::new(x, y, width, height)),
            _ => Err(anyhow!("无效的矩形: {}", s)),
        }
    }
}

/// 画面在显示区域内的填充方式
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    /// 等比缩放直至铺满显示区域，超出部分被裁掉
    Fill,
    /// 等比缩放直至完整放入显示区域
    #[default]
    Fit,
}

/// 取景框：显示区域尺寸、其中的感兴趣区域以及填充方式
///
/// 由界面一侧维护，布局或填充方式变化时重新计算。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub size: Size,
    pub roi: Rect,
    pub fit: FitMode,
}

impl Viewport {
    /// 感兴趣区域覆盖整个显示区域
    pub fn full(size: Size, fit: FitMode) -> Self {
        Self { size, roi: Rect::from_size(size), fit }
    }

    /// 将显示坐标系下的感兴趣区域换算为帧像素坐标系下的矩形
    ///
    /// 结果已裁剪到帧范围内，可能为空。
    pub fn to_frame_rect(&self, frame: Size) -> Rect {
        if frame.width <= 0. || frame.height <= 0. {
            return Rect::default();
        }
        let sx = self.size.width / frame.width;
        let sy = self.size.height / frame.height;
        let scale = match self.fit {
            FitMode::Fill => sx.max(sy),
            FitMode::Fit => sx.min(sy),
        };
        if !(scale > 0.) || !scale.is_finite() {
            return Rect::default();
        }

        let offset_x = (self.size.width - frame.width * scale) / 2.;
        let offset_y = (self.size.height - frame.height * scale) / 2.;
        let rect = Rect::new(
            (self.roi.x - offset_x) / scale,
            (self.roi.y - offset_y) / scale,
            self.roi.width / scale,
            self.roi.height / scale,
        );
        rect.intersect(&Rect::from_size(frame))
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::full(Size::default(), FitMode::default())
    }
}
