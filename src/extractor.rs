use image::imageops::{self, FilterType};
use image::RgbImage;

/// 图像指纹：固定维数的浮点向量，仅在同一模型版本内可比较
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fingerprint(Vec<f32>);

impl Fingerprint {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    /// 以本机字节序序列化，用于写入数据库
    pub fn to_bytes(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.0).to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.chunks_exact(size_of::<f32>()).map(bytemuck::pod_read_unaligned).collect())
    }

    /// 余弦距离，范围 [0, 2]，任一向量为零向量时视为 1
    pub fn cosine_distance(&self, other: &Fingerprint) -> f32 {
        cosine_distance(&self.0, &other.0)
    }
}

impl From<Vec<f32>> for Fingerprint {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut na, mut nb) = (0f32, 0f32, 0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 1.;
    }
    (1. - dot / (na.sqrt() * nb.sqrt())).clamp(0., 2.)
}

/// 特征提取能力
///
/// 没有检测到内容，或者检测器内部出错时都返回 `None`，调用方将其视为“没有匹配”。
pub trait FeatureExtractor: Send + Sync {
    /// 模型标识，不同模型版本的指纹之间不可比较
    fn model(&self) -> &str;

    /// 指纹维数
    fn dimensions(&self) -> usize;

    /// 计算图像指纹
    fn fingerprint(&self, image: &RgbImage) -> Option<Fingerprint>;

    /// 检测条码，同时检测到多个时返回检测器报告的第一个
    fn detect_barcode(&self, image: &RgbImage) -> Option<String>;
}

/// 内置的缩略图指纹
///
/// 灰度化后缩放到 `side x side`，去均值并归一化；二维码通过 rqrr 识别。
///
/// 只识别二维码。EAN/UPC 等一维条码不会被识别，这类商品的条码需要在清单中给出，
/// 查询时通过 `search --barcode` 或 `/search/barcode/{code}` 精确查找。
#[derive(Debug, Clone)]
pub struct ThumbnailExtractor {
    side: u32,
    model: String,
}

impl ThumbnailExtractor {
    pub fn new(side: u32) -> Self {
        Self { side, model: format!("thumbnail-{}", side) }
    }
}

impl Default for ThumbnailExtractor {
    fn default() -> Self {
        Self::new(16)
    }
}

impl FeatureExtractor for ThumbnailExtractor {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        (self.side * self.side) as usize
    }

    fn fingerprint(&self, image: &RgbImage) -> Option<Fingerprint> {
        if image.width() == 0 || image.height() == 0 {
            return None;
        }
        let gray = imageops::grayscale(image);
        let small = imageops::resize(&gray, self.side, self.side, FilterType::Triangle);

        let mut values = small.pixels().map(|p| p[0] as f32 / 255.).collect::<Vec<_>>();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        values.iter_mut().for_each(|v| *v -= mean);
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        // 纯色画面没有任何可区分的特征
        if norm < 1e-4 {
            return None;
        }
        values.iter_mut().for_each(|v| *v /= norm);
        Some(Fingerprint(values))
    }

    fn detect_barcode(&self, image: &RgbImage) -> Option<String> {
        if image.width() == 0 || image.height() == 0 {
            return None;
        }
        let gray = imageops::grayscale(image);
        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(
            gray.width() as usize,
            gray.height() as usize,
            |x, y| gray.get_pixel(x as u32, y as u32)[0],
        );
        prepared
            .detect_grids()
            .into_iter()
            .find_map(|grid| grid.decode().ok().map(|(_, content)| content))
    }
}
