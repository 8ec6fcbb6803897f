use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use crate::cli::*;
use crate::extractor::{FeatureExtractor, ThumbnailExtractor};
use crate::geometry::{FitMode, Rect, Size, Viewport};
use crate::matcher::MatchParams;
use crate::preprocess::{PreprocessMode, Preprocessor};

static CONF_DIR: LazyLock<ConfDir> = LazyLock::new(|| {
    let proj_dirs =
        ProjectDirs::from("", "shelfscan", "shelfscan").expect("failed to get project dir");
    ConfDir { path: proj_dirs.config_dir().to_path_buf() }
});

fn default_config_dir() -> &'static str {
    CONF_DIR.path().to_str().unwrap()
}

#[derive(Parser, Debug, Clone)]
pub struct ExtractorOptions {
    /// 缩略图指纹的边长，指纹维数为其平方
    #[arg(long, value_name = "SIDE", default_value_t = 16, value_parser = clap::value_parser!(u32).range(2..=64))]
    pub thumbnail_side: u32,
}

impl ExtractorOptions {
    pub fn extractor(&self) -> Arc<dyn FeatureExtractor> {
        Arc::new(ThumbnailExtractor::new(self.thumbnail_side))
    }
}

#[derive(Parser, Debug, Clone)]
pub struct PreprocessOptions {
    /// 送入特征提取前的画布边长
    #[arg(long, value_name = "SIZE", default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..=4096))]
    pub canvas: u32,
    /// 先裁剪到画面中最显著的区域
    #[arg(long)]
    pub saliency: bool,
    /// 显著区域向四周扩展的像素数
    #[arg(long, value_name = "PIXELS", default_value_t = 16., value_parser = parse_non_negative)]
    pub saliency_margin: f64,
}

impl PreprocessOptions {
    pub fn preprocessor(&self) -> Preprocessor {
        Preprocessor::new(self.canvas, self.saliency_margin)
    }

    pub fn mode(&self) -> PreprocessMode {
        if self.saliency { PreprocessMode::Saliency } else { PreprocessMode::Viewport }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ViewportOptions {
    /// 显示区域尺寸，不指定时使用整帧
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub viewport: Option<Size>,
    /// 显示坐标系下的感兴趣区域，不指定时为整个显示区域
    #[arg(long, value_name = "X,Y,W,H", value_parser = parse_rect, requires = "viewport")]
    pub roi: Option<Rect>,
    /// 画面在显示区域内的填充方式
    #[arg(long, value_enum, default_value_t = FitMode::Fit)]
    pub fit: FitMode,
}

impl ViewportOptions {
    /// 初始取景框，未指定显示区域时为空取景框，预处理会使用整帧
    pub fn viewport(&self) -> Viewport {
        match self.viewport {
            Some(size) => Viewport {
                size,
                roi: self.roi.unwrap_or_else(|| Rect::from_size(size)),
                fit: self.fit,
            },
            None => Viewport { fit: self.fit, ..Viewport::default() },
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct SearchOptions {
    /// 候选结果允许的最大余弦距离，范围从 0 到 2
    #[arg(long, value_name = "DISTANCE", default_value_t = 0.25, value_parser = parse_distance)]
    pub max_distance: f32,
    /// 近邻查询的候选数量
    #[arg(long, value_name = "COUNT", default_value_t = 10)]
    pub count: usize,
    /// HNSW 搜索时每次访问的节点数量
    #[arg(long, default_value_t = 64)]
    pub ef_search: usize,
    /// 全文检索返回的最大数量
    #[arg(long, value_name = "COUNT", default_value_t = 20)]
    pub text_limit: usize,
}

impl SearchOptions {
    pub fn params(&self) -> MatchParams {
        MatchParams { max_distance: self.max_distance, count: self.count, text_limit: self.text_limit }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct CaptureOptions {
    /// 两次匹配之间的最小间隔，单位毫秒
    #[arg(long, value_name = "MS", default_value_t = 200)]
    pub interval_ms: u64,
    /// 回放目录时相邻两帧的时间戳间隔，单位毫秒
    #[arg(long, value_name = "MS", default_value_t = 50)]
    pub frame_interval_ms: u64,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "shelfscan", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// shelfscan 配置文件目录
    #[arg(short, long, default_value = default_config_dir())]
    pub conf_dir: ConfDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 添加商品到目录
    Add(AddCommand),
    /// 按图片、文本或条码搜索商品
    Search(SearchCommand),
    /// 回放帧目录，持续匹配并输出变化的结果
    Watch(WatchCommand),
    /// 启动 HTTP 搜索服务
    Server(ServerCommand),
}

#[derive(Debug, Clone)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回数据库文件的路径
    pub fn database(&self) -> PathBuf {
        self.path.join("shelfscan.db")
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}

fn parse_size(s: &str) -> anyhow::Result<Size> {
    s.parse()
}

fn parse_rect(s: &str) -> anyhow::Result<Rect> {
    let rect: Rect = s.parse()?;
    if rect.is_empty() {
        return Err(anyhow!("感兴趣区域的宽高必须为正数: {}", s));
    }
    Ok(rect)
}

fn parse_distance(s: &str) -> anyhow::Result<f32> {
    let distance: f32 = s.parse()?;
    if !(0. ..=2.).contains(&distance) {
        return Err(anyhow!("距离必须在 0 到 2 之间: {}", s));
    }
    Ok(distance)
}

fn parse_non_negative(s: &str) -> anyhow::Result<f64> {
    let value: f64 = s.parse()?;
    if !(value >= 0.) {
        return Err(anyhow!("不能为负数: {}", s));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_search_defaults() {
        let opts = Opts::try_parse_from(["shelfscan", "-c", "/tmp/x", "search", "a.jpg"]).unwrap();
        assert_eq!(opts.conf_dir.database(), PathBuf::from("/tmp/x/shelfscan.db"));
        let SubCommand::Search(cmd) = opts.subcmd else { panic!("expected search") };
        let params = cmd.search.params();
        assert_eq!(params.max_distance, 0.25);
        assert_eq!(params.count, 10);
        assert_eq!(cmd.preprocess.canvas, 100);
        assert_eq!(cmd.preprocess.mode(), PreprocessMode::Viewport);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(Opts::try_parse_from(["shelfscan", "search", "a.jpg", "--max-distance", "3"]).is_err());
        assert!(Opts::try_parse_from(["shelfscan", "search", "a.jpg", "--roi", "0,0,1,1"]).is_err());
        assert!(
            Opts::try_parse_from([
                "shelfscan", "search", "a.jpg", "--viewport", "10x10", "--roi", "0,0,0,1"
            ])
            .is_err()
        );
    }

    #[test]
    fn viewport_without_size_is_degenerate() {
        let opts = ViewportOptions { viewport: None, roi: None, fit: FitMode::Fill };
        assert!(opts.viewport().to_frame_rect(Size::new(10., 10.)).is_empty());

        let opts =
            ViewportOptions { viewport: Some(Size::new(10., 10.)), roi: None, fit: FitMode::Fit };
        assert_eq!(opts.viewport().roi, Rect::new(0., 0., 10., 10.));
    }
}
