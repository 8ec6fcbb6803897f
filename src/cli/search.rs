use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{ArgGroup, Parser};
use log::debug;
use tokio::task::block_in_place;

use crate::cli::{OutputFormat, SubCommandExtend, open_catalog, print_result};
use crate::config::{ExtractorOptions, Opts, PreprocessOptions, SearchOptions, ViewportOptions};
use crate::frame::Frame;
use crate::matcher::{MatchResult, Matcher};

#[derive(Parser, Debug, Clone)]
#[command(group(ArgGroup::new("query").required(true).args(["image", "text", "barcode"])))]
pub struct SearchCommand {
    #[command(flatten)]
    pub extractor: ExtractorOptions,
    #[command(flatten)]
    pub preprocess: PreprocessOptions,
    #[command(flatten)]
    pub viewport: ViewportOptions,
    #[command(flatten)]
    pub search: SearchOptions,
    /// 被搜索的图片路径
    pub image: Option<PathBuf>,
    /// 在名称和分类上做全文检索
    #[arg(long)]
    pub text: Option<String>,
    /// 按条码精确查找
    #[arg(long)]
    pub barcode: Option<String>,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let extractor = self.extractor.extractor();
        let store = Arc::new(open_catalog(opts, extractor.as_ref(), &self.search).await?);
        let matcher = Matcher::new(extractor, store, self.search.params());

        let result = match (&self.image, &self.text, &self.barcode) {
            (Some(path), None, None) => {
                let preprocessor = self.preprocess.preprocessor();
                let image = block_in_place(|| -> Result<_> {
                    let frame = Frame::new(image::open(path)?.to_rgb8(), Duration::ZERO);
                    let viewport = self.viewport.viewport();
                    Ok(preprocessor.normalize(&frame, &viewport, self.preprocess.mode()))
                })?;
                debug!("归一化后的图片尺寸: {:?}", image.dimensions());
                matcher.search_image(&image).await?
            }
            (None, Some(text), None) => matcher.search_text(text).await?,
            (None, None, Some(barcode)) => {
                matcher.search_barcode(barcode).await?.map(MatchResult::single).unwrap_or_default()
            }
            _ => bail!("只能指定图片、--text、--barcode 中的一个"),
        };

        print_result(&result, self.output_format)
    }
}
