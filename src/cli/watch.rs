use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use log::{error, info};
use tokio::sync::watch;
use tokio::task::spawn_blocking;

use crate::capture::CaptureLoop;
use crate::cli::{OutputFormat, SubCommandExtend, open_catalog, print_result};
use crate::config::{
    CaptureOptions, ExtractorOptions, Opts, PreprocessOptions, SearchOptions, ViewportOptions,
};
use crate::frame::DirectorySource;
use crate::matcher::Matcher;

#[derive(Parser, Debug, Clone)]
pub struct WatchCommand {
    #[command(flatten)]
    pub extractor: ExtractorOptions,
    #[command(flatten)]
    pub preprocess: PreprocessOptions,
    #[command(flatten)]
    pub viewport: ViewportOptions,
    #[command(flatten)]
    pub search: SearchOptions,
    #[command(flatten)]
    pub capture: CaptureOptions,
    /// 帧图片所在目录，按文件名顺序回放
    pub frames: PathBuf,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for WatchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let extractor = self.extractor.extractor();
        let store = Arc::new(open_catalog(opts, extractor.as_ref(), &self.search).await?);
        let matcher = Arc::new(Matcher::new(extractor, store, self.search.params()));

        let (_viewport_tx, viewport_rx) = watch::channel(self.viewport.viewport());
        let capture = CaptureLoop::new(matcher, self.preprocess.preprocessor(), viewport_rx)
            .interval(Duration::from_millis(self.capture.interval_ms))
            .mode(self.preprocess.mode());

        // 逐个接收每次发布的结果，回放速度快于输出时也不会遗漏
        let mut results = capture.feed();
        let format = self.output_format;
        let printer = tokio::spawn(async move {
            while let Some(result) = results.recv().await {
                if let Err(e) = print_result(&result, format) {
                    error!("输出结果失败: {:#}", e);
                }
            }
        });

        let source =
            DirectorySource::new(&self.frames, Duration::from_millis(self.capture.frame_interval_ms));
        let handle = capture.start(source);
        if !handle.is_started() {
            bail!("采集未能启动");
        }

        spawn_blocking(move || handle.join()).await?;
        // 关闭结果通道，打印任务随之结束
        drop(capture);
        printer.await?;
        info!("回放完成");

        Ok(())
    }
}
