mod add;
mod search;
pub mod server;
mod watch;

pub use add::*;
pub use search::*;
pub use server::*;
pub use watch::*;

use anyhow::Result;
use clap::ValueEnum;

use crate::config::{Opts, SearchOptions};
use crate::db::{CatalogBuilder, CatalogStore};
use crate::extractor::FeatureExtractor;
use crate::matcher::MatchResult;
use crate::utils::format_item;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OutputFormat {
    Json,
    Table,
}

/// 配置目录下商品目录的构建器，配置目录不存在时自动创建
pub async fn catalog_builder(opts: &Opts, extractor: &dyn FeatureExtractor) -> Result<CatalogBuilder> {
    tokio::fs::create_dir_all(opts.conf_dir.path()).await?;
    Ok(CatalogBuilder::new(opts.conf_dir.database(), extractor.model(), extractor.dimensions()))
}

pub async fn open_catalog(
    opts: &Opts,
    extractor: &dyn FeatureExtractor,
    search: &SearchOptions,
) -> Result<CatalogStore> {
    catalog_builder(opts, extractor).await?.ef_search(search.ef_search).open().await
}

fn print_result(result: &MatchResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?)
        }
        OutputFormat::Table => {
            if result.is_empty() {
                println!("(no match)");
            }
            for item in result.items() {
                println!("{}", format_item(item));
            }
        }
    }
    Ok(())
}
