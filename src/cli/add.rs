use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use futures::{StreamExt, TryStreamExt};
use indicatif::{ParallelProgressIterator, ProgressBar};
use log::{info, warn};
use rayon::prelude::*;
use serde::Deserialize;
use tokio::task::block_in_place;

use crate::cli::{SubCommandExtend, catalog_builder};
use crate::config::{ExtractorOptions, Opts, PreprocessOptions};
use crate::db::CatalogItem;
use crate::extractor::FeatureExtractor;
use crate::preprocess::{PreprocessMode, Preprocessor};
use crate::utils::pb_style;

#[derive(Parser, Debug, Clone)]
pub struct AddCommand {
    #[command(flatten)]
    pub extractor: ExtractorOptions,
    #[command(flatten)]
    pub preprocess: PreprocessOptions,
    /// 商品清单，JSON 数组，图片路径相对于清单所在目录
    pub manifest: PathBuf,
}

/// 清单中的一项
#[derive(Deserialize, Debug, Clone)]
pub struct ManifestItem {
    /// 不填时使用图片内容的 blake3 哈希
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub location: String,
    pub image: PathBuf,
    /// 不填时尝试从图片中识别
    pub barcode: Option<String>,
    pub category: Option<String>,
}

struct LoadedItem {
    manifest: ManifestItem,
    data: Vec<u8>,
}

impl SubCommandExtend for AddCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let content = tokio::fs::read_to_string(&self.manifest)
            .await
            .with_context(|| format!("无法读取清单 {}", self.manifest.display()))?;
        let manifest: Vec<ManifestItem> = serde_json::from_str(&content)?;
        let base = self.manifest.parent().map(Path::to_path_buf).unwrap_or_default();
        info!("清单中共 {} 个商品", manifest.len());

        let loaded = futures::stream::iter(manifest)
            .map(|item| {
                let path = base.join(&item.image);
                async move {
                    let data = tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("无法读取图片 {}", path.display()))?;
                    anyhow::Ok(LoadedItem { manifest: item, data })
                }
            })
            .buffered(32)
            .try_collect::<Vec<_>>()
            .await?;

        let extractor = self.extractor.extractor();
        let preprocessor = self.preprocess.preprocessor();
        let mode = self.preprocess.mode();

        let pb = ProgressBar::new(loaded.len() as u64).with_style(pb_style());
        let items = block_in_place(|| {
            loaded
                .into_par_iter()
                .progress_with(pb.clone())
                .filter_map(|item| build_item(item, extractor.as_ref(), &preprocessor, mode))
                .collect::<Vec<_>>()
        });
        pb.finish_with_message("特征计算完成");

        let store = catalog_builder(opts, extractor.as_ref()).await?.open().await?;
        store.upsert_items(&items).await?;
        info!("目录中现有 {} 个商品", store.count().await?);

        Ok(())
    }
}

fn build_item(
    item: LoadedItem,
    extractor: &dyn FeatureExtractor,
    preprocessor: &Preprocessor,
    mode: PreprocessMode,
) -> Option<CatalogItem> {
    let LoadedItem { manifest, data } = item;
    let image = match image::load_from_memory(&data) {
        Ok(image) => image.to_rgb8(),
        Err(e) => {
            warn!("跳过无法解码的图片 {}: {}", manifest.image.display(), e);
            return None;
        }
    };
    let normalized = preprocessor.normalize_image(&image, mode);
    let Some(fingerprint) = extractor.fingerprint(&normalized) else {
        warn!("跳过无法提取指纹的图片 {}", manifest.image.display());
        return None;
    };
    let barcode = manifest.barcode.or_else(|| extractor.detect_barcode(&image));
    let id = manifest.id.unwrap_or_else(|| blake3::hash(&data).to_hex().to_string());

    Some(CatalogItem {
        id,
        name: manifest.name,
        price: manifest.price,
        location: manifest.location,
        image: data,
        barcode,
        category: manifest.category,
        fingerprint,
    })
}
