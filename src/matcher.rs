use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use futures::FutureExt;
use futures::future::BoxFuture;
use image::RgbImage;
use log::debug;
use serde::Serialize;

use crate::db::{Catalog, CatalogItem};
use crate::extractor::FeatureExtractor;
use crate::metrics;

/// 一次查询的结果，按匹配程度从高到低排列
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct MatchResult {
    items: Vec<CatalogItem>,
}

impl MatchResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn single(item: CatalogItem) -> Self {
        Self { items: vec![item] }
    }

    pub fn items(&self) -> &[CatalogItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<CatalogItem> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl From<Vec<CatalogItem>> for MatchResult {
    fn from(items: Vec<CatalogItem>) -> Self {
        Self { items }
    }
}

/// 匹配参数
#[derive(Debug, Clone, Copy)]
pub struct MatchParams {
    /// 候选结果允许的最大余弦距离（含）
    pub max_distance: f32,
    /// 近邻查询的候选数量
    pub count: usize,
    /// 全文检索返回的最大数量
    pub text_limit: usize,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self { max_distance: 0.25, count: 10, text_limit: 20 }
    }
}

/// 图像匹配策略
///
/// 返回 `None` 表示该策略没有结论，交给下一个策略；返回 `Some` 则结束匹配。
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn search<'a>(&'a self, image: &'a RgbImage) -> BoxFuture<'a, Result<Option<MatchResult>>>;
}

/// 识别条码后在目录中精确查找
pub struct BarcodeStrategy {
    extractor: Arc<dyn FeatureExtractor>,
    catalog: Arc<dyn Catalog>,
}

impl BarcodeStrategy {
    pub fn new(extractor: Arc<dyn FeatureExtractor>, catalog: Arc<dyn Catalog>) -> Self {
        Self { extractor, catalog }
    }
}

impl Strategy for BarcodeStrategy {
    fn name(&self) -> &'static str {
        "barcode"
    }

    fn search<'a>(&'a self, image: &'a RgbImage) -> BoxFuture<'a, Result<Option<MatchResult>>> {
        async move {
            let Some(barcode) = self.extractor.detect_barcode(image) else {
                return Ok(None);
            };
            debug!("识别到条码: {}", barcode);
            let item = self.catalog.find_by_barcode(&barcode).await?;
            if item.is_none() {
                debug!("目录中没有条码为 {} 的商品", barcode);
            }
            Ok(item.map(MatchResult::single))
        }
        .boxed()
    }
}

/// 计算指纹后做最近邻查询，丢弃距离超过阈值的候选
pub struct FingerprintStrategy {
    extractor: Arc<dyn FeatureExtractor>,
    catalog: Arc<dyn Catalog>,
    max_distance: f32,
    count: usize,
}

impl FingerprintStrategy {
    pub fn new(
        extractor: Arc<dyn FeatureExtractor>,
        catalog: Arc<dyn Catalog>,
        max_distance: f32,
        count: usize,
    ) -> Self {
        Self { extractor, catalog, max_distance, count }
    }
}

impl Strategy for FingerprintStrategy {
    fn name(&self) -> &'static str {
        "fingerprint"
    }

    fn search<'a>(&'a self, image: &'a RgbImage) -> BoxFuture<'a, Result<Option<MatchResult>>> {
        async move {
            let Some(fingerprint) = self.extractor.fingerprint(image) else {
                debug!("未能提取指纹");
                return Ok(None);
            };
            let mut candidates = self
                .catalog
                .nearest(&fingerprint, self.count)
                .await?
                .into_iter()
                .filter(|(distance, _)| *distance <= self.max_distance)
                .collect::<Vec<_>>();
            candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));
            candidates.truncate(self.count);
            for (distance, item) in &candidates {
                debug!("{:.4}\t{}", distance, item.name);
            }
            Ok(Some(candidates.into_iter().map(|(_, item)| item).collect::<Vec<_>>().into()))
        }
        .boxed()
    }
}

/// 依次尝试各个策略，第一个给出结论的策略决定结果
pub struct Matcher {
    catalog: Arc<dyn Catalog>,
    strategies: Vec<Box<dyn Strategy>>,
    text_limit: usize,
}

impl Matcher {
    /// 默认策略：先条码，后指纹
    pub fn new(
        extractor: Arc<dyn FeatureExtractor>,
        catalog: Arc<dyn Catalog>,
        params: MatchParams,
    ) -> Self {
        let strategies: Vec<Box<dyn Strategy>> = vec![
            Box::new(BarcodeStrategy::new(extractor.clone(), catalog.clone())),
            Box::new(FingerprintStrategy::new(
                extractor,
                catalog.clone(),
                params.max_distance,
                params.count,
            )),
        ];
        Self::with_strategies(catalog, strategies, params)
    }

    pub fn with_strategies(
        catalog: Arc<dyn Catalog>,
        strategies: Vec<Box<dyn Strategy>>,
        params: MatchParams,
    ) -> Self {
        Self { catalog, strategies, text_limit: params.text_limit }
    }

    /// 搜索一张已归一化的图片
    pub async fn search_image(&self, image: &RgbImage) -> Result<MatchResult> {
        let start = Instant::now();
        for strategy in &self.strategies {
            if let Some(result) = strategy.search(image).await? {
                debug!("策略 {} 返回 {} 个结果", strategy.name(), result.len());
                metrics::inc_search("image", strategy.name(), start.elapsed().as_secs_f32());
                return Ok(result);
            }
        }
        metrics::inc_search("image", "none", start.elapsed().as_secs_f32());
        Ok(MatchResult::empty())
    }

    /// 在名称和分类上做全文检索
    pub async fn search_text(&self, text: &str) -> Result<MatchResult> {
        let start = Instant::now();
        let result = MatchResult::from(self.catalog.search_text(text, self.text_limit).await?);
        metrics::inc_search("text", "text", start.elapsed().as_secs_f32());
        Ok(result)
    }

    /// 按条码精确查找
    pub async fn search_barcode(&self, barcode: &str) -> Result<Option<CatalogItem>> {
        let start = Instant::now();
        let item = self.catalog.find_by_barcode(barcode).await?;
        metrics::inc_search("barcode", "barcode", start.elapsed().as_secs_f32());
        Ok(item)
    }
}
