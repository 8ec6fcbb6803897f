use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use futures::FutureExt;
use futures::future::BoxFuture;
use log::{debug, info};
use sqlx::{SqlitePool, sqlite::*};
use tokio::sync::RwLock;

pub mod crud;
pub mod model;
pub mod vector;

pub use model::*;
pub use vector::VectorIndex;

use crate::extractor::Fingerprint;

pub type Database = SqlitePool;

pub async fn init_db(filename: impl AsRef<Path>) -> Result<Database, sqlx::Error> {
    let filename = filename.as_ref();
    info!("初始化数据库连接: {}", filename.display());

    let options = SqliteConnectOptions::new()
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .filename(filename)
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(options).await?;

    info!("检查数据库迁移");
    sqlx::migrate!().run(&pool).await?;

    Ok(pool)
}

/// 商品目录的查询接口
///
/// 三种查询都使用参数绑定，查询失败或结果为空都只影响本次查询。
pub trait Catalog: Send + Sync {
    /// 按条码精确查找
    fn find_by_barcode<'a>(&'a self, barcode: &'a str) -> BoxFuture<'a, Result<Option<CatalogItem>>>;

    /// 在名称和分类上做全文检索，按相关度排序，相关度相同时按名称排序
    fn search_text<'a>(&'a self, text: &'a str, limit: usize)
    -> BoxFuture<'a, Result<Vec<CatalogItem>>>;

    /// 近似最近邻查询，返回最多 `k` 个 `(余弦距离, 商品)`，按距离升序、名称升序排列
    fn nearest<'a>(
        &'a self,
        fingerprint: &'a Fingerprint,
        k: usize,
    ) -> BoxFuture<'a, Result<Vec<(f32, CatalogItem)>>>;
}

pub struct CatalogBuilder {
    path: PathBuf,
    model: String,
    dimensions: usize,
    ef_search: usize,
}

impl CatalogBuilder {
    /// # Arguments
    ///
    /// * `path` - 数据库文件路径
    /// * `model` - 指纹模型标识
    /// * `dimensions` - 指纹维数
    pub fn new(path: impl AsRef<Path>, model: impl Into<String>, dimensions: usize) -> Self {
        Self { path: path.as_ref().to_path_buf(), model: model.into(), dimensions, ef_search: 64 }
    }

    /// HNSW 搜索时每次访问的节点数量
    pub fn ef_search(mut self, ef_search: usize) -> Self {
        self.ef_search = ef_search;
        self
    }

    pub async fn open(self) -> Result<CatalogStore> {
        let pool = init_db(&self.path).await?;
        check_model(&pool, &self.model, self.dimensions).await?;
        let index = load_index(&pool, self.dimensions).await?;
        Ok(CatalogStore {
            pool,
            index: RwLock::new(index),
            dimensions: self.dimensions,
            ef_search: self.ef_search,
        })
    }
}

/// 基于 SQLite 的商品目录，指纹另外加载到内存中的 HNSW 索引
pub struct CatalogStore {
    pool: Database,
    index: RwLock<VectorIndex>,
    dimensions: usize,
    ef_search: usize,
}

impl CatalogStore {
    pub fn pool(&self) -> &Database {
        &self.pool
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// 批量添加或更新商品，完成后重建向量索引
    pub async fn upsert_items(&self, items: &[CatalogItem]) -> Result<()> {
        for item in items {
            if item.fingerprint.dimensions() != self.dimensions {
                bail!(
                    "商品 {} 的指纹维数为 {}，应为 {}",
                    item.id,
                    item.fingerprint.dimensions(),
                    self.dimensions
                );
            }
        }

        let mut tx = self.pool.begin().await?;
        for item in items {
            crud::upsert_item(&mut *tx, item).await?;
        }
        tx.commit().await?;
        info!("已写入 {} 个商品", items.len());

        self.reload_index().await
    }

    /// 删除商品，返回是否存在
    pub async fn remove_item(&self, id: &str) -> Result<bool> {
        let removed = crud::delete_item(&self.pool, id).await?;
        if removed {
            self.reload_index().await?;
        }
        Ok(removed)
    }

    pub async fn count(&self) -> Result<i64> {
        Ok(crud::count_items(&self.pool).await?)
    }

    /// 从数据库重新构建向量索引，使其反映其他写入者的修改
    pub async fn reload_index(&self) -> Result<()> {
        let index = load_index(&self.pool, self.dimensions).await?;
        *self.index.write().await = index;
        Ok(())
    }
}

impl Catalog for CatalogStore {
    fn find_by_barcode<'a>(&'a self, barcode: &'a str) -> BoxFuture<'a, Result<Option<CatalogItem>>> {
        async move {
            let record = crud::find_by_barcode(&self.pool, barcode).await?;
            Ok(record.map(CatalogItem::from))
        }
        .boxed()
    }

    fn search_text<'a>(
        &'a self,
        text: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<CatalogItem>>> {
        async move {
            let Some(expression) = fts_expression(text) else {
                return Ok(vec![]);
            };
            debug!("全文检索: {}", expression);
            let records = crud::search_text(&self.pool, &expression, limit).await?;
            Ok(records.into_iter().map(CatalogItem::from).collect())
        }
        .boxed()
    }

    fn nearest<'a>(
        &'a self,
        fingerprint: &'a Fingerprint,
        k: usize,
    ) -> BoxFuture<'a, Result<Vec<(f32, CatalogItem)>>> {
        async move {
            if fingerprint.dimensions() != self.dimensions {
                bail!("查询指纹维数为 {}，应为 {}", fingerprint.dimensions(), self.dimensions);
            }
            // 多取回与第 k 个候选距离并列的结果，名称排序后再截断
            let hits =
                self.index.read().await.search_with_ties(fingerprint.as_slice(), k, self.ef_search);
            let seqs = hits.iter().map(|(seq, _)| *seq).collect::<Vec<_>>();

            // 距离按数据库中的最新指纹重新计算
            let records = crud::get_items_by_seq(&self.pool, &seqs).await?;
            let mut result = records
                .into_iter()
                .map(CatalogItem::from)
                .map(|item| (item.fingerprint.cosine_distance(fingerprint), item))
                .collect::<Vec<_>>();
            result.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));
            result.truncate(k);
            Ok(result)
        }
        .boxed()
    }
}

/// 将用户输入转换为 FTS5 查询表达式
///
/// 每个词都用双引号包裹，避免输入被解析为查询语法。
pub fn fts_expression(text: &str) -> Option<String> {
    let terms = text
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>();
    if terms.is_empty() { None } else { Some(terms.join(" ")) }
}

async fn check_model(pool: &Database, model: &str, dimensions: usize) -> Result<()> {
    let stored_model = crud::get_meta(pool, "model").await?;
    let stored_dimensions = crud::get_meta(pool, "dimensions").await?;
    match (stored_model, stored_dimensions) {
        (Some(m), Some(d)) => {
            if m != model || d != dimensions.to_string() {
                bail!("数据库中的指纹模型为 {} ({} 维)，与当前模型 {} ({} 维) 不一致", m, d, model, dimensions);
            }
        }
        _ => {
            info!("记录指纹模型: {} ({} 维)", model, dimensions);
            crud::set_meta(pool, "model", model).await?;
            crud::set_meta(pool, "dimensions", &dimensions.to_string()).await?;
        }
    }
    Ok(())
}

async fn load_index(pool: &Database, dimensions: usize) -> Result<VectorIndex> {
    let points = crud::get_fingerprints(pool)
        .await?
        .into_iter()
        .map(|(seq, bytes)| (seq, Fingerprint::from_bytes(&bytes)))
        .collect::<Vec<_>>();
    debug!("构建向量索引: {} 个指纹", points.len());
    Ok(VectorIndex::build(dimensions, &points))
}

#[cfg(test)]
mod tests {
    use rstest::*;
    use tempfile::TempDir;

    use super::*;

    fn item(id: &str, name: &str, fingerprint: [f32; 3]) -> CatalogItem {
        CatalogItem {
            id: id.to_string(),
            name: name.to_string(),
            price: 1.5,
            location: "A1".to_string(),
            image: vec![1, 2, 3],
            barcode: None,
            category: None,
            fingerprint: Fingerprint::new(fingerprint.to_vec()),
        }
    }

    #[fixture]
    fn temp_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    async fn open(dir: &TempDir) -> CatalogStore {
        CatalogBuilder::new(dir.path().join("test.db"), "test", 3).open().await.unwrap()
    }

    #[rstest]
    #[tokio::test]
    async fn barcode_lookup_is_exact(temp_dir: TempDir) {
        let store = open(&temp_dir).await;
        let mut a = item("a", "Apple", [1., 0., 0.]);
        a.barcode = Some("012345".to_string());
        store.upsert_items(&[a.clone(), item("b", "Banana", [0., 1., 0.])]).await.unwrap();

        assert_eq!(store.find_by_barcode("012345").await.unwrap(), Some(a));
        assert_eq!(store.find_by_barcode("01234").await.unwrap(), None);
    }

    #[rstest]
    #[tokio::test]
    async fn text_search_ranks_and_breaks_ties_by_name(temp_dir: TempDir) {
        let store = open(&temp_dir).await;
        let mut pear = item("p", "Pear Juice", [1., 0., 0.]);
        pear.category = Some("drinks".to_string());
        let mut apple = item("a", "Apple Juice", [0., 1., 0.]);
        apple.category = Some("drinks".to_string());
        let milk = item("m", "Milk", [0., 0., 1.]);
        store.upsert_items(&[pear, apple, milk]).await.unwrap();

        let result = store.search_text("juice", 10).await.unwrap();
        let names = result.iter().map(|i| i.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["Apple Juice", "Pear Juice"]);

        let result = store.search_text("drinks", 10).await.unwrap();
        assert_eq!(result.len(), 2);
        assert!(store.search_text("   ", 10).await.unwrap().is_empty());
        // 查询语法字符被当作普通文本
        assert!(store.search_text("milk\" OR \"juice", 10).await.unwrap().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn nearest_orders_by_distance_then_name(temp_dir: TempDir) {
        let store = open(&temp_dir).await;
        store
            .upsert_items(&[
                item("b", "Beta", [1., 0., 0.]),
                item("a", "Alpha", [1., 0., 0.]),
                item("c", "Gamma", [0., 1., 0.]),
            ])
            .await
            .unwrap();

        let result = store.nearest(&Fingerprint::new(vec![1., 0., 0.]), 10).await.unwrap();
        let names = result.iter().map(|(_, i)| i.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["Alpha", "Beta", "Gamma"]);
        assert!(result[0].0 < 1e-6);
        assert!((result[2].0 - 1.).abs() < 1e-6);

        assert!(store.nearest(&Fingerprint::new(vec![1., 0.]), 10).await.is_err());
    }

    #[rstest]
    #[tokio::test]
    async fn nearest_breaks_ties_before_truncating(temp_dir: TempDir) {
        let store = CatalogBuilder::new(temp_dir.path().join("test.db"), "test", 3)
            .ef_search(1)
            .open()
            .await
            .unwrap();
        let items = ["Zeta", "Yak", "Xray", "Walrus", "Alpha"]
            .into_iter()
            .map(|name| item(&name.to_lowercase(), name, [0., 0., 1.]))
            .collect::<Vec<_>>();
        store.upsert_items(&items).await.unwrap();

        let result = store.nearest(&Fingerprint::new(vec![0., 0., 1.]), 2).await.unwrap();
        let names = result.iter().map(|(_, i)| i.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["Alpha", "Walrus"]);
    }

    #[rstest]
    #[tokio::test]
    async fn upsert_replaces_and_remove_deletes(temp_dir: TempDir) {
        let store = open(&temp_dir).await;
        store.upsert_items(&[item("a", "Alpha", [1., 0., 0.])]).await.unwrap();
        store.upsert_items(&[item("a", "Alpha v2", [0., 1., 0.])]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        let result = store.nearest(&Fingerprint::new(vec![0., 1., 0.]), 1).await.unwrap();
        assert_eq!(result[0].1.name, "Alpha v2");
        assert_eq!(store.search_text("v2", 10).await.unwrap().len(), 1);

        assert!(store.remove_item("a").await.unwrap());
        assert!(!store.remove_item("a").await.unwrap());
        assert!(store.nearest(&Fingerprint::new(vec![0., 1., 0.]), 1).await.unwrap().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn rejects_other_model(temp_dir: TempDir) {
        let store = open(&temp_dir).await;
        assert!(store.upsert_items(&[item("a", "Alpha", [1., 0., 0.])]).await.is_ok());
        drop(store);

        let reopened = CatalogBuilder::new(temp_dir.path().join("test.db"), "other", 3).open().await;
        assert!(reopened.is_err());
        let reopened = CatalogBuilder::new(temp_dir.path().join("test.db"), "test", 4).open().await;
        assert!(reopened.is_err());
        assert!(CatalogBuilder::new(temp_dir.path().join("test.db"), "test", 3).open().await.is_ok());
    }

    #[test]
    fn fts_expression_quotes_terms() {
        assert_eq!(fts_expression("  red  apple "), Some("\"red\" \"apple\"".to_string()));
        assert_eq!(fts_expression("a\"b"), Some("\"a\"\"b\"".to_string()));
        assert_eq!(fts_expression(""), None);
    }
}
