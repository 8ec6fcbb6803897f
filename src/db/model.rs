use serde::Serialize;

use crate::extractor::Fingerprint;

/// 商品记录
#[derive(sqlx::FromRow)]
pub struct ItemRecord {
    /// 自增序号，同时作为全文索引和向量索引中的 ID
    pub seq: i64,
    /// 商品 ID
    pub id: String,
    pub name: String,
    pub price: f64,
    pub location: String,
    /// 商品图片的原始字节
    pub image: Vec<u8>,
    pub barcode: Option<String>,
    pub category: Option<String>,
    /// 指纹，本机字节序的 f32 数组
    pub fingerprint: Vec<u8>,
}

/// 商品目录中的一项，对匹配流程来说只读
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogItem {
    pub id: String,
    pub name: String,
    pub price: f64,
    pub location: String,
    #[serde(skip)]
    pub image: Vec<u8>,
    pub barcode: Option<String>,
    pub category: Option<String>,
    #[serde(skip)]
    pub fingerprint: Fingerprint,
}

impl From<ItemRecord> for CatalogItem {
    fn from(record: ItemRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            price: record.price,
            location: record.location,
            image: record.image,
            barcode: record.barcode,
            category: record.category,
            fingerprint: Fingerprint::from_bytes(&record.fingerprint),
        }
    }
}
