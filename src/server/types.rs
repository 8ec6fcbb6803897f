use axum::body::Bytes;
use axum_typed_multipart::TryFromMultipart;
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

/// 搜索请求参数
#[derive(TryFromMultipart)]
pub struct SearchRequest {
    pub file: Bytes,
    pub saliency: Option<bool>,
}

/// 搜索表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct SearchForm {
    /// 上传的图片文件，作为一整帧处理
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub file: String,
    /// 是否先裁剪到显著区域，不填时使用服务启动参数
    pub saliency: Option<bool>,
}

/// 商品（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct ItemSchema {
    pub id: String,
    pub name: String,
    pub price: f64,
    pub location: String,
    pub barcode: Option<String>,
    pub category: Option<String>,
}

/// 搜索响应
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct SearchResponse {
    /// 搜索耗时，单位为毫秒
    pub time: u32,
    /// 按匹配程度排列的商品
    pub result: Vec<ItemSchema>,
}

/// 全文检索参数
#[derive(Debug, Deserialize, IntoParams)]
pub struct TextQuery {
    /// 检索词，多个词之间为“与”的关系
    pub q: String,
    /// 返回的最大数量，不超过服务启动参数
    pub limit: Option<usize>,
}
