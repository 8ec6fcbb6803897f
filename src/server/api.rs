use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum_auth::AuthBearer;
use axum_typed_multipart::TypedMultipart;
use log::info;
use serde_json::{Value, json};
use tokio::task::block_in_place;

use super::error::{AppError, Result};
use super::state::AppState;
use super::types::*;
use crate::db::CatalogItem;
use crate::matcher::MatchResult;
use crate::metrics;
use crate::preprocess::PreprocessMode;

/// 搜索一张图片
#[utoipa::path(
    post,
    path = "/search",
    request_body(content = SearchForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = SearchResponse),
    )
)]
pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    data: TypedMultipart<SearchRequest>,
) -> Result<Json<Value>> {
    let mode = match data.saliency {
        Some(true) => PreprocessMode::Saliency,
        Some(false) => PreprocessMode::Viewport,
        None => state.mode,
    };

    let start = Instant::now();

    info!("正在搜索上传图片");

    let image = block_in_place(|| -> Result<_> {
        let image = image::load_from_memory(&data.file)?.to_rgb8();
        Ok(state.preprocessor.normalize_image(&image, mode))
    })?;
    let result = state.matcher.search_image(&image).await?;

    Ok(Json(json!({
        "time": start.elapsed().as_millis(),
        "result": result,
    })))
}

/// 在名称和分类上做全文检索
#[utoipa::path(
    get,
    path = "/search/text",
    params(TextQuery),
    responses(
        (status = 200, body = SearchResponse),
    )
)]
pub async fn text_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TextQuery>,
) -> Result<Json<Value>> {
    let start = Instant::now();
    let mut items = state.matcher.search_text(&query.q).await?.into_items();
    if let Some(limit) = query.limit {
        items.truncate(limit);
    }
    Ok(Json(json!({
        "time": start.elapsed().as_millis(),
        "result": MatchResult::from(items),
    })))
}

/// 按条码精确查找
#[utoipa::path(
    get,
    path = "/search/barcode/{code}",
    params(("code" = String, Path, description = "条码内容")),
    responses(
        (status = 200, body = ItemSchema),
        (status = 404, description = "没有该条码的商品"),
    )
)]
pub async fn barcode_handler(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<CatalogItem>> {
    match state.matcher.search_barcode(&code).await? {
        Some(item) => Ok(Json(item)),
        None => Err(AppError::NotFound(code)),
    }
}

/// 从数据库重新加载向量索引
#[utoipa::path(
    post,
    path = "/reload",
    responses(
        (status = 200, description = "重新加载完成"),
        (status = 401, description = "token 错误"),
    )
)]
pub async fn reload_handler(
    State(state): State<Arc<AppState>>,
    AuthBearer(token): AuthBearer,
) -> Result<Json<Value>> {
    if token != state.token {
        return Err(AppError::Unauthorized);
    }
    state.store.reload_index().await?;
    let count = state.store.count().await?;
    info!("索引已重新加载，共 {} 个商品", count);
    Ok(Json(json!({ "count": count })))
}

/// 导出 prometheus 指标
#[utoipa::path(get, path = "/metrics")]
pub async fn metrics_handler() -> Result<impl IntoResponse> {
    let body = metrics::gather_text()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
