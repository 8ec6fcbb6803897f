use std::sync::Arc;

use crate::db::CatalogStore;
use crate::matcher::Matcher;
use crate::preprocess::{PreprocessMode, Preprocessor};

/// 应用状态
pub struct AppState {
    pub matcher: Matcher,
    /// 商品目录，用于重新加载索引
    pub store: Arc<CatalogStore>,
    pub preprocessor: Preprocessor,
    /// 请求未指定时使用的预处理模式
    pub mode: PreprocessMode,
    /// 鉴权 token
    pub token: String,
}

impl AppState {
    pub fn new(
        matcher: Matcher,
        store: Arc<CatalogStore>,
        preprocessor: Preprocessor,
        mode: PreprocessMode,
        token: String,
    ) -> Arc<Self> {
        Arc::new(AppState { matcher, store, preprocessor, mode, token })
    }
}
