use hnsw_rs::prelude::*;
use rayon::prelude::*;

use crate::extractor::{Fingerprint, cosine_distance};

struct CosineDistance;

impl Distance<f32> for CosineDistance {
    fn eval(&self, va: &[f32], vb: &[f32]) -> f32 {
        cosine_distance(va, vb)
    }
}

/// 指纹的近似最近邻索引（HNSW，余弦距离）
///
/// HNSW 不支持删除，商品更新后需要整体重建。
pub struct VectorIndex {
    hnsw: Hnsw<'static, f32, CosineDistance>,
    dimensions: usize,
    len: usize,
}

impl VectorIndex {
    /// 使用 `(序号, 指纹)` 列表构建索引
    pub fn build(dimensions: usize, points: &[(i64, Fingerprint)]) -> Self {
        let capacity = points.len().max(1024);
        let hnsw = Hnsw::<f32, _>::new(16, capacity, 16, 128, CosineDistance);
        points.par_iter().for_each(|(seq, fingerprint)| {
            hnsw.insert((fingerprint.as_slice(), *seq as usize));
        });
        Self { hnsw, dimensions, len: points.len() }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 返回最多 `k` 个 `(序号, 距离)`，按距离升序
    pub fn search(&self, query: &[f32], k: usize, ef_search: usize) -> Vec<(i64, f32)> {
        if self.is_empty() || k == 0 {
            return vec![];
        }
        self.hnsw
            .search(query, k, ef_search.max(k))
            .into_iter()
            .map(|n| (n.d_id as i64, n.distance))
            .collect()
    }

    /// 与 [`search`](Self::search) 相同，但当第 `k` 个结果与其后的结果距离相同时继续扩大范围，
    /// 保证与第 `k` 个结果并列的候选全部返回，调用方可以再按名称排序截断
    pub fn search_with_ties(&self, query: &[f32], k: usize, ef_search: usize) -> Vec<(i64, f32)> {
        if self.is_empty() || k == 0 {
            return vec![];
        }
        let mut fetch = k.max(ef_search).min(self.len);
        loop {
            let hits = self.search(query, fetch, ef_search);
            if fetch >= self.len || hits.len() < fetch || hits.len() <= k {
                return hits;
            }
            let kth = hits[k - 1].1;
            let last = hits[hits.len() - 1].1;
            if last > kth + TIE_EPSILON {
                return hits;
            }
            fetch = (fetch * 2).min(self.len);
        }
    }
}

const TIE_EPSILON: f32 = 1e-6;
