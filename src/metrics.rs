use std::sync::LazyLock;

use prometheus::*;

static METRIC_SEARCH_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "shelfscan_search_count",
        "count of searches by query kind and the strategy that answered",
        &["kind", "outcome"]
    )
    .unwrap()
});

static METRIC_SEARCH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "shelfscan_search_duration",
        "duration of a single search in seconds",
        &["kind"],
        vec![0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap()
});

static METRIC_CAPTURE_FRAMES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "shelfscan_capture_frames",
        "frames seen by the capture loop",
        &["state"]
    )
    .unwrap()
});

/// 记录一次搜索
///
/// * `kind` - image / text / barcode
/// * `outcome` - 给出结果的策略名称，没有结果时为 `none`
pub fn inc_search(kind: &str, outcome: &str, duration: f32) {
    METRIC_SEARCH_COUNT.with_label_values(&[kind, outcome]).inc();
    METRIC_SEARCH_DURATION.with_label_values(&[kind]).observe(duration as f64);
}

/// 记录采集循环中一帧的去向：throttled / accepted / published / failed
pub fn inc_capture_frame(state: &str) {
    METRIC_CAPTURE_FRAMES.with_label_values(&[state]).inc();
}

/// 以文本格式导出所有指标
pub fn gather_text() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    Ok(encoder.encode_to_string(&prometheus::gather())?)
}
