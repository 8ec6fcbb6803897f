use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

use crate::frame::FrameSource;
use crate::geometry::Viewport;
use crate::matcher::{MatchResult, Matcher};
use crate::metrics;
use crate::preprocess::{PreprocessMode, Preprocessor};

/// 帧节流
///
/// 启动后的第一帧只用来确定时间基准，之后与上一次接受的帧间隔不足 `interval` 的帧都被丢弃。
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Duration>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// 返回该帧是否需要处理
    pub fn accept(&mut self, timestamp: Duration) -> bool {
        match self.last {
            None => {
                self.last = Some(timestamp);
                false
            }
            Some(last) if timestamp.saturating_sub(last) < self.interval => false,
            Some(_) => {
                self.last = Some(timestamp);
                true
            }
        }
    }
}

/// 单写多读的发布者，只有值发生变化时才通知订阅者
///
/// `subscribe` 只能看到最新值；`feed` 按顺序收到每一次变化。
pub struct Publisher<T> {
    tx: watch::Sender<T>,
    feeds: Arc<Mutex<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T: PartialEq + Clone> Publisher<T> {
    pub fn new(initial: T) -> Self {
        Self { tx: watch::Sender::new(initial), feeds: Arc::default() }
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// 订阅之后发布的每一个新值，所有发布者都被丢弃后通道关闭
    pub fn feed(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner).push(tx);
        rx
    }

    /// 发布新值，返回是否真的发生了变化
    pub fn publish(&self, value: T) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value.clone();
            true
        });
        if changed {
            self.feeds
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|feed| feed.send(value.clone()).is_ok());
        }
        changed
    }
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), feeds: self.feeds.clone() }
    }
}

/// 采集线程存活期间持有，退出时清除运行标记
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// 采集循环：节流、按最新的取景框预处理、匹配并发布变化的结果
pub struct CaptureLoop {
    matcher: Arc<Matcher>,
    preprocessor: Preprocessor,
    mode: PreprocessMode,
    interval: Duration,
    viewport: watch::Receiver<Viewport>,
    results: Publisher<MatchResult>,
    permission: Publisher<bool>,
    active: Arc<AtomicBool>,
}

impl CaptureLoop {
    /// # Arguments
    ///
    /// * `matcher` - 匹配器
    /// * `preprocessor` - 预处理器
    /// * `viewport` - 由界面一侧写入的取景框
    pub fn new(
        matcher: Arc<Matcher>,
        preprocessor: Preprocessor,
        viewport: watch::Receiver<Viewport>,
    ) -> Self {
        Self {
            matcher,
            preprocessor,
            mode: PreprocessMode::default(),
            interval: Duration::from_millis(200),
            viewport,
            results: Publisher::new(MatchResult::empty()),
            permission: Publisher::new(false),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 两次处理之间的最小间隔
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn mode(mut self, mode: PreprocessMode) -> Self {
        self.mode = mode;
        self
    }

    /// 订阅当前的匹配结果
    pub fn subscribe(&self) -> watch::Receiver<MatchResult> {
        self.results.subscribe()
    }

    /// 按顺序接收每一次发布的匹配结果
    pub fn feed(&self) -> mpsc::UnboundedReceiver<MatchResult> {
        self.results.feed()
    }

    /// 是否有采集线程正在运行
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// 订阅采集权限状态
    pub fn permission(&self) -> watch::Receiver<bool> {
        self.permission.subscribe()
    }

    /// 在独立线程上开始采集
    ///
    /// 没有权限或设备启动失败时只记录日志，返回的句柄处于未运行状态。
    /// 同一时刻只允许一个采集线程，上一个线程退出前再次调用同样返回未运行的句柄。
    pub fn start<S: FrameSource + 'static>(&self, mut source: S) -> CaptureHandle {
        if self.active.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            warn!("采集已在运行");
            return CaptureHandle::idle();
        }
        let active = ActiveGuard(self.active.clone());

        let granted = source.request_access();
        self.permission.publish(granted);
        if !granted {
            warn!("没有采集权限");
            return CaptureHandle::idle();
        }

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("采集循环需要在 tokio 运行时中启动: {}", e);
                return CaptureHandle::idle();
            }
        };

        if let Err(e) = source.start() {
            error!("启动帧源失败: {:#}", e);
            return CaptureHandle::idle();
        }

        let stopped = Arc::new(Mutex::new(false));
        let worker = Worker {
            matcher: self.matcher.clone(),
            preprocessor: self.preprocessor.clone(),
            mode: self.mode,
            throttle: Throttle::new(self.interval),
            viewport: self.viewport.clone(),
            results: self.results.clone(),
            stopped: stopped.clone(),
            runtime,
            _active: active,
        };

        match thread::Builder::new().name("capture".to_string()).spawn(move || worker.run(source)) {
            Ok(thread) => CaptureHandle { stopped, thread: Some(thread) },
            Err(e) => {
                error!("创建采集线程失败: {}", e);
                CaptureHandle::idle()
            }
        }
    }
}

/// 采集线程句柄，丢弃时自动停止
pub struct CaptureHandle {
    stopped: Arc<Mutex<bool>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    fn idle() -> Self {
        Self { stopped: Arc::new(Mutex::new(true)), thread: None }
    }

    /// 采集线程是否已创建
    pub fn is_started(&self) -> bool {
        self.thread.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// 停止采集，返回后不会再有结果被发布
    ///
    /// 正在进行的匹配会继续执行完，但其结果被丢弃。
    pub fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    /// 等待采集线程退出
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("采集线程异常退出");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    matcher: Arc<Matcher>,
    preprocessor: Preprocessor,
    mode: PreprocessMode,
    throttle: Throttle,
    viewport: watch::Receiver<Viewport>,
    results: Publisher<MatchResult>,
    stopped: Arc<Mutex<bool>>,
    runtime: Handle,
    _active: ActiveGuard,
}

impl Worker {
    fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run<S: FrameSource>(mut self, mut source: S) {
        info!("开始采集");
        while !self.is_stopped() {
            let Some(frame) = source.next_frame() else {
                info!("帧源已结束");
                break;
            };
            if self.is_stopped() {
                break;
            }
            if !self.throttle.accept(frame.timestamp) {
                metrics::inc_capture_frame("throttled");
                continue;
            }
            metrics::inc_capture_frame("accepted");

            // 每次都读取最新的取景框
            let viewport = *self.viewport.borrow();
            let image = self.preprocessor.normalize(&frame, &viewport, self.mode);
            drop(frame);

            let result = self.runtime.block_on(self.matcher.search_image(&image));

            let stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
            if *stopped {
                debug!("采集已停止，丢弃本次结果");
                break;
            }
            match result {
                Ok(result) => {
                    if self.results.publish(result) {
                        metrics::inc_capture_frame("published");
                    }
                }
                Err(e) => {
                    warn!("匹配失败: {:#}", e);
                    metrics::inc_capture_frame("failed");
                }
            }
        }
        info!("采集结束");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::{Result, anyhow};
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use image::{Rgb, RgbImage};
    use tokio::sync::{Notify, mpsc};

    use super::*;
    use crate::db::{Catalog, CatalogItem};
    use crate::extractor::{FeatureExtractor, Fingerprint};
    use crate::frame::Frame;
    use crate::geometry::{FitMode, Rect, Size};
    use crate::matcher::MatchParams;

    struct CountingExtractor(AtomicUsize);

    impl FeatureExtractor for CountingExtractor {
        fn model(&self) -> &str {
            "counting"
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn fingerprint(&self, _image: &RgbImage) -> Option<Fingerprint> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Some(Fingerprint::new(vec![1., 0.]))
        }

        fn detect_barcode(&self, _image: &RgbImage) -> Option<String> {
            None
        }
    }

    struct FixedCatalog {
        item: CatalogItem,
        entered: Option<mpsc::UnboundedSender<()>>,
        release: Option<Arc<Notify>>,
    }

    impl Catalog for FixedCatalog {
        fn find_by_barcode<'a>(
            &'a self,
            _barcode: &'a str,
        ) -> BoxFuture<'a, Result<Option<CatalogItem>>> {
            async { Ok(None) }.boxed()
        }

        fn search_text<'a>(
            &'a self,
            _text: &'a str,
            _limit: usize,
        ) -> BoxFuture<'a, Result<Vec<CatalogItem>>> {
            async { Ok(vec![]) }.boxed()
        }

        fn nearest<'a>(
            &'a self,
            _fingerprint: &'a Fingerprint,
            _k: usize,
        ) -> BoxFuture<'a, Result<Vec<(f32, CatalogItem)>>> {
            async move {
                if let Some(entered) = &self.entered {
                    entered.send(()).map_err(|_| anyhow!("closed"))?;
                }
                if let Some(release) = &self.release {
                    release.notified().await;
                }
                Ok(vec![(0., self.item.clone())])
            }
            .boxed()
        }
    }

    struct ScriptedSource {
        access: bool,
        fail: bool,
        frames: VecDeque<Frame>,
    }

    impl ScriptedSource {
        fn every(step_ms: u64, count: u64) -> Self {
            let frames = (0..count)
                .map(|i| {
                    let image = RgbImage::from_pixel(8, 8, Rgb([i as u8, 0, 0]));
                    Frame::new(image, Duration::from_millis(i * step_ms))
                })
                .collect();
            Self { access: true, fail: false, frames }
        }
    }

    impl FrameSource for ScriptedSource {
        fn request_access(&mut self) -> bool {
            self.access
        }

        fn start(&mut self) -> Result<()> {
            if self.fail { Err(anyhow!("device unavailable")) } else { Ok(()) }
        }

        fn next_frame(&mut self) -> Option<Frame> {
            self.frames.pop_front()
        }
    }

    fn item(name: &str) -> CatalogItem {
        CatalogItem {
            id: name.to_string(),
            name: name.to_string(),
            price: 0.,
            location: String::new(),
            image: vec![],
            barcode: None,
            category: None,
            fingerprint: Fingerprint::new(vec![1., 0.]),
        }
    }

    fn capture_loop(extractor: Arc<CountingExtractor>, catalog: FixedCatalog) -> CaptureLoop {
        let (_tx, viewport) =
            watch::channel(Viewport::full(Size::new(8., 8.), FitMode::Fit));
        capture_loop_with(extractor, catalog, viewport)
    }

    fn capture_loop_with(
        extractor: Arc<dyn FeatureExtractor>,
        catalog: FixedCatalog,
        viewport: watch::Receiver<Viewport>,
    ) -> CaptureLoop {
        let matcher = Matcher::new(extractor, Arc::new(catalog), MatchParams::default());
        CaptureLoop::new(Arc::new(matcher), Preprocessor::new(8, 16.), viewport)
    }

    fn gated_catalog() -> (FixedCatalog, mpsc::UnboundedReceiver<()>, Arc<Notify>) {
        let (entered_tx, entered_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let catalog = FixedCatalog {
            item: item("apple"),
            entered: Some(entered_tx),
            release: Some(release.clone()),
        };
        (catalog, entered_rx, release)
    }

    /// 记录每次送入特征提取的画面中心像素的红色分量
    struct CenterRecorder(Mutex<Vec<u8>>);

    impl FeatureExtractor for CenterRecorder {
        fn model(&self) -> &str {
            "center"
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn fingerprint(&self, image: &RgbImage) -> Option<Fingerprint> {
            let center = image.get_pixel(image.width() / 2, image.height() / 2)[0];
            self.0.lock().unwrap().push(center);
            Some(Fingerprint::new(vec![1., 0.]))
        }

        fn detect_barcode(&self, _image: &RgbImage) -> Option<String> {
            None
        }
    }

    #[test]
    fn throttle_skips_first_frame_and_close_frames() {
        let mut throttle = Throttle::new(Duration::from_millis(200));
        let accepted = [0, 100, 200, 250, 400, 450, 600, 799]
            .into_iter()
            .filter(|ms| throttle.accept(Duration::from_millis(*ms)))
            .collect::<Vec<_>>();
        assert_eq!(accepted, [200, 400, 600]);
    }

    #[test]
    fn publisher_suppresses_duplicates() {
        let publisher = Publisher::new(MatchResult::empty());
        let mut rx = publisher.subscribe();
        assert!(!publisher.publish(MatchResult::empty()));
        assert!(!rx.has_changed().unwrap());

        let ab = MatchResult::from(vec![item("a"), item("b")]);
        assert!(publisher.publish(ab.clone()));
        assert!(!publisher.publish(ab.clone()));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ab);

        // 顺序变化也是变化
        assert!(publisher.publish(MatchResult::from(vec![item("b"), item("a")])));
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn feed_receives_every_change_in_order() {
        let publisher = Publisher::new(MatchResult::empty());
        let mut feed = publisher.feed();
        let latest = publisher.subscribe();

        let a = MatchResult::single(item("a"));
        let b = MatchResult::single(item("b"));
        assert!(publisher.publish(a.clone()));
        assert!(!publisher.publish(a.clone()));
        assert!(publisher.publish(b.clone()));
        assert!(publisher.publish(a.clone()));

        assert_eq!(*latest.borrow(), a);
        assert_eq!(feed.try_recv().unwrap(), a);
        assert_eq!(feed.try_recv().unwrap(), b);
        assert_eq!(feed.try_recv().unwrap(), a);
        assert!(feed.try_recv().is_err());

        drop(publisher);
        assert!(matches!(feed.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn only_spaced_frames_are_matched() {
        let extractor = Arc::new(CountingExtractor(AtomicUsize::new(0)));
        let catalog = FixedCatalog { item: item("apple"), entered: None, release: None };
        let capture = capture_loop(extractor.clone(), catalog);
        let mut results = capture.subscribe();
        let permission = capture.permission();

        // 0, 50, ..., 1000ms 共 21 帧
        let handle = capture.start(ScriptedSource::every(50, 21));
        assert!(*permission.borrow());
        tokio::task::spawn_blocking(move || handle.join()).await.unwrap();

        // 200, 400, 600, 800, 1000
        assert_eq!(extractor.0.load(Ordering::SeqCst), 5);
        assert!(results.has_changed().unwrap());
        assert_eq!(*results.borrow_and_update(), MatchResult::single(item("apple")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_frame_never_matches() {
        let extractor = Arc::new(CountingExtractor(AtomicUsize::new(0)));
        let catalog = FixedCatalog { item: item("apple"), entered: None, release: None };
        let capture = capture_loop(extractor.clone(), catalog);
        let results = capture.subscribe();

        let handle = capture.start(ScriptedSource::every(500, 1));
        tokio::task::spawn_blocking(move || handle.join()).await.unwrap();

        assert_eq!(extractor.0.load(Ordering::SeqCst), 0);
        assert!(!results.has_changed().unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn denied_access_is_reported() {
        let extractor = Arc::new(CountingExtractor(AtomicUsize::new(0)));
        let catalog = FixedCatalog { item: item("apple"), entered: None, release: None };
        let capture = capture_loop(extractor.clone(), catalog);
        let permission = capture.permission();

        let mut source = ScriptedSource::every(500, 3);
        source.access = false;
        let handle = capture.start(source);

        assert!(!handle.is_running());
        assert!(!*permission.borrow());
        assert_eq!(extractor.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn device_failure_does_not_start() {
        let extractor = Arc::new(CountingExtractor(AtomicUsize::new(0)));
        let catalog = FixedCatalog { item: item("apple"), entered: None, release: None };
        let capture = capture_loop(extractor.clone(), catalog);

        let mut source = ScriptedSource::every(500, 3);
        source.fail = true;
        let handle = capture.start(source);

        assert!(!handle.is_running());
        assert!(*capture.permission().borrow());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_discards_in_flight_result() {
        let extractor = Arc::new(CountingExtractor(AtomicUsize::new(0)));
        let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let catalog = FixedCatalog {
            item: item("apple"),
            entered: Some(entered_tx),
            release: Some(release.clone()),
        };
        let capture = capture_loop(extractor.clone(), catalog);
        let results = capture.subscribe();

        let handle = capture.start(ScriptedSource::every(300, 5));
        entered_rx.recv().await.unwrap();
        handle.stop();
        release.notify_one();
        tokio::task::spawn_blocking(move || handle.join()).await.unwrap();

        assert_eq!(extractor.0.load(Ordering::SeqCst), 1);
        assert!(!results.has_changed().unwrap());
        assert!(results.borrow().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_start_is_refused_while_running() {
        let extractor = Arc::new(CountingExtractor(AtomicUsize::new(0)));
        let (catalog, mut entered, release) = gated_catalog();
        let capture = capture_loop(extractor.clone(), catalog);

        let first = capture.start(ScriptedSource::every(300, 2));
        assert!(first.is_started());
        entered.recv().await.unwrap();
        assert!(capture.is_active());

        let second = capture.start(ScriptedSource::every(300, 5));
        assert!(!second.is_started());
        drop(second);

        release.notify_one();
        tokio::task::spawn_blocking(move || first.join()).await.unwrap();
        assert!(!capture.is_active());
        assert_eq!(extractor.0.load(Ordering::SeqCst), 1);

        // 上一个线程退出后可以重新开始
        let third = capture.start(ScriptedSource::every(500, 1));
        assert!(third.is_started());
        tokio::task::spawn_blocking(move || third.join()).await.unwrap();
        assert!(!capture.is_active());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn latest_viewport_is_used_for_each_frame() {
        let recorder = Arc::new(CenterRecorder(Mutex::new(vec![])));
        let (catalog, mut entered, release) = gated_catalog();
        let size = Size::new(16., 16.);
        let left = Viewport { size, roi: Rect::new(0., 0., 8., 16.), fit: FitMode::Fit };
        let right = Viewport { size, roi: Rect::new(8., 0., 8., 16.), fit: FitMode::Fit };
        let (viewport_tx, viewport_rx) = watch::channel(left);
        let capture = capture_loop_with(recorder.clone(), catalog, viewport_rx);

        // 左半边暗、右半边亮
        let frames = (0..3u64)
            .map(|i| {
                let image = RgbImage::from_fn(16, 16, |x, _| {
                    if x < 8 { Rgb([10, 0, 0]) } else { Rgb([200, 0, 0]) }
                });
                Frame::new(image, Duration::from_millis(i * 300))
            })
            .collect();
        let source = ScriptedSource { access: true, fail: false, frames };
        let handle = capture.start(source);

        // 第一帧匹配进行中时移动感兴趣区域
        entered.recv().await.unwrap();
        viewport_tx.send(right).unwrap();
        release.notify_one();
        entered.recv().await.unwrap();
        release.notify_one();
        tokio::task::spawn_blocking(move || handle.join()).await.unwrap();

        let centers = recorder.0.lock().unwrap().clone();
        assert_eq!(centers.len(), 2);
        assert!(centers[0] < 50, "first frame should use the left half: {centers:?}");
        assert!(centers[1] > 150, "second frame should use the right half: {centers:?}");
    }
}
