// src/tracking.rs - Pose acquisition loop: detect, store, draw, classify, repeat
use std::sync::Arc;
use std::time::Duration;

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::{ClassificationBridge, ClassificationResult};
use crate::detector::{DetectorConfig, DetectorFactory, PoseDetector};
use crate::keypoints::{self, KeypointStore, ACCEPTANCE_THRESHOLD};
use crate::render::{FrameRenderer, RenderStyle, Surface};
use crate::video::FrameReceiver;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Pause between successful cycles. Keeps detector load well below frame rate.
    pub poll_interval_ms: u64,
    pub acceptance_threshold: f32,
    /// Consecutive empty estimates tolerated before the detector is rebuilt.
    pub gap_tolerance: u32,
    /// Delay before retrying a failed detector construction. `None` gives up.
    pub construction_retry_ms: Option<u64>,
    pub style: RenderStyle,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 800,
            acceptance_threshold: ACCEPTANCE_THRESHOLD,
            gap_tolerance: 0,
            construction_retry_ms: Some(3000),
            style: RenderStyle::default(),
        }
    }
}

impl TrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn construction_retry(&self) -> Option<Duration> {
        self.construction_retry_ms.map(|ms| Duration::from_millis(ms.max(1)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Uninitialized,
    DetectorReady,
    Polling,
    /// The last estimate came back empty; the detector is rebuilt on the next step.
    RecoverableGap,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerStatus {
    LoadingDetector,
    Tracking,
    Recovering { consecutive_gaps: u32 },
    DetectorFailed { message: String },
    Stopped,
}

/// What the view shows: the overlay raster plus the latest classification and status.
#[derive(Debug, Clone)]
pub struct OverlayFrame {
    pub cycle: u64,
    pub image: Arc<RgbaImage>,
    pub classification: Option<Arc<ClassificationResult>>,
    pub status: TrackerStatus,
}

impl OverlayFrame {
    pub fn loading(width: u32, height: u32) -> Self {
        Self {
            cycle: 0,
            image: Arc::new(RgbaImage::new(width, height)),
            classification: None,
            status: TrackerStatus::LoadingDetector,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    DetectorReady,
    ConstructionFailed,
    /// No video frame has arrived yet.
    NoFrame,
    Rendered { points: usize, bones: usize },
    Gap { consecutive: u32, rebuild: bool },
}

pub struct PoseTracker<S: Surface> {
    config: TrackerConfig,
    detector_config: DetectorConfig,
    factory: Arc<dyn DetectorFactory>,
    detector: Option<Box<dyn PoseDetector>>,
    state: LoopState,
    frames: FrameReceiver,
    store: KeypointStore,
    renderer: FrameRenderer,
    surface: S,
    bridge: ClassificationBridge,
    overlay_tx: watch::Sender<OverlayFrame>,
    cycle: u64,
    consecutive_gaps: u32,
    rebuilds: u32,
}

impl<S: Surface + Send> PoseTracker<S> {
    pub fn new(
        config: TrackerConfig,
        detector_config: DetectorConfig,
        factory: Arc<dyn DetectorFactory>,
        frames: FrameReceiver,
        surface: S,
        bridge: ClassificationBridge,
    ) -> (Self, watch::Receiver<OverlayFrame>) {
        let (overlay_tx, overlay_rx) = watch::channel(OverlayFrame::loading(surface.width(), surface.height()));
        let tracker = Self {
            store: KeypointStore::with_threshold(config.acceptance_threshold),
            renderer: FrameRenderer::new(config.style.clone()),
            config,
            detector_config,
            factory,
            detector: None,
            state: LoopState::Uninitialized,
            frames,
            surface,
            bridge,
            overlay_tx,
            cycle: 0,
            consecutive_gaps: 0,
            rebuilds: 0,
        };
        (tracker, overlay_rx)
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn store(&self) -> &KeypointStore {
        &self.store
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn rebuilds(&self) -> u32 {
        self.rebuilds
    }

    /// Runs cycles until `cancel` fires. Every suspension point races the
    /// token, so nothing is drawn or published for a cycle that was cut short.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(interval_ms = self.config.poll_interval().as_millis() as u64, "pose tracking started");

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = self.step() => outcome,
            };

            let delay = match self.delay_after(&outcome) {
                Some(delay) => delay,
                None => {
                    warn!("detector unavailable and retry disabled, tracking halted");
                    cancel.cancelled().await;
                    break;
                }
            };
            if delay.is_zero() {
                continue;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.detector = None;
        self.publish(TrackerStatus::Stopped);
        info!(cycles = self.cycle, rebuilds = self.rebuilds, "pose tracking stopped");
    }

    fn delay_after(&self, outcome: &CycleOutcome) -> Option<Duration> {
        match outcome {
            CycleOutcome::DetectorReady => Some(Duration::ZERO),
            CycleOutcome::ConstructionFailed => self.config.construction_retry(),
            // Gaps wait a full interval too, so an empty scene is polled at the same rate.
            CycleOutcome::NoFrame | CycleOutcome::Rendered { .. } | CycleOutcome::Gap { .. } => {
                Some(self.config.poll_interval())
            }
        }
    }

    /// Advances the state machine by one transition.
    pub async fn step(&mut self) -> CycleOutcome {
        match self.state {
            LoopState::Uninitialized => self.construct().await,
            LoopState::RecoverableGap => {
                self.detector = None;
                self.rebuilds += 1;
                info!(rebuild = self.rebuilds, "rebuilding pose detector after empty estimate");
                self.construct().await
            }
            LoopState::DetectorReady | LoopState::Polling => self.poll().await,
        }
    }

    async fn construct(&mut self) -> CycleOutcome {
        if self.cycle == 0 {
            self.publish(TrackerStatus::LoadingDetector);
        }
        match self.factory.create(&self.detector_config).await {
            Ok(detector) => {
                info!("pose detector ready");
                self.detector = Some(detector);
                self.state = LoopState::DetectorReady;
                self.bridge.start_loading();
                CycleOutcome::DetectorReady
            }
            Err(e) => {
                error!("{}", e);
                self.state = LoopState::Uninitialized;
                self.store.clear();
                self.surface.clear();
                self.publish(TrackerStatus::DetectorFailed { message: e.to_string() });
                CycleOutcome::ConstructionFailed
            }
        }
    }

    async fn poll(&mut self) -> CycleOutcome {
        let Some(frame) = self.frames.borrow().clone() else {
            debug!("no video frame yet");
            return CycleOutcome::NoFrame;
        };
        let Some(detector) = self.detector.as_mut() else {
            self.state = LoopState::Uninitialized;
            return CycleOutcome::ConstructionFailed;
        };
        self.state = LoopState::Polling;

        let keypoints = match detector.estimate_poses(&frame).await {
            // Only the first pose is used.
            Ok(poses) => poses.into_iter().next().map(|p| p.keypoints).filter(|k| !k.is_empty()),
            Err(e) => {
                warn!(frame = frame.sequence, "{}", e);
                None
            }
        };
        let Some(keypoints) = keypoints else {
            return self.gap();
        };

        self.cycle += 1;
        self.consecutive_gaps = 0;
        self.store.update(&keypoints);
        self.surface.clear();
        let points = self
            .renderer
            .draw_points(&keypoints, self.store.threshold(), &mut self.surface);
        let bones = self.renderer.draw_skeleton(&self.store, &mut self.surface);
        debug!(cycle = self.cycle, frame = frame.sequence, points, bones, "overlay drawn");

        // The classifier sees every raw keypoint regardless of confidence.
        match keypoints::feature_vector(&keypoints) {
            Some(features) => self.bridge.on_frame(&features).await,
            None => debug!(count = keypoints.len(), "incomplete pose, classification skipped"),
        }

        self.publish(TrackerStatus::Tracking);
        CycleOutcome::Rendered { points, bones }
    }

    fn gap(&mut self) -> CycleOutcome {
        self.consecutive_gaps += 1;
        let rebuild = self.consecutive_gaps > self.config.gap_tolerance;
        if rebuild {
            self.state = LoopState::RecoverableGap;
        }
        debug!(consecutive = self.consecutive_gaps, rebuild, "no pose detected");

        self.store.clear();
        self.surface.clear();
        self.publish(TrackerStatus::Recovering {
            consecutive_gaps: self.consecutive_gaps,
        });
        CycleOutcome::Gap {
            consecutive: self.consecutive_gaps,
            rebuild,
        }
    }

    fn publish(&self, status: TrackerStatus) {
        self.overlay_tx.send_replace(OverlayFrame {
            cycle: self.cycle,
            image: Arc::new(self.surface.snapshot()),
            classification: self.bridge.latest(),
            status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::tests::{any_source, label, ScriptedClassifier, ScriptedLoader};
    use crate::classifier::ClassifierOptions;
    use crate::error::DetectorError;
    use crate::keypoints::tests::pose_with;
    use crate::keypoints::{Joint, Keypoint, Pose, FEATURE_LEN};
    use crate::render::tests::RecordingSurface;
    use crate::video::VideoFrame;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Step {
        Poses(Vec<Pose>),
        Fail,
        Hang,
    }

    type Script = Arc<Mutex<VecDeque<Step>>>;

    struct ScriptedDetector {
        instance: usize,
        script: Script,
        served: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl PoseDetector for ScriptedDetector {
        async fn estimate_poses(&mut self, _frame: &VideoFrame) -> Result<Vec<Pose>, DetectorError> {
            self.served.lock().unwrap().push(self.instance);
            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Step::Poses(poses)) => Ok(poses),
                Some(Step::Fail) => Err(DetectorError::Estimation("backend error".to_string())),
                Some(Step::Hang) => std::future::pending().await,
                None => Ok(vec![full_pose()]),
            }
        }
    }

    struct ScriptedFactory {
        script: Script,
        creates: AtomicUsize,
        failures_left: AtomicUsize,
        served: Arc<Mutex<Vec<usize>>>,
    }

    impl ScriptedFactory {
        fn new(steps: Vec<Step>, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                script: Arc::new(Mutex::new(steps.into())),
                creates: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(failures),
                served: Arc::new(Mutex::new(Vec::new())),
            })
        }
    }

    #[async_trait]
    impl DetectorFactory for ScriptedFactory {
        async fn create(&self, _config: &DetectorConfig) -> Result<Box<dyn PoseDetector>, DetectorError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DetectorError::Construction("model download failed".to_string()));
            }
            let instance = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Box::new(ScriptedDetector {
                instance,
                script: self.script.clone(),
                served: self.served.clone(),
            }))
        }
    }

    fn full_pose() -> Pose {
        Pose {
            keypoints: pose_with(|_| 0.9),
            score: Some(0.9),
            id: None,
        }
    }

    fn shoulders_pose() -> Pose {
        let mut keypoints = pose_with(|_| 0.0);
        keypoints[5] = Keypoint::new("left_shoulder", 100.0, 200.0, 0.9);
        keypoints[6] = Keypoint::new("right_shoulder", 300.0, 200.0, 0.9);
        Pose {
            keypoints,
            score: Some(0.5),
            id: None,
        }
    }

    fn frames() -> (watch::Sender<Option<Arc<VideoFrame>>>, FrameReceiver) {
        watch::channel(Some(Arc::new(VideoFrame::blank(1, 1280, 720))))
    }

    fn tracker(
        factory: Arc<ScriptedFactory>,
        config: TrackerConfig,
        bridge: ClassificationBridge,
    ) -> (PoseTracker<RecordingSurface>, watch::Receiver<OverlayFrame>, watch::Sender<Option<Arc<VideoFrame>>>) {
        let (frame_tx, frame_rx) = frames();
        let (tracker, overlay) = PoseTracker::new(
            config,
            DetectorConfig::default(),
            factory,
            frame_rx,
            RecordingSurface::new(1280, 720),
            bridge,
        );
        (tracker, overlay, frame_tx)
    }

    #[tokio::test]
    async fn successful_cycle_draws_and_publishes() {
        let factory = ScriptedFactory::new(vec![Step::Poses(vec![shoulders_pose(), full_pose()])], 0);
        let (mut tracker, overlay, _frames) = tracker(factory, TrackerConfig::default(), ClassificationBridge::disabled());

        assert_eq!(tracker.step().await, CycleOutcome::DetectorReady);
        assert_eq!(tracker.state(), LoopState::DetectorReady);
        assert_eq!(overlay.borrow().status, TrackerStatus::LoadingDetector);

        // Second pose in the list is ignored.
        assert_eq!(tracker.step().await, CycleOutcome::Rendered { points: 2, bones: 1 });
        assert_eq!(tracker.state(), LoopState::Polling);
        assert_eq!(tracker.store().visible().count(), 2);
        assert_eq!(tracker.store().get(Joint::LeftShoulder).map(|p| p.x), Some(100.0));
        assert_eq!(tracker.surface().clears, 1);
        assert_eq!(tracker.surface().lines().len(), 1);

        let published = overlay.borrow().clone();
        assert_eq!(published.cycle, 1);
        assert_eq!(published.status, TrackerStatus::Tracking);
    }

    #[tokio::test]
    async fn surface_is_cleared_before_each_redraw() {
        let factory = ScriptedFactory::new(vec![], 0);
        let (mut tracker, _overlay, _frames) =
            tracker(factory, TrackerConfig::default(), ClassificationBridge::disabled());
        tracker.step().await;
        for expected in 1..=3 {
            assert!(matches!(tracker.step().await, CycleOutcome::Rendered { bones: 12, .. }));
            assert_eq!(tracker.surface().clears, expected);
            assert_eq!(tracker.surface().lines().len(), 12);
            assert_eq!(tracker.surface().circles(), 17);
        }
    }

    #[tokio::test]
    async fn empty_estimate_rebuilds_detector_once() {
        let factory = ScriptedFactory::new(vec![Step::Poses(vec![])], 0);
        let (mut tracker, overlay, _frames) =
            tracker(factory.clone(), TrackerConfig::default(), ClassificationBridge::disabled());

        tracker.step().await;
        assert_eq!(
            tracker.step().await,
            CycleOutcome::Gap {
                consecutive: 1,
                rebuild: true
            }
        );
        assert_eq!(tracker.state(), LoopState::RecoverableGap);
        assert_eq!(overlay.borrow().status, TrackerStatus::Recovering { consecutive_gaps: 1 });

        assert_eq!(tracker.step().await, CycleOutcome::DetectorReady);
        assert_eq!(factory.creates.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.rebuilds(), 1);

        assert!(matches!(tracker.step().await, CycleOutcome::Rendered { .. }));
        assert_eq!(factory.creates.load(Ordering::SeqCst), 2);
        assert_eq!(*factory.served.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn pose_without_keypoints_and_errors_count_as_gaps() {
        let factory = ScriptedFactory::new(vec![Step::Poses(vec![Pose::default()]), Step::Fail], 0);
        let config = TrackerConfig {
            gap_tolerance: 1,
            ..TrackerConfig::default()
        };
        let (mut tracker, _overlay, _frames) = tracker(factory.clone(), config, ClassificationBridge::disabled());

        tracker.step().await;
        assert_eq!(
            tracker.step().await,
            CycleOutcome::Gap {
                consecutive: 1,
                rebuild: false
            }
        );
        assert_eq!(tracker.state(), LoopState::Polling);
        assert_eq!(
            tracker.step().await,
            CycleOutcome::Gap {
                consecutive: 2,
                rebuild: true
            }
        );
        assert_eq!(factory.creates.load(Ordering::SeqCst), 1);
        tracker.step().await;
        assert_eq!(factory.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn construction_failure_stays_uninitialized() {
        let factory = ScriptedFactory::new(vec![], 1);
        let (mut tracker, overlay, _frames) =
            tracker(factory.clone(), TrackerConfig::default(), ClassificationBridge::disabled());

        assert_eq!(tracker.step().await, CycleOutcome::ConstructionFailed);
        assert_eq!(tracker.state(), LoopState::Uninitialized);
        assert!(matches!(overlay.borrow().status, TrackerStatus::DetectorFailed { .. }));

        assert_eq!(tracker.step().await, CycleOutcome::DetectorReady);
        assert_eq!(factory.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waits_for_first_video_frame() {
        let factory = ScriptedFactory::new(vec![], 0);
        let (frame_tx, frame_rx) = watch::channel(None);
        let (mut tracker, _overlay) = PoseTracker::new(
            TrackerConfig::default(),
            DetectorConfig::default(),
            factory,
            frame_rx,
            RecordingSurface::new(1280, 720),
            ClassificationBridge::disabled(),
        );
        tracker.step().await;
        assert_eq!(tracker.step().await, CycleOutcome::NoFrame);
        frame_tx.send_replace(Some(Arc::new(VideoFrame::blank(1, 1280, 720))));
        assert!(matches!(tracker.step().await, CycleOutcome::Rendered { .. }));
    }

    #[tokio::test]
    async fn classifier_gets_raw_features_and_loads_once() {
        let classifier = Arc::new(ScriptedClassifier::new(vec![Ok(vec![label("t_pose", 0.7), label("idle", 0.3)])]));
        let loader = Arc::new(ScriptedLoader::new(classifier.clone()));
        let bridge = ClassificationBridge::new(loader.clone(), ClassifierOptions::default(), any_source());
        let factory = ScriptedFactory::new(vec![Step::Poses(vec![shoulders_pose()]), Step::Poses(vec![])], 0);
        let (mut tracker, overlay, _frames) = tracker(factory, TrackerConfig::default(), bridge);

        tracker.step().await;
        // Let the background load finish.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tracker.step().await;
        tracker.step().await; // gap
        tracker.step().await; // rebuild
        tracker.step().await;

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        let inputs = classifier.inputs.lock().unwrap().clone();
        assert_eq!(inputs.len(), 2);
        let expected: Vec<f32> = shoulders_pose().keypoints.iter().flat_map(|k| [k.x, k.y]).collect();
        assert_eq!(inputs[0].len(), FEATURE_LEN);
        assert_eq!(inputs[0], expected);

        let published = overlay.borrow().clone();
        assert_eq!(published.classification.unwrap().top().unwrap().label, "t_pose");
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel_and_reports_stopped() {
        let factory = ScriptedFactory::new(vec![], 0);
        let (tracker, mut overlay, _frames) =
            tracker(factory.clone(), TrackerConfig::default(), ClassificationBridge::disabled());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(tracker.run(cancel.clone()));

        while overlay.borrow().cycle < 3 {
            overlay.changed().await.unwrap();
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(overlay.borrow().status, TrackerStatus::Stopped);
        assert_eq!(factory.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_in_flight_estimate() {
        let factory = ScriptedFactory::new(vec![Step::Hang], 0);
        let (tracker, mut overlay, _frames) =
            tracker(factory.clone(), TrackerConfig::default(), ClassificationBridge::disabled());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(tracker.run(cancel.clone()));

        while factory.served.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        handle.await.unwrap();

        let last = overlay.borrow_and_update().clone();
        assert_eq!(last.status, TrackerStatus::Stopped);
        assert_eq!(last.cycle, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_retry_parks_until_cancelled() {
        let factory = ScriptedFactory::new(vec![], usize::MAX);
        let config = TrackerConfig {
            construction_retry_ms: None,
            ..TrackerConfig::default()
        };
        let (tracker, overlay, _frames) = tracker(factory.clone(), config, ClassificationBridge::disabled());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(tracker.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(matches!(overlay.borrow().status, TrackerStatus::DetectorFailed { .. }));
        assert_eq!(factory.failures_left.load(Ordering::SeqCst), usize::MAX - 1);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(overlay.borrow().status, TrackerStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_scene_is_polled_once_per_interval() {
        let steps = (0..100).map(|_| Step::Poses(vec![])).collect();
        let factory = ScriptedFactory::new(steps, 0);
        let (tracker, _overlay, _frames) =
            tracker(factory.clone(), TrackerConfig::default(), ClassificationBridge::disabled());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(tracker.run(cancel.clone()));

        // Polls at 0, 800, 1600, 2400 and 3200 ms.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        handle.await.unwrap();

        let estimates = factory.served.lock().unwrap().len();
        assert_eq!(estimates, 5);
        assert_eq!(factory.creates.load(Ordering::SeqCst), estimates);
    }
}
