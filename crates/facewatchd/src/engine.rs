//! Frame pipeline and motion monitor threads.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::thread;

use facewatch_core::embedding::normalize_in_place;
use facewatch_core::{jpeg, DimensionMismatch, FaceCache, FaceDetector, Matcher, Person};
use facewatch_stream::{FrameReader, MotionAnalyzer, MotionConfig};
use image::RgbImage;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::gateway::SharedClassifier;
use crate::notify::Dispatcher;

/// Dumped faces are numbered modulo this.
const DUMP_WRAP: u32 = 10_000;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("roster does not match the classifier: {0}")]
    Dimension(#[from] DimensionMismatch),
    #[error("failed to start {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
    #[error("cannot prepare face output directory {path}: {source}")]
    OutputDir {
        path: String,
        source: std::io::Error,
    },
}

/// What happened to one frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub detected: usize,
    pub cached: usize,
    pub matched: usize,
}

/// Writes every classified face to a directory as `face#####.jpg` plus its
/// embedding as `face#####.json`.
pub struct FaceDump {
    dir: PathBuf,
    next: u32,
    quality: u8,
}

impl FaceDump {
    pub fn create(dir: PathBuf, quality: u8) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&dir).map_err(|source| EngineError::OutputDir {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self {
            dir,
            next: 0,
            quality,
        })
    }

    fn write(&mut self, face: &RgbImage, embedding: &[f32]) {
        let stem = format!("face{:05}", self.next);
        self.next = (self.next + 1) % DUMP_WRAP;

        let image = self.dir.join(format!("{stem}.jpg"));
        match jpeg::encode(face, self.quality) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&image, bytes) {
                    tracing::warn!(path = %image.display(), error = %e, "failed to write face image");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode face for output"),
        }

        let json = self.dir.join(format!("{stem}.json"));
        match serde_json::to_vec(embedding) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&json, bytes) {
                    tracing::warn!(path = %json.display(), error = %e, "failed to write embedding");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize embedding"),
        }
    }
}

/// Detect, classify, cache and match faces frame by frame.
pub struct Pipeline {
    detector: Box<dyn FaceDetector>,
    classifier: SharedClassifier,
    cache: Arc<FaceCache>,
    dispatcher: Dispatcher,
    roster: Arc<Vec<Person>>,
    matcher: Box<dyn Matcher + Send>,
    padding: f32,
    normalize: bool,
    dump: Option<FaceDump>,
}

impl Pipeline {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        classifier: SharedClassifier,
        cache: Arc<FaceCache>,
        dispatcher: Dispatcher,
        matcher: Box<dyn Matcher + Send>,
    ) -> Self {
        Self {
            detector,
            classifier,
            cache,
            dispatcher,
            roster: Arc::new(Vec::new()),
            matcher,
            padding: 1.0,
            normalize: false,
            dump: None,
        }
    }

    pub fn with_roster(mut self, roster: Arc<Vec<Person>>) -> Self {
        self.roster = roster;
        self
    }

    /// Scale factor applied to every detection before cropping.
    pub fn with_padding(mut self, factor: f32) -> Self {
        self.padding = factor;
        self
    }

    pub fn with_normalized_embeddings(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn with_face_dump(mut self, dump: FaceDump) -> Self {
        self.dump = Some(dump);
        self
    }

    /// Publish `frame` as the current frame and run it through the
    /// pipeline. Only a roster/embedding size disagreement is an error.
    pub fn process_frame(&mut self, frame: RgbImage) -> Result<FrameStats, EngineError> {
        let mut stats = FrameStats::default();
        self.cache.set_frame(frame.clone());

        let detections = match self.detector.detect(&frame) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed, skipping frame");
                return Ok(stats);
            }
        };
        stats.detected = detections.len();

        for detection in &detections {
            let region = detection.region().padded(self.padding);
            let Some(face) = region.crop(&frame) else {
                tracing::trace!(?region, "padded face leaves the frame, skipping");
                continue;
            };

            let classified = self
                .classifier
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .classify(&face);
            let mut embedding = match classified {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "face classification failed");
                    continue;
                }
            };
            if self.normalize && !normalize_in_place(&mut embedding) {
                tracing::debug!("zero embedding left unnormalized");
            }

            if let Err(e) = self.cache.add_face(&face, embedding.clone()) {
                tracing::warn!(error = %e, "failed to cache face");
            } else {
                stats.cached += 1;
            }
            if let Some(dump) = self.dump.as_mut() {
                dump.write(&face, &embedding);
            }

            for hit in self.matcher.matches(&embedding, &self.roster)? {
                tracing::info!(
                    name = %hit.person.name,
                    distance = hit.distance,
                    confidence = detection.confidence,
                    "face matched"
                );
                self.dispatcher.notify_match(&hit.person.name, &face);
                stats.matched += 1;
            }
        }

        Ok(stats)
    }

    /// Process frames until the stream ends. A malformed or failing stream
    /// ends the loop like a clean end of stream does.
    pub fn run<R: Read>(&mut self, mut frames: FrameReader<R>) -> Result<u64, EngineError> {
        tracing::info!(roster = self.roster.len(), padding = self.padding, "frame pipeline started");
        loop {
            match frames.read_frame() {
                Ok(Some(frame)) => {
                    let stats = self.process_frame(frame)?;
                    if stats.detected > 0 {
                        tracing::debug!(
                            detected = stats.detected,
                            cached = stats.cached,
                            matched = stats.matched,
                            "frame processed"
                        );
                    }
                }
                Ok(None) => {
                    tracing::info!(frames = frames.frames_read(), "video stream ended");
                    break;
                }
                Err(e) => {
                    tracing::warn!(frames = frames.frames_read(), error = %e, "video stream failed");
                    break;
                }
            }
        }
        Ok(frames.frames_read())
    }
}

/// Run the pipeline on its own thread; the receiver resolves when the
/// video stream ends or the pipeline fails.
pub fn spawn_pipeline<R: Read + Send + 'static>(
    mut pipeline: Pipeline,
    frames: FrameReader<R>,
) -> Result<oneshot::Receiver<Result<u64, EngineError>>, EngineError> {
    let (tx, rx) = oneshot::channel();
    thread::Builder::new()
        .name("facewatch-pipeline".into())
        .spawn(move || {
            let _ = tx.send(pipeline.run(frames));
        })
        .map_err(|source| EngineError::Spawn {
            name: "pipeline",
            source,
        })?;
    Ok(rx)
}

/// Watch the motion-vector stream at `path` on its own thread. The stream is
/// opened on that thread because opening a FIFO blocks until a writer
/// appears. The thread ends with the stream.
pub fn spawn_motion_monitor(
    path: PathBuf,
    config: MotionConfig,
    dispatcher: Dispatcher,
) -> Result<thread::JoinHandle<()>, EngineError> {
    thread::Builder::new()
        .name("facewatch-motion".into())
        .spawn(move || {
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "cannot open motion stream");
                    return;
                }
            };
            let mut analyzer = MotionAnalyzer::new(config);
            analyzer.run(BufReader::new(file), |event| {
                dispatcher.notify_motion(event.active);
            });
        })
        .map_err(|source| EngineError::Spawn {
            name: "motion",
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{self, Notification};
    use facewatch_core::{
        BoundingBox, ClassifierError, DetectorError, EuclideanMatcher, FaceClassifier,
        NoopClusterSink,
    };
    use facewatch_stream::MotionVector;
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FixedDetector(Vec<BoundingBox>);

    impl FaceDetector for FixedDetector {
        fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    struct BlindDetector;

    impl FaceDetector for BlindDetector {
        fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Err(DetectorError::InferenceFailed("no session".into()))
        }
    }

    /// Embeds a face as its width and height.
    struct SizeClassifier;

    impl FaceClassifier for SizeClassifier {
        fn classify(&mut self, face: &RgbImage) -> Result<Vec<f32>, ClassifierError> {
            Ok(vec![face.width() as f32, face.height() as f32])
        }
    }

    struct BrokenClassifier;

    impl FaceClassifier for BrokenClassifier {
        fn classify(&mut self, _face: &RgbImage) -> Result<Vec<f32>, ClassifierError> {
            Err(ClassifierError::InferenceFailed("no session".into()))
        }
    }

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9 }
    }

    fn person(name: &str, embedding: &[f32]) -> Person {
        Person { name: name.into(), embedding: embedding.to_vec() }
    }

    fn frame() -> RgbImage {
        RgbImage::from_pixel(64, 48, image::Rgb([40, 80, 120]))
    }

    fn pipeline(
        detector: impl FaceDetector + 'static,
        classifier: impl FaceClassifier + 'static,
    ) -> (Pipeline, Arc<FaceCache>, tokio::sync::mpsc::Receiver<Notification>) {
        let cache = Arc::new(FaceCache::new(8, 75, Box::new(NoopClusterSink)));
        let (dispatcher, rx) = notify::channel(8);
        let pipeline = Pipeline::new(
            Box::new(detector),
            Arc::new(Mutex::new(classifier)),
            Arc::clone(&cache),
            dispatcher,
            Box::new(EuclideanMatcher { threshold: 2.5 }),
        );
        (pipeline, cache, rx)
    }

    #[test]
    fn test_face_is_padded_cached_and_matched() {
        let (pipeline, cache, mut rx) =
            pipeline(FixedDetector(vec![bbox(10.0, 10.0, 20.0, 16.0)]), SizeClassifier);
        let roster = vec![person("near", &[30.0, 24.0]), person("far", &[10.0, 10.0])];
        let mut pipeline = pipeline.with_padding(1.5).with_roster(Arc::new(roster));

        let stats = pipeline.process_frame(frame()).unwrap();
        assert_eq!(stats, FrameStats { detected: 1, cached: 1, matched: 1 });

        // 20x16 grown by 1.5 is 30x24
        let faces = cache.list_faces();
        assert_eq!(faces.len(), 1);
        assert_eq!((faces[0].width, faces[0].height), (30, 24));
        assert_eq!(faces[0].embedding, vec![30.0, 24.0]);
        assert!(cache.current_frame_jpeg().is_ok());

        match rx.try_recv().unwrap() {
            Notification::Match { name, jpeg, .. } => {
                assert_eq!(name, "near");
                assert_eq!(jpeg::decode(&jpeg).unwrap().dimensions(), (30, 24));
            }
            other => panic!("unexpected notification {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_face_leaving_frame_after_padding_is_skipped() {
        let (pipeline, cache, _rx) =
            pipeline(FixedDetector(vec![bbox(0.0, 0.0, 20.0, 20.0)]), SizeClassifier);
        let mut pipeline = pipeline.with_padding(1.5);
        let stats = pipeline.process_frame(frame()).unwrap();
        assert_eq!(stats.detected, 1);
        assert_eq!(stats.cached, 0);
        assert!(cache.is_empty());
        assert!(cache.current_frame_jpeg().is_ok());
    }

    #[test]
    fn test_out_of_range_detection_is_skipped() {
        let (pipeline, cache, _rx) = pipeline(
            FixedDetector(vec![bbox(-1e12, 0.0, 2e12, 10.0), bbox(10.0, 10.0, 8.0, 8.0)]),
            SizeClassifier,
        );
        let mut pipeline = pipeline.with_padding(1.5);
        let stats = pipeline.process_frame(frame()).unwrap();
        assert_eq!(stats, FrameStats { detected: 2, cached: 1, matched: 0 });
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_roster_size_mismatch_is_fatal() {
        let (pipeline, _cache, _rx) =
            pipeline(FixedDetector(vec![bbox(10.0, 10.0, 8.0, 8.0)]), SizeClassifier);
        let mut pipeline = pipeline.with_roster(Arc::new(vec![person("odd", &[1.0, 2.0, 3.0])]));
        assert!(matches!(
            pipeline.process_frame(frame()),
            Err(EngineError::Dimension(DimensionMismatch { left: 2, right: 3 }))
        ));
    }

    #[test]
    fn test_embeddings_normalized_when_configured() {
        let (pipeline, cache, _rx) =
            pipeline(FixedDetector(vec![bbox(0.0, 0.0, 30.0, 40.0)]), SizeClassifier);
        let mut pipeline = pipeline.with_normalized_embeddings(true);
        pipeline.process_frame(frame()).unwrap();
        let embedding = &cache.list_faces()[0].embedding;
        assert!((embedding[0] - 0.6).abs() < 1e-6);
        assert!((embedding[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_detector_failure_skips_frame() {
        let (mut pipeline, cache, _rx) = pipeline(BlindDetector, SizeClassifier);
        assert_eq!(pipeline.process_frame(frame()).unwrap(), FrameStats::default());
        assert!(cache.is_empty());
        assert!(cache.current_frame_jpeg().is_ok());
    }

    #[test]
    fn test_classifier_failure_skips_face() {
        let (mut pipeline, cache, _rx) =
            pipeline(FixedDetector(vec![bbox(5.0, 5.0, 10.0, 10.0)]), BrokenClassifier);
        let stats = pipeline.process_frame(frame()).unwrap();
        assert_eq!(stats, FrameStats { detected: 1, cached: 0, matched: 0 });
        assert!(cache.is_empty());
    }

    #[test]
    fn test_face_dump_writes_image_and_embedding() {
        let dir = std::env::temp_dir().join(format!("facewatch-dump-{}", std::process::id()));
        let (pipeline, _cache, _rx) = pipeline(
            FixedDetector(vec![bbox(0.0, 0.0, 8.0, 6.0), bbox(20.0, 20.0, 4.0, 4.0)]),
            SizeClassifier,
        );
        let mut pipeline = pipeline.with_face_dump(FaceDump::create(dir.clone(), 75).unwrap());
        pipeline.process_frame(frame()).unwrap();

        let first = std::fs::read(dir.join("face00000.jpg")).unwrap();
        assert_eq!(jpeg::decode(&first).unwrap().dimensions(), (8, 6));
        let embedding: Vec<f32> =
            serde_json::from_slice(&std::fs::read(dir.join("face00001.json")).unwrap()).unwrap();
        assert_eq!(embedding, vec![4.0, 4.0]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_dump_counter_wraps() {
        let dir = std::env::temp_dir().join(format!("facewatch-wrap-{}", std::process::id()));
        let mut dump = FaceDump::create(dir.clone(), 75).unwrap();
        dump.next = DUMP_WRAP - 1;
        let face = RgbImage::new(2, 2);
        dump.write(&face, &[1.0]);
        assert_eq!(dump.next, 0);
        assert!(dir.join("face09999.jpg").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_run_stops_at_truncated_frame() {
        let (mut pipeline, cache, _rx) = pipeline(FixedDetector(vec![]), SizeClassifier);
        let mut bytes = vec![7u8; 4 * 2 * 3 * 2];
        bytes.extend_from_slice(&[1, 2, 3]);
        let frames = FrameReader::new(Cursor::new(bytes), 4, 2);
        assert_eq!(pipeline.run(frames).unwrap(), 2);
        assert!(cache.current_frame_jpeg().is_ok());
    }

    #[tokio::test]
    async fn test_spawned_pipeline_reports_completion() {
        let (pipeline, _cache, _rx) = pipeline(FixedDetector(vec![]), SizeClassifier);
        let frames = FrameReader::new(Cursor::new(vec![0u8; 4 * 2 * 3 * 3]), 4, 2);
        let done = spawn_pipeline(pipeline, frames).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), done).await.unwrap().unwrap();
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_motion_monitor_notifies() {
        let path = std::env::temp_dir().join(format!("facewatch-motion-{}", std::process::id()));
        let config = MotionConfig {
            mbx: 1,
            mby: 1,
            magnitude: 2,
            total_threshold: 0,
            throttle: Duration::from_secs(60),
        };
        // two batches of two records, the first record of each moving
        let moving = MotionVector { dx: 5, dy: 0, sad: 0 }.to_le_bytes();
        let still = MotionVector { dx: 0, dy: 0, sad: 0 }.to_le_bytes();
        let bytes = [moving, still, moving, still].concat();
        std::fs::write(&path, bytes).unwrap();

        let (dispatcher, mut rx) = notify::channel(4);
        spawn_motion_monitor(path.clone(), config, dispatcher).unwrap().join().unwrap();

        match rx.try_recv().unwrap() {
            Notification::Motion { active, .. } => assert_eq!(active, 1),
            other => panic!("unexpected notification {other:?}"),
        }
        // second batch falls inside the throttle window
        assert!(rx.try_recv().is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
