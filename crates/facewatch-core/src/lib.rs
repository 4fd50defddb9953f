//! facewatch-core — face cache, embedding matching, and the neural
//! collaborators used by the edge agent.
//!
//! Detection (SCRFD) and classification (ArcFace) run on ONNX Runtime and
//! sit behind the [`FaceDetector`] and [`FaceClassifier`] traits so the
//! pipeline and HTTP gateway can be driven by any implementation.

pub mod cache;
pub mod classifier;
pub mod cluster;
pub mod detector;
pub mod embedding;
pub mod jpeg;
pub mod matcher;
pub mod people;
pub mod types;

pub use cache::{CacheError, FaceCache};
pub use classifier::{ArcFaceClassifier, ClassifierError, FaceClassifier};
pub use cluster::{ClusterSink, NoopClusterSink, Peak};
pub use detector::{DetectorError, FaceDetector, ScrfdDetector};
pub use embedding::DimensionMismatch;
pub use matcher::{EuclideanMatcher, Match, Matcher};
pub use types::{BoundingBox, FaceRecord, Person, Region};
