//! Online clustering sink for observed embeddings.
//!
//! The cache forwards every embedding it stores and serves the sink's
//! peaks over HTTP. The clustering algorithm itself lives behind this
//! trait.

use serde::{Deserialize, Serialize};

/// Summary of one cluster reported by a [`ClusterSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub centroid: Vec<f32>,
    pub weight: f32,
}

/// Receives embeddings as they are observed and reports cluster peaks.
pub trait ClusterSink: Send {
    fn insert(&mut self, embedding: &[f32]);
    fn peaks(&self) -> Vec<Peak>;
}

/// Sink that discards embeddings and never reports peaks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopClusterSink;

impl ClusterSink for NoopClusterSink {
    fn insert(&mut self, _embedding: &[f32]) {}

    fn peaks(&self) -> Vec<Peak> {
        Vec::new()
    }
}
