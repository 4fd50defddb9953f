//! Rolling cache of recently observed faces and the latest video frame.
//!
//! A single mutex guards the face ring, the two-slot frame buffer and the
//! clustering sink. Every accessor holds it for its full duration and
//! returns owned copies, so callers never see a record list that a
//! concurrent insert could change underneath them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use image::RgbImage;
use thiserror::Error;

use crate::cluster::{ClusterSink, Peak};
use crate::jpeg;
use crate::types::{FaceRecord, JPEG_MIME_TYPE};

/// Default number of faces retained.
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("face index {index} out of range (cache holds {len})")]
    NotFound { index: i64, len: usize },
    #[error("no frame has been captured yet")]
    NoFrame,
    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

struct CacheState {
    /// Ring storage. Grows to capacity, then slots are overwritten in place.
    records: Vec<FaceRecord>,
    /// Slot the next record lands in once the ring is full.
    write_cursor: usize,
    frames: [Option<RgbImage>; 2],
    current_frame: usize,
    sink: Box<dyn ClusterSink>,
}

/// Bounded, thread-safe store of recent faces and frames.
///
/// Once `capacity` faces are held, each new face overwrites the oldest
/// slot. Listing reports storage order, so after a wrap the newest record
/// sits before the older ones: inserting A, B, C, D into a cache of three
/// lists `[D, B, C]`.
pub struct FaceCache {
    capacity: usize,
    quality: u8,
    state: Mutex<CacheState>,
}

impl FaceCache {
    /// Create a cache holding up to `capacity` faces (at least one), encoding
    /// images at JPEG `quality`.
    pub fn new(capacity: usize, quality: u8, sink: Box<dyn ClusterSink>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            quality,
            state: Mutex::new(CacheState {
                records: Vec::with_capacity(capacity),
                write_cursor: 0,
                frames: [None, None],
                current_frame: 0,
                sink,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode `face`, forward its embedding to the clustering sink and store
    /// it, overwriting the oldest record when full.
    pub fn add_face(&self, face: &RgbImage, embedding: Vec<f32>) -> Result<(), CacheError> {
        let mut state = self.lock();

        let image = jpeg::encode(face, self.quality)?;
        let record = FaceRecord {
            image: Arc::from(image),
            mime_type: JPEG_MIME_TYPE.to_string(),
            captured_at: Utc::now(),
            width: face.width(),
            height: face.height(),
            embedding,
        };

        state.sink.insert(&record.embedding);

        let slot = state.write_cursor;
        if state.records.len() < self.capacity {
            state.records.push(record);
        } else {
            state.records[slot] = record;
        }
        state.write_cursor = (slot + 1) % self.capacity;

        tracing::trace!(slot, len = state.records.len(), "face cached");
        Ok(())
    }

    /// Store the most recent decoded frame. Only the latest one is served;
    /// the other slot holds the previous frame.
    pub fn set_frame(&self, frame: RgbImage) {
        let mut state = self.lock();
        let next = (state.current_frame + 1) % state.frames.len();
        state.frames[next] = Some(frame);
        state.current_frame = next;
    }

    /// Snapshot of every cached face in storage order.
    pub fn list_faces(&self) -> Vec<FaceRecord> {
        self.lock().records.clone()
    }

    /// Run `f` over the cached faces while holding the lock.
    pub fn with_faces<R>(&self, f: impl FnOnce(&[FaceRecord]) -> R) -> R {
        f(&self.lock().records)
    }

    /// Copy of the face at `index`, defined on `[0, len)`.
    pub fn face_by_index(&self, index: i64) -> Result<FaceRecord, CacheError> {
        self.with_face(index, FaceRecord::clone)
    }

    /// Run `f` over the face at `index` while holding the lock.
    pub fn with_face<R>(
        &self,
        index: i64,
        f: impl FnOnce(&FaceRecord) -> R,
    ) -> Result<R, CacheError> {
        let state = self.lock();
        usize::try_from(index)
            .ok()
            .and_then(|i| state.records.get(i))
            .map(f)
            .ok_or(CacheError::NotFound {
                index,
                len: state.records.len(),
            })
    }

    /// JPEG encoding of the latest frame, produced on demand.
    pub fn current_frame_jpeg(&self) -> Result<Vec<u8>, CacheError> {
        let state = self.lock();
        let frame = state.frames[state.current_frame]
            .as_ref()
            .ok_or(CacheError::NoFrame)?;
        Ok(jpeg::encode(frame, self.quality)?)
    }

    /// Cluster peaks reported by the sink.
    pub fn cluster_peaks(&self) -> Vec<Peak> {
        self.lock().sink.peaks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NoopClusterSink;

    fn face(width: u32) -> RgbImage {
        RgbImage::from_pixel(width, 8, image::Rgb([90, 120, 150]))
    }

    fn cache(capacity: usize) -> FaceCache {
        FaceCache::new(capacity, jpeg::DEFAULT_QUALITY, Box::new(NoopClusterSink))
    }

    fn tags(cache: &FaceCache) -> Vec<f32> {
        cache.list_faces().iter().map(|r| r.embedding[0]).collect()
    }

    /// Records every inserted embedding and reports them back as peaks.
    struct RecordingSink(Arc<Mutex<Vec<Vec<f32>>>>);

    impl ClusterSink for RecordingSink {
        fn insert(&mut self, embedding: &[f32]) {
            self.0.lock().unwrap().push(embedding.to_vec());
        }

        fn peaks(&self) -> Vec<Peak> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .map(|e| Peak { centroid: e.clone(), weight: 1.0 })
                .collect()
        }
    }

    #[test]
    fn test_add_face_builds_record() {
        let cache = cache(4);
        cache.add_face(&face(12), vec![0.25, 0.5]).unwrap();

        let record = cache.face_by_index(0).unwrap();
        assert_eq!(record.mime_type, "image/jpeg");
        assert_eq!((record.width, record.height), (12, 8));
        assert_eq!(record.embedding, vec![0.25, 0.5]);
        let decoded = jpeg::decode(&record.image).unwrap();
        assert_eq!(decoded.dimensions(), (12, 8));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let cache = cache(5);
        for i in 0..23 {
            cache.add_face(&face(4), vec![i as f32]).unwrap();
            assert!(cache.len() <= 5);
        }
        assert_eq!(cache.len(), 5);
    }

    #[test]
    fn test_wrap_overwrites_oldest_slot() {
        let cache = cache(3);
        for tag in [0.0, 1.0, 2.0, 3.0] {
            cache.add_face(&face(4), vec![tag]).unwrap();
        }
        // A, B, C, D → D replaces A in slot 0
        assert_eq!(tags(&cache), vec![3.0, 1.0, 2.0]);
    }

    #[test]
    fn test_n_plus_one_evicts_first_record_only() {
        let n = 6;
        let cache = cache(n);
        for i in 0..=n {
            cache.add_face(&face(4), vec![i as f32]).unwrap();
        }
        let stored = tags(&cache);
        assert!(!stored.contains(&0.0));
        assert_eq!(stored[0], n as f32);
        assert_eq!(&stored[1..], &[1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_cursor_keeps_wrapping() {
        let cache = cache(3);
        for i in 0..8 {
            cache.add_face(&face(4), vec![i as f32]).unwrap();
        }
        // slots: 0 ← 6, 1 ← 7, 2 ← 5
        assert_eq!(tags(&cache), vec![6.0, 7.0, 5.0]);
    }

    #[test]
    fn test_face_by_index_bounds() {
        let cache = cache(10);
        assert!(matches!(
            cache.face_by_index(0),
            Err(CacheError::NotFound { index: 0, len: 0 })
        ));

        for i in 0..3 {
            cache.add_face(&face(4), vec![i as f32]).unwrap();
        }
        for i in 0..3 {
            assert_eq!(cache.face_by_index(i).unwrap().embedding, vec![i as f32]);
        }
        for bad in [-1, 3, 4, i64::MIN, i64::MAX] {
            assert!(
                matches!(cache.face_by_index(bad), Err(CacheError::NotFound { .. })),
                "index {bad} should be out of range"
            );
        }
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let cache = cache(2);
        cache.add_face(&face(4), vec![1.0]).unwrap();
        let snapshot = cache.list_faces();
        cache.add_face(&face(4), vec![2.0]).unwrap();
        cache.add_face(&face(4), vec![3.0]).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].embedding, vec![1.0]);
    }

    #[test]
    fn test_frame_missing_then_latest() {
        let cache = cache(2);
        assert!(matches!(cache.current_frame_jpeg(), Err(CacheError::NoFrame)));

        cache.set_frame(RgbImage::new(32, 24));
        cache.set_frame(RgbImage::new(48, 16));
        let jpeg_bytes = cache.current_frame_jpeg().unwrap();
        assert_eq!(jpeg::decode(&jpeg_bytes).unwrap().dimensions(), (48, 16));

        cache.set_frame(RgbImage::new(20, 10));
        let jpeg_bytes = cache.current_frame_jpeg().unwrap();
        assert_eq!(jpeg::decode(&jpeg_bytes).unwrap().dimensions(), (20, 10));
    }

    #[test]
    fn test_embeddings_forwarded_to_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cache = FaceCache::new(2, 75, Box::new(RecordingSink(Arc::clone(&seen))));
        for i in 0..3 {
            cache.add_face(&face(4), vec![i as f32, 1.0]).unwrap();
        }
        // The sink sees every embedding, including evicted ones.
        assert_eq!(seen.lock().unwrap().len(), 3);
        let peaks = cache.cluster_peaks();
        assert_eq!(peaks.len(), 3);
        assert_eq!(peaks[2].centroid, vec![2.0, 1.0]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let cache = Arc::new(cache(16));
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        cache.add_face(&face(4), vec![(t * 100 + i) as f32]).unwrap();
                        cache.set_frame(RgbImage::new(8, 8));
                    }
                })
            })
            .collect();
        let reader = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    assert!(cache.list_faces().len() <= 16);
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(cache.len(), 16);
        assert!(cache.current_frame_jpeg().is_ok());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = cache(0);
        assert_eq!(cache.capacity(), 1);
        cache.add_face(&face(4), vec![1.0]).unwrap();
        cache.add_face(&face(4), vec![2.0]).unwrap();
        assert_eq!(tags(&cache), vec![2.0]);
    }
}
