use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Integer region covered by this box.
    pub fn region(&self) -> Region {
        let min_x = self.x.round() as i32;
        let min_y = self.y.round() as i32;
        Region {
            min_x,
            min_y,
            max_x: (self.x + self.width).round() as i32,
            max_y: (self.y + self.height).round() as i32,
        }
    }
}

/// Half-open pixel rectangle `[min, max)` that may extend past the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl Region {
    pub fn width(&self) -> i64 {
        i64::from(self.max_x) - i64::from(self.min_x)
    }

    pub fn height(&self) -> i64 {
        i64::from(self.max_y) - i64::from(self.min_y)
    }

    /// Grow the region around its center so each dimension is scaled by
    /// `factor`. A factor of 1.5 adds a quarter of the width on each side.
    /// Edges saturate at the `i32` range, so an oversized region can only
    /// grow past the frame, never wrap back into it.
    pub fn padded(&self, factor: f32) -> Region {
        let grow = f64::from(factor - 1.0) / 2.0;
        let dx = (self.width() as f64 * grow) as i32;
        let dy = (self.height() as f64 * grow) as i32;
        Region {
            min_x: self.min_x.saturating_sub(dx),
            min_y: self.min_y.saturating_sub(dy),
            max_x: self.max_x.saturating_add(dx),
            max_y: self.max_y.saturating_add(dy),
        }
    }

    /// True when the region is non-empty and lies entirely inside a
    /// `width` x `height` frame.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        self.width() > 0
            && self.height() > 0
            && self.min_x >= 0
            && self.min_y >= 0
            && i64::from(self.max_x) <= i64::from(width)
            && i64::from(self.max_y) <= i64::from(height)
    }

    /// Copy the region out of `frame`, or `None` if it does not fit.
    pub fn crop(&self, frame: &RgbImage) -> Option<RgbImage> {
        if !self.fits(frame.width(), frame.height()) {
            return None;
        }
        let view = image::imageops::crop_imm(
            frame,
            self.min_x as u32,
            self.min_y as u32,
            self.width() as u32,
            self.height() as u32,
        );
        Some(view.to_image())
    }
}

/// A known person from the roster file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    pub embedding: Vec<f32>,
}

/// MIME type of every image stored in the face cache.
pub const JPEG_MIME_TYPE: &str = "image/jpeg";

/// A face observed by the pipeline or enrolled over HTTP.
///
/// Image bytes are shared so cache snapshots stay cheap to copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceRecord {
    #[serde(with = "base64_bytes")]
    pub image: Arc<[u8]>,
    pub mime_type: String,
    #[serde(rename = "time")]
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub embedding: Vec<f32>,
}

/// Byte fields travel as standard base64 strings in JSON.
mod base64_bytes {
    use std::sync::Arc;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Arc<[u8]>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Arc<[u8]>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Arc::from)
            .map_err(serde::de::Error::custom)
    }
}
