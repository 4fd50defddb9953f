//! facewatch-stream — readers for the agent's two input pipes.
//!
//! The video pipe carries headerless RGB24 frames of a fixed size. The
//! motion pipe carries the encoder's per-macroblock motion vectors, one
//! fixed-size batch per frame.

pub mod frame;
pub mod motion;

pub use frame::{FrameError, FrameReader};
pub use motion::{
    MotionAnalyzer, MotionConfig, MotionError, MotionEvent, MotionState, MotionSummary,
    MotionVector,
};
