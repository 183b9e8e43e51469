//! Concrete detector and loss
//!
//! The trainer only talks to [`crate::training::DetectionNetwork`] and
//! [`crate::training::ScaleLoss`]; these are the implementations the binary
//! ships with.

pub mod detector;
pub mod yolo_loss;

pub use detector::{TinyDetector, ANCHOR_MASKS};
pub use yolo_loss::YoloScaleLoss;
