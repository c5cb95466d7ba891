//! OCR results and the service that produces them.

pub mod blocks;
pub mod markdown;
pub mod textract;
pub mod throttle;
