pub mod segment;

// Re-export the main segmentation types for external use
pub use segment::{ChatMessage, DialogSegmenter, DialogWindow, SegmenterConfig, normalize_text};
