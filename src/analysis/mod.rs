pub mod features;
pub mod onset;
pub mod pipeline;
pub mod tempo;

pub use features::{BeatEvent, BeatMap, BpmEstimate};
pub use onset::{OnsetConfig, OnsetDetector};
pub use pipeline::{AnalysisPipeline, PipelineConfig};
pub use tempo::{BpmEstimator, TempoConfig};
