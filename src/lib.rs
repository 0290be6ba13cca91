//! Audio-to-motion core: beat detection, tempo tracking and actuator
//! position mapping.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod motion;

pub use analysis::{AnalysisPipeline, BeatEvent, BeatMap, BpmEstimate};
pub use engine::{Engine, EngineConfig, EngineState, EventSink, PlaybackState};
pub use error::{Error, Result};
