pub mod mapper;

pub use mapper::{BeatMapper, POSITION_MAX, POSITION_MIN, POSITION_REST};
