pub mod amplitude;
pub mod decode;
pub mod ring_buffer;

pub use amplitude::{downmix, downmix_into, AmplitudeTracker};
pub use decode::{AudioChunk, ChunkStream, MediaDecoder, SymphoniaDecoder};
pub use ring_buffer::{ring_buffer, SampleConsumer, SampleProducer};
