pub mod player;
pub mod source;

pub use player::{ChunkSink, PlayerId, PlayerRegistry};
pub use source::{ChunkProducer, SourceRegistry};
