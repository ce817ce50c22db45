//! Source registry (§4, component 7): chunk producers by source
//! identifier. The codec/framer that produces chunks is an external
//! collaborator (§1); only its contract (`ChunkProducer`) plus the
//! default `Mjpeg` implementation (§6) are specified here.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::codec;

/// Contract for a chunk producer: loops forever, yielding
/// `(frame_number, bytes)` pairs, rewinding at EOF.
pub trait ChunkProducer: Send {
    fn next_chunk(&mut self) -> std::io::Result<(u64, Vec<u8>)>;
}

#[derive(Debug)]
pub enum SourceError {
    UnsupportedExtension(String),
    NoExtension,
    Io(std::io::Error),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SourceError::UnsupportedExtension(ext) => write!(f, "unsupported source extension: {}", ext),
            SourceError::NoExtension => write!(f, "source has no file extension"),
            SourceError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SourceError {}

/// Builds a `ChunkProducer` for a source identifier, dispatching on its
/// extension (§9: "a factory keyed by a string extension").
#[derive(Default)]
pub struct SourceRegistry {
    // Tracks which source identifiers have been yielded locally, so a
    // duplicate `yield_flow` call on the same source is observed as a
    // single flow key (§8 boundary behaviour).
    known: RwLock<HashMap<String, ()>>,
}

impl SourceRegistry {
    pub fn new() -> SourceRegistry {
        SourceRegistry::default()
    }

    /// `true` iff `source` had not previously been yielded on this node.
    pub fn register(&self, source: &str) -> bool {
        let mut known = self.known.write();
        if known.contains_key(source) {
            false
        } else {
            known.insert(source.to_string(), ());
            true
        }
    }

    pub fn unregister(&self, source: &str) {
        self.known.write().remove(source);
    }

    pub fn open(&self, source: &str) -> Result<Box<dyn ChunkProducer>, SourceError> {
        let ext = source
            .rsplit('.')
            .next()
            .filter(|ext| *ext != source)
            .ok_or(SourceError::NoExtension)?;
        match ext {
            "Mjpeg" | "mjpeg" => Ok(Box::new(codec::mjpeg::MjpegProducer::open(source)?)),
            other => Err(SourceError::UnsupportedExtension(other.to_string())),
        }
    }
}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> SourceError {
        SourceError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_yield_is_a_single_registration() {
        let reg = SourceRegistry::new();
        assert!(reg.register("movie.Mjpeg"));
        assert!(!reg.register("movie.Mjpeg"));
    }

    #[test]
    fn rejects_unknown_extension() {
        let reg = SourceRegistry::new();
        assert!(matches!(reg.open("movie.mkv"), Err(SourceError::UnsupportedExtension(_))));
    }
}
