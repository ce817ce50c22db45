//! Default chunk producer for the `Mjpeg` source extension (§6): a
//! concatenation of frames, each a 5 ASCII-digit length prefix (padded)
//! followed by that many bytes. Loops at `DEFAULT_FPS`, rewinding at EOF.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::registry::source::ChunkProducer;

pub const DEFAULT_FPS: u32 = 24;

pub struct MjpegProducer {
    file: File,
    frame_number: u64,
}

impl MjpegProducer {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<MjpegProducer> {
        Ok(MjpegProducer {
            file: File::open(path)?,
            frame_number: 0,
        })
    }

    fn read_length_prefix(&mut self) -> io::Result<Option<usize>> {
        let mut digits = [0u8; 5];
        match read_exact_or_eof(&mut self.file, &mut digits)? {
            None => Ok(None),
            Some(()) => {
                let s = std::str::from_utf8(&digits)
                    .ok()
                    .and_then(|s| s.trim().parse::<usize>().ok())
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad frame length prefix"))?;
                Ok(Some(s))
            }
        }
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

impl ChunkProducer for MjpegProducer {
    fn next_chunk(&mut self) -> io::Result<(u64, Vec<u8>)> {
        let len = match self.read_length_prefix()? {
            Some(len) => len,
            None => {
                self.rewind()?;
                self.read_length_prefix()?
                    .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "empty Mjpeg source"))?
            }
        };
        let mut bytes = vec![0u8; len];
        self.file.read_exact(&mut bytes)?;
        let n = self.frame_number;
        self.frame_number += 1;
        Ok((n, bytes))
    }
}

fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<()>> {
    let mut read = 0;
    while read < buf.len() {
        let n = r.read(&mut buf[read..])?;
        if n == 0 {
            return if read == 0 {
                Ok(None)
            } else {
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated frame header"))
            };
        }
        read += n;
    }
    Ok(Some(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_sample(path: &Path) {
        let mut f = File::create(path).unwrap();
        f.write_all(b"00003abc").unwrap();
        f.write_all(b"00002xy").unwrap();
    }

    #[test]
    fn reads_frames_and_rewinds_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.Mjpeg");
        write_sample(&path);

        let mut producer = MjpegProducer::open(&path).unwrap();
        let (n0, f0) = producer.next_chunk().unwrap();
        assert_eq!(n0, 0);
        assert_eq!(f0, b"abc");
        let (n1, f1) = producer.next_chunk().unwrap();
        assert_eq!(n1, 1);
        assert_eq!(f1, b"xy");
        // EOF -> rewinds and repeats from the top.
        let (n2, f2) = producer.next_chunk().unwrap();
        assert_eq!(n2, 2);
        assert_eq!(f2, b"abc");
    }
}
