// Inbound byte stream of one upload request

use std::io::{self, Read};

/// A sequence of transport-sized chunks terminated by end-of-stream (`Ok(None)`) or an error.
pub trait ChunkSource {
    type Error: std::fmt::Display;

    fn next_chunk(&mut self) -> Result<Option<&[u8]>, Self::Error>;
}

/// Adapts any `Read` (socket, file, in-memory slice) with a fixed receive buffer.
pub struct ReadSource<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R: Read> ReadSource<R> {
    pub fn new(reader: R, buffer_size: usize) -> Self {
        Self {
            reader,
            buffer: vec![0u8; buffer_size.max(1)],
        }
    }
}

impl<R: Read> ChunkSource for ReadSource<R> {
    type Error = io::Error;

    fn next_chunk(&mut self) -> Result<Option<&[u8]>, io::Error> {
        loop {
            match self.reader.read(&mut self.buffer) {
                Ok(0) => return Ok(None),
                Ok(n) => return Ok(Some(&self.buffer[..n])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
