use crate::types::ChunkerParams;
use crate::{Error, Result};
use fastcdc::v2020::StreamCDC;
use std::io::Read;

/// Content-defined chunker with the repository's fixed size bounds.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    min_size: u32,
    avg_size: u32,
    max_size: u32,
}

impl Chunker {
    pub fn from_params(params: &ChunkerParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            min_size: params.min_size,
            avg_size: params.avg_size,
            max_size: params.max_size,
        })
    }

    /// Lazily splits `reader` into chunks, holding at most one maximum-sized chunk in memory.
    pub fn stream<R: Read>(&self, reader: R) -> ChunkStream<R> {
        ChunkStream {
            inner: StreamCDC::new(reader, self.min_size, self.avg_size, self.max_size),
        }
    }
}

pub struct ChunkStream<R: Read> {
    inner: StreamCDC<R>,
}

impl<R: Read> Iterator for ChunkStream<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.inner.next()?;
        Some(
            next.map(|chunk| Chunk {
                offset: chunk.offset,
                data: chunk.data,
            })
            .map_err(|e| match e {
                fastcdc::v2020::Error::IoError(io) => Error::Io(io),
                other => Error::Chunker(other.to_string()),
            }),
        )
    }
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub data: Vec<u8>,
}
