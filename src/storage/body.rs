use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;

use super::{BodyError, BodyReader, Chunk};

/// Reader over chunks already held in memory.
#[derive(Debug, Default)]
pub struct BufferedBody {
    chunks: VecDeque<Chunk>,
}

impl BufferedBody {
    pub fn new(chunks: impl IntoIterator<Item = Chunk>) -> Self {
        Self {
            chunks: chunks.into_iter().collect(),
        }
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        if data.is_empty() {
            return Self::default();
        }
        Self::new([Chunk::new(data)])
    }
}

#[async_trait]
impl BodyReader for BufferedBody {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>, BodyError> {
        Ok(self.chunks.pop_front())
    }
}

/// Pull every remaining chunk and concatenate them.
pub async fn collect(reader: &mut dyn BodyReader) -> Result<Bytes, BodyError> {
    let mut buffer = Vec::new();
    while let Some(chunk) = reader.next_chunk().await? {
        buffer.extend_from_slice(&chunk.data);
    }
    Ok(Bytes::from(buffer))
}
