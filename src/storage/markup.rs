use async_trait::async_trait;

use super::{BodyError, BodyReader, BoxBodyReader, Chunk};

const ESI_OPEN: &[u8] = b"<esi:";

/// Flags chunks that contain an `<esi:` tag, including tags split across chunk boundaries.
/// A split tag flags the chunk it completes in.
pub struct MarkupScanner {
    inner: BoxBodyReader,
    tail: Vec<u8>,
}

impl MarkupScanner {
    pub fn new(inner: BoxBodyReader) -> Self {
        Self {
            inner,
            tail: Vec::with_capacity(ESI_OPEN.len()),
        }
    }

    fn scan(&mut self, data: &[u8]) -> bool {
        let mut window = std::mem::take(&mut self.tail);
        window.extend_from_slice(data);
        let found = window
            .windows(ESI_OPEN.len())
            .any(|candidate| candidate == ESI_OPEN);

        let keep = ESI_OPEN.len() - 1;
        let start = window.len().saturating_sub(keep);
        self.tail = window.split_off(start);
        found
    }
}

#[async_trait]
impl BodyReader for MarkupScanner {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>, BodyError> {
        let Some(mut chunk) = self.inner.next_chunk().await? else {
            return Ok(None);
        };
        let found = self.scan(&chunk.data);
        chunk.has_markup |= found;
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::body::BufferedBody;

    async fn flags(parts: &[&'static str]) -> Vec<bool> {
        let source = BufferedBody::new(parts.iter().map(|part| Chunk::new(*part)));
        let mut scanner = MarkupScanner::new(Box::new(source));
        let mut flags = Vec::new();
        while let Some(chunk) = scanner.next_chunk().await.expect("chunk") {
            flags.push(chunk.has_markup);
        }
        flags
    }

    #[tokio::test]
    async fn tags_inside_a_chunk_are_flagged() {
        assert_eq!(
            flags(&["<p>plain</p>", "<esi:include src=\"/x\"/>"]).await,
            [false, true]
        );
    }

    #[tokio::test]
    async fn tags_split_across_chunks_are_flagged() {
        assert_eq!(flags(&["abc<es", "i:include/>", "tail"]).await, [false, true, false]);
        assert_eq!(flags(&["<", "e", "s", "i", ":"]).await, [false, false, false, false, true]);
    }

    #[tokio::test]
    async fn similar_text_is_not_markup() {
        assert_eq!(flags(&["<esi", " :not a tag"]).await, [false, false]);
    }
}
