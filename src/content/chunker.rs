use anyhow::{Context, Result};
use text_splitter::{ChunkConfig, ChunkSizer, TextSplitter};
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::debug;

/// Adapter so the splitter sizes chunks with the same tokenizer we use for
/// token counts.
struct TokenSizer<'a>(&'a CoreBPE);

impl ChunkSizer for TokenSizer<'_> {
    fn size(&self, chunk: &str) -> usize {
        self.0.encode_ordinary(chunk).len()
    }
}

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_tokens: 512,
            overlap_tokens: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextChunk {
    pub content: String,
    pub chunk_index: usize,
    pub tokens: usize,
}

/// Token-aware chunker. Boundaries prefer paragraph and sentence breaks over
/// raw character counts (the splitter descends semantic levels), overlap is
/// configurable, and indices are 0-based and contiguous across the whole
/// document even when hard boundaries split it into segments.
pub struct Chunker {
    bpe: CoreBPE,
}

impl Chunker {
    pub fn new() -> Result<Self> {
        let bpe = cl100k_base().context("failed to load tokenizer")?;
        Ok(Self { bpe })
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    /// Chunk `text`, never merging across `hard_boundaries` (sorted byte
    /// offsets, typically from domain-processor annotations).
    pub fn chunk(
        &self,
        text: &str,
        config: &ChunkerConfig,
        hard_boundaries: &[usize],
    ) -> Result<Vec<TextChunk>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let target = config.target_tokens.max(1);
        // Overlap must stay below capacity for the splitter
        let overlap = config.overlap_tokens.min(target.saturating_sub(1));

        let chunk_config = ChunkConfig::new(target)
            .with_sizer(TokenSizer(&self.bpe))
            .with_overlap(overlap)
            .context("invalid chunker config")?;
        let splitter = TextSplitter::new(chunk_config);

        let mut chunks = Vec::new();
        for segment in split_at_boundaries(text, hard_boundaries) {
            for piece in splitter.chunks(segment) {
                let content = piece.trim();
                if content.is_empty() {
                    continue;
                }
                let tokens = self.count_tokens(content);
                chunks.push(TextChunk {
                    content: content.to_string(),
                    chunk_index: chunks.len(),
                    tokens,
                });
            }
        }

        debug!("chunked {} chars into {} chunks", text.len(), chunks.len());
        Ok(chunks)
    }
}

/// Split text at byte offsets, skipping offsets that are out of range or not
/// on a char boundary.
fn split_at_boundaries<'a>(text: &'a str, boundaries: &[usize]) -> Vec<&'a str> {
    let mut cuts: Vec<usize> = boundaries
        .iter()
        .copied()
        .filter(|&b| b > 0 && b < text.len() && text.is_char_boundary(b))
        .collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut segments = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for cut in cuts {
        segments.push(&text[start..cut]);
        start = cut;
    }
    segments.push(&text[start..]);
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> Chunker {
        Chunker::new().unwrap()
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        let chunks = chunker()
            .chunk("   \n ", &ChunkerConfig::default(), &[])
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn indices_are_contiguous() {
        let text = "A paragraph about storage engines.\n\n".repeat(50);
        let config = ChunkerConfig {
            target_tokens: 64,
            overlap_tokens: 0,
        };
        let chunks = chunker().chunk(&text, &config, &[]).unwrap();
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert!(chunk.tokens > 0);
            assert!(chunk.tokens <= 64);
        }
    }

    #[test]
    fn hard_boundaries_are_never_crossed() {
        let first = "Question: what is a bloom filter?";
        let second = "Answer: a probabilistic set membership structure.";
        let text = format!("{}{}", first, second);
        let config = ChunkerConfig {
            target_tokens: 512,
            overlap_tokens: 0,
        };

        let chunks = chunker().chunk(&text, &config, &[first.len()]).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, first);
        assert_eq!(chunks[1].content, second);
    }

    #[test]
    fn overlap_is_clamped_below_target() {
        let text = "word ".repeat(500);
        let config = ChunkerConfig {
            target_tokens: 32,
            overlap_tokens: 64,
        };
        // Must not error even though overlap exceeds the target
        let chunks = chunker().chunk(&text, &config, &[]).unwrap();
        assert!(!chunks.is_empty());
    }

    #[test]
    fn boundary_splitting_handles_invalid_offsets() {
        let text = "héllo wörld";
        // Offset 2 lands inside the two-byte 'é'; only valid boundaries survive
        let segments = split_at_boundaries(text, &[1, 2, 1000, 0]);
        let rejoined: String = segments.concat();
        assert_eq!(rejoined, text);
    }
}
