//! Overlapping, span-tracked chunker.
//!
//! Splits extracted document text into [`Chunk`]s of at most `max_size`
//! characters, repeating `overlap` characters between neighbours so context
//! survives a boundary. Markup pages go through [`crate::markup`], which
//! chunks a structural traversal instead of raw text; [`chunk`] dispatches
//! between the two.
//!
//! Each chunk receives a deterministic id derived from its source, sequence
//! index, and text, plus a SHA-256 hash of its text.
//!
//! # Algorithm (document text)
//!
//! 1. Work in characters, not bytes, so spans are stable across encodings.
//! 2. Open a window `[start, start + max_size)`.
//! 3. If the window does not reach the end of the text, pull its end back to
//!    the last paragraph break, then line break, then whitespace, as long as
//!    the end stays beyond `start + overlap` (so the walk always advances).
//! 4. Emit the window, then start the next one `overlap` characters before
//!    the previous end.
//!
//! Consecutive spans therefore overlap by exactly `overlap` characters and
//! never leave a gap.
//!
//! # Example
//!
//! ```rust
//! use qa_harness_core::chunk::{chunk_text, ChunkParams};
//!
//! let params = ChunkParams { max_size: 1000, overlap: 200 };
//! let chunks = chunk_text("spec.md", "Hello world.\n\nSecond paragraph.", &params).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].sequence_index, 0);
//! ```

use sha2::{Digest, Sha256};

use crate::error::{QaError, QaResult};
use crate::markup::{chunk_markup, MarkupNode};
use crate::models::{CharSpan, Chunk, SourceKind};

/// Size limits for one chunking pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    /// Maximum characters per chunk.
    pub max_size: usize,
    /// Characters repeated between consecutive chunks. Must be `< max_size`.
    pub overlap: usize,
}

impl ChunkParams {
    pub fn validate(&self, source_id: &str) -> QaResult<()> {
        if self.max_size == 0 {
            return Err(chunking_error(source_id, "max_size must be > 0"));
        }
        if self.overlap >= self.max_size {
            return Err(chunking_error(
                source_id,
                format!(
                    "overlap ({}) must be smaller than max_size ({})",
                    self.overlap, self.max_size
                ),
            ));
        }
        Ok(())
    }
}

/// Input to [`chunk`]: extracted text or a markup tree.
#[derive(Debug, Clone, Copy)]
pub enum ChunkSource<'a> {
    Text(&'a str),
    Markup(&'a MarkupNode),
}

impl ChunkSource<'_> {
    pub fn kind(&self) -> SourceKind {
        match self {
            ChunkSource::Text(_) => SourceKind::Doc,
            ChunkSource::Markup(_) => SourceKind::Markup,
        }
    }
}

/// Chunk one source into an ordered sequence of [`Chunk`]s.
///
/// # Errors
///
/// [`QaError::Chunking`] if the source is empty or `overlap >= max_size`.
pub fn chunk(source: ChunkSource<'_>, source_id: &str, params: &ChunkParams) -> QaResult<Vec<Chunk>> {
    match source {
        ChunkSource::Text(text) => chunk_text(source_id, text, params),
        ChunkSource::Markup(tree) => chunk_markup(source_id, tree, params),
    }
}

/// Split document text into overlapping chunks.
pub fn chunk_text(source_id: &str, text: &str, params: &ChunkParams) -> QaResult<Vec<Chunk>> {
    params.validate(source_id)?;
    if text.trim().is_empty() {
        return Err(chunking_error(source_id, "text is empty"));
    }

    let chars: Vec<char> = text.chars().collect();
    let offsets = byte_offsets(text);
    let n = chars.len();

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let hard_end = (start + params.max_size).min(n);
        let end = if hard_end < n {
            snap_end(&chars, start + params.overlap + 1, hard_end)
        } else {
            n
        };

        let span = CharSpan { start, end };
        let piece = &text[offsets[start]..offsets[end]];
        chunks.push(make_chunk(
            source_id,
            SourceKind::Doc,
            chunks.len(),
            span,
            piece,
            None,
        ));

        if end == n {
            break;
        }
        start = end - params.overlap;
    }

    Ok(chunks)
}

/// Byte offset of every character boundary, including the end of the text.
pub(crate) fn byte_offsets(text: &str) -> Vec<usize> {
    text.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect()
}

/// Pull a window end back to the best boundary in `[min_end, hard_end]`.
///
/// Preference: just after a blank line, just after a newline, just after any
/// whitespace. Falls back to `hard_end` when none exists.
fn snap_end(chars: &[char], min_end: usize, hard_end: usize) -> usize {
    if min_end > hard_end {
        return hard_end;
    }
    let paragraph = (min_end..=hard_end)
        .rev()
        .find(|&p| p >= 2 && chars[p - 1] == '\n' && chars[p - 2] == '\n');
    if let Some(p) = paragraph {
        return p;
    }
    let line = (min_end..=hard_end)
        .rev()
        .find(|&p| p >= 1 && chars[p - 1] == '\n');
    if let Some(p) = line {
        return p;
    }
    (min_end..=hard_end)
        .rev()
        .find(|&p| p >= 1 && chars[p - 1].is_whitespace())
        .unwrap_or(hard_end)
}

pub(crate) fn chunking_error(source_id: &str, reason: impl Into<String>) -> QaError {
    QaError::Chunking {
        source_id: source_id.to_string(),
        reason: reason.into(),
    }
}

/// Create a single [`Chunk`] with a deterministic id and SHA-256 content hash.
pub(crate) fn make_chunk(
    source_id: &str,
    kind: SourceKind,
    index: usize,
    span: CharSpan,
    text: &str,
    selectors: Option<Vec<String>>,
) -> Chunk {
    let hash = format!("{:x}", Sha256::digest(text.as_bytes()));

    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(index.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    Chunk {
        id: format!("chk-{}", &digest[..12]),
        text: text.to_string(),
        source_document_id: source_id.to_string(),
        source_kind: kind,
        sequence_index: index,
        char_span: span,
        element_selectors: selectors,
        hash,
    }
}
