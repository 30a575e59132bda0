//! Splits streamed generation text into speakable pieces.

use crate::pipeline::messages::SentenceChunk;

/// Minimum buffered length (bytes) before splitting on clause punctuation.
const CLAUSE_MIN_LEN: usize = 20;

/// Accumulates text deltas and releases sentence or clause sized chunks.
#[derive(Debug, Default)]
pub struct SentenceChunker {
    buffer: String,
}

impl SentenceChunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and return every chunk that is now complete.
    pub fn push(&mut self, delta: &str) -> Vec<SentenceChunk> {
        self.buffer.push_str(delta);
        let mut out = Vec::new();
        while let Some(pos) = find_clause_boundary(&self.buffer) {
            let text = self.buffer[..=pos].trim().to_owned();
            self.buffer = self.buffer[pos + 1..].to_owned();
            if !text.is_empty() {
                out.push(SentenceChunk {
                    text,
                    is_final: false,
                });
            }
        }
        out
    }

    /// Flush whatever remains as the final chunk.
    pub fn finish(&mut self) -> Option<SentenceChunk> {
        let text = std::mem::take(&mut self.buffer).trim().to_owned();
        (!text.is_empty()).then_some(SentenceChunk {
            text,
            is_final: true,
        })
    }
}

/// Byte index of a sentence end (`. ! ? \n` followed by space or end).
fn find_sentence_boundary(text: &str) -> Option<usize> {
    text.char_indices().find_map(|(i, c)| {
        if !matches!(c, '.' | '!' | '?' | '\n') {
            return None;
        }
        let rest = &text[i + c.len_utf8()..];
        (rest.is_empty() || rest.starts_with(' ') || rest.starts_with('\n')).then_some(i)
    })
}

/// Byte index of the last byte of the next split point.
///
/// Sentence ends always split. Clause punctuation (`, ; :` and dashes) only
/// splits once the buffer reaches [`CLAUSE_MIN_LEN`], and then at the last
/// such mark so chunks stay long.
fn find_clause_boundary(text: &str) -> Option<usize> {
    if let Some(pos) = find_sentence_boundary(text) {
        return Some(pos);
    }
    if text.len() < CLAUSE_MIN_LEN {
        return None;
    }
    let mut last = None;
    for (i, c) in text.char_indices() {
        if matches!(c, ',' | ';' | ':' | '\u{2014}' | '\u{2013}') {
            let rest = &text[i + c.len_utf8()..];
            if rest.is_empty() || rest.starts_with(' ') {
                last = Some(i + c.len_utf8() - 1);
            }
        }
    }
    last
}
