//! Token-accurate chunking of extracted text
//!
//! Text is split on blank-line paragraph boundaries, then on sentence
//! boundaries inside each paragraph. Sentences are greedily packed into
//! chunks of at most `chunk_size` tokens, with the trailing `overlap` tokens
//! (rounded to whole sentences) carried into the next chunk. Token counts use
//! the same tokenizer family as the embedding model.

use crate::error::{CoreError, Result};
use regex::Regex;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// One chunk of document text
#[derive(Debug, Clone)]
pub struct TextChunk {
    pub text: String,
    pub index: usize,
    pub token_count: usize,
    pub paragraph: usize,
}

/// Paragraph- and sentence-aware token chunker
pub struct Chunker {
    bpe: CoreBPE,
    paragraph_split: Regex,
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if overlap >= chunk_size {
            return Err(CoreError::Config(format!(
                "chunk overlap {} must be smaller than chunk size {}",
                overlap, chunk_size
            )));
        }
        let bpe = cl100k_base()
            .map_err(|e| CoreError::Config(format!("tokenizer unavailable: {}", e)))?;
        Ok(Self {
            bpe,
            paragraph_split: Regex::new(r"\n\s*\n").expect("valid regex"),
            chunk_size,
            overlap,
        })
    }

    /// Token count of a text under the embedding tokenizer
    pub fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    /// Split text into chunks; empty input yields an empty sequence
    pub fn chunk(&self, text: &str) -> Vec<TextChunk> {
        let mut chunks = Vec::new();

        for (paragraph_index, paragraph) in self
            .paragraph_split
            .split(text)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .enumerate()
        {
            self.chunk_paragraph(paragraph, paragraph_index, &mut chunks);
        }

        chunks
    }

    fn chunk_paragraph(&self, paragraph: &str, paragraph_index: usize, chunks: &mut Vec<TextChunk>) {
        // (sentence, token_count) pairs; oversized sentences are hard-split
        // up front so the packing loop only ever sees fitting pieces
        let mut sentences: Vec<(String, usize)> = Vec::new();
        for sentence in split_sentences(paragraph) {
            let tokens = self.count_tokens(&sentence);
            if tokens > self.chunk_size {
                for piece in self.hard_split(&sentence) {
                    let piece_tokens = self.count_tokens(&piece);
                    sentences.push((piece, piece_tokens));
                }
            } else {
                sentences.push((sentence, tokens));
            }
        }

        let mut buffer: Vec<(String, usize)> = Vec::new();
        let mut buffer_tokens = 0usize;

        for (sentence, tokens) in sentences {
            if buffer_tokens + tokens > self.chunk_size && !buffer.is_empty() {
                self.close_chunk(&buffer, paragraph_index, chunks);

                // carry the last `overlap` tokens, ending at a sentence
                // boundary, into the next chunk
                let mut carried: Vec<(String, usize)> = Vec::new();
                let mut carried_tokens = 0usize;
                for (s, t) in buffer.iter().rev() {
                    if carried_tokens + t > self.overlap {
                        break;
                    }
                    carried_tokens += t;
                    carried.insert(0, (s.clone(), *t));
                }
                buffer = carried;
                buffer_tokens = carried_tokens;

                // shed carried sentences if they would push the next chunk
                // over budget together with the incoming sentence
                while buffer_tokens + tokens > self.chunk_size && !buffer.is_empty() {
                    let (_, t) = buffer.remove(0);
                    buffer_tokens -= t;
                }
            }

            buffer_tokens += tokens;
            buffer.push((sentence, tokens));
        }

        if !buffer.is_empty() {
            self.close_chunk(&buffer, paragraph_index, chunks);
        }
    }

    fn close_chunk(
        &self,
        buffer: &[(String, usize)],
        paragraph_index: usize,
        chunks: &mut Vec<TextChunk>,
    ) {
        let text = buffer
            .iter()
            .map(|(s, _)| s.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let token_count = self.count_tokens(&text);
        chunks.push(TextChunk {
            text,
            index: chunks.len(),
            token_count,
            paragraph: paragraph_index,
        });
    }

    /// Split an oversized sentence on token-count boundaries; nothing is
    /// dropped
    fn hard_split(&self, sentence: &str) -> Vec<String> {
        let mut pieces = Vec::new();
        let mut rest = sentence;

        while !rest.is_empty() {
            if self.count_tokens(rest) <= self.chunk_size {
                pieces.push(rest.to_string());
                break;
            }
            let split_at = self.largest_fitting_prefix(rest);
            pieces.push(rest[..split_at].to_string());
            rest = &rest[split_at..];
        }

        pieces
    }

    /// Largest char-boundary prefix whose token count fits in a chunk
    fn largest_fitting_prefix(&self, text: &str) -> usize {
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .skip(1)
            .chain(std::iter::once(text.len()))
            .collect();

        let mut lo = 0usize; // index into boundaries, always fitting
        let mut hi = boundaries.len() - 1;

        if self.count_tokens(&text[..boundaries[0]]) > self.chunk_size {
            // a single char exceeding chunk_size cannot happen with a BPE
            // vocabulary, but bail out with one char to guarantee progress
            return boundaries[0];
        }

        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if self.count_tokens(&text[..boundaries[mid]]) <= self.chunk_size {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }

        boundaries[lo]
    }
}

/// Split a paragraph into sentences on terminal punctuation
fn split_sentences(paragraph: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let chars: Vec<(usize, char)> = paragraph.char_indices().collect();

    for (pos, &(idx, c)) in chars.iter().enumerate() {
        if matches!(c, '.' | '!' | '?') {
            let at_end = pos + 1 == chars.len();
            let followed_by_space = chars.get(pos + 1).map(|(_, n)| n.is_whitespace());
            if at_end || followed_by_space == Some(true) {
                let end = idx + c.len_utf8();
                let sentence = paragraph[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                start = end;
            }
        }
    }

    let tail = paragraph[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }

    sentences
}
