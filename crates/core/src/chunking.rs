use crate::config::validate_chunking;
use crate::error::PipelineError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

static PAGE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\[page (\d+)\]$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub size: usize,
    pub overlap: usize,
}

impl ChunkingConfig {
    pub fn new(size: usize, overlap: usize) -> Result<Self, PipelineError> {
        validate_chunking(size, overlap)?;
        Ok(Self { size, overlap })
    }
}

/// A passage of normalized text. Offsets count chars, not bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TextChunk {
    pub index: u64,
    pub text: String,
    pub start: usize,
    pub end: usize,
    /// Chars shared with the previous chunk.
    pub overlap: usize,
    pub page: Option<u32>,
}

/// Splits `text` into passages of at most `config.size` chars, consecutive
/// passages sharing exactly `config.overlap` chars.
pub fn chunk_text(text: &str, config: ChunkingConfig) -> Vec<TextChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let byte_offsets = char_byte_offsets(text);
    let pages = page_markers(text);
    let min_len = (config.overlap + 1).max(config.size / 2);

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let mut end = (start + config.size).min(chars.len());
        if end < chars.len() {
            end = snap_to_whitespace(&chars, start + min_len, end);
        }

        let overlap = if chunks.is_empty() { 0 } else { config.overlap };
        chunks.push(TextChunk {
            index: chunks.len() as u64,
            text: chars[start..end].iter().collect(),
            start,
            end,
            overlap,
            page: page_for_span(&pages, byte_offsets[start], byte_offsets[end]),
        });

        if end == chars.len() {
            break;
        }
        start = end - config.overlap;
    }

    chunks
}

/// Chunks a text and validates the parameters first.
pub fn chunk(text: &str, size: usize, overlap: usize) -> Result<Vec<TextChunk>, PipelineError> {
    Ok(chunk_text(text, ChunkingConfig::new(size, overlap)?))
}

/// Concatenates chunks, dropping each chunk's shared prefix.
pub fn reconstruct(chunks: &[TextChunk]) -> String {
    chunks
        .iter()
        .map(|chunk| chunk.text.chars().skip(chunk.overlap).collect::<String>())
        .collect()
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn make_chunk_id(document_id: &str, job_id: &str, index: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(job_id.as_bytes());
    hasher.update(index.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

fn snap_to_whitespace(chars: &[char], earliest_end: usize, end: usize) -> usize {
    (earliest_end..=end)
        .rev()
        .find(|&position| chars[position - 1].is_whitespace())
        .unwrap_or(end)
}

fn char_byte_offsets(text: &str) -> Vec<usize> {
    text.char_indices()
        .map(|(offset, _)| offset)
        .chain(std::iter::once(text.len()))
        .collect()
}

fn page_markers(text: &str) -> Vec<(usize, u32)> {
    PAGE_MARKER
        .captures_iter(text)
        .filter_map(|captures| {
            let offset = captures.get(0)?.start();
            let page = captures.get(1)?.as_str().parse().ok()?;
            Some((offset, page))
        })
        .collect()
}

fn page_for_span(markers: &[(usize, u32)], start: usize, end: usize) -> Option<u32> {
    markers
        .iter()
        .take_while(|(offset, _)| *offset <= start)
        .last()
        .or_else(|| markers.iter().find(|(offset, _)| *offset < end))
        .map(|(_, page)| *page)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_text() -> String {
        (0..60)
            .map(|i| format!("Sentence number {i} talks about hydraulic pumps."))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk("", 100, 10).expect("valid config").is_empty());
        assert!(chunk("  \n ", 100, 10).expect("valid config").is_empty());
    }

    #[test]
    fn short_text_yields_single_chunk() {
        let chunks = chunk("A short note.", 100, 10).expect("valid config");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, "A short note.");
        assert_eq!(chunks[0].overlap, 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(matches!(
            chunk("text", 10, 10),
            Err(PipelineError::InvalidChunkConfig(_))
        ));
        assert!(chunk("text", 0, 0).is_err());
    }

    #[test]
    fn chunks_respect_size_and_sequential_indices() {
        let text = sample_text();
        let chunks = chunk(&text, 200, 40).expect("valid config");
        assert!(chunks.len() > 1);
        for (position, piece) in chunks.iter().enumerate() {
            assert_eq!(piece.index, position as u64);
            assert!(piece.text.chars().count() <= 200);
        }
    }

    #[test]
    fn consecutive_chunks_share_overlap() {
        let text = sample_text();
        let chunks = chunk(&text, 200, 40).expect("valid config");
        for pair in chunks.windows(2) {
            let tail: String = pair[0].text.chars().skip(pair[0].text.chars().count() - 40).collect();
            let head: String = pair[1].text.chars().take(40).collect();
            assert_eq!(tail, head);
        }
    }

    #[test]
    fn round_trip_reconstructs_text() {
        let text = format!("{}\n\n[page 2]\nÜnïcödé tail — with dashes.", sample_text());
        for (size, overlap) in [(50, 0), (50, 10), (120, 119), (200, 40), (1000, 200), (7, 3)] {
            let chunks = chunk(&text, size, overlap).expect("valid config");
            assert_eq!(reconstruct(&chunks), text, "size={size} overlap={overlap}");
        }
    }

    #[test]
    fn normalized_extraction_round_trips() {
        let raw = format!(
            "--- Page 1 ---\nINSTALLATION GUIDE\n{}\n\u{2022} check the seals\n\n\
             --- Page 2 ---\n| part |  torque |\n|bolt|40 Nm|\n\n\n{}\n--- Page 3 ---\n1) tighten\n2) verify",
            "Mount the pump on a level surface. ".repeat(12),
            "Bleed the line before first use. ".repeat(15),
        );
        let text = crate::normalizer::normalize(&raw);
        assert!(text.contains("[page 2]\n| part | torque |"));

        for (size, overlap) in [(60, 0), (80, 25), (200, 40), (1000, 200)] {
            let chunks = chunk(&text, size, overlap).expect("valid config");
            assert_eq!(reconstruct(&chunks), text, "size={size} overlap={overlap}");
            assert_eq!(chunks.first().and_then(|c| c.page), Some(1));
        }
        let small = chunk(&text, 80, 25).expect("valid config");
        assert!(small.iter().any(|c| c.page == Some(2)));
    }

    #[test]
    fn unbroken_text_is_split_hard() {
        let text = "x".repeat(250);
        let chunks = chunk(&text, 100, 20).expect("valid config");
        assert_eq!(chunks[0].text.len(), 100);
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn page_metadata_follows_markers() {
        let text = format!("[page 1]\n{}\n[page 2]\n{}", "a ".repeat(100), "b ".repeat(100));
        let chunks = chunk(&text, 120, 10).expect("valid config");
        assert_eq!(chunks.first().and_then(|c| c.page), Some(1));
        assert_eq!(chunks.last().and_then(|c| c.page), Some(2));
    }

    #[test]
    fn chunk_ids_are_stable() {
        assert_eq!(make_chunk_id("doc", "job", 3), make_chunk_id("doc", "job", 3));
        assert_ne!(make_chunk_id("doc", "job", 3), make_chunk_id("doc", "job", 4));
    }
}
