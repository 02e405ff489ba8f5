//! Adaptive, boundary-aware text chunker.
//!
//! Splits extracted document segments into overlapping [`TextPiece`]s whose
//! size depends on the total document length (see [`ChunkPlan`]).
//!
//! # Algorithm
//!
//! 1. Measure the document in characters and pick a sizing band.
//! 2. Below `min_split_length`, emit every non-blank segment as one chunk.
//! 3. Otherwise clamp `chunk_size` below the document length and the overlap
//!    to a quarter of the chunk size.
//! 4. Walk each segment with a `chunk_size` window. Cut after the last
//!    separator in the window, trying `"\n\n"`, `"\n"`, `". "`, `" "` in
//!    that order, and hard-cut at the window end when none fits.
//! 5. Start the next window at most `chunk_overlap` characters before the
//!    cut, snapped forward to the first whitespace in that overlap region.
//!
//! Pieces are exact slices of their segment, so the non-overlapping parts
//! concatenate back to the original text. Chunks never span two segments.

use uuid::Uuid;

use crate::config::{ChunkBand, ChunkingConfig};
use crate::models::{Chunk, ChunkMetadata};

/// Approximate chars-per-token ratio used for token estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// Boundary separators, strongest first.
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " "];

/// Sizing decision for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub band: String,
    pub total_length: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// `false` when the document is too short to split.
    pub split: bool,
}

/// A slice of one segment, with its character offset inside that segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPiece {
    pub segment: usize,
    pub start: usize,
    pub text: String,
}

/// Total length in characters across all segments.
pub fn char_length(segments: &[String]) -> usize {
    segments.iter().map(|s| s.chars().count()).sum()
}

pub fn estimate_tokens(chars: usize) -> usize {
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// First band whose `below` bound exceeds `total_length`; the unbounded
/// last band catches everything else.
pub fn select_band(total_length: usize, bands: &[ChunkBand]) -> Option<&ChunkBand> {
    bands
        .iter()
        .find(|b| match b.below {
            Some(limit) => total_length < limit,
            None => true,
        })
        .or_else(|| bands.last())
}

impl ChunkPlan {
    pub fn for_length(total_length: usize, config: &ChunkingConfig) -> ChunkPlan {
        let (band, size, overlap) = match select_band(total_length, &config.bands) {
            Some(b) => (b.name.clone(), b.chunk_size, b.chunk_overlap),
            // Unreachable with a validated config.
            None => ("default".to_string(), 1000, 200),
        };

        if total_length < config.min_split_length {
            return ChunkPlan {
                band,
                total_length,
                chunk_size: size,
                chunk_overlap: overlap,
                split: false,
            };
        }

        let chunk_size = size.min(total_length.saturating_sub(1)).max(1);
        let chunk_overlap = overlap.min(chunk_size / 4);
        ChunkPlan {
            band,
            total_length,
            chunk_size,
            chunk_overlap,
            split: true,
        }
    }
}

/// Split `segments` according to `plan`, preserving document order.
pub fn split(segments: &[String], plan: &ChunkPlan) -> Vec<TextPiece> {
    let mut pieces = Vec::new();
    for (segment, text) in segments.iter().enumerate() {
        if text.trim().is_empty() {
            continue;
        }
        if !plan.split {
            pieces.push(TextPiece {
                segment,
                start: 0,
                text: text.clone(),
            });
            continue;
        }
        split_segment(segment, text, plan.chunk_size, plan.chunk_overlap, &mut pieces);
    }
    pieces
}

fn split_segment(
    segment: usize,
    text: &str,
    size: usize,
    overlap: usize,
    out: &mut Vec<TextPiece>,
) {
    // bounds[i] is the byte offset of char i; bounds[n] == text.len().
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let n = bounds.len() - 1;

    let mut start = 0usize;
    while start < n {
        let window_end = (start + size).min(n);
        let cut = if window_end == n {
            n
        } else {
            find_cut(text, &bounds, start, window_end, overlap)
        };

        let piece = &text[bounds[start]..bounds[cut]];
        if !piece.trim().is_empty() {
            out.push(TextPiece {
                segment,
                start,
                text: piece.to_string(),
            });
        }
        if cut >= n {
            break;
        }
        start = next_start(text, &bounds, cut, overlap);
    }
}

/// Char index to cut at: just after the last occurrence of the strongest
/// separator in `[start, window_end)` that still leaves room for progress
/// past the overlap, or `window_end` for a hard cut.
fn find_cut(text: &str, bounds: &[usize], start: usize, window_end: usize, overlap: usize) -> usize {
    let window = &text[bounds[start]..bounds[window_end]];
    for sep in SEPARATORS {
        if let Some(pos) = window.rfind(sep) {
            let cut_byte = bounds[start] + pos + sep.len();
            if let Ok(cut) = bounds.binary_search(&cut_byte) {
                if cut > start + overlap {
                    return cut;
                }
            }
        }
    }
    window_end
}

/// Char index for the next window, at most `overlap` chars before `cut`.
fn next_start(text: &str, bounds: &[usize], cut: usize, overlap: usize) -> usize {
    if overlap == 0 {
        return cut;
    }
    let candidate = cut - overlap;
    text[bounds[candidate]..bounds[cut]]
        .chars()
        .position(char::is_whitespace)
        .map(|p| candidate + p + 1)
        .unwrap_or(candidate)
}

/// Attach provenance and contiguous `chunk_index` values to split pieces.
pub fn into_chunks(
    pieces: Vec<TextPiece>,
    document_id: &str,
    user_id: &str,
    filename: &str,
) -> Vec<Chunk> {
    pieces
        .into_iter()
        .enumerate()
        .map(|(chunk_index, piece)| Chunk {
            id: Uuid::new_v4().to_string(),
            content: piece.text,
            chunk_index,
            metadata: ChunkMetadata {
                document_id: document_id.to_string(),
                user_id: user_id.to_string(),
                filename: filename.to_string(),
                segment: piece.segment,
            },
        })
        .collect()
}
