//! Per-document in-memory vector index.
//!
//! A [`VectorIndex`] is built once from a document's chunks and their
//! embeddings and is immutable afterwards. It supports plain cosine
//! similarity search and Maximal Marginal Relevance (MMR) search.
//!
//! # MMR
//!
//! MMR first fetches the `fetch_k` most similar chunks, then greedily picks
//! `k` of them, each time taking the candidate maximising
//!
//! ```text
//! λ · sim(query, c) − (1 − λ) · max sim(c, s) over already selected s
//! ```
//!
//! With `λ = 1` this degenerates to similarity order.

use std::cmp::Ordering;

use crate::embedding::cosine_similarity;
use crate::error::{DocError, Result};
use crate::models::Chunk;

/// A chunk returned by a search, with its cosine similarity to the query.
#[derive(Debug, Clone, Copy)]
pub struct ScoredChunk<'a> {
    pub chunk: &'a Chunk,
    pub score: f32,
}

#[derive(Debug)]
pub struct VectorIndex {
    chunks: Vec<Chunk>,
    vectors: Vec<Vec<f32>>,
    dims: usize,
}

impl VectorIndex {
    /// Build an index from aligned chunks and vectors.
    ///
    /// All-or-nothing: fails without producing a partial index when the
    /// input is empty, the counts differ, or vector dimensions disagree.
    pub fn build(chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>) -> Result<Self> {
        if chunks.is_empty() {
            return Err(DocError::NoChunksProduced);
        }
        if chunks.len() != vectors.len() {
            return Err(DocError::EmbeddingFormat(format!(
                "{} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }
        let dims = vectors[0].len();
        if dims == 0 {
            return Err(DocError::EmbeddingFormat("zero-length vector".to_string()));
        }
        if let Some(bad) = vectors.iter().position(|v| v.len() != dims) {
            return Err(DocError::EmbeddingFormat(format!(
                "vector {} has {} dimensions, expected {}",
                bad,
                vectors[bad].len(),
                dims
            )));
        }
        Ok(Self {
            chunks,
            vectors,
            dims,
        })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Top `k` chunks by cosine similarity, ties broken by `chunk_index`.
    pub fn similarity_search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk<'_>>> {
        let mut ranked = self.rank(query)?;
        ranked.truncate(k);
        Ok(ranked
            .into_iter()
            .map(|(i, score)| ScoredChunk {
                chunk: &self.chunks[i],
                score,
            })
            .collect())
    }

    /// Diversity-aware top `k`; see the module docs.
    pub fn mmr_search(
        &self,
        query: &[f32],
        k: usize,
        fetch_k: usize,
        lambda: f32,
    ) -> Result<Vec<ScoredChunk<'_>>> {
        let mut candidates = self.rank(query)?;
        candidates.truncate(fetch_k.max(k));

        let mut selected: Vec<(usize, f32)> = Vec::with_capacity(k.min(candidates.len()));
        while selected.len() < k && !candidates.is_empty() {
            let mut best = 0usize;
            let mut best_score = f32::NEG_INFINITY;
            for (pos, &(idx, relevance)) in candidates.iter().enumerate() {
                let redundancy = selected
                    .iter()
                    .map(|&(s, _)| cosine_similarity(&self.vectors[idx], &self.vectors[s]))
                    .fold(f32::NEG_INFINITY, f32::max);
                let redundancy = if selected.is_empty() { 0.0 } else { redundancy };
                let score = lambda * relevance - (1.0 - lambda) * redundancy;
                // Strict comparison keeps the earlier, more relevant candidate on ties.
                if score > best_score {
                    best_score = score;
                    best = pos;
                }
            }
            selected.push(candidates.remove(best));
        }

        Ok(selected
            .into_iter()
            .map(|(i, score)| ScoredChunk {
                chunk: &self.chunks[i],
                score,
            })
            .collect())
    }

    /// All entries as `(position, similarity)`, best first.
    fn rank(&self, query: &[f32]) -> Result<Vec<(usize, f32)>> {
        if query.len() != self.dims {
            return Err(DocError::EmbeddingFormat(format!(
                "query has {} dimensions, index has {}",
                query.len(),
                self.dims
            )));
        }
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, cosine_similarity(query, v)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| self.chunks[a.0].chunk_index.cmp(&self.chunks[b.0].chunk_index))
        });
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn chunk(i: usize) -> Chunk {
        Chunk {
            id: format!("c{}", i),
            content: format!("chunk {}", i),
            chunk_index: i,
            metadata: ChunkMetadata {
                document_id: "d".into(),
                user_id: "u".into(),
                filename: "f.txt".into(),
                segment: 0,
            },
        }
    }

    fn index(vectors: Vec<Vec<f32>>) -> VectorIndex {
        let chunks = (0..vectors.len()).map(chunk).collect();
        VectorIndex::build(chunks, vectors).unwrap()
    }

    fn ids(results: &[ScoredChunk<'_>]) -> Vec<usize> {
        results.iter().map(|r| r.chunk.chunk_index).collect()
    }

    #[test]
    fn build_rejects_bad_input() {
        assert!(matches!(
            VectorIndex::build(vec![], vec![]),
            Err(DocError::NoChunksProduced)
        ));
        assert!(matches!(
            VectorIndex::build(vec![chunk(0), chunk(1)], vec![vec![1.0]]),
            Err(DocError::EmbeddingFormat(_))
        ));
        assert!(matches!(
            VectorIndex::build(vec![chunk(0), chunk(1)], vec![vec![1.0], vec![1.0, 0.0]]),
            Err(DocError::EmbeddingFormat(_))
        ));
    }

    #[test]
    fn similarity_orders_by_cosine() {
        let idx = index(vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![0.7, 0.7]]);
        let results = idx.similarity_search(&[1.0, 0.1], 3).unwrap();
        assert_eq!(ids(&results), vec![1, 2, 0]);
        assert!(results[0].score >= results[1].score);
    }

    #[test]
    fn similarity_ties_break_by_chunk_index() {
        let idx = index(vec![vec![1.0, 0.0], vec![1.0, 0.0], vec![1.0, 0.0]]);
        let results = idx.similarity_search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(ids(&results), vec![0, 1]);
    }

    #[test]
    fn k_larger_than_index_returns_everything() {
        let idx = index(vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert_eq!(idx.similarity_search(&[1.0, 0.0], 10).unwrap().len(), 2);
        assert_eq!(idx.mmr_search(&[1.0, 0.0], 10, 40, 0.5).unwrap().len(), 2);
    }

    #[test]
    fn mmr_with_full_relevance_matches_similarity() {
        let idx = index(vec![
            vec![1.0, 0.0, 0.0],
            vec![0.99, 0.1, 0.0],
            vec![0.5, 0.5, 0.5],
            vec![0.0, 1.0, 0.0],
            vec![0.98, 0.0, 0.1],
        ]);
        let q = [1.0, 0.05, 0.0];
        let sim = idx.similarity_search(&q, 4).unwrap();
        let mmr = idx.mmr_search(&q, 4, 5, 1.0).unwrap();
        assert_eq!(ids(&sim), ids(&mmr));
    }

    #[test]
    fn mmr_prefers_diverse_results() {
        // Two near-duplicates and one distinct but relevant chunk.
        let idx = index(vec![vec![1.0, 0.0], vec![0.999, -0.01], vec![0.6, 0.8]]);
        let q = [0.9, 0.3];
        let sim = idx.similarity_search(&q, 2).unwrap();
        assert_eq!(ids(&sim), vec![0, 1]);
        let mmr = idx.mmr_search(&q, 2, 3, 0.5).unwrap();
        assert_eq!(ids(&mmr), vec![0, 2]);
    }

    #[test]
    fn query_dimension_mismatch_is_an_error() {
        let idx = index(vec![vec![1.0, 0.0]]);
        assert!(idx.similarity_search(&[1.0, 0.0, 0.0], 1).is_err());
    }
}
