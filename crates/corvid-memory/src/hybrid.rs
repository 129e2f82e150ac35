//! Hybrid vector + keyword memory store.
//!
//! Recall fuses cosine similarity over embeddings with keyword overlap:
//! `score = α·cosine + (1−α)·keyword`, α = 0.7 by default. A small query
//! embedding cache keeps repeat recalls off the embedding service. Store is
//! append-only and deduplicates exact text per user.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use corvid_core::{CoreError, MemoryBackend, Result};

use crate::embedder::Embedder;

const QUERY_CACHE_MAX: usize = 500;

#[derive(Debug, Clone)]
pub struct HybridMemoryConfig {
    /// Weight of the vector score; the keyword score gets the remainder.
    pub vector_weight: f32,
    /// Entries below this fused score are never recalled.
    pub min_score: f32,
    /// Per-user entry cap; oldest entries fall off.
    pub max_entries_per_user: usize,
}

impl Default for HybridMemoryConfig {
    fn default() -> Self {
        Self {
            vector_weight: corvid_config::constants::memory::VECTOR_WEIGHT,
            min_score: 0.15,
            max_entries_per_user: 2_000,
        }
    }
}

struct Entry {
    text: String,
    embedding: Vec<f32>,
}

/// In-process hybrid store.
pub struct HybridMemory {
    config: HybridMemoryConfig,
    embedder: Arc<dyn Embedder>,
    entries: RwLock<HashMap<String, Vec<Entry>>>,
    query_cache: RwLock<HashMap<String, Vec<f32>>>,
}

impl HybridMemory {
    pub fn new(embedder: Arc<dyn Embedder>, config: HybridMemoryConfig) -> Self {
        Self {
            config,
            embedder,
            entries: RwLock::new(HashMap::new()),
            query_cache: RwLock::new(HashMap::new()),
        }
    }

    async fn query_embedding(&self, query: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.query_cache.read().get(query) {
            return Ok(cached.clone());
        }
        let embedding = self.embedder.embed(query).await?;
        let mut cache = self.query_cache.write();
        if cache.len() >= QUERY_CACHE_MAX {
            cache.clear();
        }
        cache.insert(query.to_string(), embedding.clone());
        Ok(embedding)
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        if a.is_empty() || a.len() != b.len() {
            return 0.0;
        }
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }

    fn tokens(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(String::from)
            .collect()
    }

    /// Fraction of query tokens present in the entry.
    fn keyword_score(query_tokens: &[String], text: &str) -> f32 {
        if query_tokens.is_empty() {
            return 0.0;
        }
        let entry_tokens = Self::tokens(text);
        let hits = query_tokens
            .iter()
            .filter(|t| entry_tokens.contains(t))
            .count();
        hits as f32 / query_tokens.len() as f32
    }

    #[cfg(test)]
    fn entry_count(&self, user: &str) -> usize {
        self.entries.read().get(user).map_or(0, |v| v.len())
    }
}

#[async_trait]
impl MemoryBackend for HybridMemory {
    async fn recall(&self, user: &str, query: &str, k: usize) -> Result<Vec<String>> {
        let query_embedding = self.query_embedding(query).await?;
        let query_tokens = Self::tokens(query);

        let entries = self.entries.read();
        let Some(user_entries) = entries.get(user) else {
            return Ok(Vec::new());
        };

        let alpha = self.config.vector_weight;
        let mut scored: Vec<(f32, &str)> = user_entries
            .iter()
            .map(|entry| {
                let vector = Self::cosine(&query_embedding, &entry.embedding);
                let keyword = Self::keyword_score(&query_tokens, &entry.text);
                (alpha * vector + (1.0 - alpha) * keyword, entry.text.as_str())
            })
            .filter(|(score, _)| *score >= self.config.min_score)
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(_, text)| text.to_string())
            .collect())
    }

    async fn store(&self, user: &str, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CoreError::BadInput("empty memory text".into()));
        }

        {
            let entries = self.entries.read();
            if let Some(user_entries) = entries.get(user) {
                if user_entries.iter().any(|e| e.text == text) {
                    return Ok(());
                }
            }
        }

        let embedding = self.embedder.embed(text).await?;

        let mut entries = self.entries.write();
        let user_entries = entries.entry(user.to_string()).or_default();
        user_entries.push(Entry {
            text: text.to_string(),
            embedding,
        });
        if user_entries.len() > self.config.max_entries_per_user {
            let excess = user_entries.len() - self.config.max_entries_per_user;
            user_entries.drain(..excess);
        }

        tracing::debug!(user = %user, "stored memory entry");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic embedder: character-class histogram, no network.
    struct TestEmbedder;

    #[async_trait]
    impl Embedder for TestEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut v = vec![0.0f32; 26];
            for c in text.to_lowercase().chars() {
                if c.is_ascii_lowercase() {
                    v[(c as u8 - b'a') as usize] += 1.0;
                }
            }
            Ok(v)
        }
    }

    fn store() -> HybridMemory {
        HybridMemory::new(Arc::new(TestEmbedder), HybridMemoryConfig::default())
    }

    #[tokio::test]
    async fn test_store_and_recall() {
        let memory = store();
        memory.store("u1", "the user plays chess on sundays").await.unwrap();
        memory.store("u1", "favourite colour is orange").await.unwrap();

        let recalled = memory.recall("u1", "when does the user play chess", 2).await.unwrap();
        assert!(!recalled.is_empty());
        assert!(recalled[0].contains("chess"));
    }

    #[tokio::test]
    async fn test_recall_isolates_users() {
        let memory = store();
        memory.store("u1", "user one likes sailing").await.unwrap();

        let recalled = memory.recall("u2", "sailing", 3).await.unwrap();
        assert!(recalled.is_empty());
    }

    #[tokio::test]
    async fn test_store_dedupes_exact_text() {
        let memory = store();
        memory.store("u1", "likes sailing boats").await.unwrap();
        memory.store("u1", "likes sailing boats").await.unwrap();
        assert_eq!(memory.entry_count("u1"), 1);
    }

    #[tokio::test]
    async fn test_store_rejects_empty() {
        let memory = store();
        assert!(memory.store("u1", "   ").await.is_err());
    }

    #[test]
    fn test_cosine() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0, 0.0];
        let c = vec![0.0, 1.0];
        assert!((HybridMemory::cosine(&a, &b) - 1.0).abs() < 1e-6);
        assert!(HybridMemory::cosine(&a, &c).abs() < 1e-6);
        assert_eq!(HybridMemory::cosine(&a, &[1.0]), 0.0);
    }

    #[test]
    fn test_keyword_score() {
        let query = HybridMemory::tokens("play chess sundays");
        assert!(HybridMemory::keyword_score(&query, "the user plays chess on sundays") > 0.5);
        assert_eq!(HybridMemory::keyword_score(&query, "unrelated text"), 0.0);
    }
}
