//! Lessons learned per project, ranked by age and embedding similarity.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::KnowledgeConfig;
use crate::db::Database;
use crate::error::KnowledgeError;
use crate::model::Lesson;

pub const DEFAULT_LESSON_LIMIT: usize = 20;
pub const DEFAULT_TOP_K: usize = 5;
/// Candidates read for a similarity search.
pub const SIMILARITY_CANDIDATES: usize = 200;
/// Similarity assigned to lessons stored without an embedding.
pub const MISSING_EMBEDDING_SIMILARITY: f64 = 0.1;

/// A lesson with its ranking score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredLesson {
    pub lesson: Lesson,
    pub score: f64,
}

/// Pack a vector as little-endian `f32`s.
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`encode_embedding`].
pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>, KnowledgeError> {
    if bytes.len() % 4 != 0 {
        return Err(KnowledgeError::CorruptEmbedding { len: bytes.len() });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Cosine similarity; zero for empty, zero-norm, or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// `score * 0.5^(age_days / half_life_days)`. Future timestamps do not decay.
pub fn time_decay(score: f64, created_at: DateTime<Utc>, now: DateTime<Utc>, half_life_days: f64) -> f64 {
    let age_days = ((now - created_at).num_seconds().max(0) as f64) / 86_400.0;
    score * 0.5f64.powf(age_days / half_life_days)
}

pub struct LessonStore {
    db: Arc<dyn Database>,
    config: KnowledgeConfig,
}

impl LessonStore {
    pub fn new(db: Arc<dyn Database>, config: KnowledgeConfig) -> Self {
        Self { db, config }
    }

    pub async fn record(&self, lesson: &Lesson) -> Result<(), KnowledgeError> {
        if lesson.project_id.is_empty() || lesson.title.is_empty() {
            return Err(KnowledgeError::InvalidArgument(
                "lesson needs a project_id and a title".to_string(),
            ));
        }
        if let Some(bytes) = &lesson.embedding {
            decode_embedding(bytes)?;
        }
        self.db.insert_lesson(lesson).await?;
        tracing::debug!(project_id = %lesson.project_id, category = %lesson.category, "Lesson recorded");
        Ok(())
    }

    /// Most recent lessons with decayed scores, newest first.
    ///
    /// When `max_chars > 0`, stops before the lesson whose detail would push
    /// the running total past `max_chars`.
    pub async fn lessons_for_project(
        &self,
        project_id: &str,
        limit: usize,
        max_chars: usize,
    ) -> Result<Vec<ScoredLesson>, KnowledgeError> {
        let limit = if limit == 0 { DEFAULT_LESSON_LIMIT } else { limit };
        let now = Utc::now();
        let lessons = self.db.recent_lessons(project_id, limit).await?;

        let mut out = Vec::with_capacity(lessons.len());
        let mut chars = 0usize;
        for lesson in lessons {
            chars += lesson.detail.chars().count();
            if max_chars > 0 && chars > max_chars {
                break;
            }
            let score = time_decay(lesson.relevance_score, lesson.created_at, now, self.config.half_life_days);
            out.push(ScoredLesson { lesson, score });
        }
        Ok(out)
    }

    /// Rank recent lessons by blended recency and similarity to `query`.
    pub async fn search_by_similarity(
        &self,
        project_id: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredLesson>, KnowledgeError> {
        let top_k = if top_k == 0 { DEFAULT_TOP_K } else { top_k };
        let now = Utc::now();
        let lessons = self.db.recent_lessons(project_id, SIMILARITY_CANDIDATES).await?;

        let mut scored: Vec<ScoredLesson> = lessons
            .into_iter()
            .map(|lesson| {
                let similarity = match lesson.embedding.as_deref().map(decode_embedding) {
                    Some(Ok(vector)) => cosine_similarity(query, &vector),
                    Some(Err(e)) => {
                        tracing::warn!(lesson_id = %lesson.id, error = %e, "Ignoring corrupt lesson embedding");
                        MISSING_EMBEDDING_SIMILARITY
                    }
                    None => MISSING_EMBEDDING_SIMILARITY,
                };
                let relevance =
                    time_decay(lesson.relevance_score, lesson.created_at, now, self.config.half_life_days);
                let score = self.config.relevance_weight * relevance + self.config.similarity_weight * similarity;
                ScoredLesson { lesson, score }
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    #[test]
    fn test_embedding_roundtrip_and_corruption() {
        let v = vec![0.25f32, -1.5, 3.0e-7, f32::MAX];
        assert_eq!(decode_embedding(&encode_embedding(&v)).unwrap(), v);
        assert!(decode_embedding(&[]).unwrap().is_empty());
        assert!(matches!(
            decode_embedding(&[1, 2, 3]),
            Err(KnowledgeError::CorruptEmbedding { len: 3 })
        ));
    }

    #[test]
    fn test_cosine_is_scale_invariant() {
        let a = [1.0f32, 2.0, 3.0];
        let b = [3.0f32, 1.0, 0.5];
        let scaled: Vec<f32> = b.iter().map(|x| x * 42.0).collect();
        assert!((cosine_similarity(&a, &b) - cosine_similarity(&a, &scaled)).abs() < 1e-9);
        assert_eq!(cosine_similarity(&a, &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_decay_halves_each_half_life() {
        let now = Utc::now();
        let week_ago = now - chrono::Duration::days(7);
        assert!((time_decay(1.0, week_ago, now, 7.0) - 0.5).abs() < 1e-9);
        assert!(time_decay(1.0, now, now, 7.0) >= time_decay(1.0, week_ago, now, 7.0));
    }

    #[tokio::test]
    async fn test_similarity_prefers_close_embeddings() {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let store = LessonStore::new(db, KnowledgeConfig::default());

        let mut close = Lesson::new("p1", "build", "Use cargo nextest", "Faster test runs.");
        close.embedding = Some(encode_embedding(&[1.0, 0.0]));
        let mut far = Lesson::new("p1", "build", "Pin toolchain", "Avoid drift.");
        far.embedding = Some(encode_embedding(&[0.0, 1.0]));
        let plain = Lesson::new("p1", "misc", "No vector", "Still listed.");
        for lesson in [&close, &far, &plain] {
            store.record(lesson).await.unwrap();
        }

        let ranked = store.search_by_similarity("p1", &[1.0, 0.05], 2).await.unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].lesson.id, close.id);
        assert_eq!(ranked[1].lesson.id, plain.id);
    }

    #[tokio::test]
    async fn test_char_budget_truncates() {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let store = LessonStore::new(db, KnowledgeConfig::default());
        for i in 0..3 {
            store
                .record(&Lesson::new("p1", "misc", format!("L{}", i), "0123456789"))
                .await
                .unwrap();
        }
        assert_eq!(store.lessons_for_project("p1", 0, 25).await.unwrap().len(), 2);
        assert_eq!(store.lessons_for_project("p1", 0, 0).await.unwrap().len(), 3);
    }
}
