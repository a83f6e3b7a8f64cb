//! Project-scoped knowledge used to enrich agent context.
//!
//! - **Project memory**: structured facts keyed by `(category, key)`
//! - **Lessons**: free-text advice, ranked by recency decay and, when an
//!   embedding is stored, cosine similarity to a query vector

mod lessons;
mod memory;

pub use lessons::{
    DEFAULT_LESSON_LIMIT, DEFAULT_TOP_K, LessonStore, ScoredLesson, cosine_similarity,
    decode_embedding, encode_embedding, time_decay,
};
pub use memory::{ProjectMemory, SUMMARY_CATEGORY_ORDER};
