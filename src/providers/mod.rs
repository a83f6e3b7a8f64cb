//! External model providers.
//!
//! - [`catalog`]: model-name parsing and scored selection
//! - [`protocol`]: OpenAI-like and Ollama-like HTTP clients
//! - [`registry`]: persisted providers with cached clients
//! - [`heartbeat`]: periodic probing and model choice
//! - [`metrics`]: per-request statistics and derived scores
//! - [`query`]: the chat completion activity

pub mod catalog;
pub mod heartbeat;
pub mod metrics;
pub mod protocol;
pub mod query;
pub mod registry;

pub use catalog::{ModelCatalog, ModelSpec};
pub use heartbeat::{ModelChoice, ProviderHeartbeat, choose_model};
pub use metrics::ProviderMetrics;
pub use protocol::{Candidate, ChatMessage, ChatRequest, ChatResponse, ProtocolClient, build_candidates};
pub use query::{ProviderQueryActivity, QueryInput, QueryOutput};
pub use registry::ProviderRegistry;
