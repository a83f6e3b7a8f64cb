//! Model catalog: name parsing, scoring, and best-model selection.

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

static SIZE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?i)(\d+(?:\.\d+)?)b$").expect("valid size pattern"));
static ACTIVE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?i)a(\d+(?:\.\d+)?)b$").expect("valid active pattern"));

const PRECISIONS: &[&str] = &["FP32", "FP16", "BF16", "FP8", "FP4", "NVFP4", "INT8", "INT4", "AWQ", "GPTQ"];

/// Facts recovered from a model identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub vendor: Option<String>,
    pub family: String,
    pub total_params_b: f64,
    pub active_params_b: Option<f64>,
    pub precision: Option<String>,
    pub instruct: bool,
}

/// Parse a name such as `Qwen/Qwen3-Coder-30B-A3B-Instruct`.
///
/// Ollama-style tags (`qwen2.5-coder:7b`) are read the same way with `:`
/// treated as a separator.
pub fn parse(model_name: &str) -> ModelSpec {
    let (vendor, base) = match model_name.split_once('/') {
        Some((v, rest)) if !v.is_empty() => (Some(v.to_string()), rest),
        _ => (None, model_name),
    };
    let tokens: Vec<&str> = base.split(['-', ':', '_']).filter(|t| !t.is_empty()).collect();

    let mut spec = ModelSpec {
        vendor,
        ..ModelSpec::default()
    };
    let mut family_end = tokens.len();
    for (i, token) in tokens.iter().enumerate() {
        if let Some(caps) = ACTIVE_TOKEN.captures(token) {
            spec.active_params_b = caps[1].parse().ok();
            continue;
        }
        if spec.total_params_b == 0.0
            && let Some(caps) = SIZE_TOKEN.captures(token)
        {
            spec.total_params_b = caps[1].parse().unwrap_or(0.0);
            family_end = family_end.min(i);
            continue;
        }
        let upper = token.to_ascii_uppercase();
        if PRECISIONS.contains(&upper.as_str()) {
            spec.precision = Some(upper);
        } else if upper == "INSTRUCT" {
            spec.instruct = true;
        }
    }
    spec.family = tokens[..family_end].join("-");
    spec
}

/// How responsive a model is in interactive use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interactivity {
    Fast,
    Medium,
    Slow,
}

impl Interactivity {
    pub fn bonus(&self) -> f64 {
        match self {
            Interactivity::Fast => 10.0,
            Interactivity::Medium => 5.0,
            Interactivity::Slow => -5.0,
        }
    }
}

/// A known model with its scoring inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub interactivity: Interactivity,
    pub total_params_b: f64,
    /// Catalog order; lower is preferred.
    pub rank: u32,
}

impl CatalogEntry {
    pub fn new(name: &str, interactivity: Interactivity, total_params_b: f64, rank: u32) -> Self {
        Self {
            name: name.to_string(),
            interactivity,
            total_params_b,
            rank,
        }
    }

    /// `100 + interactivity bonus - 10·log10(1 + size) - rank`.
    pub fn score(&self) -> f64 {
        100.0 + self.interactivity.bonus()
            - (1.0 + self.total_params_b.max(0.0)).log10() * 10.0
            - f64::from(self.rank)
    }

    /// Ordering used to pick the best entry: score, then interactivity,
    /// then smaller size, then lower rank.
    fn preference(&self, other: &Self) -> Ordering {
        self.score()
            .total_cmp(&other.score())
            .then(self.interactivity.bonus().total_cmp(&other.interactivity.bonus()))
            .then(other.total_params_b.total_cmp(&self.total_params_b))
            .then(other.rank.cmp(&self.rank))
    }
}

/// Result of a catalog selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// The name as the endpoint serves it.
    pub model: String,
    /// The catalog's canonical name.
    pub canonical: String,
    pub score: f64,
}

/// Scored list of known models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCatalog {
    entries: Vec<CatalogEntry>,
}

impl ModelCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Result<Self, ProviderError> {
        let catalog = Self { entries };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a catalog from a JSON array of entries.
    pub fn from_json(raw: &str) -> Result<Self, ProviderError> {
        let entries: Option<Vec<CatalogEntry>> =
            serde_json::from_str(raw).map_err(|e| ProviderError::InvalidCatalog(e.to_string()))?;
        match entries {
            Some(entries) => Self::new(entries),
            None => Err(ProviderError::InvalidCatalog("catalog is null".to_string())),
        }
    }

    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.entries.is_empty() {
            return Err(ProviderError::InvalidCatalog("catalog is empty".to_string()));
        }
        if let Some(pos) = self.entries.iter().position(|e| e.name.trim().is_empty()) {
            return Err(ProviderError::InvalidCatalog(format!(
                "entry {} has no name",
                pos
            )));
        }
        Ok(())
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    fn lookup(&self, available: &str) -> Option<&CatalogEntry> {
        let wanted = available.trim().to_lowercase();
        let wanted_base = strip_vendor(&wanted);
        self.entries.iter().find(|e| {
            let name = e.name.to_lowercase();
            name == wanted || strip_vendor(&name) == wanted_base
        })
    }

    /// Highest-scoring catalog model among `available`, if any is known.
    pub fn select_best(&self, available: &[String]) -> Option<Selection> {
        available
            .iter()
            .filter_map(|name| self.lookup(name).map(|entry| (name, entry)))
            .max_by(|(_, a), (_, b)| a.preference(b))
            .map(|(name, entry)| Selection {
                model: name.clone(),
                canonical: entry.name.clone(),
                score: entry.score(),
            })
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self {
            entries: vec![
                CatalogEntry::new("nvidia/NVIDIA-Nemotron-3-Nano-30B-A3B-FP8", Interactivity::Medium, 30.0, 1),
                CatalogEntry::new("Qwen/Qwen3-Coder-30B-A3B-Instruct", Interactivity::Fast, 30.0, 2),
                CatalogEntry::new("Qwen/Qwen2.5-Coder-32B-Instruct", Interactivity::Medium, 32.0, 3),
                CatalogEntry::new("meta-llama/Llama-3.3-70B-Instruct", Interactivity::Slow, 70.0, 4),
                CatalogEntry::new("Qwen2.5-Coder-7B-Instruct", Interactivity::Fast, 7.0, 5),
                CatalogEntry::new("meta-llama/Llama-3.1-8B-Instruct", Interactivity::Fast, 8.0, 6),
                CatalogEntry::new("qwen2.5-coder:7b", Interactivity::Fast, 7.0, 7),
                CatalogEntry::new("llama3.1:8b", Interactivity::Fast, 8.0, 8),
            ],
        }
    }
}

fn strip_vendor(name: &str) -> &str {
    name.split_once('/').map(|(_, rest)| rest).unwrap_or(name)
}
