use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::{
    chunking::ChunkingConfig,
    data_dir::DataDir,
    embedding::EmbedderSpec,
    error::{Error, Result},
    generation::GenerationConfig,
};

pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Results scoring below this are dropped.
    pub min_score: Option<f32>,
    pub timeout: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            min_score: None,
            timeout: DEFAULT_RETRIEVAL_TIMEOUT,
        }
    }
}

/// Runtime configuration.
///
/// Resolved from `MEDRAG_*` environment variables over built-in defaults;
/// command-line flags are applied on top by the caller.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Explicit index location; defaults to `index/` in the data directory.
    pub index_dir: Option<PathBuf>,
    pub embedder: EmbedderSpec,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub generation: GenerationConfig,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which maps a variable name to
    /// its value. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(dir) = get("MEDRAG_INDEX_DIR") {
            config.index_dir = Some(PathBuf::from(dir));
        }
        if let Some(spec) = get("MEDRAG_EMBEDDER") {
            config.embedder = spec.parse()?;
        }

        if let Some(v) = parsed(&get, "MEDRAG_TARGET_WORDS")? {
            config.chunking.target_words = v;
        }
        if let Some(v) = parsed(&get, "MEDRAG_OVERLAP_WORDS")? {
            config.chunking.overlap_words = v;
        }
        config.chunking.validate()?;

        if let Some(v) = parsed(&get, "MEDRAG_TOP_K")? {
            config.retrieval.top_k = v;
        }
        config.retrieval.min_score = parsed(&get, "MEDRAG_MIN_SCORE")?;
        if let Some(timeout) = seconds(&get, "MEDRAG_RETRIEVAL_TIMEOUT_SECS")? {
            config.retrieval.timeout = timeout;
        }

        let generation = &mut config.generation;
        if let Some(timeout) = seconds(&get, "MEDRAG_GENERATION_TIMEOUT_SECS")? {
            generation.generation_timeout = timeout;
        }
        if let Some(timeout) = seconds(&get, "MEDRAG_PROBE_TIMEOUT_SECS")? {
            generation.probe_timeout = timeout;
        }
        if let Some(url) = get("MEDRAG_HOSTED_URL") {
            generation.hosted_url = url;
        }
        if let Some(model) = get("MEDRAG_HOSTED_MODEL") {
            generation.hosted_model = model;
        }
        generation.api_key = get("MEDRAG_API_KEY").or_else(|| get("GROQ_API_KEY"));
        if let Some(url) = get("MEDRAG_LOCAL_URL") {
            generation.local_url = url;
        }
        generation.local_model = get("MEDRAG_LOCAL_MODEL");
        if let Some(t) = parsed(&get, "MEDRAG_TEMPERATURE")? {
            generation.decoding.temperature = t;
        }
        generation.decoding.max_tokens = parsed(&get, "MEDRAG_MAX_TOKENS")?;

        Ok(config)
    }

    /// Where the index lives: the explicit location, else `index/` under
    /// the data directory.
    pub fn index_dir(&self, data_dir: &DataDir) -> PathBuf {
        self.index_dir
            .clone()
            .unwrap_or_else(|| data_dir.index_dir())
    }
}

fn parsed<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|v| {
            v.trim().parse::<T>().map_err(|e| {
                Error::Config(format!("invalid value {v:?} for {key}: {e}"))
            })
        })
        .transpose()
}

fn seconds<G>(get: &G, key: &str) -> Result<Option<Duration>>
where
    G: Fn(&str) -> Option<String>,
{
    parsed::<f64, G>(get, key)?
        .map(|secs| {
            Duration::try_from_secs_f64(secs).map_err(|e| {
                Error::Config(format!("invalid duration {secs} for {key}: {e}"))
            })
        })
        .transpose()
}
