//! Text embedders.
//!
//! An [`Embedder`] maps text to a fixed-dimensional, L2-normalized vector.
//! The set of embedders is closed and selected by [`EmbedderSpec`]; the
//! same embedder must be used at build and query time, which the index
//! enforces through the [`ModelTag`].

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::Path,
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tantivy::tokenizer::TextAnalyzer;

use crate::{
    error::{Error, Result},
    text_util,
};

pub const DEFAULT_HASHING_DIMENSION: usize = 384;
pub const DEFAULT_TFIDF_FEATURES: usize = 1000;

/// File name of the fitted TF-IDF vocabulary inside an index directory.
pub const VOCABULARY_FILE: &str = "vocabulary.json";
const VOCABULARY_FORMAT_VERSION: u32 = 1;

/// Identifies the embedding space an index was built in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTag {
    pub model_id: String,
    pub dimension: usize,
}

impl fmt::Display for ModelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (dim {})", self.model_id, self.dimension)
    }
}

pub trait Embedder: Send + Sync {
    fn model_id(&self) -> String;

    fn dimension(&self) -> usize;

    /// Embed one text. The result has exactly [`Embedder::dimension`]
    /// entries and unit norm, or is all zeros when the text has no features.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// The configuration this embedder was constructed from.
    fn spec(&self) -> EmbedderSpec;

    /// Write any fitted state next to a persisted index.
    fn save_state(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    fn tag(&self) -> ModelTag {
        ModelTag {
            model_id: self.model_id(),
            dimension: self.dimension(),
        }
    }
}

/// Which embedder to use, parsed from `hashing[:dim]`, `tfidf[:features]`
/// or `colbert[:model]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EmbedderSpec {
    Hashing { dimension: usize },
    Tfidf { max_features: usize },
    Colbert { model: String },
}

impl Default for EmbedderSpec {
    fn default() -> Self {
        Self::Hashing {
            dimension: DEFAULT_HASHING_DIMENSION,
        }
    }
}

impl fmt::Display for EmbedderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hashing { dimension } => write!(f, "hashing:{dimension}"),
            Self::Tfidf { max_features } => write!(f, "tfidf:{max_features}"),
            Self::Colbert { model } => write!(f, "colbert:{model}"),
        }
    }
}

impl FromStr for EmbedderSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, arg) = match s.split_once(':') {
            Some((kind, arg)) => (kind.trim(), Some(arg.trim())),
            None => (s.trim(), None),
        };

        let positive = |arg: &str| -> Result<usize> {
            match arg.parse::<usize>() {
                Ok(n) if n > 0 => Ok(n),
                _ => Err(Error::Config(format!(
                    "embedder size must be a positive integer, got {arg:?}"
                ))),
            }
        };

        match kind.to_ascii_lowercase().as_str() {
            "hashing" => Ok(Self::Hashing {
                dimension: arg
                    .map(positive)
                    .transpose()?
                    .unwrap_or(DEFAULT_HASHING_DIMENSION),
            }),
            "tfidf" => Ok(Self::Tfidf {
                max_features: arg
                    .map(positive)
                    .transpose()?
                    .unwrap_or(DEFAULT_TFIDF_FEATURES),
            }),
            "colbert" => Ok(Self::Colbert {
                model: arg
                    .filter(|m| !m.is_empty())
                    .unwrap_or(DEFAULT_COLBERT_MODEL)
                    .to_string(),
            }),
            other => Err(Error::Config(format!(
                "unknown embedder {other:?} (expected hashing, tfidf or colbert)"
            ))),
        }
    }
}

impl TryFrom<String> for EmbedderSpec {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<EmbedderSpec> for String {
    fn from(spec: EmbedderSpec) -> Self {
        spec.to_string()
    }
}

pub const DEFAULT_COLBERT_MODEL: &str = "lightonai/GTE-ModernColBERT-v1";

impl EmbedderSpec {
    /// Construct the embedder for a new build, fitting it to `corpus` when
    /// the embedder learns from the data.
    pub fn fit(&self, corpus: &[&str]) -> Result<Arc<dyn Embedder>> {
        match self {
            Self::Hashing { dimension } => {
                Ok(Arc::new(HashingEmbedder::new(*dimension)))
            }
            Self::Tfidf { max_features } => {
                Ok(Arc::new(TfidfEmbedder::fit(corpus, *max_features)))
            }
            Self::Colbert { model } => colbert_embedder(model),
        }
    }

    /// Reconstruct the embedder an index in `dir` was built with.
    pub fn open(&self, dir: &Path) -> Result<Arc<dyn Embedder>> {
        match self {
            Self::Tfidf { .. } => {
                Ok(Arc::new(TfidfEmbedder::load(&dir.join(VOCABULARY_FILE))?))
            }
            _ => self.fit(&[]),
        }
    }
}

#[cfg(feature = "colbert")]
fn colbert_embedder(model: &str) -> Result<Arc<dyn Embedder>> {
    Ok(Arc::new(crate::model_manager::ColbertEmbedder::load(model)?))
}

#[cfg(not(feature = "colbert"))]
fn colbert_embedder(_model: &str) -> Result<Arc<dyn Embedder>> {
    Err(Error::Config(
        "the colbert embedder requires building with the `colbert` feature"
            .to_string(),
    ))
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Stemmed unigrams followed by adjacent-pair bigrams.
fn features(analyzer: &TextAnalyzer, text: &str) -> Vec<String> {
    let mut analyzer = analyzer.clone();
    let tokens = text_util::analyze(&mut analyzer, text);
    let bigrams: Vec<String> = tokens
        .windows(2)
        .map(|pair| format!("{} {}", pair[0], pair[1]))
        .collect();
    let mut features = tokens;
    features.extend(bigrams);
    features
}

fn term_counts(features: Vec<String>) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for feature in features {
        *counts.entry(feature).or_insert(0) += 1;
    }
    counts
}

/// Signed feature hashing of analyzed unigrams and bigrams.
///
/// Needs no fitting, so any corpus and any query land in the same space.
pub struct HashingEmbedder {
    dimension: usize,
    analyzer: TextAnalyzer,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            analyzer: text_util::analyzer(),
        }
    }
}

impl Embedder for HashingEmbedder {
    fn model_id(&self) -> String {
        format!("hashing-v1-{}", self.dimension)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        if self.dimension == 0 {
            return Ok(vector);
        }

        for (feature, count) in term_counts(features(&self.analyzer, text)) {
            let hash = blake3::hash(feature.as_bytes());
            let mut head = [0u8; 8];
            head.copy_from_slice(&hash.as_bytes()[..8]);
            let h = u64::from_le_bytes(head);

            let index = (h % self.dimension as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign * (1.0 + (count as f32).ln());
        }

        l2_normalize(&mut vector);
        Ok(vector)
    }

    fn spec(&self) -> EmbedderSpec {
        EmbedderSpec::Hashing {
            dimension: self.dimension,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct VocabularyFile {
    format_version: u32,
    max_features: usize,
    terms: Vec<String>,
    idf: Vec<f32>,
}

/// TF-IDF over a vocabulary fitted to the indexed chunks.
pub struct TfidfEmbedder {
    max_features: usize,
    /// Term -> column, columns assigned in alphabetical term order.
    vocabulary: BTreeMap<String, usize>,
    idf: Vec<f32>,
    fingerprint: String,
    analyzer: TextAnalyzer,
}

impl TfidfEmbedder {
    /// Fit a vocabulary of at most `max_features` terms over `corpus`.
    ///
    /// Terms are ranked by total corpus frequency, ties broken
    /// alphabetically. IDF is smoothed: `ln((1 + n) / (1 + df)) + 1`.
    pub fn fit(corpus: &[&str], max_features: usize) -> Self {
        let analyzer = text_util::analyzer();
        let mut frequency: HashMap<String, u64> = HashMap::new();
        let mut document_frequency: HashMap<String, u64> = HashMap::new();

        for text in corpus {
            for (term, count) in term_counts(features(&analyzer, text)) {
                *frequency.entry(term.clone()).or_insert(0) += count as u64;
                *document_frequency.entry(term).or_insert(0) += 1;
            }
        }

        let mut ranked: Vec<(String, u64)> = frequency.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(max_features);

        let mut terms: Vec<String> =
            ranked.into_iter().map(|(term, _)| term).collect();
        terms.sort();

        let n = corpus.len() as f32;
        let idf = terms
            .iter()
            .map(|term| {
                let df = document_frequency.get(term).copied().unwrap_or(0);
                ((1.0 + n) / (1.0 + df as f32)).ln() + 1.0
            })
            .collect();

        Self::from_parts(max_features, terms, idf, analyzer)
    }

    fn from_parts(
        max_features: usize,
        terms: Vec<String>,
        idf: Vec<f32>,
        analyzer: TextAnalyzer,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        for (term, weight) in terms.iter().zip(&idf) {
            hasher.update(term.as_bytes());
            hasher.update(&[0]);
            hasher.update(&weight.to_le_bytes());
        }
        let fingerprint = hasher.finalize().to_hex()[..16].to_string();

        let vocabulary = terms
            .into_iter()
            .enumerate()
            .map(|(column, term)| (term, column))
            .collect();

        Self {
            max_features,
            vocabulary,
            idf,
            fingerprint,
            analyzer,
        }
    }

    /// Load a fitted vocabulary written by [`Embedder::save_state`].
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::IndexFormat(format!(
                "cannot read vocabulary {}: {e}",
                path.display()
            ))
        })?;
        let file: VocabularyFile = serde_json::from_str(&contents)?;

        if file.format_version != VOCABULARY_FORMAT_VERSION {
            return Err(Error::IndexFormat(format!(
                "unsupported vocabulary format version {}",
                file.format_version
            )));
        }
        if file.terms.len() != file.idf.len() {
            return Err(Error::IndexFormat(format!(
                "vocabulary has {} terms but {} idf weights",
                file.terms.len(),
                file.idf.len()
            )));
        }

        Ok(Self::from_parts(
            file.max_features,
            file.terms,
            file.idf,
            text_util::analyzer(),
        ))
    }
}

impl Embedder for TfidfEmbedder {
    fn model_id(&self) -> String {
        format!("tfidf-v1-{}", self.fingerprint)
    }

    fn dimension(&self) -> usize {
        self.vocabulary.len()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.vocabulary.len()];
        for (term, count) in term_counts(features(&self.analyzer, text)) {
            if let Some(&column) = self.vocabulary.get(&term) {
                vector[column] = count as f32 * self.idf[column];
            }
        }
        l2_normalize(&mut vector);
        Ok(vector)
    }

    fn spec(&self) -> EmbedderSpec {
        EmbedderSpec::Tfidf {
            max_features: self.max_features,
        }
    }

    fn save_state(&self, dir: &Path) -> Result<()> {
        let file = VocabularyFile {
            format_version: VOCABULARY_FORMAT_VERSION,
            max_features: self.max_features,
            terms: self.vocabulary.keys().cloned().collect(),
            idf: self.idf.clone(),
        };
        std::fs::write(
            dir.join(VOCABULARY_FILE),
            serde_json::to_vec_pretty(&file)?,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn spec_parsing() {
        assert_eq!(
            "hashing".parse::<EmbedderSpec>().unwrap(),
            EmbedderSpec::Hashing { dimension: 384 }
        );
        assert_eq!(
            "hashing:64".parse::<EmbedderSpec>().unwrap(),
            EmbedderSpec::Hashing { dimension: 64 }
        );
        assert_eq!(
            "TFIDF:200".parse::<EmbedderSpec>().unwrap(),
            EmbedderSpec::Tfidf { max_features: 200 }
        );
        assert_eq!(
            "colbert".parse::<EmbedderSpec>().unwrap(),
            EmbedderSpec::Colbert {
                model: DEFAULT_COLBERT_MODEL.to_string()
            }
        );
        assert!("hashing:0".parse::<EmbedderSpec>().is_err());
        assert!("word2vec".parse::<EmbedderSpec>().is_err());
    }

    #[test]
    fn spec_display_parses_back() {
        let spec = EmbedderSpec::Tfidf { max_features: 42 };
        assert_eq!(spec.to_string().parse::<EmbedderSpec>().unwrap(), spec);
    }

    #[test]
    fn spec_serializes_as_string() {
        let json = serde_json::to_string(&EmbedderSpec::default()).unwrap();
        assert_eq!(json, "\"hashing:384\"");
        let back: EmbedderSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EmbedderSpec::default());
    }

    #[test]
    fn hashing_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(128);
        let a = embedder.embed("Metformin is first-line therapy").unwrap();
        let b = embedder.embed("Metformin is first-line therapy").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
        assert!((norm(&a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashing_related_texts_score_higher() {
        let embedder = HashingEmbedder::new(384);
        let query = embedder.embed("metformin for type 2 diabetes").unwrap();
        let related = embedder
            .embed("Metformin is the first-line drug in type 2 diabetes.")
            .unwrap();
        let unrelated = embedder
            .embed("Fractures of the distal radius need casting.")
            .unwrap();
        assert!(cosine(&query, &related) > cosine(&query, &unrelated));
    }

    #[test]
    fn hashing_empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(16);
        let v = embedder.embed("the of and").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn hashing_model_id_includes_dimension() {
        let embedder = HashingEmbedder::new(64);
        assert_eq!(
            embedder.tag(),
            ModelTag {
                model_id: "hashing-v1-64".to_string(),
                dimension: 64
            }
        );
    }

    #[test]
    fn tfidf_limits_vocabulary() {
        let corpus = [
            "insulin insulin insulin glucose",
            "insulin glucose ketones",
            "aspirin",
        ];
        let embedder = TfidfEmbedder::fit(&corpus, 2);
        assert_eq!(embedder.dimension(), 2);
        assert!(embedder.vocabulary.contains_key("insulin"));
        assert!(embedder.vocabulary.contains_key("glucos"));
    }

    #[test]
    fn tfidf_rare_terms_weigh_more() {
        let corpus = ["heart failure", "heart attack", "heart valve"];
        let embedder = TfidfEmbedder::fit(&corpus, 100);
        let v = embedder.embed("heart failure").unwrap();
        let heart = v[embedder.vocabulary["heart"]];
        let failure = v[embedder.vocabulary["failur"]];
        assert!(failure > heart);
    }

    #[test]
    fn tfidf_unknown_terms_give_zero_vector() {
        let embedder = TfidfEmbedder::fit(&["renal dosing"], 10);
        let v = embedder.embed("ophthalmology").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn tfidf_save_and_load_preserve_embeddings() {
        let tmp = tempfile::tempdir().unwrap();
        let corpus = ["beta blockers lower heart rate", "ACE inhibitors"];
        let fitted = TfidfEmbedder::fit(&corpus, 50);
        fitted.save_state(tmp.path()).unwrap();

        let loaded = TfidfEmbedder::load(&tmp.path().join(VOCABULARY_FILE))
            .unwrap();
        assert_eq!(loaded.tag(), fitted.tag());
        assert_eq!(
            loaded.embed("heart rate").unwrap(),
            fitted.embed("heart rate").unwrap()
        );
    }

    #[test]
    fn tfidf_rejects_unknown_version() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(VOCABULARY_FILE);
        std::fs::write(
            &path,
            r#"{"format_version":99,"max_features":1,"terms":[],"idf":[]}"#,
        )
        .unwrap();
        assert!(matches!(
            TfidfEmbedder::load(&path),
            Err(Error::IndexFormat(_))
        ));
    }

    #[test]
    fn tfidf_fingerprint_tracks_vocabulary() {
        let a = TfidfEmbedder::fit(&["sepsis bundle"], 10);
        let b = TfidfEmbedder::fit(&["stroke thrombolysis"], 10);
        assert_ne!(a.model_id(), b.model_id());
        assert!(a.model_id().starts_with("tfidf-v1-"));
    }

    #[test]
    fn l2_normalize_leaves_zero_vector() {
        let mut v = vec![0.0; 4];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0; 4]);

        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.6, 0.8]);
    }
}
