//! Semantic embedding service (spec §4.3, component C3).
//!
//! Grounded on `original_source`'s `SemanticEmbeddingService`: a lazily
//! loaded model behind a lock, a model-swap `configure()` that invalidates
//! the handle rather than reloading eagerly, and an exact text-composition
//! rule for what goes into an embedding (and what is deliberately excluded —
//! prices flatten similarity without adding signal).

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::RwLock;

use crate::models::CatalogAttributes;

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub model_id: String,
    pub max_length: usize,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_id: "paraphrase-multilingual-mpnet-base-v2".to_string(),
            max_length: 256,
            batch_size: 32,
        }
    }
}

/// Fields feeding `compose_entry_text`; anything absent is skipped rather
/// than inserted as an empty segment.
#[derive(Debug, Clone, Default)]
pub struct CatalogEntryText<'a> {
    pub item_code: Option<&'a str>,
    pub item_description: Option<&'a str>,
    pub wbs6_description: Option<&'a str>,
    pub wbs7_description: Option<&'a str>,
    pub price_list_labels: Vec<&'a str>,
}

struct ModelHandle {
    model_id: String,
    embedder: fastembed::TextEmbedding,
}

struct EmbeddingState {
    config: EmbeddingConfig,
    handle: Option<ModelHandle>,
}

/// Thread-safe wrapper around a swappable `fastembed` model. Swapping
/// `model_id` drops the old handle on next use rather than reloading inline,
/// so a `configure()` call returns immediately and the reload cost is paid
/// by whichever caller next needs a vector.
pub struct EmbeddingService {
    state: RwLock<EmbeddingState>,
}

impl EmbeddingService {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            state: RwLock::new(EmbeddingState { config, handle: None }),
        }
    }

    pub fn model_id(&self) -> String {
        self.state.read().unwrap().config.model_id.clone()
    }

    /// Any field left `None` keeps its current value. Changing anything
    /// invalidates the cached model handle.
    pub fn configure(
        &self,
        model_id: Option<String>,
        max_length: Option<usize>,
        batch_size: Option<usize>,
    ) {
        let mut state = self.state.write().unwrap();
        let mut changed = false;
        if let Some(id) = model_id {
            if id != state.config.model_id {
                state.config.model_id = id;
                changed = true;
            }
        }
        if let Some(len) = max_length {
            if len != state.config.max_length {
                state.config.max_length = len;
                changed = true;
            }
        }
        if let Some(size) = batch_size {
            if size != state.config.batch_size {
                state.config.batch_size = size;
                changed = true;
            }
        }
        if changed {
            state.handle = None;
        }
    }

    fn ensure_model(&self) -> anyhow::Result<()> {
        {
            let state = self.state.read().unwrap();
            if let Some(handle) = &state.handle {
                if handle.model_id == state.config.model_id {
                    return Ok(());
                }
            }
        }
        let mut state = self.state.write().unwrap();
        if let Some(handle) = &state.handle {
            if handle.model_id == state.config.model_id {
                return Ok(());
            }
        }
        let model_id = state.config.model_id.clone();
        let embedder = fastembed::TextEmbedding::try_new(fastembed::InitOptions::default())
            .map_err(|e| anyhow::anyhow!("impossibile caricare il modello {model_id}: {e}"))?;
        state.handle = Some(ModelHandle { model_id, embedder });
        Ok(())
    }

    /// Embeddings are L2-normalized so cosine similarity reduces to a dot
    /// product at search time (matches the teacher's `normalize_embeddings=True`).
    pub fn embed_texts(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_model()?;
        let batch_size = {
            let state = self.state.read().unwrap();
            state.config.batch_size
        };
        let mut state = self.state.write().unwrap();
        let handle = state
            .handle
            .as_mut()
            .expect("ensure_model just populated the handle");
        let raw = handle
            .embedder
            .embed(texts.to_vec(), Some(batch_size))
            .map_err(|e| anyhow::anyhow!("embedding fallito: {e}"))?;
        Ok(raw.into_iter().map(|v| l2_normalize(&v)).collect())
    }

    pub fn embed_text(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let vectors = self.embed_texts(std::slice::from_ref(&text.to_string()))?;
        Ok(vectors.into_iter().next().unwrap_or_default())
    }
}

fn l2_normalize(vector: &[f32]) -> Vec<f32> {
    let norm = (vector.iter().map(|v| v * v).sum::<f32>()).sqrt();
    if norm < 1e-9 {
        return vector.to_vec();
    }
    vector.iter().map(|v| v / norm).collect()
}

/// Code, description, WBS6/7 descriptions, then the sorted-unique set of
/// price-list labels — joined with " • ". Numeric prices are never included:
/// they flatten similarity across unrelated items without adding signal.
pub fn compose_entry_text(entry: &CatalogEntryText<'_>) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(code) = entry.item_code {
        if !code.trim().is_empty() {
            parts.push(code.trim().to_string());
        }
    }
    if let Some(description) = entry.item_description {
        if !description.trim().is_empty() {
            parts.push(description.trim().to_string());
        }
    }
    if let Some(wbs6) = entry.wbs6_description {
        if !wbs6.trim().is_empty() {
            parts.push(wbs6.trim().to_string());
        }
    }
    if let Some(wbs7) = entry.wbs7_description {
        if !wbs7.trim().is_empty() {
            parts.push(wbs7.trim().to_string());
        }
    }
    let labels: BTreeSet<&str> = entry
        .price_list_labels
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .copied()
        .collect();
    if !labels.is_empty() {
        parts.push(labels.into_iter().collect::<Vec<_>>().join(" "));
    }
    parts.join(" • ")
}

static LASTRE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(\d+)\s*lastr[ae]").unwrap(),
        Regex::new(r"lastr[ae]\s*[xX×]\s*(\d+)").unwrap(),
        Regex::new(r"(\d+)\s*x\s*lastr").unwrap(),
    ]
});
static SPESSORE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:[.,]\d+)?)\s*(mm|cm)\s*(?:di\s+)?spessore|spessore\s*(?:di|:)?\s*(\d+(?:[.,]\d+)?)\s*(mm|cm)").unwrap());
static MONTANTE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"c\s*(\d+)").unwrap());

/// Extracts num_lastre / spessore_mm / tipo_rivestimento / tipo_lastra /
/// montante_mm / isolamento from a free-text description (spec §4.3). Ports
/// the teacher's keyword tables verbatim; thin on comments because the
/// mapping is the whole story.
pub fn extract_construction_attributes(text: &str) -> CatalogAttributes {
    let mut attrs = CatalogAttributes::default();
    if text.trim().is_empty() {
        return attrs;
    }
    let lower = text.to_lowercase();

    if lower.contains("doppia lastra") {
        attrs.num_lastre = Some(2);
    } else if lower.contains("singola lastra") {
        attrs.num_lastre = Some(1);
    } else if lower.contains("tripla lastra") {
        attrs.num_lastre = Some(3);
    } else {
        for pattern in LASTRE_PATTERNS.iter() {
            if let Some(caps) = pattern.captures(&lower) {
                if let Some(m) = caps.get(1) {
                    if let Ok(n) = m.as_str().parse::<i32>() {
                        attrs.num_lastre = Some(n);
                        break;
                    }
                }
            }
        }
    }

    if let Some(caps) = SPESSORE_PATTERN.captures(&lower) {
        let (value, unit) = if let Some(v) = caps.get(1) {
            (v.as_str(), caps.get(2).map(|m| m.as_str()).unwrap_or("mm"))
        } else {
            (
                caps.get(3).map(|m| m.as_str()).unwrap_or(""),
                caps.get(4).map(|m| m.as_str()).unwrap_or("mm"),
            )
        };
        if let Ok(mut parsed) = value.replace(',', ".").parse::<f64>() {
            if unit == "cm" {
                parsed *= 10.0;
            }
            attrs.spessore_mm = Some(parsed.round() as i32);
        }
    }

    const RIVESTIMENTI: &[(&str, &[&str])] = &[
        ("ceramica", &["ceramic", "piastrelle", "gres", "porcellanato"]),
        ("legno", &["legno", "parquet", "laminato", "listone"]),
        ("pietra", &["pietra", "marmo", "granito", "travertino", "ardesia"]),
        ("resina", &["resina", "epossidic"]),
        ("pvc", &["pvc", "vinilico", "lvt"]),
        ("moquette", &["moquette", "tappeto"]),
        ("intonaco", &["intonaco", "rasatura", "stucco"]),
        ("pittura", &["pittura", "tinteggiatura", "verniciatura"]),
        ("carta_parati", &["carta da parati", "wallpaper", "tappezzeria"]),
    ];
    for (tipo, keywords) in RIVESTIMENTI {
        if keywords.iter().any(|k| lower.contains(k)) {
            attrs.tipo_rivestimento = Some((*tipo).to_string());
            break;
        }
    }

    const TIPI_LASTRA: &[(&str, &[&str])] = &[
        ("standard", &["standard", "normale", "ba13"]),
        ("idrofuga", &["idrofug", "resistente all'acqua", "h1", "verde"]),
        ("ignifuga", &["ignifug", "resistente al fuoco", "ei", "rosa"]),
        ("acustica", &["acustic", "fonoassorbente", "fonoisolante"]),
        ("alta_densita", &["alta densità", "hd", "durlock"]),
    ];
    for (tipo, keywords) in TIPI_LASTRA {
        if keywords.iter().any(|k| lower.contains(k)) {
            attrs.tipo_lastra = Some((*tipo).to_string());
            break;
        }
    }

    if ["montante", "guida", "profilo", "orditura"]
        .iter()
        .any(|k| lower.contains(k))
    {
        if let Some(caps) = MONTANTE_PATTERN.captures(&lower) {
            if let Ok(n) = caps[1].parse::<i32>() {
                attrs.montante_mm = Some(n);
            }
        }
    }

    const ISOLAMENTI: &[(&str, &[&str])] = &[
        ("lana_roccia", &["lana di roccia", "lana roccia", "rockwool"]),
        ("lana_vetro", &["lana di vetro", "lana vetro"]),
        ("polistirene", &["polistirene", "eps", "xps", "polistirolo"]),
        ("fibra_legno", &["fibra di legno", "fibra legno"]),
        ("sughero", &["sughero"]),
    ];
    for (tipo, keywords) in ISOLAMENTI {
        if keywords.iter().any(|k| lower.contains(k)) {
            attrs.isolamento = Some((*tipo).to_string());
            break;
        }
    }

    attrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_entry_text_excludes_prices_and_joins_with_bullet() {
        let entry = CatalogEntryText {
            item_code: Some("A004.010"),
            item_description: Some("Intonaco civile"),
            wbs6_description: Some("Opere murarie"),
            wbs7_description: None,
            price_list_labels: vec!["Listino 2024", "Listino 2023"],
        };
        let text = compose_entry_text(&entry);
        assert_eq!(
            text,
            "A004.010 • Intonaco civile • Opere murarie • Listino 2023 Listino 2024"
        );
    }

    #[test]
    fn test_compose_entry_text_skips_missing_fields() {
        let entry = CatalogEntryText {
            item_description: Some("Solo descrizione"),
            ..Default::default()
        };
        assert_eq!(compose_entry_text(&entry), "Solo descrizione");
    }

    #[test]
    fn test_extract_attributes_lastre_and_spessore() {
        let attrs = extract_construction_attributes("Parete in cartongesso doppia lastra spessore 125 mm");
        assert_eq!(attrs.num_lastre, Some(2));
        assert_eq!(attrs.spessore_mm, Some(125));
    }

    #[test]
    fn test_extract_attributes_rivestimento_and_isolamento() {
        let attrs = extract_construction_attributes(
            "Pavimento in gres porcellanato con isolamento in lana di roccia",
        );
        assert_eq!(attrs.tipo_rivestimento, Some("ceramica".to_string()));
        assert_eq!(attrs.isolamento, Some("lana_roccia".to_string()));
    }

    #[test]
    fn test_extract_attributes_empty_text() {
        assert_eq!(extract_construction_attributes(""), CatalogAttributes::default());
    }

    #[test]
    fn test_l2_normalize_unit_length() {
        let normalized = l2_normalize(&[3.0, 4.0]);
        let norm: f32 = normalized.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }
}
