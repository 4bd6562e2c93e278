//! Hybrid catalog search (spec §4.9, component C9): FAISS semantic
//! candidates boosted by lexical token overlap and attribute matches, with
//! a lexical-only fallback when nothing clears the score bar.
//!
//! Grounded on `original_source`'s `catalog_search_service.py`
//! (`search_catalog`, the boost constants in §4.9, and the
//! FAISS-candidate-only lexical fallback flagged as an open question in
//! spec §9 — preserved here and exposed via
//! [`SearchOptions::lexical_fallback_scope`] per DESIGN.md).

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::catalog::index::CatalogIndex;
use crate::error::AppError;
use crate::models::{CatalogAttributes, PriceListItem};
use crate::nlp::embedding::{extract_construction_attributes, EmbeddingService};
use crate::nlp::faiss_index::FaissIndexCache;

/// Where the lexical fallback draws its candidate pool from. The teacher's
/// source only ever scans the FAISS candidate rows already loaded into
/// memory (`CandidatesOnly`); `WholeCatalog` is the documented alternative
/// (spec §9 open question) offered as an explicit, opt-in choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexicalFallbackScope {
    CandidatesOnly,
    WholeCatalog,
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    pub min_score: f64,
    pub lexical_fallback_scope: LexicalFallbackScope,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 50,
            min_score: 0.2,
            lexical_fallback_scope: LexicalFallbackScope::CandidatesOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    Semantic,
    Lexical,
}

#[derive(Debug, Clone)]
pub struct OfferPriceEntry {
    pub label: String,
    pub price: Decimal,
    pub quantity: Option<Decimal>,
    pub round_number: Option<i32>,
    pub computo_id: i64,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub item_id: i64,
    pub score: f64,
    pub match_reason: MatchReason,
    pub project_price: Option<Decimal>,
    pub project_quantity: Option<Decimal>,
    pub offer_prices: Vec<OfferPriceEntry>,
}

/// Whether FAISS, the lexical fallback, or both contributed to the final
/// result set — surfaced so callers can tell the two paths apart (spec §9).
#[derive(Debug, Clone, Default)]
pub struct SearchDiagnostics {
    pub used_semantic: bool,
    pub used_lexical_fallback: bool,
    pub semantic_candidate_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub hits: Vec<SearchHit>,
    pub diagnostics: SearchDiagnostics,
}

fn query_tokens(query: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in query.split_whitespace() {
        let cleaned: String = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if cleaned.chars().count() >= 4 {
            tokens.push(cleaned);
        }
    }
    tokens
}

fn lexical_boost(tokens: &[String], item: &PriceListItem) -> f64 {
    let desc = item
        .item_description
        .as_deref()
        .unwrap_or("")
        .to_lowercase();
    let code = item.item_code.as_deref().unwrap_or("").to_lowercase();
    let wbs = format!(
        "{} {}",
        item.wbs6_description.as_deref().unwrap_or(""),
        item.wbs7_description.as_deref().unwrap_or("")
    )
    .to_lowercase();

    let hits_desc = tokens
        .iter()
        .filter(|t| desc.contains(t.as_str()) || code.contains(t.as_str()))
        .count();
    let hits_wbs = tokens.iter().filter(|t| wbs.contains(t.as_str())).count();

    let desc_boost = (0.02 * hits_desc as f64).min(0.08);
    let wbs_boost = (0.02 * hits_wbs as f64).min(0.05);
    (desc_boost + wbs_boost).min(0.12)
}

fn attribute_boost(query: &CatalogAttributes, candidate: &CatalogAttributes) -> f64 {
    let mut boost = 0.0;

    if let Some(want) = query.num_lastre {
        match candidate.num_lastre {
            Some(have) if have == want => boost += 0.15,
            Some(_) => boost -= 0.10,
            None => {}
        }
    }

    if let (Some(want), Some(have)) = (&query.tipo_rivestimento, &candidate.tipo_rivestimento) {
        if want == have {
            boost += 0.10;
        }
    }
    if let (Some(want), Some(have)) = (&query.tipo_lastra, &candidate.tipo_lastra) {
        if want == have {
            boost += 0.10;
        }
    }

    if let (Some(want), Some(have)) = (query.spessore_mm, candidate.spessore_mm) {
        if want == have {
            boost += 0.10;
        } else if (want - have).abs() <= 5 {
            boost += 0.05;
        }
    }

    if let (Some(want), Some(have)) = (&query.isolamento, &candidate.isolamento) {
        if want == have {
            boost += 0.08;
        }
    }

    boost
}

fn item_haystack(item: &PriceListItem) -> String {
    format!(
        "{} {} {} {}",
        item.item_code.as_deref().unwrap_or(""),
        item.item_description.as_deref().unwrap_or(""),
        item.wbs6_description.as_deref().unwrap_or(""),
        item.wbs7_description.as_deref().unwrap_or("")
    )
    .to_lowercase()
}

fn lexical_fallback<'a>(
    tokens: &[String],
    candidates: impl Iterator<Item = &'a PriceListItem>,
    top_k: usize,
) -> Vec<SearchHit> {
    let mut scored: Vec<(f64, i64)> = candidates
        .filter_map(|item| {
            let haystack = item_haystack(item);
            if tokens.iter().all(|t| haystack.contains(t.as_str())) {
                Some((lexical_boost(tokens, item), item.id))
            } else {
                None
            }
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(&b.1)));
    scored
        .into_iter()
        .take(top_k)
        .map(|(score, item_id)| SearchHit {
            item_id,
            score,
            match_reason: MatchReason::Lexical,
            project_price: None,
            project_quantity: None,
            offer_prices: Vec::new(),
        })
        .collect()
}

/// `search_catalog` (spec §4.9). `commessa_id` selects the FAISS index;
/// `project_quantities`/`offers_by_item` are used to enrich hits (step 9)
/// and are expected to already be scoped to this commessa.
#[allow(clippy::too_many_arguments)]
pub fn search_catalog(
    query: &str,
    commessa_id: i64,
    catalog: &CatalogIndex,
    faiss: &FaissIndexCache,
    embedder: &EmbeddingService,
    options: &SearchOptions,
    project_quantities: &HashMap<i64, Decimal>,
    offers_by_item: &HashMap<i64, Vec<OfferPriceEntry>>,
) -> Result<SearchResult, AppError> {
    let tokens = query_tokens(query);
    let query_attrs = extract_construction_attributes(query);

    let query_vector = embedder.embed_text(query).map_err(|e| {
        AppError::PreconditionFailed(format!("embedding non disponibile per la ricerca: {e}"))
    })?;

    if !faiss.index_exists(commessa_id) {
        let vectors: Vec<(i64, Vec<f32>)> = catalog
            .all_items()
            .filter_map(|item| {
                item.extra_metadata
                    .nlp
                    .as_ref()
                    .filter(|nlp| nlp.model_id == embedder.model_id())
                    .map(|nlp| (item.id, nlp.vector.clone()))
            })
            .collect();
        if !vectors.is_empty() {
            faiss.build_index(commessa_id, &vectors).map_err(|e| {
                AppError::TransientBackend(format!("costruzione indice FAISS fallita: {e}"))
            })?;
        }
    } else {
        faiss
            .load_index(commessa_id)
            .map_err(|e| AppError::TransientBackend(format!("caricamento indice FAISS fallito: {e}")))?;
    }

    let raw_hits = faiss.search(commessa_id, &query_vector, options.top_k * 2);
    let mut diagnostics = SearchDiagnostics {
        used_semantic: !raw_hits.is_empty(),
        semantic_candidate_count: raw_hits.len(),
        ..Default::default()
    };

    let mut scored: Vec<(f64, i64)> = Vec::with_capacity(raw_hits.len());
    for (item_id, cosine_score) in &raw_hits {
        let Some(item) = catalog.get(*item_id) else {
            continue;
        };
        let mut score = *cosine_score as f64;
        score += lexical_boost(&tokens, item);
        if let Some(nlp) = &item.extra_metadata.nlp {
            score += attribute_boost(&query_attrs, &nlp.attributes);
        }
        scored.push((score, *item_id));
    }

    let mut hits: Vec<SearchHit> = scored
        .into_iter()
        .filter(|(score, _)| *score >= options.min_score)
        .map(|(score, item_id)| SearchHit {
            item_id,
            score,
            match_reason: MatchReason::Semantic,
            project_price: None,
            project_quantity: None,
            offer_prices: Vec::new(),
        })
        .collect();
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then(a.item_id.cmp(&b.item_id)));
    hits.truncate(options.top_k);

    if hits.is_empty() && !tokens.is_empty() {
        diagnostics.used_lexical_fallback = true;
        hits = match options.lexical_fallback_scope {
            LexicalFallbackScope::CandidatesOnly => {
                let candidate_ids: Vec<i64> = raw_hits.iter().map(|(id, _)| *id).collect();
                lexical_fallback(
                    &tokens,
                    candidate_ids.iter().filter_map(|id| catalog.get(*id)),
                    options.top_k,
                )
            }
            LexicalFallbackScope::WholeCatalog => {
                lexical_fallback(&tokens, catalog.all_items(), options.top_k)
            }
        };
    }

    for hit in &mut hits {
        hit.project_quantity = project_quantities.get(&hit.item_id).copied();
        if let Some(item) = catalog.get(hit.item_id) {
            hit.project_price = item
                .price_lists
                .values()
                .next()
                .and_then(|v| Decimal::try_from(*v).ok());
        }
        if let Some(offers) = offers_by_item.get(&hit.item_id) {
            let mut sorted = offers.clone();
            sorted.sort_by(|a, b| {
                a.round_number
                    .cmp(&b.round_number)
                    .then_with(|| a.label.cmp(&b.label))
            });
            hit.offer_prices = sorted;
        }
    }

    Ok(SearchResult { hits, diagnostics })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_tokens_filters_short_words() {
        let tokens = query_tokens("controsoffitto doppia lastra 13 mm ignifuga");
        assert!(tokens.contains(&"controsoffitto".to_string()));
        assert!(tokens.contains(&"doppia".to_string()));
        assert!(tokens.contains(&"lastra".to_string()));
        assert!(!tokens.contains(&"13".to_string()));
        assert!(!tokens.contains(&"mm".to_string()));
    }

    #[test]
    fn test_attribute_boost_num_lastre_exact_and_mismatch() {
        let query = CatalogAttributes {
            num_lastre: Some(2),
            ..Default::default()
        };
        let exact = CatalogAttributes {
            num_lastre: Some(2),
            ..Default::default()
        };
        let mismatch = CatalogAttributes {
            num_lastre: Some(1),
            ..Default::default()
        };
        assert_eq!(attribute_boost(&query, &exact), 0.15);
        assert_eq!(attribute_boost(&query, &mismatch), -0.10);
    }

    #[test]
    fn test_attribute_boost_scenario_6_ordering() {
        let query = CatalogAttributes {
            num_lastre: Some(2),
            tipo_lastra: Some("ignifuga".to_string()),
            spessore_mm: Some(13),
            ..Default::default()
        };
        let item_a = CatalogAttributes {
            num_lastre: Some(2),
            tipo_lastra: Some("ignifuga".to_string()),
            spessore_mm: Some(13),
            ..Default::default()
        };
        let item_b = CatalogAttributes {
            num_lastre: Some(1),
            tipo_lastra: Some("standard".to_string()),
            spessore_mm: Some(13),
            ..Default::default()
        };
        let item_c = CatalogAttributes {
            num_lastre: Some(2),
            tipo_lastra: Some("ignifuga".to_string()),
            spessore_mm: Some(25),
            ..Default::default()
        };
        let boost_a = attribute_boost(&query, &item_a);
        let boost_b = attribute_boost(&query, &item_b);
        let boost_c = attribute_boost(&query, &item_c);
        assert!(boost_a > boost_c);
        assert!(boost_c > boost_b);
    }

    #[test]
    fn test_lexical_fallback_requires_all_tokens() {
        let items = vec![PriceListItem {
            id: 1,
            commessa_id: 1,
            product_id: None,
            item_code: Some("A100".into()),
            item_description: Some("Controsoffitto in cartongesso ignifugo".into()),
            unit_id: None,
            unit_label: None,
            wbs6_code: None,
            wbs6_description: None,
            wbs7_code: None,
            wbs7_description: None,
            price_lists: HashMap::new(),
            extra_metadata: Default::default(),
            source_file: None,
            preventivo_id: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }];
        let tokens = vec!["controsoffitto".to_string(), "ignifugo".to_string()];
        let hits = lexical_fallback(&tokens, items.iter(), 10);
        assert_eq!(hits.len(), 1);

        let tokens_miss = vec!["controsoffitto".to_string(), "acustico".to_string()];
        let hits_miss = lexical_fallback(&tokens_miss, items.iter(), 10);
        assert!(hits_miss.is_empty());
    }
}
