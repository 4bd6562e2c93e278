//! In-memory catalog index (spec §4.2, component C2).
//!
//! Built once per commessa from its `PriceListItem` rows and reused across
//! an import/search request; rebuilding is cheap (a handful of `HashMap`
//! inserts) so callers rebuild rather than try to incrementally patch it.

use crate::models::PriceListItem;
use crate::normalization::{
    build_head_tail_signatures, description_signature, normalize_code_token,
};
use std::collections::HashMap;

/// Key used for catalog items with no WBS6 code — they still participate in
/// a commessa-wide embedding search.
pub const ALL_CATEGORIES_KEY: &str = "__all__";

#[derive(Debug, Clone)]
pub struct EmbeddingEntry {
    pub item_id: i64,
    pub vector: Vec<f32>,
}

/// Five lookup tables over one commessa's catalog, all keyed to the same
/// normalization functions the alignment/search modules use so a lookup
/// never silently misses due to inconsistent folding.
#[derive(Debug, Default)]
pub struct CatalogIndex {
    items: HashMap<i64, PriceListItem>,
    code_map: HashMap<String, Vec<i64>>,
    signature_map: HashMap<String, Vec<i64>>,
    head_signature_map: HashMap<String, Vec<i64>>,
    tail_signature_map: HashMap<String, Vec<i64>>,
    embedding_map: HashMap<String, Vec<EmbeddingEntry>>,
}

impl CatalogIndex {
    /// `current_model_id` gates `embedding_map`: items whose
    /// `extra_metadata.nlp.model_id` does not match are indexed everywhere
    /// except the embedding map, so a mid-flight model swap can't surface
    /// stale vectors (spec §4.3 "in-flight vectors tagged with a previous
    /// model become invisible").
    pub fn build(items: &[PriceListItem], current_model_id: &str) -> Self {
        let mut index = CatalogIndex::default();

        for item in items {
            index.items.insert(item.id, item.clone());

            if let Some(code) = &item.item_code {
                let key = normalize_code_token(Some(code));
                if !key.is_empty() {
                    index.code_map.entry(key).or_default().push(item.id);
                }
            }

            if let Some(signature) =
                description_signature(item.item_description.as_deref(), None, None)
            {
                index
                    .signature_map
                    .entry(signature)
                    .or_default()
                    .push(item.id);
            }

            let (head, tail) = build_head_tail_signatures(item.item_description.as_deref(), 30);
            if !head.is_empty() {
                index.head_signature_map.entry(head).or_default().push(item.id);
            }
            if !tail.is_empty() {
                index.tail_signature_map.entry(tail).or_default().push(item.id);
            }

            if let Some(nlp) = &item.extra_metadata.nlp {
                if nlp.model_id == current_model_id {
                    let category = item
                        .wbs6_code
                        .as_ref()
                        .map(|c| normalize_code_token(Some(c)))
                        .filter(|c| !c.is_empty())
                        .unwrap_or_else(|| ALL_CATEGORIES_KEY.to_string());
                    index
                        .embedding_map
                        .entry(category)
                        .or_default()
                        .push(EmbeddingEntry {
                            item_id: item.id,
                            vector: nlp.vector.clone(),
                        });
                    index
                        .embedding_map
                        .entry(ALL_CATEGORIES_KEY.to_string())
                        .or_default()
                        .push(EmbeddingEntry {
                            item_id: item.id,
                            vector: nlp.vector.clone(),
                        });
                }
            }
        }

        index
    }

    pub fn get(&self, item_id: i64) -> Option<&PriceListItem> {
        self.items.get(&item_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn by_code(&self, code: &str) -> Vec<&PriceListItem> {
        let key = normalize_code_token(Some(code));
        self.code_map
            .get(&key)
            .map(|ids| ids.iter().filter_map(|id| self.items.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn by_description_signature(&self, description: &str) -> Vec<&PriceListItem> {
        match description_signature(Some(description), None, None) {
            Some(sig) => self
                .signature_map
                .get(&sig)
                .map(|ids| ids.iter().filter_map(|id| self.items.get(id)).collect())
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Candidates sharing either the head or the tail token-window signature
    /// with `description` — a cheap pre-filter ahead of Jaccard scoring.
    pub fn by_head_or_tail(&self, description: &str) -> Vec<&PriceListItem> {
        let (head, tail) = build_head_tail_signatures(Some(description), 30);
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for key in [&head, &tail] {
            if key.is_empty() {
                continue;
            }
            let map = if key == &head {
                &self.head_signature_map
            } else {
                &self.tail_signature_map
            };
            if let Some(ids) = map.get(key) {
                for id in ids {
                    if seen.insert(*id) {
                        if let Some(item) = self.items.get(id) {
                            out.push(item);
                        }
                    }
                }
            }
        }
        out
    }

    /// Embedding vectors available for a given WBS6 category, falling back
    /// to the whole-commessa bucket when the category has none of its own.
    pub fn embeddings_for_category(&self, wbs6_code: Option<&str>) -> &[EmbeddingEntry] {
        if let Some(code) = wbs6_code {
            let key = normalize_code_token(Some(code));
            if let Some(entries) = self.embedding_map.get(&key) {
                if !entries.is_empty() {
                    return entries;
                }
            }
        }
        self.embedding_map
            .get(ALL_CATEGORIES_KEY)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn all_items(&self) -> impl Iterator<Item = &PriceListItem> {
        self.items.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtraMetadata, NlpMetadata};
    use chrono::Utc;
    use std::collections::HashMap as Map;

    fn item(id: i64, code: &str, description: &str, wbs6: Option<&str>) -> PriceListItem {
        PriceListItem {
            id,
            commessa_id: 1,
            product_id: None,
            item_code: Some(code.to_string()),
            item_description: Some(description.to_string()),
            unit_id: None,
            unit_label: None,
            wbs6_code: wbs6.map(|s| s.to_string()),
            wbs6_description: None,
            wbs7_code: None,
            wbs7_description: None,
            price_lists: Map::new(),
            extra_metadata: ExtraMetadata::default(),
            source_file: None,
            preventivo_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_build_and_lookup_by_code() {
        let items = vec![item(1, "A004.010", "Fornitura e posa intonaco civile", Some("A004"))];
        let index = CatalogIndex::build(&items, "model-x");
        assert_eq!(index.len(), 1);
        let found = index.by_code("a004 010");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 1);
    }

    #[test]
    fn test_embedding_excluded_for_stale_model() {
        let mut entry = item(2, "B100", "Massetto cementizio armato", Some("B100"));
        entry.extra_metadata.nlp = Some(NlpMetadata {
            model_id: "old-model".to_string(),
            vector: vec![0.1, 0.2],
            dimension: 2,
            attributes: Default::default(),
        });
        let index = CatalogIndex::build(&[entry], "new-model");
        assert!(index.embeddings_for_category(Some("B100")).is_empty());
    }

    #[test]
    fn test_embedding_present_for_current_model() {
        let mut entry = item(3, "C200", "Rivestimento in ceramica per pareti bagno", Some("C200"));
        entry.extra_metadata.nlp = Some(NlpMetadata {
            model_id: "new-model".to_string(),
            vector: vec![0.1, 0.2, 0.3],
            dimension: 3,
            attributes: Default::default(),
        });
        let index = CatalogIndex::build(&[entry], "new-model");
        let entries = index.embeddings_for_category(Some("C200"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].item_id, 3);
    }

    #[test]
    fn test_head_or_tail_matches_long_description() {
        let description = (1..=40)
            .map(|i| format!("parola{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        let items = vec![item(4, "D900", &description, None)];
        let index = CatalogIndex::build(&items, "model-x");
        let found = index.by_head_or_tail(&description);
        assert_eq!(found.len(), 1);
    }
}
