//! Offer reconciliation and manual-edit flows (spec §4.5, component C5).
//!
//! Grounded on `original_source`'s `importers/lc.py` (`_sync_price_list_offers`,
//! `_rebuild_computo_from_offers`) and `matching/legacy.py`'s catalog
//! resolution cascade (`_match_price_list_item_entry` and friends). DB I/O
//! (deleting/re-inserting offer rows, loading the live project computo) is
//! left to the caller — these functions are the pure resolution/recompute
//! core the importer drives inside a transaction.

use crate::config::MatchingConfig;
use crate::catalog::index::CatalogIndex;
use crate::models::{ParsedVoce, PriceListItem, VoceComputo};
use crate::normalization::{description_signature, normalize_code_token};
use rust_decimal::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::{HashMap, HashSet};

/// A catalog offer resolved from one parsed return line, ready to upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOffer {
    pub price_list_item_id: i64,
    pub unit_price: Decimal,
    pub quantity: Option<Decimal>,
    pub source_label: String,
}

#[derive(Debug, Clone)]
pub struct PriceConflict {
    pub price_list_item_id: i64,
    pub item_code: Option<String>,
    pub item_description: Option<String>,
    pub prices: Vec<f64>,
    pub samples: Vec<(String, f64)>,
}

#[derive(Debug, Clone, Default)]
pub struct OfferSyncResult {
    pub offers: Vec<ResolvedOffer>,
    pub unmatched_labels: Vec<String>,
    pub conflicts: Vec<PriceConflict>,
    pub matched_item_ids: HashSet<i64>,
}

fn select_candidate<'a>(
    candidates: &[&'a PriceListItem],
    parsed_wbs6: Option<&str>,
) -> Option<&'a PriceListItem> {
    if candidates.is_empty() {
        return None;
    }
    if candidates.len() == 1 {
        return Some(candidates[0]);
    }
    if let Some(wbs6) = parsed_wbs6 {
        let normalized = normalize_code_token(Some(wbs6));
        let filtered: Vec<&&PriceListItem> = candidates
            .iter()
            .filter(|item| {
                item.wbs6_code
                    .as_deref()
                    .map(|c| normalize_code_token(Some(c)) == normalized)
                    .unwrap_or(false)
            })
            .collect();
        if filtered.len() == 1 {
            return Some(filtered[0]);
        }
        if !filtered.is_empty() {
            return filtered
                .into_iter()
                .min_by_key(|item| {
                    item.item_code
                        .clone()
                        .or_else(|| item.product_id.clone())
                        .unwrap_or_default()
                        .to_lowercase()
                })
                .copied();
        }
    }
    candidates
        .iter()
        .min_by_key(|item| {
            item.item_code
                .clone()
                .or_else(|| item.product_id.clone())
                .unwrap_or_default()
                .to_lowercase()
        })
        .copied()
}

fn parsed_wbs6(parsed: &ParsedVoce) -> Option<String> {
    parsed
        .wbs_level(6)
        .and_then(|l| l.code.clone().or_else(|| l.description.clone()))
}

/// Catalog resolution cascade (spec §4.2/§4.5): code -> signature/description
/// -> head -> tail -> semantic. `query_vector` must already be L2-normalized
/// (a raw dot product against catalog vectors then equals cosine similarity).
pub fn resolve_price_list_item(
    parsed: &ParsedVoce,
    index: &CatalogIndex,
    config: &MatchingConfig,
    query_vector: Option<&[f32]>,
) -> Option<i64> {
    let wbs6 = parsed_wbs6(parsed);

    if let Some(code) = parsed.code.as_deref() {
        let candidates = index.by_code(code);
        if let Some(item) = select_candidate(&candidates, wbs6.as_deref()) {
            return Some(item.id);
        }
    }

    if let Some(description) = parsed.description.as_deref() {
        if description_signature(Some(description), None, None).is_some() {
            let candidates = index.by_description_signature(description);
            if let Some(item) = select_candidate(&candidates, wbs6.as_deref()) {
                return Some(item.id);
            }
        }

        let head_tail_candidates = index.by_head_or_tail(description);
        if let Some(item) = select_candidate(&head_tail_candidates, wbs6.as_deref()) {
            return Some(item.id);
        }
    }

    let query_vector = query_vector?;
    let mut best_score = config.semantic_min_score;
    let mut best_item: Option<i64> = None;
    for entry in index.embeddings_for_category(wbs6.as_deref()) {
        if entry.vector.len() != query_vector.len() {
            continue;
        }
        let score: f32 = entry
            .vector
            .iter()
            .zip(query_vector.iter())
            .map(|(a, b)| a * b)
            .sum();
        if (score as f64) > best_score {
            best_score = score as f64;
            best_item = Some(entry.item_id);
        }
    }
    best_item
}

fn parsed_label(parsed: &ParsedVoce) -> String {
    parsed
        .code
        .clone()
        .or_else(|| parsed.description.clone())
        .unwrap_or_else(|| "Voce senza descrizione".to_string())
}

/// `sync_price_list_offers` (spec §4.5): resolves every priced parsed line
/// to a catalog item and collapses repeats to one offer per item
/// (subsequent matches overwrite, matching legacy's upsert semantics).
/// `progressivo_to_item` is the `progressivo -> product_id -> PriceListItem`
/// fallback map built from the live project's lines.
pub fn sync_price_list_offers(
    parsed_lines: &[ParsedVoce],
    index: &CatalogIndex,
    config: &MatchingConfig,
    progressivo_to_item: &HashMap<i64, i64>,
    query_vectors: &HashMap<usize, Vec<f32>>,
) -> OfferSyncResult {
    let mut offers: HashMap<i64, ResolvedOffer> = HashMap::new();
    let mut price_records: HashMap<i64, Vec<(String, f64)>> = HashMap::new();
    let mut unmatched_labels = Vec::new();

    for (idx, parsed) in parsed_lines.iter().enumerate() {
        let Some(price) = parsed.unit_price else {
            continue;
        };
        let query_vector = query_vectors.get(&idx).map(|v| v.as_slice());
        let mut target = resolve_price_list_item(parsed, index, config, query_vector);
        if target.is_none() {
            if let Some(progressivo) = parsed.progressivo {
                target = progressivo_to_item.get(&progressivo).copied();
            }
        }
        let Some(item_id) = target else {
            unmatched_labels.push(parsed_label(parsed));
            continue;
        };

        let rounded = (price * 10_000.0).round() / 10_000.0;
        let label = parsed_label(parsed);
        price_records.entry(item_id).or_default().push((label.clone(), rounded));
        offers.insert(
            item_id,
            ResolvedOffer {
                price_list_item_id: item_id,
                unit_price: decimal_from_f64(rounded, 4),
                quantity: parsed.quantity.map(|q| decimal_from_f64(q, 6)),
                source_label: label,
            },
        );
    }

    let matched_item_ids: HashSet<i64> = offers.keys().copied().collect();

    let mut conflicts = Vec::new();
    for (item_id, samples) in &price_records {
        let mut distinct: Vec<f64> = Vec::new();
        for (_, price) in samples {
            if !distinct.iter().any(|p: &f64| (p - price).abs() < 1e-9) {
                distinct.push(*price);
            }
        }
        if distinct.len() > 1 {
            let item = index.get(*item_id);
            distinct.sort_by(|a, b| a.partial_cmp(b).unwrap());
            conflicts.push(PriceConflict {
                price_list_item_id: *item_id,
                item_code: item.and_then(|i| i.item_code.clone()),
                item_description: item.and_then(|i| i.item_description.clone()),
                prices: distinct,
                samples: samples.clone(),
            });
        }
    }

    OfferSyncResult {
        offers: offers.into_values().collect(),
        unmatched_labels,
        conflicts,
        matched_item_ids,
    }
}

fn decimal_from_f64(value: f64, dp: u32) -> Decimal {
    Decimal::from_f64(value)
        .unwrap_or(Decimal::ZERO)
        .round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

/// Ceiling to the cent — used only for the computo-level display total
/// (spec §9 "never underreport" convention), not per-line amounts.
pub fn ceil_to_cent(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::ToPositiveInfinity)
}

/// `rebuild_computo_from_offers`'s recompute step: rebuilds the return
/// computo's `VoceComputo` snapshot from the project lines plus the current
/// `{price_list_item_id -> unit_price}` offer map, keyed via each project
/// line's `extra_metadata.product_id`.
pub fn build_project_snapshot_from_price_offers(
    project_lines: &[VoceComputo],
    product_id_to_item_id: &HashMap<String, i64>,
    offer_price_map: &HashMap<i64, Decimal>,
) -> Vec<VoceComputo> {
    project_lines
        .iter()
        .map(|voce| {
            let mut snapshot = voce.clone();
            let target_item_id = voce
                .extra_metadata
                .product_id
                .as_ref()
                .and_then(|pid| product_id_to_item_id.get(pid));
            let offer_price = target_item_id.and_then(|id| offer_price_map.get(id).copied());

            if let Some(price) = offer_price {
                snapshot.unit_price = Some(price);
                if let Some(qty) = voce.quantity {
                    if !qty.is_zero() {
                        snapshot.amount = Some(
                            (price * qty).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero),
                        );
                    }
                }
            }
            snapshot
        })
        .collect()
}

/// Sums a rebuilt snapshot's amounts and ceils to the cent (mirrors
/// `_rebuild_computo_from_offers`'s `computo.importo_totale` recompute).
pub fn total_amount_of(snapshot: &[VoceComputo]) -> Decimal {
    let sum: Decimal = snapshot.iter().filter_map(|v| v.amount).sum();
    ceil_to_cent(sum)
}

/// `manual_price_update`'s bookkeeping step: drops `price_list_item_id` from
/// a stored LC-mode `matching_report`'s `missing_price_items`, incrementing
/// `matched_price_items` accordingly. No-op on a non-LC report.
pub fn acknowledge_manual_price(report: &mut serde_json::Value, price_list_item_id: i64) {
    let Some(obj) = report.as_object_mut() else {
        return;
    };
    if obj.get("mode").and_then(|v| v.as_str()) != Some("lc") {
        return;
    }
    let Some(missing) = obj.get("missing_price_items").and_then(|v| v.as_array()) else {
        return;
    };
    let before = missing.len();
    let updated: Vec<serde_json::Value> = missing
        .iter()
        .filter(|entry| {
            entry
                .get("price_list_item_id")
                .and_then(|v| v.as_i64())
                != Some(price_list_item_id)
        })
        .cloned()
        .collect();
    if updated.len() == before {
        return;
    }
    let matched_increment = (before - updated.len()) as i64;
    obj.insert(
        "missing_price_items".to_string(),
        serde_json::Value::Array(updated),
    );
    let matched = obj
        .get("matched_price_items")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    obj.insert(
        "matched_price_items".to_string(),
        serde_json::Value::from(matched + matched_increment),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtraMetadata, WbsCodes};
    use chrono::Utc;

    fn matching_config() -> MatchingConfig {
        MatchingConfig::default()
    }

    fn price_item(id: i64, code: &str, description: &str) -> PriceListItem {
        PriceListItem {
            id,
            commessa_id: 1,
            product_id: None,
            item_code: Some(code.to_string()),
            item_description: Some(description.to_string()),
            unit_id: None,
            unit_label: None,
            wbs6_code: None,
            wbs6_description: None,
            wbs7_code: None,
            wbs7_description: None,
            price_lists: HashMap::new(),
            extra_metadata: ExtraMetadata::default(),
            source_file: None,
            preventivo_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn parsed(code: &str, description: &str, price: Option<f64>, qty: Option<f64>) -> ParsedVoce {
        ParsedVoce {
            code: Some(code.to_string()),
            description: Some(description.to_string()),
            unit_price: price,
            quantity: qty,
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_by_code() {
        let items = vec![price_item(1, "A100", "Fornitura intonaco civile")];
        let index = CatalogIndex::build(&items, "model-x");
        let line = parsed("A100", "altro", Some(10.0), Some(1.0));
        assert_eq!(
            resolve_price_list_item(&line, &index, &matching_config(), None),
            Some(1)
        );
    }

    #[test]
    fn test_sync_collapses_repeated_matches_to_one_offer() {
        let items = vec![price_item(1, "A100", "Fornitura intonaco civile")];
        let index = CatalogIndex::build(&items, "model-x");
        let lines = vec![
            parsed("A100", "Fornitura intonaco civile", Some(10.0), Some(1.0)),
            parsed("A100", "Fornitura intonaco civile", Some(12.0), Some(1.0)),
        ];
        let result = sync_price_list_offers(&lines, &index, &matching_config(), &HashMap::new(), &HashMap::new());
        assert_eq!(result.offers.len(), 1);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].prices, vec![10.0, 12.0]);
    }

    #[test]
    fn test_unmatched_entries_fall_back_to_progressivo_map() {
        let items = vec![price_item(1, "A100", "Fornitura intonaco civile")];
        let index = CatalogIndex::build(&items, "model-x");
        let mut line = parsed("Z999", "Voce estranea al catalogo", Some(10.0), Some(1.0));
        line.progressivo = Some(7);
        let mut fallback = HashMap::new();
        fallback.insert(7i64, 1i64);
        let result = sync_price_list_offers(&[line], &index, &matching_config(), &fallback, &HashMap::new());
        assert_eq!(result.offers.len(), 1);
        assert!(result.unmatched_labels.is_empty());
    }

    #[test]
    fn test_ceil_to_cent_rounds_up() {
        let value = Decimal::from_f64(10.001).unwrap();
        assert_eq!(ceil_to_cent(value), Decimal::from_f64(10.01).unwrap());
    }

    #[test]
    fn test_build_project_snapshot_overrides_price_from_offer() {
        let mut voce = VoceComputo {
            id: 1,
            computo_id: 1,
            commessa_id: 1,
            order_index: 0,
            progressivo: Some(1),
            code: Some("A100".to_string()),
            description: Some("Fornitura intonaco civile".to_string()),
            uom: None,
            quantity: Some(Decimal::from(10)),
            unit_price: Some(Decimal::from(25)),
            amount: Some(Decimal::from(250)),
            note: None,
            wbs: WbsCodes::default(),
            extra_metadata: ExtraMetadata::default(),
        };
        voce.extra_metadata.product_id = Some("P1".to_string());

        let mut product_map = HashMap::new();
        product_map.insert("P1".to_string(), 1i64);
        let mut offer_map = HashMap::new();
        offer_map.insert(1i64, Decimal::from_f64(28.50).unwrap());

        let snapshot = build_project_snapshot_from_price_offers(&[voce], &product_map, &offer_map);
        assert_eq!(snapshot[0].unit_price, Some(Decimal::from_f64(28.50).unwrap()));
        assert_eq!(snapshot[0].amount, Some(Decimal::from_f64(285.0).unwrap()));
    }

    #[test]
    fn test_acknowledge_manual_price_updates_missing_list() {
        let mut report = serde_json::json!({
            "mode": "lc",
            "total_price_items": 3,
            "matched_price_items": 1,
            "missing_price_items": [
                {"price_list_item_id": 1, "item_code": "A100", "item_description": "x"},
                {"price_list_item_id": 2, "item_code": "B200", "item_description": "y"},
            ],
        });
        acknowledge_manual_price(&mut report, 1);
        let missing = report["missing_price_items"].as_array().unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(report["matched_price_items"], serde_json::json!(2));
    }
}
