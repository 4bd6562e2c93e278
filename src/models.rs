//! Domain-layer entities (spec §3), distinct from the `db::models` row
//! mappings. These are the types the core matching/analysis modules operate
//! on; conversions from `db::models` live alongside the query layer that
//! produces them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commessa {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub business_unit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputoKind {
    Project,
    Return,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Computo {
    pub id: i64,
    pub commessa_id: i64,
    pub kind: ComputoKind,
    pub bidder: Option<String>,
    pub round_number: Option<i32>,
    pub file_ref: Option<String>,
    pub total_amount: Option<Decimal>,
    pub note: Option<String>,
    pub matching_report: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Flat legacy row, owned exclusively by one computo.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VoceComputo {
    pub id: i64,
    pub computo_id: i64,
    pub commessa_id: i64,
    pub order_index: i32,
    pub progressivo: Option<i64>,
    pub code: Option<String>,
    pub description: Option<String>,
    pub uom: Option<String>,
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub note: Option<String>,
    pub wbs: WbsCodes,
    pub extra_metadata: ExtraMetadata,
}

/// The seven WBS levels a legacy row carries (1-5 spatial, 6 categorical,
/// 7 optional EPU grouping).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WbsCodes {
    pub wbs1_code: Option<String>,
    pub wbs1_description: Option<String>,
    pub wbs2_code: Option<String>,
    pub wbs2_description: Option<String>,
    pub wbs3_code: Option<String>,
    pub wbs3_description: Option<String>,
    pub wbs4_code: Option<String>,
    pub wbs4_description: Option<String>,
    pub wbs5_code: Option<String>,
    pub wbs5_description: Option<String>,
    pub wbs6_code: Option<String>,
    pub wbs6_description: Option<String>,
    pub wbs7_code: Option<String>,
    pub wbs7_description: Option<String>,
}

/// Tagged sidecar for the heterogeneous metadata bags the original carries
/// as untyped dicts (spec §9 "dynamic typing -> tagged variants"). Known
/// keys get real fields; anything else lands in `extras`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExtraMetadata {
    pub missing_from_return: bool,
    pub lock_return_price: bool,
    pub group_total_only: bool,
    pub group_allocation: Option<String>,
    pub product_id: Option<String>,
    pub nlp: Option<NlpMetadata>,
    #[serde(flatten)]
    pub extras: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NlpMetadata {
    pub model_id: String,
    pub vector: Vec<f32>,
    pub dimension: usize,
    pub attributes: CatalogAttributes,
}

/// Attribute-extraction output (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CatalogAttributes {
    pub num_lastre: Option<i32>,
    pub spessore_mm: Option<i32>,
    pub tipo_rivestimento: Option<String>,
    pub tipo_lastra: Option<String>,
    pub montante_mm: Option<i32>,
    pub isolamento: Option<String>,
}

/// Normalized voce, coexisting with `VoceComputo` for sane WBS joins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voce {
    pub id: i64,
    pub commessa_id: i64,
    pub wbs6_id: i64,
    pub wbs7_id: Option<i64>,
    pub code: Option<String>,
    pub description: Option<String>,
    pub uom: Option<String>,
    pub order_index: i32,
    pub legacy_vocecomputo_id: Option<i64>,
    pub price_list_item_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoceProgetto {
    pub id: i64,
    pub voce_id: i64,
    pub computo_id: i64,
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoceOfferta {
    pub id: i64,
    pub voce_id: i64,
    pub computo_id: i64,
    pub impresa_id: Option<i64>,
    pub round_number: Option<i32>,
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub note: Option<String>,
}

/// Catalog line. Identity is `(commessa_id, product_id)` when `product_id`
/// is set, else normalized code + signature (enforced by `CatalogIndex`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceListItem {
    pub id: i64,
    pub commessa_id: i64,
    pub product_id: Option<String>,
    pub item_code: Option<String>,
    pub item_description: Option<String>,
    pub unit_id: Option<String>,
    pub unit_label: Option<String>,
    pub wbs6_code: Option<String>,
    pub wbs6_description: Option<String>,
    pub wbs7_code: Option<String>,
    pub wbs7_description: Option<String>,
    pub price_lists: HashMap<String, f64>,
    pub extra_metadata: ExtraMetadata,
    pub source_file: Option<String>,
    pub preventivo_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceListOffer {
    pub id: i64,
    pub price_list_item_id: i64,
    pub commessa_id: i64,
    pub computo_id: i64,
    pub impresa_id: Option<i64>,
    pub impresa_label: Option<String>,
    pub round_number: Option<i32>,
    pub unit_price: Decimal,
    pub quantity: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Identity is `normalized_label` (I6); duplicate labels collapse via
/// getter-or-create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Impresa {
    pub id: i64,
    pub label: String,
    pub normalized_label: String,
}

impl Impresa {
    /// Lowercase, collapse whitespace, strip a trailing `"(N)"` suffix
    /// (e.g. a renumbered duplicate bidder entry).
    pub fn normalize_label(label: &str) -> String {
        let trimmed = label.trim();
        let without_suffix = strip_trailing_parenthetical_number(trimmed);
        without_suffix
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }
}

fn strip_trailing_parenthetical_number(label: &str) -> &str {
    let trimmed = label.trim_end();
    if let Some(open) = trimmed.rfind('(') {
        if let Some(close) = trimmed.rfind(')') {
            if close == trimmed.len() - 1 && close > open {
                let inner = &trimmed[open + 1..close];
                if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit()) {
                    return trimmed[..open].trim_end();
                }
            }
        }
    }
    trimmed
}

/// Singleton settings row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub criticita_media_percent: f64,
    pub criticita_alta_percent: f64,
    pub nlp_model_id: String,
    pub nlp_max_length: usize,
    pub nlp_batch_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            criticita_media_percent: 25.0,
            criticita_alta_percent: 50.0,
            nlp_model_id: "paraphrase-multilingual-mpnet-base-v2".to_string(),
            nlp_max_length: 256,
            nlp_batch_size: 32,
        }
    }
}

/// A parsed WBS level from the external parsing collaborator (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedWbsLevel {
    pub level: u8,
    pub code: Option<String>,
    pub description: Option<String>,
}

/// A parsed line item, as produced by the (out-of-scope) Excel/XML parser.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ParsedVoce {
    pub order_index: i32,
    pub progressivo: Option<i64>,
    pub code: Option<String>,
    pub description: Option<String>,
    pub wbs_levels: Vec<ParsedWbsLevel>,
    pub uom: Option<String>,
    pub quantity: Option<f64>,
    pub unit_price: Option<f64>,
    pub amount: Option<f64>,
    pub note: Option<String>,
    pub metadata: ExtraMetadata,
}

impl Default for ParsedWbsLevel {
    fn default() -> Self {
        Self {
            level: 1,
            code: None,
            description: None,
        }
    }
}

impl ParsedVoce {
    pub fn wbs_level(&self, level: u8) -> Option<&ParsedWbsLevel> {
        self.wbs_levels.iter().find(|l| l.level == level)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ParsedComputo {
    pub lines: Vec<ParsedVoce>,
    pub total_amount: Option<f64>,
    pub total_quantity: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_label_collapses_whitespace() {
        assert_eq!(
            Impresa::normalize_label("  Impresa   Alpha  "),
            "impresa alpha"
        );
    }

    #[test]
    fn test_normalize_label_strips_trailing_numeral_suffix() {
        assert_eq!(Impresa::normalize_label("Impresa Alpha (2)"), "impresa alpha");
        assert_eq!(Impresa::normalize_label("Impresa Alpha"), "impresa alpha");
    }

    #[test]
    fn test_normalize_label_is_idempotent() {
        let once = Impresa::normalize_label("Impresa Beta (3)");
        let twice = Impresa::normalize_label(&once);
        assert_eq!(once, twice);
    }
}
