//! Database row types and their `From<Row>` mappings (spec §3 data model).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_postgres::Row;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbCommessa {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub business_unit: Option<String>,
}

impl From<Row> for DbCommessa {
    fn from(row: Row) -> Self {
        Self {
            id: row.get("id"),
            code: row.get("code"),
            name: row.get("name"),
            business_unit: row.get("business_unit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputoType {
    Project,
    Return,
}

impl ComputoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputoType::Project => "project",
            ComputoType::Return => "return",
        }
    }
}

impl From<&str> for ComputoType {
    fn from(s: &str) -> Self {
        match s {
            "return" => ComputoType::Return,
            _ => ComputoType::Project,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbComputo {
    pub id: i64,
    pub commessa_id: i64,
    pub r#type: String,
    pub bidder: Option<String>,
    pub round_number: Option<i32>,
    pub file_ref: Option<String>,
    pub total_amount: Option<Decimal>,
    pub note: Option<String>,
    pub matching_report: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Row> for DbComputo {
    fn from(row: Row) -> Self {
        Self {
            id: row.get("id"),
            commessa_id: row.get("commessa_id"),
            r#type: row.get("type"),
            bidder: row.get("bidder"),
            round_number: row.get("round_number"),
            file_ref: row.get("file_ref"),
            total_amount: row.get("total_amount"),
            note: row.get("note"),
            matching_report: row.get("matching_report"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

/// Flat legacy row. Exclusive to one computo; wiped and reinserted on rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbVoceComputo {
    pub id: i64,
    pub computo_id: i64,
    pub commessa_id: i64,
    pub order_index: i32,
    pub progressivo: Option<String>,
    pub code: Option<String>,
    pub description: Option<String>,
    pub uom: Option<String>,
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub note: Option<String>,
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
    pub extra_metadata: Option<serde_json::Value>,
}

impl From<Row> for DbVoceComputo {
    fn from(row: Row) -> Self {
        Self {
            id: row.get("id"),
            computo_id: row.get("computo_id"),
            commessa_id: row.get("commessa_id"),
            order_index: row.get("order_index"),
            progressivo: row.get("progressivo"),
            code: row.get("code"),
            description: row.get("description"),
            uom: row.get("uom"),
            quantity: row.get("quantity"),
            unit_price: row.get("unit_price"),
            amount: row.get("amount"),
            note: row.get("note"),
            wbs1_code: row.get("wbs1_code"),
            wbs1_description: row.get("wbs1_description"),
            wbs2_code: row.get("wbs2_code"),
            wbs2_description: row.get("wbs2_description"),
            wbs3_code: row.get("wbs3_code"),
            wbs3_description: row.get("wbs3_description"),
            wbs4_code: row.get("wbs4_code"),
            wbs4_description: row.get("wbs4_description"),
            wbs5_code: row.get("wbs5_code"),
            wbs5_description: row.get("wbs5_description"),
            wbs6_code: row.get("wbs6_code"),
            wbs6_description: row.get("wbs6_description"),
            wbs7_code: row.get("wbs7_code"),
            wbs7_description: row.get("wbs7_description"),
            extra_metadata: row.get("extra_metadata"),
        }
    }
}

/// Normalized voce. Coexists with `DbVoceComputo` so WBS joins stay sane;
/// links to legacy are 1:1 when possible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbVoce {
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

impl From<Row> for DbVoce {
    fn from(row: Row) -> Self {
        Self {
            id: row.get("id"),
            commessa_id: row.get("commessa_id"),
            wbs6_id: row.get("wbs6_id"),
            wbs7_id: row.get("wbs7_id"),
            code: row.get("code"),
            description: row.get("description"),
            uom: row.get("uom"),
            order_index: row.get("order_index"),
            legacy_vocecomputo_id: row.get("legacy_vocecomputo_id"),
            price_list_item_id: row.get("price_list_item_id"),
        }
    }
}

/// Per-voce facts for a project computo: one per `(voce, computo)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbVoceProgetto {
    pub id: i64,
    pub voce_id: i64,
    pub computo_id: i64,
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub note: Option<String>,
}

impl From<Row> for DbVoceProgetto {
    fn from(row: Row) -> Self {
        Self {
            id: row.get("id"),
            voce_id: row.get("voce_id"),
            computo_id: row.get("computo_id"),
            quantity: row.get("quantity"),
            unit_price: row.get("unit_price"),
            amount: row.get("amount"),
            note: row.get("note"),
        }
    }
}

/// Per-voce facts for a return computo: carries bidder identity + round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbVoceOfferta {
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

impl From<Row> for DbVoceOfferta {
    fn from(row: Row) -> Self {
        Self {
            id: row.get("id"),
            voce_id: row.get("voce_id"),
            computo_id: row.get("computo_id"),
            impresa_id: row.get("impresa_id"),
            round_number: row.get("round_number"),
            quantity: row.get("quantity"),
            unit_price: row.get("unit_price"),
            amount: row.get("amount"),
            note: row.get("note"),
        }
    }
}

/// Catalog line. Identity is `(commessa_id, product_id)` when `product_id` is
/// set, else normalized code + signature (enforced by the catalog index, not
/// by a DB constraint, since the fallback key isn't a stored column).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbPriceListItem {
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
    pub price_lists: serde_json::Value,
    pub extra_metadata: serde_json::Value,
    pub source_file: Option<String>,
    pub preventivo_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Row> for DbPriceListItem {
    fn from(row: Row) -> Self {
        Self {
            id: row.get("id"),
            commessa_id: row.get("commessa_id"),
            product_id: row.get("product_id"),
            item_code: row.get("item_code"),
            item_description: row.get("item_description"),
            unit_id: row.get("unit_id"),
            unit_label: row.get("unit_label"),
            wbs6_code: row.get("wbs6_code"),
            wbs6_description: row.get("wbs6_description"),
            wbs7_code: row.get("wbs7_code"),
            wbs7_description: row.get("wbs7_description"),
            price_lists: row.get("price_lists"),
            extra_metadata: row.get("extra_metadata"),
            source_file: row.get("source_file"),
            preventivo_id: row.get("preventivo_id"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

/// Unique per `(computo_id, price_list_item_id)` — one price per catalog line
/// per return (I4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbPriceListOffer {
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

impl From<Row> for DbPriceListOffer {
    fn from(row: Row) -> Self {
        Self {
            id: row.get("id"),
            price_list_item_id: row.get("price_list_item_id"),
            commessa_id: row.get("commessa_id"),
            computo_id: row.get("computo_id"),
            impresa_id: row.get("impresa_id"),
            impresa_label: row.get("impresa_label"),
            round_number: row.get("round_number"),
            unit_price: row.get("unit_price"),
            quantity: row.get("quantity"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

/// Identity is `normalized_label` (I6); duplicate labels collapse via
/// getter-or-create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbImpresa {
    pub id: i64,
    pub label: String,
    pub normalized_label: String,
}

impl From<Row> for DbImpresa {
    fn from(row: Row) -> Self {
        Self {
            id: row.get("id"),
            label: row.get("label"),
            normalized_label: row.get("normalized_label"),
        }
    }
}

/// Singleton settings row (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbSettings {
    pub id: i32,
    pub criticita_media_percent: Decimal,
    pub criticita_alta_percent: Decimal,
    pub nlp_model_id: String,
    pub nlp_max_length: i32,
    pub nlp_batch_size: i32,
}

impl From<Row> for DbSettings {
    fn from(row: Row) -> Self {
        Self {
            id: row.get("id"),
            criticita_media_percent: row.get("criticita_media_percent"),
            criticita_alta_percent: row.get("criticita_alta_percent"),
            nlp_model_id: row.get("nlp_model_id"),
            nlp_max_length: row.get("nlp_max_length"),
            nlp_batch_size: row.get("nlp_batch_size"),
        }
    }
}
