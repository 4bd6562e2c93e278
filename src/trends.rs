//! Cross-round bidder trends and WBS6 × bidder competitiveness heatmap
//! (spec §4.8, component C8). Grounded on `original_source`'s
//! `analysis/trends.py` (`trend_round`, `heatmap_competitivita`, the fixed
//! 8-entry bidder color palette keyed by base label).

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::wbs_aggregation::ReconciledEntry;

/// Fixed palette so the same bidder gets the same color across every round
/// and every chart, independent of insertion order (spec §4.8).
const BIDDER_PALETTE: [&str; 8] = [
    "#2563eb", "#db2777", "#059669", "#d97706", "#7c3aed", "#0891b2", "#dc2626", "#65a30d",
];

/// One round's offer amount for a bidder, plus its round-over-round delta.
#[derive(Debug, Clone)]
pub struct RoundOffer {
    pub round_number: i32,
    pub round_label: String,
    pub importo: f64,
    pub delta_percent: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct BidderTrend {
    pub bidder_label: String,
    pub color: String,
    pub offerte: Vec<RoundOffer>,
    pub delta_complessivo: Option<f64>,
}

/// Deterministic color for a bidder, keyed by its normalized base label
/// (stripped of any `"(N)"` duplicate-round suffix) so a renumbered label
/// still maps to the same slot.
fn bidder_color(base_label: &str) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in base_label.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    BIDDER_PALETTE[(hash % BIDDER_PALETTE.len() as u64) as usize].to_string()
}

fn delta_percent(current: f64, previous: f64) -> Option<f64> {
    if previous.abs() > 1e-9 {
        Some((current - previous) / previous * 100.0)
    } else {
        None
    }
}

/// One `(round_number, bidder_label)` -> total offered amount for that round,
/// as summed across every reconciled entry's per-bidder amount. Rounds
/// without a recorded entry for a bidder are simply absent from `by_round`.
pub struct RoundTotals<'a> {
    pub round_number: i32,
    pub totals_by_bidder: HashMap<&'a str, Decimal>,
}

/// `trend_round` (spec §4.8): per-bidder series indexed by round, with
/// `delta` computed against the prior round and `delta_complessivo` against
/// the first round the bidder appears in. `impresa_filter`, when set,
/// restricts the series to a single normalized bidder label.
pub fn trend_round(rounds: &[RoundTotals], impresa_filter: Option<&str>) -> Vec<BidderTrend> {
    let mut ordered_rounds: Vec<&RoundTotals> = rounds.iter().collect();
    ordered_rounds.sort_by_key(|r| r.round_number);

    let mut bidder_order: Vec<String> = Vec::new();
    let mut per_bidder: HashMap<String, Vec<(i32, f64)>> = HashMap::new();
    for round in &ordered_rounds {
        let mut labels: Vec<&&str> = round.totals_by_bidder.keys().collect();
        labels.sort();
        for label in labels {
            if let Some(filter) = impresa_filter {
                if *label != filter {
                    continue;
                }
            }
            let amount = round.totals_by_bidder[label].to_f64().unwrap_or(0.0);
            if !per_bidder.contains_key(*label) {
                bidder_order.push((*label).to_string());
            }
            per_bidder
                .entry((*label).to_string())
                .or_default()
                .push((round.round_number, amount));
        }
    }

    bidder_order
        .into_iter()
        .map(|bidder_label| {
            let series = per_bidder.remove(&bidder_label).unwrap_or_default();
            let first_amount = series.first().map(|(_, a)| *a);
            let mut offerte = Vec::with_capacity(series.len());
            let mut previous: Option<f64> = None;
            for (round_number, importo) in &series {
                let delta = previous.and_then(|prev| delta_percent(*importo, prev));
                offerte.push(RoundOffer {
                    round_number: *round_number,
                    round_label: format!("Round {round_number}"),
                    importo: *importo,
                    delta_percent: delta,
                });
                previous = Some(*importo);
            }
            let delta_complessivo = match (first_amount, series.last()) {
                (Some(first), Some((_, last))) => delta_percent(*last, first),
                _ => None,
            };
            BidderTrend {
                color: bidder_color(&bidder_label),
                bidder_label,
                offerte,
                delta_complessivo,
            }
        })
        .collect()
}

/// One heatmap cell: the offered amount and percentage delta vs. the
/// project amount for a `(wbs6, bidder)` pair. Bidders who did not bid on a
/// category get `(0.0, 0.0)` rather than being omitted (spec §4.8).
#[derive(Debug, Clone, Copy, Default)]
pub struct HeatmapCell {
    pub importo_offerta: f64,
    pub delta_percent: f64,
}

#[derive(Debug, Clone)]
pub struct HeatmapRow {
    pub wbs6_code: Option<String>,
    pub wbs6_label: String,
    pub project_amount: f64,
    pub cells: HashMap<String, HeatmapCell>,
}

/// `heatmap_competitivita` (spec §4.8): WBS6 × bidder matrix, rows sorted by
/// project amount descending. `round_number`, when set, restricts the
/// underlying entries to offers recorded for that round (callers filter
/// `entries` before calling this, since round membership lives on the
/// offer/computo, not on `ReconciledEntry`).
pub fn heatmap_competitivita(entries: &[ReconciledEntry], bidder_labels: &[String]) -> Vec<HeatmapRow> {
    let mut order: Vec<(Option<String>, String)> = Vec::new();
    let mut grouped: HashMap<(Option<String>, String), Vec<&ReconciledEntry>> = HashMap::new();

    for entry in entries {
        let code = entry.wbs6_code.clone();
        let label = entry
            .wbs6_description
            .clone()
            .or_else(|| code.clone())
            .unwrap_or_else(|| "Non Classificata WBS6".to_string());
        let key = (code, label);
        if !grouped.contains_key(&key) {
            order.push(key.clone());
        }
        grouped.entry(key).or_default().push(entry);
    }

    let mut rows: Vec<HeatmapRow> = order
        .into_iter()
        .map(|(wbs6_code, wbs6_label)| {
            let members = grouped.remove(&(wbs6_code.clone(), wbs6_label.clone())).unwrap_or_default();
            let project_amount: f64 = members
                .iter()
                .map(|e| e.amount_project.to_f64().unwrap_or(0.0))
                .sum();

            let mut cells: HashMap<String, HeatmapCell> = HashMap::new();
            for bidder in bidder_labels {
                let offered: f64 = members
                    .iter()
                    .filter_map(|e| e.offerte.get(bidder))
                    .filter_map(|line| line.amount)
                    .map(|d| d.to_f64().unwrap_or(0.0))
                    .sum();
                let delta = if project_amount.abs() > 1e-9 {
                    (offered - project_amount) / project_amount * 100.0
                } else {
                    0.0
                };
                cells.insert(
                    bidder.clone(),
                    HeatmapCell {
                        importo_offerta: offered,
                        delta_percent: delta,
                    },
                );
            }

            HeatmapRow {
                wbs6_code,
                wbs6_label,
                project_amount,
                cells,
            }
        })
        .collect();

    rows.sort_by(|a, b| b.project_amount.partial_cmp(&a.project_amount).unwrap_or(std::cmp::Ordering::Equal));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bidder_color_is_deterministic() {
        assert_eq!(bidder_color("impresa alpha"), bidder_color("impresa alpha"));
    }

    #[test]
    fn test_trend_round_computes_delta_against_prior_round() {
        let mut round1 = HashMap::new();
        round1.insert("alpha", Decimal::from(100));
        let mut round2 = HashMap::new();
        round2.insert("alpha", Decimal::from(120));
        let rounds = vec![
            RoundTotals { round_number: 1, totals_by_bidder: round1 },
            RoundTotals { round_number: 2, totals_by_bidder: round2 },
        ];
        let trends = trend_round(&rounds, None);
        assert_eq!(trends.len(), 1);
        assert_eq!(trends[0].offerte[0].delta_percent, None);
        assert_eq!(trends[0].offerte[1].delta_percent, Some(20.0));
        assert_eq!(trends[0].delta_complessivo, Some(20.0));
    }

    #[test]
    fn test_trend_round_filters_by_impresa() {
        let mut round1 = HashMap::new();
        round1.insert("alpha", Decimal::from(100));
        round1.insert("beta", Decimal::from(200));
        let rounds = vec![RoundTotals { round_number: 1, totals_by_bidder: round1 }];
        let trends = trend_round(&rounds, Some("alpha"));
        assert_eq!(trends.len(), 1);
        assert_eq!(trends[0].bidder_label, "alpha");
    }

    #[test]
    fn test_heatmap_absent_bidder_is_zero_not_omitted() {
        let entry = ReconciledEntry {
            voce_id: 1,
            aggregation_key: "A001".into(),
            code: Some("A001".into()),
            description: None,
            uom: None,
            quantity: Decimal::from(10),
            unit_price_project: Some(Decimal::from(10)),
            amount_project: Decimal::from(100),
            wbs6_code: Some("A001".into()),
            wbs6_description: Some("Strutture".into()),
            wbs7_code: None,
            wbs7_description: None,
            offerte: HashMap::new(),
        };
        let bidders = vec!["alpha".to_string(), "beta".to_string()];
        let rows = heatmap_competitivita(&[entry], &bidders);
        assert_eq!(rows.len(), 1);
        let cell = rows[0].cells.get("beta").unwrap();
        assert_eq!(cell.importo_offerta, 0.0);
        assert_eq!(cell.delta_percent, 0.0);
    }
}
