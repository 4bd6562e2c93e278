//! Cross-bidder WBS aggregation and criticality classification (spec §4.7,
//! component C7). Grounded on `original_source`'s `analysis/core.py`
//! (`_aggregation_key`, `_merge_entries`, `_build_wbs6_voce`,
//! `classify_delta`), with the "average offer" formula following the
//! specification's explicit divide-by-total-bidders rule rather than the
//! source's `fmean` over only the bidders who actually bid (spec §4.7 step 5
//! / P6).

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

pub const WBS6_UNCLASSIFIED_LABEL: &str = "Non Classificata WBS6";

#[derive(Debug, Clone, Default)]
pub struct BidderLine {
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub note: Option<String>,
}

/// One project line merged across every bidder's return (spec §4.7 step 2).
#[derive(Debug, Clone)]
pub struct ReconciledEntry {
    pub voce_id: i64,
    pub aggregation_key: String,
    pub code: Option<String>,
    pub description: Option<String>,
    pub uom: Option<String>,
    pub quantity: Decimal,
    pub unit_price_project: Option<Decimal>,
    pub amount_project: Decimal,
    pub wbs6_code: Option<String>,
    pub wbs6_description: Option<String>,
    pub wbs7_code: Option<String>,
    pub wbs7_description: Option<String>,
    pub offerte: HashMap<String, BidderLine>,
}

/// Source input: one project line plus, per bidder, the corresponding
/// aligned return line at the same position (guaranteed same length as the
/// project by the alignment engine's P1 invariant).
pub struct ProjectLineInput<'a> {
    pub voce_id: i64,
    pub code: Option<&'a str>,
    pub description: Option<&'a str>,
    pub uom: Option<&'a str>,
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub wbs5_code: Option<&'a str>,
    pub wbs6_code: Option<&'a str>,
    pub wbs6_description: Option<&'a str>,
    pub wbs7_code: Option<&'a str>,
    pub wbs7_description: Option<&'a str>,
}

pub struct BidderReturn<'a> {
    pub bidder_label: String,
    /// One entry per project line, in the same order, `None` where the
    /// catalog carries no offer override for that line.
    pub lines: Vec<Option<BidderLineInput<'a>>>,
}

pub struct BidderLineInput<'a> {
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub note: Option<&'a str>,
    /// Catalog unit price override (spec §4.7 step 3): when present it
    /// replaces `unit_price` and `amount` is recomputed against the
    /// offer's own quantity (falling back to the return's quantity).
    pub catalog_override_price: Option<Decimal>,
}

fn aggregation_key(line: &ProjectLineInput) -> String {
    for candidate in [
        line.code,
        line.description,
        line.wbs7_code,
        line.wbs6_code,
        line.wbs5_code,
    ] {
        if let Some(text) = candidate {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    format!("voce-{}", line.voce_id)
}

fn round4(value: Decimal) -> Decimal {
    value.round_dp(4)
}

fn round2(value: Decimal) -> Decimal {
    value.round_dp(2)
}

/// `build_commessa_dataset`'s merge step (spec §4.7 steps 1-5). Entries
/// whose code appears at any level in `hidden_codes` are dropped first
/// (step 4); the rest are merged by `aggregation_key`, summing quantities
/// and amounts and recomputing `unit_price = amount / qty`.
pub fn build_commessa_dataset(
    project_lines: &[ProjectLineInput],
    returns: &[BidderReturn],
    hidden_codes: &HashSet<String>,
) -> Vec<ReconciledEntry> {
    let mut bucket: HashMap<String, ReconciledEntry> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for (idx, project) in project_lines.iter().enumerate() {
        if is_hidden(project, hidden_codes) {
            continue;
        }

        let key = aggregation_key(project);
        let project_qty = project.quantity.unwrap_or(Decimal::ZERO);
        let project_amount = project.amount.unwrap_or(Decimal::ZERO);

        let entry = bucket.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            ReconciledEntry {
                voce_id: project.voce_id,
                aggregation_key: key.clone(),
                code: project.code.map(|s| s.to_string()),
                description: project.description.map(|s| s.to_string()),
                uom: project.uom.map(|s| s.to_string()),
                quantity: Decimal::ZERO,
                unit_price_project: None,
                amount_project: Decimal::ZERO,
                wbs6_code: project.wbs6_code.map(|s| s.to_string()),
                wbs6_description: project.wbs6_description.map(|s| s.to_string()),
                wbs7_code: project.wbs7_code.map(|s| s.to_string()),
                wbs7_description: project.wbs7_description.map(|s| s.to_string()),
                offerte: HashMap::new(),
            }
        });
        entry.quantity += project_qty;
        entry.amount_project += project_amount;
        if entry.uom.is_none() {
            entry.uom = project.uom.map(|s| s.to_string());
        }

        for ret in returns {
            let Some(Some(bidder_line)) = ret.lines.get(idx) else {
                continue;
            };
            let mut quantity = bidder_line.quantity;
            let mut unit_price = bidder_line.unit_price;
            let mut amount = bidder_line.amount;

            if let Some(override_price) = bidder_line.catalog_override_price {
                unit_price = Some(override_price);
                let offer_qty = quantity.or(project.quantity).unwrap_or(Decimal::ZERO);
                amount = Some(round2(override_price * offer_qty));
                if quantity.is_none() {
                    quantity = Some(offer_qty);
                }
            }

            let bidder_entry = entry
                .offerte
                .entry(ret.bidder_label.clone())
                .or_insert_with(BidderLine::default);
            bidder_entry.quantity = Some(bidder_entry.quantity.unwrap_or(Decimal::ZERO) + quantity.unwrap_or(Decimal::ZERO));
            bidder_entry.amount = Some(bidder_entry.amount.unwrap_or(Decimal::ZERO) + amount.unwrap_or(Decimal::ZERO));
            if unit_price.is_some() {
                bidder_entry.unit_price = unit_price;
            }
            if let Some(note) = bidder_line.note {
                if !note.is_empty() {
                    bidder_entry.note = Some(note.to_string());
                }
            }
        }
    }

    for key in &order {
        let entry = bucket.get_mut(key).unwrap();
        if !entry.quantity.is_zero() {
            entry.unit_price_project = Some(round4(entry.amount_project / entry.quantity));
        }
        for bidder in entry.offerte.values_mut() {
            if let (Some(qty), Some(amount)) = (bidder.quantity, bidder.amount) {
                if !qty.is_zero() {
                    bidder.unit_price = Some(round4(amount / qty));
                }
            }
        }
    }

    order.into_iter().map(|key| bucket.remove(&key).unwrap()).collect()
}

fn is_hidden(project: &ProjectLineInput, hidden_codes: &HashSet<String>) -> bool {
    if hidden_codes.is_empty() {
        return false;
    }
    [
        project.code,
        project.wbs5_code,
        project.wbs6_code,
        project.wbs7_code,
    ]
    .into_iter()
    .flatten()
    .any(|code| hidden_codes.contains(code))
}

/// `classify_delta` (spec §4.7): classifies the absolute percentage delta
/// against the commessa's criticality thresholds.
pub fn classify_delta(delta_percent: Option<f64>, media_percent: f64, alta_percent: f64) -> &'static str {
    let Some(delta) = delta_percent else {
        return "bassa";
    };
    let value = delta.abs();
    if value >= alta_percent {
        "alta"
    } else if value >= media_percent {
        "media"
    } else {
        "bassa"
    }
}

#[derive(Debug, Clone)]
pub struct Wbs6Voce {
    pub code: Option<String>,
    pub description: Option<String>,
    pub uom: Option<String>,
    pub quantity: Decimal,
    pub unit_price_project: Option<Decimal>,
    pub amount_project: Decimal,
    pub media_prezzo_unitario: Option<f64>,
    pub media_importo_totale: Option<f64>,
    pub delta_percentuale: Option<f64>,
    pub delta_assoluto: Option<f64>,
    pub offerte_considerate: usize,
    pub importo_minimo: Option<f64>,
    pub importo_massimo: Option<f64>,
    pub impresa_min: Option<String>,
    pub impresa_max: Option<String>,
    pub deviazione_standard: Option<f64>,
    pub criticita: &'static str,
    pub direzione: &'static str,
}

#[derive(Debug, Clone)]
pub struct Wbs6Category {
    pub wbs6_code: Option<String>,
    pub wbs6_description: Option<String>,
    pub label: String,
    pub project_total: f64,
    pub average_offer: f64,
    pub delta_percentuale: f64,
    pub delta_assoluto: f64,
    pub voci: Vec<Wbs6Voce>,
    pub conteggi_criticita: CriticitaCounts,
}

#[derive(Debug, Clone, Default)]
pub struct CriticitaCounts {
    pub alta: usize,
    pub media: usize,
    pub bassa: usize,
}

fn wbs6_identity(entry: &ReconciledEntry) -> (String, String) {
    let code = entry.wbs6_code.clone();
    let description = entry
        .wbs6_description
        .clone()
        .or_else(|| code.clone())
        .unwrap_or_else(|| WBS6_UNCLASSIFIED_LABEL.to_string());
    (
        code.unwrap_or_else(|| WBS6_UNCLASSIFIED_LABEL.to_string()),
        description,
    )
}

fn population_stdev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

fn build_wbs6_voce(entry: &ReconciledEntry, total_bidders: usize, media_percent: f64, alta_percent: f64) -> Wbs6Voce {
    let project_price = entry
        .unit_price_project
        .map(|d| d.to_f64().unwrap_or(0.0));
    let project_amount = entry.amount_project.to_f64().unwrap_or(0.0);

    let offered_amounts: f64 = entry
        .offerte
        .values()
        .filter_map(|o| o.amount)
        .map(|d| d.to_f64().unwrap_or(0.0))
        .sum();
    let average_amount = if total_bidders > 0 {
        offered_amounts / total_bidders as f64
    } else {
        0.0
    };

    let prices: Vec<f64> = entry
        .offerte
        .values()
        .filter_map(|o| o.unit_price)
        .map(|d| d.to_f64().unwrap_or(0.0))
        .collect();
    let media_prezzo = if prices.is_empty() {
        None
    } else {
        Some(prices.iter().sum::<f64>() / prices.len() as f64)
    };

    let delta = match project_price {
        Some(p) if p.abs() > 1e-9 => {
            media_prezzo.map(|mp| (mp - p) / p * 100.0)
        }
        _ => None,
    };

    let delta_assoluto = Some(average_amount - project_amount);
    let criticita = classify_delta(delta, media_percent, alta_percent);
    let direzione = match delta {
        Some(d) if d > 0.0 => "positivo",
        Some(d) if d < 0.0 => "negativo",
        _ => "neutro",
    };

    let importi_details: Vec<(String, f64)> = entry
        .offerte
        .iter()
        .filter_map(|(name, o)| o.amount.map(|a| (name.clone(), a.to_f64().unwrap_or(0.0))))
        .collect();
    let (impresa_min, importo_minimo) = importi_details
        .iter()
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
        .map(|(name, v)| (Some(name.clone()), Some(*v)))
        .unwrap_or((None, None));
    let (impresa_max, importo_massimo) = importi_details
        .iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
        .map(|(name, v)| (Some(name.clone()), Some(*v)))
        .unwrap_or((None, None));

    let amounts: Vec<f64> = importi_details.iter().map(|(_, v)| *v).collect();
    let deviazione_standard = population_stdev(&amounts);

    Wbs6Voce {
        code: entry.code.clone(),
        description: entry.description.clone(),
        uom: entry.uom.clone(),
        quantity: entry.quantity,
        unit_price_project: entry.unit_price_project,
        amount_project: entry.amount_project,
        media_prezzo_unitario: media_prezzo,
        media_importo_totale: if amounts.is_empty() {
            None
        } else {
            Some(amounts.iter().sum::<f64>() / amounts.len() as f64)
        },
        delta_percentuale: delta,
        delta_assoluto,
        offerte_considerate: prices.len(),
        importo_minimo,
        importo_massimo,
        impresa_min,
        impresa_max,
        deviazione_standard,
        criticita,
        direzione,
    }
}

/// `build_wbs6_analysis` (spec §4.7 step following `build_commessa_dataset`):
/// groups merged entries by `(wbs6_code, wbs6_description)` and computes
/// per-category and per-line criticality.
pub fn build_wbs6_analysis(
    entries: &[ReconciledEntry],
    total_bidders: usize,
    media_percent: f64,
    alta_percent: f64,
) -> Vec<Wbs6Category> {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut grouped: HashMap<(String, String), Vec<&ReconciledEntry>> = HashMap::new();
    for entry in entries {
        let identity = wbs6_identity(entry);
        if !grouped.contains_key(&identity) {
            order.push(identity.clone());
        }
        grouped.entry(identity).or_default().push(entry);
    }

    order
        .into_iter()
        .map(|identity| {
            let members = grouped.remove(&identity).unwrap_or_default();
            let (code, description) = identity;
            let label = if code != WBS6_UNCLASSIFIED_LABEL {
                format!("{code} - {description}")
            } else {
                WBS6_UNCLASSIFIED_LABEL.to_string()
            };

            let project_total: f64 = members
                .iter()
                .map(|e| e.amount_project.to_f64().unwrap_or(0.0))
                .sum();
            let average_offer: f64 = members
                .iter()
                .map(|e| {
                    let sum: f64 = e
                        .offerte
                        .values()
                        .filter_map(|o| o.amount)
                        .map(|d| d.to_f64().unwrap_or(0.0))
                        .sum();
                    if total_bidders > 0 {
                        sum / total_bidders as f64
                    } else {
                        0.0
                    }
                })
                .sum();
            let delta_percentuale = if project_total.abs() > 1e-9 {
                (average_offer - project_total) / project_total * 100.0
            } else {
                0.0
            };
            let delta_assoluto = average_offer - project_total;

            let mut counts = CriticitaCounts::default();
            let voci: Vec<Wbs6Voce> = members
                .iter()
                .map(|entry| {
                    let voce = build_wbs6_voce(entry, total_bidders, media_percent, alta_percent);
                    match voce.criticita {
                        "alta" => counts.alta += 1,
                        "media" => counts.media += 1,
                        _ => counts.bassa += 1,
                    }
                    voce
                })
                .collect();

            Wbs6Category {
                wbs6_code: if code == WBS6_UNCLASSIFIED_LABEL { None } else { Some(code) },
                wbs6_description: Some(description),
                label,
                project_total,
                average_offer,
                delta_percentuale,
                delta_assoluto,
                voci,
                conteggi_criticita: counts,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(voce_id: i64, code: &str, qty: f64, price: f64, wbs6: &str) -> ProjectLineInput<'static> {
        ProjectLineInput {
            voce_id,
            code: Some(Box::leak(code.to_string().into_boxed_str())),
            description: None,
            uom: None,
            quantity: Decimal::from_f64(qty),
            unit_price: Decimal::from_f64(price),
            amount: Decimal::from_f64(qty * price),
            wbs5_code: None,
            wbs6_code: Some(Box::leak(wbs6.to_string().into_boxed_str())),
            wbs6_description: None,
            wbs7_code: None,
            wbs7_description: None,
        }
    }

    #[test]
    fn test_p6_wbs6_average_counts_absent_bidders_as_zero() {
        let lines = vec![project(1, "A001", 10.0, 10.0, "A001")];
        let returns = vec![
            BidderReturn {
                bidder_label: "Alpha".to_string(),
                lines: vec![Some(BidderLineInput {
                    quantity: Decimal::from_f64(10.0),
                    unit_price: Decimal::from_f64(12.0),
                    amount: Decimal::from_f64(120.0),
                    note: None,
                    catalog_override_price: None,
                })],
            },
            BidderReturn {
                bidder_label: "Beta".to_string(),
                lines: vec![None],
            },
        ];
        let entries = build_commessa_dataset(&lines, &returns, &HashSet::new());
        let analysis = build_wbs6_analysis(&entries, 2, 25.0, 50.0);
        assert_eq!(analysis.len(), 1);
        assert_eq!(analysis[0].average_offer, 60.0);
    }

    #[test]
    fn test_classify_delta_thresholds() {
        assert_eq!(classify_delta(Some(10.0), 25.0, 50.0), "bassa");
        assert_eq!(classify_delta(Some(30.0), 25.0, 50.0), "media");
        assert_eq!(classify_delta(Some(-60.0), 25.0, 50.0), "alta");
        assert_eq!(classify_delta(None, 25.0, 50.0), "bassa");
    }

    #[test]
    fn test_hidden_codes_are_excluded() {
        let lines = vec![project(1, "A001", 10.0, 10.0, "A001")];
        let mut hidden = HashSet::new();
        hidden.insert("A001".to_string());
        let entries = build_commessa_dataset(&lines, &[], &hidden);
        assert!(entries.is_empty());
    }

    #[test]
    fn test_aggregation_merges_by_key() {
        let lines = vec![
            project(1, "A001", 5.0, 10.0, "A001"),
            project(2, "A001", 5.0, 10.0, "A001"),
        ];
        let entries = build_commessa_dataset(&lines, &[], &HashSet::new());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].quantity, Decimal::from_f64(10.0).unwrap());
    }
}
