//! Line-item alignment engine (spec §4.4, component C4).
//!
//! Matches a parsed return (`ritorno gara`) against the commessa's live
//! project estimate, line by line, producing a project-shaped result set
//! the caller persists as the return computo's own `VoceComputo` rows.
//! Grounded on `original_source`'s `matching/legacy.py` (`_align_return_rows`
//! and friends), with the group-allocation path of `_align_totals_return`
//! left out — the description-only mode below follows the simpler,
//! self-contained algorithm its own contract describes.

use crate::config::MatchingConfig;
use crate::models::{ExtraMetadata, ParsedVoce, VoceComputo};
use crate::normalization::{
    descr_tokens, jaccard_similarity, normalize_code_token, wbs_base_key_from_parsed,
    WbsLevelRef as NormWbsLevel,
};
use rust_decimal::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};

const FORCED_ZERO_CODE_PREFIXES: &[&str] = &["A004010"];
const FORCED_ZERO_DESCRIPTION_KEYWORDS: &[&str] =
    &["mark up fee", "mark-up fee", "markup fee"];
const MAX_CANDIDATES_FILTER: usize = 100;
const MAX_CANDIDATES_FINAL: usize = 30;
const MIN_TOKEN_LENGTH: usize = 4;
const QUANTITY_TOLERANCE: f64 = 1e-4;
const PRICE_CONFLICT_TOLERANCE: f64 = 0.01;
const TOTAL_AMOUNT_TOLERANCE: f64 = 0.01;
const TOTAL_QUANTITY_TOLERANCE: f64 = 1e-4;

/// One matched (project, return) label pair, used downstream to recover the
/// `Voce.legacy_vocecomputo_id` cross-reference (spec §4.7 step 2).
#[derive(Debug, Clone)]
pub struct LegacyPair {
    pub project_order_index: i32,
    pub return_entry_index: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct PriceAdjustment {
    pub label: String,
    pub original: f64,
    pub adjusted: f64,
}

#[derive(Debug, Clone)]
pub struct ZeroGuardViolation {
    pub label: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub amount: f64,
}

#[derive(Debug, Clone)]
pub struct MatchedLabel {
    pub project_label: String,
    pub excel_label: String,
    pub price: Option<f64>,
    pub project_quantity: Option<f64>,
    pub return_quantity: Option<f64>,
    pub quantity_delta: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ReturnAlignmentResult {
    pub aligned_lines: Vec<VoceComputo>,
    pub legacy_pairs: Vec<LegacyPair>,
    pub matched_count: usize,
    pub price_adjustments: Vec<PriceAdjustment>,
    pub zero_guard_inputs: Vec<ZeroGuardViolation>,
    pub return_only_labels: Vec<String>,
    pub progress_quantity_mismatches: Vec<String>,
    pub progress_price_conflicts: Vec<String>,
    pub excel_only_groups: Vec<String>,
    pub matched_labels: Vec<MatchedLabel>,
    pub missing_labels: Vec<MatchedLabel>,
    pub total_amount_note: Option<String>,
    pub quantity_totals_note: Option<String>,
}

/// Returns the label legacy.py builds for warnings and the matching report:
/// `"{progressivo} - {code} - {description}"`, falling back to an ordinal.
fn voce_label(progressivo: Option<i64>, code: Option<&str>, description: Option<&str>, order_index: i32) -> String {
    let mut label_parts = Vec::new();
    if let Some(p) = progressivo {
        label_parts.push(p.to_string());
    }
    if let Some(c) = code {
        if !c.is_empty() {
            label_parts.push(c.to_string());
        }
    }
    if let Some(d) = description {
        if !d.is_empty() {
            label_parts.push(d.to_string());
        }
    }
    if label_parts.is_empty() {
        return format!("Voce ordine {order_index}");
    }
    shorten_label(&label_parts.join(" - "))
}

fn shorten_label(label: &str) -> String {
    if label.chars().count() <= 120 {
        label.to_string()
    } else {
        let truncated: String = label.chars().take(120).collect();
        format!("{truncated}...")
    }
}

/// P4: never increases `|p|`; a no-op unless the return price looks like an
/// off-by-1000 data entry error relative to the project's own price.
pub fn stabilize_return_price(value: f64, reference_price: Option<f64>) -> (f64, bool) {
    let reference = match reference_price {
        Some(r) if r.abs() >= 1.0 => r,
        _ => return (value, false),
    };
    if value.abs() < 1000.0 {
        return (value, false);
    }
    let ratio = value.abs() / reference.abs();
    if ratio <= 250.0 {
        return (value, false);
    }
    let mut candidate = value;
    for _ in 0..4 {
        candidate /= 1000.0;
        if candidate.abs() < 1000.0 || candidate.abs() / reference.abs() <= 250.0 {
            return (candidate, true);
        }
    }
    (value, false)
}

fn requires_zero_guard(code: Option<&str>, description: Option<&str>) -> bool {
    if let Some(c) = code {
        let normalized = normalize_code_token(Some(c));
        if FORCED_ZERO_CODE_PREFIXES
            .iter()
            .any(|prefix| normalized.starts_with(prefix))
        {
            return true;
        }
    }
    if let Some(d) = description {
        let lowered = d.to_lowercase();
        if FORCED_ZERO_DESCRIPTION_KEYWORDS
            .iter()
            .any(|kw| lowered.contains(kw))
        {
            return true;
        }
    }
    false
}

fn decimal_amount(value: f64) -> Decimal {
    Decimal::from_f64(value)
        .unwrap_or(Decimal::ZERO)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn decimal_price(value: f64) -> Decimal {
    Decimal::from_f64(value)
        .unwrap_or(Decimal::ZERO)
        .round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
}

fn decimal_quantity(value: f64) -> Decimal {
    Decimal::from_f64(value)
        .unwrap_or(Decimal::ZERO)
        .round_dp_with_strategy(6, RoundingStrategy::MidpointAwayFromZero)
}

/// Consistent with `_calculate_line_amount`: zero quantity always yields a
/// zero amount regardless of price.
fn calculate_line_amount(quantity: Option<f64>, price: Option<f64>) -> (Option<f64>, Option<f64>) {
    let (Some(q), Some(p)) = (quantity, price) else {
        return (quantity, None);
    };
    if q == 0.0 {
        return (Some(0.0), Some(0.0));
    }
    (Some(q), Some(q * p))
}

struct ReturnWrapper {
    tokens: HashSet<String>,
    code_norm: Option<String>,
    description: Option<String>,
    progressivo: Option<i64>,
    unit_price: Option<f64>,
    quantity: Option<f64>,
    amount: Option<f64>,
    wbs_base_key: Option<String>,
    used: Cell<bool>,
    matched: Cell<bool>,
    preferred_project_order: Cell<Option<i32>>,
}

fn wbs_levels_of(voce: &ParsedVoce) -> Vec<NormWbsLevel<'_>> {
    voce.wbs_levels
        .iter()
        .map(|l| NormWbsLevel {
            level: l.level,
            code: l.code.as_deref(),
            description: l.description.as_deref(),
        })
        .collect()
}

struct ReturnIndex {
    wrappers: Vec<ReturnWrapper>,
    code_index: HashMap<String, Vec<usize>>,
    wbs_index: HashMap<String, Vec<usize>>,
    word_index: HashMap<String, Vec<usize>>,
}

fn build_return_index(return_lines: &[ParsedVoce]) -> ReturnIndex {
    let mut wrappers = Vec::with_capacity(return_lines.len());
    let mut code_index: HashMap<String, Vec<usize>> = HashMap::new();
    let mut wbs_index: HashMap<String, Vec<usize>> = HashMap::new();
    let mut word_index: HashMap<String, Vec<usize>> = HashMap::new();

    for (idx, voce) in return_lines.iter().enumerate() {
        let tokens = descr_tokens(voce.description.as_deref());
        let levels = wbs_levels_of(voce);
        let wbs_base_key =
            wbs_base_key_from_parsed(&levels, voce.code.as_deref(), voce.description.as_deref());
        let code_norm = voce
            .code
            .as_deref()
            .map(|c| normalize_code_token(Some(c)))
            .filter(|c| !c.is_empty());

        if let Some(code) = &code_norm {
            code_index.entry(code.clone()).or_default().push(idx);
        }
        if let Some(base) = &wbs_base_key {
            wbs_index
                .entry(format!("__wbs__:{base}"))
                .or_default()
                .push(idx);
        }
        for tok in &tokens {
            if tok.chars().count() >= MIN_TOKEN_LENGTH {
                word_index.entry(tok.clone()).or_default().push(idx);
            }
        }

        wrappers.push(ReturnWrapper {
            tokens,
            code_norm,
            description: voce.description.clone(),
            progressivo: voce.progressivo,
            unit_price: voce.unit_price,
            quantity: voce.quantity,
            amount: voce.amount,
            wbs_base_key,
            used: Cell::new(false),
            matched: Cell::new(false),
            preferred_project_order: Cell::new(None),
        });
    }

    ReturnIndex {
        wrappers,
        code_index,
        wbs_index,
        word_index,
    }
}

/// Best Jaccard-scoring unused wrapper among `candidates`, honoring a
/// previously assigned preference (spec §4.4.1 step 1) when present.
fn best_in_bucket(
    candidates: &[usize],
    wrappers: &[ReturnWrapper],
    project_order: i32,
    project_tokens: &HashSet<String>,
    min_jaccard: f64,
) -> Option<usize> {
    if let Some(&preferred) = candidates.iter().find(|&&i| {
        !wrappers[i].used.get() && wrappers[i].preferred_project_order.get() == Some(project_order)
    }) {
        return Some(preferred);
    }
    let mut best: Option<(usize, f64)> = None;
    for &idx in candidates {
        if wrappers[idx].used.get() {
            continue;
        }
        let score = jaccard_similarity(&wrappers[idx].tokens, project_tokens);
        if score >= min_jaccard && best.map_or(true, |(_, b)| score > b) {
            best = Some((idx, score));
        }
    }
    best.map(|(idx, _)| idx)
}

/// Looser fallback used both when the bucket cascade yields no candidate
/// above the Jaccard threshold and within description-only mode: token
/// overlap divided by the larger of the two token sets.
fn description_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let overlap = a.intersection(b).count() as f64;
    overlap / a.len().max(b.len()) as f64
}

fn pick_match(
    index: &ReturnIndex,
    project_order: i32,
    project_code_norm: Option<&str>,
    project_wbs_base: Option<&str>,
    project_tokens: &HashSet<String>,
    config: &MatchingConfig,
) -> Option<usize> {
    if let Some(base) = project_wbs_base {
        if let Some(candidates) = index.wbs_index.get(&format!("__wbs__:{base}")) {
            if let Some(found) = best_in_bucket(
                candidates,
                &index.wrappers,
                project_order,
                project_tokens,
                config.jaccard_min_threshold,
            ) {
                return Some(found);
            }
        }
    }

    if let Some(code) = project_code_norm {
        if let Some(candidates) = index.code_index.get(code) {
            if let Some(&found) = candidates.iter().find(|&&i| !index.wrappers[i].used.get()) {
                return Some(found);
            }
        }
    }

    let mut gathered: Vec<usize> = Vec::new();
    let mut seen: HashSet<usize> = HashSet::new();
    'outer: for tok in project_tokens {
        if tok.chars().count() < MIN_TOKEN_LENGTH {
            continue;
        }
        if let Some(candidates) = index.word_index.get(tok) {
            for &idx in candidates {
                if index.wrappers[idx].used.get() {
                    continue;
                }
                if seen.insert(idx) {
                    gathered.push(idx);
                    if gathered.len() >= MAX_CANDIDATES_FILTER {
                        break 'outer;
                    }
                }
            }
        }
    }
    if gathered.is_empty() {
        return None;
    }
    gathered.truncate(MAX_CANDIDATES_FINAL);

    let mut best: Option<(usize, f64)> = None;
    for &idx in &gathered {
        let score = jaccard_similarity(&index.wrappers[idx].tokens, project_tokens);
        if score >= config.jaccard_min_threshold && best.map_or(true, |(_, b)| score > b) {
            best = Some((idx, score));
        }
    }
    if let Some((idx, _)) = best {
        return Some(idx);
    }

    let mut best_similar: Option<(usize, f64)> = None;
    for &idx in &gathered {
        let score = description_similarity(&index.wrappers[idx].tokens, project_tokens);
        if score >= config.description_min_ratio && best_similar.map_or(true, |(_, b)| score > b) {
            best_similar = Some((idx, score));
        }
    }
    best_similar.map(|(idx, _)| idx)
}

/// Assigns `preferred_project_order` on return wrappers sharing a WBS base
/// key with more than one project line, breaking ties via Jaccard
/// (threshold 0.15, min delta to the runner-up 0.01) so the bucket cascade
/// is deterministic.
fn assign_wrapper_preferences(
    index: &ReturnIndex,
    project_lines: &[(i32, Option<String>, HashSet<String>)],
    config: &MatchingConfig,
) {
    let mut by_base: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, wrapper) in index.wrappers.iter().enumerate() {
        if let Some(base) = &wrapper.wbs_base_key {
            by_base.entry(base.as_str()).or_default().push(idx);
        }
    }

    for wrapper_idx in by_base.values().flatten() {
        let wrapper = &index.wrappers[*wrapper_idx];
        let base = wrapper.wbs_base_key.as_deref().unwrap();
        let mut scored: Vec<(i32, f64)> = project_lines
            .iter()
            .filter(|(_, project_base, _)| project_base.as_deref() == Some(base))
            .map(|(order, _, tokens)| (*order, jaccard_similarity(&wrapper.tokens, tokens)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        if let Some((best_order, best_score)) = scored.first().copied() {
            let second_score = scored.get(1).map(|(_, s)| *s).unwrap_or(0.0);
            if best_score >= config.jaccard_preference_threshold
                && (best_score - second_score) >= config.jaccard_preference_delta
            {
                wrapper.preferred_project_order.set(Some(best_order));
            }
        }
    }
}

/// Progressive mode (spec §4.4.1): used when `prefer_progressives=true` and
/// at least one return line carries a `progressivo`.
fn align_progressive(
    project_lines: &[VoceComputo],
    return_lines: &[ParsedVoce],
    config: &MatchingConfig,
) -> ReturnAlignmentResult {
    let index = build_return_index(return_lines);
    let project_descriptors: Vec<(i32, Option<String>, HashSet<String>)> = project_lines
        .iter()
        .map(|v| {
            let tokens = descr_tokens(v.description.as_deref());
            let base = wbs_base_key_from_parsed(
                &project_wbs_levels(v),
                v.code.as_deref(),
                v.description.as_deref(),
            );
            (v.order_index, base, tokens)
        })
        .collect();
    assign_wrapper_preferences(&index, &project_descriptors, config);

    let mut result = ReturnAlignmentResult::default();
    let mut progress_registry: HashMap<(i64, String), f64> = HashMap::new();

    for (project, (_, project_wbs_base, project_tokens)) in
        project_lines.iter().zip(project_descriptors.iter())
    {
        let project_code_norm = project
            .code
            .as_deref()
            .map(|c| normalize_code_token(Some(c)))
            .filter(|c| !c.is_empty());
        let project_label = voce_label(
            project.progressivo,
            project.code.as_deref(),
            project.description.as_deref(),
            project.order_index,
        );

        let picked = pick_match(
            &index,
            project.order_index,
            project_code_norm.as_deref(),
            project_wbs_base.as_deref(),
            project_tokens,
            config,
        );

        let mut aligned = project.clone();

        let Some(match_idx) = picked else {
            aligned.quantity = Some(Decimal::ZERO);
            aligned.amount = Some(Decimal::ZERO);
            aligned.extra_metadata.missing_from_return = true;
            result.missing_labels.push(MatchedLabel {
                project_label: project_label.clone(),
                excel_label: String::new(),
                price: None,
                project_quantity: project.quantity.map(|d| d.to_f64().unwrap_or(0.0)),
                return_quantity: None,
                quantity_delta: None,
            });
            result.aligned_lines.push(aligned);
            result.legacy_pairs.push(LegacyPair {
                project_order_index: project.order_index,
                return_entry_index: None,
            });
            continue;
        };

        let wrapper = &index.wrappers[match_idx];
        wrapper.used.set(true);
        wrapper.matched.set(true);
        result.matched_count += 1;

        let project_price = project.unit_price.map(|d| d.to_f64().unwrap_or(0.0));
        let mut return_price = wrapper.unit_price;
        if let Some(rp) = return_price {
            let (stabilized, adjusted) = stabilize_return_price(rp, project_price);
            if adjusted {
                result.price_adjustments.push(PriceAdjustment {
                    label: project_label.clone(),
                    original: rp,
                    adjusted: stabilized,
                });
            }
            return_price = Some(stabilized);
        }

        let return_quantity = wrapper.quantity.or_else(|| project.quantity.map(|d| d.to_f64().unwrap_or(0.0)));

        if let (Some(rq), Some(pq)) = (wrapper.quantity, project.quantity.map(|d| d.to_f64().unwrap_or(0.0))) {
            if (rq - pq).abs() > QUANTITY_TOLERANCE {
                result
                    .progress_quantity_mismatches
                    .push(format!("{project_label}: progetto={pq}, ritorno={rq}"));
            }
        }

        if let (Some(progressivo), Some(code)) = (project.progressivo, project_code_norm.clone()) {
            if let Some(price) = return_price {
                let key = (progressivo, code);
                match progress_registry.get(&key) {
                    Some(existing) if (existing - price).abs() > PRICE_CONFLICT_TOLERANCE => {
                        result.progress_price_conflicts.push(format!(
                            "{project_label}: prezzo registrato {existing}, nuovo {price}"
                        ));
                    }
                    Some(_) => {}
                    None => {
                        progress_registry.insert(key, price);
                    }
                }
            }
        }

        let (final_qty, final_amount) = calculate_line_amount(return_quantity, return_price);

        aligned.unit_price = return_price.map(decimal_price);
        aligned.quantity = final_qty.map(decimal_quantity);
        aligned.amount = final_amount.map(decimal_amount);

        if requires_zero_guard(project.code.as_deref(), project.description.as_deref()) {
            let q = final_qty.unwrap_or(0.0);
            let p = return_price.unwrap_or(0.0);
            let a = final_amount.unwrap_or(0.0);
            if q.abs() > 1e-6 || p.abs() > 1e-6 || a.abs() > 1e-6 {
                result.zero_guard_inputs.push(ZeroGuardViolation {
                    label: project_label.clone(),
                    quantity: q,
                    unit_price: p,
                    amount: a,
                });
            }
        }

        result.matched_labels.push(MatchedLabel {
            project_label: project_label.clone(),
            excel_label: voce_label(wrapper.progressivo, wrapper.code_norm.as_deref(), wrapper.description.as_deref(), match_idx as i32),
            price: return_price,
            project_quantity: project.quantity.map(|d| d.to_f64().unwrap_or(0.0)),
            return_quantity,
            quantity_delta: match (return_quantity, project.quantity) {
                (Some(rq), Some(pq)) => Some(rq - pq.to_f64().unwrap_or(0.0)),
                _ => None,
            },
        });
        result.legacy_pairs.push(LegacyPair {
            project_order_index: project.order_index,
            return_entry_index: Some(match_idx),
        });
        result.aligned_lines.push(aligned);
    }

    for wrapper in &index.wrappers {
        if !wrapper.matched.get() {
            result.return_only_labels.push(voce_label(
                wrapper.progressivo,
                wrapper.code_norm.as_deref(),
                wrapper.description.as_deref(),
                0,
            ));
        }
    }

    result
}

fn project_wbs_levels(voce: &VoceComputo) -> Vec<NormWbsLevel<'_>> {
    let wbs = &voce.wbs;
    [
        (1u8, &wbs.wbs1_code, &wbs.wbs1_description),
        (2, &wbs.wbs2_code, &wbs.wbs2_description),
        (3, &wbs.wbs3_code, &wbs.wbs3_description),
        (4, &wbs.wbs4_code, &wbs.wbs4_description),
        (5, &wbs.wbs5_code, &wbs.wbs5_description),
        (6, &wbs.wbs6_code, &wbs.wbs6_description),
        (7, &wbs.wbs7_code, &wbs.wbs7_description),
    ]
    .into_iter()
    .map(|(level, code, description)| NormWbsLevel {
        level,
        code: code.as_deref(),
        description: description.as_deref(),
    })
    .collect()
}

/// Description-only mode (spec §4.4.2): FIFO-per-signature assignment, then
/// a fuzzy Jaccard fallback (`|a∩b| / |a∪b| >= 0.30`) over leftovers.
fn align_description_only(
    project_lines: &[VoceComputo],
    return_lines: &[ParsedVoce],
    config: &MatchingConfig,
) -> ReturnAlignmentResult {
    use crate::normalization::description_signature;
    use std::collections::VecDeque;

    let index = build_return_index(return_lines);

    let mut queues: HashMap<String, VecDeque<usize>> = HashMap::new();
    for (idx, voce) in return_lines.iter().enumerate() {
        if let Some(sig) = description_signature(voce.description.as_deref(), None, None) {
            queues.entry(sig).or_default().push_back(idx);
        }
    }

    let mut ordered_projects: Vec<usize> = (0..project_lines.len()).collect();
    ordered_projects.sort_by_key(|&i| {
        (
            project_lines[i].code.clone().unwrap_or_default(),
            project_lines[i].order_index,
        )
    });

    let mut assignment: HashMap<usize, usize> = HashMap::new();
    for &proj_idx in &ordered_projects {
        let project = &project_lines[proj_idx];
        if let Some(sig) = description_signature(project.description.as_deref(), None, None) {
            if let Some(queue) = queues.get_mut(&sig) {
                if let Some(return_idx) = queue.pop_front() {
                    assignment.insert(proj_idx, return_idx);
                    index.wrappers[return_idx].used.set(true);
                    index.wrappers[return_idx].matched.set(true);
                }
            }
        }
    }

    for proj_idx in 0..project_lines.len() {
        if assignment.contains_key(&proj_idx) {
            continue;
        }
        let project_tokens = descr_tokens(project_lines[proj_idx].description.as_deref());
        let mut best: Option<(usize, f64)> = None;
        for (idx, wrapper) in index.wrappers.iter().enumerate() {
            if wrapper.used.get() {
                continue;
            }
            let ratio = jaccard_similarity(&wrapper.tokens, &project_tokens);
            if ratio >= config.description_min_ratio && best.map_or(true, |(_, b)| ratio > b) {
                best = Some((idx, ratio));
            }
        }
        if let Some((idx, _)) = best {
            assignment.insert(proj_idx, idx);
            index.wrappers[idx].used.set(true);
            index.wrappers[idx].matched.set(true);
        }
    }

    let mut result = ReturnAlignmentResult::default();
    for proj_idx in 0..project_lines.len() {
        let project = &project_lines[proj_idx];
        let project_label = voce_label(
            project.progressivo,
            project.code.as_deref(),
            project.description.as_deref(),
            project.order_index,
        );
        let mut aligned = project.clone();

        match assignment.get(&proj_idx) {
            Some(&return_idx) => {
                let wrapper = &index.wrappers[return_idx];
                result.matched_count += 1;
                let return_price = wrapper.unit_price;
                let return_quantity = wrapper.quantity;
                // Amount prefers price*quantity; when the return carries no
                // quantity of its own, its declared amount (excel_importo)
                // stands in directly rather than being recomputed.
                let (final_qty, final_amount) = match (return_quantity, return_price) {
                    (Some(_), Some(_)) => calculate_line_amount(return_quantity, return_price),
                    _ => (return_quantity, wrapper.amount),
                };
                aligned.unit_price = return_price.map(decimal_price);
                aligned.quantity = final_qty.map(decimal_quantity);
                aligned.amount = final_amount.map(decimal_amount);
                aligned.extra_metadata.lock_return_price = true;

                if requires_zero_guard(project.code.as_deref(), project.description.as_deref()) {
                    let q = final_qty.unwrap_or(0.0);
                    let p = return_price.unwrap_or(0.0);
                    let a = final_amount.unwrap_or(0.0);
                    if q.abs() > 1e-6 || p.abs() > 1e-6 || a.abs() > 1e-6 {
                        result.zero_guard_inputs.push(ZeroGuardViolation {
                            label: project_label.clone(),
                            quantity: q,
                            unit_price: p,
                            amount: a,
                        });
                    }
                }

                result.matched_labels.push(MatchedLabel {
                    project_label: project_label.clone(),
                    excel_label: voce_label(
                        wrapper.progressivo,
                        wrapper.code_norm.as_deref(),
                        wrapper.description.as_deref(),
                        return_idx as i32,
                    ),
                    price: return_price,
                    project_quantity: project.quantity.map(|d| d.to_f64().unwrap_or(0.0)),
                    return_quantity,
                    quantity_delta: match (return_quantity, project.quantity) {
                        (Some(rq), Some(pq)) => Some(rq - pq.to_f64().unwrap_or(0.0)),
                        _ => None,
                    },
                });
                result.legacy_pairs.push(LegacyPair {
                    project_order_index: project.order_index,
                    return_entry_index: Some(return_idx),
                });
            }
            None => {
                aligned.quantity = Some(Decimal::ZERO);
                aligned.amount = Some(Decimal::ZERO);
                aligned.extra_metadata.missing_from_return = true;
                result.missing_labels.push(MatchedLabel {
                    project_label: project_label.clone(),
                    excel_label: String::new(),
                    price: None,
                    project_quantity: project.quantity.map(|d| d.to_f64().unwrap_or(0.0)),
                    return_quantity: None,
                    quantity_delta: None,
                });
                result.legacy_pairs.push(LegacyPair {
                    project_order_index: project.order_index,
                    return_entry_index: None,
                });
            }
        }
        result.aligned_lines.push(aligned);
    }

    for wrapper in &index.wrappers {
        if !wrapper.matched.get() {
            result.return_only_labels.push(voce_label(
                wrapper.progressivo,
                wrapper.code_norm.as_deref(),
                wrapper.description.as_deref(),
                0,
            ));
        }
    }

    result
}

fn has_progressivi(return_lines: &[ParsedVoce]) -> bool {
    return_lines.iter().any(|v| v.progressivo.is_some())
}

/// Entry point (spec §4.4). Picks progressive mode when requested and
/// supported by the return file, falling back to description-only mode
/// when progressive mode matches nothing at all.
pub fn align_return_rows(
    project_lines: &[VoceComputo],
    return_lines: &[ParsedVoce],
    prefer_progressives: bool,
    config: &MatchingConfig,
) -> ReturnAlignmentResult {
    if prefer_progressives && has_progressivi(return_lines) {
        let progressive = align_progressive(project_lines, return_lines, config);
        if progressive.matched_count == 0 {
            align_description_only(project_lines, return_lines, config)
        } else {
            progressive
        }
    } else {
        align_description_only(project_lines, return_lines, config)
    }
}

/// Compares declared `ParsedComputo` totals against an aligned result,
/// called by the importer once it has both pieces in hand.
pub fn check_declared_totals(
    result: &mut ReturnAlignmentResult,
    project_lines: &[VoceComputo],
    declared_total_amount: Option<f64>,
    declared_total_quantity: Option<f64>,
) {
    let computed_amount: f64 = result
        .aligned_lines
        .iter()
        .filter_map(|v| v.amount)
        .map(|d| d.to_f64().unwrap_or(0.0))
        .sum();
    if let Some(declared) = declared_total_amount {
        if (declared - computed_amount).abs() > TOTAL_AMOUNT_TOLERANCE {
            result.total_amount_note = Some(format!(
                "Totale dichiarato {declared:.2} diverso dal totale calcolato {computed_amount:.2}"
            ));
        }
    }

    if let Some(declared_qty) = declared_total_quantity {
        let project_quantity_total: f64 = project_lines
            .iter()
            .filter_map(|v| v.quantity)
            .map(|d| d.to_f64().unwrap_or(0.0))
            .sum();
        let delta = declared_qty - project_quantity_total;
        if delta.abs() > TOTAL_QUANTITY_TOLERANCE {
            result.quantity_totals_note = Some(format!(
                "progetto={project_quantity_total}, ritorno={declared_qty}, delta={delta}"
            ));
        }
    }
}

/// Builds the non-LC `matching_report` shape (spec §4.4.4).
pub fn build_matching_report(result: &ReturnAlignmentResult) -> serde_json::Value {
    use serde_json::json;

    let matched: Vec<_> = result
        .matched_labels
        .iter()
        .map(|m| {
            json!({
                "project_label": m.project_label,
                "excel_label": m.excel_label,
                "price": m.price,
                "project_quantity": m.project_quantity,
                "return_quantity": m.return_quantity,
                "quantity_delta": m.quantity_delta,
            })
        })
        .collect();

    let missing: Vec<_> = result
        .missing_labels
        .iter()
        .map(|m| {
            json!({
                "project_label": m.project_label,
                "excel_label": m.excel_label,
                "price": m.price,
                "project_quantity": m.project_quantity,
                "return_quantity": m.return_quantity,
                "quantity_delta": m.quantity_delta,
            })
        })
        .collect();

    json!({
        "matched": matched,
        "missing": missing,
        "excel_only": result.return_only_labels,
        "excel_only_groups": result.excel_only_groups,
        "quantity_mismatches": result.progress_quantity_mismatches,
        "quantity_totals": result.quantity_totals_note,
        "quantity_total_mismatch": result.quantity_totals_note.is_some(),
    })
}

/// Concatenates adjustments/conflicts/warnings into the computo's free-text
/// note (spec §4.4.3).
pub fn build_note(result: &ReturnAlignmentResult) -> String {
    let mut lines = Vec::new();
    if !result.missing_labels.is_empty() {
        lines.push(format!(
            "{} voci del computo metrico non sono state aggiornate dal ritorno",
            result.missing_labels.len()
        ));
    }
    for adj in &result.price_adjustments {
        lines.push(format!("{}: {:.2} -> {:.2}", adj.label, adj.original, adj.adjusted));
    }
    for mismatch in &result.progress_quantity_mismatches {
        lines.push(format!("Discordanza quantità: {mismatch}"));
    }
    for conflict in &result.progress_price_conflicts {
        lines.push(format!("Conflitto prezzo progressivo: {conflict}"));
    }
    for violation in &result.zero_guard_inputs {
        lines.push(format!(
            "Violazione zero-guard su {}: (Q={}, P={}, I={})",
            violation.label, violation.quantity, violation.unit_price, violation.amount
        ));
    }
    if !result.return_only_labels.is_empty() {
        lines.push(format!(
            "{} righe del ritorno non presenti nel computo metrico",
            result.return_only_labels.len()
        ));
    }
    if let Some(note) = &result.total_amount_note {
        lines.push(note.clone());
    }
    if let Some(note) = &result.quantity_totals_note {
        lines.push(format!("Discordanza quantità totale: {note}"));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WbsCodes;

    fn config() -> MatchingConfig {
        MatchingConfig::default()
    }

    fn project_line(order: i32, progressivo: i64, code: &str, description: &str, qty: f64, price: f64) -> VoceComputo {
        VoceComputo {
            id: order as i64,
            computo_id: 1,
            commessa_id: 1,
            order_index: order,
            progressivo: Some(progressivo),
            code: Some(code.to_string()),
            description: Some(description.to_string()),
            uom: None,
            quantity: Some(decimal_quantity(qty)),
            unit_price: Some(decimal_price(price)),
            amount: Some(decimal_amount(qty * price)),
            note: None,
            wbs: WbsCodes::default(),
            extra_metadata: ExtraMetadata::default(),
        }
    }

    fn return_line(progressivo: i64, code: &str, description: &str, qty: Option<f64>, price: Option<f64>) -> ParsedVoce {
        ParsedVoce {
            order_index: 0,
            progressivo: Some(progressivo),
            code: Some(code.to_string()),
            description: Some(description.to_string()),
            quantity: qty,
            unit_price: price,
            ..Default::default()
        }
    }

    #[test]
    fn test_p1_progressive_alignment_preserves_project_count() {
        let project = vec![
            project_line(0, 1, "A123.001", "Parete in cartongesso doppia lastra 13 mm", 10.0, 25.0),
            project_line(1, 2, "B001.002", "Rivestimento gres 30x60", 5.0, 40.0),
        ];
        let returns = vec![return_line(1, "A123.001", "Parete in cartongesso doppia lastra 13 mm", Some(10.0), Some(28.50))];
        let result = align_return_rows(&project, &returns, true, &config());
        assert_eq!(result.aligned_lines.len(), project.len());
        assert_eq!(result.matched_count, 1);
    }

    #[test]
    fn test_scenario_minimal_round_one() {
        let project = vec![project_line(0, 1, "A123.001", "Parete in cartongesso doppia lastra 13 mm", 10.0, 25.0)];
        let returns = vec![return_line(1, "A123.001", "Parete in cartongesso doppia lastra 13 mm", Some(10.0), Some(28.50))];
        let result = align_return_rows(&project, &returns, true, &config());
        let aligned = &result.aligned_lines[0];
        assert_eq!(aligned.unit_price, Some(decimal_price(28.50)));
        assert_eq!(aligned.quantity, Some(decimal_quantity(10.0)));
        assert_eq!(aligned.amount, Some(decimal_amount(285.0)));
    }

    #[test]
    fn test_p2_missing_marker() {
        let project = vec![
            project_line(0, 1, "A123.001", "Parete in cartongesso doppia lastra 13 mm", 10.0, 25.0),
            project_line(1, 2, "B001.002", "Rivestimento gres 30x60", 5.0, 40.0),
        ];
        let returns = vec![return_line(1, "A123.001", "Parete in cartongesso doppia lastra 13 mm", Some(10.0), Some(28.50))];
        let result = align_return_rows(&project, &returns, true, &config());
        let missing = &result.aligned_lines[1];
        assert_eq!(missing.quantity, Some(Decimal::ZERO));
        assert_eq!(missing.amount, Some(Decimal::ZERO));
        assert!(missing.extra_metadata.missing_from_return);
    }

    #[test]
    fn test_p4_price_stabilization_boundaries() {
        assert_eq!(stabilize_return_price(100.0, Some(10.0)), (100.0, false));
        assert_eq!(stabilize_return_price(12500.0, None), (12500.0, false));
        assert_eq!(stabilize_return_price(12500.0, Some(0.0)), (12500.0, false));
        let (value, adjusted) = stabilize_return_price(12500.0, Some(12.50));
        assert!(adjusted);
        assert!((value - 12.50).abs() < 1e-9);
        assert_eq!(stabilize_return_price(999.0, Some(0.1)), (999.0, false));
    }

    #[test]
    fn test_scenario_price_stabilization_end_to_end() {
        let project = vec![project_line(0, 1, "A123.001", "Parete in cartongesso doppia lastra 13 mm", 10.0, 12.50)];
        let returns = vec![return_line(1, "A123.001", "Parete in cartongesso doppia lastra 13 mm", Some(10.0), Some(12500.00))];
        let result = align_return_rows(&project, &returns, true, &config());
        assert_eq!(result.aligned_lines[0].unit_price, Some(decimal_price(12.50)));
        assert_eq!(result.price_adjustments.len(), 1);
        assert_eq!(result.price_adjustments[0].adjusted, 12.50);
    }

    #[test]
    fn test_p3_zero_guard_violation_recorded() {
        let project = vec![project_line(0, 1, "A004010X", "Assistenze murarie", 1.0, 0.0)];
        let returns = vec![return_line(1, "A004010X", "Assistenze murarie", Some(1.0), Some(150.0))];
        let result = align_return_rows(&project, &returns, true, &config());
        assert_eq!(result.aligned_lines[0].amount, Some(decimal_amount(150.0)));
        assert_eq!(result.zero_guard_inputs.len(), 1);
    }

    #[test]
    fn test_description_only_fallback_when_progressive_matches_nothing() {
        let project = vec![project_line(0, 1, "A123.001", "Parete in cartongesso doppia lastra 13 mm", 10.0, 25.0)];
        let mut returns = vec![return_line(9, "Z999.999", "Parete in cartongesso doppia lastra 13 mm", Some(10.0), Some(28.50))];
        returns[0].progressivo = Some(9);
        let result = align_return_rows(&project, &returns, true, &config());
        assert_eq!(result.matched_count, 1);
    }

    #[test]
    fn test_return_only_labels_collected() {
        let project = vec![project_line(0, 1, "A123.001", "Parete in cartongesso doppia lastra 13 mm", 10.0, 25.0)];
        let returns = vec![
            return_line(1, "A123.001", "Parete in cartongesso doppia lastra 13 mm", Some(10.0), Some(28.50)),
            return_line(2, "Z999.999", "Voce completamente estranea al progetto", Some(1.0), Some(5.0)),
        ];
        let result = align_return_rows(&project, &returns, true, &config());
        assert_eq!(result.return_only_labels.len(), 1);
    }
}
