//! C10: the contention-aware optimizer. An offline analyzer over historical
//! runs that finds a dominant "contention driver" parameter, detects which
//! of its values are disproportionately heavy, chains the heavy tasks into
//! predecessor sequences per fan-out combination, and recommends a worker
//! count — a direct port of `contention_analyzer.py`'s algorithm onto
//! `rushti-stats`'s query surface in place of raw SQL.
//!
//! The EWMA helper here is a second, independent copy of the one in
//! `rushti-estimator`, matching the source's own duplication between
//! `optimizer.py` and `contention_analyzer.py` rather than introducing a
//! shared dependency edge between the two for one small computation (see
//! DESIGN.md).

use std::collections::{BTreeMap, BTreeSet};

use rushti_core::{RunId, SchedulingAlgorithm, Task, TaskId, Workflow};
use rushti_stats::{StatsError, StatsStore, TaskParamRow};

const EWMA_ALPHA: f64 = 0.3;
const OUTLIER_RATIO: f64 = 3.0;
const OUTLIER_CAP_RATIO: f64 = 2.0;
const DEFAULT_LOOKBACK_RUNS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ContentionError {
    #[error(transparent)]
    Stats(#[from] StatsError),

    #[error("fan-out parameter value '{0}' contains the '|' chain-key separator")]
    FanOutKeyCollision(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerSettings {
    pub min_range_ratio: f64,
    pub iqr_sensitivity: f64,
    pub ceiling_correlation_threshold: f64,
    pub ceiling_efficiency_threshold: f64,
    pub scale_up_tolerance: f64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            min_range_ratio: 5.0,
            iqr_sensitivity: 10.0,
            ceiling_correlation_threshold: 0.7,
            ceiling_efficiency_threshold: 0.75,
            scale_up_tolerance: 0.10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentionGroup {
    pub value: String,
    pub task_ids: Vec<TaskId>,
    pub mean_duration_seconds: f64,
    pub heavy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyConfidence {
    MultiRun,
    SingleRun,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConcurrencyVerdict {
    None,
    Ceiling { max_workers: u32, confidence: ConcurrencyConfidence },
    ScaleUp { max_workers: u32, confidence: ConcurrencyConfidence },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentionAnalysisResult {
    pub driver_key: Option<String>,
    pub groups: Vec<ContentionGroup>,
    /// successor id -> predecessor id edges to inject, keyed by the
    /// dependent (lighter/later) task in each chain link.
    pub predecessor_chains: BTreeMap<TaskId, TaskId>,
    pub recommended_max_workers: Option<u32>,
    pub concurrency: ConcurrencyVerdict,
    pub description: String,
}

/// Step 1 (spec §4.10): EWMA per task signature, reusing the most recent
/// successful run's task list as the population to estimate.
fn ewma(durations_newest_first: &[f64]) -> f64 {
    let mut iter = durations_newest_first.iter();
    let Some(&first) = iter.next() else { return 0.0 };
    let mut value = first;
    for &duration in iter {
        let dampened = if value > 0.0 && duration > value * OUTLIER_RATIO {
            duration.min(value * OUTLIER_CAP_RATIO)
        } else {
            duration
        };
        value = EWMA_ALPHA * dampened + (1.0 - EWMA_ALPHA) * value;
    }
    value
}

/// Step 2: parameter keys with more than one distinct value among the
/// tasks of the analyzed run.
fn identify_varying_parameters(rows: &[TaskParamRow]) -> Vec<String> {
    let mut values_by_key: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for row in rows {
        for (key, value) in &row.parameters {
            values_by_key.entry(key.as_str()).or_default().insert(value.as_str());
        }
    }
    values_by_key
        .into_iter()
        .filter(|(_, values)| values.len() > 1)
        .map(|(key, _)| key.to_string())
        .collect()
}

fn mean_duration(task_ids: &[TaskId], durations: &BTreeMap<TaskId, f64>) -> f64 {
    let samples: Vec<f64> = task_ids.iter().filter_map(|id| durations.get(id).copied()).collect();
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

fn group_by_key(rows: &[TaskParamRow], key: &str) -> BTreeMap<String, Vec<TaskId>> {
    let mut groups: BTreeMap<String, Vec<TaskId>> = BTreeMap::new();
    for row in rows {
        let value = row.parameters.get(key).cloned().unwrap_or_default();
        groups.entry(value).or_default().push(row.task_id.clone());
    }
    groups
}

/// Step 3: the key whose group-mean range is largest, and at least
/// `min_range_ratio`x the runner-up's range. `None` when no key clears
/// that bar.
fn find_contention_driver(
    rows: &[TaskParamRow],
    durations: &BTreeMap<TaskId, f64>,
    varying_keys: &[String],
    min_range_ratio: f64,
) -> Option<(String, Vec<ContentionGroup>)> {
    let mut candidates: Vec<(String, Vec<ContentionGroup>, f64)> = Vec::new();

    for key in varying_keys {
        let by_value = group_by_key(rows, key);
        if by_value.len() < 2 {
            continue;
        }
        let groups: Vec<ContentionGroup> = by_value
            .into_iter()
            .map(|(value, task_ids)| {
                let mean = mean_duration(&task_ids, durations);
                ContentionGroup { value, task_ids, mean_duration_seconds: mean, heavy: false }
            })
            .collect();
        let means: Vec<f64> = groups.iter().map(|g| g.mean_duration_seconds).collect();
        let range = means.iter().cloned().fold(f64::MIN, f64::max) - means.iter().cloned().fold(f64::MAX, f64::min);
        candidates.push((key.clone(), groups, range));
    }

    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
    let (driver_key, driver_groups, driver_range) = candidates.remove(0);
    if driver_range <= 0.0 {
        return None;
    }

    if let Some((_, _, runner_up_range)) = candidates.first() {
        if *runner_up_range > 0.0 && driver_range < min_range_ratio * runner_up_range {
            return None;
        }
    }

    Some((driver_key, driver_groups))
}

/// Step 4: index-based quartiles over the driver's group means; groups
/// above `Q3 + sensitivity*IQR` are heavy. Skipped entirely below 4
/// groups, per spec.
fn detect_heavy_outliers(groups: &mut [ContentionGroup], sensitivity: f64) -> bool {
    if groups.len() < 4 {
        return false;
    }
    let mut sorted: Vec<f64> = groups.iter().map(|g| g.mean_duration_seconds).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    let q1 = sorted[n / 4];
    let q3 = sorted[(3 * n) / 4];
    let iqr = q3 - q1;
    let upper_fence = q3 + sensitivity * iqr;
    for group in groups.iter_mut() {
        group.heavy = group.mean_duration_seconds > upper_fence;
    }
    true
}

fn fan_out_value(row: &TaskParamRow, fan_out_keys: &[String]) -> Result<String, ContentionError> {
    let mut parts = Vec::with_capacity(fan_out_keys.len());
    for key in fan_out_keys {
        let value = row.parameters.get(key).cloned().unwrap_or_default();
        if value.contains('|') {
            return Err(ContentionError::FanOutKeyCollision(value));
        }
        parts.push(value);
    }
    parts.sort();
    Ok(parts.join("|"))
}

fn count_distinct_fan_out(rows: &[TaskParamRow], fan_out_keys: &[String]) -> Result<usize, ContentionError> {
    let mut seen = BTreeSet::new();
    for row in rows {
        seen.insert(fan_out_value(row, fan_out_keys)?);
    }
    Ok(seen.len())
}

/// Step 5: one chain per fan-out combination, heaviest group first.
/// `task_id -> task_id` edges are keyed by the dependent (lighter) task.
fn build_predecessor_chains(
    rows: &[TaskParamRow],
    driver_key: &str,
    groups: &[ContentionGroup],
    fan_out_keys: &[String],
) -> Result<BTreeMap<TaskId, TaskId>, ContentionError> {
    let mut heavy: Vec<&ContentionGroup> = groups.iter().filter(|g| g.heavy).collect();
    if heavy.len() < 2 {
        return Ok(BTreeMap::new());
    }
    heavy.sort_by(|a, b| b.mean_duration_seconds.partial_cmp(&a.mean_duration_seconds).unwrap_or(std::cmp::Ordering::Equal));

    let mut lookup: BTreeMap<(String, String), TaskId> = BTreeMap::new();
    let mut fan_out_values: BTreeSet<String> = BTreeSet::new();
    for row in rows {
        let driver_value = row.parameters.get(driver_key).cloned().unwrap_or_default();
        let fan_out = fan_out_value(row, fan_out_keys)?;
        fan_out_values.insert(fan_out.clone());
        lookup.insert((driver_value, fan_out), row.task_id.clone());
    }

    let mut chains = BTreeMap::new();
    for fan_out in &fan_out_values {
        let chain: Vec<&TaskId> =
            heavy.iter().filter_map(|g| lookup.get(&(g.value.clone(), fan_out.clone()))).collect();
        for pair in chain.windows(2) {
            chains.insert(pair[1].clone(), pair[0].clone());
        }
    }
    Ok(chains)
}

/// Rounds to the nearest multiple of 5, floored at 5.
fn round_to_5(value: f64) -> u32 {
    let rounded = (value / 5.0).round() * 5.0;
    rounded.max(5.0) as u32
}

/// Step 6: `fan_out_size + ceil(light_total_work / critical_path)`, where
/// `critical_path` is the sum of heavy group means and `light_total_work`
/// is the summed duration of every light-group task.
fn recommend_max_workers(heavy: &[&ContentionGroup], light: &[&ContentionGroup], fan_out_size: usize) -> u32 {
    let critical_path: f64 = heavy.iter().map(|g| g.mean_duration_seconds).sum();
    let light_total_work: f64 = light.iter().map(|g| g.mean_duration_seconds * g.task_ids.len() as f64).sum();
    let extra = if critical_path > 0.0 { (light_total_work / critical_path).ceil() } else { 0.0 };
    round_to_5((fan_out_size as f64 + extra).max(fan_out_size as f64))
}

fn pearson_correlation(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len();
    if n < 2 || n != ys.len() {
        return 0.0;
    }
    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;
    let mut covariance = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for i in 0..n {
        let dx = xs[i] - mean_x;
        let dy = ys[i] - mean_y;
        covariance += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= 0.0 || var_y <= 0.0 {
        return 0.0;
    }
    covariance / (var_x.sqrt() * var_y.sqrt())
}

/// Step 7: multi-run evidence (distinct `max_workers` levels actually
/// exercised) is preferred over the single-run correlation/efficiency
/// heuristic.
fn detect_concurrency_ceiling(
    stats: &StatsStore,
    workflow: &str,
    settings: &OptimizerSettings,
) -> Result<ConcurrencyVerdict, ContentionError> {
    let levels = stats.successful_run_levels(workflow)?;
    if levels.is_empty() {
        return Ok(ConcurrencyVerdict::None);
    }

    let mut by_level: BTreeMap<u32, f64> = BTreeMap::new();
    for level in &levels {
        // `levels` is ordered newest-first; the first insert per key wins.
        by_level.entry(level.max_workers).or_insert(level.wall_clock_seconds);
    }

    if by_level.len() >= 2 {
        let pairs: Vec<(u32, f64)> = by_level.into_iter().collect();
        let best = *pairs.iter().min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal)).unwrap();
        let max_tested = pairs.last().unwrap().0;
        if best.0 < max_tested {
            return Ok(ConcurrencyVerdict::Ceiling { max_workers: best.0, confidence: ConcurrencyConfidence::MultiRun });
        }
        let threshold = best.1 * (1.0 + settings.scale_up_tolerance);
        let sweet_spot = pairs.iter().filter(|(_, wc)| *wc <= threshold).map(|(w, _)| *w).min().unwrap_or(best.0);
        return Ok(ConcurrencyVerdict::ScaleUp { max_workers: sweet_spot, confidence: ConcurrencyConfidence::MultiRun });
    }

    let level = &levels[0];
    if level.max_workers == 0 || level.wall_clock_seconds <= 0.0 {
        return Ok(ConcurrencyVerdict::None);
    }
    let Some(aggregate) = stats.run_task_aggregate(&level.run_id)? else {
        return Ok(ConcurrencyVerdict::None);
    };
    let concurrency = stats.per_task_concurrency(&level.run_id)?;
    if concurrency.len() < 2 {
        return Ok(ConcurrencyVerdict::None);
    }

    let counts: Vec<f64> = concurrency.iter().map(|(c, _)| *c as f64).collect();
    let durations: Vec<f64> = concurrency.iter().map(|(_, d)| *d).collect();
    let correlation = pearson_correlation(&counts, &durations);
    let effective_parallelism = aggregate.total_duration_seconds / level.wall_clock_seconds;
    let efficiency = effective_parallelism / level.max_workers as f64;

    if correlation >= settings.ceiling_correlation_threshold && efficiency < settings.ceiling_efficiency_threshold {
        let recommended = round_to_5((level.max_workers as f64 * efficiency).max(1.0)).min(level.max_workers);
        Ok(ConcurrencyVerdict::Ceiling { max_workers: recommended, confidence: ConcurrencyConfidence::SingleRun })
    } else {
        Ok(ConcurrencyVerdict::None)
    }
}

fn apply_concurrency_cap(driver_based: Option<u32>, verdict: ConcurrencyVerdict) -> Option<u32> {
    match verdict {
        ConcurrencyVerdict::None => driver_based,
        ConcurrencyVerdict::Ceiling { max_workers, .. } => {
            Some(driver_based.map_or(max_workers, |d| d.min(max_workers)))
        }
        ConcurrencyVerdict::ScaleUp { max_workers, .. } => {
            Some(driver_based.map_or(max_workers, |d| d.max(max_workers)))
        }
    }
}

/// Orchestrates steps 1-7 and the three fallback cases from spec §4.10:
/// no varying parameters, no clear driver, or too few heavy groups all
/// fall back to a worker-recommendation-only result; a found driver with
/// at least two heavy groups produces the full chained result. The
/// concurrency ceiling/scale-up verdict is computed independently and
/// applied as a cap or floor in every case.
pub fn analyze_contention(
    stats: &StatsStore,
    workflow: &str,
    settings: &OptimizerSettings,
) -> Result<ContentionAnalysisResult, ContentionError> {
    let concurrency = detect_concurrency_ceiling(stats, workflow, settings)?;

    let Some(run_id) = stats.most_recent_successful_run(workflow)? else {
        return Ok(ContentionAnalysisResult {
            driver_key: None,
            groups: Vec::new(),
            predecessor_chains: BTreeMap::new(),
            recommended_max_workers: apply_concurrency_cap(None, concurrency),
            concurrency,
            description: "no successful run history to analyze".to_string(),
        });
    };

    let rows = stats.task_params_for_run(&run_id)?;
    let mut durations: BTreeMap<TaskId, f64> = BTreeMap::new();
    for row in &rows {
        let history = stats.recent_durations(&row.signature, DEFAULT_LOOKBACK_RUNS)?;
        durations.insert(row.task_id.clone(), ewma(&history));
    }

    let varying_keys = identify_varying_parameters(&rows);
    if varying_keys.is_empty() {
        return Ok(ContentionAnalysisResult {
            driver_key: None,
            groups: Vec::new(),
            predecessor_chains: BTreeMap::new(),
            recommended_max_workers: apply_concurrency_cap(None, concurrency),
            concurrency,
            description: "no varying task parameters; worker-recommendation fallback only".to_string(),
        });
    }

    let Some((driver_key, mut groups)) = find_contention_driver(&rows, &durations, &varying_keys, settings.min_range_ratio)
    else {
        return Ok(ContentionAnalysisResult {
            driver_key: None,
            groups: Vec::new(),
            predecessor_chains: BTreeMap::new(),
            recommended_max_workers: apply_concurrency_cap(None, concurrency),
            concurrency,
            description: "no dominant contention driver found; worker-recommendation fallback only".to_string(),
        });
    };

    let outliers_ran = detect_heavy_outliers(&mut groups, settings.iqr_sensitivity);
    let heavy_count = groups.iter().filter(|g| g.heavy).count();
    if !outliers_ran || heavy_count < 2 {
        return Ok(ContentionAnalysisResult {
            driver_key: Some(driver_key),
            groups,
            predecessor_chains: BTreeMap::new(),
            recommended_max_workers: apply_concurrency_cap(None, concurrency),
            concurrency,
            description: "contention driver found but too few heavy groups to chain".to_string(),
        });
    }

    let fan_out_keys: Vec<String> = varying_keys.into_iter().filter(|k| *k != driver_key).collect();
    let chains = build_predecessor_chains(&rows, &driver_key, &groups, &fan_out_keys)?;
    let fan_out_size = count_distinct_fan_out(&rows, &fan_out_keys)?.max(1);

    let heavy: Vec<&ContentionGroup> = groups.iter().filter(|g| g.heavy).collect();
    let light: Vec<&ContentionGroup> = groups.iter().filter(|g| !g.heavy).collect();
    let driver_based = recommend_max_workers(&heavy, &light, fan_out_size);
    let description = format!(
        "contention driver '{driver_key}' detected; {} heavy group(s) chained across {fan_out_size} fan-out value(s)",
        heavy.len()
    );
    let recommended_max_workers = apply_concurrency_cap(Some(driver_based), concurrency);
    tracing::debug!(
        workflow,
        driver = %driver_key,
        heavy_groups = heavy.len(),
        fan_out_size,
        ?recommended_max_workers,
        "contention analysis complete"
    );

    Ok(ContentionAnalysisResult {
        driver_key: Some(driver_key),
        groups,
        predecessor_chains: chains,
        recommended_max_workers,
        concurrency,
        description,
    })
}

/// Step 8: emits a new [`Workflow`] with tasks reordered driver-major
/// (heaviest group first), the chain edges injected as predecessors, and
/// the recommended `max_workers` embedded in settings. Falls back to a
/// `longest_first` ordering rewrite when no driver was found (spec
/// §4.10's fallback policy), leaving task order untouched.
pub fn write_optimized_taskfile(workflow: &Workflow, analysis: &ContentionAnalysisResult) -> Workflow {
    let mut optimized = workflow.clone();

    if let Some(max_workers) = analysis.recommended_max_workers {
        optimized.settings.max_workers = max_workers;
    }

    if analysis.driver_key.is_none() {
        optimized.settings.optimization_algorithm = Some(SchedulingAlgorithm::LongestFirst);
    } else if !analysis.predecessor_chains.is_empty() || !analysis.groups.is_empty() {
        let mut heavy_groups: Vec<&ContentionGroup> = analysis.groups.iter().filter(|g| g.heavy).collect();
        heavy_groups.sort_by(|a, b| b.mean_duration_seconds.partial_cmp(&a.mean_duration_seconds).unwrap_or(std::cmp::Ordering::Equal));
        let light_groups: Vec<&ContentionGroup> = analysis.groups.iter().filter(|g| !g.heavy).collect();

        let mut ordered_ids: Vec<TaskId> = Vec::with_capacity(workflow.tasks.len());
        let mut placed: BTreeSet<TaskId> = BTreeSet::new();
        for group in heavy_groups.into_iter().chain(light_groups) {
            for id in &group.task_ids {
                if placed.insert(id.clone()) {
                    ordered_ids.push(id.clone());
                }
            }
        }
        for task in &workflow.tasks {
            if placed.insert(task.id.clone()) {
                ordered_ids.push(task.id.clone());
            }
        }

        let mut by_id: BTreeMap<TaskId, Task> = workflow.tasks.iter().map(|t| (t.id.clone(), t.clone())).collect();
        for (successor, predecessor) in &analysis.predecessor_chains {
            if let Some(task) = by_id.get_mut(successor) {
                if !task.predecessors.contains(predecessor) {
                    task.predecessors.push(predecessor.clone());
                }
            }
        }

        optimized.tasks = ordered_ids.into_iter().filter_map(|id| by_id.remove(&id)).collect();
    }

    optimized.metadata.description = Some(analysis.description.clone());
    optimized
}
