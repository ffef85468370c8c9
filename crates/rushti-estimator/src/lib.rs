//! C6: the estimator. EWMA-by-signature runtime estimates with outlier
//! dampening, confidence scoring, and a workflow-level default for
//! signatures without history — a direct port of `optimizer.py`'s
//! `TaskOptimizer` algorithm (the stats-query plumbing is replaced by
//! `rushti-stats`, everything else is kept byte-for-byte equivalent).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rushti_core::{SchedulingAlgorithm, Signature};
use rushti_stats::StatsStore;

const EWMA_ALPHA: f64 = 0.3;
const OUTLIER_RATIO: f64 = 3.0;
const OUTLIER_CAP_RATIO: f64 = 2.0;
const FALLBACK_DEFAULT_SECONDS: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeEstimate {
    pub signature: Signature,
    pub ewma_duration_seconds: f64,
    pub sample_count: u32,
    pub confidence: f64,
    /// True when no history exists and the workflow-level default was used.
    pub estimated: bool,
}

#[derive(Debug, Clone)]
pub struct EstimatorSettings {
    pub lookback_runs: u32,
    pub min_samples: u32,
    pub time_of_day_weighting: bool,
    pub cache_duration: Duration,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            lookback_runs: 10,
            min_samples: 3,
            time_of_day_weighting: false,
            cache_duration: Duration::from_secs(24 * 3600),
        }
    }
}

/// Builds and caches EWMA runtime estimates for a workflow's task
/// signatures, and orders ready sets by the configured algorithm.
///
/// Holds no reference to the [`StatsStore`] it was built from — every
/// query method takes one as a parameter instead — so callers (notably
/// the scheduler) can own both side by side without lifetime entanglement.
pub struct Estimator {
    settings: EstimatorSettings,
    cache: BTreeMap<Signature, RuntimeEstimate>,
    cache_built_at: Option<Instant>,
    default_estimate: f64,
}

impl Estimator {
    pub fn new(settings: EstimatorSettings) -> Self {
        Self { settings, cache: BTreeMap::new(), cache_built_at: None, default_estimate: FALLBACK_DEFAULT_SECONDS }
    }

    fn is_cache_valid(&self) -> bool {
        if self.settings.time_of_day_weighting {
            return false;
        }
        match self.cache_built_at {
            Some(built_at) => built_at.elapsed() < self.settings.cache_duration,
            None => false,
        }
    }

    /// Builds the estimate cache for every distinct signature among
    /// `signatures`. Idempotent while the cache is still valid.
    pub fn build_cache(&mut self, stats: &StatsStore, signatures: &[Signature]) {
        if self.is_cache_valid() {
            return;
        }

        let mut with_history = Vec::new();
        for signature in signatures {
            let estimate = self.calculate_estimate(stats, signature);
            if !estimate.estimated {
                with_history.push(estimate.clone());
            }
            self.cache.insert(signature.clone(), estimate);
        }

        if !with_history.is_empty() {
            self.default_estimate = calculate_default_estimate(&with_history);
        }

        for estimate in self.cache.values_mut() {
            if estimate.estimated {
                estimate.ewma_duration_seconds = self.default_estimate;
            }
        }

        self.cache_built_at = Some(Instant::now());
        tracing::debug!(
            with_history = with_history.len(),
            without_history = signatures.len().saturating_sub(with_history.len()),
            default_estimate = self.default_estimate,
            "built runtime estimate cache"
        );
    }

    pub fn get_estimate(&mut self, stats: &StatsStore, signature: &Signature) -> RuntimeEstimate {
        if let Some(cached) = self.cache.get(signature) {
            return cached.clone();
        }
        let mut estimate = self.calculate_estimate(stats, signature);
        if estimate.estimated {
            estimate.ewma_duration_seconds = self.default_estimate;
        }
        self.cache.insert(signature.clone(), estimate.clone());
        estimate
    }

    fn calculate_estimate(&self, stats: &StatsStore, signature: &Signature) -> RuntimeEstimate {
        let durations = stats.recent_durations(signature, self.settings.lookback_runs).unwrap_or_default();

        if durations.is_empty() {
            return RuntimeEstimate {
                signature: signature.clone(),
                ewma_duration_seconds: 0.0,
                sample_count: 0,
                confidence: 0.0,
                estimated: true,
            };
        }

        let ewma = calculate_ewma(&durations, EWMA_ALPHA);
        let confidence = calculate_confidence(&durations);

        RuntimeEstimate {
            signature: signature.clone(),
            ewma_duration_seconds: ewma,
            sample_count: durations.len() as u32,
            confidence,
            estimated: false,
        }
    }

    /// Orders a ready set by estimated runtime. Tasks below `min_samples`
    /// sort by the workflow default (§4.5: "sort to the middle"). On any
    /// lookup failure the original order is returned unchanged.
    pub fn order_ready_set<T>(
        &mut self,
        stats: &StatsStore,
        items: Vec<T>,
        signature_of: impl Fn(&T) -> Signature,
        algorithm: SchedulingAlgorithm,
    ) -> Vec<T> {
        if items.len() <= 1 {
            return items;
        }

        let mut keyed: Vec<(T, f64)> = items
            .into_iter()
            .map(|item| {
                let signature = signature_of(&item);
                let estimate = self.get_estimate(stats, &signature);
                let duration = if estimate.sample_count >= self.settings.min_samples {
                    estimate.ewma_duration_seconds
                } else {
                    self.default_estimate
                };
                (item, duration)
            })
            .collect();

        match algorithm {
            SchedulingAlgorithm::LongestFirst => {
                keyed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            }
            SchedulingAlgorithm::ShortestFirst => {
                keyed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            }
        }

        keyed.into_iter().map(|(item, _)| item).collect()
    }
}

/// Processes newest-first, dampening any jump over 3x the running estimate
/// down to a 2x cap before blending it in (spec §4.6 / `_calculate_ewma`).
fn calculate_ewma(durations_newest_first: &[f64], alpha: f64) -> f64 {
    let mut iter = durations_newest_first.iter();
    let Some(&first) = iter.next() else { return 0.0 };
    let mut ewma = first;
    for &duration in iter {
        let dampened = if ewma > 0.0 && duration > ewma * OUTLIER_RATIO {
            duration.min(ewma * OUTLIER_CAP_RATIO)
        } else {
            duration
        };
        ewma = alpha * dampened + (1.0 - alpha) * ewma;
    }
    ewma
}

/// Quantity factor (0-0.5, saturating at 10 samples) plus a consistency
/// factor (0-0.5, from coefficient of variation); a single sample gets a
/// fixed middle consistency score of 0.25 (spec §4.6 / `_calculate_confidence`).
fn calculate_confidence(durations: &[f64]) -> f64 {
    if durations.is_empty() {
        return 0.0;
    }

    let quantity_factor = (durations.len() as f64 / 10.0).min(1.0) * 0.5;

    let consistency_factor = if durations.len() >= 2 {
        let mean = durations.iter().sum::<f64>() / durations.len() as f64;
        let variance = durations.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (durations.len() - 1) as f64;
        let std_dev = variance.sqrt();
        let cv = if mean > 0.0 { std_dev / mean } else { 1.0 };
        (1.0 - cv.min(1.0)) * 0.5
    } else {
        0.25
    };

    quantity_factor + consistency_factor
}

/// Fastest-25% mean across signatures that do have history (spec §4.6 /
/// `_calculate_default_estimate`), falling back to a flat 10s when no
/// signature in the workflow has any history yet.
fn calculate_default_estimate(estimates: &[RuntimeEstimate]) -> f64 {
    let mut durations: Vec<f64> = estimates
        .iter()
        .map(|e| e.ewma_duration_seconds)
        .filter(|&d| d > 0.0)
        .collect();
    if durations.is_empty() {
        return FALLBACK_DEFAULT_SECONDS;
    }
    durations.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let fastest_count = (durations.len() / 4).max(1);
    let fastest = &durations[..fastest_count];
    fastest.iter().sum::<f64>() / fastest.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rushti_core::compute_signature;
    use rushti_stats::{RunCompletion, RunRecord, StatsStore, TaskResultRecord};
    use std::collections::BTreeMap as Map;

    fn seeded_store(signature: &Signature, durations: &[f64]) -> StatsStore {
        let store = StatsStore::open_in_memory().unwrap();
        store
            .start_run(&RunRecord {
                run_id: rushti_core::RunId::new("run1"),
                workflow: "wf".into(),
                taskfile_path: "wf.txt".into(),
                start_time: chrono::Utc::now(),
                max_workers: 4,
                retries: 0,
                result_file: None,
                exclusive: false,
                optimize: false,
                taskfile_name: None,
                taskfile_description: None,
                taskfile_author: None,
            })
            .unwrap();
        for (i, &d) in durations.iter().enumerate() {
            let t = chrono::Utc::now() + chrono::Duration::seconds(i as i64);
            store
                .record_task_result(&TaskResultRecord {
                    run_id: rushti_core::RunId::new("run1"),
                    workflow: "wf".into(),
                    task_id: rushti_core::TaskId::from(format!("T{i}")),
                    signature: signature.clone(),
                    instance: "srv01".into(),
                    process: "proc".into(),
                    parameters: "{}".into(),
                    success: true,
                    start_time: t,
                    end_time: t,
                    duration_seconds: d,
                    retry_count: 0,
                    error_message: None,
                    predecessors: "[]".into(),
                    stage: None,
                    concurrent_count: 1,
                })
                .unwrap();
        }
        let _ = store.finish_run(
            &rushti_core::RunId::new("run1"),
            &RunCompletion {
                end_time: chrono::Utc::now(),
                duration_seconds: durations.iter().sum(),
                status: "Success".into(),
                task_count: durations.len() as u32,
                success_count: durations.len() as u32,
                failure_count: 0,
            },
        );
        store
    }

    #[test]
    fn no_history_yields_estimated_flag_with_fallback_default() {
        let store = StatsStore::open_in_memory().unwrap();
        let mut estimator = Estimator::new(EstimatorSettings::default());
        let signature = compute_signature("srv01", "proc", &Map::new());
        let estimate = estimator.get_estimate(&store, &signature);
        assert!(estimate.estimated);
        assert_eq!(estimate.ewma_duration_seconds, FALLBACK_DEFAULT_SECONDS);
    }

    #[test]
    fn outlier_is_dampened_to_2x_not_raw_value() {
        // Newest-first: 100 is a 10x jump over a running estimate of 10.
        let ewma = calculate_ewma(&[100.0, 10.0, 10.0], EWMA_ALPHA);
        // dampened to 20 (10*2), blended: 0.3*20 + 0.7*10 = 13.0
        assert!((ewma - 13.0).abs() < 1e-9);
    }

    #[test]
    fn single_sample_gets_middle_consistency_confidence() {
        let confidence = calculate_confidence(&[10.0]);
        // quantity: (1/10)*0.5 = 0.05, consistency: 0.25 => 0.30
        assert!((confidence - 0.30).abs() < 1e-9);
    }

    #[test]
    fn tasks_below_min_samples_sort_by_default_not_their_own_ewma() {
        let signature_high_history = compute_signature("srv01", "proc_a", &Map::new());
        let signature_low_history = compute_signature("srv01", "proc_b", &Map::new());
        let store = seeded_store(&signature_high_history, &[5.0, 5.0, 5.0, 5.0, 5.0]);

        // Give proc_b a single sample so it is below min_samples=3.
        store
            .record_task_result(&TaskResultRecord {
                run_id: rushti_core::RunId::new("run1"),
                workflow: "wf".into(),
                task_id: rushti_core::TaskId::from("low"),
                signature: signature_low_history.clone(),
                instance: "srv01".into(),
                process: "proc_b".into(),
                parameters: "{}".into(),
                success: true,
                start_time: chrono::Utc::now(),
                end_time: chrono::Utc::now(),
                duration_seconds: 1000.0,
                retry_count: 0,
                error_message: None,
                predecessors: "[]".into(),
                stage: None,
                concurrent_count: 1,
            })
            .unwrap();

        let mut estimator = Estimator::new(EstimatorSettings::default());
        estimator.build_cache(&store, &[signature_high_history.clone(), signature_low_history.clone()]);

        let ordered = estimator.order_ready_set(
            &store,
            vec![signature_low_history.clone(), signature_high_history.clone()],
            |s| s.clone(),
            SchedulingAlgorithm::LongestFirst,
        );
        // proc_b has only 1 sample (< min_samples=3) so it must NOT sort
        // ahead using its raw 1000s duration; it falls back to the default.
        assert_ne!(ordered[0], signature_low_history);
    }
}
