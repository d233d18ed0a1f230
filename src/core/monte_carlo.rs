use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::engine::{RunOverrides, check_schedule_refs, run_projection_with};
use super::error::{EngineError, EngineResult};
use super::returns::{
    AssetClass, HISTORICAL_BOOTSTRAP, ReturnModelConfig, ReturnModelRegistry, ReturnRequest,
};
use super::seed::{RANGE_STREAM, TRIAL_STREAM, derive_seed};
use super::types::{PercentileBand, Scenario, Trajectory};

/// Bands need at least this many running trials, or 10% of all trials if
/// that is larger.
const MIN_BAND_SAMPLES: usize = 10;

/// Per-trial constant rate for one schedule, replacing whatever the return
/// model would have produced for it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableRange {
    Uniform {
        min: f64,
        max: f64,
    },
    Normal {
        mean: f64,
        #[serde(alias = "stdDev")]
        std_dev: f64,
    },
}

impl VariableRange {
    fn validate(&self, schedule: &str) -> EngineResult<()> {
        let ok = match *self {
            VariableRange::Uniform { min, max } => min.is_finite() && max.is_finite() && min <= max,
            VariableRange::Normal { mean, std_dev } => {
                mean.is_finite() && std_dev.is_finite() && std_dev >= 0.0
            }
        };
        if ok {
            Ok(())
        } else {
            Err(EngineError::InvalidOptions(format!(
                "variable range for '{schedule}' is invalid"
            )))
        }
    }

    fn sample(&self, rng: &mut ChaCha8Rng) -> f64 {
        match *self {
            VariableRange::Uniform { min, max } => {
                if max > min {
                    rng.gen_range(min..max)
                } else {
                    min
                }
            }
            VariableRange::Normal { mean, std_dev } => {
                let z: f64 = StandardNormal.sample(rng);
                mean + std_dev * z
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonteCarloOptions {
    pub iterations: u32,
    #[serde(alias = "seed")]
    pub random_seed: u64,
    /// Horizon used for success scoring; defaults to the plan duration.
    pub target_survival_months: Option<u32>,
    pub target_success_rate: f64,
    pub return_model: String,
    pub variable_ranges: BTreeMap<String, VariableRange>,
    /// Which generated class drives which rate schedule. Empty means every
    /// asset return schedule follows stocks.
    pub schedule_classes: BTreeMap<String, AssetClass>,
    pub return_config: ReturnModelConfig,
}

impl Default for MonteCarloOptions {
    fn default() -> Self {
        Self {
            iterations: 1000,
            random_seed: 42,
            target_survival_months: None,
            target_success_rate: 0.9,
            return_model: HISTORICAL_BOOTSTRAP.to_string(),
            variable_ranges: BTreeMap::new(),
            schedule_classes: BTreeMap::new(),
            return_config: ReturnModelConfig::default(),
        }
    }
}

impl MonteCarloOptions {
    fn validate(&self) -> EngineResult<()> {
        if self.iterations == 0 {
            return Err(EngineError::InvalidOptions(
                "iterations must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.target_success_rate) {
            return Err(EngineError::InvalidOptions(
                "targetSuccessRate must be between 0 and 1".to_string(),
            ));
        }
        if self.target_survival_months == Some(0) {
            return Err(EngineError::InvalidOptions(
                "targetSurvivalMonths must be > 0".to_string(),
            ));
        }
        for (schedule, range) in &self.variable_ranges {
            range.validate(schedule)?;
        }
        Ok(())
    }
}

/// Cooperative cancellation, checked between trials only.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskMetrics {
    pub mean_final_balance: f64,
    pub median_final_balance: f64,
    pub value_at_risk_95: f64,
    pub conditional_value_at_risk_95: f64,
    pub depletion_probability: f64,
    pub median_depletion_month: Option<f64>,
    pub max_drawdown_p50: f64,
    pub max_drawdown_p90: f64,
    pub max_drawdown_p95: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonteCarloResult {
    pub iterations: u32,
    pub return_model: String,
    pub trajectories: Vec<Trajectory>,
    pub percentile_bands: Vec<PercentileBand>,
    pub success_rate: f64,
    pub target_success_rate: f64,
    pub meets_target: bool,
    pub risk_metrics: RiskMetrics,
}

pub fn analyze(scenario: &Scenario, options: &MonteCarloOptions) -> EngineResult<MonteCarloResult> {
    analyze_with(scenario, options, &ReturnModelRegistry::default(), None)
}

pub fn analyze_with(
    scenario: &Scenario,
    options: &MonteCarloOptions,
    registry: &ReturnModelRegistry,
    cancel: Option<&CancelFlag>,
) -> EngineResult<MonteCarloResult> {
    scenario.validate()?;
    check_schedule_refs(scenario)?;
    options.validate()?;
    check_option_targets(scenario, options)?;
    let model = registry.get(&options.return_model)?;

    let schedule_classes = if options.schedule_classes.is_empty() {
        let defaults = default_schedule_classes(scenario);
        if !defaults.is_empty() {
            info!(
                schedules = ?defaults.keys().collect::<Vec<_>>(),
                "no schedule mapping given; asset return schedules follow stocks"
            );
        }
        defaults
    } else {
        options.schedule_classes.clone()
    };
    let classes = schedule_classes
        .values()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();
    let horizon = scenario.plan.duration_months;
    let years = horizon.div_ceil(12) as usize;

    info!(
        iterations = options.iterations,
        model = model.name(),
        horizon,
        "starting monte carlo analysis"
    );

    let run_trial = |trial: u32| -> EngineResult<Trajectory> {
        if cancel.is_some_and(CancelFlag::is_cancelled) {
            return Err(EngineError::Cancelled);
        }
        let trial_seed = derive_seed(options.random_seed, TRIAL_STREAM, trial);
        let generated = model.generate(&ReturnRequest {
            asset_classes: &classes,
            periods: years,
            seed: trial_seed,
            config: &options.return_config,
        });

        let mut rate_overrides = HashMap::with_capacity(schedule_classes.len());
        for (schedule, class) in &schedule_classes {
            if let Some(series) = generated.get(class) {
                rate_overrides.insert(schedule.clone(), series.clone());
            }
        }
        if !options.variable_ranges.is_empty() {
            let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(trial_seed, RANGE_STREAM, 0));
            for (schedule, range) in &options.variable_ranges {
                rate_overrides.insert(schedule.clone(), vec![range.sample(&mut rng)]);
            }
        }

        let projection = run_projection_with(
            scenario,
            &RunOverrides {
                noise_seed: trial_seed,
                rate_overrides,
            },
        )?;
        debug!(trial, months = projection.actual_duration, "trial complete");
        Ok(Trajectory::from_projection(trial, trial_seed, projection))
    };

    let trajectories = (0..options.iterations)
        .into_par_iter()
        .map(run_trial)
        .collect::<EngineResult<Vec<_>>>()?;

    let percentile_bands = percentile_bands(&trajectories, horizon, options.iterations);
    let target = options
        .target_survival_months
        .unwrap_or(horizon)
        .min(horizon);
    let successes = trajectories
        .iter()
        .filter(|t| trial_succeeded(t, target))
        .count();
    let success_rate = successes as f64 / trajectories.len() as f64;
    let risk_metrics = risk_metrics(&trajectories, horizon);

    info!(
        success_rate,
        bands = percentile_bands.len(),
        "monte carlo analysis complete"
    );

    Ok(MonteCarloResult {
        iterations: options.iterations,
        return_model: model.name().to_string(),
        trajectories,
        percentile_bands,
        success_rate,
        target_success_rate: options.target_success_rate,
        meets_target: success_rate >= options.target_success_rate,
        risk_metrics,
    })
}

/// Every asset return schedule follows the stocks series. The inflation
/// schedule is left on its configured values.
fn default_schedule_classes(scenario: &Scenario) -> BTreeMap<String, AssetClass> {
    scenario
        .assets
        .iter()
        .filter_map(|a| a.return_schedule.clone())
        .map(|name| (name, AssetClass::Stocks))
        .collect()
}

/// Mapped and ranged schedules must exist on the scenario, otherwise the
/// perturbation would silently apply to nothing.
fn check_option_targets(scenario: &Scenario, options: &MonteCarloOptions) -> EngineResult<()> {
    let targets = options
        .schedule_classes
        .keys()
        .chain(options.variable_ranges.keys());
    for name in targets {
        if !scenario.rate_schedules.contains_key(name) {
            return Err(EngineError::UnknownSchedule(name.clone()));
        }
    }
    Ok(())
}

fn trial_succeeded(trajectory: &Trajectory, target: u32) -> bool {
    let survived = trajectory
        .first_shortfall_month
        .is_none_or(|month| month > target);
    let at_target = trajectory.balance_at(target.min(trajectory.actual_duration));
    survived && at_target.is_some_and(|b| b > 0.0)
}

/// Stopped trials contribute a hard zero rather than dropping out, so late
/// bands reflect the failure fraction instead of survivors only. A month is
/// emitted only while enough trials are still running.
pub fn percentile_bands(trajectories: &[Trajectory], horizon: u32, iterations: u32) -> Vec<PercentileBand> {
    let min_samples = MIN_BAND_SAMPLES.max((iterations as f64 * 0.1).ceil() as usize);
    let mut column = Vec::with_capacity(trajectories.len());
    let mut bands = Vec::new();

    for month in 1..=horizon {
        column.clear();
        let mut active = 0;
        for trajectory in trajectories {
            match trajectory.balance_at(month) {
                Some(balance) => {
                    active += 1;
                    column.push(balance);
                }
                None => column.push(0.0),
            }
        }
        if active < min_samples {
            continue;
        }

        column.sort_by(|a, b| a.total_cmp(b));
        bands.push(PercentileBand {
            month,
            p10: percentile_sorted(&column, 10.0),
            p25: percentile_sorted(&column, 25.0),
            p50: percentile_sorted(&column, 50.0),
            p75: percentile_sorted(&column, 75.0),
            p90: percentile_sorted(&column, 90.0),
            active_scenarios: active,
        });
    }
    bands
}

fn final_balance(trajectory: &Trajectory, horizon: u32) -> f64 {
    trajectory.balance_at(horizon).unwrap_or(0.0)
}

fn max_drawdown(balances: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut worst = 0.0_f64;
    for &b in balances {
        peak = peak.max(b);
        if peak > 0.0 {
            worst = worst.max((peak - b) / peak);
        }
    }
    worst
}

fn risk_metrics(trajectories: &[Trajectory], horizon: u32) -> RiskMetrics {
    let mut finals = trajectories
        .iter()
        .map(|t| final_balance(t, horizon))
        .collect::<Vec<_>>();
    finals.sort_by(|a, b| a.total_cmp(b));
    let n = finals.len().max(1) as f64;

    let mean_final_balance = finals.iter().sum::<f64>() / n;
    let value_at_risk_95 = percentile_sorted(&finals, 5.0);
    let tail = finals
        .iter()
        .copied()
        .filter(|b| *b <= value_at_risk_95)
        .collect::<Vec<_>>();
    let conditional_value_at_risk_95 = if tail.is_empty() {
        value_at_risk_95
    } else {
        tail.iter().sum::<f64>() / tail.len() as f64
    };

    let mut depletion_months = trajectories
        .iter()
        .filter_map(|t| t.first_shortfall_month.map(|m| m as f64))
        .collect::<Vec<_>>();
    let depletion_probability = depletion_months.len() as f64 / n;
    let median_depletion_month =
        (!depletion_months.is_empty()).then(|| percentile(&mut depletion_months, 50.0));

    let mut drawdowns = trajectories
        .iter()
        .map(|t| max_drawdown(&t.total_balances))
        .collect::<Vec<_>>();
    drawdowns.sort_by(|a, b| a.total_cmp(b));

    RiskMetrics {
        mean_final_balance,
        median_final_balance: percentile_sorted(&finals, 50.0),
        value_at_risk_95,
        conditional_value_at_risk_95,
        depletion_probability,
        median_depletion_month,
        max_drawdown_p50: percentile_sorted(&drawdowns, 50.0),
        max_drawdown_p90: percentile_sorted(&drawdowns, 90.0),
        max_drawdown_p95: percentile_sorted(&drawdowns, 95.0),
    }
}

/// Linear-interpolation order statistic; sorts `values` in place.
pub fn percentile(values: &mut [f64], p: f64) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    percentile_sorted(values, p)
}

fn percentile_sorted(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p / 100.0).clamp(0.0, 1.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = (rank.ceil() as usize).min(n - 1);

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}
