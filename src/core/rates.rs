//! Named, time-varying annual rate schedules.
//!
//! Schedules are user data: an unrecognised pipeline step is logged and
//! skipped rather than failing the run. Every resolved value is memoised per
//! (schedule, period) so noisy pipelines answer the same question the same
//! way for the whole run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::f64::consts::PI;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::{EngineError, EngineResult};
use super::seed::{derive_seed, fnv1a};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateSchedule {
    Fixed {
        rate: f64,
    },
    Sequence {
        start_year: i32,
        values: Vec<f64>,
        #[serde(default)]
        default: f64,
    },
    Map {
        ranges: Vec<YearRange>,
        #[serde(default)]
        default: f64,
    },
    Pipeline {
        steps: Vec<PipelineStep>,
    },
}

/// Inclusive calendar-year range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct YearRange {
    pub from_year: i32,
    pub to_year: i32,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StepOp {
    Seed {
        value: f64,
    },
    Add {
        value: f64,
    },
    Multiply {
        factor: f64,
    },
    Noise {
        std_dev: f64,
    },
    Trend {
        per_year: f64,
        #[serde(default)]
        from_year: Option<i32>,
    },
    Cycle {
        period_years: f64,
        amplitude: f64,
        #[serde(default)]
        phase_years: f64,
    },
    Overrides {
        years: BTreeMap<i32, f64>,
    },
    Clamp {
        min: f64,
        max: f64,
    },
    Floor {
        min: f64,
    },
    Ceiling {
        max: f64,
    },
}

/// A pipeline step as written by the user; anything that does not parse as a
/// known op is kept as `Unknown` and behaves as the identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PipelineStep {
    Known(StepOp),
    Unknown { op: String },
}

struct StepContext {
    year: i32,
    years_elapsed: f64,
    rng: ChaCha8Rng,
}

impl StepOp {
    fn apply(&self, rate: f64, ctx: &mut StepContext) -> f64 {
        match self {
            StepOp::Seed { value } => *value,
            StepOp::Add { value } => rate + value,
            StepOp::Multiply { factor } => rate * factor,
            StepOp::Noise { std_dev } => {
                let z: f64 = StandardNormal.sample(&mut ctx.rng);
                rate + std_dev.max(0.0) * z
            }
            StepOp::Trend {
                per_year,
                from_year,
            } => {
                let years = match from_year {
                    Some(from) => (ctx.year - from).max(0) as f64,
                    None => ctx.years_elapsed,
                };
                rate + per_year * years
            }
            StepOp::Cycle {
                period_years,
                amplitude,
                phase_years,
            } => {
                if *period_years <= 0.0 {
                    return rate;
                }
                let angle = 2.0 * PI * (ctx.years_elapsed + phase_years) / period_years;
                rate + amplitude * angle.sin()
            }
            StepOp::Overrides { years } => years.get(&ctx.year).copied().unwrap_or(rate),
            StepOp::Clamp { min, max } => rate.max(*min).min(*max),
            StepOp::Floor { min } => rate.max(*min),
            StepOp::Ceiling { max } => rate.min(*max),
        }
    }
}

/// Resolves schedule names to annual rates for zero-based monthly periods.
pub struct RateResolver<'a> {
    schedules: &'a BTreeMap<String, RateSchedule>,
    base_year: i32,
    noise_seed: u64,
    overrides: HashMap<String, Vec<f64>>,
    cache: HashMap<String, HashMap<u32, f64>>,
    warned_steps: HashSet<(String, usize)>,
}

impl<'a> RateResolver<'a> {
    pub fn new(schedules: &'a BTreeMap<String, RateSchedule>, base_year: i32) -> Self {
        Self {
            schedules,
            base_year,
            noise_seed: 0,
            overrides: HashMap::new(),
            cache: HashMap::new(),
            warned_steps: HashSet::new(),
        }
    }

    pub fn with_noise_seed(mut self, seed: u64) -> Self {
        self.noise_seed = seed;
        self
    }

    /// Replaces a schedule with an annual series indexed by `period / 12`;
    /// the last value holds past the end of the series.
    pub fn with_overrides(mut self, overrides: HashMap<String, Vec<f64>>) -> Self {
        self.overrides = overrides
            .into_iter()
            .filter(|(_, series)| !series.is_empty())
            .collect();
        self
    }

    pub fn resolve(&mut self, name: &str, period: u32) -> EngineResult<f64> {
        if let Some(series) = self.overrides.get(name) {
            let idx = ((period / 12) as usize).min(series.len() - 1);
            return Ok(series[idx]);
        }
        if let Some(rate) = self.cache.get(name).and_then(|by_period| by_period.get(&period)) {
            return Ok(*rate);
        }

        let schedules = self.schedules;
        let schedule = schedules
            .get(name)
            .ok_or_else(|| EngineError::UnknownSchedule(name.to_string()))?;
        let rate = self.evaluate(name, schedule, period);
        self.cache
            .entry(name.to_string())
            .or_default()
            .insert(period, rate);
        Ok(rate)
    }

    fn evaluate(&mut self, name: &str, schedule: &RateSchedule, period: u32) -> f64 {
        let years_elapsed = period / 12;
        let year = self.base_year + years_elapsed as i32;
        match schedule {
            RateSchedule::Fixed { rate } => *rate,
            RateSchedule::Sequence {
                start_year,
                values,
                default,
            } => {
                if year < *start_year {
                    return *default;
                }
                values
                    .get((year - start_year) as usize)
                    .copied()
                    .unwrap_or(*default)
            }
            RateSchedule::Map { ranges, default } => ranges
                .iter()
                .find(|r| (r.from_year..=r.to_year).contains(&year))
                .map(|r| r.rate)
                .unwrap_or(*default),
            RateSchedule::Pipeline { steps } => {
                let seed = derive_seed(self.noise_seed, fnv1a(name), period);
                let mut ctx = StepContext {
                    year,
                    years_elapsed: years_elapsed as f64,
                    rng: ChaCha8Rng::seed_from_u64(seed),
                };
                let mut rate = 0.0;
                for (idx, step) in steps.iter().enumerate() {
                    match step {
                        PipelineStep::Known(op) => rate = op.apply(rate, &mut ctx),
                        PipelineStep::Unknown { op } => {
                            if self.warned_steps.insert((name.to_string(), idx)) {
                                warn!(
                                    schedule = name,
                                    step = idx,
                                    op = op.as_str(),
                                    "unknown pipeline step treated as identity"
                                );
                            }
                        }
                    }
                }
                rate
            }
        }
    }
}

/// Monthly growth factor for an annual rate; a total loss floors at zero.
pub fn monthly_factor(annual_rate: f64) -> f64 {
    (1.0 + annual_rate).max(0.0).powf(1.0 / 12.0)
}
