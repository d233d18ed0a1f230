//! Synthetic annual return generators used to perturb rate schedules per
//! Monte Carlo trial.

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use super::error::{EngineError, EngineResult};
use super::history::{ANNUAL_RETURNS, HistoricalYear};

pub const INDEPENDENT_NORMAL: &str = "independent-normal";
pub const HISTORICAL_BOOTSTRAP: &str = "historical-bootstrap";
pub const HISTORICAL_SEQUENCE: &str = "historical-sequence";

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Stocks,
    Bonds,
    Cash,
    Inflation,
}

impl AssetClass {
    fn historical(self, year: &HistoricalYear) -> f64 {
        match self {
            AssetClass::Stocks => year.stocks,
            AssetClass::Bonds => year.bonds,
            AssetClass::Cash => year.cash,
            AssetClass::Inflation => year.inflation,
        }
    }

    /// Sample mean and standard deviation of the class's historical series.
    pub fn historical_moments(self) -> NormalParams {
        let n = ANNUAL_RETURNS.len() as f64;
        let mean = ANNUAL_RETURNS.iter().map(|y| self.historical(y)).sum::<f64>() / n;
        let var = ANNUAL_RETURNS
            .iter()
            .map(|y| (self.historical(y) - mean).powi(2))
            .sum::<f64>()
            / (n - 1.0);
        NormalParams {
            mean,
            volatility: var.sqrt(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalParams {
    pub mean: f64,
    pub volatility: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReturnModelConfig {
    /// Added to every resampled historical return.
    pub shift: f64,
    /// Per-class parameters for `independent-normal`; missing classes use
    /// the historical moments.
    pub normal: BTreeMap<AssetClass, NormalParams>,
}

pub struct ReturnRequest<'a> {
    pub asset_classes: &'a [AssetClass],
    pub periods: usize,
    pub seed: u64,
    pub config: &'a ReturnModelConfig,
}

pub type ReturnSeries = BTreeMap<AssetClass, Vec<f64>>;

/// A seeded generator of `periods` annual returns per requested class.
///
/// Implementations must be pure functions of the request.
pub trait ReturnModel: Send + Sync {
    fn name(&self) -> &'static str;
    fn generate(&self, request: &ReturnRequest<'_>) -> ReturnSeries;
}

pub struct IndependentNormal;

impl ReturnModel for IndependentNormal {
    fn name(&self) -> &'static str {
        INDEPENDENT_NORMAL
    }

    fn generate(&self, request: &ReturnRequest<'_>) -> ReturnSeries {
        let mut rng = ChaCha8Rng::seed_from_u64(request.seed);
        let mut out = empty_series(request);
        let params = out
            .keys()
            .map(|class| {
                let p = request
                    .config
                    .normal
                    .get(class)
                    .copied()
                    .unwrap_or_else(|| class.historical_moments());
                (*class, p)
            })
            .collect::<Vec<_>>();

        for _ in 0..request.periods {
            for (class, p) in &params {
                let z: f64 = StandardNormal.sample(&mut rng);
                let r = (p.mean + p.volatility.max(0.0) * z).clamp(-0.95, 2.5);
                if let Some(series) = out.get_mut(class) {
                    series.push(r);
                }
            }
        }
        out
    }
}

/// I.i.d. resampling of whole historical years; classes share the drawn year
/// so cross-asset correlation survives.
pub struct HistoricalBootstrap;

impl ReturnModel for HistoricalBootstrap {
    fn name(&self) -> &'static str {
        HISTORICAL_BOOTSTRAP
    }

    fn generate(&self, request: &ReturnRequest<'_>) -> ReturnSeries {
        let mut rng = ChaCha8Rng::seed_from_u64(request.seed);
        let indices = (0..request.periods)
            .map(|_| rng.gen_range(0..ANNUAL_RETURNS.len()))
            .collect::<Vec<_>>();
        series_from_indices(request, &indices)
    }
}

/// One contiguous historical window per trial, preserving the order of
/// returns. Horizons longer than the table are padded with further random
/// contiguous segments.
pub struct HistoricalSequence;

impl ReturnModel for HistoricalSequence {
    fn name(&self) -> &'static str {
        HISTORICAL_SEQUENCE
    }

    fn generate(&self, request: &ReturnRequest<'_>) -> ReturnSeries {
        let mut rng = ChaCha8Rng::seed_from_u64(request.seed);
        let len = ANNUAL_RETURNS.len();
        let mut indices = Vec::with_capacity(request.periods);
        let first_span = request.periods.min(len);
        let mut start = rng.gen_range(0..=len - first_span);
        while indices.len() < request.periods {
            let take = (request.periods - indices.len()).min(len - start);
            indices.extend(start..start + take);
            start = rng.gen_range(0..len);
        }
        series_from_indices(request, &indices)
    }
}

fn empty_series(request: &ReturnRequest<'_>) -> ReturnSeries {
    request
        .asset_classes
        .iter()
        .map(|class| (*class, Vec::with_capacity(request.periods)))
        .collect()
}

fn series_from_indices(request: &ReturnRequest<'_>, indices: &[usize]) -> ReturnSeries {
    let shift = request.config.shift;
    request
        .asset_classes
        .iter()
        .map(|class| {
            let series = indices
                .iter()
                .map(|&i| class.historical(&ANNUAL_RETURNS[i]) + shift)
                .collect::<Vec<_>>();
            (*class, series)
        })
        .collect()
}

/// Name-addressed set of return models.
pub struct ReturnModelRegistry {
    models: BTreeMap<&'static str, Box<dyn ReturnModel>>,
}

impl ReturnModelRegistry {
    pub fn empty() -> Self {
        Self {
            models: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, model: Box<dyn ReturnModel>) {
        self.models.insert(model.name(), model);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.models.keys().copied().collect()
    }

    pub fn get(&self, name: &str) -> EngineResult<&dyn ReturnModel> {
        let key = name.trim().to_ascii_lowercase().replace('_', "-");
        self.models
            .get(key.as_str())
            .map(|m| m.as_ref())
            .ok_or_else(|| EngineError::UnknownReturnModel(name.to_string()))
    }
}

impl Default for ReturnModelRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(IndependentNormal));
        registry.register(Box::new(HistoricalBootstrap));
        registry.register(Box::new(HistoricalSequence));
        registry
    }
}
