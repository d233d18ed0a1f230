use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::{EngineError, EngineResult};
use super::monte_carlo::{MonteCarloOptions, analyze};
use super::types::Scenario;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SolveConfig {
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
    pub simulations_per_iteration: u32,
    pub final_simulations: u32,
}

impl Default for SolveConfig {
    fn default() -> Self {
        Self {
            search_min: 0.0,
            search_max: 50_000.0,
            tolerance: 5.0,
            max_iterations: 24,
            simulations_per_iteration: 250,
            final_simulations: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_expenses: f64,
    pub success_rate: f64,
    pub success_ci_half_width: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveResult {
    pub target_success_rate: f64,
    pub config: SolveConfig,
    pub solved_monthly_expenses: Option<f64>,
    pub achieved_success_rate: Option<f64>,
    pub achieved_success_ci_half_width: Option<f64>,
    pub iterations: Vec<SolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

/// Highest `plan.monthly_expenses` whose Monte Carlo success rate still
/// meets `options.target_success_rate`.
///
/// Every candidate reuses the same seed, so the success rate is a
/// deterministic (and, barring sampling noise, non-increasing) function of
/// spend.
pub fn solve_spending(
    scenario: &Scenario,
    options: &MonteCarloOptions,
    config: SolveConfig,
) -> EngineResult<SolveResult> {
    validate_config(config)?;
    scenario.validate()?;
    let target = options.target_success_rate;

    info!(
        search_min = config.search_min,
        search_max = config.search_max,
        target,
        "solving for sustainable spending"
    );

    let meets = |eval: &CandidateEval| eval.success_rate + 1e-12 >= target;
    let floor = evaluate_candidate(
        scenario,
        options,
        config.search_min,
        config.simulations_per_iteration,
    )?;
    let ceiling = evaluate_candidate(
        scenario,
        options,
        config.search_max,
        config.simulations_per_iteration,
    )?;

    let mut iterations = Vec::new();
    let outcome = if !meets(&floor) {
        Outcome::Infeasible
    } else if meets(&ceiling) {
        Outcome::CeilingFeasible
    } else {
        // Invariant: `sustainable` meets the target, `failing` does not.
        let mut sustainable = config.search_min;
        let mut failing = config.search_max;
        let mut closed = false;
        for iteration in 1..=config.max_iterations {
            let candidate = sustainable + (failing - sustainable) * 0.5;
            let eval =
                evaluate_candidate(scenario, options, candidate, config.simulations_per_iteration)?;
            debug!(iteration, candidate, success_rate = eval.success_rate, "bisection step");
            iterations.push(SolveIteration {
                iteration,
                lower_bound: sustainable,
                upper_bound: failing,
                candidate_expenses: candidate,
                success_rate: eval.success_rate,
                success_ci_half_width: eval.success_ci_half_width,
            });
            if meets(&eval) {
                sustainable = candidate;
            } else {
                failing = candidate;
            }
            if failing - sustainable <= config.tolerance {
                closed = true;
                break;
            }
        }
        Outcome::Bracketed {
            spend: sustainable,
            closed,
        }
    };

    let solved = outcome.spend(config.search_max);
    let converged = !matches!(outcome, Outcome::Infeasible | Outcome::Bracketed { closed: false, .. });
    let feasible = !matches!(outcome, Outcome::Infeasible);
    let message = outcome.message().to_string();

    let mut achieved_success_rate = None;
    let mut achieved_success_ci_half_width = None;
    if let Some(value) = solved {
        let eval = evaluate_candidate(scenario, options, value, config.final_simulations)?;
        achieved_success_rate = Some(eval.success_rate);
        achieved_success_ci_half_width = Some(eval.success_ci_half_width);
    }

    info!(solved = ?solved, feasible, converged, "spending solve complete");

    Ok(SolveResult {
        target_success_rate: target,
        config,
        solved_monthly_expenses: solved,
        achieved_success_rate,
        achieved_success_ci_half_width,
        iterations,
        converged,
        feasible,
        message,
    })
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    /// Even the lowest spend misses the target.
    Infeasible,
    /// The highest spend searched still meets the target.
    CeilingFeasible,
    Bracketed { spend: f64, closed: bool },
}

impl Outcome {
    fn spend(self, search_max: f64) -> Option<f64> {
        match self {
            Outcome::Infeasible => None,
            Outcome::CeilingFeasible => Some(search_max),
            Outcome::Bracketed { spend, .. } => Some(spend),
        }
    }

    fn message(self) -> &'static str {
        match self {
            Outcome::Infeasible => "Target success rate is missed even at the minimum spend.",
            Outcome::CeilingFeasible => {
                "Maximum spend searched still meets the target; raise searchMax to look higher."
            }
            Outcome::Bracketed { closed: true, .. } => {
                "Found the highest monthly spend meeting the target."
            }
            Outcome::Bracketed { closed: false, .. } => {
                "Spend bracket still wider than tolerance after maxIterations; reporting the sustainable end."
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CandidateEval {
    success_rate: f64,
    success_ci_half_width: f64,
}

fn evaluate_candidate(
    base: &Scenario,
    options: &MonteCarloOptions,
    monthly_expenses: f64,
    simulations: u32,
) -> EngineResult<CandidateEval> {
    let mut scenario = base.clone();
    scenario.plan.monthly_expenses = monthly_expenses.max(0.0);
    let options = MonteCarloOptions {
        iterations: simulations.max(1),
        ..options.clone()
    };

    let result = analyze(&scenario, &options)?;
    Ok(CandidateEval {
        success_rate: result.success_rate,
        success_ci_half_width: binomial_ci_half_width(result.success_rate, options.iterations),
    })
}

fn binomial_ci_half_width(p: f64, n: u32) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    1.96 * (p * (1.0 - p) / n as f64).sqrt()
}

fn validate_config(config: SolveConfig) -> EngineResult<()> {
    let invalid = |msg: &str| Err(EngineError::InvalidOptions(msg.to_string()));
    if !config.search_min.is_finite() || !config.search_max.is_finite() {
        return invalid("search bounds must be finite");
    }
    if config.search_min < 0.0 {
        return invalid("searchMin must be >= 0");
    }
    if config.search_max <= config.search_min {
        return invalid("searchMax must be greater than searchMin");
    }
    if !config.tolerance.is_finite() || config.tolerance <= 0.0 {
        return invalid("tolerance must be > 0");
    }
    if config.max_iterations == 0 {
        return invalid("maxIterations must be > 0");
    }
    if config.simulations_per_iteration == 0 {
        return invalid("simulationsPerIteration must be > 0");
    }
    if config.final_simulations == 0 {
        return invalid("finalSimulations must be > 0");
    }
    Ok(())
}
