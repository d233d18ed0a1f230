mod engine;
mod error;
mod export;
mod history;
mod monte_carlo;
mod rates;
mod returns;
mod seed;
mod solver;
mod types;

pub use engine::{RunOverrides, run_projection, run_projection_with};
pub use error::{EngineError, EngineResult};
pub use export::{bands_csv, month_label, projection_csv};
pub use history::{ANNUAL_RETURNS, HistoricalYear};
pub use monte_carlo::{
    CancelFlag, MonteCarloOptions, MonteCarloResult, RiskMetrics, VariableRange, analyze,
    analyze_with, percentile, percentile_bands,
};
pub use rates::{PipelineStep, RateResolver, RateSchedule, StepOp, YearRange, monthly_factor};
pub use returns::{
    AssetClass, HISTORICAL_BOOTSTRAP, HISTORICAL_SEQUENCE, HistoricalBootstrap, HistoricalSequence,
    INDEPENDENT_NORMAL, IndependentNormal, NormalParams, ReturnModel, ReturnModelConfig,
    ReturnModelRegistry, ReturnRequest, ReturnSeries,
};
pub use solver::{SolveConfig, SolveIteration, SolveResult, solve_spending};
pub use types::{
    Asset, AssetHistory, Compounding, DepositEvent, IncomeEvent, MonthlyResult, PercentileBand,
    Plan, ProjectionResult, Scenario, TaxConfig, TaxTreatment, Trajectory, WithdrawalOrderEntry,
    WithdrawalRecord,
};
