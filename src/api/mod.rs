use axum::{
    Router,
    body::Bytes,
    extract::Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::core::{
    AssetHistory, EngineError, HISTORICAL_BOOTSTRAP, HISTORICAL_SEQUENCE, INDEPENDENT_NORMAL,
    MonteCarloOptions, MonteCarloResult, MonthlyResult, PercentileBand, RiskMetrics, Scenario,
    SolveConfig, SolveResult, Trajectory, analyze, bands_csv, projection_csv, run_projection,
    solve_spending,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliReturnModel {
    IndependentNormal,
    HistoricalBootstrap,
    HistoricalSequence,
}

impl From<CliReturnModel> for String {
    fn from(value: CliReturnModel) -> Self {
        match value {
            CliReturnModel::IndependentNormal => INDEPENDENT_NORMAL,
            CliReturnModel::HistoricalBootstrap => HISTORICAL_BOOTSTRAP,
            CliReturnModel::HistoricalSequence => HISTORICAL_SEQUENCE,
        }
        .to_string()
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "runway",
    about = "Monthly drawdown projection and Monte Carlo risk analysis for household portfolios"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run one deterministic projection.
    Project {
        scenario: PathBuf,
        #[arg(long, help = "Print the monthly CSV instead of JSON")]
        csv: bool,
    },
    /// Run a Monte Carlo analysis.
    MonteCarlo {
        #[command(flatten)]
        analysis: AnalysisArgs,
        #[arg(long, help = "Print the percentile band CSV instead of JSON")]
        csv: bool,
    },
    /// Find the highest monthly spend that still meets the success target.
    Solve {
        #[command(flatten)]
        analysis: AnalysisArgs,
        #[arg(long, default_value_t = 0.0)]
        search_min: f64,
        #[arg(long, default_value_t = 50_000.0)]
        search_max: f64,
        #[arg(long, default_value_t = 5.0)]
        tolerance: f64,
        #[arg(long, default_value_t = 24)]
        max_iterations: u32,
        #[arg(long, default_value_t = 250)]
        simulations_per_iteration: u32,
        #[arg(long, default_value_t = 1000)]
        final_simulations: u32,
    },
}

#[derive(Args, Debug, Clone)]
struct AnalysisArgs {
    scenario: PathBuf,
    #[arg(long, help = "JSON file of Monte Carlo options; flags below override it")]
    options: Option<PathBuf>,
    #[arg(long)]
    iterations: Option<u32>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, value_enum)]
    return_model: Option<CliReturnModel>,
    #[arg(long)]
    target_survival_months: Option<u32>,
    #[arg(long, help = "Target success rate in percent, e.g. 90")]
    target_success_rate: Option<f64>,
}

impl AnalysisArgs {
    fn load(&self) -> Result<(Scenario, MonteCarloOptions), String> {
        let scenario = load_scenario(&self.scenario)?;
        let base = match &self.options {
            Some(path) => {
                let text = read_file(path)?;
                serde_json::from_str::<MonteCarloOptions>(&text)
                    .map_err(|e| format!("Invalid options JSON in {}: {e}", path.display()))?
            }
            None => MonteCarloOptions::default(),
        };
        Ok((scenario, self.apply(base)?))
    }

    fn apply(&self, mut options: MonteCarloOptions) -> Result<MonteCarloOptions, String> {
        if let Some(iterations) = self.iterations {
            options.iterations = iterations;
        }
        if let Some(seed) = self.seed {
            options.random_seed = seed;
        }
        if let Some(model) = self.return_model {
            options.return_model = model.into();
        }
        if let Some(months) = self.target_survival_months {
            options.target_survival_months = Some(months);
        }
        if let Some(percent) = self.target_success_rate {
            if !(0.0..=100.0).contains(&percent) {
                return Err("--target-success-rate must be between 0 and 100".to_string());
            }
            options.target_success_rate = percent / 100.0;
        }
        Ok(options)
    }
}

fn read_file(path: &Path) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("Failed to read {}: {e}", path.display()))
}

fn load_scenario(path: &Path) -> Result<Scenario, String> {
    Scenario::from_json(&read_file(path)?).map_err(|e| e.to_string())
}

fn to_pretty_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("Failed to encode JSON: {e}"))
}

pub async fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Serve { port } => run_http_server(port)
            .await
            .map_err(|e| format!("Server error: {e}")),
        Command::Project { scenario, csv } => {
            let scenario = load_scenario(&scenario)?;
            let response = build_project_response(&scenario).map_err(|e| e.to_string())?;
            if csv {
                print!("{}", response.csv_text);
            } else {
                println!("{}", to_pretty_json(&response)?);
            }
            Ok(())
        }
        Command::MonteCarlo { analysis, csv } => {
            let (scenario, options) = analysis.load()?;
            let result = analyze(&scenario, &options).map_err(|e| e.to_string())?;
            let response =
                build_monte_carlo_response(result, false).map_err(|e| e.to_string())?;
            if csv {
                print!("{}", response.band_csv);
            } else {
                println!("{}", to_pretty_json(&response)?);
            }
            Ok(())
        }
        Command::Solve {
            analysis,
            search_min,
            search_max,
            tolerance,
            max_iterations,
            simulations_per_iteration,
            final_simulations,
        } => {
            let (scenario, options) = analysis.load()?;
            let config = SolveConfig {
                search_min,
                search_max,
                tolerance,
                max_iterations,
                simulations_per_iteration,
                final_simulations,
            };
            let result = solve_spending(&scenario, &options, config).map_err(|e| e.to_string())?;
            println!("{}", to_pretty_json(&result)?);
            Ok(())
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectResponse {
    results: Vec<MonthlyResult>,
    balance_history: Vec<AssetHistory>,
    actual_duration: u32,
    first_shortfall_month: Option<u32>,
    first_dynamic_asset_month: Option<u32>,
    csv_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonteCarloRequest {
    scenario: serde_json::Value,
    #[serde(default)]
    options: MonteCarloOptions,
    #[serde(default)]
    include_trajectories: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MonteCarloResponse {
    iterations: u32,
    return_model: String,
    success_rate: f64,
    target_success_rate: f64,
    meets_target: bool,
    percentile_bands: Vec<PercentileBand>,
    risk_metrics: RiskMetrics,
    band_csv: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    trajectories: Option<Vec<Trajectory>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SolveRequest {
    scenario: serde_json::Value,
    #[serde(default)]
    options: MonteCarloOptions,
    #[serde(default)]
    config: SolveConfig,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match err {
            EngineError::Shape(_)
            | EngineError::UnknownSchedule(_)
            | EngineError::UnknownReturnModel(_)
            | EngineError::InvalidOptions(_) => StatusCode::BAD_REQUEST,
            EngineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

fn build_project_response(scenario: &Scenario) -> Result<ProjectResponse, EngineError> {
    let projection = run_projection(scenario)?;
    let csv_text = projection_csv(&scenario.plan, &projection)?;
    Ok(ProjectResponse {
        results: projection.results,
        balance_history: projection.balance_history,
        actual_duration: projection.actual_duration,
        first_shortfall_month: projection.first_shortfall_month,
        first_dynamic_asset_month: projection.first_dynamic_asset_month,
        csv_text,
    })
}

fn build_monte_carlo_response(
    result: MonteCarloResult,
    include_trajectories: bool,
) -> Result<MonteCarloResponse, EngineError> {
    let band_csv = bands_csv(&result.percentile_bands)?;
    Ok(MonteCarloResponse {
        iterations: result.iterations,
        return_model: result.return_model,
        success_rate: result.success_rate,
        target_success_rate: result.target_success_rate,
        meets_target: result.meets_target,
        percentile_bands: result.percentile_bands,
        risk_metrics: result.risk_metrics,
        band_csv,
        trajectories: include_trajectories.then_some(result.trajectories),
    })
}

fn project_from_body(body: &[u8]) -> Result<ProjectResponse, ApiError> {
    let text = std::str::from_utf8(body).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let scenario = Scenario::from_json(text)?;
    Ok(build_project_response(&scenario)?)
}

fn monte_carlo_from_body(body: &[u8]) -> Result<MonteCarloResponse, ApiError> {
    let request = serde_json::from_slice::<MonteCarloRequest>(body)
        .map_err(|e| ApiError::bad_request(format!("Invalid API JSON payload: {e}")))?;
    let scenario = Scenario::from_value(request.scenario)?;
    let result = analyze(&scenario, &request.options)?;
    Ok(build_monte_carlo_response(
        result,
        request.include_trajectories,
    )?)
}

fn solve_from_body(body: &[u8]) -> Result<SolveResult, ApiError> {
    let request = serde_json::from_slice::<SolveRequest>(body)
        .map_err(|e| ApiError::bad_request(format!("Invalid API JSON payload: {e}")))?;
    let scenario = Scenario::from_value(request.scenario)?;
    Ok(solve_spending(&scenario, &request.options, request.config)?)
}

pub fn router() -> Router {
    Router::new()
        .route("/api/project", post(project_handler))
        .route("/api/monte-carlo", post(monte_carlo_handler))
        .route("/api/solve", post(solve_handler))
        .fallback(not_found_handler)
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "runway HTTP API listening");
    axum::serve(listener, router()).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn project_handler(body: Bytes) -> Response {
    respond(tokio::task::spawn_blocking(move || project_from_body(&body)).await)
}

async fn monte_carlo_handler(body: Bytes) -> Response {
    respond(tokio::task::spawn_blocking(move || monte_carlo_from_body(&body)).await)
}

async fn solve_handler(body: Bytes) -> Response {
    respond(tokio::task::spawn_blocking(move || solve_from_body(&body)).await)
}

fn respond<T: Serialize>(outcome: Result<Result<T, ApiError>, tokio::task::JoinError>) -> Response {
    match outcome {
        Ok(Ok(body)) => json_response(StatusCode::OK, body),
        Ok(Err(err)) => error_response(err.status, &err.message),
        Err(join) => {
            error!(error = %join, "analysis task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Analysis task failed")
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}
