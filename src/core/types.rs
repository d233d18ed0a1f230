use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::error::{EngineError, EngineResult, shape};
use super::rates::RateSchedule;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxTreatment {
    #[default]
    #[serde(alias = "taxable_brokerage")]
    Taxable,
    #[serde(alias = "taxDeferred", alias = "tax-deferred")]
    TaxDeferred,
    #[serde(alias = "taxFree", alias = "tax-free", alias = "roth")]
    TaxFree,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compounding {
    #[default]
    Monthly,
    Annual,
}

/// Flat withdrawal tax rate per treatment.
///
/// Tax-free withdrawals are never taxed, so `tax_free` must stay at zero.
#[derive(Copy, Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxConfig {
    pub taxable: f64,
    #[serde(alias = "taxDeferred")]
    pub tax_deferred: f64,
    #[serde(alias = "taxFree")]
    pub tax_free: f64,
}

impl TaxConfig {
    pub fn rate_for(&self, treatment: TaxTreatment) -> f64 {
        match treatment {
            TaxTreatment::Taxable => self.taxable,
            TaxTreatment::TaxDeferred => self.tax_deferred,
            TaxTreatment::TaxFree => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub monthly_expenses: f64,
    pub duration_months: u32,
    #[serde(default)]
    pub inflation_schedule: Option<String>,
    #[serde(default = "default_start_year")]
    pub start_year: i32,
    #[serde(default = "default_start_month")]
    pub start_month: u32,
    #[serde(default)]
    pub stop_on_shortfall: bool,
}

fn default_start_year() -> i32 {
    2025
}

fn default_start_month() -> u32 {
    1
}

fn default_event_start() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    #[serde(default, alias = "taxTreatment", alias = "type")]
    pub tax_treatment: TaxTreatment,
    pub balance: f64,
    #[serde(default, alias = "minBalance")]
    pub min_balance: f64,
    #[serde(default, alias = "compoundingPeriod")]
    pub compounding: Compounding,
    #[serde(default, alias = "returnScheduleRef", alias = "return_schedule_ref")]
    pub return_schedule: Option<String>,
    #[serde(default, alias = "activationMonth")]
    pub activation_month: Option<u32>,
}

impl Asset {
    /// An asset materialised by a deposit that names an unknown account.
    pub fn placeholder(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tax_treatment: TaxTreatment::Taxable,
            balance: 0.0,
            min_balance: 0.0,
            compounding: Compounding::Monthly,
            return_schedule: None,
            activation_month: None,
        }
    }

    pub fn is_active(&self, month: u32) -> bool {
        self.activation_month.is_none_or(|start| month >= start)
    }
}

/// Signed recurring or one-off cash flow; negative amounts are expenses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomeEvent {
    pub name: String,
    pub amount: f64,
    #[serde(default = "default_event_start", alias = "startMonth")]
    pub start_month: u32,
    #[serde(default, alias = "stopMonth")]
    pub stop_month: Option<u32>,
}

impl IncomeEvent {
    pub fn is_active(&self, month: u32) -> bool {
        window_contains(self.start_month, self.stop_month, month)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositEvent {
    pub name: String,
    pub amount: f64,
    #[serde(default = "default_event_start", alias = "startMonth")]
    pub start_month: u32,
    #[serde(default, alias = "stopMonth")]
    pub stop_month: Option<u32>,
    #[serde(default, alias = "targetAssetName", alias = "target_asset_name")]
    pub target_asset: Option<String>,
}

impl DepositEvent {
    pub fn is_active(&self, month: u32) -> bool {
        window_contains(self.start_month, self.stop_month, month)
    }
}

fn window_contains(start: u32, stop: Option<u32>, month: u32) -> bool {
    month >= start && stop.is_none_or(|stop| month <= stop)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalOrderEntry {
    #[serde(alias = "accountRef", alias = "asset")]
    pub account: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub weight: Option<f64>,
}

/// Immutable projection input.
///
/// Deserialising goes through [`ScenarioDocument`] so that a missing plan,
/// asset list or required plan field is rejected instead of defaulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ScenarioDocument")]
pub struct Scenario {
    pub plan: Plan,
    pub tax: TaxConfig,
    pub assets: Vec<Asset>,
    pub income: Vec<IncomeEvent>,
    pub deposits: Vec<DepositEvent>,
    pub order: Vec<WithdrawalOrderEntry>,
    pub rate_schedules: BTreeMap<String, RateSchedule>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PlanDocument {
    #[serde(alias = "monthlyExpenses")]
    monthly_expenses: Option<f64>,
    #[serde(alias = "durationMonths")]
    duration_months: Option<u32>,
    #[serde(alias = "inflationScheduleRef", alias = "inflation_schedule_ref")]
    inflation_schedule: Option<String>,
    start_year: Option<i32>,
    start_month: Option<u32>,
    #[serde(alias = "stopOnShortfall", alias = "auto_stop")]
    stop_on_shortfall: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ScenarioDocument {
    plan: Option<PlanDocument>,
    #[serde(alias = "taxConfig", alias = "tax_config")]
    tax: TaxConfig,
    assets: Option<Vec<Asset>>,
    income: Vec<IncomeEvent>,
    deposits: Vec<DepositEvent>,
    #[serde(alias = "withdrawal_order")]
    order: Vec<WithdrawalOrderEntry>,
    #[serde(alias = "rateSchedules")]
    rate_schedules: BTreeMap<String, RateSchedule>,
}

impl TryFrom<ScenarioDocument> for Scenario {
    type Error = EngineError;

    fn try_from(doc: ScenarioDocument) -> EngineResult<Self> {
        let plan = doc.plan.ok_or_else(|| shape("missing plan"))?;
        let monthly_expenses = plan
            .monthly_expenses
            .ok_or_else(|| shape("missing plan.monthly_expenses"))?;
        let duration_months = plan
            .duration_months
            .ok_or_else(|| shape("missing plan.duration_months"))?;
        let assets = doc.assets.ok_or_else(|| shape("missing assets"))?;

        let scenario = Scenario {
            plan: Plan {
                monthly_expenses,
                duration_months,
                inflation_schedule: plan.inflation_schedule,
                start_year: plan.start_year.unwrap_or_else(default_start_year),
                start_month: plan.start_month.unwrap_or_else(default_start_month),
                stop_on_shortfall: plan.stop_on_shortfall,
            },
            tax: doc.tax,
            assets,
            income: doc.income,
            deposits: doc.deposits,
            order: doc.order,
            rate_schedules: doc.rate_schedules,
        };
        scenario.validate()?;
        Ok(scenario)
    }
}

impl Scenario {
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let doc = serde_json::from_str::<ScenarioDocument>(json)
            .map_err(|e| shape(format!("invalid scenario JSON: {e}")))?;
        Self::try_from(doc)
    }

    pub fn from_value(value: serde_json::Value) -> EngineResult<Self> {
        let doc = serde_json::from_value::<ScenarioDocument>(value)
            .map_err(|e| shape(format!("invalid scenario JSON: {e}")))?;
        Self::try_from(doc)
    }

    /// Shape checks only; the engine trusts upstream validation for anything
    /// semantic beyond these.
    pub fn validate(&self) -> EngineResult<()> {
        let plan = &self.plan;
        if !plan.monthly_expenses.is_finite() || plan.monthly_expenses < 0.0 {
            return Err(shape("plan.monthly_expenses must be a finite value >= 0"));
        }
        if plan.duration_months == 0 {
            return Err(shape("plan.duration_months must be > 0"));
        }
        if !(1..=12).contains(&plan.start_month) {
            return Err(shape("plan.start_month must be between 1 and 12"));
        }

        for (label, rate) in [
            ("taxable", self.tax.taxable),
            ("tax_deferred", self.tax.tax_deferred),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return Err(shape(format!("tax.{label} must be in [0, 1)")));
            }
        }
        if self.tax.tax_free != 0.0 {
            return Err(shape("tax.tax_free must be 0"));
        }

        let mut names = HashSet::new();
        for asset in &self.assets {
            if asset.name.trim().is_empty() {
                return Err(shape("asset name must not be empty"));
            }
            if !names.insert(asset.name.as_str()) {
                return Err(shape(format!("duplicate asset name '{}'", asset.name)));
            }
            if !asset.balance.is_finite() || !asset.min_balance.is_finite() {
                return Err(shape(format!(
                    "asset '{}' balances must be finite",
                    asset.name
                )));
            }
            if asset.activation_month == Some(0) {
                return Err(shape(format!(
                    "asset '{}' activation_month is 1-indexed",
                    asset.name
                )));
            }
        }

        for event in &self.income {
            check_window(&event.name, event.amount, event.start_month, event.stop_month)?;
        }
        for event in &self.deposits {
            check_window(&event.name, event.amount, event.start_month, event.stop_month)?;
            if let Some(target) = &event.target_asset {
                names.insert(target.as_str());
            }
        }

        for entry in &self.order {
            if !names.contains(entry.account.as_str()) {
                return Err(shape(format!(
                    "withdrawal order references unknown account '{}'",
                    entry.account
                )));
            }
            if let Some(weight) = entry.weight {
                if !weight.is_finite() || weight < 0.0 {
                    return Err(shape(format!(
                        "withdrawal weight for '{}' must be finite and >= 0",
                        entry.account
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_window(name: &str, amount: f64, start: u32, stop: Option<u32>) -> EngineResult<()> {
    if !amount.is_finite() {
        return Err(shape(format!("event '{name}' amount must be finite")));
    }
    if start == 0 {
        return Err(shape(format!("event '{name}' start_month is 1-indexed")));
    }
    if stop.is_some_and(|stop| stop < start) {
        return Err(shape(format!("event '{name}' stop_month precedes start_month")));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRecord {
    pub from_asset: String,
    pub gross_amount: f64,
    pub net_amount: f64,
    pub tax_owed: f64,
    pub effective_tax_rate: f64,
    pub remaining_balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyResult {
    pub month: u32,
    pub income: f64,
    pub expenses: f64,
    pub withdrawals: Vec<WithdrawalRecord>,
    pub shortfall: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetHistory {
    pub name: String,
    pub balances: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionResult {
    pub results: Vec<MonthlyResult>,
    pub balance_history: Vec<AssetHistory>,
    pub actual_duration: u32,
    pub first_shortfall_month: Option<u32>,
    pub first_dynamic_asset_month: Option<u32>,
}

impl ProjectionResult {
    /// Sum of recorded balances at a 1-indexed month; 0 past the end.
    pub fn total_balance_at(&self, month: u32) -> f64 {
        if month == 0 || month > self.actual_duration {
            return 0.0;
        }
        let idx = (month - 1) as usize;
        self.balance_history
            .iter()
            .filter_map(|h| h.balances.get(idx))
            .sum()
    }

    pub fn total_balances(&self) -> Vec<f64> {
        (1..=self.actual_duration)
            .map(|month| self.total_balance_at(month))
            .collect()
    }

    pub fn history_for(&self, name: &str) -> Option<&[f64]> {
        self.balance_history
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.balances.as_slice())
    }
}

/// One Monte Carlo trial's projection, frozen once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trajectory {
    pub trial: u32,
    pub seed: u64,
    pub results: Vec<MonthlyResult>,
    pub balance_history: Vec<AssetHistory>,
    pub total_balances: Vec<f64>,
    pub actual_duration: u32,
    pub first_shortfall_month: Option<u32>,
}

impl Trajectory {
    pub fn from_projection(trial: u32, seed: u64, projection: ProjectionResult) -> Self {
        let total_balances = projection.total_balances();
        Self {
            trial,
            seed,
            results: projection.results,
            balance_history: projection.balance_history,
            total_balances,
            actual_duration: projection.actual_duration,
            first_shortfall_month: projection.first_shortfall_month,
        }
    }

    /// Balance at a 1-indexed month, or `None` once the trial has stopped.
    pub fn balance_at(&self, month: u32) -> Option<f64> {
        if month == 0 {
            return None;
        }
        self.total_balances.get((month - 1) as usize).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileBand {
    pub month: u32,
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub active_scenarios: usize,
}
