use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, warn};

use super::error::{EngineError, EngineResult};
use super::rates::{RateResolver, monthly_factor};
use super::types::{
    Asset, AssetHistory, Compounding, MonthlyResult, Plan, ProjectionResult, Scenario, TaxConfig,
    WithdrawalOrderEntry, WithdrawalRecord,
};

/// Residual need below this is treated as met.
const SHORTFALL_EPSILON: f64 = 1e-6;

/// Per-run inputs that vary between Monte Carlo trials without touching the
/// scenario itself.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub noise_seed: u64,
    pub rate_overrides: HashMap<String, Vec<f64>>,
}

#[derive(Debug)]
struct AssetSlot {
    asset: Asset,
    history: Vec<f64>,
}

impl AssetSlot {
    fn is_eligible(&self, month: u32, tax: &TaxConfig) -> bool {
        self.asset.is_active(month)
            && self.asset.balance > self.asset.min_balance
            && tax.rate_for(self.asset.tax_treatment) < 1.0
    }
}

/// Assets addressed by index, seeded from the scenario and grown when a
/// deposit names an account that does not exist yet.
#[derive(Debug)]
struct AssetArena {
    slots: Vec<AssetSlot>,
    index: HashMap<String, usize>,
}

impl AssetArena {
    fn from_assets(assets: &[Asset]) -> Self {
        let mut arena = Self {
            slots: Vec::with_capacity(assets.len()),
            index: HashMap::with_capacity(assets.len()),
        };
        for asset in assets {
            arena.push(asset.clone(), 0);
        }
        arena
    }

    fn push(&mut self, asset: Asset, recorded_months: usize) -> usize {
        let idx = self.slots.len();
        self.index.insert(asset.name.clone(), idx);
        self.slots.push(AssetSlot {
            asset,
            history: vec![0.0; recorded_months],
        });
        idx
    }

    fn lookup(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Returns the slot for `name`, creating it with a zero back-filled
    /// history when missing. The flag reports whether it was created.
    fn get_or_create(&mut self, name: &str, recorded_months: usize) -> (usize, bool) {
        match self.lookup(name) {
            Some(idx) => (idx, false),
            None => (self.push(Asset::placeholder(name), recorded_months), true),
        }
    }

    fn into_history(self) -> Vec<AssetHistory> {
        self.slots
            .into_iter()
            .map(|slot| AssetHistory {
                name: slot.asset.name,
                balances: slot.history,
            })
            .collect()
    }
}

struct OrderGroup<'a> {
    priority: u32,
    entries: Vec<&'a WithdrawalOrderEntry>,
}

fn order_groups(order: &[WithdrawalOrderEntry]) -> Vec<OrderGroup<'_>> {
    let mut by_priority: BTreeMap<u32, Vec<&WithdrawalOrderEntry>> = BTreeMap::new();
    for entry in order {
        by_priority.entry(entry.priority).or_default().push(entry);
    }
    by_priority
        .into_iter()
        .map(|(priority, entries)| OrderGroup { priority, entries })
        .collect()
}

pub fn run_projection(scenario: &Scenario) -> EngineResult<ProjectionResult> {
    run_projection_with(scenario, &RunOverrides::default())
}

pub fn run_projection_with(
    scenario: &Scenario,
    overrides: &RunOverrides,
) -> EngineResult<ProjectionResult> {
    scenario.validate()?;
    check_schedule_refs(scenario)?;

    let mut resolver = RateResolver::new(&scenario.rate_schedules, scenario.plan.start_year)
        .with_noise_seed(overrides.noise_seed)
        .with_overrides(overrides.rate_overrides.clone());

    let plan = &scenario.plan;
    let groups = order_groups(&scenario.order);
    let mut arena = AssetArena::from_assets(&scenario.assets);
    let mut results = Vec::with_capacity(plan.duration_months as usize);
    let mut first_shortfall_month = None;
    let mut first_dynamic_asset_month = None;
    let mut warned_untargeted = HashSet::new();
    let mut actual_duration = 0;

    for month in 1..=plan.duration_months {
        let recorded = (month - 1) as usize;

        for deposit in scenario.deposits.iter().filter(|d| d.is_active(month)) {
            let Some(target) = deposit.target_asset.as_deref() else {
                if warned_untargeted.insert(deposit.name.as_str()) {
                    warn!(deposit = deposit.name.as_str(), "deposit has no target asset; skipped");
                }
                continue;
            };
            let (idx, created) = arena.get_or_create(target, recorded);
            if created {
                debug!(asset = target, month, "materialised asset from deposit");
                first_dynamic_asset_month.get_or_insert(month);
            }
            arena.slots[idx].asset.balance += deposit.amount;
        }

        let income = scenario
            .income
            .iter()
            .filter(|e| e.is_active(month))
            .map(|e| e.amount)
            .sum::<f64>();
        let expenses = inflated_expenses(plan, &mut resolver, month)?;
        let need = expenses - income;

        let mut withdrawals = Vec::new();
        let shortfall = if need > SHORTFALL_EPSILON {
            let unmet = allocate_withdrawals(
                &groups,
                &mut arena,
                &scenario.tax,
                month,
                need,
                &mut withdrawals,
            );
            if unmet > SHORTFALL_EPSILON { unmet } else { 0.0 }
        } else {
            0.0
        };

        apply_growth(&mut arena, &mut resolver, month)?;
        for slot in &mut arena.slots {
            let recorded_balance = if slot.asset.is_active(month) {
                slot.asset.balance
            } else {
                0.0
            };
            slot.history.push(recorded_balance);
        }

        results.push(MonthlyResult {
            month,
            income,
            expenses,
            withdrawals,
            shortfall,
        });
        actual_duration = month;

        if shortfall > 0.0 {
            first_shortfall_month.get_or_insert(month);
            if plan.stop_on_shortfall {
                debug!(month, shortfall, "stopping projection on shortfall");
                break;
            }
        }
    }

    Ok(ProjectionResult {
        results,
        balance_history: arena.into_history(),
        actual_duration,
        first_shortfall_month,
        first_dynamic_asset_month,
    })
}

/// Every schedule the plan or an asset names must be registered on the
/// scenario itself; per-run overrides never stand in for a missing one.
pub(crate) fn check_schedule_refs(scenario: &Scenario) -> EngineResult<()> {
    let refs = scenario
        .plan
        .inflation_schedule
        .iter()
        .chain(scenario.assets.iter().filter_map(|a| a.return_schedule.as_ref()));
    for name in refs {
        if !scenario.rate_schedules.contains_key(name) {
            return Err(EngineError::UnknownSchedule(name.clone()));
        }
    }
    Ok(())
}

/// Base expense compounded from period zero at the inflation rate in force
/// for this month.
fn inflated_expenses(plan: &Plan, resolver: &mut RateResolver<'_>, month: u32) -> EngineResult<f64> {
    let Some(schedule) = plan.inflation_schedule.as_deref() else {
        return Ok(plan.monthly_expenses);
    };
    let rate = resolver.resolve(schedule, month - 1)?;
    let years = (month - 1) as f64 / 12.0;
    Ok(plan.monthly_expenses * (1.0 + rate).max(0.0).powf(years))
}

/// Walks priority groups in ascending order and returns the unmet need.
///
/// Within a group the need is split by weight across eligible siblings only;
/// siblings that hit their floor drop out and the residue is re-split among
/// the rest before moving to the next group.
fn allocate_withdrawals(
    groups: &[OrderGroup<'_>],
    arena: &mut AssetArena,
    tax: &TaxConfig,
    month: u32,
    need: f64,
    records: &mut Vec<WithdrawalRecord>,
) -> f64 {
    let mut remaining = need;

    for group in groups {
        if remaining <= SHORTFALL_EPSILON {
            break;
        }

        for _ in 0..=group.entries.len() {
            if remaining <= SHORTFALL_EPSILON {
                break;
            }

            let eligible = group
                .entries
                .iter()
                .filter_map(|entry| {
                    let idx = arena.lookup(&entry.account)?;
                    arena.slots[idx]
                        .is_eligible(month, tax)
                        .then(|| (idx, entry.weight.unwrap_or(1.0).max(0.0)))
                })
                .collect::<Vec<_>>();
            if eligible.is_empty() {
                break;
            }

            let weight_total = eligible.iter().map(|(_, w)| w).sum::<f64>();
            let even_share = 1.0 / eligible.len() as f64;
            let round_target = remaining;
            let mut round_realized = 0.0;

            for &(idx, weight) in &eligible {
                let share = if weight_total > 1e-12 {
                    weight / weight_total
                } else {
                    even_share
                };
                let target_net = round_target * share;
                if target_net <= 0.0 {
                    continue;
                }
                let slot = &mut arena.slots[idx];
                let rate = tax.rate_for(slot.asset.tax_treatment);
                let (gross, net) = withdraw_for_net(&mut slot.asset, target_net, rate);
                if gross <= 0.0 {
                    continue;
                }
                round_realized += net;
                merge_record(records, &slot.asset, gross, net, rate);
            }

            remaining = round_target - round_realized;
            if round_realized <= SHORTFALL_EPSILON {
                break;
            }
        }

        debug!(
            month,
            priority = group.priority,
            remaining,
            "withdrawal group processed"
        );
    }

    remaining.max(0.0)
}

/// Tax-grosses a net target against one asset, capped at its floor.
/// Returns `(gross, net)`.
fn withdraw_for_net(asset: &mut Asset, target_net: f64, tax_rate: f64) -> (f64, f64) {
    let available_gross = (asset.balance - asset.min_balance).max(0.0);
    if target_net <= 0.0 || available_gross <= 0.0 {
        return (0.0, 0.0);
    }

    let keep = 1.0 - tax_rate;
    let max_net = available_gross * keep;
    if target_net >= max_net {
        asset.balance = asset.min_balance;
        return (available_gross, max_net);
    }

    let gross = target_net / keep;
    asset.balance = (asset.balance - gross).max(asset.min_balance);
    (gross, target_net)
}

fn merge_record(
    records: &mut Vec<WithdrawalRecord>,
    asset: &Asset,
    gross: f64,
    net: f64,
    rate: f64,
) {
    let tax_owed = gross - net;
    if let Some(existing) = records.iter_mut().find(|r| r.from_asset == asset.name) {
        existing.gross_amount += gross;
        existing.net_amount += net;
        existing.tax_owed += tax_owed;
        existing.remaining_balance = asset.balance;
        return;
    }
    records.push(WithdrawalRecord {
        from_asset: asset.name.clone(),
        gross_amount: gross,
        net_amount: net,
        tax_owed,
        effective_tax_rate: rate,
        remaining_balance: asset.balance,
    });
}

fn apply_growth(
    arena: &mut AssetArena,
    resolver: &mut RateResolver<'_>,
    month: u32,
) -> EngineResult<()> {
    for slot in &mut arena.slots {
        let asset = &mut slot.asset;
        if !asset.is_active(month) {
            continue;
        }
        let Some(schedule) = asset.return_schedule.as_deref() else {
            continue;
        };
        match asset.compounding {
            Compounding::Monthly => {
                let annual = resolver.resolve(schedule, month - 1)?;
                asset.balance *= monthly_factor(annual);
            }
            Compounding::Annual => {
                // Anniversaries count from activation, not from plan start.
                let active_months = month + 1 - asset.activation_month.unwrap_or(1);
                if active_months % 12 == 0 {
                    let annual = resolver.resolve(schedule, month - 1)?;
                    asset.balance *= (1.0 + annual).max(0.0);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rates::RateSchedule;
    use crate::core::types::{DepositEvent, IncomeEvent, TaxTreatment};
    use proptest::prelude::{prop_assert, proptest};

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn asset(name: &str, treatment: TaxTreatment, balance: f64) -> Asset {
        Asset {
            name: name.to_string(),
            tax_treatment: treatment,
            balance,
            min_balance: 0.0,
            compounding: Compounding::Monthly,
            return_schedule: None,
            activation_month: None,
        }
    }

    fn entry(account: &str, priority: u32, weight: Option<f64>) -> WithdrawalOrderEntry {
        WithdrawalOrderEntry {
            account: account.to_string(),
            priority,
            weight,
        }
    }

    fn scenario(monthly_expenses: f64, duration_months: u32) -> Scenario {
        Scenario {
            plan: Plan {
                monthly_expenses,
                duration_months,
                inflation_schedule: None,
                start_year: 2025,
                start_month: 1,
                stop_on_shortfall: false,
            },
            tax: TaxConfig {
                taxable: 0.15,
                tax_deferred: 0.22,
                tax_free: 0.0,
            },
            assets: Vec::new(),
            income: Vec::new(),
            deposits: Vec::new(),
            order: Vec::new(),
            rate_schedules: BTreeMap::new(),
        }
    }

    fn withdrawal<'a>(result: &'a MonthlyResult, name: &str) -> Option<&'a WithdrawalRecord> {
        result.withdrawals.iter().find(|w| w.from_asset == name)
    }

    #[test]
    fn oracle_tax_deferred_first_month_grosses_up() {
        let mut s = scenario(4000.0, 12);
        s.assets.push(asset("ira", TaxTreatment::TaxDeferred, 200_000.0));
        s.order.push(entry("ira", 1, None));

        let out = run_projection(&s).expect("projection runs");
        let first = &out.results[0];
        let w = withdrawal(first, "ira").expect("withdrawal recorded");
        assert_approx_tol(w.gross_amount, 5128.21, 0.01);
        assert_approx_tol(w.net_amount, 4000.0, 1e-9);
        assert_approx_tol(w.tax_owed, 1128.21, 0.01);
        assert_eq!(w.effective_tax_rate, 0.22);
        assert_approx_tol(w.remaining_balance, 200_000.0 - 4000.0 / 0.78, 1e-6);
        assert_eq!(first.shortfall, 0.0);
        assert_eq!(out.actual_duration, 12);
    }

    #[test]
    fn floor_equal_to_balance_stops_at_first_month() {
        let mut s = scenario(1000.0, 24);
        s.plan.stop_on_shortfall = true;
        let mut only = asset("cash", TaxTreatment::TaxFree, 5000.0);
        only.min_balance = 5000.0;
        s.assets.push(only);
        s.order.push(entry("cash", 1, None));

        let out = run_projection(&s).expect("projection runs");
        assert_eq!(out.actual_duration, 1);
        assert_eq!(out.results.len(), 1);
        assert!(out.results[0].shortfall > 0.0);
        assert_eq!(out.first_shortfall_month, Some(1));
        assert_eq!(out.history_for("cash").unwrap(), &[5000.0]);
    }

    #[test]
    fn depletion_without_auto_stop_runs_full_duration() {
        let mut s = scenario(1000.0, 6);
        s.assets.push(asset("cash", TaxTreatment::TaxFree, 2500.0));
        s.order.push(entry("cash", 1, None));

        let out = run_projection(&s).expect("projection runs");
        assert_eq!(out.actual_duration, 6);
        assert_eq!(out.results[1].shortfall, 0.0);
        assert_approx_tol(out.results[2].shortfall, 500.0, 1e-9);
        assert_approx_tol(out.results[3].shortfall, 1000.0, 1e-9);
        assert_eq!(out.first_shortfall_month, Some(3));
    }

    #[test]
    fn unactivated_sibling_does_not_block_group() {
        let mut s = scenario(3000.0, 3);
        s.assets.push(asset("brokerage", TaxTreatment::TaxFree, 100_000.0));
        let mut later = asset("inheritance", TaxTreatment::TaxFree, 50_000.0);
        later.activation_month = Some(3);
        s.assets.push(later);
        s.order.push(entry("brokerage", 1, Some(1.0)));
        s.order.push(entry("inheritance", 1, Some(3.0)));

        let out = run_projection(&s).expect("projection runs");
        let first = &out.results[0];
        assert_eq!(first.shortfall, 0.0);
        assert_approx_tol(withdrawal(first, "brokerage").unwrap().net_amount, 3000.0, 1e-9);
        assert!(withdrawal(first, "inheritance").is_none());

        let third = &out.results[2];
        assert_approx_tol(withdrawal(third, "brokerage").unwrap().net_amount, 750.0, 1e-9);
        assert_approx_tol(withdrawal(third, "inheritance").unwrap().net_amount, 2250.0, 1e-9);

        let history = out.history_for("inheritance").unwrap();
        assert_eq!(history[0], 0.0);
        assert_eq!(history[1], 0.0);
        assert_approx_tol(history[2], 47_750.0, 1e-9);
    }

    #[test]
    fn capped_sibling_residue_moves_to_others_then_next_group() {
        let mut s = scenario(1000.0, 1);
        s.assets.push(asset("a", TaxTreatment::TaxFree, 100.0));
        s.assets.push(asset("b", TaxTreatment::TaxFree, 10_000.0));
        s.assets.push(asset("c", TaxTreatment::Taxable, 10_000.0));
        s.order.push(entry("a", 1, None));
        s.order.push(entry("b", 1, None));
        s.order.push(entry("c", 2, None));

        let out = run_projection(&s).expect("projection runs");
        let first = &out.results[0];
        assert_approx_tol(withdrawal(first, "a").unwrap().net_amount, 100.0, 1e-9);
        assert_approx_tol(withdrawal(first, "b").unwrap().net_amount, 900.0, 1e-9);
        assert!(withdrawal(first, "c").is_none());
        assert_eq!(first.withdrawals.len(), 2);

        let mut s = scenario(1000.0, 1);
        s.assets.push(asset("a", TaxTreatment::TaxFree, 400.0));
        s.assets.push(asset("c", TaxTreatment::Taxable, 10_000.0));
        s.order.push(entry("a", 1, None));
        s.order.push(entry("c", 2, None));
        let out = run_projection(&s).expect("projection runs");
        let w = withdrawal(&out.results[0], "c").unwrap();
        assert_approx_tol(w.net_amount, 600.0, 1e-9);
        assert_approx_tol(w.gross_amount, 600.0 / 0.85, 1e-9);
    }

    #[test]
    fn income_offsets_need_and_negative_events_add_to_it() {
        let mut s = scenario(2000.0, 4);
        s.assets.push(asset("cash", TaxTreatment::TaxFree, 100_000.0));
        s.order.push(entry("cash", 1, None));
        s.income.push(IncomeEvent {
            name: "pension".to_string(),
            amount: 1500.0,
            start_month: 2,
            stop_month: None,
        });
        s.income.push(IncomeEvent {
            name: "roof".to_string(),
            amount: -700.0,
            start_month: 3,
            stop_month: Some(3),
        });

        let out = run_projection(&s).expect("projection runs");
        let nets = out
            .results
            .iter()
            .map(|r| withdrawal(r, "cash").map_or(0.0, |w| w.net_amount))
            .collect::<Vec<_>>();
        assert_eq!(nets, vec![2000.0, 500.0, 1200.0, 500.0]);
        assert_eq!(out.results[2].income, 800.0);
    }

    #[test]
    fn surplus_month_records_no_withdrawal_and_no_shortfall() {
        let mut s = scenario(1000.0, 2);
        s.assets.push(asset("cash", TaxTreatment::TaxFree, 100.0));
        s.order.push(entry("cash", 1, None));
        s.income.push(IncomeEvent {
            name: "salary".to_string(),
            amount: 5000.0,
            start_month: 1,
            stop_month: None,
        });

        let out = run_projection(&s).expect("projection runs");
        assert!(out.results.iter().all(|r| r.withdrawals.is_empty()));
        assert!(out.results.iter().all(|r| r.shortfall == 0.0));
        assert_eq!(out.history_for("cash").unwrap(), &[100.0, 100.0]);
    }

    #[test]
    fn inflation_compounds_from_period_zero() {
        let mut s = scenario(1000.0, 25);
        s.plan.inflation_schedule = Some("cpi".to_string());
        s.rate_schedules
            .insert("cpi".to_string(), RateSchedule::Fixed { rate: 0.03 });

        let out = run_projection(&s).expect("projection runs");
        assert_eq!(out.results[0].expenses, 1000.0);
        assert_approx_tol(out.results[12].expenses, 1030.0, 1e-9);
        assert_approx_tol(out.results[24].expenses, 1000.0 * 1.03_f64.powi(2), 1e-9);
    }

    #[test]
    fn growth_respects_compounding_period() {
        let mut s = scenario(0.0, 12);
        s.rate_schedules
            .insert("growth".to_string(), RateSchedule::Fixed { rate: 0.12 });
        let mut monthly = asset("monthly", TaxTreatment::Taxable, 1000.0);
        monthly.return_schedule = Some("growth".to_string());
        let mut annual = asset("annual", TaxTreatment::Taxable, 1000.0);
        annual.return_schedule = Some("growth".to_string());
        annual.compounding = Compounding::Annual;
        s.assets.push(monthly);
        s.assets.push(annual);

        let out = run_projection(&s).expect("projection runs");
        let m = out.history_for("monthly").unwrap();
        let a = out.history_for("annual").unwrap();
        assert_approx_tol(m[0], 1000.0 * monthly_factor(0.12), 1e-9);
        assert_approx_tol(m[11], 1120.0, 1e-9);
        assert_eq!(a[10], 1000.0);
        assert_approx_tol(a[11], 1120.0, 1e-9);
    }

    #[test]
    fn annual_compounding_counts_from_activation() {
        let mut s = scenario(0.0, 24);
        s.rate_schedules
            .insert("growth".to_string(), RateSchedule::Fixed { rate: 0.10 });
        let mut late = asset("late", TaxTreatment::Taxable, 1000.0);
        late.return_schedule = Some("growth".to_string());
        late.compounding = Compounding::Annual;
        late.activation_month = Some(7);
        s.assets.push(late);

        let out = run_projection(&s).expect("projection runs");
        let h = out.history_for("late").unwrap();
        assert_eq!(h[5], 0.0);
        assert_eq!(h[11], 1000.0);
        assert_eq!(h[16], 1000.0);
        assert_approx_tol(h[17], 1100.0, 1e-9);
        assert_approx_tol(h[23], 1100.0, 1e-9);
    }

    #[test]
    fn overrides_never_register_a_missing_schedule() {
        let mut s = scenario(0.0, 12);
        let mut a = asset("ghosted", TaxTreatment::Taxable, 1000.0);
        a.return_schedule = Some("ghost".to_string());
        s.assets.push(a);

        let overrides = RunOverrides {
            noise_seed: 0,
            rate_overrides: HashMap::from([("ghost".to_string(), vec![0.05])]),
        };
        let err = run_projection_with(&s, &overrides).unwrap_err();
        assert_eq!(err, EngineError::UnknownSchedule("ghost".to_string()));
    }

    #[test]
    fn deposit_materialises_asset_with_backfilled_history() {
        let mut s = scenario(0.0, 5);
        s.deposits.push(DepositEvent {
            name: "bonus".to_string(),
            amount: 250.0,
            start_month: 3,
            stop_month: Some(4),
            target_asset: Some("savings".to_string()),
        });

        let out = run_projection(&s).expect("projection runs");
        assert_eq!(out.first_dynamic_asset_month, Some(3));
        assert_eq!(
            out.history_for("savings").unwrap(),
            &[0.0, 0.0, 250.0, 500.0, 500.0]
        );
    }

    #[test]
    fn rerun_is_reentrant_and_identical() {
        let mut s = scenario(900.0, 36);
        s.deposits.push(DepositEvent {
            name: "gift".to_string(),
            amount: 5000.0,
            start_month: 10,
            stop_month: Some(10),
            target_asset: Some("gift".to_string()),
        });
        s.assets.push(asset("cash", TaxTreatment::TaxFree, 10_000.0));
        s.order.push(entry("gift", 1, None));
        s.order.push(entry("cash", 2, None));

        let first = run_projection(&s).expect("projection runs");
        let second = run_projection(&s).expect("projection runs");
        assert_eq!(first, second);
        assert_eq!(s.assets.len(), 1, "scenario is never mutated");
    }

    #[test]
    fn unknown_schedule_reference_fails_before_running() {
        let mut s = scenario(100.0, 12);
        let mut a = asset("stocks", TaxTreatment::Taxable, 1000.0);
        a.return_schedule = Some("missing".to_string());
        s.assets.push(a);

        let err = run_projection(&s).unwrap_err();
        assert_eq!(err, EngineError::UnknownSchedule("missing".to_string()));
    }

    #[test]
    fn malformed_scenario_is_a_shape_error() {
        let s = scenario(100.0, 0);
        assert!(matches!(run_projection(&s), Err(EngineError::Shape(_))));
    }

    #[test]
    fn overrides_replace_schedule_per_run() {
        let mut s = scenario(0.0, 24);
        s.rate_schedules
            .insert("stocks".to_string(), RateSchedule::Fixed { rate: 0.0 });
        let mut a = asset("stocks", TaxTreatment::Taxable, 1000.0);
        a.return_schedule = Some("stocks".to_string());
        a.compounding = Compounding::Annual;
        s.assets.push(a);

        let overrides = RunOverrides {
            noise_seed: 0,
            rate_overrides: HashMap::from([("stocks".to_string(), vec![0.5, -0.5])]),
        };
        let out = run_projection_with(&s, &overrides).expect("projection runs");
        let h = out.history_for("stocks").unwrap();
        assert_approx_tol(h[11], 1500.0, 1e-9);
        assert_approx_tol(h[23], 750.0, 1e-9);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(48))]

        #[test]
        fn prop_withdrawals_respect_floors_and_tax_identity(
            expenses in 0u32..20_000,
            taxable_bal in 0u32..400_000,
            deferred_bal in 0u32..400_000,
            free_bal in 0u32..400_000,
            floor_pct in 0u32..100,
            activation in 1u32..30,
            rate_bp in 0u32..1200,
            w1 in 0u32..5,
            w2 in 0u32..5,
        ) {
            let mut s = scenario(expenses as f64, 36);
            s.rate_schedules.insert(
                "growth".to_string(),
                RateSchedule::Fixed { rate: rate_bp as f64 / 10_000.0 },
            );
            let mut taxable = asset("taxable", TaxTreatment::Taxable, taxable_bal as f64);
            taxable.min_balance = taxable.balance * floor_pct as f64 / 100.0;
            taxable.return_schedule = Some("growth".to_string());
            let mut deferred = asset("deferred", TaxTreatment::TaxDeferred, deferred_bal as f64);
            deferred.activation_month = Some(activation);
            deferred.compounding = Compounding::Annual;
            deferred.return_schedule = Some("growth".to_string());
            let free = asset("free", TaxTreatment::TaxFree, free_bal as f64);
            let floors = [
                ("taxable", taxable.min_balance, None),
                ("deferred", 0.0, Some(activation)),
                ("free", 0.0, None),
            ];
            s.assets.extend([taxable, deferred, free]);
            s.order.push(entry("taxable", 1, Some(w1 as f64)));
            s.order.push(entry("deferred", 1, Some(w2 as f64)));
            s.order.push(entry("free", 2, None));

            let out = run_projection(&s).expect("projection runs");
            for (name, floor, activation) in floors {
                let history = out.history_for(name).unwrap();
                for (i, balance) in history.iter().enumerate() {
                    let month = i as u32 + 1;
                    if activation.is_some_and(|start| month < start) {
                        prop_assert!(*balance == 0.0);
                    } else {
                        prop_assert!(*balance >= floor - 1e-9);
                    }
                }
            }
            for result in &out.results {
                prop_assert!(result.shortfall >= 0.0);
                for w in &result.withdrawals {
                    let expected_net = w.gross_amount * (1.0 - w.effective_tax_rate);
                    prop_assert!((w.net_amount - expected_net).abs() <= 1e-6 * w.gross_amount.max(1.0));
                    prop_assert!((w.tax_owed - (w.gross_amount - w.net_amount)).abs() <= 1e-6);
                    if w.from_asset == "free" {
                        prop_assert!(w.effective_tax_rate == 0.0);
                    }
                }
                let net_total = result.withdrawals.iter().map(|w| w.net_amount).sum::<f64>();
                prop_assert!((net_total + result.shortfall - result.expenses).abs() <= 1e-5);
            }
        }
    }
}
