//! CSV renderings of projection and Monte Carlo output.

use csv::WriterBuilder;

use super::error::{EngineError, EngineResult};
use super::types::{PercentileBand, Plan, ProjectionResult};

const BAND_HEADER: [&str; 7] = ["Year", "P10", "P25", "P50_Median", "P75", "P90", "ActiveScenarios"];

fn export_err(err: impl std::fmt::Display) -> EngineError {
    EngineError::Export(err.to_string())
}

fn money(value: f64) -> String {
    format!("{value:.2}")
}

/// Calendar label for a 1-indexed projection month.
pub fn month_label(plan: &Plan, month: u32) -> String {
    let offset = plan.start_month.saturating_sub(1) + month.saturating_sub(1);
    let year = plan.start_year + (offset / 12) as i32;
    format!("{year:04}-{:02}", offset % 12 + 1)
}

/// One row per month; asset columns follow first appearance, and assets
/// created mid-run read as 0 before they exist.
pub fn projection_csv(plan: &Plan, projection: &ProjectionResult) -> EngineResult<String> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());

    let mut header = vec![
        "Month".to_string(),
        "Date".to_string(),
        "Income".to_string(),
        "Expenses".to_string(),
        "Shortfall".to_string(),
    ];
    header.extend(projection.balance_history.iter().map(|h| h.name.clone()));
    writer.write_record(&header).map_err(export_err)?;

    for result in &projection.results {
        let idx = (result.month - 1) as usize;
        let mut row = vec![
            result.month.to_string(),
            month_label(plan, result.month),
            money(result.income),
            money(result.expenses),
            money(result.shortfall),
        ];
        row.extend(
            projection
                .balance_history
                .iter()
                .map(|h| money(h.balances.get(idx).copied().unwrap_or(0.0))),
        );
        writer.write_record(&row).map_err(export_err)?;
    }

    finish(writer)
}

pub fn bands_csv(bands: &[PercentileBand]) -> EngineResult<String> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(BAND_HEADER).map_err(export_err)?;
    for band in bands {
        writer
            .write_record([
                format!("{:.2}", band.month as f64 / 12.0),
                money(band.p10),
                money(band.p25),
                money(band.p50),
                money(band.p75),
                money(band.p90),
                band.active_scenarios.to_string(),
            ])
            .map_err(export_err)?;
    }
    finish(writer)
}

fn finish(writer: csv::Writer<Vec<u8>>) -> EngineResult<String> {
    let bytes = writer.into_inner().map_err(export_err)?;
    String::from_utf8(bytes).map_err(export_err)
}
