//! Embedded FY2025 knowledge base for entity E250
//!
//! Static figures the engine falls back on when the warehouse cannot answer:
//! crop area, yield and prices, production-cost benchmarks, and the reported
//! financial headlines.

use crate::models::Scenario;
use serde::{Deserialize, Serialize};

pub const ENTITY: &str = "E250";
pub const FISCAL_PERIOD: &str = "FY2025";
pub const TOTAL_AREA_HA: f64 = 180_624.0;

/// Gross margin per hectare the business plans against (USD).
pub const GM_PER_HA_TARGET: f64 = 200.0;
pub const GM_PERCENT_TARGET: f64 = 35.0;
pub const EBITDA_MARGIN_TARGET: f64 = 15.0;

/// SAR per USD; ledger lines are in SAR, driver figures in USD.
pub const USD_SAR: f64 = 3.75;

/// One crop line of the FY2025 plan.
pub struct CropProfile {
    pub crop: &'static str,
    pub area_ha: f64,
    pub yield_t_ha: f64,
    pub actual_price: f64,
    pub budget_price: f64,
    pub cost_per_ton: Option<f64>,
}

pub const CROPS: &[CropProfile] = &[
    CropProfile {
        crop: "winter_wheat",
        area_ha: 39_573.0,
        yield_t_ha: 6.78,
        actual_price: 249.85,
        budget_price: 233.0,
        cost_per_ton: Some(115.0),
    },
    CropProfile {
        crop: "winter_barley",
        area_ha: 11_527.0,
        yield_t_ha: 6.22,
        actual_price: 241.55,
        budget_price: 252.0,
        cost_per_ton: None,
    },
    CropProfile {
        crop: "winter_osr",
        area_ha: 31_500.0,
        yield_t_ha: 3.22,
        actual_price: 567.60,
        budget_price: 483.0,
        cost_per_ton: Some(270.0),
    },
    CropProfile {
        crop: "maize",
        area_ha: 26_457.0,
        yield_t_ha: 10.34,
        actual_price: 235.51,
        budget_price: 243.0,
        cost_per_ton: Some(118.0),
    },
    CropProfile {
        crop: "soybean",
        area_ha: 49_766.0,
        yield_t_ha: 3.24,
        actual_price: 478.29,
        budget_price: 493.0,
        cost_per_ton: None,
    },
    CropProfile {
        crop: "sunflower",
        area_ha: 17_312.0,
        yield_t_ha: 3.24,
        actual_price: 518.75,
        budget_price: 405.0,
        cost_per_ton: None,
    },
];

/// A reported ledger headline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub metric: String,
    pub period: String,
    pub scenario: Scenario,
    pub amount: f64,
    pub currency: String,
    /// Reporting basis, e.g. year-to-date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basis: Option<String>,
}

fn sar(metric: &str, period: &str, scenario: Scenario, amount: f64, basis: &str) -> LedgerEntry {
    LedgerEntry {
        metric: metric.to_string(),
        period: period.to_string(),
        scenario,
        amount,
        currency: "SAR".to_string(),
        basis: Some(basis.to_string()),
    }
}

pub fn ledger() -> Vec<LedgerEntry> {
    vec![
        sar("revenue", FISCAL_PERIOD, Scenario::Actual, 846_000_000.0, "ytd_may"),
        sar("ebitda", FISCAL_PERIOD, Scenario::Actual, 164_000_000.0, "ytd_may"),
        sar("net_income", FISCAL_PERIOD, Scenario::Actual, 65_000_000.0, "ytd_may"),
        sar("revenue", FISCAL_PERIOD, Scenario::Forecast, 2_928_000_000.0, "full_year"),
        sar("ebitda", FISCAL_PERIOD, Scenario::Forecast, 397_000_000.0, "full_year"),
        sar("net_income", FISCAL_PERIOD, Scenario::Forecast, 151_000_000.0, "full_year"),
        sar("revenue", FISCAL_PERIOD, Scenario::Budget, 1_920_000_000.0, "full_year"),
        sar("ebitda", FISCAL_PERIOD, Scenario::Budget, 383_000_000.0, "full_year"),
        sar("net_income", FISCAL_PERIOD, Scenario::Budget, 97_000_000.0, "full_year"),
        sar("ga_expenses", "FY2024-09", Scenario::Actual, 218_927.84, "month"),
        sar("ga_expenses", "FY2024-10", Scenario::Actual, 9_322.16, "month"),
        sar("ga_expenses", "FY2024-11", Scenario::Actual, 9_154.40, "month"),
        sar("ga_expenses", "FY2024-12", Scenario::Actual, -891.92, "month"),
    ]
}

/// Map a crop word from a question onto the knowledge-base crop key.
pub fn canonical_crop(word: &str) -> Option<&'static str> {
    match word.trim().to_lowercase().as_str() {
        "wheat" | "winter wheat" | "winter_wheat" => Some("winter_wheat"),
        "barley" | "winter barley" | "winter_barley" => Some("winter_barley"),
        "osr" | "rapeseed" | "canola" | "winter osr" | "winter_osr" => Some("winter_osr"),
        "maize" | "corn" => Some("maize"),
        "soybean" | "soybeans" | "soy" | "soya" => Some("soybean"),
        "sunflower" | "sunflowers" => Some("sunflower"),
        _ => None,
    }
}

pub fn crop(name: &str) -> Option<&'static CropProfile> {
    CROPS.iter().find(|c| c.crop == name)
}
