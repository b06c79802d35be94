//! Static fallback dataset
//!
//! Loaded once (embedded or from a JSON file) and only read afterwards.

use crate::driver_tree::{AREA, COST_PER_TON, PRICE, YIELD};
use crate::knowledge::{self, LedgerEntry};
use crate::models::{DriverSet, Payload, QuerySpec, Row, Scenario, Subject, Unit};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use tracing::{debug, info};

/// Read-only lookup used when the live source cannot answer.
pub trait FallbackSource: Send + Sync {
    fn lookup(&self, query: &QuerySpec) -> Option<Payload>;
}

/// Crop drivers for one (period, scenario).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropDrivers {
    pub crop: String,
    pub period: String,
    pub scenario: Scenario,
    pub area: f64,
    #[serde(rename = "yield")]
    pub yield_t_ha: f64,
    pub price: f64,
    #[serde(default)]
    pub cost_per_ton: Option<f64>,
}

impl CropDrivers {
    fn volume(&self) -> f64 {
        self.area * self.yield_t_ha
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackDataset {
    pub entity: String,
    pub crops: Vec<CropDrivers>,
    pub ledger: Vec<LedgerEntry>,
}

impl FallbackDataset {
    /// The FY2025 figures compiled into the binary.
    ///
    /// The plan carries one area and yield per crop; actual and budget differ
    /// by price only.
    pub fn embedded() -> Self {
        let mut crops = Vec::with_capacity(knowledge::CROPS.len() * 2);

        for profile in knowledge::CROPS {
            for (scenario, price) in [
                (Scenario::Actual, profile.actual_price),
                (Scenario::Budget, profile.budget_price),
            ] {
                crops.push(CropDrivers {
                    crop: profile.crop.to_string(),
                    period: knowledge::FISCAL_PERIOD.to_string(),
                    scenario,
                    area: profile.area_ha,
                    yield_t_ha: profile.yield_t_ha,
                    price,
                    cost_per_ton: profile.cost_per_ton,
                });
            }
        }

        Self {
            entity: knowledge::ENTITY.to_string(),
            crops,
            ledger: knowledge::ledger(),
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let dataset: FallbackDataset = serde_json::from_str(&raw)?;

        info!(
            path = %path.display(),
            crops = dataset.crops.len(),
            ledger = dataset.ledger.len(),
            "Loaded fallback dataset"
        );

        Ok(dataset)
    }

    fn driver_payload(&self, query: &QuerySpec, crop: Option<&str>) -> Option<Payload> {
        let matching: Vec<&CropDrivers> = self
            .crops
            .iter()
            .filter(|c| c.scenario == query.scenario && query.period.covers(&c.period))
            .filter(|c| crop.map_or(true, |name| c.crop == name))
            .collect();

        if matching.is_empty() {
            return None;
        }

        let area: f64 = matching.iter().map(|c| c.area).sum();
        let volume: f64 = matching.iter().map(|c| c.volume()).sum();
        if area == 0.0 || volume == 0.0 {
            return None;
        }

        let price = matching.iter().map(|c| c.volume() * c.price).sum::<f64>() / volume;

        let mut set = DriverSet::new(&query.entity, &query.period.from, query.scenario)
            .with(AREA, area, Unit::Hectares)
            .with(YIELD, volume / area, Unit::TonnesPerHectare)
            .with(PRICE, price, Unit::UsdPerTonne);

        let missing_cost: Vec<&str> = matching
            .iter()
            .filter(|c| c.cost_per_ton.is_none())
            .map(|c| c.crop.as_str())
            .collect();

        if missing_cost.is_empty() {
            let cost = matching
                .iter()
                .map(|c| c.volume() * c.cost_per_ton.unwrap_or_default())
                .sum::<f64>()
                / volume;
            set = set.with(COST_PER_TON, cost, Unit::UsdPerTonne);
        } else {
            set.mark_unavailable(
                COST_PER_TON,
                &format!("no production-cost benchmark for {}", missing_cost.join(", ")),
            );
        }

        Some(Payload::Drivers(set))
    }

    fn ledger_payload(&self, query: &QuerySpec, metric: &str) -> Option<Payload> {
        let rows: Vec<Row> = self
            .ledger
            .iter()
            .filter(|e| {
                e.metric == metric && e.scenario == query.scenario && query.period.covers(&e.period)
            })
            .filter_map(|e| {
                let mut row = json!({
                    "entity": self.entity,
                    "metric": e.metric,
                    "period": e.period,
                    "scenario": e.scenario,
                    "amount": e.amount,
                    "currency": e.currency,
                });
                if let Some(basis) = &e.basis {
                    row["basis"] = json!(basis);
                }
                row.as_object().cloned()
            })
            .collect();

        if rows.is_empty() {
            None
        } else {
            Some(Payload::Rows(rows))
        }
    }
}

impl FallbackSource for FallbackDataset {
    fn lookup(&self, query: &QuerySpec) -> Option<Payload> {
        if query.entity != self.entity {
            debug!(entity = %query.entity, "Fallback dataset holds a different entity");
            return None;
        }

        match &query.subject {
            Subject::Drivers { crop } => self.driver_payload(query, crop.as_deref()),
            Subject::Ledger { metric } => self.ledger_payload(query, metric),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver_tree::{DriverTree, REVENUE};

    #[test]
    fn test_single_crop_lookup() {
        let dataset = FallbackDataset::embedded();
        let query = QuerySpec::drivers("E250", "FY2025", Scenario::Budget, Some("winter_wheat".into()));

        let set = match dataset.lookup(&query) {
            Some(Payload::Drivers(set)) => set,
            other => panic!("expected drivers, got {:?}", other),
        };

        assert_eq!(set.value(PRICE), Some(233.0));
        assert_eq!(set.value(COST_PER_TON), Some(115.0));
        assert_eq!(set.scenario, Scenario::Budget);
    }

    #[test]
    fn test_entity_aggregate_preserves_revenue() {
        let dataset = FallbackDataset::embedded();
        let query = QuerySpec::drivers("E250", "FY2025", Scenario::Actual, None);
        let set = dataset.lookup(&query).unwrap().driver_set(&query).unwrap();

        let expected: f64 = knowledge::CROPS
            .iter()
            .map(|c| c.area_ha * c.yield_t_ha * c.actual_price)
            .sum();
        let revenue = DriverTree::standard().unwrap().evaluate(REVENUE, &set).unwrap();

        assert!((revenue - expected).abs() / expected < 1e-9);
        assert!(set.unavailable_reason(COST_PER_TON).unwrap().contains("soybean"));
    }

    #[test]
    fn test_missing_scenario_and_entity() {
        let dataset = FallbackDataset::embedded();
        let forecast = QuerySpec::drivers("E250", "FY2025", Scenario::Forecast, None);
        assert!(dataset.lookup(&forecast).is_none());

        let other = QuerySpec::drivers("E999", "FY2025", Scenario::Actual, None);
        assert!(dataset.lookup(&other).is_none());
    }

    #[test]
    fn test_ledger_rows_by_sub_period() {
        let dataset = FallbackDataset::embedded();
        let query = QuerySpec::ledger("E250", "FY2024", Scenario::Actual, "ga_expenses");

        let rows = dataset.lookup(&query).unwrap().rows();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0]["period"], "FY2024-09");
        assert_eq!(rows[0]["currency"], "SAR");
    }

    #[test]
    fn test_dataset_file_round_trip() {
        let path = std::env::temp_dir().join(format!("fallback-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, serde_json::to_string(&FallbackDataset::embedded()).unwrap()).unwrap();

        let loaded = FallbackDataset::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.crops.len(), 12);
        assert_eq!(loaded.ledger, knowledge::ledger());
    }
}
