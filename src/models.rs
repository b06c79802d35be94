//! Core data models for the analytics engine

use crate::error::AnalyticsError;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use uuid::Uuid;

/// One tabular row as returned by the warehouse or the fallback dataset.
pub type Row = serde_json::Map<String, Value>;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    Actual,
    Budget,
    Forecast,
}

impl FromStr for Scenario {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "actual" | "actuals" => Ok(Scenario::Actual),
            "budget" | "plan" | "oep_plan" => Ok(Scenario::Budget),
            "forecast" | "apr_forecast" => Ok(Scenario::Forecast),
            other => Err(AnalyticsError::InvalidInput(format!(
                "unknown scenario '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Hectares,
    TonnesPerHectare,
    Tonnes,
    UsdPerTonne,
    UsdPerHectare,
    Usd,
    Sar,
    Rate,
    Ratio,
}

impl Unit {
    pub fn is_monetary(&self) -> bool {
        matches!(
            self,
            Unit::Usd | Unit::Sar | Unit::UsdPerTonne | Unit::UsdPerHectare
        )
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Hectares => "ha",
            Unit::TonnesPerHectare => "t/ha",
            Unit::Tonnes => "t",
            Unit::UsdPerTonne => "USD/t",
            Unit::UsdPerHectare => "USD/ha",
            Unit::Usd => "USD",
            Unit::Sar => "SAR",
            Unit::Rate => "rate",
            Unit::Ratio => "ratio",
        }
    }

    pub fn decimals(&self, precision: &Precision) -> u32 {
        if self.is_monetary() {
            precision.monetary_decimals
        } else {
            precision.ratio_decimals
        }
    }
}

impl FromStr for Unit {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ha" | "hectares" => Ok(Unit::Hectares),
            "t/ha" | "tonnes_per_hectare" => Ok(Unit::TonnesPerHectare),
            "t" | "tonnes" => Ok(Unit::Tonnes),
            "usd/t" | "usd_per_tonne" => Ok(Unit::UsdPerTonne),
            "usd/ha" | "usd_per_hectare" => Ok(Unit::UsdPerHectare),
            "usd" => Ok(Unit::Usd),
            "sar" => Ok(Unit::Sar),
            "rate" => Ok(Unit::Rate),
            "ratio" | "%" => Ok(Unit::Ratio),
            other => Err(AnalyticsError::InvalidInput(format!("unknown unit '{}'", other))),
        }
    }
}

/// Most decimals a figure can be rounded to before `f64` loses the digits.
pub const MAX_DECIMALS: u32 = 12;

/// Rounding applied to reported figures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Precision {
    pub monetary_decimals: u32,
    pub ratio_decimals: u32,
}

impl Default for Precision {
    fn default() -> Self {
        Self {
            monetary_decimals: 2,
            ratio_decimals: 4,
        }
    }
}

impl Precision {
    pub fn round(&self, value: f64, unit: Unit) -> f64 {
        round_to(value, unit.decimals(self))
    }

    /// Half of the last kept decimal place.
    pub fn half_step(&self, unit: Unit) -> f64 {
        0.5 * 10f64.powi(-(unit.decimals(self) as i32))
    }
}

pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

//
// ================= Drivers =================
//

/// A single recorded driver figure. There are no setters: a changed figure is a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverValue {
    pub name: String,
    pub value: f64,
    pub unit: Unit,
    pub scenario: Scenario,
    pub period: String,
}

/// Driver figures for one (entity, period, scenario) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSet {
    pub entity: String,
    pub period: String,
    pub scenario: Scenario,
    values: BTreeMap<String, DriverValue>,
    /// Drivers known to be unavailable, with the reason.
    #[serde(default)]
    unavailable: BTreeMap<String, String>,
}

impl DriverSet {
    pub fn new(entity: impl Into<String>, period: impl Into<String>, scenario: Scenario) -> Self {
        Self {
            entity: entity.into(),
            period: period.into(),
            scenario,
            values: BTreeMap::new(),
            unavailable: BTreeMap::new(),
        }
    }

    /// Builder-style insert used while assembling a fresh set.
    pub fn with(mut self, name: &str, value: f64, unit: Unit) -> Self {
        let recorded = self.record(name, value, unit);
        self.unavailable.remove(name);
        self.values.insert(name.to_string(), recorded);
        self
    }

    pub fn with_unavailable(mut self, name: &str, reason: &str) -> Self {
        self.mark_unavailable(name, reason);
        self
    }

    /// Record a driver. Figures already recorded are never overwritten.
    pub fn insert(&mut self, value: DriverValue) -> Result<()> {
        if self.values.contains_key(&value.name) {
            return Err(AnalyticsError::InvalidInput(format!(
                "driver '{}' already recorded for {} {:?}",
                value.name, self.period, self.scenario
            )));
        }
        self.unavailable.remove(&value.name);
        self.values.insert(value.name.clone(), value);
        Ok(())
    }

    pub fn mark_unavailable(&mut self, name: &str, reason: &str) {
        if !self.values.contains_key(name) {
            self.unavailable.insert(name.to_string(), reason.to_string());
        }
    }

    pub fn get(&self, name: &str) -> Option<&DriverValue> {
        self.values.get(name)
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).map(|v| v.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn unavailable_reason(&self, name: &str) -> Option<&str> {
        self.unavailable.get(name).map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &DriverValue> {
        self.values.values()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.unavailable.is_empty()
    }

    /// Copy of this set with one figure replaced (used for shocked scenarios).
    pub fn with_replaced(&self, name: &str, value: f64, unit: Unit) -> Self {
        let mut next = self.clone();
        let recorded = next.record(name, value, unit);
        next.unavailable.remove(name);
        next.values.insert(name.to_string(), recorded);
        next
    }

    fn record(&self, name: &str, value: f64, unit: Unit) -> DriverValue {
        DriverValue {
            name: name.to_string(),
            value,
            unit,
            scenario: self.scenario,
            period: self.period.clone(),
        }
    }

    /// Build a set from rows shaped `{driver, value, unit?, available?}`.
    ///
    /// A null value or `available: false` marks the driver unavailable.
    pub fn from_rows(
        entity: &str,
        period: &str,
        scenario: Scenario,
        rows: &[Row],
    ) -> Result<Self> {
        let mut set = DriverSet::new(entity, period, scenario);

        for row in rows {
            let name = row
                .get("driver")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    AnalyticsError::InvalidInput(format!("driver row without 'driver': {:?}", row))
                })?;

            let available = row.get("available").and_then(Value::as_bool).unwrap_or(true);
            let value = row.get("value").and_then(Value::as_f64);

            match (available, value) {
                (true, Some(value)) => {
                    let unit = match row.get("unit").and_then(Value::as_str) {
                        Some(u) => u.parse()?,
                        None => crate::driver_tree::default_unit(name),
                    };
                    set.insert(set.record(name, value, unit))?;
                }
                _ => {
                    let reason = row
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("reported unavailable by source");
                    set.mark_unavailable(name, reason);
                }
            }
        }

        Ok(set)
    }

    pub fn to_rows(&self) -> Vec<Row> {
        let mut rows: Vec<Row> = self
            .values
            .values()
            .map(|v| {
                let mut row = Row::new();
                row.insert("driver".into(), json!(v.name));
                row.insert("value".into(), json!(v.value));
                row.insert("unit".into(), json!(v.unit));
                row
            })
            .collect();

        for (name, reason) in &self.unavailable {
            let mut row = Row::new();
            row.insert("driver".into(), json!(name));
            row.insert("value".into(), Value::Null);
            row.insert("available".into(), json!(false));
            row.insert("reason".into(), json!(reason));
            rows.push(row);
        }

        rows
    }
}

//
// ================= Query =================
//

/// Inclusive period window. Labels look like `FY2025` or `FY2025-Q2`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodRange {
    pub from: String,
    pub to: String,
}

impl PeriodRange {
    pub fn single(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            from: label.clone(),
            to: label,
        }
    }

    /// A sub-period (`FY2025-Q2`) is covered by its parent (`FY2025`).
    pub fn covers(&self, period: &str) -> bool {
        let within = self.from.as_str() <= period && period <= self.to.as_str();
        let child_of = |parent: &str| period.starts_with(parent) && period[parent.len()..].starts_with('-');
        within || child_of(&self.from) || child_of(&self.to)
    }
}

impl fmt::Display for PeriodRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{}..{}", self.from, self.to)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Subject {
    /// Driver-tree inputs, for one crop or the whole entity.
    Drivers { crop: Option<String> },
    /// Ledger lines for a reported financial metric.
    Ledger { metric: String },
}

/// Filter requirements handed to the data sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub entity: String,
    pub period: PeriodRange,
    pub scenario: Scenario,
    pub subject: Subject,
    /// Whether zero rows is a legitimate answer. Always stated by the caller.
    pub empty_is_valid: bool,
}

impl QuerySpec {
    pub fn new(
        entity: impl Into<String>,
        period: PeriodRange,
        scenario: Scenario,
        subject: Subject,
        empty_is_valid: bool,
    ) -> Self {
        Self {
            entity: entity.into(),
            period,
            scenario,
            subject,
            empty_is_valid,
        }
    }

    pub fn drivers(
        entity: impl Into<String>,
        period: impl Into<String>,
        scenario: Scenario,
        crop: Option<String>,
    ) -> Self {
        Self::new(
            entity,
            PeriodRange::single(period),
            scenario,
            Subject::Drivers { crop },
            false,
        )
    }

    pub fn ledger(
        entity: impl Into<String>,
        period: impl Into<String>,
        scenario: Scenario,
        metric: impl Into<String>,
    ) -> Self {
        Self::new(
            entity,
            PeriodRange::single(period),
            scenario,
            Subject::Ledger {
                metric: metric.into(),
            },
            true,
        )
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subject = match &self.subject {
            Subject::Drivers { crop: Some(crop) } => format!("drivers(crop={})", crop),
            Subject::Drivers { crop: None } => "drivers(all crops)".to_string(),
            Subject::Ledger { metric } => format!("ledger({})", metric),
        };
        write!(
            f,
            "[entity={} period={} scenario={:?} subject={} empty_is_valid={}]",
            self.entity, self.period, self.scenario, subject, self.empty_is_valid
        )
    }
}

//
// ================= Resolution =================
//

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Drivers(DriverSet),
    Rows(Vec<Row>),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Drivers(set) => set.is_empty(),
            Payload::Rows(rows) => rows.is_empty(),
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            Payload::Drivers(set) => set.len(),
            Payload::Rows(rows) => rows.len(),
        }
    }

    /// Interpret the payload as driver figures for the query's triple.
    pub fn driver_set(&self, query: &QuerySpec) -> Result<DriverSet> {
        match self {
            Payload::Drivers(set) => Ok(set.clone()),
            Payload::Rows(rows) => {
                DriverSet::from_rows(&query.entity, &query.period.from, query.scenario, rows)
            }
        }
    }

    pub fn rows(&self) -> Vec<Row> {
        match self {
            Payload::Drivers(set) => set.to_rows(),
            Payload::Rows(rows) => rows.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Live,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    SourceUnavailable,
    ScenarioNotPresent,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::SourceUnavailable => "source unavailable",
            FallbackReason::ScenarioNotPresent => "scenario not present in live source",
        }
    }
}

/// Exactly one of these comes back from every resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedResult {
    pub result_id: Uuid,
    pub query: QuerySpec,
    pub payload: Payload,
    pub source: Provenance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

impl ResolvedResult {
    pub fn live(query: QuerySpec, payload: Payload) -> Self {
        Self {
            result_id: Uuid::new_v4(),
            query,
            payload,
            source: Provenance::Live,
            reason: None,
            resolved_at: Utc::now(),
        }
    }

    pub fn fallback(query: QuerySpec, payload: Payload, reason: FallbackReason) -> Self {
        Self {
            result_id: Uuid::new_v4(),
            query,
            payload,
            source: Provenance::Fallback,
            reason: Some(reason.as_str().to_string()),
            resolved_at: Utc::now(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.source == Provenance::Fallback
    }

    /// SHA-256 of the serialized payload, hex encoded.
    pub fn payload_digest(&self) -> String {
        let mut hasher = Sha256::new();

        if serde_json::to_writer(&mut HashWriter(&mut hasher), &self.payload).is_err() {
            return String::new();
        }

        hex::encode(hasher.finalize())
    }
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scenario::Actual => "Actual",
            Scenario::Budget => "Budget",
            Scenario::Forecast => "Forecast",
        };
        write!(f, "{}", s)
    }
}
