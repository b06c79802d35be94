//! Sensitivity engine
//!
//! What-if simulation over the driver tree. Shocks are applied to a copy of
//! the base set and the metric is evaluated once, so results never depend on
//! the order shocks were declared in.

use crate::driver_tree::DriverTree;
use crate::error::AnalyticsError;
use crate::models::DriverSet;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeltaType {
    Absolute,
    /// Magnitude in percent: `-15.0` is a 15% drop.
    Percent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioShock {
    pub driver_name: String,
    pub delta_type: DeltaType,
    pub magnitude: f64,
}

impl ScenarioShock {
    pub fn percent(driver_name: &str, magnitude: f64) -> Self {
        Self {
            driver_name: driver_name.to_string(),
            delta_type: DeltaType::Percent,
            magnitude,
        }
    }

    pub fn absolute(driver_name: &str, magnitude: f64) -> Self {
        Self {
            driver_name: driver_name.to_string(),
            delta_type: DeltaType::Absolute,
            magnitude,
        }
    }
}

/// One shocked input, before and after.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverChange {
    pub name: String,
    pub from: f64,
    pub to: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensitivityResult {
    pub metric: String,
    pub base_value: f64,
    pub shocked_value: f64,
    pub delta: f64,
    /// Absent when the base value is zero.
    pub delta_pct: Option<f64>,
    pub changes: Vec<DriverChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioRange {
    pub downside: SensitivityResult,
    pub base: SensitivityResult,
    pub upside: SensitivityResult,
}

/// Apply all shocks and re-evaluate `metric`.
///
/// Shocks on the same target combine as `base × Π(1 + pᵢ) + Σ aⱼ`. A shock on
/// an intermediate node overrides that node with a value derived from the
/// unshocked base.
pub fn simulate(
    tree: &DriverTree,
    base: &DriverSet,
    shocks: &[ScenarioShock],
    metric: &str,
) -> Result<SensitivityResult> {
    let base_value = tree.evaluate(metric, base)?;

    let mut grouped: BTreeMap<&str, (Vec<f64>, Vec<f64>)> = BTreeMap::new();
    for shock in shocks {
        if !shock.magnitude.is_finite() {
            return Err(AnalyticsError::InvalidInput(format!(
                "shock on '{}' has non-finite magnitude",
                shock.driver_name
            )));
        }
        let entry = grouped.entry(shock.driver_name.as_str()).or_default();
        match shock.delta_type {
            DeltaType::Percent => entry.0.push(shock.magnitude),
            DeltaType::Absolute => entry.1.push(shock.magnitude),
        }
    }

    let mut shocked = base.clone();
    let mut overrides = HashMap::new();
    let mut changes = Vec::with_capacity(grouped.len());

    for (target, (mut percents, mut absolutes)) in grouped {
        // Sorted so floating-point folding is identical for any declared order.
        percents.sort_by(f64::total_cmp);
        absolutes.sort_by(f64::total_cmp);
        let factor: f64 = percents.iter().map(|p| 1.0 + p / 100.0).product();
        let addend: f64 = absolutes.iter().sum();

        let from = if tree.is_node(target) {
            tree.evaluate(target, base)?
        } else {
            base.value(target).ok_or_else(|| {
                AnalyticsError::missing_driver(target, format!("shock on {}", metric))
            })?
        };
        let to = from * factor + addend;

        if tree.is_node(target) {
            overrides.insert(target.to_string(), to);
        } else {
            let unit = base
                .get(target)
                .map(|v| v.unit)
                .unwrap_or_else(|| tree.unit_of(target));
            shocked = shocked.with_replaced(target, to, unit);
        }

        changes.push(DriverChange {
            name: target.to_string(),
            from,
            to,
        });
    }

    let targets: Vec<String> = changes.iter().map(|c| c.name.clone()).collect();
    carry_through_pins(tree, base, &shocked, &targets, metric, &mut overrides)?;

    let shocked_value = tree.evaluate_with_overrides(metric, &shocked, &overrides)?;
    let delta = shocked_value - base_value;
    let delta_pct = if base_value == 0.0 {
        None
    } else {
        Some(delta / base_value.abs() * 100.0)
    };

    debug!(
        metric = %metric,
        shocks = shocks.len(),
        base = base_value,
        shocked = shocked_value,
        "Simulated shocks"
    );

    Ok(SensitivityResult {
        metric: metric.to_string(),
        base_value,
        shocked_value,
        delta,
        delta_pct,
        changes,
    })
}

/// Move reported (pinned) node values with the shocks beneath them.
///
/// A pinned figure would otherwise hide any shock on its inputs. Each affected
/// pin is scaled by how much its own formula moved, children first so nested
/// pins see the adjusted values below them.
fn carry_through_pins(
    tree: &DriverTree,
    base: &DriverSet,
    shocked: &DriverSet,
    targets: &[String],
    metric: &str,
    overrides: &mut HashMap<String, f64>,
) -> Result<()> {
    let no_overrides = HashMap::new();

    for node in tree.nodes_post_order(metric) {
        if overrides.contains_key(&node) {
            continue;
        }
        let Some(pinned) = base.value(&node) else {
            continue;
        };
        if !targets.iter().any(|t| tree.depends_on(&node, t)) {
            continue;
        }

        let before = tree.evaluate_formula(&node, base, &no_overrides)?;
        let after = tree.evaluate_formula(&node, shocked, overrides)?;
        let value = if before == 0.0 {
            pinned + (after - before)
        } else {
            pinned * after / before
        };

        debug!(node = %node, pinned = pinned, value = value, "Pinned figure moved with its inputs");
        overrides.insert(node, value);
    }

    Ok(())
}

/// Evaluate downside, central and upside shock sets against the same base.
pub fn simulate_range(
    tree: &DriverTree,
    base: &DriverSet,
    downside: &[ScenarioShock],
    central: &[ScenarioShock],
    upside: &[ScenarioShock],
    metric: &str,
) -> Result<ScenarioRange> {
    Ok(ScenarioRange {
        downside: simulate(tree, base, downside, metric)?,
        base: simulate(tree, base, central, metric)?,
        upside: simulate(tree, base, upside, metric)?,
    })
}

/// Single-factor impact of a `pct` move in each driver, largest first.
pub fn sensitivity_table(
    tree: &DriverTree,
    base: &DriverSet,
    drivers: &[&str],
    pct: f64,
    metric: &str,
) -> Result<Vec<SensitivityResult>> {
    let mut rows = drivers
        .iter()
        .map(|d| simulate(tree, base, &[ScenarioShock::percent(d, pct)], metric))
        .collect::<Result<Vec<_>>>()?;

    // Stable: equal impacts keep the caller's driver order.
    rows.sort_by(|a, b| {
        b.delta
            .abs()
            .partial_cmp(&a.delta.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    Ok(rows)
}
