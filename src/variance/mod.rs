//! Variance decomposition
//!
//! Splits `actual[metric] − baseline[metric]` into additive driver effects by
//! sequential substitution (area, yield, price, cost, FX, then flat
//! adjustments). The sum of the computed effects must reconcile with the total
//! after rounding, or the decomposition is refused.

use crate::driver_tree::{
    DriverTree, Operand, Operator, AREA, COST_OF_PRODUCTION, COST_PER_TON, FX_RATE, GROSS_MARGIN,
    PRICE, PRICE_CONSTANT_FX, REVENUE, VOLUME, YIELD,
};
use crate::error::AnalyticsError;
use crate::models::{DriverSet, Precision, Unit};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, warn};

pub const EXCLUDED_BY_REQUEST: &str = "excluded by request";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
    Area,
    Yield,
    Price,
    Cost,
    Fx,
    Adjustment,
}

impl EffectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectKind::Area => "area",
            EffectKind::Yield => "yield",
            EffectKind::Price => "price",
            EffectKind::Cost => "cost",
            EffectKind::Fx => "fx",
            EffectKind::Adjustment => "adjustment",
        }
    }
}

/// How currency movement is separated from price movement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FxConvention {
    /// Price effect on reporting-currency prices; no FX effect.
    ConvertedPrice,
    /// Price effect at baseline FX; FX effect from the restatement gap.
    ConstantCurrency,
    /// FX effect is whatever the other effects leave unexplained.
    Residual,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectAttribution {
    pub driver_name: String,
    pub kind: EffectKind,
    /// `None` when the effect could not be computed.
    pub amount: Option<f64>,
    pub unit: Unit,
    pub rank: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EffectAttribution {
    pub fn is_null(&self) -> bool {
        self.amount.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecomposeOptions {
    /// Forced convention; picked from the data when absent.
    pub convention: Option<FxConvention>,
    pub precision: Precision,
    /// Effect kinds (`"fx"`) or driver names (`"ga_expenses"`) to leave out.
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decomposition {
    pub metric: String,
    pub unit: Unit,
    pub actual_value: Option<f64>,
    pub baseline_value: Option<f64>,
    pub total_variance: Option<f64>,
    pub effects: Vec<EffectAttribution>,
    pub convention: FxConvention,
    /// Set when at least one effect is null.
    pub partial: bool,
    /// Variance not explained by the computed effects of a partial decomposition.
    pub unattributed: Option<f64>,
}

impl Decomposition {
    pub fn effect(&self, driver_name: &str) -> Option<&EffectAttribution> {
        self.effects.iter().find(|e| e.driver_name == driver_name)
    }

    pub fn effect_of(&self, kind: EffectKind) -> Option<&EffectAttribution> {
        self.effects.iter().find(|e| e.kind == kind)
    }

    pub fn attributed(&self) -> f64 {
        self.effects.iter().filter_map(|e| e.amount).sum()
    }

    pub fn null_effects(&self) -> impl Iterator<Item = &EffectAttribution> {
        self.effects.iter().filter(|e| e.is_null())
    }
}

//
// ================= Decomposition =================
//

/// Computed amount, or the reason it could not be computed.
type Attributed = std::result::Result<f64, String>;

struct RawEffect {
    driver_name: String,
    kind: EffectKind,
    order: usize,
    amount: Attributed,
}

enum Figure {
    Known(f64),
    Unavailable(String),
}

fn known(figures: &[&Figure]) -> std::result::Result<Vec<f64>, String> {
    figures
        .iter()
        .map(|f| match f {
            Figure::Known(v) => Ok(*v),
            Figure::Unavailable(reason) => Err(reason.clone()),
        })
        .collect()
}

/// Metrics decomposed directly by the area/yield/price/cost formulas.
fn is_chain_metric(metric: &str) -> bool {
    matches!(metric, VOLUME | REVENUE | COST_OF_PRODUCTION | GROSS_MARGIN)
}

pub fn decompose(
    tree: &DriverTree,
    metric: &str,
    actual: &DriverSet,
    baseline: &DriverSet,
    opts: &DecomposeOptions,
) -> Result<Decomposition> {
    if !tree.is_node(metric) {
        return Err(AnalyticsError::InvalidInput(format!(
            "'{}' is not a metric of the driver tree",
            metric
        )));
    }

    let unit = tree.unit_of(metric);
    let has_price = tree.leaves(metric).iter().any(|d| d == PRICE);

    let convention = opts.convention.unwrap_or(
        if has_price && actual.contains(PRICE_CONSTANT_FX) {
            FxConvention::ConstantCurrency
        } else {
            FxConvention::ConvertedPrice
        },
    );

    let actual_value = total_of(tree, metric, actual)?;
    let baseline_value = total_of(tree, metric, baseline)?;
    let total = match (actual_value, baseline_value) {
        (Some(a), Some(b)) => Some(a - b),
        _ => None,
    };

    let mut raws = Vec::new();
    let mut adjustment_slot = 0;
    collect(
        tree,
        metric,
        actual,
        baseline,
        convention,
        1.0,
        &mut raws,
        &mut adjustment_slot,
    )?;

    if convention == FxConvention::Residual {
        residual_fx(metric, unit, total, &mut raws, opts.precision)?;
    }

    for raw in raws.iter_mut() {
        let excluded = opts
            .exclude
            .iter()
            .any(|x| x == raw.kind.as_str() || *x == raw.driver_name);
        if excluded {
            raw.amount = Err(EXCLUDED_BY_REQUEST.to_string());
        }
    }

    let precision = opts.precision;
    let mut effects: Vec<(usize, EffectAttribution)> = raws
        .into_iter()
        .map(|raw| {
            let (amount, reason) = match raw.amount {
                Ok(v) => (Some(precision.round(v, unit)), None),
                Err(reason) => (None, Some(reason)),
            };
            (
                raw.order,
                EffectAttribution {
                    driver_name: raw.driver_name,
                    kind: raw.kind,
                    amount,
                    unit,
                    rank: 0,
                    reason,
                },
            )
        })
        .collect();

    effects.sort_by(|(oa, a), (ob, b)| match (a.amount, b.amount) {
        (Some(x), Some(y)) => y
            .abs()
            .partial_cmp(&x.abs())
            .unwrap_or(Ordering::Equal)
            .then(oa.cmp(ob)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => oa.cmp(ob),
    });

    let effects: Vec<EffectAttribution> = effects
        .into_iter()
        .enumerate()
        .map(|(i, (_, mut e))| {
            e.rank = i + 1;
            e
        })
        .collect();

    let partial = effects.iter().any(|e| e.is_null());
    let attributed: f64 = effects.iter().filter_map(|e| e.amount).sum();
    let rounded_total = total.map(|t| precision.round(t, unit));

    let unattributed = if partial {
        rounded_total.map(|t| precision.round(t - attributed, unit))
    } else {
        None
    };

    if !partial {
        if let Some(total) = rounded_total {
            let tolerance =
                effects.len().max(1) as f64 * precision.half_step(unit) + 1e-6 * total.abs();
            if (attributed - total).abs() > tolerance {
                warn!(
                    metric = %metric,
                    total = total,
                    attributed = attributed,
                    "Decomposition failed reconciliation"
                );
                return Err(AnalyticsError::Reconciliation {
                    metric: metric.to_string(),
                    total,
                    attributed,
                    tolerance,
                });
            }
        }
    }

    debug!(
        metric = %metric,
        convention = ?convention,
        effects = effects.len(),
        partial = partial,
        "Decomposed variance"
    );

    Ok(Decomposition {
        metric: metric.to_string(),
        unit,
        actual_value: actual_value.map(|v| precision.round(v, unit)),
        baseline_value: baseline_value.map(|v| precision.round(v, unit)),
        total_variance: rounded_total,
        effects,
        convention,
        partial,
        unattributed,
    })
}

/// Replace the restatement-gap FX effect with the unexplained remainder.
///
/// The chain must reconcile with the restatement gap in place first, so an
/// inconsistent total is refused instead of being absorbed as FX.
fn residual_fx(
    metric: &str,
    unit: Unit,
    total: Option<f64>,
    raws: &mut [RawEffect],
    precision: Precision,
) -> Result<()> {
    let Some(fx_index) = raws.iter().position(|r| r.kind == EffectKind::Fx) else {
        return Ok(());
    };

    let Some(total) = total else {
        raws[fx_index].amount = Err("total variance unknown; residual FX undefined".to_string());
        return Ok(());
    };
    if raws.iter().any(|r| r.amount.is_err()) {
        raws[fx_index].amount = Err("other effects are null; residual FX undefined".to_string());
        return Ok(());
    }

    let attributed: f64 = raws.iter().filter_map(|r| r.amount.as_ref().ok()).sum();
    let tolerance = raws.len() as f64 * precision.half_step(unit) + 1e-6 * total.abs();
    if (attributed - total).abs() > tolerance {
        warn!(
            metric = %metric,
            total = total,
            attributed = attributed,
            "Residual FX would absorb an unreconciled total"
        );
        return Err(AnalyticsError::Reconciliation {
            metric: metric.to_string(),
            total: precision.round(total, unit),
            attributed: precision.round(attributed, unit),
            tolerance,
        });
    }

    let others: f64 = raws
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != fx_index)
        .filter_map(|(_, r)| r.amount.as_ref().ok())
        .sum();
    raws[fx_index].amount = Ok(total - others);
    Ok(())
}

/// Metric value for one side, `None` when an unavailable driver blocks it.
fn total_of(tree: &DriverTree, metric: &str, set: &DriverSet) -> Result<Option<f64>> {
    match tree.evaluate(metric, set) {
        Ok(v) => Ok(Some(v)),
        Err(AnalyticsError::MissingDriver { driver, .. })
            if set.unavailable_reason(&driver).is_some() =>
        {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn figure(tree: &DriverTree, set: &DriverSet, name: &str, metric: &str) -> Result<Figure> {
    if let Some(v) = set.value(name) {
        return Ok(Figure::Known(v));
    }
    if let Some(reason) = set.unavailable_reason(name) {
        return Ok(Figure::Unavailable(format!(
            "{} unavailable for {} {}: {}",
            name, set.scenario, set.period, reason
        )));
    }
    if tree.is_node(name) {
        return match tree.evaluate(name, set) {
            Ok(v) => Ok(Figure::Known(v)),
            Err(AnalyticsError::MissingDriver { driver, .. }) if set.unavailable_reason(&driver).is_some() => {
                Ok(Figure::Unavailable(format!(
                    "{} unavailable for {} {}",
                    driver, set.scenario, set.period
                )))
            }
            Err(e) => Err(e),
        };
    }
    Err(AnalyticsError::missing_driver(
        name,
        format!(
            "{} decomposition ({} {})",
            metric, set.scenario, set.period
        ),
    ))
}

#[allow(clippy::too_many_arguments)]
fn collect(
    tree: &DriverTree,
    metric: &str,
    actual: &DriverSet,
    baseline: &DriverSet,
    convention: FxConvention,
    sign: f64,
    raws: &mut Vec<RawEffect>,
    adjustment_slot: &mut usize,
) -> Result<()> {
    if is_chain_metric(metric) {
        for mut raw in chain_effects(tree, metric, actual, baseline, convention)? {
            raw.amount = raw.amount.map(|v| sign * v);
            raws.push(raw);
        }
        return Ok(());
    }

    let node = tree
        .node(metric)
        .ok_or_else(|| AnalyticsError::InvalidInput(format!("unknown metric '{}'", metric)))?;

    if !matches!(node.operator, Operator::Add | Operator::Subtract) {
        return Err(AnalyticsError::InvalidModel(format!(
            "'{}' is not additive and has no decomposition rule",
            metric
        )));
    }

    for (i, operand) in node.operands.iter().enumerate() {
        let s = if i == 0 || node.operator == Operator::Add {
            sign
        } else {
            -sign
        };

        match operand {
            Operand::Node(id) => {
                let child = tree.node_by_id(*id).name.clone();
                collect(
                    tree,
                    &child,
                    actual,
                    baseline,
                    convention,
                    s,
                    raws,
                    adjustment_slot,
                )?;
            }
            Operand::Driver(driver) => {
                let a = figure(tree, actual, driver, metric)?;
                let b = figure(tree, baseline, driver, metric)?;
                let amount = known(&[&a, &b]).map(|v| s * (v[0] - v[1]));
                raws.push(RawEffect {
                    driver_name: driver.clone(),
                    kind: EffectKind::Adjustment,
                    order: 5 + *adjustment_slot,
                    amount,
                });
                *adjustment_slot += 1;
            }
        }
    }

    Ok(())
}

fn chain_effects(
    tree: &DriverTree,
    metric: &str,
    actual: &DriverSet,
    baseline: &DriverSet,
    convention: FxConvention,
) -> Result<Vec<RawEffect>> {
    let with_price = matches!(metric, REVENUE | GROSS_MARGIN);
    let with_cost = matches!(metric, COST_OF_PRODUCTION | GROSS_MARGIN);

    let aa = figure(tree, actual, AREA, metric)?;
    let ab = figure(tree, baseline, AREA, metric)?;
    let ya = figure(tree, actual, YIELD, metric)?;
    let yb = figure(tree, baseline, YIELD, metric)?;

    let pb = if with_price {
        Some(figure(tree, baseline, PRICE, metric)?)
    } else {
        None
    };
    let cb = if with_cost {
        Some(figure(tree, baseline, COST_PER_TON, metric)?)
    } else {
        None
    };

    // Baseline value of one tonne in the metric's terms.
    let unit_value: Attributed = match (&pb, &cb) {
        (Some(p), Some(c)) => known(&[p, c]).map(|v| v[0] - v[1]),
        (Some(p), None) => known(&[p]).map(|v| v[0]),
        (None, Some(c)) => known(&[c]).map(|v| v[0]),
        (None, None) => Ok(1.0),
    };

    let mut out = Vec::with_capacity(5);

    let area = known(&[&aa, &ab, &yb])
        .and_then(|v| unit_value.clone().map(|ub| (v[0] - v[1]) * v[2] * ub));
    out.push(RawEffect {
        driver_name: AREA.to_string(),
        kind: EffectKind::Area,
        order: 0,
        amount: area,
    });

    let yld = known(&[&aa, &ya, &yb]).and_then(|v| {
        if v[2] == 0.0 {
            Err("baseline yield is zero; yield effect undefined".to_string())
        } else {
            unit_value.clone().map(|ub| v[0] * (v[1] - v[2]) * ub)
        }
    });
    out.push(RawEffect {
        driver_name: YIELD.to_string(),
        kind: EffectKind::Yield,
        order: 1,
        amount: yld,
    });

    if !with_price && !with_cost {
        return Ok(out);
    }

    let va = figure(tree, actual, VOLUME, metric)?;

    if let Some(pb) = &pb {
        let pa = figure(tree, actual, PRICE, metric)?;

        if matches!(convention, FxConvention::ConstantCurrency | FxConvention::Residual) {
            let pcfx = figure(tree, actual, PRICE_CONSTANT_FX, metric)?;
            out.push(RawEffect {
                driver_name: PRICE.to_string(),
                kind: EffectKind::Price,
                order: 2,
                amount: known(&[&va, &pcfx, pb]).map(|v| v[0] * (v[1] - v[2])),
            });
            out.push(RawEffect {
                driver_name: FX_RATE.to_string(),
                kind: EffectKind::Fx,
                order: 4,
                amount: known(&[&va, &pa, &pcfx]).map(|v| v[0] * (v[1] - v[2])),
            });
        } else {
            out.push(RawEffect {
                driver_name: PRICE.to_string(),
                kind: EffectKind::Price,
                order: 2,
                amount: known(&[&va, &pa, pb]).map(|v| v[0] * (v[1] - v[2])),
            });
        }
    }

    if let Some(cb) = &cb {
        let ca = figure(tree, actual, COST_PER_TON, metric)?;
        // Higher unit cost lowers margin but raises cost of production.
        let direction = if metric == GROSS_MARGIN { -1.0 } else { 1.0 };
        out.push(RawEffect {
            driver_name: COST_PER_TON.to_string(),
            kind: EffectKind::Cost,
            order: 3,
            amount: known(&[&va, &ca, cb]).map(|v| direction * v[0] * (v[1] - v[2])),
        });
    }

    Ok(out)
}
