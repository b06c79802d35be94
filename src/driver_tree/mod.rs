//! Driver-tree model
//!
//! Static formula graph behind every figure the engine explains:
//!
//! ```text
//! Volume            = Area × Yield
//! Revenue           = Volume × Price
//! CostOfProduction  = Volume × CostPerTon
//! GrossMargin       = Revenue − CostOfProduction
//! EBITDA            = GrossMargin − G&A            (extended tree)
//! NetIncome         = EBITDA − FinanceCosts        (extended tree)
//! ```
//!
//! The graph is built once, checked for cycles, and then only read. Shared
//! sub-expressions (Volume feeds both Revenue and Cost) are referenced by
//! `NodeId`, never duplicated.

use crate::error::AnalyticsError;
use crate::models::{DriverSet, Unit};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const AREA: &str = "area";
pub const YIELD: &str = "yield";
pub const VOLUME: &str = "volume";
pub const PRICE: &str = "price";
pub const PRICE_CONSTANT_FX: &str = "price_constant_fx";
pub const COST_PER_TON: &str = "cost_per_ton";
pub const FX_RATE: &str = "fx_rate";
pub const REVENUE: &str = "revenue";
pub const COST_OF_PRODUCTION: &str = "cost_of_production";
pub const GROSS_MARGIN: &str = "gross_margin";
pub const GA_EXPENSES: &str = "ga_expenses";
pub const FINANCE_COSTS: &str = "finance_costs";
pub const EBITDA: &str = "ebitda";
pub const NET_INCOME: &str = "net_income";

/// Unit a driver is recorded in when the source does not say.
pub fn default_unit(name: &str) -> Unit {
    match name {
        AREA => Unit::Hectares,
        YIELD => Unit::TonnesPerHectare,
        VOLUME => Unit::Tonnes,
        PRICE | PRICE_CONSTANT_FX | COST_PER_TON => Unit::UsdPerTonne,
        FX_RATE => Unit::Rate,
        _ => Unit::Usd,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    /// Market-given: prices, FX, input costs.
    External,
    /// Chosen by management: area planted, yield programme, overheads.
    Decision,
    Intermediate,
    Output,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Multiply,
    Divide,
    Subtract,
    Add,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(usize);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Node(NodeId),
    Driver(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormulaNode {
    pub name: String,
    pub operator: Operator,
    pub operands: Vec<Operand>,
    pub unit: Unit,
}

#[derive(Debug, Clone)]
struct PendingNode {
    name: String,
    operator: Operator,
    operands: Vec<String>,
    unit: Unit,
}

/// Collects node definitions; `build` resolves names and rejects cycles.
#[derive(Debug, Clone, Default)]
pub struct DriverTreeBuilder {
    pending: Vec<PendingNode>,
    kinds: HashMap<String, VariableKind>,
}

impl DriverTreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Area → Yield → Volume → {Price, Cost} → {Revenue, CostOfProduction} → GrossMargin
    pub fn standard() -> Self {
        Self::new()
            .driver(AREA, VariableKind::Decision)
            .driver(YIELD, VariableKind::Decision)
            .driver(PRICE, VariableKind::External)
            .driver(PRICE_CONSTANT_FX, VariableKind::External)
            .driver(COST_PER_TON, VariableKind::External)
            .driver(FX_RATE, VariableKind::External)
            .node(VOLUME, Operator::Multiply, &[AREA, YIELD], Unit::Tonnes)
            .node(REVENUE, Operator::Multiply, &[VOLUME, PRICE], Unit::Usd)
            .node(COST_OF_PRODUCTION, Operator::Multiply, &[VOLUME, COST_PER_TON], Unit::Usd)
            .node(GROSS_MARGIN, Operator::Subtract, &[REVENUE, COST_OF_PRODUCTION], Unit::Usd)
            .output(GROSS_MARGIN)
    }

    /// Standard tree plus EBITDA and NetIncome from flat adjustment drivers.
    pub fn extended() -> Self {
        Self::standard()
            .driver(GA_EXPENSES, VariableKind::Decision)
            .driver(FINANCE_COSTS, VariableKind::Decision)
            .node(EBITDA, Operator::Subtract, &[GROSS_MARGIN, GA_EXPENSES], Unit::Usd)
            .node(NET_INCOME, Operator::Subtract, &[EBITDA, FINANCE_COSTS], Unit::Usd)
            .output(EBITDA)
            .output(NET_INCOME)
    }

    pub fn node(mut self, name: &str, operator: Operator, operands: &[&str], unit: Unit) -> Self {
        self.pending.push(PendingNode {
            name: name.to_string(),
            operator,
            operands: operands.iter().map(|s| s.to_string()).collect(),
            unit,
        });
        self
    }

    pub fn driver(mut self, name: &str, kind: VariableKind) -> Self {
        self.kinds.insert(name.to_string(), kind);
        self
    }

    pub fn output(mut self, name: &str) -> Self {
        self.kinds.insert(name.to_string(), VariableKind::Output);
        self
    }

    pub fn build(self) -> Result<DriverTree> {
        let mut index = HashMap::with_capacity(self.pending.len());

        for (i, node) in self.pending.iter().enumerate() {
            if node.operands.is_empty() {
                return Err(AnalyticsError::InvalidModel(format!(
                    "node '{}' has no operands",
                    node.name
                )));
            }
            if index.insert(node.name.clone(), NodeId(i)).is_some() {
                return Err(AnalyticsError::InvalidModel(format!(
                    "node '{}' defined twice",
                    node.name
                )));
            }
        }

        let nodes: Vec<FormulaNode> = self
            .pending
            .into_iter()
            .map(|node| FormulaNode {
                operands: node
                    .operands
                    .into_iter()
                    .map(|name| match index.get(&name) {
                        Some(id) => Operand::Node(*id),
                        None => Operand::Driver(name),
                    })
                    .collect(),
                name: node.name,
                operator: node.operator,
                unit: node.unit,
            })
            .collect();

        let mut kinds = self.kinds;
        for node in &nodes {
            kinds
                .entry(node.name.clone())
                .or_insert(VariableKind::Intermediate);
            for operand in &node.operands {
                if let Operand::Driver(name) = operand {
                    kinds.entry(name.clone()).or_insert(VariableKind::External);
                }
            }
        }

        let tree = DriverTree { nodes, index, kinds };
        tree.check_acyclic()?;
        Ok(tree)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Immutable, acyclic formula graph.
#[derive(Debug, Clone)]
pub struct DriverTree {
    nodes: Vec<FormulaNode>,
    index: HashMap<String, NodeId>,
    kinds: HashMap<String, VariableKind>,
}

impl DriverTree {
    pub fn standard() -> Result<Self> {
        DriverTreeBuilder::standard().build()
    }

    pub fn extended() -> Result<Self> {
        DriverTreeBuilder::extended().build()
    }

    fn check_acyclic(&self) -> Result<()> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        for start in 0..self.nodes.len() {
            self.visit(NodeId(start), &mut marks)?;
        }
        Ok(())
    }

    fn visit(&self, id: NodeId, marks: &mut [Mark]) -> Result<()> {
        match marks[id.0] {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                return Err(AnalyticsError::Cycle {
                    node: self.nodes[id.0].name.clone(),
                })
            }
            Mark::Unvisited => {}
        }

        marks[id.0] = Mark::InProgress;
        for operand in &self.nodes[id.0].operands {
            if let Operand::Node(child) = operand {
                self.visit(*child, marks)?;
            }
        }
        marks[id.0] = Mark::Done;
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&FormulaNode> {
        self.index.get(name).map(|id| &self.nodes[id.0])
    }

    pub fn node_by_id(&self, id: NodeId) -> &FormulaNode {
        &self.nodes[id.0]
    }

    pub fn is_node(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FormulaNode> {
        self.nodes.iter()
    }

    pub fn kind(&self, name: &str) -> Option<VariableKind> {
        self.kinds.get(name).copied()
    }

    pub fn unit_of(&self, name: &str) -> Unit {
        self.node(name)
            .map(|n| n.unit)
            .unwrap_or_else(|| default_unit(name))
    }

    /// Leaf drivers the named node ultimately reads, first-use order.
    pub fn leaves(&self, name: &str) -> Vec<String> {
        let mut out = Vec::new();
        match self.index.get(name) {
            Some(id) => self.collect_leaves(*id, &mut out),
            None => out.push(name.to_string()),
        }
        out
    }

    fn collect_leaves(&self, id: NodeId, out: &mut Vec<String>) {
        for operand in &self.nodes[id.0].operands {
            match operand {
                Operand::Node(child) => self.collect_leaves(*child, out),
                Operand::Driver(name) => {
                    if !out.contains(name) {
                        out.push(name.clone());
                    }
                }
            }
        }
    }

    /// Evaluate a node (or read a driver) against a set.
    pub fn evaluate(&self, name: &str, set: &DriverSet) -> Result<f64> {
        self.evaluate_with_overrides(name, set, &HashMap::new())
    }

    /// Evaluate with some node or driver values replaced.
    ///
    /// Precedence: override, then a value pinned in the set under the node's
    /// name, then the formula.
    pub fn evaluate_with_overrides(
        &self,
        name: &str,
        set: &DriverSet,
        overrides: &HashMap<String, f64>,
    ) -> Result<f64> {
        match self.index.get(name) {
            Some(id) => self.eval_node(*id, set, overrides),
            None => read_driver(name, set, overrides, "direct lookup"),
        }
    }

    fn eval_node(
        &self,
        id: NodeId,
        set: &DriverSet,
        overrides: &HashMap<String, f64>,
    ) -> Result<f64> {
        let node = &self.nodes[id.0];

        if let Some(v) = overrides.get(&node.name) {
            return Ok(*v);
        }
        if let Some(v) = set.value(&node.name) {
            return Ok(v);
        }

        self.apply(id, set, overrides)
    }

    /// Compute a node from its operands, skipping any pin or override on the
    /// node itself. Pins below it still apply.
    pub fn evaluate_formula(
        &self,
        name: &str,
        set: &DriverSet,
        overrides: &HashMap<String, f64>,
    ) -> Result<f64> {
        match self.index.get(name) {
            Some(id) => self.apply(*id, set, overrides),
            None => read_driver(name, set, overrides, "direct lookup"),
        }
    }

    /// Whether `target` (a driver or node) feeds `name`.
    pub fn depends_on(&self, name: &str, target: &str) -> bool {
        let Some(id) = self.index.get(name) else {
            return false;
        };
        self.nodes[id.0].operands.iter().any(|operand| match operand {
            Operand::Driver(driver) => driver == target,
            Operand::Node(child) => {
                let child = &self.nodes[child.0].name;
                child == target || self.depends_on(child, target)
            }
        })
    }

    /// Nodes under `name`, children before parents, ending with `name`.
    pub fn nodes_post_order(&self, name: &str) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(id) = self.index.get(name) {
            self.post_order(*id, &mut out);
        }
        out
    }

    fn post_order(&self, id: NodeId, out: &mut Vec<String>) {
        for operand in &self.nodes[id.0].operands {
            if let Operand::Node(child) = operand {
                self.post_order(*child, out);
            }
        }
        let name = &self.nodes[id.0].name;
        if !out.contains(name) {
            out.push(name.clone());
        }
    }

    fn apply(
        &self,
        id: NodeId,
        set: &DriverSet,
        overrides: &HashMap<String, f64>,
    ) -> Result<f64> {
        let node = &self.nodes[id.0];

        let mut values = Vec::with_capacity(node.operands.len());
        for operand in &node.operands {
            let v = match operand {
                Operand::Node(child) => self.eval_node(*child, set, overrides)?,
                Operand::Driver(driver) => {
                    read_driver(driver, set, overrides, &format!("node '{}'", node.name))?
                }
            };
            values.push(v);
        }

        let result = match node.operator {
            Operator::Multiply => values.iter().product(),
            Operator::Add => values.iter().sum(),
            Operator::Subtract => values[0] - values[1..].iter().sum::<f64>(),
            Operator::Divide => {
                let mut acc = values[0];
                for divisor in &values[1..] {
                    if *divisor == 0.0 {
                        return Err(AnalyticsError::UndefinedValue(format!(
                            "node '{}' divides by zero",
                            node.name
                        )));
                    }
                    acc /= divisor;
                }
                acc
            }
        };

        if !result.is_finite() {
            return Err(AnalyticsError::UndefinedValue(format!(
                "node '{}' evaluated to {}",
                node.name, result
            )));
        }

        Ok(result)
    }
}

fn read_driver(
    name: &str,
    set: &DriverSet,
    overrides: &HashMap<String, f64>,
    context: &str,
) -> Result<f64> {
    if let Some(v) = overrides.get(name) {
        return Ok(*v);
    }
    if let Some(v) = set.value(name) {
        return Ok(v);
    }
    let context = match set.unavailable_reason(name) {
        Some(reason) => format!("{} (marked unavailable: {})", context, reason),
        None => context.to_string(),
    };
    Err(AnalyticsError::missing_driver(name, context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Scenario;

    fn crop_set(area: f64, yld: f64, price: f64, cost: f64) -> DriverSet {
        DriverSet::new("E250", "FY2025", Scenario::Actual)
            .with(AREA, area, Unit::Hectares)
            .with(YIELD, yld, Unit::TonnesPerHectare)
            .with(PRICE, price, Unit::UsdPerTonne)
            .with(COST_PER_TON, cost, Unit::UsdPerTonne)
    }

    #[test]
    fn test_gross_margin_equals_revenue_minus_cost() {
        let tree = DriverTree::standard().unwrap();

        let cases = [
            crop_set(39_573.0, 6.78, 249.85, 115.0),
            crop_set(31_500.0, 3.22, 567.60, 270.0),
            crop_set(0.0, 5.0, 300.0, 120.0),
            crop_set(1_000.0, 2.5, 100.0, 180.0),
        ];

        for set in &cases {
            let gm = tree.evaluate(GROSS_MARGIN, set).unwrap();
            let rev = tree.evaluate(REVENUE, set).unwrap();
            let cost = tree.evaluate(COST_OF_PRODUCTION, set).unwrap();
            assert!((gm - (rev - cost)).abs() <= 1e-6 * rev.abs().max(1.0));
        }
    }

    #[test]
    fn test_missing_leaf_is_named() {
        let tree = DriverTree::standard().unwrap();
        let set = DriverSet::new("E250", "FY2025", Scenario::Actual)
            .with(AREA, 10.0, Unit::Hectares)
            .with(YIELD, 2.0, Unit::TonnesPerHectare);

        match tree.evaluate(REVENUE, &set) {
            Err(AnalyticsError::MissingDriver { driver, .. }) => assert_eq!(driver, PRICE),
            other => panic!("expected missing driver, got {:?}", other),
        }
    }

    #[test]
    fn test_unavailable_driver_reports_reason() {
        let tree = DriverTree::standard().unwrap();
        let set = DriverSet::new("E250", "FY2025", Scenario::Actual)
            .with(AREA, 10.0, Unit::Hectares)
            .with_unavailable(YIELD, "harvest not closed");

        let err = tree.evaluate(VOLUME, &set).unwrap_err();
        assert!(err.to_string().contains("harvest not closed"));
    }

    #[test]
    fn test_cycle_rejected_at_construction() {
        let result = DriverTreeBuilder::new()
            .node("a", Operator::Add, &["b", "x"], Unit::Usd)
            .node("b", Operator::Add, &["c"], Unit::Usd)
            .node("c", Operator::Multiply, &["a", "y"], Unit::Usd)
            .build();

        assert!(matches!(result, Err(AnalyticsError::Cycle { .. })));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let result = DriverTreeBuilder::new()
            .node("a", Operator::Add, &["a"], Unit::Usd)
            .build();
        assert!(matches!(result, Err(AnalyticsError::Cycle { node }) if node == "a"));
    }

    #[test]
    fn test_duplicate_and_empty_nodes_rejected() {
        let dup = DriverTreeBuilder::standard()
            .node(VOLUME, Operator::Multiply, &[AREA, YIELD], Unit::Tonnes)
            .build();
        assert!(matches!(dup, Err(AnalyticsError::InvalidModel(_))));

        let empty = DriverTreeBuilder::new()
            .node("x", Operator::Add, &[], Unit::Usd)
            .build();
        assert!(matches!(empty, Err(AnalyticsError::InvalidModel(_))));
    }

    #[test]
    fn test_extended_tree_composes_on_gross_margin() {
        let tree = DriverTree::extended().unwrap();
        let set = crop_set(100.0, 5.0, 200.0, 120.0)
            .with(GA_EXPENSES, 10_000.0, Unit::Usd)
            .with(FINANCE_COSTS, 2_500.0, Unit::Usd);

        let gm = tree.evaluate(GROSS_MARGIN, &set).unwrap();
        assert_eq!(gm, 40_000.0);
        assert_eq!(tree.evaluate(EBITDA, &set).unwrap(), 30_000.0);
        assert_eq!(tree.evaluate(NET_INCOME, &set).unwrap(), 27_500.0);
        assert_eq!(tree.kind(NET_INCOME), Some(VariableKind::Output));
        assert_eq!(tree.kind(VOLUME), Some(VariableKind::Intermediate));
        assert_eq!(tree.kind(PRICE), Some(VariableKind::External));
        assert_eq!(tree.kind(AREA), Some(VariableKind::Decision));
    }

    #[test]
    fn test_pinned_node_short_circuits_formula() {
        let tree = DriverTree::standard().unwrap();
        let set = DriverSet::new("E250", "FY2025", Scenario::Forecast)
            .with(VOLUME, 660_983.0, Unit::Tonnes)
            .with(PRICE, 249.85, Unit::UsdPerTonne);

        let revenue = tree.evaluate(REVENUE, &set).unwrap();
        assert!((revenue - 660_983.0 * 249.85).abs() < 1e-3);
    }

    #[test]
    fn test_formula_ignores_own_pin() {
        let tree = DriverTree::standard().unwrap();
        let set = crop_set(100.0, 5.0, 300.0, 100.0).with(VOLUME, 520.0, Unit::Tonnes);

        assert_eq!(tree.evaluate(VOLUME, &set).unwrap(), 520.0);
        assert_eq!(tree.evaluate_formula(VOLUME, &set, &HashMap::new()).unwrap(), 500.0);
        // The pin on volume still feeds revenue's formula.
        assert_eq!(tree.evaluate_formula(REVENUE, &set, &HashMap::new()).unwrap(), 156_000.0);

        assert!(tree.depends_on(REVENUE, AREA));
        assert!(tree.depends_on(GROSS_MARGIN, VOLUME));
        assert!(!tree.depends_on(VOLUME, PRICE));
        assert_eq!(
            tree.nodes_post_order(REVENUE),
            vec![VOLUME.to_string(), REVENUE.to_string()]
        );
    }

    #[test]
    fn test_divide_by_zero_is_undefined() {
        let tree = DriverTreeBuilder::new()
            .node("gm_per_ha", Operator::Divide, &["gm", AREA], Unit::UsdPerHectare)
            .build()
            .unwrap();
        let set = DriverSet::new("E250", "FY2025", Scenario::Actual)
            .with("gm", 10.0, Unit::Usd)
            .with(AREA, 0.0, Unit::Hectares);

        assert!(matches!(
            tree.evaluate("gm_per_ha", &set),
            Err(AnalyticsError::UndefinedValue(_))
        ));
    }

    #[test]
    fn test_leaves_of_gross_margin() {
        let tree = DriverTree::standard().unwrap();
        assert_eq!(
            tree.leaves(GROSS_MARGIN),
            vec![AREA, YIELD, PRICE, COST_PER_TON]
        );
    }
}
