//! Analytics engine - answers one question end to end
//!
//! CLASSIFY → INTERPRET → RESOLVE → ANALYZE → RECORD

use crate::classifier::{
    Classification, ClassificationMethod, ClassifierPolicy, Intent, IntentClassifier, IntentOracle,
};
use crate::config::EngineConfig;
use crate::driver_tree::{
    DriverTree, AREA, EBITDA, GA_EXPENSES, GROSS_MARGIN, NET_INCOME, REVENUE,
};
use crate::error::AnalyticsError;
use crate::gemini::GeminiIntentOracle;
use crate::interpret::{interpret, QueryFrame};
use crate::knowledge;
use crate::memory::{ContextManager, ConversationStore, ConversationTurn};
use crate::models::{DriverSet, Provenance, QuerySpec, ResolvedResult, Row, Scenario, Unit};
use crate::resolver::{
    DataSourceResolver, DisconnectedSource, FallbackDataset, FallbackSource, HttpWarehouseSource,
    LiveSource, ResolverPolicy,
};
use crate::sensitivity::{self, ScenarioRange, ScenarioShock, SensitivityResult};
use crate::variance::{self, DecomposeOptions, Decomposition};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Step used for the sensitivity table and lever ranking, in percent.
const SENSITIVITY_STEP_PCT: f64 = 10.0;

// ================= Response =================

/// What the caller sees of one resolved query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    pub result_id: Uuid,
    pub query: String,
    pub source: Provenance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub rows: usize,
    pub digest: String,
}

impl From<&ResolvedResult> for ResultSummary {
    fn from(result: &ResolvedResult) -> Self {
        Self {
            result_id: result.result_id,
            query: result.query.to_string(),
            source: result.source,
            reason: result.reason.clone(),
            rows: result.payload.row_count(),
            digest: result.payload_digest(),
        }
    }
}

impl ResultSummary {
    pub fn provenance_note(&self) -> String {
        match (self.source, &self.reason) {
            (Provenance::Live, _) => format!("{} answered by the live source", self.query),
            (Provenance::Fallback, Some(reason)) => {
                format!("{} answered from the fallback dataset ({})", self.query, reason)
            }
            (Provenance::Fallback, None) => {
                format!("{} answered from the fallback dataset", self.query)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportedFigure {
    pub scenario: Scenario,
    pub period: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop: Option<String>,
    /// `None` when an unavailable driver blocks the value; see `note`.
    pub value: Option<f64>,
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basis: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Reported headline of one scenario against another, straight from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerComparison {
    pub metric: String,
    pub period: String,
    pub scenario: Scenario,
    pub baseline: Scenario,
    pub value: f64,
    pub baseline_value: f64,
    pub variance: f64,
    /// Absent when the baseline is zero.
    pub variance_pct: Option<f64>,
    pub currency: String,
    /// Variance restated in USD, to sit beside the driver breakdown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variance_usd: Option<f64>,
    /// EBITDA over revenue for each side, EBITDA only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub margin_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_margin_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CropRanking {
    pub crop: String,
    pub gross_margin: f64,
    pub gm_per_ha: f64,
    /// Gross margin over revenue; absent without revenue.
    pub gm_percent: Option<f64>,
    pub below_target: bool,
    pub below_gm_percent_target: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Unrankable {
    pub crop: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LeverDirection {
    Increase,
    Decrease,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lever {
    pub driver: String,
    pub direction: LeverDirection,
    /// Gross-margin gain from moving the driver by the step in `direction`.
    pub impact: f64,
    pub rank: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverRange {
    pub driver: String,
    pub range: ScenarioRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Analysis {
    Descriptive {
        metric: String,
        figures: Vec<ReportedFigure>,
    },
    Diagnostic {
        metric: String,
        /// Metric originally asked about when the answer had to narrow.
        narrowed_from: Option<String>,
        scenario: Scenario,
        baseline: Scenario,
        /// Reported totals when the metric is a ledger headline.
        ledger: Option<LedgerComparison>,
        /// Driver breakdown; absent when only the ledger holds the scenario.
        decomposition: Option<Decomposition>,
    },
    Predictive {
        metric: String,
        narrowed_from: Option<String>,
        scenario: Scenario,
        shocked: Option<SensitivityResult>,
        /// ±step ranges per driver, largest impact first. Empty when shocks were given.
        table: Vec<DriverRange>,
    },
    Prescriptive {
        metric: String,
        scenario: Scenario,
        crops: Vec<CropRanking>,
        unrankable: Vec<Unrankable>,
        levers_for: Option<String>,
        levers: Vec<Lever>,
    },
}

impl Analysis {
    pub fn intent(&self) -> Intent {
        match self {
            Analysis::Descriptive { .. } => Intent::Descriptive,
            Analysis::Diagnostic { .. } => Intent::Diagnostic,
            Analysis::Predictive { .. } => Intent::Predictive,
            Analysis::Prescriptive { .. } => Intent::Prescriptive,
        }
    }

    pub fn metric(&self) -> &str {
        match self {
            Analysis::Descriptive { metric, .. }
            | Analysis::Diagnostic { metric, .. }
            | Analysis::Predictive { metric, .. }
            | Analysis::Prescriptive { metric, .. } => metric,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResponse {
    pub session_id: String,
    pub turn_id: Uuid,
    pub question: String,
    pub classification: Classification,
    pub frame: QueryFrame,
    pub analysis: Analysis,
    pub results: Vec<ResultSummary>,
    pub provenance: Vec<String>,
    pub summary: String,
    pub reasoning_trace: Vec<String>,
}

struct Outcome {
    analysis: Analysis,
    results: Vec<ResolvedResult>,
    driver_set: Option<DriverSet>,
}

// ================= Summaries =================

fn fmt_value(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2}", v))
        .unwrap_or_else(|| "n/a".into())
}

fn summarize(analysis: &Analysis, results: &[ResultSummary]) -> String {
    let mut out = String::new();

    match analysis {
        Analysis::Descriptive { metric, figures } => {
            out.push_str(&format!("### {}\n\n", metric));
            if figures.is_empty() {
                out.push_str("No entries recorded for this period.\n");
            } else {
                out.push_str("| Scenario | Period | Value | Unit |\n");
                out.push_str("|----------|--------|-------|------|\n");
                for f in figures {
                    out.push_str(&format!(
                        "| {} | {} | {} | {} |\n",
                        f.scenario,
                        f.period,
                        fmt_value(f.value),
                        f.unit
                    ));
                }
                for note in figures.iter().filter_map(|f| f.note.as_deref()) {
                    out.push_str(&format!("\n> {}\n", note));
                }
            }
        }

        Analysis::Diagnostic {
            metric,
            narrowed_from,
            scenario,
            baseline,
            ledger,
            decomposition,
        } => {
            if let Some(l) = ledger {
                out.push_str(&format!(
                    "### {} {}: {} vs {}\n\n",
                    l.metric, l.period, l.scenario, l.baseline
                ));
                out.push_str(&format!("| Metric | {} | {} | Variance |\n", l.scenario, l.baseline));
                out.push_str("|--------|------|------|----------|\n");
                let pct = l
                    .variance_pct
                    .map(|p| format!(" ({:+.2}%)", p))
                    .unwrap_or_default();
                out.push_str(&format!(
                    "| {metric} | {value:.2} {cur} | {base:.2} {cur} | {var:+.2} {cur}{pct} |\n",
                    metric = l.metric,
                    value = l.value,
                    base = l.baseline_value,
                    var = l.variance,
                    cur = l.currency,
                    pct = pct
                ));
                if let Some(usd) = l.variance_usd {
                    out.push_str(&format!("\nVariance in USD: {:+.2}\n", usd));
                }
                if let (Some(m), Some(b)) = (l.margin_pct, l.baseline_margin_pct) {
                    out.push_str(&format!(
                        "\nEBITDA margin: {:.1}% vs {:.1}% (target {:.1}%)\n",
                        m,
                        b,
                        knowledge::EBITDA_MARGIN_TARGET
                    ));
                }
                if let Some(note) = &l.note {
                    out.push_str(&format!("\n> {}\n", note));
                }
                out.push('\n');
            }

            if let Some(decomposition) = decomposition {
                out.push_str(&format!(
                    "### Variance: {} ({} vs {})\n\n",
                    metric, scenario, baseline
                ));
                if let Some(original) = narrowed_from {
                    out.push_str(&format!(
                        "{} needs adjustment drivers the sources do not hold; explained {} instead.\n\n",
                        original, metric
                    ));
                }
                out.push_str(&format!(
                    "Total variance: **{}** {}\n\n",
                    fmt_value(decomposition.total_variance),
                    decomposition.unit.symbol()
                ));
                out.push_str("| Rank | Driver | Effect |\n");
                out.push_str("|------|--------|--------|\n");
                for e in &decomposition.effects {
                    let effect = match (&e.amount, &e.reason) {
                        (Some(v), _) => format!("{:.2}", v),
                        (None, Some(reason)) => format!("n/a ({})", reason),
                        (None, None) => "n/a".into(),
                    };
                    out.push_str(&format!("| {} | {} | {} |\n", e.rank, e.driver_name, effect));
                }
                if let Some(rest) = decomposition.unattributed {
                    out.push_str(&format!("\nUnattributed: {:.2}\n", rest));
                }
            } else {
                out.push_str(&format!(
                    "No driver figures for {} vs {}; the ledger totals above are the answer.\n",
                    scenario, baseline
                ));
            }
        }

        Analysis::Predictive {
            metric,
            narrowed_from,
            shocked,
            table,
            ..
        } => {
            out.push_str(&format!("### What-if: {}\n\n", metric));
            if let Some(original) = narrowed_from {
                out.push_str(&format!(
                    "{} cannot be evaluated from the available drivers; showing {}.\n\n",
                    original, metric
                ));
            }
            if let Some(result) = shocked {
                out.push_str(&format!(
                    "Base **{:.2}** → shocked **{:.2}** (delta {:.2}",
                    result.base_value, result.shocked_value, result.delta
                ));
                match result.delta_pct {
                    Some(pct) => out.push_str(&format!(", {:.2}%)\n", pct)),
                    None => out.push_str(")\n"),
                }
            }
            if !table.is_empty() {
                out.push_str(&format!(
                    "| Driver | -{0}% | +{0}% |\n",
                    SENSITIVITY_STEP_PCT
                ));
                out.push_str("|--------|------|------|\n");
                for row in table {
                    out.push_str(&format!(
                        "| {} | {:.2} | {:.2} |\n",
                        row.driver, row.range.downside.delta, row.range.upside.delta
                    ));
                }
            }
        }

        Analysis::Prescriptive {
            crops,
            unrankable,
            levers_for,
            levers,
            ..
        } => {
            out.push_str("### Gross margin per hectare\n\n");
            out.push_str("| Crop | GM/ha | GM % | Gross margin |\n");
            out.push_str("|------|-------|------|--------------|\n");
            for c in crops {
                let flag = if c.below_target || c.below_gm_percent_target {
                    " (below target)"
                } else {
                    ""
                };
                out.push_str(&format!(
                    "| {}{} | {:.2} | {} | {:.2} |\n",
                    c.crop,
                    flag,
                    c.gm_per_ha,
                    c.gm_percent.map(|p| format!("{:.1}", p)).unwrap_or_else(|| "n/a".into()),
                    c.gross_margin
                ));
            }
            for u in unrankable {
                out.push_str(&format!("\nNot ranked: {} ({})", u.crop, u.reason));
            }
            if let Some(crop) = levers_for {
                out.push_str(&format!(
                    "\n\n**Levers for {}** ({}% move)\n\n",
                    crop, SENSITIVITY_STEP_PCT
                ));
                for l in levers {
                    let verb = match l.direction {
                        LeverDirection::Increase => "raise",
                        LeverDirection::Decrease => "lower",
                    };
                    out.push_str(&format!("{}. {} {}: +{:.2}\n", l.rank, verb, l.driver, l.impact));
                }
            }
        }
    }

    let fallback: Vec<&str> = results
        .iter()
        .filter(|r| r.source == Provenance::Fallback)
        .filter_map(|r| r.reason.as_deref())
        .collect();
    if !fallback.is_empty() {
        let mut reasons = fallback.clone();
        reasons.dedup();
        out.push_str(&format!(
            "\n_Answered from the fallback dataset: {}._\n",
            reasons.join("; ")
        ));
    }

    out
}

/// Ledger rows summed per period, in period order.
fn ledger_figures(rows: &[Row], scenario: Scenario, crop: Option<&str>) -> Vec<ReportedFigure> {
    let mut by_period: BTreeMap<String, (f64, String, Option<String>)> = BTreeMap::new();

    for row in rows {
        let amount = match row
            .get("amount")
            .or_else(|| row.get("value"))
            .and_then(Value::as_f64)
        {
            Some(v) => v,
            None => continue,
        };
        let period = row
            .get("period")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let currency = row
            .get("currency")
            .and_then(Value::as_str)
            .unwrap_or("USD")
            .to_string();
        let basis = row.get("basis").and_then(Value::as_str).map(str::to_string);

        let entry = by_period.entry(period).or_insert((0.0, currency, basis));
        entry.0 += amount;
    }

    let note = crop.map(|c| format!("reported for the whole entity; {} filter not applied", c));

    by_period
        .into_iter()
        .map(|(period, (amount, currency, basis))| ReportedFigure {
            scenario,
            period,
            crop: None,
            value: Some(amount),
            unit: currency,
            basis,
            note: note.clone(),
        })
        .collect()
}

/// Metrics answered from reported ledger lines rather than the driver tree.
fn is_ledger_metric(metric: &str, crop: Option<&str>) -> bool {
    matches!(metric, EBITDA | NET_INCOME | GA_EXPENSES) || (metric == REVENUE && crop.is_none())
}

// ================= Engine =================

pub struct AnalyticsEngine {
    tree: DriverTree,
    resolver: DataSourceResolver,
    classifier: IntentClassifier,
    store: ConversationStore,
    context: ContextManager,
    config: EngineConfig,
}

impl AnalyticsEngine {
    pub fn new(
        config: EngineConfig,
        live: Arc<dyn LiveSource>,
        fallback: Arc<dyn FallbackSource>,
        oracle: Option<Arc<dyn IntentOracle>>,
    ) -> Result<Self> {
        let resolver = DataSourceResolver::new(
            live,
            fallback,
            ResolverPolicy {
                timeout: config.live_timeout,
                retry_delay: config.live_retry_delay,
            },
        );
        let classifier = IntentClassifier::new(
            ClassifierPolicy {
                confidence_threshold: config.confidence_threshold,
                allow_safe_default: config.allow_default_intent,
            },
            oracle,
        );

        Ok(Self {
            tree: DriverTree::extended()?,
            resolver,
            classifier,
            store: ConversationStore::new(),
            context: ContextManager::new(),
            config,
        })
    }

    /// Wire the shipped sources from configuration.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let live: Arc<dyn LiveSource> = match &config.warehouse_base_url {
            Some(url) => Arc::new(HttpWarehouseSource::new(url)?),
            None => {
                warn!("WAREHOUSE_API_BASE_URL not set; answering from the fallback dataset only");
                Arc::new(DisconnectedSource)
            }
        };

        let fallback: Arc<dyn FallbackSource> = match &config.fallback_dataset_path {
            Some(path) => Arc::new(FallbackDataset::from_json_file(path)?),
            None => Arc::new(FallbackDataset::embedded()),
        };

        let oracle: Option<Arc<dyn IntentOracle>> = if config.has_gemini() {
            Some(Arc::new(GeminiIntentOracle::new(config.gemini_api_key.clone())?))
        } else {
            None
        };

        info!(
            entity = %config.entity_code,
            period = %config.default_period,
            live = live.name(),
            oracle = oracle.is_some(),
            "Analytics engine configured"
        );

        Self::new(config, live, fallback, oracle)
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn purge_expired_sessions(&self) -> Result<usize> {
        let ttl = chrono::Duration::from_std(self.config.session_ttl)
            .map_err(|e| AnalyticsError::Config(format!("session TTL out of range: {}", e)))?;
        Ok(self.store.purge_expired(ttl).await)
    }

    /// Answer one question within a session.
    ///
    /// The session's turn slot is held throughout, and the turn is appended
    /// only once the analysis has succeeded.
    pub async fn handle(&self, question: &str, session_id: &str) -> Result<EngineResponse> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AnalyticsError::InvalidInput("question is empty".into()));
        }
        if session_id.trim().is_empty() {
            return Err(AnalyticsError::InvalidInput("session id is empty".into()));
        }

        let start_time = Instant::now();
        let mut reasoning_trace = vec!["INPUT: Question received".to_string()];

        let _slot = self.store.begin_turn(session_id).await;
        let recent = self
            .store
            .recent_turns(session_id, self.context.config().lookback_turns)
            .await;

        // === CLASSIFY ===
        let parsed = interpret(question);
        let classification = self.classify(question, &parsed, &recent).await?;
        reasoning_trace.push(format!(
            "CLASSIFY: {} via {:?} (confidence {:.2})",
            classification.intent, classification.method, classification.confidence
        ));

        // === INTERPRET ===
        let frame = self.context.merge(parsed, &recent);
        reasoning_trace.push(format!(
            "INTERPRET: metric={} crop={} period={}",
            frame.metric.as_deref().unwrap_or("-"),
            frame.crop.as_deref().unwrap_or("all"),
            self.period(&frame)
        ));

        // === RESOLVE + ANALYZE ===
        let outcome = match classification.intent {
            Intent::Descriptive => self.describe(&frame).await?,
            Intent::Diagnostic => self.diagnose(&frame).await?,
            Intent::Predictive => self.predict(&frame).await?,
            Intent::Prescriptive => self.prescribe(&frame).await?,
        };

        let results: Vec<ResultSummary> = outcome.results.iter().map(ResultSummary::from).collect();
        let provenance: Vec<String> = results.iter().map(ResultSummary::provenance_note).collect();
        for note in &provenance {
            reasoning_trace.push(format!("RESOLVE: {}", note));
        }
        reasoning_trace.push(format!(
            "ANALYZE: {} on {}",
            outcome.analysis.intent(),
            outcome.analysis.metric()
        ));

        let summary = summarize(&outcome.analysis, &results);

        // === RECORD ===
        let turn = ConversationTurn::new(session_id, question, classification.intent, frame.clone())
            .with_results(results.iter().map(|r| r.result_id))
            .with_driver_set(outcome.driver_set);
        let turn_id = turn.turn_id;
        self.store.append(turn).await;
        reasoning_trace.push("COMPLETE: Turn recorded".to_string());

        info!(
            session_id = %session_id,
            intent = %classification.intent,
            results = results.len(),
            fallback = results.iter().any(|r| r.source == Provenance::Fallback),
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Question answered"
        );

        Ok(EngineResponse {
            session_id: session_id.to_string(),
            turn_id,
            question: question.to_string(),
            classification,
            frame,
            analysis: outcome.analysis,
            results,
            provenance,
            summary,
            reasoning_trace,
        })
    }

    /// A cue-less follow-up keeps the previous turn's intent.
    async fn classify(
        &self,
        question: &str,
        parsed: &QueryFrame,
        recent: &[ConversationTurn],
    ) -> Result<Classification> {
        if parsed.follow_up {
            if let Some(previous) = recent.first() {
                if let Some(decided) = self.classifier.classify_deterministic(question) {
                    return Ok(decided);
                }
                debug!(intent = %previous.intent, "Follow-up keeps previous intent");
                return Ok(Classification {
                    intent: previous.intent,
                    confidence: self.classifier.policy().confidence_threshold,
                    method: ClassificationMethod::Context,
                    cues: vec![],
                });
            }
        }
        self.classifier.classify(question).await
    }

    fn period(&self, frame: &QueryFrame) -> String {
        frame.period_label().unwrap_or_else(|| match &frame.sub_period {
            Some(q) => format!("{}-{}", self.config.default_period, q),
            None => self.config.default_period.clone(),
        })
    }

    async fn drivers(
        &self,
        frame: &QueryFrame,
        scenario: Scenario,
        crop: Option<&str>,
    ) -> Result<(DriverSet, ResolvedResult)> {
        let query = QuerySpec::drivers(
            &self.config.entity_code,
            self.period(frame),
            scenario,
            crop.map(str::to_string),
        );
        let resolved = self.resolver.resolve(&query).await?;
        let set = resolved.payload.driver_set(&query)?;
        Ok((set, resolved))
    }

    /// Where to go when `metric` cannot be answered because of `err`.
    ///
    /// A composite metric missing its flat adjustment drivers narrows to gross
    /// margin. Gross margin blocked by an unavailable cost driver narrows to
    /// revenue when `set` is given.
    fn narrowing(
        &self,
        metric: &str,
        err: &AnalyticsError,
        set: Option<&DriverSet>,
    ) -> Option<&'static str> {
        let driver = match err {
            AnalyticsError::MissingDriver { driver, .. } => driver,
            _ => return None,
        };

        let gm_leaves = self.tree.leaves(GROSS_MARGIN);
        if metric != GROSS_MARGIN
            && self.tree.is_node(metric)
            && self.tree.leaves(metric).contains(driver)
            && !gm_leaves.contains(driver)
        {
            return Some(GROSS_MARGIN);
        }

        let unavailable = set.map_or(false, |s| s.unavailable_reason(driver).is_some());
        if metric == GROSS_MARGIN && unavailable && !self.tree.leaves(REVENUE).contains(driver) {
            return Some(REVENUE);
        }

        None
    }

    // ================= DESCRIPTIVE =================

    async fn describe(&self, frame: &QueryFrame) -> Result<Outcome> {
        let metric = frame.metric.clone().unwrap_or_else(|| REVENUE.to_string());
        let crop = frame.crop.as_deref();

        let mut scenarios = vec![frame.scenario.unwrap_or(Scenario::Actual)];
        if let Some(baseline) = frame.baseline {
            if !scenarios.contains(&baseline) {
                scenarios.push(baseline);
            }
        }

        let mut figures = Vec::new();
        let mut results = Vec::new();
        let mut driver_set = None;

        for scenario in scenarios {
            if is_ledger_metric(&metric, crop) {
                let query = QuerySpec::ledger(
                    &self.config.entity_code,
                    self.period(frame),
                    scenario,
                    metric.as_str(),
                );
                let resolved = self.resolver.resolve(&query).await?;
                figures.extend(ledger_figures(&resolved.payload.rows(), scenario, crop));
                results.push(resolved);
                continue;
            }

            let (set, resolved) = self.drivers(frame, scenario, crop).await?;
            let unit = self.tree.unit_of(&metric);
            let (value, note) = match self.tree.evaluate(&metric, &set) {
                Ok(v) => (Some(self.config.precision.round(v, unit)), None),
                Err(AnalyticsError::MissingDriver { driver, context }) => {
                    match set.unavailable_reason(&driver) {
                        Some(reason) => (None, Some(format!("{} unavailable: {}", driver, reason))),
                        None => return Err(AnalyticsError::MissingDriver { driver, context }),
                    }
                }
                Err(e) => return Err(e),
            };

            figures.push(ReportedFigure {
                scenario,
                period: set.period.clone(),
                crop: frame.crop.clone(),
                value,
                unit: unit.symbol().to_string(),
                basis: None,
                note,
            });
            results.push(resolved);
            driver_set = Some(set);
        }

        Ok(Outcome {
            analysis: Analysis::Descriptive { metric, figures },
            results,
            driver_set,
        })
    }

    // ================= DIAGNOSTIC =================

    async fn diagnose(&self, frame: &QueryFrame) -> Result<Outcome> {
        let requested = frame.metric.clone().unwrap_or_else(|| GROSS_MARGIN.to_string());
        let scenario = frame.scenario.unwrap_or(Scenario::Actual);
        let baseline = frame.baseline.unwrap_or(if scenario == Scenario::Budget {
            Scenario::Actual
        } else {
            Scenario::Budget
        });
        if scenario == baseline {
            return Err(AnalyticsError::InvalidInput(format!(
                "cannot explain {} against itself",
                scenario
            )));
        }

        let crop = frame.crop.as_deref();
        let mut results = Vec::new();

        // Ledger headlines compare the full-year outlook with the budget
        // unless a scenario was named.
        let ledger = if is_ledger_metric(&requested, crop) && crop.is_none() {
            let ledger_scenario = frame.scenario.unwrap_or(if baseline == Scenario::Budget {
                Scenario::Forecast
            } else {
                scenario
            });
            if ledger_scenario == baseline {
                None
            } else {
                self.ledger_comparison(frame, &requested, ledger_scenario, baseline, &mut results)
                    .await?
            }
        } else {
            None
        };

        let sides = match self.drivers(frame, scenario, crop).await {
            Ok(actual) => match self.drivers(frame, baseline, crop).await {
                Ok(base) => Some((actual, base)),
                Err(AnalyticsError::NoData { query }) if ledger.is_some() => {
                    debug!(query = %query, "No baseline drivers; ledger comparison only");
                    None
                }
                Err(e) => return Err(e),
            },
            Err(AnalyticsError::NoData { query }) if ledger.is_some() => {
                debug!(query = %query, "No scenario drivers; ledger comparison only");
                None
            }
            Err(e) => return Err(e),
        };

        let mut metric = requested.clone();
        let mut narrowed_from = None;
        let mut driver_set = None;
        let decomposition = match sides {
            Some(((actual, actual_result), (base, base_result))) => {
                results.push(actual_result);
                results.push(base_result);

                let opts = DecomposeOptions {
                    precision: self.config.precision,
                    ..Default::default()
                };
                let decomposition = loop {
                    match variance::decompose(&self.tree, &metric, &actual, &base, &opts) {
                        Ok(d) => break d,
                        Err(e) => match self.narrowing(&metric, &e, None) {
                            Some(next) => {
                                warn!(from = %metric, to = next, error = %e, "Narrowing variance metric");
                                narrowed_from.get_or_insert_with(|| requested.clone());
                                metric = next.to_string();
                            }
                            None => return Err(e),
                        },
                    }
                };
                driver_set = Some(actual);
                Some(decomposition)
            }
            None => None,
        };

        Ok(Outcome {
            analysis: Analysis::Diagnostic {
                metric,
                narrowed_from,
                scenario,
                baseline,
                ledger,
                decomposition,
            },
            results,
            driver_set,
        })
    }

    /// Summed ledger amount for one scenario, `None` when nothing is reported.
    async fn ledger_total(
        &self,
        frame: &QueryFrame,
        metric: &str,
        scenario: Scenario,
        results: &mut Vec<ResolvedResult>,
    ) -> Result<Option<(f64, String, Option<String>)>> {
        let query = QuerySpec::ledger(&self.config.entity_code, self.period(frame), scenario, metric);
        let resolved = match self.resolver.resolve(&query).await {
            Ok(r) => r,
            Err(AnalyticsError::NoData { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let figures = ledger_figures(&resolved.payload.rows(), scenario, None);
        results.push(resolved);
        if figures.is_empty() {
            return Ok(None);
        }

        let total = figures.iter().filter_map(|f| f.value).sum();
        let currency = figures[0].unit.clone();
        let basis = figures[0].basis.clone();
        Ok(Some((total, currency, basis)))
    }

    async fn ledger_comparison(
        &self,
        frame: &QueryFrame,
        metric: &str,
        scenario: Scenario,
        baseline: Scenario,
        results: &mut Vec<ResolvedResult>,
    ) -> Result<Option<LedgerComparison>> {
        let Some((value, currency, basis)) = self.ledger_total(frame, metric, scenario, results).await?
        else {
            return Ok(None);
        };
        let Some((baseline_value, _, baseline_basis)) =
            self.ledger_total(frame, metric, baseline, results).await?
        else {
            return Ok(None);
        };

        let precision = self.config.precision;
        let variance = value - baseline_value;
        let variance_pct = (baseline_value != 0.0)
            .then(|| precision.round((value / baseline_value - 1.0) * 100.0, Unit::Ratio));
        let variance_usd = (currency == "SAR")
            .then(|| precision.round(variance / knowledge::USD_SAR, Unit::Usd));

        let (margin_pct, baseline_margin_pct) = if metric == EBITDA {
            let revenue = self.ledger_total(frame, REVENUE, scenario, results).await?;
            let baseline_revenue = self.ledger_total(frame, REVENUE, baseline, results).await?;
            let margin = |ebitda: f64, revenue: Option<(f64, String, Option<String>)>| {
                revenue
                    .map(|(r, _, _)| r)
                    .filter(|r| *r != 0.0)
                    .map(|r| precision.round(ebitda / r * 100.0, Unit::Ratio))
            };
            (margin(value, revenue), margin(baseline_value, baseline_revenue))
        } else {
            (None, None)
        };

        let mut notes = Vec::new();
        if basis != baseline_basis {
            notes.push(format!(
                "{} is reported {} and {} {}",
                scenario,
                basis.as_deref().unwrap_or("without a basis"),
                baseline,
                baseline_basis.as_deref().unwrap_or("without a basis")
            ));
        }
        if margin_pct.is_some_and(|m| m < knowledge::EBITDA_MARGIN_TARGET) {
            notes.push(format!(
                "{} EBITDA margin is below the {:.1}% target",
                scenario,
                knowledge::EBITDA_MARGIN_TARGET
            ));
        }

        debug!(
            metric = %metric,
            scenario = %scenario,
            baseline = %baseline,
            variance = variance,
            "Ledger comparison"
        );

        Ok(Some(LedgerComparison {
            metric: metric.to_string(),
            period: self.period(frame),
            scenario,
            baseline,
            value,
            baseline_value,
            variance: precision.round(variance, Unit::Sar),
            variance_pct,
            currency,
            variance_usd,
            margin_pct,
            baseline_margin_pct,
            note: (!notes.is_empty()).then(|| notes.join("; ")),
        }))
    }

    // ================= PREDICTIVE =================

    async fn predict(&self, frame: &QueryFrame) -> Result<Outcome> {
        let requested = frame.metric.clone().unwrap_or_else(|| GROSS_MARGIN.to_string());
        let scenario = frame.scenario.unwrap_or(Scenario::Actual);
        let (base, resolved) = self.drivers(frame, scenario, frame.crop.as_deref()).await?;

        let mut metric = requested.clone();
        let mut narrowed_from = None;
        let (shocked, table) = loop {
            match self.what_if(&metric, &base, &frame.shocks) {
                Ok(out) => break out,
                Err(e) => match self.narrowing(&metric, &e, Some(&base)) {
                    Some(next) => {
                        warn!(from = %metric, to = next, error = %e, "Narrowing what-if metric");
                        narrowed_from.get_or_insert_with(|| requested.clone());
                        metric = next.to_string();
                    }
                    None => return Err(e),
                },
            }
        };

        Ok(Outcome {
            analysis: Analysis::Predictive {
                metric,
                narrowed_from,
                scenario,
                shocked,
                table,
            },
            results: vec![resolved],
            driver_set: Some(base),
        })
    }

    /// The stated shocks, or a ±step range per available driver when none.
    fn what_if(
        &self,
        metric: &str,
        base: &DriverSet,
        shocks: &[ScenarioShock],
    ) -> Result<(Option<SensitivityResult>, Vec<DriverRange>)> {
        if !shocks.is_empty() {
            let result = sensitivity::simulate(&self.tree, base, shocks, metric)?;
            return Ok((Some(result), Vec::new()));
        }

        let drivers: Vec<String> = self
            .tree
            .leaves(metric)
            .into_iter()
            .filter(|d| base.value(d).is_some())
            .collect();
        let refs: Vec<&str> = drivers.iter().map(String::as_str).collect();
        let ordered =
            sensitivity::sensitivity_table(&self.tree, base, &refs, SENSITIVITY_STEP_PCT, metric)?;

        let table = ordered
            .iter()
            .filter_map(|row| row.changes.first())
            .map(|change| {
                let driver = change.name.as_str();
                sensitivity::simulate_range(
                    &self.tree,
                    base,
                    &[ScenarioShock::percent(driver, -SENSITIVITY_STEP_PCT)],
                    &[],
                    &[ScenarioShock::percent(driver, SENSITIVITY_STEP_PCT)],
                    metric,
                )
                .map(|range| DriverRange {
                    driver: driver.to_string(),
                    range,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((None, table))
    }

    // ================= PRESCRIPTIVE =================

    async fn prescribe(&self, frame: &QueryFrame) -> Result<Outcome> {
        let scenario = frame.scenario.unwrap_or(Scenario::Actual);
        let precision = self.config.precision;

        let mut crops = Vec::new();
        let mut unrankable = Vec::new();
        let mut results = Vec::new();
        let mut sets: Vec<(String, DriverSet)> = Vec::new();

        for profile in knowledge::CROPS {
            let (set, resolved) = match self.drivers(frame, scenario, Some(profile.crop)).await {
                Ok(found) => found,
                Err(AnalyticsError::NoData { .. }) => {
                    unrankable.push(Unrankable {
                        crop: profile.crop.to_string(),
                        reason: "no driver data".to_string(),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };
            results.push(resolved);

            let gm = match self.tree.evaluate(GROSS_MARGIN, &set) {
                Ok(v) => v,
                Err(AnalyticsError::MissingDriver { driver, context }) => {
                    match set.unavailable_reason(&driver) {
                        Some(reason) => {
                            unrankable.push(Unrankable {
                                crop: profile.crop.to_string(),
                                reason: format!("{} unavailable: {}", driver, reason),
                            });
                            continue;
                        }
                        None => return Err(AnalyticsError::MissingDriver { driver, context }),
                    }
                }
                Err(e) => return Err(e),
            };

            let area = match set.value(AREA).filter(|a| *a > 0.0) {
                Some(a) => a,
                None => {
                    unrankable.push(Unrankable {
                        crop: profile.crop.to_string(),
                        reason: "no planted area".to_string(),
                    });
                    continue;
                }
            };

            let per_ha = gm / area;
            let gm_percent = self
                .tree
                .evaluate(REVENUE, &set)
                .ok()
                .filter(|r| *r != 0.0)
                .map(|r| gm / r * 100.0);
            crops.push(CropRanking {
                crop: profile.crop.to_string(),
                gross_margin: precision.round(gm, Unit::Usd),
                gm_per_ha: precision.round(per_ha, Unit::UsdPerHectare),
                gm_percent: gm_percent.map(|p| precision.round(p, Unit::Ratio)),
                below_target: per_ha < knowledge::GM_PER_HA_TARGET,
                below_gm_percent_target: gm_percent
                    .is_some_and(|p| p < knowledge::GM_PERCENT_TARGET),
            });
            sets.push((profile.crop.to_string(), set));
        }

        crops.sort_by(|a, b| {
            b.gm_per_ha
                .partial_cmp(&a.gm_per_ha)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Levers for the named crop, else for the weakest ranked one.
        let target = frame
            .crop
            .clone()
            .or_else(|| crops.last().map(|c| c.crop.clone()));
        let lever_set = target
            .as_ref()
            .and_then(|t| sets.iter().find(|(crop, _)| crop == t))
            .map(|(_, set)| set.clone());

        let levers = match &lever_set {
            Some(set) => self.levers(set)?,
            None => Vec::new(),
        };

        debug!(
            ranked = crops.len(),
            unrankable = unrankable.len(),
            levers = levers.len(),
            "Prescriptive ranking complete"
        );

        Ok(Outcome {
            analysis: Analysis::Prescriptive {
                metric: GROSS_MARGIN.to_string(),
                scenario,
                crops,
                unrankable,
                levers_for: lever_set.as_ref().and(target),
                levers,
            },
            results,
            driver_set: lever_set,
        })
    }

    fn levers(&self, set: &DriverSet) -> Result<Vec<Lever>> {
        let drivers: Vec<String> = self
            .tree
            .leaves(GROSS_MARGIN)
            .into_iter()
            .filter(|d| set.value(d).is_some())
            .collect();
        let refs: Vec<&str> = drivers.iter().map(String::as_str).collect();
        let table =
            sensitivity::sensitivity_table(&self.tree, set, &refs, SENSITIVITY_STEP_PCT, GROSS_MARGIN)?;

        Ok(table
            .iter()
            .filter_map(|row| {
                let change = row.changes.first()?;
                Some((change.name.clone(), row.delta))
            })
            .enumerate()
            .map(|(i, (driver, delta))| Lever {
                driver,
                direction: if delta >= 0.0 {
                    LeverDirection::Increase
                } else {
                    LeverDirection::Decrease
                },
                impact: self.config.precision.round(delta.abs(), Unit::Usd),
                rank: i + 1,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver_tree::{COST_PER_TON, PRICE};
    use std::time::Duration;
    use tokio_test::assert_err;

    fn engine() -> AnalyticsEngine {
        let config = EngineConfig {
            live_timeout: Duration::from_millis(200),
            live_retry_delay: Duration::from_millis(1),
            ..Default::default()
        };
        AnalyticsEngine::new(
            config,
            Arc::new(DisconnectedSource),
            Arc::new(FallbackDataset::embedded()),
            None,
        )
        .unwrap()
    }

    fn wheat_volume() -> f64 {
        let wheat = knowledge::crop("winter_wheat").unwrap();
        wheat.area_ha * wheat.yield_t_ha
    }

    #[tokio::test]
    async fn test_descriptive_ledger_metric() {
        let engine = engine();
        let response = engine.handle("What is revenue for FY2025?", "s1").await.unwrap();

        assert_eq!(response.classification.intent, Intent::Descriptive);
        match &response.analysis {
            Analysis::Descriptive { metric, figures } => {
                assert_eq!(metric, REVENUE);
                assert_eq!(figures.len(), 1);
                assert_eq!(figures[0].value, Some(846_000_000.0));
                assert_eq!(figures[0].unit, "SAR");
            }
            other => panic!("expected descriptive, got {:?}", other),
        }
        assert_eq!(response.results[0].source, Provenance::Fallback);
        assert!(response.provenance[0].contains("source unavailable"));
        assert!(response.summary.contains("fallback dataset"));
    }

    #[tokio::test]
    async fn test_descriptive_groups_by_period() {
        let engine = engine();
        let response = engine
            .handle("Show me G&A expenses by month for 2024", "s1")
            .await
            .unwrap();

        match &response.analysis {
            Analysis::Descriptive { figures, .. } => {
                let periods: Vec<&str> = figures.iter().map(|f| f.period.as_str()).collect();
                assert_eq!(periods, vec!["FY2024-09", "FY2024-10", "FY2024-11", "FY2024-12"]);
                assert_eq!(figures[3].value, Some(-891.92));
            }
            other => panic!("expected descriptive, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_descriptive_blocked_value_is_not_a_number() {
        let engine = engine();
        let response = engine.handle("What is the gross margin?", "s1").await.unwrap();

        match &response.analysis {
            Analysis::Descriptive { figures, .. } => {
                assert!(figures[0].value.is_none());
                assert!(figures[0].note.as_deref().unwrap().contains(COST_PER_TON));
            }
            other => panic!("expected descriptive, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_composite_metric_narrows_to_gross_margin() {
        let engine = engine();
        let response = engine
            .handle("Why did net income beat budget?", "s1")
            .await
            .unwrap();

        let expected_price: f64 = knowledge::CROPS
            .iter()
            .map(|c| c.area_ha * c.yield_t_ha * (c.actual_price - c.budget_price))
            .sum();

        match &response.analysis {
            Analysis::Diagnostic {
                metric,
                narrowed_from,
                baseline,
                ledger,
                decomposition,
                ..
            } => {
                assert_eq!(metric, GROSS_MARGIN);
                assert_eq!(narrowed_from.as_deref(), Some(NET_INCOME));
                assert_eq!(*baseline, Scenario::Budget);
                let decomposition = decomposition.as_ref().unwrap();
                assert!(decomposition.partial);
                let price = decomposition.effect(PRICE).unwrap().amount.unwrap();
                assert!((price - expected_price).abs() < 1.0);

                // Reported headline: full-year forecast against budget.
                let ledger = ledger.as_ref().unwrap();
                assert_eq!(ledger.scenario, Scenario::Forecast);
                assert_eq!(ledger.variance, 54_000_000.0);
                assert_eq!(ledger.variance_pct, Some(55.6701));
                assert_eq!(ledger.currency, "SAR");
                assert_eq!(ledger.variance_usd, Some(14_400_000.0));
                assert!(ledger.margin_pct.is_none());
            }
            other => panic!("expected diagnostic, got {:?}", other),
        }
        assert_eq!(response.results.len(), 4);
        assert!(response.summary.contains("+55.67%"));
    }

    #[tokio::test]
    async fn test_forecast_diagnostic_answers_from_ledger() {
        let engine = engine();
        let response = engine
            .handle("Why did forecast EBITDA beat budget?", "s1")
            .await
            .unwrap();

        match &response.analysis {
            Analysis::Diagnostic {
                scenario,
                ledger,
                decomposition,
                ..
            } => {
                assert_eq!(*scenario, Scenario::Forecast);
                // The fallback dataset holds no forecast drivers.
                assert!(decomposition.is_none());

                let ledger = ledger.as_ref().unwrap();
                assert_eq!(ledger.metric, EBITDA);
                assert_eq!(ledger.value, 397_000_000.0);
                assert_eq!(ledger.baseline_value, 383_000_000.0);
                assert_eq!(ledger.variance, 14_000_000.0);
                assert_eq!(ledger.margin_pct, Some(13.5587));
                assert_eq!(ledger.baseline_margin_pct, Some(19.9479));
                assert!(ledger.note.as_deref().unwrap().contains("below"));
            }
            other => panic!("expected diagnostic, got {:?}", other),
        }
        // Two EBITDA lines and two revenue lines.
        assert_eq!(response.results.len(), 4);
        assert_eq!(engine.store().turns("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_follow_up_inherits_and_failures_are_not_recorded() {
        let engine = engine();
        engine
            .handle("Why did gross margin miss budget in FY2025?", "s1")
            .await
            .unwrap();

        let follow = engine.handle("And for wheat?", "s1").await.unwrap();
        assert_eq!(follow.classification.method, ClassificationMethod::Context);
        assert_eq!(follow.classification.intent, Intent::Diagnostic);
        assert_eq!(follow.frame.crop.as_deref(), Some("winter_wheat"));

        let wheat = knowledge::crop("winter_wheat").unwrap();
        let expected = wheat_volume() * (wheat.actual_price - wheat.budget_price);
        match &follow.analysis {
            Analysis::Diagnostic { decomposition, .. } => {
                let decomposition = decomposition.as_ref().unwrap();
                assert!(!decomposition.partial);
                let total = decomposition.total_variance.unwrap();
                assert!((total - expected).abs() < 0.5);
            }
            other => panic!("expected diagnostic, got {:?}", other),
        }
        assert_eq!(engine.store().turns("s1").await.len(), 2);

        // No quarterly figures in the fallback dataset.
        let err = assert_err!(engine.handle("What about Q2?", "s1").await);
        assert!(matches!(err, AnalyticsError::NoData { ref query } if query.contains("FY2025-Q2")));
        assert_eq!(engine.store().turns("s1").await.len(), 2);
        assert!(engine.store().turns("s2").await.is_empty());
    }

    #[tokio::test]
    async fn test_wheat_price_shock() {
        let engine = engine();
        let response = engine
            .handle("What if wheat prices drop by 15%?", "s1")
            .await
            .unwrap();

        let wheat = knowledge::crop("winter_wheat").unwrap();
        let expected = -wheat_volume() * wheat.actual_price * 0.15;

        match &response.analysis {
            Analysis::Predictive {
                metric,
                shocked,
                table,
                ..
            } => {
                assert_eq!(metric, GROSS_MARGIN);
                let delta = shocked.as_ref().unwrap().delta;
                assert!((delta - expected).abs() < 1e-3);
                assert!(table.is_empty());
            }
            other => panic!("expected predictive, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sensitivity_table_narrows_when_cost_unavailable() {
        let engine = engine();
        let response = engine
            .handle("Show the sensitivity of gross margin", "s1")
            .await
            .unwrap();

        match &response.analysis {
            Analysis::Predictive {
                metric,
                narrowed_from,
                shocked,
                table,
                ..
            } => {
                assert_eq!(metric, REVENUE);
                assert_eq!(narrowed_from.as_deref(), Some(GROSS_MARGIN));
                assert!(shocked.is_none());
                assert_eq!(table.len(), 3);
                for row in table {
                    assert!(row.range.downside.delta < 0.0);
                    assert_eq!(row.range.base.delta, 0.0);
                    assert!(row.range.upside.delta > 0.0);
                }
            }
            other => panic!("expected predictive, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_prescriptive_ranking() {
        let engine = engine();
        let response = engine
            .handle("Where can we improve gross margin?", "s1")
            .await
            .unwrap();

        match &response.analysis {
            Analysis::Prescriptive {
                crops,
                unrankable,
                levers_for,
                levers,
                ..
            } => {
                let order: Vec<&str> = crops.iter().map(|c| c.crop.as_str()).collect();
                assert_eq!(order, vec!["maize", "winter_osr", "winter_wheat"]);
                let wheat = &crops[2];
                let pct = wheat.gm_percent.unwrap();
                assert!((pct - (249.85 - 115.0) / 249.85 * 100.0).abs() < 1e-3);
                assert!(!wheat.below_gm_percent_target);
                assert_eq!(unrankable.len(), 3);
                assert_eq!(levers_for.as_deref(), Some("winter_wheat"));
                assert_eq!(levers[0].driver, PRICE);
                assert_eq!(levers[0].direction, LeverDirection::Increase);
                let cost = levers.iter().find(|l| l.driver == COST_PER_TON).unwrap();
                assert_eq!(cost.direction, LeverDirection::Decrease);
            }
            other => panic!("expected prescriptive, got {:?}", other),
        }
        assert_eq!(response.results.len(), knowledge::CROPS.len());
    }

    #[tokio::test]
    async fn test_rejected_questions() {
        let engine = engine();

        let empty = engine.handle("   ", "s1").await.unwrap_err();
        assert!(matches!(empty, AnalyticsError::InvalidInput(_)));

        // Weak cues only and no oracle configured.
        let ambiguous = engine.handle("Numbers are down", "s1").await.unwrap_err();
        assert!(matches!(ambiguous, AnalyticsError::InvalidInput(_)));
        assert!(engine.store().last_turn("s1").await.is_none());
    }

    struct HangingSource;

    #[async_trait::async_trait]
    impl LiveSource for HangingSource {
        async fn execute(&self, _query: &QuerySpec) -> Result<Vec<Row>> {
            std::future::pending().await
        }
    }

    struct FailingSource;

    #[async_trait::async_trait]
    impl LiveSource for FailingSource {
        async fn execute(&self, _query: &QuerySpec) -> Result<Vec<Row>> {
            Err(AnalyticsError::transport(
                crate::error::TransportKind::Network,
                "connection refused",
            ))
        }
    }

    fn engine_with(live: Arc<dyn LiveSource>) -> AnalyticsEngine {
        let config = EngineConfig {
            live_timeout: Duration::from_secs(30),
            live_retry_delay: Duration::from_secs(30),
            ..Default::default()
        };
        AnalyticsEngine::new(config, live, Arc::new(FallbackDataset::embedded()), None).unwrap()
    }

    #[tokio::test]
    async fn test_dropped_turn_leaves_session_untouched() {
        // One hangs in the live call, the other in the retry backoff.
        for live in [
            Arc::new(HangingSource) as Arc<dyn LiveSource>,
            Arc::new(FailingSource) as Arc<dyn LiveSource>,
        ] {
            let engine = engine_with(live);

            let outcome = tokio::time::timeout(
                Duration::from_millis(50),
                engine.handle("What is revenue for FY2025?", "s1"),
            )
            .await;
            assert!(outcome.is_err());

            assert!(engine.store().turns("s1").await.is_empty());
            let slot = tokio::time::timeout(Duration::from_millis(50), engine.store().begin_turn("s1")).await;
            assert!(slot.is_ok());
        }
    }
}
