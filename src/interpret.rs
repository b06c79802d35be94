//! Question interpreter
//!
//! Pulls a partial query frame out of free text: which metric, crop, period
//! and scenarios the question is about, and any what-if shocks it states.
//! Anything not mentioned stays `None` so a follow-up can inherit it.

use crate::driver_tree::{
    AREA, COST_OF_PRODUCTION, COST_PER_TON, EBITDA, GA_EXPENSES, GROSS_MARGIN, NET_INCOME, PRICE,
    REVENUE, VOLUME, YIELD,
};
use crate::knowledge;
use crate::models::Scenario;
use crate::sensitivity::ScenarioShock;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFrame {
    pub metric: Option<String>,
    pub crop: Option<String>,
    /// Fiscal year label, e.g. `FY2025`.
    pub period: Option<String>,
    /// Quarter within the fiscal year, e.g. `Q2`.
    pub sub_period: Option<String>,
    /// Scenario being explained or evaluated.
    pub scenario: Option<Scenario>,
    /// Scenario it is compared against.
    pub baseline: Option<Scenario>,
    #[serde(default)]
    pub shocks: Vec<ScenarioShock>,
    pub follow_up: bool,
}

impl QueryFrame {
    /// `FY2025-Q2`, `FY2025`, or `None` when no year is known.
    pub fn period_label(&self) -> Option<String> {
        let year = self.period.as_ref()?;
        Some(match &self.sub_period {
            Some(q) => format!("{}-{}", year, q),
            None => year.clone(),
        })
    }

    /// True when the frame names nothing a query could be built from.
    pub fn is_bare(&self) -> bool {
        self.metric.is_none()
            && self.crop.is_none()
            && self.period.is_none()
            && self.sub_period.is_none()
    }
}

lazy_static::lazy_static! {
    static ref METRICS: Vec<(Regex, &'static str)> = vec![
        (Regex::new(r"\b(g&a|g and a|general and admin\w*|admin\w* (costs?|expenses?))\b").unwrap(), GA_EXPENSES),
        (Regex::new(r"\bnet (income|profit)\b").unwrap(), NET_INCOME),
        (Regex::new(r"\bebitda\b").unwrap(), EBITDA),
        (Regex::new(r"\b(gross margin|gm|margins?)\b").unwrap(), GROSS_MARGIN),
        (Regex::new(r"\b(cost of production|production costs?|costs?)\b").unwrap(), COST_OF_PRODUCTION),
        (Regex::new(r"\b(revenue|sales|turnover)\b").unwrap(), REVENUE),
        (Regex::new(r"\b(volume|production|tonnage|harvest)\b").unwrap(), VOLUME),
    ];

    static ref CROP: Regex = Regex::new(
        r"\b(winter wheat|wheat|winter barley|barley|osr|rapeseed|canola|maize|corn|soybeans?|soya?|sunflowers?)\b"
    ).unwrap();

    static ref FISCAL_YEAR: Regex = Regex::new(r"\b(?:fy\s?(\d{4}|\d{2})|(20\d{2}))\b").unwrap();
    static ref QUARTER: Regex = Regex::new(r"\bq([1-4])\b").unwrap();
    static ref PLAN: Regex = Regex::new(r"\b(plan|oep)\b").unwrap();

    static ref SHOCK: Regex = Regex::new(
        r"\b(prices?|yields?|area|hectares|costs?|volumes?|production)\b[^%]*?\b(drops?|falls?|declines?|decreases?|down|rises?|increases?|grows?|up|jumps?)\b(?:\s+by)?\s+(\d+(?:\.\d+)?)\s*%"
    ).unwrap();
    static ref SIGNED_SHOCK: Regex = Regex::new(
        r"\b(prices?|yields?|area|hectares|costs?|volumes?|production)\s*([+-]\d+(?:\.\d+)?)\s*%"
    ).unwrap();

    static ref FOLLOW_UP: Regex = Regex::new(
        r"^(and\b|also\b|same\b|now\b|(what|how) about\b)"
    ).unwrap();
}

fn shock_target(word: &str) -> &'static str {
    match word {
        w if w.starts_with("price") => PRICE,
        w if w.starts_with("yield") => YIELD,
        "area" | "hectares" => AREA,
        w if w.starts_with("cost") => COST_PER_TON,
        _ => VOLUME,
    }
}

fn falling(verb: &str) -> bool {
    ["drop", "fall", "decline", "decrease", "down"]
        .iter()
        .any(|v| verb.starts_with(v))
}

fn fiscal_year(caps: &regex::Captures) -> Option<String> {
    let digits = caps.get(1).or_else(|| caps.get(2))?.as_str();
    Some(match digits.len() {
        2 => format!("FY20{}", digits),
        _ => format!("FY{}", digits),
    })
}

pub fn interpret(question: &str) -> QueryFrame {
    let text = question.trim().to_lowercase();

    let mut shocks = Vec::new();
    let mut shocked_spans = Vec::new();
    for caps in SHOCK.captures_iter(&text) {
        let magnitude: f64 = match caps[3].parse() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let signed = if falling(&caps[2]) { -magnitude } else { magnitude };
        shocks.push(ScenarioShock::percent(shock_target(&caps[1]), signed));
        if let Some(m) = caps.get(0) {
            shocked_spans.push(m.range());
        }
    }
    for caps in SIGNED_SHOCK.captures_iter(&text) {
        let start = caps.get(0).map(|m| m.start()).unwrap_or_default();
        if shocked_spans.iter().any(|r| r.contains(&start)) {
            continue;
        }
        if let Ok(magnitude) = caps[2].parse::<f64>() {
            shocks.push(ScenarioShock::percent(shock_target(&caps[1]), magnitude));
        }
    }

    // A shocked driver word is not the subject of the question.
    let subject_text = shocked_spans
        .iter()
        .rev()
        .fold(text.clone(), |mut acc, r| {
            acc.replace_range(r.clone(), " ");
            acc
        });

    let metric = METRICS
        .iter()
        .find(|(re, _)| re.is_match(&subject_text))
        .map(|(_, m)| m.to_string());

    let crop = CROP
        .captures(&text)
        .and_then(|c| knowledge::canonical_crop(&c[1]))
        .map(str::to_string);

    let period = FISCAL_YEAR.captures(&text).and_then(|c| fiscal_year(&c));
    let sub_period = QUARTER.captures(&text).map(|c| format!("Q{}", &c[1]));

    let baseline = if text.contains("budget") || PLAN.is_match(&text) {
        Some(Scenario::Budget)
    } else {
        None
    };

    let scenario = if text.contains("forecast") {
        Some(Scenario::Forecast)
    } else if text.contains("actual") {
        Some(Scenario::Actual)
    } else {
        None
    };

    QueryFrame {
        metric,
        crop,
        period,
        sub_period,
        scenario,
        baseline,
        shocks,
        follow_up: FOLLOW_UP.is_match(&text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensitivity::DeltaType;

    #[test]
    fn test_price_shock_on_crop() {
        let frame = interpret("What if wheat prices drop by 15%?");
        assert_eq!(frame.crop.as_deref(), Some("winter_wheat"));
        assert_eq!(frame.shocks, vec![ScenarioShock::percent(PRICE, -15.0)]);
        assert_eq!(frame.shocks[0].delta_type, DeltaType::Percent);
        assert!(frame.metric.is_none());
    }

    #[test]
    fn test_compound_shocks() {
        let frame = interpret("What happens to gross margin if prices fall 15% and volume rises 5%?");
        assert_eq!(frame.metric.as_deref(), Some(GROSS_MARGIN));
        assert_eq!(
            frame.shocks,
            vec![
                ScenarioShock::percent(PRICE, -15.0),
                ScenarioShock::percent(VOLUME, 5.0),
            ]
        );

        let signed = interpret("revenue with yield -10%");
        assert_eq!(signed.shocks, vec![ScenarioShock::percent(YIELD, -10.0)]);
        assert_eq!(signed.metric.as_deref(), Some(REVENUE));
    }

    #[test]
    fn test_metric_and_period() {
        let frame = interpret("Why did net income beat budget in FY25?");
        assert_eq!(frame.metric.as_deref(), Some(NET_INCOME));
        assert_eq!(frame.period.as_deref(), Some("FY2025"));
        assert_eq!(frame.baseline, Some(Scenario::Budget));
        assert!(!frame.follow_up);

        let ga = interpret("Show me G&A expenses by month for 2024");
        assert_eq!(ga.metric.as_deref(), Some(GA_EXPENSES));
        assert_eq!(ga.period.as_deref(), Some("FY2024"));
    }

    #[test]
    fn test_follow_up_carries_only_quarter() {
        let frame = interpret("What about Q2?");
        assert!(frame.follow_up);
        assert_eq!(frame.sub_period.as_deref(), Some("Q2"));
        assert!(frame.period.is_none());
        assert!(frame.period_label().is_none());
        assert!(frame.metric.is_none());
    }

    #[test]
    fn test_forecast_vs_budget() {
        let frame = interpret("Compare forecast revenue to the OSR plan for FY2025-Q3");
        assert_eq!(frame.scenario, Some(Scenario::Forecast));
        assert_eq!(frame.baseline, Some(Scenario::Budget));
        assert_eq!(frame.crop.as_deref(), Some("winter_osr"));
        assert_eq!(frame.period_label().as_deref(), Some("FY2025-Q3"));
    }
}
