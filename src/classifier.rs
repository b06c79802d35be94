//! Query Intent Classifier
//!
//! Maps a question onto one of four analytics intents:
//! - Descriptive: what happened ("What was EBITDA last quarter?")
//! - Diagnostic: why it happened ("Why did net income beat budget?")
//! - Predictive: what will happen ("What if wheat prices drop 15%?")
//! - Prescriptive: what to do ("Where can we reduce costs?")
//!
//! A priority-ordered cue table decides clear cases. Anything it cannot decide
//! goes to an external oracle whose answer is validated strictly.

use crate::error::AnalyticsError;
use crate::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Descriptive,
    Diagnostic,
    Predictive,
    Prescriptive,
}

impl Intent {
    pub const ALL: [Intent; 4] = [
        Intent::Descriptive,
        Intent::Diagnostic,
        Intent::Predictive,
        Intent::Prescriptive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Descriptive => "DESCRIPTIVE",
            Intent::Diagnostic => "DIAGNOSTIC",
            Intent::Predictive => "PREDICTIVE",
            Intent::Prescriptive => "PRESCRIPTIVE",
        }
    }

    /// Strict label parse. Whitespace, case and trailing punctuation are
    /// tolerated; anything else is out of taxonomy.
    pub fn from_label(label: &str) -> Result<Intent> {
        let cleaned = label
            .trim()
            .trim_end_matches(|c: char| c.is_ascii_punctuation())
            .trim();

        Intent::ALL
            .iter()
            .copied()
            .find(|intent| intent.as_str().eq_ignore_ascii_case(cleaned))
            .ok_or_else(|| AnalyticsError::Classification {
                label: label.to_string(),
            })
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMethod {
    Cues,
    Oracle,
    SafeDefault,
    /// Carried over from the previous turn of a follow-up.
    Context,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: f32,
    pub method: ClassificationMethod,
    /// Cue patterns that matched for the chosen intent.
    pub cues: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ClassifierPolicy {
    pub confidence_threshold: f32,
    /// Fall back to Descriptive instead of failing when nothing decides.
    pub allow_safe_default: bool,
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            allow_safe_default: false,
        }
    }
}

/// External free-text classifier (LLM) used for ambiguous questions.
#[async_trait::async_trait]
pub trait IntentOracle: Send + Sync {
    async fn classify_free_text(&self, question: &str) -> Result<String>;
}

//
// ================= Cue table =================
//

struct CueRule {
    intent: Intent,
    strong: Vec<Regex>,
    weak: Vec<Regex>,
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|p| Regex::new(p).unwrap()).collect()
}

lazy_static::lazy_static! {
    /// Checked in order; descriptive last.
    static ref CUE_RULES: Vec<CueRule> = vec![
        CueRule {
            intent: Intent::Diagnostic,
            strong: compile(&[
                r"\bwhy (did|does|do|is|are|was|were|has|have)\b",
                r"\bexplain\b",
                r"\bwhat (caused|drove|contributed)\b",
                r"\broot cause\b",
                r"\bvariances?\b",
                r"\bvs\.? (budget|plan|forecast|last year)\b",
                r"\bcompar(e|ed|ing|ison)\b",
                r"\bdifference between\b",
                r"\bbeat(en)? (the )?(budget|plan|forecast)\b",
                r"\bmiss(ed)? (the )?(budget|target|plan)\b",
                r"\banaly(ze|se|sis)\b",
                r"\bwhat happened\b",
            ]),
            weak: compile(&[
                r"\bchange\b",
                r"\bincrease\b",
                r"\bdecrease\b",
                r"\bup\b",
                r"\bdown\b",
            ]),
        },
        CueRule {
            intent: Intent::Predictive,
            strong: compile(&[
                r"\bwhat if\b",
                r"\bif .+ (drops?|rises?|falls?|increases?|decreases?|changes?)\b",
                r"\bforecast\b",
                r"\bpredict(ion)?\b",
                r"\bproject(ion|ed)?\b",
                r"\bexpect(ed)?\b",
                r"\bestimate\b",
                r"\bwill (be|happen)\b",
                r"\bnext (month|quarter|year)\b",
                r"\bfuture\b",
                r"\bscenarios?\b",
                r"\bsensitivity\b",
                r"\bimpact of\b",
                r"\b(drop|rise|fall|increase|decrease)s? by \d+(\.\d+)?%",
            ]),
            weak: compile(&[r"\btrend\b", r"\boutlook\b", r"\bgoing forward\b"]),
        },
        CueRule {
            intent: Intent::Prescriptive,
            strong: compile(&[
                r"\bhow (should|can|do) we\b",
                r"\bwhat should (we|i)\b",
                r"\brecommend",
                r"\bsuggest",
                r"\boptimi[sz](e|ation)\b",
                r"\bimprov(e|ement)\b",
                r"\breduce (costs?|expenses?)\b",
                r"\bincrease (revenue|margin|profit)\b",
                r"\bbest (way|approach|strategy)\b",
                r"\bactions?\b",
                r"\bstrateg(y|ies)\b",
                r"\bwhere (to|can we)\b",
                r"\badvice\b",
            ]),
            weak: compile(&[r"\bshould\b", r"\bcould\b", r"\boptions?\b"]),
        },
        CueRule {
            intent: Intent::Descriptive,
            strong: compile(&[
                r"\bwhat (is|are|was|were)\b",
                r"\bshow( me| us)?\b",
                r"\blist\b",
                r"\bdisplay\b",
                r"\btell me\b",
                r"\bhow (much|many)\b",
                r"\bwhat('s| is) the (total|current|latest)\b",
                r"\bsummar(y|ise|ize)\b",
                r"\bbreakdown\b",
                r"\bby (month|quarter|year|crop)\b",
                r"\bfor (20\d{2}|fy\d{2,4}|q[1-4])\b",
            ]),
            weak: compile(&[
                r"\btrend\b",
                r"\bhistor(y|ical)\b",
                r"\bdata\b",
                r"\bnumbers\b",
            ]),
        },
    ];
}

/// Cue evidence for one intent.
#[derive(Debug, Clone)]
struct CueScore {
    intent: Intent,
    confidence: f32,
    strong: Vec<String>,
    weak: Vec<String>,
}

impl CueScore {
    fn matched(&self) -> bool {
        !self.strong.is_empty() || !self.weak.is_empty()
    }

    fn cues(&self) -> Vec<String> {
        self.strong.iter().chain(self.weak.iter()).cloned().collect()
    }
}

fn score(rule: &CueRule, text: &str) -> CueScore {
    let hits = |patterns: &[Regex]| -> Vec<String> {
        patterns
            .iter()
            .filter(|re| re.is_match(text))
            .map(|re| re.as_str().to_string())
            .collect()
    };

    let strong = hits(rule.strong.as_slice());
    let weak = hits(rule.weak.as_slice());

    // One strong cue carries 0.7, every further cue adds 0.1.
    // Weak cues alone never reach a sensible threshold.
    let confidence = if strong.is_empty() {
        (0.2 * weak.len() as f32).min(0.5)
    } else {
        (0.7 + 0.1 * (strong.len() + weak.len() - 1) as f32).min(0.99)
    };

    CueScore {
        intent: rule.intent,
        confidence,
        strong,
        weak,
    }
}

//
// ================= Classifier =================
//

pub struct IntentClassifier {
    policy: ClassifierPolicy,
    oracle: Option<Arc<dyn IntentOracle>>,
}

impl IntentClassifier {
    pub fn new(policy: ClassifierPolicy, oracle: Option<Arc<dyn IntentOracle>>) -> Self {
        Self { policy, oracle }
    }

    pub fn policy(&self) -> ClassifierPolicy {
        self.policy
    }

    /// Cue-table decision, or `None` when the question must be escalated.
    pub fn classify_deterministic(&self, question: &str) -> Option<Classification> {
        let text = question.trim().to_lowercase();
        let scores: Vec<CueScore> = CUE_RULES.iter().map(|rule| score(rule, &text)).collect();

        let decided = scores
            .iter()
            .filter(|s| s.intent != Intent::Descriptive)
            .find(|s| s.confidence >= self.policy.confidence_threshold)
            .or_else(|| {
                scores
                    .iter()
                    .find(|s| s.intent == Intent::Descriptive && !s.strong.is_empty())
            })?;

        Some(Classification {
            intent: decided.intent,
            confidence: decided.confidence,
            method: ClassificationMethod::Cues,
            cues: decided.cues(),
        })
    }

    pub async fn classify(&self, question: &str) -> Result<Classification> {
        if let Some(decided) = self.classify_deterministic(question) {
            debug!(
                intent = %decided.intent,
                confidence = decided.confidence,
                cues = decided.cues.len(),
                "Classified from cues"
            );
            return Ok(decided);
        }

        let text = question.trim().to_lowercase();
        let any_cue = CUE_RULES.iter().any(|rule| score(rule, &text).matched());

        let oracle = match &self.oracle {
            Some(oracle) => oracle,
            None => {
                return self.safe_default(any_cue, || {
                    AnalyticsError::InvalidInput(format!(
                        "question is ambiguous and no external classifier is configured: '{}'",
                        question
                    ))
                })
            }
        };

        match oracle.classify_free_text(question).await {
            Ok(label) => match Intent::from_label(&label) {
                Ok(intent) => {
                    info!(intent = %intent, "Classified by oracle");
                    Ok(Classification {
                        intent,
                        confidence: 0.75,
                        method: ClassificationMethod::Oracle,
                        cues: vec![],
                    })
                }
                Err(e) => {
                    warn!(label = %label, "Oracle returned out-of-taxonomy label");
                    if self.policy.allow_safe_default {
                        self.safe_default(true, || e)
                    } else {
                        Err(e)
                    }
                }
            },
            Err(e) => {
                warn!(error = %e, "Oracle classification failed");
                self.safe_default(any_cue, || e)
            }
        }
    }

    fn safe_default(
        &self,
        any_cue: bool,
        err: impl FnOnce() -> AnalyticsError,
    ) -> Result<Classification> {
        if self.policy.allow_safe_default || !any_cue {
            Ok(Classification {
                intent: Intent::Descriptive,
                confidence: 0.5,
                method: ClassificationMethod::SafeDefault,
                cues: vec![],
            })
        } else {
            Err(err())
        }
    }
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new(ClassifierPolicy::default(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedOracle {
        label: &'static str,
        calls: AtomicUsize,
    }

    impl FixedOracle {
        fn new(label: &'static str) -> Arc<Self> {
            Arc::new(Self {
                label,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl IntentOracle for FixedOracle {
        async fn classify_free_text(&self, _question: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.label.to_string())
        }
    }

    fn assert_all(cases: &[&str], expected: Intent) {
        let classifier = IntentClassifier::default();
        for c in cases {
            let result = classifier.classify_deterministic(c);
            assert_eq!(
                result.as_ref().map(|r| r.intent),
                Some(expected),
                "question: {}",
                c
            );
        }
    }

    #[test]
    fn test_descriptive_questions() {
        assert_all(
            &[
                "What is CFG Ukraine's revenue for 2025?",
                "Show me G&A expenses by month",
                "What are the crop areas?",
                "List all account categories",
                "What was EBITDA last quarter?",
            ],
            Intent::Descriptive,
        );
    }

    #[test]
    fn test_diagnostic_questions() {
        assert_all(
            &[
                "Why did net income beat budget by 56%?",
                "What drove the revenue increase?",
                "Explain the variance vs last year",
                "Compare actual to budget",
                "What caused expenses to spike?",
            ],
            Intent::Diagnostic,
        );
    }

    #[test]
    fn test_predictive_questions() {
        assert_all(
            &[
                "What if wheat prices drop by 15%?",
                "Forecast next quarter EBITDA",
                "What's the impact of yield changes?",
                "What will revenue be if prices rise 10%?",
                "Project margin under drought scenario",
            ],
            Intent::Predictive,
        );
    }

    #[test]
    fn test_prescriptive_questions() {
        assert_all(
            &[
                "How should we optimize the crop mix?",
                "Where can we reduce costs?",
                "What actions should we take to improve margin?",
                "Recommend a hedging strategy",
                "How can we increase profitability?",
            ],
            Intent::Prescriptive,
        );
    }

    #[test]
    fn test_diagnostic_checked_before_descriptive() {
        let classifier = IntentClassifier::default();
        let result = classifier
            .classify_deterministic("Why did net income beat budget by 56%?")
            .unwrap();
        assert_eq!(result.intent, Intent::Diagnostic);
        assert!(result.confidence >= 0.8);
        assert!(result.cues.iter().any(|c| c.contains("why")));
    }

    #[test]
    fn test_strict_label_validation() {
        assert_eq!(Intent::from_label(" predictive.\n").unwrap(), Intent::Predictive);
        assert_eq!(Intent::from_label("Diagnostic").unwrap(), Intent::Diagnostic);
        assert!(matches!(
            Intent::from_label("DESCRIPTIVE analysis"),
            Err(AnalyticsError::Classification { .. })
        ));
        assert!(Intent::from_label("").is_err());
    }

    #[tokio::test]
    async fn test_ambiguous_question_escalates() {
        let oracle = FixedOracle::new("PRESCRIPTIVE");
        let classifier = IntentClassifier::new(ClassifierPolicy::default(), Some(oracle.clone()));

        let result = classifier.classify("Margins are down").await.unwrap();
        assert_eq!(result.intent, Intent::Prescriptive);
        assert_eq!(result.method, ClassificationMethod::Oracle);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);

        let decided = classifier.classify("Forecast next quarter EBITDA").await.unwrap();
        assert_eq!(decided.method, ClassificationMethod::Cues);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_out_of_taxonomy_label_is_an_error() {
        let oracle = FixedOracle::new("EXPLORATORY");
        let strict = IntentClassifier::new(ClassifierPolicy::default(), Some(oracle.clone()));
        let err = strict.classify("Margins are down").await.unwrap_err();
        assert!(matches!(err, AnalyticsError::Classification { label } if label == "EXPLORATORY"));

        let lenient = IntentClassifier::new(
            ClassifierPolicy {
                allow_safe_default: true,
                ..Default::default()
            },
            Some(oracle),
        );
        let result = lenient.classify("Margins are down").await.unwrap();
        assert_eq!(result.intent, Intent::Descriptive);
        assert_eq!(result.method, ClassificationMethod::SafeDefault);
    }

    #[tokio::test]
    async fn test_no_cues_defaults_to_descriptive() {
        let classifier = IntentClassifier::default();
        let result = classifier.classify("wheat").await.unwrap();
        assert_eq!(result.intent, Intent::Descriptive);

        assert!(classifier.classify("Margins are down").await.is_err());
    }
}
