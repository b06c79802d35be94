//! Follow-up context merging
//!
//! A follow-up question usually names only what changed ("What about Q2?").
//! The rest of its frame comes from the most recent turns of the same session.

use crate::interpret::QueryFrame;
use crate::memory::store::ConversationTurn;
use tracing::debug;

/// Configuration for follow-up merging
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// How many past turns are searched for a missing field.
    pub lookback_turns: usize,
    /// Inherit metric/period/scenarios even without a follow-up cue when the
    /// question names no metric.
    pub inherit_without_cue: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            lookback_turns: 5,
            inherit_without_cue: true,
        }
    }
}

pub struct ContextManager {
    config: ContextConfig,
}

impl ContextManager {
    pub fn new() -> Self {
        Self {
            config: ContextConfig::default(),
        }
    }

    pub fn with_config(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Fill the gaps of `frame` from `recent` (most recent first).
    ///
    /// Metric, period and scenarios are inherited for any follow-up, or for a
    /// question without a metric when `inherit_without_cue` is set. Crop and
    /// shocks are carried only by an explicit follow-up. A quarter alone keeps
    /// the earlier fiscal year; a new fiscal year drops the earlier quarter.
    pub fn merge(&self, frame: QueryFrame, recent: &[ConversationTurn]) -> QueryFrame {
        let inherit = frame.follow_up || (self.config.inherit_without_cue && frame.metric.is_none());
        if !inherit || recent.is_empty() {
            return frame;
        }

        let window: Vec<&QueryFrame> = recent
            .iter()
            .take(self.config.lookback_turns)
            .map(|t| &t.frame)
            .collect();

        let mut merged = frame;
        let mut inherited = Vec::new();

        if merged.metric.is_none() {
            merged.metric = window.iter().find_map(|f| f.metric.clone());
            if merged.metric.is_some() {
                inherited.push("metric");
            }
        }

        if merged.period.is_none() {
            if let Some(prior) = window.iter().find(|f| f.period.is_some()) {
                merged.period = prior.period.clone();
                if merged.sub_period.is_none() {
                    merged.sub_period = prior.sub_period.clone();
                }
                inherited.push("period");
            }
        }

        if merged.scenario.is_none() {
            merged.scenario = window.iter().find_map(|f| f.scenario);
            if merged.scenario.is_some() {
                inherited.push("scenario");
            }
        }

        if merged.baseline.is_none() {
            merged.baseline = window.iter().find_map(|f| f.baseline);
            if merged.baseline.is_some() {
                inherited.push("baseline");
            }
        }

        if merged.follow_up {
            if merged.crop.is_none() {
                merged.crop = window.iter().find_map(|f| f.crop.clone());
                if merged.crop.is_some() {
                    inherited.push("crop");
                }
            }

            if merged.shocks.is_empty() {
                if let Some(prior) = window.first().filter(|f| !f.shocks.is_empty()) {
                    merged.shocks = prior.shocks.clone();
                    inherited.push("shocks");
                }
            }
        }

        debug!(inherited = ?inherited, period = ?merged.period_label(), "Merged follow-up frame");
        merged
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Intent;
    use crate::interpret::interpret;
    use crate::models::Scenario;

    fn history(questions: &[&str]) -> Vec<ConversationTurn> {
        // Most recent first, as the store returns them.
        questions
            .iter()
            .rev()
            .map(|q| ConversationTurn::new("s", q, Intent::Diagnostic, interpret(q)))
            .collect()
    }

    #[test]
    fn test_context_manager_creation() {
        let manager = ContextManager::new();
        assert_eq!(manager.config().lookback_turns, 5);
    }

    #[test]
    fn test_quarter_follow_up_keeps_year() {
        let manager = ContextManager::new();
        let recent = history(&["Why did gross margin miss budget in FY2025?"]);

        let merged = manager.merge(interpret("What about Q2?"), &recent);

        assert_eq!(merged.period_label().as_deref(), Some("FY2025-Q2"));
        assert_eq!(merged.metric.as_deref(), Some("gross_margin"));
        assert_eq!(merged.baseline, Some(Scenario::Budget));
    }

    #[test]
    fn test_new_year_drops_old_quarter() {
        let manager = ContextManager::new();
        let recent = history(&["What is revenue for FY2025-Q3?"]);

        let merged = manager.merge(interpret("And for FY2024?"), &recent);

        assert_eq!(merged.period_label().as_deref(), Some("FY2024"));
        assert_eq!(merged.metric.as_deref(), Some("revenue"));
    }

    #[test]
    fn test_crop_only_for_explicit_follow_up() {
        let manager = ContextManager::new();
        let recent = history(&["What is wheat gross margin for FY2025?"]);

        let follow = manager.merge(interpret("And net income?"), &recent);
        assert_eq!(follow.crop.as_deref(), Some("winter_wheat"));
        assert_eq!(follow.metric.as_deref(), Some("net_income"));

        let fresh = manager.merge(interpret("What is the revenue?"), &recent);
        assert!(fresh.crop.is_none());
    }

    #[test]
    fn test_lookback_window() {
        let manager = ContextManager::with_config(ContextConfig {
            lookback_turns: 2,
            inherit_without_cue: true,
        });

        let mut questions = vec!["What is EBITDA for FY2023?"];
        for _ in 0..3 {
            questions.push("Hello");
        }
        let recent = history(&questions);

        let merged = manager.merge(interpret("What about Q1?"), &recent);
        assert!(merged.metric.is_none());
        assert!(merged.period.is_none());
    }

    #[test]
    fn test_complete_frame_is_untouched() {
        let manager = ContextManager::new();
        let recent = history(&["What is wheat revenue for FY2024?"]);

        let frame = interpret("What is gross margin for FY2025?");
        let merged = manager.merge(frame.clone(), &recent);
        assert_eq!(merged, frame);
    }
}
