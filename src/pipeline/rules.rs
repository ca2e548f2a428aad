//! Stage inference from an email's label set.
//!
//! Used only when a thread has no explicit `PipelineRecord`. Marker labels
//! are checked in a fixed precedence order; the first present marker wins
//! and no match falls back to `Stage::NeedsAction`.

use tracing::debug;

use crate::error::ConfigError;
use crate::pipeline::types::Stage;

/// A single marker rule: presence of `label` infers `stage`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerRule {
    pub label: String,
    pub stage: Stage,
}

/// Ordered marker rules. Pure and deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRules {
    rules: Vec<MarkerRule>,
}

/// Precedence used when nothing else is configured: awaiting reply is
/// checked before scheduled, matching the existing board behavior.
pub const DEFAULT_PRECEDENCE: [Stage; 4] = [
    Stage::AwaitingReply,
    Stage::Scheduled,
    Stage::Billing,
    Stage::Done,
];

impl Default for InferenceRules {
    fn default() -> Self {
        Self::with_precedence(DEFAULT_PRECEDENCE)
    }
}

impl InferenceRules {
    fn with_precedence(order: [Stage; 4]) -> Self {
        let rules = order
            .into_iter()
            .filter_map(|stage| {
                stage.info().marker_label.map(|label| MarkerRule {
                    label: label.to_string(),
                    stage,
                })
            })
            .collect();
        Self { rules }
    }

    /// Build rules from an explicit precedence order.
    ///
    /// `order` must name each of the four non-entry stages exactly once.
    pub fn from_order(order: &[Stage]) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: "inference_order".into(),
            message,
        };

        if order.len() != DEFAULT_PRECEDENCE.len() {
            return Err(invalid(format!(
                "expected {} stages, got {}",
                DEFAULT_PRECEDENCE.len(),
                order.len()
            )));
        }
        if order.contains(&Stage::NeedsAction) {
            return Err(invalid("needs_action is the fallback and cannot be a marker".into()));
        }
        for stage in DEFAULT_PRECEDENCE {
            if !order.contains(&stage) {
                return Err(invalid(format!("missing stage {stage}")));
            }
        }

        let mut fixed = DEFAULT_PRECEDENCE;
        fixed.copy_from_slice(order);
        Ok(Self::with_precedence(fixed))
    }

    /// Parse a comma-separated precedence list such as
    /// `"scheduled,awaiting_reply,billing,done"`.
    pub fn parse_order(spec: &str) -> Result<Self, ConfigError> {
        let stages = spec
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<Stage>().map_err(|message| ConfigError::InvalidValue {
                    key: "inference_order".into(),
                    message,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_order(&stages)
    }

    /// Replace the marker label for a stage.
    pub fn with_marker(mut self, stage: Stage, label: impl Into<String>) -> Self {
        let label = label.into();
        if let Some(rule) = self.rules.iter_mut().find(|r| r.stage == stage) {
            rule.label = label;
        }
        self
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[MarkerRule] {
        &self.rules
    }

    /// Stages in evaluation order.
    pub fn precedence(&self) -> Vec<Stage> {
        self.rules.iter().map(|r| r.stage).collect()
    }

    /// Infer a stage from a label set.
    pub fn infer<S: AsRef<str>>(&self, labels: &[S]) -> Stage {
        self.infer_with_match(labels).0
    }

    /// Infer a stage and report which marker label decided it.
    pub fn infer_with_match<S: AsRef<str>>(&self, labels: &[S]) -> (Stage, Option<&str>) {
        for rule in &self.rules {
            if labels.iter().any(|l| l.as_ref() == rule.label) {
                debug!(label = %rule.label, stage = %rule.stage, "Marker label matched");
                return (rule.stage, Some(rule.label.as_str()));
            }
        }
        (Stage::NeedsAction, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_labels_are_needs_action() {
        let rules = InferenceRules::default();
        let empty: Vec<String> = Vec::new();
        assert_eq!(rules.infer(&empty), Stage::NeedsAction);
    }

    #[test]
    fn each_marker_infers_its_stage() {
        let rules = InferenceRules::default();
        assert_eq!(rules.infer(&labels(&["Venter på svar"])), Stage::AwaitingReply);
        assert_eq!(rules.infer(&labels(&["I kalender"])), Stage::Scheduled);
        assert_eq!(rules.infer(&labels(&["Finance"])), Stage::Billing);
        assert_eq!(rules.infer(&labels(&["Afsluttet"])), Stage::Done);
    }

    #[test]
    fn unrelated_labels_fall_back() {
        let rules = InferenceRules::default();
        assert_eq!(rules.infer(&labels(&["INBOX", "Lead", "finance"])), Stage::NeedsAction);
    }

    #[test]
    fn default_precedence_prefers_awaiting_over_scheduled() {
        let rules = InferenceRules::default();
        let both = labels(&["I kalender", "Venter på svar"]);
        assert_eq!(rules.infer(&both), Stage::AwaitingReply);
        assert_eq!(rules.precedence(), DEFAULT_PRECEDENCE.to_vec());
    }

    #[test]
    fn custom_precedence_can_prefer_scheduled() {
        let rules = InferenceRules::parse_order("scheduled, awaiting_reply, billing, done").unwrap();
        let both = labels(&["Venter på svar", "I kalender"]);
        assert_eq!(rules.infer(&both), Stage::Scheduled);
    }

    #[test]
    fn inference_is_deterministic() {
        let rules = InferenceRules::default();
        let set = labels(&["Finance", "Afsluttet", "Lead"]);
        let first = rules.infer(&set);
        for _ in 0..10 {
            assert_eq!(rules.infer(&set), first);
        }
        assert_eq!(first, Stage::Billing);
    }

    #[test]
    fn reports_matching_marker() {
        let rules = InferenceRules::default();
        let (stage, marker) = rules.infer_with_match(&labels(&["Afsluttet"]));
        assert_eq!(stage, Stage::Done);
        assert_eq!(marker, Some("Afsluttet"));
        let (_, none) = rules.infer_with_match(&labels(&["x"]));
        assert!(none.is_none());
    }

    #[test]
    fn custom_marker_label() {
        let rules = InferenceRules::default().with_marker(Stage::Billing, "Invoiced");
        assert_eq!(rules.infer(&labels(&["Invoiced"])), Stage::Billing);
        assert_eq!(rules.infer(&labels(&["Finance"])), Stage::NeedsAction);
    }

    #[test]
    fn rejects_bad_orders() {
        assert!(InferenceRules::parse_order("scheduled,billing").is_err());
        assert!(InferenceRules::parse_order("needs_action,scheduled,billing,done").is_err());
        assert!(InferenceRules::parse_order("scheduled,scheduled,billing,done").is_err());
        assert!(InferenceRules::parse_order("scheduled,waiting,billing,done").is_err());
    }
}
