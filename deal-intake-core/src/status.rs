//! Deal status state machine: `draft → ready → generated`, with an automatic
//! return to `draft` when a required field is edited on a sealed deal.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::IntakeError;
use crate::resolver::missing_required_fields;
use crate::types::{DealStatus, FieldValues, ResolvedFieldSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum StatusTrigger {
    MarkReady,
    MarkGenerated,
    /// `live` is false when values are being reloaded rather than edited.
    FieldsEdited { field_keys: Vec<String>, live: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertNotice {
    pub severity: NoticeSeverity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub previous_status: DealStatus,
    pub new_status: DealStatus,
    pub reverted: bool,
    pub documents_were_generated: bool,
}

impl StatusTransition {
    fn unchanged(status: DealStatus) -> Self {
        Self {
            previous_status: status,
            new_status: status,
            reverted: false,
            documents_were_generated: status == DealStatus::Generated,
        }
    }

    fn to(previous: DealStatus, new_status: DealStatus) -> Self {
        Self {
            previous_status: previous,
            new_status,
            reverted: false,
            documents_were_generated: previous == DealStatus::Generated,
        }
    }

    pub fn changed(&self) -> bool {
        self.previous_status != self.new_status
    }

    pub fn revert_notice(&self) -> Option<RevertNotice> {
        if !self.reverted {
            return None;
        }
        Some(if self.documents_were_generated {
            RevertNotice {
                severity: NoticeSeverity::Critical,
                message: "A required field changed after documents were generated. \
                          The deal is back in draft and documents must be regenerated."
                    .to_string(),
            }
        } else {
            RevertNotice {
                severity: NoticeSeverity::Warning,
                message: "A required field changed. The deal is back in draft and must be \
                          marked ready again."
                    .to_string(),
            }
        })
    }
}

/// Decide the next status for `trigger`. Pure; the caller persists the result.
pub fn evaluate_status_transition(
    current: DealStatus,
    resolved: &ResolvedFieldSet,
    values: &FieldValues,
    trigger: &StatusTrigger,
) -> Result<StatusTransition, IntakeError> {
    match trigger {
        StatusTrigger::MarkReady => {
            if current != DealStatus::Draft {
                return Err(IntakeError::NotAllowed(format!(
                    "deal is already {current}"
                )));
            }
            let missing = missing_required_fields(resolved, values, None);
            if !missing.is_empty() {
                return Err(IntakeError::NotAllowed(format!(
                    "{} required fields still missing",
                    missing.len()
                )));
            }
            Ok(StatusTransition::to(current, DealStatus::Ready))
        }
        StatusTrigger::MarkGenerated => {
            if current != DealStatus::Ready {
                return Err(IntakeError::NotAllowed(format!(
                    "deal must be ready to generate documents (currently {current})"
                )));
            }
            Ok(StatusTransition::to(current, DealStatus::Generated))
        }
        StatusTrigger::FieldsEdited { field_keys, live } => {
            if !current.is_sealed() || !*live {
                return Ok(StatusTransition::unchanged(current));
            }
            let touched_required: Vec<&String> = field_keys
                .iter()
                .filter(|k| resolved.is_required(k))
                .collect();
            if touched_required.is_empty() {
                return Ok(StatusTransition::unchanged(current));
            }
            info!(
                from = %current,
                fields = ?touched_required,
                "Required field edited on sealed deal, reverting to draft"
            );
            Ok(StatusTransition {
                previous_status: current,
                new_status: DealStatus::Draft,
                reverted: true,
                documents_were_generated: current == DealStatus::Generated,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::assemble;
    use crate::types::{DataType, FieldDefinition, TemplateFieldMap};

    fn resolved() -> ResolvedFieldSet {
        let maps = vec![
            TemplateFieldMap::new("t1", "loan.amount", true),
            TemplateFieldMap::new("t1", "loan.notes", false),
        ];
        let defs = vec![
            FieldDefinition::new("loan.amount", "Amount", "loan", DataType::Currency),
            FieldDefinition::new("loan.notes", "Notes", "loan", DataType::Text),
        ];
        assemble("p1", &maps, defs)
    }

    fn edited(keys: &[&str], live: bool) -> StatusTrigger {
        StatusTrigger::FieldsEdited {
            field_keys: keys.iter().map(|k| k.to_string()).collect(),
            live,
        }
    }

    #[test]
    fn test_mark_ready_requires_all_required_fields() {
        let set = resolved();
        let err = evaluate_status_transition(
            DealStatus::Draft,
            &set,
            &FieldValues::new(),
            &StatusTrigger::MarkReady,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "not allowed: 1 required fields still missing"
        );

        let values = FieldValues::from([("loan.amount".to_string(), "250000".to_string())]);
        let t = evaluate_status_transition(
            DealStatus::Draft,
            &set,
            &values,
            &StatusTrigger::MarkReady,
        )
        .unwrap();
        assert_eq!(t.new_status, DealStatus::Ready);
        assert!(t.changed());
    }

    #[test]
    fn test_forward_edges_only_from_predecessor() {
        let set = resolved();
        let values = FieldValues::new();
        for status in [DealStatus::Ready, DealStatus::Generated] {
            let result =
                evaluate_status_transition(status, &set, &values, &StatusTrigger::MarkReady);
            assert!(result.is_err());
        }
        for status in [DealStatus::Draft, DealStatus::Generated] {
            assert!(evaluate_status_transition(
                status,
                &set,
                &values,
                &StatusTrigger::MarkGenerated
            )
            .is_err());
        }
        let t = evaluate_status_transition(
            DealStatus::Ready,
            &set,
            &values,
            &StatusTrigger::MarkGenerated,
        )
        .unwrap();
        assert_eq!(t.new_status, DealStatus::Generated);
    }

    #[test]
    fn test_required_edit_reverts_sealed_deal() {
        let set = resolved();
        let values = FieldValues::new();

        let t = evaluate_status_transition(
            DealStatus::Ready,
            &set,
            &values,
            &edited(&["loan.amount"], true),
        )
        .unwrap();
        assert!(t.reverted);
        assert_eq!(t.new_status, DealStatus::Draft);
        assert_eq!(t.revert_notice().unwrap().severity, NoticeSeverity::Warning);

        let t = evaluate_status_transition(
            DealStatus::Generated,
            &set,
            &values,
            &edited(&["loan.amount"], true),
        )
        .unwrap();
        assert!(t.documents_were_generated);
        assert_eq!(t.revert_notice().unwrap().severity, NoticeSeverity::Critical);
    }

    #[test]
    fn test_non_required_or_reload_does_not_revert() {
        let set = resolved();
        let values = FieldValues::new();

        let t = evaluate_status_transition(
            DealStatus::Ready,
            &set,
            &values,
            &edited(&["loan.notes"], true),
        )
        .unwrap();
        assert!(!t.reverted);
        assert_eq!(t.new_status, DealStatus::Ready);

        let t = evaluate_status_transition(
            DealStatus::Ready,
            &set,
            &values,
            &edited(&["loan.amount"], false),
        )
        .unwrap();
        assert!(!t.reverted);
        assert!(t.revert_notice().is_none());

        let t = evaluate_status_transition(
            DealStatus::Draft,
            &set,
            &values,
            &edited(&["loan.amount"], true),
        )
        .unwrap();
        assert!(!t.changed());
    }
}
