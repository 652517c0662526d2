use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{DealStatus, ParticipantRole, ParticipantStatus};

/// Activity entries: the append-only audit trail for a deal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ActivityEvent {
    ParticipantAccessed {
        participant_id: Uuid,
        role: ParticipantRole,
    },
    SectionCompleted {
        participant_id: Uuid,
        role: ParticipantRole,
        completed_at: DateTime<Utc>,
        /// Next in turn order, reported for notification only
        next_participant_id: Option<Uuid>,
    },
    FieldsUpdated {
        field_keys: Vec<String>,
        calculated_keys: Vec<String>,
        updated_by: Option<Uuid>,
    },
    StatusChanged {
        from: DealStatus,
        to: DealStatus,
        by: Option<Uuid>,
    },
    /// Automatic return to draft after a required field changed while sealed.
    StatusReverted {
        previous_status: DealStatus,
        documents_generated: bool,
        changed_required_fields: Vec<String>,
    },
}

impl ActivityEvent {
    pub fn action_type(&self) -> &'static str {
        match self {
            Self::ParticipantAccessed { .. } => "participant_accessed",
            Self::SectionCompleted { .. } => "section_completed",
            Self::FieldsUpdated { .. } => "fields_updated",
            Self::StatusChanged { .. } => "status_changed",
            Self::StatusReverted { .. } => "status_reverted",
        }
    }
}

/// Push notification for any insert/update/delete on a deal's roster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterChanged {
    pub deal_id: Uuid,
    /// `None` when the feed dropped notifications and the change is unknown
    pub participant_id: Option<Uuid>,
    /// `None` when the participant row was removed or the change is unknown
    pub status: Option<ParticipantStatus>,
}

impl RosterChanged {
    pub fn updated(deal_id: Uuid, participant_id: Uuid, status: ParticipantStatus) -> Self {
        Self {
            deal_id,
            participant_id: Some(participant_id),
            status: Some(status),
        }
    }

    /// Notifications were missed; consumers must recompute from scratch.
    pub fn resync(deal_id: Uuid) -> Self {
        Self {
            deal_id,
            participant_id: None,
            status: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_event_tagging() {
        let event = ActivityEvent::StatusReverted {
            previous_status: DealStatus::Generated,
            documents_generated: true,
            changed_required_fields: vec!["property.address".into()],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["action"], event.action_type());
        assert_eq!(json["previous_status"], "generated");
    }
}
