//! Entry Orchestration
//!
//! Decides which party may edit a deal's fields right now. In parallel mode
//! every open external participant may edit; in sequential mode only the
//! participant holding the current turn may. Internal staff are never gated.
//!
//! State is always recomputed from the full roster. Nothing here is cached
//! across roster changes.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::IntakeError;
use crate::events::ActivityEvent;
use crate::store::{record_activity, IntakeStore};
use crate::types::{DealParticipant, ParticipantStatus, ViewerIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationMode {
    Parallel,
    Sequential,
}

/// Sequential iff any participant carries a turn order.
pub fn collaboration_mode(roster: &[DealParticipant]) -> CollaborationMode {
    if roster.iter().any(|p| p.sequence_order.is_some()) {
        CollaborationMode::Sequential
    } else {
        CollaborationMode::Parallel
    }
}

/// Turn position. Unordered participants in a sequential deal go after everyone.
fn turn_rank(participant: &DealParticipant) -> i64 {
    participant
        .sequence_order
        .map(i64::from)
        .unwrap_or(i64::MAX)
}

/// The open participant with the lowest turn order, in sequential mode only.
pub fn active_participant(roster: &[DealParticipant]) -> Option<&DealParticipant> {
    if collaboration_mode(roster) != CollaborationMode::Sequential {
        return None;
    }
    roster
        .iter()
        .filter(|p| !p.is_completed())
        .min_by_key(|p| turn_rank(p))
}

/// The nearest open predecessor of `viewer`: the highest turn order strictly
/// below the viewer's among participants that have not completed.
pub fn blocking_participant<'a>(
    roster: &'a [DealParticipant],
    viewer: &DealParticipant,
) -> Option<&'a DealParticipant> {
    let viewer_rank = turn_rank(viewer);
    roster
        .iter()
        .filter(|p| p.id != viewer.id && !p.is_completed())
        .filter(|p| turn_rank(p) < viewer_rank)
        .max_by_key(|p| turn_rank(p))
}

/// The open participant with the lowest turn order strictly after `completer`.
pub fn next_participant<'a>(
    roster: &'a [DealParticipant],
    completer: &DealParticipant,
) -> Option<&'a DealParticipant> {
    let completer_rank = turn_rank(completer);
    roster
        .iter()
        .filter(|p| p.id != completer.id && !p.is_completed())
        .filter(|p| turn_rank(p) > completer_rank)
        .min_by_key(|p| turn_rank(p))
}

/// What one viewer may do on a deal right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub mode: CollaborationMode,
    pub can_edit: bool,
    /// Waiting for an earlier participant; informational, not an error
    pub is_waiting: bool,
    pub blocking_participant: Option<DealParticipant>,
    pub has_completed: bool,
    pub active_participant: Option<DealParticipant>,
    /// The viewer's own roster row, if any
    pub viewer: Option<DealParticipant>,
}

impl OrchestrationState {
    /// Informational banner text for the viewer, if any applies.
    pub fn banner(&self) -> Option<String> {
        if self.has_completed {
            return Some("You have completed your section. Fields are read-only.".to_string());
        }
        if self.is_waiting {
            return Some(match &self.blocking_participant {
                Some(p) => format!("Waiting for the {} to complete their section.", p.role),
                None => "Waiting for an earlier participant to complete their section.".to_string(),
            });
        }
        None
    }
}

fn find_viewer<'a>(
    roster: &'a [DealParticipant],
    viewer: &ViewerIdentity,
) -> Result<Option<&'a DealParticipant>, IntakeError> {
    match viewer {
        ViewerIdentity::Staff { user_id } => {
            Ok(roster.iter().find(|p| p.user_id == Some(*user_id)))
        }
        ViewerIdentity::Participant { participant_id } => roster
            .iter()
            .find(|p| p.id == *participant_id)
            .map(Some)
            .ok_or_else(|| IntakeError::not_found("participant", participant_id)),
        ViewerIdentity::Account { user_id } => roster
            .iter()
            .find(|p| p.user_id == Some(*user_id))
            .map(Some)
            .ok_or_else(|| IntakeError::not_found("participant for user", user_id)),
    }
}

/// Apply the permission contract to one viewer.
///
/// External viewers that are not on the roster are `NotFound`.
pub fn evaluate_orchestration(
    roster: &[DealParticipant],
    viewer: &ViewerIdentity,
) -> Result<OrchestrationState, IntakeError> {
    let mode = collaboration_mode(roster);
    let active = active_participant(roster).cloned();
    let own = find_viewer(roster, viewer)?;

    let mut state = OrchestrationState {
        mode,
        can_edit: false,
        is_waiting: false,
        blocking_participant: None,
        has_completed: own.is_some_and(|p| p.is_completed()),
        active_participant: active.clone(),
        viewer: own.cloned(),
    };

    let is_internal = viewer.is_staff() || own.is_some_and(|p| p.is_internal());
    if is_internal {
        state.can_edit = true;
        return Ok(state);
    }

    // Externals always resolve to a roster row (find_viewer errors otherwise).
    let Some(participant) = own else {
        return Ok(state);
    };

    if participant.is_completed() {
        return Ok(state);
    }

    match mode {
        CollaborationMode::Parallel => state.can_edit = true,
        CollaborationMode::Sequential => {
            if active.as_ref().is_some_and(|a| a.id == participant.id) {
                state.can_edit = true;
            } else {
                state.is_waiting = true;
                state.blocking_participant = blocking_participant(roster, participant).cloned();
            }
        }
    }

    Ok(state)
}

/// Result of a successful section completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionOutcome {
    pub success: bool,
    pub participant: DealParticipant,
    /// Next in turn order, for notification. Their state is not changed here.
    pub next_participant: Option<DealParticipant>,
}

/// Store-backed orchestration operations.
pub struct EntryOrchestrator {
    store: Arc<dyn IntakeStore>,
}

impl EntryOrchestrator {
    pub fn new(store: Arc<dyn IntakeStore>) -> Self {
        Self { store }
    }

    /// Recompute the viewer's state from the current roster.
    pub async fn get_orchestration_state(
        &self,
        deal_id: Uuid,
        viewer: &ViewerIdentity,
    ) -> Result<OrchestrationState, IntakeError> {
        let roster = self.store.load_participants(deal_id).await?;
        let state = evaluate_orchestration(&roster, viewer)?;
        debug!(
            %deal_id,
            mode = ?state.mode,
            can_edit = state.can_edit,
            is_waiting = state.is_waiting,
            "Evaluated orchestration state"
        );
        Ok(state)
    }

    /// First access moves an invited participant to in-progress. Other states are untouched.
    pub async fn record_access(
        &self,
        participant_id: Uuid,
    ) -> Result<DealParticipant, IntakeError> {
        let mut participant = self
            .store
            .load_participant(participant_id)
            .await?
            .ok_or_else(|| IntakeError::not_found("participant", participant_id))?;

        if participant.status != ParticipantStatus::Invited {
            return Ok(participant);
        }

        self.store
            .update_participant_status(participant_id, ParticipantStatus::InProgress)
            .await?;
        participant.status = ParticipantStatus::InProgress;

        record_activity(
            self.store.as_ref(),
            participant.deal_id,
            ActivityEvent::ParticipantAccessed {
                participant_id,
                role: participant.role,
            },
        )
        .await;

        Ok(participant)
    }

    /// Mark a participant's section complete, exactly once.
    pub async fn complete_section(
        &self,
        participant_id: Uuid,
        deal_id: Uuid,
    ) -> Result<CompletionOutcome, IntakeError> {
        let participant = self
            .store
            .load_participant(participant_id)
            .await?
            .filter(|p| p.deal_id == deal_id)
            .ok_or_else(|| IntakeError::not_found("participant", participant_id))?;

        if participant.is_completed() {
            return Err(IntakeError::AlreadyCompleted(participant_id));
        }

        // The store's compare-and-set decides races between concurrent attempts.
        let completed = self
            .store
            .complete_participant(participant_id, Utc::now())
            .await?
            .ok_or(IntakeError::AlreadyCompleted(participant_id))?;

        let roster = self.store.load_participants(deal_id).await?;
        let next = match collaboration_mode(&roster) {
            CollaborationMode::Sequential => next_participant(&roster, &completed).cloned(),
            CollaborationMode::Parallel => None,
        };

        record_activity(
            self.store.as_ref(),
            deal_id,
            ActivityEvent::SectionCompleted {
                participant_id,
                role: completed.role,
                completed_at: completed.completed_at.unwrap_or_else(Utc::now),
                next_participant_id: next.as_ref().map(|p| p.id),
            },
        )
        .await;

        info!(
            %deal_id,
            %participant_id,
            role = %completed.role,
            next = ?next.as_ref().map(|p| p.id),
            "Participant completed section"
        );

        Ok(CompletionOutcome {
            success: true,
            participant: completed,
            next_participant: next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use crate::types::ParticipantRole;

    fn sequential_roster() -> Vec<DealParticipant> {
        let deal_id = Uuid::new_v4();
        vec![
            DealParticipant::new(deal_id, ParticipantRole::Broker)
                .with_sequence(1)
                .with_status(ParticipantStatus::Completed),
            DealParticipant::new(deal_id, ParticipantRole::Borrower)
                .with_sequence(2)
                .with_status(ParticipantStatus::InProgress),
            DealParticipant::new(deal_id, ParticipantRole::Lender).with_sequence(3),
        ]
    }

    fn as_viewer(p: &DealParticipant) -> ViewerIdentity {
        ViewerIdentity::Participant {
            participant_id: p.id,
        }
    }

    #[test]
    fn test_sequential_gating() {
        let roster = sequential_roster();
        assert_eq!(collaboration_mode(&roster), CollaborationMode::Sequential);
        assert_eq!(active_participant(&roster).unwrap().id, roster[1].id);

        let third = evaluate_orchestration(&roster, &as_viewer(&roster[2])).unwrap();
        assert!(!third.can_edit);
        assert!(third.is_waiting);
        assert_eq!(third.blocking_participant.unwrap().id, roster[1].id);

        let second = evaluate_orchestration(&roster, &as_viewer(&roster[1])).unwrap();
        assert!(second.can_edit);
        assert!(!second.is_waiting);

        let first = evaluate_orchestration(&roster, &as_viewer(&roster[0])).unwrap();
        assert!(!first.can_edit);
        assert!(first.has_completed);
        assert!(!first.is_waiting);
    }

    #[test]
    fn test_blocking_participant_is_nearest_predecessor() {
        let deal_id = Uuid::new_v4();
        let roster = vec![
            DealParticipant::new(deal_id, ParticipantRole::Broker).with_sequence(1),
            DealParticipant::new(deal_id, ParticipantRole::Borrower).with_sequence(2),
            DealParticipant::new(deal_id, ParticipantRole::Lender).with_sequence(3),
        ];
        let blocker = blocking_participant(&roster, &roster[2]).unwrap();
        assert_eq!(blocker.id, roster[1].id);
        assert!(blocking_participant(&roster, &roster[0]).is_none());
    }

    #[test]
    fn test_parallel_mode_all_open_participants_edit() {
        let deal_id = Uuid::new_v4();
        let roster = vec![
            DealParticipant::new(deal_id, ParticipantRole::Broker),
            DealParticipant::new(deal_id, ParticipantRole::Borrower)
                .with_status(ParticipantStatus::InProgress),
            DealParticipant::new(deal_id, ParticipantRole::Lender)
                .with_status(ParticipantStatus::Completed),
        ];
        assert_eq!(collaboration_mode(&roster), CollaborationMode::Parallel);
        assert!(active_participant(&roster).is_none());

        for p in &roster[..2] {
            let state = evaluate_orchestration(&roster, &as_viewer(p)).unwrap();
            assert!(state.can_edit);
            assert!(!state.is_waiting);
        }
        let done = evaluate_orchestration(&roster, &as_viewer(&roster[2])).unwrap();
        assert!(!done.can_edit);
        assert!(done.banner().is_some());
    }

    #[test]
    fn test_staff_always_edit() {
        let roster = sequential_roster();
        let state =
            evaluate_orchestration(&roster, &ViewerIdentity::Staff { user_id: Uuid::new_v4() })
                .unwrap();
        assert!(state.can_edit);
        assert!(!state.is_waiting);
        assert!(state.viewer.is_none());
    }

    #[test]
    fn test_internal_roster_member_is_never_blocked() {
        let mut roster = sequential_roster();
        let deal_id = roster[0].deal_id;
        roster.push(DealParticipant::new(deal_id, ParticipantRole::Staff).with_sequence(9));
        let state = evaluate_orchestration(&roster, &as_viewer(&roster[3])).unwrap();
        assert!(state.can_edit);
        assert!(!state.is_waiting);
    }

    #[test]
    fn test_account_viewer_matches_user_id() {
        let user_id = Uuid::new_v4();
        let deal_id = Uuid::new_v4();
        let roster =
            vec![DealParticipant::new(deal_id, ParticipantRole::Borrower).with_user(user_id)];
        let state = evaluate_orchestration(&roster, &ViewerIdentity::Account { user_id }).unwrap();
        assert!(state.can_edit);

        let stranger = evaluate_orchestration(
            &roster,
            &ViewerIdentity::Account {
                user_id: Uuid::new_v4(),
            },
        );
        assert!(matches!(stranger, Err(IntakeError::NotFound { .. })));
    }

    #[test]
    fn test_unordered_participant_goes_last_in_sequential_mode() {
        let deal_id = Uuid::new_v4();
        let roster = vec![
            DealParticipant::new(deal_id, ParticipantRole::Broker)
                .with_sequence(1)
                .with_status(ParticipantStatus::Completed),
            DealParticipant::new(deal_id, ParticipantRole::Lender),
        ];
        assert_eq!(active_participant(&roster).unwrap().id, roster[1].id);
        assert!(next_participant(&roster, &roster[0]).is_some());
    }

    #[test]
    fn test_next_participant_skips_completed() {
        let deal_id = Uuid::new_v4();
        let roster = vec![
            DealParticipant::new(deal_id, ParticipantRole::Broker).with_sequence(1),
            DealParticipant::new(deal_id, ParticipantRole::Borrower)
                .with_sequence(2)
                .with_status(ParticipantStatus::Completed),
            DealParticipant::new(deal_id, ParticipantRole::Lender).with_sequence(3),
        ];
        assert_eq!(next_participant(&roster, &roster[0]).unwrap().id, roster[2].id);
        assert!(next_participant(&roster, &roster[2]).is_none());
    }

    #[tokio::test]
    async fn test_complete_section_twice_fails() {
        let store = Arc::new(MemoryStore::new());
        let roster = sequential_roster();
        let deal_id = roster[0].deal_id;
        for p in &roster {
            store.insert_participant(p.clone()).await;
        }
        let orchestrator = EntryOrchestrator::new(store.clone());

        let outcome = orchestrator
            .complete_section(roster[1].id, deal_id)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.next_participant.unwrap().id, roster[2].id);

        let before = store.load_participants(deal_id).await.unwrap();
        let again = orchestrator.complete_section(roster[1].id, deal_id).await;
        assert!(matches!(again, Err(IntakeError::AlreadyCompleted(id)) if id == roster[1].id));
        assert_eq!(store.load_participants(deal_id).await.unwrap(), before);
        assert_eq!(store.read_activity(deal_id, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_section_wrong_deal_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let p = DealParticipant::new(Uuid::new_v4(), ParticipantRole::Borrower);
        store.insert_participant(p.clone()).await;
        let orchestrator = EntryOrchestrator::new(store);

        let result = orchestrator.complete_section(p.id, Uuid::new_v4()).await;
        assert!(matches!(result, Err(IntakeError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_record_access_only_moves_invited() {
        let store = Arc::new(MemoryStore::new());
        let p = DealParticipant::new(Uuid::new_v4(), ParticipantRole::Borrower);
        store.insert_participant(p.clone()).await;
        let orchestrator = EntryOrchestrator::new(store.clone());

        let accessed = orchestrator.record_access(p.id).await.unwrap();
        assert_eq!(accessed.status, ParticipantStatus::InProgress);
        let again = orchestrator.record_access(p.id).await.unwrap();
        assert_eq!(again.status, ParticipantStatus::InProgress);
        assert_eq!(store.read_activity(p.deal_id, 0).await.unwrap().len(), 1);
    }
}
