//! Intake Service
//!
//! Facade over the store and the pure components. Every operation follows
//! the same cycle: load a snapshot, evaluate, write back, append activity.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::calc::{compute_calculated_fields, merge_calculated_values};
use crate::error::IntakeError;
use crate::events::ActivityEvent;
use crate::orchestrator::{CompletionOutcome, EntryOrchestrator, OrchestrationState};
use crate::resolver::{
    calculated_fields, missing_required_fields, section_progress, PacketFieldResolver,
    SectionProgress,
};
use crate::status::{evaluate_status_transition, StatusTransition, StatusTrigger};
use crate::store::{record_activity, IntakeStore};
use crate::types::*;
use crate::validation::validate_value;

/// Whether a write is an edit by the viewer or a reload of persisted values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Live,
    Reload,
}

impl SessionMode {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveOutcome {
    /// Edited keys, in key order
    pub saved_keys: Vec<String>,
    pub calculations: BTreeMap<String, CalculationResult>,
    pub transition: StatusTransition,
}

/// Read-only view of a deal for one viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealEvaluation {
    pub deal: Deal,
    pub resolved: ResolvedFieldSet,
    /// Stored values with calculated results overlaid
    pub values: FieldValues,
    pub calculations: BTreeMap<String, CalculationResult>,
    pub missing_required: Vec<FieldDefinition>,
    pub progress: Vec<SectionProgress>,
    pub orchestration: OrchestrationState,
}

impl DealEvaluation {
    pub fn is_complete(&self) -> bool {
        self.missing_required.is_empty()
    }
}

pub struct IntakeService {
    store: Arc<dyn IntakeStore>,
    resolver: PacketFieldResolver,
    orchestrator: EntryOrchestrator,
}

impl IntakeService {
    pub fn new(store: Arc<dyn IntakeStore>) -> Self {
        Self {
            resolver: PacketFieldResolver::new(store.clone()),
            orchestrator: EntryOrchestrator::new(store.clone()),
            store,
        }
    }

    pub fn orchestrator(&self) -> &EntryOrchestrator {
        &self.orchestrator
    }

    // ── Resolution ──

    pub async fn resolve_packet_fields(
        &self,
        packet_id: &str,
    ) -> Result<ResolvedFieldSet, IntakeError> {
        self.resolver.resolve(packet_id).await
    }

    /// Resolve the packet a deal is bound to.
    pub async fn resolve_deal(&self, deal_id: Uuid) -> Result<ResolvedFieldSet, IntakeError> {
        let deal = self.load_deal(deal_id).await?;
        self.resolver.resolve(&deal.packet_id).await
    }

    // ── Field writes ──

    /// Validate and persist a batch of edits, recompute calculated fields and
    /// apply the automatic revert.
    ///
    /// The batch is rejected as a whole if any edit fails validation.
    pub async fn save_field_values(
        &self,
        deal_id: Uuid,
        viewer: &ViewerIdentity,
        edits: &FieldValues,
        mode: SessionMode,
    ) -> Result<SaveOutcome, IntakeError> {
        let deal = self.load_deal(deal_id).await?;

        let orchestration = self
            .orchestrator
            .get_orchestration_state(deal_id, viewer)
            .await?;
        if !orchestration.can_edit {
            let reason = orchestration
                .banner()
                .unwrap_or_else(|| "viewer cannot edit this deal".to_string());
            return Err(IntakeError::NotAllowed(reason));
        }

        let resolved = self.resolver.resolve(&deal.packet_id).await?;
        for (key, value) in edits {
            if !resolved.is_visible(key) {
                return Err(IntakeError::validation(key, "not a field of this deal's packet"));
            }
            let field = resolved
                .field(key)
                .ok_or_else(|| IntakeError::validation(key, "field has no dictionary entry"))?;
            if field.definition.is_calculated {
                return Err(IntakeError::validation(key, "calculated fields are read-only"));
            }
            validate_value(&field.definition, value)?;
        }

        let stored = values_snapshot(&self.store.load_field_values(deal_id).await?);
        let mut merged = stored.clone();
        merged.extend(edits.iter().map(|(k, v)| (k.clone(), v.clone())));

        let calculations = compute_calculated_fields(&calculated_fields(&resolved), &merged);
        let merged = merge_calculated_values(&merged, &calculations);

        let updated_by = viewer.user_id();
        let changed_keys: Vec<String> = merged
            .iter()
            .filter(|(k, v)| stored.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        let rows: Vec<FieldValue> = changed_keys
            .iter()
            .map(|k| FieldValue::new(deal_id, k, &merged[k], updated_by))
            .collect();
        if !rows.is_empty() {
            self.store.upsert_field_values(deal_id, &rows).await?;
        }

        let transition = evaluate_status_transition(
            deal.status,
            &resolved,
            &merged,
            &StatusTrigger::FieldsEdited {
                field_keys: changed_keys.clone(),
                live: mode.is_live(),
            },
        )?;
        if transition.changed() {
            self.store
                .update_deal_status(deal_id, transition.new_status)
                .await?;
            record_activity(
                self.store.as_ref(),
                deal_id,
                ActivityEvent::StatusReverted {
                    previous_status: transition.previous_status,
                    documents_generated: transition.documents_were_generated,
                    changed_required_fields: changed_keys
                        .iter()
                        .filter(|k| resolved.is_required(k))
                        .cloned()
                        .collect(),
                },
            )
            .await;
        }

        let saved_keys: Vec<String> = edits.keys().cloned().collect();
        if !rows.is_empty() {
            let calculated_keys = changed_keys
                .iter()
                .filter(|k| calculations.get(*k).is_some_and(|r| r.computed))
                .cloned()
                .collect();
            record_activity(
                self.store.as_ref(),
                deal_id,
                ActivityEvent::FieldsUpdated {
                    field_keys: saved_keys.clone(),
                    calculated_keys,
                    updated_by,
                },
            )
            .await;
        }

        info!(
            %deal_id,
            saved = saved_keys.len(),
            written = rows.len(),
            reverted = transition.reverted,
            "Saved field values"
        );

        Ok(SaveOutcome {
            saved_keys,
            calculations,
            transition,
        })
    }

    // ── Status ──

    pub async fn mark_ready(
        &self,
        deal_id: Uuid,
        viewer: &ViewerIdentity,
    ) -> Result<StatusTransition, IntakeError> {
        self.advance_status(deal_id, viewer, StatusTrigger::MarkReady)
            .await
    }

    pub async fn mark_generated(
        &self,
        deal_id: Uuid,
        viewer: &ViewerIdentity,
    ) -> Result<StatusTransition, IntakeError> {
        self.advance_status(deal_id, viewer, StatusTrigger::MarkGenerated)
            .await
    }

    async fn advance_status(
        &self,
        deal_id: Uuid,
        viewer: &ViewerIdentity,
        trigger: StatusTrigger,
    ) -> Result<StatusTransition, IntakeError> {
        let deal = self.load_deal(deal_id).await?;
        self.require_internal(deal_id, viewer).await?;

        let resolved = self.resolver.resolve(&deal.packet_id).await?;
        let (values, _) = self.current_values(deal_id, &resolved).await?;
        let transition = evaluate_status_transition(deal.status, &resolved, &values, &trigger)?;

        self.store
            .update_deal_status(deal_id, transition.new_status)
            .await?;
        record_activity(
            self.store.as_ref(),
            deal_id,
            ActivityEvent::StatusChanged {
                from: transition.previous_status,
                to: transition.new_status,
                by: viewer.user_id(),
            },
        )
        .await;

        info!(
            %deal_id,
            from = %transition.previous_status,
            to = %transition.new_status,
            "Deal status changed"
        );
        Ok(transition)
    }

    // ── Completion ──

    pub async fn complete_section(
        &self,
        participant_id: Uuid,
        deal_id: Uuid,
    ) -> Result<CompletionOutcome, IntakeError> {
        self.orchestrator
            .complete_section(participant_id, deal_id)
            .await
    }

    // ── Evaluation ──

    pub async fn evaluate_deal(
        &self,
        deal_id: Uuid,
        viewer: &ViewerIdentity,
    ) -> Result<DealEvaluation, IntakeError> {
        let deal = self.load_deal(deal_id).await?;
        let resolved = self.resolver.resolve(&deal.packet_id).await?;
        let (values, calculations) = self.current_values(deal_id, &resolved).await?;
        let orchestration = self
            .orchestrator
            .get_orchestration_state(deal_id, viewer)
            .await?;

        let missing_required = missing_required_fields(&resolved, &values, None);
        let progress = section_progress(&resolved, &values);

        debug!(
            %deal_id,
            status = %deal.status,
            missing = missing_required.len(),
            can_edit = orchestration.can_edit,
            "Evaluated deal"
        );

        Ok(DealEvaluation {
            deal,
            resolved,
            values,
            calculations,
            missing_required,
            progress,
            orchestration,
        })
    }

    // ── Helpers ──

    async fn load_deal(&self, deal_id: Uuid) -> Result<Deal, IntakeError> {
        self.store
            .load_deal(deal_id)
            .await?
            .ok_or_else(|| IntakeError::not_found("deal", deal_id))
    }

    /// Stored values with calculated fields overlaid.
    async fn current_values(
        &self,
        deal_id: Uuid,
        resolved: &ResolvedFieldSet,
    ) -> Result<(FieldValues, BTreeMap<String, CalculationResult>), IntakeError> {
        let stored = values_snapshot(&self.store.load_field_values(deal_id).await?);
        let calculations = compute_calculated_fields(&calculated_fields(resolved), &stored);
        Ok((merge_calculated_values(&stored, &calculations), calculations))
    }

    /// Staff identities and internal roster members pass.
    async fn require_internal(
        &self,
        deal_id: Uuid,
        viewer: &ViewerIdentity,
    ) -> Result<(), IntakeError> {
        if viewer.is_staff() {
            return Ok(());
        }
        let roster = self.store.load_participants(deal_id).await?;
        let internal = roster.iter().any(|p| {
            p.is_internal()
                && match viewer {
                    ViewerIdentity::Participant { participant_id } => p.id == *participant_id,
                    ViewerIdentity::Account { user_id } => p.user_id == Some(*user_id),
                    ViewerIdentity::Staff { .. } => false,
                }
        });
        if internal {
            Ok(())
        } else {
            Err(IntakeError::NotAllowed(
                "only staff can change deal status".to_string(),
            ))
        }
    }
}
