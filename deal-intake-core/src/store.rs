use crate::events::{ActivityEvent, RosterChanged};
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tracing::warn;
use uuid::Uuid;

/// Persistence port for all deal intake state.
///
/// The resolver, orchestrator and intake service operate exclusively through
/// this trait, so the backing store is pluggable (`MemoryStore` in-process,
/// a database-backed implementation in production). No method retries; a
/// failure is surfaced to the caller before any computation starts.
#[async_trait]
pub trait IntakeStore: Send + Sync {
    // ── Field dictionary ──

    /// Bulk-load definitions for the given keys. Unknown keys are skipped.
    async fn load_field_dictionary(&self, field_keys: &[String]) -> Result<Vec<FieldDefinition>>;

    // ── Packets & templates ──

    /// Template ids of a packet in declared order. Unknown packets yield `[]`.
    async fn load_packet_templates(&self, packet_id: &str) -> Result<Vec<String>>;

    /// Field maps for the templates, in template order then insertion order.
    async fn load_template_field_maps(&self, template_ids: &[String])
        -> Result<Vec<TemplateFieldMap>>;

    // ── Deals ──

    async fn load_deal(&self, deal_id: Uuid) -> Result<Option<Deal>>;
    async fn update_deal_status(&self, deal_id: Uuid, status: DealStatus) -> Result<()>;

    // ── Field values ──

    async fn load_field_values(&self, deal_id: Uuid) -> Result<Vec<FieldValue>>;

    /// Last write wins per `(deal_id, field_key)`.
    async fn upsert_field_values(&self, deal_id: Uuid, values: &[FieldValue]) -> Result<()>;

    // ── Participants ──

    async fn load_participants(&self, deal_id: Uuid) -> Result<Vec<DealParticipant>>;
    async fn load_participant(&self, participant_id: Uuid) -> Result<Option<DealParticipant>>;

    /// Move a participant forward along `invited -> in_progress -> completed`.
    ///
    /// Writing the current status again is a no-op. Any backward move is an
    /// error and leaves the row untouched.
    async fn update_participant_status(
        &self,
        participant_id: Uuid,
        status: ParticipantStatus,
    ) -> Result<()>;

    /// Atomically move a participant to `completed`.
    ///
    /// Returns the updated row, or `None` if it was already completed. This is
    /// the compare-and-set that makes completion at-most-once.
    async fn complete_participant(
        &self,
        participant_id: Uuid,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<DealParticipant>>;

    // ── Roster notifications ──

    /// At-least-once feed of roster changes for one deal.
    fn subscribe_participant_changes(&self, deal_id: Uuid) -> BoxStream<'static, RosterChanged>;

    // ── Activity log (append-only) ──

    /// Append an activity entry and return its sequence number.
    async fn append_activity(&self, deal_id: Uuid, event: &ActivityEvent) -> Result<u64>;
    async fn read_activity(&self, deal_id: Uuid, from_seq: u64)
        -> Result<Vec<(u64, ActivityEvent)>>;
}

/// Append to the activity sink without failing the caller.
///
/// The sink is fire-and-forget: a failed append is logged and the primary
/// operation carries on.
pub async fn record_activity(store: &dyn IntakeStore, deal_id: Uuid, event: ActivityEvent) {
    if let Err(e) = store.append_activity(deal_id, &event).await {
        warn!(
            %deal_id,
            action = event.action_type(),
            error = %e,
            "Failed to append activity"
        );
    }
}
