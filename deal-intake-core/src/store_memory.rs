//! In-process `IntakeStore` used by tests and the CLI.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;
use uuid::Uuid;

use crate::events::{ActivityEvent, RosterChanged};
use crate::store::IntakeStore;
use crate::types::*;

/// Buffered roster notifications per deal before slow subscribers lag.
const ROSTER_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct Tables {
    dictionary: HashMap<String, FieldDefinition>,
    packets: HashMap<String, Vec<String>>,
    template_maps: HashMap<String, Vec<TemplateFieldMap>>,
    deals: HashMap<Uuid, Deal>,
    values: HashMap<Uuid, BTreeMap<String, FieldValue>>,
    participants: HashMap<Uuid, DealParticipant>,
    /// deal_id → participant ids in insertion order
    rosters: HashMap<Uuid, Vec<Uuid>>,
    activity: HashMap<Uuid, Vec<ActivityEvent>>,
}

pub struct MemoryStore {
    tables: RwLock<Tables>,
    roster_channels: Mutex<HashMap<Uuid, broadcast::Sender<RosterChanged>>>,
    fail_activity: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            roster_channels: Mutex::new(HashMap::new()),
            fail_activity: AtomicBool::new(false),
        }
    }

    // ── Seeding ──

    pub async fn insert_field_definition(&self, def: FieldDefinition) {
        let mut tables = self.tables.write().await;
        tables.dictionary.insert(def.field_key.clone(), def);
    }

    pub async fn insert_packet(&self, packet_id: impl Into<String>, template_ids: Vec<String>) {
        let mut tables = self.tables.write().await;
        tables.packets.insert(packet_id.into(), template_ids);
    }

    pub async fn insert_template_field_map(&self, map: TemplateFieldMap) {
        let mut tables = self.tables.write().await;
        tables
            .template_maps
            .entry(map.template_id.clone())
            .or_default()
            .push(map);
    }

    pub async fn insert_deal(&self, deal: Deal) {
        let mut tables = self.tables.write().await;
        tables.deals.insert(deal.id, deal);
    }

    /// Insert or replace a participant and notify roster subscribers.
    pub async fn insert_participant(&self, participant: DealParticipant) {
        let change =
            RosterChanged::updated(participant.deal_id, participant.id, participant.status);
        {
            let mut tables = self.tables.write().await;
            let roster = tables.rosters.entry(participant.deal_id).or_default();
            if !roster.contains(&participant.id) {
                roster.push(participant.id);
            }
            tables.participants.insert(participant.id, participant);
        }
        self.publish(change);
    }

    /// Make every subsequent `append_activity` fail. Exercises fire-and-forget callers.
    pub fn set_activity_failure(&self, fail: bool) {
        self.fail_activity.store(fail, Ordering::SeqCst);
    }

    fn roster_sender(&self, deal_id: Uuid) -> broadcast::Sender<RosterChanged> {
        let mut channels = self
            .roster_channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(deal_id)
            .or_insert_with(|| broadcast::channel(ROSTER_CHANNEL_CAPACITY).0)
            .clone()
    }

    fn publish(&self, change: RosterChanged) {
        // No subscribers is not an error.
        let _ = self.roster_sender(change.deal_id).send(change);
    }
}

#[async_trait]
impl IntakeStore for MemoryStore {
    async fn load_field_dictionary(&self, field_keys: &[String]) -> Result<Vec<FieldDefinition>> {
        let tables = self.tables.read().await;
        Ok(field_keys
            .iter()
            .filter_map(|key| tables.dictionary.get(key).cloned())
            .collect())
    }

    async fn load_packet_templates(&self, packet_id: &str) -> Result<Vec<String>> {
        let tables = self.tables.read().await;
        Ok(tables.packets.get(packet_id).cloned().unwrap_or_default())
    }

    async fn load_template_field_maps(
        &self,
        template_ids: &[String],
    ) -> Result<Vec<TemplateFieldMap>> {
        let tables = self.tables.read().await;
        Ok(template_ids
            .iter()
            .filter_map(|id| tables.template_maps.get(id))
            .flatten()
            .cloned()
            .collect())
    }

    async fn load_deal(&self, deal_id: Uuid) -> Result<Option<Deal>> {
        let tables = self.tables.read().await;
        Ok(tables.deals.get(&deal_id).cloned())
    }

    async fn update_deal_status(&self, deal_id: Uuid, status: DealStatus) -> Result<()> {
        let mut tables = self.tables.write().await;
        let deal = tables
            .deals
            .get_mut(&deal_id)
            .ok_or_else(|| anyhow!("deal {deal_id} not found"))?;
        deal.status = status;
        deal.status_changed_at = Utc::now();
        Ok(())
    }

    async fn load_field_values(&self, deal_id: Uuid) -> Result<Vec<FieldValue>> {
        let tables = self.tables.read().await;
        Ok(tables
            .values
            .get(&deal_id)
            .map(|values| values.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_field_values(&self, deal_id: Uuid, values: &[FieldValue]) -> Result<()> {
        let mut tables = self.tables.write().await;
        let stored = tables.values.entry(deal_id).or_default();
        for value in values {
            stored.insert(value.field_key.clone(), value.clone());
        }
        Ok(())
    }

    async fn load_participants(&self, deal_id: Uuid) -> Result<Vec<DealParticipant>> {
        let tables = self.tables.read().await;
        Ok(tables
            .rosters
            .get(&deal_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.participants.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn load_participant(&self, participant_id: Uuid) -> Result<Option<DealParticipant>> {
        let tables = self.tables.read().await;
        Ok(tables.participants.get(&participant_id).cloned())
    }

    async fn update_participant_status(
        &self,
        participant_id: Uuid,
        status: ParticipantStatus,
    ) -> Result<()> {
        let change = {
            let mut tables = self.tables.write().await;
            let participant = tables
                .participants
                .get_mut(&participant_id)
                .ok_or_else(|| anyhow!("participant {participant_id} not found"))?;
            if participant.status == status {
                return Ok(());
            }
            if !participant.status.can_transition_to(status) {
                bail!(
                    "participant {participant_id} cannot move from {} to {status}",
                    participant.status
                );
            }
            participant.status = status;
            if status == ParticipantStatus::Completed {
                participant.completed_at = Some(Utc::now());
            }
            RosterChanged::updated(participant.deal_id, participant_id, status)
        };
        self.publish(change);
        Ok(())
    }

    async fn complete_participant(
        &self,
        participant_id: Uuid,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<DealParticipant>> {
        let updated = {
            let mut tables = self.tables.write().await;
            let participant = tables
                .participants
                .get_mut(&participant_id)
                .ok_or_else(|| anyhow!("participant {participant_id} not found"))?;
            if participant.is_completed() {
                return Ok(None);
            }
            participant.status = ParticipantStatus::Completed;
            participant.completed_at = Some(completed_at);
            participant.clone()
        };
        self.publish(RosterChanged::updated(
            updated.deal_id,
            updated.id,
            updated.status,
        ));
        Ok(Some(updated))
    }

    fn subscribe_participant_changes(&self, deal_id: Uuid) -> BoxStream<'static, RosterChanged> {
        let rx = self.roster_sender(deal_id).subscribe();
        BroadcastStream::new(rx)
            .map(move |item| match item {
                Ok(change) => change,
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    warn!(%deal_id, missed, "Roster subscriber lagged, forcing resync");
                    RosterChanged::resync(deal_id)
                }
            })
            .boxed()
    }

    async fn append_activity(&self, deal_id: Uuid, event: &ActivityEvent) -> Result<u64> {
        if self.fail_activity.load(Ordering::SeqCst) {
            return Err(anyhow!("activity sink unavailable"));
        }
        let mut tables = self.tables.write().await;
        let log = tables.activity.entry(deal_id).or_default();
        log.push(event.clone());
        Ok(log.len() as u64 - 1)
    }

    async fn read_activity(
        &self,
        deal_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, ActivityEvent)>> {
        let tables = self.tables.read().await;
        Ok(tables
            .activity
            .get(&deal_id)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .skip(from_seq as usize)
                    .map(|(seq, event)| (seq as u64, event.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
