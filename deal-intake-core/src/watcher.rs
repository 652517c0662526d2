//! Roster Watcher
//!
//! Background task that keeps one viewer's orchestration state current while
//! other parties advance. Each roster notification triggers a full recompute;
//! the latest state is published on a `watch` channel so readers only ever
//! see the newest banner and never block the editing session.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::orchestrator::{EntryOrchestrator, OrchestrationState};
use crate::store::IntakeStore;
use crate::types::ViewerIdentity;

pub struct RosterWatcher {
    state: watch::Receiver<Option<OrchestrationState>>,
    handle: JoinHandle<()>,
}

impl RosterWatcher {
    /// Subscribe to the deal's roster feed and start recomputing.
    ///
    /// The initial state is computed before the first notification arrives.
    pub fn spawn(
        store: Arc<dyn IntakeStore>,
        deal_id: Uuid,
        viewer: ViewerIdentity,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, rx) = watch::channel(None);
        // Subscribe before the first compute so no change slips between them.
        let mut changes = store.subscribe_participant_changes(deal_id);
        let orchestrator = EntryOrchestrator::new(store);

        let handle = tokio::spawn(async move {
            info!(%deal_id, "Roster watcher started");
            recompute(&orchestrator, deal_id, &viewer, &tx).await;

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    change = changes.next() => {
                        let Some(change) = change else {
                            debug!(%deal_id, "Roster feed closed");
                            break;
                        };
                        debug!(
                            %deal_id,
                            participant_id = ?change.participant_id,
                            status = ?change.status,
                            "Roster changed"
                        );
                        recompute(&orchestrator, deal_id, &viewer, &tx).await;
                    }
                    res = shutdown.changed() => {
                        // Sender gone: treat as shutdown.
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(%deal_id, "Roster watcher stopped");
        });

        Self { state: rx, handle }
    }

    /// Latest computed state, `None` until the first recompute succeeds.
    pub fn current(&self) -> Option<OrchestrationState> {
        self.state.borrow().clone()
    }

    /// A receiver for awaiting state changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<OrchestrationState>> {
        self.state.clone()
    }

    /// Wait for the task to exit after shutdown.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!(?e, "Roster watcher task panicked");
        }
    }
}

async fn recompute(
    orchestrator: &EntryOrchestrator,
    deal_id: Uuid,
    viewer: &ViewerIdentity,
    tx: &watch::Sender<Option<OrchestrationState>>,
) {
    match orchestrator.get_orchestration_state(deal_id, viewer).await {
        Ok(state) => {
            tx.send_replace(Some(state));
        }
        Err(e) => error!(%deal_id, error = %e, "Failed to recompute orchestration state"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use crate::types::{DealParticipant, ParticipantRole, ParticipantStatus};
    use std::time::Duration;

    #[tokio::test]
    async fn test_watcher_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let deal_id = Uuid::new_v4();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let watcher = RosterWatcher::spawn(
            store,
            deal_id,
            ViewerIdentity::Staff {
                user_id: Uuid::new_v4(),
            },
            shutdown_rx,
        );
        let mut states = watcher.subscribe();
        tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| s.is_some()))
            .await
            .unwrap()
            .unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), watcher.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_watcher_stops_when_shutdown_sender_dropped() {
        let store = Arc::new(MemoryStore::new());
        let deal_id = Uuid::new_v4();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let watcher = RosterWatcher::spawn(
            store,
            deal_id,
            ViewerIdentity::Staff {
                user_id: Uuid::new_v4(),
            },
            shutdown_rx,
        );
        let mut states = watcher.subscribe();
        tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| s.is_some()))
            .await
            .unwrap()
            .unwrap();

        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(2), watcher.join())
            .await
            .expect("watcher should exit once the shutdown sender is gone");
    }

    #[tokio::test]
    async fn test_watcher_unblocks_next_participant() {
        let store = Arc::new(MemoryStore::new());
        let deal_id = Uuid::new_v4();
        let first = DealParticipant::new(deal_id, ParticipantRole::Broker).with_sequence(1);
        let second = DealParticipant::new(deal_id, ParticipantRole::Borrower).with_sequence(2);
        store.insert_participant(first.clone()).await;
        store.insert_participant(second.clone()).await;

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = RosterWatcher::spawn(
            store.clone(),
            deal_id,
            ViewerIdentity::Participant {
                participant_id: second.id,
            },
            shutdown_rx,
        );
        let mut states = watcher.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| s.as_ref().is_some_and(|s| s.is_waiting)),
        )
        .await
        .unwrap()
        .unwrap();

        store
            .update_participant_status(first.id, ParticipantStatus::Completed)
            .await
            .unwrap();

        let state = tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| s.as_ref().is_some_and(|s| s.can_edit)),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert!(!state.unwrap().is_waiting);
    }
}
