//! Deal Intake Core
//!
//! Multi-party deal data collection: which fields a document packet needs,
//! how derived date fields are computed, who may edit right now, and when a
//! deal is ready for document generation.
//!
//! # Architecture
//!
//! ```text
//! dictionary + template maps ─► PacketFieldResolver ─► ResolvedFieldSet
//!                                                        │
//! stored values ─► compute_calculated_fields ─► merged values
//!                                                        │
//! roster ─► evaluate_orchestration        evaluate_status_transition
//! ```
//!
//! The resolver, calculation engine, orchestrator and status machine are pure
//! functions over explicit snapshots. `IntakeService` and `EntryOrchestrator`
//! wrap them with an [`IntakeStore`] for the read-evaluate-write cycle, and
//! `RosterWatcher` re-runs orchestration whenever the roster changes.

pub mod calc;
pub mod catalog;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod resolver;
pub mod service;
pub mod status;
pub mod store;
pub mod store_memory;
pub mod types;
pub mod validation;
pub mod watcher;

pub use calc::{compute_calculated_fields, merge_calculated_values, Formula};
pub use catalog::{DealSnapshot, FieldCatalog};
pub use error::{FormulaError, IntakeError};
pub use events::{ActivityEvent, RosterChanged};
pub use orchestrator::{
    evaluate_orchestration, CollaborationMode, CompletionOutcome, EntryOrchestrator,
    OrchestrationState,
};
pub use resolver::{
    is_packet_complete, is_section_complete, missing_required_fields, section_progress,
    PacketFieldResolver, SectionProgress,
};
pub use service::{DealEvaluation, IntakeService, SaveOutcome, SessionMode};
pub use status::{
    evaluate_status_transition, NoticeSeverity, RevertNotice, StatusTransition, StatusTrigger,
};
pub use store::IntakeStore;
pub use store_memory::MemoryStore;
pub use types::*;
pub use watcher::RosterWatcher;
