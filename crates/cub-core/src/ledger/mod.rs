//! Ledger store: the system of record for every task attempt, outcome,
//! and workflow transition (spec §3.3-§3.7, §4.8, §4.9).
//!
//! Laid out on disk as `{project}/.cub/ledger/{index, by-task/{id}/...,
//! by-epic/{id}/..., by-run/{id}/..., forensics/{session}.jsonl}`. Plain
//! serde structs and files, not a database -- no teacher module maps
//! directly onto this; grounded instead on the task store's atomicity
//! idiom (temp-file + rename, advisory lock) generalized from one file to
//! a small tree of files plus a derived index.

pub mod index;
pub mod model;
pub mod reader;
pub mod writer;

pub use model::{
    Attempt, ChangedField, Drift, DriftSeverity, EntrySource, EpicAggregates, EpicEntry,
    EpicSnapshot, ForensicEvent, IndexRecord, LedgerEntry, Lineage, Outcome, StateHistoryEntry,
    TaskSnapshot, TokenUsage, Verification, VerificationStatus, WorkflowStage,
};
pub use reader::{LedgerReader, LedgerStats};
pub use writer::LedgerWriter;
