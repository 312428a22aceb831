//! Error taxonomy for workflow operations
//!
//! Every rejection is a tagged kind the caller can match on. A rejected
//! operation never mutates the entity it targeted; `ConcurrentModification`
//! is the only kind for which the engine recommends a retry (re-read, then
//! re-apply).

use crate::validate::ValidationReport;

#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("operation not legal for {entity} in state {state}")]
    InvalidState { entity: String, state: String },

    #[error("event {event} is not defined for entity kind {kind}")]
    UnknownEvent { kind: String, event: String },

    #[error("batch {batch_id} contains {error_count} row error(s)")]
    ValidationFailed {
        batch_id: String,
        error_count: u32,
        report: ValidationReport,
    },

    #[error("commit of batch {batch_id} failed at row {row_index}: {reason}")]
    CommitFailed {
        batch_id: String,
        row_index: u32,
        reason: String,
    },

    #[error("checklist incomplete, unmet items: {missing:?}")]
    ChecklistIncomplete { missing: Vec<String> },

    #[error("a non-empty signature is required to close a case")]
    MissingSignature,

    #[error("write lost a race on {0}, re-read and retry")]
    ConcurrentModification(String),

    #[error("progress may not regress: current {current}, attempted {attempted}")]
    RegressingProgress { current: u8, attempted: u8 },

    #[error("progress {0} is outside the savable range 0..=99")]
    ProgressOutOfRange(u8),

    #[error("child {child_id} already has an open {screening_type_id} screening")]
    DuplicateActiveScreening {
        child_id: String,
        screening_type_id: String,
    },

    #[error("storage failure")]
    Store(#[from] sled::Error),

    #[error("entity encoding failure")]
    Encode(#[from] minicbor::encode::Error<std::convert::Infallible>),

    #[error("entity decoding failure")]
    Decode(#[from] minicbor::decode::Error),

    #[error("id generation failure: {0}")]
    IdGeneration(String),
}
