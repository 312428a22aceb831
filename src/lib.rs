//! Lifecycle engine for screening, consent, bulk-import and case-closure
//! workflows. See [`engine::WorkflowEngine`] for the public operations.

pub mod case;
pub mod clock;
pub mod consent;
pub mod engine;
pub mod error;
pub mod import;
pub mod policy;
pub mod screening;
pub mod store;
pub mod student;
pub mod transition;
pub mod utils;
pub mod validate;
