//! Transition table
//!
//! The single pure answer to "is this move legal". No I/O and no clock: the
//! engine decides *when* an event fires (policy), this module only decides
//! *whether* the machine allows it from the current state. Total over the
//! declared event set per kind; an event from another kind's vocabulary is
//! `UnknownEvent`, a declared event fired from the wrong state is
//! `IllegalTransition`.

use crate::case::CaseState;
use crate::consent::ConsentState;
use crate::import::BatchState;
use crate::screening::ScreeningState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Screening,
    Consent,
    ImportBatch,
    CaseFile,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Screening => write!(f, "Screening"),
            Self::Consent => write!(f, "Consent"),
            Self::ImportBatch => write!(f, "ImportBatch"),
            Self::CaseFile => write!(f, "CaseFile"),
        }
    }
}

/// Every event any workflow understands. Kinds share one namespace so the
/// table can reject an event that belongs to a different machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowEvent {
    // screening
    Start,
    SaveProgress,
    Complete,
    // consent
    Grant,
    AutoGrant,
    Deny,
    Expire,
    // import
    ValidatePass,
    ValidateFail,
    BeginCommit,
    CommitApplied,
    CommitFailed,
    // case
    ChooseClosure,
    Finalize,
}

impl WorkflowEvent {
    fn kind(&self) -> EntityKind {
        use WorkflowEvent::*;
        match self {
            Start | SaveProgress | Complete => EntityKind::Screening,
            Grant | AutoGrant | Deny | Expire => EntityKind::Consent,
            ValidatePass | ValidateFail | BeginCommit | CommitApplied | CommitFailed => {
                EntityKind::ImportBatch
            }
            ChooseClosure | Finalize => EntityKind::CaseFile,
        }
    }
}

impl std::fmt::Display for WorkflowEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Current state of any workflow entity, tagged by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Screening(ScreeningState),
    Consent(ConsentState),
    Import(BatchState),
    Case(CaseState),
}

impl EntityState {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Screening(_) => EntityKind::Screening,
            Self::Consent(_) => EntityKind::Consent,
            Self::Import(_) => EntityKind::ImportBatch,
            Self::Case(_) => EntityKind::CaseFile,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Screening(s) => s.is_terminal(),
            Self::Consent(s) => s.is_terminal(),
            Self::Import(s) => s.is_terminal(),
            Self::Case(s) => s.is_terminal(),
        }
    }
}

impl std::fmt::Display for EntityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Screening(s) => s.fmt(f),
            Self::Consent(s) => s.fmt(f),
            Self::Import(s) => s.fmt(f),
            Self::Case(s) => s.fmt(f),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("event {event} is not defined for {kind}")]
    UnknownEvent { kind: EntityKind, event: WorkflowEvent },
    #[error("{kind} cannot apply {event} from state {state}")]
    IllegalTransition {
        kind: EntityKind,
        state: EntityState,
        event: WorkflowEvent,
    },
}

/// Resolve one move. Pure and total: every `(state, event)` pair yields a
/// next state or a typed rejection.
pub fn transition(
    state: EntityState,
    event: WorkflowEvent,
) -> Result<EntityState, TransitionError> {
    let kind = state.kind();
    if event.kind() != kind {
        return Err(TransitionError::UnknownEvent { kind, event });
    }

    let next = match (state, event) {
        (EntityState::Screening(s), e) => screening(s, e).map(EntityState::Screening),
        (EntityState::Consent(s), e) => consent(s, e).map(EntityState::Consent),
        (EntityState::Import(s), e) => import(s, e).map(EntityState::Import),
        (EntityState::Case(s), e) => case(s, e).map(EntityState::Case),
    };

    next.ok_or(TransitionError::IllegalTransition { kind, state, event })
}

fn screening(state: ScreeningState, event: WorkflowEvent) -> Option<ScreeningState> {
    use ScreeningState::*;
    use WorkflowEvent::*;
    match (state, event) {
        (NotStarted, Start) => Some(InProgress),
        (InProgress, SaveProgress) => Some(InProgress),
        (InProgress, Complete) => Some(Completed),
        _ => None,
    }
}

fn consent(state: ConsentState, event: WorkflowEvent) -> Option<ConsentState> {
    use ConsentState::*;
    use WorkflowEvent::*;
    match (state, event) {
        (Pending, Grant) => Some(Granted),
        (Pending, AutoGrant) => Some(Granted),
        (Pending, Deny) => Some(Denied),
        (Granted, Expire) => Some(Expired),
        // no Granted -> Denied edge: an auto-grant cannot be reverted by a
        // late explicit deny
        _ => None,
    }
}

fn import(state: BatchState, event: WorkflowEvent) -> Option<BatchState> {
    use BatchState::*;
    use WorkflowEvent::*;
    match (state, event) {
        (Validating, ValidatePass) => Some(ReadyToCommit),
        (Validating, ValidateFail) => Some(Failed),
        (ReadyToCommit, BeginCommit) => Some(Committing),
        (Committing, CommitApplied) => Some(Committed),
        (Committing, CommitFailed) => Some(Failed),
        _ => None,
    }
}

fn case(state: CaseState, event: WorkflowEvent) -> Option<CaseState> {
    use CaseState::*;
    use WorkflowEvent::*;
    match (state, event) {
        (Active, ChooseClosure) => Some(PendingClosure),
        (PendingClosure, Finalize) => Some(Closed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screening_happy_path() {
        let s = transition(
            EntityState::Screening(ScreeningState::NotStarted),
            WorkflowEvent::Start,
        )
        .unwrap();
        assert_eq!(s, EntityState::Screening(ScreeningState::InProgress));

        let s = transition(s, WorkflowEvent::SaveProgress).unwrap();
        let s = transition(s, WorkflowEvent::SaveProgress).unwrap();
        let s = transition(s, WorkflowEvent::Complete).unwrap();
        assert_eq!(s, EntityState::Screening(ScreeningState::Completed));
        assert!(s.is_terminal());
    }

    #[test]
    fn completed_screening_accepts_nothing() {
        let done = EntityState::Screening(ScreeningState::Completed);
        for event in [
            WorkflowEvent::Start,
            WorkflowEvent::SaveProgress,
            WorkflowEvent::Complete,
        ] {
            assert!(matches!(
                transition(done, event),
                Err(TransitionError::IllegalTransition { .. })
            ));
        }
    }

    #[test]
    fn foreign_event_is_unknown_not_illegal() {
        let err = transition(
            EntityState::Screening(ScreeningState::InProgress),
            WorkflowEvent::Grant,
        )
        .unwrap_err();

        assert!(matches!(err, TransitionError::UnknownEvent { .. }));
    }

    #[test]
    fn auto_grant_cannot_be_reverted_by_deny() {
        let granted = transition(
            EntityState::Consent(ConsentState::Pending),
            WorkflowEvent::AutoGrant,
        )
        .unwrap();
        assert_eq!(granted, EntityState::Consent(ConsentState::Granted));

        assert!(matches!(
            transition(granted, WorkflowEvent::Deny),
            Err(TransitionError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn granted_consent_can_expire() {
        let expired = transition(
            EntityState::Consent(ConsentState::Granted),
            WorkflowEvent::Expire,
        )
        .unwrap();
        assert_eq!(expired, EntityState::Consent(ConsentState::Expired));
        assert!(expired.is_terminal());
    }

    #[test]
    fn import_commit_path_and_failure_path() {
        let ready = transition(
            EntityState::Import(BatchState::Validating),
            WorkflowEvent::ValidatePass,
        )
        .unwrap();
        let committing = transition(ready, WorkflowEvent::BeginCommit).unwrap();
        assert_eq!(committing, EntityState::Import(BatchState::Committing));

        let committed = transition(committing, WorkflowEvent::CommitApplied).unwrap();
        assert!(committed.is_terminal());

        let failed = transition(committing, WorkflowEvent::CommitFailed).unwrap();
        assert_eq!(failed, EntityState::Import(BatchState::Failed));
    }

    #[test]
    fn failed_batch_cannot_be_committed() {
        assert!(matches!(
            transition(
                EntityState::Import(BatchState::Failed),
                WorkflowEvent::BeginCommit
            ),
            Err(TransitionError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn case_must_pass_through_pending_closure() {
        assert!(matches!(
            transition(EntityState::Case(CaseState::Active), WorkflowEvent::Finalize),
            Err(TransitionError::IllegalTransition { .. })
        ));

        let pending = transition(
            EntityState::Case(CaseState::Active),
            WorkflowEvent::ChooseClosure,
        )
        .unwrap();
        let closed = transition(pending, WorkflowEvent::Finalize).unwrap();
        assert!(closed.is_terminal());
    }
}
