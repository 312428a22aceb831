//! Workflow engine
//!
//! The orchestrator and the only component with business rules. Every
//! operation is synchronous read → validate → write against a single entity:
//! load a snapshot from the store, consult the transition table for legality
//! and the policy clock for timing, then write back with a compare-and-swap.
//! Losing a write race surfaces `ConcurrentModification`; the caller
//! re-reads and retries. Nothing here holds entity state between calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::case::{CaseFile, CaseState, ClosureType};
use crate::clock::{Clock, SystemClock};
use crate::consent::{ConsentDecision, ConsentRecord, ConsentState, ConsentType};
use crate::error::WorkflowError;
use crate::import::{BatchState, ConflictPolicy, ImportBatch, RawRow, RowOutcome};
use crate::policy::{WorkflowPolicy, closure_checklist, parse_grade};
use crate::screening::{Screening, ScreeningState};
use crate::store::EntityStore;
use crate::student::StudentRecord;
use crate::transition::{EntityState, TransitionError, WorkflowEvent, transition};
use crate::validate::{ValidationReport, validate_rows};

pub struct WorkflowEngine<C: Clock = SystemClock> {
    store: EntityStore,
    clock: C,
    policy: WorkflowPolicy,
}

impl WorkflowEngine<SystemClock> {
    pub fn new(db: Arc<sled::Db>) -> Self {
        Self::with_clock(db, SystemClock)
    }
}

impl<C: Clock> WorkflowEngine<C> {
    pub fn with_clock(db: Arc<sled::Db>, clock: C) -> Self {
        Self {
            store: EntityStore::new(db),
            clock,
            policy: WorkflowPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: WorkflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Transition-table guard shared by every mutating operation. Maps an
    /// illegal move onto the caller-facing taxonomy.
    fn check(
        &self,
        entity_id: &str,
        state: EntityState,
        event: WorkflowEvent,
    ) -> Result<(), WorkflowError> {
        match transition(state, event) {
            Ok(_) => Ok(()),
            Err(TransitionError::UnknownEvent { kind, event }) => Err(WorkflowError::UnknownEvent {
                kind: kind.to_string(),
                event: event.to_string(),
            }),
            Err(TransitionError::IllegalTransition { state, .. }) => {
                Err(WorkflowError::InvalidState {
                    entity: entity_id.to_string(),
                    state: state.to_string(),
                })
            }
        }
    }

    fn minted<T>(result: anyhow::Result<T>) -> Result<T, WorkflowError> {
        result.map_err(|err| WorkflowError::IdGeneration(err.to_string()))
    }

    // ------------------------------------------------------------------
    // screenings
    // ------------------------------------------------------------------

    /// Open a screening for a child. At most one open screening per type per
    /// child.
    pub fn start_screening(
        &self,
        child_id: &str,
        screening_type_id: &str,
    ) -> Result<Screening, WorkflowError> {
        let already_open = self
            .store
            .list_by_parent::<Screening>(child_id)?
            .into_iter()
            .any(|s| s.is_open() && s.screening_type_id == screening_type_id);
        if already_open {
            return Err(WorkflowError::DuplicateActiveScreening {
                child_id: child_id.to_string(),
                screening_type_id: screening_type_id.to_string(),
            });
        }

        let screening = Self::minted(Screening::start(
            child_id.to_string(),
            screening_type_id.to_string(),
            self.clock.now(),
        ))?;
        self.store.insert_new(&screening)?;

        info!(
            screening_id = %screening.screening_id,
            child_id,
            screening_type_id,
            "screening started"
        );
        Ok(screening)
    }

    /// Persist a partial answer set. Progress may hold still but never move
    /// backwards, and 100 is reserved for [`complete_screening`].
    pub fn save_progress(
        &self,
        screening_id: &str,
        responses: BTreeMap<String, String>,
        progress_percent: u8,
    ) -> Result<Screening, WorkflowError> {
        let snapshot = self.store.require::<Screening>(screening_id)?;
        self.check(
            screening_id,
            EntityState::Screening(snapshot.value.state),
            WorkflowEvent::SaveProgress,
        )?;

        if progress_percent > 99 {
            return Err(WorkflowError::ProgressOutOfRange(progress_percent));
        }
        if progress_percent < snapshot.value.progress_percent {
            return Err(WorkflowError::RegressingProgress {
                current: snapshot.value.progress_percent,
                attempted: progress_percent,
            });
        }

        let mut updated = snapshot.value.clone();
        updated.merge_responses(responses);
        updated.progress_percent = progress_percent;
        self.store.update(&snapshot, &updated)?;

        debug!(screening_id, progress_percent, "screening progress saved");
        Ok(updated)
    }

    /// Finish a screening. Terminal: responses freeze, progress pins to 100.
    pub fn complete_screening(
        &self,
        screening_id: &str,
        final_responses: BTreeMap<String, String>,
    ) -> Result<Screening, WorkflowError> {
        let snapshot = self.store.require::<Screening>(screening_id)?;
        self.check(
            screening_id,
            EntityState::Screening(snapshot.value.state),
            WorkflowEvent::Complete,
        )?;

        let mut updated = snapshot.value.clone();
        updated.merge_responses(final_responses);
        updated.progress_percent = 100;
        updated.state = ScreeningState::Completed;
        updated.completed_at = Some(self.clock.now());
        self.store.update(&snapshot, &updated)?;

        info!(screening_id, "screening completed");
        Ok(updated)
    }

    pub fn screening(&self, screening_id: &str) -> Result<Screening, WorkflowError> {
        Ok(self.store.require::<Screening>(screening_id)?.into_value())
    }

    pub fn screenings_for_child(&self, child_id: &str) -> Result<Vec<Screening>, WorkflowError> {
        self.store.list_by_parent(child_id)
    }

    /// Read-side SLA flag: an open screening counts as overdue once it has
    /// sat past the policy window.
    pub fn screening_overdue(&self, screening_id: &str) -> Result<bool, WorkflowError> {
        let screening = self.screening(screening_id)?;
        Ok(screening.is_open()
            && self
                .clock
                .has_expired(&screening.started_at, self.policy.screening_sla_days))
    }

    // ------------------------------------------------------------------
    // consents
    // ------------------------------------------------------------------

    pub fn request_consent(
        &self,
        subject_id: &str,
        consent_type: ConsentType,
    ) -> Result<ConsentRecord, WorkflowError> {
        let record = Self::minted(ConsentRecord::request(
            subject_id.to_string(),
            consent_type,
            self.clock.now(),
            self.policy.auto_consent_window_days,
        ))?;
        self.store.insert_new(&record)?;

        info!(consent_id = %record.consent_id, subject_id, "consent requested");
        Ok(record)
    }

    /// The lazy policy move a record is due for, if any. Pure with respect
    /// to the store; persisting is the caller's business.
    fn due_policy_move(
        &self,
        record: &ConsentRecord,
    ) -> Result<Option<ConsentRecord>, WorkflowError> {
        match record.state {
            ConsentState::Pending
                if self
                    .clock
                    .has_expired(&record.requested_on, record.auto_consent_window_days) =>
            {
                self.check(
                    &record.consent_id,
                    EntityState::Consent(record.state),
                    WorkflowEvent::AutoGrant,
                )?;
                let now = self.clock.now();
                let mut updated = record.clone();
                updated.state = ConsentState::Granted;
                updated.resolved_on = Some(now.clone());
                updated.valid_until = Some(now.plus_days(self.policy.consent_valid_days));
                Ok(Some(updated))
            }
            ConsentState::Granted => match &record.valid_until {
                Some(valid_until) if self.clock.now() > *valid_until => {
                    self.check(
                        &record.consent_id,
                        EntityState::Consent(record.state),
                        WorkflowEvent::Expire,
                    )?;
                    let mut updated = record.clone();
                    updated.state = ConsentState::Expired;
                    Ok(Some(updated))
                }
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    /// Apply time-based policy at read time. Idempotent: a record with no
    /// due move is returned as stored, and nothing is written.
    pub fn evaluate_consent(&self, consent_id: &str) -> Result<ConsentRecord, WorkflowError> {
        let snapshot = self.store.require::<ConsentRecord>(consent_id)?;
        match self.due_policy_move(&snapshot.value)? {
            Some(updated) => {
                self.store.update(&snapshot, &updated)?;
                warn!(
                    consent_id,
                    state = %updated.state,
                    "consent auto-resolved by policy clock"
                );
                Ok(updated)
            }
            None => {
                debug!(consent_id, state = %snapshot.value.state, "consent evaluated, no change");
                Ok(snapshot.into_value())
            }
        }
    }

    /// Explicit grant or deny. Runs the same up-to-date check as
    /// [`evaluate_consent`] first, so a record the policy clock has already
    /// auto-granted cannot be silently overridden; the late decision gets
    /// `InvalidState` instead.
    pub fn resolve_consent(
        &self,
        consent_id: &str,
        decision: ConsentDecision,
    ) -> Result<ConsentRecord, WorkflowError> {
        let snapshot = self.store.require::<ConsentRecord>(consent_id)?;

        if let Some(auto) = self.due_policy_move(&snapshot.value)? {
            // the policy move fires regardless; the explicit decision
            // arrived too late
            self.store.update(&snapshot, &auto)?;
            warn!(consent_id, state = %auto.state, "explicit decision arrived after policy window");
            return Err(WorkflowError::InvalidState {
                entity: consent_id.to_string(),
                state: auto.state.to_string(),
            });
        }

        let event = match decision {
            ConsentDecision::Grant => WorkflowEvent::Grant,
            ConsentDecision::Deny => WorkflowEvent::Deny,
        };
        self.check(
            consent_id,
            EntityState::Consent(snapshot.value.state),
            event,
        )?;

        let now = self.clock.now();
        let mut updated = snapshot.value.clone();
        updated.resolved_on = Some(now.clone());
        match decision {
            ConsentDecision::Grant => {
                updated.state = ConsentState::Granted;
                updated.valid_until = Some(now.plus_days(self.policy.consent_valid_days));
            }
            ConsentDecision::Deny => {
                updated.state = ConsentState::Denied;
            }
        }
        self.store.update(&snapshot, &updated)?;

        info!(consent_id, state = %updated.state, "consent resolved explicitly");
        Ok(updated)
    }

    pub fn consent(&self, consent_id: &str) -> Result<ConsentRecord, WorkflowError> {
        Ok(self.store.require::<ConsentRecord>(consent_id)?.into_value())
    }

    /// Full consent history for a subject. Records are never deleted, so
    /// this is the audit trail.
    pub fn consents_for_subject(
        &self,
        subject_id: &str,
    ) -> Result<Vec<ConsentRecord>, WorkflowError> {
        self.store.list_by_parent(subject_id)
    }

    // ------------------------------------------------------------------
    // imports
    // ------------------------------------------------------------------

    /// Register an upload. Rows arrive already parsed; the batch starts in
    /// Validating and is not committable until validated.
    pub fn upload_import(
        &self,
        school_id: &str,
        uploaded_filename: &str,
        rows: Vec<RawRow>,
        conflict_policy: ConflictPolicy,
    ) -> Result<ImportBatch, WorkflowError> {
        let batch = Self::minted(ImportBatch::upload(
            school_id.to_string(),
            uploaded_filename.to_string(),
            rows,
            conflict_policy,
            self.clock.now(),
        ))?;
        self.store.insert_new(&batch)?;

        info!(
            batch_id = %batch.batch_id,
            school_id,
            uploaded_filename,
            total_rows = batch.total_rows,
            "import uploaded"
        );
        Ok(batch)
    }

    /// Run the validation pipeline and record its verdicts on the batch.
    /// A clean batch moves to ReadyToCommit; row errors move it to Failed
    /// and surface the full report so the caller can correct and re-upload.
    pub fn validate_import(&self, batch_id: &str) -> Result<ValidationReport, WorkflowError> {
        let snapshot = self.store.require::<ImportBatch>(batch_id)?;
        // both verdicts are edges out of Validating; guard on the pass edge
        self.check(
            batch_id,
            EntityState::Import(snapshot.value.state),
            WorkflowEvent::ValidatePass,
        )?;

        let existing = self
            .store
            .list_by_parent::<StudentRecord>(&snapshot.value.school_id)?;
        let report = validate_rows(&snapshot.value.rows, &existing, &self.policy);

        let mut updated = snapshot.value.clone();
        for (row, verdict) in updated.rows.iter_mut().zip(&report.rows) {
            row.validation = Some(verdict.status);
            row.error_reason = verdict.reason.clone();
            row.duplicate_of = verdict.duplicate_of.clone();
        }
        updated.valid_count = report.valid_count;
        updated.warning_count = report.warning_count;
        updated.error_count = report.error_count;
        updated.duplicate_count = report.duplicate_count;
        updated.report_digest = Some(report.digest.clone());
        updated.state = if report.has_errors() {
            BatchState::Failed
        } else {
            BatchState::ReadyToCommit
        };
        self.store.update(&snapshot, &updated)?;

        if report.has_errors() {
            warn!(
                batch_id,
                error_count = report.error_count,
                "import validation failed"
            );
            return Err(WorkflowError::ValidationFailed {
                batch_id: batch_id.to_string(),
                error_count: report.error_count,
                report,
            });
        }

        info!(
            batch_id,
            valid_count = report.valid_count,
            duplicate_count = report.duplicate_count,
            "import ready to commit"
        );
        Ok(report)
    }

    /// Commit a validated batch. The move to Committing is the one-writer
    /// gate; after that, every student write plus the Committed batch state
    /// lands in a single atomic apply, so readers never observe a partial
    /// commit. Any row that cannot be materialized fails the whole batch
    /// with zero student writes.
    pub fn commit_import(&self, batch_id: &str) -> Result<ImportBatch, WorkflowError> {
        let snapshot = self.store.require::<ImportBatch>(batch_id)?;
        self.check(
            batch_id,
            EntityState::Import(snapshot.value.state),
            WorkflowEvent::BeginCommit,
        )?;

        let mut committing = snapshot.value.clone();
        committing.state = BatchState::Committing;
        self.store.update(&snapshot, &committing)?;

        match self.stage_commit(&committing) {
            Ok((write_batch, committed)) => {
                self.store.apply(write_batch)?;
                info!(batch_id, "import committed");
                Ok(committed)
            }
            Err(row_failure) => {
                let mut failed = committing.clone();
                failed.state = BatchState::Failed;
                if let Some(row) = failed
                    .rows
                    .iter_mut()
                    .find(|r| r.row_index == row_failure.row_index)
                {
                    row.error_reason = Some(row_failure.reason.clone());
                }
                let mut only_state = sled::Batch::default();
                only_state.insert(
                    failed.batch_id.as_bytes(),
                    EntityStore::encode(&failed)?,
                );
                self.store.apply(only_state)?;

                warn!(
                    batch_id,
                    row_index = row_failure.row_index,
                    reason = %row_failure.reason,
                    "import commit failed, no rows applied"
                );
                Err(WorkflowError::CommitFailed {
                    batch_id: batch_id.to_string(),
                    row_index: row_failure.row_index,
                    reason: row_failure.reason,
                })
            }
        }
    }

    /// Build the full set of row writes without touching the store. Returns
    /// the staged writes plus the final batch value, or the first row that
    /// cannot be materialized.
    fn stage_commit(
        &self,
        committing: &ImportBatch,
    ) -> Result<(sled::Batch, ImportBatch), RowFailure> {
        let now = self.clock.now();
        let existing = self
            .store
            .list_by_parent::<StudentRecord>(&committing.school_id)
            .map_err(|err| RowFailure::new(0, format!("loading existing students: {err}")))?;
        let existing_by_id: HashMap<&str, &StudentRecord> = existing
            .iter()
            .map(|student| (student.student_id.as_str(), student))
            .collect();

        let mut write_batch = sled::Batch::default();
        let mut committed = committing.clone();

        for row in committed.rows.iter_mut() {
            match &row.duplicate_of {
                Some(existing_id) => match committing.conflict_policy {
                    // Skip: the existing record stays untouched, the row is
                    // only marked
                    ConflictPolicy::Skip => {
                        row.outcome = Some(RowOutcome::Skipped);
                    }
                    ConflictPolicy::Update => {
                        let existing = existing_by_id.get(existing_id.as_str()).ok_or_else(|| {
                            RowFailure::new(
                                row.row_index,
                                format!("duplicate target {existing_id} no longer exists"),
                            )
                        })?;
                        let grade = parse_grade(&row.grade).ok_or_else(|| {
                            RowFailure::new(row.row_index, "grade no longer parseable".to_string())
                        })?;

                        let mut updated = (*existing).clone();
                        updated.name = row.name.trim().to_string();
                        updated.grade = grade;
                        updated.guardian = row.guardian.trim().to_string();
                        updated.imported_from = Some(committing.batch_id.clone());
                        updated.updated_at = now.clone();

                        let bytes = EntityStore::encode(&updated).map_err(|err| {
                            RowFailure::new(row.row_index, format!("encoding update: {err}"))
                        })?;
                        write_batch.insert(updated.student_id.as_bytes(), bytes);
                        row.outcome = Some(RowOutcome::Updated);
                    }
                },
                None => {
                    let grade = parse_grade(&row.grade).ok_or_else(|| {
                        RowFailure::new(row.row_index, "grade no longer parseable".to_string())
                    })?;
                    let student = StudentRecord::new(
                        committing.school_id.clone(),
                        row.name.trim().to_string(),
                        grade,
                        row.guardian.trim().to_string(),
                        Some(committing.batch_id.clone()),
                        now.clone(),
                    )
                    .map_err(|err| {
                        RowFailure::new(row.row_index, format!("minting student id: {err}"))
                    })?;

                    let bytes = EntityStore::encode(&student).map_err(|err| {
                        RowFailure::new(row.row_index, format!("encoding student: {err}"))
                    })?;
                    write_batch.insert(student.student_id.as_bytes(), bytes);
                    row.outcome = Some(RowOutcome::Inserted);
                }
            }
        }

        committed.state = BatchState::Committed;
        committed.committed_at = Some(now);
        let bytes = EntityStore::encode(&committed)
            .map_err(|err| RowFailure::new(0, format!("encoding batch: {err}")))?;
        write_batch.insert(committed.batch_id.as_bytes(), bytes);

        Ok((write_batch, committed))
    }

    pub fn import_batch(&self, batch_id: &str) -> Result<ImportBatch, WorkflowError> {
        Ok(self.store.require::<ImportBatch>(batch_id)?.into_value())
    }

    pub fn batches_for_school(&self, school_id: &str) -> Result<Vec<ImportBatch>, WorkflowError> {
        self.store.list_by_parent(school_id)
    }

    pub fn students_for_school(
        &self,
        school_id: &str,
    ) -> Result<Vec<StudentRecord>, WorkflowError> {
        self.store.list_by_parent(school_id)
    }

    // ------------------------------------------------------------------
    // cases
    // ------------------------------------------------------------------

    pub fn open_case(&self, subject_id: &str) -> Result<CaseFile, WorkflowError> {
        let case = Self::minted(CaseFile::open(
            subject_id.to_string(),
            self.clock.now(),
            None,
        ))?;
        self.store.insert_new(&case)?;

        info!(case_id = %case.case_id, subject_id, "case opened");
        Ok(case)
    }

    /// Closed is terminal, so "reopening" is a new Active case that points
    /// back at the closed one.
    pub fn reopen_case(&self, case_id: &str) -> Result<CaseFile, WorkflowError> {
        let prior = self.case(case_id)?;
        if prior.state != CaseState::Closed {
            return Err(WorkflowError::InvalidState {
                entity: case_id.to_string(),
                state: prior.state.to_string(),
            });
        }

        let successor = Self::minted(CaseFile::open(
            prior.subject_id.clone(),
            self.clock.now(),
            Some(prior.case_id.clone()),
        ))?;
        self.store.insert_new(&successor)?;

        info!(
            case_id = %successor.case_id,
            reactivated_from = %prior.case_id,
            "successor case opened"
        );
        Ok(successor)
    }

    /// Choose how the case will close; seeds the closure-type checklist,
    /// all unchecked.
    pub fn advance_case(
        &self,
        case_id: &str,
        closure_type: ClosureType,
    ) -> Result<CaseFile, WorkflowError> {
        let snapshot = self.store.require::<CaseFile>(case_id)?;
        self.check(
            case_id,
            EntityState::Case(snapshot.value.state),
            WorkflowEvent::ChooseClosure,
        )?;

        let mut updated = snapshot.value.clone();
        updated.state = CaseState::PendingClosure;
        updated.closure_type = Some(closure_type);
        updated.checklist = closure_checklist(closure_type)
            .iter()
            .map(|item| (item.to_string(), false))
            .collect();
        self.store.update(&snapshot, &updated)?;

        info!(case_id, ?closure_type, "case pending closure");
        Ok(updated)
    }

    /// The gated, irreversible close. Every required item must be checked
    /// and a signature supplied; on any unmet precondition the case is left
    /// exactly as it was.
    pub fn finalize_case(
        &self,
        case_id: &str,
        checklist_answers: BTreeMap<String, bool>,
        signature: &str,
    ) -> Result<CaseFile, WorkflowError> {
        let snapshot = self.store.require::<CaseFile>(case_id)?;
        self.check(
            case_id,
            EntityState::Case(snapshot.value.state),
            WorkflowEvent::Finalize,
        )?;

        let mut updated = snapshot.value.clone();
        for (item, answer) in checklist_answers {
            // answers outside the required set carry no weight
            if let Some(slot) = updated.checklist.get_mut(&item) {
                *slot = answer;
            }
        }

        let missing = updated.unmet_items();
        if !missing.is_empty() {
            return Err(WorkflowError::ChecklistIncomplete { missing });
        }
        if signature.trim().is_empty() {
            return Err(WorkflowError::MissingSignature);
        }

        updated.state = CaseState::Closed;
        updated.signature = Some(signature.to_string());
        updated.closed_at = Some(self.clock.now());
        self.store.update(&snapshot, &updated)?;

        info!(case_id, "case closed");
        Ok(updated)
    }

    pub fn case(&self, case_id: &str) -> Result<CaseFile, WorkflowError> {
        Ok(self.store.require::<CaseFile>(case_id)?.into_value())
    }

    pub fn cases_for_subject(&self, subject_id: &str) -> Result<Vec<CaseFile>, WorkflowError> {
        self.store.list_by_parent(subject_id)
    }
}

/// First row that could not be materialized during commit staging.
struct RowFailure {
    row_index: u32,
    reason: String,
}

impl RowFailure {
    fn new(row_index: u32, reason: String) -> Self {
        Self { row_index, reason }
    }
}
