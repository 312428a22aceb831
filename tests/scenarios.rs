//! End-to-end workflow scenarios against a real sled-backed store.

use std::collections::BTreeMap;
use std::sync::Arc;

use screening_workflow::case::{CaseState, ClosureType};
use screening_workflow::clock::{Clock, FixedClock, TimeStamp};
use screening_workflow::consent::{ConsentDecision, ConsentState, ConsentType};
use screening_workflow::engine::WorkflowEngine;
use screening_workflow::error::WorkflowError;
use screening_workflow::import::{BatchState, ConflictPolicy, RawRow, RowOutcome};
use screening_workflow::screening::{Screening, ScreeningState};
use screening_workflow::store::EntityStore;

use tempfile::tempdir; // Use for test db cleanup.

/// Sled uses file-based locking to prevent concurrent access, so each test
/// opens its own database under a temp dir.
fn test_db(name: &str) -> (tempfile::TempDir, Arc<sled::Db>) {
    let temp_dir = tempdir().unwrap();
    let db = sled::open(temp_dir.path().join(name)).unwrap();
    (temp_dir, Arc::new(db))
}

fn fixed_engine(name: &str) -> (tempfile::TempDir, Arc<FixedClock>, WorkflowEngine<Arc<FixedClock>>) {
    let (dir, db) = test_db(name);
    let clock = Arc::new(FixedClock::new(TimeStamp::new_with(2026, 3, 1, 9, 0, 0)));
    let engine = WorkflowEngine::with_clock(db, clock.clone());
    (dir, clock, engine)
}

fn answers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn screening_start_save_and_complete() -> anyhow::Result<()> {
    let (_dir, _clock, engine) = fixed_engine("screening_flow.db");

    let screening = engine.start_screening("chld_77", "asq3")?;
    assert_eq!(screening.state, ScreeningState::InProgress);
    assert_eq!(screening.progress_percent, 0);

    let screening = engine.save_progress(
        &screening.screening_id,
        answers(&[("q1", "yes"), ("q2", "no")]),
        40,
    )?;
    assert_eq!(screening.progress_percent, 40);

    // resuming merges: q2 is overwritten, q3 is added
    let screening = engine.save_progress(
        &screening.screening_id,
        answers(&[("q2", "sometimes"), ("q3", "yes")]),
        75,
    )?;
    assert_eq!(screening.responses.len(), 3);
    assert_eq!(screening.responses["q2"], "sometimes");

    let screening = engine.complete_screening(&screening.screening_id, answers(&[("q4", "no")]))?;
    assert_eq!(screening.state, ScreeningState::Completed);
    assert_eq!(screening.progress_percent, 100);
    assert!(screening.completed_at.is_some());
    assert_eq!(screening.responses.len(), 4);

    // completed is terminal: no further saves, no second completion
    let err = engine
        .save_progress(&screening.screening_id, answers(&[("q5", "yes")]), 80)
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { .. }));

    let err = engine
        .complete_screening(&screening.screening_id, BTreeMap::new())
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { .. }));

    // the responses really froze
    let frozen = engine.screening(&screening.screening_id)?;
    assert_eq!(frozen.responses, screening.responses);

    Ok(())
}

#[test]
fn at_most_one_open_screening_per_type_per_child() -> anyhow::Result<()> {
    let (_dir, _clock, engine) = fixed_engine("screening_dup.db");

    let first = engine.start_screening("chld_1", "asq3")?;

    let err = engine.start_screening("chld_1", "asq3").unwrap_err();
    assert!(matches!(err, WorkflowError::DuplicateActiveScreening { .. }));

    // a different type, or a different child, is fine
    engine.start_screening("chld_1", "mchat")?;
    engine.start_screening("chld_2", "asq3")?;

    // completing the first frees the slot
    engine.complete_screening(&first.screening_id, BTreeMap::new())?;
    engine.start_screening("chld_1", "asq3")?;

    assert_eq!(engine.screenings_for_child("chld_1")?.len(), 3);
    Ok(())
}

#[test]
fn progress_never_regresses() -> anyhow::Result<()> {
    let (_dir, _clock, engine) = fixed_engine("screening_regress.db");

    let screening = engine.start_screening("chld_1", "asq3")?;
    engine.save_progress(&screening.screening_id, BTreeMap::new(), 60)?;

    // holding still is allowed
    engine.save_progress(&screening.screening_id, BTreeMap::new(), 60)?;

    let err = engine
        .save_progress(&screening.screening_id, answers(&[("q9", "yes")]), 30)
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::RegressingProgress {
            current: 60,
            attempted: 30
        }
    ));

    // the rejected save changed nothing
    let unchanged = engine.screening(&screening.screening_id)?;
    assert_eq!(unchanged.progress_percent, 60);
    assert!(unchanged.responses.is_empty());

    // 100 is reserved for completion
    let err = engine
        .save_progress(&screening.screening_id, BTreeMap::new(), 100)
        .unwrap_err();
    assert!(matches!(err, WorkflowError::ProgressOutOfRange(100)));

    Ok(())
}

#[test]
fn screening_overdue_flag_is_pull_based() -> anyhow::Result<()> {
    let (_dir, clock, engine) = fixed_engine("screening_sla.db");

    let screening = engine.start_screening("chld_1", "asq3")?;
    assert!(!engine.screening_overdue(&screening.screening_id)?);

    clock.advance_days(31);
    assert!(engine.screening_overdue(&screening.screening_id)?);

    // a completed screening is never overdue
    engine.complete_screening(&screening.screening_id, BTreeMap::new())?;
    assert!(!engine.screening_overdue(&screening.screening_id)?);

    Ok(())
}

#[test]
fn consent_auto_grants_only_after_the_window() -> anyhow::Result<()> {
    let (_dir, clock, engine) = fixed_engine("consent_auto.db");

    let consent = engine.request_consent("subj_9", ConsentType::Screening)?;
    assert_eq!(consent.state, ConsentState::Pending);

    // six days in: still waiting
    clock.advance_days(6);
    let consent = engine.evaluate_consent(&consent.consent_id)?;
    assert_eq!(consent.state, ConsentState::Pending);

    // eight days in: the window (7) has fully elapsed
    clock.advance_days(2);
    let consent = engine.evaluate_consent(&consent.consent_id)?;
    assert_eq!(consent.state, ConsentState::Granted);
    assert!(consent.resolved_on.is_some());
    let valid_until = consent.valid_until.clone().unwrap();
    assert_eq!(valid_until, clock.now().plus_days(365));

    // idempotent: evaluating again with no elapsed time changes nothing
    let again = engine.evaluate_consent(&consent.consent_id)?;
    assert_eq!(again, consent);

    Ok(())
}

#[test]
fn explicit_decisions_win_only_inside_the_window() -> anyhow::Result<()> {
    let (_dir, clock, engine) = fixed_engine("consent_explicit.db");

    // deny inside the window sticks, and is terminal
    let denied = engine.request_consent("subj_1", ConsentType::Referral)?;
    clock.advance_days(3);
    let denied = engine.resolve_consent(&denied.consent_id, ConsentDecision::Deny)?;
    assert_eq!(denied.state, ConsentState::Denied);
    clock.advance_days(30);
    let denied = engine.evaluate_consent(&denied.consent_id)?;
    assert_eq!(denied.state, ConsentState::Denied);

    // a deny that arrives after auto-consent fired cannot revert it
    let late = engine.request_consent("subj_1", ConsentType::DataSharing)?;
    clock.advance_days(8);
    let err = engine
        .resolve_consent(&late.consent_id, ConsentDecision::Deny)
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { .. }));
    let late = engine.consent(&late.consent_id)?;
    assert_eq!(late.state, ConsentState::Granted);

    // both records remain for audit
    assert_eq!(engine.consents_for_subject("subj_1")?.len(), 2);
    Ok(())
}

#[test]
fn granted_consent_expires_lazily() -> anyhow::Result<()> {
    let (_dir, clock, engine) = fixed_engine("consent_expiry.db");

    let consent = engine.request_consent("subj_2", ConsentType::Screening)?;
    let consent = engine.resolve_consent(&consent.consent_id, ConsentDecision::Grant)?;
    assert_eq!(consent.state, ConsentState::Granted);

    clock.advance_days(365);
    let consent = engine.evaluate_consent(&consent.consent_id)?;
    assert_eq!(consent.state, ConsentState::Granted);

    clock.advance_days(1);
    let consent = engine.evaluate_consent(&consent.consent_id)?;
    assert_eq!(consent.state, ConsentState::Expired);

    Ok(())
}

#[test]
fn import_with_row_errors_fails_and_blocks_commit() -> anyhow::Result<()> {
    let (_dir, _clock, engine) = fixed_engine("import_fail.db");

    let batch = engine.upload_import(
        "sch_5",
        "roster.csv",
        vec![
            RawRow::new("Ana Lopez", "2", "G. Lopez"),
            RawRow::new("Ben Okafor", "3", "G. Okafor"),
            RawRow::new("Cara Singh", "4", ""), // missing guardian
            RawRow::new("Dev Patel", "5", "G. Patel"),
            RawRow::new("Eli Moore", "6", "G. Moore"),
        ],
        ConflictPolicy::Skip,
    )?;

    let err = engine.validate_import(&batch.batch_id).unwrap_err();
    match err {
        WorkflowError::ValidationFailed {
            error_count,
            report,
            ..
        } => {
            assert_eq!(error_count, 1);
            assert_eq!(report.total_rows, 5);
            assert!(report.rows[2].reason.as_deref().unwrap().contains("guardian"));
        }
        other => panic!("expected ValidationFailed, got {other:?}"),
    }

    let batch = engine.import_batch(&batch.batch_id)?;
    assert_eq!(batch.state, BatchState::Failed);
    assert_eq!(batch.error_count, 1);

    let err = engine.commit_import(&batch.batch_id).unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { .. }));
    assert!(engine.students_for_school("sch_5")?.is_empty());

    Ok(())
}

#[test]
fn commit_under_skip_policy_leaves_existing_records_untouched() -> anyhow::Result<()> {
    let (_dir, _clock, engine) = fixed_engine("import_skip.db");

    // seed an existing student through a first committed import
    let seed = engine.upload_import(
        "sch_5",
        "seed.csv",
        vec![RawRow::new("Ana Lopez", "2", "Original Guardian")],
        ConflictPolicy::Skip,
    )?;
    engine.validate_import(&seed.batch_id)?;
    engine.commit_import(&seed.batch_id)?;

    let before = engine.students_for_school("sch_5")?;
    assert_eq!(before.len(), 1);
    let existing = before[0].clone();

    // same name+grade collides; different guardian must NOT be applied
    let batch = engine.upload_import(
        "sch_5",
        "reupload.csv",
        vec![
            RawRow::new("ana lopez", "2", "Different Guardian"),
            RawRow::new("Ben Okafor", "3", "G. Okafor"),
        ],
        ConflictPolicy::Skip,
    )?;
    let report = engine.validate_import(&batch.batch_id)?;
    assert_eq!(report.duplicate_count, 1);

    let committed = engine.commit_import(&batch.batch_id)?;
    assert_eq!(committed.state, BatchState::Committed);
    assert_eq!(committed.rows[0].outcome, Some(RowOutcome::Skipped));
    assert_eq!(committed.rows[1].outcome, Some(RowOutcome::Inserted));
    assert!(committed.committed_at.is_some());

    let after = engine.students_for_school("sch_5")?;
    assert_eq!(after.len(), 2);
    let untouched = after
        .iter()
        .find(|s| s.student_id == existing.student_id)
        .unwrap();
    assert_eq!(*untouched, existing);

    // committed is terminal
    let err = engine.commit_import(&batch.batch_id).unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { .. }));

    Ok(())
}

#[test]
fn commit_under_update_policy_overwrites_in_place() -> anyhow::Result<()> {
    let (_dir, _clock, engine) = fixed_engine("import_update.db");

    let seed = engine.upload_import(
        "sch_5",
        "seed.csv",
        vec![RawRow::new("Ana Lopez", "2", "Original Guardian")],
        ConflictPolicy::Skip,
    )?;
    engine.validate_import(&seed.batch_id)?;
    engine.commit_import(&seed.batch_id)?;
    let existing = engine.students_for_school("sch_5")?.remove(0);

    let batch = engine.upload_import(
        "sch_5",
        "corrections.csv",
        vec![RawRow::new("Ana Lopez", "2", "Corrected Guardian")],
        ConflictPolicy::Update,
    )?;
    engine.validate_import(&batch.batch_id)?;
    let committed = engine.commit_import(&batch.batch_id)?;
    assert_eq!(committed.rows[0].outcome, Some(RowOutcome::Updated));

    let after = engine.students_for_school("sch_5")?;
    assert_eq!(after.len(), 1, "update must not mint a second record");
    assert_eq!(after[0].student_id, existing.student_id);
    assert_eq!(after[0].guardian, "Corrected Guardian");
    assert_eq!(after[0].imported_from.as_deref(), Some(committed.batch_id.as_str()));

    Ok(())
}

#[test]
fn case_closure_is_gated_and_terminal() -> anyhow::Result<()> {
    let (_dir, _clock, engine) = fixed_engine("case_close.db");

    let case = engine.open_case("subj_3")?;

    // cannot finalize straight from Active
    let err = engine
        .finalize_case(&case.case_id, BTreeMap::new(), "Dr. Osei")
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { .. }));

    let case = engine.advance_case(&case.case_id, ClosureType::Transfer)?;
    assert_eq!(case.state, CaseState::PendingClosure);
    assert_eq!(case.checklist.len(), 3);
    assert!(case.checklist.values().all(|done| !done));

    // one unmet item blocks the close and names it
    let partial = BTreeMap::from([
        ("guardian_notified".to_string(), true),
        ("records_transferred".to_string(), true),
    ]);
    let err = engine
        .finalize_case(&case.case_id, partial, "Dr. Osei")
        .unwrap_err();
    match err {
        WorkflowError::ChecklistIncomplete { missing } => {
            assert_eq!(missing, vec!["receiving_provider_confirmed".to_string()]);
        }
        other => panic!("expected ChecklistIncomplete, got {other:?}"),
    }
    // and the rejected attempt persisted nothing
    let unchanged = engine.case(&case.case_id)?;
    assert!(unchanged.checklist.values().all(|done| !done));

    let complete = BTreeMap::from([
        ("guardian_notified".to_string(), true),
        ("records_transferred".to_string(), true),
        ("receiving_provider_confirmed".to_string(), true),
    ]);

    let err = engine
        .finalize_case(&case.case_id, complete.clone(), "   ")
        .unwrap_err();
    assert!(matches!(err, WorkflowError::MissingSignature));

    let closed = engine.finalize_case(&case.case_id, complete, "Dr. Osei")?;
    assert_eq!(closed.state, CaseState::Closed);
    assert!(closed.closed_at.is_some());
    assert_eq!(closed.signature.as_deref(), Some("Dr. Osei"));

    // terminal: no re-advance, no re-finalize
    let err = engine
        .advance_case(&closed.case_id, ClosureType::Success)
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { .. }));

    // reactivation is a new case pointing back at the closed one
    let successor = engine.reopen_case(&closed.case_id)?;
    assert_eq!(successor.state, CaseState::Active);
    assert_eq!(successor.reactivated_from.as_deref(), Some(closed.case_id.as_str()));
    assert_eq!(engine.cases_for_subject("subj_3")?.len(), 2);

    Ok(())
}

#[test]
fn conflicting_writers_resolve_to_one_winner() -> anyhow::Result<()> {
    let (_dir, db) = test_db("race.db");
    let engine = WorkflowEngine::new(db.clone());
    let store = EntityStore::new(db);

    let screening = engine.start_screening("chld_1", "asq3")?;

    // two sessions read the same version
    let snap_a = store.require::<Screening>(&screening.screening_id)?;
    let snap_b = store.require::<Screening>(&screening.screening_id)?;

    let mut first = snap_a.value.clone();
    first.progress_percent = 50;
    store.update(&snap_a, &first)?;

    let mut second = snap_b.value.clone();
    second.progress_percent = 30;
    let err = store.update(&snap_b, &second).unwrap_err();
    assert!(matches!(err, WorkflowError::ConcurrentModification(_)));

    // the loser retries from a fresh read and the guard still applies
    let err = engine
        .save_progress(&screening.screening_id, BTreeMap::new(), 30)
        .unwrap_err();
    assert!(matches!(err, WorkflowError::RegressingProgress { .. }));

    Ok(())
}

#[test]
fn entities_round_trip_through_the_store() -> anyhow::Result<()> {
    let (_dir, clock, engine) = fixed_engine("roundtrip.db");

    let screening = engine.start_screening("chld_1", "asq3")?;
    let screening = engine.save_progress(&screening.screening_id, answers(&[("q1", "yes")]), 10)?;
    assert_eq!(engine.screening(&screening.screening_id)?, screening);

    let consent = engine.request_consent("subj_1", ConsentType::Screening)?;
    assert_eq!(engine.consent(&consent.consent_id)?, consent);

    let batch = engine.upload_import(
        "sch_1",
        "roster.csv",
        vec![RawRow::new("Ana Lopez", "K", "G. Lopez")],
        ConflictPolicy::Update,
    )?;
    assert_eq!(engine.import_batch(&batch.batch_id)?, batch);

    let case = engine.open_case("subj_1")?;
    clock.advance_days(1);
    assert_eq!(engine.case(&case.case_id)?, case);

    Ok(())
}
