//! Validation pipeline for bulk imports
//!
//! Stateless: rows plus the school's existing students in, a structured
//! report out. Row checks run independently and never short-circuit, so one
//! bad row still leaves every other row's verdict in the report. Duplicates
//! are tagged with the record they collide with, never resolved here;
//! resolution belongs to commit time and the batch's conflict policy.
//!
//! The report is deterministic: rows stay in index order, counts are
//! derived, and the digest is a sha256 over the canonical CBOR encoding of
//! the row verdicts. Re-validating identical input yields a byte-identical
//! report, which is what makes re-uploading the same file idempotent.

use std::collections::HashMap;

use crate::import::{ImportRow, RowValidation};
use crate::policy::{WorkflowPolicy, parse_grade};
use crate::student::{StudentRecord, dedup_key};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct RowReport {
    #[n(0)]
    pub row_index: u32,
    #[n(1)]
    pub status: RowValidation,
    #[n(2)]
    pub reason: Option<String>,
    #[n(3)]
    pub duplicate_of: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub total_rows: u32,
    pub valid_count: u32,
    pub warning_count: u32,
    pub error_count: u32,
    pub duplicate_count: u32,
    /// One verdict per input row, in row-index order.
    pub rows: Vec<RowReport>,
    /// sha256 of the canonical CBOR encoding of `rows`.
    pub digest: String,
}

impl ValidationReport {
    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }
}

pub fn validate_rows(
    rows: &[ImportRow],
    existing: &[StudentRecord],
    policy: &WorkflowPolicy,
) -> ValidationReport {
    let existing_by_key: HashMap<String, &StudentRecord> = existing
        .iter()
        .map(|student| (student.dedup_key(), student))
        .collect();

    let mut seen_in_batch: HashMap<String, u32> = HashMap::new();
    let mut reports = Vec::with_capacity(rows.len());

    for row in rows {
        let mut status = RowValidation::Valid;
        let mut reasons: Vec<String> = Vec::new();
        let mut duplicate_of = None;

        let mut missing: Vec<&str> = Vec::new();
        if row.name.trim().is_empty() {
            missing.push("name");
        }
        if row.grade.trim().is_empty() {
            missing.push("grade");
        }
        if row.guardian.trim().is_empty() {
            missing.push("guardian");
        }
        if !missing.is_empty() {
            status = RowValidation::Error;
            reasons.push(format!("missing required field(s): {}", missing.join(", ")));
        }

        let grade = if row.grade.trim().is_empty() {
            None
        } else {
            match parse_grade(&row.grade) {
                Some(grade) => {
                    if grade < policy.grade_min || grade > policy.grade_max {
                        if status == RowValidation::Valid {
                            status = RowValidation::Warning;
                        }
                        reasons.push(format!(
                            "grade {} outside recognized range {}..={}",
                            grade, policy.grade_min, policy.grade_max
                        ));
                    }
                    Some(grade)
                }
                None => {
                    status = RowValidation::Error;
                    reasons.push(format!("unrecognized grade {:?}", row.grade));
                    None
                }
            }
        };

        // duplicate tagging needs a normalized key, which needs a usable
        // name and grade
        if let (false, Some(grade)) = (row.name.trim().is_empty(), grade) {
            let key = dedup_key(&row.name, grade);

            if let Some(student) = existing_by_key.get(&key) {
                duplicate_of = Some(student.student_id.clone());
            }

            match seen_in_batch.get(&key) {
                Some(first_index) => {
                    if status == RowValidation::Valid {
                        status = RowValidation::Warning;
                    }
                    reasons.push(format!("repeats row {} within this upload", first_index));
                }
                None => {
                    seen_in_batch.insert(key, row.row_index);
                }
            }
        }

        reports.push(RowReport {
            row_index: row.row_index,
            status,
            reason: if reasons.is_empty() {
                None
            } else {
                Some(reasons.join("; "))
            },
            duplicate_of,
        });
    }

    let valid_count = count(&reports, RowValidation::Valid);
    let warning_count = count(&reports, RowValidation::Warning);
    let error_count = count(&reports, RowValidation::Error);
    let duplicate_count = reports.iter().filter(|r| r.duplicate_of.is_some()).count() as u32;

    let encoded = minicbor::to_vec(&reports).expect("row reports encode to cbor");
    let digest = sha256::digest(&encoded);

    ValidationReport {
        total_rows: rows.len() as u32,
        valid_count,
        warning_count,
        error_count,
        duplicate_count,
        rows: reports,
        digest,
    }
}

fn count(reports: &[RowReport], status: RowValidation) -> u32 {
    reports.iter().filter(|r| r.status == status).count() as u32
}
