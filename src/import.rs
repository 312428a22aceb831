//! Bulk import batches
//!
//! An upload becomes an [`ImportBatch`] holding its rows in file order. The
//! batch is validated synchronously before it is readable for commit, and a
//! commit is all-or-nothing: either every row write lands or none does.
//! Duplicate rows are only tagged during validation; resolution waits for
//! commit time and the batch's [`ConflictPolicy`].

use crate::clock::TimeStamp;
use crate::store::Entity;
use crate::utils;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    #[n(0)]
    Validating,
    #[n(1)]
    ReadyToCommit,
    #[n(2)]
    Committing,
    #[n(3)]
    Committed,
    #[n(4)]
    Failed,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Committed | BatchState::Failed)
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validating => write!(f, "Validating"),
            Self::ReadyToCommit => write!(f, "ReadyToCommit"),
            Self::Committing => write!(f, "Committing"),
            Self::Committed => write!(f, "Committed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// How a row that matches an existing student is resolved at commit time.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    #[n(0)]
    Skip,
    #[n(1)]
    Update,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowValidation {
    #[n(0)]
    Valid,
    #[n(1)]
    Warning,
    #[n(2)]
    Error,
}

/// What actually happened to a row when the batch committed.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    #[n(0)]
    Inserted,
    #[n(1)]
    Updated,
    #[n(2)]
    Skipped,
}

/// One already-parsed upload row. CSV parsing happens outside the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub name: String,
    pub grade: String,
    pub guardian: String,
}

impl RawRow {
    pub fn new(
        name: impl Into<String>,
        grade: impl Into<String>,
        guardian: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            grade: grade.into(),
            guardian: guardian.into(),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ImportRow {
    #[n(0)]
    pub row_index: u32,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub grade: String,
    #[n(3)]
    pub guardian: String,
    #[n(4)]
    pub validation: Option<RowValidation>,
    #[n(5)]
    pub error_reason: Option<String>,
    // id of the existing student this row collides with, set by validation
    #[n(6)]
    pub duplicate_of: Option<String>,
    #[n(7)]
    pub outcome: Option<RowOutcome>,
}

impl ImportRow {
    fn from_raw(row_index: u32, raw: RawRow) -> Self {
        Self {
            row_index,
            name: raw.name,
            grade: raw.grade,
            guardian: raw.guardian,
            validation: None,
            error_reason: None,
            duplicate_of: None,
            outcome: None,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ImportBatch {
    #[n(0)]
    pub batch_id: String,
    #[n(1)]
    pub school_id: String,
    #[n(2)]
    pub uploaded_filename: String,
    #[n(3)]
    pub state: BatchState,
    #[n(4)]
    pub conflict_policy: ConflictPolicy,
    #[n(5)]
    pub rows: Vec<ImportRow>,
    #[n(6)]
    pub total_rows: u32,
    #[n(7)]
    pub valid_count: u32,
    #[n(8)]
    pub warning_count: u32,
    #[n(9)]
    pub error_count: u32,
    #[n(10)]
    pub duplicate_count: u32,
    #[n(11)]
    pub report_digest: Option<String>,
    #[n(12)]
    pub uploaded_at: TimeStamp,
    #[n(13)]
    pub committed_at: Option<TimeStamp>,
}

impl ImportBatch {
    pub fn upload(
        school_id: String,
        uploaded_filename: String,
        raw_rows: Vec<RawRow>,
        conflict_policy: ConflictPolicy,
        uploaded_at: TimeStamp,
    ) -> anyhow::Result<Self> {
        let total_rows = raw_rows.len() as u32;
        let rows = raw_rows
            .into_iter()
            .enumerate()
            .map(|(i, raw)| ImportRow::from_raw(i as u32, raw))
            .collect();

        Ok(Self {
            batch_id: utils::batch_id()?,
            school_id,
            uploaded_filename,
            state: BatchState::Validating,
            conflict_policy,
            rows,
            total_rows,
            valid_count: 0,
            warning_count: 0,
            error_count: 0,
            duplicate_count: 0,
            report_digest: None,
            uploaded_at,
            committed_at: None,
        })
    }
}

impl Entity for ImportBatch {
    const KIND: &'static str = "import batch";
    const KEY_PREFIX: &'static str = "imp_1";

    fn entity_id(&self) -> &str {
        &self.batch_id
    }

    fn parent_id(&self) -> &str {
        &self.school_id
    }
}
