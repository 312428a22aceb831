//! Case files and the gated discharge workflow
//!
//! A case closes through exactly one gate: every checklist item for the
//! chosen closure type must be checked and a signature supplied. `Closed` is
//! terminal; reactivation means opening a new case that references the old
//! one, never reopening this record.

use std::collections::BTreeMap;

use crate::clock::TimeStamp;
use crate::store::Entity;
use crate::utils;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseState {
    #[n(0)]
    Active,
    #[n(1)]
    PendingClosure,
    #[n(2)]
    Closed,
}

impl CaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CaseState::Closed)
    }
}

impl std::fmt::Display for CaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::PendingClosure => write!(f, "PendingClosure"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureType {
    #[n(0)]
    Success,
    #[n(1)]
    Transfer,
    #[n(2)]
    Discontinue,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct CaseFile {
    #[n(0)]
    pub case_id: String,
    #[n(1)]
    pub subject_id: String,
    #[n(2)]
    pub state: CaseState,
    #[n(3)]
    pub closure_type: Option<ClosureType>,
    #[n(4)]
    pub checklist: BTreeMap<String, bool>,
    #[n(5)]
    pub signature: Option<String>,
    #[n(6)]
    pub opened_at: TimeStamp,
    #[n(7)]
    pub closed_at: Option<TimeStamp>,
    // lineage link for reactivations: a new case may point back at the
    // closed one it supersedes
    #[n(8)]
    pub reactivated_from: Option<String>,
}

impl CaseFile {
    pub fn open(
        subject_id: String,
        opened_at: TimeStamp,
        reactivated_from: Option<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            case_id: utils::case_id()?,
            subject_id,
            state: CaseState::Active,
            closure_type: None,
            checklist: BTreeMap::new(),
            signature: None,
            opened_at,
            closed_at: None,
            reactivated_from,
        })
    }

    /// Checklist items still unmet, in stable (sorted) order.
    pub fn unmet_items(&self) -> Vec<String> {
        self.checklist
            .iter()
            .filter(|(_, done)| !**done)
            .map(|(item, _)| item.clone())
            .collect()
    }
}

impl Entity for CaseFile {
    const KIND: &'static str = "case file";
    const KEY_PREFIX: &'static str = "case_1";

    fn entity_id(&self) -> &str {
        &self.case_id
    }

    fn parent_id(&self) -> &str {
        &self.subject_id
    }
}
