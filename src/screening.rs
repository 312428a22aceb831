//! Screening entity
//!
//! A developmental screening with resumable progress. Progress only ever
//! moves forward while the screening is open, and the response map is frozen
//! the moment the screening completes.

use std::collections::BTreeMap;

use crate::clock::TimeStamp;
use crate::store::Entity;
use crate::utils;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreeningState {
    #[n(0)]
    NotStarted,
    #[n(1)]
    InProgress,
    #[n(2)]
    Completed,
}

impl ScreeningState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScreeningState::Completed)
    }
}

impl std::fmt::Display for ScreeningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "NotStarted"),
            Self::InProgress => write!(f, "InProgress"),
            Self::Completed => write!(f, "Completed"),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Screening {
    #[n(0)]
    pub screening_id: String,
    #[n(1)]
    pub child_id: String,
    #[n(2)]
    pub screening_type_id: String,
    #[n(3)]
    pub state: ScreeningState,
    #[n(4)]
    pub responses: BTreeMap<String, String>,
    #[n(5)]
    pub progress_percent: u8,
    #[n(6)]
    pub started_at: TimeStamp,
    #[n(7)]
    pub completed_at: Option<TimeStamp>,
}

impl Screening {
    /// A screening begins life open, at zero progress.
    pub fn start(
        child_id: String,
        screening_type_id: String,
        started_at: TimeStamp,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            screening_id: utils::screening_id()?,
            child_id,
            screening_type_id,
            state: ScreeningState::InProgress,
            responses: BTreeMap::new(),
            progress_percent: 0,
            started_at,
            completed_at: None,
        })
    }

    pub fn is_open(&self) -> bool {
        self.state == ScreeningState::InProgress
    }

    /// Merge a partial answer set; new keys overwrite old ones.
    pub fn merge_responses(&mut self, responses: BTreeMap<String, String>) {
        self.responses.extend(responses);
    }
}

impl Entity for Screening {
    const KIND: &'static str = "screening";
    const KEY_PREFIX: &'static str = "scr_1";

    fn entity_id(&self) -> &str {
        &self.screening_id
    }

    fn parent_id(&self) -> &str {
        &self.child_id
    }
}
