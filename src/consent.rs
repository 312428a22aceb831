//! Consent records
//!
//! A consent request either gets an explicit grant/deny, or auto-resolves to
//! Granted once its waiting window has fully elapsed. Expiry of a granted
//! consent is likewise lazy. Records are never deleted; superseded consents
//! stay behind for audit.

use crate::clock::TimeStamp;
use crate::store::Entity;
use crate::utils;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentState {
    #[n(0)]
    Pending,
    #[n(1)]
    Granted,
    #[n(2)]
    Denied,
    #[n(3)]
    Expired,
}

impl ConsentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsentState::Denied | ConsentState::Expired)
    }
}

impl std::fmt::Display for ConsentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Granted => write!(f, "Granted"),
            Self::Denied => write!(f, "Denied"),
            Self::Expired => write!(f, "Expired"),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentType {
    #[n(0)]
    Screening,
    #[n(1)]
    Referral,
    #[n(2)]
    DataSharing,
}

/// An explicit caller decision on a pending consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentDecision {
    Grant,
    Deny,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ConsentRecord {
    #[n(0)]
    pub consent_id: String,
    #[n(1)]
    pub subject_id: String,
    #[n(2)]
    pub consent_type: ConsentType,
    #[n(3)]
    pub state: ConsentState,
    #[n(4)]
    pub requested_on: TimeStamp,
    #[n(5)]
    pub resolved_on: Option<TimeStamp>,
    // copied from policy at request time so later policy changes do not
    // re-judge old records
    #[n(6)]
    pub auto_consent_window_days: i64,
    #[n(7)]
    pub valid_until: Option<TimeStamp>,
}

impl ConsentRecord {
    pub fn request(
        subject_id: String,
        consent_type: ConsentType,
        requested_on: TimeStamp,
        auto_consent_window_days: i64,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            consent_id: utils::consent_id()?,
            subject_id,
            consent_type,
            state: ConsentState::Pending,
            requested_on,
            resolved_on: None,
            auto_consent_window_days,
            valid_until: None,
        })
    }
}

impl Entity for ConsentRecord {
    const KIND: &'static str = "consent";
    const KEY_PREFIX: &'static str = "cns_1";

    fn entity_id(&self) -> &str {
        &self.consent_id
    }

    fn parent_id(&self) -> &str {
        &self.subject_id
    }
}
