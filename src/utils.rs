//! Id minting helpers
//!
//! Entity ids are uuid7 values encoded as bech32m with a human-readable
//! prefix. The prefix doubles as the store's key namespace: every key for a
//! given entity kind shares it, so a prefix scan walks exactly that kind.

use bech32::Bech32m;
use uuid7::uuid7;

/// Bech32 prefixes per entity kind. The separator digit is part of every
/// encoded id, so `"scr_1"` is a safe scan prefix for screenings.
pub const SCREENING_HRP: &str = "scr_";
pub const CONSENT_HRP: &str = "cns_";
pub const BATCH_HRP: &str = "imp_";
pub const CASE_HRP: &str = "case_";
pub const STUDENT_HRP: &str = "stu_";

// construct a unique time-ordered id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

pub fn screening_id() -> anyhow::Result<String> {
    new_uuid_to_bech32(SCREENING_HRP)
}

pub fn consent_id() -> anyhow::Result<String> {
    new_uuid_to_bech32(CONSENT_HRP)
}

pub fn batch_id() -> anyhow::Result<String> {
    new_uuid_to_bech32(BATCH_HRP)
}

pub fn case_id() -> anyhow::Result<String> {
    new_uuid_to_bech32(CASE_HRP)
}

pub fn student_id() -> anyhow::Result<String> {
    new_uuid_to_bech32(STUDENT_HRP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_kind_prefix() {
        assert!(screening_id().unwrap().starts_with("scr_1"));
        assert!(consent_id().unwrap().starts_with("cns_1"));
        assert!(batch_id().unwrap().starts_with("imp_1"));
        assert!(case_id().unwrap().starts_with("case_1"));
        assert!(student_id().unwrap().starts_with("stu_1"));
    }

    #[test]
    fn ids_are_unique() {
        let a = screening_id().unwrap();
        let b = screening_id().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_hrp_is_rejected() {
        assert!(new_uuid_to_bech32("").is_err());
    }
}
