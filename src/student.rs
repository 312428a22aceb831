//! Student records
//!
//! The durable target of an import commit and the source set for duplicate
//! detection. Matching is by a normalized name+grade key, so casing and
//! stray whitespace in an upload do not mint a second record for the same
//! student.

use crate::clock::TimeStamp;
use crate::store::Entity;
use crate::utils;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct StudentRecord {
    #[n(0)]
    pub student_id: String,
    #[n(1)]
    pub school_id: String,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub grade: i32,
    #[n(4)]
    pub guardian: String,
    #[n(5)]
    pub imported_from: Option<String>,
    #[n(6)]
    pub updated_at: TimeStamp,
}

impl StudentRecord {
    pub fn new(
        school_id: String,
        name: String,
        grade: i32,
        guardian: String,
        imported_from: Option<String>,
        updated_at: TimeStamp,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            student_id: utils::student_id()?,
            school_id,
            name,
            grade,
            guardian,
            imported_from,
            updated_at,
        })
    }

    pub fn dedup_key(&self) -> String {
        dedup_key(&self.name, self.grade)
    }
}

/// Normalized duplicate-detection key: trimmed lowercase name plus grade.
pub fn dedup_key(name: &str, grade: i32) -> String {
    format!("{}|{}", name.trim().to_lowercase(), grade)
}

impl Entity for StudentRecord {
    const KIND: &'static str = "student";
    const KEY_PREFIX: &'static str = "stu_1";

    fn entity_id(&self) -> &str {
        &self.student_id
    }

    fn parent_id(&self) -> &str {
        &self.school_id
    }
}
