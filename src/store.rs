//! Entity store
//!
//! Mechanism only: durable keyed storage for workflow entities with no
//! business rules. Entities live CBOR-encoded in the sled default tree, keyed
//! by their bech32 id; the id's human-readable prefix namespaces the kind, so
//! listing a kind is a prefix scan.
//!
//! Writes enforce at-most-one-writer per entity: a read hands back a
//! [`Snapshot`] holding the raw stored bytes, and an update is a
//! compare-and-swap against exactly those bytes. The loser of a race gets
//! [`WorkflowError::ConcurrentModification`] and must re-read. Entity
//! encodings are canonical (fixed field order, `BTreeMap` collections), so
//! byte equality is the same thing as value equality here.

use std::sync::Arc;

use sled::IVec;

use crate::error::WorkflowError;

/// Implemented by every durable workflow entity.
pub trait Entity: Sized {
    /// Human-readable kind name, used in error messages.
    const KIND: &'static str;
    /// Key prefix shared by every id of this kind (bech32 HRP + separator).
    const KEY_PREFIX: &'static str;

    fn entity_id(&self) -> &str;
    /// Parent reference this entity is listed under (child, subject, school).
    fn parent_id(&self) -> &str;
}

/// A decoded entity plus the exact bytes it was stored as. Updates swap
/// against these bytes, which is what makes read-validate-write safe.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    pub value: T,
    raw: IVec,
}

impl<T> Snapshot<T> {
    pub fn into_value(self) -> T {
        self.value
    }
}

#[derive(Clone)]
pub struct EntityStore {
    db: Arc<sled::Db>,
}

impl EntityStore {
    pub fn new(db: Arc<sled::Db>) -> Self {
        Self { db }
    }

    /// Canonical encoding used for storage and for batched writes.
    pub fn encode<T>(entity: &T) -> Result<Vec<u8>, WorkflowError>
    where
        T: Entity + minicbor::Encode<()>,
    {
        Ok(minicbor::to_vec(entity)?)
    }

    pub fn get<T>(&self, id: &str) -> Result<Option<Snapshot<T>>, WorkflowError>
    where
        T: Entity + for<'b> minicbor::Decode<'b, ()>,
    {
        match self.db.get(id.as_bytes())? {
            Some(raw) => {
                let value: T = minicbor::decode(raw.as_ref())?;
                Ok(Some(Snapshot { value, raw }))
            }
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but absence is a [`WorkflowError::NotFound`].
    pub fn require<T>(&self, id: &str) -> Result<Snapshot<T>, WorkflowError>
    where
        T: Entity + for<'b> minicbor::Decode<'b, ()>,
    {
        self.get(id)?
            .ok_or_else(|| WorkflowError::NotFound(format!("{} {}", T::KIND, id)))
    }

    /// First write of a fresh entity. Swaps against absence, so an id
    /// collision (or a concurrent create) loses the race instead of
    /// clobbering.
    pub fn insert_new<T>(&self, entity: &T) -> Result<(), WorkflowError>
    where
        T: Entity + minicbor::Encode<()>,
    {
        let bytes = Self::encode(entity)?;
        self.db
            .compare_and_swap(entity.entity_id().as_bytes(), None::<&[u8]>, Some(bytes))?
            .map_err(|_| WorkflowError::ConcurrentModification(entity.entity_id().to_string()))
    }

    /// Write back a mutated entity, but only if nobody else has written it
    /// since `snapshot` was read.
    pub fn update<T>(&self, snapshot: &Snapshot<T>, next: &T) -> Result<(), WorkflowError>
    where
        T: Entity + minicbor::Encode<()>,
    {
        let bytes = Self::encode(next)?;
        self.db
            .compare_and_swap(
                next.entity_id().as_bytes(),
                Some(snapshot.raw.as_ref()),
                Some(bytes),
            )?
            .map_err(|_| WorkflowError::ConcurrentModification(next.entity_id().to_string()))
    }

    /// All entities of a kind belonging to one parent, in key order (uuid7
    /// ids are time-ordered, so this is creation order).
    pub fn list_by_parent<T>(&self, parent_id: &str) -> Result<Vec<T>, WorkflowError>
    where
        T: Entity + for<'b> minicbor::Decode<'b, ()>,
    {
        let mut found = Vec::new();
        for item in self.db.scan_prefix(T::KEY_PREFIX.as_bytes()) {
            let (_, raw) = item?;
            let value: T = minicbor::decode(raw.as_ref())?;
            if value.parent_id() == parent_id {
                found.push(value);
            }
        }
        Ok(found)
    }

    /// Apply a multi-key write atomically. Used by the import commit so a
    /// batch of student writes plus the batch's own state change land
    /// together or not at all.
    pub fn apply(&self, batch: sled::Batch) -> Result<(), WorkflowError> {
        self.db.apply_batch(batch)?;
        Ok(())
    }
}
