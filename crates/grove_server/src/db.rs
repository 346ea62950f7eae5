//! Seam to the relational store.
//!
//! The actual driver is an external collaborator; the core consumes it
//! through [`CharacterStore`] behind a single-flight connection lock.
//! Contention is absorbed by the async mutex: a waiter simply parks until
//! the holder finishes its request sequence. [`MemoryStore`] is the
//! in-process stand-in used by tests and the default server wiring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::character::Character;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("character {0} does not exist")]
    NotFound(u32),
    #[error("storage failure: {0}")]
    Backend(String),
}

/// Durable-id allocation request: one id per new row, in walk order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocateIds {
    pub items: usize,
    pub equips: usize,
}

#[derive(Clone, Debug, Default)]
pub struct AllocatedIds {
    pub items: Vec<u64>,
    pub equips: Vec<u64>,
}

/// The full upsert written on logout or map change.
#[derive(Clone, Debug, Default)]
pub struct CharacterDocument {
    pub id: u32,
    pub account_id: u32,
    pub name: String,
    /// Normalized through the map's forced return.
    pub map: u32,
    pub spawn_point: u8,
    pub level: u8,
    pub job: u16,
    pub exp: i32,
    pub max_hp: i16,
    pub hp: i16,
    pub max_mp: i16,
    pub mp: i16,
    pub str: i16,
    pub dex: i16,
    pub int: i16,
    pub luk: i16,
    pub ap: i16,
    pub sp: i16,
    pub fame: i16,
    pub mesos: i32,
    /// (slot, durable id, item id) for worn gear.
    pub equipped: Vec<(u8, u64, u32)>,
    /// (slot, durable id, item id) for the equip tab.
    pub equips: Vec<(u8, u64, u32)>,
    /// (tab, slot, durable id, item id, quantity) across the four
    /// non-equip tabs.
    pub items: Vec<(u8, u8, u64, u32, i16)>,
    /// Started quests with their per-mob progress rows.
    pub quests: Vec<(u16, Vec<(u32, i32)>)>,
    pub quest_infos: Vec<(u16, String)>,
    /// Completed quests with absolute timestamps.
    pub completed_quests: Vec<(u16, i64)>,
    /// (skill, level, master level).
    pub skills: Vec<(u32, u8, u8)>,
    pub monster_book: Vec<(u32, u8)>,
    /// Only slots with a type; (key, type, action).
    pub key_map: Vec<(u8, u8, u32)>,
    pub storage_mesos: i32,
    /// (durable id, item id, quantity).
    pub storage_items: Vec<(u64, u32, i16)>,
    /// (durable id, item id).
    pub storage_equips: Vec<(u64, u32)>,
}

#[async_trait]
pub trait CharacterStore: Send + Sync {
    async fn load_character(&self, id: u32) -> Result<Character, DbError>;
    async fn allocate_ids(&self, request: AllocateIds) -> Result<AllocatedIds, DbError>;
    async fn update_character(&self, document: CharacterDocument) -> Result<(), DbError>;
}

/// A store behind its single-flight lock.
pub struct DbConnection {
    store: Arc<dyn CharacterStore>,
    lock: tokio::sync::Mutex<()>,
}

impl DbConnection {
    pub fn new(store: Arc<dyn CharacterStore>) -> Self {
        Self {
            store,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Takes the connection for a request sequence.
    pub async fn acquire(&self) -> LockedConnection<'_> {
        LockedConnection {
            _guard: self.lock.lock().await,
            store: &*self.store,
        }
    }
}

pub struct LockedConnection<'a> {
    _guard: tokio::sync::MutexGuard<'a, ()>,
    store: &'a dyn CharacterStore,
}

impl LockedConnection<'_> {
    pub async fn load_character(&self, id: u32) -> Result<Character, DbError> {
        self.store.load_character(id).await
    }

    pub async fn allocate_ids(&self, request: AllocateIds) -> Result<AllocatedIds, DbError> {
        self.store.allocate_ids(request).await
    }

    pub async fn update_character(&self, document: CharacterDocument) -> Result<(), DbError> {
        self.store.update_character(document).await
    }
}

/// In-memory character store.
#[derive(Default)]
pub struct MemoryStore {
    characters: Mutex<FxHashMap<u32, Character>>,
    saved: Mutex<FxHashMap<u32, CharacterDocument>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            characters: Mutex::new(FxHashMap::default()),
            saved: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn seed_character(&self, chr: Character) {
        self.characters.lock().insert(chr.id, chr);
    }

    pub fn saved_document(&self, id: u32) -> Option<CharacterDocument> {
        self.saved.lock().get(&id).cloned()
    }
}

#[async_trait]
impl CharacterStore for MemoryStore {
    async fn load_character(&self, id: u32) -> Result<Character, DbError> {
        self.characters
            .lock()
            .get(&id)
            .cloned()
            .ok_or(DbError::NotFound(id))
    }

    async fn allocate_ids(&self, request: AllocateIds) -> Result<AllocatedIds, DbError> {
        let take = |n: usize| -> Vec<u64> {
            (0..n)
                .map(|_| self.next_id.fetch_add(1, Ordering::Relaxed))
                .collect()
        };
        Ok(AllocatedIds {
            items: take(request.items),
            equips: take(request.equips),
        })
    }

    async fn update_character(&self, document: CharacterDocument) -> Result<(), DbError> {
        self.saved.lock().insert(document.id, document);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryStore::new();
        store.seed_character(Character::new(7, "seven".to_owned(), 100000000));
        let conn = DbConnection::new(Arc::new(store));

        let locked = conn.acquire().await;
        let chr = locked.load_character(7).await.unwrap();
        assert_eq!(chr.name, "seven");
        assert!(matches!(
            locked.load_character(8).await,
            Err(DbError::NotFound(8))
        ));

        let ids = locked
            .allocate_ids(AllocateIds { items: 3, equips: 2 })
            .await
            .unwrap();
        assert_eq!(ids.items.len(), 3);
        assert_eq!(ids.equips.len(), 2);
        // Ids never collide across kinds.
        let mut all = ids.items.clone();
        all.extend(&ids.equips);
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 5);
    }
}
