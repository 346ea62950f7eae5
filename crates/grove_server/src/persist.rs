//! Character flush: the two-phase write-back on logout or shutdown.
//!
//! Phase 1 allocates durable ids for rows created since the last flush
//! (anything with id 0); phase 2 upserts the whole character. Both run
//! under one hold of the connection lock, and a failure is terminal for
//! the session: the request is dropped and nothing is retried.

use grove_data::GameData;

use crate::character::Character;
use crate::db::{AllocateIds, CharacterDocument, DbConnection, DbError};

/// Flushes `chr`, patching freshly allocated ids into it first.
pub async fn flush_character(
    conn: &DbConnection,
    data: &GameData,
    chr: &mut Character,
) -> Result<(), DbError> {
    let locked = conn.acquire().await;

    let request = AllocateIds {
        items: chr
            .tabs
            .iter()
            .flat_map(|tab| tab.iter())
            .filter(|(_, stack)| stack.id == 0)
            .count()
            + chr.storage.items.iter().filter(|s| s.id == 0).count(),
        equips: chr
            .equipped
            .iter()
            .flatten()
            .filter(|equip| equip.id == 0)
            .count()
            + chr
                .equip_inventory
                .iter()
                .filter(|(_, equip)| equip.id == 0)
                .count()
            + chr.storage.equips.iter().filter(|e| e.id == 0).count(),
    };

    if request.items > 0 || request.equips > 0 {
        let ids = locked.allocate_ids(request).await?;

        let mut items = ids.items.into_iter();
        for tab in &mut chr.tabs {
            for (_, stack) in tab.iter_mut() {
                if stack.id == 0 {
                    if let Some(id) = items.next() {
                        stack.id = id;
                    }
                }
            }
        }
        for stack in chr.storage.items.iter_mut().filter(|s| s.id == 0) {
            if let Some(id) = items.next() {
                stack.id = id;
            }
        }

        let mut equips = ids.equips.into_iter();
        for equip in chr.equipped.iter_mut().flatten() {
            if equip.id == 0 {
                if let Some(id) = equips.next() {
                    equip.id = id;
                }
            }
        }
        for (_, equip) in chr.equip_inventory.iter_mut() {
            if equip.id == 0 {
                if let Some(id) = equips.next() {
                    equip.id = id;
                }
            }
        }
        for equip in chr.storage.equips.iter_mut().filter(|e| e.id == 0) {
            if let Some(id) = equips.next() {
                equip.id = id;
            }
        }
    }

    locked.update_character(document_of(data, chr)).await
}

/// Projects the in-memory character into the upsert document.
pub fn document_of(data: &GameData, chr: &Character) -> CharacterDocument {
    let map = data
        .map_info(chr.map)
        .map_or(chr.map, |info| info.persisted_map());

    CharacterDocument {
        id: chr.id,
        account_id: chr.account_id,
        name: chr.name.clone(),
        map,
        spawn_point: chr.spawn_point,
        level: chr.level,
        job: chr.job,
        exp: chr.exp,
        max_hp: chr.max_hp,
        hp: chr.hp,
        max_mp: chr.max_mp,
        mp: chr.mp,
        str: chr.str,
        dex: chr.dex,
        int: chr.int,
        luk: chr.luk,
        ap: chr.ap,
        sp: chr.sp,
        fame: chr.fame,
        mesos: chr.mesos,
        equipped: chr
            .equipped
            .iter()
            .enumerate()
            .filter_map(|(slot, equip)| {
                equip.as_ref().map(|e| (slot as u8, e.id, e.item_id))
            })
            .collect(),
        equips: chr
            .equip_inventory
            .iter()
            .map(|(slot, e)| (slot, e.id, e.item_id))
            .collect(),
        items: chr
            .tabs
            .iter()
            .enumerate()
            .flat_map(|(tab, inventory)| {
                inventory
                    .iter()
                    .map(move |(slot, s)| (tab as u8, slot, s.id, s.item_id, s.quantity))
            })
            .collect(),
        quests: chr
            .quests
            .iter()
            .map(|(&quest, progress)| {
                (
                    quest,
                    progress.mobs.iter().map(|m| (m.mob_id, m.count)).collect(),
                )
            })
            .collect(),
        quest_infos: chr
            .quest_infos
            .iter()
            .map(|(&id, value)| (id, value.clone()))
            .collect(),
        completed_quests: chr.completed_quests.iter().map(|(&q, &at)| (q, at)).collect(),
        skills: chr
            .skills
            .iter()
            .map(|(&skill, record)| (skill, record.level, record.master_level))
            .collect(),
        monster_book: chr.monster_book.iter().map(|(&card, &count)| (card, count)).collect(),
        key_map: chr
            .key_map
            .iter()
            .enumerate()
            .filter(|(_, (kind, _))| *kind != 0)
            .map(|(key, (kind, action))| (key as u8, *kind, *action))
            .collect(),
        storage_mesos: chr.storage.mesos,
        storage_items: chr
            .storage
            .items
            .iter()
            .map(|s| (s.id, s.item_id, s.quantity))
            .collect(),
        storage_equips: chr.storage.equips.iter().map(|e| (e.id, e.item_id)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::character::{Equipment, ItemStack};
    use crate::db::MemoryStore;

    fn data_with_forced_return() -> GameData {
        let mut data = GameData::default();
        data.insert_map(grove_data::MapInfo {
            id: 910000000,
            forced_return: Some(100000000),
            nearest_town: 100000000,
            seat_count: 0,
            portals: vec![],
            lives: vec![],
            reactors: vec![],
            footholds: vec![],
        });
        data
    }

    #[tokio::test]
    async fn flush_allocates_ids_for_new_rows_only() {
        let store = Arc::new(MemoryStore::new());
        let conn = DbConnection::new(store.clone());
        let data = GameData::default();

        let mut chr = Character::new(5, "five".to_owned(), 100000000);
        let mut old = ItemStack::new(2000000, 10);
        old.id = 777;
        chr.gain_stack(old, 100);
        chr.gain_stack(ItemStack::new(2000001, 1), 100);
        chr.gain_equipment(Equipment {
            item_id: 1302000,
            ..Equipment::default()
        });

        flush_character(&conn, &data, &mut chr).await.unwrap();

        // The pre-existing row kept its id; the new rows got fresh ones.
        let ids: Vec<u64> = chr
            .tabs
            .iter()
            .flat_map(|t| t.iter())
            .map(|(_, s)| s.id)
            .collect();
        assert!(ids.contains(&777));
        assert!(ids.iter().all(|&id| id != 0));
        assert!(chr.equip_inventory.iter().all(|(_, e)| e.id != 0));

        let saved = store.saved_document(5).unwrap();
        assert_eq!(saved.items.len(), 2);
        assert_eq!(saved.equips.len(), 1);
    }

    #[tokio::test]
    async fn persisted_map_is_the_forced_return() {
        let store = Arc::new(MemoryStore::new());
        let conn = DbConnection::new(store.clone());
        let data = data_with_forced_return();

        let mut chr = Character::new(6, "six".to_owned(), 910000000);
        flush_character(&conn, &data, &mut chr).await.unwrap();
        assert_eq!(store.saved_document(6).unwrap().map, 100000000);
    }

    #[tokio::test]
    async fn key_map_is_packed() {
        let store = Arc::new(MemoryStore::new());
        let conn = DbConnection::new(store.clone());
        let data = GameData::default();

        let mut chr = Character::new(9, "nine".to_owned(), 100000000);
        chr.set_key(2, 4, 10);
        chr.set_key(60, 5, 1001005);
        flush_character(&conn, &data, &mut chr).await.unwrap();

        let mut keys = store.saved_document(9).unwrap().key_map;
        keys.sort_unstable();
        assert_eq!(keys, vec![(2, 4, 10), (60, 5, 1001005)]);
    }
}
