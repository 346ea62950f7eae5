//! Static resource database for the grove channel server.
//!
//! Everything here is read-only after startup. [`GameData::load`] ingests
//! an on-disk fixture tree (`wz/`, one JSON file per category) and the
//! result is shared by reference across every worker thread. The channel
//! core only ever consumes `Option`-returning lookups; absence of a record
//! is an ordinary condition, not an error.

mod exp;
mod foothold;
mod item;
mod map;
mod mob;
mod quest;
mod reactor;
mod shop;
mod skill;

use std::path::Path;

use anyhow::Context;
use rustc_hash::FxHashMap;
use serde::Deserialize;

pub use exp::exp_to_level_up;
pub use foothold::{Foothold, FootholdTree};
pub use item::{ConsumableInfo, EquipInfo, ItemInfo};
pub use map::{LifeInfo, LifeKind, MapInfo, MapReactorInfo, PortalInfo};
pub use mob::{DropEntry, DropTable, MonsterStats};
pub use quest::{QuestAct, QuestInfo, QuestRequirement};
pub use reactor::{ReactorEvent, ReactorEventKind, ReactorInfo, ReactorState};
pub use shop::{ShopInfo, ShopItem};
pub use skill::{SkillInfo, SkillLevel};

/// A map coordinate. The y axis grows downward.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Point {
    pub x: i16,
    pub y: i16,
}

impl Point {
    pub fn new(x: i16, y: i16) -> Self {
        Self { x, y }
    }
}

/// The whole static data set, loaded once and shared immutably.
#[derive(Default)]
pub struct GameData {
    maps: FxHashMap<u32, MapInfo>,
    monsters: FxHashMap<u32, MonsterStats>,
    monster_drops: FxHashMap<u32, DropTable>,
    reactor_drops: FxHashMap<u32, DropTable>,
    reactors: FxHashMap<u32, ReactorInfo>,
    items: FxHashMap<u32, ItemInfo>,
    equips: FxHashMap<u32, EquipInfo>,
    consumables: FxHashMap<u32, ConsumableInfo>,
    skills: FxHashMap<u32, SkillInfo>,
    quests: FxHashMap<u16, QuestInfo>,
    shops: FxHashMap<u32, ShopInfo>,
    // Built from each map's footholds at insertion; shared by reference
    // across threads for the lifetime of the process.
    foothold_trees: FxHashMap<u32, FootholdTree>,
}

impl GameData {
    /// Loads the fixture tree rooted at `dir`.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        fn category<K, V>(dir: &Path, name: &str) -> anyhow::Result<FxHashMap<K, V>>
        where
            K: std::hash::Hash + Eq + serde::de::DeserializeOwned,
            V: serde::de::DeserializeOwned,
        {
            let path = dir.join(name);
            if !path.exists() {
                return Ok(FxHashMap::default());
            }
            let file = std::fs::File::open(&path)
                .with_context(|| format!("opening {}", path.display()))?;
            let entries: Vec<(K, V)> = serde_json::from_reader(std::io::BufReader::new(file))
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(entries.into_iter().collect())
        }

        let mut data = Self {
            maps: FxHashMap::default(),
            monsters: category(dir, "monsters.json")?,
            monster_drops: category(dir, "monster-drops.json")?,
            reactor_drops: category(dir, "reactor-drops.json")?,
            reactors: category(dir, "reactors.json")?,
            items: category(dir, "items.json")?,
            equips: category(dir, "equips.json")?,
            consumables: category(dir, "consumables.json")?,
            skills: category(dir, "skills.json")?,
            quests: category(dir, "quests.json")?,
            shops: category(dir, "shops.json")?,
            foothold_trees: FxHashMap::default(),
        };

        let maps: FxHashMap<u32, MapInfo> = category(dir, "maps.json")?;
        for (_, info) in maps {
            data.insert_map(info);
        }

        Ok(data)
    }

    pub fn map_info(&self, id: u32) -> Option<&MapInfo> {
        self.maps.get(&id)
    }

    pub fn foothold_tree(&self, map_id: u32) -> Option<&FootholdTree> {
        self.foothold_trees.get(&map_id)
    }

    pub fn monster_stats(&self, id: u32) -> Option<&MonsterStats> {
        self.monsters.get(&id)
    }

    pub fn monster_drops(&self, id: u32) -> Option<&DropTable> {
        self.monster_drops.get(&id)
    }

    pub fn reactor_drops(&self, id: u32) -> Option<&DropTable> {
        self.reactor_drops.get(&id)
    }

    pub fn reactor_info(&self, id: u32) -> Option<&ReactorInfo> {
        self.reactors.get(&id)
    }

    pub fn item_info(&self, id: u32) -> Option<&ItemInfo> {
        self.items.get(&id)
    }

    pub fn equip_info(&self, id: u32) -> Option<&EquipInfo> {
        self.equips.get(&id)
    }

    pub fn consumable_info(&self, id: u32) -> Option<&ConsumableInfo> {
        self.consumables.get(&id)
    }

    pub fn skill_info(&self, id: u32) -> Option<&SkillInfo> {
        self.skills.get(&id)
    }

    pub fn quest_info(&self, id: u16) -> Option<&QuestInfo> {
        self.quests.get(&id)
    }

    pub fn shop_info(&self, id: u32) -> Option<&ShopInfo> {
        self.shops.get(&id)
    }

    // Insertion is only interesting to the loader above and to test
    // fixtures; lookups stay the narrow surface the core consumes.

    pub fn insert_map(&mut self, info: MapInfo) {
        self.foothold_trees
            .insert(info.id, FootholdTree::new(info.footholds.clone()));
        self.maps.insert(info.id, info);
    }

    pub fn insert_monster(&mut self, stats: MonsterStats) {
        self.monsters.insert(stats.id, stats);
    }

    pub fn insert_monster_drops(&mut self, id: u32, table: DropTable) {
        self.monster_drops.insert(id, table);
    }

    pub fn insert_reactor_drops(&mut self, id: u32, table: DropTable) {
        self.reactor_drops.insert(id, table);
    }

    pub fn insert_reactor(&mut self, info: ReactorInfo) {
        self.reactors.insert(info.id, info);
    }

    pub fn insert_item(&mut self, info: ItemInfo) {
        self.items.insert(info.id, info);
    }

    pub fn insert_equip(&mut self, info: EquipInfo) {
        self.equips.insert(info.id, info);
    }

    pub fn insert_consumable(&mut self, info: ConsumableInfo) {
        self.consumables.insert(info.id, info);
    }

    pub fn insert_skill(&mut self, info: SkillInfo) {
        self.skills.insert(info.id, info);
    }

    pub fn insert_quest(&mut self, info: QuestInfo) {
        self.quests.insert(info.id, info);
    }

    pub fn insert_shop(&mut self, info: ShopInfo) {
        self.shops.insert(info.id, info);
    }
}
