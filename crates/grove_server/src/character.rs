//! The authoritative character state a session projects.
//!
//! Everything here is plain data plus the invariant-preserving mutations
//! the [`User`](crate::user) layer drives. Nothing in this module touches
//! the wire; callers translate the returned change sets into packets.

use grove_data::{exp_to_level_up, EquipInfo};
use rustc_hash::FxHashMap;

use crate::packets::InventoryChange;

/// Key-map slots the client renders.
pub const KEY_COUNT: usize = 90;

/// Compact equipped-gear slots (hat, face, eye, top, bottom, shoes, ...).
pub const EQUIP_SLOT_COUNT: usize = 17;

/// Non-equip inventory tabs: use, setup, etc, cash.
pub const TAB_COUNT: usize = 4;

/// A stackable inventory item. `id` is the durable database id; zero until
/// the flush pipeline allocates one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemStack {
    pub id: u64,
    pub item_id: u32,
    pub quantity: i16,
    pub expiration: i64,
    pub flags: u16,
    pub owner: Option<String>,
}

impl ItemStack {
    pub fn new(item_id: u32, quantity: i16) -> Self {
        Self {
            id: 0,
            item_id,
            quantity,
            expiration: -1,
            flags: 0,
            owner: None,
        }
    }
}

/// A rolled equip instance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Equipment {
    pub id: u64,
    pub item_id: u32,
    pub level: u8,
    pub slots: u8,
    pub str: i16,
    pub dex: i16,
    pub int: i16,
    pub luk: i16,
    pub hp: i16,
    pub mp: i16,
    pub atk: i16,
    pub matk: i16,
    pub def: i16,
    pub mdef: i16,
    pub acc: i16,
    pub avoid: i16,
    pub speed: i16,
    pub jump: i16,
}

impl Equipment {
    pub fn from_template(info: &EquipInfo) -> Self {
        Self {
            id: 0,
            item_id: info.id,
            level: 0,
            slots: info.slots,
            str: info.str,
            dex: info.dex,
            int: info.int,
            luk: info.luk,
            hp: info.hp,
            mp: info.mp,
            atk: info.atk,
            matk: info.matk,
            def: info.def,
            mdef: info.mdef,
            acc: info.acc,
            avoid: info.avoid,
            speed: info.speed,
            jump: info.jump,
        }
    }
}

/// Which compact equipped slot an equip item occupies.
pub fn equip_slot(item_id: u32) -> Option<usize> {
    let kind = item_id / 10_000 % 100;
    Some(match kind {
        0 => 0,         // hat
        1 => 1,         // face accessory
        2 => 2,         // eye accessory
        3 => 3,         // earrings
        4 => 4,         // top / overall
        5 => 4,
        6 => 5,         // bottom
        7 => 6,         // shoes
        8 => 7,         // gloves
        9 => 8,         // cape
        10 => 9,        // shield
        11 => 10,       // ring
        12 => 11,       // pendant
        30..=49 => 12,  // weapon families
        _ => return None,
    })
}

/// Tab a non-equip item lives in, by id prefix.
pub fn tab_for(item_id: u32) -> Option<usize> {
    match item_id / 1_000_000 {
        2 => Some(0),
        3 => Some(1),
        4 => Some(2),
        5 => Some(3),
        _ => None,
    }
}

pub fn is_equip(item_id: u32) -> bool {
    item_id / 1_000_000 == 1
}

#[derive(Clone, Debug)]
pub struct Inventory<T> {
    slots: Vec<Option<T>>,
}

impl<T> Inventory<T> {
    pub fn new(slot_count: u8) -> Self {
        Self {
            slots: (0..slot_count).map(|_| None).collect(),
        }
    }

    pub fn slot_count(&self) -> u8 {
        self.slots.len() as u8
    }

    pub fn get(&self, slot: u8) -> Option<&T> {
        self.slots.get(slot as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: u8) -> Option<&mut T> {
        self.slots.get_mut(slot as usize).and_then(Option::as_mut)
    }

    pub fn take(&mut self, slot: u8) -> Option<T> {
        self.slots.get_mut(slot as usize).and_then(Option::take)
    }

    pub fn put(&mut self, slot: u8, value: T) -> Option<T> {
        let entry = &mut self.slots[slot as usize];
        std::mem::replace(entry, Some(value))
    }

    pub fn first_free(&self) -> Option<u8> {
        self.slots.iter().position(Option::is_none).map(|i| i as u8)
    }

    pub fn has_free_slot(&self) -> bool {
        self.first_free().is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (i as u8, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u8, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|v| (i as u8, v)))
    }
}

/// Account storage: items parked with the storage keeper.
#[derive(Clone, Debug)]
pub struct Storage {
    pub slot_count: u8,
    pub mesos: i32,
    pub items: Vec<ItemStack>,
    pub equips: Vec<Equipment>,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            slot_count: 4,
            mesos: 0,
            items: Vec::new(),
            equips: Vec::new(),
        }
    }
}

/// Per-quest mob-kill progress, in end-requirement order.
#[derive(Clone, Debug, Default)]
pub struct QuestProgress {
    pub mobs: Vec<MobProgress>,
}

#[derive(Clone, Copy, Debug)]
pub struct MobProgress {
    pub mob_id: u32,
    pub required: i32,
    pub count: i32,
}

impl QuestProgress {
    /// The zero-padded progress string the client renders.
    pub fn progress_string(&self) -> String {
        use std::fmt::Write;

        let mut s = String::with_capacity(self.mobs.len() * 3);
        for mob in &self.mobs {
            let _ = write!(s, "{:03}", mob.count.clamp(0, 999));
        }
        s
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SkillRecord {
    pub level: u8,
    pub master_level: u8,
}

/// Outcome of trying to put something into an inventory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InventoryGain {
    Success(Vec<InventoryChange>),
    Full,
}

#[derive(Clone, Debug)]
pub struct Character {
    pub id: u32,
    pub account_id: u32,
    pub name: String,
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
    pub gender: u8,
    pub skin: u8,
    pub face: u32,
    pub hair: u32,
    pub mesos: i32,
    pub equipped: Vec<Option<Equipment>>,
    pub equip_inventory: Inventory<Equipment>,
    pub tabs: Vec<Inventory<ItemStack>>,
    pub quests: FxHashMap<u16, QuestProgress>,
    pub quest_infos: FxHashMap<u16, String>,
    pub completed_quests: FxHashMap<u16, i64>,
    pub skills: FxHashMap<u32, SkillRecord>,
    pub monster_book: FxHashMap<u32, u8>,
    pub key_map: [(u8, u32); KEY_COUNT],
    pub storage: Storage,
}

impl Character {
    pub fn new(id: u32, name: String, map: u32) -> Self {
        Self {
            id,
            account_id: 0,
            name,
            map,
            spawn_point: 0,
            level: 1,
            job: 0,
            exp: 0,
            max_hp: 50,
            hp: 50,
            max_mp: 5,
            mp: 5,
            str: 12,
            dex: 5,
            int: 4,
            luk: 4,
            ap: 0,
            sp: 0,
            fame: 0,
            gender: 0,
            skin: 0,
            face: 20000,
            hair: 30000,
            mesos: 0,
            equipped: vec![None; EQUIP_SLOT_COUNT],
            equip_inventory: Inventory::new(24),
            tabs: vec![
                Inventory::new(24),
                Inventory::new(24),
                Inventory::new(24),
                Inventory::new(96),
            ],
            quests: FxHashMap::default(),
            quest_infos: FxHashMap::default(),
            completed_quests: FxHashMap::default(),
            skills: FxHashMap::default(),
            monster_book: FxHashMap::default(),
            key_map: [(0, 0); KEY_COUNT],
            storage: Storage::default(),
        }
    }

    /// Applies an exp gain and returns how many level-ups it produced.
    /// Each level grants 5 AP and 3 SP and widens the hp/mp pools.
    pub fn gain_exp(&mut self, exp: i32) -> u8 {
        let mut levels = 0;
        self.exp = self.exp.saturating_add(exp);
        while self.level < 200 && self.exp >= exp_to_level_up(self.level) {
            self.exp -= exp_to_level_up(self.level);
            self.level += 1;
            self.ap += 5;
            self.sp += 3;
            self.max_hp = self.max_hp.saturating_add(30);
            self.max_mp = self.max_mp.saturating_add(20);
            self.hp = self.max_hp;
            self.mp = self.max_mp;
            levels += 1;
        }
        if self.level == 200 {
            self.exp = 0;
        }
        levels
    }

    pub fn adjust_hp(&mut self, delta: i32) {
        self.hp = (i32::from(self.hp) + delta).clamp(0, i32::from(self.max_hp)) as i16;
    }

    pub fn adjust_mp(&mut self, delta: i32) {
        self.mp = (i32::from(self.mp) + delta).clamp(0, i32::from(self.max_mp)) as i16;
    }

    /// Fails (and leaves the balance untouched) on overflow or debt.
    pub fn adjust_mesos(&mut self, delta: i32) -> bool {
        match self.mesos.checked_add(delta) {
            Some(mesos) if mesos >= 0 => {
                self.mesos = mesos;
                true
            }
            _ => false,
        }
    }

    pub fn item_quantity(&self, item_id: u32) -> i32 {
        if is_equip(item_id) {
            return self
                .equip_inventory
                .iter()
                .filter(|(_, e)| e.item_id == item_id)
                .count() as i32;
        }

        let Some(tab) = tab_for(item_id) else {
            return 0;
        };
        self.tabs[tab]
            .iter()
            .filter(|(_, s)| s.item_id == item_id)
            .map(|(_, s)| i32::from(s.quantity))
            .sum()
    }

    pub fn has_item(&self, item_id: u32, quantity: i16) -> bool {
        self.item_quantity(item_id) >= i32::from(quantity)
    }

    pub fn has_free_slot_in_each_tab(&self) -> bool {
        self.tabs.iter().all(Inventory::has_free_slot) && self.equip_inventory.has_free_slot()
    }

    /// Adds a stack, topping up existing stacks before taking a free slot.
    pub fn gain_stack(&mut self, mut stack: ItemStack, slot_max: i16) -> InventoryGain {
        let Some(tab) = tab_for(stack.item_id) else {
            return InventoryGain::Full;
        };

        let mut changes = Vec::new();
        let inventory = &mut self.tabs[tab];
        for (slot, existing) in inventory.iter_mut() {
            if existing.item_id != stack.item_id || existing.quantity >= slot_max {
                continue;
            }
            let moved = stack.quantity.min(slot_max - existing.quantity);
            existing.quantity += moved;
            stack.quantity -= moved;
            changes.push(InventoryChange::Quantity {
                inventory: tab as u8 + 2,
                slot,
                quantity: existing.quantity,
            });
            if stack.quantity == 0 {
                return InventoryGain::Success(changes);
            }
        }

        match inventory.first_free() {
            Some(slot) => {
                changes.push(InventoryChange::Add {
                    inventory: tab as u8 + 2,
                    slot,
                    item_id: stack.item_id,
                    quantity: stack.quantity,
                });
                inventory.put(slot, stack);
                InventoryGain::Success(changes)
            }
            // Partial top-ups stay applied; the caller reports how much was
            // left on the ground.
            None => InventoryGain::Full,
        }
    }

    pub fn gain_equipment(&mut self, equip: Equipment) -> InventoryGain {
        match self.equip_inventory.first_free() {
            Some(slot) => {
                let change = InventoryChange::Add {
                    inventory: 1,
                    slot,
                    item_id: equip.item_id,
                    quantity: 1,
                };
                self.equip_inventory.put(slot, equip);
                InventoryGain::Success(vec![change])
            }
            None => InventoryGain::Full,
        }
    }

    /// Removes up to `amount` of the stack at `slot`, returning what was
    /// removed.
    pub fn remove_from_slot(&mut self, tab: usize, slot: u8, amount: i16) -> Option<ItemStack> {
        let stack = self.tabs[tab].get_mut(slot)?;
        if stack.quantity > amount {
            stack.quantity -= amount;
            let mut removed = stack.clone();
            removed.quantity = amount;
            removed.id = 0;
            Some(removed)
        } else {
            self.tabs[tab].take(slot)
        }
    }

    /// Consumes `amount` of `item_id` from wherever it is stacked.
    pub fn consume_item(&mut self, item_id: u32, mut amount: i16) -> bool {
        if !self.has_item(item_id, amount) {
            return false;
        }
        let Some(tab) = tab_for(item_id) else {
            return false;
        };

        let slots: Vec<u8> = self.tabs[tab]
            .iter()
            .filter(|(_, s)| s.item_id == item_id)
            .map(|(slot, _)| slot)
            .collect();
        for slot in slots {
            if amount == 0 {
                break;
            }
            let take = self.tabs[tab].get(slot).map_or(0, |s| s.quantity).min(amount);
            self.remove_from_slot(tab, slot, take);
            amount -= take;
        }
        true
    }

    /// Wears the equip at inventory slot `src`; anything displaced drops
    /// back into the source slot.
    pub fn equip_from_slot(&mut self, src: u8) -> Option<usize> {
        let slot = equip_slot(self.equip_inventory.get(src)?.item_id)?;
        let equip = self.equip_inventory.take(src)?;
        if let Some(previous) = self.equipped[slot].replace(equip) {
            self.equip_inventory.put(src, previous);
        }
        Some(slot)
    }

    pub fn unequip(&mut self, slot: usize) -> bool {
        let Some(free) = self.equip_inventory.first_free() else {
            return false;
        };
        match self.equipped.get_mut(slot).and_then(Option::take) {
            Some(equip) => {
                self.equip_inventory.put(free, equip);
                true
            }
            None => false,
        }
    }

    pub fn is_quest_started(&self, quest: u16) -> bool {
        self.quests.contains_key(&quest)
    }

    pub fn is_quest_complete(&self, quest: u16) -> bool {
        self.completed_quests.contains_key(&quest)
    }

    pub fn start_quest(&mut self, quest: u16, mobs: impl Iterator<Item = (u32, i32)>) {
        self.quests.insert(
            quest,
            QuestProgress {
                mobs: mobs
                    .map(|(mob_id, required)| MobProgress {
                        mob_id,
                        required,
                        count: 0,
                    })
                    .collect(),
            },
        );
    }

    pub fn forfeit_quest(&mut self, quest: u16) -> bool {
        self.quests.remove(&quest).is_some()
    }

    pub fn complete_quest(&mut self, quest: u16, at: i64) {
        self.quests.remove(&quest);
        self.completed_quests.insert(quest, at);
    }

    /// Advances every started quest that needs this mob. Returns the quests
    /// whose progress string changed.
    pub fn record_kill(&mut self, mob_id: u32) -> Vec<(u16, String)> {
        let mut updated = Vec::new();
        for (&quest, progress) in &mut self.quests {
            let mut changed = false;
            for mob in &mut progress.mobs {
                if mob.mob_id == mob_id && mob.count < mob.required {
                    mob.count += 1;
                    changed = true;
                }
            }
            if changed {
                updated.push((quest, progress.progress_string()));
            }
        }
        updated
    }

    pub fn record_monster_card(&mut self, card_id: u32) -> u8 {
        let count = self.monster_book.entry(card_id).or_insert(0);
        *count = (*count + 1).min(5);
        *count
    }

    pub fn set_key(&mut self, key: u32, kind: u8, action: u32) -> bool {
        match self.key_map.get_mut(key as usize) {
            Some(slot) => {
                *slot = (kind, action);
                true
            }
            None => false,
        }
    }

    pub fn clear_key(&mut self, key: u32) -> bool {
        self.set_key(key, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn chr() -> Character {
        Character::new(1000, "tester".to_owned(), 100000000)
    }

    #[test]
    fn exp_overflow_levels_multiple_times() {
        let mut chr = chr();
        let need = exp_to_level_up(1) + exp_to_level_up(2) + 1;
        let levels = chr.gain_exp(need);
        assert_eq!(levels, 2);
        assert_eq!(chr.level, 3);
        assert_eq!(chr.exp, 1);
        assert_eq!(chr.ap, 10);
    }

    #[test]
    fn stacks_merge_before_claiming_slots() {
        let mut chr = chr();
        assert!(matches!(
            chr.gain_stack(ItemStack::new(2000000, 80), 100),
            InventoryGain::Success(_)
        ));
        let gain = chr.gain_stack(ItemStack::new(2000000, 50), 100);
        let InventoryGain::Success(changes) = gain else {
            panic!("expected success");
        };
        // 20 topped up the existing stack, 30 claimed a fresh slot.
        assert_eq!(changes.len(), 2);
        assert_eq!(chr.item_quantity(2000000), 130);
    }

    #[test]
    fn gain_reports_full_only_when_no_slot_fits() {
        let mut chr = chr();
        chr.tabs[0] = Inventory::new(1);
        assert!(matches!(
            chr.gain_stack(ItemStack::new(2000000, 100), 100),
            InventoryGain::Success(_)
        ));
        assert_eq!(
            chr.gain_stack(ItemStack::new(2000001, 1), 100),
            InventoryGain::Full
        );
    }

    #[test]
    fn consume_spans_stacks() {
        let mut chr = chr();
        chr.gain_stack(ItemStack::new(4000000, 100), 100);
        chr.gain_stack(ItemStack::new(4000000, 40), 100);
        assert!(chr.consume_item(4000000, 120));
        assert_eq!(chr.item_quantity(4000000), 20);
        assert!(!chr.consume_item(4000000, 120));
    }

    #[test]
    fn kill_progress_clamps_at_requirement() {
        let mut chr = chr();
        chr.start_quest(2040, [(100100, 2)].into_iter());
        assert_eq!(chr.record_kill(100100), vec![(2040, "001".to_owned())]);
        assert_eq!(chr.record_kill(100100), vec![(2040, "002".to_owned())]);
        assert!(chr.record_kill(100100).is_empty());
    }

    #[test]
    fn start_then_forfeit_restores_quests() {
        let mut chr = chr();
        chr.start_quest(2000, std::iter::empty());
        assert!(chr.is_quest_started(2000));
        assert!(chr.forfeit_quest(2000));
        assert!(!chr.is_quest_started(2000));
        assert!(chr.quests.is_empty());
    }
}
