//! Session-authoritative character actions.
//!
//! A [`User`] validates everything a client asks for against its
//! [`Character`] and the static data before mutating anything. Inputs a
//! well-behaved client can never produce end the session (the connection
//! is treated as packet-edited); the write pipeline still flushes
//! whatever was queued before the shutdown.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use grove_data::{GameData, QuestAct, QuestInfo, QuestRequirement};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::debug;

use crate::character::{
    is_equip, tab_for, Character, Equipment, InventoryGain, ItemStack,
};
use crate::map::{DropPayload, MapDrop};
use crate::packets::{self, stat, DialogueShape, StatUpdate};
use crate::script::{DialogueKind, ScriptEngine, ScriptInstance, ScriptManagers, ScriptOp, ScriptResult};
use crate::session::Session;

/// The client sent something an honest client cannot send. The session is
/// already shut down when this is returned; callers stop processing.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("client sent an impossible request")]
pub struct PacketEdit;

pub type ActionResult<T> = Result<T, PacketEdit>;

/// Outcome of driving a script slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// Script finished (or none was running).
    Done,
    /// Script suspended on a dialogue or warp.
    Suspended,
    /// The session was shut down (kick or failure).
    Ended,
}

pub struct User {
    session: Arc<Session>,
    data: Arc<GameData>,
    managers: Arc<ScriptManagers>,
    pub chr: Character,
    rng: SmallRng,
    /// Dialogue the running script is suspended on, if any.
    dialogue: Option<DialogueKind>,
    script: Option<ScriptInstance>,
    active_npc: u32,
    active_quest: u16,
    open_shop: Option<u32>,
    auto_pickup: bool,
    /// Map/portal the actor should transfer to once the current packet
    /// finishes processing.
    pending_warp: Option<(u32, u8)>,
    /// Quest-exclusive item ids this character may currently see.
    pub quest_items: FxHashSet<u32>,
}

impl User {
    pub fn new(
        session: Arc<Session>,
        data: Arc<GameData>,
        managers: Arc<ScriptManagers>,
        chr: Character,
    ) -> Self {
        // Quest items from quests already in progress are visible from the
        // first frame.
        let mut quest_items = FxHashSet::default();
        for &quest in chr.quests.keys() {
            if let Some(info) = data.quest_info(quest) {
                let is_quest_item =
                    |id: u32| data.item_info(id).is_some_and(|i| i.quest);
                quest_items.extend(info.quest_item_requirements(is_quest_item));
            }
        }

        Self {
            session,
            data,
            managers,
            chr,
            rng: SmallRng::from_entropy(),
            dialogue: None,
            script: None,
            active_npc: 0,
            active_quest: 0,
            open_shop: None,
            auto_pickup: false,
            pending_warp: None,
            quest_items,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn data(&self) -> &Arc<GameData> {
        &self.data
    }

    pub fn take_pending_warp(&mut self) -> Option<(u32, u8)> {
        self.pending_warp.take()
    }

    pub fn is_auto_pickup_enabled(&self) -> bool {
        self.auto_pickup
    }

    pub fn toggle_auto_pickup(&mut self) {
        self.auto_pickup = !self.auto_pickup;
    }

    fn ban(&self) -> PacketEdit {
        self.session.shutdown();
        PacketEdit
    }

    // ---- map transfer -------------------------------------------------

    /// Resolves a portal request into `(map, portal)`.
    ///
    /// `target == u32::MAX` means "the portal named `name` on my map".
    /// An explicit target is only legal for cinematic forced-returns and
    /// for the dead revive path.
    pub fn portal(&mut self, target: u32, name: &str) -> ActionResult<(u32, u8)> {
        let map = self.data.map_info(self.chr.map).ok_or_else(|| self.ban())?;

        if target == u32::MAX {
            let portal = map.portal_by_name(name).ok_or_else(|| self.ban())?;
            let target_map = portal.target_map.ok_or_else(|| self.ban())?;
            let destination = self
                .data
                .map_info(target_map)
                .ok_or_else(|| self.ban())?;
            let landing = portal
                .target_portal
                .as_deref()
                .and_then(|name| destination.portal_by_name(name))
                .map_or(0, |p| p.id);
            return Ok((target_map, landing));
        }

        if self.chr.hp > 0 {
            // Cinematic maps force the client back through an explicit
            // target; anything else with an explicit target is a teleport
            // hack.
            let forced = map.forced_return.ok_or_else(|| self.ban())?;
            if forced != target {
                return Err(self.ban());
            }
            let landing = self.spawn_portal(forced);
            Ok((forced, landing))
        } else {
            let town = map.nearest_town;
            if town != target {
                return Err(self.ban());
            }
            // Revive with a sliver of hp; the field change reports it.
            self.chr.hp = 50.min(self.chr.max_hp);
            let landing = self.spawn_portal(town);
            Ok((town, landing))
        }
    }

    fn spawn_portal(&self, map: u32) -> u8 {
        self.data
            .map_info(map)
            .and_then(|info| info.portal_by_name("sp"))
            .map_or(0, |p| p.id)
    }

    /// Commits a map change and tells the client.
    pub fn change_map(&mut self, target: u32, portal: u8) {
        self.chr.map = target;
        self.chr.spawn_point = portal;
        self.session.write(packets::change_map(target, portal, self.chr.hp));
    }

    /// Requests a warp; the actor picks it up after the current packet.
    pub fn warp(&mut self, map: u32, portal: u8) {
        self.pending_warp = Some((map, portal));
    }

    /// The init burst for a fresh connection's first field.
    pub fn new_map(&mut self) {
        self.session.write(packets::set_field(&self.chr));
        self.session.write(packets::keymap(&self.chr.key_map));
        self.session.write(Bytes::from_static(&[0x9F, 0x00, 0x00])); // quickslot init
        self.session.write(Bytes::from_static(&[0x7C, 0x00, 0x00])); // macro init
        self.session
            .write(Bytes::from_static(&[0x50, 0x01, 0x00, 0x00, 0x00, 0x00])); // auto hp
        self.session
            .write(Bytes::from_static(&[0x51, 0x01, 0x00, 0x00, 0x00, 0x00])); // auto mp
        self.session
            .write(Bytes::from_static(&[0x3F, 0x00, 0x07, 0x00])); // buddy list
        self.session.write(packets::set_gender(self.chr.gender));
        self.session.write(Bytes::from_static(&[0x2F, 0x00, 0x01])); // claim status
    }

    // ---- stats --------------------------------------------------------

    /// Sends a stat-change burst for `flags` out of the current values.
    pub fn commit_stats(&mut self, flags: u32) {
        let chr = &self.chr;
        let mut updates = Vec::new();
        let mut push = |flag: u32, value: i32| {
            if flags & flag != 0 {
                updates.push(StatUpdate { flag, value });
            }
        };
        push(stat::SKIN, i32::from(chr.skin));
        push(stat::FACE, chr.face as i32);
        push(stat::HAIR, chr.hair as i32);
        push(stat::LEVEL, i32::from(chr.level));
        push(stat::JOB, i32::from(chr.job));
        push(stat::STR, i32::from(chr.str));
        push(stat::DEX, i32::from(chr.dex));
        push(stat::INT, i32::from(chr.int));
        push(stat::LUK, i32::from(chr.luk));
        push(stat::HP, i32::from(chr.hp));
        push(stat::MAX_HP, i32::from(chr.max_hp));
        push(stat::MP, i32::from(chr.mp));
        push(stat::MAX_MP, i32::from(chr.max_mp));
        push(stat::AP, i32::from(chr.ap));
        push(stat::SP, i32::from(chr.sp));
        push(stat::EXP, chr.exp);
        push(stat::FAME, i32::from(chr.fame));
        push(stat::MESO, chr.mesos);
        self.session.write(packets::stat_change(true, &updates));
    }

    pub fn enable_actions(&mut self) {
        self.commit_stats(0);
    }

    /// Spends one AP on the stat `flag` names.
    pub fn assign_stat(&mut self, flag: u32) -> ActionResult<()> {
        if self.chr.ap <= 0 {
            return Err(self.ban());
        }
        match flag {
            stat::STR => self.chr.str += 1,
            stat::DEX => self.chr.dex += 1,
            stat::INT => self.chr.int += 1,
            stat::LUK => self.chr.luk += 1,
            _ => return Err(self.ban()),
        }
        self.chr.ap -= 1;
        self.commit_stats(stat::AP | flag);
        Ok(())
    }

    /// Spends one SP on `skill_id`.
    pub fn assign_sp(&mut self, skill_id: u32) -> ActionResult<()> {
        let master_level = self.data.skill_info(skill_id).ok_or_else(|| self.ban())?.master_level();
        if self.chr.sp <= 0 {
            return Err(self.ban());
        }
        let record = self.chr.skills.entry(skill_id).or_default();
        if record.level >= master_level {
            return Err(self.ban());
        }
        record.level += 1;
        record.master_level = master_level;
        let level = record.level;
        self.chr.sp -= 1;
        self.commit_stats(stat::SP);
        self.session
            .write(packets::update_skill(skill_id, level, master_level));
        Ok(())
    }

    /// Grants exp, spamming one level-change per level gained so the
    /// client plays the effect for each.
    pub fn gain_exp(&mut self, exp: i32, reward: bool) -> bool {
        self.session.write(packets::exp_gain(exp, reward));

        let before = self.chr.level;
        let levels = self.chr.gain_exp(exp);
        for i in 0..levels.saturating_sub(1) {
            self.session.write(packets::stat_change(
                true,
                &[StatUpdate {
                    flag: stat::LEVEL,
                    value: i32::from(before + i + 1),
                }],
            ));
        }
        let mut flags = stat::EXP;
        if levels > 0 {
            flags |= stat::LEVEL
                | stat::AP
                | stat::SP
                | stat::HP
                | stat::MAX_HP
                | stat::MP
                | stat::MAX_MP;
        }
        self.commit_stats(flags);
        levels > 0
    }

    pub fn gain_meso(&mut self, amount: i32, pickup: bool, reward: bool) -> bool {
        if !self.chr.adjust_mesos(amount) {
            return false;
        }
        if pickup {
            self.session.write(packets::meso_gain(amount, false));
        } else if reward {
            self.session.write(packets::meso_gain(amount, true));
        }
        self.commit_stats(stat::MESO);
        true
    }

    pub fn adjust_hp(&mut self, delta: i32) {
        self.chr.adjust_hp(delta);
        self.commit_stats(stat::HP);
    }

    pub fn adjust_mp(&mut self, delta: i32) {
        self.chr.adjust_mp(delta);
        self.commit_stats(stat::MP);
    }

    /// Damage from a monster (`source` id) or the environment.
    pub fn take_damage(&mut self, damage: i32) {
        if damage > 0 {
            self.chr.adjust_hp(-damage);
            self.commit_stats(stat::HP);
        }
    }

    // ---- items --------------------------------------------------------

    fn slot_max(&self, item_id: u32) -> i16 {
        self.data.item_info(item_id).map_or(100, |i| i.slot_max)
    }

    /// Adds a stack, reporting the inventory mutations to the client.
    /// `false` means the inventory was full (the caller keeps the drop on
    /// the ground).
    pub fn gain_stack(&mut self, stack: ItemStack) -> bool {
        let item_id = stack.item_id;
        let quantity = i32::from(stack.quantity);
        match self.chr.gain_stack(stack, self.slot_max(item_id)) {
            InventoryGain::Success(changes) => {
                self.session.write(packets::item_gain(item_id, quantity));
                self.session.write(packets::modify_items(&changes));
                true
            }
            InventoryGain::Full => {
                self.session.write(packets::inventory_full_notice());
                self.session.write(packets::modify_items(&[]));
                false
            }
        }
    }

    pub fn gain_equipment(&mut self, equip: Equipment) -> bool {
        let item_id = equip.item_id;
        match self.chr.gain_equipment(equip) {
            InventoryGain::Success(changes) => {
                self.session.write(packets::item_gain(item_id, 1));
                self.session.write(packets::modify_items(&changes));
                true
            }
            InventoryGain::Full => {
                self.session.write(packets::inventory_full_notice());
                self.session.write(packets::modify_items(&[]));
                false
            }
        }
    }

    /// Grants several item kinds at once (quest and script rewards).
    /// Either every entry lands or the count of unplaced entries is
    /// reported.
    pub fn gain_items(&mut self, items: &[(u32, i16)]) -> usize {
        let mut unplaced = 0;
        for &(item_id, count) in items {
            if count < 0 {
                if !self.chr.consume_item(item_id, -count) {
                    unplaced += 1;
                }
                continue;
            }

            let placed = if is_equip(item_id) {
                match self.data.equip_info(item_id) {
                    Some(info) => self.gain_equipment(Equipment::from_template(info)),
                    None => false,
                }
            } else {
                self.gain_stack(ItemStack::new(item_id, count))
            };
            if !placed {
                unplaced += 1;
            }
        }
        unplaced
    }

    pub fn has_item(&self, item_id: u32, count: i16) -> bool {
        self.chr.has_item(item_id, count)
    }

    /// Consumes a use item from `slot` and applies its effects.
    pub fn use_item(&mut self, slot: u8, item_id: u32) -> ActionResult<()> {
        let Some(tab) = tab_for(item_id) else {
            return Err(self.ban());
        };
        match self.chr.tabs[tab].get(slot) {
            Some(stack) if stack.item_id == item_id => {}
            _ => return Err(self.ban()),
        }
        self.chr.remove_from_slot(tab, slot, 1);
        self.session.write(packets::modify_items(&[
            packets::InventoryChange::Quantity {
                inventory: tab as u8 + 2,
                slot,
                quantity: self.chr.tabs[tab].get(slot).map_or(0, |s| s.quantity),
            },
        ]));
        self.apply_consumable(item_id);
        Ok(())
    }

    /// Applies a consumable without it ever entering the inventory.
    /// Monster cards register in the book instead of restoring anything.
    pub fn use_item_immediate(&mut self, item_id: u32) {
        if item_id / 10_000 == 238 {
            let count = self.chr.record_monster_card(item_id);
            self.session.write(packets::monster_book_add(item_id, count));
            return;
        }
        self.apply_consumable(item_id);
    }

    fn apply_consumable(&mut self, item_id: u32) {
        let Some(info) = self.data.consumable_info(item_id).copied() else {
            self.enable_actions();
            return;
        };
        let mut flags = 0;
        if info.hp != 0 || info.hp_r != 0 {
            let restore = i32::from(info.hp)
                + i32::from(self.chr.max_hp) * i32::from(info.hp_r) / 100;
            self.chr.adjust_hp(restore);
            flags |= stat::HP;
        }
        if info.mp != 0 || info.mp_r != 0 {
            let restore = i32::from(info.mp)
                + i32::from(self.chr.max_mp) * i32::from(info.mp_r) / 100;
            self.chr.adjust_mp(restore);
            flags |= stat::MP;
        }
        self.commit_stats(flags);
    }

    /// Moves an item between two slots of one inventory tab (merging
    /// stacks where they fit).
    pub fn move_item(&mut self, inventory: u8, src: u8, dst: u8) -> ActionResult<()> {
        match inventory {
            1 => {
                let Some(_) = self.chr.equip_inventory.get(src) else {
                    return Err(self.ban());
                };
                let moved = self.chr.equip_inventory.take(src);
                if let Some(previous) = self.chr.equip_inventory.put(dst, moved.unwrap_or_default())
                {
                    self.chr.equip_inventory.put(src, previous);
                }
            }
            2..=5 => {
                let tab = inventory as usize - 2;
                if self.chr.tabs[tab].get(src).is_none() {
                    return Err(self.ban());
                }
                if let Some(moved) = self.chr.tabs[tab].take(src) {
                    if let Some(previous) = self.chr.tabs[tab].put(dst, moved) {
                        self.chr.tabs[tab].put(src, previous);
                    }
                }
            }
            _ => return Err(self.ban()),
        }
        self.session
            .write(packets::modify_items(&[packets::InventoryChange::Move {
                inventory,
                from: src,
                to: dst,
            }]));
        Ok(())
    }

    pub fn equip_item(&mut self, src: u8) -> ActionResult<()> {
        if self.chr.equip_from_slot(src).is_none() {
            return Err(self.ban());
        }
        self.enable_actions();
        Ok(())
    }

    pub fn unequip_item(&mut self, slot: usize) -> ActionResult<()> {
        if !self.chr.unequip(slot) {
            return Err(self.ban());
        }
        self.enable_actions();
        Ok(())
    }

    /// Validates a meso drop request and debits the balance.
    pub fn drop_mesos(&mut self, amount: i32) -> ActionResult<DropPayload> {
        if !(10..=50_000).contains(&amount) {
            return Err(self.ban());
        }
        if !self.chr.adjust_mesos(-amount) {
            return Err(self.ban());
        }
        self.commit_stats(stat::MESO);
        Ok(DropPayload::Meso(amount))
    }

    /// Validates an item drop request and removes the stack.
    pub fn drop_item(&mut self, inventory: u8, slot: u8, count: i16) -> ActionResult<DropPayload> {
        if count <= 0 {
            return Err(self.ban());
        }
        match inventory {
            1 => {
                let equip = self.chr.equip_inventory.take(slot).ok_or_else(|| self.ban())?;
                self.session
                    .write(packets::modify_items(&[packets::InventoryChange::Remove {
                        inventory,
                        slot,
                    }]));
                Ok(DropPayload::Equip(equip))
            }
            2..=5 => {
                let tab = inventory as usize - 2;
                let stack = self
                    .chr
                    .remove_from_slot(tab, slot, count)
                    .ok_or_else(|| self.ban())?;
                if stack.quantity < count {
                    return Err(self.ban());
                }
                self.session
                    .write(packets::modify_items(&[packets::InventoryChange::Quantity {
                        inventory,
                        slot,
                        quantity: self.chr.tabs[tab].get(slot).map_or(0, |s| s.quantity),
                    }]));
                Ok(DropPayload::Item { quest: None, stack })
            }
            _ => Err(self.ban()),
        }
    }

    // ---- skills -------------------------------------------------------

    pub fn has_skill(&self, skill_id: u32) -> Option<u8> {
        self.chr
            .skills
            .get(&skill_id)
            .filter(|r| r.level > 0)
            .map(|r| r.level)
    }

    /// Burns one projectile unit, returning the projectile's item id.
    pub fn use_projectile(&mut self, amount: i16) -> ActionResult<u32> {
        let tab = 0; // use tab
        let found = self.chr.tabs[tab]
            .iter()
            .find(|(_, s)| s.item_id / 10_000 == 206 || s.item_id / 10_000 == 207)
            .map(|(slot, s)| (slot, s.item_id));
        let (slot, item_id) = found.ok_or_else(|| self.ban())?;
        let amount = amount.max(1);
        if self.chr.remove_from_slot(tab, slot, amount).is_none() {
            return Err(self.ban());
        }
        self.session
            .write(packets::modify_items(&[packets::InventoryChange::Quantity {
                inventory: 2,
                slot,
                quantity: self.chr.tabs[tab].get(slot).map_or(0, |s| s.quantity),
            }]));
        Ok(item_id)
    }

    /// Pays a skill's resource costs, returning the skill's level or 0
    /// when the hp/mp pool cannot cover them (the use simply fails).
    /// `projectile` must be present exactly when the skill consumes
    /// bullets; a mismatch is a packet edit.
    pub fn use_skill(
        &mut self,
        skill_id: u32,
        projectile: Option<&mut u32>,
    ) -> ActionResult<u8> {
        let level = self.has_skill(skill_id).ok_or_else(|| self.ban())?;
        let info = self.data.skill_info(skill_id).ok_or_else(|| self.ban())?;
        let level_info = *info.level(level).ok_or_else(|| self.ban())?;

        // Running dry on either resource is an honest failure, not an
        // edit; the cost may outrun the pool between send and processing.
        if i32::from(level_info.hp_con) >= i32::from(self.chr.hp) {
            return Ok(0);
        }
        if level_info.mp_con > self.chr.mp {
            return Ok(0);
        }
        self.chr.adjust_hp(i32::from(-level_info.hp_con));
        self.chr.adjust_mp(i32::from(-level_info.mp_con));

        match (level_info.bullet_count > 0, projectile) {
            (true, Some(out)) => *out = self.use_projectile(level_info.bullet_count)?,
            (false, None) => {}
            _ => return Err(self.ban()),
        }

        self.commit_stats(stat::HP | stat::MP);
        Ok(level)
    }

    /// Exp and quest progress for a batch of confirmed kills. Returns
    /// whether any level-up happened.
    pub fn kill_monsters(&mut self, mob_ids: &[u32]) -> bool {
        let mut leveled = false;
        for &mob_id in mob_ids {
            for (quest, progress) in self.chr.record_kill(mob_id) {
                self.session.write(packets::update_quest(quest, &progress));
            }
            let exp = self.data.monster_stats(mob_id).map_or(0, |s| s.exp);
            if exp > 0 && self.gain_exp(exp, false) {
                leveled = true;
            }
        }
        leveled
    }

    /// Chair validation: owning the chair item is required.
    pub fn chair(&mut self, chair_id: u32) -> ActionResult<bool> {
        if chair_id / 10_000 != 301 {
            return Err(self.ban());
        }
        Ok(self.chr.has_item(chair_id, 1))
    }

    // ---- auto pickup --------------------------------------------------

    /// Tries to vacuum a drop straight into the inventory. `true` means
    /// the map should remove the drop.
    pub fn auto_pickup(&mut self, drop: &MapDrop) -> bool {
        match &drop.payload {
            DropPayload::Meso(amount) => {
                self.gain_meso(*amount, true, false);
                true
            }
            DropPayload::Item { stack, .. } => {
                let consumed = self
                    .data
                    .consumable_info(stack.item_id)
                    .is_some_and(|i| i.consume_on_pickup);
                if consumed {
                    self.use_item_immediate(stack.item_id);
                    true
                } else {
                    self.gain_stack(stack.clone())
                }
            }
            DropPayload::Equip(equip) => self.gain_equipment(equip.clone()),
        }
    }

    // ---- quests -------------------------------------------------------

    fn quest_requirements_met(
        &self,
        info: &QuestInfo,
        requirements: &[QuestRequirement],
        npc: u32,
    ) -> bool {
        requirements.iter().all(|req| match req {
            QuestRequirement::Npc(id) => *id == npc,
            QuestRequirement::MinLevel(level) => self.chr.level >= *level,
            QuestRequirement::MaxLevel(level) => self.chr.level <= *level,
            QuestRequirement::Job(jobs) => jobs.contains(&self.chr.job),
            QuestRequirement::QuestCompleted(quest) => self.chr.is_quest_complete(*quest),
            QuestRequirement::Item { id, count } => {
                if *count > 0 {
                    self.chr.has_item(*id, *count)
                } else {
                    // A zero/negative count requires *not* carrying it.
                    !self.chr.has_item(*id, 1)
                }
            }
            QuestRequirement::Mob { id, count } => self
                .chr
                .quests
                .get(&info.id)
                .map_or(false, |progress| {
                    progress
                        .mobs
                        .iter()
                        .any(|m| m.mob_id == *id && m.count >= *count)
                }),
            QuestRequirement::Info { id, value } => {
                self.chr.quest_infos.get(id).is_some_and(|v| v == value)
            }
        })
    }

    /// Starts a quest at `npc`. Scripted starts allocate the quest start
    /// script and suspend; plain starts run the start acts immediately.
    pub fn start_quest(&mut self, quest: u16, npc: u32, scripted: bool) -> ActionResult<ScriptOutcome> {
        if scripted && self.script.is_some() {
            return Ok(ScriptOutcome::Done);
        }

        let info = self.data.quest_info(quest).cloned().ok_or_else(|| self.ban())?;
        if self.chr.is_quest_started(quest) || self.chr.is_quest_complete(quest) {
            return Ok(ScriptOutcome::Done);
        }
        if scripted != info.start_script {
            return Err(self.ban());
        }
        if !self.quest_requirements_met(&info, &info.start_requirements, npc) {
            return Ok(ScriptOutcome::Done);
        }

        self.active_npc = npc;
        self.active_quest = quest;

        if info.start_script {
            let script = self
                .managers
                .quest
                .alloc(&format!("{quest}-start"))
                .ok_or_else(|| self.ban())?;
            self.script = Some(script);
            return Ok(self.drive_script(0));
        }

        self.start_quest_now()?;
        Ok(ScriptOutcome::Done)
    }

    /// Runs the start acts and records the quest. Also used by quest
    /// start scripts once they decide the quest begins.
    pub fn start_quest_now(&mut self) -> ActionResult<bool> {
        let quest = self.active_quest;
        let npc = self.active_npc;
        let info = self.data.quest_info(quest).cloned().ok_or_else(|| self.ban())?;

        self.chr.start_quest(quest, info.mob_requirements());

        if !self.run_quest_acts(&info.start_acts.clone()) {
            self.chr.forfeit_quest(quest);
            return Ok(false);
        }

        // Quest-exclusive requirement items become visible now.
        let data = self.data.clone();
        let is_quest_item = |id: u32| data.item_info(id).is_some_and(|i| i.quest);
        let newly_visible: Vec<u32> = info.quest_item_requirements(is_quest_item).collect();
        self.quest_items.extend(newly_visible);

        let progress: String = self
            .chr
            .quests
            .get(&quest)
            .map(|p| p.progress_string())
            .unwrap_or_default();
        self.session.write(packets::update_quest(quest, &progress));
        self.session.write(packets::start_quest(quest, npc));
        Ok(true)
    }

    /// Ends a quest at `npc`; symmetric with [`Self::start_quest`].
    pub fn end_quest(&mut self, quest: u16, npc: u32, scripted: bool) -> ActionResult<ScriptOutcome> {
        if scripted && self.script.is_some() {
            return Ok(ScriptOutcome::Done);
        }

        let info = self.data.quest_info(quest).cloned().ok_or_else(|| self.ban())?;
        if !self.chr.is_quest_started(quest) || self.chr.is_quest_complete(quest) {
            return Ok(ScriptOutcome::Done);
        }
        if scripted != info.end_script {
            return Err(self.ban());
        }
        if !self.quest_requirements_met(&info, &info.end_requirements, npc) {
            return Ok(ScriptOutcome::Done);
        }

        self.active_npc = npc;
        self.active_quest = quest;

        if info.end_script {
            let script = self
                .managers
                .quest
                .alloc(&format!("{quest}-end"))
                .ok_or_else(|| self.ban())?;
            self.script = Some(script);
            return Ok(self.drive_script(0));
        }

        self.end_quest_now()?;
        Ok(ScriptOutcome::Done)
    }

    /// Records completion and runs the end acts.
    pub fn end_quest_now(&mut self) -> ActionResult<bool> {
        let quest = self.active_quest;
        let npc = self.active_npc;
        let info = self.data.quest_info(quest).cloned().ok_or_else(|| self.ban())?;

        // Required quest items leave both the inventory and the visible
        // set when the quest wraps up.
        let data = self.data.clone();
        let is_quest_item = |id: u32| data.item_info(id).is_some_and(|i| i.quest);
        for id in info.quest_item_requirements(is_quest_item) {
            self.quest_items.remove(&id);
        }
        for req in &info.end_requirements {
            if let QuestRequirement::Item { id, count } = req {
                if *count > 0 {
                    self.chr.consume_item(*id, *count);
                }
            }
        }

        if !self.run_quest_acts(&info.end_acts.clone()) {
            return Ok(false);
        }

        let now = unix_now();
        self.chr.complete_quest(quest, now);
        self.session.write(packets::complete_quest(quest, now));
        self.session.write(packets::quest_complete_effect());
        self.session
            .write(packets::end_quest(quest, npc, info.next_quest()));
        Ok(true)
    }

    fn run_quest_acts(&mut self, acts: &[QuestAct]) -> bool {
        let mut stat_flags = 0;

        // Weighted one-of-several item rewards roll a single winner; a
        // random reward needs a free slot in every tab up front.
        let weighted: Vec<&QuestAct> = acts
            .iter()
            .filter(|act| matches!(act, QuestAct::Item { prop, .. } if *prop > 0))
            .collect();
        let mut winner: Option<usize> = None;
        if !weighted.is_empty() {
            if !self.chr.has_free_slot_in_each_tab() {
                self.session.write(packets::popup_message(
                    "Please check if you have enough space in your inventory.",
                ));
                return false;
            }
            let total: i32 = weighted
                .iter()
                .map(|act| match act {
                    QuestAct::Item { prop, .. } => *prop,
                    _ => 0,
                })
                .sum();
            let mut roll = self.rng.gen_range(0..total.max(1));
            for (i, act) in weighted.iter().enumerate() {
                if let QuestAct::Item { prop, .. } = act {
                    roll -= prop;
                    if roll < 0 {
                        winner = Some(i);
                        break;
                    }
                }
            }
        }

        let mut weighted_seen = 0;
        let mut items = Vec::new();
        for act in acts {
            match act {
                QuestAct::Exp(exp) => {
                    self.gain_exp(*exp, true);
                }
                QuestAct::Meso(amount) => {
                    self.chr.adjust_mesos(*amount);
                    stat_flags |= stat::MESO;
                }
                QuestAct::Fame(delta) => {
                    self.chr.fame = self.chr.fame.saturating_add(*delta);
                    stat_flags |= stat::FAME;
                }
                QuestAct::Item { id, count, prop } => {
                    if *prop > 0 {
                        if winner == Some(weighted_seen) {
                            items.push((*id, *count));
                        }
                        weighted_seen += 1;
                    } else if !self.chr.has_item(*id, 1) || *count < 0 {
                        items.push((*id, *count));
                    }
                }
                QuestAct::NextQuest(_) => {}
            }
        }

        if !items.is_empty() && self.gain_items(&items) > 0 {
            self.session.write(packets::popup_message(
                "Please check if you have enough space in your inventory.",
            ));
            return false;
        }

        if stat_flags != 0 {
            self.commit_stats(stat_flags);
        }
        true
    }

    pub fn forfeit_quest(&mut self, quest: u16) -> bool {
        if !self.chr.forfeit_quest(quest) {
            return false;
        }
        if let Some(info) = self.data.quest_info(quest) {
            let data = self.data.clone();
            let is_quest_item = |id: u32| data.item_info(id).is_some_and(|i| i.quest);
            for id in info.quest_item_requirements(is_quest_item) {
                self.quest_items.remove(&id);
            }
        }
        self.session.write(packets::forfeit_quest(quest));
        true
    }

    pub fn quest_info_value(&self, id: u16) -> Option<&str> {
        self.chr.quest_infos.get(&id).map(String::as_str)
    }

    pub fn set_quest_info(&mut self, id: u16, value: &str) {
        self.chr.quest_infos.insert(id, value.to_owned());
        self.session.write(packets::update_quest(id, value));
    }

    // ---- scripts and dialogue -----------------------------------------

    /// Opens the NPC's conversation script.
    pub fn talk_npc(&mut self, npc: u32) -> ActionResult<ScriptOutcome> {
        if self.script.is_some() {
            return Ok(ScriptOutcome::Done);
        }
        let Some(script) = self.managers.npc.alloc(&npc.to_string()) else {
            debug!(npc, "npc has no script");
            self.enable_actions();
            return Ok(ScriptOutcome::Done);
        };
        self.active_npc = npc;
        self.script = Some(script);
        Ok(self.drive_script(0))
    }

    /// Runs a scripted portal by name.
    pub fn portal_script(&mut self, portal: &str) -> ActionResult<ScriptOutcome> {
        if self.script.is_some() {
            return Ok(ScriptOutcome::Done);
        }
        let Some(script) = self.managers.portal.alloc(portal) else {
            self.enable_actions();
            return Ok(ScriptOutcome::Done);
        };
        self.script = Some(script);
        Ok(self.drive_script(0))
    }

    /// Validates a dialogue answer against the state the script suspended
    /// on, then resumes it. Every mismatch is a packet edit.
    pub fn script_cont(&mut self, prev: u8, action: u8, selection: u32) -> ActionResult<ScriptOutcome> {
        if self.script.is_none() {
            return Ok(ScriptOutcome::Done);
        }
        let Some(dialogue) = self.dialogue else {
            return Err(self.close_script_and_ban());
        };

        if dialogue_wire_type(dialogue) != prev {
            return Err(self.close_script_and_ban());
        }

        // Empty dialogues (simple list, number box) cancel with action 0;
        // everything else cancels with 0xFF.
        let is_empty_dialogue =
            matches!(dialogue, DialogueKind::Simple { .. } | DialogueKind::GetNumber { .. });
        if (is_empty_dialogue && action == 0) || (!is_empty_dialogue && action == 0xFF) {
            self.close_script();
            return Ok(ScriptOutcome::Done);
        }
        if is_empty_dialogue && action != 1 {
            return Err(self.close_script_and_ban());
        }

        let answer = match dialogue {
            DialogueKind::Ok | DialogueKind::Next => {
                if action != 1 && action != 0 {
                    return Err(self.close_script_and_ban());
                }
                u32::from(action)
            }
            DialogueKind::Prev => {
                if action > 1 {
                    return Err(self.close_script_and_ban());
                }
                u32::from(action)
            }
            DialogueKind::YesNo
            | DialogueKind::AcceptDecline
            | DialogueKind::PrevNext => {
                if action > 1 {
                    return Err(self.close_script_and_ban());
                }
                u32::from(action)
            }
            DialogueKind::Simple { count } => {
                if selection >= count {
                    return Err(self.close_script_and_ban());
                }
                selection
            }
            DialogueKind::GetNumber { min, max } => {
                let value = selection as i32;
                if value < min || value > max {
                    return Err(self.close_script_and_ban());
                }
                selection
            }
            DialogueKind::Warp => return Err(self.close_script_and_ban()),
        };

        self.dialogue = None;
        Ok(self.drive_script(answer))
    }

    /// Resumes the script after the client confirmed a scripted warp.
    pub fn script_warp_ack(&mut self) -> ScriptOutcome {
        if self.script.is_none() || self.dialogue != Some(DialogueKind::Warp) {
            return ScriptOutcome::Done;
        }
        self.dialogue = None;
        self.drive_script(0)
    }

    /// Drops any suspended script, e.g. when a transport departs.
    pub fn close_script(&mut self) {
        self.script = None;
        self.dialogue = None;
    }

    fn close_script_and_ban(&mut self) -> PacketEdit {
        self.close_script();
        self.ban()
    }

    /// Executes script operations until it suspends or terminates.
    fn drive_script(&mut self, mut answer: u32) -> ScriptOutcome {
        loop {
            let Some(script) = &mut self.script else {
                return ScriptOutcome::Done;
            };
            let op = script.resume(answer);
            answer = 0;
            match op {
                ScriptOp::Ask { kind, text } => {
                    self.dialogue = Some(kind);
                    self.session.write(packets::npc_dialogue(
                        self.active_npc,
                        0,
                        &text,
                        &dialogue_shape(kind),
                    ));
                    return ScriptOutcome::Suspended;
                }
                ScriptOp::GiveItems(items) => {
                    self.gain_items(&items);
                }
                ScriptOp::GiveExp(exp) => {
                    self.gain_exp(exp, true);
                }
                ScriptOp::GiveMesos(amount) => {
                    self.gain_meso(amount, false, true);
                }
                ScriptOp::WarpTo { map, portal } => {
                    self.dialogue = Some(DialogueKind::Warp);
                    self.warp(map, portal);
                    return ScriptOutcome::Suspended;
                }
                ScriptOp::StartQuestNow => {
                    if self.start_quest_now().is_err() {
                        return ScriptOutcome::Ended;
                    }
                }
                ScriptOp::EndQuestNow => {
                    if self.end_quest_now().is_err() {
                        return ScriptOutcome::Ended;
                    }
                }
                ScriptOp::OpenShop(shop) => {
                    self.open_shop(shop);
                }
                ScriptOp::DropFromReactor => {
                    // Only meaningful in a reactor script, which the room
                    // drives; user scripts skip it.
                }
                ScriptOp::End(result) => {
                    self.close_script();
                    match result {
                        ScriptResult::Success => {
                            self.enable_actions();
                            return ScriptOutcome::Done;
                        }
                        ScriptResult::Next => return ScriptOutcome::Suspended,
                        ScriptResult::Kick | ScriptResult::Failure => {
                            self.session.shutdown();
                            return ScriptOutcome::Ended;
                        }
                    }
                }
            }
        }
    }

    // ---- shop ---------------------------------------------------------

    pub fn open_shop(&mut self, shop: u32) {
        let Some(info) = self.data.shop_info(shop) else {
            return;
        };
        let items: Vec<(u32, i32)> = info.items.iter().map(|i| (i.item_id, i.price)).collect();
        self.open_shop = Some(shop);
        self.session.write(packets::open_shop(shop, &items));
    }

    pub fn is_in_shop(&self) -> bool {
        self.open_shop.is_some()
    }

    /// Buys `quantity` of the item at shop position `position`. The client
    /// echoes the id and unit price; any mismatch with the table is an
    /// edit.
    pub fn buy(&mut self, position: u16, item_id: u32, quantity: i16, price: i32) -> ActionResult<()> {
        let shop = self.open_shop.ok_or_else(|| self.ban())?;
        let info = self.data.shop_info(shop).ok_or_else(|| self.ban())?;
        let entry = info.item(position).copied().ok_or_else(|| self.ban())?;
        if entry.item_id != item_id || entry.price != price || quantity <= 0 {
            return Err(self.ban());
        }

        let total = entry.price.saturating_mul(i32::from(quantity));
        if self.chr.mesos < total {
            self.session.write(packets::shop_result(3));
            return Ok(());
        }

        let placed = if is_equip(item_id) {
            match self.data.equip_info(item_id) {
                Some(equip) => self.gain_equipment(Equipment::from_template(equip)),
                None => return Err(self.ban()),
            }
        } else {
            self.gain_stack(ItemStack::new(item_id, quantity))
        };
        if !placed {
            self.session.write(packets::shop_result(2));
            return Ok(());
        }

        self.chr.adjust_mesos(-total);
        self.commit_stats(stat::MESO);
        self.session.write(packets::shop_result(0));
        Ok(())
    }

    /// Sells from the inventory at half the listed item price.
    pub fn sell(&mut self, inventory: u8, slot: u8, item_id: u32, quantity: i16) -> ActionResult<()> {
        if self.open_shop.is_none() || quantity <= 0 {
            return Err(self.ban());
        }

        let unit_price = self.data.item_info(item_id).map_or(0, |i| i.price / 2);
        match inventory {
            1 => {
                let equip = self.chr.equip_inventory.get(slot).ok_or_else(|| self.ban())?;
                if equip.item_id != item_id {
                    return Err(self.ban());
                }
                self.chr.equip_inventory.take(slot);
            }
            2..=5 => {
                let tab = inventory as usize - 2;
                match self.chr.tabs[tab].get(slot) {
                    Some(stack) if stack.item_id == item_id && stack.quantity >= quantity => {}
                    _ => return Err(self.ban()),
                }
                self.chr.remove_from_slot(tab, slot, quantity);
            }
            _ => return Err(self.ban()),
        }

        self.chr
            .adjust_mesos(unit_price.saturating_mul(i32::from(quantity)));
        self.commit_stats(stat::MESO);
        self.session.write(packets::shop_result(0));
        Ok(())
    }

    /// Refills a projectile stack for its listed price.
    pub fn recharge(&mut self, slot: u8) -> ActionResult<()> {
        if self.open_shop.is_none() {
            return Err(self.ban());
        }
        let (item_id, quantity) = match self.chr.tabs[0].get(slot) {
            Some(stack) if stack.item_id / 10_000 == 206 || stack.item_id / 10_000 == 207 => {
                (stack.item_id, stack.quantity)
            }
            _ => return Err(self.ban()),
        };
        let slot_max = self.slot_max(item_id);
        let missing = i32::from(slot_max - quantity);
        if missing <= 0 {
            return Ok(());
        }
        let price = self.data.item_info(item_id).map_or(1, |i| i.price.max(1));
        let cost = price.saturating_mul(missing) / i32::from(slot_max).max(1);
        if self.chr.mesos < cost {
            self.session.write(packets::shop_result(3));
            return Ok(());
        }
        self.chr.adjust_mesos(-cost);
        if let Some(stack) = self.chr.tabs[0].get_mut(slot) {
            stack.quantity = slot_max;
        }
        self.commit_stats(stat::MESO);
        self.session
            .write(packets::modify_items(&[packets::InventoryChange::Quantity {
                inventory: 2,
                slot,
                quantity: slot_max,
            }]));
        self.session.write(packets::shop_result(0));
        Ok(())
    }

    pub fn close_shop(&mut self) -> bool {
        self.open_shop.take().is_some()
    }

    // ---- key map ------------------------------------------------------

    pub fn change_keys(&mut self, changes: &[(u32, u8, u32)]) -> ActionResult<()> {
        for &(key, kind, action) in changes {
            if !self.chr.set_key(key, kind, action) {
                return Err(self.ban());
            }
        }
        Ok(())
    }

    // ---- misc ---------------------------------------------------------

    pub fn message(&self, text: &str) {
        self.session.write(packets::server_notice(text));
    }

    pub fn show_info(&self, path: &str) {
        self.session.write(packets::show_info(path));
    }

    pub fn open_storage(&self, npc: u32) {
        let storage = &self.chr.storage;
        self.session
            .write(packets::open_storage(npc, storage.slot_count, storage.mesos));
    }

    /// Full AP refund: stats return to their base line.
    pub fn reset_stats(&mut self) {
        let spent = (self.chr.str - 4) + (self.chr.dex - 4) + (self.chr.int - 4)
            + (self.chr.luk - 4);
        self.chr.ap = self.chr.ap.saturating_add(spent.max(0));
        self.chr.str = 4;
        self.chr.dex = 4;
        self.chr.int = 4;
        self.chr.luk = 4;
        self.commit_stats(stat::AP | stat::STR | stat::DEX | stat::INT | stat::LUK);
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// The wire value a dialogue type round-trips as in the client's answer.
fn dialogue_wire_type(kind: DialogueKind) -> u8 {
    match kind {
        DialogueKind::Ok => 0,
        DialogueKind::YesNo => 1,
        DialogueKind::GetNumber { .. } => 3,
        DialogueKind::Simple { .. } => 4,
        DialogueKind::Next => 5,
        DialogueKind::PrevNext => 6,
        DialogueKind::Prev => 7,
        DialogueKind::AcceptDecline => 0x0C,
        DialogueKind::Warp => 0xFE,
    }
}

fn dialogue_shape(kind: DialogueKind) -> DialogueShape {
    match kind {
        DialogueKind::Ok => DialogueShape::Ok,
        DialogueKind::YesNo => DialogueShape::YesNo,
        DialogueKind::Next => DialogueShape::Next,
        DialogueKind::PrevNext => DialogueShape::PrevNext,
        DialogueKind::Prev => DialogueShape::Prev,
        DialogueKind::AcceptDecline => DialogueShape::AcceptDecline,
        DialogueKind::Simple { count } => DialogueShape::Simple { count },
        DialogueKind::GetNumber { min, max } => DialogueShape::GetNumber {
            default: min,
            min,
            max,
        },
        DialogueKind::Warp => DialogueShape::Ok,
    }
}

#[cfg(test)]
mod tests {
    use grove_data::{MapInfo, PortalInfo, SkillInfo, SkillLevel};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::script::TableEngine;

    fn fixture_data() -> GameData {
        let mut data = GameData::default();
        data.insert_map(MapInfo {
            id: 100000000,
            forced_return: None,
            nearest_town: 100000001,
            seat_count: 0,
            portals: vec![PortalInfo {
                id: 1,
                name: "east".to_owned(),
                pos: grove_data::Point::new(0, 0),
                target_map: Some(100000001),
                target_portal: Some("west".to_owned()),
                script: None,
            }],
            lives: vec![],
            reactors: vec![],
            footholds: vec![],
        });
        data.insert_map(MapInfo {
            id: 100000001,
            forced_return: None,
            nearest_town: 100000001,
            seat_count: 0,
            portals: vec![
                PortalInfo {
                    id: 2,
                    name: "west".to_owned(),
                    pos: grove_data::Point::new(0, 0),
                    target_map: None,
                    target_portal: None,
                    script: None,
                },
                PortalInfo {
                    id: 0,
                    name: "sp".to_owned(),
                    pos: grove_data::Point::new(0, 0),
                    target_map: None,
                    target_portal: None,
                    script: None,
                },
            ],
            lives: vec![],
            reactors: vec![],
            footholds: vec![],
        });
        data.insert_skill(SkillInfo {
            id: 1001005,
            levels: vec![SkillLevel {
                hp_con: 0,
                mp_con: 5,
                bullet_count: 0,
            }],
        });
        data.insert_skill(SkillInfo {
            id: 3001004,
            levels: vec![SkillLevel {
                hp_con: 0,
                mp_con: 3,
                bullet_count: 1,
            }],
        });
        data
    }

    fn user_with(data: GameData) -> (User, flume::Receiver<crate::session::WriteRequest>) {
        let (session, rx) = Session::channel();
        session.set_id(1000);
        let chr = Character::new(1000, "tester".to_owned(), 100000000);
        let user = User::new(
            session,
            Arc::new(data),
            Arc::new(ScriptManagers::table_driven()),
            chr,
        );
        (user, rx)
    }

    fn drain(rx: &flume::Receiver<crate::session::WriteRequest>) -> Vec<Bytes> {
        rx.try_iter()
            .filter_map(|w| match w {
                crate::session::WriteRequest::Frame(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn wildcard_portal_resolves_by_name() {
        let (mut user, _rx) = user_with(fixture_data());
        let (map, portal) = user.portal(u32::MAX, "east").unwrap();
        assert_eq!(map, 100000001);
        assert_eq!(portal, 2);
    }

    #[test]
    fn explicit_portal_while_alive_is_a_ban() {
        let (mut user, _rx) = user_with(fixture_data());
        assert_eq!(user.portal(100000001, "east"), Err(PacketEdit));
        assert!(!user.session.is_open());
    }

    #[test]
    fn dead_portal_revives_to_town() {
        let (mut user, _rx) = user_with(fixture_data());
        user.chr.hp = 0;
        let (map, portal) = user.portal(100000001, "").unwrap();
        assert_eq!((map, portal), (100000001, 0));
        assert_eq!(user.chr.hp, 50);
    }

    #[test]
    fn assign_stat_rejects_unknown_flag() {
        let (mut user, _rx) = user_with(fixture_data());
        user.chr.ap = 1;
        assert_eq!(user.assign_stat(0x12345), Err(PacketEdit));
    }

    #[test]
    fn assign_stat_spends_ap() {
        let (mut user, _rx) = user_with(fixture_data());
        user.chr.ap = 2;
        let str_before = user.chr.str;
        user.assign_stat(stat::STR).unwrap();
        assert_eq!(user.chr.str, str_before + 1);
        assert_eq!(user.chr.ap, 1);
    }

    #[test]
    fn use_skill_without_declared_projectile_is_a_ban() {
        let (mut user, _rx) = user_with(fixture_data());
        user.chr.skills.insert(
            3001004,
            crate::character::SkillRecord {
                level: 1,
                master_level: 1,
            },
        );
        // Ranged skill without a projectile out-param: packet edit.
        assert_eq!(user.use_skill(3001004, None), Err(PacketEdit));
    }

    #[test]
    fn use_skill_deducts_mp() {
        let (mut user, _rx) = user_with(fixture_data());
        user.chr.skills.insert(
            1001005,
            crate::character::SkillRecord {
                level: 1,
                master_level: 1,
            },
        );
        user.chr.mp = 20;
        let level = user.use_skill(1001005, None).unwrap();
        assert_eq!(level, 1);
        assert_eq!(user.chr.mp, 15);
    }

    #[test]
    fn scripted_quest_start_suspends_then_finishes() {
        let mut data = fixture_data();
        data.insert_quest(grove_data::QuestInfo {
            id: 2040,
            start_script: true,
            end_script: false,
            start_requirements: vec![QuestRequirement::Npc(1012100)],
            end_requirements: vec![],
            start_acts: vec![],
            end_acts: vec![],
        });

        let (session, rx) = Session::channel();
        session.set_id(1000);
        let managers = ScriptManagers::table_driven();
        managers.quest.register(
            "2040-start",
            vec![
                ScriptOp::Ask {
                    kind: DialogueKind::Next,
                    text: "ready?".to_owned(),
                },
                ScriptOp::StartQuestNow,
                ScriptOp::End(ScriptResult::Success),
            ],
        );
        let mut user = User::new(
            session,
            Arc::new(data),
            Arc::new(managers),
            Character::new(1000, "tester".to_owned(), 100000000),
        );

        // Scripted start suspends on the Next dialogue.
        assert_eq!(
            user.start_quest(2040, 1012100, true).unwrap(),
            ScriptOutcome::Suspended
        );
        drain(&rx);

        // Advancing with the matching answer runs the start acts.
        assert_eq!(
            user.script_cont(5, 1, 0).unwrap(),
            ScriptOutcome::Done
        );
        assert!(user.chr.is_quest_started(2040));
        let packets = drain(&rx);
        assert!(!packets.is_empty());
    }

    #[test]
    fn dialogue_answer_for_wrong_state_is_a_ban() {
        let mut data = fixture_data();
        data.insert_quest(grove_data::QuestInfo {
            id: 2041,
            start_script: true,
            end_script: false,
            start_requirements: vec![],
            end_requirements: vec![],
            start_acts: vec![],
            end_acts: vec![],
        });
        let (session, _rx) = Session::channel();
        let managers = ScriptManagers::table_driven();
        managers.quest.register(
            "2041-start",
            vec![ScriptOp::Ask {
                kind: DialogueKind::YesNo,
                text: String::new(),
            }],
        );
        let mut user = User::new(
            session,
            Arc::new(data),
            Arc::new(managers),
            Character::new(1, "t".to_owned(), 100000000),
        );
        user.start_quest(2041, 0, true).unwrap();

        // Client claims the previous dialogue was `Next` (5): ban.
        assert_eq!(user.script_cont(5, 1, 0), Err(PacketEdit));
        assert!(!user.session().is_open());
    }

    #[test]
    fn unscripted_start_for_scripted_quest_is_a_ban() {
        let mut data = fixture_data();
        data.insert_quest(grove_data::QuestInfo {
            id: 2042,
            start_script: true,
            end_script: false,
            start_requirements: vec![],
            end_requirements: vec![],
            start_acts: vec![],
            end_acts: vec![],
        });
        let (mut user, _rx) = user_with(data);
        assert!(user.start_quest(2042, 0, false).is_err());
    }

    #[test]
    fn shop_buy_validates_the_table() {
        let mut data = fixture_data();
        data.insert_item(grove_data::ItemInfo {
            id: 2000000,
            quest: false,
            slot_max: 100,
            price: 50,
        });
        data.insert_shop(grove_data::ShopInfo {
            id: 9000,
            items: vec![grove_data::ShopItem {
                item_id: 2000000,
                price: 50,
            }],
        });
        let (mut user, rx) = user_with(data);
        user.chr.mesos = 1000;
        user.open_shop(9000);
        drain(&rx);

        user.buy(0, 2000000, 3, 50).unwrap();
        assert_eq!(user.chr.mesos, 850);
        assert_eq!(user.chr.item_quantity(2000000), 3);

        // Price mismatch: packet edit.
        assert_eq!(user.buy(0, 2000000, 1, 1), Err(PacketEdit));
    }
}
