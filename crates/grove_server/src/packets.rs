//! Outbound packet payload constructors.
//!
//! Every function builds one complete payload (opcode first). Constructors
//! stay dumb on purpose: validation happens in the callers, and the same
//! payload is fanned out to many sessions as a shared [`Bytes`].

use bytes::Bytes;
use grove_data::Point;
use grove_protocol::opcode::SendOpcode;
use grove_protocol::PacketWriter;

use crate::character::{Character, KEY_COUNT};
use crate::map::{DropPayload, MapDrop, Npc};

fn writer(opcode: SendOpcode) -> PacketWriter {
    PacketWriter::new(opcode as u16)
}

pub fn spawn_monster(oid: u32, id: u32, x: i16, y: i16, fh: u16, new_spawn: bool) -> Bytes {
    let mut w = writer(SendOpcode::SpawnMonster);
    w.write_u32(oid);
    w.write_u32(id);
    w.write_i16(x);
    w.write_i16(y);
    w.write_u16(fh);
    w.write_i8(if new_spawn { -2 } else { -1 });
    w.into_bytes()
}

pub fn kill_monster(oid: u32, animate: bool) -> Bytes {
    let mut w = writer(SendOpcode::KillMonster);
    w.write_u32(oid);
    w.write_bool(animate);
    w.into_bytes()
}

pub fn spawn_monster_controller(
    oid: u32,
    aggro: bool,
    id: u32,
    x: i16,
    y: i16,
    fh: u16,
    new_spawn: bool,
) -> Bytes {
    let mut w = writer(SendOpcode::SpawnMonsterController);
    w.write_u8(1);
    w.write_bool(aggro);
    w.write_u32(oid);
    w.write_u32(id);
    w.write_i16(x);
    w.write_i16(y);
    w.write_u16(fh);
    w.write_i8(if new_spawn { -2 } else { -1 });
    w.into_bytes()
}

pub fn remove_monster_controller(oid: u32) -> Bytes {
    let mut w = writer(SendOpcode::SpawnMonsterController);
    w.write_u8(0);
    w.write_u32(oid);
    w.into_bytes()
}

/// `percent` of max hp remaining, 0..=100.
pub fn monster_hp(oid: u32, percent: u8) -> Bytes {
    let mut w = writer(SendOpcode::MonsterHp);
    w.write_u32(oid);
    w.write_u8(percent);
    w.into_bytes()
}

#[allow(clippy::too_many_arguments)]
pub fn move_monster(
    oid: u32,
    use_skill: bool,
    activity: u8,
    skill_id: u8,
    skill_level: u8,
    option: u16,
    movement: &[u8],
) -> Bytes {
    let mut w = writer(SendOpcode::MoveMonster);
    w.write_u32(oid);
    w.write_bool(use_skill);
    w.write_u8(activity);
    w.write_u8(skill_id);
    w.write_u8(skill_level);
    w.write_u16(option);
    w.write_bytes(movement);
    w.into_bytes()
}

pub fn move_monster_response(oid: u32, move_id: u16, mp: i16) -> Bytes {
    let mut w = writer(SendOpcode::MoveMonsterResponse);
    w.write_u32(oid);
    w.write_u16(move_id);
    w.write_bool(false);
    w.write_i16(mp);
    w.into_bytes()
}

fn write_npc(w: &mut PacketWriter, npc: &Npc) {
    w.write_u32(npc.oid);
    w.write_u32(npc.id);
    w.write_i16(npc.x);
    w.write_i16(npc.cy);
    w.write_bool(!npc.flipped);
    w.write_u16(npc.fh);
    w.write_i16(npc.rx0);
    w.write_i16(npc.rx1);
    w.write_bool(true);
}

pub fn spawn_npc(npc: &Npc) -> Bytes {
    let mut w = writer(SendOpcode::SpawnNpc);
    write_npc(&mut w, npc);
    w.into_bytes()
}

pub fn spawn_npc_controller(npc: &Npc) -> Bytes {
    let mut w = writer(SendOpcode::SpawnNpcController);
    w.write_u8(1);
    write_npc(&mut w, npc);
    w.into_bytes()
}

/// Echoes an NPC animation request back to its sender.
pub fn npc_action(raw: &[u8]) -> Bytes {
    let mut w = writer(SendOpcode::NpcAction);
    w.write_bytes(raw);
    w.into_bytes()
}

/// `mode` 1 animates the drop falling from `origin`; 2 places it already
/// settled. Quest-item filtering happens in the map, not here.
#[allow(clippy::too_many_arguments)]
pub fn drop_object(
    drop: &MapDrop,
    owner_id: u32,
    mode: u8,
    origin: Point,
    dropper_oid: u32,
    player_drop: bool,
) -> Bytes {
    let mut w = writer(SendOpcode::DropObject);
    w.write_u8(mode);
    w.write_u32(drop.oid);
    match &drop.payload {
        DropPayload::Meso(amount) => {
            w.write_bool(true);
            w.write_i32(*amount);
        }
        DropPayload::Item { stack, .. } => {
            w.write_bool(false);
            w.write_u32(stack.item_id);
        }
        DropPayload::Equip(equip) => {
            w.write_bool(false);
            w.write_u32(equip.item_id);
        }
    }
    w.write_u32(owner_id);
    w.write_u8(u8::from(player_drop));
    w.write_i16(drop.pos.x);
    w.write_i16(drop.pos.y);
    w.write_i16(origin.x);
    w.write_i16(origin.y);
    w.write_u32(dropper_oid);
    w.into_bytes()
}

pub fn remove_drop(oid: u32) -> Bytes {
    let mut w = writer(SendOpcode::RemoveDrop);
    w.write_u8(0);
    w.write_u32(oid);
    w.into_bytes()
}

pub fn pickup_drop(oid: u32, pet: bool, char_id: u32) -> Bytes {
    let mut w = writer(SendOpcode::RemoveDrop);
    w.write_u8(if pet { 5 } else { 2 });
    w.write_u32(oid);
    w.write_u32(char_id);
    w.into_bytes()
}

pub fn spawn_reactor(oid: u32, id: u32, pos: Point, state: u8) -> Bytes {
    let mut w = writer(SendOpcode::SpawnReactor);
    w.write_u32(oid);
    w.write_u32(id);
    w.write_u8(state);
    w.write_i16(pos.x);
    w.write_i16(pos.y);
    w.write_u8(0);
    w.into_bytes()
}

pub fn change_reactor_state(oid: u32, state: u8, pos: Point, stance: u8) -> Bytes {
    let mut w = writer(SendOpcode::ChangeReactorState);
    w.write_u32(oid);
    w.write_u8(state);
    w.write_i16(pos.x);
    w.write_i16(pos.y);
    w.write_u8(stance);
    w.write_u8(5);
    w.into_bytes()
}

pub fn destroy_reactor(oid: u32, state: u8, pos: Point) -> Bytes {
    let mut w = writer(SendOpcode::DestroyReactor);
    w.write_u32(oid);
    w.write_u8(state);
    w.write_i16(pos.x);
    w.write_i16(pos.y);
    w.into_bytes()
}

/// Announces a character entering the map, with the pose it was last seen
/// in.
pub fn add_player(chr: &Character, x: i16, y: i16, fh: u16, stance: u8) -> Bytes {
    let mut w = writer(SendOpcode::SpawnPlayer);
    w.write_u32(chr.id);
    w.write_sized_string(&chr.name);
    w.write_u8(chr.level);
    w.write_u16(chr.job);
    w.write_u8(chr.skin);
    w.write_u32(chr.face);
    w.write_u32(chr.hair);
    w.write_i16(x);
    w.write_i16(y);
    w.write_u16(fh);
    w.write_u8(stance);
    w.into_bytes()
}

pub fn remove_player(char_id: u32) -> Bytes {
    let mut w = writer(SendOpcode::RemovePlayer);
    w.write_u32(char_id);
    w.into_bytes()
}

pub fn chat(char_id: u32, gm: bool, text: &str, show: u8) -> Bytes {
    let mut w = writer(SendOpcode::Chat);
    w.write_u32(char_id);
    w.write_bool(gm);
    w.write_sized_string(text);
    w.write_u8(show);
    w.into_bytes()
}

pub fn emote(char_id: u32, emote: u32) -> Bytes {
    let mut w = writer(SendOpcode::Emote);
    w.write_u32(char_id);
    w.write_u32(emote);
    w.into_bytes()
}

pub fn show_foreign_effect(char_id: u32, effect: u8) -> Bytes {
    let mut w = writer(SendOpcode::ShowForeignEffect);
    w.write_u32(char_id);
    w.write_u8(effect);
    w.into_bytes()
}

pub fn damage_player(
    char_id: u32,
    skill: u8,
    damage: i32,
    monster_id: u32,
    direction: u8,
) -> Bytes {
    let mut w = writer(SendOpcode::DamagePlayer);
    w.write_u32(char_id);
    w.write_u8(skill);
    w.write_i32(damage);
    w.write_u32(monster_id);
    w.write_u8(direction);
    w.write_u8(0);
    w.into_bytes()
}

pub fn set_chair(char_id: u32, chair: u32) -> Bytes {
    let mut w = writer(SendOpcode::SetChair);
    w.write_u32(char_id);
    w.write_u32(chair);
    w.into_bytes()
}

pub fn sit_on_map_seat(seat: u16) -> Bytes {
    let mut w = writer(SendOpcode::SitResult);
    w.write_u8(1);
    w.write_u16(seat);
    w.into_bytes()
}

pub fn stand_up() -> Bytes {
    let mut w = writer(SendOpcode::SitResult);
    w.write_u8(0);
    w.into_bytes()
}

pub fn move_player(char_id: u32, movement: &[u8]) -> Bytes {
    let mut w = writer(SendOpcode::MovePlayer);
    w.write_u32(char_id);
    w.write_u32(0);
    w.write_bytes(movement);
    w.into_bytes()
}

/// Attack fan-out, shared by the three attack shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttackKind {
    CloseRange,
    Ranged { projectile: u32 },
    Magic,
}

#[allow(clippy::too_many_arguments)]
pub fn attack(
    char_id: u32,
    kind: AttackKind,
    skill: u32,
    skill_level: u8,
    monster_count: u8,
    hit_count: u8,
    targets: &[(u32, &[i32])],
    display: u8,
    direction: u8,
    stance: u8,
    speed: u8,
) -> Bytes {
    let mut w = writer(SendOpcode::UpdatePlayer);
    w.write_u32(char_id);
    w.write_u8(match kind {
        AttackKind::CloseRange => 0,
        AttackKind::Ranged { .. } => 1,
        AttackKind::Magic => 2,
    });
    w.write_u8((monster_count << 4) | (hit_count & 0xF));
    w.write_u32(skill);
    w.write_u8(skill_level);
    w.write_u8(display);
    w.write_u8(direction);
    w.write_u8(stance);
    w.write_u8(speed);
    if let AttackKind::Ranged { projectile } = kind {
        w.write_u32(projectile);
    }
    for (oid, damage) in targets {
        w.write_u32(*oid);
        for hit in *damage {
            w.write_i32(*hit);
        }
    }
    w.into_bytes()
}

/// Stat flags, matching the order stats are written in a stat-change
/// burst.
pub mod stat {
    pub const SKIN: u32 = 0x1;
    pub const FACE: u32 = 0x2;
    pub const HAIR: u32 = 0x4;
    pub const LEVEL: u32 = 0x10;
    pub const JOB: u32 = 0x20;
    pub const STR: u32 = 0x40;
    pub const DEX: u32 = 0x80;
    pub const INT: u32 = 0x100;
    pub const LUK: u32 = 0x200;
    pub const HP: u32 = 0x400;
    pub const MAX_HP: u32 = 0x800;
    pub const MP: u32 = 0x1000;
    pub const MAX_MP: u32 = 0x2000;
    pub const AP: u32 = 0x4000;
    pub const SP: u32 = 0x8000;
    pub const EXP: u32 = 0x10000;
    pub const FAME: u32 = 0x20000;
    pub const MESO: u32 = 0x40000;
}

/// One stat slot in a stat-change burst. Width on the wire depends on the
/// flag.
#[derive(Clone, Copy, Debug)]
pub struct StatUpdate {
    pub flag: u32,
    pub value: i32,
}

/// A stat-change burst; with no updates it just re-enables client actions.
pub fn stat_change(enable_actions: bool, updates: &[StatUpdate]) -> Bytes {
    let mut w = writer(SendOpcode::StatChange);
    w.write_bool(enable_actions);
    let mut flags = 0;
    for update in updates {
        flags |= update.flag;
    }
    w.write_u32(flags);
    let mut ordered: Vec<StatUpdate> = updates.to_vec();
    ordered.sort_by_key(|u| u.flag);
    for update in ordered {
        match update.flag {
            stat::SKIN | stat::LEVEL => w.write_u8(update.value as u8),
            stat::JOB | stat::STR | stat::DEX | stat::INT | stat::LUK | stat::HP
            | stat::MAX_HP | stat::MP | stat::MAX_MP | stat::AP | stat::SP | stat::FAME => {
                w.write_i16(update.value as i16);
            }
            _ => w.write_i32(update.value),
        }
    }
    w.into_bytes()
}

pub fn exp_gain(exp: i32, in_chat: bool) -> Bytes {
    let mut w = writer(SendOpcode::ShowStatusInfo);
    w.write_u8(3);
    w.write_bool(true);
    w.write_i32(exp);
    w.write_bool(in_chat);
    w.into_bytes()
}

pub fn meso_gain(amount: i32, in_chat: bool) -> Bytes {
    let mut w = writer(SendOpcode::ShowStatusInfo);
    w.write_u8(if in_chat { 5 } else { 0 });
    w.write_bool(true);
    w.write_i32(amount);
    w.into_bytes()
}

pub fn item_gain(item_id: u32, quantity: i32) -> Bytes {
    let mut w = writer(SendOpcode::ShowStatusInfo);
    w.write_u8(0);
    w.write_u8(0);
    w.write_u32(item_id);
    w.write_i32(quantity);
    w.into_bytes()
}

pub fn inventory_full_notice() -> Bytes {
    let mut w = writer(SendOpcode::ShowStatusInfo);
    w.write_u8(0);
    w.write_u8(0xFF);
    w.into_bytes()
}

pub fn item_unavailable_notice() -> Bytes {
    let mut w = writer(SendOpcode::ShowStatusInfo);
    w.write_u8(0);
    w.write_u8(0xFE);
    w.into_bytes()
}

/// A single inventory mutation, for the modify-items burst.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InventoryChange {
    Add { inventory: u8, slot: u8, item_id: u32, quantity: i16 },
    Quantity { inventory: u8, slot: u8, quantity: i16 },
    Move { inventory: u8, from: u8, to: u8 },
    Remove { inventory: u8, slot: u8 },
}

pub fn modify_items(changes: &[InventoryChange]) -> Bytes {
    let mut w = writer(SendOpcode::ModifyInventory);
    w.write_bool(true);
    w.write_u8(changes.len() as u8);
    for change in changes {
        match change {
            InventoryChange::Add { inventory, slot, item_id, quantity } => {
                w.write_u8(0);
                w.write_u8(*inventory);
                w.write_u8(*slot);
                w.write_u32(*item_id);
                w.write_i16(*quantity);
            }
            InventoryChange::Quantity { inventory, slot, quantity } => {
                w.write_u8(1);
                w.write_u8(*inventory);
                w.write_u8(*slot);
                w.write_i16(*quantity);
            }
            InventoryChange::Move { inventory, from, to } => {
                w.write_u8(2);
                w.write_u8(*inventory);
                w.write_u8(*from);
                w.write_u8(*to);
            }
            InventoryChange::Remove { inventory, slot } => {
                w.write_u8(3);
                w.write_u8(*inventory);
                w.write_u8(*slot);
            }
        }
    }
    w.into_bytes()
}

pub fn monster_book_add(card_id: u32, count: u8) -> Bytes {
    let mut w = writer(SendOpcode::MonsterBookAdd);
    w.write_bool(true);
    w.write_u32(card_id);
    w.write_u8(count);
    w.into_bytes()
}

pub fn update_skill(skill: u32, level: u8, master: u8) -> Bytes {
    let mut w = writer(SendOpcode::UpdateSkill);
    w.write_bool(true);
    w.write_u16(1);
    w.write_u32(skill);
    w.write_i32(i32::from(level));
    w.write_i32(i32::from(master));
    w.write_bool(true);
    w.into_bytes()
}

pub fn update_quest(quest: u16, progress: &str) -> Bytes {
    let mut w = writer(SendOpcode::ShowStatusInfo);
    w.write_u8(1);
    w.write_u16(quest);
    w.write_u8(1);
    w.write_sized_string(progress);
    w.into_bytes()
}

pub fn complete_quest(quest: u16, completed_at: i64) -> Bytes {
    let mut w = writer(SendOpcode::ShowStatusInfo);
    w.write_u8(1);
    w.write_u16(quest);
    w.write_u8(2);
    w.write_u64(completed_at as u64);
    w.into_bytes()
}

pub fn forfeit_quest(quest: u16) -> Bytes {
    let mut w = writer(SendOpcode::ShowStatusInfo);
    w.write_u8(1);
    w.write_u16(quest);
    w.write_u8(0);
    w.into_bytes()
}

pub fn start_quest(quest: u16, npc: u32) -> Bytes {
    let mut w = writer(SendOpcode::QuestResult);
    w.write_u8(8);
    w.write_u16(quest);
    w.write_u32(npc);
    w.write_u16(0);
    w.into_bytes()
}

pub fn end_quest(quest: u16, npc: u32, next_quest: Option<u16>) -> Bytes {
    let mut w = writer(SendOpcode::QuestResult);
    w.write_u8(8);
    w.write_u16(quest);
    w.write_u32(npc);
    w.write_u16(next_quest.unwrap_or(0));
    w.into_bytes()
}

/// Show-effect 0x09 is the quest-complete jingle.
pub fn quest_complete_effect() -> Bytes {
    let mut w = writer(SendOpcode::ShowEffect);
    w.write_u8(0x09);
    w.into_bytes()
}

/// The dialogue shapes a script can put on screen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialogueShape {
    Ok,
    YesNo,
    Next,
    PrevNext,
    Prev,
    AcceptDecline,
    Simple { count: u32 },
    GetNumber { default: i32, min: i32, max: i32 },
}

pub fn npc_dialogue(npc: u32, speaker: u8, text: &str, shape: &DialogueShape) -> Bytes {
    let mut w = writer(SendOpcode::NpcDialogue);
    w.write_u8(4);
    w.write_u32(npc);
    let kind: u8 = match shape {
        DialogueShape::Ok => 0,
        DialogueShape::YesNo => 1,
        DialogueShape::GetNumber { .. } => 3,
        DialogueShape::Simple { .. } => 4,
        DialogueShape::Next => 5,
        DialogueShape::PrevNext => 6,
        DialogueShape::Prev => 7,
        DialogueShape::AcceptDecline => 0x0C,
    };
    w.write_u8(kind);
    w.write_u8(speaker);
    w.write_sized_string(text);
    match shape {
        DialogueShape::Next => {
            w.write_bool(false);
            w.write_bool(true);
        }
        DialogueShape::PrevNext => {
            w.write_bool(true);
            w.write_bool(true);
        }
        DialogueShape::Prev => {
            w.write_bool(true);
            w.write_bool(false);
        }
        DialogueShape::Simple { count } => w.write_u32(*count),
        DialogueShape::GetNumber { default, min, max } => {
            w.write_i32(*default);
            w.write_i32(*min);
            w.write_i32(*max);
        }
        _ => {}
    }
    w.into_bytes()
}

pub fn open_shop(shop_id: u32, items: &[(u32, i32)]) -> Bytes {
    let mut w = writer(SendOpcode::OpenShop);
    w.write_u32(shop_id);
    w.write_u16(items.len() as u16);
    for (item_id, price) in items {
        w.write_u32(*item_id);
        w.write_i32(*price);
    }
    w.into_bytes()
}

/// 0 = bought/sold ok, 2 = out of stock, 3 = not enough mesos.
pub fn shop_result(code: u8) -> Bytes {
    let mut w = writer(SendOpcode::ShopResult);
    w.write_u8(code);
    w.into_bytes()
}

pub fn change_map(map: u32, portal: u8, hp: i16) -> Bytes {
    let mut w = writer(SendOpcode::SetField);
    w.write_u32(0);
    w.write_bool(false);
    w.write_u32(map);
    w.write_u8(portal);
    w.write_i16(hp);
    w.into_bytes()
}

/// The full init burst's first packet: character sheet plus spawn map.
pub fn set_field(chr: &Character) -> Bytes {
    let mut w = writer(SendOpcode::SetField);
    w.write_u32(0);
    w.write_bool(true);
    w.write_u32(chr.id);
    w.write_sized_string(&chr.name);
    w.write_u8(chr.level);
    w.write_u16(chr.job);
    w.write_i32(chr.exp);
    w.write_i16(chr.hp);
    w.write_i16(chr.max_hp);
    w.write_i16(chr.mp);
    w.write_i16(chr.max_mp);
    w.write_i16(chr.str);
    w.write_i16(chr.dex);
    w.write_i16(chr.int);
    w.write_i16(chr.luk);
    w.write_i16(chr.ap);
    w.write_i16(chr.sp);
    w.write_i16(chr.fame);
    w.write_i32(chr.mesos);
    w.write_u32(chr.map);
    w.write_u8(chr.spawn_point);
    w.into_bytes()
}

pub fn keymap(bindings: &[(u8, u32); KEY_COUNT]) -> Bytes {
    let mut w = writer(SendOpcode::Keymap);
    w.write_bool(false);
    for (kind, action) in bindings {
        w.write_u8(*kind);
        w.write_u32(*action);
    }
    w.into_bytes()
}

pub fn set_gender(gender: u8) -> Bytes {
    let mut w = writer(SendOpcode::SetGender);
    w.write_u8(gender);
    w.into_bytes()
}

pub fn server_notice(text: &str) -> Bytes {
    let mut w = writer(SendOpcode::ServerNotice);
    w.write_u8(0);
    w.write_sized_string(text);
    w.into_bytes()
}

pub fn popup_message(text: &str) -> Bytes {
    let mut w = writer(SendOpcode::ServerNotice);
    w.write_u8(1);
    w.write_sized_string(text);
    w.into_bytes()
}

pub fn play_sound(name: &str) -> Bytes {
    let mut w = writer(SendOpcode::PlaySound);
    w.write_u8(4);
    w.write_sized_string(name);
    w.into_bytes()
}

/// `docked` pulls the boat into view; departing removes it.
pub fn boat(docked: bool) -> Bytes {
    let mut w = writer(SendOpcode::Boat);
    w.write_u16(if docked { 1 } else { 2 });
    w.into_bytes()
}

pub fn show_info(path: &str) -> Bytes {
    let mut w = writer(SendOpcode::ShowInfo);
    w.write_u8(0x17);
    w.write_sized_string(path);
    w.into_bytes()
}

pub fn open_storage(npc: u32, slots: u8, mesos: i32) -> Bytes {
    let mut w = writer(SendOpcode::OpenStorage);
    w.write_u32(npc);
    w.write_u8(slots);
    w.write_i32(mesos);
    w.into_bytes()
}

#[cfg(test)]
pub(crate) fn opcode_of(packet: &Bytes) -> u16 {
    u16::from_le_bytes([packet[0], packet[1]])
}
