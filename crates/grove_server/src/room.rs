//! A map instance bound to a worker.
//!
//! The [`Room`] aggregates the sessions on one map and is the only path
//! through which packets reach the [`Map`] simulation. Everything here
//! runs on the worker thread that owns the room; the map is behind a
//! `RefCell` and borrows never outlive a single handler.
//!
//! Broadcast discipline: [`Room::broadcast`] reaches every member;
//! [`Room::member_broadcast`] reaches everyone *except* the sender and is
//! used for "others see me do X" packets.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use grove_data::GameData;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::warn;

use crate::events::{EventKind, EventManager, ListenerId, PROPERTY_RESET, PROPERTY_SAILING};
use crate::map::{
    transport_role, DamageOutcome, DropPayload, JoinOutcome, Map, MapDrop, MapScheduler,
    MapTimerEvent, PlayerHandle, ReactorHitOutcome, TimerHandle,
};
use crate::packets::{self, AttackKind};
use crate::script::{DialogueKind, ScriptEngine, ScriptInstance, ScriptOp, ScriptResult};
use crate::session::Session;
use crate::user::User;

/// Commands a room (or map) sends back to a member's session task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActorCommand {
    Warp { map: u32, portal: u8 },
}

/// A suspended reactor script: the instance plus the reactor it is bound
/// to.
struct ReactorRun {
    instance: ScriptInstance,
    oid: u32,
    dialogue: Option<DialogueKind>,
}

/// One session's presence in a room.
pub struct RoomMember {
    session: Arc<Session>,
    user: Rc<RefCell<User>>,
    actor: flume::Sender<ActorCommand>,
    /// Index into the map's player array, patched by the map on
    /// relocation.
    pub(crate) player: PlayerHandle,
    /// Map-object oids this member has been shown (drop visibility).
    visible_objects: RefCell<FxHashSet<u32>>,
    /// x, y, foothold, stance.
    pose: Cell<(i16, i16, u16, u8)>,
    /// Occupied map seat, if sitting on one.
    seat: Cell<Option<u16>>,
    reactor_script: RefCell<Option<ReactorRun>>,
}

impl RoomMember {
    pub fn chr_id(&self) -> u32 {
        self.session.id()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn user(&self) -> &Rc<RefCell<User>> {
        &self.user
    }

    pub fn write(&self, packet: Bytes) {
        self.session.write(packet);
    }

    pub fn pose(&self) -> (i16, i16, u16, u8) {
        self.pose.get()
    }

    pub fn update_stance(&self, stance: u8) {
        let (x, y, fh, _) = self.pose.get();
        self.pose.set((x, y, fh, stance));
    }

    pub fn update_coords(&self, x: i16, y: i16, fh: u16) {
        let (_, _, _, stance) = self.pose.get();
        self.pose.set((x, y, fh, stance));
    }

    pub fn has_quest_item(&self, item_id: u32) -> bool {
        self.user.borrow().quest_items.contains(&item_id)
    }

    pub fn add_visible(&self, oid: u32) {
        self.visible_objects.borrow_mut().insert(oid);
    }

    pub fn can_see(&self, oid: u32) -> bool {
        self.visible_objects.borrow().contains(&oid)
    }

    pub fn auto_pickup_enabled(&self) -> bool {
        self.user.borrow().is_auto_pickup_enabled()
    }

    pub fn auto_pickup(&self, drop: &MapDrop) -> bool {
        self.user.borrow_mut().auto_pickup(drop)
    }

    pub fn request_warp(&self, map: u32, portal: u8) {
        let _ = self.actor.send(ActorCommand::Warp { map, portal });
    }

    pub fn close_script(&self) {
        self.user.borrow_mut().close_script();
        *self.reactor_script.borrow_mut() = None;
    }

    pub fn has_reactor_script(&self) -> bool {
        self.reactor_script.borrow().is_some()
    }
}

/// Outcome of asking a room to admit a session.
pub enum RoomJoin {
    Joined(Rc<RoomMember>),
    /// Transit map in the wrong phase; enter this map instead.
    Redirect { map: u32 },
}

/// Arms map timers as tasks on the owning worker's local set.
struct RoomScheduler {
    room: RefCell<Weak<Room>>,
}

impl MapScheduler for RoomScheduler {
    fn once(&self, delay: Duration, event: MapTimerEvent) -> TimerHandle {
        let weak = self.room.borrow().clone();
        TimerHandle::new(tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            if let Some(room) = weak.upgrade() {
                room.map_timer(event);
            }
        }))
    }
}

pub struct Room {
    id: u32,
    events: Arc<EventManager>,
    reactor_scripts: Arc<dyn ScriptEngine>,
    map: RefCell<Map>,
    members: RefCell<FxHashMap<u32, Rc<RoomMember>>>,
    /// Transport / area-boss listener registration, removed on destroy.
    listener: Cell<Option<(EventKind, ListenerId)>>,
}

impl Room {
    /// Creates the room and its map. `None` when the map id is unknown to
    /// the resource data.
    pub fn create(
        data: Arc<GameData>,
        events: Arc<EventManager>,
        reactor_scripts: Arc<dyn ScriptEngine>,
        id: u32,
    ) -> Option<Rc<Self>> {
        let scheduler = Rc::new(RoomScheduler {
            room: RefCell::new(Weak::new()),
        });
        let map = Map::new(
            data.clone(),
            events.clone(),
            scheduler.clone(),
            id,
            SmallRng::from_entropy(),
        )?;

        let room = Rc::new(Self {
            id,
            events,
            reactor_scripts,
            map: RefCell::new(map),
            members: RefCell::new(FxHashMap::default()),
            listener: Cell::new(None),
        });
        *scheduler.room.borrow_mut() = Rc::downgrade(&room);
        Some(room)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Subscribes the room to its transport (or area-boss) event. `wake`
    /// must deliver [`Room::on_event`] onto the owning worker; it runs on
    /// the scheduler thread.
    pub fn attach_event_listener(&self, wake: Box<dyn Fn() + Send + Sync>) {
        let registration = if let Some(role) = transport_role(self.id) {
            Some((role.event, PROPERTY_SAILING))
        } else {
            crate::map::area_boss_config(self.id)
                .map(|_| (EventKind::AreaBoss, PROPERTY_RESET))
        };

        if let Some((kind, property)) = registration {
            let id = self.events.add_listener(kind, property, wake);
            self.listener.set(Some((kind, id)));
        }
    }

    /// Delivered on the owning worker after the room's event property
    /// changed.
    pub fn on_event(&self) {
        let mut map = self.map.borrow_mut();
        if transport_role(self.id).is_some() {
            map.handle_transport_change();
        } else {
            map.on_area_boss_reset();
        }
    }

    /// A room may be torn down once nobody is in it and nothing on the
    /// map needs to outlive them.
    pub fn keep_alive(&self) -> bool {
        !self.members.borrow().is_empty() || self.map.borrow().keep_alive()
    }

    /// Drops the event listener; timers die with the map.
    pub fn destroy(&self) {
        if let Some((kind, id)) = self.listener.take() {
            self.events.remove_listener(kind, id);
        }
    }

    fn map_timer(&self, event: MapTimerEvent) {
        self.map.borrow_mut().handle_timer(event);
    }

    // ---- membership ---------------------------------------------------

    /// Admits a session. The user must already be pointed at this map.
    pub fn join(
        &self,
        user: Rc<RefCell<User>>,
        actor: flume::Sender<ActorCommand>,
    ) -> RoomJoin {
        let session = user.borrow().session().clone();
        let member = Rc::new(RoomMember {
            session,
            user,
            actor,
            player: Rc::new(Cell::new(usize::MAX)),
            visible_objects: RefCell::new(FxHashSet::default()),
            pose: Cell::new((0, 0, 0, 6)),
            seat: Cell::new(None),
            reactor_script: RefCell::new(None),
        });

        match self
            .map
            .borrow_mut()
            .join(member.clone(), member.player.clone())
        {
            JoinOutcome::Joined => {}
            JoinOutcome::Redirect { map } => return RoomJoin::Redirect { map },
        }

        self.members
            .borrow_mut()
            .insert(member.chr_id(), member.clone());
        RoomJoin::Joined(member)
    }

    pub fn leave(&self, member: &Rc<RoomMember>) {
        if let Some(seat) = member.seat.take() {
            self.map.borrow_mut().release_seat(seat);
        }
        *member.reactor_script.borrow_mut() = None;
        self.map.borrow_mut().leave(&member.player);
        self.members.borrow_mut().remove(&member.chr_id());
    }

    pub fn member_count(&self) -> usize {
        self.members.borrow().len()
    }

    pub fn for_each_member(&self, mut f: impl FnMut(&Rc<RoomMember>)) {
        for member in self.members.borrow().values() {
            f(member);
        }
    }

    pub fn broadcast(&self, packet: Bytes) {
        for member in self.members.borrow().values() {
            member.write(packet.clone());
        }
    }

    /// Everyone but the sender.
    pub fn member_broadcast(&self, sender: &RoomMember, packet: Bytes) {
        for member in self.members.borrow().values() {
            if member.chr_id() != sender.chr_id() {
                member.write(packet.clone());
            }
        }
    }

    // ---- movement -----------------------------------------------------

    pub fn move_member(&self, member: &RoomMember, movement: &[u8]) {
        self.member_broadcast(member, packets::move_player(member.chr_id(), movement));
    }

    // ---- attacks ------------------------------------------------------

    /// Compacts away oids that no longer name live monsters, keeping the
    /// damage rows aligned with their oids.
    fn fixup_monster_oids(
        &self,
        oids: &mut Vec<u32>,
        damage: &mut Vec<i32>,
        hit_count: usize,
    ) {
        let mut map = self.map.borrow_mut();
        let mut i = 0;
        while i < oids.len() {
            if map.is_monster(oids[i]) {
                i += 1;
                continue;
            }
            let last = oids.len() - 1;
            oids.swap_remove(i);
            for j in 0..hit_count {
                damage[i * hit_count + j] = damage[last * hit_count + j];
            }
            damage.truncate(oids.len() * hit_count);
        }
    }

    /// An attack packet: fan the animation out, apply the damage, emit
    /// loot and kill packets. Returns the ids of monsters that died.
    #[allow(clippy::too_many_arguments)]
    pub fn attack(
        &self,
        member: &RoomMember,
        kind: AttackKind,
        skill: u32,
        skill_level: u8,
        display: u8,
        direction: u8,
        stance: u8,
        speed: u8,
        hit_count: usize,
        mut oids: Vec<u32>,
        mut damage: Vec<i32>,
    ) -> Vec<u32> {
        self.fixup_monster_oids(&mut oids, &mut damage, hit_count);

        let targets: Vec<(u32, &[i32])> = oids
            .iter()
            .enumerate()
            .map(|(i, &oid)| (oid, &damage[i * hit_count..(i + 1) * hit_count]))
            .collect();
        self.member_broadcast(
            member,
            packets::attack(
                member.chr_id(),
                kind,
                skill,
                skill_level,
                oids.len() as u8,
                hit_count as u8,
                &targets,
                display,
                direction,
                stance,
                speed,
            ),
        );

        let mut killed = Vec::new();
        let mut map = self.map.borrow_mut();
        for (i, &oid) in oids.iter().enumerate() {
            let hits = &damage[i * hit_count..(i + 1) * hit_count];
            match map.damage_monster_by(&member.player, oid, hits) {
                DamageOutcome::Killed { mob_id } => killed.push(mob_id),
                DamageOutcome::Damaged | DamageOutcome::Invalid => {}
            }
        }
        killed
    }

    /// A single (non-attack) damage report against a monster, e.g. from
    /// touch damage reflection.
    pub fn damage_monster(&self, member: &RoomMember, oid: u32, damage: i32) -> Option<u32> {
        match self
            .map
            .borrow_mut()
            .damage_monster_by(&member.player, oid, &[damage])
        {
            DamageOutcome::Killed { mob_id } => Some(mob_id),
            _ => None,
        }
    }

    // ---- monsters -----------------------------------------------------

    pub fn monster_exists(&self, oid: u32, mob_id: u32) -> bool {
        self.map.borrow_mut().monster_exists(oid, mob_id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn move_monster(
        &self,
        member: &RoomMember,
        oid: u32,
        move_id: u16,
        activity: u8,
        skill_id: u8,
        skill_level: u8,
        option: u16,
        x: i16,
        y: i16,
        fh: u16,
        stance: u8,
        movement: &[u8],
    ) -> bool {
        if !self
            .map
            .borrow_mut()
            .move_monster(&member.player, oid, x, y, fh, stance)
        {
            return false;
        }

        self.member_broadcast(
            member,
            packets::move_monster(oid, true, activity, skill_id, skill_level, option, movement),
        );
        let mp = member.user.borrow().chr.mp;
        member.write(packets::move_monster_response(oid, move_id, mp));
        true
    }

    pub fn npc_id(&self, oid: u32) -> Option<u32> {
        self.map.borrow_mut().npc_id(oid)
    }

    // ---- seats --------------------------------------------------------

    /// A sit request: seat `0xFFFF` means stand up.
    pub fn sit(&self, member: &RoomMember, seat: u16) -> bool {
        if seat == u16::MAX {
            let Some(occupied) = member.seat.take() else {
                // Standing up without sitting is only legal when a chair
                // item is in use.
                member.write(packets::stand_up());
                self.member_broadcast(member, packets::set_chair(member.chr_id(), 0));
                return true;
            };
            self.map.borrow_mut().release_seat(occupied);
            member.write(packets::stand_up());
            return true;
        }

        if seat >= self.map.borrow().seat_count() {
            member.session.shutdown();
            return false;
        }
        if member.seat.get().is_some() {
            return true;
        }
        if !self.map.borrow_mut().try_occupy_seat(seat) {
            return true;
        }
        member.seat.set(Some(seat));
        member.write(packets::sit_on_map_seat(seat));
        true
    }

    /// Sitting on an owned chair item.
    pub fn chair(&self, member: &RoomMember, chair: u32) {
        self.member_broadcast(member, packets::set_chair(member.chr_id(), chair));
    }

    // ---- social -------------------------------------------------------

    pub fn chat(&self, member: &RoomMember, text: &str, show: u8) {
        self.broadcast(packets::chat(member.chr_id(), false, text, show));
    }

    pub fn emote(&self, member: &RoomMember, emote: u32) {
        self.member_broadcast(member, packets::emote(member.chr_id(), emote));
    }

    pub fn effect(&self, member: &RoomMember, effect: u8) {
        self.member_broadcast(member, packets::show_foreign_effect(member.chr_id(), effect));
    }

    pub fn level_up(&self, member: &RoomMember) {
        self.member_broadcast(member, packets::show_foreign_effect(member.chr_id(), 0));
    }

    pub fn show_damage(&self, member: &RoomMember, skill: u8, damage: i32, mob_id: u32, direction: u8) {
        self.member_broadcast(
            member,
            packets::damage_player(member.chr_id(), skill, damage, mob_id, direction),
        );
    }

    // ---- drops --------------------------------------------------------

    /// A player drops something out of their inventory.
    pub fn player_drop(&self, member: &RoomMember, payload: DropPayload) {
        self.map.borrow_mut().add_player_drop(&member.player, payload);
    }

    /// A pickup request. The drop must be visible to this member, and
    /// exclusivity must allow it.
    pub fn pick_up(&self, member: &RoomMember, oid: u32) {
        if !member.can_see(oid) {
            return;
        }

        let drop = {
            let mut map = self.map.borrow_mut();
            if !map.can_pick_up(&member.player, oid) {
                return;
            }
            map.drop(oid)
        };
        let Some(drop) = drop else {
            return;
        };

        let taken = member.user.borrow_mut().auto_pickup(&drop);
        if taken {
            self.map.borrow_mut().remove_drop(member.chr_id(), oid);
        }
    }

    /// Registers quest items that just became visible to the member.
    pub fn add_quest_items(&self, member: &RoomMember, items: &[u32]) {
        member
            .user
            .borrow_mut()
            .quest_items
            .extend(items.iter().copied());
    }

    // ---- reactors -----------------------------------------------------

    /// A reactor hit: advance the state machine; if it broke, run its
    /// action script bound to this member.
    pub fn hit_reactor(&self, member: &Rc<RoomMember>, oid: u32, stance: u8) -> bool {
        let outcome = self.map.borrow_mut().hit_reactor(oid, stance);
        match outcome {
            ReactorHitOutcome::Invalid => {
                member.session.shutdown();
                false
            }
            ReactorHitOutcome::Handled => true,
            ReactorHitOutcome::Broken { action } => {
                let Some(instance) = self.reactor_scripts.alloc(&action) else {
                    warn!(action, "missing reactor script");
                    // No script: the break still destroys the reactor.
                    self.map.borrow_mut().destroy_reactor(oid);
                    return true;
                };
                *member.reactor_script.borrow_mut() = Some(ReactorRun {
                    instance,
                    oid,
                    dialogue: None,
                });
                self.drive_reactor_script(member, 0)
            }
        }
    }

    /// Continues a suspended reactor script with a dialogue answer.
    pub fn continue_reactor_script(
        &self,
        member: &Rc<RoomMember>,
        prev: u8,
        action: u8,
        selection: u32,
    ) -> bool {
        let dialogue = {
            let run = member.reactor_script.borrow();
            let Some(run) = run.as_ref() else {
                return true;
            };
            run.dialogue
        };
        let Some(dialogue) = dialogue else {
            *member.reactor_script.borrow_mut() = None;
            member.session.shutdown();
            return false;
        };

        let wire = match dialogue {
            DialogueKind::Ok => 0,
            DialogueKind::YesNo => 1,
            DialogueKind::GetNumber { .. } => 3,
            DialogueKind::Simple { .. } => 4,
            DialogueKind::Next => 5,
            DialogueKind::PrevNext => 6,
            DialogueKind::Prev => 7,
            DialogueKind::AcceptDecline => 0x0C,
            DialogueKind::Warp => 0xFE,
        };
        if wire != prev {
            *member.reactor_script.borrow_mut() = None;
            member.session.shutdown();
            return false;
        }
        if action == 0xFF {
            *member.reactor_script.borrow_mut() = None;
            return true;
        }

        self.drive_reactor_script(member, selection.max(u32::from(action)))
    }

    fn drive_reactor_script(&self, member: &Rc<RoomMember>, mut answer: u32) -> bool {
        loop {
            let (op, oid) = {
                let mut run = member.reactor_script.borrow_mut();
                let Some(run) = run.as_mut() else {
                    return true;
                };
                (run.instance.resume(answer), run.oid)
            };
            answer = 0;

            match op {
                ScriptOp::DropFromReactor => {
                    self.map
                        .borrow_mut()
                        .drop_from_reactor(&member.player, oid);
                }
                ScriptOp::GiveItems(items) => {
                    member.user.borrow_mut().gain_items(&items);
                }
                ScriptOp::GiveExp(exp) => {
                    member.user.borrow_mut().gain_exp(exp, true);
                }
                ScriptOp::GiveMesos(amount) => {
                    member.user.borrow_mut().gain_meso(amount, false, true);
                }
                ScriptOp::Ask { kind, text } => {
                    if let Some(run) = member.reactor_script.borrow_mut().as_mut() {
                        run.dialogue = Some(kind);
                    }
                    let shape = match kind {
                        DialogueKind::YesNo => packets::DialogueShape::YesNo,
                        DialogueKind::Next => packets::DialogueShape::Next,
                        _ => packets::DialogueShape::Ok,
                    };
                    member.write(packets::npc_dialogue(0, 0, &text, &shape));
                    return true;
                }
                ScriptOp::WarpTo { map, portal } => {
                    member.user.borrow_mut().warp(map, portal);
                    member.request_warp(map, portal);
                }
                ScriptOp::StartQuestNow | ScriptOp::EndQuestNow | ScriptOp::OpenShop(_) => {
                    // Not part of the reactor surface.
                }
                ScriptOp::End(result) => {
                    *member.reactor_script.borrow_mut() = None;
                    match result {
                        ScriptResult::Success => {
                            let mut map = self.map.borrow_mut();
                            if !map.reactor_keep_alive(oid) {
                                map.destroy_reactor(oid);
                            }
                            return true;
                        }
                        ScriptResult::Next => return true,
                        ScriptResult::Failure | ScriptResult::Kick => {
                            member.session.shutdown();
                            return false;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
