//! The channel server: accept loop, session lifecycle, packet dispatch.
//!
//! A connection's life: accept → 16-byte hello with fresh IVs → the init
//! frame (opcode 0x0014 with the session id handed out by the login
//! server) → character hydration under the store lock → admission into
//! the initial room on the worker the coordinator names → the packet
//! loop. Portal transfers cancel the read on the source worker, flush
//! pending writes, and resume reading on the destination worker.

use std::net::Ipv4Addr;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use grove_data::GameData;
use grove_protocol::opcode::RecvOpcode;
use grove_protocol::{
    hello_packet, DecryptContext, EncryptContext, FrameDecoder, PacketReader, ReadError,
    GAME_VERSION, INIT_OPCODE,
};

use crate::character::Character;
use crate::config::{ChannelConfig, CLIENT_PORT};
use crate::coordinator::RoomThreadCoordinator;
use crate::db::{CharacterStore, DbConnection};
use crate::events::{self, EventManager};
use crate::packets::{self, AttackKind};
use crate::persist;
use crate::room::{ActorCommand, Room, RoomJoin, RoomMember};
use crate::script::ScriptManagers;
use crate::session::{spawn_writer, Session};
use crate::user::{PacketEdit, ScriptOutcome, User};
use crate::worker::{ThreadPool, WorkerHandle, WorkerLocal};

const READ_BUF_SIZE: usize = 4096;

/// Forwards session-disconnect notices to the login-control channel.
pub struct LoginNotifier {
    tx: flume::Sender<u32>,
}

impl LoginNotifier {
    pub fn notify(&self, session_id: u32) {
        let _ = self.tx.send(session_id);
    }
}

/// Immutable state shared by every worker and the accept loop.
pub struct ChannelShared {
    pub data: Arc<GameData>,
    pub events: Arc<EventManager>,
    pub managers: Arc<ScriptManagers>,
    pub coordinator: RoomThreadCoordinator,
    pub db: DbConnection,
    pub workers: Vec<WorkerHandle>,
    pub login: LoginNotifier,
}

pub struct ChannelServer {
    shared: Arc<ChannelShared>,
    pool: ThreadPool,
    listener: TcpListener,
}

impl ChannelServer {
    /// Binds the client listener on the default port, spawns the worker
    /// pool, the event schedulers and the login-control task.
    pub async fn bind(
        config: ChannelConfig,
        data: Arc<GameData>,
        store: Arc<dyn CharacterStore>,
        managers: Arc<ScriptManagers>,
    ) -> anyhow::Result<Self> {
        Self::bind_on(CLIENT_PORT, config, data, store, managers).await
    }

    /// Binds on an explicit port (0 picks an ephemeral one).
    pub async fn bind_on(
        port: u16,
        config: ChannelConfig,
        data: Arc<GameData>,
        store: Arc<dyn CharacterStore>,
        managers: Arc<ScriptManagers>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .context("binding the client listener")?;

        let worker_count = std::thread::available_parallelism().map_or(1, |n| n.get());
        let pool = ThreadPool::new(worker_count).context("spawning the worker pool")?;
        let workers: Vec<WorkerHandle> = (0..pool.len()).map(|i| pool.worker(i).clone()).collect();

        let events = Arc::new(EventManager::new());
        events::start_schedulers(&events);

        let (login_tx, login_rx) = flume::unbounded();
        tokio::spawn(run_login_control(config.listen.clone(), login_rx));

        let shared = Arc::new(ChannelShared {
            data,
            events,
            managers,
            coordinator: RoomThreadCoordinator::new(),
            db: DbConnection::new(store),
            workers,
            login: LoginNotifier { tx: login_tx },
        });

        info!(port, workers = worker_count, "channel up");
        Ok(Self {
            shared,
            pool,
            listener,
        })
    }

    /// The address the client listener actually bound.
    pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections forever.
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await.context("accepting")?;
            debug!(%addr, "connection");
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(shared, stream).await {
                    debug!("connection ended: {e:#}");
                }
            });
        }
    }

    /// Stops accepting and tears the worker pool down. Live sessions are
    /// dropped without a flush; orderly shutdown drains sessions first.
    pub fn shutdown(self) {
        self.pool.shutdown();
    }
}

// ---- handshake --------------------------------------------------------

async fn handle_connection(
    shared: Arc<ChannelShared>,
    stream: tokio::net::TcpStream,
) -> anyhow::Result<()> {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {e}");
    }

    let recv_iv: [u8; 4] = rand::random();
    let send_iv: [u8; 4] = rand::random();

    let (read, mut write) = stream.into_split();
    write.write_all(&hello_packet(recv_iv, send_iv)).await?;

    let (session, write_queue) = Session::channel();
    spawn_writer(write_queue, EncryptContext::new(send_iv, GAME_VERSION), write);

    let mut decoder = FrameDecoder::new(DecryptContext::new(recv_iv, GAME_VERSION));
    let mut read = read;
    let id = read_init_packet(&mut read, &mut decoder).await?;
    session.set_id(id);

    // Hydrate the character under the store lock.
    let chr = match shared.db.acquire().await.load_character(id).await {
        Ok(chr) => chr,
        Err(e) => {
            warn!(id, "hydration failed: {e}");
            session.shutdown();
            return Ok(());
        }
    };

    admit(shared, session, read, decoder, chr);
    Ok(())
}

/// Reads and validates the mandatory first frame: `0x0014 session_id`.
async fn read_init_packet(
    read: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
) -> anyhow::Result<u32> {
    let mut buf = BytesMut::with_capacity(64);
    let mut total = 0usize;
    loop {
        if let Some(frame) = decoder.try_next_frame()? {
            let mut reader = PacketReader::new(&frame);
            let opcode = reader.read_u16()?;
            anyhow::ensure!(opcode == INIT_OPCODE, "first packet is not the init packet");
            anyhow::ensure!(reader.remaining() == 4, "malformed init packet");
            return Ok(reader.read_u32()?);
        }

        let n = read.read_buf(&mut buf).await?;
        anyhow::ensure!(n != 0, "peer closed before the init packet");
        total += n;
        // A whole init frame is 10 raw bytes; anything bigger is noise.
        anyhow::ensure!(total <= 12, "oversized init packet");
        decoder.queue_bytes(&buf.split());
    }
}

/// Hands a hydrated session to the worker owning its map.
fn admit(
    shared: Arc<ChannelShared>,
    session: Arc<Session>,
    read: OwnedReadHalf,
    decoder: FrameDecoder,
    chr: Character,
) {
    let target_map = chr.map;
    let user = User::new(
        session.clone(),
        shared.data.clone(),
        shared.managers.clone(),
        chr,
    );
    let (actor_tx, actor_rx) = flume::unbounded();
    let packet = TransferPacket {
        shared: shared.clone(),
        session,
        read,
        decoder,
        user,
        actor_tx,
        actor_rx,
        target_map,
        target_portal: 0,
        initial: true,
    };
    deliver_from_outside(&shared, packet);
}

// ---- room admission and hand-off ---------------------------------------

/// Everything a session needs to resume on another worker.
struct TransferPacket {
    shared: Arc<ChannelShared>,
    session: Arc<Session>,
    read: OwnedReadHalf,
    decoder: FrameDecoder,
    user: User,
    actor_tx: flume::Sender<ActorCommand>,
    actor_rx: flume::Receiver<ActorCommand>,
    target_map: u32,
    target_portal: u8,
    initial: bool,
}

/// Acquires a coordinator reference on the packet's target and posts it
/// to the owning worker. The reference travels with the packet.
fn deliver_from_outside(shared: &Arc<ChannelShared>, packet: TransferPacket) {
    let worker = shared.coordinator.acquire(packet.target_map);
    let handle = shared.workers[worker].clone();
    if !handle.post(move |ctx| deliver(ctx, packet)) {
        error!("worker {worker} is gone; dropping session");
    }
}

/// Runs on the worker that owns `target_map` (the posted packet holds a
/// coordinator reference on it): joins the room and starts the packet
/// loop. Transit-map redirects loop back through the coordinator.
fn deliver(ctx: &Rc<WorkerLocal>, mut packet: TransferPacket) {
    loop {
        let room = match ctx.room(packet.target_map) {
            Some(room) => room,
            None => {
                let created = Room::create(
                    packet.shared.data.clone(),
                    packet.shared.events.clone(),
                    packet.shared.managers.reactor.clone(),
                    packet.target_map,
                );
                match created {
                    Some(room) => {
                        attach_room_listener(ctx, &room);
                        ctx.insert_room(room.clone());
                        room
                    }
                    None => {
                        warn!(map = packet.target_map, "session points at an unknown map");
                        packet.shared.coordinator.release(packet.target_map);
                        packet.session.shutdown();
                        finalize_in_background(packet.shared, packet.session, packet.user);
                        return;
                    }
                }
            }
        };

        if packet.initial {
            packet.user.chr.map = packet.target_map;
            packet.user.new_map();
            packet.initial = false;
        } else {
            packet.user.change_map(packet.target_map, packet.target_portal);
        }

        let user = Rc::new(RefCell::new(packet.user));
        match room.join(user.clone(), packet.actor_tx.clone()) {
            RoomJoin::Joined(member) => {
                let actor = Actor {
                    shared: packet.shared,
                    session: packet.session,
                    read: packet.read,
                    decoder: packet.decoder,
                    user,
                    actor_tx: packet.actor_tx,
                    actor_rx: packet.actor_rx,
                    room,
                    member,
                };
                let ctx = ctx.clone();
                tokio::task::spawn_local(run_actor(ctx, actor));
                return;
            }
            RoomJoin::Redirect { map } => {
                packet.shared.coordinator.release(packet.target_map);
                ctx.retire_room(packet.target_map);
                let Some(extracted) = take_back_user(user, &packet.session) else {
                    return;
                };
                packet.user = extracted;
                packet.target_map = map;
                packet.target_portal = 0;
                // Re-route: the new target may live on another worker.
                let worker = packet.shared.coordinator.acquire(map);
                if worker != ctx.index {
                    let handle = packet.shared.workers[worker].clone();
                    if !handle.post(move |ctx| deliver(ctx, packet)) {
                        error!("worker {worker} is gone; dropping session");
                    }
                    return;
                }
            }
        }
    }
}

/// Subscribes a new room to its global event, delivering wakes through
/// the owning worker's command queue.
fn attach_room_listener(ctx: &Rc<WorkerLocal>, room: &Rc<Room>) {
    let handle = ctx.handle.clone();
    let room_id = room.id();
    room.attach_event_listener(Box::new(move || {
        let _ = handle.post(move |ctx| {
            if let Some(room) = ctx.room(room_id) {
                room.on_event();
            }
        });
    }));
}

/// Reclaims sole ownership of the user after every room reference is
/// gone. Failure means a reference leaked; the session cannot continue.
fn take_back_user(user: Rc<RefCell<User>>, session: &Arc<Session>) -> Option<User> {
    match Rc::try_unwrap(user) {
        Ok(cell) => Some(cell.into_inner()),
        Err(_) => {
            error!("user state still referenced during hand-off");
            session.shutdown();
            None
        }
    }
}

fn finalize_in_background(shared: Arc<ChannelShared>, session: Arc<Session>, user: User) {
    tokio::task::spawn_local(async move {
        finalize_disconnect(&shared, &session, user).await;
    });
}

/// Flushes the character and releases the login reservation.
async fn finalize_disconnect(shared: &Arc<ChannelShared>, session: &Arc<Session>, mut user: User) {
    if let Err(e) = persist::flush_character(&shared.db, &shared.data, &mut user.chr).await {
        warn!(id = session.id(), "flush failed: {e}");
    }
    session.shutdown();
    shared.login.notify(session.id());
}

// ---- the per-session packet loop ---------------------------------------

struct Actor {
    shared: Arc<ChannelShared>,
    session: Arc<Session>,
    read: OwnedReadHalf,
    decoder: FrameDecoder,
    user: Rc<RefCell<User>>,
    actor_tx: flume::Sender<ActorCommand>,
    actor_rx: flume::Receiver<ActorCommand>,
    room: Rc<Room>,
    member: Rc<RoomMember>,
}

async fn run_actor(ctx: Rc<WorkerLocal>, mut actor: Actor) {
    let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);

    loop {
        if !actor.session.is_open() {
            break;
        }

        tokio::select! {
            command = actor.actor_rx.recv_async() => {
                match command {
                    Ok(ActorCommand::Warp { map, portal }) => {
                        transfer(&ctx, actor, map, portal).await;
                        return;
                    }
                    Err(_) => break,
                }
            }
            read = actor.read.read_buf(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("read error: {e}");
                        break;
                    }
                }
                actor.decoder.queue_bytes(&buf.split());

                loop {
                    let frame = match actor.decoder.try_next_frame() {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => {
                            debug!("stream error: {e:#}");
                            actor.session.shutdown();
                            break;
                        }
                    };

                    if dispatch(&actor, &frame).is_err() {
                        actor.session.shutdown();
                        break;
                    }

                    let warp = actor.user.borrow_mut().take_pending_warp();
                    if let Some((map, portal)) = warp {
                        transfer(&ctx, actor, map, portal).await;
                        return;
                    }
                    if !actor.session.is_open() {
                        break;
                    }
                }
            }
        }
    }

    disconnect(&ctx, actor).await;
}

/// Ends the session: leave the room, flush, release everything.
async fn disconnect(ctx: &Rc<WorkerLocal>, actor: Actor) {
    actor.room.leave(&actor.member);
    let map = actor.room.id();
    actor.shared.coordinator.release(map);
    drop(actor.room);
    drop(actor.member);
    ctx.retire_room(map);

    if let Some(user) = take_back_user(actor.user, &actor.session) {
        finalize_disconnect(&actor.shared, &actor.session, user).await;
    } else {
        actor.shared.login.notify(actor.session.id());
    }
}

/// A portal hand-off: stop reading here, flush the pipe, resume on the
/// worker that owns the destination.
async fn transfer(ctx: &Rc<WorkerLocal>, actor: Actor, map: u32, portal: u8) {
    actor.room.leave(&actor.member);
    let old_map = actor.room.id();
    actor.shared.coordinator.release(old_map);
    drop(actor.room);
    drop(actor.member);
    ctx.retire_room(old_map);

    // Everything queued before the hand-off reaches the wire first.
    actor.session.flush().await;

    let Some(user) = take_back_user(actor.user, &actor.session) else {
        return;
    };

    let packet = TransferPacket {
        shared: actor.shared.clone(),
        session: actor.session,
        read: actor.read,
        decoder: actor.decoder,
        user,
        actor_tx: actor.actor_tx,
        actor_rx: actor.actor_rx,
        target_map: map,
        target_portal: portal,
        initial: false,
    };
    deliver_from_outside(&actor.shared, packet);
}

// ---- dispatch ----------------------------------------------------------

/// One decoded packet. Any error ends the session.
fn dispatch(actor: &Actor, frame: &[u8]) -> Result<(), SessionEnd> {
    let mut r = PacketReader::new(frame);
    let opcode = r.read_u16()?;
    let Some(opcode) = RecvOpcode::from_u16(opcode) else {
        debug!(opcode, "unhandled opcode");
        return Ok(());
    };

    let room = &actor.room;
    let member = &actor.member;
    let user = &actor.user;

    match opcode {
        RecvOpcode::InitSession => return Err(SessionEnd),

        RecvOpcode::Portal => {
            r.skip(1)?;
            let target = r.read_u32()?;
            let name = r.read_sized_string(32)?.to_owned();
            let (map, portal) = user.borrow_mut().portal(target, &name)?;
            user.borrow_mut().warp(map, portal);
        }

        RecvOpcode::Move => {
            r.skip(9)?;
            let movement_start = frame.len() - r.remaining();
            let pose = parse_movement(&mut r)?;
            if let Some((x, y, fh, stance)) = pose {
                member.update_coords(x, y, fh);
                member.update_stance(stance);
            }
            room.move_member(member, &frame[movement_start..]);
        }

        RecvOpcode::Sit => {
            let seat = r.read_u16()?;
            if !room.sit(member, seat) {
                return Err(SessionEnd);
            }
        }

        RecvOpcode::Chair => {
            let chair = r.read_u32()?;
            if user.borrow_mut().chair(chair)? {
                room.chair(member, chair);
            }
            user.borrow_mut().enable_actions();
        }

        RecvOpcode::Attack => {
            let (skill, display, direction, stance, speed, hit_count, oids, damage) =
                read_attack(&mut r, 4)?;
            let mut level = 0;
            if skill != 0 {
                level = user.borrow_mut().use_skill(skill, None)?;
                if level == 0 {
                    // Could not pay the skill's cost; the swing fizzles.
                    return Ok(());
                }
            }
            let killed = room.attack(
                member,
                AttackKind::CloseRange,
                skill,
                level,
                display,
                direction,
                stance,
                speed,
                hit_count,
                oids,
                damage,
            );
            finish_kills(room, member, &killed);
        }

        RecvOpcode::RangedAttack => {
            let (skill, display, direction, stance, speed, hit_count, oids, damage) =
                read_attack(&mut r, 9)?;
            let mut level = 0;
            let mut projectile = 0;
            if skill == 0 {
                projectile = user.borrow_mut().use_projectile(1)?;
            } else {
                level = user.borrow_mut().use_skill(skill, Some(&mut projectile))?;
                if level == 0 {
                    return Ok(());
                }
            }
            let killed = room.attack(
                member,
                AttackKind::Ranged { projectile },
                skill,
                level,
                display,
                direction,
                stance,
                speed,
                hit_count,
                oids,
                damage,
            );
            finish_kills(room, member, &killed);
        }

        RecvOpcode::MagicAttack => {
            let (skill, display, direction, stance, speed, hit_count, oids, damage) =
                read_attack(&mut r, 4)?;
            let level = if skill != 0 {
                let level = user.borrow_mut().use_skill(skill, None)?;
                if level == 0 {
                    return Ok(());
                }
                level
            } else {
                0
            };
            let killed = room.attack(
                member,
                AttackKind::Magic,
                skill,
                level,
                display,
                direction,
                stance,
                speed,
                hit_count,
                oids,
                damage,
            );
            finish_kills(room, member, &killed);
        }

        RecvOpcode::TakeDamage => {
            r.skip(4)?;
            let skill = r.read_i8()?;
            let damage = r.read_i32()?;
            let (mob_id, direction) = if skill == -1 {
                let mob_id = r.read_u32()?;
                let direction = r.read_u8()?;
                (mob_id, direction)
            } else {
                (0, 0)
            };
            if damage < 0 {
                return Err(SessionEnd);
            }
            user.borrow_mut().take_damage(damage);
            room.show_damage(member, skill as u8, damage, mob_id, direction);
        }

        RecvOpcode::Chat => {
            let text = r.read_sized_string(128)?.to_owned();
            let show = r.read_u8()?;
            room.chat(member, &text, show);
        }

        RecvOpcode::Emote => {
            let emote = r.read_u32()?;
            room.emote(member, emote);
        }

        RecvOpcode::NpcTalk => {
            let oid = r.read_u32()?;
            let Some(npc) = room.npc_id(oid) else {
                return Err(SessionEnd);
            };
            user.borrow_mut().talk_npc(npc)?;
        }

        RecvOpcode::Dialogue => {
            let prev = r.read_u8()?;
            let action = r.read_u8()?;
            let selection = if r.remaining() >= 4 { r.read_u32()? } else { 0 };
            if member.has_reactor_script() {
                if !room.continue_reactor_script(member, prev, action, selection) {
                    return Err(SessionEnd);
                }
            } else {
                user.borrow_mut().script_cont(prev, action, selection)?;
            }
        }

        RecvOpcode::ShopAction => {
            let op = r.read_u8()?;
            match op {
                0 => {
                    let position = r.read_u16()?;
                    let item_id = r.read_u32()?;
                    let quantity = r.read_i16()?;
                    let price = r.read_i32()?;
                    user.borrow_mut().buy(position, item_id, quantity, price)?;
                }
                1 => {
                    let slot = r.read_u16()?;
                    let item_id = r.read_u32()?;
                    let quantity = r.read_i16()?;
                    let inventory = if crate::character::is_equip(item_id) {
                        1
                    } else {
                        crate::character::tab_for(item_id).map_or(2, |t| t as u8 + 2)
                    };
                    user.borrow_mut().sell(inventory, slot as u8, item_id, quantity)?;
                }
                2 => {
                    let slot = r.read_u16()?;
                    user.borrow_mut().recharge(slot as u8)?;
                }
                3 => {
                    user.borrow_mut().close_shop();
                }
                _ => return Err(SessionEnd),
            }
        }

        RecvOpcode::ItemMove => {
            r.skip(4)?;
            let inventory = r.read_u8()?;
            let src = r.read_i16()?;
            let dst = r.read_i16()?;
            let count = r.read_i16()?;
            if dst == 0 {
                // Dropping onto the ground.
                let payload = if inventory == 1 {
                    user.borrow_mut().drop_item(1, src as u8, 1)?
                } else {
                    user.borrow_mut().drop_item(inventory, src as u8, count)?
                };
                room.player_drop(member, payload);
            } else if inventory == 1 && dst < 0 {
                user.borrow_mut().equip_item(src as u8)?;
            } else if src < 0 {
                user.borrow_mut().unequip_item((-src) as usize % crate::character::EQUIP_SLOT_COUNT)?;
            } else {
                user.borrow_mut().move_item(inventory, src as u8, dst as u8)?;
            }
        }

        RecvOpcode::ItemUse => {
            r.skip(4)?;
            let slot = r.read_u16()?;
            let item_id = r.read_u32()?;
            user.borrow_mut().use_item(slot as u8, item_id)?;
        }

        RecvOpcode::AssignAp => {
            r.skip(4)?;
            let flag = r.read_u32()?;
            user.borrow_mut().assign_stat(flag)?;
        }

        RecvOpcode::AutoAssignAp => {
            r.skip(4)?;
            let pairs = r.read_u32()?.min(4);
            for _ in 0..pairs {
                let flag = r.read_u32()?;
                let amount = r.read_u32()?.min(255);
                for _ in 0..amount {
                    user.borrow_mut().assign_stat(flag)?;
                }
            }
        }

        RecvOpcode::HealOverTime => {
            r.skip(4)?;
            let hp = r.read_i16()?;
            let mp = r.read_i16()?;
            // Regeneration ticks are small; anything else is an edit.
            if !(0..=400).contains(&hp) || !(0..=400).contains(&mp) {
                return Err(SessionEnd);
            }
            let mut user = user.borrow_mut();
            if hp > 0 {
                user.adjust_hp(i32::from(hp));
            }
            if mp > 0 {
                user.adjust_mp(i32::from(mp));
            }
        }

        RecvOpcode::AssignSp => {
            r.skip(4)?;
            let skill = r.read_u32()?;
            user.borrow_mut().assign_sp(skill)?;
        }

        RecvOpcode::MesoDrop => {
            r.skip(4)?;
            let amount = r.read_i32()?;
            let payload = user.borrow_mut().drop_mesos(amount)?;
            room.player_drop(member, payload);
        }

        RecvOpcode::ScriptedPortal => {
            let name = r.read_sized_string(32)?.to_owned();
            user.borrow_mut().portal_script(&name)?;
        }

        RecvOpcode::QuestAction => {
            let action = r.read_u8()?;
            let quest = r.read_u16()?;
            match action {
                1 => {
                    let npc = r.read_u32()?;
                    user.borrow_mut().start_quest(quest, npc, false)?;
                }
                2 => {
                    let npc = r.read_u32()?;
                    user.borrow_mut().end_quest(quest, npc, false)?;
                }
                3 => {
                    user.borrow_mut().forfeit_quest(quest);
                }
                4 => {
                    let npc = r.read_u32()?;
                    user.borrow_mut().start_quest(quest, npc, true)?;
                }
                5 => {
                    let npc = r.read_u32()?;
                    user.borrow_mut().end_quest(quest, npc, true)?;
                }
                _ => return Err(SessionEnd),
            }
        }

        RecvOpcode::KeymapChange => {
            r.skip(4)?;
            let count = r.read_u32()?.min(crate::character::KEY_COUNT as u32);
            let mut changes = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let key = r.read_u32()?;
                let kind = r.read_u8()?;
                let action = r.read_u32()?;
                changes.push((key, kind, action));
            }
            user.borrow_mut().change_keys(&changes)?;
        }

        RecvOpcode::MonsterMove => {
            let oid = r.read_u32()?;
            let move_id = r.read_u16()?;
            let activity = r.read_u8()?;
            let skill_id = r.read_u8()?;
            let skill_level = r.read_u8()?;
            let option = r.read_u16()?;
            r.skip(9)?;
            let movement_start = frame.len() - r.remaining();
            let pose = parse_movement(&mut r)?;
            let Some((x, y, fh, stance)) = pose else {
                return Ok(());
            };
            room.move_monster(
                member,
                oid,
                move_id,
                activity,
                skill_id,
                skill_level,
                option,
                x,
                y,
                fh,
                stance,
                &frame[movement_start..],
            );
        }

        RecvOpcode::NpcMove => {
            // Animation echo straight back to the sender.
            let raw = r.read_array(r.remaining())?;
            member.write(packets::npc_action(raw));
        }

        RecvOpcode::Pickup => {
            r.skip(9)?;
            let oid = r.read_u32()?;
            room.pick_up(member, oid);
        }

        RecvOpcode::ReactorHit => {
            let oid = r.read_u32()?;
            r.skip(4)?;
            let stance = r.read_u8()?;
            if !room.hit_reactor(member, oid, stance) {
                return Err(SessionEnd);
            }
        }

        RecvOpcode::MapTransferComplete => {
            let outcome = user.borrow_mut().script_warp_ack();
            if outcome == ScriptOutcome::Done {
                user.borrow_mut().enable_actions();
            }
        }
    }

    Ok(())
}

/// Terminal condition for a session's packet loop.
#[derive(Debug)]
struct SessionEnd;

impl From<ReadError> for SessionEnd {
    fn from(_: ReadError) -> Self {
        SessionEnd
    }
}

impl From<PacketEdit> for SessionEnd {
    fn from(_: PacketEdit) -> Self {
        SessionEnd
    }
}

/// Walks a movement command list, returning the final absolute pose if
/// the path contained one.
fn parse_movement(r: &mut PacketReader<'_>) -> Result<Option<(i16, i16, u16, u8)>, SessionEnd> {
    let count = r.read_u8()?;
    let mut pose = None;
    for _ in 0..count {
        let command = r.read_u8()?;
        match command {
            0 | 5 | 17 => {
                let x = r.read_i16()?;
                let y = r.read_i16()?;
                r.skip(4)?; // wobble
                let fh = r.read_u16()?;
                let stance = r.read_u8()?;
                r.skip(2)?; // duration
                pose = Some((x, y, fh, stance));
            }
            1 | 2 | 6 | 12 | 13 | 16 | 18 | 19 | 20 | 22 => {
                r.skip(4)?;
                let stance = r.read_u8()?;
                r.skip(2)?;
                if let Some(p) = &mut pose {
                    p.3 = stance;
                }
            }
            3 | 4 | 7 | 8 | 9 | 11 => {
                r.skip(8)?;
                let _stance = r.read_u8()?;
            }
            10 => r.skip(1)?,
            14 => r.skip(9)?,
            15 => {
                r.skip(12)?;
                let _stance = r.read_u8()?;
                r.skip(2)?;
            }
            _ => return Err(SessionEnd),
        }
    }
    Ok(pose)
}

type AttackFields = (u32, u8, u8, u8, u8, usize, Vec<u32>, Vec<i32>);

/// The shared body of the three attack packets. `post_speed_skip` covers
/// the shape differences after the speed byte.
fn read_attack(r: &mut PacketReader<'_>, post_speed_skip: usize) -> Result<AttackFields, SessionEnd> {
    r.skip(1)?;
    let counts = r.read_u8()?;
    let monster_count = usize::from(counts >> 4);
    let hit_count = usize::from(counts & 0xF);
    let skill = r.read_u32()?;
    r.skip(8)?;
    let display = r.read_u8()?;
    let direction = r.read_u8()?;
    let stance = r.read_u8()?;
    r.skip(1)?;
    let speed = r.read_u8()?;
    r.skip(post_speed_skip)?;

    if monster_count > 15 || hit_count > 15 {
        return Err(SessionEnd);
    }

    let mut oids = Vec::with_capacity(monster_count);
    let mut damage = Vec::with_capacity(monster_count * hit_count);
    for _ in 0..monster_count {
        oids.push(r.read_u32()?);
        r.skip(14)?;
        for _ in 0..hit_count {
            damage.push(r.read_i32()?);
        }
        r.skip(4)?;
    }

    Ok((skill, display, direction, stance, speed, hit_count, oids, damage))
}

/// Confirmed kills: quest progress, exp, and the level-up effect.
fn finish_kills(room: &Room, member: &Rc<RoomMember>, killed: &[u32]) {
    if killed.is_empty() {
        return;
    }
    let leveled = member.user().borrow_mut().kill_monsters(killed);
    if leveled {
        room.level_up(member);
    }
}

// ---- login-control channel ---------------------------------------------

/// Serves the login server's control connection: a first byte saying
/// whether this channel is fresh (0) or reconnecting (1), then a 5-byte
/// `[0x00, session_id]` notice per disconnect. On EOF the listener
/// re-binds and notices buffered in the interim replay on reconnect.
async fn run_login_control(listen: String, rx: flume::Receiver<u32>) {
    let mut first = true;
    let mut carry: Option<u32> = None;
    loop {
        let stream = match accept_login(&listen).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("login-control listener failed: {e:#}");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            }
        };

        let mut stream = stream;
        let byte = [u8::from(!first)];
        if stream.write_all(&byte).await.is_err() {
            continue;
        }
        first = false;
        info!("login server connected");

        carry = serve_login(stream, &rx, carry.take()).await;
    }
}

enum LoginStream {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl LoginStream {
    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.write_all(data).await,
            #[cfg(unix)]
            Self::Unix(s) => s.write_all(data).await,
        }
    }

    async fn read(&mut self, data: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(data).await,
            #[cfg(unix)]
            Self::Unix(s) => s.read(data).await,
        }
    }
}

/// Binds the control endpoint and waits for the single login-server
/// connection.
async fn accept_login(listen: &str) -> anyhow::Result<LoginStream> {
    if let Ok(addr) = listen.parse::<std::net::SocketAddr>() {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding login control at {addr}"))?;
        let (stream, _) = listener.accept().await?;
        return Ok(LoginStream::Tcp(stream));
    }

    #[cfg(unix)]
    {
        let _ = std::fs::remove_file(listen);
        let listener = tokio::net::UnixListener::bind(listen)
            .with_context(|| format!("binding login control at {listen}"))?;
        let (stream, _) = listener.accept().await?;
        return Ok(LoginStream::Unix(stream));
    }

    #[cfg(not(unix))]
    anyhow::bail!("unsupported login-control address: {listen}")
}

/// Pumps disconnect notices until the connection drops. Returns a notice
/// that failed to send so it can replay on the next connection.
async fn serve_login(
    mut stream: LoginStream,
    rx: &flume::Receiver<u32>,
    carry: Option<u32>,
) -> Option<u32> {
    if let Some(id) = carry {
        if write_notice(&mut stream, id).await.is_err() {
            return Some(id);
        }
    }

    let mut scratch = [0u8; 64];
    loop {
        tokio::select! {
            id = rx.recv_async() => {
                let Ok(id) = id else { return None };
                if write_notice(&mut stream, id).await.is_err() {
                    return Some(id);
                }
            }
            n = stream.read(&mut scratch) => {
                match n {
                    Ok(0) | Err(_) => {
                        warn!("login server disconnected");
                        return None;
                    }
                    Ok(_) => {}
                }
            }
        }
    }
}

async fn write_notice(stream: &mut LoginStream, id: u32) -> std::io::Result<()> {
    let mut frame = [0u8; 5];
    frame[1..5].copy_from_slice(&id.to_le_bytes());
    stream.write_all(&frame).await
}
