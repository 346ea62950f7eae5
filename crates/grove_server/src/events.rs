//! Global events: transports, area bosses, the respawn clock.
//!
//! Every event is a fixed set of integer properties plus a listener list.
//! Properties are only ever written by the event's scheduler task (all
//! schedulers run on the control runtime), so changes are totally
//! ordered; listeners just poke the worker that owns a subscribed room,
//! which then reads the property from its own thread.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::task::JoinHandle;

/// The property transports publish their phase through:
/// 0 = arrived/docked, 1 = gates closed, 2 = departed.
pub const PROPERTY_SAILING: usize = 0;
/// Bumped when area bosses should re-arm.
pub const PROPERTY_RESET: usize = 0;

const PROPERTY_COUNT: usize = 4;
const EVENT_COUNT: usize = 8;

/// Dock-open window before the gates close.
const ARRIVE_INTERVAL: Duration = Duration::from_secs(10);
/// Gates-closed window before departure.
const CLOSE_GATES_INTERVAL: Duration = Duration::from_secs(5);
/// Transit time until the next arrival.
const SAIL_INTERVAL: Duration = Duration::from_secs(15);
/// Cadence of the area-boss reset.
const AREA_BOSS_RESET_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Cadence of the global respawn clock.
const GLOBAL_RESPAWN_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum EventKind {
    Boat,
    Train,
    Subway,
    Genie,
    Airplane,
    Elevator,
    AreaBoss,
    GlobalRespawn,
}

pub type ListenerId = u64;

struct Listener {
    id: ListenerId,
    property: usize,
    notify: Box<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
struct Event {
    properties: [AtomicI32; PROPERTY_COUNT],
    listeners: Mutex<Vec<Listener>>,
}

pub struct EventManager {
    events: [Event; EVENT_COUNT],
    next_listener: AtomicU64,
    /// Maps whose area boss is due to (re)spawn.
    area_boss_due: Mutex<FxHashSet<u32>>,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    pub fn new() -> Self {
        let manager = Self {
            events: Default::default(),
            next_listener: AtomicU64::new(1),
            area_boss_due: Mutex::new(FxHashSet::default()),
        };
        manager.arm_area_bosses();
        manager
    }

    fn event(&self, kind: EventKind) -> &Event {
        &self.events[kind as usize]
    }

    pub fn property(&self, kind: EventKind, property: usize) -> i32 {
        self.event(kind).properties[property].load(Ordering::Acquire)
    }

    /// Sets a property and fans the change out to every listener on it.
    /// Only scheduler tasks call this.
    pub fn set_property(&self, kind: EventKind, property: usize, value: i32) {
        self.event(kind).properties[property].store(value, Ordering::Release);
        let listeners = self.event(kind).listeners.lock();
        for listener in listeners.iter() {
            if listener.property == property {
                (listener.notify)();
            }
        }
    }

    /// Subscribes to changes of one property. `notify` must be cheap: it
    /// runs on the scheduler task and should only wake up a worker.
    pub fn add_listener(
        &self,
        kind: EventKind,
        property: usize,
        notify: Box<dyn Fn() + Send + Sync>,
    ) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.event(kind).listeners.lock().push(Listener {
            id,
            property,
            notify,
        });
        id
    }

    pub fn remove_listener(&self, kind: EventKind, id: ListenerId) {
        self.event(kind)
            .listeners
            .lock()
            .retain(|listener| listener.id != id);
    }

    /// Claims a due area boss for `map`. The first caller after a reset
    /// wins and should spawn the boss.
    pub fn area_boss_claim(&self, map: u32) -> bool {
        self.area_boss_due.lock().remove(&map)
    }

    fn arm_area_bosses(&self) {
        let mut due = self.area_boss_due.lock();
        for map in crate::map::AREA_BOSS_MAPS {
            due.insert(map);
        }
    }
}

/// Runs one transport's arrive → close-gates → depart loop forever.
async fn run_transport(manager: Arc<EventManager>, kind: EventKind) {
    loop {
        manager.set_property(kind, PROPERTY_SAILING, 0);
        tokio::time::sleep(ARRIVE_INTERVAL).await;
        manager.set_property(kind, PROPERTY_SAILING, 1);
        tokio::time::sleep(CLOSE_GATES_INTERVAL).await;
        manager.set_property(kind, PROPERTY_SAILING, 2);
        tokio::time::sleep(SAIL_INTERVAL).await;
    }
}

async fn run_area_boss(manager: Arc<EventManager>) {
    loop {
        tokio::time::sleep(AREA_BOSS_RESET_INTERVAL).await;
        manager.arm_area_bosses();
        let tick = manager.property(EventKind::AreaBoss, PROPERTY_RESET);
        manager.set_property(EventKind::AreaBoss, PROPERTY_RESET, tick.wrapping_add(1));
    }
}

async fn run_global_respawn(manager: Arc<EventManager>) {
    loop {
        tokio::time::sleep(GLOBAL_RESPAWN_INTERVAL).await;
        let tick = manager.property(EventKind::GlobalRespawn, 0);
        manager.set_property(EventKind::GlobalRespawn, 0, tick.wrapping_add(1));
    }
}

/// Spawns every scheduler on the current (control) runtime.
pub fn start_schedulers(manager: &Arc<EventManager>) -> Vec<JoinHandle<()>> {
    let transports = [
        EventKind::Boat,
        EventKind::Train,
        EventKind::Subway,
        EventKind::Genie,
        EventKind::Airplane,
        EventKind::Elevator,
    ];

    let mut tasks: Vec<JoinHandle<()>> = transports
        .into_iter()
        .map(|kind| tokio::spawn(run_transport(manager.clone(), kind)))
        .collect();
    tasks.push(tokio::spawn(run_area_boss(manager.clone())));
    tasks.push(tokio::spawn(run_global_respawn(manager.clone())));
    tasks
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn listeners_observe_property_changes_in_order() {
        let manager = EventManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let manager = Arc::new(manager);
        let reader = manager.clone();
        manager.add_listener(
            EventKind::Boat,
            PROPERTY_SAILING,
            Box::new(move || {
                seen2.lock().push(reader.property(EventKind::Boat, PROPERTY_SAILING));
            }),
        );

        manager.set_property(EventKind::Boat, PROPERTY_SAILING, 0);
        manager.set_property(EventKind::Boat, PROPERTY_SAILING, 1);
        manager.set_property(EventKind::Boat, PROPERTY_SAILING, 2);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn removed_listeners_stop_firing() {
        let manager = EventManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let id = manager.add_listener(
            EventKind::Train,
            PROPERTY_SAILING,
            Box::new(move || {
                count2.fetch_add(1, Ordering::Relaxed);
            }),
        );

        manager.set_property(EventKind::Train, PROPERTY_SAILING, 1);
        manager.remove_listener(EventKind::Train, id);
        manager.set_property(EventKind::Train, PROPERTY_SAILING, 2);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn area_boss_claims_are_single_shot() {
        let manager = EventManager::new();
        assert!(manager.area_boss_claim(104000400));
        assert!(!manager.area_boss_claim(104000400));
        manager.arm_area_bosses();
        assert!(manager.area_boss_claim(104000400));
    }

    #[tokio::test(start_paused = true)]
    async fn boat_cycle_arrive_close_depart() {
        let manager = Arc::new(EventManager::new());
        let task = tokio::spawn(run_transport(manager.clone(), EventKind::Boat));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.property(EventKind::Boat, PROPERTY_SAILING), 0);

        tokio::time::sleep(ARRIVE_INTERVAL).await;
        assert_eq!(manager.property(EventKind::Boat, PROPERTY_SAILING), 1);

        tokio::time::sleep(CLOSE_GATES_INTERVAL).await;
        assert_eq!(manager.property(EventKind::Boat, PROPERTY_SAILING), 2);

        tokio::time::sleep(SAIL_INTERVAL).await;
        assert_eq!(manager.property(EventKind::Boat, PROPERTY_SAILING), 0);

        task.abort();
    }
}
