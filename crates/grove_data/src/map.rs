use serde::Deserialize;

use crate::{Foothold, Point};

/// Whether a life record spawns an NPC or feeds a monster spawner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum LifeKind {
    Npc,
    Mob,
}

/// A static NPC placement or monster spawner on a map.
#[derive(Clone, Debug, Deserialize)]
pub struct LifeInfo {
    pub kind: LifeKind,
    pub id: u32,
    pub pos: Point,
    pub fh: u16,
    #[serde(default)]
    pub cy: i16,
    #[serde(default)]
    pub rx0: i16,
    #[serde(default)]
    pub rx1: i16,
    #[serde(default)]
    pub flipped: bool,
}

/// A portal on a map.
#[derive(Clone, Debug, Deserialize)]
pub struct PortalInfo {
    pub id: u8,
    pub name: String,
    pub pos: Point,
    /// Destination map, if this portal leads anywhere by itself.
    #[serde(default)]
    pub target_map: Option<u32>,
    #[serde(default)]
    pub target_portal: Option<String>,
    /// Portal script name, for scripted portals.
    #[serde(default)]
    pub script: Option<String>,
}

/// A reactor placement on a map.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct MapReactorInfo {
    pub id: u32,
    pub pos: Point,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MapInfo {
    pub id: u32,
    /// Map players are sent back to by cinematic portals, and the map a
    /// character is persisted at on logout.
    #[serde(default)]
    pub forced_return: Option<u32>,
    /// Where a dead player respawns.
    pub nearest_town: u32,
    #[serde(default)]
    pub seat_count: u16,
    #[serde(default)]
    pub portals: Vec<PortalInfo>,
    #[serde(default)]
    pub lives: Vec<LifeInfo>,
    #[serde(default)]
    pub reactors: Vec<MapReactorInfo>,
    #[serde(default)]
    pub footholds: Vec<Foothold>,
}

impl MapInfo {
    pub fn portal_by_name(&self, name: &str) -> Option<&PortalInfo> {
        self.portals.iter().find(|p| p.name == name)
    }

    pub fn portal_by_id(&self, id: u8) -> Option<&PortalInfo> {
        self.portals.iter().find(|p| p.id == id)
    }

    /// The map a character is persisted at: the forced return if the map
    /// has one, otherwise the map itself.
    pub fn persisted_map(&self) -> u32 {
        self.forced_return.unwrap_or(self.id)
    }
}
