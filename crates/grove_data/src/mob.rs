use serde::Deserialize;

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct MonsterStats {
    pub id: u32,
    pub hp: i32,
    pub exp: i32,
}

/// One row of a drop table. `item_id` 0 is a meso drop; ids in the
/// 1_000_000 range are equips; everything else is a stackable item.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct DropEntry {
    pub item_id: u32,
    #[serde(default)]
    pub quest_id: Option<u16>,
    pub min: i32,
    pub max: i32,
    /// Chance per million, before the server rate multiplier.
    pub chance: i32,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DropTable {
    pub entries: Vec<DropEntry>,
}
