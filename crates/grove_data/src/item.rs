use serde::Deserialize;

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct ItemInfo {
    pub id: u32,
    /// Quest-exclusive items are only visible (and droppable) to players
    /// with the owning quest in progress.
    #[serde(default)]
    pub quest: bool,
    /// Largest stack a single inventory slot holds.
    #[serde(default = "default_slot_max")]
    pub slot_max: i16,
    #[serde(default)]
    pub price: i32,
}

fn default_slot_max() -> i16 {
    100
}

/// Template equipment instances are rolled from.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct EquipInfo {
    pub id: u32,
    #[serde(default)]
    pub str: i16,
    #[serde(default)]
    pub dex: i16,
    #[serde(default)]
    pub int: i16,
    #[serde(default)]
    pub luk: i16,
    #[serde(default)]
    pub hp: i16,
    #[serde(default)]
    pub mp: i16,
    #[serde(default)]
    pub atk: i16,
    #[serde(default)]
    pub matk: i16,
    #[serde(default)]
    pub def: i16,
    #[serde(default)]
    pub mdef: i16,
    #[serde(default)]
    pub acc: i16,
    #[serde(default)]
    pub avoid: i16,
    #[serde(default)]
    pub speed: i16,
    #[serde(default)]
    pub jump: i16,
    #[serde(default)]
    pub slots: u8,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct ConsumableInfo {
    pub id: u32,
    #[serde(default)]
    pub hp: i16,
    #[serde(default)]
    pub mp: i16,
    /// Percent restores.
    #[serde(default)]
    pub hp_r: i16,
    #[serde(default)]
    pub mp_r: i16,
    /// Items like monster cards apply on pickup instead of entering the
    /// inventory.
    #[serde(default)]
    pub consume_on_pickup: bool,
}
