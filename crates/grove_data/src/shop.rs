use serde::Deserialize;

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct ShopItem {
    pub item_id: u32,
    pub price: i32,
}

/// A shop's stock, keyed by the NPC that opens it.
#[derive(Clone, Debug, Deserialize)]
pub struct ShopInfo {
    pub id: u32,
    pub items: Vec<ShopItem>,
}

impl ShopInfo {
    pub fn item(&self, position: u16) -> Option<&ShopItem> {
        self.items.get(position as usize)
    }
}
