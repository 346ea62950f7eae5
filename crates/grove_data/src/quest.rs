use serde::Deserialize;

/// A single start- or end-requirement of a quest.
#[derive(Clone, Debug, Deserialize)]
pub enum QuestRequirement {
    Npc(u32),
    MinLevel(u8),
    MaxLevel(u8),
    Job(Vec<u16>),
    QuestCompleted(u16),
    Item { id: u32, count: i16 },
    Mob { id: u32, count: i32 },
    Info { id: u16, value: String },
}

/// A reward (or cost) applied when a quest starts or ends.
#[derive(Clone, Debug, Deserialize)]
pub enum QuestAct {
    Exp(i32),
    Meso(i32),
    Fame(i16),
    /// Negative counts take items away.
    Item {
        id: u32,
        count: i16,
        /// Weight for one-of-several random rewards; 0 means always given.
        prop: i32,
    },
    NextQuest(u16),
}

#[derive(Clone, Debug, Deserialize)]
pub struct QuestInfo {
    pub id: u16,
    #[serde(default)]
    pub start_script: bool,
    #[serde(default)]
    pub end_script: bool,
    #[serde(default)]
    pub start_requirements: Vec<QuestRequirement>,
    #[serde(default)]
    pub end_requirements: Vec<QuestRequirement>,
    #[serde(default)]
    pub start_acts: Vec<QuestAct>,
    #[serde(default)]
    pub end_acts: Vec<QuestAct>,
}

impl QuestInfo {
    /// Mob kill requirements, in end-requirement order. Their progress is
    /// tracked per quest as zero-padded 3-digit counters.
    pub fn mob_requirements(&self) -> impl Iterator<Item = (u32, i32)> + '_ {
        self.end_requirements.iter().filter_map(|req| match req {
            QuestRequirement::Mob { id, count } => Some((*id, *count)),
            _ => None,
        })
    }

    /// Quest-exclusive item ids among the end requirements.
    pub fn quest_item_requirements<'a>(
        &'a self,
        is_quest_item: impl Fn(u32) -> bool + 'a,
    ) -> impl Iterator<Item = u32> + 'a {
        self.end_requirements.iter().filter_map(move |req| match req {
            QuestRequirement::Item { id, .. } if is_quest_item(*id) => Some(*id),
            _ => None,
        })
    }

    pub fn next_quest(&self) -> Option<u16> {
        self.end_acts.iter().find_map(|act| match act {
            QuestAct::NextQuest(id) => Some(*id),
            _ => None,
        })
    }
}
