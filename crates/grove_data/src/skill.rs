use serde::Deserialize;

#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct SkillLevel {
    #[serde(default)]
    pub hp_con: i16,
    #[serde(default)]
    pub mp_con: i16,
    /// Projectiles consumed per use; 0 for non-ranged skills.
    #[serde(default)]
    pub bullet_count: i16,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SkillInfo {
    pub id: u32,
    pub levels: Vec<SkillLevel>,
}

impl SkillInfo {
    /// Skill levels are 1-based on the wire.
    pub fn level(&self, level: u8) -> Option<&SkillLevel> {
        if level == 0 {
            return None;
        }
        self.levels.get(level as usize - 1)
    }

    pub fn master_level(&self) -> u8 {
        self.levels.len() as u8
    }
}
