//! Opcode tables for the subset of the protocol the channel speaks.

/// Client → server opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum RecvOpcode {
    /// First packet on a connection; carries the session id.
    InitSession = 0x0014,
    Portal = 0x0026,
    Move = 0x0029,
    Sit = 0x002B,
    Chair = 0x002C,
    Attack = 0x002D,
    RangedAttack = 0x002E,
    MagicAttack = 0x002F,
    TakeDamage = 0x0030,
    Chat = 0x0031,
    Emote = 0x0033,
    NpcTalk = 0x003A,
    Dialogue = 0x003C,
    ShopAction = 0x003D,
    ItemMove = 0x0047,
    ItemUse = 0x0048,
    AssignAp = 0x0057,
    AutoAssignAp = 0x0058,
    HealOverTime = 0x0059,
    AssignSp = 0x005A,
    MesoDrop = 0x005E,
    ScriptedPortal = 0x0064,
    QuestAction = 0x006B,
    KeymapChange = 0x0087,
    MonsterMove = 0x00BC,
    NpcMove = 0x00C5,
    Pickup = 0x00CA,
    ReactorHit = 0x00CD,
    MapTransferComplete = 0x00CF,
}

impl RecvOpcode {
    pub fn from_u16(raw: u16) -> Option<Self> {
        use RecvOpcode::*;
        Some(match raw {
            0x0014 => InitSession,
            0x0026 => Portal,
            0x0029 => Move,
            0x002B => Sit,
            0x002C => Chair,
            0x002D => Attack,
            0x002E => RangedAttack,
            0x002F => MagicAttack,
            0x0030 => TakeDamage,
            0x0031 => Chat,
            0x0033 => Emote,
            0x003A => NpcTalk,
            0x003C => Dialogue,
            0x003D => ShopAction,
            0x0047 => ItemMove,
            0x0048 => ItemUse,
            0x0057 => AssignAp,
            0x0058 => AutoAssignAp,
            0x0059 => HealOverTime,
            0x005A => AssignSp,
            0x005E => MesoDrop,
            0x0064 => ScriptedPortal,
            0x006B => QuestAction,
            0x0087 => KeymapChange,
            0x00BC => MonsterMove,
            0x00C5 => NpcMove,
            0x00CA => Pickup,
            0x00CD => ReactorHit,
            0x00CF => MapTransferComplete,
            _ => return None,
        })
    }
}

/// Server → client opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum SendOpcode {
    ModifyInventory = 0x001A,
    StatChange = 0x001C,
    UpdateSkill = 0x0021,
    FameResponse = 0x0023,
    ShowStatusInfo = 0x0027,
    MonsterBookAdd = 0x0039,
    QuestResult = 0x002E,
    ServerNotice = 0x0044,
    SetField = 0x007D,
    TransferFieldError = 0x007F,
    PlaySound = 0x009E,
    SetGender = 0x003A,
    Keymap = 0x014F,
    NpcDialogue = 0x0130,
    OpenShop = 0x0131,
    ShopResult = 0x0132,
    OpenStorage = 0x0135,
    ShowInfo = 0x003D,
    SpawnPlayer = 0x00A0,
    RemovePlayer = 0x00A1,
    Chat = 0x00A2,
    Boat = 0x00A3,
    Emote = 0x00C1,
    ShowEffect = 0x00C2,
    SetChair = 0x00C4,
    UpdatePlayer = 0x00C6,
    ShowForeignEffect = 0x00C7,
    DamagePlayer = 0x00CC,
    SitResult = 0x00CE,
    MovePlayer = 0x00B9,
    SpawnMonster = 0x00EC,
    KillMonster = 0x00ED,
    SpawnMonsterController = 0x00EE,
    MoveMonster = 0x00EF,
    MoveMonsterResponse = 0x00F0,
    MonsterHp = 0x00FA,
    SpawnNpc = 0x0101,
    RemoveNpc = 0x0102,
    SpawnNpcController = 0x0103,
    NpcAction = 0x0104,
    DropObject = 0x010C,
    RemoveDrop = 0x010D,
    SpawnReactor = 0x0117,
    DestroyReactor = 0x0118,
    ChangeReactorState = 0x0119,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_round_trip() {
        for op in [
            RecvOpcode::InitSession,
            RecvOpcode::Portal,
            RecvOpcode::Attack,
            RecvOpcode::ReactorHit,
            RecvOpcode::MapTransferComplete,
        ] {
            assert_eq!(RecvOpcode::from_u16(op as u16), Some(op));
        }
        assert_eq!(RecvOpcode::from_u16(0xFFFF), None);
    }
}
