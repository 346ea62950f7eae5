//! Seam to the embedded script interpreter.
//!
//! NPC, quest, portal, and reactor behavior is scripted. The interpreter
//! itself is an external collaborator; the core consumes it through
//! [`ScriptEngine`]: allocate an instance, resume it with the client's
//! last answer, and execute the operations it yields. A suspended script
//! is always waiting on exactly one dialogue answer (or a warp
//! acknowledgement), recorded as the user's dialogue state and validated
//! before the script is resumed.
//!
//! [`TableEngine`] is the stand-in used by tests and the default server
//! wiring: scripts are registered as operation lists keyed by name.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Terminal outcome of a script run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptResult {
    /// The client packet-edited its way here; end the session.
    Kick,
    /// The script failed; free it without blaming the client.
    Failure,
    Success,
    /// The script suspended waiting for a client response.
    Next,
}

/// What a suspended script is waiting on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialogueKind {
    Ok,
    YesNo,
    Simple { count: u32 },
    Next,
    PrevNext,
    Prev,
    AcceptDecline,
    GetNumber { min: i32, max: i32 },
    /// Warp acknowledgement rather than a dialogue box.
    Warp,
}

/// One operation yielded to the host. Dialogue and warp operations
/// suspend the instance; the rest execute against the user surface and
/// the script continues.
#[derive(Clone, Debug)]
pub enum ScriptOp {
    Ask { kind: DialogueKind, text: String },
    GiveItems(Vec<(u32, i16)>),
    GiveExp(i32),
    GiveMesos(i32),
    WarpTo { map: u32, portal: u8 },
    StartQuestNow,
    EndQuestNow,
    OpenShop(u32),
    DropFromReactor,
    End(ScriptResult),
}

/// An allocated script instance: an instruction pointer into its ops.
pub struct ScriptInstance {
    ops: Arc<[ScriptOp]>,
    position: usize,
}

impl ScriptInstance {
    /// Yields the next operation. `answer` is the validated value of the
    /// response the script was suspended on (0 on the first run); the
    /// table engine records it but does not branch on it.
    pub fn resume(&mut self, answer: u32) -> ScriptOp {
        let _ = answer;
        match self.ops.get(self.position) {
            Some(op) => {
                self.position += 1;
                op.clone()
            }
            None => ScriptOp::End(ScriptResult::Success),
        }
    }
}

/// Allocates script instances by name. Engines are shared across
/// workers; instances are per-session.
pub trait ScriptEngine: Send + Sync {
    fn alloc(&self, name: &str) -> Option<ScriptInstance>;
}

/// Table-driven engine: a registry of named operation lists.
#[derive(Default)]
pub struct TableEngine {
    scripts: Mutex<FxHashMap<String, Arc<[ScriptOp]>>>,
}

impl TableEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, ops: Vec<ScriptOp>) {
        self.scripts.lock().insert(name.to_owned(), ops.into());
    }
}

impl ScriptEngine for TableEngine {
    fn alloc(&self, name: &str) -> Option<ScriptInstance> {
        self.scripts.lock().get(name).map(|ops| ScriptInstance {
            ops: ops.clone(),
            position: 0,
        })
    }
}

/// The script managers a channel carries, one per script family.
pub struct ScriptManagers {
    pub quest: Arc<TableEngine>,
    pub npc: Arc<TableEngine>,
    pub portal: Arc<TableEngine>,
    pub map: Arc<TableEngine>,
    pub reactor: Arc<TableEngine>,
}

impl ScriptManagers {
    /// Managers with empty tables; every allocation fails until scripts
    /// are registered.
    pub fn table_driven() -> Self {
        Self {
            quest: Arc::new(TableEngine::new()),
            npc: Arc::new(TableEngine::new()),
            portal: Arc::new(TableEngine::new()),
            map: Arc::new(TableEngine::new()),
            reactor: Arc::new(TableEngine::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_scripts_yield_in_order() {
        let engine = TableEngine::new();
        engine.register(
            "2040",
            vec![
                ScriptOp::Ask {
                    kind: DialogueKind::Next,
                    text: "hello".to_owned(),
                },
                ScriptOp::GiveExp(100),
                ScriptOp::End(ScriptResult::Success),
            ],
        );

        let mut script = engine.alloc("2040").unwrap();
        assert!(matches!(script.resume(0), ScriptOp::Ask { .. }));
        assert!(matches!(script.resume(1), ScriptOp::GiveExp(100)));
        assert!(matches!(
            script.resume(0),
            ScriptOp::End(ScriptResult::Success)
        ));
        assert!(engine.alloc("missing").is_none());
    }
}
