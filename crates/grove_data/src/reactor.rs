use serde::Deserialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum ReactorEventKind {
    Hit,
    ItemTouch,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct ReactorEvent {
    pub kind: ReactorEventKind,
    pub next_state: u8,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ReactorState {
    #[serde(default)]
    pub events: Vec<ReactorEvent>,
}

/// A reactor's static state machine. A state with no events is terminal:
/// reaching it runs the reactor's action script.
#[derive(Clone, Debug, Deserialize)]
pub struct ReactorInfo {
    pub id: u32,
    /// Script name run when the reactor breaks.
    #[serde(default)]
    pub action: Option<String>,
    pub states: Vec<ReactorState>,
}

impl ReactorInfo {
    pub fn state(&self, state: u8) -> Option<&ReactorState> {
        self.states.get(state as usize)
    }

    /// The first `Hit` transition out of `state`, if any.
    pub fn hit_transition(&self, state: u8) -> Option<u8> {
        self.state(state)?
            .events
            .iter()
            .find(|ev| ev.kind == ReactorEventKind::Hit)
            .map(|ev| ev.next_state)
    }
}
