//! Electrode selection and activation.
//!
//! The controller owns which electrode is selected and the local (optimistic)
//! on/off flags. Every transition mutates local state first and then talks to
//! the state-sync collaborator; remote failures are logged and swallowed, and
//! the authoritative active set arriving on the push channel overwrites the
//! local flags (last write wins).
//!
//! The state mutex is never held across an `.await`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::interaction::ResolvedPress;
use crate::layout::{Channel, Electrode, Layout};
use crate::neighbours::{Direction, NeighbourMap};
use crate::sync::{
    with_timeout, StateSync, SyncError, ACTIVE_ELECTRODES, DEVICE_MODEL, ELECTRODES_MODEL,
    ELECTRODE_CONTROLS, GET_NEIGHBOURING_ELECTRODES, SELECTED_ELECTRODE, THREE_OBJECT,
    TOGGLE_ELECTRODE,
};

fn default_turn_on_timeout_ms() -> u64 {
    5000
}

fn default_turn_off_timeout_ms() -> u64 {
    500
}

fn default_neighbour_timeout_ms() -> u64 {
    500
}

fn default_state_timeout_ms() -> u64 {
    5000
}

fn default_event_capacity() -> usize {
    256
}

fn default_ppi() -> f64 {
    96.0
}

/// What `move_selection` does when the neighbour query fails or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MovePolicy {
    /// Give up after the first failure.
    #[default]
    Abandon,
    /// Re-send the query up to `retries` more times.
    Retry { retries: u32 },
}

impl MovePolicy {
    pub fn attempts(self) -> u32 {
        match self {
            MovePolicy::Abandon => 1,
            MovePolicy::Retry { retries } => retries.saturating_add(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_turn_on_timeout_ms")]
    pub turn_on_timeout_ms: u64,
    #[serde(default = "default_turn_off_timeout_ms")]
    pub turn_off_timeout_ms: u64,
    #[serde(default = "default_neighbour_timeout_ms")]
    pub neighbour_timeout_ms: u64,
    /// Bound for state reads and for publishing the selected electrode.
    #[serde(default = "default_state_timeout_ms")]
    pub state_timeout_ms: u64,
    #[serde(default)]
    pub move_policy: MovePolicy,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Pixels per inch of the layout coordinates, for reported areas.
    #[serde(default = "default_ppi")]
    pub ppi: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            turn_on_timeout_ms: default_turn_on_timeout_ms(),
            turn_off_timeout_ms: default_turn_off_timeout_ms(),
            neighbour_timeout_ms: default_neighbour_timeout_ms(),
            state_timeout_ms: default_state_timeout_ms(),
            move_policy: MovePolicy::default(),
            event_capacity: default_event_capacity(),
            ppi: default_ppi(),
        }
    }
}

impl ControllerConfig {
    pub fn with_move_policy(mut self, policy: MovePolicy) -> Self {
        self.move_policy = policy;
        self
    }

    pub fn with_turn_on_timeout_ms(mut self, ms: u64) -> Self {
        self.turn_on_timeout_ms = ms;
        self
    }

    fn toggle_timeout(&self, on: bool) -> Duration {
        Duration::from_millis(if on {
            self.turn_on_timeout_ms
        } else {
            self.turn_off_timeout_ms
        })
    }

    fn neighbour_timeout(&self) -> Duration {
        Duration::from_millis(self.neighbour_timeout_ms)
    }

    fn state_timeout(&self) -> Duration {
        Duration::from_millis(self.state_timeout_ms)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControllerError {
    #[error("electrode `{0}` is not part of the current layout")]
    NotFound(String),
    #[error("`{0}` requires a selected electrode")]
    Precondition(&'static str),
    #[error("another move is still in flight")]
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Highlight {
    Default,
    Selected,
}

/// Notifications for the rendering layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerEvent {
    SelectionChanged {
        previous: Option<String>,
        current: Option<String>,
    },
    HighlightChanged {
        id: String,
        highlight: Highlight,
    },
    ElectrodeToggled {
        id: String,
        on: bool,
    },
    ActiveSetChanged {
        active: Vec<String>,
    },
    LayoutReplaced {
        electrodes: usize,
    },
    SecondaryClick {
        id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved { from: String, to: String },
    /// Nothing lies in that direction; state untouched.
    NoNeighbour,
    /// The neighbour query failed under the configured policy.
    Abandoned,
    /// The selection changed while the query was in flight.
    Superseded,
}

/// Body of a `selected-electrode` put: new channel and/or area for `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectrodeEdit {
    pub id: String,
    #[serde(default)]
    pub channel: Option<Channel>,
    #[serde(default)]
    pub area: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    TurnedOn,
    TurnedOff,
    /// Select modifier held: the electrode ends up on and selected.
    Selected,
}

struct Shared {
    layout: Arc<Layout>,
    selected: Option<String>,
    on: HashSet<String>,
}

/// Clears the in-flight flag when a move finishes, however it finishes.
struct MoveGuard<'a>(&'a AtomicBool);

impl<'a> MoveGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| MoveGuard(flag))
    }
}

impl Drop for MoveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ElectrodeSelectionController<S: StateSync> {
    sync: Arc<S>,
    cfg: ControllerConfig,
    shared: Mutex<Shared>,
    moving: AtomicBool,
    events: broadcast::Sender<ControllerEvent>,
}

impl<S: StateSync> ElectrodeSelectionController<S> {
    pub fn new(sync: Arc<S>, layout: Arc<Layout>, cfg: ControllerConfig) -> Self {
        let (events, _) = broadcast::channel(cfg.event_capacity.max(1));
        Self {
            sync,
            cfg,
            shared: Mutex::new(Shared {
                layout,
                selected: None,
                on: HashSet::new(),
            }),
            moving: AtomicBool::new(false),
            events,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.cfg
    }

    pub fn layout(&self) -> Arc<Layout> {
        Arc::clone(&self.lock().layout)
    }

    pub fn selected(&self) -> Option<String> {
        self.lock().selected.clone()
    }

    pub fn is_on(&self, id: &str) -> bool {
        self.lock().on.contains(id)
    }

    /// Locally-on electrodes, sorted.
    pub fn on_electrodes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().on.iter().cloned().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ControllerEvent) {
        // No renderer attached is fine.
        let _ = self.events.send(event);
    }

    fn set_on(&self, st: &mut Shared, id: &str, on: bool) {
        if on {
            st.on.insert(id.to_string());
        } else {
            st.on.remove(id);
        }
        self.emit(ControllerEvent::ElectrodeToggled {
            id: id.to_string(),
            on,
        });
    }

    fn clear_selection(&self, st: &mut Shared) {
        if let Some(prev) = st.selected.take() {
            self.emit(ControllerEvent::HighlightChanged {
                id: prev.clone(),
                highlight: Highlight::Default,
            });
            self.emit(ControllerEvent::SelectionChanged {
                previous: Some(prev),
                current: None,
            });
        }
    }

    /// Makes `id` the selected electrode, optionally turning it on.
    ///
    /// Local state and highlight events are applied before this returns; the
    /// turn-on request and the `selected-electrode` publication run in the
    /// background.
    pub fn select(&self, id: &str, turn_on: bool) -> Result<(), ControllerError> {
        let record = {
            let mut st = self.lock();
            let Some(e) = st.layout.get(id) else {
                return Err(ControllerError::NotFound(id.to_string()));
            };
            let record = self.selection_record(e);

            self.clear_selection(&mut st);
            if turn_on {
                self.set_on(&mut st, id, true);
            }
            st.selected = Some(id.to_string());
            self.emit(ControllerEvent::HighlightChanged {
                id: id.to_string(),
                highlight: Highlight::Selected,
            });
            self.emit(ControllerEvent::SelectionChanged {
                previous: None,
                current: Some(id.to_string()),
            });
            record
        };

        if turn_on {
            self.spawn_toggle(id, true);
        }
        self.spawn_publish(record);
        Ok(())
    }

    fn selection_record(&self, e: &Electrode) -> Value {
        json!({
            "id": e.id(),
            "channel": e.channel(),
            "area": e.area_mm2(self.cfg.ppi),
        })
    }

    /// Applies an edit of an electrode's channel or area and sends the
    /// updated `three-object` to the device model.
    ///
    /// The local layout is updated immediately. A failed upload is logged;
    /// the device model's next push is authoritative.
    pub async fn put_selected_electrode(&self, edit: ElectrodeEdit) -> Result<(), ControllerError> {
        let (layout, record) = {
            let mut st = self.lock();
            let next = st
                .layout
                .edited(&edit.id, |e| {
                    if let Some(channel) = edit.channel.clone() {
                        e.set_channel(Some(channel));
                    }
                    if let Some(area) = edit.area {
                        e.set_area_mm2(Some(area));
                    }
                })
                .ok_or_else(|| ControllerError::NotFound(edit.id.clone()))?;
            let next = Arc::new(next);
            st.layout = Arc::clone(&next);
            let record = match (st.selected.as_deref(), next.get(&edit.id)) {
                (Some(sel), Some(e)) if sel == edit.id => Some(self.selection_record(e)),
                _ => None,
            };
            (next, record)
        };

        if let Some(record) = record {
            self.spawn_publish(record);
        }
        let res = with_timeout(
            THREE_OBJECT,
            self.cfg.state_timeout(),
            self.sync.set_state(DEVICE_MODEL, THREE_OBJECT, layout.to_value()),
        )
        .await;
        if let Err(e) = res {
            warn!("Could not upload edited layout: {}", e);
        }
        Ok(())
    }

    pub fn unselect(&self) -> Result<(), ControllerError> {
        let mut st = self.lock();
        if st.selected.is_none() {
            return Err(ControllerError::Precondition("unselect"));
        }
        self.clear_selection(&mut st);
        Ok(())
    }

    /// Turns `id` on locally and requests it remotely without waiting.
    pub fn turn_on(&self, id: &str) -> Result<JoinHandle<()>, ControllerError> {
        self.switch(id, true)
    }

    /// Turns `id` off locally and requests it remotely without waiting.
    pub fn turn_off(&self, id: &str) -> Result<JoinHandle<()>, ControllerError> {
        self.switch(id, false)
    }

    fn switch(&self, id: &str, on: bool) -> Result<JoinHandle<()>, ControllerError> {
        {
            let mut st = self.lock();
            if !st.layout.contains(id) {
                return Err(ControllerError::NotFound(id.to_string()));
            }
            self.set_on(&mut st, id, on);
        }
        Ok(self.spawn_toggle(id, on))
    }

    fn spawn_toggle(&self, id: &str, on: bool) -> JoinHandle<()> {
        let sync = Arc::clone(&self.sync);
        let id = id.to_string();
        let after = self.cfg.toggle_timeout(on);
        tokio::spawn(async move {
            send_toggle(sync.as_ref(), &id, on, after).await;
        })
    }

    fn spawn_publish(&self, record: Value) {
        let sync = Arc::clone(&self.sync);
        let after = self.cfg.state_timeout();
        tokio::spawn(async move {
            let res = with_timeout(
                SELECTED_ELECTRODE,
                after,
                sync.set_state(ELECTRODE_CONTROLS, SELECTED_ELECTRODE, record),
            )
            .await;
            if let Err(e) = res {
                warn!("Could not publish selected electrode: {}", e);
            }
        });
    }

    /// Moves the selection one electrode towards `direction`.
    ///
    /// The current electrode is turned off (awaited) before the neighbour is
    /// selected and turned on. Only one move runs at a time.
    pub async fn move_selection(&self, direction: Direction) -> Result<MoveOutcome, ControllerError> {
        let current = self
            .selected()
            .ok_or(ControllerError::Precondition("move"))?;
        let _guard = MoveGuard::acquire(&self.moving).ok_or(ControllerError::Busy)?;

        let Some(neighbours) = self.query_neighbours(&current).await else {
            return Ok(MoveOutcome::Abandoned);
        };
        let Some(target) = neighbours.get(&direction).cloned() else {
            debug!("{} has no neighbour {}", current, direction);
            return Ok(MoveOutcome::NoNeighbour);
        };

        {
            let mut st = self.lock();
            if st.selected.as_deref() != Some(current.as_str()) {
                return Ok(MoveOutcome::Superseded);
            }
            if !st.layout.contains(&target) {
                return Err(ControllerError::NotFound(target));
            }
            self.set_on(&mut st, &current, false);
        }
        send_toggle(
            self.sync.as_ref(),
            &current,
            false,
            self.cfg.toggle_timeout(false),
        )
        .await;

        if self.selected().as_deref() != Some(current.as_str()) {
            debug!("Selection changed while turning {} off", current);
            return Ok(MoveOutcome::Superseded);
        }
        self.select(&target, true)?;
        info!("Moved selection {} -> {} ({})", current, target, direction);
        Ok(MoveOutcome::Moved {
            from: current,
            to: target,
        })
    }

    async fn query_neighbours(&self, id: &str) -> Option<NeighbourMap> {
        let attempts = self.cfg.move_policy.attempts();
        for attempt in 1..=attempts {
            let reply = with_timeout(
                GET_NEIGHBOURING_ELECTRODES,
                self.cfg.neighbour_timeout(),
                self.sync.trigger_plugin(
                    DEVICE_MODEL,
                    GET_NEIGHBOURING_ELECTRODES,
                    json!({ "electrodeId": id }),
                ),
            )
            .await;

            match reply.and_then(parse_neighbour_map) {
                Ok(map) => return Some(map),
                Err(e) => warn!(
                    "Neighbour query for {} failed (attempt {}/{}): {}",
                    id, attempt, attempts, e
                ),
            }
        }
        None
    }

    /// Toggles `id` from the remote active set's point of view.
    ///
    /// With `select` held the current selection is dropped first, and after
    /// the toggle `id` is selected, which turns it back on.
    pub async fn toggle(&self, id: &str, select: bool) -> Result<ToggleOutcome, ControllerError> {
        if !self.layout().contains(id) {
            return Err(ControllerError::NotFound(id.to_string()));
        }

        let was_on = self.read_active_set().await.iter().any(|a| a == id);
        {
            let mut st = self.lock();
            if !st.layout.contains(id) {
                return Err(ControllerError::NotFound(id.to_string()));
            }
            if select {
                self.clear_selection(&mut st);
            }
            self.set_on(&mut st, id, !was_on);
            if was_on && st.selected.as_deref() == Some(id) {
                self.clear_selection(&mut st);
            }
        }

        if select {
            // The turn-off must land before the re-selection turns it on.
            if was_on {
                send_toggle(self.sync.as_ref(), id, false, self.cfg.toggle_timeout(false)).await;
            } else {
                self.spawn_toggle(id, true);
            }
            self.select(id, true)?;
            return Ok(ToggleOutcome::Selected);
        }
        self.spawn_toggle(id, !was_on);

        Ok(if was_on {
            ToggleOutcome::TurnedOff
        } else {
            ToggleOutcome::TurnedOn
        })
    }

    /// Applies a click resolved by [`crate::interaction::PressTracker`].
    pub async fn click(&self, press: ResolvedPress) -> Result<ToggleOutcome, ControllerError> {
        self.toggle(&press.target, press.select).await
    }

    pub fn secondary_click(&self, id: &str) {
        self.emit(ControllerEvent::SecondaryClick { id: id.to_string() });
    }

    async fn read_active_set(&self) -> Vec<String> {
        let read = with_timeout(
            ACTIVE_ELECTRODES,
            self.cfg.state_timeout(),
            self.sync.get_state(ELECTRODES_MODEL, ACTIVE_ELECTRODES),
        )
        .await
        .and_then(|v| serde_json::from_value::<Vec<String>>(v).map_err(SyncError::from));

        match read {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Could not read active electrodes, assuming none: {}", e);
                Vec::new()
            }
        }
    }

    /// Replaces the local on flags with the authoritative active set.
    pub fn apply_active_set(&self, ids: Vec<String>) {
        let mut st = self.lock();
        st.on = ids.iter().cloned().collect();
        let mut active = ids;
        active.sort();
        active.dedup();
        self.emit(ControllerEvent::ActiveSetChanged { active });
    }

    /// Swaps in a new device layout.
    ///
    /// The selection survives only if its electrode is still present; on
    /// flags for electrodes that are gone are dropped.
    pub fn replace_layout(&self, layout: Arc<Layout>) {
        let mut st = self.lock();
        if st.selected.as_deref().is_some_and(|id| !layout.contains(id)) {
            self.clear_selection(&mut st);
        }
        let before = st.on.len();
        st.on.retain(|id| layout.contains(id));
        if st.on.len() != before {
            let mut active: Vec<String> = st.on.iter().cloned().collect();
            active.sort();
            self.emit(ControllerEvent::ActiveSetChanged { active });
        }
        let electrodes = layout.len();
        st.layout = layout;
        info!("Layout replaced ({} electrodes)", electrodes);
        self.emit(ControllerEvent::LayoutReplaced { electrodes });
    }

    /// Follows the collaborator's pushes for the active set and the device
    /// geometry until the channels close or the task is aborted.
    pub fn listen(self: &Arc<Self>) -> JoinHandle<()> {
        let mut active_rx = self.sync.subscribe(ELECTRODES_MODEL, ACTIVE_ELECTRODES);
        let mut layout_rx = self.sync.subscribe(DEVICE_MODEL, THREE_OBJECT);
        let this = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = active_rx.recv() => match msg {
                        Ok(v) => match serde_json::from_value::<Vec<String>>(v) {
                            Ok(ids) => this.apply_active_set(ids),
                            Err(e) => warn!("Ignoring malformed {} push: {}", ACTIVE_ELECTRODES, e),
                        },
                        Err(RecvError::Lagged(n)) => warn!("Skipped {} {} pushes", n, ACTIVE_ELECTRODES),
                        Err(RecvError::Closed) => break,
                    },
                    msg = layout_rx.recv() => match msg {
                        Ok(v) => match Layout::from_value(v) {
                            Ok(layout) => this.replace_layout(Arc::new(layout)),
                            Err(e) => warn!("Ignoring malformed {} push: {}", THREE_OBJECT, e),
                        },
                        Err(RecvError::Lagged(n)) => warn!("Skipped {} {} pushes", n, THREE_OBJECT),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Push listener stopped");
        })
    }
}

async fn send_toggle<S: StateSync>(sync: &S, id: &str, on: bool, after: Duration) {
    let res = with_timeout(
        TOGGLE_ELECTRODE,
        after,
        sync.trigger_plugin(
            ELECTRODES_MODEL,
            TOGGLE_ELECTRODE,
            json!({ "electrodeId": id, "state": on }),
        ),
    )
    .await;
    match res {
        Ok(_) => debug!("{} -> {}", id, if on { "on" } else { "off" }),
        Err(e) => warn!("Toggle request for {} failed: {}", id, e),
    }
}

/// Unknown direction keys and null entries are dropped.
fn parse_neighbour_map(v: Value) -> Result<NeighbourMap, SyncError> {
    let raw: BTreeMap<String, Option<String>> = serde_json::from_value(v)?;
    Ok(raw
        .into_iter()
        .filter_map(|(dir, id)| Some((dir.parse::<Direction>().ok()?, id?)))
        .collect())
}
