//! State-sync collaborator: the publish/subscribe surface the selection
//! controller talks to, plus an in-process implementation.
//!
//! The remote side owns the authoritative state (`active-electrodes`,
//! `three-object`, ...). Reads and commands are asynchronous and may fail or
//! stall; pushes arrive on broadcast channels.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::layout::Layout;
use crate::neighbours::NeighbourResolver;

pub const ELECTRODES_MODEL: &str = "electrodes-model";
pub const DEVICE_MODEL: &str = "device-model";
pub const ELECTRODE_CONTROLS: &str = "electrode-controls";

pub const ACTIVE_ELECTRODES: &str = "active-electrodes";
pub const THREE_OBJECT: &str = "three-object";
pub const SELECTED_ELECTRODE: &str = "selected-electrode";

pub const TOGGLE_ELECTRODE: &str = "toggle-electrode";
pub const GET_NEIGHBOURING_ELECTRODES: &str = "get-neighbouring-electrodes";

const PUSH_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("`{event}` timed out after {} ms", .after.as_millis())]
    Timeout { event: String, after: Duration },
    #[error("remote rejected request: {0}")]
    Remote(String),
    #[error("no value stored for {scope}/{key}")]
    Missing { scope: String, key: String },
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Client side of the publish/subscribe bus.
///
/// Futures must be `Send` so requests can be spawned fire-and-forget.
pub trait StateSync: Send + Sync + 'static {
    /// Reads the current authoritative value of `scope/key`.
    fn get_state(&self, scope: &str, key: &str)
        -> impl Future<Output = Result<Value, SyncError>> + Send;

    /// Publishes a value this client owns.
    fn set_state(
        &self,
        scope: &str,
        key: &str,
        value: Value,
    ) -> impl Future<Output = Result<(), SyncError>> + Send;

    /// Sends a command to the plugin owning `scope` and awaits its response.
    fn trigger_plugin(
        &self,
        scope: &str,
        event: &str,
        payload: Value,
    ) -> impl Future<Output = Result<Value, SyncError>> + Send;

    /// Push channel for changes to `scope/key`.
    fn subscribe(&self, scope: &str, key: &str) -> broadcast::Receiver<Value>;
}

/// Bounds a remote call, mapping elapsed deadlines to [`SyncError::Timeout`].
pub async fn with_timeout<T, F>(event: &str, after: Duration, fut: F) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, SyncError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(res) => res,
        Err(_) => Err(SyncError::Timeout {
            event: event.to_string(),
            after,
        }),
    }
}

/// A command as received by [`LocalBus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub scope: String,
    pub event: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Fail,
    Stall,
}

enum Reply {
    Ok(Value),
    Err(SyncError),
    Stall,
}

impl Reply {
    async fn resolve(self) -> Result<Value, SyncError> {
        match self {
            Reply::Ok(v) => Ok(v),
            Reply::Err(e) => Err(e),
            Reply::Stall => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct BusState {
    values: HashMap<(String, String), Value>,
    channels: HashMap<(String, String), broadcast::Sender<Value>>,
    layout: Arc<Layout>,
    faults: VecDeque<Fault>,
    commands: Vec<Command>,
}

impl BusState {
    fn channel(&mut self, scope: &str, key: &str) -> &broadcast::Sender<Value> {
        self.channels
            .entry((scope.to_string(), key.to_string()))
            .or_insert_with(|| broadcast::channel(PUSH_CAPACITY).0)
    }

    fn store(&mut self, scope: &str, key: &str, value: Value) {
        if scope == DEVICE_MODEL && key == THREE_OBJECT {
            match Layout::from_value(value.clone()) {
                Ok(layout) => self.layout = Arc::new(layout),
                Err(e) => warn!("Ignoring unparseable {} payload: {}", THREE_OBJECT, e),
            }
        }
        self.values
            .insert((scope.to_string(), key.to_string()), value.clone());
        // Nobody listening is fine.
        let _ = self.channel(scope, key).send(value);
    }

    fn active(&self) -> Vec<String> {
        self.values
            .get(&(ELECTRODES_MODEL.to_string(), ACTIVE_ELECTRODES.to_string()))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToggleRequest {
    electrode_id: String,
    state: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NeighbourRequest {
    electrode_id: String,
}

/// In-process bus that also plays the device and electrode models.
///
/// Answers `device-model/get-neighbouring-electrodes` from the current
/// `three-object` layout and `electrodes-model/toggle-electrode` by editing
/// and pushing `active-electrodes`. Faults can be queued to make the next
/// commands fail or never answer.
pub struct LocalBus {
    state: Mutex<BusState>,
    resolver: NeighbourResolver,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(NeighbourResolver::default())
    }
}

impl LocalBus {
    pub fn new(resolver: NeighbourResolver) -> Self {
        let mut state = BusState::default();
        state.store(ELECTRODES_MODEL, ACTIVE_ELECTRODES, json!([]));
        Self {
            state: Mutex::new(state),
            resolver,
        }
    }

    /// Bus preloaded with `layout` as the device's `three-object`.
    pub fn with_layout(resolver: NeighbourResolver, layout: &Layout) -> Self {
        let bus = Self::new(resolver);
        bus.load_layout(layout);
        bus
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publishes `layout` as the device model's `three-object`.
    pub fn load_layout(&self, layout: &Layout) {
        self.lock().store(DEVICE_MODEL, THREE_OBJECT, layout.to_value());
    }

    /// Overwrites and pushes the authoritative active set.
    pub fn set_active(&self, ids: &[&str]) {
        self.lock()
            .store(ELECTRODES_MODEL, ACTIVE_ELECTRODES, json!(ids));
    }

    pub fn active(&self) -> Vec<String> {
        self.lock().active()
    }

    /// Makes the next `n` commands fail with [`SyncError::Remote`].
    pub fn fail_next(&self, n: usize) {
        self.lock().faults.extend(std::iter::repeat(Fault::Fail).take(n));
    }

    /// Makes the next `n` commands never answer.
    pub fn stall_next(&self, n: usize) {
        self.lock().faults.extend(std::iter::repeat(Fault::Stall).take(n));
    }

    /// Every command received so far, faulted ones included.
    pub fn commands(&self) -> Vec<Command> {
        self.lock().commands.clone()
    }

    pub fn value(&self, scope: &str, key: &str) -> Option<Value> {
        self.lock()
            .values
            .get(&(scope.to_string(), key.to_string()))
            .cloned()
    }

    fn dispatch(&self, scope: &str, event: &str, payload: Value) -> Reply {
        let mut st = self.lock();
        st.commands.push(Command {
            scope: scope.to_string(),
            event: event.to_string(),
            payload: payload.clone(),
        });

        match st.faults.pop_front() {
            Some(Fault::Fail) => {
                return Reply::Err(SyncError::Remote(format!("injected failure for {}", event)))
            }
            Some(Fault::Stall) => return Reply::Stall,
            None => {}
        }

        match (scope, event) {
            (ELECTRODES_MODEL, TOGGLE_ELECTRODE) => {
                let req: ToggleRequest = match serde_json::from_value(payload) {
                    Ok(r) => r,
                    Err(e) => return Reply::Err(e.into()),
                };
                let mut active = st.active();
                active.retain(|id| *id != req.electrode_id);
                if req.state {
                    active.push(req.electrode_id);
                }
                debug!("Active electrodes now {:?}", active);
                let value = json!(active);
                st.store(ELECTRODES_MODEL, ACTIVE_ELECTRODES, value.clone());
                Reply::Ok(value)
            }
            (DEVICE_MODEL, GET_NEIGHBOURING_ELECTRODES) => {
                let req: NeighbourRequest = match serde_json::from_value(payload) {
                    Ok(r) => r,
                    Err(e) => return Reply::Err(e.into()),
                };
                let layout = Arc::clone(&st.layout);
                drop(st);
                match self.resolver.find_all_neighbours(
                    &layout,
                    &req.electrode_id,
                    self.resolver.max_distance(),
                ) {
                    Ok(map) => Reply::Ok(json!(map)),
                    Err(e) => Reply::Err(SyncError::Remote(format!(
                        "{}: {}",
                        req.electrode_id, e
                    ))),
                }
            }
            _ => Reply::Err(SyncError::Remote(format!(
                "no handler for {}/{}",
                scope, event
            ))),
        }
    }
}

impl StateSync for LocalBus {
    fn get_state(
        &self,
        scope: &str,
        key: &str,
    ) -> impl Future<Output = Result<Value, SyncError>> + Send {
        let value = self.value(scope, key).ok_or_else(|| SyncError::Missing {
            scope: scope.to_string(),
            key: key.to_string(),
        });
        async move { value }
    }

    fn set_state(
        &self,
        scope: &str,
        key: &str,
        value: Value,
    ) -> impl Future<Output = Result<(), SyncError>> + Send {
        self.lock().store(scope, key, value);
        async { Ok(()) }
    }

    fn trigger_plugin(
        &self,
        scope: &str,
        event: &str,
        payload: Value,
    ) -> impl Future<Output = Result<Value, SyncError>> + Send {
        self.dispatch(scope, event, payload).resolve()
    }

    fn subscribe(&self, scope: &str, key: &str) -> broadcast::Receiver<Value> {
        self.lock().channel(scope, key).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::unit_grid;

    #[tokio::test]
    async fn toggle_command_updates_and_pushes_active_set() {
        let bus = LocalBus::default();
        let mut rx = bus.subscribe(ELECTRODES_MODEL, ACTIVE_ELECTRODES);

        bus.trigger_plugin(
            ELECTRODES_MODEL,
            TOGGLE_ELECTRODE,
            json!({"electrodeId": "e00", "state": true}),
        )
        .await
        .unwrap();

        assert_eq!(rx.recv().await.unwrap(), json!(["e00"]));
        assert_eq!(bus.active(), vec!["e00".to_string()]);

        bus.trigger_plugin(
            ELECTRODES_MODEL,
            TOGGLE_ELECTRODE,
            json!({"electrodeId": "e00", "state": false}),
        )
        .await
        .unwrap();
        assert!(bus.active().is_empty());
    }

    #[tokio::test]
    async fn answers_neighbour_queries_from_layout() {
        let bus = LocalBus::with_layout(NeighbourResolver::default(), &unit_grid(3, 3));
        let reply = bus
            .trigger_plugin(
                DEVICE_MODEL,
                GET_NEIGHBOURING_ELECTRODES,
                json!({"electrodeId": "e11"}),
            )
            .await
            .unwrap();
        assert_eq!(
            reply,
            json!({"left": "e10", "up": "e01", "down": "e21", "right": "e12"})
        );
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let bus = LocalBus::default();
        bus.fail_next(1);
        let first = bus
            .trigger_plugin(
                ELECTRODES_MODEL,
                TOGGLE_ELECTRODE,
                json!({"electrodeId": "a", "state": true}),
            )
            .await;
        assert!(matches!(first, Err(SyncError::Remote(_))));
        assert!(bus.active().is_empty());

        let second = bus
            .trigger_plugin(
                ELECTRODES_MODEL,
                TOGGLE_ELECTRODE,
                json!({"electrodeId": "a", "state": true}),
            )
            .await;
        assert!(second.is_ok());
        assert_eq!(bus.commands().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_commands_hit_the_deadline() {
        let bus = LocalBus::default();
        bus.stall_next(1);
        let res = with_timeout(
            TOGGLE_ELECTRODE,
            Duration::from_millis(500),
            bus.trigger_plugin(ELECTRODES_MODEL, TOGGLE_ELECTRODE, json!({})),
        )
        .await;
        assert!(matches!(res, Err(SyncError::Timeout { .. })));
    }

    #[tokio::test]
    async fn unknown_commands_and_keys_are_errors() {
        let bus = LocalBus::default();
        assert!(bus.trigger_plugin("nowhere", "nothing", Value::Null).await.is_err());
        assert!(matches!(
            bus.get_state(DEVICE_MODEL, "missing").await,
            Err(SyncError::Missing { .. })
        ));
    }
}
