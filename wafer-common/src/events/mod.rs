//! Event types for the simulation event stream
//!
//! Provides the `SimEvent` enum and the broadcast `EventBus` the controller
//! publishes on. The HTTP layer forwards events to SSE clients.

mod run_types;

pub use run_types::{SimulationState, StopReason};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::record::{MachineType, QualityStatus};

/// Simulation events
///
/// Serialized with a `type` tag so SSE clients can dispatch on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SimEvent {
    /// A run entered RUNNING
    SimulationStarted {
        run_id: Uuid,
        simulation_date: String,
        /// Machine keys (`{type}_{id}`) in registration order
        machines: Vec<String>,
        duration_seconds: f64,
        max_wafers: Option<usize>,
        results_file: String,
        timestamp: DateTime<Utc>,
    },

    /// A wafer record was accepted by the result store
    WaferProcessed {
        run_id: Uuid,
        wafer_id: String,
        machine_id: String,
        machine_type: MachineType,
        defect_class: String,
        confidence: f64,
        defect_percentage: f64,
        quality_status: QualityStatus,
        /// Records in the store after this append
        total_results: usize,
        timestamp: DateTime<Utc>,
    },

    /// Controller state changed
    SimulationStateChanged {
        run_id: Uuid,
        old_state: SimulationState,
        new_state: SimulationState,
        timestamp: DateTime<Utc>,
    },

    /// A run reached STOPPED
    SimulationCompleted {
        run_id: Uuid,
        stop_reason: Option<StopReason>,
        total_wafers: usize,
        pass_count: usize,
        fail_count: usize,
        results_file: String,
        elapsed_seconds: f64,
        timestamp: DateTime<Utc>,
    },
}

impl SimEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            SimEvent::SimulationStarted { .. } => "SimulationStarted",
            SimEvent::WaferProcessed { .. } => "WaferProcessed",
            SimEvent::SimulationStateChanged { .. } => "SimulationStateChanged",
            SimEvent::SimulationCompleted { .. } => "SimulationCompleted",
        }
    }

    pub fn run_id(&self) -> Uuid {
        match self {
            SimEvent::SimulationStarted { run_id, .. }
            | SimEvent::WaferProcessed { run_id, .. }
            | SimEvent::SimulationStateChanged { run_id, .. }
            | SimEvent::SimulationCompleted { run_id, .. } => *run_id,
        }
    }
}

/// Broadcast bus for [`SimEvent`]s
///
/// Cloning shares the underlying channel. Slow subscribers lag and lose the
/// oldest events rather than blocking the publisher.
///
/// ```
/// use wafer_common::events::EventBus;
///
/// let bus = EventBus::new(100);
/// let _rx = bus.subscribe();
/// assert_eq!(bus.subscriber_count(), 1);
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SimEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SimEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; `Err` when nobody is subscribed
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: SimEvent) -> Result<usize, broadcast::error::SendError<SimEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the no-subscriber case
    pub fn emit_lossy(&self, event: SimEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
