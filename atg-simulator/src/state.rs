use crate::config::BrokerConfig;
use crate::history::HistoryLog;
use crate::registry::Registry;
use crate::scheduler::RunHandle;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Cycle de vie d'une simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub messages: u64,
    pub errors: u64,
}

/// Tout l'état mutable du process, derrière un seul verrou.
pub struct SimState {
    pub registry: Registry,
    pub history: HistoryLog,
    pub totals: Totals,
    pub phase: Phase,
    pub mqtt_connected: bool,
    pub mqtt_reconnects: u32,
    pub broker: BrokerConfig,
    pub run: Option<RunHandle>,
    /// incrémenté à chaque `start()`
    pub run_epoch: u64,
}

impl SimState {
    pub fn new(registry: Registry, history: HistoryLog, broker: BrokerConfig) -> Self {
        Self {
            registry,
            history,
            totals: Totals::default(),
            phase: Phase::Stopped,
            mqtt_connected: false,
            mqtt_reconnects: 0,
            broker,
            run: None,
            run_epoch: 0,
        }
    }

    /// Remise à zéro des compteurs globaux et par jauge (début de run).
    pub fn reset_counters(&mut self) {
        self.totals = Totals::default();
        self.mqtt_reconnects = 0;
        for device in self.registry.devices_mut() {
            device.message_count = 0;
            device.error_count = 0;
        }
    }
}
