/**
 * SIMULATEUR - Contexte partagé entre l'API HTTP et la boucle de tick
 *
 * RÔLE :
 * Possède l'état (registre, historique, compteurs, config broker, phase) et
 * pilote la machine d'états Stopped → Starting → Running → Stopping.
 *
 * CONCURRENCE :
 * Un seul verrou (`Shared<SimState>`). Il n'est jamais tenu pendant un appel
 * réseau : connect/disconnect et attente de la boucle se font hors verrou.
 */

use crate::config::{BrokerConfig, BrokerConfigPatch, Settings};
use crate::errors::SimError;
use crate::history::HistoryLog;
use crate::models::{Device, DevicePatch, HistoryEntry};
use crate::mqtt::{probe_tcp, Connector, LinkEvent, LinkObserver};
use crate::registry::Registry;
use crate::scheduler::{spawn_tick_loop, Scheduler};
use crate::state::{new_state, Phase, SimState, Shared};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub simulation_running: bool,
    pub state: Phase,
    pub mqtt_connected: bool,
    pub mqtt_reconnects: u32,
    pub total_message_count: u64,
    pub total_error_count: u64,
    pub atg_count: usize,
    pub atg_list: Vec<Device>,
    pub history_count: usize,
    pub mqtt_config: BrokerConfig,
}

#[derive(Clone)]
pub struct Simulator {
    state: Shared<SimState>,
    connector: Arc<dyn Connector>,
    default_broker: BrokerConfig,
    cadence: Duration,
    history_page: usize,
}

impl Simulator {
    pub fn new(settings: &Settings, connector: Arc<dyn Connector>) -> Self {
        let sim = &settings.simulation;
        let state = SimState::new(
            Registry::new(&sim.topic_prefix),
            HistoryLog::new(sim.history_capacity),
            settings.broker.clone(),
        );
        Self {
            state: new_state(state),
            connector,
            default_broker: settings.broker.clone(),
            cadence: Duration::from_millis(sim.tick_ms.max(1)),
            history_page: sim.history_page,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Démarre un run ; retourne le nombre de jauges simulées.
    pub async fn start(&self) -> Result<usize, SimError> {
        let (config, epoch) = {
            let mut st = self.state.lock();
            match st.phase {
                Phase::Stopped => {}
                Phase::Stopping => return Err(SimError::StopInProgress),
                Phase::Starting | Phase::Running => return Err(SimError::AlreadyRunning),
            }
            if st.registry.is_empty() {
                return Err(SimError::NoDevices);
            }
            st.broker.validate()?;
            st.phase = Phase::Starting;
            st.run_epoch += 1;
            info!(
                "starting simulation: broker {}:{}, {} ATG(s)",
                st.broker.broker_ip,
                st.broker.broker_port,
                st.registry.len()
            );
            for d in st.registry.list() {
                info!("  - {}: topic={}, interval={}s", d.name, d.topic, d.publish_interval);
            }
            (st.broker.clone(), st.run_epoch)
        };

        let link = match self.connector.connect(&config, self.link_observer()).await {
            Ok(link) => link,
            Err(e) => {
                warn!("failed to connect to MQTT broker: {e}");
                let mut st = self.state.lock();
                if st.run_epoch == epoch {
                    st.phase = Phase::Stopped;
                    st.mqtt_connected = false;
                }
                return Err(SimError::BrokerUnavailable(e.to_string()));
            }
        };

        let count = {
            let mut st = self.state.lock();
            if st.phase != Phase::Starting || st.run_epoch != epoch {
                None
            } else {
                st.reset_counters();
                st.mqtt_connected = true;
                let scheduler = Scheduler::new(self.state.clone(), config.qos_level());
                st.run = Some(spawn_tick_loop(scheduler, link.clone(), self.cadence));
                st.phase = Phase::Running;
                Some(st.registry.len())
            }
        };

        match count {
            Some(count) => {
                info!("simulation started for {count} ATG(s)");
                Ok(count)
            }
            None => {
                // stop() est passé pendant le connect ; un run plus récent garde son état
                link.disconnect().await;
                let mut st = self.state.lock();
                if st.run_epoch == epoch {
                    st.mqtt_connected = false;
                }
                Err(SimError::NotRunning)
            }
        }
    }

    /// Arrête le run en cours ; idempotent. Retourne le total de messages du run.
    pub async fn stop(&self) -> u64 {
        let run = {
            let mut st = self.state.lock();
            match begin_stop(&mut st) {
                Ok(run) => run,
                Err(_) => return st.totals.messages,
            }
        };

        if let Some(run) = run {
            let link = run.halt().await;
            link.disconnect().await;
        }

        let mut st = self.state.lock();
        st.phase = Phase::Stopped;
        st.mqtt_connected = false;
        info!("simulation stopped, total messages sent: {}", st.totals.messages);
        st.totals.messages
    }

    /// Stoppe puis vide registre, historique et compteurs ; restaure la config broker par défaut.
    pub async fn reset(&self) {
        self.stop().await;
        let mut st = self.state.lock();
        st.registry.clear();
        st.history.clear();
        st.reset_counters();
        st.broker = self.default_broker.clone();
        info!("simulator reset to defaults");
    }

    pub fn add_device(&self, patch: DevicePatch) -> Result<Device, SimError> {
        let device = self.state.lock().registry.add(patch)?;
        info!(
            "added ATG {} (id={}, topic={}, product={}, auto_variation={}, trend={})",
            device.name,
            device.id,
            device.topic,
            device.product_type,
            device.profile.auto_variation,
            device.profile.simulate_trend
        );
        Ok(device)
    }

    pub fn remove_device(&self, id: &str) -> Result<Device, SimError> {
        let removed = self.state.lock().registry.remove(id);
        match removed {
            Some(device) => {
                info!("removed ATG {} (id={})", device.name, device.id);
                Ok(device)
            }
            None => Err(SimError::NotFound("ATG".into())),
        }
    }

    pub fn update_device(&self, id: &str, patch: DevicePatch) -> Result<Device, SimError> {
        self.state.lock().registry.update(id, patch)
    }

    pub fn device(&self, id: &str) -> Option<Device> {
        self.state.lock().registry.get(id).cloned()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.state.lock().registry.list()
    }

    /// Page d'historique exposée par l'API (les plus récentes en dernier).
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.state.lock().history.recent(self.history_page)
    }

    pub fn status(&self) -> StatusView {
        let st = self.state.lock();
        StatusView {
            simulation_running: st.phase == Phase::Running,
            state: st.phase,
            mqtt_connected: st.mqtt_connected,
            mqtt_reconnects: st.mqtt_reconnects,
            total_message_count: st.totals.messages,
            total_error_count: st.totals.errors,
            atg_count: st.registry.len(),
            atg_list: st.registry.list(),
            history_count: st.history.len(),
            mqtt_config: st.broker.clone(),
        }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        self.state.lock().broker.clone()
    }

    /// Pris en compte au prochain `start()`.
    pub fn update_broker_config(&self, patch: BrokerConfigPatch) -> Result<BrokerConfig, SimError> {
        let mut st = self.state.lock();
        st.broker.merge(patch)?;
        Ok(st.broker.clone())
    }

    pub async fn probe_broker(&self) -> bool {
        let cfg = self.broker_config();
        probe_tcp(&cfg.broker_ip, cfg.broker_port).await
    }

    fn link_observer(&self) -> LinkObserver {
        let state = self.state.clone();
        Arc::new(move |event| {
            let mut st = state.lock();
            match event {
                LinkEvent::Connected { resumed } => {
                    st.mqtt_connected = true;
                    if resumed {
                        st.mqtt_reconnects += 1;
                        info!("MQTT session restored");
                    }
                }
                LinkEvent::Disconnected { reason } => {
                    st.mqtt_connected = false;
                    if st.phase == Phase::Running {
                        warn!("MQTT disconnected unexpectedly ({reason}), will attempt to reconnect");
                    }
                }
            }
        })
    }
}

/// Transition vers `Stopping`. Depuis `Starting` il n'y a pas encore de run :
/// le `start()` en attente verra la phase changer et fermera son lien.
fn begin_stop(st: &mut SimState) -> Result<Option<crate::scheduler::RunHandle>, SimError> {
    match st.phase {
        Phase::Stopped | Phase::Stopping => Err(SimError::NotRunning),
        Phase::Starting => {
            st.phase = Phase::Stopping;
            Ok(None)
        }
        Phase::Running => {
            st.phase = Phase::Stopping;
            Ok(st.run.take())
        }
    }
}
