/**
 * SCHEDULER - Boucle de tick de la simulation
 *
 * RÔLE : À chaque tick (100ms par défaut), pour chaque jauge active dont
 * l'intervalle est écoulé : variation → publication → comptabilité.
 *
 * VERROU :
 * 1. sous verrou : sélection des jauges dues + application de la variation
 * 2. hors verrou : publications vers le broker
 * 3. sous verrou : compteurs, historique, horodatages
 *
 * ÉCHECS : une publication ratée incrémente les compteurs d'erreur et
 * n'avance pas l'échéance, la jauge est retentée au tick suivant.
 */

use crate::models::{local_timestamp, HistoryEntry, PublishedReading, Reading};
use crate::mqtt::BrokerLink;
use crate::state::{SimState, Shared};
use rumqttc::QoS;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Run en cours : lien broker + tâche de tick.
pub struct RunHandle {
    pub link: Arc<dyn BrokerLink>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RunHandle {
    /// Arrête la boucle (observé sous une période de tick) et attend sa fin.
    pub async fn halt(self) -> Arc<dyn BrokerLink> {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            warn!("tick loop ended abnormally: {e}");
        }
        self.link
    }
}

#[derive(Debug, Clone, Copy)]
struct DeviceClock {
    /// dernière publication réussie (ou première observation)
    last_sent: Instant,
    /// dernière application du moteur de variation
    last_evolved: Instant,
}

impl DeviceClock {
    fn new(now: Instant) -> Self {
        Self { last_sent: now, last_evolved: now }
    }
}

struct Emission {
    id: String,
    name: String,
    topic: String,
    product_type: String,
    reading: Reading,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub published: usize,
    pub failed: usize,
}

pub struct Scheduler {
    state: Shared<SimState>,
    qos: QoS,
    clocks: HashMap<String, DeviceClock>,
}

impl Scheduler {
    pub fn new(state: Shared<SimState>, qos: QoS) -> Self {
        Self { state, qos, clocks: HashMap::new() }
    }

    pub fn tick(&mut self, now: Instant, link: &dyn BrokerLink) -> TickReport {
        let due = self.collect_due(now);
        if due.is_empty() {
            return TickReport::default();
        }

        let outcomes: Vec<(Emission, String, bool)> = due
            .into_iter()
            .map(|emission| {
                let timestamp = local_timestamp();
                let ok = self.send(&emission, &timestamp, link);
                (emission, timestamp, ok)
            })
            .collect();

        self.record(now, outcomes)
    }

    fn collect_due(&mut self, now: Instant) -> Vec<Emission> {
        let mut st = self.state.lock();
        let mut rng = rand::rng();
        let mut due = Vec::new();

        // jauges supprimées ou désactivées : on oublie leur horloge
        self.clocks
            .retain(|id, _| st.registry.get(id).map(|d| d.enabled).unwrap_or(false));

        for device in st.registry.devices_mut().filter(|d| d.enabled) {
            let clock = self
                .clocks
                .entry(device.id.clone())
                .or_insert_with(|| DeviceClock::new(now));

            let interval = match Duration::try_from_secs_f64(device.publish_interval) {
                Ok(interval) => interval,
                Err(e) => {
                    warn!("[{}] skipped, invalid publish_interval {}: {e}", device.name, device.publish_interval);
                    continue;
                }
            };
            if now.saturating_duration_since(clock.last_sent) < interval {
                continue;
            }

            let since_evolved = now.saturating_duration_since(clock.last_evolved).as_secs_f64();
            crate::variation::evolve(&mut device.reading, &device.profile, since_evolved, &mut rng);
            clock.last_evolved = now;

            due.push(Emission {
                id: device.id.clone(),
                name: device.name.clone(),
                topic: device.topic.clone(),
                product_type: device.product_type.clone(),
                reading: device.reading.clone(),
            });
        }
        due
    }

    fn send(&self, emission: &Emission, timestamp: &str, link: &dyn BrokerLink) -> bool {
        let payload = PublishedReading {
            reading: &emission.reading,
            timestamp,
            product_type: &emission.product_type,
        };
        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("[{}] payload serialization failed: {e}", emission.name);
                return false;
            }
        };
        match link.publish(&emission.topic, bytes, self.qos) {
            Ok(()) => {
                debug!(
                    "[{}] published to {}: T={:.2}C, P={:.2}mm, W={:.2}mm, Type={}, Timestamp={}",
                    emission.name,
                    emission.topic,
                    emission.reading.temperature,
                    emission.reading.product_level,
                    emission.reading.water_level,
                    emission.product_type,
                    timestamp
                );
                true
            }
            Err(e) => {
                warn!("[{}] publish to {} failed: {e}", emission.name, emission.topic);
                false
            }
        }
    }

    fn record(&mut self, now: Instant, outcomes: Vec<(Emission, String, bool)>) -> TickReport {
        let mut report = TickReport::default();
        let mut st = self.state.lock();

        for (emission, timestamp, ok) in outcomes {
            if ok {
                report.published += 1;
                st.totals.messages += 1;
                if let Some(device) = st.registry.get_mut(&emission.id) {
                    device.message_count += 1;
                    device.last_publish = Some(timestamp.clone());
                }
                let id = st.history.next_seq();
                st.history.append(HistoryEntry {
                    id,
                    atg_id: emission.id.clone(),
                    atg_name: emission.name,
                    topic: emission.topic,
                    timestamp,
                    product_type: emission.product_type,
                    reading: emission.reading,
                });
                if let Some(clock) = self.clocks.get_mut(&emission.id) {
                    clock.last_sent = now;
                }
            } else {
                report.failed += 1;
                st.totals.errors += 1;
                if let Some(device) = st.registry.get_mut(&emission.id) {
                    device.error_count += 1;
                }
            }
        }
        report
    }
}

/// Lance la boucle de tick ; elle ne chevauche jamais ses propres itérations.
pub fn spawn_tick_loop(mut scheduler: Scheduler, link: Arc<dyn BrokerLink>, cadence: Duration) -> RunHandle {
    let (shutdown, mut stop_rx) = oneshot::channel();
    let loop_link = link.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {
                    let report = scheduler.tick(Instant::now(), loop_link.as_ref());
                    if report.failed > 0 {
                        debug!("tick: {} published, {} failed", report.published, report.failed);
                    }
                }
            }
        }
        debug!("tick loop exited");
    });

    RunHandle { link, shutdown, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::history::HistoryLog;
    use crate::models::DevicePatch;
    use crate::mqtt::mock::MockLink;
    use crate::registry::Registry;
    use crate::state::new_state;

    fn state_with(devices: &[&str]) -> Shared<SimState> {
        let mut registry = Registry::new("ATG");
        for json in devices {
            let patch: DevicePatch = serde_json::from_str(json).unwrap();
            registry.add(patch).unwrap();
        }
        new_state(SimState::new(registry, HistoryLog::default(), BrokerConfig::default()))
    }

    fn run_ticks(scheduler: &mut Scheduler, link: &MockLink, t0: Instant, ticks: u64) {
        for k in 0..=ticks {
            scheduler.tick(t0 + Duration::from_millis(100 * k), link);
        }
    }

    #[test]
    fn test_interval_two_seconds_publishes_once() {
        let state = state_with(&[r#"{"id": "a", "publish_interval": 2}"#]);
        let link = MockLink::new();
        let mut scheduler = Scheduler::new(state.clone(), QoS::AtLeastOnce);

        // 0.0s .. 2.0s par pas de 100ms (2.05s simulées)
        run_ticks(&mut scheduler, &link, Instant::now(), 20);

        assert_eq!(link.sent_count(), 1);
        let st = state.lock();
        assert_eq!(st.totals.messages, 1);
        assert_eq!(st.registry.get("a").unwrap().message_count, 1);
        assert!(st.registry.get("a").unwrap().last_publish.is_some());
        assert_eq!(st.history.len(), 1);
    }

    #[test]
    fn test_payload_and_topic() {
        let state = state_with(&[r#"{"id": "a", "address": "42", "publish_interval": 1, "product_type": "Petrol"}"#]);
        let link = MockLink::new();
        let mut scheduler = Scheduler::new(state, QoS::ExactlyOnce);
        run_ticks(&mut scheduler, &link, Instant::now(), 10);

        let sent = link.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "ATG/42");
        assert_eq!(sent[0].qos, QoS::ExactlyOnce);
        let payload: serde_json::Value = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(payload["Address"], "42");
        assert_eq!(payload["ProductType"], "Petrol");
        assert!(payload["Timestamp"].is_string());
    }

    #[test]
    fn test_independent_intervals() {
        let state = state_with(&[
            r#"{"id": "fast", "publish_interval": 0.5}"#,
            r#"{"id": "slow", "publish_interval": 3}"#,
        ]);
        let link = MockLink::new();
        let mut scheduler = Scheduler::new(state.clone(), QoS::AtLeastOnce);
        run_ticks(&mut scheduler, &link, Instant::now(), 30);

        let st = state.lock();
        assert_eq!(st.registry.get("fast").unwrap().message_count, 6);
        assert_eq!(st.registry.get("slow").unwrap().message_count, 1);
        assert_eq!(st.totals.messages, 7);
    }

    #[test]
    fn test_failure_counts_and_retries_next_tick() {
        let state = state_with(&[r#"{"id": "a", "publish_interval": 1}"#]);
        let link = MockLink::new();
        let mut scheduler = Scheduler::new(state.clone(), QoS::AtLeastOnce);
        let t0 = Instant::now();

        scheduler.tick(t0, &*link);
        link.set_online(false);
        let report = scheduler.tick(t0 + Duration::from_millis(1000), &*link);
        assert_eq!(report, TickReport { published: 0, failed: 1 });

        // échéance non avancée : retenté dès le tick suivant
        let report = scheduler.tick(t0 + Duration::from_millis(1100), &*link);
        assert_eq!(report.failed, 1);

        link.set_online(true);
        let report = scheduler.tick(t0 + Duration::from_millis(1200), &*link);
        assert_eq!(report.published, 1);
        // puis à nouveau un intervalle complet
        assert_eq!(scheduler.tick(t0 + Duration::from_millis(2100), &*link).published, 0);
        assert_eq!(scheduler.tick(t0 + Duration::from_millis(2200), &*link).published, 1);

        let st = state.lock();
        assert_eq!(st.totals.errors, 2);
        assert_eq!(st.registry.get("a").unwrap().error_count, 2);
        assert_eq!(st.totals.messages, 2);
        assert_eq!(st.history.len(), 2);
    }

    #[test]
    fn test_retries_do_not_compound_trend() {
        let state = state_with(&[
            r#"{"id": "a", "publish_interval": 60, "simulate_trend": true, "consumption_rate": 1.0,
                "sensor_data": {"Product": 1000}}"#,
        ]);
        let link = MockLink::new();
        link.set_online(false);
        let mut scheduler = Scheduler::new(state.clone(), QoS::AtLeastOnce);
        let t0 = Instant::now();

        scheduler.tick(t0, &*link);
        scheduler.tick(t0 + Duration::from_secs(60), &*link);
        scheduler.tick(t0 + Duration::from_secs(60) + Duration::from_millis(100), &*link);

        let product = state.lock().registry.get("a").unwrap().reading.product_level;
        // 60.1s de consommation à 1 unité/min
        assert!((product - (1000.0 - 60.1 / 60.0)).abs() < 1e-6);
    }

    #[test]
    fn test_disabled_device_is_skipped() {
        let state = state_with(&[r#"{"id": "a", "publish_interval": 1, "enabled": false}"#]);
        let link = MockLink::new();
        let mut scheduler = Scheduler::new(state.clone(), QoS::AtLeastOnce);
        let t0 = Instant::now();
        run_ticks(&mut scheduler, &link, t0, 50);

        assert_eq!(link.sent_count(), 0);
        {
            let st = state.lock();
            let dev = st.registry.get("a").unwrap();
            assert_eq!((dev.message_count, dev.error_count), (0, 0));
            assert_eq!(st.totals.messages + st.totals.errors, 0);
        }

        state.lock().registry.get_mut("a").unwrap().enabled = true;
        scheduler.tick(t0 + Duration::from_secs(6), &*link);
        scheduler.tick(t0 + Duration::from_secs(7), &*link);
        assert_eq!(link.sent_count(), 1);
    }

    #[test]
    fn test_device_removed_mid_run() {
        let state = state_with(&[r#"{"id": "a", "publish_interval": 1}"#]);
        let link = MockLink::new();
        let mut scheduler = Scheduler::new(state.clone(), QoS::AtLeastOnce);
        let t0 = Instant::now();
        scheduler.tick(t0, &*link);
        state.lock().registry.remove("a");
        let report = scheduler.tick(t0 + Duration::from_secs(2), &*link);
        assert_eq!(report, TickReport::default());
        assert!(scheduler.clocks.is_empty());
    }

    #[test]
    fn test_bad_interval_skips_only_that_device() {
        let state = state_with(&[
            r#"{"id": "bad", "publish_interval": 1}"#,
            r#"{"id": "good", "publish_interval": 1}"#,
        ]);
        // contourne la validation du registre
        state.lock().registry.get_mut("bad").unwrap().publish_interval = 1e20;
        let link = MockLink::new();
        let mut scheduler = Scheduler::new(state.clone(), QoS::AtLeastOnce);
        run_ticks(&mut scheduler, &link, Instant::now(), 30);

        let st = state.lock();
        assert_eq!(st.registry.get("bad").unwrap().message_count, 0);
        assert_eq!(st.registry.get("good").unwrap().message_count, 3);
    }

    #[test]
    fn test_extreme_variance_does_not_break_tick() {
        let state = state_with(&[r#"{"id": "a", "publish_interval": 1, "auto_variation": true}"#]);
        state.lock().registry.get_mut("a").unwrap().profile.temp_variance = 1e308;
        let link = MockLink::new();
        let mut scheduler = Scheduler::new(state.clone(), QoS::AtLeastOnce);
        run_ticks(&mut scheduler, &link, Instant::now(), 30);

        assert_eq!(link.sent_count(), 3);
        let temp = state.lock().registry.get("a").unwrap().reading.temperature;
        assert!((-20.0..=60.0).contains(&temp));
    }

    #[tokio::test]
    async fn test_loop_halts_on_shutdown() {
        let state = state_with(&[r#"{"id": "a", "publish_interval": 0.05}"#]);
        let link = MockLink::new();
        let scheduler = Scheduler::new(state.clone(), QoS::AtLeastOnce);
        let handle = spawn_tick_loop(scheduler, link.clone(), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.halt().await;
        let sent = link.sent_count();
        assert!(sent >= 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(link.sent_count(), sent);
    }
}
