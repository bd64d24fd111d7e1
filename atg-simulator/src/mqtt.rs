/**
 * ADAPTATEUR MQTT - Connexion unique au broker pour la durée d'un run
 *
 * RÔLE :
 * Encapsule rumqttc derrière deux coutures (`Connector`, `BrokerLink`) pour
 * que le scheduler ne voie que `publish(topic, payload, qos) -> Result`.
 *
 * FONCTIONNEMENT :
 * - `connect` crée le client, lance la boucle d'événements et attend le
 *   CONNACK (borné par `connect_timeout`)
 * - `publish` dépose le message dans la file du client sans attendre
 *   (`try_publish`) : succès = mise en file locale, pas livraison
 * - les changements d'état de session remontent via un `LinkObserver`
 * - reconnexion automatique : la boucle continue de poller avec un backoff
 *   1s → 30s tant que `auto_reconnect` est actif
 */

use crate::config::BrokerConfig;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Outgoing, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 100;
const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq)]
pub enum LinkError {
    #[error("not connected to broker")]
    NotConnected,

    #[error("MQTT client error: {0}")]
    Client(String),

    #[error("no CONNACK from {host}:{port} within {timeout:?}")]
    Handshake { host: String, port: u16, timeout: Duration },
}

/// Transitions de session remontées par l'adaptateur.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected { resumed: bool },
    Disconnected { reason: String },
}

pub type LinkObserver = Arc<dyn Fn(LinkEvent) + Send + Sync>;

#[async_trait]
pub trait BrokerLink: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), LinkError>;

    /// Idempotent.
    async fn disconnect(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &BrokerConfig,
        observer: LinkObserver,
    ) -> Result<Arc<dyn BrokerLink>, LinkError>;
}

pub struct MqttConnector {
    connect_timeout: Duration,
}

impl MqttConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

pub struct MqttLink {
    client: AsyncClient,
    online: Arc<watch::Sender<bool>>,
    closed: Arc<AtomicBool>,
    poller: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

fn client_id() -> String {
    format!("ATG_Simulator_{}", crate::registry::generate_id())
}

fn build_options(config: &BrokerConfig) -> MqttOptions {
    let mut opts = MqttOptions::new(client_id(), config.broker_ip.clone(), config.broker_port);
    opts.set_keep_alive(Duration::from_secs(config.keep_alive.max(5)));
    opts.set_clean_session(config.clean_session);
    if !config.username.is_empty() {
        opts.set_credentials(config.username.clone(), config.password.clone());
    }
    opts
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        config: &BrokerConfig,
        observer: LinkObserver,
    ) -> Result<Arc<dyn BrokerLink>, LinkError> {
        let (client, mut eventloop) = AsyncClient::new(build_options(config), REQUEST_CAPACITY);
        let (online_tx, mut online_rx) = watch::channel(false);
        let online = Arc::new(online_tx);
        let closed = Arc::new(AtomicBool::new(false));
        let auto_reconnect = config.auto_reconnect;

        let poller = {
            let online = online.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                let mut delay = MIN_RECONNECT_DELAY;
                let mut sessions = 0u32;
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            online.send_replace(true);
                            delay = MIN_RECONNECT_DELAY;
                            observer(LinkEvent::Connected { resumed: sessions > 0 });
                            sessions += 1;
                        }
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                            online.send_replace(false);
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let was_online = online.send_replace(false);
                            if closed.load(Ordering::SeqCst) {
                                break;
                            }
                            if was_online {
                                observer(LinkEvent::Disconnected { reason: e.to_string() });
                            } else {
                                debug!("MQTT connection attempt failed: {e}");
                            }
                            if !auto_reconnect && sessions > 0 {
                                warn!("auto-reconnect disabled, giving up on broker session");
                                break;
                            }
                            tokio::time::sleep(delay).await;
                            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                        }
                    }
                }
            })
        };

        let ready = matches!(
            tokio::time::timeout(self.connect_timeout, online_rx.wait_for(|up| *up)).await,
            Ok(Ok(_))
        );
        if !ready {
            closed.store(true, Ordering::SeqCst);
            poller.abort();
            return Err(LinkError::Handshake {
                host: config.broker_ip.clone(),
                port: config.broker_port,
                timeout: self.connect_timeout,
            });
        }

        info!("connected to MQTT broker at {}:{}", config.broker_ip, config.broker_port);
        Ok(Arc::new(MqttLink {
            client,
            online,
            closed,
            poller: parking_lot::Mutex::new(Some(poller)),
        }))
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), LinkError> {
        if !*self.online.borrow() {
            return Err(LinkError::NotConnected);
        }
        self.client
            .try_publish(topic, qos, false, payload)
            .map_err(|e| LinkError::Client(e.to_string()))
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect request failed: {e}");
        }
        let handle = self.poller.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(Duration::from_secs(1), &mut handle).await.is_err() {
                handle.abort();
            }
        }
        self.online.send_replace(false);
        info!("disconnected from MQTT broker");
    }
}

/// Sonde TCP brute vers le broker, indépendante de l'adaptateur.
pub async fn probe_tcp(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub struct SentMessage {
        pub topic: String,
        pub payload: Vec<u8>,
        pub qos: QoS,
    }

    /// Lien en mémoire : enregistre les publications, peut simuler une coupure.
    pub struct MockLink {
        pub sent: Mutex<Vec<SentMessage>>,
        pub online: AtomicBool,
        pub disconnects: Mutex<u32>,
    }

    impl MockLink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                online: AtomicBool::new(true),
                disconnects: Mutex::new(0),
            })
        }

        pub fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl BrokerLink for MockLink {
        fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), LinkError> {
            if !self.online.load(Ordering::SeqCst) {
                return Err(LinkError::NotConnected);
            }
            self.sent.lock().push(SentMessage { topic: topic.to_string(), payload, qos });
            Ok(())
        }

        async fn disconnect(&self) {
            *self.disconnects.lock() += 1;
        }
    }

    pub struct MockConnector {
        pub link: Arc<MockLink>,
        pub accept: AtomicBool,
        pub attempts: Mutex<u32>,
    }

    impl MockConnector {
        pub fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                link: MockLink::new(),
                accept: AtomicBool::new(accept),
                attempts: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(
            &self,
            config: &BrokerConfig,
            observer: LinkObserver,
        ) -> Result<Arc<dyn BrokerLink>, LinkError> {
            *self.attempts.lock() += 1;
            if !self.accept.load(Ordering::SeqCst) {
                return Err(LinkError::Handshake {
                    host: config.broker_ip.clone(),
                    port: config.broker_port,
                    timeout: Duration::from_millis(10),
                });
            }
            observer(LinkEvent::Connected { resumed: false });
            Ok(self.link.clone())
        }
    }
}
