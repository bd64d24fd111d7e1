use crate::errors::SimError;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub http: HttpConf,
    pub broker: BrokerConfig,
    pub simulation: SimulationConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0".into(), port: 8000 }
    }
}

/// Configuration du broker, exposée telle quelle par `/api/mqtt-config`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub broker_ip: String,
    pub broker_port: u16,
    pub username: String,
    pub password: String,
    pub qos: u8,
    pub keep_alive: u64,
    pub clean_session: bool,
    pub auto_reconnect: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_ip: "127.0.0.1".into(),
            broker_port: 1883,
            username: "duc".into(),
            password: "SRT123".into(),
            qos: 1,
            keep_alive: 60,
            clean_session: true,
            auto_reconnect: true,
        }
    }
}

/// Mise à jour partielle reçue par `POST /api/mqtt-config`.
#[derive(Debug, Deserialize, Default)]
pub struct BrokerConfigPatch {
    pub broker_ip: Option<String>,
    pub broker_port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: Option<u8>,
    pub keep_alive: Option<u64>,
    pub clean_session: Option<bool>,
    pub auto_reconnect: Option<bool>,
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if self.broker_ip.trim().is_empty() {
            return Err(SimError::validation("broker_ip must not be empty"));
        }
        if self.broker_port == 0 {
            return Err(SimError::validation("broker_port must be > 0"));
        }
        if self.qos > 2 {
            return Err(SimError::validation(format!("invalid qos {} (expected 0, 1 or 2)", self.qos)));
        }
        // rumqttc refuse un keep-alive trop court
        if !(5..=u16::MAX as u64).contains(&self.keep_alive) {
            return Err(SimError::validation(format!(
                "keep_alive must be between 5 and {} seconds",
                u16::MAX
            )));
        }
        Ok(())
    }

    /// Fusionne un patch ; la config n'est modifiée que si le résultat est valide.
    pub fn merge(&mut self, patch: BrokerConfigPatch) -> Result<(), SimError> {
        let mut next = self.clone();
        if let Some(v) = patch.broker_ip { next.broker_ip = v; }
        if let Some(v) = patch.broker_port { next.broker_port = v; }
        if let Some(v) = patch.username { next.username = v; }
        if let Some(v) = patch.password { next.password = v; }
        if let Some(v) = patch.qos { next.qos = v; }
        if let Some(v) = patch.keep_alive { next.keep_alive = v; }
        if let Some(v) = patch.clean_session { next.clean_session = v; }
        if let Some(v) = patch.auto_reconnect { next.auto_reconnect = v; }
        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn qos_level(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SimulationConf {
    pub tick_ms: u64,
    pub topic_prefix: String,
    pub history_capacity: usize,
    pub history_page: usize,
    pub connect_timeout_secs: u64,
}

impl Default for SimulationConf {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            topic_prefix: "ATG".into(),
            history_capacity: 1000,
            history_page: 100,
            connect_timeout_secs: 3,
        }
    }
}

pub async fn load_settings() -> Settings {
    let path = std::env::var("ATG_SIMULATOR_CONFIG").unwrap_or_else(|_| "simulator.yaml".into());
    let mut settings = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_settings(&txt).unwrap_or_else(|e| {
            warn!("invalid config {path}: {e}, using defaults");
            Settings::default()
        })
    } else {
        warn!("no {path} found, using default config");
        Settings::default()
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn parse_settings(txt: &str) -> Result<Settings, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_yaml::from_str(txt)
}

fn apply_env_overrides(settings: &mut Settings, env: impl Fn(&str) -> Option<String>) {
    if let Some(port) = env("ATG_SIMULATOR_PORT").and_then(|v| v.parse().ok()) {
        settings.http.port = port;
    }
    if let Some(host) = env("ATG_SIMULATOR_BROKER_HOST") {
        settings.broker.broker_ip = host;
    }
    if let Some(port) = env("ATG_SIMULATOR_BROKER_PORT").and_then(|v| v.parse().ok()) {
        settings.broker.broker_port = port;
    }
}
