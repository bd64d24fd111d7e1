/**
 * MODÈLES ATG - Jauge de cuve simulée et enregistrements associés
 *
 * RÔLE : Schéma d'une jauge (config + lecture courante + compteurs), patchs
 * partiels venant de l'API, entrées d'historique et payload publié.
 *
 * FORMAT : les noms de champs JSON sont ceux attendus par l'UI et par les
 * consommateurs MQTT existants (`sensor_data.Temp`, `ProductType`...).
 */

use serde::{Deserialize, Serialize};

pub const TEMP_RANGE: (f64, f64) = (-20.0, 60.0);
pub const PRODUCT_RANGE: (f64, f64) = (0.0, 3000.0);
pub const WATER_RANGE: (f64, f64) = (0.0, 100.0);

pub const DEFAULT_ADDRESS: &str = "83729";
pub const DEFAULT_PRODUCT_TYPE: &str = "Diesel";
pub const DEFAULT_INTERVAL_SECS: f64 = 2.0;

/// Un jour au plus entre deux publications.
pub const MAX_INTERVAL_SECS: f64 = 86_400.0;
/// Unités/minute : vider une cuve pleine en une minute.
pub const MAX_CONSUMPTION_RATE: f64 = PRODUCT_RANGE.1 - PRODUCT_RANGE.0;

/// Lecture courante d'une jauge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "req_type")]
    pub request_type: i64,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Temp")]
    pub temperature: f64,
    #[serde(rename = "Product")]
    pub product_level: f64,
    #[serde(rename = "Water")]
    pub water_level: f64,
}

impl Default for Reading {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.into(),
            request_type: 0,
            status: "0".into(),
            temperature: 25.13,
            product_level: 1230.00,
            water_level: 12.98,
        }
    }
}

/// Paramètres du moteur de variation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariationProfile {
    pub auto_variation: bool,
    pub temp_variance: f64,
    pub product_variance: f64,
    pub water_variance: f64,
    pub simulate_trend: bool,
    /// unités par minute
    pub consumption_rate: f64,
}

impl Default for VariationProfile {
    fn default() -> Self {
        Self {
            auto_variation: false,
            temp_variance: 0.5,
            product_variance: 2.0,
            water_variance: 0.5,
            simulate_trend: false,
            consumption_rate: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub address: String,
    pub topic: String,
    pub publish_interval: f64,
    pub product_type: String,
    pub enabled: bool,
    #[serde(rename = "sensor_data")]
    pub reading: Reading,
    #[serde(flatten)]
    pub profile: VariationProfile,
    pub message_count: u64,
    pub error_count: u64,
    pub last_publish: Option<String>,
}

/// Corps partiel de `/api/atg/add` et `/api/atg/update` : seuls les champs
/// présents sont appliqués.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DevicePatch {
    pub id: Option<String>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub topic: Option<String>,
    pub publish_interval: Option<f64>,
    pub product_type: Option<String>,
    pub enabled: Option<bool>,
    pub sensor_data: Option<ReadingPatch>,
    pub auto_variation: Option<bool>,
    pub temp_variance: Option<f64>,
    pub product_variance: Option<f64>,
    pub water_variance: Option<f64>,
    pub simulate_trend: Option<bool>,
    pub consumption_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReadingPatch {
    #[serde(rename = "Address")]
    pub address: Option<String>,
    #[serde(rename = "req_type")]
    pub request_type: Option<i64>,
    #[serde(rename = "Status")]
    pub status: Option<String>,
    #[serde(rename = "Temp")]
    pub temperature: Option<f64>,
    #[serde(rename = "Product")]
    pub product_level: Option<f64>,
    #[serde(rename = "Water")]
    pub water_level: Option<f64>,
}

impl ReadingPatch {
    pub fn apply(self, reading: &mut Reading) {
        if let Some(v) = self.address { reading.address = v; }
        if let Some(v) = self.request_type { reading.request_type = v; }
        if let Some(v) = self.status { reading.status = v; }
        if let Some(v) = self.temperature { reading.temperature = v; }
        if let Some(v) = self.product_level { reading.product_level = v; }
        if let Some(v) = self.water_level { reading.water_level = v; }
    }
}

/// Trace d'une publication réussie.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: u64,
    pub atg_id: String,
    pub atg_name: String,
    pub topic: String,
    pub timestamp: String,
    pub product_type: String,
    #[serde(flatten)]
    pub reading: Reading,
}

/// Payload MQTT : champs de lecture + `Timestamp` + `ProductType`.
#[derive(Debug, Serialize)]
pub struct PublishedReading<'a> {
    #[serde(flatten)]
    pub reading: &'a Reading,
    #[serde(rename = "Timestamp")]
    pub timestamp: &'a str,
    #[serde(rename = "ProductType")]
    pub product_type: &'a str,
}

/// Heure locale au format `YYYY-MM-DDTHH:MM:SS`.
pub fn local_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}
