/**
 * REGISTRE ATG - Stockage en mémoire des jauges simulées
 *
 * RÔLE : CRUD des jauges indexées par id. L'exclusion mutuelle est portée par
 * le verrou unique de `SimState` : chaque opération est atomique vis-à-vis
 * des ticks du scheduler et des autres requêtes HTTP.
 *
 * RÈGLES :
 * - id généré (8 hex) si absent, collision refusée
 * - topic dérivé `<prefix>/<address>` si non fourni
 * - `address` et `sensor_data.Address` restent synchronisés
 */

use crate::errors::SimError;
use crate::models::{
    Device, DevicePatch, Reading, ReadingPatch, VariationProfile, DEFAULT_INTERVAL_SECS,
    DEFAULT_PRODUCT_TYPE, MAX_CONSUMPTION_RATE, MAX_INTERVAL_SECS, PRODUCT_RANGE, TEMP_RANGE,
    WATER_RANGE,
};
use std::collections::HashMap;
use uuid::Uuid;

pub type DevicesMap = HashMap<String, Device>;

#[derive(Debug)]
pub struct Registry {
    devices: DevicesMap,
    topic_prefix: String,
}

pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl Registry {
    pub fn new(topic_prefix: &str) -> Self {
        Self {
            devices: HashMap::new(),
            topic_prefix: topic_prefix.to_string(),
        }
    }

    pub fn add(&mut self, patch: DevicePatch) -> Result<Device, SimError> {
        validate(&patch)?;

        let id = match patch.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => generate_id(),
        };
        if self.devices.contains_key(&id) {
            return Err(SimError::DuplicateId(id));
        }

        let address = patch
            .address
            .clone()
            .unwrap_or_else(|| format!("8372{}", self.devices.len()));
        let name = patch.name.clone().unwrap_or_else(|| format!("ATG-{address}"));
        let topic = patch
            .topic
            .clone()
            .unwrap_or_else(|| format!("{}/{}", self.topic_prefix, address));

        let mut device = Device {
            id: id.clone(),
            name,
            address: address.clone(),
            topic,
            publish_interval: DEFAULT_INTERVAL_SECS,
            product_type: DEFAULT_PRODUCT_TYPE.into(),
            enabled: true,
            reading: Reading { address, ..Default::default() },
            profile: VariationProfile::default(),
            message_count: 0,
            error_count: 0,
            last_publish: None,
        };
        apply_patch(&mut device, patch);

        self.devices.insert(id, device.clone());
        Ok(device)
    }

    pub fn remove(&mut self, id: &str) -> Option<Device> {
        self.devices.remove(id)
    }

    pub fn update(&mut self, id: &str, mut patch: DevicePatch) -> Result<Device, SimError> {
        let device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| SimError::NotFound("ATG".into()))?;
        validate(&patch)?;
        // l'id est immuable
        patch.id = None;
        apply_patch(device, patch);
        Ok(device.clone())
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Device> {
        self.devices.get_mut(id)
    }

    /// Liste triée par nom puis id.
    pub fn list(&self) -> Vec<Device> {
        let mut list: Vec<Device> = self.devices.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.values_mut()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }
}

fn apply_patch(device: &mut Device, patch: DevicePatch) {
    if let Some(v) = patch.name { device.name = v; }
    if let Some(v) = patch.topic { device.topic = v; }
    if let Some(v) = patch.publish_interval { device.publish_interval = v; }
    if let Some(v) = patch.product_type { device.product_type = v; }
    if let Some(v) = patch.enabled { device.enabled = v; }
    if let Some(v) = patch.auto_variation { device.profile.auto_variation = v; }
    if let Some(v) = patch.temp_variance { device.profile.temp_variance = v; }
    if let Some(v) = patch.product_variance { device.profile.product_variance = v; }
    if let Some(v) = patch.water_variance { device.profile.water_variance = v; }
    if let Some(v) = patch.simulate_trend { device.profile.simulate_trend = v; }
    if let Some(v) = patch.consumption_rate { device.profile.consumption_rate = v; }
    if let Some(reading) = patch.sensor_data {
        reading.apply(&mut device.reading);
    }
    // `address` l'emporte sur `sensor_data.Address`
    match patch.address {
        Some(address) => {
            device.reading.address = address.clone();
            device.address = address;
        }
        None => device.address = device.reading.address.clone(),
    }
}

fn validate(patch: &DevicePatch) -> Result<(), SimError> {
    if let Some(interval) = patch.publish_interval {
        if !interval.is_finite() || interval <= 0.0 || interval > MAX_INTERVAL_SECS {
            return Err(SimError::validation(format!(
                "publish_interval must be within (0, {MAX_INTERVAL_SECS}]"
            )));
        }
    }
    // une variance ne dépasse jamais la largeur de la plage du champ
    for (field, value, max) in [
        ("temp_variance", patch.temp_variance, span(TEMP_RANGE)),
        ("product_variance", patch.product_variance, span(PRODUCT_RANGE)),
        ("water_variance", patch.water_variance, span(WATER_RANGE)),
        ("consumption_rate", patch.consumption_rate, MAX_CONSUMPTION_RATE),
    ] {
        if let Some(v) = value {
            if !v.is_finite() || v < 0.0 || v > max {
                return Err(SimError::validation(format!("{field} must be within [0, {max}]")));
            }
        }
    }
    if let Some(reading) = &patch.sensor_data {
        validate_reading(reading)?;
    }
    Ok(())
}

fn span((lo, hi): (f64, f64)) -> f64 {
    hi - lo
}

fn validate_reading(reading: &ReadingPatch) -> Result<(), SimError> {
    for (field, value, (lo, hi)) in [
        ("Temp", reading.temperature, TEMP_RANGE),
        ("Product", reading.product_level, PRODUCT_RANGE),
        ("Water", reading.water_level, WATER_RANGE),
    ] {
        if let Some(v) = value {
            if !v.is_finite() || v < lo || v > hi {
                return Err(SimError::validation(format!("{field} must be within [{lo}, {hi}]")));
            }
        }
    }
    Ok(())
}
