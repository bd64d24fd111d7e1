/**
 * ERREURS SIMULATEUR - Taxonomie des échecs remontés à l'API de contrôle
 *
 * RÔLE : Erreurs synchrones des opérations de contrôle (start/stop/CRUD/config).
 * Les échecs de publication en tâche de fond ne passent jamais par ici :
 * ils sont comptés et loggés par le scheduler.
 */

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SimError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("ATG id '{0}' already exists")]
    DuplicateId(String),

    #[error("Simulation already running")]
    AlreadyRunning,

    #[error("Simulation is not running")]
    NotRunning,

    #[error("Simulation is stopping, retry shortly")]
    StopInProgress,

    #[error("No ATGs configured. Add at least one ATG first.")]
    NoDevices,

    #[error("Failed to connect to MQTT broker ({0}). Check if broker is running and credentials are correct.")]
    BrokerUnavailable(String),
}

impl SimError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SimError::Validation(msg.into())
    }
}

// L'UI d'origine lit `success` dans le corps, pas le code HTTP
impl IntoResponse for SimError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "success": false, "message": self.to_string() });
        (StatusCode::OK, Json(body)).into_response()
    }
}
