//! Request and response shapes for the ingestion endpoint.
//!
//! Field names follow the wire contract used by the mobile clients, which is
//! why they are Spanish. Several aliases are accepted on input.

use serde::{Deserialize, Serialize};

use crate::coordinator::IngestionOutcome;
use crate::error::{ClusterError, Result};
use crate::stops::Stop;
use crate::types::{Action, Motive, Ping};
use crate::{ClusterId, GpsPoint, RouteId};

/// One ping as posted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRequest {
    #[serde(alias = "identidad", alias = "user_id")]
    pub usuario_id: String,
    #[serde(default)]
    pub es_registrado: bool,
    #[serde(alias = "latitude")]
    pub latitud: f64,
    #[serde(alias = "longitude")]
    pub longitud: f64,
    #[serde(default, alias = "speed", skip_serializing_if = "Option::is_none")]
    pub velocidad: Option<f64>,
    #[serde(default, alias = "accuracy", skip_serializing_if = "Option::is_none")]
    pub precision_metros: Option<f64>,
    #[serde(default, alias = "heading", skip_serializing_if = "Option::is_none")]
    pub direccion: Option<f64>,
    #[serde(alias = "route_id")]
    pub id_ruta: RouteId,
    #[serde(default)]
    pub confirmado_usuario: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub esta_en_bus: Option<bool>,
    #[serde(default, alias = "patente", alias = "plate", skip_serializing_if = "Option::is_none")]
    pub id_bus: Option<String>,
    /// Milliseconds since the epoch; server time when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl IngestionRequest {
    /// Convert to a validated [`Ping`].
    pub fn into_ping(self) -> Result<Ping> {
        let mut ping = Ping::new(
            self.usuario_id,
            self.id_ruta,
            GpsPoint::new(self.latitud, self.longitud),
        )
        .registered(self.es_registrado)
        .confirmed(self.confirmado_usuario);

        ping.heading = self.direccion;
        ping.speed = self.velocidad;
        ping.accuracy = self.precision_metros;
        ping.on_bus = self.esta_en_bus;
        if let Some(plate) = self.id_bus.as_deref() {
            ping = ping.with_plate(plate);
        }
        if let Some(ts) = self.timestamp {
            ping = ping.with_timestamp(ts);
        }

        ping.validate()?;
        Ok(ping)
    }
}

/// Nearest stop as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopInfo {
    pub id_paradero: u32,
    pub nom_paradero: String,
    pub distancia_metros: f64,
}

impl StopInfo {
    fn new(stop: &Stop, distance: f64) -> Self {
        Self {
            id_paradero: stop.id,
            nom_paradero: stop.name.clone(),
            distancia_metros: (distance * 10.0).round() / 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(rename = "enBus")]
    pub en_bus: bool,
    #[serde(rename = "clusterId")]
    pub cluster_id: Option<ClusterId>,
    #[serde(rename = "cantidadUsuarios")]
    pub cantidad_usuarios: u32,
    pub accion: Action,
    /// Always present, `null` when no stop is in range
    #[serde(rename = "paraderosCercano")]
    pub paradero_cercano: Option<StopInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidado_desde: Option<ClusterId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruta_original: Option<RouteId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruta_detectada: Option<RouteId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_desactivado: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motivo: Option<Motive>,
}

/// Success envelope: `{"success": true, "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionResponse {
    pub success: bool,
    pub data: ResponseData,
}

impl From<IngestionOutcome> for IngestionResponse {
    fn from(outcome: IngestionOutcome) -> Self {
        let data = ResponseData {
            en_bus: outcome.on_bus,
            cluster_id: outcome.cluster_id(),
            cantidad_usuarios: outcome.member_count(),
            accion: outcome.action,
            paradero_cercano: outcome
                .nearest_stop
                .as_ref()
                .map(|(stop, distance)| StopInfo::new(stop, *distance)),
            consolidado_desde: outcome.consolidated_from,
            ruta_original: outcome.original_route,
            ruta_detectada: outcome.detected_route,
            cluster_desactivado: outcome.cluster_deactivated,
            motivo: outcome.motive,
        };
        Self {
            success: true,
            data,
        }
    }
}

/// Failure envelope: `{"success": false, "error": "...", "code": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    pub code: String,
}

impl From<&ClusterError> for ErrorBody {
    fn from(err: &ClusterError) -> Self {
        Self {
            success: false,
            error: err.to_string(),
            code: err.code().to_string(),
        }
    }
}
