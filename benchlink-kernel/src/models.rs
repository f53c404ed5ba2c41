/**
 * MODELS - Types partagés entre découverte, workers et registre
 *
 * RÔLE : Device (identité + adresse d'un instrument), Sample (point de
 * télémétrie), SessionStatus (état d'une session de test) et DeviceEvent
 * (notification émise par un worker).
 *
 * RÈGLE : le numéro de série est la clé naturelle. Deux Device avec le même
 * serial sont le même appareil, quelle que soit leur adresse.
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

/// Instrument ayant répondu à la découverte. Immuable après création.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub ip: IpAddr,
    pub port: u16,
    pub model: String,
    pub serial: String,
}

impl Device {
    pub fn new(ip: IpAddr, port: u16, model: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            ip,
            port,
            model: model.into(),
            serial: serial.into(),
        }
    }

    /// Adresse de destination des commandes TEST
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.serial == other.serial
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serial.hash(state);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} @ {}:{}", self.model, self.serial, self.ip, self.port)
    }
}

/// Un point de télémétrie : (temps ms, tension mV, courant mA)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time_ms: i64,
    pub voltage_mv: f64,
    pub current_ma: f64,
}

impl Sample {
    pub fn new(time_ms: i64, voltage_mv: f64, current_ma: f64) -> Self {
        Self { time_ms, voltage_mv, current_ma }
    }
}

/// État d'une session de test pour un serial du registre.
/// `Unknown` n'est jamais stocké : c'est la sentinelle des serials absents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Unknown,
    Idle,
    Testing,
    Stopping,
    Completed,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Unknown => "Unknown",
            SessionStatus::Idle => "Idle",
            SessionStatus::Testing => "Testing",
            SessionStatus::Stopping => "Stopping",
            SessionStatus::Completed => "Completed",
            SessionStatus::Error => "Error",
        };
        f.write_str(label)
    }
}

/// Contenu d'une notification worker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    /// Datagramme brut accepté, tel que reçu
    Status(String),
    /// Enregistrement STATUS complet
    Sample(Sample),
    /// Tous les samples de la session, émis une seule fois en fin de boucle
    Saved(Vec<Sample>),
    /// Fin de session (toujours le dernier événement d'un worker)
    Finished,
}

/// Notification d'un worker, étiquetée par serial et par instance de worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceEvent {
    pub serial: String,
    pub worker_id: Uuid,
    #[serde(flatten)]
    pub kind: EventKind,
}
