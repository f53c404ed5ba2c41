/**
 * PROTOCOL - Trames texte du protocole de contrôle UDP des instruments
 *
 * RÔLE : encodage des commandes (ID / TEST START / TEST STOP) et décodage des
 * réponses (identification, STATUS). Le format est imposé par le firmware des
 * appareils : ne rien changer au texte émis.
 *
 * FORMAT : champs ASCII/Latin-1 terminés par ';', valeurs en KEY=VALUE.
 * ```text
 * ID;                                            -> découverte
 * ID;MODEL=M001;SERIAL=SN0123456;                <- réponse identification
 * TEST;CMD=START;DURATION=10;RATE=500;           -> démarrage
 * TEST;CMD=STOP;                                 -> arrêt
 * STATUS;TIME=500;MV=4500.0;MA=100.0;STATE=RUNNING;  <- télémétrie
 * ```
 */

use crate::models::Sample;
use std::fmt;

pub const STATUS_PREFIX: &str = "STATUS;";
pub const IDLE_MARKER: &str = "STATE=IDLE";

/// Erreurs de décodage d'une réponse d'identification
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("identification reply has {0} fields, expected at least 3")]
    TooFewFields(usize),
    #[error("field {index} is not a {key}= assignment: {field:?}")]
    BadAssignment {
        index: usize,
        key: &'static str,
        field: String,
    },
}

/// Commandes envoyées aux appareils
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Identify,
    Start { duration_s: u32, rate_ms: u32 },
    Stop,
}

impl Command {
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Identify => f.write_str("ID;"),
            Command::Start { duration_s, rate_ms } => {
                write!(f, "TEST;CMD=START;DURATION={duration_s};RATE={rate_ms};")
            }
            Command::Stop => f.write_str("TEST;CMD=STOP;"),
        }
    }
}

/// Décodage Latin-1 : chaque octet est un point de code, jamais d'échec
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Identité extraite d'une réponse `ID;MODEL=<model>;SERIAL=<serial>;`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub model: String,
    pub serial: String,
}

/// Les champs sont lus à position fixe (1 = MODEL, 2 = SERIAL), pas par
/// recherche de clé : une réponse réordonnée est rejetée.
pub fn parse_identity(message: &str) -> Result<Identity, ProtocolError> {
    let parts: Vec<&str> = message.split(';').collect();
    if parts.len() < 3 {
        return Err(ProtocolError::TooFewFields(parts.len()));
    }

    let model = assignment(parts[1], 1, "MODEL")?;
    let serial = assignment(parts[2], 2, "SERIAL")?;

    Ok(Identity {
        model: model.to_string(),
        serial: serial.to_string(),
    })
}

fn assignment<'a>(field: &'a str, index: usize, key: &'static str) -> Result<&'a str, ProtocolError> {
    match field.split_once('=') {
        Some((k, v)) if k == key => Ok(v),
        _ => Err(ProtocolError::BadAssignment {
            index,
            key,
            field: field.to_string(),
        }),
    }
}

/// État rapporté par le champ STATE d'une trame STATUS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Running,
    Idle,
}

/// Champs reconnus d'une trame STATUS ; chacun peut manquer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusRecord {
    pub time_ms: Option<i64>,
    pub voltage_mv: Option<f64>,
    pub current_ma: Option<f64>,
    pub state: Option<DeviceState>,
}

impl StatusRecord {
    /// Un sample n'existe que si TIME, MV et MA sont tous présents
    pub fn sample(&self) -> Option<Sample> {
        Some(Sample::new(self.time_ms?, self.voltage_mv?, self.current_ma?))
    }
}

/// Décode une trame commençant par `STATUS;`. Renvoie None pour toute autre
/// trame. Champs inconnus ignorés, valeurs illisibles traitées comme absentes.
pub fn parse_status(message: &str) -> Option<StatusRecord> {
    let body = message.strip_prefix(STATUS_PREFIX)?;
    let mut record = StatusRecord::default();

    for part in body.split(';') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        match key {
            "TIME" => record.time_ms = value.trim().parse().ok(),
            "MV" => record.voltage_mv = value.trim().parse().ok(),
            "MA" => record.current_ma = value.trim().parse().ok(),
            "STATE" => {
                record.state = match value {
                    "RUNNING" => Some(DeviceState::Running),
                    "IDLE" => Some(DeviceState::Idle),
                    _ => None,
                }
            }
            _ => {}
        }
    }

    Some(record)
}

/// Signal de fin de test : la sous-chaîne suffit, où qu'elle soit
pub fn is_idle(message: &str) -> bool {
    message.contains(IDLE_MARKER)
}
