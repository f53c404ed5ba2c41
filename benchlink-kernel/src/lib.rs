/*!
BENCHLINK KERNEL - Pilotage d'instruments de test sur UDP

RÔLE : découverte multicast des appareils, un worker par test en cours,
registre concurrent des appareils promus (journal, samples, statut).

ARCHITECTURE : protocol (trames texte) -> discovery / worker (sockets UDP
tokio) -> registry (table sous verrou) -> bench (façade + dispatcher
d'événements). La présentation, l'export fichier et le démarrage du
processus restent hors de cette crate.
*/

pub mod bench;
pub mod config;
pub mod discovery;
pub mod models;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod worker;

pub use bench::{BenchError, TestBench};
pub use config::{load_config, BenchConfig};
pub use models::{Device, DeviceEvent, EventKind, Sample, SessionStatus};
pub use registry::{DeviceRegistry, RegistryError, SharedRegistry};
pub use worker::{TestParams, WorkerHandle, WorkerState};
