/*!
# BenchLink DevKit - Appareils simulés et utilitaires de test

Bibliothèque facilitant les tests du banc sans instrument réel :
- Stub UDP qui enregistre les commandes et rejoue des trames choisies
- Simulateur complet du firmware (ID, START, STATUS périodiques, STOP)
- Helpers d'attente et d'initialisation des logs
*/

pub mod sim_device;
pub mod test_utils;
pub mod udp_stub;

pub use sim_device::{SimConfig, SimDevice};
pub use test_utils::{init_tracing, wait_for, wait_until, within};
pub use udp_stub::{ReceivedCommand, StubDevice};
