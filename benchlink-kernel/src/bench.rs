/**
 * TEST BENCH - Façade unique pour la couche présentation
 *
 * RÔLE : découverte des candidats, promotion dans le registre, démarrage et
 * arrêt des tests, requêtes d'état et abonnement aux événements.
 *
 * FONCTIONNEMENT :
 * - chaque test = un Worker dans sa propre tâche tokio
 * - les workers publient sur un unique canal mpsc ; une tâche dispatcher
 *   applique chaque événement au registre puis le republie en broadcast
 * - un événement n'est appliqué que si son worker est celui lié au serial :
 *   une session supprimée ou remplacée ne laisse aucune trace
 *
 * EXEMPLE :
 * ```text
 * let bench = TestBench::new(BenchConfig::default());
 * let mut events = bench.subscribe();
 * for device in bench.discover().await? {
 *     bench.add_running_device(device);
 * }
 * bench.start_test("SN0123456", 10, 500).await?;
 * while let Ok(event) = events.recv().await {
 *     println!("{} -> {:?}", event.serial, event.kind);
 * }
 * ```
 */

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::BenchConfig;
use crate::discovery;
use crate::models::{Device, DeviceEvent, EventKind, Sample, SessionStatus};
use crate::registry::{DeviceRegistry, RegistryError, RunningDeviceSnapshot, SharedRegistry};
use crate::state::{new_state, Shared};
use crate::worker::{TestParams, Worker};

/// Erreurs remontées au consommateur
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("Device not registered: {0}")]
    UnknownDevice(String),
    #[error("Test already running on {0}")]
    AlreadyRunning(String),
    #[error("No test running on {0}")]
    NotRunning(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RegistryError> for BenchError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(serial) => BenchError::UnknownDevice(serial),
            RegistryError::AlreadyBound(serial) => BenchError::AlreadyRunning(serial),
        }
    }
}

pub struct TestBench {
    config: BenchConfig,
    registry: SharedRegistry,
    candidates: Shared<Vec<Device>>,
    worker_tx: mpsc::UnboundedSender<DeviceEvent>,
    events: broadcast::Sender<DeviceEvent>,
}

impl TestBench {
    /// Doit être appelé dans un runtime tokio : lance le dispatcher.
    pub fn new(config: BenchConfig) -> Self {
        let registry: SharedRegistry = Arc::new(DeviceRegistry::new(config.registry.clone()));
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.events.capacity.max(1));

        spawn_event_dispatcher(registry.clone(), worker_rx, events.clone());

        Self {
            config,
            registry,
            candidates: new_state(Vec::new()),
            worker_tx,
            events,
        }
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Découverte et candidats
    // ------------------------------------------------------------------

    pub async fn discover(&self) -> anyhow::Result<Vec<Device>> {
        self.discover_with_timeout(self.config.discovery.timeout()).await
    }

    /// Lance une découverte ; la liste des candidats est remplacée en entier
    pub async fn discover_with_timeout(&self, wait: Duration) -> anyhow::Result<Vec<Device>> {
        let devices = discovery::discover_with_timeout(&self.config.discovery, wait).await?;
        *self.candidates.lock() = devices.clone();
        Ok(devices)
    }

    pub fn candidates(&self) -> Vec<Device> {
        self.candidates.lock().clone()
    }

    pub fn clear_candidates(&self) {
        self.candidates.lock().clear();
    }

    /// Promeut le premier candidat portant ce serial
    pub fn promote(&self, serial: &str) -> Result<bool, BenchError> {
        let device = self
            .candidates
            .lock()
            .iter()
            .find(|d| d.serial == serial)
            .cloned()
            .ok_or_else(|| BenchError::UnknownDevice(serial.to_string()))?;
        Ok(self.registry.add_running_device(device))
    }

    // ------------------------------------------------------------------
    // Registre
    // ------------------------------------------------------------------

    pub fn add_running_device(&self, device: Device) -> bool {
        self.registry.add_running_device(device)
    }

    /// Supprime la fiche ; un worker encore lié reçoit une demande d'arrêt
    /// en arrière-plan, ses événements suivants sont ignorés.
    pub fn remove_running_device(&self, serial: &str) -> bool {
        let Some(removed) = self.registry.remove_running_device(serial) else {
            return false;
        };

        if let Some(worker) = removed.worker {
            let serial = serial.to_string();
            tokio::spawn(async move {
                if let Err(e) = worker.stop().await {
                    warn!(%serial, error = %e, "failed to stop worker of removed device");
                }
            });
        }
        true
    }

    pub fn running_devices(&self) -> Vec<Device> {
        self.registry.running_devices()
    }

    pub fn snapshot(&self, serial: &str) -> Option<RunningDeviceSnapshot> {
        self.registry.snapshot(serial)
    }

    pub fn get_status(&self, serial: &str) -> SessionStatus {
        self.registry.get_status(serial)
    }

    pub fn get_log(&self, serial: &str) -> Vec<String> {
        self.registry.get_log(serial)
    }

    pub fn get_samples(&self, serial: &str) -> Vec<Sample> {
        self.registry.get_samples(serial)
    }

    pub fn clear_samples(&self, serial: &str) {
        self.registry.clear_samples(serial)
    }

    pub fn is_running_test(&self, serial: &str) -> bool {
        self.registry.is_running_test(serial)
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    pub async fn start_test(&self, serial: &str, duration_s: u32, rate_ms: u32) -> Result<(), BenchError> {
        let device = self
            .registry
            .device(serial)
            .ok_or_else(|| BenchError::UnknownDevice(serial.to_string()))?;
        if self.registry.is_running_test(serial) {
            return Err(BenchError::AlreadyRunning(serial.to_string()));
        }

        let params = TestParams { duration_s, rate_ms };
        let worker = match Worker::bind(device, params, self.config.worker.clone(), self.worker_tx.clone()).await {
            Ok(worker) => worker,
            Err(e) => {
                error!(%serial, error = %e, "failed to open command socket");
                // une autre session a pu se lier pendant l'attente : ne pas l'écraser
                self.registry.record_start_failure(serial, None, format!("Start failed: {e}"));
                return Err(e.into());
            }
        };

        // lié avant le START : aucun événement de ce worker ne peut être perdu
        let handle = worker.handle();
        self.registry
            .begin_session(serial, handle.clone(), format!("Start Test: {duration_s}s @ {rate_ms}ms"))?;

        if let Err(e) = worker.start().await {
            error!(%serial, error = %e, "failed to send start command");
            self.registry
                .record_start_failure(serial, Some(handle.id()), format!("Start failed: {e}"));
            return Err(e.into());
        }

        info!(%serial, duration_s, rate_ms, worker_id = %handle.id(), "test running");
        Ok(())
    }

    /// Demande d'arrêt. La fin réelle arrive plus tard via l'événement
    /// Finished (statut Completed).
    pub async fn stop_test(&self, serial: &str) -> Result<(), BenchError> {
        if !self.registry.contains(serial) {
            return Err(BenchError::UnknownDevice(serial.to_string()));
        }
        let worker = self
            .registry
            .bound_worker(serial)
            .ok_or_else(|| BenchError::NotRunning(serial.to_string()))?;

        // le worker a pu finir entre-temps : ne pas écraser Completed
        self.registry.set_status_if_bound(serial, worker.id(), SessionStatus::Stopping);
        self.registry.append_log(serial, "Stop Test");

        worker.stop().await?;
        Ok(())
    }
}

/// Consomme les événements des workers dans l'ordre de production
fn spawn_event_dispatcher(
    registry: SharedRegistry,
    mut rx: mpsc::UnboundedReceiver<DeviceEvent>,
    events: broadcast::Sender<DeviceEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !apply_event(&registry, &event) {
                debug!(serial = %event.serial, worker_id = %event.worker_id, "dropping event of stale worker");
                continue;
            }
            // pas d'abonné = pas d'erreur
            let _ = events.send(event);
        }
        debug!("event dispatcher stopped");
    });
}

/// Applique un événement au registre ; false si le worker n'est plus lié
fn apply_event(registry: &DeviceRegistry, event: &DeviceEvent) -> bool {
    let serial = event.serial.as_str();
    if !registry.apply_worker_event(serial, event.worker_id, &event.kind) {
        return false;
    }

    match &event.kind {
        EventKind::Saved(samples) => {
            debug!(%serial, samples = samples.len(), "session samples ready for export");
        }
        EventKind::Finished => info!(%serial, worker_id = %event.worker_id, "session completed"),
        EventKind::Status(_) | EventKind::Sample(_) => {}
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use uuid::Uuid;

    fn device(serial: &str) -> Device {
        Device::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9, "M001", serial)
    }

    #[tokio::test]
    async fn test_start_unknown_serial() {
        let bench = TestBench::new(BenchConfig::default());
        let err = bench.start_test("nope", 1, 100).await.unwrap_err();
        assert!(matches!(err, BenchError::UnknownDevice(s) if s == "nope"));
        assert_eq!(bench.get_status("nope"), SessionStatus::Unknown);
    }

    #[tokio::test]
    async fn test_stop_without_worker() {
        let bench = TestBench::new(BenchConfig::default());
        bench.add_running_device(device("SN1"));
        let err = bench.stop_test("SN1").await.unwrap_err();
        assert!(matches!(err, BenchError::NotRunning(_)));
        assert_eq!(bench.get_status("SN1"), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_promote_from_candidates() {
        let bench = TestBench::new(BenchConfig::default());
        *bench.candidates.lock() = vec![device("SN1"), device("SN2"), device("SN1")];

        assert!(bench.promote("SN1").unwrap());
        assert!(!bench.promote("SN1").unwrap());
        assert!(matches!(bench.promote("SN9"), Err(BenchError::UnknownDevice(_))));
        assert_eq!(bench.running_devices().len(), 1);

        bench.clear_candidates();
        assert!(bench.candidates().is_empty());
    }

    #[test]
    fn test_stale_events_are_dropped() {
        let registry = DeviceRegistry::default();
        registry.add_running_device(device("SN1"));

        let event = DeviceEvent {
            serial: "SN1".into(),
            worker_id: Uuid::new_v4(),
            kind: EventKind::Status("STATUS;STATE=RUNNING;".into()),
        };
        assert!(!apply_event(&registry, &event));
        assert!(registry.get_log("SN1").is_empty());
        assert_eq!(registry.get_status("SN1"), SessionStatus::Idle);
    }

    async fn bound_handle(registry: &DeviceRegistry, serial: &str) -> crate::worker::WorkerHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conf = crate::config::WorkerConf {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Default::default()
        };
        let params = TestParams { duration_s: 1, rate_ms: 100 };
        let handle = Worker::bind(device(serial), params, conf, tx).await.unwrap().handle();
        registry.begin_session(serial, handle.clone(), "Start Test: 1s @ 100ms").unwrap();
        handle
    }

    fn event(serial: &str, worker_id: Uuid, kind: EventKind) -> DeviceEvent {
        DeviceEvent { serial: serial.into(), worker_id, kind }
    }

    #[tokio::test]
    async fn test_start_failure_is_surfaced() {
        let mut config = BenchConfig::default();
        // adresse de documentation : jamais attribuée à une interface locale
        config.worker.bind_addr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let bench = TestBench::new(config);
        bench.add_running_device(device("SN1"));

        let err = bench.start_test("SN1", 1, 100).await.unwrap_err();
        assert!(matches!(err, BenchError::Io(_)));
        assert_eq!(bench.get_status("SN1"), SessionStatus::Error);
        assert!(!bench.is_running_test("SN1"));

        let log = bench.get_log("SN1");
        assert_eq!(log.len(), 1);
        assert!(log[0].starts_with("Start failed: "), "unexpected log {log:?}");
    }

    #[tokio::test]
    async fn test_start_failure_spares_another_session() {
        let registry = DeviceRegistry::default();
        registry.add_running_device(device("SN1"));
        let current = bound_handle(&registry, "SN1").await;

        assert!(!registry.record_start_failure("SN1", None, "Start failed: late"));
        assert!(!registry.record_start_failure("SN1", Some(Uuid::new_v4()), "Start failed: late"));
        assert_eq!(registry.get_status("SN1"), SessionStatus::Testing);
        assert!(registry.is_bound_to("SN1", current.id()));

        assert!(registry.record_start_failure("SN1", Some(current.id()), "Start failed: send"));
        assert_eq!(registry.get_status("SN1"), SessionStatus::Error);
        assert!(!registry.is_running_test("SN1"));
    }

    #[tokio::test]
    async fn test_late_finish_does_not_close_new_session() {
        let registry = DeviceRegistry::default();
        registry.add_running_device(device("SN1"));
        let first = bound_handle(&registry, "SN1").await;

        assert!(apply_event(&registry, &event("SN1", first.id(), EventKind::Finished)));
        assert_eq!(registry.get_status("SN1"), SessionStatus::Completed);

        let second = bound_handle(&registry, "SN1").await;
        assert!(!apply_event(&registry, &event("SN1", first.id(), EventKind::Finished)));
        assert_eq!(registry.get_status("SN1"), SessionStatus::Testing);
        assert!(registry.is_bound_to("SN1", second.id()));
    }

    #[tokio::test]
    async fn test_events_of_removed_session_skip_new_record() {
        let registry = DeviceRegistry::default();
        registry.add_running_device(device("SN1"));
        let old = bound_handle(&registry, "SN1").await;

        registry.remove_running_device("SN1");
        registry.add_running_device(device("SN1"));

        let sample = Sample::new(1, 2.0, 3.0);
        assert!(!apply_event(&registry, &event("SN1", old.id(), EventKind::Status("STATUS;".into()))));
        assert!(!apply_event(&registry, &event("SN1", old.id(), EventKind::Sample(sample))));
        assert!(registry.get_log("SN1").is_empty());
        assert!(registry.get_samples("SN1").is_empty());
        assert_eq!(registry.get_status("SN1"), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_status_keeps_stopping_until_finished() {
        let registry = DeviceRegistry::default();
        registry.add_running_device(device("SN1"));
        let worker = bound_handle(&registry, "SN1").await;
        registry.set_status_if_bound("SN1", worker.id(), SessionStatus::Stopping);

        let reply = EventKind::Status("TEST;RESULT=STOPPED;".into());
        assert!(apply_event(&registry, &event("SN1", worker.id(), reply)));
        assert_eq!(registry.get_status("SN1"), SessionStatus::Stopping);

        assert!(apply_event(&registry, &event("SN1", worker.id(), EventKind::Finished)));
        assert_eq!(registry.get_status("SN1"), SessionStatus::Completed);
        assert_eq!(
            registry.get_log("SN1"),
            ["Start Test: 1s @ 100ms", "TEST;RESULT=STOPPED;", "Test Finished"]
        );
    }
}
