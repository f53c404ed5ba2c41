/**
 * DEVICE REGISTRY - Registre concurrent des appareils en test
 *
 * RÔLE : une fiche par serial (appareil, worker lié, journal, samples, statut).
 * Point unique où le consommateur et les workers lisent/écrivent l'état.
 *
 * ARCHITECTURE : une seule Mutex parking_lot sur toute la table. Chaque
 * opération est une section critique courte et atomique ; aucune I/O réseau
 * n'est faite sous le verrou (les handles de worker sont clonés puis utilisés
 * hors verrou).
 *
 * INVARIANTS :
 * - au plus une fiche par serial, ajout idempotent
 * - au plus un worker lié par serial, une seconde liaison est refusée
 * - suppression = disparition atomique de toute la fiche
 * - une écriture sur un serial absent ne recrée jamais de fiche
 */

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RegistryConf;
use crate::models::{Device, EventKind, Sample, SessionStatus};
use crate::worker::WorkerHandle;

/// Erreurs des opérations du registre
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Device not registered: {0}")]
    NotFound(String),
    #[error("Test already running on {0}")]
    AlreadyBound(String),
}

/// Fiche d'un appareil promu dans le registre
#[derive(Debug)]
pub struct RunningDevice {
    pub device: Device,
    pub status: SessionStatus,
    pub log: VecDeque<String>,
    pub samples: VecDeque<Sample>,
    pub worker: Option<WorkerHandle>,
    /// Horodatage du dernier démarrage de test
    pub started_at: Option<OffsetDateTime>,
}

/// Vue figée d'une fiche, sérialisable pour la couche présentation
#[derive(Debug, Clone, Serialize)]
pub struct RunningDeviceSnapshot {
    pub device: Device,
    pub status: SessionStatus,
    pub log: Vec<String>,
    pub samples: Vec<Sample>,
    pub running_test: bool,
    pub started_at: Option<OffsetDateTime>,
}

impl RunningDevice {
    fn new(device: Device) -> Self {
        Self {
            device,
            status: SessionStatus::Idle,
            log: VecDeque::new(),
            samples: VecDeque::new(),
            worker: None,
            started_at: None,
        }
    }

    fn snapshot(&self) -> RunningDeviceSnapshot {
        RunningDeviceSnapshot {
            device: self.device.clone(),
            status: self.status,
            log: self.log.iter().cloned().collect(),
            samples: self.samples.iter().copied().collect(),
            running_test: self.worker.is_some(),
            started_at: self.started_at,
        }
    }
}

#[derive(Debug, Default)]
struct Table {
    records: HashMap<String, RunningDevice>,
    /// Ordre de promotion, pour l'affichage
    order: Vec<String>,
}

fn push_capped<T>(buf: &mut VecDeque<T>, item: T, cap: Option<usize>) {
    if let Some(cap) = cap {
        if cap == 0 {
            return;
        }
        while buf.len() >= cap {
            buf.pop_front();
        }
    }
    buf.push_back(item);
}

pub struct DeviceRegistry {
    table: Mutex<Table>,
    limits: RegistryConf,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(RegistryConf::default())
    }
}

impl DeviceRegistry {
    pub fn new(limits: RegistryConf) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            limits,
        }
    }

    /// Ajout idempotent : renvoie false si le serial était déjà présent
    pub fn add_running_device(&self, device: Device) -> bool {
        let mut table = self.table.lock();
        if table.records.contains_key(&device.serial) {
            return false;
        }

        let serial = device.serial.clone();
        table.order.push(serial.clone());
        table.records.insert(serial.clone(), RunningDevice::new(device));
        info!(%serial, "device added to registry");
        true
    }

    /// Supprime toute la fiche d'un coup. Le worker éventuellement lié est
    /// renvoyé à l'appelant, qui décide de l'arrêter.
    pub fn remove_running_device(&self, serial: &str) -> Option<RunningDevice> {
        let mut table = self.table.lock();
        let removed = table.records.remove(serial)?;
        table.order.retain(|s| s != serial);
        info!(%serial, "device removed from registry");
        Some(removed)
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.table.lock().records.contains_key(serial)
    }

    pub fn len(&self) -> usize {
        self.table.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device(&self, serial: &str) -> Option<Device> {
        self.table.lock().records.get(serial).map(|r| r.device.clone())
    }

    /// Appareils dans l'ordre de promotion
    pub fn running_devices(&self) -> Vec<Device> {
        let table = self.table.lock();
        table
            .order
            .iter()
            .filter_map(|serial| table.records.get(serial))
            .map(|r| r.device.clone())
            .collect()
    }

    pub fn snapshot(&self, serial: &str) -> Option<RunningDeviceSnapshot> {
        self.table.lock().records.get(serial).map(RunningDevice::snapshot)
    }

    pub fn bind_worker(&self, serial: &str, worker: WorkerHandle) -> Result<(), RegistryError> {
        let mut table = self.table.lock();
        let record = table
            .records
            .get_mut(serial)
            .ok_or_else(|| RegistryError::NotFound(serial.to_string()))?;

        if record.worker.is_some() {
            return Err(RegistryError::AlreadyBound(serial.to_string()));
        }

        debug!(%serial, worker_id = %worker.id(), "worker bound");
        record.worker = Some(worker);
        record.started_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    pub fn unbind_worker(&self, serial: &str) -> Option<WorkerHandle> {
        let mut table = self.table.lock();
        table.records.get_mut(serial)?.worker.take()
    }

    /// Délie seulement si le worker lié est bien `worker_id`
    pub fn unbind_worker_if(&self, serial: &str, worker_id: Uuid) -> bool {
        let mut table = self.table.lock();
        match table.records.get_mut(serial) {
            Some(record) if record.worker.as_ref().map(WorkerHandle::id) == Some(worker_id) => {
                record.worker = None;
                debug!(%serial, %worker_id, "worker unbound");
                true
            }
            _ => false,
        }
    }

    pub fn bound_worker(&self, serial: &str) -> Option<WorkerHandle> {
        self.table.lock().records.get(serial)?.worker.clone()
    }

    pub fn is_bound_to(&self, serial: &str, worker_id: Uuid) -> bool {
        self.table
            .lock()
            .records
            .get(serial)
            .and_then(|r| r.worker.as_ref())
            .map(WorkerHandle::id)
            == Some(worker_id)
    }

    pub fn is_running_test(&self, serial: &str) -> bool {
        self.table
            .lock()
            .records
            .get(serial)
            .is_some_and(|r| r.worker.is_some())
    }

    pub fn append_log(&self, serial: &str, line: impl Into<String>) {
        let cap = self.limits.max_log_lines;
        if let Some(record) = self.table.lock().records.get_mut(serial) {
            push_capped(&mut record.log, line.into(), cap);
        }
    }

    pub fn get_log(&self, serial: &str) -> Vec<String> {
        self.table
            .lock()
            .records
            .get(serial)
            .map(|r| r.log.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn append_sample(&self, serial: &str, sample: Sample) {
        let cap = self.limits.max_samples;
        if let Some(record) = self.table.lock().records.get_mut(serial) {
            push_capped(&mut record.samples, sample, cap);
        }
    }

    pub fn get_samples(&self, serial: &str) -> Vec<Sample> {
        self.table
            .lock()
            .records
            .get(serial)
            .map(|r| r.samples.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn clear_samples(&self, serial: &str) {
        if let Some(record) = self.table.lock().records.get_mut(serial) {
            record.samples.clear();
        }
    }

    pub fn set_status(&self, serial: &str, status: SessionStatus) {
        if let Some(record) = self.table.lock().records.get_mut(serial) {
            record.status = status;
        }
    }

    /// Met à jour le statut seulement si `pred` accepte le statut courant
    pub fn set_status_if(&self, serial: &str, status: SessionStatus, pred: impl FnOnce(SessionStatus) -> bool) -> bool {
        match self.table.lock().records.get_mut(serial) {
            Some(record) if pred(record.status) => {
                record.status = status;
                true
            }
            _ => false,
        }
    }

    /// Met à jour le statut seulement si `worker_id` est encore lié
    pub fn set_status_if_bound(&self, serial: &str, worker_id: Uuid, status: SessionStatus) -> bool {
        match self.table.lock().records.get_mut(serial) {
            Some(record) if record.worker.as_ref().map(WorkerHandle::id) == Some(worker_id) => {
                record.status = status;
                true
            }
            _ => false,
        }
    }

    /// Ouvre une session en une seule transaction : liaison du worker,
    /// samples vidés, ligne de journal, statut Testing.
    pub fn begin_session(&self, serial: &str, worker: WorkerHandle, line: impl Into<String>) -> Result<(), RegistryError> {
        let cap = self.limits.max_log_lines;
        let mut table = self.table.lock();
        let record = table
            .records
            .get_mut(serial)
            .ok_or_else(|| RegistryError::NotFound(serial.to_string()))?;

        if record.worker.is_some() {
            return Err(RegistryError::AlreadyBound(serial.to_string()));
        }

        debug!(%serial, worker_id = %worker.id(), "worker bound");
        record.worker = Some(worker);
        record.started_at = Some(OffsetDateTime::now_utc());
        record.samples.clear();
        push_capped(&mut record.log, line.into(), cap);
        record.status = SessionStatus::Testing;
        Ok(())
    }

    /// Échec de démarrage : délie `worker_id` s'il est lié, puis journal et
    /// statut Error. Sans effet si une autre session occupe le serial.
    pub fn record_start_failure(&self, serial: &str, worker_id: Option<Uuid>, line: impl Into<String>) -> bool {
        let cap = self.limits.max_log_lines;
        let mut table = self.table.lock();
        let Some(record) = table.records.get_mut(serial) else {
            return false;
        };

        match record.worker.as_ref().map(WorkerHandle::id) {
            None => {}
            Some(bound) if Some(bound) == worker_id => record.worker = None,
            Some(_) => return false,
        }
        push_capped(&mut record.log, line.into(), cap);
        record.status = SessionStatus::Error;
        true
    }

    /// Applique un événement de worker sous un seul verrou. Renvoie false,
    /// sans rien écrire, si `worker_id` n'est pas le worker lié au serial.
    pub fn apply_worker_event(&self, serial: &str, worker_id: Uuid, kind: &EventKind) -> bool {
        let limits = &self.limits;
        let mut table = self.table.lock();
        let Some(record) = table.records.get_mut(serial) else {
            return false;
        };
        if record.worker.as_ref().map(WorkerHandle::id) != Some(worker_id) {
            return false;
        }

        match kind {
            EventKind::Status(message) => {
                push_capped(&mut record.log, message.clone(), limits.max_log_lines);
                if record.status != SessionStatus::Stopping {
                    record.status = SessionStatus::Testing;
                }
            }
            EventKind::Sample(sample) => push_capped(&mut record.samples, *sample, limits.max_samples),
            EventKind::Saved(_) => {}
            EventKind::Finished => {
                push_capped(&mut record.log, "Test Finished".to_string(), limits.max_log_lines);
                record.worker = None;
                record.status = SessionStatus::Completed;
            }
        }
        true
    }

    pub fn get_status(&self, serial: &str) -> SessionStatus {
        self.table
            .lock()
            .records
            .get(serial)
            .map(|r| r.status)
            .unwrap_or(SessionStatus::Unknown)
    }
}

pub type SharedRegistry = Arc<DeviceRegistry>;
