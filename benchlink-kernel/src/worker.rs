/**
 * DEVICE WORKER - Session de test sur un appareil, dans sa propre tâche tokio
 *
 * RÔLE : envoie TEST;CMD=START, écoute les trames de l'appareil, transforme
 * les STATUS complets en samples et publie tout sur le canal d'événements.
 *
 * CYCLE DE VIE :
 *   Idle -> Running -> Completed            (STATE=IDLE reçu)
 *   Idle -> Running -> Stopping -> Completed (stop() demandé)
 *
 * ANNULATION : coopérative. stop() baisse un drapeau que la boucle ne voit
 * qu'au prochain datagramme ou au prochain timeout de réception : la latence
 * d'arrêt est bornée par `recv_timeout`, jamais préemptive.
 *
 * Le worker ne connaît pas le registre : il n'émet que des DeviceEvent.
 * Le dernier événement d'une session est toujours Finished.
 */

use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkerConf;
use crate::models::{Device, DeviceEvent, EventKind, Sample};
use crate::protocol::{decode_latin1, is_idle, parse_status, Command};

/// Paramètres d'un test tels qu'envoyés dans TEST;CMD=START
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TestParams {
    pub duration_s: u32,
    pub rate_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Idle,
    Running,
    Stopping,
    Completed,
}

/// État partagé entre la tâche du worker et ses handles
#[derive(Debug)]
struct WorkerShared {
    id: Uuid,
    device: Device,
    conf: WorkerConf,
    running: AtomicBool,
    state: Mutex<WorkerState>,
    /// Signalé par stop() une fois la réponse au STOP reçue ou abandonnée
    stop_done: Notify,
    events: UnboundedSender<DeviceEvent>,
}

impl WorkerShared {
    fn emit(&self, kind: EventKind) {
        let event = DeviceEvent {
            serial: self.device.serial.clone(),
            worker_id: self.id,
            kind,
        };
        if self.events.send(event).is_err() {
            debug!(serial = %self.device.serial, "event channel closed, dropping event");
        }
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }
}

/// Handle clonable d'un worker : c'est ce que le registre stocke
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn device(&self) -> &Device {
        &self.shared.device
    }

    pub fn serial(&self) -> &str {
        &self.shared.device.serial
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Demande d'arrêt : drapeau baissé puis TEST;CMD=STOP envoyé depuis une
    /// socket neuve, avec une seule attente de réponse. Ne produit jamais
    /// Finished : c'est la boucle de réception qui le fera à sa sortie,
    /// après la réponse au STOP.
    pub async fn stop(&self) -> io::Result<()> {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            if *state == WorkerState::Running {
                *state = WorkerState::Stopping;
            }
        }
        shared.running.store(false, Ordering::SeqCst);

        let result = self.exchange_stop().await;
        shared.stop_done.notify_one();
        result
    }

    async fn exchange_stop(&self) -> io::Result<()> {
        let shared = &self.shared;
        let device_addr = shared.device.addr();
        let socket = UdpSocket::bind(SocketAddr::new(shared.conf.bind_addr, 0)).await?;
        socket.send_to(&Command::Stop.encode(), device_addr).await?;
        info!(serial = %shared.device.serial, "stop command sent");

        let mut buf = vec![0u8; shared.conf.buffer_size];
        match timeout(shared.conf.recv_timeout(), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) if from.ip() == device_addr.ip() => {
                let message = decode_latin1(&buf[..len]);
                info!(serial = %shared.device.serial, response = %message, "stop response");
                shared.emit(EventKind::Status(message));
            }
            Ok(Ok((_, from))) => {
                debug!(serial = %shared.device.serial, %from, "ignoring stop reply from foreign address");
            }
            Ok(Err(e)) => {
                warn!(serial = %shared.device.serial, error = %e, "error waiting for stop response");
            }
            Err(_) => {
                warn!(serial = %shared.device.serial, "No response received for STOP command");
            }
        }

        Ok(())
    }
}

/// Worker prêt à démarrer : sa socket de commande est déjà liée
pub struct Worker {
    handle: WorkerHandle,
    socket: UdpSocket,
    params: TestParams,
    collected: Vec<Sample>,
}

impl Worker {
    /// Lie la socket de commande. Un échec ici est remonté à l'appelant
    /// avant toute modification d'état.
    pub async fn bind(
        device: Device,
        params: TestParams,
        conf: WorkerConf,
        events: UnboundedSender<DeviceEvent>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(conf.bind_addr, 0)).await?;
        let shared = WorkerShared {
            id: Uuid::new_v4(),
            device,
            conf,
            running: AtomicBool::new(false),
            state: Mutex::new(WorkerState::Idle),
            stop_done: Notify::new(),
            events,
        };

        Ok(Self {
            handle: WorkerHandle { shared: Arc::new(shared) },
            socket,
            params,
            collected: Vec::new(),
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Passe en Running, envoie START puis lance la boucle de réception
    /// dans une nouvelle tâche.
    pub async fn start(self) -> io::Result<JoinHandle<()>> {
        let shared = Arc::clone(&self.handle.shared);
        shared.set_state(WorkerState::Running);
        shared.running.store(true, Ordering::SeqCst);

        let command = Command::Start {
            duration_s: self.params.duration_s,
            rate_ms: self.params.rate_ms,
        };
        if let Err(e) = self.socket.send_to(&command.encode(), shared.device.addr()).await {
            shared.running.store(false, Ordering::SeqCst);
            shared.set_state(WorkerState::Completed);
            return Err(e);
        }

        info!(
            serial = %shared.device.serial,
            duration_s = self.params.duration_s,
            rate_ms = self.params.rate_ms,
            "test started"
        );

        Ok(tokio::spawn(self.run()))
    }

    async fn run(mut self) {
        let shared = Arc::clone(&self.handle.shared);
        let recv_timeout = shared.conf.recv_timeout();
        let mut buf = vec![0u8; shared.conf.buffer_size];

        let mut idle = false;
        while shared.running.load(Ordering::SeqCst) {
            let (len, from) = match timeout(recv_timeout, self.socket.recv_from(&mut buf)).await {
                // timeout = point d'observation du drapeau d'arrêt
                Err(_) => continue,
                Ok(Err(e)) => {
                    warn!(serial = %shared.device.serial, error = %e, "receive error");
                    tokio::time::sleep(recv_timeout.min(Duration::from_millis(100))).await;
                    continue;
                }
                Ok(Ok(received)) => received,
            };

            if from.ip() != shared.device.ip {
                debug!(serial = %shared.device.serial, %from, "ignoring datagram from foreign address");
                continue;
            }

            let message = decode_latin1(&buf[..len]);
            if self.process(&message) {
                debug!(serial = %shared.device.serial, "device reported idle");
                idle = true;
                break;
            }
        }

        // arrêt demandé : la réponse au STOP passe avant Finished
        if !idle && timeout(recv_timeout * 2, shared.stop_done.notified()).await.is_err() {
            debug!(serial = %shared.device.serial, "stop exchange still pending at session end");
        }

        shared.running.store(false, Ordering::SeqCst);
        let samples = std::mem::take(&mut self.collected);
        let count = samples.len();
        shared.emit(EventKind::Saved(samples));
        shared.set_state(WorkerState::Completed);
        shared.emit(EventKind::Finished);
        info!(serial = %shared.device.serial, samples = count, "test finished");
    }

    /// Traite une trame acceptée ; renvoie true si elle termine la session
    fn process(&mut self, message: &str) -> bool {
        let shared = &self.handle.shared;
        shared.emit(EventKind::Status(message.to_string()));

        if let Some(sample) = parse_status(message).and_then(|record| record.sample()) {
            self.collected.push(sample);
            shared.emit(EventKind::Sample(sample));
        }

        is_idle(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn test_conf() -> WorkerConf {
        WorkerConf {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            recv_timeout_ms: 200,
            ..WorkerConf::default()
        }
    }

    async fn fake_device() -> (UdpSocket, Device) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let device = Device::new(addr.ip(), addr.port(), "M001", "SN1");
        (socket, device)
    }

    async fn next_event(rx: &mut UnboundedReceiver<DeviceEvent>) -> EventKind {
        timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out waiting for worker event")
            .expect("event channel closed")
            .kind
    }

    async fn expect_command(device: &UdpSocket) -> (String, SocketAddr) {
        let mut buf = [0u8; 128];
        let (len, from) = timeout(Duration::from_secs(3), device.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        (decode_latin1(&buf[..len]), from)
    }

    #[tokio::test]
    async fn test_session_until_idle() {
        let (device_sock, device) = fake_device().await;
        let (tx, mut rx) = unbounded_channel();
        let params = TestParams { duration_s: 5, rate_ms: 100 };

        let worker = Worker::bind(device, params, test_conf(), tx).await.unwrap();
        let handle = worker.handle();
        let task = worker.start().await.unwrap();
        assert_eq!(handle.state(), WorkerState::Running);

        let (command, worker_addr) = expect_command(&device_sock).await;
        assert_eq!(command, "TEST;CMD=START;DURATION=5;RATE=100;");

        for frame in [
            "TEST;RESULT=STARTED;",
            "STATUS;TIME=200;MV=250.5;MA=10.2;STATE=RUNNING;",
            "STATUS;TIME=100;MV=250.5;STATE=RUNNING;",
            "STATUS;TIME=100;MV=249.0;MA=10.0;STATE=RUNNING;",
            "STATUS;STATE=IDLE;",
            "STATUS;TIME=300;MV=1;MA=1;",
        ] {
            device_sock.send_to(frame.as_bytes(), worker_addr).await.unwrap();
        }

        let mut statuses = Vec::new();
        let mut samples = Vec::new();
        let saved = loop {
            match next_event(&mut rx).await {
                EventKind::Status(s) => statuses.push(s),
                EventKind::Sample(s) => samples.push(s),
                EventKind::Saved(all) => break all,
                EventKind::Finished => panic!("finished before saved"),
            }
        };
        assert_eq!(next_event(&mut rx).await, EventKind::Finished);
        task.await.unwrap();

        // la trame après IDLE n'est jamais lue
        assert_eq!(statuses.len(), 5);
        assert_eq!(statuses[2], "STATUS;TIME=100;MV=250.5;STATE=RUNNING;");
        // ordre d'arrivée, pas ordre des TIME
        assert_eq!(samples, vec![Sample::new(200, 250.5, 10.2), Sample::new(100, 249.0, 10.0)]);
        assert_eq!(saved, samples);
        assert_eq!(handle.state(), WorkerState::Completed);
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_foreign_datagrams_ignored() {
        let (device_sock, device) = fake_device().await;
        let Ok(intruder) = UdpSocket::bind("127.0.0.2:0").await else {
            return;
        };
        let (tx, mut rx) = unbounded_channel();
        let params = TestParams { duration_s: 1, rate_ms: 100 };

        let worker = Worker::bind(device, params, test_conf(), tx).await.unwrap();
        worker.start().await.unwrap();
        let (_, worker_addr) = expect_command(&device_sock).await;

        intruder
            .send_to(b"STATUS;TIME=1;MV=1;MA=1;STATE=IDLE;", worker_addr)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        device_sock.send_to(b"STATUS;STATE=IDLE;", worker_addr).await.unwrap();

        assert_eq!(next_event(&mut rx).await, EventKind::Status("STATUS;STATE=IDLE;".into()));
        assert_eq!(next_event(&mut rx).await, EventKind::Saved(vec![]));
        assert_eq!(next_event(&mut rx).await, EventKind::Finished);
    }

    #[tokio::test]
    async fn test_stop_latency_is_bounded() {
        let (device_sock, device) = fake_device().await;
        let (tx, mut rx) = unbounded_channel();
        let params = TestParams { duration_s: 60, rate_ms: 1000 };
        let conf = test_conf();

        let worker = Worker::bind(device, params, conf.clone(), tx).await.unwrap();
        let handle = worker.handle();
        let task = worker.start().await.unwrap();
        expect_command(&device_sock).await;

        let responder = tokio::spawn(async move {
            let (command, from) = expect_command(&device_sock).await;
            assert_eq!(command, "TEST;CMD=STOP;");
            device_sock.send_to(b"TEST;RESULT=STOPPED;", from).await.unwrap();
        });

        let requested = Instant::now();
        handle.stop().await.unwrap();
        assert!(matches!(handle.state(), WorkerState::Stopping | WorkerState::Completed));
        responder.await.unwrap();

        let mut kinds = Vec::new();
        loop {
            let kind = next_event(&mut rx).await;
            let done = kind == EventKind::Finished;
            kinds.push(kind);
            if done {
                break;
            }
        }
        task.await.unwrap();

        assert!(requested.elapsed() < conf.recv_timeout() * 3);
        assert!(kinds.contains(&EventKind::Status("TEST;RESULT=STOPPED;".into())));
        assert!(kinds.contains(&EventKind::Saved(vec![])));
        assert_eq!(handle.state(), WorkerState::Completed);
    }

    #[tokio::test]
    async fn test_stop_without_reply_is_not_an_error() {
        let (_device_sock, device) = fake_device().await;
        let (tx, mut rx) = unbounded_channel();
        let params = TestParams { duration_s: 60, rate_ms: 1000 };

        let worker = Worker::bind(device, params, test_conf(), tx).await.unwrap();
        let handle = worker.handle();
        worker.start().await.unwrap();

        handle.stop().await.unwrap();
        assert_eq!(next_event(&mut rx).await, EventKind::Saved(vec![]));
        assert_eq!(next_event(&mut rx).await, EventKind::Finished);
    }

    #[tokio::test]
    async fn test_late_stop_reply_precedes_finished() {
        let (device_sock, device) = fake_device().await;
        let (tx, mut rx) = unbounded_channel();
        let params = TestParams { duration_s: 60, rate_ms: 1000 };

        let worker = Worker::bind(device, params, test_conf(), tx).await.unwrap();
        let handle = worker.handle();
        worker.start().await.unwrap();
        expect_command(&device_sock).await;

        // réponse tardive, juste sous le timeout de réception
        let responder = tokio::spawn(async move {
            let (_, from) = expect_command(&device_sock).await;
            tokio::time::sleep(Duration::from_millis(170)).await;
            device_sock.send_to(b"TEST;RESULT=STOPPED;", from).await.unwrap();
        });

        handle.stop().await.unwrap();
        responder.await.unwrap();

        assert_eq!(next_event(&mut rx).await, EventKind::Status("TEST;RESULT=STOPPED;".into()));
        assert_eq!(next_event(&mut rx).await, EventKind::Saved(vec![]));
        assert_eq!(next_event(&mut rx).await, EventKind::Finished);
    }
}
