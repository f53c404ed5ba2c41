/*!
Appareil UDP factice pour tests sans instrument

Écoute sur 127.0.0.1, enregistre toutes les commandes reçues, mémorise le
dernier émetteur et peut répondre automatiquement à un préfixe de commande.
Les trames de télémétrie sont envoyées à la main depuis le test, ce qui permet
de rejouer des séquences précises (désordre, trames partielles, intrus...).
*/

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct ReceivedCommand {
    pub text: String,
    pub from: SocketAddr,
}

#[derive(Default)]
struct StubState {
    received: Vec<ReceivedCommand>,
    peer: Option<SocketAddr>,
    replies: Vec<(String, Vec<String>)>,
}

/// Appareil stub : enregistre les commandes, répond sur demande
pub struct StubDevice {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    state: Arc<Mutex<StubState>>,
    task: JoinHandle<()>,
}

impl StubDevice {
    pub async fn bind() -> Result<Self> {
        Self::bind_on("127.0.0.1:0").await
    }

    pub async fn bind_on(addr: &str) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let addr = socket.local_addr()?;
        let state = Arc::new(Mutex::new(StubState::default()));

        let task = tokio::spawn(receive_loop(socket.clone(), state.clone()));
        log::info!("📡 [STUB] device listening on {}", addr);

        Ok(Self { socket, addr, state, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Réponses automatiques envoyées à l'émetteur de toute commande
    /// commençant par `prefix`
    pub fn respond_with<I, S>(&self, prefix: &str, frames: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let frames = frames.into_iter().map(Into::into).collect();
        self.state.lock().unwrap().replies.push((prefix.to_string(), frames));
    }

    /// Toutes les commandes reçues (pour assertions de tests)
    pub fn received(&self) -> Vec<ReceivedCommand> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn received_texts(&self) -> Vec<String> {
        self.received().into_iter().map(|c| c.text).collect()
    }

    /// Dernier émetteur connu (comme le firmware : un seul abonné)
    pub fn peer(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().peer
    }

    /// Attend une commande commençant par `prefix` et renvoie son émetteur
    pub async fn wait_for_command(&self, prefix: &str, timeout_ms: u64) -> Result<SocketAddr> {
        let start = std::time::Instant::now();

        while start.elapsed() < Duration::from_millis(timeout_ms) {
            let found = self
                .state
                .lock()
                .unwrap()
                .received
                .iter()
                .find(|c| c.text.starts_with(prefix))
                .map(|c| c.from);
            if let Some(from) = found {
                return Ok(from);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        anyhow::bail!("Timeout waiting for command starting with {:?}", prefix);
    }

    /// Envoie une trame au dernier émetteur
    pub async fn send(&self, frame: &str) -> Result<()> {
        let peer = self
            .peer()
            .ok_or_else(|| anyhow::anyhow!("No peer has contacted the stub yet"))?;
        self.send_to(frame, peer).await
    }

    pub async fn send_to(&self, frame: &str, to: SocketAddr) -> Result<()> {
        self.socket.send_to(frame.as_bytes(), to).await?;
        log::debug!("📤 [STUB] {} -> {}", frame, to);
        Ok(())
    }

    pub async fn send_all(&self, frames: &[&str]) -> Result<()> {
        for frame in frames {
            self.send(frame).await?;
        }
        Ok(())
    }
}

impl Drop for StubDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, state: Arc<Mutex<StubState>>) {
    let mut buf = [0u8; 1024];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                log::warn!("⚠️ [STUB] receive error: {}", e);
                continue;
            }
        };
        let text: String = buf[..len].iter().map(|&b| b as char).collect();
        log::debug!("📨 [STUB] {} <- {}", text, from);

        let replies = {
            let mut state = state.lock().unwrap();
            state.peer = Some(from);
            state.received.push(ReceivedCommand { text: text.clone(), from });
            state
                .replies
                .iter()
                .filter(|(prefix, _)| text.starts_with(prefix.as_str()))
                .flat_map(|(_, frames)| frames.clone())
                .collect::<Vec<_>>()
        };

        for frame in replies {
            if let Err(e) = socket.send_to(frame.as_bytes(), from).await {
                log::warn!("⚠️ [STUB] reply to {} failed: {}", from, e);
            }
        }
    }
}
