/*!
Simulateur d'instrument UDP (comportement du firmware de référence)

- `ID;` -> `ID;MODEL=<m>;SERIAL=<s>;`
- `TEST;CMD=START;DURATION=<s>;RATE=<ms>;` -> `TEST;RESULT=STARTED;` puis une
  trame `STATUS;TIME=..;MV=..;MA=..;` toutes les RATE ms et enfin
  `STATUS;STATE=IDLE;` quand DURATION est écoulée
- `TEST;CMD=STOP;` -> `TEST;RESULT=STOPPED;`
- tout le reste -> `ERR;REASON=...;` ou `TEST;RESULT=ERROR;MSG=...;`

Comme le firmware, le simulateur n'a qu'un abonné : le dernier émetteur.
Le groupe multicast est optionnel ; par défaut seul le port unicast existe.
*/

use anyhow::Result;
use std::future::pending;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub model: String,
    pub serial: String,
    pub initial_mv: f64,
    pub initial_ma: f64,
    /// Pas de variation pseudo-aléatoire de MV/MA
    pub deterministic: bool,
    pub listen: SocketAddr,
    /// Groupe multicast à rejoindre pour les requêtes ID
    pub multicast: Option<(Ipv4Addr, u16)>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            model: "M001".to_string(),
            serial: "SN0123456".to_string(),
            initial_mv: 4500.0,
            initial_ma: 100.0,
            deterministic: false,
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            multicast: None,
        }
    }
}

impl SimConfig {
    pub fn with_identity(model: &str, serial: &str) -> Self {
        Self {
            model: model.to_string(),
            serial: serial.to_string(),
            deterministic: true,
            ..Self::default()
        }
    }
}

/// Commandes acceptées selon la socket de réception
#[derive(Debug, Clone, Copy, PartialEq)]
enum Accept {
    IdOnly,
    All,
}

#[derive(Debug)]
struct TestRun {
    t0: Instant,
    duration: Duration,
    rate: Duration,
    next_update: Instant,
    mv: f64,
    ma: f64,
}

struct Simulator {
    config: SimConfig,
    socket: UdpSocket,
    subscriber: Option<SocketAddr>,
    test: Option<TestRun>,
}

/// Simulateur lancé dans une tâche tokio, arrêté au drop
pub struct SimDevice {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl SimDevice {
    pub async fn spawn(config: SimConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.listen).await?;
        let addr = socket.local_addr()?;

        let mcast = match config.multicast {
            Some((group, port)) => {
                let mcast = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
                mcast.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
                Some(mcast)
            }
            None => None,
        };

        log::info!("🔌 [SIM] device {}:{} listening on {}", config.model, config.serial, addr);

        let sim = Simulator {
            config,
            socket,
            subscriber: None,
            test: None,
        };
        let task = tokio::spawn(sim.run(mcast));
        Ok(Self { addr, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn recv_opt(socket: Option<&UdpSocket>, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => pending().await,
    }
}

impl Simulator {
    async fn run(mut self, mcast: Option<UdpSocket>) {
        let mut buf = [0u8; 512];
        let mut mbuf = [0u8; 512];

        loop {
            let deadline = self.test.as_ref().map(|t| t.next_update.min(t.t0 + t.duration));

            tokio::select! {
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok((n, from)) => {
                        let msg = latin1(&buf[..n]);
                        self.handle_message(&msg, from, Accept::All).await;
                    }
                    Err(e) => log::warn!("⚠️ [SIM] RX error: {}", e),
                },
                r = recv_opt(mcast.as_ref(), &mut mbuf) => match r {
                    Ok((n, from)) => {
                        let msg = latin1(&mbuf[..n]);
                        self.handle_message(&msg, from, Accept::IdOnly).await;
                    }
                    Err(e) => log::warn!("⚠️ [SIM] multicast RX error: {}", e),
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.tick().await;
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: &str, from: SocketAddr, accept: Accept) {
        log::debug!("📨 [SIM] {} <- {}", msg, from);
        self.subscriber = Some(from);

        let reply = self.reply_for(msg, accept);
        if let Err(e) = self.socket.send_to(reply.as_bytes(), from).await {
            log::warn!("⚠️ [SIM] reply to {} failed: {}", from, e);
        }
    }

    fn reply_for(&mut self, msg: &str, accept: Accept) -> String {
        let mut tokens = msg.split(';').filter(|t| !t.is_empty());
        let command = tokens.next().unwrap_or_default();
        let args: Vec<(&str, &str)> = tokens.filter_map(|t| t.split_once('=')).collect();

        match (command, accept) {
            ("ID", _) if args.is_empty() => {
                format!("ID;MODEL={};SERIAL={};", self.config.model, self.config.serial)
            }
            ("ID", _) => "ERR;REASON=Unexpected argument to ID;".to_string(),
            ("TEST", Accept::All) => self.handle_test(&args),
            _ => "ERR;REASON=Bad message format;".to_string(),
        }
    }

    fn handle_test(&mut self, args: &[(&str, &str)]) -> String {
        let Some(&(key, subcmd)) = args.first() else {
            return "ERR;REASON=Missing CMD argument to TEST;".to_string();
        };
        if key != "CMD" {
            return "ERR;REASON=Expected first argument to be CMD;".to_string();
        }

        match subcmd {
            "START" => self.handle_start(args),
            "STOP" => {
                if self.test.take().is_some() {
                    log::info!("🛑 [SIM] TEST STOPPED by user request");
                    "TEST;RESULT=STOPPED;".to_string()
                } else {
                    "TEST;RESULT=ERROR;MSG=No test was running;".to_string()
                }
            }
            _ => "ERR;REASON=Unknown CMD expected START or STOP;".to_string(),
        }
    }

    fn handle_start(&mut self, args: &[(&str, &str)]) -> String {
        if args.len() != 3 {
            return "TEST;RESULT=ERROR;MSG=\"CMD=START\" expects DURATION and RATE;".to_string();
        }

        let mut duration_s = 0.0_f64;
        let mut rate_ms = 0.0_f64;
        for &(key, value) in &args[1..] {
            match key {
                "DURATION" => match value.parse() {
                    Ok(v) => duration_s = v,
                    Err(_) => return "TEST;RESULT=ERROR;MSG=Could not parse DURATION;".to_string(),
                },
                "RATE" => match value.parse() {
                    Ok(v) => rate_ms = v,
                    Err(_) => return "TEST;RESULT=ERROR;MSG=Could not parse RATE;".to_string(),
                },
                _ => {}
            }
        }

        if duration_s <= 0.0 || rate_ms <= 0.0 {
            return "TEST;RESULT=ERROR;MSG=Expected duration>0 and rate>0;".to_string();
        }
        if self.test.is_some() {
            return "TEST;RESULT=ERROR;MSG=Already running;".to_string();
        }

        let now = Instant::now();
        let rate = Duration::from_secs_f64(rate_ms / 1000.0);
        self.test = Some(TestRun {
            t0: now,
            duration: Duration::from_secs_f64(duration_s),
            rate,
            next_update: now + rate,
            mv: self.config.initial_mv,
            ma: self.config.initial_ma,
        });
        log::info!("▶️ [SIM] TEST STARTED duration_s={} rate_ms={}", duration_s, rate_ms);
        "TEST;RESULT=STARTED;".to_string()
    }

    /// Émission périodique STATUS puis IDLE en fin de durée
    async fn tick(&mut self) {
        let deterministic = self.config.deterministic;
        let Some(test) = self.test.as_mut() else {
            return;
        };

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(test.t0);
        let mut frames = Vec::new();

        if now >= test.next_update {
            if !deterministic {
                let subsecond = f64::from(elapsed.subsec_micros()) / 1e6;
                test.mv += 56.789 * (subsecond - 0.5);
                test.ma += 123.45 * (subsecond - 0.5);
            }
            frames.push(format!(
                "STATUS;TIME={:.0};MV={:.1};MA={:.1};",
                elapsed.as_secs_f64() * 1000.0,
                test.mv,
                test.ma
            ));
            test.next_update += test.rate;
        }

        let finished = elapsed >= test.duration;
        if finished {
            frames.push("STATUS;STATE=IDLE;".to_string());
            self.test = None;
            log::info!("⏹️ [SIM] TEST STOPPED by duration timeout");
        }

        if let Some(subscriber) = self.subscriber {
            for frame in frames {
                if let Err(e) = self.socket.send_to(frame.as_bytes(), subscriber).await {
                    log::warn!("⚠️ [SIM] send to {} failed: {}", subscriber, e);
                }
            }
        }
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}
