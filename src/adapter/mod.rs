//! Plug-and-play Adapter
//!
//! Hosts one TCP session per remote device board and translates its wire
//! packets into device registry reads and writes. Sessions live in the
//! factory's table keyed by identifier; a session reaches back through the
//! factory by identifier (never by owning pointer), so the heartbeat removal
//! path drops the last reference cleanly.

pub mod protocol;
mod session;

use crate::config::AdapterConfig;
use crate::registry::DeviceRegistry;
use crate::scheduler::{SchedulerHandle, TimerId};
use crate::types::{DeviceId, Error, Result};
use dashmap::DashMap;
use session::SessionTask;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct SessionEntry {
    port: u16,
    devices: Vec<DeviceId>,
    heartbeat_id: TimerId,
    command_id: TimerId,
    task: JoinHandle<()>,
}

/// Registry of live adapter sessions.
pub struct AdapterFactory {
    registry: Arc<DeviceRegistry>,
    scheduler: SchedulerHandle,
    sessions: DashMap<String, SessionEntry>,
    removal_tx: mpsc::UnboundedSender<String>,
}

impl AdapterFactory {
    pub fn spawn(registry: Arc<DeviceRegistry>, scheduler: SchedulerHandle) -> Arc<Self> {
        let (removal_tx, mut removal_rx) = mpsc::unbounded_channel::<String>();
        let factory = Arc::new(Self {
            registry,
            scheduler,
            sessions: DashMap::new(),
            removal_tx,
        });

        // Session-initiated removals (heartbeat timeouts) come in by
        // identifier; a weak reference keeps the drain loop from pinning the
        // factory alive.
        let weak = Arc::downgrade(&factory);
        tokio::spawn(async move {
            while let Some(identifier) = removal_rx.recv().await {
                let Some(factory) = weak.upgrade() else { break };
                factory.remove(&identifier);
            }
        });

        factory
    }

    /// Create a session: bind its state port, register its devices, start its
    /// heartbeat. Returns the bound port (useful when configured as 0).
    pub async fn create(&self, cfg: &AdapterConfig) -> Result<u16> {
        if self.sessions.contains_key(&cfg.identifier) {
            return Err(Error::Config(format!("duplicate adapter identifier: {}", cfg.identifier)));
        }

        let listener = TcpListener::bind(("127.0.0.1", cfg.state_port)).await?;
        let port = listener.local_addr()?.port();

        let mut devices = Vec::new();
        let mut state_info = HashMap::new();
        for dev in &cfg.devices {
            let scoped = format!("{}:{}", cfg.identifier, dev.name);
            let id = DeviceId::new(dev.kind, scoped.clone());
            self.registry.register(id.clone(), &dev.state, &dev.command);
            for signal in &dev.state {
                state_info.insert((scoped.clone(), signal.clone()), id.clone());
            }
            devices.push(id);
        }

        let heartbeat_id = self.scheduler.allocate_timer("ppa-heartbeat");
        let command_id = self.scheduler.allocate_timer("ppa-command");
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let task = SessionTask {
            identifier: cfg.identifier.clone(),
            registry: Arc::clone(&self.registry),
            scheduler: self.scheduler.clone(),
            heartbeat_id,
            command_id,
            heartbeat: Duration::from_secs(cfg.heartbeat_secs),
            command_interval: Duration::from_secs(cfg.command_secs),
            timer_tx,
            timer_rx,
            listener,
            state_info,
            devices: devices.clone(),
            rx_buffer: Arc::new(Mutex::new(HashMap::new())),
            removals: self.removal_tx.clone(),
        };

        let handle = tokio::spawn(task.run());
        self.sessions.insert(
            cfg.identifier.clone(),
            SessionEntry { port, devices, heartbeat_id, command_id, task: handle },
        );
        info!(identifier = %cfg.identifier, port, "adapter session created");
        Ok(port)
    }

    /// Drop a session. The owned timers are cancelled and the task (with its
    /// listener socket) stopped before the registry entry goes away, so no
    /// resource outlives its session.
    pub fn remove(&self, identifier: &str) {
        {
            let Some(entry) = self.sessions.get(identifier) else {
                warn!(identifier, "removal of unknown adapter session");
                return;
            };
            self.scheduler.cancel(entry.heartbeat_id);
            self.scheduler.cancel(entry.command_id);
            entry.task.abort();
        }

        if let Some((_, entry)) = self.sessions.remove(identifier) {
            for device in &entry.devices {
                self.registry.unregister(device);
            }
            info!(identifier, "adapter session removed");
        }
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.sessions.contains_key(identifier)
    }

    pub fn port_of(&self, identifier: &str) -> Option<u16> {
        self.sessions.get(identifier).map(|e| e.port)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterDeviceConfig;
    use crate::types::DeviceKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::{sleep, timeout};

    fn test_config(identifier: &str, heartbeat_secs: u64) -> AdapterConfig {
        AdapterConfig {
            identifier: identifier.to_string(),
            state_port: 0,
            heartbeat_secs,
            command_secs: 1,
            devices: vec![AdapterDeviceConfig {
                name: "foo".to_string(),
                kind: DeviceKind::Load,
                state: vec!["voltage".to_string()],
                command: vec!["onOffSwitch".to_string()],
            }],
        }
    }

    /// Read until `tag` shows up, skipping interleaved command packets.
    async fn expect_reply(stream: &mut TcpStream, tag: &str) {
        let mut collected = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !collected.contains(tag) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no {tag:?} reply in {collected:?}"
            );
            let mut buf = vec![0u8; 256];
            let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .expect("reply timed out")
                .expect("read failed");
            assert!(n > 0, "connection closed while waiting for {tag:?}");
            collected.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn state_packet_reply_sequence() {
        let registry = Arc::new(DeviceRegistry::new());
        let scheduler = SchedulerHandle::spawn();
        let factory = AdapterFactory::spawn(Arc::clone(&registry), scheduler);

        let port = factory.create(&test_config("ident", 30)).await.unwrap();
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        // Unregistered device name.
        stream.write_all(b"DeviceStates\r\nbar voltage 12.3\r\n\r\n").await.unwrap();
        expect_reply(&mut stream, "UnknownDevice").await;

        // Registered device, accepted and flushed to the registry on the
        // next command tick.
        stream.write_all(b"DeviceStates\r\nfoo voltage 12.3\r\n\r\n").await.unwrap();
        expect_reply(&mut stream, "Received").await;

        let device = DeviceId::new(DeviceKind::Load, "ident:foo");
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(registry.get(&device, "voltage"), 12.3);

        // Duplicate signal within one packet.
        stream
            .write_all(b"DeviceStates\r\nfoo voltage 1\r\nfoo voltage 2\r\n\r\n")
            .await
            .unwrap();
        expect_reply(&mut stream, "DuplicateDevice").await;

        // Unknown header.
        stream.write_all(b"Gibberish\r\n\r\n").await.unwrap();
        expect_reply(&mut stream, "UnknownHeader").await;

        // Polite disconnect.
        stream.write_all(b"PoliteDisconnect\r\n\r\n").await.unwrap();
        expect_reply(&mut stream, "PoliteDisconnect: Accepted").await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identical_packets_leave_registry_identical() {
        let registry = Arc::new(DeviceRegistry::new());
        let scheduler = SchedulerHandle::spawn();
        let factory = AdapterFactory::spawn(Arc::clone(&registry), scheduler);

        let port = factory.create(&test_config("ident", 30)).await.unwrap();
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let device = DeviceId::new(DeviceKind::Load, "ident:foo");

        for _ in 0..2 {
            stream.write_all(b"DeviceStates\r\nfoo voltage 7.5\r\n\r\n").await.unwrap();
            expect_reply(&mut stream, "Received").await;
            sleep(Duration::from_millis(1500)).await;
            assert_eq!(registry.get(&device, "voltage"), 7.5);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn heartbeat_timeout_removes_session() {
        let registry = Arc::new(DeviceRegistry::new());
        let scheduler = SchedulerHandle::spawn();
        let factory = AdapterFactory::spawn(Arc::clone(&registry), scheduler);

        let port = factory.create(&test_config("ident", 1)).await.unwrap();
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"DeviceStates\r\nfoo voltage 1\r\n\r\n").await.unwrap();
        expect_reply(&mut stream, "Received").await;

        // Go silent past the heartbeat.
        sleep(Duration::from_millis(2500)).await;
        assert!(!factory.contains("ident"));
        assert!(!registry.contains(&DeviceId::new(DeviceKind::Load, "ident:foo")));

        // The listener is gone with the session.
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn command_tick_delivers_staged_writes() {
        let registry = Arc::new(DeviceRegistry::new());
        let scheduler = SchedulerHandle::spawn();
        let factory = AdapterFactory::spawn(Arc::clone(&registry), scheduler);

        let port = factory.create(&test_config("ident", 30)).await.unwrap();
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        // First valid state packet arms the command timer.
        stream.write_all(b"DeviceStates\r\nfoo voltage 1\r\n\r\n").await.unwrap();
        expect_reply(&mut stream, "Received").await;

        let device = DeviceId::new(DeviceKind::Load, "ident:foo");
        registry.set(&device, "onOffSwitch", 1.0);

        let mut collected = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !collected.contains("foo onOffSwitch 1\r\n") {
            assert!(tokio::time::Instant::now() < deadline, "no command packet in {collected:?}");
            let mut buf = vec![0u8; 256];
            let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .expect("command packet timed out")
                .expect("read failed");
            collected.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }
}
