//! Adapter Session
//!
//! One task per remote board. Owns the TCP listener for the board's state
//! port, a heartbeat timer and a command timer. Ingress packets stage signal
//! values into the rx buffer; each command tick flushes the rx buffer into
//! the device registry, then drains the registry's staged commands into an
//! egress packet. A heartbeat expiry with no packet in between asks the
//! factory to remove the session.

use crate::adapter::protocol::{
    build_command_packet, parse_packet, Ingress, StateEntry, WireReply, PACKET_TERMINATOR,
};
use crate::registry::DeviceRegistry;
use crate::scheduler::{Delay, SchedulerHandle, TimerEvent, TimerId};
use crate::types::DeviceId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub(crate) struct SessionTask {
    pub identifier: String,
    pub registry: Arc<DeviceRegistry>,
    pub scheduler: SchedulerHandle,
    pub heartbeat_id: TimerId,
    pub command_id: TimerId,
    pub heartbeat: Duration,
    pub command_interval: Duration,
    pub timer_tx: mpsc::UnboundedSender<TimerEvent>,
    pub timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    pub listener: TcpListener,
    /// `(scoped-name, signal)` of every state signal the board may report.
    pub state_info: HashMap<(String, String), DeviceId>,
    /// Devices whose staged registry commands this session delivers.
    pub devices: Vec<DeviceId>,
    /// Signal values received but not yet flushed to the registry.
    pub rx_buffer: Arc<Mutex<HashMap<(DeviceId, String), f64>>>,
    /// Asks the factory to drop this session by identifier.
    pub removals: mpsc::UnboundedSender<String>,
}

impl SessionTask {
    pub async fn run(mut self) {
        self.reset_heartbeat();
        info!(identifier = %self.identifier, "adapter session started");

        // Per-connection reader tasks feed complete packet bodies here. The
        // session keeps one sender so the channel never reports closed.
        let (packet_tx, mut packet_rx) = mpsc::unbounded_channel::<String>();
        let mut writer: Option<OwnedWriteHalf> = None;
        let mut initialized = false;

        loop {
            tokio::select! {
                ev = self.timer_rx.recv() => {
                    let Some(ev) = ev else { break };
                    if ev.cancelled {
                        continue;
                    }
                    if ev.id == self.heartbeat_id {
                        info!(identifier = %self.identifier, "heartbeat expired, removing adapter");
                        let _ = self.removals.send(self.identifier.clone());
                        break;
                    }
                    if ev.id == self.command_id {
                        self.command_tick(&mut writer).await;
                        self.scheduler.schedule(
                            self.command_id,
                            Delay::After(self.command_interval),
                            self.timer_tx.clone(),
                        );
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            info!(identifier = %self.identifier, %addr, "board connected");
                            let (read_half, write_half) = stream.into_split();
                            writer = Some(write_half);
                            tokio::spawn(read_packets(
                                read_half,
                                packet_tx.clone(),
                                self.identifier.clone(),
                            ));
                        }
                        Err(e) => warn!(identifier = %self.identifier, error = %e, "accept failed"),
                    }
                }
                body = packet_rx.recv() => {
                    let Some(body) = body else { break };
                    self.handle_packet(&body, &mut writer, &mut initialized).await;
                }
            }
        }

        self.scheduler.cancel(self.heartbeat_id);
        self.scheduler.cancel(self.command_id);
        info!(identifier = %self.identifier, "adapter session stopped");
    }

    /// Any received packet, well-formed or not, proves the board is alive.
    fn reset_heartbeat(&self) {
        self.scheduler
            .schedule(self.heartbeat_id, Delay::After(self.heartbeat), self.timer_tx.clone());
    }

    async fn handle_packet(
        &self,
        body: &str,
        writer: &mut Option<OwnedWriteHalf>,
        initialized: &mut bool,
    ) {
        self.reset_heartbeat();

        let reply = match parse_packet(body) {
            Ok(Ingress::DeviceStates(entries)) => {
                let reply = self.read_state_packet(&entries);
                if reply == WireReply::Received && !*initialized {
                    *initialized = true;
                    self.scheduler.schedule(
                        self.command_id,
                        Delay::After(self.command_interval),
                        self.timer_tx.clone(),
                    );
                }
                reply
            }
            Ok(Ingress::PoliteDisconnect) => WireReply::PoliteDisconnectAccepted,
            Ok(Ingress::Unknown(header)) => {
                warn!(identifier = %self.identifier, header, "unknown packet header");
                WireReply::UnknownHeader
            }
            Err(e) => {
                warn!(identifier = %self.identifier, error = %e, "malformed packet");
                return;
            }
        };

        if let Some(w) = writer.as_mut() {
            if let Err(e) = w.write_all(reply.as_wire().as_bytes()).await {
                warn!(identifier = %self.identifier, error = %e, "reply failed");
            }
        }
    }

    /// Validate a state report and stage it into the rx buffer. The buffer is
    /// only mutated when the whole packet is acceptable.
    fn read_state_packet(&self, entries: &[StateEntry]) -> WireReply {
        let mut staged: HashMap<(DeviceId, String), f64> = HashMap::new();
        for entry in entries {
            let scoped = format!("{}:{}", self.identifier, entry.name);
            let key = (scoped, entry.signal.clone());
            let Some(device) = self.state_info.get(&key) else {
                debug!(identifier = %self.identifier, name = %key.0, signal = %key.1,
                    "state for unregistered device signal");
                return WireReply::UnknownDevice;
            };
            if staged.insert((device.clone(), entry.signal.clone()), entry.value).is_some() {
                return WireReply::DuplicateDevice;
            }
        }

        let mut rx = self.rx_buffer.lock().expect("rx buffer lock");
        for (key, value) in staged {
            rx.insert(key, value);
        }
        WireReply::Received
    }

    /// Flush the rx buffer into the registry, then drain staged registry
    /// commands into one egress packet. The flush always precedes the drain.
    async fn command_tick(&self, writer: &mut Option<OwnedWriteHalf>) {
        let staged: Vec<((DeviceId, String), f64)> = {
            let mut rx = self.rx_buffer.lock().expect("rx buffer lock");
            rx.drain().collect()
        };
        for ((device, signal), value) in staged {
            self.registry.apply_state(&device, &signal, value);
        }

        let mut commands = Vec::new();
        for device in &self.devices {
            for (signal, value) in self.registry.take_commands(device) {
                commands.push((device.local_name().to_string(), signal, value));
            }
        }

        // Only received packets reset the heartbeat; a board that stops
        // talking ages out even while this side keeps sending commands.
        let packet = build_command_packet(&commands);
        if let Some(w) = writer.as_mut() {
            if let Err(e) = w.write_all(packet.as_bytes()).await {
                warn!(identifier = %self.identifier, error = %e, "command send failed");
            }
        }
    }
}

/// Read one connection until EOF, forwarding complete packet bodies.
async fn read_packets(
    mut reader: OwnedReadHalf,
    packets: mpsc::UnboundedSender<String>,
    identifier: String,
) {
    let mut acc = String::new();
    let mut chunk = [0u8; 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                debug!(identifier = %identifier, "board disconnected");
                break;
            }
            Ok(n) => {
                acc.push_str(&String::from_utf8_lossy(&chunk[..n]));
                while let Some(body) = next_packet(&mut acc) {
                    if packets.send(body).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "socket error");
                break;
            }
        }
    }
}

/// Pop the next complete packet body out of the accumulator, if any.
fn next_packet(acc: &mut String) -> Option<String> {
    let end = acc.find(PACKET_TERMINATOR)?;
    let body = acc[..end].to_string();
    acc.drain(..end + PACKET_TERMINATOR.len());
    Some(body)
}
