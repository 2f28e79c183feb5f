//! Load Balancer
//!
//! Drafting protocol between supply and demand nodes, after Ni, Xu and
//! Gendreau's distributed drafting algorithm. Each tick classifies the local
//! node from attached device readings, gossips the classification, and while
//! in supply drafts power to a known demand peer; a completed handshake steps
//! the SST setpoint by the migration quantum on both sides.

use crate::messages::LbKind;
use crate::peers::PeerTable;
use crate::registry::DeviceRegistry;
use crate::scheduler::{Delay, SchedulerHandle, TimerEvent, TimerId};
use crate::types::{DeviceKind, PeerId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Power stepped per completed migration.
const P_MIGRATE: f64 = 1.0;

/// Local load classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Supply,
    Normal,
    Demand,
}

/// Net readings gathered from the device registry for one tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readings {
    pub drer: f64,
    pub soc: f64,
    pub load: f64,
    pub grid: f64,
}

impl Readings {
    pub fn from_registry(registry: &DeviceRegistry) -> Self {
        Self {
            drer: registry.net_value(DeviceKind::Drer, "powerLevel"),
            soc: registry.net_value(DeviceKind::Desd, "stateOfCharge"),
            load: registry.net_value(DeviceKind::Load, "powerLevel"),
            grid: registry.net_value(DeviceKind::Grid, "powerLevel"),
        }
    }
}

/// Message targets resolved by the actor shell.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    AllPeers,
    DemandPeers,
    Peer(PeerId),
}

/// Side effects requested by the core, executed by the actor.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send { to: Target, kind: LbKind, value: Option<f64> },
    SetSstLevel(f64),
    /// Ask the state-collection collaborator for a snapshot.
    CollectState,
}

/// Deterministic drafting state machine.
pub struct LbCore {
    local: PeerId,
    normal_tolerance: f64,
    status: LoadState,
    prev_status: LoadState,
    demand_val: f64,
    pstar: f64,
    leader: PeerId,
    peer_states: BTreeMap<PeerId, LoadState>,
    last_aggregate: f64,
}

impl LbCore {
    pub fn new(local: PeerId, normal_tolerance: f64) -> Self {
        Self {
            leader: local.clone(),
            local,
            normal_tolerance,
            status: LoadState::Normal,
            prev_status: LoadState::Normal,
            demand_val: 0.0,
            pstar: 0.0,
            peer_states: BTreeMap::new(),
            last_aggregate: 0.0,
        }
    }

    pub fn status(&self) -> LoadState {
        self.status
    }

    pub fn pstar(&self) -> f64 {
        self.pstar
    }

    pub fn demand_val(&self) -> f64 {
        self.demand_val
    }

    pub fn last_aggregate(&self) -> f64 {
        self.last_aggregate
    }

    pub fn is_leader(&self) -> bool {
        self.leader == self.local
    }

    pub fn demand_peers(&self) -> Vec<PeerId> {
        self.peer_states
            .iter()
            .filter(|(_, s)| **s == LoadState::Demand)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// One load-management tick: classify from readings, gossip the change,
    /// and start drafting while in supply.
    pub fn tick(&mut self, readings: Readings) -> Vec<Action> {
        self.prev_status = self.status;

        let margin = readings.drer - readings.grid;
        if readings.load < margin - self.normal_tolerance {
            self.status = LoadState::Supply;
        } else if readings.load > margin + self.normal_tolerance {
            self.status = LoadState::Demand;
            self.demand_val = readings.load - readings.drer;
        } else {
            self.status = LoadState::Normal;
        }

        info!(
            net_drer = readings.drer,
            net_soc = readings.soc,
            net_load = readings.load,
            net_grid = readings.grid,
            state = ?self.status,
            "load table"
        );
        for (peer, state) in &self.peer_states {
            debug!(peer = %peer, state = ?state, "peer load state");
        }

        // Demand is advertised every tick, not only on the transition.
        if self.status == LoadState::Demand {
            vec![Action::Send { to: Target::AllPeers, kind: LbKind::Demand, value: None }]
        } else if self.prev_status == LoadState::Demand && self.status == LoadState::Normal {
            vec![Action::Send { to: Target::AllPeers, kind: LbKind::Normal, value: None }]
        } else if self.status == LoadState::Supply {
            if self.demand_peers().is_empty() {
                info!("no known demand nodes at the moment");
                Vec::new()
            } else {
                vec![Action::Send { to: Target::DemandPeers, kind: LbKind::Request, value: None }]
            }
        } else {
            Vec::new()
        }
    }

    fn mark(&mut self, peer: &PeerId, state: LoadState) {
        self.peer_states.insert(peer.clone(), state);
    }

    /// Handle one drafting or gossip message from a peer.
    pub fn on_control(&mut self, from: &PeerId, kind: LbKind, value: Option<f64>) -> Vec<Action> {
        if *from == self.local {
            return Vec::new();
        }
        // First sight of a peer puts it in the normal column.
        self.peer_states.entry(from.clone()).or_insert(LoadState::Normal);

        match kind {
            LbKind::Demand => {
                self.mark(from, LoadState::Demand);
                Vec::new()
            }
            LbKind::Normal => {
                self.mark(from, LoadState::Normal);
                Vec::new()
            }
            LbKind::Supply => {
                self.mark(from, LoadState::Supply);
                Vec::new()
            }
            LbKind::Request => {
                // A draft request advertises excess power at the source.
                self.mark(from, LoadState::Supply);
                let answer =
                    if self.status == LoadState::Demand { LbKind::Yes } else { LbKind::No };
                vec![Action::Send { to: Target::Peer(from.clone()), kind: answer, value: None }]
            }
            LbKind::Yes => {
                // Whoever answers the draft request first gets the slice.
                if self.status == LoadState::Supply {
                    vec![Action::Send {
                        to: Target::Peer(from.clone()),
                        kind: LbKind::Drafting,
                        value: None,
                    }]
                } else {
                    debug!(peer = %from, "draft response arrived after leaving supply");
                    Vec::new()
                }
            }
            LbKind::No => {
                debug!(peer = %from, "draft request declined");
                Vec::new()
            }
            LbKind::Drafting => {
                if self.status == LoadState::Demand {
                    let mut actions = vec![Action::Send {
                        to: Target::Peer(from.clone()),
                        kind: LbKind::Accept,
                        value: Some(self.demand_val),
                    }];
                    actions.extend(self.step_pstar());
                    actions
                } else {
                    debug!(peer = %from, "drafting arrived after leaving demand");
                    Vec::new()
                }
            }
            LbKind::Accept => {
                let demand = value.unwrap_or(0.0);
                if self.status == LoadState::Supply {
                    info!(peer = %from, demand, "migrating power on accepted draft");
                    self.step_pstar().into_iter().collect()
                } else {
                    warn!(peer = %from, "unexpected accept message");
                    Vec::new()
                }
            }
        }
    }

    /// Step the SST setpoint by the migration quantum, direction chosen by
    /// the current state. A state change since the handshake aborts.
    fn step_pstar(&mut self) -> Option<Action> {
        match self.status {
            LoadState::Supply => {
                self.pstar += P_MIGRATE;
                info!(level = self.pstar, "sst level raised");
                Some(Action::SetSstLevel(self.pstar))
            }
            LoadState::Demand => {
                self.pstar -= P_MIGRATE;
                info!(level = self.pstar, "sst level lowered");
                Some(Action::SetSstLevel(self.pstar))
            }
            LoadState::Normal => {
                warn!("power migration aborted due to state change");
                None
            }
        }
    }

    /// A peer list from the group leader resets the membership view. The new
    /// leader collects global state immediately.
    pub fn on_peer_list(&mut self, leader: &PeerId, peers: &[PeerId]) -> Vec<Action> {
        info!(leader = %leader, members = peers.len(), "peer list received");
        self.leader = leader.clone();

        let known = std::mem::take(&mut self.peer_states);
        for peer in peers {
            if *peer == self.local {
                continue;
            }
            let state = known.get(peer).copied().unwrap_or(LoadState::Normal);
            self.peer_states.insert(peer.clone(), state);
        }

        if self.is_leader() {
            vec![Action::CollectState]
        } else {
            Vec::new()
        }
    }

    /// Periodic state collection while leading the group.
    pub fn on_state_timer(&self) -> Vec<Action> {
        if self.is_leader() {
            vec![Action::CollectState]
        } else {
            Vec::new()
        }
    }

    /// Fold a collected snapshot into the aggregate flow estimate: gateway
    /// readings plus one migration quantum per in-transit accept.
    pub fn on_collected_state(&mut self, gateways: &[f64], in_transit: &[LbKind]) {
        let mut aggregate: f64 = gateways.iter().sum();
        for msg in in_transit {
            if *msg == LbKind::Accept {
                aggregate += P_MIGRATE;
            }
        }
        self.last_aggregate = aggregate;
        info!(peers = gateways.len(), aggregate, "collected state aggregated");
    }
}

/// Actor shell: timers, registry reads, peer sends, SST actuation.
#[derive(kameo::Actor)]
pub struct LbAgent {
    core: LbCore,
    peers: Arc<PeerTable>,
    registry: Arc<DeviceRegistry>,
    scheduler: SchedulerHandle,
    load_timer: TimerId,
    state_timer: TimerId,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    load_interval: Duration,
    state_interval: Duration,
    /// Seam to the state-collection collaborator.
    collector: Option<mpsc::UnboundedSender<PeerId>>,
}

impl LbAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peers: Arc<PeerTable>,
        registry: Arc<DeviceRegistry>,
        scheduler: SchedulerHandle,
        timer_tx: mpsc::UnboundedSender<TimerEvent>,
        load_interval: Duration,
        state_interval: Duration,
        normal_tolerance: f64,
        collector: Option<mpsc::UnboundedSender<PeerId>>,
    ) -> Self {
        let load_timer = scheduler.allocate_timer("lb-load");
        let state_timer = scheduler.allocate_timer("lb-state");
        let core = LbCore::new(peers.local_id().clone(), normal_tolerance);
        Self {
            core,
            peers,
            registry,
            scheduler,
            load_timer,
            state_timer,
            timer_tx,
            load_interval,
            state_interval,
            collector,
        }
    }

    /// Initial device posture: storage on, diesel generator off. Either
    /// device may be absent, in which case the command is skipped.
    fn stage_device_bringup(&self) {
        if let Some(desd) = self.registry.devices_of(DeviceKind::Desd).first() {
            self.registry.set(desd, "onOffSwitch", 0.0);
            info!(device = %desd, "storage enabled");
        }
        if let Some(dg) = self.registry.devices_of(DeviceKind::Dg).first() {
            self.registry.set(dg, "onOffSwitch", 1.0);
            info!(device = %dg, "diesel generator disabled");
        }
    }

    fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { to, kind, value } => {
                    let handles = match to {
                        Target::AllPeers => self.peers.all(),
                        Target::DemandPeers => self
                            .core
                            .demand_peers()
                            .iter()
                            .filter_map(|p| self.peers.get(p))
                            .collect(),
                        Target::Peer(ref id) => self.peers.get(id).into_iter().collect(),
                    };
                    for handle in handles {
                        let msg = crate::messages::PeerMessage::LbControl {
                            kind,
                            source: self.core.local.clone(),
                            value,
                        };
                        if let Err(e) = handle.send(self.core.local.clone(), msg) {
                            debug!(error = %e, "load balance send failed");
                        }
                    }
                }
                Action::SetSstLevel(level) => {
                    match self.registry.devices_of(DeviceKind::Sst).first() {
                        Some(sst) => {
                            self.registry.set(sst, "level", level);
                            info!(device = %sst, level, "sst setpoint staged");
                        }
                        None => warn!("no sst attached, migration actuation skipped"),
                    }
                }
                Action::CollectState => match &self.collector {
                    Some(tx) => {
                        let _ = tx.send(self.core.local.clone());
                        info!("state collection requested");
                    }
                    None => debug!("no state collector wired, request dropped"),
                },
            }
        }
    }
}

/// Messages handled by the load balancer actor.
#[derive(Debug)]
pub enum LbMsg {
    Start,
    Tick(TimerEvent),
    Control { from: PeerId, kind: LbKind, value: Option<f64> },
    PeerList { leader: PeerId, peers: Vec<PeerId> },
    CollectedState { gateways: Vec<f64>, in_transit: Vec<LbKind> },
    Snapshot,
}

#[derive(Debug, kameo::Reply)]
pub enum LbReply {
    Ack,
    Snapshot { status: LoadState, pstar: f64, demand_val: f64, aggregate: f64 },
}

impl kameo::message::Message<LbMsg> for LbAgent {
    type Reply = LbReply;

    async fn handle(
        &mut self,
        msg: LbMsg,
        _ctx: &mut kameo::message::Context<Self, Self::Reply>,
    ) -> Self::Reply {
        match msg {
            LbMsg::Start => {
                self.stage_device_bringup();
                self.scheduler.schedule(self.load_timer, Delay::Immediate, self.timer_tx.clone());
                self.scheduler.schedule(
                    self.state_timer,
                    Delay::After(self.state_interval),
                    self.timer_tx.clone(),
                );
                LbReply::Ack
            }

            LbMsg::Tick(ev) => {
                if ev.cancelled {
                    return LbReply::Ack;
                }
                if ev.id == self.load_timer {
                    let readings = Readings::from_registry(&self.registry);
                    let actions = self.core.tick(readings);
                    self.execute(actions);
                    self.scheduler.schedule(
                        self.load_timer,
                        Delay::After(self.load_interval),
                        self.timer_tx.clone(),
                    );
                } else if ev.id == self.state_timer {
                    let actions = self.core.on_state_timer();
                    self.execute(actions);
                    self.scheduler.schedule(
                        self.state_timer,
                        Delay::After(self.state_interval),
                        self.timer_tx.clone(),
                    );
                }
                LbReply::Ack
            }

            LbMsg::Control { from, kind, value } => {
                let actions = self.core.on_control(&from, kind, value);
                self.execute(actions);
                LbReply::Ack
            }

            LbMsg::PeerList { leader, peers } => {
                let actions = self.core.on_peer_list(&leader, &peers);
                self.execute(actions);
                LbReply::Ack
            }

            LbMsg::CollectedState { gateways, in_transit } => {
                self.core.on_collected_state(&gateways, &in_transit);
                LbReply::Ack
            }

            LbMsg::Snapshot => LbReply::Snapshot {
                status: self.core.status(),
                pstar: self.core.pstar(),
                demand_val: self.core.demand_val(),
                aggregate: self.core.last_aggregate(),
            },
        }
    }
}
