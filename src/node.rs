//! Node Wiring
//!
//! One [`Node`] is a full DGI instance: the shared context (config, device
//! registry, peer table, synchronized clock, timer scheduler) plus the
//! coordination actors and the inbound message router. Collaborators that
//! are out of scope here (connection management, group management, state
//! collection) talk to the node through its peer handle and router.

use crate::adapter::AdapterFactory;
use crate::balance::{LbAgent, LbMsg};
use crate::config::GridConfig;
use crate::dispatch::topology::Topology;
use crate::dispatch::{DispatchAgent, DispatchMsg};
use crate::messages::{Envelope, PeerMessage};
use crate::peers::{PeerHandle, PeerTable};
use crate::registry::DeviceRegistry;
use crate::scheduler::{Delay, SchedulerHandle};
use crate::sync::{ClockMsg, ClockSync, SyncClock};
use crate::types::{PeerId, Result};
use kameo::actor::ActorRef;
use kameo::Actor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A running DGI instance.
pub struct Node {
    pub id: PeerId,
    pub config: Arc<GridConfig>,
    pub registry: Arc<DeviceRegistry>,
    pub peers: Arc<PeerTable>,
    pub clock: Arc<SyncClock>,
    pub scheduler: SchedulerHandle,
    pub adapters: Arc<AdapterFactory>,
    pub clock_sync: ActorRef<ClockSync>,
    pub dispatch: ActorRef<DispatchAgent>,
    pub balance: ActorRef<LbAgent>,
    inbox_tx: mpsc::UnboundedSender<Envelope>,
}

impl Node {
    /// Build and start a node from its configuration. A malformed topology
    /// refuses to run.
    pub async fn spawn(config: GridConfig) -> Result<Arc<Node>> {
        Self::spawn_with_collector(config, None).await
    }

    /// As [`Node::spawn`], with the state-collection collaborator seam wired.
    pub async fn spawn_with_collector(
        config: GridConfig,
        collector: Option<mpsc::UnboundedSender<PeerId>>,
    ) -> Result<Arc<Node>> {
        let config = Arc::new(config);
        let id = config.local_id();
        info!(node = %id, "starting gridnode");

        let registry = Arc::new(DeviceRegistry::new());
        let peers = Arc::new(PeerTable::new(id.clone()));
        let clock = Arc::new(SyncClock::new());
        let scheduler = SchedulerHandle::spawn();
        let adapters = AdapterFactory::spawn(Arc::clone(&registry), scheduler.clone());

        let topology = match &config.topology {
            Some(path) => {
                let topology = Topology::load(path)?;
                info!(vertices = topology.vertex_count(), "topology loaded");
                Some(topology)
            }
            None => None,
        };

        // Clock synchronizer with its exchange timer.
        let (clock_timer_tx, mut clock_timer_rx) = mpsc::unbounded_channel();
        let clock_sync = ClockSync::spawn(ClockSync::new(
            Arc::clone(&peers),
            Arc::clone(&clock),
            scheduler.clone(),
            clock_timer_tx,
            Duration::from_secs(config.timing.query_interval_secs),
        ));
        {
            let weak = clock_sync.downgrade();
            tokio::spawn(async move {
                while let Some(ev) = clock_timer_rx.recv().await {
                    let Some(actor) = weak.upgrade() else { break };
                    if actor.tell(ClockMsg::Tick(ev)).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Dispatch solver; its startup tick runs on the next scheduler turn
        // so attached devices registered below are visible to it.
        let dispatch = DispatchAgent::spawn(DispatchAgent::new(
            topology,
            Arc::clone(&peers),
            Arc::clone(&registry),
        ));
        let (dispatch_timer_tx, mut dispatch_timer_rx) = mpsc::unbounded_channel();
        let dispatch_start = scheduler.allocate_timer("dispatch-start");
        {
            let weak = dispatch.downgrade();
            tokio::spawn(async move {
                while let Some(ev) = dispatch_timer_rx.recv().await {
                    let Some(actor) = weak.upgrade() else { break };
                    if actor.tell(DispatchMsg::Tick(ev)).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Load balancer with its load and state timers.
        let (lb_timer_tx, mut lb_timer_rx) = mpsc::unbounded_channel();
        let balance = LbAgent::spawn(LbAgent::new(
            Arc::clone(&peers),
            Arc::clone(&registry),
            scheduler.clone(),
            lb_timer_tx,
            Duration::from_secs(config.timing.load_timeout_secs),
            Duration::from_secs(config.timing.state_timeout_secs),
            config.timing.normal_tolerance,
            collector,
        ));
        {
            let weak = balance.downgrade();
            tokio::spawn(async move {
                while let Some(ev) = lb_timer_rx.recv().await {
                    let Some(actor) = weak.upgrade() else { break };
                    if actor.tell(LbMsg::Tick(ev)).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Adapter sessions register their devices before the modules tick.
        for adapter in &config.adapters {
            adapters.create(adapter).await?;
        }

        let _ = clock_sync.tell(ClockMsg::Start).await;
        let _ = balance.tell(LbMsg::Start).await;
        scheduler.schedule(dispatch_start, Delay::Immediate, dispatch_timer_tx);

        // Inbound router: one task, messages from a peer stay in order.
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel::<Envelope>();
        {
            let clock_sync = clock_sync.clone();
            let dispatch = dispatch.clone();
            let balance = balance.clone();
            tokio::spawn(async move {
                while let Some(env) = inbox_rx.recv().await {
                    route(env, &clock_sync, &dispatch, &balance).await;
                }
            });
        }

        Ok(Arc::new(Node {
            id,
            config,
            registry,
            peers,
            clock,
            scheduler,
            adapters,
            clock_sync,
            dispatch,
            balance,
            inbox_tx,
        }))
    }

    /// A send capability for this node, handed to other nodes' peer tables.
    pub fn handle(&self) -> PeerHandle {
        PeerHandle::new(self.id.clone(), self.inbox_tx.clone())
    }
}

async fn route(
    env: Envelope,
    clock_sync: &ActorRef<ClockSync>,
    dispatch: &ActorRef<DispatchAgent>,
    balance: &ActorRef<LbAgent>,
) {
    let from = env.from;
    match env.msg {
        PeerMessage::Exchange { query } => {
            let _ = clock_sync.tell(ClockMsg::Exchange { from, query }).await;
        }
        PeerMessage::ExchangeResponse { response, send_time, table } => {
            let _ = clock_sync
                .tell(ClockMsg::Response { from, response, send_time, table })
                .await;
        }
        PeerMessage::DispatchState { iteration, symbol, delta_p, lambda } => {
            let _ = dispatch
                .tell(DispatchMsg::State { iteration, symbol, delta_p, lambda })
                .await;
        }
        PeerMessage::PeerList { leader, peers } => {
            let _ = dispatch.tell(DispatchMsg::PeerList).await;
            let _ = balance.tell(LbMsg::PeerList { leader, peers }).await;
        }
        PeerMessage::LbControl { kind, source, value } => {
            debug!(kind = %kind, source = %source, "load balance control");
            let _ = balance.tell(LbMsg::Control { from: source, kind, value }).await;
        }
        PeerMessage::CollectedState { gateways, in_transit } => {
            let _ = balance.tell(LbMsg::CollectedState { gateways, in_transit }).await;
        }
    }
}
