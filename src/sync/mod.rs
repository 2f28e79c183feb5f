//! Clock Synchronizer
//!
//! Estimates per-peer clock offset and skew from timestamped challenge and
//! response exchanges, fitted with a weighted, decaying linear regression.
//! Offsets learned directly carry full weight; offsets learned transitively
//! through a neighbor's table lose 0.1 of trust per hop. Each round publishes
//! the weighted mean offset to the process-wide [`SyncClock`].
//!
//! The arithmetic lives in [`ClockCore`] with the current wall-clock passed
//! in, so rounds are reproducible in tests; the actor wraps it with timers
//! and peer I/O.

use crate::messages::{OffsetRecord, PeerMessage};
use crate::peers::PeerTable;
use crate::scheduler::{Delay, SchedulerHandle, TimerEvent, TimerId};
use crate::types::PeerId;
use chrono::{DateTime, Duration as TimeDelta, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const MAX_REGRESSION_ENTRIES: usize = 200;
const SYNCHRONIZER_LAMBDA: f64 = 0.99999;
/// Trust removed per transitive hop.
const TRANSITIVE_PENALTY: f64 = 0.1;

/// Process-wide synchronized clock: wall clock plus the published skew.
#[derive(Default)]
pub struct SyncClock {
    skew_micros: AtomicI64,
}

impl SyncClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.skew()
    }

    pub fn skew(&self) -> TimeDelta {
        TimeDelta::microseconds(self.skew_micros.load(Ordering::Relaxed))
    }

    pub fn set_skew(&self, skew: TimeDelta) {
        self.skew_micros
            .store(skew.num_microseconds().unwrap_or(0), Ordering::Relaxed);
    }
}

/// Seconds represented by a time delta, at microsecond resolution.
pub fn delta_to_secs(d: TimeDelta) -> f64 {
    match d.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => d.num_seconds() as f64,
    }
}

/// Time delta of roughly `secs` seconds, truncated to microsecond resolution.
pub fn secs_to_delta(secs: f64) -> TimeDelta {
    let whole = secs.trunc();
    let micros = ((secs - whole) * 1e6).trunc();
    TimeDelta::seconds(whole as i64) + TimeDelta::microseconds(micros as i64)
}

/// Offset knowledge about one peer. Weight and the round it was learned in
/// are committed together, so aging can never observe a half-written entry.
#[derive(Debug, Clone)]
pub struct OffsetEntry {
    pub offset: TimeDelta,
    pub skew: f64,
    weight: f64,
    last_response: u32,
}

/// Sends queued by one exchange round, resolved to handles by the caller.
pub struct RoundOutput {
    pub challenges: Vec<(PeerId, u32)>,
    /// Weighted mean offset to publish as the node's clock skew.
    pub mean_offset: TimeDelta,
    pub mean_skew: f64,
}

/// Deterministic synchronizer state machine.
pub struct ClockCore {
    local: PeerId,
    entries: BTreeMap<PeerId, OffsetEntry>,
    queries: HashMap<PeerId, (u32, DateTime<Utc>)>,
    responses: HashMap<PeerId, VecDeque<(DateTime<Utc>, DateTime<Utc>)>>,
    kcounter: u32,
}

impl ClockCore {
    pub fn new(local: PeerId) -> Self {
        let mut core = Self {
            local,
            entries: BTreeMap::new(),
            queries: HashMap::new(),
            responses: HashMap::new(),
            kcounter: 0,
        };
        core.pin_self();
        core
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    pub fn kcounter(&self) -> u32 {
        self.kcounter
    }

    fn pin_self(&mut self) {
        self.entries.insert(
            self.local.clone(),
            OffsetEntry {
                offset: TimeDelta::zero(),
                skew: 0.0,
                weight: 1.0,
                last_response: self.kcounter,
            },
        );
    }

    /// Trust in an entry after per-round decay. The self pair is always 1.
    pub fn effective_weight(&self, peer: &PeerId) -> f64 {
        if *peer == self.local {
            return 1.0;
        }
        match self.entries.get(peer) {
            Some(e) => {
                e.weight * SYNCHRONIZER_LAMBDA.powi((self.kcounter - e.last_response) as i32)
            }
            None => 0.0,
        }
    }

    pub fn entry(&self, peer: &PeerId) -> Option<&OffsetEntry> {
        self.entries.get(peer)
    }

    pub fn response_history_len(&self, peer: &PeerId) -> usize {
        self.responses.get(peer).map(VecDeque::len).unwrap_or(0)
    }

    /// Start an exchange round: queue one challenge per peer (in rotation
    /// order), advance the round counter, and recompute the published mean.
    pub fn begin_round(&mut self, rotation: &[PeerId], now: DateTime<Utc>) -> RoundOutput {
        let mut challenges = Vec::with_capacity(rotation.len());
        for peer in rotation {
            self.queries.insert(peer.clone(), (self.kcounter, now));
            challenges.push((peer.clone(), self.kcounter));
        }
        self.kcounter += 1;

        // Keep the self-referential entry sane on both sides of the mean.
        self.pin_self();
        let mut weighted_offset = 0.0;
        let mut total_weight = 0.0;
        let mut weighted_skew = 0.0;
        for (peer, entry) in &self.entries {
            let w = self.effective_weight(peer);
            weighted_offset += w * delta_to_secs(entry.offset);
            total_weight += w;
            weighted_skew += w * entry.skew;
        }
        let (mean_offset, mean_skew) = if total_weight != 0.0 {
            (secs_to_delta(weighted_offset / total_weight), weighted_skew / total_weight)
        } else {
            (TimeDelta::zero(), 0.0)
        };
        self.pin_self();

        RoundOutput { challenges, mean_offset, mean_skew }
    }

    /// Answer a challenge with the current table snapshot.
    pub fn build_response(&self, query: u32, now: DateTime<Utc>) -> PeerMessage {
        let table = self
            .entries
            .iter()
            .map(|(peer, entry)| {
                let secs = entry.offset.num_seconds();
                let micros = (entry.offset - TimeDelta::seconds(secs))
                    .num_microseconds()
                    .unwrap_or(0);
                OffsetRecord {
                    uuid: peer.clone(),
                    offset_secs: secs,
                    offset_micros: micros,
                    skew: entry.skew,
                    weight: self.effective_weight(peer),
                }
            })
            .collect();
        PeerMessage::ExchangeResponse {
            response: query,
            send_time: now.to_rfc3339(),
            table,
        }
    }

    /// Fold one challenge response into the regression for `from`, then merge
    /// the peer's table transitively.
    pub fn handle_response(
        &mut self,
        from: &PeerId,
        response: u32,
        send_time: &str,
        table: &[OffsetRecord],
        now: DateTime<Utc>,
    ) {
        let response_time = match DateTime::parse_from_rfc3339(send_time) {
            Ok(t) => t.with_timezone(&Utc),
            Err(e) => {
                warn!(peer = %from, error = %e, "unparseable response timestamp");
                return;
            }
        };

        // Out-of-sequence responses are silently dropped.
        let challenge = match self.queries.get(from) {
            Some((k, challenge)) if *k == response => *challenge,
            _ => return,
        };
        self.queries.remove(from);

        let history = self.responses.entry(from.clone()).or_default();
        history.push_back((response_time, challenge));
        history.push_back((response_time, now));
        if history.len() > MAX_REGRESSION_ENTRIES * 2 {
            history.pop_front();
            history.pop_front();
        }

        // Regress remote send times against local times, both measured back
        // from now so the intercept lands near the present offset.
        let base = now;
        let n = history.len() as f64;
        let mut sumx = 0.0;
        let mut sumy = 0.0;
        let mut sumlag = 0.0;
        let mut even = false;
        for (remote, local) in history.iter() {
            let y = delta_to_secs(*local - base);
            sumx += delta_to_secs(*remote - base);
            sumy += y;
            // Challenge and reply legs alternate, so the signed sum isolates
            // one-way propagation delay.
            if even {
                sumlag += y;
                even = false;
            } else {
                sumlag -= y;
                even = true;
            }
        }
        let lag = sumlag / n;
        if lag < 0.015 {
            debug!(peer = %from, lag, "computed lag");
        } else {
            warn!(peer = %from, lag, "computed lag");
        }

        let xbar = sumx / n;
        let ybar = sumy / n;
        let mut num = 0.0;
        let mut den = 0.0;
        for (remote, local) in history.iter() {
            let dx = delta_to_secs(*remote - base) - xbar;
            let dy = delta_to_secs(*local - base) - ybar;
            num += dx * dy;
            den += dx * dx;
        }
        // With no spread there is only one x coordinate to use.
        let fij = if den != 0.0 { num / den } else { 1.0 };

        let mut alpha = ybar - fij * xbar;
        if alpha <= 0.0 {
            alpha += lag;
        } else {
            alpha -= lag;
        }

        self.entries.insert(
            from.clone(),
            OffsetEntry {
                offset: secs_to_delta(-alpha),
                skew: fij - 1.0,
                weight: 1.0,
                last_response: self.kcounter,
            },
        );

        let via = self.entries[from].clone();
        for record in table {
            if record.uuid == *from || record.uuid == self.local {
                continue;
            }
            let cjl = TimeDelta::seconds(record.offset_secs)
                + TimeDelta::microseconds(record.offset_micros);
            // Remove some trust per hop so path weights decay strictly.
            let wjl = record.weight - TRANSITIVE_PENALTY;
            if !self.entries.contains_key(&record.uuid) {
                self.entries.insert(
                    record.uuid.clone(),
                    OffsetEntry {
                        offset: TimeDelta::zero(),
                        skew: 0.0,
                        weight: 0.0,
                        last_response: self.kcounter,
                    },
                );
            }
            if self.effective_weight(&record.uuid) < wjl {
                self.entries.insert(
                    record.uuid.clone(),
                    OffsetEntry {
                        offset: via.offset + cjl,
                        skew: via.skew + record.skew,
                        weight: wjl,
                        last_response: self.kcounter,
                    },
                );
            }
        }
    }
}

/// Actor shell: exchange timer, peer sends, skew publication.
#[derive(kameo::Actor)]
pub struct ClockSync {
    core: ClockCore,
    peers: Arc<PeerTable>,
    clock: Arc<SyncClock>,
    scheduler: SchedulerHandle,
    timer: TimerId,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    interval: std::time::Duration,
}

impl ClockSync {
    pub fn new(
        peers: Arc<PeerTable>,
        clock: Arc<SyncClock>,
        scheduler: SchedulerHandle,
        timer_tx: mpsc::UnboundedSender<TimerEvent>,
        interval: std::time::Duration,
    ) -> Self {
        let timer = scheduler.allocate_timer("clock-sync");
        let core = ClockCore::new(peers.local_id().clone());
        Self { core, peers, clock, scheduler, timer, timer_tx, interval }
    }

    fn arm_timer(&self) {
        self.scheduler
            .schedule(self.timer, Delay::After(self.interval), self.timer_tx.clone());
    }

    fn exchange_round(&mut self) {
        let rotation: Vec<PeerId> =
            self.peers.rotation_after_self().iter().map(|p| p.id().clone()).collect();
        let round = self.core.begin_round(&rotation, Utc::now());

        for (peer, query) in round.challenges {
            let Some(handle) = self.peers.get(&peer) else { continue };
            if let Err(e) = handle.send(
                self.core.local_id().clone(),
                PeerMessage::Exchange { query },
            ) {
                debug!(error = %e, "challenge send failed");
            }
        }

        info!(skew_us = round.mean_offset.num_microseconds().unwrap_or(0), "adjusting clock skew");
        self.clock.set_skew(round.mean_offset);
        self.arm_timer();
    }
}

/// Messages handled by the synchronizer actor.
#[derive(Debug)]
pub enum ClockMsg {
    Start,
    Tick(TimerEvent),
    Exchange { from: PeerId, query: u32 },
    Response { from: PeerId, response: u32, send_time: String, table: Vec<OffsetRecord> },
    Snapshot,
}

#[derive(Debug, kameo::Reply)]
pub enum ClockReply {
    Ack,
    Snapshot { skew: TimeDelta, weights: Vec<(PeerId, f64)> },
}

impl kameo::message::Message<ClockMsg> for ClockSync {
    type Reply = ClockReply;

    async fn handle(
        &mut self,
        msg: ClockMsg,
        _ctx: &mut kameo::message::Context<Self, Self::Reply>,
    ) -> Self::Reply {
        match msg {
            ClockMsg::Start => {
                self.arm_timer();
                ClockReply::Ack
            }

            ClockMsg::Tick(ev) => {
                if !ev.cancelled {
                    self.exchange_round();
                }
                ClockReply::Ack
            }

            ClockMsg::Exchange { from, query } => {
                // The response timestamp is deliberately the unsynchronized
                // wall clock.
                let response = self.core.build_response(query, Utc::now());
                match self.peers.get(&from) {
                    Some(handle) => {
                        if let Err(e) = handle.send(self.core.local_id().clone(), response) {
                            debug!(error = %e, "challenge response send failed");
                        }
                    }
                    None => debug!(peer = %from, "challenge from unknown peer dropped"),
                }
                ClockReply::Ack
            }

            ClockMsg::Response { from, response, send_time, table } => {
                self.core.handle_response(&from, response, &send_time, &table, Utc::now());
                ClockReply::Ack
            }

            ClockMsg::Snapshot => {
                let weights = self
                    .core
                    .entries
                    .keys()
                    .map(|p| (p.clone(), self.core.effective_weight(p)))
                    .collect();
                ClockReply::Snapshot { skew: self.clock.skew(), weights }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::from(id)
    }

    /// Run one full synthetic exchange between two cores whose clocks differ
    /// by `offset`, with zero network delay. `base` is A's wall clock.
    fn exchange_once(
        a: &mut ClockCore,
        b: &mut ClockCore,
        base: DateTime<Utc>,
        offset: TimeDelta,
    ) {
        let round = a.begin_round(&[b.local_id().clone()], base);
        for (to, query) in round.challenges {
            assert_eq!(to, *b.local_id());
            let reply = b.build_response(query, base + offset);
            match reply {
                PeerMessage::ExchangeResponse { response, send_time, table } => {
                    a.handle_response(b.local_id(), response, &send_time, &table, base);
                }
                other => panic!("unexpected reply: {:?}", other),
            }
        }
    }

    #[test]
    fn self_pair_is_always_pinned() {
        let mut core = ClockCore::new(peer("a"));
        let now = Utc::now();
        for _ in 0..3 {
            core.begin_round(&[peer("b")], now);
        }
        let entry = core.entry(&peer("a")).unwrap();
        assert_eq!(entry.offset, TimeDelta::zero());
        assert_eq!(entry.skew, 0.0);
        assert_eq!(core.effective_weight(&peer("a")), 1.0);
    }

    #[test]
    fn response_history_stays_even_and_bounded() {
        let mut a = ClockCore::new(peer("a"));
        let mut b = ClockCore::new(peer("b"));
        let mut now = Utc::now();
        for _ in 0..250 {
            exchange_once(&mut a, &mut b, now, TimeDelta::milliseconds(100));
            now += TimeDelta::seconds(10);
        }
        let len = a.response_history_len(&peer("b"));
        assert!(len <= 2 * MAX_REGRESSION_ENTRIES);
        assert_eq!(len % 2, 0);
        assert_eq!(len, 2 * MAX_REGRESSION_ENTRIES);
    }

    #[test]
    fn zero_variance_regression_defaults_slope_to_one() {
        let mut a = ClockCore::new(peer("a"));
        let mut b = ClockCore::new(peer("b"));
        let now = Utc::now();
        exchange_once(&mut a, &mut b, now, TimeDelta::milliseconds(500));

        let entry = a.entry(&peer("b")).unwrap();
        // One exchange means a single x coordinate, so the slope falls back
        // to 1 and the stored skew to 0.
        assert_eq!(entry.skew, 0.0);
        // The offset estimate tracks the remote clock lead.
        let est = delta_to_secs(entry.offset);
        assert!((est - 0.5).abs() < 0.01, "estimated {est}");
    }

    #[test]
    fn two_nodes_converge_to_matching_synchronized_time() {
        let mut a = ClockCore::new(peer("a"));
        let mut b = ClockCore::new(peer("b"));
        let skew = TimeDelta::milliseconds(500);
        let mut now = Utc::now();

        let mut a_pub = TimeDelta::zero();
        let mut b_pub = TimeDelta::zero();
        for _ in 0..6 {
            exchange_once(&mut a, &mut b, now, skew);
            exchange_once(&mut b, &mut a, now + skew, -skew);
            a_pub = a.begin_round(&[], now).mean_offset;
            b_pub = b.begin_round(&[], now + skew).mean_offset;
            now += TimeDelta::seconds(10);
        }

        // now_a + skew_a should agree with now_b + skew_b.
        let a_sync = now + a_pub;
        let b_sync = (now + skew) + b_pub;
        let disagreement = delta_to_secs(a_sync - b_sync).abs();
        assert!(disagreement < 0.010, "synchronized clocks differ by {disagreement}s");
    }

    #[test]
    fn transitive_weight_decays_per_hop() {
        let mut a = ClockCore::new(peer("a"));
        let mut b = ClockCore::new(peer("b"));
        let now = Utc::now();

        // Seed b with second-hand knowledge of c at weight 0.9.
        b.entries.insert(
            peer("c"),
            OffsetEntry {
                offset: TimeDelta::milliseconds(250),
                skew: 0.0,
                weight: 0.9,
                last_response: b.kcounter(),
            },
        );

        exchange_once(&mut a, &mut b, now, TimeDelta::zero());

        // Direct entry carries full weight; c arrived one hop later.
        assert!((a.effective_weight(&peer("b")) - 1.0).abs() < 1e-9);
        let w_c = a.effective_weight(&peer("c"));
        assert!((w_c - 0.8).abs() < 1e-6, "got {w_c}");
        assert!(w_c <= 1.0 - 2.0 * TRANSITIVE_PENALTY + 1e-9);

        // The transitive offset chains through b.
        let c_offset = delta_to_secs(a.entry(&peer("c")).unwrap().offset);
        assert!((c_offset - 0.25).abs() < 0.01, "got {c_offset}");
    }

    #[test]
    fn out_of_sequence_response_is_dropped() {
        let mut a = ClockCore::new(peer("a"));
        let now = Utc::now();
        a.begin_round(&[peer("b")], now);

        // Wrong sequence number.
        a.handle_response(&peer("b"), 99, &now.to_rfc3339(), &[], now);
        assert!(a.entry(&peer("b")).is_none());

        // Response from a peer that was never challenged.
        a.handle_response(&peer("z"), 0, &now.to_rfc3339(), &[], now);
        assert!(a.entry(&peer("z")).is_none());
    }

    #[test]
    fn empty_peer_set_round_is_a_noop() {
        let mut core = ClockCore::new(peer("a"));
        let round = core.begin_round(&[], Utc::now());
        assert!(round.challenges.is_empty());
        assert_eq!(round.mean_offset, TimeDelta::zero());
        assert_eq!(core.kcounter(), 1);
    }

    #[test]
    fn delta_secs_round_trip_is_microsecond_exact() {
        for secs in [0.0, 1.5, -2.25, 0.000001, -0.000001, 86400.123456, -86400.123456] {
            let back = delta_to_secs(secs_to_delta(secs));
            assert!((back - secs).abs() < 1e-6, "{secs} -> {back}");
        }
    }
}
