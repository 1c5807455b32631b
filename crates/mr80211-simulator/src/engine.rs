use crate::trace::{Delivery, SimulationReport, StationReport, TxFailure};
use anyhow::{Context, bail};
use bytes::Bytes;
use mr80211_abstract::{
    MacAddr, MacContext, MacFrame, RateAdaptation, SimConfig, StationSpec, TimerKind, TxFailReason,
};
use mr80211_core::{
    Arf, CounterId, Mac80211, MacCounters, MacError, MacEventHandler, PeerStatsDb, PerTable, PowerProfile,
    SharedPowerProfile, StaticPeerStatsDb,
};
use rand::RngCore;
use rand::rngs::StdRng;
use serde::Serialize;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, info, warn};

pub type StationId = usize;

pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

#[derive(Debug)]
pub enum EventType {
    /// First bit of a frame reaches a station.
    FrameArrival {
        to: StationId,
        frame: MacFrame,
    },
    /// In-band power seen by a station changes by `delta` W.
    PowerChange {
        station: StationId,
        delta: f64,
    },
    TimerExpiry {
        station: StationId,
        kind: TimerKind,
        generation: u64,
    },
    AppSend {
        station: StationId,
        frame: MacFrame,
    },
    ResetIdleSlots,
}

#[derive(Debug)]
struct Event {
    time: f64,
    event_type: EventType,
    id: u64, // Unique ID to differentiate events at same time
}

// Custom Ord for Min-Heap (smallest time pops first)
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.time.total_cmp(&other.time) == Ordering::Equal && self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// A compact textual summary of channel and delivery events.
#[derive(Debug, Clone, Serialize)]
pub struct LinkEventSummary {
    pub time: f64,
    pub description: String,
}

#[derive(Debug, Clone, Copy)]
enum TimerOp {
    Start(TimerKind, f64),
    Cancel(TimerKind),
}

/// Actions buffered during a MAC callback
#[derive(Default)]
struct ActionBuffer {
    timer_ops: Vec<TimerOp>,
    transmitted: Vec<MacFrame>,
    delivered: Vec<MacFrame>,
    forwarded: Vec<MacFrame>,
    failed: Vec<(MacFrame, TxFailReason)>,
    upper_ready: bool,
}

/// Context implementation passed to the MAC
struct ScopedContext<'a> {
    buffer: &'a mut ActionBuffer,
    now: f64,
    rng: &'a mut StdRng,
}

impl MacContext for ScopedContext<'_> {
    fn now(&self) -> f64 {
        self.now
    }

    fn start_timer(&mut self, timer: TimerKind, delay: f64) {
        self.buffer.timer_ops.push(TimerOp::Start(timer, delay));
    }

    fn cancel_timer(&mut self, timer: TimerKind) {
        self.buffer.timer_ops.push(TimerOp::Cancel(timer));
    }

    fn transmit(&mut self, frame: MacFrame) {
        self.buffer.transmitted.push(frame);
    }

    fn deliver_up(&mut self, frame: MacFrame) {
        self.buffer.delivered.push(frame);
    }

    fn forward(&mut self, frame: MacFrame) {
        self.buffer.forwarded.push(frame);
    }

    fn tx_failed(&mut self, frame: MacFrame, reason: TxFailReason) {
        self.buffer.failed.push((frame, reason));
    }

    fn upper_ready(&mut self) {
        self.buffer.upper_ready = true;
    }

    fn rng(&mut self) -> &mut dyn RngCore {
        &mut *self.rng
    }
}

/// Feeds transmit outcomes and airtime announcements into the metric series.
struct MetricsTap {
    station: StationId,
    pending: Rc<RefCell<Vec<(String, f64)>>>,
}

impl MacEventHandler for MetricsTap {
    fn counter_event(&mut self, id: CounterId, counters: &MacCounters) {
        if matches!(
            id,
            CounterId::MpduTxSuccessful | CounterId::MpduTxFailed | CounterId::AckFailed | CounterId::RtsFailed
        ) {
            self.pending
                .borrow_mut()
                .push((format!("{}.{}", self.station, id.name()), counters.get(id) as f64));
        }
    }

    fn channel_busy(&mut self, duration: f64) {
        self.pending
            .borrow_mut()
            .push((format!("{}.channel_busy", self.station), duration));
    }
}

pub struct Station {
    pub mac: Mac80211,
    pub x: f64,
    pub y: f64,
    pub ap: bool,
    /// Data frames handed to the upper layer.
    pub delivered: u64,
    pub tx_failed: u64,
    /// Packets refused because the interface queue was full.
    pub queue_drops: u64,
    profile: SharedPowerProfile,
    ifq: VecDeque<MacFrame>,
    /// The MAC holds a packet and has not signalled readiness yet.
    mac_busy: bool,
}

impl Station {
    fn distance_to(&self, other: &Station) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn queue_len(&self) -> usize {
        self.ifq.len()
    }
}

pub struct Simulator {
    time: f64,
    event_queue: BinaryHeap<Event>,
    event_id_counter: u64,

    config: SimConfig,
    rng: StdRng,

    pub stations: Vec<Station>,
    peer_db: Rc<RefCell<StaticPeerStatsDb>>,
    next_uid: u64,

    pub deliveries: Vec<Delivery>,
    pub tx_failures: Vec<TxFailure>,

    /// Time series recorded through the MAC event hooks.
    /// Key: metric name (e.g., "0.MPDUTxSuccessful"), Value: Vec<(time, value)>
    pub metrics: HashMap<String, Vec<(f64, f64)>>,
    pending_metrics: Rc<RefCell<Vec<(String, f64)>>>,

    pub link_events: Vec<LinkEventSummary>,

    /// Timer generations to handle cancellation.
    /// Key: (station, timer), Value: generation counter
    timer_generations: HashMap<(StationId, TimerKind), u64>,
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("time", &self.time)
            .field("stations", &self.stations.len())
            .finish_non_exhaustive()
    }
}

impl Simulator {
    /// Build one MAC per station. If a station is flagged as access point
    /// every station joins its BSS.
    pub fn new(config: SimConfig, specs: &[StationSpec], per_table: Option<Rc<PerTable>>) -> anyhow::Result<Self> {
        use rand::SeedableRng;
        let rng = StdRng::seed_from_u64(config.seed);

        let aps: Vec<usize> = specs.iter().enumerate().filter(|(_, s)| s.ap).map(|(i, _)| i).collect();
        if aps.len() > 1 {
            bail!("at most one access point is supported, found {}", aps.len());
        }
        let bss_id = aps.first().map(|&i| MacAddr(i as u32));

        let peer_db = Rc::new(RefCell::new(StaticPeerStatsDb::new(specs.len())));
        peer_db
            .borrow_mut()
            .set_verbose_counters(config.mac.mac.verbose_counters);
        let pending_metrics = Rc::new(RefCell::new(Vec::new()));

        let mut stations = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let mut mac_config = config.mac.clone();
            mac_config.station_count = specs.len();
            mac_config.bss_id = bss_id;
            let mut mac = Mac80211::new(MacAddr(i as u32), mac_config)
                .with_context(|| format!("invalid MAC configuration for station {i}"))?;

            let profile = PowerProfile::shared();
            mac.attach_power_profile(Some(profile.clone()))?;
            let db: Rc<RefCell<dyn PeerStatsDb>> = peer_db.clone();
            mac.attach_peer_stats_db(Some(db))?;
            mac.set_noise_power(config.noise_power)
                .context("invalid noise power")?;
            if let Some(table) = &per_table {
                mac.attach_per_table(Some(table.clone()))?;
            }
            mac.add_event_handler(Box::new(MetricsTap {
                station: i,
                pending: pending_metrics.clone(),
            }));
            if let RateAdaptation::Arf(arf) = &config.rate_adaptation {
                let arf = Arf::new(MacAddr(i as u32), arf.clone(), config.mac.data_mode)
                    .context("invalid ARF configuration")?;
                mac.add_event_handler(Box::new(arf));
            }

            stations.push(Station {
                mac,
                x: spec.x,
                y: spec.y,
                ap: spec.ap,
                delivered: 0,
                tx_failed: 0,
                queue_drops: 0,
                profile,
                ifq: VecDeque::new(),
                mac_busy: false,
            });
        }

        Ok(Self {
            time: 0.0,
            event_queue: BinaryHeap::new(),
            event_id_counter: 0,
            config,
            rng,
            stations,
            peer_db,
            next_uid: 1,
            deliveries: Vec::new(),
            tx_failures: Vec::new(),
            metrics: HashMap::new(),
            pending_metrics,
            link_events: Vec::new(),
            timer_generations: HashMap::new(),
        })
    }

    /// Expose current simulation config (for diagnostics)
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Return a slice of (time, value) samples for a named metric, if present.
    pub fn metric_series(&self, name: &str) -> Option<&[(f64, f64)]> {
        self.metrics.get(name).map(|v| v.as_slice())
    }

    /// One line per (src, dst) pair that exchanged frames.
    pub fn peer_stats_dump(&self) -> Vec<String> {
        self.peer_db.borrow().dump()
    }

    fn push_event(&mut self, time: f64, event_type: EventType) {
        self.event_queue.push(Event {
            time,
            event_type,
            id: self.event_id_counter,
        });
        self.event_id_counter += 1;
    }

    /// Queue a `size`-byte packet at `src` for `dst` (broadcast when `None`).
    pub fn schedule_send(&mut self, time: f64, src: StationId, dst: Option<StationId>, size: u32) -> anyhow::Result<()> {
        let n = self.stations.len();
        if src >= n || dst.is_some_and(|d| d >= n) {
            bail!("send from {src} to {dst:?}: only {n} stations");
        }
        let dst = dst.map_or(MacAddr::BROADCAST, |d| MacAddr(d as u32));
        let mut frame = MacFrame::data(MacAddr(src as u32), dst, size, Bytes::new());
        frame.uid = self.next_uid;
        self.next_uid += 1;
        self.push_event(time, EventType::AppSend { station: src, frame });
        Ok(())
    }

    pub fn schedule_reset_idle_slots(&mut self, time: f64) {
        self.push_event(time, EventType::ResetIdleSlots);
    }

    pub fn peek_next_event_time(&self) -> Option<f64> {
        self.event_queue.peek().map(|e| e.time)
    }

    pub fn current_time(&self) -> f64 {
        self.time
    }

    pub fn remaining_events(&self) -> usize {
        self.event_queue.len()
    }

    /// Process the next event. Returns false if the queue is empty. A MAC
    /// invariant violation aborts the run with an error.
    pub fn step(&mut self) -> anyhow::Result<bool> {
        let event = match self.event_queue.pop() {
            Some(e) => e,
            None => return Ok(false),
        };

        self.time = event.time;
        debug!("Processing event at {:.9}: {:?}", self.time, event.event_type);

        match event.event_type {
            EventType::FrameArrival { to, frame } => {
                self.dispatch(to, |mac, ctx| mac.recv(ctx, frame))?;
            }
            EventType::PowerChange { station, delta } => {
                self.stations[station]
                    .profile
                    .borrow_mut()
                    .add_element(self.time, delta);
            }
            EventType::TimerExpiry {
                station,
                kind,
                generation,
            } => {
                // Check if this timer event is still valid by comparing generations
                let current = self.timer_generations.get(&(station, kind)).copied();
                if current != Some(generation) {
                    debug!("Skipping cancelled {:?} timer of station {}", kind, station);
                    return Ok(true); // Event processed (by being ignored)
                }
                self.dispatch(station, |mac, ctx| mac.handle_timer(ctx, kind))?;
            }
            EventType::AppSend { station, frame } => {
                self.enqueue(station, frame);
                self.try_dequeue(station)?;
            }
            EventType::ResetIdleSlots => {
                for station in &mut self.stations {
                    station.mac.reset_idle_slots();
                }
            }
        }
        Ok(true)
    }

    /// Process events until the queue drains or the configured duration is reached.
    pub fn run(&mut self) -> anyhow::Result<()> {
        while let Some(t) = self.peek_next_event_time() {
            if t > self.config.duration {
                break;
            }
            self.step()?;
        }
        Ok(())
    }

    /// Log every station's counters.
    pub fn print_counters(&self) {
        for station in &self.stations {
            station.mac.print_mac_counters(self.time);
        }
    }

    /// Produce a serializable snapshot of the current simulation state.
    pub fn export_report(&self) -> SimulationReport {
        let verbose = self.config.mac.mac.verbose_counters;
        SimulationReport {
            config: self.config.clone(),
            duration: self.time,
            stations: self
                .stations
                .iter()
                .enumerate()
                .map(|(id, s)| StationReport {
                    id,
                    x: s.x,
                    y: s.y,
                    ap: s.ap,
                    counters: s.mac.counters().clone(),
                    counters_string: s.mac.mac_counters(verbose),
                    delivered: s.delivered,
                    tx_failed: s.tx_failed,
                    queue_drops: s.queue_drops,
                })
                .collect(),
            deliveries: self.deliveries.clone(),
            tx_failures: self.tx_failures.clone(),
            peer_stats: self.peer_stats_dump(),
            metrics: self.metrics.clone(),
            link_events: self.link_events.clone(),
        }
    }

    /// Run one MAC callback and apply what it asked for.
    fn dispatch<F>(&mut self, station: StationId, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Mac80211, &mut dyn MacContext) -> Result<(), MacError>,
    {
        let mut buffer = ActionBuffer::default();
        let result = {
            let mut ctx = ScopedContext {
                buffer: &mut buffer,
                now: self.time,
                rng: &mut self.rng,
            };
            f(&mut self.stations[station].mac, &mut ctx)
        };
        result.with_context(|| format!("station {} at t={:.9}", station, self.time))?;
        self.process_actions(station, buffer)
    }

    fn enqueue(&mut self, station: StationId, frame: MacFrame) {
        let limit = self.config.queue_limit;
        let s = &mut self.stations[station];
        if s.ifq.len() >= limit {
            s.queue_drops += 1;
            warn!("station {} interface queue full, dropping {}", station, frame);
            self.link_events.push(LinkEventSummary {
                time: self.time,
                description: format!("[{station}] DROP (queue full) {frame}"),
            });
            return;
        }
        s.ifq.push_back(frame);
    }

    /// Hand the next queued packet to an idle MAC.
    fn try_dequeue(&mut self, station: StationId) -> anyhow::Result<()> {
        let s = &mut self.stations[station];
        if s.mac_busy {
            return Ok(());
        }
        let Some(frame) = s.ifq.pop_front() else {
            return Ok(());
        };
        s.mac_busy = true;
        self.dispatch(station, |mac, ctx| mac.send(ctx, frame))
    }

    fn process_actions(&mut self, source: StationId, buffer: ActionBuffer) -> anyhow::Result<()> {
        // First, fold metrics into simulator-wide store
        let pending: Vec<(String, f64)> = self.pending_metrics.borrow_mut().drain(..).collect();
        for (name, value) in pending {
            self.metrics.entry(name).or_default().push((self.time, value));
        }

        for op in buffer.timer_ops {
            match op {
                TimerOp::Cancel(kind) => {
                    // Increment the generation to invalidate existing timer events
                    *self.timer_generations.entry((source, kind)).or_insert(0) += 1;
                }
                TimerOp::Start(kind, delay) => {
                    let generation = *self.timer_generations.entry((source, kind)).or_insert(0);
                    self.push_event(
                        self.time + delay,
                        EventType::TimerExpiry {
                            station: source,
                            kind,
                            generation,
                        },
                    );
                }
            }
        }

        for frame in buffer.transmitted {
            self.propagate(source, frame);
        }

        for frame in buffer.delivered {
            info!("[{}] DELIVERED {} bytes from {}", source, frame.size, frame.ta);
            self.link_events.push(LinkEventSummary {
                time: self.time,
                description: format!("[{}] DELIVERED uid={} {} bytes from {}", source, frame.uid, frame.size, frame.ta),
            });
            self.stations[source].delivered += 1;
            self.deliveries.push(Delivery {
                time: self.time,
                station: source,
                from: frame.ta.0,
                origin: frame.addr3.0,
                uid: frame.uid,
                size: frame.size,
            });
        }

        for (frame, reason) in buffer.failed {
            warn!("[{}] gave up on uid={} to {} ({:?})", source, frame.uid, frame.ra, reason);
            self.link_events.push(LinkEventSummary {
                time: self.time,
                description: format!("[{}] FAILED uid={} to {} ({:?})", source, frame.uid, frame.ra, reason),
            });
            self.stations[source].tx_failed += 1;
            self.tx_failures.push(TxFailure {
                time: self.time,
                station: source,
                dst: frame.ra.0,
                uid: frame.uid,
                size: frame.size,
                reason,
            });
        }

        for frame in buffer.forwarded {
            self.link_events.push(LinkEventSummary {
                time: self.time,
                description: format!("[{}] RELAY uid={} to {}", source, frame.uid, frame.ra),
            });
            self.enqueue(source, frame);
        }

        if buffer.upper_ready {
            self.stations[source].mac_busy = false;
        }
        self.try_dequeue(source)
    }

    /// Free-space received power of a `tx_power` transmission over `d` metres.
    pub fn friis(&self, d: f64) -> f64 {
        let lambda = SPEED_OF_LIGHT / self.config.frequency;
        let d = d.max(1e-3);
        self.config.tx_power * lambda * lambda
            / ((4.0 * std::f64::consts::PI).powi(2) * d * d * self.config.system_loss)
    }

    /// Put a frame on the air: every station that can sense it sees the
    /// power rise, receives the frame, and sees the power fall again.
    fn propagate(&mut self, source: StationId, frame: MacFrame) {
        debug!("[{}] TX {}", source, frame);
        self.link_events.push(LinkEventSummary {
            time: self.time,
            description: format!("[{source}] TX {frame}"),
        });

        for to in 0..self.stations.len() {
            if to == source {
                continue;
            }
            let d = self.stations[source].distance_to(&self.stations[to]);
            let pr = self.friis(d);
            if pr < self.config.cs_threshold {
                continue;
            }
            let arrival = self.time + d / SPEED_OF_LIGHT;
            let mut copy = frame.clone();
            copy.rx.power = pr;
            copy.rx.error = false;
            self.push_event(arrival, EventType::PowerChange { station: to, delta: pr });
            self.push_event(arrival + frame.txtime, EventType::PowerChange { station: to, delta: -pr });
            self.push_event(arrival, EventType::FrameArrival { to, frame: copy });
        }
    }
}
