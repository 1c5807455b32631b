//! Multi-rate 802.11 DCF MAC with RTS/CTS, driven entirely by callbacks
//! from the simulator through a [`MacContext`].

mod rx;
mod tx;


use mr80211_abstract::{MacAddr, MacConfig, MacContext, MacFrame, PhyMode, TimerKind};
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, MacError};
use crate::error_model::ChannelErrorModel;
use crate::mib::{CounterId, MacCounters, RxCounter};
use crate::peerstats::PeerStatsDb;
use crate::per::PerTable;
use crate::power_profile::SharedPowerProfile;
use crate::timers::MacTimers;

/// Upper bound of the propagation delay assumed by response timeouts.
pub const MAX_PROPAGATION_DELAY: f64 = 2e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MacState {
    Idle,
    Recv,
    Coll,
    Rts,
    Cts,
    Send,
    Ack,
}

/// How an update of the expected end of the busy period is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleUpdate {
    /// Only move the estimate forward.
    Normal,
    /// Overwrite the estimate; a later forced update may roll it back.
    Weak,
    /// Commit the estimate, never below the last normal update.
    Forced,
}

/// Hooks for rate adaptation and monitoring.
pub trait MacEventHandler {
    fn counter_event(&mut self, _id: CounterId, _counters: &MacCounters) {}

    /// The MAC is about to occupy the medium for `duration` seconds.
    fn channel_busy(&mut self, _duration: f64) {}

    /// Called at `now` before a data frame is framed. Returning a mode
    /// switches the MAC's data mode.
    fn before_send_data(&mut self, _now: f64, _frame: &MacFrame, _data_mode: PhyMode) -> Option<PhyMode> {
        None
    }
}

/// Runtime configuration commands.
#[derive(Debug, Clone, PartialEq)]
pub enum MacCommand {
    AddPerEntry {
        mode: String,
        len: u32,
        snr: f64,
        per: f64,
    },
    SetNoisePower(f64),
    SetDebugLevel(u8),
    SetBasicMode(String),
    SetDataMode(String),
    SetBssId(MacAddr),
    ConfigureStationTable(usize),
    SetRtsThreshold(u32),
    SetShortRetryLimit(u32),
    SetLongRetryLimit(u32),
    ResetIdleSlots,
}

/// Round to whole microseconds for a duration field. Durations past the
/// 16 bit field saturate.
pub(crate) fn usec(t: f64) -> u16 {
    let us = (t * 1e6 + 0.5).floor();
    if us > f64::from(u16::MAX) {
        warn!("duration {:.6} s overflows the duration field, saturating", t);
        return u16::MAX;
    }
    us as u16
}

pub(crate) fn sec(us: u16) -> f64 {
    f64::from(us) * 1e-6
}

fn validate(config: &MacConfig) -> Result<(), ConfigError> {
    let phy = &config.phy;
    if phy.cw_min == 0 {
        return Err(ConfigError::InvalidValue {
            name: "cw_min",
            reason: "must be at least 1".into(),
        });
    }
    if phy.cw_max < phy.cw_min {
        return Err(ConfigError::InvalidValue {
            name: "cw_max",
            reason: format!("{} is below cw_min {}", phy.cw_max, phy.cw_min),
        });
    }
    if phy.slot_time.is_nan() || phy.slot_time <= 0.0 || phy.sifs.is_nan() || phy.sifs < 0.0 {
        return Err(ConfigError::InvalidValue {
            name: "slot_time/sifs",
            reason: format!("slot={} sifs={}", phy.slot_time, phy.sifs),
        });
    }
    if config.mac.short_retry_limit == 0 || config.mac.long_retry_limit == 0 {
        return Err(ConfigError::InvalidValue {
            name: "retry limit",
            reason: "must be at least 1".into(),
        });
    }
    for mode in [config.basic_mode, config.data_mode] {
        mode.phy_header_duration(false)?;
    }
    Ok(())
}

pub struct Mac80211 {
    addr: MacAddr,
    config: MacConfig,

    tx_state: MacState,
    rx_state: MacState,
    /// Our transmitter is on the air.
    tx_active: bool,
    cw: u32,
    ssrc: u32,
    slrc: u32,
    nav: f64,
    /// Start of the reception we are synchronized on.
    rx_time: f64,
    start_idle_time: f64,
    start_idle2_time: f64,
    start_idle2_time_min: f64,
    sta_seqno: u16,
    seq_cache: Vec<u16>,
    seq_cache_warnings: u32,
    callback_pending: bool,

    pkt_rts: Option<MacFrame>,
    pkt_ctrl: Option<MacFrame>,
    pkt_tx: Option<MacFrame>,
    pkt_rx: Option<MacFrame>,

    timers: MacTimers,
    counters: MacCounters,
    ap_snr: f64,
    ap_ack_mode: PhyMode,

    noise_power: f64,
    error_model: Option<ChannelErrorModel>,
    profile: Option<SharedPowerProfile>,
    peer_db: Option<Rc<RefCell<dyn PeerStatsDb>>>,
    handlers: Vec<Box<dyn MacEventHandler>>,
}

impl Mac80211 {
    pub fn new(addr: MacAddr, config: MacConfig) -> Result<Self, ConfigError> {
        validate(&config)?;
        let seq_cache = vec![0; config.station_count];
        Ok(Self {
            addr,
            tx_state: MacState::Idle,
            rx_state: MacState::Idle,
            tx_active: false,
            cw: config.phy.cw_min,
            ssrc: 0,
            slrc: 0,
            nav: 0.0,
            rx_time: 0.0,
            start_idle_time: 0.0,
            start_idle2_time: 0.0,
            start_idle2_time_min: 0.0,
            sta_seqno: 1,
            seq_cache,
            seq_cache_warnings: 0,
            callback_pending: false,
            pkt_rts: None,
            pkt_ctrl: None,
            pkt_tx: None,
            pkt_rx: None,
            timers: MacTimers::new(config.phy.slot_time),
            counters: MacCounters::new(),
            ap_snr: 0.0,
            ap_ack_mode: PhyMode::Unknown,
            noise_power: 0.0,
            error_model: None,
            profile: None,
            peer_db: None,
            handlers: Vec::new(),
            config,
        })
    }

    // ---- configuration ----

    pub fn attach_power_profile(&mut self, profile: Option<SharedPowerProfile>) -> Result<(), ConfigError> {
        let profile = profile.ok_or(ConfigError::MissingCollaborator("power profile"))?;
        self.profile = Some(profile);
        Ok(())
    }

    pub fn attach_per_table(&mut self, table: Option<Rc<PerTable>>) -> Result<(), ConfigError> {
        let table = table.ok_or(ConfigError::MissingCollaborator("PER table"))?;
        let mut model = ChannelErrorModel::with_noise(table, self.noise_power)?;
        model.set_debug_level(self.config.debug_level);
        self.error_model = Some(model);
        Ok(())
    }

    pub fn attach_peer_stats_db(&mut self, db: Option<Rc<RefCell<dyn PeerStatsDb>>>) -> Result<(), ConfigError> {
        let db = db.ok_or(ConfigError::MissingCollaborator("peer stats database"))?;
        self.peer_db = Some(db);
        Ok(())
    }

    pub fn add_event_handler(&mut self, handler: Box<dyn MacEventHandler>) {
        self.handlers.push(handler);
    }

    /// Add a calibration point to the attached PER table, creating one if
    /// needed. A table shared with other MACs is copied first.
    pub fn add_per_entry(&mut self, mode: &str, len: u32, snr: f64, per: f64) -> Result<(), ConfigError> {
        let mut table = match self.error_model.take() {
            Some(model) => model.into_table(),
            None => Rc::new(PerTable::new()),
        };
        let result = Rc::make_mut(&mut table).add_per_entry(mode, len, snr, per);
        self.attach_per_table(Some(table))?;
        result
    }

    pub fn set_noise_power(&mut self, watts: f64) -> Result<(), ConfigError> {
        if let Some(model) = self.error_model.as_mut() {
            model.set_noise_power(watts)?;
        } else if !watts.is_finite() || watts < 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "noise power",
                reason: format!("{watts} W"),
            });
        }
        self.noise_power = watts;
        Ok(())
    }

    pub fn set_debug_level(&mut self, level: u8) {
        self.config.debug_level = level;
        if let Some(model) = self.error_model.as_mut() {
            model.set_debug_level(level);
        }
    }

    pub fn set_basic_mode(&mut self, mode: &str) -> Result<(), ConfigError> {
        self.config.basic_mode = mode.parse()?;
        Ok(())
    }

    pub fn set_data_mode(&mut self, mode: &str) -> Result<(), ConfigError> {
        self.config.data_mode = mode.parse()?;
        Ok(())
    }

    pub fn set_bss_id(&mut self, bss_id: MacAddr) {
        self.config.bss_id = Some(bss_id);
    }

    /// Size the duplicate detection cache for stations `0..count`.
    pub fn configure_station_table(&mut self, count: usize) {
        self.config.station_count = count;
        self.seq_cache = vec![0; count];
    }

    pub fn reset_idle_slots(&mut self) {
        self.counters.reset_idle_slots();
    }

    pub fn apply(&mut self, command: MacCommand) -> Result<(), ConfigError> {
        match command {
            MacCommand::AddPerEntry { mode, len, snr, per } => self.add_per_entry(&mode, len, snr, per)?,
            MacCommand::SetNoisePower(w) => self.set_noise_power(w)?,
            MacCommand::SetDebugLevel(level) => self.set_debug_level(level),
            MacCommand::SetBasicMode(mode) => self.set_basic_mode(&mode)?,
            MacCommand::SetDataMode(mode) => self.set_data_mode(&mode)?,
            MacCommand::SetBssId(id) => self.set_bss_id(id),
            MacCommand::ConfigureStationTable(n) => self.configure_station_table(n),
            MacCommand::SetRtsThreshold(v) => self.config.mac.rts_threshold = v,
            MacCommand::SetShortRetryLimit(v) | MacCommand::SetLongRetryLimit(v) if v == 0 => {
                return Err(ConfigError::InvalidValue {
                    name: "retry limit",
                    reason: "must be at least 1".into(),
                });
            }
            MacCommand::SetShortRetryLimit(v) => self.config.mac.short_retry_limit = v,
            MacCommand::SetLongRetryLimit(v) => self.config.mac.long_retry_limit = v,
            MacCommand::ResetIdleSlots => self.reset_idle_slots(),
        }
        Ok(())
    }

    // ---- queries ----

    pub fn addr(&self) -> MacAddr {
        self.addr
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    pub fn counters(&self) -> &MacCounters {
        &self.counters
    }

    pub fn tx_state(&self) -> MacState {
        self.tx_state
    }

    pub fn rx_state(&self) -> MacState {
        self.rx_state
    }

    pub fn cw(&self) -> u32 {
        self.cw
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn slrc(&self) -> u32 {
        self.slrc
    }

    pub fn nav(&self) -> f64 {
        self.nav
    }

    pub fn timers(&self) -> &MacTimers {
        &self.timers
    }

    pub fn pending_data(&self) -> Option<&MacFrame> {
        self.pkt_tx.as_ref()
    }

    pub fn pending_rts(&self) -> Option<&MacFrame> {
        self.pkt_rts.as_ref()
    }

    /// SNR (dB) of the last frame heard from our access point.
    pub fn ap_snr(&self) -> f64 {
        self.ap_snr
    }

    /// Mode of the last ACK received from our access point.
    pub fn ap_ack_mode(&self) -> PhyMode {
        self.ap_ack_mode
    }

    /// Last SNR (dB) measured on a frame `peer` sent to us.
    pub fn snr_from(&self, peer: MacAddr) -> Result<f64, ConfigError> {
        let db = self
            .peer_db
            .as_ref()
            .ok_or(ConfigError::MissingCollaborator("peer stats database"))?;
        let snr = db.borrow_mut().get_peer_stats(peer, self.addr).snr;
        Ok(snr)
    }

    pub fn mac_counters(&self, verbose: bool) -> String {
        self.counters.counters_string(verbose)
    }

    pub fn print_mac_counters(&self, now: f64) {
        info!(
            "MAC counters node {} at {:2.9} \t{}",
            self.addr,
            now,
            self.mac_counters(self.config.mac.verbose_counters)
        );
    }

    pub fn is_idle(&self, now: f64) -> bool {
        self.rx_state == MacState::Idle && self.tx_state == MacState::Idle && self.nav <= now
    }

    // ---- timer dispatch ----

    pub fn handle_timer(&mut self, ctx: &mut dyn MacContext, kind: TimerKind) -> Result<(), MacError> {
        self.timers.expired(kind);
        match kind {
            TimerKind::Backoff => self.backoff_handler(ctx),
            TimerKind::Defer => self.defer_handler(ctx),
            TimerKind::Send => self.send_timer(ctx),
            TimerKind::Recv => self.recv_timer(ctx),
            TimerKind::Nav => self.nav_handler(ctx),
            TimerKind::Interface => {
                self.tx_active = false;
                Ok(())
            }
        }
    }

    fn nav_handler(&mut self, ctx: &mut dyn MacContext) -> Result<(), MacError> {
        let now = ctx.now();
        if self.is_idle(now) && self.timers.backoff.paused() {
            self.timers.backoff.resume(ctx, self.config.phy.difs())?;
        }
        if !self.is_idle(now) && self.tx_state == MacState::Idle && self.rx_state == MacState::Idle {
            self.start_idle_time = now;
        }
        Ok(())
    }

    // ---- channel state bookkeeping ----

    fn check_backoff_timer(&mut self, ctx: &mut dyn MacContext) -> Result<(), MacError> {
        let idle = self.is_idle(ctx.now());
        if idle && self.timers.backoff.paused() {
            self.timers.backoff.resume(ctx, self.config.phy.difs())?;
        }
        if !idle && self.timers.backoff.busy() && !self.timers.backoff.paused() {
            self.timers.backoff.pause(ctx)?;
        }
        Ok(())
    }

    fn idle_bookkeeping(&mut self, now: f64, new_state: MacState) {
        let idle = self.is_idle(now);
        if !idle && new_state == MacState::Idle {
            self.start_idle_time = now;
        }
        if idle && new_state != MacState::Idle {
            let slots = ((now - self.start_idle_time) / self.config.phy.slot_time).max(0.0) as u64;
            self.add_idle_slots(CounterId::IdleSlots, slots);
        }
    }

    fn set_rx_state(&mut self, ctx: &mut dyn MacContext, state: MacState) -> Result<(), MacError> {
        self.idle_bookkeeping(ctx.now(), state);
        self.rx_state = state;
        if self.config.debug_level > 1 {
            debug!("{:.9} node {} rx state -> {:?}", ctx.now(), self.addr, state);
        }
        self.check_backoff_timer(ctx)
    }

    fn set_tx_state(&mut self, ctx: &mut dyn MacContext, state: MacState) -> Result<(), MacError> {
        self.idle_bookkeeping(ctx.now(), state);
        self.tx_state = state;
        if self.config.debug_level > 1 {
            debug!("{:.9} node {} tx state -> {:?}", ctx.now(), self.addr, state);
        }
        self.check_backoff_timer(ctx)
    }

    /// Extend the NAV to `t` seconds from now.
    fn set_nav(&mut self, ctx: &mut dyn MacContext, t: f64) -> Result<(), MacError> {
        let now = ctx.now();
        if now + t > self.nav {
            self.nav = now + t;
            if self.timers.nav.busy() {
                self.timers.nav.stop(ctx)?;
            }
            self.timers.nav.start(ctx, t)?;
        }
        Ok(())
    }

    /// Track when the medium is expected to become idle again, counting
    /// the whole idle slots observed since the previous estimate.
    fn update_idle_time(&mut self, now: f64, next_idle: f64, mode: IdleUpdate) {
        let next = now + next_idle;
        if self.start_idle2_time < now {
            let slots = ((now - self.start_idle2_time) / self.config.phy.slot_time) as u64;
            self.add_idle_slots(CounterId::Idle2Slots, slots);
            self.start_idle2_time_min = now;
        }
        match mode {
            IdleUpdate::Forced => {
                self.start_idle2_time_min = next.max(self.start_idle2_time_min);
                self.start_idle2_time = self.start_idle2_time_min;
            }
            IdleUpdate::Normal => {
                if next > self.start_idle2_time {
                    self.start_idle2_time_min = next;
                    self.start_idle2_time = next;
                }
            }
            IdleUpdate::Weak => self.start_idle2_time = next,
        }
    }

    fn inc_cw(&mut self) {
        self.cw = (self.cw << 1).min(self.config.phy.cw_max);
    }

    fn rst_cw(&mut self) {
        self.cw = self.config.phy.cw_min;
    }

    // ---- counters ----

    fn notify(&mut self, id: CounterId) {
        for handler in &mut self.handlers {
            handler.counter_event(id, &self.counters);
        }
    }

    fn add_idle_slots(&mut self, id: CounterId, slots: u64) {
        self.counters.add(id, slots);
        self.notify(id);
    }

    /// Transmit-side counter, mirrored under (self, dst).
    fn count_tx(&mut self, id: CounterId, dst: MacAddr) {
        self.counters.inc(id);
        if let Some(db) = &self.peer_db {
            db.borrow_mut().get_peer_stats(self.addr, dst).counters.inc(id);
        }
        self.notify(id);
    }

    /// Receive-side counter, mirrored under (src, self).
    fn count_rx(&mut self, id: CounterId, src: MacAddr) {
        self.counters.inc(id);
        if let Some(db) = &self.peer_db {
            db.borrow_mut().get_peer_stats(src, self.addr).counters.inc(id);
        }
        self.notify(id);
    }

    fn count_rx_family(&mut self, family: RxCounter, src: MacAddr, frame: &MacFrame) {
        self.counters.inc_rx(family, frame.fc.frame_type);
        if let Some(db) = &self.peer_db {
            db.borrow_mut()
                .get_peer_stats(src, self.addr)
                .counters
                .inc_rx(family, frame.fc.frame_type);
        }
        let (total, _) = family.ids(frame.fc.frame_type);
        self.notify(total);
    }

    fn count_frame_error(&mut self, src: MacAddr, frame: &MacFrame, noise: bool) {
        self.counters.inc_rx(RxCounter::Errors, frame.fc.frame_type);
        if noise {
            self.counters.inc_rx(RxCounter::ErrorsNoise, frame.fc.frame_type);
        }
        if let Some(db) = &self.peer_db {
            let mut db = db.borrow_mut();
            let ps = db.get_peer_stats(src, self.addr);
            ps.counters.inc_rx(RxCounter::Errors, frame.fc.frame_type);
            if noise {
                ps.counters.inc_rx(RxCounter::ErrorsNoise, frame.fc.frame_type);
            }
        }
        self.notify(CounterId::FrameErrors);
    }

    fn warn_seq_cache(&mut self, src: MacAddr) {
        self.seq_cache_warnings += 1;
        if self.seq_cache_warnings <= 10 {
            warn!(
                "node {}: source {} outside the duplicate cache of {} stations",
                self.addr,
                src,
                self.seq_cache.len()
            );
            if self.seq_cache_warnings == 10 {
                warn!("suppressing further duplicate cache warnings");
            }
        }
    }
}
