use mr80211_abstract::{
    ACK_LEN, CTS_LEN, FrameControl, FrameSubtype, FrameType, MAC_HDR_LEN, MacAddr, MacContext, MacFrame, PhyMode,
    RTS_LEN, TxFailReason,
};
use tracing::debug;

use super::{IdleUpdate, MAX_PROPAGATION_DELAY, Mac80211, MacState, sec, usec};
use crate::error::MacError;
use crate::mib::CounterId;

impl Mac80211 {
    /// Accept a packet from the upper layer. Only one packet may be
    /// outstanding; the MAC calls [`MacContext::upper_ready`] once it is done
    /// with it.
    pub fn send(&mut self, ctx: &mut dyn MacContext, frame: MacFrame) -> Result<(), MacError> {
        if self.pkt_tx.is_some() {
            return Err(MacError::invariant("send() with a data frame already pending"));
        }
        self.callback_pending = true;
        self.send_data(ctx.now(), frame)?;
        let ra = self.pkt_tx.as_ref().map(|f| f.ra).unwrap_or(MacAddr::BROADCAST);
        self.send_rts(ra)?;

        let seqno = self.sta_seqno;
        self.sta_seqno = match self.sta_seqno.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        if let Some(data) = self.pkt_tx.as_mut() {
            data.seqno = seqno;
        }

        if !self.timers.backoff.busy() {
            let idle = self.is_idle(ctx.now());
            self.timers.backoff.start(ctx, self.cw, idle, self.config.phy.difs())?;
        }
        Ok(())
    }

    fn txtime(&self, bytes: u32, mode: PhyMode) -> Result<f64, MacError> {
        Ok(self.config.phy.txtime(bytes, mode)?)
    }

    fn ack_time(&self) -> Result<f64, MacError> {
        self.txtime(ACK_LEN, self.config.basic_mode)
    }

    fn cts_time(&self) -> Result<f64, MacError> {
        self.txtime(CTS_LEN, self.config.basic_mode)
    }

    /// Mode, airtime and duration field of a framed data frame.
    fn data_timing(&self, frame: &mut MacFrame) -> Result<(), MacError> {
        if frame.is_broadcast() {
            frame.mode = self.config.basic_mode;
            frame.txtime = self.txtime(frame.size, frame.mode)?;
            frame.duration = 0;
        } else {
            frame.mode = self.config.data_mode;
            frame.txtime = self.txtime(frame.size, frame.mode)?;
            frame.duration = usec(self.ack_time()? + self.config.phy.sifs);
        }
        Ok(())
    }

    fn rts_timing(&self, rts: &mut MacFrame, data_txtime: f64) -> Result<(), MacError> {
        let sifs = self.config.phy.sifs;
        rts.mode = self.config.basic_mode;
        rts.txtime = self.txtime(RTS_LEN, rts.mode)?;
        rts.duration = usec(sifs + self.cts_time()? + sifs + data_txtime + sifs + self.ack_time()?);
        Ok(())
    }

    fn uses_rts(&self, frame: &MacFrame) -> bool {
        frame.size >= self.config.mac.rts_threshold && !frame.is_broadcast()
    }

    fn send_data(&mut self, now: f64, mut frame: MacFrame) -> Result<(), MacError> {
        for handler in &mut self.handlers {
            if let Some(mode) = handler.before_send_data(now, &frame, self.config.data_mode) {
                if mode.phy_header_duration(false).is_ok() {
                    self.config.data_mode = mode;
                }
            }
        }

        frame.size += MAC_HDR_LEN;
        frame.fc = FrameControl::new(FrameType::Data, FrameSubtype::Data);
        frame.ta = self.addr;
        if let Some(bss) = self.config.bss_id {
            if bss != self.addr && !frame.is_broadcast() {
                frame.addr3 = frame.ra;
                frame.ra = bss;
            }
        }
        self.data_timing(&mut frame)?;
        self.pkt_tx = Some(frame);
        Ok(())
    }

    fn send_rts(&mut self, dst: MacAddr) -> Result<(), MacError> {
        let Some(data) = self.pkt_tx.as_ref() else {
            return Err(MacError::invariant("RTS without a data frame"));
        };
        if data.size < self.config.mac.rts_threshold || dst.is_broadcast() {
            return Ok(());
        }
        if self.pkt_rts.is_some() {
            return Err(MacError::invariant("RTS slot already occupied"));
        }
        let mut rts = MacFrame::rts(dst, self.addr);
        self.rts_timing(&mut rts, data.txtime)?;
        self.pkt_rts = Some(rts);
        Ok(())
    }

    /// Answer an RTS whose duration field was `rts_duration` microseconds.
    pub(super) fn send_cts(&mut self, dst: MacAddr, rts_duration: u16) -> Result<(), MacError> {
        if self.pkt_ctrl.is_some() {
            return Err(MacError::invariant("control slot already occupied"));
        }
        let mut cts = MacFrame::cts(dst, self.addr);
        cts.mode = self.config.basic_mode;
        cts.txtime = self.txtime(CTS_LEN, cts.mode)?;
        cts.duration = usec(sec(rts_duration) - self.config.phy.sifs - cts.txtime);
        self.pkt_ctrl = Some(cts);
        Ok(())
    }

    pub(super) fn send_ack(&mut self, dst: MacAddr) -> Result<(), MacError> {
        if self.pkt_ctrl.is_some() {
            return Err(MacError::invariant("control slot already occupied"));
        }
        let mut ack = MacFrame::ack(dst, self.addr);
        ack.mode = self.config.basic_mode;
        ack.txtime = self.txtime(ACK_LEN, ack.mode)?;
        ack.duration = 0;
        self.pkt_ctrl = Some(ack);
        Ok(())
    }

    /// Returns whether a pending CTS or ACK was dealt with.
    fn check_pkt_ctrl(&mut self, ctx: &mut dyn MacContext) -> Result<bool, MacError> {
        let Some((subtype, txtime, duration)) = self.pkt_ctrl.as_ref().map(|f| (f.fc.subtype, f.txtime, f.duration))
        else {
            return Ok(false);
        };
        if matches!(self.tx_state, MacState::Cts | MacState::Ack) {
            return Ok(false);
        }
        let (state, timeout) = match subtype {
            FrameSubtype::Cts => {
                if !self.is_idle(ctx.now()) {
                    let cts = self.pkt_ctrl.take();
                    self.discard(cts.as_ref(), "medium busy");
                    return Ok(true);
                }
                let timeout = txtime + MAX_PROPAGATION_DELAY + sec(duration) + MAX_PROPAGATION_DELAY
                    - self.config.phy.sifs
                    - self.ack_time()?;
                (MacState::Cts, timeout)
            }
            FrameSubtype::Ack => (MacState::Ack, txtime),
            other => {
                return Err(MacError::invariant(format!("invalid control subtype {other:?} queued")));
            }
        };
        self.set_tx_state(ctx, state)?;
        let Some(frame) = self.pkt_ctrl.clone() else {
            return Err(MacError::invariant("control frame vanished"));
        };
        self.transmit(ctx, frame, timeout)?;
        Ok(true)
    }

    fn check_pkt_rts(&mut self, ctx: &mut dyn MacContext) -> Result<bool, MacError> {
        if self.timers.backoff.busy() {
            return Err(MacError::invariant("RTS checked while backing off"));
        }
        let Some(mut rts) = self.pkt_rts.take() else {
            return Ok(false);
        };
        let data_txtime = self.pkt_tx.as_ref().map(|f| f.txtime).unwrap_or(0.0);
        self.rts_timing(&mut rts, data_txtime)?;

        if !self.is_idle(ctx.now()) {
            self.pkt_rts = Some(rts);
            self.inc_cw();
            self.timers.backoff.start(ctx, self.cw, false, 0.0)?;
            return Ok(true);
        }
        let sifs = self.config.phy.sifs;
        let timeout = rts.txtime + MAX_PROPAGATION_DELAY + sifs + self.cts_time()? + MAX_PROPAGATION_DELAY;
        let busy_for = rts.txtime + sec(rts.duration);
        let frame = rts.clone();
        self.pkt_rts = Some(rts);
        self.set_tx_state(ctx, MacState::Rts)?;
        for handler in &mut self.handlers {
            handler.channel_busy(busy_for);
        }
        self.transmit(ctx, frame, timeout)?;
        Ok(true)
    }

    fn check_pkt_tx(&mut self, ctx: &mut dyn MacContext) -> Result<bool, MacError> {
        let Some(mut data) = self.pkt_tx.take() else {
            return Ok(false);
        };
        self.data_timing(&mut data)?;
        let ra = data.ra;
        let uses_rts = self.uses_rts(&data);
        let broadcast = data.is_broadcast();

        if !self.is_idle(ctx.now()) {
            self.pkt_tx = Some(data);
            self.send_rts(ra)?;
            self.inc_cw();
            self.timers.backoff.start(ctx, self.cw, false, 0.0)?;
            return Ok(true);
        }

        let timeout = if broadcast {
            data.txtime
        } else {
            let sifs = self.config.phy.sifs;
            data.txtime + MAX_PROPAGATION_DELAY + sifs + self.ack_time()? + MAX_PROPAGATION_DELAY
        };
        let busy_for = data.txtime + sec(data.duration);
        let frame = data.clone();
        self.pkt_tx = Some(data);
        self.set_tx_state(ctx, MacState::Send)?;
        if !uses_rts {
            for handler in &mut self.handlers {
                handler.channel_busy(busy_for);
            }
        }
        self.transmit(ctx, frame, timeout)?;
        Ok(true)
    }

    fn transmit(&mut self, ctx: &mut dyn MacContext, frame: MacFrame, timeout: f64) -> Result<(), MacError> {
        self.tx_active = true;
        if self.rx_state != MacState::Idle {
            let Some(rx) = self.pkt_rx.as_mut() else {
                return Err(MacError::invariant("receiving without a frame"));
            };
            rx.rx.error = true;
        }

        let now = ctx.now();
        let phy = &self.config.phy;
        let (difs, eifs, slot) = (phy.difs(), phy.eifs(), phy.slot_time);
        self.update_idle_time(now, frame.txtime + difs + slot, IdleUpdate::Normal);
        if !frame.is_broadcast() {
            self.update_idle_time(now, frame.txtime + eifs + slot, IdleUpdate::Weak);
        }

        if self.config.debug_level > 1 {
            debug!("{:.9} node {} tx {}", now, self.addr, frame);
        }
        let txtime = frame.txtime;
        ctx.transmit(frame);
        self.timers.send.start(ctx, timeout)?;
        self.timers.interface.start(ctx, txtime)?;
        Ok(())
    }

    /// Pick the next frame to contend for once the current exchange step is over.
    pub(super) fn tx_resume(&mut self, ctx: &mut dyn MacContext) -> Result<(), MacError> {
        if self.timers.send.busy() || self.timers.defer.busy() {
            return Err(MacError::invariant("tx_resume with send or defer timer running"));
        }
        let difs = self.config.phy.difs();
        if self.pkt_ctrl.is_some() {
            self.timers.defer.start(ctx, self.config.phy.sifs)?;
        } else if self.pkt_rts.is_some() {
            if !self.timers.backoff.busy() {
                let idle = self.is_idle(ctx.now());
                self.timers.backoff.start(ctx, self.cw, idle, difs)?;
            }
        } else if let Some(data) = self.pkt_tx.as_ref() {
            if !self.timers.backoff.busy() {
                if self.uses_rts(data) {
                    self.timers.defer.start(ctx, self.config.phy.sifs)?;
                } else {
                    let idle = self.is_idle(ctx.now());
                    self.timers.backoff.start(ctx, self.cw, idle, difs)?;
                }
            }
        } else if self.callback_pending {
            self.callback_pending = false;
            ctx.upper_ready();
        }
        self.set_tx_state(ctx, MacState::Idle)
    }

    pub(super) fn backoff_handler(&mut self, ctx: &mut dyn MacContext) -> Result<(), MacError> {
        if self.pkt_ctrl.is_some() {
            return Ok(());
        }
        if !self.check_pkt_rts(ctx)? {
            self.check_pkt_tx(ctx)?;
        }
        Ok(())
    }

    pub(super) fn defer_handler(&mut self, ctx: &mut dyn MacContext) -> Result<(), MacError> {
        if self.pkt_ctrl.is_none() && self.pkt_rts.is_none() && self.pkt_tx.is_none() {
            return Err(MacError::invariant("defer expired with nothing to send"));
        }
        if self.check_pkt_ctrl(ctx)? {
            return Ok(());
        }
        if self.timers.backoff.busy() {
            return Err(MacError::invariant("defer expired while backing off"));
        }
        if !self.check_pkt_rts(ctx)? {
            self.check_pkt_tx(ctx)?;
        }
        Ok(())
    }

    /// The response to our last transmission did not arrive in time, or the
    /// frame needed none.
    pub(super) fn send_timer(&mut self, ctx: &mut dyn MacContext) -> Result<(), MacError> {
        match self.tx_state {
            MacState::Rts => self.retransmit_rts(ctx)?,
            MacState::Cts | MacState::Ack => {
                if self.pkt_ctrl.take().is_none() {
                    return Err(MacError::invariant("control frame vanished while on the air"));
                }
            }
            MacState::Send => self.retransmit_data(ctx)?,
            MacState::Idle => {}
            other => {
                return Err(MacError::invariant(format!("send timer expired in state {other:?}")));
            }
        }
        self.tx_resume(ctx)
    }

    /// Strip the MAC header of an abandoned data frame and report it.
    fn give_up(&mut self, ctx: &mut dyn MacContext, reason: TxFailReason) -> Result<(), MacError> {
        let Some(mut data) = self.pkt_tx.take() else {
            return Err(MacError::invariant("retry limit reached without a data frame"));
        };
        let dst = data.ra;
        data.size = data.size.saturating_sub(MAC_HDR_LEN);
        debug!("node {} drops {} after {:?} retries", self.addr, data, reason);
        ctx.tx_failed(data, reason);
        self.count_tx(CounterId::MpduTxFailed, dst);
        self.rst_cw();
        Ok(())
    }

    fn retransmit_rts(&mut self, ctx: &mut dyn MacContext) -> Result<(), MacError> {
        if self.pkt_tx.is_none() {
            return Err(MacError::invariant("RTS timeout without a data frame"));
        }
        let Some(dst) = self.pkt_rts.as_ref().map(|f| f.ra) else {
            return Err(MacError::invariant("RTS timeout without an RTS"));
        };
        self.count_tx(CounterId::RtsFailed, dst);
        self.ssrc += 1;

        if self.ssrc >= self.config.mac.short_retry_limit {
            let rts = self.pkt_rts.take();
            self.discard(rts.as_ref(), "retry count exceeded");
            self.ssrc = 0;
            self.give_up(ctx, TxFailReason::Rts)
        } else {
            if let Some(rts) = self.pkt_rts.as_mut() {
                rts.fc.retry = true;
            }
            self.inc_cw();
            let idle = self.is_idle(ctx.now());
            self.timers.backoff.start(ctx, self.cw, idle, 0.0)
        }
    }

    fn retransmit_data(&mut self, ctx: &mut dyn MacContext) -> Result<(), MacError> {
        let Some(data) = self.pkt_tx.as_ref() else {
            return Err(MacError::invariant("data timeout without a data frame"));
        };
        let idle = self.is_idle(ctx.now());
        if data.is_broadcast() {
            self.pkt_tx = None;
            self.rst_cw();
            return self.timers.backoff.start(ctx, self.cw, idle, 0.0);
        }

        let dst = data.ra;
        let short = data.size <= self.config.mac.rts_threshold;
        self.count_tx(CounterId::AckFailed, dst);
        let (count, limit) = if short {
            self.ssrc += 1;
            (self.ssrc, self.config.mac.short_retry_limit)
        } else {
            self.slrc += 1;
            (self.slrc, self.config.mac.long_retry_limit)
        };

        if count >= limit {
            if short {
                self.ssrc = 0;
            } else {
                self.slrc = 0;
            }
            self.give_up(ctx, TxFailReason::Ack)
        } else {
            if let Some(data) = self.pkt_tx.as_mut() {
                data.fc.retry = true;
            }
            self.send_rts(dst)?;
            self.inc_cw();
            self.timers.backoff.start(ctx, self.cw, idle, 0.0)
        }
    }

    pub(super) fn discard(&self, frame: Option<&MacFrame>, why: &str) {
        if let Some(frame) = frame {
            if self.config.debug_level > 0 {
                debug!("node {} discards {}: {}", self.addr, frame, why);
            }
        }
    }
}
