use mr80211_abstract::{FrameSubtype, FrameType, MAC_HDR_LEN, MacAddr, MacContext, MacFrame};
use std::mem;
use tracing::debug;

use super::{IdleUpdate, Mac80211, MacState, sec};
use crate::error::MacError;
use crate::error_model::{ErrorDecision, PacketOutcome};
use crate::mib::{CounterId, RxCounter};

impl Mac80211 {
    /// The first bit of `frame` reached this station.
    pub fn recv(&mut self, ctx: &mut dyn MacContext, frame: MacFrame) -> Result<(), MacError> {
        let now = ctx.now();
        let phy = &self.config.phy;
        let (difs, slot) = (phy.difs(), phy.slot_time);
        self.update_idle_time(now, frame.txtime + difs + slot, IdleUpdate::Normal);

        if self.tx_active {
            self.set_nav(ctx, frame.txtime)?;
            self.count_rx_family(RxCounter::DropTxa, frame.ta, &frame);
            self.discard(Some(&frame), "transmitter active");
            return Ok(());
        }

        if self.rx_state == MacState::Idle {
            self.rx_time = now;
            self.set_rx_state(ctx, MacState::Recv)?;
            let txtime = frame.txtime;
            self.pkt_rx = Some(frame);
            self.timers.recv.start(ctx, txtime)?;
            if let Some(profile) = &self.profile {
                profile.borrow_mut().start_new_recording(now);
            }
            return Ok(());
        }

        let Some((mode, power)) = self.pkt_rx.as_ref().map(|f| (f.mode, f.rx.power)) else {
            return Err(MacError::invariant("receiver busy without a frame"));
        };
        let dropped = if now - self.rx_time < self.config.phy.sync_interval(mode) && frame.rx.power > power {
            let txtime = frame.txtime;
            let old = self
                .pkt_rx
                .replace(frame)
                .ok_or_else(|| MacError::invariant("receiver busy without a frame"))?;
            self.timers.recv.stop(ctx)?;
            self.timers.recv.start(ctx, txtime)?;
            if let Some(profile) = &self.profile {
                let mut profile = profile.borrow_mut();
                profile.stop_recording();
                profile.start_new_recording(now);
            }
            if self.config.debug_level > 0 {
                debug!("{:.9} node {} synchronizes on a stronger frame", now, self.addr);
            }
            old
        } else {
            frame
        };

        self.set_nav(ctx, dropped.txtime)?;
        self.count_rx_family(RxCounter::DropSyn, dropped.ta, &dropped);
        self.discard(Some(&dropped), "synchronized on another frame");
        Ok(())
    }

    /// The frame we were synchronized on has been fully received.
    pub(super) fn recv_timer(&mut self, ctx: &mut dyn MacContext) -> Result<(), MacError> {
        let Some(frame) = self.pkt_rx.take() else {
            return Err(MacError::invariant("receive timer without a frame"));
        };
        if !matches!(self.rx_state, MacState::Recv | MacState::Coll) {
            return Err(MacError::invariant(format!(
                "receive timer in rx state {:?}",
                self.rx_state
            )));
        }
        if let Some(profile) = &self.profile {
            profile.borrow_mut().stop_recording();
        }
        self.process_frame(ctx, frame)?;
        self.rx_resume(ctx)
    }

    fn process_frame(&mut self, ctx: &mut dyn MacContext, frame: MacFrame) -> Result<(), MacError> {
        let now = ctx.now();
        let phy = &self.config.phy;
        let (difs, eifs, slot) = (phy.difs(), phy.eifs(), phy.slot_time);
        let src = frame.ta;
        let dst = frame.ra;

        if self.tx_active && !frame.rx.error {
            return Err(MacError::invariant("frame received intact while transmitting"));
        }
        // overlapped our own transmission: silent drop, NAV untouched
        if frame.rx.error {
            self.update_idle_time(now, eifs + slot, IdleUpdate::Weak);
            return Ok(());
        }

        let decision = match (&self.error_model, &self.profile) {
            (Some(model), Some(profile)) => Some(model.get_err(&profile.borrow(), &frame, ctx.rng())),
            _ => None,
        };
        if let Some(d) = &decision {
            let noise = match d.outcome {
                PacketOutcome::Ok => None,
                PacketOutcome::ErrorNoise => Some(true),
                PacketOutcome::ErrorInterference => Some(false),
            };
            if let Some(noise) = noise {
                self.discard(Some(&frame), if noise { "noise" } else { "collision" });
                self.update_idle_time(now, eifs + slot, IdleUpdate::Weak);
                self.count_frame_error(src, &frame, noise);
                return Ok(());
            }
        }

        // receptions are only counted when the error model judged the frame;
        // data for us is counted once it survived duplicate detection
        let measured = decision.is_some();
        let data_for_us = frame.fc.frame_type == FrameType::Data && dst == self.addr;
        if measured && !data_for_us {
            self.count_rx_family(RxCounter::Receives, src, &frame);
        }
        if let Some(d) = &decision {
            self.update_link_quality(src, dst, d);
        }

        if dst != self.addr {
            let dur = sec(frame.duration);
            self.set_nav(ctx, dur)?;
            self.update_idle_time(now, dur + difs + slot, IdleUpdate::Forced);
        }

        if dst != self.addr && !dst.is_broadcast() {
            return Ok(());
        }

        match (frame.fc.frame_type, frame.fc.subtype) {
            (FrameType::Management, _) => {
                self.discard(Some(&frame), "unknown type");
                Ok(())
            }
            (FrameType::Control, FrameSubtype::Rts) => self.recv_rts(ctx, frame),
            (FrameType::Control, FrameSubtype::Cts) => self.recv_cts(ctx, frame),
            (FrameType::Control, FrameSubtype::Ack) => self.recv_ack(ctx, frame),
            (FrameType::Data, FrameSubtype::Data) => {
                self.count_rx(CounterId::MpduRxSuccessful, src);
                self.recv_data(ctx, frame, measured)
            }
            (ty, sub) => Err(MacError::invariant(format!("invalid frame {ty:?}/{sub:?} received"))),
        }
    }

    fn rx_resume(&mut self, ctx: &mut dyn MacContext) -> Result<(), MacError> {
        if self.pkt_rx.is_some() || self.timers.recv.busy() {
            return Err(MacError::invariant("rx_resume with a reception in progress"));
        }
        self.set_rx_state(ctx, MacState::Idle)
    }

    /// Record the channel quality of a frame addressed to us.
    fn update_link_quality(&mut self, src: MacAddr, dst: MacAddr, d: &ErrorDecision) {
        if dst == self.addr {
            if let Some(db) = &self.peer_db {
                let mut db = db.borrow_mut();
                let ps = db.get_peer_stats(src, self.addr);
                if let Some(snr) = d.snr {
                    ps.snr = snr;
                }
                if let Some(snir) = d.snir {
                    ps.snir = snir;
                }
                ps.interference = d.interference;
            }
        }
        if self.config.bss_id == Some(src) {
            if let Some(snr) = d.snr {
                self.ap_snr = snr;
            }
        }
    }

    fn recv_rts(&mut self, ctx: &mut dyn MacContext, frame: MacFrame) -> Result<(), MacError> {
        if self.tx_state != MacState::Idle || self.pkt_ctrl.is_some() {
            self.discard(Some(&frame), "busy");
            return Ok(());
        }
        self.send_cts(frame.ta, frame.duration)?;
        if self.timers.defer.busy() {
            self.timers.defer.stop(ctx)?;
        }
        self.tx_resume(ctx)
    }

    fn recv_cts(&mut self, ctx: &mut dyn MacContext, frame: MacFrame) -> Result<(), MacError> {
        if self.tx_state != MacState::Rts {
            self.discard(Some(&frame), "invalid state");
            return Ok(());
        }
        if self.pkt_rts.take().is_none() {
            return Err(MacError::invariant("CTS while no RTS pending"));
        }
        if self.pkt_tx.is_none() {
            return Err(MacError::invariant("CTS while no data pending"));
        }
        self.timers.send.stop(ctx)?;
        // the contention window is kept until the data frame is acknowledged
        self.ssrc = 0;
        self.tx_resume(ctx)
    }

    fn recv_data(&mut self, ctx: &mut dyn MacContext, mut frame: MacFrame, measured: bool) -> Result<(), MacError> {
        let src = frame.ta;
        let dst = frame.ra;
        let size = frame.size;
        frame.size = size.saturating_sub(MAC_HDR_LEN);

        if !dst.is_broadcast() {
            if size >= self.config.mac.rts_threshold {
                if self.tx_state == MacState::Cts {
                    if self.pkt_ctrl.take().is_none() {
                        return Err(MacError::invariant("CTS state without a CTS"));
                    }
                    self.timers.send.stop(ctx)?;
                } else {
                    self.discard(Some(&frame), "no CTS sent");
                    return Ok(());
                }
                self.send_ack(src)?;
                self.tx_resume(ctx)?;
            } else {
                if self.pkt_ctrl.is_some() {
                    self.discard(Some(&frame), "no room for an ACK");
                    return Ok(());
                }
                self.send_ack(src)?;
                if !self.timers.send.busy() {
                    self.tx_resume(ctx)?;
                }
            }

            let idx = src.index();
            if idx < self.seq_cache.len() {
                let last = self.seq_cache[idx];
                if last != 0 && last == frame.seqno {
                    debug!("node {} drops duplicate {}", self.addr, frame);
                    return Ok(());
                }
                self.seq_cache[idx] = frame.seqno;
            } else {
                self.warn_seq_cache(src);
            }
        }

        if measured && dst == self.addr {
            self.count_rx_family(RxCounter::Receives, src, &frame);
        }

        if self.config.bss_id == Some(self.addr) && !dst.is_broadcast() && frame.addr3 != self.addr {
            let final_dst = frame.addr3;
            if final_dst.is_broadcast() {
                ctx.deliver_up(frame.clone());
            }
            frame.ra = final_dst;
            frame.addr3 = src;
            ctx.forward(frame);
            return Ok(());
        }
        ctx.deliver_up(frame);
        Ok(())
    }

    fn recv_ack(&mut self, ctx: &mut dyn MacContext, frame: MacFrame) -> Result<(), MacError> {
        if self.tx_state != MacState::Send {
            self.discard(Some(&frame), "invalid state");
            return Ok(());
        }
        let Some(data) = self.pkt_tx.take() else {
            return Err(MacError::invariant("ACK while no data pending"));
        };
        let dst = data.ra;
        if self.config.bss_id == Some(frame.ta) {
            self.ap_ack_mode = frame.mode;
        }

        self.timers.send.stop(ctx)?;
        self.count_tx(CounterId::MpduTxSuccessful, dst);
        let retries = if data.size <= self.config.mac.rts_threshold {
            mem::take(&mut self.ssrc)
        } else {
            mem::take(&mut self.slrc)
        };
        match retries {
            0 => {}
            1 => self.count_tx(CounterId::MpduTxOneRetry, dst),
            _ => self.count_tx(CounterId::MpduTxMultipleRetries, dst),
        }
        self.rst_cw();

        if self.timers.backoff.busy() {
            return Err(MacError::invariant("ACK received while backing off"));
        }
        let idle = self.is_idle(ctx.now());
        self.timers.backoff.start(ctx, self.cw, idle, self.config.phy.difs())?;
        self.tx_resume(ctx)
    }
}
