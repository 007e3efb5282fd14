//! Windowed transmission state for a CS104 connection
//!
//! Pure state: the connection task feeds it received frames and timer wakes
//! and obeys the returned actions. All sequence arithmetic is modulo 2^15;
//! window membership is tested with modular distances, never raw comparison.
//!
//! Timers are logical deadlines. The connection multiplexes socket readiness
//! with [`TransmissionState::next_deadline`] in a single select; no timer
//! ever owns a task.

use std::time::Instant;

use tracing::warn;

use crate::common::CloseReason;
use crate::params::ApciParameters;

/// Sequence numbers are 15-bit counters
pub(crate) const SEQ_MODULO: u16 = 1 << 15;

/// Next sequence number, wrapping at 2^15
pub(crate) fn seq_inc(n: u16) -> u16 {
    (n + 1) & (SEQ_MODULO - 1)
}

/// Modular distance: number of steps from `b` to `a` (mod 2^15)
pub(crate) fn seq_distance(a: u16, b: u16) -> u16 {
    ((a as i32 - b as i32 + SEQ_MODULO as i32) % SEQ_MODULO as i32) as u16
}

/// Data transfer state of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTransferState {
    /// No data transfer; I-frames are a protocol violation
    Stopped,
    /// STARTDT act sent, confirmation outstanding
    StartPending,
    /// Data transfer active
    Started,
    /// STOPDT act seen, confirmation outstanding
    StopPending,
}

/// What to do when STOPDT act arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopConfirm {
    /// No I-frames outstanding, confirm immediately
    Now,
    /// Confirmation buffered until the ack count catches up
    Deferred,
}

/// Timer expiry outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    /// t1 elapsed without acknowledgment: close the connection
    T1Expired,
    /// t2 elapsed with unconfirmed received I-frames: send an S-frame
    AckDue,
    /// t3 of silence: probe the peer with TESTFR act
    SendTestAct,
}

#[derive(Debug)]
pub(crate) struct TransmissionState {
    params: ApciParameters,
    /// Next N(S) to emit
    send_count: u16,
    /// Peer-confirmed N(R)
    acked_count: u16,
    /// Next expected N(S)
    receive_count: u16,
    /// Received I-frames not yet acknowledged to the peer
    unconfirmed_received: u16,
    state: DataTransferState,
    /// We initiated the pending stop (peer I-frames may still be in flight)
    stop_initiated_locally: bool,
    /// STOPDT con owed to the peer once all our I-frames are acked
    pending_stop_con: bool,
    /// TESTFR act sent, confirmation outstanding
    test_outstanding: bool,
    // logical deadlines
    i_frame_t1: Option<Instant>,
    u_confirm_t1: Option<Instant>,
    test_t1: Option<Instant>,
    t2_deadline: Option<Instant>,
    t3_deadline: Instant,
}

impl TransmissionState {
    pub fn new(params: ApciParameters, now: Instant) -> Self {
        Self {
            params,
            send_count: 0,
            acked_count: 0,
            receive_count: 0,
            unconfirmed_received: 0,
            state: DataTransferState::Stopped,
            stop_initiated_locally: false,
            pending_stop_con: false,
            test_outstanding: false,
            i_frame_t1: None,
            u_confirm_t1: None,
            test_t1: None,
            t2_deadline: None,
            t3_deadline: now + params.t3,
        }
    }

    pub fn data_transfer(&self) -> DataTransferState {
        self.state
    }

    /// Unacknowledged I-frames in flight
    pub fn outstanding(&self) -> u16 {
        seq_distance(self.send_count, self.acked_count)
    }

    /// Sender blocks when k I-frames are unacknowledged
    pub fn window_full(&self) -> bool {
        self.outstanding() >= self.params.k
    }

    /// An I-frame may be emitted now
    pub fn can_send_i(&self) -> bool {
        self.state == DataTransferState::Started && !self.window_full()
    }

    /// Received I-frames not yet acknowledged toward the peer
    pub fn unconfirmed_received(&self) -> u16 {
        self.unconfirmed_received
    }

    /// The receiver must acknowledge after w unacknowledged I-frames
    pub fn ack_due(&self) -> bool {
        self.unconfirmed_received >= self.params.w
    }

    // Any traffic restarts the idle timer
    fn touch(&mut self, now: Instant) {
        self.t3_deadline = now + self.params.t3;
    }

    /// Account a transmitted I-frame; returns the (N(S), N(R)) pair to put
    /// on the wire. Callers check [`can_send_i`](Self::can_send_i) first.
    pub fn on_i_sent(&mut self, now: Instant) -> (u16, u16) {
        let ns = self.send_count;
        self.send_count = seq_inc(self.send_count);
        if self.i_frame_t1.is_none() {
            self.i_frame_t1 = Some(now + self.params.t1);
        }
        self.touch(now);
        (ns, self.confirm_receive())
    }

    /// Take the N(R) for an outgoing S- or I-frame and clear the receive-side
    /// acknowledgment debt
    pub fn confirm_receive(&mut self) -> u16 {
        self.unconfirmed_received = 0;
        self.t2_deadline = None;
        self.receive_count
    }

    fn process_ack(&mut self, nr: u16, now: Instant) -> Result<(), CloseReason> {
        // N(R) must lie within [acked_count, send_count] (mod 2^15)
        if seq_distance(nr, self.acked_count) > self.outstanding() {
            warn!(
                nr,
                acked = self.acked_count,
                sent = self.send_count,
                "received N(R) outside the outstanding window"
            );
            return Err(CloseReason::AckOutOfWindow);
        }
        if nr != self.acked_count {
            self.acked_count = nr;
            self.i_frame_t1 = if self.outstanding() > 0 {
                Some(now + self.params.t1)
            } else {
                None
            };
        }
        Ok(())
    }

    /// Validate and account a received I-frame
    pub fn on_i_received(&mut self, ns: u16, nr: u16, now: Instant) -> Result<(), CloseReason> {
        self.touch(now);
        let acceptable = match self.state {
            DataTransferState::Started => true,
            DataTransferState::StopPending => self.stop_initiated_locally,
            _ => false,
        };
        if !acceptable {
            return Err(CloseReason::IFrameWhileStopped);
        }
        if ns != self.receive_count {
            warn!(ns, expected = self.receive_count, "N(S) sequence error");
            return Err(CloseReason::SequenceError);
        }
        self.process_ack(nr, now)?;
        self.receive_count = seq_inc(self.receive_count);
        self.unconfirmed_received += 1;
        if self.t2_deadline.is_none() {
            self.t2_deadline = Some(now + self.params.t2);
        }
        Ok(())
    }

    /// Account a received S-frame
    pub fn on_s_received(&mut self, nr: u16, now: Instant) -> Result<(), CloseReason> {
        self.touch(now);
        self.process_ack(nr, now)
    }

    /// STOPDT con may be owed after the ack count caught up
    pub fn take_pending_stop_con(&mut self) -> bool {
        if self.pending_stop_con && self.outstanding() == 0 {
            self.pending_stop_con = false;
            self.state = DataTransferState::Stopped;
            true
        } else {
            false
        }
    }

    /// STARTDT act transmitted (master side)
    pub fn on_start_act_sent(&mut self, now: Instant) {
        self.state = DataTransferState::StartPending;
        self.u_confirm_t1 = Some(now + self.params.t1);
        self.touch(now);
    }

    /// STARTDT con received (master side)
    pub fn on_start_con_received(&mut self, now: Instant) -> Result<(), CloseReason> {
        self.touch(now);
        if self.state != DataTransferState::StartPending {
            return Err(CloseReason::UnexpectedConfirmation);
        }
        self.state = DataTransferState::Started;
        self.u_confirm_t1 = None;
        Ok(())
    }

    /// STARTDT act received (slave side); the caller answers with con
    pub fn on_start_act_received(&mut self, now: Instant) {
        self.touch(now);
        self.state = DataTransferState::Started;
    }

    /// STOPDT act transmitted (master side)
    pub fn on_stop_act_sent(&mut self, now: Instant) {
        self.state = DataTransferState::StopPending;
        self.stop_initiated_locally = true;
        self.u_confirm_t1 = Some(now + self.params.t1);
        self.touch(now);
    }

    /// STOPDT con received (master side)
    pub fn on_stop_con_received(&mut self, now: Instant) -> Result<(), CloseReason> {
        self.touch(now);
        if !(self.state == DataTransferState::StopPending && self.stop_initiated_locally) {
            return Err(CloseReason::UnexpectedConfirmation);
        }
        self.state = DataTransferState::Stopped;
        self.stop_initiated_locally = false;
        self.u_confirm_t1 = None;
        Ok(())
    }

    /// STOPDT act received (slave side). The confirmation must wait while
    /// own I-frames are unacknowledged.
    pub fn on_stop_act_received(&mut self, now: Instant) -> StopConfirm {
        self.touch(now);
        if self.outstanding() > 0 {
            self.state = DataTransferState::StopPending;
            self.stop_initiated_locally = false;
            self.pending_stop_con = true;
            StopConfirm::Deferred
        } else {
            self.state = DataTransferState::Stopped;
            StopConfirm::Now
        }
    }

    /// TESTFR act received; the caller answers with con
    pub fn on_test_act_received(&mut self, now: Instant) {
        self.touch(now);
    }

    /// TESTFR con received. Unsolicited confirmations are tolerated.
    pub fn on_test_con_received(&mut self, now: Instant) {
        self.touch(now);
        self.test_outstanding = false;
        self.test_t1 = None;
    }

    /// Any outbound non-I frame also restarts the idle timer
    pub fn on_frame_sent(&mut self, now: Instant) {
        self.touch(now);
    }

    /// Earliest pending deadline for the connection's select loop
    pub fn next_deadline(&self) -> Instant {
        let mut deadline = self.t3_deadline;
        for candidate in [
            self.i_frame_t1,
            self.u_confirm_t1,
            self.test_t1,
            self.t2_deadline,
        ]
        .into_iter()
        .flatten()
        {
            if candidate < deadline {
                deadline = candidate;
            }
        }
        deadline
    }

    /// Resolve elapsed timers, most severe first. Call until `None`.
    pub fn on_timer(&mut self, now: Instant) -> Option<TimerEvent> {
        let t1_elapsed = [self.i_frame_t1, self.u_confirm_t1, self.test_t1]
            .into_iter()
            .flatten()
            .any(|deadline| now >= deadline);
        if t1_elapsed {
            return Some(TimerEvent::T1Expired);
        }
        if let Some(t2) = self.t2_deadline {
            if now >= t2 && self.unconfirmed_received > 0 {
                return Some(TimerEvent::AckDue);
            }
        }
        if now >= self.t3_deadline && !self.test_outstanding {
            self.test_outstanding = true;
            self.test_t1 = Some(now + self.params.t1);
            self.touch(now);
            return Some(TimerEvent::SendTestAct);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn params() -> ApciParameters {
        ApciParameters::default()
    }

    fn started(now: Instant) -> TransmissionState {
        let mut state = TransmissionState::new(params(), now);
        state.on_start_act_sent(now);
        state.on_start_con_received(now).unwrap();
        state
    }

    #[test]
    fn sequence_arithmetic_wraps() {
        assert_eq!(seq_inc(32767), 0);
        assert_eq!(seq_distance(0, 32767), 1);
        assert_eq!(seq_distance(5, 32760), 13);
        assert_eq!(seq_distance(5, 5), 0);
    }

    #[test]
    fn window_stalls_at_k_and_frees_on_ack() {
        let now = Instant::now();
        let mut state = started(now);

        for i in 0..12 {
            assert!(state.can_send_i(), "frame {i} must fit the window");
            state.on_i_sent(now);
        }
        assert!(state.window_full());
        assert!(!state.can_send_i(), "13th frame must block");

        // S-frame acking 6 frees 6 slots
        state.on_s_received(6, now).unwrap();
        assert_eq!(state.outstanding(), 6);
        assert!(state.can_send_i());
    }

    #[test]
    fn ns_gap_is_a_sequence_error() {
        let now = Instant::now();
        let mut state = started(now);
        state.on_i_received(0, 0, now).unwrap();
        assert_eq!(
            state.on_i_received(2, 0, now),
            Err(CloseReason::SequenceError)
        );
    }

    #[test]
    fn nr_outside_window_closes() {
        let now = Instant::now();
        let mut state = started(now);
        state.on_i_sent(now);
        state.on_i_sent(now);
        // N(R)=3 acknowledges a frame never sent
        assert_eq!(state.on_s_received(3, now), Err(CloseReason::AckOutOfWindow));
        // stale N(R) behind acked_count is equally invalid
        let mut state = started(now);
        state.on_i_sent(now);
        state.on_s_received(1, now).unwrap();
        assert_eq!(
            state.on_s_received(32767, now),
            Err(CloseReason::AckOutOfWindow)
        );
    }

    #[test]
    fn i_frame_while_stopped_is_a_violation() {
        let now = Instant::now();
        let mut state = TransmissionState::new(params(), now);
        assert_eq!(
            state.on_i_received(0, 0, now),
            Err(CloseReason::IFrameWhileStopped)
        );
    }

    #[test]
    fn receiver_acks_after_w_frames() {
        let now = Instant::now();
        let mut state = started(now);
        for ns in 0..7 {
            state.on_i_received(ns, 0, now).unwrap();
            assert!(!state.ack_due());
        }
        state.on_i_received(7, 0, now).unwrap();
        assert!(state.ack_due());
        assert_eq!(state.confirm_receive(), 8);
        assert!(!state.ack_due());
    }

    #[test]
    fn t2_forces_ack_of_a_single_frame() {
        let now = Instant::now();
        let mut state = started(now);
        state.on_i_received(0, 0, now).unwrap();
        assert_eq!(state.on_timer(now), None);

        let later = now + params().t2 + Duration::from_millis(1);
        assert_eq!(state.on_timer(later), Some(TimerEvent::AckDue));
    }

    #[test]
    fn t1_expiry_closes() {
        let now = Instant::now();
        let mut state = started(now);
        state.on_i_sent(now);
        let later = now + params().t1 + Duration::from_millis(1);
        assert_eq!(state.on_timer(later), Some(TimerEvent::T1Expired));
    }

    #[test]
    fn idle_t3_probes_and_testfr_con_disarms_t1() {
        let now = Instant::now();
        let mut state = started(now);

        let idle = now + params().t3 + Duration::from_millis(1);
        assert_eq!(state.on_timer(idle), Some(TimerEvent::SendTestAct));

        // con before t1 keeps the connection alive and rearms t3
        let reply = idle + Duration::from_secs(1);
        state.on_test_con_received(reply);
        assert_eq!(state.on_timer(reply), None);
        assert!(state.next_deadline() > reply);

        // without the con, t1 fires
        let mut state = started(now);
        assert_eq!(state.on_timer(idle), Some(TimerEvent::SendTestAct));
        let too_late = idle + params().t1 + Duration::from_millis(1);
        assert_eq!(state.on_timer(too_late), Some(TimerEvent::T1Expired));
    }

    #[test]
    fn stop_confirmation_waits_for_acks() {
        let now = Instant::now();
        let mut state = started(now);
        state.on_i_sent(now);

        assert_eq!(state.on_stop_act_received(now), StopConfirm::Deferred);
        assert!(!state.take_pending_stop_con());

        state.on_s_received(1, now).unwrap();
        assert!(state.take_pending_stop_con());
        assert_eq!(state.data_transfer(), DataTransferState::Stopped);
    }

    #[test]
    fn stop_confirms_immediately_without_outstanding_frames() {
        let now = Instant::now();
        let mut state = started(now);
        assert_eq!(state.on_stop_act_received(now), StopConfirm::Now);
        assert_eq!(state.data_transfer(), DataTransferState::Stopped);
    }

    #[test]
    fn unsolicited_start_con_is_a_violation() {
        let now = Instant::now();
        let mut state = TransmissionState::new(params(), now);
        assert_eq!(
            state.on_start_con_received(now),
            Err(CloseReason::UnexpectedConfirmation)
        );
    }

    #[test]
    fn sequence_numbers_wrap_through_the_window() {
        let now = Instant::now();
        let mut state = started(now);
        // place the counters near the wrap point
        state.send_count = 32766;
        state.acked_count = 32766;
        state.receive_count = 32767;

        let (ns, _nr) = state.on_i_sent(now);
        assert_eq!(ns, 32766);
        state.on_i_sent(now);
        assert_eq!(state.send_count, 0);
        assert_eq!(state.outstanding(), 2);

        state.on_i_received(32767, 32767, now).unwrap();
        assert_eq!(state.receive_count, 0);
        assert_eq!(state.outstanding(), 1);
    }
}
