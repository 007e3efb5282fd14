//! CS101 link layer state machines
//!
//! The primary station drives the link: it resets it, polls for class 1/2
//! data and sends confirmed user data, toggling FCB on every new
//! transmission that expects an answer. Lost confirmations are detected by
//! the secondary through an unchanged FCB, which triggers a retransmission
//! of the stored response instead of re-executing the service.
//!
//! Both machines are pure; the master/slave facades own the I/O.

use std::time::Instant;

use tracing::{debug, warn};

use crate::common::CloseReason;
use crate::iec101::ft12::{
    Ft12Frame, LinkControl, PrimaryFunction, SecondaryFunction,
};
use crate::params::LinkLayerParameters;

/// Primary station states, one machine per addressed secondary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrimaryLinkState {
    /// Link not established or idle between services
    Idle,
    /// Reset of remote link sent, confirmation outstanding
    LinkReset,
    /// Confirmed user data sent, ACK outstanding
    ExpectingAck,
    /// Class 1 request sent, response outstanding
    RequestingClass1,
    /// Class 2 request sent, response outstanding
    RequestingClass2,
}

/// What a received secondary frame means to the caller
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PrimaryEvent {
    /// Nothing for the caller
    None,
    /// The establishment sequence continues with this frame
    Proceed(Ft12Frame),
    /// Link reset confirmed, the link is available
    LinkAvailable,
    /// Confirmed user data was acknowledged
    Confirmed,
    /// The secondary answered a class poll with user data
    UserData(Vec<u8>),
    /// The secondary has no data of the requested class
    NoData,
    /// The secondary is busy, retry later
    Busy,
}

/// Link establishment runs status request first, then the reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetPhase {
    Status,
    Reset,
}

/// Outcome of a timeout check
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PrimaryAction {
    None,
    /// Send the stored frame again (unchanged FCB)
    Retransmit(Ft12Frame),
    /// Retry budget exhausted
    LinkFailed(CloseReason),
}

#[derive(Debug)]
struct PendingFrame {
    frame: Ft12Frame,
    deadline: Instant,
    retries: u8,
}

#[derive(Debug)]
pub(crate) struct PrimaryLink {
    address: u16,
    params: LinkLayerParameters,
    dir: bool,
    state: PrimaryLinkState,
    reset_phase: ResetPhase,
    fcb: bool,
    available: bool,
    /// Secondary signalled pending class 1 data (ACD)
    class1_pending: bool,
    pending: Option<PendingFrame>,
}

impl PrimaryLink {
    pub fn new(address: u16, params: LinkLayerParameters, dir: bool) -> Self {
        Self {
            address,
            params,
            dir,
            state: PrimaryLinkState::Idle,
            reset_phase: ResetPhase::Status,
            fcb: false,
            available: false,
            class1_pending: false,
            pending: None,
        }
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// The link is established and no service is outstanding
    pub fn can_transmit(&self) -> bool {
        self.available && self.state == PrimaryLinkState::Idle
    }

    pub fn class1_pending(&self) -> bool {
        self.class1_pending
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    fn send(&mut self, frame: Ft12Frame, state: PrimaryLinkState, now: Instant) -> Ft12Frame {
        self.pending = Some(PendingFrame {
            frame: frame.clone(),
            deadline: now + self.params.ack_timeout,
            retries: 0,
        });
        self.state = state;
        frame
    }

    /// Begin (re-)establishing the link: request the link status first,
    /// the reset follows once the secondary answers
    pub fn reset(&mut self, now: Instant) -> Ft12Frame {
        self.available = false;
        self.fcb = false;
        self.reset_phase = ResetPhase::Status;
        let frame = Ft12Frame::Fixed {
            control: LinkControl::primary(
                self.dir,
                false,
                false,
                PrimaryFunction::RequestLinkStatus,
            ),
            address: self.address,
        };
        self.send(frame, PrimaryLinkState::LinkReset, now)
    }

    fn next_fcb(&mut self) -> bool {
        self.fcb = !self.fcb;
        self.fcb
    }

    /// Poll class 1 (high priority / spontaneous) data
    pub fn request_class1(&mut self, now: Instant) -> Option<Ft12Frame> {
        if !self.can_transmit() {
            return None;
        }
        let fcb = self.next_fcb();
        let frame = Ft12Frame::Fixed {
            control: LinkControl::primary(self.dir, fcb, true, PrimaryFunction::RequestClass1),
            address: self.address,
        };
        Some(self.send(frame, PrimaryLinkState::RequestingClass1, now))
    }

    /// Poll class 2 (cyclic / background) data
    pub fn request_class2(&mut self, now: Instant) -> Option<Ft12Frame> {
        if !self.can_transmit() {
            return None;
        }
        let fcb = self.next_fcb();
        let frame = Ft12Frame::Fixed {
            control: LinkControl::primary(self.dir, fcb, true, PrimaryFunction::RequestClass2),
            address: self.address,
        };
        Some(self.send(frame, PrimaryLinkState::RequestingClass2, now))
    }

    /// Send user data expecting a link confirmation
    pub fn send_confirmed(&mut self, user_data: Vec<u8>, now: Instant) -> Option<Ft12Frame> {
        if !self.can_transmit() {
            return None;
        }
        let fcb = self.next_fcb();
        let frame = Ft12Frame::Variable {
            control: LinkControl::primary(self.dir, fcb, true, PrimaryFunction::UserDataConfirmed),
            address: self.address,
            user_data,
        };
        Some(self.send(frame, PrimaryLinkState::ExpectingAck, now))
    }

    /// Send user data without expecting a reply (broadcast)
    pub fn send_no_reply(&mut self, user_data: Vec<u8>) -> Ft12Frame {
        Ft12Frame::Variable {
            control: LinkControl::primary(self.dir, false, false, PrimaryFunction::UserDataNoReply),
            address: self.address,
            user_data,
        }
    }

    /// Process a frame from the secondary this machine addresses
    pub fn on_frame(&mut self, frame: &Ft12Frame, now: Instant) -> PrimaryEvent {
        let is_ack = match frame {
            Ft12Frame::SingleCharAck => true,
            Ft12Frame::Fixed { control, .. } => {
                !control.prm
                    && SecondaryFunction::from_bits(control.function)
                        == Some(SecondaryFunction::Ack)
            }
            _ => false,
        };
        let is_status = matches!(frame, Ft12Frame::Fixed { control, .. }
            if !control.prm
                && SecondaryFunction::from_bits(control.function)
                    == Some(SecondaryFunction::LinkStatus));

        if let Some(control) = frame.control() {
            if control.prm {
                // not a secondary response
                return PrimaryEvent::None;
            }
            self.class1_pending = control.fcb_acd;
        }

        match self.state {
            PrimaryLinkState::LinkReset => match self.reset_phase {
                ResetPhase::Status => {
                    if is_status || is_ack {
                        self.reset_phase = ResetPhase::Reset;
                        let reset = Ft12Frame::Fixed {
                            control: LinkControl::primary(
                                self.dir,
                                false,
                                false,
                                PrimaryFunction::ResetRemoteLink,
                            ),
                            address: self.address,
                        };
                        return PrimaryEvent::Proceed(self.send(
                            reset,
                            PrimaryLinkState::LinkReset,
                            now,
                        ));
                    }
                    PrimaryEvent::None
                }
                ResetPhase::Reset => {
                    if is_ack {
                        self.pending = None;
                        self.state = PrimaryLinkState::Idle;
                        self.available = true;
                        debug!(address = self.address, "link available");
                        return PrimaryEvent::LinkAvailable;
                    }
                    PrimaryEvent::None
                }
            },
            PrimaryLinkState::ExpectingAck => {
                if is_ack {
                    self.pending = None;
                    self.state = PrimaryLinkState::Idle;
                    return PrimaryEvent::Confirmed;
                }
                if matches!(frame, Ft12Frame::SingleCharNack)
                    || matches!(frame, Ft12Frame::Fixed { control, .. }
                        if SecondaryFunction::from_bits(control.function)
                            == Some(SecondaryFunction::Nack))
                {
                    self.pending = None;
                    self.state = PrimaryLinkState::Idle;
                    return PrimaryEvent::Busy;
                }
                PrimaryEvent::None
            }
            PrimaryLinkState::RequestingClass1 | PrimaryLinkState::RequestingClass2 => {
                match frame {
                    Ft12Frame::Variable {
                        control, user_data, ..
                    } if SecondaryFunction::from_bits(control.function)
                        == Some(SecondaryFunction::UserData) =>
                    {
                        self.pending = None;
                        self.state = PrimaryLinkState::Idle;
                        PrimaryEvent::UserData(user_data.clone())
                    }
                    Ft12Frame::Fixed { control, .. }
                        if SecondaryFunction::from_bits(control.function)
                            == Some(SecondaryFunction::NackNoData) =>
                    {
                        self.pending = None;
                        self.state = PrimaryLinkState::Idle;
                        PrimaryEvent::NoData
                    }
                    _ => PrimaryEvent::None,
                }
            }
            PrimaryLinkState::Idle => PrimaryEvent::None,
        }
    }

    /// Check the response timeout; retransmission keeps the FCB unchanged
    pub fn on_timeout(&mut self, now: Instant) -> PrimaryAction {
        let Some(pending) = self.pending.as_mut() else {
            return PrimaryAction::None;
        };
        if now < pending.deadline {
            return PrimaryAction::None;
        }
        if pending.retries < self.params.max_retries {
            pending.retries += 1;
            pending.deadline = now + self.params.ack_timeout;
            debug!(
                address = self.address,
                retry = pending.retries,
                "no link response, retransmitting"
            );
            return PrimaryAction::Retransmit(pending.frame.clone());
        }
        warn!(address = self.address, "link retry budget exhausted");
        self.pending = None;
        self.state = PrimaryLinkState::Idle;
        self.available = false;
        PrimaryAction::LinkFailed(CloseReason::LinkBroken)
    }
}

/// What the slave facade must do with a received primary frame
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SecondaryDecision {
    /// FCB unchanged: the confirmation was lost, repeat the stored response
    Repeat(Ft12Frame),
    /// Execute the link service
    Process(PrimaryFunction, Option<Vec<u8>>),
    /// Not addressed to this station or not parseable
    Ignore,
}

#[derive(Debug)]
pub(crate) struct SecondaryLink {
    address: u16,
    last_fcb: Option<bool>,
    last_response: Option<Ft12Frame>,
}

impl SecondaryLink {
    pub fn new(address: u16) -> Self {
        Self {
            address,
            last_fcb: None,
            last_response: None,
        }
    }

    /// Store the response so an unchanged FCB can repeat it
    pub fn store_response(&mut self, frame: Ft12Frame) {
        self.last_response = Some(frame);
    }

    /// Classify a primary frame. Address filtering (own address and
    /// broadcast) is the caller's business.
    pub fn on_frame(&mut self, frame: &Ft12Frame) -> SecondaryDecision {
        let (control, user_data) = match frame {
            Ft12Frame::Fixed { control, .. } => (*control, None),
            Ft12Frame::Variable {
                control, user_data, ..
            } => (*control, Some(user_data.clone())),
            _ => return SecondaryDecision::Ignore,
        };
        if !control.prm {
            return SecondaryDecision::Ignore;
        }
        let Some(function) = PrimaryFunction::from_bits(control.function) else {
            return SecondaryDecision::Ignore;
        };

        if function == PrimaryFunction::ResetRemoteLink {
            self.last_fcb = None;
            self.last_response = None;
            return SecondaryDecision::Process(function, None);
        }

        if control.fcv_dfc {
            if self.last_fcb == Some(control.fcb_acd) {
                if let Some(stored) = self.last_response.clone() {
                    debug!(address = self.address, "unchanged FCB, repeating response");
                    return SecondaryDecision::Repeat(stored);
                }
            }
            self.last_fcb = Some(control.fcb_acd);
        }

        SecondaryDecision::Process(function, user_data)
    }
}
