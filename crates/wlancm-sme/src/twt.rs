//! TWT session lifecycle.
//!
//! Sessions are keyed by (vdev, peer, dialog) and created lazily on first
//! use. Each carries the command currently in flight for it; a second
//! request overlapping that key is refused until the response arrives.
//! Requests addressed to every dialog of a peer, or to every peer of a
//! vdev, fan out over the sessions they cover and also block sessions
//! created while they are in flight.
//!
//! Transitions on success (STA role):
//!
//! ```text
//! NotEstablished --Setup--> Active --Suspend--> Suspended
//!        ^                    ^  <----Resume-----   |
//!        +-----Terminate------+---------------------+
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{MacAddr, VdevId};

/// Dialog id meaning "every dialog of the peer" on the wire.
pub const ALL_DIALOGS: u8 = 255;

/// TWT operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TwtCommand {
    Setup,
    Terminate,
    Suspend,
    Resume,
    Nudge,
    GetStats,
    ClearStats,
}

impl TwtCommand {
    pub fn name(&self) -> &'static str {
        match self {
            TwtCommand::Setup => "setup",
            TwtCommand::Terminate => "terminate",
            TwtCommand::Suspend => "suspend",
            TwtCommand::Resume => "resume",
            TwtCommand::Nudge => "nudge",
            TwtCommand::GetStats => "get_stats",
            TwtCommand::ClearStats => "clear_stats",
        }
    }

    /// Whether the command must name exactly one peer and dialog.
    pub fn requires_single_session(&self) -> bool {
        matches!(
            self,
            TwtCommand::Setup | TwtCommand::Resume | TwtCommand::Nudge
        )
    }

    /// Whether a conflict is reported as `Pending` rather than `Busy`.
    pub fn conflict_is_pending(&self) -> bool {
        matches!(self, TwtCommand::Terminate | TwtCommand::Nudge)
    }
}

impl fmt::Display for TwtCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Peer addressing of a TWT request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerSelector {
    Unicast(MacAddr),
    AllPeers,
}

impl PeerSelector {
    pub fn matches(&self, peer: &MacAddr) -> bool {
        match self {
            PeerSelector::Unicast(mac) => mac == peer,
            PeerSelector::AllPeers => true,
        }
    }

    /// Address sent to firmware.
    pub fn wire_addr(&self) -> MacAddr {
        match self {
            PeerSelector::Unicast(mac) => *mac,
            PeerSelector::AllPeers => MacAddr::BROADCAST,
        }
    }
}

/// Dialog addressing of a TWT request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogSelector {
    Id(u8),
    All,
}

impl DialogSelector {
    pub fn from_wire(dialog_id: u8) -> Self {
        if dialog_id == ALL_DIALOGS {
            DialogSelector::All
        } else {
            DialogSelector::Id(dialog_id)
        }
    }

    pub fn wire_id(&self) -> u8 {
        match self {
            DialogSelector::Id(id) => *id,
            DialogSelector::All => ALL_DIALOGS,
        }
    }

    pub fn matches(&self, dialog_id: u8) -> bool {
        match self {
            DialogSelector::Id(id) => *id == dialog_id,
            DialogSelector::All => true,
        }
    }
}

/// Sessions a TWT request or event applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TwtTarget {
    pub vdev_id: VdevId,
    pub peer: PeerSelector,
    pub dialog: DialogSelector,
}

impl TwtTarget {
    /// One dialog with one peer.
    pub fn unicast(vdev_id: VdevId, peer: MacAddr, dialog_id: u8) -> Self {
        Self {
            vdev_id,
            peer: PeerSelector::Unicast(peer),
            dialog: DialogSelector::from_wire(dialog_id),
        }
    }

    /// Every dialog with one peer.
    pub fn all_dialogs(vdev_id: VdevId, peer: MacAddr) -> Self {
        Self {
            vdev_id,
            peer: PeerSelector::Unicast(peer),
            dialog: DialogSelector::All,
        }
    }

    /// Every session on the vdev.
    pub fn all_peers(vdev_id: VdevId) -> Self {
        Self {
            vdev_id,
            peer: PeerSelector::AllPeers,
            dialog: DialogSelector::All,
        }
    }

    /// Decode wire addressing, where the broadcast address selects all peers.
    pub fn from_wire(vdev_id: VdevId, peer: MacAddr, dialog_id: u8) -> Self {
        let peer = if peer.is_broadcast() {
            PeerSelector::AllPeers
        } else {
            PeerSelector::Unicast(peer)
        };
        Self {
            vdev_id,
            peer,
            dialog: DialogSelector::from_wire(dialog_id),
        }
    }

    /// The single (peer, dialog) key, if the target names one.
    pub fn single(&self) -> Option<(MacAddr, u8)> {
        match (self.peer, self.dialog) {
            (PeerSelector::Unicast(peer), DialogSelector::Id(id)) => Some((peer, id)),
            _ => None,
        }
    }

    /// Whether this target covers the given session.
    pub fn covers(&self, vdev_id: VdevId, peer: &MacAddr, dialog_id: u8) -> bool {
        self.vdev_id == vdev_id && self.peer.matches(peer) && self.dialog.matches(dialog_id)
    }
}

impl fmt::Display for TwtTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vdev {} ", self.vdev_id)?;
        match self.peer {
            PeerSelector::Unicast(mac) => write!(f, "peer {}", mac)?,
            PeerSelector::AllPeers => write!(f, "all peers")?,
        }
        match self.dialog {
            DialogSelector::Id(id) => write!(f, " dialog {}", id),
            DialogSelector::All => write!(f, " all dialogs"),
        }
    }
}

/// Negotiated state of one dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TwtSessionState {
    NotEstablished,
    Active,
    Suspended,
}

/// Per-dialog session context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwtSession {
    pub dialog_id: u8,
    pub state: TwtSessionState,
    /// Whether a setup ever completed for this dialog
    pub setup_done: bool,
    /// Command in flight for this dialog
    pub active_command: Option<TwtCommand>,
}

impl TwtSession {
    fn new(dialog_id: u8) -> Self {
        Self {
            dialog_id,
            state: TwtSessionState::NotEstablished,
            setup_done: false,
            active_command: None,
        }
    }

    /// Back to NotEstablished. The in-flight command, if any, is kept.
    fn reinit(&mut self) {
        self.state = TwtSessionState::NotEstablished;
        self.setup_done = false;
    }

    /// Counts against the per-peer session limit.
    fn in_use(&self) -> bool {
        self.setup_done
            || self.state != TwtSessionState::NotEstablished
            || self.active_command.is_some()
    }
}

/// Firmware status for a TWT command or notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TwtStatus {
    Ok,
    NotEnabled,
    DialogIdInUse,
    InvalidParam,
    NotReady,
    NoResource,
    NoAck,
    NoResponse,
    Denied,
    DialogIdNotExist,
    DialogIdBusy,
    ChannelSwitchInProgress,
    ScanInProgress,
    RoamInProgress,
    /// Peer tore the session down
    PeerInitiatedTeardown,
    /// Session torn down because the station roamed
    Roaming,
    /// Session torn down by a concurrency change
    Concurrency,
    /// Session torn down because power save was disabled
    PowerSaveDisable,
    /// Request never reached firmware
    HostFailure,
    UnknownError,
}

impl TwtStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, TwtStatus::Ok)
    }

    /// Failures meaning firmware no longer holds the session.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            TwtStatus::DialogIdNotExist | TwtStatus::NoAck | TwtStatus::NoResource
        )
    }

    /// Statuses firmware reports when it tears a session down on its own.
    pub fn is_autonomous_teardown(&self) -> bool {
        matches!(
            self,
            TwtStatus::PeerInitiatedTeardown
                | TwtStatus::Roaming
                | TwtStatus::Concurrency
                | TwtStatus::PowerSaveDisable
        )
    }

    /// Whether the covered sessions must be reinitialized regardless of
    /// the command that reported the status.
    pub fn forces_reset(&self) -> bool {
        self.is_destructive() || self.is_autonomous_teardown()
    }
}

/// Parameters of an individual TWT agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwtSetupParams {
    pub wake_interval_us: u32,
    pub wake_duration_us: u32,
    /// Offset of the first service period from now
    pub sp_offset_us: u64,
    pub trigger: bool,
    pub announced: bool,
    pub protection: bool,
}

impl Default for TwtSetupParams {
    fn default() -> Self {
        Self {
            wake_interval_us: 102_400,
            wake_duration_us: 8_192,
            sp_offset_us: 0,
            trigger: true,
            announced: true,
            protection: false,
        }
    }
}

/// Parameters for resuming a suspended dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TwtResumeParams {
    pub sp_offset_us: u64,
    pub next_twt_size: u32,
}

/// Parameters for shifting the next service period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TwtNudgeParams {
    pub wake_time_us: u32,
    pub next_twt_size: u32,
    pub sp_start_offset_us: i32,
}

/// Operation-specific request parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwtParams {
    None,
    Setup(TwtSetupParams),
    Resume(TwtResumeParams),
    Nudge(TwtNudgeParams),
}

/// Per-dialog statistics reported by firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TwtSessionStats {
    pub peer: MacAddr,
    pub dialog_id: u8,
    pub num_sp_cycles: u32,
    pub avg_sp_duration_us: u32,
    pub tx_mpdu: u32,
    pub rx_mpdu: u32,
}

/// Operation-specific response data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwtEventDetail {
    None,
    /// Agreement as accepted by the peer
    Setup(TwtSetupParams),
    Stats(Vec<TwtSessionStats>),
}

/// TWT event from firmware: either a command response or an autonomous
/// teardown notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwtEvent {
    pub vdev_id: VdevId,
    /// Broadcast address for all-peer events
    pub peer: MacAddr,
    /// [`ALL_DIALOGS`] for all-dialog events
    pub dialog_id: u8,
    pub command: TwtCommand,
    pub status: TwtStatus,
    pub detail: TwtEventDetail,
}

impl TwtEvent {
    pub fn target(&self) -> TwtTarget {
        TwtTarget::from_wire(self.vdev_id, self.peer, self.dialog_id)
    }
}

/// Completion handed to a TWT callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwtResponse {
    pub command: TwtCommand,
    pub target: TwtTarget,
    pub status: TwtStatus,
    /// Set on setup responses for a dialog that was already set up
    pub renegotiation: bool,
    pub detail: TwtEventDetail,
}

pub type TwtCallback = Box<dyn FnOnce(TwtResponse) + Send>;

/// Why a TWT request was refused by the session store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TwtGuardError {
    #[error("{0} already in flight")]
    InFlight(TwtCommand),

    #[error("dialog {dialog_id} is {state:?}")]
    InvalidState {
        dialog_id: u8,
        state: TwtSessionState,
    },

    #[error("peer {0} has no room for another dialog")]
    TooManySessions(MacAddr),

    #[error("{0} needs a single peer and dialog")]
    NeedsSingleSession(TwtCommand),
}

/// Session changes produced by a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TwtApply {
    /// Setup response for an already set-up dialog
    pub renegotiation: bool,
    /// Sessions reinitialized by the response
    pub reset: Vec<(MacAddr, u8)>,
}

#[derive(Debug, Default)]
struct PeerContext {
    sessions: BTreeMap<u8, TwtSession>,
    /// Command addressed to every dialog of this peer
    all_dialogs_command: Option<TwtCommand>,
}

/// Store of all TWT sessions.
#[derive(Debug)]
pub struct TwtSessionStore {
    peers: HashMap<(VdevId, MacAddr), PeerContext>,
    /// Command addressed to every peer of a vdev
    all_peers: HashMap<VdevId, TwtCommand>,
    max_sessions_per_peer: usize,
}

impl TwtSessionStore {
    pub fn new(max_sessions_per_peer: usize) -> Self {
        Self {
            peers: HashMap::new(),
            all_peers: HashMap::new(),
            max_sessions_per_peer,
        }
    }

    /// Look up one session.
    pub fn session(&self, vdev_id: VdevId, peer: MacAddr, dialog_id: u8) -> Option<&TwtSession> {
        self.peers.get(&(vdev_id, peer))?.sessions.get(&dialog_id)
    }

    /// All sessions on a vdev, ordered by peer then dialog.
    pub fn sessions(&self, vdev_id: VdevId) -> Vec<(MacAddr, TwtSession)> {
        let mut sessions: Vec<(MacAddr, TwtSession)> = self
            .peers
            .iter()
            .filter(|((vdev, _), _)| *vdev == vdev_id)
            .flat_map(|((_, peer), ctx)| ctx.sessions.values().map(move |s| (*peer, *s)))
            .collect();
        sessions.sort_by_key(|(peer, s)| (*peer, s.dialog_id));
        sessions
    }

    /// Command in flight overlapping the target.
    pub fn in_flight(&self, target: &TwtTarget) -> Option<TwtCommand> {
        if let Some(command) = self.all_peers.get(&target.vdev_id) {
            return Some(*command);
        }

        self.peers
            .iter()
            .filter(|((vdev, peer), _)| *vdev == target.vdev_id && target.peer.matches(peer))
            .find_map(|(_, ctx)| {
                ctx.all_dialogs_command.or_else(|| {
                    ctx.sessions
                        .values()
                        .filter(|s| target.dialog.matches(s.dialog_id))
                        .find_map(|s| s.active_command)
                })
            })
    }

    /// Check whether `command` may be issued on `target` now.
    pub fn check(&self, target: &TwtTarget, command: TwtCommand) -> Result<(), TwtGuardError> {
        if let Some(active) = self.in_flight(target) {
            return Err(TwtGuardError::InFlight(active));
        }

        let Some((peer, dialog_id)) = target.single() else {
            if command.requires_single_session() {
                return Err(TwtGuardError::NeedsSingleSession(command));
            }
            return Ok(());
        };

        let session = self.session(target.vdev_id, peer, dialog_id);
        if !session.is_some_and(|s| s.in_use())
            && self.peer_session_count(target.vdev_id, peer) >= self.max_sessions_per_peer
        {
            return Err(TwtGuardError::TooManySessions(peer));
        }

        let state = session.map_or(TwtSessionState::NotEstablished, |s| s.state);
        let allowed = match command {
            TwtCommand::Suspend | TwtCommand::Nudge => {
                session.is_some_and(|s| s.setup_done) && state == TwtSessionState::Active
            }
            TwtCommand::Resume => state == TwtSessionState::Suspended,
            TwtCommand::Setup
            | TwtCommand::Terminate
            | TwtCommand::GetStats
            | TwtCommand::ClearStats => true,
        };

        if !allowed {
            return Err(TwtGuardError::InvalidState { dialog_id, state });
        }
        Ok(())
    }

    /// Mark `command` in flight on every session the target covers.
    pub fn begin(&mut self, target: &TwtTarget, command: TwtCommand) -> Result<(), TwtGuardError> {
        self.check(target, command)?;

        match (target.peer, target.dialog) {
            (PeerSelector::AllPeers, _) => {
                self.all_peers.insert(target.vdev_id, command);
            }
            (PeerSelector::Unicast(peer), DialogSelector::All) => {
                self.peers
                    .entry((target.vdev_id, peer))
                    .or_default()
                    .all_dialogs_command = Some(command);
            }
            (PeerSelector::Unicast(peer), DialogSelector::Id(dialog_id)) => {
                self.peers
                    .entry((target.vdev_id, peer))
                    .or_default()
                    .sessions
                    .entry(dialog_id)
                    .or_insert_with(|| TwtSession::new(dialog_id));
            }
        }

        for (_, session) in self.covered_mut(target) {
            session.active_command = Some(command);
        }

        tracing::debug!("TWT {} in flight on {}", command, target);
        Ok(())
    }

    /// Clear the in-flight marks `begin` set for `command`.
    pub fn finish(&mut self, target: &TwtTarget, command: TwtCommand) {
        if self.all_peers.get(&target.vdev_id) == Some(&command)
            && target.peer == PeerSelector::AllPeers
        {
            self.all_peers.remove(&target.vdev_id);
        }

        if let (PeerSelector::Unicast(peer), DialogSelector::All) = (target.peer, target.dialog) {
            if let Some(ctx) = self.peers.get_mut(&(target.vdev_id, peer)) {
                if ctx.all_dialogs_command == Some(command) {
                    ctx.all_dialogs_command = None;
                }
            }
        }

        for (_, session) in self.covered_mut(target) {
            if session.active_command == Some(command) {
                session.active_command = None;
            }
        }
    }

    /// Apply a response status for `command` to the covered sessions.
    pub fn apply(&mut self, target: &TwtTarget, command: TwtCommand, status: TwtStatus) -> TwtApply {
        let mut outcome = TwtApply::default();

        if command == TwtCommand::Setup && status.is_ok() {
            if let Some((peer, dialog_id)) = target.single() {
                if self.session(target.vdev_id, peer, dialog_id).is_none()
                    && self.peer_session_count(target.vdev_id, peer) < self.max_sessions_per_peer
                {
                    self.peers
                        .entry((target.vdev_id, peer))
                        .or_default()
                        .sessions
                        .insert(dialog_id, TwtSession::new(dialog_id));
                }
            }
        }

        // Dialogs that only existed to guard a query or teardown are dropped
        let mut placeholders = Vec::new();

        for (peer, session) in self.covered_mut(target) {
            let before = *session;
            if matches!(
                command,
                TwtCommand::Terminate | TwtCommand::GetStats | TwtCommand::ClearStats
            ) && !before.in_use()
            {
                placeholders.push((peer, session.dialog_id));
            }

            if status.forces_reset() {
                session.reinit();
                outcome.reset.push((peer, session.dialog_id));
            } else if status.is_ok() {
                match command {
                    TwtCommand::Setup => {
                        outcome.renegotiation |= session.setup_done;
                        session.state = TwtSessionState::Active;
                        session.setup_done = true;
                    }
                    TwtCommand::Suspend if session.state == TwtSessionState::Active => {
                        session.state = TwtSessionState::Suspended;
                    }
                    TwtCommand::Resume if session.state == TwtSessionState::Suspended => {
                        session.state = TwtSessionState::Active;
                    }
                    TwtCommand::Terminate => {
                        session.reinit();
                        outcome.reset.push((peer, session.dialog_id));
                    }
                    _ => {}
                }
            } else if command == TwtCommand::Setup {
                if session.setup_done {
                    // Renegotiation failed; the previous agreement may still be live
                    outcome.renegotiation = true;
                } else {
                    session.reinit();
                    outcome.reset.push((peer, session.dialog_id));
                }
            }

            if before.state != session.state || before.setup_done != session.setup_done {
                tracing::debug!(
                    "TWT vdev {} peer {} dialog {}: {:?} -> {:?} after {} ({:?})",
                    target.vdev_id,
                    peer,
                    session.dialog_id,
                    before.state,
                    session.state,
                    command,
                    status
                );
            }
        }

        for (peer, dialog_id) in placeholders {
            self.forget(target.vdev_id, peer, dialog_id);
        }

        outcome
    }

    fn forget(&mut self, vdev_id: VdevId, peer: MacAddr, dialog_id: u8) {
        if let Some(ctx) = self.peers.get_mut(&(vdev_id, peer)) {
            ctx.sessions.remove(&dialog_id);
            if ctx.sessions.is_empty() && ctx.all_dialogs_command.is_none() {
                self.peers.remove(&(vdev_id, peer));
            }
        }
    }

    /// Reinitialize every covered session without touching in-flight marks.
    ///
    /// Returns the sessions that were covered.
    pub fn force_reset(&mut self, target: &TwtTarget) -> Vec<(MacAddr, u8)> {
        self.covered_mut(target)
            .into_iter()
            .map(|(peer, session)| {
                session.reinit();
                (peer, session.dialog_id)
            })
            .collect()
    }

    /// Reinitialize every session on a vdev.
    pub fn reset_vdev(&mut self, vdev_id: VdevId) -> Vec<(MacAddr, u8)> {
        self.force_reset(&TwtTarget::all_peers(vdev_id))
    }

    /// Forget every session and in-flight mark on a vdev.
    pub fn remove_vdev(&mut self, vdev_id: VdevId) {
        self.peers.retain(|(vdev, _), _| *vdev != vdev_id);
        self.all_peers.remove(&vdev_id);
    }

    fn peer_session_count(&self, vdev_id: VdevId, peer: MacAddr) -> usize {
        self.peers
            .get(&(vdev_id, peer))
            .map_or(0, |ctx| ctx.sessions.values().filter(|s| s.in_use()).count())
    }

    fn covered_mut(&mut self, target: &TwtTarget) -> Vec<(MacAddr, &mut TwtSession)> {
        let target = *target;
        self.peers
            .iter_mut()
            .filter(move |((vdev, peer), _)| *vdev == target.vdev_id && target.peer.matches(peer))
            .flat_map(move |((_, peer), ctx)| {
                let peer = *peer;
                ctx.sessions
                    .values_mut()
                    .filter(move |s| target.dialog.matches(s.dialog_id))
                    .map(move |s| (peer, s))
            })
            .collect()
    }
}
