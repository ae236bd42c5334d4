//! Per-vdev roam state.
//!
//! The coarse state follows the roam-offload engine in firmware. The
//! neighbor sub-state follows the association, and decides whether an
//! asynchronous roam notification is serviced, ignored, or treated as a
//! divergence between host and firmware that needs recovery.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{MacAddr, VdevId};

/// Coarse roam state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoamState {
    /// Roam offload not running
    Init,
    /// Offload running, no roam in progress
    Idle,
    /// Firmware is roaming
    Active,
    /// Offload configuration being refreshed
    Reflash,
}

/// Neighbor-roam sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NeighborRoamState {
    Init,
    Connected,
    Preauthenticating,
    PreauthDone,
}

/// Roam-offload control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RsoCommand {
    Start,
    Stop,
    Update,
}

/// Roam command in flight for a vdev.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoamCommand {
    Invoke,
    Offload(RsoCommand),
}

impl fmt::Display for RoamCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoamCommand::Invoke => write!(f, "roam invoke"),
            RoamCommand::Offload(rso) => write!(f, "rso {:?}", rso),
        }
    }
}

/// Host-triggered roam to a given BSS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoamInvokeParams {
    pub vdev_id: VdevId,
    pub bssid: MacAddr,
    pub channel_freq: u32,
    /// Roam even if the target is the current BSS
    pub forced: bool,
}

/// Firmware response to a roam command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoamCommandResponse {
    pub vdev_id: VdevId,
    pub status: u32,
}

impl RoamCommandResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// Completion handed to a roam callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoamResult {
    pub vdev_id: VdevId,
    pub command: RoamCommand,
    pub success: bool,
    /// Raw firmware status, or `u32::MAX` when the request never reached firmware
    pub status: u32,
}

pub type RoamCallback = Box<dyn FnOnce(RoamResult) + Send>;

/// Unsolicited roam notification from firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoamNotification {
    Start { vdev_id: VdevId },
    PreauthComplete { vdev_id: VdevId, success: bool },
    Synch { vdev_id: VdevId, bssid: MacAddr },
    Abort { vdev_id: VdevId },
}

impl RoamNotification {
    pub fn vdev_id(&self) -> VdevId {
        match self {
            RoamNotification::Start { vdev_id }
            | RoamNotification::PreauthComplete { vdev_id, .. }
            | RoamNotification::Synch { vdev_id, .. }
            | RoamNotification::Abort { vdev_id } => *vdev_id,
        }
    }
}

/// What to do with a roam notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoamDisposition {
    Serviced,
    Ignored(&'static str),
    /// Host and firmware disagree on roam state
    Recover(String),
}

/// Why a roam request was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoamGuardError {
    #[error("vdev {0} has no roam context")]
    UnknownVdev(VdevId),

    #[error("{0} already in flight")]
    InFlight(RoamCommand),

    #[error("roam in progress")]
    Roaming,

    #[error("vdev is {0:?}")]
    NotConnected(NeighborRoamState),

    #[error("roam offload is {0:?}")]
    InvalidState(RoamState),
}

/// Roam context of one vdev.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoamContext {
    pub vdev_id: VdevId,
    pub state: RoamState,
    pub neighbor: NeighborRoamState,
    pub bssid: Option<MacAddr>,
    pub active_command: Option<RoamCommand>,
}

impl RoamContext {
    fn new(vdev_id: VdevId) -> Self {
        Self {
            vdev_id,
            state: RoamState::Init,
            neighbor: NeighborRoamState::Init,
            bssid: None,
            active_command: None,
        }
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.neighbor,
            NeighborRoamState::Connected
                | NeighborRoamState::Preauthenticating
                | NeighborRoamState::PreauthDone
        )
    }
}

/// Roam contexts of all vdevs.
#[derive(Debug, Default)]
pub struct RoamStateStore {
    contexts: HashMap<VdevId, RoamContext>,
}

impl RoamStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, vdev_id: VdevId) {
        self.contexts
            .entry(vdev_id)
            .or_insert_with(|| RoamContext::new(vdev_id));
    }

    pub fn remove(&mut self, vdev_id: VdevId) -> Option<RoamContext> {
        self.contexts.remove(&vdev_id)
    }

    pub fn get(&self, vdev_id: VdevId) -> Option<&RoamContext> {
        self.contexts.get(&vdev_id)
    }

    /// Whether firmware is currently roaming on the vdev.
    pub fn is_roaming(&self, vdev_id: VdevId) -> bool {
        self.contexts
            .get(&vdev_id)
            .is_some_and(|ctx| ctx.state == RoamState::Active)
    }

    /// Association completed.
    pub fn connected(&mut self, vdev_id: VdevId, bssid: MacAddr) {
        if let Some(ctx) = self.contexts.get_mut(&vdev_id) {
            ctx.neighbor = NeighborRoamState::Connected;
            ctx.bssid = Some(bssid);
        }
    }

    /// Association lost. Offload stops with it.
    pub fn disconnected(&mut self, vdev_id: VdevId) {
        if let Some(ctx) = self.contexts.get_mut(&vdev_id) {
            ctx.neighbor = NeighborRoamState::Init;
            ctx.state = RoamState::Init;
            ctx.bssid = None;
        }
    }

    /// Check whether `command` may be issued on the vdev now.
    pub fn check(&self, vdev_id: VdevId, command: RoamCommand) -> Result<(), RoamGuardError> {
        let ctx = self
            .contexts
            .get(&vdev_id)
            .ok_or(RoamGuardError::UnknownVdev(vdev_id))?;

        if let Some(active) = ctx.active_command {
            return Err(RoamGuardError::InFlight(active));
        }

        match command {
            RoamCommand::Invoke => {
                if ctx.state == RoamState::Active {
                    return Err(RoamGuardError::Roaming);
                }
                if ctx.neighbor != NeighborRoamState::Connected {
                    return Err(RoamGuardError::NotConnected(ctx.neighbor));
                }
            }
            RoamCommand::Offload(RsoCommand::Start) => {
                if !ctx.is_connected() {
                    return Err(RoamGuardError::NotConnected(ctx.neighbor));
                }
            }
            RoamCommand::Offload(RsoCommand::Update) => {
                if ctx.state != RoamState::Idle {
                    return Err(RoamGuardError::InvalidState(ctx.state));
                }
            }
            RoamCommand::Offload(RsoCommand::Stop) => {}
        }
        Ok(())
    }

    /// Mark `command` in flight.
    pub fn begin(&mut self, vdev_id: VdevId, command: RoamCommand) -> Result<(), RoamGuardError> {
        self.check(vdev_id, command)?;
        if let Some(ctx) = self.contexts.get_mut(&vdev_id) {
            ctx.active_command = Some(command);
            if command == RoamCommand::Offload(RsoCommand::Update) {
                ctx.state = RoamState::Reflash;
            }
        }
        Ok(())
    }

    /// Response arrived for `command`.
    pub fn finish(&mut self, vdev_id: VdevId, command: RoamCommand, success: bool) {
        let Some(ctx) = self.contexts.get_mut(&vdev_id) else {
            return;
        };
        if ctx.active_command == Some(command) {
            ctx.active_command = None;
        }

        let before = ctx.state;
        match command {
            RoamCommand::Invoke if success => {
                ctx.state = RoamState::Active;
                ctx.neighbor = NeighborRoamState::Preauthenticating;
            }
            RoamCommand::Invoke => {}
            RoamCommand::Offload(RsoCommand::Start) if success => ctx.state = RoamState::Idle,
            RoamCommand::Offload(RsoCommand::Stop) if success => ctx.state = RoamState::Init,
            RoamCommand::Offload(RsoCommand::Update) => {
                if ctx.state == RoamState::Reflash {
                    ctx.state = RoamState::Idle;
                }
            }
            RoamCommand::Offload(_) => {}
        }

        if before != ctx.state {
            tracing::debug!(
                "Roam vdev {}: {:?} -> {:?} after {}",
                vdev_id,
                before,
                ctx.state,
                command
            );
        }
    }

    /// Command left the queue without a response.
    pub fn abort(&mut self, vdev_id: VdevId, command: RoamCommand) {
        if let Some(ctx) = self.contexts.get_mut(&vdev_id) {
            if ctx.active_command == Some(command) {
                ctx.active_command = None;
            }
            if ctx.state == RoamState::Reflash {
                ctx.state = RoamState::Idle;
            }
        }
    }

    /// Apply a firmware roam notification.
    pub fn on_notification(&mut self, notification: &RoamNotification) -> RoamDisposition {
        let vdev_id = notification.vdev_id();
        let Some(ctx) = self.contexts.get_mut(&vdev_id) else {
            return RoamDisposition::Ignored("unknown vdev");
        };

        if ctx.neighbor == NeighborRoamState::Init {
            return RoamDisposition::Ignored("not connected");
        }

        match *notification {
            RoamNotification::Start { .. } => match ctx.state {
                RoamState::Active => RoamDisposition::Ignored("roam already started"),
                RoamState::Init => {
                    RoamDisposition::Recover("roam start while offload is stopped".to_string())
                }
                RoamState::Idle | RoamState::Reflash => {
                    ctx.state = RoamState::Active;
                    ctx.neighbor = NeighborRoamState::Preauthenticating;
                    RoamDisposition::Serviced
                }
            },
            RoamNotification::PreauthComplete { success, .. } => {
                if ctx.neighbor != NeighborRoamState::Preauthenticating {
                    return RoamDisposition::Ignored("no preauthentication in progress");
                }
                if success {
                    ctx.neighbor = NeighborRoamState::PreauthDone;
                } else {
                    ctx.neighbor = NeighborRoamState::Connected;
                    ctx.state = RoamState::Idle;
                }
                RoamDisposition::Serviced
            }
            RoamNotification::Synch { bssid, .. } => {
                if ctx.state != RoamState::Active {
                    return RoamDisposition::Recover(format!(
                        "roam synch to {} while {:?}",
                        bssid, ctx.state
                    ));
                }
                ctx.state = RoamState::Idle;
                ctx.neighbor = NeighborRoamState::Connected;
                ctx.bssid = Some(bssid);
                RoamDisposition::Serviced
            }
            RoamNotification::Abort { .. } => {
                if ctx.state != RoamState::Active {
                    return RoamDisposition::Ignored("no roam in progress");
                }
                ctx.state = RoamState::Idle;
                ctx.neighbor = NeighborRoamState::Connected;
                RoamDisposition::Serviced
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AP: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 1]);
    const NEW_AP: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 2]);

    fn offloading() -> RoamStateStore {
        let mut store = RoamStateStore::new();
        store.add(0);
        store.connected(0, AP);
        let start = RoamCommand::Offload(RsoCommand::Start);
        store.begin(0, start).unwrap();
        store.finish(0, start, true);
        store
    }

    #[test]
    fn test_rso_start_moves_to_idle() {
        let store = offloading();
        let ctx = store.get(0).unwrap();
        assert_eq!(ctx.state, RoamState::Idle);
        assert_eq!(ctx.active_command, None);
    }

    #[test]
    fn test_rso_start_requires_connection() {
        let mut store = RoamStateStore::new();
        store.add(0);
        assert_eq!(
            store.check(0, RoamCommand::Offload(RsoCommand::Start)),
            Err(RoamGuardError::NotConnected(NeighborRoamState::Init))
        );
        assert_eq!(
            store.check(3, RoamCommand::Invoke),
            Err(RoamGuardError::UnknownVdev(3))
        );
    }

    #[test]
    fn test_second_roam_command_rejected() {
        let mut store = offloading();
        store.begin(0, RoamCommand::Invoke).unwrap();
        assert_eq!(
            store.check(0, RoamCommand::Offload(RsoCommand::Stop)),
            Err(RoamGuardError::InFlight(RoamCommand::Invoke))
        );
    }

    #[test]
    fn test_full_roam_sequence() {
        let mut store = offloading();

        assert_eq!(
            store.on_notification(&RoamNotification::Start { vdev_id: 0 }),
            RoamDisposition::Serviced
        );
        assert!(store.is_roaming(0));
        assert_eq!(
            store.check(0, RoamCommand::Invoke),
            Err(RoamGuardError::Roaming)
        );

        store.on_notification(&RoamNotification::PreauthComplete {
            vdev_id: 0,
            success: true,
        });
        assert_eq!(store.get(0).unwrap().neighbor, NeighborRoamState::PreauthDone);

        assert_eq!(
            store.on_notification(&RoamNotification::Synch {
                vdev_id: 0,
                bssid: NEW_AP
            }),
            RoamDisposition::Serviced
        );
        let ctx = store.get(0).unwrap();
        assert_eq!(ctx.state, RoamState::Idle);
        assert_eq!(ctx.neighbor, NeighborRoamState::Connected);
        assert_eq!(ctx.bssid, Some(NEW_AP));
    }

    #[test]
    fn test_synch_without_start_needs_recovery() {
        let mut store = offloading();
        let disposition = store.on_notification(&RoamNotification::Synch {
            vdev_id: 0,
            bssid: NEW_AP,
        });
        assert!(matches!(disposition, RoamDisposition::Recover(_)));
    }

    #[test]
    fn test_notifications_ignored_when_disconnected() {
        let mut store = offloading();
        store.disconnected(0);

        assert!(matches!(
            store.on_notification(&RoamNotification::Start { vdev_id: 0 }),
            RoamDisposition::Ignored(_)
        ));
        assert!(matches!(
            store.on_notification(&RoamNotification::Abort { vdev_id: 9 }),
            RoamDisposition::Ignored(_)
        ));
    }

    #[test]
    fn test_abort_returns_to_idle() {
        let mut store = offloading();
        store.on_notification(&RoamNotification::Start { vdev_id: 0 });

        assert_eq!(
            store.on_notification(&RoamNotification::Abort { vdev_id: 0 }),
            RoamDisposition::Serviced
        );
        assert_eq!(store.get(0).unwrap().state, RoamState::Idle);
    }

    #[test]
    fn test_invoke_success_starts_roam() {
        let mut store = offloading();
        store.begin(0, RoamCommand::Invoke).unwrap();
        store.finish(0, RoamCommand::Invoke, true);

        assert!(store.is_roaming(0));
        assert_eq!(
            store.get(0).unwrap().neighbor,
            NeighborRoamState::Preauthenticating
        );
    }

    #[test]
    fn test_update_reflash_reverts_on_abort() {
        let mut store = offloading();
        let update = RoamCommand::Offload(RsoCommand::Update);
        store.begin(0, update).unwrap();
        assert_eq!(store.get(0).unwrap().state, RoamState::Reflash);

        store.abort(0, update);
        let ctx = store.get(0).unwrap();
        assert_eq!(ctx.state, RoamState::Idle);
        assert_eq!(ctx.active_command, None);
    }
}
