//! Station management command kinds and payloads.

use std::fmt;

use serde::{Deserialize, Serialize};
use wlancm_commands::{Command, CommandKind, SerializationQueue};

use crate::policy::{
    AntennaModeCallback, AntennaModeParams, DualMacConfigCallback, DualMacConfigParams,
    NssUpdateCallback, NssUpdateParams, SetHwModeCallback, SetHwModeParams,
};
use crate::roam::{RoamCallback, RoamInvokeParams, RsoCommand};
use crate::transport::FirmwareRequest;
use crate::twt::{TwtCallback, TwtCommand, TwtParams, TwtTarget};
use crate::types::VdevId;

/// Family a command kind belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandClass {
    PolicyManager,
    Twt,
    Roam,
}

/// Kind of a firmware command, matched against the kind of its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SmeCommandKind {
    SetHwMode,
    DualMacConfig,
    NssUpdate,
    AntennaMode,
    Twt(TwtCommand),
    RoamInvoke,
    RoamOffload,
}

impl SmeCommandKind {
    pub fn class(&self) -> CommandClass {
        match self {
            SmeCommandKind::SetHwMode
            | SmeCommandKind::DualMacConfig
            | SmeCommandKind::NssUpdate
            | SmeCommandKind::AntennaMode => CommandClass::PolicyManager,
            SmeCommandKind::Twt(_) => CommandClass::Twt,
            SmeCommandKind::RoamInvoke | SmeCommandKind::RoamOffload => CommandClass::Roam,
        }
    }
}

impl CommandKind for SmeCommandKind {
    fn affects_connection(&self) -> bool {
        matches!(
            self,
            SmeCommandKind::SetHwMode
                | SmeCommandKind::NssUpdate
                | SmeCommandKind::RoamInvoke
                | SmeCommandKind::RoamOffload
        )
    }

    fn releases_on_mismatch(&self) -> bool {
        self.class() == CommandClass::PolicyManager
    }
}

impl fmt::Display for SmeCommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmeCommandKind::SetHwMode => write!(f, "set_hw_mode"),
            SmeCommandKind::DualMacConfig => write!(f, "dual_mac_config"),
            SmeCommandKind::NssUpdate => write!(f, "nss_update"),
            SmeCommandKind::AntennaMode => write!(f, "antenna_mode"),
            SmeCommandKind::Twt(command) => write!(f, "twt_{}", command),
            SmeCommandKind::RoamInvoke => write!(f, "roam_invoke"),
            SmeCommandKind::RoamOffload => write!(f, "roam_offload"),
        }
    }
}

/// Request payload, including the owner's completion callback.
pub enum Request {
    SetHwMode {
        params: SetHwModeParams,
        callback: SetHwModeCallback,
    },
    DualMacConfig {
        params: DualMacConfigParams,
        callback: DualMacConfigCallback,
    },
    NssUpdate {
        params: NssUpdateParams,
        callback: NssUpdateCallback,
    },
    AntennaMode {
        params: AntennaModeParams,
        callback: AntennaModeCallback,
    },
    Twt {
        command: TwtCommand,
        target: TwtTarget,
        params: TwtParams,
        callback: TwtCallback,
    },
    RoamInvoke {
        params: RoamInvokeParams,
        callback: RoamCallback,
    },
    RoamOffload {
        vdev_id: VdevId,
        command: RsoCommand,
        callback: RoamCallback,
    },
}

impl Request {
    pub fn kind(&self) -> SmeCommandKind {
        match self {
            Request::SetHwMode { .. } => SmeCommandKind::SetHwMode,
            Request::DualMacConfig { .. } => SmeCommandKind::DualMacConfig,
            Request::NssUpdate { .. } => SmeCommandKind::NssUpdate,
            Request::AntennaMode { .. } => SmeCommandKind::AntennaMode,
            Request::Twt { command, .. } => SmeCommandKind::Twt(*command),
            Request::RoamInvoke { .. } => SmeCommandKind::RoamInvoke,
            Request::RoamOffload { .. } => SmeCommandKind::RoamOffload,
        }
    }

    /// Wire form handed to the transport.
    pub fn to_wire(&self) -> FirmwareRequest {
        match self {
            Request::SetHwMode { params, .. } => FirmwareRequest::SetHwMode {
                hw_mode_index: params.hw_mode_index,
            },
            Request::DualMacConfig { params, .. } => FirmwareRequest::DualMacConfig(*params),
            Request::NssUpdate { params, .. } => FirmwareRequest::NssUpdate {
                vdev_id: params.vdev_id,
                new_nss: params.new_nss,
                ch_width: params.ch_width,
            },
            Request::AntennaMode { params, .. } => FirmwareRequest::AntennaMode(*params),
            Request::Twt {
                command,
                target,
                params,
                ..
            } => FirmwareRequest::Twt {
                command: *command,
                vdev_id: target.vdev_id,
                peer: target.peer.wire_addr(),
                dialog_id: target.dialog.wire_id(),
                params: *params,
            },
            Request::RoamInvoke { params, .. } => FirmwareRequest::RoamInvoke(*params),
            Request::RoamOffload {
                vdev_id, command, ..
            } => FirmwareRequest::RoamOffload {
                vdev_id: *vdev_id,
                command: *command,
            },
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("kind", &self.kind())
            .field("wire", &self.to_wire())
            .finish_non_exhaustive()
    }
}

pub type SmeCommand = Command<SmeCommandKind, Request>;
pub type SmeQueue = SerializationQueue<SmeCommandKind, Request>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MacAddr;

    #[test]
    fn test_kind_classes() {
        assert_eq!(SmeCommandKind::NssUpdate.class(), CommandClass::PolicyManager);
        assert_eq!(
            SmeCommandKind::Twt(TwtCommand::Nudge).class(),
            CommandClass::Twt
        );
        assert_eq!(SmeCommandKind::RoamOffload.class(), CommandClass::Roam);
    }

    #[test]
    fn test_connection_affecting_kinds() {
        assert!(SmeCommandKind::SetHwMode.affects_connection());
        assert!(SmeCommandKind::RoamInvoke.affects_connection());
        assert!(!SmeCommandKind::AntennaMode.affects_connection());
        assert!(!SmeCommandKind::Twt(TwtCommand::Setup).affects_connection());
    }

    #[test]
    fn test_mismatch_release_is_policy_manager_only() {
        assert!(SmeCommandKind::DualMacConfig.releases_on_mismatch());
        assert!(SmeCommandKind::AntennaMode.releases_on_mismatch());
        assert!(!SmeCommandKind::Twt(TwtCommand::Terminate).releases_on_mismatch());
        assert!(!SmeCommandKind::RoamInvoke.releases_on_mismatch());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(SmeCommandKind::SetHwMode.to_string(), "set_hw_mode");
        assert_eq!(
            SmeCommandKind::Twt(TwtCommand::ClearStats).to_string(),
            "twt_clear_stats"
        );
    }

    #[test]
    fn test_twt_wire_addressing() {
        let request = Request::Twt {
            command: TwtCommand::Terminate,
            target: TwtTarget::all_peers(1),
            params: TwtParams::None,
            callback: Box::new(|_| {}),
        };

        assert_eq!(request.kind(), SmeCommandKind::Twt(TwtCommand::Terminate));
        match request.to_wire() {
            FirmwareRequest::Twt {
                vdev_id,
                peer,
                dialog_id,
                ..
            } => {
                assert_eq!(vdev_id, 1);
                assert_eq!(peer, MacAddr::BROADCAST);
                assert_eq!(dialog_id, crate::twt::ALL_DIALOGS);
            }
            other => panic!("unexpected wire request: {:?}", other),
        }
    }
}
