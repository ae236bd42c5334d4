//! Policy-manager request and completion types.
//!
//! Covers hardware-mode, dual-MAC, NSS and antenna-mode changes. The
//! policy manager decides when these happen; this layer only carries the
//! request to firmware and hands the raw status back together with the
//! caller's own `next_action` and `reason`, so the caller can chain its
//! follow-up step.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::VdevId;

/// Raw completion status reported to policy-manager callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyMgrStatus {
    Ok,
    InvalidParam,
    /// Request never reached firmware
    Cancelled,
    NotSupported,
    HardwareError,
    Pending,
    CoexConflict,
    Unknown(u32),
}

impl PolicyMgrStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, PolicyMgrStatus::Ok)
    }
}

impl From<u32> for PolicyMgrStatus {
    fn from(raw: u32) -> Self {
        match raw {
            0 => PolicyMgrStatus::Ok,
            1 => PolicyMgrStatus::InvalidParam,
            2 => PolicyMgrStatus::Cancelled,
            3 => PolicyMgrStatus::NotSupported,
            4 => PolicyMgrStatus::HardwareError,
            5 => PolicyMgrStatus::Pending,
            6 => PolicyMgrStatus::CoexConflict,
            other => PolicyMgrStatus::Unknown(other),
        }
    }
}

impl From<PolicyMgrStatus> for u32 {
    fn from(status: PolicyMgrStatus) -> Self {
        match status {
            PolicyMgrStatus::Ok => 0,
            PolicyMgrStatus::InvalidParam => 1,
            PolicyMgrStatus::Cancelled => 2,
            PolicyMgrStatus::NotSupported => 3,
            PolicyMgrStatus::HardwareError => 4,
            PolicyMgrStatus::Pending => 5,
            PolicyMgrStatus::CoexConflict => 6,
            PolicyMgrStatus::Unknown(raw) => raw,
        }
    }
}

/// Follow-up step the policy manager wants after completion.
///
/// Opaque to this layer; returned verbatim to the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NextAction(pub u32);

impl NextAction {
    pub const NONE: NextAction = NextAction(0);
}

/// Why the policy manager issued the request.
///
/// Opaque to this layer; returned verbatim to the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct UpdateReason(pub u32);

/// Operating channel width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelWidth {
    Mhz20,
    Mhz40,
    Mhz80,
    Mhz160,
    Mhz80P80,
    Mhz320,
}

impl fmt::Display for ChannelWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelWidth::Mhz20 => "20MHz",
            ChannelWidth::Mhz40 => "40MHz",
            ChannelWidth::Mhz80 => "80MHz",
            ChannelWidth::Mhz160 => "160MHz",
            ChannelWidth::Mhz80P80 => "80+80MHz",
            ChannelWidth::Mhz320 => "320MHz",
        };
        f.write_str(name)
    }
}

/// Highest spatial stream / chain count the firmware accepts.
pub const MAX_CHAINS: u8 = 4;

/// Vdev to MAC assignment after a hardware-mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdevMacMapping {
    pub vdev_id: VdevId,
    pub mac_id: u32,
}

// ============================================================================
// Set hardware mode
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetHwModeParams {
    /// Firmware hardware-mode index
    pub hw_mode_index: u32,
    /// Vdev the change is made on behalf of, if any
    pub session_id: Option<VdevId>,
    pub reason: UpdateReason,
    pub next_action: NextAction,
    /// Caller's request id, echoed back
    pub request_id: u32,
}

/// Firmware response to a hardware-mode change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetHwModeResponse {
    pub status: u32,
    pub cfgd_hw_mode_index: u32,
    pub vdev_mac_map: Vec<VdevMacMapping>,
}

/// Completion handed to the set-hw-mode callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetHwModeResult {
    pub status: PolicyMgrStatus,
    pub cfgd_hw_mode_index: u32,
    pub vdev_mac_map: Vec<VdevMacMapping>,
    pub session_id: Option<VdevId>,
    pub reason: UpdateReason,
    pub next_action: NextAction,
    pub request_id: u32,
}

impl SetHwModeResult {
    pub(crate) fn from_response(params: &SetHwModeParams, response: SetHwModeResponse) -> Self {
        Self {
            status: response.status.into(),
            cfgd_hw_mode_index: response.cfgd_hw_mode_index,
            vdev_mac_map: response.vdev_mac_map,
            session_id: params.session_id,
            reason: params.reason,
            next_action: params.next_action,
            request_id: params.request_id,
        }
    }

    pub(crate) fn failed(params: &SetHwModeParams, status: PolicyMgrStatus) -> Self {
        Self::from_response(
            params,
            SetHwModeResponse {
                status: status.into(),
                cfgd_hw_mode_index: 0,
                vdev_mac_map: Vec::new(),
            },
        )
    }
}

pub type SetHwModeCallback = Box<dyn FnOnce(SetHwModeResult) + Send>;

// ============================================================================
// Dual MAC configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualMacConfigParams {
    pub scan_config: u32,
    pub fw_mode_config: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualMacConfigResponse {
    pub status: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualMacConfigResult {
    pub status: PolicyMgrStatus,
    pub scan_config: u32,
    pub fw_mode_config: u32,
}

impl DualMacConfigResult {
    pub(crate) fn new(params: &DualMacConfigParams, status: PolicyMgrStatus) -> Self {
        Self {
            status,
            scan_config: params.scan_config,
            fw_mode_config: params.fw_mode_config,
        }
    }
}

pub type DualMacConfigCallback = Box<dyn FnOnce(DualMacConfigResult) + Send>;

// ============================================================================
// NSS update
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NssUpdateParams {
    pub vdev_id: VdevId,
    pub new_nss: u8,
    pub ch_width: ChannelWidth,
    pub next_action: NextAction,
    pub reason: UpdateReason,
    /// Vdev whose state change prompted the update
    pub original_vdev_id: VdevId,
    pub request_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NssUpdateResponse {
    pub status: u32,
    pub vdev_id: VdevId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NssUpdateResult {
    pub status: PolicyMgrStatus,
    pub vdev_id: VdevId,
    pub new_nss: u8,
    pub ch_width: ChannelWidth,
    pub next_action: NextAction,
    pub reason: UpdateReason,
    pub original_vdev_id: VdevId,
    pub request_id: u32,
}

impl NssUpdateResult {
    pub(crate) fn new(params: &NssUpdateParams, status: PolicyMgrStatus) -> Self {
        Self {
            status,
            vdev_id: params.vdev_id,
            new_nss: params.new_nss,
            ch_width: params.ch_width,
            next_action: params.next_action,
            reason: params.reason,
            original_vdev_id: params.original_vdev_id,
            request_id: params.request_id,
        }
    }
}

pub type NssUpdateCallback = Box<dyn FnOnce(NssUpdateResult) + Send>;

// ============================================================================
// Antenna mode
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntennaModeParams {
    pub num_tx_chains: u8,
    pub num_rx_chains: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntennaModeResponse {
    pub status: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntennaModeResult {
    pub status: PolicyMgrStatus,
    pub num_tx_chains: u8,
    pub num_rx_chains: u8,
}

impl AntennaModeResult {
    pub(crate) fn new(params: &AntennaModeParams, status: PolicyMgrStatus) -> Self {
        Self {
            status,
            num_tx_chains: params.num_tx_chains,
            num_rx_chains: params.num_rx_chains,
        }
    }
}

pub type AntennaModeCallback = Box<dyn FnOnce(AntennaModeResult) + Send>;

/// Check a spatial stream or chain count.
pub(crate) fn validate_chains(what: &str, count: u8) -> Result<(), String> {
    if count == 0 || count > MAX_CHAINS {
        return Err(format!("{} must be 1..={}, got {}", what, MAX_CHAINS, count));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_raw_conversion() {
        for raw in 0..8u32 {
            let status = PolicyMgrStatus::from(raw);
            assert_eq!(u32::from(status), raw);
        }
        assert_eq!(PolicyMgrStatus::from(42), PolicyMgrStatus::Unknown(42));
        assert!(PolicyMgrStatus::from(0).is_ok());
    }

    #[test]
    fn test_hw_mode_result_echoes_caller_context() {
        let params = SetHwModeParams {
            hw_mode_index: 3,
            session_id: Some(1),
            reason: UpdateReason(7),
            next_action: NextAction(2),
            request_id: 99,
        };
        let result = SetHwModeResult::from_response(
            &params,
            SetHwModeResponse {
                status: 0,
                cfgd_hw_mode_index: 3,
                vdev_mac_map: vec![VdevMacMapping { vdev_id: 1, mac_id: 0 }],
            },
        );

        assert!(result.status.is_ok());
        assert_eq!(result.next_action, NextAction(2));
        assert_eq!(result.reason, UpdateReason(7));
        assert_eq!(result.request_id, 99);
        assert_eq!(result.vdev_mac_map.len(), 1);

        let failed = SetHwModeResult::failed(&params, PolicyMgrStatus::Cancelled);
        assert_eq!(failed.status, PolicyMgrStatus::Cancelled);
        assert!(failed.vdev_mac_map.is_empty());
    }

    #[test]
    fn test_validate_chains() {
        assert!(validate_chains("nss", 1).is_ok());
        assert!(validate_chains("nss", MAX_CHAINS).is_ok());
        assert!(validate_chains("nss", 0).is_err());
        assert!(validate_chains("nss", MAX_CHAINS + 1).is_err());
    }
}
