//! Request operations exposed to the policy layer.
//!
//! Every operation validates against current session state, takes a slot
//! from the command pool and queues the command. The callback fires exactly
//! once if the command completes or is refused by the transport, and never
//! if it is cancelled, times out or is dropped on a mismatched response.

use crate::command::Request;
use crate::context::{CommandTicket, MacContext};
use crate::error::{RequestError, Result};
use crate::policy::{
    AntennaModeCallback, AntennaModeParams, DualMacConfigCallback, DualMacConfigParams,
    NssUpdateCallback, NssUpdateParams, SetHwModeCallback, SetHwModeParams, validate_chains,
};
use crate::roam::{RoamCallback, RoamCommand, RoamGuardError, RoamInvokeParams, RsoCommand};
use crate::twt::{
    TwtCallback, TwtCommand, TwtGuardError, TwtNudgeParams, TwtParams,
    TwtResumeParams, TwtSetupParams, TwtTarget,
};
use crate::types::{PDEV_VDEV_ID, VdevId, VdevRole};

impl MacContext {
    // ========================================================================
    // Policy manager
    // ========================================================================

    /// Switch the hardware mode.
    ///
    /// `params.session_id`, when set, names the vdev that asked for the
    /// change; otherwise the command is device-wide.
    pub fn set_hw_mode(
        &self,
        params: SetHwModeParams,
        callback: SetHwModeCallback,
    ) -> Result<CommandTicket> {
        let session = params.session_id;
        self.admit(
            session.unwrap_or(PDEV_VDEV_ID),
            Request::SetHwMode { params, callback },
            move |st| match session {
                Some(vdev_id) => st.require_vdev(vdev_id).map(|_| ()),
                None => Ok(()),
            },
            |_| Ok(()),
        )
    }

    /// Configure dual-MAC scan and firmware mode.
    pub fn dual_mac_config(
        &self,
        params: DualMacConfigParams,
        callback: DualMacConfigCallback,
    ) -> Result<CommandTicket> {
        self.admit(
            PDEV_VDEV_ID,
            Request::DualMacConfig { params, callback },
            |_| Ok(()),
            |_| Ok(()),
        )
    }

    /// Change the spatial-stream count of a vdev.
    pub fn nss_update_request(
        &self,
        params: NssUpdateParams,
        callback: NssUpdateCallback,
    ) -> Result<CommandTicket> {
        let vdev_id = params.vdev_id;
        let new_nss = params.new_nss;
        self.admit(
            vdev_id,
            Request::NssUpdate { params, callback },
            move |st| {
                st.require_vdev(vdev_id)?;
                validate_chains("nss", new_nss).map_err(RequestError::InvalidParam)
            },
            |_| Ok(()),
        )
    }

    /// Set the number of active transmit and receive chains.
    pub fn antenna_mode(
        &self,
        params: AntennaModeParams,
        callback: AntennaModeCallback,
    ) -> Result<CommandTicket> {
        let (tx, rx) = (params.num_tx_chains, params.num_rx_chains);
        self.admit(
            PDEV_VDEV_ID,
            Request::AntennaMode { params, callback },
            move |_| {
                validate_chains("tx chains", tx).map_err(RequestError::InvalidParam)?;
                validate_chains("rx chains", rx).map_err(RequestError::InvalidParam)
            },
            |_| Ok(()),
        )
    }

    // ========================================================================
    // Target wake time
    // ========================================================================

    /// Negotiate a new TWT agreement, or renegotiate an existing one.
    pub fn add_dialog(
        &self,
        target: TwtTarget,
        params: TwtSetupParams,
        callback: TwtCallback,
    ) -> Result<CommandTicket> {
        self.twt_request(target, TwtCommand::Setup, TwtParams::Setup(params), callback)
    }

    /// Tear down one dialog, every dialog of a peer, or every peer.
    pub fn del_dialog(&self, target: TwtTarget, callback: TwtCallback) -> Result<CommandTicket> {
        self.twt_request(target, TwtCommand::Terminate, TwtParams::None, callback)
    }

    /// Suspend active sessions.
    pub fn pause_dialog(&self, target: TwtTarget, callback: TwtCallback) -> Result<CommandTicket> {
        self.twt_request(target, TwtCommand::Suspend, TwtParams::None, callback)
    }

    /// Resume a suspended session.
    pub fn resume_dialog(
        &self,
        target: TwtTarget,
        params: TwtResumeParams,
        callback: TwtCallback,
    ) -> Result<CommandTicket> {
        self.twt_request(target, TwtCommand::Resume, TwtParams::Resume(params), callback)
    }

    /// Shift the next service period of an active session.
    pub fn nudge_dialog(
        &self,
        target: TwtTarget,
        params: TwtNudgeParams,
        callback: TwtCallback,
    ) -> Result<CommandTicket> {
        self.twt_request(target, TwtCommand::Nudge, TwtParams::Nudge(params), callback)
    }

    pub fn twt_get_stats(&self, target: TwtTarget, callback: TwtCallback) -> Result<CommandTicket> {
        self.twt_request(target, TwtCommand::GetStats, TwtParams::None, callback)
    }

    pub fn twt_clear_stats(
        &self,
        target: TwtTarget,
        callback: TwtCallback,
    ) -> Result<CommandTicket> {
        self.twt_request(target, TwtCommand::ClearStats, TwtParams::None, callback)
    }

    fn twt_request(
        &self,
        target: TwtTarget,
        command: TwtCommand,
        params: TwtParams,
        callback: TwtCallback,
    ) -> Result<CommandTicket> {
        self.admit(
            target.vdev_id,
            Request::Twt {
                command,
                target,
                params,
                callback,
            },
            move |st| {
                st.require_vdev(target.vdev_id)?;
                if st.roam.is_roaming(target.vdev_id) {
                    return Err(RequestError::Busy(format!(
                        "vdev {} is roaming",
                        target.vdev_id
                    )));
                }
                st.twt
                    .check(&target, command)
                    .map_err(|e| twt_conflict(command, e))
            },
            move |st| {
                st.twt
                    .begin(&target, command)
                    .map_err(|e| twt_conflict(command, e))
            },
        )
    }

    // ========================================================================
    // Roaming
    // ========================================================================

    /// Roam to a specific BSS.
    pub fn roam_invoke(
        &self,
        params: RoamInvokeParams,
        callback: RoamCallback,
    ) -> Result<CommandTicket> {
        let vdev_id = params.vdev_id;
        self.roam_request(
            vdev_id,
            RoamCommand::Invoke,
            Request::RoamInvoke { params, callback },
        )
    }

    /// Start, stop or update firmware roam offload.
    pub fn roam_offload(
        &self,
        vdev_id: VdevId,
        command: RsoCommand,
        callback: RoamCallback,
    ) -> Result<CommandTicket> {
        self.roam_request(
            vdev_id,
            RoamCommand::Offload(command),
            Request::RoamOffload {
                vdev_id,
                command,
                callback,
            },
        )
    }

    fn roam_request(
        &self,
        vdev_id: VdevId,
        command: RoamCommand,
        request: Request,
    ) -> Result<CommandTicket> {
        self.admit(
            vdev_id,
            request,
            move |st| {
                if st.require_vdev(vdev_id)?.role != VdevRole::Sta {
                    return Err(RequestError::InvalidParam(format!(
                        "vdev {} is not a station",
                        vdev_id
                    )));
                }
                st.roam.check(vdev_id, command).map_err(roam_conflict)
            },
            move |st| st.roam.begin(vdev_id, command).map_err(roam_conflict),
        )
    }
}

fn twt_conflict(command: TwtCommand, e: TwtGuardError) -> RequestError {
    match e {
        TwtGuardError::InFlight(_) if command.conflict_is_pending() => {
            RequestError::Pending(e.to_string())
        }
        TwtGuardError::InFlight(_) => RequestError::Busy(e.to_string()),
        TwtGuardError::InvalidState { .. } => RequestError::InvalidState(e.to_string()),
        TwtGuardError::TooManySessions(_) => RequestError::NoMemory(e.to_string()),
        TwtGuardError::NeedsSingleSession(_) => RequestError::InvalidParam(e.to_string()),
    }
}

fn roam_conflict(e: RoamGuardError) -> RequestError {
    match e {
        RoamGuardError::UnknownVdev(vdev_id) => RequestError::InvalidVdev(vdev_id),
        RoamGuardError::InFlight(_) | RoamGuardError::Roaming => {
            RequestError::Busy(e.to_string())
        }
        RoamGuardError::NotConnected(_) | RoamGuardError::InvalidState(_) => {
            RequestError::InvalidState(e.to_string())
        }
    }
}
