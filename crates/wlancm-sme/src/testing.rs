//! Test doubles for the transport, notifier and recovery seams.
//!
//! Used by the integration tests and by the simulator binary.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::command::SmeCommandKind;
use crate::notify::{SmeNotifier, TwtTeardown};
use crate::policy::{
    AntennaModeResponse, DualMacConfigResponse, NssUpdateResponse, SetHwModeResponse,
};
use crate::recovery::{RecoveryHandler, RecoveryReason};
use crate::roam::RoamCommandResponse;
use crate::transport::{EventSender, FirmwareEvent, FirmwareRequest, QueueStatus, Transport};
use crate::twt::{TwtCommand, TwtEvent, TwtEventDetail, TwtParams, TwtStatus};
use crate::types::{MacAddr, VdevId};

/// One request handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedRequest {
    pub vdev_id: VdevId,
    pub kind: SmeCommandKind,
    pub request: FirmwareRequest,
}

/// Transport that records every post and never answers.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    posts: Mutex<Vec<PostedRequest>>,
    scripted: Mutex<VecDeque<QueueStatus>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer the next post with `status` instead of success.
    pub fn script(&self, status: QueueStatus) {
        self.scripted.lock().push_back(status);
    }

    pub fn posts(&self) -> Vec<PostedRequest> {
        self.posts.lock().clone()
    }

    pub fn post_count(&self) -> usize {
        self.posts.lock().len()
    }

    pub fn last(&self) -> Option<PostedRequest> {
        self.posts.lock().last().cloned()
    }

    pub fn kinds(&self) -> Vec<SmeCommandKind> {
        self.posts.lock().iter().map(|p| p.kind).collect()
    }
}

impl Transport for RecordingTransport {
    fn post(
        &self,
        vdev_id: VdevId,
        kind: SmeCommandKind,
        request: &FirmwareRequest,
    ) -> QueueStatus {
        self.posts.lock().push(PostedRequest {
            vdev_id,
            kind,
            request: request.clone(),
        });
        self.scripted
            .lock()
            .pop_front()
            .unwrap_or(QueueStatus::Success)
    }
}

/// Transport that answers every request with a success event.
#[derive(Debug)]
pub struct LoopbackFirmware {
    events: EventSender,
    posted: Mutex<u64>,
}

impl LoopbackFirmware {
    pub fn new(events: EventSender) -> Arc<Self> {
        Arc::new(Self {
            events,
            posted: Mutex::new(0),
        })
    }

    pub fn posted(&self) -> u64 {
        *self.posted.lock()
    }
}

impl Transport for LoopbackFirmware {
    fn post(
        &self,
        _vdev_id: VdevId,
        _kind: SmeCommandKind,
        request: &FirmwareRequest,
    ) -> QueueStatus {
        *self.posted.lock() += 1;
        if self.events.deliver(success_response(request)) {
            QueueStatus::Success
        } else {
            QueueStatus::NotReady
        }
    }
}

/// Event a cooperative firmware sends back for `request`.
pub fn success_response(request: &FirmwareRequest) -> FirmwareEvent {
    match request {
        FirmwareRequest::SetHwMode { hw_mode_index } => {
            FirmwareEvent::SetHwMode(SetHwModeResponse {
                status: 0,
                cfgd_hw_mode_index: *hw_mode_index,
                vdev_mac_map: Vec::new(),
            })
        }
        FirmwareRequest::DualMacConfig(_) => {
            FirmwareEvent::DualMacConfig(DualMacConfigResponse { status: 0 })
        }
        FirmwareRequest::NssUpdate { vdev_id, .. } => FirmwareEvent::NssUpdate(NssUpdateResponse {
            status: 0,
            vdev_id: *vdev_id,
        }),
        FirmwareRequest::AntennaMode(_) => {
            FirmwareEvent::AntennaMode(AntennaModeResponse { status: 0 })
        }
        FirmwareRequest::Twt {
            command,
            vdev_id,
            peer,
            dialog_id,
            params,
        } => {
            let detail = match (command, params) {
                (_, TwtParams::Setup(setup)) => TwtEventDetail::Setup(*setup),
                (TwtCommand::GetStats, _) => TwtEventDetail::Stats(Vec::new()),
                _ => TwtEventDetail::None,
            };
            FirmwareEvent::Twt(TwtEvent {
                vdev_id: *vdev_id,
                peer: *peer,
                dialog_id: *dialog_id,
                command: *command,
                status: TwtStatus::Ok,
                detail,
            })
        }
        FirmwareRequest::RoamInvoke(params) => FirmwareEvent::RoamInvoke(RoamCommandResponse {
            vdev_id: params.vdev_id,
            status: 0,
        }),
        FirmwareRequest::RoamOffload { vdev_id, .. } => {
            FirmwareEvent::RoamOffload(RoamCommandResponse {
                vdev_id: *vdev_id,
                status: 0,
            })
        }
    }
}

/// Notifier that records what it receives.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    teardowns: Mutex<Vec<TwtTeardown>>,
    roam_synchs: Mutex<Vec<(VdevId, MacAddr)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn teardowns(&self) -> Vec<TwtTeardown> {
        self.teardowns.lock().clone()
    }

    pub fn roam_synchs(&self) -> Vec<(VdevId, MacAddr)> {
        self.roam_synchs.lock().clone()
    }
}

impl SmeNotifier for RecordingNotifier {
    fn on_twt_teardown(&self, teardown: TwtTeardown) {
        self.teardowns.lock().push(teardown);
    }

    fn on_roam_synch(&self, vdev_id: VdevId, bssid: MacAddr) {
        self.roam_synchs.lock().push((vdev_id, bssid));
    }
}

/// Recovery handler that records each trigger.
#[derive(Debug, Default)]
pub struct RecordingRecovery {
    reasons: Mutex<Vec<RecoveryReason>>,
}

impl RecordingRecovery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reasons(&self) -> Vec<RecoveryReason> {
        self.reasons.lock().clone()
    }
}

impl RecoveryHandler for RecordingRecovery {
    fn trigger(&self, reason: RecoveryReason) {
        self.reasons.lock().push(reason);
    }
}
