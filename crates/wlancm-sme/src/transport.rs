//! Firmware transport seam.
//!
//! Outbound requests go through [`Transport::post`]. Inbound events are
//! pushed into an [`EventSender`] by whoever owns the firmware channel and
//! drained by the context's dispatcher, so delivery never runs under the
//! transport's own locks.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::command::SmeCommandKind;
use crate::policy::{
    AntennaModeParams, AntennaModeResponse, ChannelWidth, DualMacConfigParams,
    DualMacConfigResponse, NssUpdateResponse, SetHwModeResponse,
};
use crate::roam::{RoamCommandResponse, RoamInvokeParams, RoamNotification, RsoCommand};
use crate::twt::{TwtEvent, TwtParams};
use crate::types::{MacAddr, VdevId};

/// Result of handing a request to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    /// Request accepted for delivery
    Success,
    /// Channel refused the request
    Failure,
    /// Channel is not up
    NotReady,
}

impl QueueStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, QueueStatus::Success)
    }
}

/// Wire form of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirmwareRequest {
    SetHwMode {
        hw_mode_index: u32,
    },
    DualMacConfig(DualMacConfigParams),
    NssUpdate {
        vdev_id: VdevId,
        new_nss: u8,
        ch_width: ChannelWidth,
    },
    AntennaMode(AntennaModeParams),
    Twt {
        command: crate::twt::TwtCommand,
        vdev_id: VdevId,
        peer: MacAddr,
        dialog_id: u8,
        params: TwtParams,
    },
    RoamInvoke(RoamInvokeParams),
    RoamOffload {
        vdev_id: VdevId,
        command: RsoCommand,
    },
}

/// Inbound event from firmware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirmwareEvent {
    SetHwMode(SetHwModeResponse),
    DualMacConfig(DualMacConfigResponse),
    NssUpdate(NssUpdateResponse),
    AntennaMode(AntennaModeResponse),
    /// TWT command response or autonomous teardown
    Twt(TwtEvent),
    RoamInvoke(RoamCommandResponse),
    RoamOffload(RoamCommandResponse),
    /// Unsolicited roam progress
    Roam(RoamNotification),
}

impl FirmwareEvent {
    /// Command kind this event answers, if it is a response.
    pub fn response_kind(&self) -> Option<SmeCommandKind> {
        match self {
            FirmwareEvent::SetHwMode(_) => Some(SmeCommandKind::SetHwMode),
            FirmwareEvent::DualMacConfig(_) => Some(SmeCommandKind::DualMacConfig),
            FirmwareEvent::NssUpdate(_) => Some(SmeCommandKind::NssUpdate),
            FirmwareEvent::AntennaMode(_) => Some(SmeCommandKind::AntennaMode),
            FirmwareEvent::Twt(event) => Some(SmeCommandKind::Twt(event.command)),
            FirmwareEvent::RoamInvoke(_) => Some(SmeCommandKind::RoamInvoke),
            FirmwareEvent::RoamOffload(_) => Some(SmeCommandKind::RoamOffload),
            FirmwareEvent::Roam(_) => None,
        }
    }
}

/// Outbound firmware channel.
pub trait Transport: Send + Sync {
    /// Hand a request to firmware.
    ///
    /// Top-level requests are posted with the state lock released. Requests
    /// issued from a completion callback are posted while the callback's
    /// thread still holds the lock, so `post` must not wait on another
    /// thread that enters the context.
    fn post(&self, vdev_id: VdevId, kind: SmeCommandKind, request: &FirmwareRequest)
    -> QueueStatus;
}

/// Producer side of the inbound event channel.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<FirmwareEvent>,
}

impl EventSender {
    /// Deliver an event. Returns false once the dispatcher is gone.
    pub fn deliver(&self, event: FirmwareEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Dropping firmware event, dispatcher stopped: {:?}", e.0);
                false
            }
        }
    }
}

/// Consumer side of the inbound event channel.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<FirmwareEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<FirmwareEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FirmwareEvent> {
        self.rx.try_recv().ok()
    }
}

/// Create the inbound event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twt::{TwtCommand, TwtEventDetail, TwtStatus};

    #[test]
    fn test_response_kind() {
        let event = FirmwareEvent::Twt(TwtEvent {
            vdev_id: 0,
            peer: MacAddr::ZERO,
            dialog_id: 1,
            command: TwtCommand::Resume,
            status: TwtStatus::Ok,
            detail: TwtEventDetail::None,
        });
        assert_eq!(
            event.response_kind(),
            Some(SmeCommandKind::Twt(TwtCommand::Resume))
        );

        let notification = FirmwareEvent::Roam(RoamNotification::Start { vdev_id: 0 });
        assert_eq!(notification.response_kind(), None);
    }

    #[tokio::test]
    async fn test_event_channel() {
        let (tx, mut rx) = event_channel();
        assert!(tx.deliver(FirmwareEvent::AntennaMode(AntennaModeResponse { status: 0 })));

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, FirmwareEvent::AntennaMode(_)));

        drop(rx);
        assert!(!tx.deliver(FirmwareEvent::AntennaMode(AntennaModeResponse { status: 0 })));
    }
}
