//! Hardware-mode, NSS and antenna-mode flows.
//!
//! Covers admission under pool pressure, strict serialization, response
//! correlation, transport refusal and timeouts.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use wlancm_sme::policy::{AntennaModeResponse, NssUpdateResponse, SetHwModeResponse};
use wlancm_sme::testing::{RecordingRecovery, RecordingTransport, success_response};
use wlancm_sme::{
    AntennaModeParams, ChannelWidth, DualMacConfigParams, FirmwareEvent, MacAddr, MacContext,
    NextAction, NssUpdateParams, PDEV_VDEV_ID, PolicyMgrStatus, QueueStatus, RecoveryReason,
    RequestError, SetHwModeParams, SetHwModeResult, SmeCommandKind, SmeConfig, TwtSetupParams,
    TwtTarget, UpdateReason, VdevMacMapping, VdevRole,
};

struct Harness {
    ctx: Arc<MacContext>,
    transport: Arc<RecordingTransport>,
    recovery: Arc<RecordingRecovery>,
}

impl Harness {
    fn new(config: SmeConfig) -> Self {
        let transport = RecordingTransport::new();
        let recovery = RecordingRecovery::new();
        let ctx = MacContext::builder(config, transport.clone())
            .recovery(recovery.clone())
            .open()
            .unwrap();
        ctx.add_vdev(0, VdevRole::Sta).unwrap();
        Self {
            ctx,
            transport,
            recovery,
        }
    }

    fn with_pool(size: usize) -> Self {
        Self::new(SmeConfig {
            command_pool_size: size,
            ..Default::default()
        })
    }

    /// Answer the active command the way firmware would.
    fn respond_ok(&self) {
        let posted = self.transport.last().expect("nothing posted");
        self.ctx.on_event(success_response(&posted.request));
    }
}

fn hw_mode(index: u32) -> SetHwModeParams {
    SetHwModeParams {
        hw_mode_index: index,
        session_id: None,
        reason: UpdateReason(7),
        next_action: NextAction(3),
        request_id: 100 + index,
    }
}

fn nss(vdev_id: u8, new_nss: u8) -> NssUpdateParams {
    NssUpdateParams {
        vdev_id,
        new_nss,
        ch_width: ChannelWidth::Mhz80,
        next_action: NextAction(9),
        reason: UpdateReason(2),
        original_vdev_id: vdev_id,
        request_id: 42,
    }
}

#[test]
fn test_hw_mode_with_no_free_command_is_rejected() {
    let h = Harness::with_pool(2);
    h.ctx.set_hw_mode(hw_mode(1), Box::new(|_| {})).unwrap();
    h.ctx.set_hw_mode(hw_mode(2), Box::new(|_| {})).unwrap();
    let before = h.ctx.queue_stats();
    assert_eq!(before.free, 0);

    let (tx, rx) = mpsc::channel::<SetHwModeResult>();
    let result = h.ctx.set_hw_mode(
        hw_mode(3),
        Box::new(move |r| {
            let _ = tx.send(r);
        }),
    );

    assert!(matches!(result, Err(RequestError::NoMemory(_))));
    let after = h.ctx.queue_stats();
    assert_eq!(after.pending, before.pending);
    assert_eq!(after.exhausted, before.exhausted + 1);
    assert!(rx.try_recv().is_err());
    h.ctx.audit().unwrap();
}

#[test]
fn test_sequential_hw_mode_requests_never_overlap() {
    let h = Harness::with_pool(4);
    let (tx, rx) = mpsc::channel();

    let observer = h.transport.clone();
    let first_tx = tx.clone();
    h.ctx
        .set_hw_mode(
            hw_mode(1),
            Box::new(move |r| {
                // Second request has not reached firmware yet
                let _ = first_tx.send((r.request_id, observer.post_count()));
            }),
        )
        .unwrap();
    h.ctx
        .set_hw_mode(
            hw_mode(2),
            Box::new(move |r| {
                let _ = tx.send((r.request_id, 0));
            }),
        )
        .unwrap();

    assert_eq!(h.transport.post_count(), 1);
    let stats = h.ctx.queue_stats();
    assert!(stats.active);
    assert_eq!(stats.pending, 1);

    h.respond_ok();
    assert_eq!(rx.try_recv().unwrap(), (101, 1));
    assert_eq!(h.transport.post_count(), 2);
    assert_eq!(h.ctx.queue_stats().pending, 0);

    h.respond_ok();
    assert_eq!(rx.try_recv().unwrap().0, 102);
    assert!(!h.ctx.queue_stats().active);
    assert_eq!(h.ctx.queue_stats().free, 4);
    h.ctx.audit().unwrap();
}

#[test]
fn test_hw_mode_callback_echoes_request_context() {
    let h = Harness::with_pool(4);
    let (tx, rx) = mpsc::channel();

    let mut params = hw_mode(5);
    params.session_id = Some(0);
    let ticket = h
        .ctx
        .set_hw_mode(
            params,
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        )
        .unwrap();
    assert_eq!(ticket.vdev_id, 0);

    h.ctx.on_event(FirmwareEvent::SetHwMode(SetHwModeResponse {
        status: 4,
        cfgd_hw_mode_index: 2,
        vdev_mac_map: vec![VdevMacMapping {
            vdev_id: 0,
            mac_id: 1,
        }],
    }));

    let result = rx.try_recv().unwrap();
    assert_eq!(result.status, PolicyMgrStatus::HardwareError);
    assert_eq!(result.cfgd_hw_mode_index, 2);
    assert_eq!(result.vdev_mac_map.len(), 1);
    assert_eq!(result.session_id, Some(0));
    assert_eq!(result.next_action, NextAction(3));
    assert_eq!(result.reason, UpdateReason(7));
    assert_eq!(result.request_id, 105);
}

#[test]
fn test_hw_mode_for_unknown_session_rejected() {
    let h = Harness::with_pool(4);
    let mut params = hw_mode(1);
    params.session_id = Some(9);

    let result = h.ctx.set_hw_mode(params, Box::new(|_| {}));

    assert_eq!(result, Err(RequestError::InvalidVdev(9)));
    assert_eq!(h.ctx.queue_stats().free, 4);
}

#[test]
fn test_duplicate_response_is_noop() {
    let h = Harness::with_pool(4);
    let (tx, rx) = mpsc::channel();
    h.ctx
        .set_hw_mode(
            hw_mode(1),
            Box::new(move |r| {
                let _ = tx.send(r.request_id);
            }),
        )
        .unwrap();

    h.respond_ok();
    h.respond_ok();

    assert_eq!(rx.try_iter().count(), 1);
    assert_eq!(h.ctx.correlator_stats().orphaned, 1);
    assert_eq!(h.ctx.queue_stats().free, 4);
    h.ctx.audit().unwrap();
}

#[test]
fn test_mismatched_response_frees_policy_slot() {
    let h = Harness::with_pool(4);
    let (tx, rx) = mpsc::channel();
    h.ctx
        .set_hw_mode(
            hw_mode(1),
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        )
        .unwrap();
    h.ctx
        .antenna_mode(
            AntennaModeParams {
                num_tx_chains: 2,
                num_rx_chains: 2,
            },
            Box::new(|_| {}),
        )
        .unwrap();

    h.ctx.on_event(FirmwareEvent::NssUpdate(NssUpdateResponse {
        status: 0,
        vdev_id: 0,
    }));

    // Callback dropped and the antenna-mode command posted
    assert!(rx.try_recv().is_err());
    assert_eq!(h.ctx.correlator_stats().mismatched, 1);
    assert_eq!(
        h.transport.kinds(),
        vec![SmeCommandKind::SetHwMode, SmeCommandKind::AntennaMode]
    );
    let stats = h.ctx.queue_stats();
    assert_eq!(stats.free, 3);
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.dropped, 1);
    h.ctx.audit().unwrap();
}

#[test]
fn test_mismatched_response_keeps_twt_command() {
    let h = Harness::with_pool(4);
    let peer = MacAddr([2, 0, 0, 0, 0, 9]);
    h.ctx
        .add_dialog(
            TwtTarget::unicast(0, peer, 1),
            TwtSetupParams::default(),
            Box::new(|_| {}),
        )
        .unwrap();

    h.ctx
        .on_event(FirmwareEvent::AntennaMode(AntennaModeResponse { status: 0 }));

    assert!(h.ctx.queue_stats().active);
    assert_eq!(h.ctx.queue_stats().free, 3);
    assert!(h.ctx.twt_session(0, peer, 1).unwrap().active_command.is_some());
}

#[test]
fn test_transport_refusal_completes_with_failure() {
    let h = Harness::with_pool(4);
    h.transport.script(QueueStatus::Failure);
    let (tx, rx) = mpsc::channel();
    let tx2 = tx.clone();

    h.ctx
        .set_hw_mode(
            hw_mode(1),
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        )
        .unwrap();

    let failed = rx.try_recv().unwrap();
    assert_eq!(failed.status, PolicyMgrStatus::Cancelled);
    assert_eq!(failed.request_id, 101);
    let stats = h.ctx.queue_stats();
    assert!(!stats.active);
    assert_eq!(stats.free, 4);
    assert_eq!(stats.post_failed, 1);
    assert_eq!(stats.completed, 0);

    // The next request goes out normally
    h.ctx
        .set_hw_mode(
            hw_mode(2),
            Box::new(move |r| {
                let _ = tx2.send(r);
            }),
        )
        .unwrap();
    h.respond_ok();
    assert_eq!(rx.try_recv().unwrap().status, PolicyMgrStatus::Ok);
}

#[test]
fn test_refused_command_lets_next_pending_proceed() {
    let h = Harness::with_pool(4);
    h.ctx.set_hw_mode(hw_mode(1), Box::new(|_| {})).unwrap();
    h.ctx
        .dual_mac_config(
            DualMacConfigParams {
                scan_config: 1,
                fw_mode_config: 2,
            },
            Box::new(|_| {}),
        )
        .unwrap();
    h.ctx.set_hw_mode(hw_mode(3), Box::new(|_| {})).unwrap();

    // Dual MAC config will be refused when it is activated
    h.transport.script(QueueStatus::NotReady);
    h.respond_ok();

    assert_eq!(
        h.transport.kinds(),
        vec![
            SmeCommandKind::SetHwMode,
            SmeCommandKind::DualMacConfig,
            SmeCommandKind::SetHwMode
        ]
    );
    assert!(h.ctx.queue_stats().active);
    assert_eq!(h.ctx.queue_stats().pending, 0);
    h.ctx.audit().unwrap();
}

#[test]
fn test_pool_exhaustion_escalates_after_threshold() {
    let h = Harness::new(SmeConfig {
        command_pool_size: 1,
        pool_exhaustion_threshold: 3,
        ..Default::default()
    });
    h.ctx.set_hw_mode(hw_mode(1), Box::new(|_| {})).unwrap();

    for _ in 0..2 {
        assert!(h.ctx.set_hw_mode(hw_mode(2), Box::new(|_| {})).is_err());
    }
    assert!(h.recovery.reasons().is_empty());

    assert!(h.ctx.set_hw_mode(hw_mode(2), Box::new(|_| {})).is_err());
    assert_eq!(
        h.recovery.reasons(),
        vec![RecoveryReason::PoolExhausted { consecutive: 3 }]
    );
}

#[test]
fn test_timeout_drops_callback_and_escalates() {
    let h = Harness::with_pool(4);
    let (tx, rx) = mpsc::channel::<SetHwModeResult>();
    h.ctx
        .set_hw_mode(
            hw_mode(1),
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        )
        .unwrap();
    h.ctx
        .antenna_mode(
            AntennaModeParams {
                num_tx_chains: 1,
                num_rx_chains: 1,
            },
            Box::new(|_| {}),
        )
        .unwrap();

    assert!(!h.ctx.check_timeouts(Instant::now()));
    assert!(h.ctx.check_timeouts(Instant::now() + Duration::from_secs(60)));

    assert!(rx.try_recv().is_err());
    assert_eq!(
        h.recovery.reasons(),
        vec![RecoveryReason::CommandTimeout {
            kind: SmeCommandKind::SetHwMode,
            vdev_id: PDEV_VDEV_ID,
        }]
    );
    assert_eq!(h.ctx.queue_stats().timed_out, 1);
    assert_eq!(h.transport.last().unwrap().kind, SmeCommandKind::AntennaMode);

    // The late response now mismatches the antenna-mode command
    h.ctx.on_event(FirmwareEvent::SetHwMode(SetHwModeResponse {
        status: 0,
        cfgd_hw_mode_index: 1,
        vdev_mac_map: Vec::new(),
    }));
    assert!(rx.try_recv().is_err());
    h.ctx.audit().unwrap();
}

#[test]
fn test_non_connection_timeout_does_not_escalate() {
    let h = Harness::with_pool(4);
    h.ctx
        .antenna_mode(
            AntennaModeParams {
                num_tx_chains: 2,
                num_rx_chains: 1,
            },
            Box::new(|_| {}),
        )
        .unwrap();

    assert!(h.ctx.check_timeouts(Instant::now() + Duration::from_secs(60)));
    assert!(h.recovery.reasons().is_empty());
}

#[test]
fn test_nss_update_validation_and_completion() {
    let h = Harness::with_pool(4);

    assert_eq!(
        h.ctx.nss_update_request(nss(5, 2), Box::new(|_| {})),
        Err(RequestError::InvalidVdev(5))
    );
    assert!(matches!(
        h.ctx.nss_update_request(nss(0, 0), Box::new(|_| {})),
        Err(RequestError::InvalidParam(_))
    ));

    let (tx, rx) = mpsc::channel();
    h.ctx
        .nss_update_request(
            nss(0, 2),
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        )
        .unwrap();
    h.respond_ok();

    let result = rx.try_recv().unwrap();
    assert_eq!(result.status, PolicyMgrStatus::Ok);
    assert_eq!(result.new_nss, 2);
    assert_eq!(result.ch_width, ChannelWidth::Mhz80);
    assert_eq!(result.next_action, NextAction(9));
    assert_eq!(result.original_vdev_id, 0);
}

#[test]
fn test_antenna_mode_chain_limits() {
    let h = Harness::with_pool(4);

    let result = h.ctx.antenna_mode(
        AntennaModeParams {
            num_tx_chains: 2,
            num_rx_chains: 9,
        },
        Box::new(|_| {}),
    );

    assert!(matches!(result, Err(RequestError::InvalidParam(_))));
    assert_eq!(h.transport.post_count(), 0);
}

#[test]
fn test_dual_mac_config_round_trip() {
    let h = Harness::with_pool(4);
    let (tx, rx) = mpsc::channel();

    h.ctx
        .dual_mac_config(
            DualMacConfigParams {
                scan_config: 0x11,
                fw_mode_config: 0x22,
            },
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        )
        .unwrap();
    h.respond_ok();

    let result = rx.try_recv().unwrap();
    assert!(result.status.is_ok());
    assert_eq!(result.scan_config, 0x11);
    assert_eq!(result.fw_mode_config, 0x22);
}
