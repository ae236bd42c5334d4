//! Upward notifications that are not tied to a request.

use serde::{Deserialize, Serialize};

use crate::twt::TwtStatus;
use crate::types::{MacAddr, VdevId};

/// A TWT session torn down without a host request in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwtTeardown {
    pub vdev_id: VdevId,
    pub peer: MacAddr,
    pub dialog_id: u8,
    pub reason: TwtStatus,
}

/// Receiver of unsolicited events.
///
/// Called after the context's state borrow is released, so implementations
/// may issue new requests.
pub trait SmeNotifier: Send + Sync {
    fn on_twt_teardown(&self, _teardown: TwtTeardown) {}

    fn on_roam_synch(&self, _vdev_id: VdevId, _bssid: MacAddr) {}
}

/// Notifier that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl SmeNotifier for NoopNotifier {}
