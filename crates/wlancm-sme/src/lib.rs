//! Station management core for a WLAN connection manager.
//!
//! Requests from the policy layer are admitted through a single
//! [`MacContext`], serialized so that at most one command is outstanding
//! with firmware, and completed through the caller's callback once the
//! firmware's asynchronous response is correlated back to it.
//!
//! Provides:
//! - Hardware-mode, dual-MAC, NSS and antenna-mode requests
//! - TWT session setup, teardown, suspend, resume, nudge and statistics
//! - Host-triggered roaming and roam-offload control with per-vdev roam state
//! - An event dispatcher and timeout monitor running on tokio

pub mod command;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
mod facade;
pub mod notify;
pub mod policy;
pub mod recovery;
pub mod roam;
pub mod testing;
pub mod transport;
pub mod twt;
pub mod types;

// Re-exports
pub use command::{CommandClass, Request, SmeCommandKind};

pub use config::{SmeConfig, TimeoutConfig};

pub use context::{CommandTicket, MacContext, MacContextBuilder, ROAM_HOST_FAILURE};

pub use dispatcher::SmeRuntime;

pub use error::{ConfigError, RequestError, Result};

pub use notify::{NoopNotifier, SmeNotifier, TwtTeardown};

pub use policy::{
    AntennaModeParams, AntennaModeResult, ChannelWidth, DualMacConfigParams, DualMacConfigResult,
    NextAction, NssUpdateParams, NssUpdateResult, PolicyMgrStatus, SetHwModeParams,
    SetHwModeResult, UpdateReason, VdevMacMapping,
};

pub use recovery::{LoggingRecovery, RecoveryHandler, RecoveryReason};

pub use roam::{
    NeighborRoamState, RoamCallback, RoamCommand, RoamCommandResponse, RoamContext,
    RoamInvokeParams, RoamNotification, RoamResult, RoamState, RsoCommand,
};

pub use transport::{
    EventReceiver, EventSender, FirmwareEvent, FirmwareRequest, QueueStatus, Transport,
    event_channel,
};

pub use twt::{
    ALL_DIALOGS, DialogSelector, PeerSelector, TwtCallback, TwtCommand, TwtEvent, TwtEventDetail,
    TwtNudgeParams, TwtParams, TwtResponse, TwtResumeParams, TwtSession, TwtSessionState,
    TwtSessionStats, TwtSetupParams, TwtStatus, TwtTarget,
};

pub use types::{MacAddr, PDEV_VDEV_ID, VdevId, VdevInfo, VdevRole};
