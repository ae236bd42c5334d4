//! Station management context.
//!
//! A [`MacContext`] owns the command queue, the response correlator and
//! the TWT and roam session stores behind one coarse lock. Callers and the
//! event dispatcher contend for the same lock.
//!
//! The lock is a reentrant mutex around a `RefCell`. A logical turn holds
//! the mutex; the `RefCell` is only borrowed for short state updates and
//! never while user callbacks, notifiers, recovery or the transport run.
//! A completion callback may therefore issue a new request on the same
//! thread: it re-enters the mutex and finds the state unborrowed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use serde::{Deserialize, Serialize};
use wlancm_commands::{
    Command, CommandEvent, CommandEventBus, CommandEventType, CommandHandle, CommandKind,
    CommandOutcome, Correlation, CorrelatorStats, QueueError, QueueStats, ResponseCorrelator, Sequence,
};

use crate::command::{Request, SmeCommand, SmeCommandKind, SmeQueue};
use crate::config::SmeConfig;
use crate::error::{ConfigError, RequestError, Result};
use crate::notify::{NoopNotifier, SmeNotifier, TwtTeardown};
use crate::policy::{
    AntennaModeResult, DualMacConfigResult, NssUpdateResult, PolicyMgrStatus, SetHwModeResult,
};
use crate::recovery::{ExhaustionTracker, LoggingRecovery, RecoveryHandler, RecoveryReason};
use crate::roam::{
    RoamCallback, RoamCommand, RoamContext, RoamDisposition, RoamNotification, RoamResult,
    RoamStateStore,
};
use crate::transport::{FirmwareEvent, Transport};
use crate::twt::{
    TwtCommand, TwtEvent, TwtEventDetail, TwtResponse, TwtSession, TwtSessionStore, TwtStatus,
};
use crate::types::{MacAddr, PDEV_VDEV_ID, VdevId, VdevInfo, VdevRole};

/// Roam status reported when a request never reached firmware.
pub const ROAM_HOST_FAILURE: u32 = u32::MAX;

/// Receipt for an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandTicket {
    pub handle: CommandHandle,
    pub kind: SmeCommandKind,
    pub vdev_id: VdevId,
    pub sequence: Sequence,
}

impl fmt::Display for CommandTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (seq {})", self.kind, self.handle, self.sequence)
    }
}

/// Everything guarded by the context lock.
pub(crate) struct SmeState {
    pub(crate) queue: SmeQueue,
    pub(crate) correlator: ResponseCorrelator,
    pub(crate) twt: TwtSessionStore,
    pub(crate) roam: RoamStateStore,
    pub(crate) vdevs: HashMap<VdevId, VdevInfo>,
    pub(crate) exhaustion: ExhaustionTracker,
    pub(crate) open: bool,
}

impl SmeState {
    pub(crate) fn require_vdev(&self, vdev_id: VdevId) -> Result<&VdevInfo> {
        self.vdevs
            .get(&vdev_id)
            .ok_or(RequestError::InvalidVdev(vdev_id))
    }
}

/// Work that must run after the state borrow is released.
#[derive(Default)]
pub(crate) struct Deferred(Vec<Box<dyn FnOnce()>>);

impl Deferred {
    fn push(&mut self, action: impl FnOnce() + 'static) {
        self.0.push(Box::new(action));
    }

    fn run(self) {
        for action in self.0 {
            action();
        }
    }
}

/// How a command left the queue.
enum Settlement {
    /// Matched by a response
    Response(FirmwareEvent),
    /// Transport refused it
    PostFailed,
    /// Cancelled, timed out or dropped; the callback is discarded
    Abandoned,
}

/// Builder for [`MacContext`].
pub struct MacContextBuilder {
    config: SmeConfig,
    transport: Arc<dyn Transport>,
    recovery: Arc<dyn RecoveryHandler>,
    notifier: Arc<dyn SmeNotifier>,
}

impl MacContextBuilder {
    /// Set the recovery handler. Defaults to [`LoggingRecovery`].
    pub fn recovery(mut self, recovery: Arc<dyn RecoveryHandler>) -> Self {
        self.recovery = recovery;
        self
    }

    /// Set the notifier for unsolicited events. Defaults to [`NoopNotifier`].
    pub fn notifier(mut self, notifier: Arc<dyn SmeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Validate the configuration and open the context.
    pub fn open(self) -> std::result::Result<Arc<MacContext>, ConfigError> {
        self.config.validate()?;

        let state = SmeState {
            queue: SmeQueue::new(self.config.command_pool_size),
            correlator: ResponseCorrelator::new(),
            twt: TwtSessionStore::new(self.config.max_twt_sessions_per_peer),
            roam: RoamStateStore::new(),
            vdevs: HashMap::new(),
            exhaustion: ExhaustionTracker::new(self.config.pool_exhaustion_threshold),
            open: true,
        };

        tracing::info!(
            "Opened SME context: {} command slots, exhaustion threshold {}",
            self.config.command_pool_size,
            self.config.pool_exhaustion_threshold
        );

        Ok(Arc::new(MacContext {
            state: ReentrantMutex::new(RefCell::new(state)),
            events: Arc::new(CommandEventBus::new(self.config.event_history)),
            config: self.config,
            transport: self.transport,
            recovery: self.recovery,
            notifier: self.notifier,
        }))
    }
}

/// The station management context.
pub struct MacContext {
    state: ReentrantMutex<RefCell<SmeState>>,
    config: SmeConfig,
    transport: Arc<dyn Transport>,
    recovery: Arc<dyn RecoveryHandler>,
    notifier: Arc<dyn SmeNotifier>,
    events: Arc<CommandEventBus>,
}

impl MacContext {
    /// Start building a context around a transport.
    pub fn builder(config: SmeConfig, transport: Arc<dyn Transport>) -> MacContextBuilder {
        MacContextBuilder {
            config,
            transport,
            recovery: Arc::new(LoggingRecovery),
            notifier: Arc::new(NoopNotifier),
        }
    }

    /// Open a context with the default recovery handler and notifier.
    pub fn open(
        config: SmeConfig,
        transport: Arc<dyn Transport>,
    ) -> std::result::Result<Arc<Self>, ConfigError> {
        Self::builder(config, transport).open()
    }

    /// Stop admitting requests and drop every queued command.
    ///
    /// Callbacks of dropped commands are discarded without being invoked.
    pub fn close(&self) {
        let _turn = self.turn();
        let dropped = self.with_state(|st| {
            st.open = false;
            let drained = st.queue.drain();
            let count = drained.len();
            for (_, command) in drained {
                self.publish(lifecycle(CommandEventType::Cancelled, &command));
                let _ = self.settle(st, command, Settlement::Abandoned);
            }
            count
        });
        tracing::info!("Closed SME context, {} queued commands dropped", dropped);
    }

    pub fn is_open(&self) -> bool {
        self.with_state(|st| st.open)
    }

    pub fn config(&self) -> &SmeConfig {
        &self.config
    }

    /// Lifecycle event bus.
    pub fn events(&self) -> Arc<CommandEventBus> {
        self.events.clone()
    }

    // ========================================================================
    // Vdev registry
    // ========================================================================

    /// Register a virtual device.
    pub fn add_vdev(&self, vdev_id: VdevId, role: VdevRole) -> Result<()> {
        if vdev_id == PDEV_VDEV_ID {
            return Err(RequestError::InvalidVdev(vdev_id));
        }

        self.with_state(|st| {
            if st.vdevs.contains_key(&vdev_id) {
                return Err(RequestError::InvalidParam(format!(
                    "vdev {} already registered",
                    vdev_id
                )));
            }
            st.vdevs.insert(vdev_id, VdevInfo::new(vdev_id, role));
            if role == VdevRole::Sta {
                st.roam.add(vdev_id);
            }
            Ok(())
        })?;

        tracing::info!("Added vdev {} ({})", vdev_id, role);
        Ok(())
    }

    /// Unregister a virtual device.
    ///
    /// Its pending commands are cancelled and its session state dropped. An
    /// active command stays until its response or timeout.
    pub fn remove_vdev(&self, vdev_id: VdevId) -> Result<()> {
        let _turn = self.turn();
        let cancelled = self.with_state(|st| {
            st.vdevs
                .remove(&vdev_id)
                .ok_or(RequestError::InvalidVdev(vdev_id))?;

            let cancelled = st.queue.cancel_vdev(vdev_id);
            let count = cancelled.len();
            for (_, command) in cancelled {
                self.publish(lifecycle(CommandEventType::Cancelled, &command));
                let _ = self.settle(st, command, Settlement::Abandoned);
            }
            st.twt.remove_vdev(vdev_id);
            st.roam.remove(vdev_id);
            Ok::<_, RequestError>(count)
        })?;

        tracing::info!(
            "Removed vdev {}, {} pending commands cancelled",
            vdev_id,
            cancelled
        );
        Ok(())
    }

    /// Association on a vdev completed.
    pub fn vdev_connected(&self, vdev_id: VdevId, bssid: MacAddr) -> Result<()> {
        self.with_state(|st| {
            let info = st
                .vdevs
                .get_mut(&vdev_id)
                .ok_or(RequestError::InvalidVdev(vdev_id))?;
            info.bssid = Some(bssid);
            st.roam.connected(vdev_id, bssid);
            Ok::<_, RequestError>(())
        })?;

        tracing::info!("Vdev {} connected to {}", vdev_id, bssid);
        Ok(())
    }

    /// Association on a vdev was lost. Its TWT sessions are reset.
    pub fn vdev_disconnected(&self, vdev_id: VdevId) -> Result<()> {
        let reset = self.with_state(|st| {
            let info = st
                .vdevs
                .get_mut(&vdev_id)
                .ok_or(RequestError::InvalidVdev(vdev_id))?;
            info.bssid = None;
            st.roam.disconnected(vdev_id);
            Ok::<_, RequestError>(st.twt.reset_vdev(vdev_id).len())
        })?;

        tracing::info!(
            "Vdev {} disconnected, {} TWT sessions reset",
            vdev_id,
            reset
        );
        Ok(())
    }

    pub fn vdev(&self, vdev_id: VdevId) -> Option<VdevInfo> {
        self.with_state(|st| st.vdevs.get(&vdev_id).copied())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn queue_stats(&self) -> QueueStats {
        self.with_state(|st| st.queue.stats())
    }

    pub fn correlator_stats(&self) -> CorrelatorStats {
        self.with_state(|st| st.correlator.stats())
    }

    /// Verify the command pool partition.
    pub fn audit(&self) -> std::result::Result<(), QueueError> {
        self.with_state(|st| st.queue.audit())
    }

    pub fn twt_session(&self, vdev_id: VdevId, peer: MacAddr, dialog_id: u8) -> Option<TwtSession> {
        self.with_state(|st| st.twt.session(vdev_id, peer, dialog_id).copied())
    }

    pub fn twt_sessions(&self, vdev_id: VdevId) -> Vec<(MacAddr, TwtSession)> {
        self.with_state(|st| st.twt.sessions(vdev_id))
    }

    pub fn roam_state(&self, vdev_id: VdevId) -> Option<RoamContext> {
        self.with_state(|st| st.roam.get(vdev_id).copied())
    }

    // ========================================================================
    // Command flow
    // ========================================================================

    /// Withdraw a pending request. Its callback is discarded.
    pub fn cancel(&self, ticket: CommandTicket) -> Result<()> {
        let _turn = self.turn();
        self.with_state(|st| {
            let command = st.queue.cancel(ticket.handle).map_err(|e| match e {
                QueueError::AlreadyActive(_) => {
                    RequestError::InvalidState(format!("{} already reached firmware", ticket))
                }
                _ => RequestError::InvalidParam(format!("{} is not pending", ticket)),
            })?;

            tracing::debug!("Cancelled {}", ticket);
            self.publish(lifecycle(CommandEventType::Cancelled, &command));
            let _ = self.settle(st, command, Settlement::Abandoned);
            Ok(())
        })
    }

    /// Deliver one firmware event.
    pub fn on_event(&self, event: FirmwareEvent) {
        let turn = self.turn();

        let deferred = match event {
            FirmwareEvent::Roam(notification) => {
                self.with_state(|st| self.handle_roam_notification(st, notification))
            }
            FirmwareEvent::Twt(twt) if self.with_state(|st| is_autonomous_teardown(st, &twt)) => {
                self.with_state(|st| self.handle_twt_teardown(st, twt))
            }
            response => self.with_state(|st| self.handle_response(st, response)),
        };

        deferred.run();
        drop(turn);
        self.pump();
    }

    /// Expire the active command if its deadline has passed.
    ///
    /// Returns true if a command timed out.
    pub fn check_timeouts(&self, now: Instant) -> bool {
        let turn = self.turn();

        let expired = self.with_state(|st| {
            let (handle, command) = st.queue.expire(now)?;
            tracing::warn!(
                "{} {} (seq {}) on vdev {} timed out",
                command.kind,
                handle,
                command.sequence(),
                command.vdev_id
            );
            self.publish(lifecycle(CommandEventType::TimedOut, &command));
            let kind = command.kind;
            let vdev_id = command.vdev_id;
            let deferred = self.settle(st, command, Settlement::Abandoned);
            Some((kind, vdev_id, deferred))
        });

        let Some((kind, vdev_id, deferred)) = expired else {
            return false;
        };

        deferred.run();
        if kind.affects_connection() {
            self.recovery
                .trigger(RecoveryReason::CommandTimeout { kind, vdev_id });
        }
        drop(turn);
        self.pump();
        true
    }

    /// Admit a request: run `check`, take a slot, queue the command, then
    /// `mark` the session guards it holds.
    pub(crate) fn admit(
        &self,
        vdev_id: VdevId,
        request: Request,
        check: impl FnOnce(&SmeState) -> Result<()>,
        mark: impl FnOnce(&mut SmeState) -> Result<()>,
    ) -> Result<CommandTicket> {
        let turn = self.turn();
        let kind = request.kind();

        let admitted = self.with_state(|st| {
            if !st.open {
                return Err((RequestError::Closed, None));
            }
            check(st).map_err(|e| (e, None))?;

            let handle = match st.queue.acquire() {
                Ok(handle) => handle,
                Err(e) => return Err((RequestError::from(e), st.exhaustion.record_failure())),
            };
            st.exhaustion.record_success();

            let queued = st
                .queue
                .fill(handle, Command::new(kind, vdev_id, request))
                .and_then(|()| st.queue.submit(handle));
            let position = match queued {
                Ok(position) => position,
                Err(e) => {
                    let _ = st.queue.abandon(handle);
                    return Err((RequestError::from(e), None));
                }
            };
            let sequence = st
                .queue
                .get(handle)
                .map(|command| command.sequence())
                .unwrap_or_default();

            if let Err(e) = mark(st) {
                let _ = st.queue.cancel(handle);
                return Err((e, None));
            }

            Ok((
                CommandTicket {
                    handle,
                    kind,
                    vdev_id,
                    sequence,
                },
                position,
            ))
        });

        match admitted {
            Ok((ticket, position)) => {
                tracing::debug!("Queued {} on vdev {} at position {}", ticket, vdev_id, position);
                self.publish(
                    CommandEvent::new(CommandEventType::Queued, kind.to_string())
                        .with_sequence(ticket.sequence)
                        .with_vdev(vdev_id)
                        .with_data(serde_json::json!({ "position": position })),
                );
                drop(turn);
                self.pump();
                Ok(ticket)
            }
            Err((e, escalate)) => {
                tracing::debug!("Rejected {} on vdev {}: {}", kind, vdev_id, e);
                self.publish(
                    CommandEvent::new(CommandEventType::Rejected, kind.to_string())
                        .with_vdev(vdev_id)
                        .with_data(serde_json::json!({ "reason": e.to_string() })),
                );
                if let Some(consecutive) = escalate {
                    tracing::error!(
                        "Command pool exhausted for {} consecutive requests",
                        consecutive
                    );
                    self.recovery
                        .trigger(RecoveryReason::PoolExhausted { consecutive });
                }
                Err(e)
            }
        }
    }

    /// Activate and post pending commands until one is in flight.
    ///
    /// The state lock is released around each `post`. When called from
    /// inside a completion callback the caller's turn is still held, so the
    /// transport must never block on another thread entering the context.
    pub(crate) fn pump(&self) {
        loop {
            let next = self.with_state(|st| {
                let activation = st
                    .queue
                    .activate_next(Instant::now(), |kind| self.config.timeouts.for_kind(kind))?;
                let wire = st.queue.get(activation.handle).ok()?.payload.to_wire();
                Some((activation, wire))
            });
            let Some((activation, wire)) = next else {
                return;
            };

            self.publish(
                CommandEvent::new(CommandEventType::Activated, activation.kind.to_string())
                    .with_sequence(activation.sequence)
                    .with_vdev(activation.vdev_id),
            );

            let status = self
                .transport
                .post(activation.vdev_id, activation.kind, &wire);
            if status.is_success() {
                tracing::debug!(
                    "Posted {} (seq {}) for vdev {}",
                    activation.kind,
                    activation.sequence,
                    activation.vdev_id
                );
                continue;
            }

            tracing::warn!(
                "Transport refused {} (seq {}): {:?}",
                activation.kind,
                activation.sequence,
                status
            );
            let turn = self.turn();
            let deferred = self.with_state(|st| {
                match st.queue.retire(activation.handle, CommandOutcome::PostFailed) {
                    Ok(command) => {
                        self.publish(lifecycle(CommandEventType::PostFailed, &command));
                        self.settle(st, command, Settlement::PostFailed)
                    }
                    Err(e) => {
                        // Settled by a timeout or close while the lock was released
                        tracing::warn!(
                            "Refused command {} already left the queue: {}",
                            activation.handle,
                            e
                        );
                        Deferred::default()
                    }
                }
            });
            deferred.run();
            drop(turn);
        }
    }

    fn handle_response(&self, st: &mut SmeState, event: FirmwareEvent) -> Deferred {
        let Some(kind) = event.response_kind() else {
            return Deferred::default();
        };

        match st.correlator.correlate(&mut st.queue, kind) {
            Correlation::Matched { command, .. } => {
                self.publish(lifecycle(CommandEventType::Completed, &command));
                self.settle(st, command, Settlement::Response(event))
            }
            Correlation::Orphan { received } => {
                self.publish(
                    CommandEvent::new(CommandEventType::Dropped, received.to_string())
                        .with_data(serde_json::json!({ "reason": "no active command" })),
                );
                Deferred::default()
            }
            Correlation::Mismatch {
                expected,
                received,
                released,
            } => {
                self.publish(
                    CommandEvent::new(CommandEventType::Dropped, received.to_string())
                        .with_data(serde_json::json!({ "expected": expected.to_string() })),
                );
                match released {
                    Some((_, command)) => self.settle(st, command, Settlement::Abandoned),
                    None => Deferred::default(),
                }
            }
        }
    }

    fn handle_twt_teardown(&self, st: &mut SmeState, event: TwtEvent) -> Deferred {
        let mut deferred = Deferred::default();
        let target = event.target();
        let covered = st.twt.force_reset(&target);
        let role = st.vdevs.get(&event.vdev_id).map(|info| info.role);

        // A SAP reports teardowns for peers it never tracked
        if covered.is_empty() && role != Some(VdevRole::Sap) {
            tracing::debug!(
                "Ignoring TWT teardown ({:?}) for untracked {}",
                event.status,
                target
            );
            return deferred;
        }

        tracing::info!(
            "TWT teardown by firmware on {}: {:?}, {} sessions reset",
            target,
            event.status,
            covered.len()
        );

        let teardown = TwtTeardown {
            vdev_id: event.vdev_id,
            peer: event.peer,
            dialog_id: event.dialog_id,
            reason: event.status,
        };
        let notifier = self.notifier.clone();
        deferred.push(move || notifier.on_twt_teardown(teardown));
        deferred
    }

    fn handle_roam_notification(
        &self,
        st: &mut SmeState,
        notification: RoamNotification,
    ) -> Deferred {
        let mut deferred = Deferred::default();
        let vdev_id = notification.vdev_id();

        match st.roam.on_notification(&notification) {
            RoamDisposition::Serviced => {
                tracing::debug!("Serviced roam notification {:?}", notification);
                if let RoamNotification::Synch { bssid, .. } = notification {
                    if let Some(info) = st.vdevs.get_mut(&vdev_id) {
                        info.bssid = Some(bssid);
                    }

                    let teardowns: Vec<TwtTeardown> = st
                        .twt
                        .reset_vdev(vdev_id)
                        .into_iter()
                        .map(|(peer, dialog_id)| TwtTeardown {
                            vdev_id,
                            peer,
                            dialog_id,
                            reason: TwtStatus::Roaming,
                        })
                        .collect();
                    tracing::info!(
                        "Vdev {} roamed to {}, {} TWT sessions reset",
                        vdev_id,
                        bssid,
                        teardowns.len()
                    );

                    let notifier = self.notifier.clone();
                    deferred.push(move || {
                        for teardown in teardowns {
                            notifier.on_twt_teardown(teardown);
                        }
                        notifier.on_roam_synch(vdev_id, bssid);
                    });
                }
            }
            RoamDisposition::Ignored(why) => {
                tracing::debug!("Ignoring roam notification {:?}: {}", notification, why);
            }
            RoamDisposition::Recover(detail) => {
                tracing::warn!("Roam state diverged on vdev {}: {}", vdev_id, detail);
                let recovery = self.recovery.clone();
                deferred.push(move || {
                    recovery.trigger(RecoveryReason::RoamStateDivergence { vdev_id, detail })
                });
            }
        }

        deferred
    }

    /// Release the guards a departing command holds and prepare its callback.
    fn settle(&self, st: &mut SmeState, command: SmeCommand, settlement: Settlement) -> Deferred {
        let mut deferred = Deferred::default();

        match (command.into_payload(), settlement) {
            (
                Request::SetHwMode { params, callback },
                Settlement::Response(FirmwareEvent::SetHwMode(response)),
            ) => {
                let result = SetHwModeResult::from_response(&params, response);
                deferred.push(move || callback(result));
            }
            (Request::SetHwMode { params, callback }, Settlement::PostFailed) => {
                let result = SetHwModeResult::failed(&params, PolicyMgrStatus::Cancelled);
                deferred.push(move || callback(result));
            }
            (
                Request::DualMacConfig { params, callback },
                Settlement::Response(FirmwareEvent::DualMacConfig(response)),
            ) => {
                let result = DualMacConfigResult::new(&params, response.status.into());
                deferred.push(move || callback(result));
            }
            (Request::DualMacConfig { params, callback }, Settlement::PostFailed) => {
                let result = DualMacConfigResult::new(&params, PolicyMgrStatus::Cancelled);
                deferred.push(move || callback(result));
            }
            (
                Request::NssUpdate { params, callback },
                Settlement::Response(FirmwareEvent::NssUpdate(response)),
            ) => {
                let result = NssUpdateResult::new(&params, response.status.into());
                deferred.push(move || callback(result));
            }
            (Request::NssUpdate { params, callback }, Settlement::PostFailed) => {
                let result = NssUpdateResult::new(&params, PolicyMgrStatus::Cancelled);
                deferred.push(move || callback(result));
            }
            (
                Request::AntennaMode { params, callback },
                Settlement::Response(FirmwareEvent::AntennaMode(response)),
            ) => {
                let result = AntennaModeResult::new(&params, response.status.into());
                deferred.push(move || callback(result));
            }
            (Request::AntennaMode { params, callback }, Settlement::PostFailed) => {
                let result = AntennaModeResult::new(&params, PolicyMgrStatus::Cancelled);
                deferred.push(move || callback(result));
            }
            (
                Request::Twt {
                    command,
                    target,
                    callback,
                    ..
                },
                settlement,
            ) => {
                st.twt.finish(&target, command);

                let response = match settlement {
                    Settlement::Response(FirmwareEvent::Twt(event)) => {
                        let applied = if st.vdevs.contains_key(&target.vdev_id) {
                            st.twt.apply(&target, command, event.status)
                        } else {
                            Default::default()
                        };
                        Some(TwtResponse {
                            command,
                            target,
                            status: event.status,
                            renegotiation: applied.renegotiation,
                            detail: event.detail,
                        })
                    }
                    Settlement::PostFailed => Some(TwtResponse {
                        command,
                        target,
                        status: TwtStatus::HostFailure,
                        renegotiation: false,
                        detail: TwtEventDetail::None,
                    }),
                    _ => None,
                };

                if let Some(response) = response {
                    deferred.push(move || callback(response));
                }
            }
            (Request::RoamInvoke { params, callback }, settlement) => {
                self.settle_roam(
                    st,
                    params.vdev_id,
                    RoamCommand::Invoke,
                    callback,
                    settlement,
                    &mut deferred,
                );
            }
            (
                Request::RoamOffload {
                    vdev_id,
                    command,
                    callback,
                },
                settlement,
            ) => {
                self.settle_roam(
                    st,
                    vdev_id,
                    RoamCommand::Offload(command),
                    callback,
                    settlement,
                    &mut deferred,
                );
            }
            (request, Settlement::Response(event)) => {
                tracing::warn!(
                    "{} response carried an unexpected payload: {:?}",
                    request.kind(),
                    event
                );
            }
            // Abandoned policy-manager requests only lose their callback
            (_, _) => {}
        }

        deferred
    }

    fn settle_roam(
        &self,
        st: &mut SmeState,
        vdev_id: VdevId,
        command: RoamCommand,
        callback: RoamCallback,
        settlement: Settlement,
        deferred: &mut Deferred,
    ) {
        let result = match settlement {
            Settlement::Response(
                FirmwareEvent::RoamInvoke(response) | FirmwareEvent::RoamOffload(response),
            ) => {
                st.roam.finish(vdev_id, command, response.is_ok());
                RoamResult {
                    vdev_id,
                    command,
                    success: response.is_ok(),
                    status: response.status,
                }
            }
            Settlement::PostFailed => {
                st.roam.abort(vdev_id, command);
                RoamResult {
                    vdev_id,
                    command,
                    success: false,
                    status: ROAM_HOST_FAILURE,
                }
            }
            _ => {
                st.roam.abort(vdev_id, command);
                return;
            }
        };

        deferred.push(move || callback(result));
    }

    fn publish(&self, event: CommandEvent) {
        self.events.publish(event);
    }

    fn turn(&self) -> ReentrantMutexGuard<'_, RefCell<SmeState>> {
        self.state.lock()
    }

    /// Run `f` on the state. `f` must not call out of the context.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut SmeState) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }
}

impl fmt::Debug for MacContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Whether a TWT event is a teardown firmware made on its own, as opposed
/// to the response to a host terminate for the same sessions.
fn is_autonomous_teardown(st: &SmeState, event: &TwtEvent) -> bool {
    if event.command != TwtCommand::Terminate || !event.status.is_autonomous_teardown() {
        return false;
    }

    let awaited = st.queue.active().is_some_and(|(_, command)| {
        matches!(
            &command.payload,
            Request::Twt {
                command: TwtCommand::Terminate,
                target,
                ..
            } if *target == event.target()
        )
    });
    !awaited
}

fn lifecycle(event_type: CommandEventType, command: &SmeCommand) -> CommandEvent {
    CommandEvent::new(event_type, command.kind.to_string())
        .with_sequence(command.sequence())
        .with_vdev(command.vdev_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{NextAction, SetHwModeParams, UpdateReason};
    use crate::testing::RecordingTransport;
    use std::sync::mpsc;

    fn hw_mode(index: u32) -> SetHwModeParams {
        SetHwModeParams {
            hw_mode_index: index,
            session_id: None,
            reason: UpdateReason::default(),
            next_action: NextAction::NONE,
            request_id: index,
        }
    }

    fn open(pool: usize) -> (Arc<MacContext>, Arc<RecordingTransport>) {
        let transport = RecordingTransport::new();
        let config = SmeConfig {
            command_pool_size: pool,
            ..Default::default()
        };
        let ctx = MacContext::open(config, transport.clone()).unwrap();
        (ctx, transport)
    }

    #[test]
    fn test_first_request_is_posted_immediately() {
        let (ctx, transport) = open(4);
        let ticket = ctx.set_hw_mode(hw_mode(1), Box::new(|_| {})).unwrap();

        assert_eq!(ticket.kind, SmeCommandKind::SetHwMode);
        assert_eq!(ticket.vdev_id, PDEV_VDEV_ID);
        assert_eq!(transport.post_count(), 1);
        assert!(ctx.queue_stats().active);
        ctx.audit().unwrap();
    }

    #[test]
    fn test_callback_may_reenter_facade() {
        let (ctx, transport) = open(4);
        let (tx, rx) = mpsc::channel();

        let inner = ctx.clone();
        ctx.set_hw_mode(
            hw_mode(1),
            Box::new(move |result| {
                tx.send(result.request_id).unwrap();
                // Chained request from inside the completion
                inner.set_hw_mode(hw_mode(2), Box::new(|_| {})).unwrap();
            }),
        )
        .unwrap();

        ctx.on_event(FirmwareEvent::SetHwMode(crate::policy::SetHwModeResponse {
            status: 0,
            cfgd_hw_mode_index: 1,
            vdev_mac_map: vec![],
        }));

        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(transport.post_count(), 2);
        assert!(ctx.queue_stats().active);
        ctx.audit().unwrap();
    }

    #[test]
    fn test_closed_context_rejects() {
        let (ctx, _transport) = open(4);
        ctx.set_hw_mode(hw_mode(1), Box::new(|_| {})).unwrap();
        ctx.set_hw_mode(hw_mode(2), Box::new(|_| {})).unwrap();

        ctx.close();
        assert!(!ctx.is_open());
        assert_eq!(ctx.queue_stats().free, 4);
        assert_eq!(
            ctx.set_hw_mode(hw_mode(3), Box::new(|_| {})),
            Err(RequestError::Closed)
        );
    }

    #[test]
    fn test_vdev_registry() {
        let (ctx, _transport) = open(4);
        ctx.add_vdev(0, VdevRole::Sta).unwrap();

        assert!(matches!(
            ctx.add_vdev(0, VdevRole::Sap),
            Err(RequestError::InvalidParam(_))
        ));
        assert_eq!(
            ctx.add_vdev(PDEV_VDEV_ID, VdevRole::Sta),
            Err(RequestError::InvalidVdev(PDEV_VDEV_ID))
        );
        assert_eq!(ctx.vdev_connected(3, MacAddr::ZERO), Err(RequestError::InvalidVdev(3)));

        let bssid = MacAddr([2, 0, 0, 0, 0, 1]);
        ctx.vdev_connected(0, bssid).unwrap();
        assert_eq!(ctx.vdev(0).unwrap().bssid, Some(bssid));
        assert!(ctx.roam_state(0).is_some());

        ctx.remove_vdev(0).unwrap();
        assert!(ctx.vdev(0).is_none());
        assert!(ctx.roam_state(0).is_none());
        assert_eq!(ctx.remove_vdev(0), Err(RequestError::InvalidVdev(0)));
    }

    #[test]
    fn test_lifecycle_events_published() {
        let (ctx, _transport) = open(4);
        let ticket = ctx.set_hw_mode(hw_mode(1), Box::new(|_| {})).unwrap();

        let events = ctx.events().for_sequence(ticket.sequence);
        let types: Vec<CommandEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![CommandEventType::Queued, CommandEventType::Activated]
        );
    }
}
