//! The claim manager: owns one claim for the lifetime of one execution
//! attempt, activates it, supervises status reports, and recovers from
//! lost connections under the job lease.
//!
//! All claim activity runs on a single event loop (`run`), so messages,
//! status reports, and timer firings never overlap. Reconnect and
//! credential-renewal timers are deadline arms of the loop's `select!`;
//! there is structurally at most one of each outstanding, and a firing
//! always re-reads the live attempt counter rather than a stale closure.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::accounting::{AccountingLedger, ActivationMetrics};
use crate::claim::Claim;
use crate::config::ClaimConfig;
use crate::error::{ActivationError, FatalReason, ShutdownError};
use crate::lease::Lease;
use crate::record::{attr, JobRecord};
use crate::remote::{
    ActivationReply, AuditEvent, AuditLog, ExitStatus, LocateReply, PeerClient, ReconnectReply,
    ReportedState, SessionManager, StatusReport,
};
use crate::security::SessionPair;
use crate::state::{self, ClaimEvent, ResourceState};

const MESSAGE_BUFFER: usize = 64;

/// Requests accepted by the manager's event loop.
#[derive(Debug)]
pub enum ClaimMessage {
    Activate {
        reply: oneshot::Sender<Result<(), ActivationError>>,
    },
    RequestShutdown {
        graceful: bool,
        reply: oneshot::Sender<Result<(), ShutdownError>>,
    },
    Suspend {
        reply: oneshot::Sender<bool>,
    },
    Resume {
        reply: oneshot::Sender<bool>,
    },
    StatusReport(StatusReport),
    SocketLost,
    TransferStarted,
    TransferFinished,
    CurrentState {
        reply: oneshot::Sender<ResourceState>,
    },
}

/// Cheap cloneable front door to a running claim manager.
#[derive(Debug, Clone)]
pub struct ClaimHandle {
    tx: mpsc::Sender<ClaimMessage>,
}

impl ClaimHandle {
    pub async fn activate(&self) -> Result<(), ActivationError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ClaimMessage::Activate { reply })
            .await
            .map_err(|_| ActivationError::ManagerStopped)?;
        rx.await.map_err(|_| ActivationError::ManagerStopped)?
    }

    pub async fn request_shutdown(&self, graceful: bool) -> Result<(), ShutdownError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ClaimMessage::RequestShutdown { graceful, reply })
            .await
            .map_err(|_| ShutdownError::ManagerStopped)?;
        rx.await.map_err(|_| ShutdownError::ManagerStopped)?
    }

    /// Ask the peer to suspend the job. Returns false when the request
    /// could not be made (e.g. while reconnecting).
    pub async fn suspend(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ClaimMessage::Suspend { reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn resume(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ClaimMessage::Resume { reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Inject a status report received out of band.
    pub async fn status_report(&self, report: StatusReport) {
        let _ = self.tx.send(ClaimMessage::StatusReport(report)).await;
    }

    /// Tell the manager its connection to the execution agent died.
    pub async fn socket_lost(&self) {
        let _ = self.tx.send(ClaimMessage::SocketLost).await;
    }

    /// The file-transfer collaborator started moving output.
    pub async fn transfer_started(&self) {
        let _ = self.tx.send(ClaimMessage::TransferStarted).await;
    }

    pub async fn transfer_finished(&self) {
        let _ = self.tx.send(ClaimMessage::TransferFinished).await;
    }

    pub async fn current_state(&self) -> Option<ResourceState> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ClaimMessage::CurrentState { reply })
            .await
            .ok()?;
        rx.await.ok()
    }
}

/// How the manager's run loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The execution attempt completed.
    Finished,
    /// A permanent failure was reported through the failure channel.
    Fatal(FatalReason),
    /// The caller cancelled the loop or dropped every handle.
    Cancelled,
}

/// Transient bookkeeping that exists only while reconnecting.
#[derive(Debug)]
struct ReconnectState {
    attempts: u32,
    /// At most one scheduled attempt at a time.
    next_attempt: Option<Instant>,
}

/// Orchestrator for one claim on a remote execution slot.
pub struct ClaimManager<P, S, R, A> {
    config: ClaimConfig,
    claim: Claim,
    run_id: Uuid,
    peer: P,
    session_mgr: S,
    record: R,
    audit: A,

    lease: Lease,
    state: ResourceState,
    ledger: AccountingLedger,
    metrics: ActivationMetrics,
    sessions: Option<SessionPair>,
    reconnect: Option<ReconnectState>,
    renewal_deadline: Option<Instant>,

    began_execution: bool,
    killed_graceful: bool,
    killed_fast: bool,
    transfer_in_flight: bool,
    last_reported: Option<ReportedState>,
    agent_addr: Option<String>,
    bytes_received: u64,
    checkpointed_bytes: u64,

    message_tx: mpsc::Sender<ClaimMessage>,
    failure_tx: Option<oneshot::Sender<FatalReason>>,
    fatal: Option<FatalReason>,
}

impl<P, S, R, A> ClaimManager<P, S, R, A>
where
    P: PeerClient,
    S: SessionManager,
    R: JobRecord,
    A: AuditLog,
{
    /// Build a manager for one claim. Returns the message receiver to hand
    /// to `run` and the one-shot channel that delivers the permanent
    /// failure reason, exactly once, if the attempt is abandoned.
    pub fn new(
        config: ClaimConfig,
        claim: Claim,
        peer: P,
        session_mgr: S,
        record: R,
        audit: A,
    ) -> (
        Self,
        mpsc::Receiver<ClaimMessage>,
        oneshot::Receiver<FatalReason>,
    ) {
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_BUFFER);
        let (failure_tx, failure_rx) = oneshot::channel();
        // An explicitly configured lease wins; otherwise the job record
        // may grant one.
        let lease_duration = config.lease_duration.or_else(|| {
            record
                .get_i64(attr::LEASE_DURATION)
                .filter(|s| *s > 0)
                .map(|s| Duration::from_secs(s as u64))
        });
        let lease = Lease::new(lease_duration, Instant::now().into_std());
        let ledger = AccountingLedger::new(config.slot_weight);

        let manager = Self {
            config,
            claim,
            run_id: Uuid::new_v4(),
            peer,
            session_mgr,
            record,
            audit,
            lease,
            state: ResourceState::Pre,
            ledger,
            metrics: ActivationMetrics::default(),
            sessions: None,
            reconnect: None,
            renewal_deadline: None,
            began_execution: false,
            killed_graceful: false,
            killed_fast: false,
            transfer_in_flight: false,
            last_reported: None,
            agent_addr: None,
            bytes_received: 0,
            checkpointed_bytes: 0,
            message_tx,
            failure_tx: Some(failure_tx),
            fatal: None,
        };
        (manager, message_rx, failure_rx)
    }

    /// Get a handle for sending requests to the running manager.
    pub fn handle(&self) -> ClaimHandle {
        ClaimHandle {
            tx: self.message_tx.clone(),
        }
    }

    pub fn current_state(&self) -> ResourceState {
        self.state
    }

    /// Run the claim event loop until the attempt finishes, permanently
    /// fails, or is cancelled. Both security sessions are invalidated on
    /// the way out, whatever the outcome.
    pub async fn run(
        mut self,
        mut messages: mpsc::Receiver<ClaimMessage>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        tracing::debug!(run_id = %self.run_id, peer = %self.claim.display_name(), "claim manager starting");
        let mut reports: Option<mpsc::Receiver<StatusReport>> = None;

        let outcome = loop {
            if let Some(reason) = self.fatal.take() {
                break RunOutcome::Fatal(reason);
            }
            if self.state.is_terminal() {
                break RunOutcome::Finished;
            }

            let reconnect_at = self.reconnect.as_ref().and_then(|r| r.next_attempt);
            let renewal_at = self.renewal_deadline;

            tokio::select! {
                _ = cancel.cancelled() => break RunOutcome::Cancelled,

                msg = messages.recv() => match msg {
                    Some(msg) => self.handle_message(msg, &mut reports).await,
                    None => break RunOutcome::Cancelled,
                },

                report = recv_report(&mut reports), if reports.is_some() => match report {
                    Some(report) => self.handle_status_report(report),
                    None => {
                        // The claim data channel died under us.
                        reports = None;
                        self.handle_socket_lost(&mut reports);
                    }
                },

                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.run_reconnect_attempt(&mut reports).await;
                }

                _ = sleep_until(renewal_at.unwrap_or_else(Instant::now)), if renewal_at.is_some() => {
                    self.check_credential().await;
                }
            }
        };

        self.release_sessions().await;
        tracing::debug!(run_id = %self.run_id, ?outcome, "claim manager stopped");
        outcome
    }

    async fn handle_message(
        &mut self,
        msg: ClaimMessage,
        reports: &mut Option<mpsc::Receiver<StatusReport>>,
    ) {
        match msg {
            ClaimMessage::Activate { reply } => match self.handle_activate().await {
                Ok(stream) => {
                    *reports = Some(stream);
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            ClaimMessage::RequestShutdown { graceful, reply } => {
                let _ = reply.send(self.handle_shutdown(graceful).await);
            }
            ClaimMessage::Suspend { reply } => {
                let _ = reply.send(self.handle_suspend().await);
            }
            ClaimMessage::Resume { reply } => {
                let _ = reply.send(self.handle_resume().await);
            }
            ClaimMessage::StatusReport(report) => self.handle_status_report(report),
            ClaimMessage::SocketLost => self.handle_socket_lost(reports),
            ClaimMessage::TransferStarted => {
                self.transfer_in_flight = true;
            }
            ClaimMessage::TransferFinished => {
                self.transfer_in_flight = false;
                self.apply_event(ClaimEvent::TransferFinished);
            }
            ClaimMessage::CurrentState { reply } => {
                let _ = reply.send(self.state);
            }
        }
    }

    /// Activate the claim on the remote peer. The busy-retry sleep below
    /// is the one blocking retry in the crate: activation happens before
    /// the claim handles any other I/O.
    async fn handle_activate(&mut self) -> Result<mpsc::Receiver<StatusReport>, ActivationError> {
        self.ensure_sessions(true).await;

        let mut busy_retries = 0u32;
        loop {
            match self.peer.activate(self.record.snapshot()).await {
                ActivationReply::Accepted { reports } => {
                    tracing::info!(
                        run_id = %self.run_id,
                        peer = %self.claim.display_name(),
                        "activation request accepted"
                    );
                    self.metrics.reset();
                    self.began_execution = false;
                    self.last_reported = None;
                    // A fresh activation supersedes any reconnect in
                    // progress.
                    self.reconnect = None;
                    let now = Utc::now();
                    self.metrics.record_start(now);
                    self.record
                        .set(attr::CLAIM_START_DATE, json!(now.timestamp()));
                    self.apply_event(ClaimEvent::ActivationAccepted);
                    self.touch_lease();
                    self.renewal_deadline = self.next_credential_check();
                    self.record.save();
                    self.audit.emit(AuditEvent::Activated {
                        peer: self.claim.display_name().to_string(),
                    });
                    return Ok(reports);
                }
                ActivationReply::Busy => {
                    busy_retries += 1;
                    if busy_retries > self.config.activation_max_retries {
                        tracing::warn!(
                            retries = busy_retries - 1,
                            "peer still vacating previous occupant, giving up"
                        );
                        return Err(ActivationError::RetriesExhausted(
                            self.config.activation_max_retries,
                        ));
                    }
                    tracing::info!(
                        peer = %self.claim.display_name(),
                        retry_in_secs = self.config.activation_retry_delay.as_secs(),
                        "activation delayed, previous occupant still vacating"
                    );
                    sleep(self.config.activation_retry_delay).await;
                }
                ActivationReply::Refused => {
                    tracing::warn!(peer = %self.claim.display_name(), "activation refused");
                    return Err(ActivationError::Refused);
                }
                ActivationReply::Failed(msg) => {
                    tracing::warn!(peer = %self.claim.display_name(), error = %msg, "activation failed");
                    return Err(ActivationError::Failed(msg));
                }
            }
        }
    }

    /// Derive and negotiate the claim's security sessions. With `replace`
    /// set, an existing pair (from a previous activation) is invalidated
    /// first; otherwise an existing pair is kept as-is.
    async fn ensure_sessions(&mut self, replace: bool) {
        if let Some(pair) = self.sessions.take() {
            if !replace {
                self.sessions = Some(pair);
                return;
            }
            self.session_mgr.invalidate(pair.general.id()).await;
            self.session_mgr.invalidate(pair.file_transfer.id()).await;
        }

        let pair = SessionPair::derive(&self.claim);
        for session in [&pair.general, &pair.file_transfer] {
            if !self.session_mgr.negotiate(session).await {
                tracing::warn!(
                    session_id = session.id(),
                    level = %session.level(),
                    "session negotiation failed, falling back to ambient negotiation"
                );
                self.audit.emit(AuditEvent::SessionDegraded {
                    session_id: session.id().to_string(),
                });
            }
        }
        self.sessions = Some(pair);
    }

    async fn release_sessions(&mut self) {
        if let Some(pair) = self.sessions.take() {
            self.session_mgr.invalidate(pair.general.id()).await;
            self.session_mgr.invalidate(pair.file_transfer.id()).await;
        }
    }

    /// Record a successful contact with the peer.
    fn touch_lease(&mut self) {
        self.lease.touch(Instant::now().into_std());
        self.record
            .set(attr::LAST_LEASE_RENEWAL, json!(Utc::now().timestamp()));
    }

    fn handle_status_report(&mut self, report: StatusReport) {
        self.touch_lease();

        if let Some(addr) = report.agent_addr {
            tracing::debug!(agent = %addr, "execution agent moved");
            self.agent_addr = Some(addr);
        }
        if let Some(cpu) = report.remote_cpu_secs {
            self.record.set(attr::REMOTE_CPU_SECS, json!(cpu));
        }
        if let Some(kb) = report.image_size_kb {
            // Image size only grows, same as the record's view of it.
            let prev = self.record.get_i64(attr::IMAGE_SIZE_KB).unwrap_or(0);
            if kb as i64 > prev {
                self.record.set(attr::IMAGE_SIZE_KB, json!(kb));
            }
        }
        if let Some(bytes) = report.bytes_received {
            self.bytes_received = self.bytes_received.max(bytes);
        }

        if let Some(reported) = report.job_state {
            self.apply_reported_state(reported, report.num_pids);
        }
        if let Some(exit) = report.exit {
            self.record_exit(exit);
        }

        self.record.save();
    }

    /// Translate a reported job state into transitions and accounting.
    /// Duplicate reports of the same logical event are dropped here, so
    /// each ledger mutator fires at most once per genuine transition.
    fn apply_reported_state(&mut self, reported: ReportedState, num_pids: Option<u32>) {
        if self.last_reported == Some(reported) {
            tracing::debug!(?reported, "duplicate status report, ignoring");
            return;
        }
        self.last_reported = Some(reported);
        let now = Utc::now();

        match reported {
            ReportedState::Suspended => {
                self.ledger.on_suspend(now);
                self.audit.emit(AuditEvent::Suspended {
                    num_pids: num_pids.unwrap_or(0),
                });
                self.apply_event(ClaimEvent::PeerReportedSuspended);
            }
            ReportedState::Running => {
                if self.ledger.is_suspended() {
                    self.ledger.on_resume(now);
                    self.audit.emit(AuditEvent::Resumed);
                }
                if self.state == ResourceState::Suspended {
                    self.apply_event(ClaimEvent::PeerReportedRunning);
                } else {
                    self.note_execution_began(now);
                }
            }
            ReportedState::Checkpointed => {
                self.ledger.on_checkpoint(now, self.metrics.start_time());
                let bytes = self.bytes_received.saturating_sub(self.checkpointed_bytes);
                self.checkpointed_bytes = self.bytes_received;
                self.audit.emit(AuditEvent::Checkpointed {
                    bytes_since_last: bytes,
                });
                self.apply_event(ClaimEvent::PeerReportedCheckpointed);
            }
        }

        self.write_ledger_to_record();
    }

    fn note_execution_began(&mut self, now: DateTime<Utc>) {
        if !self.began_execution {
            self.began_execution = true;
            self.metrics.record_execution_start(now);
            self.record
                .set(attr::EXECUTION_START_DATE, json!(now.timestamp()));
            self.audit.emit(AuditEvent::ExecutionBegan);
        }
        self.apply_event(ClaimEvent::ExecutionBegan);
    }

    fn record_exit(&mut self, exit: ExitStatus) {
        self.metrics.record_execution_exit(Utc::now());
        self.record.set(attr::EXITED_BY_SIGNAL, json!(exit.by_signal));
        if exit.by_signal {
            self.record.set(attr::EXIT_SIGNAL, json!(exit.value));
        } else {
            self.record.set(attr::EXIT_CODE, json!(exit.value));
        }
        self.audit.emit(AuditEvent::Exited { exit });
        self.apply_event(ClaimEvent::ExitRecorded {
            transfer_in_flight: self.transfer_in_flight,
        });
    }

    fn handle_socket_lost(&mut self, reports: &mut Option<mpsc::Receiver<StatusReport>>) {
        *reports = None;

        if self.state.is_terminal() || self.state.is_shutting_down() {
            tracing::debug!(state = %self.state, "connection closed while shutting down");
            return;
        }
        if self.state == ResourceState::Pre {
            tracing::debug!("no active connection to lose");
            return;
        }

        if !self.config.supports_reconnect {
            tracing::error!("connection lost and reconnection is not supported");
            self.audit.emit(AuditEvent::Disconnected);
            self.fail(FatalReason::ReconnectUnsupported);
            return;
        }

        if self.state != ResourceState::Reconnecting {
            tracing::warn!(
                peer = %self.claim.display_name(),
                "connection to execution agent lost, trying to reconnect"
            );
            self.audit.emit(AuditEvent::Disconnected);
            self.apply_event(ClaimEvent::SocketLost);
            self.last_reported = None;
            // A repeated loss keeps the attempt count of the first one.
            if self.reconnect.is_none() {
                self.reconnect = Some(ReconnectState {
                    attempts: 0,
                    next_attempt: None,
                });
            }
        }

        if self
            .reconnect
            .as_ref()
            .is_some_and(|r| r.next_attempt.is_some())
        {
            // An attempt is already scheduled; nothing more to do.
            return;
        }
        self.schedule_reconnect();
    }

    /// Step 3 of the reconnect cycle: check the lease and schedule the
    /// next attempt, bounded by the remaining budget.
    fn schedule_reconnect(&mut self) {
        let now = Instant::now();
        let remaining = self.lease.remaining(now.into_std());
        if remaining.is_zero() {
            self.fail_lease_expired();
            return;
        }

        let Some(rs) = self.reconnect.as_mut() else {
            return;
        };
        if rs.next_attempt.is_some() {
            debug_assert!(false, "reconnect attempt already scheduled");
            tracing::error!("reconnect attempt already scheduled, refusing to double-schedule");
            return;
        }
        let delay = (self.config.reconnect_backoff)(rs.attempts).min(remaining);
        if !delay.is_zero() {
            tracing::info!(
                delay_secs = delay.as_secs(),
                attempts = rs.attempts,
                lease_remaining_secs = remaining.as_secs(),
                "scheduling next reconnect attempt"
            );
        }
        rs.next_attempt = Some(now + delay);
    }

    fn fail_lease_expired(&mut self) {
        let secs = self.lease.duration().map(|d| d.as_secs()).unwrap_or(0);
        tracing::error!(lease_secs = secs, "job disconnected too long, lease expired");
        self.reconnect = None;
        self.fail(FatalReason::LeaseExpired(secs));
    }

    /// One reconnect attempt: lease check, locate the agent through its
    /// parent, then a direct reconnect request.
    async fn run_reconnect_attempt(&mut self, reports: &mut Option<mpsc::Receiver<StatusReport>>) {
        // The lease is re-checked before the attempt so we never contact
        // the peer after the budget is gone.
        if self.lease.remaining(Instant::now().into_std()).is_zero() {
            self.fail_lease_expired();
            return;
        }
        let Some(rs) = self.reconnect.as_mut() else {
            return;
        };
        rs.next_attempt = None;
        rs.attempts += 1;
        let attempt = rs.attempts;

        tracing::info!(attempt, "attempting to locate disconnected execution agent");
        self.audit.emit(AuditEvent::ReconnectAttempt { attempt });

        let credential = self.claim.credential().to_string();
        match self.peer.locate(&credential).await {
            LocateReply::Found(addr) => {
                tracing::info!(agent = %addr, "found execution agent");
                self.request_reconnect(addr, reports).await;
            }
            LocateReply::NotFound => {
                tracing::error!("job not found at remote end");
                self.reconnect = None;
                self.fail(FatalReason::JobNotFound);
            }
            LocateReply::Unreachable => {
                tracing::warn!(attempt, "peer unreachable while locating agent");
                self.schedule_reconnect();
            }
            LocateReply::ProtocolError(code) => {
                tracing::error!(code, "locate returned an impossible result");
                self.reconnect = None;
                self.fail(FatalReason::ProtocolFault(code));
            }
        }
    }

    async fn request_reconnect(
        &mut self,
        addr: String,
        reports: &mut Option<mpsc::Receiver<StatusReport>>,
    ) {
        self.ensure_sessions(false).await;
        let session_id = self
            .sessions
            .as_ref()
            .map(|s| s.general.id().to_string())
            .unwrap_or_default();

        match self.peer.request_reconnect(&addr, &session_id).await {
            ReconnectReply::Accepted {
                reports: stream,
                agent_addr,
            } => {
                let attempts = self.reconnect.take().map(|r| r.attempts).unwrap_or(0);
                tracing::info!(
                    attempts,
                    agent = %agent_addr,
                    "reconnect succeeded, connection re-established"
                );
                *reports = Some(stream);
                self.agent_addr = Some(agent_addr);
                self.last_reported = None;
                self.reconcile_after_reconnect();
                self.touch_lease();
                self.renewal_deadline = self.next_credential_check();
                self.record.save();
                self.audit.emit(AuditEvent::Reconnected { attempts });
            }
            ReconnectReply::Unreachable => {
                tracing::warn!(agent = %addr, "reconnect request failed, agent unreachable");
                self.schedule_reconnect();
            }
            ReconnectReply::NotAuthorized(msg) => {
                tracing::error!(error = %msg, "agent no longer trusts our credential");
                self.reconnect = None;
                self.fail(FatalReason::AuthorizationRejected(msg));
            }
            ReconnectReply::ProtocolError(code) => {
                tracing::error!(code, "reconnect returned an impossible result");
                self.reconnect = None;
                self.fail(FatalReason::ProtocolFault(code));
            }
        }
    }

    /// After relocation, trust the durable job record over in-memory
    /// state: our own process may have restarted since activation.
    fn reconcile_after_reconnect(&mut self) {
        let exec_start = self.record.get_i64(attr::EXECUTION_START_DATE);
        let claim_start = self
            .record
            .get_i64(attr::CLAIM_START_DATE)
            .or_else(|| self.metrics.start_time().map(|t| t.timestamp()));

        if let Some(c) = claim_start {
            if let Some(ts) = DateTime::<Utc>::from_timestamp(c, 0) {
                self.metrics.record_start(ts);
            }
        }

        match (exec_start, claim_start) {
            (Some(e), Some(c)) if e >= c => {
                self.began_execution = true;
                if let Some(ts) = DateTime::<Utc>::from_timestamp(e, 0) {
                    self.metrics.record_execution_start(ts);
                }
                self.apply_event(ClaimEvent::ExecutionBegan);
            }
            _ => {
                // The agent never reported execution; pick up in startup.
                self.apply_event(ClaimEvent::ActivationAccepted);
            }
        }
    }

    /// Deliver a deactivate request to the peer. Idempotent per value of
    /// `graceful`. The lease-bounded wait at the end is opt-in and the
    /// only blocking wait outside activation.
    async fn handle_shutdown(&mut self, graceful: bool) -> Result<(), ShutdownError> {
        if (graceful && self.killed_graceful) || (!graceful && self.killed_fast) {
            tracing::debug!(graceful, "shutdown already delivered, nothing to do");
            return Ok(());
        }

        self.audit.emit(AuditEvent::ShutdownRequested { graceful });
        if !graceful {
            self.abort_transfer();
        }

        let mut attempts = 1u32;
        let mut delivered = self.peer.deactivate(graceful).await;
        while !delivered && attempts < self.config.shutdown_max_retries {
            attempts += 1;
            tracing::warn!(
                attempt = attempts,
                "could not reach peer to deactivate, retrying"
            );
            sleep(self.config.shutdown_retry_delay).await;
            delivered = self.peer.deactivate(graceful).await;
        }

        if !delivered && self.config.wait_on_shutdown {
            let deadline = Instant::now() + self.lease.remaining(Instant::now().into_std());
            while !delivered && Instant::now() < deadline {
                let wait = self
                    .config
                    .shutdown_retry_delay
                    .min(deadline.saturating_duration_since(Instant::now()));
                sleep(wait).await;
                attempts += 1;
                delivered = self.peer.deactivate(graceful).await;
            }
        }

        if !delivered {
            tracing::error!(attempts, "giving up on deactivating the claim");
            return Err(ShutdownError::PeerUnreachable(attempts));
        }

        if graceful {
            self.killed_graceful = true;
        } else {
            self.killed_fast = true;
        }
        tracing::info!(
            graceful,
            peer = %self.claim.display_name(),
            "deactivated claim"
        );
        self.touch_lease();
        self.apply_event(ClaimEvent::KillRequested);

        if self.record.get_bool(attr::RELEASE_CLAIM).unwrap_or(false) {
            // Best effort; a failed release never fails the shutdown.
            // The kill is already delivered, so the release always asks
            // for a fast vacate.
            tracing::debug!("job requested release of the underlying reservation");
            self.peer.release(true).await;
        }
        self.record.save();
        Ok(())
    }

    fn abort_transfer(&mut self) {
        if self.transfer_in_flight {
            self.transfer_in_flight = false;
            if self.state == ResourceState::PendingTransfer {
                self.apply_event(ClaimEvent::TransferFinished);
            }
        }
    }

    async fn handle_suspend(&mut self) -> bool {
        if self.state == ResourceState::Reconnecting {
            tracing::warn!("cannot suspend, not connected to the execution agent");
            return false;
        }
        let ok = self.peer.suspend().await;
        if ok {
            self.touch_lease();
            self.record.save();
        } else {
            tracing::warn!("peer rejected suspend request");
        }
        ok
    }

    async fn handle_resume(&mut self) -> bool {
        if self.state == ResourceState::Reconnecting {
            tracing::warn!("cannot resume, not connected to the execution agent");
            return false;
        }
        let ok = self.peer.resume().await;
        if ok {
            self.touch_lease();
            self.record.save();
        } else {
            tracing::warn!("peer rejected resume request");
        }
        ok
    }

    /// Periodic delegated-credential check, armed only when the job
    /// carries an expiring credential.
    async fn check_credential(&mut self) {
        self.renewal_deadline = None;
        let Some(expiration) = self.record.get_i64(attr::CREDENTIAL_EXPIRATION) else {
            return;
        };
        if self.peer.renew_credential(expiration).await {
            tracing::debug!("delegated credential refreshed with peer");
            self.touch_lease();
            self.record.save();
        } else {
            tracing::warn!("peer could not take renewed credential");
        }
        self.renewal_deadline = Some(Instant::now() + self.config.credential_check_interval);
    }

    fn next_credential_check(&self) -> Option<Instant> {
        self.record
            .get_i64(attr::CREDENTIAL_EXPIRATION)
            .map(|_| Instant::now() + self.config.credential_check_interval)
    }

    /// Feed one event through the pure state machine and act on the
    /// transition. Illegal pairs are logged and dropped, never fatal.
    fn apply_event(&mut self, event: ClaimEvent) {
        match state::next(self.state, event) {
            Some(next) if next != self.state => {
                tracing::info!(
                    peer = %self.claim.display_name(),
                    from = %self.state,
                    to = %next,
                    "resource state change"
                );
                self.state = next;
                if next == ResourceState::Finished {
                    self.metrics.record_termination(Utc::now());
                }
                if next.is_shutting_down() {
                    // Mandatory: a stale reconnect attempt must never race
                    // the teardown.
                    if self.reconnect.take().is_some() {
                        tracing::debug!("cancelled pending reconnect attempt");
                    }
                }
                if next == ResourceState::Reconnecting {
                    // Mandatory: no credential renewal while disconnected.
                    self.renewal_deadline = None;
                }
            }
            Some(_) => {}
            None if self.state.is_shutting_down() || self.state.is_terminal() => {
                tracing::debug!(state = %self.state, ?event, "event ignored during shutdown");
            }
            None => {
                tracing::warn!(state = %self.state, ?event, "no legal transition for event");
            }
        }
    }

    /// Mirror the ledger into the job record. The record is shared with
    /// the wider scheduling system; these are recomputed absolute values,
    /// so last-writer-wins semantics are safe.
    fn write_ledger_to_record(&mut self) {
        let suspensions = self.ledger.total_suspensions();
        let cumulative = self.ledger.cumulative_suspension_time().as_secs();
        let uncommitted = self.ledger.uncommitted_suspension_time().as_secs();
        let committed_susp = self.ledger.committed_suspension_time().as_secs();
        let last_susp = self
            .ledger
            .last_suspension_time()
            .map(|t| t.timestamp())
            .unwrap_or(0);
        let checkpoints = self.ledger.checkpoint_count();
        let last_ckpt = self
            .ledger
            .last_checkpoint_time()
            .map(|t| t.timestamp())
            .unwrap_or(0);
        let committed = self.ledger.committed_time().as_secs();
        let committed_slot = self.ledger.committed_slot_time_secs();

        self.record.set(attr::TOTAL_SUSPENSIONS, json!(suspensions));
        self.record
            .set(attr::CUMULATIVE_SUSPENSION_TIME, json!(cumulative));
        self.record
            .set(attr::UNCOMMITTED_SUSPENSION_TIME, json!(uncommitted));
        self.record
            .set(attr::COMMITTED_SUSPENSION_TIME, json!(committed_susp));
        self.record.set(attr::LAST_SUSPENSION_TIME, json!(last_susp));
        self.record.set(attr::NUM_CHECKPOINTS, json!(checkpoints));
        self.record.set(attr::LAST_CHECKPOINT_TIME, json!(last_ckpt));
        self.record.set(attr::COMMITTED_TIME, json!(committed));
        self.record
            .set(attr::COMMITTED_SLOT_TIME, json!(committed_slot));
    }

    /// Report a permanent failure, exactly once, and stop the loop.
    fn fail(&mut self, reason: FatalReason) {
        if let Some(tx) = self.failure_tx.take() {
            let _ = tx.send(reason.clone());
        } else {
            debug_assert!(false, "second permanent failure: {reason}");
            tracing::error!(%reason, "permanent failure after one was already reported");
        }
        self.fatal = Some(reason);
    }
}

async fn recv_report(
    reports: &mut Option<mpsc::Receiver<StatusReport>>,
) -> Option<StatusReport> {
    match reports.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
