//! Pure resource state machine for one claim. No I/O: the manager feeds
//! events in and acts on the transitions this module reports.

use serde::{Deserialize, Serialize};

/// Where the remote slot is in its lifecycle, from our point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    /// Claim exists but activation has not been accepted yet.
    Pre,
    /// Activation accepted, execution agent starting up.
    Startup,
    /// Job is running on the remote slot.
    Executing,
    /// Job is suspended on the remote slot.
    Suspended,
    /// Job state was durably saved by the peer.
    Checkpointed,
    /// Job exited but a file transfer is still in flight.
    PendingTransfer,
    /// We asked the peer to kill the job and are waiting for it to die.
    PendingDeath,
    /// Terminal: the execution attempt is over.
    Finished,
    /// Connection to the peer was lost; trying to re-establish it.
    Reconnecting,
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceState::Pre => "pre",
            ResourceState::Startup => "startup",
            ResourceState::Executing => "executing",
            ResourceState::Suspended => "suspended",
            ResourceState::Checkpointed => "checkpointed",
            ResourceState::PendingTransfer => "pending-transfer",
            ResourceState::PendingDeath => "pending-death",
            ResourceState::Finished => "finished",
            ResourceState::Reconnecting => "reconnecting",
        };
        write!(f, "{}", s)
    }
}

impl ResourceState {
    pub fn is_terminal(self) -> bool {
        self == ResourceState::Finished
    }

    /// True once the claim has started tearing down. Inbound peer reports
    /// are still accounted for in these states but no longer move the
    /// state machine.
    pub fn is_shutting_down(self) -> bool {
        matches!(
            self,
            ResourceState::PendingDeath | ResourceState::PendingTransfer
        )
    }
}

/// Everything that can drive a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimEvent {
    /// The peer accepted our activation (or reconnect) request.
    ActivationAccepted,
    /// The execution agent reported that the job process started.
    ExecutionBegan,
    PeerReportedRunning,
    PeerReportedSuspended,
    PeerReportedCheckpointed,
    /// The job exited on the remote side.
    ExitRecorded { transfer_in_flight: bool },
    KillRequested,
    TransferFinished,
    SocketLost,
}

/// Transition function. Returns the successor state, or `None` when the
/// (state, event) pair has no legal transition; the caller logs those and
/// carries on, they are never fatal.
pub fn next(current: ResourceState, event: ClaimEvent) -> Option<ResourceState> {
    use ClaimEvent::*;
    use ResourceState::*;

    // Finished is terminal.
    if current == Finished {
        return None;
    }

    // Once the claim is shutting down, peer reports are accounting-only
    // and a dying socket is expected, not a reason to reconnect.
    if current.is_shutting_down() {
        return match event {
            ExitRecorded {
                transfer_in_flight: false,
            } => Some(Finished),
            TransferFinished if current == PendingTransfer => Some(Finished),
            KillRequested => Some(PendingDeath),
            _ => None,
        };
    }

    match (current, event) {
        // An accepted activation restarts the lifecycle from any live
        // state: re-activation under the same manager begins a fresh
        // attempt, and a successful reconnect whose job record shows
        // execution had not begun yet resolves here too.
        (_, ActivationAccepted) => Some(Startup),
        (Startup | Executing | Suspended | Checkpointed | Reconnecting, ExecutionBegan) => {
            Some(Executing)
        }
        (Suspended, PeerReportedRunning) => Some(Executing),
        (_, PeerReportedSuspended) => Some(Suspended),
        (_, PeerReportedCheckpointed) => Some(Checkpointed),
        (
            _,
            ExitRecorded {
                transfer_in_flight: true,
            },
        ) => Some(PendingTransfer),
        (
            _,
            ExitRecorded {
                transfer_in_flight: false,
            },
        ) => Some(Finished),
        (_, KillRequested) => Some(PendingDeath),
        (Startup | Executing | Suspended | Checkpointed | Reconnecting, SocketLost) => {
            Some(Reconnecting)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ClaimEvent::*;
    use ResourceState::*;

    #[test]
    fn activation_moves_pre_to_startup() {
        assert_eq!(next(Pre, ActivationAccepted), Some(Startup));
    }

    #[test]
    fn reactivation_restarts_from_any_live_state() {
        for state in [Startup, Executing, Suspended, Checkpointed] {
            assert_eq!(next(state, ActivationAccepted), Some(Startup));
        }
        assert_eq!(next(PendingDeath, ActivationAccepted), None);
        assert_eq!(next(PendingTransfer, ActivationAccepted), None);
        assert_eq!(next(Finished, ActivationAccepted), None);
    }

    #[test]
    fn execution_begins_from_startup_and_after_checkpoint() {
        assert_eq!(next(Startup, ExecutionBegan), Some(Executing));
        assert_eq!(next(Checkpointed, ExecutionBegan), Some(Executing));
        assert_eq!(next(Suspended, ExecutionBegan), Some(Executing));
        assert_eq!(next(Executing, ExecutionBegan), Some(Executing));
        assert_eq!(next(Pre, ExecutionBegan), None);
    }

    #[test]
    fn resume_only_from_suspended() {
        assert_eq!(next(Suspended, PeerReportedRunning), Some(Executing));
        assert_eq!(next(Startup, PeerReportedRunning), None);
        assert_eq!(next(Executing, PeerReportedRunning), None);
    }

    #[test]
    fn suspend_and_checkpoint_reports_apply_broadly() {
        assert_eq!(next(Executing, PeerReportedSuspended), Some(Suspended));
        assert_eq!(next(Startup, PeerReportedSuspended), Some(Suspended));
        assert_eq!(next(Executing, PeerReportedCheckpointed), Some(Checkpointed));
        assert_eq!(next(Suspended, PeerReportedCheckpointed), Some(Checkpointed));
    }

    #[test]
    fn exit_goes_to_transfer_or_finished() {
        assert_eq!(
            next(
                Executing,
                ExitRecorded {
                    transfer_in_flight: true
                }
            ),
            Some(PendingTransfer)
        );
        assert_eq!(
            next(
                Executing,
                ExitRecorded {
                    transfer_in_flight: false
                }
            ),
            Some(Finished)
        );
        assert_eq!(next(PendingTransfer, TransferFinished), Some(Finished));
    }

    #[test]
    fn kill_from_anywhere_except_finished() {
        assert_eq!(next(Pre, KillRequested), Some(PendingDeath));
        assert_eq!(next(Executing, KillRequested), Some(PendingDeath));
        assert_eq!(next(Reconnecting, KillRequested), Some(PendingDeath));
        assert_eq!(next(Finished, KillRequested), None);
    }

    #[test]
    fn socket_loss_enters_reconnecting_only_while_live() {
        assert_eq!(next(Executing, SocketLost), Some(Reconnecting));
        assert_eq!(next(Suspended, SocketLost), Some(Reconnecting));
        assert_eq!(next(Reconnecting, SocketLost), Some(Reconnecting));
        assert_eq!(next(Pre, SocketLost), None);
        assert_eq!(next(PendingDeath, SocketLost), None);
        assert_eq!(next(PendingTransfer, SocketLost), None);
    }

    #[test]
    fn shutdown_states_ignore_peer_reports() {
        for state in [PendingDeath, PendingTransfer] {
            assert_eq!(next(state, PeerReportedRunning), None);
            assert_eq!(next(state, PeerReportedSuspended), None);
            assert_eq!(next(state, PeerReportedCheckpointed), None);
        }
    }

    #[test]
    fn reconnect_resolution_restores_either_phase() {
        // Job record showed execution had begun.
        assert_eq!(next(Reconnecting, ExecutionBegan), Some(Executing));
        // Job record showed the agent never got that far.
        assert_eq!(next(Reconnecting, ActivationAccepted), Some(Startup));
    }

    #[test]
    fn finished_is_terminal() {
        for event in [
            ActivationAccepted,
            ExecutionBegan,
            PeerReportedRunning,
            PeerReportedSuspended,
            PeerReportedCheckpointed,
            KillRequested,
            TransferFinished,
            SocketLost,
        ] {
            assert_eq!(next(Finished, event), None);
        }
    }
}
