//! Connection state machine for the sync client.

use crate::error::{SyncError, SyncResult};

/// The current state of the sync client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No connection; waiting to (re)connect.
    Disconnected,
    /// Dialling and opening the subscription.
    Connecting,
    /// Subscription open, receiving updates.
    Streaming,
    /// Stream failed; the pipeline is being rotated.
    Closing,
    /// Cancelled. Terminal.
    Stopped,
}

/// Events that drive [`ClientState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// Start a connection attempt.
    Connect,
    /// Dial or subscribe failed.
    ConnectFailed,
    /// Subscription stream opened.
    Subscribed,
    /// An update was received.
    Received,
    /// The open stream returned an error.
    StreamFailed,
    /// A fresh pipeline was published and the old one closed.
    PipelineRotated,
    /// Cancellation observed.
    Cancel,
}

impl ClientState {
    /// Returns true while a connection is being set up or used.
    pub fn is_active(&self) -> bool {
        matches!(self, ClientState::Connecting | ClientState::Streaming)
    }

    /// Returns true once the client has stopped for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientState::Stopped)
    }

    /// Returns the state reached by applying `event`, or `None` if the
    /// transition is not allowed.
    pub fn next(self, event: ClientEvent) -> Option<ClientState> {
        use ClientEvent as E;
        use ClientState as S;

        match (self, event) {
            (S::Stopped, _) => None,
            (_, E::Cancel) => Some(S::Stopped),
            (S::Disconnected, E::Connect) => Some(S::Connecting),
            (S::Connecting, E::Subscribed) => Some(S::Streaming),
            (S::Connecting, E::ConnectFailed) => Some(S::Disconnected),
            (S::Streaming, E::Received) => Some(S::Streaming),
            (S::Streaming, E::StreamFailed) => Some(S::Closing),
            (S::Closing, E::PipelineRotated) => Some(S::Disconnected),
            _ => None,
        }
    }

    /// Like [`next`](Self::next) but reports a rejected transition as an error.
    pub fn apply(self, event: ClientEvent) -> SyncResult<ClientState> {
        self.next(event)
            .ok_or_else(|| SyncError::InvalidStateTransition {
                from: format!("{self:?}"),
                event: format!("{event:?}"),
            })
    }
}
