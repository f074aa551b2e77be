//! Per-connection lifecycle of the SFTP server.

use sftpfs_platform::{ErrorKind, FsError, FsResult};
use std::fmt;
use tracing::{debug, info};

/// Server connection state.
///
/// ```text
/// New -> Handshaking -> Authenticated -> ChannelOpen <-> SftpActive
///   \__________\______________\______________\______________\--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection accepted, nothing exchanged yet.
    New,
    /// SSH key exchange and authentication in progress.
    Handshaking,
    /// The client has authenticated.
    Authenticated,
    /// A session channel is open.
    ChannelOpen,
    /// The sftp subsystem is running on a channel.
    SftpActive,
    /// Terminal.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::New => "new",
            SessionState::Handshaking => "handshaking",
            SessionState::Authenticated => "authenticated",
            SessionState::ChannelOpen => "channel-open",
            SessionState::SftpActive => "sftp-active",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Validated state holder for one connection.
#[derive(Debug)]
pub struct SessionMachine {
    peer: String,
    state: SessionState,
}

impl SessionMachine {
    /// Starts in [`SessionState::New`].
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            state: SessionState::New,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Moves to `next` if the transition is allowed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for transitions outside the lifecycle, such as
    /// `New -> SftpActive` or anything out of `Closed`.
    pub fn transition(&mut self, next: SessionState) -> FsResult<()> {
        use SessionState::*;

        let valid = match (self.state, next) {
            (New, Handshaking) => true,
            (Handshaking, Authenticated) => true,
            (Authenticated, ChannelOpen) => true,
            (ChannelOpen, SftpActive) => true,
            // Another session channel on the same connection
            (SftpActive, ChannelOpen) => true,
            (Closed, _) => false,
            (_, Closed) => true,
            (s1, s2) if s1 == s2 => true,
            _ => false,
        };

        if !valid {
            return Err(FsError::new(
                ErrorKind::InvalidInput,
                format!("invalid session transition: {} -> {}", self.state, next),
            ));
        }

        if self.state != next {
            debug!(peer = %self.peer, from = %self.state, to = %next, "session state");
        }
        self.state = next;
        Ok(())
    }

    /// Moves to [`SessionState::Closed`], logging `reason`. Idempotent.
    pub fn close(&mut self, reason: &str) {
        if self.state != SessionState::Closed {
            info!(peer = %self.peer, from = %self.state, reason, "session closed");
            self.state = SessionState::Closed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut machine = SessionMachine::new("127.0.0.1:5000");
        assert_eq!(machine.state(), SessionState::New);

        for next in [
            SessionState::Handshaking,
            SessionState::Authenticated,
            SessionState::ChannelOpen,
            SessionState::SftpActive,
            SessionState::ChannelOpen,
            SessionState::SftpActive,
        ] {
            machine.transition(next).unwrap();
        }
        machine.close("eof");
        assert!(machine.is_closed());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut machine = SessionMachine::new("peer");
        let err = machine.transition(SessionState::SftpActive).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.to_string().contains("new -> sftp-active"));

        machine.transition(SessionState::Handshaking).unwrap();
        assert!(machine.transition(SessionState::ChannelOpen).is_err());
        assert_eq!(machine.state(), SessionState::Handshaking);
    }

    #[test]
    fn test_failure_goes_straight_to_closed() {
        let mut machine = SessionMachine::new("peer");
        machine.transition(SessionState::Handshaking).unwrap();
        machine.transition(SessionState::Closed).unwrap();
        assert!(machine.transition(SessionState::Authenticated).is_err());

        // Closing again is a no-op.
        machine.close("again");
        machine.transition(SessionState::Closed).unwrap_err();
    }
}
