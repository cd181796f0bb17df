//! Connection lifecycle state machine
//!
//! `Disconnected → Connecting → Connected → Interrupted → Connected → … → Disconnected`

use super::ConnectionEvent;

/// State of a broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Interrupted,
}

/// Tracks the connection state and decides which transitions observers see
#[derive(Debug)]
pub struct ConnectionLifecycle {
    state: ConnectionState,
    interruptions: u32,
}

impl Default for ConnectionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionLifecycle {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            interruptions: 0,
        }
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of interruptions seen so far
    pub fn interruptions(&self) -> u32 {
        self.interruptions
    }

    /// A connect attempt started; only valid from `Disconnected`
    pub fn on_connecting(&mut self) -> bool {
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::Connecting;
            true
        } else {
            false
        }
    }

    /// The broker accepted the connection (CONNACK)
    pub fn on_connack(&mut self, session_present: bool) -> Option<ConnectionEvent> {
        let event = match self.state {
            ConnectionState::Connecting => ConnectionEvent::Connected { session_present },
            ConnectionState::Interrupted => ConnectionEvent::Resumed { session_present },
            // Duplicate CONNACK or one racing a local disconnect
            ConnectionState::Connected | ConnectionState::Disconnected => return None,
        };

        self.state = ConnectionState::Connected;
        Some(event)
    }

    /// The transport failed
    ///
    /// Only the first failure of a live connection is reported; failed
    /// reconnect attempts stay silent until the next CONNACK.
    pub fn on_error(&mut self, reason: impl Into<String>) -> Option<ConnectionEvent> {
        match self.state {
            ConnectionState::Connected => {
                self.state = ConnectionState::Interrupted;
                self.interruptions += 1;
                Some(ConnectionEvent::Interrupted {
                    reason: reason.into(),
                })
            }
            ConnectionState::Connecting
            | ConnectionState::Interrupted
            | ConnectionState::Disconnected => None,
        }
    }

    /// The connection was closed on request
    pub fn on_disconnect(&mut self) -> Option<ConnectionEvent> {
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        self.state = ConnectionState::Disconnected;
        Some(ConnectionEvent::Disconnected)
    }
}
