//! Reservation batch lifecycle as observed by the client.

use serde::{Deserialize, Serialize};

/// The state of a cart's reservation batch.
///
/// State transitions:
/// ```text
/// None ──► Reserving ──► Held ──┬──► Committed
///   ▲          │                ├──► Released
///   └──────────┘                └──► Expired
/// ```
///
/// `Held → Committed` happens only through the payment-completion webhook.
/// A terminal batch may be followed by a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// No reservation has been requested.
    #[default]
    None,

    /// A reserve call is in flight.
    Reserving,

    /// Every item in the cart is held by this client.
    Held,

    /// Payment completed; the items are sold (terminal state).
    Committed,

    /// The client gave the items back (terminal state).
    Released,

    /// The hold lapsed before payment completed (terminal state).
    Expired,
}

impl BatchState {
    /// Returns true if a new reserve call may start.
    pub fn can_reserve(&self) -> bool {
        matches!(
            self,
            BatchState::None | BatchState::Committed | BatchState::Released | BatchState::Expired
        )
    }

    /// Returns true if the batch can leave the held state.
    pub fn is_held(&self) -> bool {
        matches!(self, BatchState::Held)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Committed | BatchState::Released | BatchState::Expired
        )
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::None => "none",
            BatchState::Reserving => "reserving",
            BatchState::Held => "held",
            BatchState::Committed => "committed",
            BatchState::Released => "released",
            BatchState::Expired => "expired",
        }
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
