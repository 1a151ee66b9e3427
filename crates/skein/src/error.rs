// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The halt taxonomy: every way a suspended operation can come back
//! without a value.

use thiserror::Error;

/// Returned by every suspending operation when the endpoint can no
/// longer complete it.
///
/// `Closed` and `Abandoned` distinguish *which* side went away:
/// `Closed` means the endpoint you are holding was closed, `Abandoned`
/// means the counterparty's end was. `Timeout` and `Stop` are injected
/// into the suspension point from outside (a deadline, or hub
/// shutdown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Halt {
    /// This endpoint was closed on its own side.
    #[error("endpoint closed")]
    Closed,
    /// The counterparty's end was closed or dropped.
    #[error("peer endpoint abandoned")]
    Abandoned,
    /// A `recv_timeout` deadline expired before a value arrived.
    #[error("operation timed out")]
    Timeout,
    /// The hub was stopped while the operation was suspended.
    #[error("hub stopped")]
    Stop,
}

impl Halt {
    /// True for the two closure-shaped variants (either side going
    /// away), false for the injected signals.
    pub fn is_closure(self) -> bool {
        matches!(self, Halt::Closed | Halt::Abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_variants() {
        assert!(Halt::Closed.is_closure());
        assert!(Halt::Abandoned.is_closure());
        assert!(!Halt::Timeout.is_closure());
        assert!(!Halt::Stop.is_closure());
    }

    #[test]
    fn display_messages() {
        assert_eq!(Halt::Timeout.to_string(), "operation timed out");
        assert_eq!(Halt::Stop.to_string(), "hub stopped");
    }
}
