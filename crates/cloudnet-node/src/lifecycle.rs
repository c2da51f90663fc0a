// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service lifecycle state machine.
//!
//! ```text
//!          ┌──────────┐   start    ┌─────────┐
//!     ┌───►│ PREPARED │───────────►│ RUNNING │
//!     │    └────┬─────┘            └────┬────┘
//!     │         │ stop                  │ stop
//!     │prepare  ▼                       ▼
//!     │    ┌─────────┐◄─────────────────┘
//!     └────│ STOPPED │
//!          └────┬────┘
//!               │ delete (from any state but DELETED)
//!               ▼
//!          ┌─────────┐
//!          │ DELETED │  terminal
//!          └─────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of a managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceLifeCycle {
    Prepared,
    Running,
    Stopped,
    Deleted,
}

impl ServiceLifeCycle {
    pub const ALL: [ServiceLifeCycle; 4] = [
        ServiceLifeCycle::Prepared,
        ServiceLifeCycle::Running,
        ServiceLifeCycle::Stopped,
        ServiceLifeCycle::Deleted,
    ];

    /// States reachable in one step from `self`.
    pub const fn allowed_targets(self) -> &'static [ServiceLifeCycle] {
        use ServiceLifeCycle::*;
        match self {
            Prepared => &[Running, Stopped, Deleted],
            Running => &[Stopped, Deleted],
            Stopped => &[Prepared, Deleted],
            Deleted => &[],
        }
    }

    pub fn can_change_to(self, target: ServiceLifeCycle) -> bool {
        self.allowed_targets().contains(&target)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_targets().is_empty()
    }

    /// Like [`can_change_to`](Self::can_change_to), as a `Result` for `?` callers.
    pub fn check_transition(self, target: ServiceLifeCycle) -> Result<(), LifecycleError> {
        if self.can_change_to(target) {
            Ok(())
        } else {
            Err(LifecycleError::IllegalTransition {
                from: self,
                to: target,
            })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceLifeCycle::Prepared => "PREPARED",
            ServiceLifeCycle::Running => "RUNNING",
            ServiceLifeCycle::Stopped => "STOPPED",
            ServiceLifeCycle::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for ServiceLifeCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle change that did not happen.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// The target is not reachable from the current state.
    #[error("illegal lifecycle transition {from} -> {to}")]
    IllegalTransition {
        from: ServiceLifeCycle,
        to: ServiceLifeCycle,
    },

    /// An event listener vetoed the change.
    #[error("lifecycle change {from} -> {to} was cancelled")]
    Cancelled {
        from: ServiceLifeCycle,
        to: ServiceLifeCycle,
    },
}
