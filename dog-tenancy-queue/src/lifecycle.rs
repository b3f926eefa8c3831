use std::fmt;

use chrono::{DateTime, Utc};
use dog_tenancy::{TenantId, UnitError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::MessageId;
use crate::error::HandlerFailure;

/// Where a unit of work is in its lifecycle.
///
/// `Received → Resolving → Validated → ContextInstalled → Executing → TornDown → Completed`,
/// or `Resolving → Rejected` on a terminal resolution failure, or
/// `Deferred` when the unit could not start for a transient reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsumeState {
    Received,
    Resolving,
    Validated,
    ContextInstalled,
    Executing,
    TornDown,
    Completed,
    Rejected,
    Deferred,
}

impl ConsumeState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Resolving => "resolving",
            Self::Validated => "validated",
            Self::ContextInstalled => "context_installed",
            Self::Executing => "executing",
            Self::TornDown => "torn_down",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Deferred => "deferred",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Deferred)
    }
}

impl fmt::Display for ConsumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One state transition, published on the interceptor's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeEvent {
    pub message_id: MessageId,
    pub state: ConsumeState,
    pub tenant_id: Option<TenantId>,
    pub unit_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}

impl ConsumeEvent {
    pub fn event_name(&self) -> &'static str {
        self.state.name()
    }
}

/// What the broker should do with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Disposition {
    Ack,
    Reject,
    Requeue,
}

/// Result of consuming one message. Teardown has already happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The handler ran and succeeded.
    Completed { tenant_id: TenantId, unit_id: Uuid },

    /// The handler ran and did not succeed.
    HandlerFailed {
        tenant_id: TenantId,
        unit_id: Uuid,
        failure: HandlerFailure,
    },

    /// Terminal: no tenant, inactive tenant, ambiguous key, or a contract
    /// violation. The handler was never invoked.
    Rejected(UnitError),

    /// Transient: directory or store unavailable. The handler was never invoked.
    Deferred(UnitError),

    /// The unit was cancelled before its handler started.
    Cancelled,
}

impl ConsumeOutcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Completed { .. } => Disposition::Ack,
            Self::HandlerFailed { failure, .. } if failure.is_retryable() => Disposition::Requeue,
            Self::HandlerFailed { .. } | Self::Rejected(_) => Disposition::Reject,
            Self::Deferred(_) | Self::Cancelled => Disposition::Requeue,
        }
    }

    /// Terminal lifecycle state the unit ended in.
    pub fn state(&self) -> ConsumeState {
        match self {
            Self::Completed { .. } | Self::HandlerFailed { .. } => ConsumeState::Completed,
            Self::Rejected(_) => ConsumeState::Rejected,
            Self::Deferred(_) | Self::Cancelled => ConsumeState::Deferred,
        }
    }

    /// Whether the handler was invoked at all.
    pub fn handler_ran(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::HandlerFailed { .. })
    }

    pub fn tenant_id(&self) -> Option<&TenantId> {
        match self {
            Self::Completed { tenant_id, .. } | Self::HandlerFailed { tenant_id, .. } => {
                Some(tenant_id)
            }
            _ => None,
        }
    }
}
