//! Contract implemented by anything that receives a session's operations.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::ops::KernelMessage;
use crate::models::ConsumerId;

/// Connection state reported by consumers and sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Attached and accepting operations.
    Open,
    /// Gone for good.
    Closed,
    /// Session without a main consumer; kernel still alive.
    Orphaned,
}

/// Role of a consumer within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerRole {
    /// The single editing consumer.
    Main,
    /// Read-only observer.
    Kiosk,
}

impl ConsumerRole {
    /// `true` for [`ConsumerRole::Main`].
    #[must_use]
    pub fn is_main(self) -> bool {
        matches!(self, Self::Main)
    }
}

/// Callback invoked with every kernel message, in kernel order.
///
/// Runs on the distributor task while it holds its subscriber lock: it must
/// not block and must not subscribe or unsubscribe.
pub type ConsumerCallback = Arc<dyn Fn(&KernelMessage) + Send + Sync>;

/// A sink attached to a session, typically one transport connection.
pub trait SessionConsumer: Send + Sync {
    /// Stable identifier of this consumer.
    fn consumer_id(&self) -> ConsumerId;

    /// Called once on attach; returns the kernel-message callback.
    fn on_start(&self) -> ConsumerCallback;

    /// Called once on detach.
    fn on_stop(&self);

    /// Deliver a server-originated operation.
    fn write_operation(&self, message: &KernelMessage);

    /// Current connection state.
    fn connection_state(&self) -> ConnectionState;
}

impl fmt::Debug for dyn SessionConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConsumer")
            .field("consumer_id", &self.consumer_id())
            .field("state", &self.connection_state())
            .finish()
    }
}
