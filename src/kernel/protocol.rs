//! Envelopes written to a process kernel's socket.
//!
//! Each line is `{"queue": "<name>", "payload": ...}`. The first line is
//! always `launch`; the rest mirror the queue the payload was taken from.

use serde::{Deserialize, Serialize};

use crate::kernel::launcher::KernelInit;
use crate::models::requests::{CodeCompletionRequest, ControlRequest, SetUiElementValueRequest};
use crate::{AppError, Result};

/// Server-to-kernel line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "queue", content = "payload", rename_all = "kebab-case")]
pub enum KernelInbound {
    /// Launch payload; first line only.
    Launch(Box<KernelInit>),
    /// Control queue item.
    Control(ControlRequest),
    /// Set-UI-element queue item.
    SetUiElement(SetUiElementValueRequest),
    /// Completion queue item.
    Completion(CodeCompletionRequest),
    /// Stdin answer.
    Input(String),
    /// Interrupt request.
    Interrupt,
}

impl KernelInbound {
    /// Serialize as one NDJSON line, without the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` if the payload cannot be serialized.
    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|err| AppError::Ipc(format!("encode envelope: {err}")))
    }

    /// Whether this line tells the kernel to shut down.
    #[must_use]
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Control(ControlRequest::Stop))
    }
}
