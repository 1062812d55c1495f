//! Channels connecting a session to its kernel.
//!
//! The session side keeps the senders; the kernel side (a thread kernel, or
//! the pump task writing to a process kernel's socket) takes the receivers
//! exactly once. Closing the queues drops the senders, which every receiver
//! observes as end-of-stream.

use std::sync::Mutex;

use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::ops::KernelMessage;
use crate::models::requests::{CodeCompletionRequest, ControlRequest, SetUiElementValueRequest};
use crate::{AppError, Result};

/// Capacity of the stdin queue; one pending answer at a time.
pub const INPUT_QUEUE_CAPACITY: usize = 1;

/// Kernel-side endpoints of a queue set.
#[derive(Debug)]
pub struct KernelQueues {
    /// Control requests, ending with `Stop`.
    pub control: UnboundedReceiver<ControlRequest>,
    /// UI element values, mirrored from the control queue for batching.
    pub set_ui_element: UnboundedReceiver<SetUiElementValueRequest>,
    /// Code completion requests.
    pub completion: UnboundedReceiver<CodeCompletionRequest>,
    /// Answers to stdin prompts.
    pub input: Receiver<String>,
    /// Interrupt requests, on platforms without `SIGINT`.
    pub interrupt: Option<UnboundedReceiver<()>>,
    /// Outbound messages, for thread kernels.
    pub stream: Option<UnboundedSender<KernelMessage>>,
}

#[derive(Debug, Clone)]
struct Senders {
    control: UnboundedSender<ControlRequest>,
    set_ui_element: UnboundedSender<SetUiElementValueRequest>,
    completion: UnboundedSender<CodeCompletionRequest>,
    input: Sender<String>,
    interrupt: Option<UnboundedSender<()>>,
}

/// Session-side owner of the six kernel queues.
#[derive(Debug)]
pub struct QueueManager {
    senders: Mutex<Option<Senders>>,
    kernel_side: Mutex<Option<KernelQueues>>,
    stream: Mutex<Option<UnboundedReceiver<KernelMessage>>>,
    closing: CancellationToken,
}

impl QueueManager {
    /// Build a queue set.
    ///
    /// `use_process` selects the process-kernel layout: no stream queue (the
    /// kernel writes to its socket instead), and an interrupt queue on
    /// platforms where the kernel cannot be signalled.
    #[must_use]
    pub fn new(use_process: bool) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (set_ui_tx, set_ui_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);

        let (interrupt_tx, interrupt_rx) = if use_process && !cfg!(unix) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let (stream_tx, stream_rx) = if use_process {
            (None, None)
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        };

        Self {
            senders: Mutex::new(Some(Senders {
                control: control_tx,
                set_ui_element: set_ui_tx,
                completion: completion_tx,
                input: input_tx,
                interrupt: interrupt_tx,
            })),
            kernel_side: Mutex::new(Some(KernelQueues {
                control: control_rx,
                set_ui_element: set_ui_rx,
                completion: completion_rx,
                input: input_rx,
                interrupt: interrupt_rx,
                stream: stream_tx,
            })),
            stream: Mutex::new(stream_rx),
            closing: CancellationToken::new(),
        }
    }

    fn senders(&self) -> Result<Senders> {
        self.senders
            .lock()
            .map_err(|_| AppError::Kernel("queue lock poisoned".into()))?
            .clone()
            .ok_or_else(|| AppError::Kernel("kernel queues are closed".into()))
    }

    /// Enqueue a control request.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the queues are closed or the kernel
    /// side has gone away.
    pub fn put_control(&self, request: ControlRequest) -> Result<()> {
        self.senders()?
            .control
            .send(request)
            .map_err(|_| AppError::Kernel("control queue disconnected".into()))
    }

    /// Enqueue UI element values on the dedicated batching queue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the queue is closed.
    pub fn put_set_ui_element(&self, request: SetUiElementValueRequest) -> Result<()> {
        self.senders()?
            .set_ui_element
            .send(request)
            .map_err(|_| AppError::Kernel("set-ui-element queue disconnected".into()))
    }

    /// Enqueue a completion request.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the queue is closed.
    pub fn put_completion(&self, request: CodeCompletionRequest) -> Result<()> {
        self.senders()?
            .completion
            .send(request)
            .map_err(|_| AppError::Kernel("completion queue disconnected".into()))
    }

    /// Deliver a stdin answer, waiting while a previous answer is unread.
    ///
    /// Only the input sender is held while waiting, and the wait ends when
    /// the queues are closed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the queue is closed, before or while
    /// waiting.
    pub async fn put_input(&self, text: String) -> Result<()> {
        let input = self
            .senders
            .lock()
            .map_err(|_| AppError::Kernel("queue lock poisoned".into()))?
            .as_ref()
            .map(|senders| senders.input.clone())
            .ok_or_else(|| AppError::Kernel("kernel queues are closed".into()))?;
        tokio::select! {
            sent = input.send(text) => {
                sent.map_err(|_| AppError::Kernel("input queue disconnected".into()))
            }
            () = self.closing.cancelled() => {
                Err(AppError::Kernel("kernel queues closed while waiting for input".into()))
            }
        }
    }

    /// Enqueue an interrupt request. Returns `false` when this queue set has
    /// no interrupt queue.
    #[must_use]
    pub fn put_interrupt(&self) -> bool {
        match self.senders() {
            Ok(Senders {
                interrupt: Some(tx),
                ..
            }) => tx.send(()).is_ok(),
            _ => false,
        }
    }

    /// Whether an interrupt queue exists.
    #[must_use]
    pub fn has_interrupt_queue(&self) -> bool {
        matches!(
            self.senders(),
            Ok(Senders {
                interrupt: Some(_),
                ..
            })
        )
    }

    /// Hand the kernel-side endpoints to the kernel. Succeeds once.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the endpoints were already taken.
    pub fn take_kernel_queues(&self) -> Result<KernelQueues> {
        self.kernel_side
            .lock()
            .map_err(|_| AppError::Kernel("queue lock poisoned".into()))?
            .take()
            .ok_or_else(|| AppError::Kernel("kernel queues already taken".into()))
    }

    /// Take the reading end of the stream queue (thread kernels only).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if there is no stream queue or it was
    /// already taken.
    pub fn take_stream(&self) -> Result<UnboundedReceiver<KernelMessage>> {
        self.stream
            .lock()
            .map_err(|_| AppError::Kernel("queue lock poisoned".into()))?
            .take()
            .ok_or_else(|| AppError::Kernel("stream queue unavailable".into()))
    }

    /// Release the session-side endpoints without waiting for the kernel to
    /// drain them. Idempotent.
    pub fn close_queues(&self) {
        self.closing.cancel();
        if let Ok(mut guard) = self.senders.lock() {
            if guard.take().is_some() {
                debug!("kernel queues closed");
            }
        }
        if let Ok(mut guard) = self.kernel_side.lock() {
            guard.take();
        }
    }

    /// Whether [`QueueManager::close_queues`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.senders.lock().map_or(true, |guard| guard.is_none())
    }
}
