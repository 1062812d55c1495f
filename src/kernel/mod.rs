//! Kernel supervision: queues, launch contract, socket protocol and the
//! supervisor that owns one running kernel.

pub mod codec;
pub mod launcher;
pub mod protocol;
pub mod queues;
pub mod supervisor;

pub use launcher::{KernelArgs, KernelInit, KernelLauncher};
pub use queues::{KernelQueues, QueueManager};
pub use supervisor::{KernelManager, KernelManagerOptions, KernelStream};
