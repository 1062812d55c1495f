//! Sessions: a kernel, the consumers attached to it and their shared view.

pub mod consumer;
pub mod distributor;
pub mod manager;
pub mod room;
pub mod serialize;
#[allow(clippy::module_inception)]
pub mod session;
pub mod view;
pub mod watcher;

pub use consumer::{ConnectionState, ConsumerCallback, ConsumerRole, SessionConsumer};
pub use distributor::{Disposable, MessageDistributor, MessageSource};
pub use manager::{SessionManager, SessionManagerOptions};
pub use room::Room;
pub use session::{Session, SessionOptions};
pub use view::SessionView;
