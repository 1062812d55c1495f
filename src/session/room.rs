//! Consumers attached to one session.
//!
//! A room holds at most one main consumer and any number of kiosk
//! consumers. Each consumer is registered with the [`Disposable`] returned
//! by its distributor subscription; removing the consumer stops it and
//! runs that disposable exactly once.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::models::ops::KernelMessage;
use crate::models::ConsumerId;
use crate::session::consumer::{ConnectionState, ConsumerRole, SessionConsumer};
use crate::session::distributor::Disposable;
use crate::{AppError, Result};

struct Entry {
    id: ConsumerId,
    consumer: Arc<dyn SessionConsumer>,
    disposable: Disposable,
    role: ConsumerRole,
}

#[derive(Default)]
struct RoomInner {
    entries: Vec<Entry>,
    main: Option<ConsumerId>,
}

/// Broadcast group of a session.
#[derive(Default)]
pub struct Room {
    inner: Mutex<RoomInner>,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Room")
            .field("size", &inner.entries.len())
            .field("main", &inner.main)
            .finish()
    }
}

impl Room {
    /// An empty room.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RoomInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a consumer.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Consumer` when `role` is main and a main consumer
    /// already exists, or when `consumer_id` is already registered. The
    /// room is left unchanged and `disposable` is run.
    pub fn add_consumer(
        &self,
        consumer: Arc<dyn SessionConsumer>,
        disposable: Disposable,
        consumer_id: ConsumerId,
        role: ConsumerRole,
    ) -> Result<()> {
        let mut inner = self.lock();

        let rejection = if role.is_main() && inner.main.is_some() {
            Some(format!(
                "cannot add main consumer {consumer_id}: room already has a main consumer"
            ))
        } else if inner.entries.iter().any(|entry| entry.id == consumer_id) {
            Some(format!("consumer {consumer_id} is already in the room"))
        } else {
            None
        };

        if let Some(message) = rejection {
            drop(inner);
            disposable.dispose();
            return Err(AppError::Consumer(message));
        }

        if role.is_main() {
            inner.main = Some(consumer_id.clone());
        }
        debug!(consumer_id = %consumer_id, ?role, "consumer joined room");
        inner.entries.push(Entry {
            id: consumer_id,
            consumer,
            disposable,
            role,
        });
        Ok(())
    }

    /// Detach a consumer: stop it, then dispose its subscription.
    ///
    /// Returns `false` when the consumer was not in the room.
    pub fn remove_consumer(&self, consumer_id: &str) -> bool {
        let entry = {
            let mut inner = self.lock();
            let Some(index) = inner.entries.iter().position(|entry| entry.id == consumer_id)
            else {
                return false;
            };
            if inner.main.as_deref() == Some(consumer_id) {
                inner.main = None;
            }
            inner.entries.remove(index)
        };

        debug!(consumer_id, role = ?entry.role, "consumer left room");
        teardown(entry);
        true
    }

    /// Deliver `message` to every open consumer except `except`.
    ///
    /// Returns how many consumers received it.
    pub fn broadcast(&self, message: &KernelMessage, except: Option<&str>) -> usize {
        let targets: Vec<Arc<dyn SessionConsumer>> = {
            let inner = self.lock();
            inner
                .entries
                .iter()
                .filter(|entry| except != Some(entry.id.as_str()))
                .map(|entry| Arc::clone(&entry.consumer))
                .collect()
        };

        let mut delivered = 0;
        for consumer in targets {
            if consumer.connection_state() == ConnectionState::Open {
                consumer.write_operation(message);
                delivered += 1;
            }
        }
        delivered
    }

    /// Stop and dispose every consumer.
    pub fn close(&self) {
        let entries = {
            let mut inner = self.lock();
            inner.main = None;
            std::mem::take(&mut inner.entries)
        };
        for entry in entries {
            teardown(entry);
        }
    }

    /// Number of attached consumers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    /// The main consumer, if attached.
    #[must_use]
    pub fn main_consumer(&self) -> Option<Arc<dyn SessionConsumer>> {
        let inner = self.lock();
        let main = inner.main.as_deref()?;
        inner
            .entries
            .iter()
            .find(|entry| entry.id == main)
            .map(|entry| Arc::clone(&entry.consumer))
    }

    /// Id of the main consumer, if attached.
    #[must_use]
    pub fn main_consumer_id(&self) -> Option<ConsumerId> {
        self.lock().main.clone()
    }

    /// Look a consumer up by id.
    #[must_use]
    pub fn get_consumer(&self, consumer_id: &str) -> Option<Arc<dyn SessionConsumer>> {
        self.lock()
            .entries
            .iter()
            .find(|entry| entry.id == consumer_id)
            .map(|entry| Arc::clone(&entry.consumer))
    }

    /// Ids of every attached consumer, in join order.
    #[must_use]
    pub fn consumer_ids(&self) -> Vec<ConsumerId> {
        self.lock().entries.iter().map(|entry| entry.id.clone()).collect()
    }
}

fn teardown(entry: Entry) {
    entry.consumer.on_stop();
    entry.disposable.dispose();
}
