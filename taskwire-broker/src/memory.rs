//! Process-local broker used by tests and `memory://` URIs.
//!
//! Unacked messages come back in two ways: when the client holding them
//! disconnects (AMQP style) and, if configured, when their visibility timeout
//! lapses (queue-service style).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::listen::{Listen, Polling, Receiver};
use crate::{BrokerClient, BrokerError, DeliveryToken, Headers, Message, RawDelivery};

#[derive(Debug, Clone)]
struct Stored {
    body: Vec<u8>,
    headers: Headers,
}

#[derive(Debug)]
struct Lease {
    queue: String,
    session: Uuid,
    stored: Stored,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Stored>>,
    leases: HashMap<u64, Lease>,
    next_lease: u64,
}

impl BrokerState {
    fn lease(&mut self, queue: &str, session: Uuid, stored: Stored, timeout: Option<Duration>) -> u64 {
        self.next_lease += 1;
        let id = self.next_lease;
        self.leases.insert(
            id,
            Lease {
                queue: queue.to_string(),
                session,
                stored,
                expires_at: timeout.map(|timeout| Instant::now() + timeout),
            },
        );
        id
    }

    /// Put the given leases back at the front of their queues, oldest first.
    fn release(&mut self, mut ids: Vec<u64>) -> usize {
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let mut released = 0;
        for id in ids {
            if let Some(lease) = self.leases.remove(&id) {
                self.queues
                    .entry(lease.queue)
                    .or_default()
                    .push_front(lease.stored);
                released += 1;
            }
        }
        released
    }

    fn release_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<u64> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at.is_some_and(|at| at <= now))
            .map(|(id, _)| *id)
            .collect();
        self.release(expired)
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.leases.values().filter_map(|lease| lease.expires_at).min()
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    available: Condvar,
    visibility_timeout: Option<Duration>,
}

/// Shared queue storage. Cloning yields another handle to the same queues.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Broker whose unacked messages also reappear after `timeout`.
    pub fn with_visibility_timeout(timeout: Duration) -> Self {
        Self::build(Some(timeout))
    }

    fn build(visibility_timeout: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                available: Condvar::new(),
                visibility_timeout,
            }),
        }
    }

    /// A new, disconnected client of this broker.
    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            broker: self.clone(),
            session: Mutex::new(None),
        }
    }

    /// Number of messages waiting in `queue`, not counting leased ones.
    pub fn depth(&self, queue: &str) -> usize {
        let mut state = self.shared.state.lock();
        state.release_expired(Instant::now());
        state.queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Number of messages of `queue` received but not yet acked or requeued.
    pub fn in_flight(&self, queue: &str) -> usize {
        let mut state = self.shared.state.lock();
        state.release_expired(Instant::now());
        state.leases.values().filter(|lease| lease.queue == queue).count()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.shared.state.lock().queues.contains_key(queue)
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryClient {
    broker: MemoryBroker,
    session: Mutex<Option<Uuid>>,
}

impl MemoryClient {
    fn current_session(&self) -> Result<Uuid, BrokerError> {
        (*self.session.lock()).ok_or_else(|| BrokerError::not_connected("in-memory"))
    }

    fn take_lease(&self, message: &Message) -> Result<Lease, BrokerError> {
        let session = self.current_session()?;
        let DeliveryToken::Lease { session: owner, id } = message.require_token()? else {
            return Err(BrokerError::Delivery(
                "delivery token was not issued by the in-memory broker".into(),
            ));
        };
        if *owner != session {
            return Err(BrokerError::Delivery(format!(
                "lease {id} belongs to a closed session"
            )));
        }
        let mut state = self.broker.shared.state.lock();
        state
            .leases
            .remove(id)
            .ok_or_else(|| BrokerError::Delivery(format!("lease {id} is unknown or has expired")))
    }
}

impl Receiver for MemoryClient {
    fn polling(&self) -> Polling {
        Polling::PerQueue { max_wait: None }
    }

    fn receive(
        &self,
        queues: &[String],
        wait: Option<Duration>,
    ) -> Result<Vec<RawDelivery>, BrokerError> {
        let session = self.current_session()?;
        let shared = &self.broker.shared;
        let deadline = wait.and_then(|wait| Instant::now().checked_add(wait));
        let mut state = shared.state.lock();

        loop {
            state.release_expired(Instant::now());

            let mut received = Vec::new();
            for queue in queues {
                let next = state.queues.entry(queue.clone()).or_default().pop_front();
                if let Some(stored) = next {
                    let id = state.lease(queue, session, stored.clone(), shared.visibility_timeout);
                    received.push(RawDelivery {
                        queue: queue.clone(),
                        body: stored.body,
                        headers: stored.headers,
                        token: DeliveryToken::Lease { session, id },
                    });
                }
            }
            if !received.is_empty() {
                return Ok(received);
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| deadline <= now) {
                return Ok(Vec::new());
            }

            let wake = match (deadline, state.next_expiry()) {
                (Some(deadline), Some(expiry)) => Some(deadline.min(expiry)),
                (deadline, expiry) => deadline.or(expiry),
            };
            match wake {
                Some(wake) => {
                    shared.available.wait_until(&mut state, wake);
                }
                None => shared.available.wait(&mut state),
            }
        }
    }
}

impl BrokerClient for MemoryClient {
    fn connect(&self) -> Result<(), BrokerError> {
        let mut session = self.session.lock();
        if session.is_none() {
            let id = Uuid::new_v4();
            debug!("Connected to in-memory broker (session {id})");
            *session = Some(id);
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BrokerError> {
        let Some(id) = self.session.lock().take() else {
            return Ok(());
        };
        let mut state = self.broker.shared.state.lock();
        let owned: Vec<u64> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.session == id)
            .map(|(lease_id, _)| *lease_id)
            .collect();
        let released = state.release(owned);
        drop(state);
        if released > 0 {
            self.broker.shared.available.notify_all();
        }
        debug!("Disconnected from in-memory broker (session {id}, {released} unacked returned)");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }

    fn create_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.current_session()?;
        self.broker
            .shared
            .state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default();
        debug!("Created in-memory queue {queue}");
        Ok(())
    }

    fn destroy_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.current_session()?;
        let mut state = self.broker.shared.state.lock();
        state.queues.remove(queue);
        state.leases.retain(|_, lease| lease.queue != queue);
        debug!("Destroyed in-memory queue {queue}");
        Ok(())
    }

    fn publish(&self, message: &Message) -> Result<(), BrokerError> {
        self.current_session()?;
        let body = message.encode_body()?;
        self.broker
            .shared
            .state
            .lock()
            .queues
            .entry(message.queue.clone())
            .or_default()
            .push_back(Stored {
                body,
                headers: message.headers.clone(),
            });
        self.broker.shared.available.notify_all();
        debug!("Published message to in-memory queue {}", message.queue);
        Ok(())
    }

    fn listen(
        &self,
        queues: &[String],
        time_limit: Option<Duration>,
    ) -> Result<Listen<'_>, BrokerError> {
        self.current_session()?;
        Listen::start(self, queues, time_limit)
    }

    fn ack(&self, message: &Message) -> Result<(), BrokerError> {
        self.take_lease(message)?;
        Ok(())
    }

    fn requeue(&self, message: &Message) -> Result<(), BrokerError> {
        let lease = self.take_lease(message)?;
        self.broker
            .shared
            .state
            .lock()
            .queues
            .entry(lease.queue)
            .or_default()
            .push_back(lease.stored);
        self.broker.shared.available.notify_all();
        Ok(())
    }
}
