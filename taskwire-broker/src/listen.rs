//! Multi-queue, deadline-bounded listening shared by every backend.
//!
//! Backends only expose a blocking [`Receiver::receive`] primitive. The
//! [`Listen`] iterator turns that into one semantic: passes over the watched
//! queues under a single wall-clock budget computed when the call starts.
//!
//! * A pass visits every queue once (or, for multiplexed backends, all queues
//!   with a single wait). The wait for each slot is the remaining budget split
//!   across the slots still left in the pass, so a quiet queue never holds the
//!   whole budget while another one has messages.
//! * The first pass always runs, even with a zero budget, so `time_limit = 0`
//!   still checks every queue once without blocking. Later passes only start
//!   while budget remains.
//! * A pass that received nothing and returned almost immediately is followed
//!   by a short pause, bounded by the remaining budget.
//! * Bodies that are not valid JSON are logged and skipped.

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::{BrokerError, Message, RawDelivery};

/// Pass length used when no time limit is set and several slots share it.
pub const UNBOUNDED_PASS: Duration = Duration::from_secs(5);

/// Minimum length of a pass that received nothing.
pub const IDLE_PASS: Duration = Duration::from_millis(50);

/// How a backend is able to wait for messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polling {
    /// One blocking receive per queue, optionally capped by the backend
    /// (e.g. a long-poll limit).
    PerQueue { max_wait: Option<Duration> },
    /// One blocking wait covers every watched queue.
    Multiplexed,
}

/// Blocking receive primitive implemented by each backend adapter.
pub trait Receiver {
    fn polling(&self) -> Polling;

    /// Receive whatever is available on `queues`, blocking for at most `wait`.
    ///
    /// `None` blocks until something arrives, `Some(Duration::ZERO)` must not
    /// block at all. Returning an empty batch is not an error.
    fn receive(
        &self,
        queues: &[String],
        wait: Option<Duration>,
    ) -> Result<Vec<RawDelivery>, BrokerError>;
}

/// Budget available at the start of a pass or slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    Unbounded,
    Remaining(Duration),
}

/// Wall-clock budget fixed once per listen call.
#[derive(Debug, Clone)]
pub struct Deadline {
    end: Option<Instant>,
    first: bool,
}

impl Deadline {
    pub fn new(time_limit: Option<Duration>) -> Self {
        Self {
            end: time_limit.and_then(|limit| Instant::now().checked_add(limit)),
            first: true,
        }
    }

    /// Budget for the next pass, or `None` once the deadline has passed.
    ///
    /// The first call always yields a budget, clamped to zero when already
    /// expired.
    pub fn next_pass(&mut self) -> Option<Budget> {
        let first = std::mem::replace(&mut self.first, false);
        match self.remaining() {
            Budget::Remaining(remaining) if remaining.is_zero() && !first => None,
            budget => Some(budget),
        }
    }

    /// Whether [`next_pass`](Self::next_pass) has not been called yet.
    pub fn is_first_pass(&self) -> bool {
        self.first
    }

    pub fn remaining(&self) -> Budget {
        match self.end {
            None => Budget::Unbounded,
            Some(end) => Budget::Remaining(end.saturating_duration_since(Instant::now())),
        }
    }
}

/// Wait for one slot when `budget` is shared by `slots` slots.
pub fn slot_wait(budget: Budget, slots: usize, max_wait: Option<Duration>) -> Option<Duration> {
    let slots = slots.max(1) as u32;
    let wait = match budget {
        Budget::Remaining(remaining) => Some(remaining / slots),
        Budget::Unbounded if slots == 1 => None,
        Budget::Unbounded => Some(UNBOUNDED_PASS / slots),
    };
    match (wait, max_wait) {
        (Some(wait), Some(cap)) => Some(wait.min(cap)),
        (None, cap) => cap,
        (wait, None) => wait,
    }
}

#[derive(Debug)]
struct Pass {
    first: bool,
    cursor: usize,
    received: usize,
    started: Instant,
}

/// Lazy sequence of messages received across one or more queues.
///
/// Driven entirely by the consumer: nothing is fetched until `next` is called,
/// and a queue is only polled once the messages from the previous one have
/// been handed out. After a transport error the error is yielded once and the
/// sequence ends.
pub struct Listen<'a> {
    receiver: &'a dyn Receiver,
    queues: Vec<String>,
    polling: Polling,
    deadline: Deadline,
    pass: Option<Pass>,
    buffered: VecDeque<RawDelivery>,
    done: bool,
}

impl<'a> Listen<'a> {
    pub fn start<R: Receiver>(
        receiver: &'a R,
        queues: &[String],
        time_limit: Option<Duration>,
    ) -> Result<Self, BrokerError> {
        let mut unique: Vec<String> = Vec::with_capacity(queues.len());
        for queue in queues {
            if !unique.contains(queue) {
                unique.push(queue.clone());
            }
        }
        if unique.is_empty() {
            return Err(BrokerError::NoQueues);
        }

        debug!("Listening on {:?} with time limit {:?}", unique, time_limit);
        Ok(Self {
            receiver,
            polling: receiver.polling(),
            queues: unique,
            deadline: Deadline::new(time_limit),
            pass: None,
            buffered: VecDeque::new(),
            done: false,
        })
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    fn slots(&self) -> usize {
        match self.polling {
            Polling::PerQueue { .. } => self.queues.len(),
            Polling::Multiplexed => 1,
        }
    }

    fn max_wait(&self) -> Option<Duration> {
        match self.polling {
            Polling::PerQueue { max_wait } => max_wait,
            Polling::Multiplexed => None,
        }
    }

    /// Run the next slot of the current pass, starting a new pass if needed.
    /// Returns `false` once the budget is exhausted. Only the first pass keeps
    /// polling its remaining slots after the deadline.
    fn poll_next_slot(&mut self) -> Result<bool, BrokerError> {
        let slots = self.slots();
        if self.pass.as_ref().is_some_and(|pass| pass.cursor >= slots) {
            if let Some(pass) = self.pass.take() {
                self.rest_after(&pass);
            }
        }

        let first = match &self.pass {
            Some(pass) => pass.first,
            None => {
                let first = self.deadline.is_first_pass();
                if self.deadline.next_pass().is_none() {
                    debug!("Listen deadline reached for {:?}", self.queues);
                    return Ok(false);
                }
                first
            }
        };
        let budget = self.deadline.remaining();
        if !first && budget == Budget::Remaining(Duration::ZERO) {
            debug!("Listen deadline reached mid-pass for {:?}", self.queues);
            self.pass = None;
            return Ok(false);
        }
        if self.pass.is_none() {
            self.pass = Some(Pass {
                first,
                cursor: 0,
                received: 0,
                started: Instant::now(),
            });
        }

        let cursor = self.pass.as_ref().map_or(0, |pass| pass.cursor);
        // A bounded budget is shared by the slots still left in this pass.
        let sharing = match budget {
            Budget::Remaining(_) => slots - cursor,
            Budget::Unbounded => slots,
        };
        let wait = slot_wait(budget, sharing, self.max_wait());
        let batch = match self.polling {
            Polling::PerQueue { .. } => self
                .receiver
                .receive(std::slice::from_ref(&self.queues[cursor]), wait)?,
            Polling::Multiplexed => self.receiver.receive(&self.queues, wait)?,
        };

        if let Some(pass) = self.pass.as_mut() {
            pass.cursor += 1;
            pass.received += batch.len();
        }
        self.buffered.extend(batch);
        Ok(true)
    }

    fn rest_after(&self, pass: &Pass) {
        if pass.received > 0 {
            return;
        }
        let elapsed = pass.started.elapsed();
        if elapsed >= IDLE_PASS {
            return;
        }
        let pause = match self.deadline.remaining() {
            Budget::Unbounded => IDLE_PASS - elapsed,
            Budget::Remaining(remaining) => (IDLE_PASS - elapsed).min(remaining),
        };
        if !pause.is_zero() {
            thread::sleep(pause);
        }
    }
}

impl Iterator for Listen<'_> {
    type Item = Result<Message, BrokerError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            while let Some(raw) = self.buffered.pop_front() {
                let queue = raw.queue.clone();
                match raw.into_message() {
                    Ok(message) => return Some(Ok(message)),
                    Err(err) => error!("Dropping malformed message from queue {}: {}", queue, err),
                }
            }

            if self.done {
                return None;
            }

            match self.poll_next_slot() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeliveryToken, Headers};
    use parking_lot::Mutex;
    use rstest::rstest;
    use std::collections::HashMap;

    /// Receiver over fixed per-queue contents that records each call.
    struct Scripted {
        polling: Polling,
        queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
        calls: Mutex<Vec<(Vec<String>, Option<Duration>)>>,
        fail: bool,
        stall: Option<(usize, Duration)>,
    }

    impl Scripted {
        fn new(polling: Polling) -> Self {
            Self {
                polling,
                queues: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                fail: false,
                stall: None,
            }
        }

        fn push(&self, queue: &str, body: &[u8]) {
            self.queues
                .lock()
                .entry(queue.to_string())
                .or_default()
                .push_back(body.to_vec());
        }

        fn calls(&self) -> Vec<(Vec<String>, Option<Duration>)> {
            self.calls.lock().clone()
        }
    }

    impl Receiver for Scripted {
        fn polling(&self) -> Polling {
            self.polling
        }

        fn receive(
            &self,
            queues: &[String],
            wait: Option<Duration>,
        ) -> Result<Vec<RawDelivery>, BrokerError> {
            let call = {
                let mut calls = self.calls.lock();
                calls.push((queues.to_vec(), wait));
                calls.len() - 1
            };
            if let Some((_, pause)) = self.stall.filter(|(at, _)| *at == call) {
                thread::sleep(pause);
            }
            if self.fail {
                return Err(BrokerError::Transport("boom".into()));
            }
            let mut contents = self.queues.lock();
            let mut out = Vec::new();
            for queue in queues {
                if let Some(body) = contents.get_mut(queue).and_then(VecDeque::pop_front) {
                    out.push(RawDelivery {
                        queue: queue.clone(),
                        body,
                        headers: Headers::new(),
                        token: DeliveryToken::Tag { channel: 1, tag: 1 },
                    });
                }
            }
            Ok(out)
        }
    }

    fn queues(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn first_pass_runs_even_when_budget_is_zero() {
        let mut deadline = Deadline::new(Some(Duration::ZERO));
        assert_eq!(deadline.next_pass(), Some(Budget::Remaining(Duration::ZERO)));
        assert_eq!(deadline.next_pass(), None);
    }

    #[test]
    fn unbounded_deadline_never_expires() {
        let mut deadline = Deadline::new(None);
        for _ in 0..3 {
            assert_eq!(deadline.next_pass(), Some(Budget::Unbounded));
        }
    }

    #[rstest]
    #[case(Budget::Remaining(Duration::from_secs(10)), 1, None, Some(Duration::from_secs(10)))]
    #[case(Budget::Remaining(Duration::from_secs(10)), 2, None, Some(Duration::from_secs(5)))]
    #[case(Budget::Remaining(Duration::from_secs(60)), 1, Some(Duration::from_secs(20)), Some(Duration::from_secs(20)))]
    #[case(Budget::Remaining(Duration::ZERO), 3, None, Some(Duration::ZERO))]
    #[case(Budget::Unbounded, 1, None, None)]
    #[case(Budget::Unbounded, 1, Some(Duration::from_secs(20)), Some(Duration::from_secs(20)))]
    #[case(Budget::Unbounded, 2, None, Some(UNBOUNDED_PASS / 2))]
    fn slot_wait_splits_budget(
        #[case] budget: Budget,
        #[case] slots: usize,
        #[case] max_wait: Option<Duration>,
        #[case] expected: Option<Duration>,
    ) {
        assert_eq!(slot_wait(budget, slots, max_wait), expected);
    }

    #[test]
    fn zero_budget_polls_every_queue_once_without_blocking() {
        let receiver = Scripted::new(Polling::PerQueue { max_wait: None });
        receiver.push("a", br#"{"from": "a"}"#);
        receiver.push("b", br#"{"from": "b"}"#);

        let listen = Listen::start(&receiver, &queues(&["a", "b"]), Some(Duration::ZERO)).unwrap();
        let received: Vec<String> = listen.map(|m| m.unwrap().queue).collect();

        assert_eq!(received, vec!["a".to_string(), "b".to_string()]);
        let calls = receiver.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(_, wait)| *wait == Some(Duration::ZERO)));
    }

    #[test]
    fn queues_are_polled_lazily() {
        let receiver = Scripted::new(Polling::PerQueue { max_wait: None });
        receiver.push("a", br#"1"#);
        receiver.push("b", br#"2"#);

        let mut listen = Listen::start(&receiver, &queues(&["a", "b"]), Some(Duration::ZERO)).unwrap();
        let first = listen.next().unwrap().unwrap();
        assert_eq!(first.queue, "a");
        assert_eq!(receiver.calls().len(), 1);
    }

    #[test]
    fn multiplexed_backend_gets_one_call_per_pass() {
        let receiver = Scripted::new(Polling::Multiplexed);
        receiver.push("a", br#"1"#);
        receiver.push("b", br#"2"#);

        let listen = Listen::start(&receiver, &queues(&["a", "b"]), Some(Duration::ZERO)).unwrap();
        assert_eq!(listen.count(), 2);
        let calls = receiver.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, queues(&["a", "b"]));
    }

    #[test]
    fn malformed_bodies_are_skipped() {
        let receiver = Scripted::new(Polling::PerQueue { max_wait: None });
        receiver.push("a", b"{not json");
        receiver.push("b", br#"{"ok": true}"#);

        let listen = Listen::start(&receiver, &queues(&["a", "b"]), Some(Duration::ZERO)).unwrap();
        let received: Vec<Message> = listen.map(Result::unwrap).collect();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].queue, "b");
    }

    #[test]
    fn transport_error_is_yielded_once() {
        let mut receiver = Scripted::new(Polling::PerQueue { max_wait: None });
        receiver.fail = true;

        let mut listen = Listen::start(&receiver, &queues(&["a"]), Some(Duration::ZERO)).unwrap();
        assert!(matches!(listen.next(), Some(Err(BrokerError::Transport(_)))));
        assert!(listen.next().is_none());
    }

    #[test]
    fn empty_queue_set_is_rejected() {
        let receiver = Scripted::new(Polling::Multiplexed);
        assert!(matches!(
            Listen::start(&receiver, &[], None),
            Err(BrokerError::NoQueues)
        ));
    }

    #[test]
    fn duplicate_queue_names_are_watched_once() {
        let receiver = Scripted::new(Polling::PerQueue { max_wait: None });
        let listen = Listen::start(&receiver, &queues(&["a", "a", "b"]), Some(Duration::ZERO)).unwrap();
        assert_eq!(listen.queues(), queues(&["a", "b"]).as_slice());
    }

    #[test]
    fn idle_passes_are_paced_until_the_deadline() {
        let receiver = Scripted::new(Polling::PerQueue { max_wait: Some(Duration::ZERO) });
        let started = Instant::now();
        let listen = Listen::start(&receiver, &queues(&["a", "b"]), Some(Duration::from_millis(200))).unwrap();
        assert_eq!(listen.count(), 0);

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
        // Without pacing this would be thousands of calls.
        assert!(receiver.calls().len() <= 2 * 6);
    }

    #[test]
    fn later_pass_stops_once_a_slot_overruns_the_deadline() {
        let mut receiver = Scripted::new(Polling::PerQueue { max_wait: None });
        // First slot of the second pass blocks well past the deadline.
        receiver.stall = Some((2, Duration::from_millis(300)));

        let listen = Listen::start(&receiver, &queues(&["a", "b"]), Some(Duration::from_millis(200))).unwrap();
        assert_eq!(listen.count(), 0);

        let calls = receiver.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].0, queues(&["a"]));
    }

    #[test]
    fn first_pass_finishes_even_after_an_overrun() {
        let mut receiver = Scripted::new(Polling::PerQueue { max_wait: None });
        receiver.stall = Some((0, Duration::from_millis(100)));
        receiver.push("b", br#"{"late": true}"#);

        let listen = Listen::start(&receiver, &queues(&["a", "b"]), Some(Duration::from_millis(20))).unwrap();
        let received: Vec<String> = listen.map(|m| m.unwrap().queue).collect();
        assert_eq!(received, vec!["b".to_string()]);
        assert_eq!(receiver.calls().len(), 2);
    }

    #[test]
    fn later_slots_inherit_unused_budget() {
        let receiver = Scripted::new(Polling::PerQueue { max_wait: None });
        let mut listen = Listen::start(&receiver, &queues(&["a", "b"]), Some(Duration::from_millis(400))).unwrap();
        assert!(listen.next().is_none());

        let calls = receiver.calls();
        let first = calls[0].1.unwrap();
        let second = calls[1].1.unwrap();
        assert!(first <= Duration::from_millis(200));
        assert!(second > Duration::from_millis(200));
    }
}
