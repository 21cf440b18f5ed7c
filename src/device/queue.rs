//! Pending OPER changes and the callers waiting on them.
//!
//! The pending set and the waiter registry live behind one lock so that
//! confirming a key (resolve its waiters, then drop it from the set) is a
//! single step. A change queued for a key right after that step starts a new
//! pending entry with fresh waiters.
//!
//! Each pending key counts its own attempts, so a key merged in the middle of
//! a reconciliation episode gets the full budget instead of inheriting the
//! episode's.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::try_join_all;
use serde_json::Value;
use tokio::sync::{Notify, oneshot};

use crate::electra::Oper;
use crate::error::{Error, Result};

/// How a single key's wait ended, as decided by the reconciliation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Confirmed,
    Exhausted { attempts: u32 },
    Stopped,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Resolution>,
}

#[derive(Default)]
struct Pending {
    changes: Oper,
    /// Fetches each pending key has gone through unconfirmed.
    attempts: HashMap<String, u32>,
    /// Exhausted keys kept for the next wake; not pushed until then.
    parked: HashSet<String>,
    waiters: HashMap<String, Vec<Waiter>>,
    next_waiter_id: u64,
    stopped: bool,
}

impl Pending {
    fn register(&mut self, key: &str) -> (u64, oneshot::Receiver<Resolution>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        self.waiters
            .entry(key.to_string())
            .or_default()
            .push(Waiter { id, tx });
        (id, rx)
    }

    fn resolve(&mut self, key: &str, resolution: Resolution) {
        for waiter in self.waiters.remove(key).unwrap_or_default() {
            // Receiver may already be gone; nothing to deliver then.
            let _ = waiter.tx.send(resolution);
        }
    }

    fn remove(&mut self, key: &str, resolution: Resolution) {
        self.resolve(key, resolution);
        self.changes.remove(key);
        self.attempts.remove(key);
        self.parked.remove(key);
    }

    fn active_keys(&self) -> Vec<String> {
        self.changes
            .keys()
            .filter(|key| !self.parked.contains(*key))
            .cloned()
            .collect()
    }

    /// Count one attempt against every active key and return the keys that
    /// have now used up `max_attempts`.
    fn charge(&mut self, max_attempts: u32) -> Vec<String> {
        let mut exhausted = Vec::new();
        for key in self.active_keys() {
            let attempts = self.attempts.entry(key.clone()).or_default();
            *attempts += 1;
            if *attempts >= max_attempts {
                exhausted.push(key);
            }
        }
        exhausted
    }
}

/// Result of diffing the pending set against a fresh OPER block.
#[derive(Debug, Default)]
pub(crate) struct Reconciled {
    pub confirmed: Vec<String>,
    /// Keys that just used their last attempt. Not part of `to_send`.
    pub exhausted: Vec<String>,
    /// Active keys that still have attempts left, with their desired values.
    pub to_send: Oper,
}

pub struct ChangeQueue {
    pending: Mutex<Pending>,
    wake: Notify,
    timeout: Duration,
}

impl ChangeQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            wake: Notify::new(),
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge `delta` into the pending set and wake the loop. Later values for
    /// a key overwrite earlier unconfirmed ones and restart its attempt count;
    /// earlier waiters stay attached. Parked keys become active again.
    pub fn enqueue(self: &Arc<Self>, delta: Oper) -> Result<ChangeTicket> {
        let mut waits = Vec::with_capacity(delta.len());
        {
            let mut pending = self.lock();
            if pending.stopped {
                return Err(Error::Stopped);
            }
            for key in std::mem::take(&mut pending.parked) {
                pending.attempts.remove(&key);
            }
            for (key, value) in delta {
                pending.attempts.remove(&key);
                let (id, rx) = pending.register(&key);
                pending.changes.insert(key.clone(), value);
                waits.push(KeyWait {
                    registration: Registration {
                        queue: Arc::clone(self),
                        key,
                        id,
                    },
                    rx,
                });
            }
        }
        // Notify keeps at most one permit, so wakes coalesce.
        self.wake.notify_one();

        Ok(ChangeTicket {
            waits,
            timeout: self.timeout,
        })
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }

    /// Whether any pending key still needs pushing (parked keys excluded).
    pub(crate) fn has_active(&self) -> bool {
        let pending = self.lock();
        pending
            .changes
            .keys()
            .any(|key| !pending.parked.contains(key))
    }

    pub fn pending(&self) -> Oper {
        self.lock().changes.clone()
    }

    /// Confirm every pending key whose desired value matches `observed`, then
    /// count this fetch as an attempt for the active keys still outstanding.
    pub(crate) fn confirm(&self, observed: &Oper, max_attempts: u32) -> Reconciled {
        let mut pending = self.lock();
        let confirmed: Vec<String> = pending
            .changes
            .iter()
            .filter(|(key, desired)| observed.get(key.as_str()) == Some(*desired))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &confirmed {
            pending.remove(key, Resolution::Confirmed);
        }

        let exhausted = pending.charge(max_attempts);
        let to_send = pending
            .active_keys()
            .into_iter()
            .filter(|key| !exhausted.contains(key))
            .filter_map(|key| pending.changes.get(&key).cloned().map(|v| (key, v)))
            .collect();

        Reconciled {
            confirmed,
            exhausted,
            to_send,
        }
    }

    /// Count a failed attempt against the active keys. Returns the keys that
    /// have now used up `max_attempts`.
    pub(crate) fn charge_failure(&self, max_attempts: u32) -> Vec<String> {
        self.lock().charge(max_attempts)
    }

    /// Drop `keys` and fail their waiters.
    pub(crate) fn abandon(&self, keys: &[String], attempts: u32) {
        let mut pending = self.lock();
        for key in keys {
            pending.remove(key, Resolution::Exhausted { attempts });
        }
    }

    /// Keep `keys` pending but stop pushing them until the next enqueue.
    pub(crate) fn park(&self, keys: &[String]) {
        self.lock().parked.extend(keys.iter().cloned());
    }

    /// Refuse new changes and release every waiter.
    pub(crate) fn stop(&self) {
        let mut pending = self.lock();
        pending.stopped = true;
        let keys: Vec<String> = pending.changes.keys().cloned().collect();
        for key in &keys {
            pending.remove(key, Resolution::Stopped);
        }
    }

    fn deregister(&self, key: &str, id: u64) {
        let mut pending = self.lock();
        if let Some(waiters) = pending.waiters.get_mut(key) {
            waiters.retain(|w| w.id != id);
            if waiters.is_empty() {
                pending.waiters.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn waiter_count(&self, key: &str) -> usize {
        self.lock().waiters.get(key).map_or(0, Vec::len)
    }
}

/// Removes its waiter from the registry when the wait ends for any reason.
struct Registration {
    queue: Arc<ChangeQueue>,
    key: String,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.queue.deregister(&self.key, self.id);
    }
}

struct KeyWait {
    registration: Registration,
    rx: oneshot::Receiver<Resolution>,
}

impl KeyWait {
    async fn wait(self, timeout: Duration) -> Result<()> {
        let key = self.registration.key.clone();
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(Resolution::Confirmed)) => Ok(()),
            Ok(Ok(Resolution::Exhausted { attempts })) => {
                Err(Error::ReconciliationExhausted { key, attempts })
            }
            Ok(Ok(Resolution::Stopped) | Err(_)) => Err(Error::Stopped),
            Err(_) => Err(Error::Timeout {
                key,
                after_secs: timeout.as_secs(),
            }),
        }
    }
}

/// Completion handle for one queued delta. Resolves once every key in the
/// delta has been observed upstream; fails on the first key that times out
/// or is abandoned.
pub struct ChangeTicket {
    waits: Vec<KeyWait>,
    timeout: Duration,
}

impl ChangeTicket {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.waits.iter().map(|w| w.registration.key.as_str())
    }

    pub async fn wait(self) -> Result<()> {
        let timeout = self.timeout;
        try_join_all(self.waits.into_iter().map(|w| w.wait(timeout))).await?;
        Ok(())
    }
}

/// Single-key delta.
pub(crate) fn delta(key: &str, value: Value) -> Oper {
    let mut oper = Oper::new();
    oper.insert(key.to_string(), value);
    oper
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn queue() -> Arc<ChangeQueue> {
        Arc::new(ChangeQueue::new(TIMEOUT))
    }

    fn oper(value: Value) -> Oper {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn later_delta_overwrites_pending_value() {
        let q = queue();
        let _a = q.enqueue(oper(json!({"SPT": "21", "FANSPD": "LOW"}))).unwrap();
        let _b = q.enqueue(delta("SPT", json!("23"))).unwrap();

        assert_eq!(q.pending(), oper(json!({"SPT": "23", "FANSPD": "LOW"})));
        assert_eq!(q.waiter_count("SPT"), 2);
    }

    #[tokio::test]
    async fn confirmation_resolves_every_waiter_for_the_key() {
        let q = queue();
        let a = q.enqueue(delta("SPT", json!("21"))).unwrap();
        let b = q.enqueue(delta("SPT", json!("23"))).unwrap();
        let c = q.enqueue(delta("FANSPD", json!("MED"))).unwrap();

        let stale = q.confirm(&oper(json!({"SPT": "21", "FANSPD": "LOW"})), 6);
        assert!(stale.confirmed.is_empty());

        let done = q.confirm(&oper(json!({"SPT": "23", "FANSPD": "LOW"})), 6);
        assert_eq!(done.confirmed, vec!["SPT".to_string()]);
        assert_eq!(done.to_send, delta("FANSPD", json!("MED")));

        a.wait().await.unwrap();
        b.wait().await.unwrap();
        assert_eq!(q.waiter_count("SPT"), 0);
        drop(c);
        assert_eq!(q.waiter_count("FANSPD"), 0);
    }

    #[tokio::test]
    async fn confirmed_key_requeued_starts_a_fresh_entry() {
        let q = queue();
        let first = q.enqueue(delta("FANSPD", json!("MED"))).unwrap();
        q.confirm(&delta("FANSPD", json!("MED")), 6);
        first.wait().await.unwrap();

        let _second = q.enqueue(delta("FANSPD", json!("MED"))).unwrap();
        assert_eq!(q.pending(), delta("FANSPD", json!("MED")));
        assert_eq!(q.waiter_count("FANSPD"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_waiter_is_deregistered_but_change_stays_pending() {
        let q = queue();
        let ticket = q.enqueue(delta("AC_MODE", json!("HEAT"))).unwrap();

        let err = ticket.wait().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { ref key, after_secs: 30 } if key == "AC_MODE"));
        assert_eq!(q.waiter_count("AC_MODE"), 0);
        assert_eq!(q.pending(), delta("AC_MODE", json!("HEAT")));
    }

    #[tokio::test]
    async fn abandon_fails_only_the_named_keys() {
        let q = queue();
        let spt = q.enqueue(delta("SPT", json!("30"))).unwrap();
        let _fan = q.enqueue(delta("FANSPD", json!("LOW"))).unwrap();

        q.abandon(&["SPT".to_string()], 6);
        assert_eq!(q.pending(), delta("FANSPD", json!("LOW")));
        assert!(matches!(
            spt.wait().await,
            Err(Error::ReconciliationExhausted { attempts: 6, .. })
        ));
    }

    #[test]
    fn keys_count_attempts_independently() {
        let q = queue();
        let device = oper(json!({"SPT": "20", "FANSPD": "AUTO"}));
        let _spt = q.enqueue(delta("SPT", json!("24"))).unwrap();

        assert!(q.confirm(&device, 3).exhausted.is_empty());
        assert!(q.charge_failure(3).is_empty());

        let _fan = q.enqueue(delta("FANSPD", json!("HIGH"))).unwrap();
        let third = q.confirm(&device, 3);
        assert_eq!(third.exhausted, vec!["SPT".to_string()]);
        assert_eq!(third.to_send, delta("FANSPD", json!("HIGH")));
    }

    #[test]
    fn requeued_value_restarts_the_attempt_count() {
        let q = queue();
        let device = oper(json!({"SPT": "20"}));
        let _a = q.enqueue(delta("SPT", json!("24"))).unwrap();
        q.confirm(&device, 2);

        let _b = q.enqueue(delta("SPT", json!("25"))).unwrap();
        let next = q.confirm(&device, 2);
        assert!(next.exhausted.is_empty());
        assert_eq!(next.to_send, delta("SPT", json!("25")));
    }

    #[test]
    fn parked_keys_wait_for_the_next_enqueue() {
        let q = queue();
        let device = oper(json!({"AC_MODE": "STBY", "SPT": "20"}));
        let _mode = q.enqueue(delta("AC_MODE", json!("HEAT"))).unwrap();

        let exhausted = q.confirm(&device, 1).exhausted;
        q.park(&exhausted);
        assert!(!q.has_active());
        assert_eq!(q.pending(), delta("AC_MODE", json!("HEAT")));

        let _spt = q.enqueue(delta("SPT", json!("22"))).unwrap();
        assert!(q.has_active());
        assert_eq!(
            q.confirm(&device, 2).to_send,
            oper(json!({"AC_MODE": "HEAT", "SPT": "22"}))
        );
    }

    #[tokio::test]
    async fn stopped_queue_rejects_changes() {
        let q = queue();
        let ticket = q.enqueue(delta("SPT", json!("22"))).unwrap();
        q.stop();

        assert!(matches!(ticket.wait().await, Err(Error::Stopped)));
        assert!(matches!(
            q.enqueue(delta("SPT", json!("22"))),
            Err(Error::Stopped)
        ));
    }

    #[test]
    fn ticket_lists_its_keys() {
        let q = queue();
        let ticket = q
            .enqueue(oper(json!({"AC_MODE": "COOL", "SPT": "21"})))
            .unwrap();
        let keys: Vec<&str> = ticket.keys().collect();
        assert_eq!(keys, vec!["AC_MODE", "SPT"]);
    }
}
