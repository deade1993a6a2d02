// ! Request correlation tables
// !
// ! Module tracks every request id the connection has issued, in one of
// ! three mutually exclusive places: in flight (sent, awaiting a response),
// ! retrying (first send was BUSY, awaiting a retry tick), or tombstoned
// ! (terminally resolved, held briefly so late responses can be dropped).
// ! The connection core is the sole owner; nothing here is synchronised.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::{Duration, Instant};

use crate::core::error::CallError;

/// One-shot reply channel back to the submitting caller.
///
/// Fulfilled at most once; every terminal outcome of a request fulfills it
/// exactly once.
pub(crate) type CallerHandle = oneshot::Sender<Result<Value, CallError>>;

/// A request whose frame the transport accepted
pub(crate) struct InFlightEntry {
    pub caller: CallerHandle,
    pub method: String,
    pub started_at: Instant,
    pub timeout_ms: u64,
    /// Armed timeout timer; aborted when the response arrives first
    pub timer: AbortHandle,
}

/// A request whose send returned BUSY and is awaiting a retry tick
pub(crate) struct RetryEntry {
    /// The encoded frame, kept so retries do not re-encode
    pub frame: Vec<u8>,
    pub caller: CallerHandle,
    pub method: String,
    pub started_at: Instant,
    /// The caller's timeout budget, applied when the entry is promoted
    pub timeout_ms: u64,
    /// Send attempts made so far, including the initial one
    pub attempts: u32,
    /// Armed retry timer
    pub timer: AbortHandle,
}

struct Tombstone {
    inserted_at: Instant,
    ttl: Duration,
}

impl Tombstone {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) > self.ttl
    }
}

/// The three correlation maps plus their tombstone TTL
pub(crate) struct RequestTable {
    in_flight: HashMap<i64, InFlightEntry>,
    retrying: HashMap<i64, RetryEntry>,
    tombstones: HashMap<i64, Tombstone>,
    tombstone_ttl: Duration,
}

impl RequestTable {
    pub fn new(tombstone_ttl: Duration) -> Self {
        Self {
            in_flight: HashMap::new(),
            retrying: HashMap::new(),
            tombstones: HashMap::new(),
            tombstone_ttl,
        }
    }

    /// Track a request whose first send was accepted
    pub fn insert_in_flight(&mut self, id: i64, entry: InFlightEntry) {
        debug_assert!(!self.retrying.contains_key(&id));
        debug_assert!(!self.tombstones.contains_key(&id));
        self.in_flight.insert(id, entry);
    }

    /// Track a request whose first send returned BUSY
    pub fn insert_retry(&mut self, id: i64, entry: RetryEntry) {
        debug_assert!(!self.in_flight.contains_key(&id));
        debug_assert!(!self.tombstones.contains_key(&id));
        self.retrying.insert(id, entry);
    }

    /// Mutable access to a pending retry, if it still exists
    pub fn retry_mut(&mut self, id: i64) -> Option<&mut RetryEntry> {
        self.retrying.get_mut(&id)
    }

    /// Remove a pending retry, aborting its timer
    pub fn take_retry(&mut self, id: i64) -> Option<RetryEntry> {
        let entry = self.retrying.remove(&id)?;
        entry.timer.abort();
        Some(entry)
    }

    /// Move a retry whose send finally succeeded into the in-flight map.
    ///
    /// The timeout timer is armed through `arm` with the budget the caller
    /// originally asked for, never the connection default. Returns false if
    /// the retry entry is gone.
    pub fn promote<F>(&mut self, id: i64, arm: F) -> bool
    where
        F: FnOnce(u64) -> AbortHandle,
    {
        let Some(retry) = self.retrying.remove(&id) else {
            return false;
        };
        retry.timer.abort();
        self.in_flight.insert(
            id,
            InFlightEntry {
                caller: retry.caller,
                method: retry.method,
                started_at: retry.started_at,
                timeout_ms: retry.timeout_ms,
                timer: arm(retry.timeout_ms),
            },
        );
        true
    }

    /// Remove an in-flight request, typically on response or timeout
    pub fn take_in_flight(&mut self, id: i64) -> Option<InFlightEntry> {
        self.in_flight.remove(&id)
    }

    /// Mark an id terminally resolved.
    ///
    /// Removes the id from the live maps if still present (aborting any
    /// armed timer) and records a TTL tombstone.
    pub fn tombstone(&mut self, id: i64) {
        if let Some(entry) = self.in_flight.remove(&id) {
            entry.timer.abort();
        }
        if let Some(entry) = self.retrying.remove(&id) {
            entry.timer.abort();
        }
        self.tombstones.insert(
            id,
            Tombstone {
                inserted_at: Instant::now(),
                ttl: self.tombstone_ttl,
            },
        );
    }

    /// Whether an id is tombstoned, expiring it lazily if its TTL passed
    pub fn is_tombstoned(&mut self, id: i64) -> bool {
        let now = Instant::now();
        match self.tombstones.get(&id) {
            Some(t) if t.expired(now) => {
                self.tombstones.remove(&id);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Drop every expired tombstone
    pub fn sweep(&mut self) {
        let now = Instant::now();
        self.tombstones.retain(|_, t| !t.expired(now));
    }

    /// Fail every live request at once.
    ///
    /// Empties both live maps, aborts their timers, tombstones every id,
    /// and hands the caller handles back so the core can deliver the
    /// error. Existing tombstones are left in place.
    pub fn drain(&mut self) -> Vec<(i64, CallerHandle)> {
        let mut drained = Vec::with_capacity(self.in_flight.len() + self.retrying.len());
        for (id, entry) in self.in_flight.drain() {
            entry.timer.abort();
            drained.push((id, entry.caller));
        }
        for (id, entry) in self.retrying.drain() {
            entry.timer.abort();
            drained.push((id, entry.caller));
        }
        let now = Instant::now();
        for (id, _) in &drained {
            self.tombstones.insert(
                *id,
                Tombstone {
                    inserted_at: now,
                    ttl: self.tombstone_ttl,
                },
            );
        }
        drained
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn retrying_len(&self) -> usize {
        self.retrying.len()
    }

    pub fn tombstones_len(&self) -> usize {
        self.tombstones.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn dummy_timer() -> AbortHandle {
        tokio::spawn(async {}).abort_handle()
    }

    fn in_flight_entry(timeout_ms: u64) -> (InFlightEntry, oneshot::Receiver<Result<Value, CallError>>) {
        let (tx, rx) = oneshot::channel();
        (
            InFlightEntry {
                caller: tx,
                method: "tools/call".to_string(),
                started_at: Instant::now(),
                timeout_ms,
                timer: dummy_timer(),
            },
            rx,
        )
    }

    fn retry_entry(timeout_ms: u64) -> (RetryEntry, oneshot::Receiver<Result<Value, CallError>>) {
        let (tx, rx) = oneshot::channel();
        (
            RetryEntry {
                frame: b"{}".to_vec(),
                caller: tx,
                method: "tools/call".to_string(),
                started_at: Instant::now(),
                timeout_ms,
                attempts: 1,
                timer: dummy_timer(),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_id_lives_in_one_map_at_a_time() {
        let mut table = RequestTable::new(Duration::from_secs(60));

        let (entry, _rx) = retry_entry(30_000);
        table.insert_retry(1, entry);
        assert_eq!(table.retrying_len(), 1);
        assert_eq!(table.in_flight_len(), 0);

        assert!(table.promote(1, |_| dummy_timer()));
        assert_eq!(table.retrying_len(), 0);
        assert_eq!(table.in_flight_len(), 1);

        table.take_in_flight(1).unwrap();
        table.tombstone(1);
        assert_eq!(table.in_flight_len(), 0);
        assert!(table.is_tombstoned(1));
    }

    #[tokio::test]
    async fn test_promote_uses_stored_timeout() {
        let mut table = RequestTable::new(Duration::from_secs(60));

        let (entry, _rx) = retry_entry(60_000);
        table.insert_retry(5, entry);

        let mut armed_with = None;
        assert!(table.promote(5, |timeout_ms| {
            armed_with = Some(timeout_ms);
            dummy_timer()
        }));

        // The caller asked for 60s; the default must not leak in here
        assert_eq!(armed_with, Some(60_000));
        assert_eq!(table.take_in_flight(5).unwrap().timeout_ms, 60_000);
    }

    #[tokio::test]
    async fn test_promote_missing_entry() {
        let mut table = RequestTable::new(Duration::from_secs(60));
        assert!(!table.promote(9, |_| dummy_timer()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tombstone_decay() {
        let ttl = Duration::from_secs(60);
        let mut table = RequestTable::new(ttl);

        table.tombstone(3);
        assert!(table.is_tombstoned(3));

        tokio::time::advance(ttl + Duration::from_secs(1)).await;

        // Lazy lookup expires the entry
        assert!(!table.is_tombstoned(3));
        assert_eq!(table.tombstones_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_only_expired() {
        let ttl = Duration::from_secs(60);
        let mut table = RequestTable::new(ttl);

        table.tombstone(1);
        tokio::time::advance(Duration::from_secs(45)).await;
        table.tombstone(2);
        tokio::time::advance(Duration::from_secs(30)).await;

        // id 1 is 75s old, id 2 only 30s old
        table.sweep();
        assert!(!table.is_tombstoned(1));
        assert!(table.is_tombstoned(2));
    }

    #[tokio::test]
    async fn test_drain_empties_live_maps_and_tombstones_ids() {
        let mut table = RequestTable::new(Duration::from_secs(60));

        let (entry, _rx1) = in_flight_entry(30_000);
        table.insert_in_flight(1, entry);
        let (entry, _rx2) = in_flight_entry(30_000);
        table.insert_in_flight(2, entry);
        let (entry, _rx3) = retry_entry(30_000);
        table.insert_retry(3, entry);

        let drained = table.drain();
        let mut ids: Vec<i64> = drained.iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);

        assert_eq!(table.in_flight_len(), 0);
        assert_eq!(table.retrying_len(), 0);
        for id in [1, 2, 3] {
            assert!(table.is_tombstoned(id));
        }
    }

    #[tokio::test]
    async fn test_drain_leaves_existing_tombstones() {
        let mut table = RequestTable::new(Duration::from_secs(60));
        table.tombstone(7);

        let (entry, _rx) = in_flight_entry(30_000);
        table.insert_in_flight(8, entry);
        table.drain();

        assert!(table.is_tombstoned(7));
        assert!(table.is_tombstoned(8));
    }
}
