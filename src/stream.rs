//! Stream engine (C3): ordered append log per key, ID generation and
//! comparison, range queries, and the cross-connection blocking-waiter
//! registry that backs XREAD.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::RedpointError;

/// A stored stream entry ID: the pair `ms-seq`, both non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamId {
    pub ms: i64,
    pub seq: i64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn new(ms: i64, seq: i64) -> Self {
        StreamId { ms, seq }
    }
}

impl PartialOrd for StreamId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StreamId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ms.cmp(&other.ms).then(self.seq.cmp(&other.seq))
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// Parses a full explicit `ms-seq` id, used for XRANGE bounds and XREAD
/// min-ids where no `*` refinement applies.
pub fn parse_explicit_id(s: &str) -> Result<StreamId, RedpointError> {
    let (ms_part, seq_part) = s
        .split_once('-')
        .ok_or_else(|| RedpointError::Other(format!("invalid stream ID: {s}")))?;
    let ms: i64 = ms_part
        .parse()
        .map_err(|_| RedpointError::Other(format!("invalid stream ID: {s}")))?;
    let seq: i64 = seq_part
        .parse()
        .map_err(|_| RedpointError::Other(format!("invalid stream ID: {s}")))?;
    Ok(StreamId::new(ms, seq))
}

/// The raw ID argument given to XADD, before refinement against `last_id`.
pub enum RawId {
    /// `*` — fully automatic.
    Auto,
    /// `ms-*` — sequence automatic.
    SeqAuto(i64),
    /// `ms-seq` — used verbatim.
    Explicit(StreamId),
}

pub fn parse_raw_id(s: &str) -> Result<RawId, RedpointError> {
    if s == "*" {
        return Ok(RawId::Auto);
    }
    if let Some(ms_part) = s.strip_suffix("-*") {
        let ms: i64 = ms_part
            .parse()
            .map_err(|_| RedpointError::Other(format!("invalid stream ID: {s}")))?;
        return Ok(RawId::SeqAuto(ms));
    }
    Ok(RawId::Explicit(parse_explicit_id(s)?))
}

/// Bound tokens recognized by XRANGE (`-` = smallest possible id, `+` =
/// largest possible id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeBound {
    NegInf,
    PosInf,
    Id(StreamId),
}

impl RangeBound {
    pub fn parse(s: &str) -> Result<RangeBound, RedpointError> {
        match s {
            "-" => Ok(RangeBound::NegInf),
            "+" => Ok(RangeBound::PosInf),
            _ => Ok(RangeBound::Id(parse_explicit_id(s)?)),
        }
    }

    fn le_id(&self, id: StreamId) -> bool {
        match self {
            RangeBound::NegInf => true,
            RangeBound::PosInf => false,
            RangeBound::Id(b) => *b <= id,
        }
    }

    fn ge_id(&self, id: StreamId) -> bool {
        match self {
            RangeBound::NegInf => false,
            RangeBound::PosInf => true,
            RangeBound::Id(b) => *b >= id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Vec<(String, String)>,
}

/// Per-key append-only ordered sequence, entity `StreamLog`.
#[derive(Debug, Clone, Default)]
pub struct StreamLog {
    entries: Vec<StreamEntry>,
    last_id: Option<StreamId>,
}

impl StreamLog {
    pub fn last_id(&self) -> Option<StreamId> {
        self.last_id
    }

    /// Refine a raw XADD id against `last_id`, per §4.3, then append on
    /// success. Returns the refined id.
    pub fn append(
        &mut self,
        raw: RawId,
        fields: Vec<(String, String)>,
    ) -> Result<StreamId, RedpointError> {
        let refined = self.refine(raw)?;
        if refined == StreamId::ZERO {
            return Err(RedpointError::XaddIdZero);
        }
        if let Some(last) = self.last_id {
            if refined <= last {
                return Err(RedpointError::XaddIdTooSmall);
            }
        }
        self.entries.push(StreamEntry {
            id: refined,
            fields,
        });
        self.last_id = Some(refined);
        Ok(refined)
    }

    fn refine(&self, raw: RawId) -> Result<StreamId, RedpointError> {
        match raw {
            RawId::Explicit(id) => Ok(id),
            RawId::Auto => {
                let now_ms = crate::util::now_millis();
                Ok(StreamId::new(now_ms, 0))
            }
            RawId::SeqAuto(ms) => match self.last_id {
                Some(last) if last.ms == ms => Ok(StreamId::new(ms, last.seq + 1)),
                _ if ms == 0 => Ok(StreamId::new(0, 1)),
                _ => Ok(StreamId::new(ms, 0)),
            },
        }
    }

    pub fn range(&self, lo: RangeBound, hi: RangeBound) -> Vec<StreamEntry> {
        self.entries
            .iter()
            .filter(|e| lo.le_id(e.id) && hi.ge_id(e.id))
            .cloned()
            .collect()
    }

    /// All entries with `id > min_id`, in append order.
    pub fn after(&self, min_id: StreamId) -> Vec<StreamEntry> {
        self.entries
            .iter()
            .filter(|e| e.id > min_id)
            .cloned()
            .collect()
    }
}

/// A reader suspended on XREAD, entity `BlockedWaiter`. Registered once per
/// stream key it is waiting on; woken exactly once, either by a qualifying
/// XADD or by its timeout.
pub struct Waiter {
    /// Guards exactly-once delivery between the XADD wake path and the
    /// timeout task racing it.
    delivered: Arc<AtomicBool>,
    /// The id this waiter asked to read after, on the key this `Waiter`
    /// instance represents. An XADD only qualifies this waiter if the new
    /// entry's id is greater than this.
    min_id: StreamId,
    tx: Option<oneshot::Sender<(String, StreamEntry)>>,
}

impl Waiter {
    /// Attempt to deliver `(stream_key, entry)` to this waiter. Returns
    /// `true` if this call won the race and the delivery was sent. Does
    /// nothing (and does not consume the delivered flag) if `entry` does
    /// not qualify against this waiter's `min_id`.
    fn try_deliver(&mut self, key: &str, entry: StreamEntry) -> bool {
        if entry.id <= self.min_id {
            return false;
        }
        if self
            .delivered
            .compare_exchange(false, true, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
            .is_err()
        {
            return false;
        }
        if let Some(tx) = self.tx.take() {
            let _ = tx.send((key.to_string(), entry));
        }
        true
    }
}

/// Process-wide registry of waiters, keyed by the stream key they are
/// waiting on. A waiter registered on N keys appears once per key.
#[derive(Default)]
pub struct WaiterRegistry {
    by_key: HashMap<String, Vec<Waiter>>,
}

impl WaiterRegistry {
    /// Registers a new waiter across `keys`, each with its own requested
    /// `min_id` (parallel to `keys`), and returns the receiving half of its
    /// one-shot delivery channel plus the shared "already delivered" flag
    /// the timeout task must consult before declaring a timeout.
    pub fn register(
        &mut self,
        keys: &[String],
        min_ids: &[StreamId],
    ) -> (
        oneshot::Receiver<(String, StreamEntry)>,
        Arc<AtomicBool>,
    ) {
        debug_assert_eq!(keys.len(), min_ids.len());
        let (tx, rx) = oneshot::channel();
        let delivered = Arc::new(AtomicBool::new(false));
        let mut tx = Some(tx);
        for (i, (key, min_id)) in keys.iter().zip(min_ids.iter()).enumerate() {
            let waiter = Waiter {
                delivered: delivered.clone(),
                min_id: *min_id,
                // Only the first key's waiter actually owns the sender; the
                // rest share the same `delivered` flag so a single delivery
                // across any key wins the race and the others become no-ops.
                tx: if i == 0 { tx.take() } else { None },
            };
            self.by_key.entry(key.clone()).or_default().push(waiter);
        }
        (rx, delivered)
    }

    /// Removes all waiters for `key` whose `delivered` flag is already set
    /// (either because they fired or timed out), so the registry does not
    /// grow without bound.
    pub fn reap(&mut self, key: &str) {
        if let Some(list) = self.by_key.get_mut(key) {
            list.retain(|w| !w.delivered.load(AtomicOrdering::SeqCst));
            if list.is_empty() {
                self.by_key.remove(key);
            }
        }
    }

    /// `reap` over every key a single waiter was registered on, for the
    /// timeout path to clean up after itself regardless of which of the
    /// waiter's keys (if any) ends up winning the race.
    pub fn reap_keys(&mut self, keys: &[String]) {
        for key in keys {
            self.reap(key);
        }
    }

    /// Called after a successful XADD on `key`. Wakes every waiter
    /// registered on `key` whose `min_id` the new entry satisfies, exactly
    /// once each, then drops delivered/timed-out waiters from the registry.
    pub fn wake(&mut self, key: &str, entry: &StreamEntry) {
        if let Some(list) = self.by_key.get_mut(key) {
            for waiter in list.iter_mut() {
                waiter.try_deliver(key, entry.clone());
            }
        }
        self.reap(key);
    }
}
