use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use storygraph_core::{CallId, CallStatus, CallType, Result, StoryGraphError};
use tracing::{debug, info};
use uuid::Uuid;

/// One ledger entry: the full lifecycle of a single LLM invocation.
///
/// Entries are append-only. A terminal record is never mutated again
/// except to attach later `feedback` from the analysis queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub call_type: CallType,
    pub status: CallStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub prompt: String,
    pub response: Option<String>,
    pub error: Option<String>,
    pub feedback: Option<String>,
}

pub type SubscriptionId = Uuid;

type Listener = Arc<dyn Fn(&[CallRecord]) + Send + Sync>;

#[derive(Default)]
struct LedgerInner {
    records: Vec<CallRecord>,
    index: HashMap<CallId, usize>,
    listeners: HashMap<SubscriptionId, Listener>,
}

/// In-memory registry of every LLM invocation.
///
/// Transitions are strictly `queued -> running -> (completed | failed)`;
/// an illegal transition is an error and never mutates the record. Every
/// applied transition notifies all current subscribers with the full
/// record list, in the order the transitions were applied, even when
/// several tasks write concurrently (the analysis worker records its
/// calls in the same ledger as the session). Listeners must not call
/// back into the ledger.
#[derive(Default)]
pub struct CallLedger {
    inner: Mutex<LedgerInner>,
    /// Delivery lock, acquired while `inner` is still held so that
    /// notification order always matches application order.
    notify: Mutex<()>,
}

impl CallLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a `queued` entry for a call about to be dispatched.
    pub fn begin(&self, call_type: CallType, prompt: impl Into<String>) -> CallId {
        let id = Uuid::new_v4();
        let record = CallRecord {
            id,
            call_type: call_type.clone(),
            status: CallStatus::Queued,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            prompt: prompt.into(),
            response: None,
            error: None,
            feedback: None,
        };
        let mut inner = self.inner.lock();
        let pos = inner.records.len();
        inner.index.insert(id, pos);
        inner.records.push(record);
        debug!(call_id = %id, call_type = %call_type, "call queued");
        self.fan_out(inner);
        id
    }

    /// Flip a queued entry to `running` once the underlying request is in
    /// flight. The two sub-states let viewers distinguish "accepted" from
    /// "dispatched".
    pub fn mark_running(&self, id: CallId) -> Result<()> {
        self.transition(id, CallStatus::Running, |_| {})
    }

    pub fn complete(&self, id: CallId, response: impl Into<String>) -> Result<()> {
        let response = response.into();
        self.transition(id, CallStatus::Completed, move |record| {
            record.response = Some(response);
        })
    }

    pub fn fail(&self, id: CallId, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.transition(id, CallStatus::Failed, move |record| {
            record.error = Some(error);
        })
    }

    /// Attach analysis feedback to a terminal record. The only mutation
    /// allowed after a record reaches `completed` or `failed`.
    pub fn attach_feedback(&self, id: CallId, feedback: impl Into<String>) -> Result<()> {
        let mut inner = self.inner.lock();
        let pos = *inner
            .index
            .get(&id)
            .ok_or_else(|| StoryGraphError::CallNotFound(id.to_string()))?;
        let record = &mut inner.records[pos];
        if !record.status.is_terminal() {
            return Err(StoryGraphError::InvalidTransition(format!(
                "call {} is {}; feedback attaches to terminal records only",
                id, record.status
            )));
        }
        record.feedback = Some(feedback.into());
        self.fan_out(inner);
        Ok(())
    }

    /// Register a listener invoked with the full record list on every
    /// transition. Listeners are expected to be idempotent re-renderers.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&[CallRecord]) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.inner.lock().listeners.insert(id, Arc::new(listener));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.lock().listeners.remove(&id);
    }

    /// Entries still `queued` or `running`. Backpressure signal only; no
    /// hard cap is enforced at this layer.
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|r| r.status.is_pending())
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    pub fn get(&self, id: CallId) -> Option<CallRecord> {
        let inner = self.inner.lock();
        inner.index.get(&id).map(|&pos| inner.records[pos].clone())
    }

    pub fn snapshot(&self) -> Vec<CallRecord> {
        self.inner.lock().records.clone()
    }

    /// The only destructive operation; explicit and user-triggered.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.records.len();
        inner.records.clear();
        inner.index.clear();
        info!(dropped, "ledger cleared");
        self.fan_out(inner);
    }

    /// Reload records from a restored session snapshot. Replaces the log
    /// wholesale; subscriptions are untouched.
    pub fn restore(&self, records: Vec<CallRecord>) {
        let mut inner = self.inner.lock();
        inner.index = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id, i))
            .collect();
        inner.records = records;
        self.fan_out(inner);
    }

    fn transition<F>(&self, id: CallId, to: CallStatus, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut CallRecord),
    {
        let mut inner = self.inner.lock();
        let pos = *inner
            .index
            .get(&id)
            .ok_or_else(|| StoryGraphError::CallNotFound(id.to_string()))?;
        let record = &mut inner.records[pos];
        if !record.status.can_transition_to(to) {
            return Err(StoryGraphError::InvalidTransition(format!(
                "call {}: {} -> {}",
                id, record.status, to
            )));
        }
        record.status = to;
        if to.is_terminal() {
            let end = Utc::now();
            record.end_time = Some(end);
            record.duration_ms = Some(
                (end - record.start_time).num_milliseconds().max(0) as u64,
            );
        }
        mutate(record);
        debug!(call_id = %id, status = %to, "call transition");
        self.fan_out(inner);
        Ok(())
    }

    /// Snapshot under `inner`, take the delivery lock before releasing
    /// it, then invoke listeners while holding only the delivery lock.
    /// Two writers therefore deliver their snapshots in the order their
    /// mutations were applied.
    fn fan_out(&self, inner: MutexGuard<'_, LedgerInner>) {
        let records = inner.records.clone();
        let listeners: Vec<Listener> = inner.listeners.values().cloned().collect();
        let order = self.notify.lock();
        drop(inner);
        for listener in listeners {
            listener(&records);
        }
        drop(order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[test]
    fn lifecycle_is_monotonic() {
        let ledger = CallLedger::new();
        let id = ledger.begin(CallType::UserEdit, "prompt");
        assert_eq!(ledger.get(id).unwrap().status, CallStatus::Queued);

        // Completing before running skips a state and must fail.
        assert!(ledger.complete(id, "too early").is_err());

        ledger.mark_running(id).unwrap();
        ledger.complete(id, "done").unwrap();
        let record = ledger.get(id).unwrap();
        assert_eq!(record.status, CallStatus::Completed);
        assert_eq!(record.response.as_deref(), Some("done"));
        assert!(record.duration_ms.is_some());

        // Terminal records never regress.
        assert!(ledger.mark_running(id).is_err());
        assert!(ledger.fail(id, "nope").is_err());
    }

    #[test]
    fn observed_statuses_are_a_lifecycle_subsequence() {
        let ledger = Arc::new(CallLedger::new());
        let seen: Arc<PlMutex<Vec<Vec<CallStatus>>>> = Arc::new(PlMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        ledger.subscribe(move |records| {
            seen_clone
                .lock()
                .push(records.iter().map(|r| r.status).collect());
        });

        let id = ledger.begin(CallType::FeedbackAnalysis, "p");
        ledger.mark_running(id).unwrap();
        ledger.fail(id, "provider down").unwrap();

        let observed: Vec<CallStatus> = seen.lock().iter().map(|s| s[0]).collect();
        assert_eq!(
            observed,
            vec![CallStatus::Queued, CallStatus::Running, CallStatus::Failed]
        );
    }

    #[test]
    fn concurrent_writers_notify_in_application_order() {
        let ledger = Arc::new(CallLedger::new());
        let regressions = Arc::new(PlMutex::new(0usize));
        let regressions_clone = regressions.clone();
        // Rank per id across arriving snapshots; a drop in rank means a
        // later-applied transition was delivered before an earlier one.
        let ranks: Arc<PlMutex<HashMap<CallId, u8>>> = Arc::new(PlMutex::new(HashMap::new()));
        ledger.subscribe(move |records| {
            let mut ranks = ranks.lock();
            for record in records {
                let rank = match record.status {
                    CallStatus::Queued => 0,
                    CallStatus::Running => 1,
                    CallStatus::Completed | CallStatus::Failed => 2,
                };
                let seen = ranks.entry(record.id).or_insert(rank);
                if rank < *seen {
                    *regressions_clone.lock() += 1;
                }
                *seen = (*seen).max(rank);
            }
        });

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let id = ledger.begin(CallType::FeedbackAnalysis, "p");
                        ledger.mark_running(id).unwrap();
                        ledger.complete(id, "ok").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*regressions.lock(), 0);
        assert_eq!(ledger.len(), 800);
        assert_eq!(ledger.pending_count(), 0);
    }

    #[test]
    fn pending_count_tracks_queued_and_running() {
        let ledger = CallLedger::new();
        let a = ledger.begin(CallType::UserEdit, "a");
        let b = ledger.begin(CallType::UserEdit, "b");
        assert_eq!(ledger.pending_count(), 2);
        ledger.mark_running(a).unwrap();
        assert_eq!(ledger.pending_count(), 2);
        ledger.complete(a, "ok").unwrap();
        assert_eq!(ledger.pending_count(), 1);
        ledger.mark_running(b).unwrap();
        ledger.fail(b, "err").unwrap();
        assert_eq!(ledger.pending_count(), 0);
    }

    #[test]
    fn feedback_attaches_only_to_terminal_records() {
        let ledger = CallLedger::new();
        let id = ledger.begin(CallType::UserEdit, "p");
        assert!(ledger.attach_feedback(id, "early").is_err());
        ledger.mark_running(id).unwrap();
        ledger.complete(id, "ok").unwrap();
        ledger.attach_feedback(id, "solid output").unwrap();
        assert_eq!(
            ledger.get(id).unwrap().feedback.as_deref(),
            Some("solid output")
        );
    }

    #[test]
    fn clear_empties_the_log_and_notifies() {
        let ledger = CallLedger::new();
        let counts: Arc<PlMutex<Vec<usize>>> = Arc::new(PlMutex::new(Vec::new()));
        let counts_clone = counts.clone();
        ledger.subscribe(move |records| counts_clone.lock().push(records.len()));
        ledger.begin(CallType::UserEdit, "p");
        ledger.clear();
        assert!(ledger.is_empty());
        assert_eq!(*counts.lock(), vec![1, 0]);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let ledger = CallLedger::new();
        let hits = Arc::new(PlMutex::new(0usize));
        let hits_clone = hits.clone();
        let sub = ledger.subscribe(move |_| *hits_clone.lock() += 1);
        ledger.begin(CallType::UserEdit, "a");
        ledger.unsubscribe(sub);
        ledger.begin(CallType::UserEdit, "b");
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn restore_replaces_the_log() {
        let ledger = CallLedger::new();
        let id = ledger.begin(CallType::UserEdit, "p");
        ledger.mark_running(id).unwrap();
        ledger.complete(id, "ok").unwrap();
        let saved = ledger.snapshot();

        let restored = CallLedger::new();
        restored.restore(saved);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.get(id).unwrap().status, CallStatus::Completed);
    }
}
