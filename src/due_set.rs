//! The due-set index: one entry per live job, ordered by next fire time.
//!
//! Backed by a handle-based priority queue so that API-driven updates can
//! replace or remove a job's entry in O(log n) instead of waiting for it to
//! surface. The structure is owned exclusively by the coordinator task; every
//! mutation is serialized through its message loop, so no internal locking
//! is needed here.

use crate::job::JobId;

use std::cmp::Reverse;

use chrono::{DateTime, Utc};
use priority_queue::PriorityQueue;

/// A `(fire_time, job_id)` pair pending dispatch.
///
/// Ordering key is `fire_time`, tie-broken by `job_id` so that two jobs due
/// at the same instant always drain in a deterministic order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DueEntry {
  pub fire_time: DateTime<Utc>,
  pub job_id: JobId,
}

/// Priority: `Reverse` turns the max-queue into earliest-first, and carrying
/// the job id inside the key makes equal fire times drain by ascending id.
type Priority = Reverse<(DateTime<Utc>, JobId)>;

#[derive(Debug, Default)]
pub(crate) struct DueSet {
  queue: PriorityQueue<JobId, Priority>,
}

impl DueSet {
  pub fn new() -> Self {
    Self {
      queue: PriorityQueue::new(),
    }
  }

  /// Inserts or replaces the entry for `job_id`. At most one entry per job
  /// exists at any instant; a prior entry is superseded.
  pub fn insert(&mut self, job_id: JobId, fire_time: DateTime<Utc>) {
    self.queue.push(job_id, Reverse((fire_time, job_id)));
  }

  /// Removes the entry for `job_id`. No-op if absent; returns whether an
  /// entry was removed.
  pub fn remove(&mut self, job_id: JobId) -> bool {
    self.queue.remove(&job_id).is_some()
  }

  pub fn contains(&self, job_id: JobId) -> bool {
    self.queue.get(&job_id).is_some()
  }

  /// The earliest fire time across all entries, if any. Sizes the
  /// dispatcher's next sleep.
  pub fn peek_earliest(&self) -> Option<DateTime<Utc>> {
    self.queue.peek().map(|(_, Reverse((t, _)))| *t)
  }

  /// Removes and returns all entries with `fire_time <= now`, ascending by
  /// `(fire_time, job_id)`.
  pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<DueEntry> {
    let mut due = Vec::new();
    while let Some((_, Reverse((t, _)))) = self.queue.peek() {
      if *t > now {
        break;
      }
      if let Some((job_id, Reverse((fire_time, _)))) = self.queue.pop() {
        due.push(DueEntry { fire_time, job_id });
      }
    }
    due
  }

  pub fn len(&self) -> usize {
    self.queue.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Duration, TimeZone};
  use uuid::Uuid;

  fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, minute, 0).unwrap()
  }

  #[test]
  fn insert_supersedes_prior_entry() {
    let mut due = DueSet::new();
    let id = Uuid::new_v4();
    due.insert(id, at(10));
    due.insert(id, at(5));
    assert_eq!(due.len(), 1);
    assert_eq!(due.peek_earliest(), Some(at(5)));

    // Later time also supersedes; the stale earlier entry must not fire.
    due.insert(id, at(20));
    assert_eq!(due.len(), 1);
    assert_eq!(due.peek_earliest(), Some(at(20)));
    assert!(due.pop_due(at(10)).is_empty());
  }

  #[test]
  fn pop_due_returns_ascending_and_drains() {
    let mut due = DueSet::new();
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    due.insert(a, at(3));
    due.insert(b, at(1));
    due.insert(c, at(2));

    let drained = due.pop_due(at(2));
    assert_eq!(
      drained.iter().map(|e| (e.fire_time, e.job_id)).collect::<Vec<_>>(),
      vec![(at(1), b), (at(2), c)]
    );
    assert_eq!(due.len(), 1);
    assert_eq!(due.peek_earliest(), Some(at(3)));

    // A job never comes back twice for the same due window.
    assert!(due.pop_due(at(2)).is_empty());
  }

  #[test]
  fn equal_fire_times_order_by_job_id() {
    let mut due = DueSet::new();
    let mut ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    for id in &ids {
      due.insert(*id, at(1));
    }
    ids.sort();

    let drained = due.pop_due(at(1));
    assert_eq!(drained.iter().map(|e| e.job_id).collect::<Vec<_>>(), ids);
  }

  #[test]
  fn remove_is_noop_when_absent() {
    let mut due = DueSet::new();
    let id = Uuid::new_v4();
    assert!(!due.remove(id));
    due.insert(id, at(1));
    assert!(due.remove(id));
    assert!(!due.contains(id));
    assert_eq!(due.peek_earliest(), None);
  }

  #[test]
  fn pop_due_leaves_future_entries() {
    let mut due = DueSet::new();
    let id = Uuid::new_v4();
    due.insert(id, at(30) + Duration::seconds(1));
    assert!(due.pop_due(at(30)).is_empty());
    assert!(due.contains(id));
  }
}
