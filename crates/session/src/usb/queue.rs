//! Bookkeeping for emulated asynchronous transfers
//!
//! Transfers wait in submission order until a pump slice takes the whole
//! batch into service. A cancel either removes a waiting transfer outright or,
//! once it is in service, marks it so the pump reports it cancelled instead
//! of completed.

use common::TransferId;
use std::collections::HashSet;

pub(crate) struct TransferQueue<T> {
    queued: Vec<(TransferId, T)>,
    /// Taken out of `queued` by the pump and being attempted right now
    in_service: HashSet<TransferId>,
    /// Cancel requests for in-service transfers
    cancelled: HashSet<TransferId>,
}

impl<T> Default for TransferQueue<T> {
    fn default() -> Self {
        Self {
            queued: Vec::new(),
            in_service: HashSet::new(),
            cancelled: HashSet::new(),
        }
    }
}

impl<T> TransferQueue<T> {
    pub fn push(&mut self, id: TransferId, transfer: T) {
        self.queued.push((id, transfer));
    }

    /// Remove a waiting transfer, or mark an in-service one
    ///
    /// Returns the transfer only when it was still waiting; the caller then
    /// owns reporting it cancelled.
    pub fn cancel(&mut self, id: TransferId) -> Option<T> {
        if let Some(pos) = self.queued.iter().position(|(queued, _)| *queued == id) {
            return Some(self.queued.remove(pos).1);
        }
        if self.in_service.contains(&id) {
            self.cancelled.insert(id);
        }
        None
    }

    /// Take every waiting transfer into service
    pub fn begin(&mut self) -> Vec<(TransferId, T)> {
        let batch = std::mem::take(&mut self.queued);
        self.in_service = batch.iter().map(|(id, _)| *id).collect();
        batch
    }

    /// End service of `id`; true if it was cancelled meanwhile
    pub fn finish(&mut self, id: TransferId) -> bool {
        self.in_service.remove(&id);
        self.cancelled.remove(&id)
    }

    /// Put a transfer that made no progress back in line
    pub fn requeue(&mut self, id: TransferId, transfer: T) {
        self.queued.push((id, transfer));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    #[cfg(test)]
    pub fn in_service(&self) -> usize {
        self.in_service.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_of(ids: &[u64]) -> TransferQueue<&'static str> {
        let mut queue = TransferQueue::default();
        for id in ids {
            queue.push(TransferId(*id), "transfer");
        }
        queue
    }

    fn ids<T>(batch: &[(TransferId, T)]) -> Vec<TransferId> {
        batch.iter().map(|(id, _)| *id).collect()
    }

    #[test]
    fn test_cancel_while_queued_returns_transfer() {
        let mut queue = queue_of(&[1, 2, 3]);

        assert_eq!(queue.cancel(TransferId(2)), Some("transfer"));
        assert_eq!(queue.len(), 2);

        let batch = queue.begin();
        assert_eq!(ids(&batch), vec![TransferId(1), TransferId(3)]);
    }

    #[test]
    fn test_cancel_while_in_service_is_reported_on_finish() {
        let mut queue = queue_of(&[1, 2]);
        let batch = queue.begin();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.in_service(), 2);

        assert_eq!(queue.cancel(TransferId(1)), None);

        assert!(queue.finish(TransferId(1)));
        assert!(!queue.finish(TransferId(2)));
        assert_eq!(queue.in_service(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel_of_unknown_transfer_marks_nothing() {
        let mut queue = queue_of(&[1]);
        assert_eq!(queue.cancel(TransferId(9)), None);

        queue.begin();
        assert!(!queue.finish(TransferId(9)));
        assert!(!queue.finish(TransferId(1)));
    }

    #[test]
    fn test_timed_out_transfer_is_requeued_for_next_slice() {
        let mut queue = queue_of(&[1, 2]);

        for (id, transfer) in queue.begin() {
            assert!(!queue.finish(id));
            if id == TransferId(1) {
                queue.requeue(id, transfer);
            }
        }
        assert_eq!(queue.len(), 1);

        // A requeued transfer can still be cancelled before its next attempt
        queue.push(TransferId(3), "transfer");
        assert_eq!(queue.cancel(TransferId(1)), Some("transfer"));
        assert_eq!(ids(&queue.begin()), vec![TransferId(3)]);
    }

    #[test]
    fn test_submissions_during_service_wait_for_next_batch() {
        let mut queue = queue_of(&[1]);
        let batch = queue.begin();
        queue.push(TransferId(2), "transfer");

        for (id, _) in batch {
            assert!(!queue.finish(id));
        }
        assert_eq!(queue.in_service(), 0);
        assert_eq!(ids(&queue.begin()), vec![TransferId(2)]);
    }

    #[test]
    fn test_stale_cancel_mark_does_not_leak_into_later_batch() {
        let mut queue = queue_of(&[1]);
        queue.begin();
        queue.cancel(TransferId(1));
        assert!(queue.finish(TransferId(1)));

        // The same id may be resubmitted later and must complete normally
        queue.push(TransferId(1), "transfer");
        queue.begin();
        assert!(!queue.finish(TransferId(1)));
    }
}
