//! Waiting / in-progress bookkeeping for one device
//!
//! A record is always in exactly one place: the upper layer's waiting list,
//! this queue's in-progress list, or handed back to its completion callback.
//! Rollback appends to the tail of the waiting list, so a record that failed
//! mid-send is retried after anything already waiting.

use crate::protocol::{MessageId, OutboundMessage, SendStatus, WaitingList};
use std::collections::VecDeque;

#[derive(Debug)]
pub struct EventQueue {
    waiting: WaitingList,
    in_progress: VecDeque<OutboundMessage>,
}

impl EventQueue {
    pub fn new(waiting: WaitingList) -> Self {
        Self {
            waiting,
            in_progress: VecDeque::new(),
        }
    }

    /// Peek at the head of the waiting list
    pub fn next_waiting(&self) -> Option<MessageId> {
        self.waiting.front_id()
    }

    /// Move a waiting record to the tail of the in-progress list.
    /// Returns false if the record is not waiting.
    pub fn track_in_progress(&mut self, id: MessageId) -> bool {
        match self.waiting.remove(id) {
            Some(message) => {
                self.in_progress.push_back(message);
                true
            }
            None => false,
        }
    }

    pub fn in_progress(&self, id: MessageId) -> Option<&OutboundMessage> {
        self.in_progress.iter().find(|m| m.id() == id)
    }

    /// Take a record out of the in-progress list once its send has finished.
    /// The caller is responsible for completing it.
    pub fn complete_in_progress(&mut self, id: MessageId) -> Option<OutboundMessage> {
        let position = self.in_progress.iter().position(|m| m.id() == id)?;
        self.in_progress.remove(position)
    }

    /// Move one in-progress record back to the tail of the waiting list.
    pub fn rollback_one(&mut self, id: MessageId) -> bool {
        match self.complete_in_progress(id) {
            Some(message) => {
                self.waiting.push_back(message);
                true
            }
            None => false,
        }
    }

    /// Move every in-progress record back to the waiting tail, keeping their
    /// in-progress order. Returns how many were moved.
    pub fn rollback_all(&mut self) -> usize {
        let count = self.in_progress.len();
        for message in self.in_progress.drain(..) {
            self.waiting.push_back(message);
        }
        count
    }

    pub fn in_progress_ids(&self) -> Vec<MessageId> {
        self.in_progress.iter().map(OutboundMessage::id).collect()
    }

    pub fn in_progress_len(&self) -> usize {
        self.in_progress.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn send_status(&self) -> SendStatus {
        if self.waiting.is_empty() && self.in_progress.is_empty() {
            SendStatus::Idle
        } else {
            SendStatus::Busy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IotHubMessage;

    fn queue_with(count: usize) -> (EventQueue, WaitingList, Vec<MessageId>) {
        let waiting = WaitingList::new();
        let ids = (0..count)
            .map(|i| waiting.enqueue(IotHubMessage::text(format!("m{i}"))))
            .collect();
        (EventQueue::new(waiting.clone()), waiting, ids)
    }

    #[test]
    fn test_next_waiting_peeks_without_removing() {
        let (queue, waiting, ids) = queue_with(2);
        assert_eq!(queue.next_waiting(), Some(ids[0]));
        assert_eq!(waiting.len(), 2);
    }

    #[test]
    fn test_track_moves_record() {
        let (mut queue, waiting, ids) = queue_with(2);
        assert!(queue.track_in_progress(ids[0]));
        assert_eq!(waiting.ids(), vec![ids[1]]);
        assert_eq!(queue.in_progress_ids(), vec![ids[0]]);
        // Second track of the same record is a no-op
        assert!(!queue.track_in_progress(ids[0]));
    }

    #[test]
    fn test_rollback_one_appends_to_tail() {
        let (mut queue, waiting, ids) = queue_with(3);
        queue.track_in_progress(ids[0]);
        assert!(queue.rollback_one(ids[0]));
        assert_eq!(waiting.ids(), vec![ids[1], ids[2], ids[0]]);
        assert_eq!(queue.in_progress_len(), 0);
    }

    #[test]
    fn test_rollback_all_keeps_in_progress_order() {
        let (mut queue, waiting, ids) = queue_with(3);
        queue.track_in_progress(ids[0]);
        queue.track_in_progress(ids[1]);

        assert_eq!(queue.rollback_all(), 2);
        assert_eq!(waiting.ids(), vec![ids[2], ids[0], ids[1]]);
    }

    #[test]
    fn test_complete_removes_once() {
        let (mut queue, _waiting, ids) = queue_with(1);
        queue.track_in_progress(ids[0]);
        assert!(queue.complete_in_progress(ids[0]).is_some());
        assert!(queue.complete_in_progress(ids[0]).is_none());
    }

    #[test]
    fn test_send_status() {
        let (mut queue, _waiting, ids) = queue_with(1);
        assert_eq!(queue.send_status(), SendStatus::Busy);
        queue.track_in_progress(ids[0]);
        assert_eq!(queue.send_status(), SendStatus::Busy);
        queue.complete_in_progress(ids[0]);
        assert_eq!(queue.send_status(), SendStatus::Idle);
    }
}
