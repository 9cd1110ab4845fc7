//! Followup lists
//!
//! A followup list holds the transfers the core polls for completion. It is
//! an intrusive doubly linked list threaded through the transfer records
//! themselves (`followup_prev` / `followup_next`), so membership costs no
//! extra storage. Two lists exist: async (control, bulk) and periodic
//! (interrupt).

use crate::config::MAX_TRANSFERS;
use crate::pool::Pool;
use crate::transfer::{Transfer, TransferId};

/// Which followup list a transfer sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ListKind {
    /// Control and bulk transfers
    Async,
    /// Interrupt transfers
    Periodic,
}

/// Head and tail of one followup list
#[derive(Debug, Default, Clone, Copy)]
pub struct FollowupList {
    head: Option<TransferId>,
    tail: Option<TransferId>,
    len: usize,
}

impl FollowupList {
    /// Empty list
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Oldest transfer on the list
    pub fn first(&self) -> Option<TransferId> {
        self.head
    }

    /// Number of transfers on the list
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no transfer is pending
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Append `id` at the tail
    pub(crate) fn push_back(
        &mut self,
        pool: &mut Pool<Transfer, MAX_TRANSFERS>,
        id: TransferId,
        kind: ListKind,
    ) {
        let tail = self.tail;
        if let Some(transfer) = pool.get_mut(id) {
            transfer.list = Some(kind);
            transfer.followup_prev = tail;
            transfer.followup_next = None;
        } else {
            return;
        }
        match tail.and_then(|t| pool.get_mut(t)) {
            Some(last) => last.followup_next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    /// Unlink `id`; a transfer not on the list is left untouched
    pub(crate) fn remove(&mut self, pool: &mut Pool<Transfer, MAX_TRANSFERS>, id: TransferId) -> bool {
        let (prev, next) = match pool.get_mut(id) {
            Some(transfer) if transfer.list.is_some() => {
                let links = (transfer.followup_prev, transfer.followup_next);
                transfer.list = None;
                transfer.followup_prev = None;
                transfer.followup_next = None;
                links
            }
            _ => return false,
        };
        match prev.and_then(|p| pool.get_mut(p)) {
            Some(before) => before.followup_next = next,
            None => self.head = next,
        }
        match next.and_then(|n| pool.get_mut(n)) {
            Some(after) => after.followup_prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
        true
    }
}
