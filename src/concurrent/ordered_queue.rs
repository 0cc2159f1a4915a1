//! Ordered reassembly queue.
//!
//! Items arrive in any order, tagged with an `(order, sub_order)` key, and
//! leave strictly in ascending key order.  The queue keeps a release cursor:
//! the one key that may be dequeued next.  A primary `order` may span a
//! variable number of sub-orders; the cursor only moves on to `order + 1`
//! once that order's last sub-order is both known and released.  Until the
//! bound is known the cursor simply steps to the next sub-order.
//!
//! # Invariants
//! - A key is inserted at most once, and never behind the cursor.
//! - The cursor advances only by releasing the exact key it points at, or by
//!   closing an order whose final sub-order was already released.
//! - An order's last sub-order is fixed at most once and is never below a
//!   sub-order that has been queued or released.
//!
//! Violations are programming errors in the producer and are reported as
//! [`QueueError`], never silently absorbed.
//!
//! Every operation runs under one lock, so inserts, releases and bound
//! updates never interleave partially.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::debug;

/// `(order, sub_order)`.
pub type OrderKey = (u64, u32);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("block {order}:{sub_order} is already queued")]
    DuplicateKey { order: u64, sub_order: u32 },
    #[error("block {order}:{sub_order} is behind the release cursor {cursor_order}:{cursor_sub_order}")]
    BehindCursor { order: u64, sub_order: u32, cursor_order: u64, cursor_sub_order: u32 },
    #[error("order {order} already ends at sub-order {existing}, cannot end it at {requested}")]
    BoundConflict { order: u64, existing: u32, requested: u32 },
    #[error("order {order} cannot end at sub-order {bound}: sub-order {queued} is already queued")]
    BoundBelowQueued { order: u64, bound: u32, queued: u32 },
    #[error("block {order}:{sub_order} lies past the last sub-order {bound} of its order")]
    BeyondBound { order: u64, sub_order: u32, bound: u32 },
}

#[derive(Debug)]
struct Inner<T> {
    items:    BTreeMap<OrderKey, T>,
    last_sub: HashMap<u64, u32>,
    cursor:   OrderKey,
}

impl<T> Inner<T> {
    fn behind_cursor(&self, order: u64, sub_order: u32) -> QueueError {
        QueueError::BehindCursor {
            order,
            sub_order,
            cursor_order:     self.cursor.0,
            cursor_sub_order: self.cursor.1,
        }
    }

    fn highest_queued_sub(&self, order: u64) -> Option<u32> {
        self.items
            .range((order, 0)..=(order, u32::MAX))
            .next_back()
            .map(|(&(_, sub), _)| sub)
    }
}

#[derive(Debug)]
pub struct OrderedQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for OrderedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OrderedQueue<T> {
    pub fn new() -> Self {
        OrderedQueue {
            inner: Mutex::new(Inner {
                items:    BTreeMap::new(),
                last_sub: HashMap::new(),
                cursor:   (0, 0),
            }),
        }
    }

    /// Queue a single-item order: `(order, 0)`, which is also its last sub-order.
    pub fn enqueue_single(&self, order: u64, item: T) -> Result<(), QueueError> {
        self.enqueue(order, 0, item, true)
    }

    /// Queue `item` under `(order, sub_order)`.  With `is_last` the order is
    /// closed at `sub_order`.
    pub fn enqueue(&self, order: u64, sub_order: u32, item: T, is_last: bool) -> Result<(), QueueError> {
        let mut q = self.inner.lock();
        let key = (order, sub_order);

        if key < q.cursor {
            return Err(q.behind_cursor(order, sub_order));
        }
        if q.items.contains_key(&key) {
            return Err(QueueError::DuplicateKey { order, sub_order });
        }
        match q.last_sub.get(&order).copied() {
            Some(bound) if is_last && bound != sub_order => {
                return Err(QueueError::BoundConflict { order, existing: bound, requested: sub_order });
            }
            Some(bound) if sub_order > bound => {
                return Err(QueueError::BeyondBound { order, sub_order, bound });
            }
            Some(_) => {}
            None if is_last => {
                if let Some(queued) = q.highest_queued_sub(order).filter(|&s| s > sub_order) {
                    return Err(QueueError::BoundBelowQueued { order, bound: sub_order, queued });
                }
                q.last_sub.insert(order, sub_order);
            }
            None => {}
        }

        q.items.insert(key, item);
        debug!(order, sub_order, is_last, queued = q.items.len(), "block enqueued");
        Ok(())
    }

    /// Close `order` at `sub_order` without inserting anything.
    ///
    /// Used by producers that only learn how many sub-items they emitted
    /// after emitting the last one.  If everything up to `sub_order` has
    /// already been released, the cursor moves straight on to `order + 1`.
    ///
    /// This is the one bound that may arrive after the cursor has reached
    /// it: a cursor sitting at `(order, sub_order + 1)` is not treated as
    /// `BehindCursor` the way a late `enqueue` would be, since the cursor has
    /// not passed anything the bound excludes.  A bound strictly below a
    /// released sub-order still faults.
    pub fn set_last_sub_order(&self, order: u64, sub_order: u32) -> Result<(), QueueError> {
        let mut q = self.inner.lock();

        if let Some(existing) = q.last_sub.get(&order).copied() {
            return if existing == sub_order {
                Ok(())
            } else {
                Err(QueueError::BoundConflict { order, existing, requested: sub_order })
            };
        }

        let (cursor_order, cursor_sub) = q.cursor;
        let released_past_bound = order == cursor_order && cursor_sub > sub_order.saturating_add(1);
        if order < cursor_order || released_past_bound {
            return Err(q.behind_cursor(order, sub_order));
        }
        if let Some(queued) = q.highest_queued_sub(order).filter(|&s| s > sub_order) {
            return Err(QueueError::BoundBelowQueued { order, bound: sub_order, queued });
        }

        if order == cursor_order && cursor_sub == sub_order.saturating_add(1) {
            q.cursor = (order + 1, 0);
            debug!(order, sub_order, "order closed after release");
        } else {
            q.last_sub.insert(order, sub_order);
            debug!(order, sub_order, "order bound set");
        }
        Ok(())
    }

    /// Release the item at the cursor, if it has arrived.  Never blocks.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut q = self.inner.lock();
        let key = q.cursor;
        let item = q.items.remove(&key)?;

        let (order, sub_order) = key;
        if q.last_sub.get(&order) == Some(&sub_order) {
            q.last_sub.remove(&order);
            q.cursor = (order + 1, 0);
        } else {
            q.cursor = (order, sub_order.saturating_add(1));
        }
        debug!(order, sub_order, queued = q.items.len(), "block dequeued");
        Some(item)
    }

    /// Items buffered and not yet released.
    pub fn size(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// The next key eligible for release.
    pub fn cursor(&self) -> OrderKey {
        self.inner.lock().cursor
    }

    /// Number of primary orders fully released.
    pub fn completed_orders(&self) -> u64 {
        self.inner.lock().cursor.0
    }

    /// Drop every buffered item and bound and rewind the cursor to `(0, 0)`.
    /// Only for tearing a finished or cancelled run down.
    pub fn clear(&self) {
        let mut q = self.inner.lock();
        q.items.clear();
        q.last_sub.clear();
        q.cursor = (0, 0);
    }
}
