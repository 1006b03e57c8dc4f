//! Latest-Wins Cell
//!
//! A single-slot buffer between one producer and one consumer. Publishing
//! never blocks: a value that has not been read yet is overwritten by the
//! next one. The consumer therefore always sees the freshest value and never
//! a backlog.
//!
//! The cell also carries how the stream ended. A buffered value is still
//! delivered before the terminal outcome, so values published before a
//! failure are not lost.

use std::task::{Context, Poll};

use futures_util::task::AtomicWaker;
use parking_lot::Mutex;

/// What happened to a published value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// The slot was empty.
    Stored,
    /// An unread value was overwritten.
    Overwrote,
    /// The cell is finished or its consumer is gone; the value was dropped.
    Rejected,
}

#[derive(Debug)]
enum Terminal<E> {
    Open,
    Finished,
    Failed(E),
    /// The terminal outcome has been handed to the consumer.
    Delivered,
}

#[derive(Debug)]
struct Slot<T, E> {
    value: Option<T>,
    terminal: Terminal<E>,
}

/// Single-slot, overwrite-on-full buffer with a waiting-reader wakeup.
#[derive(Debug)]
pub struct LatestCell<T, E> {
    slot: Mutex<Slot<T, E>>,
    reader: AtomicWaker,
}

impl<T, E> LatestCell<T, E> {
    /// An empty, open cell.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                terminal: Terminal::Open,
            }),
            reader: AtomicWaker::new(),
        }
    }

    /// Store `value`, replacing any unread one.
    pub fn publish(&self, value: T) -> Publish {
        let outcome = {
            let mut slot = self.slot.lock();
            if !matches!(slot.terminal, Terminal::Open) {
                return Publish::Rejected;
            }
            match slot.value.replace(value) {
                Some(_) => Publish::Overwrote,
                None => Publish::Stored,
            }
        };
        self.reader.wake();
        outcome
    }

    /// End the stream. Only the first call has any effect.
    pub fn finish(&self, result: Result<(), E>) {
        {
            let mut slot = self.slot.lock();
            if !matches!(slot.terminal, Terminal::Open) {
                return;
            }
            slot.terminal = match result {
                Ok(()) => Terminal::Finished,
                Err(err) => Terminal::Failed(err),
            };
        }
        self.reader.wake();
    }

    /// End the stream and drop any unread value.
    pub fn close(&self) {
        {
            let mut slot = self.slot.lock();
            slot.value = None;
            if matches!(slot.terminal, Terminal::Open | Terminal::Failed(_)) {
                slot.terminal = Terminal::Finished;
            }
        }
        self.reader.wake();
    }

    /// Whether a value is waiting to be read.
    pub fn has_value(&self) -> bool {
        self.slot.lock().value.is_some()
    }

    /// Take the buffered value, the terminal outcome, or register for a
    /// wakeup.
    pub fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Option<Result<T, E>>> {
        // Register before looking so a concurrent publish cannot be missed.
        self.reader.register(cx.waker());

        let mut slot = self.slot.lock();
        if let Some(value) = slot.value.take() {
            return Poll::Ready(Some(Ok(value)));
        }
        match std::mem::replace(&mut slot.terminal, Terminal::Delivered) {
            Terminal::Open => {
                slot.terminal = Terminal::Open;
                Poll::Pending
            }
            Terminal::Failed(err) => Poll::Ready(Some(Err(err))),
            Terminal::Finished | Terminal::Delivered => Poll::Ready(None),
        }
    }
}

impl<T, E> Default for LatestCell<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::poll_fn;
    use futures_util::FutureExt;
    use std::sync::Arc;

    type Cell = LatestCell<u32, &'static str>;

    fn take_now(cell: &Cell) -> Option<Option<Result<u32, &'static str>>> {
        poll_fn(|cx| cell.poll_take(cx)).now_or_never()
    }

    #[test]
    fn empty_cell_is_pending() {
        let cell = Cell::new();
        assert_eq!(take_now(&cell), None);
        assert!(!cell.has_value());
    }

    #[test]
    fn newer_value_overwrites_unread_one() {
        let cell = Cell::new();
        assert_eq!(cell.publish(1), Publish::Stored);
        assert_eq!(cell.publish(2), Publish::Overwrote);
        assert_eq!(cell.publish(3), Publish::Overwrote);

        assert_eq!(take_now(&cell), Some(Some(Ok(3))));
        assert_eq!(take_now(&cell), None);

        assert_eq!(cell.publish(4), Publish::Stored);
        assert_eq!(take_now(&cell), Some(Some(Ok(4))));
    }

    #[test]
    fn buffered_value_is_delivered_before_failure() {
        let cell = Cell::new();
        cell.publish(1);
        cell.finish(Err("broken"));

        assert_eq!(take_now(&cell), Some(Some(Ok(1))));
        assert_eq!(take_now(&cell), Some(Some(Err("broken"))));
        assert_eq!(take_now(&cell), Some(None));
        assert_eq!(take_now(&cell), Some(None));
    }

    #[test]
    fn only_first_finish_counts() {
        let cell = Cell::new();
        cell.finish(Ok(()));
        cell.finish(Err("late"));
        assert_eq!(take_now(&cell), Some(None));
    }

    #[test]
    fn publish_after_finish_is_rejected() {
        let cell = Cell::new();
        cell.finish(Ok(()));
        assert_eq!(cell.publish(1), Publish::Rejected);
        assert_eq!(take_now(&cell), Some(None));
    }

    #[test]
    fn close_discards_unread_value() {
        let cell = Cell::new();
        cell.publish(1);
        cell.close();
        assert_eq!(cell.publish(2), Publish::Rejected);
        assert_eq!(take_now(&cell), Some(None));
    }

    #[tokio::test]
    async fn waiting_reader_is_woken() {
        let cell = Arc::new(Cell::new());
        let reader = {
            let cell = Arc::clone(&cell);
            tokio::spawn(async move { poll_fn(|cx| cell.poll_take(cx)).await })
        };

        tokio::task::yield_now().await;
        cell.publish(9);

        assert_eq!(reader.await.unwrap(), Some(Ok(9)));
    }
}
