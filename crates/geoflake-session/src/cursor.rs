//! Cursor trait and the in-memory cursor every bundled session returns

use crate::error::WarehouseError;
use geoflake_ir::{ColumnDescriptor, Row};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Live result handle of an executed statement.
///
/// Implementations must release server-side resources in `close`, and `close`
/// must be safe to call more than once.
pub trait Cursor: Send {
    /// Ordered column name/type pairs of the result.
    fn description(&self) -> &[ColumnDescriptor];

    fn fetch_one(&mut self) -> Result<Option<Row>, WarehouseError>;

    /// Up to `n` rows; fewer (possibly zero) once the result is drained.
    fn fetch_many(&mut self, n: usize) -> Result<Vec<Row>, WarehouseError>;

    fn fetch_all(&mut self) -> Result<Vec<Row>, WarehouseError>;

    fn close(&mut self);
}

/// Counters shared between a session and the cursors it hands out.
#[derive(Debug, Default)]
pub struct CursorTracker {
    opened: AtomicUsize,
    closed: AtomicUsize,
    fetch_many_calls: AtomicUsize,
}

impl CursorTracker {
    pub fn open_cursors(&self) -> usize {
        self.opened
            .load(Ordering::SeqCst)
            .saturating_sub(self.closed.load(Ordering::SeqCst))
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn fetch_many_calls(&self) -> usize {
        self.fetch_many_calls.load(Ordering::SeqCst)
    }

    pub fn reset_fetch_many_calls(&self) {
        self.fetch_many_calls.store(0, Ordering::SeqCst);
    }
}

/// Cursor over rows already held in memory.
pub struct VecCursor {
    description: Vec<ColumnDescriptor>,
    rows: VecDeque<Row>,
    closed: bool,
    tracker: Option<Arc<CursorTracker>>,
}

impl VecCursor {
    pub fn new(description: Vec<ColumnDescriptor>, rows: Vec<Row>) -> Self {
        Self {
            description,
            rows: rows.into(),
            closed: false,
            tracker: None,
        }
    }

    pub fn tracked(mut self, tracker: Arc<CursorTracker>) -> Self {
        tracker.opened.fetch_add(1, Ordering::SeqCst);
        self.tracker = Some(tracker);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), WarehouseError> {
        if self.closed {
            return Err(WarehouseError::cursor_closed());
        }
        Ok(())
    }
}

impl Cursor for VecCursor {
    fn description(&self) -> &[ColumnDescriptor] {
        &self.description
    }

    fn fetch_one(&mut self) -> Result<Option<Row>, WarehouseError> {
        self.ensure_open()?;
        Ok(self.rows.pop_front())
    }

    fn fetch_many(&mut self, n: usize) -> Result<Vec<Row>, WarehouseError> {
        self.ensure_open()?;
        if let Some(tracker) = &self.tracker {
            tracker.fetch_many_calls.fetch_add(1, Ordering::SeqCst);
        }
        let take = n.min(self.rows.len());
        Ok(self.rows.drain(..take).collect())
    }

    fn fetch_all(&mut self) -> Result<Vec<Row>, WarehouseError> {
        self.ensure_open()?;
        Ok(self.rows.drain(..).collect())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.rows.clear();
        if let Some(tracker) = &self.tracker {
            tracker.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for VecCursor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geoflake_ir::{TypeCode, Value};

    fn cursor(n: i64) -> VecCursor {
        let description = vec![ColumnDescriptor::new("ID", TypeCode::Fixed, 0)];
        let rows = (0..n).map(|i| vec![Value::Int(i)]).collect();
        VecCursor::new(description, rows)
    }

    #[test]
    fn test_fetch_many_drains_in_order() {
        let mut c = cursor(7);
        assert_eq!(c.fetch_many(5).unwrap().len(), 5);
        let rest = c.fetch_many(5).unwrap();
        assert_eq!(rest, vec![vec![Value::Int(5)], vec![Value::Int(6)]]);
        assert!(c.fetch_many(5).unwrap().is_empty());
        assert_eq!(c.fetch_one().unwrap(), None);
    }

    #[test]
    fn test_close_is_idempotent_and_tracked() {
        let tracker = Arc::new(CursorTracker::default());
        let mut c = cursor(3).tracked(tracker.clone());
        assert_eq!(tracker.open_cursors(), 1);
        c.close();
        c.close();
        assert_eq!(tracker.open_cursors(), 0);
        assert!(c.fetch_all().is_err());
        drop(c);
        assert_eq!(tracker.open_cursors(), 0);
    }

    #[test]
    fn test_drop_closes() {
        let tracker = Arc::new(CursorTracker::default());
        {
            let _c = cursor(1).tracked(tracker.clone());
            assert_eq!(tracker.open_cursors(), 1);
        }
        assert_eq!(tracker.open_cursors(), 0);
        assert_eq!(tracker.opened(), 1);
    }
}
