//! Scripted session for tests

use crate::cursor::{Cursor, CursorTracker, VecCursor};
use crate::error::WarehouseError;
use crate::{QueryContext, Session};
use geoflake_ir::{ColumnDescriptor, Row, TypeCode};
use std::sync::{Arc, Mutex};

/// Build a cursor description from name/type pairs.
pub fn describe(columns: &[(&str, TypeCode)]) -> Vec<ColumnDescriptor> {
    columns
        .iter()
        .enumerate()
        .map(|(ordinal, (name, code))| ColumnDescriptor::new(*name, *code, ordinal))
        .collect()
}

enum Reply {
    Rows {
        description: Vec<ColumnDescriptor>,
        rows: Vec<Row>,
    },
    Fail(WarehouseError),
}

struct Rule {
    pattern: String,
    reply: Reply,
}

/// Mock session for testing
///
/// Replies are chosen by substring match on the SQL text; the first rule
/// registered wins. Unmatched statements fail with code 2003 the way a
/// warehouse reports an unknown object.
pub struct MockSession {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<String>>,
    tracker: Arc<CursorTracker>,
}

impl MockSession {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            tracker: Arc::new(CursorTracker::default()),
        }
    }

    /// Answer statements containing `pattern` with `rows`.
    pub fn on(&self, pattern: &str, columns: &[(&str, TypeCode)], rows: Vec<Row>) -> &Self {
        self.push(
            pattern,
            Reply::Rows {
                description: describe(columns),
                rows,
            },
        )
    }

    /// Fail statements containing `pattern`.
    pub fn fail(&self, pattern: &str, code: i64, message: &str) -> &Self {
        self.push(pattern, Reply::Fail(WarehouseError::new(code, message)))
    }

    fn push(&self, pattern: &str, reply: Reply) -> &Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                pattern: pattern.to_string(),
                reply,
            });
        }
        self
    }

    /// Every statement executed so far, in order.
    pub fn queries(&self) -> Vec<String> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn queries_matching(&self, pattern: &str) -> Vec<String> {
        self.queries()
            .into_iter()
            .filter(|sql| sql.contains(pattern))
            .collect()
    }

    pub fn fetch_many_calls(&self) -> usize {
        self.tracker.fetch_many_calls()
    }

    pub fn open_cursors(&self) -> usize {
        self.tracker.open_cursors()
    }

    pub fn tracker(&self) -> Arc<CursorTracker> {
        self.tracker.clone()
    }
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Session for MockSession {
    fn execute_query(
        &self,
        _connection: &str,
        sql: &str,
        _context: &QueryContext,
    ) -> Result<Box<dyn Cursor>, WarehouseError> {
        if let Ok(mut log) = self.log.lock() {
            log.push(sql.to_string());
        }

        let rules = self
            .rules
            .lock()
            .map_err(|_| WarehouseError::unspecified("mock session poisoned"))?;

        match rules.iter().find(|rule| sql.contains(&rule.pattern)) {
            Some(Rule {
                reply: Reply::Rows { description, rows },
                ..
            }) => Ok(Box::new(
                VecCursor::new(description.clone(), rows.clone()).tracked(self.tracker.clone()),
            )),
            Some(Rule {
                reply: Reply::Fail(err),
                ..
            }) => Err(err.clone()),
            None => Err(WarehouseError::new(
                2003,
                format!("no mock reply registered for: {sql}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geoflake_ir::Value;

    #[test]
    fn test_first_matching_rule_wins() {
        let session = MockSession::new();
        session
            .on("COUNT(*)", &[("N", TypeCode::Fixed)], vec![vec![Value::Int(1)]])
            .on("FROM", &[("N", TypeCode::Fixed)], vec![vec![Value::Int(2)]]);

        let rows = session
            .query_all("c", "SELECT COUNT(*) FROM T", &QueryContext::new())
            .unwrap();
        assert_eq!(rows, vec![vec![Value::Int(1)]]);
        assert_eq!(session.queries(), vec!["SELECT COUNT(*) FROM T"]);
        assert_eq!(session.open_cursors(), 0);
    }

    #[test]
    fn test_failures_and_unmatched() {
        let session = MockSession::new();
        session.fail("H3_IS_VALID_CELL", 100419, "unsupported");

        let err = session
            .execute_query("c", "SELECT H3_IS_VALID_CELL(\"X\")", &QueryContext::new())
            .err()
            .unwrap();
        assert!(err.is_cell_function_unsupported());

        let err = session
            .execute_query("c", "SELECT 1", &QueryContext::new())
            .err()
            .unwrap();
        assert_eq!(err.code, 2003);
    }

    #[test]
    fn test_cursor_description() {
        let session = MockSession::new();
        session.on(
            "LIMIT 0",
            &[("A", TypeCode::Text), ("G", TypeCode::Geometry)],
            vec![],
        );
        let cursor = session
            .execute_query("c", "SELECT * FROM (q) LIMIT 0", &QueryContext::new())
            .unwrap();
        let names: Vec<_> = cursor.description().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["A", "G"]);
        assert_eq!(cursor.description()[1].ordinal, 1);
    }
}
