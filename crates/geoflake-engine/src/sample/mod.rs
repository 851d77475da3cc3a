//! Size guard
//!
//! Caps what a single scan can pull from the warehouse. Sources at or above
//! the cap for their encoding are marked limited/unordered and scanned as a
//! random sample instead of a positional prefix, which would be a biased
//! geographic subset.

use crate::config::EngineConfig;
use crate::error::Result;
use geoflake_ir::{Encoding, Row};
use geoflake_session::{QueryContext, Session};
use tracing::debug;

/// Outcome of the open-time size check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampling {
    pub row_count: u64,
    /// Row limit of the random sample, when one is needed
    pub limit: Option<u64>,
}

impl Sampling {
    pub fn is_limited(&self) -> bool {
        self.limit.is_some()
    }

    /// Trailing clause appended after every filter.
    pub fn clause(&self) -> Option<String> {
        self.limit.map(sampling_clause)
    }
}

pub struct SizeGuard<'a> {
    config: &'a EngineConfig,
}

impl<'a> SizeGuard<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    pub fn sample_limit(&self, encoding: Encoding) -> u64 {
        self.config.row_cap(encoding)
    }

    pub fn needs_sampling(&self, encoding: Encoding, row_count: u64) -> bool {
        row_count >= self.sample_limit(encoding)
    }

    /// Count the rows behind `from` and decide whether scans must sample.
    pub fn assess(
        &self,
        session: &dyn Session,
        connection: &str,
        context: &QueryContext,
        from: &str,
        encoding: Encoding,
    ) -> Result<Sampling> {
        let row_count = count_rows(session, connection, context, from)?;
        let limit = self
            .needs_sampling(encoding, row_count)
            .then(|| self.sample_limit(encoding));
        debug!(from = %from, row_count, ?limit, "Assessed source size");
        Ok(Sampling { row_count, limit })
    }
}

pub fn sampling_clause(limit: u64) -> String {
    format!(" ORDER BY RANDOM() LIMIT {limit}")
}

/// `count(*)` over a FROM clause (table name or parenthesized query).
pub fn count_rows(
    session: &dyn Session,
    connection: &str,
    context: &QueryContext,
    from: &str,
) -> Result<u64> {
    let sql = format!("SELECT COUNT(*) FROM {from}");
    let rows = session.query_all(connection, &sql, context)?;
    Ok(first_count(&rows))
}

/// Whether `from` holds at least `limit` rows.
pub fn exceeds_size(
    session: &dyn Session,
    connection: &str,
    context: &QueryContext,
    from: &str,
    limit: u64,
) -> Result<bool> {
    Ok(count_rows(session, connection, context, from)? >= limit)
}

pub(crate) fn first_count(rows: &[Row]) -> u64 {
    rows.first()
        .and_then(|row| row.first())
        .and_then(|v| v.as_i64())
        .map(|n| n.max(0) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geoflake_ir::{TypeCode, Value};
    use geoflake_session::MockSession;

    fn counting(n: i64) -> MockSession {
        let session = MockSession::new();
        session.on("COUNT(*)", &[("N", TypeCode::Fixed)], vec![vec![Value::Int(n)]]);
        session
    }

    #[test]
    fn test_caps_by_encoding() {
        let config = EngineConfig::default();
        let guard = SizeGuard::new(&config);
        assert_eq!(guard.sample_limit(Encoding::CellId), 500_000);
        assert_eq!(guard.sample_limit(Encoding::Geometry), 50_000);
        assert!(!guard.needs_sampling(Encoding::Geometry, 49_999));
        assert!(guard.needs_sampling(Encoding::Geometry, 50_000));
        assert!(!guard.needs_sampling(Encoding::CellId, 50_000));
        assert!(guard.needs_sampling(Encoding::CellId, 500_000));
    }

    #[test]
    fn test_assess_below_and_at_cap() {
        let config = EngineConfig::default();
        let guard = SizeGuard::new(&config);
        let context = QueryContext::new();

        let below = guard
            .assess(&counting(49_999), "c", &context, "\"T\"", Encoding::Geography)
            .unwrap();
        assert_eq!(below.limit, None);
        assert_eq!(below.clause(), None);

        let at = guard
            .assess(&counting(50_000), "c", &context, "\"T\"", Encoding::Geography)
            .unwrap();
        assert!(at.is_limited());
        assert_eq!(at.clause().as_deref(), Some(" ORDER BY RANDOM() LIMIT 50000"));
    }

    #[test]
    fn test_exceeds_size() {
        let context = QueryContext::new();
        let session = counting(10);
        assert!(exceeds_size(&session, "c", &context, "(SELECT 1)", 10).unwrap());
        assert!(!exceeds_size(&session, "c", &context, "(SELECT 1)", 11).unwrap());
        assert_eq!(session.queries(), vec!["SELECT COUNT(*) FROM (SELECT 1)"; 2]);
    }
}
