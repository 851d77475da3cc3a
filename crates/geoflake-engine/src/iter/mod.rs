//! Feature iterator
//!
//! Streams one composed query in fixed-size batches:
//!
//! ```text
//! Streaming ──fetch──> Streaming ──drained──> Exhausted
//!     │                                          │
//!     └──────────────close──────────> Closed <───┘
//! ```
//!
//! Sources that are already fully loaded are served from memory instead
//! (`Replaying`), applying id and rectangle filters locally.

pub mod cache;

use crate::compose::{self, ComposedQuery, QueryPlan};
use crate::decode::RowDecoder;
use crate::error::{EngineError, Result};
use crate::transform::{bbox_to_source, transform_geometry, CrsTransform, TransformRegistry};
use cache::{MaterializedCache, MaterializedStore};
use geo::Intersects;
use geoflake_ir::{BoundingBox, Feature, FeatureRequest, Field, GeometryColumnSpec, Row, Source};
use geoflake_session::{Cursor, QueryContext, Session};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cooperative cancellation shared with whoever drives a scan.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters of one pass over the result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub batches: u64,
    pub rows_decoded: u64,
    pub rows_skipped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IteratorPhase {
    Streaming,
    Replaying,
    Exhausted,
    Closed,
}

/// What an iterator needs to know about its source.
///
/// A data source keeps one of these and lends it to every iterator it opens.
#[derive(Clone)]
pub struct ScanContext {
    pub session: Arc<dyn Session>,
    pub connection: String,
    pub context: QueryContext,
    pub source: Source,
    pub fields: Vec<Field>,
    pub primary_key: Option<usize>,
    pub subset_filter: Option<String>,
    pub sample_limit: Option<u64>,
    pub batch_size: usize,
    pub transforms: TransformRegistry,
}

impl ScanContext {
    pub fn new(session: Arc<dyn Session>, connection: impl Into<String>, source: Source) -> Self {
        Self {
            session,
            connection: connection.into(),
            context: QueryContext::new(),
            source,
            fields: Vec::new(),
            primary_key: None,
            subset_filter: None,
            sample_limit: None,
            batch_size: 5000,
            transforms: TransformRegistry::new(),
        }
    }
}

enum State {
    Streaming {
        cursor: Box<dyn Cursor>,
        buffer: VecDeque<Row>,
        drained: bool,
    },
    Replaying {
        features: Arc<Vec<Feature>>,
        pos: usize,
    },
    Exhausted,
    Closed,
}

/// Local filtering and shaping applied when replaying loaded features.
struct ReplayFilter {
    features: Arc<Vec<Feature>>,
    ids: Option<Vec<i64>>,
    /// In the source CRS
    bbox: Option<BoundingBox>,
    /// Indexes into the cached attribute list
    attributes: Option<Vec<usize>>,
    no_geometry: bool,
}

impl ReplayFilter {
    fn apply(&self, feature: &Feature, transform: Option<&dyn CrsTransform>) -> Option<Feature> {
        if let Some(ids) = &self.ids {
            if !ids.contains(&feature.id) {
                return None;
            }
        }
        if let Some(bbox) = &self.bbox {
            let rect = bbox.to_rect();
            match &feature.geometry {
                Some(geometry) if geometry.intersects(&rect) => {}
                _ => return None,
            }
        }

        let attributes = match &self.attributes {
            Some(indexes) => indexes
                .iter()
                .filter_map(|&i| feature.attributes.get(i).cloned())
                .collect(),
            None => feature.attributes.clone(),
        };
        let geometry = if self.no_geometry {
            None
        } else {
            match (&feature.geometry, transform) {
                (Some(g), Some(t)) => Some(transform_geometry(g, t)),
                (g, None) => g.clone(),
                (None, _) => None,
            }
        };
        Some(Feature {
            id: feature.id,
            geometry,
            attributes,
        })
    }
}

/// Where a finished unfiltered scan is published.
struct Publish {
    store: Arc<MaterializedStore>,
    generation: u64,
}

/// Lazy stream of decoded features for one request.
pub struct FeatureIterator {
    id: Uuid,
    session: Arc<dyn Session>,
    connection: String,
    context: QueryContext,
    spec: Arc<GeometryColumnSpec>,
    query: Option<ComposedQuery>,
    decoder: Option<RowDecoder>,
    replay: Option<ReplayFilter>,
    transform: Option<Arc<dyn CrsTransform>>,
    batch_size: usize,
    state: State,
    cache: MaterializedCache,
    publish: Option<Publish>,
    position: u64,
    stats: ScanStats,
    cancel: CancelFlag,
}

/// Open an iterator over `scan` for `request`.
///
/// Fails with [`EngineError::MissingGeometrySpec`] when no geometry column
/// was resolved.
pub fn open_iterator(
    scan: &ScanContext,
    spec: Option<Arc<GeometryColumnSpec>>,
    request: &FeatureRequest,
) -> Result<FeatureIterator> {
    FeatureIterator::open(scan, spec, request)
}

impl FeatureIterator {
    pub fn open(
        scan: &ScanContext,
        spec: Option<Arc<GeometryColumnSpec>>,
        request: &FeatureRequest,
    ) -> Result<Self> {
        let spec = spec.ok_or(EngineError::MissingGeometrySpec)?;
        let (query, transform) = plan_query(scan, &spec, request)?;
        let decoder = RowDecoder::new(
            query.layout.clone(),
            &scan.fields,
            spec.encoding,
            transform.clone(),
        );

        let mut iter = Self::empty(scan, spec, transform);
        iter.query = Some(query);
        iter.decoder = Some(decoder);
        iter.state = iter.execute()?;
        Ok(iter)
    }

    /// Serve `features` (a complete load of the source) without querying.
    pub fn replay(
        scan: &ScanContext,
        spec: Option<Arc<GeometryColumnSpec>>,
        features: Arc<Vec<Feature>>,
        request: &FeatureRequest,
    ) -> Result<Self> {
        let spec = spec.ok_or(EngineError::MissingGeometrySpec)?;
        let transform = scan
            .transforms
            .between(spec.srid, request.destination_srid)?;
        let attributes = match request.subset_of_attributes {
            Some(_) => Some(compose::output_attributes(
                &scan.fields,
                scan.primary_key,
                request,
            )?),
            None => None,
        };
        let filter = ReplayFilter {
            features: features.clone(),
            ids: request.feature_ids.clone(),
            bbox: source_bbox(request, transform.as_deref()),
            attributes,
            no_geometry: request.no_geometry,
        };

        let mut iter = Self::empty(scan, spec, transform);
        iter.replay = Some(filter);
        iter.state = State::Replaying { features, pos: 0 };
        debug!(iterator = %iter.id, "Replaying loaded features");
        Ok(iter)
    }

    fn empty(
        scan: &ScanContext,
        spec: Arc<GeometryColumnSpec>,
        transform: Option<Arc<dyn CrsTransform>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session: scan.session.clone(),
            connection: scan.connection.clone(),
            context: scan.context.clone(),
            spec,
            query: None,
            decoder: None,
            replay: None,
            transform,
            batch_size: scan.batch_size.max(1),
            state: State::Exhausted,
            cache: MaterializedCache::new(),
            publish: None,
            position: 0,
            stats: ScanStats::default(),
            cancel: CancelFlag::new(),
        }
    }

    /// Publish the complete result to `store` when the scan finishes.
    ///
    /// Only meaningful for unfiltered requests; the caller decides.
    pub fn publish_to(mut self, store: Arc<MaterializedStore>) -> Self {
        let generation = store.generation();
        self.publish = Some(Publish { store, generation });
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    fn execute(&self) -> Result<State> {
        let Some(query) = &self.query else {
            return Ok(State::Exhausted);
        };
        let sql = query.to_sql();
        info!(
            iterator = %self.id,
            fingerprint = %query.fingerprint(),
            column = %self.spec.column,
            "Executing feature query"
        );
        let cursor = self
            .session
            .execute_query(&self.connection, &sql, &self.context)?;
        Ok(State::Streaming {
            cursor,
            buffer: VecDeque::new(),
            drained: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> IteratorPhase {
        match self.state {
            State::Streaming { .. } => IteratorPhase::Streaming,
            State::Replaying { .. } => IteratorPhase::Replaying,
            State::Exhausted => IteratorPhase::Exhausted,
            State::Closed => IteratorPhase::Closed,
        }
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    pub fn query(&self) -> Option<&ComposedQuery> {
        self.query.as_ref()
    }

    pub fn geometry_spec(&self) -> &GeometryColumnSpec {
        &self.spec
    }

    /// Geometries are reprojected to a destination CRS.
    pub fn reprojects(&self) -> bool {
        self.transform.is_some()
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Next feature, or `None` once exhausted, closed or cancelled.
    ///
    /// Rows that fail to decode are logged and skipped. Warehouse errors
    /// while refilling are returned and leave the iterator where it was.
    pub fn fetch_next(&mut self) -> Result<Option<Feature>> {
        loop {
            match &mut self.state {
                State::Exhausted | State::Closed => return Ok(None),
                State::Replaying { features, pos } => {
                    let filter = self.replay.as_ref();
                    while *pos < features.len() {
                        let candidate = &features[*pos];
                        *pos += 1;
                        let shaped = match filter {
                            Some(filter) => filter.apply(candidate, self.transform.as_deref()),
                            None => Some(candidate.clone()),
                        };
                        if let Some(feature) = shaped {
                            self.stats.rows_decoded += 1;
                            self.cache.push(feature.clone());
                            return Ok(Some(feature));
                        }
                    }
                    self.finish();
                    return Ok(None);
                }
                State::Streaming {
                    cursor,
                    buffer,
                    drained,
                } => {
                    if let Some(row) = buffer.pop_front() {
                        if let Some(feature) = self.decode(row) {
                            return Ok(Some(feature));
                        }
                        continue;
                    }
                    if *drained {
                        self.finish();
                        return Ok(None);
                    }
                    if self.cancel.is_cancelled() {
                        info!(iterator = %self.id, "Scan cancelled");
                        self.close();
                        return Ok(None);
                    }

                    let batch = cursor.fetch_many(self.batch_size)?;
                    self.stats.batches += 1;
                    // A short batch means the cursor has nothing left
                    if batch.len() < self.batch_size {
                        *drained = true;
                    }
                    debug!(iterator = %self.id, rows = batch.len(), "Fetched batch");
                    buffer.extend(batch);
                }
            }
        }
    }

    fn decode(&mut self, row: Row) -> Option<Feature> {
        let position = self.position;
        self.position += 1;
        let decoder = self.decoder.as_ref()?;
        match decoder.decode(row, position) {
            Ok(feature) => {
                self.stats.rows_decoded += 1;
                self.cache.push(feature.clone());
                Some(feature)
            }
            Err(err) => {
                self.stats.rows_skipped += 1;
                warn!(iterator = %self.id, position, error = %err, "Skipping undecodable row");
                None
            }
        }
    }

    fn finish(&mut self) {
        if let State::Streaming { cursor, .. } = &mut self.state {
            cursor.close();
        }
        self.state = State::Exhausted;
        self.cache.mark_complete();

        if let Some(publish) = &self.publish {
            if publish
                .store
                .publish(publish.generation, self.cache.snapshot())
            {
                debug!(iterator = %self.id, features = self.cache.len(), "Source fully loaded");
            }
        }

        info!(
            iterator = %self.id,
            batches = self.stats.batches,
            rows_decoded = self.stats.rows_decoded,
            rows_skipped = self.stats.rows_skipped,
            "Scan complete"
        );
    }

    /// Restart from the first feature.
    ///
    /// A streaming iterator re-executes the same statement and discards its
    /// cache. A published store is invalidated and re-armed, so the source
    /// counts as loaded again only once this pass completes. Returns `false`
    /// on a closed iterator, which stays closed.
    pub fn rewind(&mut self) -> Result<bool> {
        match &mut self.state {
            State::Closed => return Ok(false),
            State::Streaming { cursor, .. } => cursor.close(),
            State::Replaying { .. } | State::Exhausted => {}
        }

        if let Some(publish) = &mut self.publish {
            publish.store.invalidate();
            publish.generation = publish.store.generation();
        }
        self.cache.reset();
        self.position = 0;
        self.stats = ScanStats::default();
        self.state = match &self.replay {
            Some(filter) => State::Replaying {
                features: filter.features.clone(),
                pos: 0,
            },
            None => {
                self.state = State::Exhausted;
                self.execute()?
            }
        };
        debug!(iterator = %self.id, "Rewound");
        Ok(true)
    }

    /// Release the cursor. Safe in any state, any number of times.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Streaming { mut cursor, .. } => {
                cursor.close();
                debug!(iterator = %self.id, "Closed");
            }
            State::Replaying { .. } | State::Exhausted | State::Closed => {}
        }
    }

    /// Features yielded so far, once the scan has visited every row.
    pub fn take_materialized(&mut self) -> Option<Vec<Feature>> {
        self.cache.take_complete()
    }

    /// Feature at `position` in this iterator's output order.
    ///
    /// Already-yielded features come from the local cache; otherwise the
    /// scan advances until the position is reached or the result ends.
    pub fn feature_at(&mut self, position: usize) -> Result<Option<Feature>> {
        while self.cache.len() <= position {
            if self.fetch_next()?.is_none() {
                break;
            }
        }
        Ok(self.cache.get(position).cloned())
    }

    /// Drain the rest of the scan.
    pub fn collect_remaining(&mut self) -> Result<Vec<Feature>> {
        let mut out = Vec::new();
        while let Some(feature) = self.fetch_next()? {
            out.push(feature);
        }
        Ok(out)
    }
}

impl Iterator for FeatureIterator {
    type Item = Result<Feature>;

    fn next(&mut self) -> Option<Self::Item> {
        self.fetch_next().transpose()
    }
}

impl Drop for FeatureIterator {
    fn drop(&mut self) {
        self.close();
    }
}

/// Compose the statement `FeatureIterator::open` would run for `request`.
///
/// Also returns the transform from the source CRS to the requested one.
pub fn plan_query(
    scan: &ScanContext,
    spec: &GeometryColumnSpec,
    request: &FeatureRequest,
) -> Result<(ComposedQuery, Option<Arc<dyn CrsTransform>>)> {
    let transform = scan
        .transforms
        .between(spec.srid, request.destination_srid)?;
    let bbox = source_bbox(request, transform.as_deref());

    let from = scan.source.from_clause();
    let expression = request.expression.as_deref().filter(|expr| {
        compose::validate_expression(
            scan.session.as_ref(),
            &scan.connection,
            &scan.context,
            &from,
            expr,
        )
    });

    let plan = QueryPlan {
        source: &scan.source,
        fields: &scan.fields,
        primary_key: scan.primary_key,
        geometry: spec,
        subset_filter: scan.subset_filter.as_deref(),
        sample_limit: scan.sample_limit,
    };
    let query = compose::compose(&plan, request, expression, bbox.as_ref())?;
    Ok((query, transform))
}

fn source_bbox(
    request: &FeatureRequest,
    transform: Option<&dyn CrsTransform>,
) -> Option<BoundingBox> {
    let rect = request.filter_rect?;
    if rect.is_empty() {
        return None;
    }
    Some(match transform {
        Some(transform) => bbox_to_source(&rect, transform),
        None => rect,
    })
}

/// Whether a finished scan of `request` is the complete source.
pub fn is_unfiltered(request: &FeatureRequest) -> bool {
    request.filter_rect.is_none()
        && request.expression.is_none()
        && request.feature_ids.is_none()
        && request.subset_of_attributes.is_none()
        && !request.no_geometry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::wkb::write_wkb;
    use geo_types::{Geometry, Point};
    use geoflake_ir::{Encoding, GeometryKind, TypeCode, Value};
    use geoflake_session::MockSession;

    fn point_rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let wkb = write_wkb(&Geometry::Point(Point::new(i as f64, 0.0)));
                vec![
                    Value::Int(i as i64),
                    Value::Binary(wkb),
                    Value::Null,
                    Value::Int(i as i64 + 1),
                ]
            })
            .collect()
    }

    fn setup(rows: Vec<Row>) -> (Arc<MockSession>, ScanContext, Arc<GeometryColumnSpec>) {
        let session = Arc::new(MockSession::new());
        session.on(
            "geoflake_row_number",
            &[
                ("V", TypeCode::Fixed),
                ("geoflake_geometry", TypeCode::Binary),
                ("G", TypeCode::Geometry),
                ("geoflake_row_number", TypeCode::Fixed),
            ],
            rows,
        );
        let mut scan = ScanContext::new(session.clone(), "c", Source::table(None, "PTS"));
        scan.fields = vec![Field::new("V", "NUMBER")];
        let spec = Arc::new(
            GeometryColumnSpec::new("G", Encoding::Geometry)
                .with_kind(GeometryKind::Point)
                .with_srid(4326),
        );
        (session, scan, spec)
    }

    #[test]
    fn test_batches_until_short() {
        let (session, mut scan, spec) = setup(point_rows(25));
        scan.batch_size = 10;
        let mut iter = open_iterator(&scan, Some(spec), &FeatureRequest::new()).unwrap();
        assert_eq!(iter.phase(), IteratorPhase::Streaming);

        let ids: Vec<i64> = iter.collect_remaining().unwrap().iter().map(|f| f.id).collect();
        assert_eq!(ids, (1..=25).collect::<Vec<_>>());
        assert_eq!(session.fetch_many_calls(), 3);
        assert_eq!(iter.phase(), IteratorPhase::Exhausted);
        assert_eq!(iter.stats().batches, 3);
        assert_eq!(session.open_cursors(), 0);
    }

    #[test]
    fn test_missing_spec() {
        let (_, scan, _) = setup(vec![]);
        assert!(matches!(
            open_iterator(&scan, None, &FeatureRequest::new()),
            Err(EngineError::MissingGeometrySpec)
        ));
    }

    #[test]
    fn test_bad_rows_skipped() {
        let mut rows = point_rows(3);
        rows[1][1] = Value::Binary(vec![1, 2, 3]);
        let (_, scan, spec) = setup(rows);
        let mut iter = open_iterator(&scan, Some(spec), &FeatureRequest::new()).unwrap();
        let features = iter.collect_remaining().unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(iter.stats().rows_skipped, 1);
    }

    #[test]
    fn test_cancel_stops_scan() {
        let (session, mut scan, spec) = setup(point_rows(30));
        scan.batch_size = 10;
        let mut iter = open_iterator(&scan, Some(spec), &FeatureRequest::new()).unwrap();
        let cancel = iter.cancel_flag();
        assert!(iter.fetch_next().unwrap().is_some());
        cancel.cancel();
        // The current batch is still served
        let rest = iter.collect_remaining().unwrap();
        assert_eq!(rest.len(), 9);
        assert_eq!(iter.phase(), IteratorPhase::Closed);
        assert_eq!(session.open_cursors(), 0);
    }

    #[test]
    fn test_feature_at_uses_cache() {
        let (session, scan, spec) = setup(point_rows(5));
        let mut iter = open_iterator(&scan, Some(spec), &FeatureRequest::new()).unwrap();
        assert_eq!(iter.feature_at(3).unwrap().map(|f| f.id), Some(4));
        assert_eq!(iter.feature_at(1).unwrap().map(|f| f.id), Some(2));
        assert_eq!(iter.feature_at(10).unwrap(), None);
        assert_eq!(session.queries_matching("geoflake_row_number").len(), 1);
    }

    #[test]
    fn test_replay_filters_locally() {
        let (session, scan, spec) = setup(vec![]);
        let features: Vec<Feature> = (0..5)
            .map(|i| Feature {
                id: i,
                geometry: Some(Geometry::Point(Point::new(i as f64, 0.0))),
                attributes: vec![Value::Int(i)],
            })
            .collect();
        let request = FeatureRequest::new()
            .with_filter_rect(BoundingBox::new(0.5, -1.0, 3.5, 1.0))
            .with_feature_ids(vec![1, 3, 4]);
        let mut iter =
            FeatureIterator::replay(&scan, Some(spec), Arc::new(features), &request).unwrap();
        assert_eq!(iter.phase(), IteratorPhase::Replaying);
        let ids: Vec<i64> = iter.collect_remaining().unwrap().iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(session.queries().is_empty());

        assert!(iter.rewind().unwrap());
        assert_eq!(iter.collect_remaining().unwrap().len(), 2);
    }

    #[test]
    fn test_publish_on_completion() {
        let (_, scan, spec) = setup(point_rows(4));
        let store = Arc::new(MaterializedStore::new());
        let mut iter = open_iterator(&scan, Some(spec), &FeatureRequest::new())
            .unwrap()
            .publish_to(store.clone());
        assert!(iter.fetch_next().unwrap().is_some());
        assert!(!store.is_loaded());
        iter.collect_remaining().unwrap();
        assert_eq!(store.loaded().unwrap().len(), 4);
        assert_eq!(iter.take_materialized().map(|f| f.len()), Some(4));
    }

    #[test]
    fn test_rewind_invalidates_published_store() {
        let (_, scan, spec) = setup(point_rows(4));
        let store = Arc::new(MaterializedStore::new());
        let mut iter = open_iterator(&scan, Some(spec), &FeatureRequest::new())
            .unwrap()
            .publish_to(store.clone());
        iter.collect_remaining().unwrap();
        assert!(store.is_loaded());

        assert!(iter.rewind().unwrap());
        assert!(!store.is_loaded());
        assert!(iter.fetch_next().unwrap().is_some());
        assert!(!store.is_loaded());

        iter.collect_remaining().unwrap();
        assert_eq!(store.loaded().unwrap().len(), 4);
    }

    #[test]
    fn test_unfiltered_requests() {
        assert!(is_unfiltered(&FeatureRequest::new()));
        assert!(is_unfiltered(&FeatureRequest::new().with_destination_srid(3857)));
        assert!(!is_unfiltered(&FeatureRequest::new().with_feature_ids(vec![])));
        assert!(!is_unfiltered(&FeatureRequest::new().without_geometry()));
    }
}
