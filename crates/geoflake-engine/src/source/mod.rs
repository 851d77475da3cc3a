//! Data source: one table or query exposed as a feature layer
//!
//! Everything derived from the warehouse (geometry spec, attribute schema,
//! sampling decision) is resolved once in [`DataSource::open`]. Feature count
//! and extent are cached until the subset filter changes.

use crate::compose::{self, kind_guard, ComposedQuery};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::iter::cache::MaterializedStore;
use crate::iter::{is_unfiltered, plan_query, FeatureIterator, ScanContext};
use crate::resolve::{literal, Resolver, GEOGRAPHY_SRID};
use crate::sample::{count_rows, first_count, Sampling, SizeGuard};
use crate::transform::CrsTransform;
use geo::BoundingRect;
use geoflake_ir::{
    quote_ident, BoundingBox, Encoding, Feature, FeatureRequest, Field, GeometryColumnSpec,
    GeometryKind, Source, SourceDescriptor, TypeCode, Value,
};
use geoflake_session::{QueryContext, Session};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub struct DataSource {
    descriptor: SourceDescriptor,
    config: EngineConfig,
    scan: ScanContext,
    spec: Option<Arc<GeometryColumnSpec>>,
    sampling: Option<Sampling>,
    store: Arc<MaterializedStore>,
    feature_count: Mutex<Option<u64>>,
    extent: Mutex<Option<Option<BoundingBox>>>,
}

impl DataSource {
    pub fn open(
        session: Arc<dyn Session>,
        descriptor: SourceDescriptor,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::open_in(session, descriptor, QueryContext::new(), config)
    }

    /// Open with statements running in `context`.
    pub fn open_in(
        session: Arc<dyn Session>,
        descriptor: SourceDescriptor,
        context: QueryContext,
        config: EngineConfig,
    ) -> Result<Self> {
        if let Source::Query { sql } = &descriptor.source {
            if sql.trim().trim_end_matches(';').trim().is_empty() {
                return Err(EngineError::InvalidSource("empty query".into()));
            }
        }

        let resolver = Resolver::new(
            session.as_ref(),
            &descriptor.connection,
            &context,
            &config,
        );
        let from = descriptor.source.from_clause();

        let spec = match declared_spec(&descriptor) {
            Some(mut spec) => {
                if spec.srid.is_none() && spec.encoding == Encoding::Geometry {
                    spec.srid = resolver.srid(&from, &spec.column)?;
                }
                Some(spec)
            }
            None => {
                let specs = resolver.resolve_all(&descriptor.source)?;
                pick_spec(specs, &descriptor)
            }
        };
        if spec.is_none() {
            warn!(source = %from, "No geometry column resolved");
        }

        let fields = match &descriptor.source {
            Source::Table { schema, name } => resolver
                .table_columns(schema.as_deref(), name)?
                .into_iter()
                .filter(|c| Encoding::from_declared_type(&c.data_type).is_none())
                .map(|c| Field::new(c.name, c.data_type))
                .collect::<Vec<_>>(),
            Source::Query { .. } => resolver
                .query_columns(&descriptor.source)?
                .iter()
                .filter(|c| !matches!(c.type_code, TypeCode::Geography | TypeCode::Geometry))
                .map(Field::from_descriptor)
                .collect(),
        };

        let primary_key = descriptor
            .primary_key
            .as_deref()
            .and_then(|name| field_index(&fields, name));
        if let (Some(name), None) = (&descriptor.primary_key, primary_key) {
            warn!(primary_key = %name, "Primary key is not an attribute of the source");
        }

        let sampling = match &spec {
            Some(spec) => Some(SizeGuard::new(&config).assess(
                session.as_ref(),
                &descriptor.connection,
                &context,
                &from,
                spec.encoding,
            )?),
            None => None,
        };

        let mut scan = ScanContext::new(
            session,
            descriptor.connection.clone(),
            descriptor.source.clone(),
        );
        scan.context = context;
        scan.fields = fields;
        scan.primary_key = primary_key;
        scan.sample_limit = sampling.and_then(|s| s.limit);
        scan.batch_size = config.effective_batch_size();

        info!(
            source = %from,
            fields = scan.fields.len(),
            geometry = ?spec.as_ref().map(|s| &s.column),
            limited = sampling.map(|s| s.is_limited()).unwrap_or(false),
            "Opened data source"
        );

        Ok(Self {
            descriptor,
            config,
            scan,
            spec: spec.map(Arc::new),
            sampling,
            store: Arc::new(MaterializedStore::new()),
            feature_count: Mutex::new(None),
            extent: Mutex::new(None),
        })
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn fields(&self) -> &[Field] {
        &self.scan.fields
    }

    /// Index of the primary-key field, if the source defines one.
    pub fn primary_key(&self) -> Option<usize> {
        self.scan.primary_key
    }

    pub fn geometry_spec(&self) -> Option<&GeometryColumnSpec> {
        self.spec.as_deref()
    }

    /// Kind of the geometries this layer yields.
    pub fn geometry_kind(&self) -> Option<GeometryKind> {
        self.spec.as_ref().and_then(|s| s.feature_kind())
    }

    pub fn sampling(&self) -> Option<Sampling> {
        self.sampling
    }

    /// Row count reached the cap: scans return a random sample.
    pub fn is_limited(&self) -> bool {
        self.sampling.map(|s| s.is_limited()).unwrap_or(false)
    }

    pub fn subset_string(&self) -> Option<&str> {
        self.scan.subset_filter.as_deref()
    }

    /// Replace the persisted filter.
    ///
    /// Returns `Ok(false)` and keeps the current filter when `filter` does not
    /// parse against the source. An empty filter clears it.
    pub fn set_subset_string(&mut self, filter: Option<&str>) -> Result<bool> {
        let filter = filter.map(str::trim).filter(|f| !f.is_empty());
        if let Some(filter) = filter {
            let valid = compose::validate_expression(
                self.scan.session.as_ref(),
                &self.scan.connection,
                &self.scan.context,
                &self.scan.source.from_clause(),
                filter,
            );
            if !valid {
                warn!(filter = %filter, "Rejected subset filter");
                return Ok(false);
            }
        }

        self.scan.subset_filter = filter.map(str::to_string);
        self.store.invalidate();
        if let Ok(mut count) = self.feature_count.lock() {
            *count = None;
        }
        if let Ok(mut extent) = self.extent.lock() {
            *extent = None;
        }
        debug!(filter = ?self.scan.subset_filter, "Subset filter changed");
        Ok(true)
    }

    fn where_clause(&self, extra: Option<String>) -> String {
        let mut predicates = Vec::new();
        if let Some(extra) = extra {
            predicates.push(extra);
        }
        if let Some(subset) = &self.scan.subset_filter {
            predicates.push(format!("({subset})"));
        }
        if predicates.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", predicates.join(" AND "))
        }
    }

    /// Number of features, honouring the subset filter.
    pub fn feature_count(&self) -> Result<u64> {
        if let Some(features) = self.store.loaded().filter(|_| !self.is_limited()) {
            return Ok(features.len() as u64);
        }
        if let Some(count) = self.feature_count.lock().ok().and_then(|c| *c) {
            return Ok(count);
        }

        let validity = self
            .spec
            .as_deref()
            .filter(|spec| spec.encoding == Encoding::CellId)
            .map(kind_guard);
        let from = format!(
            "{}{}",
            self.scan.source.from_clause(),
            self.where_clause(validity)
        );
        let count = count_rows(
            self.scan.session.as_ref(),
            &self.scan.connection,
            &self.scan.context,
            &from,
        )?;
        if let Ok(mut cached) = self.feature_count.lock() {
            *cached = Some(count);
        }
        Ok(count)
    }

    /// Bounding rectangle of the geometry column, in the source CRS.
    ///
    /// `None` without a geometry column or when every value is null.
    pub fn extent(&self) -> Result<Option<BoundingBox>> {
        let Some(spec) = self.spec.as_deref() else {
            return Ok(None);
        };
        if let Some(features) = self.store.loaded().filter(|_| !self.is_limited()) {
            return Ok(local_extent(&features));
        }
        if let Some(extent) = self.extent.lock().ok().and_then(|e| *e) {
            return Ok(extent);
        }

        let geom = quote_ident(&spec.column);
        let target = match spec.encoding {
            Encoding::CellId => format!("H3_CELL_TO_BOUNDARY({geom})"),
            Encoding::Geometry | Encoding::Geography => geom.clone(),
        };
        let sql = format!(
            "SELECT MIN(ST_XMIN({target})), MIN(ST_YMIN({target})), \
             MAX(ST_XMAX({target})), MAX(ST_YMAX({target})) FROM {}{}",
            self.scan.source.from_clause(),
            self.where_clause(Some(kind_guard(spec)))
        );
        let rows = self.scan.session.query_all(&self.scan.connection, &sql, &self.scan.context)?;
        let extent = rows.first().and_then(|row| {
            let v: Vec<f64> = row.iter().take(4).filter_map(Value::as_f64).collect();
            (v.len() == 4).then(|| BoundingBox::new(v[0], v[1], v[2], v[3]))
        });
        if let Ok(mut cached) = self.extent.lock() {
            *cached = Some(extent);
        }
        Ok(extent)
    }

    /// Distinct values of one attribute, sorted, at most `limit` of them.
    pub fn unique_values(&self, field: &str, limit: Option<usize>) -> Result<Vec<Value>> {
        let index = field_index(&self.scan.fields, field)
            .ok_or_else(|| EngineError::UnknownField(field.to_string()))?;
        let column = quote_ident(&self.scan.fields[index].name);
        let mut sql = format!(
            "SELECT DISTINCT {column} FROM {}{} ORDER BY {column}",
            self.scan.source.from_clause(),
            self.where_clause(None)
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let rows = self.scan.session.query_all(&self.scan.connection, &sql, &self.scan.context)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect())
    }

    /// Whether a table source is a view. Query sources never are.
    pub fn is_view(&self) -> Result<bool> {
        let Source::Table { schema, name } = &self.scan.source else {
            return Ok(false);
        };
        let mut sql = format!(
            "SELECT COUNT(*) FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_TYPE = 'VIEW' AND TABLE_NAME ILIKE {}",
            literal(name)
        );
        if let Some(schema) = schema {
            sql.push_str(&format!(" AND TABLE_SCHEMA ILIKE {}", literal(schema)));
        }
        let rows = self.scan.session.query_all(&self.scan.connection, &sql, &self.scan.context)?;
        Ok(first_count(&rows) > 0)
    }

    /// Open an iterator for `request`.
    ///
    /// A fully loaded source replays from memory unless the request carries
    /// an expression, which only the warehouse can evaluate.
    pub fn get_features(&self, request: &FeatureRequest) -> Result<FeatureIterator> {
        if request.expression.is_none() {
            if let Some(features) = self.store.loaded() {
                return FeatureIterator::replay(&self.scan, self.spec.clone(), features, request);
            }
        }

        // A sampled scan is not the whole source and never counts as loaded.
        let iter = FeatureIterator::open(&self.scan, self.spec.clone(), request)?;
        if is_unfiltered(request) && !iter.reprojects() && !self.is_limited() {
            Ok(iter.publish_to(self.store.clone()))
        } else {
            Ok(iter)
        }
    }

    /// The statement `get_features` would run for `request`, without running it.
    ///
    /// The request's expression is still validated against the warehouse.
    pub fn explain(&self, request: &FeatureRequest) -> Result<ComposedQuery> {
        let spec = self.spec.as_deref().ok_or(EngineError::MissingGeometrySpec)?;
        let (query, _) = plan_query(&self.scan, spec, request)?;
        Ok(query)
    }

    pub fn is_fully_loaded(&self) -> bool {
        self.store.is_loaded()
    }

    /// Take ownership of features materialized elsewhere.
    pub fn adopt_materialized(&self, features: Vec<Feature>) {
        debug!(features = features.len(), "Adopted materialized features");
        self.store.adopt(features);
    }

    /// Scan the whole source once so later requests replay from memory.
    pub fn load_all(&self) -> Result<usize> {
        if let Some(features) = self.store.loaded() {
            return Ok(features.len());
        }
        let mut iter = self.get_features(&FeatureRequest::new())?;
        let features = iter.collect_remaining()?;
        Ok(features.len())
    }

    /// Make another reprojection available to requests.
    pub fn register_transform(&mut self, transform: Arc<dyn CrsTransform>) {
        self.scan.transforms.register(transform);
    }

    pub fn scan_context(&self) -> &ScanContext {
        &self.scan
    }
}

/// Spec fully described by the descriptor, skipping the resolver probes.
fn declared_spec(descriptor: &SourceDescriptor) -> Option<GeometryColumnSpec> {
    let column = descriptor.geometry_column.clone()?;
    let encoding = descriptor.encoding?;
    if encoding != Encoding::CellId && descriptor.geometry_kind.is_none() {
        return None;
    }
    let srid = match encoding {
        Encoding::Geometry => descriptor.srid,
        Encoding::Geography | Encoding::CellId => Some(descriptor.srid.unwrap_or(GEOGRAPHY_SRID)),
    };
    Some(GeometryColumnSpec {
        column,
        encoding,
        kind: descriptor.geometry_kind.filter(|_| encoding != Encoding::CellId),
        srid,
    })
}

/// First resolved spec matching the descriptor's column and kind, if given.
fn pick_spec(
    specs: Vec<GeometryColumnSpec>,
    descriptor: &SourceDescriptor,
) -> Option<GeometryColumnSpec> {
    specs.into_iter().find(|spec| {
        let column_ok = descriptor
            .geometry_column
            .as_deref()
            .map(|c| c == spec.column)
            .unwrap_or(true);
        let kind_ok = match (descriptor.geometry_kind, spec.kind) {
            (Some(wanted), Some(kind)) => wanted == kind || wanted.plural() == Some(kind),
            _ => true,
        };
        column_ok && kind_ok
    })
}

fn field_index(fields: &[Field], name: &str) -> Option<usize> {
    fields
        .iter()
        .position(|f| f.name == name)
        .or_else(|| fields.iter().position(|f| f.name.eq_ignore_ascii_case(name)))
}

fn local_extent(features: &[Feature]) -> Option<BoundingBox> {
    features
        .iter()
        .filter_map(|f| f.geometry.as_ref()?.bounding_rect())
        .map(|r| BoundingBox::new(r.min().x, r.min().y, r.max().x, r.max().y))
        .reduce(|a, b| a.union(&b))
}
