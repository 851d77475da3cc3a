//! Geoflake feature engine
//!
//! Exposes warehouse tables and SQL queries as streaming feature sources:
//! resolves which columns carry spatial data, composes the SQL for a
//! feature request, and decodes the result into typed features batch by
//! batch, sampling sources too large to pull whole.

pub mod compose;
pub mod config;
pub mod decode;
pub mod error;
pub mod iter;
pub mod preview;
pub mod resolve;
pub mod sample;
pub mod source;
pub mod transform;

pub use config::EngineConfig;
pub use error::{DecodeError, EngineError, Result};
pub use iter::{open_iterator, CancelFlag, FeatureIterator, IteratorPhase, ScanStats};
pub use preview::{collect_layers, preview, LayerGroup, Preview};
pub use resolve::Resolver;
pub use source::DataSource;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::compose::{compose, ComposedQuery, QueryPlan};
    pub use crate::config::EngineConfig;
    pub use crate::error::{EngineError, Result};
    pub use crate::iter::{CancelFlag, FeatureIterator, IteratorPhase};
    pub use crate::resolve::Resolver;
    pub use crate::source::DataSource;
    pub use crate::transform::{CrsTransform, TransformRegistry};
    pub use geoflake_ir::{
        BoundingBox, Feature, FeatureRequest, Field, GeometryColumnSpec, Source, SourceDescriptor,
    };
    pub use geoflake_session::{QueryContext, Session};
}

/// Resolve the geometry column of `source`, if it has one.
pub fn resolve_geometry_spec(
    session: &dyn geoflake_session::Session,
    connection: &str,
    source: &geoflake_ir::Source,
    config: &EngineConfig,
) -> Result<Option<geoflake_ir::GeometryColumnSpec>> {
    let context = geoflake_session::QueryContext::new();
    Resolver::new(session, connection, &context, config).resolve(source, None)
}
