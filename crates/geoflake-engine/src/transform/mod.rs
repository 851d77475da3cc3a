//! Coordinate reprojection
//!
//! Built in: EPSG:4326 (lon/lat degrees) <-> EPSG:3857 (spherical web
//! mercator metres). Hosts can register any other pair.

use crate::error::{EngineError, Result};
use geo::MapCoords;
use geo_types::{Coord, Geometry};
use geoflake_ir::BoundingBox;
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

pub const WGS84: i32 = 4326;
pub const WEB_MERCATOR: i32 = 3857;

const EARTH_RADIUS: f64 = 6_378_137.0;
const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

/// A reversible coordinate transform between two CRSs.
pub trait CrsTransform: Send + Sync + fmt::Debug {
    fn source_srid(&self) -> i32;
    fn target_srid(&self) -> i32;
    fn forward(&self, c: Coord<f64>) -> Coord<f64>;
    fn inverse(&self, c: Coord<f64>) -> Coord<f64>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebMercator;

impl CrsTransform for WebMercator {
    fn source_srid(&self) -> i32 {
        WGS84
    }

    fn target_srid(&self) -> i32 {
        WEB_MERCATOR
    }

    fn forward(&self, c: Coord<f64>) -> Coord<f64> {
        let lat = c.y.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
        Coord {
            x: EARTH_RADIUS * c.x.to_radians(),
            y: EARTH_RADIUS * (PI / 4.0 + lat / 2.0).tan().ln(),
        }
    }

    fn inverse(&self, c: Coord<f64>) -> Coord<f64> {
        Coord {
            x: (c.x / EARTH_RADIUS).to_degrees(),
            y: (2.0 * (c.y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees(),
        }
    }
}

/// Runs a transform backwards.
#[derive(Debug, Clone)]
pub struct Inverted(pub Arc<dyn CrsTransform>);

impl CrsTransform for Inverted {
    fn source_srid(&self) -> i32 {
        self.0.target_srid()
    }

    fn target_srid(&self) -> i32 {
        self.0.source_srid()
    }

    fn forward(&self, c: Coord<f64>) -> Coord<f64> {
        self.0.inverse(c)
    }

    fn inverse(&self, c: Coord<f64>) -> Coord<f64> {
        self.0.forward(c)
    }
}

/// Known transforms, looked up by (source, target) SRID.
#[derive(Debug, Clone, Default)]
pub struct TransformRegistry {
    custom: Vec<Arc<dyn CrsTransform>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transform; it is also used in reverse.
    pub fn register(&mut self, transform: Arc<dyn CrsTransform>) {
        self.custom.push(transform);
    }

    /// Transform from `source` to `target`.
    ///
    /// `Ok(None)` when no reprojection is needed (same CRS, or either side
    /// unknown).
    pub fn between(
        &self,
        source: Option<i32>,
        target: Option<i32>,
    ) -> Result<Option<Arc<dyn CrsTransform>>> {
        let (source, target) = match (source, target) {
            (Some(s), Some(t)) if s != t => (s, t),
            _ => return Ok(None),
        };

        let builtin: Arc<dyn CrsTransform> = Arc::new(WebMercator);
        for candidate in self.custom.iter().chain(std::iter::once(&builtin)) {
            if candidate.source_srid() == source && candidate.target_srid() == target {
                return Ok(Some(candidate.clone()));
            }
            if candidate.source_srid() == target && candidate.target_srid() == source {
                return Ok(Some(Arc::new(Inverted(candidate.clone()))));
            }
        }

        Err(EngineError::UnsupportedTransform {
            from: source,
            to: target,
        })
    }
}

pub fn transform_geometry(geometry: &Geometry<f64>, transform: &dyn CrsTransform) -> Geometry<f64> {
    geometry.map_coords(|c| transform.forward(c))
}

/// Map a destination-CRS rectangle back into the source CRS.
///
/// Corners and edge midpoints are transformed so that curved edges of
/// non-affine transforms are still covered.
pub fn bbox_to_source(bbox: &BoundingBox, transform: &dyn CrsTransform) -> BoundingBox {
    let xmid = (bbox.xmin + bbox.xmax) / 2.0;
    let ymid = (bbox.ymin + bbox.ymax) / 2.0;
    let samples = [
        (bbox.xmin, bbox.ymin),
        (bbox.xmax, bbox.ymin),
        (bbox.xmax, bbox.ymax),
        (bbox.xmin, bbox.ymax),
        (xmid, bbox.ymin),
        (xmid, bbox.ymax),
        (bbox.xmin, ymid),
        (bbox.xmax, ymid),
    ];

    let mut out: Option<BoundingBox> = None;
    for (x, y) in samples {
        let c = transform.inverse(Coord { x, y });
        let point = BoundingBox::new(c.x, c.y, c.x, c.y);
        out = Some(match out {
            Some(acc) => acc.union(&point),
            None => point,
        });
    }
    out.unwrap_or(*bbox)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::point;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn test_web_mercator_known_point() {
        let c = WebMercator.forward(Coord { x: 180.0, y: 0.0 });
        assert!(close(c.x, 20_037_508.342_789_244, 1e-6));
        assert!(close(c.y, 0.0, 1e-6));

        let back = WebMercator.inverse(WebMercator.forward(Coord { x: 13.4, y: 52.5 }));
        assert!(close(back.x, 13.4, 1e-9));
        assert!(close(back.y, 52.5, 1e-9));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = TransformRegistry::new();
        assert!(registry.between(Some(4326), Some(4326)).unwrap().is_none());
        assert!(registry.between(None, Some(3857)).unwrap().is_none());

        let fwd = registry.between(Some(4326), Some(3857)).unwrap().unwrap();
        assert_eq!(fwd.target_srid(), 3857);
        let inv = registry.between(Some(3857), Some(4326)).unwrap().unwrap();
        assert_eq!(inv.target_srid(), 4326);

        assert!(matches!(
            registry.between(Some(4326), Some(27700)),
            Err(EngineError::UnsupportedTransform { from: 4326, to: 27700 })
        ));
    }

    #[derive(Debug)]
    struct Shift;

    impl CrsTransform for Shift {
        fn source_srid(&self) -> i32 {
            1
        }
        fn target_srid(&self) -> i32 {
            2
        }
        fn forward(&self, c: Coord<f64>) -> Coord<f64> {
            Coord { x: c.x + 10.0, y: c.y }
        }
        fn inverse(&self, c: Coord<f64>) -> Coord<f64> {
            Coord { x: c.x - 10.0, y: c.y }
        }
    }

    #[test]
    fn test_custom_transform_and_bbox() {
        let mut registry = TransformRegistry::new();
        registry.register(Arc::new(Shift));
        let t = registry.between(Some(1), Some(2)).unwrap().unwrap();

        let g = transform_geometry(&Geometry::Point(point!(x: 1.0, y: 2.0)), t.as_ref());
        assert_eq!(g, Geometry::Point(point!(x: 11.0, y: 2.0)));

        let bbox = bbox_to_source(&BoundingBox::new(10.0, 0.0, 20.0, 5.0), t.as_ref());
        assert_eq!(bbox, BoundingBox::new(0.0, 0.0, 10.0, 5.0));
    }
}
