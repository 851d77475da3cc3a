//! WKB (Well-Known Binary) reader
//!
//! Accepts OGC WKB, ISO WKB with Z/M/ZM type offsets, and PostGIS-style EWKB
//! with the SRID and dimension flags. Extra ordinates are read and dropped.

use crate::error::DecodeError;
use geo_types::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};
use std::io::{Cursor, Read};

const WKB_POINT: u32 = 1;
const WKB_LINESTRING: u32 = 2;
const WKB_POLYGON: u32 = 3;
const WKB_MULTIPOINT: u32 = 4;
const WKB_MULTILINESTRING: u32 = 5;
const WKB_MULTIPOLYGON: u32 = 6;
const WKB_GEOMETRYCOLLECTION: u32 = 7;

const EWKB_Z_FLAG: u32 = 0x8000_0000;
const EWKB_M_FLAG: u32 = 0x4000_0000;
const EWKB_SRID_FLAG: u32 = 0x2000_0000;

// Nesting deeper than this is treated as corrupt input
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    BigEndian,
    LittleEndian,
}

/// Parse a WKB or EWKB blob.
pub fn read_wkb(data: &[u8]) -> Result<Geometry<f64>, DecodeError> {
    let mut cursor = Cursor::new(data);
    let geometry = read_geometry(&mut cursor, 0)?;
    if (cursor.position() as usize) < data.len() {
        return Err(DecodeError::Wkb(format!(
            "{} trailing bytes",
            data.len() - cursor.position() as usize
        )));
    }
    Ok(geometry)
}

struct Header {
    order: ByteOrder,
    kind: u32,
    dims: usize,
}

fn read_header(cursor: &mut Cursor<&[u8]>) -> Result<Header, DecodeError> {
    let order = match read_u8(cursor)? {
        0 => ByteOrder::BigEndian,
        1 => ByteOrder::LittleEndian,
        other => return Err(DecodeError::Wkb(format!("invalid byte order {other}"))),
    };
    let raw = read_u32(cursor, order)?;

    let mut dims = 2;
    if raw & EWKB_Z_FLAG != 0 {
        dims += 1;
    }
    if raw & EWKB_M_FLAG != 0 {
        dims += 1;
    }
    if raw & EWKB_SRID_FLAG != 0 {
        let _srid = read_u32(cursor, order)?;
    }

    let code = raw & 0x0FFF_FFFF;
    // ISO: 1000 = Z, 2000 = M, 3000 = ZM
    let (kind, iso_extra) = match code / 1000 {
        0 => (code, 0),
        1 | 2 => (code % 1000, 1),
        3 => (code % 1000, 2),
        _ => return Err(DecodeError::Wkb(format!("unknown geometry type {code}"))),
    };
    dims += iso_extra;

    Ok(Header { order, kind, dims })
}

fn read_geometry(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Geometry<f64>, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::Wkb("geometry nested too deeply".into()));
    }
    let header = read_header(cursor)?;
    let Header { order, kind, dims } = header;

    let geometry = match kind {
        WKB_POINT => {
            let c = read_coord(cursor, order, dims)?;
            // An empty point is encoded as NaN coordinates
            if c.x.is_nan() && c.y.is_nan() {
                return Err(DecodeError::Wkb("empty point".into()));
            }
            Geometry::Point(Point(c))
        }
        WKB_LINESTRING => Geometry::LineString(read_line(cursor, order, dims)?),
        WKB_POLYGON => Geometry::Polygon(read_polygon(cursor, order, dims)?),
        WKB_MULTIPOINT => {
            let points = read_members(cursor, order, depth, |g| match g {
                Geometry::Point(p) => Ok(p),
                _ => Err(DecodeError::Wkb("MultiPoint member is not a point".into())),
            })?;
            Geometry::MultiPoint(MultiPoint(points))
        }
        WKB_MULTILINESTRING => {
            let lines = read_members(cursor, order, depth, |g| match g {
                Geometry::LineString(l) => Ok(l),
                _ => Err(DecodeError::Wkb(
                    "MultiLineString member is not a linestring".into(),
                )),
            })?;
            Geometry::MultiLineString(MultiLineString(lines))
        }
        WKB_MULTIPOLYGON => {
            let polygons = read_members(cursor, order, depth, |g| match g {
                Geometry::Polygon(p) => Ok(p),
                _ => Err(DecodeError::Wkb("MultiPolygon member is not a polygon".into())),
            })?;
            Geometry::MultiPolygon(MultiPolygon(polygons))
        }
        WKB_GEOMETRYCOLLECTION => {
            let members = read_members(cursor, order, depth, Ok)?;
            Geometry::GeometryCollection(GeometryCollection(members))
        }
        other => return Err(DecodeError::Wkb(format!("unknown geometry type {other}"))),
    };
    Ok(geometry)
}

fn read_members<T>(
    cursor: &mut Cursor<&[u8]>,
    order: ByteOrder,
    depth: usize,
    accept: impl Fn(Geometry<f64>) -> Result<T, DecodeError>,
) -> Result<Vec<T>, DecodeError> {
    let count = read_count(cursor, order)?;
    let mut members = Vec::with_capacity(count);
    for _ in 0..count {
        // Each member carries its own header (and possibly its own byte order)
        members.push(accept(read_geometry(cursor, depth + 1)?)?);
    }
    Ok(members)
}

fn read_polygon(
    cursor: &mut Cursor<&[u8]>,
    order: ByteOrder,
    dims: usize,
) -> Result<Polygon<f64>, DecodeError> {
    let rings = read_count(cursor, order)?;
    if rings == 0 {
        return Ok(Polygon::new(LineString(vec![]), vec![]));
    }
    let exterior = read_line(cursor, order, dims)?;
    let mut interiors = Vec::with_capacity(rings - 1);
    for _ in 1..rings {
        interiors.push(read_line(cursor, order, dims)?);
    }
    Ok(Polygon::new(exterior, interiors))
}

fn read_line(
    cursor: &mut Cursor<&[u8]>,
    order: ByteOrder,
    dims: usize,
) -> Result<LineString<f64>, DecodeError> {
    let count = read_count(cursor, order)?;
    let mut coords = Vec::with_capacity(count);
    for _ in 0..count {
        coords.push(read_coord(cursor, order, dims)?);
    }
    Ok(LineString(coords))
}

fn read_coord(
    cursor: &mut Cursor<&[u8]>,
    order: ByteOrder,
    dims: usize,
) -> Result<Coord<f64>, DecodeError> {
    let x = read_f64(cursor, order)?;
    let y = read_f64(cursor, order)?;
    for _ in 2..dims {
        read_f64(cursor, order)?;
    }
    Ok(Coord { x, y })
}

/// Element count, bounded by the bytes left so corrupt input cannot
/// trigger a huge allocation.
fn read_count(cursor: &mut Cursor<&[u8]>, order: ByteOrder) -> Result<usize, DecodeError> {
    let count = read_u32(cursor, order)? as usize;
    let remaining = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    if count > remaining {
        return Err(DecodeError::Wkb(format!(
            "count {count} exceeds remaining {remaining} bytes"
        )));
    }
    Ok(count)
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, DecodeError> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf[0])
}

fn read_u32(cursor: &mut Cursor<&[u8]>, order: ByteOrder) -> Result<u32, DecodeError> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf).map_err(truncated)?;
    Ok(match order {
        ByteOrder::BigEndian => u32::from_be_bytes(buf),
        ByteOrder::LittleEndian => u32::from_le_bytes(buf),
    })
}

fn read_f64(cursor: &mut Cursor<&[u8]>, order: ByteOrder) -> Result<f64, DecodeError> {
    let mut buf = [0u8; 8];
    cursor.read_exact(&mut buf).map_err(truncated)?;
    Ok(match order {
        ByteOrder::BigEndian => f64::from_be_bytes(buf),
        ByteOrder::LittleEndian => f64::from_le_bytes(buf),
    })
}

fn truncated(_: std::io::Error) -> DecodeError {
    DecodeError::Wkb("unexpected end of data".into())
}

/// Encode little-endian WKB. Used by tests and fixtures.
pub fn write_wkb(geometry: &Geometry<f64>) -> Vec<u8> {
    let mut out = Vec::new();
    write_geometry(&mut out, geometry);
    out
}

fn write_geometry(out: &mut Vec<u8>, geometry: &Geometry<f64>) {
    out.push(1);
    match geometry {
        Geometry::Point(p) => {
            out.extend_from_slice(&WKB_POINT.to_le_bytes());
            write_coord(out, p.0);
        }
        Geometry::LineString(l) => {
            out.extend_from_slice(&WKB_LINESTRING.to_le_bytes());
            write_line(out, l);
        }
        Geometry::Polygon(p) => {
            out.extend_from_slice(&WKB_POLYGON.to_le_bytes());
            write_polygon(out, p);
        }
        Geometry::MultiPoint(mp) => {
            out.extend_from_slice(&WKB_MULTIPOINT.to_le_bytes());
            out.extend_from_slice(&(mp.0.len() as u32).to_le_bytes());
            for p in &mp.0 {
                write_geometry(out, &Geometry::Point(*p));
            }
        }
        Geometry::MultiLineString(ml) => {
            out.extend_from_slice(&WKB_MULTILINESTRING.to_le_bytes());
            out.extend_from_slice(&(ml.0.len() as u32).to_le_bytes());
            for l in &ml.0 {
                write_geometry(out, &Geometry::LineString(l.clone()));
            }
        }
        Geometry::MultiPolygon(mp) => {
            out.extend_from_slice(&WKB_MULTIPOLYGON.to_le_bytes());
            out.extend_from_slice(&(mp.0.len() as u32).to_le_bytes());
            for p in &mp.0 {
                write_geometry(out, &Geometry::Polygon(p.clone()));
            }
        }
        Geometry::GeometryCollection(gc) => {
            out.extend_from_slice(&WKB_GEOMETRYCOLLECTION.to_le_bytes());
            out.extend_from_slice(&(gc.0.len() as u32).to_le_bytes());
            for g in &gc.0 {
                write_geometry(out, g);
            }
        }
        Geometry::Line(l) => {
            out.extend_from_slice(&WKB_LINESTRING.to_le_bytes());
            write_line(out, &LineString(vec![l.start, l.end]));
        }
        Geometry::Rect(r) => {
            out.extend_from_slice(&WKB_POLYGON.to_le_bytes());
            write_polygon(out, &r.to_polygon());
        }
        Geometry::Triangle(t) => {
            out.extend_from_slice(&WKB_POLYGON.to_le_bytes());
            write_polygon(out, &t.to_polygon());
        }
    }
}

fn write_polygon(out: &mut Vec<u8>, polygon: &Polygon<f64>) {
    let rings = 1 + polygon.interiors().len();
    out.extend_from_slice(&(rings as u32).to_le_bytes());
    write_line(out, polygon.exterior());
    for ring in polygon.interiors() {
        write_line(out, ring);
    }
}

fn write_line(out: &mut Vec<u8>, line: &LineString<f64>) {
    out.extend_from_slice(&(line.0.len() as u32).to_le_bytes());
    for c in &line.0 {
        write_coord(out, *c);
    }
}

fn write_coord(out: &mut Vec<u8>, c: Coord<f64>) {
    out.extend_from_slice(&c.x.to_le_bytes());
    out.extend_from_slice(&c.y.to_le_bytes());
}
