//! Polygon parsing, axis-order disambiguation and centroid math.
//!
//! Stored geometries come from several exports and are not always GeoJSON
//! compliant: some are wrapped in a `Feature`, some live inside the
//! properties blob, and some are encoded latitude-first. Everything here is
//! best-effort and tuned to the deployment region (see [`is_plausible`]).

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::normalize::PropertyBag;

pub type Position = [f64; 2];

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
pub const PLAUSIBLE_LAT: (f64, f64) = (4.0, 20.0);
pub const PLAUSIBLE_LNG: (f64, f64) = (-20.0, -4.0);
const AXIS_SAMPLE_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("geometry is empty")]
    Empty,
    #[error("invalid geometry json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported geometry type: {0}")]
    UnsupportedType(String),
    #[error("malformed coordinates")]
    MalformedCoordinates,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Polygon(Vec<Vec<Position>>),
    MultiPolygon(Vec<Vec<Vec<Position>>>),
}

impl Geometry {
    pub fn parse(text: &str) -> Result<Self, GeometryError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(GeometryError::Empty);
        }
        let value: Value = serde_json::from_str(trimmed)?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, GeometryError> {
        let mut value = value;
        if value.get("type").and_then(Value::as_str) == Some("Feature") {
            value = value.get("geometry").ok_or(GeometryError::Empty)?;
        }
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(GeometryError::Empty)?;
        let coordinates = value
            .get("coordinates")
            .ok_or(GeometryError::MalformedCoordinates)?;
        match kind {
            "Polygon" => Ok(Self::Polygon(parse_rings(coordinates)?)),
            "MultiPolygon" => {
                let polygons = coordinates
                    .as_array()
                    .ok_or(GeometryError::MalformedCoordinates)?
                    .iter()
                    .filter_map(|polygon| parse_rings(polygon).ok())
                    .collect::<Vec<_>>();
                if polygons.is_empty() {
                    return Err(GeometryError::MalformedCoordinates);
                }
                Ok(Self::MultiPolygon(polygons))
            }
            other => Err(GeometryError::UnsupportedType(other.to_string())),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Polygon(rings) => json!({"type": "Polygon", "coordinates": rings}),
            Self::MultiPolygon(polygons) => {
                json!({"type": "MultiPolygon", "coordinates": polygons})
            }
        }
    }

    pub fn positions(&self) -> Box<dyn Iterator<Item = &Position> + '_> {
        match self {
            Self::Polygon(rings) => Box::new(rings.iter().flatten()),
            Self::MultiPolygon(polygons) => Box::new(polygons.iter().flatten().flatten()),
        }
    }

    pub fn outer_ring(&self) -> Option<&[Position]> {
        match self {
            Self::Polygon(rings) => rings.first().map(Vec::as_slice),
            Self::MultiPolygon(polygons) => polygons
                .first()
                .and_then(|rings| rings.first())
                .map(Vec::as_slice),
        }
    }

    fn map_positions(&self, f: impl Fn(&Position) -> Position) -> Self {
        let map_rings = |rings: &Vec<Vec<Position>>| -> Vec<Vec<Position>> {
            rings
                .iter()
                .map(|ring| ring.iter().map(&f).collect())
                .collect()
        };
        match self {
            Self::Polygon(rings) => Self::Polygon(map_rings(rings)),
            Self::MultiPolygon(polygons) => {
                Self::MultiPolygon(polygons.iter().map(map_rings).collect())
            }
        }
    }
}

fn parse_rings(value: &Value) -> Result<Vec<Vec<Position>>, GeometryError> {
    let rings = value
        .as_array()
        .ok_or(GeometryError::MalformedCoordinates)?
        .iter()
        .filter_map(|ring| {
            let ring = ring.as_array()?;
            let positions: Vec<Position> = ring.iter().filter_map(parse_position).collect();
            (!positions.is_empty()).then_some(positions)
        })
        .collect::<Vec<_>>();
    if rings.is_empty() {
        return Err(GeometryError::MalformedCoordinates);
    }
    Ok(rings)
}

fn parse_position(value: &Value) -> Option<Position> {
    let items = value.as_array()?;
    let a = number_of(items.first()?)?;
    let b = number_of(items.get(1)?)?;
    (a.is_finite() && b.is_finite()).then_some([a, b])
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Looks for a polygon hidden in the properties blob: a `geometry`/`geom`/
/// `geojson` entry (object or JSON text), any nested GeoJSON-shaped object,
/// or a bare `coordinates` ring.
pub fn extract_from_properties(properties: &PropertyBag) -> Option<Geometry> {
    let mut candidates: Vec<Value> = Vec::new();
    for (key, value) in properties {
        let lower = key.to_lowercase();
        if matches!(lower.as_str(), "geometry" | "geom" | "geojson") {
            match value {
                Value::String(text) => {
                    if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                        candidates.push(parsed);
                    }
                }
                Value::Object(_) => candidates.push(value.clone()),
                _ => {}
            }
        } else if let Value::Object(map) = value {
            let feature = map.get("type").and_then(Value::as_str) == Some("Feature");
            if map.contains_key("type") && (map.contains_key("coordinates") || feature) {
                candidates.push(value.clone());
            }
        }
    }

    if let Some(geometry) = candidates
        .iter()
        .find_map(|candidate| Geometry::from_value(candidate).ok())
    {
        return Some(geometry);
    }

    let ring: Vec<Position> = properties
        .get("coordinates")?
        .as_array()?
        .iter()
        .filter_map(parse_position)
        .collect();
    (!ring.is_empty()).then(|| Geometry::Polygon(vec![ring]))
}

/// Stored column first, then whatever the properties blob carries.
pub fn resolve_geometry(column: Option<&str>, properties: &PropertyBag) -> Option<Geometry> {
    if let Some(geometry) = column.and_then(|text| Geometry::parse(text).ok()) {
        return Some(geometry);
    }
    extract_from_properties(properties)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisOrder {
    LonLat,
    LatLon,
}

/// Majority vote over the first sampled pairs. Pairs valid under both
/// readings are decided by the plausibility window, and left neutral when
/// the window cannot tell them apart.
pub fn detect_axis_order(geometry: &Geometry) -> AxisOrder {
    let mut lon_lat = 0_usize;
    let mut lat_lon = 0_usize;
    for [first, second] in geometry.positions().take(AXIS_SAMPLE_LIMIT).copied() {
        let (a, b) = (first.abs(), second.abs());
        let lon_lat_ok = a <= 180.0 && b <= 90.0;
        let lat_lon_ok = a <= 90.0 && b <= 180.0;
        match (lon_lat_ok, lat_lon_ok) {
            (true, false) => lon_lat += 1,
            (false, true) => lat_lon += 1,
            (true, true) => {
                let as_lon_lat = is_plausible(LatLng::new(second, first));
                let as_lat_lon = is_plausible(LatLng::new(first, second));
                match (as_lon_lat, as_lat_lon) {
                    (true, false) => lon_lat += 1,
                    (false, true) => lat_lon += 1,
                    _ => {
                        lon_lat += 1;
                        lat_lon += 1;
                    }
                }
            }
            (false, false) => {}
        }
    }
    if lat_lon > lon_lat {
        AxisOrder::LatLon
    } else {
        AxisOrder::LonLat
    }
}

/// Returns the geometry in GeoJSON's lon-first order.
pub fn normalize_axis_order(geometry: &Geometry) -> Geometry {
    match detect_axis_order(geometry) {
        AxisOrder::LonLat => geometry.clone(),
        AxisOrder::LatLon => geometry.map_positions(|[a, b]| [*b, *a]),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

pub fn compute_centroid(ring: &[Position], assume_lon_lat: bool) -> Option<LatLng> {
    if ring.is_empty() {
        return None;
    }
    let (sum_a, sum_b) = ring
        .iter()
        .fold((0.0, 0.0), |(sa, sb), [a, b]| (sa + a, sb + b));
    let n = ring.len() as f64;
    let (a, b) = (sum_a / n, sum_b / n);
    Some(if assume_lon_lat {
        LatLng::new(b, a)
    } else {
        LatLng::new(a, b)
    })
}

pub fn is_plausible(point: LatLng) -> bool {
    (PLAUSIBLE_LAT.0..=PLAUSIBLE_LAT.1).contains(&point.lat)
        && (PLAUSIBLE_LNG.0..=PLAUSIBLE_LNG.1).contains(&point.lng)
}

/// Degrees outside the plausibility window; zero when inside.
pub fn implausibility(point: LatLng) -> f64 {
    let outside = |value: f64, (lo, hi): (f64, f64)| (lo - value).max(value - hi).max(0.0);
    outside(point.lat, PLAUSIBLE_LAT) + outside(point.lng, PLAUSIBLE_LNG)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResolvedCentroid {
    pub point: LatLng,
    pub plausible: bool,
    /// Whether the ring was read as (lng, lat) to produce `point`.
    pub lon_lat: bool,
}

/// Centroid of the outer ring, retrying with the opposite axis reading when
/// the first one lands outside the deployment region.
pub fn resolve_centroid(geometry: &Geometry) -> Option<ResolvedCentroid> {
    let ring = geometry.outer_ring()?;
    let primary_lon_lat = detect_axis_order(geometry) == AxisOrder::LonLat;
    let primary = compute_centroid(ring, primary_lon_lat)?;
    if is_plausible(primary) {
        return Some(ResolvedCentroid {
            point: primary,
            plausible: true,
            lon_lat: primary_lon_lat,
        });
    }
    let alternate = compute_centroid(ring, !primary_lon_lat)?;
    if is_plausible(alternate) {
        return Some(ResolvedCentroid {
            point: alternate,
            plausible: true,
            lon_lat: !primary_lon_lat,
        });
    }
    let (point, lon_lat) = if implausibility(alternate) < implausibility(primary) {
        (alternate, !primary_lon_lat)
    } else {
        (primary, primary_lon_lat)
    };
    Some(ResolvedCentroid {
        point,
        plausible: false,
        lon_lat,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lng: f64,
    pub max_lat: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    /// Box over every position, read in the order the centroid resolves to.
    pub fn from_geometry(geometry: &Geometry) -> Option<Self> {
        let lon_lat = resolve_centroid(geometry)?.lon_lat;
        let mut bbox: Option<BoundingBox> = None;
        for [a, b] in geometry.positions().copied() {
            let point = if lon_lat {
                LatLng::new(b, a)
            } else {
                LatLng::new(a, b)
            };
            bbox = Some(match bbox {
                None => BoundingBox {
                    min_lat: point.lat,
                    min_lng: point.lng,
                    max_lat: point.lat,
                    max_lng: point.lng,
                },
                Some(current) => current.extend(point),
            });
        }
        bbox
    }

    fn extend(self, point: LatLng) -> Self {
        Self {
            min_lat: self.min_lat.min(point.lat),
            min_lng: self.min_lng.min(point.lng),
            max_lat: self.max_lat.max(point.lat),
            max_lng: self.max_lng.max(point.lng),
        }
    }

    pub fn padded(&self, pad: f64) -> Self {
        Self {
            min_lat: self.min_lat - pad,
            min_lng: self.min_lng - pad,
            max_lat: self.max_lat + pad,
            max_lng: self.max_lng + pad,
        }
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
            && self.min_lng <= other.max_lng
            && self.max_lng >= other.min_lng
    }
}

pub fn haversine_m(a: LatLng, b: LatLng) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}
