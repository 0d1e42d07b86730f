//! Boolean spatial test of a point/polygon against a configured
//! multipolygon area of interest. Used by the osmChange applier and
//! the changeset reader to flag every entity as in- or
//! out-of-priority.
//!
//! Grounded on the teacher's own area-membership tests in
//! `osmxml::filter`, generalised from the decimicro-integer coordinate
//! space that module used to the `f64` WGS-84 degrees the rest of this
//! engine works in, and from "is any referenced node in the polygon"
//! to "is this entity's point/centroid in the polygon".

use std::fs;
use std::path::Path;

use geo::{Centroid, Intersects};

use crate::error::{Error, Result};

/// An empty AOI means "no restriction" — everything is in-priority.
#[derive(Debug, Clone, Default)]
pub struct AreaFilter {
    aoi: geo::MultiPolygon<f64>,
}

impl AreaFilter {
    #[must_use]
    pub fn new(aoi: geo::MultiPolygon<f64>) -> Self {
        AreaFilter { aoi }
    }

    /// Load an AOI from a `.poly` file (the Osmosis polygon filter file
    /// format). Generalised from the teacher's own `.poly` reader in
    /// `osmgeom::read_multipolygon`, which works in decimicro-integer
    /// coordinates; this one keeps `f64` degrees throughout since
    /// nothing downstream of the area filter needs the integer grid.
    pub fn from_poly_file(path: &Path) -> Result<Self> {
        let src = fs::read_to_string(path)?;
        let mut lines = src.lines();
        let _name = lines.next();
        let mut polygons = Vec::new();
        while let Some(line) = lines.next() {
            if line.starts_with("END") {
                break;
            }
            let skip = line.starts_with('!');
            let mut coords = Vec::new();
            for ring_line in lines.by_ref() {
                if ring_line.starts_with("END") {
                    break;
                }
                let mut parts = ring_line.split_whitespace();
                let x: f64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::Parse(path.display().to_string(), "malformed .poly coordinate".to_string()))?;
                let y: f64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::Parse(path.display().to_string(), "malformed .poly coordinate".to_string()))?;
                coords.push(geo::coord! { x: x, y: y });
            }
            if !skip {
                polygons.push(geo::Polygon::new(geo::LineString::new(coords), vec![]));
            }
        }
        Ok(AreaFilter::new(geo::MultiPolygon::new(polygons)))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.aoi.0.is_empty()
    }

    #[must_use]
    pub fn point_in_aoi(&self, point: &geo::Point<f64>) -> bool {
        self.is_empty() || point.intersects(&self.aoi)
    }

    #[must_use]
    pub fn linestring_in_aoi(&self, linestring: &geo::LineString<f64>) -> bool {
        if self.is_empty() {
            return true;
        }
        linestring
            .centroid()
            .is_some_and(|c| c.intersects(&self.aoi))
    }

    #[must_use]
    pub fn polygon_in_aoi(&self, polygon: &geo::Polygon<f64>) -> bool {
        if self.is_empty() {
            return true;
        }
        polygon.centroid().is_some_and(|c| c.intersects(&self.aoi))
    }

    #[must_use]
    pub fn way_in_aoi(&self, way: &crate::model::Way) -> bool {
        if self.is_empty() {
            return true;
        }
        if let Some(poly) = &way.polygon {
            return self.polygon_in_aoi(poly);
        }
        way.linestring
            .as_ref()
            .is_some_and(|ls| self.linestring_in_aoi(ls))
    }

    #[must_use]
    pub fn relation_in_aoi(&self, relation: &crate::model::Relation) -> bool {
        if self.is_empty() {
            return true;
        }
        if let Some(mp) = &relation.multipolygon {
            return mp.centroid().is_some_and(|c| c.intersects(&self.aoi));
        }
        if let Some(mls) = &relation.multilinestring {
            return mls.centroid().is_some_and(|c| c.intersects(&self.aoi));
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn test_aoi() -> AreaFilter {
        AreaFilter::new(geo::MultiPolygon::new(vec![polygon![
            (x: 91.085, y: 25.192),
            (x: 91.089, y: 25.192),
            (x: 91.089, y: 25.195),
            (x: 91.085, y: 25.195),
            (x: 91.085, y: 25.192),
        ]]))
    }

    #[test]
    fn point_inside_is_priority() {
        let filter = test_aoi();
        assert!(filter.point_in_aoi(&geo::point!(x: 91.087, y: 25.193)));
    }

    #[test]
    fn point_outside_is_not_priority() {
        let filter = test_aoi();
        assert!(!filter.point_in_aoi(&geo::point!(x: 92.0, y: 26.0)));
    }

    #[test]
    fn empty_aoi_means_everything_is_priority() {
        let filter = AreaFilter::default();
        assert!(filter.point_in_aoi(&geo::point!(x: 0.0, y: 0.0)));
    }

    #[test]
    fn loads_aoi_from_poly_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("aoi.poly");
        fs::write(
            &path,
            "aoi\n1\n  91.085  25.192\n  91.089  25.192\n  91.089  25.195\n  91.085  25.195\n  91.085  25.192\nEND\nEND\n",
        )
        .expect("write poly file");
        let filter = AreaFilter::from_poly_file(&path).expect("parse poly file");
        assert!(!filter.is_empty());
        assert!(filter.point_in_aoi(&geo::point!(x: 91.087, y: 25.193)));
        assert!(!filter.point_in_aoi(&geo::point!(x: 92.0, y: 26.0)));
    }
}
