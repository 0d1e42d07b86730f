//! Multipolygon ring assembly: a relation's outer/inner boundary is
//! frequently split across several way segments rather than carried by
//! a single closed way, so the member ways must be stitched end to end
//! before the multipolygon can be built. Grounded on the two-step
//! shape of the original C++ implementation's
//! `osmium::area::MultipolygonManager`/`Assembler` pair (gather member
//! way geometries, then assemble rings from them); `geo` has no ring
//! assembler of its own, so the shared-endpoint stitch is implemented
//! directly here.

use geo::{Coord, Intersects, LineString, MultiPolygon, Point, Polygon};

use crate::model::{Member, MemberType};

/// Coordinates closer than this are treated as the same node — member
/// ways meeting at a shared node carry the identical coordinate, so an
/// exact-ish comparison is enough without a spatial index.
const COORD_EPSILON: f64 = 1e-9;

fn coords_close(a: &Coord<f64>, b: &Coord<f64>) -> bool {
    (a.x - b.x).abs() < COORD_EPSILON && (a.y - b.y).abs() < COORD_EPSILON
}

fn is_closed(coords: &[Coord<f64>]) -> bool {
    coords.len() > 3 && coords.first().zip(coords.last()).is_some_and(|(a, b)| coords_close(a, b))
}

/// Greedily stitch `segments` into as many closed rings as can be
/// formed by chaining segments that share an endpoint. Segments left
/// over once no chain can be extended further are dropped; the caller
/// logs when the result is short of what was asked for.
fn assemble_rings(mut segments: Vec<LineString<f64>>) -> Vec<LineString<f64>> {
    let mut rings = Vec::new();
    while !segments.is_empty() {
        let mut coords: Vec<Coord<f64>> = segments.remove(0).0;
        while !is_closed(&coords) {
            let Some(last) = coords.last().copied() else { break };
            let next = segments.iter().position(|seg| {
                seg.0.first().is_some_and(|c| coords_close(c, &last))
                    || seg.0.last().is_some_and(|c| coords_close(c, &last))
            });
            let Some(idx) = next else { break };
            let mut seg_coords = segments.remove(idx).0;
            if seg_coords.first().is_some_and(|c| coords_close(c, &last)) {
                seg_coords.remove(0);
            } else {
                seg_coords.reverse();
                seg_coords.remove(0);
            }
            coords.extend(seg_coords);
        }
        if is_closed(&coords) {
            rings.push(LineString::new(coords));
        }
    }
    rings
}

fn ring_inside(outer: &LineString<f64>, inner: &LineString<f64>) -> bool {
    inner.0.first().is_some_and(|c| Point::from(*c).intersects(&Polygon::new(outer.clone(), vec![])))
}

/// Assemble a relation's `outer`/`inner` way members into a
/// `MultiPolygon`, stitching multi-segment boundaries and pairing each
/// interior ring with the exterior ring it falls inside. `lookup`
/// resolves a member way id to its cached linestring (the closed-way
/// case is expected to hand back the polygon's exterior ring).
/// Returns `None` if no outer ring could be closed, signalling the
/// caller to fall back to its soft-failure path.
pub fn assemble_multipolygon(
    members: &[Member],
    lookup: impl Fn(i64) -> Option<LineString<f64>>,
) -> Option<MultiPolygon<f64>> {
    let mut outer_segments = Vec::new();
    let mut inner_segments = Vec::new();
    for m in members {
        if m.member_type != MemberType::Way {
            continue;
        }
        let Some(geom) = lookup(m.member_ref) else {
            continue;
        };
        if m.role == "inner" {
            inner_segments.push(geom);
        } else {
            outer_segments.push(geom);
        }
    }

    let outer_rings = assemble_rings(outer_segments);
    if outer_rings.is_empty() {
        return None;
    }
    let inner_rings = assemble_rings(inner_segments);

    let polygons: Vec<Polygon<f64>> = outer_rings
        .into_iter()
        .map(|outer| {
            let holes: Vec<LineString<f64>> =
                inner_rings.iter().filter(|inner| ring_inside(&outer, inner)).cloned().collect();
            Polygon::new(outer, holes)
        })
        .collect();
    Some(MultiPolygon::new(polygons))
}

/// Resolve a way member's geometry from the pbf/applier caches, which
/// store a closed way's ring as a `polygon` rather than a `linestring`.
#[must_use]
pub fn ring_from_parts(linestring: Option<&LineString<f64>>, polygon: Option<&Polygon<f64>>) -> Option<LineString<f64>> {
    linestring.cloned().or_else(|| polygon.map(|p| p.exterior().clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(coords: &[(f64, f64)]) -> LineString<f64> {
        LineString::new(coords.iter().map(|&(x, y)| Coord { x, y }).collect())
    }

    #[test]
    fn single_closed_way_is_one_ring() {
        let members = vec![Member { member_ref: 1, member_type: MemberType::Way, role: "outer".into() }];
        let square = seg(&[(0., 0.), (1., 0.), (1., 1.), (0., 1.), (0., 0.)]);
        let mp = assemble_multipolygon(&members, |id| if id == 1 { Some(square.clone()) } else { None }).unwrap();
        assert_eq!(mp.0.len(), 1);
    }

    #[test]
    fn two_segments_stitch_into_one_ring() {
        let members = vec![
            Member { member_ref: 1, member_type: MemberType::Way, role: "outer".into() },
            Member { member_ref: 2, member_type: MemberType::Way, role: "outer".into() },
        ];
        let half_a = seg(&[(0., 0.), (1., 0.), (1., 1.)]);
        let half_b = seg(&[(0., 0.), (0., 1.), (1., 1.)]);
        let mp = assemble_multipolygon(&members, |id| match id {
            1 => Some(half_a.clone()),
            2 => Some(half_b.clone()),
            _ => None,
        })
        .unwrap();
        assert_eq!(mp.0.len(), 1);
        assert!(mp.0[0].exterior().0.len() >= 5);
    }

    #[test]
    fn inner_ring_becomes_a_hole() {
        let members = vec![
            Member { member_ref: 1, member_type: MemberType::Way, role: "outer".into() },
            Member { member_ref: 2, member_type: MemberType::Way, role: "inner".into() },
        ];
        let outer = seg(&[(0., 0.), (10., 0.), (10., 10.), (0., 10.), (0., 0.)]);
        let inner = seg(&[(2., 2.), (4., 2.), (4., 4.), (2., 4.), (2., 2.)]);
        let mp = assemble_multipolygon(&members, |id| match id {
            1 => Some(outer.clone()),
            2 => Some(inner.clone()),
            _ => None,
        })
        .unwrap();
        assert_eq!(mp.0[0].interiors().len(), 1);
    }

    #[test]
    fn unclosable_segments_yield_no_multipolygon() {
        let members = vec![Member { member_ref: 1, member_type: MemberType::Way, role: "outer".into() }];
        let dangling = seg(&[(0., 0.), (1., 0.), (1., 1.)]);
        let mp = assemble_multipolygon(&members, |id| if id == 1 { Some(dangling.clone()) } else { None });
        assert!(mp.is_none());
    }

    #[test]
    fn missing_outer_member_yields_none() {
        let members = vec![Member { member_ref: 1, member_type: MemberType::Way, role: "outer".into() }];
        let mp = assemble_multipolygon(&members, |_| None);
        assert!(mp.is_none());
    }
}
