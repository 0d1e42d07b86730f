//! The object model: Node, Way, Relation sharing common metadata by
//! composition (a tagged union over a common `Meta` record rather than
//! the source's `OsmObject` base class).

use std::collections::BTreeMap;

/// Ordered `key -> value` tag map; `BTreeMap` keeps key order
/// deterministic across the tag-JSON and round-trip tests.
pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Create,
    Modify,
    Remove,
    ModifyGeom,
}

impl Default for Action {
    fn default() -> Self {
        Action::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberType {
    Node,
    Way,
    Relation,
}

/// Metadata shared by every entity kind.
#[derive(Debug, Clone, Default)]
pub struct Meta {
    pub osm_id: i64,
    pub version: u64,
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub uid: i64,
    pub user: String,
    pub changeset: i64,
    pub tags: Tags,
    pub action: Action,
    /// In-AOI flag, set by the area filter.
    pub priority: bool,
}

/// Longitude at index 0, latitude at index 1.
pub type Point = geo::Point<f64>;

#[derive(Debug, Clone)]
pub struct Node {
    pub meta: Meta,
    pub point: Option<Point>,
}

impl Node {
    pub fn new(osm_id: i64, lon: f64, lat: f64) -> Self {
        Node {
            meta: Meta {
                osm_id,
                ..Default::default()
            },
            point: Some(geo::point!(x: lon, y: lat)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Way {
    pub meta: Meta,
    pub refs: Vec<i64>,
    pub linestring: Option<geo::LineString<f64>>,
    pub polygon: Option<geo::Polygon<f64>>,
}

impl Way {
    /// A way is closed iff it has more than 3 refs and the first and
    /// last ids are equal.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.refs.len() > 3 && self.refs.first() == self.refs.last()
    }
}

#[derive(Debug, Clone)]
pub struct Member {
    pub member_ref: i64,
    pub member_type: MemberType,
    pub role: String,
}

#[derive(Debug, Clone, Default)]
pub struct Relation {
    pub meta: Meta,
    pub members: Vec<Member>,
    pub multipolygon: Option<geo::MultiPolygon<f64>>,
    pub multilinestring: Option<geo::MultiLineString<f64>>,
}

impl Relation {
    #[must_use]
    pub fn is_multipolygon(&self) -> bool {
        matches!(
            self.meta.tags.get("type").map(String::as_str),
            Some("multipolygon" | "boundary")
        )
    }

    /// Way ids referenced by this relation, in member order.
    pub fn way_refs(&self) -> impl Iterator<Item = i64> + '_ {
        self.members
            .iter()
            .filter(|m| m.member_type == MemberType::Way)
            .map(|m| m.member_ref)
    }
}

#[derive(Debug, Clone)]
pub enum Entity {
    Node(Node),
    Way(Way),
    Relation(Relation),
}

impl Entity {
    #[must_use]
    pub fn meta(&self) -> &Meta {
        match self {
            Entity::Node(n) => &n.meta,
            Entity::Way(w) => &w.meta,
            Entity::Relation(r) => &r.meta,
        }
    }

    #[must_use]
    pub fn meta_mut(&mut self) -> &mut Meta {
        match self {
            Entity::Node(n) => &mut n.meta,
            Entity::Way(w) => &mut w.meta,
            Entity::Relation(r) => &mut r.meta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn way_closed_requires_more_than_three_refs() {
        let mut way = Way {
            refs: vec![1, 2, 1],
            ..Default::default()
        };
        assert!(!way.is_closed(), "3 refs forming a ring is still not closed");
        way.refs = vec![1, 2, 3, 1];
        assert!(way.is_closed());
    }

    #[test]
    fn way_open_when_endpoints_differ() {
        let way = Way {
            refs: vec![1, 2, 3, 4],
            ..Default::default()
        };
        assert!(!way.is_closed());
    }

    #[test]
    fn node_point_orders_lon_then_lat() {
        let node = Node::new(1, 2.5, 48.1);
        let pt = node.point.unwrap();
        assert_eq!(pt.x(), 2.5);
        assert_eq!(pt.y(), 48.1);
    }

    #[test]
    fn relation_multipolygon_type_detection() {
        let mut rel = Relation::default();
        rel.meta.tags.insert("type".into(), "multipolygon".into());
        assert!(rel.is_multipolygon());
        rel.meta.tags.insert("type".into(), "route".into());
        assert!(!rel.is_multipolygon());
    }
}
