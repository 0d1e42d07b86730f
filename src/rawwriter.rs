//! Translates object-model mutations into SQL upserts/deletes against
//! the canonical tables. Grounded on the original raw-SQL builder:
//! tags and relation members are JSON literals assembled by
//! concatenating chunked `jsonb_build_object`/`jsonb_build_array`
//! expressions (the backend's JSON constructor functions cap out
//! around 100 arguments, hence the 50-pair chunking), geometries are
//! WKT literals in SRID 4326, and upserts are guarded so a write only
//! lands when the incoming `version` is at least the stored one.

use std::fmt::Write as _;

use geo::CoordsIter;

use crate::model::{MemberType, Node, Relation, Way};
use crate::store::escape_sql;

/// Max key/value pairs per `jsonb_build_object(...)` call.
const TAG_CHUNK: usize = 50;

fn json_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Build a `jsonb_build_object(...)` expression (possibly several,
/// concatenated with `||`) for a tag map. Empty maps yield `'{}'::jsonb`.
#[must_use]
pub fn build_tags_expr(tags: &std::collections::BTreeMap<String, String>) -> String {
    if tags.is_empty() {
        return "'{}'::jsonb".to_string();
    }
    let pairs: Vec<(&String, &String)> = tags.iter().collect();
    let mut chunks = Vec::new();
    for chunk in pairs.chunks(TAG_CHUNK) {
        let mut expr = String::from("jsonb_build_object(");
        for (i, (k, v)) in chunk.iter().enumerate() {
            if i > 0 {
                expr.push(',');
            }
            let _ = write!(
                expr,
                "'{}','{}'",
                escape_sql(&json_escape(k)),
                escape_sql(&json_escape(v))
            );
        }
        expr.push(')');
        chunks.push(expr);
    }
    chunks.join(" || ")
}

/// Build a `jsonb_build_array(jsonb_build_object(...), ...)` expression
/// for relation members.
#[must_use]
pub fn build_members_expr(members: &[crate::model::Member]) -> String {
    if members.is_empty() {
        return "'[]'::jsonb".to_string();
    }
    let objs: Vec<String> = members
        .iter()
        .map(|m| {
            let type_str = match m.member_type {
                MemberType::Node => "node",
                MemberType::Way => "way",
                MemberType::Relation => "relation",
            };
            format!(
                "jsonb_build_object('ref',{},'type','{}','role','{}')",
                m.member_ref,
                type_str,
                escape_sql(&json_escape(&m.role))
            )
        })
        .collect();
    format!("jsonb_build_array({})", objs.join(","))
}

#[must_use]
pub fn point_wkt(point: &geo::Point<f64>) -> String {
    format!("SRID=4326;POINT({:.12} {:.12})", point.x(), point.y())
}

#[must_use]
pub fn linestring_wkt(ls: &geo::LineString<f64>) -> String {
    let coords: Vec<String> = ls
        .coords_iter()
        .map(|c| format!("{:.12} {:.12}", c.x, c.y))
        .collect();
    format!("SRID=4326;LINESTRING({})", coords.join(","))
}

#[must_use]
pub fn polygon_wkt(poly: &geo::Polygon<f64>) -> String {
    let coords: Vec<String> = poly
        .exterior()
        .coords_iter()
        .map(|c| format!("{:.12} {:.12}", c.x, c.y))
        .collect();
    format!("SRID=4326;POLYGON(({}))", coords.join(","))
}

fn refs_array(refs: &[i64]) -> String {
    format!(
        "ARRAY[{}]",
        refs.iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",")
    )
}

/// `apply(node)`: upsert or delete a node row.
#[must_use]
pub fn apply_node(node: &Node) -> Vec<String> {
    let meta = &node.meta;
    if matches!(meta.action, crate::model::Action::Remove) {
        return vec![format!("DELETE FROM nodes WHERE osm_id = {}", meta.osm_id)];
    }
    let Some(point) = node.point.as_ref() else {
        return Vec::new();
    };
    vec![format!(
        "INSERT INTO nodes (osm_id, geom, tags, timestamp, version, \"user\", uid, changeset, priority) \
         VALUES ({}, '{}', {}, {}, {}, '{}', {}, {}, {}) \
         ON CONFLICT (osm_id) DO UPDATE SET \
         geom = EXCLUDED.geom, tags = EXCLUDED.tags, timestamp = EXCLUDED.timestamp, \
         version = EXCLUDED.version, \"user\" = EXCLUDED.\"user\", uid = EXCLUDED.uid, \
         changeset = EXCLUDED.changeset, priority = EXCLUDED.priority \
         WHERE nodes.version <= EXCLUDED.version",
        meta.osm_id,
        point_wkt(point),
        build_tags_expr(&meta.tags),
        timestamp_literal(meta),
        meta.version,
        escape_sql(&meta.user),
        meta.uid,
        meta.changeset,
        meta.priority,
    )]
}

fn timestamp_literal(meta: &crate::model::Meta) -> String {
    meta.timestamp
        .map(|ts| format!("'{}'", ts.to_rfc3339()))
        .unwrap_or_else(|| "now()".to_string())
}

/// `apply(way)`: a way insert is preceded by a full delete of its
/// `way_refs` rows and followed by one insert per ref, then routed to
/// `ways_poly` or `ways_line` depending on closure, deleting
/// unconditionally from the other table.
#[must_use]
pub fn apply_way(way: &Way) -> Vec<String> {
    let mut stmts = Vec::new();
    if matches!(way.meta.action, crate::model::Action::Remove) {
        stmts.push(format!(
            "DELETE FROM ways_line WHERE osm_id = {}",
            way.meta.osm_id
        ));
        stmts.push(format!(
            "DELETE FROM ways_poly WHERE osm_id = {}",
            way.meta.osm_id
        ));
        stmts.push(format!(
            "DELETE FROM way_refs WHERE way_id = {}",
            way.meta.osm_id
        ));
        return stmts;
    }

    if way.refs.len() < 3 {
        return Vec::new();
    }

    let closed = way.is_closed();
    let (target, other) = if closed {
        ("ways_poly", "ways_line")
    } else {
        ("ways_line", "ways_poly")
    };
    let geom = if closed {
        way.polygon.as_ref().map(polygon_wkt)
    } else {
        way.linestring.as_ref().map(linestring_wkt)
    };
    let Some(geom) = geom else {
        return Vec::new();
    };

    stmts.push(format!("DELETE FROM {other} WHERE osm_id = {}", way.meta.osm_id));
    stmts.push(format!(
        "INSERT INTO {target} (osm_id, refs, geom, tags, version, \"user\", uid, changeset, priority) \
         VALUES ({}, {}, '{}', {}, {}, '{}', {}, {}, {}) \
         ON CONFLICT (osm_id) DO UPDATE SET \
         refs = EXCLUDED.refs, geom = EXCLUDED.geom, tags = EXCLUDED.tags, \
         version = EXCLUDED.version, \"user\" = EXCLUDED.\"user\", uid = EXCLUDED.uid, \
         changeset = EXCLUDED.changeset, priority = EXCLUDED.priority \
         WHERE {target}.version <= EXCLUDED.version",
        way.meta.osm_id,
        refs_array(&way.refs),
        geom,
        build_tags_expr(&way.meta.tags),
        way.meta.version,
        escape_sql(&way.meta.user),
        way.meta.uid,
        way.meta.changeset,
        way.meta.priority,
    ));
    stmts.push(format!(
        "DELETE FROM way_refs WHERE way_id = {}",
        way.meta.osm_id
    ));
    for node_id in &way.refs {
        stmts.push(format!(
            "INSERT INTO way_refs (way_id, node_id) VALUES ({}, {node_id})",
            way.meta.osm_id
        ));
    }
    stmts
}

/// `apply(relation)`: upsert the relation row, then delete+reinsert
/// `rel_refs` for every way member.
#[must_use]
pub fn apply_relation(relation: &Relation) -> Vec<String> {
    let mut stmts = Vec::new();
    if matches!(relation.meta.action, crate::model::Action::Remove) {
        stmts.push(format!(
            "DELETE FROM relations WHERE osm_id = {}",
            relation.meta.osm_id
        ));
        stmts.push(format!(
            "DELETE FROM rel_refs WHERE rel_id = {}",
            relation.meta.osm_id
        ));
        return stmts;
    }

    let geom = if let Some(mp) = &relation.multipolygon {
        Some(multipolygon_wkt(mp))
    } else {
        relation
            .multilinestring
            .as_ref()
            .map(multilinestring_wkt)
    };
    let geom_sql = geom.map_or_else(|| "NULL".to_string(), |g| format!("'{g}'"));

    stmts.push(format!(
        "INSERT INTO relations (osm_id, refs, geom, tags, version, \"user\", uid, changeset, priority) \
         VALUES ({}, {}, {}, {}, {}, '{}', {}, {}, {}) \
         ON CONFLICT (osm_id) DO UPDATE SET \
         refs = EXCLUDED.refs, geom = EXCLUDED.geom, tags = EXCLUDED.tags, \
         version = EXCLUDED.version, \"user\" = EXCLUDED.\"user\", uid = EXCLUDED.uid, \
         changeset = EXCLUDED.changeset, priority = EXCLUDED.priority \
         WHERE relations.version <= EXCLUDED.version",
        relation.meta.osm_id,
        build_members_expr(&relation.members),
        geom_sql,
        build_tags_expr(&relation.meta.tags),
        relation.meta.version,
        escape_sql(&relation.meta.user),
        relation.meta.uid,
        relation.meta.changeset,
        relation.meta.priority,
    ));
    stmts.push(format!(
        "DELETE FROM rel_refs WHERE rel_id = {}",
        relation.meta.osm_id
    ));
    for way_id in relation.way_refs() {
        stmts.push(format!(
            "INSERT INTO rel_refs (rel_id, way_id) VALUES ({}, {way_id})",
            relation.meta.osm_id
        ));
    }
    stmts
}

fn multipolygon_wkt(mp: &geo::MultiPolygon<f64>) -> String {
    let polys: Vec<String> = mp
        .iter()
        .map(|p| {
            let coords: Vec<String> = p
                .exterior()
                .coords_iter()
                .map(|c| format!("{:.12} {:.12}", c.x, c.y))
                .collect();
            format!("(({}))", coords.join(","))
        })
        .collect();
    format!("SRID=4326;MULTIPOLYGON({})", polys.join(","))
}

fn multilinestring_wkt(mls: &geo::MultiLineString<f64>) -> String {
    let lines: Vec<String> = mls
        .iter()
        .map(|l| {
            let coords: Vec<String> = l
                .coords_iter()
                .map(|c| format!("{:.12} {:.12}", c.x, c.y))
                .collect();
            format!("({})", coords.join(","))
        })
        .collect();
    format!("SRID=4326;MULTILINESTRING({})", lines.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Member, Meta};
    use std::collections::BTreeMap;

    #[test]
    fn tags_chunk_at_fifty_pairs() {
        let mut tags = BTreeMap::new();
        for i in 0..120 {
            tags.insert(format!("k{i}"), format!("v{i}"));
        }
        let expr = build_tags_expr(&tags);
        assert_eq!(expr.matches("jsonb_build_object(").count(), 3);
    }

    #[test]
    fn empty_tags_are_empty_object() {
        assert_eq!(build_tags_expr(&BTreeMap::new()), "'{}'::jsonb");
    }

    #[test]
    fn short_way_produces_no_insert() {
        let way = Way {
            meta: Meta::default(),
            refs: vec![1, 2],
            linestring: None,
            polygon: None,
        };
        assert!(apply_way(&way).is_empty());
    }

    #[test]
    fn node_priority_flag_is_persisted() {
        let mut node = Node::new(5, 1.0, 2.0);
        node.meta.priority = true;
        let stmts = apply_node(&node);
        assert!(stmts[0].contains("priority"));
        assert!(stmts[0].contains(", true)"));

        node.meta.priority = false;
        let stmts = apply_node(&node);
        assert!(stmts[0].contains(", false)"));
    }

    #[test]
    fn removed_node_emits_delete() {
        let mut node = Node::new(5, 1.0, 2.0);
        node.meta.action = crate::model::Action::Remove;
        let stmts = apply_node(&node);
        assert_eq!(stmts.len(), 1);
        assert!(stmts[0].contains("DELETE FROM nodes WHERE osm_id = 5"));
    }

    #[test]
    fn closed_way_targets_ways_poly() {
        let way = Way {
            meta: Meta::default(),
            refs: vec![1, 2, 3, 1],
            linestring: Some(geo::LineString::new(vec![
                geo::coord! { x: 0., y: 0. },
                geo::coord! { x: 1., y: 0. },
                geo::coord! { x: 1., y: 1. },
                geo::coord! { x: 0., y: 0. },
            ])),
            polygon: Some(geo::Polygon::new(
                geo::LineString::new(vec![
                    geo::coord! { x: 0., y: 0. },
                    geo::coord! { x: 1., y: 0. },
                    geo::coord! { x: 1., y: 1. },
                    geo::coord! { x: 0., y: 0. },
                ]),
                vec![],
            )),
        };
        let stmts = apply_way(&way);
        assert!(stmts[0].contains("ways_line"));
        assert!(stmts[1].contains("ways_poly"));
    }

    #[test]
    fn relation_members_render_as_json_array() {
        let members = vec![Member {
            member_ref: 7,
            member_type: MemberType::Way,
            role: "outer".into(),
        }];
        let expr = build_members_expr(&members);
        assert!(expr.contains("'type','way'"));
        assert!(expr.contains("'role','outer'"));
    }
}
