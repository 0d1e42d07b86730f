//! OsmChange applier and geometry propagator: parses a
//! Create/Modify/Delete osmChange document, maintains in-memory node
//! and way caches for the duration of one change-file application,
//! discovers every way transitively moved by a modified node and every
//! relation transitively moved by a moved way, rebuilds their
//! geometries, and applies the area filter.
//!
//! The XML walk is grounded on the teacher's `osmxml::OsmXml::copy_to`
//! SAX loop (quick_xml `Event::Start`/`Event::End` over the same
//! node/way/relation/tag/nd/member element set), generalised from a
//! flat node/way/relation stream to one scoped by an outer
//! create/modify/delete action element.

use std::collections::{HashMap, HashSet};

use geo::Centroid;
use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::areafilter::AreaFilter;
use crate::model::{Action, Entity, Member, MemberType, Meta, Node, Relation, Tags, Way};
use crate::multipolygon::{assemble_multipolygon, ring_from_parts};
use crate::rawwriter;
use crate::store::StoreReader;
use crate::{error::Result, info, warn};

/// Parse an osmChange XML document (already decompressed) into the
/// sequence of entities it describes, each tagged with the
/// create/modify/delete action of its enclosing element.
pub fn parse_osmchange(xml: &[u8]) -> Result<Vec<Entity>> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut entities = Vec::new();
    let mut current_action = Action::None;

    let mut cur_meta: Option<Meta> = None;
    let mut cur_kind: Option<&'static str> = None;
    let mut cur_refs: Vec<i64> = Vec::new();
    let mut cur_members: Vec<Member> = Vec::new();
    let mut cur_tags: Tags = Tags::new();
    let mut cur_point: Option<(f64, f64)> = None;

    fn finish(
        kind: &'static str,
        cur_meta: &mut Option<Meta>,
        cur_kind: &mut Option<&'static str>,
        cur_tags: &mut Tags,
        cur_refs: &mut Vec<i64>,
        cur_members: &mut Vec<Member>,
        cur_point: &mut Option<(f64, f64)>,
        entities: &mut Vec<Entity>,
    ) {
        if cur_kind.take() != Some(kind) {
            return;
        }
        let Some(mut meta) = cur_meta.take() else { return };
        meta.tags = std::mem::take(cur_tags);
        match kind {
            "node" => {
                let (lon, lat) = cur_point.take().unwrap_or((0.0, 0.0));
                entities.push(Entity::Node(Node { meta, point: Some(geo::point!(x: lon, y: lat)) }));
            }
            "way" => entities.push(Entity::Way(Way {
                meta,
                refs: std::mem::take(cur_refs),
                linestring: None,
                polygon: None,
            })),
            "relation" => entities.push(Entity::Relation(Relation {
                meta,
                members: std::mem::take(cur_members),
                multipolygon: None,
                multilinestring: None,
            })),
            _ => {}
        }
    }

    loop {
        buf.clear();
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            crate::error::Error::Parse("osmChange".to_string(), format!("at byte {}: {e}", reader.buffer_position()))
        })?;
        match event {
            Event::Eof => break,
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"create" => current_action = Action::Create,
                    b"modify" => current_action = Action::Modify,
                    b"delete" => current_action = Action::Remove,
                    b"node" => {
                        let (meta, lon, lat) = parse_meta_with_point(&e, current_action)?;
                        cur_meta = Some(meta);
                        cur_point = Some((lon, lat));
                        cur_kind = Some("node");
                        cur_tags = Tags::new();
                    }
                    b"way" => {
                        let meta = parse_meta(&e, current_action)?;
                        cur_meta = Some(meta);
                        cur_kind = Some("way");
                        cur_refs = Vec::new();
                        cur_tags = Tags::new();
                    }
                    b"relation" => {
                        let meta = parse_meta(&e, current_action)?;
                        cur_meta = Some(meta);
                        cur_kind = Some("relation");
                        cur_members = Vec::new();
                        cur_tags = Tags::new();
                    }
                    b"tag" => {
                        if let (Some(k), Some(v)) = (attr(&e, b"k"), attr(&e, b"v")) {
                            cur_tags.insert(k, v);
                        }
                    }
                    b"nd" => {
                        if let Some(ref_str) = attr(&e, b"ref") {
                            if let Ok(id) = ref_str.parse() {
                                cur_refs.push(id);
                            }
                        }
                    }
                    b"member" => {
                        let member_ref = attr(&e, b"ref").and_then(|s| s.parse().ok());
                        let member_type = attr(&e, b"type");
                        let role = attr(&e, b"role").unwrap_or_default();
                        if let (Some(member_ref), Some(member_type)) = (member_ref, member_type) {
                            let member_type = match member_type.as_str() {
                                "node" => MemberType::Node,
                                "way" => MemberType::Way,
                                "relation" => MemberType::Relation,
                                other => {
                                    warn!("osmChange member has unsupported type {other}, skipping");
                                    continue;
                                }
                            };
                            cur_members.push(Member { member_ref, member_type, role });
                        }
                    }
                    _ => {}
                }
            }
            Event::Empty(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"node" => {
                        let (meta, lon, lat) = parse_meta_with_point(&e, current_action)?;
                        cur_meta = Some(meta);
                        cur_point = Some((lon, lat));
                        cur_kind = Some("node");
                        cur_tags = Tags::new();
                        finish("node", &mut cur_meta, &mut cur_kind, &mut cur_tags, &mut cur_refs, &mut cur_members, &mut cur_point, &mut entities);
                    }
                    b"way" => {
                        let meta = parse_meta(&e, current_action)?;
                        cur_meta = Some(meta);
                        cur_kind = Some("way");
                        cur_refs = Vec::new();
                        cur_tags = Tags::new();
                        finish("way", &mut cur_meta, &mut cur_kind, &mut cur_tags, &mut cur_refs, &mut cur_members, &mut cur_point, &mut entities);
                    }
                    b"relation" => {
                        let meta = parse_meta(&e, current_action)?;
                        cur_meta = Some(meta);
                        cur_kind = Some("relation");
                        cur_members = Vec::new();
                        cur_tags = Tags::new();
                        finish("relation", &mut cur_meta, &mut cur_kind, &mut cur_tags, &mut cur_refs, &mut cur_members, &mut cur_point, &mut entities);
                    }
                    b"tag" => {
                        if let (Some(k), Some(v)) = (attr(&e, b"k"), attr(&e, b"v")) {
                            cur_tags.insert(k, v);
                        }
                    }
                    b"nd" => {
                        if let Some(ref_str) = attr(&e, b"ref") {
                            if let Ok(id) = ref_str.parse() {
                                cur_refs.push(id);
                            }
                        }
                    }
                    b"member" => {
                        let member_ref = attr(&e, b"ref").and_then(|s| s.parse().ok());
                        let member_type = attr(&e, b"type");
                        let role = attr(&e, b"role").unwrap_or_default();
                        if let (Some(member_ref), Some(member_type)) = (member_ref, member_type) {
                            let member_type = match member_type.as_str() {
                                "node" => MemberType::Node,
                                "way" => MemberType::Way,
                                "relation" => MemberType::Relation,
                                other => {
                                    warn!("osmChange member has unsupported type {other}, skipping");
                                    continue;
                                }
                            };
                            cur_members.push(Member { member_ref, member_type, role });
                        }
                    }
                    _ => {}
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"create" | b"modify" | b"delete" => current_action = Action::None,
                b"node" => finish("node", &mut cur_meta, &mut cur_kind, &mut cur_tags, &mut cur_refs, &mut cur_members, &mut cur_point, &mut entities),
                b"way" => finish("way", &mut cur_meta, &mut cur_kind, &mut cur_tags, &mut cur_refs, &mut cur_members, &mut cur_point, &mut entities),
                b"relation" => finish("relation", &mut cur_meta, &mut cur_kind, &mut cur_tags, &mut cur_refs, &mut cur_members, &mut cur_point, &mut entities),
                _ => {}
            },
            _ => {}
        }
    }
    Ok(entities)
}

fn attr(e: &quick_xml::events::BytesStart, key: &[u8]) -> Option<String> {
    e.attributes().filter_map(std::result::Result::ok).find(|a| a.key.as_ref() == key).map(|a| {
        String::from_utf8_lossy(&a.value).into_owned()
    })
}

fn parse_meta(e: &quick_xml::events::BytesStart, action: Action) -> Result<Meta> {
    Ok(Meta {
        osm_id: attr(e, b"id").and_then(|s| s.parse().ok()).unwrap_or(0),
        version: attr(e, b"version").and_then(|s| s.parse().ok()).unwrap_or(1),
        timestamp: attr(e, b"timestamp").and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok()).map(|dt| dt.with_timezone(&chrono::Utc)),
        uid: attr(e, b"uid").and_then(|s| s.parse().ok()).unwrap_or(0),
        user: attr(e, b"user").unwrap_or_default(),
        changeset: attr(e, b"changeset").and_then(|s| s.parse().ok()).unwrap_or(0),
        tags: Tags::new(),
        action,
        priority: false,
    })
}

fn parse_meta_with_point(e: &quick_xml::events::BytesStart, action: Action) -> Result<(Meta, f64, f64)> {
    let meta = parse_meta(e, action)?;
    let lon = attr(e, b"lon").and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let lat = attr(e, b"lat").and_then(|s| s.parse().ok()).unwrap_or(0.0);
    Ok((meta, lon, lat))
}

/// Applies one parsed osmChange to the store, propagating geometry
/// changes through ways and relations that transitively reference a
/// moved node. Generic over `store::StoreReader` rather than the
/// concrete `Store`, so the wave-propagation logic below can be
/// exercised against an in-memory fake.
pub struct Applier<'a, S: StoreReader> {
    store: &'a S,
    area: &'a AreaFilter,
}

impl<'a, S: StoreReader> Applier<'a, S> {
    #[must_use]
    pub fn new(store: &'a S, area: &'a AreaFilter) -> Self {
        Applier { store, area }
    }

    pub fn apply(&self, entities: Vec<Entity>) -> Result<()> {
        info!("applying osmChange with {} top-level entities", entities.len());
        let mut removed_ways: HashSet<i64> = HashSet::new();
        let mut removed_relations: HashSet<i64> = HashSet::new();
        let mut moved_node_ids: Vec<i64> = Vec::new();
        let mut direct_ways: Vec<Way> = Vec::new();
        let mut direct_relations: Vec<Relation> = Vec::new();
        let mut direct_nodes: Vec<Node> = Vec::new();
        let mut node_ref_fetch: HashSet<i64> = HashSet::new();

        for entity in entities {
            match entity {
                Entity::Node(mut node) => {
                    if let Some(point) = &node.point {
                        let in_aoi = self.area.point_in_aoi(point);
                        node.meta.priority = in_aoi;
                        if node.meta.action == Action::Modify && in_aoi {
                            moved_node_ids.push(node.meta.osm_id);
                        }
                    }
                    direct_nodes.push(node);
                }
                Entity::Way(way) => {
                    if way.meta.action == Action::Remove {
                        removed_ways.insert(way.meta.osm_id);
                    } else {
                        node_ref_fetch.extend(way.refs.iter().copied());
                    }
                    direct_ways.push(way);
                }
                Entity::Relation(relation) => {
                    if relation.meta.action == Action::Remove {
                        removed_relations.insert(relation.meta.osm_id);
                    }
                    direct_relations.push(relation);
                }
            }
        }

        // Wave 1: ways moved by node motion, discovered via `way_refs`.
        let mut indirect_ways = Vec::new();
        if !moved_node_ids.is_empty() {
            let direct_ids: HashSet<i64> = direct_ways.iter().map(|w| w.meta.osm_id).collect();
            let way_ids: Vec<i64> = self
                .store
                .ways_referencing_nodes(&moved_node_ids)?
                .into_iter()
                .filter(|id| !removed_ways.contains(id) && !direct_ids.contains(id))
                .collect();
            if !way_ids.is_empty() {
                indirect_ways = self.store.fetch_ways(&way_ids)?;
                for way in &indirect_ways {
                    node_ref_fetch.extend(way.refs.iter().copied());
                }
            }
        }

        // Wave 2: relations moved by way motion, discovered via `rel_refs`.
        let mut indirect_relations = Vec::new();
        let moved_way_ids: Vec<i64> = indirect_ways.iter().map(|w| w.meta.osm_id).collect();
        if !moved_way_ids.is_empty() {
            let direct_ids: HashSet<i64> = direct_relations.iter().map(|r| r.meta.osm_id).collect();
            let rel_ids: Vec<i64> = self
                .store
                .relations_referencing_ways(&moved_way_ids)?
                .into_iter()
                .filter(|id| !removed_relations.contains(id) && !direct_ids.contains(id))
                .collect();
            if !rel_ids.is_empty() {
                indirect_relations = self.store.fetch_relations(&rel_ids)?;
            }
        }

        // Load every referenced node not already present in the change
        // file itself, in one batch query.
        let known_node_ids: HashSet<i64> = direct_nodes.iter().map(|n| n.meta.osm_id).collect();
        let missing: Vec<i64> = node_ref_fetch.difference(&known_node_ids).copied().collect();
        let mut node_cache: HashMap<i64, (f64, f64)> = direct_nodes
            .iter()
            .filter_map(|n| n.point.map(|p| (n.meta.osm_id, (p.x(), p.y()))))
            .collect();
        if !missing.is_empty() {
            node_cache.extend(self.store.node_locations(&missing)?);
        }

        // Rebuild geometry for every way in the change set, direct or
        // indirect, and persist.
        let mut way_geoms: HashMap<i64, (Option<geo::LineString<f64>>, Option<geo::Polygon<f64>>)> = HashMap::new();
        for way in direct_ways.into_iter().chain(indirect_ways) {
            if way.meta.action == Action::Remove {
                self.store.query(&join(&rawwriter::apply_way(&way)))?;
                continue;
            }
            let mut way = way;
            self.rebuild_way_geometry(&mut way, &node_cache);
            way_geoms.insert(way.meta.osm_id, (way.linestring.clone(), way.polygon.clone()));
            self.store.query(&join(&rawwriter::apply_way(&way)))?;
        }

        // Relations rebuild last; a relation whose outer way geometry
        // is unknown is persisted with updated metadata but flagged
        // non-priority rather than failing the whole change file.
        for relation in direct_relations.into_iter().chain(indirect_relations) {
            if relation.meta.action == Action::Remove {
                self.store.query(&join(&rawwriter::apply_relation(&relation)))?;
                continue;
            }
            let mut relation = relation;
            self.rebuild_relation_geometry(&mut relation, &way_geoms);
            self.store.query(&join(&rawwriter::apply_relation(&relation)))?;
        }

        for node in direct_nodes {
            self.store.query(&join(&rawwriter::apply_node(&node)))?;
        }

        Ok(())
    }

    fn rebuild_way_geometry(&self, way: &mut Way, node_cache: &HashMap<i64, (f64, f64)>) {
        let coords: Vec<geo::Coord<f64>> = way
            .refs
            .iter()
            .filter_map(|id| node_cache.get(id).map(|&(lon, lat)| geo::coord! { x: lon, y: lat }))
            .collect();
        if coords.len() != way.refs.len() {
            warn!(
                "way {}: {} of {} referenced nodes unavailable, geometry partially rebuilt",
                way.meta.osm_id,
                way.refs.len() - coords.len(),
                way.refs.len()
            );
        }
        let linestring = geo::LineString::new(coords);
        let closed = way.is_closed();
        let in_aoi = if closed {
            self.area.polygon_in_aoi(&geo::Polygon::new(linestring.clone(), vec![]))
        } else {
            self.area.linestring_in_aoi(&linestring)
        };
        way.meta.priority = in_aoi;
        if closed {
            way.polygon = Some(geo::Polygon::new(linestring, vec![]));
            way.linestring = None;
        } else {
            way.linestring = Some(linestring);
            way.polygon = None;
        }
    }

    fn rebuild_relation_geometry(
        &self,
        relation: &mut Relation,
        way_geoms: &HashMap<i64, (Option<geo::LineString<f64>>, Option<geo::Polygon<f64>>)>,
    ) {
        if relation.is_multipolygon() {
            let mp = assemble_multipolygon(&relation.members, |id| {
                way_geoms.get(&id).and_then(|(ls, poly)| ring_from_parts(ls.as_ref(), poly.as_ref()))
            });
            match mp {
                Some(mp) => {
                    relation.multipolygon = Some(mp);
                    relation.meta.priority = self.area.relation_in_aoi(relation);
                }
                None => {
                    warn!(
                        "relation {}: outer way geometry unavailable, persisting without geometry",
                        relation.meta.osm_id
                    );
                    relation.multipolygon = None;
                    relation.meta.priority = false;
                }
            }
            return;
        }

        let lines: Vec<geo::LineString<f64>> = relation
            .members
            .iter()
            .filter(|m| m.member_type == MemberType::Way)
            .filter_map(|m| way_geoms.get(&m.member_ref).and_then(|(ls, _)| ls.clone()))
            .collect();
        if lines.is_empty() {
            relation.multilinestring = None;
            relation.meta.priority = false;
            return;
        }
        let mls = geo::MultiLineString::new(lines);
        relation.meta.priority = mls.centroid().is_some_and(|c| self.area.point_in_aoi(&c));
        relation.multilinestring = Some(mls);
    }
}

fn join(stmts: &[String]) -> String {
    let mut sql = String::new();
    for stmt in stmts {
        sql.push_str(stmt);
        sql.push_str(";\n");
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHANGE: &str = r#"<osmChange version="0.6">
<create>
  <node id="1" version="1" lat="25.193" lon="91.087"/>
</create>
<modify>
  <node id="2" version="2" lat="25.193" lon="92.087"/>
</modify>
<delete>
  <way id="3" version="2"/>
</delete>
</osmChange>"#;

    #[test]
    fn parses_create_modify_delete_blocks() {
        let entities = parse_osmchange(CHANGE.as_bytes()).unwrap();
        assert_eq!(entities.len(), 3);
        match &entities[0] {
            Entity::Node(n) => assert_eq!(n.meta.action, Action::Create),
            _ => panic!("expected node"),
        }
        match &entities[1] {
            Entity::Node(n) => assert_eq!(n.meta.action, Action::Modify),
            _ => panic!("expected node"),
        }
        match &entities[2] {
            Entity::Way(w) => {
                assert_eq!(w.meta.action, Action::Remove);
                assert_eq!(w.meta.osm_id, 3);
            }
            _ => panic!("expected way"),
        }
    }

    #[test]
    fn way_with_tags_and_nodes_parses() {
        let xml = r#"<osmChange version="0.6"><modify>
<way id="10" version="3">
  <nd ref="1"/>
  <nd ref="2"/>
  <nd ref="3"/>
  <tag k="highway" v="residential"/>
</way>
</modify></osmChange>"#;
        let entities = parse_osmchange(xml.as_bytes()).unwrap();
        match &entities[0] {
            Entity::Way(w) => {
                assert_eq!(w.refs, vec![1, 2, 3]);
                assert_eq!(w.meta.tags.get("highway").map(String::as_str), Some("residential"));
            }
            _ => panic!("expected way"),
        }
    }

    /// In-memory `StoreReader`, so the wave-propagation and AOI-priority
    /// logic in `apply()` can be exercised without a live PostgreSQL
    /// instance, the same way `tasker::tests::FakeSink` stands in for
    /// the write path.
    #[derive(Default)]
    struct FakeStore {
        queries: std::sync::Mutex<Vec<String>>,
        way_refs: HashMap<i64, Vec<i64>>,
        rel_refs: HashMap<i64, Vec<i64>>,
        nodes: HashMap<i64, (f64, f64)>,
        ways: HashMap<i64, Way>,
        relations: HashMap<i64, Relation>,
    }

    impl crate::store::SqlSink for FakeStore {
        fn query(&self, sql: &str) -> Result<()> {
            self.queries.lock().unwrap().push(sql.to_string());
            Ok(())
        }
    }

    impl StoreReader for FakeStore {
        fn ways_referencing_nodes(&self, node_ids: &[i64]) -> Result<Vec<i64>> {
            Ok(node_ids.iter().filter_map(|id| self.way_refs.get(id)).flatten().copied().collect())
        }

        fn relations_referencing_ways(&self, way_ids: &[i64]) -> Result<Vec<i64>> {
            Ok(way_ids.iter().filter_map(|id| self.rel_refs.get(id)).flatten().copied().collect())
        }

        fn node_locations(&self, node_ids: &[i64]) -> Result<HashMap<i64, (f64, f64)>> {
            Ok(node_ids.iter().filter_map(|id| self.nodes.get(id).map(|&p| (*id, p))).collect())
        }

        fn fetch_ways(&self, ids: &[i64]) -> Result<Vec<Way>> {
            Ok(ids.iter().filter_map(|id| self.ways.get(id).cloned()).collect())
        }

        fn fetch_relations(&self, ids: &[i64]) -> Result<Vec<Relation>> {
            Ok(ids.iter().filter_map(|id| self.relations.get(id).cloned()).collect())
        }
    }

    fn test_aoi() -> AreaFilter {
        AreaFilter::new(geo::MultiPolygon::new(vec![geo::polygon![
            (x: 91.085, y: 25.192),
            (x: 91.089, y: 25.192),
            (x: 91.089, y: 25.195),
            (x: 91.085, y: 25.195),
            (x: 91.085, y: 25.192),
        ]]))
    }

    fn way(osm_id: i64, refs: Vec<i64>) -> Way {
        Way {
            meta: Meta { osm_id, action: Action::ModifyGeom, ..Default::default() },
            refs,
            ..Default::default()
        }
    }

    /// S5: a modified node inside the AOI must persist `priority=true`,
    /// one outside must persist `priority=false`.
    #[test]
    fn apply_sets_node_priority_from_aoi() {
        let store = FakeStore::default();
        let area = test_aoi();
        let applier = Applier::new(&store, &area);

        let inside = Node::new(1, 91.087, 25.193);
        let outside = Node::new(2, 92.0, 26.0);
        applier.apply(vec![Entity::Node(inside), Entity::Node(outside)]).unwrap();

        let queries = store.queries.lock().unwrap();
        let inside_query = queries.iter().find(|q| q.contains("(1, '")).expect("node 1 insert");
        let outside_query = queries.iter().find(|q| q.contains("(2, '")).expect("node 2 insert");
        assert!(inside_query.contains(", true) ON CONFLICT"), "in-AOI node should persist priority=true: {inside_query}");
        assert!(outside_query.contains(", false) ON CONFLICT"), "out-of-AOI node should persist priority=false: {outside_query}");
    }

    /// S2: a way not present in the change file, but referencing a node
    /// that moved, must be discovered via `way_refs` and have its
    /// geometry rebuilt and persisted — likewise one further hop out to
    /// a relation via `rel_refs`.
    #[test]
    fn apply_propagates_through_indirect_ways_and_relations() {
        let mut store = FakeStore::default();
        store.nodes.insert(2, (91.0865, 25.193));
        store.nodes.insert(3, (91.0875, 25.193));
        store.way_refs.insert(1, vec![42]);
        store.ways.insert(42, way(42, vec![2, 3, 2]));
        store.rel_refs.insert(42, vec![99]);
        store.relations.insert(
            99,
            Relation {
                meta: Meta { osm_id: 99, action: Action::ModifyGeom, ..Default::default() },
                members: vec![Member { member_ref: 42, member_type: MemberType::Way, role: "outer".into() }],
                ..Default::default()
            },
        );
        let area = AreaFilter::default();
        let applier = Applier::new(&store, &area);

        let mut moved = Node::new(1, 91.087, 25.193);
        moved.meta.action = Action::Modify;
        applier.apply(vec![Entity::Node(moved)]).unwrap();

        let queries = store.queries.lock().unwrap().join("\n");
        assert!(queries.contains("42"), "indirect way 42 should be rebuilt and persisted: {queries}");
        assert!(queries.contains("99"), "indirect relation 99 should be rebuilt and persisted: {queries}");
    }
}
