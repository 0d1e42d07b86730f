//! Bulk ingestion from a PBF snapshot: three ordered passes over the
//! same file — nodes+ways with an inline location index, relation
//! metadata (multipolygon/boundary only), then relation geometry
//! assembly from the cached outer ways.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use osmpbfreader::{OsmObj, OsmPbfReader};
use rustc_hash::FxHashMap;

use crate::model::{Action, Member, MemberType, Meta, Node, Relation, Way};
use crate::multipolygon::assemble_multipolygon;
use crate::store::SqlSink;
use crate::tasker::Tasker;
use crate::{error::Result, info, warn};

/// Runs the three passes below, feeding every constructed entity into
/// `tasker`.
pub fn bootstrap<S: SqlSink>(pbf_path: &Path, tasker: &mut Tasker<'_, S>) -> Result<()> {
    let mut node_locations: FxHashMap<i64, (f64, f64)> = FxHashMap::default();
    let mut way_linestrings: FxHashMap<i64, geo::LineString<f64>> = FxHashMap::default();

    pass_one_nodes_and_ways(pbf_path, tasker, &mut node_locations, &mut way_linestrings)?;
    let relation_cache = pass_two_relation_metadata(pbf_path, tasker)?;
    pass_three_relation_geometry(tasker, &relation_cache, &way_linestrings)?;

    tasker.finish()
}

fn pass_one_nodes_and_ways<S: SqlSink>(
    pbf_path: &Path,
    tasker: &mut Tasker<'_, S>,
    node_locations: &mut FxHashMap<i64, (f64, f64)>,
    way_linestrings: &mut FxHashMap<i64, geo::LineString<f64>>,
) -> Result<()> {
    info!("pass 1: nodes and ways");
    let file = File::open(pbf_path)?;
    let mut reader = OsmPbfReader::new(file);
    for obj in reader.iter() {
        let Ok(obj) = obj else {
            continue;
        };
        match obj {
            OsmObj::Node(n) => {
                let lon = decimicro_to_coord(n.decimicro_lon);
                let lat = decimicro_to_coord(n.decimicro_lat);
                let id = n.id.0;
                node_locations.insert(id, (lon, lat));
                let mut node = Node::new(id, lon, lat);
                node.meta.version = n.info.version.and_then(|v| u64::try_from(v).ok()).unwrap_or(1);
                node.meta.uid = n.info.uid.map(i64::from).unwrap_or(0);
                node.meta.user = n.info.user.as_ref().map(ToString::to_string).unwrap_or_default();
                node.meta.changeset = n.info.changeset.unwrap_or(0);
                node.meta.action = Action::Create;
                node.meta.tags = n.tags.into_inner().into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
                node.meta.priority = true;
                tasker.apply_node(node)?;
            }
            OsmObj::Way(w) => {
                let refs: Vec<i64> = w.nodes.iter().map(|id| id.0).collect();
                if refs.len() < 3 {
                    continue;
                }
                let coords: Option<Vec<geo::Coord<f64>>> = refs
                    .iter()
                    .map(|id| node_locations.get(id).map(|&(lon, lat)| geo::coord! { x: lon, y: lat }))
                    .collect();
                let Some(coords) = coords else {
                    warn!("way {} references a node missing from the location index", w.id.0);
                    continue;
                };
                let linestring = geo::LineString::new(coords);
                let closed = refs.len() > 3 && refs.first() == refs.last();
                let tags = w.tags.into_inner().into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
                let mut way = Way {
                    meta: Meta {
                        osm_id: w.id.0,
                        version: w.info.version.and_then(|v| u64::try_from(v).ok()).unwrap_or(1),
                        uid: w.info.uid.map(i64::from).unwrap_or(0),
                        user: w.info.user.as_ref().map(ToString::to_string).unwrap_or_default(),
                        changeset: w.info.changeset.unwrap_or(0),
                        tags,
                        action: Action::Create,
                        ..Default::default()
                    },
                    refs: refs.clone(),
                    linestring: if closed { None } else { Some(linestring.clone()) },
                    polygon: if closed {
                        Some(geo::Polygon::new(linestring.clone(), vec![]))
                    } else {
                        None
                    },
                };
                way_linestrings.insert(w.id.0, linestring);
                way.meta.priority = true;
                tasker.apply_way(way)?;
            }
            OsmObj::Relation(_) => {}
        }
    }
    Ok(())
}

fn pass_two_relation_metadata<S: SqlSink>(
    pbf_path: &Path,
    _tasker: &mut Tasker<'_, S>,
) -> Result<BTreeMap<i64, Relation>> {
    info!("pass 2: relation metadata");
    let mut cache = BTreeMap::new();
    let file = File::open(pbf_path)?;
    let mut reader = OsmPbfReader::new(file);
    for obj in reader.iter() {
        let Ok(OsmObj::Relation(r)) = obj else {
            continue;
        };
        let tags = tags_from_pbf(&r.tags);
        let is_area = matches!(tags.get("type").map(String::as_str), Some("multipolygon" | "boundary"));
        if !is_area {
            continue;
        }
        let members = r
            .refs
            .iter()
            .map(|m| Member {
                member_ref: m.member.inner_id(),
                member_type: match m.member {
                    osmpbfreader::OsmId::Node(_) => MemberType::Node,
                    osmpbfreader::OsmId::Way(_) => MemberType::Way,
                    osmpbfreader::OsmId::Relation(_) => MemberType::Relation,
                },
                role: m.role.to_string(),
            })
            .collect();
        let relation = Relation {
            meta: Meta {
                osm_id: r.id.0,
                version: r.info.version.and_then(|v| u64::try_from(v).ok()).unwrap_or(1),
                uid: r.info.uid.map(i64::from).unwrap_or(0),
                user: r.info.user.as_ref().map(ToString::to_string).unwrap_or_default(),
                changeset: r.info.changeset.unwrap_or(0),
                tags,
                action: Action::Create,
                priority: true,
            },
            members,
            multipolygon: None,
            multilinestring: None,
        };
        cache.insert(r.id.0, relation);
    }
    Ok(cache)
}

fn pass_three_relation_geometry<S: SqlSink>(
    tasker: &mut Tasker<'_, S>,
    relation_cache: &BTreeMap<i64, Relation>,
    way_linestrings: &FxHashMap<i64, geo::LineString<f64>>,
) -> Result<()> {
    info!("pass 3: relation geometry assembly");
    for relation in relation_cache.values() {
        let mut relation = relation.clone();
        match assemble_multipolygon(&relation.members, |id| way_linestrings.get(&id).cloned()) {
            Some(mp) => relation.multipolygon = Some(mp),
            None => {
                warn!(
                    "relation {}: outer way geometry unavailable, persisting without geometry",
                    relation.meta.osm_id
                );
            }
        }
        tasker.apply_relation(relation)?;
    }
    Ok(())
}

fn tags_from_pbf(tags: &osmpbfreader::Tags) -> crate::model::Tags {
    tags.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
