//! Underpass: an OpenStreetMap ingestion engine. Bootstraps a
//! PostgreSQL/PostGIS store from a planet PBF snapshot, then keeps it
//! current by applying the minutely/hourly/daily replication stream,
//! propagating geometry changes through ways and relations that
//! reference a moved node, and tracking changeset metadata with an
//! optional area-of-interest priority filter.

pub mod applier;
pub mod areafilter;
pub mod changeset;
pub mod config;
pub mod error;
pub mod log;
pub mod model;
pub mod multipolygon;
pub mod pbf;
pub mod rawwriter;
pub mod replication;
pub mod store;
pub mod tasker;
