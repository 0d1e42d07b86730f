//! Crate-wide error type.
//!
//! One variant per abstract error kind the engine can surface: parse
//! failures on wire input, remote-not-found replies from the planet
//! server, local filesystem/network failures, store failures, and
//! geometry assembly failures. Component code returns `Result<T, Error>`
//! directly rather than inventing a per-module error enum, so the
//! skip-and-log vs. abort-and-surface policy lives in one place.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parse error in {0}: {1}")]
    Parse(String, String),

    #[error("remote resource not found: {0}")]
    RemoteNotFound(String),

    #[error(transparent)]
    System(#[from] io::Error),

    #[error("local cache inconsistent: {0}")]
    Local(String),

    #[error(transparent)]
    Store(#[from] postgres::Error),

    #[error("geometry error for osm_id {0}: {1}")]
    Geometry(i64, String),

    #[error(transparent)]
    Network(#[from] Box<ureq::Error>),
}

pub type Result<T> = std::result::Result<T, Error>;
