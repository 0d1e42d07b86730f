//! Configuration layer: environment variables and shared CLI flags.
//!
//! A connection string is provided either by `--database-url` or by
//! the `UNDERPASS_DATABASE_URL` environment variable; the planet
//! server similarly by `--server` or `UNDERPASS_PLANET_SERVER`.

pub const DEFAULT_PLANET_SERVER: &str = "https://planet.openstreetmap.org/replication/";
pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[must_use]
pub fn database_url(flag: Option<&str>) -> Option<String> {
    flag.map(str::to_string)
        .or_else(|| std::env::var("UNDERPASS_DATABASE_URL").ok())
}

#[must_use]
pub fn planet_server(flag: Option<&str>) -> String {
    flag.map(str::to_string)
        .or_else(|| std::env::var("UNDERPASS_PLANET_SERVER").ok())
        .unwrap_or_else(|| DEFAULT_PLANET_SERVER.to_string())
}

#[must_use]
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_takes_priority_over_env() {
        assert_eq!(
            planet_server(Some("https://example.test/replication/")),
            "https://example.test/replication/"
        );
    }

    #[test]
    fn falls_back_to_default() {
        assert_eq!(planet_server(None), DEFAULT_PLANET_SERVER);
    }
}
