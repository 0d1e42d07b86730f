//! Replication client: parses state files, walks the remote directory
//! indexes, downloads and gunzips changeset/osmChange payloads, and
//! locates the replication sequence nearest a target timestamp.
//!
//! Grounded on the teacher's own `update::Update` (state-file parsing,
//! retrying `ureq` download loop), generalised from a single hardcoded
//! minutely dialect to the minute/hour/day/changeset frequencies and
//! their two state-file dialects, and from a local on-disk diff cache
//! to a path-keyed file cache.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use regex::Regex;

use crate::error::{Error, Result};
use crate::{info, warn};

const GZIP_MAGIC: u8 = 0x1f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Minutely,
    Hourly,
    Daily,
    Changeset,
}

impl Frequency {
    #[must_use]
    pub fn data_dir(self) -> &'static str {
        match self {
            Frequency::Minutely => "minute",
            Frequency::Hourly => "hour",
            Frequency::Daily => "day",
            Frequency::Changeset => "changesets",
        }
    }

    #[must_use]
    pub fn payload_extension(self) -> &'static str {
        match self {
            Frequency::Changeset => "osm.gz",
            _ => "osc.gz",
        }
    }
}

/// `(domain, data_dir, frequency, major, minor, index)` where
/// `sequence = major*10^6 + minor*10^3 + index`.
#[derive(Debug, Clone)]
pub struct ReplicationUrl {
    pub domain: String,
    pub frequency: Frequency,
    pub major: u32,
    pub minor: u32,
    pub index: u32,
}

impl ReplicationUrl {
    #[must_use]
    pub fn from_sequence(domain: &str, frequency: Frequency, sequence: u64) -> Self {
        let major = u32::try_from(sequence / 1_000_000).unwrap_or(u32::MAX);
        let minor = u32::try_from((sequence / 1_000) % 1_000).unwrap_or(0);
        let index = u32::try_from(sequence % 1_000).unwrap_or(0);
        ReplicationUrl {
            domain: domain.to_string(),
            frequency,
            major,
            minor,
            index,
        }
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        u64::from(self.major) * 1_000_000 + u64::from(self.minor) * 1_000 + u64::from(self.index)
    }

    /// Roll the index forward, carrying into minor/major at the 999 → 0
    /// boundary.
    pub fn increment(&mut self) {
        if self.index == 999 {
            self.index = 0;
            if self.minor == 999 {
                self.minor = 0;
                self.major += 1;
            } else {
                self.minor += 1;
            }
        } else {
            self.index += 1;
        }
    }

    pub fn decrement(&mut self) {
        if self.index == 0 {
            self.index = 999;
            if self.minor == 0 {
                self.minor = 999;
                self.major = self.major.saturating_sub(1);
            } else {
                self.minor -= 1;
            }
        } else {
            self.index -= 1;
        }
    }

    #[must_use]
    pub fn path(&self) -> String {
        format!(
            "{}/{:03}/{:03}/{:03}",
            self.frequency.data_dir(),
            self.major,
            self.minor,
            self.index
        )
    }

    #[must_use]
    pub fn state_url(&self) -> String {
        format!("{}{}.state.txt", self.domain, self.path())
    }

    #[must_use]
    pub fn data_url(&self) -> String {
        format!(
            "{}{}.{}",
            self.domain,
            self.path(),
            self.frequency.payload_extension()
        )
    }

    #[must_use]
    pub fn major_dir_url(&self) -> String {
        format!("{}{}/{:03}/", self.domain, self.frequency.data_dir(), self.major)
    }

    #[must_use]
    pub fn minor_dir_url(&self) -> String {
        format!(
            "{}{}/{:03}/{:03}/",
            self.domain,
            self.frequency.data_dir(),
            self.major,
            self.minor
        )
    }

    #[must_use]
    pub fn top_dir_url(&self) -> String {
        format!("{}{}/", self.domain, self.frequency.data_dir())
    }
}

/// One parsed state file: a sequence number and its publication
/// timestamp, regardless of which of the two on-wire dialects produced
/// it.
#[derive(Debug, Clone, PartialEq)]
pub struct StateFile {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// Parse a state file in either the changeset dialect (`last_run:
/// <ts>` / `sequence: <n>`) or the minute/hour/day dialect
/// (`sequenceNumber=<n>` / `timestamp=<escaped ISO-8601>`).
pub fn parse_state_file(content: &str) -> Result<StateFile> {
    let mut sequence: Option<u64> = None;
    let mut timestamp: Option<DateTime<Utc>> = None;

    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("sequence:") {
            sequence = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("last_run:") {
            timestamp = parse_iso8601(rest.trim());
        } else if let Some(rest) = line.strip_prefix("sequenceNumber=") {
            sequence = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("timestamp=") {
            let unescaped = rest.replace("\\:", ":");
            timestamp = parse_iso8601(unescaped.trim());
        }
    }

    match (sequence, timestamp) {
        (Some(sequence), Some(timestamp)) => Ok(StateFile { sequence, timestamp }),
        _ => Err(Error::Parse(
            "state file".to_string(),
            "missing sequence or timestamp field".to_string(),
        )),
    }
}

fn parse_iso8601(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Scan an HTML directory listing for anchor hrefs whose first
/// character is a digit, pairing each with the adjacent date column.
/// Recognises both `YYYY-MM-DD HH:MM` and `DD-Mon-YYYY HH:MM`.
pub fn parse_directory_index(html: &str) -> std::collections::BTreeMap<u32, DateTime<Utc>> {
    let anchor_re = Regex::new(r#"<a href="(\d[^"]*)/?">[^<]*</a>\s*([0-9A-Za-z:\- ]{10,20})"#)
        .expect("static regex is valid");
    let mut out = std::collections::BTreeMap::new();
    for caps in anchor_re.captures_iter(html) {
        let href = caps[1].trim_end_matches('/');
        let Ok(index) = href.parse::<u32>() else {
            continue;
        };
        let date_text = caps[2].trim();
        if let Some(ts) = parse_directory_date(date_text) {
            out.insert(index, ts);
        }
    }
    out
}

fn parse_directory_date(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(text, "%d-%b-%Y %H:%M") {
        return Some(naive.and_utc());
    }
    None
}

/// Given a target time and an ordered `{index -> timestamp}` map,
/// locate the index whose interval contains `target`. Applied at three
/// nested levels (major/minor/index directories) by
/// `Client::locate_sequence`.
#[must_use]
pub fn locate_by_timestamp(
    target: DateTime<Utc>,
    entries: &std::collections::BTreeMap<u32, DateTime<Utc>>,
) -> u32 {
    let pairs: Vec<(u32, DateTime<Utc>)> = entries.iter().map(|(&i, &t)| (i, t)).collect();
    if pairs.is_empty() {
        return 0;
    }
    for window in pairs.windows(2) {
        let (prev_index, prev_start) = window[0];
        let (_, next_start) = window[1];
        if (target >= prev_start && target <= next_start) || target < next_start {
            return prev_index;
        }
    }
    let (last_index, last_start) = *pairs.last().expect("non-empty checked above");
    if target >= last_start {
        return last_index;
    }
    pairs[0].0
}

/// Downloads, gunzips, and caches replication artefacts.
pub struct Client {
    agent: ureq::Agent,
    cache_dir: Option<PathBuf>,
}

impl Client {
    #[must_use]
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        Client {
            agent: ureq::Agent::new_with_defaults(),
            cache_dir,
        }
    }

    /// Locate the replication sequence nearest `target` for the given
    /// frequency by descending major → minor → index directory
    /// listings and applying `locate_by_timestamp` at each level.
    pub fn locate_sequence(&self, domain: &str, frequency: Frequency, target: DateTime<Utc>) -> Result<ReplicationUrl> {
        let mut url = ReplicationUrl::from_sequence(domain, frequency, 0);

        let major_html = self.fetch_text(&url.top_dir_url())?;
        let major_entries = parse_directory_index(&major_html);
        url.major = locate_by_timestamp(target, &major_entries);

        let minor_html = self.fetch_text(&url.major_dir_url())?;
        let minor_entries = parse_directory_index(&minor_html);
        url.minor = locate_by_timestamp(target, &minor_entries);

        let index_html = self.fetch_text(&url.minor_dir_url())?;
        let index_entries = parse_directory_index(&index_html);
        url.index = locate_by_timestamp(target, &index_entries);

        info!("located replication sequence {} for target {target}", url.sequence());
        Ok(url)
    }

    fn fetch_text(&self, url: &str) -> Result<String> {
        let body = self.download(url)?;
        String::from_utf8(body)
            .map_err(|e| Error::Parse(url.to_string(), e.to_string()))
    }

    /// HTTPS GET with no redirect/cache-header handling. `not_found`/
    /// `gateway_timeout` map to `RemoteNotFound`; anything else network-
    /// shaped maps to `System`. On success the body gets a trailing
    /// newline appended iff it is not already gzip-compressed.
    pub fn download(&self, url: &str) -> Result<Vec<u8>> {
        if let Some(cached) = self.read_cache(url) {
            match cached {
                Ok(body) => return Ok(body),
                Err(_) => {
                    warn!("evicting corrupt cache entry for {url}");
                    self.evict_cache(url);
                }
            }
        }

        let body = self.download_uncached(url)?;
        self.write_cache(url, &body);
        Ok(body)
    }

    fn download_uncached(&self, url: &str) -> Result<Vec<u8>> {
        let mut response = self.agent.get(url).call().map_err(|e| match &e {
            ureq::Error::StatusCode(404 | 504) => Error::RemoteNotFound(url.to_string()),
            _ => Error::Network(Box::new(e)),
        })?;
        let mut body = Vec::new();
        response
            .body_mut()
            .as_reader()
            .read_to_end(&mut body)
            .map_err(Error::System)?;
        if body.first() != Some(&GZIP_MAGIC) {
            body.push(b'\n');
        }
        Ok(body)
    }

    /// Gunzip a downloaded body; a no-op (returns the input) if it is
    /// not gzip-compressed.
    pub fn gunzip(body: &[u8]) -> Result<Vec<u8>> {
        if body.first() != Some(&GZIP_MAGIC) {
            return Ok(body.to_vec());
        }
        let mut decoder = GzDecoder::new(body);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(Error::System)?;
        Ok(out)
    }

    fn cache_path(&self, url: &str) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        let key = url
            .split('/')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("_");
        Some(dir.join(key))
    }

    fn read_cache(&self, url: &str) -> Option<Result<Vec<u8>>> {
        let path = self.cache_path(url)?;
        if !path.exists() {
            return None;
        }
        Some(fs::read(&path).map_err(Error::System))
    }

    fn write_cache(&self, url: &str, body: &[u8]) {
        let Some(path) = self.cache_path(url) else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = fs::write(&path, body);
    }

    fn evict_cache(&self, url: &str) {
        if let Some(path) = self.cache_path(url) {
            let _ = fs::remove_file(path);
        }
    }
}

/// Read a local DDL/cache file under `dir`, used by tests that need a
/// populated cache without hitting the network.
pub fn seed_cache_file(dir: &Path, url: &str, body: &[u8]) -> std::io::Result<()> {
    let client = Client::new(Some(dir.to_path_buf()));
    let path = client.cache_path(url).expect("cache_dir is Some");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn state_file_minute_dialect_round_trips() {
        let content = "#comment\nsequenceNumber=4230996\ntimestamp=2020-10-09T10\\:03\\:02Z\n";
        let parsed = parse_state_file(content).unwrap();
        assert_eq!(parsed.sequence, 4_230_996);
        assert_eq!(parsed.timestamp.to_rfc3339(), "2020-10-09T10:03:02+00:00");
    }

    #[test]
    fn state_file_changeset_dialect() {
        let content = "---\nlast_run: 2020-10-09T10:03:02Z\nsequence: 42\n";
        let parsed = parse_state_file(content).unwrap();
        assert_eq!(parsed.sequence, 42);
    }

    #[test]
    fn sequence_roundtrips_through_major_minor_index() {
        let url = ReplicationUrl::from_sequence("https://example.test/", Frequency::Minutely, 4_230_996);
        assert_eq!(url.major, 4);
        assert_eq!(url.minor, 230);
        assert_eq!(url.index, 996);
        assert_eq!(url.sequence(), 4_230_996);
    }

    #[test]
    fn increment_carries_at_999() {
        let mut url = ReplicationUrl::from_sequence("https://example.test/", Frequency::Minutely, 999);
        url.increment();
        assert_eq!(url.sequence(), 1000);
        let mut url = ReplicationUrl::from_sequence("https://example.test/", Frequency::Minutely, 999_999);
        url.increment();
        assert_eq!(url.sequence(), 1_000_000);
    }

    #[test]
    fn locator_picks_minute_folder() {
        let mut entries = BTreeMap::new();
        entries.insert(1, parse_directory_date("2014-07-12 05:58").unwrap());
        entries.insert(2, parse_directory_date("2014-07-12 06:03").unwrap());
        let target = parse_directory_date("2014-07-12 06:00").unwrap() + chrono::Duration::seconds(24);
        assert_eq!(locate_by_timestamp(target, &entries), 1);
    }

    #[test]
    fn locator_below_earliest_returns_earliest() {
        let mut entries = BTreeMap::new();
        entries.insert(5, parse_directory_date("2014-07-12 05:58").unwrap());
        entries.insert(6, parse_directory_date("2014-07-12 06:03").unwrap());
        let target = parse_directory_date("2010-01-01 00:00").unwrap();
        assert_eq!(locate_by_timestamp(target, &entries), 5);
    }

    #[test]
    fn locator_above_latest_returns_latest() {
        let mut entries = BTreeMap::new();
        entries.insert(5, parse_directory_date("2014-07-12 05:58").unwrap());
        entries.insert(6, parse_directory_date("2014-07-12 06:03").unwrap());
        let target = parse_directory_date("2030-01-01 00:00").unwrap();
        assert_eq!(locate_by_timestamp(target, &entries), 6);
    }

    #[test]
    fn directory_index_parses_both_date_formats() {
        let html = r#"<a href="123/">123/</a> 2014-07-12 05:58
<a href="124/">124/</a> 12-Jul-2014 06:03"#;
        let entries = parse_directory_index(html);
        assert_eq!(entries.len(), 2);
        assert!(entries.contains_key(&123));
        assert!(entries.contains_key(&124));
    }

    #[test]
    fn gunzip_is_noop_on_plain_body() {
        let body = b"plain text".to_vec();
        assert_eq!(Client::gunzip(&body).unwrap(), body);
    }

    #[test]
    fn cached_download_short_circuits_network() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = "https://planet.openstreetmap.org/replication/minute/000/000/001.state.txt";
        seed_cache_file(dir.path(), url, b"sequenceNumber=1\ntimestamp=2020-01-01T00\\:00\\:00Z\n")
            .expect("seed cache");
        let client = Client::new(Some(dir.path().to_path_buf()));
        let body = client.download(url).expect("cache hit, no network needed");
        assert!(String::from_utf8_lossy(&body).contains("sequenceNumber=1"));
    }
}
