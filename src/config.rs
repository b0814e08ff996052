use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Runtime configuration, loaded from a TOML file. Every field has a
/// default so a missing file or a partial file both work.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where in-flight request ledger entries live (one file per request).
    pub ledger_dir: PathBuf,
    /// Where generated index artifacts live.
    pub cache_dir: PathBuf,
    /// Root of the harvested archive: `<archive_root>/<job_id>/...`
    pub archive_root: PathBuf,
    /// Max index generations in flight at once; beyond this the inbound
    /// listener detaches until a job completes.
    pub max_concurrent_jobs: usize,
    /// Inbound channel depth between transport and server loop.
    pub inbound_queue: usize,
    /// Deadline for one CDX index scan, in seconds.
    pub cdx_scan_timeout_secs: u64,
    /// Deadline for one crawl-log index scan, in seconds. The observed
    /// production bound is a full day.
    pub crawl_log_scan_timeout_secs: u64,
    /// Mime regex for the dedup crawl-log cache.
    pub dedup_mime_filter: String,
    /// true: filter is a blacklist; false: whitelist.
    pub dedup_mime_blacklist: bool,
    /// Unix socket accepting index request envelopes.
    pub request_socket: PathBuf,
    /// Unix socket of the scheduler that receives ready notices.
    pub ready_socket: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("warc-idx");
        Self {
            ledger_dir: base.join("requests"),
            cache_dir: base.join("cache"),
            archive_root: base.join("archive"),
            max_concurrent_jobs: 4,
            inbound_queue: 32,
            cdx_scan_timeout_secs: 60 * 60,
            crawl_log_scan_timeout_secs: 24 * 60 * 60,
            dedup_mime_filter: "^text/.*$".to_string(),
            dedup_mime_blacklist: false,
            request_socket: base.join("idx-request.sock"),
            ready_socket: base.join("idx-ready.sock"),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file '{}'", path.display()))?;
                let config = toml::from_str(&raw)
                    .with_context(|| format!("parsing config file '{}'", path.display()))?;
                Ok(config)
            }
        }
    }
}
