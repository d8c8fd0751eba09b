use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::fingerprint::HashKind;

/// Top-level proxy configuration. Defaults reproduce the stock deployment;
/// every empirical constant (thresholds, minimum sizes) is tunable here
/// rather than baked into the detection code.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_port: u16,
    pub suffix_list_path: PathBuf,
    pub corpus_path: PathBuf,
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    /// Pages smaller than this are too small to fingerprint reliably.
    pub min_html_bytes: usize,
    /// Minimum fraction of high-contrast pixels for a usable header crop.
    pub min_header_complexity: f64,
    /// Rendered viewport height in pixels.
    pub viewport_height: u32,
    /// Height of the page-header crop in pixels.
    pub header_strip_px: u32,
    pub max_connections: usize,
    pub thresholds: MatchThresholds,
    pub cache: CacheConfig,
    pub timeouts: TimeoutConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 52078,
            suffix_list_path: PathBuf::from("public_suffix_list.dat"),
            corpus_path: PathBuf::from("data.db"),
            ca_cert_path: PathBuf::from("phisherman-ca.crt"),
            ca_key_path: PathBuf::from("phisherman-ca.key"),
            min_html_bytes: 4096,
            min_header_complexity: 0.10,
            viewport_height: 1080,
            header_strip_px: 100,
            max_connections: 1024,
            thresholds: MatchThresholds::default(),
            cache: CacheConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Config {
    /// Loads a JSON overlay file on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Self, std::io::Error> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Per-hash-kind similarity thresholds. Fuzzy-hash scores run 0..=100;
/// perceptual-hash scores count agreeing bits out of 64, so the two
/// families carry distinct threshold ranges.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchThresholds {
    pub html_ssdeep: i64,
    pub image_ssdeep: i64,
    pub edges_ssdeep: i64,
    pub header_ssdeep: i64,
    pub image_phash: i64,
    pub edges_phash: i64,
    pub header_phash: i64,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            html_ssdeep: 30,
            image_ssdeep: 30,
            edges_ssdeep: 28,
            header_ssdeep: 25,
            image_phash: 35,
            edges_phash: 38,
            header_phash: 40,
        }
    }
}

impl MatchThresholds {
    pub fn for_kind(&self, kind: HashKind) -> i64 {
        match kind {
            HashKind::HtmlSsdeep => self.html_ssdeep,
            HashKind::ImageSsdeep => self.image_ssdeep,
            HashKind::EdgesSsdeep => self.edges_ssdeep,
            HashKind::HeaderSsdeep => self.header_ssdeep,
            HashKind::ImagePhash => self.image_phash,
            HashKind::EdgesPhash => self.edges_phash,
            HashKind::HeaderPhash => self.header_phash,
        }
    }
}

/// Verdict cache eviction policy. Clearing is wholesale: re-scanning is
/// preferred over staleness.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub clear_interval_secs: u64,
    pub size_poll_secs: u64,
    pub max_entries: usize,
    pub status_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            clear_interval_secs: 60 * 60 * 24,
            size_poll_secs: 10,
            max_entries: 10_000,
            status_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn clear_interval(&self) -> Duration {
        Duration::from_secs(self.clear_interval_secs)
    }

    pub fn size_poll(&self) -> Duration {
        Duration::from_secs(self.size_poll_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub head_read_secs: u64,
    pub fetch_secs: u64,
    pub render_secs: u64,
    pub dial_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            head_read_secs: 600,
            fetch_secs: 60,
            render_secs: 60,
            dial_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn head_read(&self) -> Duration {
        Duration::from_secs(self.head_read_secs)
    }

    pub fn fetch(&self) -> Duration {
        Duration::from_secs(self.fetch_secs)
    }

    pub fn render(&self) -> Duration {
        Duration::from_secs(self.render_secs)
    }

    pub fn dial(&self) -> Duration {
        Duration::from_secs(self.dial_secs)
    }
}
