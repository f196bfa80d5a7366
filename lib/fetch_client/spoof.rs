use std::path::Path;

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.2478.51",
];

// Zero octets are wildcards filled in per request.
const DEFAULT_IP_PREFIXES: &[&str] = &[
    "36.56.0.0",
    "58.14.0.0",
    "60.0.0.0",
    "101.4.0.0",
    "106.80.0.0",
    "112.64.0.0",
    "116.1.0.0",
    "121.76.0.0",
    "183.0.0.0",
    "222.16.0.0",
];

#[derive(Error, Debug)]
pub enum SpoofError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not a JSON array of strings: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} must contain at least one entry")]
    Empty { path: String },
}

/// Supplies randomized `User-Agent` and regional `X-Forwarded-For` values.
#[derive(Debug, Clone)]
pub struct HeaderSpoofer {
    user_agents: Vec<String>,
    ip_prefixes: Vec<String>,
}

impl Default for HeaderSpoofer {
    fn default() -> Self {
        Self {
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            ip_prefixes: DEFAULT_IP_PREFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl HeaderSpoofer {
    /// Builds a spoofer, replacing either built-in list with a JSON array read from disk.
    pub fn from_files(
        user_agents_file: Option<&Path>,
        ip_prefixes_file: Option<&Path>,
    ) -> Result<Self, SpoofError> {
        let mut spoofer = Self::default();
        if let Some(path) = user_agents_file {
            spoofer.user_agents = load_string_list(path)?;
        }
        if let Some(path) = ip_prefixes_file {
            spoofer.ip_prefixes = load_string_list(path)?;
        }
        Ok(spoofer)
    }

    pub fn random_user_agent(&self) -> String {
        self.user_agents
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_default()
    }

    pub fn random_regional_ip(&self) -> String {
        let mut rng = rand::thread_rng();
        let Some(prefix) = self.ip_prefixes.choose(&mut rng) else {
            return String::new();
        };
        prefix
            .split('.')
            .map(|octet| match octet.trim().parse::<u8>() {
                Ok(0) => rng.gen_range(0..=255u8).to_string(),
                _ => octet.trim().to_string(),
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

fn load_string_list(path: &Path) -> Result<Vec<String>, SpoofError> {
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| SpoofError::Read {
        path: display.clone(),
        source,
    })?;
    let entries: Vec<String> = serde_json::from_str(&raw).map_err(|source| SpoofError::Parse {
        path: display.clone(),
        source,
    })?;
    if entries.is_empty() {
        return Err(SpoofError::Empty { path: display });
    }
    Ok(entries)
}
