//! Tunable settings for building and querying an index store.
//!
//! Every setting resolves from an explicit value first, then its
//! environment variable, then the built-in default.

use std::{fmt, str::FromStr, time::Duration};

use crate::error::{Error, Result};

pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_MAX_CHARS: usize = 1200;
pub const DEFAULT_MAX_SEQ_LEN: usize = 256;
pub const DEFAULT_MAX_RETRIES: usize = 2;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);
pub const DEFAULT_TOP_K: usize = 5;
/// Largest `top_k` accepted by the public retrieval entry point.
pub const MAX_TOP_K: usize = 20;

pub const BATCH_SIZE_ENV_VAR: &str = "BOOKSEARCH_BATCH_SIZE";
pub const MAX_CHARS_ENV_VAR: &str = "BOOKSEARCH_MAX_CHARS";
pub const MAX_SEQ_LEN_ENV_VAR: &str = "BOOKSEARCH_MAX_SEQ_LEN";
pub const LAYOUT_ENV_VAR: &str = "BOOKSEARCH_STORE_LAYOUT";

/// On-disk representation of the vector half of an index store.
///
/// Both layouts pair the vectors with the same redb metadata table and
/// answer queries by exact distance computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum StoreLayout {
    /// Raw f32 vector file, loaded fully into memory and scanned in parallel.
    #[default]
    Flat,
    /// Vectors kept in a redb table and scanned from disk on every query.
    Redb,
}

impl StoreLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreLayout::Flat => "flat",
            StoreLayout::Redb => "redb",
        }
    }

    /// Layout from `BOOKSEARCH_STORE_LAYOUT`, or the default.
    pub fn from_env() -> Result<Self> {
        match std::env::var(LAYOUT_ENV_VAR) {
            Ok(val) => val.parse(),
            Err(_) => Ok(StoreLayout::default()),
        }
    }
}

impl fmt::Display for StoreLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreLayout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat" | "v2" => Ok(StoreLayout::Flat),
            "redb" | "v1" => Ok(StoreLayout::Redb),
            other => Err(Error::Config(format!(
                "unknown store layout '{other}' (expected 'flat' or 'redb')"
            ))),
        }
    }
}

/// Settings for a single index build run.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Rows embedded per model call.
    pub batch_size: usize,
    /// Character budget for the description part of a passage.
    pub max_chars: usize,
    /// Extra attempts for a failed embedding batch before the build aborts.
    pub max_retries: usize,
    /// Fixed pause between attempts.
    pub retry_backoff: Duration,
    /// Continue from the last checkpoint left by an interrupted build.
    pub resume: bool,
    pub layout: StoreLayout,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_chars: DEFAULT_MAX_CHARS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            resume: false,
            layout: StoreLayout::Flat,
        }
    }
}

impl BuildOptions {
    /// Defaults overridden by `BOOKSEARCH_BATCH_SIZE`,
    /// `BOOKSEARCH_MAX_CHARS` and `BOOKSEARCH_STORE_LAYOUT`.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            batch_size: env_usize(BATCH_SIZE_ENV_VAR, DEFAULT_BATCH_SIZE)?,
            max_chars: env_usize(MAX_CHARS_ENV_VAR, DEFAULT_MAX_CHARS)?,
            layout: StoreLayout::from_env()?,
            ..Self::default()
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Read a positive integer from the environment, falling back to `default`
/// when the variable is unset.
pub fn env_usize(var: &str, default: usize) -> Result<usize> {
    match std::env::var(var) {
        Ok(val) => val.trim().parse().map_err(|_| {
            Error::Config(format!(
                "{var} must be a non-negative integer, got '{val}'"
            ))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_parses_names_and_generations() {
        assert_eq!("flat".parse::<StoreLayout>().unwrap(), StoreLayout::Flat);
        assert_eq!("REDB".parse::<StoreLayout>().unwrap(), StoreLayout::Redb);
        assert_eq!("v2".parse::<StoreLayout>().unwrap(), StoreLayout::Flat);
        assert!("faiss".parse::<StoreLayout>().is_err());
    }

    #[test]
    fn default_build_options_are_conservative() {
        let opts = BuildOptions::default();
        assert_eq!(opts.batch_size, 32);
        assert_eq!(opts.max_chars, 1200);
        assert!(!opts.resume);
        opts.validate().unwrap();
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let opts = BuildOptions {
            batch_size: 0,
            ..BuildOptions::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn env_usize_uses_default_when_unset() {
        let value = env_usize("BOOKSEARCH_TEST_SURELY_UNSET_VAR", 7).unwrap();
        assert_eq!(value, 7);
    }
}
