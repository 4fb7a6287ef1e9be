use serde::{Deserialize, Serialize};

use crate::storage::blink::page::{MAX_PAGE_SIZE, MIN_PAGE_SIZE, PAGE_HEADER_LEN};
use crate::types::{BlinkError, Result};

/// Where a full page is cut when it splits.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// Cut at the byte midpoint.
    #[default]
    Balanced,
    /// When the failing insert appends past the last entry of a last-in-level
    /// page, keep everything but the last entry on the left page.
    Compact,
}

/// Configuration for an index store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexOptions {
    /// Physical page size in bytes
    pub page_size: usize,
    /// Page format version stamped on formatted pages
    pub format_version: u8,
    /// Optional cap on slots per page (forces splits at small counts)
    pub max_entries_per_page: Option<usize>,
    /// Values longer than this percentage of the usable page area are externalized
    pub externalize_percent: u8,
    /// Split-position policy
    pub split_policy: SplitPolicy,
    /// Descents attempted before a stale page fetch becomes an access error
    pub descend_attempts: u32,
    /// Whether iterators may reopen at a remembered page
    pub page_hints: bool,
    /// Whether commit forces the WAL
    pub flush_on_commit: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            format_version: 1,
            max_entries_per_page: None,
            externalize_percent: 25,
            split_policy: SplitPolicy::Balanced,
            descend_attempts: 3,
            page_hints: true,
            flush_on_commit: true,
        }
    }
}

impl IndexOptions {
    /// Parses options from TOML; absent keys keep their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let options: IndexOptions =
            toml::from_str(src).map_err(|err| BlinkError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| BlinkError::Config(err.to_string()))
    }

    /// Checks that the options describe a usable page layout.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(BlinkError::Invalid("page_size out of range"));
        }
        if self.format_version == 0 {
            return Err(BlinkError::Invalid("format_version must be non-zero"));
        }
        if matches!(self.max_entries_per_page, Some(max) if max < 3) {
            return Err(BlinkError::Invalid("max_entries_per_page must be at least 3"));
        }
        if !(1..=100).contains(&self.externalize_percent) {
            return Err(BlinkError::Invalid("externalize_percent must be within 1..=100"));
        }
        if self.descend_attempts == 0 {
            return Err(BlinkError::Invalid("descend_attempts must be positive"));
        }
        Ok(())
    }

    /// Bytes available to slots and records on one page.
    pub fn usable_page_bytes(&self) -> usize {
        self.page_size - PAGE_HEADER_LEN
    }

    /// Sets the page size.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the page format version.
    pub fn format_version(mut self, version: u8) -> Self {
        self.format_version = version;
        self
    }

    /// Caps the number of slots per page.
    pub fn max_entries_per_page(mut self, max: usize) -> Self {
        self.max_entries_per_page = Some(max);
        self
    }

    /// Sets the externalization threshold.
    pub fn externalize_percent(mut self, percent: u8) -> Self {
        self.externalize_percent = percent;
        self
    }

    /// Sets the split policy.
    pub fn split_policy(mut self, policy: SplitPolicy) -> Self {
        self.split_policy = policy;
        self
    }

    /// Sets the bounded descend retry count.
    pub fn descend_attempts(mut self, attempts: u32) -> Self {
        self.descend_attempts = attempts;
        self
    }

    /// Enables or disables hinted reopen.
    pub fn page_hints(mut self, enabled: bool) -> Self {
        self.page_hints = enabled;
        self
    }

    /// Enables or disables forcing the WAL on commit.
    pub fn flush_on_commit(mut self, enabled: bool) -> Self {
        self.flush_on_commit = enabled;
        self
    }
}
