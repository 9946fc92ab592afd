//! Cache usage reporting

use serde::Serialize;

/// Format a weight as human-readable size (e.g., "1.5 MB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Convert MB to bytes
pub fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

/// Cache size status relative to configured budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSizeStatus {
    /// Under 80% of budget
    Ok,
    /// Between 80% and 100% of budget
    Warning,
    /// At or over the budget (only possible while entries are pinned)
    Exceeded,
}

impl CacheSizeStatus {
    /// Determine status based on current weight and budget
    pub fn from_usage(current: u64, budget: u64) -> Self {
        if budget == 0 {
            return Self::Ok;
        }
        let percent = Self::percentage(current, budget);
        if percent >= 100.0 {
            Self::Exceeded
        } else if percent >= 80.0 {
            Self::Warning
        } else {
            Self::Ok
        }
    }

    /// Get percentage of budget used
    pub fn percentage(current: u64, budget: u64) -> f64 {
        if budget == 0 {
            return 0.0;
        }
        (current as f64 / budget as f64) * 100.0
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Committed entries
    pub entries: usize,
    /// Entries with a live consumer
    pub pinned: usize,
    /// Builds currently reserved
    pub inflight: usize,
    /// Sum of entry weights
    pub total_weight: u64,
    /// Weight budget (`None` = unbounded)
    pub budget: Option<u64>,
    pub hits: u64,
    pub misses: u64,
    /// Lookups that attached to another caller's build
    pub coalesced: u64,
    pub evictions: u64,
    /// Entries dropped for failing the kernel's liveness check
    pub discarded: u64,
}

impl CacheStats {
    /// Usage status against the budget
    pub fn size_status(&self) -> CacheSizeStatus {
        match self.budget {
            Some(budget) => CacheSizeStatus::from_usage(self.total_weight, budget),
            None => CacheSizeStatus::Ok,
        }
    }
}
