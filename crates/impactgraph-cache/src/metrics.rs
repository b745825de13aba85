use serde::{Deserialize, Serialize};

/// Cache performance statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    /// Puts refused because an invalidation for a newer version already ran.
    pub rejected_puts: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        1.0 - self.hit_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn hit_rate_of_empty_stats_is_zero() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
        assert_relative_eq!(stats.miss_rate(), 1.0);
    }

    #[test]
    fn hit_rate_counts_hits_over_lookups() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_relative_eq!(stats.hit_rate(), 0.75);
    }
}
