use dashmap::DashMap;

/// Query outcome categories tallied by the statistics sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatKind {
    /// Answered from the cache.
    Cache,
    /// Answered by a TCP upstream.
    Tcp,
    /// No upstream answered within the timeout.
    Refused,
    /// Upstream reply dropped by the response filter.
    Blocked,
}

/// Statistics sink. The forwarder only names this interface; heavier
/// reporting backends plug in behind it.
pub trait Statistics: Send + Sync {
    fn record(&self, kind: StatKind, domain: &str);
}

pub struct NoopStatistics;

impl Statistics for NoopStatistics {
    fn record(&self, _kind: StatKind, _domain: &str) {}
}

/// In-process per-kind counters.
#[derive(Default)]
pub struct CounterStatistics {
    counts: DashMap<StatKind, u64>,
}

impl CounterStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, kind: StatKind) -> u64 {
        self.counts.get(&kind).map(|c| *c).unwrap_or(0)
    }
}

impl Statistics for CounterStatistics {
    fn record(&self, kind: StatKind, _domain: &str) {
        *self.counts.entry(kind).or_insert(0) += 1;
    }
}

/// Verdict of the IP-mapping response filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// Carries an address the filter rejects.
    Filtered,
    /// A deliberate negative answer (poisoned or empty decoy).
    Negative,
}

/// Classifies raw upstream replies before they reach the cache.
pub trait ResponseFilter: Send + Sync {
    fn classify(&self, response: &[u8]) -> Verdict;
}

pub struct AcceptAll;

impl ResponseFilter for AcceptAll {
    fn classify(&self, _response: &[u8]) -> Verdict {
        Verdict::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_statistics() {
        let stats = CounterStatistics::new();
        stats.record(StatKind::Cache, "example.com");
        stats.record(StatKind::Cache, "example.org");
        stats.record(StatKind::Tcp, "example.com");
        assert_eq!(stats.count(StatKind::Cache), 2);
        assert_eq!(stats.count(StatKind::Tcp), 1);
        assert_eq!(stats.count(StatKind::Refused), 0);
    }

    #[test]
    fn test_accept_all() {
        assert_eq!(AcceptAll.classify(b"anything"), Verdict::Pass);
    }
}
