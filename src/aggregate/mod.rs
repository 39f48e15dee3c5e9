use std::collections::BTreeMap;

use chrono::NaiveDate;

/// Placeholder domain for rows where no share target applies or none could
/// be determined.
pub const NO_DOMAIN: &str = "-";

/// Identity of one output row. Uniqueness is mandatory; the day accumulator
/// is a mapping from this key to an event count.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActivityKey {
    pub tenant: String,
    pub date: NaiveDate,
    pub service: String,
    pub activity: &'static str,
    pub country_code: String,
    pub domain: String,
}

impl ActivityKey {
    /// Builds a key, defaulting an empty domain to the `-` placeholder.
    pub fn new(
        tenant: impl Into<String>,
        date: NaiveDate,
        service: impl Into<String>,
        activity: &'static str,
        country_code: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        let domain = domain.into();
        ActivityKey {
            tenant: tenant.into(),
            date,
            service: service.into(),
            activity,
            country_code: country_code.into(),
            domain: if domain.is_empty() {
                NO_DOMAIN.to_string()
            } else {
                domain
            },
        }
    }
}

/// In-memory accumulator for one day's activity counts.
///
/// Both ingestion modes (pre-aggregated buckets and per-document scans) add
/// into the same map; addition is commutative and associative, so visitation
/// order never affects the result.
#[derive(Debug, Default)]
pub struct DayAggregate {
    counts: BTreeMap<ActivityKey, u64>,
}

impl DayAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `count` events under the given key.
    pub fn add(&mut self, key: ActivityKey, count: u64) {
        *self.counts.entry(key).or_insert(0) += count;
    }

    /// Adds a single event under the given key (raw-scan mode).
    pub fn record(&mut self, key: ActivityKey) {
        self.add(key, 1);
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ActivityKey, u64)> {
        self.counts.iter().map(|(k, v)| (k, *v))
    }
}
