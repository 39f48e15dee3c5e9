use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

/// Placeholder country code for unresolvable addresses.
pub const UNKNOWN_COUNTRY: &str = "-";

/// Resolved location facts for one address. Coordinates are kept in their
/// stored string form; empty means unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoLocation {
    pub country_code: String,
    pub longitude: String,
    pub latitude: String,
}

impl GeoLocation {
    fn unknown() -> Self {
        GeoLocation {
            country_code: UNKNOWN_COUNTRY.to_string(),
            longitude: String::new(),
            latitude: String::new(),
        }
    }
}

/// IP-to-location database, consumed as a pure lookup.
pub trait GeoLookup {
    /// Looks up a bare IP address (no port). `None` when the address is not
    /// covered by the database.
    fn lookup(&self, ip: IpAddr) -> Option<GeoLocation>;
}

/// Strips an embedded port from `host:port` and `[ipv6]:port` forms.
pub fn strip_port(raw: &str) -> &str {
    if let Some(rest) = raw.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    if let Some((host, _)) = raw.rsplit_once(':') {
        if host.parse::<Ipv4Addr>().is_ok() {
            return host;
        }
    }
    raw
}

/// Per-run geolocation resolver.
///
/// Memoizes ip -> country and keeps the first-seen coordinates per country
/// for the duration of a run; geo facts are not re-fetched mid-run.
pub struct GeoResolver<G> {
    db: G,
    by_ip: HashMap<String, String>,
    coordinates: HashMap<String, (String, String)>,
}

impl<G: GeoLookup> GeoResolver<G> {
    pub fn new(db: G) -> Self {
        GeoResolver {
            db,
            by_ip: HashMap::new(),
            coordinates: HashMap::new(),
        }
    }

    /// Resolves a raw address (optionally `host:port` or `[ipv6]:port`) to a
    /// country code. Empty or unresolvable input degrades to `-`.
    pub fn resolve(&mut self, raw: &str) -> String {
        if raw.is_empty() {
            return UNKNOWN_COUNTRY.to_string();
        }
        if let Some(country) = self.by_ip.get(raw) {
            return country.clone();
        }

        let bare = strip_port(raw);
        let location = match bare.parse::<IpAddr>() {
            Ok(ip) => self.db.lookup(ip).unwrap_or_else(GeoLocation::unknown),
            Err(_) => {
                warn!(address = raw, "unparseable source address");
                GeoLocation::unknown()
            }
        };

        self.coordinates
            .entry(location.country_code.clone())
            .or_insert((location.longitude, location.latitude));
        self.by_ip
            .insert(raw.to_string(), location.country_code.clone());
        location.country_code
    }

    /// First-seen coordinates for a country this run; empty when unknown.
    pub fn coordinates(&self, country_code: &str) -> (String, String) {
        self.coordinates
            .get(country_code)
            .cloned()
            .unwrap_or_default()
    }
}

/// Range-file location database.
///
/// Loads `ip_from,ip_to,country_code,longitude,latitude` CSV rows (decimal
/// addresses, IPv4 as plain u32, IPv6 as its 128-bit value) into a sorted
/// table and answers lookups by binary search.
pub struct RangeDb {
    ranges: Vec<Range>,
}

#[derive(Debug)]
struct Range {
    from: u128,
    to: u128,
    country_code: String,
    longitude: String,
    latitude: String,
}

impl RangeDb {
    /// Loads the database from a CSV range file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading geo database {}", path.display()))?;

        let mut ranges = Vec::new();
        for (lineno, line) in data.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(|f| f.trim_matches('"')).collect();
            if fields.len() < 5 {
                warn!(line = lineno + 1, "skipping short geo database row");
                continue;
            }
            let (Ok(from), Ok(to)) = (fields[0].parse::<u128>(), fields[1].parse::<u128>()) else {
                warn!(line = lineno + 1, "skipping unparseable geo database row");
                continue;
            };
            ranges.push(Range {
                from,
                to,
                country_code: fields[2].to_string(),
                longitude: fields[3].to_string(),
                latitude: fields[4].to_string(),
            });
        }
        ranges.sort_by_key(|r| r.from);

        Ok(RangeDb { ranges })
    }
}

impl GeoLookup for RangeDb {
    fn lookup(&self, ip: IpAddr) -> Option<GeoLocation> {
        let value = match ip {
            IpAddr::V4(v4) => u32::from(v4) as u128,
            IpAddr::V6(v6) => u128::from(v6),
        };

        let idx = self.ranges.partition_point(|r| r.from <= value);
        let range = self.ranges[..idx].last()?;
        if value > range.to {
            return None;
        }
        let country_code = range.country_code.trim();
        if country_code.is_empty() {
            return None;
        }
        Some(GeoLocation {
            country_code: country_code.to_string(),
            longitude: range.longitude.trim().to_string(),
            latitude: range.latitude.trim().to_string(),
        })
    }
}
