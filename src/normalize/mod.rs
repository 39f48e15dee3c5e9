use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

use crate::catalog::{Activity, ServiceFamily};

/// Canonical per-event record. Ephemeral: exists only while a day is being
/// aggregated, never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRecord {
    pub tenant: String,
    /// Event date in the process-local timezone.
    pub date: NaiveDate,
    pub ip: String,
    /// Sharing-target email domain; empty when none could be determined.
    pub domain: String,
}

/// Maps one raw vendor event to the canonical record.
///
/// Never fails: missing or malformed fields degrade to empty strings, and an
/// unparseable timestamp falls back to the day under processing so the
/// aggregation always completes.
pub fn normalize(
    family: ServiceFamily,
    activity: Activity,
    source: &Value,
    tz: FixedOffset,
    fallback_date: NaiveDate,
) -> ActivityRecord {
    let tenant = str_field(source, "tenant");
    let date = source["@timestamp"]
        .as_str()
        .and_then(|ts| local_date(ts, tz))
        .unwrap_or(fallback_date);

    let ip = match family {
        ServiceFamily::GoogleApps => str_field(source, "ipAddress"),
        ServiceFamily::Office365 => str_field(source, "ClientIP"),
        ServiceFamily::Lineworks | ServiceFamily::Box => str_field(source, "ip_address"),
        ServiceFamily::Dropbox => source["origin"]["geo_location"]["ip_address"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        ServiceFamily::Aws => str_field(source, "sourceIPAddress"),
    };

    let domain = if activity == Activity::Share {
        share_domain(family, source)
    } else {
        String::new()
    };

    ActivityRecord {
        tenant,
        date,
        ip,
        domain,
    }
}

/// Parses an event timestamp, tolerating both the explicit-UTC form
/// (`...Z` / `...+00:00`) and the bare form (assumed UTC), then converts to
/// the given local offset and truncates to a calendar date.
fn local_date(ts: &str, tz: FixedOffset) -> Option<NaiveDate> {
    let dt: DateTime<Utc> = if let Ok(parsed) = DateTime::parse_from_rfc3339(ts) {
        parsed.with_timezone(&Utc)
    } else {
        NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()?
            .and_utc()
    };
    Some(dt.with_timezone(&tz).date_naive())
}

/// Recovers the sharing-target email domain from family-specific structures.
fn share_domain(family: ServiceFamily, source: &Value) -> String {
    match family {
        ServiceFamily::GoogleApps => googleapps_share_domain(source),
        ServiceFamily::Office365 => email_domain(&str_field(source, "TargetUserOrGroupName")),
        ServiceFamily::Box => email_domain(
            source["accessible_by"]["login"]
                .as_str()
                .unwrap_or_default(),
        ),
        ServiceFamily::Dropbox => {
            email_domain(source["context"]["email"].as_str().unwrap_or_default())
        }
        // No share-target information is available for these vendors.
        ServiceFamily::Lineworks | ServiceFamily::Aws => String::new(),
    }
}

/// Scans the Google audit event list for a sharing change: within a matching
/// event, a `primary_event` parameter flagged true marks the parameters that
/// follow as authoritative, and the next `target_user` value carries the
/// share target.
fn googleapps_share_domain(source: &Value) -> String {
    const SHARE_EVENTS: [&str; 3] = [
        "change_user_access",
        "change_acl_editors",
        "shared_drive_membership_change",
    ];

    let Some(events) = source["events"].as_array() else {
        return String::new();
    };

    for event in events {
        let name = event["name"].as_str().unwrap_or_default();
        if !SHARE_EVENTS.contains(&name) {
            continue;
        }
        let Some(parameters) = event["parameters"].as_array() else {
            continue;
        };
        let mut primary = false;
        for parameter in parameters {
            let pname = parameter["name"].as_str().unwrap_or_default();
            if pname == "primary_event" && parameter["boolValue"].as_bool() == Some(true) {
                primary = true;
                continue;
            }
            if primary && pname == "target_user" {
                if let Some(value) = parameter["value"].as_str().filter(|v| !v.is_empty()) {
                    return email_domain(value);
                }
            }
        }
    }

    String::new()
}

/// Extracts the domain part of an email address. A leading `@` does not
/// count as a separator.
fn email_domain(address: &str) -> String {
    match address.rfind('@') {
        Some(at) if at > 0 => address[at + 1..].to_string(),
        _ => String::new(),
    }
}

fn str_field(source: &Value, field: &str) -> String {
    source[field].as_str().unwrap_or_default().to_string()
}
