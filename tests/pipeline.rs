use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Mutex;

use anyhow::Result;
use chrono::{FixedOffset, NaiveDate};
use serde_json::json;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

use auditoor::checkpoint::Checkpoint;
use auditoor::config::SearchConfig;
use auditoor::driver::Runner;
use auditoor::geo::{GeoLocation, GeoLookup};
use auditoor::report::{ReportRow, ReportSink};
use auditoor::search::Client;

/// Static geo lookup for the two documentation addresses used below.
struct StaticGeo;

impl GeoLookup for StaticGeo {
    fn lookup(&self, ip: IpAddr) -> Option<GeoLocation> {
        match ip.to_string().as_str() {
            "203.0.113.9" => Some(GeoLocation {
                country_code: "JP".to_string(),
                longitude: "139.69".to_string(),
                latitude: "35.68".to_string(),
            }),
            "198.51.100.5" => Some(GeoLocation {
                country_code: "US".to_string(),
                longitude: "-97.82".to_string(),
                latitude: "37.75".to_string(),
            }),
            _ => None,
        }
    }
}

/// In-memory report store with the destination's upsert semantics: the
/// non-metric columns are the primary key, last writer wins.
#[derive(Default)]
struct MemorySink {
    rows: Mutex<BTreeMap<(String, NaiveDate, String, String, String, String), ReportRow>>,
}

impl MemorySink {
    fn snapshot(&self) -> Vec<ReportRow> {
        self.rows.lock().unwrap().values().cloned().collect()
    }
}

impl ReportSink for MemorySink {
    async fn write_day(&self, _day: NaiveDate, rows: &[ReportRow]) -> Result<()> {
        let mut stored = self.rows.lock().unwrap();
        for row in rows {
            stored.insert(
                (
                    row.tenant.clone(),
                    row.date,
                    row.service.clone(),
                    row.activity.clone(),
                    row.country_code.clone(),
                    row.domain.clone(),
                ),
                row.clone(),
            );
        }
        Ok(())
    }
}

/// JST local day 2024-06-01 spans the UTC shards 2024.05.31 and 2024.06.01.
const DAY_SEARCH_PATH: &str =
    "/serviceaudit_box01_*2024.05.31,serviceaudit_box01_*2024.06.01/_search";

async fn mount_backend(server: &MockServer, runs: u64) {
    Mock::given(method("GET"))
        .and(path("/_aliases"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "serviceaudit_box01_2024.06.01": { "aliases": {} },
            "someother_index": {}
        })))
        .mount(server)
        .await;

    // Aggregated activities: one tenant bucket with one ip bucket of 42.
    Mock::given(method("POST"))
        .and(path(DAY_SEARCH_PATH))
        .and(query_param_is_missing("scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hits": { "total": { "value": 42 }, "hits": [] },
            "aggregations": {
                "group_by_tenant": {
                    "buckets": [{
                        "key": "acme",
                        "doc_count": 42,
                        "group_by_ip": {
                            "buckets": [{ "key": "203.0.113.9", "doc_count": 42 }]
                        }
                    }]
                }
            }
        })))
        .mount(server)
        .await;

    // Share activity: raw scan, one page of two events then an empty page.
    Mock::given(method("POST"))
        .and(path(DAY_SEARCH_PATH))
        .and(query_param("scroll", "1m"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_scroll_id": "cursor-1",
            "hits": {
                "total": { "value": 2 },
                "hits": [
                    {
                        "_source": {
                            "tenant": "acme",
                            "@timestamp": "2024-06-01T03:00:00Z",
                            "ip_address": "198.51.100.5",
                            "accessible_by": { "login": "partner@example.com" }
                        }
                    },
                    {
                        "_source": {
                            "tenant": "acme",
                            "@timestamp": "2024-06-01T04:00:00",
                            "ip_address": "198.51.100.5"
                        }
                    }
                ]
            }
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/_search/scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_scroll_id": "cursor-1",
            "hits": { "total": { "value": 2 }, "hits": [] }
        })))
        .mount(server)
        .await;

    // The cursor must be released exactly once per run.
    Mock::given(method("DELETE"))
        .and(path("/_search/scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "succeeded": true })))
        .expect(runs)
        .mount(server)
        .await;
}

fn search_client(server: &MockServer) -> Client {
    // An unreachable first endpoint exercises sequential failover.
    let cfg = SearchConfig {
        endpoints: vec!["http://127.0.0.1:1".to_string(), server.uri()],
        connect_timeout: std::time::Duration::from_secs(5),
    };
    Client::new(&cfg).unwrap()
}

fn jst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap()
}

#[tokio::test]
async fn test_single_day_pipeline() {
    let server = MockServer::start().await;
    mount_backend(&server, 1).await;

    let dir = tempfile::tempdir().unwrap();
    let checkpoint = Checkpoint::new(dir.path().join("report.date"));
    let today = NaiveDate::from_ymd_opt(2024, 6, 2).unwrap();
    let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();

    let mut runner = Runner::new(search_client(&server), StaticGeo, MemorySink::default(), checkpoint, jst());
    let summary = runner.run(Some(1), today).await.unwrap();

    assert_eq!(summary.days_completed, 1);
    assert_eq!(summary.failed_day, None);

    let rows = runner.sink().snapshot();
    // 9 aggregated activities plus 2 distinct share rows.
    assert_eq!(rows.len(), 11);

    let download = rows
        .iter()
        .find(|r| r.activity == "download")
        .expect("download row");
    assert_eq!(download.tenant, "acme");
    assert_eq!(download.date, day);
    assert_eq!(download.service, "box01");
    assert_eq!(download.country_code, "JP");
    assert_eq!(download.domain, "-");
    assert_eq!(download.longitude, "139.69");
    assert_eq!(download.number, 42);

    let shares: Vec<_> = rows.iter().filter(|r| r.activity == "share").collect();
    assert_eq!(shares.len(), 2);
    for share in &shares {
        assert_eq!(share.country_code, "US");
        assert_eq!(share.number, 1);
    }
    assert!(shares.iter().any(|r| r.domain == "example.com"));
    assert!(shares.iter().any(|r| r.domain == "-"));

    // A fully successful run advances the checkpoint to today.
    assert_eq!(
        Checkpoint::new(dir.path().join("report.date")).load().unwrap(),
        Some(today)
    );

    server.verify().await;
}

#[tokio::test]
async fn test_rerunning_a_day_is_idempotent() {
    let server = MockServer::start().await;
    mount_backend(&server, 2).await;

    let dir = tempfile::tempdir().unwrap();
    let today = NaiveDate::from_ymd_opt(2024, 6, 2).unwrap();

    let checkpoint = Checkpoint::new(dir.path().join("report.date"));
    let mut runner = Runner::new(search_client(&server), StaticGeo, MemorySink::default(), checkpoint, jst());

    runner.run(Some(1), today).await.unwrap();
    let first = runner.sink().snapshot();

    runner.run(Some(1), today).await.unwrap();
    let second = runner.sink().snapshot();

    assert_eq!(first, second);
    server.verify().await;
}
