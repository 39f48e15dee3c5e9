use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone};
use tracing::{debug, error, info};

use crate::aggregate::{ActivityKey, DayAggregate};
use crate::catalog::{self, Activity, ServiceFamily};
use crate::checkpoint::Checkpoint;
use crate::geo::{GeoLookup, GeoResolver};
use crate::normalize::normalize;
use crate::report::{ReportRow, ReportSink};
use crate::search::scroll::ScrollSession;
use crate::search::SearchBackend;

/// Vendor audit logs can arrive up to this many days late, so every run
/// re-aggregates a trailing window of already-committed days. The upsert is
/// idempotent, so the overwrite is safe; the audit indices must stay
/// queryable for at least this window.
pub const LOOKBACK_DAYS: i64 = 3;

/// Index name prefix that marks a service audit shard.
const INDEX_PREFIX: &str = "serviceaudit_";

/// Outcome of one scheduled run.
#[derive(Debug)]
pub struct RunSummary {
    pub start: NaiveDate,
    pub today: NaiveDate,
    pub days_completed: u32,
    pub failed_day: Option<NaiveDate>,
}

/// Computes the first day to (re)process.
///
/// An in-range override wins; otherwise a checkpoint older than today sets
/// the window to checkpoint minus the lookback; otherwise today minus the
/// lookback.
pub fn resolve_window(
    checkpoint: Option<NaiveDate>,
    override_days: Option<i64>,
    today: NaiveDate,
) -> NaiveDate {
    if let Some(days) = override_days.filter(|d| (1..=7).contains(d)) {
        return today - chrono::Duration::days(days);
    }
    match checkpoint {
        Some(cp) if cp != today => cp - chrono::Duration::days(LOOKBACK_DAYS),
        _ => today - chrono::Duration::days(LOOKBACK_DAYS),
    }
}

/// Daily aggregation run driver.
///
/// Discovers active services, walks the backfill window one day at a time,
/// routes each (service, activity) query to the aggregation fast path or the
/// raw-scan fallback, and persists each day atomically before moving on.
pub struct Runner<S, G, R> {
    search: S,
    geo: GeoResolver<G>,
    sink: R,
    checkpoint: Checkpoint,
    tz: FixedOffset,
}

impl<S: SearchBackend, G: GeoLookup, R: ReportSink> Runner<S, G, R> {
    pub fn new(search: S, geo_db: G, sink: R, checkpoint: Checkpoint, tz: FixedOffset) -> Self {
        Runner {
            search,
            geo: GeoResolver::new(geo_db),
            sink,
            checkpoint,
            tz,
        }
    }

    /// The destination sink, exposed for inspection in tests.
    pub fn sink(&self) -> &R {
        &self.sink
    }

    /// Executes one run as of `today`.
    ///
    /// Days are strictly sequential; the first day that fails ends the run
    /// (it is retried on the next invocation because the checkpoint never
    /// moves past it). Day failures are not fatal: the summary reports them
    /// and the process still exits cleanly.
    pub async fn run(&mut self, override_days: Option<i64>, today: NaiveDate) -> Result<RunSummary> {
        let previous = self.checkpoint.load()?;
        let start = resolve_window(previous, override_days, today);
        info!(%start, %today, checkpoint = ?previous, "starting report run");

        let mut day = start;
        let mut days_completed = 0u32;
        let mut failed_day = None;

        while day < today {
            match self.process_day(day).await {
                Ok(()) => days_completed += 1,
                Err(err) => {
                    error!(%day, error = format!("{err:#}"), "day failed, will retry next run");
                    failed_day = Some(day);
                    break;
                }
            }
            day = day.succ_opt().context("day out of range")?;
        }

        // Advance the checkpoint monotonically: to today on full success,
        // otherwise to just before the failed day so it stays in the next
        // run's window.
        let candidate = match failed_day {
            None => Some(today),
            Some(failed) => failed.pred_opt(),
        };
        if let Some(candidate) = candidate {
            let advance = match (failed_day, previous) {
                (None, _) => true,
                (Some(_), Some(prev)) => candidate > prev,
                (Some(_), None) => false,
            };
            if advance {
                self.checkpoint.store(candidate)?;
                debug!(checkpoint = %candidate, "checkpoint advanced");
            }
        }

        Ok(RunSummary {
            start,
            today,
            days_completed,
            failed_day,
        })
    }

    /// Processes one calendar day: discover services, run every catalog
    /// query, aggregate in memory, and persist the result atomically.
    async fn process_day(&mut self, day: NaiveDate) -> Result<()> {
        let (begin, end) = day_bounds(day, self.tz)?;
        let services = self.discover_services().await?;
        info!(%day, services = ?services, "processing day");

        let mut aggregate = DayAggregate::new();
        for service_id in &services {
            let Some(family) = ServiceFamily::from_service_id(service_id) else {
                debug!(service_id, "no catalog for service, skipping");
                continue;
            };
            for activity in Activity::ALL {
                let Some(filter) = catalog::filter_for(service_id, activity) else {
                    continue;
                };
                let request = catalog::build_request(&filter, begin, end);
                let result = if request.scrolled {
                    self.scan_raw(&mut aggregate, service_id, family, activity, &request, day)
                        .await
                } else {
                    self.collect_buckets(&mut aggregate, service_id, activity, &request, day)
                        .await
                };
                result.with_context(|| {
                    format!("querying {service_id} {} for {day}", activity.as_str())
                })?;
            }
        }

        let rows = self.rows_for(&aggregate);
        self.sink
            .write_day(day, &rows)
            .await
            .with_context(|| format!("persisting {day}"))?;
        info!(%day, rows = rows.len(), "day persisted");
        Ok(())
    }

    /// Lists aliases and extracts the distinct service ids that have at
    /// least one audit shard.
    async fn discover_services(&self) -> Result<Vec<String>> {
        let aliases = self.search.list_aliases().await?;
        let mut services: Vec<String> = Vec::new();
        for name in aliases {
            let Some(rest) = name.strip_prefix(INDEX_PREFIX) else {
                continue;
            };
            let Some((service_id, _)) = rest.split_once('_') else {
                continue;
            };
            if !service_id.is_empty() && !services.iter().any(|s| s == service_id) {
                services.push(service_id.to_string());
            }
        }
        services.sort();
        Ok(services)
    }

    /// Aggregation fast path: consume the two-level bucket response. The
    /// share-target domain is never computed here; rows carry the `-`
    /// placeholder, trading precision for throughput on high-volume
    /// activities.
    async fn collect_buckets(
        &mut self,
        aggregate: &mut DayAggregate,
        service_id: &str,
        activity: Activity,
        request: &catalog::SearchRequest,
        day: NaiveDate,
    ) -> Result<()> {
        let response = self.search.search(&request.uri, &request.body).await?;
        let Some(aggs) = response.aggregations else {
            debug!(service_id, activity = activity.as_str(), "no aggregation buckets");
            return Ok(());
        };

        for tenant in aggs.group_by_tenant.buckets {
            for bucket in tenant.group_by_ip.buckets {
                let country = self.geo.resolve(&bucket.key);
                aggregate.add(
                    ActivityKey::new(
                        tenant.key.clone(),
                        day,
                        service_id,
                        activity.as_str(),
                        country,
                        "",
                    ),
                    bucket.doc_count,
                );
            }
        }
        Ok(())
    }

    /// Raw-scan fallback: page through every matching event with a scroll
    /// cursor, normalizing each document. The cursor is released on every
    /// exit path and never reused across days.
    async fn scan_raw(
        &mut self,
        aggregate: &mut DayAggregate,
        service_id: &str,
        family: ServiceFamily,
        activity: Activity,
        request: &catalog::SearchRequest,
        day: NaiveDate,
    ) -> Result<()> {
        let search = &self.search;
        let geo = &mut self.geo;
        let tz = self.tz;

        let mut session = ScrollSession::new(search);
        let outcome = async {
            let mut response = search.search(&request.uri, &request.body).await?;
            session.track(&response);

            while !response.hits.hits.is_empty() {
                if let Some(total) = &response.hits.total {
                    debug!(
                        service_id,
                        activity = activity.as_str(),
                        fetched = response.hits.hits.len(),
                        total = total.value(),
                        "scroll page"
                    );
                }
                for hit in &response.hits.hits {
                    let record = normalize(family, activity, &hit.source, tz, day);
                    let country = geo.resolve(&record.ip);
                    aggregate.record(ActivityKey::new(
                        record.tenant,
                        record.date,
                        service_id,
                        activity.as_str(),
                        country,
                        record.domain,
                    ));
                }
                response = session.next_page().await?;
            }
            Ok(())
        }
        .await;

        session.close().await;
        outcome
    }

    /// Materializes the day's accumulated map into report rows, attaching
    /// the run's cached coordinates per country.
    fn rows_for(&self, aggregate: &DayAggregate) -> Vec<ReportRow> {
        aggregate
            .iter()
            .map(|(key, number)| {
                let (longitude, latitude) = self.geo.coordinates(&key.country_code);
                ReportRow {
                    tenant: key.tenant.clone(),
                    date: key.date,
                    service: key.service.clone(),
                    activity: key.activity.to_string(),
                    country_code: key.country_code.clone(),
                    longitude,
                    latitude,
                    domain: key.domain.clone(),
                    number,
                }
            })
            .collect()
    }
}

/// First and last second of a local-time day.
fn day_bounds(
    day: NaiveDate,
    tz: FixedOffset,
) -> Result<(DateTime<FixedOffset>, DateTime<FixedOffset>)> {
    let begin = day
        .and_hms_opt(0, 0, 0)
        .and_then(|t| tz.from_local_datetime(&t).single())
        .context("invalid day start")?;
    let end = day
        .and_hms_opt(23, 59, 59)
        .and_then(|t| tz.from_local_datetime(&t).single())
        .context("invalid day end")?;
    Ok((begin, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::Mutex;

    use serde_json::Value;

    use crate::geo::GeoLocation;
    use crate::search::SearchResponse;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_window_from_checkpoint() {
        let start = resolve_window(Some(date(2024, 5, 10)), None, date(2024, 5, 14));
        assert_eq!(start, date(2024, 5, 7));
    }

    #[test]
    fn test_window_without_checkpoint() {
        let start = resolve_window(None, None, date(2024, 5, 14));
        assert_eq!(start, date(2024, 5, 11));
    }

    #[test]
    fn test_window_checkpoint_equals_today() {
        let start = resolve_window(Some(date(2024, 5, 14)), None, date(2024, 5, 14));
        assert_eq!(start, date(2024, 5, 11));
    }

    #[test]
    fn test_window_override() {
        let start = resolve_window(Some(date(2024, 5, 10)), Some(2), date(2024, 5, 14));
        assert_eq!(start, date(2024, 5, 12));
    }

    #[test]
    fn test_window_override_out_of_range_falls_back() {
        let today = date(2024, 5, 14);
        assert_eq!(
            resolve_window(Some(date(2024, 5, 10)), Some(0), today),
            date(2024, 5, 7)
        );
        assert_eq!(
            resolve_window(Some(date(2024, 5, 10)), Some(8), today),
            date(2024, 5, 7)
        );
    }

    /// Search fake: one box service discovered, every query returns an
    /// empty result.
    struct EmptySearch;

    impl SearchBackend for EmptySearch {
        async fn search(&self, _uri: &str, _body: &Value) -> Result<SearchResponse> {
            Ok(SearchResponse::default())
        }

        async fn scroll_continue(&self, _scroll_id: &str) -> Result<SearchResponse> {
            Ok(SearchResponse::default())
        }

        async fn scroll_close(&self, _scroll_id: &str) -> Result<()> {
            Ok(())
        }

        async fn list_aliases(&self) -> Result<Vec<String>> {
            Ok(vec!["serviceaudit_box01_2024.06.01".to_string()])
        }
    }

    /// Search fake whose scroll cursor breaks after the first page, recording
    /// every cursor release.
    struct BrokenScrollSearch {
        closed: Mutex<Vec<String>>,
    }

    impl SearchBackend for BrokenScrollSearch {
        async fn search(&self, uri: &str, _body: &Value) -> Result<SearchResponse> {
            if !uri.contains("scroll=") {
                return Ok(SearchResponse::default());
            }
            Ok(serde_json::from_value(serde_json::json!({
                "_scroll_id": "cursor-1",
                "hits": {
                    "total": { "value": 1 },
                    "hits": [{ "_source": { "tenant": "acme", "ip_address": "" } }]
                }
            }))?)
        }

        async fn scroll_continue(&self, _scroll_id: &str) -> Result<SearchResponse> {
            anyhow::bail!("cursor expired")
        }

        async fn scroll_close(&self, scroll_id: &str) -> Result<()> {
            self.closed.lock().unwrap().push(scroll_id.to_string());
            Ok(())
        }

        async fn list_aliases(&self) -> Result<Vec<String>> {
            Ok(vec!["serviceaudit_box01_2024.06.01".to_string()])
        }
    }

    struct NoGeo;

    impl GeoLookup for NoGeo {
        fn lookup(&self, _ip: IpAddr) -> Option<GeoLocation> {
            None
        }
    }

    /// Sink fake that fails for one configured day.
    struct FlakySink {
        fail_on: Option<NaiveDate>,
        written: Mutex<Vec<NaiveDate>>,
    }

    impl FlakySink {
        fn new(fail_on: Option<NaiveDate>) -> Self {
            FlakySink {
                fail_on,
                written: Mutex::new(Vec::new()),
            }
        }
    }

    impl ReportSink for FlakySink {
        async fn write_day(&self, day: NaiveDate, _rows: &[ReportRow]) -> Result<()> {
            if self.fail_on == Some(day) {
                anyhow::bail!("injected persistence failure");
            }
            self.written.lock().unwrap().push(day);
            Ok(())
        }
    }

    fn runner(
        dir: &tempfile::TempDir,
        sink: FlakySink,
    ) -> Runner<EmptySearch, NoGeo, FlakySink> {
        let checkpoint = Checkpoint::new(dir.path().join("report.date"));
        let tz = FixedOffset::east_opt(9 * 3600).unwrap();
        Runner::new(EmptySearch, NoGeo, sink, checkpoint, tz)
    }

    #[tokio::test]
    async fn test_full_run_advances_checkpoint_to_today() {
        let dir = tempfile::tempdir().unwrap();
        let today = date(2024, 6, 4);
        let mut runner = runner(&dir, FlakySink::new(None));

        let summary = runner.run(None, today).await.unwrap();
        assert_eq!(summary.start, date(2024, 6, 1));
        assert_eq!(summary.days_completed, 3);
        assert_eq!(summary.failed_day, None);
        assert_eq!(
            *runner.sink.written.lock().unwrap(),
            vec![date(2024, 6, 1), date(2024, 6, 2), date(2024, 6, 3)]
        );
        assert_eq!(runner.checkpoint.load().unwrap(), Some(today));
    }

    #[tokio::test]
    async fn test_failed_day_stops_run_without_first_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let today = date(2024, 6, 4);
        let mut runner = runner(&dir, FlakySink::new(Some(date(2024, 6, 2))));

        let summary = runner.run(None, today).await.unwrap();
        assert_eq!(summary.days_completed, 1);
        assert_eq!(summary.failed_day, Some(date(2024, 6, 2)));
        // Later days are not attempted in the same run.
        assert_eq!(*runner.sink.written.lock().unwrap(), vec![date(2024, 6, 1)]);
        // No prior checkpoint to advance from.
        assert_eq!(runner.checkpoint.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_day_advances_checkpoint_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let today = date(2024, 6, 4);
        let checkpoint = Checkpoint::new(dir.path().join("report.date"));
        checkpoint.store(date(2024, 5, 30)).unwrap();

        let mut runner = runner(&dir, FlakySink::new(Some(date(2024, 6, 2))));
        let summary = runner.run(None, today).await.unwrap();

        // Window opened at checkpoint - lookback.
        assert_eq!(summary.start, date(2024, 5, 27));
        // Checkpoint lands just before the failed day, keeping it in the
        // next run's window.
        assert_eq!(runner.checkpoint.load().unwrap(), Some(date(2024, 6, 1)));
    }

    #[tokio::test]
    async fn test_failure_before_checkpoint_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let today = date(2024, 6, 4);
        let checkpoint = Checkpoint::new(dir.path().join("report.date"));
        checkpoint.store(date(2024, 6, 3)).unwrap();

        // Lookback re-runs 2024-05-31 onward; a failure there must not move
        // the checkpoint backwards.
        let mut runner = runner(&dir, FlakySink::new(Some(date(2024, 5, 31))));
        let summary = runner.run(None, today).await.unwrap();

        assert_eq!(summary.failed_day, Some(date(2024, 5, 31)));
        assert_eq!(runner.checkpoint.load().unwrap(), Some(date(2024, 6, 3)));
    }

    #[tokio::test]
    async fn test_broken_scroll_still_releases_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let today = date(2024, 6, 2);
        let checkpoint = Checkpoint::new(dir.path().join("report.date"));
        let search = BrokenScrollSearch {
            closed: Mutex::new(Vec::new()),
        };
        let tz = FixedOffset::east_opt(9 * 3600).unwrap();
        let mut runner = Runner::new(search, NoGeo, FlakySink::new(None), checkpoint, tz);

        let summary = runner.run(Some(1), today).await.unwrap();
        assert_eq!(summary.failed_day, Some(date(2024, 6, 1)));
        // The day failed mid-scroll, but the cursor was released exactly once.
        assert_eq!(*runner.search.closed.lock().unwrap(), vec!["cursor-1"]);
    }

    #[tokio::test]
    async fn test_checkpoint_equal_to_today_reprocesses_lookback() {
        let dir = tempfile::tempdir().unwrap();
        let today = date(2024, 6, 4);
        let checkpoint = Checkpoint::new(dir.path().join("report.date"));
        checkpoint.store(today).unwrap();

        let mut runner = runner(&dir, FlakySink::new(None));
        let summary = runner.run(None, today).await.unwrap();
        assert_eq!(summary.start, date(2024, 6, 1));
        assert_eq!(summary.days_completed, 3);
    }
}
