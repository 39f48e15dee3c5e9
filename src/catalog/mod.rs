use chrono::{DateTime, FixedOffset, Utc};
use serde_json::{json, Value};

/// Page size for scrolled raw queries.
pub const SCROLL_PAGE_SIZE: u32 = 10_000;

/// Scroll cursor keep-alive passed to the search backend.
pub const SCROLL_KEEPALIVE: &str = "1m";

/// Normalized action categories the catalog maps onto vendor-specific
/// query filters. The string forms are what ends up in report rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activity {
    View,
    Create,
    Update,
    Delete,
    Download,
    Upload,
    Share,
    LoginSuccess,
    LoginFail,
    Usage,
}

impl Activity {
    /// All activities, in catalog order.
    pub const ALL: [Activity; 10] = [
        Activity::View,
        Activity::Create,
        Activity::Update,
        Activity::Delete,
        Activity::Download,
        Activity::Upload,
        Activity::Share,
        Activity::LoginSuccess,
        Activity::LoginFail,
        Activity::Usage,
    ];

    /// Returns the activity label stored in report rows.
    pub fn as_str(self) -> &'static str {
        match self {
            Activity::View => "view",
            Activity::Create => "create",
            Activity::Update => "update",
            Activity::Delete => "delete",
            Activity::Download => "download",
            Activity::Upload => "upload",
            Activity::Share => "share",
            Activity::LoginSuccess => "loginSuccess",
            Activity::LoginFail => "loginFail",
            Activity::Usage => "usage",
        }
    }
}

/// Supported audit-log source types. Each emits events in its own schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceFamily {
    GoogleApps,
    Office365,
    Lineworks,
    Box,
    Dropbox,
    Aws,
}

impl ServiceFamily {
    /// Resolves a discovered service id (e.g. "googleapps01") to its family.
    ///
    /// Service ids carry a zero-prefixed shard suffix; the family is the id
    /// with the longest `0<digits>` tail removed. Ids without a suffix are
    /// matched as-is.
    pub fn from_service_id(service_id: &str) -> Option<Self> {
        Self::from_name(strip_shard_suffix(service_id))
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "googleapps" => Some(ServiceFamily::GoogleApps),
            "office365" => Some(ServiceFamily::Office365),
            "lineworks" => Some(ServiceFamily::Lineworks),
            "box" => Some(ServiceFamily::Box),
            "dropbox" => Some(ServiceFamily::Dropbox),
            "aws" => Some(ServiceFamily::Aws),
            _ => None,
        }
    }
}

/// Removes a trailing `0<digits>` shard suffix from a service id, keeping
/// the longest possible prefix.
fn strip_shard_suffix(service_id: &str) -> &str {
    let bytes = service_id.as_bytes();
    // Scan from the right: the suffix is a '0' followed by one or more
    // digits, with at least one character of prefix remaining.
    for i in (1..bytes.len().saturating_sub(1)).rev() {
        if bytes[i] == b'0' && bytes[i + 1..].iter().all(u8::is_ascii_digit) {
            return &service_id[..i];
        }
    }
    service_id
}

/// Static query descriptor for one (service id, activity) pair.
///
/// `aggregation` present means the server-side fast path applies; absent
/// means the raw-scan scroll path must be used because per-event enrichment
/// (the share-target domain) cannot be computed by the backend.
#[derive(Debug, Clone)]
pub struct ServiceFilter {
    /// Index name prefix after `serviceaudit_`, e.g. "googleapps01_drive_".
    pub index_prefix: String,
    /// Boolean query skeleton (contents of `query.bool`).
    pub query: Value,
    /// Optional two-level terms aggregation (tenant, then source ip).
    pub aggregation: Option<Value>,
}

/// A prepared search request for one local-time day.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub uri: String,
    pub body: Value,
    /// True when the request opens a scroll session (raw-scan path).
    pub scrolled: bool,
}

/// Two-level terms aggregation: group by tenant, then by the family's
/// source-ip field.
fn terms_agg(ip_field: &str) -> Value {
    json!({
        "group_by_tenant": {
            "terms": { "field": "tenant.keyword" },
            "aggs": {
                "group_by_ip": {
                    "terms": { "field": format!("{ip_field}.keyword") }
                }
            }
        }
    })
}

/// `should` clause matching any of the given values on one keyword field.
fn any_of(field: &str, values: &[&str]) -> Value {
    let should: Vec<Value> = values
        .iter()
        .map(|v| json!({ "match": { field: v } }))
        .collect();
    json!({ "should": should, "minimum_should_match": 1 })
}

/// `filter` clause requiring an exact term on one keyword field.
fn term_of(field: &str, value: &str) -> Value {
    json!({ "filter": [{ "term": { field: value } }] })
}

/// Returns the query descriptor for a service id and activity, or `None`
/// when the activity is not supported for that family. Unsupported
/// combinations are deliberate omissions, not errors.
pub fn filter_for(service_id: &str, activity: Activity) -> Option<ServiceFilter> {
    let family = ServiceFamily::from_service_id(service_id)?;
    match family {
        ServiceFamily::GoogleApps => googleapps_filter(service_id, activity),
        ServiceFamily::Office365 => office365_filter(service_id, activity),
        ServiceFamily::Lineworks => lineworks_filter(service_id, activity),
        ServiceFamily::Box => box_filter(service_id, activity),
        ServiceFamily::Dropbox => dropbox_filter(service_id, activity),
        ServiceFamily::Aws => aws_filter(service_id, activity),
    }
}

fn googleapps_filter(service_id: &str, activity: Activity) -> Option<ServiceFilter> {
    let agg = || Some(terms_agg("ipAddress"));
    let drive = format!("{service_id}_drive_");
    let login = format!("{service_id}_login_");
    let (prefix, query, aggregation) = match activity {
        Activity::View => (
            drive,
            any_of("events.name.keyword", &["view", "preview"]),
            agg(),
        ),
        Activity::Create => (
            drive,
            any_of(
                "events.name.keyword",
                &["create", "sheets_import", "add_to_folder", "untrash"],
            ),
            agg(),
        ),
        Activity::Update => (
            drive,
            any_of("events.name.keyword", &["edit", "rename", "move"]),
            agg(),
        ),
        Activity::Delete => (
            drive,
            any_of(
                "events.name.keyword",
                &["delete", "trash", "remove_from_folder"],
            ),
            agg(),
        ),
        Activity::Download => (drive, term_of("events.name.keyword", "download"), agg()),
        Activity::Upload => (drive, term_of("events.name.keyword", "upload"), agg()),
        // Raw scan: the share-target domain lives in the event parameters.
        Activity::Share => (
            drive,
            any_of(
                "events.name.keyword",
                &[
                    "change_user_access",
                    "change_acl_editors",
                    "shared_drive_membership_change",
                ],
            ),
            None,
        ),
        Activity::LoginSuccess => (
            login,
            json!({
                "filter": [
                    { "term": { "events.name.keyword": "login_success" } },
                    { "term": { "events.type.keyword": "login" } }
                ]
            }),
            agg(),
        ),
        Activity::LoginFail => (
            login,
            json!({
                "filter": [
                    { "term": { "events.name.keyword": "login_failure" } },
                    { "term": { "events.type.keyword": "login" } }
                ]
            }),
            agg(),
        ),
        Activity::Usage => (format!("{service_id}_"), json!({}), agg()),
    };
    Some(ServiceFilter {
        index_prefix: prefix,
        query,
        aggregation,
    })
}

fn office365_filter(service_id: &str, activity: Activity) -> Option<ServiceFilter> {
    let agg = || Some(terms_agg("ClientIP"));
    let prefix = format!("{service_id}_");
    // OneDrive workload filter, excluding Office web-client noise.
    let onedrive = |should: &[&str]| {
        json!({
            "must_not": [{ "match": { "UserAgent.keyword": "MSWAC" } }],
            "filter": [{ "term": { "Workload.keyword": "OneDrive" } }],
            "should": should
                .iter()
                .map(|v| json!({ "match": { "Operation.keyword": v } }))
                .collect::<Vec<_>>(),
            "minimum_should_match": 1
        })
    };
    let (query, aggregation) = match activity {
        Activity::View => (onedrive(&["PageViewed", "FilePreviewed"]), agg()),
        Activity::Create => (
            onedrive(&["FileCopied", "FileRestored", "FolderCopied", "FolderRestored"]),
            agg(),
        ),
        Activity::Update => (
            onedrive(&[
                "FileModified",
                "FileModifiedExtended",
                "FileMoved",
                "FileRenamed",
                "FolderModified",
                "FolderMoved",
                "FolderRenamed",
            ]),
            agg(),
        ),
        Activity::Delete => (
            onedrive(&[
                "FileDeleted",
                "FileDeletedFirstStageRecycleBin",
                "FileDeletedSecondStageRecycleBin",
                "FileVersionsAllMinorsRecycled",
                "FileVersionsAllRecycled",
                "FileVersionRecycled",
                "FolderDeleted",
                "FolderDeletedFirstStageRecycleBin",
                "FolderDeletedSecondStageRecycleBin",
            ]),
            agg(),
        ),
        Activity::Download => (onedrive(&["FileDownloaded"]), agg()),
        Activity::Upload => (onedrive(&["FileUploaded"]), agg()),
        // Raw scan: the domain comes from TargetUserOrGroupName per event.
        Activity::Share => (
            onedrive(&[
                "SharingSet",
                "AnonymousLinkCreated",
                "AnonymousLinkUpdated",
                "SharingInvitationCreated",
                "AccessInvitationUpdated",
            ]),
            None,
        ),
        Activity::LoginSuccess => (
            json!({
                "must_not": [{ "match": { "UserAgent.keyword": "MSWAC" } }],
                "filter": [{ "term": { "Operation.keyword": "UserLoggedIn" } }]
            }),
            agg(),
        ),
        Activity::LoginFail => (
            json!({
                "must_not": [{ "match": { "UserAgent.keyword": "MSWAC" } }],
                "filter": [{ "term": { "Operation.keyword": "UserLoginFailed" } }]
            }),
            agg(),
        ),
        Activity::Usage => (
            json!({ "must_not": [{ "match": { "UserAgent.keyword": "MSWAC" } }] }),
            agg(),
        ),
    };
    Some(ServiceFilter {
        index_prefix: prefix,
        query,
        aggregation,
    })
}

fn lineworks_filter(service_id: &str, activity: Activity) -> Option<ServiceFilter> {
    let agg = || Some(terms_agg("ip_address"));
    let drive = format!("{service_id}_drive_");
    let auth = format!("{service_id}_auth_");
    let (prefix, query, aggregation) = match activity {
        // View events carry no task value in this vendor's drive log.
        Activity::View => (drive, term_of("task.keyword", ""), agg()),
        Activity::Create => (
            drive,
            any_of("task.keyword", &["コピー", "新規フォルダー"]),
            agg(),
        ),
        Activity::Update => (
            drive,
            any_of("task.keyword", &["ファイル修正", "移動", "名前変更"]),
            agg(),
        ),
        Activity::Delete => (drive, term_of("task.keyword", "削除"), agg()),
        Activity::Download => (drive, term_of("task.keyword", "ダウンロード"), agg()),
        Activity::Upload => (drive, term_of("task.keyword", "アップロード"), agg()),
        Activity::Share => (drive, term_of("task.keyword", "共有リンク作成"), None),
        Activity::LoginSuccess => (
            auth,
            term_of("description.keyword", "ログインに成功しました。"),
            agg(),
        ),
        Activity::LoginFail => (
            auth,
            json!({ "filter": [{ "wildcard": { "description.keyword": "ログイン失敗*" } }] }),
            agg(),
        ),
        Activity::Usage => (format!("{service_id}_"), json!({}), agg()),
    };
    Some(ServiceFilter {
        index_prefix: prefix,
        query,
        aggregation,
    })
}

fn box_filter(service_id: &str, activity: Activity) -> Option<ServiceFilter> {
    let agg = || Some(terms_agg("ip_address"));
    let prefix = format!("{service_id}_");
    let (query, aggregation) = match activity {
        Activity::View => (term_of("event_type.keyword", "PREVIEW"), agg()),
        Activity::Create => (any_of("event_type.keyword", &["COPY", "UNDELETE"]), agg()),
        Activity::Update => (
            any_of("event_type.keyword", &["EDIT", "MOVE", "RENAME"]),
            agg(),
        ),
        Activity::Delete => (term_of("event_type.keyword", "DELETE"), agg()),
        Activity::Download => (term_of("event_type.keyword", "DOWNLOAD"), agg()),
        Activity::Upload => (term_of("event_type.keyword", "UPLOAD"), agg()),
        Activity::Share => (term_of("event_type.keyword", "COLLABORATION_INVITE"), None),
        Activity::LoginSuccess => (term_of("event_type.keyword", "LOGIN"), agg()),
        Activity::LoginFail => (term_of("event_type.keyword", "FAILED_LOGIN*"), agg()),
        Activity::Usage => (json!({}), agg()),
    };
    Some(ServiceFilter {
        index_prefix: prefix,
        query,
        aggregation,
    })
}

fn dropbox_filter(service_id: &str, activity: Activity) -> Option<ServiceFilter> {
    let agg = || Some(terms_agg("origin.geo_location.ip_address"));
    let prefix = format!("{service_id}_");
    let (query, aggregation) = match activity {
        Activity::View => (term_of("event_type.tag.keyword", "file_preview"), agg()),
        Activity::Create => (
            any_of(
                "event_type.tag.keyword",
                &["file_copy", "file_restore", "create_foleder"],
            ),
            agg(),
        ),
        Activity::Update => (
            any_of(
                "event_type.tag.keyword",
                &["file_edit", "file_move", "file_rename", "file_revert"],
            ),
            agg(),
        ),
        Activity::Delete => (
            any_of(
                "event_type.tag.keyword",
                &["file_delete", "file_permanently_delete"],
            ),
            agg(),
        ),
        Activity::Download => (term_of("event_type.tag.keyword", "file_download"), agg()),
        Activity::Upload => (term_of("event_type.tag.keyword", "file_add"), agg()),
        Activity::Share => (
            any_of(
                "event_type.tag.keyword",
                &["shared_content_add_member", "shared_content_add_intitees"],
            ),
            None,
        ),
        Activity::LoginSuccess => (
            any_of(
                "event_type.tag.keyword",
                &["login_success", "password_login_success"],
            ),
            agg(),
        ),
        Activity::LoginFail => (
            any_of(
                "event_type.tag.keyword",
                &["login_fail", "password_login_failed", "sso_login_failed"],
            ),
            agg(),
        ),
        Activity::Usage => (json!({}), agg()),
    };
    Some(ServiceFilter {
        index_prefix: prefix,
        query,
        aggregation,
    })
}

fn aws_filter(service_id: &str, activity: Activity) -> Option<ServiceFilter> {
    let agg = || Some(terms_agg("sourceIPAddress"));
    let prefix = format!("{service_id}_");
    // CloudTrail S3 data events, excluding AWS Config's own reads.
    let s3 = |should: &[&str]| {
        json!({
            "must_not": [{ "match": { "userAgent.keyword": "[AWSConfig]" } }],
            "filter": [{ "term": { "eventSource.keyword": "s3.amazonaws.com" } }],
            "should": should
                .iter()
                .map(|v| json!({ "match": { "eventName.keyword": v } }))
                .collect::<Vec<_>>(),
            "minimum_should_match": 1
        })
    };
    let (query, aggregation) = match activity {
        Activity::View => (s3(&["GetObject", "GetObjects"]), agg()),
        Activity::Create => (
            s3(&["CreateBucket", "PostObject", "PutObject", "UploadPartCopy"]),
            agg(),
        ),
        Activity::Delete => (
            s3(&["DeleteBucket", "DeleteObject", "DeleteObjects"]),
            agg(),
        ),
        Activity::Upload => (
            s3(&[
                "CompleteMultipartUpload",
                "CreateMultipartUpload",
                "UploadPart",
            ]),
            agg(),
        ),
        Activity::LoginSuccess => (
            json!({
                "must_not": [{ "match": { "userAgent.keyword": "[AWSConfig]" } }],
                "filter": [
                    { "term": { "eventName.keyword": "ConsoleLogin" } },
                    { "term": { "responseElements.ConsoleLogin.keyword": "Success" } }
                ]
            }),
            agg(),
        ),
        Activity::LoginFail => (
            json!({
                "must_not": [{ "match": { "userAgent.keyword": "[AWSConfig]" } }],
                "filter": [
                    { "term": { "eventName.keyword": "ConsoleLogin" } },
                    { "term": { "responseElements.ConsoleLogin.keyword": "Failure" } }
                ]
            }),
            agg(),
        ),
        Activity::Usage => (
            json!({ "must_not": [{ "match": { "userAgent.keyword": "[AWSConfig]" } }] }),
            agg(),
        ),
        // No S3 equivalents are mapped for these categories.
        Activity::Update | Activity::Download | Activity::Share => return None,
    };
    Some(ServiceFilter {
        index_prefix: prefix,
        query,
        aggregation,
    })
}

/// Builds the search request for one local-time day.
///
/// Audit indices are sharded by UTC date, so a local day can span up to two
/// shards; both are addressed in the index pattern when the day crosses the
/// UTC boundary. Aggregated descriptors request zero hits; raw descriptors
/// open a scroll with a fixed page size.
pub fn build_request(
    filter: &ServiceFilter,
    begin: DateTime<FixedOffset>,
    end: DateTime<FixedOffset>,
) -> SearchRequest {
    let begin_shard = begin.with_timezone(&Utc).format("%Y.%m.%d").to_string();
    let end_shard = end.with_timezone(&Utc).format("%Y.%m.%d").to_string();

    let mut pattern = format!("serviceaudit_{}*{}", filter.index_prefix, begin_shard);
    if end_shard != begin_shard {
        pattern.push_str(&format!(
            ",serviceaudit_{}*{}",
            filter.index_prefix, end_shard
        ));
    }

    let mut bool_query = filter.query.clone();
    let range = json!({
        "range": {
            "@timestamp": {
                "gte": begin.format("%Y-%m-%dT%H:%M:%S%z").to_string(),
                "lte": end.format("%Y-%m-%dT%H:%M:%S%z").to_string(),
            }
        }
    });
    if let Some(obj) = bool_query.as_object_mut() {
        let filters = obj.entry("filter").or_insert_with(|| json!([]));
        if let Some(list) = filters.as_array_mut() {
            list.push(range);
        } else {
            *filters = json!([range]);
        }
    } else {
        bool_query = json!({ "filter": [range] });
    }

    let mut body = json!({
        "query": { "bool": bool_query },
        "sort": { "@timestamp": { "order": "asc" } },
    });

    let scrolled = filter.aggregation.is_none();
    let mut uri = format!("/{pattern}/_search");
    if let Some(aggs) = &filter.aggregation {
        body["aggs"] = aggs.clone();
        body["size"] = json!(0);
    } else {
        body["size"] = json!(SCROLL_PAGE_SIZE);
        uri.push_str(&format!("?scroll={SCROLL_KEEPALIVE}"));
    }

    SearchRequest {
        uri,
        body,
        scrolled,
    }
}
