use std::path::PathBuf;

use anyhow::{ anyhow, Result };
use chrono::Utc;
use clap::{ Args, Subcommand };
use serde_json::{ Map, Value };

use super::{ AppLookup, Client, DeviceLookup, ReportLookup, EVENT_DETAIL_FIELD };
use crate::{ command::{ next_page_note, CommandOutput }, config, table::to_markdown };

const USER_HEADERS: [&str; 6] = ["objectId", "alias", "firstName", "middleName", "lastName", "email"];
const DEVICE_HEADERS: [&str; 7] = [
    "deviceId",
    "zdid",
    "model",
    "osType",
    "osVersion",
    "updatedDate",
    "deviceHash",
];
const APP_HEADERS: [&str; 8] = [
    "objectId",
    "hash",
    "name",
    "version",
    "classification",
    "score",
    "privacyEnum",
    "securityEnum",
];
const EVENT_HEADERS: [&str; 6] = [
    "eventId",
    "eventName",
    "eventState",
    "incidentSummary",
    "severity",
    "persistedTime",
];

#[derive(Args, Debug, Clone)]
pub struct PageArgs {
    /// Number of results per page
    #[arg(long, default_value_t = 10)]
    pub size: u32,
    /// Page number, starting at 0
    #[arg(long, default_value_t = 0)]
    pub page: u32,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ZimperiumCommand {
    /// Search users with an RSQL query
    UsersSearch {
        #[arg(long, default_value = "objectId==*")]
        query: String,
        #[command(flatten)]
        paging: PageArgs,
    },
    /// Get a single user
    UserGetById {
        #[arg(long)]
        object_id: String,
    },
    /// Search devices with an RSQL query
    DevicesSearch {
        #[arg(long, default_value = "deviceId==*")]
        query: String,
        #[command(flatten)]
        paging: PageArgs,
    },
    /// Get a single device by zdid or by device id
    DeviceGetById {
        #[arg(long)]
        zdid: Option<String>,
        #[arg(long)]
        device_id: Option<String>,
    },
    /// List devices updated within a time range
    DevicesGetLastUpdated {
        /// Time range such as "1 day" or "2 weeks"
        #[arg(long, default_value = "1 day")]
        from_last_update: String,
        #[arg(long, default_value_t = false)]
        exclude_deleted: bool,
        #[command(flatten)]
        paging: PageArgs,
    },
    /// Classify an application by hash or by name
    AppClassificationGet {
        #[arg(long)]
        app_hash: Option<String>,
        #[arg(long)]
        app_name: Option<String>,
    },
    /// Get an application report by bundle id, itunes id or hash
    ReportGet {
        #[arg(long)]
        bundle_id: Option<String>,
        #[arg(long)]
        itunes_id: Option<String>,
        #[arg(long)]
        app_hash: Option<String>,
        #[arg(long, default_value = "ios")]
        platform: String,
    },
    /// Upload an application binary for analysis
    AppUploadForAnalysis {
        #[arg(long)]
        file: PathBuf,
    },
    /// Search events with an RSQL query
    EventsSearch {
        #[arg(long, default_value = "eventId==*")]
        query: String,
        #[command(flatten)]
        paging: PageArgs,
        /// Include full event details
        #[arg(long, default_value_t = false)]
        verbose: bool,
    },
}

pub async fn run(client: &Client, cmd: ZimperiumCommand) -> Result<CommandOutput> {
    match cmd {
        ZimperiumCommand::UsersSearch { query, paging } => users_search(client, &query, &paging).await,
        ZimperiumCommand::UserGetById { object_id } => user_get_by_id(client, &object_id).await,
        ZimperiumCommand::DevicesSearch { query, paging } =>
            devices_search(client, &query, &paging).await,
        ZimperiumCommand::DeviceGetById { zdid, device_id } => {
            let label = device_id.clone().or_else(|| zdid.clone()).unwrap_or_default();
            device_get_by_id(client, DeviceLookup::from_args(zdid, device_id)?, &label).await
        }
        ZimperiumCommand::DevicesGetLastUpdated { from_last_update, exclude_deleted, paging } =>
            devices_get_last_updated(client, &from_last_update, exclude_deleted, &paging).await,
        ZimperiumCommand::AppClassificationGet { app_hash, app_name } =>
            app_classification_get(client, AppLookup::from_args(app_hash, app_name)?).await,
        ZimperiumCommand::ReportGet { bundle_id, itunes_id, app_hash, platform } =>
            report_get(client, ReportLookup::from_args(bundle_id, itunes_id, app_hash)?, &platform).await,
        ZimperiumCommand::AppUploadForAnalysis { file } => app_upload_for_analysis(client, &file).await,
        ZimperiumCommand::EventsSearch { query, paging, verbose } =>
            events_search(client, &query, &paging, verbose).await,
    }
}

/// Connectivity check; also exercises the events endpoint when fetching is on.
pub async fn test_module(client: &Client, fetch_enabled: bool) -> Result<CommandOutput> {
    client.users_search("objectId==*", 10, 0).await?;
    if fetch_enabled {
        client.events_search("eventId==*", 10, 0, false, "persistedTime,asc").await?;
    }
    Ok(CommandOutput::message("ok"))
}

fn content(resp: &Value) -> Value {
    resp.get("content").cloned().unwrap_or(Value::Array(vec![]))
}

pub async fn users_search(client: &Client, query: &str, paging: &PageArgs) -> Result<CommandOutput> {
    let users = client.users_search(query, paging.size, paging.page).await?;
    let data = content(&users);
    let title = format!("Users{}:", next_page_note(&users, "users"));
    Ok(
        CommandOutput::new(
            to_markdown(&title, &data, Some(&USER_HEADERS), true),
            "Zimperium.Users",
            Some("objectId"),
            data,
            users
        )
    )
}

pub async fn user_get_by_id(client: &Client, object_id: &str) -> Result<CommandOutput> {
    let user = client.user_get_by_id(object_id).await?;
    Ok(
        CommandOutput::new(
            to_markdown("User:", &user, Some(&USER_HEADERS), true),
            "Zimperium.Users",
            Some("objectId"),
            user.clone(),
            user
        )
    )
}

pub async fn devices_search(client: &Client, query: &str, paging: &PageArgs) -> Result<CommandOutput> {
    let devices = client.devices_search(query, paging.size, paging.page).await?;
    let data = content(&devices);
    let title = format!("Devices{}:", next_page_note(&devices, "devices"));
    Ok(
        CommandOutput::new(
            to_markdown(&title, &data, Some(&DEVICE_HEADERS), true),
            "Zimperium.Devices",
            Some("deviceId"),
            data,
            devices
        )
    )
}

pub async fn device_get_by_id(
    client: &Client,
    lookup: DeviceLookup,
    label: &str
) -> Result<CommandOutput> {
    let device = client.device_get_by_id(&lookup).await?;
    Ok(
        CommandOutput::new(
            to_markdown(&format!("Device {}:", label), &device, Some(&DEVICE_HEADERS), true),
            "Zimperium.Devices",
            Some("deviceId"),
            device.clone(),
            device
        )
    )
}

pub async fn devices_get_last_updated(
    client: &Client,
    from_last_update: &str,
    exclude_deleted: bool,
    paging: &PageArgs
) -> Result<CommandOutput> {
    let since = Utc::now() - config::parse_lookback(from_last_update)?;
    let last_updated = since.format("%Y-%m-%d").to_string();
    let devices = client.devices_get_last_updated(
        &last_updated,
        exclude_deleted,
        paging.size,
        paging.page
    ).await?;
    let data = content(&devices);
    let title = format!("Last updated devices{}:", next_page_note(&devices, "devices"));
    Ok(
        CommandOutput::new(
            to_markdown(&title, &data, Some(&DEVICE_HEADERS), true),
            "Zimperium.Devices",
            Some("deviceId"),
            data,
            devices
        )
    )
}

pub async fn app_classification_get(client: &Client, lookup: AppLookup) -> Result<CommandOutput> {
    let app = client.app_classification_get(&lookup).await?;
    // by name there can be one entry per version; by hash it is a single-item list
    let data = match &app {
        Value::Array(a) => a.first().cloned().unwrap_or(Value::Null),
        other => content(other),
    };
    Ok(
        CommandOutput::new(
            to_markdown("Application:", &data, Some(&APP_HEADERS), true),
            "Zimperium.Application",
            Some("objectId"),
            data,
            app
        )
    )
}

pub async fn report_get(
    client: &Client,
    lookup: ReportLookup,
    platform: &str
) -> Result<CommandOutput> {
    let resp = client.report_get(&lookup, platform).await?;
    let report = resp.get("report").cloned().unwrap_or(Value::Null);
    let Some(data) = shape_report(&report) else {
        return Ok(CommandOutput::message("A report was not found."));
    };
    Ok(
        CommandOutput::new(
            to_markdown("Report:", &Value::Object(data.clone()), None, true),
            "Zimperium.Reports",
            Some("md5"),
            Value::Object(data),
            report
        )
    )
}

/// Trims a report down for the context: Android analysis maps are reduced to
/// their keys, and the app md5 is lifted to the top level.
fn shape_report(report: &Value) -> Option<Map<String, Value>> {
    let mut data = report.get("report")?.as_object()?.clone();
    if data.is_empty() {
        return None;
    }
    if let Some(Value::Object(app_analysis)) = data.get_mut("app_analysis") {
        let android = app_analysis.get("application_type").and_then(Value::as_str) == Some("Android");
        if android {
            if let Some(Value::Object(analysis)) = app_analysis.get("analysis") {
                let keys = analysis
                    .keys()
                    .map(|k| Value::String(k.clone()))
                    .collect();
                app_analysis.insert("analysis".to_string(), Value::Array(keys));
            }
        }
    }
    let md5 = match report.get("md5") {
        Some(v) => Some(v.clone()),
        None => data.get("app_analysis").and_then(|a| a.get("md5_hash")).cloned(),
    };
    if let Some(m) = md5.filter(|m| !m.is_null()) {
        data.insert("md5".to_string(), m);
    }
    Some(data)
}

pub async fn app_upload_for_analysis(client: &Client, file: &std::path::Path) -> Result<CommandOutput> {
    if !file.is_file() {
        return Err(anyhow!("Failed to prepare application for upload, {:?} is not a file.", file));
    }
    let upload = client.app_upload_for_analysis(file).await?;
    Ok(
        CommandOutput::new(
            to_markdown("Upload:", &upload, None, true),
            "Zimperium.Analysis",
            Some("objectId"),
            upload.clone(),
            upload
        )
    )
}

pub async fn events_search(
    client: &Client,
    query: &str,
    paging: &PageArgs,
    verbose: bool
) -> Result<CommandOutput> {
    let events = client.events_search(query, paging.size, paging.page, verbose, "deviceTime,asc").await?;
    let mut data = content(&events);
    if !verbose {
        if let Value::Array(items) = &mut data {
            for item in items.iter_mut().filter_map(Value::as_object_mut) {
                item.remove(EVENT_DETAIL_FIELD);
            }
        }
    }
    let title = format!("Events{}:", next_page_note(&events, "events"));
    Ok(
        CommandOutput::new(
            to_markdown(&title, &data, Some(&EVENT_HEADERS), true),
            "Zimperium.Events",
            Some("eventId"),
            data,
            events
        )
    )
}

#[cfg(test)]
mod test {
    use mockito::Matcher;
    use serde_json::json;

    use super::*;
    use crate::zimperium::test::conn;

    fn paging() -> PageArgs {
        PageArgs { size: 10, page: 0 }
    }

    #[tokio::test]
    async fn test_users_search() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/api/v1/users/public/search")
            .match_query(Matcher::UrlEncoded("rsql".into(), "objectId==*".into()))
            .with_status(200)
            .with_body(
                r#"{"content": [{"objectId": "u1", "alias": "al", "email": "a@b.c", "firstName": "A"}],
                   "last": false}"#
            )
            .create_async().await;
        let client = Client::new(&conn(server.url())).unwrap();
        let out = users_search(&client, "objectId==*", &paging()).await.unwrap();
        assert!(out.readable.starts_with("### Users (To get the next users"));
        assert!(out.readable.contains("|objectId|alias|firstName|email|"));
        assert_eq!(out.context_key.as_deref(), Some("Zimperium.Users"));
        assert_eq!(out.context[0]["objectId"], "u1");
    }

    #[tokio::test]
    async fn test_device_get_by_id_paths() {
        let mut server = mockito::Server::new_async().await;
        let _m1 = server
            .mock("GET", "/api/v1/devices/public/deviceId/d1")
            .with_status(200)
            .with_body(r#"{"deviceId": "d1", "zdid": "z1", "model": "Pixel"}"#)
            .create_async().await;
        let _m2 = server
            .mock("GET", "/api/v1/devices/public/z1")
            .with_status(200)
            .with_body(r#"{"deviceId": "d1", "zdid": "z1"}"#)
            .create_async().await;
        let client = Client::new(&conn(server.url())).unwrap();
        let out = run(&client, ZimperiumCommand::DeviceGetById {
            zdid: None,
            device_id: Some("d1".into()),
        }).await.unwrap();
        assert!(out.readable.starts_with("### Device d1:"));
        assert!(out.readable.contains("Pixel"));
        let out = run(&client, ZimperiumCommand::DeviceGetById {
            zdid: Some("z1".into()),
            device_id: None,
        }).await.unwrap();
        assert_eq!(out.context["zdid"], "z1");
        assert!(
            run(&client, ZimperiumCommand::DeviceGetById {
                zdid: Some("z1".into()),
                device_id: Some("d1".into()),
            }).await.is_err()
        );
    }

    #[tokio::test]
    async fn test_app_classification_shapes() {
        let mut server = mockito::Server::new_async().await;
        let _m1 = server
            .mock("GET", "/api/v1/malware/public/classify/hash/abc")
            .with_status(200)
            .with_body(r#"[{"objectId": "a1", "hash": "abc", "classification": "LEGITIMATE"}]"#)
            .create_async().await;
        let _m2 = server
            .mock("GET", "/api/v1/malware/public/classify/name/Slack")
            .with_status(200)
            .with_body(r#"{"content": [{"objectId": "a2", "name": "Slack", "version": "1"}]}"#)
            .create_async().await;
        let client = Client::new(&conn(server.url())).unwrap();
        let out = app_classification_get(&client, AppLookup::Hash("abc".into())).await.unwrap();
        assert_eq!(out.context["objectId"], "a1");
        let out = app_classification_get(&client, AppLookup::Name("Slack".into())).await.unwrap();
        assert_eq!(out.context[0]["objectId"], "a2");
    }

    #[test]
    fn test_shape_report() {
        let report =
            json!({
            "md5": "deadbeef",
            "report": {
                "app_analysis": {
                    "application_type": "Android",
                    "analysis": {"permissions": [1, 2], "network": {}},
                    "md5_hash": "other"
                }
            }
        });
        let data = shape_report(&report).unwrap();
        assert_eq!(data["md5"], "deadbeef");
        assert_eq!(data["app_analysis"]["analysis"], json!(["network", "permissions"]));

        let ios = json!({"report": {"app_analysis": {"application_type": "iOS", "md5_hash": "m"}}});
        let data = shape_report(&ios).unwrap();
        assert_eq!(data["md5"], "m");

        assert!(shape_report(&json!({})).is_none());
        assert!(shape_report(&json!({"report": {}})).is_none());
    }

    #[tokio::test]
    async fn test_report_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/api/v1/malware/public/reports/itunes/123")
            .with_status(200)
            .with_body(r#"{"report": {}}"#)
            .create_async().await;
        let client = Client::new(&conn(server.url())).unwrap();
        let out = report_get(&client, ReportLookup::Itunes("123".into()), "ios").await.unwrap();
        assert_eq!(out.readable, "A report was not found.");
        assert!(out.context_key.is_none());
    }

    #[tokio::test]
    async fn test_events_search_strips_detail() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/api/v1/events/public/search")
            .match_query(Matcher::UrlEncoded("includeFullEventDetail".into(), "false".into()))
            .with_status(200)
            .with_body(
                r#"{"content": [{"eventId": "e1", "severity": "LOW", "eventDetail": {"x": 1}}],
                   "last": true}"#
            )
            .create_async().await;
        let client = Client::new(&conn(server.url())).unwrap();
        let out = events_search(&client, "eventId==*", &paging(), false).await.unwrap();
        assert!(out.context[0].get("eventDetail").is_none());
        assert!(out.readable.starts_with("### Events:"));
        assert!(out.raw["content"][0].get("eventDetail").is_some());
    }

    #[tokio::test]
    async fn test_upload() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/api/v1/malware/public/upload/app")
            .match_header("content-type", Matcher::Regex("multipart/form-data".into()))
            .match_body(Matcher::Regex("file1".into()))
            .with_status(200)
            .with_body(r#"{"objectId": "up1", "status": "QUEUED"}"#)
            .create_async().await;
        let client = Client::new(&conn(server.url())).unwrap();
        let path = std::env::temp_dir().join(format!("app-{}.apk", crate::utils::generate_id()));
        std::fs::write(&path, b"PK\x03\x04").unwrap();
        let out = app_upload_for_analysis(&client, &path).await.unwrap();
        assert_eq!(out.context["objectId"], "up1");
        _ = std::fs::remove_file(&path);
        assert!(app_upload_for_analysis(&client, &path).await.is_err());
    }

    #[tokio::test]
    async fn test_module_checks_events_when_fetching() {
        let mut server = mockito::Server::new_async().await;
        let _users = server
            .mock("GET", "/api/v1/users/public/search")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"content": []}"#)
            .create_async().await;
        let _events = server
            .mock("GET", "/api/v1/events/public/search")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async().await;
        let client = Client::new(&conn(server.url())).unwrap();
        assert_eq!(test_module(&client, false).await.unwrap().readable, "ok");
        assert!(test_module(&client, true).await.is_err());
    }
}
