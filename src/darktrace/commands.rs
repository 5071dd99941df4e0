use anyhow::{ anyhow, Result };
use clap::{ Subcommand, ValueEnum };
use serde_json::{ json, Map, Value };

use super::{ model_name, Client };
use crate::{
    command::CommandOutput,
    http::Query,
    table::to_markdown,
    timestamp::{ TimestampParser, VendorTimestampParser },
    utils,
};

const BREACH_PREFIX: &str = "Darktrace.ModelBreach";

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointType {
    Hostname,
    Ip,
}

impl EndpointType {
    fn param(&self) -> &'static str {
        match self {
            EndpointType::Hostname => "hostname",
            EndpointType::Ip => "ip",
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum DarktraceCommand {
    /// Get a model breach
    GetBreach {
        #[arg(long)]
        pbid: u64,
    },
    /// List the comments of a model breach
    GetComments {
        #[arg(long)]
        pbid: u64,
    },
    /// Acknowledge a model breach
    Acknowledge {
        #[arg(long)]
        pbid: u64,
    },
    /// Remove the acknowledgement of a model breach
    Unacknowledge {
        #[arg(long)]
        pbid: u64,
    },
    /// List devices that behave like the given one
    ListSimilarDevices {
        #[arg(long)]
        did: u64,
        #[arg(long, default_value_t = 5)]
        max_results: u32,
    },
    /// Get what Darktrace knows about an external hostname or IP
    GetExternalEndpointDetails {
        #[arg(long, value_enum)]
        endpoint_type: EndpointType,
        #[arg(long)]
        endpoint_value: String,
        #[arg(long, default_value_t = false)]
        additional_info: bool,
        #[arg(long, default_value_t = false)]
        devices: bool,
        #[arg(long, default_value_t = false)]
        score: bool,
    },
    /// Get graph data of a device's connections
    GetDeviceConnectionInfo {
        #[arg(long)]
        did: u64,
        /// co, sizein or sizeout
        #[arg(long, default_value = "co")]
        data_type: String,
        #[arg(long)]
        external_domain: Option<String>,
        #[arg(long)]
        destination_did: Option<u64>,
        #[arg(long, default_value_t = false)]
        show_all_graph_data: bool,
        #[arg(long, default_value_t = false)]
        full_device_details: bool,
    },
    /// Search devices by identity
    GetDeviceIdentityInfo {
        #[arg(long)]
        query: String,
        #[arg(long)]
        count: Option<u32>,
        #[arg(long)]
        order_by: Option<String>,
        #[arg(long)]
        order: Option<String>,
        #[arg(long)]
        offset: Option<u32>,
    },
    /// Get the entity details of a device or user
    GetEntityDetails {
        /// Comma separated key=value pairs, e.g. "did=1,count=10"
        #[arg(long)]
        query: String,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
}

pub async fn run(client: &Client, cmd: DarktraceCommand) -> Result<CommandOutput> {
    match cmd {
        DarktraceCommand::GetBreach { pbid } => get_breach(client, pbid).await,
        DarktraceCommand::GetComments { pbid } => get_comments(client, pbid).await,
        DarktraceCommand::Acknowledge { pbid } => set_acknowledged(client, pbid, true).await,
        DarktraceCommand::Unacknowledge { pbid } => set_acknowledged(client, pbid, false).await,
        DarktraceCommand::ListSimilarDevices { did, max_results } =>
            list_similar_devices(client, did, max_results).await,
        DarktraceCommand::GetExternalEndpointDetails {
            endpoint_type,
            endpoint_value,
            additional_info,
            devices,
            score,
        } => {
            let resp = client.endpoint_details(
                endpoint_type.param(),
                &endpoint_value,
                additional_info,
                devices,
                score
            ).await?;
            Ok(
                CommandOutput::new(
                    to_markdown(&format!("Darktrace: {} details", endpoint_value), &resp, None, true),
                    "Darktrace.ExternalEndpointDetails",
                    None,
                    resp.clone(),
                    resp
                )
            )
        }
        DarktraceCommand::GetDeviceConnectionInfo {
            did,
            data_type,
            external_domain,
            destination_did,
            show_all_graph_data,
            full_device_details,
        } => {
            let mut q: Query = vec![("did", did.to_string()), ("datatype", data_type)];
            if let Some(d) = external_domain {
                q.push(("externaldomain", d));
            }
            if let Some(o) = destination_did {
                q.push(("odid", o.to_string()));
            }
            q.push(("showallgraphdata", show_all_graph_data.to_string()));
            q.push(("fulldevicedetails", full_device_details.to_string()));
            let resp = client.device_info(&q).await?;
            Ok(
                CommandOutput::new(
                    to_markdown(&format!("Darktrace: device {} connection info", did), &resp, None, true),
                    "Darktrace.DeviceConnectionInfo",
                    None,
                    resp.clone(),
                    resp
                )
            )
        }
        DarktraceCommand::GetDeviceIdentityInfo { query, count, order_by, order, offset } => {
            let mut q: Query = vec![("query", query.clone())];
            if let Some(c) = count {
                q.push(("count", c.to_string()));
            }
            if let Some(o) = order_by {
                q.push(("orderBy", o));
            }
            if let Some(o) = order {
                q.push(("order", o));
            }
            if let Some(o) = offset {
                q.push(("offset", o.to_string()));
            }
            let resp = client.device_search(&q).await?;
            let devices = resp.get("devices").cloned().unwrap_or(Value::Array(vec![]));
            Ok(
                CommandOutput::new(
                    to_markdown(&format!("Darktrace: devices matching {}", query), &devices, None, true),
                    "Darktrace.DeviceIdentityInfo",
                    Some("devices.did"),
                    resp.clone(),
                    resp
                )
            )
        }
        DarktraceCommand::GetEntityDetails { query, offset } => get_entity_details(client, &query, offset).await,
    }
}

pub async fn test_module(client: &Client) -> Result<CommandOutput> {
    client.search_breaches(1.0, chrono::Utc::now().timestamp_millis()).await?;
    Ok(CommandOutput::message("ok"))
}

fn ms_to_iso(v: Option<&Value>) -> Value {
    let parsed = match v {
        Some(Value::Number(n)) => VendorTimestampParser.parse(&n.to_string()).ok(),
        Some(Value::String(s)) => VendorTimestampParser.parse(s).ok(),
        _ => None,
    };
    parsed.map(|t| Value::String(utils::format_timestamp(&t))).unwrap_or(Value::Null)
}

fn pick(src: Option<&Value>, keys: &[&str]) -> Value {
    let mut out = Map::new();
    if let Some(Value::Object(o)) = src {
        for k in keys {
            if let Some(v) = o.get(*k) {
                out.insert(k.to_string(), v.clone());
            }
        }
    }
    Value::Object(out)
}

/// The breach fields worth keeping in the context, with the time converted.
fn format_breach(breach: &Map<String, Value>) -> Value {
    json!({
        "pbid": breach.get("pbid"),
        "time": ms_to_iso(breach.get("time")),
        "commentCount": breach.get("commentCount"),
        "score": breach.get("score"),
        "model": pick(breach.get("model"), &["name", "pid", "phid", "uuid", "tags", "priority", "category", "description"]),
        "device": pick(breach.get("device"), &["did", "ip", "hostname", "macaddress", "vendor"]),
    })
}

pub async fn get_breach(client: &Client, pbid: u64) -> Result<CommandOutput> {
    let resp = client.get_breach(pbid).await?;
    let breach = match &resp {
        Value::Array(a) => a.first().and_then(Value::as_object),
        Value::Object(o) => Some(o),
        _ => None,
    };
    let Some(breach) = breach.filter(|b| !b.is_empty()) else {
        return Ok(CommandOutput::message(format!("No model breach found with pbid {}.", pbid)));
    };
    let formatted = format_breach(breach);
    let row =
        json!({
        "pbid": formatted["pbid"],
        "time": formatted["time"],
        "score": formatted["score"],
        "commentCount": formatted["commentCount"],
        "model": model_name(breach),
        "device": formatted["device"]["hostname"],
    });
    Ok(
        CommandOutput::new(
            to_markdown(&format!("Darktrace Model Breach {}", pbid), &row, None, true),
            BREACH_PREFIX,
            Some("pbid"),
            formatted,
            resp
        )
    )
}

pub async fn get_comments(client: &Client, pbid: u64) -> Result<CommandOutput> {
    let resp = client.get_comments(pbid).await?;
    let comments: Vec<Value> = match &resp {
        Value::Array(a) => {
            a.iter()
                .filter_map(Value::as_object)
                .map(|c| {
                    let mut c = c.clone();
                    let t = ms_to_iso(c.get("time"));
                    c.insert("time".to_string(), t);
                    Value::Object(c)
                })
                .collect()
        }
        _ => vec![],
    };
    let context = json!({ "comments": comments, "pid": pbid });
    Ok(
        CommandOutput::new(
            to_markdown(
                &format!("Darktrace Model Breach {} Comments", pbid),
                &context["comments"],
                Some(&["time", "username", "message"]),
                true
            ),
            BREACH_PREFIX,
            Some("pid"),
            context,
            resp
        )
    )
}

pub async fn set_acknowledged(client: &Client, pbid: u64, acknowledge: bool) -> Result<CommandOutput> {
    let resp = if acknowledge {
        client.acknowledge(pbid).await?
    } else {
        client.unacknowledge(pbid).await?
    };
    let verb = if acknowledge { "acknowledged" } else { "unacknowledged" };
    if resp.get("response").and_then(Value::as_str) != Some("SUCCESS") {
        return Err(anyhow!("model breach {} was not {}: {}", pbid, verb, resp));
    }
    let message = format!("Model Breach {} {}", pbid, verb);
    let context = json!({ "pbid": pbid, "acknowledged": acknowledge, "message": message });
    Ok(
        CommandOutput::new(
            to_markdown("Darktrace", &context, Some(&["pbid", "acknowledged", "message"]), false),
            BREACH_PREFIX,
            Some("pbid"),
            context,
            resp
        )
    )
}

pub async fn list_similar_devices(client: &Client, did: u64, max_results: u32) -> Result<CommandOutput> {
    let resp = client.similar_devices(did, max_results).await?;
    let devices = match &resp {
        Value::Array(_) => resp.clone(),
        _ => Value::Array(vec![]),
    };
    let context = json!({ "did": did, "similarDevices": devices });
    Ok(
        CommandOutput::new(
            to_markdown(
                &format!("Darktrace: devices similar to {}", did),
                &context["similarDevices"],
                Some(&["did", "score", "ip", "hostname", "macaddress", "vendor", "typename"]),
                true
            ),
            "Darktrace.SimilarDevices",
            Some("did"),
            context,
            resp
        )
    )
}

/// "did=1,count=10" into query pairs.
fn parse_entity_query(query: &str) -> Result<Query> {
    const KEYS: [&str; 13] = [
        "did",
        "count",
        "starttime",
        "endtime",
        "from",
        "to",
        "eventtype",
        "msg",
        "pbid",
        "blockedconnections",
        "deduplicate",
        "fulldevicedetails",
        "uid",
    ];
    let mut q: Query = vec![];
    for pair in query.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("malformed query pair {:?}, expected key=value", pair))?;
        let key = KEYS.iter()
            .find(|known| known.eq_ignore_ascii_case(k.trim()))
            .ok_or_else(|| anyhow!("unsupported entity details parameter {:?}", k))?;
        q.push((*key, v.trim().to_string()));
    }
    if q.is_empty() {
        return Err(anyhow!("entity details query cannot be empty"));
    }
    Ok(q)
}

pub async fn get_entity_details(client: &Client, query: &str, offset: usize) -> Result<CommandOutput> {
    let q = parse_entity_query(query)?;
    let resp = client.entity_details(&q).await?;
    let details = match &resp {
        Value::Array(a) => Value::Array(a.iter().skip(offset).cloned().collect()),
        other => other.clone(),
    };
    Ok(
        CommandOutput::new(
            to_markdown(&format!("Darktrace: entity details for {}", query), &details, None, true),
            "Darktrace.EntityDetails",
            None,
            details,
            resp
        )
    )
}
