use serde_json::{ Map, Value };

/// Renders JSON objects as a markdown table under a `###` heading.
///
/// `headers` picks and orders the columns; without it every key seen is used
/// in key order. With `remove_null`, columns that are null or missing
/// in every row are dropped. A single object is treated as one row.
pub fn to_markdown(name: &str, rows: &Value, headers: Option<&[&str]>, remove_null: bool) -> String {
    let rows: Vec<&Map<String, Value>> = match rows {
        Value::Array(a) => a.iter().filter_map(Value::as_object).collect(),
        Value::Object(o) => vec![o],
        _ => vec![],
    };
    let mut out = format!("### {}\n", name);
    if rows.is_empty() {
        out.push_str("**No entries.**\n");
        return out;
    }

    let mut columns: Vec<String> = match headers {
        Some(h) => h.iter().map(|s| s.to_string()).collect(),
        None => {
            let mut cols: Vec<String> = vec![];
            for r in rows.iter() {
                for k in r.keys() {
                    if !cols.contains(k) {
                        cols.push(k.clone());
                    }
                }
            }
            cols
        }
    };
    if remove_null {
        columns.retain(|c| rows.iter().any(|r| !is_null(r.get(c))));
    }
    if columns.is_empty() {
        out.push_str("**No entries.**\n");
        return out;
    }

    out.push('|');
    out.push_str(&columns.iter().map(|c| escape(c)).collect::<Vec<_>>().join("|"));
    out.push_str("|\n|");
    out.push_str(&columns.iter().map(|_| "---").collect::<Vec<_>>().join("|"));
    out.push_str("|\n");
    for r in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| escape(&cell(r.get(c))))
            .collect();
        out.push('|');
        out.push_str(&cells.join("|"));
        out.push_str("|\n");
    }
    out
}

fn is_null(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        _ => false,
    }
}

fn cell(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(a)) if a.iter().all(|x| !x.is_object() && !x.is_array()) => {
            a.iter()
                .map(|x| cell(Some(x)))
                .collect::<Vec<_>>()
                .join(", ")
        }
        Some(other) => other.to_string(),
    }
}

fn escape(s: &str) -> String {
    s.replace('|', "\\|").replace("\r\n", "<br>").replace('\n', "<br>")
}
