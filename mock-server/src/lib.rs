//! In-memory HTTP server emulating both wire dialects the sync core speaks:
//! the generic REST resource protocol and the CouchDB
//! design-document/view/bulk-docs dialect. Backs the core's integration
//! tests and runs standalone for manual poking.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, RawQuery, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

pub type Doc = Map<String, Value>;

/// Documents per resource/database, in insertion order. Linear lookup is
/// fine at mock scale.
type Table = Vec<(String, Doc)>;

#[derive(Default)]
pub struct Backend {
    tables: HashMap<String, Table>,
    next_id: u64,
}

pub type Db = Arc<RwLock<Backend>>;

pub fn app() -> Router {
    let db: Db = Arc::new(RwLock::new(Backend { tables: HashMap::new(), next_id: 1 }));
    Router::new()
        .route("/{resource}/_design/{design}/_view/{view}", get(design_view))
        .route("/{resource}/{tail}", get(get_dispatch).post(post_dispatch))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

async fn get_dispatch(
    State(db): State<Db>,
    Path((resource, tail)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> axum::response::Response {
    let params = parse_form(query.as_deref().unwrap_or(""));
    if tail == "list" {
        return rest_list(db, &resource, &params).await.into_response();
    }
    if let Some(id_part) = tail.strip_prefix("show") {
        return rest_show(db, &resource, id_part, &params).await.into_response();
    }
    couch_get_doc(db, &resource, &tail).await.into_response()
}

async fn post_dispatch(
    State(db): State<Db>,
    Path((resource, tail)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    body: String,
) -> axum::response::Response {
    match tail.as_str() {
        "_bulk_docs" => return couch_bulk_docs(db, &resource, &body).await.into_response(),
        "_temp_view" => return couch_temp_view(db, &resource, &body).await.into_response(),
        _ => {}
    }
    let mut params = parse_form(query.as_deref().unwrap_or(""));
    params.extend(parse_form(&body));
    if tail == "create" {
        return rest_create(db, &resource, &params).await.into_response();
    }
    if tail.strip_prefix("update").is_some() {
        return rest_update(db, &resource, &params).await.into_response();
    }
    if let Some(id_part) = tail.strip_prefix("destroy") {
        return rest_destroy(db, &resource, id_part, &params).await.into_response();
    }
    StatusCode::NOT_FOUND.into_response()
}

// ---------------------------------------------------------------------------
// REST dialect
// ---------------------------------------------------------------------------

const CONTROL_PARAMS: &[&str] = &["order", "offset", "limit", "ids", "_method", "records"];

async fn rest_list(db: Db, resource: &str, params: &Doc) -> Json<Value> {
    let backend = db.read().await;
    let table = backend.tables.get(resource).cloned().unwrap_or_default();

    let mut matching: Vec<&Doc> = table
        .iter()
        .map(|(_, doc)| doc)
        .filter(|doc| matches_conditions(doc, params))
        .collect();
    let count = matching.len();

    if let Some(order) = params.get("order").and_then(Value::as_str) {
        let fields: Vec<&str> = order.split(',').collect();
        matching.sort_by_key(|doc| {
            fields
                .iter()
                .map(|field| doc.get(*field).map(scalar_string).unwrap_or_default())
                .collect::<Vec<_>>()
        });
    }

    let offset = numeric_param(params, "offset").unwrap_or(0);
    let limit = numeric_param(params, "limit").unwrap_or(usize::MAX);
    let page: Vec<Value> = matching
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|doc| Value::Object(doc.clone()))
        .collect();
    let ids: Vec<Value> = page
        .iter()
        .filter_map(|doc| doc.get("id").cloned())
        .collect();

    Json(json!({ "records": page, "ids": ids, "count": count }))
}

async fn rest_show(
    db: Db,
    resource: &str,
    id_part: &str,
    params: &Doc,
) -> Result<Json<Value>, StatusCode> {
    let backend = db.read().await;
    let table = backend.tables.get(resource).cloned().unwrap_or_default();

    let wanted: Vec<String> = if id_part.is_empty() {
        params
            .get("ids")
            .map(scalar_string)
            .unwrap_or_default()
            .split(',')
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    } else {
        vec![id_part.to_string()]
    };
    if wanted.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }

    let mut records = Vec::new();
    for id in &wanted {
        match table.iter().find(|(key, _)| key == id) {
            Some((_, doc)) => records.push(Value::Object(doc.clone())),
            None => return Err(StatusCode::NOT_FOUND),
        }
    }
    Ok(Json(json!({ "records": records })))
}

async fn rest_create(db: Db, resource: &str, params: &Doc) -> Json<Value> {
    let mut backend = db.write().await;
    let mut acked = Vec::new();
    for record in records_array(params) {
        let mut doc = record.clone();
        let id = backend.next_id;
        backend.next_id += 1;
        doc.insert("id".to_string(), json!(id));
        let mut ack = doc.clone();
        doc.remove("_guid");
        backend
            .tables
            .entry(resource.to_string())
            .or_default()
            .push((id.to_string(), doc));
        // The acknowledgement echoes the correlation tag alongside the
        // assigned identity.
        ack.retain(|key, _| key == "_guid" || key == "id");
        acked.push(Value::Object(ack));
    }
    Json(json!({ "records": acked }))
}

async fn rest_update(db: Db, resource: &str, params: &Doc) -> Result<Json<Value>, StatusCode> {
    let mut backend = db.write().await;
    let table = backend.tables.entry(resource.to_string()).or_default();
    let mut updated = Vec::new();
    for record in records_array(params) {
        let Some(id) = record.get("id").map(scalar_string) else {
            return Err(StatusCode::BAD_REQUEST);
        };
        let Some((_, doc)) = table.iter_mut().find(|(key, _)| *key == id) else {
            return Err(StatusCode::NOT_FOUND);
        };
        for (field, value) in record {
            if field != "_method" {
                doc.insert(field, value);
            }
        }
        updated.push(Value::Object(doc.clone()));
    }
    Ok(Json(json!({ "records": updated })))
}

async fn rest_destroy(
    db: Db,
    resource: &str,
    id_part: &str,
    params: &Doc,
) -> Result<Json<Value>, StatusCode> {
    let mut backend = db.write().await;
    let table = backend.tables.entry(resource.to_string()).or_default();

    let wanted: Vec<String> = if id_part.is_empty() {
        params
            .get("ids")
            .map(scalar_string)
            .unwrap_or_default()
            .split(',')
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    } else {
        vec![id_part.to_string()]
    };
    if wanted.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    table.retain(|(key, _)| !wanted.contains(key));
    Ok(Json(json!({ "status": "ok" })))
}

fn matches_conditions(doc: &Doc, params: &Doc) -> bool {
    params
        .iter()
        .filter(|(key, _)| !CONTROL_PARAMS.contains(&key.as_str()))
        .all(|(key, value)| doc.get(key).map(scalar_string) == Some(scalar_string(value)))
}

fn numeric_param(params: &Doc, key: &str) -> Option<usize> {
    params.get(key).and_then(|value| scalar_string(value).parse().ok())
}

/// Records payload normalization: either a bracketed `records[N][field]`
/// array or a single JSON-encoded `records` string field.
fn records_array(params: &Doc) -> Vec<Doc> {
    match params.get("records") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .collect(),
        Some(Value::String(encoded)) => serde_json::from_str::<Vec<Doc>>(encoded)
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// CouchDB dialect
// ---------------------------------------------------------------------------

async fn couch_get_doc(db: Db, resource: &str, id: &str) -> Result<Json<Value>, StatusCode> {
    let backend = db.read().await;
    let table = backend.tables.get(resource).ok_or(StatusCode::NOT_FOUND)?;
    table
        .iter()
        .find(|(key, _)| key == id)
        .map(|(_, doc)| Json(Value::Object(doc.clone())))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn design_view(
    State(db): State<Db>,
    Path((resource, _design, _view)): Path<(String, String, String)>,
) -> Json<Value> {
    let backend = db.read().await;
    let table = backend.tables.get(&resource).cloned().unwrap_or_default();
    let rows: Vec<Value> = table
        .iter()
        .map(|(id, doc)| json!({ "id": id, "value": doc }))
        .collect();
    Json(json!({ "total_rows": rows.len(), "rows": rows }))
}

async fn couch_temp_view(db: Db, resource: &str, body: &str) -> Result<Json<Value>, StatusCode> {
    let view: Value = serde_json::from_str(body).map_err(|_| StatusCode::BAD_REQUEST)?;
    let map_source = view.get("map").and_then(Value::as_str).unwrap_or("");
    let type_filter = extract_type_filter(map_source);

    let backend = db.read().await;
    let table = backend.tables.get(resource).cloned().unwrap_or_default();
    let rows: Vec<Value> = table
        .iter()
        .filter(|(_, doc)| match &type_filter {
            Some(name) => doc.get("type").and_then(Value::as_str) == Some(name),
            None => true,
        })
        .map(|(id, doc)| json!({ "id": id, "value": doc }))
        .collect();
    Ok(Json(json!({ "total_rows": rows.len(), "rows": rows })))
}

async fn couch_bulk_docs(db: Db, resource: &str, body: &str) -> Result<Json<Value>, StatusCode> {
    let payload: Value = serde_json::from_str(body).map_err(|_| StatusCode::BAD_REQUEST)?;
    let docs = payload
        .get("docs")
        .and_then(Value::as_array)
        .ok_or(StatusCode::BAD_REQUEST)?;

    let mut backend = db.write().await;
    let table = backend.tables.entry(resource.to_string()).or_default();

    // Acknowledgements are emitted in submission order; the client relies
    // on positional correlation.
    let mut new_revs = Vec::with_capacity(docs.len());
    for doc in docs {
        let Some(doc) = doc.as_object() else {
            return Err(StatusCode::BAD_REQUEST);
        };
        let deleted = doc.get("_deleted").and_then(Value::as_bool).unwrap_or(false);
        match doc.get("_id").and_then(Value::as_str) {
            Some(id) if deleted => {
                let rev = next_rev(table.iter().find(|(key, _)| key == id).map(|(_, d)| d));
                table.retain(|(key, _)| key != id);
                new_revs.push(json!({ "id": id, "rev": rev }));
            }
            Some(id) => {
                let rev = next_rev(table.iter().find(|(key, _)| key == id).map(|(_, d)| d));
                let mut stored = doc.clone();
                stored.insert("_rev".to_string(), json!(rev));
                match table.iter_mut().find(|(key, _)| key == id) {
                    Some((_, existing)) => *existing = stored,
                    None => table.push((id.to_string(), stored)),
                }
                new_revs.push(json!({ "id": id, "rev": rev }));
            }
            None => {
                let id = Uuid::new_v4().simple().to_string();
                let rev = format!("1-{}", &Uuid::new_v4().simple().to_string()[..8]);
                let mut stored = doc.clone();
                stored.insert("_id".to_string(), json!(id));
                stored.insert("_rev".to_string(), json!(rev));
                table.push((id.clone(), stored));
                new_revs.push(json!({ "id": id, "rev": rev }));
            }
        }
    }
    Ok(Json(json!({ "new_revs": new_revs })))
}

fn extract_type_filter(map_source: &str) -> Option<String> {
    let (_, after) = map_source.split_once("doc.type == '")?;
    let (name, _) = after.split_once('\'')?;
    Some(name.to_string())
}

fn next_rev(existing: Option<&Doc>) -> String {
    let generation = existing
        .and_then(|doc| doc.get("_rev"))
        .and_then(Value::as_str)
        .and_then(|rev| rev.split_once('-'))
        .and_then(|(n, _)| n.parse::<u64>().ok())
        .unwrap_or(0);
    format!("{}-{}", generation + 1, &Uuid::new_v4().simple().to_string()[..8])
}

// ---------------------------------------------------------------------------
// Form parsing
// ---------------------------------------------------------------------------

/// Parse a `key=value&...` string with bracketed key paths
/// (`records[0][title]`) into a nested structure. Tolerates unescaped
/// values and undoes `%XX`/`%uXXXX` escaping.
pub fn parse_form(input: &str) -> Doc {
    let mut root = Doc::new();
    for pair in input.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let segments = key_segments(key);
        if segments.is_empty() {
            continue;
        }
        insert_path(&mut root, &segments, unescape(value));
    }
    root
}

fn key_segments(key: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut rest = key;
    if let Some(open) = rest.find('[') {
        segments.push(rest[..open].to_string());
        rest = &rest[open..];
        while let Some(stripped) = rest.strip_prefix('[') {
            match stripped.find(']') {
                Some(close) => {
                    segments.push(stripped[..close].to_string());
                    rest = &stripped[close + 1..];
                }
                None => break,
            }
        }
    } else {
        segments.push(rest.to_string());
    }
    segments
}

fn insert_path(target: &mut Doc, segments: &[String], value: String) {
    if segments.len() == 1 {
        target.insert(segments[0].clone(), Value::String(value));
        return;
    }
    let child_is_index = segments[1].parse::<usize>().is_ok();
    let slot = target
        .entry(segments[0].clone())
        .or_insert_with(|| if child_is_index { json!([]) } else { json!({}) });
    insert_path_value(slot, &segments[1..], value);
}

fn insert_path_value(target: &mut Value, segments: &[String], value: String) {
    if segments.is_empty() {
        return;
    }
    match target {
        Value::Array(items) => {
            let Ok(index) = segments[0].parse::<usize>() else { return };
            while items.len() <= index {
                items.push(Value::Null);
            }
            if segments.len() == 1 {
                items[index] = Value::String(value);
            } else {
                if items[index].is_null() {
                    let child_is_index = segments[1].parse::<usize>().is_ok();
                    items[index] = if child_is_index { json!([]) } else { json!({}) };
                }
                insert_path_value(&mut items[index], &segments[1..], value);
            }
        }
        Value::Object(map) => {
            if segments.len() == 1 {
                map.insert(segments[0].clone(), Value::String(value));
            } else {
                let child_is_index = segments[1].parse::<usize>().is_ok();
                let slot = map
                    .entry(segments[0].clone())
                    .or_insert_with(|| if child_is_index { json!([]) } else { json!({}) });
                insert_path_value(slot, &segments[1..], value);
            }
        }
        _ => {}
    }
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.char_indices();
    let bytes = value.as_bytes();
    while let Some((index, ch)) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        if bytes.get(index + 1) == Some(&b'u') {
            if let Some(hex) = value.get(index + 2..index + 6) {
                if let Ok(code) = u32::from_str_radix(hex, 16) {
                    if let Some(decoded) = char::from_u32(code) {
                        out.push(decoded);
                        for _ in 0..5 {
                            chars.next();
                        }
                        continue;
                    }
                }
            }
        } else if let Some(hex) = value.get(index + 1..index + 3) {
            if let Ok(code) = u8::from_str_radix(hex, 16) {
                out.push(code as char);
                for _ in 0..2 {
                    chars.next();
                }
                continue;
            }
        }
        out.push(ch);
    }
    out
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_form_flat_pairs() {
        let parsed = parse_form("order=title&limit=10");
        assert_eq!(parsed.get("order"), Some(&json!("title")));
        assert_eq!(parsed.get("limit"), Some(&json!("10")));
    }

    #[test]
    fn parse_form_bracketed_records() {
        let parsed = parse_form("records[0][title]=a&records[0][_guid]=g1&records[1][title]=b");
        let records = parsed.get("records").and_then(Value::as_array).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["title"], json!("a"));
        assert_eq!(records[0]["_guid"], json!("g1"));
        assert_eq!(records[1]["title"], json!("b"));
    }

    #[test]
    fn parse_form_nested_maps() {
        let parsed = parse_form("filter[status]=open&filter[owner]=bob");
        assert_eq!(parsed["filter"]["status"], json!("open"));
        assert_eq!(parsed["filter"]["owner"], json!("bob"));
    }

    #[test]
    fn parse_form_unescapes_percent_sequences() {
        let parsed = parse_form("records=%5B%7B%22id%22%3A1%7D%5D");
        assert_eq!(parsed.get("records"), Some(&json!(r#"[{"id":1}]"#)));
    }

    #[test]
    fn records_array_accepts_json_string_form() {
        let mut params = Doc::new();
        params.insert("records".to_string(), json!(r#"[{"id":"1","title":"t"}]"#));
        let records = records_array(&params);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["title"], json!("t"));
    }

    #[test]
    fn temp_view_type_filter_extraction() {
        let source = "function(doc) { if (doc.type == 'Contact') { emit(doc._id, doc) }}";
        assert_eq!(extract_type_filter(source), Some("Contact".to_string()));
        assert_eq!(extract_type_filter("function(doc) {}"), None);
    }

    #[test]
    fn next_rev_bumps_generation() {
        let mut doc = Doc::new();
        doc.insert("_rev".to_string(), json!("3-abc"));
        let rev = next_rev(Some(&doc));
        assert!(rev.starts_with("4-"));
        assert!(next_rev(None).starts_with("1-"));
    }
}
