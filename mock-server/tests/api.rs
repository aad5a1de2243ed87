use axum::http::{self, Request, StatusCode};
use http_body_util::BodyExt;
use mock_server::app;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn form_request(uri: &str, body: &str) -> Request<String> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body.to_string())
        .unwrap()
}

fn json_request(uri: &str, body: &str) -> Request<String> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(body.to_string())
        .unwrap()
}

fn get(uri: &str) -> Request<String> {
    Request::builder().uri(uri).body(String::new()).unwrap()
}

// --- REST dialect ---

#[tokio::test]
async fn list_is_empty_initially() {
    let app = app();
    let resp = app.oneshot(get("/tasks/list?order=id")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["records"], json!([]));
    assert_eq!(body["count"], json!(0));
}

#[tokio::test]
async fn create_assigns_sequential_ids_and_echoes_guids() {
    let app = app();
    let resp = app
        .oneshot(form_request(
            "/tasks/create",
            "records[0][_guid]=a&records[0][title]=first&records[1][_guid]=b&records[1][title]=second",
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["_guid"], json!("a"));
    assert_eq!(records[0]["id"], json!(1));
    assert_eq!(records[1]["_guid"], json!("b"));
    assert_eq!(records[1]["id"], json!(2));
}

#[tokio::test]
async fn created_records_show_up_in_list_and_show() {
    let app = app();
    app.clone()
        .oneshot(form_request("/tasks/create", "records[0][_guid]=a&records[0][title]=milk"))
        .await
        .unwrap();

    let resp = app.clone().oneshot(get("/tasks/list?order=id")).await.unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["count"], json!(1));
    assert_eq!(body["records"][0]["title"], json!("milk"));
    assert_eq!(body["ids"], json!([1]));

    let resp = app.oneshot(get("/tasks/show1")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["records"][0]["title"], json!("milk"));
}

#[tokio::test]
async fn list_applies_conditions_and_limit() {
    let app = app();
    app.clone()
        .oneshot(form_request(
            "/tasks/create",
            "records[0][_guid]=a&records[0][state]=open&records[1][_guid]=b&records[1][state]=done&records[2][_guid]=c&records[2][state]=open",
        ))
        .await
        .unwrap();

    let resp = app.oneshot(get("/tasks/list?order=id&state=open&limit=1")).await.unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["count"], json!(2), "count ignores limit");
    assert_eq!(body["records"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn update_merges_fields() {
    let app = app();
    app.clone()
        .oneshot(form_request("/tasks/create", "records[0][_guid]=a&records[0][title]=old"))
        .await
        .unwrap();
    let resp = app
        .clone()
        .oneshot(form_request(
            "/tasks/update",
            "records[0][id]=1&records[0][title]=new",
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app.oneshot(get("/tasks/show1")).await.unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["records"][0]["title"], json!("new"));
}

#[tokio::test]
async fn destroy_removes_by_id_suffix() {
    let app = app();
    app.clone()
        .oneshot(form_request("/tasks/create", "records[0][_guid]=a&records[0][title]=gone"))
        .await
        .unwrap();
    let resp = app.clone().oneshot(form_request("/tasks/destroy1", "")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app.oneshot(get("/tasks/show1")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn show_of_missing_record_is_404() {
    let app = app();
    let resp = app.oneshot(get("/tasks/show99")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

// --- CouchDB dialect ---

#[tokio::test]
async fn bulk_docs_acknowledges_in_submission_order() {
    let app = app();
    let resp = app
        .oneshot(json_request(
            "/db/_bulk_docs",
            r#"{"docs":[{"type":"Contact","first_name":"Ada"},{"type":"Contact","first_name":"Bob"}]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    let acks = body["new_revs"].as_array().unwrap();
    assert_eq!(acks.len(), 2);
    for ack in acks {
        assert!(ack["id"].as_str().is_some_and(|id| !id.is_empty()));
        assert!(ack["rev"].as_str().is_some_and(|rev| rev.starts_with("1-")));
    }
}

#[tokio::test]
async fn bulk_docs_updates_bump_revisions() {
    let app = app();
    let resp = app
        .clone()
        .oneshot(json_request("/db/_bulk_docs", r#"{"docs":[{"type":"Contact"}]}"#))
        .await
        .unwrap();
    let body = body_json(resp).await;
    let id = body["new_revs"][0]["id"].as_str().unwrap().to_string();

    let resp = app
        .oneshot(json_request(
            "/db/_bulk_docs",
            &format!(r#"{{"docs":[{{"_id":"{id}","type":"Contact","first_name":"Ada"}}]}}"#),
        ))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["new_revs"][0]["id"], json!(id));
    assert!(body["new_revs"][0]["rev"].as_str().unwrap().starts_with("2-"));
}

#[tokio::test]
async fn bulk_docs_deletes_documents() {
    let app = app();
    let resp = app
        .clone()
        .oneshot(json_request("/db/_bulk_docs", r#"{"docs":[{"type":"Contact"}]}"#))
        .await
        .unwrap();
    let body = body_json(resp).await;
    let id = body["new_revs"][0]["id"].as_str().unwrap().to_string();

    app.clone()
        .oneshot(json_request(
            "/db/_bulk_docs",
            &format!(r#"{{"docs":[{{"_id":"{id}","_deleted":true}}]}}"#),
        ))
        .await
        .unwrap();

    let resp = app.oneshot(get(&format!("/db/{id}"))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn temp_view_filters_by_type() {
    let app = app();
    app.clone()
        .oneshot(json_request(
            "/db/_bulk_docs",
            r#"{"docs":[{"type":"Contact","first_name":"Ada"},{"type":"Task","title":"t"}]}"#,
        ))
        .await
        .unwrap();

    let resp = app
        .oneshot(json_request(
            "/db/_temp_view",
            r#"{"map":"function(doc) { if (doc.type == 'Contact') { emit(doc._id, doc) }}"}"#,
        ))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["total_rows"], json!(1));
    assert_eq!(body["rows"][0]["value"]["first_name"], json!("Ada"));
    assert_eq!(body["rows"][0]["id"], body["rows"][0]["value"]["_id"]);
}

#[tokio::test]
async fn design_view_returns_all_rows() {
    let app = app();
    app.clone()
        .oneshot(json_request(
            "/db/_bulk_docs",
            r#"{"docs":[{"type":"Contact"},{"type":"Contact"}]}"#,
        ))
        .await
        .unwrap();

    let resp = app
        .oneshot(get("/db/_design/contacts/_view/by_name"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["total_rows"], json!(2));
}

#[tokio::test]
async fn document_fetch_round_trips() {
    let app = app();
    let resp = app
        .clone()
        .oneshot(json_request(
            "/db/_bulk_docs",
            r#"{"docs":[{"type":"Contact","first_name":"Ada"}]}"#,
        ))
        .await
        .unwrap();
    let body = body_json(resp).await;
    let id = body["new_revs"][0]["id"].as_str().unwrap().to_string();

    let resp = app.oneshot(get(&format!("/db/{id}"))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let doc = body_json(resp).await;
    assert_eq!(doc["first_name"], json!("Ada"));
    assert_eq!(doc["_id"], json!(id));
}
