//! End-to-end tests driving the full router: register guardians, view,
//! edit, record handovers, and export the PDF record.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http_body_util::BodyExt;
use lopdf::Document;
use nabi_handover::api::{create_router, AppState};
use nabi_handover::config::{HttpConfig, StorageConfig};
use nabi_handover::font::TrueTypeFont;
use nabi_handover::image_store::ImageStore;
use nabi_handover::pdf::PdfExporter;
use nabi_handover::registry::Registry;
use nabi_handover::signature_store::SignatureStore;
use serde_json::Value;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "test-boundary-7MA4YWxkTrZu0gW";

// ========== Harness ==========

struct TestApp {
    router: Router,
    upload_dir: TempDir,
}

impl TestApp {
    fn upload_path(&self) -> &Path {
        self.upload_dir.path()
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

fn test_app() -> TestApp {
    let upload_dir = tempfile::tempdir().unwrap();
    let storage = StorageConfig {
        upload_dir: upload_dir.path().to_path_buf(),
        max_image_dimension: 300,
    };

    let registry = Arc::new(Registry::new());
    let images = Arc::new(ImageStore::new(&storage).unwrap());
    let signatures = Arc::new(SignatureStore::new(&storage).unwrap());
    let font = TrueTypeFont::load(&font_path()).unwrap();
    let pdf = Arc::new(PdfExporter::new(font, storage.upload_dir.clone()));

    let state = AppState {
        registry,
        images,
        signatures,
        pdf,
    };
    let router = create_router(state, &HttpConfig::default());

    TestApp { router, upload_dir }
}

fn font_path() -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/fonts/DejaVuSans.ttf"))
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([40, 90, 200]));
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageOutputFormat::Png)
        .unwrap();
    buf
}

struct MultipartBuilder {
    body: Vec<u8>,
}

impl MultipartBuilder {
    fn new() -> Self {
        Self { body: Vec::new() }
    }

    fn text(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
        self
    }

    fn file(mut self, name: &str, filename: &str, bytes: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; \
                 filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(bytes);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    fn finish(mut self) -> Vec<u8> {
        self.body
            .extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        self.body
    }
}

fn post_multipart(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn post_form(uri: &str, pairs: &[(&str, &str)]) -> Request<Body> {
    let body: String = pairs
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencode(v)))
        .collect::<Vec<_>>()
        .join("&");
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            "application/x-www-form-urlencoded",
        )
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn urlencode(value: &str) -> String {
    let mut out = String::new();
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn redirect_target(response: &Response) -> String {
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

fn signature_data_uri() -> String {
    format!(
        "data:image/png;base64,{}",
        STANDARD.encode(png_bytes(40, 20))
    )
}

async fn register_guardians(app: &TestApp, names: &[(&str, &str)]) -> String {
    let mut form = MultipartBuilder::new();
    for (i, (name, phone)) in names.iter().enumerate() {
        form = form
            .text(&format!("name{}", i + 1), name)
            .text(&format!("phone{}", i + 1), phone);
    }
    let response = app.send(post_multipart("/register", form.finish())).await;
    redirect_target(&response)
        .strip_prefix("/child/")
        .unwrap()
        .to_string()
}

fn glyph_hex(font: &TrueTypeFont, text: &str) -> String {
    font.encode_text(text)
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect()
}

fn page_content_upper(pdf_bytes: &[u8]) -> String {
    let doc = Document::load_mem(pdf_bytes).unwrap();
    let pages = doc.get_pages();
    assert_eq!(pages.len(), 1);
    let page_id = *pages.values().next().unwrap();
    String::from_utf8_lossy(&doc.get_page_content(page_id).unwrap()).to_uppercase()
}

// ========== Registration and view ==========

#[tokio::test]
async fn root_redirects_to_register() {
    let app = test_app();
    let response = app.send(get("/")).await;
    assert_eq!(redirect_target(&response), "/register");
}

#[tokio::test]
async fn register_form_is_described_as_json() {
    let app = test_app();
    let response = app.send(get("/register")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["max_guardians"], 5);
}

#[tokio::test]
async fn registration_stores_complete_slots_in_order() {
    let app = test_app();

    let form = MultipartBuilder::new()
        .text("name1", "Alice")
        .text("phone1", "010-1111-2222")
        .file("photo1", "alice.png", &png_bytes(500, 400))
        .text("name2", "Bob")
        .text("phone2", "010-3333-4444")
        .file("photo2", "notes.txt", b"not an image")
        .text("name3", "Carol")
        // slot 3 has no phone: dropped
        .finish();
    let response = app.send(post_multipart("/register", form)).await;

    let child_id = redirect_target(&response)
        .strip_prefix("/child/")
        .unwrap()
        .to_string();
    assert_eq!(child_id.len(), 8);

    let json = body_json(app.send(get(&format!("/child/{child_id}"))).await).await;
    let guardians = json["guardians"].as_array().unwrap();
    assert_eq!(guardians.len(), 2);
    assert_eq!(guardians[0]["name"], "Alice");
    assert_eq!(guardians[1]["name"], "Bob");

    // Valid photo stored and bounded; .txt upload rejected without a trace
    let photo = guardians[0]["photo"].as_str().unwrap();
    assert!(photo.ends_with("_alice.png"));
    let stored = image::open(app.upload_path().join(photo)).unwrap();
    assert_eq!(image::GenericImageView::dimensions(&stored), (300, 240));
    assert!(guardians[1]["photo"].is_null());
}

#[tokio::test]
async fn registration_with_no_complete_slots_yields_empty_record() {
    let app = test_app();
    let child_id = register_guardians(&app, &[]).await;

    let json = body_json(app.send(get(&format!("/child/{child_id}"))).await).await;
    assert_eq!(json["guardians"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn photo_on_incomplete_slot_is_stored_but_unreferenced() {
    let app = test_app();

    let form = MultipartBuilder::new()
        .file("photo4", "orphan.png", &png_bytes(10, 10))
        .finish();
    let response = app.send(post_multipart("/register", form)).await;
    let child_id = redirect_target(&response)
        .strip_prefix("/child/")
        .unwrap()
        .to_string();

    let json = body_json(app.send(get(&format!("/child/{child_id}"))).await).await;
    assert_eq!(json["guardians"].as_array().unwrap().len(), 0);

    let stored: Vec<_> = fs::read_dir(app.upload_path()).unwrap().collect();
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn unknown_child_view_returns_empty_list() {
    let app = test_app();
    let response = app.send(get("/child/zzzz9999")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["child_id"], "zzzz9999");
    assert_eq!(json["guardians"].as_array().unwrap().len(), 0);
}

// ========== Editing ==========

#[tokio::test]
async fn edit_replaces_list_and_delete_flag_drops_slot() {
    let app = test_app();
    let child_id = register_guardians(
        &app,
        &[
            ("Alice", "010-1111-1111"),
            ("Bob", "010-2222-2222"),
            ("Carol", "010-3333-3333"),
        ],
    )
    .await;

    let form = MultipartBuilder::new()
        .text("name1", "Alice")
        .text("phone1", "010-1111-1111")
        .text("name2", "Bobby")
        .text("phone2", "010-9999-9999")
        .text("name3", "Carol")
        .text("phone3", "010-3333-3333")
        .text("delete3", "on")
        .finish();
    let response = app
        .send(post_multipart(&format!("/edit/{child_id}"), form))
        .await;
    assert_eq!(redirect_target(&response), format!("/child/{child_id}"));

    let json = body_json(app.send(get(&format!("/child/{child_id}"))).await).await;
    let guardians = json["guardians"].as_array().unwrap();
    assert_eq!(guardians.len(), 2);
    assert_eq!(guardians[0]["name"], "Alice");
    assert_eq!(guardians[1]["name"], "Bobby");
}

#[tokio::test]
async fn edit_stores_upload_on_deleted_slot_but_drops_the_slot() {
    let app = test_app();
    let child_id = register_guardians(&app, &[("Alice", "010-1111-1111")]).await;

    // An upload on a slot marked for deletion is saved before the delete
    // flag is honored; the file stays on disk unreferenced
    let form = MultipartBuilder::new()
        .text("name1", "Alice")
        .text("phone1", "010-1111-1111")
        .file("photo1", "fresh.png", &png_bytes(10, 10))
        .text("delete1", "on")
        .finish();
    let response = app
        .send(post_multipart(&format!("/edit/{child_id}"), form))
        .await;
    assert_eq!(redirect_target(&response), format!("/child/{child_id}"));

    let json = body_json(app.send(get(&format!("/child/{child_id}"))).await).await;
    assert_eq!(json["guardians"].as_array().unwrap().len(), 0);

    let stored: Vec<_> = fs::read_dir(app.upload_path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].ends_with("_fresh.png"));
}

#[tokio::test]
async fn edit_keeps_existing_photo_only_when_reference_is_valid() {
    let app = test_app();

    let form = MultipartBuilder::new()
        .text("name1", "Alice")
        .text("phone1", "010-1111-1111")
        .file("photo1", "alice.png", &png_bytes(50, 50))
        .finish();
    let response = app.send(post_multipart("/register", form)).await;
    let child_id = redirect_target(&response)
        .strip_prefix("/child/")
        .unwrap()
        .to_string();

    let json = body_json(app.send(get(&format!("/child/{child_id}"))).await).await;
    let stored_photo = json["guardians"][0]["photo"].as_str().unwrap().to_string();

    // Carrying the real stored name keeps the photo
    let form = MultipartBuilder::new()
        .text("name1", "Alice")
        .text("phone1", "010-1111-1111")
        .text("existing_photo1", &stored_photo)
        .finish();
    app.send(post_multipart(&format!("/edit/{child_id}"), form))
        .await;

    let json = body_json(app.send(get(&format!("/child/{child_id}"))).await).await;
    assert_eq!(json["guardians"][0]["photo"], stored_photo.as_str());

    // A forged reference degrades to no photo
    let form = MultipartBuilder::new()
        .text("name1", "Alice")
        .text("phone1", "010-1111-1111")
        .text("existing_photo1", "../../etc/passwd")
        .finish();
    app.send(post_multipart(&format!("/edit/{child_id}"), form))
        .await;

    let json = body_json(app.send(get(&format!("/child/{child_id}"))).await).await;
    assert!(json["guardians"][0]["photo"].is_null());
}

#[tokio::test]
async fn edit_of_unknown_child_creates_guardians_but_no_handover_log() {
    let app = test_app();

    let form = MultipartBuilder::new()
        .text("name1", "Alice")
        .text("phone1", "010-1111-1111")
        .finish();
    app.send(post_multipart("/edit/neverreg", form)).await;

    let json = body_json(app.send(get("/child/neverreg")).await).await;
    assert_eq!(json["guardians"].as_array().unwrap().len(), 1);

    // Still not registered as far as handovers are concerned
    let response = app
        .send(post_form(
            "/handover/neverreg",
            &[("name", "Alice"), ("signature", &signature_data_uri())],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ========== Handover ==========

#[tokio::test]
async fn handover_records_event_and_confirms() {
    let app = test_app();
    let child_id = register_guardians(&app, &[("Alice", "010-1111-1111")]).await;

    let response = app
        .send(post_form(
            &format!("/handover/{child_id}"),
            &[("name", "Alice"), ("signature", &signature_data_uri())],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.contains("Handover recorded"));

    // Decoded signature landed in the upload directory
    let signatures: Vec<_> = fs::read_dir(app.upload_path())
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .ends_with("_signature.png")
        })
        .collect();
    assert_eq!(signatures.len(), 1);
}

#[tokio::test]
async fn handover_for_unknown_child_is_404_but_signature_is_orphaned() {
    let app = test_app();

    let response = app
        .send(post_form(
            "/handover/nope1234",
            &[("name", "Mallory"), ("signature", &signature_data_uri())],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json = body_json(response).await;
    assert_eq!(json["code"], "CHILD_NOT_FOUND");

    // The signature was written before the registration check
    let stored: Vec<_> = fs::read_dir(app.upload_path()).unwrap().collect();
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn malformed_signature_is_rejected_as_400() {
    let app = test_app();
    let child_id = register_guardians(&app, &[("Alice", "010-1111-1111")]).await;

    let response = app
        .send(post_form(
            &format!("/handover/{child_id}"),
            &[("name", "Alice"), ("signature", "no comma here")],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = body_json(response).await;
    assert_eq!(json["code"], "INVALID_SIGNATURE");
}

#[tokio::test]
async fn handover_form_is_strict_about_unknown_children() {
    let app = test_app();

    let response = app.send(get("/handover/nope1234")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let child_id = register_guardians(&app, &[("Alice", "010-1111-1111")]).await;
    let response = app.send(get(&format!("/handover/{child_id}"))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["guardians"][0]["name"], "Alice");
}

// ========== PDF export ==========

#[tokio::test]
async fn export_contains_header_and_guardian_text() {
    let app = test_app();
    let child_id = register_guardians(&app, &[("Alice", "010-1111-1111")]).await;

    app.send(post_form(
        &format!("/handover/{child_id}"),
        &[("name", "Alice"), ("signature", &signature_data_uri())],
    ))
    .await;

    let response = app.send(get(&format!("/export_pdf/{child_id}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/pdf"
    );
    let disposition = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains(&format!("handover_{child_id}.pdf")));

    let pdf = body_bytes(response).await;
    assert!(pdf.starts_with(b"%PDF"));

    let font = TrueTypeFont::load(&font_path()).unwrap();
    let content = page_content_upper(&pdf);
    assert!(content.contains(&glyph_hex(
        &font,
        &format!("Handover Record - Child ID: {child_id}")
    )));
    assert!(content.contains(&glyph_hex(&font, "Guardian: Alice")));
    // The stored signature image is actually placed
    assert!(content.contains("/IM0"));
}

#[tokio::test]
async fn export_for_unknown_child_is_header_only() {
    let app = test_app();

    let response = app.send(get("/export_pdf/nope1234")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let pdf = body_bytes(response).await;
    let font = TrueTypeFont::load(&font_path()).unwrap();
    let content = page_content_upper(&pdf);
    assert!(content.contains(&glyph_hex(&font, "Handover Record - Child ID: nope1234")));
    assert!(!content.contains(&glyph_hex(&font, "Guardian:")));
}

// ========== Health ==========

#[tokio::test]
async fn health_reports_registered_counts() {
    let app = test_app();

    let json = body_json(app.send(get("/health")).await).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["children"], 0);

    register_guardians(&app, &[("Alice", "010-1111-1111")]).await;

    let json = body_json(app.send(get("/health")).await).await;
    assert_eq!(json["children"], 1);
}
