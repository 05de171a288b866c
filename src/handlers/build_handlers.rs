//! HTTP handlers for build upload, listing and download.
//! Upload bodies are spooled to an anonymous temp file before being handed
//! to the repository, so the stored `file_size` is the measured length.

use crate::{
    errors::AppError,
    models::build::{BuildRecord, Platform},
    services::repository::{ByteStream, SharedRepository},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::Utc;
use std::io::SeekFrom;
use tokio::{
    fs::File,
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// `GET /api/apps`: newest build of every app.
pub async fn list_apps(
    State(repo): State<SharedRepository>,
) -> Result<Json<Vec<BuildRecord>>, AppError> {
    Ok(Json(repo.list_latest_per_app().await?))
}

/// `GET /api/apps/{bundle_id}`: newest build of one app.
pub async fn latest_version(
    State(repo): State<SharedRepository>,
    Path(bundle_id): Path<String>,
) -> Result<Json<BuildRecord>, AppError> {
    Ok(Json(repo.latest_version(&bundle_id).await?))
}

/// `GET /api/apps/{bundle_id}/versions`: every build, newest first.
pub async fn list_versions(
    State(repo): State<SharedRepository>,
    Path(bundle_id): Path<String>,
) -> Result<Json<Vec<BuildRecord>>, AppError> {
    Ok(Json(repo.list_versions(&bundle_id).await?))
}

/// `GET /api/apps/{bundle_id}/versions/{version}/{build_number}`
pub async fn get_build(
    State(repo): State<SharedRepository>,
    Path((bundle_id, version, build_number)): Path<(String, String, String)>,
) -> Result<Json<BuildRecord>, AppError> {
    Ok(Json(
        repo.get_build(&bundle_id, &version, &build_number).await?,
    ))
}

/// `GET /api/apps/{bundle_id}/builds/{upload_id}/download`: stream the binary.
pub async fn download_build(
    State(repo): State<SharedRepository>,
    Path((bundle_id, upload_id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let build = repo.get_upload(&bundle_id, &upload_id).await?;
    let file = repo.open_binary(&build).await?;
    let length = file.metadata().await?.len();

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(build.platform.content_type()),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    let disposition = format!(
        "attachment; filename=\"{}\"",
        build.platform.binary_file_name()
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

/// Upload form contents gathered from the multipart stream.
#[derive(Default)]
struct UploadForm {
    file: Option<(File, Platform, i64)>,
    bundle_id: Option<String>,
    version: Option<String>,
    build_number: Option<String>,
    title: Option<String>,
    icon: Option<String>,
    description: Option<String>,
}

/// Copy one multipart field into an anonymous temp file, rewound for reading.
async fn spool_field(field: &mut axum::extract::multipart::Field<'_>) -> Result<(File, i64), AppError> {
    let spool = tokio::task::spawn_blocking(tempfile::tempfile)
        .await
        .map_err(|err| AppError::internal(format!("failed to create spool file: {err}")))??;
    let mut file = File::from_std(spool);
    let mut size: i64 = 0;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| AppError::bad_request(format!("failed to read app_file: {err}")))?
    {
        size += chunk.len() as i64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.seek(SeekFrom::Start(0)).await?;
    Ok((file, size))
}

/// `POST /api/apps/upload`: multipart upload of an `.apk` or `.ipa`.
///
/// Fields: `app_file` (required), `bundle_id`, `version`, `build_number`,
/// `title` (required), `icon`, `description` (optional).
pub async fn upload_build(
    State(repo): State<SharedRepository>,
    mut multipart: Multipart,
) -> Result<Json<BuildRecord>, AppError> {
    let mut form = UploadForm::default();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("failed to parse multipart form: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "app_file" {
            let file_name = field.file_name().unwrap_or_default().to_string();
            let platform = Platform::from_file_name(&file_name).ok_or_else(|| {
                AppError::bad_request(
                    "Invalid file type. Only .apk and .ipa files are supported",
                )
            })?;
            let (file, size) = spool_field(&mut field).await?;
            form.file = Some((file, platform, size));
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|err| AppError::bad_request(format!("failed to read field {name}: {err}")))?;
        let value = Some(value.trim().to_string()).filter(|v| !v.is_empty());
        match name.as_str() {
            "bundle_id" => form.bundle_id = value,
            "version" => form.version = value,
            "build_number" => form.build_number = value,
            "title" => form.title = value,
            "icon" => form.icon = value,
            "description" => form.description = value,
            other => tracing::debug!(field = other, "ignoring unknown upload field"),
        }
    }

    let Some((file, platform, file_size)) = form.file else {
        return Err(AppError::bad_request("Failed to get app file from form"));
    };
    let (Some(bundle_id), Some(version), Some(build_number), Some(title)) =
        (form.bundle_id, form.version, form.build_number, form.title)
    else {
        return Err(AppError::bad_request(
            "Missing required metadata for upload (bundle_id, version, build_number, title)",
        ));
    };

    let record = BuildRecord {
        upload_id: Uuid::new_v4().to_string(),
        bundle_id,
        version,
        build_number,
        title,
        icon: form.icon,
        description: form.description,
        file_size,
        created_at: Utc::now(),
        platform,
    };

    let binary: ByteStream = Box::pin(ReaderStream::new(file));
    repo.save_upload(&record, binary).await?;

    tracing::info!(
        bundle_id = %record.bundle_id,
        upload_id = %record.upload_id,
        file_size = record.file_size,
        "accepted upload"
    );
    Ok(Json(record))
}

#[cfg(test)]
mod tests {
    use crate::{
        routes::routes::routes,
        services::{fs_repository::FileBuildRepository, repository::SharedRepository},
    };
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode, header},
    };
    use serde_json::Value;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "build-boundary";

    async fn app() -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        let repo: SharedRepository = Arc::new(FileBuildRepository::new(dir.path()).await.unwrap());
        (dir, routes(1024 * 1024).with_state(repo))
    }

    fn multipart_body(file_name: &str, contents: &[u8], fields: &[(&str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"app_file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(contents);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    async fn upload(router: &Router, body: Vec<u8>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/api/apps/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();
        send(router, request).await
    }

    async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        send(router, request).await
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn ios_fields<'a>(build_number: &'a str) -> Vec<(&'a str, &'a str)> {
        vec![
            ("bundle_id", "com.example.app"),
            ("version", "1.2.0"),
            ("build_number", build_number),
            ("title", "Example"),
            ("description", "nightly"),
        ]
    }

    #[tokio::test]
    async fn test_empty_store_lists_no_apps() {
        let (_dir, router) = app().await;
        let (status, json) = get(&router, "/api/apps").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_upload_then_query_and_download() {
        let (_dir, router) = app().await;

        let (status, first) =
            upload(&router, multipart_body("App.ipa", b"ipa-one", &ios_fields("7"))).await;
        assert_eq!(status, StatusCode::OK, "{first}");
        assert_eq!(first["platform"], "ios");
        assert_eq!(first["file_size"], 7);
        assert_eq!(first["description"], "nightly");

        let (status, second) =
            upload(&router, multipart_body("App.ipa", b"ipa-two!", &ios_fields("8"))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, latest) = get(&router, "/api/apps/com.example.app").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(latest["upload_id"], second["upload_id"]);

        let (_, versions) = get(&router, "/api/apps/com.example.app/versions").await;
        let versions = versions.as_array().unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1]["upload_id"], first["upload_id"]);

        let (status, build) = get(&router, "/api/apps/com.example.app/versions/1.2.0/7").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(build["upload_id"], first["upload_id"]);

        let (_, apps) = get(&router, "/api/apps").await;
        assert_eq!(apps.as_array().unwrap().len(), 1);

        let uri = format!(
            "/api/apps/com.example.app/builds/{}/download",
            first["upload_id"].as_str().unwrap()
        );
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"app.ipa\""
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"ipa-one");
    }

    #[tokio::test]
    async fn test_unknown_app_is_404() {
        let (_dir, router) = app().await;
        let (status, json) = get(&router, "/api/apps/com.example.missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["status"], 404);

        let (status, _) = get(&router, "/api/apps/com.example.missing/versions").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rejects_unsupported_file_type() {
        let (_dir, router) = app().await;
        let (status, json) =
            upload(&router, multipart_body("notes.zip", b"zip", &ios_fields("1"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains(".apk"));
    }

    #[tokio::test]
    async fn test_rejects_missing_metadata() {
        let (_dir, router) = app().await;
        let (status, _) = upload(
            &router,
            multipart_body("app.apk", b"apk", &[("bundle_id", "com.example.app")]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rejects_path_like_bundle_id() {
        let (_dir, router) = app().await;
        let fields = [
            ("bundle_id", "_indexes"),
            ("version", "1"),
            ("build_number", "1"),
            ("title", "x"),
        ];
        let (status, _) = upload(&router, multipart_body("app.apk", b"apk", &fields)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let (_dir, router) = app().await;
        let (status, json) = get(&router, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");

        let (status, json) = get(&router, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }
}
