use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::BytesRejection,
        DefaultBodyLimit, Extension, Multipart,
    },
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    routing::{get, post, MethodRouter},
    Router,
};
use callback_proto::{decode, ResponseToAgent, Sha256Digest, UploadMetadata};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::{
    config::HttpConfig,
    error::{CallbackError, CallbackResult, InPhase, Rejection, RequestPhase},
    intake::{FileIntake, PersistedUpload},
    unix_now, CallbackServer,
};

/// Headroom for multipart framing and the metadata part on top of the file.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
struct HttpState {
    inner: Arc<HttpStateInner>,
}

struct HttpStateInner {
    server: Arc<CallbackServer>,
    banner: String,
}

impl HttpState {
    fn new(server: Arc<CallbackServer>) -> Self {
        let banner = callback_build_info::formatted_banner(
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        );
        Self {
            inner: Arc::new(HttpStateInner { server, banner }),
        }
    }

    fn server(&self) -> &CallbackServer {
        &self.inner.server
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Register,
    ProcessEvent,
    CatalogFileEvent,
    Heartbeat,
    UploadFile,
    GetUpdate,
}

/// Every agent endpoint with the path older agents still call it by.
const AGENT_ROUTES: [(&str, &str, Endpoint); 6] = [
    ("/register", "/api/v1/Register", Endpoint::Register),
    ("/processEvent", "/api/v1/ProcessEvent", Endpoint::ProcessEvent),
    (
        "/catalogFileEvent",
        "/api/v1/CatalogFileEvent",
        Endpoint::CatalogFileEvent,
    ),
    ("/heartbeat", "/api/v1/Heartbeat", Endpoint::Heartbeat),
    ("/uploadFile", "/api/v1/UploadFile", Endpoint::UploadFile),
    ("/getUpdate", "/api/v1/GetUpdate", Endpoint::GetUpdate),
];

fn handler(endpoint: Endpoint, max_upload_bytes: usize) -> MethodRouter {
    match endpoint {
        Endpoint::Register => post(register),
        Endpoint::ProcessEvent => post(process_event),
        Endpoint::CatalogFileEvent => post(catalog_file_event),
        Endpoint::Heartbeat => post(heartbeat),
        Endpoint::UploadFile => post(upload_file).layer(DefaultBodyLimit::max(
            max_upload_bytes.saturating_add(MULTIPART_OVERHEAD),
        )),
        Endpoint::GetUpdate => post(get_update),
    }
}

pub fn router(server: Arc<CallbackServer>) -> Router {
    let max_upload_bytes =
        usize::try_from(server.intake().settings().max_bytes).unwrap_or(usize::MAX);

    let mut router = Router::new().route("/", get(health));
    for (path, legacy, endpoint) in AGENT_ROUTES {
        router = router
            .route(path, handler(endpoint, max_upload_bytes))
            .route(legacy, handler(endpoint, max_upload_bytes));
    }

    router
        .layer(Extension(HttpState::new(server)))
        .layer(TraceLayer::new_for_http())
}

/// Serves until `shutdown` resolves, then drains in-flight requests.
pub async fn run_http(
    server: Arc<CallbackServer>,
    config: HttpConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let HttpConfig { host, port } = config;

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid bind address {host}:{port}"))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind callback server to {addr}"))?;

    tracing::info!("callback server listening on {addr}");

    axum::serve(listener, router(server).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server encountered an unrecoverable error")?;

    Ok(())
}

async fn health(Extension(state): Extension<HttpState>) -> String {
    state.inner.banner.clone()
}

fn command_response(body: String) -> Response {
    ([(CONTENT_TYPE, "application/json")], body).into_response()
}

fn request_body(body: Result<Bytes, BytesRejection>) -> Result<Bytes, Rejection> {
    body.map_err(|err| CallbackError::malformed(err.body_text()))
        .during(RequestPhase::Decoding)
}

async fn register(
    Extension(state): Extension<HttpState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, Rejection> {
    let body = request_body(body)?;
    Ok(command_response(state.server().register(&body).await?))
}

async fn process_event(
    Extension(state): Extension<HttpState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, Rejection> {
    let body = request_body(body)?;
    Ok(command_response(state.server().process_event(&body).await?))
}

async fn catalog_file_event(
    Extension(state): Extension<HttpState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, Rejection> {
    let body = request_body(body)?;
    Ok(command_response(
        state.server().catalog_file_event(&body).await?,
    ))
}

async fn heartbeat(
    Extension(state): Extension<HttpState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, Rejection> {
    let body = request_body(body)?;
    Ok(command_response(state.server().heartbeat(&body).await?))
}

async fn get_update(
    Extension(state): Extension<HttpState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, Rejection> {
    let body = request_body(body)?;
    let payload = state.server().get_update(&body).await?;
    Ok(([(CONTENT_TYPE, "application/octet-stream")], payload).into_response())
}

/// `multipart/form-data` with the JSON metadata part first and then exactly
/// one file part named by its SHA-256.
async fn upload_file(
    Extension(state): Extension<HttpState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, Rejection> {
    let mut multipart = multipart
        .map_err(|err| CallbackError::malformed(err.body_text()))
        .during(RequestPhase::Decoding)?;
    let server = state.server();

    let metadata = read_metadata(&mut multipart)
        .await
        .during(RequestPhase::Decoding)?;
    let system = server
        .resolve(&metadata.identity)
        .await
        .during(RequestPhase::ResolvingIdentity)?;
    let kind = metadata.kind().during(RequestPhase::Decoding)?;

    let (claimed, upload) = receive_file(server.intake(), &mut multipart)
        .await
        .during(RequestPhase::ProcessingEvent)?;

    let now = unix_now();
    server
        .intake()
        .complete_upload(system, kind, claimed, upload, now)
        .await
        .during(RequestPhase::ProcessingEvent)?;

    let reply = server.respond(system, ResponseToAgent::Nop, now).await?;
    Ok(command_response(reply))
}

fn multipart_error(err: MultipartError) -> CallbackError {
    CallbackError::malformed(err.body_text())
}

async fn read_metadata(multipart: &mut Multipart) -> CallbackResult<UploadMetadata> {
    let field = multipart
        .next_field()
        .await
        .map_err(multipart_error)?
        .ok_or_else(|| CallbackError::malformed("upload has no metadata part"))?;
    if field.file_name().is_some() {
        return Err(CallbackError::malformed(
            "metadata part must precede the file part",
        ));
    }
    let raw = field.bytes().await.map_err(multipart_error)?;
    Ok(decode(&raw)?)
}

/// Streams the file part to scratch. Nothing is written before the declared
/// name has been validated.
async fn receive_file(
    intake: &FileIntake,
    multipart: &mut Multipart,
) -> CallbackResult<(Sha256Digest, PersistedUpload)> {
    let mut field = multipart
        .next_field()
        .await
        .map_err(multipart_error)?
        .ok_or_else(|| CallbackError::malformed("upload has no file part"))?;
    let name = field
        .file_name()
        .ok_or_else(|| CallbackError::malformed("second part is not a file"))?;
    let claimed = Sha256Digest::parse_upload_name(name)?;

    let mut scratch = intake.scratch(&claimed).await?;
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        scratch.write(&chunk).await?;
    }
    drop(field);

    if multipart
        .next_field()
        .await
        .map_err(multipart_error)?
        .is_some()
    {
        return Err(CallbackError::malformed("upload has more than one file part"));
    }

    let upload = scratch.finish().await?;
    Ok((claimed, upload))
}
