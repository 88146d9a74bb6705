use crate::config::AppConfig;
use axum::{
    extract::{
        multipart::MultipartError, rejection::JsonRejection, DefaultBodyLimit, Multipart, Path,
        State,
    },
    http::{header::CONTENT_LENGTH, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use da_core::{AnswerSubmission, DocumentId, UploadedDocument};
use da_error::{DaError, ErrorMetadataBuilder};
use da_llm::api_key_looks_valid;
use da_pipeline::{
    AnswerOutcome, ChallengeOutcome, DocumentAssistant, DocumentOverview, EvaluationOutcome,
    SummaryOutcome, UploadOutcome,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

/// 请求体上限在文件上限之外额外预留给 multipart 包装
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub assistant: Arc<DocumentAssistant>,
    pub env: Arc<EnvStatus>,
}

/// /health/env 的内容，不包含 key 本身
#[derive(Debug, Clone, Serialize)]
pub struct EnvStatus {
    pub environment: String,
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    pub api_key_configured: bool,
    pub api_key_format_valid: bool,
}

impl EnvStatus {
    pub fn inspect(cfg: &AppConfig, api_key: Option<&str>) -> Self {
        let key = api_key.map(str::trim).filter(|k| !k.is_empty());
        let prefix = cfg.api_key_prefix();
        Self {
            environment: cfg.environment.clone(),
            provider: cfg.chat_provider.kind.clone(),
            model: cfg.chat_provider.model.clone(),
            api_key_env: cfg.api_key_env(),
            api_key_configured: key.is_some(),
            api_key_format_valid: key
                .map(|k| api_key_looks_valid(k, prefix.as_deref()))
                .unwrap_or(false),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = usize::try_from(state.assistant.limits().max_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/upload", post(upload))
        .route("/upload/", post(upload))
        .route("/summarize", post(summarize))
        .route("/ask", post(ask))
        .route("/challenge", post(challenge))
        .route("/evaluate", post(evaluate))
        .route("/evaluate/", post(evaluate))
        .route("/doc/:id", get(document))
        .route("/health", get(health))
        .route("/health/llm", get(health_llm))
        .route("/health/openai", get(health_llm))
        .route("/health/env", get(health_env))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

// ========== Request bodies ==========

#[derive(Debug, Deserialize)]
pub struct DocumentReq {
    pub document_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AskReq {
    pub document_id: String,
    #[serde(default)]
    pub question: String,
}

#[derive(Debug, Deserialize)]
pub struct EvaluateReq {
    pub document_id: String,
    #[serde(default)]
    pub responses: Vec<AnswerSubmission>,
}

// ========== Handlers ==========

async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadOutcome>, DaError> {
    let limit = state.assistant.limits().max_bytes;
    let mut file: Option<UploadedDocument> = None;
    let mut replace: Option<DocumentId> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| report("upload", None, multipart_error(e, &headers, limit)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("document_id") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| report("upload", None, multipart_error(e, &headers, limit)))?;
                if !raw.trim().is_empty() {
                    replace = Some(parse_id("upload", &raw)?);
                }
            }
            Some("file") => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| "upload.bin".into());
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| report("upload", None, multipart_error(e, &headers, limit)))?;
                file = Some(UploadedDocument::new(file_name, content_type, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let document = file.ok_or_else(|| {
        report(
            "upload",
            None,
            DaError::Validation {
                message: "missing multipart field 'file'".to_string(),
            },
        )
    })?;
    let replace_label = replace.map(|id| id.to_string());
    state
        .assistant
        .upload(document, replace)
        .await
        .map(Json)
        .map_err(|e| report("upload", replace_label.as_deref(), e))
}

async fn summarize(
    State(state): State<AppState>,
    payload: Result<Json<DocumentReq>, JsonRejection>,
) -> Result<Json<SummaryOutcome>, DaError> {
    let Json(req) = payload.map_err(|e| report("summarize", None, bad_json(e)))?;
    let id = parse_id("summarize", &req.document_id)?;
    state
        .assistant
        .summarize(id)
        .await
        .map(Json)
        .map_err(|e| report("summarize", Some(&req.document_id), e))
}

async fn ask(
    State(state): State<AppState>,
    payload: Result<Json<AskReq>, JsonRejection>,
) -> Result<Json<AnswerOutcome>, DaError> {
    let Json(req) = payload.map_err(|e| report("ask", None, bad_json(e)))?;
    let id = parse_id("ask", &req.document_id)?;
    state
        .assistant
        .ask(id, &req.question)
        .await
        .map(Json)
        .map_err(|e| report("ask", Some(&req.document_id), e))
}

async fn challenge(
    State(state): State<AppState>,
    payload: Result<Json<DocumentReq>, JsonRejection>,
) -> Result<Json<ChallengeOutcome>, DaError> {
    let Json(req) = payload.map_err(|e| report("challenge", None, bad_json(e)))?;
    let id = parse_id("challenge", &req.document_id)?;
    state
        .assistant
        .challenge(id)
        .await
        .map(Json)
        .map_err(|e| report("challenge", Some(&req.document_id), e))
}

async fn evaluate(
    State(state): State<AppState>,
    payload: Result<Json<EvaluateReq>, JsonRejection>,
) -> Result<Json<EvaluationOutcome>, DaError> {
    let Json(req) = payload.map_err(|e| report("evaluate", None, bad_json(e)))?;
    let id = parse_id("evaluate", &req.document_id)?;
    state
        .assistant
        .evaluate(id, req.responses)
        .await
        .map(Json)
        .map_err(|e| report("evaluate", Some(&req.document_id), e))
}

async fn document(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<DocumentOverview>, DaError> {
    let id = parse_id("document", &raw)?;
    state
        .assistant
        .document(id)
        .await
        .map(Json)
        .map_err(|e| report("document", Some(&raw), e))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": "document-assistant" }))
}

async fn health_llm(State(state): State<AppState>) -> Result<Json<serde_json::Value>, DaError> {
    state
        .assistant
        .health()
        .await
        .map_err(|e| report("health_llm", None, e))?;
    Ok(Json(json!({
        "status": "ok",
        "provider": state.assistant.provider(),
    })))
}

async fn health_env(State(state): State<AppState>) -> Json<EnvStatus> {
    Json(state.env.as_ref().clone())
}

// ========== Helpers ==========

/// 在 HTTP 边界统一记录一次错误
fn report(operation: &str, document_id: Option<&str>, err: DaError) -> DaError {
    let mut builder = ErrorMetadataBuilder::new("api").operation(operation);
    if let Some(id) = document_id {
        builder = builder.document_id(id);
    }
    err.log(&builder.build(&err));
    err
}

fn parse_id(operation: &str, raw: &str) -> Result<DocumentId, DaError> {
    Uuid::parse_str(raw.trim()).map_err(|e| report(operation, Some(raw), e.into()))
}

fn bad_json(rejection: JsonRejection) -> DaError {
    DaError::Validation {
        message: rejection.body_text(),
    }
}

fn multipart_error(err: MultipartError, headers: &HeaderMap, limit: u64) -> DaError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(limit.saturating_add(1));
        return DaError::DocumentTooLarge { size, limit };
    }
    DaError::Validation {
        message: format!("malformed multipart body: {}", err.body_text()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use da_core::{LlmResponse, Mode, PromptRequest};
    use da_llm::ChatModel;
    use da_pipeline::AssistantConfig;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "da-test-boundary";

    struct FakeModel {
        rate_limited: bool,
    }

    #[async_trait]
    impl ChatModel for FakeModel {
        fn provider(&self) -> &str {
            "fake"
        }

        async fn complete(&self, prompt: &PromptRequest) -> da_error::Result<LlmResponse> {
            if self.rate_limited {
                return Err(DaError::RateLimited {
                    provider: "fake".into(),
                    message: "429".into(),
                    retry_after: Some(Duration::from_secs(7)),
                });
            }
            let text = match prompt.mode {
                Mode::Summarize => "A short document about the colour of the sky.",
                Mode::Ask => "The sky is blue.",
                Mode::Challenge => {
                    "Question 1: What color is the sky?\nA) Blue\nB) Green\nC) Red\nD) Pink\nCorrect Answer: A\n"
                }
                Mode::Evaluate => "Question 1: Correct\nFeedback: Well done.",
            };
            Ok(LlmResponse::from_text(text))
        }
    }

    fn app_with(rate_limited: bool, max_bytes: u64) -> Router {
        let mut config = AssistantConfig {
            summarize_on_upload: false,
            ..Default::default()
        };
        config.limits.max_bytes = max_bytes;
        let state = AppState {
            assistant: Arc::new(DocumentAssistant::new(
                Arc::new(FakeModel { rate_limited }),
                config,
            )),
            env: Arc::new(EnvStatus::inspect(&AppConfig::default(), None)),
        };
        router(state)
    }

    fn app() -> Router {
        app_with(false, 1024 * 1024)
    }

    fn multipart_request(file_name: &str, body: &str, document_id: Option<&str>) -> Request<Body> {
        let mut payload = String::new();
        if let Some(id) = document_id {
            payload.push_str(&format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"document_id\"\r\n\r\n{id}\r\n"
            ));
        }
        payload.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
             Content-Type: text/plain\r\n\r\n{body}\r\n--{BOUNDARY}--\r\n"
        ));
        Request::builder()
            .method("POST")
            .uri("/upload/")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(payload))
            .unwrap()
    }

    fn json_request(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn upload_sample(app: &Router) -> String {
        let resp = app
            .clone()
            .oneshot(multipart_request("sample.txt", "The sky is blue.", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = read_json(resp).await;
        body["document_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let resp = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(read_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_health_env_never_exposes_key() {
        let resp = app()
            .oneshot(Request::get("/health/env").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = read_json(resp).await;
        assert_eq!(body["api_key_configured"], false);
        assert_eq!(body["api_key_env"], "GROQ_API_KEY");

        let status = EnvStatus::inspect(&AppConfig::default(), Some("gsk_0123456789abcdefghij"));
        assert!(status.api_key_configured);
        assert!(status.api_key_format_valid);
        let rendered = serde_json::to_string(&status).unwrap();
        assert!(!rendered.contains("gsk_0123456789abcdefghij"));
    }

    #[tokio::test]
    async fn test_upload_summarize_ask() {
        let app = app();
        let id = upload_sample(&app).await;

        let resp = app
            .clone()
            .oneshot(json_request("/summarize", json!({ "document_id": id })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = read_json(resp).await;
        assert!(!body["summary"].as_str().unwrap().is_empty());

        let resp = app
            .clone()
            .oneshot(json_request(
                "/ask",
                json!({ "document_id": id, "question": "What color is the sky?" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(read_json(resp).await["answer"], "The sky is blue.");

        let resp = app
            .oneshot(Request::get(format!("/doc/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(read_json(resp).await["preview"], "The sky is blue.");
    }

    #[tokio::test]
    async fn test_empty_question_is_bad_request() {
        let app = app();
        let id = upload_sample(&app).await;
        let resp = app
            .oneshot(json_request("/ask", json!({ "document_id": id, "question": "  " })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(resp).await["kind"], "missing_question");
    }

    #[tokio::test]
    async fn test_challenge_and_evaluate() {
        let app = app();
        let id = upload_sample(&app).await;
        let resp = app
            .clone()
            .oneshot(json_request("/challenge", json!({ "document_id": id })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = read_json(resp).await;
        assert_eq!(body["questions"].as_array().unwrap().len(), 1);
        assert_eq!(body["questions"][0]["correct_index"], 0);

        let resp = app
            .oneshot(json_request(
                "/evaluate/",
                json!({
                    "document_id": id,
                    "responses": [{ "question_index": 0, "selected": 0 }]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = read_json(resp).await;
        assert_eq!(body["correct"], 1);
        assert_eq!(body["total"], 1);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let app = app();

        let resp = app
            .clone()
            .oneshot(multipart_request("slides.pptx", "data", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(read_json(resp).await["kind"], "unsupported_format");

        let resp = app
            .clone()
            .oneshot(json_request(
                "/summarize",
                json!({ "document_id": Uuid::new_v4().to_string() }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .clone()
            .oneshot(json_request("/summarize", json!({ "document_id": "not-a-uuid" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(json_request("/ask", json!({ "question": "missing id" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(resp).await["kind"], "validation");
    }

    #[tokio::test]
    async fn test_oversized_upload() {
        let resp = app_with(false, 8)
            .oneshot(multipart_request("sample.txt", "The sky is blue.", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(read_json(resp).await["kind"], "document_too_large");
    }

    #[tokio::test]
    async fn test_rate_limit_sets_retry_after() {
        let app = app_with(true, 1024 * 1024);
        let id = upload_sample(&app).await;
        let resp = app
            .oneshot(json_request("/summarize", json!({ "document_id": id })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "7");
    }

    #[tokio::test]
    async fn test_replace_via_upload_field() {
        let app = app();
        let id = upload_sample(&app).await;
        let resp = app
            .clone()
            .oneshot(multipart_request("next.txt", "Grass is green.", Some(&id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = read_json(resp).await;
        assert_eq!(body["document_id"], id.as_str());
        assert_eq!(body["file_name"], "next.txt");
    }
}
