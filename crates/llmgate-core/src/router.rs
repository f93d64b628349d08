//! The gateway HTTP surface (spec.md §6): OpenAI- and Gemini-compatible
//! routes over the Conductor, plus `/metrics` and `/healthz`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use llmgate_provider::{Action, UpstreamBody};
use llmgate_storage::Repository;
use serde_json::{Value, json};

use crate::conductor::{DispatchError, DispatchRequest, dispatch};
use crate::context::AppContext;

pub fn router<R: Repository + 'static>(ctx: Arc<AppContext<R>>) -> Router {
    Router::new()
        .route("/v1/{provider}/chat/completions", post(chat_completions::<R>))
        .route("/v1beta/models/{model_action}", post(gemini_generate::<R>))
        .route("/metrics", get(metrics::<R>))
        .route("/healthz", get(healthz::<R>))
        .with_state(ctx)
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response()
}

fn check_auth<R: Repository>(ctx: &AppContext<R>, headers: &HeaderMap) -> bool {
    let Some(expected) = ctx.gateway.auth_token.as_deref() else {
        return true;
    };
    let Some(header) = headers.get(axum::http::header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = header.to_str() else {
        return false;
    };
    value.strip_prefix("Bearer ") == Some(expected)
}

async fn chat_completions<R: Repository + 'static>(
    State(ctx): State<Arc<AppContext<R>>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !check_auth(&ctx, &headers) {
        return unauthorized();
    }
    let Some(model) = model_from_json_body(&body) else {
        return bad_request("missing model");
    };
    let req = DispatchRequest {
        provider,
        model,
        action: Action::ChatCompletions,
        headers: inbound_headers(&headers),
        body,
    };
    run_dispatch(&ctx, req).await
}

async fn gemini_generate<R: Repository + 'static>(
    State(ctx): State<Arc<AppContext<R>>>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !check_auth(&ctx, &headers) {
        return unauthorized();
    }
    let Some((model, action_name)) = model_action.split_once(':') else {
        return bad_request("missing :action suffix");
    };
    let action = match action_name {
        "generateContent" => Action::GenerateContent,
        "streamGenerateContent" => Action::StreamGenerateContent,
        _ => return bad_request("unsupported action"),
    };
    let req = DispatchRequest {
        provider: "gemini".to_string(),
        model: model.to_string(),
        action,
        headers: inbound_headers(&headers),
        body,
    };
    run_dispatch(&ctx, req).await
}

async fn run_dispatch<R: Repository + 'static>(ctx: &AppContext<R>, req: DispatchRequest) -> Response {
    match dispatch(ctx, req).await {
        Ok(resp) => {
            let mut builder = Response::builder().status(resp.status);
            for (name, value) in &resp.headers {
                if let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) {
                    builder = builder.header(name, value);
                }
            }
            let body = match resp.body {
                UpstreamBody::Buffered(bytes) => Body::from(bytes),
                UpstreamBody::Stream(stream) => Body::from_stream(stream),
            };
            builder.body(body).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(DispatchError::UnknownProvider) => {
            (StatusCode::NOT_FOUND, Json(json!({"error": "provider_not_found"}))).into_response()
        }
        Err(DispatchError::NoHealthyKeys) => {
            let mut response =
                (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "no_healthy_keys"}))).into_response();
            response.headers_mut().insert("retry-after", HeaderValue::from_static("30"));
            response
        }
    }
}

fn model_from_json_body(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value.get("model")?.as_str().map(str::to_string)
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

fn inbound_headers(headers: &HeaderMap) -> llmgate_provider::Headers {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect()
}

async fn metrics<R: Repository>(State(ctx): State<Arc<AppContext<R>>>) -> Response {
    let (content_type, buffer) = ctx.metrics.encode();
    ([(axum::http::header::CONTENT_TYPE, content_type)], buffer).into_response()
}

async fn healthz<R: Repository>(State(ctx): State<Arc<AppContext<R>>>) -> Response {
    match ctx.repo.ping().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
