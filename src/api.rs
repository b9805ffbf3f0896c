use actix_web::{delete, error, get, post, web, HttpResponse, Responder};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::assistant::TripAssistant;
use crate::context::ContextPatch;

// --- Request Bodies ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

fn bad_request(message: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(json!({ "success": false, "error": message }))
}

// --- Endpoints ---

#[post("/api/chat")]
async fn chat(req: web::Json<ChatRequest>, assistant: web::Data<TripAssistant>) -> impl Responder {
    let user_id = req.user_id.trim();
    let message = req.message.trim();
    if user_id.is_empty() || message.is_empty() {
        return bad_request("userId and message are required");
    }
    if let Some(metadata) = &req.metadata {
        log::debug!("metadata from '{}': {}", user_id, metadata);
    }
    HttpResponse::Ok().json(assistant.handle_turn(user_id, message).await)
}

#[get("/api/context/{user_id}")]
async fn get_context(path: web::Path<String>, assistant: web::Data<TripAssistant>) -> impl Responder {
    HttpResponse::Ok().json(assistant.store().get_context(&path.into_inner()))
}

#[post("/api/context/{user_id}")]
async fn update_context(
    path: web::Path<String>,
    patch: web::Json<ContextPatch>,
    assistant: web::Data<TripAssistant>,
) -> impl Responder {
    let user_id = path.into_inner();
    HttpResponse::Ok().json(assistant.store().update_context(&user_id, &patch))
}

#[delete("/api/context/{user_id}")]
async fn clear_context(path: web::Path<String>, assistant: web::Data<TripAssistant>) -> impl Responder {
    assistant.store().clear_context(&path.into_inner());
    HttpResponse::Ok().json(json!({ "success": true }))
}

#[get("/health")]
async fn health(assistant: web::Data<TripAssistant>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "activeContexts": assistant.store().len(),
    }))
}

/// Malformed JSON bodies get the same `{success, error}` shape as other 400s.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(64 * 1024)
        .error_handler(|err, _req| {
            let response = bad_request(&err.to_string());
            error::InternalError::from_response(err, response).into()
        })
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .service(chat)
        .service(get_context)
        .service(update_context)
        .service(clear_context)
        .service(health);
}
