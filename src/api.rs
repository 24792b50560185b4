//! HTTP routes over the inbox service.

use std::time::Instant;

use actix_web::http::StatusCode;
use actix_web::{delete, get, post, web, HttpResponse, Responder, ResponseError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::inbox::{Inbox, InboxError};
use crate::model::MailboxStats;

/// Shared state handed to every handler.
pub struct ApiState {
    pub inbox: Inbox,
    pub started: Instant,
}

impl ApiState {
    pub fn new(inbox: Inbox) -> Self {
        Self {
            inbox,
            started: Instant::now(),
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(domains)
        .service(generate_address)
        .service(random_address)
        .service(list_messages)
        .service(get_message)
        .service(delete_message)
        .service(mailbox_stats)
        .service(health)
        .default_service(web::to(not_found));
}

impl ResponseError for InboxError {
    fn status_code(&self) -> StatusCode {
        match self {
            InboxError::InvalidAddress(_) | InboxError::DomainNotAllowed(_) => {
                StatusCode::BAD_REQUEST
            }
            InboxError::NotFound => StatusCode::NOT_FOUND,
            InboxError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self {
            InboxError::InvalidAddress(_) => "Invalid email address".to_string(),
            InboxError::DomainNotAllowed(_) => "Invalid or unauthorized domain".to_string(),
            InboxError::NotFound => self.to_string(),
            InboxError::Storage(e) => {
                error!(error = %e, "storage failure while serving request");
                "Internal server error".to_string()
            }
        };
        HttpResponse::build(self.status_code()).json(json!({ "success": false, "error": message }))
    }
}

#[derive(Deserialize, Debug)]
pub struct GenerateReq {
    domain: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ListQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Serialize, Debug)]
struct StatsBody {
    total_emails: u64,
    unread_emails: u64,
    first_email: Option<DateTime<Utc>>,
    last_email: Option<DateTime<Utc>>,
}

impl From<MailboxStats> for StatsBody {
    fn from(stats: MailboxStats) -> Self {
        Self {
            total_emails: stats.total,
            unread_emails: stats.unread,
            first_email: stats.first_received_at,
            last_email: stats.last_received_at,
        }
    }
}

#[get("/api/domains")]
async fn domains(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(json!({ "success": true, "domains": state.inbox.domains() }))
}

#[post("/api/email/generate")]
async fn generate_address(
    state: web::Data<ApiState>,
    req: web::Json<GenerateReq>,
) -> Result<impl Responder, InboxError> {
    let domain = req.domain.as_deref().unwrap_or_default();
    let address = state.inbox.generate_address(domain).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "email": address.value,
        "expires_at": address.expires_at,
    })))
}

#[get("/api/email/random/{domain}")]
async fn random_address(
    state: web::Data<ApiState>,
    path: web::Path<String>,
) -> Result<impl Responder, InboxError> {
    let email = state.inbox.random_address(&path)?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "email": email })))
}

#[get("/api/emails/{email}")]
async fn list_messages(
    state: web::Data<ApiState>,
    path: web::Path<String>,
    query: web::Query<ListQuery>,
) -> Result<impl Responder, InboxError> {
    let messages = state
        .inbox
        .list_messages(&path, query.limit, query.offset.unwrap_or(0))
        .await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "count": messages.len(),
        "emails": messages,
    })))
}

#[get("/api/email/{email}/{id}")]
async fn get_message(
    state: web::Data<ApiState>,
    path: web::Path<(String, String)>,
) -> Result<impl Responder, InboxError> {
    let (email, id) = path.into_inner();
    let message = state.inbox.get_message(&email, &id).await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "email": message })))
}

#[delete("/api/email/{email}/{id}")]
async fn delete_message(
    state: web::Data<ApiState>,
    path: web::Path<(String, String)>,
) -> Result<impl Responder, InboxError> {
    let (email, id) = path.into_inner();
    let deleted = state.inbox.delete_message(&email, &id).await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "deleted": deleted })))
}

#[get("/api/stats/{email}")]
async fn mailbox_stats(
    state: web::Data<ApiState>,
    path: web::Path<String>,
) -> Result<impl Responder, InboxError> {
    let stats = state.inbox.stats(&path).await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "stats": StatsBody::from(stats) })))
}

#[get("/api/health")]
async fn health(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "success": true,
        "status": "healthy",
        "timestamp": Utc::now(),
        "uptime": state.started.elapsed().as_secs_f64(),
    }))
}

async fn not_found() -> HttpResponse {
    HttpResponse::NotFound().json(json!({ "success": false, "error": "Endpoint not found" }))
}
