//! HTTP server assembly and the operator/admin endpoints (device approval,
//! reading interval, firmware upload).

use actix_web::{
    get,
    http::header,
    middleware::Logger,
    post, put,
    web::{self, Data},
    App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use common::Version;
use log::info;
use subtle::ConstantTimeEq;

use crate::{
    api,
    db::Db,
    error::ApiError,
    limiter::RateLimiter,
    settings::{Settings, MAX_READING_INTERVAL, MIN_READING_INTERVAL},
    utils::unix_time,
};

const MAX_JSON_SIZE: usize = 64 * 1024;
const MAX_FIRMWARE_SIZE: usize = 8 * 1024 * 1024;

pub struct AppState {
    pub db: Db,
    pub limiter: RateLimiter,
    pub settings: Settings,
}

impl AppState {
    pub fn new(db: Db, settings: Settings) -> Self {
        Self {
            db,
            limiter: RateLimiter::new(settings.rate_limit_capacity, settings.rate_limit_refill),
            settings,
        }
    }
}

#[get("/")]
async fn hello() -> impl Responder {
    HttpResponse::Ok().body("backend")
}

/// Admin requests carry `Authorization: Bearer <ADMIN_TOKEN>`; without a
/// configured token every admin request is refused.
fn authorize(req: &HttpRequest, settings: &Settings) -> Result<(), ApiError> {
    let Some(expected) = settings.admin_token.as_deref() else {
        return Err(ApiError::Auth);
    };
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();

    if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ApiError::Auth)
    }
}

#[get("/admin/devices")]
async fn admin_devices(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, ApiError> {
    authorize(&req, &state.settings)?;
    let db = state.db.clone();
    let devices = web::block(move || db.devices()).await??;
    Ok(web::Json(devices))
}

#[get("/admin/devices/{device_id}/updates")]
async fn admin_device_updates(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<impl Responder, ApiError> {
    authorize(&req, &state.settings)?;
    let device_id = path.into_inner();
    let db = state.db.clone();
    let updates = web::block(move || db.updates(&device_id)).await??;
    Ok(web::Json(updates))
}

#[post("/admin/devices/{device_id}/approve")]
async fn admin_approve(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<impl Responder, ApiError> {
    authorize(&req, &state.settings)?;
    let device_id = path.into_inner();
    let db = state.db.clone();
    let id = device_id.clone();
    if !web::block(move || db.approve_device(&id)).await?? {
        return Err(ApiError::NotFound(format!("device {device_id}")));
    }

    info!("Device approved: {device_id}");
    Ok(HttpResponse::Ok().finish())
}

#[derive(serde::Deserialize, Debug)]
struct SetIntervalParams {
    reading_interval: i32, // s
}

#[put("/admin/devices/{device_id}/interval")]
async fn admin_set_interval(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<SetIntervalParams>,
    state: web::Data<AppState>,
) -> Result<impl Responder, ApiError> {
    authorize(&req, &state.settings)?;
    let interval = body.reading_interval;
    if !(MIN_READING_INTERVAL..=MAX_READING_INTERVAL).contains(&interval) {
        return Err(ApiError::validation(format!(
            "reading_interval must be within {MIN_READING_INTERVAL}..={MAX_READING_INTERVAL} s"
        )));
    }

    let device_id = path.into_inner();
    let db = state.db.clone();
    let id = device_id.clone();
    if !web::block(move || db.set_reading_interval(&id, interval)).await?? {
        return Err(ApiError::NotFound(format!("device {device_id}")));
    }

    info!("Reading interval of {device_id} set to {interval} s");
    Ok(HttpResponse::Ok().finish())
}

#[post("/admin/firmware/{version}")]
async fn admin_upload_firmware(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, ApiError> {
    authorize(&req, &state.settings)?;
    let version = path.into_inner();
    if version.parse::<Version>().is_err() {
        return Err(ApiError::validation(format!("'{version}' is not a semantic version")));
    }
    if body.is_empty() {
        return Err(ApiError::validation("empty firmware image"));
    }

    let db = state.db.clone();
    let v = version.clone();
    let release = web::block(move || db.insert_release(&v, &body, unix_time())).await??;
    let Some(release) = release else {
        return Err(ApiError::Conflict(format!("firmware {version} already exists")));
    };

    info!(
        "Firmware {} uploaded ({} bytes, sha256 {})",
        release.version, release.size, release.checksum
    );
    Ok(web::Json(release))
}

#[derive(serde::Deserialize, Debug)]
struct SetActiveParams {
    active: bool,
}

#[post("/admin/firmware/{version}/active")]
async fn admin_set_firmware_active(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<SetActiveParams>,
    state: web::Data<AppState>,
) -> Result<impl Responder, ApiError> {
    authorize(&req, &state.settings)?;
    let version = path.into_inner();
    let active = body.active;
    let db = state.db.clone();
    let v = version.clone();
    if !web::block(move || db.set_release_active(&v, active)).await?? {
        return Err(ApiError::NotFound(format!("firmware {version}")));
    }

    info!("Firmware {version} active={active}");
    Ok(HttpResponse::Ok().finish())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .limit(MAX_JSON_SIZE)
            .error_handler(|err, _req| ApiError::validation(err.to_string()).into()),
    )
    .app_data(
        web::QueryConfig::default()
            .error_handler(|err, _req| ApiError::validation(err.to_string()).into()),
    )
    .app_data(web::PayloadConfig::new(MAX_FIRMWARE_SIZE))
    .service(hello)
    .configure(api::configure)
    .service(admin_devices)
    .service(admin_device_updates)
    .service(admin_approve)
    .service(admin_set_interval)
    .service(admin_upload_firmware)
    .service(admin_set_firmware_active);
}

pub async fn new_http_server(state: Data<AppState>) -> std::io::Result<()> {
    let bind_addr = state.settings.bind_addr;
    info!("Listening on {bind_addr}");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(Logger::default())
            .configure(configure)
    })
    .bind(bind_addr)?
    .run()
    .await
}
