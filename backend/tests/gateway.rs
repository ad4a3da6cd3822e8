use actix_web::{
    http::{header, StatusCode},
    test,
    web::Data,
    App,
};
use backend::{db::Db, settings::Settings, web, AppState};
use common::req::{ErrorBody, RegisterResponse, SubmitReadingsResponse, UpdateCheckResponse};
use serde_json::json;
use tempfile::TempDir;

const ADMIN: &str = "admin-secret";

fn state(dir: &TempDir, rate_limit_capacity: u32) -> Data<AppState> {
    let url = dir.path().join("gateway.db").to_string_lossy().into_owned();
    let db = Db::connect(&url, 4).unwrap();
    let settings = Settings {
        database_url: url,
        rate_limit_capacity,
        admin_token: Some(ADMIN.into()),
        ..Settings::default()
    };
    Data::new(AppState::new(db, settings))
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data($state.clone())
                .configure(web::configure),
        )
        .await
    };
}

macro_rules! call {
    ($app:expr, $req:expr) => {
        test::call_service(&$app, $req.to_request()).await
    };
}

fn register_req(device_id: &str) -> test::TestRequest {
    test::TestRequest::post().uri("/register").set_json(json!({
        "device_id": device_id,
        "firmware_version": "1.0.0",
        "mac_address": "AA:BB:CC:DD:EE:01",
    }))
}

fn readings_req(device_id: &str, credential: &str, readings: serde_json::Value) -> test::TestRequest {
    test::TestRequest::post().uri("/readings").set_json(json!({
        "device_id": device_id,
        "credential": credential,
        "readings": readings,
    }))
}

fn two_readings() -> serde_json::Value {
    json!([
        { "sensor": "temperature", "value": 21.5, "unit": "C" },
        { "sensor": "humidity", "value": 40, "unit": "%" },
    ])
}

fn admin(req: test::TestRequest) -> test::TestRequest {
    req.insert_header((header::AUTHORIZATION, format!("Bearer {ADMIN}")))
}

#[actix_web::test]
async fn wrong_credential_is_rejected_then_correct_one_is_stored() {
    let dir = TempDir::new().unwrap();
    let state = state(&dir, 10);
    let app = app!(state);

    let resp = call!(app, register_req("esp32-01"));
    assert_eq!(resp.status(), StatusCode::OK);
    let reg: RegisterResponse = test::read_body_json(resp).await;
    assert_eq!(reg.reading_interval, 60);
    let k1 = reg.credential;
    let k2 = "0".repeat(64);

    let resp = call!(app, readings_req("esp32-01", &k2, two_readings()));
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(state.db.reading_count("esp32-01").unwrap(), 0);
    assert_eq!(state.db.device("esp32-01").unwrap().unwrap().total_readings, 0);

    state.db.approve_device("esp32-01").unwrap();

    let resp = call!(app, readings_req("esp32-01", &k1, two_readings()));
    assert_eq!(resp.status(), StatusCode::OK);
    let body: SubmitReadingsResponse = test::read_body_json(resp).await;
    assert_eq!(body.received, 2);
    assert!(body.server_time.is_some(), "first submission carries server time");
    assert_eq!(body.reading_interval, Some(60));

    let device = state.db.device("esp32-01").unwrap().unwrap();
    assert_eq!(device.total_readings, 2);
    assert_eq!(state.db.reading_count("esp32-01").unwrap(), 2);

    let resp = call!(app, readings_req("esp32-01", &k1, two_readings()));
    let body: SubmitReadingsResponse = test::read_body_json(resp).await;
    assert_eq!(body.server_time, None);
    assert_eq!(state.db.reading_count("esp32-01").unwrap(), 4);
}

#[actix_web::test]
async fn unknown_device_is_an_auth_error() {
    let dir = TempDir::new().unwrap();
    let state = state(&dir, 10);
    let app = app!(state);

    let resp = call!(app, readings_req("nobody", "whatever", two_readings()));
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn re_registering_an_approved_device_conflicts_and_keeps_credential() {
    let dir = TempDir::new().unwrap();
    let state = state(&dir, 10);
    let app = app!(state);

    let reg: RegisterResponse = test::read_body_json(call!(app, register_req("esp32-02"))).await;
    state.db.approve_device("esp32-02").unwrap();
    let hash_before = state.db.device("esp32-02").unwrap().unwrap().credential_hash;

    let resp = call!(app, register_req("esp32-02"));
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: ErrorBody = test::read_body_json(resp).await;
    assert!(!body.message.is_empty());

    assert_eq!(
        state.db.device("esp32-02").unwrap().unwrap().credential_hash,
        hash_before
    );
    let resp = call!(app, readings_req("esp32-02", &reg.credential, two_readings()));
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn re_registering_a_claimed_device_conflicts() {
    let dir = TempDir::new().unwrap();
    let state = state(&dir, 10);
    let app = app!(state);

    let reg: RegisterResponse = test::read_body_json(call!(app, register_req("esp32-03"))).await;
    // presenting the credential claims the device, even while pending
    let resp = call!(app, readings_req("esp32-03", &reg.credential, two_readings()));
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = call!(app, register_req("esp32-03"));
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[actix_web::test]
async fn lost_registration_response_can_be_retried_before_first_use() {
    let dir = TempDir::new().unwrap();
    let state = state(&dir, 10);
    let app = app!(state);

    let first: RegisterResponse = test::read_body_json(call!(app, register_req("esp32-04"))).await;
    let resp = call!(app, register_req("esp32-04"));
    assert_eq!(resp.status(), StatusCode::OK);
    let second: RegisterResponse = test::read_body_json(resp).await;
    assert_ne!(first.credential, second.credential);

    state.db.approve_device("esp32-04").unwrap();
    let resp = call!(app, readings_req("esp32-04", &first.credential, two_readings()));
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let resp = call!(app, readings_req("esp32-04", &second.credential, two_readings()));
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn pending_devices_get_an_explicit_pending_status() {
    let dir = TempDir::new().unwrap();
    let state = state(&dir, 10);
    let app = app!(state);

    let reg: RegisterResponse = test::read_body_json(call!(app, register_req("esp32-05"))).await;
    let resp = call!(app, readings_req("esp32-05", &reg.credential, two_readings()));
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: ErrorBody = test::read_body_json(resp).await;
    assert_eq!(body.status.as_deref(), Some("pending_approval"));

    let device = state.db.device("esp32-05").unwrap().unwrap();
    assert_eq!(device.total_readings, 0);
    assert!(device.last_seen.is_some());
    assert_eq!(state.db.reading_count("esp32-05").unwrap(), 0);
}

#[actix_web::test]
async fn rate_limit_refuses_requests_beyond_capacity() {
    let dir = TempDir::new().unwrap();
    let state = state(&dir, 2);
    let app = app!(state);

    let reg: RegisterResponse = test::read_body_json(call!(app, register_req("esp32-06"))).await;
    state.db.approve_device("esp32-06").unwrap();

    for _ in 0..2 {
        let resp = call!(app, readings_req("esp32-06", &reg.credential, two_readings()));
        assert_eq!(resp.status(), StatusCode::OK);
    }
    for _ in 0..3 {
        let resp = call!(app, readings_req("esp32-06", &reg.credential, two_readings()));
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = resp
            .headers()
            .get(header::RETRY_AFTER)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after >= 1);
        let body: ErrorBody = test::read_body_json(resp).await;
        assert_eq!(body.retry_after, Some(retry_after));
    }

    assert_eq!(state.db.device("esp32-06").unwrap().unwrap().total_readings, 4);
}

#[actix_web::test]
async fn invalid_elements_are_skipped_and_reported() {
    let dir = TempDir::new().unwrap();
    let state = state(&dir, 10);
    let app = app!(state);

    let reg: RegisterResponse = test::read_body_json(call!(app, register_req("esp32-07"))).await;
    state.db.approve_device("esp32-07").unwrap();

    let readings = json!([
        { "sensor": "temperature", "value": 21.5, "unit": "C" },
        { "sensor": "bad sensor!", "value": 1, "unit": "C" },
        { "sensor": "humidity", "value": 40.0, "unit": "%" },
    ]);
    let resp = call!(app, readings_req("esp32-07", &reg.credential, readings));
    assert_eq!(resp.status(), StatusCode::OK);
    let body: SubmitReadingsResponse = test::read_body_json(resp).await;
    assert_eq!(body.received, 2);
    assert_eq!(body.rejected.len(), 1);
    assert_eq!(body.rejected[0].index, 1);

    let readings = json!([{ "sensor": "temperature", "value": "warm" }]);
    let resp = call!(app, readings_req("esp32-07", &reg.credential, readings));
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(state.db.reading_count("esp32-07").unwrap(), 2);

    let resp = call!(app, readings_req("esp32-07", &reg.credential, json!([])));
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn device_timestamps_are_stored_but_not_trusted() {
    let dir = TempDir::new().unwrap();
    let state = state(&dir, 10);
    let app = app!(state);

    let reg: RegisterResponse = test::read_body_json(call!(app, register_req("esp32-08"))).await;
    state.db.approve_device("esp32-08").unwrap();
    call!(app, readings_req("esp32-08", &reg.credential, two_readings()));

    // device clock stuck in 1970
    let readings = json!([{ "sensor": "temperature", "value": 20, "unit": "C", "timestamp": 5 }]);
    let resp = call!(app, readings_req("esp32-08", &reg.credential, readings));
    let body: SubmitReadingsResponse = test::read_body_json(resp).await;
    let server_time = body.server_time.expect("skewed clock gets corrected");

    let latest = &state.db.readings("esp32-08", 1).unwrap()[0];
    assert_eq!(latest.device_timestamp, Some(5));
    assert!((latest.received_at - server_time).abs() <= 1);
}

#[actix_web::test]
async fn malformed_body_is_a_json_validation_error() {
    let dir = TempDir::new().unwrap();
    let state = state(&dir, 10);
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/readings")
        .insert_header((header::CONTENT_TYPE, "application/json"))
        .set_payload("{not json");
    let resp = call!(app, req);
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: ErrorBody = test::read_body_json(resp).await;
    assert!(!body.message.is_empty());
}

#[actix_web::test]
async fn ota_check_download_and_status_reports() {
    let dir = TempDir::new().unwrap();
    let state = state(&dir, 10);
    let app = app!(state);
    call!(app, register_req("esp32-09"));

    // nothing released yet
    let check = |version: &str, extra: &str| {
        test::TestRequest::get().uri(&format!(
            "/ota/check?device_id=esp32-09&version={version}{extra}"
        ))
    };
    let res: UpdateCheckResponse = test::read_body_json(call!(app, check("1.0.0", ""))).await;
    assert!(!res.update_available);

    let image = vec![0xA5u8; 4096];
    let resp = call!(
        app,
        admin(test::TestRequest::post().uri("/admin/firmware/1.1.0")).set_payload(image.clone())
    );
    assert_eq!(resp.status(), StatusCode::OK);

    let res: UpdateCheckResponse = test::read_body_json(call!(app, check("1.0.0", ""))).await;
    assert!(res.update_available);
    assert_eq!(res.version.as_deref(), Some("1.1.0"));
    assert_eq!(res.size, Some(4096));
    assert_eq!(res.url.as_deref(), Some("/ota/download/1.1.0"));
    let checksum = res.checksum.unwrap();
    assert_eq!(checksum.len(), 64);

    let resp = call!(
        app,
        test::TestRequest::get().uri("/ota/download/1.1.0?device_id=esp32-09")
    );
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("X-Checksum").unwrap().to_str().unwrap(),
        checksum
    );
    let body = test::read_body(resp).await;
    assert_eq!(body.as_ref(), image.as_slice());

    // device rolled back and says so; the update is still offered
    let res: UpdateCheckResponse = test::read_body_json(call!(
        app,
        check("1.0.0", "&rolled_back=true&failed_version=1.1.0")
    ))
    .await;
    assert!(res.update_available);
    let updates = state.db.updates("esp32-09").unwrap();
    assert_eq!(updates[0].status, "rolled_back");

    // second attempt succeeds
    call!(
        app,
        test::TestRequest::get().uri("/ota/download/1.1.0?device_id=esp32-09")
    );
    let res: UpdateCheckResponse = test::read_body_json(call!(app, check("1.1.0", ""))).await;
    assert!(!res.update_available);
    let updates = state.db.updates("esp32-09").unwrap();
    assert_eq!(updates[0].status, "success");
    assert_eq!(
        state.db.device("esp32-09").unwrap().unwrap().firmware_version,
        "1.1.0"
    );
    assert_eq!(state.db.release("1.1.0").unwrap().unwrap().download_count, 2);
}

#[actix_web::test]
async fn unknown_or_inactive_firmware_is_not_found() {
    let dir = TempDir::new().unwrap();
    let state = state(&dir, 10);
    let app = app!(state);

    let resp = call!(app, test::TestRequest::get().uri("/ota/download/9.9.9"));
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    state.db.insert_release("2.0.0", b"image", 1).unwrap();
    let resp = call!(
        app,
        admin(test::TestRequest::post().uri("/admin/firmware/2.0.0/active"))
            .set_json(json!({ "active": false }))
    );
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = call!(app, test::TestRequest::get().uri("/ota/download/2.0.0"));
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn ota_check_for_unknown_device_offers_nothing() {
    let dir = TempDir::new().unwrap();
    let state = state(&dir, 10);
    let app = app!(state);
    state.db.insert_release("2.0.0", b"image", 1).unwrap();

    let resp = call!(
        app,
        test::TestRequest::get().uri("/ota/check?device_id=ghost&version=1.0.0")
    );
    assert_eq!(resp.status(), StatusCode::OK);
    let res: UpdateCheckResponse = test::read_body_json(resp).await;
    assert!(!res.update_available);
}

#[actix_web::test]
async fn admin_endpoints_require_the_token() {
    let dir = TempDir::new().unwrap();
    let state = state(&dir, 10);
    let app = app!(state);
    call!(app, register_req("esp32-10"));

    let resp = call!(
        app,
        test::TestRequest::post().uri("/admin/devices/esp32-10/approve")
    );
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(!state.db.device("esp32-10").unwrap().unwrap().approved);

    for token in ["admin-secreT", "admin", "admin-secret-and-more"] {
        let resp = call!(
            app,
            test::TestRequest::post()
                .uri("/admin/devices/esp32-10/approve")
                .insert_header((header::AUTHORIZATION, format!("Bearer {token}")))
        );
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{token}");
    }
    assert!(!state.db.device("esp32-10").unwrap().unwrap().approved);

    let resp = call!(
        app,
        admin(test::TestRequest::post().uri("/admin/devices/esp32-10/approve"))
    );
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(state.db.device("esp32-10").unwrap().unwrap().approved);

    let resp = call!(
        app,
        admin(test::TestRequest::put().uri("/admin/devices/esp32-10/interval"))
            .set_json(json!({ "reading_interval": 300 }))
    );
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        state.db.device("esp32-10").unwrap().unwrap().reading_interval,
        300
    );

    let resp = call!(
        app,
        admin(test::TestRequest::post().uri("/admin/devices/ghost/approve"))
    );
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = call!(
        app,
        admin(test::TestRequest::post().uri("/admin/firmware/not-a-version")).set_payload("x")
    );
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
