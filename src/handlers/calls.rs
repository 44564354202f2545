use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::collections::BTreeMap;

/// Live calls, oldest first, with a per-state count.
///
/// GET /api/v1/calls
pub async fn list_calls(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let calls = state.sessions.list();

    let mut status_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for call in &calls {
        *status_counts.entry(call.state.as_str()).or_default() += 1;
    }

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "total_calls": calls.len(),
        "max_calls": state.sessions.capacity(),
        "status_counts": status_counts,
        "calls": calls
    })))
}

/// One live call.
///
/// GET /api/v1/calls/{connection_id}
pub async fn get_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let connection_id = path.into_inner();
    match state.sessions.get(&connection_id) {
        Some(call) => Ok(HttpResponse::Ok().json(call)),
        None => Ok(HttpResponse::NotFound().json(json!({
            "error": {
                "type": "not_found",
                "message": format!("No live call with connection id '{}'", connection_id),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::session::CallState;
    use crate::config::AppConfig;
    use actix_web::App;
    use actix_web::test as actix_test;

    #[actix_web::test]
    async fn test_lists_registered_calls() {
        let state = AppState::new(AppConfig::default()).unwrap();
        state.sessions.register("conn-1", "batch").unwrap();
        state.sessions.register("conn-2", "batch").unwrap();
        state.sessions.update("conn-2", |call| {
            call.state = CallState::Speaking;
            call.call_sid = Some("CA2".to_string());
        });

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/calls", web::get().to(list_calls)),
        )
        .await;
        let req = actix_test::TestRequest::get().uri("/calls").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["total_calls"], 2);
        assert_eq!(body["max_calls"], 50);
        assert_eq!(body["status_counts"]["idle"], 1);
        assert_eq!(body["status_counts"]["speaking"], 1);
        let speaking = body["calls"]
            .as_array()
            .unwrap()
            .iter()
            .find(|call| call["connection_id"] == "conn-2")
            .unwrap();
        assert_eq!(speaking["call_sid"], "CA2");
        assert_eq!(speaking["state"], "speaking");
    }

    #[actix_web::test]
    async fn test_unknown_call_is_not_found() {
        let state = AppState::new(AppConfig::default()).unwrap();
        state.sessions.register("conn-1", "streaming").unwrap();
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/calls/{connection_id}", web::get().to(get_call)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/calls/conn-1").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["stt_mode"], "streaming");

        let req = actix_test::TestRequest::get().uri("/calls/nope").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
    }
}
