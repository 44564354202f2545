use crate::config::{AppConfig, SttMode};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;

/// How close the gateway is to refusing new calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CallLoad {
    Normal,
    Moderate,
    High,
    Full,
}

#[derive(Debug, Serialize)]
struct LoadReport {
    level: CallLoad,
    active_calls: usize,
    max_calls: usize,
    usage_percent: f64,
}

impl LoadReport {
    fn new(active_calls: usize, max_calls: usize) -> Self {
        let usage = if max_calls > 0 {
            active_calls as f64 / max_calls as f64
        } else {
            0.0
        };
        let level = if max_calls > 0 && active_calls >= max_calls {
            CallLoad::Full
        } else if usage > 0.9 {
            CallLoad::High
        } else if usage > 0.7 {
            CallLoad::Moderate
        } else {
            CallLoad::Normal
        };

        Self {
            level,
            active_calls,
            max_calls,
            usage_percent: (usage * 100.0).round(),
        }
    }
}

/// Resident and virtual size of this process, read from procfs.
#[derive(Debug, Default, Serialize)]
struct ProcessMemory {
    resident_bytes: u64,
    virtual_bytes: u64,
    available: bool,
}

impl ProcessMemory {
    fn read() -> Self {
        match std::fs::read_to_string("/proc/self/status") {
            Ok(status) => Self::parse(&status),
            Err(_) => Self::default(),
        }
    }

    fn parse(status: &str) -> Self {
        let kib = |key: &str| {
            status
                .lines()
                .find_map(|line| line.strip_prefix(key))
                .and_then(|rest| rest.split_whitespace().next())
                .and_then(|n| n.parse::<u64>().ok())
                .map(|n| n * 1024)
        };

        match (kib("VmRSS:"), kib("VmSize:")) {
            (Some(resident_bytes), Some(virtual_bytes)) => Self {
                resident_bytes,
                virtual_bytes,
                available: true,
            },
            _ => Self::default(),
        }
    }
}

/// Only the backends the configured STT mode actually talks to.
fn backend_summary(config: &AppConfig) -> serde_json::Value {
    let stt_url = match config.backends.stt_mode {
        SttMode::Batch => &config.backends.whisper_url,
        SttMode::Streaming => &config.backends.streaming_stt_url,
    };

    json!({
        "stt": { "mode": config.backends.stt_mode, "url": stt_url },
        "dialogue": { "url": config.backends.dialogue_url },
        "tts": { "url": config.backends.tts_url }
    })
}

/// Liveness plus whether new calls would be admitted.
///
/// Always answers 200; `status` reads `at_capacity` once the call registry is
/// full so a load balancer can route new calls elsewhere.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let load = LoadReport::new(
        state.sessions.active_session_count(),
        state.sessions.capacity(),
    );
    let status = if load.level == CallLoad::Full {
        "at_capacity"
    } else {
        "healthy"
    };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "listen": format!("{}:{}", config.server.host, config.server.port)
        },
        "load": load,
        "backends": backend_summary(&config),
        "memory": ProcessMemory::read()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoints: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms()
            })
        })
        .collect();
    endpoints.sort_by(|a, b| b["request_count"].as_u64().cmp(&a["request_count"].as_u64()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "http": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            },
            "endpoints": endpoints
        },
        "calls": state.call_metrics.snapshot(),
        "load": LoadReport::new(
            state.sessions.active_session_count(),
            state.sessions.capacity(),
        ),
        "memory": ProcessMemory::read()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::App;
    use actix_web::test as actix_test;

    #[test]
    fn test_load_levels() {
        assert_eq!(LoadReport::new(1, 50).level, CallLoad::Normal);
        assert_eq!(LoadReport::new(40, 50).level, CallLoad::Moderate);
        assert_eq!(LoadReport::new(46, 50).level, CallLoad::High);
        assert_eq!(LoadReport::new(50, 50).level, CallLoad::Full);
        assert_eq!(LoadReport::new(0, 0).level, CallLoad::Normal);
    }

    #[test]
    fn test_parses_procfs_status() {
        let status = "Name:\tvoice-gateway\nVmSize:\t  2048 kB\nVmRSS:\t   512 kB\n";
        let memory = ProcessMemory::parse(status);
        assert!(memory.available);
        assert_eq!(memory.resident_bytes, 512 * 1024);
        assert_eq!(memory.virtual_bytes, 2048 * 1024);

        assert!(!ProcessMemory::parse("Name:\tx\n").available);
    }

    #[actix_web::test]
    async fn test_health_reports_capacity() {
        let state = AppState::new(AppConfig::default()).unwrap();
        state.sessions.set_capacity(1);
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["backends"]["stt"]["mode"], "batch");

        state.sessions.register("conn-1", "batch").unwrap();
        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "at_capacity");
        assert_eq!(body["load"]["level"], "full");
    }

    #[actix_web::test]
    async fn test_metrics_include_call_counters() {
        let state = AppState::new(AppConfig::default()).unwrap();
        state.call_metrics.call_started();
        state.sessions.register("conn-1", "batch").unwrap();

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;
        let req = actix_test::TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["calls"]["calls_started"], 1);
        assert_eq!(body["calls"]["active_calls"], 1);
        assert_eq!(body["load"]["active_calls"], 1);
    }
}
