use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};
use tokio::{net::TcpListener, task::JoinHandle};

#[derive(Clone)]
struct DummyRow {
    cctvurl: String,
    coordx: f64,
    coordy: f64,
}

/// In-process stand-in for the ITS CCTV directory API.
///
/// Serves `GET /cctvInfo` with the same response envelope as the real
/// service, including the single-row quirk where `data` is a bare object
/// instead of an array.
pub struct DummyItsServer {
    rows: Vec<DummyRow>,
    single_object_payload: bool,
    handle: Option<JoinHandle<()>>,
    endpoint: String,
}

impl Default for DummyItsServer {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyItsServer {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            single_object_payload: false,
            handle: None,
            endpoint: String::new(),
        }
    }

    pub fn with_row(mut self, cctvurl: &str, coordx: f64, coordy: f64) -> Self {
        self.rows.push(DummyRow {
            cctvurl: cctvurl.to_string(),
            coordx,
            coordy,
        });
        self
    }

    /// Emit a matching single row as a bare object rather than a one
    /// element array.
    pub fn with_single_object_payload(mut self) -> Self {
        self.single_object_payload = true;
        self
    }

    pub async fn start(mut self) -> Self {
        let state = ServerState {
            rows: self.rows.clone(),
            single_object_payload: self.single_object_payload,
        };

        let app = Router::new()
            .route("/cctvInfo", get(cctv_info_handler))
            .with_state(state);

        let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0);
        let listener = TcpListener::bind(&address)
            .await
            .expect("tcp listener should bind to a loopback port");
        let port = listener
            .local_addr()
            .expect("listener should expose its local address")
            .port();

        self.handle = Some(tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        }));
        self.endpoint = format!("http://127.0.0.1:{port}/cctvInfo");
        self
    }

    pub fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

#[derive(Clone)]
struct ServerState {
    rows: Vec<DummyRow>,
    single_object_payload: bool,
}

async fn cctv_info_handler(
    State(state): State<ServerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let parse = |key: &str, fallback: f64| {
        params
            .get(key)
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(fallback)
    };
    let min_x = parse("minX", f64::MIN);
    let max_x = parse("maxX", f64::MAX);
    let min_y = parse("minY", f64::MIN);
    let max_y = parse("maxY", f64::MAX);

    let matching: Vec<Value> = state
        .rows
        .iter()
        .filter(|row| {
            row.coordx >= min_x && row.coordx <= max_x && row.coordy >= min_y && row.coordy <= max_y
        })
        .map(|row| {
            // Coordinates are strings on the wire, as in the real service.
            json!({
                "cctvurl": row.cctvurl,
                "coordx": row.coordx.to_string(),
                "coordy": row.coordy.to_string(),
                "cctvname": "dummy",
                "cctvformat": "HLS",
                "cctvtype": "1",
            })
        })
        .collect();

    let data = match matching.as_slice() {
        [] => None,
        [only] if state.single_object_payload => Some(only.clone()),
        _ => Some(Value::Array(matching)),
    };

    let body = match data {
        Some(data) => json!({"response": {"data": data}}),
        None => json!({"response": {}}),
    };
    Json(body)
}
