mod api;
mod error;
mod o11y;

use clap::Parser;
use miette::{Context, IntoDiagnostic};
use roadlens_store::{
    ItsClient, JsonOutputCatalog, JsonStreamCatalog, JsonTaskRegistry, OutputCatalog,
    StreamCatalog, TaskRegistry,
};
use roadlens_tasks::{AnalysisTaskSrv, RecordTaskSrv, Supervisor, TaskService, TrackingTaskSrv};
use std::{
    fs,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;
use tracing::info;

/// Run the CCTV recording and analysis server.
///
/// Records HLS streams on scheduled windows and runs tracking and
/// perspective analysis over the recorded artifacts.
#[derive(Clone, Parser)]
#[command(author, version, about)]
pub(crate) struct Cli {
    /// Directory holding the persisted JSON state
    #[arg(long, env = "JSON_DB_STORAGE", value_name = "DIR", default_value = "./data")]
    storage_path: PathBuf,

    /// Directory holding task artifact files
    #[arg(long, env = "TASK_OUTPUT_PATH", value_name = "DIR", default_value = "./outputs")]
    outputs_path: PathBuf,

    /// API key for the ITS CCTV directory
    #[arg(long, env = "ITS_API_KEY")]
    its_api_key: String,

    /// Base URL of the ITS CCTV directory
    #[arg(long, env = "ITS_ENDPOINT", default_value = ItsClient::DEFAULT_ENDPOINT)]
    its_endpoint: Url,

    /// YOLOv8 ONNX weights used by the tracking driver
    #[arg(
        long,
        env = "TRACK_MODEL_PATH",
        value_name = "FILE",
        default_value = "./models/yolov8n.onnx"
    )]
    track_model_path: PathBuf,

    /// Port to listen on for HTTP API endpoints
    #[arg(long, env = "LISTEN_PORT", default_value = "8080")]
    listen_port: u16,

    /// Address to listen on for observability/metrics endpoints
    #[clap(long, env = "OBSERVABILITY_ADDRESS", default_value = "127.0.0.1:9090")]
    observability_address: SocketAddr,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    o11y::init(cli.observability_address)?;

    fs::create_dir_all(&cli.storage_path)
        .into_diagnostic()
        .wrap_err("Failed to create storage directory")?;
    fs::create_dir_all(&cli.outputs_path)
        .into_diagnostic()
        .wrap_err("Failed to create outputs directory")?;

    // Open the persisted state and sweep whatever a previous run left
    // unfinished.
    let registry: Arc<dyn TaskRegistry> = Arc::new(JsonTaskRegistry::open(
        &cli.storage_path.join("tasks.json"),
    ));
    let swept = registry
        .recover()
        .into_diagnostic()
        .wrap_err("Failed to recover the task registry")?;
    info!("Task registry recovered, {swept} task(s) swept to failed");

    let outputs: Arc<dyn OutputCatalog> = Arc::new(JsonOutputCatalog::open(
        &cli.storage_path.join("outputs.json"),
        &cli.outputs_path,
    ));
    let streams: Arc<dyn StreamCatalog> = Arc::new(JsonStreamCatalog::open(
        &cli.storage_path.join("streams.json"),
        ItsClient::new(cli.its_endpoint.clone(), &cli.its_api_key),
    ));

    let supervisor = Arc::new(Supervisor::new(registry.clone()));

    let record: Arc<dyn TaskService> = Arc::new(RecordTaskSrv::new(
        registry.clone(),
        outputs.clone(),
        streams.clone(),
        supervisor.clone(),
    ));
    let tracking: Arc<dyn TaskService> = Arc::new(TrackingTaskSrv::new(
        registry.clone(),
        outputs.clone(),
        supervisor.clone(),
        cli.track_model_path.clone(),
    ));
    let analysis: Arc<dyn TaskService> = Arc::new(AnalysisTaskSrv::new(
        registry.clone(),
        outputs.clone(),
        supervisor.clone(),
    ));

    let app = api::router(api::AppState {
        streams,
        outputs,
        record,
        tracking,
        analysis,
    });

    let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cli.listen_port));
    let listener = TcpListener::bind(&address)
        .await
        .into_diagnostic()
        .wrap_err(format!("Failed to bind API server to {address}"))?;

    info!("Starting HTTP server on {address}");

    let shutdown = CancellationToken::new();
    let server_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .expect("HTTP server should run");
        })
    };

    tokio::select! {
        Ok(_) = tokio::signal::ctrl_c() => {
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
    info!("Exiting");

    let _ = server_handle.await;

    // Running tasks observe their cancel flags and persist as canceled.
    supervisor.shutdown().await;

    Ok(())
}
