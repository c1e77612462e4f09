pub mod config;
pub mod error;
pub mod helpers;
pub mod jobs;
pub mod services;

use std::{path::PathBuf, sync::Arc};

use axum::{
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Extension, Json,
};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{
    sync::{broadcast::error::RecvError, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use config::Config;
use error::AppError;
use jobs::{
    normalize_file_list,
    transcode::{render_template, synthesize, EncodeOptions, EncoderLocator},
    BatchEvent, BatchSummary,
};
use services::{
    cancel::CancellationController,
    job::{BatchRunner, BatchStatus},
};

type SharedOptions = Arc<Mutex<EncodeOptions>>;
type Worker = Arc<Mutex<Option<JoinHandle<BatchSummary>>>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env()?);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    debug!("loaded configuration: {:?}", config);

    let locator = EncoderLocator::new(config.encoder_name.clone(), config.encoder_path.clone());
    match locator.locate() {
        Some(path) => info!("using encoder at {}", path.display()),
        None => warn!(
            "{} not found yet, batches will fail until it is available",
            locator.file_name()
        ),
    }

    let runner = BatchRunner::new(locator, config.event_buffer);
    let options: SharedOptions = Arc::new(Mutex::new(EncodeOptions::default()));
    let worker: Worker = Arc::new(Mutex::new(None));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut closer = helpers::Closer::new();
    {
        let runner = Arc::clone(&runner);
        let worker = Arc::clone(&worker);
        closer.add("batch worker", async move {
            if runner.request_cancel() {
                info!("stopping running batch");
            }
            if let Some(handle) = worker.lock().await.take() {
                match handle.await {
                    Ok(summary) => info!(
                        "last batch ended with {} of {} succeeded",
                        summary.succeeded, summary.total
                    ),
                    Err(err) => error!("batch worker panicked: {}", err),
                }
            }
        });
    }

    let app = axum::Router::new()
        .route("/options", get(get_options).put(put_options))
        .route("/preview", post(preview))
        .route("/batch", get(batch_status).post(start_batch))
        .route("/batch/stop", post(stop_batch))
        .route("/events", get(events))
        .fallback(helpers::handler_404)
        .layer(Extension(runner))
        .layer(Extension(options))
        .layer(Extension(worker))
        .layer(Extension(config.clone()))
        .layer(Extension(shutdown_rx));

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!("listening on {}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            helpers::do_shutdown().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    closer.close().await;
    Ok(())
}

async fn get_options(Extension(options): Extension<SharedOptions>) -> Json<EncodeOptions> {
    Json(options.lock().await.clone())
}

async fn put_options(
    Extension(runner): Extension<Arc<BatchRunner>>,
    Extension(options): Extension<SharedOptions>,
    Json(new_options): Json<EncodeOptions>,
) -> Json<EncodeOptions> {
    *options.lock().await = new_options.clone();
    runner.publish(BatchEvent::OptionsChanged {
        options: new_options.clone(),
    });
    Json(new_options)
}

#[derive(Deserialize)]
struct PreviewRequest {
    file: String,
    options: Option<EncodeOptions>,
}

#[derive(Serialize)]
struct Preview {
    argv: Vec<String>,
    command: String,
    /// Editable form with `%%INPUT%%`/`%%OUTPUT%%` placeholders
    template: String,
    output: PathBuf,
}

async fn preview(
    Extension(runner): Extension<Arc<BatchRunner>>,
    Extension(options): Extension<SharedOptions>,
    Json(req): Json<PreviewRequest>,
) -> Result<Json<Preview>, AppError> {
    let options = match req.options {
        Some(o) => o,
        None => options.lock().await.clone(),
    };
    let file = normalize_file_list([req.file])
        .into_iter()
        .next()
        .ok_or_else(|| AppError::FailedValidation("no file given".into()))?;

    // show the bare name when the encoder is missing, the batch itself will refuse
    let locator = runner.locator();
    let encoder = locator
        .locate()
        .unwrap_or_else(|| PathBuf::from(locator.file_name()));
    let (argv, output) = synthesize(&file, &options, &encoder)?;
    let template = match &options.manual_template {
        Some(t) => t.clone(),
        None => render_template(&argv, &file, &output),
    };

    Ok(Json(Preview {
        command: argv.join(" "),
        argv,
        template,
        output,
    }))
}

#[derive(Deserialize)]
struct StartRequest {
    files: Vec<String>,
    options: Option<EncodeOptions>,
}

#[axum_macros::debug_handler]
async fn start_batch(
    Extension(runner): Extension<Arc<BatchRunner>>,
    Extension(options): Extension<SharedOptions>,
    Extension(worker): Extension<Worker>,
    Extension(config): Extension<Arc<Config>>,
    Json(req): Json<StartRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let files = normalize_file_list(req.files);
    if files.is_empty() {
        return Err(AppError::FailedValidation("no files selected".into()));
    }
    let options = match req.options {
        Some(o) => o,
        None => options.lock().await.clone(),
    };

    let total = files.len();
    let batch = runner.prepare(files, options, CancellationController::new(config.kill_grace))?;
    *worker.lock().await = Some(tokio::spawn(batch.run()));
    info!("queued batch of {} file(s)", total);

    Ok((StatusCode::ACCEPTED, Json(json!({ "total": total }))))
}

async fn stop_batch(Extension(runner): Extension<Arc<BatchRunner>>) -> Json<serde_json::Value> {
    let requested = runner.request_cancel();
    if requested {
        info!("stop requested by user");
    }
    Json(json!({ "requested": requested }))
}

async fn batch_status(Extension(runner): Extension<Arc<BatchRunner>>) -> Json<BatchStatus> {
    Json(runner.status())
}

async fn events(
    Extension(runner): Extension<Arc<BatchRunner>>,
    Extension(shutdown): Extension<watch::Receiver<bool>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = runner.subscribe();
    let updates = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((Event::default().json_data(&event), rx)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("event subscriber lagging, skipped {} event(s)", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(updates.take_until(shutting_down(shutdown))).keep_alive(KeepAlive::default())
}

async fn shutting_down(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
