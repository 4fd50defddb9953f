use std::fs::File;
use std::io::{BufReader, Read};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use facewatch_core::{
    people, ArcFaceClassifier, EuclideanMatcher, FaceCache, NoopClusterSink, ScrfdDetector,
};
use facewatch_stream::FrameReader;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod gateway;
mod notify;

use config::Config;
use engine::{FaceDump, Pipeline};
use gateway::{AppState, SharedClassifier};

/// How long in-flight HTTP requests get to finish once shutdown starts.
const SERVER_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        addr = %config.addr,
        width = config.frame_width,
        height = config.frame_height,
        "facewatchd starting"
    );

    let roster = match &config.people_path {
        Some(path) => people::load_people(path)?,
        None => {
            tracing::warn!("no people file configured; matching disabled");
            Vec::new()
        }
    };

    let detector = ScrfdDetector::load(&config.detector_model_path())
        .context("failed to load face detector")?
        .with_confidence_threshold(config.detection_confidence);
    let classifier: SharedClassifier = Arc::new(Mutex::new(
        ArcFaceClassifier::load(&config.classifier_model_path())
            .context("failed to load face classifier")?,
    ));
    let cache = Arc::new(FaceCache::new(
        config.face_cache_size,
        config.jpeg_quality,
        Box::new(NoopClusterSink),
    ));

    let notify_config = config.notify_config();
    let drain_grace = notify_config.timeout + Duration::from_secs(1);
    let (dispatcher, workers) =
        notify::spawn(notify_config).context("failed to build notification client")?;

    if let Some(path) = config.motion_path.clone() {
        tracing::info!(path = %path.display(), "motion monitoring enabled");
        engine::spawn_motion_monitor(path, config.motion_config(), dispatcher.clone())?;
    }

    let video: Box<dyn Read + Send> = match &config.video_path {
        Some(path) => Box::new(
            File::open(path)
                .with_context(|| format!("failed to open video input {}", path.display()))?,
        ),
        None => Box::new(std::io::stdin()),
    };
    let frames = FrameReader::new(BufReader::new(video), config.frame_width, config.frame_height);

    let mut pipeline = Pipeline::new(
        Box::new(detector),
        Arc::clone(&classifier),
        Arc::clone(&cache),
        dispatcher,
        Box::new(EuclideanMatcher {
            threshold: config.match_distance,
        }),
    )
    .with_roster(Arc::new(roster))
    .with_padding(config.detection_padding)
    .with_normalized_embeddings(config.normalize_embeddings);
    if let Some(dir) = &config.output_faces_dir {
        pipeline = pipeline.with_face_dump(FaceDump::create(dir.clone(), config.jpeg_quality)?);
    }
    let mut pipeline_done = engine::spawn_pipeline(pipeline, frames)?;

    let listener = TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;
    let state = AppState {
        cache,
        classifier,
        normalize_embeddings: config.normalize_embeddings,
    };
    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let mut server = tokio::spawn(gateway::serve(listener, state, async {
        let _ = server_stopped.await;
    }));

    tracing::info!("facewatchd ready");

    let mut server_running = true;
    let mut pipeline_running = true;
    let outcome: Result<()> = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => break match signal {
                Ok(()) => {
                    tracing::info!("interrupted");
                    Ok(())
                }
                Err(e) => Err(anyhow::Error::new(e).context("failed to listen for ctrl-c")),
            },
            done = &mut pipeline_done, if pipeline_running => match done {
                Ok(Ok(frames)) => {
                    pipeline_running = false;
                    tracing::info!(frames, "frame pipeline finished; gateway still serving");
                }
                Ok(Err(e)) => break Err(anyhow::Error::new(e).context("frame pipeline failed")),
                Err(_) => break Err(anyhow!("frame pipeline thread exited without reporting")),
            },
            served = &mut server => {
                server_running = false;
                break match served {
                    Ok(Ok(())) => Err(anyhow!("http server stopped unexpectedly")),
                    Ok(Err(e)) => Err(anyhow::Error::new(e).context("http server failed")),
                    Err(e) => Err(anyhow::Error::new(e).context("http server task failed")),
                };
            },
        }
    };

    tracing::info!("facewatchd shutting down");
    let _ = stop_server.send(());
    if server_running {
        match tokio::time::timeout(SERVER_GRACE, server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "http server failed during shutdown"),
            Ok(Err(e)) => tracing::warn!(error = %e, "http server task failed"),
            Err(_) => tracing::warn!("http server did not stop in time"),
        }
    }
    workers.shutdown(drain_grace).await;

    if let Err(e) = &outcome {
        tracing::error!(error = %format!("{e:#}"), "facewatchd exiting with error");
    }
    outcome
}
