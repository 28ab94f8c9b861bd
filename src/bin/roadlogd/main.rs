//! roadlogd: vehicle camera logging daemon
//!
//! Drives the encoder pipeline: per-camera encoder threads, the segment
//! rotation coordinator, retention-aware space sweep, and encode-index
//! publishing. Camera hardware is replaced by synthetic frame sources;
//! the vision bus and inter-process transport are external collaborators.
//!
//! ## Usage
//!
//! ```bash
//! # Normal recording mode
//! roadlogd
//!
//! # Livestream mode (low-bitrate, nothing written to disk)
//! roadlogd --livestream
//!
//! # Accelerated segments for testing
//! ROADLOG_TEST=1 ROADLOG_SEGMENT_LENGTH=5 roadlogd
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use roadlog::vision::{start_test_source, TestSourceConfig};
use roadlog::{
    build_cameras, camera, frame_ring, Config, Coordinator, LocalBus, SegmentConfig,
    WriterEncoder, NO_CAMERA_PATIENCE,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("roadlog=info".parse().unwrap()),
        )
        .init();

    let config = Config::from_env()?;

    info!("roadlogd starting");
    info!("  Mode: {:?}", config.mode);
    info!("  Segment root: {}", config.root.display());
    info!("  Segment length: {}s", config.segment_length.as_secs_f64());
    info!("  Storage budget: {} MB", config.max_bytes / (1024 * 1024));

    let cameras = build_cameras(config.mode, config.record_front)?;
    let bus = Arc::new(LocalBus::new());

    let (mut coordinator, handle, initial, ack_tx) = Coordinator::new(SegmentConfig {
        root: config.root.clone(),
        segment_length: config.segment_length,
        patience: NO_CAMERA_PATIENCE,
    })?;
    let mut records_rx = coordinator.segment_records();

    // Per-topic publish counters for the stats log
    let mut topic_counts: Vec<(&'static str, Arc<AtomicU64>)> = Vec::new();
    for camera in &cameras {
        for variant in &camera.variants {
            let count = Arc::new(AtomicU64::new(0));
            topic_counts.push((variant.publish_name, Arc::clone(&count)));
            let mut rx = bus.subscribe(variant.publish_name);
            tokio::spawn(async move {
                while rx.recv().await.is_some() {
                    count.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    }

    let mut worker_joins = Vec::new();
    for camera in cameras {
        info!(
            camera = %camera.id,
            thread = camera.thread_name,
            variants = camera.variants.len(),
            "starting camera encoder"
        );
        let (frame_tx, frame_rx) = frame_ring(camera.fps as usize);
        let _ = start_test_source(
            TestSourceConfig {
                fps: camera.fps,
                ..Default::default()
            },
            frame_tx,
        );
        let encoders = WriterEncoder::for_variants(&camera.variants);
        let (cam_handle, join) = camera::spawn(
            camera,
            Box::new(frame_rx),
            encoders,
            Arc::clone(&bus),
            ack_tx.clone(),
            Arc::clone(&initial),
        );
        coordinator.add_camera(cam_handle);
        worker_joins.push(join);
    }
    drop(ack_tx);

    // Log finalized segments as they close
    tokio::spawn(async move {
        while let Some(record) = records_rx.recv().await {
            info!(
                segment = record.index,
                dir = %record.dir.display(),
                frames = ?record.frames,
                duration_s = record.duration.as_secs_f64(),
                closed_by = ?record.closed_by,
                preserved = record.preserved,
                "segment finalized"
            );
        }
    });

    // Periodic retention-aware space sweep
    {
        let root = config.root.clone();
        let max_bytes = config.max_bytes;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                match tokio::task::block_in_place(|| roadlog::preserve::sweep(&root, max_bytes)) {
                    Ok(0) => {}
                    Ok(reclaimed) => info!(reclaimed, "sweep reclaimed space"),
                    Err(e) => warn!(error = %e, "sweep failed"),
                }
                if let Ok(free) = roadlog::preserve::available_bytes(&root) {
                    if free < max_bytes / 10 {
                        warn!(free, "low disk space under segment root");
                    }
                }
            }
        });
    }

    // Stats every 5 seconds
    {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                let summary: Vec<String> = topic_counts
                    .iter()
                    .map(|(topic, count)| format!("{}={}", topic, count.load(Ordering::Relaxed)))
                    .collect();
                info!("Stats: {} | dropped={}", summary.join(" "), bus.dropped());
            }
        });
    }

    let run = tokio::spawn(coordinator.run());

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    handle.shutdown();

    let records = run.await??;
    for join in worker_joins {
        join.await?;
    }

    info!(
        segments = records.len(),
        preserved = records.iter().filter(|r| r.preserved).count(),
        "roadlogd shut down cleanly"
    );
    Ok(())
}
