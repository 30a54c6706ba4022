use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio::{select, time};
use tracing::debug;

use crate::pipeline::display_sink::{DisplayMetrics, DisplaySink};
use crate::session::client_registry::ClientRegistry;
use crate::util::shutdown::Shutdown;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub frames_processed: u64,
    pub total_detections: u64,
    pub avg_detection_time_ms: f64,
    /// frames processed per second, as of the last completed window
    pub fps: f64,
}

struct MetricsState {
    snapshot: MetricsSnapshot,
    window_start: Instant,
    frames_in_window: u64,
}

/// Process-wide counters, written by every pipeline invocation and read on the metrics tick
pub struct MetricsAggregator {
    fps_window: Duration,
    state: RwLock<MetricsState>,
}

impl MetricsAggregator {
    pub fn new(fps_window: Duration) -> MetricsAggregator {
        MetricsAggregator {
            fps_window,
            state: RwLock::new(MetricsState {
                snapshot: MetricsSnapshot::default(),
                window_start: Instant::now(),
                frames_in_window: 0,
            }),
        }
    }

    pub async fn record_frame(&self, num_detections: usize, processing_time_ms: u64) {
        let mut state = self.state.write().await;
        let snapshot = &mut state.snapshot;

        snapshot.frames_processed += 1;
        snapshot.total_detections += num_detections as u64;
        // incremental mean - precise enough for the number of frames a process sees
        let n = snapshot.frames_processed as f64;
        snapshot.avg_detection_time_ms = (snapshot.avg_detection_time_ms * (n - 1.0) + processing_time_ms as f64) / n;

        state.frames_in_window += 1;
    }

    /// Closes the FPS window if it is complete, and returns the current values
    pub async fn tick(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let mut state = self.state.write().await;

        let elapsed = now.duration_since(state.window_start);
        if elapsed >= self.fps_window {
            state.snapshot.fps = state.frames_in_window as f64 / elapsed.as_secs_f64();
            state.frames_in_window = 0;
            state.window_start = now;
        }
        state.snapshot
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.state.read().await.snapshot
    }
}

/// Pushes metrics to the display sink every `interval` until shutdown
pub async fn run_metrics_ticker(
    metrics: Arc<MetricsAggregator>,
    registry: Arc<ClientRegistry>,
    sink: Arc<dyn DisplaySink>,
    interval: Duration,
    mut shutdown: Shutdown,
) {
    let mut ticks = time::interval(interval);
    ticks.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    loop {
        select! {
            _ = ticks.tick() => {
                let snapshot = metrics.tick().await;
                sink.update_metrics(&DisplayMetrics {
                    fps: snapshot.fps,
                    avg_detection_time_ms: snapshot.avg_detection_time_ms,
                    total_detections: snapshot.total_detections,
                    frames_processed: snapshot.frames_processed,
                    client_count: registry.count().await,
                });
            }
            _ = shutdown.wait() => {
                debug!("metrics ticker shutting down");
                return;
            }
        }
    }
}
