use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::pipeline::detector::Detector;
use crate::pipeline::display_sink::DisplaySink;
use crate::pipeline::frame_pipeline::FramePipeline;
use crate::pipeline::metrics::{run_metrics_ticker, MetricsAggregator, MetricsSnapshot};
use crate::protocol::frame_reader::FrameReaderConfig;
use crate::protocol::payload_format::JpegFormat;
use crate::server::control_channel::ControlChannel;
use crate::server::discovery::DiscoveryResponder;
use crate::server::frame_ingest::FrameIngest;
use crate::server::server_config::ServerConfig;
use crate::server::server_events::{ServerEvent, ServerEventNotifier};
use crate::session::client_registry::ClientRegistry;
use crate::session::session_sweeper::run_session_sweeper;
use crate::util::shutdown::ShutdownTrigger;

/// A running server. All sockets are bound and all tasks are running when [YfpServer::start]
///  returns, and [YfpServer::stop] releases them again.
pub struct YfpServer {
    frame_addr: SocketAddr,
    control_addr: SocketAddr,
    discovery_addr: SocketAddr,
    registry: Arc<ClientRegistry>,
    metrics: Arc<MetricsAggregator>,
    events: Arc<ServerEventNotifier>,
    shutdown_trigger: ShutdownTrigger,
    tasks: JoinSet<()>,
}

impl YfpServer {
    pub async fn start(config: ServerConfig, detector: Arc<dyn Detector>, sink: Arc<dyn DisplaySink>) -> anyhow::Result<YfpServer> {
        config.validate()?;

        let registry = Arc::new(ClientRegistry::new());
        let metrics = Arc::new(MetricsAggregator::new(config.fps_window));
        let events = Arc::new(ServerEventNotifier::new());

        // TCP is bound first: with port 0, the control channel follows the port the OS picked
        let listener = TcpListener::bind(SocketAddr::new(config.bind_ip, config.server_port)).await
            .with_context(|| format!("binding frame port {}", config.server_port))?;
        let frame_addr = listener.local_addr()?;

        let control_channel = Arc::new(ControlChannel::bind(
            SocketAddr::new(config.bind_ip, frame_addr.port()),
            registry.clone(),
            events.clone(),
            config.control_recv_buffer_len,
            config.send_connect_ack,
        ).await.with_context(|| format!("binding control port {}", frame_addr.port()))?);
        let control_addr = control_channel.local_addr()?;

        let discovery = DiscoveryResponder::bind(
            SocketAddr::new(config.bind_ip, config.discovery_port),
            &config.server_name,
            &config.version,
            config.discovery_recv_buffer_len,
            events.clone(),
        ).await.with_context(|| format!("binding discovery port {}", config.discovery_port))?;
        let discovery_addr = discovery.local_addr()?;

        let pipeline = Arc::new(FramePipeline::new(
            detector,
            control_channel.clone(),
            sink.clone(),
            metrics.clone(),
            events.clone(),
            config.annotate_frames,
        ));
        let ingest = FrameIngest::new(
            listener,
            Arc::new(JpegFormat {}),
            FrameReaderConfig {
                max_payload_len: config.max_payload_len,
                read_chunk_size: config.read_chunk_size,
                read_timeout: config.read_timeout,
            },
            pipeline,
            events.clone(),
            config.max_connections,
        );

        let shutdown_trigger = ShutdownTrigger::new();
        let mut tasks = JoinSet::new();
        tasks.spawn(ingest.run(shutdown_trigger.signal()));
        tasks.spawn(control_channel.run(shutdown_trigger.signal()));
        tasks.spawn(discovery.run(shutdown_trigger.signal()));
        tasks.spawn(run_metrics_ticker(metrics.clone(), registry.clone(), sink, config.metrics_interval, shutdown_trigger.signal()));
        tasks.spawn(run_session_sweeper(registry.clone(), events.clone(), config.session_timeout, config.session_sweep_interval, shutdown_trigger.signal()));

        info!("{} {} started: frames on {}, control on {}, discovery on {}", config.server_name, config.version, frame_addr, control_addr, discovery_addr);

        Ok(YfpServer {
            frame_addr,
            control_addr,
            discovery_addr,
            registry,
            metrics,
            events,
            shutdown_trigger,
            tasks,
        })
    }

    pub fn frame_addr(&self) -> SocketAddr {
        self.frame_addr
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.discovery_addr
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Closes all sockets and connections, waits for all tasks to finish and forgets all sessions
    pub async fn stop(mut self) {
        info!("stopping server");
        self.shutdown_trigger.trigger();

        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("server task ended abnormally: {}", e);
            }
        }
        self.registry.clear().await;
        info!("server stopped");
    }
}
