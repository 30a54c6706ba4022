use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::error::YfpResult;
use crate::pipeline::frame_pipeline::FramePipeline;
use crate::protocol::frame_reader::{FrameEvent, FrameReader, FrameReaderConfig};
use crate::protocol::payload_format::PayloadFormat;
use crate::server::server_events::{ConnectionClosedData, ConnectionOpenedData, FrameDroppedData, ServerEvent, ServerEventNotifier};
use crate::util::shutdown::Shutdown;

/// Accepts frame connections and runs one framing loop per connection. Frames of a connection are
///  processed strictly one after the other: the next frame is read only after the pipeline is
///  done with the previous one.
pub struct FrameIngest {
    listener: TcpListener,
    format: Arc<dyn PayloadFormat>,
    reader_config: FrameReaderConfig,
    pipeline: Arc<FramePipeline>,
    events: Arc<ServerEventNotifier>,
    connection_limit: Arc<Semaphore>,
}

impl FrameIngest {
    pub fn new(
        listener: TcpListener,
        format: Arc<dyn PayloadFormat>,
        reader_config: FrameReaderConfig,
        pipeline: Arc<FramePipeline>,
        events: Arc<ServerEventNotifier>,
        max_connections: usize,
    ) -> FrameIngest {
        FrameIngest {
            listener,
            format,
            reader_config,
            pipeline,
            events,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until shutdown, and then waits for all connections to close
    pub async fn run(self, mut shutdown: Shutdown) {
        let mut connections = JoinSet::new();

        loop {
            // a free slot is acquired before accepting so that excess peers wait in the backlog
            let permit = select! {
                permit = self.connection_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.wait() => break,
            };

            let (stream, peer) = select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("error accepting frame connection: {}", e);
                        continue;
                    }
                },
                _ = shutdown.wait() => break,
            };

            while connections.try_join_next().is_some() {}

            connections.spawn(handle_connection(
                peer,
                stream,
                self.format.clone(),
                self.reader_config.clone(),
                self.pipeline.clone(),
                self.events.clone(),
                shutdown.clone(),
                permit,
            ));
        }

        debug!("frame ingest stops accepting, waiting for {} connections to close", connections.len());
        while connections.join_next().await.is_some() {}
    }
}

#[instrument(name = "frame_connection", skip_all, fields(peer = %peer))]
#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    peer: SocketAddr,
    stream: TcpStream,
    format: Arc<dyn PayloadFormat>,
    reader_config: FrameReaderConfig,
    pipeline: Arc<FramePipeline>,
    events: Arc<ServerEventNotifier>,
    mut shutdown: Shutdown,
    _permit: OwnedSemaphorePermit,
) {
    info!("frame connection from {}", peer);
    events.send_event(ServerEvent::ConnectionOpened(ConnectionOpenedData { peer }));

    // the stream is owned by the receive loop and closed when it ends, no matter how
    let result = select! {
        result = receive_loop(peer, stream, format, reader_config, pipeline.as_ref(), events.as_ref()) => result,
        _ = shutdown.wait() => {
            debug!("closing connection for shutdown");
            Ok(())
        }
    };

    let error = match result {
        Ok(()) => {
            info!("client {} disconnected", peer);
            None
        }
        Err(e) => {
            warn!("client {} disconnected with an error: {}", peer, e);
            Some(e.to_string())
        }
    };
    events.send_event(ServerEvent::ConnectionClosed(ConnectionClosedData { peer, error }));
}

async fn receive_loop(
    peer: SocketAddr,
    stream: TcpStream,
    format: Arc<dyn PayloadFormat>,
    reader_config: FrameReaderConfig,
    pipeline: &FramePipeline,
    events: &ServerEventNotifier,
) -> YfpResult<()> {
    let mut reader = FrameReader::new(stream, format, reader_config);

    while let Some(event) = reader.next_frame().await? {
        match event {
            FrameEvent::Frame(frame) => {
                pipeline.process(frame, peer).await;
            }
            FrameEvent::Dropped { header, reason } => {
                warn!("dropping frame {} from {}: {}", header.frame_id(), peer, reason);
                events.send_event(ServerEvent::FrameDropped(FrameDroppedData {
                    peer,
                    frame_id: header.frame_id(),
                    kind: reason.kind(),
                    reason: reason.to_string(),
                }));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    use crate::error::ErrorKind;
    use crate::pipeline::detector::NullDetector;
    use crate::pipeline::metrics::MetricsAggregator;
    use crate::protocol::payload_format::JpegFormat;
    use crate::test_util::collaborators::{RecordingDetectionSender, RecordingDisplaySink};
    use crate::test_util::frames::{encode_test_frame, test_jpeg, CountingFormat};
    use crate::util::shutdown::ShutdownTrigger;

    use super::*;

    struct Fixture {
        addr: SocketAddr,
        sender: Arc<RecordingDetectionSender>,
        events: broadcast::Receiver<ServerEvent>,
        trigger: ShutdownTrigger,
        task: tokio::task::JoinHandle<()>,
    }

    async fn start(max_payload_len: usize, max_connections: usize) -> Fixture {
        start_with_format(Arc::new(JpegFormat {}), max_payload_len, max_connections).await
    }

    async fn start_with_format(format: Arc<dyn PayloadFormat>, max_payload_len: usize, max_connections: usize) -> Fixture {
        let events = Arc::new(ServerEventNotifier::new());
        let sender = Arc::new(RecordingDetectionSender::new());
        let pipeline = FramePipeline::new(
            Arc::new(NullDetector {}),
            sender.clone(),
            Arc::new(RecordingDisplaySink::new()),
            Arc::new(MetricsAggregator::new(Duration::from_secs(1))),
            events.clone(),
            false,
        );
        let reader_config = FrameReaderConfig {
            max_payload_len,
            read_chunk_size: 1024,
            read_timeout: Some(Duration::from_secs(5)),
        };
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await.unwrap();
        let ingest = FrameIngest::new(
            listener,
            format,
            reader_config,
            Arc::new(pipeline),
            events.clone(),
            max_connections,
        );

        let addr = ingest.local_addr().unwrap();
        let trigger = ShutdownTrigger::new();
        let task = tokio::spawn(ingest.run(trigger.signal()));
        Fixture {
            addr,
            sender,
            events: events.subscribe(),
            trigger,
            task,
        }
    }

    async fn next_event(events: &mut broadcast::Receiver<ServerEvent>, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
        loop {
            let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_frames_are_processed_in_order() {
        let mut fixture = start(2_000_000, 4).await;
        let jpeg = test_jpeg(32, 32);

        let mut stream = TcpStream::connect(fixture.addr).await.unwrap();
        for frame_id in 1..=3 {
            stream.write_all(&encode_test_frame(frame_id, &jpeg)).await.unwrap();
        }
        stream.shutdown().await.unwrap();

        let event = next_event(&mut fixture.events, |e| matches!(e, ServerEvent::ConnectionClosed(_))).await;
        assert_eq!(event, ServerEvent::ConnectionClosed(ConnectionClosedData {
            peer: stream.local_addr().unwrap(),
            error: None,
        }));

        let frame_ids = fixture.sender.sent().await
            .iter()
            .map(|s| s.frame_id)
            .collect::<Vec<_>>();
        assert_eq!(frame_ids, vec![1, 2, 3]);

        fixture.trigger.trigger();
        timeout(Duration::from_secs(5), fixture.task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_frames_are_decoded_once() {
        let format = Arc::new(CountingFormat::new(JpegFormat {}));
        let mut fixture = start_with_format(format.clone(), 2_000_000, 4).await;
        let jpeg = test_jpeg(48, 32);

        let mut stream = TcpStream::connect(fixture.addr).await.unwrap();
        for frame_id in 1..=2 {
            stream.write_all(&encode_test_frame(frame_id, &jpeg)).await.unwrap();
        }
        stream.shutdown().await.unwrap();
        next_event(&mut fixture.events, |e| matches!(e, ServerEvent::ConnectionClosed(_))).await;

        assert_eq!(fixture.sender.sent().await.len(), 2);
        assert_eq!(format.decodes(), 2);
        fixture.trigger.trigger();
    }

    #[tokio::test]
    async fn test_framing_error_closes_only_that_connection() {
        let mut fixture = start(2_000_000, 4).await;
        let jpeg = test_jpeg(32, 32);

        let mut good = TcpStream::connect(fixture.addr).await.unwrap();
        let mut bad = TcpStream::connect(fixture.addr).await.unwrap();
        bad.write_all(&0u32.to_be_bytes()).await.unwrap();

        let event = next_event(&mut fixture.events, |e| matches!(e, ServerEvent::ConnectionClosed(_))).await;
        match event {
            ServerEvent::ConnectionClosed(data) => {
                assert_eq!(data.peer, bad.local_addr().unwrap());
                assert!(data.error.unwrap().contains("invalid header length 0"));
            }
            _ => unreachable!(),
        }

        good.write_all(&encode_test_frame(11, &jpeg)).await.unwrap();
        good.shutdown().await.unwrap();
        next_event(&mut fixture.events, |e| matches!(e, ServerEvent::ConnectionClosed(_))).await;
        assert_eq!(fixture.sender.sent().await[0].frame_id, 11);

        fixture.trigger.trigger();
    }

    #[tokio::test]
    async fn test_oversized_frame_is_dropped_and_connection_continues() {
        let mut fixture = start(4000, 4).await;
        let jpeg = test_jpeg(8, 8);
        assert!(jpeg.len() < 4000);

        let mut stream = TcpStream::connect(fixture.addr).await.unwrap();
        stream.write_all(&encode_test_frame(1, &[0u8; 4000])).await.unwrap();
        stream.write_all(&encode_test_frame(2, &jpeg)).await.unwrap();
        stream.shutdown().await.unwrap();

        match next_event(&mut fixture.events, |e| matches!(e, ServerEvent::FrameDropped(_))).await {
            ServerEvent::FrameDropped(data) => {
                assert_eq!(data.frame_id, 1);
                assert_eq!(data.kind, ErrorKind::Framing);
            }
            _ => unreachable!(),
        }
        next_event(&mut fixture.events, |e| matches!(e, ServerEvent::ConnectionClosed(ConnectionClosedData { error: None, .. }))).await;

        let sent = fixture.sender.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frame_id, 2);
        fixture.trigger.trigger();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut fixture = start(2_000_000, 1).await;
        let jpeg = test_jpeg(16, 16);

        let first = TcpStream::connect(fixture.addr).await.unwrap();
        next_event(&mut fixture.events, |e| matches!(e, ServerEvent::ConnectionOpened(_))).await;

        // the second connection is established by the OS, but not served before the first closes
        let mut second = TcpStream::connect(fixture.addr).await.unwrap();
        second.write_all(&encode_test_frame(2, &jpeg)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fixture.sender.sent().await.is_empty());

        drop(first);
        next_event(&mut fixture.events, |e| matches!(e, ServerEvent::ConnectionClosed(_))).await;
        second.shutdown().await.unwrap();
        next_event(&mut fixture.events, |e| matches!(e, ServerEvent::ConnectionClosed(_))).await;
        assert_eq!(fixture.sender.sent().await[0].frame_id, 2);

        fixture.trigger.trigger();
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_connections() {
        let mut fixture = start(2_000_000, 4).await;
        let _idle = TcpStream::connect(fixture.addr).await.unwrap();
        next_event(&mut fixture.events, |e| matches!(e, ServerEvent::ConnectionOpened(_))).await;

        fixture.trigger.trigger();
        timeout(Duration::from_secs(5), fixture.task).await.unwrap().unwrap();
        assert!(matches!(
            next_event(&mut fixture.events, |e| matches!(e, ServerEvent::ConnectionClosed(_))).await,
            ServerEvent::ConnectionClosed(ConnectionClosedData { error: None, .. })
        ));
    }
}
