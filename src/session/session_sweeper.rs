use std::sync::Arc;
use std::time::Duration;

use tokio::{select, time};
use tracing::{debug, info};

use crate::server::server_events::{ClientEvictedData, ServerEvent, ServerEventNotifier};
use crate::session::client_registry::ClientRegistry;
use crate::util::shutdown::Shutdown;

/// Periodically evicts sessions whose peer was not heard from for longer than `session_timeout`,
///  until shutdown
pub async fn run_session_sweeper(
    registry: Arc<ClientRegistry>,
    events: Arc<ServerEventNotifier>,
    session_timeout: Duration,
    sweep_interval: Duration,
    mut shutdown: Shutdown,
) {
    let mut ticks = time::interval(sweep_interval);
    ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        select! {
            _ = ticks.tick() => {
                sweep(registry.as_ref(), events.as_ref(), session_timeout).await;
            }
            _ = shutdown.wait() => {
                debug!("session sweeper shutting down");
                return;
            }
        }
    }
}

async fn sweep(registry: &ClientRegistry, events: &ServerEventNotifier, session_timeout: Duration) {
    for session in registry.evict_stale(session_timeout).await {
        info!("evicting session of {} after {:?} of silence", session.control_addr, session_timeout);
        events.send_event(ServerEvent::ClientEvicted(ClientEvictedData {
            ip: session.ip,
            control_addr: session.control_addr,
        }));
    }
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use crate::util::shutdown::ShutdownTrigger;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_evicts_silent_sessions_until_shutdown() {
        let registry = Arc::new(ClientRegistry::new());
        let events = Arc::new(ServerEventNotifier::new());
        let mut event_receiver = events.subscribe();
        let trigger = ShutdownTrigger::new();

        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7));
        let control_addr = SocketAddr::new(ip, 40000);
        registry.upsert(ip, control_addr).await;

        let sweeper = tokio::spawn(run_session_sweeper(
            registry.clone(),
            events.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
            trigger.signal(),
        ));

        time::sleep(Duration::from_secs(59)).await;
        assert_eq!(registry.count().await, 1);

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(registry.count().await, 0);
        assert_eq!(
            event_receiver.try_recv().unwrap(),
            ServerEvent::ClientEvicted(ClientEvictedData { ip, control_addr })
        );

        trigger.trigger();
        sweeper.await.unwrap();
    }
}
