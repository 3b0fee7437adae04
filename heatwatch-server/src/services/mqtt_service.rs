use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};

use crate::configs::Gateway;
use crate::services::coordinator::Coordinator;
use crate::services::router::TopicRouter;
use crate::services::shutdown::Shutdown;

/// Exponential reconnect delay, doubling up to a cap.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub connected: bool,
    pub reconnects: u32,
    pub messages: u64,
}

/// Broker connection state shared with the status endpoint.
#[derive(Default)]
pub struct ConnectionStatus {
    connected: AtomicBool,
    reconnects: AtomicU32,
    messages: AtomicU64,
}

impl ConnectionStatus {
    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::Relaxed);
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.mark_disconnected();
    }

    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
        }
    }
}

pub struct MqttService {
    client: AsyncClient,
    event_loop: EventLoop,
    router: Arc<TopicRouter>,
    coordinator: Arc<Coordinator>,
    status: Arc<ConnectionStatus>,
    backoff: Backoff,
}

impl MqttService {
    pub fn new(
        gateway: &Gateway,
        router: Arc<TopicRouter>,
        coordinator: Arc<Coordinator>,
        status: Arc<ConnectionStatus>,
    ) -> Self {
        let mut options = MqttOptions::new(&gateway.client_id, &gateway.host, gateway.port);
        options.set_keep_alive(Duration::from_secs(gateway.keep_alive_secs));

        if let (Some(username), Some(password)) = (&gateway.username, &gateway.password) {
            options.set_credentials(username, password);
        }

        // room for one subscribe request per topic on every reconnect
        let capacity = router.routes().len() + 10;
        let (client, event_loop) = AsyncClient::new(options, capacity);

        Self {
            client,
            event_loop,
            router,
            coordinator,
            status,
            backoff: Backoff::new(
                Duration::from_secs(gateway.reconnect_initial_secs),
                Duration::from_secs(gateway.reconnect_max_secs),
            ),
        }
    }

    /// Polls the broker until shutdown, reconnecting with backoff on errors.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        loop {
            let event = tokio::select! {
                event = self.event_loop.poll() => event,
                _ = shutdown.wait() => break,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!("connected to mqtt broker");
                    self.status.mark_connected();
                    self.backoff.reset();
                    self.subscribe_all();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.status.record_message();
                    self.coordinator.on_message(&publish.topic, &publish.payload);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    tracing::warn!("mqtt broker sent disconnect");
                    self.status.mark_disconnected();
                }
                Ok(_) => {}
                Err(e) => {
                    if shutdown.is_triggered() {
                        break;
                    }

                    let delay = self.backoff.next_delay();
                    tracing::error!("mqtt error: {}, reconnecting in {:?}", e, delay);
                    self.status.increment_reconnects();

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait() => break,
                    }
                }
            }
        }

        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!("mqtt disconnect on shutdown failed: {}", e);
        }
        tracing::info!("mqtt service stopped");
    }

    // Requests are queued with try_subscribe: the event loop that drains the
    // request channel is this same task.
    fn subscribe_all(&self) {
        for topic in self.router.topics() {
            match self.client.try_subscribe(topic, QoS::AtLeastOnce) {
                Ok(()) => tracing::debug!("subscribe topic {}", topic),
                Err(e) => tracing::error!("failed to subscribe {}: {}", topic, e),
            }
        }
    }
}
