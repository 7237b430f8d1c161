//! MQTT control-plane transport.
//!
//! One connection to the broker: the command topic feeds
//! [`commands::dispatch`], and the outbound event channel drains to the
//! event topic. The poll loop never does the work itself (dispatch
//! spawns each verb onto its own task), so a slow device cannot stall
//! ingress. Connection errors back off and retry; subscriptions are
//! re-issued on every ConnAck so a broker restart heals itself.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::commands;
use crate::config::MqttConfig;
use crate::events::Event;
use crate::system::System;

/// Capacity of rumqttc's request queue.
const REQUEST_QUEUE: usize = 64;

/// Backoff after a broker connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Run the transport until the task is aborted.
pub async fn run(
    system: Arc<System>,
    mut events_rx: mpsc::UnboundedReceiver<Event>,
    config: MqttConfig,
) {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_QUEUE);

    // Publisher task: serialize and ship everything the daemon emits.
    let publish_client = client.clone();
    let event_topic = config.event_topic.clone();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event.to_payload() {
                Ok(payload) => {
                    if let Err(err) = publish_client
                        .publish(event_topic.as_str(), QoS::AtLeastOnce, false, payload)
                        .await
                    {
                        warn!("event publish failed: {err}");
                    }
                }
                Err(err) => error!("unserializable event: {err}"),
            }
        }
        debug!("event channel closed, publisher exiting");
    });

    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                info!(
                    "connected to MQTT broker at {}:{}",
                    config.host, config.port
                );
                if let Err(err) = client
                    .subscribe(config.command_topic.as_str(), QoS::AtLeastOnce)
                    .await
                {
                    warn!("subscribe to {} failed: {err}", config.command_topic);
                }
            }
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                if publish.topic == config.command_topic {
                    commands::dispatch(&system, &publish.payload);
                } else {
                    debug!("ignoring publish on {}", publish.topic);
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!("MQTT connection error: {err}; retrying in {RECONNECT_DELAY:?}");
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
