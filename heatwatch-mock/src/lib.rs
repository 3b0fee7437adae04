use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::json;
use time::OffsetDateTime;
use tokio::time::{interval, sleep};

use crate::settings::{Device, Settings};
use crate::simulate::{excursion, simulated_humidity, simulated_temperature};

pub mod settings;
mod simulate;

const SECONDS_PER_DAY: f64 = 86400.0;

/// Builds one payload per device: a bare raw temperature or a humidity object.
fn device_payloads(settings: &Settings, day_fraction: f64) -> Vec<(String, String)> {
    let mut rng = rand::rng();
    let alert = &settings.alert;

    settings
        .devices
        .iter()
        .map(|device: &Device| {
            let payload = if device.reports_temperature() {
                let actual = if rng.random_bool(settings.mock.excursion_chance.clamp(0.0, 1.0)) {
                    excursion(alert.max_temp, &mut rng)
                } else {
                    simulated_temperature(day_fraction, alert.min_temp, alert.max_temp, &mut rng)
                };
                // devices report uncalibrated values
                format!("{:.2}", actual - alert.temperature_offset)
            } else {
                json!({ "humidity": (simulated_humidity(day_fraction, &mut rng) * 10.0).round() / 10.0 })
                    .to_string()
            };

            (device.topic.clone(), payload)
        })
        .collect()
}

pub async fn run(settings: &Arc<Settings>) -> Result<(), Box<dyn Error>> {
    let gateway = &settings.gateway;

    let mut options = MqttOptions::new("heatwatch-mock", &gateway.host, gateway.port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(username), Some(password)) = (&gateway.username, &gateway.password) {
        options.set_credentials(username, password);
    }

    let capacity = settings.devices.len() + 10;
    let (client, mut event_loop) = AsyncClient::new(options, capacity);

    tokio::spawn(async move {
        loop {
            if let Err(e) = event_loop.poll().await {
                tracing::error!("MQTT error: {}", e);
                sleep(Duration::from_secs(5)).await;
            }
        }
    });

    let mut ticker = interval(Duration::from_secs(settings.mock.interval_secs));
    loop {
        ticker.tick().await;

        let now = OffsetDateTime::now_utc();
        let seconds_since_midnight = now.time().hour() as f64 * 3600.0
            + now.time().minute() as f64 * 60.0
            + now.time().second() as f64;
        let day_fraction = seconds_since_midnight / SECONDS_PER_DAY;

        for (topic, payload) in device_payloads(settings, day_fraction) {
            tracing::debug!("Send {}: {}", topic, payload);
            client
                .publish(topic, QoS::AtLeastOnce, false, payload.into_bytes())
                .await?;
        }
    }
}
