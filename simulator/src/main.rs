mod telemetry;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, LastWill, MqttOptions, QoS};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Publishes synthetic sensor readings and device status to the broker.
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Readings per second across all devices
    #[arg(long, env = "RATE", default_value_t = 100)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 10)]
    devices: usize,

    /// Seconds between `online` status reports
    #[arg(long, env = "STATUS_INTERVAL_SECS", default_value_t = 30)]
    status_interval: u64,

    /// Fraction of readings replaced by payloads the bridge must drop
    #[arg(long, env = "MALFORMED_RATIO", default_value_t = 0.0)]
    malformed_ratio: f64,

    /// Stop after this many readings (0 runs forever)
    #[arg(long, default_value_t = 0)]
    count: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let devices = args.devices.max(1);
    let rate = args.rate.max(1);
    let malformed_ratio = args.malformed_ratio.clamp(0.0, 1.0);

    info!("Starting sensor simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {}",
        args.broker, args.port, rate, devices
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4().simple());
    let mut mqtt_options = MqttOptions::new(client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);
    // One simulator process stands in for all devices; the first one's will
    // is enough to exercise the bare-word offline path.
    mqtt_options.set_last_will(LastWill::new(
        telemetry::status_topic("dev-0"),
        "offline",
        QoS::AtLeastOnce,
        false,
    ));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    publish_status(&client, devices).await;
    info!("Connected to MQTT broker, starting to publish readings");

    let mut rng = rand::thread_rng();
    let mut published = 0u64;
    let mut readings = 0u64;
    let mut malformed = 0u64;
    let mut last_status = Instant::now();
    let status_interval = Duration::from_secs(args.status_interval.max(1));

    let burst_size = rate.min(200);
    let burst_interval = Duration::from_millis(burst_size * 1000 / rate);

    loop {
        let burst_start = Instant::now();
        let slots = burst_len(burst_size, args.count, readings);

        for _ in 0..slots {
            let device_id = format!("dev-{}", published % devices as u64);
            let topic = telemetry::data_topic(&device_id);

            let broken = malformed_ratio > 0.0 && rng.gen_bool(malformed_ratio);
            let payload = if broken {
                telemetry::generate_malformed(&mut rng)
            } else {
                match serde_json::to_string(&telemetry::generate_reading(&mut rng)) {
                    Ok(p) => p,
                    Err(e) => {
                        error!("Failed to serialize reading: {}", e);
                        continue;
                    }
                }
            };

            match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => {
                    published += 1;
                    if broken {
                        malformed += 1;
                    } else {
                        readings += 1;
                    }
                }
                Err(e) => warn!("Failed to publish: {}", e),
            }
        }

        if readings > 0 && readings % 10_000 < burst_size {
            info!("Published {} readings ({} malformed)", readings, malformed);
        }

        if args.count > 0 && readings >= args.count {
            info!("Published {} readings ({} malformed), done", readings, malformed);
            break;
        }

        if last_status.elapsed() >= status_interval {
            publish_status(&client, devices).await;
            last_status = Instant::now();
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?}",
                elapsed, burst_interval
            );
        }
    }

    if let Err(e) = client.disconnect().await {
        warn!("Failed to disconnect cleanly: {}", e);
    }
    // Give the event loop a moment to flush the disconnect.
    tokio::time::sleep(Duration::from_millis(500)).await;
}

/// Payload slots for the next burst. With a reading target, never plan more
/// than the readings still owed; malformed payloads fill slots without
/// counting, so a short burst is simply followed by another.
fn burst_len(burst_size: u64, target: u64, readings: u64) -> u64 {
    if target == 0 {
        burst_size
    } else {
        burst_size.min(target.saturating_sub(readings))
    }
}

async fn publish_status(client: &AsyncClient, devices: usize) {
    for index in 0..devices {
        let device_id = format!("dev-{}", index);
        let payload = match serde_json::to_string(&telemetry::online_status(index)) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize status: {}", e);
                continue;
            }
        };

        if let Err(e) = client
            .publish(telemetry::status_topic(&device_id), QoS::AtLeastOnce, false, payload)
            .await
        {
            warn!("Failed to publish status for {}: {}", device_id, e);
        }
    }
}
