use std::error::Error;
use std::time::Duration;

use rovlink_sdk::{ConnectOptions, LinkClient, LinkClientOptions};

fn main() -> Result<(), Box<dyn Error>> {
    let host = std::env::var("ROV_HOST").unwrap_or_else(|_| "192.168.2.2".to_string());
    let port = std::env::var("ROV_PORT")
        .ok()
        .and_then(|port| port.parse().ok())
        .unwrap_or(8000);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = LinkClient::new(
            LinkClientOptions::default().with_request_timeout(Duration::from_secs(2)),
        );
        client.connect(&ConnectOptions::new(host, port)).await?;

        let reading = client.read_mag().await?;
        println!("magnetometer: {reading}");

        let mut mag = client.subscribe_mag_data();
        client.start_mag_stream(Duration::from_millis(200)).await?;
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_secs(1), mag.recv()).await {
                Ok(Some(sample)) => println!(
                    "heading={} pitch={} roll={}",
                    sample.heading, sample.pitch, sample.roll
                ),
                Ok(None) | Err(_) => break,
            }
        }
        client.stop_mag_stream().await?;

        let report = client.disconnect().await;
        println!(
            "disconnected had_error={} timed_out={}",
            report.had_error, report.timed_out
        );
        Ok::<(), Box<dyn Error>>(())
    })
}
