//! Live weight monitoring: connect to the strongest scale candidate and
//! print every reading as it streams in.
//!
//! Run with: cargo run --example weight_monitor

use scale_ble::{BleSerialTransport, ConnectionState, Result, ScaleManager};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scale_ble=info".parse().unwrap()),
        )
        .init();

    let transport = Arc::new(BleSerialTransport::new().await?);
    let manager = ScaleManager::new(transport);

    println!("Scanning for scales (10 seconds)...");
    manager.start_scan();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let snapshot = manager.snapshot();
    let Some(device) = snapshot.devices.first().cloned() else {
        println!("No devices found.");
        manager.destroy().await;
        return Ok(());
    };

    println!(
        "Connecting to {} ({})...",
        device.display_name(),
        device.address
    );
    manager.connect(device.address.clone());

    let mut updates = manager.subscribe();
    let monitor = async {
        let mut last_state = ConnectionState::Disconnected;
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow().clone();

            if snapshot.connection != last_state {
                println!("[state] {}", snapshot.connection);
                last_state = snapshot.connection;
                if snapshot.connection == ConnectionState::Error {
                    if let Some(error) = &snapshot.last_error {
                        println!("[error] {error}");
                    }
                    break;
                }
            }

            if let Some(message) = &snapshot.last_error {
                if snapshot.connection == ConnectionState::Connecting {
                    println!("[retry] {message}");
                }
            }

            if let Some(weight) = &snapshot.weight {
                println!(
                    "{:>10.3} {}  {}",
                    weight.value,
                    weight.unit,
                    if weight.stable { "stable" } else { "~" }
                );
            }
        }
    };

    tokio::select! {
        _ = monitor => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
        }
    }

    manager.destroy().await;
    println!("Done!");

    Ok(())
}
