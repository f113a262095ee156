//! Basic example: Discover nearby weighing scales
//!
//! Run with: cargo run --example scan_scales

use scale_ble::{BleSerialTransport, Result, ScaleManager};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scale_ble=debug".parse().unwrap()),
        )
        .init();

    println!("Starting scale discovery...");
    println!("Make sure your scale is powered on!\n");

    let transport = Arc::new(BleSerialTransport::new().await?);
    let manager = ScaleManager::new(transport);

    manager.start_scan();

    println!("Scanning for 15 seconds...");
    println!("Press Ctrl+C to exit early.\n");

    let mut updates = manager.subscribe();
    let scan = async {
        let mut seen = 0;
        while updates.changed().await.is_ok() {
            let devices = updates.borrow().devices.clone();
            if devices.len() != seen {
                seen = devices.len();
                println!("Devices so far:");
                for device in &devices {
                    println!(
                        "  {} ({}) RSSI {:?}{}",
                        device.display_name(),
                        device.address,
                        device.rssi,
                        if device.is_likely_scale() {
                            "  <- likely a scale"
                        } else {
                            ""
                        }
                    );
                }
            }
        }
    };

    tokio::select! {
        _ = scan => {}
        _ = tokio::time::sleep(Duration::from_secs(15)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
        }
    }

    manager.stop_scan();

    println!("\n--- Scan Complete ---");
    let snapshot = manager.snapshot();
    println!("Total devices found: {}", snapshot.devices.len());
    for device in &snapshot.devices {
        println!(
            "  {} - {} (RSSI: {:?})",
            device.display_name(),
            device.address,
            device.rssi
        );
    }

    manager.destroy().await;
    println!("\nDone!");

    Ok(())
}
