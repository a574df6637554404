//! Battery monitor example
//!
//! Demonstrates the core flow:
//! - Scanning for peripherals with a Battery service
//! - Opening a connection session
//! - Reading Device Information
//! - Streaming Battery Level notifications
//!
//! Run with: cargo run --example battery_monitor
//!
//! To connect to a specific peripheral:
//!   cargo run --example battery_monitor -- --address C0:FF:EE:00:00:01

use futures::StreamExt;
use peripheral_link::{BleManager, Error, PeripheralAddress, Result, BATTERY_SERVICE_UUID};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,peripheral_link=debug")
        .init();

    println!("Battery Monitor");
    println!("===============\n");

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let target = args
        .iter()
        .position(|arg| arg == "--address")
        .and_then(|i| args.get(i + 1))
        .map(|s| PeripheralAddress::new(s.as_str()));

    let manager = BleManager::new().await?;

    let address = match target {
        Some(address) => address,
        None => {
            println!("Scanning for peripherals with a Battery service...\n");
            let mut scan = manager.scan([BATTERY_SERVICE_UUID]);
            let found = tokio::time::timeout(Duration::from_secs(10), scan.next())
                .await
                .ok()
                .flatten()
                .transpose()?;

            match found {
                Some(summary) => {
                    println!(
                        "Found {} ({})",
                        summary.address,
                        summary.name.as_deref().unwrap_or("unnamed")
                    );
                    summary.address
                }
                None => {
                    println!("No peripheral found.");
                    return Ok(());
                }
            }
        }
    };

    println!("Connecting to {}...\n", address);
    let mut session = manager.connect(address);

    while let Some(update) = session.next().await {
        let handle = match update {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                println!("Not connected");
                continue;
            }
            Err(Error::ConnectFailed { reason }) => {
                eprintln!("Connection failed: {}", reason);
                break;
            }
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        let info = manager.device_information(&handle).await?;
        println!("=== Device Information ===");
        println!("Manufacturer: {}", info.manufacturer_name.as_deref().unwrap_or("-"));
        println!("Model:        {}", info.model_number.as_deref().unwrap_or("-"));
        println!("Serial:       {}", info.serial_number.as_deref().unwrap_or("-"));
        println!();

        if let Some(level) = manager.read_battery_level(&handle).await? {
            println!("Battery: {}%", level);
        }

        println!("Streaming battery level (Ctrl+C to stop)...");
        let mut levels = manager.observe_battery_level(&handle);
        let interrupted = loop {
            tokio::select! {
                level = levels.next() => match level {
                    Some(level) => println!("Battery: {}%", level),
                    None => break false,
                },
                _ = tokio::signal::ctrl_c() => break true,
            }
        };
        levels.close().await;

        if interrupted {
            println!("\nDisconnecting...");
            break;
        }
    }

    session.close().await;
    Ok(())
}
