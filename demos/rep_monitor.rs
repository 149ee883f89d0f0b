use std::time::Duration;
use tracing::{error, info, warn};
use pucklink::{
    ConnectionParams, PuckDevice, PuckEvent, Result, StationId, TelemetryEvent,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let token = std::env::args().nth(1).unwrap_or_else(|| "LEGEXT01".to_string());
    let station = StationId::new(&token)?;

    info!("📊 Pucklink Rep Monitor Example");

    let params = ConnectionParams {
        auto_reconnect: true,
        ..ConnectionParams::default()
    };
    let device = PuckDevice::with_ble(params).await?;
    let mut events = device.take_events().expect("events are taken once");

    device.pair(&station).await?;
    device.start_session().await?;
    info!("🏁 Session started, press Ctrl+C to stop");

    let mut state = device.watch_state();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Ok(()) = state.changed() => {
                info!("Connection: {}", *state.borrow());
            }
            event = events.recv() => match event {
                Some(PuckEvent::Telemetry(TelemetryEvent::RepCount { count })) => {
                    println!("🏋️ Reps: {count}");
                }
                Some(PuckEvent::Telemetry(TelemetryEvent::Status(status))) => {
                    println!(
                        "📋 Active: {} | Reps: {} | Battery: {}%",
                        status.active, status.count, status.battery_pct
                    );
                }
                Some(PuckEvent::Telemetry(TelemetryEvent::Error { code })) => {
                    warn!("Puck reported: {code}");
                }
                Some(PuckEvent::LinkLost { reason }) => warn!("⚠️ Link lost: {reason}"),
                Some(PuckEvent::Paired { reconciled_count, .. }) => {
                    info!("🔗 Reconnected, Puck count {reconciled_count:?}");
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    info!("Stopping session...");
    if let Err(e) = device.stop_session().await {
        error!("Failed to stop session: {e}");
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mirror = device.mirror().await;
    info!("Final count: {}", mirror.count);
    device.disconnect().await?;
    Ok(())
}
