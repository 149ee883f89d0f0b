use std::time::Duration;
use tracing::{info, warn};
use pucklink::{
    simulated::{SimulatedCentral, SimulatedPuck},
    ConnectionParams, PuckDevice, PuckEvent, Result, SessionConfig, StationId, TelemetryEvent,
    TimeoutConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🧪 Pucklink Simulated Session Example");

    let station = StationId::new("LEGEXT01")?;
    let puck = SimulatedPuck::new(station, SessionConfig::default());
    let clock = puck.spawn_clock(Duration::from_secs(1));

    // The Puck calibrates on boot
    puck.boot().await;
    puck.feed_samples(1.0, SessionConfig::default().calibration_sample_count)
        .await;
    info!("Puck state after calibration: {}", puck.state().await);

    let central = SimulatedCentral::new(vec![puck.clone()]);
    let device = PuckDevice::new(central, ConnectionParams::default(), TimeoutConfig::default());
    let mut events = device.take_events().expect("events are taken once");

    let paired = device.pair(&station).await?;
    info!("✅ Paired with {} (count on Puck: {:?})", paired.device, paired.reconciled_count);

    device.start_session().await?;

    // A rep is a swing away from the baseline and back
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(700)).await;
        puck.sample(2.0).await;
        puck.sample(1.0).await;
    }

    device.stop_session().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    while let Ok(event) = events.try_recv() {
        match event {
            PuckEvent::Telemetry(TelemetryEvent::RepCount { count }) => info!("🏋️ Reps: {count}"),
            PuckEvent::Telemetry(TelemetryEvent::Error { code }) => warn!("Puck error: {code}"),
            PuckEvent::Telemetry(event) => info!("Telemetry: {event:?}"),
            other => info!("Event: {other:?}"),
        }
    }

    let mirror = device.mirror().await;
    println!("\n📊 Session Summary");
    println!("   State:   {}", mirror.state);
    println!("   Reps:    {}", mirror.count);
    if let Some(battery) = mirror.battery_pct {
        println!("   Battery: {battery}%");
    }

    device.disconnect().await?;
    clock.abort();
    Ok(())
}
