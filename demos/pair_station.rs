use tracing::{error, info, warn};
use pucklink::{ConnectionParams, PuckDevice, PuckError, PuckEvent, Result, StationId};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let token = std::env::args().nth(1).unwrap_or_else(|| "LEGEXT01".to_string());
    let station = StationId::new(&token)?;

    info!("🔗 Pucklink Pairing Example");
    info!("Looking for the Puck of station {station}...");

    let device = PuckDevice::with_ble(ConnectionParams::default()).await?;
    let mut events = device.take_events().expect("events are taken once");

    // Surface "still trying" while the pipeline retries
    let progress = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let PuckEvent::Retrying {
                attempt,
                max_attempts,
                error,
            } = event
            {
                warn!("⏳ Still trying ({attempt}/{max_attempts}): {error}");
            }
        }
    });

    match device.pair(&station).await {
        Ok(paired) => {
            info!(
                "✅ Paired with {} after {} attempt(s), Puck count {:?}",
                paired.device, paired.attempts, paired.reconciled_count
            );
            let mirror = device.mirror().await;
            info!("Puck session: {} with {} reps", mirror.state, mirror.count);
        }
        Err(PuckError::HandshakeRejected { station }) => {
            error!("❌ This Puck belongs to another station (presented {station})");
        }
        Err(PuckError::RetriesExhausted { attempts, last }) => {
            error!("❌ Gave up after {attempts} attempts: {last}");
        }
        Err(e) => {
            error!("❌ Pairing failed: {e}");
            return Err(e);
        }
    }

    device.disconnect().await?;
    progress.abort();
    Ok(())
}
