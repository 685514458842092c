//! RTL-SDR plugin runner
//!
//! Drives the plugin the way a host would, against the simulated tuner:
//! init from the command line, stream until Ctrl+C, then stop and clean up.
//!
//! ```bash
//! rtlsdr-plugin --rate=2048000 --index=0
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rtlsdr_plugin::{AdapterConfig, MockConfig, MockDriver, RtlSdrPlugin, StatusCode};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AdapterConfig::from_env();
    let params = std::env::args().skip(1).collect::<Vec<_>>().join(" ");

    info!("===========================================");
    info!("   {}", rtlsdr_plugin::PLUGIN_NAME);
    info!("===========================================");
    info!("Configuration:");
    info!("  Parameters: '{}'", params);
    info!("  Callback interval: {:?}", config.callback_interval);
    info!("  Scaling: {:?}", config.normalization);
    info!("  Drop tolerance: {}", config.drop_tolerance);

    let plugin = Arc::new(RtlSdrPlugin::new(
        MockDriver::new(MockConfig::default()),
        config,
    ));

    if let Err(e) = plugin.init(&params) {
        let code = StatusCode::from(&e);
        error!("init failed ({:?}, code {}): {}", code, code.code(), e);
        return Err(e).context("plugin init failed");
    }
    info!("  Applied sample rate: {} S/s", plugin.sample_rate()?);
    info!("  Applied gain: {:.1} dB", plugin.gain()?);
    info!("  Gain steps: {}", plugin.gains()?.len());

    let buffers = Arc::new(AtomicU64::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let reader = {
        let plugin = plugin.clone();
        let buffers = buffers.clone();
        let peak = peak.clone();
        tokio::task::spawn_blocking(move || {
            plugin.read_async(move |samples: &[f32], dropped: u64| {
                buffers.fetch_add(1, Ordering::Relaxed);
                let max = samples.iter().fold(0f32, |m, s| m.max(s.abs()));
                peak.fetch_max(max.to_bits(), Ordering::Relaxed);
                if dropped > 0 {
                    warn!("{} samples dropped before this buffer", dropped);
                }
            })
        })
    };

    info!("Streaming... Press Ctrl+C to stop.");

    let mut report = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received");
                break;
            }
            _ = report.tick() => {
                if let Some(stats) = plugin.stats() {
                    info!(
                        "[Stats] Buffers: {} | Samples: {} | Dropped: {} | Peak: {:.3}",
                        stats.buffers_delivered,
                        stats.samples_delivered,
                        stats.dropped_samples,
                        f32::from_bits(peak.load(Ordering::Relaxed))
                    );
                }
                if reader.is_finished() {
                    warn!("Acquisition ended on its own");
                    break;
                }
            }
        }
    }

    plugin.stop()?;
    match reader.await.context("reader task failed")? {
        Ok(()) => info!("Reader returned cleanly"),
        Err(e) => error!("Reader returned error: {}", e),
    }
    plugin.cleanup();

    info!(
        "Shutdown complete. Buffers delivered: {}",
        buffers.load(Ordering::Relaxed)
    );
    Ok(())
}
