use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;

use voicebridge::audio::{CaptureConfig, CpalSinkFactory, MicSource};
use voicebridge::{Config, SessionConfig, SessionController, VoicePersona, WsTransport};

#[derive(Parser, Debug)]
#[command(name = "voicebridge", about = "Live voice session bridge")]
struct Args {
    /// Path to the configuration file (without extension)
    #[arg(long, default_value = "config/voicebridge")]
    config: String,

    /// Model endpoint URL (overrides the config file)
    #[arg(long)]
    url: Option<String>,

    /// Voice persona: puck, charon, kore, fenrir, aoede
    #[arg(long, default_value = "puck")]
    voice: String,

    /// System instruction sent with session setup
    #[arg(long, default_value = "")]
    system_instruction: String,
}

fn parse_voice(name: &str) -> Result<VoicePersona> {
    Ok(match name.to_ascii_lowercase().as_str() {
        "puck" => VoicePersona::Puck,
        "charon" => VoicePersona::Charon,
        "kore" => VoicePersona::Kore,
        "fenrir" => VoicePersona::Fenrir,
        "aoede" => VoicePersona::Aoede,
        other => bail!("unknown voice persona: {}", other),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)?;
    let url = args.url.unwrap_or_else(|| cfg.transport.url.clone());

    info!("{} starting", cfg.service.name);

    let capture = CaptureConfig {
        sample_rate: cfg.audio.capture_sample_rate,
        frame_samples: cfg.audio.frame_samples,
        rms_threshold: cfg.audio.rms_threshold,
    };

    let session_config = SessionConfig {
        voice: parse_voice(&args.voice)?,
        system_instruction: args.system_instruction,
        capture: capture.clone(),
        output_sample_rate: cfg.audio.output_sample_rate,
        outbound_queue_capacity: cfg.audio.outbound_queue_capacity,
        ..SessionConfig::default()
    };

    let controller = SessionController::new(
        session_config,
        Box::new(MicSource::new(capture)),
        Box::new(WsTransport::new(url)),
        Box::new(CpalSinkFactory {
            sample_rate: cfg.audio.output_sample_rate,
        }),
    );

    controller.start().await?;
    info!("Session running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    controller.stop().await?;

    let stats = controller.stats();
    info!(
        "Session finished: {:.1}s, {} frames captured, {} chunks played, {} packets dropped",
        stats.duration_secs, stats.frames_captured, stats.chunks_scheduled, stats.packets_dropped
    );

    for entry in controller.transcript() {
        println!("[{}] {:?}: {}", entry.timestamp.format("%H:%M:%S"), entry.role, entry.text);
    }

    Ok(())
}
