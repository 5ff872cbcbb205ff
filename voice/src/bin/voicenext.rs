//! Voice client CLI.
//!
//! Joins a voice session with credentials obtained from the main gateway,
//! plays a WAV file into it and optionally records what others say.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tracing::{info, warn};

use voicenext::{
    read_wav, write_wav, AudioClip, EncryptionMode, VoiceConfig, VoiceConnection,
    VoiceCredentials,
};
use voicenext_common::{init_tracing, ColorWhen, MetricsContext, MetricsServerConfig};

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum ColorArg {
    Auto,
    Always,
    Never,
}

impl From<ColorArg> for ColorWhen {
    fn from(v: ColorArg) -> Self {
        match v {
            ColorArg::Auto => ColorWhen::Auto,
            ColorArg::Always => ColorWhen::Always,
            ColorArg::Never => ColorWhen::Never,
        }
    }
}

/// Voice client - stream a WAV file into a voice channel
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Voice server endpoint (host[:port]) from VOICE_SERVER_UPDATE
    #[arg(short, long)]
    endpoint: String,

    /// Guild (server) id
    #[arg(short, long)]
    guild: u64,

    /// Our user id
    #[arg(short, long)]
    user: u64,

    /// Session id from VOICE_STATE_UPDATE
    #[arg(short, long)]
    session: String,

    /// Voice token from VOICE_SERVER_UPDATE
    #[arg(short, long)]
    token: String,

    /// Input audio file (WAV format)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Frame duration in milliseconds (5, 10, 20, 40 or 60)
    #[arg(long, default_value = "20")]
    frame_ms: u32,

    /// Record incoming voice to this WAV file
    #[arg(short, long)]
    record: Option<PathBuf>,

    /// Encryption modes in preference order
    #[arg(long, value_delimiter = ',')]
    modes: Vec<String>,

    /// Use plain ws:// for the signaling socket
    #[arg(long)]
    insecure: bool,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9300")]
    metrics_bind: String,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorArg,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.color.into())?;
    info!("Starting voicenext v{VERSION}");
    info!("Voice endpoint: {}", args.endpoint);
    info!("Metrics bind: {}", args.metrics_bind);

    let metrics = MetricsContext::new(&args.guild.to_string())?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    let config = build_config(&args)?;
    let format = config.audio_format;

    // Read and convert audio in a blocking task
    let clip = match args.input.clone() {
        Some(path) => Some(
            tokio::task::spawn_blocking(move || read_wav(path, format))
                .await
                .context("audio reading task failed")??,
        ),
        None => None,
    };

    let credentials = VoiceCredentials {
        guild_id: args.guild,
        user_id: args.user,
        session_id: args.session.clone(),
        token: args.token.clone(),
        endpoint: args.endpoint.clone(),
    };
    let connection = VoiceConnection::builder(credentials)
        .config(config)
        .metrics(metrics)
        .build();

    let recording = Arc::new(Mutex::new(Vec::<i16>::new()));
    if args.record.is_some() {
        let sink = recording.clone();
        connection.events().voice_received.add(move |ev| {
            sink.lock().extend_from_slice(&ev.pcm);
            Ok(())
        });
    }
    connection.events().user_joined.add(|ev| {
        info!(ssrc = ev.ssrc, "user {} joined", ev.user.id);
        Ok(())
    });
    connection.events().user_left.add(|ev| {
        info!("user {} left", ev.user.id);
        Ok(())
    });
    connection.events().socket_error.add(|ev| {
        warn!(recoverable = ev.recoverable, "signaling error: {}", ev.message);
        Ok(())
    });

    connection.connect().await.context("failed to join voice session")?;
    info!(
        ssrc = connection.ssrc().unwrap_or_default(),
        "Connected using {:?}",
        connection.encryption_mode()
    );

    match clip {
        Some(clip) => tokio::select! {
            res = play(&connection, &clip, args.frame_ms) => res?,
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        },
        None => {
            info!("No input; listening until Ctrl-C");
            tokio::signal::ctrl_c().await.context("failed to wait for Ctrl-C")?;
        }
    }

    connection.disconnect().await;
    info!("ws ping {}ms, udp ping {}ms", connection.ws_ping(), connection.udp_ping());

    if let Some(path) = &args.record {
        let samples = std::mem::take(&mut *recording.lock());
        write_wav(path, &AudioClip { samples, format })?;
    }

    Ok(())
}

fn build_config(args: &Args) -> Result<VoiceConfig> {
    // ---
    let mut config = VoiceConfig {
        enable_incoming: args.record.is_some(),
        use_tls: !args.insecure,
        ..VoiceConfig::default()
    };

    if !args.modes.is_empty() {
        config.encryption_modes = args
            .modes
            .iter()
            .map(|name| {
                EncryptionMode::from_name(name)
                    .with_context(|| format!("unknown encryption mode '{name}'"))
            })
            .collect::<Result<_>>()?;
    }

    Ok(config)
}

async fn play(connection: &VoiceConnection, clip: &AudioClip, frame_ms: u32) -> Result<()> {
    // ---
    info!("Playing {:.2}s of audio", clip.duration_secs());
    let mut sink = connection.transmit_sink(Some(frame_ms))?;

    sink.write(&clip.samples).await?;
    sink.flush().await?;
    connection.wait_for_playback_finish().await;

    info!("Playback complete");
    Ok(())
}
