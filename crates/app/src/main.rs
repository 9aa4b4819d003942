mod gaze_udp;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use clap::{ArgGroup, Parser, Subcommand};
use skull_sync_core::{
    audio,
    events::TracingSink,
    gaze::CenteringFollower,
    AppConfig, CalibrationStore, Channel, DirectorySessions, EngineParts, GazeChannel, HardwareActuator,
    JsonCalibrationStore, PlayerState, SimulatedBus, SyncPlayer, Timeline,
};
use tracing_subscriber::EnvFilter;

use crate::gaze_udp::GazeListener;

const STATUS_INTERVAL: Duration = Duration::from_millis(500);

fn main() -> skull_sync_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Play { session, gaze } => run_play(&config, &session, gaze),
        Commands::Validate { timeline } => run_validate(&timeline),
        Commands::Calibrate {
            channel,
            offset,
            enable,
            disable,
        } => run_calibrate(&config, channel, offset, enable, disable),
    }
}

fn run_play(config: &AppConfig, session: &str, with_gaze: bool) -> skull_sync_core::Result<()> {
    tracing::info!(session, backend = ?config.audio.backend, gaze = with_gaze, "starting playback");

    let store = JsonCalibrationStore::new(&config.paths.calibration_file);
    let calibration = store.load()?;
    let gaze = GazeChannel::new(config.gaze.staleness());
    let mut gaze_override = config.gaze.override_policy();
    gaze_override.enabled |= with_gaze;

    let parts = EngineParts {
        actuator: HardwareActuator::new(SimulatedBus::new(), calibration)
            .with_retry(config.hardware.retry_policy()),
        audio: audio::backend_for(config.audio.backend)?,
        sessions: Box::new(DirectorySessions::new(&config.paths.sessions_dir)),
        calibration: Box::new(store),
        gaze: gaze.clone(),
        gaze_override,
        follower: CenteringFollower::new(config.gaze.neck_centering, config.gaze.eye_centering),
        sink: Arc::new(TracingSink),
        lag_warning: config.player.lag_warning(),
    };

    let _listener = if with_gaze {
        Some(GazeListener::spawn(config.gaze.listen_addr, gaze)?)
    } else {
        None
    };

    let player = SyncPlayer::spawn(parts, config.player.tick_period())?;
    player.play(session)?;

    loop {
        thread::sleep(STATUS_INTERVAL);
        let status = player.status();
        if status.state == PlayerState::Idle {
            break;
        }
        tracing::info!(
            state = ?status.state,
            elapsed_ms = status.elapsed_ms,
            gaze_fresh = status.gaze_fresh,
            "status"
        );
    }

    let summary = serde_json::to_string_pretty(&player.status()).map_err(|err| {
        skull_sync_core::PlayerError::Config(format!("cannot render status: {err}"))
    })?;
    println!("{summary}");
    player.shutdown();
    Ok(())
}

fn run_validate(path: &Path) -> skull_sync_core::Result<()> {
    let timeline = Timeline::load_file(path)?;
    println!("{}: duration {} ms", path.display(), timeline.duration_ms());
    for channel in Channel::ALL {
        let count = timeline.keyframes(channel).map_or(0, <[_]>::len);
        println!("  {channel:<10} {count:>6} keyframes");
    }
    Ok(())
}

fn run_calibrate(
    config: &AppConfig,
    channel: Channel,
    offset: Option<f64>,
    enable: bool,
    disable: bool,
) -> skull_sync_core::Result<()> {
    let store = JsonCalibrationStore::new(&config.paths.calibration_file);
    let mut calibration = store.load()?;

    if let Some(degrees) = offset {
        calibration = calibration.with_offset(channel, degrees);
    }
    if enable || disable {
        calibration = calibration.with_enabled(channel, enable);
    }
    if offset.is_some() || enable || disable {
        store.save(&calibration)?;
        tracing::info!(path = %store.path().display(), %channel, "calibration saved");
    }

    let entry = calibration.get(channel);
    println!(
        "{channel}: offset {:+.1} deg, {}",
        entry.offset_degrees,
        if entry.enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio-synchronised servo player for the animatronic skull", long_about = None)]
struct Cli {
    /// JSON configuration file; defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play one session to the end, driving the servos from its timeline.
    Play {
        /// Session id under the configured sessions directory.
        session: String,
        /// Listen for gaze packets and let them steer the eyes and neck.
        #[arg(long)]
        gaze: bool,
    },
    /// Load a motion timeline and report what it contains.
    Validate {
        /// Path to the timeline JSON file.
        timeline: PathBuf,
    },
    /// Show or edit the persisted calibration of one channel.
    #[command(group(ArgGroup::new("toggle").args(["enable", "disable"])))]
    Calibrate {
        /// jaw, eye_left, eye_right or neck_pan.
        channel: Channel,
        /// Offset in degrees added before clamping (limited to +/-45).
        #[arg(long, allow_hyphen_values = true)]
        offset: Option<f64>,
        #[arg(long)]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },
}
