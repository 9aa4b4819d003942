use std::{
    fs,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::Receiver;
use skull_sync_core::{
    calibration::MemoryCalibrationStore,
    events::{ChannelSink, SessionEventKind},
    gaze::CenteringFollower,
    Calibration, Channel, DirectorySessions, EngineParts, GazeChannel, GazeOverride, HardwareActuator, PlayerError,
    PlayerEvent, PlayerState, SimulatedBackend, SimulatedBus, StopReason, SyncPlayer,
};

const SHORT: &str = r#"{"frames": [
    {"timestamp_ms": 0, "jaw": 120, "neck_pan": 60},
    {"timestamp_ms": 100, "jaw": 170, "neck_pan": 120}
], "metadata": {"duration": 150}}"#;

const LONG: &str = r#"{"timeline": [
    {"time": 0, "motors": {"jaw": 130}},
    {"time": 60000, "motors": {"jaw": 170}}
]}"#;

fn write_session(root: &Path, id: &str, timeline: &str) {
    let dir = root.join(id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("motion.json"), timeline).unwrap();
    fs::write(dir.join("track.mp3"), b"ID3\x04fake").unwrap();
}

struct Rig {
    player: SyncPlayer,
    bus: SimulatedBus,
    events: Receiver<PlayerEvent>,
    _sessions: tempfile::TempDir,
}

fn rig() -> Rig {
    let sessions = tempfile::tempdir().unwrap();
    write_session(sessions.path(), "short", SHORT);
    write_session(sessions.path(), "long", LONG);
    write_session(sessions.path(), "garbled", "{\"frames\": 12}");

    let bus = SimulatedBus::new();
    let (sink, events) = ChannelSink::unbounded();
    let parts = EngineParts {
        actuator: HardwareActuator::new(bus.clone(), Calibration::default()),
        audio: Box::new(SimulatedBackend),
        sessions: Box::new(DirectorySessions::new(sessions.path())),
        calibration: Box::new(MemoryCalibrationStore::default()),
        gaze: GazeChannel::default(),
        gaze_override: GazeOverride::default(),
        follower: CenteringFollower::default(),
        sink: Arc::new(sink),
        lag_warning: Duration::from_millis(50),
    };
    let player = SyncPlayer::spawn(parts, Duration::from_millis(5)).unwrap();
    Rig {
        player,
        bus,
        events,
        _sessions: sessions,
    }
}

fn wait_for(player: &SyncPlayer, state: PlayerState) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if player.state() == state {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn stop_reasons(events: &Receiver<PlayerEvent>) -> Vec<StopReason> {
    events
        .try_iter()
        .filter_map(|event| match event {
            PlayerEvent::Session(session) => match session.kind {
                SessionEventKind::Stopped { reason, .. } => Some(reason),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

fn assert_neutral(bus: &SimulatedBus) {
    for channel in Channel::ALL {
        let spec = channel.spec();
        assert_eq!(bus.last_pulse(spec.bus_output), Some(spec.pulse_for(spec.neutral_angle)));
    }
}

#[test]
fn short_session_plays_out_and_parks() {
    let rig = rig();
    rig.player.play("short").unwrap();

    assert!(wait_for(&rig.player, PlayerState::Idle));
    assert_neutral(&rig.bus);
    assert_eq!(stop_reasons(&rig.events), vec![StopReason::Completed]);
}

#[test]
fn pause_resume_stop_round_trip() {
    let rig = rig();
    rig.player.play("long").unwrap();
    assert_eq!(rig.player.status().session_id.as_deref(), Some("long"));

    rig.player.pause().unwrap();
    let paused = rig.player.status();
    assert_eq!(paused.state, PlayerState::Paused);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(rig.player.status().elapsed_ms, paused.elapsed_ms);

    rig.player.resume().unwrap();
    assert_eq!(rig.player.state(), PlayerState::Playing);

    rig.player.stop().unwrap();
    assert_eq!(rig.player.state(), PlayerState::Idle);
    assert_neutral(&rig.bus);
    assert_eq!(stop_reasons(&rig.events), vec![StopReason::Requested]);
}

#[test]
fn invalid_commands_are_reported_to_the_caller() {
    let rig = rig();
    let err = rig.player.pause().unwrap_err();
    assert!(err.is_rejected_transition());
    assert!(matches!(rig.player.play("garbled"), Err(PlayerError::Parse(_))));
    assert!(matches!(rig.player.play("absent"), Err(PlayerError::SessionNotFound(_))));
    assert_eq!(rig.player.state(), PlayerState::Idle);
}

#[test]
fn status_reflects_channel_settings() {
    let rig = rig();
    rig.player.set_offset(Channel::EyeRight, 60.0).unwrap();
    rig.player.set_channel_enabled(Channel::Jaw, false).unwrap();
    rig.player.set_gaze_tracking(true).unwrap();

    let status = rig.player.status();
    let eye = &status.channel_states[Channel::EyeRight.index()];
    assert_eq!(eye.offset_degrees, 45.0);
    assert!(!status.channel_states[Channel::Jaw.index()].enabled);
    assert!(status.gaze_tracking);
}

#[test]
fn dropping_the_player_stops_the_session() {
    let rig = rig();
    rig.player.play("long").unwrap();
    let Rig { player, bus, events, .. } = rig;

    drop(player);

    assert_neutral(&bus);
    assert_eq!(stop_reasons(&events), vec![StopReason::Shutdown]);
}
