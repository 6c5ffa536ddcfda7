//! End-to-end playback scenarios.
//!
//! Each test writes a small trajectory file into a temp dir, drives a
//! `Session` tick by tick against a `RecordingScene`, then checks what the
//! scene received and what the live frame query returns.
//!
//! Run with: `cargo test --test playback_scenarios`

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crowd_replay::{
    FrameRange, LoadStatus, PlaybackConfig, PlaybackError, QueryMode, RecordingScene, Session,
    Stage, TickOutcome, AGENT_Z, HIDDEN_Z,
};
use rusqlite::{params, Connection};
use tempfile::TempDir;

const SQUARE: &str = "POLYGON ((0 0, 10 0, 10 10, 0 10, 0 0))";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn x_at(agent_id: i64, frame: i64) -> f64 {
    agent_id as f64 * 2.0 + frame as f64 * 0.01
}

fn y_at(agent_id: i64, frame: i64) -> f64 {
    agent_id as f64 * 1.5 + frame as f64 * 0.005
}

/// Helper: write a trajectory file with `agents` agents present at `frames`.
fn write_trajectories(
    path: &Path,
    agents: i64,
    frames: &[i64],
    columns: (&str, &str),
    geometry: Option<&str>,
) {
    let conn = Connection::open(path).expect("failed to create store");
    let (x_col, y_col) = columns;
    conn.execute_batch(&format!(
        "CREATE TABLE trajectory_data (id INTEGER NOT NULL, frame INTEGER NOT NULL, {x_col} REAL, {y_col} REAL);
         CREATE INDEX frame_id_idx ON trajectory_data(frame, id);"
    ))
    .expect("failed to create schema");

    let insert = format!(
        "INSERT INTO trajectory_data (id, frame, {x_col}, {y_col}) VALUES (?1, ?2, ?3, ?4)"
    );
    for &frame in frames {
        for id in 1..=agents {
            conn.execute(&insert, params![id, frame, x_at(id, frame), y_at(id, frame)])
                .expect("failed to insert row");
        }
    }

    if let Some(wkt) = geometry {
        conn.execute_batch("CREATE TABLE geometry (hash INTEGER, wkt TEXT)")
            .expect("failed to create geometry table");
        conn.execute("INSERT INTO geometry VALUES (1, ?1)", params![wkt])
            .expect("failed to insert geometry");
    }
}

/// Helper: the 3-agent store with frames 0, 10, 20, 30, 40.
fn three_agent_store(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("three_agents.sqlite");
    write_trajectories(&path, 3, &[0, 10, 20, 30, 40], ("pos_x", "pos_y"), Some(SQUARE));
    path
}

/// Helper: tick until the load ends, checking progress never decreases.
fn run_to_end(session: &mut Session, scene: &mut RecordingScene) -> LoadStatus {
    let mut last_pct = 0.0;
    for _ in 0..5_000 {
        match session.tick(scene) {
            TickOutcome::Finished(status) => return status,
            TickOutcome::Idle => panic!("session went idle without finishing"),
            TickOutcome::Running => {
                let pct = session.progress().progress_pct;
                assert!(pct >= last_pct, "progress went back: {last_pct} -> {pct}");
                last_pct = pct;
                thread::sleep(Duration::from_millis(2));
            }
        }
    }
    panic!("load did not finish");
}

fn load(path: &Path, config: PlaybackConfig) -> (Session, RecordingScene, LoadStatus) {
    init_logging();
    let mut session = Session::new();
    let mut scene = RecordingScene::default();
    session.start_load(path, config).expect("start_load failed");
    let status = run_to_end(&mut session, &mut scene);
    (session, scene, status)
}

// ============================================================================
// Streaming mode
// ============================================================================

#[test]
fn test_streaming_load_and_query() {
    let dir = TempDir::new().unwrap();
    let (mut session, scene, status) = load(&three_agent_store(&dir), PlaybackConfig::default());

    assert_eq!(status, LoadStatus::Complete);
    assert_eq!(session.last_status(), Some(&LoadStatus::Complete));
    assert!(!session.progress().in_progress);
    assert_eq!(session.progress().progress_pct, 100.0);
    assert_eq!(session.progress().message, "Load complete");
    assert_eq!(session.progress().loaded_agent_count, 3);

    assert_eq!(scene.collections_prepared, 1);
    assert_eq!(scene.agent_ids(), vec![1, 2, 3]);
    assert!(scene.point_cloud.is_none());
    assert_eq!(scene.frame_range, Some((FrameRange::new(0, 40), None)));

    assert_eq!(session.frame_range(), Some(FrameRange::new(0, 40)));
    assert_eq!(session.mode(), Some(QueryMode::Streaming));
    assert!(session.is_hook_installed());

    let view = session.on_frame_change(10).expect("frame 10 should be served");
    let slot = 0; // agent 1
    let [x, y, z] = view.position(slot).unwrap();
    assert!((x - 2.1).abs() < 1e-5, "x = {x}");
    assert!((y - 1.55).abs() < 1e-5, "y = {y}");
    assert_eq!(z, AGENT_Z);

    // Frames between recorded ones are sampled but empty.
    let view = session.on_frame_change(15).unwrap();
    assert_eq!(view.iter_visible().count(), 0);
    assert!(view.positions().chunks(3).all(|p| p[2] == HIDDEN_Z));

    assert!(session.on_frame_change(41).is_none());
}

#[test]
fn test_frame_step_skips_unsampled_frames() {
    let dir = TempDir::new().unwrap();
    let config = PlaybackConfig {
        frame_step: 3,
        ..Default::default()
    };
    let (mut session, _scene, status) = load(&three_agent_store(&dir), config);
    assert_eq!(status, LoadStatus::Complete);

    assert!(session.on_frame_change(10).is_none());
    let view = session.on_frame_change(30).unwrap();
    assert_eq!(view.iter_visible().count(), 3);
}

#[test]
fn test_legacy_xy_columns() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("legacy.sqlite");
    write_trajectories(&path, 2, &[0, 1, 2], ("x", "y"), None);

    let (mut session, scene, status) = load(&path, PlaybackConfig::default());
    assert_eq!(status, LoadStatus::Complete);
    assert!(scene.boundaries.is_empty());
    assert_eq!(session.on_frame_change(2).unwrap().iter_visible().count(), 2);
}

// ============================================================================
// Dense mode
// ============================================================================

#[test]
fn test_dense_round_trip() {
    let dir = TempDir::new().unwrap();
    let config = PlaybackConfig {
        big_data_mode: true,
        agent_scale: 0.5,
        ..Default::default()
    };
    let (mut session, scene, status) = load(&three_agent_store(&dir), config);

    assert_eq!(status, LoadStatus::Complete);
    assert_eq!(session.mode(), Some(QueryMode::Dense));
    assert_eq!(scene.point_cloud, Some((3, 0.5)));
    assert!(scene.agents.is_empty());
    assert!(session.stats().dense_buffer_bytes > 0);

    for frame in (0..=40).step_by(10) {
        let view = session.on_frame_change(frame).unwrap();
        for agent_id in 1..=3i64 {
            let slot = (agent_id - 1) as usize;
            assert_eq!(
                view.position(slot),
                Some([x_at(agent_id, frame) as f32, y_at(agent_id, frame) as f32, AGENT_Z]),
                "agent {agent_id} at frame {frame}"
            );
        }
    }
}

#[test]
fn test_reload_is_bit_identical() {
    let dir = TempDir::new().unwrap();
    let path = three_agent_store(&dir);
    let config = PlaybackConfig {
        big_data_mode: true,
        frame_step: 2,
        ..Default::default()
    };

    let (mut session, _scene, _) = load(&path, config.clone());
    let first = session.frame_buffer().cloned().unwrap();

    let mut scene = RecordingScene::default();
    session.start_load(&path, config).unwrap();
    assert!(session.frame_buffer().is_none(), "reload tears down old buffers");
    assert_eq!(run_to_end(&mut session, &mut scene), LoadStatus::Complete);

    assert_eq!(session.frame_buffer().cloned().unwrap(), first);
}

// ============================================================================
// Geometry and paths
// ============================================================================

#[test]
fn test_square_geometry_boundary() {
    let dir = TempDir::new().unwrap();
    let (_session, scene, _) = load(&three_agent_store(&dir), PlaybackConfig::default());

    assert_eq!(scene.boundaries.len(), 1);
    let boundary = &scene.boundaries[0];
    assert_eq!(boundary.name, "Walkable_Area_Boundary");
    assert_eq!(boundary.points.len(), 5);
    assert!(boundary.cyclic);
    assert_eq!(boundary.thickness, 0.05);
}

#[test]
fn test_bad_geometry_is_a_warning() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad_geometry.sqlite");
    write_trajectories(
        &path,
        2,
        &[0, 1],
        ("pos_x", "pos_y"),
        Some("POLYGON ((0 0, 1 0, 2 0, 0 0))"),
    );

    let (mut session, scene, status) = load(&path, PlaybackConfig::default());
    assert_eq!(status, LoadStatus::Complete);
    assert!(scene.boundaries.is_empty());
    assert_eq!(session.warnings().len(), 1);
    assert!(session.warnings()[0].contains("walkable area"));
    assert_eq!(session.agents().unwrap().len(), 2);
    assert!(session.on_frame_change(1).is_some());
}

#[test]
fn test_full_paths() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("paths.sqlite");
    write_trajectories(&path, 2, &[0, 1, 2, 3], ("pos_x", "pos_y"), None);
    {
        // Agent 9 has a single point and gets no path.
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "INSERT INTO trajectory_data VALUES (9, 2, 1.0, 1.0)",
            [],
        )
        .unwrap();
    }

    let config = PlaybackConfig {
        load_full_paths: true,
        show_paths: true,
        chunk_size: 1,
        ..Default::default()
    };
    let (_session, scene, status) = load(&path, config);
    assert_eq!(status, LoadStatus::Complete);

    let names: Vec<&str> = scene.paths.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["Path_Agent_1", "Path_Agent_2"]);
    assert_eq!(scene.paths[0].points.len(), 4);
    assert!(scene.paths[0].points.iter().all(|p| p[2] == 0.0));
    assert_eq!(scene.paths[0].thickness, 0.02);
    assert_eq!(scene.paths_visible, Some(true));
    assert_eq!(scene.agent_ids(), vec![1, 2, 9]);
}

#[test]
fn test_display_settings_after_load() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("display.sqlite");
    write_trajectories(&path, 2, &[0, 1, 2], ("pos_x", "pos_y"), None);

    let config = PlaybackConfig {
        load_full_paths: true,
        ..Default::default()
    };
    let (mut session, mut scene, status) = load(&path, config);
    assert_eq!(status, LoadStatus::Complete);
    assert_eq!(scene.paths_visible, Some(false));

    session.set_show_paths(&mut scene, true).unwrap();
    assert_eq!(scene.paths_visible, Some(true));
    assert!(session.config().show_paths);

    session.set_agent_scale(&mut scene, 0.5).unwrap();
    assert!(scene.agents.iter().all(|a| a.scale == 0.5));

    let rejected = session.set_agent_scale(&mut scene, 0.0);
    assert!(matches!(rejected, Err(PlaybackError::ConfigError { .. })));
    assert!(scene.agents.iter().all(|a| a.scale == 0.5));
}

#[test]
fn test_display_settings_rejected_while_loading() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = three_agent_store(&dir);

    let mut session = Session::new();
    let mut scene = RecordingScene::default();
    session.start_load(&path, PlaybackConfig::default()).unwrap();
    assert!(matches!(
        session.set_show_paths(&mut scene, true),
        Err(PlaybackError::LoadInProgress)
    ));
    assert!(matches!(
        session.set_agent_scale(&mut scene, 2.0),
        Err(PlaybackError::LoadInProgress)
    ));
    assert_eq!(run_to_end(&mut session, &mut scene), LoadStatus::Complete);
}

#[test]
fn test_metadata_fps_reaches_scene() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fps.sqlite");
    write_trajectories(&path, 1, &[0, 1], ("pos_x", "pos_y"), None);
    Connection::open(&path)
        .unwrap()
        .execute_batch(
            "CREATE TABLE metadata (key TEXT, value TEXT);
             INSERT INTO metadata VALUES ('version', '2'), ('fps', '25');",
        )
        .unwrap();

    let (session, scene, _) = load(&path, PlaybackConfig::default());
    assert_eq!(scene.frame_range, Some((FrameRange::new(0, 1), Some(25.0))));
    assert_eq!(session.store_metadata().unwrap().version, Some(2));
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_missing_file() {
    let mut session = Session::new();
    let result = session.start_load("/no/such/file.sqlite", PlaybackConfig::default());
    assert!(matches!(result, Err(PlaybackError::NotFound { .. })));
    assert!(!session.is_loading());
}

#[test]
fn test_schema_failure() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.sqlite");
    Connection::open(&path)
        .unwrap()
        .execute_batch("CREATE TABLE trajectory_data (id INTEGER, frame INTEGER, pos_x REAL)")
        .unwrap();

    let (mut session, scene, status) = load(&path, PlaybackConfig::default());
    match &status {
        LoadStatus::Failed { message } => assert!(message.contains("pos_y"), "{message}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(session
        .progress()
        .message
        .starts_with("Failed to load simulation: "));
    assert!(!session.is_hook_installed());
    assert!(!session.is_store_open());
    assert!(session.on_frame_change(0).is_none());
    assert_eq!(scene.collections_prepared, 0);
}

#[test]
fn test_scene_error_aborts_load() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = three_agent_store(&dir);

    let mut session = Session::new();
    let mut scene = RecordingScene::failing_on_agent(2);
    session.start_load(&path, PlaybackConfig::default()).unwrap();
    let status = run_to_end(&mut session, &mut scene);

    assert!(matches!(status, LoadStatus::Failed { .. }));
    assert_eq!(scene.agent_ids(), vec![1]);
    assert!(scene.frame_range.is_none());
    assert!(!session.is_hook_installed());
}

#[test]
fn test_empty_store() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.sqlite");
    write_trajectories(&path, 0, &[], ("pos_x", "pos_y"), None);

    let (session, scene, status) = load(&path, PlaybackConfig::default());
    assert_eq!(status, LoadStatus::Complete);
    assert_eq!(session.frame_range(), Some(FrameRange::new(0, 0)));
    assert!(scene.agents.is_empty());
}

// ============================================================================
// Concurrency and lifecycle
// ============================================================================

#[test]
fn test_reentrant_load_rejected() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = three_agent_store(&dir);

    let mut session = Session::new();
    session.start_load(&path, PlaybackConfig::default()).unwrap();
    let before = session.progress().clone();

    let second = session.start_load(&path, PlaybackConfig::default());
    assert!(matches!(second, Err(PlaybackError::LoadInProgress)));
    assert_eq!(session.progress(), &before);
    assert!(session.is_loading());

    let mut scene = RecordingScene::default();
    assert_eq!(run_to_end(&mut session, &mut scene), LoadStatus::Complete);
    assert_eq!(scene.collections_prepared, 1);
}

#[test]
fn test_cancel_during_agent_creation() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fifty.sqlite");
    write_trajectories(&path, 50, &[0, 1, 2], ("pos_x", "pos_y"), None);

    let config = PlaybackConfig {
        chunk_size: 1,
        ..Default::default()
    };
    let mut session = Session::new();
    let mut scene = RecordingScene::default();
    session.start_load(&path, config.clone()).unwrap();

    for _ in 0..5_000 {
        if session.current_stage() == Some(Stage::CreatingAgents) {
            break;
        }
        assert_eq!(session.tick(&mut scene), TickOutcome::Running);
        thread::sleep(Duration::from_millis(2));
    }
    for _ in 0..3 {
        assert_eq!(session.tick(&mut scene), TickOutcome::Running);
    }
    assert_eq!(scene.agents.len(), 3);

    assert!(session.request_cancel());
    let outcome = session.tick(&mut scene);
    assert_eq!(
        outcome,
        TickOutcome::Finished(LoadStatus::Cancelled {
            partial_data_retained: true
        })
    );
    assert_eq!(session.progress().message, "Load cancelled (partial data kept)");
    assert!(!session.progress().in_progress);
    assert!(!session.is_loading());

    // Created objects and loaded metadata stay; the hook and store do not.
    assert_eq!(scene.agents.len(), 3);
    assert_eq!(session.agents().unwrap().len(), 50);
    assert!(!session.is_hook_installed());
    assert!(!session.is_store_open());
    assert_eq!(session.tick(&mut scene), TickOutcome::Idle);

    // A fresh load afterwards runs to completion.
    let mut scene = RecordingScene::default();
    session.start_load(&path, config).unwrap();
    assert_eq!(run_to_end(&mut session, &mut scene), LoadStatus::Complete);
    assert_eq!(scene.agents.len(), 50);
    assert!(session.on_frame_change(1).is_some());
}

#[test]
fn test_cancel_while_loading_metadata() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = three_agent_store(&dir);

    let mut session = Session::new();
    let mut scene = RecordingScene::default();
    session.start_load(&path, PlaybackConfig::default()).unwrap();
    assert_eq!(session.current_stage(), Some(Stage::LoadingMetadata));
    assert!(session.request_cancel());

    let status = run_to_end(&mut session, &mut scene);
    assert!(matches!(status, LoadStatus::Cancelled { .. }));
    assert_eq!(scene.collections_prepared, 0);
    assert!(!session.is_hook_installed());
}

#[test]
fn test_teardown_and_reinstall() {
    let dir = TempDir::new().unwrap();
    let (mut session, _scene, _) = load(&three_agent_store(&dir), PlaybackConfig::default());

    assert!(session.on_frame_change(20).is_some());
    assert!(session.is_store_open());

    session.teardown();
    assert!(!session.is_store_open());
    assert!(!session.is_hook_installed());
    assert!(session.on_frame_change(20).is_none());

    // The store reopens lazily on the next query.
    assert!(session.install_live_hook());
    assert_eq!(session.on_frame_change(20).unwrap().iter_visible().count(), 3);
    assert!(session.is_store_open());

    let stats = session.stats();
    assert_eq!(stats.agent_count, 3);
    assert_eq!(stats.mode, Some(QueryMode::Streaming));
    assert_eq!(stats.live_query_failures, 0);
}
