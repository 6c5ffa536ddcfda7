//! Load a trajectory file without a renderer and scrub through it.
//!
//! Usage:
//!   cargo run --example headless_replay -- <trajectories.sqlite> [config.json]
//!
//! Set `RUST_LOG=info` (or `debug`) to see pipeline logs.

use std::process::ExitCode;
use std::thread;

use crowd_replay::{PlaybackConfig, RecordingScene, Session, TickOutcome};

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: headless_replay <trajectories.sqlite> [config.json]");
        return ExitCode::from(2);
    };

    let config = match args.next() {
        Some(config_path) => {
            let loaded = std::fs::read_to_string(&config_path)
                .map_err(|e| e.to_string())
                .and_then(|json| PlaybackConfig::from_json(&json).map_err(|e| e.to_string()));
            match loaded {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("invalid config {config_path}: {e}");
                    return ExitCode::from(2);
                }
            }
        }
        None => PlaybackConfig::default(),
    };

    let mut session = Session::new();
    let mut scene = RecordingScene::default();
    if let Err(e) = session.start_load(&path, config) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let status = loop {
        match session.tick(&mut scene) {
            TickOutcome::Finished(status) => break status,
            TickOutcome::Idle => return ExitCode::FAILURE,
            TickOutcome::Running => {
                let progress = session.progress();
                println!("{:5.1}%  {}", progress.progress_pct, progress.message);
                thread::sleep(session.config().tick_interval());
            }
        }
    };
    println!("{}", status.message());
    if !status.is_complete() {
        return ExitCode::FAILURE;
    }

    for warning in session.warnings() {
        println!("warning: {warning}");
    }
    println!(
        "{} agents, {} boundary curves, {} paths",
        scene.agents.len().max(scene.point_cloud.map_or(0, |(n, _)| n)),
        scene.boundaries.len(),
        scene.paths.len()
    );

    let Some(range) = session.frame_range() else {
        return ExitCode::SUCCESS;
    };
    let stride = (range.len() / 10).max(1) as usize;
    for frame in (range.min_frame..=range.max_frame).step_by(stride) {
        if let Some(view) = session.on_frame_change(frame) {
            println!("frame {frame}: {} agents visible", view.iter_visible().count());
        }
    }

    println!("{:?}", session.stats());
    ExitCode::SUCCESS
}
