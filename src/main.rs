//! Harmonoids headless runner
//!
//! Loads a level, plays it at a fixed timestep without audio or drawing and
//! prints the outcome. Useful for checking level documents and share codes.
//!
//! Usage: `harmonoids [LEVEL_PATH] [--share CODE] [--settings PATH] [--seed N] [--seconds N]`

#[cfg(not(target_arch = "wasm32"))]
use std::path::PathBuf;

#[cfg(not(target_arch = "wasm32"))]
use clap::Parser;
#[cfg(not(target_arch = "wasm32"))]
use harmonoids::Settings;
#[cfg(not(target_arch = "wasm32"))]
use harmonoids::audio::Mixer;
#[cfg(not(target_arch = "wasm32"))]
use harmonoids::consts::SIM_DT;
#[cfg(not(target_arch = "wasm32"))]
use harmonoids::sim::{ArcadePhysics, Command, GameEvent, LevelSource, Simulation, TickInput, tick};

#[cfg(not(target_arch = "wasm32"))]
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    /// Level document (JSON); the bundled level when omitted
    #[arg(value_name = "LEVEL_PATH")]
    level: Option<PathBuf>,

    /// Share code to load instead of a level file
    #[arg(long, conflicts_with = "level")]
    share: Option<String>,

    /// Path to settings JSON
    #[arg(long)]
    settings: Option<PathBuf>,

    /// RNG seed (overrides settings)
    #[arg(long)]
    seed: Option<u64>,

    /// Longest stretch of simulated time to run
    #[arg(long, default_value_t = 120.0)]
    seconds: f32,
}

#[cfg(not(target_arch = "wasm32"))]
impl Args {
    fn source(&self) -> LevelSource {
        if let Some(code) = &self.share {
            return LevelSource::ShareCode(code.clone());
        }
        let Some(path) = &self.level else {
            return LevelSource::Bundled;
        };
        match std::fs::read_to_string(path) {
            Ok(json) => LevelSource::Json(json),
            Err(e) => {
                log::error!("Cannot read level {}: {}", path.display(), e);
                LevelSource::Bundled
            }
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn main() {
    env_logger::init();
    log::info!("Harmonoids (headless) starting...");

    let args = Args::parse();
    let mut settings = match &args.settings {
        Some(path) => Settings::load_or_default(path),
        None => Settings::default(),
    };
    if let Some(seed) = args.seed {
        settings.seed = seed;
    }

    let physics = ArcadePhysics::new(settings.gravity);
    let mixer = Mixer::disabled(settings.max_voices);
    let mut sim = Simulation::new(settings, Box::new(physics), mixer);
    sim.load(&args.source());

    let seconds = args.seconds.max(0.0);
    let steps = (seconds / SIM_DT).ceil() as u64;
    tick(&mut sim, &TickInput::with(Command::Start), SIM_DT);
    for _ in 0..steps {
        if sim.phase().is_terminal() {
            break;
        }
        tick(&mut sim, &TickInput::default(), SIM_DT);
        for event in sim.drain_events() {
            match event {
                GameEvent::Saved(id) => log::info!("Saved {:?}", id),
                GameEvent::Lost(id) => log::info!("Lost {:?}", id),
                other => log::trace!("{:?}", other),
            }
        }
    }

    let session = sim.session();
    let name = sim.level().map(|l| l.name.as_str()).unwrap_or("?");
    println!(
        "{}: {:?} after {:.1}s, saved {}/{} ({:.0}%), lost {}",
        name,
        sim.phase(),
        sim.clock(),
        session.saved,
        session.total_spawned,
        session.rescue_ratio() * 100.0,
        session.lost
    );
}

#[cfg(target_arch = "wasm32")]
fn main() {
    // Hosts embed the library directly; there is no wasm binary
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "harmonoids",
            "level.json",
            "--settings",
            "settings.json",
            "--seed",
            "7",
            "--seconds",
            "30",
        ])
        .unwrap();
        assert_eq!(args.level, Some(PathBuf::from("level.json")));
        assert_eq!(args.settings, Some(PathBuf::from("settings.json")));
        assert_eq!(args.seed, Some(7));
        assert_eq!(args.seconds, 30.0);
        assert!(args.share.is_none());
    }

    #[test]
    fn test_args_defaults_to_bundled() {
        let args = Args::try_parse_from(["harmonoids"]).unwrap();
        assert_eq!(args.seconds, 120.0);
        assert!(matches!(args.source(), LevelSource::Bundled));
    }

    #[test]
    fn test_bad_values_are_reported() {
        assert!(Args::try_parse_from(["harmonoids", "--seed", "abc"]).is_err());
        assert!(Args::try_parse_from(["harmonoids", "--seconds", "soon"]).is_err());
        assert!(Args::try_parse_from(["harmonoids", "--seed"]).is_err());
        assert!(Args::try_parse_from(["harmonoids", "--frobnicate"]).is_err());
        assert!(Args::try_parse_from(["harmonoids", "a.json", "--share", "abc"]).is_err());
    }

    #[test]
    fn test_share_code_source() {
        let args = Args::try_parse_from(["harmonoids", "--share", "abc"]).unwrap();
        assert!(matches!(args.source(), LevelSource::ShareCode(code) if code == "abc"));
    }
}
