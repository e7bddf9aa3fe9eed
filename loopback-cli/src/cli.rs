use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Measures gain, THD and peak frequency across an audio loopback path
#[derive(Parser)]
#[command(name = "loopback", version, about)]
pub struct Cli {
    /// TOML configuration file (defaults are used when omitted)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Play a tone through the loopback path and measure the round trip
    Run {
        /// Test frequency in Hz; unusable values fall back to 1000 Hz
        #[arg(long)]
        frequency: Option<String>,
        /// Replace the audio hardware with a virtual cable
        #[arg(long, value_enum)]
        simulate: Option<Simulation>,
        /// Write WAV and spectrum files of the cycle to this directory
        #[arg(long)]
        capture_dir: Option<PathBuf>,
    },
    /// Analyze the first channel of a WAV file
    Analyze {
        /// Path to the WAV file
        wav: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Simulation {
    /// Perfect cable: recording equals playback
    Echo,
    /// Attenuating, delaying cable with 2nd and 3rd order distortion
    Distorted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_free_text_frequency() {
        let cli = Cli::parse_from(["loopback", "run", "--frequency", "abc", "--simulate", "echo"]);
        match cli.command {
            Command::Run { frequency, simulate, capture_dir } => {
                assert_eq!(frequency.as_deref(), Some("abc"));
                assert_eq!(simulate, Some(Simulation::Echo));
                assert!(capture_dir.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::parse_from(["loopback", "analyze", "take.wav", "--json", "--config", "rig.toml"]);
        assert!(cli.json);
        assert_eq!(cli.config, Some(PathBuf::from("rig.toml")));
        assert!(matches!(cli.command, Command::Analyze { .. }));
    }

    #[test]
    fn unknown_simulation_is_rejected() {
        assert!(Cli::try_parse_from(["loopback", "run", "--simulate", "tape"]).is_err());
    }
}
