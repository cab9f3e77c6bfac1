use std::path::PathBuf;

use clap::{Parser, Subcommand};
use regsync_core::{Config, Stage};

/// Staged ingestion and reconciliation of the public grants registry.
#[derive(Parser, Debug)]
#[command(name = "regsync", version, about)]
pub struct CliArgs {
    /// Configuration profile; keys are looked up as `{PROFILE}_{KEY}` first
    #[arg(long, global = true, env = "REGSYNC_PROFILE")]
    pub profile: Option<String>,

    /// Root directory for artifacts, ledgers, incidents and changesets
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl CliArgs {
    /// Environment config with command-line overrides applied.
    pub fn config(&self) -> Config {
        let mut config = match &self.profile {
            Some(profile) => Config::for_profile(profile),
            None => Config::from_env(),
        };
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = dir.clone();
        }
        config
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the work units of one year (existing units are left untouched)
    Bootstrap {
        #[arg(long)]
        year: i32,

        #[arg(long)]
        entity: Option<String>,

        /// Comma-separated subtypes, e.g. `C,A,L,O`
        #[arg(long, value_delimiter = ',')]
        subtypes: Option<Vec<String>>,
    },

    /// Claim and run units of one stage until none is claimable
    RunStage {
        stage: Stage,

        #[arg(long)]
        year: i32,

        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=12))]
        month: Option<u32>,

        #[arg(long)]
        subtype: Option<String>,

        #[arg(long)]
        entity: Option<String>,
    },

    /// Run all three stages with a pool of workers per stage
    RunPipeline {
        #[arg(long)]
        year: i32,

        #[arg(long)]
        workers: Option<usize>,

        #[arg(long)]
        entity: Option<String>,
    },

    /// Move `error` units (and optionally stale `running` ones) back to `pending`
    Requeue {
        #[arg(long)]
        year: Option<i32>,

        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=12))]
        month: Option<u32>,

        #[arg(long)]
        stage: Option<Stage>,

        #[arg(long)]
        subtype: Option<String>,

        #[arg(long)]
        include_running: bool,
    },

    /// Unit counts per stage and status
    Status {
        #[arg(long)]
        year: Option<i32>,

        #[arg(long)]
        entity: Option<String>,
    },

    /// Diff remote awards against the store over a sliding window
    Reconcile {
        #[arg(long)]
        window_months: Option<u32>,

        /// Report counts without recording a sync run or writing a changeset
        #[arg(long)]
        dry_run: bool,
    },

    /// Apply one changeset to the store
    Apply {
        changeset_id: String,

        #[arg(long)]
        dry_run: bool,
    },

    /// Aggregate maintenance
    Stats {
        #[command(subcommand)]
        command: StatsCommand,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum StatsCommand {
    /// Clear and re-derive every aggregate from the current facts
    Recompute,
    /// Compare maintained aggregates against the facts; never repairs
    Verify,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Bootstrap { .. } => "bootstrap",
            Command::RunStage { .. } => "run-stage",
            Command::RunPipeline { .. } => "run-pipeline",
            Command::Requeue { .. } => "requeue",
            Command::Status { .. } => "status",
            Command::Reconcile { .. } => "reconcile",
            Command::Apply { .. } => "apply",
            Command::Stats { command: StatsCommand::Recompute } => "stats recompute",
            Command::Stats { command: StatsCommand::Verify } => "stats verify",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_run_stage_parses_stage_and_scope() {
        let args = CliArgs::try_parse_from(["regsync", "run-stage", "transform", "--year", "2024", "--month", "3"]).unwrap();
        match args.command {
            Command::RunStage { stage, year, month, subtype, .. } => {
                assert_eq!(stage, Stage::Transform);
                assert_eq!(year, 2024);
                assert_eq!(month, Some(3));
                assert!(subtype.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_month_out_of_range_is_rejected() {
        assert!(CliArgs::try_parse_from(["regsync", "run-stage", "load", "--year", "2024", "--month", "13"]).is_err());
    }

    #[test]
    fn test_bootstrap_subtypes_are_comma_separated() {
        let args = CliArgs::try_parse_from(["regsync", "bootstrap", "--year", "2024", "--subtypes", "C,A"]).unwrap();
        match args.command {
            Command::Bootstrap { subtypes, .. } => assert_eq!(subtypes.unwrap(), vec!["C", "A"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_stats_subcommand_names() {
        let args = CliArgs::try_parse_from(["regsync", "stats", "verify"]).unwrap();
        assert_eq!(args.command.name(), "stats verify");
    }
}
