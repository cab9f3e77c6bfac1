mod app;
mod cli;

use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use regsync_core::config::load_dotenv;
use regsync_core::RunSummary;
use tracing::error;

use crate::app::App;
use crate::cli::CliArgs;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let args = CliArgs::parse();
    let config = args.config();
    config.log_summary();

    let name = args.command.name();
    let started = Instant::now();
    let result = match App::connect(config).await {
        Ok(app) => app.run(args.command).await,
        Err(e) => Err(e),
    };
    let mut summary = result.unwrap_or_else(|e| {
        error!(command = name, error = %format!("{e:#}"), "command aborted");
        RunSummary::fatal(name, format!("{e:#}"))
    });
    summary.duration = started.elapsed();
    summary.log();
    print_summary(&summary);
    summary.exit_status().into()
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("── {} ──", summary.command);
    println!("  processed:    {}", summary.processed);
    println!("  succeeded:    {}", summary.succeeded);
    println!("  failed:       {}", summary.failed);
    println!("  success rate: {:.1}%", summary.success_rate());
    if let Some(path) = &summary.incidents_file {
        println!("  incidents:    {}", path.display());
    }
    if let Some(err) = &summary.fatal {
        println!("  aborted:      {}", err);
    }
    println!("  duration:     {} ms", summary.duration.as_millis());
}
