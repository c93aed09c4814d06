use clap::Parser;
use tracing_subscriber::EnvFilter;

use budgetvault::cli::{commands, output, Cli, Commands};

/// Environment variable holding the log filter (e.g. `budgetvault=debug`).
const LOG_ENV: &str = "BUDGETVAULT_LOG";

fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays scriptable.
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::GenMasterKey => commands::gen_master_key::execute(),
        Commands::Backfill { ref user, dry_run } => commands::backfill::execute(&cli, user, dry_run),
        Commands::Status { ref user, json } => commands::status::execute(&cli, user, json),
        Commands::Verify { ref user } => commands::verify::execute(&cli, user),
        Commands::SetupRecovery { ref user } => commands::recovery::execute_setup(&cli, user),
        Commands::Recover { ref user } => commands::recovery::execute_recover(&cli, user),
        Commands::ChangeSecret { ref user } => commands::change_secret::execute(&cli, user),
    };

    if let Err(e) = result {
        output::error(&e.to_string());
        std::process::exit(1);
    }
}
