use clap::Parser;
use guardian::app::App;
use guardian::cli::Cli;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match App::new(cli).await {
        Ok(app) => app.run().await,
        Err(e) => {
            // Logging may not be installed yet if config loading failed.
            eprintln!("guardian failed to start: {e:#}");
            ExitCode::FAILURE
        }
    }
}
