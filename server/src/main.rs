use clap::Parser;

use common_match::config::Settings;
use common_match::telemetry;

#[derive(Debug, Parser)]
#[command(author, version, about = "VeloType match core server")]
struct ServerCli {
    /// Overrides the PORT environment variable.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    telemetry::init("server");

    let cli = ServerCli::parse();

    let mut settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            tracing::error!(%err, "server: configuration rejected");
            return;
        }
    };
    if let Some(port) = cli.port {
        settings.port = port;
    }

    if let Err(err) = server::run_with_ctrl_c(settings).await {
        tracing::error!(%err, "server exited with error");
    }
}
