// covid-consult/crates/covid-consult/src/main.rs

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use covid_consult::{config::Config, run_server, shared_state::build_index_engine, vector_index::load_corpus};
#[cfg(feature = "cli")]
use dotenvy::dotenv;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "covid-consult", version, about = "Retrieval-augmented COVID-19 consultation service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Load (or build) the index and serve the HTTP API
    Serve,
    /// Re-embed the corpus in DATA_DIRECTORY, write the artifact pair and exit
    BuildIndex,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    let cfg = Config::from_env()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(cfg).await,
        Command::BuildIndex => {
            covid_consult::telemetry::init_tracing();
            cfg.print_config();
            let engine = build_index_engine(&cfg)?;
            let documents = load_corpus(&cfg.data_directory)?;
            let index = engine.build(documents).await?;
            println!(
                "Index built: {} documents, dimension {}, written to {}",
                index.len(),
                index.dimension(),
                cfg.index_directory.display()
            );
            Ok(())
        }
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
