use anyhow::Result;
use clap::{Parser, Subcommand};
use revlens_core::StreamFrame;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "revlens")]
#[command(about = "RevLens review intelligence engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API server.
    Serve,
    /// Create or update the database schema.
    Migrate,
    /// Analyze one product from the terminal and print the report as JSON.
    Analyze {
        /// Product name to analyze, e.g. "sony wh-1000xm5".
        query: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => revlens_server::serve_from_env().await?,
        Commands::Migrate => {
            let Some(db) = revlens_store::Db::connect_from_env().await else {
                anyhow::bail!("DATABASE_URL not set or database unreachable");
            };
            db.ensure_schema().await?;
            println!("schema up to date");
        }
        Commands::Analyze { query } => analyze(&query).await?,
    }
    Ok(())
}

async fn analyze(query: &str) -> Result<()> {
    let state = revlens_server::build_state_from_env().await?;
    let job = state.orchestrator.submit(query, true).await;
    let (history, mut rx) = state
        .orchestrator
        .store()
        .subscribe(job.id)
        .await
        .expect("job just created");

    let mut frames = history;
    while !frames.iter().any(StreamFrame::is_terminal) {
        match rx.recv().await {
            Ok(frame) => frames.push(frame),
            Err(_) => break,
        }
    }
    for frame in &frames {
        match frame {
            StreamFrame::Progress {
                stage,
                message,
                step,
                total_steps,
            } => eprintln!("[{step}/{total_steps}] {stage}: {message}"),
            StreamFrame::Complete { data } => {
                println!("{}", serde_json::to_string_pretty(data)?);
            }
            StreamFrame::Cancelled {} => eprintln!("cancelled"),
            StreamFrame::Error { message, code } => {
                anyhow::bail!("analysis failed ({code}): {message}");
            }
            StreamFrame::Partial { .. } => {}
        }
    }
    Ok(())
}
