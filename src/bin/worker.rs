//! One-shot stage worker.
//!
//! `cube-worker <orchestrate|merge|blend|posblend|publish> [file]` reads one
//! JSON payload from the file argument or stdin, runs the stage against the
//! stores configured in the environment, prints any activities the run fanned
//! out (one JSON object per line) and exits zero only when the work ended
//! `DONE`.

use std::io::Read;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

use cube_builder::config::Config;
use cube_builder::dispatcher;
use cube_builder::models::{Activity, ActivityStatus};
use cube_builder::orchestrator::{start_cube_build, CubeStartRequest};
use cube_builder::queue::MemoryQueue;
use cube_builder::services::Services;

fn read_input(path: Option<&str>) -> anyhow::Result<String> {
    match path {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            Ok(buffer)
        }
    }
}

fn drain_children(rx: &mut UnboundedReceiver<Activity>) -> anyhow::Result<usize> {
    let mut count = 0;
    while let Ok(child) = rx.try_recv() {
        println!("{}", serde_json::to_string(&child)?);
        count += 1;
    }
    Ok(count)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cube_builder=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1).map(String::as_str) else {
        eprintln!("usage: cube-worker <orchestrate|merge|blend|posblend|publish> [file]");
        std::process::exit(2);
    };

    let config = Config::from_env();
    let (queue, mut rx) = MemoryQueue::channel();
    let services = Arc::new(Services::from_config(&config, Arc::new(queue))?);

    let input = read_input(args.get(2).map(String::as_str))?;

    match command {
        "orchestrate" => {
            let request: CubeStartRequest = serde_json::from_str(&input)?;
            let summary = start_cube_build(&services, &request).await?;
            let scheduled = drain_children(&mut rx)?;
            tracing::info!(
                "orchestrated {} tiles / {} periods, {} activities scheduled, {} skipped",
                summary.tiles,
                summary.periods,
                scheduled,
                summary.skipped.len()
            );
        }
        "merge" | "blend" | "posblend" | "publish" => {
            let activity: Activity = serde_json::from_str(&input)?;
            anyhow::ensure!(
                activity.action() == command,
                "activity action {} does not match command {command}",
                activity.action()
            );

            let finished = dispatcher::run_activity(&services, activity).await;
            drain_children(&mut rx)?;

            match finished.mystatus {
                ActivityStatus::Done => {}
                _ => {
                    if let Some(error) = &finished.errors {
                        eprintln!("{error}");
                    }
                    std::process::exit(1);
                }
            }
        }
        other => {
            eprintln!("unknown command {other}");
            std::process::exit(2);
        }
    }

    Ok(())
}
