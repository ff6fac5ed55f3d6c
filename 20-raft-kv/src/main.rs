use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use raft_kv::{
    cli::{ClientArgs, Cli, Command, ServeArgs},
    client::Clerk,
    cluster::LocalCluster,
    console::{Console, ConsoleCommand, Outcome},
    server::ServerConfig,
    transport::TcpTransport,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::Get(args) => {
            let value = clerk(&args.client).get(&args.key).await?;
            println!("{value}");
        }
        Command::Put(args) => clerk(&args.client).put(&args.key, &args.value).await?,
        Command::Append(args) => clerk(&args.client).append(&args.key, &args.value).await?,
    }

    Ok(())
}

fn clerk(args: &ClientArgs) -> Clerk<TcpTransport> {
    let transport = TcpTransport::new(args.server.clone())
        .with_call_timeout(Duration::from_millis(args.call_timeout_ms));
    Clerk::new(transport)
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = ServerConfig {
        apply_timeout: Duration::from_millis(args.apply_timeout_ms),
        ..ServerConfig::default()
    }
    .with_max_raft_state(args.max_raft_state);

    let cluster = LocalCluster::start(args.replicas, config)?;
    cluster.elect(0)?;
    let mut console = Console::start(cluster, args.listen).await?;
    let addrs: Vec<String> = console.addrs().iter().map(ToString::to_string).collect();
    info!(servers = %addrs.join(","), "replica group ready");
    println!("Replica group ready. Type HELP (or h) for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match ConsoleCommand::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                println!("error: {err}");
                continue;
            }
        };
        match console.execute(command).await {
            Ok(Outcome::Print(output)) => println!("{output}"),
            Ok(Outcome::Exit) => break,
            Err(err) => {
                warn!(error = ?err, "command failed");
                println!("error: {err:#}");
            }
        }
    }

    console.shutdown().await;
    info!("replica group stopped");
    Ok(())
}
