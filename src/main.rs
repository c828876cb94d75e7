use clap::Parser;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cloud_tasks_emulator::names;
use cloud_tasks_emulator::proto::google::cloud::tasks::v2::CreateQueueRequest;
use cloud_tasks_emulator::proto::{CloudTasksServer, Queue};
use cloud_tasks_emulator::{Server, ServerOptions};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The host name
    #[arg(long, default_value = "localhost")]
    host: String,

    /// The port
    #[arg(long, default_value_t = 8123)]
    port: u16,

    /// Force the 'Purge Queue' call to perform a hard reset of all state
    /// (differs from production)
    #[arg(long)]
    hard_reset_on_purge_queue: bool,

    /// A queue to create on startup (repeat as required)
    #[arg(long = "queue")]
    queues: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let emulator = Server::new(ServerOptions {
        hard_reset_on_purge_queue: args.hard_reset_on_purge_queue,
    });

    for name in &args.queues {
        info!("Creating initial queue {}", name);
        emulator.create_queue(CreateQueueRequest {
            parent: names::parent_of_queue(name).to_string(),
            queue: Some(Queue {
                name: name.clone(),
                ..Default::default()
            }),
        })?;
    }

    let listener = TcpListener::bind(format!("{}:{}", args.host, args.port)).await?;
    info!(
        "Starting cloud tasks emulator, listening on {}:{}",
        args.host, args.port
    );

    tonic::transport::Server::builder()
        .add_service(CloudTasksServer::new(emulator))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
