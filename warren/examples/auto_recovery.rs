//! Keeps consuming across broker restarts, e.g. `rabbitmqctl stop_app && rabbitmqctl start_app`.

use std::time::Duration;

use tracing::{info, Level};
use warren::{
    channel::{BasicConsumeArguments, QueueDeclareArguments},
    connection::OpenConnectionArguments,
    consumer::DefaultConsumer,
    recovery::{RecoverableConnection, RecoveryBackoffPolicy, RecoveryEvent, RecoveryState},
};

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let args = OpenConnectionArguments::new("localhost", 5672, "guest", "guest")
        .add_endpoint("localhost", 5673)
        .recovery_backoff(RecoveryBackoffPolicy::exponential(
            Duration::from_millis(500),
            Duration::from_secs(10),
            20,
        ))
        .finish();
    let connection = RecoverableConnection::open(&args).await.unwrap();
    connection.events().subscribe(|event: &RecoveryEvent| match event {
        RecoveryEvent::RecoverySucceeded { attempts, endpoint } => {
            info!("recovered on {} after {} attempts", endpoint, attempts)
        }
        other => info!("recovery event: {:?}", other),
    });

    let channel = connection.open_channel().await.unwrap();
    let mut declare = QueueDeclareArguments::new("warren.recovery.example");
    declare.durable = true;
    channel.queue_declare(declare).await.unwrap();
    channel
        .basic_consume(
            DefaultConsumer::new(false),
            BasicConsumeArguments::new("warren.recovery.example", ""),
        )
        .await
        .unwrap();

    let mut state = connection.state_watch();
    while state.changed().await.is_ok() {
        let current = *state.borrow();
        info!("connection state {:?}", current);
        if matches!(current, RecoveryState::Failed | RecoveryState::Closed) {
            break;
        }
    }
}
