use std::time::Duration;

use warren::{
    channel::QueueDeclareArguments,
    recovery::{RecoverableConnection, RecoveryBackoffPolicy, RecoveryState},
};
mod common;

/// Needs the broker to kill the connection while the test waits, e.g.
/// `rabbitmqctl close_all_connections "recovery test"` within 30 seconds.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "needs a RabbitMQ on localhost:5672 and a manual connection kill"]
async fn test_recover_after_forced_close() {
    common::setup_logging();
    let args = common::build_conn_args()
        .connection_name("warren recovery test")
        .recovery_backoff(RecoveryBackoffPolicy::fixed(Duration::from_secs(1), 30))
        .finish();
    let connection = RecoverableConnection::open(&args).await.unwrap();
    let channel = connection.open_channel().await.unwrap();
    let queue_name = common::unique_name("recovery");
    let mut declare = QueueDeclareArguments::new(&queue_name);
    declare.auto_delete = true;
    channel.queue_declare(declare).await.unwrap();

    let mut state = connection.state_watch();
    tokio::time::timeout(
        Duration::from_secs(30),
        state.wait_for(|s| *s == RecoveryState::Recovering),
    )
    .await
    .unwrap()
    .unwrap();
    tokio::time::timeout(
        Duration::from_secs(30),
        state.wait_for(|s| *s == RecoveryState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    let mut passive = QueueDeclareArguments::new(&queue_name);
    passive.passive = true;
    channel.queue_declare(passive).await.unwrap();
    connection.close().await.unwrap();
}
