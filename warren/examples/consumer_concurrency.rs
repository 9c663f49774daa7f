//! Handle up to 8 deliveries at a time on one channel.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time;
use tracing::{info, Level};
use warren::{
    channel::{
        BasicAckArguments, BasicConsumeArguments, BasicPublishArguments, BasicQosArguments,
        Channel, QueueDeclareArguments,
    },
    connection::{Connection, OpenConnectionArguments},
    consumer::{Consumer, Delivery},
    BasicProperties,
};

struct SlowWorker;

#[async_trait]
impl Consumer for SlowWorker {
    async fn on_delivery(&self, channel: &Channel, delivery: Delivery) {
        info!(
            "start job {}",
            String::from_utf8_lossy(&delivery.body)
        );
        time::sleep(time::Duration::from_millis(500)).await;
        channel
            .basic_ack(BasicAckArguments::new(delivery.delivery_tag, false))
            .await
            .ok();
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let args = OpenConnectionArguments::new("localhost", 5672, "guest", "guest")
        .consumer_dispatch_concurrency(8)
        .finish();
    let connection = Connection::open(&args).await.unwrap();
    let channel = connection.open_channel().await.unwrap();

    let (queue_name, ..) = channel
        .queue_declare(QueueDeclareArguments::new(""))
        .await
        .unwrap()
        .unwrap();
    // prefetch bounds what the channel buffers for its consumers
    channel
        .basic_qos(BasicQosArguments::new(0, 32, false))
        .await
        .unwrap();
    channel
        .basic_consume(SlowWorker, BasicConsumeArguments::new(&queue_name, ""))
        .await
        .unwrap();

    for i in 0..32 {
        channel
            .basic_publish(
                BasicPublishArguments::new("", &queue_name),
                BasicProperties::default(),
                Bytes::from(format!("job-{}", i)),
            )
            .await
            .unwrap();
    }

    // 32 jobs of 500ms each, 8 at a time
    time::sleep(time::Duration::from_secs(3)).await;
    channel.close().await.unwrap();
    connection.close().await.unwrap();
}
