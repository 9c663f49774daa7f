use bytes::Bytes;
use tokio::time;
use tracing::Level;
use warren::{
    channel::{
        BasicConsumeArguments, BasicPublishArguments, ChannelEvent, QueueBindArguments,
        QueueDeclareArguments,
    },
    connection::{Connection, OpenConnectionArguments},
    consumer::DefaultConsumer,
    BasicProperties,
};

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let args = OpenConnectionArguments::new("localhost", 5672, "guest", "guest")
        .connection_name("warren-pub-sub")
        .finish();
    let connection = Connection::open(&args).await.unwrap();
    let channel = connection.open_channel().await.unwrap();

    // unroutable mandatory messages come back as channel events
    channel.events().subscribe(|event: &ChannelEvent| {
        if let ChannelEvent::Returned(returned) = event {
            tracing::warn!(
                "returned by server: {} {}, routing key {}",
                returned.reply_code,
                returned.reply_text,
                returned.routing_key
            );
        }
    });

    // server-named, exclusive queue bound to the topic exchange
    let mut declare = QueueDeclareArguments::new("");
    declare.exclusive = true;
    let (queue, _, _) = channel
        .queue_declare(declare)
        .await
        .unwrap()
        .unwrap();
    channel
        .queue_bind(QueueBindArguments::new(&queue, "amq.topic", "orders.#"))
        .await
        .unwrap();

    let consume = BasicConsumeArguments::new(&queue, "");
    let tag = channel
        .basic_consume(DefaultConsumer::new(consume.no_ack), consume)
        .await
        .unwrap();
    tracing::info!("consuming from {} as {}", queue, tag);

    let mut publish = BasicPublishArguments::new("amq.topic", "orders.created");
    publish.mandatory = true;
    let properties = BasicProperties::default()
        .set_content_type("application/json")
        .finish();
    channel
        .basic_publish(
            publish.clone(),
            properties.clone(),
            Bytes::from_static(br#"{"order": 1}"#),
        )
        .await
        .unwrap();

    // nothing is bound to `invoices.#`, the server returns it
    publish.routing_key = "invoices.created".to_owned();
    channel
        .basic_publish(publish, properties, Bytes::from_static(br#"{"invoice": 1}"#))
        .await
        .unwrap();

    time::sleep(time::Duration::from_secs(1)).await;

    channel.close().await.unwrap();
    connection.close().await.unwrap();
}
