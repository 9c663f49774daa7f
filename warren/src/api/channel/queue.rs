use super::Channel;
use crate::{
    api::Result,
    frame::{
        short_str, FieldTable, Method, QueueBind, QueueBindOk, QueueDeclare, QueueDeclareOk, QueueDelete,
        QueueDeleteOk, QueuePurge, QueuePurgeOk, QueueUnbind, QueueUnbindOk,
    },
};

#[derive(Debug, Clone)]
pub struct QueueDeclareArguments {
    /// empty asks the server to generate a name
    pub queue: String,
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub no_wait: bool,
    pub arguments: FieldTable,
}

impl QueueDeclareArguments {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_owned(),
            passive: false,
            durable: false,
            exclusive: false,
            auto_delete: false,
            no_wait: false,
            arguments: FieldTable::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueBindArguments {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub no_wait: bool,
    pub arguments: FieldTable,
}

impl QueueBindArguments {
    pub fn new(queue: &str, exchange: &str, routing_key: &str) -> Self {
        Self {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            no_wait: false,
            arguments: FieldTable::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePurgeArguments {
    pub queue: String,
    pub no_wait: bool,
}

impl QueuePurgeArguments {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_owned(),
            no_wait: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueDeleteArguments {
    pub queue: String,
    pub if_unused: bool,
    pub if_empty: bool,
    pub no_wait: bool,
}

impl QueueDeleteArguments {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_owned(),
            if_unused: false,
            if_empty: false,
            no_wait: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueUnbindArguments {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

impl QueueUnbindArguments {
    pub fn new(queue: &str, exchange: &str, routing_key: &str) -> Self {
        Self {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            arguments: FieldTable::new(),
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
impl Channel {
    /// When result is Ok
    ///     - no_wait = false, which means require synchronous response, return `(queue_name, message_count, consumer_count)` wrapped in `Some`
    ///     - no_wait = true, which means no response required, return `None`
    ///
    /// A passive declare of a missing queue makes the server close the channel.
    pub async fn queue_declare(
        &self,
        args: QueueDeclareArguments,
    ) -> Result<Option<(String, u32, u32)>> {
        let mut declare = QueueDeclare {
            queue: short_str(args.queue)?,
            arguments: args.arguments,
            ..Default::default()
        };
        declare.set_passive(args.passive);
        declare.set_durable(args.durable);
        declare.set_exclusive(args.exclusive);
        declare.set_auto_delete(args.auto_delete);
        declare.set_no_wait(args.no_wait);
        if args.no_wait {
            self.cast(declare).await?;
            return Ok(None);
        }
        let reply = self.call(declare, &[QueueDeclareOk::ID]).await?;
        let declare_ok = get_expected_method!(reply.method, Method::QueueDeclareOk)?;
        Ok(Some((
            declare_ok.queue.into(),
            declare_ok.message_count,
            declare_ok.consumer_count,
        )))
    }

    pub async fn queue_bind(&self, args: QueueBindArguments) -> Result<()> {
        let bind = QueueBind {
            queue: short_str(args.queue)?,
            exchange: short_str(args.exchange)?,
            routing_key: short_str(args.routing_key)?,
            no_wait: args.no_wait,
            arguments: args.arguments,
            ..Default::default()
        };
        if args.no_wait {
            self.cast(bind).await
        } else {
            self.call(bind, &[QueueBindOk::ID]).await.map(|_| ())
        }
    }

    /// When result is Ok
    ///     - no_wait = false, which means require synchronous response, return message count wrapped in `Some`
    ///     - no_wait = true, which means no response required, return `None`
    pub async fn queue_purge(&self, args: QueuePurgeArguments) -> Result<Option<u32>> {
        let purge = QueuePurge {
            queue: short_str(args.queue)?,
            no_wait: args.no_wait,
            ..Default::default()
        };
        if args.no_wait {
            self.cast(purge).await?;
            return Ok(None);
        }
        let reply = self.call(purge, &[QueuePurgeOk::ID]).await?;
        let purge_ok = get_expected_method!(reply.method, Method::QueuePurgeOk)?;
        Ok(Some(purge_ok.message_count))
    }

    /// When result is Ok
    ///     - no_wait = false, which means require synchronous response, return message count wrapped in `Some`
    ///     - no_wait = true, which means no response required, return `None`
    pub async fn queue_delete(&self, args: QueueDeleteArguments) -> Result<Option<u32>> {
        let mut delete = QueueDelete {
            queue: short_str(args.queue)?,
            ..Default::default()
        };
        delete.set_if_unused(args.if_unused);
        delete.set_if_empty(args.if_empty);
        delete.set_no_wait(args.no_wait);
        if args.no_wait {
            self.cast(delete).await?;
            return Ok(None);
        }
        let reply = self.call(delete, &[QueueDeleteOk::ID]).await?;
        let delete_ok = get_expected_method!(reply.method, Method::QueueDeleteOk)?;
        Ok(Some(delete_ok.message_count))
    }

    pub async fn queue_unbind(&self, args: QueueUnbindArguments) -> Result<()> {
        let unbind = QueueUnbind {
            queue: short_str(args.queue)?,
            exchange: short_str(args.exchange)?,
            routing_key: short_str(args.routing_key)?,
            arguments: args.arguments,
            ..Default::default()
        };
        self.call(unbind, &[QueueUnbindOk::ID]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{
        QueueBindArguments, QueueDeclareArguments, QueueDeleteArguments, QueuePurgeArguments,
        QueueUnbindArguments,
    };
    use crate::{
        api::{channel::BasicPublishArguments, connection::Connection, error::Error},
        frame::BasicProperties,
        test_utils::{setup_logging, BrokerConfig, MockBroker},
    };

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queue_lifecycle() {
        setup_logging();
        let broker = MockBroker::start(BrokerConfig::default()).await;
        let conn = Connection::open(&broker.connection_arguments()).await.unwrap();
        let channel = conn.open_channel().await.unwrap();

        let (name, messages, consumers) = channel
            .queue_declare(QueueDeclareArguments::new(""))
            .await
            .unwrap()
            .unwrap();
        assert!(name.starts_with("amq.gen-"), "{}", name);
        assert_eq!((0, 0), (messages, consumers));

        channel
            .queue_bind(QueueBindArguments::new(&name, "amq.direct", "events"))
            .await
            .unwrap();
        for _ in 0..3 {
            channel
                .basic_publish(
                    BasicPublishArguments::new("amq.direct", "events"),
                    BasicProperties::default(),
                    Bytes::from_static(b"e"),
                )
                .await
                .unwrap();
        }
        // passive declare reports the current depth
        let mut passive = QueueDeclareArguments::new(&name);
        passive.passive = true;
        let (_, messages, _) = channel.queue_declare(passive).await.unwrap().unwrap();
        assert_eq!(3, messages);

        assert_eq!(
            Some(3),
            channel
                .queue_purge(QueuePurgeArguments::new(&name))
                .await
                .unwrap()
        );
        channel
            .queue_unbind(QueueUnbindArguments::new(&name, "amq.direct", "events"))
            .await
            .unwrap();
        assert_eq!(
            Some(0),
            channel
                .queue_delete(QueueDeleteArguments::new(&name))
                .await
                .unwrap()
        );
        assert_eq!(vec![name], broker.declared_queues());
        conn.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_over_long_queue_name_is_refused_before_sending() {
        setup_logging();
        let broker = MockBroker::start(BrokerConfig::default()).await;
        let conn = Connection::open(&broker.connection_arguments()).await.unwrap();
        let channel = conn.open_channel().await.unwrap();

        let name = "q".repeat(300);
        match channel.queue_declare(QueueDeclareArguments::new(&name)).await {
            Err(Error::ChannelUseError(msg)) => assert!(msg.contains("300"), "{}", msg),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(matches!(
            channel
                .queue_bind(QueueBindArguments::new("q", "amq.direct", &name))
                .await,
            Err(Error::ChannelUseError(_))
        ));
        assert!(broker.declared_queues().is_empty());

        // nothing reached the server, the channel is fine
        assert!(channel.is_open());
        channel
            .queue_declare(QueueDeclareArguments::new("q"))
            .await
            .unwrap();
        conn.close().await.unwrap();
    }
}
