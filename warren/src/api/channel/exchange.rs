use super::Channel;
use crate::{
    api::Result,
    frame::{
        short_str, str_field, ExchangeDeclare, ExchangeDeclareOk, ExchangeDelete,
        ExchangeDeleteOk, FieldTable,
    },
};

/// Arguments for [`exchange_declare`]
///
/// [`exchange_declare`]: crate::channel::Channel::exchange_declare
#[derive(Debug, Clone)]
pub struct ExchangeDeclareArguments {
    pub exchange: String,
    /// `direct`, `fanout`, `topic`, `headers` or a plugin provided type
    pub exchange_type: String,
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub arguments: FieldTable,
}

impl ExchangeDeclareArguments {
    /// Create declare arguments with defaults
    pub fn new(exchange: &str, exchange_type: &str) -> Self {
        Self {
            exchange: exchange.to_owned(),
            exchange_type: exchange_type.to_owned(),
            passive: false,
            durable: false,
            auto_delete: false,
            internal: false,
            no_wait: false,
            arguments: FieldTable::new(),
        }
    }

    /// RabbitMQ's [alternate exchange](https://www.rabbitmq.com/ae.html) for
    /// messages this exchange cannot route.
    pub fn alternate_exchange(&mut self, exchange: &str) -> &mut Self {
        // both always fit their string types
        if let (Ok(key), Ok(value)) = (short_str("alternate-exchange"), str_field(exchange)) {
            self.arguments.insert(key, value);
        }
        self
    }

    pub fn finish(&mut self) -> Self {
        self.clone()
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeDeleteArguments {
    pub exchange: String,
    pub if_unused: bool,
    pub no_wait: bool,
}

impl ExchangeDeleteArguments {
    pub fn new(exchange: &str) -> Self {
        Self {
            exchange: exchange.to_owned(),
            if_unused: false,
            no_wait: false,
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
impl Channel {
    pub async fn exchange_declare(&self, args: ExchangeDeclareArguments) -> Result<()> {
        let mut declare = ExchangeDeclare {
            exchange: short_str(args.exchange)?,
            exchange_type: short_str(args.exchange_type)?,
            arguments: args.arguments,
            ..Default::default()
        };
        declare.set_passive(args.passive);
        declare.set_durable(args.durable);
        declare.set_auto_delete(args.auto_delete);
        declare.set_internal(args.internal);
        declare.set_no_wait(args.no_wait);
        if args.no_wait {
            self.cast(declare).await
        } else {
            self.call(declare, &[ExchangeDeclareOk::ID])
                .await
                .map(|_| ())
        }
    }

    pub async fn exchange_delete(&self, args: ExchangeDeleteArguments) -> Result<()> {
        let mut delete = ExchangeDelete {
            exchange: short_str(args.exchange)?,
            ..Default::default()
        };
        delete.set_if_unused(args.if_unused);
        delete.set_no_wait(args.no_wait);
        if args.no_wait {
            self.cast(delete).await
        } else {
            self.call(delete, &[ExchangeDeleteOk::ID]).await.map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ExchangeDeclareArguments, ExchangeDeleteArguments};
    use crate::{
        api::connection::Connection,
        frame::{get_field, FieldValue},
        test_utils::{setup_logging, BrokerConfig, MockBroker},
    };

    #[test]
    fn test_alternate_exchange_argument() {
        let args = ExchangeDeclareArguments::new("orders", "topic")
            .alternate_exchange("unrouted")
            .finish();
        match get_field(&args.arguments, "alternate-exchange") {
            Some(FieldValue::S(name)) => assert_eq!("unrouted", name.as_ref().as_str()),
            other => panic!("unexpected argument {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_declare_and_delete() {
        setup_logging();
        let broker = MockBroker::start(BrokerConfig::default()).await;
        let conn = Connection::open(&broker.connection_arguments()).await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        channel
            .exchange_declare(ExchangeDeclareArguments::new("orders", "direct"))
            .await
            .unwrap();
        assert_eq!(vec!["orders".to_owned()], broker.declared_exchanges());
        channel
            .exchange_delete(ExchangeDeleteArguments::new("orders"))
            .await
            .unwrap();
        conn.close().await.unwrap();
    }
}
