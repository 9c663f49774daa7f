//! Journal of the exchanges, queues and bindings declared through recoverable
//! channels, replayed in declaration order after a reconnect.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::{
    api::{
        channel::{
            Channel, ExchangeDeclareArguments, QueueBindArguments, QueueDeclareArguments,
        },
        connection::Connection,
        error::Error,
        Result,
    },
    frame::FieldTable,
};

#[derive(Debug, Clone)]
pub(crate) enum TopologyEntity {
    Exchange(ExchangeDeclareArguments),
    Queue {
        /// name as last declared by the server
        name: String,
        args: QueueDeclareArguments,
    },
    Binding(QueueBindArguments),
}

#[derive(Debug, Default)]
pub(crate) struct TopologyJournal {
    entities: Vec<TopologyEntity>,
}

fn same_binding(
    binding: &QueueBindArguments,
    queue: &str,
    exchange: &str,
    routing_key: &str,
    arguments: &FieldTable,
) -> bool {
    binding.queue == queue
        && binding.exchange == exchange
        && binding.routing_key == routing_key
        && binding.arguments == *arguments
}

impl TopologyJournal {
    pub fn record_exchange(&mut self, args: &ExchangeDeclareArguments) {
        if args.passive {
            return;
        }
        let existing = self.entities.iter_mut().find_map(|entity| match entity {
            TopologyEntity::Exchange(recorded) if recorded.exchange == args.exchange => {
                Some(recorded)
            }
            _ => None,
        });
        match existing {
            Some(recorded) => *recorded = args.clone(),
            None => self.entities.push(TopologyEntity::Exchange(args.clone())),
        }
    }

    /// Also forgets the bindings from this exchange.
    pub fn remove_exchange(&mut self, exchange: &str) {
        self.entities.retain(|entity| match entity {
            TopologyEntity::Exchange(recorded) => recorded.exchange != exchange,
            TopologyEntity::Binding(binding) => binding.exchange != exchange,
            TopologyEntity::Queue { .. } => true,
        });
    }

    /// `name` is the name returned by the server, it differs from
    /// `args.queue` for server-named queues.
    pub fn record_queue(&mut self, args: &QueueDeclareArguments, name: &str) {
        if args.passive {
            return;
        }
        let existing = self.entities.iter_mut().find_map(|entity| match entity {
            TopologyEntity::Queue {
                name: recorded, args, ..
            } if recorded == name => Some(args),
            _ => None,
        });
        match existing {
            Some(recorded) => *recorded = args.clone(),
            None => self.entities.push(TopologyEntity::Queue {
                name: name.to_owned(),
                args: args.clone(),
            }),
        }
    }

    /// Also forgets the bindings of this queue.
    pub fn remove_queue(&mut self, queue: &str) {
        self.entities.retain(|entity| match entity {
            TopologyEntity::Queue { name, .. } => name != queue,
            TopologyEntity::Binding(binding) => binding.queue != queue,
            TopologyEntity::Exchange(_) => true,
        });
    }

    pub fn record_binding(&mut self, args: &QueueBindArguments) {
        let exists = self.entities.iter().any(|entity| match entity {
            TopologyEntity::Binding(binding) => same_binding(
                binding,
                &args.queue,
                &args.exchange,
                &args.routing_key,
                &args.arguments,
            ),
            _ => false,
        });
        if !exists {
            self.entities.push(TopologyEntity::Binding(args.clone()));
        }
    }

    pub fn remove_binding(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) {
        self.entities.retain(|entity| match entity {
            TopologyEntity::Binding(binding) => {
                !same_binding(binding, queue, exchange, routing_key, arguments)
            }
            _ => true,
        });
    }

    pub fn snapshot(&self) -> Vec<TopologyEntity> {
        self.entities.clone()
    }

    /// Server-named queues got new names on replay, make the journal follow.
    pub fn apply_renames(&mut self, renames: &HashMap<String, String>) {
        for entity in self.entities.iter_mut() {
            match entity {
                TopologyEntity::Queue { name, .. } => {
                    if let Some(new_name) = renames.get(name) {
                        *name = new_name.clone();
                    }
                }
                TopologyEntity::Binding(binding) => {
                    if let Some(new_name) = renames.get(&binding.queue) {
                        binding.queue = new_name.clone();
                    }
                }
                TopologyEntity::Exchange(_) => {}
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entities.len()
    }
}

/// Re-declares `entities` in order on a temporary channel of `conn`.
///
/// Returns the new names of server-named queues, keyed by their old name.
/// An entity the server refuses closes the temporary channel; it is logged
/// and replay goes on with a fresh channel.
pub(crate) async fn replay(
    entities: &[TopologyEntity],
    conn: &Connection,
) -> Result<HashMap<String, String>> {
    let mut renames = HashMap::new();
    let mut channel = conn.open_channel().await?;

    for entity in entities {
        let res = replay_one(&channel, entity, &renames).await;
        match res {
            Ok(Some((old, new))) => {
                debug!("server-named queue {} recovered as {}", old, new);
                renames.insert(old, new);
            }
            Ok(None) => {}
            Err(Error::ChannelClosedError(msg)) => {
                warn!("failed to recover {:?}, cause: {}", entity, msg);
                channel = conn.open_channel().await?;
            }
            Err(err) => return Err(err),
        }
    }
    channel.close().await?;
    Ok(renames)
}

async fn replay_one(
    channel: &Channel,
    entity: &TopologyEntity,
    renames: &HashMap<String, String>,
) -> Result<Option<(String, String)>> {
    match entity {
        TopologyEntity::Exchange(args) => {
            channel.exchange_declare(args.clone()).await?;
            Ok(None)
        }
        TopologyEntity::Queue { name, args } => {
            let mut args = args.clone();
            args.no_wait = false;
            let declared = channel.queue_declare(args).await?;
            match declared {
                Some((new_name, _, _)) if new_name != *name => Ok(Some((name.clone(), new_name))),
                _ => Ok(None),
            }
        }
        TopologyEntity::Binding(args) => {
            let mut args = args.clone();
            if let Some(new_name) = renames.get(&args.queue) {
                args.queue = new_name.clone();
            }
            channel.queue_bind(args).await?;
            Ok(None)
        }
    }
}
