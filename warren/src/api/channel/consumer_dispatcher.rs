//! Runs consumer handlers of one channel.
//!
//! Jobs are taken in the order the channel dispatcher queued them. With a
//! concurrency of 1 each handler is awaited before the next job is taken.
//! With a concurrency of `n` up to `n` handlers run as separate tasks; when
//! all permits are taken the dispatcher waits for one, nothing is dropped.
//! Cancel and shutdown jobs first wait for every running handler.

use std::sync::Arc;

use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinError,
};
use tracing::{debug, error, trace, warn};

use super::Channel;
use crate::api::{
    connection::ShutdownReason,
    consumer::{Consumer, Delivery},
};

pub(crate) enum ConsumerJob {
    Deliver(Delivery),
    /// the consumer with this tag is cancelled
    Cancel(String),
    /// the channel is closed, stop after notifying every consumer
    Shutdown(ShutdownReason),
}

pub(super) struct ConsumerDispatcher {
    channel: Channel,
    jobs_rx: mpsc::UnboundedReceiver<ConsumerJob>,
    concurrency: usize,
    permits: Arc<Semaphore>,
}

fn log_handler_failure(channel: &Channel, what: &str, consumer_tag: &str, err: JoinError) {
    if err.is_panic() {
        error!(
            "{} handler of consumer {} panicked on channel {}",
            what, consumer_tag, channel
        );
    } else {
        warn!(
            "{} handler of consumer {} aborted on channel {}",
            what, consumer_tag, channel
        );
    }
}

impl ConsumerDispatcher {
    pub fn new(
        channel: Channel,
        jobs_rx: mpsc::UnboundedReceiver<ConsumerJob>,
        concurrency: usize,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            channel,
            jobs_rx,
            concurrency,
            permits: Arc::new(Semaphore::new(concurrency)),
        }
    }

    pub fn spawn(self) {
        tokio::spawn(self.run_until_shutdown());
    }

    async fn dispatch(&self, delivery: Delivery) {
        let consumer = match self.channel.find_consumer(&delivery.consumer_tag) {
            Some(consumer) => consumer,
            None => {
                warn!(
                    "no consumer {} on channel {}, delivery {} left to the application",
                    delivery.consumer_tag, self.channel, delivery.delivery_tag
                );
                self.channel
                    .events()
                    .emit(&super::ChannelEvent::UnhandledDelivery(delivery));
                return;
            }
        };
        let tag = delivery.consumer_tag.clone();
        let channel = self.channel.clone();

        if self.concurrency == 1 {
            let handler =
                tokio::spawn(async move { consumer.on_delivery(&channel, delivery).await });
            if let Err(err) = handler.await {
                log_handler_failure(&self.channel, "delivery", &tag, err);
            }
            return;
        }

        // blocks until a handler finishes when all permits are taken
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        tokio::spawn(async move {
            // the permit is released when this task ends, even on panic
            let _permit = permit;
            let channel_ref = channel.clone();
            let handler =
                tokio::spawn(async move { consumer.on_delivery(&channel_ref, delivery).await });
            if let Err(err) = handler.await {
                log_handler_failure(&channel, "delivery", &tag, err);
            }
        });
    }

    /// Waits until no handler is running.
    async fn drain(&self) {
        if self.concurrency == 1 {
            return;
        }
        match self.permits.acquire_many(self.concurrency as u32).await {
            Ok(all) => drop(all),
            Err(_) => debug!("consumer permits closed on channel {}", self.channel),
        }
    }

    async fn cancel(&self, consumer_tag: String) {
        self.drain().await;
        // a cancel-ok and a server cancel may race, notify only once
        let registration = match self.channel.remove_consumer(&consumer_tag) {
            Some(registration) => registration,
            None => {
                trace!("consumer {} already removed", consumer_tag);
                return;
            }
        };
        debug!(
            "consumer {} on queue {} cancelled on channel {}",
            consumer_tag, registration.queue, self.channel
        );
        let consumer = registration.consumer;
        let tag = consumer_tag.clone();
        let handler = tokio::spawn(async move { consumer.on_cancel(&tag).await });
        if let Err(err) = handler.await {
            log_handler_failure(&self.channel, "cancel", &consumer_tag, err);
        }
        self.channel
            .events()
            .emit(&super::ChannelEvent::ConsumerCancelled(consumer_tag));
    }

    async fn shutdown(&self, reason: ShutdownReason) {
        self.drain().await;
        for (tag, registration) in self.channel.take_consumers() {
            let consumer: Arc<dyn Consumer> = registration.consumer;
            let reason = reason.clone();
            let consumer_tag = tag.clone();
            let handler =
                tokio::spawn(async move { consumer.on_shutdown(&consumer_tag, &reason).await });
            if let Err(err) = handler.await {
                log_handler_failure(&self.channel, "shutdown", &tag, err);
            }
        }
    }

    pub async fn run_until_shutdown(mut self) {
        while let Some(job) = self.jobs_rx.recv().await {
            match job {
                ConsumerJob::Deliver(delivery) => self.dispatch(delivery).await,
                ConsumerJob::Cancel(tag) => self.cancel(tag).await,
                ConsumerJob::Shutdown(reason) => {
                    self.shutdown(reason).await;
                    break;
                }
            }
        }
        debug!("exit consumer dispatcher of channel {}", self.channel);
    }
}
