use flashsale_store::{keys, ReadOffset, Store, StreamMessage};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    error::{Error, Result},
    lock::Lock,
    order::{OrderOutcome, Reservation},
    repository::Repository,
};

/// Background worker draining the reservation stream into the repository.
///
/// Messages are handled one at a time and acknowledged only once fully
/// handled. Anything that fails stays in the consumer's pending list and is
/// retried from there until it goes through.
#[derive(Clone)]
pub struct OrderConsumer {
    store: Store,
    repository: Box<dyn Repository>,
    lock: Lock,
    config: Config,
}

impl OrderConsumer {
    pub fn new<R: Repository + 'static>(store: Store, repository: R, config: Config) -> Self {
        Self {
            lock: Lock::new(store.clone()),
            store,
            repository: Box::new(repository),
            config,
        }
    }

    /// Ensures the consumer group exists and spawns the loop. Reservations
    /// left pending by a previous run are finished before any new one is read.
    pub async fn start(&self) -> Result<ConsumerHandle> {
        self.store
            .create_group(keys::ORDER_STREAM, &self.config.group)
            .await?;

        let (shutdown, receiver) = watch::channel(false);
        let consumer = self.clone();

        let join = tokio::spawn(async move {
            info!(
                "order consumer {}/{} started",
                consumer.config.group, consumer.config.consumer
            );

            consumer.run(receiver).await;

            info!(
                "order consumer {}/{} stopped",
                consumer.config.group, consumer.config.consumer
            );
        });

        Ok(ConsumerHandle { shutdown, join })
    }

    async fn run(&self, shutdown: watch::Receiver<bool>) {
        self.handle_pending_list(&shutdown).await;

        while !*shutdown.borrow() {
            let messages = match self
                .store
                .read_group(
                    keys::ORDER_STREAM,
                    &self.config.group,
                    &self.config.consumer,
                    1,
                    Some(self.config.read_block),
                    ReadOffset::New,
                )
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    error!("failed to read {}: {e}", keys::ORDER_STREAM);
                    sleep(self.config.pending_backoff).await;
                    continue;
                }
            };

            for message in messages.iter() {
                if let Err(e) = self.handle(message).await {
                    error!("failed to handle reservation {}: {e}", message.id);
                    self.handle_pending_list(&shutdown).await;
                }
            }
        }
    }

    async fn handle_pending_list(&self, shutdown: &watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            let messages = match self
                .store
                .read_group(
                    keys::ORDER_STREAM,
                    &self.config.group,
                    &self.config.consumer,
                    1,
                    None,
                    ReadOffset::Pending,
                )
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    error!("failed to read pending list of {}: {e}", self.config.consumer);
                    sleep(self.config.pending_backoff).await;
                    continue;
                }
            };

            let Some(message) = messages.first() else {
                return;
            };

            if let Err(e) = self.handle(message).await {
                error!("failed to recover reservation {}: {e}", message.id);
                sleep(self.config.pending_backoff).await;
            }
        }
    }

    async fn handle(&self, message: &StreamMessage) -> Result<()> {
        match Reservation::try_from(message) {
            Ok(reservation) => self.persist(&reservation).await?,
            Err(e) => error!("discarding malformed reservation {}: {e}", message.id),
        };

        self.store
            .ack(keys::ORDER_STREAM, &self.config.group, &message.id)
            .await?;

        Ok(())
    }

    async fn persist(&self, reservation: &Reservation) -> Result<()> {
        let token = self
            .lock
            .try_acquire(
                &format!("order:{}", reservation.user_id),
                self.config.order_lock_ttl,
            )
            .await?;

        let outcome = self.repository.create_order(&reservation.order()).await;

        match self.lock.release(&token).await {
            Ok(()) | Err(Error::NotOwner(_)) => {}
            Err(e) => error!("failed to release {}: {e}", token.resource()),
        };

        match outcome? {
            OrderOutcome::Persisted => debug!(
                "order {} of user {} on voucher {} persisted",
                reservation.order_id, reservation.user_id, reservation.voucher_id
            ),
            OrderOutcome::Duplicate => warn!(
                "user {} already owns an order on voucher {}, dropping reservation {}",
                reservation.user_id, reservation.voucher_id, reservation.id
            ),
            OrderOutcome::SoldOut => warn!(
                "voucher {} sold out in the repository after admitting order {}",
                reservation.voucher_id, reservation.order_id
            ),
        };

        Ok(())
    }
}

/// Running [`OrderConsumer`] loop.
#[derive(Debug)]
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Stops the loop between two messages and waits for it. Takes up to the
    /// configured `read_block` when the loop is waiting for a reservation.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.send_replace(true);
        self.join.await.map_err(anyhow::Error::from)?;

        Ok(())
    }

    /// Stops the loop right away, possibly mid-message. Unacknowledged
    /// reservations are recovered by the next start.
    pub fn abort(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
