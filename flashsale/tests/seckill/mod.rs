use async_trait::async_trait;
use chrono::{Duration as TimeDelta, Utc};
use flashsale::{
    store::keys, Admission, Config, ConfigBuilder, FlashSale, Lock, Order, OrderConsumer,
    OrderOutcome, Rejection, Repository, Seckill,
};
use flashsale_store::{ReadOffset, Store};
use futures_util::future::join_all;
use std::{
    collections::HashSet,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::{sleep, Instant};

fn config(group: &str) -> Config {
    ConfigBuilder::new()
        .group(group)
        .read_block(Duration::from_millis(100))
        .build()
}

fn open_sale(voucher_id: u64, stock: u32) -> FlashSale {
    FlashSale {
        voucher_id,
        stock,
        begin_time: Utc::now() - TimeDelta::hours(1),
        end_time: Utc::now() + TimeDelta::hours(1),
    }
}

async fn wait_for<F, Fut>(mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let deadline = Instant::now() + Duration::from_secs(15);

    while !check().await? {
        if Instant::now() > deadline {
            anyhow::bail!("condition not reached in time");
        }

        sleep(Duration::from_millis(20)).await;
    }

    Ok(())
}

/// Fails the first `failures` order creations, then delegates.
#[derive(Clone)]
pub struct FlakyRepository<R> {
    inner: R,
    failures: usize,
    attempts: Arc<AtomicUsize>,
}

impl<R> FlakyRepository<R> {
    pub fn new(inner: R, failures: usize) -> Self {
        Self {
            inner,
            failures,
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<R: Repository + Clone + 'static> Repository for FlakyRepository<R> {
    async fn save_flash_sale(&self, sale: &FlashSale) -> flashsale::Result<()> {
        self.inner.save_flash_sale(sale).await
    }

    async fn get_flash_sale(&self, voucher_id: u64) -> flashsale::Result<Option<FlashSale>> {
        self.inner.get_flash_sale(voucher_id).await
    }

    async fn create_order(&self, order: &Order) -> flashsale::Result<OrderOutcome> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(anyhow::anyhow!("repository unavailable").into());
        }

        self.inner.create_order(order).await
    }

    async fn count_orders(&self, user_id: u64, voucher_id: u64) -> flashsale::Result<u64> {
        self.inner.count_orders(user_id, voucher_id).await
    }

    async fn orders_of_voucher(&self, voucher_id: u64) -> flashsale::Result<Vec<Order>> {
        self.inner.orders_of_voucher(voucher_id).await
    }
}

pub async fn test_admission_bound<R: Repository + Clone + 'static>(
    store: &Store,
    repository: &R,
) -> anyhow::Result<()> {
    let voucher_id = 1001;
    let seckill = Seckill::new(store.clone(), repository.clone(), &Config::default());
    seckill.create_flash_sale(&open_sale(voucher_id, 10)).await?;

    let admissions = join_all((0..100).map(|user_id| seckill.admit(100_000 + user_id, voucher_id)))
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    let order_ids = admissions
        .iter()
        .filter_map(|a| a.order_id())
        .collect::<HashSet<_>>();

    assert_eq!(order_ids.len(), 10);
    assert_eq!(
        admissions
            .iter()
            .filter(|a| **a == Admission::Rejected(Rejection::InsufficientStock))
            .count(),
        90
    );
    assert_eq!(seckill.remaining_stock(voucher_id).await?, Some(0));
    assert_eq!(seckill.admitted_users(voucher_id).await?, 10);

    seckill.end_flash_sale(voucher_id).await?;

    Ok(())
}

pub async fn test_duplicate_admission<R: Repository + Clone + 'static>(
    store: &Store,
    repository: &R,
) -> anyhow::Result<()> {
    let voucher_id = 1002;
    let seckill = Seckill::new(store.clone(), repository.clone(), &Config::default());
    seckill.create_flash_sale(&open_sale(voucher_id, 5)).await?;

    let first = seckill.admit(200_001, voucher_id).await?;
    let second = seckill.admit(200_001, voucher_id).await?;

    assert!(first.order_id().is_some());
    assert_eq!(second, Admission::Rejected(Rejection::DuplicateOrder));
    assert_eq!(seckill.remaining_stock(voucher_id).await?, Some(4));

    seckill.end_flash_sale(voucher_id).await?;

    Ok(())
}

pub async fn test_sale_window<R: Repository + Clone + 'static>(
    store: &Store,
    repository: &R,
) -> anyhow::Result<()> {
    let seckill = Seckill::new(store.clone(), repository.clone(), &Config::default());

    let upcoming = FlashSale {
        voucher_id: 1003,
        stock: 5,
        begin_time: Utc::now() + TimeDelta::hours(1),
        end_time: Utc::now() + TimeDelta::hours(2),
    };
    let finished = FlashSale {
        voucher_id: 1004,
        stock: 5,
        begin_time: Utc::now() - TimeDelta::hours(2),
        end_time: Utc::now() - TimeDelta::hours(1),
    };

    seckill.create_flash_sale(&upcoming).await?;
    seckill.create_flash_sale(&finished).await?;

    assert_eq!(
        seckill.admit(300_001, 1003).await?,
        Admission::Rejected(Rejection::NotStarted)
    );
    assert_eq!(
        seckill.admit(300_001, 1004).await?,
        Admission::Rejected(Rejection::Ended)
    );
    assert_eq!(seckill.remaining_stock(1003).await?, Some(5));
    assert_eq!(
        repository
            .get_flash_sale(1003)
            .await?
            .map(|sale| (sale.voucher_id, sale.stock)),
        Some((upcoming.voucher_id, upcoming.stock))
    );

    seckill.end_flash_sale(1003).await?;
    seckill.end_flash_sale(1004).await?;

    assert_eq!(seckill.remaining_stock(1003).await?, None);
    assert_eq!(
        seckill.admit(300_001, 1003).await?,
        Admission::Rejected(Rejection::InsufficientStock)
    );

    Ok(())
}

pub async fn test_single_unit<R: Repository + Clone + 'static>(
    store: &Store,
    repository: &R,
) -> anyhow::Result<()> {
    let voucher_id = 1005;
    let config = config("test_single_unit");
    let seckill = Seckill::new(store.clone(), repository.clone(), &config);
    seckill.create_flash_sale(&open_sale(voucher_id, 1)).await?;

    let (first, second) = tokio::join!(
        seckill.admit(400_001, voucher_id),
        seckill.admit(400_002, voucher_id)
    );
    let admissions = [first?, second?];

    let admitted = admissions
        .iter()
        .filter_map(|a| a.order_id())
        .collect::<Vec<_>>();

    assert_eq!(admitted.len(), 1);
    assert!(admissions.contains(&Admission::Rejected(Rejection::InsufficientStock)));

    let consumer = OrderConsumer::new(store.clone(), repository.clone(), config)
        .start()
        .await?;

    wait_for(|| async move { anyhow::Ok(!repository.orders_of_voucher(voucher_id).await?.is_empty()) })
        .await?;
    sleep(Duration::from_millis(200)).await;
    consumer.shutdown().await?;

    let orders = repository.orders_of_voucher(voucher_id).await?;

    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].id, admitted[0]);
    assert_eq!(
        repository
            .get_flash_sale(voucher_id)
            .await?
            .map(|sale| sale.stock),
        Some(0)
    );

    Ok(())
}

pub async fn test_consumer_drains<R: Repository + Clone + 'static>(
    store: &Store,
    repository: &R,
) -> anyhow::Result<()> {
    let voucher_id = 1006;
    let config = config("test_consumer_drains");
    let seckill = Seckill::new(store.clone(), repository.clone(), &config);
    seckill.create_flash_sale(&open_sale(voucher_id, 10)).await?;

    let consumer = OrderConsumer::new(store.clone(), repository.clone(), config.clone())
        .start()
        .await?;

    let admissions = join_all((0..100).map(|user_id| seckill.admit(500_000 + user_id, voucher_id)))
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    let order_ids = admissions
        .iter()
        .filter_map(|a| a.order_id())
        .collect::<HashSet<_>>();

    assert_eq!(order_ids.len(), 10);

    wait_for(|| async move { anyhow::Ok(repository.orders_of_voucher(voucher_id).await?.len() >= 10) })
        .await?;
    sleep(Duration::from_millis(200)).await;
    consumer.shutdown().await?;

    let orders = repository.orders_of_voucher(voucher_id).await?;

    assert_eq!(orders.len(), 10);
    assert_eq!(
        orders.iter().map(|o| o.id).collect::<HashSet<_>>(),
        order_ids
    );
    assert_eq!(
        orders.iter().map(|o| o.user_id).collect::<HashSet<_>>().len(),
        10
    );
    assert_eq!(
        store.pending(keys::ORDER_STREAM, &config.group).await?,
        0
    );

    Ok(())
}

pub async fn test_duplicate_delivery<R: Repository + Clone + 'static>(
    store: &Store,
    repository: &R,
) -> anyhow::Result<()> {
    let voucher_id = 1007;
    let user_id = 600_001;
    let config = config("test_duplicate_delivery");
    let seckill = Seckill::new(store.clone(), repository.clone(), &config);
    seckill.create_flash_sale(&open_sale(voucher_id, 5)).await?;

    let order_id = seckill
        .admit(user_id, voucher_id)
        .await?
        .order_id()
        .ok_or_else(|| anyhow::anyhow!("not admitted"))?;

    store
        .add(
            keys::ORDER_STREAM,
            &[
                ("userId".to_owned(), user_id.to_string()),
                ("voucherId".to_owned(), voucher_id.to_string()),
                ("id".to_owned(), order_id.to_string()),
            ],
        )
        .await?;

    let consumer = OrderConsumer::new(store.clone(), repository.clone(), config.clone())
        .start()
        .await?;

    wait_for(|| async move { anyhow::Ok(repository.count_orders(user_id, voucher_id).await? > 0) }).await?;
    sleep(Duration::from_millis(300)).await;
    consumer.shutdown().await?;

    assert_eq!(repository.count_orders(user_id, voucher_id).await?, 1);
    assert_eq!(
        repository
            .get_flash_sale(voucher_id)
            .await?
            .map(|sale| sale.stock),
        Some(4)
    );
    assert_eq!(store.pending(keys::ORDER_STREAM, &config.group).await?, 0);

    Ok(())
}

pub async fn test_crash_recovery<R: Repository + Clone + 'static>(
    store: &Store,
    repository: &R,
) -> anyhow::Result<()> {
    let voucher_id = 1008;
    let user_id = 700_001;
    let config = config("test_crash_recovery");
    let group = config.group.as_str();
    let seckill = Seckill::new(store.clone(), repository.clone(), &config);
    seckill.create_flash_sale(&open_sale(voucher_id, 3)).await?;
    store
        .create_group(keys::ORDER_STREAM, &config.group)
        .await?;

    let order_id = seckill
        .admit(user_id, voucher_id)
        .await?
        .order_id()
        .ok_or_else(|| anyhow::anyhow!("not admitted"))?;

    // a consumer that dequeued everything and died before acknowledging
    loop {
        let dequeued = store
            .read_group(
                keys::ORDER_STREAM,
                &config.group,
                &config.consumer,
                100,
                None,
                ReadOffset::New,
            )
            .await?;

        if dequeued.is_empty() {
            break;
        }
    }

    assert!(store.pending(keys::ORDER_STREAM, &config.group).await? >= 1);
    assert_eq!(repository.count_orders(user_id, voucher_id).await?, 0);

    let consumer = OrderConsumer::new(store.clone(), repository.clone(), config.clone())
        .start()
        .await?;

    wait_for(|| async move { anyhow::Ok(store.pending(keys::ORDER_STREAM, group).await? == 0) })
        .await?;
    consumer.shutdown().await?;

    let orders = repository.orders_of_voucher(voucher_id).await?;

    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].id, order_id);

    let replay = repository.create_order(&orders[0]).await?;
    assert_eq!(replay, OrderOutcome::Duplicate);
    assert_eq!(repository.count_orders(user_id, voucher_id).await?, 1);

    Ok(())
}

pub async fn test_retry_failed_order<R: Repository + Clone + 'static>(
    store: &Store,
    repository: &R,
) -> anyhow::Result<()> {
    let voucher_id = 1009;
    let user_id = 800_001;
    let config = config("test_retry_failed_order");
    let flaky = FlakyRepository::new(repository.clone(), 3);
    let seckill = Seckill::new(store.clone(), flaky.clone(), &config);
    seckill.create_flash_sale(&open_sale(voucher_id, 3)).await?;

    let consumer = OrderConsumer::new(store.clone(), flaky.clone(), config.clone())
        .start()
        .await?;

    seckill.admit(user_id, voucher_id).await?;

    wait_for(|| async move { anyhow::Ok(repository.count_orders(user_id, voucher_id).await? == 1) }).await?;
    consumer.shutdown().await?;

    assert!(flaky.attempts() >= 4);
    assert_eq!(store.pending(keys::ORDER_STREAM, &config.group).await?, 0);

    Ok(())
}

pub async fn test_user_lock_contention<R: Repository + Clone + 'static>(
    store: &Store,
    repository: &R,
) -> anyhow::Result<()> {
    let voucher_id = 1010;
    let user_id = 900_001;
    let config = config("test_user_lock_contention");
    let seckill = Seckill::new(store.clone(), repository.clone(), &config);
    seckill.create_flash_sale(&open_sale(voucher_id, 3)).await?;

    let held = Lock::new(store.clone())
        .try_acquire(&format!("order:{user_id}"), Duration::from_millis(500))
        .await?;

    let consumer = OrderConsumer::new(store.clone(), repository.clone(), config.clone())
        .start()
        .await?;

    seckill.admit(user_id, voucher_id).await?;

    sleep(Duration::from_millis(200)).await;
    assert_eq!(repository.count_orders(user_id, voucher_id).await?, 0);

    wait_for(|| async move { anyhow::Ok(repository.count_orders(user_id, voucher_id).await? == 1) }).await?;
    consumer.shutdown().await?;

    assert_eq!(store.get(&keys::lock(held.resource())).await?, None);
    assert_eq!(store.pending(keys::ORDER_STREAM, &config.group).await?, 0);

    Ok(())
}

pub async fn test_malformed_reservation<R: Repository + Clone + 'static>(
    store: &Store,
    repository: &R,
) -> anyhow::Result<()> {
    let config = config("test_malformed_reservation");
    let group = config.group.as_str();

    let consumer = OrderConsumer::new(store.clone(), repository.clone(), config.clone())
        .start()
        .await?;

    store
        .add(
            keys::ORDER_STREAM,
            &[("userId".to_owned(), "not-a-user".to_owned())],
        )
        .await?;

    sleep(Duration::from_millis(300)).await;
    wait_for(|| async move { anyhow::Ok(store.pending(keys::ORDER_STREAM, group).await? == 0) })
        .await?;
    consumer.shutdown().await?;

    let undelivered = store
        .read_group(
            keys::ORDER_STREAM,
            group,
            &config.consumer,
            100,
            None,
            ReadOffset::New,
        )
        .await?;

    assert!(undelivered.is_empty());

    Ok(())
}

pub async fn test_negative_stock<R: Repository + Clone + 'static>(
    store: &Store,
    repository: &R,
) -> anyhow::Result<()> {
    let voucher_id = 1011;
    let user_id = 1_000_001;
    let config = config("test_negative_stock");
    let seckill = Seckill::new(store.clone(), repository.clone(), &config);
    seckill.create_flash_sale(&open_sale(voucher_id, 1)).await?;

    store.set(&keys::stock(voucher_id), "-1", None).await?;

    assert_eq!(seckill.remaining_stock(voucher_id).await?, Some(-1));
    assert_eq!(
        seckill.admit(user_id, voucher_id).await?,
        Admission::Rejected(Rejection::InsufficientStock)
    );
    assert_eq!(seckill.remaining_stock(voucher_id).await?, Some(-1));
    assert_eq!(seckill.admitted_users(voucher_id).await?, 0);

    Ok(())
}

pub async fn test_abort_and_restart<R: Repository + Clone + 'static>(
    store: &Store,
    repository: &R,
) -> anyhow::Result<()> {
    let voucher_id = 1012;
    let user_id = 1_100_001;
    let config = config("test_abort_and_restart");
    let group = config.group.as_str();
    let seckill = Seckill::new(store.clone(), repository.clone(), &config);
    seckill.create_flash_sale(&open_sale(voucher_id, 3)).await?;

    // keeps the reservation unacknowledged until the consumer is gone
    let lock = Lock::new(store.clone());
    let held = lock
        .try_acquire(&format!("order:{user_id}"), Duration::from_secs(5))
        .await?;

    let consumer = OrderConsumer::new(store.clone(), repository.clone(), config.clone())
        .start()
        .await?;

    let order_id = seckill
        .admit(user_id, voucher_id)
        .await?
        .order_id()
        .ok_or_else(|| anyhow::anyhow!("not admitted"))?;

    wait_for(|| async move { anyhow::Ok(store.pending(keys::ORDER_STREAM, group).await? >= 1) })
        .await?;
    sleep(Duration::from_millis(200)).await;

    assert!(!consumer.is_finished());

    consumer.abort();

    let aborted = &consumer;
    wait_for(|| async move { anyhow::Ok(aborted.is_finished()) }).await?;

    assert_eq!(repository.count_orders(user_id, voucher_id).await?, 0);
    assert!(store.pending(keys::ORDER_STREAM, &config.group).await? >= 1);

    lock.release(&held).await?;

    let consumer = OrderConsumer::new(store.clone(), repository.clone(), config.clone())
        .start()
        .await?;

    wait_for(|| async move { anyhow::Ok(repository.count_orders(user_id, voucher_id).await? == 1) }).await?;
    wait_for(|| async move { anyhow::Ok(store.pending(keys::ORDER_STREAM, group).await? == 0) })
        .await?;
    consumer.shutdown().await?;

    let orders = repository.orders_of_voucher(voucher_id).await?;

    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].id, order_id);

    Ok(())
}
