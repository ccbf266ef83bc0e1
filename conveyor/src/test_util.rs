use std::{fmt::Display, time::Duration};

use futures::Future;
use once_cell::sync::Lazy;
use temp_dir::TempDir;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{item::QueueItem, item_store, store::Store};

pub(crate) struct TestEnvironment {
    pub store: Store,
    #[allow(dead_code)]
    dir: TempDir,
}

impl TestEnvironment {
    pub async fn new() -> Self {
        Lazy::force(&TRACING);
        let dir = TempDir::new().unwrap();
        let store = Store::new(&dir.child("test.sqlite")).await.unwrap();

        TestEnvironment { store, dir }
    }

    /// All work queue leases, in claim order.
    pub async fn work_queue_ids(&self) -> Vec<Uuid> {
        self.store
            .interact(|db| {
                let mut stmt =
                    db.prepare("SELECT id FROM work_queue ORDER BY created, batch_order")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.map(|id| {
                    Uuid::parse_str(&id?).map_err(|_| crate::Error::InvalidId("work_queue.id"))
                })
                .collect()
            })
            .await
            .unwrap()
    }

    /// All active queue items, oldest first.
    pub async fn active_items(&self) -> Vec<QueueItem> {
        self.store
            .interact(|db| {
                let mut stmt = db.prepare("SELECT id FROM queue ORDER BY created, id")?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                ids.into_iter()
                    .map(|id| {
                        let id = Uuid::parse_str(&id)
                            .map_err(|_| crate::Error::InvalidId("queue.id"))?;
                        item_store::get_item(db, &id)?.ok_or(crate::Error::NotFound)
                    })
                    .collect()
            })
            .await
            .unwrap()
    }
}

pub async fn wait_for<F, Fut, T, E>(label: impl Display, f: F) -> T
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    wait_for_timeout(label, Duration::from_secs(5), f).await
}

pub async fn wait_for_timeout<F, Fut, T, E>(label: impl Display, timeout: Duration, f: F) -> T
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_check = 1000;
    let mut check_interval = 10;
    let start_time = OffsetDateTime::now_utc();
    let final_time = start_time + timeout;
    let mut last_error: E;

    loop {
        tokio::task::yield_now().await;
        match f().await {
            Ok(value) => return value,
            Err(e) => {
                tracing::trace!(%label, %e, "Checking... not ready yet");
                last_error = e;
            }
        };

        let now = OffsetDateTime::now_utc();
        if now >= final_time {
            panic!(
                "Timed out waiting for {} after {}ms: {}",
                label,
                timeout.as_millis(),
                last_error
            );
        }

        check_interval = std::cmp::min(check_interval * 2, max_check);
        let sleep_time = std::cmp::min(
            (final_time - now).whole_milliseconds() as u64,
            check_interval,
        );

        tokio::time::sleep(Duration::from_millis(sleep_time)).await;
    }
}

pub static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        configure_tracing();
    }
});

fn configure_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    let tree = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    let subscriber = tracing_subscriber::Registry::default().with(tree);

    tracing::subscriber::set_global_default(subscriber).unwrap();
}
