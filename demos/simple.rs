//! End-to-end demo against PostgreSQL.
//!
//! Publishes a handful of events and watches a handler consume them:
//!
//! ```console
//! DATABASE_URL=postgres://localhost/durabus cargo run --example simple
//! ```

use std::sync::Arc;
use std::time::Duration;

use durabus::pg::PgQueueDao;
use durabus::{BusConfig, BusEvent, EventHandler, PersistentBus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct AccountCharged {
    account_id: i64,
    amount_cents: i64,
    user_token: Uuid,
}

impl BusEvent for AccountCharged {
    const EVENT_NAME: &'static str = "demo:account-charged";

    fn user_token(&self) -> Uuid {
        self.user_token
    }

    fn search_key1(&self) -> i64 {
        self.account_id
    }

    fn search_key2(&self) -> i64 {
        0
    }
}

struct Ledger;

impl EventHandler<AccountCharged> for Ledger {
    async fn handle(&self, event: &AccountCharged) -> anyhow::Result<()> {
        println!(
            "charged account {} for {} cents",
            event.account_id, event.amount_cents
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let database_url = std::env::var("DATABASE_URL")?;
    let pool = sqlx::PgPool::connect(&database_url).await?;

    let config = BusConfig::new("demo_bus_events").poll_interval(Duration::from_millis(200));
    let dao = PgQueueDao::new(pool, &config);
    dao.ensure_schema().await?;

    let bus = PersistentBus::new(dao, config);
    bus.start().await?;
    bus.register::<AccountCharged, _>(Arc::new(Ledger));

    for account_id in 1..=5 {
        let event = AccountCharged {
            account_id,
            amount_cents: account_id * 100,
            user_token: Uuid::new_v4(),
        };
        bus.post(&event).await?;
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    bus.stop().await;
    Ok(())
}
