//! Shared wiring for the integration tests: tracing, backends, committed reads

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use txnest_core::application::TransactionCoordinator;
use txnest_core::port::id_provider::UuidProvider;
use txnest_core::port::time_provider::SystemTimeProvider;
use txnest_core::port::{Statement, TransactionalResource};
use txnest_infra_memory::MemoryStore;
use txnest_infra_sqlite::{create_pool, run_migrations, SqlitePoolConfig, SqliteResource};

/// Install a test subscriber once; later calls are no-ops
///
/// `RUST_LOG` overrides the default filter, `TXNEST_LOG_FORMAT=json` switches
/// to JSON lines.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("txnest=debug"));
    let json = std::env::var("TXNEST_LOG_FORMAT").is_ok_and(|f| f == "json");

    let registry = tracing_subscriber::registry().with(env_filter);
    let _ = if json {
        registry
            .with(fmt::layer().json().with_test_writer())
            .try_init()
    } else {
        registry.with(fmt::layer().with_test_writer()).try_init()
    };
}

/// Coordinator wired to one backend
pub struct Harness {
    pub coordinator: Arc<TransactionCoordinator>,
    pub resource: Arc<dyn TransactionalResource>,
}

impl Harness {
    fn new(resource: Arc<dyn TransactionalResource>) -> Self {
        init_tracing();
        let coordinator = Arc::new(TransactionCoordinator::new(
            resource.clone(),
            Arc::new(UuidProvider),
            Arc::new(SystemTimeProvider),
        ));
        Self {
            coordinator,
            resource,
        }
    }

    /// Committed document, read on a fresh connection
    pub async fn committed(&self, collection: &str, key: &str) -> Option<serde_json::Value> {
        let mut conn = self.resource.begin().await.unwrap();
        let doc = conn
            .execute(&Statement::get(collection, key))
            .await
            .unwrap()
            .into_document();
        conn.rollback().await.unwrap();
        doc
    }

    /// Committed keys of a collection, ordered
    pub async fn committed_keys(&self, collection: &str) -> Vec<String> {
        let mut conn = self.resource.begin().await.unwrap();
        let docs = conn
            .execute(&Statement::scan(collection))
            .await
            .unwrap()
            .into_documents();
        conn.rollback().await.unwrap();
        docs.into_iter().map(|(key, _)| key).collect()
    }
}

pub fn memory() -> Harness {
    Harness::new(Arc::new(MemoryStore::new()))
}

pub fn memory_with_max_connections(max: usize) -> Harness {
    Harness::new(Arc::new(MemoryStore::with_max_connections(max)))
}

/// Fresh SQLite database file under the OS temp dir
pub async fn sqlite() -> Harness {
    let path = std::env::temp_dir().join(format!("txnest-it-{}.db", uuid::Uuid::new_v4()));
    let config = SqlitePoolConfig {
        max_connections: 4,
        busy_timeout: Duration::from_millis(500),
        acquire_timeout: Duration::from_millis(500),
    };
    let pool = create_pool(&format!("sqlite://{}", path.display()), &config)
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    Harness::new(Arc::new(SqliteResource::new(pool)))
}
