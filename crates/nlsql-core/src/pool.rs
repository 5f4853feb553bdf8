//! Per-database connection pool creation.

use deadpool_postgres::{Manager, ManagerConfig, Pool, PoolBuilder, RecyclingMethod};
use thiserror::Error;
use tokio_postgres::NoTls;
use tokio_postgres::Socket;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid connection URL: {0}")]
    InvalidUrl(String),
    #[error("failed to build connection pool: {0}")]
    Build(String),
}

/// Create a connection pool from a database URL using plaintext connections,
/// sized by `pool_max` (`pool_min` has no literal equivalent in this driver's
/// pool — connections are created lazily up to `pool_max` — so it is carried
/// only as configuration metadata, not enforced here).
pub fn create_pool(database_url: &str, pool_max: usize) -> Result<Pool, PoolError> {
    create_pool_with_manager_config(database_url, NoTls, default_manager_config(), |b| {
        b.max_size(pool_max)
    })
}

/// Create a connection pool using a custom TLS connector, for databases that
/// require TLS.
pub fn create_pool_with_tls<T>(
    database_url: &str,
    tls: T,
    pool_max: usize,
) -> Result<Pool, PoolError>
where
    T: MakeTlsConnect<Socket> + Clone + Sync + Send + 'static,
    T::Stream: Sync + Send,
    T::TlsConnect: Sync + Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    create_pool_with_manager_config(database_url, tls, default_manager_config(), |b| {
        b.max_size(pool_max)
    })
}

/// Create a connection pool with an injected `deadpool_postgres::ManagerConfig`
/// and `PoolBuilder`, for callers that need finer control than `pool_max`.
pub fn create_pool_with_manager_config<T>(
    database_url: &str,
    tls: T,
    manager_config: ManagerConfig,
    configure_pool: impl FnOnce(PoolBuilder) -> PoolBuilder,
) -> Result<Pool, PoolError>
where
    T: MakeTlsConnect<Socket> + Clone + Sync + Send + 'static,
    T::Stream: Sync + Send,
    T::TlsConnect: Sync + Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    let pg_config: tokio_postgres::Config = database_url
        .parse()
        .map_err(|e: tokio_postgres::Error| PoolError::InvalidUrl(e.to_string()))?;

    let mgr = Manager::from_config(pg_config, tls, manager_config);
    configure_pool(Pool::builder(mgr))
        .build()
        .map_err(|e| PoolError::Build(e.to_string()))
}

fn default_manager_config() -> ManagerConfig {
    ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    }
}
