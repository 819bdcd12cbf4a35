//! Connection pooling for the read and write sides of the datastore.
//!
//! The pool hands out owned connections rather than borrowed ones so that
//! transactions and row streams can carry their connection across await
//! points. Credential refresh happens on every new physical connection,
//! which is the property off-the-shelf pools cannot provide: a configured
//! [`CredentialsProvider`] is consulted before dialing, so rotated passwords
//! are picked up as connections naturally cycle.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use futures::future::BoxFuture;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection as _};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use stratum_types::{StoreError, StoreResult};

use super::errors;
use super::options::{CredentialsProvider, PoolOptions};

/// Session setup run on every new physical connection (type checks,
/// session parameters).
pub(crate) type AfterConnectFn =
    Arc<dyn for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, StoreResult<()>> + Send + Sync>;

struct IdleConn {
    conn: PgConnection,
    idle_since: Instant,
    created_at: Instant,
}

/// Closes a connection without blocking the caller. Outside a runtime (e.g.
/// teardown) the socket is simply dropped, which closes it abruptly.
fn close_in_background(conn: PgConnection) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(conn.close());
    }
}

struct PoolInner {
    connect_options: PgConnectOptions,
    options: PoolOptions,
    credentials: Option<Arc<dyn CredentialsProvider>>,
    after_connect: Option<AfterConnectFn>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConn>>,
    closed: AtomicBool,
}

/// An async pool of owned PostgreSQL connections.
#[derive(Clone)]
pub(crate) struct ConnPool {
    inner: Arc<PoolInner>,
}

impl ConnPool {
    pub(crate) fn new(
        connect_options: PgConnectOptions,
        options: PoolOptions,
        credentials: Option<Arc<dyn CredentialsProvider>>,
        after_connect: Option<AfterConnectFn>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(options.max_connections as usize));
        Self {
            inner: Arc::new(PoolInner {
                connect_options,
                options,
                credentials,
                after_connect,
                semaphore,
                idle: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Opens `min_connections` eagerly so the first requests do not pay
    /// connection setup.
    pub(crate) async fn warm(&self) -> StoreResult<()> {
        let mut conns = Vec::new();
        for _ in 0..self.inner.options.min_connections {
            conns.push(self.connect_new().await?);
        }
        let now = Instant::now();
        let mut idle = self.inner.idle.lock().unwrap_or_else(|e| e.into_inner());
        for conn in conns {
            idle.push_back(IdleConn { conn, idle_since: now, created_at: now });
        }
        Ok(())
    }

    /// Acquires a connection, reusing an idle one when possible.
    pub(crate) async fn acquire(&self) -> StoreResult<PooledConn> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::internal_msg("connection pool is closed"));
        }

        let permit = tokio::time::timeout(
            self.inner.options.acquire_timeout,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| {
            StoreError::internal_msg("timed out waiting for a pooled database connection")
        })?
        .map_err(|_| StoreError::internal_msg("connection pool is closed"))?;

        // Prefer idle connections, discarding any that aged out.
        loop {
            let candidate = {
                let mut idle = self.inner.idle.lock().unwrap_or_else(|e| e.into_inner());
                idle.pop_front()
            };
            let Some(candidate) = candidate else { break };

            if self.is_stale(&candidate) {
                close_in_background(candidate.conn);
                continue;
            }

            return Ok(PooledConn {
                conn: Some(candidate.conn),
                created_at: candidate.created_at,
                dirty: false,
                _permit: permit,
                pool: Arc::downgrade(&self.inner),
            });
        }

        let conn = self.connect_new().await?;
        Ok(PooledConn {
            conn: Some(conn),
            created_at: Instant::now(),
            dirty: false,
            _permit: permit,
            pool: Arc::downgrade(&self.inner),
        })
    }

    fn is_stale(&self, candidate: &IdleConn) -> bool {
        if let Some(idle_timeout) = self.inner.options.idle_timeout {
            if candidate.idle_since.elapsed() > idle_timeout {
                return true;
            }
        }
        if let Some(max_lifetime) = self.inner.options.max_lifetime {
            if candidate.created_at.elapsed() > max_lifetime {
                return true;
            }
        }
        false
    }

    /// Dials a new physical connection, refreshing credentials first when a
    /// provider is configured.
    async fn connect_new(&self) -> StoreResult<PgConnection> {
        let mut connect_options = self.inner.connect_options.clone();

        if let Some(provider) = &self.inner.credentials {
            let address = format!(
                "{}:{}",
                self.inner.connect_options.get_host(),
                self.inner.connect_options.get_port()
            );
            let (username, password) = provider
                .credentials(&address, self.inner.connect_options.get_username())
                .await?;
            connect_options = connect_options.username(&username).password(&password);
        }

        let mut conn = connect_options.connect().await.map_err(errors::wrap)?;

        if let Some(after_connect) = &self.inner.after_connect {
            after_connect(&mut conn).await?;
        }
        Ok(conn)
    }

    /// Closes the pool: no new acquisitions, idle connections closed.
    /// Outstanding connections are closed as they are returned.
    pub(crate) async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.semaphore.close();

        let drained: Vec<IdleConn> = {
            let mut idle = self.inner.idle.lock().unwrap_or_else(|e| e.into_inner());
            idle.drain(..).collect()
        };
        for candidate in drained {
            let _ = candidate.conn.close().await;
        }
    }
}

/// An owned connection checked out of a [`ConnPool`].
///
/// Returned to the pool on drop unless it was marked dirty (e.g. dropped
/// mid-transaction or mid-stream), in which case it is closed instead.
pub(crate) struct PooledConn {
    conn: Option<PgConnection>,
    created_at: Instant,
    dirty: bool,
    _permit: OwnedSemaphorePermit,
    pool: Weak<PoolInner>,
}

impl PooledConn {
    /// Marks the connection as carrying session state (an open transaction
    /// or portal). Dirty connections are closed rather than reused.
    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Clears the dirty mark once the session state is known to be clean.
    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

impl Deref for PooledConn {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut PgConnection {
        self.conn.as_mut().expect("connection taken before drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };

        let Some(pool) = self.pool.upgrade() else {
            close_in_background(conn);
            return;
        };

        if self.dirty || pool.closed.load(Ordering::Acquire) {
            close_in_background(conn);
            return;
        }

        let mut idle = pool.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.push_back(IdleConn {
            conn,
            idle_since: Instant::now(),
            created_at: self.created_at,
        });
    }
}
