//! Database layer for Laplink.
//!
//! Uses MySQL through sqlx. Sessions are opened at startup and handed to a
//! [`ConnectionBroker`], which is the only way the rest of the crate reaches
//! the database. A session the server dropped is reopened on its next use.

pub mod broker;

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{ConnectOptions, Connection, Executor};

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::jobs::{EventId, PhaseId, ResultsConnection};

pub use broker::{BrokerStats, BrokeredConnection, ConnectionBroker, Priority};

/// Broker over MySQL sessions.
pub type MySqlBroker = ConnectionBroker<MySqlSession>;

/// Database sessions and the broker that owns them.
#[derive(Clone)]
pub struct Database {
    broker: MySqlBroker,
}

impl Database {
    /// Open `pool_size` sessions and place them under a broker.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let options = MySqlConnectOptions::from_str(&config.url)?;

        let mut sessions = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            sessions.push(MySqlSession::open(options.clone()).await?);
        }

        tracing::info!(pool_size = config.pool_size, "Database sessions opened");

        Ok(Self {
            broker: ConnectionBroker::new("laplink_pool", sessions, config.acquire_timeout),
        })
    }

    /// Get the connection broker.
    pub fn broker(&self) -> &MySqlBroker {
        &self.broker
    }

    /// Close the broker and every idle session.
    pub async fn close(&self) {
        for session in self.broker.close() {
            session.close().await;
        }
    }
}

/// One broker slot: a MySQL session plus what it takes to reopen it.
pub struct MySqlSession {
    options: MySqlConnectOptions,
    conn: Option<MySqlConnection>,
    /// Set from `START TRANSACTION` until `COMMIT` or `ROLLBACK` succeeds.
    in_transaction: bool,
}

impl MySqlSession {
    /// Connect now.
    pub async fn open(options: MySqlConnectOptions) -> Result<Self> {
        let conn = options.connect().await?;
        Ok(Self {
            options,
            conn: Some(conn),
            in_transaction: false,
        })
    }

    /// A session that connects on first use.
    pub fn lazy(options: MySqlConnectOptions) -> Self {
        Self {
            options,
            conn: None,
            in_transaction: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub async fn close(self) {
        if let Some(conn) = self.conn {
            if let Err(e) = conn.close().await {
                tracing::warn!(error = %e, "Failed to close database session");
            }
        }
    }

    /// The live connection, reopening it if the last one was lost.
    async fn live(&mut self) -> Result<&mut MySqlConnection> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                let conn = self.options.connect().await?;
                tracing::info!("Database session reopened");
                conn
            }
        };
        Ok(self.conn.insert(conn))
    }

    /// Pass `result` through, dropping the connection first if the server no
    /// longer answers a ping.
    async fn checked<T>(&mut self, result: std::result::Result<T, sqlx::Error>) -> Result<T> {
        let error = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if let Some(conn) = self.conn.as_mut() {
            if let Err(ping) = conn.ping().await {
                tracing::warn!(error = %error, ping_error = %ping, "Database session lost; reopening on next use");
                self.conn = None;
                self.in_transaction = false;
            }
        }
        Err(error.into())
    }

    /// Discard a transaction a cancelled caller left open.
    ///
    /// MySQL would otherwise commit it implicitly at the next `START
    /// TRANSACTION`. If the rollback itself fails the session is dropped,
    /// which discards the transaction on the server.
    async fn settle(&mut self) {
        if !self.in_transaction {
            return;
        }
        self.in_transaction = false;
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        tracing::warn!("Rolling back a transaction left open on this session");
        if let Err(e) = conn.execute("ROLLBACK").await {
            tracing::warn!(error = %e, "Rollback of abandoned transaction failed; dropping session");
            self.conn = None;
        }
    }
}

#[async_trait]
impl ResultsConnection for MySqlSession {
    async fn begin(&mut self) -> Result<()> {
        self.settle().await;
        self.in_transaction = true;
        let result = self.live().await?.execute("START TRANSACTION").await;
        self.checked(result).await?;
        Ok(())
    }

    async fn call_aggregate(&mut self, event_id: EventId, phase_id: PhaseId) -> Result<u64> {
        let result = sqlx::query("CALL UpdateActiveEventPhaseResults(?, ?)")
            .bind(event_id)
            .bind(phase_id)
            .execute(self.live().await?)
            .await;
        Ok(self.checked(result).await?.rows_affected())
    }

    async fn commit(&mut self) -> Result<()> {
        let result = self.live().await?.execute("COMMIT").await;
        self.checked(result).await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let result = self.live().await?.execute("ROLLBACK").await;
        self.checked(result).await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn write_phase(&mut self, event_id: EventId, phase_id: PhaseId) -> Result<u64> {
        self.settle().await;
        let result = sqlx::query("UPDATE event SET event_phase_id = ? WHERE id = ?")
            .bind(phase_id)
            .bind(event_id)
            .execute(self.live().await?)
            .await;
        Ok(self.checked(result).await?.rows_affected())
    }
}
