//! Startup migration gate.
//!
//! A schema migration can block the embedded store for minutes, so it
//! runs in a separate worker process (this same binary, re-invoked as
//! `datalink-hub migrate <db-path>`) while the parent keeps accepting
//! connections. Clients arriving mid-migration are told so and parked;
//! when the worker exits they are drained and given the normal connect
//! sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to run migration worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("migration worker exited with {0}")]
    WorkerFailed(std::process::ExitStatus),
}

/// Notices pushed to a client parked behind the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientNotice {
    MigrationInProgress,
    ConnectReady,
}

/// A connection waiting for the migration to finish.
pub struct PendingClient {
    pub id: u64,
    pub notices: mpsc::UnboundedSender<ClientNotice>,
}

/// Outcome of presenting a new connection to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No migration running; proceed with the full connect sequence.
    Granted,
    /// Parked until `complete()`; the client has been notified.
    Deferred,
}

pub struct MigrationGate {
    running: AtomicBool,
    pending: Mutex<Vec<PendingClient>>,
}

impl MigrationGate {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Raise the gate. Connections admitted after this are deferred.
    pub fn begin(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Present a new connection. While a migration runs the client gets a
    /// `MigrationInProgress` notice and is parked; otherwise it proceeds.
    pub fn admit(&self, client: PendingClient) -> Admission {
        // Flag check and parking under one lock, so complete() cannot
        // drain between them and strand the client.
        let mut pending = self.pending.lock().unwrap();
        if !self.is_running() {
            return Admission::Granted;
        }
        let _ = client.notices.send(ClientNotice::MigrationInProgress);
        pending.push(client);
        Admission::Deferred
    }

    /// Prune a client that disconnected while parked.
    pub fn remove(&self, id: u64) {
        self.pending.lock().unwrap().retain(|c| c.id != id);
    }

    /// Lower the gate and drain the queue in one pass, giving every
    /// still-connected client its deferred connect signal. Clients whose
    /// notice channel has closed are dropped silently. Returns the number
    /// of clients notified.
    pub fn complete(&self) -> usize {
        let mut pending = self.pending.lock().unwrap();
        self.running.store(false, Ordering::SeqCst);
        let mut notified = 0;
        for client in pending.drain(..) {
            if client.notices.send(ClientNotice::ConnectReady).is_ok() {
                notified += 1;
            }
        }
        notified
    }
}

impl Default for MigrationGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the schema migration behind the gate. The worker is this binary
/// re-invoked with the `migrate` subcommand; success is exit status 0.
/// The gate is always drained before a worker failure is surfaced.
pub async fn run_migration(gate: &MigrationGate, db_path: &str) -> Result<(), MigrationError> {
    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.arg("migrate").arg(db_path);
    run_gated_worker(gate, cmd).await
}

async fn run_gated_worker(gate: &MigrationGate, mut cmd: Command) -> Result<(), MigrationError> {
    gate.begin();
    tracing::info!("Migration: worker starting");

    let result = cmd.status().await;

    let notified = gate.complete();
    if notified > 0 {
        tracing::info!("Migration: released {} deferred clients", notified);
    }

    match result {
        Ok(status) if status.success() => {
            tracing::info!("Migration: worker finished");
            Ok(())
        }
        Ok(status) => Err(MigrationError::WorkerFailed(status)),
        Err(e) => Err(e.into()),
    }
}
