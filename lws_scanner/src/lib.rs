//! *The multi-threaded blockchain scanner.*
//!
//! The supervisor reads the active account set, shards it across scan
//! workers by ascending scan height (accounts at similar heights share a
//! block stream), and restarts the fleet whenever the set changes, a reorg
//! is detected, or an account drifts. Each worker owns its own peer socket
//! and storage connection and commits per batch through
//! [`lws_db::StorageConnection::update`].
//!
//! Shutdown is cooperative: every blocking wait in the workers runs in
//! sub-second ticks that observe the per-epoch cancellation channel and the
//! process-wide running flag, so [`ScannerHandle::stop`] takes effect within
//! one tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use tracing::{error, info, warn};

use lws_db::{Storage, StorageConnection};
use lws_primitives::data::{AccountId, AccountStatus};

pub mod account;
pub mod client;
pub mod error;
pub mod proto;
mod scan;
mod sync;

pub use error::Error;

use account::Account;
use client::DaemonClient;

pub(crate) const ACCOUNT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub(crate) const BLOCK_POLL_INTERVAL: Duration = Duration::from_secs(20);
pub(crate) const BLOCK_RPC_TIMEOUT: Duration = Duration::from_secs(120);
pub(crate) const SEND_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const SYNC_RPC_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const POLL_TICK: Duration = Duration::from_millis(500);

/// Observed by every blocking wait: the process-wide running flag plus the
/// per-epoch cancellation channel. The supervisor cancels an epoch by
/// dropping its sender, which wakes every worker's next tick.
#[derive(Clone)]
pub(crate) struct Cancel {
    running: Arc<AtomicBool>,
    epoch: Option<Receiver<()>>,
}

impl Cancel {
    pub(crate) fn new(running: Arc<AtomicBool>, epoch: Option<Receiver<()>>) -> Self {
        Cancel { running, epoch }
    }

    /// Fails with [`Error::AbortScan`] once shutdown or an epoch restart has
    /// been signalled.
    pub(crate) fn check(&self) -> Result<(), Error> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(Error::AbortScan);
        }
        if let Some(rx) = &self.epoch {
            match rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return Err(Error::AbortScan),
                Err(TryRecvError::Empty) => {}
            }
        }
        Ok(())
    }

    /// Sleeps for `duration`, waking early (with [`Error::AbortScan`]) on
    /// cancellation.
    pub(crate) fn wait(&self, duration: Duration) -> Result<(), Error> {
        let start = Instant::now();
        loop {
            self.check()?;
            let Some(remaining) = duration.checked_sub(start.elapsed()) else {
                return Ok(());
            };
            let tick = POLL_TICK.min(remaining);
            match &self.epoch {
                Some(rx) => match rx.recv_timeout(tick) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        return Err(Error::AbortScan)
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                },
                None => thread::sleep(tick),
            }
        }
    }
}

/// A handle for stopping a running [`Scanner`] from another thread (for
/// instance a signal handler).
#[derive(Clone)]
pub struct ScannerHandle {
    running: Arc<AtomicBool>,
}

impl ScannerHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// The scanner supervisor.
pub struct Scanner {
    storage: Storage,
    daemon_addr: String,
    thread_count: usize,
    running: Arc<AtomicBool>,
}

impl Scanner {
    pub fn new(storage: Storage, daemon_addr: String, thread_count: usize) -> Self {
        Scanner {
            storage,
            daemon_addr,
            thread_count: thread_count.max(1),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn handle(&self) -> ScannerHandle {
        ScannerHandle {
            running: self.running.clone(),
        }
    }

    /// Runs until stopped: align the chain with the peer, spawn a worker
    /// fleet for the active accounts, restart on membership change or
    /// worker exit, repeat.
    pub fn run(&self) -> Result<(), Error> {
        let mut conn = self.storage.connect()?;
        let cancel = Cancel::new(self.running.clone(), None);

        while self.running.load(Ordering::SeqCst) {
            let synced = DaemonClient::connect(&self.daemon_addr)
                .and_then(|mut client| sync::sync_chain(&mut conn, &mut client, &cancel));
            match synced {
                Ok(()) => {}
                Err(Error::AbortScan) => return Ok(()),
                Err(Error::DaemonConnectionFailure) => {
                    warn!("Failed to reach daemon at {}", self.daemon_addr);
                    if cancel.wait(ACCOUNT_POLL_INTERVAL).is_err() {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }

            info!("Retrieving current active account list");
            let (users, active_ids) = {
                let reader = conn.start_read()?;
                let accounts = reader.get_accounts(AccountStatus::Active)?;
                let mut users = Vec::with_capacity(accounts.len());
                let mut ids = Vec::with_capacity(accounts.len());
                for account in &accounts {
                    let received = reader.get_output_ids(account.id)?;
                    users.push(Account::new(self.storage.network(), account, received));
                    ids.push(account.id);
                }
                (users, ids)
            };

            if users.is_empty() {
                info!("No active accounts");
                if cancel.wait(ACCOUNT_POLL_INTERVAL).is_err() {
                    return Ok(());
                }
                continue;
            }

            match self.check_loop(&mut conn, users, active_ids) {
                Ok(()) => {}
                Err(Error::AbortScan) => return Ok(()),
                Err(Error::DaemonConnectionFailure) => {
                    warn!("Lost connection to daemon at {}", self.daemon_addr);
                    if cancel.wait(ACCOUNT_POLL_INTERVAL).is_err() {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Spawns the worker fleet for one active-set epoch and polls for
    /// membership changes until something forces a restart.
    fn check_loop(
        &self,
        conn: &mut StorageConnection,
        mut users: Vec<Account>,
        active_ids: Vec<AccountId>,
    ) -> Result<(), Error> {
        // Accounts at similar scan heights share a block stream, so group
        // by height and hand each worker a contiguous slice.
        users.sort_by_key(Account::scan_height);

        let thread_count = self.thread_count.min(users.len());
        let per_thread = (users.len() / thread_count).max(1);

        info!(
            "Starting scan loops on {} thread(s) with {} account(s)",
            thread_count,
            users.len()
        );

        let mut slices = Vec::with_capacity(thread_count);
        while users.len() > per_thread && slices.len() + 1 < thread_count {
            let tail = users.split_off(users.len() - per_thread);
            slices.push(tail);
        }
        slices.push(users);

        // Connect every worker socket up front so a refused connection
        // fails the epoch before any thread starts.
        let mut clients = Vec::with_capacity(slices.len());
        for _ in 0..slices.len() {
            clients.push(DaemonClient::connect(&self.daemon_addr)?);
        }

        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(1);
        let (exit_tx, exit_rx) = crossbeam_channel::unbounded::<()>();

        let mut workers = Vec::with_capacity(slices.len());
        for (index, (slice, client)) in slices.into_iter().zip(clients).enumerate() {
            let cancel = Cancel::new(self.running.clone(), Some(cancel_rx.clone()));
            let storage = self.storage.clone();
            let running = self.running.clone();
            let exit = exit_tx.clone();
            let worker = thread::Builder::new()
                .name(format!("scan-{}", index))
                .spawn(move || {
                    match scan::scan_loop(cancel, client, storage, slice) {
                        Ok(()) | Err(Error::AbortScan) => {}
                        Err(Error::DaemonConnectionFailure) => {
                            // the epoch restarts with fresh connections
                            warn!("Scan worker lost the daemon connection");
                        }
                        Err(e) => {
                            // worker-top boundary: anything unexpected
                            // stops the whole scanner
                            error!("Scan worker failed: {}", e);
                            running.store(false, Ordering::SeqCst);
                        }
                    }
                    let _ = exit.send(());
                })
                .map_err(Error::Io)?;
            workers.push(worker);
        }
        drop(exit_tx);

        let poll_result = (|| -> Result<(), Error> {
            let mut last_check = Instant::now();
            loop {
                match exit_rx.recv_timeout(Duration::from_secs(1)) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
                    Err(RecvTimeoutError::Timeout) => {}
                }
                if !self.running.load(Ordering::SeqCst) {
                    return Ok(());
                }
                if ACCOUNT_POLL_INTERVAL <= last_check.elapsed() {
                    last_check = Instant::now();
                    let reader = conn.start_read()?;
                    let current = reader.get_accounts(AccountStatus::Active)?;
                    let changed = current.len() != active_ids.len()
                        || current
                            .iter()
                            .any(|account| active_ids.binary_search(&account.id).is_err());
                    if changed {
                        info!("Change in active user accounts detected");
                        return Ok(());
                    }
                }
            }
        })();

        drop(cancel_tx);
        for worker in workers {
            if worker.join().is_err() {
                error!("Scan worker panicked");
                self.running.store(false, Ordering::SeqCst);
            }
        }
        poll_result
    }
}
