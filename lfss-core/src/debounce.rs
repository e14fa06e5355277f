use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::metadata::files;
use crate::metadata::users;
use crate::pool::{ConnectionPool, NoHook};

const MIN_DELAY: Duration = Duration::from_millis(200);
const MAX_WAIT: Duration = Duration::from_secs(2);

/// Debounced last-active / file-access-time flushing (supplemented
/// from `_set_all_active`/`_log_all_access` in the original): updates
/// collect in a small in-process queue and are flushed on a min-delay
/// timer, briefly acquiring the writer, instead of taking the writer
/// lock on every single request.
///
/// Senders and join handles sit behind plain `Mutex`es rather than
/// `&mut self` so `shutdown` can be called through the shared `Engine`
/// handle every caller already holds, instead of needing exclusive
/// access right when the process is tearing down.
pub struct DebounceQueues {
    last_active_tx: Mutex<Option<mpsc::UnboundedSender<(u64, DateTime<Utc>)>>>,
    access_time_tx: Mutex<Option<mpsc::UnboundedSender<(String, DateTime<Utc>)>>>,
    last_active_task: Mutex<Option<JoinHandle<()>>>,
    access_time_task: Mutex<Option<JoinHandle<()>>>,
}

impl DebounceQueues {
    pub fn spawn(pool: Arc<ConnectionPool>) -> Self {
        let (la_tx, la_rx) = mpsc::unbounded_channel();
        let (at_tx, at_rx) = mpsc::unbounded_channel();

        let last_active_task = tokio::spawn(run_last_active_flusher(pool.clone(), la_rx));
        let access_time_task = tokio::spawn(run_access_time_flusher(pool, at_rx));

        DebounceQueues {
            last_active_tx: Mutex::new(Some(la_tx)),
            access_time_tx: Mutex::new(Some(at_tx)),
            last_active_task: Mutex::new(Some(last_active_task)),
            access_time_task: Mutex::new(Some(access_time_task)),
        }
    }

    pub fn touch_last_active(&self, user_id: u64) {
        if let Some(tx) = self.last_active_tx.lock().unwrap().as_ref() {
            let _ = tx.send((user_id, Utc::now()));
        }
    }

    pub fn touch_access_time(&self, url: String) {
        if let Some(tx) = self.access_time_tx.lock().unwrap().as_ref() {
            let _ = tx.send((url, Utc::now()));
        }
    }

    /// Closes both queues and waits for their flusher tasks to drain
    /// and exit, so shutdown never drops a pending update.
    pub async fn shutdown(&self) {
        self.last_active_tx.lock().unwrap().take();
        self.access_time_tx.lock().unwrap().take();
        let la_task = self.last_active_task.lock().unwrap().take();
        let at_task = self.access_time_task.lock().unwrap().take();
        if let Some(h) = la_task {
            let _ = h.await;
        }
        if let Some(h) = at_task {
            let _ = h.await;
        }
    }
}

async fn run_last_active_flusher(pool: Arc<ConnectionPool>, mut rx: mpsc::UnboundedReceiver<(u64, DateTime<Utc>)>) {
    let mut pending: HashMap<u64, DateTime<Utc>> = HashMap::new();
    let mut ticker = tokio::time::interval(MIN_DELAY);
    loop {
        tokio::select! {
            item = rx.recv() => {
                match item {
                    Some((id, at)) => { pending.insert(id, at); }
                    None => { flush_last_active(&pool, &mut pending).await; return; }
                }
            }
            _ = ticker.tick() => {
                flush_last_active(&pool, &mut pending).await;
            }
        }
    }
}

async fn flush_last_active(pool: &ConnectionPool, pending: &mut HashMap<u64, DateTime<Utc>>) {
    if pending.is_empty() {
        return;
    }
    let batch: Vec<(u64, DateTime<Utc>)> = pending.drain().collect();
    let _ = pool
        .transaction(NoHook, move |conn, _hook| {
            for (id, at) in &batch {
                users::set_last_active(conn, *id, *at)?;
            }
            Ok(())
        })
        .await;
}

async fn run_access_time_flusher(pool: Arc<ConnectionPool>, mut rx: mpsc::UnboundedReceiver<(String, DateTime<Utc>)>) {
    let mut pending: HashMap<String, DateTime<Utc>> = HashMap::new();
    let mut ticker = tokio::time::interval(MIN_DELAY.max(Duration::from_millis(1)).min(MAX_WAIT));
    loop {
        tokio::select! {
            item = rx.recv() => {
                match item {
                    Some((url, at)) => { pending.insert(url, at); }
                    None => { flush_access_time(&pool, &mut pending).await; return; }
                }
            }
            _ = ticker.tick() => {
                flush_access_time(&pool, &mut pending).await;
            }
        }
    }
}

async fn flush_access_time(pool: &ConnectionPool, pending: &mut HashMap<String, DateTime<Utc>>) {
    if pending.is_empty() {
        return;
    }
    let batch: Vec<(String, DateTime<Utc>)> = pending.drain().collect();
    let _ = pool
        .transaction(NoHook, move |conn, _hook| {
            for (url, _at) in &batch {
                files::touch_access_time(conn, url)?;
            }
            Ok(())
        })
        .await;
}
