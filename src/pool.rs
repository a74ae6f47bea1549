/*
 * Podcast Seeder CLI - Rust Edition
 * Copyright (c) 2024 Podcast Seeder Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};

/// Advisory OS lock on a dedicated lock file. The lock is released when the
/// guard drops, on every exit path.
pub struct FileLock {
    path: PathBuf,
}

pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!("Failed to release file lock {}: {}", self.path.display(), e);
        }
    }
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)?)
    }

    /// Non-blocking acquire. `ResourceExhausted` when another holder exists.
    pub fn try_acquire(&self) -> Result<FileLockGuard> {
        let file = self.open()?;
        file.try_lock_exclusive().map_err(|_| {
            PipelineError::ResourceExhausted(format!("lock {} is held", self.path.display()))
        })?;
        Ok(FileLockGuard {
            file,
            path: self.path.clone(),
        })
    }

    /// Blocking acquire with an optional timeout, polling the OS lock.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<FileLockGuard> {
        let started = Instant::now();
        loop {
            match self.try_acquire() {
                Ok(guard) => return Ok(guard),
                Err(_) => {
                    if let Some(limit) = timeout {
                        if started.elapsed() >= limit {
                            return Err(PipelineError::Timeout {
                                seconds: limit.as_secs(),
                            });
                        }
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
            }
        }
    }
}

/// Bounded pool of reusable connections. `min_connections` are created
/// eagerly; `acquire` blocks until a slot frees or the timeout elapses.
/// Guards return their connection on drop, on normal and error paths both.
pub struct ConnectionPool<T: Send + 'static> {
    idle: Mutex<Vec<T>>,
    semaphore: Arc<Semaphore>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    acquire_timeout: Duration,
}

pub struct PooledConnection<'a, T: Send + 'static> {
    pool: &'a ConnectionPool<T>,
    conn: Option<T>,
    _permit: SemaphorePermit<'a>,
}

impl<'a, T: Send + 'static> std::ops::Deref for PooledConnection<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.conn.as_ref().expect("connection taken")
    }
}

impl<'a, T: Send + 'static> std::ops::DerefMut for PooledConnection<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.conn.as_mut().expect("connection taken")
    }
}

impl<'a, T: Send + 'static> Drop for PooledConnection<'a, T> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push(conn);
        }
    }
}

impl<T: Send + 'static> ConnectionPool<T> {
    pub fn new(
        min_connections: usize,
        max_connections: usize,
        acquire_timeout: Duration,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        let initial: Vec<T> = (0..min_connections.min(max_connections)).map(|_| factory()).collect();
        Self {
            idle: Mutex::new(initial),
            semaphore: Arc::new(Semaphore::new(max_connections.max(1))),
            factory: Box::new(factory),
            acquire_timeout,
        }
    }

    pub async fn acquire(&self) -> Result<PooledConnection<'_, T>> {
        let permit = tokio::time::timeout(self.acquire_timeout, self.semaphore.acquire())
            .await
            .map_err(|_| {
                PipelineError::ResourceExhausted(format!(
                    "connection pool acquire timed out after {:?}",
                    self.acquire_timeout
                ))
            })?
            .map_err(|_| PipelineError::Invariant("connection pool semaphore closed".into()))?;

        let conn = self.idle.lock().pop().unwrap_or_else(|| (self.factory)());
        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
            _permit: permit,
        })
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

/// Tracks long-held resource acquisitions and logs warnings. The observer
/// never forcibly releases anything.
pub struct DeadlockDetector {
    held: Arc<Mutex<HashMap<String, Instant>>>,
    warn_after: Duration,
    token: CancellationToken,
}

pub struct HeldResource {
    held: Arc<Mutex<HashMap<String, Instant>>>,
    name: String,
}

impl Drop for HeldResource {
    fn drop(&mut self) {
        self.held.lock().remove(&self.name);
    }
}

impl DeadlockDetector {
    pub fn new(warn_after: Duration) -> Self {
        Self {
            held: Arc::new(Mutex::new(HashMap::new())),
            warn_after,
            token: CancellationToken::new(),
        }
    }

    /// Register an acquisition; dropping the returned handle deregisters it.
    pub fn track(&self, name: impl Into<String>) -> HeldResource {
        let name = name.into();
        self.held.lock().insert(name.clone(), Instant::now());
        HeldResource {
            held: self.held.clone(),
            name,
        }
    }

    pub fn long_held(&self) -> Vec<(String, Duration)> {
        self.held
            .lock()
            .iter()
            .filter_map(|(name, since)| {
                let held_for = since.elapsed();
                (held_for > self.warn_after).then(|| (name.clone(), held_for))
            })
            .collect()
    }

    /// Spawn the observer task; it scans periodically until shutdown.
    pub fn start(&self, scan_interval: Duration) {
        let held = self.held.clone();
        let warn_after = self.warn_after;
        let token = self.token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(scan_interval) => {}
                }

                for (name, since) in held.lock().iter() {
                    let held_for = since.elapsed();
                    if held_for > warn_after {
                        tracing::warn!(
                            "Resource '{}' held for {:.1}s (threshold {:.1}s)",
                            name,
                            held_for.as_secs_f64(),
                            warn_after.as_secs_f64()
                        );
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}
