use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Registry of named daemon threads. Spawned threads stay listed until they
/// are joined or their handle is dropped, so health reporting can show which
/// workers are alive.
#[derive(Clone, Default)]
pub struct ThreadRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicUsize,
    names: Mutex<HashMap<usize, String>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: impl Into<String>, f: F) -> Result<ThreadHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let join_handle = thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .map_err(|e| anyhow!("failed to spawn thread '{name}': {e}"))?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .names
            .lock()
            .expect("thread registry mutex poisoned")
            .insert(id, name.clone());

        Ok(ThreadHandle {
            name,
            id,
            handle: Some(join_handle),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Names of threads that have been spawned and not yet joined or
    /// detached, in a stable order.
    pub fn active_thread_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .names
            .lock()
            .expect("thread registry mutex poisoned")
            .values()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

pub struct ThreadHandle {
    name: String,
    id: usize,
    handle: Option<JoinHandle<()>>,
    inner: Arc<RegistryInner>,
}

impl ThreadHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join(mut self) -> thread::Result<()> {
        self.inner
            .names
            .lock()
            .expect("thread registry mutex poisoned")
            .remove(&self.id);
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        let _ = self
            .inner
            .names
            .lock()
            .expect("thread registry mutex poisoned")
            .remove(&self.id);
        // Dropping the JoinHandle detaches the thread; never block in drop.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn wait_ready(rx: &mpsc::Receiver<()>) {
        rx.recv_timeout(Duration::from_secs(1)).expect("thread ready");
    }

    #[test]
    fn spawned_thread_is_listed_until_joined() {
        let registry = ThreadRegistry::new();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = registry
            .spawn("worker", move || {
                ready_tx.send(()).ok();
                let _ = stop_rx.recv();
            })
            .expect("spawn worker");

        wait_ready(&ready_rx);
        assert_eq!(registry.active_thread_names(), vec!["worker".to_string()]);
        assert_eq!(handle.name(), "worker");

        stop_tx.send(()).ok();
        handle.join().expect("join worker");
        assert!(registry.active_thread_names().is_empty());
    }

    #[test]
    fn dropping_a_handle_detaches_the_thread() {
        let registry = ThreadRegistry::new();
        let (stop_tx, stop_rx) = mpsc::channel();
        {
            let _handle = registry
                .spawn("detached", move || {
                    let _ = stop_rx.recv();
                })
                .expect("spawn detached");
        }
        assert!(registry.active_thread_names().is_empty());
        stop_tx.send(()).ok();
    }

    #[test]
    fn active_names_are_sorted() {
        let registry = ThreadRegistry::new();
        let mut stoppers = Vec::new();
        let mut handles = Vec::new();
        for name in ["zeta", "alpha"] {
            let (ready_tx, ready_rx) = mpsc::channel();
            let (stop_tx, stop_rx) = mpsc::channel();
            handles.push(
                registry
                    .spawn(name, move || {
                        ready_tx.send(()).ok();
                        let _ = stop_rx.recv();
                    })
                    .expect("spawn"),
            );
            wait_ready(&ready_rx);
            stoppers.push(stop_tx);
        }
        assert_eq!(registry.active_thread_names(), vec!["alpha", "zeta"]);
        for tx in stoppers {
            tx.send(()).ok();
        }
        for handle in handles {
            handle.join().expect("join");
        }
    }
}
