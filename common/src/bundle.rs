use std::future::Future;

use async_std::task::JoinHandle;

/// Runs a set of background futures side by side, the way a node's consensus
/// driver and its RPC listener run concurrently in the teacher's
/// `TaskResultBundle`.
///
/// Unlike the teacher's version (which transmutes a borrowed future to
/// `'static` to support scoped tasks) this only accepts owned, `'static`
/// futures; every caller in this workspace already owns `Arc`-backed state,
/// so there is no need for the unsafe escape hatch.
pub struct TaskBundle {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl TaskBundle {
    pub fn new() -> Self {
        Self { handles: vec![] }
    }

    pub fn add<F: Future<Output = ()> + Send + 'static>(&mut self, name: &'static str, f: F) {
        self.handles.push((name, async_std::task::spawn(f)));
    }

    /// Waits for every task in the bundle to finish. Tasks in this codebase
    /// run until cancelled, so this normally only returns during shutdown.
    pub async fn join(self) {
        for (name, handle) in self.handles {
            handle.await;
            eprintln!("[bundle] task '{}' exited", name);
        }
    }
}

impl Default for TaskBundle {
    fn default() -> Self {
        Self::new()
    }
}
