use super::netlink::RtNetlink;
use super::NetOps;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};

/// Work to run inside a network namespace, handed the namespace's `NetOps`
pub type NsJob = Box<dyn FnOnce(Arc<dyn NetOps>) -> BoxFuture<'static, Result<()>> + Send>;

/// Runs jobs inside a target network namespace
#[async_trait]
pub trait NamespaceExec: Send + Sync {
    async fn run(&self, netns: &Path, job: NsJob) -> Result<()>;
}

/// Switches the calling thread into a network namespace and switches it back
/// when dropped, on every exit path.
pub struct NetnsGuard {
    original: File,
    target: PathBuf,
}

impl NetnsGuard {
    pub fn enter(netns: &Path) -> Result<Self> {
        let original = File::open("/proc/thread-self/ns/net")
            .context("Failed to open current network namespace")?;
        let target = File::open(netns)
            .with_context(|| format!("Failed to open network namespace {}", netns.display()))?;

        setns(&target, CloneFlags::CLONE_NEWNET)
            .with_context(|| format!("Failed to enter network namespace {}", netns.display()))?;
        debug!("Entered network namespace {}", netns.display());

        Ok(Self {
            original,
            target: netns.to_path_buf(),
        })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        match setns(&self.original, CloneFlags::CLONE_NEWNET) {
            Ok(()) => debug!("Left network namespace {}", self.target.display()),
            Err(e) => error!(
                "Failed to restore network namespace after {}: {}",
                self.target.display(),
                e
            ),
        }
    }
}

/// Runs each job on a dedicated OS thread that enters the namespace, starts
/// a current-thread runtime and opens a netlink socket there.
///
/// Namespace membership is per thread, so the job never runs on a shared
/// tokio worker.
pub struct ThreadNamespaceExec {
    sysfs_root: PathBuf,
}

impl ThreadNamespaceExec {
    pub fn new(sysfs_root: PathBuf) -> Self {
        Self { sysfs_root }
    }
}

fn run_in_namespace(netns: &Path, sysfs_root: PathBuf, job: NsJob) -> Result<()> {
    let _guard = NetnsGuard::enter(netns)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build namespace runtime")?;

    runtime.block_on(async move {
        let ops: Arc<dyn NetOps> = Arc::new(RtNetlink::connect(sysfs_root)?);
        job(ops).await
    })
}

#[async_trait]
impl NamespaceExec for ThreadNamespaceExec {
    async fn run(&self, netns: &Path, job: NsJob) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let target = netns.to_path_buf();
        let sysfs_root = self.sysfs_root.clone();

        std::thread::Builder::new()
            .name("podwire-netns".to_string())
            .spawn(move || {
                let _ = tx.send(run_in_namespace(&target, sysfs_root, job));
            })
            .context("Failed to spawn namespace thread")?;

        rx.await
            .map_err(|_| anyhow!("Namespace thread for {} exited early", netns.display()))?
    }
}
