//! Dedicated compile thread.
//!
//! Palette lookups and PVRT encoding are CPU-bound, so they run on one OS
//! thread outside the async runtime. Jobs go in over a std channel and
//! each result comes back through a `tokio::sync::oneshot`.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::blob::Blob;
use crate::error::{PvrtError, Result};
use crate::iprog::{Iprog, IprogOptions, build_iprog};
use crate::palette::Palette;

struct Job {
    name: String,
    data: Vec<u8>,
    options: IprogOptions,
    reply: oneshot::Sender<Result<Iprog>>,
}

pub struct CompileWorker {
    jobs: Option<mpsc::Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl CompileWorker {
    /// Start the worker thread bound to one blob and palette.
    pub fn spawn(blob: Arc<Blob>, palette: Arc<Palette>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let handle = std::thread::Builder::new()
            .name("pvrt-compile".into())
            .spawn(move || {
                for job in rx {
                    debug!(name = %job.name, len = job.data.len(), "compile job started");
                    let result = build_iprog(&job.name, &job.data, &blob, &palette, &job.options);
                    if job.reply.send(result).is_err() {
                        debug!(name = %job.name, "compile result dropped: caller went away");
                    }
                }
            })?;
        Ok(Self {
            jobs: Some(tx),
            handle: Some(handle),
        })
    }

    /// Build the IPROG for `data` on the worker thread.
    pub async fn build(&self, name: impl Into<String>, data: Vec<u8>, options: IprogOptions) -> Result<Iprog> {
        let (reply, rx) = oneshot::channel();
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| PvrtError::Other("compile worker stopped".into()))?;
        jobs.send(Job {
            name: name.into(),
            data,
            options,
            reply,
        })
        .map_err(|_| PvrtError::Other("compile worker stopped".into()))?;
        rx.await
            .map_err(|_| PvrtError::Other("compile worker exited before replying".into()))?
    }

    /// Stop accepting jobs and wait for the thread to drain.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("compile worker panicked");
            }
        }
    }
}

impl Drop for CompileWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
