use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::lttb;
use crate::observation::Dataset;
use crate::request::{PointBudget, RequestId, RequestIds, SampleRequest, SampleResult};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Run the sampler on a background thread. When false every request is
    /// sampled inline on the caller's thread.
    pub use_worker: bool,
    /// How long a caller waits for the worker before giving up. `None` or
    /// zero waits forever.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Option<Duration>,
    pub worker_name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            use_worker: true,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            worker_name: "envsample-lttb".to_string(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("sampling request {0} timed out after {1:?}")]
    Timeout(RequestId, Duration),
    #[error("sampling request {0} was abandoned at dispatcher shutdown")]
    Abandoned(RequestId),
    #[error("sampling worker is gone")]
    WorkerGone,
}

type Reply = oneshot::Sender<Result<Dataset, DispatchError>>;

/// Number of submitted requests not yet resolved. Raised by the submitter,
/// lowered by the router.
type InFlight = Arc<watch::Sender<usize>>;

enum Command {
    Submit { request: SampleRequest, reply: Reply },
    Expire(RequestId),
}

enum Backend {
    Inline,
    Worker {
        commands: async_channel::Sender<Command>,
        requests: async_channel::Sender<SampleRequest>,
    },
}

/// Runs LTTB downsampling off the caller's thread.
///
/// Each dispatcher owns one worker thread and one router task. The router is
/// the only owner of the pending-request map: it registers submissions,
/// forwards them to the worker and hands each result to the caller that
/// asked for it. Dropping the dispatcher stops both; requests still pending
/// at that point resolve to [`DispatchError::Abandoned`].
///
/// Without a Tokio runtime at construction time, or with `use_worker` off,
/// the dispatcher samples inline instead.
pub struct Dispatcher {
    request_timeout: Option<Duration>,
    ids: RequestIds,
    backend: Backend,
    in_flight: InFlight,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let in_flight: InFlight = Arc::new(watch::channel(0).0);
        let backend = if !config.use_worker {
            debug!("sampling worker disabled, sampling inline");
            Backend::Inline
        } else {
            match spawn_worker(&config.worker_name, in_flight.clone()) {
                Ok(backend) => backend,
                Err(err) => {
                    warn!(error = %err, "sampling worker unavailable, falling back to inline sampling");
                    Backend::Inline
                }
            }
        };

        Dispatcher {
            request_timeout: config.request_timeout.filter(|t| !t.is_zero()),
            ids: RequestIds::new(),
            backend,
            in_flight,
        }
    }

    /// Downsample `data` to at most `budget` points of `value_key`.
    ///
    /// Small datasets and unbounded budgets resolve immediately with `data`
    /// itself. Otherwise the request is submitted before this returns, and
    /// the future resolves once the worker answers. The future does not
    /// borrow the dispatcher.
    pub fn sample_async(
        &self,
        data: Dataset,
        budget: PointBudget,
        value_key: &str,
    ) -> impl Future<Output = Result<Dataset, DispatchError>> + Send + 'static {
        let ticket = self.submit(data, budget, value_key);
        let timeout = self.request_timeout;
        async move {
            match ticket {
                Ticket::Ready(result) => result,
                Ticket::Waiting {
                    id,
                    receiver,
                    commands,
                } => wait(id, receiver, commands, timeout).await,
            }
        }
    }

    fn submit(&self, data: Dataset, budget: PointBudget, value_key: &str) -> Ticket {
        let threshold = match budget {
            PointBudget::Points(n) if data.len() > n => n,
            _ => return Ticket::Ready(Ok(data)),
        };

        let request = SampleRequest {
            request_id: self.ids.next_id(),
            dataset: data,
            target_point_count: threshold,
            value_key: value_key.to_string(),
        };

        let commands = match &self.backend {
            Backend::Inline => return Ticket::Ready(Ok(execute(request).sampled)),
            Backend::Worker { commands, .. } => commands.clone(),
        };

        let id = request.request_id;
        let (reply, receiver) = oneshot::channel();
        self.in_flight.send_modify(|n| *n += 1);
        if commands.try_send(Command::Submit { request, reply }).is_err() {
            settle(&self.in_flight, 1);
            return Ticket::Ready(Err(DispatchError::WorkerGone));
        }
        Ticket::Waiting {
            id,
            receiver,
            commands,
        }
    }

    /// True while at least one submitted request has not been resolved.
    pub fn is_processing(&self) -> bool {
        *self.in_flight.borrow() > 0
    }

    /// Number of unresolved requests, updated as they are submitted and
    /// resolved.
    pub fn watch_in_flight(&self) -> watch::Receiver<usize> {
        self.in_flight.subscribe()
    }

    /// True if requests are sampled on the caller's thread.
    pub fn is_inline(&self) -> bool {
        matches!(self.backend, Backend::Inline)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // The worker is not joined: closing its queue ends the thread once
        // the request in hand is done, without blocking the dropping thread.
        if let Backend::Worker { commands, requests } = &self.backend {
            commands.close();
            requests.close();
            debug!("sampling worker stopping");
        }
    }
}

enum Ticket {
    Ready(Result<Dataset, DispatchError>),
    Waiting {
        id: RequestId,
        receiver: oneshot::Receiver<Result<Dataset, DispatchError>>,
        commands: async_channel::Sender<Command>,
    },
}

async fn wait(
    id: RequestId,
    receiver: oneshot::Receiver<Result<Dataset, DispatchError>>,
    commands: async_channel::Sender<Command>,
    timeout: Option<Duration>,
) -> Result<Dataset, DispatchError> {
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, receiver).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // Router drops the entry; a late result is discarded there.
                let _ = commands.try_send(Command::Expire(id));
                warn!(request_id = %id, timeout = ?limit, "sampling request timed out");
                return Err(DispatchError::Timeout(id, limit));
            }
        },
        None => receiver.await,
    };
    outcome.unwrap_or(Err(DispatchError::Abandoned(id)))
}

fn settle(in_flight: &watch::Sender<usize>, resolved: usize) {
    in_flight.send_modify(|n| *n = n.saturating_sub(resolved));
}

/// Samples one request. Shared by the worker thread and the inline path.
pub fn execute(request: SampleRequest) -> SampleResult {
    let sampled: Dataset = lttb::sample(
        &request.dataset,
        request.target_point_count,
        &request.value_key,
    )
    .into();
    SampleResult {
        request_id: request.request_id,
        original_length: request.dataset.len(),
        sampled_length: sampled.len(),
        sampled,
    }
}

fn spawn_worker(name: &str, in_flight: InFlight) -> eyre::Result<Backend> {
    let runtime = tokio::runtime::Handle::try_current()?;

    let (request_send, request_recv) = async_channel::unbounded::<SampleRequest>();
    let (result_send, result_recv) = async_channel::unbounded::<SampleResult>();
    let (command_send, command_recv) = async_channel::unbounded::<Command>();

    // Detached; it exits when the request queue is closed.
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || worker(request_recv, result_send))?;

    runtime.spawn(route(
        command_recv,
        request_send.clone(),
        result_recv,
        in_flight,
    ));
    debug!(worker = name, "sampling worker started");

    Ok(Backend::Worker {
        commands: command_send,
        requests: request_send,
    })
}

fn worker(
    request_recv: async_channel::Receiver<SampleRequest>,
    result_send: async_channel::Sender<SampleResult>,
) {
    while let Ok(request) = request_recv.recv_blocking() {
        // Closed means the dispatcher is gone; skip the backlog.
        if request_recv.is_closed() {
            break;
        }
        if result_send.send_blocking(execute(request)).is_err() {
            break;
        }
    }
}

async fn route(
    command_recv: async_channel::Receiver<Command>,
    request_send: async_channel::Sender<SampleRequest>,
    result_recv: async_channel::Receiver<SampleResult>,
    in_flight: InFlight,
) {
    let mut pending: HashMap<RequestId, Reply> = HashMap::new();
    let mut worker_alive = true;

    loop {
        tokio::select! {
            biased;

            command = command_recv.recv() => match command {
                // Submissions queued behind a shutdown are abandoned.
                Ok(Command::Submit { .. }) if command_recv.is_closed() => settle(&in_flight, 1),
                Ok(Command::Submit { request, reply }) => {
                    if !worker_alive {
                        settle(&in_flight, 1);
                        let _ = reply.send(Err(DispatchError::WorkerGone));
                        continue;
                    }
                    let id = request.request_id;
                    pending.insert(id, reply);
                    if request_send.send(request).await.is_err() {
                        if let Some(reply) = pending.remove(&id) {
                            settle(&in_flight, 1);
                            let _ = reply.send(Err(DispatchError::WorkerGone));
                        }
                    }
                }
                Ok(Command::Expire(id)) => {
                    if pending.remove(&id).is_some() {
                        settle(&in_flight, 1);
                        debug!(request_id = %id, "purged expired sampling request");
                    }
                }
                Err(_) => break,
            },

            result = result_recv.recv(), if worker_alive => match result {
                Ok(result) => match pending.remove(&result.request_id) {
                    Some(reply) => {
                        // Settle first, so a woken caller never sees a stale count.
                        settle(&in_flight, 1);
                        debug!(
                            request_id = %result.request_id,
                            original = result.original_length,
                            sampled = result.sampled_length,
                            "sampling request resolved"
                        );
                        let _ = reply.send(Ok(result.sampled));
                    }
                    None => {
                        debug!(request_id = %result.request_id, "dropping result for unknown request");
                    }
                },
                Err(_) => {
                    worker_alive = false;
                    if !command_recv.is_closed() {
                        warn!(pending = pending.len(), "sampling worker exited unexpectedly");
                        settle(&in_flight, pending.len());
                        for (_, reply) in pending.drain() {
                            let _ = reply.send(Err(DispatchError::WorkerGone));
                        }
                    }
                }
            },
        }
    }

    // Dropping the remaining replies resolves their callers as abandoned.
    pending.clear();
    in_flight.send_replace(0);
}
