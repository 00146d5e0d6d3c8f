//! Transport between the host and an out-of-process instance worker.
//!
//! ```text
//! GenericInstance ──call(ProcedureCall)──▶ ChannelBridge ──mpsc──▶ worker
//!        ▲                                     │
//!        └──── oneshot (matched by id) ◀── reader task ◀──mpsc── ProcedureCallResult
//!                                              │
//!              NoticeSink ◀────────────────────┘◀──mpsc── WorkerNotice
//! ```
//!
//! The reader drains queued notices before it looks at results, so a notice
//! the worker sent before answering a call is delivered before that answer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use lodestone_core::{Error, InstanceUuid, Player, Result};
use lodestone_protocol::{ProcedureCall, ProcedureCallResult, is_compatible, protocol_version};
use semver::Version;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delivers procedure calls to a worker and returns its answers.
///
/// Transport failures are `HandlerFault`s. A failure reported by the worker
/// itself arrives as an unsuccessful [`ProcedureCallResult`].
#[async_trait]
pub trait ProcedureBridge: Send + Sync {
    /// Protocol version the worker advertised.
    fn protocol_version(&self) -> &Version;

    async fn call(&self, call: ProcedureCall) -> Result<ProcedureCallResult>;

    /// Route worker notices to `sink`, replacing any earlier sink.
    ///
    /// Bridges whose transport carries no notices ignore this.
    fn set_notice_sink(&self, _sink: Arc<dyn NoticeSink>) {}
}

/// Something a worker reports on its own, outside any call.
#[derive(Debug, Clone)]
pub enum WorkerNotice {
    Output {
        instance_uuid: InstanceUuid,
        instance_name: String,
        message: String,
    },
    SystemMessage {
        instance_uuid: InstanceUuid,
        instance_name: String,
        message: String,
    },
    PlayerChange {
        instance_uuid: InstanceUuid,
        instance_name: String,
        player_list: Vec<Player>,
        players_joined: Vec<Player>,
        players_left: Vec<Player>,
    },
    /// Progress of the lifecycle call the instance is currently running.
    Progress {
        instance_uuid: InstanceUuid,
        progress: f64,
        message: String,
    },
    /// The server process ended without being asked to.
    Exited {
        instance_uuid: InstanceUuid,
        crashed: bool,
    },
}

impl WorkerNotice {
    pub fn instance_uuid(&self) -> InstanceUuid {
        match self {
            WorkerNotice::Output { instance_uuid, .. }
            | WorkerNotice::SystemMessage { instance_uuid, .. }
            | WorkerNotice::PlayerChange { instance_uuid, .. }
            | WorkerNotice::Progress { instance_uuid, .. }
            | WorkerNotice::Exited { instance_uuid, .. } => *instance_uuid,
        }
    }
}

/// Receives the notices a bridge reads from its worker.
pub trait NoticeSink: Send + Sync {
    fn notice(&self, notice: WorkerNotice);
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<ProcedureCallResult>>>>;
type SharedSink = Arc<Mutex<Option<Arc<dyn NoticeSink>>>>;

/// The worker's half of a [`ChannelBridge`].
#[derive(Debug)]
pub struct WorkerEnd {
    pub calls: mpsc::Receiver<ProcedureCall>,
    pub results: mpsc::Sender<ProcedureCallResult>,
    pub notices: mpsc::Sender<WorkerNotice>,
}

/// A bridge over tokio channels, for workers hosted in this process or
/// behind a transport that feeds these channels.
pub struct ChannelBridge {
    version: Version,
    calls: mpsc::Sender<ProcedureCall>,
    pending: Pending,
    sink: SharedSink,
    reader: JoinHandle<()>,
}

impl ChannelBridge {
    /// Connect to a worker advertising `worker_version`.
    ///
    /// Fails with `InvalidInput` when the worker speaks an incompatible
    /// protocol.
    pub fn connect(worker_version: Version, capacity: usize) -> Result<(Self, WorkerEnd)> {
        if !is_compatible(&worker_version) {
            return Err(Error::invalid_input(format!(
                "worker speaks protocol {worker_version}, host speaks {}",
                protocol_version()
            )));
        }

        let (calls, calls_rx) = mpsc::channel(capacity.max(1));
        let (results_tx, results) = mpsc::channel(capacity.max(1));
        let (notices_tx, notices) = mpsc::channel(capacity.max(1));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let sink: SharedSink = Arc::new(Mutex::new(None));
        let reader = tokio::spawn(read_worker(
            results,
            notices,
            Arc::clone(&pending),
            Arc::clone(&sink),
        ));
        info!(%worker_version, "worker bridge connected");

        Ok((
            Self {
                version: worker_version,
                calls,
                pending,
                sink,
                reader,
            },
            WorkerEnd {
                calls: calls_rx,
                results: results_tx,
                notices: notices_tx,
            },
        ))
    }

    /// Calls waiting for an answer.
    pub fn in_flight(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl ProcedureBridge for ChannelBridge {
    fn protocol_version(&self) -> &Version {
        &self.version
    }

    async fn call(&self, call: ProcedureCall) -> Result<ProcedureCallResult> {
        let id = call.id;
        let kind = call.kind();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.contains_key(&id) {
                return Err(Error::conflict(format!("call id {id} is already in flight")));
            }
            pending.insert(id, tx);
        }
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };

        self.calls
            .send(call)
            .await
            .map_err(|_| Error::handler_fault("worker is gone"))?;
        let result = rx
            .await
            .map_err(|_| Error::handler_fault(format!("worker went away before answering {kind}")))?;

        if result.procedure_call_kind != kind {
            return Err(Error::handler_fault(format!(
                "worker answered {kind} call {id} as {}",
                result.procedure_call_kind
            )));
        }
        Ok(result)
    }

    fn set_notice_sink(&self, sink: Arc<dyn NoticeSink>) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }
}

impl Drop for ChannelBridge {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for ChannelBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBridge")
            .field("version", &self.version)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Forgets a pending call when its caller gives up.
struct PendingSlot<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

async fn read_worker(
    mut results: mpsc::Receiver<ProcedureCallResult>,
    mut notices: mpsc::Receiver<WorkerNotice>,
    pending: Pending,
    sink: SharedSink,
) {
    loop {
        tokio::select! {
            biased;
            Some(notice) = notices.recv() => deliver(&sink, notice),
            result = results.recv() => match result {
                Some(result) => answer(&pending, result),
                None => break,
            },
        }
    }
    // Dropping the senders fails every outstanding call.
    let abandoned = {
        let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
        let count = pending.len();
        pending.clear();
        count
    };
    debug!(abandoned, "worker closed its result channel");
}

fn answer(pending: &Pending, result: ProcedureCallResult) {
    let waiter = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&result.id);
    match waiter {
        Some(waiter) => {
            let _ = waiter.send(result);
        }
        None => warn!(call_id = result.id, "dropping result for a call nobody is waiting on"),
    }
}

fn deliver(sink: &SharedSink, notice: WorkerNotice) {
    let sink = sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
    match sink {
        Some(sink) => sink.notice(notice),
        None => debug!(instance = %notice.instance_uuid(), "no sink for worker notice, dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone_core::{ErrorKind, InstanceUuid};
    use lodestone_protocol::{ProcedureCallInner, ProcedureCallKind, ProcedureCallResultInner};

    fn get_name(id: u64) -> ProcedureCall {
        ProcedureCall::new(
            id,
            ProcedureCallInner::GetName {
                instance_uuid: InstanceUuid::new(),
            },
        )
    }

    #[test]
    fn incompatible_worker_is_refused() {
        let err = ChannelBridge::connect(Version::new(2, 0, 0), 4).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn answers_are_matched_by_id() {
        let (bridge, mut worker) = ChannelBridge::connect(protocol_version(), 4).unwrap();
        tokio::spawn(async move {
            while let Some(call) = worker.calls.recv().await {
                let name = format!("worker-{}", call.id);
                let result = ProcedureCallResult::ok(
                    call.id,
                    call.kind(),
                    ProcedureCallResultInner::String(name),
                );
                worker.results.send(result).await.unwrap();
            }
        });

        let (a, b) = tokio::join!(bridge.call(get_name(1)), bridge.call(get_name(2)));
        assert_eq!(
            a.unwrap().into_result().unwrap(),
            ProcedureCallResultInner::String("worker-1".to_string())
        );
        assert_eq!(
            b.unwrap().into_result().unwrap(),
            ProcedureCallResultInner::String("worker-2".to_string())
        );
        assert_eq!(bridge.in_flight(), 0);
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl NoticeSink for Recorder {
        fn notice(&self, notice: WorkerNotice) {
            if let WorkerNotice::Output { message, .. } = notice {
                self.0.lock().unwrap().push(message);
            }
        }
    }

    #[tokio::test]
    async fn notices_arrive_before_the_answer_that_follows_them() {
        let (bridge, mut worker) = ChannelBridge::connect(protocol_version(), 4).unwrap();
        let recorder = Arc::new(Recorder::default());
        bridge.set_notice_sink(recorder.clone());
        tokio::spawn(async move {
            while let Some(call) = worker.calls.recv().await {
                for line in ["loading", "ready"] {
                    let notice = WorkerNotice::Output {
                        instance_uuid: InstanceUuid::new(),
                        instance_name: "scripted".to_string(),
                        message: line.to_string(),
                    };
                    worker.notices.send(notice).await.unwrap();
                }
                let result = ProcedureCallResult::ok(
                    call.id,
                    call.kind(),
                    ProcedureCallResultInner::String("done".to_string()),
                );
                worker.results.send(result).await.unwrap();
            }
        });

        bridge.call(get_name(1)).await.unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec!["loading", "ready"]);
    }

    #[tokio::test]
    async fn vanished_worker_is_a_fault() {
        let (bridge, mut worker) = ChannelBridge::connect(protocol_version(), 4).unwrap();
        tokio::spawn(async move {
            let _ = worker.calls.recv().await;
            drop(worker);
        });

        let err = bridge.call(get_name(1)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::HandlerFault);
        assert_eq!(bridge.in_flight(), 0);
    }

    #[tokio::test]
    async fn mismatched_kind_is_a_fault() {
        let (bridge, mut worker) = ChannelBridge::connect(protocol_version(), 4).unwrap();
        tokio::spawn(async move {
            if let Some(call) = worker.calls.recv().await {
                let result = ProcedureCallResult::ok(
                    call.id,
                    ProcedureCallKind::GetPort,
                    ProcedureCallResultInner::Num(25565),
                );
                worker.results.send(result).await.unwrap();
            }
        });

        let err = bridge.call(get_name(9)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::HandlerFault);
    }
}
