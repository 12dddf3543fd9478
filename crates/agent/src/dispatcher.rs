use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vessel_domain::{
    ProtocolMessage, ReplyMessage, ReplyPayload, Route, Router, StartWorkerRequest,
    WorkerResponse,
};
use vessel_errors::{VesselError, VesselResult};

use crate::pipeline::{forward, Inbound, Outbound};
use crate::worker::{Worker, WorkerContext, WorkerEvent};

/// Agent-side registry of running workers.
///
/// Owned by a single task: every mutation happens in [`Dispatcher::run`] or
/// through `&mut self` before it starts.
struct RunningWorker {
    generation: u64,
    token: CancellationToken,
}

pub struct Dispatcher {
    ctx: WorkerContext,
    router: Router<Route>,
    cancel: CancellationToken,
    workers: HashMap<String, RunningWorker>,
    next_generation: u64,
    /// Spawned workers that have not reported `Stopped` yet. Differs from
    /// `workers.len()` once a cancelled worker is still winding down.
    live: usize,
    stopped: usize,
    events_tx: mpsc::Sender<WorkerEvent>,
    events_rx: mpsc::Receiver<WorkerEvent>,
}

impl Dispatcher {
    pub fn new(ctx: WorkerContext, cancel: CancellationToken) -> Self {
        let router = ctx
            .subjects
            .router_for(&[Route::WorkerStart, Route::WorkerStop]);
        let (events_tx, events_rx) = mpsc::channel(1);
        Self {
            ctx,
            router,
            cancel,
            workers: HashMap::new(),
            next_generation: 0,
            live: 0,
            stopped: 0,
            events_tx,
            events_rx,
        }
    }

    pub fn live_workers(&self) -> usize {
        self.live
    }

    /// `Stopped` events handled so far.
    pub fn stopped_workers(&self) -> usize {
        self.stopped
    }

    pub fn is_running(&self, worker_id: &str) -> bool {
        self.workers.contains_key(worker_id)
    }

    /// Spawn a worker and return its id without waiting for it to start.
    /// A redelivered request for a worker that is still running is a no-op.
    pub fn create_job(
        &mut self,
        worker_id: Option<String>,
        request: StartWorkerRequest,
    ) -> VesselResult<String> {
        if self.cancel.is_cancelled() {
            return Err(VesselError::Cancelled);
        }
        let id = worker_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.workers.contains_key(&id) {
            debug!(worker_id = %id, "worker already running");
            return Ok(id);
        }

        info!(
            worker_id = %id,
            command = %request.command,
            "Starting worker"
        );
        let token = self.cancel.child_token();
        self.next_generation += 1;
        let generation = self.next_generation;
        let worker = Worker::new(id.clone(), generation, request, self.ctx.clone());
        tokio::spawn(worker.run(token.clone(), self.events_tx.clone()));
        self.workers
            .insert(id.clone(), RunningWorker { generation, token });
        self.live += 1;
        Ok(id)
    }

    pub fn cancel_job(&mut self, worker_id: &str) -> VesselResult<()> {
        match self.workers.remove(worker_id) {
            Some(worker) => {
                info!(worker_id = %worker_id, "Cancelling worker");
                worker.token.cancel();
                Ok(())
            }
            None => {
                warn!("Worker取消失败: {} 不在运行中", worker_id);
                Err(VesselError::worker_not_found(worker_id))
            }
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Started { id, .. } => debug!(worker_id = %id, "Worker started"),
            WorkerEvent::Stopped { id, generation } => {
                // 同一ID可能已被新的Worker复用
                if self
                    .workers
                    .get(&id)
                    .is_some_and(|worker| worker.generation == generation)
                {
                    self.workers.remove(&id);
                }
                self.live = self.live.saturating_sub(1);
                self.stopped += 1;
                info!(worker_id = %id, live = self.live, "Worker stopped");
            }
        }
    }

    /// Apply one inbound request; `None` means there is nothing to reply.
    fn handle_request(&mut self, inbound: &Inbound) -> Option<ReplyPayload> {
        let subject = &inbound.delivery.message.subject;
        let Some((route, params)) = self.router.resolve(subject) else {
            warn!(subject = %subject, "No route for subject");
            return None;
        };
        let worker_id = params.get("worker").cloned();

        match (*route, &inbound.message) {
            (Route::WorkerStart, ProtocolMessage::StartWorkerRequest(request)) => {
                let response = match self.create_job(worker_id, request.clone()) {
                    Ok(_) => WorkerResponse::ok(),
                    Err(e) => WorkerResponse::failed(e.to_string()),
                };
                Some(ReplyPayload::StartWorkerResponse(response))
            }
            (Route::WorkerStop, ProtocolMessage::StopWorkerRequest(_)) => {
                let result = match worker_id {
                    Some(id) => self.cancel_job(&id),
                    None => Err(VesselError::worker_not_found("")),
                };
                let response = match result {
                    Ok(()) => WorkerResponse::ok(),
                    Err(e) => WorkerResponse::failed(e.to_string()),
                };
                Some(ReplyPayload::StopWorkerResponse(response))
            }
            (route, message) => {
                warn!(
                    subject = %subject,
                    "Unexpected {} on {:?} subject", message.kind(), route
                );
                None
            }
        }
    }

    fn reply(&self, inbound: Inbound, payload: ReplyPayload) -> Result<Outbound, Inbound> {
        let correlated = inbound.delivery.message.id.clone();
        match self.ctx.subjects.reply(&self.ctx.agent_id, &correlated) {
            Ok(subject) => Ok(Outbound {
                subject,
                message: ReplyMessage {
                    correlated_message_id: correlated,
                    payload,
                }
                .into(),
                ack: Some(inbound.delivery),
            }),
            Err(e) => {
                warn!("Cannot reply to message {}: {}", correlated, e);
                Err(inbound)
            }
        }
    }

    /// Business stage of the agent's connector. Returns after the dispatcher
    /// token is cancelled (or the inbound side closes) and every spawned
    /// worker has reported `Stopped`.
    pub async fn run(
        &mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        outbound: mpsc::Sender<Outbound>,
    ) -> VesselResult<()> {
        info!(agent_id = %self.ctx.agent_id, "Dispatcher running");
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                request = inbound.recv() => {
                    let Some(request) = request else { break };
                    let unanswered = match self.handle_request(&request) {
                        Some(payload) => match self.reply(request, payload) {
                            Ok(reply) => {
                                if !forward(&outbound, reply, &cancel).await {
                                    break;
                                }
                                None
                            }
                            Err(request) => Some(request),
                        },
                        None => Some(request),
                    };
                    if let Some(request) = unanswered {
                        request.delivery.ack().await?;
                    }
                }
            }
        }
        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        info!(
            agent_id = %self.ctx.agent_id,
            live = self.live,
            "Dispatcher shutting down"
        );
        self.cancel.cancel();
        for (_, worker) in self.workers.drain() {
            worker.token.cancel();
        }
        while self.live > 0 {
            match self.events_rx.recv().await {
                Some(event) => self.handle_event(event),
                None => break,
            }
        }
        info!(agent_id = %self.ctx.agent_id, stopped = self.stopped, "Dispatcher stopped");
    }
}
