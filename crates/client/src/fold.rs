//! Event-sourcing folds over an agent's message log.
//!
//! Both folds are pure: the same ordered input always yields the same
//! output, and messages they cannot use are skipped rather than failing
//! the whole replay.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};
use vessel_domain::{
    DiscoverResult, Job, Message, ProtocolMessage, ReplyPayload, Route, Router, Subjects,
};

/// Sort for replay. Sequence order when every message carries one,
/// otherwise receipt time. The sort is stable, so ties keep fetch order and
/// the later message wins.
pub fn order_messages(messages: &mut [Message]) {
    if messages.iter().all(|m| m.sequence > 0) {
        messages.sort_by_key(|m| m.sequence);
    } else {
        messages.sort_by_key(|m| m.received);
    }
}

/// Folds start / stop / status / reply messages into jobs keyed by worker id.
#[derive(Debug, Clone)]
pub struct JobFold {
    router: Router<Route>,
    jobs: BTreeMap<String, Job>,
    /// Request message id -> worker id, for correlating replies.
    replies: HashMap<String, String>,
}

impl JobFold {
    pub fn new(subjects: &Subjects) -> Self {
        Self {
            router: subjects.router_for(&Route::JOB_LIFECYCLE),
            jobs: BTreeMap::new(),
            replies: HashMap::new(),
        }
    }

    pub fn jobs(&self) -> &BTreeMap<String, Job> {
        &self.jobs
    }

    pub fn into_jobs(self) -> BTreeMap<String, Job> {
        self.jobs
    }

    pub fn apply_all<'a>(&mut self, messages: impl IntoIterator<Item = &'a Message>) {
        for message in messages {
            self.apply(message);
        }
    }

    pub fn apply(&mut self, message: &Message) {
        let Some((route, params)) = self.router.resolve(&message.subject) else {
            debug!(subject = %message.subject, "Skipping message outside the job lifecycle");
            return;
        };
        let route = *route;
        let decoded = match message.decode() {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    subject = %message.subject,
                    sequence = message.sequence,
                    "Skipping undecodable message: {}", e
                );
                return;
            }
        };
        let at = message.received;
        let agent = params.get("agent").cloned().unwrap_or_default();
        let worker = params.get("worker").cloned().unwrap_or_default();

        match (route, decoded) {
            (Route::WorkerStart, ProtocolMessage::StartWorkerRequest(request)) => {
                self.replies.insert(message.id.clone(), worker.clone());
                self.jobs
                    .entry(worker.clone())
                    .or_insert_with(|| Job::new(worker, agent, request.command, request.args, at));
            }
            (Route::WorkerStop, ProtocolMessage::StopWorkerRequest(_)) => {
                self.replies.insert(message.id.clone(), worker.clone());
                match self.jobs.get_mut(&worker) {
                    Some(job) => job.on_stop_requested(at),
                    None => debug!(worker_id = %worker, "Stop for unknown job"),
                }
            }
            (Route::WorkerStatus, ProtocolMessage::UpdateWorkerStatus(status)) => {
                match self.jobs.get_mut(&worker) {
                    Some(job) => job.on_exit(status.exit_code, at),
                    None => debug!(worker_id = %worker, "Status for unknown job"),
                }
            }
            (Route::Reply, ProtocolMessage::ReplyMessage(reply)) => {
                let Some(job) = self
                    .replies
                    .get(&reply.correlated_message_id)
                    .and_then(|worker| self.jobs.get_mut(worker))
                else {
                    debug!(
                        correlated = %reply.correlated_message_id,
                        "Reply to an unknown request"
                    );
                    return;
                };
                match reply.payload {
                    ReplyPayload::StartWorkerResponse(response) => job.on_started(response.error, at),
                    ReplyPayload::StopWorkerResponse(response) => job.on_stopped(response.error, at),
                }
            }
            (route, decoded) => {
                warn!(
                    subject = %message.subject,
                    "Unexpected {} on {:?} subject", decoded.kind(), route
                );
            }
        }
    }
}

/// Folds connection-info announcements into the last known identity per
/// agent.
#[derive(Debug, Clone)]
pub struct DiscoverFold {
    router: Router<Route>,
    agents: BTreeMap<String, DiscoverResult>,
}

impl DiscoverFold {
    pub fn new(subjects: &Subjects) -> Self {
        Self {
            router: subjects.router_for(&[Route::ConnectionInfo]),
            agents: BTreeMap::new(),
        }
    }

    /// Make `agent_id` show up even if it never announced itself.
    pub fn register(&mut self, agent_id: &str) {
        self.agents
            .entry(agent_id.to_string())
            .or_insert_with(|| DiscoverResult::silent(agent_id));
    }

    pub fn apply(&mut self, message: &Message) {
        let Some((_, params)) = self.router.resolve(&message.subject) else {
            return;
        };
        let Some(agent_id) = params.get("agent") else {
            return;
        };
        match message.decode() {
            Ok(ProtocolMessage::UpdateClientInfo(info)) => {
                self.agents.insert(
                    agent_id.clone(),
                    DiscoverResult {
                        agent_id: agent_id.clone(),
                        username: info.username,
                        hostname: info.hostname,
                        system: info.system,
                        address: info.address,
                        last_seen: Some(message.received),
                    },
                );
            }
            Ok(other) => debug!("Ignoring {} on connection info subject", other.kind()),
            Err(e) => warn!(subject = %message.subject, "Skipping undecodable message: {}", e),
        }
    }

    pub fn into_agents(self) -> BTreeMap<String, DiscoverResult> {
        self.agents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_domain::DEFAULT_NAMESPACE;
    use chrono::{DateTime, Duration, Utc};
    use vessel_domain::{
        JobStatus, OutboundMessage, ReplyMessage, StartWorkerRequest, StopWorkerRequest,
        UpdateClientInfo, UpdateWorkerStatus, WorkerResponse,
    };

    struct Log {
        subjects: Subjects,
        messages: Vec<Message>,
        epoch: DateTime<Utc>,
    }

    impl Log {
        fn new() -> Self {
            Self {
                subjects: Subjects::new(DEFAULT_NAMESPACE).unwrap(),
                messages: Vec::new(),
                epoch: Utc::now(),
            }
        }

        fn push(&mut self, id: &str, subject: String, message: ProtocolMessage) -> Message {
            let sequence = self.messages.len() as u64 + 1;
            let outbound = OutboundMessage::new(subject, &message).unwrap().with_id(id);
            let message = Message {
                id: outbound.id,
                subject: outbound.subject,
                sequence,
                received: self.epoch + Duration::seconds(sequence as i64),
                payload: outbound.payload,
            };
            self.messages.push(message.clone());
            message
        }

        fn start(&mut self, id: &str, worker: &str) -> Message {
            let subject = self.subjects.start("a1", worker).unwrap();
            let request = StartWorkerRequest {
                command: "file:///jobs/run.sh".to_string(),
                args: vec!["--fast".to_string()],
                ..Default::default()
            };
            self.push(id, subject, request.into())
        }

        fn stop(&mut self, id: &str, worker: &str) -> Message {
            let subject = self.subjects.stop("a1", worker).unwrap();
            self.push(id, subject, StopWorkerRequest {}.into())
        }

        fn reply(&mut self, id: &str, to: &str, payload: ReplyPayload) -> Message {
            let subject = self.subjects.reply("a1", id).unwrap();
            let reply = ReplyMessage {
                correlated_message_id: to.to_string(),
                payload,
            };
            self.push(id, subject, reply.into())
        }

        fn status(&mut self, id: &str, worker: &str, exit_code: i32) -> Message {
            let subject = self.subjects.status("a1", worker).unwrap();
            self.push(id, subject, UpdateWorkerStatus { exit_code }.into())
        }

        fn fold(&self, messages: &[Message]) -> BTreeMap<String, Job> {
            let mut fold = JobFold::new(&self.subjects);
            fold.apply_all(messages);
            fold.into_jobs()
        }
    }

    fn started() -> ReplyPayload {
        ReplyPayload::StartWorkerResponse(WorkerResponse::ok())
    }

    #[test]
    fn test_start_reply_status_finishes() {
        let mut log = Log::new();
        log.start("m1", "w1");
        log.reply("m2", "m1", started());
        let running = log.fold(&log.messages);
        assert_eq!(running["w1"].status, JobStatus::Running);
        assert_eq!(running["w1"].command, "file:///jobs/run.sh");
        assert_eq!(running["w1"].args, vec!["--fast".to_string()]);
        assert_eq!(running["w1"].agent_id, "a1");

        log.status("m3", "w1", 0);
        let jobs = log.fold(&log.messages);
        assert_eq!(jobs["w1"].status, JobStatus::Finished);
        assert_eq!(jobs["w1"].error, None);
        assert_eq!(jobs["w1"].created, log.messages[0].received);
        assert_eq!(jobs["w1"].updated, log.messages[2].received);
    }

    #[test]
    fn test_status_before_reply_still_finishes() {
        let mut log = Log::new();
        let start = log.start("m1", "w1");
        let reply = log.reply("m2", "m1", started());
        let status = log.status("m3", "w1", 0);

        let jobs = log.fold(&[start, status, reply]);
        assert_eq!(jobs["w1"].status, JobStatus::Finished);
    }

    #[test]
    fn test_cancel_then_status() {
        let mut log = Log::new();
        log.start("m1", "w1");
        log.reply("m2", "m1", started());
        log.stop("m3", "w1");
        assert_eq!(log.fold(&log.messages)["w1"].status, JobStatus::Cancelling);

        log.status("m4", "w1", 130);
        assert_eq!(log.fold(&log.messages)["w1"].status, JobStatus::Cancelled);

        // a late stop acknowledgement keeps the terminal state
        log.reply("m5", "m3", ReplyPayload::StopWorkerResponse(WorkerResponse::ok()));
        assert_eq!(log.fold(&log.messages)["w1"].status, JobStatus::Cancelled);
    }

    #[test]
    fn test_failed_start_and_failed_exit() {
        let mut log = Log::new();
        log.start("m1", "w1");
        log.reply(
            "m2",
            "m1",
            ReplyPayload::StartWorkerResponse(WorkerResponse::failed("no such script")),
        );
        log.start("m3", "w2");
        log.reply("m4", "m3", started());
        log.status("m5", "w2", 2);

        let jobs = log.fold(&log.messages);
        assert_eq!(jobs["w1"].status, JobStatus::Failed);
        assert_eq!(jobs["w1"].error.as_deref(), Some("no such script"));
        assert_eq!(jobs["w2"].status, JobStatus::Failed);
        assert_eq!(jobs["w2"].error.as_deref(), Some("exit status 2"));
    }

    #[test]
    fn test_failed_stop_reply() {
        let mut log = Log::new();
        log.start("m1", "w1");
        log.reply("m2", "m1", started());
        log.stop("m3", "w1");
        log.reply(
            "m4",
            "m3",
            ReplyPayload::StopWorkerResponse(WorkerResponse::failed("Worker未找到: w1")),
        );
        let jobs = log.fold(&log.messages);
        assert_eq!(jobs["w1"].status, JobStatus::Failed);
    }

    #[test]
    fn test_fold_is_deterministic() {
        let mut log = Log::new();
        log.start("m1", "w1");
        log.reply("m2", "m1", started());
        log.start("m3", "w2");
        log.stop("m4", "w2");
        log.status("m5", "w1", 0);
        assert_eq!(log.fold(&log.messages), log.fold(&log.messages));

        // replaying the log into the same fold changes nothing
        let mut fold = JobFold::new(&log.subjects);
        fold.apply_all(&log.messages);
        let once = fold.jobs().clone();
        fold.apply_all(&log.messages);
        assert_eq!(fold.jobs(), &once);
    }

    #[test]
    fn test_unrelated_workers_do_not_disturb_resolved_jobs() {
        let mut log = Log::new();
        log.start("m1", "w1");
        log.reply("m2", "m1", started());
        log.status("m3", "w1", 0);
        let before = log.fold(&log.messages)["w1"].clone();

        log.start("m4", "w2");
        log.stop("m5", "w2");
        log.status("m6", "w2", 130);
        let after = log.fold(&log.messages);
        assert_eq!(after["w1"], before);
        assert_eq!(after["w2"].status, JobStatus::Cancelled);
    }

    #[test]
    fn test_undecodable_and_orphan_messages_are_skipped() {
        let mut log = Log::new();
        let start = log.start("m1", "w1");
        let garbage = Message {
            id: "junk".to_string(),
            subject: log.subjects.status("a1", "w1").unwrap(),
            sequence: 2,
            received: log.epoch,
            payload: b"\x00\x01not a message".to_vec(),
        };
        let reply = log.reply("m2", "m1", started());
        let orphan_status = log.status("m3", "ghost", 0);
        let orphan_reply = log.reply("m4", "never-sent", started());

        let jobs = log.fold(&[start, garbage, reply, orphan_status, orphan_reply]);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs["w1"].status, JobStatus::Running);
    }

    #[test]
    fn test_order_prefers_sequence_and_keeps_ties_stable() {
        let mut log = Log::new();
        let first = log.start("m1", "w1");
        let second = log.status("m2", "w1", 1);
        let third = log.status("m3", "w1", 0);

        let mut messages = vec![third.clone(), first.clone(), second.clone()];
        order_messages(&mut messages);
        let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);

        // without sequences the receipt time decides; equal times keep
        // fetch order, so the later status wins
        let mut unsequenced: Vec<Message> = [first, third, second]
            .into_iter()
            .map(|mut m| {
                m.sequence = 0;
                if m.id != "m1" {
                    m.received = log.epoch + Duration::seconds(10);
                }
                m
            })
            .collect();
        order_messages(&mut unsequenced);
        let ids: Vec<_> = unsequenced.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m3", "m2"]);
        assert_eq!(log.fold(&unsequenced)["w1"].status, JobStatus::Failed);
    }

    #[test]
    fn test_discover_fold_keeps_latest_announcement() {
        let mut log = Log::new();
        let subject = log.subjects.connection_info("a1").unwrap();
        let info = |host: &str| UpdateClientInfo {
            username: "ops".to_string(),
            hostname: host.to_string(),
            system: "linux/x86_64".to_string(),
            address: "10.0.0.7".to_string(),
        };
        log.push("m1", subject.clone(), info("old-host").into());
        let latest = log.push("m2", subject, info("new-host").into());

        let mut fold = DiscoverFold::new(&log.subjects);
        fold.register("a1");
        fold.register("a2");
        for message in &log.messages {
            fold.apply(message);
        }
        let agents = fold.into_agents();
        assert_eq!(agents["a1"].hostname, "new-host");
        assert_eq!(agents["a1"].last_seen, Some(latest.received));
        assert_eq!(agents["a2"], DiscoverResult::silent("a2"));
    }
}
