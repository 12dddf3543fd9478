use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use vessel_agent::AgentService;
use vessel_client::{JobTracker, Operator};
use vessel_config::AppConfig;
use vessel_domain::{DiscoverResult, Job, Subjects};
use vessel_infrastructure::{BusFactory, BusHandles, FileSystemRegistry, ShellRuntime};

/// 应用运行模式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppMode {
    /// 作为Agent运行，执行下发的任务
    Agent,
    /// 列出任务，可限定某个Agent
    Jobs { agent: Option<String> },
    Job { id: String },
    Discover,
    Start {
        agent: String,
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
    Stop { agent: String, worker: String },
    Stdin {
        agent: String,
        worker: String,
        data: Vec<u8>,
    },
    Stdout {
        agent: String,
        worker: String,
        from: u64,
    },
}

/// 主应用程序
#[derive(Clone)]
pub struct Application {
    config: AppConfig,
    handles: BusHandles,
    subjects: Subjects,
}

impl Application {
    /// 创建新的应用实例
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用程序，消息总线: {:?}", config.bus.kind);
        let handles = BusFactory::create(&config.bus)
            .await
            .context("创建消息总线失败")?;
        let subjects = Subjects::new(&config.bus.namespace).context("无效的主题命名空间")?;
        Ok(Self {
            config,
            handles,
            subjects,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn tracker(&self) -> JobTracker {
        JobTracker::new(Arc::clone(&self.handles.bus), self.subjects.clone())
            .with_fetch_batch_size(self.config.client.fetch_batch_size)
    }

    pub fn operator(&self) -> Operator {
        Operator::new(Arc::clone(&self.handles.bus), self.subjects.clone())
            .with_tracker(self.tracker())
    }

    pub fn agent_service(&self) -> AgentService {
        let filesystem = FileSystemRegistry::standard(Arc::clone(&self.handles.objects));
        AgentService::new(
            self.config.agent.clone(),
            Arc::clone(&self.handles.bus),
            self.subjects.clone(),
            Arc::new(ShellRuntime::new()),
            Arc::new(filesystem),
        )
    }

    /// Serve as an agent until `cancel` fires.
    pub async fn run_agent(&self, cancel: CancellationToken) -> Result<()> {
        info!("启动Agent: {}", self.config.agent.agent_id);
        self.agent_service()
            .run(cancel)
            .await
            .context("Agent运行失败")
    }

    /// Run one operator command and return what should be printed.
    pub async fn execute(&self, mode: AppMode, json: bool) -> Result<String> {
        let operator = self.operator();
        match mode {
            AppMode::Agent => Err(anyhow::anyhow!("Agent模式需要通过 run_agent 启动")),
            AppMode::Jobs { agent } => {
                let jobs = match agent {
                    Some(agent) => operator.tracker().list_jobs(&agent).await,
                    None => operator.tracker().list_all_jobs().await,
                }
                .context("获取任务列表失败")?;
                let jobs: Vec<Job> = jobs.into_values().collect();
                if json {
                    Ok(serde_json::to_string_pretty(&jobs)?)
                } else {
                    Ok(format_jobs(&jobs))
                }
            }
            AppMode::Job { id } => {
                let job = operator
                    .tracker()
                    .get_job(&id)
                    .await
                    .with_context(|| format!("获取任务失败: {id}"))?;
                if json {
                    Ok(serde_json::to_string_pretty(&job)?)
                } else {
                    Ok(format_jobs(std::slice::from_ref(&job)))
                }
            }
            AppMode::Discover => {
                let timeout = Duration::from_millis(self.config.client.discover_timeout_ms);
                let agents: Vec<DiscoverResult> = operator
                    .tracker()
                    .discover(timeout)
                    .await
                    .context("发现Agent失败")?
                    .into_values()
                    .collect();
                if json {
                    Ok(serde_json::to_string_pretty(&agents)?)
                } else {
                    Ok(format_agents(&agents))
                }
            }
            AppMode::Start {
                agent,
                command,
                args,
                env,
            } => {
                operator
                    .ensure_agent_stream(&agent)
                    .await
                    .context("创建Agent消息流失败")?;
                let id = operator
                    .start_job(&agent, command, args, env)
                    .await
                    .context("下发任务失败")?;
                Ok(id)
            }
            AppMode::Stop { agent, worker } => {
                operator
                    .stop_job(&agent, &worker)
                    .await
                    .context("停止任务失败")?;
                Ok(format!("stop requested for {worker}"))
            }
            AppMode::Stdin {
                agent,
                worker,
                data,
            } => {
                operator
                    .write_stdin(&agent, &worker, data)
                    .await
                    .context("写入stdin失败")?;
                Ok(String::new())
            }
            AppMode::Stdout {
                agent,
                worker,
                from,
            } => {
                let chunk = operator
                    .read_stdout(&agent, &worker, from)
                    .await
                    .context("读取stdout失败")?;
                Ok(String::from_utf8_lossy(&chunk.data).into_owned())
            }
        }
    }
}

pub fn format_jobs(jobs: &[Job]) -> String {
    let mut out = String::new();
    for job in jobs {
        let _ = write!(
            out,
            "{}\t{}\t{}\t{}",
            job.id, job.agent_id, job.status, job.command
        );
        if !job.args.is_empty() {
            let _ = write!(out, " {}", job.args.join(" "));
        }
        if let Some(error) = &job.error {
            let _ = write!(out, "\t{error}");
        }
        out.push('\n');
    }
    out
}

pub fn format_agents(agents: &[DiscoverResult]) -> String {
    let mut out = String::new();
    for agent in agents {
        let last_seen = agent
            .last_seen
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        let _ = writeln!(
            out,
            "{}\t{}@{}\t{}\t{}\t{}",
            agent.agent_id, agent.username, agent.hostname, agent.system, agent.address, last_seen
        );
    }
    out
}
