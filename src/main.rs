use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::{error, info, warn};

use vessel::app::{AppMode, Application};
use vessel::common::{init_logging, load_config, parse_env_pairs, StartupConfig};
use vessel::shutdown::{wait_for_shutdown_signal, ShutdownManager};
use vessel_config::BusKind;

fn cli() -> Command {
    let agent_arg = || {
        Arg::new("agent")
            .short('a')
            .long("agent")
            .value_name("AGENT")
            .help("Agent ID")
            .required(true)
    };

    Command::new("vessel")
        .version(env!("CARGO_PKG_VERSION"))
        .about("基于消息总线的远程任务控制")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .global(true),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("以JSON格式输出")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("agent").about("作为Agent运行").arg(
                Arg::new("agent-id")
                    .long("agent-id")
                    .value_name("ID")
                    .help("覆盖配置中的Agent ID"),
            ),
        )
        .subcommand(
            Command::new("jobs").about("列出任务").arg(
                Arg::new("agent")
                    .short('a')
                    .long("agent")
                    .value_name("AGENT")
                    .help("只列出该Agent的任务"),
            ),
        )
        .subcommand(
            Command::new("job")
                .about("查看单个任务")
                .arg(Arg::new("id").required(true)),
        )
        .subcommand(Command::new("discover").about("发现已注册的Agent"))
        .subcommand(
            Command::new("start")
                .about("在Agent上启动任务")
                .arg(agent_arg())
                .arg(
                    Arg::new("env")
                        .short('e')
                        .long("env")
                        .value_name("KEY=VALUE")
                        .action(ArgAction::Append),
                )
                .arg(Arg::new("command").required(true).help("脚本URI, 如 file:///x.sh 或 obj://bucket/x.sh"))
                .arg(
                    Arg::new("args")
                        .num_args(0..)
                        .trailing_var_arg(true)
                        .allow_hyphen_values(true),
                ),
        )
        .subcommand(
            Command::new("stop")
                .about("停止任务")
                .arg(agent_arg())
                .arg(Arg::new("worker").required(true)),
        )
        .subcommand(
            Command::new("stdin")
                .about("向任务的stdin写入数据")
                .arg(agent_arg())
                .arg(Arg::new("worker").required(true))
                .arg(Arg::new("data").required(true)),
        )
        .subcommand(
            Command::new("stdout")
                .about("读取任务的stdout")
                .arg(agent_arg())
                .arg(Arg::new("worker").required(true))
                .arg(
                    Arg::new("from")
                        .long("from")
                        .value_name("SEQUENCE")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("1"),
                ),
        )
}

fn required(matches: &ArgMatches, name: &str) -> Result<String> {
    matches
        .get_one::<String>(name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("缺少参数: {name}"))
}

fn parse_mode(name: &str, matches: &ArgMatches) -> Result<AppMode> {
    let mode = match name {
        "agent" => AppMode::Agent,
        "jobs" => AppMode::Jobs {
            agent: matches.get_one::<String>("agent").cloned(),
        },
        "job" => AppMode::Job {
            id: required(matches, "id")?,
        },
        "discover" => AppMode::Discover,
        "start" => AppMode::Start {
            agent: required(matches, "agent")?,
            command: required(matches, "command")?,
            args: matches
                .get_many::<String>("args")
                .map(|args| args.cloned().collect())
                .unwrap_or_default(),
            env: parse_env_pairs(matches.get_many::<String>("env").into_iter().flatten())?,
        },
        "stop" => AppMode::Stop {
            agent: required(matches, "agent")?,
            worker: required(matches, "worker")?,
        },
        "stdin" => AppMode::Stdin {
            agent: required(matches, "agent")?,
            worker: required(matches, "worker")?,
            data: required(matches, "data")?.into_bytes(),
        },
        "stdout" => AppMode::Stdout {
            agent: required(matches, "agent")?,
            worker: required(matches, "worker")?,
            from: matches.get_one::<u64>("from").copied().unwrap_or(1),
        },
        other => return Err(anyhow::anyhow!("不支持的运行模式: {other}")),
    };
    Ok(mode)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let (name, sub_matches) = matches
        .subcommand()
        .ok_or_else(|| anyhow::anyhow!("缺少子命令"))?;

    let startup = StartupConfig {
        config_path: sub_matches.get_one::<String>("config").cloned(),
        log_level: sub_matches.get_one::<String>("log-level").cloned(),
        log_format: sub_matches.get_one::<String>("log-format").cloned(),
        agent_id: sub_matches.try_get_one::<String>("agent-id").ok().flatten().cloned(),
    };
    let config = load_config(&startup)?;
    init_logging(&config)?;

    let mode = parse_mode(name, sub_matches)?;
    let json = sub_matches.get_flag("json");
    let app = Application::new(config).await?;

    if mode != AppMode::Agent {
        if app.config().bus.kind == BusKind::Memory {
            warn!("当前使用进程内消息总线，命令对其他进程中的Agent不可见");
        }
        let output = app.execute(mode, json).await?;
        if !output.is_empty() {
            println!("{}", output.trim_end());
        }
        return Ok(());
    }

    let shutdown_manager = ShutdownManager::new();
    let token = shutdown_manager.token();
    let agent = app.clone();
    let mut agent_handle = tokio::spawn(async move { agent.run_agent(token).await });

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
            shutdown_manager.shutdown();
        }
        finished = &mut agent_handle => {
            // Agent自行退出
            return finished.context("Agent任务异常退出")?;
        }
    }

    // 等待Agent关闭，设置超时
    match tokio::time::timeout(Duration::from_secs(30), agent_handle).await {
        Ok(Ok(Ok(()))) => info!("Agent已优雅关闭"),
        Ok(Ok(Err(e))) => error!("Agent关闭时发生错误: {e:#}"),
        Ok(Err(e)) => error!("Agent任务异常退出: {e}"),
        Err(_) => warn!("Agent关闭超时，强制退出"),
    }

    info!("vessel已退出");
    Ok(())
}
