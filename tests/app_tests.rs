use std::io::Write;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vessel::app::{AppMode, Application};
use vessel_config::{AppConfig, BusKind};
use vessel_domain::JobStatus;

const AGENT: &str = "a1";

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.bus.kind = BusKind::Memory;
    config.agent.agent_id = AGENT.to_string();
    config.agent.info_interval_seconds = 0;
    config.client.discover_timeout_ms = 500;
    config
}

async fn wait_for_status(app: &Application, id: &str, status: JobStatus) -> vessel_domain::Job {
    for _ in 0..100 {
        if let Ok(job) = app.tracker().get_job(id).await {
            if job.status == status {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {id} never reached {status}");
}

#[tokio::test]
async fn test_start_job_and_read_stdout() {
    let app = Application::new(config()).await.unwrap();
    let cancel = CancellationToken::new();
    let agent = app.clone();
    let agent_token = cancel.clone();
    let handle = tokio::spawn(async move { agent.run_agent(agent_token).await });

    let mut script = tempfile::Builder::new().suffix(".sh").tempfile().unwrap();
    writeln!(script, "echo \"hello $1\"").unwrap();
    let command = format!("file://{}", script.path().display());

    let id = app
        .execute(
            AppMode::Start {
                agent: AGENT.to_string(),
                command: command.clone(),
                args: vec!["vessel".to_string()],
                env: Default::default(),
            },
            false,
        )
        .await
        .unwrap();

    let job = wait_for_status(&app, &id, JobStatus::Finished).await;
    assert_eq!(job.agent_id, AGENT);
    assert_eq!(job.command, command);

    let stdout = app
        .execute(
            AppMode::Stdout {
                agent: AGENT.to_string(),
                worker: id.clone(),
                from: 1,
            },
            false,
        )
        .await
        .unwrap();
    assert_eq!(stdout, "hello vessel\n");

    let listing = app
        .execute(AppMode::Jobs { agent: None }, false)
        .await
        .unwrap();
    assert!(listing.contains(&id), "{listing}");
    assert!(listing.contains("FINISHED"), "{listing}");

    let agents = app.execute(AppMode::Discover, true).await.unwrap();
    assert!(agents.contains("\"a1\""), "{agents}");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_stop_running_job() {
    let app = Application::new(config()).await.unwrap();
    let cancel = CancellationToken::new();
    let agent = app.clone();
    let agent_token = cancel.clone();
    let handle = tokio::spawn(async move { agent.run_agent(agent_token).await });

    let mut script = tempfile::Builder::new().suffix(".sh").tempfile().unwrap();
    writeln!(script, "sleep 30").unwrap();
    let id = app
        .execute(
            AppMode::Start {
                agent: AGENT.to_string(),
                command: format!("file://{}", script.path().display()),
                args: vec![],
                env: Default::default(),
            },
            false,
        )
        .await
        .unwrap();
    wait_for_status(&app, &id, JobStatus::Running).await;

    app.execute(
        AppMode::Stop {
            agent: AGENT.to_string(),
            worker: id.clone(),
        },
        false,
    )
    .await
    .unwrap();
    wait_for_status(&app, &id, JobStatus::Cancelled).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_unknown_job_is_an_error() {
    let app = Application::new(config()).await.unwrap();
    let err = app
        .execute(
            AppMode::Job {
                id: "missing".to_string(),
            },
            false,
        )
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("missing"));
    assert!(app.execute(AppMode::Agent, false).await.is_err());
}
