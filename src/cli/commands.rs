use anyhow::{Result, Context};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cli::config::HarvesterConfig;
use crate::cluster::Coordinator;
use crate::domain::{DocumentReference, Job, JobState, ProcessingProfile, SubTask, TaskType};
use crate::storage::{JobStore, JobStoreFactory, WriteAck};
use crate::transport::{ClusterTransport, LocalTransport, TransportFactory};
use crate::utils::shutdown;
use crate::worker::run_worker;

fn load_config(path: Option<PathBuf>) -> Result<HarvesterConfig> {
    let path = path.unwrap_or_else(HarvesterConfig::default_path);
    HarvesterConfig::load_from_file(&path)
}

/// Shutdown flag raised by Ctrl-C
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (trigger, rx) = shutdown::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                let _ = trigger.send(true);
            }
            Err(e) => {
                warn!("Ctrl-C handler unavailable: {}", e);
                // Keep the trigger alive so nothing shuts down
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

/// Run the coordinator until Ctrl-C
pub async fn coordinator(config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config)?;
    let store = JobStoreFactory::create(&config.store).await?;
    let transport = TransportFactory::create(&config.transport).await?;

    let shutdown_rx = shutdown_on_ctrl_c();
    Coordinator::new(config, store, transport)
        .run(shutdown::signalled(shutdown_rx))
        .await;

    Ok(())
}

/// Run a worker until Ctrl-C
pub async fn worker(config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config)?;
    let transport_settings = config.transport.clone();

    run_worker(
        config.worker,
        || TransportFactory::create(&transport_settings),
        shutdown_on_ctrl_c(),
    )
    .await
}

/// Coordinator and workers in one process over the in-process transport
pub async fn standalone(config: Option<PathBuf>, workers: usize, urls: Vec<String>) -> Result<()> {
    let config = load_config(config)?;
    let store = JobStoreFactory::create(&config.store).await?;

    for url in urls {
        let job = Job::new(vec![DocumentReference::new(url, TaskType::UnconditionalDownload)]);
        store.submit_job(&job, WriteAck::Acknowledged).await?;
        info!("Submitted job {}", job.id);
    }

    let transport: Arc<dyn ClusterTransport> = Arc::new(LocalTransport::new());
    let shutdown_rx = shutdown_on_ctrl_c();

    let mut handles = Vec::new();
    for index in 0..workers.max(1) {
        let mut settings = config.worker.clone();
        settings.worker_id = Some(format!("standalone-{}", index + 1));
        let transport = transport.clone();
        let shutdown_rx = shutdown_rx.clone();

        handles.push(tokio::spawn(async move {
            let connect = move || {
                let transport = transport.clone();
                async move { Ok(transport) }
            };
            if let Err(e) = run_worker(settings, connect, shutdown_rx).await {
                error!("Worker failed: {:#}", e);
            }
        }));
    }

    Coordinator::new(config, store, transport)
        .run(shutdown::signalled(shutdown_rx))
        .await;

    for handle in handles {
        handle.await.context("Worker task panicked")?;
    }
    Ok(())
}

/// Submit a job, optionally as a reusable processing profile
pub async fn submit(
    config: Option<PathBuf>,
    urls: Vec<String>,
    task_type: TaskType,
    sub_tasks: Vec<SubTask>,
    profile: Option<String>,
) -> Result<()> {
    let config = load_config(config)?;
    let store = JobStoreFactory::create(&config.store).await?;

    let documents: Vec<DocumentReference> = urls
        .into_iter()
        .map(|url| DocumentReference::new(url, task_type).with_sub_tasks(sub_tasks.clone()))
        .collect();

    let job = match profile {
        Some(profile_id) => {
            let profile = ProcessingProfile { id: profile_id, documents, limits: None };
            store.save_profile(&profile).await?;
            info!("Saved processing profile {}", profile.id);
            profile.new_job()
        }
        None => Job::new(documents),
    };

    store
        .submit_job(&job, WriteAck::Acknowledged)
        .await
        .context(format!("Failed to submit job {}", job.id))?;

    println!("Submitted job {} with {} documents", job.id, job.documents.len());
    Ok(())
}

/// Print job counts per state
pub async fn status(config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config)?;
    let store = JobStoreFactory::create(&config.store).await?;
    let counts = store.count_by_state().await?;

    println!("{:<10} {:>10}", "STATE", "JOBS");
    for state in [JobState::Ready, JobState::Loaded, JobState::Finished, JobState::Error] {
        println!("{:<10} {:>10}", state.as_str(), counts.get(&state).copied().unwrap_or(0));
    }

    Ok(())
}

/// Write the default configuration
pub async fn init_config(path: Option<PathBuf>) -> Result<()> {
    let path = path.unwrap_or_else(HarvesterConfig::default_path);
    if path.exists() {
        warn!("Overwriting existing configuration at {}", path.display());
    }

    HarvesterConfig::default().save_to_file(&path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Show the configuration in effect
pub async fn show_config(path: Option<PathBuf>) -> Result<()> {
    let path = path.unwrap_or_else(HarvesterConfig::default_path);
    let config = if path.exists() {
        HarvesterConfig::load_from_file(&path)?
    } else {
        println!("# {} does not exist, showing defaults", path.display());
        HarvesterConfig::default()
    };

    let yaml = serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
    println!("{}", yaml);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_missing_config_is_an_error() {
        let missing = std::env::temp_dir().join(format!("harvester-missing-{}.yaml", uuid::Uuid::new_v4()));
        assert_err!(status(Some(missing.clone())).await);
        assert_err!(coordinator(Some(missing)).await);
    }

    #[tokio::test]
    async fn test_init_then_submit_with_memory_store() {
        let path = std::env::temp_dir().join(format!("harvester-config-{}.yaml", uuid::Uuid::new_v4()));
        assert_ok!(init_config(Some(path.clone())).await);

        let mut config = HarvesterConfig::load_from_file(&path).unwrap();
        config.store.storage_type = "memory".to_string();
        config.save_to_file(&path).unwrap();

        submit(
            Some(path.clone()),
            vec!["https://a.org/1.png".to_string()],
            TaskType::CheckLink,
            vec![],
            Some("nightly".to_string()),
        )
        .await
        .unwrap();
        assert_ok!(status(Some(path)).await);
    }
}
