use anyhow::{anyhow, Result};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::ffmpeg::FFmpegProcessor;
use crate::hub::{self, session, HubOptions, Subscriber};
use crate::job::{ProgressEvent, TaskStatus};
use crate::queue::{QueueOptions, TaskQueue};
use crate::store::SqliteStore;

/// How often cancel requests from `cancel` and `delete` are picked up
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Command to run the task queue until interrupted
pub struct WorkCommand {
    listen: Option<SocketAddr>,
    config: Config,
}

impl WorkCommand {
    pub fn new(listen: Option<SocketAddr>, config: Config) -> Self {
        Self { listen, config }
    }

    pub async fn execute(&self) -> Result<()> {
        let store = Arc::new(SqliteStore::open(&self.config.database_path)?);
        let hub = hub::spawn(HubOptions::from_config(&self.config));
        let processor = FFmpegProcessor::from_config(&self.config);
        let queue = TaskQueue::new(
            store,
            processor,
            hub.clone(),
            QueueOptions::from_config(&self.config),
        );

        let console = hub
            .register()
            .await
            .ok_or_else(|| anyhow!("Progress hub is not running"))?;
        tokio::spawn(render_progress(console, MultiProgress::new()));

        if let Some(addr) = self.listen {
            let hub = hub.clone();
            tokio::spawn(async move {
                if let Err(e) = session::listen(addr, hub).await {
                    error!("Progress listener on {} failed: {}", addr, e);
                }
            });
        }

        info!("✅ Starting worker, database: {:?}", self.config.database_path);
        queue.start().await;

        let mut sweep = tokio::time::interval(self.config.sleep_interval());
        // the first tick completes immediately and recovery already covers it
        sweep.tick().await;
        let mut cancels = tokio::time::interval(CANCEL_POLL_INTERVAL);

        tokio::pin! {
            let shutdown_signal = signal::ctrl_c();
        }

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("🛑 Shutdown signal received. Exiting gracefully.");
                    break;
                }
                _ = cancels.tick() => {
                    match queue.apply_cancel_requests() {
                        Ok(0) => {}
                        Ok(n) => info!("Applied {} cancel requests", n),
                        Err(e) => error!("Error reading cancel requests: {}", e),
                    }
                }
                _ = sweep.tick() => {
                    match queue.sweep().await {
                        Ok(0) => debug!("💤 No new tasks found."),
                        Ok(_) => {}
                        Err(e) => error!("Error checking for new tasks: {}", e),
                    }
                }
            }
        }

        if let Some(id) = queue.current_task() {
            warn!("Task {} interrupted, it will be resumed on the next start", id);
        }

        Ok(())
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:>6} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Draw one bar per active task until the subscriber's mailbox closes.
///
/// Returns the number of tasks seen reaching a terminal status.
pub async fn render_progress(mut subscriber: Subscriber, multi: MultiProgress) -> usize {
    let mut bars: HashMap<i64, ProgressBar> = HashMap::new();
    let mut done = 0;

    while let Some(event) = subscriber.recv().await {
        let ProgressEvent {
            task_id,
            progress,
            status,
            file_name,
            message,
        } = event;

        let bar = bars.entry(task_id).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new(100));
            bar.set_style(bar_style());
            bar.set_prefix(format!("#{task_id}"));
            bar
        });
        bar.set_position(progress.clamp(0.0, 100.0) as u64);

        match status {
            TaskStatus::Pending => bar.set_message(format!("{file_name} (queued)")),
            TaskStatus::Running => bar.set_message(file_name),
            TaskStatus::Finished | TaskStatus::Error => {
                if let Some(bar) = bars.remove(&task_id) {
                    bar.finish_with_message(format!("{file_name} {status}: {message}"));
                }
                done += 1;
            }
        }
    }

    done
}

#[cfg(test)]
mod tests {
    use super::*;
    use indicatif::ProgressDrawTarget;
    use std::time::Duration;
    use tokio::time::timeout;

    fn event(task_id: i64, status: TaskStatus, progress: f64) -> ProgressEvent {
        ProgressEvent {
            task_id,
            progress,
            status,
            file_name: "clip.mp4".to_string(),
            message: String::new(),
        }
    }

    #[test]
    fn test_work_command_creation() {
        let addr: SocketAddr = "127.0.0.1:7878".parse().unwrap();
        let cmd = WorkCommand::new(Some(addr), Config::default());
        assert_eq!(cmd.listen, Some(addr));
    }

    #[tokio::test]
    async fn test_render_progress_counts_terminal_events() {
        let hub = hub::spawn(HubOptions::default());
        let subscriber = hub.register().await.unwrap();
        let id = subscriber.id();
        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::hidden());
        let render = tokio::spawn(render_progress(subscriber, multi));

        hub.publish(event(1, TaskStatus::Pending, 0.0));
        hub.publish(event(1, TaskStatus::Running, 40.0));
        hub.publish(event(1, TaskStatus::Finished, 100.0));
        hub.publish(event(2, TaskStatus::Running, 10.0));
        hub.publish(event(2, TaskStatus::Error, 10.0));

        // let the hub deliver before closing the mailbox
        tokio::time::sleep(Duration::from_millis(50)).await;
        hub.unregister(id).await;

        let done = timeout(Duration::from_secs(1), render).await.unwrap().unwrap();
        assert_eq!(done, 2);
    }
}
