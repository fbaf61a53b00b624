//! The cooperative trigger loop: due-schedule dispatch, condition polling,
//! dependency/concurrency gating, and boot/shutdown pseudo-events.

use crate::executor::{self, ExecutionRequest, Outcome};
use crate::model::{EventType, ResultStatus, Task, TriggerReason, TriggerType};
use crate::store::Store;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub task_timeout: Duration,
    pub condition_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(900),
            condition_timeout: Duration::from_secs(60),
        }
    }
}

/// Owns the background loop task. Dropping this without calling `stop`
/// leaves the loop running detached; callers are expected to always call
/// `stop` during shutdown (§4.7).
pub struct Engine {
    store: Store,
    config: EngineConfig,
    cancel: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(store: Store, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            cancel: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        })
    }

    /// Fires the boot pseudo-event (blocking until every spawned boot task
    /// finishes) and then starts the background tick loop.
    pub async fn start(self: &Arc<Self>) {
        self.run_pseudo_event(EventType::SystemBoot, TriggerReason::SystemBoot).await;
        let this = self.clone();
        let handle = tokio::spawn(async move { this.tick_loop().await });
        *self.loop_handle.lock().await = Some(handle);
        info!("engine started");
    }

    /// Signals the loop to stop, fires the shutdown pseudo-event (blocking
    /// until every spawned shutdown task finishes), then joins the loop
    /// task with a bounded wait.
    pub async fn stop(self: &Arc<Self>) {
        self.cancel.cancel();
        self.run_pseudo_event(EventType::SystemShutdown, TriggerReason::SystemShutdown).await;
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                error!("engine loop did not stop within the shutdown join window");
            }
        }
        info!("engine stopped");
    }

    async fn tick_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
                _ = self.cancel.cancelled() => break,
            }
            if let Err(e) = self.tick().await {
                error!("engine tick failed: {e}");
            }
        }
    }

    async fn tick(&self) -> crate::error::SchedulerResult<()> {
        let now = Utc::now();
        self.process_due_tasks(now).await?;
        self.process_event_tasks(now).await?;
        Ok(())
    }

    async fn process_due_tasks(&self, now: chrono::DateTime<Utc>) -> crate::error::SchedulerResult<()> {
        for task in self.store.list_due_tasks(now).await? {
            if self.store.has_running_instance(task.id).await? {
                continue;
            }
            if !self.store.dependencies_met(&task.pre_task_ids).await? {
                self.store.postpone_due_task(task.id, now).await?;
                debug!(task_id = task.id, "due task blocked on dependencies, postponed");
                continue;
            }
            self.spawn(&task, TriggerReason::Schedule).await?;
            let expression = task
                .schedule_expression
                .as_deref()
                .expect("schedule task always has an expression");
            self.store.schedule_next_run(task.id, expression, now).await?;
        }
        Ok(())
    }

    async fn process_event_tasks(&self, now: chrono::DateTime<Utc>) -> crate::error::SchedulerResult<()> {
        for task in self.store.list_event_tasks(Some(EventType::Script)).await? {
            let elapsed_ok = match task.last_condition_check_at {
                Some(last) => (now - last).num_seconds() >= task.condition_interval,
                None => true,
            };
            if !elapsed_ok {
                continue;
            }
            self.store.update_condition_check(task.id, now).await?;

            let Some(script) = task.condition_script.clone() else {
                continue;
            };
            let condition_ok = self.run_condition(&task, &script).await;
            if !condition_ok {
                continue;
            }
            if self.store.has_running_instance(task.id).await? {
                continue;
            }
            if !self.store.dependencies_met(&task.pre_task_ids).await? {
                continue;
            }
            self.spawn(&task, TriggerReason::Condition).await?;
        }
        Ok(())
    }

    /// Builds and runs the condition script through the command-building
    /// path only: it never switches account, always running as the
    /// scheduler's own process account regardless of `task.account` (§4.5).
    async fn run_condition(&self, task: &Task, script: &str) -> bool {
        let output = executor::run(ExecutionRequest {
            task_id: task.id,
            task_name: &task.name,
            account: &task.account,
            script_body: script,
            trigger: TriggerReason::Condition,
            timeout: self.config.condition_timeout,
            switch_account: false,
        })
        .await;
        output.outcome == Outcome::Success
    }

    /// Manual-run entry point for the API (§4.6): re-checks the running
    /// and dependency guards immediately before spawning, matching the
    /// same concurrency contract the tick loop uses (§5).
    pub async fn manual_run(&self, task: &Task) -> crate::error::SchedulerResult<()> {
        if self.store.has_running_instance(task.id).await? {
            return Err(crate::error::SchedulerError::Conflict);
        }
        if !self.store.dependencies_met(&task.pre_task_ids).await? {
            return Err(crate::error::SchedulerError::DependencyNotMet);
        }
        self.spawn(task, TriggerReason::Manual).await?;
        Ok(())
    }

    /// Records a running result, spawns the script on a blocking task so a
    /// long-running or slow condition script can't stall the tick, and
    /// finalizes the result when it completes. Does not await completion.
    async fn spawn(&self, task: &Task, reason: TriggerReason) -> crate::error::SchedulerResult<JoinHandle<()>> {
        let result_id = self.store.record_result_start(task.id, reason).await?;
        let store = self.store.clone();
        let task_id = task.id;
        let task_name = task.name.clone();
        let account = task.account.clone();
        let script_body = task.script_body.clone();
        let timeout = self.config.task_timeout;
        debug!(task_id, result_id, ?reason, "spawning execution");
        Ok(tokio::spawn(async move {
            let output = executor::run(ExecutionRequest {
                task_id,
                task_name: &task_name,
                account: &account,
                script_body: &script_body,
                trigger: reason,
                timeout,
                switch_account: true,
            })
            .await;
            let status = match output.outcome {
                Outcome::Success => ResultStatus::Success,
                Outcome::Failed => ResultStatus::Failed,
            };
            if let Err(e) = store.finalize_result(result_id, status, &output.log).await {
                error!("failed to finalize result {result_id}: {e}");
            }
            if let Err(e) = store.update_last_run(task_id).await {
                error!("failed to update last_run for task {task_id}: {e}");
            }
        }))
    }

    /// Spawns every eligible task with the given event type and reason,
    /// waiting for all of them to finish before returning (§4.5).
    async fn run_pseudo_event(&self, event_type: EventType, reason: TriggerReason) {
        let tasks = match self.store.list_event_tasks(Some(event_type)).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("failed to list {event_type} tasks: {e}");
                return;
            }
        };
        let mut handles = Vec::new();
        for task in tasks {
            let running = self.store.has_running_instance(task.id).await.unwrap_or(false);
            let deps_met = self
                .store
                .dependencies_met(&task.pre_task_ids)
                .await
                .unwrap_or(false);
            if running || !deps_met {
                continue;
            }
            match self.spawn(&task, reason).await {
                Ok(handle) => handles.push(handle),
                Err(e) => error!("failed to spawn {event_type} task {}: {e}", task.id),
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Returns true iff every `pre_task_ids` dependency's latest result is
/// `success`; exposed for the manual-run API path (§4.6) which needs the
/// same gate the Engine uses.
pub async fn dependencies_met(store: &Store, task: &Task) -> crate::error::SchedulerResult<bool> {
    store.dependencies_met(&task.pre_task_ids).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskPayload;

    async fn test_store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    fn account() -> String {
        crate::account::current_account_name().unwrap_or_else(|_| "root".to_owned())
    }

    #[tokio::test]
    async fn s4_dependency_gate_blocks_then_allows() {
        let store = test_store().await;
        let a = store
            .create_task(TaskPayload {
                name: Some("a".into()),
                account: Some(account()),
                trigger_type: Some(TriggerType::Schedule),
                schedule_expression: Some("0 * * * *".into()),
                script_body: Some("true".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let b = store
            .create_task(TaskPayload {
                name: Some("b".into()),
                account: Some(account()),
                trigger_type: Some(TriggerType::Schedule),
                schedule_expression: Some("0 * * * *".into()),
                script_body: Some("true".into()),
                pre_task_ids: Some(crate::model::PreTaskIdsInput::List(vec![a.id])),
                ..Default::default()
            })
            .await
            .unwrap();

        let engine = Engine::new(store.clone(), EngineConfig::default());
        let now = Utc::now();
        store.postpone_due_task(b.id, now - chrono::Duration::minutes(2)).await.unwrap();
        // A has never run: dependency not met.
        assert!(!dependencies_met(&store, &store.get_task(b.id).await.unwrap()).await.unwrap());
        engine.process_due_tasks(now).await.unwrap();
        let b_after = store.get_task(b.id).await.unwrap();
        assert!(b_after.next_run_at.unwrap() > now);

        let rid = store.record_result_start(a.id, TriggerReason::Manual).await.unwrap();
        store.finalize_result(rid, ResultStatus::Success, "").await.unwrap();
        assert!(dependencies_met(&store, &store.get_task(b.id).await.unwrap()).await.unwrap());
    }
}
