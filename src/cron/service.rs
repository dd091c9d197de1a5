use crate::bus::{MessageBus, OutboundMessage};
use crate::cron::types::{CronJob, CronJobState, CronPayload, CronSchedule, CronStore};
use crate::utils::now_ms;
use anyhow::Result;
use chrono::{TimeZone, Utc};
use cron::Schedule;
use futures_util::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

pub type CronJobCallback =
    Arc<dyn Fn(CronJob) -> BoxFuture<'static, Result<Option<String>>> + Send + Sync>;

/// The `cron` crate wants a seconds field; operator-facing expressions are
/// standard 5-field, so prepend a zero-seconds column when needed.
fn normalize_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Next fire time relative to `now`. Always computed from the present, so
/// occurrences missed during downtime collapse into one catch-up run —
/// except one-shot `at` jobs, which keep their timestamp and fire once
/// even when it is already in the past.
fn compute_next_run(schedule: &CronSchedule, now_ms: i64) -> Option<i64> {
    match schedule {
        CronSchedule::At { at_ms } => Some(*at_ms),
        CronSchedule::Every { every_ms } => {
            if *every_ms <= 0 {
                None
            } else {
                Some(now_ms + every_ms)
            }
        }
        CronSchedule::Cron { expr, tz } => {
            let parsed = match Schedule::from_str(&normalize_cron_expr(expr)) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!("invalid cron expression '{expr}': {err}");
                    return None;
                }
            };
            let now_utc = Utc.timestamp_millis_opt(now_ms).single()?;
            match tz {
                Some(tz_name) => {
                    let tz: chrono_tz::Tz = match tz_name.parse() {
                        Ok(tz) => tz,
                        Err(_) => {
                            warn!("unknown timezone '{tz_name}', falling back to local time");
                            return parsed
                                .after(&now_utc.with_timezone(&chrono::Local))
                                .next()
                                .map(|dt| dt.timestamp_millis());
                        }
                    };
                    parsed
                        .after(&now_utc.with_timezone(&tz))
                        .next()
                        .map(|dt| dt.timestamp_millis())
                }
                None => parsed
                    .after(&now_utc.with_timezone(&chrono::Local))
                    .next()
                    .map(|dt| dt.timestamp_millis()),
            }
        }
    }
}

/// Persistent scheduled-job runner. The catalog file is rewritten on every
/// mutation; job execution goes through the injected `on_job` callback so
/// the engine never holds a direct reference to the agent.
pub struct CronService {
    store_path: PathBuf,
    bus: std::sync::Mutex<Option<Arc<MessageBus>>>,
    on_job: Arc<Mutex<Option<CronJobCallback>>>,
    store: Arc<Mutex<CronStore>>,
    running: Arc<AtomicBool>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl CronService {
    pub fn new(store_path: PathBuf) -> Self {
        Self {
            store_path,
            bus: std::sync::Mutex::new(None),
            on_job: Arc::new(Mutex::new(None)),
            store: Arc::new(Mutex::new(CronStore::default())),
            running: Arc::new(AtomicBool::new(false)),
            runner: Mutex::new(None),
        }
    }

    pub async fn set_on_job(&self, callback: CronJobCallback) {
        *self.on_job.lock().await = Some(callback);
    }

    pub fn set_bus(&self, bus: Arc<MessageBus>) {
        if let Ok(mut guard) = self.bus.lock() {
            *guard = Some(bus);
        }
    }

    fn bus_handle(&self) -> Option<Arc<MessageBus>> {
        self.bus.lock().ok().and_then(|guard| guard.clone())
    }

    /// Load the catalog and refresh next-run times without spawning the
    /// dispatch task. CLI one-shots use this to avoid firing jobs.
    pub async fn load(&self) -> Result<()> {
        self.load_store().await?;
        self.recompute_next_runs().await;
        self.save_store().await
    }

    pub async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::Relaxed);
        self.load().await?;

        let running = self.running.clone();
        let store = self.store.clone();
        let on_job = self.on_job.clone();
        let store_path = self.store_path.clone();
        let bus = self.bus_handle();
        let runner = tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                let sleep_ms = {
                    let data = store.lock().await;
                    let next = data
                        .jobs
                        .iter()
                        .filter(|j| j.enabled)
                        .filter_map(|j| j.state.next_run_at_ms)
                        .min();
                    match next {
                        Some(t) => (t - now_ms()).clamp(0, 1_000),
                        None => 1_000,
                    }
                };
                if sleep_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms as u64)).await;
                }
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                fire_due_jobs(&store, &store_path, &on_job, bus.as_ref()).await;
            }
        });

        *self.runner.lock().await = Some(runner);
        info!("cron service started ({})", self.store_path.display());
        Ok(())
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.runner.lock().await.take() {
            handle.abort();
        }
    }

    async fn recompute_next_runs(&self) {
        let mut store = self.store.lock().await;
        let now = now_ms();
        for job in &mut store.jobs {
            if job.enabled {
                job.state.next_run_at_ms = compute_next_run(&job.schedule, now);
            }
        }
    }

    async fn load_store(&self) -> Result<()> {
        if !self.store_path.exists() {
            *self.store.lock().await = CronStore::default();
            return Ok(());
        }

        let raw = tokio::fs::read_to_string(&self.store_path).await?;
        let store: CronStore = match serde_json::from_str(&raw) {
            Ok(store) => store,
            Err(err) => {
                error!(
                    "corrupted cron catalog at {}: {err}; starting empty",
                    self.store_path.display()
                );
                CronStore::default()
            }
        };
        *self.store.lock().await = store;
        Ok(())
    }

    async fn save_store(&self) -> Result<()> {
        save_store(&self.store_path, &self.store).await
    }

    pub async fn list_jobs(&self, include_disabled: bool) -> Vec<CronJob> {
        let store = self.store.lock().await;
        let mut jobs: Vec<CronJob> = store
            .jobs
            .iter()
            .filter(|j| include_disabled || j.enabled)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.state.next_run_at_ms.unwrap_or(i64::MAX));
        jobs
    }

    pub async fn add_job(
        &self,
        name: String,
        schedule: CronSchedule,
        message: String,
        deliver: bool,
        channel: Option<String>,
        to: Option<String>,
    ) -> Result<CronJob> {
        let now = now_ms();
        let job = CronJob {
            id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            name,
            enabled: true,
            schedule: schedule.clone(),
            payload: CronPayload {
                message,
                deliver,
                channel,
                to,
            },
            state: CronJobState {
                next_run_at_ms: compute_next_run(&schedule, now),
                ..Default::default()
            },
            created_at_ms: now,
            updated_at_ms: now,
        };

        self.store.lock().await.jobs.push(job.clone());
        self.save_store().await?;
        Ok(job)
    }

    pub async fn remove_job(&self, job_id: &str) -> Result<bool> {
        let removed = {
            let mut store = self.store.lock().await;
            let before = store.jobs.len();
            store.jobs.retain(|j| j.id != job_id);
            store.jobs.len() < before
        };
        if removed {
            self.save_store().await?;
        }
        Ok(removed)
    }

    pub async fn enable_job(&self, job_id: &str, enabled: bool) -> Result<Option<CronJob>> {
        let updated = {
            let mut store = self.store.lock().await;
            store.jobs.iter_mut().find(|j| j.id == job_id).map(|job| {
                job.enabled = enabled;
                job.updated_at_ms = now_ms();
                job.state.next_run_at_ms = if enabled {
                    compute_next_run(&job.schedule, now_ms())
                } else {
                    None
                };
                job.clone()
            })
        };
        if updated.is_some() {
            self.save_store().await?;
        }
        Ok(updated)
    }

    /// Fire one job immediately. `force` runs even disabled jobs.
    pub async fn run_job(&self, job_id: &str, force: bool) -> Result<bool> {
        let job = {
            let store = self.store.lock().await;
            store.jobs.iter().find(|j| j.id == job_id).cloned()
        };
        let Some(job) = job else {
            return Ok(false);
        };
        if !force && !job.enabled {
            return Ok(false);
        }

        fire_job(&self.store, &self.store_path, &self.on_job, self.bus_handle().as_ref(), job)
            .await;
        Ok(true)
    }

    pub async fn status(&self) -> serde_json::Value {
        let store = self.store.lock().await;
        let next_wake = store
            .jobs
            .iter()
            .filter(|j| j.enabled)
            .filter_map(|j| j.state.next_run_at_ms)
            .min();
        serde_json::json!({
            "enabled": self.running.load(Ordering::Relaxed),
            "jobs": store.jobs.len(),
            "next_wake_at_ms": next_wake,
        })
    }
}

/// Fire every due job, lexicographic id order breaking fire-time ties.
async fn fire_due_jobs(
    store: &Arc<Mutex<CronStore>>,
    store_path: &Path,
    on_job: &Arc<Mutex<Option<CronJobCallback>>>,
    bus: Option<&Arc<MessageBus>>,
) {
    let mut due: Vec<CronJob> = {
        let data = store.lock().await;
        let now = now_ms();
        data.jobs
            .iter()
            .filter(|job| {
                job.enabled
                    && job
                        .state
                        .next_run_at_ms
                        .map(|t| now >= t)
                        .unwrap_or(false)
            })
            .cloned()
            .collect()
    };
    due.sort_by(|a, b| a.id.cmp(&b.id));

    for job in due {
        fire_job(store, store_path, on_job, bus, job).await;
    }
}

/// Run one job with at-most-once bookkeeping: the next slot is computed
/// and persisted before the callback runs, so a crash mid-execution can
/// not replay the same slot.
async fn fire_job(
    store: &Arc<Mutex<CronStore>>,
    store_path: &Path,
    on_job: &Arc<Mutex<Option<CronJobCallback>>>,
    bus: Option<&Arc<MessageBus>>,
    job: CronJob,
) {
    {
        let mut data = store.lock().await;
        let Some(target) = data.jobs.iter_mut().find(|j| j.id == job.id) else {
            return;
        };
        let now = now_ms();
        target.state.last_run_at_ms = Some(now);
        target.state.run_count += 1;
        if target.schedule.is_one_shot() {
            target.enabled = false;
            target.state.next_run_at_ms = None;
        } else {
            target.state.next_run_at_ms = compute_next_run(&target.schedule, now);
        }
        target.updated_at_ms = now;
    }
    if let Err(err) = save_store(store_path, store).await {
        error!("failed to persist cron catalog before firing {}: {err}", job.id);
    }

    let callback = on_job.lock().await.clone();
    let result = match callback {
        Some(callback) => callback(job.clone()).await,
        None => Ok(None),
    };

    {
        let mut data = store.lock().await;
        if let Some(target) = data.jobs.iter_mut().find(|j| j.id == job.id) {
            match &result {
                Ok(_) => {
                    target.state.last_status = Some("ok".to_string());
                    target.state.last_error = None;
                }
                Err(err) => {
                    target.state.last_status = Some("error".to_string());
                    target.state.last_error = Some(err.to_string());
                }
            }
            target.updated_at_ms = now_ms();
        }
    }
    if let Err(err) = save_store(store_path, store).await {
        error!("failed to persist cron catalog after firing {}: {err}", job.id);
    }

    if job.payload.deliver
        && let Ok(Some(text)) = &result
        && let Some(to) = &job.payload.to
        && let Some(bus) = bus
    {
        let channel = job.payload.channel.clone().unwrap_or_else(|| "cli".to_string());
        let _ = bus.publish_outbound(OutboundMessage::new(channel, to.clone(), text.clone()));
    }
}

async fn save_store(path: &Path, store: &Arc<Mutex<CronStore>>) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let text = {
        let data = store.lock().await;
        serde_json::to_string_pretty(&*data)?
    };
    tokio::fs::write(path, format!("{text}\n")).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn temp_store_path() -> PathBuf {
        std::env::temp_dir().join(format!("nightowl-cron-{}.json", Uuid::new_v4()))
    }

    fn counting_callback(counter: Arc<AtomicUsize>) -> CronJobCallback {
        Arc::new(move |_job| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some("done".to_string()))
            })
        })
    }

    #[test]
    fn compute_next_run_for_every_and_at() {
        let now = now_ms();
        assert_eq!(
            compute_next_run(&CronSchedule::every(5_000), now),
            Some(now + 5_000)
        );
        // One-shot keeps its timestamp even in the past (catch-up).
        assert_eq!(
            compute_next_run(&CronSchedule::at(now - 1), now),
            Some(now - 1)
        );
        assert_eq!(compute_next_run(&CronSchedule::every(0), now), None);
    }

    #[test]
    fn compute_next_run_parses_five_field_cron() {
        let now = now_ms();
        let next = compute_next_run(&CronSchedule::cron("*/5 * * * *", None), now)
            .expect("next run");
        assert!(next > now);
        assert!(next <= now + 5 * 60 * 1000 + 1000);
    }

    #[test]
    fn compute_next_run_honors_timezone() {
        let now = now_ms();
        let utc = compute_next_run(&CronSchedule::cron("0 9 * * *", Some("UTC")), now)
            .expect("next run");
        let tokyo = compute_next_run(&CronSchedule::cron("0 9 * * *", Some("Asia/Tokyo")), now)
            .expect("next run");
        assert!(utc > now);
        assert!(tokyo > now);
        // 9am differs between the two zones.
        assert_ne!(utc, tokyo);
    }

    #[test]
    fn invalid_cron_expression_yields_none() {
        assert_eq!(
            compute_next_run(&CronSchedule::cron("not a cron", None), now_ms()),
            None
        );
    }

    #[tokio::test]
    async fn add_list_enable_remove_round_trip() -> Result<()> {
        let store_path = temp_store_path();
        let service = CronService::new(store_path.clone());
        service.start().await?;

        let job = service
            .add_job(
                "test".to_string(),
                CronSchedule::every(10_000),
                "ping".to_string(),
                false,
                None,
                None,
            )
            .await?;
        assert!(!job.id.is_empty());
        assert!(job.state.next_run_at_ms.is_some());

        let listed = service.list_jobs(true).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "test");

        let disabled = service.enable_job(&job.id, false).await?.expect("job");
        assert!(!disabled.enabled);
        assert!(disabled.state.next_run_at_ms.is_none());
        assert!(service.list_jobs(false).await.is_empty());

        assert!(!service.run_job(&job.id, false).await?);
        assert!(service.run_job(&job.id, true).await?);

        assert!(service.remove_job(&job.id).await?);
        assert!(service.list_jobs(true).await.is_empty());

        service.stop().await;
        let _ = std::fs::remove_file(store_path);
        Ok(())
    }

    #[tokio::test]
    async fn one_shot_fires_once_and_disables() -> Result<()> {
        let store_path = temp_store_path();
        let service = CronService::new(store_path.clone());
        let counter = Arc::new(AtomicUsize::new(0));
        service.set_on_job(counting_callback(counter.clone())).await;
        service.start().await?;

        // Fire time is already behind us; the runner catches up once.
        let job = service
            .add_job(
                "oneshot".to_string(),
                CronSchedule::at(now_ms() - 50),
                "tick".to_string(),
                false,
                None,
                None,
            )
            .await?;

        tokio::time::timeout(std::time::Duration::from_secs(3), async {
            while counter.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("one-shot never fired");

        // Give the runner a beat to persist, then check it never re-fires.
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let jobs = service.list_jobs(true).await;
        assert_eq!(jobs.len(), 1);
        assert!(!jobs[0].enabled);
        assert_eq!(jobs[0].state.run_count, 1);
        assert_eq!(jobs[0].state.last_status.as_deref(), Some("ok"));
        assert_eq!(jobs[0].id, job.id);

        service.stop().await;
        let _ = std::fs::remove_file(store_path);
        Ok(())
    }

    #[tokio::test]
    async fn callback_error_is_recorded() -> Result<()> {
        let store_path = temp_store_path();
        let service = CronService::new(store_path.clone());
        service
            .set_on_job(Arc::new(|_| {
                Box::pin(async { Err(anyhow::anyhow!("callback failed")) })
            }))
            .await;
        service.start().await?;

        let job = service
            .add_job(
                "failing".to_string(),
                CronSchedule::every(10_000),
                "ping".to_string(),
                false,
                None,
                None,
            )
            .await?;

        assert!(service.run_job(&job.id, true).await?);
        let jobs = service.list_jobs(true).await;
        assert_eq!(jobs[0].state.last_status.as_deref(), Some("error"));
        assert!(
            jobs[0]
                .state
                .last_error
                .as_deref()
                .unwrap_or_default()
                .contains("callback failed")
        );
        assert_eq!(jobs[0].state.run_count, 1);

        service.stop().await;
        let _ = std::fs::remove_file(store_path);
        Ok(())
    }

    #[tokio::test]
    async fn deliver_publishes_outbound_via_bus() -> Result<()> {
        let store_path = temp_store_path();
        let bus = Arc::new(MessageBus::new());
        let service = CronService::new(store_path.clone());
        service.set_bus(bus.clone());
        service
            .set_on_job(Arc::new(|_| {
                Box::pin(async { Ok(Some("reminder text".to_string())) })
            }))
            .await;
        service.start().await?;

        let job = service
            .add_job(
                "remind".to_string(),
                CronSchedule::every(60_000),
                "remind me".to_string(),
                true,
                Some("telegram".to_string()),
                Some("42".to_string()),
            )
            .await?;
        assert!(service.run_job(&job.id, true).await?);

        let out = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            bus.consume_outbound(),
        )
        .await
        .expect("timeout")
        .expect("outbound");
        assert_eq!(out.channel, "telegram");
        assert_eq!(out.chat_id, "42");
        assert_eq!(out.content, "reminder text");

        service.stop().await;
        let _ = std::fs::remove_file(store_path);
        Ok(())
    }

    #[tokio::test]
    async fn simultaneous_jobs_fire_in_id_order() -> Result<()> {
        let store_path = temp_store_path();
        let service = CronService::new(store_path.clone());
        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let order_for_cb = order.clone();
        service
            .set_on_job(Arc::new(move |job| {
                let order = order_for_cb.clone();
                Box::pin(async move {
                    order.lock().await.push(job.id.clone());
                    Ok(None)
                })
            }))
            .await;

        // Seed the store directly so both jobs share one fire time.
        let now = now_ms();
        let make_job = |id: &str| CronJob {
            id: id.to_string(),
            name: id.to_string(),
            enabled: true,
            schedule: CronSchedule::every(60_000),
            payload: CronPayload::default(),
            state: CronJobState {
                next_run_at_ms: Some(now - 10),
                ..Default::default()
            },
            created_at_ms: now,
            updated_at_ms: now,
        };
        {
            let mut data = service.store.lock().await;
            data.jobs.push(make_job("zz-last"));
            data.jobs.push(make_job("aa-first"));
        }

        fire_due_jobs(&service.store, &service.store_path, &service.on_job, None).await;

        let fired = order.lock().await.clone();
        assert_eq!(fired, vec!["aa-first".to_string(), "zz-last".to_string()]);

        let _ = std::fs::remove_file(store_path);
        Ok(())
    }

    #[tokio::test]
    async fn next_slot_is_persisted_before_callback_runs() -> Result<()> {
        let store_path = temp_store_path();
        let service = CronService::new(store_path.clone());

        let path_for_cb = store_path.clone();
        let observed: Arc<Mutex<Option<CronStore>>> = Arc::new(Mutex::new(None));
        let observed_for_cb = observed.clone();
        service
            .set_on_job(Arc::new(move |_job| {
                let path = path_for_cb.clone();
                let observed = observed_for_cb.clone();
                Box::pin(async move {
                    let raw = tokio::fs::read_to_string(&path).await?;
                    *observed.lock().await = Some(serde_json::from_str(&raw)?);
                    Ok(None)
                })
            }))
            .await;

        let job = service
            .add_job(
                "atomic".to_string(),
                CronSchedule::every(60_000),
                "tick".to_string(),
                false,
                None,
                None,
            )
            .await?;
        assert!(service.run_job(&job.id, true).await?);

        // What the callback saw on disk already carried the bookkeeping.
        let snapshot = observed.lock().await.clone().expect("snapshot");
        let persisted = &snapshot.jobs[0];
        assert_eq!(persisted.state.run_count, 1);
        assert!(persisted.state.last_run_at_ms.is_some());
        assert!(persisted.state.next_run_at_ms.expect("next") > now_ms() - 1_000);

        let _ = std::fs::remove_file(store_path);
        Ok(())
    }
}
