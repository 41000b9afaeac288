//! Trigger loops: cron timers and folder watchers.
//!
//! Webhook triggers arrive through the HTTP facade; this module owns the
//! time- and filesystem-driven ones. Every firing goes through
//! `Services::submit`, so validation and the policy gate apply identically
//! no matter where a run came from.

use notify::{RecursiveMode, Watcher};
use otto_common::plan::Plan;
use otto_common::services::Services;
use otto_common::triggers::{next_cron_fire, Debouncer, ScheduleSpec};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEBOUNCE_POLL: Duration = Duration::from_millis(250);

/// Spawn one task per schedule entry.
pub fn spawn(
    services: Arc<Services>,
    shutdown: Arc<AtomicBool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    for schedule in services.config.schedules.clone() {
        if schedule.cron.is_some() {
            let services = services.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                cron_loop(schedule, services, shutdown).await;
            }));
        } else if schedule.watch.is_some() {
            let services = services.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                watch_loop(schedule, services, shutdown).await;
            }));
        }
        // Webhook schedules are registered by the HTTP facade.
    }
    handles
}

fn fire(services: &Services, schedule: &ScheduleSpec, extra: BTreeMap<String, serde_json::Value>) {
    let plan = match Plan::from_file(Path::new(&schedule.template)) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(schedule = %schedule.id, "template load failed: {e:#}");
            return;
        }
    };
    let mut variables = schedule.variables.clone();
    variables.extend(extra);
    match services.submit(plan, &format!("schedule:{}", schedule.id), variables) {
        Ok(submission) => tracing::info!(
            schedule = %schedule.id,
            run_id = submission.run.run_id,
            enqueued = submission.enqueued,
            "trigger fired"
        ),
        Err(e) => tracing::warn!(schedule = %schedule.id, "trigger submit failed: {e}"),
    }
}

/// At-most-once per cron fire: sleep to the next fire time, then enqueue.
async fn cron_loop(schedule: ScheduleSpec, services: Arc<Services>, shutdown: Arc<AtomicBool>) {
    let expr = schedule.cron.clone().unwrap_or_default();
    let tz = schedule.tz.clone().unwrap_or_else(|| "UTC".to_string());
    while !shutdown.load(Ordering::Relaxed) {
        let next = match next_cron_fire(&expr, &tz, chrono::Utc::now()) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(schedule = %schedule.id, "cron unusable: {e:#}");
                return;
            }
        };
        let wait = (next - chrono::Utc::now()).num_milliseconds().max(0) as u64;
        tokio::time::sleep(Duration::from_millis(wait)).await;
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        fire(&services, &schedule, BTreeMap::new());
    }
}

/// Folder watcher with debounce collapse: bursts of matching events become
/// one run carrying the last matching path.
async fn watch_loop(schedule: ScheduleSpec, services: Arc<Services>, shutdown: Arc<AtomicBool>) {
    let Some(watch) = schedule.watch.clone() else {
        return;
    };
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<std::path::PathBuf>();
    let mut watcher = match notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        if let Ok(event) = event {
            if matches!(
                event.kind,
                notify::EventKind::Create(_) | notify::EventKind::Modify(_)
            ) {
                for path in event.paths {
                    let _ = tx.send(path);
                }
            }
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(schedule = %schedule.id, "watcher create failed: {e}");
            return;
        }
    };
    if let Err(e) = watcher.watch(Path::new(&watch.path), RecursiveMode::NonRecursive) {
        tracing::error!(schedule = %schedule.id, path = %watch.path, "watch failed: {e}");
        return;
    }

    let mut debouncer = Debouncer::new(&watch.pattern, watch.debounce_ms);
    while !shutdown.load(Ordering::Relaxed) {
        while let Ok(path) = rx.try_recv() {
            debouncer.record(&path, chrono::Utc::now());
        }
        if let Some(path) = debouncer.poll(chrono::Utc::now()) {
            let mut extra = BTreeMap::new();
            extra.insert(
                "trigger_path".to_string(),
                serde_json::json!(path.to_string_lossy()),
            );
            fire(&services, &schedule, extra);
        }
        tokio::time::sleep(DEBOUNCE_POLL).await;
    }
}
