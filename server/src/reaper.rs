//! Periodic GC: drop terminated sessions from the registry and delete aged
//! recording triples. Runs once per minute; active and pinned recordings are
//! never touched.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use common::config::Config;
use common::recording::{self, RecordingMeta};
use common::session::Registry;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub fn spawn(registry: Registry, config: &'static Config) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            sweep_sessions(&registry);
            sweep_recordings(&registry, config);
        }
    })
}

/// Remove sessions whose subprocess has permanently exited. Their PTY was
/// already reaped by the output pump; this only releases registry resources.
fn sweep_sessions(registry: &Registry) {
    let before = registry.len();
    registry.retain(|_, session| !session.is_terminal());
    let removed = before - registry.len();
    if removed > 0 {
        info!("reaped {} terminated session(s)", removed);
    }
}

fn sweep_recordings(registry: &Registry, config: &Config) {
    let active: HashSet<Uuid> = registry
        .iter()
        .map(|entry| entry.value().recording_id)
        .collect();
    let metas = recording::list_metas(&config.recordings_dir);
    let max_age = chrono::Duration::from_std(config.recording_max_age)
        .unwrap_or_else(|_| chrono::Duration::hours(1));
    let expired = select_expired(&metas, &active, config.keep_per_agent, max_age, Utc::now());
    for id in expired {
        debug!("deleting recording {}", id);
        recording::delete_triple(&config.recordings_dir, id);
    }
}

/// Retention decision: a non-active, non-kept recording is deleted when it
/// falls outside the newest `keep_per_agent` for its agent, or its effective
/// end time is older than `max_age`.
fn select_expired(
    metas: &[RecordingMeta],
    active: &HashSet<Uuid>,
    keep_per_agent: usize,
    max_age: chrono::Duration,
    now: DateTime<Utc>,
) -> Vec<Uuid> {
    let mut by_agent: HashMap<&str, Vec<&RecordingMeta>> = HashMap::new();
    for meta in metas {
        if active.contains(&meta.uuid) || meta.kept_at.is_some() {
            continue;
        }
        by_agent.entry(meta.agent.as_str()).or_default().push(meta);
    }

    let mut expired = Vec::new();
    for group in by_agent.values_mut() {
        group.sort_by_key(|m| std::cmp::Reverse(m.effective_end().unwrap_or(now)));
        for (index, meta) in group.iter().enumerate() {
            let end = meta.effective_end().unwrap_or(now);
            if index >= keep_per_agent || now - end > max_age {
                expired.push(meta.uuid);
            }
        }
    }
    expired
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn meta(agent: &str, ended_secs_ago: i64, now: DateTime<Utc>) -> RecordingMeta {
        let mut m = RecordingMeta::new(
            Uuid::new_v4(),
            agent,
            vec![agent.to_string()],
            Path::new("/w"),
        );
        m.started_at = (now - chrono::Duration::seconds(ended_secs_ago + 10)).to_rfc3339();
        m.ended_at = Some((now - chrono::Duration::seconds(ended_secs_ago)).to_rfc3339());
        m
    }

    #[test]
    fn keeps_newest_per_agent_and_expires_the_rest() {
        let now = Utc::now();
        let metas: Vec<RecordingMeta> = (0..7).map(|i| meta("claude", i * 60, now)).collect();
        let expired = select_expired(&metas, &HashSet::new(), 5, chrono::Duration::hours(1), now);
        assert_eq!(expired.len(), 2);
        // the two oldest are the ones expired
        assert!(expired.contains(&metas[5].uuid));
        assert!(expired.contains(&metas[6].uuid));
    }

    #[test]
    fn age_limit_applies_even_under_the_cap() {
        let now = Utc::now();
        let metas = vec![meta("codex", 30, now), meta("codex", 7200, now)];
        let expired = select_expired(&metas, &HashSet::new(), 5, chrono::Duration::hours(1), now);
        assert_eq!(expired, vec![metas[1].uuid]);
    }

    #[test]
    fn active_and_kept_recordings_are_untouched() {
        let now = Utc::now();
        let active_meta = meta("shell", 9999, now);
        let mut kept = meta("shell", 9999, now);
        kept.kept_at = Some(now.to_rfc3339());

        let mut active = HashSet::new();
        active.insert(active_meta.uuid);

        let metas = vec![active_meta, kept];
        let expired = select_expired(&metas, &active, 5, chrono::Duration::hours(1), now);
        assert!(expired.is_empty());
    }

    #[test]
    fn caps_are_per_agent_not_global() {
        let now = Utc::now();
        let mut metas = Vec::new();
        for _ in 0..4 {
            metas.push(meta("claude", 60, now));
            metas.push(meta("gemini", 60, now));
        }
        let expired = select_expired(&metas, &HashSet::new(), 5, chrono::Duration::hours(1), now);
        assert!(expired.is_empty());
    }
}
