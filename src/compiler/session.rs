//! Session/Cache Manager.
//!
//! Sessions are keyed by (objective id, optional learner id) and hold the
//! authoritative stage status map for the run. An expired session is never
//! returned or mutated: every accessor treats it as absent and drops it.
//! Plan artifacts live in a separate TTL cache keyed by (objective id, topic).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};

use super::models::{LessonPlan, Stage, StageStatus, StageStatusMap};

/// Time source, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = add_saturating(*now, by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn add_saturating(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    objective_id: String,
    learner_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonSession {
    pub session_id: String,
    pub objective_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learner_id: Option<String>,
    /// Cached lesson plan shared by the run's card generators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<LessonPlan>,
    pub stages: StageStatusMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lesson_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// Start of the current TTL window; equals `created_at` until touched.
    pub refreshed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LessonSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Default)]
struct SessionTable {
    by_id: HashMap<String, LessonSession>,
    by_key: HashMap<SessionKey, String>,
}

impl SessionTable {
    fn remove(&mut self, session_id: &str) -> Option<LessonSession> {
        let session = self.by_id.remove(session_id)?;
        let key = SessionKey {
            objective_id: session.objective_id.clone(),
            learner_id: session.learner_id.clone(),
        };
        if self.by_key.get(&key).map(String::as_str) == Some(session_id) {
            self.by_key.remove(&key);
        }
        Some(session)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PlanKey {
    objective_id: String,
    topic: String,
}

#[derive(Debug, Clone)]
struct CachedPlan {
    plan: LessonPlan,
    expires_at: DateTime<Utc>,
}

pub struct SessionManager {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    plan_ttl: Duration,
    table: Mutex<SessionTable>,
    plans: Cache<PlanKey, CachedPlan>,
}

impl SessionManager {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration, plan_ttl: Duration, plan_capacity: u64) -> Self {
        Self {
            clock,
            ttl,
            plan_ttl,
            table: Mutex::new(SessionTable::default()),
            plans: Cache::builder()
                .max_capacity(plan_capacity)
                .time_to_live(plan_ttl)
                .build(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the live session for the key unchanged, or create a fresh one
    /// with every stage pending.
    pub fn create_or_get(&self, objective_id: &str, learner_id: Option<&str>) -> LessonSession {
        let now = self.clock.now();
        let key = SessionKey {
            objective_id: objective_id.to_string(),
            learner_id: learner_id.map(str::to_string),
        };
        let mut table = self.lock();

        if let Some(id) = table.by_key.get(&key).cloned() {
            match table.by_id.get(&id) {
                Some(session) if !session.is_expired(now) => return session.clone(),
                _ => {
                    tracing::debug!(session_id = %id, objective_id, "session expired, recreating");
                    table.remove(&id);
                }
            }
        }

        let session = LessonSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            objective_id: objective_id.to_string(),
            learner_id: key.learner_id.clone(),
            master: None,
            stages: StageStatusMap::all_pending(),
            lesson_id: None,
            version: None,
            created_at: now,
            refreshed_at: now,
            expires_at: add_saturating(now, self.ttl),
        };
        table.by_key.insert(key, session.session_id.clone());
        table.by_id.insert(session.session_id.clone(), session.clone());
        session
    }

    /// Run `f` against a live session. Expired sessions are dropped and
    /// reported as absent.
    fn with_live<R>(&self, session_id: &str, f: impl FnOnce(&mut LessonSession) -> R) -> Option<R> {
        let now = self.clock.now();
        let mut table = self.lock();
        let expired = table.by_id.get(session_id)?.is_expired(now);
        if expired {
            table.remove(session_id);
            return None;
        }
        table.by_id.get_mut(session_id).map(f)
    }

    pub fn get(&self, session_id: &str) -> Option<LessonSession> {
        self.with_live(session_id, |s| s.clone())
    }

    pub fn get_status(&self, session_id: &str) -> Option<StageStatusMap> {
        self.with_live(session_id, |s| s.stages.clone())
    }

    /// Start a new TTL window for a live session.
    pub fn touch(&self, session_id: &str) -> Option<LessonSession> {
        let now = self.clock.now();
        let ttl = self.ttl;
        self.with_live(session_id, |s| {
            s.refreshed_at = now;
            s.expires_at = add_saturating(now, ttl);
            s.clone()
        })
    }

    /// Returns false when the session is gone; callers carry on without it.
    pub fn set_stage_status(&self, session_id: &str, stage: Stage, status: StageStatus) -> bool {
        self.with_live(session_id, |s| s.stages.set(stage, status))
            .is_some()
    }

    pub fn set_master(&self, session_id: &str, plan: LessonPlan) -> bool {
        self.with_live(session_id, |s| s.master = Some(plan)).is_some()
    }

    pub fn set_lesson(&self, session_id: &str, lesson_id: i64, version: i64) -> bool {
        self.with_live(session_id, |s| {
            s.lesson_id = Some(lesson_id);
            s.version = Some(version);
        })
        .is_some()
    }

    /// Live session currently bound to this lesson, if any.
    pub fn find_by_lesson(&self, lesson_id: i64) -> Option<LessonSession> {
        let now = self.clock.now();
        self.lock()
            .by_id
            .values()
            .find(|s| s.lesson_id == Some(lesson_id) && !s.is_expired(now))
            .cloned()
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut table = self.lock();
        let expired: Vec<String> = table
            .by_id
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.session_id.clone())
            .collect();
        for id in &expired {
            table.remove(id);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn cached_plan(&self, objective_id: &str, topic: &str) -> Option<LessonPlan> {
        let key = PlanKey {
            objective_id: objective_id.to_string(),
            topic: topic.to_string(),
        };
        let cached = self.plans.get(&key).await?;
        if self.clock.now() >= cached.expires_at {
            self.plans.invalidate(&key).await;
            return None;
        }
        Some(cached.plan)
    }

    pub async fn cache_plan(&self, objective_id: &str, topic: &str, plan: LessonPlan) {
        let key = PlanKey {
            objective_id: objective_id.to_string(),
            topic: topic.to_string(),
        };
        let expires_at = add_saturating(self.clock.now(), self.plan_ttl);
        self.plans.insert(key, CachedPlan { plan, expires_at }).await;
    }
}
