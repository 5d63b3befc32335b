//! The hybrid data store.
//!
//! Each operation tries the sync API first (when one is configured) and, if
//! the mode allows it, answers from local storage when the API fails or times
//! out. See [`DbMode`] for the per-mode policy.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::{DbMode, StoreConfig};
use crate::error::{RemoteError, Result, StoreError};
use crate::local::LocalStore;
use crate::models::*;
use crate::remote::RemoteApi;
use crate::storage::{KvStore, SqliteKv};

/// Id carried by records the API accepted but did not echo back.
pub const REMOTE_RECORD_ID: &str = "remote";

pub struct HybridStore {
    mode: DbMode,
    remote: Option<RemoteApi>,
    local: LocalStore,
}

impl HybridStore {
    /// Builds the store over an existing local backend. In api-only mode the
    /// local caches are purged so stale data can never be served.
    pub async fn open(config: StoreConfig, kv: Arc<dyn KvStore>) -> Result<Self> {
        let remote = match (&config.api_base, config.mode) {
            (_, DbMode::Offline) | (None, DbMode::Hybrid) => None,
            (Some(base), _) => Some(RemoteApi::new(base.clone(), config.timeout)?),
            (None, DbMode::ApiOnly) => {
                return Err(StoreError::Config(
                    "api-only mode requires an API base URL".into(),
                ))
            }
        };
        let mode = if remote.is_some() {
            config.mode
        } else {
            DbMode::Offline
        };

        let local = LocalStore::new(kv);
        if mode == DbMode::ApiOnly {
            let removed = local.purge_caches().await?;
            info!(removed, "api-only mode, local caches purged");
        }
        info!(
            mode = mode.as_str(),
            api = config.api_base.as_deref().unwrap_or("none"),
            timeout_ms = config.timeout.as_millis() as u64,
            "hybrid store ready"
        );
        Ok(Self {
            mode,
            remote,
            local,
        })
    }

    /// Opens the SQLite-backed local store named by `config.local_db_url`.
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        let kv = SqliteKv::connect(&config.local_db_url).await?;
        Self::open(config, Arc::new(kv)).await
    }

    pub async fn close(self) {
        self.local.close().await;
    }

    pub fn mode(&self) -> DbMode {
        self.mode
    }

    pub fn api_base(&self) -> Option<&str> {
        self.remote.as_ref().map(RemoteApi::base_url)
    }

    /// Decides what a remote failure means: an error in api-only mode,
    /// otherwise a logged fallback to the local path.
    fn fallback(&self, op: &'static str, err: RemoteError) -> Result<()> {
        if self.mode.allows_fallback() {
            warn!(op, error = %err, "sync API unavailable, using local storage");
            Ok(())
        } else {
            error!(op, error = %err, "sync API call failed");
            Err(err.into())
        }
    }

    /// Mirrors a remote result into local storage in hybrid mode. A failed
    /// mirror never fails the operation.
    fn mirrored(&self, op: &'static str, result: Result<()>) {
        if let Err(e) = result {
            warn!(op, error = %e, "could not cache remote result locally");
        }
    }

    // ---- users ----

    pub async fn create_user(&self, new: NewUser) -> Result<User> {
        if let Some(api) = &self.remote {
            match api.register(&new).await {
                Ok(user) => return Ok(user),
                Err(e) => self.fallback("create_user", e)?,
            }
        }
        self.local.create_user(new).await
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        if let Some(api) = &self.remote {
            match api.user_by_username(username).await {
                Ok(user) => return Ok(user),
                Err(e) => self.fallback("get_user_by_username", e)?,
            }
        }
        self.local.user_by_username(username).await
    }

    pub async fn get_user_by_id(&self, user_id: &str) -> Result<Option<User>> {
        if let Some(api) = &self.remote {
            match api.users().await {
                Ok(users) => return Ok(users.into_iter().find(|u| u.id == user_id)),
                Err(e) => self.fallback("get_user_by_id", e)?,
            }
        }
        self.local.user_by_id(user_id).await
    }

    pub async fn update_last_login(&self, user_id: &str) -> Result<()> {
        if let Some(api) = &self.remote {
            match api.update_last_login(user_id).await {
                Ok(_) => return Ok(()),
                Err(e) => self.fallback("update_last_login", e)?,
            }
        }
        self.local.update_last_login(user_id).await
    }

    /// Looks the user up and compares the stored password. A match refreshes
    /// `lastLogin`.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>> {
        let Some(user) = self.get_user_by_username(username).await? else {
            return Ok(None);
        };
        if user.password != password {
            info!(username, "login rejected");
            return Ok(None);
        }
        self.update_last_login(&user.id).await?;
        Ok(Some(user))
    }

    // ---- teacher access ----

    pub async fn grant_teacher_access(
        &self,
        teacher_id: &str,
        student_id: &str,
    ) -> Result<TeacherAccess> {
        if let Some(api) = &self.remote {
            match api.grant_teacher_access(teacher_id, student_id).await {
                Ok(_) => {
                    return Ok(TeacherAccess {
                        id: REMOTE_RECORD_ID.into(),
                        teacher_id: teacher_id.to_string(),
                        student_id: student_id.to_string(),
                        granted_at: Utc::now(),
                    })
                }
                Err(e) => self.fallback("grant_teacher_access", e)?,
            }
        }
        self.local.grant_teacher_access(teacher_id, student_id).await
    }

    pub async fn get_teacher_access(&self, teacher_id: &str) -> Result<Vec<TeacherAccess>> {
        if let Some(api) = &self.remote {
            match api.teacher_access(teacher_id).await {
                Ok(list) => return Ok(list),
                Err(e) => self.fallback("get_teacher_access", e)?,
            }
        }
        self.local.teacher_access(teacher_id).await
    }

    // ---- students ----

    pub async fn get_all_students(&self) -> Result<Vec<User>> {
        if let Some(api) = &self.remote {
            match api.users().await {
                Ok(users) => {
                    return Ok(users
                        .into_iter()
                        .filter(|u| u.role == Role::Student)
                        .collect())
                }
                Err(e) => self.fallback("get_all_students", e)?,
            }
        }
        self.local.students().await
    }

    /// Tries the membership-based endpoint, then the access-grant one.
    pub async fn get_students_for_teacher(&self, teacher_id: &str) -> Result<Vec<User>> {
        if let Some(api) = &self.remote {
            let students = match api.students_for_teacher_v2(teacher_id).await {
                Ok(list) => Ok(list),
                Err(e) => {
                    warn!(teacher_id, error = %e, "for-teacher-v2 failed, trying for-teacher");
                    api.students_for_teacher(teacher_id).await
                }
            };
            match students {
                Ok(list) => return Ok(list),
                Err(e) => self.fallback("get_students_for_teacher", e)?,
            }
        }
        self.local.students_for_teacher(teacher_id).await
    }

    // ---- progress ----

    /// Saves one completed module. When the API was tried and failed, the
    /// local record is also queued for [`flush_offline_progress`](Self::flush_offline_progress).
    pub async fn save_student_progress(&self, progress: NewProgress) -> Result<StudentProgress> {
        let mut remote_failed = false;
        if let Some(api) = &self.remote {
            let upload = ProgressUpload::new(progress.clone())?;
            match api.save_progress(&upload).await {
                Ok(_) => return Ok(progress.with_id(REMOTE_RECORD_ID.into())),
                Err(e) => {
                    self.fallback("save_student_progress", e)?;
                    remote_failed = true;
                }
            }
        }
        let record = self.local.append_progress(progress).await?;
        if remote_failed {
            self.local.enqueue_offline_progress(record.clone()).await?;
        }
        Ok(record)
    }

    pub async fn get_student_progress(&self, student_id: &str) -> Result<Vec<StudentProgress>> {
        if let Some(api) = &self.remote {
            match api.progress_for(student_id).await {
                Ok(list) => return Ok(list),
                Err(e) => self.fallback("get_student_progress", e)?,
            }
        }
        self.local.progress_for(student_id).await
    }

    pub async fn get_all_student_progress(&self) -> Result<Vec<StudentProgress>> {
        if let Some(api) = &self.remote {
            match self.remote_progress_of_all(api).await {
                Ok(all) => return Ok(all),
                Err(e) => self.fallback("get_all_student_progress", e)?,
            }
        }
        self.local.all_progress().await
    }

    async fn remote_progress_of_all(
        &self,
        api: &RemoteApi,
    ) -> std::result::Result<Vec<StudentProgress>, RemoteError> {
        let mut all = Vec::new();
        for student in api.users().await?.iter().filter(|u| u.role == Role::Student) {
            all.extend(api.progress_for(&student.id).await?);
        }
        Ok(all)
    }

    /// Uploads the queued offline progress in one batch. Returns how many
    /// records were synced.
    pub async fn flush_offline_progress(&self) -> Result<usize> {
        let Some(api) = &self.remote else {
            return Err(RemoteError::NotConfigured.into());
        };
        let queued = self.local.offline_progress().await?;
        if queued.is_empty() {
            return Ok(0);
        }
        let count = queued.len();
        let ack = api.upload_progress_batch(queued).await?;
        self.local.drain_offline_progress(count).await?;
        info!(count, accepted = ack.count, "offline progress synced");
        Ok(count)
    }

    pub async fn offline_progress(&self) -> Result<Vec<StudentProgress>> {
        self.local.offline_progress().await
    }

    // ---- classrooms ----

    pub async fn get_classrooms(&self, teacher_id: &str) -> Result<Vec<Classroom>> {
        if let Some(api) = &self.remote {
            match api.classrooms(teacher_id).await {
                Ok(list) => {
                    if self.mode.caches_locally() {
                        self.mirrored(
                            "get_classrooms",
                            self.local.cache_teacher_classrooms(teacher_id, &list).await,
                        );
                    }
                    return Ok(list);
                }
                Err(e) => self.fallback("get_classrooms", e)?,
            }
        }
        self.local.classrooms_for_teacher(teacher_id).await
    }

    pub async fn create_classroom(&self, name: &str, teacher_id: &str) -> Result<Classroom> {
        if let Some(api) = &self.remote {
            match api.create_classroom(name, teacher_id).await {
                Ok(classroom) => {
                    if self.mode.caches_locally() {
                        self.mirrored(
                            "create_classroom",
                            self.local.cache_classroom(&classroom).await,
                        );
                    }
                    return Ok(classroom);
                }
                Err(e) => self.fallback("create_classroom", e)?,
            }
        }
        self.local.create_classroom(name, teacher_id).await
    }

    /// Empty details (`classroom: None`) when the classroom is unknown locally.
    pub async fn get_classroom_details(&self, classroom_id: &str) -> Result<ClassroomDetails> {
        if let Some(api) = &self.remote {
            match api.classroom_details(classroom_id).await {
                Ok(details) => return Ok(details),
                Err(e) => self.fallback("get_classroom_details", e)?,
            }
        }
        self.local.classroom_details(classroom_id).await
    }

    pub async fn join_classroom(&self, join_code: &str, student_id: &str) -> Result<JoinOutcome> {
        if let Some(api) = &self.remote {
            match api.join(join_code, student_id).await {
                Ok(outcome) => {
                    if self.mode.caches_locally() {
                        self.mirrored(
                            "join_classroom",
                            self.local
                                .cache_student_classroom(student_id, &outcome.classroom)
                                .await,
                        );
                    }
                    return Ok(outcome);
                }
                Err(e) => self.fallback("join_classroom", e)?,
            }
        }
        self.local.join(join_code, student_id).await
    }

    pub async fn join_classroom_as_guest(
        &self,
        join_code: &str,
        guest_name: &str,
    ) -> Result<GuestJoinOutcome> {
        if let Some(api) = &self.remote {
            match api.join_as_guest(join_code, guest_name).await {
                Ok(outcome) => {
                    if self.mode.caches_locally() {
                        self.mirrored(
                            "join_classroom_as_guest",
                            self.local
                                .cache_student_classroom(&outcome.guest_user.id, &outcome.classroom)
                                .await,
                        );
                    }
                    return Ok(outcome);
                }
                Err(e) => self.fallback("join_classroom_as_guest", e)?,
            }
        }
        self.local.join_as_guest(join_code, guest_name).await
    }

    pub async fn remove_classroom_member(&self, classroom_id: &str, student_id: &str) -> Result<Ack> {
        if let Some(api) = &self.remote {
            match api.remove_member(classroom_id, student_id).await {
                Ok(ack) => {
                    if self.mode.caches_locally() {
                        self.mirrored(
                            "remove_classroom_member",
                            self.local
                                .remove_member(classroom_id, student_id)
                                .await
                                .map(drop),
                        );
                    }
                    return Ok(ack);
                }
                Err(e) => self.fallback("remove_classroom_member", e)?,
            }
        }
        self.local.remove_member(classroom_id, student_id).await
    }

    pub async fn deactivate_classroom(&self, classroom_id: &str) -> Result<Ack> {
        if let Some(api) = &self.remote {
            match api.deactivate(classroom_id).await {
                Ok(ack) => {
                    if self.mode.caches_locally() {
                        self.mirrored(
                            "deactivate_classroom",
                            self.local.deactivate(classroom_id).await.map(drop),
                        );
                    }
                    return Ok(ack);
                }
                Err(e) => self.fallback("deactivate_classroom", e)?,
            }
        }
        self.local.deactivate(classroom_id).await
    }

    pub async fn get_classrooms_for_student(&self, student_id: &str) -> Result<Vec<Classroom>> {
        if let Some(api) = &self.remote {
            match api.classrooms_for_student(student_id).await {
                Ok(list) => return Ok(list),
                Err(e) => self.fallback("get_classrooms_for_student", e)?,
            }
        }
        self.local.classrooms_for_student(student_id).await
    }

    /// Join attempts recorded while no matching classroom was known. They are
    /// never retried automatically.
    pub async fn pending_joins(&self) -> Result<Vec<PendingJoin>> {
        self.local.pending_joins().await
    }

    // ---- achievements (local in every mode) ----

    pub async fn record_achievement(&self, new: NewAchievement) -> Result<Achievement> {
        let achievement = self.local.record_achievement(new).await?;
        info!(
            user_id = %achievement.user_id,
            lesson_id = %achievement.lesson_id,
            xp = achievement.xp_earned,
            "achievement recorded"
        );
        Ok(achievement)
    }

    /// Newest first.
    pub async fn get_achievements(&self, user_id: &str) -> Result<Vec<Achievement>> {
        Ok(self.achievement_stats(user_id).await?.achievements)
    }

    pub async fn achievement_stats(&self, user_id: &str) -> Result<AchievementStats> {
        let achievements = self.local.achievements_for(user_id).await?;
        Ok(AchievementStats::from_achievements(achievements))
    }

    // ---- utilities ----

    /// Pings the API when one is configured, otherwise checks that local
    /// storage accepts writes.
    pub async fn test_connection(&self) -> bool {
        match &self.remote {
            Some(api) => match api.ping().await {
                Ok(_) => true,
                Err(e) => {
                    warn!(error = %e, "sync API ping failed");
                    false
                }
            },
            None => self.local.probe().await,
        }
    }

    /// Drops the local aggregate document. Does nothing while an API is
    /// configured.
    pub async fn clear_all_data(&self) -> Result<()> {
        if self.remote.is_some() {
            info!("clear_all_data ignored while a sync API is configured");
            return Ok(());
        }
        self.local.clear_document().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;
    use std::time::Duration;

    async fn offline() -> HybridStore {
        HybridStore::open(StoreConfig::offline(), Arc::new(MemoryKv::new()))
            .await
            .unwrap()
    }

    /// A base URL nothing listens on.
    async fn dead_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    fn student(username: &str) -> NewUser {
        NewUser {
            username: username.into(),
            email: format!("{username}@school.test"),
            password: "secret".into(),
            role: Role::Student,
            cadet_avatar: None,
        }
    }

    fn progress(student_id: &str) -> NewProgress {
        NewProgress {
            student_id: student_id.into(),
            module_id: "mercury".into(),
            module_name: "Mercury".into(),
            completed_at: Utc::now(),
            score: Some(88.0),
            time_spent: Some(7.0),
            equations_solved: Some(vec!["1/x = 2".into()]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn second_user_with_same_name_is_rejected_offline() {
        let store = offline().await;
        assert_eq!(store.mode(), DbMode::Offline);
        store.create_user(student("ana")).await.unwrap();
        let err = store.create_user(student("ana")).await.unwrap_err();
        assert!(matches!(err, StoreError::UsernameTaken));
        assert_eq!(err.to_string(), "Username already exists");
    }

    #[tokio::test]
    async fn classroom_round_trip_offline() {
        let store = offline().await;
        let room = store.create_classroom("Algebra 101", "t1").await.unwrap();
        assert_eq!(room.join_code.len(), 6);
        assert!(room
            .join_code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));

        let out = store
            .join_classroom(&room.join_code, "student-9")
            .await
            .unwrap();
        assert!(out.ok);

        let details = store.get_classroom_details(&room.id).await.unwrap();
        assert_eq!(details.members.len(), 1);
        assert_eq!(details.members[0].student_id, "student-9");
    }

    #[tokio::test]
    async fn unknown_classroom_details_are_empty() {
        let store = offline().await;
        let details = store.get_classroom_details("nope").await.unwrap();
        assert!(details.classroom.is_none());
        assert!(details.members.is_empty());
    }

    #[tokio::test]
    async fn authenticate_checks_password_and_touches_last_login() {
        let store = offline().await;
        let user = store.create_user(student("ana")).await.unwrap();
        assert!(store.authenticate("ana", "wrong").await.unwrap().is_none());
        assert!(store.authenticate("nobody", "secret").await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let logged_in = store.authenticate("ana", "secret").await.unwrap().unwrap();
        assert_eq!(logged_in.id, user.id);
        let reloaded = store.get_user_by_id(&user.id).await.unwrap().unwrap();
        assert!(reloaded.last_login > user.last_login);
    }

    #[tokio::test]
    async fn offline_progress_is_not_queued() {
        let store = offline().await;
        store.save_student_progress(progress("s1")).await.unwrap();
        assert_eq!(store.get_student_progress("s1").await.unwrap().len(), 1);
        assert!(store.offline_progress().await.unwrap().is_empty());
        assert!(matches!(
            store.flush_offline_progress().await,
            Err(StoreError::Remote(RemoteError::NotConfigured))
        ));
    }

    #[tokio::test]
    async fn hybrid_falls_back_when_api_is_unreachable() {
        let config = StoreConfig::hybrid(dead_url().await).with_timeout(Duration::from_secs(2));
        let store = HybridStore::open(config, Arc::new(MemoryKv::new()))
            .await
            .unwrap();
        assert_eq!(store.mode(), DbMode::Hybrid);

        let user = store.create_user(student("ana")).await.unwrap();
        assert!(user.id.starts_with("id_"));
        assert_eq!(
            store.get_user_by_username("ana").await.unwrap().unwrap().id,
            user.id
        );

        let saved = store.save_student_progress(progress(&user.id)).await.unwrap();
        assert_ne!(saved.id, REMOTE_RECORD_ID);
        let queued = store.offline_progress().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, saved.id);

        let out = store.join_classroom("ZZZZZZ", &user.id).await.unwrap();
        assert!(out.classroom.is_pending());
        assert_eq!(store.pending_joins().await.unwrap().len(), 1);
        assert!(!store.test_connection().await);
    }

    #[tokio::test]
    async fn api_only_surfaces_remote_failures() {
        let kv = Arc::new(MemoryKv::new());
        kv.set("mathtutor_data", r#"{"version":1,"users":[]}"#)
            .await
            .unwrap();
        kv.set("mathtutor_data_classrooms_t1", "[]").await.unwrap();
        kv.set("mathtutor_achievements", "[]").await.unwrap();

        let store = HybridStore::open(StoreConfig::api_only(dead_url().await), kv.clone())
            .await
            .unwrap();
        let keys: Vec<String> = kv.snapshot().into_keys().collect();
        assert_eq!(keys, vec!["mathtutor_achievements".to_string()]);

        let err = store.create_user(student("ana")).await.unwrap_err();
        assert!(err.is_remote());
        assert!(store.get_classrooms("t1").await.is_err());
        assert_eq!(kv.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn achievements_stay_local_and_level_up() {
        let store = offline().await;
        for (lesson, xp) in [("mercury", 60), ("venus", 90)] {
            store
                .record_achievement(NewAchievement {
                    user_id: "s1".into(),
                    lesson_id: lesson.into(),
                    lesson_type: "solar-system".into(),
                    lesson_name: None,
                    xp_earned: xp,
                    planet_name: None,
                    location_name: None,
                })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let stats = store.achievement_stats("s1").await.unwrap();
        assert_eq!(stats.total_xp, 150);
        assert_eq!(stats.level, 2);
        assert_eq!(stats.lessons_completed, 2);
        assert_eq!(stats.solar_system_lessons, 2);
        assert_eq!(stats.philippines_map_lessons, 0);
        assert_eq!(stats.achievements[0].lesson_id, "venus");
        assert!(store.get_achievements("s2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_all_data_drops_the_aggregate_offline() {
        let store = offline().await;
        store.create_user(student("ana")).await.unwrap();
        assert!(store.test_connection().await);
        store.clear_all_data().await.unwrap();
        assert!(store.get_all_students().await.unwrap().is_empty());
    }
}
