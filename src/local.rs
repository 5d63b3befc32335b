//! Local path of every store operation.
//!
//! State lives in whole JSON documents under fixed keys (see the `*_KEY`
//! constants and key helpers). Every mutation is a read-modify-write of one or
//! more documents, serialized per `LocalStore` by `write_lock`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::codes::{guest_username, new_id, new_join_code, normalize_join_code};
use crate::error::{Result, StoreError};
use crate::models::*;
use crate::storage::KvStore;

pub const STORAGE_KEY: &str = "mathtutor_data";
pub const OFFLINE_PROGRESS_KEY: &str = "mathtutor_offline_progress";
pub const ACHIEVEMENTS_KEY: &str = "mathtutor_achievements";
pub const DOCUMENT_VERSION: u32 = 1;

const PROBE_KEY: &str = "mathtutor_test";

pub fn teacher_classrooms_key(teacher_id: &str) -> String {
    format!("{STORAGE_KEY}_classrooms_{teacher_id}")
}

pub fn classroom_key(classroom_id: &str) -> String {
    format!("{STORAGE_KEY}_classroom_{classroom_id}")
}

pub fn student_classrooms_key(student_id: &str) -> String {
    format!("{STORAGE_KEY}_student_classrooms_{student_id}")
}

pub fn pending_joins_key() -> String {
    format!("{STORAGE_KEY}_pending_joins")
}

pub fn join_codes_key() -> String {
    format!("{STORAGE_KEY}_join_codes")
}

/// Prefixes removed when the store starts in api-only mode.
fn cache_prefixes() -> [String; 5] {
    [
        format!("{STORAGE_KEY}_student_classrooms_"),
        pending_joins_key(),
        format!("{STORAGE_KEY}_classrooms_"),
        format!("{STORAGE_KEY}_classroom_"),
        join_codes_key(),
    ]
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct LocalDocument {
    #[serde(default = "legacy_version")]
    version: u32,
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    teacher_access: Vec<TeacherAccess>,
    #[serde(default)]
    student_progress: Vec<StudentProgress>,
}

fn legacy_version() -> u32 {
    1
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct JoinCodeEntry {
    classroom_id: String,
    teacher_id: String,
}

type JoinCodeIndex = BTreeMap<String, JoinCodeEntry>;

pub struct LocalStore {
    kv: Arc<dyn KvStore>,
    write_lock: Mutex<()>,
}

impl LocalStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn close(&self) {
        self.kv.close().await;
    }

    // ---- raw documents ----

    async fn read<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        match self.kv.get(key).await? {
            None => Ok(T::default()),
            Some(raw) => serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn read_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    key: key.to_string(),
                    source,
                }),
        }
    }

    async fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.kv.set(key, &raw).await
    }

    async fn load_document(&self) -> Result<LocalDocument> {
        let doc: LocalDocument = self.read(STORAGE_KEY).await?;
        if doc.version > DOCUMENT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: doc.version,
                supported: DOCUMENT_VERSION,
            });
        }
        Ok(doc)
    }

    async fn save_document(&self, mut doc: LocalDocument) -> Result<()> {
        doc.version = DOCUMENT_VERSION;
        self.write(STORAGE_KEY, &doc).await
    }

    // ---- users ----

    pub async fn create_user(&self, new: NewUser) -> Result<User> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load_document().await?;
        if doc.users.iter().any(|u| u.username == new.username) {
            return Err(StoreError::UsernameTaken);
        }
        if doc.users.iter().any(|u| u.email == new.email) {
            return Err(StoreError::EmailTaken);
        }
        let now = Utc::now();
        let user = User {
            id: new_id(),
            username: new.username,
            email: new.email,
            password: new.password,
            role: new.role,
            created_at: now,
            last_login: now,
            cadet_avatar: Some(new.cadet_avatar.unwrap_or_else(|| DEFAULT_AVATAR.into())),
        };
        doc.users.push(user.clone());
        self.save_document(doc).await?;
        info!(user_id = %user.id, username = %user.username, "user created locally");
        Ok(user)
    }

    pub async fn users(&self) -> Result<Vec<User>> {
        Ok(self.load_document().await?.users)
    }

    pub async fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .users()
            .await?
            .into_iter()
            .find(|u| u.username == username))
    }

    pub async fn user_by_id(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.users().await?.into_iter().find(|u| u.id == user_id))
    }

    pub async fn update_last_login(&self, user_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load_document().await?;
        if let Some(user) = doc.users.iter_mut().find(|u| u.id == user_id) {
            user.last_login = Utc::now();
            self.save_document(doc).await?;
        }
        Ok(())
    }

    pub async fn students(&self) -> Result<Vec<User>> {
        Ok(self
            .users()
            .await?
            .into_iter()
            .filter(|u| u.role == Role::Student)
            .collect())
    }

    /// Students that are members of any classroom in the teacher's cached list.
    pub async fn students_for_teacher(&self, teacher_id: &str) -> Result<Vec<User>> {
        let mut member_ids = HashSet::new();
        for classroom in self.classrooms_for_teacher(teacher_id).await? {
            let details = self.classroom_details(&classroom.id).await?;
            member_ids.extend(details.members.into_iter().map(|m| m.student_id));
        }
        Ok(self
            .students()
            .await?
            .into_iter()
            .filter(|u| member_ids.contains(&u.id))
            .collect())
    }

    // ---- teacher access ----

    pub async fn grant_teacher_access(
        &self,
        teacher_id: &str,
        student_id: &str,
    ) -> Result<TeacherAccess> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load_document().await?;
        if let Some(existing) = doc
            .teacher_access
            .iter()
            .find(|a| a.teacher_id == teacher_id && a.student_id == student_id)
        {
            return Ok(existing.clone());
        }
        let access = TeacherAccess {
            id: new_id(),
            teacher_id: teacher_id.to_string(),
            student_id: student_id.to_string(),
            granted_at: Utc::now(),
        };
        doc.teacher_access.push(access.clone());
        self.save_document(doc).await?;
        Ok(access)
    }

    pub async fn teacher_access(&self, teacher_id: &str) -> Result<Vec<TeacherAccess>> {
        Ok(self
            .load_document()
            .await?
            .teacher_access
            .into_iter()
            .filter(|a| a.teacher_id == teacher_id)
            .collect())
    }

    // ---- progress ----

    pub async fn append_progress(&self, progress: NewProgress) -> Result<StudentProgress> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load_document().await?;
        let record = progress.with_id(new_id());
        doc.student_progress.push(record.clone());
        self.save_document(doc).await?;
        Ok(record)
    }

    pub async fn progress_for(&self, student_id: &str) -> Result<Vec<StudentProgress>> {
        Ok(self
            .all_progress()
            .await?
            .into_iter()
            .filter(|p| p.student_id == student_id)
            .collect())
    }

    pub async fn all_progress(&self) -> Result<Vec<StudentProgress>> {
        Ok(self.load_document().await?.student_progress)
    }

    pub async fn enqueue_offline_progress(&self, record: StudentProgress) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut queue: Vec<StudentProgress> = self.read(OFFLINE_PROGRESS_KEY).await?;
        queue.push(record);
        debug!(queued = queue.len(), "progress queued for sync");
        self.write(OFFLINE_PROGRESS_KEY, &queue).await
    }

    pub async fn offline_progress(&self) -> Result<Vec<StudentProgress>> {
        self.read(OFFLINE_PROGRESS_KEY).await
    }

    /// Drops the oldest `count` queued records, keeping anything queued since.
    pub async fn drain_offline_progress(&self, count: usize) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut queue: Vec<StudentProgress> = self.read(OFFLINE_PROGRESS_KEY).await?;
        queue.drain(..count.min(queue.len()));
        if queue.is_empty() {
            self.kv.remove(OFFLINE_PROGRESS_KEY).await
        } else {
            self.write(OFFLINE_PROGRESS_KEY, &queue).await
        }
    }

    // ---- classrooms ----

    pub async fn classrooms_for_teacher(&self, teacher_id: &str) -> Result<Vec<Classroom>> {
        self.read(&teacher_classrooms_key(teacher_id)).await
    }

    pub async fn classrooms_for_student(&self, student_id: &str) -> Result<Vec<Classroom>> {
        self.read(&student_classrooms_key(student_id)).await
    }

    pub async fn classroom_details(&self, classroom_id: &str) -> Result<ClassroomDetails> {
        self.read(&classroom_key(classroom_id)).await
    }

    pub async fn create_classroom(&self, name: &str, teacher_id: &str) -> Result<Classroom> {
        let _guard = self.write_lock.lock().await;
        let index = self.join_code_index().await?;
        let mut join_code = new_join_code();
        while index.contains_key(&join_code) {
            join_code = new_join_code();
        }
        let classroom = Classroom {
            id: new_id(),
            name: name.to_string(),
            teacher_id: teacher_id.to_string(),
            join_code,
            created_at: Utc::now(),
            is_active: true,
            student_count: Some(0),
        };
        self.store_classroom(&classroom, true).await?;
        info!(classroom_id = %classroom.id, join_code = %classroom.join_code, "classroom created locally");
        Ok(classroom)
    }

    /// Mirrors a classroom the API returned into the teacher's list, its
    /// details container and the join-code index.
    pub async fn cache_classroom(&self, classroom: &Classroom) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store_classroom(classroom, false).await
    }

    /// Merges a teacher's classroom list fetched from the API. The API lists
    /// active classrooms only, so cached ones it no longer returns are marked
    /// inactive.
    pub async fn cache_teacher_classrooms(&self, teacher_id: &str, classrooms: &[Classroom]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        for classroom in classrooms {
            self.store_classroom(classroom, false).await?;
        }
        let listed: HashSet<&str> = classrooms.iter().map(|c| c.id.as_str()).collect();
        let stale: Vec<String> = self
            .classrooms_for_teacher(teacher_id)
            .await?
            .into_iter()
            .filter(|c| c.is_active && !listed.contains(c.id.as_str()))
            .map(|c| c.id)
            .collect();
        for classroom_id in &stale {
            self.mark_inactive(teacher_id, classroom_id).await?;
        }
        if !stale.is_empty() {
            info!(teacher_id, stale = stale.len(), "cached classrooms missing from the API marked inactive");
        }
        Ok(())
    }

    async fn store_classroom(&self, classroom: &Classroom, overwrite_details: bool) -> Result<()> {
        let list_key = teacher_classrooms_key(&classroom.teacher_id);
        let mut list: Vec<Classroom> = self.read(&list_key).await?;
        match list.iter_mut().find(|c| c.id == classroom.id) {
            Some(existing) => *existing = classroom.clone(),
            None => list.push(classroom.clone()),
        }
        self.write(&list_key, &list).await?;

        let details_key = classroom_key(&classroom.id);
        let details: Option<ClassroomDetails> = self.read_opt(&details_key).await?;
        match details {
            Some(mut details) if !overwrite_details => {
                details.classroom = Some(classroom.clone());
                self.write(&details_key, &details).await?;
            }
            _ => {
                let details = ClassroomDetails {
                    classroom: Some(classroom.clone()),
                    members: Vec::new(),
                };
                self.write(&details_key, &details).await?;
            }
        }

        let mut index = self.join_code_index().await?;
        index.insert(
            normalize_join_code(&classroom.join_code),
            JoinCodeEntry {
                classroom_id: classroom.id.clone(),
                teacher_id: classroom.teacher_id.clone(),
            },
        );
        self.write(&join_codes_key(), &index).await
    }

    /// Loads the join-code index, building it from the cached teacher lists
    /// when the index document does not exist yet.
    async fn join_code_index(&self) -> Result<JoinCodeIndex> {
        if let Some(index) = self.read_opt::<JoinCodeIndex>(&join_codes_key()).await? {
            return Ok(index);
        }
        let prefix = format!("{STORAGE_KEY}_classrooms_");
        let mut index = JoinCodeIndex::new();
        for key in self.kv.keys_with_prefix(&prefix).await? {
            let teacher_id = &key[prefix.len()..];
            let list: Vec<Classroom> = match self.read(&key).await {
                Ok(list) => list,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping unreadable classroom list");
                    continue;
                }
            };
            for c in list {
                index.insert(
                    normalize_join_code(&c.join_code),
                    JoinCodeEntry {
                        classroom_id: c.id,
                        teacher_id: teacher_id.to_string(),
                    },
                );
            }
        }
        if !index.is_empty() {
            debug!(codes = index.len(), "rebuilt join-code index");
            self.write(&join_codes_key(), &index).await?;
        }
        Ok(index)
    }

    /// Resolves an active classroom by join code, with its owning teacher id.
    pub async fn lookup_join_code(&self, join_code: &str) -> Result<Option<(Classroom, String)>> {
        let index = self.join_code_index().await?;
        let Some(entry) = index.get(&normalize_join_code(join_code)) else {
            return Ok(None);
        };
        let found = self
            .classrooms_for_teacher(&entry.teacher_id)
            .await?
            .into_iter()
            .find(|c| c.id == entry.classroom_id && c.is_active);
        Ok(found.map(|c| (c, entry.teacher_id.clone())))
    }

    pub async fn join(&self, join_code: &str, student_id: &str) -> Result<JoinOutcome> {
        let _guard = self.write_lock.lock().await;
        let Some((classroom, teacher_id)) = self.lookup_join_code(join_code).await? else {
            let placeholder = self
                .record_pending_join(join_code, student_id, None)
                .await?;
            return Ok(JoinOutcome {
                ok: true,
                classroom: placeholder,
                teacher: None,
            });
        };

        let student = self.user_by_id(student_id).await?;
        let member = ClassroomMember {
            id: new_id(),
            classroom_id: classroom.id.clone(),
            student_id: student_id.to_string(),
            joined_at: Utc::now(),
            is_guest: student.as_ref().is_some_and(User::is_guest),
            guest_name: None,
            username: student.as_ref().map(|u| u.username.clone()),
            email: student.as_ref().map(|u| u.email.clone()),
            cadet_avatar: student.and_then(|u| u.cadet_avatar),
        };
        let classroom = self.add_member(classroom, &teacher_id, member).await?;
        let teacher = self.user_by_id(&teacher_id).await?.map(|t| t.summary());
        info!(classroom_id = %classroom.id, student_id, "joined classroom locally");
        Ok(JoinOutcome {
            ok: true,
            classroom,
            teacher,
        })
    }

    pub async fn join_as_guest(&self, join_code: &str, guest_name: &str) -> Result<GuestJoinOutcome> {
        let _guard = self.write_lock.lock().await;
        let guest_user = GuestUser {
            id: new_id(),
            username: guest_username(guest_name),
            guest_name: guest_name.to_string(),
        };
        let Some((classroom, teacher_id)) = self.lookup_join_code(join_code).await? else {
            let placeholder = self
                .record_pending_join(join_code, &guest_user.id, Some(guest_name))
                .await?;
            return Ok(GuestJoinOutcome {
                ok: true,
                classroom: placeholder,
                guest_user,
                teacher: None,
            });
        };

        let member = ClassroomMember {
            id: new_id(),
            classroom_id: classroom.id.clone(),
            student_id: guest_user.id.clone(),
            joined_at: Utc::now(),
            is_guest: true,
            guest_name: Some(guest_name.to_string()),
            username: Some(guest_user.username.clone()),
            email: None,
            cadet_avatar: None,
        };
        let classroom = self.add_member(classroom, &teacher_id, member).await?;
        let teacher = self.user_by_id(&teacher_id).await?.map(|t| t.summary());
        info!(classroom_id = %classroom.id, guest_id = %guest_user.id, "guest joined classroom locally");
        Ok(GuestJoinOutcome {
            ok: true,
            classroom,
            guest_user,
            teacher,
        })
    }

    /// Appends `member` unless that student is already in the classroom, then
    /// updates the student's own list and the teacher's cached count.
    async fn add_member(
        &self,
        mut classroom: Classroom,
        teacher_id: &str,
        member: ClassroomMember,
    ) -> Result<Classroom> {
        let details_key = classroom_key(&classroom.id);
        let mut details: ClassroomDetails = self.read(&details_key).await?;
        if details.classroom.is_none() {
            details.classroom = Some(classroom.clone());
        }
        let student_id = member.student_id.clone();
        if details.members.iter().any(|m| m.student_id == student_id) {
            debug!(classroom_id = %classroom.id, student_id = %student_id, "already a member");
        } else {
            details.members.push(member);
        }
        let count = details.members.len() as i64;
        if let Some(c) = details.classroom.as_mut() {
            c.student_count = Some(count);
        }
        self.write(&details_key, &details).await?;

        classroom.student_count = Some(count);
        self.add_student_classroom(&student_id, &classroom).await?;
        self.set_student_count(teacher_id, &classroom.id, count).await?;
        Ok(classroom)
    }

    async fn add_student_classroom(&self, student_id: &str, classroom: &Classroom) -> Result<()> {
        let key = student_classrooms_key(student_id);
        let mut list: Vec<Classroom> = self.read(&key).await?;
        if !list.iter().any(|c| c.id == classroom.id) {
            list.push(classroom.clone());
            self.write(&key, &list).await?;
        }
        Ok(())
    }

    /// Records a joined classroom the API confirmed in the student's own list.
    pub async fn cache_student_classroom(&self, student_id: &str, classroom: &Classroom) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.add_student_classroom(student_id, classroom).await
    }

    async fn set_student_count(&self, teacher_id: &str, classroom_id: &str, count: i64) -> Result<()> {
        let key = teacher_classrooms_key(teacher_id);
        let mut list: Vec<Classroom> = self.read(&key).await?;
        if let Some(c) = list.iter_mut().find(|c| c.id == classroom_id) {
            c.student_count = Some(count);
            self.write(&key, &list).await?;
        }
        Ok(())
    }

    async fn record_pending_join(
        &self,
        join_code: &str,
        student_id: &str,
        guest_name: Option<&str>,
    ) -> Result<Classroom> {
        let mut pending: Vec<PendingJoin> = self.read(&pending_joins_key()).await?;
        pending.push(PendingJoin {
            join_code: join_code.to_string(),
            student_id: student_id.to_string(),
            guest_name: guest_name.map(str::to_string),
            timestamp: Utc::now(),
        });
        self.write(&pending_joins_key(), &pending).await?;

        let placeholder = Classroom::pending(join_code);
        let key = student_classrooms_key(student_id);
        let mut list: Vec<Classroom> = self.read(&key).await?;
        if !list
            .iter()
            .any(|c| c.is_pending() && c.join_code.eq_ignore_ascii_case(join_code))
        {
            list.push(placeholder.clone());
            self.write(&key, &list).await?;
        }
        warn!(join_code, student_id, "no local classroom for join code; recorded pending join");
        Ok(placeholder)
    }

    pub async fn pending_joins(&self) -> Result<Vec<PendingJoin>> {
        self.read(&pending_joins_key()).await
    }

    pub async fn remove_member(&self, classroom_id: &str, student_id: &str) -> Result<Ack> {
        let _guard = self.write_lock.lock().await;
        let details_key = classroom_key(classroom_id);
        if let Some(mut details) = self.read_opt::<ClassroomDetails>(&details_key).await? {
            details.members.retain(|m| m.student_id != student_id);
            let count = details.members.len() as i64;
            if let Some(c) = details.classroom.as_mut() {
                c.student_count = Some(count);
            }
            self.write(&details_key, &details).await?;
            if let Some(c) = &details.classroom {
                self.set_student_count(&c.teacher_id, classroom_id, count).await?;
            }
        }

        let key = student_classrooms_key(student_id);
        let mut list: Vec<Classroom> = self.read(&key).await?;
        let before = list.len();
        list.retain(|c| c.id != classroom_id);
        if list.len() != before {
            self.write(&key, &list).await?;
        }
        Ok(Ack::OK)
    }

    /// Owner comes from the cached details, or from the join-code index when
    /// only the teacher's list was cached.
    pub async fn deactivate(&self, classroom_id: &str) -> Result<Ack> {
        let _guard = self.write_lock.lock().await;
        let teacher_id = match self.classroom_details(classroom_id).await?.classroom {
            Some(c) => Some(c.teacher_id),
            None => self
                .join_code_index()
                .await?
                .into_values()
                .find(|e| e.classroom_id == classroom_id)
                .map(|e| e.teacher_id),
        };
        let Some(teacher_id) = teacher_id else {
            debug!(classroom_id, "classroom not cached; nothing to deactivate");
            return Ok(Ack::OK);
        };
        self.mark_inactive(&teacher_id, classroom_id).await?;
        info!(classroom_id, "classroom deactivated locally");
        Ok(Ack::OK)
    }

    async fn mark_inactive(&self, teacher_id: &str, classroom_id: &str) -> Result<()> {
        let details_key = classroom_key(classroom_id);
        if let Some(mut details) = self.read_opt::<ClassroomDetails>(&details_key).await? {
            if let Some(c) = details.classroom.as_mut() {
                c.is_active = false;
                self.write(&details_key, &details).await?;
            }
        }

        let key = teacher_classrooms_key(teacher_id);
        let mut list: Vec<Classroom> = self.read(&key).await?;
        if let Some(c) = list.iter_mut().find(|c| c.id == classroom_id) {
            c.is_active = false;
            self.write(&key, &list).await?;
        }
        Ok(())
    }

    // ---- achievements ----

    pub async fn record_achievement(&self, new: NewAchievement) -> Result<Achievement> {
        let _guard = self.write_lock.lock().await;
        let mut all: Vec<Achievement> = self.read(ACHIEVEMENTS_KEY).await?;
        let achievement = Achievement {
            id: new_id(),
            user_id: new.user_id,
            lesson_id: new.lesson_id,
            lesson_type: new.lesson_type,
            lesson_name: new.lesson_name,
            xp_earned: new.xp_earned,
            completed_at: Utc::now(),
            planet_name: new.planet_name,
            location_name: new.location_name,
        };
        all.push(achievement.clone());
        self.write(ACHIEVEMENTS_KEY, &all).await?;
        Ok(achievement)
    }

    pub async fn achievements_for(&self, user_id: &str) -> Result<Vec<Achievement>> {
        let all: Vec<Achievement> = self.read(ACHIEVEMENTS_KEY).await?;
        Ok(all.into_iter().filter(|a| a.user_id == user_id).collect())
    }

    // ---- maintenance ----

    /// Checks that the backing storage accepts a write.
    pub async fn probe(&self) -> bool {
        let ok = self.kv.set(PROBE_KEY, "test").await.is_ok();
        ok && self.kv.remove(PROBE_KEY).await.is_ok()
    }

    pub async fn clear_document(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.kv.remove(STORAGE_KEY).await
    }

    /// Removes the aggregate document and every classroom cache.
    pub async fn purge_caches(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        self.kv.remove(STORAGE_KEY).await?;
        let mut removed = 1;
        for prefix in cache_prefixes() {
            for key in self.kv.keys_with_prefix(&prefix).await? {
                self.kv.remove(&key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
