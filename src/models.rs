use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_with::skip_serializing_none;

pub const DEFAULT_AVATAR: &str = "king-sadboi";
pub const PENDING_CLASSROOM_ID: &str = "pending";

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
        }
    }
}

#[skip_serializing_none]
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
#[sqlx(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: Role,
    #[serde(deserialize_with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "timestamp")]
    pub last_login: DateTime<Utc>,
    #[serde(default)]
    pub cadet_avatar: Option<String>,
}

impl User {
    pub fn is_guest(&self) -> bool {
        self.username.starts_with("guest_")
    }

    pub fn summary(&self) -> TeacherInfo {
        TeacherInfo {
            id: self.id.clone(),
            username: self.username.clone(),
            email: self.email.clone(),
        }
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: Role,
    #[serde(default)]
    pub cadet_avatar: Option<String>,
}

/// Who a classroom belongs to, as returned alongside a join.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TeacherInfo {
    pub id: String,
    pub username: String,
    pub email: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DifficultyLevel {
    Beginner,
    Intermediate,
    Advanced,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StudentProgress {
    pub id: String,
    pub student_id: String,
    pub module_id: String,
    pub module_name: String,
    #[serde(deserialize_with = "timestamp")]
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub score: Option<f64>,
    /// Minutes, possibly fractional.
    #[serde(default)]
    pub time_spent: Option<f64>,
    #[serde(default)]
    pub equations_solved: Option<Vec<String>>,
    #[serde(default)]
    pub mistakes: Option<Vec<String>>,
    #[serde(default)]
    pub skill_breakdown: Option<serde_json::Value>,
    #[serde(default)]
    pub common_mistakes: Option<Vec<String>>,
    #[serde(default)]
    pub strengths: Option<Vec<String>>,
    #[serde(default)]
    pub areas_for_improvement: Option<Vec<String>>,
    #[serde(default)]
    pub difficulty_level: Option<DifficultyLevel>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewProgress {
    pub student_id: String,
    pub module_id: String,
    pub module_name: String,
    #[serde(deserialize_with = "timestamp")]
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub time_spent: Option<f64>,
    #[serde(default)]
    pub equations_solved: Option<Vec<String>>,
    #[serde(default)]
    pub mistakes: Option<Vec<String>>,
    #[serde(default)]
    pub skill_breakdown: Option<serde_json::Value>,
    #[serde(default)]
    pub common_mistakes: Option<Vec<String>>,
    #[serde(default)]
    pub strengths: Option<Vec<String>>,
    #[serde(default)]
    pub areas_for_improvement: Option<Vec<String>>,
    #[serde(default)]
    pub difficulty_level: Option<DifficultyLevel>,
}

impl NewProgress {
    pub fn with_id(self, id: String) -> StudentProgress {
        StudentProgress {
            id,
            student_id: self.student_id,
            module_id: self.module_id,
            module_name: self.module_name,
            completed_at: self.completed_at,
            score: self.score,
            time_spent: self.time_spent,
            equations_solved: self.equations_solved,
            mistakes: self.mistakes,
            skill_breakdown: self.skill_breakdown,
            common_mistakes: self.common_mistakes,
            strengths: self.strengths,
            areas_for_improvement: self.areas_for_improvement,
            difficulty_level: self.difficulty_level,
        }
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
#[sqlx(rename_all = "camelCase")]
pub struct TeacherAccess {
    pub id: String,
    pub teacher_id: String,
    pub student_id: String,
    #[serde(deserialize_with = "timestamp")]
    pub granted_at: DateTime<Utc>,
}

#[skip_serializing_none]
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
#[sqlx(rename_all = "camelCase")]
pub struct Classroom {
    pub id: String,
    pub name: String,
    pub teacher_id: String,
    pub join_code: String,
    #[serde(deserialize_with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "active_by_default", deserialize_with = "bool_or_int")]
    pub is_active: bool,
    #[serde(default)]
    #[sqlx(default)]
    pub student_count: Option<i64>,
}

impl Classroom {
    /// Stand-in returned when a join code could not be resolved anywhere.
    pub fn pending(join_code: &str) -> Self {
        Self {
            id: PENDING_CLASSROOM_ID.into(),
            name: "Pending Join".into(),
            teacher_id: String::new(),
            join_code: join_code.to_string(),
            created_at: Utc::now(),
            is_active: true,
            student_count: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.id == PENDING_CLASSROOM_ID
    }
}

#[skip_serializing_none]
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
#[sqlx(rename_all = "camelCase")]
pub struct ClassroomMember {
    pub id: String,
    pub classroom_id: String,
    pub student_id: String,
    #[serde(deserialize_with = "timestamp")]
    pub joined_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "bool_or_int")]
    pub is_guest: bool,
    #[serde(default)]
    pub guest_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub cadet_avatar: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ClassroomDetails {
    pub classroom: Option<Classroom>,
    #[serde(default)]
    pub members: Vec<ClassroomMember>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GuestUser {
    pub id: String,
    pub username: String,
    pub guest_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JoinOutcome {
    pub ok: bool,
    pub classroom: Classroom,
    #[serde(default)]
    pub teacher: Option<TeacherInfo>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GuestJoinOutcome {
    pub ok: bool,
    pub classroom: Classroom,
    pub guest_user: GuestUser,
    #[serde(default)]
    pub teacher: Option<TeacherInfo>,
}

/// A join attempt that could not be matched to any known classroom.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingJoin {
    pub join_code: String,
    pub student_id: String,
    #[serde(default)]
    pub guest_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Achievement {
    pub id: String,
    pub user_id: String,
    pub lesson_id: String,
    pub lesson_type: String,
    #[serde(default)]
    pub lesson_name: Option<String>,
    pub xp_earned: u32,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub planet_name: Option<String>,
    #[serde(default)]
    pub location_name: Option<String>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NewAchievement {
    pub user_id: String,
    pub lesson_id: String,
    pub lesson_type: String,
    #[serde(default)]
    pub lesson_name: Option<String>,
    pub xp_earned: u32,
    #[serde(default)]
    pub planet_name: Option<String>,
    #[serde(default)]
    pub location_name: Option<String>,
}

pub const SOLAR_SYSTEM_LESSON: &str = "solar-system";
pub const PHILIPPINES_MAP_LESSON: &str = "philippines-map";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AchievementStats {
    #[serde(rename = "totalXP")]
    pub total_xp: u64,
    pub lessons_completed: usize,
    pub solar_system_lessons: usize,
    pub philippines_map_lessons: usize,
    pub level: u64,
    /// Newest first.
    pub achievements: Vec<Achievement>,
}

impl AchievementStats {
    pub fn from_achievements(mut achievements: Vec<Achievement>) -> Self {
        achievements.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        let total_xp: u64 = achievements.iter().map(|a| u64::from(a.xp_earned)).sum();
        let of_type = |kind: &str| achievements.iter().filter(|a| a.lesson_type == kind).count();
        Self {
            total_xp,
            lessons_completed: achievements.len(),
            solar_system_lessons: of_type(SOLAR_SYSTEM_LESSON),
            philippines_map_lessons: of_type(PHILIPPINES_MAP_LESSON),
            level: total_xp / 100 + 1,
            achievements,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub const OK: Ack = Ack { ok: true };
}

// ---- request bodies of the sync API ----

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LastLoginReq {
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TeacherAccessReq {
    pub teacher_id: String,
    pub student_id: String,
}

/// `POST /api/progress`; `payload` mirrors the optional fields as a JSON
/// string for servers that only keep the fixed columns.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProgressUpload {
    #[serde(flatten)]
    pub progress: NewProgress,
    #[serde(default)]
    pub payload: Option<String>,
}

impl ProgressUpload {
    pub fn new(progress: NewProgress) -> serde_json::Result<Self> {
        let payload = serde_json::to_string(&serde_json::json!({
            "equationsSolved": progress.equations_solved,
            "mistakes": progress.mistakes,
            "meta": &progress,
        }))?;
        Ok(Self {
            progress,
            payload: Some(payload),
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProgressBatchReq {
    pub records: Vec<StudentProgress>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct BatchAck {
    pub ok: bool,
    pub count: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateClassroomReq {
    pub name: String,
    pub teacher_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinReq {
    pub join_code: String,
    pub student_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GuestJoinReq {
    pub join_code: String,
    pub guest_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RemoveMemberReq {
    pub student_id: String,
}

/// Liveness answer. Servers differ in timestamp format (some omit the
/// offset), so the timestamp is kept as sent.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Ping {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

fn active_by_default() -> bool {
    true
}

/// Accepts RFC 3339 or an offset-less `YYYY-MM-DDTHH:MM:SS[.f]` (also with a
/// space separator), read as UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|t| t.and_utc()))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").map(|t| t.and_utc()))
}

fn timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

/// SQLite-backed servers emit booleans as 0/1.
fn bool_or_int<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}
