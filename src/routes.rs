use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{query, query_as, query_scalar, Sqlite};

use crate::codes::{guest_username, new_id, new_join_code, normalize_join_code};
use crate::db::Db;
use crate::models::*;

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(db: Db) -> Router {
    Router::new()
        .route("/api/ping", get(ping))
        // users
        .route("/api/users", get(list_users))
        .route("/api/users/by-username/:username", get(user_by_username))
        .route("/api/users/register", post(register_user))
        .route("/api/users/update-last-login", post(update_last_login))
        .route("/api/users/:id", get(user_by_id))
        // access + students
        .route("/api/teacher-access", post(grant_access))
        .route("/api/teacher-access/:teacher_id", get(teacher_access))
        .route("/api/students/for-teacher/:teacher_id", get(students_for_teacher))
        .route("/api/students/for-teacher-v2/:teacher_id", get(students_for_teacher_v2))
        // progress
        .route("/api/progress", post(create_progress))
        .route("/api/progress/batch", post(create_progress_batch))
        .route("/api/progress/by-student/:student_id", get(progress_by_student))
        // classrooms
        .route("/api/classrooms", get(list_classrooms).post(create_classroom))
        .route("/api/classrooms/join", post(join_classroom))
        .route("/api/classrooms/join-guest", post(join_classroom_guest))
        .route("/api/classrooms/by-student/:student_id", get(classrooms_by_student))
        .route("/api/classrooms/:id", get(classroom_details))
        .route("/api/classrooms/:id/members", get(classroom_members))
        .route("/api/classrooms/:id/remove-member", post(remove_member))
        .route("/api/classrooms/:id/deactivate", post(deactivate_classroom))
        .with_state(db)
}

async fn ping() -> Json<Ping> {
    Json(Ping {
        status: "ok".into(),
        message: Some("Database API is running".into()),
        timestamp: Some(Utc::now().to_rfc3339()),
    })
}

// --- users ---

async fn list_users(State(db): State<Db>) -> ApiResult<Vec<User>> {
    let users = query_as::<_, User>("SELECT * FROM users ORDER BY createdAt DESC")
        .fetch_all(&db)
        .await
        .map_err(e500)?;
    Ok(Json(users))
}

async fn user_by_username(
    State(db): State<Db>,
    Path(username): Path<String>,
) -> ApiResult<Option<User>> {
    let user = query_as::<_, User>("SELECT * FROM users WHERE username = ?")
        .bind(&username)
        .fetch_optional(&db)
        .await
        .map_err(e500)?;
    Ok(Json(user))
}

async fn user_by_id(State(db): State<Db>, Path(id): Path<String>) -> ApiResult<User> {
    query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(&id)
        .fetch_optional(&db)
        .await
        .map_err(e500)?
        .map(Json)
        .ok_or_else(|| e404("User not found"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody {
    username: Option<String>,
    email: Option<String>,
    password: Option<String>,
    role: Option<Role>,
    cadet_avatar: Option<String>,
}

async fn register_user(State(db): State<Db>, Json(body): Json<RegisterBody>) -> ApiResult<User> {
    let (Some(username), Some(email), Some(password), Some(role)) =
        (body.username, body.email, body.password, body.role)
    else {
        return Err(e400("missing fields"));
    };

    let taken: Option<i64> = query_scalar("SELECT 1 FROM users WHERE username = ? OR email = ?")
        .bind(&username)
        .bind(&email)
        .fetch_optional(&db)
        .await
        .map_err(e500)?;
    if taken.is_some() {
        return Err(e409("Username or email already exists"));
    }

    let now = Utc::now();
    let user = User {
        id: new_id(),
        username,
        email,
        password,
        role,
        created_at: now,
        last_login: now,
        cadet_avatar: body.cadet_avatar,
    };
    insert_user(&db, &user).await.map_err(e500)?;
    tracing::info!(user_id = %user.id, username = %user.username, "user registered");
    Ok(Json(user))
}

async fn insert_user<'e, E>(exec: E, user: &User) -> sqlx::Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    query(
        "INSERT INTO users (id, username, email, password, role, createdAt, lastLogin, cadetAvatar) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&user.id)
    .bind(&user.username)
    .bind(&user.email)
    .bind(&user.password)
    .bind(user.role)
    .bind(user.created_at)
    .bind(user.last_login)
    .bind(&user.cadet_avatar)
    .execute(exec)
    .await?;
    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserIdBody {
    user_id: Option<String>,
}

async fn update_last_login(State(db): State<Db>, Json(body): Json<UserIdBody>) -> ApiResult<Ack> {
    let user_id = body.user_id.ok_or_else(|| e400("userId required"))?;
    query("UPDATE users SET lastLogin = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(&user_id)
        .execute(&db)
        .await
        .map_err(e500)?;
    Ok(Json(Ack::OK))
}

// --- teacher access ---

async fn teacher_access(
    State(db): State<Db>,
    Path(teacher_id): Path<String>,
) -> ApiResult<Vec<TeacherAccess>> {
    let rows = query_as::<_, TeacherAccess>("SELECT * FROM teacher_access WHERE teacherId = ?")
        .bind(&teacher_id)
        .fetch_all(&db)
        .await
        .map_err(e500)?;
    Ok(Json(rows))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessBody {
    teacher_id: Option<String>,
    student_id: Option<String>,
}

async fn grant_access(State(db): State<Db>, Json(body): Json<AccessBody>) -> ApiResult<Ack> {
    let (Some(teacher_id), Some(student_id)) = (body.teacher_id, body.student_id) else {
        return Err(e400("missing fields"));
    };
    insert_access(&db, &teacher_id, &student_id)
        .await
        .map_err(e500)?;
    Ok(Json(Ack::OK))
}

/// Idempotent on (teacherId, studentId).
async fn insert_access<'e, E>(exec: E, teacher_id: &str, student_id: &str) -> sqlx::Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    query(
        "INSERT INTO teacher_access (id, teacherId, studentId, grantedAt) VALUES (?, ?, ?, ?) \
         ON CONFLICT (teacherId, studentId) DO NOTHING",
    )
    .bind(new_id())
    .bind(teacher_id)
    .bind(student_id)
    .bind(Utc::now())
    .execute(exec)
    .await?;
    Ok(())
}

async fn students_for_teacher(
    State(db): State<Db>,
    Path(teacher_id): Path<String>,
) -> ApiResult<Vec<User>> {
    let rows = query_as::<_, User>(
        "SELECT u.* FROM users u \
         JOIN teacher_access a ON a.studentId = u.id \
         WHERE a.teacherId = ? AND u.role = 'student'",
    )
    .bind(&teacher_id)
    .fetch_all(&db)
    .await
    .map_err(e500)?;
    Ok(Json(rows))
}

/// Distinct students enrolled in any of the teacher's active classrooms.
async fn students_for_teacher_v2(
    State(db): State<Db>,
    Path(teacher_id): Path<String>,
) -> ApiResult<Vec<User>> {
    let rows = query_as::<_, User>(
        "SELECT DISTINCT u.* FROM users u \
         JOIN classroom_members cm ON cm.studentId = u.id \
         JOIN classrooms c ON c.id = cm.classroomId \
         WHERE c.teacherId = ? AND u.role = 'student' AND c.isActive = 1",
    )
    .bind(&teacher_id)
    .fetch_all(&db)
    .await
    .map_err(e500)?;
    Ok(Json(rows))
}

// --- progress ---

#[derive(sqlx::FromRow)]
#[sqlx(rename_all = "camelCase")]
struct ProgressRow {
    id: String,
    student_id: String,
    module_id: String,
    module_name: String,
    completed_at: DateTime<Utc>,
    score: Option<f64>,
    time_spent: Option<f64>,
    payload: Option<String>,
}

impl ProgressRow {
    /// Restores the list/JSON fields kept only in `payload`, either at the top
    /// level or under `meta`.
    fn into_progress(self) -> StudentProgress {
        let payload: Value = self
            .payload
            .as_deref()
            .and_then(|p| serde_json::from_str(p).ok())
            .unwrap_or(Value::Null);
        let field = |name: &str| {
            payload
                .get(name)
                .or_else(|| payload.get("meta").and_then(|m| m.get(name)))
                .filter(|v| !v.is_null())
                .cloned()
        };
        let strings = |name: &str| field(name).and_then(|v| serde_json::from_value(v).ok());
        StudentProgress {
            id: self.id,
            student_id: self.student_id,
            module_id: self.module_id,
            module_name: self.module_name,
            completed_at: self.completed_at,
            score: self.score,
            time_spent: self.time_spent,
            equations_solved: strings("equationsSolved"),
            mistakes: strings("mistakes"),
            skill_breakdown: field("skillBreakdown"),
            common_mistakes: strings("commonMistakes"),
            strengths: strings("strengths"),
            areas_for_improvement: strings("areasForImprovement"),
            difficulty_level: field("difficultyLevel").and_then(|v| serde_json::from_value(v).ok()),
        }
    }
}

async fn progress_by_student(
    State(db): State<Db>,
    Path(student_id): Path<String>,
) -> ApiResult<Vec<StudentProgress>> {
    let rows = query_as::<_, ProgressRow>(
        "SELECT * FROM student_progress WHERE studentId = ? ORDER BY completedAt",
    )
    .bind(&student_id)
    .fetch_all(&db)
    .await
    .map_err(e500)?;
    Ok(Json(rows.into_iter().map(ProgressRow::into_progress).collect()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressBody {
    student_id: Option<String>,
    module_id: Option<String>,
    module_name: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    score: Option<f64>,
    time_spent: Option<f64>,
    payload: Option<String>,
}

async fn create_progress(State(db): State<Db>, Json(body): Json<ProgressBody>) -> ApiResult<Value> {
    let (Some(student_id), Some(module_id), Some(module_name), Some(completed_at)) =
        (body.student_id, body.module_id, body.module_name, body.completed_at)
    else {
        return Err(e400("missing fields"));
    };
    let id = new_id();
    query(
        "INSERT INTO student_progress \
         (id, studentId, moduleId, moduleName, completedAt, score, timeSpent, payload) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&student_id)
    .bind(&module_id)
    .bind(&module_name)
    .bind(completed_at)
    .bind(body.score)
    .bind(body.time_spent)
    .bind(&body.payload)
    .execute(&db)
    .await
    .map_err(e500)?;
    Ok(Json(json!({ "ok": true, "id": id })))
}

/// Stores queued offline records under their client ids, so a repeated
/// upload of the same batch inserts nothing new.
async fn create_progress_batch(
    State(db): State<Db>,
    Json(batch): Json<ProgressBatchReq>,
) -> ApiResult<BatchAck> {
    let mut tx = db.begin().await.map_err(e500)?;
    let mut inserted = 0;
    for record in &batch.records {
        let payload = serde_json::to_string(record).map_err(e500)?;
        let done = query(
            "INSERT INTO student_progress \
             (id, studentId, moduleId, moduleName, completedAt, score, timeSpent, payload) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT (id) DO NOTHING",
        )
        .bind(&record.id)
        .bind(&record.student_id)
        .bind(&record.module_id)
        .bind(&record.module_name)
        .bind(record.completed_at)
        .bind(record.score)
        .bind(record.time_spent)
        .bind(payload)
        .execute(&mut *tx)
        .await
        .map_err(e500)?;
        inserted += done.rows_affected() as usize;
    }
    tx.commit().await.map_err(e500)?;
    tracing::info!(received = batch.records.len(), inserted, "progress batch stored");
    Ok(Json(BatchAck {
        ok: true,
        count: inserted,
    }))
}

// --- classrooms ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeacherQuery {
    teacher_id: Option<String>,
}

async fn list_classrooms(
    State(db): State<Db>,
    Query(q): Query<TeacherQuery>,
) -> ApiResult<Vec<Classroom>> {
    let teacher_id = q
        .teacher_id
        .filter(|t| !t.is_empty())
        .ok_or_else(|| e400("teacherId required"))?;
    let rows = query_as::<_, Classroom>(
        "SELECT c.*, COUNT(cm.id) AS studentCount \
         FROM classrooms c \
         LEFT JOIN classroom_members cm ON c.id = cm.classroomId \
         WHERE c.teacherId = ? AND c.isActive = 1 \
         GROUP BY c.id \
         ORDER BY c.createdAt",
    )
    .bind(&teacher_id)
    .fetch_all(&db)
    .await
    .map_err(e500)?;
    Ok(Json(rows))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassroomBody {
    name: Option<String>,
    teacher_id: Option<String>,
}

async fn create_classroom(
    State(db): State<Db>,
    Json(body): Json<ClassroomBody>,
) -> ApiResult<Classroom> {
    let (Some(name), Some(teacher_id)) = (body.name, body.teacher_id) else {
        return Err(e400("missing fields"));
    };
    let is_teacher: Option<i64> =
        query_scalar("SELECT 1 FROM users WHERE id = ? AND role = 'teacher'")
            .bind(&teacher_id)
            .fetch_optional(&db)
            .await
            .map_err(e500)?;
    if is_teacher.is_none() {
        return Err(e400("invalid teacherId"));
    }

    let join_code = loop {
        let candidate = new_join_code();
        let clash: Option<i64> = query_scalar("SELECT 1 FROM classrooms WHERE joinCode = ?")
            .bind(&candidate)
            .fetch_optional(&db)
            .await
            .map_err(e500)?;
        if clash.is_none() {
            break candidate;
        }
    };

    let classroom = Classroom {
        id: new_id(),
        name,
        teacher_id,
        join_code,
        created_at: Utc::now(),
        is_active: true,
        student_count: Some(0),
    };
    query(
        "INSERT INTO classrooms (id, name, teacherId, joinCode, createdAt, isActive) \
         VALUES (?, ?, ?, ?, ?, 1)",
    )
    .bind(&classroom.id)
    .bind(&classroom.name)
    .bind(&classroom.teacher_id)
    .bind(&classroom.join_code)
    .bind(classroom.created_at)
    .execute(&db)
    .await
    .map_err(e500)?;
    tracing::info!(classroom_id = %classroom.id, join_code = %classroom.join_code, "classroom created");
    Ok(Json(classroom))
}

async fn find_classroom(db: &Db, id: &str) -> Result<Option<Classroom>, ApiError> {
    query_as::<_, Classroom>(
        "SELECT c.*, (SELECT COUNT(*) FROM classroom_members m WHERE m.classroomId = c.id) \
         AS studentCount FROM classrooms c WHERE c.id = ?",
    )
    .bind(id)
    .fetch_optional(db)
    .await
    .map_err(e500)
}

async fn members_of(db: &Db, classroom_id: &str) -> Result<Vec<ClassroomMember>, ApiError> {
    query_as::<_, ClassroomMember>(
        "SELECT cm.*, u.username, u.email, u.cadetAvatar \
         FROM classroom_members cm \
         LEFT JOIN users u ON cm.studentId = u.id \
         WHERE cm.classroomId = ? \
         ORDER BY cm.joinedAt",
    )
    .bind(classroom_id)
    .fetch_all(db)
    .await
    .map_err(e500)
}

async fn classroom_details(
    State(db): State<Db>,
    Path(id): Path<String>,
) -> ApiResult<ClassroomDetails> {
    let classroom = find_classroom(&db, &id)
        .await?
        .ok_or_else(|| e404("Classroom not found"))?;
    let members = members_of(&db, &id).await?;
    Ok(Json(ClassroomDetails {
        classroom: Some(classroom),
        members,
    }))
}

async fn classroom_members(
    State(db): State<Db>,
    Path(id): Path<String>,
) -> ApiResult<Vec<ClassroomMember>> {
    Ok(Json(members_of(&db, &id).await?))
}

async fn active_by_code(db: &Db, code: &str) -> Result<Classroom, ApiError> {
    query_as::<_, Classroom>("SELECT * FROM classrooms WHERE joinCode = ? AND isActive = 1")
        .bind(normalize_join_code(code))
        .fetch_optional(db)
        .await
        .map_err(e500)?
        .ok_or_else(|| e404("Invalid join code"))
}

async fn teacher_info(db: &Db, teacher_id: &str) -> Result<Option<TeacherInfo>, ApiError> {
    query_as::<_, TeacherInfo>("SELECT id, username, email FROM users WHERE id = ?")
        .bind(teacher_id)
        .fetch_optional(db)
        .await
        .map_err(e500)
}

async fn join_classroom(State(db): State<Db>, Json(body): Json<JoinBody>) -> ApiResult<JoinOutcome> {
    let (Some(join_code), Some(student_id)) = (body.join_code, body.student_id) else {
        return Err(e400("missing fields"));
    };
    let classroom = active_by_code(&db, &join_code).await?;

    let mut tx = db.begin().await.map_err(e500)?;
    query(
        "INSERT INTO classroom_members (id, classroomId, studentId, joinedAt, isGuest) \
         VALUES (?, ?, ?, ?, 0) ON CONFLICT (classroomId, studentId) DO NOTHING",
    )
    .bind(new_id())
    .bind(&classroom.id)
    .bind(&student_id)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await
    .map_err(e500)?;
    insert_access(&mut *tx, &classroom.teacher_id, &student_id)
        .await
        .map_err(e500)?;
    tx.commit().await.map_err(e500)?;

    let teacher = teacher_info(&db, &classroom.teacher_id).await?;
    tracing::info!(classroom_id = %classroom.id, %student_id, "student joined classroom");
    Ok(Json(JoinOutcome {
        ok: true,
        classroom,
        teacher,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinBody {
    join_code: Option<String>,
    student_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuestJoinBody {
    join_code: Option<String>,
    guest_name: Option<String>,
}

/// Creates a student account for the guest, then enrolls it.
async fn join_classroom_guest(
    State(db): State<Db>,
    Json(body): Json<GuestJoinBody>,
) -> ApiResult<GuestJoinOutcome> {
    let (Some(join_code), Some(guest_name)) = (body.join_code, body.guest_name) else {
        return Err(e400("missing fields"));
    };
    let classroom = active_by_code(&db, &join_code).await?;

    let now = Utc::now();
    let username = guest_username(&guest_name);
    let guest = User {
        id: new_id(),
        email: format!("{username}@guest.local"),
        username,
        password: "guest_password".into(),
        role: Role::Student,
        created_at: now,
        last_login: now,
        cadet_avatar: None,
    };

    let mut tx = db.begin().await.map_err(e500)?;
    insert_user(&mut *tx, &guest).await.map_err(e500)?;
    query(
        "INSERT INTO classroom_members (id, classroomId, studentId, joinedAt, isGuest, guestName) \
         VALUES (?, ?, ?, ?, 1, ?)",
    )
    .bind(new_id())
    .bind(&classroom.id)
    .bind(&guest.id)
    .bind(now)
    .bind(&guest_name)
    .execute(&mut *tx)
    .await
    .map_err(e500)?;
    insert_access(&mut *tx, &classroom.teacher_id, &guest.id)
        .await
        .map_err(e500)?;
    tx.commit().await.map_err(e500)?;

    let teacher = teacher_info(&db, &classroom.teacher_id).await?;
    tracing::info!(classroom_id = %classroom.id, guest_id = %guest.id, "guest joined classroom");
    Ok(Json(GuestJoinOutcome {
        ok: true,
        classroom,
        guest_user: GuestUser {
            id: guest.id,
            username: guest.username,
            guest_name,
        },
        teacher,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudentIdBody {
    student_id: Option<String>,
}

async fn remove_member(
    State(db): State<Db>,
    Path(id): Path<String>,
    Json(body): Json<StudentIdBody>,
) -> ApiResult<Ack> {
    let student_id = body.student_id.ok_or_else(|| e400("studentId required"))?;
    query("DELETE FROM classroom_members WHERE classroomId = ? AND studentId = ?")
        .bind(&id)
        .bind(&student_id)
        .execute(&db)
        .await
        .map_err(e500)?;
    Ok(Json(Ack::OK))
}

async fn deactivate_classroom(State(db): State<Db>, Path(id): Path<String>) -> ApiResult<Ack> {
    query("UPDATE classrooms SET isActive = 0 WHERE id = ?")
        .bind(&id)
        .execute(&db)
        .await
        .map_err(e500)?;
    Ok(Json(Ack::OK))
}

async fn classrooms_by_student(
    State(db): State<Db>,
    Path(student_id): Path<String>,
) -> ApiResult<Vec<Classroom>> {
    let rows = query_as::<_, Classroom>(
        "SELECT c.* FROM classrooms c \
         INNER JOIN classroom_members cm ON c.id = cm.classroomId \
         WHERE cm.studentId = ? AND c.isActive = 1",
    )
    .bind(&student_id)
    .fetch_all(&db)
    .await
    .map_err(e500)?;
    Ok(Json(rows))
}

// --- helpers ---
fn error_body(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": msg.into() })))
}

fn e400(msg: &str) -> ApiError {
    error_body(StatusCode::BAD_REQUEST, msg)
}

fn e404(msg: &str) -> ApiError {
    error_body(StatusCode::NOT_FOUND, msg)
}

fn e409(msg: &str) -> ApiError {
    error_body(StatusCode::CONFLICT, msg)
}

fn e500<E: std::fmt::Display>(e: E) -> ApiError {
    tracing::error!(error = %e, "internal error");
    error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
