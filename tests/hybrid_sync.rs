use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::Path, routing::{get, post}, Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use mathtutor_sync::models::{DifficultyLevel, NewProgress, NewUser, Role};
use mathtutor_sync::store::REMOTE_RECORD_ID;
use mathtutor_sync::{db, routes, DbMode, HybridStore, MemoryKv, StoreConfig};

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn spawn_api() -> String {
    let pool = db::connect("sqlite::memory:").await.unwrap();
    serve(routes::router(pool)).await
}

async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

fn user(username: &str, role: Role) -> NewUser {
    NewUser {
        username: username.into(),
        email: format!("{username}@school.test"),
        password: "pw".into(),
        role,
        cadet_avatar: None,
    }
}

fn progress(student_id: &str, module_id: &str) -> NewProgress {
    NewProgress {
        student_id: student_id.into(),
        module_id: module_id.into(),
        module_name: module_id.to_uppercase(),
        completed_at: Utc::now(),
        score: Some(75.0),
        time_spent: Some(9.5),
        equations_solved: Some(vec!["(x+1)/(x-2) = 3".into()]),
        mistakes: Some(vec!["forgot excluded value".into()]),
        common_mistakes: Some(vec!["sign error".into()]),
        difficulty_level: Some(DifficultyLevel::Intermediate),
        ..Default::default()
    }
}

#[tokio::test]
async fn api_only_serves_from_api_and_never_touches_local_storage() {
    let base = spawn_api().await;
    let kv = Arc::new(MemoryKv::new());
    let store = HybridStore::open(StoreConfig::api_only(&base), kv.clone())
        .await
        .unwrap();
    assert_eq!(store.mode(), DbMode::ApiOnly);
    assert!(store.test_connection().await);

    let teacher = store.create_user(user("ms_rivera", Role::Teacher)).await.unwrap();
    let student = store.create_user(user("ana", Role::Student)).await.unwrap();
    let room = store
        .create_classroom("Algebra 101", &teacher.id)
        .await
        .unwrap();
    let out = store.join_classroom(&room.join_code, &student.id).await.unwrap();
    assert_eq!(out.teacher.unwrap().username, "ms_rivera");

    let details = store.get_classroom_details(&room.id).await.unwrap();
    assert_eq!(details.members.len(), 1);
    assert_eq!(details.members[0].student_id, student.id);

    let saved = store
        .save_student_progress(progress(&student.id, "mercury"))
        .await
        .unwrap();
    assert_eq!(saved.id, REMOTE_RECORD_ID);
    let rows = store.get_student_progress(&student.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].mistakes.as_deref(), Some(&["forgot excluded value".to_string()][..]));

    let students = store.get_students_for_teacher(&teacher.id).await.unwrap();
    assert_eq!(students.len(), 1);
    assert_eq!(
        store.get_user_by_id(&student.id).await.unwrap().unwrap().username,
        "ana"
    );
    assert!(store.authenticate("ana", "pw").await.unwrap().is_some());

    assert!(kv.is_empty(), "local storage was written: {:?}", kv.snapshot());
}

#[tokio::test]
async fn hybrid_mirrors_remote_classrooms_for_later_offline_joins() {
    let base = spawn_api().await;
    let kv = Arc::new(MemoryKv::new());
    let online = HybridStore::open(StoreConfig::hybrid(&base), kv.clone())
        .await
        .unwrap();
    let teacher = online.create_user(user("ms_rivera", Role::Teacher)).await.unwrap();
    let room = online
        .create_classroom("Algebra 101", &teacher.id)
        .await
        .unwrap();
    assert!(kv
        .snapshot()
        .contains_key(&format!("mathtutor_data_classroom_{}", room.id)));

    // Same device, API gone.
    let offline = HybridStore::open(StoreConfig::hybrid(dead_url().await), kv.clone())
        .await
        .unwrap();
    let out = offline
        .join_classroom(&room.join_code.to_lowercase(), "student-9")
        .await
        .unwrap();
    assert_eq!(out.classroom.id, room.id);
    let details = offline.get_classroom_details(&room.id).await.unwrap();
    assert_eq!(details.members.len(), 1);
    assert_eq!(details.members[0].student_id, "student-9");
    assert!(offline.pending_joins().await.unwrap().is_empty());
}

#[tokio::test]
async fn slow_api_times_out_and_falls_back_once() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().route(
        "/api/users/register",
        post(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(2)).await;
                Json(json!({"id": "late"}))
            }
        }),
    );
    let base = serve(app).await;

    let kv = Arc::new(MemoryKv::new());
    let config = StoreConfig::hybrid(&base).with_timeout(Duration::from_millis(200));
    let store = HybridStore::open(config, kv.clone()).await.unwrap();

    let created = store.create_user(user("ana", Role::Student)).await.unwrap();
    assert_ne!(created.id, "late");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Nothing arrives after the fallback to add a second record.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let raw = kv.snapshot().remove("mathtutor_data").unwrap();
    let doc: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(doc["users"].as_array().unwrap().len(), 1);
    assert_eq!(doc["version"], 1);
}

#[tokio::test]
async fn queued_progress_is_flushed_once_the_api_returns() {
    let kv = Arc::new(MemoryKv::new());
    let unreachable = HybridStore::open(StoreConfig::hybrid(dead_url().await), kv.clone())
        .await
        .unwrap();
    unreachable
        .save_student_progress(progress("s1", "mercury"))
        .await
        .unwrap();
    unreachable
        .save_student_progress(progress("s1", "venus"))
        .await
        .unwrap();
    assert_eq!(unreachable.offline_progress().await.unwrap().len(), 2);
    assert!(unreachable.flush_offline_progress().await.is_err());
    assert_eq!(unreachable.offline_progress().await.unwrap().len(), 2);

    let base = spawn_api().await;
    let online = HybridStore::open(StoreConfig::hybrid(&base), kv.clone())
        .await
        .unwrap();
    assert_eq!(online.flush_offline_progress().await.unwrap(), 2);
    assert!(online.offline_progress().await.unwrap().is_empty());
    assert_eq!(online.flush_offline_progress().await.unwrap(), 0);

    let rows = online.get_student_progress("s1").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(
        rows[0].equations_solved.as_deref(),
        Some(&["(x+1)/(x-2) = 3".to_string()][..])
    );
    assert_eq!(rows[0].time_spent, Some(9.5));
    assert_eq!(rows[0].common_mistakes.as_deref(), Some(&["sign error".to_string()][..]));
    assert_eq!(rows[0].difficulty_level, Some(DifficultyLevel::Intermediate));
}

#[tokio::test]
async fn students_for_teacher_uses_older_endpoint_when_v2_is_missing() {
    let app = Router::new().route(
        "/api/students/for-teacher/:id",
        get(|Path(id): Path<String>| async move {
            Json(json!([{
                "id": "s1",
                "username": format!("student_of_{id}"),
                "email": "s1@school.test",
                "password": "pw",
                "role": "student",
                "createdAt": "2025-03-01T08:30:00Z",
                "lastLogin": "2025-03-01T08:30:00Z"
            }]))
        }),
    );
    let base = serve(app).await;
    let store = HybridStore::open(StoreConfig::hybrid(&base), Arc::new(MemoryKv::new()))
        .await
        .unwrap();

    let students = store.get_students_for_teacher("t1").await.unwrap();
    assert_eq!(students.len(), 1);
    assert_eq!(students[0].username, "student_of_t1");
}

#[tokio::test]
async fn failing_api_answers_guest_joins_from_local_cache() {
    let app = Router::new().route(
        "/api/classrooms/join-guest",
        post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
    );
    let base = serve(app).await;
    let store = HybridStore::open(StoreConfig::hybrid(&base), Arc::new(MemoryKv::new()))
        .await
        .unwrap();

    let out = store
        .join_classroom_as_guest("ABC123", "Juan Cruz")
        .await
        .unwrap();
    assert!(out.ok);
    assert!(out.classroom.is_pending());
    let pending = store.pending_joins().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].guest_name.as_deref(), Some("Juan Cruz"));
    assert_eq!(pending[0].student_id, out.guest_user.id);
}

#[tokio::test]
async fn hybrid_deactivate_stops_later_offline_joins() {
    let base = spawn_api().await;
    let kv = Arc::new(MemoryKv::new());
    let online = HybridStore::open(StoreConfig::hybrid(&base), kv.clone())
        .await
        .unwrap();
    let teacher = online.create_user(user("ms_rivera", Role::Teacher)).await.unwrap();
    let room = online
        .create_classroom("Algebra 101", &teacher.id)
        .await
        .unwrap();
    online.deactivate_classroom(&room.id).await.unwrap();

    let offline = HybridStore::open(StoreConfig::hybrid(dead_url().await), kv.clone())
        .await
        .unwrap();
    let cached = offline.get_classrooms(&teacher.id).await.unwrap();
    assert!(!cached[0].is_active);
    let out = offline.join_classroom(&room.join_code, "student-9").await.unwrap();
    assert!(out.classroom.is_pending());
    assert!(offline
        .get_classroom_details(&room.id)
        .await
        .unwrap()
        .members
        .is_empty());
}

#[tokio::test]
async fn hybrid_member_removal_reaches_the_local_copy() {
    let base = spawn_api().await;
    let kv = Arc::new(MemoryKv::new());
    let online = HybridStore::open(StoreConfig::hybrid(&base), kv.clone())
        .await
        .unwrap();
    let teacher = online.create_user(user("ms_rivera", Role::Teacher)).await.unwrap();
    let room = online
        .create_classroom("Algebra 101", &teacher.id)
        .await
        .unwrap();

    let offline = HybridStore::open(StoreConfig::hybrid(dead_url().await), kv.clone())
        .await
        .unwrap();
    offline.join_classroom(&room.join_code, "student-9").await.unwrap();
    assert_eq!(offline.get_classrooms_for_student("student-9").await.unwrap().len(), 1);

    online
        .remove_classroom_member(&room.id, "student-9")
        .await
        .unwrap();
    let details = offline.get_classroom_details(&room.id).await.unwrap();
    assert!(details.members.is_empty());
    assert_eq!(details.classroom.unwrap().student_count, Some(0));
    assert!(offline
        .get_classrooms_for_student("student-9")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn classrooms_deactivated_elsewhere_drop_out_on_the_next_listing() {
    let base = spawn_api().await;
    let kv = Arc::new(MemoryKv::new());
    let online = HybridStore::open(StoreConfig::hybrid(&base), kv.clone())
        .await
        .unwrap();
    let teacher = online.create_user(user("ms_rivera", Role::Teacher)).await.unwrap();
    let room = online
        .create_classroom("Algebra 101", &teacher.id)
        .await
        .unwrap();

    // Another device deactivates it straight through the API.
    let other = HybridStore::open(StoreConfig::api_only(&base), Arc::new(MemoryKv::new()))
        .await
        .unwrap();
    other.deactivate_classroom(&room.id).await.unwrap();

    assert!(online.get_classrooms(&teacher.id).await.unwrap().is_empty());

    let offline = HybridStore::open(StoreConfig::hybrid(dead_url().await), kv.clone())
        .await
        .unwrap();
    let out = offline.join_classroom(&room.join_code, "student-9").await.unwrap();
    assert!(out.classroom.is_pending());
    let details = offline.get_classroom_details(&room.id).await.unwrap();
    assert!(!details.classroom.unwrap().is_active);
}

#[tokio::test]
async fn connection_check_accepts_offset_less_ping_timestamps() {
    let app = Router::new().route(
        "/api/ping",
        get(|| async {
            Json(json!({
                "status": "ok",
                "message": "Database API is running",
                "timestamp": "2025-03-01T08:30:00.123456",
                "db_path": "/srv/hybrid.db"
            }))
        }),
    );
    let base = serve(app).await;
    let store = HybridStore::open(StoreConfig::hybrid(&base), Arc::new(MemoryKv::new()))
        .await
        .unwrap();
    assert!(store.test_connection().await);
}
