//! HTTP client for the sync API.
//!
//! Every exchange (send, status check, body read, decode) runs inside one
//! `tokio::time::timeout`. When the timer wins the exchange future is
//! dropped, which aborts the in-flight request.

use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::error::RemoteError;
use crate::models::*;

type Result<T> = std::result::Result<T, RemoteError>;

const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn seg(raw: &str) -> String {
    utf8_percent_encode(raw, PATH_SEGMENT).to_string()
}

async fn send_and_decode<T: DeserializeOwned>(
    method: &'static str,
    path: &str,
    request: RequestBuilder,
) -> Result<T> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(RemoteError::Status {
            method,
            path: path.to_string(),
            status,
            body,
        });
    }
    serde_json::from_str(&body).map_err(|e| RemoteError::Decode {
        path: path.to_string(),
        message: e.to_string(),
    })
}

#[derive(Clone)]
pub struct RemoteApi {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl RemoteApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "GET");
        self.exchange("GET", path, self.http.get(&url)).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "POST");
        self.exchange("POST", path, self.http.post(&url).json(body))
            .await
    }

    async fn exchange<T: DeserializeOwned>(
        &self,
        method: &'static str,
        path: &str,
        request: RequestBuilder,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, send_and_decode(method, path, request)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout {
                method,
                path: path.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    pub async fn ping(&self) -> Result<Ping> {
        self.get("/api/ping").await
    }

    // users

    pub async fn users(&self) -> Result<Vec<User>> {
        self.get("/api/users").await
    }

    /// `None` when the server answers with JSON `null`.
    pub async fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.get(&format!("/api/users/by-username/{}", seg(username)))
            .await
    }

    pub async fn register(&self, user: &NewUser) -> Result<User> {
        self.post("/api/users/register", user).await
    }

    pub async fn update_last_login(&self, user_id: &str) -> Result<Ack> {
        let req = LastLoginReq {
            user_id: user_id.to_string(),
        };
        self.post("/api/users/update-last-login", &req).await
    }

    // teacher access

    pub async fn grant_teacher_access(&self, teacher_id: &str, student_id: &str) -> Result<Ack> {
        let req = TeacherAccessReq {
            teacher_id: teacher_id.to_string(),
            student_id: student_id.to_string(),
        };
        self.post("/api/teacher-access", &req).await
    }

    pub async fn teacher_access(&self, teacher_id: &str) -> Result<Vec<TeacherAccess>> {
        self.get(&format!("/api/teacher-access/{}", seg(teacher_id)))
            .await
    }

    pub async fn students_for_teacher_v2(&self, teacher_id: &str) -> Result<Vec<User>> {
        self.get(&format!("/api/students/for-teacher-v2/{}", seg(teacher_id)))
            .await
    }

    pub async fn students_for_teacher(&self, teacher_id: &str) -> Result<Vec<User>> {
        self.get(&format!("/api/students/for-teacher/{}", seg(teacher_id)))
            .await
    }

    // progress

    pub async fn save_progress(&self, upload: &ProgressUpload) -> Result<Ack> {
        self.post("/api/progress", upload).await
    }

    pub async fn progress_for(&self, student_id: &str) -> Result<Vec<StudentProgress>> {
        self.get(&format!("/api/progress/by-student/{}", seg(student_id)))
            .await
    }

    pub async fn upload_progress_batch(&self, records: Vec<StudentProgress>) -> Result<BatchAck> {
        self.post("/api/progress/batch", &ProgressBatchReq { records })
            .await
    }

    // classrooms

    pub async fn classrooms(&self, teacher_id: &str) -> Result<Vec<Classroom>> {
        self.get(&format!("/api/classrooms?teacherId={}", seg(teacher_id)))
            .await
    }

    pub async fn create_classroom(&self, name: &str, teacher_id: &str) -> Result<Classroom> {
        let req = CreateClassroomReq {
            name: name.to_string(),
            teacher_id: teacher_id.to_string(),
        };
        self.post("/api/classrooms", &req).await
    }

    pub async fn classroom_details(&self, classroom_id: &str) -> Result<ClassroomDetails> {
        self.get(&format!("/api/classrooms/{}", seg(classroom_id)))
            .await
    }

    pub async fn join(&self, join_code: &str, student_id: &str) -> Result<JoinOutcome> {
        let req = JoinReq {
            join_code: join_code.to_string(),
            student_id: student_id.to_string(),
        };
        self.post("/api/classrooms/join", &req).await
    }

    pub async fn join_as_guest(&self, join_code: &str, guest_name: &str) -> Result<GuestJoinOutcome> {
        let req = GuestJoinReq {
            join_code: join_code.to_string(),
            guest_name: guest_name.to_string(),
        };
        self.post("/api/classrooms/join-guest", &req).await
    }

    pub async fn remove_member(&self, classroom_id: &str, student_id: &str) -> Result<Ack> {
        let req = RemoveMemberReq {
            student_id: student_id.to_string(),
        };
        self.post(&format!("/api/classrooms/{}/remove-member", seg(classroom_id)), &req)
            .await
    }

    pub async fn deactivate(&self, classroom_id: &str) -> Result<Ack> {
        self.post(
            &format!("/api/classrooms/{}/deactivate", seg(classroom_id)),
            &serde_json::json!({}),
        )
        .await
    }

    pub async fn classrooms_for_student(&self, student_id: &str) -> Result<Vec<Classroom>> {
        self.get(&format!("/api/classrooms/by-student/{}", seg(student_id)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn path_segments_are_percent_encoded() {
        assert_eq!(seg("guest_Ana María_1234"), "guest_Ana%20Mar%C3%ADa_1234");
        assert_eq!(seg("a/b?c"), "a%2Fb%3Fc");
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold connections without ever answering.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let api = RemoteApi::new(format!("http://{addr}"), Duration::from_millis(150)).unwrap();
        let err = api.ping().await.unwrap_err();
        assert!(matches!(err, RemoteError::Timeout { method: "GET", .. }), "{err}");
        assert!(err.to_string().contains("/api/ping"));
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let api = RemoteApi::new(format!("http://{addr}/"), Duration::from_secs(2)).unwrap();
        assert_eq!(api.base_url(), format!("http://{addr}"));
        let err = api.users().await.unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_)), "{err}");
    }
}
