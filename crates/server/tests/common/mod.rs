//! Shared harness for HTTP integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use iavatar_core::inference::fake::FakePipeline;
use iavatar_server::{create_app, AppState, Config};
use tower::ServiceExt;

pub const BOUNDARY: &str = "iavatar-test-boundary";

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
    pub pipeline: Arc<FakePipeline>,
    _dir: tempfile::TempDir,
}

impl TestApp {
    pub fn new(pipeline: FakePipeline) -> Self {
        Self::with_config(pipeline, Config::default())
    }

    pub fn with_config(pipeline: FakePipeline, config: Config) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            staging_dir: Some(dir.path().join("staging")),
            ..config
        };
        let pipeline = Arc::new(pipeline);
        let state = AppState::new(config, pipeline.clone()).unwrap();
        Self {
            app: create_app(Arc::clone(&state)),
            state,
            pipeline,
            _dir: dir,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    /// Files and directories currently in the staging directory.
    pub fn staged_entries(&self) -> usize {
        std::fs::read_dir(self.state.staging.root()).unwrap().count()
    }

    /// Poll `/job/{id}` until it stops reporting a pending state.
    pub async fn poll_until_done(&self, job_id: &str) -> Response<Body> {
        for _ in 0..250 {
            let response = self.get(&format!("/job/{job_id}")).await;
            if response.headers()[header::CONTENT_TYPE] == "video/mp4" {
                return response;
            }
            let (parts, body) = response.into_parts();
            let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
            let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            if json["state"] != "Queued" && json["state"] != "Processing" {
                return Response::from_parts(parts, Body::from(bytes));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {job_id} did not finish");
    }
}

pub enum Part<'a> {
    File {
        name: &'a str,
        filename: &'a str,
        content_type: &'a str,
        bytes: &'a [u8],
    },
    Text {
        name: &'a str,
        value: &'a str,
    },
}

pub fn image_part(bytes: &[u8]) -> Part<'_> {
    Part::File {
        name: "image",
        filename: "face.jpg",
        content_type: "image/jpeg",
        bytes,
    }
}

pub fn audio_part(bytes: &[u8]) -> Part<'_> {
    Part::File {
        name: "audio",
        filename: "voice.wav",
        content_type: "audio/wav",
        bytes,
    }
}

pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::File {
                name,
                filename,
                content_type,
                bytes,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes);
            }
            Part::Text { name, value } => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}")
                        .as_bytes(),
                );
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn multipart_request(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> (StatusCode, serde_json::Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

pub async fn bytes_body(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}
