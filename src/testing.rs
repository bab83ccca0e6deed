//! In-memory stand-ins for the container runtime and the source host, plus a loopback HTTP server.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::Path,
    sync::{Arc, Mutex, Once},
    thread::{self, ThreadId},
};

use async_trait::async_trait;
use flate2::{write::GzEncoder, Compression};
use futures::{stream::BoxStream, StreamExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::{
    config::Config,
    engines::{DOCKERFILE, MANIFEST_FILE},
    perf::PERF_EVENTS,
    runtime::{BuildProgress, BuildRequest, ContainerRuntime, OutputSink, RunSpec},
    source::{CommitRef, SourceHost, GITHUB_API_ROOT},
    Error, Result,
};

/// Writes an engine directory with the given manifest and Dockerfile.
pub fn write_engine(config: &Config, id: &str, manifest: &str, dockerfile: &str) {
    let dir = config.engines_dir().join(id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
    fs::write(dir.join(DOCKERFILE), dockerfile).unwrap();
}

/// `perf stat -x,` output for every counted event, with the given running time.
pub fn perf_output(run_time_ns: u64) -> String {
    PERF_EVENTS
        .iter()
        .enumerate()
        .map(|(i, event)| format!("{},,{event}:u,{run_time_ns},100.00,,\n", (i + 1) * 100))
        .collect()
}

/// `time -v` output with the given maximum resident set size.
pub fn time_output(max_rss_kb: u64) -> String {
    format!(
        "\tCommand being timed: \"js /mjsuite/workload.js\"\n\
         \tMaximum resident set size (kbytes): {max_rss_kb}\n\
         \tExit status: 0\n"
    )
}

static CAPTURED_LOGS: Mutex<Vec<(ThreadId, String)>> = Mutex::new(Vec::new());

struct CaptureLogger;

impl log::Log for CaptureLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.target().starts_with(env!("CARGO_CRATE_NAME"))
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            CAPTURED_LOGS
                .lock()
                .unwrap()
                .push((thread::current().id(), record.args().to_string()));
        }
    }

    fn flush(&self) {}
}

/// Records `info` and above log lines of this crate from now on.
pub fn capture_logs() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        log::set_logger(&CaptureLogger).unwrap();
        log::set_max_level(log::LevelFilter::Info);
    });
}

/// Lines captured on the calling thread, in order.
pub fn logs_on_this_thread() -> Vec<String> {
    let id = thread::current().id();
    CAPTURED_LOGS
        .lock()
        .unwrap()
        .iter()
        .filter(|(thread, _)| *thread == id)
        .map(|(_, line)| line.clone())
        .collect()
}

#[derive(Default)]
struct RuntimeCalls {
    images: HashSet<String>,
    builds: Vec<BuildRequest>,
    runs: Vec<RunSpec>,
    pulls: Vec<String>,
    prunes: usize,
}

/// Container runtime that records every call and replays canned results.
#[derive(Default)]
pub struct FakeRuntime {
    exit_code: i64,
    output: String,
    build_progress: Vec<BuildProgress>,
    calls: Mutex<RuntimeCalls>,
}

impl FakeRuntime {
    pub fn with_exit_code(mut self, exit_code: i64) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Output every container prints.
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    /// Progress every build reports. A successful build registers its image.
    pub fn with_build_progress(mut self, progress: Vec<BuildProgress>) -> Self {
        self.build_progress = progress;
        self
    }

    pub fn with_image(self, tag: &str) -> Self {
        self.calls.lock().unwrap().images.insert(tag.to_string());
        self
    }

    pub fn builds(&self) -> Vec<BuildRequest> {
        self.calls.lock().unwrap().builds.clone()
    }

    pub fn runs(&self) -> Vec<RunSpec> {
        self.calls.lock().unwrap().runs.clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.calls.lock().unwrap().pulls.clone()
    }

    pub fn prunes(&self) -> usize {
        self.calls.lock().unwrap().prunes
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_exists(&self, tag: &str) -> Result<bool> {
        Ok(self.calls.lock().unwrap().images.contains(tag))
    }

    fn build_image(&self, request: BuildRequest) -> BoxStream<'_, Result<BuildProgress>> {
        let mut calls = self.calls.lock().unwrap();
        if !self
            .build_progress
            .iter()
            .any(|progress| matches!(progress, BuildProgress::Error(_)))
        {
            calls.images.insert(request.tag.clone());
        }
        calls.builds.push(request);
        futures::stream::iter(self.build_progress.clone().into_iter().map(Ok)).boxed()
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut calls = self.calls.lock().unwrap();
        calls.pulls.push(image.to_string());
        calls.images.insert(image.to_string());
        Ok(())
    }

    async fn run(&self, spec: &RunSpec, sink: &mut OutputSink<'_>) -> Result<i64> {
        self.calls.lock().unwrap().runs.push(spec.clone());
        if !self.output.is_empty() {
            sink(&self.output);
        }
        Ok(self.exit_code)
    }

    async fn prune_dangling_images(&self) -> Result<()> {
        self.calls.lock().unwrap().prunes += 1;
        Ok(())
    }
}

/// Source host with a fixed set of known versions and a single archive served for every download.
#[derive(Default)]
pub struct FakeHost {
    commits: HashMap<String, String>,
    archive: Option<(String, String)>,
    resolve_calls: Mutex<usize>,
    downloads: Mutex<Vec<String>>,
}

impl FakeHost {
    pub fn with_commit(mut self, version: &str, sha: &str) -> Self {
        self.commits.insert(version.to_string(), sha.to_string());
        self
    }

    /// Serves a gzipped tarball holding a single file at `path` with `contents`.
    pub fn with_archive(mut self, path: &str, contents: &str) -> Self {
        self.archive = Some((path.to_string(), contents.to_string()));
        self
    }

    pub fn resolve_calls(&self) -> usize {
        *self.resolve_calls.lock().unwrap()
    }

    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }

    fn tarball(&self) -> Vec<u8> {
        let (path, contents) = self
            .archive
            .clone()
            .unwrap_or_else(|| ("source/README".to_string(), String::new()));

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }
}

#[async_trait]
impl SourceHost for FakeHost {
    async fn resolve_commit(&self, repository: &str, version: &str) -> Result<CommitRef> {
        *self.resolve_calls.lock().unwrap() += 1;
        self.commits
            .get(version)
            .map(CommitRef::new)
            .ok_or_else(|| Error::Resolution {
                repository: repository.to_string(),
                version: version.to_string(),
                reason: "unknown version".to_string(),
            })
    }

    fn archive_url(&self, repository: &str, commit: &CommitRef) -> String {
        format!("{GITHUB_API_ROOT}/repos/{repository}/tarball/{commit}")
    }

    fn clone_url(&self, repository: &str) -> String {
        format!("https://github.com/{repository}.git")
    }

    async fn download(&self, url: &str, destination: &Path) -> Result<()> {
        self.downloads.lock().unwrap().push(url.to_string());
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(destination, self.tarball())?;
        Ok(())
    }
}

/// HTTP/1.1 server on a loopback port answering `GET`s from a fixed route table. Unknown paths get a 404.
pub struct FakeServer {
    url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeServer {
    pub async fn start<P: Into<String>, B: Into<String>>(routes: Vec<(P, B)>) -> Self {
        let routes: HashMap<String, String> = routes
            .into_iter()
            .map(|(path, body)| (path.into(), body.into()))
            .collect();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let head = read_head(&mut stream).await;
                let path = head.split_whitespace().nth(1).unwrap_or_default();
                let (status, body) = match routes.get(path) {
                    Some(body) => ("200 OK", body.as_str()),
                    None => ("404 Not Found", r#"{"message":"Not Found"}"#),
                };
                let response = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                recorded.lock().unwrap().push(head.to_ascii_lowercase());
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        Self { url, requests }
    }

    /// Base URL, without a trailing slash.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request lines and headers received so far, lowercased, in arrival order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0; 1024];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}
