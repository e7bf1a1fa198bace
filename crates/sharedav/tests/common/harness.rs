//! Test server harness for share routing integration tests.
//!
//! Provides a `TestServer` that runs the front endpoint over a temporary
//! directory of shares, along with HTTP convenience methods.

use arc_swap::ArcSwap;
use reqwest::{Client, Method, Response, StatusCode};
use sharedav::{
    BackoffConfig, BoxFuture, FileServer, FileSystemForRemote, Launcher, Permissions,
    RemoteOptions, ServerConfig, Share, ShareServer, StaticPermissions, SupervisorOptions,
    UserServerError,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;

/// Owner recorded on every test share.
pub const TEST_OWNER: &str = "alice";

/// Runs the configured executable as a shell script.
pub struct ShellLauncher;

impl Launcher for ShellLauncher {
    fn command<'a>(
        &'a self,
        _username: &'a str,
        executable: &'a Path,
    ) -> BoxFuture<'a, Result<Command, UserServerError>> {
        Box::pin(async move {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg(executable);
            Ok(cmd)
        })
    }
}

/// Refuses every launch, so no user server ever reports an address.
pub struct RefusingLauncher;

impl Launcher for RefusingLauncher {
    fn command<'a>(
        &'a self,
        username: &'a str,
        _executable: &'a Path,
    ) -> BoxFuture<'a, Result<Command, UserServerError>> {
        let username = username.to_string();
        Box::pin(async move { Err(UserServerError::RunningAsRoot(username)) })
    }
}

/// Front endpoint over temporary shares, with automatic cleanup.
pub struct TestServer {
    remote: FileSystemForRemote,
    permissions: Arc<ArcSwap<StaticPermissions>>,
    share_server: ShareServer,
    /// File server the shares are proxied to.
    file_server: Option<FileServer>,
    client: Client,
    /// Base URL of the front endpoint.
    pub base_url: String,
    temp_dir: TempDir,
}

impl TestServer {
    /// Serve `shares` from an in-process file server.
    pub async fn in_process(shares: &[&str], permissions: StaticPermissions) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let remote = FileSystemForRemote::new(RemoteOptions {
            privilege_separation: false,
            ..RemoteOptions::default()
        });

        let mut server = Self::start(temp_dir, remote, permissions).await;
        server.reconfigure(shares).await;
        server
    }

    /// Serve `shares` through a user server child process. The child is a
    /// shell script that reports the address of an in-process file server.
    pub async fn privilege_separated(shares: &[&str], permissions: StaticPermissions) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        for name in shares {
            std::fs::create_dir_all(temp_dir.path().join(name)).unwrap();
        }
        let file_server = start_file_server(temp_dir.path(), shares).await;

        let script = temp_dir.path().join("serve-shares.sh");
        std::fs::write(
            &script,
            format!("echo {}\nexec sleep 600\n", file_server.addr()),
        )
        .unwrap();

        let remote = FileSystemForRemote::new(RemoteOptions {
            privilege_separation: true,
            executable: Some(script),
            supervisor: supervisor(Arc::new(ShellLauncher)),
        });
        remote.set_shares(
            shares
                .iter()
                .map(|name| Share::new(*name, temp_dir.path().join(name), TEST_OWNER)),
        );

        let mut server = Self::start(temp_dir, remote, permissions).await;
        server.file_server = Some(file_server);
        server.wait_for_user_servers().await;
        server
    }

    /// Privilege-separated shares whose user servers never start.
    pub async fn without_user_servers(shares: &[&str], permissions: StaticPermissions) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let remote = FileSystemForRemote::new(RemoteOptions {
            privilege_separation: true,
            executable: Some(PathBuf::from("/nonexistent/sharedav")),
            supervisor: supervisor(Arc::new(RefusingLauncher)),
        });
        remote.set_shares(
            shares
                .iter()
                .map(|name| Share::new(*name, temp_dir.path().join(name), TEST_OWNER)),
        );
        Self::start(temp_dir, remote, permissions).await
    }

    async fn start(
        temp_dir: TempDir,
        remote: FileSystemForRemote,
        permissions: StaticPermissions,
    ) -> Self {
        let permissions = Arc::new(ArcSwap::from_pointee(permissions));
        let policy: Arc<dyn Permissions> = permissions.clone();
        let share_server = ShareServer::start(remote.clone(), policy, ServerConfig::default())
            .await
            .expect("Failed to start share server");
        let base_url = share_server.url();

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            remote,
            permissions,
            share_server,
            file_server: None,
            client,
            base_url,
            temp_dir,
        }
    }

    /// Replace the in-process share set with `shares`, creating their
    /// directories as needed.
    pub async fn reconfigure(&mut self, shares: &[&str]) {
        for name in shares {
            std::fs::create_dir_all(self.share_dir(name)).unwrap();
        }
        let file_server = start_file_server(self.temp_dir.path(), shares).await;
        self.remote.set_file_server_addr(file_server.addr().to_string());
        if let Some(previous) = self.file_server.replace(file_server) {
            previous.stop().await;
        }
        let root = self.temp_dir.path();
        self.remote.set_shares(
            shares
                .iter()
                .map(|name| Share::new(*name, root.join(name), TEST_OWNER)),
        );
    }

    /// Replace the permission policy for subsequent requests.
    pub fn set_permissions(&self, permissions: StaticPermissions) {
        self.permissions.store(Arc::new(permissions));
    }

    /// The file system behind the endpoint.
    pub fn remote(&self) -> &FileSystemForRemote {
        &self.remote
    }

    /// Directory backing a share.
    pub fn share_dir(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    async fn wait_for_user_servers(&self) {
        for _ in 0..100 {
            let generation = self.remote.snapshot();
            if generation
                .user_servers()
                .values()
                .all(|server| server.addr().is_some())
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("User servers did not report an address in time");
    }

    /// Build a full URL from a path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // ========== HTTP Convenience Methods ==========

    /// GET a file's contents.
    pub async fn get(&self, path: &str) -> Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("GET request failed")
    }

    /// GET a file and return its body, asserting success.
    pub async fn get_text(&self, path: &str) -> String {
        let resp = self.get(path).await;
        assert_eq!(resp.status(), StatusCode::OK, "GET {path}");
        resp.text().await.expect("Failed to read response body")
    }

    /// PUT file contents.
    pub async fn put(&self, path: &str, body: impl Into<reqwest::Body>) -> Response {
        self.client
            .put(self.url(path))
            .body(body)
            .send()
            .await
            .expect("PUT request failed")
    }

    /// DELETE a file or directory.
    pub async fn delete(&self, path: &str) -> Response {
        self.client
            .delete(self.url(path))
            .send()
            .await
            .expect("DELETE request failed")
    }

    /// MKCOL a directory.
    pub async fn mkcol(&self, path: &str) -> Response {
        self.client
            .request(Method::from_bytes(b"MKCOL").unwrap(), self.url(path))
            .send()
            .await
            .expect("MKCOL request failed")
    }

    /// PROPFIND with the given depth.
    pub async fn propfind(&self, path: &str, depth: &str) -> Response {
        self.client
            .request(Method::from_bytes(b"PROPFIND").unwrap(), self.url(path))
            .header("Depth", depth)
            .send()
            .await
            .expect("PROPFIND request failed")
    }

    /// OPTIONS request.
    pub async fn options(&self, path: &str) -> Response {
        self.client
            .request(Method::OPTIONS, self.url(path))
            .send()
            .await
            .expect("OPTIONS request failed")
    }

    /// Stop the endpoint and every server behind it.
    pub async fn shutdown(self) {
        self.remote.close();
        self.share_server.stop().await;
        if let Some(file_server) = self.file_server {
            file_server.stop().await;
        }
    }
}

async fn start_file_server(root: &Path, shares: &[&str]) -> FileServer {
    FileServer::start(
        shares
            .iter()
            .map(|name| ((*name).to_string(), root.join(name))),
        ServerConfig::default(),
    )
    .await
    .expect("Failed to start file server")
}

fn supervisor(launcher: Arc<dyn Launcher>) -> SupervisorOptions {
    SupervisorOptions {
        backoff: BackoffConfig {
            base: Duration::from_millis(10),
            max: Duration::from_millis(100),
        },
        launcher,
        ..SupervisorOptions::default()
    }
}
