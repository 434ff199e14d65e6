// Sandbox abstraction
//
// Each process owns exactly one sandbox: an isolated filesystem/shell/browser
// surface. LocalSandbox is the container-less fallback rooted under the data
// dir; a container-backed implementation plugs in behind the same trait.
// The `workspace` subdirectory is the agent -> operator handoff surface.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{KernelError, Result};
use crate::types::Pid;

/// Result of a shell command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// One directory listing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Isolated execution environment for one process
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Stable identifier for logging
    fn id(&self) -> &str;

    /// Absolute path of the shared workspace directory
    fn workspace(&self) -> &Path;

    /// List a directory (path relative to the sandbox root)
    async fn list_dir(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Read a file as UTF-8 text
    async fn read_file(&self, path: &str) -> Result<String>;

    /// Create or replace a file
    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    /// Create a directory (and parents)
    async fn make_dir(&self, path: &str) -> Result<()>;

    /// Run a shell command inside the sandbox
    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecResult>;

    /// Fetch a page in the sandbox browser session
    async fn browse(&self, url: &str) -> Result<String>;

    /// Click an element in the current browser page
    async fn click(&self, selector: &str) -> Result<String>;

    /// Release all resources. Idempotent.
    async fn teardown(&self) -> Result<()>;
}

/// Creates sandboxes at spawn time
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    async fn create(&self, pid: Pid, owner_uid: &str) -> Result<Arc<dyn Sandbox>>;
}

// ============================================================================
// LocalSandbox - directory-rooted fallback
// ============================================================================

/// Sandbox backed by a plain directory on the host.
///
/// File operations are jailed to the root via lexical normalization; shell
/// commands run with the root as working directory. The browser is a plain
/// HTTP fetcher without an interactive DOM.
pub struct LocalSandbox {
    id: String,
    root: PathBuf,
    workspace: PathBuf,
    http: reqwest::Client,
}

impl LocalSandbox {
    /// Create the sandbox directories under `root`
    pub async fn create(id: impl Into<String>, root: PathBuf) -> Result<Self> {
        let id = id.into();
        let workspace = root.join("workspace");
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| KernelError::sandbox(format!("create {}: {e}", root.display())))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| KernelError::sandbox(e.to_string()))?;
        Ok(Self {
            id,
            root,
            workspace,
            http,
        })
    }

    /// Resolve a relative path inside the jail.
    ///
    /// Rejects absolute paths and any traversal that would escape the root.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let requested = Path::new(path);
        let mut resolved = PathBuf::new();
        for component in requested.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !resolved.pop() {
                        return Err(KernelError::invalid(format!(
                            "path escapes sandbox: {path}"
                        )));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(KernelError::invalid(format!(
                        "absolute paths are not allowed: {path}"
                    )));
                }
            }
        }
        Ok(self.root.join(resolved))
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn workspace(&self) -> &Path {
        &self.workspace
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<FileEntry>> {
        let dir = self.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| KernelError::tool(format!("list {path}: {e}")))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| KernelError::tool(e.to_string()))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| KernelError::tool(e.to_string()))?;
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: meta.is_dir(),
                size: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let file = self.resolve(path)?;
        tokio::fs::read_to_string(&file)
            .await
            .map_err(|e| KernelError::tool(format!("read {path}: {e}")))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let file = self.resolve(path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| KernelError::tool(e.to_string()))?;
        }
        tokio::fs::write(&file, content)
            .await
            .map_err(|e| KernelError::tool(format!("write {path}: {e}")))
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        let dir = self.resolve(path)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| KernelError::tool(format!("mkdir {path}: {e}")))
    }

    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecResult> {
        debug!(sandbox = %self.id, %command, "exec");
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| KernelError::tool(format!("spawn shell: {e}")))?;

        let output = tokio::select! {
            result = child.wait_with_output() => {
                result.map_err(|e| KernelError::tool(e.to_string()))?
            }
            _ = tokio::time::sleep(timeout) => {
                return Err(KernelError::Timeout(format!("command exceeded {}s", timeout.as_secs())));
            }
            _ = cancel.cancelled() => {
                return Err(KernelError::Cancelled);
            }
        };

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn browse(&self, url: &str) -> Result<String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| KernelError::tool(format!("fetch {url}: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| KernelError::tool(e.to_string()))?;
        Ok(format!("[{status}] {body}"))
    }

    async fn click(&self, _selector: &str) -> Result<String> {
        // Interactive DOM requires a container-hosted browser
        Err(KernelError::unavailable(
            "click_element is not supported by the local sandbox",
        ))
    }

    async fn teardown(&self) -> Result<()> {
        if let Err(e) = tokio::fs::remove_dir_all(&self.root).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(sandbox = %self.id, error = %e, "teardown failed");
            }
        }
        Ok(())
    }
}

/// Factory creating LocalSandbox instances under a base directory
pub struct LocalSandboxFactory {
    base: PathBuf,
}

impl LocalSandboxFactory {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

#[async_trait]
impl SandboxFactory for LocalSandboxFactory {
    async fn create(&self, pid: Pid, owner_uid: &str) -> Result<Arc<dyn Sandbox>> {
        let id = format!("sbx-{pid}");
        let root = self.base.join(format!("pid-{pid}"));
        debug!(%id, owner_uid, root = %root.display(), "creating local sandbox");
        Ok(Arc::new(LocalSandbox::create(id, root).await?))
    }
}

// ============================================================================
// StubSandbox - in-memory filesystem for tests
// ============================================================================

/// In-memory sandbox used by kernel tests; records every mutation.
#[derive(Default)]
pub struct StubSandbox {
    files: tokio::sync::Mutex<std::collections::BTreeMap<String, String>>,
    commands: tokio::sync::Mutex<Vec<String>>,
    workspace: PathBuf,
}

impl StubSandbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            workspace: PathBuf::from("/stub/workspace"),
            ..Default::default()
        })
    }

    /// Files written so far
    pub async fn files(&self) -> std::collections::BTreeMap<String, String> {
        self.files.lock().await.clone()
    }

    /// Commands executed so far
    pub async fn commands(&self) -> Vec<String> {
        self.commands.lock().await.clone()
    }
}

#[async_trait]
impl Sandbox for StubSandbox {
    fn id(&self) -> &str {
        "stub"
    }

    fn workspace(&self) -> &Path {
        &self.workspace
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<FileEntry>> {
        let prefix = if path.is_empty() || path == "." {
            String::new()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };
        Ok(self
            .files
            .lock()
            .await
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, content)| FileEntry {
                name: name.clone(),
                is_dir: false,
                size: content.len() as u64,
            })
            .collect())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        self.files
            .lock()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| KernelError::tool(format!("no such file: {path}")))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.files
            .lock()
            .await
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn make_dir(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn exec(
        &self,
        command: &str,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecResult> {
        if cancel.is_cancelled() {
            return Err(KernelError::Cancelled);
        }
        self.commands.lock().await.push(command.to_string());
        Ok(ExecResult {
            exit_code: 0,
            stdout: format!("ran: {command}"),
            stderr: String::new(),
        })
    }

    async fn browse(&self, url: &str) -> Result<String> {
        Ok(format!("[200 OK] stub page for {url}"))
    }

    async fn click(&self, selector: &str) -> Result<String> {
        Ok(format!("clicked {selector}"))
    }

    async fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

/// Factory handing out StubSandbox instances; keeps handles so tests can
/// inspect what a process did to its sandbox.
#[derive(Default)]
pub struct StubSandboxFactory {
    created: std::sync::Mutex<Vec<(Pid, Arc<StubSandbox>)>>,
}

impl StubSandboxFactory {
    /// The sandbox created for `pid`, if any
    pub fn sandbox_for(&self, pid: Pid) -> Option<Arc<StubSandbox>> {
        self.created
            .lock()
            .expect("factory poisoned")
            .iter()
            .find(|(p, _)| *p == pid)
            .map(|(_, sandbox)| sandbox.clone())
    }
}

#[async_trait]
impl SandboxFactory for StubSandboxFactory {
    async fn create(&self, pid: Pid, _owner_uid: &str) -> Result<Arc<dyn Sandbox>> {
        let sandbox = StubSandbox::new();
        self.created
            .lock()
            .expect("factory poisoned")
            .push((pid, sandbox.clone()));
        Ok(sandbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_sandbox_jails_paths() {
        let dir = std::env::temp_dir().join(format!("aether-test-{}", uuid::Uuid::now_v7()));
        let sandbox = LocalSandbox::create("t", dir.clone()).await.unwrap();

        assert!(sandbox.resolve("../outside").is_err());
        assert!(sandbox.resolve("/etc/passwd").is_err());
        assert!(sandbox.resolve("a/../../outside").is_err());
        // Traversal that stays inside is fine
        assert!(sandbox.resolve("a/../b.txt").is_ok());

        sandbox.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn local_sandbox_file_round_trip() {
        let dir = std::env::temp_dir().join(format!("aether-test-{}", uuid::Uuid::now_v7()));
        let sandbox = LocalSandbox::create("t", dir.clone()).await.unwrap();

        sandbox.write_file("notes/a.txt", "hello").await.unwrap();
        assert_eq!(sandbox.read_file("notes/a.txt").await.unwrap(), "hello");
        let entries = sandbox.list_dir("notes").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");

        sandbox.teardown().await.unwrap();
        // Teardown is idempotent
        sandbox.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn exec_honors_cancellation() {
        let dir = std::env::temp_dir().join(format!("aether-test-{}", uuid::Uuid::now_v7()));
        let sandbox = LocalSandbox::create("t", dir.clone()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = sandbox
            .exec("sleep 30", Duration::from_secs(120), &cancel)
            .await;
        assert!(matches!(result, Err(KernelError::Cancelled)));

        sandbox.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn stub_sandbox_records_mutations() {
        let sandbox = StubSandbox::new();
        sandbox.write_file("x", "1").await.unwrap();
        sandbox
            .exec("echo hi", Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sandbox.files().await.len(), 1);
        assert_eq!(sandbox.commands().await, vec!["echo hi".to_string()]);
    }
}
