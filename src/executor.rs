//! Command and file operations against a session's sandbox.
//!
//! Callers address files by paths under the configured workspace root
//! (`/workspace` by default). Each path is validated lexically before any
//! sandbox call, rebased onto the sandbox's actual mount point, and checked
//! again inside the sandbox after symlink resolution.

use std::collections::HashMap;
use std::future::Future;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ProviderError, Result, SandboxError};
use crate::handle::SandboxHandle;
use crate::manager::SandboxManager;
use crate::paths;
use crate::provider::{ExecOutput, ExecRequest};
use crate::safety;

/// Command output beyond this many bytes per stream is cut off.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;
/// Base64 bytes per write call; stays below the kernel's per-argument limit.
pub const WRITE_CHUNK_BYTES: usize = 96 * 1024;

pub const DEFAULT_MAX_DEPTH: usize = 5;
pub const DEFAULT_MAX_FILES: usize = 1000;
pub const MAX_DEPTH_LIMIT: usize = 10;
pub const MAX_FILES_LIMIT: usize = 5000;

const TRUNCATION_MARKER: &str = "\n[output truncated]";
const PRUNED_DIRS: &[&str] = &["node_modules", ".git", "__pycache__"];

/// Exit code the file scripts use for a missing file.
const EXIT_MISSING: i32 = 44;
/// Exit code the file scripts use when the resolved path leaves the root.
const EXIT_ESCAPE: i32 = 45;

/// Result of [`SandboxExecutor::run_command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Set when the command was refused without running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked: Option<String>,
    pub truncated: bool,
}

impl CommandOutput {
    fn blocked(reason: String) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: reason.clone(),
            exit_code: None,
            blocked: Some(reason),
            truncated: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
}

/// One entry of a workspace listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileNode>,
}

/// Bounds on a listing. Values are clamped to the hard ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListOptions {
    pub max_depth: usize,
    pub max_files: usize,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

impl ListOptions {
    pub fn new(max_depth: Option<usize>, max_files: Option<usize>) -> Self {
        Self {
            max_depth: max_depth.unwrap_or(DEFAULT_MAX_DEPTH).clamp(1, MAX_DEPTH_LIMIT),
            max_files: max_files.unwrap_or(DEFAULT_MAX_FILES).clamp(1, MAX_FILES_LIMIT),
        }
    }
}

/// Outcome of one attempt against a specific handle.
enum Attempt {
    /// The sandbox vanished; the caller may retry on a fresh handle.
    Gone,
    Failed(SandboxError),
}

impl From<SandboxError> for Attempt {
    fn from(err: SandboxError) -> Self {
        Self::Failed(err)
    }
}

impl Attempt {
    fn from_provider(err: ProviderError, map: impl FnOnce(ProviderError) -> SandboxError) -> Self {
        if err.is_gone() {
            Self::Gone
        } else {
            Self::Failed(map(err))
        }
    }

    fn into_error(self) -> SandboxError {
        match self {
            Self::Gone => SandboxError::Exec("sandbox disappeared twice in a row".to_string()),
            Self::Failed(err) => err,
        }
    }
}

fn quote(value: &str) -> String {
    shell_words::quote(value).into_owned()
}

/// Cut `text` to [`MAX_OUTPUT_BYTES`] on a char boundary, appending a marker.
fn truncate_output(text: String) -> (String, bool) {
    if text.len() <= MAX_OUTPUT_BYTES {
        return (text, false);
    }
    let mut cut = MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = text[..cut].to_string();
    truncated.push_str(TRUNCATION_MARKER);
    (truncated, true)
}

/// Shell prelude that canonicalizes `$root` and `$target` and exits with
/// [`EXIT_ESCAPE`] when the target resolves outside the root.
fn guard_prelude(root: &str, target: &str) -> String {
    format!(
        "root=$(realpath -m -- {root}) || exit 1\n\
         real=$(realpath -m -- {target}) || exit 1\n\
         case \"$real\" in \"$root\"|\"$root\"/*) ;; *) exit {escape} ;; esac\n",
        root = quote(root),
        target = quote(target),
        escape = EXIT_ESCAPE,
    )
}

#[derive(Clone)]
pub struct SandboxExecutor {
    manager: SandboxManager,
}

impl SandboxExecutor {
    pub fn new(manager: SandboxManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &SandboxManager {
        &self.manager
    }

    fn logical_root(&self) -> &str {
        &self.manager.config().workspace_root
    }

    /// Validate a caller path against the logical workspace root.
    fn resolve(&self, path: &str) -> Option<String> {
        paths::resolve(self.logical_root(), path)
    }

    /// Map a validated logical path onto the sandbox's mount point.
    fn to_sandbox(&self, handle: &SandboxHandle, logical: &str) -> String {
        let root = handle.workspace_root();
        match logical.strip_prefix(self.logical_root()) {
            Some(rest) if root != self.logical_root() => format!("{}{}", root, rest),
            _ => logical.to_string(),
        }
    }

    /// Inverse of [`Self::to_sandbox`] for paths reported by the sandbox.
    fn to_logical(&self, handle: &SandboxHandle, sandbox_path: &str) -> String {
        let root = handle.workspace_root();
        match sandbox_path.strip_prefix(root) {
            Some(rest) if root != self.logical_root() => format!("{}{}", self.logical_root(), rest),
            _ => sandbox_path.to_string(),
        }
    }

    /// Run `op` on the session's handle. If the sandbox turns out to be gone,
    /// the handle is evicted and `op` retried once on a fresh one.
    async fn with_handle<T, F, Fut>(&self, session_id: &str, op: F) -> Result<T>
    where
        F: Fn(SandboxHandle) -> Fut,
        Fut: Future<Output = std::result::Result<T, Attempt>>,
    {
        let handle = self.manager.get_or_create(session_id, None).await?;
        match op(handle.clone()).await {
            Ok(value) => Ok(value),
            Err(Attempt::Failed(err)) => Err(err),
            Err(Attempt::Gone) => {
                warn!(session_id, sandbox_id = handle.id(), "cached sandbox is gone, retrying on a fresh one");
                self.manager.evict(&handle).await;
                let handle = self.manager.get_or_create(session_id, None).await?;
                op(handle).await.map_err(Attempt::into_error)
            }
        }
    }

    /// Run a shell command in the session's workspace.
    ///
    /// Blocked commands and working directories outside the workspace are
    /// reported as an unsuccessful output without touching the sandbox.
    pub async fn run_command(
        &self,
        session_id: &str,
        command: &str,
        workdir: Option<&str>,
    ) -> Result<CommandOutput> {
        if let Err(blocked) = safety::check_command(command) {
            warn!(session_id, pattern = blocked.pattern, "blocked command");
            return Ok(CommandOutput::blocked(blocked.to_string()));
        }
        let workdir = workdir.unwrap_or(self.logical_root());
        let Some(workdir) = self.resolve(workdir) else {
            debug!(session_id, "working directory outside workspace");
            return Ok(CommandOutput::blocked("working directory is outside the workspace".to_string()));
        };

        self.with_handle(session_id, |handle| self.run_once(handle, command, &workdir))
            .await
    }

    async fn run_once(
        &self,
        handle: SandboxHandle,
        command: &str,
        workdir: &str,
    ) -> std::result::Result<CommandOutput, Attempt> {
        let dir = quote(&self.to_sandbox(&handle, workdir));
        let script = format!("mkdir -p {dir} && cd {dir} || exit 1\n{command}");
        let timeout = self.manager.config().timeouts.command;
        let output = handle
            .sandbox
            .exec(&ExecRequest::shell(script, timeout))
            .await
            .map_err(|err| {
                Attempt::from_provider(err, |err| match err {
                    ProviderError::Timeout => {
                        SandboxError::Exec(format!("command timed out after {}s", timeout.as_secs()))
                    }
                    other => SandboxError::Exec(other.to_string()),
                })
            })?;

        let ExecOutput {
            stdout,
            stderr,
            exit_code,
        } = output;
        let success = !matches!(exit_code, Some(code) if code != 0);
        let (stdout, stdout_cut) = truncate_output(stdout);
        let (stderr, stderr_cut) = truncate_output(stderr);
        debug!(sandbox_id = handle.id(), ?exit_code, success, "command finished");
        Ok(CommandOutput {
            success,
            stdout,
            stderr,
            exit_code,
            blocked: None,
            truncated: stdout_cut || stderr_cut,
        })
    }

    /// Write `content` to `path`, creating parent directories. Succeeds only
    /// once the file on disk has the expected size.
    pub async fn write_file(&self, session_id: &str, path: &str, content: &[u8]) -> Result<()> {
        let Some(target) = self.resolve(path) else {
            return Err(SandboxError::write(path, "path is outside the workspace"));
        };
        let encoded = STANDARD.encode(content);
        self.with_handle(session_id, |handle| {
            self.write_once(handle, &target, &encoded, content.len() as u64)
        })
        .await?;
        info!(session_id, path = %target, bytes = content.len(), "file written");
        Ok(())
    }

    async fn write_once(
        &self,
        handle: SandboxHandle,
        target: &str,
        encoded: &str,
        expected: u64,
    ) -> std::result::Result<(), Attempt> {
        let timeout = self.manager.config().timeouts.command;
        let fail = |reason: String| Attempt::Failed(SandboxError::write(target, reason));
        let scratch = format!("/tmp/.sessionbox-upload-{}.b64", uuid::Uuid::new_v4().simple());
        let scratch_q = quote(&scratch);

        // Base64 output is ASCII, so byte chunks are valid str slices.
        let mut offset = 0;
        let mut first = true;
        while first || offset < encoded.len() {
            let end = (offset + WRITE_CHUNK_BYTES).min(encoded.len());
            let redirect = if first { ">" } else { ">>" };
            let script = format!("printf '%s' {} {} {}", quote(&encoded[offset..end]), redirect, scratch_q);
            let output = handle
                .sandbox
                .exec(&ExecRequest::shell(script, timeout))
                .await
                .map_err(|err| Attempt::from_provider(err, |err| SandboxError::write(target, err.to_string())))?;
            if !output.succeeded() {
                return Err(fail(format!("staging upload failed: {}", output.stderr.trim())));
            }
            offset = end;
            first = false;
        }

        let sandbox_path = self.to_sandbox(&handle, target);
        let script = format!(
            "{guard}mkdir -p -- \"$(dirname -- \"$real\")\" || exit 1\n\
             base64 -d {scratch} > \"$real\"; status=$?\n\
             rm -f {scratch}\n\
             [ \"$status\" -eq 0 ] || exit \"$status\"\n\
             stat -c %s -- \"$real\"",
            guard = guard_prelude(handle.workspace_root(), &sandbox_path),
            scratch = scratch_q,
        );
        let output = handle
            .sandbox
            .exec(&ExecRequest::shell(script, timeout))
            .await
            .map_err(|err| Attempt::from_provider(err, |err| SandboxError::write(target, err.to_string())))?;
        match output.exit_code {
            Some(EXIT_ESCAPE) => {
                let _ = handle
                    .sandbox
                    .exec(&ExecRequest::shell(format!("rm -f {}", scratch_q), timeout))
                    .await;
                return Err(fail("path is outside the workspace".to_string()));
            }
            Some(code) if code != 0 => {
                return Err(fail(format!("decode failed with exit code {}: {}", code, output.stderr.trim())));
            }
            _ => {}
        }

        let written: u64 = output
            .stdout
            .trim()
            .parse()
            .map_err(|_| fail(format!("could not verify size: {:?}", output.stdout.trim())))?;
        if written != expected {
            return Err(fail(format!("size mismatch: wrote {} bytes, expected {}", written, expected)));
        }
        Ok(())
    }

    /// Read a file from the workspace. Missing files, and paths that leave
    /// the workspace, are reported as [`SandboxError::NotFound`].
    pub async fn read_file(&self, session_id: &str, path: &str) -> Result<Vec<u8>> {
        let Some(target) = self.resolve(path) else {
            return Err(SandboxError::NotFound(path.to_string()));
        };
        self.with_handle(session_id, |handle| self.read_once(handle, &target))
            .await
    }

    async fn read_once(&self, handle: SandboxHandle, target: &str) -> std::result::Result<Vec<u8>, Attempt> {
        let timeout = self.manager.config().timeouts.read;
        let sandbox_path = self.to_sandbox(&handle, target);
        let script = format!(
            "{guard}[ -f \"$real\" ] || exit {missing}\nbase64 < \"$real\"",
            guard = guard_prelude(handle.workspace_root(), &sandbox_path),
            missing = EXIT_MISSING,
        );
        let request = ExecRequest::shell(script, timeout);
        let output = match tokio::time::timeout(timeout, handle.sandbox.exec(&request)).await {
            Err(_) | Ok(Err(ProviderError::Timeout)) => {
                warn!(sandbox_id = handle.id(), path = %target, "file read timed out");
                return Err(SandboxError::ReadTimeout(target.to_string()).into());
            }
            Ok(Err(err)) => {
                return Err(Attempt::from_provider(err, |err| SandboxError::Exec(err.to_string())));
            }
            Ok(Ok(output)) => output,
        };

        match output.exit_code {
            Some(EXIT_MISSING) | Some(EXIT_ESCAPE) => {
                return Err(SandboxError::NotFound(target.to_string()).into());
            }
            Some(code) if code != 0 => {
                return Err(SandboxError::Exec(format!("read failed with exit code {}: {}", code, output.stderr.trim())).into());
            }
            _ => {}
        }
        let compact: String = output.stdout.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        STANDARD
            .decode(compact)
            .map_err(|err| SandboxError::Exec(format!("undecodable file content: {}", err)).into())
    }

    /// List the workspace below `root` as a tree.
    ///
    /// Paths that leave the workspace yield an empty listing. Symlinks whose
    /// targets resolve outside the workspace are left out.
    pub async fn list_files(
        &self,
        session_id: &str,
        root: Option<&str>,
        options: ListOptions,
    ) -> Result<Vec<FileNode>> {
        let root = root.unwrap_or(self.logical_root());
        let Some(dir) = self.resolve(root) else {
            debug!(session_id, "listing root outside workspace");
            return Ok(Vec::new());
        };
        let options = ListOptions::new(Some(options.max_depth), Some(options.max_files));
        self.with_handle(session_id, |handle| self.list_once(handle, &dir, options))
            .await
    }

    async fn list_once(
        &self,
        handle: SandboxHandle,
        dir: &str,
        options: ListOptions,
    ) -> std::result::Result<Vec<FileNode>, Attempt> {
        let sandbox_dir = self.to_sandbox(&handle, dir);
        let prune = PRUNED_DIRS
            .iter()
            .map(|name| format!("-name {}", quote(name)))
            .collect::<Vec<_>>()
            .join(" -o ");
        // One bulk `find`, shallowest entries first, capped before symlinks
        // are resolved.
        let script = format!(
            "{guard}[ -d \"$real\" ] || exit 0\n\
             printf 'W\\t%s\\nR\\t%s\\n' \"$root\" \"$real\"\n\
             tab=$(printf '\\t')\n\
             find \"$real\" -mindepth 1 -maxdepth {depth} \\( {prune} \\) -prune -o -printf '%d\\t%y\\t%s\\t%p\\n' 2>/dev/null \\\n\
             | sort -n -k1,1 | head -n {limit} \\\n\
             | while IFS=\"$tab\" read -r depth kind size path; do\n\
                 printf 'E\\t%s\\t%s\\t%s\\n' \"$kind\" \"$size\" \"$path\"\n\
                 if [ \"$kind\" = l ]; then printf 'L\\t%s\\t%s\\n' \"$path\" \"$(realpath -m -- \"$path\")\"; fi\n\
               done\n",
            guard = guard_prelude(handle.workspace_root(), &sandbox_dir),
            depth = options.max_depth,
            limit = options.max_files * 2,
        );
        let timeout = self.manager.config().timeouts.command;
        let output = handle
            .sandbox
            .exec(&ExecRequest::shell(script, timeout))
            .await
            .map_err(|err| Attempt::from_provider(err, |err| SandboxError::Exec(err.to_string())))?;
        match output.exit_code {
            Some(EXIT_ESCAPE) => {
                debug!(sandbox_id = handle.id(), "listing root resolves outside workspace");
                return Ok(Vec::new());
            }
            Some(code) if code != 0 => {
                return Err(SandboxError::Exec(format!("listing failed with exit code {}: {}", code, output.stderr.trim())).into());
            }
            _ => {}
        }

        let listing = parse_listing(&output.stdout);
        let Some(real_root) = listing.real_root.as_deref() else {
            return Ok(Vec::new());
        };
        let workspace = listing.real_workspace.as_deref().unwrap_or(real_root);
        let mut entries: Vec<Entry> = listing
            .entries
            .into_iter()
            .filter(|entry| paths::is_within(real_root, &entry.path) && entry.path != real_root)
            .filter(|entry| match entry.kind {
                NodeKind::Symlink => listing
                    .links
                    .get(&entry.path)
                    .is_some_and(|target| paths::is_within(workspace, target)),
                _ => true,
            })
            .collect();

        // Breadth first, so the node limit drops the deepest entries.
        entries.sort_by(|a, b| {
            depth_below(real_root, &a.path)
                .cmp(&depth_below(real_root, &b.path))
                .then_with(|| a.path.cmp(&b.path))
        });
        entries.truncate(options.max_files);

        let mut by_parent: HashMap<String, Vec<Entry>> = HashMap::new();
        for entry in entries {
            by_parent
                .entry(paths::parent(&entry.path).to_string())
                .or_default()
                .push(entry);
        }
        // `real_root` is the canonical form of `sandbox_dir`.
        let display_root = |path: &str| -> String {
            let rest = path.strip_prefix(real_root).unwrap_or(path);
            self.to_logical(&handle, &format!("{}{}", sandbox_dir, rest))
        };
        Ok(build_tree(real_root, &mut by_parent, &display_root))
    }

    /// Terminate the session's sandbox. The volume is kept.
    pub async fn terminate(&self, session_id: &str) -> bool {
        self.manager.terminate(session_id).await
    }
}

#[derive(Debug)]
struct Entry {
    path: String,
    kind: NodeKind,
    size: u64,
}

#[derive(Debug, Default)]
struct Listing {
    real_workspace: Option<String>,
    real_root: Option<String>,
    entries: Vec<Entry>,
    links: HashMap<String, String>,
}

/// Parse the tagged, tab-separated output of the listing script. Lines that
/// do not parse (for example names containing tabs) are skipped.
fn parse_listing(stdout: &str) -> Listing {
    let mut listing = Listing::default();
    for line in stdout.lines() {
        let mut fields = line.split('\t');
        match fields.next() {
            Some("W") => listing.real_workspace = fields.next().map(str::to_string),
            Some("R") => listing.real_root = fields.next().map(str::to_string),
            Some("E") => {
                let (Some(kind), Some(size), Some(path), None) =
                    (fields.next(), fields.next(), fields.next(), fields.next())
                else {
                    continue;
                };
                let kind = match kind {
                    "d" => NodeKind::Directory,
                    "l" => NodeKind::Symlink,
                    "f" => NodeKind::File,
                    _ => continue,
                };
                if paths::has_control_chars(path) {
                    continue;
                }
                let size = match kind {
                    NodeKind::Directory => 0,
                    _ => size.parse().unwrap_or(0),
                };
                listing.entries.push(Entry {
                    path: path.to_string(),
                    kind,
                    size,
                });
            }
            Some("L") => {
                if let (Some(path), Some(target), None) = (fields.next(), fields.next(), fields.next()) {
                    listing.links.insert(path.to_string(), target.to_string());
                }
            }
            _ => {}
        }
    }
    listing
}

fn depth_below(root: &str, path: &str) -> usize {
    path.strip_prefix(root)
        .map(|rest| rest.split('/').filter(|s| !s.is_empty()).count())
        .unwrap_or(usize::MAX)
}

fn build_tree(
    parent: &str,
    by_parent: &mut HashMap<String, Vec<Entry>>,
    display: &dyn Fn(&str) -> String,
) -> Vec<FileNode> {
    let Some(mut children) = by_parent.remove(parent) else {
        return Vec::new();
    };
    children.sort_by(|a, b| {
        let a_dir = a.kind == NodeKind::Directory;
        let b_dir = b.kind == NodeKind::Directory;
        b_dir
            .cmp(&a_dir)
            .then_with(|| paths::file_name(&a.path).cmp(paths::file_name(&b.path)))
    });
    children
        .into_iter()
        .map(|entry| FileNode {
            name: paths::file_name(&entry.path).to_string(),
            path: display(&entry.path),
            children: if entry.kind == NodeKind::Directory {
                build_tree(&entry.path, by_parent, display)
            } else {
                Vec::new()
            },
            kind: entry.kind,
            size: entry.size,
        })
        .collect()
}
