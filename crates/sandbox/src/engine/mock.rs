//! In-memory container engine for tests.
//!
//! Containers hold an in-memory filesystem and understand a handful of shell
//! builtins (`cat`, `mkdir`, `rm`, `test`, `echo`, `printf`, `ls`, `pwd`,
//! `exit`, `sleep`, `sh <file>`), which is enough to drive the sandbox
//! components end to end without a Docker daemon. Failures can be injected
//! per operation.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    ContainerEngine, ContainerSpec, ContainerStatus, ContainerSummary, EngineError, EngineInfo,
    EngineResult, ExecOutput,
};
use crate::archive::{self, ArchiveEntry, Owner};
use crate::paths::{join_path, normalize_path};

/// Operation that should fail on the mock engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockFailure {
    Info,
    Build,
    Create,
    Start,
    /// Exec transport fails (engine unreachable mid-session).
    Exec,
    /// The next exec is killed by the OOM killer (exit 137).
    OomOnExec,
    Inject,
    Extract,
    Remove,
}

#[derive(Debug)]
struct MockContainer {
    id: String,
    name: String,
    spec: ContainerSpec,
    running: bool,
    oom_killed: bool,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

impl MockContainer {
    fn new(id: String, name: String, spec: ContainerSpec) -> Self {
        let mut dirs = BTreeSet::new();
        for d in ["/", "/tmp", "/proc", "/sys", "/root"] {
            dirs.insert(d.to_string());
        }
        let mut c = Self {
            id,
            name,
            spec,
            running: false,
            oom_killed: false,
            files: BTreeMap::new(),
            dirs,
        };
        let workdir = c.spec.working_dir.clone();
        if !workdir.is_empty() {
            c.mkdir_all(&workdir);
        }
        for mount in c.spec.mounts.clone() {
            c.mkdir_all(mount.target());
        }
        c
    }

    fn mkdir_all(&mut self, path: &str) {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }

    fn parent_of(path: &str) -> String {
        match path.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(i) => path[..i].to_string(),
        }
    }

    fn is_dir(&self, path: &str) -> bool {
        self.dirs.contains(path)
    }

    fn is_protected(path: &str) -> bool {
        ["/proc", "/sys", "/root"]
            .iter()
            .any(|p| path == *p || path.starts_with(&format!("{}/", p)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connector {
    Seq,
    AndThen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Op(Connector),
}

/// Split a shell command line into words, honouring single quotes, double
/// quotes and backslash escapes. `;` and `&&` become operators.
fn tokenize(script: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = script.chars().peekable();

    let flush = |word: &mut String, in_word: &mut bool, tokens: &mut Vec<Token>| {
        if *in_word {
            tokens.push(Token::Word(std::mem::take(word)));
            *in_word = false;
        }
    };

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_word = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    word.push(c);
                }
            }
            '"' => {
                in_word = true;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => {
                            if let Some(n) = chars.next() {
                                word.push(n);
                            }
                        }
                        _ => word.push(c),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(n) = chars.next() {
                    word.push(n);
                }
            }
            ';' | '\n' => {
                flush(&mut word, &mut in_word, &mut tokens);
                tokens.push(Token::Op(Connector::Seq));
            }
            '&' if chars.peek() == Some(&'&') => {
                chars.next();
                flush(&mut word, &mut in_word, &mut tokens);
                tokens.push(Token::Op(Connector::AndThen));
            }
            c if c.is_whitespace() => flush(&mut word, &mut in_word, &mut tokens),
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    flush(&mut word, &mut in_word, &mut tokens);
    tokens
}

/// Commands of a script with the connector that follows each.
fn split_commands(tokens: Vec<Token>) -> Vec<(Vec<String>, Connector)> {
    let mut out = Vec::new();
    let mut current = Vec::new();
    for token in tokens {
        match token {
            Token::Word(w) => current.push(w),
            Token::Op(op) => {
                if !current.is_empty() {
                    out.push((std::mem::take(&mut current), op));
                }
            }
        }
    }
    if !current.is_empty() {
        out.push((current, Connector::Seq));
    }
    out
}

fn fail(out: &mut ExecOutput, code: i64, msg: String) {
    out.stderr.extend_from_slice(msg.as_bytes());
    out.stderr.push(b'\n');
    out.exit_code = code;
}

fn operands(args: &[String]) -> Vec<&String> {
    args.iter().filter(|a| !a.starts_with('-')).collect()
}

fn run_script(c: &mut MockContainer, workdir: &str, script: &str, depth: usize) -> ExecOutput {
    let mut out = ExecOutput::default();
    let mut skip = false;
    for (argv, connector) in split_commands(tokenize(script)) {
        if !skip {
            let step = run_command(c, workdir, &argv, depth);
            out.stdout.extend(step.stdout);
            out.stderr.extend(step.stderr);
            out.exit_code = step.exit_code;
            if argv[0] == "exit" {
                break;
            }
        }
        skip = connector == Connector::AndThen && out.exit_code != 0;
    }
    out
}

fn run_command(c: &mut MockContainer, workdir: &str, argv: &[String], depth: usize) -> ExecOutput {
    let mut out = ExecOutput::default();
    let prog = argv[0].as_str();
    let args = &argv[1..];
    let resolve = |p: &str| normalize_path(&join_path(workdir, p));

    match prog {
        "true" | "sleep" => {}
        "false" => out.exit_code = 1,
        "exit" => {
            out.exit_code = args.first().and_then(|a| a.parse().ok()).unwrap_or(0);
        }
        "pwd" => out.stdout = format!("{}\n", workdir).into_bytes(),
        "echo" => {
            let newline = args.first().map(String::as_str) != Some("-n");
            let words: Vec<&str> = args
                .iter()
                .map(String::as_str)
                .filter(|a| *a != "-n")
                .collect();
            out.stdout = words.join(" ").into_bytes();
            if newline {
                out.stdout.push(b'\n');
            }
        }
        "printf" => {
            if let Some(fmt) = args.first() {
                out.stdout = fmt.replace("\\n", "\n").into_bytes();
            }
        }
        "cat" => {
            for arg in operands(args) {
                let path = resolve(arg);
                if let Some(content) = c.files.get(&path) {
                    out.stdout.extend_from_slice(content);
                } else if c.is_dir(&path) {
                    fail(&mut out, 1, format!("cat: {}: Is a directory", arg));
                } else {
                    fail(&mut out, 1, format!("cat: {}: No such file or directory", arg));
                }
            }
        }
        "ls" => {
            let dir = operands(args)
                .first()
                .map(|a| resolve(a.as_str()))
                .unwrap_or_else(|| workdir.to_string());
            if !c.is_dir(&dir) {
                fail(
                    &mut out,
                    2,
                    format!("ls: cannot access '{}': No such file or directory", dir),
                );
            } else {
                let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
                let mut names: BTreeSet<String> = BTreeSet::new();
                for p in c.files.keys().chain(c.dirs.iter()) {
                    if let Some(rest) = p.strip_prefix(&prefix) {
                        if !rest.is_empty() && !rest.contains('/') {
                            names.insert(rest.to_string());
                        }
                    }
                }
                for name in names {
                    out.stdout.extend_from_slice(name.as_bytes());
                    out.stdout.push(b'\n');
                }
            }
        }
        "mkdir" => {
            let parents = args.iter().any(|a| a == "-p");
            for arg in operands(args) {
                let path = resolve(arg);
                if MockContainer::is_protected(&path) {
                    fail(
                        &mut out,
                        1,
                        format!("mkdir: cannot create directory '{}': Permission denied", arg),
                    );
                } else if c.files.contains_key(&path) {
                    fail(
                        &mut out,
                        1,
                        format!("mkdir: cannot create directory '{}': File exists", arg),
                    );
                } else if parents {
                    c.mkdir_all(&path);
                } else if c.is_dir(&MockContainer::parent_of(&path)) {
                    c.dirs.insert(path);
                } else {
                    fail(
                        &mut out,
                        1,
                        format!("mkdir: cannot create directory '{}': No such file or directory", arg),
                    );
                }
            }
        }
        "rm" => {
            let force = args.iter().any(|a| a.starts_with('-') && a.contains('f'));
            let recursive = args.iter().any(|a| a.starts_with('-') && a.contains('r'));
            for arg in operands(args) {
                let path = resolve(arg);
                if c.files.remove(&path).is_some() {
                    continue;
                }
                if recursive && c.is_dir(&path) {
                    let prefix = format!("{}/", path);
                    c.files.retain(|p, _| !p.starts_with(&prefix));
                    c.dirs.retain(|d| d != &path && !d.starts_with(&prefix));
                } else if !force {
                    fail(
                        &mut out,
                        1,
                        format!("rm: cannot remove '{}': No such file or directory", arg),
                    );
                }
            }
        }
        "test" | "[" => {
            let ok = match (args.first().map(String::as_str), args.get(1)) {
                (Some("-f"), Some(p)) => c.files.contains_key(&resolve(p)),
                (Some("-d"), Some(p)) => c.is_dir(&resolve(p)),
                (Some("-e"), Some(p)) => {
                    let p = resolve(p);
                    c.files.contains_key(&p) || c.is_dir(&p)
                }
                _ => false,
            };
            out.exit_code = if ok { 0 } else { 1 };
        }
        "sh" | "bash" => {
            if depth > 8 {
                fail(&mut out, 2, format!("{}: recursion too deep", prog));
            } else if args.first().map(String::as_str) == Some("-c") {
                let script = args.get(1).cloned().unwrap_or_default();
                out = run_script(c, workdir, &script, depth + 1);
            } else if let Some(file) = args.first() {
                match c.files.get(&resolve(file)).cloned() {
                    Some(body) => {
                        out = run_script(c, workdir, &String::from_utf8_lossy(&body), depth + 1)
                    }
                    None => fail(
                        &mut out,
                        127,
                        format!("{}: 0: cannot open {}: No such file", prog, file),
                    ),
                }
            }
        }
        "uv" => {
            // `uv pip install --system -r <file>`
            let req = args
                .iter()
                .position(|a| a == "-r")
                .and_then(|i| args.get(i + 1));
            match req {
                Some(file) if c.files.contains_key(&resolve(file)) => {
                    out.stdout = format!("Installed packages from {}\n", file).into_bytes();
                }
                Some(file) => fail(&mut out, 2, format!("error: File not found: `{}`", file)),
                None => fail(&mut out, 2, "error: unsupported uv invocation".to_string()),
            }
        }
        other => fail(&mut out, 127, format!("sh: 1: {}: not found", other)),
    }
    out
}

/// In-memory mock engine.
pub struct MockEngine {
    info: Mutex<EngineInfo>,
    images: Mutex<HashSet<String>>,
    volumes: Mutex<HashSet<String>>,
    containers: Mutex<HashMap<String, MockContainer>>,
    failures: Mutex<HashSet<MockFailure>>,
    exec_log: Mutex<Vec<(Vec<String>, String)>>,
    build_count: AtomicUsize,
    volume_create_count: AtomicUsize,
    remove_count: AtomicUsize,
    next_id: AtomicUsize,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// A hardened daemon (rootless, `runsc` registered) with no images.
    pub fn new() -> Self {
        Self {
            info: Mutex::new(EngineInfo {
                security_options: vec![
                    "name=seccomp,profile=builtin".to_string(),
                    "name=rootless".to_string(),
                ],
                runtimes: vec![
                    "io.containerd.runc.v2".to_string(),
                    "runc".to_string(),
                    "runsc".to_string(),
                ],
                server_version: Some("mock".to_string()),
            }),
            images: Mutex::default(),
            volumes: Mutex::default(),
            containers: Mutex::default(),
            failures: Mutex::default(),
            exec_log: Mutex::default(),
            build_count: AtomicUsize::new(0),
            volume_create_count: AtomicUsize::new(0),
            remove_count: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Replace the daemon info.
    pub fn with_info(self, info: EngineInfo) -> Self {
        *self.info.lock().unwrap_or_else(|e| e.into_inner()) = info;
        self
    }

    /// Pretend `tag` is already present.
    pub fn with_image(self, tag: &str) -> Self {
        self.images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tag.to_string());
        self
    }

    /// Make an operation fail until [`MockEngine::recover`] is called.
    pub fn fail(&self, failure: MockFailure) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(failure);
    }

    pub fn recover(&self, failure: MockFailure) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&failure);
    }

    fn failing(&self, failure: MockFailure) -> bool {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&failure)
    }

    fn injected(&self, failure: MockFailure) -> EngineResult<()> {
        if self.failing(failure) {
            Err(EngineError::Api(format!("injected failure: {:?}", failure)))
        } else {
            Ok(())
        }
    }

    pub fn build_count(&self) -> usize {
        self.build_count.load(Ordering::SeqCst)
    }

    pub fn volume_create_count(&self) -> usize {
        self.volume_create_count.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.remove_count.load(Ordering::SeqCst)
    }

    pub fn has_image(&self, tag: &str) -> bool {
        self.images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(tag)
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.volumes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    /// Names of all existing containers.
    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Create-time spec of a container, by id or name.
    pub fn spec_of(&self, key: &str) -> Option<ContainerSpec> {
        self.with_container(key, |c| c.spec.clone()).ok()
    }

    /// File content inside a container, by id or name.
    pub fn file(&self, key: &str, path: &str) -> Option<Vec<u8>> {
        self.with_container(key, |c| c.files.get(path).cloned())
            .ok()
            .flatten()
    }

    /// Place a file directly into a container's filesystem.
    pub fn put_file(&self, key: &str, path: &str, content: &[u8]) {
        let _ = self.with_container(key, |c| {
            c.mkdir_all(&MockContainer::parent_of(path));
            c.files.insert(path.to_string(), content.to_vec());
        });
    }

    /// Every exec as `(argv, workdir)`.
    pub fn exec_log(&self) -> Vec<(Vec<String>, String)> {
        self.exec_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn with_container<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut MockContainer) -> T,
    ) -> EngineResult<T> {
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        let container = containers
            .values_mut()
            .find(|c| c.id == key || c.name == key)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", key)))?;
        Ok(f(container))
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    async fn info(&self) -> EngineResult<EngineInfo> {
        if self.failing(MockFailure::Info) {
            return Err(EngineError::Unavailable("mock daemon unreachable".into()));
        }
        Ok(self.info.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn image_exists(&self, tag: &str) -> EngineResult<bool> {
        Ok(self.has_image(tag))
    }

    async fn image_build(&self, context_dir: &Path, tag: &str) -> EngineResult<()> {
        self.build_count.fetch_add(1, Ordering::SeqCst);
        self.injected(MockFailure::Build)?;
        if !context_dir.join("Dockerfile").is_file() {
            return Err(EngineError::Api("Cannot locate specified Dockerfile".into()));
        }
        self.images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tag.to_string());
        Ok(())
    }

    async fn volume_ensure(&self, name: &str) -> EngineResult<()> {
        let mut volumes = self.volumes.lock().unwrap_or_else(|e| e.into_inner());
        if volumes.insert(name.to_string()) {
            self.volume_create_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn container_create(&self, name: &str, spec: &ContainerSpec) -> EngineResult<String> {
        self.injected(MockFailure::Create)?;
        if !self.has_image(&spec.image) {
            return Err(EngineError::NotFound(format!("No such image: {}", spec.image)));
        }
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        if containers.values().any(|c| c.name == name) {
            return Err(EngineError::Conflict(format!(
                "The container name \"/{}\" is already in use",
                name
            )));
        }
        let id = format!("{:064x}", self.next_id.fetch_add(1, Ordering::SeqCst));
        containers.insert(
            id.clone(),
            MockContainer::new(id.clone(), name.to_string(), spec.clone()),
        );
        Ok(id)
    }

    async fn container_start(&self, id: &str) -> EngineResult<()> {
        self.injected(MockFailure::Start)?;
        self.with_container(id, |c| {
            c.running = true;
            c.oom_killed = false;
        })
    }

    async fn container_exec(
        &self,
        id: &str,
        argv: &[String],
        workdir: &str,
        _user: Option<&str>,
    ) -> EngineResult<ExecOutput> {
        if self.failing(MockFailure::Exec) {
            return Err(EngineError::Unavailable("mock daemon connection reset".into()));
        }
        self.exec_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((argv.to_vec(), workdir.to_string()));

        let script = match argv {
            [sh, flag, script] if (sh == "sh" || sh == "bash") && flag == "-c" => script.clone(),
            _ => argv.join(" "),
        };

        let running = self.with_container(id, |c| c.running)?;
        if !running {
            return Err(EngineError::Conflict(format!("container {} is not running", id)));
        }

        if self.failing(MockFailure::OomOnExec) {
            self.recover(MockFailure::OomOnExec);
            self.with_container(id, |c| {
                c.running = false;
                c.oom_killed = true;
            })?;
            return Ok(ExecOutput {
                stdout: Vec::new(),
                stderr: b"Killed\n".to_vec(),
                exit_code: 137,
            });
        }

        // A bare sleep really waits so timeouts can be exercised.
        if let [Token::Word(cmd), Token::Word(secs)] = tokenize(&script).as_slice() {
            if cmd == "sleep" {
                let secs: f64 = secs.parse::<f64>().unwrap_or(0.0).max(0.0);
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                return Ok(ExecOutput::default());
            }
        }

        let workdir = if workdir.is_empty() { "/" } else { workdir };
        self.with_container(id, |c| {
            if !c.is_dir(workdir) {
                return ExecOutput {
                    stdout: Vec::new(),
                    stderr: format!(
                        "OCI runtime exec failed: chdir to cwd (\"{}\") set in config.json failed: no such file or directory\n",
                        workdir
                    )
                    .into_bytes(),
                    exit_code: 126,
                };
            }
            run_script(c, workdir, &script, 0)
        })
    }

    async fn container_inspect(&self, id: &str) -> EngineResult<Option<ContainerStatus>> {
        match self.with_container(id, |c| ContainerStatus {
            status: if c.running { "running" } else { "exited" }.to_string(),
            running: c.running,
            oom_killed: c.oom_killed,
            exit_code: if c.oom_killed { Some(137) } else { None },
        }) {
            Ok(status) => Ok(Some(status)),
            Err(EngineError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn container_stop(&self, id: &str) -> EngineResult<()> {
        self.with_container(id, |c| c.running = false)
    }

    async fn container_remove(&self, id: &str) -> EngineResult<()> {
        self.remove_count.fetch_add(1, Ordering::SeqCst);
        self.injected(MockFailure::Remove)?;
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        containers.retain(|_, c| c.id != id && c.name != id);
        Ok(())
    }

    async fn archive_inject(&self, id: &str, target_dir: &str, archive: Bytes) -> EngineResult<()> {
        self.injected(MockFailure::Inject)?;
        let entries = archive::read_entries(&archive)?;
        let target = normalize_path(target_dir);
        self.with_container(id, |c| {
            if !c.is_dir(&target) {
                return Err(EngineError::NotFound(format!(
                    "Could not find the file {} in container {}",
                    target, id
                )));
            }
            // Entries become visible together, once the whole archive decoded.
            for entry in entries {
                match entry {
                    ArchiveEntry::Dir { path } => {
                        c.mkdir_all(&join_path(&target, &path.to_string_lossy()));
                    }
                    ArchiveEntry::File { path, content } => {
                        let dest = normalize_path(&join_path(&target, &path.to_string_lossy()));
                        c.mkdir_all(&MockContainer::parent_of(&dest));
                        c.files.insert(dest, content);
                    }
                    ArchiveEntry::Link { .. } => {}
                }
            }
            Ok(())
        })?
    }

    async fn archive_extract(&self, id: &str, source_path: &str) -> EngineResult<Bytes> {
        self.injected(MockFailure::Extract)?;
        let source = normalize_path(source_path);
        let staged = tempfile::tempdir()?;

        let base = source
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or("root")
            .to_string();

        let found = self.with_container(id, |c| {
            if let Some(content) = c.files.get(&source) {
                return Some(vec![(base.clone(), Some(content.clone()))]);
            }
            if !c.is_dir(&source) {
                return None;
            }
            let prefix = if source == "/" { "/".to_string() } else { format!("{}/", source) };
            let mut items = vec![(base.clone(), None)];
            for d in c.dirs.iter().filter(|d| d.starts_with(&prefix)) {
                items.push((format!("{}/{}", base, &d[prefix.len()..]), None));
            }
            for (p, content) in c.files.iter().filter(|(p, _)| p.starts_with(&prefix)) {
                items.push((format!("{}/{}", base, &p[prefix.len()..]), Some(content.clone())));
            }
            Some(items)
        })?;

        let items = found.ok_or_else(|| {
            EngineError::NotFound(format!("Could not find the file {} in container {}", source, id))
        })?;

        for (rel, content) in items {
            let dest = staged.path().join(&rel);
            match content {
                Some(bytes) => {
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(dest, bytes)?;
                }
                None => std::fs::create_dir_all(dest)?,
            }
        }

        Ok(Bytes::from(archive::pack_dir(staged.path(), Owner { uid: 0, gid: 0 })?))
    }

    async fn list_containers(&self, label: &str) -> EngineResult<Vec<ContainerSummary>> {
        let (key, value) = label.split_once('=').unwrap_or((label, ""));
        let containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<ContainerSummary> = containers
            .values()
            .filter(|c| {
                c.spec
                    .labels
                    .get(key)
                    .is_some_and(|v| value.is_empty() || v == value)
            })
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                state: if c.running { "running" } else { "created" }.to_string(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}
