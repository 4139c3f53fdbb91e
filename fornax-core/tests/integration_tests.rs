//! End-to-end tests for the worker core.
//!
//! Drives the handler lifecycle and the import cache against in-process
//! doubles: a recording container runtime, a sandbox factory backed by temp
//! directories, and fake fork servers listening on real Unix sockets with
//! real readiness FIFOs.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tempfile::TempDir;

use fornax_core::cache::{CachePressure, ForkRequest, ForkResponse};
use fornax_core::{
    CacheError, CacheFactory, CacheManager, Config, ContainerRuntime, ContainerStatus, Evictor,
    HandlerLru, HandlerName, HandlerSet, HandlerState, PackageName, PackageSizes, RuntimeError,
    Sandbox, SandboxError, Worker,
};

// ---------------------------------------------------------------------------
// Container runtime double
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockRuntime {
    image_exists: AtomicBool,
    container_exists: AtomicBool,
    running: AtomicBool,
    paused: AtomicBool,
    pull_delay_ms: u64,
    pulls: AtomicU32,
    creates: AtomicU32,
    restarts: AtomicU32,
    pauses: AtomicU32,
    unpauses: AtomicU32,
    kills: AtomicU32,
}

impl ContainerRuntime for MockRuntime {
    fn image_exists(&self, _name: &str) -> Result<bool, RuntimeError> {
        Ok(self.image_exists.load(Ordering::SeqCst))
    }

    fn pull(&self, _name: &str) -> Result<(), RuntimeError> {
        if self.pull_delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.pull_delay_ms));
        }
        self.pulls.fetch_add(1, Ordering::SeqCst);
        self.image_exists.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn container_exists(&self, _name: &str) -> Result<bool, RuntimeError> {
        Ok(self.container_exists.load(Ordering::SeqCst))
    }

    fn create(&self, _name: &str, _argv: &[String]) -> Result<String, RuntimeError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.container_exists.store(true, Ordering::SeqCst);
        Ok("cid-1".to_string())
    }

    fn inspect(&self, _name: &str) -> Result<ContainerStatus, RuntimeError> {
        Ok(ContainerStatus {
            running: self.running.load(Ordering::SeqCst),
            paused: self.paused.load(Ordering::SeqCst),
        })
    }

    fn restart(&self, _name: &str) -> Result<(), RuntimeError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self, _name: &str) -> Result<(), RuntimeError> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn unpause(&self, _name: &str) -> Result<(), RuntimeError> {
        self.unpauses.fetch_add(1, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn kill(&self, _name: &str) -> Result<(), RuntimeError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn lambda_port(&self, _name: &str) -> Result<String, RuntimeError> {
        Ok("8080".to_string())
    }
}

// ---------------------------------------------------------------------------
// Sandbox + factory doubles
// ---------------------------------------------------------------------------

struct MockSandbox {
    dir: PathBuf,
    ns_pid: String,
    killed: Arc<AtomicBool>,
    entered: Arc<Mutex<Vec<String>>>,
}

impl Sandbox for MockSandbox {
    fn ns_pid(&self) -> String {
        self.ns_pid.clone()
    }

    fn root_dir(&self) -> &Path {
        &self.dir
    }

    fn host_dir(&self) -> &Path {
        &self.dir
    }

    fn memory_cgroup_path(&self) -> PathBuf {
        self.dir.join("memory.usage_in_bytes")
    }

    fn cgroup_enter(&self, pid: &str) -> Result<(), SandboxError> {
        self.entered.lock().unwrap().push(pid.to_string());
        Ok(())
    }

    fn kill(&self) -> Result<(), SandboxError> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// An invocation-sandbox double; no fork server of its own.
fn make_target(dir: &TempDir, ns_pid: &str) -> MockSandbox {
    MockSandbox {
        dir: dir.path().to_path_buf(),
        ns_pid: ns_pid.to_string(),
        killed: Arc::new(AtomicBool::new(false)),
        entered: Arc::new(Mutex::new(Vec::new())),
    }
}

/// Minimal fork-server protocol peer: answers each request on the socket
/// with a fresh pid.
fn spawn_fork_server(
    sock_path: PathBuf,
    pid_counter: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<ForkRequest>>>,
) {
    let listener = UnixListener::bind(&sock_path).unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let mut line = String::new();
            if BufReader::new(&stream).read_line(&mut line).is_err() {
                continue;
            }
            let Ok(request) = serde_json::from_str::<ForkRequest>(line.trim_end()) else {
                continue;
            };
            requests.lock().unwrap().push(request);

            let pid = pid_counter.fetch_add(1, Ordering::SeqCst);
            let response = serde_json::to_string(&ForkResponse {
                pid: pid.to_string(),
            })
            .unwrap();
            let mut stream = &stream;
            let _ = writeln!(stream, "{response}");
        }
    });
}

struct SandboxRecord {
    killed: Arc<AtomicBool>,
}

struct MockFactory {
    root: TempDir,
    /// Sandboxes with index >= ready_limit never signal readiness.
    ready_limit: usize,
    counter: AtomicUsize,
    pid_counter: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<ForkRequest>>>,
    sandboxes: Mutex<Vec<SandboxRecord>>,
    cleaned: AtomicBool,
}

impl MockFactory {
    fn new(ready_limit: usize) -> Self {
        Self {
            root: TempDir::new().unwrap(),
            ready_limit,
            counter: AtomicUsize::new(0),
            pid_counter: Arc::new(AtomicUsize::new(7000)),
            requests: Arc::new(Mutex::new(Vec::new())),
            sandboxes: Mutex::new(Vec::new()),
            cleaned: AtomicBool::new(false),
        }
    }

    fn sandbox_killed(&self, index: usize) -> bool {
        self.sandboxes.lock().unwrap()[index]
            .killed
            .load(Ordering::SeqCst)
    }

    fn sandbox_count(&self) -> usize {
        self.sandboxes.lock().unwrap().len()
    }
}

/// Lets a test keep a handle on the factory after the manager takes
/// ownership of it.
struct SharedFactory(Arc<MockFactory>);

impl CacheFactory for SharedFactory {
    fn create(&self, argv: &[String]) -> Result<Box<dyn Sandbox>, SandboxError> {
        self.0.create(argv)
    }

    fn cleanup(&self) {
        self.0.cleanup();
    }
}

impl CacheFactory for MockFactory {
    fn create(&self, _argv: &[String]) -> Result<Box<dyn Sandbox>, SandboxError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let dir = self.root.path().join(format!("sb-{id}"));
        std::fs::create_dir_all(&dir).map_err(|e| SandboxError::Op {
            op: "create",
            reason: e.to_string(),
        })?;

        let pipe_path = dir.join("pipe");
        mkfifo(&pipe_path, Mode::from_bits_truncate(0o600)).map_err(|e| SandboxError::Op {
            op: "create",
            reason: e.to_string(),
        })?;

        spawn_fork_server(
            dir.join("fs.sock"),
            Arc::clone(&self.pid_counter),
            Arc::clone(&self.requests),
        );

        if id < self.ready_limit {
            // stand in for the sandbox's interpreter announcing itself
            let pipe_path = pipe_path.clone();
            thread::spawn(move || {
                if let Ok(mut pipe) = OpenOptions::new().read(true).write(true).open(&pipe_path) {
                    let _ = pipe.write_all(b"ready");
                    // keep the write end alive while the manager reads
                    thread::sleep(Duration::from_secs(30));
                }
            });
        }

        let killed = Arc::new(AtomicBool::new(false));
        self.sandboxes.lock().unwrap().push(SandboxRecord {
            killed: Arc::clone(&killed),
        });

        Ok(Box::new(MockSandbox {
            dir,
            ns_pid: format!("{}", 5000 + id),
            killed,
            entered: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    fn cleanup(&self) {
        self.cleaned.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn name(s: &str) -> HandlerName {
    HandlerName::new(s).unwrap()
}

fn pkg(s: &str) -> PackageName {
    PackageName::new(s).unwrap()
}

fn load_catalog(dir: &TempDir, content: &str) -> PackageSizes {
    let path = dir.path().join("package_sizes.txt");
    std::fs::write(&path, content).unwrap();
    PackageSizes::load(&path).unwrap()
}

fn make_handler_set(runtime: Arc<MockRuntime>) -> (HandlerSet, Arc<HandlerLru>) {
    let lru = Arc::new(HandlerLru::new(0));
    let set = HandlerSet::new(runtime, Arc::clone(&lru));
    (set, lru)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_cold_handler_with_empty_package_set() {
    let runtime = Arc::new(MockRuntime::default());
    let (handlers, lru) = make_handler_set(Arc::clone(&runtime));

    let factory = MockFactory::new(usize::MAX);
    let dir = TempDir::new().unwrap();
    let (cache, _cgroup) =
        CacheManager::new(load_catalog(&dir, ""), Box::new(factory)).unwrap();

    // first run_start reconciles Uninitialized → Stopped → Running
    let handler = handlers.get(&name("echo"));
    let port = handler.run_start().unwrap();
    assert!(!port.is_empty());
    assert_eq!(handler.state(), HandlerState::Running);

    // empty package set is served by the root
    let target_dir = TempDir::new().unwrap();
    let target = make_target(&target_dir, "4242");
    let (node, hit) = cache
        .provision(&target, Path::new("/handlers/echo"), &[])
        .unwrap();
    assert!(hit);
    assert!(node.parent().is_none());
    assert_eq!(cache.servers().len(), 1);

    // the forked lambda server landed in the target's cgroup
    let entered = target.entered.lock().unwrap().clone();
    assert_eq!(entered.len(), 1);

    handler.run_finish();
    assert_eq!(handler.state(), HandlerState::Paused);
    assert!(lru.contains(&handler));
}

#[test]
fn test_concurrent_invocations_share_warmup() {
    let runtime = Arc::new(MockRuntime {
        pull_delay_ms: 100,
        ..Default::default()
    });
    let (handlers, _lru) = make_handler_set(Arc::clone(&runtime));
    let handler = handlers.get(&name("echo"));

    let threads: Vec<_> = (0..2)
        .map(|_| {
            let handler = Arc::clone(&handler);
            thread::spawn(move || handler.run_start().unwrap())
        })
        .collect();
    let ports: Vec<String> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    // exactly one pull and one restart, both callers got the same port
    assert_eq!(runtime.pulls.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.creates.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(ports[0], ports[1]);
    assert_eq!(handler.in_flight(), 2);

    handler.run_finish();
    assert_eq!(runtime.pauses.load(Ordering::SeqCst), 0);
    handler.run_finish();
    assert_eq!(runtime.pauses.load(Ordering::SeqCst), 1);
    assert_eq!(handler.state(), HandlerState::Paused);
}

#[test]
fn test_cache_extension_then_subset_hit() {
    let factory = MockFactory::new(usize::MAX);
    let requests = Arc::clone(&factory.requests);
    let dir = TempDir::new().unwrap();
    let (cache, _cgroup) =
        CacheManager::new(load_catalog(&dir, "a:100\nb:100\n"), Box::new(factory)).unwrap();

    // extension: root has {}, request {a, b} forks a new node
    let target_dir = TempDir::new().unwrap();
    let target = make_target(&target_dir, "4242");
    let wanted = [pkg("a"), pkg("b")];
    let (node, hit) = cache
        .provision(&target, Path::new("/handlers/ml"), &wanted)
        .unwrap();
    assert!(!hit);
    assert_eq!(cache.servers().len(), 2);
    assert_eq!(node.parent(), Some(0));
    assert!(node.packages().contains(&pkg("a")));
    assert!(node.packages().contains(&pkg("b")));
    assert_eq!(cache.servers()[0].children(), 1);

    // the tree grew through one import-list fork, then served the target
    {
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].new_root);
        assert_eq!(requests[0].packages, vec![pkg("a"), pkg("b")]);
        assert!(requests[1].new_root);
        assert!(requests[1].packages.is_empty());
        assert_eq!(requests[1].ns_pid, "4242");
    }

    // subset hit: {a} is covered by the {a, b} node
    let target_dir2 = TempDir::new().unwrap();
    let target2 = make_target(&target_dir2, "4243");
    let hits_before = node.hits();
    let (node2, hit2) = cache
        .provision(&target2, Path::new("/handlers/ml"), &[pkg("a")])
        .unwrap();
    assert!(hit2);
    assert_eq!(node2.seq(), node.seq());
    assert_eq!(node2.hits(), hits_before + 1);
    assert_eq!(cache.servers().len(), 2);
}

#[test]
fn test_child_package_sets_contain_parents() {
    let factory = MockFactory::new(usize::MAX);
    let dir = TempDir::new().unwrap();
    let (cache, _cgroup) =
        CacheManager::new(load_catalog(&dir, ""), Box::new(factory)).unwrap();

    let target_dir = TempDir::new().unwrap();
    let target = make_target(&target_dir, "4242");
    let handler_dir = Path::new("/handlers/any");

    cache.provision(&target, handler_dir, &[pkg("a")]).unwrap();
    cache
        .provision(&target, handler_dir, &[pkg("a"), pkg("b")])
        .unwrap();
    cache.provision(&target, handler_dir, &[pkg("c")]).unwrap();

    let servers = cache.servers();
    assert_eq!(servers.len(), 4);
    for server in &servers {
        if let Some(parent) = server.parent() {
            let parent = &servers[parent];
            assert!(parent.packages().is_subset(server.packages()));
        }
    }

    // {a, b} grew from {a}; {c} grew from the root
    assert_eq!(servers[2].parent(), Some(1));
    assert_eq!(servers[3].parent(), Some(0));
    assert_eq!(servers[0].children(), 2);
    assert_eq!(servers[1].children(), 1);
}

#[test]
fn test_readiness_timeout_kills_scratch_sandbox() {
    // only the root sandbox ever signals readiness
    let factory = Arc::new(MockFactory::new(1));
    let dir = TempDir::new().unwrap();
    let (cache, _cgroup) = CacheManager::new(
        load_catalog(&dir, ""),
        Box::new(SharedFactory(Arc::clone(&factory))),
    )
    .unwrap();

    let target_dir = TempDir::new().unwrap();
    let target = make_target(&target_dir, "4242");
    let result = cache.provision(&target, Path::new("/handlers/slow"), &[pkg("a")]);

    assert!(matches!(
        result,
        Err(CacheError::EntryInitTimeout { timeout_secs: 5 })
    ));

    // the scratch sandbox was killed and the tree is unchanged
    assert_eq!(factory.sandbox_count(), 2);
    assert!(factory.sandbox_killed(1));
    let servers = cache.servers();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].children(), 0);
    assert!(!target.killed.load(Ordering::SeqCst));
}

#[test]
fn test_eviction_prefers_low_value_leaves() {
    let factory = MockFactory::new(usize::MAX);
    let dir = TempDir::new().unwrap();
    let (cache, _cgroup) =
        CacheManager::new(load_catalog(&dir, "a:100\nb:100\n"), Box::new(factory)).unwrap();

    let target_dir = TempDir::new().unwrap();
    let target = make_target(&target_dir, "4242");
    let handler_dir = Path::new("/handlers/any");

    // L1: ten hits on {a}; L2: one hit on {b}
    for _ in 0..10 {
        cache.provision(&target, handler_dir, &[pkg("a")]).unwrap();
    }
    cache.provision(&target, handler_dir, &[pkg("b")]).unwrap();

    let servers = cache.servers();
    assert_eq!(servers[1].hits(), 10);
    assert_eq!(servers[2].hits(), 1);

    // two paused handlers queued for eviction, oldest first
    let runtime = Arc::new(MockRuntime::default());
    let (handlers, lru) = make_handler_set(Arc::clone(&runtime));
    let old = handlers.get(&name("old"));
    let new = handlers.get(&name("new"));
    for handler in [&old, &new] {
        handler.run_start().unwrap();
        handler.run_finish();
    }
    assert_eq!(lru.len(), 2);

    // memory over budget: the low hits/size leaf dies, the root survives
    let usage_path = dir.path().join("usage");
    std::fs::write(&usage_path, "999999999").unwrap();
    let evictor = Evictor::new(
        &usage_path,
        1000,
        Arc::clone(&cache) as Arc<dyn CachePressure>,
        Arc::clone(&lru),
    );
    evictor.check_usage();

    let servers = cache.servers();
    assert!(servers[2].is_dead());
    assert!(!servers[1].is_dead());
    assert!(!servers[0].is_dead());
    assert_eq!(servers[0].children(), 1);
    assert!(!cache.full());

    assert_eq!(old.state(), HandlerState::Stopped);
    assert_eq!(new.state(), HandlerState::Paused);
    assert_eq!(lru.len(), 1);

    // next pass takes the remaining leaf; then the cache is saturated
    evictor.check_usage();
    assert!(cache.servers()[1].is_dead());
    evictor.check_usage();
    assert!(cache.full());

    // pressure relief clears the flag
    std::fs::write(&usage_path, "10").unwrap();
    evictor.check_usage();
    assert!(!cache.full());
}

#[test]
fn test_cleanup_kills_every_server_and_the_factory() {
    let factory = Arc::new(MockFactory::new(usize::MAX));
    let dir = TempDir::new().unwrap();
    let (cache, _cgroup) = CacheManager::new(
        load_catalog(&dir, ""),
        Box::new(SharedFactory(Arc::clone(&factory))),
    )
    .unwrap();

    let target_dir = TempDir::new().unwrap();
    let target = make_target(&target_dir, "4242");
    cache
        .provision(&target, Path::new("/handlers/any"), &[pkg("a")])
        .unwrap();

    cache.cleanup();
    assert_eq!(factory.sandbox_count(), 2);
    assert!(factory.sandbox_killed(0));
    assert!(factory.sandbox_killed(1));
    assert!(factory.cleaned.load(Ordering::SeqCst));
    for server in cache.servers() {
        assert!(server.is_dead());
    }

    // idempotent
    cache.cleanup();
}

#[test]
fn test_worker_init_with_cache_disabled() {
    let config = Config {
        cluster_name: "test".to_string(),
        import_cache_mb: 0,
        package_sizes_path: PathBuf::from("/nonexistent"),
        handler_lru_capacity: 0,
    };

    let runtime = Arc::new(MockRuntime::default());
    let worker = Worker::init(&config, runtime, Box::new(MockFactory::new(usize::MAX))).unwrap();

    assert!(worker.cache().is_none());
    let handler = worker.handlers().get(&name("echo"));
    handler.run_start().unwrap();
    handler.run_finish();
    assert_eq!(handler.state(), HandlerState::Paused);

    worker.cleanup();
}

#[test]
fn test_worker_init_full_stack() {
    let dir = TempDir::new().unwrap();
    let catalog_path = dir.path().join("package_sizes.txt");
    std::fs::write(&catalog_path, "a:100\n").unwrap();

    let config = Config {
        cluster_name: "test".to_string(),
        import_cache_mb: 64,
        package_sizes_path: catalog_path,
        handler_lru_capacity: 0,
    };

    let runtime = Arc::new(MockRuntime::default());
    let worker = Worker::init(&config, runtime, Box::new(MockFactory::new(usize::MAX))).unwrap();

    let cache = worker.cache().expect("cache enabled").clone();
    let target_dir = TempDir::new().unwrap();
    let target = make_target(&target_dir, "4242");
    let (_, hit) = cache
        .provision(&target, Path::new("/handlers/echo"), &[])
        .unwrap();
    assert!(hit);

    // cleanup stops the evictor thread and is idempotent
    worker.cleanup();
    worker.cleanup();
    for server in cache.servers() {
        assert!(server.is_dead());
    }
}
