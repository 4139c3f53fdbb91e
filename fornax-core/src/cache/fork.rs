//! Fork-request wire protocol and readiness synchronization.
//!
//! A fork server listens on a Unix-domain socket inside its sandbox's host
//! directory. One JSON line in, one JSON line out; the response carries the
//! pid of the forked child.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::types::PackageName;

/// Number of bytes a child writes to the readiness pipe.
pub(crate) const READY_LEN: usize = 5;

/// Request instructing a fork server to fork-enter a sandbox's namespaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkRequest {
    /// Init pid of the target sandbox.
    pub ns_pid: String,
    /// Absolute path the child chroots into.
    pub root_dir: PathBuf,
    /// Packages the child imports after forking.
    pub packages: Vec<PackageName>,
    /// True when the child becomes the lambda server in the target sandbox;
    /// false when it becomes a new fork server growing the cache.
    pub new_root: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ForkResponse {
    pub pid: String,
}

/// Send a fork request over the fork server's socket and return the spawned
/// child pid.
pub(crate) fn fork_request(sock_path: &Path, request: &ForkRequest) -> Result<String, CacheError> {
    let fail = |reason: String| CacheError::ForkRequest {
        sock_path: sock_path.to_path_buf(),
        reason,
    };

    let mut stream = UnixStream::connect(sock_path).map_err(|e| fail(format!("connect: {e}")))?;

    let mut payload = serde_json::to_vec(request).map_err(|e| fail(format!("encode: {e}")))?;
    payload.push(b'\n');
    stream
        .write_all(&payload)
        .map_err(|e| fail(format!("send: {e}")))?;
    stream.flush().map_err(|e| fail(format!("send: {e}")))?;

    let mut line = String::new();
    BufReader::new(stream)
        .read_line(&mut line)
        .map_err(|e| fail(format!("recv: {e}")))?;
    let response: ForkResponse =
        serde_json::from_str(line.trim_end()).map_err(|e| fail(format!("decode: {e}")))?;

    tracing::debug!(
        sock = %sock_path.display(),
        pid = %response.pid,
        new_root = request.new_root,
        "fork request served"
    );

    Ok(response.pid)
}

/// Readiness pipe of a freshly provisioned sandbox.
///
/// Opened read+write so a FIFO open cannot block on an absent writer. The
/// child writes exactly `READY_LEN` bytes once its interpreter is serving.
pub(crate) struct ReadyPipe {
    pipe: File,
    path: PathBuf,
}

impl ReadyPipe {
    /// Open the pipe. Must happen before the fork request so the child
    /// cannot win the race to the pipe.
    pub(crate) fn open(path: &Path) -> Result<Self, CacheError> {
        let pipe = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| CacheError::PipeOpen {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            pipe,
            path: path.to_path_buf(),
        })
    }

    /// Block until the child signals readiness, up to `timeout`.
    ///
    /// A short read is a protocol desync, reported distinctly from a
    /// timeout and logged with the observed byte count.
    pub(crate) fn wait(self, timeout: Duration) -> Result<(), CacheError> {
        let (tx, rx) = mpsc::channel();
        let mut pipe = self.pipe;
        thread::spawn(move || {
            let mut buf = [0u8; READY_LEN];
            let _ = tx.send(pipe.read(&mut buf));
        });

        let start = Instant::now();
        match rx.recv_timeout(timeout) {
            Ok(Ok(n)) if n == READY_LEN => {
                tracing::debug!(
                    pipe = %self.path.display(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "sandbox ready"
                );
                Ok(())
            }
            Ok(Ok(n)) => {
                tracing::error!(
                    pipe = %self.path.display(),
                    read = n,
                    expected = READY_LEN,
                    "short read on readiness pipe"
                );
                Err(CacheError::ReadinessMalformed {
                    expected: READY_LEN,
                    read: n,
                })
            }
            Ok(Err(source)) => Err(CacheError::PipeRead { source }),
            // the reader thread stays parked on the pipe until worker exit
            Err(_) => Err(CacheError::EntryInitTimeout {
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}
