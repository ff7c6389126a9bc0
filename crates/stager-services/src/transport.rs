//! Transport abstraction — offset-addressed bulk I/O behind one interface.
//!
//! The backend is chosen at configuration time, not compile time, so the
//! same daemon binary can run against the parallel filesystem (`posix`),
//! push to a remote stagerd data port (`tcp`), or run entirely in memory
//! for tests (`mock`).

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use zerocopy::AsBytes;

use stager_core::request::Dataset;
use stager_core::wire::{ack, op, FrameHeader, MAX_FRAME_PAYLOAD};
use stager_core::{Error, Result};

/// An open source or target. Shared across tasks addressing the same
/// location; all I/O is offset-addressed so concurrent chunk transfers
/// never contend on a cursor.
pub trait Endpoint: Send + Sync {
    /// Human-readable location, for logs and error messages.
    fn describe(&self) -> String;
    fn len(&self) -> Result<u64>;
    /// Read up to `buf.len()` bytes at `offset`. Short reads only at EOF.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;
    fn flush(&self) -> Result<()>;
}

pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap reachability check used at submission time. `writable` probes
    /// target-side preconditions. Failures surface as `Error::Validation`
    /// so the submitter gets them synchronously.
    fn probe(&self, dataset: &Dataset, writable: bool) -> Result<()>;

    /// Size of an existing source dataset, for chunk planning.
    fn size_of(&self, dataset: &Dataset) -> Result<u64>;

    fn open_source(&self, dataset: &Dataset) -> Result<Arc<dyn Endpoint>>;

    fn open_target(&self, dataset: &Dataset) -> Result<Arc<dyn Endpoint>>;

    /// Unlink a source dataset after a Move request completed.
    fn remove(&self, dataset: &Dataset) -> Result<()>;

    /// Drop pooled endpoints nobody references anymore.
    fn prune_idle(&self) {}
}

/// Build the backend named in the config.
pub fn make_transport(backend: &str, rpc_timeout: Duration) -> anyhow::Result<Arc<dyn Transport>> {
    match backend {
        "posix" => Ok(Arc::new(PosixTransport::new())),
        "tcp" => Ok(Arc::new(TcpTransport::new(rpc_timeout))),
        "mock" => Ok(Arc::new(MockTransport::new())),
        other => anyhow::bail!("unknown transport backend: {other}"),
    }
}

fn io_err(path: &Path, source: std::io::Error) -> Error {
    Error::Io {
        path: path.display().to_string(),
        source,
    }
}

// ── posix ─────────────────────────────────────────────────────────────────────

/// Direct filesystem I/O via pread/pwrite. This is the backend for staging
/// between mounted tiers (parallel filesystem ↔ burst buffer).
pub struct PosixTransport {
    targets: DashMap<String, Arc<PosixEndpoint>>,
}

struct PosixEndpoint {
    file: std::fs::File,
    path: std::path::PathBuf,
}

impl PosixTransport {
    pub fn new() -> Self {
        Self {
            targets: DashMap::new(),
        }
    }
}

impl Default for PosixTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for PosixTransport {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn probe(&self, dataset: &Dataset, writable: bool) -> Result<()> {
        if dataset.is_remote() {
            return Err(Error::Validation(format!(
                "posix backend cannot reach remote dataset {}",
                dataset.path
            )));
        }
        let path = dataset.local_path();
        if writable {
            let parent = path.parent().unwrap_or(Path::new("/"));
            if !parent.is_dir() {
                return Err(Error::Validation(format!(
                    "target directory does not exist: {}",
                    parent.display()
                )));
            }
        } else if !path.is_file() {
            return Err(Error::Validation(format!(
                "source does not exist: {}",
                path.display()
            )));
        }
        Ok(())
    }

    fn size_of(&self, dataset: &Dataset) -> Result<u64> {
        let path = dataset.local_path();
        let meta = std::fs::metadata(&path).map_err(|e| io_err(&path, e))?;
        Ok(meta.len())
    }

    fn open_source(&self, dataset: &Dataset) -> Result<Arc<dyn Endpoint>> {
        let path = dataset.local_path();
        let file = std::fs::File::open(&path).map_err(|e| io_err(&path, e))?;
        Ok(Arc::new(PosixEndpoint { file, path }))
    }

    fn open_target(&self, dataset: &Dataset) -> Result<Arc<dyn Endpoint>> {
        // Tasks writing chunks of the same file share one endpoint.
        if let Some(existing) = self.targets.get(&dataset.path) {
            return Ok(existing.clone() as Arc<dyn Endpoint>);
        }
        let path = dataset.local_path();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        let ep = Arc::new(PosixEndpoint { file, path });
        self.targets.insert(dataset.path.clone(), ep.clone());
        Ok(ep)
    }

    fn remove(&self, dataset: &Dataset) -> Result<()> {
        let path = dataset.local_path();
        std::fs::remove_file(&path).map_err(|e| io_err(&path, e))
    }

    fn prune_idle(&self) {
        self.targets.retain(|_, ep| Arc::strong_count(ep) > 1);
    }
}

impl Endpoint for PosixEndpoint {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn len(&self) -> Result<u64> {
        let meta = self.file.metadata().map_err(|e| io_err(&self.path, e))?;
        Ok(meta.len())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file
            .read_at(buf, offset)
            .map_err(|e| io_err(&self.path, e))
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file
            .write_all_at(data, offset)
            .map_err(|e| io_err(&self.path, e))
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_data().map_err(|e| io_err(&self.path, e))
    }
}

// ── tcp ───────────────────────────────────────────────────────────────────────

/// Frame-based push to a remote stagerd data port. Local paths fall back to
/// posix behavior, so one backend covers "read from PFS, write to a remote
/// node's local storage".
pub struct TcpTransport {
    local: PosixTransport,
    remotes: DashMap<String, Arc<RemoteEndpoint>>,
    rpc_timeout: Duration,
}

struct RemoteEndpoint {
    /// `host:port` of the remote data listener.
    addr: String,
    /// Absolute path on the remote node.
    path: String,
    conn: Mutex<Option<TcpStream>>,
    rpc_timeout: Duration,
}

impl TcpTransport {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self {
            local: PosixTransport::new(),
            remotes: DashMap::new(),
            rpc_timeout,
        }
    }

    fn split_uri(dataset: &Dataset) -> Result<(String, String)> {
        let rest = dataset
            .path
            .strip_prefix("tcp://")
            .ok_or_else(|| Error::Validation(format!("not a tcp:// uri: {}", dataset.path)))?;
        match rest.split_once('/') {
            Some((addr, path)) if !addr.is_empty() && !path.is_empty() => {
                Ok((addr.to_string(), format!("/{path}")))
            }
            _ => Err(Error::Validation(format!(
                "malformed tcp uri (want tcp://host:port/abs/path): {}",
                dataset.path
            ))),
        }
    }

    fn remote_endpoint(&self, dataset: &Dataset) -> Result<Arc<RemoteEndpoint>> {
        if let Some(existing) = self.remotes.get(&dataset.path) {
            return Ok(existing.clone());
        }
        let (addr, path) = Self::split_uri(dataset)?;
        let ep = Arc::new(RemoteEndpoint {
            addr,
            path,
            conn: Mutex::new(None),
            rpc_timeout: self.rpc_timeout,
        });
        self.remotes.insert(dataset.path.clone(), ep.clone());
        Ok(ep)
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn probe(&self, dataset: &Dataset, writable: bool) -> Result<()> {
        if !dataset.is_remote() {
            return self.local.probe(dataset, writable);
        }
        if !writable {
            return Err(Error::Validation(format!(
                "remote datasets can only be targets: {}",
                dataset.path
            )));
        }
        let (addr, _) = Self::split_uri(dataset)?;
        // Fail fast on unreachable destinations at submission time.
        let resolved = addr
            .to_socket_addrs()
            .map_err(|e| Error::Validation(format!("bad address {addr}: {e}")))?
            .next()
            .ok_or_else(|| Error::Validation(format!("address resolves to nothing: {addr}")))?;
        TcpStream::connect_timeout(&resolved, self.rpc_timeout)
            .map_err(|e| Error::Validation(format!("destination {addr} unreachable: {e}")))?;
        Ok(())
    }

    fn size_of(&self, dataset: &Dataset) -> Result<u64> {
        if dataset.is_remote() {
            return Err(Error::Validation(
                "cannot size a remote dataset".to_string(),
            ));
        }
        self.local.size_of(dataset)
    }

    fn open_source(&self, dataset: &Dataset) -> Result<Arc<dyn Endpoint>> {
        if dataset.is_remote() {
            return Err(Error::Validation(format!(
                "remote datasets can only be targets: {}",
                dataset.path
            )));
        }
        self.local.open_source(dataset)
    }

    fn open_target(&self, dataset: &Dataset) -> Result<Arc<dyn Endpoint>> {
        if !dataset.is_remote() {
            return self.local.open_target(dataset);
        }
        Ok(self.remote_endpoint(dataset)? as Arc<dyn Endpoint>)
    }

    fn remove(&self, dataset: &Dataset) -> Result<()> {
        if dataset.is_remote() {
            return Err(Error::Validation(
                "cannot remove a remote dataset".to_string(),
            ));
        }
        self.local.remove(dataset)
    }

    fn prune_idle(&self) {
        self.local.prune_idle();
        self.remotes.retain(|_, ep| Arc::strong_count(ep) > 1);
    }
}

impl RemoteEndpoint {
    fn transport_err(&self, reason: impl Into<String>) -> Error {
        Error::Transport {
            endpoint: format!("tcp://{}{}", self.addr, self.path),
            reason: reason.into(),
        }
    }

    /// Connect lazily and announce the target path with an OPEN frame.
    fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr)
            .map_err(|e| self.transport_err(format!("connect: {e}")))?;
        stream
            .set_read_timeout(Some(self.rpc_timeout))
            .map_err(|e| self.transport_err(format!("set timeout: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| self.transport_err(format!("nodelay: {e}")))?;

        let mut stream = stream;
        self.send_frame(&mut stream, op::OPEN, 0, self.path.as_bytes())?;
        Ok(stream)
    }

    fn send_frame(&self, stream: &mut TcpStream, op: u8, offset: u64, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= MAX_FRAME_PAYLOAD);
        let header = FrameHeader::new(op, offset, payload);
        stream
            .write_all(header.as_bytes())
            .and_then(|_| stream.write_all(payload))
            .map_err(|e| self.transport_err(format!("send: {e}")))?;

        let mut status = [0u8; 1];
        stream.read_exact(&mut status).map_err(|e| {
            if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) {
                Error::Timeout {
                    what: format!("frame ack from {}", self.addr),
                    millis: self.rpc_timeout.as_millis() as u64,
                }
            } else {
                self.transport_err(format!("ack read: {e}"))
            }
        })?;

        match status[0] {
            ack::OK => Ok(()),
            ack::BAD_HASH => Err(self.transport_err("receiver reported hash mismatch")),
            ack::IO_ERROR => Err(self.transport_err("receiver reported I/O error")),
            other => Err(self.transport_err(format!("unknown ack byte 0x{other:02x}"))),
        }
    }
}

impl Endpoint for RemoteEndpoint {
    fn describe(&self) -> String {
        format!("tcp://{}{}", self.addr, self.path)
    }

    fn len(&self) -> Result<u64> {
        Err(Error::Validation(
            "remote endpoints are write-only".to_string(),
        ))
    }

    fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::Validation(
            "remote endpoints are write-only".to_string(),
        ))
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if guard.is_none() {
            *guard = Some(self.connect()?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(self.transport_err("no connection"));
        };

        match self.send_frame(stream, op::DATA, offset, data) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Drop the broken connection; the retry path reconnects.
                *guard = None;
                Err(e)
            }
        }
    }

    fn flush(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // A zero-length transfer never writes; connect anyway so the OPEN
        // frame creates the file on the remote side before CLOSE.
        if guard.is_none() {
            *guard = Some(self.connect()?);
        }
        if let Some(stream) = guard.as_mut() {
            self.send_frame(stream, op::CLOSE, 0, &[])?;
        }
        *guard = None;
        Ok(())
    }
}

// ── mock ──────────────────────────────────────────────────────────────────────

/// In-memory backend with failure injection. Tests use it to exercise the
/// engine, scheduler, and tracker without touching a filesystem or network.
pub struct MockTransport {
    files: DashMap<String, Arc<MockFile>>,
    /// path -> remaining number of operations that should fail.
    /// Shared with every MockFile handed out.
    failures: FailureTable,
}

type FailureTable = Arc<DashMap<String, AtomicU32>>;

struct MockFile {
    path: String,
    data: Mutex<Vec<u8>>,
    failures: FailureTable,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            files: DashMap::new(),
            failures: Arc::new(DashMap::new()),
        }
    }

    /// Seed a source file.
    pub fn put(&self, path: &str, data: Vec<u8>) {
        self.file(path, Some(data));
    }

    /// Contents of a file, if it exists.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .get(path)
            .map(|f| f.data.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Make the next `times` I/O operations on `path` fail with a transport
    /// error.
    pub fn fail_next(&self, path: &str, times: u32) {
        self.failures
            .insert(path.to_string(), AtomicU32::new(times));
    }

    fn file(&self, path: &str, init: Option<Vec<u8>>) -> Arc<MockFile> {
        if let Some(existing) = self.files.get(path) {
            if let Some(data) = init {
                *existing.data.lock().unwrap_or_else(|p| p.into_inner()) = data;
            }
            return existing.clone();
        }
        let f = Arc::new(MockFile {
            path: path.to_string(),
            data: Mutex::new(init.unwrap_or_default()),
            failures: self.failures.clone(),
        });
        self.files.insert(path.to_string(), f.clone());
        f
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn probe(&self, dataset: &Dataset, writable: bool) -> Result<()> {
        if writable {
            return Ok(());
        }
        if self.exists(&dataset.path) {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "source does not exist: {}",
                dataset.path
            )))
        }
    }

    fn size_of(&self, dataset: &Dataset) -> Result<u64> {
        self.get(&dataset.path)
            .map(|d| d.len() as u64)
            .ok_or_else(|| Error::Validation(format!("source does not exist: {}", dataset.path)))
    }

    fn open_source(&self, dataset: &Dataset) -> Result<Arc<dyn Endpoint>> {
        if !self.exists(&dataset.path) {
            return Err(Error::Validation(format!(
                "source does not exist: {}",
                dataset.path
            )));
        }
        Ok(self.file(&dataset.path, None) as Arc<dyn Endpoint>)
    }

    fn open_target(&self, dataset: &Dataset) -> Result<Arc<dyn Endpoint>> {
        Ok(self.file(&dataset.path, None) as Arc<dyn Endpoint>)
    }

    fn remove(&self, dataset: &Dataset) -> Result<()> {
        self.files.remove(&dataset.path);
        Ok(())
    }
}

impl MockFile {
    fn maybe_fail(&self) -> Result<()> {
        if let Some(remaining) = self.failures.get(&self.path) {
            let prev = remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                if v > 0 { Some(v - 1) } else { None }
            });
            if prev.is_ok() {
                return Err(Error::Transport {
                    endpoint: self.path.clone(),
                    reason: "injected failure".to_string(),
                });
            }
        }
        Ok(())
    }
}

impl Endpoint for MockFile {
    fn describe(&self) -> String {
        format!("mock://{}", self.path)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.lock().unwrap_or_else(|p| p.into_inner()).len() as u64)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.maybe_fail()?;
        let data = self.data.lock().unwrap_or_else(|p| p.into_inner());
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.maybe_fail()?;
        let mut file = self.data.lock().unwrap_or_else(|p| p.into_inner());
        let end = offset as usize + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_write_then_read_round_trips() {
        let t = MockTransport::new();
        t.put("/src", b"hello stager".to_vec());

        let src = t.open_source(&Dataset::posix("/src")).unwrap();
        let dst = t.open_target(&Dataset::posix("/dst")).unwrap();

        let mut buf = vec![0u8; 12];
        let n = src.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 12);
        dst.write_at(0, &buf[..n]).unwrap();

        assert_eq!(t.get("/dst").unwrap(), b"hello stager");
    }

    #[test]
    fn mock_failure_injection_is_bounded() {
        let t = MockTransport::new();
        t.put("/flaky", vec![1, 2, 3]);
        t.fail_next("/flaky", 2);

        let ep = t.open_source(&Dataset::posix("/flaky")).unwrap();
        let mut buf = [0u8; 3];
        assert!(ep.read_at(0, &mut buf).is_err());
        assert!(ep.read_at(0, &mut buf).is_err());
        // Third attempt succeeds.
        assert_eq!(ep.read_at(0, &mut buf).unwrap(), 3);
    }

    #[test]
    fn mock_probe_missing_source_is_validation_error() {
        let t = MockTransport::new();
        let err = t.probe(&Dataset::posix("/nope"), false).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn posix_offset_io_round_trips() {
        let dir = std::env::temp_dir().join(format!("stager-posix-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let src_path = dir.join("in.dat");
        std::fs::write(&src_path, b"0123456789").unwrap();

        let t = PosixTransport::new();
        let src = Dataset::posix(src_path.to_str().unwrap());
        let dst = Dataset::posix(dir.join("out.dat").to_str().unwrap());

        t.probe(&src, false).unwrap();
        t.probe(&dst, true).unwrap();
        assert_eq!(t.size_of(&src).unwrap(), 10);

        let sep = t.open_source(&src).unwrap();
        let dep = t.open_target(&dst).unwrap();
        let mut buf = [0u8; 4];
        sep.read_at(6, &mut buf).unwrap();
        dep.write_at(6, &buf).unwrap();
        dep.write_at(0, b"012345").unwrap();
        dep.flush().unwrap();

        assert_eq!(std::fs::read(dir.join("out.dat")).unwrap(), b"0123456789");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn tcp_uri_parsing() {
        let good = Dataset::posix("tcp://node7:9202/scratch/a.dat");
        let (addr, path) = TcpTransport::split_uri(&good).unwrap();
        assert_eq!(addr, "node7:9202");
        assert_eq!(path, "/scratch/a.dat");

        let bad = Dataset::posix("tcp://node7:9202");
        assert!(TcpTransport::split_uri(&bad).is_err());
    }

    #[test]
    fn tcp_rejects_remote_sources() {
        let t = TcpTransport::new(Duration::from_millis(100));
        let remote = Dataset::posix("tcp://node7:9202/a");
        assert!(matches!(
            t.open_source(&remote),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            t.probe(&remote, false).unwrap_err(),
            Error::Validation(_)
        ));
    }
}
