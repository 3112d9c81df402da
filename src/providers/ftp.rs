//! FTP and FTPS backend
//!
//! All control-connection traffic is serialized behind one mutex. Uploads
//! stream through an in-process pipe into a background store that holds the
//! lock until the caller finishes the writer. Downloads stream the same way
//! but over a separate transfer connection, so reading a remote file never
//! blocks listings or an upload to the same server.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use suppaftp::types::{FileType, Mode};
use suppaftp::{FtpError, FtpStream, NativeTlsConnector, NativeTlsFtpStream};
use tracing::{debug, info, warn};

use super::pipe::{PipeReader, PipeWriter, pipe};
use super::{FileReader, FileSystem, FileWriter, KeepAlive, poisoned, unix_path};
use crate::config::{Protocol, ServerConfig, Settings};
use crate::errors::{VfsError, VfsResult};
use crate::fs::entry::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
use crate::fs::{DirEntry, FileInfo};

/// Either a plain FTP stream or one upgraded with explicit TLS
enum FtpConnection {
    Plain(FtpStream),
    Tls(NativeTlsFtpStream),
}

impl FtpConnection {
    fn list(&mut self, path: Option<&str>) -> suppaftp::FtpResult<Vec<String>> {
        match self {
            FtpConnection::Plain(s) => s.list(path),
            FtpConnection::Tls(s) => s.list(path),
        }
    }

    /// Stream a download into `out`, calling `on_open` once the data
    /// connection is up. When `out` stops taking bytes the transfer is aborted
    /// so the control connection stays in step.
    fn retr_into(&mut self, path: &str, out: &mut impl Write, on_open: impl FnOnce()) -> suppaftp::FtpResult<u64> {
        match self {
            FtpConnection::Plain(s) => {
                let mut data = s.retr_as_stream(path)?;
                on_open();
                match io::copy(&mut data, out) {
                    Ok(n) => s.finalize_retr_stream(data).map(|()| n),
                    Err(e) => {
                        if let Err(abort) = s.abort(data) {
                            debug!("ABOR of {} failed: {}", path, abort);
                        }
                        Err(FtpError::ConnectionError(e))
                    }
                }
            }
            FtpConnection::Tls(s) => {
                let mut data = s.retr_as_stream(path)?;
                on_open();
                match io::copy(&mut data, out) {
                    Ok(n) => s.finalize_retr_stream(data).map(|()| n),
                    Err(e) => {
                        if let Err(abort) = s.abort(data) {
                            debug!("ABOR of {} failed: {}", path, abort);
                        }
                        Err(FtpError::ConnectionError(e))
                    }
                }
            }
        }
    }

    fn put_file(&mut self, path: &str, reader: &mut impl Read) -> suppaftp::FtpResult<u64> {
        match self {
            FtpConnection::Plain(s) => s.put_file(path, reader),
            FtpConnection::Tls(s) => s.put_file(path, reader),
        }
    }

    fn rm(&mut self, path: &str) -> suppaftp::FtpResult<()> {
        match self {
            FtpConnection::Plain(s) => s.rm(path),
            FtpConnection::Tls(s) => s.rm(path),
        }
    }

    fn rmdir(&mut self, path: &str) -> suppaftp::FtpResult<()> {
        match self {
            FtpConnection::Plain(s) => s.rmdir(path),
            FtpConnection::Tls(s) => s.rmdir(path),
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> suppaftp::FtpResult<()> {
        match self {
            FtpConnection::Plain(s) => s.rename(from, to),
            FtpConnection::Tls(s) => s.rename(from, to),
        }
    }

    fn mkdir(&mut self, path: &str) -> suppaftp::FtpResult<()> {
        match self {
            FtpConnection::Plain(s) => s.mkdir(path),
            FtpConnection::Tls(s) => s.mkdir(path),
        }
    }

    fn site(&mut self, command: &str) -> suppaftp::FtpResult<()> {
        match self {
            FtpConnection::Plain(s) => s.site(command).map(|_| ()),
            FtpConnection::Tls(s) => s.site(command).map(|_| ()),
        }
    }

    fn noop(&mut self) -> suppaftp::FtpResult<()> {
        match self {
            FtpConnection::Plain(s) => s.noop(),
            FtpConnection::Tls(s) => s.noop(),
        }
    }

    fn quit(&mut self) -> suppaftp::FtpResult<()> {
        match self {
            FtpConnection::Plain(s) => s.quit(),
            FtpConnection::Tls(s) => s.quit(),
        }
    }
}

/// Reply code of a negative server response, if that is what the error is
fn reply_code(e: &FtpError) -> Option<u32> {
    match e {
        FtpError::UnexpectedResponse(resp) => Some(resp.status.code()),
        _ => None,
    }
}

/// Convert a suppaftp error, keeping the operation and path for display
fn map_ftp_error(op: &'static str, path: &str, e: FtpError) -> VfsError {
    match &e {
        FtpError::ConnectionError(io) => VfsError::Connection(format!("{} {}: {}", op, path, io)),
        FtpError::SecureError(msg) => VfsError::Connection(format!("TLS error: {}", msg)),
        FtpError::UnexpectedResponse(resp) => {
            let body = String::from_utf8_lossy(&resp.body).trim().to_string();
            // 550 means "not found" or "no access" depending on the server,
            // so it stays a plain remote error
            match resp.status.code() {
                530 => VfsError::Auth(format!("Login incorrect: {}", body)),
                553 | 451 => VfsError::PermissionDenied(path.to_string()),
                code => VfsError::remote(op, path, format!("{} {}", code, body)),
            }
        }
        _ => VfsError::remote(op, path, e),
    }
}

/// Everything needed to open another logged-in connection to the server
struct Dialer {
    protocol: Protocol,
    config: ServerConfig,
    timeout: Duration,
}

impl Dialer {
    /// Connect, optionally upgrade to TLS, log in and switch to binary mode
    fn dial(&self) -> VfsResult<FtpConnection> {
        let config = &self.config;
        let addr = config.address(self.protocol);
        let sock = resolve(&addr)?;
        let connect_err = |e| map_ftp_error("connect", &addr, e);

        let user: &str = if config.user.is_empty() { "anonymous" } else { config.user.as_str() };
        let password = config.password().unwrap_or("anonymous@");

        Ok(match self.protocol {
            Protocol::Ftps => {
                let plain = NativeTlsFtpStream::connect_timeout(sock, self.timeout).map_err(connect_err)?;
                let tls = suppaftp::native_tls::TlsConnector::builder()
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true)
                    .build()
                    .map_err(|e| VfsError::Connection(format!("TLS setup failed: {}", e)))?;
                let mut ftp = plain
                    .into_secure(NativeTlsConnector::from(tls), &config.host)
                    .map_err(connect_err)?;
                ftp.set_mode(Mode::Passive);
                ftp.login(user, password).map_err(connect_err)?;
                ftp.transfer_type(FileType::Binary).map_err(connect_err)?;
                FtpConnection::Tls(ftp)
            }
            Protocol::Sftp => return Err(VfsError::UnsupportedProtocol("sftp over FTP".to_string())),
            Protocol::Ftp => {
                let mut ftp = FtpStream::connect_timeout(sock, self.timeout).map_err(connect_err)?;
                ftp.set_mode(Mode::Passive);
                ftp.login(user, password).map_err(connect_err)?;
                ftp.transfer_type(FileType::Binary).map_err(connect_err)?;
                FtpConnection::Plain(ftp)
            }
        })
    }
}

struct FtpInner {
    name: String,
    stream: Mutex<Option<FtpConnection>>,
    dialer: Dialer,
    /// Idle transfer connection kept for the next download
    spare: Mutex<Option<FtpConnection>>,
    closed: AtomicBool,
}

impl FtpInner {
    fn with_stream<T, F>(&self, op: &'static str, path: &str, f: F) -> VfsResult<T>
    where
        F: FnOnce(&mut FtpConnection) -> suppaftp::FtpResult<T>,
    {
        let mut guard = self.stream.lock().map_err(poisoned)?;
        let stream = guard
            .as_mut()
            .ok_or_else(|| VfsError::Connection(format!("{}: FTP connection closed", self.name)))?;
        f(stream).map_err(|e| map_ftp_error(op, path, e))
    }

    /// The spare transfer connection, or a freshly dialed one
    fn transfer_connection(&self) -> VfsResult<FtpConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VfsError::Connection(format!("{}: FTP connection closed", self.name)));
        }
        match self.spare.lock().map_err(poisoned)?.take() {
            Some(conn) => Ok(conn),
            None => {
                debug!("Opening transfer connection to {}", self.name);
                self.dialer.dial()
            }
        }
    }

    /// Keep a connection whose last transfer completed cleanly for reuse
    fn park(&self, mut conn: FtpConnection) {
        if !self.closed.load(Ordering::Acquire)
            && let Ok(mut spare) = self.spare.lock()
            && spare.is_none()
        {
            *spare = Some(conn);
            return;
        }
        let _ = conn.quit();
    }
}

/// Send NOOP on both connections each interval until stopped
fn spawn_keepalive(inner: Arc<FtpInner>, interval: Duration) -> KeepAlive {
    KeepAlive::spawn(interval, move || {
        if let Err(e) = inner.with_stream("noop", "", |s| s.noop()) {
            warn!("FTP keep-alive for {} failed: {}", inner.name, e);
        }
        if let Ok(mut spare) = inner.spare.lock()
            && let Some(Err(e)) = spare.as_mut().map(|conn| conn.noop())
        {
            debug!("Dropping idle transfer connection to {}: {}", inner.name, e);
            *spare = None;
        }
    })
}

/// Remote filesystem over FTP or FTPS
pub struct FtpFs {
    inner: Arc<FtpInner>,
    keepalive: Mutex<Option<KeepAlive>>,
}

/// Streaming upload. Bytes flow through the pipe into a `STOR` running on a
/// background thread.
struct FtpUpload {
    path: String,
    pipe: PipeWriter,
    store: Option<JoinHandle<VfsResult<()>>>,
    /// Why the store failed, once it has been joined
    failure: Option<String>,
}

impl FtpUpload {
    /// Close the pipe and wait for the store. Its error is reported on this
    /// call and on every later one.
    fn join_store(&mut self) -> VfsResult<()> {
        self.pipe.close();
        if let Some(handle) = self.store.take() {
            let outcome = handle
                .join()
                .map_err(|_| VfsError::remote("store", &self.path, "upload thread panicked"))
                .and_then(|result| result);
            if let Err(e) = outcome {
                self.failure = Some(e.to_string());
                return Err(e);
            }
        }
        match &self.failure {
            Some(message) => Err(VfsError::remote("store", &self.path, message)),
            None => Ok(()),
        }
    }
}

impl Write for FtpUpload {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.pipe.write(buf) {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                // The store ended early; report why
                match self.join_store() {
                    Err(store_err) => Err(io::Error::other(store_err)),
                    Ok(()) => Err(e),
                }
            }
            other => other,
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FileWriter for FtpUpload {
    fn finish(mut self: Box<Self>) -> VfsResult<()> {
        self.join_store()
    }
}

impl Drop for FtpUpload {
    fn drop(&mut self) {
        // Release the control connection even when the caller never finished
        let _ = self.join_store();
    }
}

/// Streaming download. A `RETR` on a background thread feeds the pipe;
/// dropping the reader early makes it abort.
struct FtpDownload {
    path: String,
    pipe: Option<PipeReader>,
    retrieve: Option<JoinHandle<VfsResult<()>>>,
}

impl FtpDownload {
    fn join_retrieve(&mut self) -> VfsResult<()> {
        match self.retrieve.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| VfsError::remote("retrieve", &self.path, "download thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Read for FtpDownload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(pipe) = self.pipe.as_mut() else {
            return Ok(0);
        };
        let n = pipe.read(buf)?;
        if n == 0 && !buf.is_empty() {
            // End of stream: a failed retrieve must not look like a short file
            self.join_retrieve().map_err(io::Error::other)?;
        }
        Ok(n)
    }
}

impl Drop for FtpDownload {
    fn drop(&mut self) {
        self.pipe.take();
        if let Err(e) = self.join_retrieve() {
            debug!("Download of {} ended early: {}", self.path, e);
        }
    }
}

fn resolve(addr: &str) -> VfsResult<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| VfsError::Connection(format!("Failed to resolve {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| VfsError::Connection(format!("No address found for {}", addr)))
}

impl FtpFs {
    /// Connect, optionally upgrade to TLS, log in and start the keep-alive loop.
    ///
    /// FTPS accepts any server certificate, matching the SFTP host key policy.
    pub fn connect(protocol: Protocol, config: &ServerConfig, settings: &Settings) -> VfsResult<Self> {
        let dialer = Dialer {
            protocol,
            config: config.clone(),
            timeout: settings.connect_timeout(),
        };
        let stream = dialer.dial()?;

        info!("Connected to {} ({}://{})", config.name, protocol, config.address(protocol));
        let inner = Arc::new(FtpInner {
            name: config.name.clone(),
            stream: Mutex::new(Some(stream)),
            dialer,
            spare: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let keepalive = spawn_keepalive(Arc::clone(&inner), settings.keepalive_interval());

        Ok(Self {
            inner,
            keepalive: Mutex::new(Some(keepalive)),
        })
    }

    fn list(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let lines = self.inner.with_stream("list", path, |s| s.list(Some(path)))?;
        let now = SystemTime::now();
        Ok(lines.iter().filter_map(|l| parse_list_line(l, now)).collect())
    }

    /// Create one directory, tolerating one that already exists
    fn mkdir_one(&self, path: &str) -> VfsResult<()> {
        let result = self.inner.with_stream("mkdir", path, |s| match s.mkdir(path) {
            Err(e) if matches!(reply_code(&e), Some(521 | 550)) => Ok(Err(e)),
            other => other.map(Ok),
        })?;

        match result {
            Ok(()) => Ok(()),
            // Servers answer 521/550 both for "exists" and for real failures
            Err(e) => match self.stat(path) {
                Ok(info) if info.is_dir => Ok(()),
                _ => Err(map_ftp_error("mkdir", path, e)),
            },
        }
    }
}

impl FileSystem for FtpFs {
    fn read_dir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        self.list(path)
    }

    /// Looked up in the parent's listing. A symlink reports the link's own
    /// attributes since the listing does not resolve it.
    fn stat(&self, path: &str) -> VfsResult<FileInfo> {
        let cleaned = unix_path::clean(path);
        // The root and the login directory always exist
        if cleaned == "/" || cleaned == "." {
            return Ok(FileInfo {
                name: cleaned,
                size: 0,
                modified: None,
                mode: DEFAULT_DIR_MODE,
                is_dir: true,
            });
        }

        let name = unix_path::base(&cleaned);
        let parent = unix_path::parent(&cleaned);
        let entries = match self.list(&parent) {
            Ok(entries) => entries,
            // A missing ancestor makes the path missing; anything else, such
            // as a parent we may not list, is reported as is
            Err(e) => {
                return match self.stat(&parent) {
                    Err(missing) if missing.is_not_found() => Err(VfsError::NotFound(path.to_string())),
                    _ => Err(e),
                };
            }
        };
        entries
            .into_iter()
            .find(|e| e.name == name)
            .map(|e| e.info())
            .ok_or_else(|| VfsError::NotFound(path.to_string()))
    }

    fn lstat(&self, path: &str) -> VfsResult<FileInfo> {
        self.stat(path)
    }

    fn read_link(&self, path: &str) -> VfsResult<String> {
        Err(VfsError::NotSupported(format!("readlink {} over FTP", path)))
    }

    fn open(&self, path: &str) -> VfsResult<FileReader> {
        let mut conn = self.inner.transfer_connection()?;
        let (mut writer, reader) = pipe();
        let (opened_tx, opened_rx) = mpsc::channel::<()>();
        let inner = Arc::clone(&self.inner);
        let target = path.to_string();

        let retrieve = thread::spawn(move || {
            let result = conn.retr_into(&target, &mut writer, move || {
                let _ = opened_tx.send(());
            });
            writer.close();
            match result {
                Ok(_) => {
                    inner.park(conn);
                    Ok(())
                }
                // An aborted or failed transfer leaves the connection in doubt
                Err(e) => Err(map_ftp_error("retrieve", &target, e)),
            }
        });

        let mut download = FtpDownload {
            path: path.to_string(),
            pipe: Some(reader),
            retrieve: Some(retrieve),
        };
        if opened_rx.recv().is_err() {
            // The retrieve ended before the data connection opened
            download.join_retrieve()?;
            return Err(VfsError::remote("retrieve", path, "transfer did not start"));
        }
        Ok(Box::new(download))
    }

    fn create(&self, path: &str, mode: u32) -> VfsResult<Box<dyn FileWriter>> {
        let (writer, mut reader) = pipe();
        let inner = Arc::clone(&self.inner);
        let target = path.to_string();

        let store = thread::spawn(move || {
            inner.with_stream("store", &target, |s| {
                s.put_file(&target, &mut reader)?;
                if mode != DEFAULT_FILE_MODE
                    && let Err(e) = s.site(&format!("CHMOD {:o} {}", mode, target))
                {
                    debug!("Could not set mode on {}: {}", target, e);
                }
                Ok(())
            })
        });

        Ok(Box::new(FtpUpload {
            path: path.to_string(),
            pipe: writer,
            store: Some(store),
            failure: None,
        }))
    }

    fn mkdir_all(&self, path: &str, _mode: u32) -> VfsResult<()> {
        let mut current = if path.starts_with('/') {
            "/".to_string()
        } else {
            String::new()
        };
        for component in unix_path::components(path) {
            current = unix_path::join(&current, &component);
            self.mkdir_one(&current)?;
        }
        Ok(())
    }

    fn remove(&self, path: &str) -> VfsResult<()> {
        self.inner.with_stream("delete", path, |s| match s.rm(path) {
            Ok(()) => Ok(()),
            // Maybe it's a directory
            Err(_) => s.rmdir(path),
        })
    }

    fn remove_all(&self, path: &str) -> VfsResult<()> {
        let info = match self.lstat(path) {
            Ok(info) => info,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if !info.is_dir {
            return self.inner.with_stream("delete", path, |s| s.rm(path));
        }

        for entry in self.list(path)? {
            self.remove_all(&unix_path::join(path, &entry.name))?;
        }

        self.inner.with_stream("rmdir", path, |s| {
            match s.site(&format!("RMDIR {}", path)) {
                Ok(()) => Ok(()),
                Err(_) => s.rmdir(path),
            }
        })
    }

    fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        self.inner.with_stream("rename", from, |s| s.rename(from, to))
    }

    fn join(&self, base: &str, name: &str) -> String {
        unix_path::join(base, name)
    }

    fn dir(&self, path: &str) -> String {
        unix_path::parent(path)
    }

    fn base(&self, path: &str) -> String {
        unix_path::base(path)
    }

    fn is_local(&self) -> bool {
        false
    }

    fn close(&self) -> VfsResult<()> {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(keepalive) = self.keepalive.lock().map_err(poisoned)?.take()
            && !keepalive.stop()
        {
            warn!("FTP keep-alive thread for {} panicked", self.inner.name);
        }

        if let Some(mut spare) = self.inner.spare.lock().map_err(poisoned)?.take() {
            let _ = spare.quit();
        }

        if let Some(mut stream) = self.inner.stream.lock().map_err(poisoned)?.take() {
            if let Err(e) = stream.quit() {
                debug!("FTP QUIT to {} failed: {}", self.inner.name, e);
            }
            info!("Disconnected from {}", self.inner.name);
        }
        Ok(())
    }
}

impl Drop for FtpFs {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Parse one line of Unix-style `LIST` output
///
/// `drwxr-xr-x 2 owner group 4096 Jan 15 10:30 name`; symlinks carry
/// `name -> target`. Lines that do not match (e.g. `total 12`) yield `None`.
fn parse_list_line(line: &str, now: SystemTime) -> Option<DirEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 9 {
        return None;
    }

    let perms = parts[0];
    let is_dir = perms.starts_with('d');
    let is_symlink = perms.starts_with('l');
    let size: u64 = parts[4].parse().unwrap_or(0);

    // Rejoin on single spaces is lossy for names with runs of spaces, so
    // slice the original line after the eighth field instead.
    let name_field = nth_field_rest(line, 8)?;
    let (name, link_target) = match name_field.split_once(" -> ") {
        Some((name, target)) if is_symlink => (name.to_string(), Some(target.to_string())),
        _ => (name_field.to_string(), None),
    };

    if name.is_empty() || name == "." || name == ".." {
        return None;
    }

    let mode = match parse_unix_permissions(perms) {
        0 if is_dir => DEFAULT_DIR_MODE,
        0 => DEFAULT_FILE_MODE,
        mode => mode,
    };

    Some(DirEntry {
        name,
        size: if is_dir { 0 } else { size },
        modified: parse_ftp_date(parts[5], parts[6], parts[7], now),
        mode,
        is_dir,
        is_symlink,
        link_target,
    })
}

/// Remainder of `line` starting at whitespace-separated field `n`
fn nth_field_rest(line: &str, n: usize) -> Option<&str> {
    let mut rest = line.trim_start();
    for _ in 0..n {
        let end = rest.find(char::is_whitespace)?;
        rest = rest[end..].trim_start();
    }
    if rest.is_empty() { None } else { Some(rest) }
}

/// Parse Unix permission string (e.g., "drwxr-xr-x") to numeric
fn parse_unix_permissions(perms: &str) -> u32 {
    let chars: Vec<char> = perms.chars().collect();
    if chars.len() < 10 {
        return 0;
    }

    let mut mode: u32 = 0;

    if chars[1] == 'r' {
        mode |= 0o400;
    }
    if chars[2] == 'w' {
        mode |= 0o200;
    }
    match chars[3] {
        'x' => mode |= 0o100,
        's' => mode |= 0o4100,
        'S' => mode |= 0o4000,
        _ => {}
    }

    if chars[4] == 'r' {
        mode |= 0o040;
    }
    if chars[5] == 'w' {
        mode |= 0o020;
    }
    match chars[6] {
        'x' => mode |= 0o010,
        's' => mode |= 0o2010,
        'S' => mode |= 0o2000,
        _ => {}
    }

    if chars[7] == 'r' {
        mode |= 0o004;
    }
    if chars[8] == 'w' {
        mode |= 0o002;
    }
    match chars[9] {
        'x' => mode |= 0o001,
        't' => mode |= 0o1001,
        'T' => mode |= 0o1000,
        _ => {}
    }

    mode
}

const SECS_PER_DAY: u64 = 86_400;

/// Parse the `Mon DD HH:MM` / `Mon DD YYYY` date columns of a listing.
///
/// The `HH:MM` form omits the year: it is the most recent year that does not
/// put the date in the future.
fn parse_ftp_date(month: &str, day: &str, time_or_year: &str, now: SystemTime) -> Option<SystemTime> {
    let month_num = match month.to_lowercase().as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };

    let day_num: u32 = day.parse().ok()?;
    if !(1..=31).contains(&day_num) {
        return None;
    }

    let to_time = |year: i32, hour: u64, minute: u64| {
        let days = days_since_unix_epoch(year, month_num, day_num)? as u64;
        Some(UNIX_EPOCH + Duration::from_secs(days * SECS_PER_DAY + hour * 3600 + minute * 60))
    };

    match time_or_year.split_once(':') {
        Some((h, m)) => {
            let hour: u64 = h.parse().ok()?;
            let minute: u64 = m.parse().ok()?;
            let year = year_of(now);
            let this_year = to_time(year, hour, minute)?;
            // Allow a day of clock skew before rolling back a year
            if this_year > now + Duration::from_secs(SECS_PER_DAY) {
                to_time(year - 1, hour, minute)
            } else {
                Some(this_year)
            }
        }
        None => to_time(time_or_year.parse().ok()?, 0, 0),
    }
}

fn is_leap(y: i32) -> bool {
    y % 4 == 0 && (y % 100 != 0 || y % 400 == 0)
}

/// Calculate days since Unix epoch (1970-01-01)
fn days_since_unix_epoch(year: i32, month: u32, day: u32) -> Option<i64> {
    if year < 1970 {
        return None;
    }

    let month_days = [0, 31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

    let mut days: i64 = 0;
    for y in 1970..year {
        days += if is_leap(y) { 366 } else { 365 };
    }

    for m in 1..month {
        days += month_days[m as usize] as i64;
        if m == 2 && is_leap(year) {
            days += 1;
        }
    }

    days += (day - 1) as i64;

    Some(days)
}

/// Calendar year (UTC) of a point in time
fn year_of(time: SystemTime) -> i32 {
    let mut days = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() / SECS_PER_DAY)
        .unwrap_or(0);
    let mut year = 1970;
    loop {
        let len = if is_leap(year) { 366 } else { 365 };
        if days < len {
            return year;
        }
        days -= len;
        year += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use suppaftp::Status;
    use suppaftp::types::Response;

    fn at(year: i32, month: u32, day: u32) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(days_since_unix_epoch(year, month, day).unwrap() as u64 * SECS_PER_DAY)
    }

    #[test]
    fn test_parse_permissions() {
        assert_eq!(parse_unix_permissions("drwxr-xr-x"), 0o755);
        assert_eq!(parse_unix_permissions("-rw-r--r--"), 0o644);
        assert_eq!(parse_unix_permissions("-rwxrwxrwx"), 0o777);
        assert_eq!(parse_unix_permissions("drwxrwxrwt"), 0o1777);
        assert_eq!(parse_unix_permissions("-rwsr-xr-x"), 0o4755);
        assert_eq!(parse_unix_permissions("bogus"), 0);
    }

    #[test]
    fn test_parse_list_line_file_and_dir() {
        let now = at(2024, 6, 1);
        let file = parse_list_line("-rw-r--r--   1 ftp  ftp   1234 Jan 15  2023 report final.pdf", now).unwrap();
        assert_eq!(file.name, "report final.pdf");
        assert_eq!(file.size, 1234);
        assert_eq!(file.mode, 0o644);
        assert!(!file.is_dir);
        assert_eq!(file.modified, Some(at(2023, 1, 15)));

        let dir = parse_list_line("drwxr-xr-x 2 ftp ftp 4096 Mar 10 10:30 pub", now).unwrap();
        assert!(dir.is_dir);
        assert_eq!(dir.size, 0);
        assert_eq!(
            dir.modified,
            Some(at(2024, 3, 10) + Duration::from_secs(10 * 3600 + 30 * 60))
        );
    }

    #[test]
    fn test_parse_list_line_symlink_and_noise() {
        let now = at(2024, 6, 1);
        let link = parse_list_line("lrwxrwxrwx 1 ftp ftp 11 Feb  2  2022 latest -> release-1.2", now).unwrap();
        assert!(link.is_symlink);
        assert_eq!(link.name, "latest");
        assert_eq!(link.link_target.as_deref(), Some("release-1.2"));

        assert!(parse_list_line("total 12", now).is_none());
        assert!(parse_list_line("drwxr-xr-x 2 ftp ftp 4096 Mar 10 10:30 .", now).is_none());
    }

    #[test]
    fn test_recent_date_in_future_rolls_back_a_year() {
        let now = at(2024, 1, 10);
        assert_eq!(parse_ftp_date("Dec", "20", "08:00", now), Some(at(2023, 12, 20) + Duration::from_secs(8 * 3600)));
        assert_eq!(parse_ftp_date("Jan", "5", "00:00", now), Some(at(2024, 1, 5)));
        assert_eq!(parse_ftp_date("Foo", "5", "2020", now), None);
    }

    #[test]
    fn test_year_of() {
        assert_eq!(year_of(UNIX_EPOCH), 1970);
        assert_eq!(year_of(at(2024, 12, 31)), 2024);
        assert_eq!(year_of(at(2025, 1, 1)), 2025);
    }

    #[test]
    fn test_reply_code_mapping() {
        let io = FtpError::ConnectionError(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(reply_code(&io).is_none());
        assert!(matches!(map_ftp_error("list", "/", io), VfsError::Connection(_)));
    }

    fn reply(status: Status, body: &str) -> FtpError {
        FtpError::UnexpectedResponse(Response {
            status,
            body: body.as_bytes().to_vec(),
        })
    }

    #[test]
    fn test_550_is_not_treated_as_missing() {
        let denied = reply(Status::FileUnavailable, "550 Permission denied");
        assert_eq!(reply_code(&denied), Some(550));

        let err = map_ftp_error("delete", "/locked", denied);
        assert!(!err.is_not_found());
        match err {
            VfsError::Remote { op, path, message } => {
                assert_eq!(op, "delete");
                assert_eq!(path, "/locked");
                assert!(message.contains("550"));
                assert!(message.contains("Permission denied"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let login = reply(Status::NotLoggedIn, "530 Login incorrect");
        assert!(matches!(map_ftp_error("login", "", login), VfsError::Auth(_)));
    }

    fn upload(store: impl FnOnce(PipeReader) -> VfsResult<()> + Send + 'static) -> FtpUpload {
        let (writer, reader) = pipe();
        FtpUpload {
            path: "/up".into(),
            pipe: writer,
            store: Some(thread::spawn(move || store(reader))),
            failure: None,
        }
    }

    #[test]
    fn test_upload_reports_store_error_on_write_and_finish() {
        let mut up = upload(|reader| {
            drop(reader);
            Err(VfsError::remote("store", "/up", "552 quota exceeded"))
        });

        let err = up.write_all(b"payload").unwrap_err();
        assert!(err.to_string().contains("552"), "{err}");

        let err = Box::new(up).finish().unwrap_err();
        assert!(err.to_string().contains("552 quota exceeded"), "{err}");
    }

    #[test]
    fn test_upload_finish_waits_for_store() {
        let (seen_tx, seen_rx) = mpsc::channel();
        let mut up = upload(move |mut reader| {
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            let _ = seen_tx.send(data);
            Ok(())
        });

        up.write_all(b"hello ").unwrap();
        up.write_all(b"world").unwrap();
        Box::new(up).finish().unwrap();
        assert_eq!(seen_rx.try_recv().unwrap(), b"hello world");
    }

    fn download(retrieve: impl FnOnce(PipeWriter) -> VfsResult<()> + Send + 'static) -> FtpDownload {
        let (writer, reader) = pipe();
        FtpDownload {
            path: "/down".into(),
            pipe: Some(reader),
            retrieve: Some(thread::spawn(move || retrieve(writer))),
        }
    }

    #[test]
    fn test_dropping_download_early_stops_the_transfer() {
        let (done_tx, done_rx) = mpsc::channel();
        let mut down = download(move |mut writer| {
            let copied = io::copy(&mut io::repeat(7).take(1 << 20), &mut writer);
            let _ = done_tx.send(copied.map_err(|e| e.kind()));
            Ok(())
        });

        let mut head = [0u8; 16];
        down.read_exact(&mut head).unwrap();
        assert_eq!(head, [7u8; 16]);

        // Drop joins the transfer thread, so its outcome is already sent
        drop(down);
        assert_eq!(done_rx.try_recv().unwrap(), Err(io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn test_download_failure_surfaces_at_end_of_stream() {
        let mut down = download(|mut writer| {
            writer.write_all(b"abc")?;
            Err(VfsError::remote("retrieve", "/down", "426 transfer aborted"))
        });

        let mut data = Vec::new();
        let err = down.read_to_end(&mut data).unwrap_err();
        assert_eq!(data, b"abc");
        assert!(err.to_string().contains("426 transfer aborted"), "{err}");
    }

    #[test]
    fn test_download_reads_whole_file() {
        let mut down = download(|mut writer| {
            writer.write_all(b"complete file")?;
            Ok(())
        });

        let mut data = String::new();
        down.read_to_string(&mut data).unwrap();
        assert_eq!(data, "complete file");
    }
}
