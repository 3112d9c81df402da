//! SFTP backend
//!
//! One SSH connection carrying one SFTP subsystem, via ssh2.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, UNIX_EPOCH};

use ssh2::{ErrorCode, FileStat, FileType, OpenFlags, OpenType, Session, Sftp};
use tracing::{debug, info, warn};

use super::{FileReader, FileSystem, FileWriter, KeepAlive, poisoned, unix_path};
use crate::config::{Protocol, ServerConfig, Settings};
use crate::errors::{VfsError, VfsResult};
use crate::fs::entry::MODE_MASK;
use crate::fs::{DirEntry, FileInfo};

// SSH_FX_* status codes
const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;

/// Remote filesystem over SFTP
pub struct SftpFs {
    name: String,
    session: Mutex<Option<Session>>,
    sftp: Mutex<Option<Sftp>>,
    keepalive: Mutex<Option<KeepAlive>>,
}

struct SftpWriter {
    file: ssh2::File,
}

impl Write for SftpWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl FileWriter for SftpWriter {
    fn finish(mut self: Box<Self>) -> VfsResult<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// Convert an ssh2 error, keeping the operation and path for display
fn map_ssh_error(op: &'static str, path: &str, e: ssh2::Error) -> VfsError {
    match e.code() {
        ErrorCode::SFTP(FX_NO_SUCH_FILE) => VfsError::NotFound(path.to_string()),
        ErrorCode::SFTP(FX_PERMISSION_DENIED) => VfsError::PermissionDenied(path.to_string()),
        ErrorCode::Session(_) => VfsError::Connection(format!("{} {}: {}", op, path, e)),
        _ => VfsError::remote(op, path, e),
    }
}

fn file_info(name: String, stat: &FileStat) -> FileInfo {
    FileInfo {
        name,
        size: stat.size.unwrap_or(0),
        modified: stat.mtime.map(|t| UNIX_EPOCH + Duration::from_secs(t)),
        mode: stat.perm.unwrap_or(0) & MODE_MASK,
        is_dir: stat.is_dir(),
    }
}

fn fingerprint(hash: &[u8]) -> String {
    hash.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn open_tcp(addr: &str, timeout: Duration) -> VfsResult<TcpStream> {
    let addrs = addr
        .to_socket_addrs()
        .map_err(|e| VfsError::Connection(format!("Failed to resolve {}: {}", addr, e)))?;

    let mut last_err = None;
    for sock in addrs {
        match TcpStream::connect_timeout(&sock, timeout) {
            Ok(tcp) => return Ok(tcp),
            Err(e) => last_err = Some(e),
        }
    }
    Err(VfsError::Connection(match last_err {
        Some(e) => format!("Failed to connect to {}: {}", addr, e),
        None => format!("No address found for {}", addr),
    }))
}

fn authenticate(session: &Session, config: &ServerConfig) -> VfsResult<()> {
    let mut failures = Vec::new();

    if let Some(key) = &config.key_path {
        match session.userauth_pubkey_file(&config.user, None, key, None) {
            Ok(()) => debug!("Authenticated {} with key {}", config.user, key.display()),
            Err(e) => failures.push(format!("key {}: {}", key.display(), e)),
        }
    }

    if !session.authenticated()
        && let Some(password) = config.password()
    {
        match session.userauth_password(&config.user, password) {
            Ok(()) => debug!("Authenticated {} with password", config.user),
            Err(e) => failures.push(format!("password: {}", e)),
        }
    }

    if session.authenticated() {
        return Ok(());
    }
    if failures.is_empty() {
        return Err(VfsError::Auth(format!(
            "No key or password configured for {}",
            config.name
        )));
    }
    Err(VfsError::Auth(failures.join("; ")))
}

impl SftpFs {
    /// Open the SSH session, authenticate and start the SFTP subsystem.
    ///
    /// The server's host key is accepted without verification; its SHA-256
    /// fingerprint is logged so it can be checked out of band.
    pub fn connect(config: &ServerConfig, settings: &Settings) -> VfsResult<Self> {
        let addr = config.address(Protocol::Sftp);
        let tcp = open_tcp(&addr, settings.connect_timeout())?;

        let mut session = Session::new()
            .map_err(|e| VfsError::Connection(format!("Failed to create session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(settings.connect_timeout().as_millis() as u32);
        session
            .handshake()
            .map_err(|e| VfsError::Connection(format!("SSH handshake with {} failed: {}", addr, e)))?;

        match session.host_key_hash(ssh2::HashType::Sha256) {
            Some(hash) => warn!(
                "Trusting host key of {} without verification (SHA256 {})",
                addr,
                fingerprint(hash)
            ),
            None => warn!("Trusting host key of {} without verification", addr),
        }

        authenticate(&session, config)?;

        let sftp = session
            .sftp()
            .map_err(|e| VfsError::Connection(format!("Failed to open SFTP: {}", e)))?;

        // The handshake timeout would otherwise apply to every transfer call
        session.set_timeout(0);

        // libssh2 only sends when asked; the loop asks once per interval
        let interval = settings.keepalive_interval();
        session.set_keepalive(true, interval.as_secs().try_into().unwrap_or(u32::MAX));
        let pinger = session.clone();
        let name = config.name.clone();
        let keepalive = KeepAlive::spawn(interval, move || {
            if let Err(e) = pinger.keepalive_send() {
                warn!("SSH keep-alive for {} failed: {}", name, e);
            }
        });

        info!("Connected to {} ({})", config.name, addr);
        Ok(Self {
            name: config.name.clone(),
            session: Mutex::new(Some(session)),
            sftp: Mutex::new(Some(sftp)),
            keepalive: Mutex::new(Some(keepalive)),
        })
    }

    fn with_sftp<T>(
        &self,
        op: &'static str,
        path: &str,
        f: impl FnOnce(&Sftp) -> Result<T, ssh2::Error>,
    ) -> VfsResult<T> {
        let guard = self.sftp.lock().map_err(poisoned)?;
        let sftp = guard
            .as_ref()
            .ok_or_else(|| VfsError::Connection(format!("{}: session closed", self.name)))?;
        f(sftp).map_err(|e| map_ssh_error(op, path, e))
    }

    fn list_entry(&self, path: &Path, stat: &FileStat) -> Option<DirEntry> {
        let name = path.file_name()?.to_string_lossy().into_owned();
        if name == "." || name == ".." {
            return None;
        }
        if stat.file_type() != FileType::Symlink {
            return Some(DirEntry::from_info(file_info(name, stat)));
        }

        let full = path.to_string_lossy();
        let link_target = self
            .with_sftp("readlink", &full, |sftp| sftp.readlink(path))
            .ok()
            .map(|t| t.to_string_lossy().into_owned());
        Some(match self.with_sftp("stat", &full, |sftp| sftp.stat(path)) {
            Ok(target) => DirEntry::resolved_link(name.clone(), link_target, &file_info(name, &target)),
            Err(_) => DirEntry::unresolved_link(name, link_target),
        })
    }
}

impl FileSystem for SftpFs {
    fn read_dir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let listing = self.with_sftp("readdir", path, |sftp| sftp.readdir(Path::new(path)))?;
        Ok(listing
            .iter()
            .filter_map(|(entry_path, stat)| self.list_entry(entry_path, stat))
            .collect())
    }

    fn stat(&self, path: &str) -> VfsResult<FileInfo> {
        let stat = self.with_sftp("stat", path, |sftp| sftp.stat(Path::new(path)))?;
        Ok(file_info(unix_path::base(path), &stat))
    }

    fn lstat(&self, path: &str) -> VfsResult<FileInfo> {
        let stat = self.with_sftp("lstat", path, |sftp| sftp.lstat(Path::new(path)))?;
        Ok(file_info(unix_path::base(path), &stat))
    }

    fn read_link(&self, path: &str) -> VfsResult<String> {
        let target = self.with_sftp("readlink", path, |sftp| sftp.readlink(Path::new(path)))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn open(&self, path: &str) -> VfsResult<FileReader> {
        let file = self.with_sftp("open", path, |sftp| sftp.open(Path::new(path)))?;
        Ok(Box::new(file))
    }

    fn create(&self, path: &str, mode: u32) -> VfsResult<Box<dyn FileWriter>> {
        let remote = Path::new(path);
        let file = self.with_sftp("create", path, |sftp| {
            sftp.open_mode(
                remote,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                (mode & MODE_MASK) as i32,
                OpenType::File,
            )
        })?;

        // open_mode only applies the mode on creation, and the server's umask still applies
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(mode & MODE_MASK),
            atime: None,
            mtime: None,
        };
        if let Err(e) = self.with_sftp("chmod", path, |sftp| sftp.setstat(remote, stat)) {
            debug!("Could not set mode on {}: {}", path, e);
        }

        Ok(Box::new(SftpWriter { file }))
    }

    fn mkdir_all(&self, path: &str, mode: u32) -> VfsResult<()> {
        let mut current = if path.starts_with('/') {
            "/".to_string()
        } else {
            String::new()
        };

        for component in unix_path::components(path) {
            current = unix_path::join(&current, &component);
            if let Ok(info) = self.stat(&current) {
                if info.is_dir {
                    continue;
                }
                return Err(VfsError::remote("mkdir", &current, "exists and is not a directory"));
            }

            let dir = Path::new(&current);
            if let Err(e) = self.with_sftp("mkdir", &current, |sftp| sftp.mkdir(dir, (mode & MODE_MASK) as i32)) {
                // Lost a race with another creator
                match self.stat(&current) {
                    Ok(info) if info.is_dir => continue,
                    _ => return Err(e),
                }
            }
        }
        Ok(())
    }

    fn remove(&self, path: &str) -> VfsResult<()> {
        let remote = Path::new(path);
        if self.lstat(path)?.is_dir {
            self.with_sftp("rmdir", path, |sftp| sftp.rmdir(remote))
        } else {
            self.with_sftp("unlink", path, |sftp| sftp.unlink(remote))
        }
    }

    fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        self.with_sftp("rename", from, |sftp| {
            sftp.rename(Path::new(from), Path::new(to), None)
        })
    }

    fn read_file(&self, path: &str) -> VfsResult<Vec<u8>> {
        let mut file = self.open(path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        Ok(contents)
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
        if let Some(keepalive) = self.keepalive.lock().map_err(poisoned)?.take()
            && !keepalive.stop()
        {
            warn!("SSH keep-alive thread for {} panicked", self.name);
        }

        // Drop the subsystem before the session it runs on
        self.sftp.lock().map_err(poisoned)?.take();
        if let Some(session) = self.session.lock().map_err(poisoned)?.take() {
            if let Err(e) = session.disconnect(None, "Goodbye", None) {
                debug!("SSH disconnect from {} failed: {}", self.name, e);
            }
            info!("Disconnected from {}", self.name);
        }
        Ok(())
    }
}

impl Drop for SftpFs {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
