//! Ownership of live remote sessions, keyed by server name

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use tracing::{debug, info, warn};

use super::{FileSystem, FtpFs, SftpFs, poisoned};
use crate::config::{Protocol, ServerConfig, Settings};
use crate::errors::VfsResult;

/// Opens a backend session for a server
pub trait Connector: Send + Sync {
    fn connect(&self, protocol: Protocol, config: &ServerConfig) -> VfsResult<Arc<dyn FileSystem>>;
}

/// Connector opening real SFTP/FTP/FTPS sessions
#[derive(Debug, Clone, Default)]
pub struct NetworkConnector {
    settings: Settings,
}

impl NetworkConnector {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

impl Connector for NetworkConnector {
    fn connect(&self, protocol: Protocol, config: &ServerConfig) -> VfsResult<Arc<dyn FileSystem>> {
        let fs: Arc<dyn FileSystem> = match protocol {
            Protocol::Sftp => Arc::new(SftpFs::connect(config, &self.settings)?),
            Protocol::Ftp | Protocol::Ftps => Arc::new(FtpFs::connect(protocol, config, &self.settings)?),
        };
        Ok(fs)
    }
}

#[derive(Default)]
struct Sessions {
    live: HashMap<String, Arc<dyn FileSystem>>,
    /// Names whose connect is in flight
    connecting: HashSet<String>,
}

/// Map from server name to its live session.
///
/// Callers hold `Arc` references to sessions but never close them; the
/// manager does, on [`disconnect`](Self::disconnect) and
/// [`disconnect_all`](Self::disconnect_all).
pub struct ConnectionManager {
    connector: Box<dyn Connector>,
    sessions: Mutex<Sessions>,
    /// Signalled whenever a connect in flight settles
    settled: Condvar,
}

impl ConnectionManager {
    pub fn new(settings: Settings) -> Self {
        Self::with_connector(Box::new(NetworkConnector::new(settings)))
    }

    pub fn with_connector(connector: Box<dyn Connector>) -> Self {
        Self {
            connector,
            sessions: Mutex::new(Sessions::default()),
            settled: Condvar::new(),
        }
    }

    /// Return the live session for `config.name`, connecting if there is none.
    ///
    /// The map is unlocked while the network connect runs. A second caller
    /// for the same name waits for that connect instead of opening another.
    pub fn connect(&self, config: &ServerConfig) -> VfsResult<Arc<dyn FileSystem>> {
        let protocol = {
            let mut sessions = self.sessions.lock().map_err(poisoned)?;
            loop {
                if let Some(fs) = sessions.live.get(&config.name) {
                    debug!("Reusing session {}", config.name);
                    return Ok(Arc::clone(fs));
                }
                if !sessions.connecting.contains(&config.name) {
                    break;
                }
                sessions = self.settled.wait(sessions).map_err(poisoned)?;
            }
            let protocol = config.protocol()?;
            sessions.connecting.insert(config.name.clone());
            protocol
        };

        let pending = PendingConnect {
            manager: self,
            name: &config.name,
        };
        let fs = self.connector.connect(protocol, config)?;
        info!("Opened {} session {}", protocol, config.name);
        self.sessions
            .lock()
            .map_err(poisoned)?
            .live
            .insert(config.name.clone(), Arc::clone(&fs));
        drop(pending);
        Ok(fs)
    }

    /// Close and forget the session for `name`; nothing happens if there is none
    pub fn disconnect(&self, name: &str) -> VfsResult<()> {
        let removed = self.sessions.lock().map_err(poisoned)?.live.remove(name);
        if let Some(fs) = removed {
            fs.close()?;
            info!("Closed session {}", name);
        }
        Ok(())
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.sessions
            .lock()
            .map(|sessions| sessions.live.contains_key(name))
            .unwrap_or(false)
    }

    /// Names of the live sessions
    pub fn connected(&self) -> Vec<String> {
        self.sessions
            .lock()
            .map(|sessions| sessions.live.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Close every session. Close failures are logged; the map is emptied regardless.
    pub fn disconnect_all(&self) -> VfsResult<()> {
        let drained: Vec<_> = self.sessions.lock().map_err(poisoned)?.live.drain().collect();
        for (name, fs) in drained {
            if let Err(e) = fs.close() {
                warn!("Closing session {} failed: {}", name, e);
            }
        }
        Ok(())
    }
}

/// Clears a name's in-flight mark and wakes waiters, also when the connect fails or panics
struct PendingConnect<'a> {
    manager: &'a ConnectionManager,
    name: &'a str,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        let mut sessions = self.manager.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.connecting.remove(self.name);
        self.manager.settled.notify_all();
    }
}
