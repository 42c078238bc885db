//! Persistence interface for unacknowledged flows.
//!
//! The engine stores encoded packet bytes keyed by direction and packet
//! identifier: `send/<pid>` for outbound flows awaiting their terminal
//! acknowledgement and `recv/<pid>` for inbound QoS 2 flows awaiting
//! PUBREL. Backends must be callable from the engine task and the
//! connection glue concurrently. Failures are reported upward and never
//! abort the session.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Key for an outbound in-flight flow.
pub fn send_key(pid: u16) -> String {
    format!("send/{pid}")
}

/// Key for an inbound QoS 2 flow.
pub fn recv_key(pid: u16) -> String {
    format!("recv/{pid}")
}

/// Direction component of a persistence key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    Send,
    Recv,
}

/// Split a persistence key back into direction and packet identifier.
/// Returns `None` for keys this crate did not write.
pub fn parse_key(key: &str) -> Option<(KeyDirection, u16)> {
    let (direction, pid) = key.split_once('/')?;
    let direction = match direction {
        "send" => KeyDirection::Send,
        "recv" => KeyDirection::Recv,
        _ => return None,
    };
    let pid: u16 = pid.parse().ok()?;
    if pid == 0 {
        return None;
    }
    Some((direction, pid))
}

/// Abstract store for encoded packets, scoped to one client identity.
pub trait Persistence: Send + Sync {
    fn store(&self, key: &str, packet: &[u8]) -> Result<()>;
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Visit every stored entry. Iteration order is backend-defined;
    /// callers needing packet-identifier order sort after collecting.
    fn range(&self, visit: &mut dyn FnMut(&str, &[u8])) -> Result<()>;
}

/// Persistence that remembers nothing. Suitable for QoS 0 workloads and
/// sessions that accept redelivery loss.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistence;

impl Persistence for NoopPersistence {
    fn store(&self, _key: &str, _packet: &[u8]) -> Result<()> {
        Ok(())
    }

    fn load(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn range(&self, _visit: &mut dyn FnMut(&str, &[u8])) -> Result<()> {
        Ok(())
    }
}

/// In-memory persistence. State lives as long as the process; useful for
/// tests and for clients that only need resume across reconnects, not
/// restarts.
#[derive(Debug, Default)]
pub struct MemPersistence {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Persistence for MemPersistence {
    fn store(&self, key: &str, packet: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), packet.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn range(&self, visit: &mut dyn FnMut(&str, &[u8])) -> Result<()> {
        for (key, packet) in self.entries.lock().iter() {
            visit(key, packet);
        }
        Ok(())
    }
}

/// File-backed persistence: one file per key under `dir`, with the key's
/// direction as a subdirectory (`<dir>/send/7`).
#[derive(Debug)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        for sub in ["send", "recv"] {
            fs::create_dir_all(dir.join(sub))
                .with_context(|| format!("creating persistence dir {}", dir.display()))?;
        }
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        parse_key(key).with_context(|| format!("invalid persistence key {key}"))?;
        Ok(self.dir.join(key))
    }
}

impl Persistence for FilePersistence {
    fn store(&self, key: &str, packet: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        fs::write(&path, packet).with_context(|| format!("writing {}", path.display()))
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }

    fn range(&self, visit: &mut dyn FnMut(&str, &[u8])) -> Result<()> {
        for sub in ["send", "recv"] {
            let dir = self.dir.join(sub);
            for entry in fs::read_dir(&dir).with_context(|| format!("listing {}", dir.display()))? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let key = format!("{sub}/{name}");
                if parse_key(&key).is_none() {
                    continue;
                }
                let bytes =
                    fs::read(entry.path()).with_context(|| format!("reading {key} entry"))?;
                visit(&key, &bytes);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trip() {
        assert_eq!(parse_key(&send_key(7)), Some((KeyDirection::Send, 7)));
        assert_eq!(parse_key(&recv_key(65535)), Some((KeyDirection::Recv, 65535)));
        assert_eq!(parse_key("send/0"), None);
        assert_eq!(parse_key("other/3"), None);
        assert_eq!(parse_key("send"), None);
    }

    #[test]
    fn mem_store_load_delete_range() {
        let persist = MemPersistence::new();
        persist.store(&send_key(2), &[1, 2]).unwrap();
        persist.store(&recv_key(9), &[9]).unwrap();
        assert_eq!(persist.load(&send_key(2)).unwrap(), Some(vec![1, 2]));
        assert_eq!(persist.load(&send_key(3)).unwrap(), None);

        let mut seen = Vec::new();
        persist
            .range(&mut |key, bytes| seen.push((key.to_string(), bytes.to_vec())))
            .unwrap();
        assert_eq!(seen.len(), 2);

        persist.delete(&send_key(2)).unwrap();
        assert_eq!(persist.load(&send_key(2)).unwrap(), None);
        assert_eq!(persist.len(), 1);
    }

    #[test]
    fn file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let persist = FilePersistence::new(dir.path()).unwrap();
        persist.store(&send_key(11), &[0xAB, 0xCD]).unwrap();
        persist.store(&recv_key(4), &[0x01]).unwrap();
        assert_eq!(persist.load(&send_key(11)).unwrap(), Some(vec![0xAB, 0xCD]));

        let mut keys = Vec::new();
        persist
            .range(&mut |key, _| keys.push(key.to_string()))
            .unwrap();
        keys.sort();
        assert_eq!(keys, vec!["recv/4".to_string(), "send/11".to_string()]);

        persist.delete(&send_key(11)).unwrap();
        persist.delete(&send_key(11)).unwrap();
        assert_eq!(persist.load(&send_key(11)).unwrap(), None);
    }

    #[test]
    fn file_backend_rejects_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let persist = FilePersistence::new(dir.path()).unwrap();
        assert!(persist.store("../escape", &[1]).is_err());
    }
}
