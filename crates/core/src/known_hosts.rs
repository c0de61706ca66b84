// Redis Tunnel - Known Hosts Module
// SSH host key verification against an OpenSSH-style known_hosts file

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use redis_tunnel_common::{config_dir, HostKeyPolicy, TransportError};

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyResult {
    /// Host key is in known_hosts and matches
    Trusted,
    /// Host key is not in known_hosts (first connection)
    Unknown,
    /// Host key is in known_hosts but doesn't match
    Mismatch { line_number: usize },
}

/// The parts of a server key that known_hosts stores
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    pub key_type: String,
    pub key_data: String,
}

impl HostKey {
    pub fn from_public_key(key: &PublicKey) -> Self {
        Self {
            key_type: key_type_of(&key.public_key_bytes()),
            key_data: key.public_key_base64(),
        }
    }

    /// SHA256 fingerprint in OpenSSH's "SHA256:<base64>" form
    pub fn fingerprint(&self) -> String {
        let raw = STANDARD.decode(&self.key_data).unwrap_or_default();
        let digest = Sha256::digest(&raw);
        let encoded = STANDARD.encode(digest);
        format!("SHA256:{}", encoded.trim_end_matches('='))
    }
}

/// A single entry in the known_hosts file
#[derive(Debug, Clone)]
struct KnownHostEntry {
    /// Comma-separated host patterns (e.g. "bastion,10.0.0.1" or "[bastion]:2222")
    host_patterns: Vec<String>,
    key: HostKey,
    comment: Option<String>,
    /// Line number in file (for error reporting)
    line_number: usize,
}

impl KnownHostEntry {
    /// Parse a single line; comments, blank lines and markers are skipped
    fn parse(line: &str, line_number: usize) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            return None;
        }

        // Format: host_patterns key_type key_data [comment]
        let mut parts = line.split_whitespace();
        let (hosts, key_type, key_data) = match (parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(t), Some(d)) => (h, t, d),
            _ => {
                warn!("Invalid known_hosts entry at line {}: too few fields", line_number);
                return None;
            }
        };
        if hosts.starts_with('|') {
            debug!("Skipping hashed known_hosts entry at line {}", line_number);
            return None;
        }
        let comment: Vec<&str> = parts.collect();

        Some(KnownHostEntry {
            host_patterns: hosts.split(',').map(str::to_string).collect(),
            key: HostKey {
                key_type: key_type.to_string(),
                key_data: key_data.to_string(),
            },
            comment: (!comment.is_empty()).then(|| comment.join(" ")),
            line_number,
        })
    }

    fn format(&self) -> String {
        let hosts = self.host_patterns.join(",");
        match &self.comment {
            Some(comment) => format!("{} {} {} {}", hosts, self.key.key_type, self.key.key_data, comment),
            None => format!("{} {} {}", hosts, self.key.key_type, self.key.key_data),
        }
    }

    fn matches(&self, host: &str, port: u16) -> bool {
        let pattern = format_host_pattern(host, port);
        self.host_patterns.iter().any(|p| *p == pattern)
    }
}

/// In-memory view of a known_hosts file
pub struct KnownHosts {
    path: PathBuf,
    entries: Vec<KnownHostEntry>,
}

impl KnownHosts {
    /// Default location: <config_dir>/redis-tunnel/known_hosts
    pub fn default_path() -> io::Result<PathBuf> {
        config_dir()
            .map(|dir| dir.join("known_hosts"))
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))
    }

    /// Load entries from `path`; a missing file is an empty set
    pub fn load_from(path: &Path) -> io::Result<Self> {
        let mut entries = Vec::new();

        if path.exists() {
            let reader = BufReader::new(fs::File::open(path)?);
            for (line_idx, line) in reader.lines().enumerate() {
                if let Some(entry) = KnownHostEntry::parse(&line?, line_idx + 1) {
                    entries.push(entry);
                }
            }
            debug!("Loaded {} entries from known_hosts: {}", entries.len(), path.display());
        } else {
            info!("Known_hosts file does not exist yet: {}", path.display());
        }

        Ok(KnownHosts {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn verify(&self, host: &str, port: u16, key: &HostKey) -> VerifyResult {
        let mut first_match = None;
        for entry in self.entries.iter().filter(|e| e.matches(host, port)) {
            if entry.key == *key {
                return VerifyResult::Trusted;
            }
            first_match.get_or_insert(entry.line_number);
        }

        match first_match {
            Some(line_number) => VerifyResult::Mismatch { line_number },
            None => VerifyResult::Unknown,
        }
    }

    pub fn add(&mut self, host: &str, port: u16, key: &HostKey) {
        self.entries.push(KnownHostEntry {
            host_patterns: vec![format_host_pattern(host, port)],
            key: key.clone(),
            comment: None,
            line_number: self.entries.len() + 1,
        });
        info!("Added host key for {}:{} to known_hosts", host, port);
    }

    /// Save known_hosts to disk with owner-only permissions
    pub fn save(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::File::create(&self.path)?;
        writeln!(file, "# Redis Tunnel - Known Hosts")?;
        writeln!(file)?;
        for entry in &self.entries {
            writeln!(file, "{}", entry.format())?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        debug!("Saved {} entries to known_hosts: {}", self.entries.len(), self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Decide whether to trust `key` for `host:port` under `policy`.
///
/// With `AcceptNew`, unknown hosts are recorded in the file at `path`.
/// A mismatch is always fatal.
pub fn check_host_key(
    path: &Path,
    host: &str,
    port: u16,
    key: &HostKey,
    policy: HostKeyPolicy,
) -> Result<(), TransportError> {
    if policy == HostKeyPolicy::AcceptAny {
        warn!("Host key verification disabled for {}:{}", host, port);
        return Ok(());
    }

    let mut known_hosts = KnownHosts::load_from(path).map_err(|e| {
        TransportError::HostKey(format!("failed to load {}: {}", path.display(), e))
    })?;

    match known_hosts.verify(host, port, key) {
        VerifyResult::Trusted => {
            debug!("Host key verified for {}:{}", host, port);
            Ok(())
        }
        VerifyResult::Unknown if policy == HostKeyPolicy::AcceptNew => {
            info!(
                "Trusting new host key for {}:{} ({} {})",
                host,
                port,
                key.key_type,
                key.fingerprint()
            );
            known_hosts.add(host, port, key);
            known_hosts.save().map_err(|e| {
                TransportError::HostKey(format!("failed to save {}: {}", path.display(), e))
            })
        }
        VerifyResult::Unknown => Err(TransportError::HostKey(format!(
            "host {}:{} is not in {} ({} {})",
            host,
            port,
            path.display(),
            key.key_type,
            key.fingerprint()
        ))),
        VerifyResult::Mismatch { line_number } => {
            error!(
                "REMOTE HOST IDENTIFICATION HAS CHANGED for {}:{}; offending key at {}:{}",
                host,
                port,
                path.display(),
                line_number
            );
            Err(TransportError::HostKey(format!(
                "host key for {}:{} does not match line {} of {} (got {})",
                host,
                port,
                line_number,
                path.display(),
                key.fingerprint()
            )))
        }
    }
}

/// Format host pattern for known_hosts (e.g., "host" or "[host]:port")
fn format_host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Algorithm name from the SSH wire encoding (u32 length + name)
fn key_type_of(key_bytes: &[u8]) -> String {
    if key_bytes.len() < 4 {
        return "unknown".to_string();
    }
    let len = u32::from_be_bytes([key_bytes[0], key_bytes[1], key_bytes[2], key_bytes[3]]) as usize;
    match key_bytes.get(4..4 + len) {
        Some(name) => String::from_utf8_lossy(name).into_owned(),
        None => "unknown".to_string(),
    }
}
