// sshfwd - Known Hosts Module
// Host key verification against an OpenSSH-style known_hosts file

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyResult {
    /// Host key is in known_hosts and matches
    Trusted,
    /// Host key is not in known_hosts (first connection)
    Unknown,
    /// Host key is in known_hosts but doesn't match (possible MITM)
    Mismatch {
        actual_fingerprint: String,
        line_number: usize,
    },
}

/// One `patterns key_type key_data [comment]` line
#[derive(Debug, Clone)]
struct HostEntry {
    /// Comma-separated host patterns, e.g. "example.com,10.0.0.5" or "[example.com]:2222"
    patterns: Vec<String>,
    key_type: String,
    key_data: String,
    comment: Option<String>,
    line_number: usize,
}

impl HostEntry {
    fn parse(line: &str, line_number: usize) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let mut fields = line.split_whitespace();
        let (Some(hosts), Some(key_type), Some(key_data)) =
            (fields.next(), fields.next(), fields.next())
        else {
            warn!("Skipping malformed known_hosts line {}", line_number);
            return None;
        };

        // Hashed (|1|...) and marker (@revoked) lines are not supported
        if hosts.starts_with('|') || hosts.starts_with('@') {
            debug!("Skipping unsupported known_hosts line {}", line_number);
            return None;
        }

        let comment: Vec<&str> = fields.collect();
        Some(HostEntry {
            patterns: hosts.split(',').map(str::to_string).collect(),
            key_type: key_type.to_string(),
            key_data: key_data.to_string(),
            comment: (!comment.is_empty()).then(|| comment.join(" ")),
            line_number,
        })
    }

    fn to_line(&self) -> String {
        let mut line = format!("{} {} {}", self.patterns.join(","), self.key_type, self.key_data);
        if let Some(comment) = &self.comment {
            line.push(' ');
            line.push_str(comment);
        }
        line
    }

    fn matches(&self, host: &str, port: u16) -> bool {
        let wanted = host_pattern(host, port);
        self.patterns
            .iter()
            .any(|p| *p == wanted || (port == 22 && p == host))
    }

    fn holds_key(&self, key_type: &str, key_data: &str) -> bool {
        self.key_type == key_type && self.key_data == key_data
    }
}

/// In-memory view of a known_hosts file
pub struct KnownHosts {
    path: PathBuf,
    entries: Vec<HostEntry>,
}

impl KnownHosts {
    /// Load known_hosts from a path; a missing file yields an empty set
    pub fn load(path: &Path) -> Result<Self> {
        let mut entries = Vec::new();

        if path.exists() {
            let file = fs::File::open(path)
                .with_context(|| format!("Failed to open known_hosts file: {}", path.display()))?;
            for (idx, line) in BufReader::new(file).lines().enumerate() {
                let line = line.context("Failed to read line from known_hosts")?;
                entries.extend(HostEntry::parse(&line, idx + 1));
            }
            debug!("Loaded {} entries from {}", entries.len(), path.display());
        } else {
            info!("Known_hosts file does not exist yet: {}", path.display());
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Check a server key for `host:port`
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> VerifyResult {
        let key_type = key_type_name(key);
        let key_data = key.public_key_base64();

        let mut first_match = None;
        for entry in self.entries.iter().filter(|e| e.matches(host, port)) {
            if entry.holds_key(&key_type, &key_data) {
                return VerifyResult::Trusted;
            }
            first_match.get_or_insert(entry.line_number);
        }

        match first_match {
            None => VerifyResult::Unknown,
            Some(line_number) => VerifyResult::Mismatch {
                actual_fingerprint: fingerprint(key),
                line_number,
            },
        }
    }

    /// Record a key for `host:port` (call `save` to persist)
    pub fn add(&mut self, host: &str, port: u16, key: &PublicKey) {
        let line_number = self.entries.last().map_or(1, |e| e.line_number + 1);
        self.entries.push(HostEntry {
            patterns: vec![host_pattern(host, port)],
            key_type: key_type_name(key),
            key_data: key.public_key_base64(),
            comment: None,
            line_number,
        });
        info!("Added host key for {}:{} to known_hosts", host, port);
    }

    /// Write all entries back to disk with owner-only permissions
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create known_hosts directory")?;
        }

        let mut file = fs::File::create(&self.path)
            .with_context(|| format!("Failed to create known_hosts file: {}", self.path.display()))?;
        writeln!(file, "# sshfwd known hosts")?;
        for entry in &self.entries {
            writeln!(file, "{}", entry.to_line())?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
                .context("Failed to set known_hosts file permissions")?;
        }

        debug!("Saved {} entries to {}", self.entries.len(), self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// known_hosts pattern: bare host on port 22, "[host]:port" otherwise
fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Algorithm name from the SSH wire encoding (string length + name prefix)
fn key_type_name(key: &PublicKey) -> String {
    let bytes = key.public_key_bytes();
    let Some(len_bytes) = bytes.get(..4) else {
        return "unknown".to_string();
    };
    let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    match bytes.get(4..4 + len) {
        Some(name) => String::from_utf8_lossy(name).into_owned(),
        None => "unknown".to_string(),
    }
}

/// SHA256 fingerprint in OpenSSH notation ("SHA256:<base64>")
pub fn fingerprint(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.public_key_bytes());
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest);
    format!("SHA256:{}", encoded)
}
