//! Bulk import of secrets from dotenv files, SOPS-encrypted files and the
//! process environment.
//!
//! Imported values land under `<group>/<KEY>`. Unless given, the group is the
//! file name with its secret-file suffix removed, so `prod.env` and
//! `prod.sops.yaml` both import into `prod/`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::crypt::VaultKey;
use crate::error::{VaultError, VaultResult};
use crate::kv::validate_path;
use crate::secret::CredentialEntry;
use crate::vault::Vault;

/// Environment variable suffixes picked up by [`ingest_env_vars`].
pub const ENV_SECRET_SUFFIXES: &[&str] = &["_API_KEY", "_TOKEN", "_SECRET", "_PASSWORD"];
/// Group used for process environment imports and nameless dotenv files.
pub const ENV_GROUP: &str = "env";

const SOPS_EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    DotEnv,
    Sops,
}

/// Classify a file by name: `.env`, `.env.*` and `*.env` are dotenv;
/// `*.sops.{json,yaml,yml}`, `*.enc.{json,yaml,yml}` and `secrets.enc.*`
/// are SOPS.
pub fn detect_kind(path: &Path) -> Option<SourceKind> {
    let name = path.file_name()?.to_str()?;
    if name == ".env" || name.starts_with(".env.") || name.ends_with(".env") {
        return Some(SourceKind::DotEnv);
    }
    if name.starts_with("secrets.enc.") {
        return Some(SourceKind::Sops);
    }
    let (stem, ext) = name.rsplit_once('.')?;
    if SOPS_EXTENSIONS.contains(&ext) && (stem.ends_with(".sops") || stem.ends_with(".enc")) {
        return Some(SourceKind::Sops);
    }
    None
}

/// Group name derived from a file name.
pub fn default_group(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = [".sops.", ".enc."]
        .iter()
        .find_map(|marker| name.find(marker).map(|i| &name[..i]))
        .or_else(|| name.strip_suffix(".env"))
        .unwrap_or(&name)
        .trim_start_matches('.');
    if base.is_empty() {
        ENV_GROUP.to_owned()
    } else {
        base.to_owned()
    }
}

/// Key/value pairs read from one source.
#[derive(Default)]
pub struct Pairs {
    pub pairs: Vec<(String, SecretString)>,
    /// Lines or values that could not be used.
    pub skipped: usize,
}

impl Pairs {
    fn push(&mut self, key: impl Into<String>, value: &str) {
        self.pairs
            .push((key.into(), SecretString::from(value.to_owned())));
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Parse dotenv text. Blank lines and `#` comments are ignored; lines
/// without `=` or with an empty key count as skipped.
pub fn parse_dotenv(text: &str) -> Pairs {
    let mut out = Pairs::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line
            .strip_prefix("export")
            .filter(|rest| rest.starts_with(char::is_whitespace))
            .map_or(line, str::trim_start);
        let Some((key, value)) = line.split_once('=') else {
            out.skipped += 1;
            continue;
        };
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            out.skipped += 1;
            continue;
        }
        out.push(key, unquote(value.trim()));
    }
    out
}

/// Flatten a decrypted SOPS document. Nested keys are joined with `.`,
/// array elements use their index, non-string scalars are stringified and
/// nulls are skipped.
pub fn flatten_json(value: &Value) -> VaultResult<Pairs> {
    let Value::Object(map) = value else {
        return Err(VaultError::Sops("decrypted document is not an object".into()));
    };
    let mut out = Pairs::default();
    for (key, child) in map {
        flatten_into(key.clone(), child, &mut out);
    }
    Ok(out)
}

fn flatten_into(prefix: String, value: &Value, out: &mut Pairs) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(format!("{prefix}.{key}"), child, out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_into(format!("{prefix}.{index}"), child, out);
            }
        }
        Value::String(s) => out.push(prefix, s),
        Value::Bool(b) => out.push(prefix, &b.to_string()),
        Value::Number(n) => out.push(prefix, &n.to_string()),
        Value::Null => out.skipped += 1,
    }
}

/// Decrypts a SOPS file to JSON.
pub trait SopsDecryptor {
    fn decrypt(&self, path: &Path) -> VaultResult<Zeroizing<Vec<u8>>>;
}

/// Runs `sops -d --output-type json <file>`.
#[derive(Debug, Clone)]
pub struct SopsCli {
    program: OsString,
}

impl SopsCli {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SopsCli {
    fn default() -> Self {
        Self::new("sops")
    }
}

impl SopsDecryptor for SopsCli {
    fn decrypt(&self, path: &Path) -> VaultResult<Zeroizing<Vec<u8>>> {
        let output = Command::new(&self.program)
            .args(["-d", "--output-type", "json"])
            .arg(path)
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    VaultError::Sops(format!(
                        "{} not found on PATH",
                        self.program.to_string_lossy()
                    ))
                } else {
                    VaultError::Io(e)
                }
            })?;
        let stdout = Zeroizing::new(output.stdout);
        if !output.status.success() {
            return Err(VaultError::Sops(format!(
                "decrypting {} failed: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(stdout)
    }
}

/// What an import stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub group: String,
    pub source: Option<PathBuf>,
    /// Entry paths written, in input order.
    pub stored: Vec<String>,
    pub skipped: usize,
}

fn store_pairs(
    vault: &Vault,
    key: &VaultKey,
    group: &str,
    source: Option<&Path>,
    pairs: Pairs,
) -> VaultResult<IngestReport> {
    let mut report = IngestReport {
        group: group.to_owned(),
        source: source.map(Path::to_path_buf),
        stored: Vec::with_capacity(pairs.pairs.len()),
        skipped: pairs.skipped,
    };
    let notes = source.map(|p| format!("imported from {}", p.display()));
    for (name, value) in pairs.pairs {
        let path = format!("{group}/{name}");
        if validate_path(&path).is_err() {
            warn!(name, "skipping key that does not form a valid entry path");
            report.skipped += 1;
            continue;
        }
        let mut entry = CredentialEntry::new(name, value.expose_secret());
        if let Some(notes) = &notes {
            entry = entry.with_notes(notes.clone());
        }
        vault.store_with_key(key, &path, &entry)?;
        report.stored.push(path);
    }
    info!(
        group,
        stored = report.stored.len(),
        skipped = report.skipped,
        "import finished"
    );
    Ok(report)
}

fn read_secret_file(path: &Path) -> VaultResult<Zeroizing<String>> {
    Ok(Zeroizing::new(std::fs::read_to_string(path)?))
}

/// Import a dotenv file.
#[instrument(level = "debug", skip(vault, password))]
pub fn ingest_env_file(
    vault: &Vault,
    path: &Path,
    group: Option<&str>,
    password: &SecretString,
) -> VaultResult<IngestReport> {
    let key = vault.unlock_key(password)?;
    let text = read_secret_file(path)?;
    let group = group.map_or_else(|| default_group(path), str::to_owned);
    store_pairs(vault, &key, &group, Some(path), parse_dotenv(&text))
}

/// Decrypt a SOPS file with `decryptor` and import its flattened keys.
#[instrument(level = "debug", skip(vault, password, decryptor))]
pub fn ingest_sops_file(
    vault: &Vault,
    path: &Path,
    group: Option<&str>,
    password: &SecretString,
    decryptor: &dyn SopsDecryptor,
) -> VaultResult<IngestReport> {
    let key = vault.unlock_key(password)?;
    let plaintext = decryptor.decrypt(path)?;
    let document: Value = serde_json::from_slice(&plaintext)
        .map_err(|e| VaultError::Sops(format!("decrypted output is not JSON: {e}")))?;
    let group = group.map_or_else(|| default_group(path), str::to_owned);
    store_pairs(vault, &key, &group, Some(path), flatten_json(&document)?)
}

/// Import `path` according to [`detect_kind`], decrypting SOPS files with
/// the `sops` binary on `PATH`.
pub fn ingest_file(
    vault: &Vault,
    path: &Path,
    group: Option<&str>,
    password: &SecretString,
) -> VaultResult<IngestReport> {
    match detect_kind(path) {
        Some(SourceKind::DotEnv) => ingest_env_file(vault, path, group, password),
        Some(SourceKind::Sops) => {
            ingest_sops_file(vault, path, group, password, &SopsCli::default())
        }
        None => Err(VaultError::InvalidParam("unrecognised secret file name")),
    }
}

/// Variables whose upper-cased name ends in one of
/// [`ENV_SECRET_SUFFIXES`]. Non-UTF-8 names and values are skipped.
pub fn select_env_vars<I>(vars: I) -> Pairs
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut out = Pairs::default();
    for (name, value) in vars {
        let (Some(name), Some(value)) = (name.to_str(), value.to_str()) else {
            continue;
        };
        let upper = name.to_ascii_uppercase();
        if value.is_empty() || !ENV_SECRET_SUFFIXES.iter().any(|s| upper.ends_with(s)) {
            continue;
        }
        out.push(name, value);
    }
    debug!(matched = out.pairs.len(), "environment scanned");
    out
}

/// Import secret-looking variables from the process environment into
/// `group` (default [`ENV_GROUP`]).
#[instrument(level = "debug", skip(vault, password))]
pub fn ingest_env_vars(
    vault: &Vault,
    group: Option<&str>,
    password: &SecretString,
) -> VaultResult<IngestReport> {
    let key = vault.unlock_key(password)?;
    let pairs = select_env_vars(std::env::vars_os());
    store_pairs(vault, &key, group.unwrap_or(ENV_GROUP), None, pairs)
}
