//! SSH key provisioning and provenance tracking.
//!
//! Keys the driver generated or imported are tagged
//! [`KeyProvenance::CreatedBySystem`] and removed on teardown; keys the caller
//! named are never deleted.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::ComputeBackend;
use crate::command::{CommandError, CommandRunner, ProcessCommandRunner};
use crate::config::HostConfig;
use crate::error::{DriverError, PreconditionError};
use crate::fs;

/// Who is responsible for a key pair.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyProvenance {
    /// Generated or imported by the driver; deleted on teardown.
    CreatedBySystem,
    /// Named by the caller; left in place on teardown.
    SuppliedByCaller,
}

/// Key material associated with a host.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Backend key pair name.
    pub name: String,
    /// OpenSSH public key, when known.
    pub public_key: Option<String>,
    /// Private key on the local filesystem, when known.
    pub private_key_path: Option<Utf8PathBuf>,
    /// Backend identifier; `None` when nothing was registered.
    pub backend_id: Option<String>,
    /// Provenance flag governing teardown.
    pub provenance: KeyProvenance,
}

impl KeyPair {
    /// Backend identifier of a key the driver must delete on teardown.
    #[must_use]
    pub fn owned_backend_id(&self) -> Option<&str> {
        match self.provenance {
            KeyProvenance::CreatedBySystem => self.backend_id.as_deref(),
            KeyProvenance::SuppliedByCaller => None,
        }
    }
}

/// Errors raised while producing or reading key material.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum KeyError {
    /// The generator could not be started.
    #[error(transparent)]
    Spawn(#[from] CommandError),
    /// The generator ran but failed.
    #[error("ssh-keygen failed: {0}")]
    Generate(String),
    /// Key material could not be read or written.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// The public key file was empty.
    #[error("public key {0} is empty")]
    EmptyPublicKey(Utf8PathBuf),
}

/// Produces fresh key pairs.
pub trait KeyGenerator {
    /// Writes a private key to `private_key_path` and returns the matching
    /// OpenSSH public key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] when generation fails.
    fn generate(&self, private_key_path: &Utf8Path, comment: &str) -> Result<String, KeyError>;
}

/// Generates ed25519 keys with `ssh-keygen`.
#[derive(Clone, Debug, Default)]
pub struct SshKeygen<R = ProcessCommandRunner> {
    runner: R,
}

impl<R> SshKeygen<R> {
    /// Uses `runner` to invoke `ssh-keygen`.
    #[must_use]
    pub const fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> KeyGenerator for SshKeygen<R> {
    fn generate(&self, private_key_path: &Utf8Path, comment: &str) -> Result<String, KeyError> {
        if let Some(parent) = private_key_path.parent() {
            fs::create_dir_all(parent).map_err(|err| KeyError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            })?;
        }
        let args = [
            "-q",
            "-t",
            "ed25519",
            "-N",
            "",
            "-C",
            comment,
            "-f",
            private_key_path.as_str(),
        ]
        .map(OsString::from);
        let output = self.runner.run("ssh-keygen", &args)?;
        if !output.is_success() {
            return Err(KeyError::Generate(output.failure_summary()));
        }
        read_public_key(&public_key_path(private_key_path))
    }
}

/// Path of the public half that accompanies `private_key_path`.
#[must_use]
pub fn public_key_path(private_key_path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{private_key_path}.pub"))
}

/// Public half next to a caller-supplied private key. A missing or
/// unreadable file is logged and yields `None`; the named backend key pair
/// still works without it.
fn companion_public_key(private_key_path: &Utf8Path) -> Option<String> {
    let path = public_key_path(private_key_path);
    read_public_key(&path)
        .inspect_err(|err| {
            warn!(path = %path, error = %err, "public key unreadable; continuing without it");
        })
        .ok()
}

/// Reads and trims an OpenSSH public key file.
///
/// # Errors
///
/// Returns [`KeyError::Io`] when the file cannot be read and
/// [`KeyError::EmptyPublicKey`] when it is blank.
pub fn read_public_key(path: &Utf8Path) -> Result<String, KeyError> {
    let contents = fs::read_to_string(path).map_err(|err| KeyError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let key = contents.trim();
    if key.is_empty() {
        return Err(KeyError::EmptyPublicKey(path.to_path_buf()));
    }
    Ok(key.to_owned())
}

/// Checks key-pair preconditions without mutating anything.
///
/// A caller-named key pair must exist. Unless an existing instance is being
/// reused, no key named after the host may exist yet.
///
/// # Errors
///
/// Returns [`PreconditionError::KeyPairMissing`] or
/// [`PreconditionError::KeyPairExists`], or [`DriverError::Backend`] when the
/// lookup fails.
pub async fn check_preconditions<B>(
    backend: &B,
    config: &HostConfig,
) -> Result<(), DriverError<B::Error>>
where
    B: ComputeBackend + ?Sized,
{
    if let Some(name) = config.ssh.key_pair_name.as_deref() {
        let found = backend.key_pair(name).await.map_err(DriverError::Backend)?;
        if found.is_none() {
            return Err(PreconditionError::KeyPairMissing {
                name: name.to_owned(),
            }
            .into());
        }
        return Ok(());
    }
    if config.reuse_existing {
        return Ok(());
    }
    let found = backend
        .key_pair(&config.name)
        .await
        .map_err(DriverError::Backend)?;
    if found.is_some() {
        return Err(PreconditionError::KeyPairExists {
            name: config.name.clone(),
        }
        .into());
    }
    Ok(())
}

/// Produces the key pair the host will trust.
///
/// * A caller-named backend key pair is used as is.
/// * Otherwise the inline public key, the public half of `ssh_key_path`, or
///   a freshly generated key is imported under the host name.
/// * When reusing an instance nothing is imported; the key is injected into
///   the instance later.
///
/// # Errors
///
/// Returns [`DriverError`] when key material cannot be produced or the
/// backend rejects it.
pub async fn provision<B, K>(
    backend: &B,
    generator: &K,
    config: &HostConfig,
) -> Result<KeyPair, DriverError<B::Error>>
where
    B: ComputeBackend + ?Sized,
    K: KeyGenerator + ?Sized,
{
    if let Some(name) = config.ssh.key_pair_name.as_deref() {
        let backend_id = backend
            .key_pair(name)
            .await
            .map_err(DriverError::Backend)?
            .ok_or_else(|| PreconditionError::KeyPairMissing {
                name: name.to_owned(),
            })?;
        let public_key = config
            .ssh
            .key_path
            .as_deref()
            .and_then(companion_public_key);
        debug!(key = name, "using caller supplied key pair");
        return Ok(KeyPair {
            name: name.to_owned(),
            public_key,
            private_key_path: config.ssh.key_path.clone(),
            backend_id: Some(backend_id),
            provenance: KeyProvenance::SuppliedByCaller,
        });
    }

    let (public_key, private_key_path) = match (&config.ssh.public_key, &config.ssh.key_path) {
        (Some(inline), path) => (inline.clone(), path.clone()),
        (None, Some(path)) => (read_public_key(&public_key_path(path))?, Some(path.clone())),
        (None, None) => {
            let path = config.generated_key_path();
            info!(host = %config.name, path = %path, "generating ssh key");
            (generator.generate(&path, &config.name)?, Some(path))
        }
    };

    let backend_id = if config.reuse_existing {
        None
    } else {
        let id = backend
            .import_key_pair(&config.name, &public_key)
            .await
            .map_err(DriverError::Backend)?;
        info!(host = %config.name, key_id = %id, "imported key pair");
        Some(id)
    };

    Ok(KeyPair {
        name: config.name.clone(),
        public_key: Some(public_key),
        private_key_path,
        backend_id,
        provenance: KeyProvenance::CreatedBySystem,
    })
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex, PoisonError};

    use super::*;
    use crate::test_support::ScriptedRunner;
    use tempfile::TempDir;

    fn temp_key_path(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().join("keys/id_ed25519"))
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()))
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLog {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap_or_else(PoisonError::into_inner))
                .into_owned()
        }
    }

    #[test]
    fn unreadable_companion_key_is_logged_not_swallowed() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_key_path(&tmp);
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let key = tracing::subscriber::with_default(subscriber, || companion_public_key(&path));

        assert!(key.is_none());
        let output = log.text();
        assert!(output.contains("public key unreadable"), "log: {output}");
        assert!(output.contains("id_ed25519.pub"), "log: {output}");
    }

    #[test]
    fn companion_key_is_read_when_present() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_key_path(&tmp);
        fs::write(&public_key_path(&path), "ssh-ed25519 AAAADEPLOY ops\n")
            .unwrap_or_else(|err| panic!("seed public key: {err}"));

        assert_eq!(
            companion_public_key(&path).as_deref(),
            Some("ssh-ed25519 AAAADEPLOY ops")
        );
    }

    #[test]
    fn ssh_keygen_reads_the_generated_public_key() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_key_path(&tmp);
        fs::write(&public_key_path(&path), "ssh-ed25519 AAAATEST web-1\n")
            .unwrap_or_else(|err| panic!("seed public key: {err}"));
        let runner = ScriptedRunner::new();
        runner.push_success();

        let key = SshKeygen::new(runner.clone())
            .generate(&path, "web-1")
            .unwrap_or_else(|err| panic!("generate: {err}"));

        assert_eq!(key, "ssh-ed25519 AAAATEST web-1");
        let invocations = runner.invocations();
        let [invocation] = invocations.as_slice() else {
            panic!("expected one invocation, got {invocations:?}");
        };
        assert_eq!(
            invocation.command_string(),
            format!("ssh-keygen -q -t ed25519 -N  -C web-1 -f {path}")
        );
    }

    #[test]
    fn ssh_keygen_surfaces_failures() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let runner = ScriptedRunner::new();
        runner.push_output(Some(1), "", "Saving key failed: Permission denied\n");

        let result = SshKeygen::new(runner).generate(&temp_key_path(&tmp), "web-1");

        assert_eq!(
            result,
            Err(KeyError::Generate(String::from(
                "Saving key failed: Permission denied"
            )))
        );
    }

    #[test]
    fn ssh_keygen_rejects_an_empty_public_key() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_key_path(&tmp);
        fs::write(&public_key_path(&path), "\n")
            .unwrap_or_else(|err| panic!("seed public key: {err}"));
        let runner = ScriptedRunner::new();
        runner.push_success();

        let result = SshKeygen::new(runner).generate(&path, "web-1");

        assert_eq!(result, Err(KeyError::EmptyPublicKey(public_key_path(&path))));
    }

    #[test]
    fn only_system_keys_are_owned() {
        let mut key = KeyPair {
            name: String::from("web-1"),
            public_key: None,
            private_key_path: None,
            backend_id: Some(String::from("key-1")),
            provenance: KeyProvenance::CreatedBySystem,
        };
        assert_eq!(key.owned_backend_id(), Some("key-1"));

        key.provenance = KeyProvenance::SuppliedByCaller;
        assert_eq!(key.owned_backend_id(), None);
    }
}
