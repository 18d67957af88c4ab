//! The managed key pair used to authenticate against every agent host.
//!
//! A single Ed25519 pair lives in the data directory as `id_ed25519` (0600)
//! and `id_ed25519.pub` (0644). Rotation backs both files up with an `.old`
//! suffix before overwriting them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use ssh_key::{Algorithm, HashAlg, LineEnding, PrivateKey};

use crate::error::{LinkError, Result};

/// In-memory signing key handed to the SSH client.
pub type Signer = Arc<russh_keys::PrivateKey>;

const PRIVATE_KEY_FILE: &str = "id_ed25519";
const BACKUP_SUFFIX: &str = "old";

/// An OpenSSH encoded key pair plus its SHA256 fingerprint.
#[derive(Clone)]
pub struct KeyPair {
    private_openssh: String,
    public_openssh: String,
    fingerprint: String,
}

impl KeyPair {
    /// Generate a fresh Ed25519 pair without a passphrase.
    pub fn generate() -> Result<Self> {
        let private_key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
            .map_err(|e| LinkError::Key(format!("Failed to generate SSH key: {}", e)))?;
        Self::from_private(&private_key)
    }

    /// Parse an unencrypted OpenSSH private key.
    pub fn from_openssh(private_openssh: &str) -> Result<Self> {
        let private_key = PrivateKey::from_openssh(private_openssh)
            .map_err(|e| LinkError::Key(format!("Failed to parse private key: {}", e)))?;
        if private_key.is_encrypted() {
            return Err(LinkError::Key(
                "Managed key must not be passphrase protected".to_string(),
            ));
        }
        Self::from_private(&private_key)
    }

    fn from_private(private_key: &PrivateKey) -> Result<Self> {
        let private_openssh = private_key
            .to_openssh(LineEnding::LF)
            .map_err(|e| LinkError::Key(format!("Failed to encode private key: {}", e)))?;

        let public_key = private_key.public_key();
        let public_openssh = public_key
            .to_openssh()
            .map_err(|e| LinkError::Key(format!("Failed to encode public key: {}", e)))?;

        Ok(Self {
            private_openssh: private_openssh.as_str().to_owned(),
            public_openssh,
            fingerprint: public_key.fingerprint(HashAlg::Sha256).to_string(),
        })
    }

    /// Public key as a single `authorized_keys` line.
    pub fn public_key(&self) -> &str {
        &self.public_openssh
    }

    /// `SHA256:...` fingerprint.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn private_openssh(&self) -> &str {
        &self.private_openssh
    }

    /// Decode the private key into a signer the SSH client can use.
    pub fn signer(&self) -> Result<Signer> {
        let key = russh_keys::decode_secret_key(&self.private_openssh, None)
            .map_err(|e| LinkError::Key(format!("Failed to load signing key: {}", e)))?;
        Ok(Arc::new(key))
    }

    pub fn identity(&self) -> Result<Identity> {
        Ok(Identity {
            signer: self.signer()?,
            public_key: self.public_openssh.clone(),
            fingerprint: self.fingerprint.clone(),
        })
    }

    /// Check the pair survives an encode/decode round trip and yields a signer.
    pub fn validate(&self) -> Result<()> {
        let reparsed = Self::from_openssh(&self.private_openssh)?;
        if reparsed.public_openssh != self.public_openssh
            || reparsed.fingerprint != self.fingerprint
        {
            return Err(LinkError::Key(
                "Key pair does not survive an OpenSSH round trip".to_string(),
            ));
        }
        self.signer().map(|_| ())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// What a dial needs to authenticate: the signer plus the public half it
/// proves possession of.
#[derive(Clone)]
pub struct Identity {
    pub signer: Signer,
    pub public_key: String,
    pub fingerprint: String,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

struct LoadedKey {
    pair: KeyPair,
    identity: Identity,
}

impl LoadedKey {
    fn new(pair: KeyPair) -> Result<Self> {
        let identity = pair.identity()?;
        Ok(Self { pair, identity })
    }
}

/// Owner of the on-disk key pair and its in-memory signer.
pub struct KeyStore {
    dir: PathBuf,
    current: RwLock<Arc<LoadedKey>>,
}

impl KeyStore {
    /// Open the store in `dir`, generating a pair on first use.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            LinkError::Key(format!("Failed to create key directory {}: {}", dir.display(), e))
        })?;

        let private_path = dir.join(PRIVATE_KEY_FILE);
        let pair = if private_path.exists() {
            read_pair(&private_path)?
        } else {
            let pair = KeyPair::generate()?;
            write_pair(&dir, &pair)?;
            tracing::info!(
                "Generated new managed SSH key at {} ({})",
                private_path.display(),
                pair.fingerprint()
            );
            pair
        };

        Ok(Self {
            current: RwLock::new(Arc::new(LoadedKey::new(pair)?)),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.dir.join(PRIVATE_KEY_FILE)
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.dir.join(format!("{}.pub", PRIVATE_KEY_FILE))
    }

    fn backup_paths(&self) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{}.{}", PRIVATE_KEY_FILE, BACKUP_SUFFIX)),
            self.dir.join(format!("{}.pub.{}", PRIVATE_KEY_FILE, BACKUP_SUFFIX)),
        )
    }

    pub fn public_key(&self) -> String {
        self.current.read().pair.public_key().to_string()
    }

    pub fn fingerprint(&self) -> String {
        self.current.read().pair.fingerprint().to_string()
    }

    pub fn identity(&self) -> Identity {
        self.current.read().identity.clone()
    }

    /// Write `pair` to disk and make it the live key.
    pub fn install(&self, pair: &KeyPair) -> Result<()> {
        let loaded = LoadedKey::new(pair.clone())?;
        write_pair(&self.dir, pair)?;
        *self.current.write() = Arc::new(loaded);
        Ok(())
    }

    /// Copy the live files to their `.old` backups.
    pub fn backup(&self) -> Result<()> {
        let (private_backup, public_backup) = self.backup_paths();
        copy_file(&self.private_key_path(), &private_backup)?;
        copy_file(&self.public_key_path(), &public_backup)?;
        set_mode(&private_backup, 0o600)?;
        Ok(())
    }

    pub fn has_backup(&self) -> bool {
        let (private_backup, public_backup) = self.backup_paths();
        private_backup.exists() || public_backup.exists()
    }

    /// Move the backups back over the live files and reload the signer.
    pub fn restore_backup(&self) -> Result<()> {
        let (private_backup, public_backup) = self.backup_paths();
        if !private_backup.exists() {
            return Err(LinkError::Key("No key backup to restore".to_string()));
        }
        rename_file(&private_backup, &self.private_key_path())?;
        if public_backup.exists() {
            rename_file(&public_backup, &self.public_key_path())?;
        }
        self.reload()
    }

    pub fn remove_backup(&self) -> Result<()> {
        let (private_backup, public_backup) = self.backup_paths();
        for path in [private_backup, public_backup] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(LinkError::Key(format!(
                        "Failed to remove {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
        Ok(())
    }

    /// Re-read the private key from disk.
    pub fn reload(&self) -> Result<()> {
        let pair = read_pair(&self.private_key_path())?;
        *self.current.write() = Arc::new(LoadedKey::new(pair)?);
        Ok(())
    }
}

/// Load a user-supplied, unencrypted private key file.
pub fn load_key_file(path: impl AsRef<Path>) -> Result<Identity> {
    let path = path.as_ref();
    let expanded = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref());

    read_pair(&expanded)
        .and_then(|pair| pair.identity())
        .map_err(|e| LinkError::Key(format!("{}: {}", expanded.display(), e)))
}

/// SHA256 fingerprint of a private or public key file.
pub fn key_fingerprint(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();

    let key_data = std::fs::read_to_string(path).map_err(|e| {
        LinkError::Key(format!("Failed to read key file {}: {}", path.display(), e))
    })?;

    if let Ok(private_key) = PrivateKey::from_openssh(&key_data) {
        return Ok(private_key.public_key().fingerprint(HashAlg::Sha256).to_string());
    }

    if let Ok(public_key) = ssh_key::PublicKey::from_openssh(key_data.trim()) {
        return Ok(public_key.fingerprint(HashAlg::Sha256).to_string());
    }

    Err(LinkError::Key(format!(
        "Failed to parse SSH key from {}",
        path.display()
    )))
}

fn read_pair(private_path: &Path) -> Result<KeyPair> {
    let content = std::fs::read_to_string(private_path).map_err(|e| {
        LinkError::Key(format!("Failed to read {}: {}", private_path.display(), e))
    })?;
    KeyPair::from_openssh(&content)
}

fn write_pair(dir: &Path, pair: &KeyPair) -> Result<()> {
    let private_path = dir.join(PRIVATE_KEY_FILE);
    let public_path = dir.join(format!("{}.pub", PRIVATE_KEY_FILE));

    std::fs::write(&private_path, pair.private_openssh().as_bytes())
        .map_err(|e| LinkError::Key(format!("Failed to write private key: {}", e)))?;
    set_mode(&private_path, 0o600)?;

    std::fs::write(&public_path, format!("{}\n", pair.public_key()))
        .map_err(|e| LinkError::Key(format!("Failed to write public key: {}", e)))?;
    set_mode(&public_path, 0o644)?;

    Ok(())
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    std::fs::copy(from, to).map(|_| ()).map_err(|e| {
        LinkError::Key(format!(
            "Failed to copy {} to {}: {}",
            from.display(),
            to.display(),
            e
        ))
    })
}

fn rename_file(from: &Path, to: &Path) -> Result<()> {
    std::fs::rename(from, to).map_err(|e| {
        LinkError::Key(format!(
            "Failed to move {} to {}: {}",
            from.display(),
            to.display(),
            e
        ))
    })
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| LinkError::Key(format!("Failed to set key permissions: {}", e)))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
