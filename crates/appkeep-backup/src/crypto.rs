//! Optional encryption layer around archive byte streams.
//!
//! The stored crypto-mode tag selects the transform, and each mode uses the
//! age format with its own kind of key:
//!
//! - `none`: identity
//! - `aes`: symmetric, the stream key is derived from a passphrase (scrypt)
//! - `ecc`: public key, sealed to the X25519 recipient of an age identity
//!
//! `rsa` and `pgp` are recognized tags whose transforms are not available;
//! selecting them fails with [`Error::UnsupportedCryptoMode`] so their
//! instances stay readable as records but are never half-decoded.

use age::secrecy::{ExposeSecret, SecretString};
use appkeep_core::{Error, Result};
use std::fmt;
use std::io::{self, Read, Write};
use std::iter;
use std::path::Path;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Encryption mode recorded in Info
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CryptoMode {
    #[default]
    None,
    Aes,
    Rsa,
    Ecc,
    OpenPgp,
}

impl CryptoMode {
    /// Parses a stored mode tag.
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "none" => Ok(Self::None),
            "aes" => Ok(Self::Aes),
            "rsa" => Ok(Self::Rsa),
            "ecc" => Ok(Self::Ecc),
            "pgp" => Ok(Self::OpenPgp),
            other => Err(Error::unsupported_crypto_mode(other)),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Aes => "aes",
            Self::Rsa => "rsa",
            Self::Ecc => "ecc",
            Self::OpenPgp => "pgp",
        }
    }

    /// Suffix appended to archive file names
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Aes => ".aes",
            Self::Rsa => ".rsa",
            Self::Ecc => ".ecc",
            Self::OpenPgp => ".gpg",
        }
    }

    pub fn is_encrypted(&self) -> bool {
        *self != Self::None
    }

    /// True when this engine can seal and open streams of this mode.
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::None | Self::Aes | Self::Ecc)
    }
}

impl fmt::Display for CryptoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Key material for one encrypted mode.
pub enum ArchiveKey {
    /// Passphrase for `aes`; scrypt derives the stream key from it
    Passphrase {
        passphrase: Zeroizing<String>,
        /// log2 of the scrypt cost when sealing; age picks one when unset
        work_factor: Option<u8>,
    },

    /// Identity for `ecc`; streams are sealed to its public recipient
    Identity(age::x25519::Identity),
}

impl ArchiveKey {
    pub fn passphrase(passphrase: impl Into<String>) -> Self {
        Self::Passphrase {
            passphrase: Zeroizing::new(passphrase.into()),
            work_factor: None,
        }
    }

    /// Lowers or raises the scrypt cost of new `aes` streams.
    pub fn with_work_factor(self, log_n: u8) -> Self {
        match self {
            Self::Passphrase { passphrase, .. } => Self::Passphrase {
                passphrase,
                work_factor: Some(log_n),
            },
            other => other,
        }
    }

    /// Generates a fresh X25519 identity.
    pub fn generate_identity() -> Self {
        Self::Identity(age::x25519::Identity::generate())
    }

    /// Parses an `AGE-SECRET-KEY-1...` string.
    pub fn from_identity_str(value: &str) -> Result<Self> {
        value
            .trim()
            .parse::<age::x25519::Identity>()
            .map(Self::Identity)
            .map_err(|e| Error::key_unavailable(CryptoMode::Ecc.tag(), format!("invalid identity: {}", e)))
    }

    /// Reads an age identity file; `#` lines are comments.
    pub fn from_key_file(path: &Path) -> Result<Self> {
        let content = Zeroizing::new(std::fs::read_to_string(path)?);
        let line = content
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .ok_or_else(|| {
                Error::key_unavailable(CryptoMode::Ecc.tag(), format!("no identity in {:?}", path))
            })?;
        Self::from_identity_str(line)
    }

    /// The mode this key serves
    pub fn mode(&self) -> CryptoMode {
        match self {
            Self::Passphrase { .. } => CryptoMode::Aes,
            Self::Identity(_) => CryptoMode::Ecc,
        }
    }

    /// Secret identity string, for writing key files.
    pub fn identity_string(&self) -> Option<Zeroizing<String>> {
        match self {
            Self::Identity(identity) => {
                Some(Zeroizing::new(identity.to_string().expose_secret().to_string()))
            }
            Self::Passphrase { .. } => None,
        }
    }

    /// Public recipient string of an identity key.
    pub fn recipient_string(&self) -> Option<String> {
        match self {
            Self::Identity(identity) => Some(identity.to_public().to_string()),
            Self::Passphrase { .. } => None,
        }
    }

    fn secret(passphrase: &str) -> SecretString {
        SecretString::from(passphrase.to_string())
    }

    fn encryptor(&self) -> io::Result<age::Encryptor> {
        let encryptor = match self {
            Self::Passphrase {
                passphrase,
                work_factor,
            } => {
                let mut recipient = age::scrypt::Recipient::new(Self::secret(passphrase));
                if let Some(log_n) = work_factor {
                    recipient.set_work_factor(*log_n);
                }
                age::Encryptor::with_recipients(iter::once(&recipient as &dyn age::Recipient))
            }
            Self::Identity(identity) => {
                let recipient = identity.to_public();
                age::Encryptor::with_recipients(iter::once(&recipient as &dyn age::Recipient))
            }
        };
        encryptor.map_err(|e| io::Error::other(format!("Encryption setup failed: {}", e)))
    }

    fn decrypt<R: Read>(&self, decryptor: age::Decryptor<R>) -> io::Result<age::stream::StreamReader<R>> {
        let opened = match self {
            Self::Passphrase { passphrase, .. } => {
                let identity = age::scrypt::Identity::new(Self::secret(passphrase));
                decryptor.decrypt(iter::once(&identity as &dyn age::Identity))
            }
            Self::Identity(identity) => decryptor.decrypt(iter::once(identity as &dyn age::Identity)),
        };
        opened.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("Decryption failed: {}", e)))
    }
}

impl fmt::Debug for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchiveKey({})", self.mode())
    }
}

/// External key-store collaborator handing out keys per mode.
pub trait KeyProvider: Send + Sync {
    fn archive_key(&self, mode: CryptoMode) -> Result<Arc<ArchiveKey>>;
}

/// Holds at most one passphrase and one identity.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyProvider {
    passphrase: Option<Arc<ArchiveKey>>,
    identity: Option<Arc<ArchiveKey>>,
}

impl StaticKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `key` in the slot of the mode it serves.
    pub fn with_key(mut self, key: ArchiveKey) -> Self {
        match key.mode() {
            CryptoMode::Aes => self.passphrase = Some(Arc::new(key)),
            _ => self.identity = Some(Arc::new(key)),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.passphrase.is_none() && self.identity.is_none()
    }
}

impl KeyProvider for StaticKeyProvider {
    fn archive_key(&self, mode: CryptoMode) -> Result<Arc<ArchiveKey>> {
        let slot = match mode {
            CryptoMode::Aes => &self.passphrase,
            CryptoMode::Ecc => &self.identity,
            other => return Err(Error::unsupported_crypto_mode(other.tag())),
        };
        slot.clone()
            .ok_or_else(|| Error::key_unavailable(mode.tag(), "no key configured for this mode"))
    }
}

/// Selected transform for one instance.
#[derive(Debug, Clone)]
pub struct CryptoCodec {
    mode: CryptoMode,
    key: Option<Arc<ArchiveKey>>,
}

impl CryptoCodec {
    /// Identity transform
    pub fn none() -> Self {
        Self {
            mode: CryptoMode::None,
            key: None,
        }
    }

    /// Selects the transform for a stored tag.
    pub fn for_tag(tag: &str, keys: Option<&dyn KeyProvider>) -> Result<Self> {
        Self::for_mode(CryptoMode::from_tag(tag)?, keys)
    }

    /// Selects the transform for `mode`, fetching its key when one is needed.
    pub fn for_mode(mode: CryptoMode, keys: Option<&dyn KeyProvider>) -> Result<Self> {
        if !mode.is_encrypted() {
            return Ok(Self::none());
        }
        if !mode.is_supported() {
            return Err(Error::unsupported_crypto_mode(mode.tag()));
        }
        let provider = keys.ok_or_else(|| {
            Error::key_unavailable(mode.tag(), "no key provider configured")
        })?;
        let key = provider.archive_key(mode)?;
        if key.mode() != mode {
            return Err(Error::key_unavailable(
                mode.tag(),
                format!("provider returned a key for {}", key.mode()),
            ));
        }
        Ok(Self {
            mode,
            key: Some(key),
        })
    }

    pub fn mode(&self) -> CryptoMode {
        self.mode
    }

    /// Wraps a writer so that everything written through it is sealed.
    pub fn seal<W: Write>(&self, writer: W) -> io::Result<CipherWriter<W>> {
        match &self.key {
            None => Ok(CipherWriter::Plain(writer)),
            Some(key) => Ok(CipherWriter::Sealed(key.encryptor()?.wrap_output(writer)?)),
        }
    }

    /// Wraps a reader so that sealed content is opened while reading.
    ///
    /// The age header is read here, so a wrong key fails before any
    /// payload byte is produced.
    pub fn open<R: Read>(&self, reader: R) -> io::Result<CipherReader<R>> {
        match &self.key {
            None => Ok(CipherReader::Plain(reader)),
            Some(key) => {
                let decryptor = age::Decryptor::new(reader).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("Not an encrypted stream: {}", e))
                })?;
                Ok(CipherReader::Sealed(key.decrypt(decryptor)?))
            }
        }
    }
}

/// Writer side of [`CryptoCodec`].
pub enum CipherWriter<W: Write> {
    Plain(W),
    Sealed(age::stream::StreamWriter<W>),
}

impl<W: Write> CipherWriter<W> {
    /// Emits the final chunk and hands back the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(mut writer) => {
                writer.flush()?;
                Ok(writer)
            }
            Self::Sealed(writer) => writer.finish(),
        }
    }
}

impl<W: Write> Write for CipherWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(writer) => writer.write(buf),
            Self::Sealed(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(writer) => writer.flush(),
            Self::Sealed(writer) => writer.flush(),
        }
    }
}

/// Reader side of [`CryptoCodec`].
pub enum CipherReader<R: Read> {
    Plain(R),
    Sealed(age::stream::StreamReader<R>),
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(reader) => reader.read(buf),
            Self::Sealed(reader) => reader.read(buf),
        }
    }
}
