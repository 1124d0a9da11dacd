//! RSA key handling and chunked session encryption.
//!
//! Both sides of a dispatch stream hold a 2048-bit RSA pair. Logical call
//! payloads are encrypted under the peer's public key with PKCS#1 v1.5,
//! which caps plaintext at `keysize − 11` bytes per block — so both
//! directions process payloads as successive fixed-size chunks.
//!
//! Keys are stored as PEM: PKCS#8 for private keys, SPKI for public keys.
//! PKCS#1 public PEM is accepted on parse for interoperability.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use sha2::Sha256;

pub use rsa::RsaPublicKey;

use crate::error::{Error, Result};

/// PKCS#1 v1.5 padding overhead per encrypted block.
const PKCS1_OVERHEAD: usize = 11;

/// An RSA key pair plus its PEM renderings.
#[derive(Debug, Clone)]
pub struct RsaPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    private_pem: String,
    public_pem: String,
}

impl RsaPair {
    /// Generates a fresh pair.
    ///
    /// # Errors
    ///
    /// Returns `bad-request` when `bits` is not a multiple of 2048 and
    /// `internal` when key generation or PEM encoding fails.
    pub fn generate(bits: usize) -> Result<Self> {
        if bits == 0 || bits % 2048 != 0 {
            return Err(Error::bad_request("rsa bits must be a multiple of 2048"));
        }
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| Error::internal(format!("generate rsa key: {e}")))?;
        Self::from_private(private)
    }

    /// Wraps an existing private key, deriving the public half.
    fn from_private(private: RsaPrivateKey) -> Result<Self> {
        let public = private.to_public_key();
        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::internal(format!("encode private pem: {e}")))?
            .to_string();
        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::internal(format!("encode public pem: {e}")))?;
        Ok(Self {
            private,
            public,
            private_pem,
            public_pem,
        })
    }

    /// Parses a pair from PEM text.
    ///
    /// # Errors
    ///
    /// Returns `internal` when the private PEM is not PKCS#8 or PKCS#1.
    pub fn from_pem(private_pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(private_pem)
            .or_else(|_| rsa::pkcs1::DecodeRsaPrivateKey::from_pkcs1_pem(private_pem))
            .map_err(|e: rsa::pkcs1::Error| {
                Error::internal(format!("parse private pem: {e}"))
            })?;
        Self::from_private(private)
    }

    /// Loads `<stem>.pem`/`<stem>.pub` from `dir`, generating and
    /// persisting a fresh 2048-bit pair when either file is missing.
    ///
    /// Written files get mode 0600 and the directory 0700.
    ///
    /// # Errors
    ///
    /// Returns `internal` on filesystem or key-codec failures.
    pub fn load_or_generate(dir: &Path, stem: &str) -> Result<Self> {
        let pem_path = dir.join(format!("{stem}.pem"));
        let pub_path = dir.join(format!("{stem}.pub"));

        if pem_path.exists() && pub_path.exists() {
            let private_pem = fs::read_to_string(&pem_path)?;
            return Self::from_pem(&private_pem);
        }

        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;

        let pair = Self::generate(2048)?;
        write_secret(&pem_path, pair.private_pem.as_bytes())?;
        write_secret(&pub_path, pair.public_pem.as_bytes())?;
        tracing::info!(
            private = %pem_path.display(),
            public = %pub_path.display(),
            "generated rsa pair"
        );
        Ok(pair)
    }

    /// The PEM rendering of the public key.
    #[must_use]
    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    /// The PEM rendering of the private key.
    #[must_use]
    pub fn private_pem(&self) -> &str {
        &self.private_pem
    }

    /// The parsed public key.
    #[must_use]
    pub const fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Decrypts a chunked ciphertext with the private key.
    ///
    /// # Errors
    ///
    /// Returns `internal` when any block fails to decrypt.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let chunk = self.private.size();
        let mut plaintext = Vec::with_capacity(ciphertext.len());
        for (i, block) in ciphertext.chunks(chunk).enumerate() {
            let part = self
                .private
                .decrypt(Pkcs1v15Encrypt, block)
                .map_err(|e| Error::internal(format!("decrypt block {i}: {e}")))?;
            plaintext.extend_from_slice(&part);
        }
        Ok(plaintext)
    }

    /// Signs `message` (SHA-256, PKCS#1 v1.5) with the private key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signer = SigningKey::<Sha256>::new(self.private.clone());
        signer.sign(message).to_vec()
    }
}

/// Parses a public key from PEM, accepting SPKI and PKCS#1 forms.
///
/// # Errors
///
/// Returns `internal` when the text is neither.
pub fn parse_public_pem(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| Error::internal(format!("parse public pem: {e}")))
}

/// Encrypts `plaintext` under `key`, one PKCS#1 v1.5 block per
/// `keysize − 11` bytes of input.
///
/// # Errors
///
/// Returns `internal` when any block fails to encrypt.
pub fn encrypt(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let chunk = key.size() - PKCS1_OVERHEAD;
    let mut rng = rand::thread_rng();
    let mut ciphertext = Vec::with_capacity(plaintext.len() + key.size());
    for (i, block) in plaintext.chunks(chunk).enumerate() {
        let part = key
            .encrypt(&mut rng, Pkcs1v15Encrypt, block)
            .map_err(|e| Error::internal(format!("encrypt block {i}: {e}")))?;
        ciphertext.extend_from_slice(&part);
    }
    Ok(ciphertext)
}

/// Verifies a SHA-256 PKCS#1 v1.5 signature against `key`.
///
/// # Errors
///
/// Returns `unauthorized` when the signature does not match.
pub fn verify(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> Result<()> {
    let verifier = VerifyingKey::<Sha256>::new(key.clone());
    let signature = Signature::try_from(signature)
        .map_err(|e| Error::unauthorized(format!("malformed signature: {e}")))?;
    verifier
        .verify(message, &signature)
        .map_err(|_| Error::unauthorized("signature verification failed"))
}

fn write_secret(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}
