//! Single-file authenticated encryption
//!
//! Layout of an encrypted file (all integers big-endian):
//!
//! ```text
//! [u16 name length][name bytes][16-byte salt][12-byte nonce][ciphertext + 16-byte tag]
//! ```
//!
//! The key is derived with Argon2id (t=1, m=64 MiB, p=4) and the content is
//! sealed with AES-256-GCM. The length-prefixed name is the associated data,
//! so tampering with the stored name fails authentication.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use tracing::debug;
use zeroize::Zeroizing;

use crate::errors::{VfsError, VfsResult};

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

/// Argon2id cost: 64 MiB, 1 pass, 4 lanes
const KDF_MEMORY_KIB: u32 = 64 * 1024;
const KDF_ITERATIONS: u32 = 1;
const KDF_PARALLELISM: u32 = 4;

/// Extension given to encrypted files by default
pub const ENCRYPTED_EXTENSION: &str = "enc";

/// Derive the content key from a passphrase and salt
fn derive_key(passphrase: &str, salt: &[u8]) -> VfsResult<Zeroizing<[u8; KEY_LEN]>> {
    let params = Params::new(KDF_MEMORY_KIB, KDF_ITERATIONS, KDF_PARALLELISM, Some(KEY_LEN))
        .map_err(|e| VfsError::InvalidFormat(format!("key derivation parameters: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut *key)
        .map_err(|e| VfsError::InvalidFormat(format!("key derivation: {}", e)))?;
    Ok(key)
}

/// Length-prefixed file name, also used as associated data
fn encode_header(name: &str) -> VfsResult<Vec<u8>> {
    let len = u16::try_from(name.len())
        .map_err(|_| VfsError::InvalidFormat(format!("file name too long: {}", name)))?;
    let mut header = Vec::with_capacity(2 + name.len());
    header.extend_from_slice(&len.to_be_bytes());
    header.extend_from_slice(name.as_bytes());
    Ok(header)
}

/// Borrowed view of an encrypted file's fields
struct Sealed<'a> {
    header: &'a [u8],
    name: &'a str,
    salt: &'a [u8],
    nonce: &'a [u8],
    ciphertext: &'a [u8],
}

fn parse(data: &[u8]) -> VfsResult<Sealed<'_>> {
    let invalid = || VfsError::InvalidFormat("not an encrypted file".to_string());

    let len_bytes: [u8; 2] = data.get(..2).ok_or_else(invalid)?.try_into().map_err(|_| invalid())?;
    let offset = 2 + u16::from_be_bytes(len_bytes) as usize;
    if data.len() < offset + SALT_LEN + NONCE_LEN {
        return Err(invalid());
    }

    let name = std::str::from_utf8(&data[2..offset])
        .map_err(|_| VfsError::InvalidFormat("stored file name is not UTF-8".to_string()))?;

    Ok(Sealed {
        header: &data[..offset],
        name,
        salt: &data[offset..offset + SALT_LEN],
        nonce: &data[offset + SALT_LEN..offset + SALT_LEN + NONCE_LEN],
        ciphertext: &data[offset + SALT_LEN + NONCE_LEN..],
    })
}

/// The stored name must be a single plain component
fn check_stored_name(name: &str) -> VfsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(VfsError::PathTraversal(name.to_string()));
    }
    Ok(())
}

/// Encrypt `source` into `destination`, recording the source's file name
pub fn encrypt_file(source: &Path, destination: &Path, passphrase: &str) -> VfsResult<()> {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| VfsError::InvalidFormat(format!("{} has no file name", source.display())))?;
    let header = encode_header(&name)?;
    let plaintext = Zeroizing::new(fs::read(source)?);

    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let key = derive_key(passphrase, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&*key)
        .map_err(|_| VfsError::InvalidFormat("invalid key length".to_string()))?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &plaintext,
                aad: &header,
            },
        )
        .map_err(|_| VfsError::InvalidFormat(format!("{} is too large to encrypt", source.display())))?;

    let mut out = fs::File::create(destination)?;
    out.write_all(&header)?;
    out.write_all(&salt)?;
    out.write_all(&nonce)?;
    out.write_all(&ciphertext)?;
    out.flush()?;

    debug!("Encrypted {} -> {}", source.display(), destination.display());
    Ok(())
}

/// Decrypt `source` into `destination_dir` under its original name.
///
/// Returns that name. The plaintext is written owner-readable only (0600).
/// A wrong passphrase and a corrupted file both yield [`VfsError::DecryptionFailed`].
pub fn decrypt_file(source: &Path, destination_dir: &Path, passphrase: &str) -> VfsResult<String> {
    let data = fs::read(source)?;
    let sealed = parse(&data)?;
    check_stored_name(sealed.name)?;

    let key = derive_key(passphrase, sealed.salt)?;
    let cipher = Aes256Gcm::new_from_slice(&*key)
        .map_err(|_| VfsError::InvalidFormat("invalid key length".to_string()))?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(sealed.nonce),
                Payload {
                    msg: sealed.ciphertext,
                    aad: sealed.header,
                },
            )
            .map_err(|_| VfsError::DecryptionFailed)?,
    );

    let target = destination_dir.join(sealed.name);
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut out = options.open(&target)?;
    // The creation mode does not apply to a file that already existed
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        out.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    out.write_all(&plaintext)?;
    out.flush()?;

    debug!("Decrypted {} -> {}", source.display(), target.display());
    Ok(sealed.name.to_string())
}

/// Default output path for encrypting `source`: `<source>.enc`
pub fn default_encrypted_name(source: &Path) -> PathBuf {
    let mut name = source.as_os_str().to_os_string();
    name.push(".");
    name.push(ENCRYPTED_EXTENSION);
    PathBuf::from(name)
}
