//! Public-key envelope sealing a snapshot stream for a recipient.
//!
//! A snapshot is sealed by encapsulating a fresh symmetric key to the
//! recipient's X25519 public key (ephemeral Diffie-Hellman) and encrypting
//! the byte stream with AES-256-GCM-SIV in STREAM-LE31 mode. The envelope
//! header, written ahead of the ciphertext, carries the ephemeral public key
//! and the stream nonce; holders of the matching secret key recover the
//! symmetric key from the header alone.
//!
//! Ciphertext framing: the stream is cut into messages of roughly
//! [`APPROX_MESSAGE_SIZE`] plaintext bytes, each sealed separately and
//! prefixed with its 4-byte little-endian ciphertext length. The final
//! message carries the length sentinel `u32::MAX` and extends to the end of
//! the stream.

use aead::{
    generic_array::GenericArray,
    stream::{DecryptorLE31, EncryptorLE31, Nonce, StreamLE31},
    Aead, Key, KeyInit,
};
use aes_gcm_siv::Aes256GcmSiv;
use anyhow::{anyhow, bail, Context};
use fs_err as fs;
use fs_err::os::unix::fs::OpenOptionsExt;
use rand::{CryptoRng, RngCore};
use std::io::{self, Read, Write};
use std::path::Path;
use x25519_dalek::StaticSecret;

use crate::KiB;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SECRET_KEY_LEN: usize = 32;
const STREAM_NONCE_LEN: usize = 8;
pub const HEADER_LEN: usize = PUBLIC_KEY_LEN + STREAM_NONCE_LEN;

const APPROX_MESSAGE_SIZE: usize = 128 * KiB;
const LENGTH_PREFIX_LEN: usize = 4;
const EOF_INDICATOR: u32 = u32::MAX;

const KEY_CONTEXT: &str = "palimpsest snapshot envelope v1";

const KEYFILE_SALT_LEN: usize = 16;
const KEYFILE_NONCE_LEN: usize = 12;

pub type SymmetricKey = Key<Aes256GcmSiv>;
type StreamNonce = Nonce<Aes256GcmSiv, StreamLE31<Aes256GcmSiv>>;

/// Recipient public key for sealing snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }
}

/// Secret key unlocking sealed snapshots.
#[derive(Clone)]
pub struct SecretKey([u8; SECRET_KEY_LEN]);

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SecretKey").field(&"[redacted]").finish()
    }
}

impl SecretKey {
    pub fn from_bytes(bytes: [u8; SECRET_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }
}

/// Envelope header written ahead of the ciphertext:
/// ephemeral public key followed by the stream nonce.
#[derive(Debug, Clone)]
pub struct Header([u8; HEADER_LEN]);

impl Header {
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    fn ephemeral(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.0[..PUBLIC_KEY_LEN].try_into().unwrap()
    }

    fn stream_nonce(&self) -> StreamNonce {
        let nonce: [u8; STREAM_NONCE_LEN] = self.0[PUBLIC_KEY_LEN..].try_into().unwrap();
        GenericArray::from(nonce)
    }
}

/// Generates a fresh recipient keypair.
pub fn generate_keypair(csprng: &mut (impl RngCore + CryptoRng)) -> (PublicKey, SecretKey) {
    let secret = StaticSecret::random_from_rng(&mut *csprng);
    let public = x25519_dalek::PublicKey::from(&secret);
    (PublicKey(public.to_bytes()), SecretKey(secret.to_bytes()))
}

fn derive_symmetric_key(shared_secret: &[u8; 32]) -> SymmetricKey {
    GenericArray::from(blake3::derive_key(KEY_CONTEXT, shared_secret))
}

/// Produces a fresh envelope header and the symmetric key it encapsulates
/// for the holder of `public_key`.
pub fn encapsulate(
    csprng: &mut (impl RngCore + CryptoRng),
    public_key: &PublicKey,
) -> (Header, SymmetricKey) {
    let ephemeral = x25519_dalek::EphemeralSecret::random_from_rng(&mut *csprng);
    let ephemeral_pub = x25519_dalek::PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&x25519_dalek::PublicKey::from(public_key.0));
    let key = derive_symmetric_key(shared.as_bytes());

    let mut header = [0u8; HEADER_LEN];
    header[..PUBLIC_KEY_LEN].copy_from_slice(ephemeral_pub.as_bytes());
    csprng.fill_bytes(&mut header[PUBLIC_KEY_LEN..]);
    (Header(header), key)
}

/// Recovers the symmetric key from an envelope header.
pub fn decapsulate(header: &Header, secret_key: &SecretKey) -> SymmetricKey {
    let secret = StaticSecret::from(secret_key.0);
    let ephemeral = x25519_dalek::PublicKey::from(header.ephemeral());
    derive_symmetric_key(secret.diffie_hellman(&ephemeral).as_bytes())
}

/// Reads an envelope header from the start of a sealed stream.
pub fn read_header(mut reader: impl Read) -> io::Result<Header> {
    let mut bytes = [0u8; HEADER_LEN];
    reader.read_exact(&mut bytes)?;
    Ok(Header(bytes))
}

/// Writes the header to `dest`, then encrypts everything read from `src`.
/// Returns the number of plaintext bytes consumed.
pub fn encrypt(
    mut dest: impl Write,
    mut src: impl Read,
    header: &Header,
    key: &SymmetricKey,
) -> io::Result<u64> {
    dest.write_all(header.bytes())?;
    let mut sealer = SealWriter::new(dest, key, &header.stream_nonce());
    let copied = io::copy(&mut src, &mut sealer)?;
    sealer.finish()?;
    Ok(copied)
}

/// Decrypts everything read from `src` into `dest`. The caller must already
/// have consumed the envelope header from `src` and pass it here.
pub fn decrypt(
    mut dest: impl Write,
    src: impl Read,
    header: &Header,
    key: &SymmetricKey,
) -> io::Result<u64> {
    let mut opener = SealReader::new(src, key, &header.stream_nonce());
    io::copy(&mut opener, &mut dest)
}

fn crypto_error(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_owned())
}

/// Sealing half of the symmetric stream: buffers plaintext into messages and
/// writes each sealed message to the underlying writer.
struct SealWriter<W> {
    inner: W,
    encryptor: Option<EncryptorLE31<Aes256GcmSiv>>,
    buffer: Vec<u8>,
}

impl<W: Write> SealWriter<W> {
    fn new(inner: W, key: &SymmetricKey, nonce: &StreamNonce) -> Self {
        Self {
            inner,
            encryptor: Some(EncryptorLE31::new(key, nonce)),
            buffer: Vec::new(),
        }
    }

    fn flush_message(&mut self, is_last: bool) -> io::Result<()> {
        let result = if is_last {
            let encryptor = self.encryptor.take().expect("stream already finished");
            encryptor.encrypt_last_in_place(&[], &mut self.buffer)
        } else {
            let encryptor = self.encryptor.as_mut().expect("stream already finished");
            encryptor.encrypt_next_in_place(&[], &mut self.buffer)
        };
        result.map_err(|_| crypto_error("stream encryption failed"))?;

        let length = if is_last {
            EOF_INDICATOR
        } else {
            u32::try_from(self.buffer.len()).expect("message exceeds length prefix")
        };
        self.inner.write_all(&length.to_le_bytes())?;
        self.inner.write_all(&self.buffer)?;
        self.buffer.clear();
        Ok(())
    }

    fn finish(mut self) -> io::Result<W> {
        self.flush_message(true)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for SealWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= APPROX_MESSAGE_SIZE {
            self.flush_message(false)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_message(false)?;
        self.inner.flush()
    }
}

/// Opening half of the symmetric stream: reads sealed messages from the
/// underlying reader and hands out plaintext.
struct SealReader<R> {
    inner: R,
    decryptor: Option<DecryptorLE31<Aes256GcmSiv>>,
    plain: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read> SealReader<R> {
    fn new(inner: R, key: &SymmetricKey, nonce: &StreamNonce) -> Self {
        Self {
            inner,
            decryptor: Some(DecryptorLE31::new(key, nonce)),
            plain: Vec::new(),
            pos: 0,
            done: false,
        }
    }

    /// Reads and opens the next sealed message into `self.plain`.
    fn fill(&mut self) -> io::Result<()> {
        let mut length = [0u8; LENGTH_PREFIX_LEN];
        self.inner.read_exact(&mut length)?;
        let length = u32::from_le_bytes(length);

        let mut ciphertext = Vec::new();
        let decrypted = if length == EOF_INDICATOR {
            self.inner.read_to_end(&mut ciphertext)?;
            let decryptor = self.decryptor.take().expect("stream already finished");
            self.done = true;
            decryptor.decrypt_last(&ciphertext[..])
        } else {
            ciphertext.resize(length as usize, 0);
            self.inner.read_exact(&mut ciphertext)?;
            let decryptor = self.decryptor.as_mut().expect("stream already finished");
            decryptor.decrypt_next(&ciphertext[..])
        };
        self.plain = decrypted.map_err(|_| crypto_error("could not decrypt"))?;
        self.pos = 0;
        Ok(())
    }
}

impl<R: Read> Read for SealReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.plain.len() {
            if self.done {
                return Ok(0);
            }
            self.fill()?;
        }
        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Loads a recipient public key stored as a single hex line.
pub fn load_public_key(path: &Path) -> anyhow::Result<PublicKey> {
    let text = fs::read_to_string(path)?;
    let bytes = hex::decode(text.trim())
        .with_context(|| format!("{}: malformed public key", path.display()))?;
    let bytes: [u8; PUBLIC_KEY_LEN] = bytes
        .try_into()
        .map_err(|_| anyhow!("{}: public key must be {PUBLIC_KEY_LEN} bytes", path.display()))?;
    Ok(PublicKey(bytes))
}

pub fn save_public_key(path: &Path, key: &PublicKey) -> anyhow::Result<()> {
    fs::write(path, format!("{}\n", hex::encode(key.as_bytes())))?;
    Ok(())
}

fn passphrase_key(passphrase: &[u8], salt: &[u8]) -> anyhow::Result<SymmetricKey> {
    let mut kek = [0u8; 32];
    argon2::Argon2::default()
        .hash_password_into(passphrase, salt, &mut kek)
        .map_err(|e| anyhow!("key derivation failed: {e}"))?;
    Ok(GenericArray::from(kek))
}

/// Loads a secret key file and unlocks it with the given passphrase.
///
/// The file layout is `salt(16) || nonce(12) || aead ciphertext`.
pub fn load_secret_key(path: &Path, passphrase: &[u8]) -> anyhow::Result<SecretKey> {
    let bytes = fs::read(path)?;
    if bytes.len() < KEYFILE_SALT_LEN + KEYFILE_NONCE_LEN {
        bail!("{}: secret key file is truncated", path.display());
    }
    let (salt, rest) = bytes.split_at(KEYFILE_SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(KEYFILE_NONCE_LEN);

    let kek = passphrase_key(passphrase, salt)?;
    let cipher = Aes256GcmSiv::new(&kek);
    let plain = cipher
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow!("{}: incorrect passphrase or corrupted key file", path.display()))?;

    let plain: [u8; SECRET_KEY_LEN] = plain
        .try_into()
        .map_err(|_| anyhow!("{}: unexpected secret key length", path.display()))?;
    Ok(SecretKey(plain))
}

/// Writes a secret key file locked with the given passphrase.
pub fn save_secret_key(
    csprng: &mut (impl RngCore + CryptoRng),
    path: &Path,
    key: &SecretKey,
    passphrase: &[u8],
) -> anyhow::Result<()> {
    let mut salt = [0u8; KEYFILE_SALT_LEN];
    csprng.fill_bytes(&mut salt);
    let mut nonce = [0u8; KEYFILE_NONCE_LEN];
    csprng.fill_bytes(&mut nonce);

    let kek = passphrase_key(passphrase, &salt)?;
    let cipher = Aes256GcmSiv::new(&kek);
    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), &key.0[..])
        .map_err(|e| anyhow!("could not seal secret key: {e}"))?;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(&salt)?;
    file.write_all(&nonce)?;
    file.write_all(&ciphertext)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MiB;
    use std::iter;

    #[test]
    fn seal_and_open_roundtrip() {
        let mut rng = rand::thread_rng();
        let (public, secret) = generate_keypair(&mut rng);

        let plaintext: Vec<u8> = iter::repeat_with(rand::random::<u8>)
            .take(MiB + 5)
            .collect();

        let (header, key) = encapsulate(&mut rng, &public);
        let mut sealed = Vec::new();
        encrypt(&mut sealed, &plaintext[..], &header, &key).unwrap();

        let mut cursor = &sealed[..];
        let header = read_header(&mut cursor).unwrap();
        let key = decapsulate(&header, &secret);
        let mut opened = Vec::new();
        decrypt(&mut opened, cursor, &header, &key).unwrap();

        assert_eq!(opened, plaintext);
    }

    #[test]
    fn wrong_secret_key_fails_authentication() {
        let mut rng = rand::thread_rng();
        let (public, _secret) = generate_keypair(&mut rng);
        let (_, other_secret) = generate_keypair(&mut rng);

        let (header, key) = encapsulate(&mut rng, &public);
        let mut sealed = Vec::new();
        encrypt(&mut sealed, &b"attack at dawn"[..], &header, &key).unwrap();

        let mut cursor = &sealed[..];
        let header = read_header(&mut cursor).unwrap();
        let key = decapsulate(&header, &other_secret);
        let mut opened = Vec::new();
        decrypt(&mut opened, cursor, &header, &key).unwrap_err();
    }

    #[test]
    fn keyfile_roundtrip_and_bad_passphrase() {
        let mut rng = rand::thread_rng();
        let (public, secret) = generate_keypair(&mut rng);
        let dir = tempfile::tempdir().unwrap();

        let pub_path = dir.path().join("backup.pub");
        let key_path = dir.path().join("backup.key");
        save_public_key(&pub_path, &public).unwrap();
        save_secret_key(&mut rng, &key_path, &secret, b"hunter2").unwrap();

        assert_eq!(load_public_key(&pub_path).unwrap(), public);
        let unlocked = load_secret_key(&key_path, b"hunter2").unwrap();
        assert_eq!(unlocked.public_key(), public);

        load_secret_key(&key_path, b"wrong").unwrap_err();
    }
}
