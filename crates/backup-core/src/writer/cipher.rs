use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use super::{fold_chain, MetaMap, WriterLink};
use crate::{Error, Result};

const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
const SALT_LEN: usize = 16;
const DEFAULT_ITERATIONS: u32 = 10_000;
const MINIMUM_ITERATIONS: u32 = 10_000;
const PRF_NAME: &str = "HMAC-SHA256";

/// A validated, parsed cipher name plus the password it will be combined
/// with. Carries no key material until [`CipherLink::new`] derives it.
#[derive(Clone)]
pub struct CipherSpec {
    algorithm_name: String,
    key_bytes: usize,
    password: String,
    iterations: u32,
}

impl CipherSpec {
    /// Parses `AES-<bits>-<mode>` (case-insensitive); `<bits>` must be one
    /// of 128/192/256 and `<mode>` must be `CBC`, the only mode this link
    /// implements. Fails at argument-acceptance time, not mid-archive.
    pub fn parse(name: &str, password: impl Into<String>) -> Result<Self> {
        let upper = name.to_ascii_uppercase();
        let parts: Vec<&str> = upper.split('-').collect();
        let [algo, bits, mode] = parts.as_slice() else {
            return Err(Error::input(format!(
                "cipher algorithm '{name}' does not match AES-<bits>-<mode>"
            )));
        };
        if *algo != "AES" {
            return Err(Error::input(format!(
                "unsupported cipher family in '{name}': only AES is implemented"
            )));
        }
        let key_bits: u32 = bits
            .parse()
            .map_err(|_| Error::input(format!("invalid key size in cipher name '{name}'")))?;
        let key_bytes = match key_bits {
            128 => 16,
            192 => 24,
            256 => 32,
            other => {
                return Err(Error::input(format!(
                    "unsupported AES key size {other}: must be 128, 192 or 256"
                )))
            }
        };
        if *mode != "CBC" {
            return Err(Error::input(format!(
                "unsupported AES mode '{mode}': only CBC is implemented"
            )));
        }
        Ok(CipherSpec {
            algorithm_name: format!("AES-{key_bits}-CBC"),
            key_bytes,
            password: password.into(),
            iterations: DEFAULT_ITERATIONS,
        })
    }

    /// Overrides the PBKDF2 iteration count; rejects anything below the
    /// bound mandated for new archives.
    pub fn with_iterations(mut self, iterations: u32) -> Result<Self> {
        if iterations < MINIMUM_ITERATIONS {
            return Err(Error::crypto(format!(
                "PBKDF2 iteration count {iterations} is below the minimum of {MINIMUM_ITERATIONS}"
            )));
        }
        self.iterations = iterations;
        Ok(self)
    }
}

enum Encryptor {
    Aes128(cbc::Encryptor<aes::Aes128>),
    Aes192(cbc::Encryptor<aes::Aes192>),
    Aes256(cbc::Encryptor<aes::Aes256>),
}

impl Encryptor {
    fn new(key: &[u8], iv: [u8; IV_LEN]) -> Self {
        match key.len() {
            16 => {
                let k: [u8; 16] = key.try_into().unwrap();
                Encryptor::Aes128(cbc::Encryptor::new(&k.into(), &iv.into()))
            }
            24 => {
                let k: [u8; 24] = key.try_into().unwrap();
                Encryptor::Aes192(cbc::Encryptor::new(&k.into(), &iv.into()))
            }
            32 => {
                let k: [u8; 32] = key.try_into().unwrap();
                Encryptor::Aes256(cbc::Encryptor::new(&k.into(), &iv.into()))
            }
            other => unreachable!("unsupported key length {other}"),
        }
    }

    fn encrypt_block(&mut self, block: &mut [u8]) {
        debug_assert_eq!(block.len(), BLOCK_LEN);
        match self {
            Encryptor::Aes128(e) => e.encrypt_block_mut(GenericArray::from_mut_slice(block)),
            Encryptor::Aes192(e) => e.encrypt_block_mut(GenericArray::from_mut_slice(block)),
            Encryptor::Aes256(e) => e.encrypt_block_mut(GenericArray::from_mut_slice(block)),
        }
    }

    /// Consumes the encryptor, PKCS7-padding and encrypting whatever is
    /// left in `buf[..len]`. Always emits at least one full padding block,
    /// even when `len` is already block-aligned.
    fn finish<'a>(self, buf: &'a mut [u8], len: usize) -> &'a [u8] {
        match self {
            Encryptor::Aes128(e) => e.encrypt_padded_mut::<Pkcs7>(buf, len).unwrap(),
            Encryptor::Aes192(e) => e.encrypt_padded_mut::<Pkcs7>(buf, len).unwrap(),
            Encryptor::Aes256(e) => e.encrypt_padded_mut::<Pkcs7>(buf, len).unwrap(),
        }
    }
}

/// AES-CBC encryption with a PBKDF2-HMAC-SHA256-derived key and IV.
///
/// Key and IV are derived together from the password and a freshly
/// generated salt; the derived material is never persisted, only the KDF
/// parameters needed to re-derive it.
pub struct CipherLink {
    next: Box<dyn WriterLink>,
    encryptor: Option<Encryptor>,
    buffer: Vec<u8>,
    algorithm_name: String,
    salt_hex: String,
    iterations: u32,
}

impl CipherLink {
    pub fn new(next: Box<dyn WriterLink>, spec: CipherSpec) -> Result<Self> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut derived = vec![0u8; spec.key_bytes + IV_LEN];
        pbkdf2::pbkdf2_hmac::<sha2::Sha256>(
            spec.password.as_bytes(),
            &salt,
            spec.iterations,
            &mut derived,
        );
        let (key, iv_slice) = derived.split_at(spec.key_bytes);
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(iv_slice);

        let encryptor = Encryptor::new(key, iv);

        Ok(CipherLink {
            next,
            encryptor: Some(encryptor),
            buffer: Vec::with_capacity(BLOCK_LEN * 2),
            algorithm_name: spec.algorithm_name,
            salt_hex: hex::encode(salt),
            iterations: spec.iterations,
        })
    }

    fn drain_full_blocks(&mut self) -> Result<()> {
        let complete_len = (self.buffer.len() / BLOCK_LEN) * BLOCK_LEN;
        if complete_len == 0 {
            return Ok(());
        }
        let encryptor = self
            .encryptor
            .as_mut()
            .expect("encryptor consumed before close");
        let mut i = 0;
        while i < complete_len {
            encryptor.encrypt_block(&mut self.buffer[i..i + BLOCK_LEN]);
            i += BLOCK_LEN;
        }
        let ciphertext = &self.buffer[..complete_len];
        self.next.write(ciphertext)?;
        self.buffer.drain(..complete_len);
        Ok(())
    }
}

impl WriterLink for CipherLink {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.drain_full_blocks()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        self.next.flush()
    }

    fn close(&mut self) -> Result<()> {
        if let Some(encryptor) = self.encryptor.take() {
            let remainder_len = self.buffer.len();
            self.buffer.resize(remainder_len + BLOCK_LEN, 0);
            let ciphertext = encryptor.finish(&mut self.buffer, remainder_len).to_vec();
            self.next.write(&ciphertext)?;
        }
        self.next.close()
    }

    fn meta(&self) -> MetaMap {
        let mut m = MetaMap::new();
        m.insert("cipher_algorithm".to_string(), self.algorithm_name.clone().into());
        m.insert("pbkdf2_salt".to_string(), self.salt_hex.clone().into());
        m.insert("pbkdf2_prf".to_string(), PRF_NAME.into());
        m.insert("pbkdf2_iterations_count".to_string(), self.iterations.into());
        m
    }

    fn meta_chain(&self) -> MetaMap {
        fold_chain(self.meta(), self.next.meta_chain())
    }

    fn status_chain(&self) -> Option<String> {
        self.next.status_chain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tar_patcher::FileSinkLink;

    #[test]
    fn rejects_non_aes_family() {
        let err = CipherSpec::parse("BLOWFISH-256-CBC", "pw").unwrap_err();
        assert!(err.to_string().contains("invalid input") || err.to_string().contains("AES"));
    }

    #[test]
    fn rejects_unsupported_key_size() {
        assert!(CipherSpec::parse("AES-512-CBC", "pw").is_err());
    }

    #[test]
    fn rejects_unsupported_mode() {
        assert!(CipherSpec::parse("AES-256-GCM", "pw").is_err());
    }

    #[test]
    fn accepts_case_insensitive_canonical_names() {
        let spec = CipherSpec::parse("aes-256-cbc", "pw").unwrap();
        assert_eq!(spec.algorithm_name, "AES-256-CBC");
        assert_eq!(spec.key_bytes, 32);
    }

    #[test]
    fn iteration_count_below_minimum_is_rejected() {
        let spec = CipherSpec::parse("AES-128-CBC", "pw").unwrap();
        assert!(spec.with_iterations(100).is_err());
    }

    #[test]
    fn encrypts_and_reports_kdf_parameters() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let sink = FileSinkLink::create_for_test(tmp.path()).unwrap();
        let spec = CipherSpec::parse("AES-256-CBC", "hunter2").unwrap();
        let mut link = CipherLink::new(Box::new(sink), spec).unwrap();
        link.write(b"twenty bytes of data").unwrap();
        link.close().unwrap();
        let meta = link.meta();
        assert_eq!(meta.get("cipher_algorithm").unwrap(), "AES-256-CBC");
        assert_eq!(meta.get("pbkdf2_prf").unwrap(), "HMAC-SHA256");
        assert_eq!(
            meta.get("pbkdf2_iterations_count").unwrap(),
            DEFAULT_ITERATIONS
        );
        assert_eq!(meta.get("pbkdf2_salt").unwrap().as_str().unwrap().len(), 32);
    }
}
