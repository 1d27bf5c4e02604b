//! Hashing, HMAC and randomness for the guest `crypto` module.

use super::OpError;
use super::encoding::{binary_to_bytes, bytes_to_binary};
use md5::{Digest, Md5};
use ring::hmac;
use rquickjs::{Ctx, Function, Object};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn parse(s: &str) -> Result<Self, OpError> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha384" | "sha-384" => Ok(Self::Sha384),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            _ => Err(OpError::UnsupportedAlgorithm(s.to_string())),
        }
    }

    fn hmac_algorithm(self) -> Option<hmac::Algorithm> {
        match self {
            Self::Sha1 => Some(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY),
            Self::Sha256 => Some(hmac::HMAC_SHA256),
            Self::Sha384 => Some(hmac::HMAC_SHA384),
            Self::Sha512 => Some(hmac::HMAC_SHA512),
            Self::Md5 => None,
        }
    }
}

pub fn hash(algorithm: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        HashAlgorithm::Md5 => Md5::digest(data).to_vec(),
        HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
    }
}

pub fn hmac_sign(algorithm: HashAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>, OpError> {
    let alg = algorithm
        .hmac_algorithm()
        .ok_or_else(|| OpError::UnsupportedAlgorithm(format!("{algorithm:?} HMAC")))?;
    let key = hmac::Key::new(alg, key);
    Ok(hmac::sign(&key, data).as_ref().to_vec())
}

pub fn random_bytes(size: usize) -> Result<Vec<u8>, OpError> {
    let mut buf = vec![0u8; size];
    getrandom::fill(&mut buf).map_err(|e| OpError::Random(e.to_string()))?;
    Ok(buf)
}

pub fn random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn register<'js>(ctx: &Ctx<'js>, host: &Object<'js>) -> rquickjs::Result<()> {
    host.set(
        "cryptoHash",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, algorithm: String, data: String| -> rquickjs::Result<String> {
                let alg = HashAlgorithm::parse(&algorithm).map_err(|e| super::throw(&ctx, e))?;
                Ok(bytes_to_binary(&hash(alg, &binary_to_bytes(&data))))
            },
        )?,
    )?;

    host.set(
        "cryptoHmac",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, algorithm: String, key: String, data: String| -> rquickjs::Result<String> {
                let alg = HashAlgorithm::parse(&algorithm).map_err(|e| super::throw(&ctx, e))?;
                let mac = hmac_sign(alg, &binary_to_bytes(&key), &binary_to_bytes(&data))
                    .map_err(|e| super::throw(&ctx, e))?;
                Ok(bytes_to_binary(&mac))
            },
        )?,
    )?;

    host.set(
        "cryptoRandomBytes",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, size: f64| -> rquickjs::Result<String> {
            if !(0.0..=65536.0 * 1024.0).contains(&size) {
                return Err(super::throw(&ctx, format!("RangeError: invalid size {size}")));
            }
            let bytes = random_bytes(size as usize).map_err(|e| super::throw(&ctx, e))?;
            Ok(bytes_to_binary(&bytes))
        })?,
    )?;

    host.set("cryptoRandomUUID", Function::new(ctx.clone(), random_uuid)?)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            hex::encode(hash(HashAlgorithm::Sha256, b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            hex::encode(hash(HashAlgorithm::Md5, b"")),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            hex::encode(hash(HashAlgorithm::Sha1, b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_hmac() {
        let mac = hmac_sign(HashAlgorithm::Sha256, b"key", b"The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(
            hex::encode(mac),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
        assert!(hmac_sign(HashAlgorithm::Md5, b"k", b"d").is_err());
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(HashAlgorithm::parse("SHA-256").unwrap(), HashAlgorithm::Sha256);
        assert!(HashAlgorithm::parse("whirlpool").is_err());
    }

    #[test]
    fn test_random() {
        assert_eq!(random_bytes(16).unwrap().len(), 16);
        let id = random_uuid();
        assert_eq!(id.len(), 36);
        assert_eq!(&id[14..15], "4");
    }
}
