//! 备份归档加密
//!
//! AES-256-GCM，密钥由运维口令经 Argon2id 派生。输出自描述：
//! `[BVBK][v1][m_cost:4][t_cost:4][p_cost:4][salt:16][nonce:12][ciphertext+tag]`
//! 解密时按头部记录的参数派生密钥，调整默认参数不影响旧备份。

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use std::fs;
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::models::AppError;

const BACKUP_MAGIC: &[u8; 4] = b"BVBK";
const BACKUP_CRYPTO_VERSION: u8 = 1;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const HEADER_SIZE: usize = 4 + 1 + 12 + SALT_LEN + NONCE_LEN;

/// 头部参数上限，拒绝被篡改成天价 KDF 的输入
const MAX_M_COST: u32 = 1024 * 1024; // 1 GB
const MAX_T_COST: u32 = 16;
const MAX_P_COST: u32 = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("加密备份数据太短")]
    Truncated,
    #[error("非加密备份文件（无 BVBK 标头）")]
    BadMagic,
    #[error("不支持的加密版本: {0}")]
    UnsupportedVersion(u8),
    #[error("Argon2 参数无效: {0}")]
    Kdf(String),
    #[error("备份加密失败")]
    Encrypt,
    #[error("备份解密失败（口令错误或数据损坏）")]
    Decrypt,
    #[error("读写加密文件失败: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for AppError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Io(e) => AppError::from(e),
            other => AppError::internal(other.to_string()),
        }
    }
}

/// Argon2id 代价参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: 65536, // 64 MB
            t_cost: 3,
            p_cost: 4,
        }
    }
}

impl KdfParams {
    fn check_bounds(&self) -> Result<(), CryptoError> {
        if self.m_cost > MAX_M_COST || self.t_cost > MAX_T_COST || self.p_cost > MAX_P_COST {
            return Err(CryptoError::Kdf(format!(
                "代价参数超出上限: m={} t={} p={}",
                self.m_cost, self.t_cost, self.p_cost
            )));
        }
        Ok(())
    }
}

fn derive_key(
    passphrase: &str,
    salt: &[u8],
    params: KdfParams,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    use argon2::{Algorithm, Argon2, Params, Version};

    params.check_bounds()?;
    let argon_params = Params::new(params.m_cost, params.t_cost, params.p_cost, Some(32))
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(key)
}

pub fn encrypt_backup(plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>, CryptoError> {
    encrypt_backup_with(plaintext, passphrase, KdfParams::default())
}

pub fn encrypt_backup_with(
    plaintext: &[u8],
    passphrase: &str,
    params: KdfParams,
) -> Result<Vec<u8>, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(passphrase, &salt, params)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| CryptoError::Encrypt)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut output = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    output.extend_from_slice(BACKUP_MAGIC);
    output.push(BACKUP_CRYPTO_VERSION);
    output.extend_from_slice(&params.m_cost.to_le_bytes());
    output.extend_from_slice(&params.t_cost.to_le_bytes());
    output.extend_from_slice(&params.p_cost.to_le_bytes());
    output.extend_from_slice(&salt);
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

pub fn decrypt_backup(data: &[u8], passphrase: &str) -> Result<Vec<u8>, CryptoError> {
    if data.len() < HEADER_SIZE {
        return Err(CryptoError::Truncated);
    }
    if &data[0..4] != BACKUP_MAGIC {
        return Err(CryptoError::BadMagic);
    }
    let version = data[4];
    if version != BACKUP_CRYPTO_VERSION {
        return Err(CryptoError::UnsupportedVersion(version));
    }

    let off = 5;
    let params = KdfParams {
        m_cost: read_u32(data, off),
        t_cost: read_u32(data, off + 4),
        p_cost: read_u32(data, off + 8),
    };
    let salt = &data[off + 12..off + 12 + SALT_LEN];
    let nonce_bytes = &data[off + 12 + SALT_LEN..HEADER_SIZE];
    let ciphertext = &data[HEADER_SIZE..];

    let key = derive_key(passphrase, salt, params)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| CryptoError::Decrypt)?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

/// 加密 `src` 写入 `dst`
pub fn encrypt_file(
    src: &Path,
    dst: &Path,
    passphrase: &str,
    params: KdfParams,
) -> Result<(), CryptoError> {
    let plaintext = Zeroizing::new(fs::read(src)?);
    let encrypted = encrypt_backup_with(&plaintext, passphrase, params)?;
    fs::write(dst, encrypted)?;
    Ok(())
}

/// 解密 `src` 写入 `dst`
pub fn decrypt_file(src: &Path, dst: &Path, passphrase: &str) -> Result<(), CryptoError> {
    let data = fs::read(src)?;
    let plaintext = Zeroizing::new(decrypt_backup(&data, passphrase)?);
    fs::write(dst, plaintext.as_slice())?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;

    /// 测试用低代价参数
    pub(crate) const FAST_KDF: KdfParams = KdfParams {
        m_cost: 256,
        t_cost: 1,
        p_cost: 1,
    };

    #[test]
    fn test_encrypt_decrypt_with_default_params() {
        let plaintext = b"hello backup world! 123 456";
        let encrypted = encrypt_backup(plaintext, "test-password-2026").unwrap();
        assert_eq!(&encrypted[0..4], BACKUP_MAGIC);
        assert_ne!(&encrypted[HEADER_SIZE..], plaintext);
        assert_eq!(decrypt_backup(&encrypted, "test-password-2026").unwrap(), plaintext);
    }

    #[test]
    fn test_header_records_params() {
        let encrypted = encrypt_backup_with(b"x", "pw", FAST_KDF).unwrap();
        assert_eq!(read_u32(&encrypted, 5), FAST_KDF.m_cost);
        assert_eq!(decrypt_backup(&encrypted, "pw").unwrap(), b"x");
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let encrypted = encrypt_backup_with(b"secret data", "correct", FAST_KDF).unwrap();
        assert_matches!(decrypt_backup(&encrypted, "wrong"), Err(CryptoError::Decrypt));
    }

    #[test]
    fn test_tampered_data_fails() {
        let mut encrypted = encrypt_backup_with(b"data", "pw", FAST_KDF).unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xFF;
        assert_matches!(decrypt_backup(&encrypted, "pw"), Err(CryptoError::Decrypt));
    }

    #[test]
    fn test_rejects_foreign_and_short_input() {
        assert_matches!(decrypt_backup(b"PK\x03\x04", "pw"), Err(CryptoError::Truncated));
        let zip_like = [b'P'; HEADER_SIZE + 4];
        assert_matches!(decrypt_backup(&zip_like, "pw"), Err(CryptoError::BadMagic));
    }

    #[test]
    fn test_oversized_kdf_header_rejected() {
        let mut encrypted = encrypt_backup_with(b"data", "pw", FAST_KDF).unwrap();
        encrypted[5..9].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_matches!(decrypt_backup(&encrypted, "pw"), Err(CryptoError::Kdf(_)));
    }
}
