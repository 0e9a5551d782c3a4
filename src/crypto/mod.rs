//! 加密相关

pub mod backup_crypto;
