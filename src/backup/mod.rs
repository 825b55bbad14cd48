pub mod backup_config;
pub mod checksum;
pub mod compress;
pub mod copy;
pub mod encrypt;
pub mod file_ext;
pub mod finish;
pub mod lock;
pub mod manifest;
pub mod permissions;
pub mod redacted;
pub mod result_error;
pub mod retention;
pub mod run;
pub mod scope;
pub mod tar;
pub mod validate;

#[cfg(test)]
pub(crate) mod test_util;

/// Tracing target for audit events (run lifecycle, lock, key, deletions).
pub const AUDIT: &str = "audit";
