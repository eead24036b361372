//! Credential model, durable files and remote endpoints for the token switcher
//!
//! Provides the credential record, the pool/active JSON files (written with
//! temp-file + rename so the CLI client never reads a torn file), import-line
//! parsing, and the two HTTP collaborators: the usage endpoint and the token
//! refresh endpoint. This crate holds no timers and no locks of its own; the
//! failover engine in `account-pool` owns all mutation ordering.
//!
//! Credential flow:
//! 1. Operator pastes `refresh----access----timestamp` lines → `import::parse_lines()`
//! 2. Accepted records become `Credential`s with fresh ids → `CredentialFiles::save_pool()`
//! 3. A switch writes the chosen credential → `CredentialFiles::save_active()`
//! 4. The quota probe calls `usage::fetch_usage()`, refreshing via `token::refresh_token()`

pub mod constants;
pub mod credentials;
pub mod error;
pub mod import;
pub mod token;
pub mod usage;

pub use constants::*;
pub use credentials::{ActiveRecord, Credential, CredentialFiles, QuotaState, now_millis};
pub use error::{Error, Result};
pub use import::{FIELD_DELIMITER, ImportRecord, parse_line, parse_lines};
pub use token::{TokenResponse, refresh_token};
pub use usage::{UsageSnapshot, fetch_usage};
