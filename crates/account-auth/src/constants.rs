//! Endpoint and file-layout defaults
//!
//! The usage and refresh endpoints belong to the product whose CLI consumes
//! the active credential. All of them can be overridden from config.

/// Usage endpoint queried for the remaining allowance of a credential
pub const USAGE_URL: &str = "https://app.factory.ai/api/organization/members/chat-usage";

/// Token endpoint used to mint a new access token from a refresh token
pub const REFRESH_URL: &str = "https://api.workos.com/user_management/authenticate";

/// Public client id sent with refresh requests (not a secret)
pub const CLIENT_ID: &str = "client_01HNM792M5G5G1A2THWPXKFMXB";

/// Default pool file name, relative to the working directory
pub const DEFAULT_POOL_FILE: &str = "tokens.json";

/// Active credential file, relative to the user's home directory
pub const ACTIVE_FILE_RELATIVE: &str = ".factory/auth.json";
