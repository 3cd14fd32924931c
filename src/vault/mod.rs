//! Credential protection: at-rest token encryption and OAuth token lifecycle.

mod cipher;
mod tokens;

pub use cipher::{is_encrypted, CredentialVault, Result, VaultError, KEY_LEN};
#[cfg(test)]
pub use tokens::MockOAuthClient;
pub use tokens::{
    OAuth2Client, OAuthClient, OAuthError, SealedTokens, TokenError, TokenManager, TokenSet,
    DEFAULT_REFRESH_SKEW_SECS,
};
