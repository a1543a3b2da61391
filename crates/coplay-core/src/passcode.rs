//! Host passcodes for the `Controlled` join filter.

use rand::Rng;
use rand::distributions::Alphanumeric;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Number of characters in a generated passcode
pub const PASSCODE_LEN: usize = 32;

/// Shared secret a client must submit to be admitted.
///
/// Generated passcodes are [`PASSCODE_LEN`] ASCII alphanumerics. The value is
/// wiped from memory on drop and never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Passcode(String);

impl Passcode {
    /// Draw a fresh random passcode.
    #[must_use]
    pub fn generate() -> Self {
        let value: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(PASSCODE_LEN)
            .map(char::from)
            .collect();
        Self(value)
    }

    /// Wrap a passcode supplied by the user.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The passcode text, for join commands.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bytes sent in reply to a password request.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Exact, case-sensitive comparison against a submitted secret.
    ///
    /// Runs in constant time for inputs of the passcode's length.
    #[must_use]
    pub fn matches(&self, submitted: &[u8]) -> bool {
        let expected = self.0.as_bytes();
        expected.len() == submitted.len() && bool::from(expected.ct_eq(submitted))
    }
}

impl std::fmt::Debug for Passcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passcode(<redacted>)")
    }
}
