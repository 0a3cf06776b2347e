//! Redacting wrapper for credentials

use std::fmt;
use zeroize::Zeroize;

/// Sensitive value (account cookies, bearer tokens). Never printed, zeroed on drop.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Borrow the inner value. Only header construction should need this.
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_is_redacted_in_debug_and_display() {
        let cookie = Secret::new(String::from("client_2abc"));
        assert_eq!(format!("{cookie:?}"), "[REDACTED]");
        assert_eq!(format!("{cookie}"), "[REDACTED]");
    }

    #[test]
    fn expose_returns_inner_value() {
        let cookie: Secret<String> = String::from("client_2abc").into();
        assert_eq!(cookie.expose(), "client_2abc");
    }

    #[test]
    fn clone_is_independent() {
        let a = Secret::new(String::from("uat"));
        let b = a.clone();
        drop(a);
        assert_eq!(b.expose(), "uat");
    }
}
