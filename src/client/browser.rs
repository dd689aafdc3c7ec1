use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Storage key of the PKCE verifier kept across the authorization redirect.
pub const PKCE_CODE_VERIFIER: &str = "pkce_code_verifier";
/// Storage key of an authorization code captured before sign-in resumed.
pub const AUTHORIZATION_CODE: &str = "authorization_code";
/// Storage key of the provider logout URL of the current session.
pub const LOGOUT_URL: &str = "logout_url";

/// Per-tab key/value storage that survives the authorization redirect.
pub trait SessionStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str);
    fn remove_item(&self, key: &str);
}

/// The page location.
pub trait Location: Send + Sync {
    fn href(&self) -> String;
    /// Full-page navigation.
    fn assign(&self, url: &str);
    /// History entry replacement without navigating.
    fn replace_state(&self, url: &str);
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set_item(&self, key: &str, value: &str) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
    }

    fn remove_item(&self, key: &str) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// In-memory [`Location`] that records navigations.
#[derive(Debug, Default)]
pub struct MemoryLocation {
    href: Mutex<String>,
    navigations: Mutex<Vec<String>>,
}

impl MemoryLocation {
    #[must_use]
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: Mutex::new(href.into()),
            navigations: Mutex::new(Vec::new()),
        }
    }

    /// URLs passed to [`Location::assign`], oldest first.
    #[must_use]
    pub fn navigations(&self) -> Vec<String> {
        self.navigations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Location for MemoryLocation {
    fn href(&self) -> String {
        self.href
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn assign(&self, url: &str) {
        self.navigations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.to_owned());
        self.replace_state(url);
    }

    fn replace_state(&self, url: &str) {
        *self.href.lock().unwrap_or_else(PoisonError::into_inner) = url.to_owned();
    }
}

/// `code` and `session_state` query parameters of a redirect back from the
/// provider.
pub(crate) fn callback_params(href: &str) -> (Option<String>, Option<String>) {
    let Ok(url) = url::Url::parse(href) else {
        return (None, None);
    };
    let find = |name: &str| {
        url.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
    };
    (find("code"), find("session_state"))
}

/// `href` without the `code` and `session_state` parameters.
pub(crate) fn strip_callback_params(href: &str) -> String {
    let Ok(mut url) = url::Url::parse(href) else {
        return href.to_owned();
    };
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "code" && key != "session_state")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    url.into()
}
