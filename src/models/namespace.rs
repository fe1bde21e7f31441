use std::fmt;

use serde::{Deserialize, Serialize};

/// Scope of every entity: the device-local canvas, a user's private canvas, or a
/// shared canvas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "lowercase")]
pub enum Namespace {
    Local,
    User(String),
    Canvas(String),
}

impl Namespace {
    /// Key used by both cache tiers.
    pub fn cache_key(&self) -> String {
        match self {
            Namespace::Local => "local".to_string(),
            Namespace::User(id) => format!("user:{id}"),
            Namespace::Canvas(id) => format!("canvas:{id}"),
        }
    }

    /// Root path in the remote store. The local namespace has none.
    pub fn remote_root(&self) -> Option<String> {
        match self {
            Namespace::Local => None,
            Namespace::User(id) => Some(format!("users/{id}")),
            Namespace::Canvas(id) => Some(format!("canvases/{id}")),
        }
    }

    pub fn collection_path(&self, collection: &str) -> Option<String> {
        self.remote_root().map(|root| format!("{root}/{collection}"))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}

#[cfg(test)]
mod tests {
    use super::Namespace;

    #[test]
    fn remote_paths_are_scoped() {
        let user = Namespace::User("u1".to_string());
        assert_eq!(user.collection_path("notes").as_deref(), Some("users/u1/notes"));
        let canvas = Namespace::Canvas("c9".to_string());
        assert_eq!(canvas.cache_key(), "canvas:c9");
        assert_eq!(Namespace::Local.collection_path("notes"), None);
    }
}
