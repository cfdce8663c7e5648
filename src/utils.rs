use crate::peer::types::{IceServerKind, ServerConfig};
use rand::Rng;
use std::sync::{Mutex, MutexGuard};

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Locks `m`, ignoring poisoning: the state behind it is always consistent
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// Adds the protocol scheme to an ICE server URL if it is missing
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
        || config.url.starts_with("stuns:")
    {
        config.url.clone()
    } else {
        let scheme = match config.kind {
            IceServerKind::Turn => "turn:",
            IceServerKind::Stun => "stun:",
        };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(kind: IceServerKind, url: &str) -> ServerConfig {
        ServerConfig {
            id: "s".into(),
            kind,
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    #[test]
    fn scheme_is_added_by_server_kind() {
        assert_eq!(
            add_ice_url_scheme(&server(IceServerKind::Turn, "turn.example.org:3478")),
            "turn:turn.example.org:3478"
        );
        assert_eq!(
            add_ice_url_scheme(&server(IceServerKind::Stun, "stun.l.google.com:19302")),
            "stun:stun.l.google.com:19302"
        );
    }

    #[test]
    fn existing_scheme_is_kept() {
        assert_eq!(
            add_ice_url_scheme(&server(IceServerKind::Turn, "stun:host:1")),
            "stun:host:1"
        );
    }

    #[test]
    fn random_ids_are_16_hex_chars() {
        let a = random_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, random_id());
    }
}
