//! Application payload registry: kind name -> decode function.

use std::collections::HashMap;

use crate::protocol::{AppMessage, AppPayload};

type DecodeFn = fn(&[u8]) -> Result<(), bincode::Error>;

fn decode_as<T: AppPayload>(body: &[u8]) -> Result<(), bincode::Error> {
    bincode::deserialize::<T>(body).map(|_| ())
}

/// Payload kinds this badge understands. Built once at startup and handed to the
/// decoder; frames carrying an unregistered kind are rejected like malformed ones.
#[derive(Clone, Default)]
pub struct PayloadRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under [`AppPayload::KIND`]. Re-registering a kind replaces it.
    pub fn register<T: AppPayload>(&mut self) -> &mut Self {
        self.decoders.insert(T::KIND, decode_as::<T>);
        self
    }

    pub fn with<T: AppPayload>(mut self) -> Self {
        self.register::<T>();
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    /// Check that `msg` is a registered kind whose body decodes.
    pub fn check(&self, msg: &AppMessage) -> Result<(), RegistryError> {
        let decode = self
            .decoders
            .get(msg.kind.as_str())
            .ok_or_else(|| RegistryError::UnknownKind(msg.kind.clone()))?;
        decode(&msg.body).map_err(|e| RegistryError::Body {
            kind: msg.kind.clone(),
            source: e,
        })
    }
}

impl std::fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.decoders.keys()).finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown payload kind {0:?}")]
    UnknownKind(String),
    #[error("malformed {kind:?} payload: {source}")]
    Body {
        kind: String,
        #[source]
        source: bincode::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Move {
        cell: u8,
        symbol: char,
    }

    impl AppPayload for Move {
        const KIND: &'static str = "tictac.move";
    }

    #[test]
    fn registered_kind_passes() {
        let reg = PayloadRegistry::new().with::<Move>();
        let msg = AppMessage::encode(&Move {
            cell: 4,
            symbol: 'x',
        })
        .unwrap();
        assert!(reg.contains("tictac.move"));
        reg.check(&msg).unwrap();
    }

    #[test]
    fn unknown_kind_rejected() {
        let reg = PayloadRegistry::new();
        let msg = AppMessage::encode(&Move {
            cell: 4,
            symbol: 'x',
        })
        .unwrap();
        assert!(matches!(reg.check(&msg), Err(RegistryError::UnknownKind(k)) if k == "tictac.move"));
    }

    #[test]
    fn truncated_body_rejected() {
        let reg = PayloadRegistry::new().with::<Move>();
        let msg = AppMessage {
            kind: "tictac.move".into(),
            body: vec![4],
        };
        assert!(matches!(reg.check(&msg), Err(RegistryError::Body { .. })));
    }
}
