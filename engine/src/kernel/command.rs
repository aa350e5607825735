//! Storage commands: the unit of change recorded in the transaction log.

use crate::index::{TokenChange, ValueChange};

/// One change to indexed entity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageCommand {
    /// `entity` gained `token`.
    TokenAdded { entity: u64, token: u32 },
    /// `entity` lost `token`.
    TokenRemoved { entity: u64, token: u32 },
    /// The value `entity` contributes to value index `index` changed.
    /// `None` means no value.
    ValueChanged {
        index: u32,
        entity: u64,
        before: Option<i64>,
        after: Option<i64>,
    },
}

impl StorageCommand {
    /// The token index change this command implies, if any.
    #[must_use]
    pub const fn token_change(&self) -> Option<TokenChange> {
        match *self {
            Self::TokenAdded { entity, token } => Some(TokenChange {
                entity,
                token,
                added: true,
            }),
            Self::TokenRemoved { entity, token } => Some(TokenChange {
                entity,
                token,
                added: false,
            }),
            Self::ValueChanged { .. } => None,
        }
    }

    /// The value index and change this command implies, if any.
    #[must_use]
    pub const fn value_change(&self) -> Option<(u32, ValueChange)> {
        match *self {
            Self::ValueChanged {
                index,
                entity,
                before,
                after,
            } => Some((
                index,
                ValueChange {
                    entity,
                    before,
                    after,
                },
            )),
            Self::TokenAdded { .. } | Self::TokenRemoved { .. } => None,
        }
    }
}
