//! Command Registry
//!
//! Maps stable numeric command type identifiers to apply functions. The
//! registry is populated once at startup, which makes wire compatibility
//! explicit: a type id that is not registered is rejected as
//! [`CommandError::UnknownType`] and the offending command is dropped from
//! its turn without disturbing the rest.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::codec::{CommandRecord, PlayerNum};

/// Command application errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The command's type id is not registered.
    #[error("unknown command type {0}")]
    UnknownType(i32),

    /// The handler rejected the command payload.
    #[error("command rejected: {0}")]
    Rejected(String),
}

/// Applies the payload of one registered command type.
pub trait CommandHandler: Send {
    /// Apply a command payload on behalf of `player`.
    fn apply(&mut self, payload: &[u8], player: PlayerNum) -> Result<(), CommandError>;
}

impl<F> CommandHandler for F
where
    F: FnMut(&[u8], PlayerNum) -> Result<(), CommandError> + Send,
{
    fn apply(&mut self, payload: &[u8], player: PlayerNum) -> Result<(), CommandError> {
        self(payload, player)
    }
}

/// Registry mapping command type ids to handlers.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: BTreeMap<i32, Box<dyn CommandHandler>>,
}

impl CommandRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a type id, replacing any previous one.
    pub fn register<H>(&mut self, type_id: i32, handler: H)
    where
        H: CommandHandler + 'static,
    {
        self.handlers.insert(type_id, Box::new(handler));
    }

    /// True if a handler is registered for the type id.
    pub fn is_registered(&self, type_id: i32) -> bool {
        self.handlers.contains_key(&type_id)
    }

    /// Apply a command record through its registered handler.
    pub fn apply(&mut self, command: &CommandRecord) -> Result<(), CommandError> {
        match self.handlers.get_mut(&command.type_id) {
            Some(handler) => handler.apply(&command.payload, command.player),
            None => Err(CommandError::UnknownType(command.type_id)),
        }
    }

    /// Number of registered command types.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True if no command type is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn record(type_id: i32, payload: Vec<u8>, player: PlayerNum) -> CommandRecord {
        CommandRecord {
            type_id,
            payload,
            player,
            seq: 0,
        }
    }

    #[test]
    fn test_apply_routes_by_type_id() {
        let mut registry = CommandRegistry::new();
        let moves = Arc::new(AtomicU32::new(0));
        let attacks = Arc::new(AtomicU32::new(0));

        let moves_cb = moves.clone();
        registry.register(1, move |_payload: &[u8], _player: PlayerNum| {
            moves_cb.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let attacks_cb = attacks.clone();
        registry.register(2, move |_payload: &[u8], _player: PlayerNum| {
            attacks_cb.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        registry.apply(&record(1, vec![], 0)).unwrap();
        registry.apply(&record(1, vec![], 0)).unwrap();
        registry.apply(&record(2, vec![], 0)).unwrap();

        assert_eq!(moves.load(Ordering::SeqCst), 2);
        assert_eq!(attacks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut registry = CommandRegistry::new();
        assert_eq!(
            registry.apply(&record(42, vec![], 0)),
            Err(CommandError::UnknownType(42))
        );
    }

    #[test]
    fn test_handler_sees_player_and_payload() {
        let mut registry = CommandRegistry::new();
        registry.register(7, |payload: &[u8], player: PlayerNum| {
            assert_eq!(payload, &[1, 0, 1]);
            assert_eq!(player, 2);
            Ok(())
        });
        registry.apply(&record(7, vec![1, 0, 1], 2)).unwrap();
    }

    #[test]
    fn test_handler_rejection_propagates() {
        let mut registry = CommandRegistry::new();
        registry.register(3, |_payload: &[u8], _player: PlayerNum| {
            Err(CommandError::Rejected("bad payload".into()))
        });
        assert!(matches!(
            registry.apply(&record(3, vec![], 0)),
            Err(CommandError::Rejected(_))
        ));
    }
}
