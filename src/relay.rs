use crate::{
    config::RelayConfig, dispatcher::Dispatcher, game_link::GameLink, multiplexer::Multiplexer,
    state::ConnectionState,
};
use std::sync::Arc;

/// Handle to the relay's shared state and components.
///
/// Cheap to clone; every background task and external collaborator
/// gets its own copy.
#[derive(Clone)]
pub struct Relay {
    config: Arc<RelayConfig>,
    state: Arc<ConnectionState>,
    game: GameLink,
    multiplexer: Multiplexer,
    dispatcher: Dispatcher,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let state = Arc::new(ConnectionState::new());
        let game = GameLink::new(Arc::clone(&state));
        let multiplexer = Multiplexer::new(Arc::clone(&state), config.remote_address);
        let dispatcher = Dispatcher::new(Arc::clone(&state), game.clone());
        Self {
            config: Arc::new(config),
            state,
            game,
            multiplexer,
            dispatcher,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<ConnectionState> {
        &self.state
    }

    pub fn game(&self) -> &GameLink {
        &self.game
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.multiplexer
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}
