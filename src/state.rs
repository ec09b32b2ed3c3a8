use std::sync::Arc;

use crate::command::CommandRouter;

#[derive(Clone)]
pub struct AppState {
    pub commands: Arc<CommandRouter>,
    pub command_secret: Arc<str>,
}
