//! Inbound chat commands

pub mod parser;
pub mod router;

pub use parser::BotCommand;
pub use router::CommandRouter;
