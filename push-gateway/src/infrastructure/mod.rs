pub mod acceptor;
pub mod auth;
pub mod public;
pub mod session;
pub mod user;
