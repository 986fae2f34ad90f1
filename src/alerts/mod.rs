//! Alert dispatching: types, channels, templates, and the fan-out engine.

pub mod channels;
mod dispatcher;
pub mod http;
pub mod template;
mod types;

pub use dispatcher::Dispatcher;
pub use types::{Alert, AlertContext, ExitCategory, exit_category, signature_changed};
