pub mod classify;
pub mod diagnostics;
pub mod features;
pub mod gate;
pub mod hardware;
pub mod runtime;
