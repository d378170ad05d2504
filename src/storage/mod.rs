pub mod format;
pub mod mask;
