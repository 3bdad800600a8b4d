pub mod app;
pub mod error;
pub mod settings;
pub mod shell;

pub use error::{AppError, AppResult};
pub use settings::{Settings, SettingsError, SettingsStore};
pub use shell::{Command, Flow, Shell};
