//! Parameter Store Port
//!
//! Small persistent key/value settings that must survive a restart.

/// Persistent boolean parameters.
pub trait ParamStore: Send + Sync {
    fn get_bool(&self, key: &str) -> Option<bool>;

    fn set_bool(&self, key: &str, value: bool);
}
