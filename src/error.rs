use thiserror::Error;

/// Result type alias for fallible OFlux operations.
pub type Result<T> = std::result::Result<T, OfluxError>;

/// Errors that can cross the runtime's public API boundary.
///
/// A node's own return code is not represented here -- a non-zero return
/// routes to an error handler successor without ever becoming a
/// `Result::Err`, and a guard acquisition that must park the caller
/// returns `false`, not an error. These variants cover flow loading,
/// configuration, and the small set of runtime conditions that are
/// genuinely exceptional.
#[derive(Error, Debug)]
pub enum OfluxError {
    #[error("flow load failed: {reason}")]
    LoadError { reason: String },

    #[error("configuration error: {reason}")]
    ConfigError { reason: String },

    #[error("resource exhausted: {detail}")]
    ResourceExhausted { detail: String },

    #[error("guard invariant violated: {detail}")]
    Poisoned { detail: String },

    #[error("unknown guard: {name}")]
    UnknownGuard { name: String },

    #[error("duplicate node name: {name}")]
    DuplicateNode { name: String },

    #[error("duplicate guard name: {name}")]
    DuplicateGuard { name: String },

    #[error("cyclic guard dependency detected involving: {0:?}")]
    CyclicDependency(Vec<String>),
}

/// Log full context and abort the process.
///
/// Reserved for the fatal class of error: deque overflow, allocator
/// exhaustion, or a lock-free invariant broken outside a debug build
/// (debug builds hit the equivalent `debug_assert!` first). These are
/// unrecoverable because the lock-freedom of the guard algorithms depends
/// on the invariant holding -- continuing would silently corrupt a waiter
/// chain shared by every other thread.
pub fn abort_runtime(context: &str) -> ! {
    tracing::error!(context, "fatal runtime invariant violated, aborting");
    std::process::abort()
}
