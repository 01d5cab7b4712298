//! Process-wide secp256k1 context.
//!
//! The context must be created once with [`init`] before any session or
//! identity is built, and may be released with [`shutdown`]. An established
//! connection never touches the context again, so shutting down only stops
//! new key generation and signing.

use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::Lazy;
use secp256k1::{All, Secp256k1};

use crate::error::{ChannelError, Result};

static CONTEXT: Lazy<RwLock<Option<Arc<Secp256k1<All>>>>> = Lazy::new(|| RwLock::new(None));

/// Create the shared context. Returns `true` if this call created it,
/// `false` if it was already initialized.
pub fn init() -> bool {
    let mut guard = CONTEXT.write().unwrap_or_else(PoisonError::into_inner);
    if guard.is_some() {
        return false;
    }

    let mut secp = Secp256k1::new();
    secp.randomize(&mut rand::thread_rng());
    *guard = Some(Arc::new(secp));
    tracing::debug!("secp256k1 context initialized");
    true
}

/// Release the shared context. Returns `true` if a context was released.
pub fn shutdown() -> bool {
    let mut guard = CONTEXT.write().unwrap_or_else(PoisonError::into_inner);
    let released = guard.take().is_some();
    if released {
        tracing::debug!("secp256k1 context released");
    }
    released
}

/// Whether [`init`] has been called (and not undone by [`shutdown`]).
pub fn is_initialized() -> bool {
    CONTEXT
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

/// Handle to the shared context.
pub(crate) fn get() -> Result<Arc<Secp256k1<All>>> {
    CONTEXT
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(ChannelError::ContextNotInitialized)
}
