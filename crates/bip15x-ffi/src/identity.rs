use anyhow::{Context, Result};
use bip15x_crypto::{IdentityKeypair, PeerId};
use log::{info, warn};
use once_cell::sync::Lazy;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

// Global Identity Storage
static IDENTITY: Lazy<Mutex<Option<IdentityKeypair>>> = Lazy::new(|| Mutex::new(None));

/// Load `identity.key` from `storage_path`, or generate and save a new one.
pub fn init_identity(storage_path: &str) -> Result<PeerId> {
    let dir = PathBuf::from(storage_path);
    let private_path = dir.join("identity.key");

    if private_path.exists() {
        match IdentityKeypair::load(&private_path) {
            Ok(keypair) => {
                let peer_id = keypair.peer_id();
                info!("Loaded identity {} from {:?}", peer_id, private_path);
                set(keypair);
                return Ok(peer_id);
            }
            Err(e) => warn!("Ignoring unreadable identity at {:?}: {:#}", private_path, e),
        }
    }

    let keypair = IdentityKeypair::generate()?;
    fs::create_dir_all(&dir).context("Failed to create identity dir")?;
    keypair.save(&private_path, dir.join("identity.pub"))?;

    let peer_id = keypair.peer_id();
    info!("Generated new identity {} at {:?}", peer_id, private_path);
    set(keypair);
    Ok(peer_id)
}

fn set(keypair: IdentityKeypair) {
    *IDENTITY.lock().unwrap_or_else(PoisonError::into_inner) = Some(keypair);
}

/// Run `f` with the loaded identity, if any.
pub fn with_identity<T>(f: impl FnOnce(&IdentityKeypair) -> T) -> Option<T> {
    IDENTITY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(f)
}

pub fn public_key() -> Option<[u8; 33]> {
    with_identity(|keypair| keypair.public_key_bytes())
}

pub fn clear() {
    IDENTITY.lock().unwrap_or_else(PoisonError::into_inner).take();
}
