//! bip15x CLI tools: identity keys, peer authorization, loopback demo.

#![forbid(unsafe_code)]

mod demo;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use bip15x_crypto::{AuthorizedPeers, IdentityKeypair, PeerId};

const PRIVATE_KEY_FILE: &str = "identity.key";
const PUBLIC_KEY_FILE: &str = "identity.pub";
const PEERS_FILE: &str = "authorized_peers.json";

#[derive(Parser, Debug)]
#[command(name = "bip15x")]
#[command(about = "bip15x encrypted channel tools")]
struct Args {
    /// Directory holding the identity and authorized peers
    #[arg(long, env = "BIP15X_DATA_DIR", default_value = ".bip15x", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new secp256k1 identity keypair
    Keygen {
        /// Replace an existing identity
        #[arg(long)]
        force: bool,
    },

    /// Show the peer ID of an identity
    ShowId {
        /// Public key file path (defaults to the data directory's identity)
        #[arg(short, long)]
        key: Option<PathBuf>,
    },

    /// Authorize a peer to authenticate to us
    Authorize {
        /// Local name for the peer
        name: String,
        /// The peer's ID, as printed by `show-id`
        peer_id: String,
    },

    /// Remove an authorized peer
    Revoke { name: String },

    /// List authorized peers
    Peers,

    /// Run two peers through handshake, authentication, ping/pong and rekey
    Demo {
        /// Address the responder listens on
        #[arg(long, env = "BIP15X_LISTEN_ADDR", default_value = "127.0.0.1:0")]
        listen: SocketAddr,

        /// Number of ping/pong round trips
        #[arg(long, default_value_t = 5)]
        pings: u32,

        /// Rekey the initiator's outgoing keys every N pings (0 = never)
        #[arg(long, default_value_t = 2)]
        rekey_every: u32,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    bip15x_common::init_tracing();

    let args = Args::parse();
    bip15x_crypto::context::init();

    match args.command {
        Command::Keygen { force } => keygen(&args.data_dir, force)?,
        Command::ShowId { key } => {
            let path = key.unwrap_or_else(|| args.data_dir.join(PUBLIC_KEY_FILE));
            let identity = IdentityKeypair::load_public(&path)
                .with_context(|| format!("no identity at {}", path.display()))?;
            println!("{}", identity.peer_id());
        }
        Command::Authorize { name, peer_id } => {
            let peer_id = PeerId::parse(&peer_id).context("invalid peer ID")?;
            let path = args.data_dir.join(PEERS_FILE);
            let mut peers = AuthorizedPeers::load_or_default(&path)?;
            if let Some(previous) = peers.insert(&name, peer_id.clone()) {
                println!("Replacing {} ({})", name, previous);
            }
            std::fs::create_dir_all(&args.data_dir)?;
            peers.save(&path)?;
            println!("Authorized {} as {}", peer_id, name);
        }
        Command::Revoke { name } => {
            let path = args.data_dir.join(PEERS_FILE);
            let mut peers = AuthorizedPeers::load_or_default(&path)?;
            if peers.remove(&name).is_none() {
                bail!("no authorized peer named {}", name);
            }
            peers.save(&path)?;
            println!("Revoked {}", name);
        }
        Command::Peers => {
            let peers = AuthorizedPeers::load_or_default(args.data_dir.join(PEERS_FILE))?;
            if peers.is_empty() {
                println!("No authorized peers");
            }
            for (name, id) in peers.iter() {
                println!("{:<20} {}", name, id);
            }
        }
        Command::Demo {
            listen,
            pings,
            rekey_every,
        } => {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let report = rt.block_on(demo::run(demo::DemoOptions {
                listen,
                pings,
                rekey_every,
            }))?;

            println!("Initiator:  {}", report.initiator);
            println!("Responder:  {}", report.responder);
            println!("Session ID: out {} / in {}", report.outgoing_sid, report.incoming_sid);
            println!("Round trips: {} ({} rekeys)", report.pings, report.rekeys);
        }
        Command::Version => {
            println!("bip15x {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn keygen(data_dir: &Path, force: bool) -> Result<()> {
    let private_path = data_dir.join(PRIVATE_KEY_FILE);
    let public_path = data_dir.join(PUBLIC_KEY_FILE);
    if private_path.exists() && !force {
        bail!(
            "{} already exists (use --force to replace it)",
            private_path.display()
        );
    }

    println!("Generating secp256k1 keypair...");
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    let keypair = IdentityKeypair::generate()?;
    keypair.save(&private_path, &public_path)?;

    println!("Private key: {}", private_path.display());
    println!("Public key:  {}", public_path.display());
    println!("Public hex:  {}", hex::encode(keypair.public_key_bytes()));
    println!("Peer ID:     {}", keypair.peer_id());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_demo_args() {
        let args = Args::try_parse_from([
            "bip15x",
            "--data-dir",
            "/tmp/x",
            "demo",
            "--pings",
            "3",
        ])
        .unwrap();
        assert_eq!(args.data_dir, PathBuf::from("/tmp/x"));
        match args.command {
            Command::Demo {
                pings, rekey_every, ..
            } => {
                assert_eq!(pings, 3);
                assert_eq!(rekey_every, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_keygen_refuses_overwrite() {
        bip15x_crypto::context::init();
        let dir = tempfile::tempdir().unwrap();

        keygen(dir.path(), false).unwrap();
        let first = IdentityKeypair::load(dir.path().join(PRIVATE_KEY_FILE)).unwrap();
        assert!(keygen(dir.path(), false).is_err());

        keygen(dir.path(), true).unwrap();
        let second = IdentityKeypair::load(dir.path().join(PRIVATE_KEY_FILE)).unwrap();
        assert_ne!(first.peer_id(), second.peer_id());
    }
}
