//! Two in-process peers talking over loopback TCP.
//!
//! The responder listens, the initiator connects, and both run the BIP151
//! handshake, BIP150 mutual authentication, a ping/pong exchange and
//! periodic rekeys over the same encrypted link.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info};

use bip15x_common::helpers::short_fingerprint;
use bip15x_crypto::cipher::{AAD_LEN, TAG_LEN};
use bip15x_crypto::message::command;
use bip15x_crypto::{
    Connection, IdentityKeypair, Inbound, Message, PeerAuth, PeerId, PublicIdentity,
    SessionDirection,
};

/// Largest frame either peer will buffer.
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;
const IO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub listen: SocketAddr,
    pub pings: u32,
    pub rekey_every: u32,
}

#[derive(Debug)]
pub struct DemoReport {
    pub initiator: PeerId,
    pub responder: PeerId,
    pub pings: u32,
    pub rekeys: u32,
    pub outgoing_sid: String,
    pub incoming_sid: String,
}

/// One side of an encrypted TCP link.
pub struct Link {
    stream: TcpStream,
    conn: Connection,
}

impl Link {
    /// Run the handshake over `stream`. Both sides send `encinit` first and
    /// then answer whatever arrives, so the two halves interleave.
    pub async fn establish(mut stream: TcpStream) -> Result<Self> {
        let mut conn = Connection::new()?;

        let encinit = conn.outgoing_encinit();
        write_frame(&mut stream, &Message::new(command::ENCINIT, encinit.to_vec())).await?;

        while !conn.is_complete() {
            let msg = read_plain(&mut stream).await?;
            if msg.is(command::ENCINIT) {
                conn.process_encinit(&msg.payload)?;
                let encack = conn.incoming_encack()?;
                write_frame(&mut stream, &Message::new(command::ENCACK, encack.to_vec())).await?;
            } else if msg.is(command::ENCACK) {
                conn.process_encack(&msg.payload, true)?;
            } else {
                bail!(
                    "unexpected {:?} during handshake",
                    msg.command_str().unwrap_or("<binary>")
                );
            }
        }

        debug!(
            out = %fingerprint(&conn, SessionDirection::Outgoing),
            "link established"
        );
        Ok(Self { stream, conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Seal and send `msg`, rekeying first if the current key is spent.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        if self.conn.rekey_needed() {
            self.rekey().await?;
        }
        let packet = self.conn.seal_message(msg)?;
        self.stream.write_all(&packet).await?;
        Ok(())
    }

    pub async fn rekey(&mut self) -> Result<()> {
        let signal = self.conn.rekey_outgoing()?;
        self.stream.write_all(&signal).await?;
        debug!("outgoing keys ratcheted");
        Ok(())
    }

    /// Receive the next message, applying any rekey signals on the way.
    pub async fn recv(&mut self) -> Result<Message> {
        loop {
            let mut aad = [0u8; AAD_LEN];
            timeout(IO_TIMEOUT, self.stream.read_exact(&mut aad))
                .await
                .context("timed out waiting for packet")??;

            let len = self.conn.peek_length(&aad)? as usize;
            if len > MAX_FRAME_LEN {
                bail!("peer announced a {len} byte packet");
            }
            let mut packet = vec![0u8; AAD_LEN + len + TAG_LEN];
            packet[..AAD_LEN].copy_from_slice(&aad);
            self.stream.read_exact(&mut packet[AAD_LEN..]).await?;

            match self.conn.open_message(&packet)? {
                Inbound::Message(msg) => return Ok(msg),
                Inbound::Rekeyed => debug!("incoming keys ratcheted"),
            }
        }
    }

    /// Drive `auth` until our side of the exchange is finished.
    pub async fn authenticate(&mut self, auth: &mut PeerAuth) -> Result<()> {
        if let Some(first) = auth.start(&self.conn)? {
            self.send(&first).await?;
        }
        while !auth.is_finished() {
            let msg = self.recv().await?;
            if let Some(response) = auth.handle(&self.conn, &msg)? {
                self.send(&response).await?;
            }
        }
        Ok(())
    }
}

async fn write_frame(stream: &mut TcpStream, msg: &Message) -> Result<()> {
    stream.write_all(&msg.encode()?).await?;
    Ok(())
}

async fn read_plain(stream: &mut TcpStream) -> Result<Message> {
    let mut len = [0u8; AAD_LEN];
    timeout(IO_TIMEOUT, stream.read_exact(&mut len))
        .await
        .context("timed out during handshake")??;

    let body_len = u32::from_le_bytes(len) as usize;
    if body_len > MAX_FRAME_LEN {
        bail!("handshake frame of {body_len} bytes");
    }
    let mut frame = vec![0u8; AAD_LEN + body_len];
    frame[..AAD_LEN].copy_from_slice(&len);
    stream.read_exact(&mut frame[AAD_LEN..]).await?;
    Ok(Message::decode(frame)?)
}

fn fingerprint(conn: &Connection, direction: SessionDirection) -> String {
    conn.session_id(direction)
        .map(|sid| short_fingerprint(&sid[..]))
        .unwrap_or_default()
}

async fn serve(
    listener: TcpListener,
    identity: IdentityKeypair,
    authorized: Vec<PublicIdentity>,
) -> Result<PeerId> {
    let (stream, peer_addr) = listener.accept().await?;
    info!("responder accepted {}", peer_addr);

    let mut link = Link::establish(stream).await?;
    let keys = authorized.iter().map(|p| *p.public_key()).collect();
    let mut auth = PeerAuth::responder(identity, keys);
    link.authenticate(&mut auth).await?;

    let peer = auth
        .peer_key()
        .map(PeerId::from_public_key)
        .ok_or_else(|| anyhow!("initiator not authenticated"))?;
    info!("responder authenticated initiator {}", peer);

    loop {
        let msg = link.recv().await?;
        if msg.is("ping") {
            link.send(&Message::new("pong", msg.payload)).await?;
        } else if msg.is("bye") {
            break;
        } else {
            bail!("unexpected {:?}", msg.command_str());
        }
    }
    Ok(peer)
}

/// Run both peers to completion.
pub async fn run(options: DemoOptions) -> Result<DemoReport> {
    let client_identity = IdentityKeypair::generate()?;
    let server_identity = IdentityKeypair::generate()?;
    let client_public = PublicIdentity::from_bytes(&client_identity.public_key_bytes())?;
    let server_key = *server_identity.public_key();
    let responder = server_identity.peer_id();

    let listener = TcpListener::bind(options.listen)
        .await
        .with_context(|| format!("failed to bind {}", options.listen))?;
    let addr = listener.local_addr()?;
    info!("responder listening on {}", addr);

    let server = tokio::spawn(serve(listener, server_identity, vec![client_public]));

    let stream = TcpStream::connect(addr).await?;
    let mut link = Link::establish(stream).await?;
    let mut auth = PeerAuth::initiator(client_identity.clone(), server_key);
    link.authenticate(&mut auth).await?;
    info!("initiator authenticated responder {}", responder);

    let mut rekeys = 0;
    for i in 0..options.pings {
        if options.rekey_every > 0 && i > 0 && i % options.rekey_every == 0 {
            link.rekey().await?;
            rekeys += 1;
        }

        let nonce: [u8; 8] = rand::random();
        link.send(&Message::new("ping", Bytes::copy_from_slice(&nonce)))
            .await?;

        let pong = link.recv().await?;
        if !pong.is("pong") || pong.payload.as_ref() != nonce {
            bail!("bad pong for ping {}", i);
        }
    }
    link.send(&Message::new("bye", Bytes::new())).await?;

    let authenticated = server.await.context("responder task panicked")??;
    if authenticated != client_identity.peer_id() {
        bail!("responder authenticated the wrong identity");
    }

    Ok(DemoReport {
        initiator: client_identity.peer_id(),
        responder,
        pings: options.pings,
        rekeys,
        outgoing_sid: fingerprint(link.connection(), SessionDirection::Outgoing),
        incoming_sid: fingerprint(link.connection(), SessionDirection::Incoming),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_runs_to_completion() {
        bip15x_crypto::context::init();
        let report = run(DemoOptions {
            listen: "127.0.0.1:0".parse().unwrap(),
            pings: 10,
            rekey_every: 3,
        })
        .await
        .unwrap();

        assert_eq!(report.pings, 10);
        assert_eq!(report.rekeys, 3);
        assert_ne!(report.initiator, report.responder);
        assert_eq!(report.outgoing_sid.len(), 8);
    }
}
