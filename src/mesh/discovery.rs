//! Multicast peer discovery.
//!
//! Daemons listen on a multicast group and answer probes with their
//! profile over unicast UDP. Discovery sends one probe and collects
//! answers until a deadline. Messages carry the shared cookie; anything
//! else is ignored.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::Result;

use super::NodeProfile;

/// The sykli multicast group.
pub const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 77, 83, 1);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Message {
    /// "Who is out there?"
    Probe,
    /// A node's answer (also sent unsolicited on startup).
    Announce { profile: NodeProfile },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Packet {
    cookie: String,
    #[serde(flatten)]
    message: Message,
}

/// Answer probes on the multicast group forever. Run inside the daemon.
pub async fn responder(profile: NodeProfile, port: u16, cookie: String) -> Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    socket.join_multicast_v4(MULTICAST_ADDR, Ipv4Addr::UNSPECIFIED)?;

    // Unsolicited announce so existing peers learn about us quickly.
    let announce = encode(&cookie, Message::Announce { profile: profile.clone() })?;
    let _ = socket.send_to(&announce, (MULTICAST_ADDR, port)).await;

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (len, peer) = socket.recv_from(&mut buf).await?;
        match decode(&buf[..len], &cookie) {
            Some(Message::Probe) => {
                debug!(%peer, "answering probe");
                let reply = encode(&cookie, Message::Announce { profile: profile.clone() })?;
                if let Err(e) = socket.send_to(&reply, peer).await {
                    warn!(%peer, "failed to answer probe: {}", e);
                }
            }
            Some(Message::Announce { .. }) | None => {}
        }
    }
}

/// Probe the group and collect profiles until `wait` elapses.
pub async fn discover(port: u16, cookie: &str, wait: Duration) -> Result<Vec<NodeProfile>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    let probe = encode(cookie, Message::Probe)?;
    // No multicast route means no mesh, not a failure.
    if let Err(e) = socket.send_to(&probe, (MULTICAST_ADDR, port)).await {
        warn!("discovery probe failed: {}", e);
        return Ok(Vec::new());
    }

    let mut found: Vec<NodeProfile> = Vec::new();
    let deadline = tokio::time::Instant::now() + wait;
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let timeout = deadline.saturating_duration_since(tokio::time::Instant::now());
        if timeout.is_zero() {
            break;
        }
        match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Err(e)) => {
                warn!("discovery recv failed: {}", e);
                break;
            }
            Ok(Ok((len, peer))) => {
                if let Some(Message::Announce { mut profile }) = decode(&buf[..len], cookie) {
                    // The advertised host is whatever address answered us.
                    profile.host = peer.ip().to_string();
                    if !found.iter().any(|p| p.name == profile.name) {
                        found.push(profile);
                    }
                }
            }
        }
    }

    Ok(found)
}

fn encode(cookie: &str, message: Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&Packet {
        cookie: cookie.to_string(),
        message,
    })?)
}

/// `None` for foreign or wrong-cookie packets.
fn decode(bytes: &[u8], cookie: &str) -> Option<Message> {
    let packet: Packet = serde_json::from_slice(bytes).ok()?;
    (packet.cookie == cookie).then_some(packet.message)
}
