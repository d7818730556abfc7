//! Userspace WireGuard control socket client.
//!
//! Speaks the line-oriented cross-platform configuration protocol over the
//! interface's UNIX socket (usually `/var/run/wireguard/<iface>.sock`).
//! A request is `get=1` or `set=1` followed by `key=value` lines and a blank
//! line; the response ends with `errno=N` and a blank line. Keys travel
//! hex-encoded.
//!
//! Reference: https://www.wireguard.com/xplatform/

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;
use wga_networking::WgKey;
use x25519_dalek::{PublicKey, StaticSecret};

use super::{PeerError, PeerTable};
use crate::device::Peer;

type Pairs = Vec<(String, String)>;

/// Peer table of a userspace WireGuard interface.
pub struct UapiPeerTable {
    socket_path: PathBuf,
}

impl UapiPeerTable {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Send one request and collect the response pairs (minus `errno`).
    async fn request(&self, body: &str) -> Result<Pairs, PeerError> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (read, mut write) = stream.into_split();

        write.write_all(body.as_bytes()).await?;
        write.flush().await?;

        let mut lines = BufReader::new(read).lines();
        let mut pairs = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| PeerError::Protocol(format!("malformed line '{line}'")))?;
            pairs.push((key.to_string(), value.to_string()));
        }

        check_errno(pairs)
    }

    async fn get(&self) -> Result<Pairs, PeerError> {
        debug!(socket = %self.socket_path.display(), "Reading interface state");
        self.request("get=1\n\n").await
    }
}

/// Strip the trailing `errno=N` and turn a non-zero value into an error.
fn check_errno(mut pairs: Pairs) -> Result<Pairs, PeerError> {
    let Some((key, value)) = pairs.pop() else {
        return Err(PeerError::Protocol("empty response".to_string()));
    };
    if key != "errno" {
        return Err(PeerError::Protocol(format!(
            "response did not end with errno (got '{key}')"
        )));
    }

    let errno: i32 = value
        .parse()
        .map_err(|_| PeerError::Protocol(format!("bad errno '{value}'")))?;
    if errno != 0 {
        return Err(PeerError::Errno(errno));
    }
    Ok(pairs)
}

fn parse_i64(key: &str, value: &str) -> Result<i64, PeerError> {
    value
        .parse()
        .map_err(|_| PeerError::Protocol(format!("bad {key} '{value}'")))
}

fn handshake_time(sec: i64, nsec: i64) -> Option<DateTime<Utc>> {
    if sec == 0 && nsec == 0 {
        return None;
    }
    DateTime::from_timestamp(sec, u32::try_from(nsec).ok()?)
}

fn finish_peer(peer: Option<&mut Peer>, handshake: &mut (i64, i64)) {
    if let Some(peer) = peer {
        peer.last_handshake_time = handshake_time(handshake.0, handshake.1);
    }
    *handshake = (0, 0);
}

/// Split a `get` response into the interface private key and its peers.
fn parse_device(pairs: &[(String, String)]) -> Result<(Option<WgKey>, Vec<Peer>), PeerError> {
    let mut private_key = None;
    let mut peers: Vec<Peer> = Vec::new();
    let mut handshake = (0i64, 0i64);

    // Every public_key line starts a new peer section.
    for (key, value) in pairs {
        if key == "public_key" {
            finish_peer(peers.last_mut(), &mut handshake);
            let public_key = WgKey::from_hex(value)?;
            peers.push(Peer::new(public_key.to_base64(), Vec::new()));
            continue;
        }

        let Some(peer) = peers.last_mut() else {
            if key == "private_key" {
                private_key = Some(WgKey::from_hex(value)?);
            }
            continue;
        };

        match key.as_str() {
            "endpoint" => {
                let endpoint: SocketAddr = value
                    .parse()
                    .map_err(|_| PeerError::Protocol(format!("bad endpoint '{value}'")))?;
                peer.endpoint = Some(endpoint);
            }
            "allowed_ip" => {
                let net: IpNet = value
                    .parse()
                    .map_err(|_| PeerError::Protocol(format!("bad allowed_ip '{value}'")))?;
                peer.allowed_ips.push(net);
            }
            "last_handshake_time_sec" => handshake.0 = parse_i64(key, value)?,
            "last_handshake_time_nsec" => handshake.1 = parse_i64(key, value)?,
            "rx_bytes" => peer.receive_bytes = parse_i64(key, value)?,
            "tx_bytes" => peer.transmit_bytes = parse_i64(key, value)?,
            _ => {}
        }
    }
    finish_peer(peers.last_mut(), &mut handshake);

    Ok((private_key, peers))
}

fn upsert_request(public_key: &WgKey, preshared_key: Option<&WgKey>, allowed_ips: &[IpNet]) -> String {
    let mut body = String::from("set=1\n");
    let _ = writeln!(body, "public_key={}", public_key.to_hex());
    if let Some(psk) = preshared_key {
        let _ = writeln!(body, "preshared_key={}", psk.to_hex());
    }
    body.push_str("replace_allowed_ips=true\n");
    for net in allowed_ips {
        let _ = writeln!(body, "allowed_ip={net}");
    }
    body.push('\n');
    body
}

fn remove_request(public_key: &WgKey) -> String {
    format!("set=1\npublic_key={}\nremove=true\n\n", public_key.to_hex())
}

#[async_trait]
impl PeerTable for UapiPeerTable {
    async fn add_peer(
        &self,
        public_key: &str,
        preshared_key: Option<&str>,
        allowed_ips: &[IpNet],
    ) -> Result<(), PeerError> {
        let key = WgKey::from_base64(public_key)?;
        let psk = preshared_key.map(WgKey::from_base64).transpose()?;

        self.request(&upsert_request(&key, psk.as_ref(), allowed_ips))
            .await?;
        debug!(public_key = %public_key, "Upserted peer");
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<(), PeerError> {
        let key = WgKey::from_base64(public_key)?;
        self.request(&remove_request(&key)).await?;
        debug!(public_key = %public_key, "Removed peer");
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<Peer>, PeerError> {
        let (_, peers) = parse_device(&self.get().await?)?;
        Ok(peers)
    }

    async fn public_key(&self) -> Result<String, PeerError> {
        let (private_key, _) = parse_device(&self.get().await?)?;
        let private_key = private_key.ok_or_else(|| {
            PeerError::Unavailable("interface has no private key".to_string())
        })?;

        let secret = StaticSecret::from(*private_key.as_bytes());
        let public = PublicKey::from(&secret);
        Ok(WgKey::from_bytes(public.to_bytes()).to_base64())
    }

    async fn ping(&self) -> Result<(), PeerError> {
        if !self.socket_exists() {
            return Err(PeerError::Unavailable(format!(
                "socket {} not found",
                self.socket_path.display()
            )));
        }
        self.get().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    const PRIVATE_HEX: &str = "e84b5a6d2717c1003a13b431570353dbaca9146cf150c5f8575680feba52027a";
    const PEER_HEX: &str = "b85996fecc9c7f1fc6d2572a76eda11d59bcd20be8e543b15ce4bd85a8e75a33";

    fn pairs(text: &str) -> Pairs {
        text.lines()
            .filter(|l| !l.is_empty())
            .map(|l| {
                let (k, v) = l.split_once('=').unwrap();
                (k.to_string(), v.to_string())
            })
            .collect()
    }

    #[test]
    fn test_check_errno() {
        assert!(check_errno(pairs("errno=0")).unwrap().is_empty());
        assert!(matches!(check_errno(pairs("errno=22")), Err(PeerError::Errno(22))));
        assert!(matches!(check_errno(pairs("a=b")), Err(PeerError::Protocol(_))));
        assert!(matches!(check_errno(Vec::new()), Err(PeerError::Protocol(_))));
    }

    #[test]
    fn test_parse_device() {
        let response = format!(
            "private_key={PRIVATE_HEX}\nlisten_port=51820\n\
             public_key={PEER_HEX}\nendpoint=[abcd:23::33]:51820\n\
             last_handshake_time_sec=1700000000\nlast_handshake_time_nsec=5\n\
             tx_bytes=38333\nrx_bytes=2224\npersistent_keepalive_interval=0\n\
             allowed_ip=10.44.0.2/32\nallowed_ip=fd48:4c4:7aa9::2/128\n\
             public_key={}\n",
            "58".repeat(32)
        );
        let (private_key, peers) = parse_device(&pairs(&response)).unwrap();

        assert_eq!(private_key.unwrap().to_hex(), PRIVATE_HEX);
        assert_eq!(peers.len(), 2);

        let first = &peers[0];
        assert_eq!(first.public_key, WgKey::from_hex(PEER_HEX).unwrap().to_base64());
        assert!(first.endpoint.is_some());
        assert_eq!(first.allowed_ips.len(), 2);
        assert_eq!(first.receive_bytes, 2224);
        assert_eq!(first.transmit_bytes, 38333);
        assert_eq!(first.last_handshake_time.unwrap().timestamp(), 1_700_000_000);

        // Never handshaken.
        assert_eq!(peers[1].last_handshake_time, None);
        assert_eq!(peers[1].endpoint, None);
    }

    #[test]
    fn test_requests() {
        let key = WgKey::from_hex(PEER_HEX).unwrap();
        let nets: Vec<IpNet> = vec!["10.44.0.2/32".parse().unwrap()];

        assert_eq!(
            upsert_request(&key, None, &nets),
            format!("set=1\npublic_key={PEER_HEX}\nreplace_allowed_ips=true\nallowed_ip=10.44.0.2/32\n\n")
        );
        assert_eq!(
            remove_request(&key),
            format!("set=1\npublic_key={PEER_HEX}\nremove=true\n\n")
        );
    }

    /// Serve a single canned response on a fresh socket.
    async fn serve_once(response: String) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg0.sock");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Some(line) = lines.next_line().await.unwrap() {
                if line.is_empty() {
                    break;
                }
            }
            write.write_all(response.as_bytes()).await.unwrap();
        });

        (dir, path)
    }

    #[tokio::test]
    async fn test_public_key_derived_from_private_key() {
        let (_dir, path) = serve_once(format!("private_key={PRIVATE_HEX}\nerrno=0\n\n")).await;
        let table = UapiPeerTable::new(&path);

        let expected = {
            let secret = StaticSecret::from(*WgKey::from_hex(PRIVATE_HEX).unwrap().as_bytes());
            WgKey::from_bytes(PublicKey::from(&secret).to_bytes()).to_base64()
        };
        assert_eq!(table.public_key().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_set_reports_errno() {
        let (_dir, path) = serve_once("errno=1\n\n".to_string()).await;
        let table = UapiPeerTable::new(&path);

        let key = WgKey::from_hex(PEER_HEX).unwrap().to_base64();
        let err = table.remove_peer(&key).await.unwrap_err();
        assert!(matches!(err, PeerError::Errno(1)));
    }

    #[tokio::test]
    async fn test_ping_missing_socket() {
        let table = UapiPeerTable::new("/nonexistent/wg0.sock");
        assert!(matches!(table.ping().await, Err(PeerError::Unavailable(_))));
    }
}
