//! The local admin API.
//!
//! A Unix socket beside the config file, protected by a cookie file that
//! only the owner can read: possession of the cookie is the entire
//! authentication scheme, enforced by filesystem permissions. Requests
//! and responses are length-prefixed JSON, one request per connection.

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{UnixListener, UnixStream},
};

use service::short_peer;

use crate::{Daemon, invite, lifecycle, pingpong};

pub const COOKIE_FILE: &str = "admin.cookie";

const MAX_REQUEST: usize = 64 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "op")]
pub enum Request {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "services.list")]
    ServicesList,
    #[serde(rename = "peers.list")]
    PeersList,
    #[serde(rename = "ping")]
    Ping { target: String },
    #[serde(rename = "proxy.connect")]
    ProxyConnect {
        local: String,
        target: String,
        service: String,
    },
    #[serde(rename = "proxy.disconnect")]
    ProxyDisconnect { local: String },
    #[serde(rename = "auth.list")]
    AuthList,
    #[serde(rename = "invite.new")]
    InviteNew { name: String, ttl_secs: u64 },
    #[serde(rename = "confirm")]
    Confirm,
    #[serde(rename = "stop")]
    Stop,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Envelope {
    pub cookie: String,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Response {
    fn success(data: Value) -> Self {
        Self {
            ok: true,
            error: None,
            data,
        }
    }

    fn failure(error: impl ToString) -> Self {
        Self {
            ok: false,
            error: Some(error.to_string()),
            data: Value::Null,
        }
    }
}

pub fn cookie_path(socket: &Path) -> PathBuf {
    socket.with_file_name(COOKIE_FILE)
}

fn write_cookie(path: &Path) -> Result<String> {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let cookie = hex::encode(bytes);

    service::fs::write_atomic(path, cookie.as_bytes(), 0o600)?;
    Ok(cookie)
}

async fn write_frame<S>(stream: &mut S, bytes: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u32().await? as usize;
    if len > MAX_REQUEST {
        return Err(anyhow!("request of {len} bytes exceeds limit"));
    }

    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes).await?;
    Ok(bytes)
}

/// Bind the admin socket and serve requests until shutdown.
pub async fn serve(daemon: Arc<Daemon>, socket: PathBuf) -> Result<()> {
    let _ = fs::remove_file(&socket);
    let listener = UnixListener::bind(&socket)
        .with_context(|| format!("bind admin socket {}", socket.display()))?;
    fs::set_permissions(&socket, fs::Permissions::from_mode(0o600))?;

    let cookie = write_cookie(&cookie_path(&socket))?;
    log::info!("admin api listening on {}", socket.display());

    let shutdown = daemon.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                let daemon = daemon.clone();
                let cookie = cookie.clone();

                tokio::spawn(async move {
                    if let Err(error) = handle_connection(stream, daemon, cookie).await {
                        log::debug!("admin connection error: {error}");
                    }
                });
            }
        }
    }

    let _ = fs::remove_file(&socket);
    Ok(())
}

async fn handle_connection(
    mut stream: UnixStream,
    daemon: Arc<Daemon>,
    cookie: String,
) -> Result<()> {
    let bytes = read_frame(&mut stream).await?;
    let envelope: Envelope = serde_json::from_slice(&bytes)?;

    let response = if envelope.cookie != cookie {
        Response::failure("bad admin cookie")
    } else {
        dispatch(&daemon, envelope.request).await
    };

    write_frame(&mut stream, &serde_json::to_vec(&response)?).await
}

async fn dispatch(daemon: &Daemon, request: Request) -> Response {
    match handle(daemon, request).await {
        Ok(data) => Response::success(data),
        Err(error) => Response::failure(error),
    }
}

async fn handle(daemon: &Daemon, request: Request) -> Result<Value> {
    match request {
        Request::Status => {
            let relays: Vec<Value> = daemon
                .relay_client
                .states()
                .into_iter()
                .map(|(peer, state)| {
                    json!({ "relay": short_peer(&peer), "state": state.as_str() })
                })
                .collect();

            let listen: Vec<String> = daemon
                .handle
                .listen_addrs()
                .await
                .into_iter()
                .map(|it| it.to_string())
                .collect();

            Ok(json!({
                "peer_id": daemon.local_peer_id.to_base58(),
                "uptime_secs": daemon.started.elapsed().as_secs(),
                "gating": daemon.config.security.gating,
                "reachability": if daemon.relay_client.reachable() { "ok" } else { "degraded" },
                "relays": relays,
                "listen": listen,
                "authorized_peers": daemon.authorized.len(),
                "pending_commit": lifecycle::pending_commit(&daemon.config_path)?.is_some(),
            }))
        }

        Request::ServicesList => {
            let specs = daemon.config.service_specs()?;
            let services: Vec<Value> = specs
                .iter()
                .map(|spec| {
                    let counts = daemon.statistics.get(&spec.name);
                    json!({
                        "name": spec.name,
                        "protocol": spec.protocol,
                        "local_address": spec.local_address,
                        "enabled": spec.enabled,
                        "received_bytes": counts.as_ref().map(|it| it.received_bytes).unwrap_or(0),
                        "send_bytes": counts.as_ref().map(|it| it.send_bytes).unwrap_or(0),
                    })
                })
                .collect();

            Ok(json!({ "services": services }))
        }

        Request::PeersList => {
            let connected = daemon.handle.connected_peers().await;
            let peers: Vec<Value> = connected
                .iter()
                .map(|peer| {
                    json!({
                        "peer_id": peer.to_base58(),
                        "label": daemon.authorized.label_of(peer),
                        "authorized": daemon.authorized.contains(peer),
                    })
                })
                .collect();

            Ok(json!({ "peers": peers }))
        }

        Request::Ping { target } => {
            let peer = daemon.discovery.resolve_target(&target)?;
            let rtt = pingpong::ping(
                &daemon.handle,
                &daemon.discovery,
                peer,
                &daemon.config.protocols.ping_pong.id,
            )
            .await?;

            Ok(json!({
                "peer_id": peer.to_base58(),
                "rtt_ms": rtt.as_secs_f64() * 1000.0,
            }))
        }

        Request::ProxyConnect {
            local,
            target,
            service,
        } => {
            let local = local
                .parse()
                .with_context(|| format!("invalid local address {local:?}"))?;
            let peer = daemon.discovery.resolve_target(&target)?;

            // A service configured locally may carry a custom protocol id;
            // otherwise derive the default identifier from the name.
            let protocol = daemon
                .config
                .service_specs()?
                .into_iter()
                .find(|it| it.name == service)
                .map(|it| it.protocol)
                .unwrap_or_else(|| crate::config::service_protocol_id(&service));

            let bound = daemon
                .forwards
                .connect(local, peer, &service, protocol)
                .await?;

            Ok(json!({ "local": bound.to_string() }))
        }

        Request::ProxyDisconnect { local } => {
            let local = local
                .parse()
                .with_context(|| format!("invalid local address {local:?}"))?;
            daemon.forwards.disconnect(local)?;
            Ok(Value::Null)
        }

        Request::AuthList => {
            let entries: Vec<Value> = daemon
                .authorized
                .list()
                .into_iter()
                .map(|entry| {
                    json!({
                        "peer_id": entry.peer.to_base58(),
                        "label": entry.label,
                        "attrs": entry.attrs
                            .into_iter()
                            .collect::<std::collections::BTreeMap<String, String>>(),
                    })
                })
                .collect();

            Ok(json!({ "peers": entries }))
        }

        Request::InviteNew { name, ttl_secs } => {
            let ttl = if ttl_secs == 0 {
                invite::DEFAULT_TTL
            } else {
                std::time::Duration::from_secs(ttl_secs)
            };

            let code = invite::generate(
                &daemon.registry,
                daemon.relay_client.relays(),
                daemon.local_peer_id,
                daemon.config.discovery.namespace(),
                &name,
                ttl,
            )?;

            Ok(json!({ "code": code, "ttl_secs": ttl.as_secs() }))
        }

        Request::Confirm => {
            lifecycle::confirm(&daemon.config_path)?;
            daemon.confirm_cancel.cancel();
            Ok(Value::Null)
        }

        Request::Stop => {
            log::info!("stop requested through the admin api");
            daemon.shutdown.cancel();
            Ok(Value::Null)
        }
    }
}

/// Client side, used by the CLI subcommands.
pub async fn call(socket: &Path, request: Request) -> Result<Response> {
    let cookie = fs::read_to_string(cookie_path(socket))
        .with_context(|| "cannot read the admin cookie; is the daemon running?")?;

    let mut stream = UnixStream::connect(socket)
        .await
        .with_context(|| "cannot connect to the admin socket; is the daemon running?")?;

    let envelope = Envelope { cookie, request };
    write_frame(&mut stream, &serde_json::to_vec(&envelope)?).await?;

    let bytes = read_frame(&mut stream).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_format_is_flat() {
        let envelope = Envelope {
            cookie: "c0ffee".to_string(),
            request: Request::Ping {
                target: "home".to_string(),
            },
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["op"], "ping");
        assert_eq!(value["cookie"], "c0ffee");
        assert_eq!(value["target"], "home");

        let back: Envelope = serde_json::from_value(value).unwrap();
        assert!(matches!(back.request, Request::Ping { target } if target == "home"));
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"{\"ok\":true}").await.unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap(), b"{\"ok\":true}");
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        client.write_u32((MAX_REQUEST + 1) as u32).await.unwrap();
        assert!(read_frame(&mut server).await.is_err());
    }
}
