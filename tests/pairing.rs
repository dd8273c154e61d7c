//! The invite/join round trip, end to end minus the network: the code is
//! generated on the inviter, decoded on the joiner, and the pairing
//! exchange runs over an in-memory stream. Afterwards both trust stores
//! and the joiner's config must reflect the new relationship.

use std::{fs, sync::Arc, time::Duration};

use libp2p::PeerId;

use codec::invite::{Invite, InviteCode};
use peerup::{
    config::{Config, RelayDescriptor, edit},
    invite::{self, InviteRegistry},
};
use service::authorized::AuthorizedPeers;

fn relay_descriptor() -> RelayDescriptor {
    let peer = PeerId::random();
    RelayDescriptor {
        address: format!("/ip4/203.0.113.7/tcp/4001/p2p/{peer}")
            .parse()
            .unwrap(),
        peer,
    }
}

#[tokio::test]
async fn invite_join_round_trip_updates_both_sides() {
    let inviter_dir = tempfile::tempdir().unwrap();
    let joiner_dir = tempfile::tempdir().unwrap();

    let inviter_peer = PeerId::random();
    let joiner_peer = PeerId::random();
    let relay = relay_descriptor();

    // Inviter generates the code with a 5 minute TTL and the friendly
    // name "home".
    let registry = Arc::new(InviteRegistry::default());
    let code = invite::generate(
        &registry,
        std::slice::from_ref(&relay),
        inviter_peer,
        "home-net",
        "home",
        Duration::from_secs(300),
    )
    .unwrap();

    // Joiner decodes it and learns where to go.
    let decoded = match InviteCode::decode(&code).unwrap() {
        Invite::V2(decoded) => decoded,
        other => panic!("expected a v2 invite, got {other:?}"),
    };
    assert_eq!(decoded.inviter, inviter_peer);
    assert_eq!(decoded.relay, relay.address);
    assert_eq!(decoded.namespace, "home-net");

    // The pairing stream, with each side owning its end.
    let inviter_set =
        Arc::new(AuthorizedPeers::load(&inviter_dir.path().join("authorized_keys")).unwrap());
    let (inviter_end, joiner_end) = tokio::io::duplex(1024);

    let inviter_task = {
        let registry = registry.clone();
        let inviter_set = inviter_set.clone();
        tokio::spawn(async move {
            let mut stream = inviter_end;
            invite::inviter_exchange(&mut stream, joiner_peer, &registry, &inviter_set).await
        })
    };

    let token = decoded.token;
    let joiner_task = tokio::spawn(async move {
        let mut stream = joiner_end;
        invite::joiner_exchange(&mut stream, &token, "laptop").await
    });

    let paired = inviter_task.await.unwrap().unwrap();
    let joined = joiner_task.await.unwrap().unwrap();

    // Both sides display the same verification code.
    assert_eq!(paired.short_code, joined.short_code);

    // Inviter: the joiner is authorized under its announced name.
    assert!(inviter_set.contains(&joiner_peer));
    assert_eq!(inviter_set.label_of(&joiner_peer).as_deref(), Some("laptop"));

    // Joiner: records the inviter and points names.home at it.
    let joiner_set =
        AuthorizedPeers::load(&joiner_dir.path().join("authorized_keys")).unwrap();
    joiner_set
        .add(inviter_peer, Some(joined.inviter_name.clone()))
        .unwrap();
    assert_eq!(joined.inviter_name, "home");

    let joiner_config = joiner_dir.path().join("config.toml");
    fs::write(
        &joiner_config,
        format!(
            r#"version = 1

[network]
listen-addresses = ["/ip4/0.0.0.0/tcp/0"]

[relay]
addresses = ["{}"]

[discovery]
rendezvous = "home-net"
"#,
            relay.address
        ),
    )
    .unwrap();

    edit::set_name_binding(&joiner_config, &joined.inviter_name, &inviter_peer).unwrap();

    let reloaded = Config::load(&joiner_config).unwrap();
    assert_eq!(reloaded.name_bindings().unwrap()["home"], inviter_peer);

    // The invite is spent.
    assert!(!registry.has_active());
}

#[tokio::test]
async fn code_transmission_is_lossless_through_text() {
    // Codes travel through chats and shells; whitespace mangling at the
    // edges must not break them.
    let registry = InviteRegistry::default();
    let relay = relay_descriptor();
    let inviter = PeerId::random();

    let code = invite::generate(
        &registry,
        std::slice::from_ref(&relay),
        inviter,
        "alpha",
        "desk",
        Duration::from_secs(60),
    )
    .unwrap();

    let mangled = format!("  {code}\n");
    let decoded = InviteCode::decode(&mangled).unwrap();

    match decoded {
        Invite::V2(decoded) => {
            assert_eq!(decoded.inviter, inviter);
            assert_eq!(decoded.namespace, "alpha");
        }
        other => panic!("expected a v2 invite, got {other:?}"),
    }
}
