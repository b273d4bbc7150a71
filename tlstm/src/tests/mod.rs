use std::sync::Arc;

use tracing::info;

use crate::{
    BindError, CertMemoryStore, ClientContext, SecurityLevel, ServerContext, SessionRecord, Side,
    TrustConfig, VerifyStatus, classify,
};

mod util;
use util::{TestIdentity, colonize, identity, run_handshake, subscribe};

fn store_with_identity(side: Side, id: &TestIdentity) -> Arc<CertMemoryStore> {
    let store = Arc::new(CertMemoryStore::new());
    let fp = store
        .add_identity(vec![id.cert.clone()], id.key.clone_key())
        .unwrap();
    store.set_default_identity(side, fp);
    store
}

#[test]
fn end_to_end_binds_both_directions() {
    let _guard = subscribe();

    let manager = identity("mgr1", vec!["mgr1.example".into()]);
    let agent = identity("agent7", vec!["agent7.example".into()]);

    let mgr_store = store_with_identity(Side::Client, &manager);
    mgr_store.add_peer(agent.cert.clone()).unwrap();
    let mut mgr_trust = TrustConfig::new();
    mgr_trust.their_fingerprint(colonize(&agent.fingerprint));

    let agent_store = store_with_identity(Side::Server, &agent);
    agent_store.add_peer(manager.cert.clone()).unwrap();
    let agent_trust = TrustConfig::new();

    let client_ctx = ClientContext::build(&mgr_trust, mgr_store).unwrap();
    let server_ctx = ServerContext::build(&agent_trust, agent_store).unwrap();

    let mut client = client_ctx.connect("agent7.example").unwrap();
    let mut server = server_ctx.accept().unwrap();
    run_handshake(&mut client, &mut server).unwrap();
    info!("handshake complete, binding both directions");

    let inbound = SessionRecord::bind(server.peer_certificates(), &agent_trust).unwrap();
    assert_eq!(inbound.security_name(), "mgr1");
    assert_eq!(inbound.security_level(), SecurityLevel::AuthPriv);
    assert_eq!(inbound.fingerprint(), &manager.fingerprint);

    let outbound = SessionRecord::bind(client.peer_certificates(), &mgr_trust).unwrap();
    assert_eq!(outbound.security_name(), "agent7");
    assert_eq!(outbound.security_level(), SecurityLevel::AuthPriv);
    assert_ne!(inbound.session_id(), outbound.session_id());
}

#[test]
fn self_signed_policy_admits_unpinned_clients() {
    let _guard = subscribe();

    let manager = identity("mgr1", Vec::new());
    let agent = identity("agent7", Vec::new());

    let mgr_store = store_with_identity(Side::Client, &manager);
    let peer = mgr_store.add_peer(agent.cert.clone()).unwrap();
    mgr_store.set_default_peer(peer);
    let client_ctx = ClientContext::build(&TrustConfig::new(), mgr_store).unwrap();

    // The agent has never heard of this manager; only policy can admit it.
    let server_ctx = |allow: bool| {
        let store = store_with_identity(Side::Server, &agent);
        let mut trust = TrustConfig::new();
        trust.allow_self_signed(allow);
        ServerContext::build(&trust, store).unwrap()
    };

    let mut client = client_ctx.connect("agent7.example").unwrap();
    let mut server = server_ctx(true).accept().unwrap();
    run_handshake(&mut client, &mut server).unwrap();
    assert!(server.peer_certificates().is_some());

    let mut client = client_ctx.connect("agent7.example").unwrap();
    let mut server = server_ctx(false).accept().unwrap();
    let err = run_handshake(&mut client, &mut server).unwrap_err();
    assert_eq!(classify(&err), VerifyStatus::UnknownIssuer);
}

#[test]
fn repository_pin_overrides_channel_rejection() {
    let _guard = subscribe();

    let manager = identity("mgr1", Vec::new());
    let staged = identity("agent-staged", Vec::new());
    let live = identity("agent-live", Vec::new());

    // The default peer anchors the channel on the staged certificate, but
    // the live one is pinned as well, so presenting it must still pass.
    let mgr_store = store_with_identity(Side::Client, &manager);
    let anchor = mgr_store.add_peer(staged.cert.clone()).unwrap();
    mgr_store.set_default_peer(anchor);
    mgr_store.add_peer(live.cert.clone()).unwrap();
    let client_ctx = ClientContext::build(&TrustConfig::new(), mgr_store).unwrap();

    let agent_store = store_with_identity(Side::Server, &live);
    agent_store.add_peer(manager.cert.clone()).unwrap();
    let server_ctx = ServerContext::build(&TrustConfig::new(), agent_store).unwrap();

    let mut client = client_ctx.connect("agent.example").unwrap();
    let mut server = server_ctx.accept().unwrap();
    run_handshake(&mut client, &mut server).unwrap();

    let record = SessionRecord::bind(client.peer_certificates(), &TrustConfig::new()).unwrap();
    assert_eq!(record.security_name(), "agent-live");
}

#[test]
fn unpinned_servers_are_refused() {
    let _guard = subscribe();

    let manager = identity("mgr1", Vec::new());
    let staged = identity("agent-staged", Vec::new());
    let rogue = identity("agent-rogue", Vec::new());

    let mgr_store = store_with_identity(Side::Client, &manager);
    let anchor = mgr_store.add_peer(staged.cert.clone()).unwrap();
    mgr_store.set_default_peer(anchor);
    let client_ctx = ClientContext::build(&TrustConfig::new(), mgr_store).unwrap();

    let agent_store = store_with_identity(Side::Server, &rogue);
    agent_store.add_peer(manager.cert.clone()).unwrap();
    let server_ctx = ServerContext::build(&TrustConfig::new(), agent_store).unwrap();

    let mut client = client_ctx.connect("agent.example").unwrap();
    let mut server = server_ctx.accept().unwrap();
    let err = run_handshake(&mut client, &mut server).unwrap_err();
    assert_eq!(classify(&err), VerifyStatus::UnknownIssuer);
}

#[test]
fn bind_rechecks_the_configured_pin() {
    let _guard = subscribe();

    let manager = identity("mgr1", Vec::new());
    let staged = identity("agent-staged", Vec::new());
    let live = identity("agent-live", Vec::new());

    // Both agent certificates are pinned, so the channel admits either; the
    // configured fingerprint still binds the session to the staged one only.
    let mgr_store = store_with_identity(Side::Client, &manager);
    mgr_store.add_peer(staged.cert.clone()).unwrap();
    mgr_store.add_peer(live.cert.clone()).unwrap();
    let mut mgr_trust = TrustConfig::new();
    mgr_trust.their_fingerprint(colonize(&staged.fingerprint));
    let client_ctx = ClientContext::build(&mgr_trust, mgr_store).unwrap();

    let agent_store = store_with_identity(Side::Server, &live);
    agent_store.add_peer(manager.cert.clone()).unwrap();
    let server_ctx = ServerContext::build(&TrustConfig::new(), agent_store).unwrap();

    let mut client = client_ctx.connect("agent.example").unwrap();
    let mut server = server_ctx.accept().unwrap();
    run_handshake(&mut client, &mut server).unwrap();

    let err = SessionRecord::bind(client.peer_certificates(), &mgr_trust).unwrap_err();
    match err {
        BindError::PeerIdentityMismatch { expected, actual } => {
            assert_eq!(expected, staged.fingerprint.as_str());
            assert_eq!(actual, live.fingerprint);
        }
        other => panic!("unexpected error: {other}"),
    }
}
