use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use bmcgate_lib::session::persistence::PersistentStore;
use bmcgate_lib::{AuthConfigMethods, SessionStore, SessionType};

fn client_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))
}

fn tmp_path(name: &str) -> std::path::PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_nanos();
    std::env::temp_dir().join(format!("bmcgate-test-{nanos}-{name}"))
}

#[test]
fn generated_tokens_have_required_shape() {
    let store = SessionStore::new();
    for _ in 0..32 {
        let session = store
            .generate("root", &client_ip(), None, SessionType::Session, false)
            .unwrap();
        assert_eq!(session.session_token.len(), 20);
        assert_eq!(session.csrf_token.len(), 20);
        assert_eq!(session.unique_id.len(), 10);
        for field in [&session.session_token, &session.csrf_token, &session.unique_id] {
            assert!(field.chars().all(|c| c.is_ascii_alphanumeric()));
        }
        assert_eq!(session.client_ip, "10.0.0.5");
    }
}

#[test]
fn session_tokens_are_unique_across_live_set() {
    let store = SessionStore::new();
    let mut tokens = std::collections::HashSet::new();
    for _ in 0..64 {
        let session = store
            .generate("root", &client_ip(), None, SessionType::Session, false)
            .unwrap();
        assert!(tokens.insert(session.session_token));
    }
}

#[test]
fn login_by_token_resolves_until_removed() {
    let store = SessionStore::new();
    let session = store
        .generate("root", &client_ip(), None, SessionType::Session, false)
        .unwrap();

    let resolved = store.login_by_token(&session.session_token).unwrap();
    assert_eq!(resolved.unique_id, session.unique_id);

    store.remove(&session);
    assert!(store.login_by_token(&session.session_token).is_none());
}

#[test]
fn login_by_token_rejects_wrong_length_tokens() {
    let store = SessionStore::new();
    let session = store
        .generate("root", &client_ip(), None, SessionType::Session, false)
        .unwrap();
    assert!(store.login_by_token(&session.session_token[..19]).is_none());
    let long = format!("{}A", session.session_token);
    assert!(store.login_by_token(&long).is_none());
    assert!(store.login_by_token("").is_none());
}

#[test]
fn idle_sessions_expire() {
    let store = SessionStore::new();
    store.update_auth_config(AuthConfigMethods::default());
    store.update_timeout(Duration::from_secs(2));
    let session = store
        .generate("root", &client_ip(), None, SessionType::Session, false)
        .unwrap();

    std::thread::sleep(Duration::from_secs(3));

    assert!(store.login_by_token(&session.session_token).is_none());
    assert!(store.needs_write());
}

#[test]
fn get_by_uid_scans_live_sessions() {
    let store = SessionStore::new();
    let a = store
        .generate("alice", &client_ip(), None, SessionType::Session, false)
        .unwrap();
    let b = store
        .generate("bob", &client_ip(), None, SessionType::Cookie, false)
        .unwrap();
    assert_eq!(store.get_by_uid(&a.unique_id).unwrap().username, "alice");
    assert_eq!(store.get_by_uid(&b.unique_id).unwrap().username, "bob");
    assert!(store.get_by_uid("nonexistent").is_none());
}

#[test]
fn remove_by_username_supports_keeping_one() {
    let store = SessionStore::new();
    let keep = store
        .generate("root", &client_ip(), None, SessionType::Session, false)
        .unwrap();
    let drop1 = store
        .generate("root", &client_ip(), None, SessionType::Session, false)
        .unwrap();
    let other = store
        .generate("admin", &client_ip(), None, SessionType::Session, false)
        .unwrap();

    store.remove_by_username_except("root", &keep);
    assert!(store.login_by_token(&keep.session_token).is_some());
    assert!(store.login_by_token(&drop1.session_token).is_none());
    assert!(store.login_by_token(&other.session_token).is_some());

    store.remove_by_username("root");
    assert!(store.login_by_token(&keep.session_token).is_none());
    assert!(store.login_by_token(&other.session_token).is_some());
}

#[test]
fn unique_id_snapshots_filter_by_type() {
    let store = SessionStore::new();
    let session = store
        .generate("root", &client_ip(), None, SessionType::Session, false)
        .unwrap();
    let basic = store
        .generate("root", &client_ip(), None, SessionType::Basic, false)
        .unwrap();

    let all = store.get_all_unique_ids();
    assert!(all.contains(&session.unique_id));
    assert!(all.contains(&basic.unique_id));

    let basics = store.get_unique_ids_by_type(SessionType::Basic);
    assert_eq!(basics, vec![basic.unique_id.clone()]);
}

#[test]
fn only_persistent_types_mark_the_store_dirty() {
    let store = SessionStore::new();
    assert!(!store.needs_write());
    store
        .generate("root", &client_ip(), None, SessionType::Basic, false)
        .unwrap();
    assert!(!store.needs_write());
    store
        .generate("root", &client_ip(), None, SessionType::MutualTls, false)
        .unwrap();
    assert!(!store.needs_write());
    store
        .generate("root", &client_ip(), None, SessionType::Session, false)
        .unwrap();
    assert!(store.needs_write());
}

#[tokio::test]
async fn tls_flag_change_raises_reconfigure_event() {
    let store = SessionStore::new();
    let mut rx = store.subscribe_reconfigure();

    // flipping non-TLS flags raises nothing
    store.update_auth_config(AuthConfigMethods {
        basic: false,
        ..AuthConfigMethods::default()
    });
    assert!(!rx.has_changed().unwrap());

    // flipping the TLS flag does
    store.update_auth_config(AuthConfigMethods {
        tls: false,
        ..AuthConfigMethods::default()
    });
    assert!(rx.has_changed().unwrap());
    rx.borrow_and_update();
}

#[test]
fn persistence_roundtrip_restores_sessions_and_policy() {
    let path = tmp_path("persist.json");
    let store = SessionStore::new();
    let session = store
        .generate("root", &client_ip(), Some("webui".to_owned()), SessionType::Session, false)
        .unwrap();
    // short-lived sessions never hit the disk
    let basic = store
        .generate("root", &client_ip(), None, SessionType::Basic, false)
        .unwrap();
    store.update_auth_config(AuthConfigMethods {
        xtoken: false,
        ..AuthConfigMethods::default()
    });

    let persistent = PersistentStore::new(&path);
    persistent.save(&store).unwrap();
    assert!(!store.needs_write());

    let restored_store = SessionStore::new();
    let restored_persistent = PersistentStore::new(&path);
    restored_persistent.load(&restored_store).unwrap();

    let restored = restored_store
        .login_by_token(&session.session_token)
        .expect("persisted session must restore");
    assert_eq!(restored.unique_id, session.unique_id);
    assert_eq!(restored.username, "root");
    assert_eq!(restored.csrf_token, session.csrf_token);
    assert_eq!(restored.client_id.as_deref(), Some("webui"));
    assert_eq!(restored.session_type, SessionType::Session);

    assert!(restored_store.login_by_token(&basic.session_token).is_none());
    assert!(!restored_store.auth_config().xtoken);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn persistence_passes_subscriptions_through() {
    let path = tmp_path("subscriptions.json");
    std::fs::write(
        &path,
        r#"{"Configuration": {"BasicAuth": true},
            "Sessions": [],
            "Subscriptions": {"sub1": {"Destination": "https://collector"}}}"#,
    )
    .unwrap();

    let store = SessionStore::new();
    let persistent = PersistentStore::new(&path);
    persistent.load(&store).unwrap();
    persistent.save(&store).unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(
        doc["Subscriptions"]["sub1"]["Destination"],
        serde_json::Value::String("https://collector".to_owned())
    );

    let _ = std::fs::remove_file(&path);
}
