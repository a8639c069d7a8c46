//! Two whole nodes talking over real TLS on localhost.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tokio::time::timeout;

use lims_sync::config::{Config, Listen, PeerConfig};
use lims_sync::log::MultiLog;
use lims_sync::peers::PeerKind;
use lims_sync::views::RangeQuery;
use lims_sync::Node;

struct Identity {
    cert: PathBuf,
    key: PathBuf,
}

fn identity(dir: &Path, name: &str) -> Identity {
    // The loopback address rides in the SAN list because peers dial each
    // other by IP here and the client verifies host identity.
    let cert =
        rcgen::generate_simple_self_signed(vec![name.to_string(), "127.0.0.1".to_string()])
            .unwrap();
    let cert_path = dir.join(format!("{name}.pem"));
    let key_path = dir.join(format!("{name}.key"));
    std::fs::write(&cert_path, cert.cert.pem()).unwrap();
    std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
    Identity {
        cert: cert_path,
        key: key_path,
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn tube_json(barcode: &str, form: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "type": "swabTube",
        "createdAt": 1_700_000_000_000u64,
        "barcode": barcode,
        "formBarcode": form,
    }))
    .unwrap()
}

fn user_json(name: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "type": "user",
        "createdAt": 1_700_000_000_000u64,
        "name": name,
        "password": "hunter2",
    }))
    .unwrap()
}

async fn wait_for_tip(log: &MultiLog, tip: u64) -> Result<()> {
    let mut watch = log.watch_tip();
    timeout(Duration::from_secs(10), watch.wait_for(|t| *t >= tip)).await??;
    Ok(())
}

/// A field site pushes its samples to the lab and receives user accounts
/// back, but never the lab's own data.
#[tokio::test]
async fn field_site_against_lab_hub() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let hub_id = identity(dir.path(), "hub");
    let field_id = identity(dir.path(), "field-van");
    let port = free_port();

    let hub = Node::start(Config {
        data_dir: dir.path().join("hub"),
        listen: Some(Listen {
            host: "127.0.0.1".to_string(),
            port,
        }),
        tls_cert: hub_id.cert.clone(),
        tls_key: hub_id.key,
        insecure: false,
        introvert: false,
        peers: vec![PeerConfig {
            cert: field_id.cert.clone(),
            kind: PeerKind::Field,
            connect: None,
        }],
    })
    .await?;

    // Pre-existing data on both sides, exchanged on first contact.
    hub.admin().append(user_json("kim"))?;
    hub.lab().append(tube_json("hub-tube", "hub-form"))?;

    let field = Node::start(Config {
        data_dir: dir.path().join("field"),
        listen: None,
        tls_cert: field_id.cert,
        tls_key: field_id.key,
        insecure: false,
        introvert: false,
        peers: vec![PeerConfig {
            cert: hub_id.cert,
            kind: PeerKind::Server,
            connect: Some(format!("127.0.0.1:{port}")),
        }],
    })
    .await?;

    field.lab().append(tube_json("van-tube", "van-form"))?;

    // Samples flow up, accounts flow down.
    wait_for_tip(hub.lab(), 2).await?;
    wait_for_tip(field.admin(), 1).await?;

    let tubes = hub.views().swab_tubes_by_time.read().await?;
    let barcodes: Vec<_> = tubes
        .read(&RangeQuery::default())?
        .into_iter()
        .filter_map(|o| o.kind.barcode().map(str::to_string))
        .collect();
    assert!(barcodes.contains(&"van-tube".to_string()));

    let users = field.views().users_by_name.read().await?;
    assert_eq!(users.get("kim")?.len(), 1);

    // Live writes keep flowing without a reconnect.
    field.lab().append(tube_json("van-tube-2", "van-form-2"))?;
    wait_for_tip(hub.lab(), 3).await?;

    // The hub's lab data never reaches the field site.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(field.lab().tip(), 2);

    field.shutdown().await;
    hub.shutdown().await;
    Ok(())
}

/// A certificate the hub has never seen fails the handshake; nothing
/// replicates.
#[tokio::test]
async fn unknown_certificate_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let hub_id = identity(dir.path(), "hub");
    let stranger_id = identity(dir.path(), "stranger");
    let port = free_port();

    let hub = Node::start(Config {
        data_dir: dir.path().join("hub"),
        listen: Some(Listen {
            host: "127.0.0.1".to_string(),
            port,
        }),
        tls_cert: hub_id.cert.clone(),
        tls_key: hub_id.key,
        insecure: false,
        introvert: false,
        peers: Vec::new(),
    })
    .await?;

    let stranger = Node::start(Config {
        data_dir: dir.path().join("stranger"),
        listen: None,
        tls_cert: stranger_id.cert,
        tls_key: stranger_id.key,
        insecure: false,
        introvert: false,
        peers: vec![PeerConfig {
            cert: hub_id.cert,
            kind: PeerKind::Server,
            connect: Some(format!("127.0.0.1:{port}")),
        }],
    })
    .await?;

    stranger.lab().append(tube_json("sneaky", "form"))?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(hub.lab().tip(), 0);

    stranger.shutdown().await;
    hub.shutdown().await;
    Ok(())
}
