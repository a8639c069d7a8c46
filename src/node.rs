//! Node assembly: logs, views, listener and outbound connections.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls_pki_types::ServerName;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error_span, info, warn, Instrument};

use crate::config::Config;
use crate::engine::{ReadyGate, ViewEngine, ViewHandle};
use crate::log::MultiLog;
use crate::net::{attach_policy, run_replication, Attach};
use crate::peers::{PeerIdentity, PeerRegistry};
use crate::reconnect::run_outbound;
use crate::store::IndexStore;
use crate::tls::{self, NodeKeys};
use crate::views::{
    IdView, SecondaryView, TailTimeView, TimeView, UserNameView, WellResultView,
};

/// The eight maintained indexes, gated on their engine having caught up.
#[derive(Debug, Clone)]
pub struct Views {
    pub objects_by_id: ViewHandle<IdView>,
    pub objects_by_barcode: ViewHandle<SecondaryView>,
    pub swab_tubes_by_form_barcode: ViewHandle<SecondaryView>,
    pub swab_tubes_by_time: ViewHandle<TailTimeView>,
    pub plates_by_time: ViewHandle<TimeView>,
    pub well_results: ViewHandle<WellResultView>,
    pub users_by_id: ViewHandle<IdView>,
    pub users_by_name: ViewHandle<UserNameView>,
}

/// A running synchronization node.
#[derive(Debug)]
pub struct Node {
    lab: MultiLog,
    admin: MultiLog,
    views: Views,
    lab_engine: ViewEngine,
    admin_engine: ViewEngine,
    tasks: JoinSet<()>,
}

impl Node {
    pub async fn start(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("creating data directory {}", config.data_dir.display())
        })?;

        let (lab, admin, lab_engine, admin_engine, views) = open_stores(&config.data_dir)?;

        let registry = Arc::new(PeerRegistry::load(&config.peers)?);
        let keys = Arc::new(NodeKeys::load(&config.tls_cert, &config.tls_key)?);
        if config.insecure {
            warn!("TLS verification disabled, every connection is treated as a lab peer");
        }

        let mut tasks = JoinSet::new();

        if let Some(listen) = &config.listen {
            let addr = listen.socket_addr()?;
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding {addr}"))?;
            info!(%addr, "listening for peers");
            let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(
                &keys,
                registry.clone(),
                config.insecure,
            )?));
            let (lab, admin, registry) = (lab.clone(), admin.clone(), registry.clone());
            let insecure = config.insecure;
            tasks.spawn(
                async move {
                    accept_loop(listener, acceptor, registry, lab, admin, insecure).await;
                }
                .instrument(error_span!("listener")),
            );
        }

        if config.introvert {
            info!("introvert mode, not dialing any peers");
        } else {
            for (identity, addr, cert) in registry.outbound() {
                let Attach::Replicate { lab: lab_perms, admin: admin_perms } =
                    attach_policy(&identity.kind)
                else {
                    warn!(peer = %identity.description, kind = ?identity.kind, "peer has a connect address but is not a replication peer");
                    continue;
                };
                let connector = TlsConnector::from(Arc::new(tls::client_config(
                    &keys,
                    cert,
                    config.insecure,
                )?));
                let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(&addr);
                let server_name = ServerName::try_from(host.to_string())
                    .with_context(|| format!("invalid peer host {host}"))?;
                let (lab, admin) = (lab.clone(), admin.clone());
                let span = error_span!("outbound", peer = %identity.description);
                tasks.spawn(
                    async move {
                        let description = identity.description.clone();
                        run_outbound(&description, move || {
                            let connector = connector.clone();
                            let server_name = server_name.clone();
                            let addr = addr.clone();
                            let identity = identity.clone();
                            let (lab, admin) = (lab.clone(), admin.clone());
                            async move {
                                let tcp = TcpStream::connect(&addr)
                                    .await
                                    .with_context(|| format!("dialing {addr}"))?;
                                let stream = connector
                                    .connect(server_name, tcp)
                                    .await
                                    .context("TLS handshake")?;
                                info!("connected");
                                run_replication(stream, &identity, &lab, &admin, lab_perms, admin_perms)
                                    .await
                            }
                        })
                        .await;
                    }
                    .instrument(span),
                );
            }
        }

        Ok(Node {
            lab,
            admin,
            views,
            lab_engine,
            admin_engine,
            tasks,
        })
    }

    /// The lab log: samples, plates, results.
    pub fn lab(&self) -> &MultiLog {
        &self.lab
    }

    /// The admin log: user accounts.
    pub fn admin(&self) -> &MultiLog {
        &self.admin
    }

    pub fn views(&self) -> &Views {
        &self.views
    }

    pub fn lab_ready(&self) -> ReadyGate {
        self.lab_engine.ready_gate()
    }

    pub fn admin_ready(&self) -> ReadyGate {
        self.admin_engine.ready_gate()
    }

    pub async fn shutdown(mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        self.lab_engine.shutdown().await;
        self.admin_engine.shutdown().await;
    }
}

fn open_stores(
    data_dir: &Path,
) -> Result<(MultiLog, MultiLog, ViewEngine, ViewEngine, Views)> {
    let lab = MultiLog::open("lab", &data_dir.join("lab.redb"))?;
    let admin = MultiLog::open("admin", &data_dir.join("admin.redb"))?;
    let store = IndexStore::open(&data_dir.join("views.redb"))?;

    let lab_engine = ViewEngine::new(lab.clone(), store.clone());
    let admin_engine = ViewEngine::new(admin.clone(), store.clone());

    let views = Views {
        objects_by_id: lab_engine.register(IdView::objects(store.clone()))?,
        objects_by_barcode: lab_engine.register(SecondaryView::objects_by_barcode(store.clone()))?,
        swab_tubes_by_form_barcode: lab_engine
            .register(SecondaryView::swab_tubes_by_form_barcode(store.clone()))?,
        swab_tubes_by_time: lab_engine.register(TailTimeView::swab_tubes(store.clone()))?,
        plates_by_time: lab_engine.register(TimeView::plates(store.clone()))?,
        well_results: lab_engine.register(WellResultView::new(store.clone()))?,
        users_by_id: admin_engine.register(IdView::users(store.clone()))?,
        users_by_name: admin_engine.register(UserNameView::new(store))?,
    };
    Ok((lab, admin, lab_engine, admin_engine, views))
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: Arc<PeerRegistry>,
    lab: MultiLog,
    admin: MultiLog,
    insecure: bool,
) {
    loop {
        let (tcp, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!("accept failed: {err:#}");
                continue;
            }
        };
        debug!(%remote, "inbound connection");
        let acceptor = acceptor.clone();
        let registry = registry.clone();
        let (lab, admin) = (lab.clone(), admin.clone());
        tokio::spawn(
            async move {
                let stream = match acceptor.accept(tcp).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!("TLS handshake failed: {err:#}");
                        return;
                    }
                };
                let Some(identity) = tls::identify(stream.get_ref().1, &registry, insecure)
                else {
                    // Valid handshake, certificate not on the allow-list.
                    warn!("dropping connection from unrecognized certificate");
                    return;
                };
                handle_inbound(stream, identity, lab, admin).await;
            }
            .instrument(error_span!("inbound", %remote)),
        );
    }
}

async fn handle_inbound(
    stream: tokio_rustls::server::TlsStream<TcpStream>,
    identity: PeerIdentity,
    lab: MultiLog,
    admin: MultiLog,
) {
    info!(peer = %identity.description, kind = ?identity.kind, "peer connected");
    match attach_policy(&identity.kind) {
        Attach::Replicate { lab: lab_perms, admin: admin_perms } => {
            if let Err(err) =
                run_replication(stream, &identity, &lab, &admin, lab_perms, admin_perms).await
            {
                warn!(peer = %identity.description, "replication ended: {err:#}");
            } else {
                info!(peer = %identity.description, "peer disconnected");
            }
        }
        Attach::DeviceGateway => {
            // Measurement hardware speaks the device gateway protocol, which
            // lives outside this node.
            info!(peer = %identity.description, "lab device connected, no replication channel");
        }
        Attach::Deny => {
            warn!(peer = %identity.description, kind = ?identity.kind, "dropping peer with unusable type");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::views::RangeQuery;

    fn test_config(dir: &Path) -> Config {
        let cert = rcgen::generate_simple_self_signed(vec!["node".to_string()]).unwrap();
        let cert_path = dir.join("node.pem");
        let key_path = dir.join("node.key");
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
        Config {
            data_dir: dir.join("data"),
            listen: None,
            tls_cert: cert_path,
            tls_key: key_path,
            insecure: false,
            introvert: false,
            peers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn local_writes_show_up_in_views() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::start(test_config(dir.path())).await.unwrap();

        let tube = serde_json::json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "type": "swabTube",
            "createdAt": 1_700_000_000_000u64,
            "barcode": "tube-1",
            "formBarcode": "form-1",
        });
        node.lab().append(serde_json::to_vec(&tube).unwrap()).unwrap();

        let views = node.views().clone();
        let by_barcode = views.objects_by_barcode.read().await.unwrap();
        assert!(by_barcode.get("tube-1").unwrap().is_some());

        let by_time = views.swab_tubes_by_time.read().await.unwrap();
        assert_eq!(by_time.read(&RangeQuery::default()).unwrap().len(), 1);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let id = uuid::Uuid::new_v4().to_string();
        {
            let node = Node::start(config.clone()).await.unwrap();
            let obj = serde_json::json!({
                "id": id,
                "type": "plate",
                "createdAt": 1_700_000_000_000u64,
                "barcode": "plate-1",
            });
            node.lab().append(serde_json::to_vec(&obj).unwrap()).unwrap();
            node.views().objects_by_id.read().await.unwrap();
            node.shutdown().await;
        }

        let node = Node::start(config).await.unwrap();
        let by_id = node.views().objects_by_id.read().await.unwrap();
        assert!(by_id.get(&id).unwrap().is_some());
        assert_eq!(node.lab().tip(), 1);
        node.shutdown().await;
    }
}
