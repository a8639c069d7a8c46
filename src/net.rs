//! Live replication over a single TLS stream.
//!
//! Both logical logs share one connection; frames are tagged with their
//! channel and dispatched to one session per channel. Within a session each
//! side announces its state vector, the side allowed to upload answers with
//! the missing delta and then forwards newly merged entries live. What the
//! remote already holds is tracked in its advancing state vector, which
//! suppresses echoes of entries it sent us itself.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error_span, trace, warn, Instrument};

use crate::log::{MultiLog, StateVector};
use crate::peers::{PeerIdentity, PeerKind};

pub mod codec;

use codec::{Channel, Frame, FrameCodec, SyncMessage};

const SESSION_QUEUE: usize = 64;

/// Our side of a channel: may we apply the peer's entries, may we send ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPerms {
    pub download: bool,
    pub upload: bool,
}

impl LogPerms {
    const BOTH: LogPerms = LogPerms {
        download: true,
        upload: true,
    };
}

/// What to do with an authenticated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    Replicate { lab: LogPerms, admin: LogPerms },
    /// Measurement hardware; handled outside the replication protocol.
    DeviceGateway,
    /// Recognized certificate, unusable type. Dropped.
    Deny,
}

/// The permission matrix.
///
/// Field sites push lab data up and receive only user accounts back; lab
/// and server peers replicate everything both ways.
pub fn attach_policy(kind: &PeerKind) -> Attach {
    match kind {
        PeerKind::Field => Attach::Replicate {
            lab: LogPerms {
                download: true,
                upload: false,
            },
            admin: LogPerms {
                download: false,
                upload: true,
            },
        },
        PeerKind::Lab | PeerKind::Server => Attach::Replicate {
            lab: LogPerms::BOTH,
            admin: LogPerms::BOTH,
        },
        PeerKind::LabDevice => Attach::DeviceGateway,
        PeerKind::Other(_) => Attach::Deny,
    }
}

/// Runs both replication channels over `stream` until the connection drops
/// or a protocol error occurs.
pub async fn run_replication<S>(
    stream: S,
    peer: &PeerIdentity,
    lab: &MultiLog,
    admin: &MultiLog,
    lab_perms: LogPerms,
    admin_perms: LogPerms,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut frames_in = FramedRead::new(reader, FrameCodec);
    let mut frames_out = FramedWrite::new(writer, FrameCodec);

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(SESSION_QUEUE);
    let (lab_tx, lab_rx) = mpsc::channel::<SyncMessage>(SESSION_QUEUE);
    let (admin_tx, admin_rx) = mpsc::channel::<SyncMessage>(SESSION_QUEUE);

    let write_task = async move {
        while let Some(frame) = out_rx.recv().await {
            frames_out.send(frame).await?;
        }
        Ok::<_, anyhow::Error>(())
    };

    let dispatch_task = async move {
        while let Some(frame) = frames_in.next().await {
            let frame = frame.context("reading frame")?;
            let tx = match frame.channel {
                Channel::Lab => &lab_tx,
                Channel::Admin => &admin_tx,
            };
            if tx.send(frame.message).await.is_err() {
                break;
            }
        }
        Ok::<_, anyhow::Error>(())
    };

    let lab_session = channel_session(Channel::Lab, lab.clone(), lab_perms, lab_rx, out_tx.clone())
        .instrument(error_span!("sync", channel = Channel::Lab.as_str(), peer = %peer.description));
    let admin_session = channel_session(
        Channel::Admin,
        admin.clone(),
        admin_perms,
        admin_rx,
        out_tx,
    )
    .instrument(error_span!("sync", channel = Channel::Admin.as_str(), peer = %peer.description));

    tokio::try_join!(write_task, dispatch_task, lab_session, admin_session)?;
    Ok(())
}

async fn channel_session(
    channel: Channel,
    log: MultiLog,
    perms: LogPerms,
    mut inbound: mpsc::Receiver<SyncMessage>,
    outbound: mpsc::Sender<Frame>,
) -> Result<()> {
    // Subscribe before computing the state vector so nothing merged in
    // between is lost to the live feed.
    let mut events = log.subscribe();
    let state = log.state_vector()?;
    // The outbound queue is empty at session start; this is the one place a
    // session awaits room on it.
    outbound
        .send(Frame {
            channel,
            message: SyncMessage::Hello { state },
        })
        .await
        .context("connection closed")?;

    // What the remote is known to hold. `None` until its hello arrives;
    // nothing is sent before that.
    let mut remote: Option<StateVector> = None;
    // Set whenever the remote may be missing entries that were not queued:
    // after its hello, when the outbound queue was full, and when the live
    // feed lagged. Drained as a delta once the queue has room.
    let mut resync = false;

    loop {
        tokio::select! {
            // Once the handshake is done a session never awaits queue room
            // while inbound frames wait, so two sides flooding each other at
            // once cannot deadlock. The catch-up branch fires only when a
            // slot is already free.
            permit = outbound.reserve(), if resync && remote.is_some() => {
                let permit = permit.context("connection closed")?;
                resync = false;
                let Some(remote) = remote.as_mut() else { continue };
                let delta = log.entries_since(remote)?;
                if delta.is_empty() {
                    continue;
                }
                debug!(entries = delta.len(), "sending delta");
                for entry in &delta {
                    remote.insert(entry.writer, entry.seq);
                }
                permit.send(Frame { channel, message: SyncMessage::Entries(delta) });
            }
            message = inbound.recv() => {
                let Some(message) = message else {
                    debug!("channel closed");
                    return Ok(());
                };
                match message {
                    SyncMessage::Hello { state } => {
                        debug!("received hello");
                        remote = Some(state);
                        resync = perms.upload;
                    }
                    SyncMessage::Entries(entries) => {
                        if !perms.download {
                            warn!(entries = entries.len(), "ignoring entries on download-restricted channel");
                            continue;
                        }
                        // Record before applying so the live feed does not
                        // echo these entries straight back.
                        if let Some(remote) = remote.as_mut() {
                            for entry in &entries {
                                remote.insert(entry.writer, entry.seq);
                            }
                        }
                        let merged = log.apply_remote(&entries)?;
                        trace!(received = entries.len(), merged = merged.len(), "applied entries");
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(merged) => {
                        let Some(remote) = remote.as_mut() else { continue };
                        let (writer, seq) = (merged.entry.writer, merged.entry.seq);
                        if !perms.upload || remote.contains(&writer, seq) {
                            continue;
                        }
                        match outbound.try_send(Frame { channel, message: SyncMessage::Entries(vec![merged.entry]) }) {
                            Ok(()) => {
                                remote.insert(writer, seq);
                            }
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                // The entry rides the next delta instead.
                                resync = true;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                anyhow::bail!("connection closed");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Fell behind the live feed; the missing entries go
                        // out as a delta instead of individually.
                        warn!(missed, "live feed lagged, resyncing");
                        resync = perms.upload;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("log closed");
                        return Ok(());
                    }
                }
            }
        }
    }
}
