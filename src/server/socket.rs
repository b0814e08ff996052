use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::core::{IndexReadyNotice, IndexReply, RequestEnvelope};
use crate::server::InboundRequest;

/// Unix socket 入站适配器：一行一个 JSON 信封，回复原路写回。
///
/// 这是 out-of-scope 传输层的薄替身：server 只认 InboundRequest，
/// 真正的重投递/退避由发送端的传输层自己负责（bounded channel 满 =
/// listener 摘除 = 发送端看见 backpressure）。
pub struct SocketTransport {
    path: String,
    inbound_tx: mpsc::Sender<InboundRequest>,
}

impl SocketTransport {
    pub fn new(path: impl Into<String>, inbound_tx: mpsc::Sender<InboundRequest>) -> Self {
        Self {
            path: path.into(),
            inbound_tx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path)?;
        info!("index request socket listening on {}", self.path);

        loop {
            let (stream, _) = listener.accept().await?;
            let inbound_tx = self.inbound_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, inbound_tx).await {
                    warn!("index request connection failed: {:#}", e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    inbound_tx: mpsc::Sender<InboundRequest>,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<RequestEnvelope>(&line) {
            Ok(envelope) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                inbound_tx
                    .send(InboundRequest {
                        envelope,
                        reply: reply_tx,
                    })
                    .await
                    .map_err(|_| anyhow::anyhow!("server loop is gone"))?;
                match reply_rx.await {
                    Ok(reply) => reply,
                    Err(_) => IndexReply::not_ok("server dropped the request"),
                }
            }
            Err(e) => IndexReply::not_ok(format!("unparseable request envelope: {}", e)),
        };
        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        write_half.write_all(&out).await?;
    }
    Ok(())
}

/// ready 通知出站端：往固定的调度端 socket 写一行 JSON。
/// 连不上只记警告（通知丢了调度端自会超时重查），不拖垮 server。
pub async fn forward_ready_notices(
    mut ready_rx: mpsc::Receiver<IndexReadyNotice>,
    dest: PathBuf,
) {
    while let Some(notice) = ready_rx.recv().await {
        match deliver_notice(&notice, &dest).await {
            Ok(()) => info!(
                "index ready notice delivered for harvest {:?} (ready={})",
                notice.harvest_id, notice.ready
            ),
            Err(e) => warn!(
                "could not deliver ready notice for harvest {:?}: {:#}",
                notice.harvest_id, e
            ),
        }
    }
}

async fn deliver_notice(notice: &IndexReadyNotice, dest: &PathBuf) -> anyhow::Result<()> {
    let mut stream = UnixStream::connect(dest).await?;
    let mut out = serde_json::to_vec(notice)?;
    out.push(b'\n');
    stream.write_all(&out).await?;
    Ok(())
}
