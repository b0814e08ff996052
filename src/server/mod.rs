pub mod admission;
pub mod socket;

pub use admission::AdmissionController;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::cache::DerivedIndexCache;
use crate::core::{
    IndexReadyNotice, IndexReply, IndexRequest, RequestEnvelope, RequestStatus, RequestType,
};
use crate::ledger::RequestLedger;

/// 入站请求 + 回话通道。transport 适配层负责造这个结构。
pub struct InboundRequest {
    pub envelope: RequestEnvelope,
    pub reply: oneshot::Sender<IndexReply>,
}

/// requestType -> cache 的只读注册表。启动时建好，之后不再变更；
/// 重复注册同一类型时后写者生效。
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<RequestType, Arc<DerivedIndexCache>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, request_type: RequestType, cache: Arc<DerivedIndexCache>) {
        info!("registering handler for request type '{}'", request_type);
        self.handlers.insert(request_type, cache);
    }

    pub fn get(&self, request_type: RequestType) -> Option<Arc<DerivedIndexCache>> {
        self.handlers.get(&request_type).cloned()
    }
}

/// 索引请求服务：RECEIVED → PERSISTED → DISPATCHED → COMPLETED。
///
/// - 收到即校验，非法请求同步拒绝，绝不进 ledger；
/// - 合法请求先落 ledger 再派发（persist 失败 = 该请求失败，不派发）；
/// - 一请求一个 tokio task，scan 走 spawn_blocking，不阻塞接收循环；
/// - 完成时改写请求、删 ledger 条目、释放并发额度，然后回复
///   （return_index=true）或发 ready 通知（return_index=false）；
/// - 启动先 replay ledger：恢复的请求直接进 DISPATCHED（已经持久），
///   并先计入并发额度，之后接收循环才开始第一次 poll。
pub struct IndexRequestServer {
    registry: Arc<HandlerRegistry>,
    ledger: Arc<RequestLedger>,
    admission: Arc<AdmissionController>,
    ready_tx: mpsc::Sender<IndexReadyNotice>,
}

impl IndexRequestServer {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        ledger: Arc<RequestLedger>,
        max_concurrent_jobs: usize,
        ready_tx: mpsc::Sender<IndexReadyNotice>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            ledger,
            admission: Arc::new(AdmissionController::new(max_concurrent_jobs)),
            ready_tx,
        })
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// 主循环。先恢复 ledger 里的在途请求，再开始接收新请求；
    /// 接收前等并发额度；额度满时就是 "listener 已摘除"。
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<InboundRequest>) -> anyhow::Result<()> {
        Self::replay(&self)?;
        loop {
            self.admission.wait_for_capacity().await;
            let Some(inbound) = rx.recv().await else {
                info!("inbound channel closed, server loop exiting");
                return Ok(());
            };
            self.clone().accept(inbound);
        }
    }

    /// 恢复 requestdir：磁盘上的每个条目都是一条必须续跑的在途请求。
    /// 解不开的条目逐个报 error（该条目的恢复失败是孤立的，不拖垮其余）。
    fn replay(this: &Arc<Self>) -> anyhow::Result<()> {
        let report = this.ledger.replay_all()?;
        for (path, err) in &report.corrupt {
            error!(
                "cannot recover ledger entry '{}': {:#}; the original request is lost",
                path.display(),
                err
            );
        }
        let count = report.requests.len();
        for req in report.requests {
            if !this.admission.register(&req.id) {
                warn!("skipping replayed request '{}': already in flight", req.id);
                continue;
            }
            info!("resuming request '{}' from ledger", req.id);
            // 已持久：跳过 PERSISTED，直接 DISPATCHED。崩溃前若已完成但未
            // 删条目，重跑会命中现成 artifact（幂等），无害。
            this.clone().dispatch(req, None);
        }
        info!(
            "{} in-flight requests restored from ledger dir '{}'",
            count,
            this.ledger.dir().display()
        );
        Ok(())
    }

    /// RECEIVED：校验 → PERSISTED：落 ledger + 计入额度 → DISPATCHED。
    fn accept(self: Arc<Self>, inbound: InboundRequest) {
        let req = match self.validate(&inbound.envelope) {
            Ok(req) => req,
            Err(msg) => {
                warn!("rejecting malformed index request: {}", msg);
                let _ = inbound.reply.send(IndexReply::not_ok(msg));
                return;
            }
        };

        // 落盘失败 = 恢复保证被打穿，该请求在派发前就失败
        if let Err(e) = self.ledger.persist(&req) {
            let msg = format!("unable to persist request '{}': {:#}", req.id, e);
            warn!("{}", msg);
            let _ = inbound.reply.send(IndexReply::not_ok(msg));
            return;
        }

        if !self.admission.register(&req.id) {
            let msg = format!("request '{}' already among current jobs", req.id);
            warn!("{}", msg);
            self.ledger.remove(&req.id);
            let _ = inbound.reply.send(IndexReply::not_ok(msg));
            return;
        }

        info!(
            "request '{}' accepted: index '{}' over {} jobs",
            req.id,
            req.request_type,
            req.requested_jobs.len()
        );

        if req.return_index {
            self.dispatch(req, Some(inbound.reply));
        } else {
            // 结果走 ready 通知；入站连接收到受理确认即可放行
            let _ = inbound.reply.send(IndexReply {
                ok: true,
                error: None,
                found_jobs: Vec::new(),
                result_files: Vec::new(),
            });
            self.dispatch(req, None);
        }
    }

    fn validate(&self, envelope: &RequestEnvelope) -> Result<IndexRequest, String> {
        let type_str = envelope
            .request_type
            .as_deref()
            .ok_or_else(|| "request_type missing".to_string())?;
        let request_type = RequestType::parse(type_str)
            .ok_or_else(|| format!("unknown request_type '{}'", type_str))?;
        if self.registry.get(request_type).is_none() {
            return Err(format!("no handler registered for '{}'", request_type));
        }
        let jobs = envelope
            .jobs
            .as_ref()
            .ok_or_else(|| "jobs missing".to_string())?;
        Ok(IndexRequest::new(
            request_type,
            jobs.iter().copied().collect(),
            envelope.return_index,
            envelope.harvest_id,
        ))
    }

    /// DISPATCHED：一请求一个独立 task。并发上限由 AdmissionController
    /// 管着，这里不设 worker pool。
    fn dispatch(self: Arc<Self>, req: IndexRequest, reply: Option<oneshot::Sender<IndexReply>>) {
        tokio::spawn(async move {
            self.process(req, reply).await;
        });
    }

    /// COMPLETED：生成（或命中）索引，改写请求，收尾，回复/通知。
    async fn process(self: Arc<Self>, mut req: IndexRequest, reply: Option<oneshot::Sender<IndexReply>>) {
        let outcome = match self.registry.get(req.request_type) {
            // replay 回来的请求也可能指向未注册的类型
            None => Err(anyhow::anyhow!(
                "no handler registered for '{}'",
                req.request_type
            )),
            Some(cache) => {
                let jobs = req.requested_jobs.clone();
                match tokio::task::spawn_blocking(move || cache.get(&jobs)).await {
                    Ok(result) => result,
                    Err(join_err) => Err(anyhow::anyhow!("generation task panicked: {}", join_err)),
                }
            }
        };

        match outcome {
            Ok(outcome) => {
                req.status = RequestStatus::Ok;
                req.found_jobs = outcome.found;
                if req.fully_covered() {
                    info!(
                        "index '{}' ready for all {} jobs of request '{}'",
                        req.request_type,
                        req.requested_jobs.len(),
                        req.id
                    );
                    if req.return_index {
                        req.result_files = outcome.files;
                    }
                } else {
                    // 部分覆盖不是错误：请求方拿子集重试
                    info!(
                        "request '{}': only {}/{} jobs covered, requester should retry with subset",
                        req.id,
                        req.found_jobs.len(),
                        req.requested_jobs.len()
                    );
                }
            }
            Err(e) => {
                warn!("request '{}' failed: {:#}", req.id, e);
                req.status = RequestStatus::Failed(format!("{:#}", e));
            }
        }

        // 完成边界：先去掉在途痕迹，再发结果。回复已注定，remove 失败
        // 只是警告。额度释放会唤醒接收循环重新评估 listener。
        self.ledger.remove(&req.id);
        self.admission.release(&req.id);

        if req.return_index {
            match reply {
                Some(tx) => {
                    let _ = tx.send(IndexReply::from_request(&req));
                }
                // replay 回来的请求没有回话通道；artifact 已缓存，
                // 请求方超时重发后会直接命中
                None => info!(
                    "request '{}' finished after recovery; no reply channel, result is cached",
                    req.id
                ),
            }
        } else {
            let notice = IndexReadyNotice {
                harvest_id: req.harvest_id,
                ready: req.is_ok() && req.fully_covered(),
            };
            if self.ready_tx.send(notice).await.is_err() {
                warn!("ready notice for request '{}' dropped: channel closed", req.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ArtifactLayout, ArtifactStore};
    use crate::core::{JobSet, RequestType};
    use crate::scan::{ScanJob, ScanReport};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("warc-idx-server-{}-{}", tag, nanos))
    }

    /// 全覆盖 stub scan。
    struct FullScan;

    impl ScanJob for FullScan {
        fn scan(&self, jobs: &JobSet, dest: &Path) -> anyhow::Result<ScanReport> {
            std::fs::write(dest, b"aaa 1\naab 2\n")?;
            Ok(ScanReport {
                covered: jobs.clone(),
            })
        }
    }

    /// 只覆盖固定子集。
    struct SubsetScan(JobSet);

    impl ScanJob for SubsetScan {
        fn scan(&self, jobs: &JobSet, dest: &Path) -> anyhow::Result<ScanReport> {
            std::fs::write(dest, b"aaa 1\n")?;
            Ok(ScanReport {
                covered: jobs.intersection(&self.0).copied().collect(),
            })
        }
    }

    /// 卡在闸门上的 scan：started 计数，拿到一张放行票才返回。
    struct GatedScan {
        started: Arc<AtomicUsize>,
        gate: Arc<(Mutex<usize>, Condvar)>,
    }

    impl GatedScan {
        fn release_one(gate: &Arc<(Mutex<usize>, Condvar)>) {
            let (tickets, cvar) = &**gate;
            *tickets.lock().unwrap() += 1;
            cvar.notify_all();
        }
    }

    impl ScanJob for GatedScan {
        fn scan(&self, jobs: &JobSet, dest: &Path) -> anyhow::Result<ScanReport> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let (tickets, cvar) = &*self.gate;
            let mut t = tickets.lock().unwrap();
            while *t == 0 {
                t = cvar.wait(t).unwrap();
            }
            *t -= 1;
            drop(t);
            std::fs::write(dest, b"x\n")?;
            Ok(ScanReport {
                covered: jobs.clone(),
            })
        }
    }

    struct TestRig {
        server: Arc<IndexRequestServer>,
        tx: mpsc::Sender<InboundRequest>,
        ready_rx: mpsc::Receiver<IndexReadyNotice>,
        ledger_dir: PathBuf,
    }

    fn rig(tag: &str, runner: Box<dyn ScanJob>, max_jobs: usize) -> TestRig {
        let root = unique_tmp_dir(tag);
        let ledger_dir = root.join("requests");
        let cache_dir = root.join("cache");
        let store = ArtifactStore::open(&cache_dir, "cdxindex", ArtifactLayout::SingleFile).unwrap();
        let cache = Arc::new(DerivedIndexCache::new(store, runner));
        let mut registry = HandlerRegistry::new();
        registry.register(RequestType::CdxIndex, cache);
        let ledger = Arc::new(RequestLedger::open(&ledger_dir).unwrap());
        let (ready_tx, ready_rx) = mpsc::channel(16);
        let server = IndexRequestServer::new(Arc::new(registry), ledger, max_jobs, ready_tx);
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(server.clone().run(rx));
        TestRig {
            server,
            tx,
            ready_rx,
            ledger_dir,
        }
    }

    fn envelope(jobs: &[u64], return_index: bool) -> RequestEnvelope {
        RequestEnvelope {
            request_type: Some("cdxindex".to_string()),
            jobs: Some(jobs.to_vec()),
            return_index,
            harvest_id: Some(7),
        }
    }

    async fn submit(tx: &mpsc::Sender<InboundRequest>, envelope: RequestEnvelope) -> oneshot::Receiver<IndexReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(InboundRequest {
            envelope,
            reply: reply_tx,
        })
        .await
        .unwrap();
        reply_rx
    }

    fn ledger_entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn full_coverage_reply_carries_artifacts() {
        let rig = rig("full", Box::new(FullScan), 4);
        let reply = submit(&rig.tx, envelope(&[1, 2], true)).await.await.unwrap();
        assert!(reply.ok);
        assert_eq!(reply.found_jobs, vec![1, 2]);
        assert_eq!(reply.result_files.len(), 1);
        assert!(reply.result_files[0].exists());
        assert_eq!(ledger_entries(&rig.ledger_dir), 0);
    }

    #[tokio::test]
    async fn partial_coverage_is_ok_with_subset_and_no_files() {
        let subset: JobSet = [1].into_iter().collect();
        let rig = rig("partial", Box::new(SubsetScan(subset)), 4);
        let reply = submit(&rig.tx, envelope(&[1, 2], true)).await.await.unwrap();
        assert!(reply.ok);
        assert_eq!(reply.found_jobs, vec![1]);
        assert!(reply.result_files.is_empty());
        assert_eq!(ledger_entries(&rig.ledger_dir), 0);
    }

    #[tokio::test]
    async fn malformed_requests_rejected_before_ledger() {
        let rig = rig("reject", Box::new(FullScan), 4);

        // 缺 type
        let reply = submit(
            &rig.tx,
            RequestEnvelope {
                jobs: Some(vec![1]),
                ..Default::default()
            },
        )
        .await
        .await
        .unwrap();
        assert!(!reply.ok);
        assert!(reply.error.unwrap().contains("request_type missing"));

        // 未知 type
        let reply = submit(
            &rig.tx,
            RequestEnvelope {
                request_type: Some("lucene".to_string()),
                jobs: Some(vec![1]),
                ..Default::default()
            },
        )
        .await
        .await
        .unwrap();
        assert!(!reply.ok);

        // 缺 jobs
        let reply = submit(
            &rig.tx,
            RequestEnvelope {
                request_type: Some("cdxindex".to_string()),
                ..Default::default()
            },
        )
        .await
        .await
        .unwrap();
        assert!(!reply.ok);

        assert_eq!(ledger_entries(&rig.ledger_dir), 0);
    }

    #[tokio::test]
    async fn ready_notice_instead_of_reply_when_index_not_returned() {
        let mut rig = rig("ready", Box::new(FullScan), 4);
        let ack = submit(&rig.tx, envelope(&[3], false)).await.await.unwrap();
        assert!(ack.ok);
        assert!(ack.result_files.is_empty());

        let notice = tokio::time::timeout(Duration::from_secs(5), rig.ready_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(notice.ready);
        assert_eq!(notice.harvest_id, Some(7));
        assert_eq!(ledger_entries(&rig.ledger_dir), 0);
    }

    #[tokio::test]
    async fn admission_detaches_listener_at_capacity() {
        let started = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new((Mutex::new(0usize), Condvar::new()));
        let rig = rig(
            "admission",
            Box::new(GatedScan {
                started: started.clone(),
                gate: gate.clone(),
            }),
            2,
        );

        // 三个互不相同的 KeySet，其中前两个把额度占满
        let _r1 = submit(&rig.tx, envelope(&[1], true)).await;
        let _r2 = submit(&rig.tx, envelope(&[2], true)).await;
        let r3 = submit(&rig.tx, envelope(&[3], true)).await;

        // 前两个进入 scan 并卡住；第三个不得被受理
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while started.load(Ordering::SeqCst) < 2 {
            assert!(tokio::time::Instant::now() < deadline, "two scans should start");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(started.load(Ordering::SeqCst), 2, "listener must be detached at capacity");
        assert_eq!(rig.server.admission().in_flight(), 2);

        // 放行一个：额度释放，listener 重新挂上，第三个才进来
        GatedScan::release_one(&gate);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while started.load(Ordering::SeqCst) < 3 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "third request should be admitted after a completion"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // 收尾：放行剩下两个
        GatedScan::release_one(&gate);
        GatedScan::release_one(&gate);
        let reply = tokio::time::timeout(Duration::from_secs(5), r3)
            .await
            .unwrap()
            .unwrap();
        assert!(reply.ok);
    }

    #[tokio::test]
    async fn replayed_work_counts_against_capacity_before_listening() {
        let root = unique_tmp_dir("replay-capacity");
        let ledger_dir = root.join("requests");
        let cache_dir = root.join("cache");

        // 崩溃前：一条在途请求已持久；额度恰好为 1
        let crashed = RequestLedger::open(&ledger_dir).unwrap();
        let replayed_jobs: JobSet = [21].into_iter().collect();
        crashed
            .persist(&IndexRequest::new(RequestType::CdxIndex, replayed_jobs, true, None))
            .unwrap();
        drop(crashed);

        // 重启：恢复的请求进 scan 并卡在闸门上，占满全部额度
        let started = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new((Mutex::new(0usize), Condvar::new()));
        let store = ArtifactStore::open(&cache_dir, "cdxindex", ArtifactLayout::SingleFile).unwrap();
        let cache = Arc::new(DerivedIndexCache::new(
            store,
            Box::new(GatedScan {
                started: started.clone(),
                gate: gate.clone(),
            }),
        ));
        let mut registry = HandlerRegistry::new();
        registry.register(RequestType::CdxIndex, cache);
        let ledger = Arc::new(RequestLedger::open(&ledger_dir).unwrap());
        let (ready_tx, _ready_rx) = mpsc::channel(4);
        let server = IndexRequestServer::new(Arc::new(registry), ledger, 1, ready_tx);
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(server.clone().run(rx));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while started.load(Ordering::SeqCst) < 1 {
            assert!(tokio::time::Instant::now() < deadline, "replayed scan should start");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // 恢复的工作先于 listener 计入额度：新请求此时不得被受理
        let r = submit(&tx, envelope(&[22], true)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            started.load(Ordering::SeqCst),
            1,
            "listener must stay detached while replayed work holds all capacity"
        );
        assert_eq!(server.admission().in_flight(), 1);

        // 恢复的请求完成后 listener 才挂上，新请求进来
        GatedScan::release_one(&gate);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while started.load(Ordering::SeqCst) < 2 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "new request should be admitted once replayed work completes"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        GatedScan::release_one(&gate);
        let reply = tokio::time::timeout(Duration::from_secs(5), r)
            .await
            .unwrap()
            .unwrap();
        assert!(reply.ok);
    }

    #[tokio::test]
    async fn replayed_request_is_resumed_to_completion() {
        let root = unique_tmp_dir("replay");
        let ledger_dir = root.join("requests");
        let cache_dir = root.join("cache");

        // 崩溃前：请求已持久，但没有任何 worker 在跑
        let crashed = RequestLedger::open(&ledger_dir).unwrap();
        let jobs: JobSet = [11, 12].into_iter().collect();
        let req = IndexRequest::new(RequestType::CdxIndex, jobs.clone(), true, None);
        crashed.persist(&req).unwrap();
        drop(crashed);

        // 重启：server 在接收任何新请求前恢复并跑完它
        let store = ArtifactStore::open(&cache_dir, "cdxindex", ArtifactLayout::SingleFile).unwrap();
        let cache = Arc::new(DerivedIndexCache::new(store, Box::new(FullScan)));
        let probe = cache.clone();
        let mut registry = HandlerRegistry::new();
        registry.register(RequestType::CdxIndex, cache);
        let ledger = Arc::new(RequestLedger::open(&ledger_dir).unwrap());
        let (ready_tx, _ready_rx) = mpsc::channel(4);
        let server = IndexRequestServer::new(Arc::new(registry), ledger, 2, ready_tx);
        let (_tx, rx) = mpsc::channel::<InboundRequest>(4);
        tokio::spawn(server.clone().run(rx));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if probe.store().exists(&jobs) && ledger_entries(&ledger_dir) == 0 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "replayed request should complete and clear the ledger"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server.admission().in_flight(), 0);
    }
}
