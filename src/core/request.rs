use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// 采集任务（harvest job）的标识符。
pub type JobId = u64;

/// 一次索引请求覆盖的任务集合。BTreeSet 保证遍历顺序稳定，
/// 摘要（cache::hasher）因此天然与插入顺序无关。
pub type JobSet = BTreeSet<JobId>;

/// 索引种类：每种对应一个独立的 artifact cache。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    /// 排序后的记录索引（CDX 行），单文件 artifact
    CdxIndex,
    /// 去重用 crawl-log 索引，目录 artifact
    DedupCrawlLog,
    /// 完整 crawl-log 索引，目录 artifact
    FullCrawlLog,
}

impl RequestType {
    /// Cache name doubles as the artifact filename prefix.
    pub fn cache_name(&self) -> &'static str {
        match self {
            RequestType::CdxIndex => "cdxindex",
            RequestType::DedupCrawlLog => "dedupcrawllog",
            RequestType::FullCrawlLog => "fullcrawllog",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cdx_index" | "cdxindex" => Some(RequestType::CdxIndex),
            "dedup_crawl_log" | "dedupcrawllog" => Some(RequestType::DedupCrawlLog),
            "full_crawl_log" | "fullcrawllog" => Some(RequestType::FullCrawlLog),
            _ => None,
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cache_name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Ok,
    Failed(String),
}

/// 一次在途索引请求。创建后只被完成它的 worker 改写一次
/// （status / found_jobs / result_files），回复发出后即从 ledger 删除。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexRequest {
    pub id: String,
    pub request_type: RequestType,
    pub requested_jobs: JobSet,
    /// true: 回复里直接带 artifact 路径；false: 完成后只发 ready 通知
    pub return_index: bool,
    pub harvest_id: Option<u64>,
    pub status: RequestStatus,
    pub found_jobs: JobSet,
    pub result_files: Vec<PathBuf>,
}

impl IndexRequest {
    pub fn new(
        request_type: RequestType,
        requested_jobs: JobSet,
        return_index: bool,
        harvest_id: Option<u64>,
    ) -> Self {
        let id = next_request_id(request_type, &requested_jobs);
        Self {
            id,
            request_type,
            requested_jobs,
            return_index,
            harvest_id,
            status: RequestStatus::Pending,
            found_jobs: JobSet::new(),
            result_files: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        !matches!(self.status, RequestStatus::Failed(_))
    }

    /// 全覆盖：找到的任务集合等于请求的任务集合。
    pub fn fully_covered(&self) -> bool {
        self.found_jobs == self.requested_jobs
    }
}

/// 请求 id：类型 + 集合摘要前缀 + 纳秒 + 进程内序号。摘要前缀让日志里
/// 能肉眼对上同一 KeySet 的重复请求，序号保证同一纳秒内也不碰撞。
fn next_request_id(request_type: RequestType, jobs: &JobSet) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQ: AtomicU64 = AtomicU64::new(0);

    let digest = crate::cache::hasher::job_set_digest(jobs);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{:x}-{}", request_type, &digest[..12], nanos, seq)
}

/// 入站请求信封（wire 格式）。字段全部可缺，校验在 server 侧做：
/// 缺 type / 缺 jobs / 未注册的 type 都会被同步拒绝。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_type: Option<String>,
    pub jobs: Option<Vec<JobId>>,
    #[serde(default)]
    pub return_index: bool,
    pub harvest_id: Option<u64>,
}

/// 回复消息：要么全量回复（found + files），要么 not-OK + error。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexReply {
    pub ok: bool,
    pub error: Option<String>,
    pub found_jobs: Vec<JobId>,
    pub result_files: Vec<PathBuf>,
}

impl IndexReply {
    pub fn not_ok(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            found_jobs: Vec::new(),
            result_files: Vec::new(),
        }
    }

    pub fn from_request(req: &IndexRequest) -> Self {
        match &req.status {
            RequestStatus::Failed(msg) => Self::not_ok(msg.clone()),
            _ => Self {
                ok: true,
                error: None,
                found_jobs: req.found_jobs.iter().copied().collect(),
                result_files: req.result_files.clone(),
            },
        }
    }
}

/// 轻量 "index ready" 通知：return_index=false 时发往固定的调度端，
/// 与数据传输解耦。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexReadyNotice {
    pub harvest_id: Option<u64>,
    pub ready: bool,
}
