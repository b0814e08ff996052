use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::ArtifactStore;
use crate::core::JobSet;
use crate::scan::ScanJob;

/// `get` 的结果：实际覆盖的任务集合 + artifact 文件（仅全覆盖时非空）。
#[derive(Clone, Debug)]
pub struct CacheOutcome {
    pub found: JobSet,
    pub files: Vec<PathBuf>,
}

/// 派生索引缓存：ArtifactStore（命名/存在性）+ ScanJob（生成）的编排层。
///
/// 命名不变式：最终路径上出现名为 hash(K) 的 artifact，就是 "K 已全覆盖"
/// 的契约。scan 永远写 staging 路径，只有 covered == requested 时才
/// rename 转正（tmp → fsync → rename → fsync(dir)，原子替换）；部分覆盖
/// 只出现在返回值里，绝不落到全集的名字下。
///
/// 同一 KeySet 的并发 get 用 per-name 锁串行化（single-flight）：第二个
/// 调用者等第一个做完，然后直接命中已转正的 artifact，不会重复 scan。
pub struct DerivedIndexCache {
    store: ArtifactStore,
    runner: Box<dyn ScanJob>,
    // name -> 生成锁。条目只增不删：一个 artifact 名字一个 Arc<Mutex>，
    // 增长上限与 artifact 目录本身相同。
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl DerivedIndexCache {
    pub fn new(store: ArtifactStore, runner: Box<dyn ScanJob>) -> Self {
        Self {
            store,
            runner,
            inflight: DashMap::new(),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// 拿到 `jobs` 的索引。已缓存则直接命中；否则触发 scan。
    ///
    /// 返回部分覆盖是正常结果（调用方用子集重试）；scan 出错则原样上抛，
    /// 由持有请求的一侧标记 Failed。阻塞调用（scan 可能跑很久），必须在
    /// 请求接收线程之外执行。
    pub fn get(&self, jobs: &JobSet) -> anyhow::Result<CacheOutcome> {
        let final_path = self.store.path(jobs);
        let name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let lock = self
            .inflight
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock();

        if self.store.exists(jobs) {
            debug!("cache hit for {} ({} jobs)", name, jobs.len());
            return Ok(CacheOutcome {
                found: jobs.clone(),
                files: self.store.artifact_files(jobs)?,
            });
        }

        info!(
            "cache miss for {}: scanning {} jobs of '{}'",
            name,
            jobs.len(),
            self.store.cache_name()
        );
        let staging = self.store.staging_path(jobs);
        remove_stale(&staging);

        let report = self.runner.scan(jobs, &staging)?;

        if &report.covered == jobs {
            std::fs::rename(&staging, &final_path)?;
            // 目录项落盘；失败只记警告，artifact 本身已 fsync 过
            if let Ok(dir) = std::fs::File::open(self.store.dir()) {
                if let Err(e) = dir.sync_all() {
                    warn!("fsync of artifact dir failed: {}", e);
                }
            }
            info!("artifact committed: {}", final_path.display());
            Ok(CacheOutcome {
                found: report.covered,
                files: self.store.artifact_files(jobs)?,
            })
        } else {
            // 部分覆盖：staging 丢弃，命名不变式不受影响
            remove_stale(&staging);
            info!(
                "partial coverage for {}: {}/{} jobs",
                name,
                report.covered.len(),
                jobs.len()
            );
            Ok(CacheOutcome {
                found: report.covered,
                files: Vec::new(),
            })
        }
    }
}

fn remove_stale(path: &std::path::Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    if let Err(e) = result {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("could not remove staging path {}: {}", path.display(), e);
        }
    }
}
