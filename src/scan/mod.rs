pub mod runner;

pub use runner::ArchiveScanRunner;

use std::path::Path;

use crate::core::JobSet;

/// Scan 结果：实际覆盖到的任务子集。
#[derive(Clone, Debug, Default)]
pub struct ScanReport {
    pub covered: JobSet,
}

/// 分布式 scan 的边界抽象。实现负责把 `jobs` 对应的归档数据扫出来，
/// 写进 `dest`（单文件或目录，由所属 cache 决定），并汇报实际覆盖到的
/// 任务子集；部分归档数据暂不可用时 covered ⊂ jobs 是正常结果。
///
/// 约定：
/// - 超时由实现自己兜底（到点即停，剩余任务算未覆盖），调用方不做取消；
/// - dest 是 staging 路径，要不要转正由 DerivedIndexCache 决定；
/// - 任何错误直接返回 Err，调用方负责把所属请求标记为 Failed。
pub trait ScanJob: Send + Sync {
    fn scan(&self, jobs: &JobSet, dest: &Path) -> anyhow::Result<ScanReport>;
}
