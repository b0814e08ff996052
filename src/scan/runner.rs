use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ignore::WalkBuilder;
use rayon::prelude::*;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::cache::ArtifactLayout;
use crate::core::{JobId, JobSet};
use crate::scan::{ScanJob, ScanReport};

/// 本地归档 scan 执行器。
///
/// 归档布局：`<archive_root>/<job_id>/` 下放该任务的记录文件（行式）。
/// 对每个请求的 job：
/// 1. 找到任务目录（缺目录 = 数据不可用 = 不覆盖该 job）
/// 2. 遍历目录（ignore::WalkBuilder），逐行读出记录
/// 3. 可选 mime 过滤（blacklist / whitelist 正则）
/// 4. 排序后写入 dest（单文件布局合并所有 job；目录布局一 job 一文件）
///
/// 超时语义沿用归档系统的 indexing timeout：deadline 到点后不再开始新的
/// job，已完成的照常汇报，产出部分覆盖而不是报错。
pub struct ArchiveScanRunner {
    archive_root: PathBuf,
    layout: ArtifactLayout,
    timeout: Duration,
    mime_filter: Option<MimeFilter>,
    threads: usize,
}

struct MimeFilter {
    pattern: Regex,
    /// true: 命中即丢弃（blacklist）；false: 未命中丢弃（whitelist）
    blacklist: bool,
}

impl ArchiveScanRunner {
    pub fn new(archive_root: impl Into<PathBuf>, layout: ArtifactLayout, timeout: Duration) -> Self {
        Self {
            archive_root: archive_root.into(),
            layout,
            timeout,
            mime_filter: None,
            threads: num_cpus::get(),
        }
    }

    pub fn with_mime_filter(mut self, pattern: &str, blacklist: bool) -> anyhow::Result<Self> {
        self.mime_filter = Some(MimeFilter {
            pattern: Regex::new(pattern)?,
            blacklist,
        });
        Ok(self)
    }

    fn job_dir(&self, job: JobId) -> PathBuf {
        self.archive_root.join(job.to_string())
    }

    /// 读出一个 job 的全部记录行（已过滤、已排序）。
    fn collect_job_lines(&self, job: JobId) -> anyhow::Result<Vec<String>> {
        let dir = self.job_dir(job);
        let mut lines = Vec::new();
        for entry in WalkBuilder::new(&dir).standard_filters(false).build() {
            let entry = entry?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            // 坏编码按 lossy 解码：个别非 UTF-8 字节不至于让整个 scan 失败
            let bytes = std::fs::read(entry.path())?;
            let content = String::from_utf8_lossy(&bytes);
            for line in content.lines() {
                if line.is_empty() {
                    continue;
                }
                if let Some(filter) = &self.mime_filter {
                    // CDX 行的 mime 字段在第 4 列（约定与归档格式一致）
                    let mime = line.split_whitespace().nth(3).unwrap_or("");
                    if filter.pattern.is_match(mime) == filter.blacklist {
                        continue;
                    }
                }
                lines.push(line.to_string());
            }
        }
        lines.par_sort_unstable();
        Ok(lines)
    }

    fn write_lines(path: &Path, lines: &[String]) -> anyhow::Result<()> {
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        for line in lines {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        file.get_ref().sync_all()?;
        Ok(())
    }
}

impl ScanJob for ArchiveScanRunner {
    fn scan(&self, jobs: &JobSet, dest: &Path) -> anyhow::Result<ScanReport> {
        let started = Instant::now();
        let deadline = started + self.timeout;

        // 数据在场的 job 才进入扫描；其余直接算未覆盖
        let (present, missing): (Vec<JobId>, Vec<JobId>) = jobs
            .iter()
            .copied()
            .partition(|job| self.job_dir(*job).is_dir());
        if !missing.is_empty() {
            warn!(
                "archive data missing for {} of {} jobs: {:?}",
                missing.len(),
                jobs.len(),
                missing
            );
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()?;

        // deadline 检查在任务粒度：到点后剩余 job 不再开始
        let scanned: Vec<(JobId, Vec<String>)> = pool.install(|| {
            present
                .par_iter()
                .filter(|_| Instant::now() < deadline)
                .map(|&job| self.collect_job_lines(job).map(|lines| (job, lines)))
                .collect::<anyhow::Result<Vec<_>>>()
        })?;
        if scanned.len() < present.len() {
            warn!(
                "scan deadline ({:?}) hit: {} of {} available jobs scanned",
                self.timeout,
                scanned.len(),
                present.len()
            );
        }

        let covered: JobSet = scanned.iter().map(|(job, _)| *job).collect();

        match self.layout {
            ArtifactLayout::SingleFile => {
                let mut all: Vec<String> = scanned.into_iter().flat_map(|(_, l)| l).collect();
                all.par_sort_unstable();
                Self::write_lines(dest, &all)?;
            }
            ArtifactLayout::Directory => {
                std::fs::create_dir_all(dest)?;
                for (job, lines) in &scanned {
                    Self::write_lines(&dest.join(format!("{}.idx", job)), lines)?;
                }
            }
        }

        info!(
            "scan covered {}/{} jobs in {:?}",
            covered.len(),
            jobs.len(),
            started.elapsed()
        );
        debug!("scan artifact staged at {}", dest.display());
        Ok(ScanReport { covered })
    }
}
