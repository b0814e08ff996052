use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::core::IndexRequest;

const LEDGER_MAGIC: u32 = 0x5844_4952; // "RIDX"
const LEDGER_VERSION: u32 = 1;

/// 在途请求的持久账本：一请求一文件，文件名即 request id。
///
/// 契约（崩溃恢复的根基）：
/// - persist 在任何生成工作开始之前调用，失败必须上抛：没落盘的在途
///   请求等于恢复保证被打穿；
/// - remove 在回复/通知发出之后调用，"已经不在了" 是 no-op，其余错误
///   只记警告（结果不受影响）；
/// - replay_all 在启动时列出目录里的每个文件，逐个解码；解不开的条目
///   单独上报（路径 + 错误），绝不悄悄跳过。
///
/// 编码：magic + version 头 + bincode body。版本化编码保证崩溃重启后
/// 总能解出当时写下的条目，不依赖语言原生对象序列化。
pub struct RequestLedger {
    dir: PathBuf,
}

/// replay 的结果：可恢复的请求 + 解码失败的条目。
pub struct ReplayReport {
    pub requests: Vec<IndexRequest>,
    pub corrupt: Vec<(PathBuf, anyhow::Error)>,
}

impl RequestLedger {
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating ledger dir '{}'", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// 序列化整个请求到 `<dir>/<id>`。tmp → fsync → rename → fsync(dir)，
    /// 崩在中间也不会留下半个条目。目录项落盘失败必须上抛：persist 返回
    /// Ok 即承诺断电后条目仍在。
    pub fn persist(&self, req: &IndexRequest) -> anyhow::Result<()> {
        let dest = self.entry_path(&req.id);
        let tmp = self.dir.join(format!("{}.tmp", req.id));
        debug!("persisting request '{}' to {}", req.id, dest.display());

        let body = bincode::serialize(req)
            .with_context(|| format!("encoding request '{}'", req.id))?;

        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("creating ledger entry '{}'", tmp.display()))?;
        file.write_all(&LEDGER_MAGIC.to_le_bytes())?;
        file.write_all(&LEDGER_VERSION.to_le_bytes())?;
        file.write_all(&body)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &dest)
            .with_context(|| format!("committing ledger entry '{}'", dest.display()))?;
        std::fs::File::open(&self.dir)
            .and_then(|dir| dir.sync_all())
            .with_context(|| format!("syncing ledger dir '{}'", self.dir.display()))?;
        Ok(())
    }

    /// 删除条目。此时回复已发出，删除失败不影响请求结果。
    pub fn remove(&self, id: &str) {
        let path = self.entry_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("removed ledger entry '{}'", id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("ledger entry '{}' already gone", id);
            }
            Err(e) => warn!("could not remove ledger entry '{}': {}", path.display(), e),
        }
    }

    /// 启动时恢复：目录下每个文件都代表一个必须续跑的请求。
    pub fn replay_all(&self) -> anyhow::Result<ReplayReport> {
        let mut report = ReplayReport {
            requests: Vec::new(),
            corrupt: Vec::new(),
        };
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("listing ledger dir '{}'", self.dir.display()))?
        {
            let path = entry?.path();
            if !path.is_file() {
                debug!("ignoring non-file in ledger dir: {}", path.display());
                continue;
            }
            // 崩溃残留的 .tmp 从未算作在途（rename 之前 persist 未成功）
            if path.extension().map(|e| e == "tmp").unwrap_or(false) {
                debug!("dropping stale ledger tmp file: {}", path.display());
                let _ = std::fs::remove_file(&path);
                continue;
            }
            match read_entry(&path) {
                Ok(req) => report.requests.push(req),
                Err(e) => report.corrupt.push((path, e)),
            }
        }
        Ok(report)
    }
}

fn read_entry(path: &Path) -> anyhow::Result<IndexRequest> {
    let mut file = std::fs::File::open(path)?;
    let mut magic_buf = [0u8; 4];
    let mut version_buf = [0u8; 4];
    file.read_exact(&mut magic_buf)
        .and_then(|()| file.read_exact(&mut version_buf))
        .with_context(|| format!("reading header of '{}'", path.display()))?;
    let magic = u32::from_le_bytes(magic_buf);
    let version = u32::from_le_bytes(version_buf);
    anyhow::ensure!(magic == LEDGER_MAGIC, "bad ledger magic {:#x}", magic);
    anyhow::ensure!(
        version == LEDGER_VERSION,
        "unsupported ledger version {}",
        version
    );
    let mut body = Vec::new();
    file.read_to_end(&mut body)?;
    let req: IndexRequest = bincode::deserialize(&body)
        .with_context(|| format!("decoding ledger entry '{}'", path.display()))?;
    Ok(req)
}
