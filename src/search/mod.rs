use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use tracing::debug;

/// 排序记录索引（CDX 风格行文件）上的前缀查找。
///
/// 三步：
/// 1. 二分找到*任意*一条前缀匹配的行（比较器只看行首 len(prefix) 个
///    字节，绝不比较整行）；
/// 2. 从命中位置往回跳：第 i 步回退 i² × 行长，直到探到不匹配的行或
///    文件头，再线性前扫到第一条匹配行。行长大致均匀时总读行数是
///    O(√d)，d 为命中点到第一条匹配行的距离；
/// 3. 从第一条匹配行起惰性逐行产出，遇到第一条不匹配的行即停（stop,
///    not skip），自然终止时关掉文件句柄。
///
/// 迭代器单趟、只进不退、不可重启；要再查一次就再调一次 `find`。
pub fn find(path: &Path, prefix: &str) -> anyhow::Result<PrefixLines> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let Some(hit) = bin_search(&mut reader, prefix)? else {
        // 空文件或无匹配
        return Ok(PrefixLines {
            reader: None,
            prefix: prefix.to_string(),
        });
    };
    let first = find_first_line(&mut reader, prefix, hit)?;
    reader.seek(SeekFrom::Start(first))?;
    Ok(PrefixLines {
        reader: Some(reader),
        prefix: prefix.to_string(),
    })
}

/// 惰性前缀行序列。第一条不匹配的行出现时终止并释放文件句柄。
pub struct PrefixLines {
    reader: Option<BufReader<File>>,
    prefix: String,
}

impl Iterator for PrefixLines {
    type Item = std::io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        match read_line(reader) {
            Ok(Some(line)) if prefix_cmp(&line, &self.prefix) == Ordering::Equal => {
                Some(Ok(line))
            }
            Ok(_) => {
                // EOF 或第一条不匹配的行：结束并关文件
                self.reader = None;
                None
            }
            Err(e) => {
                self.reader = None;
                Some(Err(e))
            }
        }
    }
}

/// 前缀比较：行截断到 min(len(prefix), len(line)) 再与整个 prefix 比。
/// 比 prefix 短的行永远配不上更长 prefix 的尾巴。
fn prefix_cmp(line: &str, prefix: &str) -> Ordering {
    let take = prefix.len().min(line.len());
    line.as_bytes()[..take].cmp(prefix.as_bytes())
}

/// 读一行（去掉行尾 \n / \r\n）。EOF 返回 None。
fn read_line(reader: &mut BufReader<File>) -> std::io::Result<Option<String>> {
    let mut buf = String::new();
    let n = reader.read_line(&mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    while buf.ends_with('\n') || buf.ends_with('\r') {
        buf.pop();
    }
    Ok(Some(buf))
}

/// seek 到 pos 后跳到下一行行首（pos 恰在行首时会跳到下一行）。
fn skip_to_line(reader: &mut BufReader<File>, pos: u64) -> std::io::Result<u64> {
    reader.seek(SeekFrom::Start(pos))?;
    read_line(reader)?;
    reader.stream_position()
}

/// 二分：返回*某条*前缀匹配行的起始偏移（未必是第一条），无匹配返回 None。
///
/// 不变式：startpos 始终指向一条 < 目标的行首；endpos 始终在一条 >= 目标
/// 的行之后（即指向 > 目标的行首，或 EOF）。
fn bin_search(reader: &mut BufReader<File>, prefix: &str) -> anyhow::Result<Option<u64>> {
    let mut startpos: u64 = 0;
    reader.seek(SeekFrom::Start(startpos))?;
    let Some(line) = read_line(reader)? else {
        return Ok(None); // 空文件
    };
    if prefix_cmp(&line, prefix) == Ordering::Equal {
        return Ok(Some(startpos));
    }
    let mut endpos = reader.get_ref().metadata()?.len();

    let Some(mut prevpos) = find_middle_line(reader, startpos, endpos)? else {
        return Ok(None);
    };
    loop {
        let Some(line) = read_line(reader)? else {
            debug!("prefix search ran past end of file at {}", endpos);
            return Ok(None);
        };
        match prefix_cmp(&line, prefix) {
            Ordering::Greater => endpos = prevpos,
            Ordering::Less => startpos = prevpos,
            Ordering::Equal => return Ok(Some(prevpos)),
        }
        if startpos == endpos {
            return Ok(None);
        }
        match find_middle_line(reader, startpos, endpos)? {
            Some(pos) => prevpos = pos,
            None => return Ok(None),
        }
    }
}

/// 在 (startpos, endpos) 之间找一条行首，找不到（区间里只剩 startpos
/// 这一行）返回 None。返回时 reader 已定位到该行首。
fn find_middle_line(
    reader: &mut BufReader<File>,
    startpos: u64,
    endpos: u64,
) -> anyhow::Result<Option<u64>> {
    // startpos 之后的第一条行首：再怎么折半也不会越过它
    let first_middle = skip_to_line(reader, startpos)?;
    if first_middle == endpos {
        return Ok(None);
    }
    let mut newmid = endpos;
    let mut div: u64 = 2;
    while newmid == endpos {
        // 中点落进了最后一行：往回折半，直到跨到更早的行
        newmid = startpos + (endpos - startpos) / div;
        if newmid < first_middle {
            newmid = first_middle;
            reader.seek(SeekFrom::Start(newmid))?;
            break;
        }
        newmid = skip_to_line(reader, newmid)?;
        div *= 2;
    }
    debug_assert_ne!(newmid, startpos, "middle line must advance past startpos");
    Ok(Some(newmid))
}

/// 从一条已知匹配行（matching，行首偏移）回溯到第一条匹配行的偏移。
/// 平方步回退 + 线性前扫，总计 O(√d) 次读行。
fn find_first_line(
    reader: &mut BufReader<File>,
    prefix: &str,
    matching: u64,
) -> anyhow::Result<u64> {
    reader.seek(SeekFrom::Start(matching))?;
    let Some(line) = read_line(reader)? else {
        anyhow::bail!("offset {} is not the start of a matching line", matching);
    };
    if prefix_cmp(&line, prefix) != Ordering::Equal {
        anyhow::bail!("offset {} is not the start of a matching line", matching);
    }

    // 步长 i² × 行长，回退到第一条不匹配的行（或文件头）为止
    let line_len = (line.len() as u64).max(1);
    let mut offset = line_len;
    let mut i: u64 = 1;
    while matching > offset {
        skip_to_line(reader, matching - offset)?;
        match read_line(reader)? {
            Some(probe) if prefix_cmp(&probe, prefix) == Ordering::Equal => {
                i += 1;
                offset = i * i * line_len;
            }
            _ => break,
        }
    }

    // 到头了就从 0 扫；否则从最后那条不匹配行之后扫
    let mut pos = if matching <= offset {
        reader.seek(SeekFrom::Start(0))?;
        0
    } else {
        reader.stream_position()?
    };

    // 线性前扫到第一条匹配行；由回退方式可知距离不超过 √d 级别
    while let Some(line) = read_line(reader)? {
        if prefix_cmp(&line, prefix) == Ordering::Equal {
            return Ok(pos);
        }
        pos = reader.stream_position()?;
    }
    anyhow::bail!("no matching line found walking forward from {}", pos)
}
