use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Size-rotated append-only line writer.  Backups are `<path>.1` (newest)
/// through `<path>.<keep>`; with compression on, the newest backup becomes
/// `<path>.1.gz`.
pub struct RotatingWriter {
    path: PathBuf,
    file: fs::File,
    max_bytes: Option<u64>,
    keep: usize,
    compress: bool,
}

impl RotatingWriter {
    pub fn open(
        path: impl AsRef<Path>,
        max_bytes: Option<u64>,
        keep: usize,
        compress: bool,
    ) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            max_bytes,
            keep,
            compress,
        })
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if let Some(limit) = self.max_bytes {
            if self.current_size().map(|s| s >= limit).unwrap_or(false) {
                self.rotate()?;
            }
        }
        writeln!(self.file, "{}", line)
    }

    pub fn current_size(&self) -> Option<u64> {
        self.path.metadata().ok().map(|m| m.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup(&self, idx: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{idx}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        if self.keep > 0 {
            for idx in (1..self.keep).rev() {
                for suffix in ["", ".gz"] {
                    let mut from = self.backup(idx).into_os_string();
                    from.push(suffix);
                    let mut to = self.backup(idx + 1).into_os_string();
                    to.push(suffix);
                    let from = PathBuf::from(from);
                    if from.exists() {
                        fs::rename(&from, PathBuf::from(to))?;
                    }
                }
            }
            fs::rename(&self.path, self.backup(1))?;
            if self.compress {
                self.compress_newest_backup();
            }
        }
        self.file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    fn compress_newest_backup(&self) {
        let rotated = self.backup(1);
        let Ok(data) = fs::read(&rotated) else {
            return;
        };
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        if gz.write_all(&data).is_err() {
            return;
        }
        if let Ok(buf) = gz.finish() {
            let mut gz_path = rotated.clone().into_os_string();
            gz_path.push(".gz");
            if fs::write(PathBuf::from(gz_path), buf).is_ok() {
                let _ = fs::remove_file(&rotated);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_and_keeps_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut w = RotatingWriter::open(&path, Some(64), 2, false).unwrap();
        for i in 0..20 {
            w.write_line(&format!("{{\"n\":{i},\"pad\":\"xxxxxxxxxxxxxxxx\"}}")).unwrap();
        }
        assert!(dir.path().join("audit.jsonl.1").exists());
        assert!(dir.path().join("audit.jsonl.2").exists());
        assert!(!dir.path().join("audit.jsonl.3").exists());
        assert!(w.current_size().unwrap() < 128);
    }

    #[test]
    fn compresses_newest_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut w = RotatingWriter::open(&path, Some(32), 1, true).unwrap();
        for i in 0..4 {
            w.write_line(&format!("{{\"line\":{i},\"pad\":\"yyyyyyyyyyyyyyyy\"}}")).unwrap();
        }
        assert!(dir.path().join("audit.jsonl.1.gz").exists());
        assert!(!dir.path().join("audit.jsonl.1").exists());
    }
}
