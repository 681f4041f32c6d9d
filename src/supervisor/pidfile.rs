use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::SupervisorError;

/// Contents of a PID file: the PID and, when known, the process start time
/// so a recycled PID is not mistaken for the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidRecord {
    pub pid: u32,
    pub start_time: Option<u64>,
}

/// One `<directive>.pid` file per started worker.
#[derive(Debug, Clone)]
pub struct PidDirectory {
    dir: PathBuf,
}

impl PidDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, directive: &str) -> PathBuf {
        self.dir.join(format!("{}.pid", directive))
    }

    pub fn write(&self, directive: &str, record: PidRecord) -> Result<(), SupervisorError> {
        fs::create_dir_all(&self.dir).map_err(|source| self.error(&self.dir, source))?;
        let path = self.path(directive);
        let content = match record.start_time {
            Some(start) => format!("{}\n{}\n", record.pid, start),
            None => format!("{}\n", record.pid),
        };
        fs::write(&path, content).map_err(|source| self.error(&path, source))
    }

    pub fn read(&self, directive: &str) -> Result<Option<u32>, SupervisorError> {
        Ok(self.read_record(directive)?.map(|r| r.pid))
    }

    pub fn read_record(&self, directive: &str) -> Result<Option<PidRecord>, SupervisorError> {
        let path = self.path(directive);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.error(&path, e)),
        };
        let invalid = |what: &str| {
            self.error(
                &path,
                io::Error::new(io::ErrorKind::InvalidData, format!("invalid {}", what)),
            )
        };
        let mut lines = content.lines().map(str::trim);
        let pid = lines
            .next()
            .and_then(|l| l.parse::<u32>().ok())
            .ok_or_else(|| invalid("PID"))?;
        let start_time = match lines.next().filter(|l| !l.is_empty()) {
            Some(l) => Some(l.parse::<u64>().map_err(|_| invalid("start time"))?),
            None => None,
        };
        Ok(Some(PidRecord { pid, start_time }))
    }

    pub fn remove(&self, directive: &str) -> Result<(), SupervisorError> {
        let path = self.path(directive);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.error(&path, e)),
        }
    }

    /// Removes the file only while it still records `pid`.
    pub fn remove_if(&self, directive: &str, pid: u32) -> Result<bool, SupervisorError> {
        if self.read(directive)? == Some(pid) {
            self.remove(directive)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Directives with a PID file.
    pub fn list(&self) -> Result<Vec<String>, SupervisorError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.error(&self.dir, e)),
        };

        let mut directives = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| self.error(&self.dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("pid") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    directives.push(stem.to_string());
                }
            }
        }
        directives.sort();
        Ok(directives)
    }

    fn error(&self, path: &Path, source: io::Error) -> SupervisorError {
        SupervisorError::PidFile {
            path: path.to_path_buf(),
            source,
        }
    }
}
