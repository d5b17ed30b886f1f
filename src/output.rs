//! Output sinks for capture sessions
//!
//! A capture session never creates files itself. It asks a [`SinkFactory`]
//! for a fresh sink whenever it needs one, writes to it, and drops it to
//! close it. [`FileSinkFactory`] is the on-disk implementation.
//!
//! # Naming
//!
//! - With an explicit path, the first sink is that path and later ones get a
//!   `-N` suffix before the extension (`trace.btsnoop`, `trace-1.btsnoop`, ...).
//! - Otherwise files are named from the local time, `YYYYMMDD-HHMMSS.btsnoop`,
//!   with a `-N` suffix if that name is already taken.

use chrono::{DateTime, Local, TimeZone};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Extension used for generated file names
pub const BTSNOOP_EXTENSION: &str = "btsnoop";

/// Opens a new output sink on demand
pub trait SinkFactory {
    /// Sink type handed to the session
    type Sink: Write;

    /// Open the next sink.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the sink cannot be created.
    fn open_sink(&mut self) -> std::io::Result<Self::Sink>;
}

/// Timestamp-derived file name, `YYYYMMDD-HHMMSS.btsnoop`
pub fn timestamp_file_name<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}.{}", now.format("%Y%m%d-%H%M%S"), BTSNOOP_EXTENSION)
}

/// Insert `-N` before the extension of `path`
pub fn numbered_path(path: &Path, n: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, n, ext.to_string_lossy()),
        None => format!("{}-{}", stem, n),
    };
    path.with_file_name(name)
}

/// Creates buffered output files, one per call
#[derive(Debug)]
pub struct FileSinkFactory {
    /// Explicit output path, if any
    output: Option<PathBuf>,
    /// Directory for timestamp-named files
    directory: PathBuf,
    /// Every path created so far, in order
    created: Vec<PathBuf>,
}

impl FileSinkFactory {
    /// Name files after `output`, or from the clock when `None`
    pub fn new(output: Option<PathBuf>) -> Self {
        Self::in_directory(output, PathBuf::from("."))
    }

    /// As [`FileSinkFactory::new`], placing timestamp-named files in `directory`
    pub fn in_directory(output: Option<PathBuf>, directory: PathBuf) -> Self {
        Self {
            output,
            directory,
            created: Vec::new(),
        }
    }

    /// Paths created so far
    pub fn created(&self) -> &[PathBuf] {
        &self.created
    }

    fn next_path(&self) -> PathBuf {
        match &self.output {
            Some(path) if self.created.is_empty() => path.clone(),
            Some(path) => numbered_path(path, self.created.len()),
            None => {
                let base = self.directory.join(timestamp_file_name(&Local::now()));
                let mut candidate = base.clone();
                let mut n = 1;
                while candidate.exists() || self.created.contains(&candidate) {
                    candidate = numbered_path(&base, n);
                    n += 1;
                }
                candidate
            }
        }
    }
}

impl SinkFactory for FileSinkFactory {
    type Sink = BufWriter<File>;

    fn open_sink(&mut self) -> std::io::Result<Self::Sink> {
        let path = self.next_path();
        log::info!("Creating new file: {}", path.display());
        let file = File::create(&path)?;
        self.created.push(path);
        Ok(BufWriter::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    #[test]
    fn test_timestamp_file_name_format() {
        let t = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
        assert_eq!(timestamp_file_name(&t), "20240307-090502.btsnoop");
    }

    #[test]
    fn test_numbered_path() {
        assert_eq!(
            numbered_path(Path::new("/tmp/trace.btsnoop"), 2),
            PathBuf::from("/tmp/trace-2.btsnoop")
        );
        assert_eq!(
            numbered_path(Path::new("capture"), 1),
            PathBuf::from("capture-1")
        );
    }

    #[test]
    fn test_explicit_output_then_numbered() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("trace.btsnoop");
        let mut factory = FileSinkFactory::new(Some(base.clone()));

        factory.open_sink().unwrap().write_all(b"one").unwrap();
        factory.open_sink().unwrap().write_all(b"two").unwrap();

        assert_eq!(
            factory.created(),
            &[base.clone(), dir.path().join("trace-1.btsnoop")]
        );
        assert_eq!(std::fs::read(&base).unwrap(), b"one");
        assert_eq!(
            std::fs::read(dir.path().join("trace-1.btsnoop")).unwrap(),
            b"two"
        );
    }

    #[test]
    fn test_timestamp_names_do_not_collide() {
        let dir = tempdir().unwrap();
        let mut factory = FileSinkFactory::in_directory(None, dir.path().to_path_buf());

        drop(factory.open_sink().unwrap());
        drop(factory.open_sink().unwrap());
        drop(factory.open_sink().unwrap());

        let created = factory.created();
        assert_eq!(created.len(), 3);
        assert_ne!(created[0], created[1]);
        assert_ne!(created[1], created[2]);
        for path in created {
            assert!(path.exists());
            assert_eq!(
                path.extension().and_then(|e| e.to_str()),
                Some(BTSNOOP_EXTENSION)
            );
        }
    }
}
