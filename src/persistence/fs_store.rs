//! Persistence layer backed by plain files.
//!
//! Layout under the base path (default `data/queues`):
//!
//! ```text
//! <queue-name>/queue.dat      declarer id, name, then (subscriber id, mode)*
//! <queue-name>/<id>.msg       encoded message frame, then raw target ids
//! ```
//!
//! Ids are 16 bytes in GUID layout and integers are little-endian, the same
//! primitives the wire codec uses. Directories are created on first write.
//! Every file is written to a unique temporary name and renamed into place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::{MessagePersistence, PersistenceError};
use crate::broker::queue::{QueueRecord, Subscriber};
use crate::broker::wrapper::MessageWrapper;
use crate::protocol::SubscribeMode;
use crate::protocol::codec::{self, FrameCodec};

pub const DEFAULT_BASE_PATH: &str = "data/queues";

const QUEUE_FILE: &str = "queue.dat";
const MESSAGE_EXTENSION: &str = "msg";
const ID_LEN: usize = 16;
const SUBSCRIBER_LEN: usize = ID_LEN + 4;

#[derive(Debug, Clone)]
pub struct FilesystemPersistence {
    base: PathBuf,
    codec: FrameCodec,
}

impl Default for FilesystemPersistence {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PATH)
    }
}

impl FilesystemPersistence {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            codec: FrameCodec::new(usize::MAX),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    fn queue_dir(&self, name: &str) -> Result<PathBuf, PersistenceError> {
        validate_queue_name(name)?;
        Ok(self.base.join(name))
    }

    fn message_path(&self, wrapper: &MessageWrapper) -> Result<PathBuf, PersistenceError> {
        let dir = self.queue_dir(wrapper.queue_name())?;
        Ok(dir.join(format!("{}.{MESSAGE_EXTENSION}", wrapper.id)))
    }

    fn read_message(&self, path: &Path) -> Result<MessageWrapper, PersistenceError> {
        let corrupt = |reason: &str| PersistenceError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| Uuid::parse_str(stem).ok())
            .ok_or_else(|| corrupt("file name is not a message id"))?;

        let data = fs::read(path).map_err(io_error(path))?;
        let mut buf = BytesMut::from(&data[..]);
        let message = self
            .codec
            .decode(&mut buf)?
            .ok_or_else(|| corrupt("truncated message frame"))?;

        if buf.len() % ID_LEN != 0 {
            return Err(corrupt("target list is not a whole number of ids"));
        }
        let mut rest = buf.freeze();
        let mut targets = Vec::with_capacity(rest.len() / ID_LEN);
        while rest.has_remaining() {
            targets.push(codec::get_uuid(&mut rest)?);
        }

        Ok(MessageWrapper::with_id(id, message, targets))
    }
}

impl MessagePersistence for FilesystemPersistence {
    fn save_message(&self, wrapper: &MessageWrapper) -> Result<(), PersistenceError> {
        let path = self.message_path(wrapper)?;
        ensure_dir(path.parent().unwrap_or(&self.base))?;

        let frame = codec::encode(&wrapper.message);
        let mut buf = BytesMut::with_capacity(frame.len() + wrapper.targets.len() * ID_LEN);
        buf.put_slice(&frame);
        for target in &wrapper.targets {
            codec::put_uuid(&mut buf, *target);
        }

        write_atomic(&path, &buf)
    }

    fn delete_message(&self, wrapper: &MessageWrapper) -> Result<(), PersistenceError> {
        let path = self.message_path(wrapper)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    fn save_queue(&self, queue: &QueueRecord) -> Result<(), PersistenceError> {
        let dir = self.queue_dir(&queue.name)?;
        ensure_dir(&dir)?;

        let mut buf = BytesMut::new();
        codec::put_uuid(&mut buf, queue.declared_by);
        codec::put_string(&mut buf, &queue.name);
        for subscriber in &queue.subscribers {
            codec::put_uuid(&mut buf, subscriber.id);
            buf.put_i32_le(subscriber.mode.code());
        }

        write_atomic(&dir.join(QUEUE_FILE), &buf)
    }

    fn load_queue(&self, name: &str) -> Result<Option<QueueRecord>, PersistenceError> {
        let path = self.queue_dir(name)?.join(QUEUE_FILE);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path)(e)),
        };

        let corrupt = |reason: String| PersistenceError::Corrupt {
            path: path.clone(),
            reason,
        };

        let mut buf = Bytes::from(data);
        let declared_by = codec::get_uuid(&mut buf)?;
        let name = codec::get_string(&mut buf)?;

        let mut subscribers = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < SUBSCRIBER_LEN {
                return Err(corrupt(format!(
                    "{} trailing bytes after subscriber list",
                    buf.remaining()
                )));
            }
            let id = codec::get_uuid(&mut buf)?;
            let code = codec::get_i32(&mut buf)?;
            let mode = SubscribeMode::from_code(code)
                .ok_or_else(|| corrupt(format!("unknown subscribe mode {code}")))?;
            subscribers.push(Subscriber { id, mode });
        }

        Ok(Some(QueueRecord {
            name,
            declared_by,
            subscribers,
        }))
    }

    fn load_messages(&self, name: &str) -> Result<Vec<MessageWrapper>, PersistenceError> {
        let dir = self.queue_dir(name)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir)(e)),
        };

        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_error(&dir))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(MESSAGE_EXTENSION) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((modified, path));
        }
        files.sort();

        files
            .iter()
            .map(|(_, path)| self.read_message(path))
            .collect()
    }

    fn queue_names(&self) -> Result<Vec<String>, PersistenceError> {
        let entries = match fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.base)(e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_error(&self.base))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if let (true, Ok(name)) = (is_dir, entry.file_name().into_string()) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

fn validate_queue_name(name: &str) -> Result<(), PersistenceError> {
    let unsafe_name = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if unsafe_name {
        return Err(PersistenceError::InvalidQueueName(name.to_string()));
    }
    Ok(())
}

fn ensure_dir(dir: &Path) -> Result<(), PersistenceError> {
    fs::create_dir_all(dir).map_err(io_error(dir))
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), PersistenceError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, data).map_err(io_error(&tmp))?;
    fs::rename(&tmp, path).map_err(io_error(path))
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}
