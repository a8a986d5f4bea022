//! SAR: a simple sequential archive format
//!
//! Layout:
//! ```text
//! "SAR1" | flags: u8 | [salt: 16 bytes if flags & ENCRYPTED]
//! ( header_len: u32 LE | JSON header | payload )*
//! 0u32
//! ```
//!
//! Each header records the entry (name, type, size, times, method, encrypted)
//! plus the stored payload length and its CRC-32. Payloads are compressed
//! one by one and, for encrypted containers, sealed with AES-256-GCM under a
//! key derived from the container salt and the user secret.
//!
//! The writer can only append, so the kernel drives it through the
//! multiplexer.

use super::{ArchiveDriver, InputService, OutputService, Source};
use crate::compression::{self, CompressionConfig, CompressionMethod};
use crate::encryption::{self, EncryptionKey, KeyProvider, SALT_SIZE};
use crate::entry::{self, DefaultEntryFactory, Entry, EntryFactory, EntryType};
use crate::error::{FsError, Result};
use crate::socket::{InputTarget, OutputSocket, RawEntry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::debug;

/// Container magic
pub const MAGIC: &[u8; 4] = b"SAR1";

const FLAG_ENCRYPTED: u8 = 0x01;

/// Upper bound for a single frame header
const MAX_HEADER_LEN: u32 = 1024 * 1024;

/// Frame header as stored in the container
#[derive(Debug, Serialize, Deserialize)]
struct FrameHeader {
    #[serde(flatten)]
    entry: Entry,
    /// Stored payload length
    stored: u64,
    crc: u32,
}

/// Entry factory for SAR containers
///
/// The required head entry, if any, is always stored uncompressed.
#[derive(Debug, Clone, Default)]
pub struct SarEntryFactory {
    head: Option<String>,
}

impl EntryFactory for SarEntryFactory {
    fn new_entry(&self, name: &str, entry_type: EntryType, template: Option<&Entry>) -> Entry {
        let e = DefaultEntryFactory.new_entry(name, entry_type, template);
        if self.head.as_deref() == Some(name) {
            e.with_method(CompressionMethod::None)
        } else {
            e
        }
    }
}

/// SAR archive driver
#[derive(Debug, Clone)]
pub struct SarDriver {
    id: String,
    compression: CompressionConfig,
    encrypt: bool,
    factory: SarEntryFactory,
}

impl SarDriver {
    pub fn new() -> Self {
        SarDriver {
            id: "sar".to_string(),
            compression: CompressionConfig::default(),
            encrypt: false,
            factory: SarEntryFactory::default(),
        }
    }

    /// Driver whose containers must start with the uncompressed entry `head`
    pub fn with_head(head: &str) -> Self {
        SarDriver {
            id: format!("sar-{}", head),
            factory: SarEntryFactory {
                head: Some(head.to_string()),
            },
            ..Self::new()
        }
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    /// Create new containers encrypted. Existing containers keep whatever
    /// they were written with.
    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
    }

    pub fn named(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

impl Default for SarDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn codec_id(key: Option<&EncryptionKey>) -> String {
    match key {
        Some(key) => format!("sar:{}", encryption::fingerprint(key)),
        None => "sar:plain".to_string(),
    }
}

fn truncated(mount: &str, e: std::io::Error) -> FsError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FsError::corrupt(mount, "truncated container")
    } else {
        FsError::Io(e)
    }
}

impl ArchiveDriver for SarDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn factory(&self) -> &dyn EntryFactory {
        &self.factory
    }

    fn required_head(&self) -> Option<&str> {
        self.factory.head.as_deref()
    }

    fn new_input(
        &self,
        mount: &str,
        mut source: Box<dyn Source>,
        keys: &dyn KeyProvider,
    ) -> Result<Arc<dyn InputService>> {
        let total = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 4];
        source
            .read_exact(&mut magic)
            .map_err(|e| truncated(mount, e))?;
        if &magic != MAGIC {
            return Err(FsError::corrupt(mount, "bad magic"));
        }
        let mut flags = [0u8; 1];
        source
            .read_exact(&mut flags)
            .map_err(|e| truncated(mount, e))?;

        let mut salt = None;
        let mut key = None;
        if flags[0] & FLAG_ENCRYPTED != 0 {
            let mut s = [0u8; SALT_SIZE];
            source.read_exact(&mut s).map_err(|e| truncated(mount, e))?;
            let secret = keys.secret(mount)?;
            key = Some(encryption::derive_key(&s, &secret));
            salt = Some(s);
        }

        let mut frames = Vec::new();
        let mut index = HashMap::new();
        loop {
            let mut len = [0u8; 4];
            source.read_exact(&mut len).map_err(|e| truncated(mount, e))?;
            let len = u32::from_le_bytes(len);
            if len == 0 {
                break;
            }
            if len > MAX_HEADER_LEN {
                return Err(FsError::corrupt(mount, "oversized frame header"));
            }
            let mut raw = vec![0u8; len as usize];
            source.read_exact(&mut raw).map_err(|e| truncated(mount, e))?;
            let header: FrameHeader = serde_json::from_slice(&raw)
                .map_err(|e| FsError::corrupt(mount, format!("bad frame header: {}", e)))?;

            let name = header.entry.name();
            if entry::normalize(name).ok().as_deref() != Some(name) || name.is_empty() {
                return Err(FsError::corrupt(mount, format!("bad entry name {:?}", name)));
            }
            let offset = source.stream_position()?;
            let end = offset
                .checked_add(header.stored)
                .filter(|end| *end <= total)
                .ok_or_else(|| FsError::corrupt(mount, "truncated container"))?;
            source.seek(SeekFrom::Start(end))?;

            if index.insert(name.to_string(), frames.len()).is_some() {
                return Err(FsError::corrupt(mount, format!("duplicate entry {:?}", name)));
            }
            frames.push(Frame {
                offset,
                stored: header.stored,
                crc: header.crc,
                entry: header.entry,
            });
        }

        debug!("Opened {} with {} entries ({})", mount, frames.len(), self.id);
        Ok(Arc::new(SarInput {
            inner: Arc::new(InputInner {
                mount: mount.to_string(),
                codec: codec_id(key.as_ref()),
                key,
                salt,
                frames,
                index,
                source: Mutex::new(source),
            }),
        }))
    }

    fn new_output(
        &self,
        mount: &str,
        mut sink: Box<dyn Write + Send>,
        input: Option<&dyn InputService>,
        keys: &dyn KeyProvider,
    ) -> Result<Box<dyn OutputService>> {
        let previous = input.and_then(|i| i.as_any().downcast_ref::<SarInput>());
        let (salt, key) = match previous {
            Some(prev) => (prev.inner.salt, prev.inner.key),
            None if self.encrypt => {
                let salt = encryption::generate_salt();
                let secret = keys.secret(mount)?;
                (Some(salt), Some(encryption::derive_key(&salt, &secret)))
            }
            None => (None, None),
        };

        sink.write_all(MAGIC)?;
        match salt {
            Some(salt) => {
                sink.write_all(&[FLAG_ENCRYPTED])?;
                sink.write_all(&salt)?;
            }
            None => sink.write_all(&[0])?,
        }

        Ok(Box::new(SarOutput {
            mount: mount.to_string(),
            sink,
            codec: codec_id(key.as_ref()),
            key,
            compression: self.compression,
            head: self.factory.head.clone(),
            current: None,
            written: Vec::new(),
        }))
    }

    fn decode_raw(&self, raw: &RawEntry, input: Option<&dyn InputService>) -> Result<Vec<u8>> {
        let name = raw.entry.name();
        let key = match input.and_then(|i| i.as_any().downcast_ref::<SarInput>()) {
            Some(prev) if prev.inner.codec == raw.codec => prev.inner.key,
            _ if raw.codec == codec_id(None) => None,
            _ => return Err(FsError::corrupt(name, "raw payload of another codec")),
        };
        if crc32fast::hash(&raw.payload) != raw.crc {
            return Err(FsError::corrupt(name, "checksum mismatch"));
        }
        decode(name, &raw.entry, raw.payload.clone(), key.as_ref())
    }
}

struct Frame {
    entry: Entry,
    offset: u64,
    stored: u64,
    crc: u32,
}

struct InputInner {
    mount: String,
    codec: String,
    key: Option<EncryptionKey>,
    salt: Option<[u8; SALT_SIZE]>,
    frames: Vec<Frame>,
    index: HashMap<String, usize>,
    source: Mutex<Box<dyn Source>>,
}

impl InputInner {
    fn stored(&self, frame: &Frame) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; frame.stored as usize];
        {
            let mut source = self.source.lock();
            source.seek(SeekFrom::Start(frame.offset))?;
            source
                .read_exact(&mut payload)
                .map_err(|e| truncated(&self.mount, e))?;
        }
        if crc32fast::hash(&payload) != frame.crc {
            return Err(FsError::corrupt(
                &self.mount,
                format!("checksum mismatch for {:?}", frame.entry.name()),
            ));
        }
        Ok(payload)
    }

    fn decoded(&self, frame: &Frame) -> Result<Vec<u8>> {
        let payload = self.stored(frame)?;
        decode(&self.mount, &frame.entry, payload, self.key.as_ref())
    }
}

/// Undo encryption and compression of one stored payload
fn decode(
    mount: &str,
    entry: &Entry,
    mut payload: Vec<u8>,
    key: Option<&EncryptionKey>,
) -> Result<Vec<u8>> {
    if entry.is_encrypted() {
        let key = key.ok_or_else(|| FsError::corrupt(mount, "encrypted entry in plain container"))?;
        payload = encryption::decrypt(&payload, key)
            .map_err(|_| FsError::corrupt(mount, format!("cannot decrypt {:?}", entry.name())))?;
    }
    let data = compression::decode(&payload, entry.method())?;
    if let Some(size) = entry.size() {
        if data.len() as u64 != size {
            return Err(FsError::corrupt(
                mount,
                format!("size mismatch for {:?}", entry.name()),
            ));
        }
    }
    Ok(data)
}

/// Decoded view of one SAR container
pub struct SarInput {
    inner: Arc<InputInner>,
}

impl SarInput {
    /// Codec fingerprint raw payloads of this container are bound to
    pub fn codec(&self) -> &str {
        &self.inner.codec
    }
}

impl InputService for SarInput {
    fn entries(&self) -> Vec<Entry> {
        self.inner.frames.iter().map(|f| f.entry.clone()).collect()
    }

    fn entry(&self, name: &str) -> Option<Entry> {
        self.inner
            .index
            .get(name)
            .map(|&i| self.inner.frames[i].entry.clone())
    }

    fn input(&self, name: &str) -> Result<Box<dyn InputTarget>> {
        let frame = *self
            .inner
            .index
            .get(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        Ok(Box::new(SarEntryInput {
            inner: Arc::clone(&self.inner),
            frame,
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct SarEntryInput {
    inner: Arc<InputInner>,
    frame: usize,
}

impl InputTarget for SarEntryInput {
    fn target(&self) -> Result<Entry> {
        Ok(self.inner.frames[self.frame].entry.clone())
    }

    fn open(&self, _peer: Option<&OutputSocket>) -> Result<Box<dyn Read + Send>> {
        let data = self.inner.decoded(&self.inner.frames[self.frame])?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn open_raw(&self) -> Option<Result<RawEntry>> {
        let frame = &self.inner.frames[self.frame];
        Some(self.inner.stored(frame).map(|payload| RawEntry {
            entry: frame.entry.clone(),
            codec: self.inner.codec.clone(),
            payload,
            crc: frame.crc,
        }))
    }
}

struct SarOutput {
    mount: String,
    sink: Box<dyn Write + Send>,
    codec: String,
    key: Option<EncryptionKey>,
    compression: CompressionConfig,
    head: Option<String>,
    current: Option<(Entry, Vec<u8>)>,
    written: Vec<String>,
}

impl SarOutput {
    fn frame(&mut self, entry: Entry, payload: &[u8], crc: u32) -> Result<()> {
        let header = FrameHeader {
            entry,
            stored: payload.len() as u64,
            crc,
        };
        let raw = serde_json::to_vec(&header)?;
        self.sink.write_all(&(raw.len() as u32).to_le_bytes())?;
        self.sink.write_all(&raw)?;
        self.sink.write_all(payload)?;
        self.written.push(header.entry.name().to_string());
        Ok(())
    }
}

impl OutputService for SarOutput {
    fn begin(&mut self, entry: Entry) -> Result<()> {
        if let Some((open, _)) = &self.current {
            return Err(FsError::corrupt(
                &self.mount,
                format!("{:?} is still open", open.name()),
            ));
        }
        self.current = Some((entry, Vec::new()));
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        match &mut self.current {
            Some((_, data)) => {
                data.extend_from_slice(buf);
                Ok(())
            }
            None => Err(FsError::corrupt(&self.mount, "write without open entry")),
        }
    }

    fn end(&mut self) -> Result<Entry> {
        let (entry, data) = self
            .current
            .take()
            .ok_or_else(|| FsError::corrupt(&self.mount, "no open entry"))?;

        let (mut payload, method) = if entry.is_directory() {
            (Vec::new(), CompressionMethod::None)
        } else if self.head.as_deref() == Some(entry.name()) {
            (data.clone(), CompressionMethod::None)
        } else {
            self.compression.encode(&data)?
        };
        let encrypted = match &self.key {
            Some(key) if !entry.is_directory() => {
                payload = encryption::encrypt(&payload, key)?;
                true
            }
            _ => false,
        };

        let entry = entry
            .with_size(Some(data.len() as u64))
            .with_method(method)
            .with_encrypted(encrypted);
        let crc = crc32fast::hash(&payload);
        self.frame(entry.clone(), &payload, crc)?;
        Ok(entry)
    }

    fn accepts_raw(&self, raw: &RawEntry) -> bool {
        self.current.is_none()
            && raw.codec == self.codec
            && self.head.as_deref() != Some(raw.entry.name())
    }

    fn write_raw(&mut self, entry: Entry, raw: &RawEntry) -> Result<Entry> {
        if !self.accepts_raw(raw) {
            return Err(FsError::corrupt(&self.mount, "incompatible raw payload"));
        }
        let entry = entry
            .with_size(raw.entry.size())
            .with_method(raw.entry.method())
            .with_encrypted(raw.entry.is_encrypted());
        self.frame(entry.clone(), &raw.payload, raw.crc)?;
        Ok(entry)
    }

    fn discard(&mut self) {
        self.current = None;
    }

    fn written(&self) -> Vec<String> {
        self.written.clone()
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        if let Some((open, _)) = &self.current {
            return Err(FsError::corrupt(
                &self.mount,
                format!("{:?} was never finished", open.name()),
            ));
        }
        self.sink.write_all(&0u32.to_le_bytes())?;
        self.sink.flush()?;
        debug!("Finished {} with {} entries", self.mount, self.written.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::{NoKeys, StaticKeys};
    use crate::entry::Access;

    /// `Write` handle over a shared vector so tests can inspect the output
    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn write_container(
        driver: &SarDriver,
        keys: &dyn KeyProvider,
        entries: &[(&str, &[u8])],
    ) -> Vec<u8> {
        let sink = Shared::default();
        let mut out = driver
            .new_output("t.sar", Box::new(sink.clone()), None, keys)
            .unwrap();
        for (name, data) in entries {
            out.begin(driver.factory().new_entry(name, EntryType::File, None))
                .unwrap();
            out.write(data).unwrap();
            out.end().unwrap();
        }
        out.finish().unwrap();
        let bytes = sink.0.lock().clone();
        bytes
    }

    fn read_entry(input: &dyn InputService, name: &str) -> Vec<u8> {
        let mut data = Vec::new();
        input
            .input(name)
            .unwrap()
            .open(None)
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        data
    }

    #[test]
    fn test_write_then_read() {
        let driver = SarDriver::new();
        let big = b"compressible ".repeat(200);
        let bytes = write_container(&driver, &NoKeys, &[("a.txt", b"alpha"), ("dir/b", &big)]);
        assert_eq!(&bytes[..4], MAGIC);

        let input = driver
            .new_input("t.sar", Box::new(Cursor::new(bytes)), &NoKeys)
            .unwrap();
        let names: Vec<_> = input.entries().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["a.txt", "dir/b"]);

        let b = input.entry("dir/b").unwrap();
        assert_eq!(b.size(), Some(big.len() as u64));
        assert_eq!(b.method(), CompressionMethod::Lz4);
        assert!(b.time(Access::WRITE).is_some());
        assert_eq!(read_entry(input.as_ref(), "a.txt"), b"alpha");
        assert_eq!(read_entry(input.as_ref(), "dir/b"), big);
    }

    #[test]
    fn test_head_is_stored_uncompressed() {
        let driver = SarDriver::with_head("mimetype");
        assert_eq!(driver.id(), "sar-mimetype");
        let long = b"application/x-long-type ".repeat(100);
        let bytes = write_container(&driver, &NoKeys, &[("mimetype", &long)]);
        let input = driver
            .new_input("t.sar", Box::new(Cursor::new(bytes)), &NoKeys)
            .unwrap();
        assert_eq!(input.entry("mimetype").unwrap().method(), CompressionMethod::None);
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let driver = SarDriver::new();
        let mut bytes = write_container(&driver, &NoKeys, &[("f", b"payload")]);
        // Flip the last payload byte (before the 4-byte terminator)
        let at = bytes.len() - 5;
        bytes[at] ^= 0xff;

        let input = driver
            .new_input("t.sar", Box::new(Cursor::new(bytes)), &NoKeys)
            .unwrap();
        let err = input.input("f").unwrap().open(None).err().unwrap();
        assert!(matches!(err, FsError::Corrupt { .. }));
    }

    #[test]
    fn test_truncated_container_is_corrupt() {
        let driver = SarDriver::new();
        let bytes = write_container(&driver, &NoKeys, &[("f", b"payload")]);
        for cut in [0, 3, 5, bytes.len() - 1] {
            let result = driver.new_input(
                "t.sar",
                Box::new(Cursor::new(bytes[..cut].to_vec())),
                &NoKeys,
            );
            assert!(matches!(result, Err(FsError::Corrupt { .. })), "cut at {}", cut);
        }
    }

    #[test]
    fn test_encrypted_container_needs_secret() {
        let driver = SarDriver::new().encrypted();
        let keys = StaticKeys::with_default("hunter2");
        let bytes = write_container(&driver, &keys, &[("secret.txt", b"classified")]);

        let err = driver
            .new_input("t.sar", Box::new(Cursor::new(bytes.clone())), &NoKeys)
            .err()
            .unwrap();
        assert!(matches!(err, FsError::AuthCancelled(_)));

        let input = driver
            .new_input("t.sar", Box::new(Cursor::new(bytes.clone())), &keys)
            .unwrap();
        assert!(input.entry("secret.txt").unwrap().is_encrypted());
        assert_eq!(read_entry(input.as_ref(), "secret.txt"), b"classified");

        let wrong = StaticKeys::with_default("wrong");
        let input = driver
            .new_input("t.sar", Box::new(Cursor::new(bytes)), &wrong)
            .unwrap();
        assert!(input.input("secret.txt").unwrap().open(None).is_err());
    }

    #[test]
    fn test_raw_copy_between_matching_codecs() {
        let driver = SarDriver::new();
        let bytes = write_container(&driver, &NoKeys, &[("f", b"raw bytes")]);
        let input = driver
            .new_input("t.sar", Box::new(Cursor::new(bytes)), &NoKeys)
            .unwrap();
        let raw = input.input("f").unwrap().open_raw().unwrap().unwrap();

        let sink = Shared::default();
        let mut out = driver
            .new_output("u.sar", Box::new(sink.clone()), Some(input.as_ref()), &NoKeys)
            .unwrap();
        assert!(out.accepts_raw(&raw));
        out.write_raw(Entry::new("g", EntryType::File), &raw).unwrap();
        out.finish().unwrap();

        let copy = driver
            .new_input("u.sar", Box::new(Cursor::new(sink.0.lock().clone())), &NoKeys)
            .unwrap();
        assert_eq!(read_entry(copy.as_ref(), "g"), b"raw bytes");
    }

    #[test]
    fn test_raw_copy_refused_across_keys() {
        let plain = SarDriver::new();
        let bytes = write_container(&plain, &NoKeys, &[("f", b"x")]);
        let input = plain
            .new_input("t.sar", Box::new(Cursor::new(bytes)), &NoKeys)
            .unwrap();
        let raw = input.input("f").unwrap().open_raw().unwrap().unwrap();

        let keys = StaticKeys::with_default("k");
        let out = SarDriver::new()
            .encrypted()
            .new_output("u.sar", Box::new(Shared::default()), None, &keys)
            .unwrap();
        assert!(!out.accepts_raw(&raw));
    }

    #[test]
    fn test_decode_raw_needs_matching_key() {
        let keys = StaticKeys::with_default("k");
        let driver = SarDriver::new().encrypted();
        let bytes = write_container(&driver, &keys, &[("f", b"sealed bytes")]);
        let input = driver
            .new_input("t.sar", Box::new(Cursor::new(bytes)), &keys)
            .unwrap();
        let raw = input.input("f").unwrap().open_raw().unwrap().unwrap();

        assert_eq!(driver.decode_raw(&raw, Some(input.as_ref())).unwrap(), b"sealed bytes");
        assert!(driver.decode_raw(&raw, None).is_err());

        let plain = SarDriver::new();
        let bytes = write_container(&plain, &NoKeys, &[("g", b"plain bytes")]);
        let input = plain
            .new_input("p.sar", Box::new(Cursor::new(bytes)), &NoKeys)
            .unwrap();
        let raw = input.input("g").unwrap().open_raw().unwrap().unwrap();
        assert_eq!(plain.decode_raw(&raw, None).unwrap(), b"plain bytes");
    }
}
