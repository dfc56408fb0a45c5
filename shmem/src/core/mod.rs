use std::ffi::CString;
use std::io;
use std::ptr::NonNull;

use serde_derive::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::debug;

use crate::errors::{Result, ShmemLibError};

pub(crate) mod layout;

pub use self::layout::Layout;
use self::layout::Ring;

pub const DEFAULT_QUEUE_NAME: &str = "/my_queue_example_2";
pub const DEFAULT_MAX_ELEMENTS: usize = 10;
pub const DEFAULT_ELEMENT_SIZE: usize = 10 * 1024 * 1024;

#[cfg(target_os = "macos")]
const MAX_NAME_LEN: usize = 31;
#[cfg(not(target_os = "macos"))]
const MAX_NAME_LEN: usize = 255;

/// Checks a queue name against the POSIX shared memory naming rules.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason| {
        Err(ShmemLibError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };
    if name.len() < 2 {
        return invalid("must be a '/' followed by at least one character");
    }
    if !name.starts_with('/') {
        return invalid("must start with '/'");
    }
    if name[1..].contains('/') {
        return invalid("must not contain '/' after the leading one");
    }
    if name.contains('\0') {
        return invalid("must not contain NUL");
    }
    if name.chars().any(char::is_whitespace) {
        return invalid("must not contain whitespace");
    }
    if name.len() > MAX_NAME_LEN {
        return invalid("too long for this platform");
    }
    Ok(())
}

/// A process-local mapping of a named segment.
///
/// Dropping a `Segment` unmaps it but never unlinks the name.
pub(crate) struct Segment {
    shmem: Shmem,
    name: String,
}

impl Segment {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn base(&self) -> Result<NonNull<u8>> {
        NonNull::new(self.shmem.as_ptr()).ok_or_else(|| ShmemLibError::SegmentUnavailable {
            name: self.name.clone(),
        })
    }

    /// Creates the named object exclusively and writes a fresh header.
    pub fn create(name: &str, layout: Layout) -> Result<(Segment, Ring)> {
        validate_name(name)?;
        let mut shmem = match ShmemConf::new().size(layout.total_size).os_id(name).create() {
            Ok(v) => v,
            Err(ShmemError::MappingIdExists) => {
                return Err(ShmemLibError::AlreadyExists {
                    name: name.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        // Owned until the header is in place, so a failure unlinks the name.
        let base = match NonNull::new(shmem.as_ptr()) {
            Some(p) => p,
            None => {
                return Err(ShmemLibError::SegmentUnavailable {
                    name: name.to_string(),
                })
            }
        };
        let ring = unsafe { Ring::init(base, layout) };
        shmem.set_owner(false);
        debug!(
            name,
            max_elements = layout.max_elements,
            element_size = layout.element_size,
            bytes = layout.total_size,
            "created queue segment"
        );
        Ok((
            Segment {
                shmem,
                name: name.to_string(),
            },
            ring,
        ))
    }

    /// Maps an existing object and validates its header.
    pub fn open(name: &str) -> Result<(Segment, Ring)> {
        validate_name(name)?;
        let segment = Segment::map_existing(name)?;
        let ring = unsafe { Ring::attach(name, segment.base()?, segment.shmem.len())? };
        debug!(
            name,
            max_elements = ring.layout().max_elements,
            element_size = ring.layout().element_size,
            "opened queue segment"
        );
        Ok((segment, ring))
    }

    fn map_existing(name: &str) -> Result<Segment> {
        match ShmemConf::new().os_id(name).open() {
            Ok(shmem) => Ok(Segment {
                shmem,
                name: name.to_string(),
            }),
            // EINVAL: the creator has not sized the object yet, so there is
            // nothing to map.
            Err(ShmemError::MapOpenFailed(code))
                if code == libc::ENOENT as u32 || code == libc::EINVAL as u32 =>
            {
                Err(ShmemLibError::NotFound {
                    name: name.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Unlinks the named object and flags it as destroyed for every
    /// process still mapping it. A missing name is not an error.
    ///
    /// The name is unlinked even when the object cannot be mapped, e.g.
    /// when its creator died before sizing it.
    pub fn destroy(name: &str) -> Result<()> {
        validate_name(name)?;
        let existing = match Segment::map_existing(name) {
            Ok(s) => Some(s),
            Err(e) => {
                debug!(name, error = %e, "destroy: object not mapped");
                None
            }
        };
        if !unlink(name)? {
            debug!(name, "destroy: no such queue");
            return Ok(());
        }
        if let Some(existing) = existing {
            let base = existing.base()?;
            // Objects without our header are only unlinked.
            if !unsafe { Ring::flag_destroyed(base, existing.shmem.len()) } {
                debug!(name, "destroy: object has no queue header to flag");
            }
        }
        debug!(name, "destroyed queue segment");
        Ok(())
    }
}

/// Removes the name. Returns `false` if it was already gone.
fn unlink(name: &str) -> Result<bool> {
    let c_name = CString::new(name).map_err(|_| ShmemLibError::InvalidName {
        name: name.to_string(),
        reason: "must not contain NUL",
    })?;
    if unsafe { libc::shm_unlink(c_name.as_ptr()) } == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(false);
        }
        return Err(err.into());
    }
    Ok(true)
}

/// Queue parameters shared by the publisher and subscriber drivers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    pub name: String,
    pub max_elements: usize,
    pub element_size: usize,
    /// Sleep between empty polls on the consumer side.
    pub poll_interval_us: u64,
    /// Sleep between pushes on the producer side.
    pub publish_interval_ms: u64,
    /// Bytes at the front of each payload reserved for the text frame header.
    pub header_size: usize,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        ShmemConfig {
            name: DEFAULT_QUEUE_NAME.to_string(),
            max_elements: DEFAULT_MAX_ELEMENTS,
            element_size: DEFAULT_ELEMENT_SIZE,
            poll_interval_us: 100,
            publish_interval_ms: 1,
            header_size: crate::frame::DEFAULT_HEADER_SIZE,
        }
    }
}

impl ShmemConfig {
    pub fn builder() -> ShmemConfigBuilder {
        ShmemConfigBuilder {
            config: ShmemConfig::default(),
        }
    }

    /// Applies the same checks `SMQueue::create` would.
    pub fn validate(&self) -> Result<Layout> {
        validate_name(&self.name)?;
        let layout = Layout::new(self.max_elements, self.element_size)?;
        if self.header_size > self.element_size {
            return Err(ShmemLibError::Config(format!(
                "header_size {} exceeds element_size {}",
                self.header_size, self.element_size
            )));
        }
        Ok(layout)
    }
}

pub struct ShmemConfigBuilder {
    config: ShmemConfig,
}

impl ShmemConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn max_elements(mut self, max_elements: usize) -> Self {
        self.config.max_elements = max_elements;
        self
    }

    pub fn element_size(mut self, element_size: usize) -> Self {
        self.config.element_size = element_size;
        self
    }

    pub fn poll_interval_us(mut self, poll_interval_us: u64) -> Self {
        self.config.poll_interval_us = poll_interval_us;
        self
    }

    pub fn publish_interval_ms(mut self, publish_interval_ms: u64) -> Self {
        self.config.publish_interval_ms = publish_interval_ms;
        self
    }

    pub fn header_size(mut self, header_size: usize) -> Self {
        self.config.header_size = header_size;
        self
    }

    pub fn build(self) -> Result<ShmemConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
