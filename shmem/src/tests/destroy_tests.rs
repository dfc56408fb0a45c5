use std::error::Error;
use std::ffi::CString;
use std::io;
use std::ptr::NonNull;

use shared_memory::ShmemConf;

use super::QueueGuard;
use crate::core::layout::{Layout, Ring};
use crate::{SMQueue, ShmemLibError};

/// Leaves a bare object of `size` bytes under `name`, as a creator that
/// stopped before writing the header would.
fn leave_bare_object(name: &str, size: usize) -> io::Result<()> {
    let c_name = CString::new(name)?;
    let flags = libc::O_CREAT | libc::O_EXCL | libc::O_RDWR;
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o600) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    let sized = unsafe { libc::ftruncate(fd, size as libc::off_t) };
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if sized == -1 {
        return Err(err);
    }
    Ok(())
}

fn is_unavailable<T: std::fmt::Debug>(result: Result<T, ShmemLibError>) -> bool {
    matches!(result, Err(ShmemLibError::SegmentUnavailable { .. }))
}

#[test]
fn destroyed_segment_fails_fast_on_every_handle() -> Result<(), Box<dyn Error>> {
    let guard = QueueGuard::new("gone");
    let mut producer = SMQueue::create(guard.name(), 4, 32)?;
    let mut consumer = SMQueue::open(guard.name())?;
    producer.push(b"before destroy")?;

    SMQueue::destroy(guard.name())?;

    assert!(producer.is_destroyed());
    assert!(consumer.is_destroyed());
    assert!(is_unavailable(producer.push(b"after destroy")));
    assert!(is_unavailable(consumer.pop_vec()));
    let mut buf = [0u8; 32];
    assert!(is_unavailable(consumer.try_pop(&mut buf)));

    // Introspection keeps answering from the still-mapped header.
    assert_eq!(consumer.max_elements(), 4);
    assert_eq!(consumer.element_size(), 32);
    assert_eq!(consumer.len(), 1);
    Ok(())
}

#[test]
fn recreate_after_destroy_is_a_fresh_queue() -> Result<(), Box<dyn Error>> {
    let guard = QueueGuard::new("again");
    let mut old = SMQueue::create(guard.name(), 2, 16)?;
    old.push(b"old")?;

    SMQueue::destroy(guard.name())?;
    let mut fresh = SMQueue::create(guard.name(), 3, 8)?;
    let mut reader = SMQueue::open(guard.name())?;

    assert_eq!(reader.max_elements(), 3);
    assert_eq!(reader.element_size(), 8);
    assert_eq!(reader.pop_vec()?, None);
    fresh.push(b"new")?;
    assert_eq!(reader.pop_vec()?, Some(b"new".to_vec()));

    // The old mapping stays flagged even though the name lives again.
    assert!(is_unavailable(old.push(b"old again")));
    assert!(!fresh.is_destroyed());
    Ok(())
}

#[test]
fn destroy_then_create_idiom() -> Result<(), Box<dyn Error>> {
    let guard = QueueGuard::new("idiom");
    for round in 0..3 {
        SMQueue::destroy(guard.name())?;
        let mut queue = SMQueue::create(guard.name(), 2, 8)?;
        assert!(queue.push(&[round])?);
        assert_eq!(queue.pop_vec()?, Some(vec![round]));
    }
    Ok(())
}

#[test]
fn destroy_unlinks_an_object_its_creator_never_sized() -> Result<(), Box<dyn Error>> {
    let guard = QueueGuard::new("unsized");
    leave_bare_object(guard.name(), 0)?;
    assert!(matches!(
        SMQueue::open(guard.name()),
        Err(ShmemLibError::NotFound { .. })
    ));
    assert!(matches!(
        SMQueue::create(guard.name(), 4, 16),
        Err(ShmemLibError::AlreadyExists { .. })
    ));

    SMQueue::destroy(guard.name())?;
    let mut queue = SMQueue::create(guard.name(), 4, 16)?;
    assert!(queue.push(b"recovered")?);
    assert_eq!(queue.pop_vec()?, Some(b"recovered".to_vec()));
    Ok(())
}

#[test]
fn destroy_flags_a_segment_still_being_initialised() -> Result<(), Box<dyn Error>> {
    let guard = QueueGuard::new("halfway");
    let layout = Layout::new(2, 16)?;
    leave_bare_object(guard.name(), layout.total_size)?;
    let creator = ShmemConf::new().os_id(guard.name()).open()?;

    SMQueue::destroy(guard.name())?;

    // The creator finishes its header after the name is already gone.
    let base = NonNull::new(creator.as_ptr()).ok_or("empty mapping")?;
    let ring = unsafe { Ring::init(base, layout) };
    assert!(ring.is_destroyed());
    assert!(matches!(
        SMQueue::open(guard.name()),
        Err(ShmemLibError::NotFound { .. })
    ));
    Ok(())
}
