/// Failures surfaced to the syscall layer.
///
/// Out-of-range cache offsets, lock misuse, and similar programming errors
/// are not represented here; those panic at the offending call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no such file or directory")]
    NotFound,
    #[error("name already in use")]
    AlreadyExists,
    #[error("name is empty or too long")]
    BadName,
    #[error("invalid path")]
    BadPath,
    #[error("not a directory")]
    NotADirectory,
    #[error("offset beyond end of file")]
    OffsetOutOfRange,
    #[error("no free sectors")]
    NoSpace,
    #[error("file too large")]
    FileTooLarge,
    #[error("no device registered for role")]
    NoDevice,
}
